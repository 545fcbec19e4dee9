use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::db::{self, DocumentStore, set_fields};
use crate::dispatch::Dispatcher;
use crate::domain::{Collection, JobId, Operation};
use crate::error::KiraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Complete,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Complete => write!(f, "complete"),
            JobState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub state: JobState,
    #[serde(default)]
    pub stage: Option<String>,
    pub progress: f64,
    pub timestamp: DateTime<Utc>,
}

/// Persisted context of the failure that stopped a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    #[serde(default)]
    pub stage: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl JobFailure {
    pub fn from_error(stage: Option<&str>, err: &KiraError) -> Self {
        let mut details = vec![format!("{err:?}")];
        details.extend(err.source_chain());
        Self {
            stage: stage.map(str::to_string),
            message: err.to_string(),
            details,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(rename = "_id")]
    pub id: JobId,
    pub task: String,
    #[serde(default)]
    pub args: Value,
    pub stages: Vec<String>,
    /// Index of the next stage to run.
    #[serde(default)]
    pub stage_index: usize,
    pub state: JobState,
    #[serde(default)]
    pub status: Vec<StatusEntry>,
    #[serde(default)]
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
}

impl JobDocument {
    pub fn progress(&self) -> f64 {
        progress(self.stage_index, self.stages.len())
    }
}

fn progress(done: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    }
}

/// Persistence for job records. Each write is a single-document update
/// followed by a `jobs` notification.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<dyn DocumentStore>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl JobStore {
    pub fn new(db: Arc<dyn DocumentStore>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { db, dispatcher }
    }

    pub fn create(
        &self,
        task: &str,
        args: Value,
        stages: &[&str],
    ) -> Result<JobDocument, KiraError> {
        let now = Utc::now();
        let job = JobDocument {
            id: JobId::generate(),
            task: task.to_string(),
            args,
            stages: stages.iter().map(|name| name.to_string()).collect(),
            stage_index: 0,
            state: JobState::Pending,
            status: vec![StatusEntry {
                state: JobState::Pending,
                stage: None,
                progress: 0.0,
                timestamp: now,
            }],
            error: None,
            created_at: now,
        };
        self.db.insert_one(Collection::Jobs, db::encode(&job)?)?;
        self.dispatcher
            .dispatch(Collection::Jobs, Operation::Insert, vec![job.id.to_string()]);
        Ok(job)
    }

    pub fn load(&self, id: &JobId) -> Result<JobDocument, KiraError> {
        db::get(self.db.as_ref(), Collection::Jobs, id.as_str())?
            .ok_or_else(|| KiraError::not_found(Collection::Jobs.as_str(), id.as_str()))
    }

    pub fn find_all(&self) -> Result<Vec<JobDocument>, KiraError> {
        self.db
            .find(Collection::Jobs, &db::Filter::new())?
            .into_iter()
            .map(|value| db::decode(Collection::Jobs, value))
            .collect()
    }

    pub fn mark_running(&self, id: &JobId) -> Result<JobDocument, KiraError> {
        let mut job = self.load(id)?;
        job.state = JobState::Running;
        job.status.push(entry(JobState::Running, None, job.progress()));
        self.write(
            &job,
            [
                ("state", json!(job.state)),
                ("status", db::encode(&job.status)?),
            ],
        )?;
        Ok(job)
    }

    pub fn record_stage_start(&self, id: &JobId, stage: &str) -> Result<(), KiraError> {
        let mut job = self.load(id)?;
        job.status
            .push(entry(JobState::Running, Some(stage), job.progress()));
        self.write(&job, [("status", db::encode(&job.status)?)])
    }

    /// Persists that every stage before `next_index` has completed.
    pub fn record_checkpoint(
        &self,
        id: &JobId,
        next_index: usize,
        stage: &str,
    ) -> Result<(), KiraError> {
        let mut job = self.load(id)?;
        job.stage_index = next_index;
        job.status
            .push(entry(JobState::Running, Some(stage), job.progress()));
        self.write(
            &job,
            [
                ("stage_index", json!(next_index)),
                ("status", db::encode(&job.status)?),
            ],
        )
    }

    pub fn mark_complete(&self, id: &JobId) -> Result<JobDocument, KiraError> {
        let mut job = self.load(id)?;
        job.state = JobState::Complete;
        job.status.push(entry(JobState::Complete, None, 1.0));
        self.write(
            &job,
            [
                ("state", json!(job.state)),
                ("status", db::encode(&job.status)?),
            ],
        )?;
        Ok(job)
    }

    pub fn mark_error(&self, id: &JobId, failure: JobFailure) -> Result<JobDocument, KiraError> {
        let mut job = self.load(id)?;
        job.state = JobState::Error;
        job.status.push(entry(
            JobState::Error,
            failure.stage.as_deref(),
            job.progress(),
        ));
        job.error = Some(failure);
        self.write(
            &job,
            [
                ("state", json!(job.state)),
                ("status", db::encode(&job.status)?),
                ("error", db::encode(&job.error)?),
            ],
        )?;
        Ok(job)
    }

    /// Marks a job as failed from outside its execution. The running
    /// pipeline notices before its next stage.
    pub fn cancel(&self, id: &JobId) -> Result<JobDocument, KiraError> {
        let job = self.load(id)?;
        if job.state.is_terminal() {
            return Err(KiraError::JobFinished {
                id: id.to_string(),
                state: job.state.to_string(),
            });
        }
        self.mark_error(
            id,
            JobFailure {
                stage: job.stages.get(job.stage_index).cloned(),
                message: "cancelled".to_string(),
                details: Vec::new(),
            },
        )
    }

    fn write<const N: usize>(
        &self,
        job: &JobDocument,
        fields: [(&str, Value); N],
    ) -> Result<(), KiraError> {
        let matched = self
            .db
            .update_one(Collection::Jobs, job.id.as_str(), set_fields(fields))?;
        if !matched {
            warn!(job_id = %job.id, "job document vanished during update");
            return Err(KiraError::not_found(Collection::Jobs.as_str(), job.id.as_str()));
        }
        self.dispatcher
            .dispatch(Collection::Jobs, Operation::Update, vec![job.id.to_string()]);
        Ok(())
    }
}

fn entry(state: JobState, stage: Option<&str>, progress: f64) -> StatusEntry {
    StatusEntry {
        state,
        stage: stage.map(str::to_string),
        progress,
        timestamp: Utc::now(),
    }
}
