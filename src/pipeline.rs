//! Checkpointed stage execution.
//!
//! A workflow declares its stages as a static table of named functions. The
//! runner executes them in order for one job, persisting `stage_index` after
//! each stage. A restarted job resumes at the persisted index; the
//! intermediate values of the earlier attempt are gone, so stages must be
//! safe to re-run from what is on disk and in the document store.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::Utc;

use serde_json::Value;
use tracing::{error, info, info_span, warn};

use crate::caches::CacheManager;
use crate::config::Settings;
use crate::db::DocumentStore;
use crate::dispatch::Dispatcher;
use crate::domain::{Collection, JobId, Operation};
use crate::error::KiraError;
use crate::jobs::{JobDocument, JobFailure, JobState, JobStore};
use crate::process::{ProcessRunner, SlotPool};
use crate::store::{self, ArtifactStore};

pub const CHECK_DB_STAGE: &str = "check_db";

/// Shared capabilities handed to every stage of a job.
pub struct JobContext {
    pub job_id: JobId,
    pub settings: Arc<Settings>,
    pub store: ArtifactStore,
    pub db: Arc<dyn DocumentStore>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub runner: Arc<dyn ProcessRunner>,
    pub slots: Arc<SlotPool>,
}

impl JobContext {
    pub fn dispatch(&self, collection: Collection, operation: Operation, ids: Vec<String>) {
        self.dispatcher.dispatch(collection, operation, ids);
    }

    pub fn caches(&self) -> CacheManager<'_> {
        CacheManager::new(self.db.as_ref(), self.dispatcher.as_ref(), &self.store)
    }
}

pub type StageFn<W> = fn(
    &JobContext,
    &<W as Workflow>::Params,
    &mut <W as Workflow>::Intermediate,
) -> Result<(), KiraError>;

pub struct Stage<W: Workflow> {
    pub name: &'static str,
    pub run: StageFn<W>,
}

pub trait Workflow: Send + Sync + Sized + 'static {
    /// Values fixed before the first stage runs.
    type Params;
    /// Values passed forward between stages of one attempt.
    type Intermediate: Default;

    const TASK: &'static str;

    fn stages(&self) -> &'static [Stage<Self>];

    /// Loads and validates everything the stages need. Runs before any
    /// stage and must not have side effects.
    fn check_db(&self, ctx: &JobContext, args: &Value) -> Result<Self::Params, KiraError>;

    fn stage_names(&self) -> Vec<&'static str> {
        self.stages().iter().map(|stage| stage.name).collect()
    }
}

/// Object-safe view of a workflow, for lookup by task name.
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(&self, runner: &JobRunner, job_id: &JobId) -> Result<JobDocument, KiraError>;
}

#[cfg(test)]
impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name()).finish()
    }
}

impl<W: Workflow> Task for W {
    fn name(&self) -> &'static str {
        W::TASK
    }

    fn execute(&self, runner: &JobRunner, job_id: &JobId) -> Result<JobDocument, KiraError> {
        runner.run(job_id, self)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<&'static str, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: Arc<dyn Task>) {
        self.tasks.insert(task.name(), task);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Task>, KiraError> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| KiraError::UnknownTask(name.to_string()))
    }
}

pub struct JobRunner {
    settings: Arc<Settings>,
    store: ArtifactStore,
    db: Arc<dyn DocumentStore>,
    dispatcher: Arc<dyn Dispatcher>,
    runner: Arc<dyn ProcessRunner>,
    slots: Arc<SlotPool>,
    jobs: JobStore,
}

impl JobRunner {
    pub fn new(
        settings: Settings,
        db: Arc<dyn DocumentStore>,
        dispatcher: Arc<dyn Dispatcher>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let slots = Arc::new(SlotPool::new(settings.slots));
        let store = ArtifactStore::new(settings.data_path.clone());
        let jobs = JobStore::new(Arc::clone(&db), Arc::clone(&dispatcher));
        Self {
            settings: Arc::new(settings),
            store,
            db,
            dispatcher,
            runner,
            slots,
            jobs,
        }
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Records a new pending job for `workflow`.
    pub fn enqueue<W: Workflow>(
        &self,
        workflow: &W,
        args: Value,
    ) -> Result<JobDocument, KiraError> {
        let job = self.jobs.create(W::TASK, args, &workflow.stage_names())?;
        info!(job_id = %job.id, task = W::TASK, "job enqueued");
        Ok(job)
    }

    /// Runs the job through the registered workflow for its task.
    pub fn run_registered(
        &self,
        registry: &TaskRegistry,
        job_id: &JobId,
    ) -> Result<JobDocument, KiraError> {
        let job = self.jobs.load(job_id)?;
        registry.get(&job.task)?.execute(self, job_id)
    }

    /// Runs or resumes a job. A stage failure is persisted on the job and
    /// also returned.
    pub fn run<W: Workflow>(&self, job_id: &JobId, workflow: &W) -> Result<JobDocument, KiraError> {
        let _claim = self.claim(job_id)?;
        let span = info_span!("job", job_id = %job_id, task = W::TASK);
        let _entered = span.enter();

        let job = self.jobs.load(job_id)?;
        if job.task != W::TASK {
            return Err(KiraError::Validation(format!(
                "job {job_id} is a {} job, not {}",
                job.task,
                W::TASK
            )));
        }
        if job.state.is_terminal() {
            return Err(KiraError::JobFinished {
                id: job_id.to_string(),
                state: job.state.to_string(),
            });
        }
        let stages = workflow.stages();
        let names = workflow.stage_names();
        if job.stages != names {
            return Err(KiraError::Validation(format!(
                "job {job_id} was created with stages {:?}, workflow has {names:?}",
                job.stages
            )));
        }
        if job.stage_index > 0 {
            info!(stage_index = job.stage_index, "resuming job");
        }

        self.jobs.mark_running(job_id)?;
        let ctx = self.context(job_id);

        let params = match workflow.check_db(&ctx, &job.args) {
            Ok(params) => params,
            Err(err) => return Err(self.fail(job_id, CHECK_DB_STAGE, err)),
        };

        let mut intermediate = W::Intermediate::default();
        for (index, stage) in stages.iter().enumerate().skip(job.stage_index) {
            self.ensure_not_aborted(job_id, stage.name)?;

            if let Err(err) = self.jobs.record_stage_start(job_id, stage.name) {
                return Err(self.fail(job_id, stage.name, err));
            }
            info!(stage = stage.name, index, "stage started");
            if let Err(err) = (stage.run)(&ctx, &params, &mut intermediate) {
                return Err(self.fail(job_id, stage.name, err));
            }
            if let Err(err) = self.jobs.record_checkpoint(job_id, index + 1, stage.name) {
                return Err(self.fail(job_id, stage.name, err));
            }
            info!(stage = stage.name, "stage complete");
        }

        self.ensure_not_aborted(job_id, "complete")?;
        let job = self.jobs.mark_complete(job_id)?;
        info!("job complete");
        Ok(job)
    }

    fn context(&self, job_id: &JobId) -> JobContext {
        JobContext {
            job_id: job_id.clone(),
            settings: Arc::clone(&self.settings),
            store: self.store.clone(),
            db: Arc::clone(&self.db),
            dispatcher: Arc::clone(&self.dispatcher),
            runner: Arc::clone(&self.runner),
            slots: Arc::clone(&self.slots),
        }
    }

    fn fail(&self, job_id: &JobId, stage: &str, err: KiraError) -> KiraError {
        error!(stage, error = %err, "stage failed");
        let failure = JobFailure::from_error(Some(stage), &err);
        if let Err(write_err) = self.jobs.mark_error(job_id, failure) {
            error!(error = %write_err, "failed to persist job error");
        }
        err
    }

    fn ensure_not_aborted(&self, job_id: &JobId, next: &str) -> Result<(), KiraError> {
        if self.jobs.load(job_id)?.state == JobState::Error {
            warn!(next, "job was aborted; halting");
            return Err(KiraError::JobAborted(job_id.to_string()));
        }
        Ok(())
    }

    /// Claims the job through an exclusively created lock file, so a second
    /// runner over the same data directory is refused even from another
    /// process. A lock left by a killed process has to be removed by hand.
    fn claim(&self, job_id: &JobId) -> Result<RunClaim, KiraError> {
        store::ensure_dir(&self.store.locks_dir())?;
        let lock = self.store.job_lock_path(job_id);
        let opened = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock.as_std_path());
        let mut file = match opened {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(KiraError::JobAlreadyRunning {
                    id: job_id.to_string(),
                    lock,
                });
            }
            Err(err) => return Err(KiraError::fs(format!("create {lock}: {err}"))),
        };
        let claim = RunClaim { lock };
        writeln!(
            file,
            "pid={} claimed_at={}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )
        .map_err(|err| KiraError::fs(format!("write {}: {err}", claim.lock)))?;
        Ok(claim)
    }
}

#[derive(Debug)]
struct RunClaim {
    lock: Utf8PathBuf,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(self.lock.as_std_path()) {
            warn!(lock = %self.lock, error = %err, "failed to release job claim");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;
    use serde_json::json;

    use super::*;
    use crate::db::MemoryDocumentStore;
    use crate::dispatch::NullDispatcher;
    use crate::process::SystemProcessRunner;

    static LOG: StdMutex<Vec<String>> = StdMutex::new(Vec::new());

    fn log(entry: &str) {
        LOG.lock().unwrap().push(entry.to_string());
    }

    #[derive(Default)]
    struct Counter {
        value: usize,
    }

    struct Demo;

    fn stage_a(ctx: &JobContext, params: &String, inter: &mut Counter) -> Result<(), KiraError> {
        log(&format!("{}:a:{params}", ctx.job_id));
        inter.value += 1;
        Ok(())
    }

    fn stage_b(ctx: &JobContext, params: &String, inter: &mut Counter) -> Result<(), KiraError> {
        log(&format!("{}:b:{}", ctx.job_id, inter.value));
        if params == "fail" {
            return Err(KiraError::tool("demo", "boom"));
        }
        Ok(())
    }

    static CANCEL_IN_C: StdMutex<Vec<JobId>> = StdMutex::new(Vec::new());

    fn stage_c(ctx: &JobContext, _params: &String, _inter: &mut Counter) -> Result<(), KiraError> {
        log(&format!("{}:c", ctx.job_id));
        if CANCEL_IN_C.lock().unwrap().contains(&ctx.job_id) {
            JobStore::new(Arc::clone(&ctx.db), Arc::new(NullDispatcher)).cancel(&ctx.job_id)?;
        }
        Ok(())
    }

    static DEMO_STAGES: [Stage<Demo>; 3] = [
        Stage { name: "a", run: stage_a },
        Stage { name: "b", run: stage_b },
        Stage { name: "c", run: stage_c },
    ];

    impl Workflow for Demo {
        type Params = String;
        type Intermediate = Counter;

        const TASK: &'static str = "demo";

        fn stages(&self) -> &'static [Stage<Self>] {
            &DEMO_STAGES
        }

        fn check_db(&self, _ctx: &JobContext, args: &Value) -> Result<String, KiraError> {
            args.get("mode")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| KiraError::Validation("mode is required".to_string()))
        }
    }

    struct Harness {
        _temp: tempfile::TempDir,
        root: Utf8PathBuf,
        db: Arc<MemoryDocumentStore>,
        runner: JobRunner,
    }

    impl std::ops::Deref for Harness {
        type Target = JobRunner;

        fn deref(&self) -> &JobRunner {
            &self.runner
        }
    }

    impl Harness {
        fn second_runner(&self) -> JobRunner {
            JobRunner::new(
                Settings::with_data_path(self.root.clone()),
                Arc::clone(&self.db) as Arc<dyn DocumentStore>,
                Arc::new(NullDispatcher),
                Arc::new(SystemProcessRunner),
            )
        }
    }

    fn runner() -> Harness {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let db = Arc::new(MemoryDocumentStore::new());
        let runner = JobRunner::new(
            Settings::with_data_path(root.clone()),
            Arc::clone(&db) as Arc<dyn DocumentStore>,
            Arc::new(NullDispatcher),
            Arc::new(SystemProcessRunner),
        );
        Harness {
            _temp: temp,
            root,
            db,
            runner,
        }
    }

    fn entries_for(job_id: &JobId) -> Vec<String> {
        let prefix = format!("{job_id}:");
        LOG.lock()
            .unwrap()
            .iter()
            .filter_map(|entry| entry.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    #[test]
    fn stages_run_in_order_and_complete() {
        let runner = runner();
        let job = runner.enqueue(&Demo, json!({"mode": "ok"})).unwrap();
        let done = runner.run(&job.id, &Demo).unwrap();
        assert_eq!(done.state, JobState::Complete);
        assert_eq!(entries_for(&job.id), vec!["a:ok", "b:1", "c"]);
        assert_eq!(runner.jobs().load(&job.id).unwrap().stage_index, 3);
    }

    #[test]
    fn failure_halts_and_persists_context() {
        let runner = runner();
        let job = runner.enqueue(&Demo, json!({"mode": "fail"})).unwrap();
        let err = runner.run(&job.id, &Demo).unwrap_err();
        assert_matches!(err, KiraError::ToolExecution { .. });
        assert_eq!(entries_for(&job.id), vec!["a:fail", "b:1"]);

        let stored = runner.jobs().load(&job.id).unwrap();
        assert_eq!(stored.state, JobState::Error);
        assert_eq!(stored.stage_index, 1);
        let failure = stored.error.unwrap();
        assert_eq!(failure.stage.as_deref(), Some("b"));
        assert!(failure.message.contains("boom"));
        assert_matches!(
            runner.run(&job.id, &Demo),
            Err(KiraError::JobFinished { .. })
        );
    }

    #[test]
    fn check_db_failure_runs_no_stage() {
        let runner = runner();
        let job = runner.enqueue(&Demo, json!({})).unwrap();
        assert_matches!(runner.run(&job.id, &Demo), Err(KiraError::Validation(_)));
        assert!(entries_for(&job.id).is_empty());
        let stored = runner.jobs().load(&job.id).unwrap();
        assert_eq!(stored.error.unwrap().stage.as_deref(), Some(CHECK_DB_STAGE));
    }

    #[test]
    fn resume_starts_at_checkpoint() {
        let runner = runner();
        let job = runner.enqueue(&Demo, json!({"mode": "ok"})).unwrap();
        runner.jobs().record_checkpoint(&job.id, 2, "b").unwrap();
        runner.run(&job.id, &Demo).unwrap();
        assert_eq!(entries_for(&job.id), vec!["c"]);
    }

    #[test]
    fn cancelled_job_does_not_start() {
        let runner = runner();
        let job = runner.enqueue(&Demo, json!({"mode": "ok"})).unwrap();
        runner.jobs().cancel(&job.id).unwrap();
        assert_matches!(
            runner.run(&job.id, &Demo),
            Err(KiraError::JobFinished { .. })
        );
        assert!(entries_for(&job.id).is_empty());
    }

    #[test]
    fn second_claim_is_refused_until_released() {
        let runner = runner();
        let id: JobId = "busy".parse().unwrap();
        let claim = runner.claim(&id).unwrap();
        assert!(runner.store().job_lock_path(&id).as_std_path().is_file());
        assert_matches!(
            runner.claim(&id),
            Err(KiraError::JobAlreadyRunning { .. })
        );
        assert_matches!(
            runner.second_runner().claim(&id),
            Err(KiraError::JobAlreadyRunning { .. })
        );
        drop(claim);
        assert!(!runner.store().job_lock_path(&id).as_std_path().exists());
        assert!(runner.second_runner().claim(&id).is_ok());
    }

    #[test]
    fn other_runner_cannot_run_an_active_job() {
        let runner = runner();
        let job = runner.enqueue(&Demo, json!({"mode": "ok"})).unwrap();
        let _claim = runner.claim(&job.id).unwrap();

        let other = runner.second_runner();
        assert_matches!(
            other.run(&job.id, &Demo),
            Err(KiraError::JobAlreadyRunning { .. })
        );
        assert!(entries_for(&job.id).is_empty());
        assert_eq!(other.jobs().load(&job.id).unwrap().state, JobState::Pending);
    }

    #[test]
    fn cancel_during_last_stage_is_not_overwritten() {
        let runner = runner();
        let job = runner.enqueue(&Demo, json!({"mode": "ok"})).unwrap();
        runner.jobs().record_checkpoint(&job.id, 2, "b").unwrap();
        CANCEL_IN_C.lock().unwrap().push(job.id.clone());

        assert_matches!(runner.run(&job.id, &Demo), Err(KiraError::JobAborted(_)));
        assert_eq!(entries_for(&job.id), vec!["c"]);
        assert_eq!(runner.jobs().load(&job.id).unwrap().state, JobState::Error);
    }

    #[test]
    fn registry_dispatches_by_task() {
        let runner = runner();
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(Demo));
        let job = runner.enqueue(&Demo, json!({"mode": "ok"})).unwrap();
        let done = runner.run_registered(&registry, &job.id).unwrap();
        assert_eq!(done.state, JobState::Complete);
        assert_matches!(registry.get("other"), Err(KiraError::UnknownTask(_)));
    }
}
