use std::sync::Arc;

use tracing::info;

use crate::config::Settings;
use crate::db::{DocumentStore, JsonDocumentStore};
use crate::dispatch::Dispatcher;
use crate::domain::{FileId, JobId, UploadFile};
use crate::error::KiraError;
use crate::files;
use crate::jobs::JobDocument;
use crate::pipeline::{JobRunner, TaskRegistry, Workflow};
use crate::process::ProcessRunner;
use crate::update_sample::{UpdateSample, UpdateSampleArgs};

/// Entry points used by the command line.
pub struct App {
    db: Arc<dyn DocumentStore>,
    dispatcher: Arc<dyn Dispatcher>,
    runner: JobRunner,
    registry: TaskRegistry,
}

impl App {
    pub fn new(
        settings: Settings,
        db: Arc<dyn DocumentStore>,
        dispatcher: Arc<dyn Dispatcher>,
        process: Arc<dyn ProcessRunner>,
    ) -> Self {
        let runner = JobRunner::new(settings, Arc::clone(&db), Arc::clone(&dispatcher), process);
        let mut registry = TaskRegistry::new();
        registry.register(Arc::new(UpdateSample));
        Self {
            db,
            dispatcher,
            runner,
            registry,
        }
    }

    /// Opens the JSON document store under `<data_path>/db`.
    pub fn open(
        settings: Settings,
        dispatcher: Arc<dyn Dispatcher>,
        process: Arc<dyn ProcessRunner>,
    ) -> Result<Self, KiraError> {
        let layout = crate::store::ArtifactStore::new(settings.data_path.clone());
        layout.ensure_layout()?;
        let db = Arc::new(JsonDocumentStore::open(layout.db_dir())?);
        Ok(Self::new(settings, db, dispatcher, process))
    }

    pub fn create_update_sample(&self, args: &UpdateSampleArgs) -> Result<JobDocument, KiraError> {
        let job = self.runner.enqueue(&UpdateSample, args.to_value()?)?;
        info!(
            job_id = %job.id,
            sample_id = %args.sample_id,
            task = UpdateSample::TASK,
            "created job"
        );
        Ok(job)
    }

    pub fn run_job(&self, job_id: &JobId) -> Result<JobDocument, KiraError> {
        self.runner.run_registered(&self.registry, job_id)
    }

    pub fn job_status(&self, job_id: &JobId) -> Result<JobDocument, KiraError> {
        self.runner.jobs().load(job_id)
    }

    pub fn list_jobs(&self) -> Result<Vec<JobDocument>, KiraError> {
        let mut jobs = self.runner.jobs().find_all()?;
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    pub fn cancel_job(&self, job_id: &JobId) -> Result<JobDocument, KiraError> {
        self.runner.jobs().cancel(job_id)
    }

    pub fn list_files(&self, file_type: Option<&str>) -> Result<Vec<UploadFile>, KiraError> {
        files::find(self.db.as_ref(), file_type)
    }

    pub fn remove_file(&self, file_id: &FileId) -> Result<(), KiraError> {
        files::remove(
            self.db.as_ref(),
            self.runner.store(),
            self.dispatcher.as_ref(),
            file_id,
        )
    }
}
