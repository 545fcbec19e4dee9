use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("validation failed: {0}")]
    #[diagnostic(code(kira::validation))]
    Validation(String),

    #[error("{tool} failed: {message}")]
    #[diagnostic(code(kira::tool))]
    ToolExecution { tool: String, message: String },

    #[error("failed to parse QC report {path}: {message}")]
    #[diagnostic(code(kira::tool))]
    QcParse { path: Utf8PathBuf, message: String },

    #[error("document store write failed: {0}")]
    #[diagnostic(code(kira::storage))]
    StorageWrite(String),

    #[error("document store read failed: {0}")]
    #[diagnostic(code(kira::storage))]
    StorageRead(String),

    #[error("{collection} document does not exist: {id}")]
    #[diagnostic(code(kira::not_found))]
    NotFound { collection: String, id: String },

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("cache directory already exists: {0}")]
    CacheDirExists(Utf8PathBuf),

    #[error("cache {0} was already finalized with a different file list")]
    CacheAlreadyFinalized(String),

    #[error("job {id} is already running; remove {lock} if no run is active")]
    JobAlreadyRunning { id: String, lock: Utf8PathBuf },

    #[error("job {0} was aborted")]
    JobAborted(String),

    #[error("job {id} is in terminal state {state}")]
    JobFinished { id: String, state: String },

    #[error("no workflow registered for task {0}")]
    UnknownTask(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("failed to install logging: {0}")]
    Logging(String),
}

impl KiraError {
    pub fn fs(err: impl std::fmt::Display) -> Self {
        KiraError::Filesystem(err.to_string())
    }

    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        KiraError::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        KiraError::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Collects the `source()` chain below this error, outermost first.
    pub fn source_chain(&self) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = std::error::Error::source(self);
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        chain
    }
}
