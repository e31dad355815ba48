use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlaygroundError {
    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Malformed archive {url}: {reason}")]
    ArchiveFormat { url: String, reason: String },

    #[error("Transpile failed for {filename}: {stderr}")]
    Transpile { filename: String, stderr: String },

    #[error("Compilation failed")]
    Compile { diagnostics: String },

    #[error("Compiler crashed: {0}")]
    CompileCrash(String),

    #[error("Sandbox instantiation failed: {0}")]
    Instantiate(String),

    #[error("Stage busy: {0}")]
    Busy(&'static str),

    #[error("Worker unavailable: {0}")]
    WorkerGone(&'static str),

    #[error("Virtual file not found: {0}")]
    VirtualFileNotFound(String),

    #[error("Path conflict in virtual filesystem: {0}")]
    PathConflict(String),

    #[error("Duplicate mount point: {0}")]
    DuplicateMount(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl PlaygroundError {
    /// Reentrancy rejections are admission control, not failures.
    pub fn is_busy(&self) -> bool {
        matches!(self, PlaygroundError::Busy(_))
    }
}

pub type PlaygroundResult<T> = Result<T, PlaygroundError>;
