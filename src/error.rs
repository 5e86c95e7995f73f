use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("--conserve and --overwrite are mutually exclusive")]
    #[diagnostic(help("pick one policy for units that already exist remotely"))]
    ConflictingFlags,

    #[error("invalid project reference: {0}")]
    InvalidProjectRef(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("missing required file: {0}")]
    MissingFile(Utf8PathBuf),

    #[error("invalid {kind} document at {path}")]
    InvalidDocument { kind: &'static str, path: Utf8PathBuf },

    #[error("MD run '{name}' (local position {local}) is out of order with its stored index {remote}")]
    #[diagnostic(help("keep the run directories in the order they were first loaded, or pass --md"))]
    MdIndexMismatch {
        name: String,
        local: usize,
        remote: usize,
    },

    #[error("duplicate MD run name: {0}")]
    DuplicateMdRun(String),

    #[error("trajectory decoding failed: {0}")]
    Codec(String),

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("no remote store configured (set store.url or MDINGEST_STORE_URL)")]
    MissingStoreUrl,

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("remote store request failed: {0}")]
    StoreHttp(String),

    #[error("remote store returned status {status}: {message}")]
    StoreStatus { status: u16, message: String },

    #[error("annotation request failed: {0}")]
    AnnotationHttp(String),

    #[error("annotation service returned status {status}: {message}")]
    AnnotationStatus { status: u16, message: String },

    #[error("annotation job {job} ended as {status}")]
    AnnotationJob { job: String, status: String },

    #[error("trajectory dump command failed: {0}")]
    DumpCommand(String),

    #[error("ingestion of project {project} was aborted")]
    Cancelled { project: String },
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            IngestError::Filesystem(_)
                | IngestError::StoreHttp(_)
                | IngestError::StoreStatus { .. }
                | IngestError::AnnotationHttp(_)
                | IngestError::AnnotationStatus { .. }
                | IngestError::AnnotationJob { .. }
                | IngestError::DumpCommand(_)
        )
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Filesystem(err.to_string())
    }
}
