use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::fs_util;

pub const TRACE_FILENAME: &str = ".mdingest-trace.json";

/// Local pointer from a source directory to the remote project it was loaded into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub project: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TraceFile {
    path: Utf8PathBuf,
}

impl TraceFile {
    pub fn for_directory(dir: &Utf8Path) -> Self {
        Self {
            path: dir.join(TRACE_FILENAME),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub async fn read(&self) -> Option<Trace> {
        fs_util::read_json_soft(&self.path).await
    }

    pub async fn write(&self, project: &str) -> Result<(), IngestError> {
        let trace = Trace {
            project: project.to_string(),
            updated_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        fs_util::write_json_atomic(&self.path, &trace).await
    }

    pub async fn delete(&self) -> Result<(), IngestError> {
        fs_util::remove_file_if_exists(&self.path).await
    }
}
