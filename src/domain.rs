use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::IngestError;

pub type Metadata = Map<String, Value>;

/// Reference to a remote project, either its internal id or its public accession.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectRef(String);

impl ProjectRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectRef {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(IngestError::InvalidProjectRef(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Handle on a project owned by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectHandle {
    pub id: String,
    pub accession: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "level", content = "md")]
pub enum Scope {
    Project,
    Md(usize),
}

impl Scope {
    pub fn md_index(self) -> Option<usize> {
        match self {
            Scope::Project => None,
            Scope::Md(index) => Some(index),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Project => write!(f, "project"),
            Scope::Md(index) => write!(f, "md{index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdRunSummary {
    pub name: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub scope: Scope,
    pub length: u64,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub name: String,
    pub scope: Scope,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryInfo {
    pub frames: u64,
    pub atoms: u64,
}

/// Kind of binary payload a blob sink receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobKind {
    File,
    Trajectory,
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobKind::File => write!(f, "file"),
            BlobKind::Trajectory => write!(f, "trajectory"),
        }
    }
}

/// Identity of one ingestable unit, used for conflict prompts and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitId {
    ChainAnnotations,
    ProjectMetadata { key: String },
    MdMetadata { md: String },
    File { name: String, scope: Scope },
    Trajectory { name: String, scope: Scope },
    Analysis { name: String, scope: Scope },
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitId::ChainAnnotations => write!(f, "chain annotations"),
            UnitId::ProjectMetadata { key } => write!(f, "project metadata field '{key}'"),
            UnitId::MdMetadata { md } => write!(f, "metadata of MD run '{md}'"),
            UnitId::File { name, scope } => write!(f, "file '{name}' ({scope})"),
            UnitId::Trajectory { name, scope } => write!(f, "trajectory '{name}' ({scope})"),
            UnitId::Analysis { name, scope } => write!(f, "analysis '{name}' ({scope})"),
        }
    }
}
