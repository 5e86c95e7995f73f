//! Remote document store seam.
//!
//! The loader never keeps a private copy of a project: every read and write goes
//! through [`RemoteStore`]. [`http::HttpStore`] talks to the REST front of the
//! database, [`memory::MemoryStore`] keeps everything in process.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::domain::{
    AnalysisRecord, BlobKind, FileRecord, MdRunSummary, Metadata, ProjectHandle, ProjectRef,
    Scope, TrajectoryInfo,
};
use crate::error::IngestError;

/// Destination of one streamed binary payload.
///
/// `write` only returns once the chunk has been accepted, which is the
/// backpressure signal the uploader waits on.
#[async_trait]
pub trait BlobSink: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<(), IngestError>;

    /// Commits the blob and returns its storage location.
    async fn finish(&mut self) -> Result<String, IngestError>;

    /// Discards whatever was written so far.
    async fn abort(&mut self);
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create_project(&self) -> Result<ProjectHandle, IngestError>;
    async fn find_project(&self, reference: &ProjectRef)
    -> Result<Option<ProjectHandle>, IngestError>;

    async fn project_metadata(&self, project: &str) -> Result<Metadata, IngestError>;
    async fn update_project_metadata(
        &self,
        project: &str,
        metadata: &Metadata,
    ) -> Result<(), IngestError>;

    async fn md_runs(&self, project: &str) -> Result<Vec<MdRunSummary>, IngestError>;
    async fn add_md_run(&self, project: &str, name: &str) -> Result<usize, IngestError>;
    async fn md_metadata(&self, project: &str, md: usize) -> Result<Option<Metadata>, IngestError>;
    async fn delete_md_metadata(&self, project: &str, md: usize) -> Result<(), IngestError>;
    async fn put_md_metadata(
        &self,
        project: &str,
        md: usize,
        metadata: &Metadata,
    ) -> Result<(), IngestError>;
    async fn set_trajectory_info(
        &self,
        project: &str,
        md: usize,
        info: TrajectoryInfo,
    ) -> Result<(), IngestError>;

    async fn has_reference(&self, key: &str) -> Result<bool, IngestError>;
    async fn load_reference(&self, key: &str, document: &Value) -> Result<(), IngestError>;

    async fn topology(&self, project: &str) -> Result<Option<Value>, IngestError>;
    async fn put_topology(&self, project: &str, topology: &Value) -> Result<(), IngestError>;

    async fn find_file(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<Option<FileRecord>, IngestError>;
    async fn delete_file(&self, project: &str, scope: Scope, name: &str)
    -> Result<(), IngestError>;
    async fn open_blob(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
        kind: BlobKind,
    ) -> Result<Box<dyn BlobSink>, IngestError>;
    async fn register_file(&self, project: &str, record: &FileRecord) -> Result<(), IngestError>;

    async fn find_analysis(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<Option<AnalysisRecord>, IngestError>;
    async fn delete_analysis(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<(), IngestError>;
    async fn put_analysis(&self, project: &str, record: &AnalysisRecord)
    -> Result<(), IngestError>;

    async fn chains(&self, project: &str) -> Result<Vec<String>, IngestError>;
    async fn delete_chains(&self, project: &str) -> Result<(), IngestError>;
    async fn put_chain(&self, project: &str, chain: &str, document: &Value)
    -> Result<(), IngestError>;

    async fn set_published(&self, project: &str, published: bool) -> Result<(), IngestError>;

    async fn abort_requested(&self, project: &str) -> Result<bool, IngestError>;
    async fn request_abort(&self, project: &str, abort: bool) -> Result<(), IngestError>;
}
