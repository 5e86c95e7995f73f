use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::domain::{
    AnalysisRecord, BlobKind, FileRecord, MdRunSummary, Metadata, ProjectHandle, ProjectRef,
    Scope, TrajectoryInfo,
};
use crate::error::IngestError;
use crate::store::{BlobSink, RemoteStore};

#[derive(Debug, Default, Clone)]
pub struct MemoryProject {
    pub id: String,
    pub accession: String,
    pub published: bool,
    pub abort: bool,
    pub metadata: Metadata,
    pub mds: Vec<MemoryMd>,
    pub topology: Option<Value>,
    pub files: BTreeMap<(Scope, String), FileRecord>,
    pub analyses: BTreeMap<(Scope, String), AnalysisRecord>,
    pub chains: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryMd {
    pub name: String,
    pub metadata: Option<Metadata>,
    pub trajectory: Option<TrajectoryInfo>,
}

#[derive(Debug, Default)]
struct Inner {
    projects: Vec<MemoryProject>,
    references: HashMap<String, Value>,
    blobs: HashMap<String, Vec<u8>>,
    next_project: usize,
    next_blob: usize,
}

/// In-process store, shared between clones.
///
/// Every mutation bumps [`MemoryStore::write_count`], which makes "nothing was
/// written" observable.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn project(&self, id: &str) -> Option<MemoryProject> {
        self.lock()
            .projects
            .iter()
            .find(|project| project.id == id)
            .cloned()
    }

    pub fn blob(&self, location: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(location).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.lock().blobs.len()
    }

    pub fn reference(&self, key: &str) -> Option<Value> {
        self.lock().references.get(key).cloned()
    }

    /// Flips the abort flag without going through the async trait.
    pub fn set_abort_flag(&self, project: &str, abort: bool) {
        if let Some(entry) = self
            .lock()
            .projects
            .iter_mut()
            .find(|entry| entry.id == project)
        {
            entry.abort = abort;
        }
    }

    pub fn remove_project(&self, project: &str) {
        self.lock().projects.retain(|entry| entry.id != project);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn with_project<T>(
        &self,
        project: &str,
        f: impl FnOnce(&mut MemoryProject) -> Result<T, IngestError>,
    ) -> Result<T, IngestError> {
        let mut inner = self.lock();
        let entry = inner
            .projects
            .iter_mut()
            .find(|entry| entry.id == project)
            .ok_or_else(|| IngestError::ProjectNotFound(project.to_string()))?;
        f(entry)
    }

    fn mutate_project<T>(
        &self,
        project: &str,
        f: impl FnOnce(&mut MemoryProject) -> Result<T, IngestError>,
    ) -> Result<T, IngestError> {
        let result = self.with_project(project, f)?;
        self.touch();
        Ok(result)
    }
}

fn md_entry(project: &mut MemoryProject, md: usize) -> Result<&mut MemoryMd, IngestError> {
    project
        .mds
        .get_mut(md)
        .ok_or_else(|| IngestError::StoreStatus {
            status: 404,
            message: format!("MD run {md} does not exist"),
        })
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn create_project(&self) -> Result<ProjectHandle, IngestError> {
        let mut inner = self.lock();
        inner.next_project += 1;
        let number = inner.next_project;
        let project = MemoryProject {
            id: format!("p{number:04}"),
            accession: format!("MD{number:05}"),
            ..MemoryProject::default()
        };
        let handle = ProjectHandle {
            id: project.id.clone(),
            accession: Some(project.accession.clone()),
        };
        inner.projects.push(project);
        drop(inner);
        self.touch();
        Ok(handle)
    }

    async fn find_project(
        &self,
        reference: &ProjectRef,
    ) -> Result<Option<ProjectHandle>, IngestError> {
        Ok(self
            .lock()
            .projects
            .iter()
            .find(|project| {
                project.id == reference.as_str() || project.accession == reference.as_str()
            })
            .map(|project| ProjectHandle {
                id: project.id.clone(),
                accession: Some(project.accession.clone()),
            }))
    }

    async fn project_metadata(&self, project: &str) -> Result<Metadata, IngestError> {
        self.with_project(project, |entry| Ok(entry.metadata.clone()))
    }

    async fn update_project_metadata(
        &self,
        project: &str,
        metadata: &Metadata,
    ) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            for (key, value) in metadata {
                entry.metadata.insert(key.clone(), value.clone());
            }
            Ok(())
        })
    }

    async fn md_runs(&self, project: &str) -> Result<Vec<MdRunSummary>, IngestError> {
        self.with_project(project, |entry| {
            Ok(entry
                .mds
                .iter()
                .enumerate()
                .map(|(index, md)| MdRunSummary {
                    name: md.name.clone(),
                    index,
                })
                .collect())
        })
    }

    async fn add_md_run(&self, project: &str, name: &str) -> Result<usize, IngestError> {
        self.mutate_project(project, |entry| {
            if entry.mds.iter().any(|md| md.name == name) {
                return Err(IngestError::DuplicateMdRun(name.to_string()));
            }
            entry.mds.push(MemoryMd {
                name: name.to_string(),
                ..MemoryMd::default()
            });
            Ok(entry.mds.len() - 1)
        })
    }

    async fn md_metadata(&self, project: &str, md: usize) -> Result<Option<Metadata>, IngestError> {
        self.with_project(project, |entry| Ok(md_entry(entry, md)?.metadata.clone()))
    }

    async fn delete_md_metadata(&self, project: &str, md: usize) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            md_entry(entry, md)?.metadata = None;
            Ok(())
        })
    }

    async fn put_md_metadata(
        &self,
        project: &str,
        md: usize,
        metadata: &Metadata,
    ) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            md_entry(entry, md)?.metadata = Some(metadata.clone());
            Ok(())
        })
    }

    async fn set_trajectory_info(
        &self,
        project: &str,
        md: usize,
        info: TrajectoryInfo,
    ) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            md_entry(entry, md)?.trajectory = Some(info);
            Ok(())
        })
    }

    async fn has_reference(&self, key: &str) -> Result<bool, IngestError> {
        Ok(self.lock().references.contains_key(key))
    }

    async fn load_reference(&self, key: &str, document: &Value) -> Result<(), IngestError> {
        self.lock()
            .references
            .insert(key.to_string(), document.clone());
        self.touch();
        Ok(())
    }

    async fn topology(&self, project: &str) -> Result<Option<Value>, IngestError> {
        self.with_project(project, |entry| Ok(entry.topology.clone()))
    }

    async fn put_topology(&self, project: &str, topology: &Value) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            entry.topology = Some(topology.clone());
            Ok(())
        })
    }

    async fn find_file(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<Option<FileRecord>, IngestError> {
        self.with_project(project, |entry| {
            Ok(entry.files.get(&(scope, name.to_string())).cloned())
        })
    }

    async fn delete_file(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<(), IngestError> {
        let removed = self.mutate_project(project, |entry| {
            Ok(entry.files.remove(&(scope, name.to_string())))
        })?;
        if let Some(record) = removed {
            self.lock().blobs.remove(&record.location);
        }
        Ok(())
    }

    async fn open_blob(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
        kind: BlobKind,
    ) -> Result<Box<dyn BlobSink>, IngestError> {
        self.with_project(project, |_| Ok(()))?;
        let location = {
            let mut inner = self.lock();
            inner.next_blob += 1;
            format!("mem://{project}/{scope}/{kind}/{name}#{}", inner.next_blob)
        };
        Ok(Box::new(MemorySink {
            store: self.clone(),
            location,
            buffer: Vec::new(),
            done: false,
        }))
    }

    async fn register_file(&self, project: &str, record: &FileRecord) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            entry
                .files
                .insert((record.scope, record.name.clone()), record.clone());
            Ok(())
        })
    }

    async fn find_analysis(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<Option<AnalysisRecord>, IngestError> {
        self.with_project(project, |entry| {
            Ok(entry.analyses.get(&(scope, name.to_string())).cloned())
        })
    }

    async fn delete_analysis(
        &self,
        project: &str,
        scope: Scope,
        name: &str,
    ) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            entry.analyses.remove(&(scope, name.to_string()));
            Ok(())
        })
    }

    async fn put_analysis(
        &self,
        project: &str,
        record: &AnalysisRecord,
    ) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            entry
                .analyses
                .insert((record.scope, record.name.clone()), record.clone());
            Ok(())
        })
    }

    async fn chains(&self, project: &str) -> Result<Vec<String>, IngestError> {
        self.with_project(project, |entry| Ok(entry.chains.keys().cloned().collect()))
    }

    async fn delete_chains(&self, project: &str) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            entry.chains.clear();
            Ok(())
        })
    }

    async fn put_chain(
        &self,
        project: &str,
        chain: &str,
        document: &Value,
    ) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            entry.chains.insert(chain.to_string(), document.clone());
            Ok(())
        })
    }

    async fn set_published(&self, project: &str, published: bool) -> Result<(), IngestError> {
        self.mutate_project(project, |entry| {
            entry.published = published;
            Ok(())
        })
    }

    async fn abort_requested(&self, project: &str) -> Result<bool, IngestError> {
        self.with_project(project, |entry| Ok(entry.abort))
    }

    async fn request_abort(&self, project: &str, abort: bool) -> Result<(), IngestError> {
        self.with_project(project, |entry| {
            entry.abort = abort;
            Ok(())
        })
    }
}

struct MemorySink {
    store: MemoryStore,
    location: String,
    buffer: Vec<u8>,
    done: bool,
}

#[async_trait]
impl BlobSink for MemorySink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), IngestError> {
        if self.done {
            return Err(IngestError::StoreHttp("blob already closed".to_string()));
        }
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<String, IngestError> {
        if self.done {
            return Err(IngestError::StoreHttp("blob already closed".to_string()));
        }
        self.done = true;
        let content = std::mem::take(&mut self.buffer);
        self.store
            .lock()
            .blobs
            .insert(self.location.clone(), content);
        self.store.touch();
        Ok(self.location.clone())
    }

    async fn abort(&mut self) {
        self.done = true;
        self.buffer = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_find_by_accession() {
        let store = MemoryStore::new();
        let handle = store.create_project().await.unwrap();
        let by_accession: ProjectRef = handle.accession.clone().unwrap().parse().unwrap();
        let found = store.find_project(&by_accession).await.unwrap().unwrap();
        assert_eq!(found.id, handle.id);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_md_name_is_rejected() {
        let store = MemoryStore::new();
        let handle = store.create_project().await.unwrap();
        assert_eq!(store.add_md_run(&handle.id, "replica_1").await.unwrap(), 0);
        assert_eq!(store.add_md_run(&handle.id, "replica_2").await.unwrap(), 1);
        let err = store.add_md_run(&handle.id, "replica_1").await.unwrap_err();
        assert!(matches!(err, IngestError::DuplicateMdRun(_)));
    }

    #[tokio::test]
    async fn aborted_sink_leaves_no_blob() {
        let store = MemoryStore::new();
        let handle = store.create_project().await.unwrap();
        let mut sink = store
            .open_blob(&handle.id, Scope::Project, "a.pdb", BlobKind::File)
            .await
            .unwrap();
        sink.write(Bytes::from_static(b"abc")).await.unwrap();
        sink.abort().await;
        assert_eq!(store.blob_count(), 0);
    }
}
