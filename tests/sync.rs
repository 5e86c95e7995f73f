use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use md_ingest::error::IngestError;
use md_ingest::store::RemoteStore;
use md_ingest::store::memory::MemoryStore;
use md_ingest::sync::{ProjectSynchronizer, Resolution};
use md_ingest::trace::TraceFile;

fn scratch() -> (tempfile::TempDir, TraceFile) {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let trace = TraceFile::for_directory(&dir);
    (temp, trace)
}

#[tokio::test]
async fn creates_project_and_writes_trace() {
    let (_temp, trace) = scratch();
    let store = MemoryStore::new();

    let synced = ProjectSynchronizer::new(&store, &trace)
        .resolve(None)
        .await
        .unwrap();
    assert_eq!(synced.resolution, Resolution::Created);
    assert_eq!(trace.read().await.unwrap().project, synced.handle.id);
}

#[tokio::test]
async fn resumes_from_trace() {
    let (_temp, trace) = scratch();
    let store = MemoryStore::new();
    let existing = store.create_project().await.unwrap();
    trace.write(&existing.id).await.unwrap();

    let synced = ProjectSynchronizer::new(&store, &trace)
        .resolve(None)
        .await
        .unwrap();
    assert_eq!(synced.resolution, Resolution::Resumed);
    assert_eq!(synced.handle, existing);
}

#[tokio::test]
async fn explicit_reference_by_accession_overrides_trace() {
    let (_temp, trace) = scratch();
    let store = MemoryStore::new();
    let traced = store.create_project().await.unwrap();
    let chosen = store.create_project().await.unwrap();
    trace.write(&traced.id).await.unwrap();

    let reference = chosen.accession.as_deref().unwrap().parse().unwrap();
    let synced = ProjectSynchronizer::new(&store, &trace)
        .resolve(Some(&reference))
        .await
        .unwrap();
    assert_eq!(synced.resolution, Resolution::Explicit);
    assert_eq!(synced.handle.id, chosen.id);
    assert_eq!(trace.read().await.unwrap().project, chosen.id);
}

#[tokio::test]
async fn explicit_reference_is_never_created() {
    let (_temp, trace) = scratch();
    let store = MemoryStore::new();
    let reference = "MD09999".parse().unwrap();

    let err = ProjectSynchronizer::new(&store, &trace)
        .resolve(Some(&reference))
        .await
        .unwrap_err();
    assert_matches!(err, IngestError::ProjectNotFound(_));
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn stale_trace_is_replaced() {
    let (_temp, trace) = scratch();
    let store = MemoryStore::new();
    trace.write("p0404").await.unwrap();

    let synced = ProjectSynchronizer::new(&store, &trace)
        .resolve(None)
        .await
        .unwrap();
    assert_eq!(synced.resolution, Resolution::Created);
    assert_ne!(synced.handle.id, "p0404");
    assert_eq!(trace.read().await.unwrap().project, synced.handle.id);
}
