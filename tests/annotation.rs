use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::{Value, json};

use md_ingest::abort::AbortMonitor;
use md_ingest::annotation::{AnnotationClient, JobPoller};
use md_ingest::chains::ChainSequence;
use md_ingest::error::IngestError;
use md_ingest::store::RemoteStore;
use md_ingest::store::memory::MemoryStore;

/// Finishes `FAST` at once, fails `BROKEN`, and never finishes anything else.
struct ScriptedAnnotator;

#[async_trait]
impl AnnotationClient for ScriptedAnnotator {
    async fn annotate(&self, sequence: &str) -> Result<Value, IngestError> {
        match sequence {
            "FAST" => Ok(json!({ "sequence": sequence, "domains": 2 })),
            "BROKEN" => Err(IngestError::AnnotationJob {
                job: "job-2".to_string(),
                status: "FAILURE".to_string(),
            }),
            _ => std::future::pending().await,
        }
    }
}

fn chain(key: &str, sequence: &str) -> ChainSequence {
    ChainSequence {
        key: key.to_string(),
        sequence: sequence.to_string(),
    }
}

#[tokio::test]
async fn finished_job_is_stored_before_slow_jobs_and_abort_wins() {
    let store = MemoryStore::new();
    let project = store.create_project().await.unwrap();
    let monitor = AbortMonitor::new(&store, &project.id);

    let mut poller = JobPoller::new(Arc::new(ScriptedAnnotator));
    poller.submit(chain("C", "SLOW"));
    poller.submit(chain("A, B", "FAST"));
    poller.submit(chain("D", "SLOWER"));
    assert_eq!(poller.pending(), 3);

    let watcher = async {
        loop {
            let stored = store.project(&project.id).unwrap().chains;
            if stored.len() == 2 {
                assert_eq!(stored["A"], stored["B"]);
                assert_eq!(stored["A"]["domains"], json!(2));
                assert!(!stored.contains_key("C"));
                assert!(!stored.contains_key("D"));
                store.set_abort_flag(&project.id, true);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    let (result, ()) = tokio::join!(
        poller.collect(&store, &monitor, Duration::from_millis(10)),
        watcher
    );
    assert_matches!(result, Err(IngestError::Cancelled { .. }));
    assert_eq!(store.project(&project.id).unwrap().chains.len(), 2);
}

#[tokio::test]
async fn failed_job_is_counted_not_fatal() {
    let store = MemoryStore::new();
    let project = store.create_project().await.unwrap();
    let monitor = AbortMonitor::new(&store, &project.id);

    let mut poller = JobPoller::new(Arc::new(ScriptedAnnotator));
    poller.submit(chain("A", "BROKEN"));
    poller.submit(chain("B, C", "FAST"));

    let summary = poller
        .collect(&store, &monitor, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(summary.jobs_completed, 1);
    assert_eq!(summary.jobs_failed, 1);
    assert_eq!(summary.chains_stored, 2);

    let stored = store.project(&project.id).unwrap().chains;
    assert!(stored.contains_key("B"));
    assert!(stored.contains_key("C"));
    assert!(!stored.contains_key("A"));
}

#[tokio::test]
async fn abort_raised_before_collection_stops_immediately() {
    let store = MemoryStore::new();
    let project = store.create_project().await.unwrap();
    store.set_abort_flag(&project.id, true);
    let monitor = AbortMonitor::new(&store, &project.id);

    let mut poller = JobPoller::new(Arc::new(ScriptedAnnotator));
    poller.submit(chain("A", "SLOW"));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        poller.collect(&store, &monitor, Duration::from_millis(10)),
    )
    .await
    .unwrap();
    assert_matches!(result, Err(IngestError::Cancelled { .. }));
}

#[tokio::test]
async fn result_without_chain_names_is_not_counted_as_stored() {
    let store = MemoryStore::new();
    let project = store.create_project().await.unwrap();
    let monitor = AbortMonitor::new(&store, &project.id);

    let mut poller = JobPoller::new(Arc::new(ScriptedAnnotator));
    poller.submit(chain(" ", "FAST"));

    let summary = poller
        .collect(&store, &monitor, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(summary.jobs_completed, 0);
    assert_eq!(summary.jobs_failed, 1);
    assert!(store.project(&project.id).unwrap().chains.is_empty());
}
