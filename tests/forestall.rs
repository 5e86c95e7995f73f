use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use assert_matches::assert_matches;
use async_trait::async_trait;

use md_ingest::domain::{Scope, UnitId};
use md_ingest::error::IngestError;
use md_ingest::forestall::{ConflictPolicy, Decision, DecisionProvider, FixedDecision, Forestall};

struct RecordingProvider {
    answer: Decision,
    asked: Mutex<Vec<String>>,
}

impl RecordingProvider {
    fn new(answer: Decision) -> Self {
        Self {
            answer,
            asked: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DecisionProvider for RecordingProvider {
    async fn decide(&self, unit: &UnitId) -> Decision {
        self.asked.lock().unwrap().push(unit.to_string());
        self.answer
    }
}

fn unit() -> UnitId {
    UnitId::File {
        name: "topol.tpr".to_string(),
        scope: Scope::Project,
    }
}

async fn run(
    conserve: bool,
    overwrite: bool,
    provider: &RecordingProvider,
) -> Result<(bool, usize), IngestError> {
    let policy = ConflictPolicy::from_flags(conserve, overwrite)?;
    let forestall = Forestall::new(policy, provider);
    let deletes = AtomicUsize::new(0);
    let proceed = forestall
        .decide(&unit(), true, || async {
            deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await?;
    Ok((proceed, deletes.load(Ordering::SeqCst)))
}

#[tokio::test]
async fn neither_flag_asks_the_provider() {
    let provider = RecordingProvider::new(Decision::Overwrite);
    assert_eq!(run(false, false, &provider).await.unwrap(), (true, 1));
    assert_eq!(
        provider.asked.lock().unwrap().as_slice(),
        ["file 'topol.tpr' (project)"]
    );

    let provider = RecordingProvider::new(Decision::Skip);
    assert_eq!(run(false, false, &provider).await.unwrap(), (false, 0));
}

#[tokio::test]
async fn conserve_skips_without_asking() {
    let provider = RecordingProvider::new(Decision::Overwrite);
    assert_eq!(run(true, false, &provider).await.unwrap(), (false, 0));
    assert!(provider.asked.lock().unwrap().is_empty());
}

#[tokio::test]
async fn overwrite_deletes_then_proceeds() {
    let provider = RecordingProvider::new(Decision::Skip);
    assert_eq!(run(false, true, &provider).await.unwrap(), (true, 1));
    assert!(provider.asked.lock().unwrap().is_empty());
}

#[tokio::test]
async fn both_flags_are_a_validation_error() {
    let provider = RecordingProvider::new(Decision::Skip);
    assert_matches!(
        run(true, true, &provider).await,
        Err(IngestError::ConflictingFlags)
    );
}

#[tokio::test]
async fn delete_failure_is_propagated() {
    let provider = FixedDecision(Decision::Skip);
    let forestall = Forestall::new(ConflictPolicy::Overwrite, &provider);
    let result = forestall
        .decide(&unit(), true, || async {
            Err(IngestError::StoreStatus {
                status: 500,
                message: "delete failed".to_string(),
            })
        })
        .await;
    assert_matches!(result, Err(IngestError::StoreStatus { status: 500, .. }));
}
