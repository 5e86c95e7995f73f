use tracing::warn;

use crate::error::IngestError;
use crate::store::RemoteStore;

/// Reads the project's abort flag, which other processes may set at any time.
pub struct AbortMonitor<'a, S: ?Sized> {
    store: &'a S,
    project: &'a str,
}

impl<'a, S: RemoteStore + ?Sized> AbortMonitor<'a, S> {
    pub fn new(store: &'a S, project: &'a str) -> Self {
        Self { store, project }
    }

    pub fn project(&self) -> &str {
        self.project
    }

    /// Fails with [`IngestError::Cancelled`] when an abort was requested.
    pub async fn check(&self) -> Result<(), IngestError> {
        if self.store.abort_requested(self.project).await? {
            warn!(project = %self.project, "abort requested, stopping ingestion");
            return Err(IngestError::Cancelled {
                project: self.project.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn flag_turns_into_cancellation() {
        let store = MemoryStore::new();
        let project = store.create_project().await.unwrap();
        let monitor = AbortMonitor::new(&store, &project.id);

        monitor.check().await.unwrap();
        store.set_abort_flag(&project.id, true);
        assert_matches!(monitor.check().await, Err(IngestError::Cancelled { .. }));
    }
}
