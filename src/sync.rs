use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{ProjectHandle, ProjectRef};
use crate::error::IngestError;
use crate::store::RemoteStore;
use crate::trace::TraceFile;

/// How the target project of a load was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Explicit,
    Resumed,
    Created,
}

#[derive(Debug, Clone)]
pub struct SyncedProject {
    pub handle: ProjectHandle,
    pub resolution: Resolution,
}

pub struct ProjectSynchronizer<'a, S: ?Sized> {
    store: &'a S,
    trace: &'a TraceFile,
}

impl<'a, S: RemoteStore + ?Sized> ProjectSynchronizer<'a, S> {
    pub fn new(store: &'a S, trace: &'a TraceFile) -> Self {
        Self { store, trace }
    }

    /// Picks the project to load into and points the trace at it.
    ///
    /// An explicit reference must exist remotely. Without one, the trace is
    /// followed when it still leads somewhere, otherwise a new project is made.
    pub async fn resolve(
        &self,
        explicit: Option<&ProjectRef>,
    ) -> Result<SyncedProject, IngestError> {
        let synced = match explicit {
            Some(reference) => {
                let handle = self
                    .store
                    .find_project(reference)
                    .await?
                    .ok_or_else(|| IngestError::ProjectNotFound(reference.to_string()))?;
                SyncedProject {
                    handle,
                    resolution: Resolution::Explicit,
                }
            }
            None => self.from_trace_or_new().await?,
        };
        self.trace.write(&synced.handle.id).await?;
        info!(
            project = %synced.handle.id,
            accession = synced.handle.accession.as_deref().unwrap_or("-"),
            resolution = ?synced.resolution,
            "project resolved"
        );
        Ok(synced)
    }

    async fn from_trace_or_new(&self) -> Result<SyncedProject, IngestError> {
        if let Some(trace) = self.trace.read().await {
            let found = match trace.project.parse::<ProjectRef>() {
                Ok(reference) => self.store.find_project(&reference).await?,
                Err(_) => None,
            };
            match found {
                Some(handle) => {
                    return Ok(SyncedProject {
                        handle,
                        resolution: Resolution::Resumed,
                    });
                }
                None => {
                    warn!(
                        project = %trace.project,
                        trace = %self.trace.path(),
                        "traced project no longer exists, starting a new one"
                    );
                    self.trace.delete().await?;
                }
            }
        }
        let handle = self.store.create_project().await?;
        Ok(SyncedProject {
            handle,
            resolution: Resolution::Created,
        })
    }
}
