//! Chain annotation jobs on an external sequence analysis service.
//!
//! Jobs are submitted as soon as the structure is known and keep running while
//! the rest of the project loads. [`JobPoller::collect`] then waits for them,
//! storing each result the moment it arrives, and gives up as soon as the
//! project's abort flag is raised.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::abort::AbortMonitor;
use crate::chains::{ChainSequence, split_chain_key};
use crate::config::AnnotationSettings;
use crate::error::IngestError;
use crate::http::{build_client, send_with_retries};
use crate::store::RemoteStore;

#[async_trait]
pub trait AnnotationClient: Send + Sync + 'static {
    /// Runs one annotation job to completion and returns its result document.
    async fn annotate(&self, sequence: &str) -> Result<Value, IngestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "QUEUED" => Some(JobStatus::Queued),
            "RUNNING" => Some(JobStatus::Running),
            "FINISHED" => Some(JobStatus::Finished),
            "ERROR" | "FAILURE" | "NOT_FOUND" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Client for the EBI InterProScan REST service.
#[derive(Clone)]
pub struct InterProScanClient {
    client: Client,
    base: String,
    email: String,
    poll_interval: Duration,
}

impl InterProScanClient {
    pub fn new(settings: &AnnotationSettings) -> Result<Self, IngestError> {
        let client = build_client(Some(Duration::from_secs(60)), Duration::from_secs(15))
            .map_err(IngestError::AnnotationHttp)?;
        Ok(Self {
            client,
            base: settings.url.trim_end_matches('/').to_string(),
            email: settings.email.clone(),
            poll_interval: settings.poll_interval,
        })
    }

    async fn submit(&self, sequence: &str) -> Result<String, IngestError> {
        let url = format!("{}/run", self.base);
        let form = [
            ("email", self.email.as_str()),
            ("sequence", sequence),
            ("stype", "p"),
        ];
        let response = send_with_retries(|| self.client.post(&url).form(&form))
            .await
            .map_err(|err| IngestError::AnnotationHttp(err.to_string()))?;
        let body = checked_text(response).await?;
        let job = body.trim().to_string();
        if job.is_empty() {
            return Err(IngestError::AnnotationHttp(
                "service returned an empty job id".to_string(),
            ));
        }
        Ok(job)
    }

    async fn status(&self, job: &str) -> Result<String, IngestError> {
        let url = format!("{}/status/{job}", self.base);
        let response = send_with_retries(|| self.client.get(&url))
            .await
            .map_err(|err| IngestError::AnnotationHttp(err.to_string()))?;
        checked_text(response).await
    }

    async fn result(&self, job: &str) -> Result<Value, IngestError> {
        let url = format!("{}/result/{job}/json", self.base);
        let response = send_with_retries(|| self.client.get(&url))
            .await
            .map_err(|err| IngestError::AnnotationHttp(err.to_string()))?;
        let body = checked_text(response).await?;
        serde_json::from_str(&body).map_err(|err| IngestError::AnnotationHttp(err.to_string()))
    }
}

#[async_trait]
impl AnnotationClient for InterProScanClient {
    async fn annotate(&self, sequence: &str) -> Result<Value, IngestError> {
        let job = self.submit(sequence).await?;
        debug!(job = %job, "annotation job submitted");
        loop {
            let status = self.status(&job).await?;
            match JobStatus::parse(&status) {
                Some(JobStatus::Finished) => break,
                Some(JobStatus::Queued) | Some(JobStatus::Running) => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Some(JobStatus::Failed) | None => {
                    return Err(IngestError::AnnotationJob {
                        job,
                        status: status.trim().to_string(),
                    });
                }
            }
        }
        self.result(&job).await
    }
}

async fn checked_text(response: reqwest::Response) -> Result<String, IngestError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| IngestError::AnnotationHttp(err.to_string()))?;
    if !status.is_success() {
        return Err(IngestError::AnnotationStatus {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        });
    }
    Ok(body)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectSummary {
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    pub chains_stored: usize,
}

/// Annotation jobs in flight, keyed by chain key.
pub struct JobPoller<A> {
    client: Arc<A>,
    tasks: JoinSet<(String, Result<Value, IngestError>)>,
}

impl<A: AnnotationClient> JobPoller<A> {
    pub fn new(client: Arc<A>) -> Self {
        Self {
            client,
            tasks: JoinSet::new(),
        }
    }

    /// Starts the job in the background and returns immediately.
    pub fn submit(&mut self, chain: ChainSequence) {
        let client = Arc::clone(&self.client);
        debug!(chains = %chain.key, "submitting annotation job");
        self.tasks.spawn(async move {
            let result = client.annotate(&chain.sequence).await;
            (chain.key, result)
        });
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Stores results as jobs finish until none are left.
    ///
    /// The abort flag is polled every `abort_interval`; once it is raised the
    /// remaining jobs are dropped locally and [`IngestError::Cancelled`] is
    /// returned. Chains stored before that stay stored. A failed job is logged
    /// and counted, it does not fail the load.
    pub async fn collect<S>(
        mut self,
        store: &S,
        monitor: &AbortMonitor<'_, S>,
        abort_interval: Duration,
    ) -> Result<CollectSummary, IngestError>
    where
        S: RemoteStore + ?Sized,
    {
        let mut summary = CollectSummary::default();
        let mut ticker = tokio::time::interval(abort_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.tasks.is_empty() {
            tokio::select! {
                joined = self.tasks.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    match joined {
                        Ok((key, Ok(document))) => {
                            let names = split_chain_key(&key);
                            if names.is_empty() {
                                warn!(chains = %key, "annotation result has no chain to store it under");
                                summary.jobs_failed += 1;
                                continue;
                            }
                            for name in names {
                                store.put_chain(monitor.project(), name, &document).await?;
                                summary.chains_stored += 1;
                            }
                            summary.jobs_completed += 1;
                            info!(chains = %key, "chain annotation stored");
                        }
                        Ok((key, Err(err))) => {
                            warn!(chains = %key, error = %err, "annotation job failed");
                            summary.jobs_failed += 1;
                        }
                        Err(err) => {
                            warn!(error = %err, "annotation task did not complete");
                            summary.jobs_failed += 1;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = monitor.check().await {
                        self.tasks.abort_all();
                        return Err(err);
                    }
                }
            }
        }
        Ok(summary)
    }
}
