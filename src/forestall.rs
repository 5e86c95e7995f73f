//! Conflict resolution for units that may already exist remotely.

use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::domain::UnitId;
use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Ask the decision provider.
    #[default]
    Ask,
    /// Keep what is already stored.
    Conserve,
    /// Replace what is already stored.
    Overwrite,
}

impl ConflictPolicy {
    pub fn from_flags(conserve: bool, overwrite: bool) -> Result<Self, IngestError> {
        match (conserve, overwrite) {
            (true, true) => Err(IngestError::ConflictingFlags),
            (true, false) => Ok(ConflictPolicy::Conserve),
            (false, true) => Ok(ConflictPolicy::Overwrite),
            (false, false) => Ok(ConflictPolicy::Ask),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Overwrite,
}

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, unit: &UnitId) -> Decision;
}

/// Always answers the same way, for batch runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub Decision);

#[async_trait]
impl DecisionProvider for FixedDecision {
    async fn decide(&self, _unit: &UnitId) -> Decision {
        self.0
    }
}

/// Asks on stderr and reads the answer from stdin. Anything but `y`/`yes`,
/// including an empty line or closed stdin, means skip.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolePrompt;

#[async_trait]
impl DecisionProvider for ConsolePrompt {
    async fn decide(&self, unit: &UnitId) -> Decision {
        let mut stderr = tokio::io::stderr();
        let question = format!("{unit} already exists. Overwrite it? [y/N] ");
        if stderr.write_all(question.as_bytes()).await.is_err() {
            return Decision::Skip;
        }
        let _ = stderr.flush().await;

        let mut answer = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match stdin.read_line(&mut answer).await {
            Ok(_) => parse_answer(&answer),
            Err(_) => Decision::Skip,
        }
    }
}

fn parse_answer(answer: &str) -> Decision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Decision::Overwrite,
        _ => Decision::Skip,
    }
}

/// The check-and-decide step run before loading any unit.
pub struct Forestall<'a> {
    policy: ConflictPolicy,
    provider: &'a dyn DecisionProvider,
}

impl<'a> Forestall<'a> {
    pub fn new(policy: ConflictPolicy, provider: &'a dyn DecisionProvider) -> Self {
        Self { policy, provider }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Returns whether `unit` should be loaded.
    ///
    /// `delete` removes the existing unit and only runs when the answer is to
    /// replace it. Its errors are the only ones this returns.
    pub async fn decide<F, Fut>(
        &self,
        unit: &UnitId,
        exists: bool,
        delete: F,
    ) -> Result<bool, IngestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), IngestError>>,
    {
        if !exists {
            return Ok(true);
        }
        let decision = match self.policy {
            ConflictPolicy::Overwrite => Decision::Overwrite,
            ConflictPolicy::Conserve => Decision::Skip,
            ConflictPolicy::Ask => self.provider.decide(unit).await,
        };
        match decision {
            Decision::Skip => {
                debug!(unit = %unit, "keeping existing unit");
                Ok(false)
            }
            Decision::Overwrite => {
                info!(unit = %unit, "replacing existing unit");
                delete().await?;
                Ok(true)
            }
        }
    }
}
