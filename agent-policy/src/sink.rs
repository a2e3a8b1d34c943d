//! Destinations for persisted policy decisions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::decision::PolicyDecision;

/// Failure to persist a batch of decisions.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Underlying I/O failed.
    #[error("decision sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A record could not be encoded or decoded.
    #[error("decision serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The sink is temporarily unable to accept writes.
    #[error("decision sink unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for sink operations.
pub type SinkResult<T> = Result<T, SinkError>;

/// Trait implemented by decision sinks.
#[async_trait]
pub trait DecisionSink: Send + Sync {
    /// Short name used in log events.
    fn name(&self) -> &'static str;

    /// Persists one batch, preserving its order.
    async fn write_batch(&self, batch: &[PolicyDecision]) -> SinkResult<()>;
}

/// Appends decisions to a file, one JSON object per line.
pub struct FileDecisionSink {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl FileDecisionSink {
    /// Opens (or creates) the log file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors encountered while preparing the file.
    pub async fn open(path: impl Into<PathBuf>) -> SinkResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Returns the path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back the most recent `limit` decisions, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates I/O and decoding errors.
    pub async fn tail(&self, limit: usize) -> SinkResult<Vec<PolicyDecision>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let data = fs::read(&self.path).await?;
        let mut records = data
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .map(serde_json::from_slice::<PolicyDecision>)
            .collect::<Result<Vec<PolicyDecision>, _>>()?;

        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}

#[async_trait]
impl DecisionSink for FileDecisionSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn write_batch(&self, batch: &[PolicyDecision]) -> SinkResult<()> {
        let mut buffer = Vec::new();
        for decision in batch {
            serde_json::to_writer(&mut buffer, decision)?;
            buffer.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps decisions in memory, for tests and local inspection.
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryDecisionSink {
    records: Arc<parking_lot::Mutex<Vec<PolicyDecision>>>,
    failures_remaining: Arc<AtomicU32>,
}

impl MemoryDecisionSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every persisted decision, in write order.
    #[must_use]
    pub fn records(&self) -> Vec<PolicyDecision> {
        self.records.lock().clone()
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl DecisionSink for MemoryDecisionSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write_batch(&self, batch: &[PolicyDecision]) -> SinkResult<()> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Unavailable("injected failure".to_owned()));
        }
        self.records.lock().extend_from_slice(batch);
        Ok(())
    }
}

/// Ships each decision as a structured `tracing` event for an external log
/// collector to pick up.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDecisionSink;

#[async_trait]
impl DecisionSink for TracingDecisionSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn write_batch(&self, batch: &[PolicyDecision]) -> SinkResult<()> {
        for decision in batch {
            let record = serde_json::to_string(decision)?;
            info!(
                target: "agentwatch::decisions",
                decision_id = %decision.decision_id(),
                decision_type = %decision.decision_type(),
                result = %decision.result(),
                tool = ?decision.tool_name(),
                agent = ?decision.agent_id(),
                record = %record,
                "policy decision"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::contracts::DecisionType;
    use crate::decision::DecisionResult;

    fn temp_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("agentwatch-decisions-{}", Uuid::new_v4()));
        path.push("decisions.jsonl");
        path
    }

    fn decision(reason: &str) -> PolicyDecision {
        PolicyDecision::new(DecisionType::InputValidation, DecisionResult::Allow, reason)
    }

    #[tokio::test]
    async fn file_sink_writes_one_record_per_line() {
        let path = temp_path();
        let sink = FileDecisionSink::open(&path).await.unwrap();

        sink.write_batch(&[decision("one"), decision("two")]).await.unwrap();
        sink.write_batch(&[decision("three")]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);

        let tail = sink.tail(2).await.unwrap();
        let reasons: Vec<&str> = tail.iter().map(PolicyDecision::reason).collect();
        assert_eq!(reasons, ["two", "three"]);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn memory_sink_injects_failures() {
        let sink = MemoryDecisionSink::new();
        sink.fail_next(1);

        assert!(sink.write_batch(&[decision("lost")]).await.is_err());
        sink.write_batch(&[decision("kept")]).await.unwrap();

        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.records()[0].reason(), "kept");
    }
}
