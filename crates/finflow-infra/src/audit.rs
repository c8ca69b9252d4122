//! Audit log backends
//!
//! Every backend is append-only. `append` returns only after the event is
//! durable for that backend, which is what lets the orchestrator write the
//! audit event before committing the transition it describes.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use finflow_core::{AuditEvent, AuditOutcome, AuditSink, RunId, StoreError};

/// In-memory audit log (for tests and embedded use)
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditLog {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn count_outcome(&self, outcome: AuditOutcome) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.outcome == outcome)
            .count()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn events_for_run(&self, run_id: RunId) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}

/// Newline-delimited JSON audit file, fsynced per event.
#[derive(Debug, Clone)]
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Arc<Mutex<fs::File>>,
}

impl JsonlAuditLog {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn events_for_run(&self, run_id: RunId) -> Result<Vec<AuditEvent>, StoreError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) if event.run_id == run_id => events.push(event),
                Ok(_) => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "Skipping unreadable audit line"),
            }
        }
        Ok(events)
    }
}

/// Mirrors audit events into structured logs. Keeps nothing queryable.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        match event.outcome {
            AuditOutcome::Failed | AuditOutcome::Rejected => warn!(
                audit = true,
                run_id = %event.run_id,
                from = ?event.from_stage,
                to = %event.to_stage,
                outcome = ?event.outcome,
                pipeline_version = %event.pipeline_version,
                "AUDIT: {}", event.detail
            ),
            _ => info!(
                audit = true,
                run_id = %event.run_id,
                from = ?event.from_stage,
                to = %event.to_stage,
                outcome = ?event.outcome,
                pipeline_version = %event.pipeline_version,
                "AUDIT: {}", event.detail
            ),
        }
        Ok(())
    }

    async fn events_for_run(&self, _run_id: RunId) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(Vec::new())
    }
}

/// Fans an event out to several backends. An append fails if any backend fails.
#[derive(Clone, Default)]
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl AuditSink for CompositeAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<(), StoreError> {
        for sink in &self.sinks {
            sink.append(event).await?;
        }
        Ok(())
    }

    async fn events_for_run(&self, run_id: RunId) -> Result<Vec<AuditEvent>, StoreError> {
        for sink in &self.sinks {
            let events = sink.events_for_run(run_id).await?;
            if !events.is_empty() {
                return Ok(events);
            }
        }
        Ok(Vec::new())
    }
}
