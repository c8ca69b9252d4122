//! Storage sink backends.
//!
//! Both sinks upsert on `(document_id, pipeline_version)`: writing the same
//! record twice leaves one row.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use finflow_core::{CanonicalRecord, SinkAck, SinkError, StorageSink};

/// Keeps upserted records in memory.
#[derive(Debug, Clone)]
pub struct MemorySink {
    name: String,
    rows: Arc<RwLock<HashMap<String, CanonicalRecord>>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn get(&self, key: &str) -> Option<CanonicalRecord> {
        self.rows.read().await.get(key).cloned()
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<SinkAck, SinkError> {
        let key = record.upsert_key();
        let created = self
            .rows
            .write()
            .await
            .insert(key.clone(), record.clone())
            .is_none();
        Ok(SinkAck {
            target: self.name.clone(),
            key,
            created,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// One JSON file per record version under `<root>/<document_id>/<version>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    name: String,
    root: PathBuf,
}

impl JsonFileSink {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    fn path_for(&self, record: &CanonicalRecord) -> PathBuf {
        self.root
            .join(&record.document_id)
            .join(format!("{}.json", record.pipeline_version))
    }
}

fn io_error(e: std::io::Error) -> SinkError {
    SinkError::Transient(e.to_string())
}

#[async_trait]
impl StorageSink for JsonFileSink {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<SinkAck, SinkError> {
        let path = self.path_for(record);
        let dir = path
            .parent()
            .map(PathBuf::from)
            .ok_or_else(|| SinkError::Permanent(format!("invalid sink path {}", path.display())))?;
        fs::create_dir_all(&dir).await.map_err(io_error)?;

        let bytes = serde_json::to_vec_pretty(record).map_err(|e| SinkError::Permanent(e.to_string()))?;
        let created = !fs::try_exists(&path).await.map_err(io_error)?;

        let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await.map_err(io_error)?;
        file.write_all(&bytes).await.map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;
        drop(file);
        fs::rename(&tmp, &path).await.map_err(io_error)?;

        debug!(sink = %self.name, path = %path.display(), created, "Upserted record");
        Ok(SinkAck {
            target: self.name.clone(),
            key: record.upsert_key(),
            created,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
