//! In-memory stores
//!
//! Process-local implementations of the blob, run, and fingerprint stores for
//! development and tests. Nothing survives a restart.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use finflow_core::{
    ArtifactKind, BlobStore, Fingerprint, FingerprintEntry, FingerprintStore, PipelineRun, PutOutcome, RunId, RunStore,
    StoreError, StoredRecord,
};

/// Content-addressed blobs keyed by fingerprint.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<PutOutcome, StoreError> {
        let blob_ref = format!("mem://{}", fingerprint);
        let mut blobs = self.blobs.write().await;
        let existed = blobs.contains_key(&blob_ref);
        if !existed {
            blobs.insert(blob_ref.clone(), Arc::new(bytes.to_vec()));
        }
        debug!(fingerprint = %fingerprint.short(), existed, "Stored blob");
        Ok(PutOutcome { blob_ref, existed })
    }

    async fn get(&self, blob_ref: &str) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .read()
            .await
            .get(blob_ref)
            .map(|b| b.as_ref().clone())
            .ok_or_else(|| StoreError::NotFound(blob_ref.to_string()))
    }
}

#[derive(Default)]
struct RunTables {
    runs: HashMap<RunId, PipelineRun>,
    by_fingerprint: HashMap<Fingerprint, Vec<RunId>>,
    artifacts: HashMap<RunId, BTreeMap<ArtifactKind, serde_json::Value>>,
    records: HashMap<Fingerprint, Vec<StoredRecord>>,
}

/// Runs, artifacts, and record versions behind a single lock.
#[derive(Clone, Default)]
pub struct MemoryRunStore {
    tables: Arc<RwLock<RunTables>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        tables.runs.insert(run.id, run.clone());
        tables
            .by_fingerprint
            .entry(run.fingerprint.clone())
            .or_default()
            .push(run.id);
        Ok(())
    }

    async fn update(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.runs.get_mut(&run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("run {}", run.id))),
        }
    }

    async fn get(&self, run_id: RunId) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.tables.read().await.runs.get(&run_id).cloned())
    }

    async fn runs_for_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Vec<PipelineRun>, StoreError> {
        let tables = self.tables.read().await;
        let runs = tables
            .by_fingerprint
            .get(fingerprint)
            .map(|ids| ids.iter().filter_map(|id| tables.runs.get(id).cloned()).collect())
            .unwrap_or_default();
        Ok(runs)
    }

    async fn put_artifact(&self, run_id: RunId, kind: ArtifactKind, value: serde_json::Value) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let artifacts = tables.artifacts.entry(run_id).or_default();
        if artifacts.contains_key(&kind) {
            return Err(StoreError::Conflict(format!(
                "artifact {} already written for run {}",
                kind.as_str(),
                run_id
            )));
        }
        artifacts.insert(kind, value);
        Ok(())
    }

    async fn get_artifact(&self, run_id: RunId, kind: ArtifactKind) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .artifacts
            .get(&run_id)
            .and_then(|a| a.get(&kind))
            .cloned())
    }

    async fn put_record(&self, record: StoredRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let versions = tables.records.entry(record.fingerprint.clone()).or_default();
        if versions
            .iter()
            .any(|r| r.pipeline_version == record.pipeline_version && r.run_id == record.run_id)
        {
            return Err(StoreError::Conflict(format!(
                "record {}@{} already stored for run {}",
                record.fingerprint.short(),
                record.pipeline_version,
                record.run_id
            )));
        }
        versions.push(record);
        Ok(())
    }

    async fn records(&self, fingerprint: &Fingerprint) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .records
            .get(fingerprint)
            .cloned()
            .unwrap_or_default())
    }
}

/// Latest-run index per fingerprint.
#[derive(Clone, Default)]
pub struct MemoryFingerprintStore {
    entries: Arc<RwLock<HashMap<Fingerprint, FingerprintEntry>>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<FingerprintEntry>, StoreError> {
        Ok(self.entries.read().await.get(fingerprint).cloned())
    }

    async fn record(&self, entry: FingerprintEntry) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(entry.fingerprint.clone(), entry);
        Ok(())
    }
}
