//! Filesystem-backed stores
//!
//! Layout under the root directory:
//!
//! ```text
//! blobs/<shard>/<fingerprint>
//! runs/<run_id>.json
//! artifacts/<run_id>/<kind>.json
//! fingerprints/<shard>/<fingerprint>.json      latest entry
//! fingerprints/<shard>/<fingerprint>.runs      run ids, one per line
//! records/<shard>/<fingerprint>/<n>-<version>-<run_id>.json
//! ```
//!
//! Every file is written to a temp sibling and renamed into place, so readers
//! never observe partial content.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use finflow_core::{
    ArtifactKind, BlobStore, Fingerprint, FingerprintEntry, FingerprintStore, PipelineRun, PutOutcome, RunId, RunStore,
    StoreError, StoredRecord,
};

/// Blob, run, and fingerprint stores rooted at one directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    /// Serializes read-modify-write sequences within this process
    write_lock: Arc<Mutex<()>>,
}

impl FsStore {
    /// Open (and create if missing) a store at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["blobs", "runs", "artifacts", "fingerprints", "records"] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        debug!(root = %root.display(), "Opened filesystem store");
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join("blobs")
            .join(fingerprint.shard())
            .join(fingerprint.as_str())
    }

    fn run_path(&self, run_id: RunId) -> PathBuf {
        self.root.join("runs").join(format!("{}.json", run_id))
    }

    fn artifact_path(&self, run_id: RunId, kind: ArtifactKind) -> PathBuf {
        self.root
            .join("artifacts")
            .join(run_id.to_string())
            .join(format!("{}.json", kind.as_str()))
    }

    fn fingerprint_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join("fingerprints").join(fingerprint.shard())
    }

    fn records_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join("records")
            .join(fingerprint.shard())
            .join(fingerprint.as_str())
    }

    /// Resolve a blob reference produced by `put` to a path inside the store.
    fn resolve_blob_ref(&self, blob_ref: &str) -> Result<PathBuf, StoreError> {
        let fingerprint = blob_ref
            .strip_prefix("blobs/")
            .and_then(|rest| rest.split('/').nth(1))
            .ok_or_else(|| StoreError::NotFound(blob_ref.to_string()))?;
        let fingerprint = Fingerprint::parse(fingerprint).map_err(|_| StoreError::NotFound(blob_ref.to_string()))?;
        Ok(self.blob_path(&fingerprint))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Io(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(parent).await?;

    let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path).await {
        if let Err(cleanup) = fs::remove_file(&tmp).await {
            warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temp file");
        }
        return Err(e.into());
    }
    Ok(())
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl BlobStore for FsStore {
    async fn put(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<PutOutcome, StoreError> {
        let path = self.blob_path(fingerprint);
        let blob_ref = format!("blobs/{}/{}", fingerprint.shard(), fingerprint);

        if fs::try_exists(&path).await? {
            debug!(fingerprint = %fingerprint.short(), "Blob already present");
            return Ok(PutOutcome {
                blob_ref,
                existed: true,
            });
        }

        write_atomic(&path, bytes).await?;
        debug!(fingerprint = %fingerprint.short(), size = bytes.len(), "Stored blob");
        Ok(PutOutcome {
            blob_ref,
            existed: false,
        })
    }

    async fn get(&self, blob_ref: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve_blob_ref(blob_ref)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(blob_ref.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RunStore for FsStore {
    async fn create(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.run_path(run.id);
        if fs::try_exists(&path).await? {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        write_json(&path, run).await?;

        let index = self
            .fingerprint_dir(&run.fingerprint)
            .join(format!("{}.runs", run.fingerprint));
        fs::create_dir_all(self.fingerprint_dir(&run.fingerprint)).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index)
            .await?;
        file.write_all(format!("{}\n", run.id).as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn update(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let path = self.run_path(run.id);
        if !fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(format!("run {}", run.id)));
        }
        write_json(&path, run).await
    }

    async fn get(&self, run_id: RunId) -> Result<Option<PipelineRun>, StoreError> {
        read_json(&self.run_path(run_id)).await
    }

    async fn runs_for_fingerprint(&self, fingerprint: &Fingerprint) -> Result<Vec<PipelineRun>, StoreError> {
        let index = self
            .fingerprint_dir(fingerprint)
            .join(format!("{}.runs", fingerprint));
        let contents = match fs::read_to_string(&index).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let run_id: RunId = line
                .parse()
                .map_err(|_| StoreError::Serialization(format!("bad run id in index: {}", line)))?;
            if let Some(run) = RunStore::get(self, run_id).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn put_artifact(&self, run_id: RunId, kind: ArtifactKind, value: serde_json::Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.artifact_path(run_id, kind);
        if fs::try_exists(&path).await? {
            return Err(StoreError::Conflict(format!(
                "artifact {} already written for run {}",
                kind.as_str(),
                run_id
            )));
        }
        write_json(&path, &value).await
    }

    async fn get_artifact(&self, run_id: RunId, kind: ArtifactKind) -> Result<Option<serde_json::Value>, StoreError> {
        read_json(&self.artifact_path(run_id, kind)).await
    }

    async fn put_record(&self, record: StoredRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let dir = self.records_dir(&record.fingerprint);
        fs::create_dir_all(&dir).await?;

        let mut count = 0usize;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".json") {
                continue;
            }
            count += 1;
            if name.contains(&record.run_id.to_string()) {
                return Err(StoreError::Conflict(format!(
                    "record already stored for run {}",
                    record.run_id
                )));
            }
        }

        let path = dir.join(format!(
            "{:06}-{}-{}.json",
            count, record.pipeline_version, record.run_id
        ));
        write_json(&path, &record).await
    }

    async fn records(&self, fingerprint: &Fingerprint) -> Result<Vec<StoredRecord>, StoreError> {
        let dir = self.records_dir(fingerprint);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(record) = read_json(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl FingerprintStore for FsStore {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<FingerprintEntry>, StoreError> {
        read_json(&self.fingerprint_dir(fingerprint).join(format!("{}.json", fingerprint))).await
    }

    async fn record(&self, entry: FingerprintEntry) -> Result<(), StoreError> {
        let path = self
            .fingerprint_dir(&entry.fingerprint)
            .join(format!("{}.json", entry.fingerprint));
        write_json(&path, &entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use finflow_core::{PipelineVersion, SourceMetadata, Stage};

    #[tokio::test]
    async fn test_blob_roundtrip_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let fp = Fingerprint::of(b"%PDF-1.7 body");

        let first = store.put(&fp, b"%PDF-1.7 body").await.unwrap();
        let second = store.put(&fp, b"%PDF-1.7 body").await.unwrap();
        assert!(!first.existed);
        assert!(second.existed);

        let bytes = BlobStore::get(&store, &first.blob_ref).await.unwrap();
        assert_eq!(bytes, b"%PDF-1.7 body".to_vec());
        assert!(matches!(BlobStore::get(&store, "blobs/zz/nope").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_runs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let fp = Fingerprint::of(b"doc");
        let mut run = PipelineRun::new(fp.clone(), PipelineVersion::new("1"), SourceMetadata::new());

        {
            let store = FsStore::open(dir.path()).await.unwrap();
            store.create(&run).await.unwrap();
            run.advance(Stage::Classified).unwrap();
            store.update(&run).await.unwrap();
            store
                .put_artifact(run.id, ArtifactKind::Classification, serde_json::json!({"confidence": 0.9}))
                .await
                .unwrap();
        }

        let store = FsStore::open(dir.path()).await.unwrap();
        let loaded = RunStore::get(&store, run.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Classified);

        let runs = store.runs_for_fingerprint(&fp).await.unwrap();
        assert_eq!(runs.len(), 1);

        let artifact = store
            .get_artifact(run.id, ArtifactKind::Classification)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact["confidence"], 0.9);

        let dup = store
            .put_artifact(run.id, ArtifactKind::Classification, serde_json::json!({}))
            .await;
        assert!(matches!(dup, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_records_keep_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let fp = Fingerprint::of(b"doc");

        for version in ["1", "2"] {
            store
                .put_record(StoredRecord {
                    fingerprint: fp.clone(),
                    pipeline_version: PipelineVersion::new(version),
                    run_id: RunId::new(),
                    stored_at: Utc::now(),
                    record: serde_json::json!({"version": version}),
                })
                .await
                .unwrap();
        }

        let records = store.records(&fp).await.unwrap();
        let versions: Vec<_> = records.iter().map(|r| r.pipeline_version.as_str().to_string()).collect();
        assert_eq!(versions, vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn test_fingerprint_entry_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let fp = Fingerprint::of(b"doc");
        assert!(store.lookup(&fp).await.unwrap().is_none());

        let entry = FingerprintEntry {
            fingerprint: fp.clone(),
            run_id: RunId::new(),
            stage: Stage::Loaded,
            pipeline_version: PipelineVersion::new("1"),
            recorded_at: Utc::now(),
        };
        store.record(entry.clone()).await.unwrap();
        assert_eq!(store.lookup(&fp).await.unwrap(), Some(entry));
    }
}
