//! Orchestrator
//!
//! Owns the run lifecycle. It is the only component that commits stage
//! transitions, and every transition is appended to the audit sink before
//! the run record is updated. One task drives each run; CPU stages and I/O
//! stages draw permits from separate bulkheads.

use chrono::Utc;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use finflow_core::{
    metric_names, ArtifactKind, AuditEvent, AuditOutcome, AuditSink, BlobStore, CanonicalRecord, Classification,
    CoreError, ErrorClass, ExtractionAdapter, Fingerprint, FingerprintEntry, FingerprintStore, Lease, LeaseManager,
    LeaseOutcome, LoadTargetStatus, MetricEvent, MetricsSink, PageError, PipelineRun, PipelineSettings,
    PipelineVersion, RawExtraction, RunId, RunIssue, RunStatus, RunStore, RunStoreExt, SourceMetadata, Stage,
    StagedDocument, StatusReport, StorageSink, StoreError, StoredRecord, ValidationResult,
};
use finflow_infra::{
    Attempted, Bulkhead, BulkheadPermit, InMemoryAuditLog, MemoryBlobStore, MemoryFingerprintStore,
    MemoryLeaseManager, MemoryRunStore, MemorySink, NoopMetrics,
};

use crate::{
    paginate, Classifier, ExtractionCoordinator, FanoutWriter, JobPlan, PipelineError, ResourcePool, Result,
    StagingIntake, TextLayerExtractor, Transformer, Validator,
};

/// Pause between admission attempts while another submission of the same
/// fingerprint is still being admitted.
const ADMISSION_POLL: Duration = Duration::from_millis(10);

/// How a submission was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A new run was started
    Started,
    /// Another live run holds the fingerprint; its id is returned
    InFlight,
    /// Answered from a previous terminal run of the same version
    CacheHit,
    /// The document was refused at intake
    Failed,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Started => "started",
            Disposition::InFlight => "in_flight",
            Disposition::CacheHit => "cache_hit",
            Disposition::Failed => "failed",
        }
    }
}

/// Answer to `submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub run_id: RunId,
    pub fingerprint: Fingerprint,
    pub stage: Stage,
    pub status: RunStatus,
    pub disposition: Disposition,
}

impl Submission {
    fn of(run: &PipelineRun, disposition: Disposition) -> Self {
        Self {
            run_id: run.id,
            fingerprint: run.fingerprint.clone(),
            stage: run.stage,
            status: run.status,
            disposition,
        }
    }
}

/// Answer to `replay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayHandle {
    pub new_run_id: RunId,
    pub pipeline_version: PipelineVersion,
    pub replay_of: RunId,
    /// First stage recomputed by the new run
    pub from_stage: Stage,
}

/// A page that produced no usable output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageFailure {
    pub page_index: u32,
    pub attempts: u32,
    pub error: PageError,
}

/// Everything a run produced so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub fingerprint: Fingerprint,
    pub stage: Stage,
    pub status: RunStatus,
    pub pipeline_version: PipelineVersion,
    pub classification: Option<Classification>,
    pub canonical_record: Option<CanonicalRecord>,
    pub validation: Option<ValidationResult>,
    /// Final sink statuses, or the pending plan when loading never finished
    pub load_targets: Vec<LoadTargetStatus>,
    pub page_errors: Vec<PageFailure>,
    pub errors: Vec<RunIssue>,
}

/// Wires collaborators into an [`Orchestrator`]. Anything not supplied
/// falls back to a process-local backend.
pub struct OrchestratorBuilder {
    settings: PipelineSettings,
    blobs: Option<Arc<dyn BlobStore>>,
    runs: Option<Arc<dyn RunStore>>,
    fingerprints: Option<Arc<dyn FingerprintStore>>,
    leases: Option<Arc<dyn LeaseManager>>,
    audit: Option<Arc<dyn AuditSink>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    adapter: Option<Arc<dyn ExtractionAdapter>>,
    sinks: Vec<Arc<dyn StorageSink>>,
}

impl OrchestratorBuilder {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            blobs: None,
            runs: None,
            fingerprints: None,
            leases: None,
            audit: None,
            metrics: None,
            adapter: None,
            sinks: Vec::new(),
        }
    }

    /// Use one backend for blobs, runs and the fingerprint index.
    pub fn with_store<S>(self, store: Arc<S>) -> Self
    where
        S: BlobStore + RunStore + FingerprintStore + 'static,
    {
        self.with_blob_store(store.clone())
            .with_run_store(store.clone())
            .with_fingerprint_store(store)
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_run_store(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn with_fingerprint_store(mut self, fingerprints: Arc<dyn FingerprintStore>) -> Self {
        self.fingerprints = Some(fingerprints);
        self
    }

    pub fn with_leases(mut self, leases: Arc<dyn LeaseManager>) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ExtractionAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Register a sink. Its name must match a configured `load.sinks` entry.
    pub fn with_sink(mut self, sink: Arc<dyn StorageSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let settings = self.settings;
        settings.validate()?;

        let version = settings.version();
        let plan = JobPlan::from_settings(&settings);
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let blobs = self.blobs.unwrap_or_else(|| Arc::new(MemoryBlobStore::new()));
        let adapter = self.adapter.unwrap_or_else(|| Arc::new(TextLayerExtractor::new()));

        for sink in &self.sinks {
            if settings.load.sink(sink.name()).is_none() {
                return Err(CoreError::InvalidSettings(format!(
                    "sink '{}' is registered but not configured",
                    sink.name()
                ))
                .into());
            }
        }

        let mut fanout = FanoutWriter::new(settings.load.concurrency).with_metrics(metrics.clone());
        for sink_settings in &settings.load.sinks {
            let sink: Arc<dyn StorageSink> = if self.sinks.is_empty() {
                Arc::new(MemorySink::new(sink_settings.name.clone()))
            } else {
                self.sinks
                    .iter()
                    .find(|s| s.name() == sink_settings.name)
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::InvalidSettings(format!("no sink registered for '{}'", sink_settings.name))
                    })?
            };
            fanout = fanout.with_sink(sink, sink_settings.clone());
        }

        let extraction = ExtractionCoordinator::new(
            adapter,
            settings.extraction.workers,
            plan.timeout(Stage::Extracted)
                .unwrap_or_else(|| settings.extraction.page_timeout()),
            plan.retry_policy(Stage::Extracted),
        );

        let inner = Inner {
            intake: StagingIntake::new(
                blobs.clone(),
                settings.intake.max_document_bytes,
                plan.retry_policy(Stage::Ingested),
            ),
            classifier: Classifier::new(settings.classifier.clone()),
            extraction,
            transformer: Transformer::new(settings.transform.clone(), version.clone()),
            validator: Validator::new(settings.validation.clone()),
            fanout,
            cpu: Bulkhead::new(ResourcePool::Cpu.as_str(), settings.runtime.cpu_workers),
            io: Bulkhead::new(ResourcePool::Io.as_str(), settings.runtime.io_workers),
            blobs,
            runs: self.runs.unwrap_or_else(|| Arc::new(MemoryRunStore::new())),
            fingerprints: self
                .fingerprints
                .unwrap_or_else(|| Arc::new(MemoryFingerprintStore::new())),
            leases: self.leases.unwrap_or_else(|| Arc::new(MemoryLeaseManager::new())),
            audit: self.audit.unwrap_or_else(|| Arc::new(InMemoryAuditLog::new())),
            metrics,
            active: DashMap::new(),
            version,
            plan,
            settings,
        };

        info!(
            version = %inner.version,
            adapter = inner.extraction.adapter_name(),
            sinks = inner.fanout.bindings().len(),
            "Orchestrator ready"
        );
        Ok(Orchestrator { inner: Arc::new(inner) })
    }
}

/// Boundary of the pipeline: submit, query, replay, cancel.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(settings: PipelineSettings) -> OrchestratorBuilder {
        OrchestratorBuilder::new(settings)
    }

    pub fn version(&self) -> &PipelineVersion {
        &self.inner.version
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    /// Fingerprint, deduplicate and stage a document, then start its run in
    /// the background. Identical bytes never get two live runs.
    pub async fn submit(&self, bytes: Vec<u8>, source: SourceMetadata) -> Result<Submission> {
        let inner = &self.inner;
        let fingerprint = Fingerprint::of(&bytes);
        let run = PipelineRun::new(fingerprint.clone(), inner.version.clone(), source);
        info!(
            run_id = %run.id,
            fingerprint = %fingerprint.short(),
            bytes = bytes.len(),
            "Document submitted"
        );

        let lease = loop {
            if let Some(entry) = inner.cached(&fingerprint).await? {
                let submission = inner.answer_from_cache(entry).await?;
                inner.count_submission(submission.disposition);
                return Ok(submission);
            }
            match inner
                .leases
                .acquire(&fingerprint, run.id, inner.settings.runtime.lease_ttl())
                .await?
            {
                LeaseOutcome::Acquired(lease) => break lease,
                LeaseOutcome::Held { run_id } => {
                    if let Some(submission) = inner.in_flight(run_id, &fingerprint).await? {
                        inner.count_submission(submission.disposition);
                        return Ok(submission);
                    }
                    tokio::time::sleep(ADMISSION_POLL).await;
                }
            }
        };

        let submission = match inner.admit(run, Arc::from(bytes), &lease).await {
            Ok(Admission::Started(submission, ctx)) => {
                inner.clone().spawn(ctx);
                submission
            }
            Ok(Admission::Settled(submission)) => {
                inner.release(&lease).await;
                submission
            }
            Err(e) => {
                inner.release(&lease).await;
                return Err(e);
            }
        };
        inner.count_submission(submission.disposition);
        Ok(submission)
    }

    /// Last durably committed state plus the most recent error detail.
    pub async fn get_status(&self, run_id: RunId) -> Result<StatusReport> {
        let run = self.inner.run(run_id).await?;
        Ok(StatusReport::from(&run))
    }

    pub async fn get_result(&self, run_id: RunId) -> Result<RunResult> {
        let inner = &self.inner;
        let run = inner.run(run_id).await?;

        let classification: Option<Classification> =
            inner.runs.get_typed(run_id, ArtifactKind::Classification).await?;
        let extraction: Option<RawExtraction> = inner.runs.get_typed(run_id, ArtifactKind::Extraction).await?;
        let canonical_record: Option<CanonicalRecord> = inner.runs.get_typed(run_id, ArtifactKind::Record).await?;
        let validation: Option<ValidationResult> = inner.runs.get_typed(run_id, ArtifactKind::Validation).await?;
        let load_targets = match inner
            .runs
            .get_typed::<Vec<LoadTargetStatus>>(run_id, ArtifactKind::LoadTargets)
            .await?
        {
            Some(targets) => targets,
            None => inner
                .runs
                .get_typed::<Vec<LoadTargetStatus>>(run_id, ArtifactKind::LoadPlan)
                .await?
                .unwrap_or_default(),
        };

        let page_errors: Vec<PageFailure> = extraction
            .map(|raw| {
                raw.pages
                    .into_iter()
                    .filter_map(|page| {
                        page.error.map(|error| PageFailure {
                            page_index: page.page_index,
                            attempts: page.attempts,
                            error,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(RunResult {
            run_id,
            fingerprint: run.fingerprint,
            stage: run.stage,
            status: run.status,
            pipeline_version: run.pipeline_version,
            classification,
            canonical_record,
            validation,
            load_targets,
            page_errors,
            errors: run.errors,
        })
    }

    /// Re-run a fingerprint under this orchestrator's pipeline version.
    ///
    /// Stages before `from_stage` (default `CLASSIFIED`) reuse the artifacts
    /// of the latest run that got that far; the rest are recomputed. The
    /// source run and its audit trail are left untouched.
    pub async fn replay(&self, fingerprint: &Fingerprint, from_stage: Option<Stage>) -> Result<ReplayHandle> {
        let inner = &self.inner;
        let from_stage = match from_stage.unwrap_or(Stage::Classified) {
            Stage::Ingested => Stage::Classified,
            stage if stage.ordinal().is_some() => stage,
            stage => {
                return Err(PipelineError::InvalidReplay(format!(
                    "cannot replay from terminal stage {}",
                    stage
                )))
            }
        };

        let (source, staged) = inner.replay_source(fingerprint, from_stage).await?;
        let run = PipelineRun::new(fingerprint.clone(), inner.version.clone(), source.source.clone())
            .replaying(source.id);

        let lease = match inner
            .leases
            .acquire(fingerprint, run.id, inner.settings.runtime.lease_ttl())
            .await?
        {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::Held { run_id } => return Err(PipelineError::LeaseHeld(run_id)),
        };

        match inner.admit_replay(run, &source, staged, from_stage, &lease).await {
            Ok((handle, ctx)) => {
                inner.clone().spawn(ctx);
                Ok(handle)
            }
            Err(e) => {
                inner.release(&lease).await;
                Err(e)
            }
        }
    }

    /// Request cancellation; honored at the next stage boundary. Returns
    /// false when the run is not in flight.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.inner.active.get(&run_id) {
            Some(active) => {
                info!(run_id = %run_id, "Cancellation requested");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Resolve once the run reaches a terminal stage.
    pub async fn wait(&self, run_id: RunId) -> Result<StatusReport> {
        let watcher = self.inner.active.get(&run_id).map(|active| active.stage.clone());
        if let Some(mut watcher) = watcher {
            // A closed channel means the driver is gone; the store has the final word.
            let _ = watcher.wait_for(|stage| stage.is_terminal()).await;
        }
        self.get_status(run_id).await
    }

    /// Durable audit events of a run, in append order.
    pub async fn audit_trail(&self, run_id: RunId) -> Result<Vec<AuditEvent>> {
        Ok(self.inner.audit.events_for_run(run_id).await?)
    }

    /// Every canonical record version stored for a fingerprint.
    pub async fn records(&self, fingerprint: &Fingerprint) -> Result<Vec<StoredRecord>> {
        Ok(self.inner.runs.records(fingerprint).await?)
    }

    /// Every run of a fingerprint, oldest first.
    pub async fn runs(&self, fingerprint: &Fingerprint) -> Result<Vec<PipelineRun>> {
        Ok(self.inner.runs.runs_for_fingerprint(fingerprint).await?)
    }

    /// Number of runs currently driven by this orchestrator.
    pub fn active_runs(&self) -> usize {
        self.inner.active.len()
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    stage: watch::Receiver<Stage>,
}

/// Keeps a run's lease alive while its driver works, independent of how long
/// any one stage takes.
struct Heartbeat {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    fn start(leases: Arc<dyn LeaseManager>, lease: Lease, ttl: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let stopped = shutdown.clone();
        let period = (ttl / 3).max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = leases.renew(&lease, ttl).await {
                            warn!(run_id = %lease.run_id, error = %e, "Lease heartbeat stopped");
                            break;
                        }
                        debug!(run_id = %lease.run_id, "Lease renewed");
                    }
                }
            }
        });
        Self { shutdown, task }
    }

    /// Stop renewing; returns once no renewal is in progress.
    async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Replay source: reuse its artifacts for stages before `from_stage`.
struct Reuse {
    source: RunId,
    from_stage: Stage,
}

/// State owned by the task driving one run.
struct RunContext {
    run: PipelineRun,
    lease: Lease,
    staged: StagedDocument,
    bytes: Arc<[u8]>,
    reuse: Option<Reuse>,
    cancel: CancellationToken,
    notify: watch::Sender<Stage>,
    stage_started: Instant,
}

enum Admission {
    /// Run created; the lease passes to the driver
    Started(Submission, RunContext),
    /// Answered without a driver; the lease goes back
    Settled(Submission),
}

struct Inner {
    settings: PipelineSettings,
    version: PipelineVersion,
    plan: JobPlan,
    blobs: Arc<dyn BlobStore>,
    runs: Arc<dyn RunStore>,
    fingerprints: Arc<dyn FingerprintStore>,
    leases: Arc<dyn LeaseManager>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<dyn MetricsSink>,
    intake: StagingIntake,
    classifier: Classifier,
    extraction: ExtractionCoordinator,
    transformer: Transformer,
    validator: Validator,
    fanout: FanoutWriter,
    cpu: Bulkhead,
    io: Bulkhead,
    active: DashMap<RunId, ActiveRun>,
}

impl Inner {
    async fn run(&self, run_id: RunId) -> Result<PipelineRun> {
        self.runs
            .get(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    // Admission

    async fn admit(&self, mut run: PipelineRun, bytes: Arc<[u8]>, lease: &Lease) -> Result<Admission> {
        // The previous holder may have settled between the cache check and the lease.
        if let Some(entry) = self.cached(&run.fingerprint).await? {
            return self.answer_from_cache(entry).await.map(Admission::Settled);
        }

        let format = match self.intake.inspect(&bytes, run.source.filename.as_deref()) {
            Ok(format) => format,
            Err(e) => {
                self.fail_at_intake(&mut run, e).await?;
                return Ok(Admission::Settled(Submission::of(&run, Disposition::Failed)));
            }
        };

        let staged = {
            let _permit = self.permit(Stage::Ingested).await?;
            self.intake.stage(&run.fingerprint, &bytes, &format).await
        };
        let staged = match staged {
            Ok(Attempted { value, attempts }) => {
                self.record_attempts(&mut run, Stage::Ingested, attempts);
                value
            }
            Err(Attempted { value, attempts }) => {
                self.record_attempts(&mut run, Stage::Ingested, attempts);
                let error = PipelineError::Exhausted {
                    message: format!("staging failed: {}", value),
                    attempts,
                };
                self.fail_at_intake(&mut run, error).await?;
                return Ok(Admission::Settled(Submission::of(&run, Disposition::Failed)));
            }
        };

        // Registered first: a persisted run is always waitable.
        let ctx = self.register(run, lease.clone(), staged, bytes, None);
        if let Err(e) = self.persist_admission(&ctx).await {
            self.active.remove(&ctx.run.id);
            return Err(e);
        }
        Ok(Admission::Started(Submission::of(&ctx.run, Disposition::Started), ctx))
    }

    async fn persist_admission(&self, ctx: &RunContext) -> Result<()> {
        let (run, staged) = (&ctx.run, &ctx.staged);
        let event = AuditEvent::new(run.id, run.pipeline_version.clone(), Stage::Ingested, AuditOutcome::Advanced)
            .with_detail(json!({
                "mime_type": staged.mime_type,
                "page_count": staged.page_count,
                "size_bytes": staged.size_bytes,
                "attempts": run.attempts(Stage::Ingested),
            }));
        self.audit.append(&event).await.map_err(PipelineError::Audit)?;
        self.runs.create(run).await?;
        self.runs.put_typed(run.id, ArtifactKind::Staged, staged).await?;
        self.emit_transition(Stage::Ingested, AuditOutcome::Advanced);

        info!(
            run_id = %run.id,
            mime_type = %staged.mime_type,
            pages = staged.page_count,
            "Document staged"
        );
        Ok(())
    }

    /// Latest terminal outcome worth answering from: `LOADED` or `REJECTED`
    /// under the current version.
    async fn cached(&self, fingerprint: &Fingerprint) -> Result<Option<FingerprintEntry>> {
        Ok(self.fingerprints.lookup(fingerprint).await?.filter(|entry| {
            matches!(entry.stage, Stage::Loaded | Stage::Rejected) && entry.pipeline_version == self.version
        }))
    }

    async fn answer_from_cache(&self, entry: FingerprintEntry) -> Result<Submission> {
        let event = AuditEvent::new(entry.run_id, self.version.clone(), entry.stage, AuditOutcome::CacheHit)
            .from_stage(entry.stage)
            .with_detail(json!({ "fingerprint": entry.fingerprint }));
        self.audit.append(&event).await.map_err(PipelineError::Audit)?;
        self.metrics.emit(MetricEvent::counter(metric_names::CACHE_HITS));

        info!(
            run_id = %entry.run_id,
            fingerprint = %entry.fingerprint.short(),
            stage = %entry.stage,
            "Answered from cache"
        );
        Ok(Submission {
            run_id: entry.run_id,
            fingerprint: entry.fingerprint,
            stage: entry.stage,
            status: RunStatus::for_stage(entry.stage),
            disposition: Disposition::CacheHit,
        })
    }

    /// The holder's run, once it is persisted and still live. `None` while the
    /// holder is being admitted or is settling; the caller retries.
    async fn in_flight(&self, run_id: RunId, fingerprint: &Fingerprint) -> Result<Option<Submission>> {
        let Some(run) = self.runs.get(run_id).await? else {
            debug!(run_id = %run_id, fingerprint = %fingerprint.short(), "Lease holder not admitted yet");
            return Ok(None);
        };
        if run.status != RunStatus::Running {
            return Ok(None);
        }
        info!(run_id = %run_id, fingerprint = %fingerprint.short(), "Fingerprint already in flight");
        Ok(Some(Submission::of(&run, Disposition::InFlight)))
    }

    /// Persist a run that never got past intake.
    async fn fail_at_intake(&self, run: &mut PipelineRun, error: PipelineError) -> Result<()> {
        let class = error.class();
        let event = AuditEvent::new(run.id, run.pipeline_version.clone(), Stage::Failed, AuditOutcome::Failed)
            .with_detail(json!({ "stage": Stage::Ingested, "class": class, "error": error.to_string() }));
        self.audit.append(&event).await.map_err(PipelineError::Audit)?;

        run.push_issue(RunIssue::new(Stage::Ingested, class, error.to_string()));
        run.advance(Stage::Failed)?;
        self.runs.create(run).await?;
        self.emit_transition(Stage::Failed, AuditOutcome::Failed);

        warn!(run_id = %run.id, fingerprint = %run.fingerprint.short(), error = %error, "Intake failed");
        Ok(())
    }

    async fn replay_source(&self, fingerprint: &Fingerprint, from_stage: Stage) -> Result<(PipelineRun, StagedDocument)> {
        let history = self.runs.runs_for_fingerprint(fingerprint).await?;
        let required = from_stage
            .ordinal()
            .and_then(|i| i.checked_sub(1))
            .map(|i| Stage::LIFECYCLE[i])
            .unwrap_or(Stage::Ingested);

        for run in history.iter().rev().filter(|run| run.progress_stage >= required) {
            if let Some(staged) = self.runs.get_typed::<StagedDocument>(run.id, ArtifactKind::Staged).await? {
                return Ok((run.clone(), staged));
            }
        }
        Err(PipelineError::NothingToReplay(fingerprint.to_string()))
    }

    async fn admit_replay(
        &self,
        run: PipelineRun,
        source: &PipelineRun,
        staged: StagedDocument,
        from_stage: Stage,
        lease: &Lease,
    ) -> Result<(ReplayHandle, RunContext)> {
        let bytes = self.blobs.get(&staged.raw_bytes_ref).await?;

        let event = AuditEvent::new(run.id, run.pipeline_version.clone(), Stage::Ingested, AuditOutcome::Reused)
            .with_detail(json!({
                "replay_of": source.id,
                "source_version": source.pipeline_version,
                "from_stage": from_stage,
            }));
        self.audit.append(&event).await.map_err(PipelineError::Audit)?;
        self.runs.create(&run).await?;
        self.runs.put_typed(run.id, ArtifactKind::Staged, &staged).await?;
        self.emit_transition(Stage::Ingested, AuditOutcome::Reused);

        info!(
            run_id = %run.id,
            replay_of = %source.id,
            from_stage = %from_stage,
            version = %run.pipeline_version,
            "Replay started"
        );
        let handle = ReplayHandle {
            new_run_id: run.id,
            pipeline_version: run.pipeline_version.clone(),
            replay_of: source.id,
            from_stage,
        };
        let reuse = Reuse {
            source: source.id,
            from_stage,
        };
        let ctx = self.register(run, lease.clone(), staged, Arc::from(bytes), Some(reuse));
        Ok((handle, ctx))
    }

    fn register(
        &self,
        run: PipelineRun,
        lease: Lease,
        staged: StagedDocument,
        bytes: Arc<[u8]>,
        reuse: Option<Reuse>,
    ) -> RunContext {
        let cancel = CancellationToken::new();
        let (notify, watcher) = watch::channel(run.stage);
        self.active.insert(
            run.id,
            ActiveRun {
                cancel: cancel.clone(),
                stage: watcher,
            },
        );
        RunContext {
            run,
            lease,
            staged,
            bytes,
            reuse,
            cancel,
            notify,
            stage_started: Instant::now(),
        }
    }

    // Driving

    fn spawn(self: Arc<Self>, ctx: RunContext) {
        tokio::spawn(self.drive(ctx));
    }

    async fn drive(self: Arc<Self>, mut ctx: RunContext) {
        let heartbeat = Heartbeat::start(self.leases.clone(), ctx.lease.clone(), self.settings.runtime.lease_ttl());
        if let Err(error) = self.execute(&mut ctx).await {
            self.fail(&mut ctx, error).await;
        }
        heartbeat.stop().await;
        self.release(&ctx.lease).await;
        self.active.remove(&ctx.run.id);
        // Waiters wake only once the lease is free for the next submission.
        ctx.notify.send_replace(ctx.run.stage);
        debug!(run_id = %ctx.run.id, stage = %ctx.run.stage, "Run driver finished");
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let classification = self.classify(ctx).await?;
        let raw = self.extract(ctx).await?;
        let record = self.transform(ctx, &classification, &raw).await?;
        let validation = self.validate(ctx, &record).await?;

        if !validation.is_valid {
            self.metrics
                .emit(MetricEvent::counter(metric_names::VALIDATION_FAILURES).with_label("version", self.version.as_str()));
            let reason = validation
                .errors
                .iter()
                .map(|issue| issue.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PipelineError::Rejected {
                reason,
                detail: serde_json::to_value(&validation).unwrap_or(serde_json::Value::Null),
            });
        }

        self.load(ctx, &record).await
    }

    async fn classify(&self, ctx: &mut RunContext) -> Result<Classification> {
        self.checkpoint(ctx).await?;
        if let Some(classification) = self.reused::<Classification>(ctx, ArtifactKind::Classification).await? {
            self.commit(ctx, ArtifactKind::Classification, &classification, AuditOutcome::Reused, json!({}))
                .await?;
            return Ok(classification);
        }

        let classifier = self.classifier.clone();
        let staged = ctx.staged.clone();
        let bytes = ctx.bytes.clone();
        let classification = self
            .run_cpu(Stage::Classified, move || classifier.classify_or_default(&staged, &bytes))
            .await?;

        ctx.run.set_attempts(Stage::Classified, 1);
        let detail = json!({
            "document_type": classification.document_type,
            "is_scanned": classification.is_scanned,
            "has_tables": classification.has_tables,
            "defaulted": classification.defaulted,
        });
        self.commit(ctx, ArtifactKind::Classification, &classification, AuditOutcome::Advanced, detail)
            .await?;
        Ok(classification)
    }

    async fn extract(&self, ctx: &mut RunContext) -> Result<RawExtraction> {
        self.checkpoint(ctx).await?;
        let (raw, outcome) = match self.reused::<RawExtraction>(ctx, ArtifactKind::Extraction).await? {
            Some(raw) => (raw, AuditOutcome::Reused),
            None => {
                let pages = paginate(&ctx.staged, &ctx.bytes);
                let raw = {
                    let _permit = self.permit(Stage::Extracted).await?;
                    self.extraction.extract(pages).await?
                };
                let attempts = raw.pages.iter().map(|p| p.attempts).max().unwrap_or(1);
                self.record_attempts(&mut ctx.run, Stage::Extracted, attempts);
                (raw, AuditOutcome::Advanced)
            }
        };

        for page in raw.failed_pages() {
            let message = page
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error");
            ctx.run.push_issue(RunIssue::new(
                Stage::Extracted,
                ErrorClass::Partial,
                format!("page {} failed: {}", page.page_index, message),
            ));
            self.metrics.emit(
                MetricEvent::counter(metric_names::PAGE_FAILURES).with_label("adapter", self.extraction.adapter_name()),
            );
        }

        let detail = json!({
            "pages": raw.pages.len(),
            "failed_pages": raw.failed_pages().map(|p| p.page_index).collect::<Vec<_>>(),
        });
        self.commit(ctx, ArtifactKind::Extraction, &raw, outcome, detail).await?;
        Ok(raw)
    }

    async fn transform(
        &self,
        ctx: &mut RunContext,
        classification: &Classification,
        raw: &RawExtraction,
    ) -> Result<CanonicalRecord> {
        self.checkpoint(ctx).await?;
        let (record, outcome) = match self.reused::<CanonicalRecord>(ctx, ArtifactKind::Record).await? {
            Some(mut record) => {
                record.pipeline_version = self.version.clone();
                (record, AuditOutcome::Reused)
            }
            None => {
                let transformer = self.transformer.clone();
                let document_id = ctx.run.fingerprint.to_string();
                let classification = classification.clone();
                let raw = raw.clone();
                let record = self
                    .run_cpu(Stage::Transformed, move || {
                        transformer.transform(&document_id, &classification, &raw)
                    })
                    .await??;
                ctx.run.set_attempts(Stage::Transformed, 1);
                (record, AuditOutcome::Advanced)
            }
        };

        self.store_record(&ctx.run, &record).await?;
        let detail = json!({
            "fields": record.provenance.len(),
            "line_items": record.line_items.len(),
        });
        self.commit(ctx, ArtifactKind::Record, &record, outcome, detail).await?;
        Ok(record)
    }

    async fn validate(&self, ctx: &mut RunContext, record: &CanonicalRecord) -> Result<ValidationResult> {
        self.checkpoint(ctx).await?;
        let (validation, outcome) = match self.reused::<ValidationResult>(ctx, ArtifactKind::Validation).await? {
            Some(validation) => (validation, AuditOutcome::Reused),
            None => {
                let validator = self.validator.clone();
                let record = record.clone();
                let validation = self
                    .run_cpu(Stage::Validated, move || validator.validate(&record))
                    .await?;
                ctx.run.set_attempts(Stage::Validated, 1);
                (validation, AuditOutcome::Advanced)
            }
        };

        let detail = json!({
            "is_valid": validation.is_valid,
            "errors": validation.errors.len(),
            "warnings": validation.warnings.len(),
        });
        self.commit(ctx, ArtifactKind::Validation, &validation, outcome, detail)
            .await?;
        Ok(validation)
    }

    async fn load(&self, ctx: &mut RunContext, record: &CanonicalRecord) -> Result<()> {
        self.checkpoint(ctx).await?;
        self.runs
            .put_typed(ctx.run.id, ArtifactKind::LoadPlan, &self.fanout.pending_statuses())
            .await?;

        let outcome = {
            let _permit = self.permit(Stage::Loaded).await?;
            self.fanout.write(record).await
        };
        self.runs
            .put_typed(ctx.run.id, ArtifactKind::LoadTargets, &outcome.statuses)
            .await?;
        self.record_attempts(&mut ctx.run, Stage::Loaded, outcome.max_attempts());

        for target in outcome.failed_optional() {
            ctx.run.push_issue(RunIssue::new(
                Stage::Loaded,
                ErrorClass::Partial,
                format!(
                    "optional sink {} failed permanently: {}",
                    target.target_name,
                    target.last_error.as_deref().unwrap_or("unknown error")
                ),
            ));
        }

        if !outcome.required_ok() {
            let failed: Vec<&str> = outcome
                .failed_required()
                .map(|target| target.target_name.as_str())
                .collect();
            return Err(PipelineError::Exhausted {
                message: format!("required sink(s) failed: {}", failed.join(", ")),
                attempts: outcome.max_attempts(),
            });
        }

        let detail = json!({
            "targets": outcome
                .statuses
                .iter()
                .map(|s| json!({ "name": s.target_name, "status": s.status, "attempts": s.attempts }))
                .collect::<Vec<_>>(),
        });
        self.transition(ctx, Stage::Loaded, AuditOutcome::Advanced, detail)
            .await
    }

    /// Route a stage error to its terminal stage.
    async fn fail(&self, ctx: &mut RunContext, error: PipelineError) {
        if ctx.run.is_terminal() {
            error!(run_id = %ctx.run.id, stage = %ctx.run.stage, error = %error, "Error after terminal commit");
            return;
        }

        let attempted = ctx.run.stage.next().unwrap_or(ctx.run.stage);
        let (to, outcome) = match &error {
            PipelineError::Rejected { .. } => (Stage::Rejected, AuditOutcome::Rejected),
            PipelineError::Cancelled => (Stage::Cancelled, AuditOutcome::Cancelled),
            _ => (Stage::Failed, AuditOutcome::Failed),
        };

        if let PipelineError::Exhausted { attempts, .. } = &error {
            self.record_attempts(&mut ctx.run, attempted, *attempts);
        }
        if !matches!(error, PipelineError::Cancelled) {
            ctx.run
                .push_issue(RunIssue::new(attempted, error.class(), error.to_string()));
        }

        let mut detail = json!({ "stage": attempted, "error": error.to_string() });
        if let PipelineError::Rejected { detail: diagnostic, .. } = &error {
            detail["diagnostic"] = diagnostic.clone();
        }

        match to {
            Stage::Cancelled => info!(run_id = %ctx.run.id, at = %ctx.run.stage, "Run cancelled"),
            Stage::Rejected => warn!(run_id = %ctx.run.id, error = %error, "Run rejected"),
            _ => error!(run_id = %ctx.run.id, stage = %attempted, error = %error, "Run failed"),
        }

        if let Err(e) = self.transition(ctx, to, outcome, detail).await {
            error!(run_id = %ctx.run.id, to = %to, error = %e, "Could not commit terminal stage");
            if !ctx.run.is_terminal() {
                ctx.run.halt(RunIssue::new(
                    attempted,
                    e.class(),
                    format!("run halted at {}, {} was not recorded: {}", ctx.run.stage, to, e),
                ));
            }
            if let Err(e) = self.runs.update(&ctx.run).await {
                error!(run_id = %ctx.run.id, error = %e, "Could not persist halted run");
            }
        }
    }

    // Commit path

    /// Stage boundary: honor cancellation and extend the lease.
    async fn checkpoint(&self, ctx: &mut RunContext) -> Result<()> {
        if ctx.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        ctx.lease = self
            .leases
            .renew(&ctx.lease, self.settings.runtime.lease_ttl())
            .await?;
        Ok(())
    }

    async fn reused<T>(&self, ctx: &RunContext, kind: ArtifactKind) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match &ctx.reuse {
            Some(reuse) if kind.stage() < reuse.from_stage => {
                let value = self.runs.get_typed(reuse.source, kind).await?;
                if value.is_none() {
                    warn!(run_id = %ctx.run.id, source = %reuse.source, kind = kind.as_str(), "Replay source lacks artifact, recomputing");
                }
                Ok(value)
            }
            _ => Ok(None),
        }
    }

    /// Persist a stage's artifact, then commit the stage.
    async fn commit<T>(
        &self,
        ctx: &mut RunContext,
        kind: ArtifactKind,
        value: &T,
        outcome: AuditOutcome,
        mut detail: serde_json::Value,
    ) -> Result<()>
    where
        T: Serialize + Sync,
    {
        self.runs.put_typed(ctx.run.id, kind, value).await?;
        if let (AuditOutcome::Reused, Some(reuse)) = (outcome, &ctx.reuse) {
            detail["source_run"] = json!(reuse.source);
        }
        self.transition(ctx, kind.stage(), outcome, detail).await
    }

    /// Audit, then commit. Nothing is committed if the audit write fails.
    async fn transition(
        &self,
        ctx: &mut RunContext,
        to: Stage,
        outcome: AuditOutcome,
        detail: serde_json::Value,
    ) -> Result<()> {
        let from = ctx.run.stage;
        if !from.can_transition_to(to) {
            return Err(CoreError::InvalidTransition { from, to }.into());
        }

        let event = AuditEvent::new(ctx.run.id, ctx.run.pipeline_version.clone(), to, outcome)
            .from_stage(from)
            .with_detail(detail);
        self.audit.append(&event).await.map_err(PipelineError::Audit)?;

        ctx.run.advance(to)?;
        self.runs.update(&ctx.run).await?;

        if matches!(to, Stage::Loaded | Stage::Rejected) {
            let entry = FingerprintEntry {
                fingerprint: ctx.run.fingerprint.clone(),
                run_id: ctx.run.id,
                stage: to,
                pipeline_version: ctx.run.pipeline_version.clone(),
                recorded_at: Utc::now(),
            };
            if let Err(e) = self.fingerprints.record(entry).await {
                warn!(run_id = %ctx.run.id, error = %e, "Could not index fingerprint outcome");
            }
        }

        let elapsed = ctx.stage_started.elapsed();
        ctx.stage_started = Instant::now();
        self.metrics.emit(
            MetricEvent::new(metric_names::STAGE_DURATION_MS, elapsed.as_secs_f64() * 1000.0)
                .with_label("stage", to.as_str()),
        );
        self.emit_transition(to, outcome);
        if !to.is_terminal() {
            ctx.notify.send_replace(to);
        }

        info!(
            run_id = %ctx.run.id,
            from = %from,
            to = %to,
            outcome = outcome.as_str(),
            "Stage committed"
        );
        Ok(())
    }

    async fn store_record(&self, run: &PipelineRun, record: &CanonicalRecord) -> Result<()> {
        let stored = StoredRecord {
            fingerprint: run.fingerprint.clone(),
            pipeline_version: record.pipeline_version.clone(),
            run_id: run.id,
            stored_at: Utc::now(),
            record: serde_json::to_value(record).map_err(StoreError::from)?,
        };
        match self.runs.put_record(stored).await {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict(message)) => {
                debug!(run_id = %run.id, message = %message, "Record version already stored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // Resources

    async fn permit(&self, stage: Stage) -> Result<BulkheadPermit> {
        let pool = self.plan.pool(stage);
        let bulkhead = match pool {
            ResourcePool::Cpu => &self.cpu,
            ResourcePool::Io => &self.io,
        };
        bulkhead
            .acquire()
            .await
            .ok_or_else(|| PipelineError::PoolClosed(pool.as_str().to_string()))
    }

    async fn run_cpu<T, F>(&self, stage: Stage, work: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self.permit(stage).await?;
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.leases.release(lease).await {
            warn!(run_id = %lease.run_id, error = %e, "Could not release lease");
        }
    }

    // Metrics

    fn record_attempts(&self, run: &mut PipelineRun, stage: Stage, attempts: u32) {
        run.set_attempts(stage, attempts);
        if attempts > 1 {
            self.metrics.emit(
                MetricEvent::new(metric_names::STAGE_RETRIES, f64::from(attempts - 1)).with_label("stage", stage.as_str()),
            );
        }
    }

    fn emit_transition(&self, to: Stage, outcome: AuditOutcome) {
        self.metrics.emit(
            MetricEvent::counter(metric_names::STAGE_TRANSITIONS)
                .with_label("stage", to.as_str())
                .with_label("outcome", outcome.as_str()),
        );
    }

    fn count_submission(&self, disposition: Disposition) {
        self.metrics
            .emit(MetricEvent::counter(metric_names::SUBMISSIONS).with_label("disposition", disposition.as_str()));
    }
}
