//! Typed stage job descriptors.
//!
//! Each lifecycle stage is described by the resource pool it runs on and the
//! retry policy and deadline applied to its external calls. The orchestrator
//! consumes these uniformly instead of hard-coding policy per stage.

use std::time::Duration;

use finflow_core::{PipelineSettings, Stage};
use finflow_infra::RetryPolicy;

/// Logically separate worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourcePool {
    /// In-process work: classification, transformation, validation
    Cpu,
    /// External calls: staging, extraction, loading
    Io,
}

impl ResourcePool {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourcePool::Cpu => "cpu",
            ResourcePool::Io => "io",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageJob {
    pub stage: Stage,
    pub pool: ResourcePool,
    /// `None` for deterministic stages, which are never retried
    pub retry: Option<RetryPolicy>,
    /// Deadline of each external call made by the stage
    pub timeout: Option<Duration>,
}

impl StageJob {
    pub fn cpu(stage: Stage) -> Self {
        Self {
            stage,
            pool: ResourcePool::Cpu,
            retry: None,
            timeout: None,
        }
    }

    pub fn io(stage: Stage) -> Self {
        Self {
            stage,
            pool: ResourcePool::Io,
            retry: None,
            timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retry.as_ref().map(|r| r.max_attempts() > 1).unwrap_or(false)
    }

    /// Retry policy to hand to the stage; a single attempt when none is set.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_else(|| RetryPolicy::fixed(1, Duration::ZERO))
    }
}

/// Job descriptors for every lifecycle stage.
#[derive(Debug, Clone)]
pub struct JobPlan {
    jobs: Vec<StageJob>,
}

impl JobPlan {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        let jobs = vec![
            StageJob::io(Stage::Ingested).with_retry(RetryPolicy::from(&settings.intake.retry)),
            StageJob::cpu(Stage::Classified),
            StageJob::io(Stage::Extracted)
                .with_retry(RetryPolicy::from(&settings.extraction.retry))
                .with_timeout(settings.extraction.page_timeout()),
            StageJob::cpu(Stage::Transformed),
            StageJob::cpu(Stage::Validated),
            // Sinks carry their own retry and deadline settings.
            StageJob::io(Stage::Loaded),
        ];
        Self { jobs }
    }

    pub fn job(&self, stage: Stage) -> Option<&StageJob> {
        self.jobs.iter().find(|job| job.stage == stage)
    }

    pub fn pool(&self, stage: Stage) -> ResourcePool {
        self.job(stage).map(|job| job.pool).unwrap_or(ResourcePool::Cpu)
    }

    pub fn retry_policy(&self, stage: Stage) -> RetryPolicy {
        self.job(stage)
            .map(StageJob::retry_policy)
            .unwrap_or_else(|| RetryPolicy::fixed(1, Duration::ZERO))
    }

    pub fn timeout(&self, stage: Stage) -> Option<Duration> {
        self.job(stage).and_then(|job| job.timeout)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageJob> {
        self.jobs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_covers_lifecycle() {
        let plan = JobPlan::from_settings(&PipelineSettings::default());
        let stages: Vec<Stage> = plan.iter().map(|job| job.stage).collect();
        assert_eq!(stages, Stage::LIFECYCLE.to_vec());
    }

    #[test]
    fn test_only_io_stages_retry() {
        let mut settings = PipelineSettings::default();
        settings.extraction.retry.max_attempts = 5;
        settings.extraction.page_timeout_ms = 1_500;
        let plan = JobPlan::from_settings(&settings);

        let extract = plan.job(Stage::Extracted).unwrap();
        assert_eq!(extract.pool, ResourcePool::Io);
        assert_eq!(extract.retry_policy().max_attempts(), 5);
        assert_eq!(extract.timeout, Some(Duration::from_millis(1_500)));

        for stage in [Stage::Classified, Stage::Transformed, Stage::Validated] {
            let job = plan.job(stage).unwrap();
            assert_eq!(job.pool, ResourcePool::Cpu);
            assert!(!job.is_retryable());
            assert_eq!(job.retry_policy().max_attempts(), 1);
        }
        assert_eq!(plan.pool(Stage::Loaded), ResourcePool::Io);
        assert_eq!(plan.retry_policy(Stage::Rejected).max_attempts(), 1);
        assert_eq!(plan.timeout(Stage::Ingested), None);
    }
}
