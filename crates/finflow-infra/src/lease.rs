//! Per-fingerprint leases.
//!
//! A lease gives one run exclusive processing rights over a fingerprint until
//! it is released or its TTL elapses. Expired leases are taken over by the
//! next acquirer, which lets work orphaned by a crashed worker resume.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use finflow_core::{Fingerprint, Lease, LeaseManager, LeaseOutcome, RunId, StoreError};

/// Process-local lease table.
#[derive(Clone, Default)]
pub struct MemoryLeaseManager {
    leases: Arc<Mutex<HashMap<Fingerprint, Lease>>>,
    next_token: Arc<AtomicU64>,
}

impl MemoryLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live holder of a fingerprint, if any.
    pub fn holder(&self, fingerprint: &Fingerprint) -> Option<RunId> {
        let leases = self.leases.lock();
        leases
            .get(fingerprint)
            .filter(|l| l.expires_at > Utc::now())
            .map(|l| l.run_id)
    }
}

fn expiry(ttl: Duration) -> Result<chrono::DateTime<Utc>, StoreError> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| StoreError::Unavailable(format!("invalid lease ttl: {}", e)))?;
    Ok(Utc::now() + ttl)
}

#[async_trait]
impl LeaseManager for MemoryLeaseManager {
    async fn acquire(&self, fingerprint: &Fingerprint, run_id: RunId, ttl: Duration) -> Result<LeaseOutcome, StoreError> {
        let expires_at = expiry(ttl)?;
        let mut leases = self.leases.lock();

        if let Some(existing) = leases.get(fingerprint) {
            if existing.expires_at > Utc::now() && existing.run_id != run_id {
                debug!(fingerprint = %fingerprint.short(), holder = %existing.run_id, "Lease held");
                return Ok(LeaseOutcome::Held {
                    run_id: existing.run_id,
                });
            }
            if existing.run_id != run_id {
                info!(
                    fingerprint = %fingerprint.short(),
                    previous = %existing.run_id,
                    "Taking over expired lease"
                );
            }
        }

        let lease = Lease {
            fingerprint: fingerprint.clone(),
            run_id,
            token: self.next_token.fetch_add(1, Ordering::SeqCst) + 1,
            expires_at,
        };
        leases.insert(fingerprint.clone(), lease.clone());
        Ok(LeaseOutcome::Acquired(lease))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError> {
        let expires_at = expiry(ttl)?;
        let mut leases = self.leases.lock();
        match leases.get_mut(&lease.fingerprint) {
            Some(current) if current.token == lease.token => {
                current.expires_at = expires_at;
                Ok(current.clone())
            }
            _ => Err(StoreError::Conflict(format!(
                "lease on {} is no longer held by run {}",
                lease.fingerprint.short(),
                lease.run_id
            ))),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut leases = self.leases.lock();
        if leases
            .get(&lease.fingerprint)
            .map(|current| current.token == lease.token)
            .unwrap_or(false)
        {
            leases.remove(&lease.fingerprint);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquired(outcome: LeaseOutcome) -> Lease {
        match outcome {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::Held { run_id } => panic!("lease held by {}", run_id),
        }
    }

    #[tokio::test]
    async fn test_second_acquirer_sees_holder() {
        let leases = MemoryLeaseManager::new();
        let fp = Fingerprint::of(b"doc");
        let first = RunId::new();

        let lease = acquired(leases.acquire(&fp, first, Duration::from_secs(60)).await.unwrap());
        assert_eq!(lease.run_id, first);

        let outcome = leases.acquire(&fp, RunId::new(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome, LeaseOutcome::Held { run_id: first });
        assert_eq!(leases.holder(&fp), Some(first));
    }

    #[tokio::test]
    async fn test_release_frees_fingerprint() {
        let leases = MemoryLeaseManager::new();
        let fp = Fingerprint::of(b"doc");
        let lease = acquired(leases.acquire(&fp, RunId::new(), Duration::from_secs(60)).await.unwrap());
        leases.release(&lease).await.unwrap();

        assert!(leases.holder(&fp).is_none());
        let next = RunId::new();
        let lease = acquired(leases.acquire(&fp, next, Duration::from_secs(60)).await.unwrap());
        assert_eq!(lease.run_id, next);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let leases = MemoryLeaseManager::new();
        let fp = Fingerprint::of(b"doc");
        let stale = acquired(leases.acquire(&fp, RunId::new(), Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = acquired(leases.acquire(&fp, RunId::new(), Duration::from_secs(60)).await.unwrap());
        assert_ne!(fresh.token, stale.token);

        // The stale holder can neither renew nor release the new lease.
        assert!(leases.renew(&stale, Duration::from_secs(60)).await.is_err());
        leases.release(&stale).await.unwrap();
        assert_eq!(leases.holder(&fp), Some(fresh.run_id));
    }
}
