//! Infrastructure backends for finflow: stores, leases, audit, metrics,
//! storage sinks, and resilience primitives.

pub mod audit;
pub mod lease;
pub mod metrics;
pub mod resilience;
pub mod sinks;
pub mod store;

pub use audit::{CompositeAuditSink, InMemoryAuditLog, JsonlAuditLog, TracingAuditSink};
pub use lease::MemoryLeaseManager;
pub use metrics::{InMemoryMetrics, NoopMetrics, TracingMetrics};
pub use resilience::{
    retry_with, timeout_result, Attempted, Bulkhead, BulkheadPermit, RetryConfig, RetryPolicy, TimeoutError,
    TimeoutOrError,
};
pub use sinks::{JsonFileSink, MemorySink};
pub use store::{FsStore, MemoryBlobStore, MemoryFingerprintStore, MemoryRunStore};
