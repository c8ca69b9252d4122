//! Resilience patterns for adapter, store, and sink calls
//!
//! Bounded retries with backoff, per-call deadlines, and worker-pool bulkheads.

pub mod bulkhead;
pub mod retry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use retry::{retry_with, Attempted, RetryConfig, RetryPolicy};
pub use timeout::{timeout_result, TimeoutError, TimeoutOrError};
