//! Extraction coordinator
//!
//! Calls the extraction adapter once per page with bounded parallelism, a
//! per-call deadline and an independent retry budget per page. Failed pages
//! are kept in the aggregate; only a document whose every page failed is an
//! error.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use finflow_core::{
    AdapterError, ExtractionAdapter, PageAnalysis, PageError, PageExtraction, PageInput, RawExtraction,
};
use finflow_infra::{retry_with, timeout_result, Attempted, RetryPolicy, TimeoutOrError};

use crate::{PipelineError, Result};

/// Bounded-parallel, per-page extraction driver.
#[derive(Clone)]
pub struct ExtractionCoordinator {
    adapter: Arc<dyn ExtractionAdapter>,
    workers: usize,
    page_timeout: Duration,
    retry: RetryPolicy,
}

impl ExtractionCoordinator {
    pub fn new(adapter: Arc<dyn ExtractionAdapter>, workers: usize, page_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            adapter,
            workers: workers.max(1),
            page_timeout,
            retry,
        }
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    /// Extract every page. Results are in page order regardless of completion order.
    pub async fn extract(&self, pages: Vec<PageInput>) -> Result<RawExtraction> {
        if pages.is_empty() {
            return Err(PipelineError::Fatal("document has no pages".to_string()));
        }
        let page_count = pages.len();

        let mut results: Vec<PageExtraction> = stream::iter(pages)
            .map(|page| self.extract_page(page))
            .buffer_unordered(self.workers)
            .collect()
            .await;
        results.sort_by_key(|p| p.page_index);

        let raw = RawExtraction { pages: results };
        let failed = raw.failed_pages().count();

        if raw.all_failed() {
            let attempts = raw.pages.iter().map(|p| p.attempts).max().unwrap_or(0);
            let first = raw
                .pages
                .iter()
                .find_map(|p| p.error.as_ref())
                .map(|e| e.message.clone())
                .unwrap_or_default();
            return Err(PipelineError::Exhausted {
                message: format!("all {} pages failed extraction, first error: {}", page_count, first),
                attempts,
            });
        }

        info!(
            adapter = self.adapter.name(),
            pages = page_count,
            failed,
            "Extraction complete"
        );
        Ok(raw)
    }

    async fn extract_page(&self, page: PageInput) -> PageExtraction {
        let page_index = page.page_index;
        let operation = format!("{}:page-{}", self.adapter.name(), page_index);
        let adapter = self.adapter.as_ref();
        let page = &page;
        let operation = operation.as_str();
        let deadline = self.page_timeout;

        let result = retry_with(
            &self.retry,
            move |attempt| {
                debug!(page = page_index, attempt, "Analyzing page");
                timeout_result(deadline, operation, adapter.analyze(page))
            },
            is_retryable,
        )
        .await;

        match result {
            Ok(Attempted { value, attempts }) => assemble(page_index, value, attempts),
            Err(Attempted { value, attempts }) => {
                warn!(page = page_index, attempts, error = %value, "Page extraction failed");
                PageExtraction::failed(
                    page_index,
                    attempts,
                    PageError {
                        message: value.to_string(),
                        timed_out: value.is_timeout(),
                    },
                )
            }
        }
    }
}

fn is_retryable(error: &TimeoutOrError<AdapterError>) -> bool {
    match error {
        TimeoutOrError::Timeout(_) => true,
        TimeoutOrError::Error(e) => e.is_transient(),
    }
}

/// Put regions into the adapter's reading order and stamp each region with
/// its position. `reading_order` keeps the permutation as reported.
fn assemble(page_index: u32, analysis: PageAnalysis, attempts: u32) -> PageExtraction {
    let PageAnalysis {
        regions,
        text,
        confidence,
        reading_order,
    } = analysis;

    let order = if is_permutation(&reading_order, regions.len()) {
        reading_order
    } else {
        if !reading_order.is_empty() {
            warn!(page = page_index, "Ignoring invalid reading order from adapter");
        }
        (0..regions.len()).collect()
    };

    let mut slots: Vec<Option<_>> = regions.into_iter().map(Some).collect();
    let ordered = order
        .iter()
        .enumerate()
        .filter_map(|(position, &index)| {
            slots[index].take().map(|mut region| {
                region.reading_order = position as u32;
                region
            })
        })
        .collect();

    PageExtraction {
        page_index,
        regions: ordered,
        text,
        confidence,
        reading_order: order,
        attempts,
        error: None,
    }
}

fn is_permutation(order: &[usize], len: usize) -> bool {
    if order.len() != len {
        return false;
    }
    let mut seen = vec![false; len];
    order
        .iter()
        .all(|&i| i < len && !std::mem::replace(&mut seen[i], true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use finflow_core::{Fingerprint, Region};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Page 1 times out every time; other pages succeed.
    struct SlowSecondPage {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ExtractionAdapter for SlowSecondPage {
        async fn analyze(&self, page: &PageInput) -> std::result::Result<PageAnalysis, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if page.page_index == 1 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(PageAnalysis {
                regions: vec![
                    Region::text("second", 0.9),
                    Region::key_value("Total", "10.00", 0.9),
                ],
                text: "page".into(),
                confidence: 0.9,
                reading_order: vec![1, 0],
            })
        }

        fn name(&self) -> &str {
            "slow-second-page"
        }
    }

    struct AlwaysPermanent;

    #[async_trait]
    impl ExtractionAdapter for AlwaysPermanent {
        async fn analyze(&self, _page: &PageInput) -> std::result::Result<PageAnalysis, AdapterError> {
            Err(AdapterError::Permanent("unreadable".into()))
        }

        fn name(&self) -> &str {
            "always-permanent"
        }
    }

    fn pages(count: u32) -> Vec<PageInput> {
        (0..count)
            .map(|i| PageInput {
                fingerprint: Fingerprint::of(b"doc"),
                page_index: i,
                page_count: count,
                mime_type: "text/plain".into(),
                bytes: Arc::from(&b"text"[..]),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_page_timeout_is_isolated() {
        let adapter = Arc::new(SlowSecondPage {
            calls: AtomicU32::new(0),
        });
        let coordinator = ExtractionCoordinator::new(
            adapter.clone(),
            2,
            Duration::from_millis(20),
            RetryPolicy::fixed(2, Duration::from_millis(1)),
        );

        let raw = coordinator.extract(pages(2)).await.unwrap();
        assert_eq!(raw.pages.len(), 2);

        let first = &raw.pages[0];
        assert!(first.error.is_none());
        assert_eq!(first.regions[0].key.as_deref(), Some("Total"));
        assert_eq!(first.regions[0].reading_order, 0);
        assert_eq!(first.regions[1].text, "second");
        assert_eq!(first.reading_order, vec![1, 0]);

        let second = &raw.pages[1];
        let error = second.error.as_ref().unwrap();
        assert!(error.timed_out);
        assert_eq!(second.attempts, 2);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried_and_all_failed_is_error() {
        let coordinator = ExtractionCoordinator::new(
            Arc::new(AlwaysPermanent),
            4,
            Duration::from_secs(1),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        );
        match coordinator.extract(pages(3)).await {
            Err(PipelineError::Exhausted { attempts, message }) => {
                assert_eq!(attempts, 1);
                assert!(message.contains("all 3 pages"));
            }
            other => panic!("expected exhausted error, got {:?}", other.map(|r| r.pages.len())),
        }
    }

    #[test]
    fn test_invalid_reading_order_falls_back_to_emission_order() {
        let analysis = PageAnalysis {
            regions: vec![Region::text("a", 0.9), Region::text("b", 0.9)],
            text: "a\nb".into(),
            confidence: 0.9,
            reading_order: vec![0, 0],
        };
        let page = assemble(0, analysis, 1);
        assert_eq!(page.reading_order, vec![0, 1]);
        assert_eq!(page.regions[1].text, "b");
        assert_eq!(page.regions[1].reading_order, 1);
    }
}
