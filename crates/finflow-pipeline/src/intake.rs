//! Staging intake
//!
//! Sniffs the document format, rejects input the pipeline can never process,
//! and persists raw bytes content-addressed by fingerprint.

use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

use finflow_core::{BlobStore, Fingerprint, PageInput, StagedDocument, StoreError};
use finflow_infra::{retry_with, Attempted, RetryPolicy};

use crate::{PipelineError, Result};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_PNG: &str = "image/png";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_TIFF: &str = "image/tiff";
pub const MIME_TEXT: &str = "text/plain";

const FORM_FEED: char = '\x0C';

static PDF_PAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/Type\s*/Page\b").expect("valid page regex"));

/// What intake learned about the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFormat {
    pub mime_type: String,
    pub page_count: u32,
}

/// Detect the MIME type from magic bytes, falling back to the filename.
pub fn sniff(bytes: &[u8], filename: Option<&str>) -> Result<String> {
    if bytes.is_empty() {
        return Err(PipelineError::Fatal("empty document".to_string()));
    }

    if bytes.starts_with(b"%PDF-") {
        let tail = &bytes[bytes.len().saturating_sub(1024)..];
        if !tail.windows(5).any(|w| w == b"%%EOF") {
            return Err(PipelineError::Fatal(
                "truncated PDF: missing %%EOF trailer".to_string(),
            ));
        }
        return Ok(MIME_PDF.to_string());
    }
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Ok(MIME_PNG.to_string());
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Ok(MIME_JPEG.to_string());
    }
    if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        return Ok(MIME_TIFF.to_string());
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        let binary = text
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | FORM_FEED));
        if !binary {
            return Ok(MIME_TEXT.to_string());
        }
    }

    let guessed = filename.and_then(|name| mime_guess::from_path(name).first());
    match guessed {
        Some(mime) if mime.type_() == mime_guess::mime::TEXT => {
            debug!(mime = %mime, "Accepting non-UTF-8 text by filename");
            Ok(MIME_TEXT.to_string())
        }
        Some(mime) => Err(PipelineError::Fatal(format!(
            "content does not match a supported format (filename suggests {})",
            mime
        ))),
        None => Err(PipelineError::Fatal("unrecognized binary format".to_string())),
    }
}

/// Number of pages the paginator will produce for this document.
pub fn count_pages(bytes: &[u8], mime_type: &str) -> u32 {
    match mime_type {
        MIME_PDF => (PDF_PAGE.find_iter(bytes).count() as u32).max(1),
        MIME_TEXT => text_pages(bytes).len() as u32,
        _ => 1,
    }
}

fn text_pages(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut pages: Vec<String> = text.split(FORM_FEED).map(str::to_string).collect();
    while pages.len() > 1 && pages.last().map(|p| p.trim().is_empty()).unwrap_or(false) {
        pages.pop();
    }
    pages
}

/// Split staged bytes into per-page inputs for the extraction adapter.
///
/// Text pages carry only their own bytes; PDF pages carry the whole document
/// and are addressed by `page_index`; images are a single page.
pub fn paginate(staged: &StagedDocument, bytes: &[u8]) -> Vec<PageInput> {
    let page = |index: u32, bytes: Arc<[u8]>| PageInput {
        fingerprint: staged.fingerprint.clone(),
        page_index: index,
        page_count: staged.page_count,
        mime_type: staged.mime_type.clone(),
        bytes,
    };

    match staged.mime_type.as_str() {
        MIME_TEXT => text_pages(bytes)
            .into_iter()
            .enumerate()
            .map(|(i, text)| page(i as u32, Arc::from(text.into_bytes())))
            .collect(),
        _ => {
            let shared: Arc<[u8]> = Arc::from(bytes);
            (0..staged.page_count.max(1))
                .map(|i| page(i, shared.clone()))
                .collect()
        }
    }
}

/// Persists raw documents into the blob store.
#[derive(Clone)]
pub struct StagingIntake {
    blobs: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    max_document_bytes: u64,
}

impl StagingIntake {
    pub fn new(blobs: Arc<dyn BlobStore>, max_document_bytes: u64, retry: RetryPolicy) -> Self {
        Self {
            blobs,
            retry,
            max_document_bytes,
        }
    }

    /// Validate the raw bytes. Every error returned here is fatal.
    pub fn inspect(&self, bytes: &[u8], filename: Option<&str>) -> Result<DocumentFormat> {
        if bytes.len() as u64 > self.max_document_bytes {
            return Err(PipelineError::Fatal(format!(
                "document is {} bytes, limit is {}",
                bytes.len(),
                self.max_document_bytes
            )));
        }
        let mime_type = sniff(bytes, filename)?;
        let page_count = count_pages(bytes, &mime_type);
        Ok(DocumentFormat {
            mime_type,
            page_count,
        })
    }

    /// Write the bytes under their fingerprint, retrying transient storage errors.
    pub async fn stage(
        &self,
        fingerprint: &Fingerprint,
        bytes: &[u8],
        format: &DocumentFormat,
    ) -> std::result::Result<Attempted<StagedDocument>, Attempted<StoreError>> {
        let put = retry_with(
            &self.retry,
            |attempt| {
                debug!(fingerprint = %fingerprint.short(), attempt, "Staging document");
                self.blobs.put(fingerprint, bytes)
            },
            |e: &StoreError| {
                warn!(fingerprint = %fingerprint.short(), error = %e, "Blob write failed");
                e.is_transient()
            },
        )
        .await?;

        Ok(Attempted {
            value: StagedDocument {
                fingerprint: fingerprint.clone(),
                raw_bytes_ref: put.value.blob_ref,
                mime_type: format.mime_type.clone(),
                page_count: format.page_count,
                size_bytes: bytes.len() as u64,
            },
            attempts: put.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finflow_infra::MemoryBlobStore;
    use std::time::Duration;

    fn intake(max_document_bytes: u64) -> StagingIntake {
        StagingIntake::new(
            Arc::new(MemoryBlobStore::new()),
            max_document_bytes,
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        )
    }

    #[test]
    fn test_sniff_magic_bytes() {
        assert_eq!(sniff(b"%PDF-1.7\n1 0 obj\n%%EOF\n", None).unwrap(), MIME_PDF);
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n....", None).unwrap(), MIME_PNG);
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0], None).unwrap(), MIME_JPEG);
        assert_eq!(sniff(b"II*\0rest", None).unwrap(), MIME_TIFF);
        assert_eq!(sniff("Invoice\nTotal: 5.00 €".as_bytes(), None).unwrap(), MIME_TEXT);
    }

    #[test]
    fn test_sniff_fatal_inputs() {
        assert!(matches!(sniff(b"", None), Err(PipelineError::Fatal(_))));
        assert!(matches!(sniff(b"%PDF-1.4 truncated", None), Err(PipelineError::Fatal(_))));
        assert!(matches!(sniff(&[0x00, 0x01, 0x02, 0x9F], None), Err(PipelineError::Fatal(_))));
        assert!(matches!(
            sniff(&[0x00, 0x01, 0x02, 0x9F], Some("scan.pdf")),
            Err(PipelineError::Fatal(_))
        ));
    }

    #[test]
    fn test_sniff_falls_back_to_filename_for_text() {
        let latin1 = [b'T', b'o', b't', b'a', b'l', b' ', 0xA3, b'5'];
        assert_eq!(sniff(&latin1, Some("receipt.txt")).unwrap(), MIME_TEXT);
    }

    #[test]
    fn test_count_pages() {
        let pdf = b"%PDF-1.7 /Type /Pages /Count 2 /Type /Page /Type/Page %%EOF";
        assert_eq!(count_pages(pdf, MIME_PDF), 2);
        assert_eq!(count_pages(b"one\x0Ctwo\x0C", MIME_TEXT), 2);
        assert_eq!(count_pages(b"single", MIME_TEXT), 1);
        assert_eq!(count_pages(b"\x89PNG", MIME_PNG), 1);
    }

    #[test]
    fn test_paginate_text_and_pdf() {
        let staged = StagedDocument {
            fingerprint: Fingerprint::of(b"x"),
            raw_bytes_ref: "mem://x".into(),
            mime_type: MIME_TEXT.into(),
            page_count: 2,
            size_bytes: 9,
        };
        let pages = paginate(&staged, b"first\x0Csecond");
        assert_eq!(pages.len(), 2);
        assert_eq!(&*pages[1].bytes, b"second");
        assert_eq!(pages[1].page_index, 1);

        let pdf = StagedDocument {
            mime_type: MIME_PDF.into(),
            page_count: 3,
            ..staged
        };
        let pages = paginate(&pdf, b"%PDF");
        assert_eq!(pages.len(), 3);
        assert!(pages.iter().all(|p| &*p.bytes == b"%PDF"));
    }

    #[test]
    fn test_inspect_enforces_size_limit() {
        let intake = intake(4);
        assert!(matches!(intake.inspect(b"too long", None), Err(PipelineError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_stage_persists_bytes() {
        let intake = intake(1024);
        let bytes = b"Total: 10.00 USD";
        let fp = Fingerprint::of(bytes);
        let format = intake.inspect(bytes, Some("a.txt")).unwrap();

        let staged = intake.stage(&fp, bytes, &format).await.unwrap();
        assert_eq!(staged.attempts, 1);
        assert_eq!(staged.value.fingerprint, fp);
        assert_eq!(staged.value.mime_type, MIME_TEXT);
        assert_eq!(staged.value.page_count, 1);
    }
}
