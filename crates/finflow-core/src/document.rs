//! Staged documents, classification, and raw extraction output.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::Fingerprint;

/// Immutable, content-addressed staged document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedDocument {
    pub fingerprint: Fingerprint,
    /// Backend-specific reference to the raw bytes
    pub raw_bytes_ref: String,
    pub mime_type: String,
    pub page_count: u32,
    pub size_bytes: u64,
}

/// Coarse document type guessed by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    Receipt,
    Statement,
    CreditNote,
    Unknown,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "invoice",
            DocumentType::Receipt => "receipt",
            DocumentType::Statement => "statement",
            DocumentType::CreditNote => "credit_note",
            DocumentType::Unknown => "unknown",
        }
    }
}

/// Routing metadata produced once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub is_scanned: bool,
    pub has_text_layer: bool,
    pub has_tables: bool,
    /// 0.0 - 1.0 signal behind `has_tables`
    pub table_likelihood: f32,
    pub document_type: DocumentType,
    pub confidence: f32,
    /// Set when heuristics could not run and the conservative route was taken
    #[serde(default)]
    pub defaulted: bool,
}

impl Classification {
    /// Most conservative route: treat as scanned with no table confidence.
    pub fn conservative_default() -> Self {
        Self {
            is_scanned: true,
            has_text_layer: false,
            has_tables: false,
            table_likelihood: 0.0,
            document_type: DocumentType::Unknown,
            confidence: 0.0,
            defaulted: true,
        }
    }
}

/// Layout role of an extracted region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Header,
    KeyValue,
    Text,
    Table,
    Footer,
}

/// Normalized (0.0 - 1.0) page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A region reported by the extraction capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub kind: RegionKind,
    /// Label of a key/value region
    #[serde(default)]
    pub key: Option<String>,
    pub text: String,
    /// Cell grid of a table region, header row first
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
    pub confidence: f32,
    /// Position within the page's reading order
    #[serde(default)]
    pub reading_order: u32,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

impl Region {
    pub fn text(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            kind: RegionKind::Text,
            key: None,
            text: text.into(),
            rows: Vec::new(),
            confidence,
            reading_order: 0,
            bbox: None,
        }
    }

    pub fn key_value(key: impl Into<String>, value: impl Into<String>, confidence: f32) -> Self {
        Self {
            kind: RegionKind::KeyValue,
            key: Some(key.into()),
            ..Self::text(value, confidence)
        }
    }

    pub fn table(rows: Vec<Vec<String>>, confidence: f32) -> Self {
        let text = rows
            .iter()
            .map(|row| row.join(" | "))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            kind: RegionKind::Table,
            rows,
            ..Self::text(text, confidence)
        }
    }

    pub fn with_kind(mut self, kind: RegionKind) -> Self {
        self.kind = kind;
        self
    }
}

/// One page handed to the extraction capability.
#[derive(Debug, Clone)]
pub struct PageInput {
    pub fingerprint: Fingerprint,
    pub page_index: u32,
    pub page_count: u32,
    pub mime_type: String,
    /// Page content; for container formats (PDF) the whole document, addressed by `page_index`
    pub bytes: Arc<[u8]>,
}

/// What the extraction capability returns for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageAnalysis {
    pub regions: Vec<Region>,
    pub text: String,
    pub confidence: f32,
    /// Indices into `regions` in reading order; empty means emission order
    #[serde(default)]
    pub reading_order: Vec<usize>,
}

/// Why a page ended up without usable output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageError {
    pub message: String,
    pub timed_out: bool,
}

/// Aggregated per-page result. A failed page carries `error` and empty content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageExtraction {
    pub page_index: u32,
    pub regions: Vec<Region>,
    pub text: String,
    pub confidence: f32,
    pub reading_order: Vec<usize>,
    pub attempts: u32,
    #[serde(default)]
    pub error: Option<PageError>,
}

impl PageExtraction {
    pub fn failed(page_index: u32, attempts: u32, error: PageError) -> Self {
        Self {
            page_index,
            regions: Vec::new(),
            text: String::new(),
            confidence: 0.0,
            reading_order: Vec::new(),
            attempts,
            error: Some(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Ordered per-page extraction output for a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawExtraction {
    pub pages: Vec<PageExtraction>,
}

impl RawExtraction {
    pub fn failed_pages(&self) -> impl Iterator<Item = &PageExtraction> {
        self.pages.iter().filter(|p| p.is_failed())
    }

    pub fn all_failed(&self) -> bool {
        !self.pages.is_empty() && self.pages.iter().all(|p| p.is_failed())
    }

    /// Every region of every successful page, in page then reading order.
    pub fn regions(&self) -> impl Iterator<Item = (u32, &Region)> {
        self.pages
            .iter()
            .filter(|p| !p.is_failed())
            .flat_map(|p| p.regions.iter().map(move |r| (p.page_index, r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conservative_default() {
        let c = Classification::conservative_default();
        assert!(c.is_scanned);
        assert!(!c.has_tables);
        assert_eq!(c.table_likelihood, 0.0);
        assert!(c.defaulted);
    }

    #[test]
    fn test_raw_extraction_partial_pages() {
        let ok = PageExtraction {
            page_index: 0,
            regions: vec![Region::key_value("Total", "10.00", 0.9)],
            text: "Total: 10.00".into(),
            confidence: 0.9,
            reading_order: vec![0],
            attempts: 1,
            error: None,
        };
        let failed = PageExtraction::failed(
            1,
            3,
            PageError {
                message: "timed out".into(),
                timed_out: true,
            },
        );
        let raw = RawExtraction {
            pages: vec![ok, failed],
        };

        assert!(!raw.all_failed());
        assert_eq!(raw.failed_pages().count(), 1);
        assert_eq!(raw.regions().count(), 1);
    }

    #[test]
    fn test_table_region_text() {
        let region = Region::table(
            vec![
                vec!["Item".into(), "Amount".into()],
                vec!["Widget".into(), "5.00".into()],
            ],
            0.8,
        );
        assert_eq!(region.kind, RegionKind::Table);
        assert_eq!(region.text, "Item | Amount\nWidget | 5.00");
    }
}
