//! Built-in extraction adapter for pages that already carry text.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use finflow_core::{AdapterError, ExtractionAdapter, PageAnalysis, PageInput, Region, RegionKind};

use crate::intake::MIME_TEXT;

const KEY_VALUE_CONFIDENCE: f32 = 0.95;
const LINE_CONFIDENCE: f32 = 0.9;
const TABLE_CONFIDENCE: f32 = 0.9;
/// Leading plain lines of the first page tagged as header regions.
const HEADER_LINES: usize = 3;

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z][A-Za-z0-9 .#&()/%'-]{0,40}?)\s*:\s*(\S.*?)\s*$").expect("valid key/value regex")
});

static SEPARATOR_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\s|:+=-]+$").expect("valid separator regex"));

/// Turns each line of a plain-text page into a region, in reading order.
///
/// `Label: value` lines become key/value regions and runs of pipe- or
/// tab-separated lines become a single table region. PDF and image pages
/// are refused as permanent errors.
#[derive(Debug, Clone, Default)]
pub struct TextLayerExtractor;

impl TextLayerExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Analyze page text without going through the async trait.
    pub fn analyze_text(&self, page_index: u32, text: &str) -> PageAnalysis {
        let mut regions = Vec::new();
        let mut table: Vec<Vec<String>> = Vec::new();
        let mut plain_lines = 0usize;

        for line in text.lines() {
            let trimmed = line.trim();

            if let Some(cells) = table_cells(line) {
                if !SEPARATOR_ROW.is_match(trimmed) {
                    table.push(cells);
                }
                continue;
            }
            if !table.is_empty() {
                regions.push(Region::table(std::mem::take(&mut table), TABLE_CONFIDENCE));
            }
            if trimmed.is_empty() {
                continue;
            }

            if let Some(caps) = KEY_VALUE.captures(trimmed) {
                regions.push(Region::key_value(&caps[1], &caps[2], KEY_VALUE_CONFIDENCE));
                continue;
            }

            let kind = if page_index == 0 && plain_lines < HEADER_LINES {
                RegionKind::Header
            } else {
                RegionKind::Text
            };
            plain_lines += 1;
            regions.push(Region::text(trimmed, LINE_CONFIDENCE).with_kind(kind));
        }
        if !table.is_empty() {
            regions.push(Region::table(table, TABLE_CONFIDENCE));
        }

        let confidence = if regions.is_empty() {
            0.0
        } else {
            regions.iter().map(|r| r.confidence).sum::<f32>() / regions.len() as f32
        };

        PageAnalysis {
            regions,
            text: text.to_string(),
            confidence,
            reading_order: Vec::new(),
        }
    }
}

fn table_cells(line: &str) -> Option<Vec<String>> {
    let trimmed = line.trim();
    let cells: Vec<String> = if trimmed.contains('|') {
        trimmed
            .trim_matches('|')
            .split('|')
            .map(|c| c.trim().to_string())
            .collect()
    } else if line.contains('\t') {
        trimmed.split('\t').map(|c| c.trim().to_string()).collect()
    } else {
        return None;
    };
    (cells.len() >= 2).then_some(cells)
}

#[async_trait]
impl ExtractionAdapter for TextLayerExtractor {
    async fn analyze(&self, page: &PageInput) -> Result<PageAnalysis, AdapterError> {
        if page.mime_type != MIME_TEXT {
            return Err(AdapterError::Permanent(format!(
                "no text layer reader for {}",
                page.mime_type
            )));
        }
        let text = String::from_utf8_lossy(&page.bytes);
        Ok(self.analyze_text(page.page_index, &text))
    }

    fn name(&self) -> &str {
        "text-layer"
    }
}
