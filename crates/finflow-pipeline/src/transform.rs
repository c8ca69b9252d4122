//! Transformer
//!
//! Deterministic mapping from per-page regions to a [`CanonicalRecord`].
//!
//! Every region that names a canonical field offers a candidate value. When a
//! field has several candidates the highest confidence wins and ties go to the
//! earliest position in reading order. Fields without a candidate stay absent.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

use finflow_core::{
    Amount, CanonicalRecord, Classification, CurrencyCode, LineItem, PipelineVersion, RawExtraction, Region,
    RegionKind, SourceRef, TransformSettings,
};

use crate::normalize::{detect_currency, label_key, normalize_label, parse_amount, parse_date, parse_quantity};
use crate::PipelineError;

/// Confidence multiplier for `Label value` lines that lack a colon.
const UNDELIMITED_PENALTY: f32 = 0.9;

const TITLE_WORDS: [&str; 8] = [
    "invoice",
    "tax invoice",
    "receipt",
    "sales receipt",
    "statement",
    "credit note",
    "bill",
    "proforma invoice",
];

static LABELLED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z][A-Za-z0-9 .#&()/%'-]{0,40}?)\s*:\s*(\S.*?)\s*$").expect("valid labelled line regex")
});

/// Canonical header fields the transformer fills from labelled regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Vendor,
    InvoiceNumber,
    InvoiceDate,
    DueDate,
    Subtotal,
    Tax,
    Discount,
    Total,
    Currency,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::Vendor,
        Field::InvoiceNumber,
        Field::InvoiceDate,
        Field::DueDate,
        Field::Subtotal,
        Field::Tax,
        Field::Discount,
        Field::Total,
        Field::Currency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Vendor => "vendor",
            Field::InvoiceNumber => "invoice_number",
            Field::InvoiceDate => "invoice_date",
            Field::DueDate => "due_date",
            Field::Subtotal => "subtotal",
            Field::Tax => "tax",
            Field::Discount => "discount",
            Field::Total => "total",
            Field::Currency => "currency",
        }
    }

    fn synonyms(&self) -> &'static [&'static str] {
        match self {
            Field::Vendor => &[
                "vendor", "supplier", "seller", "from", "bill from", "company", "merchant", "issued by", "sold by",
                "payee",
            ],
            Field::InvoiceNumber => &[
                "invoice number",
                "invoice no",
                "invoice",
                "inv no",
                "inv",
                "invoice id",
                "receipt number",
                "receipt no",
                "document number",
                "bill number",
            ],
            Field::InvoiceDate => &["invoice date", "date", "issue date", "date of issue", "billing date", "issued"],
            Field::DueDate => &["due date", "payment due", "due", "pay by", "due by"],
            Field::Subtotal => &["subtotal", "sub total", "net amount", "net total", "total before tax", "net"],
            Field::Tax => &["tax", "vat", "sales tax", "gst", "hst", "tax amount", "vat amount"],
            Field::Discount => &["discount", "less discount", "rebate"],
            Field::Total => &[
                "total",
                "amount due",
                "total due",
                "grand total",
                "balance due",
                "total amount",
                "invoice total",
                "amount payable",
                "total payable",
            ],
            Field::Currency => &["currency", "currency code"],
        }
    }

    /// Field named by a free-form label such as `Invoice No.` or `VAT (20%)`.
    pub fn from_label(label: &str) -> Option<Field> {
        let key = label_key(label);
        if key.is_empty() {
            return None;
        }
        Field::ALL
            .iter()
            .copied()
            .find(|field| field.synonyms().contains(&key.as_str()))
    }

    fn is_amount(&self) -> bool {
        matches!(self, Field::Subtotal | Field::Tax | Field::Discount | Field::Total)
    }

    fn is_date(&self) -> bool {
        matches!(self, Field::InvoiceDate | Field::DueDate)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Text(String),
    Amount(Amount),
    Date(NaiveDate),
    Currency(CurrencyCode),
}

#[derive(Debug, Clone)]
struct Candidate {
    value: Value,
    confidence: f32,
    source: SourceRef,
}

/// Column roles of a line-item table header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Description,
    Quantity,
    UnitPrice,
    Amount,
}

impl Column {
    fn from_header(cell: &str) -> Option<Column> {
        match normalize_label(cell).as_str() {
            "description" | "item" | "items" | "product" | "service" | "details" | "particulars" => {
                Some(Column::Description)
            }
            "qty" | "quantity" | "units" | "hours" | "hrs" => Some(Column::Quantity),
            "unit price" | "price" | "rate" | "unit cost" | "price per unit" => Some(Column::UnitPrice),
            "amount" | "total" | "line total" | "ext price" | "extended" | "net amount" => Some(Column::Amount),
            _ => None,
        }
    }
}

/// A region attached to a rejection for diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRegion {
    pub page_index: u32,
    pub region: Region,
}

/// Deterministic transformation failure. Never retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{reason}")]
pub struct TransformRejection {
    pub reason: String,
    /// Mandatory fields no region could supply
    pub missing: Vec<String>,
    /// Every region the transformer saw
    pub regions: Vec<RejectedRegion>,
}

impl TransformRejection {
    /// Diagnostic payload stored with the rejected run.
    pub fn detail(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<TransformRejection> for PipelineError {
    fn from(rejection: TransformRejection) -> Self {
        PipelineError::Rejected {
            reason: rejection.reason.clone(),
            detail: rejection.detail(),
        }
    }
}

/// Maps raw extraction output onto the canonical schema.
#[derive(Debug, Clone)]
pub struct Transformer {
    settings: TransformSettings,
    version: PipelineVersion,
}

impl Transformer {
    pub fn new(settings: TransformSettings, version: PipelineVersion) -> Self {
        Self { settings, version }
    }

    pub fn version(&self) -> &PipelineVersion {
        &self.version
    }

    pub fn transform(
        &self,
        document_id: &str,
        classification: &Classification,
        raw: &RawExtraction,
    ) -> Result<CanonicalRecord, TransformRejection> {
        let mut collector = Collector::new(&self.settings);
        for (page_index, region) in raw.regions() {
            collector.collect_region(page_index, region);
        }
        collector.collect_header_vendor(raw);

        let total = collector.resolve(Field::Total);
        let currency = collector.resolve(Field::Currency);
        let (total, currency) = match (total, currency) {
            (Some((Value::Amount(total), total_src)), Some((Value::Currency(currency), currency_src))) => {
                ((total, total_src), (currency, currency_src))
            }
            (total, currency) => {
                let mut missing = Vec::new();
                if total.is_none() {
                    missing.push(Field::Total.as_str().to_string());
                }
                if currency.is_none() {
                    missing.push(Field::Currency.as_str().to_string());
                }
                return Err(TransformRejection {
                    reason: format!("missing required field(s): {}", missing.join(", ")),
                    missing,
                    regions: raw
                        .regions()
                        .map(|(page_index, region)| RejectedRegion {
                            page_index,
                            region: region.clone(),
                        })
                        .collect(),
                });
            }
        };

        let mut record = CanonicalRecord::new(document_id, self.version.clone(), total.0, currency.0);
        record.document_type = classification.document_type;
        record.provenance.insert(Field::Total.as_str().to_string(), total.1.source);
        record
            .confidence_per_field
            .insert(Field::Total.as_str().to_string(), total.1.confidence);
        record
            .provenance
            .insert(Field::Currency.as_str().to_string(), currency.1.source);
        record
            .confidence_per_field
            .insert(Field::Currency.as_str().to_string(), currency.1.confidence);

        for field in Field::ALL {
            if matches!(field, Field::Total | Field::Currency) {
                continue;
            }
            let Some((value, winner)) = collector.resolve(field) else {
                continue;
            };
            match (field, value) {
                (Field::Vendor, Value::Text(v)) => record.vendor = Some(v),
                (Field::InvoiceNumber, Value::Text(v)) => record.invoice_number = Some(v),
                (Field::InvoiceDate, Value::Date(d)) => record.dates.invoice_date = Some(d),
                (Field::DueDate, Value::Date(d)) => record.dates.due_date = Some(d),
                (Field::Subtotal, Value::Amount(a)) => record.subtotal = Some(a),
                (Field::Tax, Value::Amount(a)) => record.tax = Some(a),
                (Field::Discount, Value::Amount(a)) => record.discount = Some(a),
                _ => continue,
            }
            record.provenance.insert(field.as_str().to_string(), winner.source);
            record
                .confidence_per_field
                .insert(field.as_str().to_string(), winner.confidence);
        }

        if !collector.line_items.is_empty() {
            let lowest = collector
                .line_items
                .iter()
                .map(|item| item.confidence)
                .fold(1.0_f32, f32::min);
            record.confidence_per_field.insert("line_items".to_string(), lowest);
        }
        record.line_items = collector.line_items;

        debug!(
            document_id = %record.document_id,
            fields = record.provenance.len(),
            line_items = record.line_items.len(),
            "Transformed document"
        );
        Ok(record)
    }
}

struct Collector<'a> {
    settings: &'a TransformSettings,
    candidates: BTreeMap<Field, Vec<Candidate>>,
    line_items: Vec<LineItem>,
}

impl<'a> Collector<'a> {
    fn new(settings: &'a TransformSettings) -> Self {
        Self {
            settings,
            candidates: BTreeMap::new(),
            line_items: Vec::new(),
        }
    }

    fn push(&mut self, field: Field, value: Value, confidence: f32, source: SourceRef) {
        self.candidates.entry(field).or_default().push(Candidate {
            value,
            confidence,
            source,
        });
    }

    /// Parse `raw` for `field`; returns false when the text is not a value of that kind.
    fn offer(&mut self, field: Field, raw: &str, confidence: f32, source: SourceRef) -> bool {
        let raw = raw.trim();
        if raw.is_empty() {
            return false;
        }
        let value = match field {
            Field::Vendor | Field::InvoiceNumber => Value::Text(raw.to_string()),
            Field::InvoiceDate | Field::DueDate => match parse_date(raw, self.settings.date_order) {
                Some(date) => Value::Date(date),
                None => return false,
            },
            Field::Currency => match detect_currency(raw).or_else(|| CurrencyCode::new(raw).ok()) {
                Some(code) => Value::Currency(code),
                None => return false,
            },
            Field::Subtotal | Field::Tax | Field::Discount | Field::Total => {
                let Some(amount) = parse_amount(raw) else {
                    return false;
                };
                if let Some(code) = detect_currency(raw) {
                    self.push(Field::Currency, Value::Currency(code), confidence, source);
                }
                // Discounts are subtracted; the sign on the page is presentation.
                let amount = if field == Field::Discount { amount.abs() } else { amount };
                Value::Amount(amount)
            }
        };
        self.push(field, value, confidence, source);
        true
    }

    fn collect_region(&mut self, page_index: u32, region: &Region) {
        let source = SourceRef::new(page_index, region.reading_order);
        match region.kind {
            RegionKind::KeyValue => {
                if let Some(field) = region.key.as_deref().and_then(Field::from_label) {
                    self.offer(field, &region.text, region.confidence, source);
                }
            }
            RegionKind::Table => self.collect_table(region, source),
            RegionKind::Header | RegionKind::Text | RegionKind::Footer => {
                for line in region.text.lines() {
                    self.collect_line(line, region.confidence, source);
                }
            }
        }
    }

    fn collect_line(&mut self, line: &str, confidence: f32, source: SourceRef) {
        if let Some(caps) = LABELLED_LINE.captures(line) {
            if let Some(field) = Field::from_label(&caps[1]) {
                self.offer(field, &caps[2], confidence, source);
                return;
            }
        }

        // `Total 108.00`: longest leading label naming an amount or date field.
        let tokens: Vec<&str> = line.split_whitespace().collect();
        for split in (1..tokens.len()).rev() {
            let Some(field) = Field::from_label(&tokens[..split].join(" ")) else {
                continue;
            };
            if !(field.is_amount() || field.is_date()) {
                continue;
            }
            let value = tokens[split..].join(" ");
            if self.offer(field, &value, confidence * UNDELIMITED_PENALTY, source) {
                return;
            }
        }
    }

    fn collect_table(&mut self, region: &Region, source: SourceRef) {
        let Some((header, body)) = region.rows.split_first() else {
            return;
        };
        let columns: Vec<Option<Column>> = header.iter().map(|cell| Column::from_header(cell)).collect();
        let recognized = columns.iter().flatten().count();
        let is_line_table = recognized >= 2
            && columns
                .iter()
                .any(|c| matches!(c, Some(Column::Description) | Some(Column::Amount)));

        if !is_line_table {
            for row in &region.rows {
                self.collect_pair_row(row, region.confidence, source);
            }
            return;
        }

        for row in body {
            if row.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            if self.collect_summary_row(row, region.confidence, source) {
                continue;
            }

            let cell = |wanted: Column| {
                columns
                    .iter()
                    .position(|c| *c == Some(wanted))
                    .and_then(|i| row.get(i))
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
            };

            let description = cell(Column::Description).map(str::to_string);
            let quantity = cell(Column::Quantity).and_then(parse_quantity);
            let unit_price = cell(Column::UnitPrice).and_then(parse_amount);
            let total = cell(Column::Amount).and_then(parse_amount);
            if description.is_none() && total.is_none() {
                continue;
            }
            for priced in [cell(Column::UnitPrice), cell(Column::Amount)].into_iter().flatten() {
                if let Some(code) = detect_currency(priced) {
                    self.push(Field::Currency, Value::Currency(code), region.confidence, source);
                }
            }

            self.line_items.push(LineItem {
                description,
                quantity,
                unit_price,
                total,
                confidence: region.confidence,
                source,
            });
        }
    }

    /// `Subtotal | | | 100.00` rows inside a line-item table.
    fn collect_summary_row(&mut self, row: &[String], confidence: f32, source: SourceRef) -> bool {
        let mut cells = row.iter().map(|c| c.trim()).filter(|c| !c.is_empty());
        let Some(label) = cells.next() else {
            return false;
        };
        let Some(field) = Field::from_label(label).filter(|f| f.is_amount()) else {
            return false;
        };
        match cells.last() {
            Some(value) => self.offer(field, value, confidence, source),
            None => false,
        }
    }

    /// Two-column `label | value` tables.
    fn collect_pair_row(&mut self, row: &[String], confidence: f32, source: SourceRef) {
        let mut cells = row.iter().map(|c| c.trim()).filter(|c| !c.is_empty());
        let (Some(label), Some(value)) = (cells.next(), cells.last()) else {
            return;
        };
        if let Some(field) = Field::from_label(label) {
            self.offer(field, value, confidence, source);
        }
    }

    /// Fall back to the first name-like line of the first page's header band.
    fn collect_header_vendor(&mut self, raw: &RawExtraction) {
        let band = self.settings.header_band as u32;
        let header = raw.regions().find(|(page_index, region)| {
            *page_index == 0
                && (region.kind == RegionKind::Header
                    || (region.kind == RegionKind::Text && region.reading_order < band))
                && is_vendor_like(&region.text)
        });
        if let Some((page_index, region)) = header {
            let confidence = region.confidence * self.settings.header_vendor_penalty;
            let source = SourceRef::new(page_index, region.reading_order);
            self.offer(Field::Vendor, region.text.trim(), confidence, source);
        }
    }

    fn resolve(&self, field: Field) -> Option<(Value, Candidate)> {
        self.candidates
            .get(&field)?
            .iter()
            .min_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.source.cmp(&b.source))
            })
            .map(|winner| (winner.value.clone(), winner.clone()))
    }
}

fn is_vendor_like(text: &str) -> bool {
    let text = text.trim();
    let normalized = normalize_label(text);
    !normalized.is_empty()
        && text.len() <= 80
        && text.chars().any(char::is_alphabetic)
        && !text.chars().any(|c| c.is_ascii_digit())
        && !text.contains(':')
        && !TITLE_WORDS.contains(&normalized.as_str())
        && Field::from_label(text).is_none()
}
