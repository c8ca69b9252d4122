//! Canonical financial record, validation results, and load statuses.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Neg, Sub};
use std::str::FromStr;

use crate::document::DocumentType;
use crate::error::{CoreError, Result};
use crate::types::PipelineVersion;

/// Version of the canonical schema emitted by the transformer.
pub const SCHEMA_VERSION: &str = "1.0";

/// Monetary amount in minor units (hundredths).
///
/// Operators saturate at the `i64` bounds; use `checked_add`/`checked_sub`
/// where an overflow must be reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub fn from_f64(value: f64) -> Self {
        Self((value * 100.0).round() as i64)
    }

    pub fn minor(&self) -> i64 {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn abs(&self) -> Self {
        Self(self.0.saturating_abs())
    }

    /// `None` when the sum leaves the representable range.
    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Multiply by a (possibly fractional) quantity, rounding to the nearest minor unit.
    pub fn mul_f64(&self, factor: f64) -> Self {
        Self((self.0 as f64 * factor).round() as i64)
    }

    /// `percent` % of this amount.
    pub fn percent(&self, percent: f64) -> Self {
        self.mul_f64(percent / 100.0)
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Amount {
    type Err = CoreError;

    /// Parses plain decimal notation (`-1234.5`). Digits past the
    /// hundredths are rounded half away from zero.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidAmount(s.to_string());
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut frac_digits = frac.chars().filter_map(|c| c.to_digit(10)).map(i64::from);
        let tenths = frac_digits.next().unwrap_or(0);
        let hundredths = frac_digits.next().unwrap_or(0);
        let round_up = frac_digits.next().map(|d| d >= 5).unwrap_or(false);

        let minor = whole
            .checked_mul(100)
            .and_then(|m| m.checked_add(tenths * 10 + hundredths + i64::from(round_up)))
            .ok_or_else(invalid)?;
        Ok(Self(if negative { -minor } else { minor }))
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        Amount(self.0.saturating_neg())
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(f64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Number(n) => Ok(Amount::from_f64(n)),
        }
    }
}

/// ISO-4217 alphabetic currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(code: &str) -> Result<Self> {
        let code = code.trim();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code.to_ascii_uppercase()))
        } else {
            Err(CoreError::InvalidCurrency(code.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Page and reading-order position of the region a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub page_index: u32,
    pub reading_order: u32,
}

impl SourceRef {
    pub fn new(page_index: u32, reading_order: u32) -> Self {
        Self {
            page_index,
            reading_order,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: Option<String>,
    pub quantity: Option<f64>,
    pub unit_price: Option<Amount>,
    pub total: Option<Amount>,
    pub confidence: f32,
    pub source: SourceRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentDates {
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
}

/// Normalized financial document every downstream consumer agrees on.
///
/// Only `total` and `currency` are mandatory. Every other field is absent when
/// the document did not yield a value; nothing is defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub schema_version: String,
    /// Fingerprint of the source document
    pub document_id: String,
    pub pipeline_version: PipelineVersion,
    pub document_type: DocumentType,
    pub vendor: Option<String>,
    pub invoice_number: Option<String>,
    pub dates: DocumentDates,
    pub line_items: Vec<LineItem>,
    pub subtotal: Option<Amount>,
    pub tax: Option<Amount>,
    pub discount: Option<Amount>,
    pub total: Amount,
    pub currency: CurrencyCode,
    pub confidence_per_field: BTreeMap<String, f32>,
    pub provenance: BTreeMap<String, SourceRef>,
}

impl CanonicalRecord {
    pub fn new(
        document_id: impl Into<String>,
        pipeline_version: PipelineVersion,
        total: Amount,
        currency: CurrencyCode,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            document_id: document_id.into(),
            pipeline_version,
            document_type: DocumentType::Unknown,
            vendor: None,
            invoice_number: None,
            dates: DocumentDates::default(),
            line_items: Vec::new(),
            subtotal: None,
            tax: None,
            discount: None,
            total,
            currency,
            confidence_per_field: BTreeMap::new(),
            provenance: BTreeMap::new(),
        }
    }

    pub fn with_subtotal(mut self, subtotal: Amount) -> Self {
        self.subtotal = Some(subtotal);
        self
    }

    pub fn with_tax(mut self, tax: Amount) -> Self {
        self.tax = Some(tax);
        self
    }

    pub fn with_line_item(mut self, item: LineItem) -> Self {
        self.line_items.push(item);
        self
    }

    pub fn with_dates(mut self, invoice_date: Option<NaiveDate>, due_date: Option<NaiveDate>) -> Self {
        self.dates = DocumentDates {
            invoice_date,
            due_date,
        };
        self
    }

    pub fn with_confidence(mut self, field: &str, confidence: f32) -> Self {
        self.confidence_per_field.insert(field.to_string(), confidence);
        self
    }

    /// Upsert key shared by every sink.
    pub fn upsert_key(&self) -> String {
        format!("{}:{}", self.document_id, self.pipeline_version)
    }
}

/// Kind of finding produced by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    TotalMismatch,
    SubtotalMismatch,
    LineItemMismatch,
    MissingRequiredField,
    DateOrder,
    LowConfidence,
    ArithmeticUnverifiable,
    /// An amount or sum outside the representable range
    AmountOutOfRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub field: Option<String>,
    pub message: String,
    pub difference: Option<Amount>,
}

impl ValidationIssue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            field: None,
            message: message.into(),
            difference: None,
        }
    }

    pub fn for_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_difference(mut self, difference: Amount) -> Self {
        self.difference = Some(difference);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArithmeticCheck {
    pub name: String,
    pub expected: Amount,
    pub actual: Amount,
    pub difference: Amount,
    pub tolerance: Amount,
    pub passed: bool,
}

/// Outcome of validating a canonical record. Errors block loading; warnings never do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub field_confidence: BTreeMap<String, f32>,
    pub arithmetic_checks: Vec<ArithmeticCheck>,
}

impl ValidationResult {
    pub fn error(&self, code: IssueCode) -> Option<&ValidationIssue> {
        self.errors.iter().find(|e| e.code == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadStatus {
    Pending,
    Success,
    FailedPermanent,
}

/// Per-sink outcome of the fan-out write for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTargetStatus {
    pub target_name: String,
    pub required: bool,
    pub status: LoadStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub written_at: Option<DateTime<Utc>>,
    /// Retry-exhausted writes that need an operator
    #[serde(default)]
    pub remediation_required: bool,
}

impl LoadTargetStatus {
    pub fn pending(target_name: impl Into<String>, required: bool) -> Self {
        Self {
            target_name: target_name.into(),
            required,
            status: LoadStatus::Pending,
            attempts: 0,
            last_error: None,
            written_at: None,
            remediation_required: false,
        }
    }

    pub fn succeeded(mut self, attempts: u32) -> Self {
        self.status = LoadStatus::Success;
        self.attempts = attempts;
        self.written_at = Some(Utc::now());
        self
    }

    pub fn failed(mut self, attempts: u32, error: impl Into<String>) -> Self {
        self.status = LoadStatus::FailedPermanent;
        self.attempts = attempts;
        self.last_error = Some(error.into());
        self.remediation_required = true;
        self
    }
}
