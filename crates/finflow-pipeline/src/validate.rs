//! Validator
//!
//! Arithmetic and business-rule checks over a canonical record. Errors block
//! loading; warnings are informational.

use tracing::debug;

use finflow_core::{
    Amount, ArithmeticCheck, CanonicalRecord, IssueCode, ValidationIssue, ValidationResult, ValidationSettings,
};

/// Deterministic record validation.
#[derive(Debug, Clone)]
pub struct Validator {
    settings: ValidationSettings,
}

#[derive(Default)]
struct Findings {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
    checks: Vec<ArithmeticCheck>,
}

impl Validator {
    pub fn new(settings: ValidationSettings) -> Self {
        Self { settings }
    }

    pub fn validate(&self, record: &CanonicalRecord) -> ValidationResult {
        let mut findings = Findings::default();

        self.check_required(record, &mut findings);
        let line_sum = self.check_line_items(record, &mut findings);
        self.check_subtotal(record, line_sum, &mut findings);
        self.check_total(record, line_sum, &mut findings);
        self.check_dates(record, &mut findings);
        self.check_confidence(record, &mut findings);

        let result = ValidationResult {
            is_valid: findings.errors.is_empty(),
            errors: findings.errors,
            warnings: findings.warnings,
            field_confidence: record.confidence_per_field.clone(),
            arithmetic_checks: findings.checks,
        };
        debug!(
            document_id = %record.document_id,
            is_valid = result.is_valid,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "Validated record"
        );
        result
    }

    /// `None` when the difference itself overflows; that is reported as an error.
    fn compare(
        &self,
        name: &str,
        expected: Amount,
        actual: Amount,
        findings: &mut Findings,
    ) -> Option<ArithmeticCheck> {
        let Some(difference) = actual.checked_sub(expected).map(|d| d.abs()) else {
            out_of_range(name, findings);
            return None;
        };
        let tolerance = self.settings.tolerance.allowance(expected);
        let check = ArithmeticCheck {
            name: name.to_string(),
            expected,
            actual,
            difference,
            tolerance,
            passed: difference <= tolerance,
        };
        findings.checks.push(check.clone());
        Some(check)
    }

    fn check_required(&self, record: &CanonicalRecord, findings: &mut Findings) {
        for field in &self.settings.required_fields {
            let present = match field.as_str() {
                "vendor" => record.vendor.is_some(),
                "invoice_number" => record.invoice_number.is_some(),
                "invoice_date" => record.dates.invoice_date.is_some(),
                "due_date" => record.dates.due_date.is_some(),
                "line_items" => !record.line_items.is_empty(),
                "subtotal" => record.subtotal.is_some(),
                "tax" => record.tax.is_some(),
                "total" => true,
                "currency" => !record.currency.as_str().is_empty(),
                _ => true,
            };
            if !present {
                findings.errors.push(
                    ValidationIssue::new(IssueCode::MissingRequiredField, format!("required field {} is missing", field))
                        .for_field(field.clone()),
                );
            }
        }
    }

    /// Per-line `quantity x unit_price` checks; returns the line sum when every
    /// line has a usable total.
    fn check_line_items(&self, record: &CanonicalRecord, findings: &mut Findings) -> Option<Amount> {
        if record.line_items.is_empty() {
            return None;
        }

        let mut sum = Amount::ZERO;
        let mut complete = true;
        for (index, item) in record.line_items.iter().enumerate() {
            let extended = match (item.quantity, item.unit_price) {
                (Some(quantity), Some(price)) => Some(price.mul_f64(quantity)),
                _ => None,
            };

            let counted = match (item.total, extended) {
                (Some(total), Some(extended)) => {
                    let check = self.compare(&format!("line_items[{}]", index), extended, total, findings);
                    if let Some(check) = check.filter(|c| !c.passed) {
                        findings.warnings.push(
                            ValidationIssue::new(
                                IssueCode::LineItemMismatch,
                                format!(
                                    "line {}: quantity x unit price is {}, line total is {}",
                                    index + 1,
                                    extended,
                                    total
                                ),
                            )
                            .for_field(format!("line_items[{}]", index))
                            .with_difference(check.difference),
                        );
                    }
                    Some(total)
                }
                (Some(total), None) => Some(total),
                (None, Some(extended)) => Some(extended),
                (None, None) => None,
            };

            match counted {
                Some(amount) => match sum.checked_add(amount) {
                    Some(next) => sum = next,
                    None => {
                        out_of_range("line_items", findings);
                        return None;
                    }
                },
                None => complete = false,
            }
        }

        if complete {
            Some(sum)
        } else {
            findings.warnings.push(
                ValidationIssue::new(
                    IssueCode::ArithmeticUnverifiable,
                    "line items without amounts, line sum not checked",
                )
                .for_field("line_items"),
            );
            None
        }
    }

    fn check_subtotal(&self, record: &CanonicalRecord, line_sum: Option<Amount>, findings: &mut Findings) {
        let (Some(subtotal), Some(line_sum)) = (record.subtotal, line_sum) else {
            return;
        };
        let Some(check) = self.compare("line_items_sum", subtotal, line_sum, findings) else {
            return;
        };
        if !check.passed {
            findings.errors.push(
                ValidationIssue::new(
                    IssueCode::SubtotalMismatch,
                    format!(
                        "subtotal mismatch: expected {}, line items sum to {} (difference {})",
                        subtotal, line_sum, check.difference
                    ),
                )
                .for_field("subtotal")
                .with_difference(check.difference),
            );
        }
    }

    /// `subtotal + tax - discount ~ total`, with an absent tax or discount
    /// counted as zero.
    fn check_total(&self, record: &CanonicalRecord, line_sum: Option<Amount>, findings: &mut Findings) {
        let Some(basis) = record.subtotal.or(line_sum) else {
            findings.warnings.push(
                ValidationIssue::new(
                    IssueCode::ArithmeticUnverifiable,
                    "no subtotal or line items, total not checked",
                )
                .for_field("total"),
            );
            return;
        };

        let expected = basis
            .checked_add(record.tax.unwrap_or(Amount::ZERO))
            .and_then(|sum| sum.checked_sub(record.discount.unwrap_or(Amount::ZERO)));
        let Some(expected) = expected else {
            out_of_range("total", findings);
            return;
        };
        let Some(check) = self.compare("total", expected, record.total, findings) else {
            return;
        };
        if !check.passed {
            findings.errors.push(
                ValidationIssue::new(
                    IssueCode::TotalMismatch,
                    format!(
                        "total mismatch: expected {}, found {} (difference {})",
                        expected, record.total, check.difference
                    ),
                )
                .for_field("total")
                .with_difference(check.difference),
            );
        }
    }

    fn check_dates(&self, record: &CanonicalRecord, findings: &mut Findings) {
        if let (Some(issued), Some(due)) = (record.dates.invoice_date, record.dates.due_date) {
            if issued > due {
                findings.errors.push(
                    ValidationIssue::new(
                        IssueCode::DateOrder,
                        format!("invoice date {} is after due date {}", issued, due),
                    )
                    .for_field("due_date"),
                );
            }
        }
    }

    fn check_confidence(&self, record: &CanonicalRecord, findings: &mut Findings) {
        for (field, confidence) in &record.confidence_per_field {
            if *confidence < self.settings.confidence_floor {
                findings.warnings.push(
                    ValidationIssue::new(
                        IssueCode::LowConfidence,
                        format!(
                            "{} confidence {:.2} is below {:.2}",
                            field, confidence, self.settings.confidence_floor
                        ),
                    )
                    .for_field(field.clone()),
                );
            }
        }
    }
}

fn out_of_range(field: &str, findings: &mut Findings) {
    findings.errors.push(
        ValidationIssue::new(
            IssueCode::AmountOutOfRange,
            format!("{} arithmetic exceeds the supported amount range", field),
        )
        .for_field(field),
    );
}
