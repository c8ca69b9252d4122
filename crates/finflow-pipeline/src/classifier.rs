//! Cheap routing heuristics run once per document.

use once_cell::sync::Lazy;
use regex::bytes::Regex as BytesRegex;
use tracing::{debug, warn};

use finflow_core::{Classification, ClassifierSettings, DocumentType, StagedDocument};

use crate::intake::{MIME_PDF, MIME_TEXT};

static PDF_TEXT_OPERATOR: Lazy<BytesRegex> =
    Lazy::new(|| BytesRegex::new(r"/Font\b|\bBT\s").expect("valid text operator regex"));

/// Produces a [`Classification`] from the staged bytes.
#[derive(Debug, Clone)]
pub struct Classifier {
    settings: ClassifierSettings,
}

impl Classifier {
    pub fn new(settings: ClassifierSettings) -> Self {
        Self { settings }
    }

    /// Classify, or explain why the heuristics could not run.
    pub fn classify(&self, staged: &StagedDocument, bytes: &[u8]) -> Result<Classification, String> {
        let mime = staged.mime_type.as_str();
        if mime.starts_with("image/") {
            return Ok(Classification {
                is_scanned: true,
                has_text_layer: false,
                has_tables: false,
                table_likelihood: 0.0,
                document_type: DocumentType::Unknown,
                confidence: 0.6,
                defaulted: false,
            });
        }

        let (has_text_layer, text) = match mime {
            MIME_TEXT => {
                let text = String::from_utf8_lossy(bytes);
                let ratio = printable_ratio(&text);
                if ratio < self.settings.text_layer_min_ratio {
                    return Err(format!(
                        "text is only {:.0}% printable",
                        ratio * 100.0
                    ));
                }
                (true, text.into_owned())
            }
            MIME_PDF => {
                let has_text = PDF_TEXT_OPERATOR.is_match(bytes);
                (has_text, String::from_utf8_lossy(bytes).into_owned())
            }
            other => return Err(format!("no heuristics for {}", other)),
        };

        if mime == MIME_TEXT && text.trim().is_empty() {
            return Err("document has no readable content".to_string());
        }

        let table_likelihood = if has_text_layer { table_likelihood(&text) } else { 0.0 };
        let document_type = guess_document_type(&text);

        let mut confidence: f32 = 0.4;
        if has_text_layer {
            confidence += 0.3;
        }
        if document_type != DocumentType::Unknown {
            confidence += 0.2;
        }
        if staged.page_count > 0 {
            confidence += 0.1;
        }

        let classification = Classification {
            is_scanned: !has_text_layer,
            has_text_layer,
            has_tables: table_likelihood >= self.settings.table_threshold,
            table_likelihood,
            document_type,
            confidence: confidence.min(1.0),
            defaulted: false,
        };
        debug!(
            fingerprint = %staged.fingerprint.short(),
            document_type = document_type.as_str(),
            table_likelihood,
            "Classified document"
        );
        Ok(classification)
    }

    /// Classification never fails a run: unclassifiable documents take the
    /// conservative route.
    pub fn classify_or_default(&self, staged: &StagedDocument, bytes: &[u8]) -> Classification {
        match self.classify(staged, bytes) {
            Ok(classification) => classification,
            Err(reason) => {
                warn!(
                    fingerprint = %staged.fingerprint.short(),
                    reason = %reason,
                    "Classification failed, using conservative default"
                );
                Classification::conservative_default()
            }
        }
    }
}

fn printable_ratio(text: &str) -> f32 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t' | '\x0C'))
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .count();
    printable as f32 / total as f32
}

/// Share of non-empty lines that look like table rows, doubled and capped at 1.
fn table_likelihood(text: &str) -> f32 {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return 0.0;
    }
    let tabular = lines.iter().filter(|line| is_tabular(line)).count();
    ((tabular as f32 / lines.len() as f32) * 2.0).min(1.0)
}

fn is_tabular(line: &str) -> bool {
    if line.matches('|').count() >= 2 || line.contains('\t') {
        return true;
    }
    // Columns aligned with runs of spaces, ending in a number.
    let columns = line.trim().split("  ").filter(|c| !c.trim().is_empty()).count();
    let ends_numeric = line
        .trim_end()
        .chars()
        .last()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);
    columns >= 3 && ends_numeric
}

fn guess_document_type(text: &str) -> DocumentType {
    let lower = text.to_lowercase();
    if lower.contains("credit note") || lower.contains("credit memo") {
        DocumentType::CreditNote
    } else if lower.contains("invoice") {
        DocumentType::Invoice
    } else if lower.contains("receipt") {
        DocumentType::Receipt
    } else if lower.contains("statement") {
        DocumentType::Statement
    } else {
        DocumentType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finflow_core::Fingerprint;

    fn staged(mime: &str, bytes: &[u8]) -> StagedDocument {
        StagedDocument {
            fingerprint: Fingerprint::of(bytes),
            raw_bytes_ref: "mem://test".into(),
            mime_type: mime.into(),
            page_count: 1,
            size_bytes: bytes.len() as u64,
        }
    }

    fn classifier() -> Classifier {
        Classifier::new(ClassifierSettings::default())
    }

    #[test]
    fn test_text_invoice_with_table() {
        let text = "INVOICE\nItem | Qty | Amount\nWidget | 2 | 10.00\nGadget | 1 | 5.00\nTotal: 15.00";
        let c = classifier().classify(&staged(MIME_TEXT, text.as_bytes()), text.as_bytes()).unwrap();
        assert!(c.has_text_layer);
        assert!(!c.is_scanned);
        assert!(c.has_tables);
        assert_eq!(c.document_type, DocumentType::Invoice);
        assert!(c.confidence > 0.9);
        assert!(!c.defaulted);
    }

    #[test]
    fn test_receipt_without_table() {
        let text = "Coffee Shop\nReceipt\nTotal: 4.50 EUR";
        let c = classifier().classify(&staged(MIME_TEXT, text.as_bytes()), text.as_bytes()).unwrap();
        assert_eq!(c.document_type, DocumentType::Receipt);
        assert!(!c.has_tables);
        assert_eq!(c.table_likelihood, 0.0);
    }

    #[test]
    fn test_image_is_scanned() {
        let bytes = b"\x89PNG\r\n\x1a\n";
        let c = classifier().classify(&staged("image/png", bytes), bytes).unwrap();
        assert!(c.is_scanned);
        assert!(!c.has_text_layer);
    }

    #[test]
    fn test_pdf_text_layer_detection() {
        let native = b"%PDF-1.7 /Type /Page /Resources << /Font << /F1 5 0 R >> >> BT (Invoice) Tj ET %%EOF";
        let c = classifier().classify(&staged(MIME_PDF, native), native).unwrap();
        assert!(c.has_text_layer);
        assert_eq!(c.document_type, DocumentType::Invoice);

        let scanned = b"%PDF-1.7 /Type /Page /XObject << /Im1 4 0 R >> %%EOF";
        let c = classifier().classify(&staged(MIME_PDF, scanned), scanned).unwrap();
        assert!(c.is_scanned);
    }

    #[test]
    fn test_unclassifiable_falls_back_to_default() {
        let blank = b"   \n\n  ";
        let classifier = classifier();
        assert!(classifier.classify(&staged(MIME_TEXT, blank), blank).is_err());

        let c = classifier.classify_or_default(&staged(MIME_TEXT, blank), blank);
        assert_eq!(c, Classification::conservative_default());
    }
}
