//! Lexical normalization of amounts, currencies, dates and field labels.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use finflow_core::{Amount, CurrencyCode, DateOrder};

/// ISO codes recognized inside free text.
const ISO_CODES: &str = "USD|EUR|GBP|JPY|CHF|CAD|AUD|NZD|SEK|NOK|DKK|PLN|CZK|HUF|INR|CNY|HKD|SGD|ZAR|MXN|BRL";

/// Currency symbols, longest first so `US$` wins over `$`.
const SYMBOLS: [(&str, &str); 10] = [
    ("US$", "USD"),
    ("CA$", "CAD"),
    ("AU$", "AUD"),
    ("C$", "CAD"),
    ("A$", "AUD"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("₹", "INR"),
    ("$", "USD"),
];

static ISO_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"\b({})\b", ISO_CODES)).expect("valid currency regex"));

static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[-/.](\d{1,2})[-/.](\d{1,2})$").expect("valid iso date regex"));

static DOTTED_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})\.(\d{1,2})\.(\d{2}|\d{4})$").expect("valid dotted date regex"));

static NUMERIC_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})[/-](\d{1,2})[/-](\d{2}|\d{4})$").expect("valid numeric date regex"));

static ORDINAL_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d)(st|nd|rd|th)\b").expect("valid ordinal regex"));

/// Parse a monetary amount written in any common notation.
///
/// Handles currency symbols and codes, `1,234.56` and `1.234,56`, space or
/// apostrophe thousands separators, and negatives written as `-12.00`,
/// `12.00-` or `(12.00)`.
pub fn parse_amount(raw: &str) -> Option<Amount> {
    let trimmed = raw.trim();
    let negative = trimmed.starts_with('-')
        || trimmed.ends_with('-')
        || (trimmed.contains('(') && trimmed.contains(')'));

    let kept: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    // Words other than currency markers mean this is not an amount ("INV-2024-001").
    if strip_currency_markers(trimmed).chars().any(char::is_alphabetic) {
        return None;
    }

    let canonical = match (kept.rfind('.'), kept.rfind(',')) {
        (Some(dot), Some(comma)) => {
            if dot > comma {
                kept.replace(',', "")
            } else {
                kept.replace('.', "").replace(',', ".")
            }
        }
        (None, Some(comma)) => {
            let decimals = kept.len() - comma - 1;
            if kept.matches(',').count() == 1 && decimals != 3 {
                kept.replace(',', ".")
            } else {
                kept.replace(',', "")
            }
        }
        (Some(_), None) if kept.matches('.').count() > 1 => kept.replace('.', ""),
        _ => kept,
    };

    let amount: Amount = canonical.parse().ok()?;
    Some(if negative { -amount } else { amount })
}

fn strip_currency_markers(raw: &str) -> String {
    let mut out = ISO_CODE.replace_all(raw, " ").to_string();
    for (symbol, _) in SYMBOLS {
        out = out.replace(symbol, " ");
    }
    out
}

/// Find the currency named by a symbol or ISO code in `raw`.
pub fn detect_currency(raw: &str) -> Option<CurrencyCode> {
    if let Some(m) = ISO_CODE.find(raw) {
        return CurrencyCode::new(m.as_str()).ok();
    }
    SYMBOLS
        .iter()
        .find(|(symbol, _)| raw.contains(symbol))
        .and_then(|(_, code)| CurrencyCode::new(code).ok())
}

/// Parse a date in ISO, dotted, month-name or slash/dash notation.
///
/// Ambiguous numeric dates are read in `order`; if that yields no valid
/// calendar date the other order is tried.
pub fn parse_date(raw: &str, order: DateOrder) -> Option<NaiveDate> {
    let cleaned = raw.trim().trim_end_matches('.');
    if cleaned.is_empty() {
        return None;
    }

    if let Some(caps) = ISO_DATE.captures(cleaned) {
        return ymd(&caps[1], &caps[2], &caps[3]);
    }
    if let Some(caps) = DOTTED_DATE.captures(cleaned) {
        return ymd(&caps[3], &caps[2], &caps[1]);
    }
    if let Some(caps) = NUMERIC_DATE.captures(cleaned) {
        let (first, second, year) = (&caps[1], &caps[2], &caps[3]);
        let (month_first, day_first) = (ymd(year, first, second), ymd(year, second, first));
        return match order {
            DateOrder::MonthFirst => month_first.or(day_first),
            DateOrder::DayFirst => day_first.or(month_first),
        };
    }

    let words = ORDINAL_SUFFIX.replace_all(cleaned, "$1");
    let words = words.replace([',', '.'], " ");
    let words = words.split_whitespace().collect::<Vec<_>>().join(" ");
    ["%b %d %Y", "%d %b %Y", "%Y %b %d", "%d-%b-%Y", "%d-%b-%y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&words, fmt).ok())
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    let mut year: i32 = year.parse().ok()?;
    if year < 100 {
        year += if year < 70 { 2000 } else { 1900 };
    }
    NaiveDate::from_ymd_opt(year, month.parse().ok()?, day.parse().ok()?)
}

/// Lowercase, alphanumeric-only, single-spaced form of a label.
pub fn normalize_label(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized label with numeric tokens dropped, so `Tax (8%)` keys as `tax`.
pub fn label_key(raw: &str) -> String {
    normalize_label(raw)
        .split(' ')
        .filter(|token| !token.chars().all(|c| c.is_ascii_digit()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a quantity such as `2`, `1.5` or `3,25`.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() || cleaned.chars().any(|c| c.is_alphabetic()) {
        return None;
    }
    parse_amount(&cleaned).map(|a| a.to_f64())
}
