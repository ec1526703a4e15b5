// src/heuristics/mod.rs

mod patterns;

pub use patterns::normalize_date;

use crate::extraction::ExtractedInvoice;

/// Confidence given to a field read by a keyword-anchored pattern.
pub const ANCHORED_CONFIDENCE: f64 = 0.7;
/// Confidence for fields guessed without an anchoring keyword.
pub const GUESSED_CONFIDENCE: f64 = 0.4;

/// Extract invoice fields from a PDF text layer without calling a model.
pub fn extract_invoice(text: &str) -> ExtractedInvoice {
    patterns::extract(text).normalized()
}

/// Parse a French or English formatted amount: `1 234,56`, `1,234.56`, `1234.5`, `-45,00 €`.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');
    let normalized = match (last_comma, last_dot) {
        // Both present: the rightmost one is the decimal separator.
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(c), None) => {
            // A lone comma followed by exactly three digits is a thousands separator.
            let decimals = cleaned.len() - c - 1;
            if decimals == 3 && c > 0 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        _ => cleaned,
    };
    normalized.parse::<f64>().ok()
}
