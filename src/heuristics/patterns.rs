use super::{ANCHORED_CONFIDENCE, GUESSED_CONFIDENCE, parse_amount};
use crate::extraction::{ExtractedInvoice, FieldValue};
use regex::Regex;
use time::Date;
use time::macros::format_description;

/// Amount token: digits with space / nbsp / dot / comma separators, no newlines.
const AMOUNT: &str = r"(-?[0-9][0-9 \u{a0}.,]*[0-9])";
/// Reference token: must contain at least one digit.
const REFERENCE: &str = r"([A-Z0-9][A-Z0-9\-/_.]*[0-9][A-Z0-9\-/_]*|[0-9])";
const DATE: &str = r"(\d{1,2}[/.\-]\d{1,2}[/.\-]\d{2,4}|\d{4}-\d{2}-\d{2})";

/// Main extraction entry point: keyword-anchored regex patterns tuned for
/// French supplier invoices.
pub fn extract(text: &str) -> ExtractedInvoice {
    ExtractedInvoice {
        supplier_name: extract_supplier_name(text),
        supplier_siret: anchored(extract_siret(text)),
        supplier_vat: anchored(extract_vat(text)),
        invoice_number: anchored(extract_invoice_number(text)),
        invoice_date: anchored(extract_invoice_date(text)),
        due_date: anchored(extract_due_date(text)),
        amount_ht: anchored(extract_amount_ht(text)),
        amount_tva: anchored(extract_amount_tva(text)),
        amount_ttc: anchored(extract_amount_ttc(text)),
        currency: extract_currency(text),
        po_number: anchored(extract_po_number(text)),
        bl_number: anchored(extract_bl_number(text)),
    }
}

fn anchored<T>(value: Option<T>) -> FieldValue<T> {
    match value {
        Some(v) => FieldValue::new(v, ANCHORED_CONFIDENCE),
        None => FieldValue::default(),
    }
}

fn capture(pattern: &str, text: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures(text).map(|c| c[1].trim().to_string())
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

fn extract_invoice_number(text: &str) -> Option<String> {
    capture(
        &format!(
            r"(?i)(?:facture|invoice)\s*(?:n[°o]\.?|num[ée]ro|no\.?|#)\s*:?\s*{REFERENCE}"
        ),
        text,
    )
}

fn extract_po_number(text: &str) -> Option<String> {
    capture(
        &format!(
            r"(?i)(?:bon\s+de\s+commande|commande|purchase\s+order|\bPO)\s*(?:n[°o]\.?|#)?\s*:?\s*{REFERENCE}"
        ),
        text,
    )
}

fn extract_bl_number(text: &str) -> Option<String> {
    capture(
        &format!(
            r"(?i)(?:bon\s+de\s+livraison|delivery\s+note|\bBL)\s*(?:n[°o]\.?|#)?\s*:?\s*{REFERENCE}"
        ),
        text,
    )
}

fn extract_siret(text: &str) -> Option<String> {
    let raw = capture(r"(?i)siret\s*:?\s*((?:\d[ \u{a0}]?){14})", text)?;
    Some(raw.chars().filter(char::is_ascii_digit).collect())
}

fn extract_vat(text: &str) -> Option<String> {
    let raw = capture(
        r"(?i)\b(FR[ \u{a0}]?[0-9A-Z]{2}[ \u{a0}]?\d{3}[ \u{a0}]?\d{3}[ \u{a0}]?\d{3})\b",
        text,
    )?;
    Some(crate::store::normalize_vat(&raw.replace('\u{a0}', "")))
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

fn extract_invoice_date(text: &str) -> Option<String> {
    let raw = capture(
        &format!(
            r"(?i)(?:date\s+de\s+(?:la\s+)?facture|date\s+d'[ée]mission|invoice\s+date|date)\s*:?\s*{DATE}"
        ),
        text,
    )?;
    normalize_date(&raw)
}

fn extract_due_date(text: &str) -> Option<String> {
    let raw = capture(
        &format!(
            r"(?i)(?:date\s+d'[ée]ch[ée]ance|[ée]ch[ée]ance|due\s+date|[àa]\s+payer\s+avant\s+le)\s*:?\s*{DATE}"
        ),
        text,
    )?;
    normalize_date(&raw)
}

/// `dd/mm/yyyy`, `dd.mm.yy`, `dd-mm-yyyy` or ISO → `YYYY-MM-DD`. Impossible
/// calendar dates are rejected.
pub fn normalize_date(raw: &str) -> Option<String> {
    let iso = format_description!("[year]-[month]-[day]");
    let raw = raw.trim();
    let date = match Date::parse(raw, iso) {
        Ok(date) => date,
        Err(_) => parse_day_first(raw)?,
    };
    date.format(iso).ok()
}

fn parse_day_first(raw: &str) -> Option<Date> {
    let parts: Vec<&str> = raw.split(['/', '.', '-']).collect();
    let [day, month, year] = parts.as_slice() else {
        return None;
    };
    let year = if year.len() == 2 {
        format!("20{year}")
    } else {
        year.to_string()
    };
    Date::parse(
        &format!("{day}/{month}/{year}"),
        format_description!("[day padding:none]/[month padding:none]/[year]"),
    )
    .ok()
}

// ---------------------------------------------------------------------------
// Amounts
// ---------------------------------------------------------------------------

fn extract_amount_ht(text: &str) -> Option<f64> {
    let raw = capture(
        &format!(r"(?i)(?:total\s+h\.?t\.?|montant\s+h\.?t\.?|sous[\s-]total)\s*:?\s*{AMOUNT}"),
        text,
    )?;
    parse_amount(&raw)
}

fn extract_amount_tva(text: &str) -> Option<f64> {
    let raw = capture(
        &format!(
            r"(?i)(?:total\s+|montant\s+)?t\.?v\.?a\.?(?:\s*\(?\s*\d+(?:[.,]\d+)?\s*%\s*\)?)?\s*:?\s*{AMOUNT}"
        ),
        text,
    )?;
    parse_amount(&raw)
}

fn extract_amount_ttc(text: &str) -> Option<f64> {
    // Take the last TTC / net-to-pay figure: earlier ones are often subtotals.
    let re = Regex::new(&format!(
        r"(?i)(?:total\s+t\.?t\.?c\.?|montant\s+t\.?t\.?c\.?|net\s+[àa]\s+payer)\s*:?\s*{AMOUNT}"
    ))
    .ok()?;
    let mut last = None;
    for cap in re.captures_iter(text) {
        if let Some(v) = parse_amount(&cap[1]) {
            last = Some(v);
        }
    }
    last
}

fn extract_currency(text: &str) -> FieldValue<String> {
    let upper = text.to_uppercase();
    let found = if upper.contains('€') || upper.contains("EUR") {
        Some("EUR")
    } else if upper.contains('£') || upper.contains("GBP") {
        Some("GBP")
    } else if upper.contains("USD") || upper.contains('$') {
        Some("USD")
    } else if upper.contains("CHF") {
        Some("CHF")
    } else {
        None
    };
    match found {
        Some(c) => FieldValue::new(c.to_string(), ANCHORED_CONFIDENCE),
        None => FieldValue::default(),
    }
}

// ---------------------------------------------------------------------------
// Supplier
// ---------------------------------------------------------------------------

/// The issuing company is usually the first line carrying a legal form;
/// failing that, the first line with letters.
fn extract_supplier_name(text: &str) -> FieldValue<String> {
    let Ok(legal_form) =
        Regex::new(r"(?i)\b(SAS|SASU|SARL|EURL|SA|SNC|SCOP|GmbH|Ltd|Inc)\b\.?")
    else {
        return FieldValue::default();
    };
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| l.chars().any(char::is_alphabetic))
        .collect();

    if let Some(line) = lines
        .iter()
        .take(15)
        .find(|l| legal_form.is_match(l) && !l.to_lowercase().contains("capital"))
    {
        return FieldValue::new(line.to_string(), ANCHORED_CONFIDENCE);
    }
    match lines.first() {
        Some(line) if !line.to_lowercase().starts_with("facture") => {
            FieldValue::new(line.to_string(), GUESSED_CONFIDENCE)
        }
        _ => FieldValue::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "ACME FOURNITURES SAS\n\
        12 rue des Lilas, 69000 Lyon\n\
        SIRET : 123 456 789 00012\n\
        TVA intracommunautaire : FR 12 123456789\n\
        \n\
        FACTURE N° F-2025-0042\n\
        Date de facture : 03/02/2025\n\
        Date d'échéance : 05/03/2025\n\
        Bon de commande n° PO-2025-017\n\
        BL : BL-88812\n\
        \n\
        Total HT : 1 000,00 €\n\
        TVA 20 % : 200,00 €\n\
        Total TTC : 1 200,00 €\n";

    #[test]
    fn extracts_a_french_invoice() {
        let inv = extract(SAMPLE);
        assert_eq!(inv.supplier_name.value.as_deref(), Some("ACME FOURNITURES SAS"));
        assert_eq!(inv.supplier_siret.value.as_deref(), Some("12345678900012"));
        assert_eq!(inv.supplier_vat.value.as_deref(), Some("FR12123456789"));
        assert_eq!(inv.invoice_number.value.as_deref(), Some("F-2025-0042"));
        assert_eq!(inv.invoice_date.value.as_deref(), Some("2025-02-03"));
        assert_eq!(inv.due_date.value.as_deref(), Some("2025-03-05"));
        assert_eq!(inv.po_number.value.as_deref(), Some("PO-2025-017"));
        assert_eq!(inv.bl_number.value.as_deref(), Some("BL-88812"));
        assert_eq!(inv.amount_ht.value, Some(1000.0));
        assert_eq!(inv.amount_tva.value, Some(200.0));
        assert_eq!(inv.amount_ttc.value, Some(1200.0));
        assert_eq!(inv.currency.value.as_deref(), Some("EUR"));
        assert_eq!(inv.coverage().0, 12);
    }

    #[test]
    fn missing_fields_stay_empty() {
        let inv = extract("Note de frais\nmerci");
        assert!(inv.invoice_number.value.is_none());
        assert!(inv.po_number.value.is_none());
        assert_eq!(inv.amount_ttc.confidence, 0.0);
        assert_eq!(inv.supplier_name.confidence, GUESSED_CONFIDENCE);
    }

    #[test]
    fn last_net_to_pay_wins() {
        let text = "Total TTC : 100,00\nAcompte -20,00\nNet à payer : 80,00";
        assert_eq!(extract_amount_ttc(text), Some(80.0));
    }

    #[test]
    fn date_normalization() {
        assert_eq!(normalize_date("3/2/25").as_deref(), Some("2025-02-03"));
        assert_eq!(normalize_date("2025-02-03").as_deref(), Some("2025-02-03"));
        assert_eq!(normalize_date("31.12.2024").as_deref(), Some("2024-12-31"));
        assert!(normalize_date("45/13/2024").is_none());
        assert!(normalize_date("31/02/2025").is_none());
        assert!(normalize_date("2025-13-45").is_none());
        assert!(normalize_date("abcd-efghi").is_none());
        assert_eq!(normalize_date("29/02/2024").as_deref(), Some("2024-02-29"));
    }
}
