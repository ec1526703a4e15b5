use serde::{Deserialize, Serialize};

/// One extracted field and the model's confidence in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue<T> {
    #[serde(default = "Option::default")]
    pub value: Option<T>,
    #[serde(default)]
    pub confidence: f64,
}

impl<T> Default for FieldValue<T> {
    fn default() -> Self {
        Self {
            value: None,
            confidence: 0.0,
        }
    }
}

impl<T> FieldValue<T> {
    pub fn new(value: T, confidence: f64) -> Self {
        Self {
            value: Some(value),
            confidence,
        }
    }

    fn clamped_confidence(&self) -> f64 {
        if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

pub const FIELD_COUNT: usize = 12;

/// All fields we ask the model (or the regex fallback) to read off an invoice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedInvoice {
    pub supplier_name: FieldValue<String>,
    pub supplier_siret: FieldValue<String>,
    pub supplier_vat: FieldValue<String>,
    pub invoice_number: FieldValue<String>,
    pub invoice_date: FieldValue<String>,
    pub due_date: FieldValue<String>,
    pub amount_ht: FieldValue<f64>,
    pub amount_tva: FieldValue<f64>,
    pub amount_ttc: FieldValue<f64>,
    pub currency: FieldValue<String>,
    pub po_number: FieldValue<String>,
    pub bl_number: FieldValue<String>,
}

impl ExtractedInvoice {
    fn confidences(&self) -> [f64; FIELD_COUNT] {
        [
            self.supplier_name.clamped_confidence(),
            self.supplier_siret.clamped_confidence(),
            self.supplier_vat.clamped_confidence(),
            self.invoice_number.clamped_confidence(),
            self.invoice_date.clamped_confidence(),
            self.due_date.clamped_confidence(),
            self.amount_ht.clamped_confidence(),
            self.amount_tva.clamped_confidence(),
            self.amount_ttc.clamped_confidence(),
            self.currency.clamped_confidence(),
            self.po_number.clamped_confidence(),
            self.bl_number.clamped_confidence(),
        ]
    }

    /// Mean of the twelve field confidences.
    pub fn mean_confidence(&self) -> f64 {
        self.confidences().iter().sum::<f64>() / FIELD_COUNT as f64
    }

    /// How many fields carry a value (out of twelve).
    pub fn coverage(&self) -> (usize, usize) {
        let filled = [
            self.supplier_name.value.is_some(),
            self.supplier_siret.value.is_some(),
            self.supplier_vat.value.is_some(),
            self.invoice_number.value.is_some(),
            self.invoice_date.value.is_some(),
            self.due_date.value.is_some(),
            self.amount_ht.value.is_some(),
            self.amount_tva.value.is_some(),
            self.amount_ttc.value.is_some(),
            self.currency.value.is_some(),
            self.po_number.value.is_some(),
            self.bl_number.value.is_some(),
        ]
        .iter()
        .filter(|&&v| v)
        .count();
        (filled, FIELD_COUNT)
    }

    /// A PO or BL number makes the invoice eligible for matching.
    pub fn has_matching_reference(&self) -> bool {
        non_blank(&self.po_number.value) || non_blank(&self.bl_number.value)
    }

    /// Drop empty strings the model sometimes returns instead of null.
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.supplier_name,
            &mut self.supplier_siret,
            &mut self.supplier_vat,
            &mut self.invoice_number,
            &mut self.invoice_date,
            &mut self.due_date,
            &mut self.currency,
            &mut self.po_number,
            &mut self.bl_number,
        ] {
            if let Some(v) = field.value.take() {
                let trimmed = v.trim();
                if !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("null") {
                    field.value = Some(trimmed.to_string());
                }
            }
            if field.value.is_none() {
                field.confidence = 0.0;
            }
        }
        for field in [&mut self.amount_ht, &mut self.amount_tva, &mut self.amount_ttc] {
            if field.value.is_some_and(|v| !v.is_finite()) {
                field.value = None;
            }
            if field.value.is_none() {
                field.confidence = 0.0;
            }
        }
        self
    }
}

fn non_blank(v: &Option<String>) -> bool {
    v.as_deref().is_some_and(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_extraction_has_zero_confidence() {
        let e = ExtractedInvoice::default();
        assert_eq!(e.mean_confidence(), 0.0);
        assert_eq!(e.coverage(), (0, 12));
        assert!(!e.has_matching_reference());
    }

    #[test]
    fn mean_is_over_all_twelve_fields() {
        let e = ExtractedInvoice {
            invoice_number: FieldValue::new("F-1".into(), 0.9),
            amount_ttc: FieldValue::new(120.0, 0.9),
            po_number: FieldValue::new("PO-7".into(), 1.5),
            ..Default::default()
        };
        // 0.9 + 0.9 + 1.0 (clamped)
        assert!((e.mean_confidence() - 2.8 / 12.0).abs() < 1e-9);
        assert!(e.has_matching_reference());
    }

    #[test]
    fn partial_json_fills_missing_fields_with_defaults() {
        let e: ExtractedInvoice = serde_json::from_str(
            r#"{"invoice_number": {"value": "F-2024-01", "confidence": 0.95},
                "amount_ttc": {"value": 1200.5}}"#,
        )
        .unwrap();
        assert_eq!(e.invoice_number.value.as_deref(), Some("F-2024-01"));
        assert_eq!(e.amount_ttc.value, Some(1200.5));
        assert_eq!(e.amount_ttc.confidence, 0.0);
        assert_eq!(e.bl_number, FieldValue::default());
    }

    #[test]
    fn normalized_drops_blank_strings() {
        let e = ExtractedInvoice {
            po_number: FieldValue::new("  ".into(), 0.8),
            bl_number: FieldValue::new("null".into(), 0.3),
            currency: FieldValue::new(" EUR ".into(), 0.9),
            ..Default::default()
        }
        .normalized();
        assert_eq!(e.po_number, FieldValue::default());
        assert_eq!(e.bl_number.confidence, 0.0);
        assert_eq!(e.currency.value.as_deref(), Some("EUR"));
    }
}
