use crate::error::Result;
use crate::models::{InvoiceStatus, today_iso};
use crate::store::InvoiceStore;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub generated_on: String,
    pub invoices_total: i64,
    /// Every status, zero counts included.
    pub by_status: BTreeMap<String, i64>,
    pub amount_awaiting_approval: f64,
    pub overdue: i64,
    pub open_disputes: i64,
    pub unreconciled_transactions: i64,
    pub average_ocr_confidence: Option<f64>,
    /// `match_automatique` share of matched invoices, `None` before any match.
    pub automatic_match_rate: Option<f64>,
}

pub fn snapshot(store: &InvoiceStore) -> Result<Snapshot> {
    snapshot_on(store, &today_iso())
}

pub fn snapshot_on(store: &InvoiceStore, today: &str) -> Result<Snapshot> {
    let mut by_status: BTreeMap<String, i64> = InvoiceStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for (status, count) in store.count_invoices_by_status()? {
        by_status.insert(status.as_str().to_string(), count);
    }
    let (automatic, matched) = store.match_counts()?;

    Ok(Snapshot {
        generated_on: today.to_string(),
        invoices_total: by_status.values().sum(),
        by_status,
        amount_awaiting_approval: store.sum_amount_with_status(InvoiceStatus::AApprouver)?,
        overdue: store.count_overdue(today)?,
        open_disputes: store.count_open_disputes()?,
        unreconciled_transactions: store.count_unreconciled_transactions()?,
        average_ocr_confidence: store.average_ocr_confidence()?,
        automatic_match_rate: (matched > 0).then(|| automatic as f64 / matched as f64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractedInvoice, FieldValue};
    use crate::models::NewBankTransaction;
    use crate::store::test_support::{insert_blank, insert_extracted};

    #[test]
    fn empty_store_has_zeroed_counters() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let snap = snapshot_on(&store, "2025-01-01").unwrap();
        assert_eq!(snap.invoices_total, 0);
        assert_eq!(snap.by_status.len(), InvoiceStatus::ALL.len());
        assert!(snap.automatic_match_rate.is_none());
        assert!(snap.average_ocr_confidence.is_none());
    }

    #[test]
    fn counters_reflect_the_store() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let fields = ExtractedInvoice {
            amount_ttc: FieldValue::new(300.0, 0.6),
            due_date: FieldValue::new("2025-01-15".into(), 0.6),
            ..Default::default()
        };
        let waiting = insert_extracted(&store, "a", &fields);
        store.set_invoice_status(waiting, InvoiceStatus::AApprouver).unwrap();
        let disputed = insert_blank(&store, "b");
        store.open_dispute(disputed, "prix").unwrap();
        store
            .insert_bank_transaction(&NewBankTransaction {
                transaction_date: "2025-02-01".into(),
                label: "VIR".into(),
                amount: -10.0,
                reference: None,
            })
            .unwrap();

        let snap = snapshot_on(&store, "2025-02-01").unwrap();
        assert_eq!(snap.invoices_total, 2);
        assert_eq!(snap.by_status["a_approuver"], 1);
        assert_eq!(snap.by_status["litige"], 1);
        assert_eq!(snap.amount_awaiting_approval, 300.0);
        assert_eq!(snap.overdue, 1);
        assert_eq!(snap.open_disputes, 1);
        assert_eq!(snap.unreconciled_transactions, 1);
        assert!(snap.average_ocr_confidence.is_some());
    }
}
