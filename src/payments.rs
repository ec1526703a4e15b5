use crate::error::Result;
use crate::matching::fuzzy::{normalize_name, normalize_reference};
use crate::models::{BankTransaction, Invoice};
use crate::store::InvoiceStore;
use serde::Serialize;
use tracing::{info, warn};

const AMOUNT_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    InvoiceNumber,
    SupplierName,
    SingleCandidate,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentLink {
    pub transaction_id: i64,
    pub invoice_id: i64,
    pub reason: MatchReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub linked: Vec<PaymentLink>,
    pub ambiguous: usize,
    pub unmatched: usize,
}

/// Link unreconciled debits to ready or posted invoices of the same amount.
pub fn reconcile(store: &InvoiceStore) -> Result<ReconcileReport> {
    store.in_transaction(|store| {
        let mut open: Vec<Invoice> = Vec::new();
        for id in store.list_unpaid_invoice_ids()? {
            open.push(store.require_invoice(id)?);
        }
        let mut report = ReconcileReport::default();

        for tx in store.list_unreconciled_transactions()? {
            if tx.amount >= 0.0 {
                continue;
            }
            let paid = tx.amount.abs();
            let candidates: Vec<&Invoice> = open
                .iter()
                .filter(|inv| {
                    inv.amount_ttc
                        .is_some_and(|ttc| (ttc - paid).abs() <= AMOUNT_TOLERANCE)
                })
                .collect();

            match choose(&tx, &candidates) {
                Choice::Linked(invoice_id, reason) => {
                    store.link_transaction(tx.id, invoice_id)?;
                    open.retain(|inv| inv.id != invoice_id);
                    report.linked.push(PaymentLink {
                        transaction_id: tx.id,
                        invoice_id,
                        reason,
                    });
                }
                Choice::Ambiguous => {
                    warn!(
                        transaction_id = tx.id,
                        candidates = candidates.len(),
                        label = %tx.label,
                        "Ambiguous payment left unreconciled"
                    );
                    report.ambiguous += 1;
                }
                Choice::None => report.unmatched += 1,
            }
        }

        info!(
            linked = report.linked.len(),
            ambiguous = report.ambiguous,
            unmatched = report.unmatched,
            "Bank reconciliation finished"
        );
        Ok(report)
    })
}

enum Choice {
    Linked(i64, MatchReason),
    Ambiguous,
    None,
}

fn choose(tx: &BankTransaction, candidates: &[&Invoice]) -> Choice {
    if candidates.is_empty() {
        return Choice::None;
    }
    let haystack = normalize_reference(&format!(
        "{} {}",
        tx.label,
        tx.reference.as_deref().unwrap_or_default()
    ));
    if let Some(inv) = candidates.iter().find(|inv| {
        inv.invoice_number
            .as_deref()
            .map(normalize_reference)
            .is_some_and(|n| !n.is_empty() && haystack.contains(&n))
    }) {
        return Choice::Linked(inv.id, MatchReason::InvoiceNumber);
    }

    let label = normalize_name(&tx.label);
    let by_supplier: Vec<&&Invoice> = candidates
        .iter()
        .filter(|inv| {
            inv.supplier_name
                .as_deref()
                .map(normalize_name)
                .is_some_and(|n| !n.is_empty() && label.contains(&n))
        })
        .collect();
    if let [inv] = by_supplier.as_slice() {
        return Choice::Linked(inv.id, MatchReason::SupplierName);
    }

    if let [inv] = candidates {
        return Choice::Linked(inv.id, MatchReason::SingleCandidate);
    }
    Choice::Ambiguous
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractedInvoice, FieldValue};
    use crate::models::{InvoiceStatus, NewBankTransaction};
    use crate::store::test_support::insert_extracted;

    fn ready_invoice(store: &InvoiceStore, number: &str, supplier: &str, ttc: f64) -> i64 {
        let fields = ExtractedInvoice {
            invoice_number: FieldValue::new(number.into(), 0.9),
            supplier_name: FieldValue::new(supplier.into(), 0.9),
            amount_ttc: FieldValue::new(ttc, 0.9),
            ..Default::default()
        };
        let id = insert_extracted(store, number, &fields);
        store
            .set_invoice_status(id, InvoiceStatus::PreteComptabilisation)
            .unwrap();
        id
    }

    fn debit(store: &InvoiceStore, label: &str, amount: f64, reference: Option<&str>) {
        store
            .insert_bank_transaction(&NewBankTransaction {
                transaction_date: "2025-03-10".into(),
                label: label.into(),
                amount,
                reference: reference.map(String::from),
            })
            .unwrap();
    }

    #[test]
    fn invoice_number_wins_over_supplier_name() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let _a = ready_invoice(&store, "F-001", "ACME", 120.0);
        let b = ready_invoice(&store, "F-002", "ACME", 120.0);
        debit(&store, "VIR ACME", -120.0, Some("F002"));

        let report = reconcile(&store).unwrap();
        assert_eq!(report.linked.len(), 1);
        assert_eq!(report.linked[0].invoice_id, b);
        assert_eq!(report.linked[0].reason, MatchReason::InvoiceNumber);
    }

    #[test]
    fn supplier_name_then_single_candidate() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let acme = ready_invoice(&store, "A-1", "ACME SAS", 50.0);
        ready_invoice(&store, "G-1", "Globex", 50.0);
        let lone = ready_invoice(&store, "I-1", "Initech", 75.5);
        debit(&store, "PRLV ACME LYON", -50.0, None);
        debit(&store, "CB 123", -75.5, None);
        debit(&store, "REMISE", 75.5, None);

        let report = reconcile(&store).unwrap();
        let reasons: Vec<_> = report.linked.iter().map(|l| (l.invoice_id, l.reason)).collect();
        assert!(reasons.contains(&(acme, MatchReason::SupplierName)));
        assert!(reasons.contains(&(lone, MatchReason::SingleCandidate)));
        assert_eq!(store.count_unreconciled_transactions().unwrap(), 1);
    }

    #[test]
    fn ambiguous_payments_stay_open() {
        let store = InvoiceStore::open_in_memory().unwrap();
        ready_invoice(&store, "X-1", "Alpha", 99.0);
        ready_invoice(&store, "X-2", "Beta", 99.0);
        debit(&store, "VIREMENT", -99.0, None);
        debit(&store, "VIREMENT 2", -1.0, None);

        let report = reconcile(&store).unwrap();
        assert!(report.linked.is_empty());
        assert_eq!(report.ambiguous, 1);
        assert_eq!(report.unmatched, 1);
        assert_eq!(store.count_unreconciled_transactions().unwrap(), 2);
    }
}
