// src/matching/mod.rs

pub mod fuzzy;

use crate::error::{AppError, Result};
use crate::models::{InvoiceStatus, MatchStatus, NewSupplier, PurchaseOrder, Supplier};
use crate::store::{InvoiceStore, MatchUpdate, normalize_vat};
use fuzzy::{name_similarity, normalize_name, normalize_reference, references_close};
use serde::Serialize;
use tracing::{info, info_span, warn};

pub const PO_WEIGHT: f64 = 0.4;
pub const BL_WEIGHT: f64 = 0.25;
pub const SUPPLIER_WEIGHT: f64 = 0.2;
pub const AMOUNT_WEIGHT: f64 = 0.15;

pub const AUTOMATIC_THRESHOLD: f64 = 0.85;
pub const PROBABLE_THRESHOLD: f64 = 0.6;
pub const UNCERTAIN_THRESHOLD: f64 = 0.3;

/// Minimum name similarity for a fuzzy supplier hit.
const SUPPLIER_SIMILARITY: f64 = 0.8;
/// Relative amount gap above which an anomaly is raised.
const AMOUNT_ANOMALY_RATIO: f64 = 0.05;

const EXACT: f64 = 1.0;
const FUZZY_SUPPLIER: f64 = 0.8;
const FUZZY_REFERENCE: f64 = 0.7;
const BL_THROUGH_PO: f64 = 0.5;

/// Partial scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Components {
    pub po: f64,
    pub bl: f64,
    pub supplier: f64,
    pub amount: f64,
}

impl Components {
    pub fn score(&self) -> f64 {
        let clamp = |v: f64| v.clamp(0.0, 1.0);
        PO_WEIGHT * clamp(self.po)
            + BL_WEIGHT * clamp(self.bl)
            + SUPPLIER_WEIGHT * clamp(self.supplier)
            + AMOUNT_WEIGHT * clamp(self.amount)
    }
}

/// Automatic matches need both a high score and a clean anomaly list.
pub fn classify(score: f64, has_anomalies: bool) -> MatchStatus {
    if score >= AUTOMATIC_THRESHOLD && !has_anomalies {
        MatchStatus::MatchAutomatique
    } else if score >= PROBABLE_THRESHOLD {
        MatchStatus::MatchProbable
    } else if score >= UNCERTAIN_THRESHOLD {
        MatchStatus::MatchIncertain
    } else {
        MatchStatus::AucunMatch
    }
}

pub fn status_for(match_status: MatchStatus) -> InvoiceStatus {
    match match_status {
        MatchStatus::MatchAutomatique => InvoiceStatus::AApprouver,
        MatchStatus::MatchProbable | MatchStatus::MatchIncertain => InvoiceStatus::ARapprocher,
        MatchStatus::AucunMatch => InvoiceStatus::Exception,
    }
}

/// Relative gap between invoice and order amounts, when both are known.
pub fn amount_gap(invoice_amount: Option<f64>, po_amount: Option<f64>) -> Option<f64> {
    let (inv, po) = (invoice_amount?, po_amount?);
    if po.abs() < f64::EPSILON {
        return None;
    }
    Some((inv - po).abs() / po.abs())
}

pub fn amount_score(gap: Option<f64>) -> f64 {
    match gap {
        Some(g) if g <= 0.01 => 1.0,
        Some(g) if g <= 0.05 => 0.8,
        Some(g) if g <= 0.10 => 0.5,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub invoice_id: i64,
    pub supplier_id: Option<i64>,
    pub supplier_created: bool,
    pub purchase_order_id: Option<i64>,
    pub delivery_note_id: Option<i64>,
    pub components: Components,
    pub score: f64,
    pub match_status: MatchStatus,
    pub anomalies: Vec<String>,
    pub status: InvoiceStatus,
}

struct SupplierHit {
    id: Option<i64>,
    score: f64,
    created: bool,
}

pub struct Matcher<'a> {
    store: &'a InvoiceStore,
}

impl<'a> Matcher<'a> {
    pub fn new(store: &'a InvoiceStore) -> Self {
        Self { store }
    }

    /// Reconcile one invoice against suppliers, purchase orders and delivery
    /// notes, then write the outcome back in a single transaction.
    pub fn match_invoice(&self, invoice_id: i64) -> Result<MatchOutcome> {
        let span = info_span!("match_invoice", invoice_id);
        let _guard = span.enter();

        self.store.in_transaction(|store| {
            let invoice = store.require_invoice(invoice_id)?;
            if invoice.status.is_locked() {
                return Err(AppError::Invalid(format!(
                    "invoice {invoice_id} is {} and cannot be re-matched",
                    invoice.status
                )));
            }
            let fields = store.extracted_fields(invoice_id)?.unwrap_or_default();
            let mut anomalies = Vec::new();
            let mut components = Components::default();

            let supplier = resolve_supplier(
                store,
                invoice.supplier_name.as_deref(),
                fields.supplier_siret.value.as_deref(),
                fields.supplier_vat.value.as_deref(),
            )?;
            components.supplier = supplier.score;

            let mut purchase_order: Option<PurchaseOrder> = None;
            if let Some(number) = invoice.po_number.as_deref().filter(|n| !n.trim().is_empty()) {
                match find_purchase_order(store, number)? {
                    Some((po, score)) => {
                        components.po = score;
                        purchase_order = Some(po);
                    }
                    None => anomalies.push("po_not_found".to_string()),
                }
            }

            let mut delivery_note = None;
            if let Some(number) = invoice.bl_number.as_deref().filter(|n| !n.trim().is_empty()) {
                match find_delivery_note(store, number)? {
                    Some((bl, score)) => {
                        components.bl = score;
                        delivery_note = Some(bl);
                    }
                    None => anomalies.push("bl_not_found".to_string()),
                }
            } else if let Some(po) = &purchase_order {
                if let Some(bl) = store
                    .delivery_notes_for_purchase_order(po.id)?
                    .into_iter()
                    .next()
                {
                    components.bl = BL_THROUGH_PO;
                    delivery_note = Some(bl);
                }
            }

            if let (Some(po), Some(supplier_id)) = (&purchase_order, supplier.id) {
                if po.supplier_id.is_some_and(|s| s != supplier_id) {
                    anomalies.push("supplier_mismatch_with_po".to_string());
                }
            }
            if let (Some(bl), Some(supplier_id)) = (&delivery_note, supplier.id) {
                if bl.supplier_id.is_some_and(|s| s != supplier_id) {
                    anomalies.push("supplier_mismatch_with_bl".to_string());
                }
            }
            if let (Some(bl), Some(po)) = (&delivery_note, &purchase_order) {
                if bl.purchase_order_id.is_some_and(|p| p != po.id) {
                    anomalies.push("bl_po_mismatch".to_string());
                }
            }

            if let Some(po) = &purchase_order {
                let gap = match (invoice.amount_ttc, po.amount_ttc) {
                    (Some(inv), Some(ord)) => amount_gap(Some(inv), Some(ord)),
                    _ => amount_gap(invoice.amount_ht, po.amount_ht),
                };
                components.amount = amount_score(gap);
                if let Some(g) = gap.filter(|g| *g > AMOUNT_ANOMALY_RATIO) {
                    anomalies.push(format!("amount_difference_{}%", (g * 100.0).round()));
                }
            }

            let score = components.score();
            let match_status = classify(score, !anomalies.is_empty());
            let status = status_for(match_status);

            store.update_match(
                invoice_id,
                &MatchUpdate {
                    supplier_id: supplier.id,
                    purchase_order_id: purchase_order.as_ref().map(|p| p.id),
                    delivery_note_id: delivery_note.as_ref().map(|b| b.id),
                    score,
                    match_status,
                    anomalies: &anomalies,
                    status,
                },
            )?;

            if !anomalies.is_empty() {
                warn!(anomalies = ?anomalies, "Match anomalies detected");
            }
            info!(
                score = format!("{score:.2}"),
                match_status = %match_status,
                "Invoice matched"
            );

            Ok(MatchOutcome {
                invoice_id,
                supplier_id: supplier.id,
                supplier_created: supplier.created,
                purchase_order_id: purchase_order.map(|p| p.id),
                delivery_note_id: delivery_note.map(|b| b.id),
                components,
                score,
                match_status,
                anomalies,
                status,
            })
        })
    }
}

/// SIRET, then VAT, then exact normalized name, then best fuzzy name.
/// Unknown suppliers with a name are created (score 0).
fn resolve_supplier(
    store: &InvoiceStore,
    name: Option<&str>,
    siret: Option<&str>,
    vat: Option<&str>,
) -> Result<SupplierHit> {
    let siret_digits: String = siret
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    let vat = vat.map(normalize_vat).unwrap_or_default();

    if let Some(s) = store.find_supplier_by_siret(&siret_digits)? {
        return Ok(found(&s, EXACT));
    }
    if let Some(s) = store.find_supplier_by_vat(&vat)? {
        return Ok(found(&s, EXACT));
    }

    let Some(raw_name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(SupplierHit {
            id: None,
            score: 0.0,
            created: false,
        });
    };
    let wanted = normalize_name(raw_name);
    let suppliers = store.list_suppliers()?;

    if let Some(s) = suppliers.iter().find(|s| normalize_name(&s.name) == wanted) {
        return Ok(found(s, EXACT));
    }
    let best = suppliers
        .iter()
        .map(|s| (s, name_similarity(&wanted, &normalize_name(&s.name))))
        .filter(|(_, sim)| *sim >= SUPPLIER_SIMILARITY)
        .max_by(|a, b| a.1.total_cmp(&b.1));
    if let Some((s, sim)) = best {
        info!(supplier_id = s.id, similarity = sim, "Fuzzy supplier match");
        return Ok(found(s, FUZZY_SUPPLIER));
    }

    let id = store.insert_supplier(&NewSupplier {
        name: raw_name.to_string(),
        siret: (!siret_digits.is_empty()).then_some(siret_digits),
        vat_number: (!vat.is_empty()).then_some(vat),
        ..Default::default()
    })?;
    info!(supplier_id = id, name = raw_name, "Unknown supplier created");
    Ok(SupplierHit {
        id: Some(id),
        score: 0.0,
        created: true,
    })
}

fn found(supplier: &Supplier, score: f64) -> SupplierHit {
    SupplierHit {
        id: Some(supplier.id),
        score,
        created: false,
    }
}

/// Exact normalized number first, then the closest near miss.
fn best_reference<T>(
    wanted: &str,
    candidates: Vec<T>,
    number: impl Fn(&T) -> &str,
) -> Option<(T, f64)> {
    let wanted = normalize_reference(wanted);
    if wanted.is_empty() {
        return None;
    }
    let mut fuzzy: Option<(T, usize)> = None;
    for candidate in candidates {
        let norm = normalize_reference(number(&candidate));
        if norm == wanted {
            return Some((candidate, EXACT));
        }
        if references_close(&wanted, &norm) {
            let distance = fuzzy::levenshtein(&wanted, &norm);
            if fuzzy.as_ref().is_none_or(|(_, d)| distance < *d) {
                fuzzy = Some((candidate, distance));
            }
        }
    }
    fuzzy.map(|(c, _)| (c, FUZZY_REFERENCE))
}

fn find_purchase_order(store: &InvoiceStore, number: &str) -> Result<Option<(PurchaseOrder, f64)>> {
    Ok(best_reference(number, store.list_purchase_orders()?, |po| {
        po.po_number.as_str()
    }))
}

fn find_delivery_note(
    store: &InvoiceStore,
    number: &str,
) -> Result<Option<(crate::models::DeliveryNote, f64)>> {
    Ok(best_reference(number, store.list_delivery_notes()?, |bl| {
        bl.bl_number.as_str()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractedInvoice, FieldValue};
    use crate::models::{NewDeliveryNote, NewPurchaseOrder};
    use crate::store::test_support::insert_extracted;

    fn fields(po: Option<&str>, bl: Option<&str>, ttc: f64) -> ExtractedInvoice {
        ExtractedInvoice {
            supplier_name: FieldValue::new("ACME Fournitures SAS".into(), 0.9),
            supplier_siret: FieldValue::new("123 456 789 00012".into(), 0.9),
            amount_ht: FieldValue::new(ttc / 1.2, 0.9),
            amount_ttc: FieldValue::new(ttc, 0.9),
            po_number: po.map(|p| FieldValue::new(p.into(), 0.9)).unwrap_or_default(),
            bl_number: bl.map(|b| FieldValue::new(b.into(), 0.9)).unwrap_or_default(),
            ..Default::default()
        }
    }

    /// Supplier ACME with PO-2025-017 (1200 TTC) and BL-88812.
    fn seeded() -> (InvoiceStore, i64, i64, i64) {
        let store = InvoiceStore::open_in_memory().unwrap();
        let supplier = store
            .insert_supplier(&NewSupplier {
                name: "ACME Fournitures".into(),
                siret: Some("12345678900012".into()),
                ..Default::default()
            })
            .unwrap();
        let po = store
            .insert_purchase_order(&NewPurchaseOrder {
                po_number: "PO-2025-017".into(),
                supplier_id: Some(supplier),
                amount_ht: Some(1000.0),
                amount_ttc: Some(1200.0),
                ..Default::default()
            })
            .unwrap();
        let bl = store
            .insert_delivery_note(&NewDeliveryNote {
                bl_number: "BL-88812".into(),
                purchase_order_id: Some(po),
                supplier_id: Some(supplier),
                ..Default::default()
            })
            .unwrap();
        (store, supplier, po, bl)
    }

    #[test]
    fn score_is_monotonic_in_each_component() {
        let steps = [0.0, 0.5, 0.7, 0.8, 1.0];
        for &base in &steps {
            let c = Components {
                po: base,
                bl: base,
                supplier: base,
                amount: base,
            };
            for &higher in steps.iter().filter(|&&s| s >= base) {
                for bumped in [
                    Components { po: higher, ..c },
                    Components { bl: higher, ..c },
                    Components { supplier: higher, ..c },
                    Components { amount: higher, ..c },
                ] {
                    assert!(bumped.score() >= c.score());
                }
            }
        }
        let full = Components {
            po: 1.0,
            bl: 1.0,
            supplier: 1.0,
            amount: 1.0,
        };
        assert!((full.score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn automatic_requires_clean_anomalies() {
        assert_eq!(classify(0.9, false), MatchStatus::MatchAutomatique);
        assert_eq!(classify(0.9, true), MatchStatus::MatchProbable);
        assert_eq!(classify(0.6, false), MatchStatus::MatchProbable);
        assert_eq!(classify(0.3, false), MatchStatus::MatchIncertain);
        assert_eq!(classify(0.29, false), MatchStatus::AucunMatch);
        assert_eq!(status_for(MatchStatus::AucunMatch), InvoiceStatus::Exception);
        assert_eq!(status_for(MatchStatus::MatchIncertain), InvoiceStatus::ARapprocher);
    }

    #[test]
    fn amount_buckets() {
        assert_eq!(amount_score(amount_gap(Some(1200.0), Some(1200.0))), 1.0);
        assert_eq!(amount_score(amount_gap(Some(1236.0), Some(1200.0))), 0.8);
        assert_eq!(amount_score(amount_gap(Some(1300.0), Some(1200.0))), 0.5);
        assert_eq!(amount_score(amount_gap(Some(2000.0), Some(1200.0))), 0.0);
        assert_eq!(amount_score(amount_gap(Some(10.0), None)), 0.0);
    }

    #[test]
    fn clean_invoice_matches_automatically() {
        let (store, supplier, po, bl) = seeded();
        let id = insert_extracted(&store, "h", &fields(Some("PO-2025-017"), Some("BL-88812"), 1200.0));

        let outcome = Matcher::new(&store).match_invoice(id).unwrap();
        assert_eq!(outcome.match_status, MatchStatus::MatchAutomatique);
        assert!(outcome.anomalies.is_empty());
        assert_eq!(outcome.supplier_id, Some(supplier));

        let inv = store.require_invoice(id).unwrap();
        assert_eq!(inv.status, InvoiceStatus::AApprouver);
        assert_eq!(inv.purchase_order_id, Some(po));
        assert_eq!(inv.delivery_note_id, Some(bl));
        assert!((inv.match_score.unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn delivery_note_found_through_purchase_order() {
        let (store, _, _, bl) = seeded();
        let id = insert_extracted(&store, "h", &fields(Some("po2025017"), None, 1200.0));
        let outcome = Matcher::new(&store).match_invoice(id).unwrap();
        assert_eq!(outcome.delivery_note_id, Some(bl));
        assert_eq!(outcome.components.bl, BL_THROUGH_PO);
        assert_eq!(outcome.components.po, EXACT);
    }

    #[test]
    fn amount_gap_and_unknown_bl_are_reported() {
        let (store, _, _, _) = seeded();
        let id = insert_extracted(&store, "h", &fields(Some("PO-2025-017"), Some("BL-00000"), 1320.0));
        let outcome = Matcher::new(&store).match_invoice(id).unwrap();
        assert!(outcome.anomalies.contains(&"bl_not_found".to_string()));
        assert!(outcome.anomalies.contains(&"amount_difference_10%".to_string()));
        assert_ne!(outcome.match_status, MatchStatus::MatchAutomatique);
    }

    #[test]
    fn unknown_supplier_is_created_and_po_missing() {
        let (store, supplier, _, _) = seeded();
        let mut f = fields(Some("PO-9999-999"), None, 50.0);
        f.supplier_name = FieldValue::new("Globex Industries".into(), 0.9);
        f.supplier_siret = FieldValue::default();
        let id = insert_extracted(&store, "h", &f);

        let outcome = Matcher::new(&store).match_invoice(id).unwrap();
        assert!(outcome.supplier_created);
        assert_ne!(outcome.supplier_id, Some(supplier));
        assert_eq!(outcome.anomalies, vec!["po_not_found".to_string()]);
        assert_eq!(outcome.match_status, MatchStatus::AucunMatch);
        assert_eq!(
            store.require_invoice(id).unwrap().status,
            InvoiceStatus::Exception
        );
        assert_eq!(store.list_suppliers().unwrap().len(), 2);
    }

    #[test]
    fn foreign_purchase_order_is_a_supplier_mismatch() {
        let (store, _, _, _) = seeded();
        store
            .insert_supplier(&NewSupplier {
                name: "Initech".into(),
                siret: Some("99999999900099".into()),
                ..Default::default()
            })
            .unwrap();
        let mut f = fields(Some("PO-2025-017"), Some("BL-88812"), 1200.0);
        f.supplier_siret = FieldValue::new("99999999900099".into(), 0.9);
        let id = insert_extracted(&store, "h", &f);

        let outcome = Matcher::new(&store).match_invoice(id).unwrap();
        assert!(outcome.anomalies.contains(&"supplier_mismatch_with_po".to_string()));
        assert!(outcome.anomalies.contains(&"supplier_mismatch_with_bl".to_string()));
        assert_eq!(outcome.match_status, MatchStatus::MatchProbable);
    }

    #[test]
    fn near_miss_references_score_as_fuzzy() {
        let (store, _, po, _) = seeded();
        let id = insert_extracted(&store, "h", &fields(Some("PO-2025-018"), Some("BL 88812"), 1200.0));
        let outcome = Matcher::new(&store).match_invoice(id).unwrap();
        assert_eq!(outcome.purchase_order_id, Some(po));
        assert_eq!(outcome.components.po, FUZZY_REFERENCE);
        assert_eq!(outcome.components.bl, EXACT);
    }

    #[test]
    fn close_supplier_name_scores_as_fuzzy() {
        let (store, supplier, _, _) = seeded();
        let mut f = fields(Some("PO-2025-017"), Some("BL-88812"), 1200.0);
        f.supplier_name = FieldValue::new("Acme Fourniture".into(), 0.9);
        f.supplier_siret = FieldValue::default();
        let id = insert_extracted(&store, "h", &f);

        let outcome = Matcher::new(&store).match_invoice(id).unwrap();
        assert_eq!(outcome.supplier_id, Some(supplier));
        assert!(!outcome.supplier_created);
        assert_eq!(outcome.components.supplier, FUZZY_SUPPLIER);
    }

    #[test]
    fn vat_number_identifies_the_supplier() {
        let (store, _, _, _) = seeded();
        let initech = store
            .insert_supplier(&NewSupplier {
                name: "Initech".into(),
                vat_number: Some("FR12345678901".into()),
                ..Default::default()
            })
            .unwrap();
        let mut f = fields(None, None, 80.0);
        f.supplier_name = FieldValue::new("Nom illisible".into(), 0.3);
        f.supplier_siret = FieldValue::default();
        f.supplier_vat = FieldValue::new("fr 12 345 678 901".into(), 0.9);
        let id = insert_extracted(&store, "h", &f);

        let outcome = Matcher::new(&store).match_invoice(id).unwrap();
        assert_eq!(outcome.supplier_id, Some(initech));
        assert_eq!(outcome.components.supplier, EXACT);
        assert!(!outcome.supplier_created);
    }

    #[test]
    fn delivery_note_of_another_order_is_flagged() {
        let (store, supplier, _, bl) = seeded();
        let other = store
            .insert_purchase_order(&NewPurchaseOrder {
                po_number: "PO-2025-099".into(),
                supplier_id: Some(supplier),
                amount_ttc: Some(1200.0),
                ..Default::default()
            })
            .unwrap();
        let id = insert_extracted(&store, "h", &fields(Some("PO-2025-099"), Some("BL-88812"), 1200.0));

        let outcome = Matcher::new(&store).match_invoice(id).unwrap();
        assert_eq!(outcome.purchase_order_id, Some(other));
        assert_eq!(outcome.delivery_note_id, Some(bl));
        assert_eq!(outcome.anomalies, vec!["bl_po_mismatch".to_string()]);
        assert_eq!(outcome.match_status, MatchStatus::MatchProbable);
    }

    #[test]
    fn posted_and_disputed_invoices_are_not_rematched() {
        let (store, _, _, _) = seeded();
        let id = insert_extracted(&store, "h", &fields(Some("PO-2025-017"), None, 1200.0));
        for locked in [
            InvoiceStatus::Comptabilisee,
            InvoiceStatus::PreteComptabilisation,
            InvoiceStatus::Litige,
        ] {
            store.set_invoice_status(id, locked).unwrap();
            assert!(matches!(
                Matcher::new(&store).match_invoice(id),
                Err(AppError::Invalid(_))
            ));
            let inv = store.require_invoice(id).unwrap();
            assert_eq!(inv.status, locked);
            assert!(inv.match_status.is_none());
        }
    }
}
