use super::{InvoiceStore, json_list, to_json_list};
use crate::error::{AppError, Result};
use crate::extraction::ExtractedInvoice;
use crate::models::{Invoice, InvoiceStatus, MatchStatus, NewInvoice, now_rfc3339};
use rusqlite::{OptionalExtension, Result as SqliteResult, Row, params};
use tracing::info;

const INVOICE_COLUMNS: &str = "id, file_key, file_name, file_hash, status, supplier_id,
    supplier_name, invoice_number, invoice_date, due_date, amount_ht, amount_tva, amount_ttc,
    currency, po_number, bl_number, ocr_fields, ocr_confidence, purchase_order_id,
    delivery_note_id, match_score, match_status, match_anomalies, current_approval_level,
    required_approval_levels, rejection_reason, created_at, updated_at";

/// Values written back after extraction.
pub struct ExtractionUpdate<'a> {
    pub fields: &'a ExtractedInvoice,
    pub confidence: f64,
    pub status: InvoiceStatus,
}

/// Values written back after matching.
pub struct MatchUpdate<'a> {
    pub supplier_id: Option<i64>,
    pub purchase_order_id: Option<i64>,
    pub delivery_note_id: Option<i64>,
    pub score: f64,
    pub match_status: MatchStatus,
    pub anomalies: &'a [String],
    pub status: InvoiceStatus,
}

impl InvoiceStore {
    pub fn insert_invoice(&self, invoice: &NewInvoice) -> SqliteResult<i64> {
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO invoices (file_key, file_name, file_hash, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                invoice.file_key,
                invoice.file_name,
                invoice.file_hash,
                InvoiceStatus::Nouvelle,
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(invoice_id = id, file_name = %invoice.file_name, "Invoice stored");
        Ok(id)
    }

    pub fn get_invoice(&self, id: i64) -> SqliteResult<Option<Invoice>> {
        self.conn
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1"),
                params![id],
                row_to_invoice,
            )
            .optional()
    }

    /// Like `get_invoice`, but a missing row is an error.
    pub fn require_invoice(&self, id: i64) -> Result<Invoice> {
        self.get_invoice(id)?
            .ok_or_else(|| AppError::not_found("invoice", id))
    }

    pub fn find_invoice_by_hash(&self, file_hash: &str) -> SqliteResult<Option<Invoice>> {
        self.conn
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE file_hash = ?1"),
                params![file_hash],
                row_to_invoice,
            )
            .optional()
    }

    pub fn list_invoices(&self, status: Option<InvoiceStatus>) -> SqliteResult<Vec<Invoice>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![status], row_to_invoice)?;
        rows.collect()
    }

    pub fn set_invoice_status(&self, id: i64, status: InvoiceStatus) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE invoices SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now_rfc3339(), id],
        )?;
        info!(invoice_id = id, status = %status, "Invoice status updated");
        Ok(())
    }

    pub fn update_extraction(&self, id: i64, update: &ExtractionUpdate<'_>) -> Result<()> {
        let f = update.fields;
        let json = serde_json::to_string(f)?;
        self.conn.execute(
            "UPDATE invoices SET
                supplier_name = ?1, invoice_number = ?2, invoice_date = ?3, due_date = ?4,
                amount_ht = ?5, amount_tva = ?6, amount_ttc = ?7, currency = ?8,
                po_number = ?9, bl_number = ?10, ocr_fields = ?11, ocr_confidence = ?12,
                status = ?13, updated_at = ?14
             WHERE id = ?15",
            params![
                f.supplier_name.value,
                f.invoice_number.value,
                f.invoice_date.value,
                f.due_date.value,
                f.amount_ht.value,
                f.amount_tva.value,
                f.amount_ttc.value,
                f.currency.value,
                f.po_number.value,
                f.bl_number.value,
                json,
                update.confidence,
                update.status,
                now_rfc3339(),
                id,
            ],
        )?;
        info!(
            invoice_id = id,
            confidence = update.confidence,
            "Extraction written back"
        );
        Ok(())
    }

    /// Stored extraction, if OCR has already run.
    pub fn extracted_fields(&self, id: i64) -> Result<Option<ExtractedInvoice>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT ocr_fields FROM invoices WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(match raw {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    pub fn update_match(&self, id: i64, update: &MatchUpdate<'_>) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE invoices SET
                supplier_id = ?1, purchase_order_id = ?2, delivery_note_id = ?3,
                match_score = ?4, match_status = ?5, match_anomalies = ?6,
                status = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                update.supplier_id,
                update.purchase_order_id,
                update.delivery_note_id,
                update.score,
                update.match_status,
                to_json_list(update.anomalies),
                update.status,
                now_rfc3339(),
                id,
            ],
        )?;
        info!(
            invoice_id = id,
            score = update.score,
            match_status = %update.match_status,
            status = %update.status,
            "Match written back"
        );
        Ok(())
    }

    pub fn set_approval_progress(
        &self,
        id: i64,
        current_level: i64,
        required_levels: i64,
        status: InvoiceStatus,
    ) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE invoices SET
                current_approval_level = ?1, required_approval_levels = ?2,
                status = ?3, updated_at = ?4
             WHERE id = ?5",
            params![current_level, required_levels, status, now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn set_rejection(&self, id: i64, reason: &str) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE invoices SET status = ?1, rejection_reason = ?2, updated_at = ?3
             WHERE id = ?4",
            params![InvoiceStatus::Exception, reason, now_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Invoice counts keyed by status.
    pub fn count_invoices_by_status(&self) -> SqliteResult<Vec<(InvoiceStatus, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM invoices GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    pub fn sum_amount_with_status(&self, status: InvoiceStatus) -> SqliteResult<f64> {
        self.conn.query_row(
            "SELECT COALESCE(SUM(COALESCE(amount_ttc, amount_ht, 0)), 0) FROM invoices
             WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )
    }

    /// Invoices due before `today` that are not posted yet.
    pub fn count_overdue(&self, today: &str) -> SqliteResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM invoices
             WHERE due_date IS NOT NULL AND due_date < ?1 AND status != ?2",
            params![today, InvoiceStatus::Comptabilisee],
            |row| row.get(0),
        )
    }

    pub fn average_ocr_confidence(&self) -> SqliteResult<Option<f64>> {
        self.conn.query_row(
            "SELECT AVG(ocr_confidence) FROM invoices WHERE ocr_confidence IS NOT NULL",
            [],
            |row| row.get(0),
        )
    }

    /// `(automatic matches, invoices with any match status)`.
    pub fn match_counts(&self) -> SqliteResult<(i64, i64)> {
        self.conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN match_status = ?1 THEN 1 ELSE 0 END), 0),
                COUNT(match_status)
             FROM invoices",
            params![MatchStatus::MatchAutomatique],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }
}

fn row_to_invoice(row: &Row<'_>) -> SqliteResult<Invoice> {
    Ok(Invoice {
        id: row.get(0)?,
        file_key: row.get(1)?,
        file_name: row.get(2)?,
        file_hash: row.get(3)?,
        status: row.get(4)?,
        supplier_id: row.get(5)?,
        supplier_name: row.get(6)?,
        invoice_number: row.get(7)?,
        invoice_date: row.get(8)?,
        due_date: row.get(9)?,
        amount_ht: row.get(10)?,
        amount_tva: row.get(11)?,
        amount_ttc: row.get(12)?,
        currency: row.get(13)?,
        po_number: row.get(14)?,
        bl_number: row.get(15)?,
        ocr_fields: row.get(16)?,
        ocr_confidence: row.get(17)?,
        purchase_order_id: row.get(18)?,
        delivery_note_id: row.get(19)?,
        match_score: row.get(20)?,
        match_status: row.get(21)?,
        match_anomalies: json_list(row.get(22)?),
        current_approval_level: row.get(23)?,
        required_approval_levels: row.get(24)?,
        rejection_reason: row.get(25)?,
        created_at: row.get(26)?,
        updated_at: row.get(27)?,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::extraction::FieldValue;

    #[test]
    fn new_invoice_starts_as_nouvelle() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let id = insert_blank(&store, "abc");
        let inv = store.require_invoice(id).unwrap();
        assert_eq!(inv.status, InvoiceStatus::Nouvelle);
        assert!(inv.match_anomalies.is_empty());
        assert_eq!(inv.required_approval_levels, 0);
        assert_eq!(store.find_invoice_by_hash("abc").unwrap().unwrap().id, id);
        assert!(matches!(
            store.require_invoice(99),
            Err(AppError::NotFound { .. })
        ));
    }

    #[test]
    fn extraction_is_promoted_and_kept_as_json() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let fields = ExtractedInvoice {
            invoice_number: FieldValue::new("F-9".into(), 0.9),
            amount_ttc: FieldValue::new(240.0, 0.8),
            due_date: FieldValue::new("2020-01-31".into(), 0.7),
            ..Default::default()
        };
        let id = insert_extracted(&store, "h1", &fields);

        let inv = store.require_invoice(id).unwrap();
        assert_eq!(inv.invoice_number.as_deref(), Some("F-9"));
        assert_eq!(inv.amount_ttc, Some(240.0));
        assert_eq!(inv.status, InvoiceStatus::AValiderExtraction);
        assert_eq!(store.extracted_fields(id).unwrap().unwrap(), fields);
        assert_eq!(store.count_overdue("2024-01-01").unwrap(), 1);
        assert!(store.extracted_fields(insert_blank(&store, "h2")).unwrap().is_none());
    }

    #[test]
    fn status_filter_and_counts() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let a = insert_blank(&store, "a");
        insert_blank(&store, "b");
        store.set_invoice_status(a, InvoiceStatus::Litige).unwrap();

        assert_eq!(store.list_invoices(None).unwrap().len(), 2);
        let litiges = store.list_invoices(Some(InvoiceStatus::Litige)).unwrap();
        assert_eq!(litiges.len(), 1);
        assert_eq!(litiges[0].id, a);

        let counts = store.count_invoices_by_status().unwrap();
        assert!(counts.contains(&(InvoiceStatus::Litige, 1)));
        assert!(counts.contains(&(InvoiceStatus::Nouvelle, 1)));
    }

    #[test]
    fn match_update_stores_anomalies() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let id = insert_blank(&store, "m");
        let anomalies = vec!["po_not_found".to_string()];
        store
            .update_match(
                id,
                &MatchUpdate {
                    supplier_id: None,
                    purchase_order_id: None,
                    delivery_note_id: None,
                    score: 0.1,
                    match_status: MatchStatus::AucunMatch,
                    anomalies: &anomalies,
                    status: InvoiceStatus::Exception,
                },
            )
            .unwrap();
        let inv = store.require_invoice(id).unwrap();
        assert_eq!(inv.match_anomalies, anomalies);
        assert_eq!(inv.match_status, Some(MatchStatus::AucunMatch));
        assert_eq!(store.match_counts().unwrap(), (0, 1));
    }
}
