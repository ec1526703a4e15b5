use super::InvoiceStore;
use crate::error::{AppError, Result};
use crate::models::{
    BankTransaction, Dispute, DisputeStatus, InvoiceStatus, NewBankTransaction, now_rfc3339,
};
use rusqlite::{OptionalExtension, Result as SqliteResult, Row, params};
use tracing::info;

const DISPUTE_COLUMNS: &str =
    "id, invoice_id, reason, status, resolution, created_at, resolved_at";
const TRANSACTION_COLUMNS: &str =
    "id, uid, transaction_date, label, amount, reference, invoice_id, created_at";

impl InvoiceStore {
    pub fn insert_dispute(&self, invoice_id: i64, reason: &str) -> SqliteResult<i64> {
        self.conn.execute(
            "INSERT INTO disputes (invoice_id, reason, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![invoice_id, reason, DisputeStatus::Ouvert, now_rfc3339()],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(dispute_id = id, invoice_id, "Dispute opened");
        Ok(id)
    }

    pub fn get_dispute(&self, id: i64) -> SqliteResult<Option<Dispute>> {
        self.conn
            .query_row(
                &format!("SELECT {DISPUTE_COLUMNS} FROM disputes WHERE id = ?1"),
                params![id],
                row_to_dispute,
            )
            .optional()
    }

    pub fn resolve_dispute_row(&self, id: i64, resolution: &str) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE disputes SET status = ?1, resolution = ?2, resolved_at = ?3 WHERE id = ?4",
            params![DisputeStatus::Resolu, resolution, now_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn list_disputes(&self, open_only: bool) -> SqliteResult<Vec<Dispute>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DISPUTE_COLUMNS} FROM disputes
             WHERE ?1 = 0 OR status = ?2
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![open_only, DisputeStatus::Ouvert], row_to_dispute)?;
        rows.collect()
    }

    pub fn disputes_for_invoice(&self, invoice_id: i64) -> SqliteResult<Vec<Dispute>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DISPUTE_COLUMNS} FROM disputes WHERE invoice_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![invoice_id], row_to_dispute)?;
        rows.collect()
    }

    pub fn count_open_disputes(&self) -> SqliteResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM disputes WHERE status = ?1",
            params![DisputeStatus::Ouvert],
            |row| row.get(0),
        )
    }

    /// Open a dispute and put the invoice in `litige`.
    pub fn open_dispute(&self, invoice_id: i64, reason: &str) -> Result<i64> {
        if reason.trim().is_empty() {
            return Err(AppError::Invalid("dispute reason is empty".into()));
        }
        self.in_transaction(|store| {
            store.require_invoice(invoice_id)?;
            let id = store.insert_dispute(invoice_id, reason.trim())?;
            store.set_invoice_status(invoice_id, InvoiceStatus::Litige)?;
            Ok(id)
        })
    }

    /// Resolve a dispute. The invoice returns to `a_rapprocher` once it has
    /// no other open dispute.
    pub fn resolve_dispute(&self, dispute_id: i64, resolution: &str) -> Result<Dispute> {
        self.in_transaction(|store| {
            let dispute = store
                .get_dispute(dispute_id)?
                .ok_or_else(|| AppError::not_found("dispute", dispute_id))?;
            if dispute.status == DisputeStatus::Resolu {
                return Err(AppError::Invalid(format!(
                    "dispute {dispute_id} is already resolved"
                )));
            }
            store.resolve_dispute_row(dispute_id, resolution)?;
            let still_open = store
                .disputes_for_invoice(dispute.invoice_id)?
                .iter()
                .any(|d| d.status == DisputeStatus::Ouvert);
            if !still_open {
                store.set_invoice_status(dispute.invoice_id, InvoiceStatus::ARapprocher)?;
            }
            store
                .get_dispute(dispute_id)?
                .ok_or_else(|| AppError::not_found("dispute", dispute_id))
        })
    }

    /// Insert a statement line; returns false if the same line was imported before.
    pub fn insert_bank_transaction(&self, tx: &NewBankTransaction) -> SqliteResult<bool> {
        let amount = format!("{:.2}", tx.amount);
        let uid = Self::generate_uid(&[&tx.transaction_date, &tx.label, &amount]);
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO bank_transactions
                (uid, transaction_date, label, amount, reference, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                uid,
                tx.transaction_date,
                tx.label,
                tx.amount,
                tx.reference,
                now_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn list_unreconciled_transactions(&self) -> SqliteResult<Vec<BankTransaction>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM bank_transactions
             WHERE invoice_id IS NULL
             ORDER BY transaction_date, id"
        ))?;
        let rows = stmt.query_map([], row_to_transaction)?;
        rows.collect()
    }

    pub fn list_bank_transactions(&self) -> SqliteResult<Vec<BankTransaction>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM bank_transactions ORDER BY transaction_date, id"
        ))?;
        let rows = stmt.query_map([], row_to_transaction)?;
        rows.collect()
    }

    pub fn count_unreconciled_transactions(&self) -> SqliteResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM bank_transactions WHERE invoice_id IS NULL",
            [],
            |row| row.get(0),
        )
    }

    pub fn link_transaction(&self, transaction_id: i64, invoice_id: i64) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE bank_transactions SET invoice_id = ?1 WHERE id = ?2",
            params![invoice_id, transaction_id],
        )?;
        info!(transaction_id, invoice_id, "Transaction reconciled");
        Ok(())
    }

    /// Ready or posted invoices that no transaction pays yet.
    pub fn list_unpaid_invoice_ids(&self) -> SqliteResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.id FROM invoices i
             WHERE i.status IN (?1, ?2)
               AND NOT EXISTS (SELECT 1 FROM bank_transactions t WHERE t.invoice_id = i.id)
             ORDER BY i.id",
        )?;
        let rows = stmt.query_map(
            params![
                InvoiceStatus::PreteComptabilisation,
                InvoiceStatus::Comptabilisee
            ],
            |row| row.get(0),
        )?;
        rows.collect()
    }
}

fn row_to_dispute(row: &Row<'_>) -> SqliteResult<Dispute> {
    Ok(Dispute {
        id: row.get(0)?,
        invoice_id: row.get(1)?,
        reason: row.get(2)?,
        status: row.get(3)?,
        resolution: row.get(4)?,
        created_at: row.get(5)?,
        resolved_at: row.get(6)?,
    })
}

fn row_to_transaction(row: &Row<'_>) -> SqliteResult<BankTransaction> {
    Ok(BankTransaction {
        id: row.get(0)?,
        uid: row.get(1)?,
        transaction_date: row.get(2)?,
        label: row.get(3)?,
        amount: row.get(4)?,
        reference: row.get(5)?,
        invoice_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::insert_blank;

    #[test]
    fn duplicate_statement_lines_are_ignored() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let line = NewBankTransaction {
            transaction_date: "2025-03-01".into(),
            label: "PRLV ACME".into(),
            amount: -120.0,
            reference: None,
        };
        assert!(store.insert_bank_transaction(&line).unwrap());
        assert!(!store.insert_bank_transaction(&line).unwrap());
        assert_eq!(store.count_unreconciled_transactions().unwrap(), 1);
    }

    #[test]
    fn open_disputes_filter() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let inv = insert_blank(&store, "d");
        let first = store.insert_dispute(inv, "quantité erronée").unwrap();
        store.insert_dispute(inv, "prix").unwrap();
        store.resolve_dispute_row(first, "avoir reçu").unwrap();

        assert_eq!(store.list_disputes(false).unwrap().len(), 2);
        let open = store.list_disputes(true).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].reason, "prix");
        assert_eq!(store.count_open_disputes().unwrap(), 1);
        let resolved = store.get_dispute(first).unwrap().unwrap();
        assert_eq!(resolved.status, DisputeStatus::Resolu);
        assert!(resolved.resolved_at.is_some());
    }

    #[test]
    fn dispute_round_trip_restores_invoice() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let inv = insert_blank(&store, "rt");
        let a = store.open_dispute(inv, "prix").unwrap();
        let b = store.open_dispute(inv, "quantité").unwrap();
        assert_eq!(store.require_invoice(inv).unwrap().status, InvoiceStatus::Litige);

        store.resolve_dispute(a, "avoir").unwrap();
        assert_eq!(store.require_invoice(inv).unwrap().status, InvoiceStatus::Litige);

        let resolved = store.resolve_dispute(b, "livré").unwrap();
        assert_eq!(resolved.resolution.as_deref(), Some("livré"));
        assert_eq!(
            store.require_invoice(inv).unwrap().status,
            InvoiceStatus::ARapprocher
        );
        assert!(matches!(store.resolve_dispute(b, "x"), Err(AppError::Invalid(_))));
        assert!(matches!(store.open_dispute(999, "x"), Err(AppError::NotFound { .. })));
        assert!(matches!(store.open_dispute(inv, " "), Err(AppError::Invalid(_))));
    }
}
