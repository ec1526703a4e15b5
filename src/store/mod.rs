mod approvals;
mod invoices;
mod ledger;
mod reference;

use crate::error::Result;
use rusqlite::{Connection, Result as SqliteResult};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;

pub use invoices::{ExtractionUpdate, MatchUpdate};
pub use reference::normalize_vat;

#[cfg(test)]
pub(crate) use invoices::test_support;

/// SQLite persistence for every table the workflow touches.
pub struct InvoiceStore {
    conn: Connection,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS suppliers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        siret TEXT,
        vat_number TEXT,
        iban TEXT,
        email TEXT,
        is_critical INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS purchase_orders (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        po_number TEXT NOT NULL UNIQUE,
        supplier_id INTEGER,
        amount_ht REAL,
        amount_ttc REAL,
        order_date TEXT,
        status TEXT NOT NULL DEFAULT 'ouvert',
        FOREIGN KEY (supplier_id) REFERENCES suppliers(id)
    );

    CREATE TABLE IF NOT EXISTS delivery_notes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        bl_number TEXT NOT NULL UNIQUE,
        purchase_order_id INTEGER,
        supplier_id INTEGER,
        delivery_date TEXT,
        FOREIGN KEY (purchase_order_id) REFERENCES purchase_orders(id),
        FOREIGN KEY (supplier_id) REFERENCES suppliers(id)
    );

    CREATE TABLE IF NOT EXISTS invoices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_key TEXT NOT NULL,
        file_name TEXT NOT NULL,
        file_hash TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL DEFAULT 'nouvelle',
        supplier_id INTEGER,
        supplier_name TEXT,
        invoice_number TEXT,
        invoice_date TEXT,
        due_date TEXT,
        amount_ht REAL,
        amount_tva REAL,
        amount_ttc REAL,
        currency TEXT,
        po_number TEXT,
        bl_number TEXT,
        ocr_fields TEXT,
        ocr_confidence REAL,
        purchase_order_id INTEGER,
        delivery_note_id INTEGER,
        match_score REAL,
        match_status TEXT,
        match_anomalies TEXT NOT NULL DEFAULT '[]',
        current_approval_level INTEGER NOT NULL DEFAULT 0,
        required_approval_levels INTEGER NOT NULL DEFAULT 0,
        rejection_reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (supplier_id) REFERENCES suppliers(id),
        FOREIGN KEY (purchase_order_id) REFERENCES purchase_orders(id),
        FOREIGN KEY (delivery_note_id) REFERENCES delivery_notes(id)
    );

    CREATE TABLE IF NOT EXISTS approval_rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        priority INTEGER NOT NULL,
        min_amount REAL NOT NULL DEFAULT 0,
        max_amount REAL,
        is_critical_supplier INTEGER NOT NULL DEFAULT 0,
        required_levels INTEGER NOT NULL,
        level_roles TEXT NOT NULL DEFAULT '[]',
        is_active INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS approval_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        invoice_id INTEGER NOT NULL,
        level INTEGER NOT NULL,
        role TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        approver TEXT,
        comment TEXT,
        decided_at TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (invoice_id, level),
        FOREIGN KEY (invoice_id) REFERENCES invoices(id)
    );

    CREATE TABLE IF NOT EXISTS disputes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        invoice_id INTEGER NOT NULL,
        reason TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'ouvert',
        resolution TEXT,
        created_at TEXT NOT NULL,
        resolved_at TEXT,
        FOREIGN KEY (invoice_id) REFERENCES invoices(id)
    );

    CREATE TABLE IF NOT EXISTS bank_transactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uid TEXT NOT NULL UNIQUE,
        transaction_date TEXT NOT NULL,
        label TEXT NOT NULL,
        amount REAL NOT NULL,
        reference TEXT,
        invoice_id INTEGER,
        created_at TEXT NOT NULL,
        FOREIGN KEY (invoice_id) REFERENCES invoices(id)
    );

    CREATE INDEX IF NOT EXISTS idx_invoices_status ON invoices(status);
    CREATE INDEX IF NOT EXISTS idx_invoices_supplier ON invoices(supplier_id);
    CREATE INDEX IF NOT EXISTS idx_suppliers_siret ON suppliers(siret);
    CREATE INDEX IF NOT EXISTS idx_delivery_notes_po ON delivery_notes(purchase_order_id);
    CREATE INDEX IF NOT EXISTS idx_disputes_invoice ON disputes(invoice_id);
    CREATE INDEX IF NOT EXISTS idx_bank_transactions_invoice ON bank_transactions(invoice_id);
";

impl InvoiceStore {
    /// Open (or create) the SQLite database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "Database initialized successfully");
        Ok(store)
    }

    pub fn open_in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Run `f` inside one SQLite transaction; any error rolls it back.
    /// Not reentrant: `f` must not call `in_transaction` again.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    /// Deterministic id built from the given parts.
    pub fn generate_uid(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Decode a JSON string list column, tolerating legacy empty values.
fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn to_json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}
