use super::InvoiceStore;
use crate::models::{
    DeliveryNote, NewDeliveryNote, NewPurchaseOrder, NewSupplier, PurchaseOrder, Supplier,
    now_rfc3339,
};
use rusqlite::{OptionalExtension, Result as SqliteResult, Row, params};
use tracing::info;

const SUPPLIER_COLUMNS: &str =
    "id, name, siret, vat_number, iban, email, is_critical, created_at";
const PO_COLUMNS: &str = "id, po_number, supplier_id, amount_ht, amount_ttc, order_date, status";
const BL_COLUMNS: &str = "id, bl_number, purchase_order_id, supplier_id, delivery_date";

impl InvoiceStore {
    pub fn insert_supplier(&self, supplier: &NewSupplier) -> SqliteResult<i64> {
        self.conn.execute(
            "INSERT INTO suppliers (name, siret, vat_number, iban, email, is_critical, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                supplier.name,
                supplier.siret,
                supplier.vat_number,
                supplier.iban,
                supplier.email,
                supplier.is_critical,
                now_rfc3339(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(supplier_id = id, name = %supplier.name, "Supplier stored");
        Ok(id)
    }

    /// Overwrite a supplier's attributes, keeping values the update leaves empty.
    pub fn update_supplier(&self, id: i64, supplier: &NewSupplier) -> SqliteResult<()> {
        self.conn.execute(
            "UPDATE suppliers SET
                name = ?1,
                siret = COALESCE(?2, siret),
                vat_number = COALESCE(?3, vat_number),
                iban = COALESCE(?4, iban),
                email = COALESCE(?5, email),
                is_critical = ?6
             WHERE id = ?7",
            params![
                supplier.name,
                supplier.siret,
                supplier.vat_number,
                supplier.iban,
                supplier.email,
                supplier.is_critical,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn get_supplier(&self, id: i64) -> SqliteResult<Option<Supplier>> {
        self.conn
            .query_row(
                &format!("SELECT {SUPPLIER_COLUMNS} FROM suppliers WHERE id = ?1"),
                params![id],
                row_to_supplier,
            )
            .optional()
    }

    pub fn list_suppliers(&self) -> SqliteResult<Vec<Supplier>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SUPPLIER_COLUMNS} FROM suppliers ORDER BY name"))?;
        let rows = stmt.query_map([], row_to_supplier)?;
        rows.collect()
    }

    /// Lookup by SIRET, comparing digits only.
    pub fn find_supplier_by_siret(&self, siret_digits: &str) -> SqliteResult<Option<Supplier>> {
        if siret_digits.is_empty() {
            return Ok(None);
        }
        Ok(self
            .list_suppliers()?
            .into_iter()
            .find(|s| {
                s.siret
                    .as_deref()
                    .map(|v| v.chars().filter(char::is_ascii_digit).collect::<String>())
                    .is_some_and(|v| v == siret_digits)
            }))
    }

    /// Lookup by intra-community VAT number, ignoring case and spaces.
    pub fn find_supplier_by_vat(&self, vat: &str) -> SqliteResult<Option<Supplier>> {
        if vat.is_empty() {
            return Ok(None);
        }
        Ok(self.list_suppliers()?.into_iter().find(|s| {
            s.vat_number
                .as_deref()
                .map(normalize_vat)
                .is_some_and(|v| v == vat)
        }))
    }

    pub fn insert_purchase_order(&self, po: &NewPurchaseOrder) -> SqliteResult<i64> {
        self.conn.execute(
            "INSERT INTO purchase_orders (po_number, supplier_id, amount_ht, amount_ttc, order_date)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                po.po_number,
                po.supplier_id,
                po.amount_ht,
                po.amount_ttc,
                po.order_date,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(purchase_order_id = id, po_number = %po.po_number, "Purchase order stored");
        Ok(id)
    }

    pub fn get_purchase_order(&self, id: i64) -> SqliteResult<Option<PurchaseOrder>> {
        self.conn
            .query_row(
                &format!("SELECT {PO_COLUMNS} FROM purchase_orders WHERE id = ?1"),
                params![id],
                row_to_purchase_order,
            )
            .optional()
    }

    pub fn find_purchase_order_by_number(
        &self,
        po_number: &str,
    ) -> SqliteResult<Option<PurchaseOrder>> {
        self.conn
            .query_row(
                &format!("SELECT {PO_COLUMNS} FROM purchase_orders WHERE po_number = ?1"),
                params![po_number],
                row_to_purchase_order,
            )
            .optional()
    }

    pub fn list_purchase_orders(&self) -> SqliteResult<Vec<PurchaseOrder>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PO_COLUMNS} FROM purchase_orders ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_purchase_order)?;
        rows.collect()
    }

    pub fn insert_delivery_note(&self, bl: &NewDeliveryNote) -> SqliteResult<i64> {
        self.conn.execute(
            "INSERT INTO delivery_notes (bl_number, purchase_order_id, supplier_id, delivery_date)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                bl.bl_number,
                bl.purchase_order_id,
                bl.supplier_id,
                bl.delivery_date,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(delivery_note_id = id, bl_number = %bl.bl_number, "Delivery note stored");
        Ok(id)
    }

    pub fn get_delivery_note(&self, id: i64) -> SqliteResult<Option<DeliveryNote>> {
        self.conn
            .query_row(
                &format!("SELECT {BL_COLUMNS} FROM delivery_notes WHERE id = ?1"),
                params![id],
                row_to_delivery_note,
            )
            .optional()
    }

    pub fn list_delivery_notes(&self) -> SqliteResult<Vec<DeliveryNote>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {BL_COLUMNS} FROM delivery_notes ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_delivery_note)?;
        rows.collect()
    }

    pub fn delivery_notes_for_purchase_order(
        &self,
        purchase_order_id: i64,
    ) -> SqliteResult<Vec<DeliveryNote>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BL_COLUMNS} FROM delivery_notes WHERE purchase_order_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![purchase_order_id], row_to_delivery_note)?;
        rows.collect()
    }
}

/// Uppercase, no whitespace.
pub fn normalize_vat(vat: &str) -> String {
    vat.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

fn row_to_supplier(row: &Row<'_>) -> SqliteResult<Supplier> {
    Ok(Supplier {
        id: row.get(0)?,
        name: row.get(1)?,
        siret: row.get(2)?,
        vat_number: row.get(3)?,
        iban: row.get(4)?,
        email: row.get(5)?,
        is_critical: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_purchase_order(row: &Row<'_>) -> SqliteResult<PurchaseOrder> {
    Ok(PurchaseOrder {
        id: row.get(0)?,
        po_number: row.get(1)?,
        supplier_id: row.get(2)?,
        amount_ht: row.get(3)?,
        amount_ttc: row.get(4)?,
        order_date: row.get(5)?,
        status: row.get(6)?,
    })
}

fn row_to_delivery_note(row: &Row<'_>) -> SqliteResult<DeliveryNote> {
    Ok(DeliveryNote {
        id: row.get(0)?,
        bl_number: row.get(1)?,
        purchase_order_id: row.get(2)?,
        supplier_id: row.get(3)?,
        delivery_date: row.get(4)?,
    })
}
