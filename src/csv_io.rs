// src/csv_io.rs

use crate::config::AccountingSection;
use crate::error::{AppError, Result};
use crate::heuristics::normalize_date;
use crate::matching::fuzzy::normalize_name;
use crate::models::{
    Invoice, InvoiceStatus, NewBankTransaction, NewPurchaseOrder, NewSupplier, today_iso,
};
use crate::store::{InvoiceStore, normalize_vat};
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

pub const EXPORT_HEADER: [&str; 7] = [
    "date", "journal", "compte", "piece", "libelle", "debit", "credit",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    /// `"line <n>: <message>"` for each rejected row.
    pub errors: Vec<String>,
}

impl ImportReport {
    fn reject(&mut self, line: u64, message: impl std::fmt::Display) {
        self.errors.push(format!("line {line}: {message}"));
    }
}

/// `;` when the header line has at least as many semicolons as commas.
pub fn detect_delimiter(data: &str) -> u8 {
    let header = data.lines().next().unwrap_or_default();
    let semicolons = header.matches(';').count();
    let commas = header.matches(',').count();
    if semicolons > 0 && semicolons >= commas { b';' } else { b',' }
}

/// `1 234,56` / `1234.56` / `-45` → f64. Spaces are thousands separators.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '€')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "oui" | "o" | "true" | "vrai" | "yes" | "y" | "1" => Some(true),
        "non" | "n" | "false" | "faux" | "no" | "0" | "" => Some(false),
        _ => None,
    }
}

/// Header lookup by any of several case-insensitive names.
struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn new(headers: &StringRecord) -> Self {
        let index = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim_start_matches('\u{feff}').trim().to_lowercase(), i))
            .collect();
        Self { index }
    }

    fn find(&self, aliases: &[&str]) -> Option<usize> {
        aliases.iter().find_map(|a| self.index.get(*a).copied())
    }

    fn require(&self, aliases: &[&str]) -> Result<usize> {
        self.find(aliases).ok_or_else(|| {
            AppError::Invalid(format!("missing column '{}'", aliases.join("' or '")))
        })
    }
}

fn cell(record: &StringRecord, column: Option<usize>) -> Option<&str> {
    column
        .and_then(|i| record.get(i))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn optional_amount(record: &StringRecord, column: Option<usize>) -> std::result::Result<Option<f64>, String> {
    match cell(record, column) {
        Some(raw) => parse_decimal(raw)
            .map(Some)
            .ok_or_else(|| format!("invalid amount '{raw}'")),
        None => Ok(None),
    }
}

fn optional_date(record: &StringRecord, column: Option<usize>) -> std::result::Result<Option<String>, String> {
    match cell(record, column) {
        Some(raw) => normalize_date(raw)
            .map(Some)
            .ok_or_else(|| format!("invalid date '{raw}'")),
        None => Ok(None),
    }
}

/// Outcome of one row: `Err` carries the message recorded in the report.
type RowOutcome = std::result::Result<(), String>;

/// Parse `data` and hand every record with its 1-based line number to `row`.
/// Row-level failures become report errors; store failures abort.
fn import_rows<F>(store: &InvoiceStore, data: &str, kind: &str, mut row: F) -> Result<ImportReport>
where
    F: FnMut(&InvoiceStore, &Columns, &StringRecord, &mut ImportReport) -> Result<RowOutcome>,
{
    let mut reader = ReaderBuilder::new()
        .delimiter(detect_delimiter(data))
        .flexible(true)
        .trim(Trim::All)
        .from_reader(data.as_bytes());
    let columns = Columns::new(reader.headers()?);

    let report = store.in_transaction(|store| {
        let mut report = ImportReport::default();
        for (idx, record) in reader.records().enumerate() {
            let fallback_line = idx as u64 + 2;
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    report.reject(fallback_line, e);
                    continue;
                }
            };
            let line = record.position().map_or(fallback_line, |p| p.line());
            if record.iter().all(|v| v.trim().is_empty()) {
                continue;
            }
            if let Err(message) = row(store, &columns, &record, &mut report)? {
                report.reject(line, message);
            }
        }
        Ok(report)
    })?;

    info!(
        kind,
        inserted = report.inserted,
        updated = report.updated,
        skipped = report.skipped,
        errors = report.errors.len(),
        "CSV import finished"
    );
    for e in &report.errors {
        warn!(kind, "{e}");
    }
    Ok(report)
}

/// Supplier master data. Rows upsert by SIRET, then by exact name.
pub fn import_suppliers(store: &InvoiceStore, data: &str) -> Result<ImportReport> {
    header_columns(data)?.require(&["nom", "name"])?;

    import_rows(store, data, "suppliers", |store, cols, record, report| {
        let Some(name) = cell(record, cols.find(&["nom", "name"])) else {
            return Ok(Err("missing supplier name".into()));
        };
        // An absent column keeps the stored flag on update.
        let is_critical = match cell(record, cols.find(&["critique", "is_critical"])) {
            Some(raw) => match parse_flag(raw) {
                Some(flag) => Some(flag),
                None => return Ok(Err(format!("invalid flag '{raw}'"))),
            },
            None => None,
        };
        let siret: Option<String> = cell(record, cols.find(&["siret"]))
            .map(|s| s.chars().filter(char::is_ascii_digit).collect());
        if siret.as_ref().is_some_and(|s| s.len() != 14) {
            return Ok(Err("SIRET must have 14 digits".into()));
        }
        let mut supplier = NewSupplier {
            name: name.to_string(),
            siret,
            vat_number: cell(record, cols.find(&["tva_intracom", "vat_number"])).map(normalize_vat),
            iban: cell(record, cols.find(&["iban"])).map(|s| s.replace(' ', "")),
            email: cell(record, cols.find(&["email"])).map(String::from),
            is_critical: is_critical.unwrap_or(false),
        };

        let existing = match supplier.siret.as_deref() {
            Some(digits) => store.find_supplier_by_siret(digits)?,
            None => None,
        };
        let existing = match existing {
            Some(s) => Some(s),
            None => store.list_suppliers()?.into_iter().find(|s| s.name == supplier.name),
        };
        match existing {
            Some(s) => {
                supplier.is_critical = is_critical.unwrap_or(s.is_critical);
                store.update_supplier(s.id, &supplier)?;
                report.updated += 1;
            }
            None => {
                store.insert_supplier(&supplier)?;
                report.inserted += 1;
            }
        }
        Ok(Ok(()))
    })
}

/// Purchase orders. The supplier column holds a SIRET or a name.
pub fn import_purchase_orders(store: &InvoiceStore, data: &str) -> Result<ImportReport> {
    header_columns(data)?.require(&["numero_commande", "po_number"])?;

    import_rows(store, data, "purchase_orders", |store, cols, record, report| {
        let Some(po_number) = cell(record, cols.find(&["numero_commande", "po_number"])) else {
            return Ok(Err("missing PO number".into()));
        };
        if store.find_purchase_order_by_number(po_number)?.is_some() {
            report.skipped += 1;
            return Ok(Ok(()));
        }
        let amount_ht = match optional_amount(record, cols.find(&["montant_ht", "amount_ht"])) {
            Ok(v) => v,
            Err(e) => return Ok(Err(e)),
        };
        let amount_ttc = match optional_amount(record, cols.find(&["montant_ttc", "amount_ttc"])) {
            Ok(v) => v,
            Err(e) => return Ok(Err(e)),
        };
        let order_date = match optional_date(record, cols.find(&["date_commande", "order_date"])) {
            Ok(v) => v,
            Err(e) => return Ok(Err(e)),
        };
        let supplier_id = match cell(record, cols.find(&["fournisseur", "supplier"])) {
            Some(raw) => {
                let id = resolve_supplier_ref(store, raw)?;
                if id.is_none() {
                    warn!(po_number, supplier = raw, "Unknown supplier on purchase order");
                }
                id
            }
            None => None,
        };
        store.insert_purchase_order(&NewPurchaseOrder {
            po_number: po_number.to_string(),
            supplier_id,
            amount_ht,
            amount_ttc,
            order_date,
        })?;
        report.inserted += 1;
        Ok(Ok(()))
    })
}

fn resolve_supplier_ref(store: &InvoiceStore, raw: &str) -> Result<Option<i64>> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 14 && raw.chars().all(|c| c.is_ascii_digit() || c.is_whitespace()) {
        return Ok(store.find_supplier_by_siret(&digits)?.map(|s| s.id));
    }
    let wanted = normalize_name(raw);
    Ok(store
        .list_suppliers()?
        .into_iter()
        .find(|s| s.name.eq_ignore_ascii_case(raw) || normalize_name(&s.name) == wanted)
        .map(|s| s.id))
}

/// Bank statement lines. Already imported lines (same uid) are skipped.
pub fn import_bank_statement(store: &InvoiceStore, data: &str) -> Result<ImportReport> {
    let columns = header_columns(data)?;
    columns.require(&["date"])?;
    columns.require(&["libelle", "libellé", "label"])?;
    columns.require(&["montant", "amount"])?;

    import_rows(store, data, "bank_statement", |store, cols, record, report| {
        let date = match cell(record, cols.find(&["date"])).map(|d| (d, normalize_date(d))) {
            Some((_, Some(date))) => date,
            Some((raw, None)) => return Ok(Err(format!("invalid date '{raw}'"))),
            None => return Ok(Err("missing date".into())),
        };
        let Some(label) = cell(record, cols.find(&["libelle", "libellé", "label"])) else {
            return Ok(Err("missing label".into()));
        };
        let amount = match cell(record, cols.find(&["montant", "amount"])).map(|a| (a, parse_decimal(a))) {
            Some((_, Some(amount))) => amount,
            Some((raw, None)) => return Ok(Err(format!("invalid amount '{raw}'"))),
            None => return Ok(Err("missing amount".into())),
        };
        let inserted = store.insert_bank_transaction(&NewBankTransaction {
            transaction_date: date,
            label: label.to_string(),
            amount,
            reference: cell(record, cols.find(&["reference", "référence"])).map(String::from),
        })?;
        if inserted {
            report.inserted += 1;
        } else {
            report.skipped += 1;
        }
        Ok(Ok(()))
    })
}

fn header_columns(data: &str) -> Result<Columns> {
    let mut reader = ReaderBuilder::new()
        .delimiter(detect_delimiter(data))
        .flexible(true)
        .from_reader(data.as_bytes());
    Ok(Columns::new(reader.headers()?))
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountingExport {
    pub csv: String,
    pub invoices: Vec<i64>,
    pub lines: usize,
    pub skipped: Vec<i64>,
    pub dry_run: bool,
}

/// French decimal comma, two places.
fn format_amount(v: f64) -> String {
    format!("{v:.2}").replace('.', ",")
}

/// HT / TVA / TTC for posting, completing one missing figure from the other two.
fn posting_amounts(inv: &Invoice) -> Option<(f64, f64, f64)> {
    match (inv.amount_ht, inv.amount_tva, inv.amount_ttc) {
        (Some(ht), Some(tva), Some(ttc)) => Some((ht, tva, ttc)),
        (Some(ht), Some(tva), None) => Some((ht, tva, ht + tva)),
        (Some(ht), None, Some(ttc)) => Some((ht, ttc - ht, ttc)),
        (None, Some(tva), Some(ttc)) => Some((ttc - tva, tva, ttc)),
        (Some(ht), None, None) => Some((ht, 0.0, ht)),
        (None, None, Some(ttc)) => Some((ttc, 0.0, ttc)),
        _ => None,
    }
}

/// Purchase journal for every `prete_comptabilisation` invoice: expense
/// debit HT, VAT debit TVA, supplier credit TTC. Exported invoices are
/// marked `comptabilisee` unless `dry_run`.
pub fn export_accounting(
    store: &InvoiceStore,
    accounts: &AccountingSection,
    dry_run: bool,
) -> Result<AccountingExport> {
    store.in_transaction(|store| {
        let mut writer = WriterBuilder::new().delimiter(b';').from_writer(Vec::new());
        writer.write_record(EXPORT_HEADER)?;

        let mut exported = Vec::new();
        let mut skipped = Vec::new();
        let mut lines = 0;
        let today = today_iso();

        for inv in store.list_invoices(Some(InvoiceStatus::PreteComptabilisation))? {
            let Some((ht, tva, ttc)) = posting_amounts(&inv) else {
                warn!(invoice_id = inv.id, "No amount, invoice left out of the export");
                skipped.push(inv.id);
                continue;
            };
            let date = inv.invoice_date.clone().unwrap_or_else(|| today.clone());
            let piece = inv
                .invoice_number
                .clone()
                .unwrap_or_else(|| format!("FAC-{}", inv.id));
            let label = match inv.supplier_name.as_deref() {
                Some(supplier) => format!("Facture {piece} {supplier}"),
                None => format!("Facture {piece}"),
            };
            let journal = accounts.purchase_journal.as_str();

            let postings = [
                (&accounts.expense_account, format_amount(ht), String::new()),
                (&accounts.vat_account, format_amount(tva), String::new()),
                (&accounts.supplier_account, String::new(), format_amount(ttc)),
            ];
            for (account, debit, credit) in postings {
                writer.write_record([
                    date.as_str(),
                    journal,
                    account.as_str(),
                    piece.as_str(),
                    label.as_str(),
                    debit.as_str(),
                    credit.as_str(),
                ])?;
                lines += 1;
            }
            if !dry_run {
                store.set_invoice_status(inv.id, InvoiceStatus::Comptabilisee)?;
            }
            exported.push(inv.id);
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| AppError::Io(e.into_error()))?;
        let csv = String::from_utf8(bytes)
            .map_err(|e| AppError::Invalid(format!("export is not UTF-8: {e}")))?;
        info!(
            invoices = exported.len(),
            lines,
            dry_run,
            "Accounting export generated"
        );
        Ok(AccountingExport {
            csv,
            invoices: exported,
            lines,
            skipped,
            dry_run,
        })
    })
}
