use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a text-backed enum with its snake_case wire names, and maps it
/// both to serde and to SQLite TEXT columns.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse().map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

text_enum!(
    /// Lifecycle of an invoice from intake to posting.
    InvoiceStatus {
        Nouvelle => "nouvelle",
        AValiderExtraction => "a_valider_extraction",
        ARapprocher => "a_rapprocher",
        AApprouver => "a_approuver",
        Exception => "exception",
        Litige => "litige",
        PreteComptabilisation => "prete_comptabilisation",
        Comptabilisee => "comptabilisee",
    }
);

impl InvoiceStatus {
    /// Disputed, released or posted invoices are not re-matched or re-routed.
    pub fn is_locked(self) -> bool {
        matches!(
            self,
            InvoiceStatus::Litige | InvoiceStatus::PreteComptabilisation | InvoiceStatus::Comptabilisee
        )
    }
}

text_enum!(
    MatchStatus {
        MatchAutomatique => "match_automatique",
        MatchProbable => "match_probable",
        MatchIncertain => "match_incertain",
        AucunMatch => "aucun_match",
    }
);

text_enum!(
    ApprovalStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
);

text_enum!(
    DisputeStatus {
        Ouvert => "ouvert",
        Resolu => "resolu",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Supplier {
    pub id: i64,
    pub name: String,
    pub siret: Option<String>,
    pub vat_number: Option<String>,
    pub iban: Option<String>,
    pub email: Option<String>,
    pub is_critical: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewSupplier {
    pub name: String,
    pub siret: Option<String>,
    pub vat_number: Option<String>,
    pub iban: Option<String>,
    pub email: Option<String>,
    pub is_critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: i64,
    pub po_number: String,
    pub supplier_id: Option<i64>,
    pub amount_ht: Option<f64>,
    pub amount_ttc: Option<f64>,
    pub order_date: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewPurchaseOrder {
    pub po_number: String,
    pub supplier_id: Option<i64>,
    pub amount_ht: Option<f64>,
    pub amount_ttc: Option<f64>,
    pub order_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryNote {
    pub id: i64,
    pub bl_number: String,
    pub purchase_order_id: Option<i64>,
    pub supplier_id: Option<i64>,
    pub delivery_date: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewDeliveryNote {
    pub bl_number: String,
    pub purchase_order_id: Option<i64>,
    pub supplier_id: Option<i64>,
    pub delivery_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    pub file_key: String,
    pub file_name: String,
    pub file_hash: String,
    pub status: InvoiceStatus,
    pub supplier_id: Option<i64>,
    pub supplier_name: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<String>,
    pub due_date: Option<String>,
    pub amount_ht: Option<f64>,
    pub amount_tva: Option<f64>,
    pub amount_ttc: Option<f64>,
    pub currency: Option<String>,
    pub po_number: Option<String>,
    pub bl_number: Option<String>,
    /// Full extraction (twelve value/confidence pairs) as JSON.
    pub ocr_fields: Option<String>,
    pub ocr_confidence: Option<f64>,
    pub purchase_order_id: Option<i64>,
    pub delivery_note_id: Option<i64>,
    pub match_score: Option<f64>,
    pub match_status: Option<MatchStatus>,
    pub match_anomalies: Vec<String>,
    pub current_approval_level: i64,
    pub required_approval_levels: i64,
    pub rejection_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct NewInvoice {
    pub file_key: String,
    pub file_name: String,
    pub file_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: i64,
    pub name: String,
    pub priority: i64,
    pub min_amount: f64,
    /// `None` means unbounded.
    pub max_amount: Option<f64>,
    pub is_critical_supplier: bool,
    pub required_levels: i64,
    pub level_roles: Vec<String>,
    pub is_active: bool,
}

impl ApprovalRule {
    pub fn covers(&self, amount: f64, is_critical_supplier: bool) -> bool {
        let in_range =
            amount >= self.min_amount && self.max_amount.is_none_or(|max| amount < max);
        in_range && (!self.is_critical_supplier || is_critical_supplier)
    }

    pub fn role_for_level(&self, level: i64) -> String {
        usize::try_from(level - 1)
            .ok()
            .and_then(|i| self.level_roles.get(i))
            .cloned()
            .unwrap_or_else(|| format!("niveau_{level}"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewApprovalRule {
    pub name: String,
    pub priority: i64,
    pub min_amount: f64,
    pub max_amount: Option<f64>,
    pub is_critical_supplier: bool,
    pub required_levels: i64,
    pub level_roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalHistoryEntry {
    pub id: i64,
    pub invoice_id: i64,
    pub level: i64,
    pub role: String,
    pub status: ApprovalStatus,
    pub approver: Option<String>,
    pub comment: Option<String>,
    pub decided_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: i64,
    pub invoice_id: i64,
    pub reason: String,
    pub status: DisputeStatus,
    pub resolution: Option<String>,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: i64,
    pub uid: String,
    pub transaction_date: String,
    pub label: String,
    pub amount: f64,
    pub reference: Option<String>,
    pub invoice_id: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewBankTransaction {
    pub transaction_date: String,
    pub label: String,
    pub amount: f64,
    pub reference: Option<String>,
}

/// Current UTC time as RFC 3339.
pub fn now_rfc3339() -> String {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Today's UTC date as `YYYY-MM-DD`.
pub fn today_iso() -> String {
    let fmt = time::macros::format_description!("[year]-[month]-[day]");
    time::OffsetDateTime::now_utc()
        .date()
        .format(&fmt)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(min: f64, max: Option<f64>, critical: bool) -> ApprovalRule {
        ApprovalRule {
            id: 1,
            name: "r".into(),
            priority: 1,
            min_amount: min,
            max_amount: max,
            is_critical_supplier: critical,
            required_levels: 2,
            level_roles: vec!["comptable".into()],
            is_active: true,
        }
    }

    #[test]
    fn status_names_round_trip_through_strings() {
        for s in InvoiceStatus::ALL {
            assert_eq!(s.as_str().parse::<InvoiceStatus>().unwrap(), *s);
        }
        assert_eq!(InvoiceStatus::ALL.len(), 8);
        assert!("payee".parse::<InvoiceStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&MatchStatus::AucunMatch).unwrap(),
            "\"aucun_match\""
        );
    }

    #[test]
    fn rule_range_is_half_open() {
        let r = rule(0.0, Some(1000.0), false);
        assert!(r.covers(0.0, false));
        assert!(r.covers(999.99, false));
        assert!(!r.covers(1000.0, false));
        assert!(rule(1000.0, None, false).covers(1_000_000.0, false));
    }

    #[test]
    fn critical_rule_needs_critical_supplier() {
        let r = rule(0.0, None, true);
        assert!(!r.covers(10.0, false));
        assert!(r.covers(10.0, true));
        assert!(rule(0.0, None, false).covers(10.0, true));
    }

    #[test]
    fn missing_role_falls_back_to_level_name() {
        let r = rule(0.0, None, false);
        assert_eq!(r.role_for_level(1), "comptable");
        assert_eq!(r.role_for_level(2), "niveau_2");
    }

    #[test]
    fn today_is_iso_formatted() {
        let today = today_iso();
        assert_eq!(today.len(), 10);
        assert_eq!(&today[4..5], "-");
    }
}
