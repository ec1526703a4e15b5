//! Command-line definitions.
//!
//! ```text
//! invoice_flow [--config <PATH>] [--json] <COMMAND>
//!
//! Commands:
//!   init      Create the database and document directory
//!   supplier  Supplier master data
//!   po        Purchase orders
//!   bl        Delivery notes
//!   invoice   Submit, list, inspect and validate invoices
//!   ocr       Extract fields from submitted invoices
//!   match     Reconcile an invoice with its PO and delivery note
//!   rule      Approval rules
//!   approval  Approval workflow
//!   dispute   Supplier disputes
//!   bank      Bank statements and payment reconciliation
//!   export    Accounting export of approved invoices
//!   explain   Ask the assistant to explain an invoice's anomalies
//!   ask       Ask the pilotage assistant a question
//!   stats     Dashboard indicators
//!   config    Configuration management
//! ```

use crate::config::{DEFAULT_CONFIG_PATH, LlmBackend};
use crate::models::InvoiceStatus;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "invoice_flow")]
#[command(version)]
#[command(about = "Supplier invoice intake, matching, approval and accounting export")]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, env = "INVOICE_FLOW_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database schema and document directory
    Init,

    /// Supplier master data
    #[command(subcommand)]
    Supplier(SupplierCommands),

    /// Purchase orders
    #[command(subcommand)]
    Po(PoCommands),

    /// Delivery notes (bons de livraison)
    #[command(subcommand)]
    Bl(BlCommands),

    /// Submit, list, inspect and validate invoices
    #[command(subcommand)]
    Invoice(InvoiceCommands),

    /// Extract fields from one invoice, or from every new one
    Ocr {
        /// Invoice id; omit to process all `nouvelle` invoices
        id: Option<i64>,
        /// Override the configured extraction backend
        #[arg(long, value_enum)]
        backend: Option<LlmBackend>,
    },

    /// Reconcile an invoice with suppliers, POs and delivery notes
    Match {
        id: i64,
    },

    /// Approval rules
    #[command(subcommand)]
    Rule(RuleCommands),

    /// Approval workflow
    #[command(subcommand)]
    Approval(ApprovalCommands),

    /// Supplier disputes (litiges)
    #[command(subcommand)]
    Dispute(DisputeCommands),

    /// Bank statements and payment reconciliation
    #[command(subcommand)]
    Bank(BankCommands),

    /// Export `prete_comptabilisation` invoices as a purchase journal
    Export {
        /// Write the journal here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Do not mark exported invoices as posted
        #[arg(long)]
        dry_run: bool,
    },

    /// Stream an explanation of an invoice's match anomalies
    Explain {
        invoice: i64,
    },

    /// Ask the pilotage assistant about current activity
    Ask {
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },

    /// Dashboard indicators
    Stats,

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand, Debug)]
pub enum SupplierCommands {
    /// Add a supplier
    Add(SupplierArgs),
    /// List suppliers
    List,
    /// Import suppliers from CSV
    Import { file: PathBuf },
}

#[derive(Args, Debug)]
pub struct SupplierArgs {
    pub name: String,
    #[arg(long)]
    pub siret: Option<String>,
    #[arg(long)]
    pub vat: Option<String>,
    #[arg(long)]
    pub iban: Option<String>,
    #[arg(long)]
    pub email: Option<String>,
    /// Critical supplier (stricter approval rules apply)
    #[arg(long)]
    pub critical: bool,
}

#[derive(Subcommand, Debug)]
pub enum PoCommands {
    /// Add a purchase order
    Add {
        number: String,
        #[arg(long)]
        supplier: Option<i64>,
        #[arg(long)]
        amount_ht: Option<f64>,
        #[arg(long)]
        amount_ttc: Option<f64>,
        /// Order date (YYYY-MM-DD or DD/MM/YYYY)
        #[arg(long)]
        date: Option<String>,
    },
    /// List purchase orders
    List,
    /// Import purchase orders from CSV
    Import { file: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum BlCommands {
    /// Add a delivery note
    Add {
        number: String,
        #[arg(long)]
        po: Option<i64>,
        #[arg(long)]
        supplier: Option<i64>,
        #[arg(long)]
        date: Option<String>,
    },
    /// List delivery notes
    List,
}

#[derive(Subcommand, Debug)]
pub enum InvoiceCommands {
    /// Store invoice files and create their records
    Submit {
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
        /// Run extraction right after submission
        #[arg(long)]
        ocr: bool,
    },
    /// List invoices
    List {
        #[arg(long)]
        status: Option<InvoiceStatus>,
    },
    /// Show one invoice with its extraction, approvals and disputes
    Show { id: i64 },
    /// Confirm a reviewed extraction and run matching
    Validate { id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum RuleCommands {
    /// Add an approval rule
    Add {
        name: String,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long, default_value_t = 0.0)]
        min: f64,
        /// Exclusive upper bound; omit for no limit
        #[arg(long)]
        max: Option<f64>,
        /// Only applies to critical suppliers
        #[arg(long)]
        critical: bool,
        #[arg(long, default_value_t = 1)]
        levels: i64,
        /// Role for each level, in order
        #[arg(long = "role")]
        roles: Vec<String>,
    },
    /// List approval rules in evaluation order
    List,
    /// Enable a rule
    Enable { id: i64 },
    /// Disable a rule
    Disable { id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum ApprovalCommands {
    /// Select the rule and create the approval levels
    Init { invoice: i64 },
    /// Approve a level (defaults to the current one)
    Approve {
        invoice: i64,
        #[arg(long)]
        level: Option<i64>,
        #[arg(long, env = "INVOICE_FLOW_USER")]
        approver: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Reject a level (defaults to the current one)
    Reject {
        invoice: i64,
        #[arg(long)]
        level: Option<i64>,
        #[arg(long, env = "INVOICE_FLOW_USER")]
        approver: String,
        #[arg(long)]
        reason: String,
    },
    /// Approval history of an invoice
    History { invoice: i64 },
}

#[derive(Subcommand, Debug)]
pub enum DisputeCommands {
    /// Open a dispute on an invoice
    Open {
        invoice: i64,
        #[arg(long)]
        reason: String,
    },
    /// Resolve a dispute
    Resolve {
        id: i64,
        #[arg(long)]
        resolution: String,
    },
    /// List disputes (open only unless --all)
    List {
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum BankCommands {
    /// Import a bank statement CSV
    Import { file: PathBuf },
    /// Link debits to ready or posted invoices
    Reconcile,
    /// List transactions
    List,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Set a dotted key, e.g. `llm.backend ollama`
    Set { key: String, value: String },
    /// Print the effective configuration path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definitions_are_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "invoice_flow",
            "--json",
            "rule",
            "add",
            "gros",
            "--min",
            "1000",
            "--levels",
            "2",
            "--role",
            "manager",
            "--role",
            "daf",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Rule(RuleCommands::Add { name, min, levels, roles, max, .. }) => {
                assert_eq!(name, "gros");
                assert_eq!(min, 1000.0);
                assert_eq!(levels, 2);
                assert_eq!(roles, vec!["manager", "daf"]);
                assert!(max.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_and_backend_values() {
        let cli =
            Cli::try_parse_from(["invoice_flow", "invoice", "list", "--status", "a_approuver"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Invoice(InvoiceCommands::List {
                status: Some(InvoiceStatus::AApprouver)
            })
        ));
        let cli = Cli::try_parse_from(["invoice_flow", "ocr", "--backend", "heuristics"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Ocr {
                id: None,
                backend: Some(LlmBackend::Heuristics)
            }
        ));
        assert!(Cli::try_parse_from(["invoice_flow", "invoice", "list", "--status", "payee"]).is_err());
    }
}
