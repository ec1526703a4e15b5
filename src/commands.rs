use crate::approval::ApprovalEngine;
use crate::assistant;
use crate::cli::{
    ApprovalCommands, BankCommands, BlCommands, Cli, Commands, ConfigCommands, DisputeCommands,
    InvoiceCommands, PoCommands, RuleCommands, SupplierArgs, SupplierCommands,
};
use crate::config::{Config, LlmBackend};
use crate::csv_io;
use crate::dashboard;
use crate::documents::DocumentStore;
use crate::error::{AppError, Result};
use crate::gateway::HttpGateway;
use crate::heuristics::normalize_date;
use crate::matching::{MatchOutcome, Matcher};
use crate::models::{
    Invoice, InvoiceStatus, NewApprovalRule, NewDeliveryNote, NewPurchaseOrder, NewSupplier,
};
use crate::ocr::{self, ExtractionBackend, OcrOutcome};
use crate::payments;
use crate::store::InvoiceStore;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Everything a handler needs, opened once per invocation.
struct Context {
    config: Config,
    store: InvoiceStore,
    docs: DocumentStore,
    json: bool,
}

impl Context {
    fn open(config_path: PathBuf, json: bool) -> Result<Self> {
        let config = Config::load(&config_path)?;
        let store = InvoiceStore::new(&config.db_path)?;
        let docs = DocumentStore::new(&config.storage_dir);
        Ok(Self {
            config,
            store,
            docs,
            json,
        })
    }

    /// JSON when `--json` was given, otherwise the table closure.
    fn emit<T: Serialize>(&self, data: &T, table: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(data)?);
        } else {
            table(data);
        }
        Ok(())
    }

    fn gateway(&self) -> Result<HttpGateway> {
        HttpGateway::from_config(&self.config.llm)
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    // `config` edits the file and must work even when it does not parse.
    if let Commands::Config(cmd) = &cli.command {
        return config_command(&cli.config, cmd);
    }

    let ctx = Context::open(cli.config, cli.json)?;
    match cli.command {
        Commands::Init => init(&ctx),
        Commands::Supplier(cmd) => supplier(&ctx, cmd),
        Commands::Po(cmd) => purchase_order(&ctx, cmd),
        Commands::Bl(cmd) => delivery_note(&ctx, cmd),
        Commands::Invoice(cmd) => invoice(&ctx, cmd).await,
        Commands::Ocr { id, backend } => run_ocr(&ctx, id, backend).await,
        Commands::Match { id } => {
            let outcome = Matcher::new(&ctx.store).match_invoice(id)?;
            ctx.emit(&outcome, print_match)
        }
        Commands::Rule(cmd) => rule(&ctx, cmd),
        Commands::Approval(cmd) => approval(&ctx, cmd),
        Commands::Dispute(cmd) => dispute(&ctx, cmd),
        Commands::Bank(cmd) => bank(&ctx, cmd),
        Commands::Export { output, dry_run } => export(&ctx, output.as_deref(), dry_run),
        Commands::Explain { invoice } => {
            let gateway = ctx.gateway()?;
            let mut sink = delta_sink(ctx.json);
            let answer =
                assistant::explain_anomaly(&ctx.store, &gateway, invoice, &mut sink).await?;
            finish_stream(&ctx, &answer)
        }
        Commands::Ask { question } => {
            let gateway = ctx.gateway()?;
            let mut sink = delta_sink(ctx.json);
            let answer =
                assistant::ai_pilotage(&ctx.store, &gateway, &question.join(" "), &mut sink)
                    .await?;
            finish_stream(&ctx, &answer)
        }
        Commands::Stats => {
            let snap = dashboard::snapshot(&ctx.store)?;
            ctx.emit(&snap, |s| {
                println!("Date               {}", s.generated_on);
                println!("Invoices           {}", s.invoices_total);
                for (status, count) in &s.by_status {
                    println!("  {status:<22} {count}");
                }
                println!("Awaiting approval  {:.2}", s.amount_awaiting_approval);
                println!("Overdue            {}", s.overdue);
                println!("Open disputes      {}", s.open_disputes);
                println!("Unreconciled bank  {}", s.unreconciled_transactions);
                println!("Mean OCR conf.     {}", percent(s.average_ocr_confidence));
                println!("Automatic matches  {}", percent(s.automatic_match_rate));
            })
        }
        Commands::Config(_) => Ok(()),
    }
}

fn config_command(path: &Path, cmd: &ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Set { key, value } => {
            Config::set_value(path, key, value)?;
            println!("{key} = {value}");
        }
        ConfigCommands::Path => println!("{}", path.display()),
    }
    Ok(())
}

fn init(ctx: &Context) -> Result<()> {
    std::fs::create_dir_all(&ctx.config.storage_dir)?;
    info!(
        db = %ctx.config.db_path,
        storage = %ctx.config.storage_dir,
        "Workspace ready"
    );
    ctx.emit(
        &json!({ "db_path": ctx.config.db_path, "storage_dir": ctx.config.storage_dir }),
        |_| {
            println!("Database   {}", ctx.config.db_path);
            println!("Documents  {}", ctx.config.storage_dir);
        },
    )
}

fn supplier(ctx: &Context, cmd: SupplierCommands) -> Result<()> {
    match cmd {
        SupplierCommands::Add(SupplierArgs {
            name,
            siret,
            vat,
            iban,
            email,
            critical,
        }) => {
            let id = ctx.store.insert_supplier(&NewSupplier {
                name,
                siret,
                vat_number: vat,
                iban,
                email,
                is_critical: critical,
            })?;
            ctx.emit(&json!({ "id": id }), |_| println!("Supplier {id} created"))
        }
        SupplierCommands::List => {
            let suppliers = ctx.store.list_suppliers()?;
            ctx.emit(&suppliers, |rows| {
                println!("{:>5}  {:<32} {:<16} {:<16} {}", "ID", "NAME", "SIRET", "TVA", "CRIT");
                for s in rows {
                    println!(
                        "{:>5}  {:<32} {:<16} {:<16} {}",
                        s.id,
                        s.name,
                        dash(&s.siret),
                        dash(&s.vat_number),
                        if s.is_critical { "oui" } else { "" }
                    );
                }
            })
        }
        SupplierCommands::Import { file } => {
            let report = csv_io::import_suppliers(&ctx.store, &std::fs::read_to_string(file)?)?;
            ctx.emit(&report, print_import)
        }
    }
}

fn purchase_order(ctx: &Context, cmd: PoCommands) -> Result<()> {
    match cmd {
        PoCommands::Add {
            number,
            supplier,
            amount_ht,
            amount_ttc,
            date,
        } => {
            let id = ctx.store.insert_purchase_order(&NewPurchaseOrder {
                po_number: number,
                supplier_id: supplier,
                amount_ht,
                amount_ttc,
                order_date: date.as_deref().map(parse_date).transpose()?,
            })?;
            ctx.emit(&json!({ "id": id }), |_| println!("Purchase order {id} created"))
        }
        PoCommands::List => {
            let orders = ctx.store.list_purchase_orders()?;
            ctx.emit(&orders, |rows| {
                println!("{:>5}  {:<20} {:>8} {:>12} {:>12}  {}", "ID", "NUMBER", "SUPPLIER", "HT", "TTC", "DATE");
                for po in rows {
                    println!(
                        "{:>5}  {:<20} {:>8} {:>12} {:>12}  {}",
                        po.id,
                        po.po_number,
                        opt_id(po.supplier_id),
                        money(po.amount_ht),
                        money(po.amount_ttc),
                        dash(&po.order_date)
                    );
                }
            })
        }
        PoCommands::Import { file } => {
            let report =
                csv_io::import_purchase_orders(&ctx.store, &std::fs::read_to_string(file)?)?;
            ctx.emit(&report, print_import)
        }
    }
}

fn delivery_note(ctx: &Context, cmd: BlCommands) -> Result<()> {
    match cmd {
        BlCommands::Add {
            number,
            po,
            supplier,
            date,
        } => {
            let id = ctx.store.insert_delivery_note(&NewDeliveryNote {
                bl_number: number,
                purchase_order_id: po,
                supplier_id: supplier,
                delivery_date: date.as_deref().map(parse_date).transpose()?,
            })?;
            ctx.emit(&json!({ "id": id }), |_| println!("Delivery note {id} created"))
        }
        BlCommands::List => {
            let notes = ctx.store.list_delivery_notes()?;
            ctx.emit(&notes, |rows| {
                println!("{:>5}  {:<20} {:>6} {:>8}  {}", "ID", "NUMBER", "PO", "SUPPLIER", "DATE");
                for bl in rows {
                    println!(
                        "{:>5}  {:<20} {:>6} {:>8}  {}",
                        bl.id,
                        bl.bl_number,
                        opt_id(bl.purchase_order_id),
                        opt_id(bl.supplier_id),
                        dash(&bl.delivery_date)
                    );
                }
            })
        }
    }
}

async fn invoice(ctx: &Context, cmd: InvoiceCommands) -> Result<()> {
    match cmd {
        InvoiceCommands::Submit { files, ocr } => {
            let mut results = Vec::new();
            for path in &files {
                let submission = ocr::submit_invoice(&ctx.store, &ctx.docs, path)?;
                info!(
                    invoice_id = submission.invoice_id,
                    file = %path.display(),
                    duplicate = submission.duplicate,
                    "Invoice submitted"
                );
                let extraction = if ocr && !submission.duplicate {
                    Some(extract_one(ctx, None, submission.invoice_id).await?)
                } else {
                    None
                };
                results.push(json!({ "submission": submission, "ocr": extraction }));
            }
            ctx.emit(&results, |rows| {
                for row in rows {
                    let id = &row["submission"]["invoice_id"];
                    if row["submission"]["duplicate"].as_bool().unwrap_or(false) {
                        println!("Invoice {id} (already submitted)");
                    } else {
                        println!("Invoice {id} submitted");
                    }
                    if let Some(status) = row["ocr"]["status"].as_str() {
                        println!("  extracted, status {status}");
                    }
                }
            })
        }
        InvoiceCommands::List { status } => {
            let invoices = ctx.store.list_invoices(status)?;
            ctx.emit(&invoices, |rows| print_invoices(rows))
        }
        InvoiceCommands::Show { id } => {
            let invoice = ctx.store.require_invoice(id)?;
            let detail = json!({
                "invoice": invoice,
                "fields": ctx.store.extracted_fields(id)?,
                "approval_history": ctx.store.list_approval_history(id)?,
                "disputes": ctx.store.disputes_for_invoice(id)?,
            });
            ctx.emit(&detail, |_| print_invoice_detail(ctx, &invoice))
        }
        InvoiceCommands::Validate { id } => {
            let outcome = ocr::validate_extraction(&ctx.store, id)?;
            ctx.emit(&outcome, print_match)
        }
    }
}

async fn run_ocr(ctx: &Context, id: Option<i64>, backend: Option<LlmBackend>) -> Result<()> {
    let ids = match id {
        Some(id) => vec![id],
        None => ctx
            .store
            .list_invoices(Some(InvoiceStatus::Nouvelle))?
            .into_iter()
            .map(|inv| inv.id)
            .collect(),
    };
    if ids.is_empty() {
        info!("No invoice waiting for extraction");
    }

    let mut outcomes = Vec::new();
    for invoice_id in ids {
        match extract_one(ctx, backend, invoice_id).await {
            Ok(outcome) => outcomes.push(outcome),
            // Quota and credit errors affect every remaining invoice.
            Err(e @ (AppError::RateLimited | AppError::PaymentRequired)) => return Err(e),
            Err(e) if id.is_some() => return Err(e),
            Err(e) => error!(invoice_id, error = %e, "Extraction failed"),
        }
    }
    ctx.emit(&outcomes, |rows| {
        for o in rows {
            println!(
                "Invoice {:>5}  {} fields, confidence {:.0}%, status {}",
                o.invoice_id,
                o.filled,
                o.confidence * 100.0,
                o.status
            );
            if let Some(m) = &o.matched {
                println!("               match {} ({:.2})", m.match_status, m.score);
            }
        }
    })
}

async fn extract_one(
    ctx: &Context,
    backend: Option<LlmBackend>,
    invoice_id: i64,
) -> Result<OcrOutcome> {
    match backend.unwrap_or(ctx.config.llm.backend) {
        LlmBackend::Heuristics => {
            ocr::process_invoice(&ctx.store, &ctx.docs, &ExtractionBackend::Heuristics, invoice_id)
                .await
        }
        chosen => {
            let mut llm = ctx.config.llm.clone();
            llm.backend = chosen;
            let gateway = HttpGateway::from_config(&llm)?;
            ocr::process_invoice(
                &ctx.store,
                &ctx.docs,
                &ExtractionBackend::Model(&gateway),
                invoice_id,
            )
            .await
        }
    }
}

fn rule(ctx: &Context, cmd: RuleCommands) -> Result<()> {
    let engine = ApprovalEngine::new(&ctx.store);
    match cmd {
        RuleCommands::Add {
            name,
            priority,
            min,
            max,
            critical,
            levels,
            roles,
        } => {
            let id = engine.create_rule(&NewApprovalRule {
                name,
                priority,
                min_amount: min,
                max_amount: max,
                is_critical_supplier: critical,
                required_levels: levels,
                level_roles: roles,
            })?;
            ctx.emit(&json!({ "id": id }), |_| println!("Rule {id} created"))
        }
        RuleCommands::List => {
            let rules = ctx.store.list_approval_rules()?;
            ctx.emit(&rules, |rows| {
                println!(
                    "{:>4}  {:<20} {:>4} {:>12} {:>12} {:>4} {:>6}  {}",
                    "ID", "NAME", "PRIO", "MIN", "MAX", "CRIT", "LEVELS", "ROLES"
                );
                for r in rows {
                    println!(
                        "{:>4}  {:<20} {:>4} {:>12.2} {:>12} {:>4} {:>6}  {}{}",
                        r.id,
                        r.name,
                        r.priority,
                        r.min_amount,
                        money(r.max_amount),
                        if r.is_critical_supplier { "oui" } else { "" },
                        r.required_levels,
                        r.level_roles.join(", "),
                        if r.is_active { "" } else { "  (inactive)" }
                    );
                }
            })
        }
        RuleCommands::Enable { id } => toggle_rule(ctx, id, true),
        RuleCommands::Disable { id } => toggle_rule(ctx, id, false),
    }
}

fn toggle_rule(ctx: &Context, id: i64, active: bool) -> Result<()> {
    if !ctx.store.set_approval_rule_active(id, active)? {
        return Err(AppError::not_found("approval rule", id));
    }
    info!(rule_id = id, active, "Approval rule updated");
    ctx.emit(&json!({ "id": id, "is_active": active }), |_| {
        println!("Rule {id} {}", if active { "enabled" } else { "disabled" })
    })
}

fn approval(ctx: &Context, cmd: ApprovalCommands) -> Result<()> {
    let engine = ApprovalEngine::new(&ctx.store);
    match cmd {
        ApprovalCommands::Init { invoice } => {
            let plan = engine.initialize(invoice)?;
            ctx.emit(&plan, |p| {
                println!(
                    "Invoice {} follows rule '{}' ({} level(s))",
                    p.invoice_id, p.rule_name, p.required_levels
                );
                for (i, role) in p.roles.iter().enumerate() {
                    println!("  {}. {role}", i + 1);
                }
            })
        }
        ApprovalCommands::Approve {
            invoice,
            level,
            approver,
            comment,
        } => {
            let level = resolve_level(ctx, invoice, level)?;
            let progress = engine.approve(invoice, level, &approver, comment.as_deref())?;
            ctx.emit(&progress, |p| {
                println!(
                    "Level {} approved, invoice {} is {} ({}/{})",
                    p.level, p.invoice_id, p.status, p.current_level, p.required_levels
                )
            })
        }
        ApprovalCommands::Reject {
            invoice,
            level,
            approver,
            reason,
        } => {
            let level = resolve_level(ctx, invoice, level)?;
            let progress = engine.reject(invoice, level, &approver, &reason)?;
            ctx.emit(&progress, |p| {
                println!("Level {} rejected, invoice {} is {}", p.level, p.invoice_id, p.status)
            })
        }
        ApprovalCommands::History { invoice } => {
            let history = ctx.store.list_approval_history(invoice)?;
            ctx.emit(&history, |rows| {
                println!("{:>5}  {:<16} {:<10} {:<16} {:<25} {}", "LEVEL", "ROLE", "STATUS", "BY", "AT", "COMMENT");
                for h in rows {
                    println!(
                        "{:>5}  {:<16} {:<10} {:<16} {:<25} {}",
                        h.level,
                        h.role,
                        h.status,
                        dash(&h.approver),
                        dash(&h.decided_at),
                        h.comment.as_deref().unwrap_or_default()
                    );
                }
            })
        }
    }
}

fn resolve_level(ctx: &Context, invoice: i64, level: Option<i64>) -> Result<i64> {
    match level {
        Some(level) => Ok(level),
        None => Ok(ctx.store.require_invoice(invoice)?.current_approval_level),
    }
}

fn dispute(ctx: &Context, cmd: DisputeCommands) -> Result<()> {
    match cmd {
        DisputeCommands::Open { invoice, reason } => {
            let id = ctx.store.open_dispute(invoice, &reason)?;
            ctx.emit(&json!({ "id": id, "invoice_id": invoice }), |_| {
                println!("Dispute {id} opened, invoice {invoice} is litige")
            })
        }
        DisputeCommands::Resolve { id, resolution } => {
            let dispute = ctx.store.resolve_dispute(id, &resolution)?;
            ctx.emit(&dispute, |d| println!("Dispute {} resolved", d.id))
        }
        DisputeCommands::List { all } => {
            let disputes = ctx.store.list_disputes(!all)?;
            ctx.emit(&disputes, |rows| {
                println!("{:>5}  {:>7}  {:<8} {:<25} {}", "ID", "INVOICE", "STATUS", "OPENED", "REASON");
                for d in rows {
                    println!(
                        "{:>5}  {:>7}  {:<8} {:<25} {}",
                        d.id, d.invoice_id, d.status, d.created_at, d.reason
                    );
                }
            })
        }
    }
}

fn bank(ctx: &Context, cmd: BankCommands) -> Result<()> {
    match cmd {
        BankCommands::Import { file } => {
            let report =
                csv_io::import_bank_statement(&ctx.store, &std::fs::read_to_string(file)?)?;
            ctx.emit(&report, print_import)
        }
        BankCommands::Reconcile => {
            let report = payments::reconcile(&ctx.store)?;
            ctx.emit(&report, |r| {
                for link in &r.linked {
                    println!(
                        "Transaction {} -> invoice {} ({:?})",
                        link.transaction_id, link.invoice_id, link.reason
                    );
                }
                println!(
                    "{} linked, {} ambiguous, {} unmatched",
                    r.linked.len(),
                    r.ambiguous,
                    r.unmatched
                );
            })
        }
        BankCommands::List => {
            let txs = ctx.store.list_bank_transactions()?;
            ctx.emit(&txs, |rows| {
                println!("{:>5}  {:<10} {:>12}  {:>7}  {}", "ID", "DATE", "AMOUNT", "INVOICE", "LABEL");
                for t in rows {
                    println!(
                        "{:>5}  {:<10} {:>12.2}  {:>7}  {}",
                        t.id,
                        t.transaction_date,
                        t.amount,
                        opt_id(t.invoice_id),
                        t.label
                    );
                }
            })
        }
    }
}

fn export(ctx: &Context, output: Option<&Path>, dry_run: bool) -> Result<()> {
    let result = csv_io::export_accounting(&ctx.store, &ctx.config.accounting, dry_run)?;
    match output {
        Some(path) => {
            std::fs::write(path, &result.csv)?;
            info!(path = %path.display(), lines = result.lines, "Accounting export written");
            ctx.emit(&result, |r| {
                println!(
                    "{} invoice(s), {} line(s) written to {}{}",
                    r.invoices.len(),
                    r.lines,
                    path.display(),
                    if r.dry_run { " (dry run)" } else { "" }
                )
            })
        }
        None if ctx.json => ctx.emit(&result, |_| {}),
        None => {
            print!("{}", result.csv);
            Ok(())
        }
    }
}

/// Deltas go straight to stdout, except in `--json` mode where only the
/// final object is printed.
fn delta_sink(json: bool) -> impl for<'s> FnMut(&'s str) + Send {
    move |delta: &str| {
        if !json {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
    }
}

fn finish_stream(ctx: &Context, answer: &str) -> Result<()> {
    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&json!({ "answer": answer }))?);
    } else {
        println!();
    }
    Ok(())
}

fn parse_date(raw: &str) -> Result<String> {
    normalize_date(raw).ok_or_else(|| AppError::Invalid(format!("unreadable date '{raw}'")))
}

fn print_import(report: &csv_io::ImportReport) {
    println!(
        "{} inserted, {} updated, {} skipped, {} error(s)",
        report.inserted,
        report.updated,
        report.skipped,
        report.errors.len()
    );
    for e in &report.errors {
        println!("  {e}");
    }
}

fn print_match(m: &MatchOutcome) {
    println!(
        "Invoice {}: {} (score {:.2}), status {}",
        m.invoice_id, m.match_status, m.score, m.status
    );
    println!(
        "  po {:.2}  bl {:.2}  supplier {:.2}  amount {:.2}",
        m.components.po, m.components.bl, m.components.supplier, m.components.amount
    );
    if m.supplier_created {
        println!("  supplier {} created", opt_id(m.supplier_id));
    }
    for a in &m.anomalies {
        println!("  ! {a}");
    }
}

fn print_invoices(rows: &[Invoice]) {
    println!(
        "{:>5}  {:<24} {:<28} {:<16} {:>12}  {}",
        "ID", "STATUS", "SUPPLIER", "NUMBER", "TTC", "DUE"
    );
    for inv in rows {
        println!(
            "{:>5}  {:<24} {:<28} {:<16} {:>12}  {}",
            inv.id,
            inv.status,
            dash(&inv.supplier_name),
            dash(&inv.invoice_number),
            money(inv.amount_ttc),
            dash(&inv.due_date)
        );
    }
}

fn print_invoice_detail(ctx: &Context, inv: &Invoice) {
    println!("Invoice {}  [{}]", inv.id, inv.status);
    println!("  file        {} ({})", inv.file_name, inv.file_key);
    println!("  supplier    {}", dash(&inv.supplier_name));
    println!("  number      {}", dash(&inv.invoice_number));
    println!("  date / due  {} / {}", dash(&inv.invoice_date), dash(&inv.due_date));
    println!(
        "  HT/TVA/TTC  {} / {} / {} {}",
        money(inv.amount_ht),
        money(inv.amount_tva),
        money(inv.amount_ttc),
        inv.currency.as_deref().unwrap_or("EUR")
    );
    println!("  PO / BL     {} / {}", dash(&inv.po_number), dash(&inv.bl_number));
    println!("  OCR         {}", percent(inv.ocr_confidence));
    if let Some(ms) = inv.match_status {
        println!("  match       {ms} ({})", money(inv.match_score));
    }
    for a in &inv.match_anomalies {
        println!("    ! {a}");
    }
    if inv.required_approval_levels > 0 {
        println!(
            "  approval    level {}/{}",
            inv.current_approval_level, inv.required_approval_levels
        );
    }
    if let Some(reason) = &inv.rejection_reason {
        println!("  rejected    {reason}");
    }
    if let Ok(disputes) = ctx.store.disputes_for_invoice(inv.id) {
        for d in disputes {
            println!("  dispute {}  [{}] {}", d.id, d.status, d.reason);
        }
    }
}

fn dash(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or("-")
}

fn money(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.2}")).unwrap_or_else(|| "-".into())
}

fn percent(v: Option<f64>) -> String {
    v.map(|x| format!("{:.0}%", x * 100.0))
        .unwrap_or_else(|| "-".into())
}

fn opt_id(v: Option<i64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_else(|| "-".into())
}
