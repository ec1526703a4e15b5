// src/approval.rs

use crate::error::{AppError, Result};
use crate::models::{ApprovalRule, ApprovalStatus, InvoiceStatus, NewApprovalRule};
use crate::store::InvoiceStore;
use serde::Serialize;
use tracing::{info, warn};

pub const MAX_LEVELS: i64 = 3;

/// First rule (caller supplies priority-descending order) covering the
/// amount and supplier criticality.
pub fn select_rule(rules: &[ApprovalRule], amount: f64, is_critical: bool) -> Result<&ApprovalRule> {
    rules
        .iter()
        .filter(|r| r.is_active)
        .find(|r| r.covers(amount, is_critical))
        .ok_or(AppError::NoMatchingRule {
            amount,
            is_critical,
        })
}

/// Checks a rule before it is stored.
pub fn validate_rule(rule: &NewApprovalRule) -> Result<()> {
    if rule.name.trim().is_empty() {
        return Err(AppError::Invalid("rule name is empty".into()));
    }
    if !(1..=MAX_LEVELS).contains(&rule.required_levels) {
        return Err(AppError::Invalid(format!(
            "required_levels must be between 1 and {MAX_LEVELS}, got {}",
            rule.required_levels
        )));
    }
    if rule.min_amount < 0.0 || rule.max_amount.is_some_and(|max| max <= rule.min_amount) {
        return Err(AppError::Invalid(
            "amount range must satisfy 0 <= min < max".into(),
        ));
    }
    if rule.level_roles.len() as i64 > rule.required_levels {
        return Err(AppError::Invalid(format!(
            "{} roles given for {} levels",
            rule.level_roles.len(),
            rule.required_levels
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalPlan {
    pub invoice_id: i64,
    pub rule_id: i64,
    pub rule_name: String,
    pub required_levels: i64,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalProgress {
    pub invoice_id: i64,
    pub level: i64,
    pub current_level: i64,
    pub required_levels: i64,
    pub status: InvoiceStatus,
}

pub struct ApprovalEngine<'a> {
    store: &'a InvoiceStore,
}

impl<'a> ApprovalEngine<'a> {
    pub fn new(store: &'a InvoiceStore) -> Self {
        Self { store }
    }

    pub fn create_rule(&self, rule: &NewApprovalRule) -> Result<i64> {
        validate_rule(rule)?;
        Ok(self.store.insert_approval_rule(rule)?)
    }

    /// Pick the rule for the invoice, lay out one pending row per level and
    /// move the invoice to `a_approuver` at level 1.
    pub fn initialize(&self, invoice_id: i64) -> Result<ApprovalPlan> {
        self.store.in_transaction(|store| {
            let invoice = store.require_invoice(invoice_id)?;
            if invoice.status.is_locked() {
                return Err(AppError::Invalid(format!(
                    "invoice {invoice_id} is {} and cannot enter approval",
                    invoice.status
                )));
            }
            let amount = invoice.amount_ttc.ok_or_else(|| {
                AppError::Invalid(format!("invoice {invoice_id} has no TTC amount"))
            })?;
            let is_critical = match invoice.supplier_id {
                Some(id) => store.get_supplier(id)?.is_some_and(|s| s.is_critical),
                None => false,
            };

            let rules = store.list_active_approval_rules()?;
            let rule = select_rule(&rules, amount, is_critical)?;
            let levels = rule.required_levels.clamp(1, MAX_LEVELS);

            let mut roles = Vec::with_capacity(levels as usize);
            for level in 1..=levels {
                let role = rule.role_for_level(level);
                store.upsert_pending_history(invoice_id, level, &role)?;
                roles.push(role);
            }
            let dropped = store.delete_history_above(invoice_id, levels)?;
            store.set_approval_progress(invoice_id, 1, levels, InvoiceStatus::AApprouver)?;

            info!(
                invoice_id,
                rule = %rule.name,
                amount,
                is_critical,
                levels,
                dropped,
                "Approval workflow initialized"
            );
            Ok(ApprovalPlan {
                invoice_id,
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                required_levels: levels,
                roles,
            })
        })
    }

    /// Approve one level. The last level releases the invoice for accounting.
    pub fn approve(
        &self,
        invoice_id: i64,
        level: i64,
        approver: &str,
        comment: Option<&str>,
    ) -> Result<ApprovalProgress> {
        self.store.in_transaction(|store| {
            let invoice = store.require_invoice(invoice_id)?;
            if level != invoice.current_approval_level {
                warn!(
                    invoice_id,
                    level,
                    current = invoice.current_approval_level,
                    "Approving a level other than the current one"
                );
            }
            if !store.set_history_decision(
                invoice_id,
                level,
                ApprovalStatus::Approved,
                Some(approver),
                comment,
            )? {
                return Err(AppError::not_found(
                    "approval level",
                    format!("{invoice_id}/{level}"),
                ));
            }

            let required = invoice.required_approval_levels;
            let (current, status) = if level >= required {
                (level, InvoiceStatus::PreteComptabilisation)
            } else {
                (level + 1, InvoiceStatus::AApprouver)
            };
            store.set_approval_progress(invoice_id, current, required, status)?;
            info!(invoice_id, level, approver, status = %status, "Approval recorded");

            Ok(ApprovalProgress {
                invoice_id,
                level,
                current_level: current,
                required_levels: required,
                status,
            })
        })
    }

    /// Reject at one level: the invoice goes to `exception` with the reason.
    pub fn reject(
        &self,
        invoice_id: i64,
        level: i64,
        approver: &str,
        reason: &str,
    ) -> Result<ApprovalProgress> {
        self.store.in_transaction(|store| {
            let invoice = store.require_invoice(invoice_id)?;
            if !store.set_history_decision(
                invoice_id,
                level,
                ApprovalStatus::Rejected,
                Some(approver),
                Some(reason),
            )? {
                return Err(AppError::not_found(
                    "approval level",
                    format!("{invoice_id}/{level}"),
                ));
            }
            store.set_rejection(invoice_id, reason)?;
            warn!(invoice_id, level, approver, reason, "Invoice rejected");

            Ok(ApprovalProgress {
                invoice_id,
                level,
                current_level: invoice.current_approval_level,
                required_levels: invoice.required_approval_levels,
                status: InvoiceStatus::Exception,
            })
        })
    }
}
