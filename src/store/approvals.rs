use super::{InvoiceStore, json_list, to_json_list};
use crate::models::{
    ApprovalHistoryEntry, ApprovalRule, ApprovalStatus, NewApprovalRule, now_rfc3339,
};
use rusqlite::{Result as SqliteResult, Row, params};
use tracing::info;

const RULE_COLUMNS: &str = "id, name, priority, min_amount, max_amount, is_critical_supplier,
    required_levels, level_roles, is_active";
const HISTORY_COLUMNS: &str =
    "id, invoice_id, level, role, status, approver, comment, decided_at, created_at";

impl InvoiceStore {
    pub fn insert_approval_rule(&self, rule: &NewApprovalRule) -> SqliteResult<i64> {
        self.conn.execute(
            "INSERT INTO approval_rules
                (name, priority, min_amount, max_amount, is_critical_supplier, required_levels, level_roles)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rule.name,
                rule.priority,
                rule.min_amount,
                rule.max_amount,
                rule.is_critical_supplier,
                rule.required_levels,
                to_json_list(&rule.level_roles),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(rule_id = id, name = %rule.name, priority = rule.priority, "Approval rule stored");
        Ok(id)
    }

    /// All rules, highest priority first (ties by ascending id).
    pub fn list_approval_rules(&self) -> SqliteResult<Vec<ApprovalRule>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rules ORDER BY priority DESC, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_rule)?;
        rows.collect()
    }

    /// Active rules in evaluation order.
    pub fn list_active_approval_rules(&self) -> SqliteResult<Vec<ApprovalRule>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rules
             WHERE is_active = 1
             ORDER BY priority DESC, id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_rule)?;
        rows.collect()
    }

    /// Returns false when no such rule exists.
    pub fn set_approval_rule_active(&self, id: i64, active: bool) -> SqliteResult<bool> {
        let changed = self.conn.execute(
            "UPDATE approval_rules SET is_active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        Ok(changed > 0)
    }

    /// Create (or reset to pending) the history row for one level.
    pub fn upsert_pending_history(&self, invoice_id: i64, level: i64, role: &str) -> SqliteResult<()> {
        self.conn.execute(
            "INSERT INTO approval_history (invoice_id, level, role, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(invoice_id, level) DO UPDATE SET
                role = excluded.role,
                status = excluded.status,
                approver = NULL,
                comment = NULL,
                decided_at = NULL",
            params![invoice_id, level, role, ApprovalStatus::Pending, now_rfc3339()],
        )?;
        Ok(())
    }

    /// Drop history rows above `max_level` (after a rule change shortened the chain).
    pub fn delete_history_above(&self, invoice_id: i64, max_level: i64) -> SqliteResult<usize> {
        self.conn.execute(
            "DELETE FROM approval_history WHERE invoice_id = ?1 AND level > ?2",
            params![invoice_id, max_level],
        )
    }

    /// Record a decision; returns false when that level has no history row.
    pub fn set_history_decision(
        &self,
        invoice_id: i64,
        level: i64,
        status: ApprovalStatus,
        approver: Option<&str>,
        comment: Option<&str>,
    ) -> SqliteResult<bool> {
        let changed = self.conn.execute(
            "UPDATE approval_history
             SET status = ?1, approver = ?2, comment = ?3, decided_at = ?4
             WHERE invoice_id = ?5 AND level = ?6",
            params![status, approver, comment, now_rfc3339(), invoice_id, level],
        )?;
        Ok(changed > 0)
    }

    pub fn list_approval_history(&self, invoice_id: i64) -> SqliteResult<Vec<ApprovalHistoryEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM approval_history WHERE invoice_id = ?1 ORDER BY level"
        ))?;
        let rows = stmt.query_map(params![invoice_id], row_to_history)?;
        rows.collect()
    }
}

fn row_to_rule(row: &Row<'_>) -> SqliteResult<ApprovalRule> {
    Ok(ApprovalRule {
        id: row.get(0)?,
        name: row.get(1)?,
        priority: row.get(2)?,
        min_amount: row.get(3)?,
        max_amount: row.get(4)?,
        is_critical_supplier: row.get(5)?,
        required_levels: row.get(6)?,
        level_roles: json_list(row.get(7)?),
        is_active: row.get(8)?,
    })
}

fn row_to_history(row: &Row<'_>) -> SqliteResult<ApprovalHistoryEntry> {
    Ok(ApprovalHistoryEntry {
        id: row.get(0)?,
        invoice_id: row.get(1)?,
        level: row.get(2)?,
        role: row.get(3)?,
        status: row.get(4)?,
        approver: row.get(5)?,
        comment: row.get(6)?,
        decided_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::insert_blank;

    fn rule(name: &str, priority: i64) -> NewApprovalRule {
        NewApprovalRule {
            name: name.into(),
            priority,
            required_levels: 1,
            ..Default::default()
        }
    }

    #[test]
    fn rules_come_back_in_priority_order() {
        let store = InvoiceStore::open_in_memory().unwrap();
        store.insert_approval_rule(&rule("low", 1)).unwrap();
        let high = store.insert_approval_rule(&rule("high", 10)).unwrap();
        store.insert_approval_rule(&rule("tie", 10)).unwrap();

        let names: Vec<String> = store
            .list_approval_rules()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["high", "tie", "low"]);

        assert!(store.set_approval_rule_active(high, false).unwrap());
        assert!(!store.set_approval_rule_active(999, false).unwrap());
        let active = store.list_active_approval_rules().unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].name, "tie");
    }

    #[test]
    fn upsert_resets_a_decided_level() {
        let store = InvoiceStore::open_in_memory().unwrap();
        let inv = insert_blank(&store, "h");
        store.upsert_pending_history(inv, 1, "comptable").unwrap();
        assert!(store
            .set_history_decision(inv, 1, ApprovalStatus::Approved, Some("alice"), None)
            .unwrap());
        store.upsert_pending_history(inv, 1, "daf").unwrap();

        let history = store.list_approval_history(inv).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ApprovalStatus::Pending);
        assert_eq!(history[0].role, "daf");
        assert!(history[0].approver.is_none());
        assert!(!store
            .set_history_decision(inv, 2, ApprovalStatus::Approved, None, None)
            .unwrap());
    }
}
