//! RECEIPT_STALE: pending receipts left unchallenged past their deadline.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::{allowlist_admits, ChainContext, Rule, RuleMeta};
use crate::chain::ReceiptStatus;
use crate::model::{ActionType, Finding, FindingCategory, Severity};

pub const RULE_ID: &str = "RECEIPT_STALE";

const META: RuleMeta = RuleMeta {
    id: RULE_ID,
    name: "Stale receipt detector",
    description: "Flags pending receipts whose challenge deadline has passed \
                  without finalization or dispute",
    default_severity: Severity::High,
    category: FindingCategory::Receipt,
    enabled_by_default: true,
    version: "1.2.0",
};

pub struct ReceiptStaleRule {
    pub min_receipt_age_seconds: u64,
    /// Non-empty lists are inclusive filters: only matching solver /
    /// receipt ids are acted on (lower-cased substring match).
    pub allowlist_solver_ids: Vec<String>,
    pub allowlist_receipt_ids: Vec<String>,
}

impl ReceiptStaleRule {
    pub fn new(
        min_receipt_age_seconds: u64,
        allowlist_solver_ids: Vec<String>,
        allowlist_receipt_ids: Vec<String>,
    ) -> Self {
        Self { min_receipt_age_seconds, allowlist_solver_ids, allowlist_receipt_ids }
    }
}

#[async_trait]
impl Rule for ReceiptStaleRule {
    fn meta(&self) -> &RuleMeta {
        &META
    }

    async fn evaluate(&self, ctx: &dyn ChainContext) -> Result<Vec<Finding>> {
        let now = ctx.block_timestamp();
        let receipts = ctx.receipts_in_challenge_window().await?;
        let disputes = ctx.active_disputes().await?;
        let disputed_ids: Vec<String> =
            disputes.iter().map(|d| d.receipt_id.to_lowercase()).collect();

        let mut findings = Vec::new();
        for receipt in receipts {
            if receipt.status != ReceiptStatus::Pending {
                continue;
            }
            if receipt.challenge_deadline >= now {
                continue;
            }
            let age_seconds = now - receipt.challenge_deadline;
            if age_seconds <= self.min_receipt_age_seconds {
                continue;
            }
            if disputed_ids.contains(&receipt.receipt_id.to_lowercase()) {
                continue;
            }
            if !allowlist_admits(&self.allowlist_solver_ids, &receipt.solver_id) {
                continue;
            }
            if !allowlist_admits(&self.allowlist_receipt_ids, &receipt.receipt_id) {
                continue;
            }

            let finding = Finding::new(
                RULE_ID,
                &format!("Stale receipt detected: {}", receipt.receipt_id),
                &format!(
                    "Receipt {} from solver {} is {}s past its challenge deadline \
                     and has not been finalized or disputed",
                    receipt.receipt_id, receipt.solver_id, age_seconds
                ),
                Severity::High,
                FindingCategory::Receipt,
                ctx.current_block(),
                now * 1000,
                ActionType::OpenDispute,
            )
            .with_receipt(&receipt.receipt_id)
            .with_solver(&receipt.solver_id)
            .with_meta("challengeDeadline", json!(receipt.challenge_deadline))
            .with_meta("ageSeconds", json!(age_seconds))
            .with_meta("intentHash", json!(receipt.intent_hash))
            .with_meta("receiptStatus", json!(receipt.status.as_str()));
            findings.push(finding);
        }
        Ok(findings)
    }
}
