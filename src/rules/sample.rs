//! SAMPLE-001: receipts approaching their challenge deadline.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::{ChainContext, Rule, RuleMeta};
use crate::chain::ReceiptStatus;
use crate::model::{ActionType, Finding, FindingCategory, Severity};

pub const RULE_ID: &str = "SAMPLE-001";

/// Deadlines closer than this get a manual-review nudge.
const WARN_WINDOW_SECONDS: u64 = 600;

const META: RuleMeta = RuleMeta {
    id: RULE_ID,
    name: "Deadline proximity sample",
    description: "Flags receipts whose challenge deadline is within ten minutes",
    default_severity: Severity::Medium,
    category: FindingCategory::Receipt,
    enabled_by_default: true,
    version: "1.0.0",
};

#[derive(Default)]
pub struct SampleRule;

impl SampleRule {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Rule for SampleRule {
    fn meta(&self) -> &RuleMeta {
        &META
    }

    async fn evaluate(&self, ctx: &dyn ChainContext) -> Result<Vec<Finding>> {
        let now = ctx.block_timestamp();
        let mut findings = Vec::new();
        for receipt in ctx.receipts_in_challenge_window().await? {
            if receipt.status != ReceiptStatus::Pending {
                continue;
            }
            if receipt.challenge_deadline <= now {
                continue;
            }
            let remaining = receipt.challenge_deadline - now;
            if remaining > WARN_WINDOW_SECONDS {
                continue;
            }
            findings.push(
                Finding::new(
                    RULE_ID,
                    &format!("Challenge window closing: {}", receipt.receipt_id),
                    &format!(
                        "Receipt {} can only be disputed for another {}s",
                        receipt.receipt_id, remaining
                    ),
                    Severity::Medium,
                    FindingCategory::Receipt,
                    ctx.current_block(),
                    now * 1000,
                    ActionType::ManualReview,
                )
                .with_receipt(&receipt.receipt_id)
                .with_solver(&receipt.solver_id)
                .with_meta("secondsRemaining", json!(remaining)),
            );
        }
        Ok(findings)
    }
}
