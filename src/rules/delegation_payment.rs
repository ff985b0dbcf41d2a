//! DELEGATION_PAYMENT: outsized or repeated delegated-payment settlements
//! from the configured facilitator.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ChainContext, Rule, RuleMeta};
use crate::model::{ActionType, Finding, FindingCategory, Severity};

pub const RULE_ID: &str = "DELEGATION_PAYMENT";

const META: RuleMeta = RuleMeta {
    id: RULE_ID,
    name: "Delegated payment monitor",
    description: "Watches DelegatedPaymentSettled events for oversized amounts \
                  and per-delegation settlement bursts",
    default_severity: Severity::High,
    category: FindingCategory::Escrow,
    enabled_by_default: true,
    version: "1.1.0",
};

pub struct DelegationPaymentRule {
    pub facilitator: String,
    pub scan_blocks: u64,
    pub large_amount_wei: u128,
    pub max_settlements_per_epoch: u64,
}

impl DelegationPaymentRule {
    pub fn new(
        facilitator: &str,
        scan_blocks: u64,
        large_amount_wei: u128,
        max_settlements_per_epoch: u64,
    ) -> Self {
        Self {
            facilitator: facilitator.to_lowercase(),
            scan_blocks,
            large_amount_wei,
            max_settlements_per_epoch,
        }
    }
}

fn attr_amount(attrs: &serde_json::Map<String, Value>) -> u128 {
    attrs
        .get("amount")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl Rule for DelegationPaymentRule {
    fn meta(&self) -> &RuleMeta {
        &META
    }

    async fn evaluate(&self, ctx: &dyn ChainContext) -> Result<Vec<Finding>> {
        let to_block = ctx.current_block();
        let from_block = to_block.saturating_sub(self.scan_blocks).max(1);
        let now_ms = ctx.block_timestamp() * 1000;

        let events = ctx.events(from_block, to_block).await?;
        let settlements: Vec<_> = events
            .iter()
            .filter(|e| {
                e.name == "DelegatedPaymentSettled" && e.address.to_lowercase() == self.facilitator
            })
            .collect();

        let mut findings = Vec::new();

        // (a) single settlements above the amount threshold
        for event in &settlements {
            let amount = attr_amount(&event.attributes);
            if amount <= self.large_amount_wei {
                continue;
            }
            let delegation = event
                .attributes
                .get("delegationHash")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            findings.push(
                Finding::new(
                    RULE_ID,
                    &format!("Large delegated settlement: {} wei", amount),
                    &format!(
                        "Delegation {} settled {} wei in tx {}, above the configured \
                         threshold of {} wei",
                        delegation, amount, event.tx_hash, self.large_amount_wei
                    ),
                    Severity::High,
                    FindingCategory::Escrow,
                    event.block_number,
                    now_ms,
                    ActionType::ManualReview,
                )
                .with_tx(&event.tx_hash)
                .with_contract(&event.address)
                .with_meta("delegationHash", json!(delegation))
                .with_meta("amountWei", json!(amount.to_string()))
                .with_meta("thresholdWei", json!(self.large_amount_wei.to_string())),
            );
        }

        // (b) per-delegation settlement counts across the window
        let mut per_delegation: HashMap<String, (u64, u128, String)> = HashMap::new();
        for event in &settlements {
            let delegation = event
                .attributes
                .get("delegationHash")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_lowercase();
            let entry = per_delegation.entry(delegation).or_insert((0, 0, event.tx_hash.clone()));
            entry.0 += 1;
            entry.1 = entry.1.saturating_add(attr_amount(&event.attributes));
        }
        let mut repeated: Vec<_> = per_delegation
            .into_iter()
            .filter(|(_, (count, _, _))| *count > self.max_settlements_per_epoch)
            .collect();
        repeated.sort_by(|a, b| a.0.cmp(&b.0));
        for (delegation, (count, total, last_tx)) in repeated {
            findings.push(
                Finding::new(
                    RULE_ID,
                    &format!("Repeated delegation settlements: {}", delegation),
                    &format!(
                        "Delegation {} settled {} times in the last {} blocks \
                         (max {}), {} wei total",
                        delegation, count, self.scan_blocks, self.max_settlements_per_epoch, total
                    ),
                    Severity::Medium,
                    FindingCategory::Escrow,
                    to_block,
                    now_ms,
                    ActionType::Notify,
                )
                .with_tx(&last_tx)
                .with_contract(&self.facilitator)
                .with_meta("delegationHash", json!(delegation))
                .with_meta("settlementCount", json!(count))
                .with_meta("totalAmountWei", json!(total.to_string()))
                .with_meta("windowBlocks", json!(self.scan_blocks)),
            );
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testutil::StaticContext;

    const NOW: u64 = 1_704_067_200;
    const FACILITATOR: &str = "0xfacilitator00000000000000000000000000000";

    fn rule() -> DelegationPaymentRule {
        DelegationPaymentRule::new(FACILITATOR, 1000, 10u128.pow(18), 2)
    }

    fn settle(ctx: StaticContext, block: u64, hash: &str, amount: u128) -> StaticContext {
        ctx.event(
            "DelegatedPaymentSettled",
            block,
            &[
                ("delegationHash", json!(hash)),
                ("amount", json!(amount.to_string())),
            ],
        )
    }

    #[tokio::test]
    async fn flags_large_amounts() {
        let ctx = settle(StaticContext::new(5000, NOW), 4900, "0xd1", 3 * 10u128.pow(18));
        let findings = rule().evaluate(&ctx).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].recommended_action, ActionType::ManualReview);
        assert_eq!(findings[0].metadata["amountWei"], "3000000000000000000");
    }

    #[tokio::test]
    async fn flags_repeated_settlements_with_totals() {
        let mut ctx = StaticContext::new(5000, NOW);
        for i in 0..3 {
            ctx = settle(ctx, 4800 + i, "0xDD", 10u128.pow(17));
        }
        let findings = rule().evaluate(&ctx).await.unwrap();
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.severity, Severity::Medium);
        assert_eq!(f.recommended_action, ActionType::Notify);
        assert_eq!(f.metadata["settlementCount"], 3);
        assert_eq!(f.metadata["totalAmountWei"], "300000000000000000");
        // delegation hashes compare lower-cased
        assert_eq!(f.metadata["delegationHash"], "0xdd");
    }

    #[tokio::test]
    async fn ignores_events_outside_window_or_other_contracts() {
        let mut ctx = settle(StaticContext::new(5000, NOW), 3000, "0xd1", 5 * 10u128.pow(18));
        ctx.events[0].block_number = 3000; // outside the 1000-block window
        assert!(rule().evaluate(&ctx).await.unwrap().is_empty());

        let mut ctx = settle(StaticContext::new(5000, NOW), 4950, "0xd1", 5 * 10u128.pow(18));
        ctx.events[0].address = "0xother".to_string();
        assert!(rule().evaluate(&ctx).await.unwrap().is_empty());
    }
}
