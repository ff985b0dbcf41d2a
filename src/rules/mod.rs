//! Rule engine: registry, scheduled evaluation, timeouts, error isolation.

pub mod delegation_payment;
pub mod mock;
pub mod receipt_stale;
pub mod sample;

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::chain::{ChainEvent, DisputeView, ReceiptView, SolverView};
use crate::logging::{json_log, log_error, obj, v_str, Domain};
use crate::model::{Finding, FindingCategory, Severity};

/// Chain state supplied to every rule. Accessors are effectful and may
/// fail; rules treat the context as read-only and deterministic for the
/// duration of one evaluation.
#[async_trait]
pub trait ChainContext: Send + Sync {
    fn current_block(&self) -> u64;

    /// Timestamp of the current block, unix seconds.
    fn block_timestamp(&self) -> u64;

    fn chain_id(&self) -> u64;

    async fn receipts_in_challenge_window(&self) -> Result<Vec<ReceiptView>>;

    async fn active_disputes(&self) -> Result<Vec<DisputeView>>;

    async fn solver_info(&self, solver_id: &str) -> Result<Option<SolverView>>;

    async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>>;
}

/// Immutable rule metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMeta {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub default_severity: Severity,
    pub category: FindingCategory,
    pub enabled_by_default: bool,
    pub version: &'static str,
}

/// A detection rule. Implementations are pure with respect to the
/// supplied context.
#[async_trait]
pub trait Rule: Send + Sync {
    fn meta(&self) -> &RuleMeta;

    async fn evaluate(&self, ctx: &dyn ChainContext) -> Result<Vec<Finding>>;
}

/// ruleId → rule, preserving registration order.
#[derive(Default)]
pub struct RuleRegistry {
    order: Vec<&'static str>,
    rules: HashMap<&'static str, Box<dyn Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Double registration of the same id is a programmer error.
    pub fn register(&mut self, rule: Box<dyn Rule>) -> Result<()> {
        let id = rule.meta().id;
        if self.rules.contains_key(id) {
            bail!("rule {} registered twice", id);
        }
        self.order.push(id);
        self.rules.insert(id, rule);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&dyn Rule> {
        self.rules.get(id).map(|r| r.as_ref())
    }

    /// Rules with `enabled_by_default`, in registration order.
    pub fn enabled(&self) -> Vec<&dyn Rule> {
        self.order
            .iter()
            .filter_map(|id| self.rules.get(id))
            .filter(|r| r.meta().enabled_by_default)
            .map(|r| r.as_ref())
            .collect()
    }

    pub fn all_ids(&self) -> &[&'static str] {
        &self.order
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Restrict to these rule ids; None selects the enabled set.
    pub rule_ids: Option<Vec<String>>,
    pub stop_on_error: bool,
    /// Per-rule timeout override, milliseconds.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRunResult {
    pub rule_id: String,
    pub findings: Vec<Finding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineReport {
    pub results: Vec<RuleRunResult>,
    pub rules_run: usize,
    pub rules_failed: usize,
    pub total_findings: usize,
    pub duration_ms: u64,
}

pub struct RuleEngine {
    pub default_timeout_ms: u64,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self { default_timeout_ms: 30_000 }
    }
}

impl RuleEngine {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self { default_timeout_ms }
    }

    /// Run the selected rules sequentially. A thrown error or timeout is
    /// captured as a per-rule result, never propagated; subsequent rules
    /// still execute unless `stop_on_error` is set.
    pub async fn execute(
        &self,
        registry: &RuleRegistry,
        ctx: &dyn ChainContext,
        options: &ExecuteOptions,
    ) -> EngineReport {
        let started = Instant::now();
        let timeout_ms = options.timeout_ms.unwrap_or(self.default_timeout_ms);

        let selected: Vec<&dyn Rule> = match &options.rule_ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| {
                    let rule = registry.get(id);
                    if rule.is_none() {
                        log_error(Domain::Rule, "unknown_rule", id);
                    }
                    rule
                })
                .collect(),
            None => registry.enabled(),
        };

        let mut results = Vec::with_capacity(selected.len());
        let mut rules_failed = 0usize;
        let mut total_findings = 0usize;

        for rule in selected {
            let rule_id = rule.meta().id;
            let rule_started = Instant::now();
            let outcome = tokio::time::timeout(
                std::time::Duration::from_millis(timeout_ms),
                rule.evaluate(ctx),
            )
            .await;
            let duration_ms = rule_started.elapsed().as_millis() as u64;

            let (findings, error) = match outcome {
                Ok(Ok(findings)) => (findings, None),
                Ok(Err(err)) => (Vec::new(), Some(err.to_string())),
                Err(_) => (Vec::new(), Some(format!("Rule {} timed out", rule_id))),
            };

            if let Some(err) = &error {
                rules_failed += 1;
                log_error(Domain::Rule, "rule_failed", &format!("{}: {}", rule_id, err));
            } else {
                total_findings += findings.len();
                for finding in &findings {
                    crate::logging::log_finding(
                        rule_id,
                        &finding.id,
                        finding.severity.as_str(),
                        &finding.title,
                    );
                }
            }

            let failed = error.is_some();
            results.push(RuleRunResult {
                rule_id: rule_id.to_string(),
                findings,
                error,
                duration_ms,
            });

            if failed && options.stop_on_error {
                break;
            }
        }

        let report = EngineReport {
            rules_run: results.len(),
            rules_failed,
            total_findings,
            duration_ms: started.elapsed().as_millis() as u64,
            results,
        };
        json_log(
            Domain::Rule,
            "engine_pass",
            obj(&[
                ("rules_run", serde_json::json!(report.rules_run)),
                ("rules_failed", serde_json::json!(report.rules_failed)),
                ("total_findings", serde_json::json!(report.total_findings)),
                ("chain_id", serde_json::json!(ctx.chain_id())),
                ("block", serde_json::json!(ctx.current_block())),
            ]),
        );
        report
    }
}

/// Inclusive allowlist semantics shared by rules: an empty list admits
/// everything; a non-empty list admits values containing any entry as a
/// lower-cased substring.
pub fn allowlist_admits(list: &[String], value: &str) -> bool {
    if list.is_empty() {
        return true;
    }
    let lower = value.to_lowercase();
    list.iter().any(|entry| lower.contains(entry.as_str()))
}

/// Deterministic in-memory context for rule harnesses, the chain-side
/// sibling of [`mock::MockAlwaysFind`].
pub mod testutil {
    use super::*;
    use serde_json::Map;

    /// Static context with canned receipts, disputes and events. Receipt
    /// `created_at` mirrors the source model: one hour before the
    /// current block timestamp.
    pub struct StaticContext {
        pub block: u64,
        pub timestamp: u64,
        pub chain: u64,
        pub receipts: Vec<ReceiptView>,
        pub disputes: Vec<DisputeView>,
        pub solvers: Vec<SolverView>,
        pub events: Vec<ChainEvent>,
        pub fail_receipts: bool,
    }

    impl StaticContext {
        pub fn new(block: u64, timestamp: u64) -> Self {
            Self {
                block,
                timestamp,
                chain: 31_337,
                receipts: Vec::new(),
                disputes: Vec::new(),
                solvers: Vec::new(),
                events: Vec::new(),
                fail_receipts: false,
            }
        }

        pub fn receipt(mut self, receipt: ReceiptView) -> Self {
            self.receipts.push(receipt);
            self
        }

        pub fn pending_receipt(self, id: &str, solver: &str, deadline: u64) -> Self {
            let created_at = self.timestamp.saturating_sub(3600);
            self.receipt(ReceiptView {
                receipt_id: id.to_string(),
                intent_hash: format!("0xintent-{}", id.trim_start_matches("0x")),
                solver_id: solver.to_string(),
                status: crate::chain::ReceiptStatus::Pending,
                challenge_deadline: deadline,
                created_at,
                amount_wei: 1_000_000_000_000_000_000,
            })
        }

        pub fn dispute(mut self, receipt_id: &str) -> Self {
            self.disputes.push(DisputeView {
                dispute_id: format!("0xd-{}", self.disputes.len()),
                receipt_id: receipt_id.to_string(),
                challenger: "0xchallenger".to_string(),
                opened_block: self.block,
            });
            self
        }

        pub fn event(mut self, name: &str, block: u64, attrs: &[(&str, serde_json::Value)]) -> Self {
            let mut attributes = Map::new();
            for (k, v) in attrs {
                attributes.insert((*k).to_string(), v.clone());
            }
            self.events.push(ChainEvent {
                name: name.to_string(),
                address: "0xfacilitator00000000000000000000000000000".to_string(),
                block_number: block,
                tx_hash: format!("0xtx{}", self.events.len()),
                log_index: self.events.len() as u64,
                attributes,
            });
            self
        }
    }

    #[async_trait]
    impl ChainContext for StaticContext {
        fn current_block(&self) -> u64 {
            self.block
        }

        fn block_timestamp(&self) -> u64 {
            self.timestamp
        }

        fn chain_id(&self) -> u64 {
            self.chain
        }

        async fn receipts_in_challenge_window(&self) -> Result<Vec<ReceiptView>> {
            if self.fail_receipts {
                bail!("receipt fetch failed");
            }
            Ok(self.receipts.clone())
        }

        async fn active_disputes(&self) -> Result<Vec<DisputeView>> {
            Ok(self.disputes.clone())
        }

        async fn solver_info(&self, solver_id: &str) -> Result<Option<SolverView>> {
            Ok(self.solvers.iter().find(|s| s.solver_id == solver_id).cloned())
        }

        async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>> {
            Ok(self
                .events
                .iter()
                .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::StaticContext;
    use super::*;
    use crate::model::ActionType;

    struct FailingRule {
        meta: RuleMeta,
    }

    #[async_trait]
    impl Rule for FailingRule {
        fn meta(&self) -> &RuleMeta {
            &self.meta
        }

        async fn evaluate(&self, _ctx: &dyn ChainContext) -> Result<Vec<Finding>> {
            bail!("boom")
        }
    }

    struct SlowRule {
        meta: RuleMeta,
    }

    #[async_trait]
    impl Rule for SlowRule {
        fn meta(&self) -> &RuleMeta {
            &self.meta
        }

        async fn evaluate(&self, _ctx: &dyn ChainContext) -> Result<Vec<Finding>> {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(Vec::new())
        }
    }

    fn meta(id: &'static str) -> RuleMeta {
        RuleMeta {
            id,
            name: id,
            description: "test rule",
            default_severity: Severity::Info,
            category: FindingCategory::System,
            enabled_by_default: true,
            version: "1.0.0",
        }
    }

    #[test]
    fn double_registration_fails() {
        let mut registry = RuleRegistry::new();
        registry.register(Box::new(mock::MockAlwaysFind::new())).unwrap();
        assert!(registry.register(Box::new(mock::MockAlwaysFind::new())).is_err());
    }

    #[test]
    fn enabled_respects_flag_and_order() {
        let mut registry = RuleRegistry::new();
        registry.register(Box::new(FailingRule { meta: meta("A") })).unwrap();
        registry.register(Box::new(mock::MockAlwaysFind::new())).unwrap();
        registry.register(Box::new(FailingRule { meta: meta("B") })).unwrap();
        let ids: Vec<&str> = registry.enabled().iter().map(|r| r.meta().id).collect();
        // mock rule is disabled by default
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn errors_are_isolated_per_rule() {
        let mut registry = RuleRegistry::new();
        registry.register(Box::new(FailingRule { meta: meta("FAIL") })).unwrap();
        registry.register(Box::new(mock::MockAlwaysFind::new())).unwrap();

        let ctx = StaticContext::new(100, 1_700_000_000);
        let engine = RuleEngine::default();
        let options = ExecuteOptions {
            rule_ids: Some(vec!["FAIL".to_string(), mock::RULE_ID.to_string()]),
            ..Default::default()
        };
        let report = engine.execute(&registry, &ctx, &options).await;

        assert_eq!(report.rules_run, 2);
        assert_eq!(report.rules_failed, 1);
        assert_eq!(report.total_findings, 1);
        assert_eq!(report.results[0].error.as_deref(), Some("boom"));
        assert!(report.results[1].error.is_none());
        assert_eq!(report.results[1].findings[0].recommended_action, ActionType::None);
    }

    #[tokio::test]
    async fn stop_on_error_halts_the_pass() {
        let mut registry = RuleRegistry::new();
        registry.register(Box::new(FailingRule { meta: meta("FAIL") })).unwrap();
        registry.register(Box::new(mock::MockAlwaysFind::new())).unwrap();

        let ctx = StaticContext::new(100, 1_700_000_000);
        let engine = RuleEngine::default();
        let options = ExecuteOptions {
            rule_ids: Some(vec!["FAIL".to_string(), mock::RULE_ID.to_string()]),
            stop_on_error: true,
            ..Default::default()
        };
        let report = engine.execute(&registry, &ctx, &options).await;
        assert_eq!(report.rules_run, 1);
        assert_eq!(report.rules_failed, 1);
    }

    #[tokio::test]
    async fn timeout_becomes_synthetic_error() {
        let mut registry = RuleRegistry::new();
        registry.register(Box::new(SlowRule { meta: meta("SLOW") })).unwrap();

        let ctx = StaticContext::new(100, 1_700_000_000);
        let engine = RuleEngine::default();
        let options = ExecuteOptions {
            rule_ids: Some(vec!["SLOW".to_string()]),
            timeout_ms: Some(10),
            ..Default::default()
        };
        let report = engine.execute(&registry, &ctx, &options).await;
        assert_eq!(report.rules_failed, 1);
        assert_eq!(report.results[0].error.as_deref(), Some("Rule SLOW timed out"));
    }

    #[test]
    fn allowlist_semantics() {
        assert!(allowlist_admits(&[], "anything"));
        let list = vec!["solver-a".to_string()];
        assert!(allowlist_admits(&list, "SOLVER-A-01"));
        assert!(!allowlist_admits(&list, "solver-b"));
    }
}
