//! Action executor: dry-run vs live, idempotency, per-batch rate limit,
//! pluggable handlers.

pub mod handlers;
pub mod ledger;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::clock::Clock;
use crate::logging::{json_log, log_action, obj, v_str, Domain};
use crate::model::{ActionResult, ActionType, Finding};
use self::ledger::{ActionLedger, LedgerActionType};

/// One-shot execution returning a tx hash, plus a health probe.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn action_type(&self) -> ActionType;

    async fn execute(&self, finding: &Finding) -> Result<String>;

    async fn is_healthy(&self) -> bool;
}

/// Exhaustive ActionType → ledger mapping; reaching an unmapped type is
/// an error so new action kinds cannot silently skip the ledger.
fn ledger_action(action: ActionType) -> Result<LedgerActionType> {
    match action {
        ActionType::OpenDispute => Ok(LedgerActionType::OpenDispute),
        ActionType::SubmitEvidence => Ok(LedgerActionType::SubmitEvidence),
        other => bail!("no ledger mapping for action type: {}", other.as_str()),
    }
}

pub struct ExecutorConfig {
    pub dry_run: bool,
    pub max_actions_per_batch: u32,
}

pub struct ActionExecutor {
    config: ExecutorConfig,
    ledger: ActionLedger,
    handlers: HashMap<ActionType, Box<dyn ActionHandler>>,
    clock: Arc<dyn Clock>,
}

impl ActionExecutor {
    pub fn new(config: ExecutorConfig, ledger: ActionLedger, clock: Arc<dyn Clock>) -> Self {
        Self { config, ledger, handlers: HashMap::new(), clock }
    }

    pub fn register_handler(&mut self, handler: Box<dyn ActionHandler>) {
        self.handlers.insert(handler.action_type(), handler);
    }

    pub fn ledger(&self) -> &ActionLedger {
        &self.ledger
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Process findings in order. The returned list is truncated when the
    /// per-batch limit stops the loop; ledger-skipped findings produce no
    /// result at all.
    pub async fn execute_actions(&mut self, findings: &[Finding]) -> Vec<ActionResult> {
        let mut results = Vec::new();
        let mut executed_this_batch: u32 = 0;

        for finding in findings {
            if executed_this_batch >= self.config.max_actions_per_batch {
                json_log(
                    Domain::Action,
                    "rate_limit",
                    obj(&[
                        ("max_actions_per_batch", serde_json::json!(self.config.max_actions_per_batch)),
                        ("remaining_findings", serde_json::json!(findings.len() - results.len())),
                    ]),
                );
                break;
            }

            let action = finding.recommended_action;
            if action == ActionType::None {
                continue;
            }

            if let Some(receipt_id) = &finding.receipt_id {
                if self.ledger.contains(receipt_id) {
                    json_log(
                        Domain::Action,
                        "ledger_skip",
                        obj(&[
                            ("receipt_id", v_str(receipt_id)),
                            ("finding_id", v_str(&finding.id)),
                        ]),
                    );
                    continue;
                }
            }

            if self.config.dry_run {
                log_action(&finding.id, action.as_str(), "dry_run", None);
                results.push(ActionResult {
                    finding_id: finding.id.clone(),
                    action,
                    success: true,
                    dry_run: true,
                    tx_hash: None,
                    error: None,
                    timestamp: crate::clock::iso_from_seconds(self.clock.now_seconds()),
                });
                continue;
            }

            let Some(handler) = self.handlers.get(&action) else {
                let message = format!("No handler for action type: {}", action.as_str());
                log_action(&finding.id, action.as_str(), "no_handler", None);
                results.push(self.failed(finding, action, &message));
                continue;
            };

            match handler.execute(finding).await {
                Ok(tx_hash) => match self.record_success(finding, action, &tx_hash) {
                    Ok(()) => {
                        executed_this_batch += 1;
                        log_action(&finding.id, action.as_str(), "success", Some(&tx_hash));
                        results.push(ActionResult {
                            finding_id: finding.id.clone(),
                            action,
                            success: true,
                            dry_run: false,
                            tx_hash: Some(tx_hash),
                            error: None,
                            timestamp: crate::clock::iso_from_seconds(self.clock.now_seconds()),
                        });
                    }
                    Err(err) => {
                        log_action(&finding.id, action.as_str(), "ledger_error", Some(&tx_hash));
                        results.push(self.failed(finding, action, &err.to_string()));
                    }
                },
                Err(err) => {
                    log_action(&finding.id, action.as_str(), "error", None);
                    results.push(self.failed(finding, action, &err.to_string()));
                }
            }
        }

        results
    }

    fn record_success(
        &mut self,
        finding: &Finding,
        action: ActionType,
        tx_hash: &str,
    ) -> Result<()> {
        let mapped = ledger_action(action)?;
        let Some(receipt_id) = &finding.receipt_id else {
            bail!("finding {} has no receipt id to ledger", finding.id);
        };
        self.ledger.record(
            receipt_id,
            mapped,
            tx_hash,
            finding.block_number,
            &finding.id,
            self.clock.as_ref(),
        )
    }

    fn failed(&self, finding: &Finding, action: ActionType, message: &str) -> ActionResult {
        ActionResult {
            finding_id: finding.id.clone(),
            action,
            success: false,
            dry_run: false,
            tx_hash: None,
            error: Some(message.to_string()),
            timestamp: crate::clock::iso_from_seconds(self.clock.now_seconds()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{FindingCategory, Severity};
    use tempfile::TempDir;

    struct FixedHandler {
        action: ActionType,
        result: std::result::Result<String, String>,
    }

    #[async_trait]
    impl ActionHandler for FixedHandler {
        fn action_type(&self) -> ActionType {
            self.action
        }

        async fn execute(&self, _finding: &Finding) -> Result<String> {
            match &self.result {
                Ok(tx) => Ok(tx.clone()),
                Err(err) => bail!("{}", err),
            }
        }

        async fn is_healthy(&self) -> bool {
            true
        }
    }

    fn finding(receipt_id: &str, action: ActionType) -> Finding {
        Finding::new(
            "RECEIPT_STALE",
            "t",
            "d",
            Severity::High,
            FindingCategory::Receipt,
            100,
            1_700_000_000_000,
            action,
        )
        .with_receipt(receipt_id)
    }

    fn executor(dir: &TempDir, dry_run: bool, max: u32) -> ActionExecutor {
        let ledger = ActionLedger::open(&dir.path().join("ledger.json")).unwrap();
        ActionExecutor::new(
            ExecutorConfig { dry_run, max_actions_per_batch: max },
            ledger,
            Arc::new(ManualClock::at_seconds(1_700_000_000)),
        )
    }

    #[tokio::test]
    async fn dry_run_synthesizes_success_without_ledger_writes() {
        let dir = TempDir::new().unwrap();
        let mut exec = executor(&dir, true, 10);
        let findings =
            vec![finding("0x1111111111111111111111111111111111111111", ActionType::OpenDispute)];
        let results = exec.execute_actions(&findings).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(results[0].dry_run);
        assert_eq!(results[0].tx_hash, None);
        assert_eq!(exec.ledger().len(), 0);
    }

    #[tokio::test]
    async fn rate_limit_truncates_batch() {
        let dir = TempDir::new().unwrap();
        let mut exec = executor(&dir, false, 2);
        exec.register_handler(Box::new(FixedHandler {
            action: ActionType::OpenDispute,
            result: Ok("0xhash".to_string()),
        }));
        let findings = vec![
            finding("0xa1", ActionType::OpenDispute),
            finding("0xa2", ActionType::OpenDispute),
            finding("0xa3", ActionType::OpenDispute),
        ];
        let results = exec.execute_actions(&findings).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(exec.ledger().len(), 2);
        assert!(exec.ledger().contains("0xa1"));
        assert!(exec.ledger().contains("0xa2"));
        assert!(!exec.ledger().contains("0xa3"));
    }

    #[tokio::test]
    async fn ledgered_receipts_are_skipped_silently() {
        let dir = TempDir::new().unwrap();
        let mut exec = executor(&dir, false, 10);
        exec.register_handler(Box::new(FixedHandler {
            action: ActionType::OpenDispute,
            result: Ok("0xhash".to_string()),
        }));
        let findings = vec![finding("0xAA", ActionType::OpenDispute)];
        assert_eq!(exec.execute_actions(&findings).await.len(), 1);
        // Same receipt again, different case: no result, no extra entry.
        let findings = vec![finding("0xaa", ActionType::OpenDispute)];
        assert_eq!(exec.execute_actions(&findings).await.len(), 0);
        assert_eq!(exec.ledger().len(), 1);
    }

    #[tokio::test]
    async fn missing_handler_fails_that_finding_only() {
        let dir = TempDir::new().unwrap();
        let mut exec = executor(&dir, false, 10);
        exec.register_handler(Box::new(FixedHandler {
            action: ActionType::OpenDispute,
            result: Ok("0xok".to_string()),
        }));
        let findings = vec![
            finding("0xa1", ActionType::SubmitEvidence),
            finding("0xa2", ActionType::OpenDispute),
        ];
        let results = exec.execute_actions(&findings).await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert_eq!(
            results[0].error.as_deref(),
            Some("No handler for action type: SUBMIT_EVIDENCE")
        );
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn handler_error_does_not_write_ledger() {
        let dir = TempDir::new().unwrap();
        let mut exec = executor(&dir, false, 10);
        exec.register_handler(Box::new(FixedHandler {
            action: ActionType::OpenDispute,
            result: Err("rpc unreachable".to_string()),
        }));
        let findings = vec![finding("0xa1", ActionType::OpenDispute)];
        let results = exec.execute_actions(&findings).await;
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some("rpc unreachable"));
        assert_eq!(exec.ledger().len(), 0);
    }

    #[tokio::test]
    async fn none_actions_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut exec = executor(&dir, false, 10);
        let findings = vec![finding("0xa1", ActionType::None)];
        assert!(exec.execute_actions(&findings).await.is_empty());
    }

    #[test]
    fn ledger_mapping_is_exhaustive() {
        assert!(ledger_action(ActionType::OpenDispute).is_ok());
        assert!(ledger_action(ActionType::SubmitEvidence).is_ok());
        assert!(ledger_action(ActionType::Notify).is_err());
        assert!(ledger_action(ActionType::Escalate).is_err());
        assert!(ledger_action(ActionType::ManualReview).is_err());
    }
}
