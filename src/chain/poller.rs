//! Per-chain worker: one logical task advancing in ticks.
//!
//! Tick order is fixed: scan range → rule evaluation → executor →
//! evidence → webhooks → cursor advance. The cursor only moves after a
//! tick completes, so a mid-tick crash re-executes the tick and the
//! action ledger absorbs the replay.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::sync::{watch, Mutex};

use super::context::LiveChainContext;
use super::cursor::BlockCursor;
use super::ChainProvider;
use crate::clock::Clock;
use crate::config::ChainEntry;
use crate::evidence::{ActionResultRecord, EvidenceStore, FindingRecord};
use crate::executor::ActionExecutor;
use crate::logging::{json_log, log_error, log_tick, obj, v_str, Domain, ProfileScope};
use crate::metrics::Metrics;
use crate::model::Finding;
use crate::rules::{EngineReport, ExecuteOptions, RuleEngine, RuleRegistry};
use crate::webhook::WebhookNotifier;

#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing safe to scan yet.
    Skipped,
    Completed { start_block: u64, end_block: u64, findings: usize, actions: usize },
}

pub struct WorkerSettings {
    pub lookback_blocks: u64,
    pub confirmations: u64,
    pub challenge_window_seconds: u64,
    pub scan_interval_ms: u64,
}

pub struct ChainWorker {
    chain: ChainEntry,
    settings: WorkerSettings,
    provider: Arc<dyn ChainProvider>,
    registry: Arc<RuleRegistry>,
    engine: RuleEngine,
    executor: Arc<Mutex<ActionExecutor>>,
    evidence: Option<Arc<EvidenceStore>>,
    webhook: Arc<WebhookNotifier>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    cursor: BlockCursor,
}

impl ChainWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: ChainEntry,
        settings: WorkerSettings,
        provider: Arc<dyn ChainProvider>,
        registry: Arc<RuleRegistry>,
        engine: RuleEngine,
        executor: Arc<Mutex<ActionExecutor>>,
        evidence: Option<Arc<EvidenceStore>>,
        webhook: Arc<WebhookNotifier>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        cursor: BlockCursor,
    ) -> Self {
        Self {
            chain,
            settings,
            provider,
            registry,
            engine,
            executor,
            evidence,
            webhook,
            metrics,
            clock,
            cursor,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id
    }

    /// One tick. Findings from this tick are fully processed before the
    /// cursor advances.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let chain_id = self.chain.chain_id;
        let _prof = ProfileScope::with_context("tick", &[("chain_id", json!(chain_id))]);
        self.metrics.active_scans(chain_id, 1);
        let result = self.tick_inner().await;
        self.metrics.active_scans(chain_id, 0);
        if let Err(err) = &result {
            self.metrics.error("tick", chain_id);
            log_error(Domain::Chain, "tick_failed", &err.to_string());
        }
        result
    }

    async fn tick_inner(&mut self) -> Result<TickOutcome> {
        let chain_id = self.chain.chain_id;
        let tip = self.provider.block_number().await?;
        let Some((start_block, end_block)) = self.cursor.scan_range(
            tip,
            self.settings.lookback_blocks,
            self.settings.confirmations,
        ) else {
            json_log(
                Domain::Chain,
                "tick_skipped",
                obj(&[("chain_id", json!(chain_id)), ("tip", json!(tip))]),
            );
            return Ok(TickOutcome::Skipped);
        };

        let ctx = LiveChainContext::pin(
            Arc::clone(&self.provider),
            self.chain.contracts.clone(),
            self.settings.challenge_window_seconds,
            end_block,
        )
        .await?;

        let report = self
            .engine
            .execute(&self.registry, &ctx, &ExecuteOptions::default())
            .await;
        for result in &report.results {
            if result.error.is_some() {
                self.metrics.error("rule", chain_id);
            }
        }

        // findings reach the executor in rule emission order
        let findings: Vec<Finding> = report
            .results
            .iter()
            .flat_map(|r| r.findings.iter().cloned())
            .collect();
        for finding in &findings {
            self.metrics.alert(&finding.rule_id, finding.severity.as_str(), chain_id);
            self.persist_finding(finding);
            self.webhook
                .send_event(
                    "finding.created",
                    json!({ "chainId": chain_id, "finding": finding }),
                )
                .await;
        }

        let results = {
            let mut executor = self.executor.lock().await;
            executor.execute_actions(&findings).await
        };
        for result in &results {
            let status = if result.success { "success" } else { "failure" };
            self.metrics.action(result.action.as_str(), status, chain_id);
            self.persist_action(result, &findings);
            self.webhook
                .send_event("action.executed", json!({ "chainId": chain_id, "result": result }))
                .await;
        }

        self.cursor.update(end_block, self.clock.as_ref())?;
        self.metrics.tick(chain_id);
        self.metrics.last_block(chain_id, end_block);
        log_tick(chain_id, start_block, end_block, findings.len());

        Ok(TickOutcome::Completed {
            start_block,
            end_block,
            findings: findings.len(),
            actions: results.len(),
        })
    }

    /// Evidence failures are recorded, never propagated into the tick.
    fn persist_finding(&self, finding: &Finding) {
        let Some(evidence) = &self.evidence else { return };
        let record = FindingRecord { chain_id: self.chain.chain_id, finding: finding.clone() };
        if let Err(err) = evidence.append_finding(&record) {
            self.metrics.error("evidence_write", self.chain.chain_id);
            log_error(Domain::Evidence, "finding_write_failed", &err.to_string());
        }
    }

    fn persist_action(&self, result: &crate::model::ActionResult, findings: &[Finding]) {
        let Some(evidence) = &self.evidence else { return };
        let receipt_id = findings
            .iter()
            .find(|f| f.id == result.finding_id)
            .and_then(|f| f.receipt_id.clone());
        let record = ActionResultRecord {
            chain_id: self.chain.chain_id,
            receipt_id,
            result: result.clone(),
        };
        if let Err(err) = evidence.append_action(&record) {
            self.metrics.error("evidence_write", self.chain.chain_id);
            log_error(Domain::Evidence, "action_write_failed", &err.to_string());
        }
    }

    /// Tick loop. Shutdown waits for the in-flight tick to finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = std::time::Duration::from_millis(self.settings.scan_interval_ms);
        json_log(
            Domain::Chain,
            "worker_started",
            obj(&[
                ("chain_id", json!(self.chain.chain_id)),
                ("name", v_str(&self.chain.name)),
                ("interval_ms", json!(self.settings.scan_interval_ms)),
            ]),
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let _ = self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        json_log(
            Domain::Chain,
            "worker_stopped",
            obj(&[("chain_id", json!(self.chain.chain_id))]),
        );
    }
}

/// On-demand scan shared with the HTTP surface: evaluates rules at the
/// safe head without touching the cursor or the executor.
pub struct ScanService {
    pub provider: Arc<dyn ChainProvider>,
    pub registry: Arc<RuleRegistry>,
    pub engine: RuleEngine,
    pub contracts: crate::config::ContractSet,
    pub challenge_window_seconds: u64,
    pub confirmations: u64,
}

impl ScanService {
    pub async fn scan(&self, rule_ids: Option<Vec<String>>) -> Result<EngineReport> {
        let tip = self.provider.block_number().await?;
        let safe = tip.saturating_sub(self.confirmations).max(1);
        let ctx = LiveChainContext::pin(
            Arc::clone(&self.provider),
            self.contracts.clone(),
            self.challenge_window_seconds,
            safe,
        )
        .await?;
        let options = ExecuteOptions { rule_ids, ..Default::default() };
        Ok(self.engine.execute(&self.registry, &ctx, &options).await)
    }
}
