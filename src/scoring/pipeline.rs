//! Pipeline orchestration: registry polling, card refresh, and the
//! signal → snapshot → report → alert → leaf flow.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::chain::{ChainProvider, EventFilter};
use crate::clock::Clock;
use crate::config::ScoringSettings;
use crate::fetcher::CardFetcher;
use crate::logging::{json_log, log_error, obj, v_str, Domain};
use crate::scoring::behavior::{behavior_signals, verify_manifest, VerificationReport};
use crate::scoring::context::{context_signals, ContextWindow};
use crate::scoring::identity::{agent_id, identity_signals};
use crate::scoring::{score_agent, ScoreOutcome, Signal, Snapshot};
use crate::storage::{IdentityEventRow, Store};
use crate::transparency::{LeafInput, TransparencyLog};

/// Parsed `erc8004:<chainId>:<registry>:<tokenId>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRef {
    pub chain_id: u64,
    pub registry: String,
    pub token_id: u64,
}

impl AgentRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            ["erc8004", chain, registry, token] => Ok(Self {
                chain_id: chain.parse().context("chain id not numeric")?,
                registry: registry.to_lowercase(),
                token_id: token.parse().context("token id not numeric")?,
            }),
            _ => bail!("agent id is not erc8004:<chainId>:<registry>:<tokenId>: {}", raw),
        }
    }

    pub fn agent_id(&self) -> String {
        agent_id(self.chain_id, &self.registry, self.token_id)
    }
}

/// Registry-event poller for one chain. Applies the configured overlap
/// when resuming so late-arriving events inside a reorg window are
/// re-scanned; duplicates die on the content-addressed event id.
pub struct IdentityPoller {
    pub provider: Arc<dyn ChainProvider>,
    pub store: Arc<Mutex<Store>>,
    pub fetcher: Arc<CardFetcher>,
    pub registry_address: String,
    pub settings: ScoringSettings,
    pub lookback_blocks: u64,
    pub confirmations: u64,
    pub clock: Arc<dyn Clock>,
}

impl IdentityPoller {
    pub async fn poll_once(&self) -> Result<usize> {
        let chain_id = self.provider.chain_id();
        let registry = self.registry_address.to_lowercase();
        let tip = self.provider.block_number().await?;
        let safe = tip.saturating_sub(self.confirmations);
        if safe == 0 {
            return Ok(0);
        }

        let cursor = {
            let store = self.store.lock().await;
            store.identity_cursor(chain_id, &registry)?
        };
        let from_block = match cursor {
            Some(cursor) => cursor
                .saturating_sub(self.settings.registry_overlap_blocks)
                .saturating_add(1)
                .max(1),
            None => safe.saturating_sub(self.lookback_blocks).max(1),
        };
        if from_block > safe {
            return Ok(0);
        }

        let events = self
            .provider
            .get_events(&EventFilter {
                address: Some(registry.clone()),
                from_block,
                to_block: safe,
                event_names: vec![
                    "AgentRegistered".to_string(),
                    "AgentUriUpdated".to_string(),
                    "AgentTransferred".to_string(),
                ],
            })
            .await?;

        let now = self.clock.now_seconds();
        let mut fresh = 0usize;
        let mut refresh: Vec<(String, String)> = Vec::new(); // (agent_id, uri)
        {
            let store = self.store.lock().await;
            for event in &events {
                let Some(token_id) = event.attributes.get("tokenId").and_then(Value::as_u64)
                else {
                    continue;
                };
                let row = IdentityEventRow {
                    event_id: event.event_id(chain_id),
                    chain_id,
                    registry_address: registry.clone(),
                    agent_token_id: token_id,
                    agent_uri: event
                        .attributes
                        .get("agentUri")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                    owner_address: event
                        .attributes
                        .get("owner")
                        .or_else(|| event.attributes.get("to"))
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                    event_type: event.name.clone(),
                    block_number: event.block_number,
                    tx_hash: event.tx_hash.clone(),
                    log_index: event.log_index,
                    discovered_at: now,
                };
                if store.insert_identity_event(&row)? {
                    fresh += 1;
                    let aid = agent_id(chain_id, &registry, token_id);
                    store.upsert_agent(&aid, now)?;
                    if let Some(uri) = &row.agent_uri {
                        refresh.push((aid, uri.clone()));
                    }
                }
            }
            store.set_identity_cursor(chain_id, &registry, safe, now)?;
        }

        for (aid, uri) in refresh {
            self.refresh_card(&aid, &uri).await?;
        }

        json_log(
            Domain::Identity,
            "registry_polled",
            obj(&[
                ("chain_id", json!(chain_id)),
                ("from_block", json!(from_block)),
                ("to_block", json!(safe)),
                ("events", json!(events.len())),
                ("fresh", json!(fresh)),
            ]),
        );
        Ok(fresh)
    }

    /// Fetch one agent card and store the observation.
    pub async fn refresh_card(&self, aid: &str, uri: &str) -> Result<()> {
        let result = self.fetcher.fetch_agent_card(uri).await;
        let fetched_at = self.clock.now_seconds();
        let snapshot_id = crate::canonical::sha256_hex(
            format!("{}:{}:{}:{}", aid, uri, result.status.as_str(), fetched_at).as_bytes(),
        );
        let store = self.store.lock().await;
        store.insert_identity_snapshot(
            &snapshot_id,
            aid,
            uri,
            result.status,
            result.card_hash.as_deref(),
            result.card_json.as_ref(),
            fetched_at,
            result.http_status,
            result.error.as_deref(),
        )?;
        json_log(
            Domain::Identity,
            "card_fetched",
            obj(&[
                ("agent_id", v_str(aid)),
                ("status", v_str(result.status.as_str())),
                ("uri", v_str(uri)),
            ]),
        );
        Ok(())
    }

    /// Poll loop companion to the chain worker.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>, interval_ms: u64) {
        let interval = std::time::Duration::from_millis(interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.poll_once().await {
                log_error(Domain::Identity, "poll_failed", &err.to_string());
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

/// Signal collection and scoring for one agent; shares storage and the
/// transparency log with the rest of the process.
pub struct ScoringService {
    pub provider: Arc<dyn ChainProvider>,
    pub store: Arc<Mutex<Store>>,
    pub tlog: Arc<TransparencyLog>,
    pub settings: ScoringSettings,
    pub clock: Arc<dyn Clock>,
}

impl ScoringService {
    /// Ingest a solver manifest: verify, snapshot the behaviour signals,
    /// re-score, and append a transparency leaf.
    pub async fn ingest_manifest(
        &self,
        raw_agent_id: &str,
        manifest_path: &std::path::Path,
        run_dir: &std::path::Path,
        expected_sha256: Option<&str>,
        receipt_id: Option<&str>,
    ) -> Result<(VerificationReport, ScoreOutcome)> {
        let aid = raw_agent_id.to_lowercase();
        let now = self.clock.now_seconds();
        let report = verify_manifest(manifest_path, run_dir, expected_sha256)?;
        let signals = behavior_signals(&report, now);
        let outcome = self
            .snapshot_and_score(&aid, signals, receipt_id, report.run_id.clone())
            .await?;
        Ok((report, outcome))
    }

    /// Identity + context signals for an erc8004 agent, then score.
    pub async fn score_registered_agent(&self, raw_agent_id: &str) -> Result<ScoreOutcome> {
        let agent_ref = AgentRef::parse(raw_agent_id)?;
        let aid = agent_ref.agent_id();
        let now = self.clock.now_seconds();
        let mut signals: Vec<Signal> = Vec::new();

        // identity
        let (earliest, observations) = {
            let store = self.store.lock().await;
            (
                store.earliest_identity_event(
                    agent_ref.chain_id,
                    &agent_ref.registry,
                    agent_ref.token_id,
                )?,
                store.card_observations(&aid, 50)?,
            )
        };
        let earliest = match earliest {
            Some((block, event_id)) => {
                let timestamp = self.provider.block_timestamp(block).await?;
                Some((timestamp, event_id))
            }
            None => None,
        };
        signals.extend(identity_signals(earliest, &observations, &self.settings, now));

        // context, against the owner address when known
        let owner = {
            let store = self.store.lock().await;
            store.latest_owner(agent_ref.chain_id, &agent_ref.registry, agent_ref.token_id)?
        };
        if let Some(owner) = owner {
            let tip = self.provider.block_number().await?;
            let window = self.settings.context_window_blocks;
            let current_from = tip.saturating_sub(window).max(1);
            let prior_from = current_from.saturating_sub(window).max(1);

            let history = self.provider.transactions(&owner, 1, tip).await?;
            let current: Vec<_> = history
                .iter()
                .filter(|t| t.block_number >= current_from)
                .cloned()
                .collect();
            let prior_count = history
                .iter()
                .filter(|t| t.block_number >= prior_from && t.block_number < current_from)
                .count() as u64;

            let funder_is_contract = match history
                .iter()
                .filter(|t| t.to.eq_ignore_ascii_case(&owner) && t.value_wei > 0)
                .min_by_key(|t| (t.block_number, t.tx_hash.clone()))
            {
                Some(earliest_inbound) => {
                    let code = self.provider.get_code(&earliest_inbound.from).await?;
                    code.len() > 2 // anything beyond "0x"
                }
                None => false,
            };

            signals.extend(context_signals(
                &owner,
                &history,
                &ContextWindow { current, prior_count },
                funder_is_contract,
                &self.settings,
                now,
            ));

            let store = self.store.lock().await;
            store.set_context_cursor(&aid, agent_ref.chain_id, tip, now)?;
        }

        self.snapshot_and_score(&aid, signals, None, None).await
    }

    /// Persist a snapshot of `signals`, score the agent over its stored
    /// snapshots, persist report and alerts, and append a signed leaf.
    pub async fn snapshot_and_score(
        &self,
        aid: &str,
        signals: Vec<Signal>,
        receipt_id: Option<&str>,
        run_id: Option<String>,
    ) -> Result<ScoreOutcome> {
        let now = self.clock.now_seconds();
        let snapshot = Snapshot::build(aid, signals, now);

        let outcome = {
            let store = self.store.lock().await;
            store.upsert_agent(aid, now)?;
            store.insert_snapshot(&snapshot)?;
            let snapshots = store.snapshots_for_agent(aid, 20)?;
            let outcome = score_agent(aid, &snapshots, now);
            store.insert_risk_report(&outcome.report)?;
            for alert in &outcome.alerts {
                store.insert_alert(alert)?;
            }
            outcome
        };

        let leaf = self.tlog.create_and_append(&LeafInput {
            agent_id: aid.to_string(),
            risk_report_hash: outcome.report.report_id.clone(),
            overall_risk: outcome.report.overall_risk,
            receipt_id: receipt_id.map(|s| s.to_lowercase()),
            run_id,
        })?;

        json_log(
            Domain::Scoring,
            "agent_scored",
            obj(&[
                ("agent_id", v_str(aid)),
                ("overall_risk", json!(outcome.report.overall_risk)),
                ("confidence", v_str(outcome.report.confidence.as_str())),
                ("alerts", json!(outcome.alerts.len())),
                ("leaf_id", v_str(&leaf.leaf_id)),
            ]),
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainEvent, TxRecord};
    use crate::clock::ManualClock;
    use crate::fetcher::{DnsResolver, FetcherConfig};
    use crate::model::Severity;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use tempfile::TempDir;

    const NOW: u64 = 1_704_067_200;

    struct RegistryProvider {
        events: Vec<ChainEvent>,
        txs: Vec<TxRecord>,
    }

    #[async_trait]
    impl ChainProvider for RegistryProvider {
        fn chain_id(&self) -> u64 {
            1
        }

        async fn block_number(&self) -> Result<u64> {
            Ok(10_000)
        }

        async fn block_timestamp(&self, _block: u64) -> Result<u64> {
            Ok(NOW - 3600) // registered an hour ago: newborn
        }

        async fn get_events(&self, filter: &EventFilter) -> Result<Vec<ChainEvent>> {
            Ok(self
                .events
                .iter()
                .filter(|e| {
                    e.block_number >= filter.from_block && e.block_number <= filter.to_block
                })
                .cloned()
                .collect())
        }

        async fn call(&self, _to: &str, _data: &str) -> Result<String> {
            Ok("0x".to_string())
        }

        async fn send_raw_transaction(&self, _raw: &str) -> Result<String> {
            Ok("0x0".to_string())
        }

        async fn transaction_count(&self, _address: &str) -> Result<u64> {
            Ok(0)
        }

        async fn gas_price(&self) -> Result<u128> {
            Ok(0)
        }

        async fn get_code(&self, _address: &str) -> Result<String> {
            Ok("0x6001".to_string()) // funder is a contract
        }

        async fn transactions(&self, _a: &str, _f: u64, _t: u64) -> Result<Vec<TxRecord>> {
            Ok(self.txs.clone())
        }
    }

    struct NoDns;

    impl DnsResolver for NoDns {
        fn resolve(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "dns disabled in tests"))
        }
    }

    fn registered_event(token: u64, block: u64) -> ChainEvent {
        let mut attributes = serde_json::Map::new();
        attributes.insert("tokenId".to_string(), json!(token));
        attributes.insert("owner".to_string(), json!("0xowner1"));
        // no agentUri: keeps the poller away from card fetching in tests
        ChainEvent {
            name: "AgentRegistered".to_string(),
            address: "0xregistry".to_string(),
            block_number: block,
            tx_hash: format!("0xtx{}", block),
            log_index: 0,
            attributes,
        }
    }

    fn service(dir: &TempDir, provider: Arc<dyn ChainProvider>) -> (ScoringService, Arc<Mutex<Store>>) {
        let clock = Arc::new(ManualClock::at_seconds(NOW));
        let mut store = Store::open_in_memory().unwrap();
        store.migrate(None, NOW).unwrap();
        let store = Arc::new(Mutex::new(store));
        let tlog = Arc::new(
            TransparencyLog::open(
                &dir.path().join("tlog.key"),
                &dir.path().join("leaves"),
                clock.clone(),
            )
            .unwrap(),
        );
        let service = ScoringService {
            provider,
            store: Arc::clone(&store),
            tlog,
            settings: ScoringSettings {
                newborn_age_seconds: 14 * 86_400,
                churn_window_seconds: 7 * 86_400,
                churn_threshold: 3,
                registry_overlap_blocks: 50,
                min_tx_for_concentration: 10,
                burst_min_tx: 20,
                burst_multiplier: 3.0,
                dormancy_threshold_seconds: 30 * 86_400,
                enable_payment_adjacency: false,
                micropayment_min_transfers: 50,
                micropayment_max_value_wei: 1,
                micropayment_max_peers: 3,
                context_window_blocks: 1000,
                funder_allowlist: Vec::new(),
                funder_denylist: Vec::new(),
            },
            clock,
        };
        (service, store)
    }

    #[test]
    fn agent_ref_parsing() {
        let parsed = AgentRef::parse("erc8004:8453:0xREG:42").unwrap();
        assert_eq!(parsed.chain_id, 8453);
        assert_eq!(parsed.registry, "0xreg");
        assert_eq!(parsed.token_id, 42);
        assert_eq!(parsed.agent_id(), "erc8004:8453:0xreg:42");
        assert!(AgentRef::parse("not-an-agent").is_err());
        assert!(AgentRef::parse("erc8004:x:0xreg:1").is_err());
    }

    #[tokio::test]
    async fn identity_poller_dedupes_overlap() {
        let dir = TempDir::new().unwrap();
        let provider: Arc<dyn ChainProvider> = Arc::new(RegistryProvider {
            events: vec![registered_event(7, 9000), registered_event(8, 9100)],
            txs: Vec::new(),
        });
        let (_, store) = service(&dir, Arc::clone(&provider));
        let clock = Arc::new(ManualClock::at_seconds(NOW));
        let poller = IdentityPoller {
            provider,
            store: Arc::clone(&store),
            fetcher: Arc::new(
                CardFetcher::new(FetcherConfig::default(), Arc::new(NoDns)).unwrap(),
            ),
            registry_address: "0xREGISTRY".to_string(),
            settings: ScoringSettings {
                newborn_age_seconds: 0,
                churn_window_seconds: 0,
                churn_threshold: 99,
                registry_overlap_blocks: 50,
                min_tx_for_concentration: 10,
                burst_min_tx: 999,
                burst_multiplier: 3.0,
                dormancy_threshold_seconds: 0,
                enable_payment_adjacency: false,
                micropayment_min_transfers: 999,
                micropayment_max_value_wei: 1,
                micropayment_max_peers: 1,
                context_window_blocks: 1000,
                funder_allowlist: Vec::new(),
                funder_denylist: Vec::new(),
            },
            lookback_blocks: 5000,
            confirmations: 6,
            clock,
        };

        assert_eq!(poller.poll_once().await.unwrap(), 2);
        // overlap re-scan sees the same events; content addressing wins
        assert_eq!(poller.poll_once().await.unwrap(), 0);

        let store = store.lock().await;
        assert_eq!(store.identity_cursor(1, "0xregistry").unwrap(), Some(9994));
        assert!(store.get_agent("erc8004:1:0xregistry:7").unwrap().is_some());
        assert!(store.get_agent("erc8004:1:0xregistry:8").unwrap().is_some());
    }

    #[tokio::test]
    async fn score_registered_agent_emits_newborn_and_funding() {
        let dir = TempDir::new().unwrap();
        let txs = vec![TxRecord {
            tx_hash: "0xfund".to_string(),
            from: "0xfunder".to_string(),
            to: "0xowner1".to_string(),
            value_wei: 10u128.pow(18),
            block_number: 9500,
            timestamp: NOW - 1800,
        }];
        let provider: Arc<dyn ChainProvider> =
            Arc::new(RegistryProvider { events: vec![registered_event(7, 9000)], txs });
        let (svc, store) = service(&dir, Arc::clone(&provider));

        // seed the registry event the poller would have written
        {
            let s = store.lock().await;
            s.insert_identity_event(&IdentityEventRow {
                event_id: "ev-1".to_string(),
                chain_id: 1,
                registry_address: "0xregistry".to_string(),
                agent_token_id: 7,
                agent_uri: None,
                owner_address: Some("0xowner1".to_string()),
                event_type: "AgentRegistered".to_string(),
                block_number: 9000,
                tx_hash: "0xtx9000".to_string(),
                log_index: 0,
                discovered_at: NOW,
            })
            .unwrap();
        }

        let outcome = svc.score_registered_agent("erc8004:1:0xregistry:7").await.unwrap();
        let ids: Vec<&str> =
            outcome.report.signals.iter().map(|s| s.signal_id.as_str()).collect();
        assert!(ids.contains(&"ID_NEWBORN"));
        assert!(ids.contains(&"CX_FUNDED_BY_CONTRACT"));
        assert!(outcome.report.overall_risk > 0);

        // report and leaf persisted
        let s = store.lock().await;
        let latest = s.latest_risk_report("erc8004:1:0xregistry:7").unwrap().unwrap();
        assert_eq!(latest.report_id, outcome.report.report_id);
        assert_eq!(s.context_cursor("erc8004:1:0xregistry:7", 1).unwrap(), Some(10_000));
    }

    #[tokio::test]
    async fn manifest_ingest_scores_critical() {
        let dir = TempDir::new().unwrap();
        let provider: Arc<dyn ChainProvider> =
            Arc::new(RegistryProvider { events: Vec::new(), txs: Vec::new() });
        let (svc, store) = service(&dir, provider);

        // manifest declaring an artifact that does not exist
        let manifest = json!({
            "manifestVersion": "0.1.0",
            "runId": "run-9",
            "artifacts": [
                { "path": "out/missing.bin", "sha256": "00".repeat(32), "sizeBytes": 10 }
            ],
        });
        let manifest_path = dir.path().join("manifest.json");
        std::fs::write(&manifest_path, serde_json::to_vec(&manifest).unwrap()).unwrap();

        let (report, outcome) = svc
            .ingest_manifest("agent-x", &manifest_path, dir.path(), None, Some("0xRCPT"))
            .await
            .unwrap();
        assert!(!report.ok);
        assert_eq!(outcome.report.overall_risk, 100);
        assert_eq!(outcome.alerts.len(), 1);
        assert!(outcome
            .report
            .signals
            .iter()
            .any(|s| s.signal_id == "BE_ARTIFACT_MISSING" && s.severity == Severity::Critical));

        // a second identical ingest reuses the snapshot id
        let (_, second) = svc
            .ingest_manifest("agent-x", &manifest_path, dir.path(), None, Some("0xrcpt"))
            .await
            .unwrap();
        assert_eq!(second.snapshot_ids.len(), 1);
        let s = store.lock().await;
        assert_eq!(s.snapshots_for_agent("agent-x", 10).unwrap().len(), 1);
    }
}
