//! Environment-driven configuration.
//!
//! One `Config` per process; chain entries come either from the single
//! `RPC_URL`/`CHAIN_ID` pair or from the `CHAINS_CONFIG` JSON array in
//! multi-chain mode.

use serde::{Deserialize, Serialize};

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_csv(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Contract addresses for one watched chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSet {
    #[serde(default)]
    pub solver_registry: Option<String>,
    #[serde(default)]
    pub intent_receipt_hub: Option<String>,
    #[serde(default)]
    pub dispute_module: Option<String>,
    #[serde(default)]
    pub agent_registry: Option<String>,
    #[serde(default)]
    pub facilitator: Option<String>,
}

/// One chain endpoint; `CHAINS_CONFIG` entries deserialize into this.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEntry {
    pub name: String,
    pub rpc_url: String,
    pub chain_id: u64,
    #[serde(default)]
    pub contracts: ContractSet,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct EvidenceSettings {
    pub enabled: bool,
    pub data_dir: String,
    pub max_file_size_bytes: u64,
    pub validate_on_write: bool,
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub enabled: bool,
    pub url: String,
    pub secret: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub send_heartbeat: bool,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ScoringSettings {
    pub newborn_age_seconds: u64,
    pub churn_window_seconds: u64,
    pub churn_threshold: u32,
    pub registry_overlap_blocks: u64,
    pub min_tx_for_concentration: u64,
    pub burst_min_tx: u64,
    pub burst_multiplier: f64,
    pub dormancy_threshold_seconds: u64,
    pub enable_payment_adjacency: bool,
    pub micropayment_min_transfers: u64,
    pub micropayment_max_value_wei: u128,
    pub micropayment_max_peers: u64,
    pub context_window_blocks: u64,
    /// address → tag, consulted for the funding classification.
    pub funder_allowlist: Vec<(String, String)>,
    pub funder_denylist: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub chains: Vec<ChainEntry>,
    pub signer_type: String,
    pub signer_endpoint: Option<String>,
    pub signer_key_path: String,
    pub scan_interval_ms: u64,
    pub lookback_blocks: u64,
    pub block_confirmations: u64,
    pub challenge_window_seconds: u64,
    pub min_receipt_age_seconds: u64,
    pub max_actions_per_scan: u32,
    pub dry_run: bool,
    pub allowlist_solver_ids: Vec<String>,
    pub allowlist_receipt_ids: Vec<String>,
    pub state_dir: String,
    pub tx_index_url: Option<String>,
    pub delegation_scan_blocks: u64,
    pub delegation_large_wei: u128,
    pub delegation_max_settlements: u64,
    pub rule_timeout_ms: u64,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub evidence: EvidenceSettings,
    pub webhook: WebhookSettings,
    pub scoring: ScoringSettings,
    pub db_path: String,
    pub key_path: String,
    pub log_dir: String,
    pub api_key: Option<String>,
    pub api_port: u16,
    pub api_host: String,
}

impl Config {
    pub fn from_env() -> Self {
        let chains = load_chains();

        // LOOKBACK_BLOCKS and SCAN_LOOKBACK_BLOCKS are aliases
        let lookback = std::env::var("LOOKBACK_BLOCKS")
            .or_else(|_| std::env::var("SCAN_LOOKBACK_BLOCKS"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000u64)
            .max(1);

        let tag_list = |name: &str| -> Vec<(String, String)> {
            // "0xaddr:tag,0xaddr2:tag2"
            env_csv(name)
                .into_iter()
                .filter_map(|entry| {
                    entry
                        .split_once(':')
                        .map(|(a, t)| (a.trim().to_lowercase(), t.trim().to_lowercase()))
                })
                .collect()
        };

        Self {
            chains,
            signer_type: std::env::var("SIGNER_TYPE").unwrap_or_else(|_| "local".to_string()),
            signer_endpoint: std::env::var("SIGNER_ENDPOINT").ok(),
            signer_key_path: std::env::var("SIGNER_KEY_PATH")
                .unwrap_or_else(|_| ".state/signer.key".to_string()),
            scan_interval_ms: env_u64("SCAN_INTERVAL_MS", 60_000).max(1000),
            lookback_blocks: lookback,
            block_confirmations: env_u64("BLOCK_CONFIRMATIONS", 6),
            challenge_window_seconds: env_u64("CHALLENGE_WINDOW_SECONDS", 3600),
            min_receipt_age_seconds: env_u64("MIN_RECEIPT_AGE_SECONDS", 60),
            max_actions_per_scan: env_u32("MAX_ACTIONS_PER_SCAN", 3).min(100),
            dry_run: env_bool("DRY_RUN", true),
            allowlist_solver_ids: env_csv("ACTION_ALLOWLIST_SOLVER_IDS"),
            allowlist_receipt_ids: env_csv("ACTION_ALLOWLIST_RECEIPT_IDS"),
            state_dir: std::env::var("STATE_DIR").unwrap_or_else(|_| ".state".to_string()),
            tx_index_url: std::env::var("TX_INDEX_URL").ok(),
            delegation_scan_blocks: env_u64("DELEGATION_SCAN_BLOCKS", 5000),
            delegation_large_wei: std::env::var("DELEGATION_LARGE_WEI")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000_000_000_000_000u128),
            delegation_max_settlements: env_u64("DELEGATION_MAX_SETTLEMENTS", 10),
            rule_timeout_ms: env_u64("RULE_TIMEOUT_MS", 30_000),
            retry: RetrySettings {
                max_retries: env_u32("RPC_MAX_RETRIES", 3).min(10),
                base_delay_ms: env_u64("RPC_RETRY_BASE_DELAY_MS", 500),
                max_delay_ms: env_u64("RPC_RETRY_MAX_DELAY_MS", 10_000),
            },
            breaker: BreakerSettings {
                failure_threshold: env_u32("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5),
                reset_timeout_ms: env_u64("CIRCUIT_BREAKER_RESET_TIMEOUT_MS", 30_000),
                success_threshold: env_u32("CIRCUIT_BREAKER_SUCCESS_THRESHOLD", 2),
            },
            evidence: EvidenceSettings {
                enabled: env_bool("EVIDENCE_ENABLED", true),
                data_dir: std::env::var("EVIDENCE_DATA_DIR")
                    .unwrap_or_else(|_| ".state/evidence".to_string()),
                max_file_size_bytes: env_u64("EVIDENCE_MAX_FILE_SIZE_BYTES", 10 * 1024 * 1024),
                validate_on_write: env_bool("EVIDENCE_VALIDATE_ON_WRITE", true),
            },
            webhook: WebhookSettings {
                enabled: env_bool("WEBHOOK_ENABLED", false),
                url: std::env::var("WEBHOOK_URL").unwrap_or_default(),
                secret: std::env::var("WEBHOOK_SECRET").unwrap_or_default(),
                timeout_ms: env_u64("WEBHOOK_TIMEOUT_MS", 5000),
                max_retries: env_u32("WEBHOOK_MAX_RETRIES", 3),
                retry_delay_ms: env_u64("WEBHOOK_RETRY_DELAY_MS", 1000),
                send_heartbeat: env_bool("WEBHOOK_SEND_HEARTBEAT", false),
                heartbeat_interval_ms: env_u64("WEBHOOK_HEARTBEAT_INTERVAL_MS", 60_000),
            },
            scoring: ScoringSettings {
                newborn_age_seconds: env_u64("NEWBORN_AGE_SECONDS", 14 * 86_400),
                churn_window_seconds: env_u64("CARD_CHURN_WINDOW_SECONDS", 7 * 86_400),
                churn_threshold: env_u32("CARD_CHURN_THRESHOLD", 3),
                registry_overlap_blocks: env_u64("REGISTRY_OVERLAP_BLOCKS", 50),
                min_tx_for_concentration: env_u64("MIN_TX_FOR_CONCENTRATION", 10).max(10),
                burst_min_tx: env_u64("BURST_MIN_TX", 20),
                burst_multiplier: env_f64("BURST_MULTIPLIER", 3.0),
                dormancy_threshold_seconds: env_u64("DORMANCY_THRESHOLD_SECONDS", 30 * 86_400),
                enable_payment_adjacency: env_bool("ENABLE_PAYMENT_ADJACENCY", false),
                micropayment_min_transfers: env_u64("MICROPAYMENT_MIN_TRANSFERS", 50),
                micropayment_max_value_wei: std::env::var("MICROPAYMENT_MAX_VALUE_WEI")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10_000_000_000_000u128),
                micropayment_max_peers: env_u64("MICROPAYMENT_MAX_PEERS", 3),
                context_window_blocks: env_u64("CONTEXT_WINDOW_BLOCKS", 50_000),
                funder_allowlist: tag_list("FUNDER_ALLOWLIST"),
                funder_denylist: tag_list("FUNDER_DENYLIST"),
            },
            db_path: std::env::var("WATCHTOWER_DB_PATH")
                .unwrap_or_else(|_| ".state/watchtower.sqlite".to_string()),
            key_path: std::env::var("WATCHTOWER_KEY_PATH")
                .unwrap_or_else(|_| ".state/transparency.key".to_string()),
            log_dir: std::env::var("WATCHTOWER_LOG_DIR")
                .unwrap_or_else(|_| ".state/transparency".to_string()),
            api_key: std::env::var("WATCHTOWER_API_KEY").ok(),
            api_port: std::env::var("WATCHTOWER_API_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8787),
            api_host: std::env::var("WATCHTOWER_API_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
        }
    }

    pub fn enabled_chains(&self) -> impl Iterator<Item = &ChainEntry> {
        self.chains.iter().filter(|c| c.enabled)
    }
}

fn load_chains() -> Vec<ChainEntry> {
    if let Ok(raw) = std::env::var("CHAINS_CONFIG") {
        match serde_json::from_str::<Vec<ChainEntry>>(&raw) {
            Ok(entries) if !entries.is_empty() => return entries,
            Ok(_) => {}
            Err(err) => {
                eprintln!("[config] CHAINS_CONFIG invalid, falling back to RPC_URL: {}", err);
            }
        }
    }
    let rpc_url = std::env::var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string());
    let chain_id = env_u64("CHAIN_ID", 31_337);
    vec![ChainEntry {
        name: std::env::var("CHAIN_NAME").unwrap_or_else(|_| "primary".to_string()),
        rpc_url,
        chain_id,
        contracts: ContractSet {
            solver_registry: std::env::var("SOLVER_REGISTRY_ADDRESS").ok(),
            intent_receipt_hub: std::env::var("INTENT_RECEIPT_HUB_ADDRESS").ok(),
            dispute_module: std::env::var("DISPUTE_MODULE_ADDRESS").ok(),
            agent_registry: std::env::var("AGENT_REGISTRY_ADDRESS").ok(),
            facilitator: std::env::var("FACILITATOR_ADDRESS").ok(),
        },
        enabled: true,
    }]
}

/// `0x` + 40 hex characters.
pub fn is_valid_address(addr: &str) -> bool {
    addr.len() == 42
        && addr.starts_with("0x")
        && addr[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_config_parses_entries() {
        let raw = r#"[{"name":"base","rpcUrl":"https://base.example","chainId":8453,
            "contracts":{"intentReceiptHub":"0x1111111111111111111111111111111111111111"}}]"#;
        let entries: Vec<ChainEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].chain_id, 8453);
        assert!(entries[0].enabled);
        assert_eq!(
            entries[0].contracts.intent_receipt_hub.as_deref(),
            Some("0x1111111111111111111111111111111111111111")
        );
    }

    #[test]
    fn address_validation() {
        assert!(is_valid_address("0x1111111111111111111111111111111111111111"));
        assert!(!is_valid_address("0x1111"));
        assert!(!is_valid_address("1111111111111111111111111111111111111111ab"));
        assert!(!is_valid_address("0xzzzz111111111111111111111111111111111111"));
    }
}
