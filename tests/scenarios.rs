//! End-to-end scenario coverage for the pipeline:
//!   1. Stale-receipt rule fires with exact metadata
//!   2. Dry-run executor synthesizes success without ledger writes
//!   3. Rate limit truncates a live batch
//!   4. Critical signal pins risk at 100 with one alert
//!   5. Transparency tamper detection
//!   6. SSRF block without any outbound request

use std::net::IpAddr;
use std::sync::Arc;

use watchtower::clock::ManualClock;
use watchtower::executor::ledger::ActionLedger;
use watchtower::executor::{ActionExecutor, ActionHandler, ExecutorConfig};
use watchtower::fetcher::{CardFetchStatus, CardFetcher, DnsResolver, FetcherConfig};
use watchtower::model::{ActionType, Finding, FindingCategory, Severity};
use watchtower::rules::receipt_stale::ReceiptStaleRule;
use watchtower::rules::testutil::StaticContext;
use watchtower::rules::Rule;
use watchtower::scoring::{score_agent, EvidenceRef, Signal, Snapshot};
use watchtower::transparency::{verify_log_file, LeafInput, TransparencyLog};

// 2024-01-01T00:00:00Z
const NOW: u64 = 1_704_067_200;

fn finding_with_receipt(receipt_id: &str) -> Finding {
    Finding::new(
        "RECEIPT_STALE",
        "Stale receipt detected",
        "test",
        Severity::High,
        FindingCategory::Receipt,
        1_000_000,
        NOW * 1000,
        ActionType::OpenDispute,
    )
    .with_receipt(receipt_id)
}

struct FixedHashHandler;

#[async_trait::async_trait]
impl ActionHandler for FixedHashHandler {
    fn action_type(&self) -> ActionType {
        ActionType::OpenDispute
    }

    async fn execute(&self, _finding: &Finding) -> anyhow::Result<String> {
        Ok("0xhash".to_string())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn scenario_1_stale_receipt_rule_fires() {
    // deadline 2023-12-31T23:30:00Z, thirty minutes before block time
    let ctx = StaticContext::new(1_000_000, NOW).pending_receipt("0xr1", "solver-1", NOW - 1800);
    let rule = ReceiptStaleRule::new(60, Vec::new(), Vec::new());
    let findings = rule.evaluate(&ctx).await.unwrap();

    assert_eq!(findings.len(), 1);
    let f = &findings[0];
    assert_eq!(f.severity, Severity::High);
    assert_eq!(f.category, FindingCategory::Receipt);
    assert_eq!(f.recommended_action, ActionType::OpenDispute);
    assert!(f.title.starts_with("Stale receipt detected: "));
    assert_eq!(f.metadata["ageSeconds"], 1800);
    assert_eq!(f.block_number, 1_000_000);
}

#[tokio::test]
async fn scenario_2_dry_run_executor() {
    let dir = tempfile::TempDir::new().unwrap();
    let ledger = ActionLedger::open(&dir.path().join("ledger.json")).unwrap();
    let mut executor = ActionExecutor::new(
        ExecutorConfig { dry_run: true, max_actions_per_batch: 10 },
        ledger,
        Arc::new(ManualClock::at_seconds(NOW)),
    );

    let findings =
        vec![finding_with_receipt("0x1111111111111111111111111111111111111111")];
    let results = executor.execute_actions(&findings).await;

    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert!(results[0].dry_run);
    assert_eq!(results[0].tx_hash, None);
    assert_eq!(executor.ledger().len(), 0);
}

#[tokio::test]
async fn scenario_3_rate_limit_truncates_batch() {
    let dir = tempfile::TempDir::new().unwrap();
    let ledger = ActionLedger::open(&dir.path().join("ledger.json")).unwrap();
    let mut executor = ActionExecutor::new(
        ExecutorConfig { dry_run: false, max_actions_per_batch: 2 },
        ledger,
        Arc::new(ManualClock::at_seconds(NOW)),
    );
    executor.register_handler(Box::new(FixedHashHandler));

    let findings = vec![
        finding_with_receipt("0xaa01"),
        finding_with_receipt("0xaa02"),
        finding_with_receipt("0xaa03"),
    ];
    let results = executor.execute_actions(&findings).await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success && r.tx_hash.as_deref() == Some("0xhash")));
    assert_eq!(executor.ledger().len(), 2);
    assert!(!executor.ledger().contains("0xaa03"));
}

#[test]
fn scenario_4_critical_signal_pins_risk() {
    let snapshot = Snapshot::build(
        "agent-a",
        vec![
            Signal::new(
                "sig-crit",
                Severity::Critical,
                1.0,
                NOW,
                vec![EvidenceRef::new("manifest", "runs/9")],
            ),
            Signal::new("sig-high", Severity::High, 0.5, NOW, Vec::new()),
        ],
        NOW,
    );
    let outcome = score_agent("agent-a", &[snapshot], NOW);

    assert_eq!(outcome.report.overall_risk, 100);
    assert_eq!(outcome.report.confidence.as_str(), "LOW");
    assert_eq!(outcome.alerts.len(), 1);
    assert_eq!(outcome.alerts[0].alert_type, "CRITICAL_SIGNAL_DETECTED");
    assert_eq!(outcome.alerts[0].severity, Severity::Critical);
    assert!(outcome.alerts[0].is_active);
}

#[test]
fn scenario_5_transparency_tamper_detection() {
    let dir = tempfile::TempDir::new().unwrap();
    // 2025-03-15
    let clock = Arc::new(ManualClock::at_seconds(1_742_040_000));
    let log = TransparencyLog::open(&dir.path().join("key"), dir.path(), clock).unwrap();

    log.create_and_append(&LeafInput {
        agent_id: "erc8004:1:0xreg:7".to_string(),
        risk_report_hash: "cd".repeat(32),
        overall_risk: 73,
        receipt_id: None,
        run_id: None,
    })
    .unwrap();

    let path = log.leaf_file_for_date("2025-03-15");
    let raw = std::fs::read_to_string(&path).unwrap();
    let mut leaf: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
    leaf["overallRisk"] = serde_json::json!(0);
    std::fs::write(&path, format!("{}\n", leaf)).unwrap();

    let summary = verify_log_file(&path, &log.verifying_key()).unwrap();
    assert_eq!(summary.total_leaves, 1);
    assert_eq!(summary.valid_leaves, 0);
    assert_eq!(summary.invalid_leaves, 1);
    assert_eq!(summary.errors[0].error, "leafId mismatch");
}

struct PrivateDns;

impl DnsResolver for PrivateDns {
    fn resolve(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec!["192.168.1.1".parse().unwrap()])
    }
}

#[tokio::test]
async fn scenario_6_ssrf_block() {
    let fetcher = CardFetcher::new(FetcherConfig::default(), Arc::new(PrivateDns)).unwrap();
    let result = fetcher.fetch_agent_card("https://internal.example/card").await;
    assert_eq!(result.status, CardFetchStatus::SsrfBlocked);
    // no outbound request was issued
    assert!(result.http_status.is_none());
    assert!(result.card_hash.is_none());
}
