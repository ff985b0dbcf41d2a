use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::{watch, Mutex};

use watchtower::chain::cursor::BlockCursor;
use watchtower::chain::poller::{ChainWorker, ScanService, WorkerSettings};
use watchtower::chain::rpc::RpcProvider;
use watchtower::chain::ChainProvider;
use watchtower::clock::system_clock;
use watchtower::config::Config;
use watchtower::errors::WatchtowerError;
use watchtower::evidence::EvidenceStore;
use watchtower::executor::handlers::{OpenDisputeHandler, SubmitEvidenceHandler};
use watchtower::executor::ledger::ActionLedger;
use watchtower::executor::{ActionExecutor, ExecutorConfig};
use watchtower::fetcher::{CardFetcher, FetcherConfig, SystemResolver};
use watchtower::logging::{json_log, log_error, obj, v_str, Domain, Level};
use watchtower::metrics::Metrics;
use watchtower::resilience::circuit::{BreakerConfig, CircuitBreaker};
use watchtower::resilience::retry::RetryPolicy;
use watchtower::rules::delegation_payment::DelegationPaymentRule;
use watchtower::rules::receipt_stale::ReceiptStaleRule;
use watchtower::rules::sample::SampleRule;
use watchtower::rules::{RuleEngine, RuleRegistry};
use watchtower::scoring::pipeline::{IdentityPoller, ScoringService};
use watchtower::signer::build_signer;
use watchtower::storage::Store;
use watchtower::transparency::TransparencyLog;
use watchtower::webhook::WebhookNotifier;

fn build_registry(cfg: &Config, facilitator: Option<&str>) -> Result<RuleRegistry> {
    let mut registry = RuleRegistry::new();
    registry.register(Box::new(ReceiptStaleRule::new(
        cfg.min_receipt_age_seconds,
        cfg.allowlist_solver_ids.clone(),
        cfg.allowlist_receipt_ids.clone(),
    )))?;
    registry.register(Box::new(SampleRule::new()))?;
    if let Some(facilitator) = facilitator {
        registry.register(Box::new(DelegationPaymentRule::new(
            facilitator,
            cfg.delegation_scan_blocks,
            cfg.delegation_large_wei,
            cfg.delegation_max_settlements,
        )))?;
    }
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = run().await {
        log_error(Domain::System, "fatal", &err.to_string());
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let cfg = Config::from_env();
    let clock = system_clock();
    let started = Instant::now();
    let metrics = Arc::new(Metrics::new());

    json_log(
        Domain::System,
        "startup",
        obj(&[
            ("version", v_str(env!("CARGO_PKG_VERSION"))),
            ("chains", json!(cfg.chains.len())),
            ("dry_run", json!(cfg.dry_run)),
            ("signer_type", v_str(&cfg.signer_type)),
        ]),
    );

    // storage + migrations; a failure here is fatal by design
    let mut store = Store::open(Path::new(&cfg.db_path))?;
    store
        .migrate(Some(Path::new("migrations")), clock.now_seconds())
        .map_err(|e| WatchtowerError::Fatal(format!("migrations failed: {}", e)))?;
    let store = Arc::new(Mutex::new(store));

    let tlog = Arc::new(TransparencyLog::open(
        Path::new(&cfg.key_path),
        Path::new(&cfg.log_dir),
        clock.clone(),
    )?);

    let evidence = if cfg.evidence.enabled {
        Some(Arc::new(EvidenceStore::new(
            Path::new(&cfg.evidence.data_dir),
            cfg.evidence.max_file_size_bytes,
            cfg.evidence.validate_on_write,
            clock.clone(),
        )?))
    } else {
        None
    };

    let webhook = Arc::new(WebhookNotifier::new(cfg.webhook.clone(), clock.clone())?);

    let signer: Arc<dyn watchtower::signer::Signer> = Arc::from(
        build_signer(
            &cfg.signer_type,
            Path::new(&cfg.signer_key_path),
            cfg.signer_endpoint.as_deref(),
        )
        .await?,
    );
    json_log(
        Domain::System,
        "signer_ready",
        obj(&[
            ("kind", v_str(signer.kind().as_str())),
            ("address", v_str(&signer.address())),
        ]),
    );

    let ledger = ActionLedger::open(&Path::new(&cfg.state_dir).join("action-ledger.json"))?;
    let mut executor = ActionExecutor::new(
        ExecutorConfig {
            dry_run: cfg.dry_run,
            max_actions_per_batch: cfg.max_actions_per_scan,
        },
        ledger,
        clock.clone(),
    );

    let retry = RetryPolicy {
        max_retries: cfg.retry.max_retries,
        base_delay_ms: cfg.retry.base_delay_ms,
        max_delay_ms: cfg.retry.max_delay_ms,
        ..RetryPolicy::default()
    };
    let breaker_config = BreakerConfig {
        failure_threshold: cfg.breaker.failure_threshold,
        reset_timeout_ms: cfg.breaker.reset_timeout_ms,
        success_threshold: cfg.breaker.success_threshold,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    let primary_chain = cfg
        .enabled_chains()
        .next()
        .cloned()
        .context("no enabled chain configured (set RPC_URL/CHAIN_ID)")?;
    let primary_provider: Arc<dyn ChainProvider> = Arc::new(RpcProvider::new(
        primary_chain.chain_id,
        &primary_chain.rpc_url,
        cfg.tx_index_url.clone(),
        retry.clone(),
        Arc::new(Mutex::new(CircuitBreaker::new(breaker_config.clone(), clock.clone()))),
    )?);
    let primary_contracts = primary_chain.contracts.clone();
    for (name, address) in [
        ("solver_registry", &primary_contracts.solver_registry),
        ("intent_receipt_hub", &primary_contracts.intent_receipt_hub),
        ("dispute_module", &primary_contracts.dispute_module),
        ("agent_registry", &primary_contracts.agent_registry),
        ("facilitator", &primary_contracts.facilitator),
    ] {
        if let Some(address) = address {
            if !watchtower::config::is_valid_address(address) {
                return Err(WatchtowerError::Fatal(format!(
                    "{} is not a 0x-prefixed 40-hex address: {}",
                    name, address
                ))
                .into());
            }
        }
    }

    // live handlers submit through the primary chain; the executor is
    // shared so the batch limit and the ledger stay global
    if let Some(dispute_module) = &primary_contracts.dispute_module {
        executor.register_handler(Box::new(OpenDisputeHandler::new(
            Arc::clone(&primary_provider),
            Arc::clone(&signer),
            dispute_module,
        )));
        executor.register_handler(Box::new(SubmitEvidenceHandler::new(
            Arc::clone(&primary_provider),
            Arc::clone(&signer),
            dispute_module,
        )));
    }
    let executor = Arc::new(Mutex::new(executor));

    // per-chain workers
    for chain in cfg.enabled_chains() {
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(
            breaker_config.clone(),
            clock.clone(),
        )));
        let provider: Arc<dyn ChainProvider> = Arc::new(RpcProvider::new(
            chain.chain_id,
            &chain.rpc_url,
            cfg.tx_index_url.clone(),
            retry.clone(),
            breaker,
        )?);
        let registry = Arc::new(build_registry(&cfg, chain.contracts.facilitator.as_deref())?);
        let cursor = BlockCursor::open(Path::new(&cfg.state_dir), chain.chain_id)?;
        let worker = ChainWorker::new(
            chain.clone(),
            WorkerSettings {
                lookback_blocks: cfg.lookback_blocks,
                confirmations: cfg.block_confirmations,
                challenge_window_seconds: cfg.challenge_window_seconds,
                scan_interval_ms: cfg.scan_interval_ms,
            },
            provider,
            registry,
            RuleEngine::new(cfg.rule_timeout_ms),
            Arc::clone(&executor),
            evidence.clone(),
            Arc::clone(&webhook),
            Arc::clone(&metrics),
            clock.clone(),
            cursor,
        );
        tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    // identity poller + scoring over the primary chain
    let scoring = Arc::new(ScoringService {
        provider: Arc::clone(&primary_provider),
        store: Arc::clone(&store),
        tlog: Arc::clone(&tlog),
        settings: cfg.scoring.clone(),
        clock: clock.clone(),
    });
    if let Some(registry_address) = primary_contracts.agent_registry.clone() {
        let poller = IdentityPoller {
            provider: Arc::clone(&primary_provider),
            store: Arc::clone(&store),
            fetcher: Arc::new(CardFetcher::new(
                FetcherConfig::default(),
                Arc::new(SystemResolver),
            )?),
            registry_address,
            settings: cfg.scoring.clone(),
            lookback_blocks: cfg.lookback_blocks,
            confirmations: cfg.block_confirmations,
            clock: clock.clone(),
        };
        tasks.push(tokio::spawn(poller.run(shutdown_rx.clone(), cfg.scan_interval_ms)));
    }

    // optional webhook heartbeat
    if let Some(interval_ms) = webhook.heartbeat_interval_ms() {
        let webhook = Arc::clone(&webhook);
        let mut rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let interval = std::time::Duration::from_millis(interval_ms.max(1000));
            loop {
                if *rx.borrow() {
                    break;
                }
                webhook.send_heartbeat().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = rx.changed() => {}
                }
            }
        }));
    }

    // HTTP surface
    let scan = Arc::new(ScanService {
        provider: Arc::clone(&primary_provider),
        registry: Arc::new(build_registry(&cfg, primary_contracts.facilitator.as_deref())?),
        engine: RuleEngine::new(cfg.rule_timeout_ms),
        contracts: primary_contracts,
        challenge_window_seconds: cfg.challenge_window_seconds,
        confirmations: cfg.block_confirmations,
    });
    let api_state = Arc::new(watchtower::api::ApiState {
        config: cfg.clone(),
        store,
        metrics,
        tlog,
        evidence,
        scan,
        scoring,
        executor,
        clock,
        started,
    });
    let listener =
        tokio::net::TcpListener::bind((cfg.api_host.as_str(), cfg.api_port))
            .await
            .with_context(|| format!("binding {}:{}", cfg.api_host, cfg.api_port))?;
    {
        let rx = shutdown_rx.clone();
        let state = Arc::clone(&api_state);
        tasks.push(tokio::spawn(async move {
            if let Err(err) = watchtower::api::serve(state, listener, rx).await {
                log_error(Domain::Api, "server_stopped", &err.to_string());
            }
        }));
    }

    // shutdown waits for the current tick to finish
    tokio::signal::ctrl_c().await?;
    watchtower::logging::log(
        Level::Info,
        Domain::System,
        "shutdown_requested",
        obj(&[]),
    );
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    json_log(Domain::System, "shutdown_complete", obj(&[]));
    Ok(())
}
