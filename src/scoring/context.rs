//! Context signals (`CX_*`) from on-chain transaction analysis of an
//! agent's address inside a block window.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;

use crate::chain::TxRecord;
use crate::config::ScoringSettings;
use crate::logging::{obj, v_str};
use crate::model::Severity;
use crate::scoring::{EvidenceRef, Signal};

/// Current window plus the tx count of the equally sized prior window.
#[derive(Debug, Default)]
pub struct ContextWindow {
    pub current: Vec<TxRecord>,
    pub prior_count: u64,
}

fn tx_evidence(txs: &[&TxRecord]) -> Vec<EvidenceRef> {
    txs.iter().take(5).map(|t| EvidenceRef::new("tx", &t.tx_hash)).collect()
}

fn counterparty<'a>(agent: &str, tx: &'a TxRecord) -> &'a str {
    if tx.from.eq_ignore_ascii_case(agent) {
        &tx.to
    } else {
        &tx.from
    }
}

fn tag_for(address: &str, list: &[(String, String)]) -> Option<String> {
    let lower = address.to_lowercase();
    list.iter().find(|(addr, _)| *addr == lower).map(|(_, tag)| tag.clone())
}

/// Classification of the earliest inbound funder. Denylist tags supersede
/// allowlist tags and always decide; otherwise the chain decides via the
/// contract-code probe.
pub fn funding_signal(
    agent: &str,
    history: &[TxRecord],
    funder_is_contract: bool,
    cfg: &ScoringSettings,
    observed_at: u64,
) -> Option<Signal> {
    let earliest_inbound = history
        .iter()
        .filter(|tx| tx.to.eq_ignore_ascii_case(agent) && tx.value_wei > 0)
        .min_by_key(|tx| (tx.block_number, tx.tx_hash.clone()))?;
    let funder = earliest_inbound.from.to_lowercase();

    let decided_tag = tag_for(&funder, &cfg.funder_denylist)
        .or_else(|| tag_for(&funder, &cfg.funder_allowlist));
    let classification = match decided_tag.as_deref() {
        Some("contract") => Some(("CX_FUNDED_BY_CONTRACT", 0.2)),
        Some("unknown") => Some(("CX_FUNDED_BY_UNKNOWN", 0.1)),
        Some(_) => None, // tagged as known-good
        None if funder_is_contract => Some(("CX_FUNDED_BY_CONTRACT", 0.2)),
        None => Some(("CX_FUNDED_BY_UNKNOWN", 0.1)),
    };

    classification.map(|(signal_id, weight)| {
        Signal::new(
            signal_id,
            Severity::Low,
            weight,
            observed_at,
            vec![EvidenceRef::new("tx", &earliest_inbound.tx_hash)],
        )
        .with_details(obj(&[
            ("funder", v_str(&funder)),
            ("fundingBlock", json!(earliest_inbound.block_number)),
        ]))
    })
}

pub fn concentration_signal(
    agent: &str,
    window: &ContextWindow,
    cfg: &ScoringSettings,
    observed_at: u64,
) -> Option<Signal> {
    let tx_count = window.current.len() as u64;
    if tx_count < cfg.min_tx_for_concentration {
        return None;
    }
    let mut per_peer: BTreeMap<String, Vec<&TxRecord>> = BTreeMap::new();
    for tx in &window.current {
        per_peer
            .entry(counterparty(agent, tx).to_lowercase())
            .or_default()
            .push(tx);
    }
    let (peer, txs) = per_peer.iter().max_by_key(|(_, txs)| txs.len())?;
    let share = txs.len() as f64 / tx_count as f64;
    if share <= 0.8 {
        return None;
    }
    Some(
        Signal::new(
            "CX_COUNTERPARTY_CONCENTRATION_HIGH",
            Severity::Medium,
            0.4,
            observed_at,
            tx_evidence(txs),
        )
        .with_details(obj(&[
            ("topPeer", v_str(peer)),
            ("share", json!(share)),
            ("txCount", json!(tx_count)),
        ])),
    )
}

pub fn burst_signals(
    window: &ContextWindow,
    cfg: &ScoringSettings,
    observed_at: u64,
) -> Vec<Signal> {
    let mut signals = Vec::new();
    let current = window.current.len() as u64;
    if current < cfg.burst_min_tx {
        return signals;
    }
    let refs: Vec<&TxRecord> = window.current.iter().collect();

    if window.prior_count == 0 {
        let min_ts = window.current.iter().map(|t| t.timestamp).min().unwrap_or(0);
        let max_ts = window.current.iter().map(|t| t.timestamp).max().unwrap_or(0);
        if max_ts.saturating_sub(min_ts) < cfg.dormancy_threshold_seconds {
            signals.push(
                Signal::new(
                    "CX_DORMANT_THEN_BURST",
                    Severity::Medium,
                    0.4,
                    observed_at,
                    tx_evidence(&refs),
                )
                .with_details(obj(&[
                    ("burstTxCount", json!(current)),
                    ("burstSpanSeconds", json!(max_ts.saturating_sub(min_ts))),
                ])),
            );
        }
    }

    if current as f64 > window.prior_count as f64 * cfg.burst_multiplier {
        signals.push(
            Signal::new("CX_TX_BURST", Severity::Medium, 0.3, observed_at, tx_evidence(&refs))
                .with_details(obj(&[
                    ("currentWindowTxCount", json!(current)),
                    ("priorWindowTxCount", json!(window.prior_count)),
                    ("multiplier", json!(cfg.burst_multiplier)),
                ])),
        );
    }
    signals
}

/// Gated by `enable_payment_adjacency`.
pub fn micropayment_signal(
    agent: &str,
    window: &ContextWindow,
    cfg: &ScoringSettings,
    observed_at: u64,
) -> Option<Signal> {
    if !cfg.enable_payment_adjacency {
        return None;
    }
    let micro: Vec<&TxRecord> = window
        .current
        .iter()
        .filter(|tx| tx.value_wei > 0 && tx.value_wei < cfg.micropayment_max_value_wei)
        .collect();
    if (micro.len() as u64) < cfg.micropayment_min_transfers {
        return None;
    }
    let peers: BTreeSet<String> =
        micro.iter().map(|tx| counterparty(agent, tx).to_lowercase()).collect();
    if peers.len() as u64 > cfg.micropayment_max_peers {
        return None;
    }
    Some(
        Signal::new("CX_MICROPAYMENT_SPAM", Severity::Medium, 0.4, observed_at, tx_evidence(&micro))
            .with_details(obj(&[
                ("transferCount", json!(micro.len())),
                ("uniquePeers", json!(peers.len())),
                ("maxValueWei", v_str(&cfg.micropayment_max_value_wei.to_string())),
            ])),
    )
}

/// Full context pass for one agent address.
pub fn context_signals(
    agent: &str,
    history: &[TxRecord],
    window: &ContextWindow,
    funder_is_contract: bool,
    cfg: &ScoringSettings,
    observed_at: u64,
) -> Vec<Signal> {
    let mut signals = Vec::new();
    if let Some(s) = funding_signal(agent, history, funder_is_contract, cfg, observed_at) {
        signals.push(s);
    }
    if let Some(s) = concentration_signal(agent, window, cfg, observed_at) {
        signals.push(s);
    }
    signals.extend(burst_signals(window, cfg, observed_at));
    if let Some(s) = micropayment_signal(agent, window, cfg, observed_at) {
        signals.push(s);
    }
    signals
}
