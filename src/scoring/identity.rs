//! Identity signals (`ID_*`) from the agent registry and card fetches.

use serde_json::json;

use crate::config::ScoringSettings;
use crate::fetcher::CardFetchStatus;
use crate::logging::{obj, v_str};
use crate::model::Severity;
use crate::scoring::{EvidenceRef, Signal};

/// One stored card-fetch observation, newest first when listed.
#[derive(Debug, Clone)]
pub struct CardObservation {
    pub snapshot_id: String,
    pub fetch_status: CardFetchStatus,
    pub card_hash: Option<String>,
    pub fetched_at: u64,
}

/// Agent id in the ERC-8004 convention.
pub fn agent_id(chain_id: u64, registry: &str, token_id: u64) -> String {
    format!("erc8004:{}:{}:{}", chain_id, registry.to_lowercase(), token_id)
}

/// ID_NEWBORN when the earliest registry event is younger than the
/// configured age.
pub fn newborn_signal(
    earliest_event_timestamp: u64,
    earliest_event_ref: &str,
    cfg: &ScoringSettings,
    now: u64,
) -> Option<Signal> {
    let age = now.saturating_sub(earliest_event_timestamp);
    if age >= cfg.newborn_age_seconds {
        return None;
    }
    Some(
        Signal::new(
            "ID_NEWBORN",
            Severity::Medium,
            0.3,
            now,
            vec![EvidenceRef::new("event", earliest_event_ref)],
        )
        .with_details(obj(&[
            ("ageSeconds", json!(age)),
            ("thresholdSeconds", json!(cfg.newborn_age_seconds)),
        ])),
    )
}

/// Card reachability from the latest observation. Schema-invalid is its
/// own signal; every other non-OK outcome is unreachability.
pub fn card_status_signal(latest: &CardObservation, now: u64) -> Option<Signal> {
    let (signal_id, detail) = match latest.fetch_status {
        CardFetchStatus::Ok => return None,
        CardFetchStatus::InvalidSchema => ("ID_CARD_SCHEMA_INVALID", "card failed schema validation"),
        CardFetchStatus::Unreachable => ("ID_CARD_UNREACHABLE", "card endpoint unreachable"),
        CardFetchStatus::Timeout => ("ID_CARD_UNREACHABLE", "card fetch timed out"),
        CardFetchStatus::SsrfBlocked => ("ID_CARD_UNREACHABLE", "card url blocked by ssrf policy"),
    };
    Some(
        Signal::new(
            signal_id,
            Severity::High,
            0.8,
            now,
            vec![EvidenceRef::new("snapshot", &latest.snapshot_id)],
        )
        .with_details(obj(&[
            ("fetchStatus", v_str(latest.fetch_status.as_str())),
            ("detail", v_str(detail)),
        ])),
    )
}

/// ID_CARD_CHURN when the agent has rotated through at least
/// `churn_threshold` distinct card hashes inside the churn window.
pub fn churn_signal(
    observations: &[CardObservation],
    cfg: &ScoringSettings,
    now: u64,
) -> Option<Signal> {
    let window_start = now.saturating_sub(cfg.churn_window_seconds);
    let mut hashes: Vec<&str> = observations
        .iter()
        .filter(|o| o.fetched_at >= window_start)
        .filter_map(|o| o.card_hash.as_deref())
        .collect();
    hashes.sort_unstable();
    hashes.dedup();
    if (hashes.len() as u32) < cfg.churn_threshold {
        return None;
    }
    let evidence: Vec<EvidenceRef> = observations
        .iter()
        .filter(|o| o.fetched_at >= window_start && o.card_hash.is_some())
        .take(5)
        .map(|o| EvidenceRef::new("snapshot", &o.snapshot_id))
        .collect();
    Some(
        Signal::new("ID_CARD_CHURN", Severity::Medium, 0.5, now, evidence).with_details(obj(&[
            ("distinctHashes", json!(hashes.len())),
            ("windowSeconds", json!(cfg.churn_window_seconds)),
        ])),
    )
}

/// Full identity pass for one agent.
pub fn identity_signals(
    earliest_event: Option<(u64, String)>,
    observations: &[CardObservation],
    cfg: &ScoringSettings,
    now: u64,
) -> Vec<Signal> {
    let mut signals = Vec::new();
    if let Some((timestamp, event_ref)) = earliest_event {
        if let Some(s) = newborn_signal(timestamp, &event_ref, cfg, now) {
            signals.push(s);
        }
    }
    if let Some(latest) = observations.iter().max_by_key(|o| o.fetched_at) {
        if let Some(s) = card_status_signal(latest, now) {
            signals.push(s);
        }
    }
    if let Some(s) = churn_signal(observations, cfg, now) {
        signals.push(s);
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ScoringSettings {
        ScoringSettings {
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
        }
    }

    fn observation(id: &str, status: CardFetchStatus, hash: Option<&str>, at: u64) -> CardObservation {
        CardObservation {
            snapshot_id: id.to_string(),
            fetch_status: status,
            card_hash: hash.map(|h| h.to_string()),
            fetched_at: at,
        }
    }

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn agent_id_format() {
        assert_eq!(
            agent_id(8453, "0xREGistry", 42),
            "erc8004:8453:0xregistry:42"
        );
    }

    #[test]
    fn newborn_only_below_threshold() {
        let young = newborn_signal(NOW - 86_400, "0xevent", &cfg(), NOW).unwrap();
        assert_eq!(young.signal_id, "ID_NEWBORN");
        assert_eq!(young.details.as_ref().unwrap()["ageSeconds"], 86_400);

        assert!(newborn_signal(NOW - 15 * 86_400, "0xevent", &cfg(), NOW).is_none());
        // exactly at the threshold is no longer newborn
        assert!(newborn_signal(NOW - 14 * 86_400, "0xevent", &cfg(), NOW).is_none());
    }

    #[test]
    fn card_status_mapping() {
        let ok = observation("s1", CardFetchStatus::Ok, Some("h"), NOW);
        assert!(card_status_signal(&ok, NOW).is_none());

        let invalid = observation("s2", CardFetchStatus::InvalidSchema, Some("h"), NOW);
        assert_eq!(
            card_status_signal(&invalid, NOW).unwrap().signal_id,
            "ID_CARD_SCHEMA_INVALID"
        );

        for status in
            [CardFetchStatus::Unreachable, CardFetchStatus::Timeout, CardFetchStatus::SsrfBlocked]
        {
            let o = observation("s3", status, None, NOW);
            assert_eq!(card_status_signal(&o, NOW).unwrap().signal_id, "ID_CARD_UNREACHABLE");
        }
    }

    #[test]
    fn churn_counts_distinct_hashes_in_window() {
        let observations = vec![
            observation("s1", CardFetchStatus::Ok, Some("h1"), NOW - 86_400),
            observation("s2", CardFetchStatus::Ok, Some("h2"), NOW - 2 * 86_400),
            observation("s3", CardFetchStatus::Ok, Some("h3"), NOW - 3 * 86_400),
            // outside the window
            observation("s4", CardFetchStatus::Ok, Some("h4"), NOW - 9 * 86_400),
        ];
        let signal = churn_signal(&observations, &cfg(), NOW).unwrap();
        assert_eq!(signal.signal_id, "ID_CARD_CHURN");
        assert_eq!(signal.details.as_ref().unwrap()["distinctHashes"], 3);

        // same hash repeated does not count as churn
        let stable = vec![
            observation("s1", CardFetchStatus::Ok, Some("h1"), NOW - 86_400),
            observation("s2", CardFetchStatus::Ok, Some("h1"), NOW - 2 * 86_400),
            observation("s3", CardFetchStatus::Ok, Some("h1"), NOW - 3 * 86_400),
        ];
        assert!(churn_signal(&stable, &cfg(), NOW).is_none());
    }

    #[test]
    fn composition_uses_latest_observation() {
        let observations = vec![
            observation("old", CardFetchStatus::Unreachable, None, NOW - 5000),
            observation("new", CardFetchStatus::Ok, Some("h"), NOW - 10),
        ];
        let signals = identity_signals(
            Some((NOW - 3600, "0xreg-event".to_string())),
            &observations,
            &cfg(),
            NOW,
        );
        let ids: Vec<&str> = signals.iter().map(|s| s.signal_id.as_str()).collect();
        assert!(ids.contains(&"ID_NEWBORN"));
        // latest fetch is OK, so no unreachable signal
        assert!(!ids.contains(&"ID_CARD_UNREACHABLE"));
    }
}
