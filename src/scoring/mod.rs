//! Agent scoring: signal → snapshot → report → alert, with
//! content-addressed IDs over canonical JSON.

pub mod behavior;
pub mod context;
pub mod identity;
pub mod pipeline;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::canonical::hash_canonical;
use crate::model::Severity;

/// Severity points for the raw score. INFO carries no weight.
pub fn severity_points(severity: Severity) -> f64 {
    match severity {
        Severity::Info => 0.0,
        Severity::Low => 5.0,
        Severity::Medium => 15.0,
        Severity::High => 30.0,
        Severity::Critical => 60.0,
    }
}

/// Ordered (type, ref) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvidenceRef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

impl EvidenceRef {
    pub fn new(kind: &str, reference: &str) -> Self {
        Self { kind: kind.to_string(), reference: reference.to_string() }
    }
}

/// Sorted lexicographically by (type, ref) and deduped before hashing.
pub fn normalize_evidence(mut evidence: Vec<EvidenceRef>) -> Vec<EvidenceRef> {
    evidence.sort();
    evidence.dedup();
    evidence
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub signal_id: String,
    pub severity: Severity,
    pub weight: f64,
    pub observed_at: u64,
    pub evidence: Vec<EvidenceRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl Signal {
    pub fn new(
        signal_id: &str,
        severity: Severity,
        weight: f64,
        observed_at: u64,
        evidence: Vec<EvidenceRef>,
    ) -> Self {
        Self {
            signal_id: signal_id.to_string(),
            severity,
            weight,
            observed_at,
            evidence: normalize_evidence(evidence),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = Some(details);
        self
    }

    /// Canonical value used inside snapshot hashing; details and
    /// observation time do not influence identity.
    fn canonical_value(&self) -> Value {
        json!({
            "signalId": self.signal_id,
            "severity": self.severity,
            "weight": self.weight,
            "evidence": normalize_evidence(self.evidence.clone()),
        })
    }
}

/// Stable ordering for a signal set: (signalId, severity, stringified
/// evidence) so identical sets collide to one snapshot id.
pub fn sort_signals(signals: &mut [Signal]) {
    signals.sort_by(|a, b| {
        a.signal_id
            .cmp(&b.signal_id)
            .then(a.severity.cmp(&b.severity))
            .then_with(|| format!("{:?}", a.evidence).cmp(&format!("{:?}", b.evidence)))
    });
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub snapshot_id: String,
    pub agent_id: String,
    pub observed_at: u64,
    pub signals: Vec<Signal>,
}

impl Snapshot {
    /// Immutable once built; the id is SHA-256 of canonical JSON of
    /// `{agentId, signals}`.
    pub fn build(agent_id: &str, mut signals: Vec<Signal>, observed_at: u64) -> Self {
        sort_signals(&mut signals);
        let snapshot_id = Self::compute_id(agent_id, &signals);
        Self { snapshot_id, agent_id: agent_id.to_string(), observed_at, signals }
    }

    pub fn compute_id(agent_id: &str, signals: &[Signal]) -> String {
        let value = json!({
            "agentId": agent_id,
            "signals": signals.iter().map(Signal::canonical_value).collect::<Vec<_>>(),
        });
        hash_canonical(&value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "LOW",
            Confidence::Medium => "MEDIUM",
            Confidence::High => "HIGH",
        }
    }
}

pub const REPORT_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSummary {
    pub signal_id: String,
    pub severity: Severity,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskReport {
    pub report_id: String,
    pub report_version: String,
    pub agent_id: String,
    pub overall_risk: u32,
    pub confidence: Confidence,
    pub reasons: Vec<String>,
    pub evidence_links: Vec<String>,
    pub signals: Vec<SignalSummary>,
    pub generated_at: u64,
}

impl RiskReport {
    /// reportId hashes the payload *excluding* generatedAt.
    pub fn payload_for_id(&self) -> Value {
        json!({
            "reportVersion": self.report_version,
            "agentId": self.agent_id,
            "overallRisk": self.overall_risk,
            "confidence": self.confidence,
            "reasons": self.reasons,
            "evidenceLinks": self.evidence_links,
            "signals": self.signals.iter().map(|s| json!({
                "signalId": s.signal_id,
                "severity": s.severity,
                "weight": s.weight,
            })).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: String,
    pub agent_id: String,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub description: String,
    pub evidence: Vec<EvidenceRef>,
    pub created_at: u64,
    pub is_active: bool,
}

impl Alert {
    fn build(
        agent_id: &str,
        severity: Severity,
        alert_type: &str,
        description: &str,
        evidence: Vec<EvidenceRef>,
        created_at: u64,
    ) -> Self {
        let evidence = normalize_evidence(evidence);
        let top_refs: Vec<&str> =
            evidence.iter().take(5).map(|e| e.reference.as_str()).collect();
        let alert_id = hash_canonical(&json!({
            "agentId": agent_id,
            "severity": severity,
            "topEvidenceRefs": top_refs,
            "type": alert_type,
        }));
        Self {
            alert_id,
            agent_id: agent_id.to_string(),
            severity,
            alert_type: alert_type.to_string(),
            description: description.to_string(),
            evidence,
            created_at,
            is_active: true,
        }
    }
}

#[derive(Debug)]
pub struct ScoreOutcome {
    pub report: RiskReport,
    pub alerts: Vec<Alert>,
    pub snapshot_ids: Vec<String>,
}

/// Score an agent from the snapshots under consideration.
pub fn score_agent(agent_id: &str, snapshots: &[Snapshot], now_seconds: u64) -> ScoreOutcome {
    let mut signals: Vec<Signal> = snapshots.iter().flat_map(|s| s.signals.clone()).collect();
    sort_signals(&mut signals);

    let raw_score: f64 = signals.iter().map(|s| severity_points(s.severity) * s.weight).sum();
    let has_critical = signals.iter().any(|s| s.severity == Severity::Critical);
    let overall_risk: u32 =
        if has_critical { 100 } else { (raw_score.round() as u32).min(100) };

    let distinct_snapshots: std::collections::BTreeSet<&str> =
        snapshots.iter().map(|s| s.snapshot_id.as_str()).collect();
    // Corroboration needs more than one snapshot; a lone snapshot stays
    // LOW no matter how many signals it carries.
    let confidence = if signals.len() >= 5 && distinct_snapshots.len() >= 2 {
        Confidence::High
    } else if signals.len() >= 2 && distinct_snapshots.len() >= 2 {
        Confidence::Medium
    } else {
        Confidence::Low
    };

    let mut reasons: Vec<String> = signals
        .iter()
        .map(|s| format!("{} signal: {}", s.severity.as_str(), s.signal_id))
        .collect();
    if has_critical {
        reasons.push("CRITICAL signal detected — risk set to maximum".to_string());
    }
    reasons.sort();
    reasons.dedup();

    let mut evidence_links: Vec<String> = signals
        .iter()
        .flat_map(|s| s.evidence.iter().map(|e| e.reference.clone()))
        .collect();
    evidence_links.sort();
    evidence_links.dedup();

    let summaries: Vec<SignalSummary> = signals
        .iter()
        .map(|s| SignalSummary {
            signal_id: s.signal_id.clone(),
            severity: s.severity,
            weight: s.weight,
        })
        .collect();

    let mut report = RiskReport {
        report_id: String::new(),
        report_version: REPORT_VERSION.to_string(),
        agent_id: agent_id.to_string(),
        overall_risk,
        confidence,
        reasons,
        evidence_links: evidence_links.clone(),
        signals: summaries,
        generated_at: now_seconds,
    };
    report.report_id = hash_canonical(&report.payload_for_id());

    let mut alerts = Vec::new();
    if has_critical {
        let critical_evidence: Vec<EvidenceRef> = signals
            .iter()
            .filter(|s| s.severity == Severity::Critical)
            .flat_map(|s| s.evidence.clone())
            .collect();
        alerts.push(Alert::build(
            agent_id,
            Severity::Critical,
            "CRITICAL_SIGNAL_DETECTED",
            "One or more critical signals observed for this agent",
            critical_evidence,
            now_seconds,
        ));
    } else if overall_risk >= 80 {
        let report_evidence: Vec<EvidenceRef> =
            signals.iter().flat_map(|s| s.evidence.clone()).collect();
        alerts.push(Alert::build(
            agent_id,
            Severity::High,
            "HIGH_RISK_SCORE",
            &format!("Aggregate risk score {} exceeds the alert threshold", overall_risk),
            report_evidence,
            now_seconds,
        ));
    }

    ScoreOutcome {
        report,
        alerts,
        snapshot_ids: distinct_snapshots.into_iter().map(|s| s.to_string()).collect(),
    }
}
