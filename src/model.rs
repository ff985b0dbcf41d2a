//! Core finding model shared by the rule engine, the executor and the
//! evidence store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered severity scale. Ordering is part of the contract: INFO < LOW <
/// MEDIUM < HIGH < CRITICAL.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(Severity::Info),
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingCategory {
    Receipt,
    Bond,
    Dispute,
    Solver,
    Escrow,
    System,
}

impl FindingCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingCategory::Receipt => "RECEIPT",
            FindingCategory::Bond => "BOND",
            FindingCategory::Dispute => "DISPUTE",
            FindingCategory::Solver => "SOLVER",
            FindingCategory::Escrow => "ESCROW",
            FindingCategory::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    None,
    OpenDispute,
    SubmitEvidence,
    Escalate,
    Notify,
    ManualReview,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::None => "NONE",
            ActionType::OpenDispute => "OPEN_DISPUTE",
            ActionType::SubmitEvidence => "SUBMIT_EVIDENCE",
            ActionType::Escalate => "ESCALATE",
            ActionType::Notify => "NOTIFY",
            ActionType::ManualReview => "MANUAL_REVIEW",
        }
    }
}

/// Decimal-string serialisation for block numbers; no lossy float
/// conversion at any layer.
pub mod u64_string {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<u64>().map_err(serde::de::Error::custom)
    }
}

/// Decimal-string serialisation for wei amounts.
pub mod u128_string {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<u128>().map_err(serde::de::Error::custom)
    }
}

/// A rule's observation, potentially actionable. The id is stable after
/// creation; `acted_upon` only ever transitions false → true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: String,
    pub rule_id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub category: FindingCategory,
    pub created_at: String,
    #[serde(with = "u64_string")]
    pub block_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
    pub recommended_action: ActionType,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub acted_upon: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_tx_hash: Option<String>,
}

impl Finding {
    /// Build a finding with a fresh unique id:
    /// `<rule-id>-<block>-<unix-millis>-<random suffix>`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule_id: &str,
        title: &str,
        description: &str,
        severity: Severity,
        category: FindingCategory,
        block_number: u64,
        now_millis: u64,
        recommended_action: ActionType,
    ) -> Self {
        let suffix: u32 = rand::random();
        Self {
            id: format!("{}-{}-{}-{:08x}", rule_id, block_number, now_millis, suffix),
            rule_id: rule_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            severity,
            category,
            created_at: crate::clock::iso_from_seconds(now_millis / 1000),
            block_number,
            tx_hash: None,
            contract_address: None,
            solver_id: None,
            receipt_id: None,
            recommended_action,
            metadata: Map::new(),
            acted_upon: false,
            action_tx_hash: None,
        }
    }

    pub fn with_receipt(mut self, receipt_id: &str) -> Self {
        self.receipt_id = Some(receipt_id.to_string());
        self
    }

    pub fn with_solver(mut self, solver_id: &str) -> Self {
        self.solver_id = Some(solver_id.to_string());
        self
    }

    pub fn with_tx(mut self, tx_hash: &str) -> Self {
        self.tx_hash = Some(tx_hash.to_string());
        self
    }

    pub fn with_contract(mut self, address: &str) -> Self {
        self.contract_address = Some(address.to_string());
        self
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Monotonic false → true; records the transaction that acted on it.
    pub fn mark_acted(&mut self, tx_hash: Option<&str>) {
        self.acted_upon = true;
        if let Some(tx) = tx_hash {
            self.action_tx_hash = Some(tx.to_string());
        }
    }
}

/// Outcome of one executor pass over one finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub finding_id: String,
    pub action: ActionType,
    pub success: bool,
    pub dry_run: bool,
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}
