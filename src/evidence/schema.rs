//! Record validation for the evidence store.
//!
//! Readers must skip lines with a higher schemaVersion or an unknown
//! type, but a malformed payload for the current type is a hard
//! validation failure on write.

use serde_json::Value;

use crate::model::Severity;

pub const SCHEMA_VERSION: u64 = 1;

const CATEGORIES: [&str; 6] = ["RECEIPT", "BOND", "DISPUTE", "SOLVER", "ESCROW", "SYSTEM"];
const ACTIONS: [&str; 6] =
    ["NONE", "OPEN_DISPUTE", "SUBMIT_EVIDENCE", "ESCALATE", "NOTIFY", "MANUAL_REVIEW"];

fn require_string(data: &Value, field: &str) -> Result<String, String> {
    data.get(field)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| format!("missing or non-string field: {}", field))
}

fn require_bool(data: &Value, field: &str) -> Result<bool, String> {
    data.get(field)
        .and_then(Value::as_bool)
        .ok_or_else(|| format!("missing or non-bool field: {}", field))
}

fn require_chain_id(data: &Value) -> Result<(), String> {
    data.get("chainId")
        .and_then(Value::as_u64)
        .map(|_| ())
        .ok_or_else(|| "missing or non-integer field: chainId".to_string())
}

fn require_decimal_string(data: &Value, field: &str) -> Result<(), String> {
    let raw = require_string(data, field)?;
    raw.parse::<u64>()
        .map(|_| ())
        .map_err(|_| format!("field {} is not a decimal block number: {}", field, raw))
}

/// Validate a finding payload (already including chainId).
pub fn validate_finding(data: &Value) -> Result<(), String> {
    require_string(data, "id")?;
    require_string(data, "ruleId")?;
    require_string(data, "title")?;
    require_string(data, "createdAt")?;
    require_chain_id(data)?;
    require_decimal_string(data, "blockNumber")?;

    let severity = require_string(data, "severity")?;
    if Severity::parse(&severity).is_none() {
        return Err(format!("unknown severity: {}", severity));
    }
    let category = require_string(data, "category")?;
    if !CATEGORIES.contains(&category.as_str()) {
        return Err(format!("unknown category: {}", category));
    }
    let action = require_string(data, "recommendedAction")?;
    if !ACTIONS.contains(&action.as_str()) {
        return Err(format!("unknown recommendedAction: {}", action));
    }
    Ok(())
}

/// Validate an action-result payload (already including chainId).
pub fn validate_action(data: &Value) -> Result<(), String> {
    require_string(data, "findingId")?;
    require_string(data, "timestamp")?;
    require_chain_id(data)?;
    require_bool(data, "success")?;
    require_bool(data, "dryRun")?;
    let action = require_string(data, "action")?;
    if !ACTIONS.contains(&action.as_str()) {
        return Err(format!("unknown action: {}", action));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn good_finding() -> Value {
        json!({
            "id": "R-1-0-abcd", "ruleId": "R", "title": "t", "description": "d",
            "severity": "HIGH", "category": "RECEIPT", "createdAt": "2024-01-01T00:00:00Z",
            "blockNumber": "100", "recommendedAction": "OPEN_DISPUTE",
            "metadata": {}, "actedUpon": false, "chainId": 8453
        })
    }

    #[test]
    fn accepts_valid_finding() {
        assert!(validate_finding(&good_finding()).is_ok());
    }

    #[test]
    fn rejects_bad_severity_and_missing_chain() {
        let mut v = good_finding();
        v["severity"] = json!("SEVERE");
        assert!(validate_finding(&v).is_err());

        let mut v = good_finding();
        v.as_object_mut().unwrap().remove("chainId");
        assert!(validate_finding(&v).is_err());
    }

    #[test]
    fn rejects_numeric_block_number() {
        let mut v = good_finding();
        v["blockNumber"] = json!(100);
        assert!(validate_finding(&v).is_err());
    }

    #[test]
    fn validates_action_records() {
        let good = json!({
            "findingId": "R-1", "action": "OPEN_DISPUTE", "success": true, "dryRun": false,
            "txHash": "0xabc", "timestamp": "2024-01-01T00:00:00Z", "chainId": 1
        });
        assert!(validate_action(&good).is_ok());

        let mut bad = good.clone();
        bad["success"] = json!("yes");
        assert!(validate_action(&bad).is_err());
    }
}
