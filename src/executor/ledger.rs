//! Idempotency ledger: one action per receipt, forever.
//!
//! Keys are lower-cased receipt ids; the file format is a JSON array so
//! the ledger stays greppable during incident review.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::errors::WatchtowerError;

/// Only chain-mutating actions are ledgered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerActionType {
    OpenDispute,
    SubmitEvidence,
}

impl LedgerActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerActionType::OpenDispute => "OPEN_DISPUTE",
            LedgerActionType::SubmitEvidence => "SUBMIT_EVIDENCE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    pub receipt_id: String,
    pub action_type: LedgerActionType,
    pub tx_hash: String,
    #[serde(with = "crate::model::u64_string")]
    pub block_number: u64,
    pub timestamp: String,
    pub finding_id: String,
}

pub struct ActionLedger {
    path: PathBuf,
    entries: HashMap<String, ActionEntry>,
}

impl ActionLedger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entries = match fs::read_to_string(path) {
            Ok(raw) => {
                let list: Vec<ActionEntry> = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing ledger {}", path.display()))?;
                list.into_iter()
                    .map(|e| (e.receipt_id.to_lowercase(), e))
                    .collect()
            }
            Err(_) => HashMap::new(),
        };
        Ok(Self { path: path.to_path_buf(), entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, receipt_id: &str) -> bool {
        self.entries.contains_key(&receipt_id.to_lowercase())
    }

    pub fn get(&self, receipt_id: &str) -> Option<&ActionEntry> {
        self.entries.get(&receipt_id.to_lowercase())
    }

    /// Record one action. A second write for the same receipt fails with
    /// `ActionAlreadyRecorded`, never silently overwrites.
    pub fn record(
        &mut self,
        receipt_id: &str,
        action_type: LedgerActionType,
        tx_hash: &str,
        block_number: u64,
        finding_id: &str,
        clock: &dyn Clock,
    ) -> Result<()> {
        let key = receipt_id.to_lowercase();
        if self.entries.contains_key(&key) {
            return Err(WatchtowerError::ActionAlreadyRecorded { receipt_id: key }.into());
        }
        let entry = ActionEntry {
            receipt_id: key.clone(),
            action_type,
            tx_hash: tx_hash.to_string(),
            block_number,
            timestamp: crate::clock::iso_from_seconds(clock.now_seconds()),
            finding_id: finding_id.to_string(),
        };
        self.entries.insert(key, entry);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let mut list: Vec<&ActionEntry> = self.entries.values().collect();
        list.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.receipt_id.cmp(&b.receipt_id)));
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&list)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    #[test]
    fn second_write_for_same_receipt_fails() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::at_seconds(1_700_000_000);
        let mut ledger = ActionLedger::open(&dir.path().join("ledger.json")).unwrap();

        ledger
            .record("0xAA", LedgerActionType::OpenDispute, "0xhash", 10, "f-1", &clock)
            .unwrap();
        let err = ledger
            .record("0xAA", LedgerActionType::OpenDispute, "0xhash2", 11, "f-2", &clock)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WatchtowerError>(),
            Some(WatchtowerError::ActionAlreadyRecorded { .. })
        ));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn keys_are_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::at_seconds(0);
        let mut ledger = ActionLedger::open(&dir.path().join("ledger.json")).unwrap();

        ledger
            .record("0xAbCd", LedgerActionType::SubmitEvidence, "0xt", 5, "f", &clock)
            .unwrap();
        assert!(ledger.contains("0xABCD"));
        assert!(ledger.contains("0xabcd"));
        assert!(ledger
            .record("0xABCD", LedgerActionType::OpenDispute, "0xt2", 6, "f2", &clock)
            .is_err());
    }

    #[test]
    fn reload_round_trips_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        let clock = ManualClock::at_seconds(1_700_000_000);
        {
            let mut ledger = ActionLedger::open(&path).unwrap();
            ledger
                .record("0xaa", LedgerActionType::OpenDispute, "0xh", 77, "f-9", &clock)
                .unwrap();
        }
        let ledger = ActionLedger::open(&path).unwrap();
        let entry = ledger.get("0xAA").unwrap();
        assert_eq!(entry.block_number, 77);
        assert_eq!(entry.finding_id, "f-9");
        assert_eq!(entry.timestamp, "2023-11-14T22:13:20Z");
    }
}
