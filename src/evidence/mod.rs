//! Append-only JSONL evidence store.
//!
//! One file per UTC date, rotated by size with `-N` suffixes. Writes are
//! serialised by the caller (one store per process); readers tolerate
//! trailing partial lines by skipping whatever does not parse.

pub mod schema;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{date_stem, Clock};
use crate::errors::WatchtowerError;
use crate::logging::{json_log, log_error, obj, v_str, Domain};
use crate::model::{ActionResult, Finding, Severity};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingRecord {
    pub chain_id: u64,
    #[serde(flatten)]
    pub finding: Finding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResultRecord {
    pub chain_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
    #[serde(flatten)]
    pub result: ActionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceLine {
    #[serde(rename = "type")]
    pub record_type: String,
    pub schema_version: u64,
    pub data: Value,
}

#[derive(Debug, Clone, Default)]
pub struct EvidenceQuery {
    pub record_type: Option<String>,
    pub chain_id: Option<u64>,
    pub receipt_id: Option<String>,
    /// Findings only.
    pub rule_id: Option<String>,
    /// Findings only.
    pub severity: Option<Severity>,
    /// Inclusive; `YYYY-MM-DD` or full RFC3339.
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceStats {
    pub file_count: usize,
    pub finding_count: usize,
    pub action_count: usize,
    pub oldest_timestamp: Option<String>,
    pub newest_timestamp: Option<String>,
}

pub struct EvidenceStore {
    data_dir: PathBuf,
    max_file_size_bytes: u64,
    validate_on_write: bool,
    clock: Arc<dyn Clock>,
}

impl EvidenceStore {
    pub fn new(
        data_dir: &Path,
        max_file_size_bytes: u64,
        validate_on_write: bool,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("creating evidence dir {}", data_dir.display()))?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            max_file_size_bytes,
            validate_on_write,
            clock,
        })
    }

    pub fn append_finding(&self, record: &FindingRecord) -> Result<()> {
        let data = serde_json::to_value(record)?;
        if self.validate_on_write {
            schema::validate_finding(&data)
                .map_err(WatchtowerError::Validation)?;
        }
        self.append_line("finding", data)
    }

    pub fn append_action(&self, record: &ActionResultRecord) -> Result<()> {
        let data = serde_json::to_value(record)?;
        if self.validate_on_write {
            schema::validate_action(&data)
                .map_err(WatchtowerError::Validation)?;
        }
        self.append_line("action", data)
    }

    fn append_line(&self, record_type: &str, data: Value) -> Result<()> {
        let line = EvidenceLine {
            record_type: record_type.to_string(),
            schema_version: schema::SCHEMA_VERSION,
            data,
        };
        let path = self.target_file()?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut serialized = serde_json::to_string(&line)?;
        serialized.push('\n');
        file.write_all(serialized.as_bytes())?;
        json_log(
            Domain::Evidence,
            "append",
            obj(&[
                ("type", v_str(record_type)),
                ("file", v_str(&path.display().to_string())),
            ]),
        );
        Ok(())
    }

    /// Date-stem file, or the next free `-N` suffix once the size cap is
    /// exceeded.
    fn target_file(&self) -> Result<PathBuf> {
        let stem = date_stem(self.clock.now_seconds());
        let base = self.data_dir.join(format!("evidence-{}.jsonl", stem));
        match fs::metadata(&base) {
            Ok(meta) if meta.len() >= self.max_file_size_bytes => {}
            _ => return Ok(base),
        }
        for n in 1..10_000u32 {
            let candidate = self.data_dir.join(format!("evidence-{}-{}.jsonl", stem, n));
            match fs::metadata(&candidate) {
                Ok(meta) if meta.len() >= self.max_file_size_bytes => continue,
                _ => return Ok(candidate),
            }
        }
        anyhow::bail!("evidence rotation exhausted suffixes for {}", stem)
    }

    /// Evidence files in chronological order: date stem, then rotation
    /// suffix numerically.
    fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut keyed: Vec<(String, u32, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_prefix("evidence-").and_then(|s| s.strip_suffix(".jsonl"))
            else {
                continue;
            };
            // stem is YYYY-MM-DD or YYYY-MM-DD-N
            let (date, index) = match stem.get(10..) {
                Some(rest) if rest.starts_with('-') => {
                    let idx = rest[1..].parse::<u32>().unwrap_or(u32::MAX);
                    (stem[..10].to_string(), idx)
                }
                _ => (stem.to_string(), 0),
            };
            keyed.push((date, index, entry.path()));
        }
        keyed.sort();
        Ok(keyed.into_iter().map(|(_, _, p)| p).collect())
    }

    fn read_lines(&self) -> Result<Vec<EvidenceLine>> {
        let mut lines = Vec::new();
        for path in self.list_files()? {
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    log_error(Domain::Evidence, "read_failed", &err.to_string());
                    continue;
                }
            };
            for raw in content.lines() {
                if raw.trim().is_empty() {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<EvidenceLine>(raw) else {
                    continue; // partial or foreign line
                };
                if parsed.schema_version > schema::SCHEMA_VERSION {
                    continue;
                }
                if parsed.record_type != "finding" && parsed.record_type != "action" {
                    continue;
                }
                lines.push(parsed);
            }
        }
        Ok(lines)
    }

    /// Filters intersect and are applied before offset/limit. Results
    /// preserve file order.
    pub fn query(&self, query: &EvidenceQuery) -> Result<Vec<EvidenceLine>> {
        let start = query.start_date.as_deref().map(normalize_start);
        let end = query.end_date.as_deref().map(normalize_end);

        let filtered = self.read_lines()?.into_iter().filter(|line| {
            if let Some(t) = &query.record_type {
                if &line.record_type != t {
                    return false;
                }
            }
            if let Some(chain_id) = query.chain_id {
                if line.data.get("chainId").and_then(Value::as_u64) != Some(chain_id) {
                    return false;
                }
            }
            if let Some(receipt_id) = &query.receipt_id {
                let found = line
                    .data
                    .get("receiptId")
                    .and_then(Value::as_str)
                    .map(|r| r.eq_ignore_ascii_case(receipt_id))
                    .unwrap_or(false);
                if !found {
                    return false;
                }
            }
            if let Some(rule_id) = &query.rule_id {
                if line.record_type != "finding"
                    || line.data.get("ruleId").and_then(Value::as_str) != Some(rule_id.as_str())
                {
                    return false;
                }
            }
            if let Some(severity) = query.severity {
                if line.record_type != "finding"
                    || line.data.get("severity").and_then(Value::as_str)
                        != Some(severity.as_str())
                {
                    return false;
                }
            }
            let timestamp = record_timestamp(line);
            if let Some(start) = &start {
                match &timestamp {
                    Some(ts) if ts.as_str() >= start.as_str() => {}
                    _ => return false,
                }
            }
            if let Some(end) = &end {
                match &timestamp {
                    Some(ts) if ts.as_str() <= end.as_str() => {}
                    _ => return false,
                }
            }
            true
        });

        let sliced: Vec<EvidenceLine> = match query.limit {
            Some(limit) => filtered.skip(query.offset).take(limit).collect(),
            None => filtered.skip(query.offset).collect(),
        };
        Ok(sliced)
    }

    /// Full scan by finding id.
    pub fn finding_by_id(&self, finding_id: &str) -> Result<Option<EvidenceLine>> {
        Ok(self.read_lines()?.into_iter().find(|line| {
            line.record_type == "finding"
                && line.data.get("id").and_then(Value::as_str) == Some(finding_id)
        }))
    }

    pub fn actions_for_finding(&self, finding_id: &str) -> Result<Vec<EvidenceLine>> {
        Ok(self
            .read_lines()?
            .into_iter()
            .filter(|line| {
                line.record_type == "action"
                    && line.data.get("findingId").and_then(Value::as_str) == Some(finding_id)
            })
            .collect())
    }

    pub fn stats(&self) -> Result<EvidenceStats> {
        let files = self.list_files()?;
        let lines = self.read_lines()?;
        let mut finding_count = 0;
        let mut action_count = 0;
        let mut oldest: Option<String> = None;
        let mut newest: Option<String> = None;
        for line in &lines {
            match line.record_type.as_str() {
                "finding" => finding_count += 1,
                "action" => action_count += 1,
                _ => {}
            }
            if let Some(ts) = record_timestamp(line) {
                if oldest.as_deref().map(|o| ts.as_str() < o).unwrap_or(true) {
                    oldest = Some(ts.clone());
                }
                if newest.as_deref().map(|n| ts.as_str() > n).unwrap_or(true) {
                    newest = Some(ts);
                }
            }
        }
        Ok(EvidenceStats {
            file_count: files.len(),
            finding_count,
            action_count,
            oldest_timestamp: oldest,
            newest_timestamp: newest,
        })
    }
}

fn record_timestamp(line: &EvidenceLine) -> Option<String> {
    line.data
        .get("timestamp")
        .or_else(|| line.data.get("createdAt"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

fn normalize_start(raw: &str) -> String {
    if raw.len() == 10 {
        format!("{}T00:00:00Z", raw)
    } else {
        raw.to_string()
    }
}

fn normalize_end(raw: &str) -> String {
    if raw.len() == 10 {
        format!("{}T23:59:59Z", raw)
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{ActionType, FindingCategory};
    use tempfile::TempDir;

    // 2024-01-01T00:00:00Z
    const T0: u64 = 1_704_067_200;

    fn store(dir: &TempDir, clock: Arc<ManualClock>, max_bytes: u64) -> EvidenceStore {
        EvidenceStore::new(dir.path(), max_bytes, true, clock).unwrap()
    }

    fn finding_record(chain_id: u64, rule_id: &str, severity: Severity, ts: u64) -> FindingRecord {
        let finding = Finding::new(
            rule_id,
            "title",
            "desc",
            severity,
            FindingCategory::Receipt,
            500,
            ts * 1000,
            ActionType::OpenDispute,
        )
        .with_receipt("0xRcpt");
        FindingRecord { chain_id, finding }
    }

    fn action_record(chain_id: u64, finding_id: &str, ts: u64) -> ActionResultRecord {
        ActionResultRecord {
            chain_id,
            receipt_id: Some("0xrcpt".to_string()),
            result: ActionResult {
                finding_id: finding_id.to_string(),
                action: ActionType::OpenDispute,
                success: true,
                dry_run: false,
                tx_hash: Some("0xhash".to_string()),
                error: None,
                timestamp: crate::clock::iso_from_seconds(ts),
            },
        }
    }

    #[test]
    fn append_then_query_round_trips() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_seconds(T0));
        let store = store(&dir, clock, 1024 * 1024);

        let record = finding_record(1, "RECEIPT_STALE", Severity::High, T0);
        store.append_finding(&record).unwrap();

        let all = store.query(&EvidenceQuery::default()).unwrap();
        assert_eq!(all.len(), 1);
        let found = store.finding_by_id(&record.finding.id).unwrap().unwrap();
        assert_eq!(found.data, serde_json::to_value(&record).unwrap());
    }

    #[test]
    fn filters_intersect() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_seconds(T0));
        let store = store(&dir, clock, 1024 * 1024);

        store.append_finding(&finding_record(1, "RECEIPT_STALE", Severity::High, T0)).unwrap();
        store.append_finding(&finding_record(1, "SAMPLE-001", Severity::Medium, T0)).unwrap();
        store.append_finding(&finding_record(2, "RECEIPT_STALE", Severity::High, T0)).unwrap();
        store.append_action(&action_record(1, "f-1", T0)).unwrap();

        let q = EvidenceQuery {
            record_type: Some("finding".to_string()),
            chain_id: Some(1),
            rule_id: Some("RECEIPT_STALE".to_string()),
            ..Default::default()
        };
        let hits = store.query(&q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].data["chainId"], 1);

        let by_severity = EvidenceQuery {
            severity: Some(Severity::Medium),
            ..Default::default()
        };
        assert_eq!(store.query(&by_severity).unwrap().len(), 1);

        let by_receipt = EvidenceQuery {
            receipt_id: Some("0xRCPT".to_string()),
            ..Default::default()
        };
        // matches findings and actions case-insensitively
        assert_eq!(store.query(&by_receipt).unwrap().len(), 4);
    }

    #[test]
    fn offset_and_limit_slice_deterministically() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_seconds(T0));
        let store = store(&dir, clock, 1024 * 1024);
        for i in 0..5 {
            store.append_action(&action_record(1, &format!("f-{}", i), T0 + i)).unwrap();
        }
        let q = EvidenceQuery { offset: 1, limit: Some(2), ..Default::default() };
        let hits = store.query(&q).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].data["findingId"], "f-1");
        assert_eq!(hits[1].data["findingId"], "f-2");
    }

    #[test]
    fn date_filters_apply_to_timestamps() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_seconds(T0));
        let store = store(&dir, clock, 1024 * 1024);
        store.append_action(&action_record(1, "old", T0)).unwrap();
        store.append_action(&action_record(1, "new", T0 + 3 * 86_400)).unwrap();

        let q = EvidenceQuery {
            start_date: Some("2024-01-03".to_string()),
            ..Default::default()
        };
        let hits = store.query(&q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].data["findingId"], "new");

        let q = EvidenceQuery {
            end_date: Some("2024-01-01".to_string()),
            ..Default::default()
        };
        let hits = store.query(&q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].data["findingId"], "old");
    }

    #[test]
    fn rotation_moves_to_suffixed_files() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_seconds(T0));
        let store = store(&dir, clock, 64); // tiny cap forces rotation
        for i in 0..3 {
            store.append_action(&action_record(1, &format!("f-{}", i), T0)).unwrap();
        }
        let names: Vec<String> = store
            .list_files()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.len() >= 2);
        assert_eq!(names[0], "evidence-2024-01-01.jsonl");
        assert_eq!(names[1], "evidence-2024-01-01-1.jsonl");
        // every record still readable, in order
        assert_eq!(store.query(&EvidenceQuery::default()).unwrap().len(), 3);
    }

    #[test]
    fn unparseable_and_future_schema_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_seconds(T0));
        let store = store(&dir, clock, 1024 * 1024);
        store.append_action(&action_record(1, "keep", T0)).unwrap();

        let path = dir.path().join("evidence-2024-01-01.jsonl");
        let mut existing = fs::read_to_string(&path).unwrap();
        existing.push_str("{\"type\":\"action\",\"schemaVersion\":9,\"data\":{}}\n");
        existing.push_str("{\"type\":\"mystery\",\"schemaVersion\":1,\"data\":{}}\n");
        existing.push_str("{ partial line");
        fs::write(&path, existing).unwrap();

        let hits = store.query(&EvidenceQuery::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].data["findingId"], "keep");
    }

    #[test]
    fn stats_count_files_and_records() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_seconds(T0));
        let store = store(&dir, clock.clone(), 1024 * 1024);
        store.append_finding(&finding_record(1, "R", Severity::Low, T0)).unwrap();
        clock.advance_seconds(86_400);
        store.append_action(&action_record(1, "f", T0 + 86_400)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.finding_count, 1);
        assert_eq!(stats.action_count, 1);
        assert_eq!(stats.oldest_timestamp.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(stats.newest_timestamp.as_deref(), Some("2024-01-02T00:00:00Z"));
    }
}
