//! Embedded relational store (SQLite) for agents, snapshots, reports,
//! alerts, identity and context state.
//!
//! The migration runner is linear over sorted filenames and idempotent;
//! when no migrations directory ships with the deployment, the inline
//! DDL fallback applies the same schema.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::fetcher::CardFetchStatus;
use crate::logging::{json_log, obj, v_str, Domain};
use crate::scoring::identity::CardObservation;
use crate::scoring::{Alert, RiskReport, Snapshot};

const INLINE_MIGRATIONS: &[(&str, &str)] = &[(
    "0001_init.sql",
    r#"
    CREATE TABLE IF NOT EXISTS agents (
        agent_id    TEXT PRIMARY KEY,
        created_at  INTEGER NOT NULL,
        status      TEXT NOT NULL DEFAULT 'ACTIVE',
        labels_json TEXT NOT NULL DEFAULT '[]'
    );
    CREATE TABLE IF NOT EXISTS snapshots (
        snapshot_id  TEXT PRIMARY KEY,
        agent_id     TEXT NOT NULL REFERENCES agents(agent_id),
        observed_at  INTEGER NOT NULL,
        signals_json TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS alerts (
        alert_id      TEXT PRIMARY KEY,
        agent_id      TEXT NOT NULL REFERENCES agents(agent_id),
        severity      TEXT NOT NULL,
        type          TEXT NOT NULL,
        description   TEXT NOT NULL,
        evidence_json TEXT NOT NULL,
        created_at    INTEGER NOT NULL,
        is_active     INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE IF NOT EXISTS risk_reports (
        report_id    TEXT PRIMARY KEY,
        agent_id     TEXT NOT NULL REFERENCES agents(agent_id),
        generated_at INTEGER NOT NULL,
        overall_risk INTEGER NOT NULL,
        confidence   TEXT NOT NULL,
        report_json  TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS identity_cursor (
        chain_id         INTEGER NOT NULL,
        registry_address TEXT NOT NULL,
        last_block       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL,
        PRIMARY KEY (chain_id, registry_address)
    );
    CREATE TABLE IF NOT EXISTS identity_events (
        event_id         TEXT PRIMARY KEY,
        chain_id         INTEGER NOT NULL,
        registry_address TEXT NOT NULL,
        agent_token_id   INTEGER NOT NULL,
        agent_uri        TEXT,
        owner_address    TEXT,
        event_type       TEXT NOT NULL,
        block_number     INTEGER NOT NULL,
        tx_hash          TEXT NOT NULL,
        log_index        INTEGER NOT NULL,
        discovered_at    INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS identity_snapshots (
        snapshot_id   TEXT PRIMARY KEY,
        agent_id      TEXT NOT NULL,
        agent_uri     TEXT NOT NULL,
        fetch_status  TEXT NOT NULL,
        card_hash     TEXT,
        card_json     TEXT,
        fetched_at    INTEGER NOT NULL,
        http_status   INTEGER,
        error_message TEXT
    );
    CREATE TABLE IF NOT EXISTS context_cursor (
        agent_id   TEXT NOT NULL,
        chain_id   INTEGER NOT NULL,
        last_block INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (agent_id, chain_id)
    );
    "#,
)];

pub struct Store {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct AgentRow {
    pub agent_id: String,
    pub created_at: u64,
    pub status: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AgentSummary {
    pub agent_id: String,
    pub status: String,
    pub latest_risk: Option<u32>,
    pub active_alert_count: u32,
}

#[derive(Debug, Clone)]
pub struct IdentityEventRow {
    pub event_id: String,
    pub chain_id: u64,
    pub registry_address: String,
    pub agent_token_id: u64,
    pub agent_uri: Option<String>,
    pub owner_address: Option<String>,
    pub event_type: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    pub discovered_at: u64,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening sqlite db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Apply pending migrations from `dir` (sorted filenames); fall back
    /// to the inline DDL when the directory is absent.
    pub fn migrate(&mut self, dir: Option<&Path>, now: u64) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
            [],
        )?;

        let mut migrations: Vec<(String, String)> = Vec::new();
        match dir {
            Some(dir) if dir.is_dir() => {
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !name.ends_with(".sql") {
                        continue;
                    }
                    let sql = std::fs::read_to_string(entry.path())?;
                    migrations.push((name, sql));
                }
                migrations.sort();
            }
            _ => {
                migrations = INLINE_MIGRATIONS
                    .iter()
                    .map(|(n, s)| (n.to_string(), s.to_string()))
                    .collect();
            }
        }

        for (name, sql) in migrations {
            let applied: Option<String> = self
                .conn
                .query_row("SELECT name FROM _migrations WHERE name = ?1", params![name], |r| {
                    r.get(0)
                })
                .optional()?;
            if applied.is_some() {
                continue;
            }
            let tx = self.conn.transaction()?;
            tx.execute_batch(&sql)
                .with_context(|| format!("applying migration {}", name))?;
            tx.execute(
                "INSERT INTO _migrations (name, applied_at) VALUES (?1, ?2)",
                params![name, now as i64],
            )?;
            tx.commit()?;
            json_log(Domain::System, "migration_applied", obj(&[("name", v_str(&name))]));
        }
        Ok(())
    }

    // =========================================================================
    // Agents
    // =========================================================================

    pub fn upsert_agent(&self, agent_id: &str, created_at: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO agents (agent_id, created_at) VALUES (?1, ?2)
             ON CONFLICT(agent_id) DO NOTHING",
            params![agent_id.to_lowercase(), created_at as i64],
        )?;
        Ok(())
    }

    pub fn set_agent_status(&self, agent_id: &str, status: &str) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE agents SET status = ?2 WHERE agent_id = ?1",
            params![agent_id.to_lowercase(), status],
        )?;
        Ok(n > 0)
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRow>> {
        self.conn
            .query_row(
                "SELECT agent_id, created_at, status, labels_json
                 FROM agents WHERE agent_id = ?1",
                params![agent_id.to_lowercase()],
                |row| {
                    Ok(AgentRow {
                        agent_id: row.get(0)?,
                        created_at: row.get::<_, i64>(1)? as u64,
                        status: row.get(2)?,
                        labels: serde_json::from_str(&row.get::<_, String>(3)?)
                            .unwrap_or_default(),
                    })
                },
            )
            .optional()
            .context("loading agent")
    }

    /// Listing for the API: latest risk plus active alert count per agent.
    pub fn list_agents(&self) -> Result<Vec<AgentSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.agent_id, a.status,
                    (SELECT overall_risk FROM risk_reports r
                     WHERE r.agent_id = a.agent_id
                     ORDER BY generated_at DESC, report_id LIMIT 1),
                    (SELECT COUNT(*) FROM alerts al
                     WHERE al.agent_id = a.agent_id AND al.is_active = 1)
             FROM agents a ORDER BY a.agent_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AgentSummary {
                agent_id: row.get(0)?,
                status: row.get(1)?,
                latest_risk: row.get::<_, Option<i64>>(2)?.map(|v| v as u32),
                active_alert_count: row.get::<_, i64>(3)? as u32,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Snapshots, reports, alerts
    // =========================================================================

    pub fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO snapshots (snapshot_id, agent_id, observed_at, signals_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.snapshot_id,
                snapshot.agent_id.to_lowercase(),
                snapshot.observed_at as i64,
                serde_json::to_string(&snapshot.signals)?,
            ],
        )?;
        Ok(())
    }

    pub fn snapshots_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Snapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_id, agent_id, observed_at, signals_json FROM snapshots
             WHERE agent_id = ?1 ORDER BY observed_at DESC, snapshot_id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id.to_lowercase(), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? as u64,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (snapshot_id, agent_id, observed_at, signals_json) = row?;
            out.push(Snapshot {
                snapshot_id,
                agent_id,
                observed_at,
                signals: serde_json::from_str(&signals_json)?,
            });
        }
        Ok(out)
    }

    pub fn insert_risk_report(&self, report: &RiskReport) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO risk_reports
             (report_id, agent_id, generated_at, overall_risk, confidence, report_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.report_id,
                report.agent_id.to_lowercase(),
                report.generated_at as i64,
                report.overall_risk as i64,
                report.confidence.as_str(),
                serde_json::to_string(report)?,
            ],
        )?;
        Ok(())
    }

    pub fn latest_risk_report(&self, agent_id: &str) -> Result<Option<RiskReport>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT report_json FROM risk_reports WHERE agent_id = ?1
                 ORDER BY generated_at DESC, report_id LIMIT 1",
                params![agent_id.to_lowercase()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    pub fn insert_alert(&self, alert: &Alert) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO alerts
             (alert_id, agent_id, severity, type, description, evidence_json, created_at, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                alert.alert_id,
                alert.agent_id.to_lowercase(),
                alert.severity.as_str(),
                alert.alert_type,
                alert.description,
                serde_json::to_string(&alert.evidence)?,
                alert.created_at as i64,
                alert.is_active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn alerts_for_agent(&self, agent_id: &str, active_only: bool) -> Result<Vec<Value>> {
        let sql = if active_only {
            "SELECT alert_id, severity, type, description, evidence_json, created_at, is_active
             FROM alerts WHERE agent_id = ?1 AND is_active = 1 ORDER BY created_at DESC"
        } else {
            "SELECT alert_id, severity, type, description, evidence_json, created_at, is_active
             FROM alerts WHERE agent_id = ?1 ORDER BY created_at DESC"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![agent_id.to_lowercase()], |row| {
            Ok(serde_json::json!({
                "alertId": row.get::<_, String>(0)?,
                "agentId": agent_id.to_lowercase(),
                "severity": row.get::<_, String>(1)?,
                "type": row.get::<_, String>(2)?,
                "description": row.get::<_, String>(3)?,
                "evidence": serde_json::from_str::<Value>(&row.get::<_, String>(4)?)
                    .unwrap_or(Value::Array(Vec::new())),
                "createdAt": row.get::<_, i64>(5)?,
                "isActive": row.get::<_, i64>(6)? != 0,
            }))
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// isActive transitions true → false only.
    pub fn deactivate_alert(&self, alert_id: &str) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE alerts SET is_active = 0 WHERE alert_id = ?1",
            params![alert_id],
        )?;
        Ok(n > 0)
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn identity_cursor(&self, chain_id: u64, registry: &str) -> Result<Option<u64>> {
        self.conn
            .query_row(
                "SELECT last_block FROM identity_cursor
                 WHERE chain_id = ?1 AND registry_address = ?2",
                params![chain_id as i64, registry.to_lowercase()],
                |row| row.get::<_, i64>(0).map(|v| v as u64),
            )
            .optional()
            .context("loading identity cursor")
    }

    pub fn set_identity_cursor(
        &self,
        chain_id: u64,
        registry: &str,
        last_block: u64,
        now: u64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO identity_cursor (chain_id, registry_address, last_block, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chain_id, registry_address)
             DO UPDATE SET last_block = ?3, updated_at = ?4",
            params![chain_id as i64, registry.to_lowercase(), last_block as i64, now as i64],
        )?;
        Ok(())
    }

    /// Content-addressed event id neutralises duplicates from the overlap
    /// re-scan: returns true when the row is new.
    pub fn insert_identity_event(&self, event: &IdentityEventRow) -> Result<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO identity_events
             (event_id, chain_id, registry_address, agent_token_id, agent_uri, owner_address,
              event_type, block_number, tx_hash, log_index, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.event_id,
                event.chain_id as i64,
                event.registry_address.to_lowercase(),
                event.agent_token_id as i64,
                event.agent_uri,
                event.owner_address.as_ref().map(|a| a.to_lowercase()),
                event.event_type,
                event.block_number as i64,
                event.tx_hash.to_lowercase(),
                event.log_index as i64,
                event.discovered_at as i64,
            ],
        )?;
        Ok(n > 0)
    }

    pub fn earliest_identity_event(
        &self,
        chain_id: u64,
        registry: &str,
        token_id: u64,
    ) -> Result<Option<(u64, String)>> {
        self.conn
            .query_row(
                "SELECT block_number, event_id FROM identity_events
                 WHERE chain_id = ?1 AND registry_address = ?2 AND agent_token_id = ?3
                 ORDER BY block_number ASC, log_index ASC LIMIT 1",
                params![chain_id as i64, registry.to_lowercase(), token_id as i64],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("loading earliest identity event")
    }

    pub fn latest_agent_uri(
        &self,
        chain_id: u64,
        registry: &str,
        token_id: u64,
    ) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT agent_uri FROM identity_events
                 WHERE chain_id = ?1 AND registry_address = ?2 AND agent_token_id = ?3
                   AND agent_uri IS NOT NULL
                 ORDER BY block_number DESC, log_index DESC LIMIT 1",
                params![chain_id as i64, registry.to_lowercase(), token_id as i64],
                |row| row.get(0),
            )
            .optional()
            .context("loading latest agent uri")
    }

    pub fn latest_owner(
        &self,
        chain_id: u64,
        registry: &str,
        token_id: u64,
    ) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT owner_address FROM identity_events
                 WHERE chain_id = ?1 AND registry_address = ?2 AND agent_token_id = ?3
                   AND owner_address IS NOT NULL
                 ORDER BY block_number DESC, log_index DESC LIMIT 1",
                params![chain_id as i64, registry.to_lowercase(), token_id as i64],
                |row| row.get(0),
            )
            .optional()
            .context("loading latest owner")
    }

    pub fn insert_identity_snapshot(
        &self,
        snapshot_id: &str,
        agent_id: &str,
        agent_uri: &str,
        fetch_status: CardFetchStatus,
        card_hash: Option<&str>,
        card_json: Option<&Value>,
        fetched_at: u64,
        http_status: Option<u16>,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO identity_snapshots
             (snapshot_id, agent_id, agent_uri, fetch_status, card_hash, card_json,
              fetched_at, http_status, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                snapshot_id,
                agent_id.to_lowercase(),
                agent_uri,
                fetch_status.as_str(),
                card_hash,
                card_json.map(|v| v.to_string()),
                fetched_at as i64,
                http_status.map(|s| s as i64),
                error_message,
            ],
        )?;
        Ok(())
    }

    pub fn card_observations(&self, agent_id: &str, limit: usize) -> Result<Vec<CardObservation>> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_id, fetch_status, card_hash, fetched_at FROM identity_snapshots
             WHERE agent_id = ?1 ORDER BY fetched_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id.to_lowercase(), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)? as u64,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (snapshot_id, status, card_hash, fetched_at) = row?;
            out.push(CardObservation {
                snapshot_id,
                fetch_status: CardFetchStatus::parse(&status)
                    .unwrap_or(CardFetchStatus::Unreachable),
                card_hash,
                fetched_at,
            });
        }
        Ok(out)
    }

    // =========================================================================
    // Context
    // =========================================================================

    pub fn context_cursor(&self, agent_id: &str, chain_id: u64) -> Result<Option<u64>> {
        self.conn
            .query_row(
                "SELECT last_block FROM context_cursor WHERE agent_id = ?1 AND chain_id = ?2",
                params![agent_id.to_lowercase(), chain_id as i64],
                |row| row.get::<_, i64>(0).map(|v| v as u64),
            )
            .optional()
            .context("loading context cursor")
    }

    pub fn set_context_cursor(
        &self,
        agent_id: &str,
        chain_id: u64,
        last_block: u64,
        now: u64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO context_cursor (agent_id, chain_id, last_block, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_id, chain_id) DO UPDATE SET last_block = ?3, updated_at = ?4",
            params![agent_id.to_lowercase(), chain_id as i64, last_block as i64, now as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use crate::scoring::{score_agent, EvidenceRef, Signal};

    fn store() -> Store {
        let mut store = Store::open_in_memory().unwrap();
        store.migrate(None, 1_700_000_000).unwrap();
        store
    }

    fn snapshot(agent: &str) -> Snapshot {
        Snapshot::build(
            agent,
            vec![Signal::new(
                "ID_NEWBORN",
                Severity::Medium,
                0.3,
                1_700_000_000,
                vec![EvidenceRef::new("event", "0xev")],
            )],
            1_700_000_000,
        )
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut store = store();
        store.migrate(None, 1_700_000_100).unwrap();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn migrations_from_directory_sorted() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("0002_labels.sql"),
            "CREATE TABLE extra_two (id TEXT PRIMARY KEY);",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("0001_base.sql"),
            "CREATE TABLE extra_one (id TEXT PRIMARY KEY);",
        )
        .unwrap();
        let mut store = Store::open_in_memory().unwrap();
        store.migrate(Some(dir.path()), 0).unwrap();
        let names: Vec<String> = {
            let mut stmt =
                store.conn.prepare("SELECT name FROM _migrations ORDER BY name").unwrap();
            stmt.query_map([], |r| r.get(0))
                .unwrap()
                .collect::<std::result::Result<_, _>>()
                .unwrap()
        };
        assert_eq!(names, vec!["0001_base.sql", "0002_labels.sql"]);
    }

    #[test]
    fn agent_round_trip_lowercases_ids() {
        let store = store();
        store.upsert_agent("erc8004:1:0xREG:7", 1_700_000_000).unwrap();
        let agent = store.get_agent("ERC8004:1:0xreg:7").unwrap().unwrap();
        assert_eq!(agent.agent_id, "erc8004:1:0xreg:7");
        assert_eq!(agent.status, "ACTIVE");
        assert!(store.set_agent_status("erc8004:1:0xreg:7", "PROBATION").unwrap());
    }

    #[test]
    fn score_persist_and_list() {
        let store = store();
        let agent = "erc8004:1:0xreg:7";
        store.upsert_agent(agent, 1_700_000_000).unwrap();

        let snap = snapshot(agent);
        store.insert_snapshot(&snap).unwrap();
        // identical snapshot id is a no-op
        store.insert_snapshot(&snap).unwrap();
        assert_eq!(store.snapshots_for_agent(agent, 10).unwrap().len(), 1);

        let critical = Snapshot::build(
            agent,
            vec![Signal::new(
                "BE_ARTIFACT_HASH_MISMATCH",
                Severity::Critical,
                1.0,
                0,
                vec![EvidenceRef::new("path", "out/a")],
            )],
            0,
        );
        let outcome = score_agent(agent, &[snap, critical], 1_700_000_050);
        store.insert_risk_report(&outcome.report).unwrap();
        for alert in &outcome.alerts {
            store.insert_alert(alert).unwrap();
        }

        let latest = store.latest_risk_report(agent).unwrap().unwrap();
        assert_eq!(latest.report_id, outcome.report.report_id);
        assert_eq!(latest.overall_risk, 100);

        let listed = store.list_agents().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].latest_risk, Some(100));
        assert_eq!(listed[0].active_alert_count, 1);

        let alerts = store.alerts_for_agent(agent, true).unwrap();
        assert_eq!(alerts.len(), 1);
        let alert_id = alerts[0]["alertId"].as_str().unwrap().to_string();
        assert!(store.deactivate_alert(&alert_id).unwrap());
        assert!(store.alerts_for_agent(agent, true).unwrap().is_empty());
        assert_eq!(store.alerts_for_agent(agent, false).unwrap().len(), 1);
    }

    #[test]
    fn identity_event_dedup_and_earliest() {
        let store = store();
        let event = IdentityEventRow {
            event_id: "e1".to_string(),
            chain_id: 1,
            registry_address: "0xREG".to_string(),
            agent_token_id: 7,
            agent_uri: Some("https://a.example/card.json".to_string()),
            owner_address: Some("0xOWNER".to_string()),
            event_type: "AgentRegistered".to_string(),
            block_number: 100,
            tx_hash: "0xT1".to_string(),
            log_index: 0,
            discovered_at: 1_700_000_000,
        };
        assert!(store.insert_identity_event(&event).unwrap());
        assert!(!store.insert_identity_event(&event).unwrap());

        let later = IdentityEventRow {
            event_id: "e2".to_string(),
            block_number: 200,
            agent_uri: Some("https://a.example/card2.json".to_string()),
            event_type: "AgentUriUpdated".to_string(),
            ..event.clone()
        };
        store.insert_identity_event(&later).unwrap();

        let (block, id) = store.earliest_identity_event(1, "0xreg", 7).unwrap().unwrap();
        assert_eq!(block, 100);
        assert_eq!(id, "e1");
        assert_eq!(
            store.latest_agent_uri(1, "0xreg", 7).unwrap().as_deref(),
            Some("https://a.example/card2.json")
        );
    }

    #[test]
    fn cursors_round_trip() {
        let store = store();
        assert_eq!(store.identity_cursor(1, "0xreg").unwrap(), None);
        store.set_identity_cursor(1, "0xreg", 500, 1_700_000_000).unwrap();
        store.set_identity_cursor(1, "0xreg", 700, 1_700_000_100).unwrap();
        assert_eq!(store.identity_cursor(1, "0xREG").unwrap(), Some(700));

        store.set_context_cursor("agent-a", 1, 900, 1_700_000_000).unwrap();
        assert_eq!(store.context_cursor("AGENT-A", 1).unwrap(), Some(900));
        assert_eq!(store.context_cursor("agent-b", 1).unwrap(), None);
    }

    #[test]
    fn card_observations_parse_statuses() {
        let store = store();
        store
            .insert_identity_snapshot(
                "s1",
                "agent-a",
                "https://a.example/card.json",
                CardFetchStatus::Ok,
                Some("hash-1"),
                Some(&serde_json::json!({"name": "a"})),
                1_700_000_000,
                Some(200),
                None,
            )
            .unwrap();
        store
            .insert_identity_snapshot(
                "s2",
                "agent-a",
                "https://a.example/card.json",
                CardFetchStatus::Timeout,
                None,
                None,
                1_700_000_100,
                None,
                Some("deadline exceeded"),
            )
            .unwrap();
        let observations = store.card_observations("agent-a", 10).unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].fetch_status, CardFetchStatus::Timeout);
        assert_eq!(observations[1].card_hash.as_deref(), Some("hash-1"));
    }
}
