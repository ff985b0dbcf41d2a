//! Transparency log: signed Ed25519 leaves in daily append-only NDJSON
//! files, verifiable offline with nothing but the public key.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::{canonical_json, hash_canonical};
use crate::clock::{date_stem, Clock};
use crate::logging::{json_log, obj, v_str, Domain};

pub const LEAF_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransparencyLeaf {
    pub leaf_version: String,
    pub leaf_id: String,
    pub agent_id: String,
    pub risk_report_hash: String,
    pub overall_risk: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub written_at: u64,
    /// Ed25519 over the canonical signed payload, base64.
    pub watchtower_sig: String,
}

#[derive(Debug, Clone, Default)]
pub struct LeafInput {
    pub agent_id: String,
    pub risk_report_hash: String,
    pub overall_risk: u32,
    pub receipt_id: Option<String>,
    pub run_id: Option<String>,
}

/// leafId excludes writtenAt: identical content signs to the same id no
/// matter when it is written.
fn leaf_id_for(input: &LeafInput) -> String {
    let mut value = json!({
        "agentId": input.agent_id,
        "leafVersion": LEAF_VERSION,
        "overallRisk": input.overall_risk,
        "riskReportHash": input.risk_report_hash,
    });
    if let Some(receipt_id) = &input.receipt_id {
        value["receiptId"] = json!(receipt_id);
    }
    if let Some(run_id) = &input.run_id {
        value["runId"] = json!(run_id);
    }
    hash_canonical(&value)
}

/// The signed payload binds the leaf id and the generation instant.
fn signed_payload(leaf_id: &str, agent_id: &str, risk_report_hash: &str, written_at: u64) -> String {
    canonical_json(&json!({
        "agentId": agent_id,
        "generatedAt": written_at,
        "leafId": leaf_id,
        "leafVersion": LEAF_VERSION,
        "riskReportHash": risk_report_hash,
    }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafError {
    pub line: usize,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSummary {
    pub total_leaves: usize,
    pub valid_leaves: usize,
    pub invalid_leaves: usize,
    pub errors: Vec<LeafError>,
}

pub struct TransparencyLog {
    key: SigningKey,
    log_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl TransparencyLog {
    /// Load the Ed25519 seed from `key_path`, creating it (and parent
    /// directories, with restrictive permissions) on first start.
    pub fn open(key_path: &Path, log_dir: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let key = load_or_create_key(key_path)?;
        fs::create_dir_all(log_dir)
            .with_context(|| format!("creating transparency dir {}", log_dir.display()))?;
        json_log(
            Domain::Transparency,
            "log_opened",
            obj(&[
                ("public_key", v_str(&BASE64.encode(key.verifying_key().to_bytes()))),
                ("log_dir", v_str(&log_dir.display().to_string())),
            ]),
        );
        Ok(Self { key, log_dir: log_dir.to_path_buf(), clock })
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.key.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn create_leaf(&self, input: &LeafInput) -> TransparencyLeaf {
        let leaf_id = leaf_id_for(input);
        let written_at = self.clock.now_seconds();
        let payload =
            signed_payload(&leaf_id, &input.agent_id, &input.risk_report_hash, written_at);
        let signature = self.key.sign(payload.as_bytes());
        TransparencyLeaf {
            leaf_version: LEAF_VERSION.to_string(),
            leaf_id,
            agent_id: input.agent_id.clone(),
            risk_report_hash: input.risk_report_hash.clone(),
            overall_risk: input.overall_risk,
            receipt_id: input.receipt_id.clone(),
            run_id: input.run_id.clone(),
            written_at,
            watchtower_sig: BASE64.encode(signature.to_bytes()),
        }
    }

    pub fn leaf_file_for_date(&self, date: &str) -> PathBuf {
        self.log_dir.join(format!("leaves-{}.ndjson", date))
    }

    /// Append one `\n`-terminated JSON line to today's file.
    pub fn append_leaf(&self, leaf: &TransparencyLeaf) -> Result<PathBuf> {
        let path = self.leaf_file_for_date(&date_stem(self.clock.now_seconds()));
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut line = serde_json::to_string(leaf)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        json_log(
            Domain::Transparency,
            "leaf_appended",
            obj(&[
                ("leaf_id", v_str(&leaf.leaf_id)),
                ("agent_id", v_str(&leaf.agent_id)),
                ("file", v_str(&path.display().to_string())),
            ]),
        );
        Ok(path)
    }

    pub fn create_and_append(&self, input: &LeafInput) -> Result<TransparencyLeaf> {
        let leaf = self.create_leaf(input);
        self.append_leaf(&leaf)?;
        Ok(leaf)
    }

    /// Leaves for one date; missing file reads as empty.
    pub fn read_leaves(&self, date: &str) -> Result<Vec<TransparencyLeaf>> {
        let path = self.leaf_file_for_date(date);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => return Ok(Vec::new()),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

fn load_or_create_key(path: &Path) -> Result<SigningKey> {
    if path.exists() {
        let raw = fs::read_to_string(path)?;
        let bytes = BASE64
            .decode(raw.trim())
            .map_err(|e| anyhow!("transparency key not base64: {}", e))?;
        let seed: [u8; 32] =
            bytes.try_into().map_err(|_| anyhow!("transparency key must be 32 bytes"))?;
        return Ok(SigningKey::from_bytes(&seed));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        restrict_dir(parent);
    }
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    fs::write(path, BASE64.encode(key.to_bytes()))?;
    restrict_file(path);
    Ok(key)
}

fn restrict_dir(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn restrict_file(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Verify one leaf against a public key: recompute the leaf id, then
/// check the Ed25519 signature over the canonical payload.
pub fn verify_leaf(leaf: &TransparencyLeaf, public_key: &VerifyingKey) -> Result<(), String> {
    let input = LeafInput {
        agent_id: leaf.agent_id.clone(),
        risk_report_hash: leaf.risk_report_hash.clone(),
        overall_risk: leaf.overall_risk,
        receipt_id: leaf.receipt_id.clone(),
        run_id: leaf.run_id.clone(),
    };
    let expected = leaf_id_for(&input);
    if expected != leaf.leaf_id {
        return Err("leafId mismatch".to_string());
    }
    let payload =
        signed_payload(&leaf.leaf_id, &leaf.agent_id, &leaf.risk_report_hash, leaf.written_at);
    let sig_bytes = BASE64
        .decode(&leaf.watchtower_sig)
        .map_err(|e| format!("signature not base64: {}", e))?;
    let sig_bytes: [u8; 64] =
        sig_bytes.try_into().map_err(|_| "signature must be 64 bytes".to_string())?;
    let signature = Signature::from_bytes(&sig_bytes);
    public_key
        .verify(payload.as_bytes(), &signature)
        .map_err(|_| "signature invalid".to_string())
}

/// Offline verification of one NDJSON file.
pub fn verify_log_file(path: &Path, public_key: &VerifyingKey) -> Result<VerificationSummary> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading leaf file {}", path.display()))?;
    let mut summary = VerificationSummary {
        total_leaves: 0,
        valid_leaves: 0,
        invalid_leaves: 0,
        errors: Vec::new(),
    };
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        summary.total_leaves += 1;
        let leaf: TransparencyLeaf = match serde_json::from_str(line) {
            Ok(leaf) => leaf,
            Err(err) => {
                summary.invalid_leaves += 1;
                summary.errors.push(LeafError {
                    line: idx + 1,
                    error: format!("PARSE_ERROR: {}", err),
                });
                continue;
            }
        };
        match verify_leaf(&leaf, public_key) {
            Ok(()) => summary.valid_leaves += 1,
            Err(error) => {
                summary.invalid_leaves += 1;
                summary.errors.push(LeafError { line: idx + 1, error });
            }
        }
    }
    Ok(summary)
}
