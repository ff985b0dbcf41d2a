//! Behaviour signals: evidence verification of solver manifests.
//!
//! A manifest declares the artifacts a solver run produced; verification
//! re-hashes everything on disk and refuses paths that escape the run
//! directory. Failures with the same code collapse into one signal whose
//! evidence lists every offending path.

use std::fs;
use std::path::{Component, Path};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::sha256_hex;
use crate::errors::ManifestFailureCode;
use crate::logging::{json_log, obj, v_str, Domain};
use crate::model::Severity;
use crate::scoring::{EvidenceRef, Signal};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEntry {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverManifest {
    pub manifest_version: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_id: Option<String>,
    pub artifacts: Vec<ArtifactEntry>,
    /// Optional list of delivered artifact paths; must match `artifacts`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationFailure {
    pub code: ManifestFailureCode,
    pub path: String,
    pub detail: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub ok: bool,
    pub failures: Vec<VerificationFailure>,
    pub manifest_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

fn fail(code: ManifestFailureCode, path: &str, detail: String) -> VerificationFailure {
    VerificationFailure { code, path: path.to_string(), detail }
}

/// A declared path is unsafe when it contains `..`, is absolute, or
/// would otherwise escape the run directory.
fn is_unsafe_path(raw: &str) -> bool {
    let path = Path::new(raw);
    if path.is_absolute() {
        return true;
    }
    path.components().any(|c| matches!(c, Component::ParentDir | Component::RootDir))
}

/// Verify a solver manifest against the receipt-declared hash and the run
/// directory contents. Failures come back sorted by (code, path) so
/// output is stable.
pub fn verify_manifest(
    manifest_path: &Path,
    run_dir: &Path,
    expected_manifest_sha256: Option<&str>,
) -> Result<VerificationReport> {
    let mut failures: Vec<VerificationFailure> = Vec::new();

    let bytes = match fs::read(manifest_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            failures.push(fail(
                ManifestFailureCode::ManifestNotFound,
                &manifest_path.display().to_string(),
                err.to_string(),
            ));
            return Ok(finish(failures, None, None));
        }
    };
    let manifest_sha256 = sha256_hex(&bytes);

    if let Some(expected) = expected_manifest_sha256 {
        if !manifest_sha256.eq_ignore_ascii_case(expected.trim_start_matches("0x")) {
            failures.push(fail(
                ManifestFailureCode::ManifestHashMismatch,
                &manifest_path.display().to_string(),
                format!("declared {} computed {}", expected, manifest_sha256),
            ));
        }
    }

    let manifest: SolverManifest = match serde_json::from_slice(&bytes) {
        Ok(manifest) => manifest,
        Err(err) => {
            failures.push(fail(
                ManifestFailureCode::ManifestSchemaInvalid,
                &manifest_path.display().to_string(),
                err.to_string(),
            ));
            return Ok(finish(failures, Some(manifest_sha256), None));
        }
    };

    if let Some(delivered) = &manifest.delivered {
        let mut declared: Vec<&str> = manifest.artifacts.iter().map(|a| a.path.as_str()).collect();
        let mut listed: Vec<&str> = delivered.iter().map(|s| s.as_str()).collect();
        declared.sort_unstable();
        listed.sort_unstable();
        if declared != listed {
            failures.push(fail(
                ManifestFailureCode::DeliveredMismatch,
                &manifest_path.display().to_string(),
                format!("{} delivered vs {} declared", listed.len(), declared.len()),
            ));
        }
    }

    for artifact in &manifest.artifacts {
        if is_unsafe_path(&artifact.path) {
            failures.push(fail(
                ManifestFailureCode::UnsafePath,
                &artifact.path,
                "path escapes the run directory".to_string(),
            ));
            continue;
        }
        let full = run_dir.join(&artifact.path);
        let metadata = match fs::metadata(&full) {
            Ok(metadata) => metadata,
            Err(_) => {
                failures.push(fail(
                    ManifestFailureCode::ArtifactNotFound,
                    &artifact.path,
                    "artifact missing from run directory".to_string(),
                ));
                continue;
            }
        };
        if metadata.len() != artifact.size_bytes {
            failures.push(fail(
                ManifestFailureCode::ArtifactSizeMismatch,
                &artifact.path,
                format!("declared {} bytes, found {}", artifact.size_bytes, metadata.len()),
            ));
            continue;
        }
        match fs::read(&full) {
            Ok(contents) => {
                let digest = sha256_hex(&contents);
                if !digest.eq_ignore_ascii_case(artifact.sha256.trim_start_matches("0x")) {
                    failures.push(fail(
                        ManifestFailureCode::ArtifactHashMismatch,
                        &artifact.path,
                        format!("declared {} computed {}", artifact.sha256, digest),
                    ));
                }
            }
            Err(err) => {
                failures.push(fail(
                    ManifestFailureCode::ArtifactNotFound,
                    &artifact.path,
                    err.to_string(),
                ));
            }
        }
    }

    Ok(finish(failures, Some(manifest_sha256), Some(manifest.run_id)))
}

fn finish(
    mut failures: Vec<VerificationFailure>,
    manifest_sha256: Option<String>,
    run_id: Option<String>,
) -> VerificationReport {
    failures.sort_by(|a, b| a.code.as_str().cmp(b.code.as_str()).then(a.path.cmp(&b.path)));
    json_log(
        Domain::Scoring,
        "manifest_verified",
        obj(&[
            ("ok", json!(failures.is_empty())),
            ("failures", json!(failures.len())),
            ("run_id", run_id.as_deref().map(v_str).unwrap_or(serde_json::Value::Null)),
        ]),
    );
    VerificationReport { ok: failures.is_empty(), failures, manifest_sha256, run_id }
}

fn signal_id_for(code: ManifestFailureCode) -> &'static str {
    match code {
        ManifestFailureCode::ArtifactHashMismatch => "BE_ARTIFACT_HASH_MISMATCH",
        ManifestFailureCode::ArtifactSizeMismatch => "BE_ARTIFACT_SIZE_MISMATCH",
        ManifestFailureCode::ArtifactNotFound => "BE_ARTIFACT_MISSING",
        ManifestFailureCode::ManifestHashMismatch => "BE_MANIFEST_HASH_MISMATCH",
        ManifestFailureCode::ManifestNotFound => "BE_MANIFEST_MISSING",
        ManifestFailureCode::ManifestSchemaInvalid => "BE_MANIFEST_SCHEMA_INVALID",
        ManifestFailureCode::UnsafePath => "BE_UNSAFE_PATH",
        ManifestFailureCode::DeliveredMismatch => "BE_DELIVERED_MISMATCH",
    }
}

/// Fold a verification report into behaviour signals. Success yields one
/// weak LOW signal; every failure code present yields one CRITICAL signal
/// carrying all offending paths as evidence.
pub fn behavior_signals(report: &VerificationReport, observed_at: u64) -> Vec<Signal> {
    if report.ok {
        let mut evidence = Vec::new();
        if let Some(run_id) = &report.run_id {
            evidence.push(EvidenceRef::new("run", run_id));
        }
        return vec![Signal::new("BE_VERIFIED_OK", Severity::Low, 0.1, observed_at, evidence)];
    }

    let mut by_code: std::collections::BTreeMap<ManifestFailureCode, Vec<EvidenceRef>> =
        std::collections::BTreeMap::new();
    for failure in &report.failures {
        by_code
            .entry(failure.code)
            .or_default()
            .push(EvidenceRef::new("path", &failure.path));
    }
    by_code
        .into_iter()
        .map(|(code, evidence)| {
            Signal::new(signal_id_for(code), Severity::Critical, 1.0, observed_at, evidence)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(dir: &TempDir, artifacts: &[(&str, &[u8])]) -> std::path::PathBuf {
        let entries: Vec<serde_json::Value> = artifacts
            .iter()
            .map(|(path, content)| {
                json!({
                    "path": path,
                    "sha256": sha256_hex(content),
                    "sizeBytes": content.len(),
                })
            })
            .collect();
        let manifest = json!({
            "manifestVersion": "0.1.0",
            "runId": "run-42",
            "artifacts": entries,
        });
        let path = dir.path().join("manifest.json");
        fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();
        path
    }

    #[test]
    fn clean_run_verifies_ok() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("out")).unwrap();
        fs::write(dir.path().join("out/result.json"), b"{\"ok\":true}").unwrap();
        let manifest = write_manifest(&dir, &[("out/result.json", b"{\"ok\":true}")]);

        let report = verify_manifest(&manifest, dir.path(), None).unwrap();
        assert!(report.ok, "failures: {:?}", report.failures);

        let signals = behavior_signals(&report, 0);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_id, "BE_VERIFIED_OK");
        assert_eq!(signals[0].severity, Severity::Low);
        assert!((signals[0].weight - 0.1).abs() < 1e-9);
    }

    #[test]
    fn declared_hash_mismatch_is_flagged() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(&dir, &[]);
        let report = verify_manifest(&manifest, dir.path(), Some(&"0".repeat(64))).unwrap();
        assert!(!report.ok);
        assert_eq!(report.failures[0].code, ManifestFailureCode::ManifestHashMismatch);
    }

    #[test]
    fn schema_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, b"{ not json").unwrap();
        let report = verify_manifest(&path, dir.path(), None).unwrap();
        assert_eq!(report.failures[0].code, ManifestFailureCode::ManifestSchemaInvalid);
    }

    #[test]
    fn unsafe_paths_rejected_without_stat() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(&dir, &[("../escape.txt", b"x"), ("/etc/passwd", b"y")]);
        let report = verify_manifest(&manifest, dir.path(), None).unwrap();
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.code == ManifestFailureCode::UnsafePath));
        // sorted by (code, path)
        assert_eq!(report.failures[0].path, "../escape.txt");
    }

    #[test]
    fn size_and_hash_mismatches_and_missing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("wrong-size.bin"), b"longer than declared").unwrap();
        fs::write(dir.path().join("wrong-hash.bin"), b"bbbb").unwrap();

        let entries = json!({
            "manifestVersion": "0.1.0",
            "runId": "run-1",
            "artifacts": [
                { "path": "wrong-size.bin", "sha256": sha256_hex(b"x"), "sizeBytes": 1 },
                { "path": "wrong-hash.bin", "sha256": sha256_hex(b"aaaa"), "sizeBytes": 4 },
                { "path": "absent.bin", "sha256": sha256_hex(b"z"), "sizeBytes": 1 },
            ],
        });
        let path = dir.path().join("manifest.json");
        fs::write(&path, serde_json::to_vec(&entries).unwrap()).unwrap();

        let report = verify_manifest(&path, dir.path(), None).unwrap();
        let codes: Vec<ManifestFailureCode> =
            report.failures.iter().map(|f| f.code).collect();
        // sorted by code string, then path
        assert_eq!(
            codes,
            vec![
                ManifestFailureCode::ArtifactHashMismatch,
                ManifestFailureCode::ArtifactNotFound,
                ManifestFailureCode::ArtifactSizeMismatch,
            ]
        );

        let signals = behavior_signals(&report, 5);
        assert_eq!(signals.len(), 3);
        assert!(signals.iter().all(|s| s.severity == Severity::Critical));
        let ids: Vec<&str> = signals.iter().map(|s| s.signal_id.as_str()).collect();
        assert!(ids.contains(&"BE_ARTIFACT_MISSING"));
    }

    #[test]
    fn same_code_failures_collapse_into_one_signal() {
        let dir = TempDir::new().unwrap();
        let manifest = write_manifest(&dir, &[("../a", b"x"), ("../b", b"y")]);
        let report = verify_manifest(&manifest, dir.path(), None).unwrap();
        let signals = behavior_signals(&report, 0);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_id, "BE_UNSAFE_PATH");
        assert_eq!(signals[0].evidence.len(), 2);
    }

    #[test]
    fn delivered_mismatch() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let manifest = json!({
            "manifestVersion": "0.1.0",
            "runId": "run-1",
            "artifacts": [{ "path": "a.txt", "sha256": sha256_hex(b"a"), "sizeBytes": 1 }],
            "delivered": ["a.txt", "phantom.txt"],
        });
        let path = dir.path().join("manifest.json");
        fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();
        let report = verify_manifest(&path, dir.path(), None).unwrap();
        assert!(report
            .failures
            .iter()
            .any(|f| f.code == ManifestFailureCode::DeliveredMismatch));
    }
}
