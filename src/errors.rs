//! Stable error kinds shared across the watchtower.
//!
//! Application plumbing uses `anyhow::Result`; these kinds exist so that
//! callers (the executor, the API layer, the evidence store) can match on
//! failure class without string inspection.

use thiserror::Error;

/// Typed code set for solver-manifest verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManifestFailureCode {
    ManifestHashMismatch,
    ManifestSchemaInvalid,
    ManifestNotFound,
    ArtifactHashMismatch,
    ArtifactSizeMismatch,
    ArtifactNotFound,
    UnsafePath,
    DeliveredMismatch,
}

impl ManifestFailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManifestHashMismatch => "MANIFEST_HASH_MISMATCH",
            Self::ManifestSchemaInvalid => "MANIFEST_SCHEMA_INVALID",
            Self::ManifestNotFound => "MANIFEST_NOT_FOUND",
            Self::ArtifactHashMismatch => "ARTIFACT_HASH_MISMATCH",
            Self::ArtifactSizeMismatch => "ARTIFACT_SIZE_MISMATCH",
            Self::ArtifactNotFound => "ARTIFACT_NOT_FOUND",
            Self::UnsafePath => "UNSAFE_PATH",
            Self::DeliveredMismatch => "DELIVERED_MISMATCH",
        }
    }
}

impl std::fmt::Display for ManifestFailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum WatchtowerError {
    /// Schema mismatch on config, manifest, agent card or evidence record.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Filesystem or network failure.
    #[error("io failure: {0}")]
    Io(String),

    /// Receipt, dispute or agent missing on chain or in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotency-ledger violation: the receipt already has an action.
    #[error("action already recorded for receipt {receipt_id}")]
    ActionAlreadyRecorded { receipt_id: String },

    /// Signing service failure, with the service status attached.
    #[error("signer failure ({backend}): {detail}")]
    Signer { backend: String, detail: String },

    /// Fail-fast while the upstream is unhealthy.
    #[error("circuit open: retry in {remaining_ms}ms after {failures} failures")]
    CircuitOpen { remaining_ms: u64, failures: u32 },

    /// Per-rule timeout, converted to a per-rule error result by the engine.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Card fetch resolved to a private address or used a disallowed scheme.
    #[error("ssrf blocked: {0}")]
    SsrfBlocked(String),

    /// Unrecoverable startup failure; the process exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for WatchtowerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_codes_render_screaming_snake() {
        assert_eq!(ManifestFailureCode::UnsafePath.as_str(), "UNSAFE_PATH");
        assert_eq!(
            serde_json::to_string(&ManifestFailureCode::ArtifactNotFound).unwrap(),
            "\"ARTIFACT_NOT_FOUND\""
        );
    }

    #[test]
    fn circuit_open_message_carries_timing() {
        let err = WatchtowerError::CircuitOpen { remaining_ms: 1500, failures: 5 };
        assert!(err.to_string().contains("1500ms"));
        assert!(err.to_string().contains("5 failures"));
    }
}
