//! Persistent per-chain block cursor.
//!
//! Monotonic non-decreasing; a write with `new < current` fails and
//! `new == current` is idempotent. A stored cursor whose chainId differs
//! from the configured one is treated as empty so two chains can never be
//! cross-wired through a shared state directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::logging::{json_log, obj, v_str, Domain};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorFile {
    #[serde(with = "crate::model::u64_string")]
    last_processed_block: u64,
    updated_at: String,
    chain_id: u64,
}

pub struct BlockCursor {
    path: PathBuf,
    chain_id: u64,
    current: Option<u64>,
}

impl BlockCursor {
    /// Load (or initialise empty) the cursor for one chain.
    pub fn open(state_dir: &Path, chain_id: u64) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;
        let path = state_dir.join(format!("cursor-{}.json", chain_id));
        let current = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CursorFile>(&raw) {
                Ok(file) if file.chain_id == chain_id => Some(file.last_processed_block),
                Ok(file) => {
                    json_log(
                        Domain::Chain,
                        "cursor_chain_mismatch",
                        obj(&[
                            ("stored_chain_id", serde_json::json!(file.chain_id)),
                            ("configured_chain_id", serde_json::json!(chain_id)),
                            ("path", v_str(&path.display().to_string())),
                        ]),
                    );
                    None
                }
                Err(err) => {
                    json_log(
                        Domain::Chain,
                        "cursor_unreadable",
                        obj(&[("error", v_str(&err.to_string()))]),
                    );
                    None
                }
            },
            Err(_) => None,
        };
        Ok(Self { path, chain_id, current })
    }

    pub fn get(&self) -> Option<u64> {
        self.current
    }

    /// Advance the cursor. Equal writes are idempotent no-ops.
    pub fn update(&mut self, block: u64, clock: &dyn Clock) -> Result<()> {
        if let Some(current) = self.current {
            if block < current {
                bail!("cursor regression: {} < {}", block, current);
            }
            if block == current {
                return Ok(());
            }
        }
        let file = CursorFile {
            last_processed_block: block,
            updated_at: crate::clock::iso_from_seconds(clock.now_seconds()),
            chain_id: self.chain_id,
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        fs::rename(&tmp, &self.path)?;
        self.current = Some(block);
        Ok(())
    }

    /// First block of the next scan:
    /// `max(tip − lookback, 1)` on an empty cursor, else
    /// `min(cursor + 1, tip − confirmations)`.
    pub fn start_block(&self, tip: u64, lookback: u64, confirmations: u64) -> u64 {
        let safe = tip.saturating_sub(confirmations);
        match self.current {
            Some(cursor) => (cursor + 1).min(safe),
            None => tip.saturating_sub(lookback).max(1).min(safe.max(1)),
        }
    }

    /// Scan range for one tick: `(start, end)` or None when there is
    /// nothing safe to do yet.
    ///
    /// ```text
    /// safe  = tip − confirmations
    /// start = cursor+1 if present else max(tip − lookback, 1)
    /// start = min(start, safe); end = safe
    /// ```
    pub fn scan_range(&self, tip: u64, lookback: u64, confirmations: u64) -> Option<(u64, u64)> {
        let safe = tip.saturating_sub(confirmations);
        if safe == 0 {
            return None;
        }
        // a cursor already at the safe head has nothing new to process
        if let Some(cursor) = self.current {
            if cursor >= safe {
                return None;
            }
        }
        let start = self.start_block(tip, lookback, confirmations);
        if start > safe {
            return None;
        }
        Some((start, safe))
    }
}
