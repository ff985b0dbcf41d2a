//! Chain access: provider seam, on-chain view types, cursor and poller.

pub mod abi;
pub mod context;
pub mod cursor;
pub mod poller;
pub mod rpc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::sha256_hex;

/// Receipt lifecycle as the hub reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Finalized,
    Challenged,
    Disputed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Finalized => "finalized",
            ReceiptStatus::Challenged => "challenged",
            ReceiptStatus::Disputed => "disputed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "pending" => Some(ReceiptStatus::Pending),
            "finalized" => Some(ReceiptStatus::Finalized),
            "challenged" => Some(ReceiptStatus::Challenged),
            "disputed" => Some(ReceiptStatus::Disputed),
            _ => None,
        }
    }
}

/// A receipt still inside (or just past) its challenge window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptView {
    pub receipt_id: String,
    pub intent_hash: String,
    pub solver_id: String,
    pub status: ReceiptStatus,
    /// Unix seconds after which the receipt can no longer be disputed.
    pub challenge_deadline: u64,
    pub created_at: u64,
    #[serde(with = "crate::model::u128_string")]
    pub amount_wei: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeView {
    pub dispute_id: String,
    pub receipt_id: String,
    pub challenger: String,
    pub opened_block: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverView {
    pub solver_id: String,
    #[serde(with = "crate::model::u128_string")]
    pub bond_wei: u128,
    pub active: bool,
    pub registered_block: u64,
}

/// Decoded log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    pub name: String,
    pub address: String,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ChainEvent {
    /// Content-addressed id; duplicate ingestion across overlap windows is
    /// neutralised by this key.
    pub fn event_id(&self, chain_id: u64) -> String {
        event_id(chain_id, &self.tx_hash, self.log_index)
    }
}

pub fn event_id(chain_id: u64, tx_hash: &str, log_index: u64) -> String {
    sha256_hex(format!("{}:{}:{}", chain_id, tx_hash.to_lowercase(), log_index).as_bytes())
}

/// One historical transaction touching an address, for context analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRecord {
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    #[serde(with = "crate::model::u128_string")]
    pub value_wei: u128,
    pub block_number: u64,
    pub timestamp: u64,
}

/// Log filter for `get_events`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub address: Option<String>,
    pub from_block: u64,
    pub to_block: u64,
    pub event_names: Vec<String>,
}

/// One authoritative endpoint per chain. All methods may suspend and fail;
/// callers wrap them in the resilience primitives.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> Result<u64>;

    async fn block_timestamp(&self, block: u64) -> Result<u64>;

    async fn get_events(&self, filter: &EventFilter) -> Result<Vec<ChainEvent>>;

    /// `eth_call`-style read; `data` and the return value are 0x-hex.
    async fn call(&self, to: &str, data: &str) -> Result<String>;

    async fn send_raw_transaction(&self, raw_hex: &str) -> Result<String>;

    async fn transaction_count(&self, address: &str) -> Result<u64>;

    async fn gas_price(&self) -> Result<u128>;

    async fn get_code(&self, address: &str) -> Result<String>;

    /// Transaction history for an address inside a block range. Served by
    /// an indexer endpoint; chain nodes alone cannot answer this.
    async fn transactions(&self, address: &str, from_block: u64, to_block: u64)
        -> Result<Vec<TxRecord>>;
}
