//! JSON-RPC chain provider over HTTP.
//!
//! Every outbound call goes through the retry policy and the per-chain
//! circuit breaker. Transaction history comes from an explorer-style
//! index endpoint because chain nodes cannot answer address queries.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use super::abi;
use super::{ChainEvent, ChainProvider, EventFilter, TxRecord};
use crate::logging::{json_log, obj, v_str, Domain};
use crate::resilience::circuit::CircuitBreaker;
use crate::resilience::resilient;
use crate::resilience::retry::RetryPolicy;

/// Known event shapes the watchtower decodes. Everything else surfaces
/// with raw topics/data so rules can still correlate by tx hash.
struct EventAbi {
    name: &'static str,
    signature: &'static str,
    /// Names for topics[1..] in order.
    indexed: &'static [&'static str],
    /// Names for data words / dynamic tail in order; a leading '&' marks a
    /// dynamic string decoded via its offset word.
    data: &'static [&'static str],
}

const KNOWN_EVENTS: &[EventAbi] = &[
    EventAbi {
        name: "DelegatedPaymentSettled",
        signature: "DelegatedPaymentSettled(bytes32,address,uint256)",
        indexed: &["delegationHash", "payer"],
        data: &["amount"],
    },
    EventAbi {
        name: "ReceiptPosted",
        signature: "ReceiptPosted(bytes32,bytes32,address,uint256)",
        indexed: &["receiptId", "intentHash"],
        data: &["solver", "deadline"],
    },
    EventAbi {
        name: "DisputeOpened",
        signature: "DisputeOpened(bytes32,bytes32,address)",
        indexed: &["disputeId", "receiptId"],
        data: &["challenger"],
    },
    EventAbi {
        name: "AgentRegistered",
        signature: "AgentRegistered(uint256,address,string)",
        indexed: &["tokenId", "owner"],
        data: &["&agentUri"],
    },
    EventAbi {
        name: "AgentUriUpdated",
        signature: "AgentUriUpdated(uint256,string)",
        indexed: &["tokenId"],
        data: &["&agentUri"],
    },
    EventAbi {
        name: "AgentTransferred",
        signature: "AgentTransferred(uint256,address,address)",
        indexed: &["tokenId", "from", "to"],
        data: &[],
    },
];

pub struct RpcProvider {
    chain_id: u64,
    url: String,
    tx_index_url: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl RpcProvider {
    pub fn new(
        chain_id: u64,
        url: &str,
        tx_index_url: Option<String>,
        retry: RetryPolicy,
        breaker: Arc<Mutex<CircuitBreaker>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building rpc http client")?;
        Ok(Self { chain_id, url: url.to_string(), tx_index_url, client, retry, breaker })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let url = self.url.clone();
        let client = self.client.clone();
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        resilient(&self.retry, &self.breaker, method, || {
            let client = client.clone();
            let url = url.clone();
            let body = body.clone();
            async move {
                let resp = client.post(&url).json(&body).send().await?;
                let status = resp.status();
                if !status.is_success() {
                    bail!("rpc http status {}", status.as_u16());
                }
                let payload: Value = resp.json().await?;
                if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
                    bail!("rpc error: {}", err);
                }
                payload
                    .get("result")
                    .cloned()
                    .ok_or_else(|| anyhow!("rpc response missing result"))
            }
        })
        .await
    }

    fn decode_log(&self, log: &Value) -> Option<ChainEvent> {
        let topics: Vec<String> = log
            .get("topics")?
            .as_array()?
            .iter()
            .filter_map(|t| t.as_str().map(|s| s.to_lowercase()))
            .collect();
        let topic0 = topics.first()?.clone();
        let data = log.get("data").and_then(Value::as_str).unwrap_or("0x").to_string();
        let address = log.get("address").and_then(Value::as_str).unwrap_or_default().to_lowercase();
        let block_number = parse_quantity(log.get("blockNumber")?)?;
        let tx_hash = log
            .get("transactionHash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();
        let log_index = parse_quantity(log.get("logIndex")?)?;

        let mut attributes = Map::new();
        let mut name = format!("unknown:{}", &topic0[..topic0.len().min(10)]);

        for known in KNOWN_EVENTS {
            if abi::event_topic(known.signature) != topic0 {
                continue;
            }
            name = known.name.to_string();
            for (i, field) in known.indexed.iter().enumerate() {
                if let Some(topic) = topics.get(i + 1) {
                    attributes.insert((*field).to_string(), decode_topic_value(field, topic));
                }
            }
            let words = abi::decode_words(&data).unwrap_or_default();
            let mut word_idx = 0usize;
            for field in known.data {
                if let Some(stripped) = field.strip_prefix('&') {
                    if let Ok(s) = abi::decode_string_at(&data, word_idx) {
                        attributes.insert(stripped.to_string(), Value::String(s));
                    }
                } else if let Some(word) = words.get(word_idx) {
                    attributes.insert((*field).to_string(), decode_word_value(field, word));
                }
                word_idx += 1;
            }
            break;
        }

        if attributes.is_empty() && name.starts_with("unknown:") {
            attributes.insert("topics".to_string(), json!(topics));
            attributes.insert("data".to_string(), Value::String(data));
        }

        Some(ChainEvent { name, address, block_number, tx_hash, log_index, attributes })
    }
}

fn decode_topic_value(field: &str, topic: &str) -> Value {
    let words = match abi::decode_words(topic) {
        Ok(words) if words.len() == 1 => words,
        _ => return Value::String(topic.to_string()),
    };
    decode_word_value(field, &words[0])
}

/// Field-name driven decoding keeps amounts as decimal strings and
/// addresses lower-case 0x-hex.
fn decode_word_value(field: &str, word: &[u8; 32]) -> Value {
    let lower = field.to_lowercase();
    if lower.contains("amount") || lower.contains("value") || lower.contains("bond") {
        return abi::word_to_u128(word)
            .map(|v| Value::String(v.to_string()))
            .unwrap_or_else(|_| Value::String(abi::word_to_bytes32_hex(word)));
    }
    if lower.contains("tokenid") || lower.contains("deadline") || lower.contains("block") {
        return abi::word_to_u64(word)
            .map(|v| json!(v))
            .unwrap_or_else(|_| Value::String(abi::word_to_bytes32_hex(word)));
    }
    if lower.contains("payer")
        || lower.contains("owner")
        || lower.contains("solver")
        || lower.contains("challenger")
        || lower == "from"
        || lower == "to"
    {
        return Value::String(abi::word_to_address(word));
    }
    Value::String(abi::word_to_bytes32_hex(word))
}

fn parse_quantity(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => {
            let stripped = s.strip_prefix("0x").unwrap_or(s);
            u64::from_str_radix(stripped, 16).ok()
        }
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[async_trait]
impl ChainProvider for RpcProvider {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&result).ok_or_else(|| anyhow!("bad eth_blockNumber result: {}", result))
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64> {
        let result = self
            .request("eth_getBlockByNumber", json!([format!("0x{:x}", block), false]))
            .await?;
        result
            .get("timestamp")
            .and_then(parse_quantity_ref)
            .ok_or_else(|| anyhow!("block {} missing timestamp", block))
    }

    async fn get_events(&self, filter: &EventFilter) -> Result<Vec<ChainEvent>> {
        let mut params = Map::new();
        params.insert("fromBlock".to_string(), json!(format!("0x{:x}", filter.from_block)));
        params.insert("toBlock".to_string(), json!(format!("0x{:x}", filter.to_block)));
        if let Some(address) = &filter.address {
            params.insert("address".to_string(), json!(address));
        }
        if !filter.event_names.is_empty() {
            let topics: Vec<String> = KNOWN_EVENTS
                .iter()
                .filter(|e| filter.event_names.iter().any(|n| n == e.name))
                .map(|e| abi::event_topic(e.signature))
                .collect();
            if !topics.is_empty() {
                params.insert("topics".to_string(), json!([topics]));
            }
        }
        let result = self.request("eth_getLogs", json!([Value::Object(params)])).await?;
        let logs = result.as_array().cloned().unwrap_or_default();
        let mut events: Vec<ChainEvent> =
            logs.iter().filter_map(|log| self.decode_log(log)).collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn call(&self, to: &str, data: &str) -> Result<String> {
        let result = self
            .request("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("bad eth_call result: {}", result))
    }

    async fn send_raw_transaction(&self, raw_hex: &str) -> Result<String> {
        let result = self.request("eth_sendRawTransaction", json!([raw_hex])).await?;
        result
            .as_str()
            .map(|s| s.to_lowercase())
            .ok_or_else(|| anyhow!("bad eth_sendRawTransaction result: {}", result))
    }

    async fn transaction_count(&self, address: &str) -> Result<u64> {
        let result = self
            .request("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_quantity(&result).ok_or_else(|| anyhow!("bad nonce result: {}", result))
    }

    async fn gas_price(&self) -> Result<u128> {
        let result = self.request("eth_gasPrice", json!([])).await?;
        let raw = result.as_str().ok_or_else(|| anyhow!("bad gas price result"))?;
        let stripped = raw.strip_prefix("0x").unwrap_or(raw);
        u128::from_str_radix(stripped, 16).context("gas price not hex")
    }

    async fn get_code(&self, address: &str) -> Result<String> {
        let result = self.request("eth_getCode", json!([address, "latest"])).await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("bad eth_getCode result: {}", result))
    }

    async fn transactions(
        &self,
        address: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TxRecord>> {
        let Some(index_url) = &self.tx_index_url else {
            json_log(
                Domain::Context,
                "tx_index_unconfigured",
                obj(&[("address", v_str(address))]),
            );
            return Ok(Vec::new());
        };
        let url = format!(
            "{}?module=account&action=txlist&address={}&startblock={}&endblock={}&sort=asc",
            index_url, address, from_block, to_block
        );
        let client = self.client.clone();
        let payload: Value = resilient(&self.retry, &self.breaker, "tx_index", || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let resp = client.get(&url).send().await?;
                let status = resp.status();
                if !status.is_success() {
                    bail!("tx index http status {}", status.as_u16());
                }
                Ok(resp.json::<Value>().await?)
            }
        })
        .await?;

        let rows = payload
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut txs = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(tx) = parse_index_row(&row) else { continue };
            txs.push(tx);
        }
        Ok(txs)
    }
}

fn parse_quantity_ref(value: &Value) -> Option<u64> {
    parse_quantity(value)
}

fn parse_index_row(row: &Value) -> Option<TxRecord> {
    Some(TxRecord {
        tx_hash: row.get("hash")?.as_str()?.to_lowercase(),
        from: row.get("from")?.as_str()?.to_lowercase(),
        to: row.get("to").and_then(Value::as_str).unwrap_or_default().to_lowercase(),
        value_wei: row.get("value")?.as_str()?.parse().ok()?,
        block_number: row.get("blockNumber")?.as_str()?.parse().ok()?,
        timestamp: row.get("timeStamp")?.as_str()?.parse().ok()?,
    })
}
