//! Live `ChainContext` backed by contract views through the provider.
//!
//! The context is pinned to the tick's end block: rules see one stable
//! (block, timestamp) pair for the whole evaluation.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::abi;
use super::{ChainEvent, ChainProvider, DisputeView, EventFilter, ReceiptStatus, ReceiptView, SolverView};
use crate::config::ContractSet;
use crate::rules::ChainContext;

const RECEIPT_WORDS: usize = 7;
const DISPUTE_WORDS: usize = 4;

pub struct LiveChainContext {
    provider: Arc<dyn ChainProvider>,
    contracts: ContractSet,
    challenge_window_seconds: u64,
    current_block: u64,
    block_timestamp: u64,
}

impl LiveChainContext {
    /// Pin a context at `block`; fetches the block timestamp once.
    pub async fn pin(
        provider: Arc<dyn ChainProvider>,
        contracts: ContractSet,
        challenge_window_seconds: u64,
        block: u64,
    ) -> Result<Self> {
        let block_timestamp = provider.block_timestamp(block).await?;
        Ok(Self {
            provider,
            contracts,
            challenge_window_seconds,
            current_block: block,
            block_timestamp,
        })
    }

    fn status_from_word(word: &[u8; 32]) -> ReceiptStatus {
        match word[31] {
            1 => ReceiptStatus::Finalized,
            2 => ReceiptStatus::Challenged,
            3 => ReceiptStatus::Disputed,
            _ => ReceiptStatus::Pending,
        }
    }
}

#[async_trait]
impl ChainContext for LiveChainContext {
    fn current_block(&self) -> u64 {
        self.current_block
    }

    fn block_timestamp(&self) -> u64 {
        self.block_timestamp
    }

    fn chain_id(&self) -> u64 {
        self.provider.chain_id()
    }

    async fn receipts_in_challenge_window(&self) -> Result<Vec<ReceiptView>> {
        let Some(hub) = &self.contracts.intent_receipt_hub else {
            bail!("intent receipt hub address not configured");
        };
        let data = abi::calldata(
            "getReceiptsInWindow(uint256)",
            &[abi::encode_u64(self.challenge_window_seconds)],
        );
        let raw = self.provider.call(hub, &data).await?;
        let items = abi::decode_tuple_array(&raw, RECEIPT_WORDS)?;
        let mut receipts = Vec::with_capacity(items.len());
        for words in items {
            receipts.push(ReceiptView {
                receipt_id: abi::word_to_bytes32_hex(&words[0]),
                intent_hash: abi::word_to_bytes32_hex(&words[1]),
                solver_id: abi::word_to_address(&words[2]),
                status: Self::status_from_word(&words[3]),
                challenge_deadline: abi::word_to_u64(&words[4])?,
                created_at: abi::word_to_u64(&words[5])?,
                amount_wei: abi::word_to_u128(&words[6])?,
            });
        }
        Ok(receipts)
    }

    async fn active_disputes(&self) -> Result<Vec<DisputeView>> {
        let Some(module) = &self.contracts.dispute_module else {
            bail!("dispute module address not configured");
        };
        let data = abi::calldata("getActiveDisputes()", &[]);
        let raw = self.provider.call(module, &data).await?;
        let items = abi::decode_tuple_array(&raw, DISPUTE_WORDS)?;
        let mut disputes = Vec::with_capacity(items.len());
        for words in items {
            disputes.push(DisputeView {
                dispute_id: abi::word_to_bytes32_hex(&words[0]),
                receipt_id: abi::word_to_bytes32_hex(&words[1]),
                challenger: abi::word_to_address(&words[2]),
                opened_block: abi::word_to_u64(&words[3])?,
            });
        }
        Ok(disputes)
    }

    async fn solver_info(&self, solver_id: &str) -> Result<Option<SolverView>> {
        let Some(registry) = &self.contracts.solver_registry else {
            bail!("solver registry address not configured");
        };
        let data = abi::calldata("solvers(address)", &[abi::encode_address(solver_id)?]);
        let raw = self.provider.call(registry, &data).await?;
        let words = abi::decode_words(&raw)?;
        if words.len() < 3 {
            return Ok(None);
        }
        let registered_block = abi::word_to_u64(&words[2])?;
        if registered_block == 0 {
            return Ok(None);
        }
        Ok(Some(SolverView {
            solver_id: solver_id.to_lowercase(),
            bond_wei: abi::word_to_u128(&words[0])?,
            active: abi::word_to_bool(&words[1]),
            registered_block,
        }))
    }

    async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>> {
        self.provider
            .get_events(&EventFilter {
                address: self.contracts.facilitator.clone(),
                from_block,
                to_block,
                event_names: Vec::new(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TxRecord;
    use std::sync::Mutex;

    /// Provider returning canned eth_call payloads keyed by selector.
    struct CannedProvider {
        responses: Mutex<std::collections::HashMap<String, String>>,
    }

    impl CannedProvider {
        fn new() -> Self {
            Self { responses: Mutex::new(std::collections::HashMap::new()) }
        }

        fn respond(&self, signature: &str, payload: String) {
            self.responses
                .lock()
                .unwrap()
                .insert(abi::selector(signature), payload);
        }
    }

    #[async_trait]
    impl ChainProvider for CannedProvider {
        fn chain_id(&self) -> u64 {
            8453
        }

        async fn block_number(&self) -> Result<u64> {
            Ok(2000)
        }

        async fn block_timestamp(&self, _block: u64) -> Result<u64> {
            Ok(1_704_067_200)
        }

        async fn get_events(&self, _filter: &EventFilter) -> Result<Vec<ChainEvent>> {
            Ok(Vec::new())
        }

        async fn call(&self, _to: &str, data: &str) -> Result<String> {
            let selector = &data[..10];
            self.responses
                .lock()
                .unwrap()
                .get(selector)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no canned response for {}", selector))
        }

        async fn send_raw_transaction(&self, _raw: &str) -> Result<String> {
            Ok("0x0".to_string())
        }

        async fn transaction_count(&self, _address: &str) -> Result<u64> {
            Ok(0)
        }

        async fn gas_price(&self) -> Result<u128> {
            Ok(0)
        }

        async fn get_code(&self, _address: &str) -> Result<String> {
            Ok("0x".to_string())
        }

        async fn transactions(&self, _a: &str, _f: u64, _t: u64) -> Result<Vec<TxRecord>> {
            Ok(Vec::new())
        }
    }

    fn contracts() -> ContractSet {
        ContractSet {
            solver_registry: Some("0x5555555555555555555555555555555555555555".to_string()),
            intent_receipt_hub: Some("0x6666666666666666666666666666666666666666".to_string()),
            dispute_module: Some("0x7777777777777777777777777777777777777777".to_string()),
            agent_registry: None,
            facilitator: None,
        }
    }

    #[tokio::test]
    async fn decodes_receipt_views() {
        let provider = Arc::new(CannedProvider::new());
        let mut payload = String::from("0x");
        payload.push_str(&abi::encode_u64(0x20)); // offset
        payload.push_str(&abi::encode_u64(1)); // length
        payload.push_str(&abi::encode_bytes32("0xaa").unwrap());
        payload.push_str(&abi::encode_bytes32("0xbb").unwrap());
        payload.push_str(&abi::encode_address("0x1111111111111111111111111111111111111111").unwrap());
        payload.push_str(&abi::encode_u64(0)); // status pending
        payload.push_str(&abi::encode_u64(1_704_060_000)); // deadline
        payload.push_str(&abi::encode_u64(1_704_000_000)); // created
        payload.push_str(&abi::encode_u128(5_000_000)); // amount
        provider.respond("getReceiptsInWindow(uint256)", payload);

        let ctx = LiveChainContext::pin(provider, contracts(), 3600, 1994).await.unwrap();
        assert_eq!(ctx.current_block(), 1994);
        assert_eq!(ctx.block_timestamp(), 1_704_067_200);
        assert_eq!(ctx.chain_id(), 8453);

        let receipts = ctx.receipts_in_challenge_window().await.unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].status, ReceiptStatus::Pending);
        assert_eq!(receipts[0].challenge_deadline, 1_704_060_000);
        assert_eq!(receipts[0].solver_id, "0x1111111111111111111111111111111111111111");
        assert_eq!(receipts[0].amount_wei, 5_000_000);
    }

    #[tokio::test]
    async fn unregistered_solver_is_none() {
        let provider = Arc::new(CannedProvider::new());
        let mut payload = String::from("0x");
        payload.push_str(&abi::encode_u128(0));
        payload.push_str(&abi::encode_u64(0));
        payload.push_str(&abi::encode_u64(0)); // registered_block 0 → absent
        provider.respond("solvers(address)", payload);

        let ctx = LiveChainContext::pin(provider, contracts(), 3600, 100).await.unwrap();
        let solver =
            ctx.solver_info("0x1111111111111111111111111111111111111111").await.unwrap();
        assert!(solver.is_none());
    }

    #[tokio::test]
    async fn missing_contract_config_is_an_error() {
        let provider = Arc::new(CannedProvider::new());
        let ctx = LiveChainContext::pin(provider, ContractSet::default(), 3600, 100)
            .await
            .unwrap();
        assert!(ctx.receipts_in_challenge_window().await.is_err());
        assert!(ctx.active_disputes().await.is_err());
    }
}
