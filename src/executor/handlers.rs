//! Live action handlers: build calldata, sign through the signer seam,
//! submit via the chain provider.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::ActionHandler;
use crate::chain::{abi, ChainProvider};
use crate::model::{ActionType, Finding};
use crate::signer::{Signer, TxRequest};

const DISPUTE_GAS_LIMIT: u64 = 400_000;
const EVIDENCE_GAS_LIMIT: u64 = 250_000;

async fn submit(
    provider: &Arc<dyn ChainProvider>,
    signer: &Arc<dyn Signer>,
    to: &str,
    data: String,
    gas_limit: u64,
) -> Result<String> {
    let address = signer.address();
    let nonce = provider.transaction_count(&address).await?;
    let gas_price_wei = provider.gas_price().await?;
    let raw = signer
        .sign_transaction(&TxRequest {
            to: to.to_string(),
            value_wei: 0,
            data,
            nonce,
            gas_limit,
            gas_price_wei,
            chain_id: provider.chain_id(),
        })
        .await?;
    provider.send_raw_transaction(&raw).await
}

fn receipt_word(finding: &Finding) -> Result<String> {
    let receipt_id = finding
        .receipt_id
        .as_deref()
        .with_context(|| format!("finding {} has no receipt id", finding.id))?;
    abi::encode_bytes32(receipt_id)
}

/// `openDispute(bytes32 receiptId)` on the dispute module.
pub struct OpenDisputeHandler {
    provider: Arc<dyn ChainProvider>,
    signer: Arc<dyn Signer>,
    dispute_module: String,
}

impl OpenDisputeHandler {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        signer: Arc<dyn Signer>,
        dispute_module: &str,
    ) -> Self {
        Self { provider, signer, dispute_module: dispute_module.to_lowercase() }
    }
}

#[async_trait]
impl ActionHandler for OpenDisputeHandler {
    fn action_type(&self) -> ActionType {
        ActionType::OpenDispute
    }

    async fn execute(&self, finding: &Finding) -> Result<String> {
        if self.dispute_module.is_empty() {
            bail!("dispute module address not configured");
        }
        let data = abi::calldata("openDispute(bytes32)", &[receipt_word(finding)?]);
        submit(&self.provider, &self.signer, &self.dispute_module, data, DISPUTE_GAS_LIMIT).await
    }

    async fn is_healthy(&self) -> bool {
        self.signer.is_healthy().await && self.provider.block_number().await.is_ok()
    }
}

/// `submitEvidence(bytes32 receiptId, bytes32 evidenceHash)` on the
/// dispute module. The evidence hash commits to the finding payload so
/// the on-chain record can be tied back to the JSONL store.
pub struct SubmitEvidenceHandler {
    provider: Arc<dyn ChainProvider>,
    signer: Arc<dyn Signer>,
    dispute_module: String,
}

impl SubmitEvidenceHandler {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        signer: Arc<dyn Signer>,
        dispute_module: &str,
    ) -> Self {
        Self { provider, signer, dispute_module: dispute_module.to_lowercase() }
    }
}

#[async_trait]
impl ActionHandler for SubmitEvidenceHandler {
    fn action_type(&self) -> ActionType {
        ActionType::SubmitEvidence
    }

    async fn execute(&self, finding: &Finding) -> Result<String> {
        if self.dispute_module.is_empty() {
            bail!("dispute module address not configured");
        }
        let payload = serde_json::to_value(finding)?;
        let evidence_hash = crate::canonical::hash_canonical(&payload);
        let data = abi::calldata(
            "submitEvidence(bytes32,bytes32)",
            &[receipt_word(finding)?, abi::encode_bytes32(&evidence_hash)?],
        );
        submit(&self.provider, &self.signer, &self.dispute_module, data, EVIDENCE_GAS_LIMIT).await
    }

    async fn is_healthy(&self) -> bool {
        self.signer.is_healthy().await && self.provider.block_number().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainEvent, EventFilter, TxRecord};
    use crate::model::{FindingCategory, Severity};
    use crate::signer::LocalSigner;
    use std::sync::Mutex;

    struct ScriptedProvider {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChainProvider for ScriptedProvider {
        fn chain_id(&self) -> u64 {
            31_337
        }

        async fn block_number(&self) -> Result<u64> {
            Ok(100)
        }

        async fn block_timestamp(&self, _block: u64) -> Result<u64> {
            Ok(1_700_000_000)
        }

        async fn get_events(&self, _filter: &EventFilter) -> Result<Vec<ChainEvent>> {
            Ok(Vec::new())
        }

        async fn call(&self, _to: &str, _data: &str) -> Result<String> {
            Ok("0x".to_string())
        }

        async fn send_raw_transaction(&self, raw_hex: &str) -> Result<String> {
            self.sent.lock().unwrap().push(raw_hex.to_string());
            Ok("0xsubmitted".to_string())
        }

        async fn transaction_count(&self, _address: &str) -> Result<u64> {
            Ok(3)
        }

        async fn gas_price(&self) -> Result<u128> {
            Ok(1_000_000_000)
        }

        async fn get_code(&self, _address: &str) -> Result<String> {
            Ok("0x".to_string())
        }

        async fn transactions(
            &self,
            _address: &str,
            _from: u64,
            _to: u64,
        ) -> Result<Vec<TxRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn open_dispute_signs_and_submits() {
        let provider: Arc<dyn ChainProvider> =
            Arc::new(ScriptedProvider { sent: Mutex::new(Vec::new()) });
        let signer: Arc<dyn Signer> =
            Arc::new(LocalSigner::new(k256::ecdsa::SigningKey::from_slice(&[7u8; 32]).unwrap()));
        let handler = OpenDisputeHandler::new(
            Arc::clone(&provider),
            signer,
            "0x3333333333333333333333333333333333333333",
        );

        let finding = Finding::new(
            "RECEIPT_STALE",
            "t",
            "d",
            Severity::High,
            FindingCategory::Receipt,
            99,
            0,
            ActionType::OpenDispute,
        )
        .with_receipt("0xabc1");

        let tx = handler.execute(&finding).await.unwrap();
        assert_eq!(tx, "0xsubmitted");
        assert!(handler.is_healthy().await);
    }

    #[tokio::test]
    async fn missing_receipt_id_is_an_error() {
        let provider: Arc<dyn ChainProvider> =
            Arc::new(ScriptedProvider { sent: Mutex::new(Vec::new()) });
        let signer: Arc<dyn Signer> =
            Arc::new(LocalSigner::new(k256::ecdsa::SigningKey::from_slice(&[7u8; 32]).unwrap()));
        let handler = SubmitEvidenceHandler::new(
            provider,
            signer,
            "0x3333333333333333333333333333333333333333",
        );
        let finding = Finding::new(
            "RECEIPT_STALE",
            "t",
            "d",
            Severity::High,
            FindingCategory::Receipt,
            99,
            0,
            ActionType::SubmitEvidence,
        );
        assert!(handler.execute(&finding).await.is_err());
    }
}
