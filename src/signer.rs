//! Signer seam: a tagged union of backends behind one trait.
//!
//! The local variant owns a secp256k1 key in-process and produces
//! EIP-155 legacy transactions and EIP-191 message signatures. The
//! agent-passkey, gcp-kms and lit-pkp variants are thin JSON-over-HTTP
//! clients against a remote signing service.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde_json::{json, Value};

use crate::chain::abi::keccak256;
use crate::errors::WatchtowerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerKind {
    Local,
    AgentPasskey,
    GcpKms,
    LitPkp,
}

impl SignerKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "local" => Ok(SignerKind::Local),
            "agent-passkey" => Ok(SignerKind::AgentPasskey),
            "gcp-kms" => Ok(SignerKind::GcpKms),
            "lit-pkp" => Ok(SignerKind::LitPkp),
            other => bail!("unknown SIGNER_TYPE: {}", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignerKind::Local => "local",
            SignerKind::AgentPasskey => "agent-passkey",
            SignerKind::GcpKms => "gcp-kms",
            SignerKind::LitPkp => "lit-pkp",
        }
    }
}

/// Unsigned transaction request; amounts in wei, data 0x-hex.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub to: String,
    pub value_wei: u128,
    pub data: String,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price_wei: u128,
    pub chain_id: u64,
}

#[async_trait]
pub trait Signer: Send + Sync {
    fn kind(&self) -> SignerKind;

    fn address(&self) -> String;

    /// Raw signed transaction, 0x-hex, ready for eth_sendRawTransaction.
    async fn sign_transaction(&self, tx: &TxRequest) -> Result<String>;

    /// EIP-191 personal signature over arbitrary bytes, 0x-hex r||s||v.
    async fn sign_message(&self, message: &[u8]) -> Result<String>;

    async fn is_healthy(&self) -> bool;
}

// =============================================================================
// RLP (legacy transactions only)
// =============================================================================

fn rlp_encode_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        return bytes.to_vec();
    }
    let mut out = rlp_length_prefix(bytes.len(), 0x80);
    out.extend_from_slice(bytes);
    out
}

fn rlp_encode_uint(value: u128) -> Vec<u8> {
    if value == 0 {
        return rlp_encode_bytes(&[]);
    }
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(15);
    rlp_encode_bytes(&bytes[first..])
}

fn rlp_encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let body: Vec<u8> = items.iter().flatten().copied().collect();
    let mut out = rlp_length_prefix(body.len(), 0xc0);
    out.extend_from_slice(&body);
    out
}

fn rlp_length_prefix(len: usize, offset: u8) -> Vec<u8> {
    if len <= 55 {
        vec![offset + len as u8]
    } else {
        let len_bytes = (len as u64).to_be_bytes();
        let first = len_bytes.iter().position(|b| *b != 0).unwrap_or(7);
        let mut out = vec![offset + 55 + (8 - first) as u8];
        out.extend_from_slice(&len_bytes[first..]);
        out
    }
}

fn hex_to_bytes(raw: &str) -> Result<Vec<u8>> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(stripped).context("invalid hex")
}

// =============================================================================
// Local signer
// =============================================================================

pub struct LocalSigner {
    key: SigningKey,
    address: String,
}

impl LocalSigner {
    pub fn new(key: SigningKey) -> Self {
        let point = key.verifying_key().to_encoded_point(false);
        let hash = keccak256(&point.as_bytes()[1..]);
        let address = format!("0x{}", hex::encode(&hash[12..]));
        Self { key, address }
    }

    /// Load a 32-byte hex key file, or create one if absent.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let bytes = hex_to_bytes(raw.trim())?;
            let key = SigningKey::from_slice(&bytes)
                .map_err(|e| anyhow!("invalid signer key material: {}", e))?;
            return Ok(Self::new(key));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        fs::write(path, hex::encode(key.to_bytes()))?;
        restrict_permissions(path);
        Ok(Self::new(key))
    }

    fn sign_hash(&self, hash: &[u8; 32]) -> Result<([u8; 32], [u8; 32], u8)> {
        let (signature, recovery) = self
            .key
            .sign_prehash_recoverable(hash)
            .map_err(|e| anyhow!("secp256k1 signing failed: {}", e))?;
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok((r, s, recovery.to_byte()))
    }
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[async_trait]
impl Signer for LocalSigner {
    fn kind(&self) -> SignerKind {
        SignerKind::Local
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign_transaction(&self, tx: &TxRequest) -> Result<String> {
        let to_bytes = hex_to_bytes(&tx.to)?;
        if to_bytes.len() != 20 {
            bail!("to address must be 20 bytes");
        }
        let data = hex_to_bytes(&tx.data)?;

        // EIP-155: hash rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0])
        let preimage = rlp_encode_list(&[
            rlp_encode_uint(tx.nonce as u128),
            rlp_encode_uint(tx.gas_price_wei),
            rlp_encode_uint(tx.gas_limit as u128),
            rlp_encode_bytes(&to_bytes),
            rlp_encode_uint(tx.value_wei),
            rlp_encode_bytes(&data),
            rlp_encode_uint(tx.chain_id as u128),
            rlp_encode_uint(0),
            rlp_encode_uint(0),
        ]);
        let hash = keccak256(&preimage);
        let (r, s, rec_id) = self.sign_hash(&hash)?;
        let v = tx.chain_id as u128 * 2 + 35 + rec_id as u128;

        let signed = rlp_encode_list(&[
            rlp_encode_uint(tx.nonce as u128),
            rlp_encode_uint(tx.gas_price_wei),
            rlp_encode_uint(tx.gas_limit as u128),
            rlp_encode_bytes(&to_bytes),
            rlp_encode_uint(tx.value_wei),
            rlp_encode_bytes(&data),
            rlp_encode_uint(v),
            rlp_encode_bytes(strip_leading_zeros(&r)),
            rlp_encode_bytes(strip_leading_zeros(&s)),
        ]);
        Ok(format!("0x{}", hex::encode(signed)))
    }

    async fn sign_message(&self, message: &[u8]) -> Result<String> {
        let mut preimage = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
        preimage.extend_from_slice(message);
        let hash = keccak256(&preimage);
        let (r, s, rec_id) = self.sign_hash(&hash)?;
        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&r);
        out.extend_from_slice(&s);
        out.push(27 + rec_id);
        Ok(format!("0x{}", hex::encode(out)))
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    &bytes[first..]
}

// =============================================================================
// Remote signer (agent-passkey / gcp-kms / lit-pkp)
// =============================================================================

pub struct RemoteSigner {
    kind: SignerKind,
    endpoint: String,
    address: String,
    client: reqwest::Client,
}

impl RemoteSigner {
    pub async fn connect(kind: SignerKind, endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        let resp: Value = client
            .get(format!("{}/v1/address", endpoint))
            .send()
            .await
            .map_err(|e| WatchtowerError::Signer {
                backend: kind.as_str().to_string(),
                detail: e.to_string(),
            })?
            .json()
            .await?;
        let address = resp
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("signer service returned no address"))?
            .to_lowercase();
        Ok(Self { kind, endpoint: endpoint.to_string(), address, client })
    }

    async fn invoke(&self, method: &str, params: Value) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/v1/sign", self.endpoint))
            .json(&json!({ "method": method, "params": params }))
            .send()
            .await
            .map_err(|e| WatchtowerError::Signer {
                backend: self.kind.as_str().to_string(),
                detail: e.to_string(),
            })?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(WatchtowerError::Signer {
                backend: self.kind.as_str().to_string(),
                detail: format!("status {}: {}", status.as_u16(), body),
            }
            .into());
        }
        body.get("signature")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("signer response missing signature"))
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    fn kind(&self) -> SignerKind {
        self.kind
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign_transaction(&self, tx: &TxRequest) -> Result<String> {
        self.invoke(
            "sign_transaction",
            json!({
                "to": tx.to,
                "value": tx.value_wei.to_string(),
                "data": tx.data,
                "nonce": tx.nonce,
                "gasLimit": tx.gas_limit,
                "gasPrice": tx.gas_price_wei.to_string(),
                "chainId": tx.chain_id,
            }),
        )
        .await
    }

    async fn sign_message(&self, message: &[u8]) -> Result<String> {
        self.invoke("sign_message", json!({ "message": format!("0x{}", hex::encode(message)) }))
            .await
    }

    async fn is_healthy(&self) -> bool {
        let url = format!("{}/healthz", self.endpoint);
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Build the configured signer backend.
pub async fn build_signer(
    signer_type: &str,
    key_path: &Path,
    endpoint: Option<&str>,
) -> Result<Box<dyn Signer>> {
    match SignerKind::parse(signer_type)? {
        SignerKind::Local => Ok(Box::new(LocalSigner::load_or_create(key_path)?)),
        remote => {
            let endpoint = endpoint.ok_or_else(|| {
                WatchtowerError::Fatal(format!(
                    "SIGNER_TYPE={} requires SIGNER_ENDPOINT",
                    remote.as_str()
                ))
            })?;
            Ok(Box::new(RemoteSigner::connect(remote, endpoint).await?))
        }
    }
}
