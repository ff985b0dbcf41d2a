//! Minimal ABI plumbing for the handful of contract views and calls the
//! watchtower issues. Covers static 32-byte words plus the one dynamic
//! shape we read (arrays of fixed-size tuples); anything richer belongs in
//! a real codec.

use anyhow::{bail, Context, Result};
use sha3::{Digest, Keccak256};

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// 4-byte function selector for a canonical signature, 0x-hex encoded.
pub fn selector(signature: &str) -> String {
    let hash = keccak256(signature.as_bytes());
    format!("0x{}", hex::encode(&hash[..4]))
}

/// Event topic0 for a canonical signature.
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

pub fn encode_u64(value: u64) -> String {
    format!("{:064x}", value)
}

pub fn encode_u128(value: u128) -> String {
    format!("{:064x}", value)
}

/// Left-pad an address to a 32-byte word.
pub fn encode_address(address: &str) -> Result<String> {
    let stripped = address.strip_prefix("0x").unwrap_or(address);
    if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid address: {}", address);
    }
    Ok(format!("{:0>64}", stripped.to_lowercase()))
}

/// A bytes32 value given as 0x-hex (shorter input is left-padded).
pub fn encode_bytes32(value: &str) -> Result<String> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    if stripped.len() > 64 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid bytes32: {}", value);
    }
    Ok(format!("{:0>64}", stripped.to_lowercase()))
}

/// Calldata: selector plus pre-encoded 32-byte words.
pub fn calldata(signature: &str, words: &[String]) -> String {
    let mut out = selector(signature);
    for word in words {
        out.push_str(word);
    }
    out
}

/// Split a 0x-hex return payload into 32-byte words.
pub fn decode_words(raw: &str) -> Result<Vec<[u8; 32]>> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    if stripped.len() % 64 != 0 {
        bail!("return data not word-aligned: {} hex chars", stripped.len());
    }
    let bytes = hex::decode(stripped).context("return data not hex")?;
    Ok(bytes
        .chunks_exact(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}

pub fn word_to_u64(word: &[u8; 32]) -> Result<u64> {
    if word[..24].iter().any(|b| *b != 0) {
        bail!("word overflows u64");
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    Ok(u64::from_be_bytes(buf))
}

pub fn word_to_u128(word: &[u8; 32]) -> Result<u128> {
    if word[..16].iter().any(|b| *b != 0) {
        bail!("word overflows u128");
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(buf))
}

pub fn word_to_address(word: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(&word[12..]))
}

pub fn word_to_bytes32_hex(word: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(word))
}

pub fn word_to_bool(word: &[u8; 32]) -> bool {
    word[31] != 0
}

/// Decode a dynamic `string` from ABI data given the offset word index.
pub fn decode_string_at(raw: &str, offset_word: usize) -> Result<String> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(stripped).context("payload not hex")?;
    let words = decode_words(raw)?;
    let offset = word_to_u64(
        words
            .get(offset_word)
            .context("offset word out of range")?,
    )? as usize;
    if offset + 32 > bytes.len() {
        bail!("string offset out of range");
    }
    let mut len_word = [0u8; 32];
    len_word.copy_from_slice(&bytes[offset..offset + 32]);
    let len = word_to_u64(&len_word)? as usize;
    let start = offset + 32;
    if start + len > bytes.len() {
        bail!("string body out of range");
    }
    String::from_utf8(bytes[start..start + len].to_vec()).context("string not utf-8")
}

/// Decode `T[]` of fixed-size tuples returned by a view: offset word,
/// length word, then `len * words_per_item` words.
pub fn decode_tuple_array(raw: &str, words_per_item: usize) -> Result<Vec<Vec<[u8; 32]>>> {
    let words = decode_words(raw)?;
    if words.is_empty() {
        return Ok(Vec::new());
    }
    if words.len() < 2 {
        bail!("dynamic array payload too short");
    }
    let len = word_to_u64(&words[1])? as usize;
    let body = &words[2..];
    if body.len() < len * words_per_item {
        bail!(
            "dynamic array truncated: need {} words, have {}",
            len * words_per_item,
            body.len()
        );
    }
    Ok(body
        .chunks(words_per_item)
        .take(len)
        .map(|chunk| chunk.to_vec())
        .collect())
}
