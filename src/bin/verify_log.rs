//! Offline transparency-log verifier.
//!
//! Usage: verify_log <leaves-YYYY-MM-DD.ndjson> <public-key-base64>
//!
//! Exits non-zero when any leaf fails verification, so it slots into
//! cron checks and CI without parsing output.

use std::path::Path;
use std::process::ExitCode;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::VerifyingKey;

use watchtower::transparency::verify_log_file;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let (path, key_b64) = match args.as_slice() {
        [_, path, key] => (path.clone(), key.clone()),
        _ => {
            eprintln!("usage: verify_log <leaves-file.ndjson> <public-key-base64>");
            return ExitCode::from(2);
        }
    };

    let key_bytes = match BASE64.decode(key_b64.trim()) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("public key is not base64: {}", err);
            return ExitCode::from(2);
        }
    };
    let key_bytes: [u8; 32] = match key_bytes.try_into() {
        Ok(bytes) => bytes,
        Err(_) => {
            eprintln!("public key must be 32 bytes");
            return ExitCode::from(2);
        }
    };
    let key = match VerifyingKey::from_bytes(&key_bytes) {
        Ok(key) => key,
        Err(err) => {
            eprintln!("invalid ed25519 public key: {}", err);
            return ExitCode::from(2);
        }
    };

    match verify_log_file(Path::new(&path), &key) {
        Ok(summary) => {
            println!(
                "{}",
                serde_json::json!({
                    "file": path,
                    "totalLeaves": summary.total_leaves,
                    "validLeaves": summary.valid_leaves,
                    "invalidLeaves": summary.invalid_leaves,
                    "errors": summary.errors,
                })
            );
            if summary.invalid_leaves == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            eprintln!("verification failed: {}", err);
            ExitCode::from(2)
        }
    }
}
