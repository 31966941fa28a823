//! Secret-file encryption for the operator.
//!
//! `.env` holds adapter credentials; `encrypt-env` seals it into `.env.enc`
//! so the plaintext never needs to live on disk between runs. The scheme is
//! self-contained on sha2: a SHA-256-derived key, a counter-mode keystream
//! over a random nonce, and a keyed integrity tag checked before any byte
//! of plaintext is produced.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};

use soul_audit::{AuditEntry, AuditLogger};
use soul_config::EngineConfig;

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;
const KEY_CONTEXT: &[u8] = b"soul-env-v1";

fn env_paths(config: &EngineConfig) -> (PathBuf, PathBuf) {
    let root = config.soul_root();
    (root.join(".env"), root.join(".env.enc"))
}

pub fn encrypt_env(config: &EngineConfig) -> Result<()> {
    let key = require_key("SOUL_SECRET_KEY")?;
    let (plain_path, enc_path) = env_paths(config);

    let plaintext = std::fs::read(&plain_path)
        .with_context(|| format!("reading {}", plain_path.display()))?;
    let sealed = seal(&key, &plaintext)?;
    std::fs::write(&enc_path, sealed)?;

    println!("encrypted {} -> {}", plain_path.display(), enc_path.display());
    Ok(())
}

pub fn decrypt_env(config: &EngineConfig) -> Result<()> {
    let key = require_key("SOUL_SECRET_KEY")?;
    let (plain_path, enc_path) = env_paths(config);

    let sealed = std::fs::read(&enc_path)
        .with_context(|| format!("reading {}", enc_path.display()))?;
    let plaintext = open(&key, &sealed)?;
    std::fs::write(&plain_path, plaintext)?;

    println!("decrypted {} -> {}", enc_path.display(), plain_path.display());
    Ok(())
}

/// Decrypt under the old key, re-encrypt under `SOUL_SECRET_KEY_NEW`, and
/// leave an audit entry for the migration.
pub fn rotate_key(config: &EngineConfig) -> Result<()> {
    let old_key = require_key("SOUL_SECRET_KEY")?;
    let new_key = require_key("SOUL_SECRET_KEY_NEW")?;
    let (_, enc_path) = env_paths(config);

    let sealed = std::fs::read(&enc_path)
        .with_context(|| format!("reading {}", enc_path.display()))?;
    let plaintext = open(&old_key, &sealed)?;
    std::fs::write(&enc_path, seal(&new_key, &plaintext)?)?;

    let audit = AuditLogger::new(config.soul_root());
    audit.append(&AuditEntry {
        ts: Utc::now().timestamp_millis(),
        event: "secrets.migrated".to_string(),
        source: "cli".to_string(),
        severity: None,
        changes: None,
        error: None,
        detail: Some(serde_json::json!({"file": enc_path.display().to_string()})),
    })?;

    println!("re-encrypted {} under the new key", enc_path.display());
    println!("remember to move SOUL_SECRET_KEY_NEW into SOUL_SECRET_KEY");
    Ok(())
}

fn require_key(var: &str) -> Result<[u8; 32]> {
    let raw = std::env::var(var).unwrap_or_default();
    if raw.is_empty() {
        bail!("{var} is not set");
    }
    let mut hasher = Sha256::new();
    hasher.update(KEY_CONTEXT);
    hasher.update(raw.as_bytes());
    Ok(hasher.finalize().into())
}

fn keystream_block(key: &[u8; 32], nonce: &[u8], counter: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(nonce);
    hasher.update(counter.to_le_bytes());
    hasher.finalize().into()
}

fn tag(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"mac");
    hasher.update(key);
    hasher.update(nonce);
    hasher.update(ciphertext);
    hasher.finalize().into()
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut ciphertext = plaintext.to_vec();
    xor_keystream(key, &nonce, &mut ciphertext);

    let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag(key, &nonce, &ciphertext));
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        bail!("encrypted file is truncated");
    }
    let (nonce, rest) = sealed.split_at(NONCE_LEN);
    let (stored_tag, ciphertext) = rest.split_at(TAG_LEN);

    let expected = tag(key, nonce, ciphertext);
    // Constant-time-ish comparison: fold the whole difference before branching.
    let mismatch = stored_tag
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if mismatch != 0 {
        bail!("integrity check failed — wrong key or corrupted file");
    }

    let mut plaintext = ciphertext.to_vec();
    xor_keystream(key, nonce, &mut plaintext);
    Ok(plaintext)
}

fn xor_keystream(key: &[u8; 32], nonce: &[u8], data: &mut [u8]) {
    for (i, chunk) in data.chunks_mut(32).enumerate() {
        let block = keystream_block(key, nonce, i as u64);
        for (byte, k) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= k;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(seed.as_bytes());
        hasher.finalize().into()
    }

    #[test]
    fn seal_open_round_trips() {
        let key = key("hunter2");
        let plaintext = b"TELEGRAM_TOKEN=abc\nWHATSAPP_TOKEN=def\n";
        let sealed = seal(&key, plaintext).unwrap();
        assert_ne!(&sealed[NONCE_LEN + TAG_LEN..], plaintext.as_slice());
        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_key_fails_integrity_check() {
        let sealed = seal(&key("right"), b"secret").unwrap();
        assert!(open(&key("wrong"), &sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let mut sealed = seal(&key("k"), b"payload bytes").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open(&key("k"), &sealed).is_err());
    }

    #[test]
    fn truncated_file_is_rejected() {
        assert!(open(&key("k"), &[0u8; 10]).is_err());
    }
}
