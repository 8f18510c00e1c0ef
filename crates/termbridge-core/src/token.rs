//! HMAC reconnection tokens.
//!
//! A token lets a client re-authorize a fresh connection without presenting
//! the API key again. Format (hex-encoded): `[8-byte expiry][32-byte HMAC-SHA256]`.

use crate::error::{BridgeError, BridgeResult};
use ring::hmac;

const EXPIRY_LEN: usize = 8;
const TAG_LEN: usize = 32;

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn signing_input(expiry: u64, subject: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(EXPIRY_LEN + subject.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(subject.as_bytes());
    data
}

fn create_token_at(secret: &[u8], subject: &str, expiry: u64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signing_input(expiry, subject));

    let mut token = Vec::with_capacity(EXPIRY_LEN + TAG_LEN);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    hex::encode(token)
}

/// Create a token binding `subject` to an expiry `ttl_secs` from now.
pub fn create_token(secret: &[u8], subject: &str, ttl_secs: u64) -> String {
    create_token_at(secret, subject, now_secs().saturating_add(ttl_secs))
}

/// Verify a token: HMAC signature first, then expiry.
pub fn verify_token(secret: &[u8], subject: &str, token: &str) -> BridgeResult<()> {
    let raw = hex::decode(token).map_err(|e| BridgeError::Token(format!("bad encoding: {e}")))?;
    if raw.len() != EXPIRY_LEN + TAG_LEN {
        return Err(BridgeError::Token(format!(
            "invalid token length: expected {}, got {}",
            EXPIRY_LEN + TAG_LEN,
            raw.len()
        )));
    }

    let (expiry_bytes, tag) = raw.split_at(EXPIRY_LEN);
    let mut expiry_buf = [0u8; EXPIRY_LEN];
    expiry_buf.copy_from_slice(expiry_bytes);
    let expiry = u64::from_be_bytes(expiry_buf);

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signing_input(expiry, subject), tag)
        .map_err(|_| BridgeError::Token("invalid token signature".into()))?;

    if now_secs() > expiry {
        return Err(BridgeError::Token("token expired".into()));
    }
    Ok(())
}

/// Hex SHA-256 digest of a credential.
///
/// Credentials are compared digest-to-digest and tokens are bound to the
/// digest, never to the raw key.
pub fn credential_digest(credential: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// Whether `credential` hashes to `expected_digest`, compared in constant time.
pub fn credential_matches(expected_digest: &str, credential: &str) -> bool {
    use subtle::ConstantTimeEq;
    if credential.is_empty() {
        return false;
    }
    credential_digest(credential)
        .as_bytes()
        .ct_eq(expected_digest.as_bytes())
        .into()
}

/// Generate a random 32-byte signing secret.
pub fn generate_secret() -> BridgeResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| BridgeError::Other("system RNG unavailable".into()))?;
    Ok(secret)
}
