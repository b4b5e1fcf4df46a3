//! Continuation token (`requestState`) codec.
//!
//! A token is `mrtr1.` followed by unpadded base64url of
//! `nonce (12) || AES-256-GCM ciphertext+tag`. The plaintext is a JSON
//! envelope binding the server context to the principal it was minted for
//! and to an expiry. Clients only ever store and echo the string.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::Principal;
use crate::config::TokenConfig;
use crate::error::TokenError;

const TOKEN_PREFIX: &str = "mrtr1.";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    sub: String,
    iat: i64,
    exp: i64,
    ctx: T,
}

/// Decode a base64 AES-256 key.
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], TokenError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| TokenError::Key(format!("invalid base64: {e}")))?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice())
        .map_err(|_| TokenError::Key(format!("key must be {KEY_LEN} bytes, got {}", bytes.len())))
}

/// Fresh random key, base64 encoded.
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill(&mut key[..]);
    STANDARD.encode(key)
}

#[derive(Clone)]
pub struct TokenCodec {
    current: Aes256Gcm,
    previous: Vec<Aes256Gcm>,
    ttl: Duration,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("previous_keys", &self.previous.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(key: &[u8; KEY_LEN], ttl: Duration) -> Self {
        Self {
            current: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            previous: Vec::new(),
            ttl,
        }
    }

    /// Keys that are no longer used for minting but still validate.
    pub fn with_previous_keys(mut self, keys: &[[u8; KEY_LEN]]) -> Self {
        self.previous = keys
            .iter()
            .map(|k| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(k)))
            .collect();
        self
    }

    pub fn from_config(config: &TokenConfig) -> Result<Self, TokenError> {
        let ttl = Duration::from_secs(config.ttl_seconds);
        let key = match &config.key {
            Some(encoded) => decode_key(encoded)?,
            None => {
                tracing::warn!(
                    "No token.key configured; generated a per-process key. \
                     Continuation tokens will not survive a restart or validate on other instances"
                );
                decode_key(&generate_key())?
            }
        };
        let previous = config
            .previous_keys
            .iter()
            .map(|k| decode_key(k))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(&key, ttl).with_previous_keys(&previous))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Serialize `context`, bind it to `principal` and seal it.
    pub fn mint<T: Serialize>(&self, context: &T, principal: &Principal) -> Result<String, TokenError> {
        self.mint_at(context, principal, Utc::now())
    }

    pub fn mint_at<T: Serialize>(
        &self,
        context: &T,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| TokenError::Key(format!("token ttl out of range: {e}")))?;
        let envelope = Envelope {
            sub: principal.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            ctx: context,
        };
        let plaintext =
            serde_json::to_vec(&envelope).map_err(|e| TokenError::Malformed(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .current
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: TOKEN_PREFIX.as_bytes(),
                },
            )
            .map_err(|_| TokenError::Key("AES-256-GCM encryption failed".into()))?;

        // Pack: nonce (12) || ciphertext+tag
        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);

        Ok(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(packed)))
    }

    /// Open a token presented by `principal`. Pure: the same token and trust
    /// material always give the same answer at the same instant.
    pub fn validate<T: DeserializeOwned>(
        &self,
        token: &str,
        principal: &Principal,
    ) -> Result<T, TokenError> {
        self.validate_at(token, principal, Utc::now())
    }

    pub fn validate_at<T: DeserializeOwned>(
        &self,
        token: &str,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<T, TokenError> {
        let encoded = token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| TokenError::Malformed("unknown token format".into()))?;
        let packed = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| TokenError::Malformed(format!("base64: {e}")))?;
        if packed.len() < NONCE_LEN + TAG_LEN {
            return Err(TokenError::Malformed("token too short".into()));
        }

        let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let payload = || Payload {
            msg: ciphertext,
            aad: TOKEN_PREFIX.as_bytes(),
        };

        let plaintext = std::iter::once(&self.current)
            .chain(self.previous.iter())
            .find_map(|cipher| cipher.decrypt(nonce, payload()).ok())
            .ok_or(TokenError::InvalidState)?;

        let envelope: Envelope<serde_json::Value> = serde_json::from_slice(&plaintext)
            .map_err(|e| TokenError::Malformed(format!("envelope: {e}")))?;

        if envelope.sub != principal.as_str() {
            return Err(TokenError::IdentityMismatch);
        }
        if now.timestamp() > envelope.exp {
            return Err(TokenError::ExpiredState);
        }

        serde_json::from_value(envelope.ctx)
            .map_err(|e| TokenError::Malformed(format!("context: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Progress {
        answered: Vec<String>,
        round: u32,
    }

    fn codec() -> TokenCodec {
        TokenCodec::new(&[7u8; KEY_LEN], Duration::from_secs(60))
    }

    fn progress() -> Progress {
        Progress {
            answered: vec!["resolution".into()],
            round: 2,
        }
    }

    #[test]
    fn test_mint_then_validate() {
        let codec = codec();
        let alice = Principal::new("alice");
        let token = codec.mint(&progress(), &alice).unwrap();
        assert!(token.starts_with(TOKEN_PREFIX));

        let restored: Progress = codec.validate(&token, &alice).unwrap();
        assert_eq!(restored, progress());
    }

    #[test]
    fn test_token_is_opaque() {
        let token = codec().mint(&progress(), &Principal::new("alice")).unwrap();
        assert!(!token.contains("resolution"));
        assert!(!token.contains("alice"));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let codec = codec();
        let alice = Principal::new("alice");
        let token = codec.mint(&progress(), &alice).unwrap();
        let first: Result<Progress, _> = codec.validate(&token, &alice);
        let second: Result<Progress, _> = codec.validate(&token, &alice);
        assert_eq!(first.is_ok(), second.is_ok());

        let bob = Principal::new("bob");
        let first: Result<Progress, _> = codec.validate(&token, &bob);
        let second: Result<Progress, _> = codec.validate(&token, &bob);
        assert_eq!(first.unwrap_err(), second.unwrap_err());
    }

    #[test]
    fn test_every_bit_flip_is_rejected() {
        let codec = codec();
        let alice = Principal::new("alice");
        let token = codec.mint(&json!({"k": "v"}), &alice).unwrap();
        let encoded = token.strip_prefix(TOKEN_PREFIX).unwrap();
        let packed = URL_SAFE_NO_PAD.decode(encoded).unwrap();

        for byte in 0..packed.len() {
            for bit in 0..8 {
                let mut tampered = packed.clone();
                tampered[byte] ^= 1 << bit;
                let forged = format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(&tampered));
                let result: Result<serde_json::Value, _> = codec.validate(&forged, &alice);
                assert_eq!(result.unwrap_err(), TokenError::InvalidState);
            }
        }
    }

    #[test]
    fn test_character_flip_is_rejected() {
        let codec = codec();
        let alice = Principal::new("alice");
        let token = codec.mint(&progress(), &alice).unwrap();

        for position in TOKEN_PREFIX.len()..token.len() {
            let mut chars: Vec<char> = token.chars().collect();
            chars[position] = if chars[position] == 'A' { 'B' } else { 'A' };
            let forged: String = chars.into_iter().collect();
            let result: Result<Progress, _> = codec.validate(&forged, &alice);
            assert!(result.is_err(), "flip at {position} was accepted");
        }
    }

    #[test]
    fn test_identity_mismatch() {
        let codec = codec();
        let token = codec.mint(&progress(), &Principal::new("alice")).unwrap();
        let result: Result<Progress, _> = codec.validate(&token, &Principal::new("mallory"));
        assert_eq!(result.unwrap_err(), TokenError::IdentityMismatch);
    }

    #[test]
    fn test_expired_state() {
        let codec = codec();
        let alice = Principal::new("alice");
        let minted_at = Utc::now() - chrono::Duration::seconds(120);
        let token = codec.mint_at(&progress(), &alice, minted_at).unwrap();
        let result: Result<Progress, _> = codec.validate(&token, &alice);
        assert_eq!(result.unwrap_err(), TokenError::ExpiredState);
    }

    #[test]
    fn test_foreign_key_is_invalid_state() {
        let alice = Principal::new("alice");
        let token = codec().mint(&progress(), &alice).unwrap();
        let other = TokenCodec::new(&[9u8; KEY_LEN], Duration::from_secs(60));
        let result: Result<Progress, _> = other.validate(&token, &alice);
        assert_eq!(result.unwrap_err(), TokenError::InvalidState);
    }

    #[test]
    fn test_previous_key_still_validates() {
        let alice = Principal::new("alice");
        let old_key = [7u8; KEY_LEN];
        let token = TokenCodec::new(&old_key, Duration::from_secs(60))
            .mint(&progress(), &alice)
            .unwrap();

        let rotated = TokenCodec::new(&[8u8; KEY_LEN], Duration::from_secs(60))
            .with_previous_keys(&[old_key]);
        let restored: Progress = rotated.validate(&token, &alice).unwrap();
        assert_eq!(restored, progress());
    }

    #[test]
    fn test_malformed_tokens() {
        let codec = codec();
        let alice = Principal::new("alice");
        for token in ["", "garbage", "mrtr1.", "mrtr1.!!!!", "mrtr1.AAAA"] {
            let result: Result<Progress, _> = codec.validate(token, &alice);
            assert!(matches!(result, Err(TokenError::Malformed(_))), "{token}");
        }
    }

    #[test]
    fn test_decode_and_generate_key() {
        let key = generate_key();
        assert_eq!(decode_key(&key).unwrap().len(), KEY_LEN);
        assert!(decode_key("c2hvcnQ=").is_err());
        assert!(decode_key("not base64!").is_err());
    }
}
