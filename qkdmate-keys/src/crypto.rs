//! Authenticated encryption under single-use quantum keys
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{KeyError, KeyResult};
use crate::key_types::PoolStatus;
use crate::pool::KeyPool;
use crate::session::SessionKey;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

const KDF_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const ENVELOPE_VERSION: &str = "1.0";
const DEFAULT_FRESHNESS_SECS: i64 = 3600;

/// Wire format of an encrypted message
///
/// Binary fields travel base64-encoded, the HMAC as lowercase hex. The
/// associated data is carried verbatim so the receiver authenticates the
/// exact bytes the sender bound into the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub version: String,
    pub sender: String,
    pub recipient: String,
    pub timestamp: DateTime<Utc>,
    pub key_id: String,
    pub nonce: String,
    pub ciphertext: String,
    pub auth_tag: String,
    pub hmac: String,
    pub aad: String,
}

/// Engine algorithm descriptors plus the current pool state
#[derive(Debug, Clone, Serialize)]
pub struct CryptoStats {
    pub node_id: String,
    pub cipher: String,
    pub key_derivation: String,
    pub kdf_iterations: u32,
    pub integrity: String,
    pub freshness_window_secs: i64,
    pub pool: PoolStatus,
}

/// Fields bound into the ciphertext as associated data, declared in
/// alphabetical order so serialization is canonical on both ends
#[derive(Serialize)]
struct AssociatedData<'a> {
    key_id: &'a str,
    recipient: &'a str,
    sender: &'a str,
    timestamp: String,
}

/// Authenticated-encryption engine over a quantum key pool
///
/// Every message consumes one pool key. Two independent sub-keys are
/// derived from it, one for AES-256-GCM and one for an outer HMAC over
/// the envelope, so a tampered envelope is rejected before the AEAD
/// runs.
pub struct CryptoEngine {
    pool: Arc<KeyPool>,
    node_id: String,
    freshness_window_secs: i64,
}

impl CryptoEngine {
    pub fn new(pool: Arc<KeyPool>, node_id: impl Into<String>) -> Self {
        Self {
            pool,
            node_id: node_id.into(),
            freshness_window_secs: DEFAULT_FRESHNESS_SECS,
        }
    }

    /// Override the replay-rejection window (seconds)
    pub fn with_freshness_window(mut self, secs: i64) -> Self {
        self.freshness_window_secs = secs;
        self
    }

    /// Encrypt `plaintext` for `recipient` under a fresh quantum key
    pub async fn encrypt_message(
        &self,
        plaintext: &[u8],
        recipient: &str,
    ) -> KeyResult<EncryptedEnvelope> {
        let key = self.pool.acquire_fresh_key().await?;
        let timestamp = Utc::now();

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let (enc_key, auth_key) = derive_subkeys(&key.key_data, &nonce);
        let aad = encode_aad(&key.key_id, recipient, &self.node_id, timestamp)?;

        let cipher = Aes256Gcm::new(&enc_key.into());
        let combined = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| KeyError::Encryption("AES-GCM encryption failed".to_string()))?;
        let (ciphertext, tag) = combined.split_at(combined.len() - TAG_LEN);

        let hmac = compute_hmac(&auth_key, &aad, ciphertext, tag)?;

        debug!(key_id = %key.key_id, recipient, bytes = plaintext.len(), "Message encrypted");
        Ok(EncryptedEnvelope {
            version: ENVELOPE_VERSION.to_string(),
            sender: self.node_id.clone(),
            recipient: recipient.to_string(),
            timestamp,
            key_id: key.key_id,
            nonce: base64::encode(nonce),
            ciphertext: base64::encode(ciphertext),
            auth_tag: base64::encode(tag),
            hmac,
            aad: base64::encode(&aad),
        })
    }

    /// Decrypt an envelope, rejecting in a fixed order: wrong recipient,
    /// stale timestamp, unknown key, bad HMAC, bad AEAD tag
    ///
    /// Each rejection is definite and yields no partial plaintext. The key
    /// lookup also accepts already-used keys so a resent envelope still
    /// decrypts.
    pub async fn decrypt_message(&self, envelope: &EncryptedEnvelope) -> KeyResult<Vec<u8>> {
        if envelope.recipient != self.node_id {
            return Err(KeyError::RecipientMismatch {
                expected: self.node_id.clone(),
                actual: envelope.recipient.clone(),
            });
        }

        let age_secs = (Utc::now() - envelope.timestamp).num_seconds();
        if age_secs > self.freshness_window_secs {
            return Err(KeyError::StaleMessage {
                age_secs,
                window_secs: self.freshness_window_secs,
            });
        }

        let key = self
            .pool
            .find_key(&envelope.key_id)
            .await
            .ok_or_else(|| KeyError::UnknownKey(envelope.key_id.clone()))?;

        let nonce = decode_field(&envelope.nonce, "nonce")?;
        if nonce.len() != NONCE_LEN {
            return Err(KeyError::Decryption(format!(
                "Nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }
        let ciphertext = decode_field(&envelope.ciphertext, "ciphertext")?;
        let tag = decode_field(&envelope.auth_tag, "auth_tag")?;
        let aad = decode_field(&envelope.aad, "aad")?;

        let (enc_key, auth_key) = derive_subkeys(&key.key_data, &nonce);
        verify_hmac(&auth_key, &aad, &ciphertext, &tag, &envelope.hmac)?;

        let mut combined = ciphertext;
        combined.extend_from_slice(&tag);
        let cipher = Aes256Gcm::new(&enc_key.into());
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &combined,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                KeyError::Decryption("AES-GCM authentication tag rejected".to_string())
            })?;

        self.pool.mark_used(&envelope.key_id).await;
        info!(key_id = %envelope.key_id, sender = %envelope.sender, "Message decrypted");
        Ok(plaintext)
    }

    /// Derive a session key from one consumed pool key, salted by the
    /// session identifier
    pub async fn create_session_key(&self, session_id: &str) -> KeyResult<SessionKey> {
        let key = self.pool.acquire_fresh_key().await?;
        let salt = Sha256::digest(session_id.as_bytes());
        let mut material = [0u8; 32];
        pbkdf2_hmac::<Sha256>(&key.key_data, &salt, KDF_ITERATIONS, &mut material);

        info!(session_id, key_id = %key.key_id, "Session key derived");
        Ok(SessionKey {
            session_id: session_id.to_string(),
            material,
            source_key_id: key.key_id,
            created_at: Utc::now(),
        })
    }

    pub async fn crypto_stats(&self) -> CryptoStats {
        CryptoStats {
            node_id: self.node_id.clone(),
            cipher: "AES-256-GCM".to_string(),
            key_derivation: "PBKDF2-HMAC-SHA256".to_string(),
            kdf_iterations: KDF_ITERATIONS,
            integrity: "HMAC-SHA256".to_string(),
            freshness_window_secs: self.freshness_window_secs,
            pool: self.pool.status().await,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Stretch one quantum key into independent encryption and
/// authentication sub-keys, salted by the message nonce
fn derive_subkeys(key_data: &[u8], nonce: &[u8]) -> ([u8; 32], [u8; 32]) {
    let mut enc_input = key_data.to_vec();
    enc_input.extend_from_slice(b"ENCRYPT");
    let mut auth_input = key_data.to_vec();
    auth_input.extend_from_slice(b"AUTHENTICATE");

    let mut enc_key = [0u8; 32];
    let mut auth_key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(&enc_input, nonce, KDF_ITERATIONS, &mut enc_key);
    pbkdf2_hmac::<Sha256>(&auth_input, nonce, KDF_ITERATIONS, &mut auth_key);
    (enc_key, auth_key)
}

fn encode_aad(
    key_id: &str,
    recipient: &str,
    sender: &str,
    timestamp: DateTime<Utc>,
) -> KeyResult<Vec<u8>> {
    let aad = AssociatedData {
        key_id,
        recipient,
        sender,
        timestamp: timestamp.to_rfc3339(),
    };
    Ok(serde_json::to_vec(&aad)?)
}

fn compute_hmac(auth_key: &[u8], aad: &[u8], ciphertext: &[u8], tag: &[u8]) -> KeyResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key)
        .map_err(|_| KeyError::Integrity("Invalid HMAC key length".to_string()))?;
    mac.update(aad);
    mac.update(ciphertext);
    mac.update(tag);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_hmac(
    auth_key: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    expected_hex: &str,
) -> KeyResult<()> {
    let expected = hex::decode(expected_hex)
        .map_err(|_| KeyError::Integrity("HMAC field is not valid hex".to_string()))?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(auth_key)
        .map_err(|_| KeyError::Integrity("Invalid HMAC key length".to_string()))?;
    mac.update(aad);
    mac.update(ciphertext);
    mac.update(tag);
    mac.verify_slice(&expected)
        .map_err(|_| KeyError::Integrity("Envelope HMAC mismatch".to_string()))
}

fn decode_field(encoded: &str, field: &str) -> KeyResult<Vec<u8>> {
    base64::decode(encoded)
        .map_err(|_| KeyError::Decryption(format!("Envelope field {} is not valid base64", field)))
}
