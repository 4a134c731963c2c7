//! Session mode: many messages per quantum key, with rotation
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


use crate::crypto::CryptoEngine;
use crate::error::{KeyError, KeyResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_MAX_MESSAGES: u64 = 1000;
const NONCE_LEN: usize = 12;

/// A symmetric key derived from one consumed quantum key for a session
#[derive(Clone)]
pub struct SessionKey {
    pub session_id: String,
    pub material: [u8; 32],
    /// Pool key the material was derived from
    pub source_key_id: String,
    pub created_at: DateTime<Utc>,
}

/// One message exchanged within a session
///
/// The ciphertext carries the AES-GCM tag appended; session id and
/// counter are bound in as associated data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: String,
    /// Pool key the session key in force was derived from
    pub key_id: String,
    pub counter: u64,
    pub nonce: String,
    pub ciphertext: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct SessionAad<'a> {
    counter: u64,
    session_id: &'a str,
}

/// High-throughput channel that amortizes quantum keys over many messages
///
/// One pool key backs up to `max_messages` messages; the cap forces a
/// rotation that consumes a fresh pool key and resets the counter.
pub struct SecureSession {
    engine: Arc<CryptoEngine>,
    session_id: String,
    key: SessionKey,
    messages_sent: u64,
    max_messages: u64,
}

impl SecureSession {
    /// Open a session, consuming one pool key for the initial session key
    pub async fn establish(
        engine: Arc<CryptoEngine>,
        session_id: impl Into<String>,
    ) -> KeyResult<Self> {
        let session_id = session_id.into();
        let key = engine.create_session_key(&session_id).await?;
        info!(session_id = %session_id, key_id = %key.source_key_id, "Session established");
        Ok(Self {
            engine,
            session_id,
            key,
            messages_sent: 0,
            max_messages: DEFAULT_MAX_MESSAGES,
        })
    }

    /// Join an existing session from a key shared out of band
    pub fn resume(engine: Arc<CryptoEngine>, key: SessionKey) -> Self {
        Self {
            session_id: key.session_id.clone(),
            engine,
            key,
            messages_sent: 0,
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }

    pub fn with_max_messages(mut self, max_messages: u64) -> Self {
        self.max_messages = max_messages;
        self
    }

    /// Encrypt the next message, rotating the session key at the cap
    pub async fn encrypt(&mut self, plaintext: &[u8]) -> KeyResult<SessionMessage> {
        if self.messages_sent >= self.max_messages {
            self.rotate().await?;
        }
        let counter = self.messages_sent;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let aad = serde_json::to_vec(&SessionAad {
            counter,
            session_id: &self.session_id,
        })?;

        let cipher = Aes256Gcm::new(&self.key.material.into());
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| KeyError::Encryption("Session encryption failed".to_string()))?;

        self.messages_sent += 1;
        debug!(session_id = %self.session_id, counter, "Session message encrypted");
        Ok(SessionMessage {
            session_id: self.session_id.clone(),
            key_id: self.key.source_key_id.clone(),
            counter,
            nonce: base64::encode(nonce),
            ciphertext: base64::encode(ciphertext),
            timestamp: Utc::now(),
        })
    }

    /// Decrypt a message sent under the session key currently in force
    pub fn decrypt(&self, message: &SessionMessage) -> KeyResult<Vec<u8>> {
        if message.session_id != self.session_id {
            return Err(KeyError::Validation(format!(
                "Message belongs to session {}, this is {}",
                message.session_id, self.session_id
            )));
        }
        if message.key_id != self.key.source_key_id {
            return Err(KeyError::UnknownKey(message.key_id.clone()));
        }

        let nonce = base64::decode(&message.nonce)
            .map_err(|_| KeyError::Decryption("Message nonce is not valid base64".to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(KeyError::Decryption(format!(
                "Nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }
        let ciphertext = base64::decode(&message.ciphertext).map_err(|_| {
            KeyError::Decryption("Message ciphertext is not valid base64".to_string())
        })?;
        let aad = serde_json::to_vec(&SessionAad {
            counter: message.counter,
            session_id: &self.session_id,
        })?;

        let cipher = Aes256Gcm::new(&self.key.material.into());
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| KeyError::Decryption("Session authentication tag rejected".to_string()))
    }

    async fn rotate(&mut self) -> KeyResult<()> {
        self.key = self.engine.create_session_key(&self.session_id).await?;
        self.messages_sent = 0;
        info!(
            session_id = %self.session_id,
            key_id = %self.key.source_key_id,
            "Session key rotated"
        );
        Ok(())
    }

    /// Key currently in force, for handing to the peer out of band
    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_types::PoolConfig;
    use crate::pool::KeyPool;
    use crate::source::testing::StaticKeySource;

    async fn engine_pair() -> (Arc<CryptoEngine>, Arc<CryptoEngine>) {
        let mut config = PoolConfig::new("alice", "bob");
        config.min_keys = 2;
        config.max_keys = 10;
        let pool = KeyPool::new(config, Arc::new(StaticKeySource::new())).await;
        (
            Arc::new(CryptoEngine::new(Arc::clone(&pool), "alice")),
            Arc::new(CryptoEngine::new(pool, "bob")),
        )
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (alice_engine, bob_engine) = engine_pair().await;
        let mut alice = SecureSession::establish(alice_engine, "sess-1").await.unwrap();
        let bob = SecureSession::resume(bob_engine, alice.session_key().clone());

        let message = alice.encrypt(b"hello session").await.unwrap();
        assert_eq!(message.counter, 0);
        assert_eq!(bob.decrypt(&message).unwrap(), b"hello session");

        let second = alice.encrypt(b"second").await.unwrap();
        assert_eq!(second.counter, 1);
        assert_eq!(bob.decrypt(&second).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_rotation_at_message_cap() {
        let (alice_engine, _) = engine_pair().await;
        let mut alice = SecureSession::establish(alice_engine, "sess-rot")
            .await
            .unwrap()
            .with_max_messages(3);
        let first_key_id = alice.session_key().source_key_id.clone();

        for _ in 0..3 {
            alice.encrypt(b"m").await.unwrap();
        }
        assert_eq!(alice.session_key().source_key_id, first_key_id);

        // the fourth message crosses the cap and rotates first
        let rotated = alice.encrypt(b"m").await.unwrap();
        assert_eq!(rotated.counter, 0);
        assert_ne!(alice.session_key().source_key_id, first_key_id);
    }

    #[tokio::test]
    async fn test_message_under_rotated_key_is_rejected() {
        let (alice_engine, bob_engine) = engine_pair().await;
        let mut alice = SecureSession::establish(alice_engine, "sess-2")
            .await
            .unwrap()
            .with_max_messages(1);
        let bob = SecureSession::resume(bob_engine, alice.session_key().clone());

        alice.encrypt(b"first").await.unwrap();
        let after_rotation = alice.encrypt(b"second").await.unwrap();

        let err = bob.decrypt(&after_rotation).unwrap_err();
        assert!(matches!(err, KeyError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn test_wrong_session_rejected() {
        let (alice_engine, bob_engine) = engine_pair().await;
        let mut alice = SecureSession::establish(alice_engine, "sess-a").await.unwrap();
        let bob = SecureSession::resume(bob_engine, alice.session_key().clone());

        let mut message = alice.encrypt(b"x").await.unwrap();
        message.session_id = "sess-b".to_string();
        let err = bob.decrypt(&message).unwrap_err();
        assert!(matches!(err, KeyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_tampered_session_ciphertext_rejected() {
        let (alice_engine, bob_engine) = engine_pair().await;
        let mut alice = SecureSession::establish(alice_engine, "sess-t").await.unwrap();
        let bob = SecureSession::resume(bob_engine, alice.session_key().clone());

        let mut message = alice.encrypt(b"intact").await.unwrap();
        let mut bytes = base64::decode(&message.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        message.ciphertext = base64::encode(bytes);

        let err = bob.decrypt(&message).unwrap_err();
        assert!(matches!(err, KeyError::Decryption(_)));
    }

    #[tokio::test]
    async fn test_counter_tamper_breaks_aad_binding() {
        let (alice_engine, bob_engine) = engine_pair().await;
        let mut alice = SecureSession::establish(alice_engine, "sess-c").await.unwrap();
        let bob = SecureSession::resume(bob_engine, alice.session_key().clone());

        let mut message = alice.encrypt(b"numbered").await.unwrap();
        message.counter += 1;
        let err = bob.decrypt(&message).unwrap_err();
        assert!(matches!(err, KeyError::Decryption(_)));
    }
}
