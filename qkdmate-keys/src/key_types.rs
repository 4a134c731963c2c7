//! Key and pool type definitions
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


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Unique identifier for a quantum key
pub type KeyId = String;

/// A single-use symmetric key of quantum origin
///
/// Lifecycle is strictly one-way: available, then used, then evicted.
/// The secret material round-trips through persistence hex-encoded, the
/// timestamps as RFC 3339 text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumKey {
    pub key_id: KeyId,
    #[serde(with = "hex_bytes")]
    pub key_data: Vec<u8>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub used_at: Option<DateTime<Utc>>,
    /// Partner SAE this key is shared with
    #[serde(default)]
    pub partner: String,
    #[serde(default)]
    pub is_used: bool,
}

/// Key pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// This node's SAE identifier
    pub node_id: String,
    /// The partner SAE's identifier
    pub partner_id: String,
    /// Refill triggers when the available count drops below this
    pub min_keys: usize,
    /// Hard cap on the available set
    pub max_keys: usize,
    /// Keys older than this are evicted by maintenance
    pub max_key_age_hours: i64,
    /// Snapshot file for the pool; in-memory only when unset
    pub storage_path: Option<PathBuf>,
}

impl PoolConfig {
    pub fn new(node_id: impl Into<String>, partner_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            partner_id: partner_id.into(),
            min_keys: 10,
            max_keys: 50,
            max_key_age_hours: 24,
            storage_path: None,
        }
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub node_id: String,
    pub available_keys: usize,
    pub used_keys: usize,
    pub min_threshold: usize,
    pub max_capacity: usize,
    pub oldest_key_age_secs: Option<i64>,
}

/// On-disk pool snapshot
#[derive(Debug, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub key_pool: HashMap<KeyId, QuantumKey>,
    pub used_keys: HashMap<KeyId, QuantumKey>,
    pub saved_at: DateTime<Utc>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(serde::de::Error::custom)
    }
}
