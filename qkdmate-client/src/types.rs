//! Wire types for the ETSI GS QKD 014 REST API
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


use serde::Deserialize;

/// QKD link status as reported by the KME
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "source_KME_ID")]
    pub source_kme_id: String,
    #[serde(rename = "target_KME_ID")]
    pub target_kme_id: String,
    #[serde(rename = "master_SAE_ID")]
    pub master_sae_id: String,
    #[serde(rename = "slave_SAE_ID")]
    pub slave_sae_id: String,
    pub key_size: u64,
    pub stored_key_count: u64,
    pub max_key_count: u64,
    pub max_key_per_request: u64,
    pub max_key_size: u64,
    pub min_key_size: u64,
    #[serde(rename = "max_SAE_ID_count")]
    pub max_sae_id_count: u64,
    #[serde(default)]
    pub status_extension: Option<serde_json::Value>,
}

/// Optional parameters for a master-side key request
#[derive(Debug, Clone, Default)]
pub struct KeyRequestParams {
    /// Number of keys requested (server default: 1)
    pub number: Option<u32>,
    /// Size of each key in bits; must be a multiple of 8
    pub size: Option<u32>,
    /// Additional slave SAE IDs for multicast delivery
    pub additional_slave_sae_ids: Vec<String>,
    /// Implementation-defined mandatory extensions
    pub extension_mandatory: Option<serde_json::Value>,
    /// Implementation-defined optional extensions
    pub extension_optional: Option<serde_json::Value>,
}

/// One key as handed back by the KME
///
/// `key_id` is absent when the server delivered bare material; the key pool
/// synthesizes a local identifier in that case.
#[derive(Debug, Clone)]
pub struct DeliveredKey {
    pub key_id: Option<String>,
    pub material: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct KeyEntry {
    #[serde(rename = "key_ID", default)]
    pub key_id: Option<String>,
    pub key: String,
}

/// Every response shape a KME is known to hand back for a key delivery,
/// validated at the deserialization boundary: the standard key container,
/// a bare single-key object, or an opaque body treated as one key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum KeyDelivery {
    Container { keys: Vec<KeyEntry> },
    Single { key_data: String },
    Opaque(serde_json::Value),
}

impl KeyDelivery {
    pub(crate) fn into_delivered(self) -> Vec<DeliveredKey> {
        match self {
            KeyDelivery::Container { keys } => keys
                .into_iter()
                .map(|entry| DeliveredKey {
                    key_id: entry.key_id,
                    material: decode_key_material(&entry.key),
                })
                .collect(),
            KeyDelivery::Single { key_data } => vec![DeliveredKey {
                key_id: None,
                material: decode_key_material(&key_data),
            }],
            KeyDelivery::Opaque(value) => vec![DeliveredKey {
                key_id: None,
                material: value.to_string().into_bytes(),
            }],
        }
    }
}

/// Decode key material from the encodings KMEs are known to use:
/// base64 (the ETSI standard form), then hex, then raw bytes as-is.
pub(crate) fn decode_key_material(raw: &str) -> Vec<u8> {
    if let Ok(bytes) = base64::decode(raw) {
        return bytes;
    }
    if let Ok(bytes) = hex::decode(raw) {
        return bytes;
    }
    raw.as_bytes().to_vec()
}
