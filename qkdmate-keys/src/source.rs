//! Key source seam between the pool and the delivery protocol
//!
//! The pool replenishes itself through this trait so that both SAE roles
//! share one pool implementation and tests can inject an in-memory source.
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
use async_trait::async_trait;
use qkdmate_client::{DeliveredKey, EtsiClient, KeyRequestParams};

/// The two SAE roles of the delivery protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaeRole {
    /// Initiates key requests and distributes key identifiers
    Master,
    /// Retrieves identical key material by identifier
    Slave,
}

/// Backend that hands quantum keys to a pool
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Request `count` fresh keys (master path)
    async fn fetch_new(&self, count: usize) -> KeyResult<Vec<DeliveredKey>>;

    /// Retrieve keys previously issued to the partner, by identifier
    /// (slave path)
    async fn fetch_by_ids(&self, key_ids: &[String]) -> KeyResult<Vec<DeliveredKey>>;
}

/// Role-aware `KeySource` over an ETSI QKD 014 client
///
/// Calling the operation the role does not own is a validation error; the
/// KME would reject it anyway, this just keeps the mistake local.
pub struct EtsiKeySource {
    client: EtsiClient,
    partner_id: String,
    role: SaeRole,
}

impl EtsiKeySource {
    /// Master-side source: refills via `enc_keys` requests
    pub fn master(client: EtsiClient, partner_id: impl Into<String>) -> Self {
        Self {
            client,
            partner_id: partner_id.into(),
            role: SaeRole::Master,
        }
    }

    /// Slave-side source: imports keys via `dec_keys` retrieval
    pub fn slave(client: EtsiClient, partner_id: impl Into<String>) -> Self {
        Self {
            client,
            partner_id: partner_id.into(),
            role: SaeRole::Slave,
        }
    }

    pub fn role(&self) -> SaeRole {
        self.role
    }
}

#[async_trait]
impl KeySource for EtsiKeySource {
    async fn fetch_new(&self, count: usize) -> KeyResult<Vec<DeliveredKey>> {
        if self.role != SaeRole::Master {
            return Err(KeyError::Validation(
                "Only the master SAE can request new keys".to_string(),
            ));
        }
        let params = KeyRequestParams {
            number: Some(count as u32),
            ..Default::default()
        };
        Ok(self.client.request_keys(&self.partner_id, params).await?)
    }

    async fn fetch_by_ids(&self, key_ids: &[String]) -> KeyResult<Vec<DeliveredKey>> {
        if self.role != SaeRole::Slave {
            return Err(KeyError::Validation(
                "Only the slave SAE retrieves keys by identifier".to_string(),
            ));
        }
        Ok(self.client.retrieve_keys(&self.partner_id, key_ids).await?)
    }
}
