//! mTLS client for the ETSI GS QKD 014 key delivery API
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


use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::types::{DeliveredKey, KeyDelivery, KeyRequestParams, StatusResponse};
use reqwest::{Certificate, Client, Identity, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Client for one KME endpoint
///
/// Construction fails fast with a configuration error when any credential
/// file is missing; no network traffic happens before the first operation.
#[derive(Debug)]
pub struct EtsiClient {
    client: Client,
    config: ClientConfig,
}

impl EtsiClient {
    /// Create a client from a resolved configuration
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        for (label, path) in [
            ("client certificate", &config.cert),
            ("client private key", &config.key),
            ("CA certificate", &config.ca),
        ] {
            if !path.exists() {
                return Err(ClientError::Configuration(format!(
                    "{} not found: {}",
                    label,
                    path.display()
                )));
            }
        }

        let cert_data = std::fs::read(&config.cert).map_err(|e| {
            ClientError::Configuration(format!(
                "Failed to read client certificate {}: {}",
                config.cert.display(),
                e
            ))
        })?;
        let key_data = std::fs::read(&config.key).map_err(|e| {
            ClientError::Configuration(format!(
                "Failed to read private key {}: {}",
                config.key.display(),
                e
            ))
        })?;
        let identity = Identity::from_pkcs8_pem(&cert_data, &key_data).map_err(|e| {
            ClientError::Configuration(format!("Failed to load client identity: {}", e))
        })?;

        let ca_data = std::fs::read(&config.ca).map_err(|e| {
            ClientError::Configuration(format!(
                "Failed to read CA certificate {}: {}",
                config.ca.display(),
                e
            ))
        })?;
        let ca_cert = Certificate::from_pem(&ca_data).map_err(|e| {
            ClientError::Configuration(format!("Invalid CA certificate: {}", e))
        })?;

        let mut builder = Client::builder()
            .identity(identity)
            .add_root_certificate(ca_cert)
            .timeout(Duration::from_secs(config.timeout_sec));

        if !config.verify_hostname {
            warn!("TLS hostname verification disabled by configuration");
            builder = builder.danger_accept_invalid_hostnames(true);
        }

        let client = builder.build().map_err(|e| {
            ClientError::Configuration(format!("Failed to build HTTP client: {}", e))
        })?;

        info!(endpoint = %config.endpoint, "ETSI QKD client ready");
        Ok(Self { client, config })
    }

    /// GET `<status-path>` for the link towards `slave_id`
    pub async fn get_status(&self, slave_id: &str) -> ClientResult<StatusResponse> {
        let url = self.url("status", "{slave_id}", slave_id);
        debug!(%url, "Fetching QKD link status");
        let response = self.send_with_retry(self.client.get(&url)).await?;
        self.handle(response).await
    }

    /// GET the `enc_keys` path to request fresh keys for `slave_id`
    /// (master role)
    ///
    /// A `size` that is not a multiple of 8 is rejected locally before any
    /// network call.
    pub async fn request_keys(
        &self,
        slave_id: &str,
        params: KeyRequestParams,
    ) -> ClientResult<Vec<DeliveredKey>> {
        if let Some(size) = params.size {
            if size % 8 != 0 {
                return Err(ClientError::Validation(format!(
                    "Key size must be a multiple of 8 bits, got {}",
                    size
                )));
            }
        }

        let url = self.url("enc_keys", "{slave_id}", slave_id);
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(number) = params.number {
            query.push(("number", number.to_string()));
        }
        if let Some(size) = params.size {
            query.push(("size", size.to_string()));
        }
        if !params.additional_slave_sae_ids.is_empty() {
            query.push((
                "additional_slave_SAE_IDs",
                params.additional_slave_sae_ids.join(","),
            ));
        }
        if let Some(ext) = &params.extension_mandatory {
            query.push(("extension_mandatory", serde_json::to_string(ext)?));
        }
        if let Some(ext) = &params.extension_optional {
            query.push(("extension_optional", serde_json::to_string(ext)?));
        }

        debug!(%url, count = params.number.unwrap_or(1), "Requesting quantum keys");
        let response = self
            .send_with_retry(self.client.get(&url).query(&query))
            .await?;
        let delivery: KeyDelivery = self.handle(response).await?;
        Ok(delivery.into_delivered())
    }

    /// GET the `dec_keys` path to retrieve keys by identifier (slave role)
    ///
    /// An empty id list is rejected locally. A single id uses the
    /// `key_ID` query form, several ids the comma-joined `key_IDs` form.
    pub async fn retrieve_keys(
        &self,
        master_id: &str,
        key_ids: &[String],
    ) -> ClientResult<Vec<DeliveredKey>> {
        if key_ids.is_empty() {
            return Err(ClientError::Validation(
                "At least one key_ID is required to retrieve keys".to_string(),
            ));
        }

        let url = self.url("dec_keys", "{master_id}", master_id);
        let query: Vec<(&str, String)> = if key_ids.len() == 1 {
            vec![("key_ID", key_ids[0].clone())]
        } else {
            vec![("key_IDs", key_ids.join(","))]
        };

        debug!(%url, count = key_ids.len(), "Retrieving quantum keys by id");
        let response = self
            .send_with_retry(self.client.get(&url).query(&query))
            .await?;
        let delivery: KeyDelivery = self.handle(response).await?;
        Ok(delivery.into_delivered())
    }

    fn url(&self, op: &str, placeholder: &str, id: &str) -> String {
        let template = self
            .config
            .api_paths
            .get(op)
            .map(String::as_str)
            .unwrap_or(op);
        format!("{}{}", self.config.endpoint, template.replace(placeholder, id))
    }

    /// Send a request, retrying transport-level failures only.
    ///
    /// Connection and timeout errors are retried up to `retries` extra
    /// attempts with a fixed pause; anything the server actually answered
    /// is passed through untouched, and the final attempt's failure is the
    /// one that propagates.
    async fn send_with_retry(&self, request: reqwest::RequestBuilder) -> ClientResult<Response> {
        let tries = self.config.retries + 1;
        let delay = Duration::from_millis(self.config.delay_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let cloned = request.try_clone().ok_or_else(|| {
                ClientError::InvalidResponse("Request body is not cloneable".to_string())
            })?;
            match cloned.send().await {
                Ok(response) => return Ok(response),
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt < tries => {
                    warn!(attempt, tries, error = %e, "Transport failure contacting KME, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(ClientError::Transport(e)),
            }
        }
    }

    /// Translate an HTTP response into a typed result.
    ///
    /// Non-2xx responses become protocol errors; the ETSI error body's
    /// `message` field is extracted when present, otherwise the status and
    /// raw body are reported.
    async fn handle<T: DeserializeOwned>(&self, response: Response) -> ClientResult<T> {
        let status = response.status();
        let url = response.url().clone();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_else(|| format!("HTTP {} on {}: {}", status.as_u16(), url, body));
            return Err(ClientError::Protocol {
                status: status.as_u16(),
                message,
            });
        }
        response.json::<T>().await.map_err(|e| {
            ClientError::InvalidResponse(format!("Failed to parse KME response: {}", e))
        })
    }
}
