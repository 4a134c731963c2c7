//! ETSI GS QKD 014 key-delivery client
//!
//! Implements the REST-based key delivery API between a SAE (Secure
//! Application Entity) and its local KME (Key Management Entity):
//! - status of the QKD link towards a partner SAE
//! - key requests (master role)
//! - key retrieval by identifier (slave role)
//!
//! All traffic runs over mutually authenticated TLS; transport failures are
//! retried, protocol rejections are not.
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


pub mod client;
pub mod config;
pub mod error;
pub mod types;

pub use client::EtsiClient;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use types::{DeliveredKey, KeyRequestParams, StatusResponse};
