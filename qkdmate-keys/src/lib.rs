//! Quantum key pool and crypto engine
//!
//! Turns the single-use keys delivered over the ETSI GS QKD 014 API into
//! usable message encryption: a thread-safe pool with threshold refill,
//! expiry and persistence, and an authenticated-encryption engine with
//! session-key derivation on top of it.
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


pub mod crypto;
pub mod error;
pub mod key_types;
pub mod pool;
pub mod session;
pub mod source;

pub use crypto::{CryptoEngine, CryptoStats, EncryptedEnvelope};
pub use error::{KeyError, KeyResult};
pub use key_types::{KeyId, PoolConfig, PoolStatus, QuantumKey};
pub use pool::KeyPool;
pub use session::{SecureSession, SessionKey, SessionMessage};
pub use source::{EtsiKeySource, KeySource, SaeRole};
