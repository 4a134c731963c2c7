//! Error types for key pool and crypto operations
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


use qkdmate_client::ClientError;
use thiserror::Error;

/// Key pool and crypto engine errors
///
/// Every rejection is definite: nothing here is retried internally, and a
/// failed decryption never yields partial plaintext.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key pool exhausted: {0}")]
    Exhausted(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Message addressed to {actual}, this node is {expected}")]
    RecipientMismatch { expected: String, actual: String },

    #[error("Message is {age_secs}s old, freshness window is {window_secs}s")]
    StaleMessage { age_secs: i64, window_secs: i64 },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol client error: {0}")]
    Client(#[from] ClientError),
}

/// Result type for key operations
pub type KeyResult<T> = Result<T, KeyError>;
