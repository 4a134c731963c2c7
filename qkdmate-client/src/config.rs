//! Configuration loading for KME endpoints
//!
//! Node configs are YAML files; a file may name a base config with
//! `extends`, which is layered underneath it (nested maps deep-merged,
//! local values win). Credential paths are resolved relative to the
//! config file unless absolute.

use crate::error::{ClientError, ClientResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DEFAULT_TIMEOUT_SEC: u64 = 10;
const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_DELAY_MS: u64 = 800;

const DEFAULT_STATUS_PATH: &str = "/api/v1/keys/{slave_id}/status";
const DEFAULT_ENC_KEYS_PATH: &str = "/api/v1/keys/{slave_id}/enc_keys";
const DEFAULT_DEC_KEYS_PATH: &str = "/api/v1/keys/{master_id}/dec_keys";

/// Resolved KME endpoint configuration, immutable after construction
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the KME (e.g. `https://kme.example.com:443`)
    pub endpoint: String,
    /// Client certificate path (mTLS)
    pub cert: PathBuf,
    /// Client private key path (PKCS#8 PEM)
    pub key: PathBuf,
    /// CA certificate path used to verify the KME
    pub ca: PathBuf,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    /// Extra attempts after the first on transport failures
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Fixed pause between attempts, in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Logical operation name -> URL path template with `{slave_id}` /
    /// `{master_id}` placeholders
    #[serde(default)]
    pub api_paths: HashMap<String, String>,
    /// Whether to verify the KME hostname against its certificate
    #[serde(default = "default_verify_hostname")]
    pub verify_hostname: bool,
    /// Base config file this one extends, if any
    #[serde(default)]
    pub extends: Option<String>,
}

fn default_timeout_sec() -> u64 {
    DEFAULT_TIMEOUT_SEC
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_delay_ms() -> u64 {
    DEFAULT_DELAY_MS
}

fn default_verify_hostname() -> bool {
    true
}

impl ClientConfig {
    /// Build a configuration programmatically with default timeouts and
    /// the standard ETSI API paths
    pub fn new(
        endpoint: impl Into<String>,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
        ca: impl Into<PathBuf>,
    ) -> Self {
        let mut config = Self {
            endpoint: endpoint.into(),
            cert: cert.into(),
            key: key.into(),
            ca: ca.into(),
            timeout_sec: DEFAULT_TIMEOUT_SEC,
            retries: DEFAULT_RETRIES,
            delay_ms: DEFAULT_DELAY_MS,
            api_paths: HashMap::new(),
            verify_hostname: true,
            extends: None,
        };
        config.normalize(Path::new("."));
        config
    }

    /// Load a configuration from a YAML file, resolving one level of
    /// `extends` inheritance
    pub fn load<P: AsRef<Path>>(path: P) -> ClientResult<Self> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        let probe = config::Config::builder()
            .add_source(yaml_source(path))
            .build()
            .map_err(|e| {
                ClientError::Configuration(format!(
                    "Failed to read config {}: {}",
                    path.display(),
                    e
                ))
            })?;

        // Layer the base file underneath so local values win on conflicts
        // and nested maps merge.
        let mut builder = config::Config::builder();
        if let Ok(base) = probe.get_string("extends") {
            builder = builder.add_source(yaml_source(&dir.join(base)));
        }
        let merged = builder
            .add_source(yaml_source(path))
            .build()
            .map_err(|e| {
                ClientError::Configuration(format!(
                    "Failed to merge config {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let mut config: ClientConfig = merged.try_deserialize().map_err(|e| {
            ClientError::Configuration(format!(
                "Malformed config {}: {}",
                path.display(),
                e
            ))
        })?;

        config.normalize(dir);
        Ok(config)
    }

    fn normalize(&mut self, dir: &Path) {
        self.endpoint = self.endpoint.trim_end_matches('/').to_string();
        self.cert = resolve_path(dir, &self.cert);
        self.key = resolve_path(dir, &self.key);
        self.ca = resolve_path(dir, &self.ca);

        for (op, template) in [
            ("status", DEFAULT_STATUS_PATH),
            ("enc_keys", DEFAULT_ENC_KEYS_PATH),
            ("dec_keys", DEFAULT_DEC_KEYS_PATH),
        ] {
            self.api_paths
                .entry(op.to_string())
                .or_insert_with(|| template.to_string());
        }
    }
}

fn yaml_source(path: &Path) -> config::File<config::FileSourceFile, config::FileFormat> {
    config::File::new(&path.to_string_lossy(), config::FileFormat::Yaml)
}

fn resolve_path(dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}
