//! Relay and client configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file,
//! environment variables, CLI flags. The environment is read once by the binary
//! and passed in through [`RelayConfig::apply_env`]; library code never reads it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";
pub const DEFAULT_UPSTREAM_URL: &str = "https://ai.gateway.lovable.dev/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "google/gemini-3-flash-preview";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8787/roleplay-chat";
/// Cooldown applied after a 429 that carried no retry hint.
pub const DEFAULT_COOLDOWN_SECS: u64 = 5;

pub const ENV_API_KEY: &str = "RELAY_API_KEY";
pub const ENV_UPSTREAM_URL: &str = "RELAY_UPSTREAM_URL";
pub const ENV_MODEL: &str = "RELAY_MODEL";
pub const ENV_BIND: &str = "RELAY_BIND";
pub const ENV_ENDPOINT: &str = "RELAY_ENDPOINT";
pub const ENV_CLIENT_KEY: &str = "RELAY_CLIENT_KEY";

/// Server-side relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    pub upstream_url: String,
    pub model: String,
    /// Bearer credential for the hosted model. Never serialized back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
    /// Upper bound on waiting for the upstream response headers.
    pub request_timeout_secs: u64,
    /// Upper bound on the gap between two body chunks while piping a stream.
    pub idle_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            idle_timeout_secs: 60,
        }
    }
}

impl RelayConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read `path` when given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?),
            None => Ok(Self::default()),
        }
    }

    /// Overlay values found through `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(url) = lookup(ENV_UPSTREAM_URL) {
            self.upstream_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.model = model;
        }
        if let Some(bind) = lookup(ENV_BIND) {
            self.bind = bind;
        }
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// The credential, if one is configured and non-blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Client-side settings for talking to a relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub credential: Option<String>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub default_cooldown_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            credential: None,
            connect_timeout_secs: 5,
            read_timeout_secs: 60,
            default_cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Self::default() }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_toml_str(&std::fs::read_to_string(p)?),
            None => Ok(Self::default()),
        }
    }

    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Some(key) = lookup(ENV_CLIENT_KEY).filter(|v| !v.trim().is_empty()) {
            self.credential = Some(key);
        }
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn default_cooldown(&self) -> Duration {
        Duration::from_secs(self.default_cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_relay_defaults() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.bind, DEFAULT_BIND);
        assert_eq!(cfg.upstream_url, DEFAULT_UPSTREAM_URL);
        assert_eq!(cfg.model, DEFAULT_MODEL);
        assert!(cfg.api_key().is_none());
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_relay_partial_toml_keeps_defaults() {
        let cfg = RelayConfig::from_toml_str("model = \"gpt-4o-mini\"\nidle_timeout_secs = 5\n").unwrap();
        assert_eq!(cfg.model, "gpt-4o-mini");
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.upstream_url, DEFAULT_UPSTREAM_URL);
    }

    #[test]
    fn test_relay_invalid_toml_is_config_file_error() {
        let err = RelayConfig::from_toml_str("model = [").unwrap_err();
        assert!(matches!(err, crate::error::RelayError::ConfigFile(_)));
    }

    #[test]
    fn test_relay_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind = \"0.0.0.0:9000\"\napi_key = \"from-file\"").unwrap();
        let cfg = RelayConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:9000");
        assert_eq!(cfg.api_key(), Some("from-file"));
    }

    #[test]
    fn test_relay_load_missing_file_is_io_error() {
        let err = RelayConfig::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, crate::error::RelayError::Io(_)));
    }

    #[test]
    fn test_relay_env_overrides_file() {
        let cfg = RelayConfig::from_toml_str("model = \"a\"")
            .unwrap()
            .apply_env(env(&[(ENV_MODEL, "b"), (ENV_API_KEY, "sk-test")]));
        assert_eq!(cfg.model, "b");
        assert_eq!(cfg.api_key(), Some("sk-test"));
    }

    #[test]
    fn test_blank_api_key_counts_as_missing() {
        let cfg = RelayConfig::default().apply_env(env(&[(ENV_API_KEY, "   ")]));
        assert!(cfg.api_key().is_none());
        let cfg = RelayConfig::default().with_api_key("");
        assert!(cfg.api_key().is_none());
    }

    #[test]
    fn test_api_key_is_never_serialized() {
        let cfg = RelayConfig::default().with_api_key("secret");
        let out = toml::to_string(&cfg).unwrap();
        assert!(!out.contains("secret"));
    }

    #[test]
    fn test_client_defaults_and_env() {
        let cfg = ClientConfig::default().apply_env(env(&[
            (ENV_ENDPOINT, "http://relay.local/roleplay-chat"),
            (ENV_CLIENT_KEY, "pk"),
        ]));
        assert_eq!(cfg.endpoint, "http://relay.local/roleplay-chat");
        assert_eq!(cfg.credential.as_deref(), Some("pk"));
        assert_eq!(cfg.default_cooldown(), Duration::from_secs(DEFAULT_COOLDOWN_SECS));
    }

    #[test]
    fn test_client_new_sets_endpoint() {
        let cfg = ClientConfig::new("http://x/roleplay-chat");
        assert_eq!(cfg.endpoint, "http://x/roleplay-chat");
        assert_eq!(cfg.read_timeout(), Duration::from_secs(60));
    }
}
