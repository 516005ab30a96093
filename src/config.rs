//! Configuration loading (§6 "Storage").
//!
//! Defines the JSON document shape and a loader. CLI flags, JWT
//! validation, and CORS plumbing are out of scope here — this module
//! only owns parsing the document into [`Config`].

use std::collections::HashMap;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Result, SignetError};

/// One configured key: either a plaintext nsec/hex secret, or an
/// `{iv, data}` pair already wrapped under a passphrase the operator
/// will supply via `POST /keys/:name/unlock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfiguredKey {
    Plain { key: String },
    Encrypted { iv: String, data: String },
}

/// Top-level config document (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relays: Vec<String>,

    #[serde(default)]
    pub keys: HashMap<String, ConfiguredKey>,

    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    pub admin_secret: Option<String>,

    pub jwt_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            keys: HashMap::new(),
            bind: default_bind(),
            base_url: default_base_url(),
            admin_secret: None,
            jwt_secret: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_base_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

impl Config {
    /// Load the JSON config document at `path`, or a bare default if it
    /// does not exist yet.
    pub async fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).await?;
        serde_json::from_str(&content).map_err(SignetError::Serialization)
    }

    /// Persist the current document back to `path` (used after config-
    /// affecting control-plane operations, e.g. relay list edits).
    pub async fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self).map_err(SignetError::Serialization)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Default config file location, following the teacher's
    /// `ProjectDirs`-based resolution.
    pub fn default_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "signet", "Signet")
            .ok_or_else(|| SignetError::Config("could not determine config directory".into()))?;
        Ok(proj_dirs.config_dir().join("config.json"))
    }

    /// Default sqlite database path, next to the config file.
    pub fn default_database_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "signet", "Signet")
            .ok_or_else(|| SignetError::Config("could not determine data directory".into()))?;
        Ok(proj_dirs.data_dir().join("signet.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_plain_and_encrypted_keys() {
        let json = r#"{
            "relays": ["wss://relay.example.com"],
            "keys": {
                "alice": {"key": "nsec1xxx"},
                "bob": {"iv": "deadbeef", "data": "cafebabe"}
            },
            "bind": "0.0.0.0:9000",
            "base_url": "https://signet.example.com",
            "admin_secret": "s3cret"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.relays, vec!["wss://relay.example.com"]);
        assert!(matches!(config.keys.get("alice"), Some(ConfiguredKey::Plain { .. })));
        assert!(matches!(config.keys.get("bob"), Some(ConfiguredKey::Encrypted { .. })));
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert!(config.jwt_secret.is_none());
    }

    #[tokio::test]
    async fn missing_file_yields_default() {
        let path = PathBuf::from("/nonexistent/path/signet-config-test.json");
        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.bind, default_bind());
    }
}
