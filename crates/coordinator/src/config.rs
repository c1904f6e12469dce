//! Coordinator configuration

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ipnetwork::IpNetwork;
use meshgate_common::{Error, MachinePrivate, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Database path override
    pub db_path: Option<PathBuf>,

    /// Public URL machines are sent to for interactive approval
    pub server_url: String,

    /// Path to the coordinator's long-term private key
    pub private_key_path: Option<PathBuf>,

    /// Address prefixes, allocated in this order
    pub ip_prefixes: Vec<IpNetwork>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            store_path: meshgate_common::default_store_path(),
            db_path: None,
            server_url: "http://127.0.0.1:8080".to_string(),
            private_key_path: None,
            ip_prefixes: default_prefixes(),
        }
    }
}

fn default_prefixes() -> Vec<IpNetwork> {
    ["100.64.0.0/10", "fd7a:115c:a1e0::/48"]
        .iter()
        .map(|p| p.parse().expect("built-in prefix is valid"))
        .collect()
}

impl CoordinatorConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the allocator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.ip_prefixes.is_empty() {
            return Err(Error::InvalidConfig(
                "ip_prefixes must contain at least one prefix".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for prefix in &self.ip_prefixes {
            if !seen.insert((prefix.network(), prefix.prefix())) {
                return Err(Error::InvalidConfig(format!(
                    "ip_prefixes lists {} more than once",
                    prefix
                )));
            }
        }

        if self.server_url.is_empty() {
            return Err(Error::InvalidConfig("server_url must not be empty".to_string()));
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("state.db"))
    }

    /// Get the private key path
    pub fn private_key_path(&self) -> PathBuf {
        self.private_key_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("private.key"))
    }

    /// Read the coordinator key, generating and persisting one on first use
    pub fn load_or_generate_private_key(&self) -> Result<MachinePrivate> {
        let path = self.private_key_path();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            return MachinePrivate::parse(content.trim());
        }

        let key = MachinePrivate::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, key.to_prefixed_hex())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(path = %path.display(), public = %key.public().short_string(), "Generated coordinator private key");
        Ok(key)
    }
}
