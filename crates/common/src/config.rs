//! API configuration
//!
//! All options live in a single TOML file. Secrets are referenced by path
//! and read once at startup so the config file itself carries no credentials.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level API configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ApiConfig {
    pub repository: RepositoryConfig,
    pub ci: CiConfig,
    pub badge: BadgeConfig,
    pub store: StoreConfig,
    pub limits: LimitsConfig,
}

/// Code-hosting backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Repository backend name
    pub backend: String,

    /// Organization owning the controlled repositories
    pub org: String,

    /// Path to the access token file
    pub token_path: PathBuf,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            backend: "github".to_string(),
            org: "eosc-synergy".to_string(),
            token_path: PathBuf::from("/etc/sqaaas/github.token"),
        }
    }
}

/// CI engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CiConfig {
    /// CI endpoint URL
    pub endpoint: String,

    /// API user
    pub user: String,

    /// Path to the API token file
    pub token_path: PathBuf,

    /// Hosting organization scanned for new repositories and branches
    pub org: String,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://jenkins.eosc-synergy.eu".to_string(),
            user: "sqaaas".to_string(),
            token_path: PathBuf::from("/etc/sqaaas/jenkins.token"),
            org: "eosc-synergy-org".to_string(),
        }
    }
}

/// Credential issuer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BadgeConfig {
    /// Issuer endpoint URL
    pub endpoint: String,

    /// API user
    pub user: String,

    /// Path to the user password file
    pub password_path: PathBuf,

    /// Issuer display name, matched exactly when resolving the badge class
    pub issuer: String,

    /// Badge-class display name within the issuer
    pub badgeclass: String,
}

impl Default for BadgeConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.badgr.io".to_string(),
            user: String::new(),
            password_path: PathBuf::from("/etc/sqaaas/badgr.passwd"),
            issuer: "SQAaaS Issuer".to_string(),
            badgeclass: "SQAaaS Badge".to_string(),
        }
    }
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the persistent state file
    pub db_file: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_file: PathBuf::from("/sqaaas/sqaaas.json"),
        }
    }
}

/// Resource ceilings for outbound work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Deadline for each outbound gateway call, in seconds
    pub request_timeout_secs: u64,

    /// Hard wall-clock ceiling for a repository mirroring, in seconds
    pub mirror_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            mirror_timeout_secs: 300,
        }
    }
}

impl ApiConfig {
    /// Load configuration from file, falling back to defaults when absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Read a secret file, trimming the trailing newline.
pub fn read_secret(path: &Path) -> crate::Result<String> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        crate::Error::InvalidConfig(format!("cannot read secret {}: {}", path.display(), e))
    })?;
    Ok(raw.trim().to_string())
}
