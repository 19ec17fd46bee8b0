//! Configuration Module
//!
//! Persistent configuration for nimbus, plus the `OS_*` environment
//! overrides the OpenStack command line clients use.

use crate::openstack::auth::ProjectScope;
use crate::openstack::catalog::{EndpointSelector, Interface};
use crate::openstack::mock::MockTimings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_USER_DOMAIN: &str = "Default";

/// Persistent configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Keystone v3 URL
    #[serde(default)]
    pub auth_url: Option<String>,

    /// Last used username
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub user_domain: Option<String>,

    /// Project name to scope to
    #[serde(default)]
    pub project: Option<String>,

    #[serde(default)]
    pub project_domain: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// public, internal or admin
    #[serde(default)]
    pub interface: Option<String>,

    /// Serve everything from the in-memory mock backend
    #[serde(default)]
    pub mock_services: bool,

    #[serde(default)]
    pub mock_delay_ms: Option<u64>,
}

/// Configuration after environment overrides are applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub auth_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<Zeroizing<String>>,
    pub user_domain: String,
    pub project: Option<ProjectScope>,
    pub selector: EndpointSelector,
    pub mock: bool,
    pub mock_timings: MockTimings,
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    /// Load configuration from disk
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring config at {}: {:#}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or_else(|| anyhow::anyhow!("No config directory"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, &content)?;

        // Credentials-adjacent, keep it private
        #[cfg(unix)]
        {
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, permissions)?;
        }

        Ok(())
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::dir().map(|dir| dir.join("config.json"))
    }

    /// `<config_dir>/nimbus`, or `~/.nimbus` without a config dir.
    pub fn dir() -> Option<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            return Some(config_dir.join("nimbus"));
        }
        dirs::home_dir().map(|home| home.join(".nimbus"))
    }

    /// Apply process environment overrides.
    pub fn settings(&self) -> Settings {
        self.settings_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `env`. Environment wins over the file.
    pub fn settings_with(&self, env: impl Fn(&str) -> Option<String>) -> Settings {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let user_domain = var("OS_USER_DOMAIN_NAME")
            .or_else(|| self.user_domain.clone())
            .unwrap_or_else(|| DEFAULT_USER_DOMAIN.to_string());

        let project_domain = var("OS_PROJECT_DOMAIN_NAME").or_else(|| self.project_domain.clone());
        let project = match (var("OS_PROJECT_ID"), var("OS_PROJECT_NAME")) {
            (Some(id), _) => Some(ProjectScope::Id(id)),
            (None, Some(name)) => Some(ProjectScope::Name {
                name,
                domain: project_domain,
            }),
            (None, None) => self.project.clone().map(|name| ProjectScope::Name {
                name,
                domain: project_domain,
            }),
        };

        let interface = match var("OS_INTERFACE").or_else(|| self.interface.clone()) {
            Some(raw) => raw.parse::<Interface>().unwrap_or_else(|e| {
                tracing::warn!("{}, using public", e);
                Interface::Public
            }),
            None => Interface::Public,
        };

        let mock = var("NIMBUS_MOCK")
            .map(|v| truthy(&v))
            .unwrap_or(self.mock_services);

        let mut mock_timings = MockTimings::default();
        if let Some(ms) = self.mock_delay_ms {
            mock_timings.delay = Duration::from_millis(ms);
        }

        Settings {
            auth_url: var("OS_AUTH_URL").or_else(|| self.auth_url.clone()),
            username: var("OS_USERNAME").or_else(|| self.username.clone()),
            password: var("OS_PASSWORD").map(Zeroizing::new),
            user_domain,
            project,
            selector: EndpointSelector {
                interface,
                region: var("OS_REGION_NAME").or_else(|| self.region.clone()),
            },
            mock,
            mock_timings,
        }
    }

    /// Remember what a successful login used.
    pub fn remember_login(&mut self, auth_url: &str, username: &str) -> Result<()> {
        self.auth_url = Some(auth_url.to_string());
        self.username = Some(username.to_string());
        self.save()
    }
}
