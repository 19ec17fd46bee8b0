//! Authenticated session
//!
//! A session is produced by a Keystone login, by the mock bypass, or by
//! importing an exported session document. It is never patched in place: a
//! new login replaces the whole value.

use super::catalog::{EndpointSelector, ServiceCatalogEntry};
use super::error::{ApiError, Result, ServiceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Opaque bearer token, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Zeroizing<String>);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    #[serde(default)]
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub auth_url: String,
    pub token: Token,
    pub catalog: Vec<ServiceCatalogEntry>,
    pub project: Option<ProjectRef>,
    pub user: Option<UserRef>,
    pub roles: Vec<RoleRef>,
}

impl AuthSession {
    pub fn project_id(&self) -> Option<&str> {
        self.project.as_ref().map(|p| p.id.as_str())
    }

    /// Base URL for a service, or `EndpointNotFound`.
    pub fn endpoint(&self, kind: ServiceKind, selector: &EndpointSelector) -> Result<String> {
        selector
            .resolve(&self.catalog, kind)
            .ok_or(ApiError::EndpointNotFound(kind))
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r.name == "admin")
    }

    pub fn export(&self) -> SessionExport {
        SessionExport {
            auth_url: self.auth_url.clone(),
            auth_token: self.token.as_str().to_string(),
            service_catalog: self.catalog.clone(),
            project: self.project.clone(),
            user: self.user.clone(),
            roles: Some(self.roles.clone()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    /// Parse and validate an exported session document.
    pub fn import_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ApiError::InvalidSession(format!("not valid JSON: {}", e)))?;
        Self::import_value(value)
    }

    pub fn import_value(value: Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ApiError::InvalidSession("expected a JSON object".to_string()))?;

        for field in ["authUrl", "authToken", "serviceCatalog"] {
            match obj.get(field) {
                None | Some(Value::Null) => {
                    return Err(ApiError::InvalidSession(format!(
                        "missing required field '{}'",
                        field
                    )))
                }
                Some(Value::String(s)) if s.is_empty() => {
                    return Err(ApiError::InvalidSession(format!(
                        "required field '{}' is empty",
                        field
                    )))
                }
                _ => {}
            }
        }
        if !obj.get("serviceCatalog").is_some_and(Value::is_array) {
            return Err(ApiError::InvalidSession(
                "'serviceCatalog' must be an array".to_string(),
            ));
        }

        let export: SessionExport = serde_json::from_value(value)
            .map_err(|e| ApiError::InvalidSession(e.to_string()))?;
        Ok(Self::from_export(export))
    }

    pub fn from_export(export: SessionExport) -> Self {
        if export.service_catalog.is_empty() {
            tracing::warn!("Imported session has an empty service catalog");
        }
        Self {
            auth_url: export.auth_url,
            token: Token::new(export.auth_token),
            catalog: export.service_catalog,
            project: export.project,
            user: export.user,
            roles: export.roles.unwrap_or_default(),
        }
    }

    /// Default location of the persisted session.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            return Some(config_dir.join("nimbus").join("session.json"));
        }
        dirs::home_dir().map(|home| home.join(".nimbus").join("session.json"))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;

        #[cfg(unix)]
        {
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, permissions)?;
        }

        Ok(())
    }

    /// `Ok(None)` when no session was saved.
    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Self::import_json(&text).map(Some)
    }
}

/// Portable session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExport {
    pub auth_url: String,
    pub auth_token: String,
    pub service_catalog: Vec<ServiceCatalogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<RoleRef>>,
}
