//! Keystone Authentication
//!
//! Password authentication against Keystone v3. Credentials come from the
//! config file, `OS_*` environment variables, or the login prompt.

use super::catalog::ServiceCatalogEntry;
use super::client::HttpClient;
use super::error::{ApiError, Result};
use super::session::{AuthSession, ProjectRef, RoleRef, Token, UserRef};
use reqwest::header;
use serde::Deserialize;
use serde_json::{json, Value};
use zeroize::Zeroizing;

pub const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// How the token should be scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectScope {
    Id(String),
    /// Project by name. Domain defaults to the user's domain.
    Name {
        name: String,
        domain: Option<String>,
    },
}

/// Keystone password credentials.
#[derive(Clone)]
pub struct KeystoneAuthParams {
    pub auth_url: String,
    pub username: String,
    pub password: Zeroizing<String>,
    pub user_domain: String,
    pub project: Option<ProjectScope>,
}

impl std::fmt::Debug for KeystoneAuthParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeystoneAuthParams")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("user_domain", &self.user_domain)
            .field("project", &self.project)
            .finish()
    }
}

impl KeystoneAuthParams {
    /// `{auth_url}/auth/tokens`, trailing slashes removed first.
    pub fn tokens_url(&self) -> String {
        format!("{}/auth/tokens", self.auth_url.trim_end_matches('/'))
    }

    /// Password identity payload, project or domain scoped.
    pub fn payload(&self) -> Value {
        let scope = match &self.project {
            Some(ProjectScope::Id(id)) => json!({ "project": { "id": id } }),
            Some(ProjectScope::Name { name, domain }) => json!({
                "project": {
                    "name": name,
                    "domain": { "name": domain.as_deref().unwrap_or(&self.user_domain) }
                }
            }),
            None => json!({ "domain": { "name": self.user_domain } }),
        };

        json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.username,
                            "domain": { "name": self.user_domain },
                            "password": self.password.as_str(),
                        }
                    }
                },
                "scope": scope,
            }
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<ServiceCatalogEntry>,
    #[serde(default)]
    project: Option<ProjectRef>,
    #[serde(default)]
    user: Option<UserRef>,
    #[serde(default)]
    roles: Vec<RoleRef>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenRsp {
    #[serde(default)]
    token: TokenBody,
}

/// Detail text for a failed login.
fn auth_failure_detail(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(json) => json
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| json.to_string()),
        Err(_) if !body.trim().is_empty() => body.trim().to_string(),
        Err(_) => format!("Authentication failed with status {}", status.as_u16()),
    }
}

/// Authenticate and build a fresh session.
pub async fn authenticate(http: &HttpClient, params: &KeystoneAuthParams) -> Result<AuthSession> {
    let url = params.tokens_url();
    tracing::info!("Authenticating to: {}", url);

    let response = http
        .raw()
        .post(&url)
        .header(header::ACCEPT, "application/json")
        .header(header::CONTENT_TYPE, "application/json")
        .body(params.payload().to_string())
        .send()
        .await?;

    let status = response.status();
    let token = response
        .headers()
        .get(SUBJECT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let text = response.text().await?;

    if !status.is_success() {
        let detail = auth_failure_detail(status, &text);
        tracing::error!("Keystone authentication failed: {} - {}", status, detail);
        return Err(ApiError::Authentication(detail));
    }

    let token = token.ok_or(ApiError::MissingSubjectToken)?;
    let body: TokenRsp = if text.trim().is_empty() {
        TokenRsp::default()
    } else {
        serde_json::from_str(&text).map_err(|source| ApiError::Decode {
            url: url.clone(),
            source,
        })?
    };

    tracing::info!(
        "Authenticated, catalog has {} services",
        body.token.catalog.len()
    );

    Ok(AuthSession {
        auth_url: params.auth_url.trim_end_matches('/').to_string(),
        token: Token::new(token),
        catalog: body.token.catalog,
        project: body.token.project,
        user: body.token.user,
        roles: body.token.roles,
    })
}
