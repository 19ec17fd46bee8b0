//! Error types for OpenStack operations.

use std::fmt;
use thiserror::Error;

/// Result type alias for OpenStack operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Services the console resolves from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Compute,
    Volume,
    Network,
    Image,
    Identity,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceKind::Compute => "Compute",
            ServiceKind::Volume => "Volume",
            ServiceKind::Network => "Network",
            ServiceKind::Image => "Image",
            ServiceKind::Identity => "Identity",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while talking to OpenStack (or the mock backend).
#[derive(Debug, Error)]
pub enum ApiError {
    /// Keystone rejected the credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Keystone answered 2xx but did not hand out a token.
    #[error("Authentication successful, but X-Subject-Token was not found in the response headers.")]
    MissingSubjectToken,

    /// 401 on an authenticated call.
    #[error(
        "API request to {url} failed with status 401: {detail}. Your session might have expired or the token is invalid. Please log out and log back in."
    )]
    Unauthorized { url: String, detail: String },

    /// Any other non-2xx response.
    #[error("API request to {url} failed with status {status}: {detail}.")]
    Http {
        url: String,
        status: u16,
        detail: String,
    },

    /// The service type is absent from the catalog.
    #[error("{0} service endpoint not found.")]
    EndpointNotFound(ServiceKind),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// A poll loop ran out of attempts.
    #[error("{message} (gave up after {attempts} attempts)")]
    Timeout { message: String, attempts: u32 },

    /// A volume went to `error` while we were waiting on it.
    #[error("volume {volume_id} entered status '{status}'")]
    VolumeFailed { volume_id: String, status: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{kind} with ID {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid session data: {0}")]
    InvalidSession(String),

    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ApiError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ApiError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True for errors that mean the session is no longer usable.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }
}

/// Condense an error for display on the terminal.
pub fn format_api_error(error: &ApiError) -> String {
    match error {
        ApiError::Unauthorized { .. } => {
            "Authentication error (401): your session might have expired or the token is invalid. Run `nimbus login` again.".to_string()
        }
        ApiError::Transport(e) if e.is_connect() => {
            "Connection refused. Check the service endpoint URL.".to_string()
        }
        ApiError::Transport(e) if e.is_timeout() => {
            "Request timed out. Server may be unreachable.".to_string()
        }
        other => other.to_string(),
    }
}
