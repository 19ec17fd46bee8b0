//! Backend Dispatch
//!
//! Picks the backend once at startup. Everything downstream holds an
//! `Arc<dyn CloudOperations>` and never asks which one it got.

use super::client::HttpClient;
use super::error::Result;
use super::mock::{MockBackend, MockTimings};
use super::ops::CloudOperations;
use super::remote::RemoteBackend;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Remote,
    Mock(MockTimings),
}

impl BackendMode {
    pub fn from_flag(mock: bool, timings: MockTimings) -> Self {
        if mock {
            BackendMode::Mock(timings)
        } else {
            BackendMode::Remote
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, BackendMode::Mock(_))
    }
}

/// Build the backend for `mode`.
pub fn select_backend(mode: BackendMode) -> Result<Arc<dyn CloudOperations>> {
    let backend: Arc<dyn CloudOperations> = match mode {
        BackendMode::Remote => Arc::new(RemoteBackend::new(HttpClient::new()?)),
        BackendMode::Mock(timings) => Arc::new(MockBackend::new(timings)),
    };
    tracing::info!("Using {} backend", backend.backend_name());
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_selects_mode() {
        let timings = MockTimings::default();
        assert_eq!(BackendMode::from_flag(false, timings), BackendMode::Remote);
        assert!(BackendMode::from_flag(true, timings).is_mock());
    }

    #[test]
    fn test_select_backend() {
        let mock = select_backend(BackendMode::Mock(MockTimings::default())).unwrap();
        assert_eq!(mock.backend_name(), "mock");

        let remote = select_backend(BackendMode::Remote).unwrap();
        assert_eq!(remote.backend_name(), "openstack");
    }
}
