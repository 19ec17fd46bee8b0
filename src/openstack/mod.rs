//! OpenStack API interaction module
//!
//! Keystone authentication, catalog resolution, the per-service operation
//! set with its remote and mock backends, and the long-running orchestrators.

pub mod auth;
pub mod catalog;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod mock;
pub mod model;
pub mod normalize;
pub mod ops;
pub mod orchestrator;
pub mod poll;
pub mod remote;
pub mod session;
mod wire;

