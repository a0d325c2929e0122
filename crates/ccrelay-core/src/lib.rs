//! Request-path core of cc-relay: live configuration, ingress middleware,
//! provider routing, the thinking-signature protocol, and the streaming
//! upstream engine. HTTP route wiring lives in `ccrelay-router`; this crate
//! owns everything between accepting a request and the last upstream byte.

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod routing;
pub mod state;
pub mod thinking;

pub use config::{Config, ConfigError, ProviderConfig, RouteStrategy};
pub use error::RelayError;
pub use state::AppState;
