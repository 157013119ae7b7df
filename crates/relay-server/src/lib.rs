//! # relay-server
//!
//! WebSocket bridge server: accepts client connections, multiplexes envelope
//! requests onto concurrent backend calls, and serializes every outbound
//! frame through one writer per connection.
//!
//! - [`server::RelayServer`] — Axum router, upgrade handling, health/metrics
//! - [`session`] — per-connection read loop, writer task, in-flight tracking
//! - [`dispatch`] — unary and streaming call state machines
//! - [`registry::MethodRegistry`] — method names, shapes, payload validation
//! - [`sessions::SessionRegistry`] — process-wide tracking for shutdown
//! - [`config::ServerConfig`] — layered configuration

#![deny(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod sessions;

pub use config::{ConfigError, ServerConfig};
pub use dispatch::CallState;
pub use registry::{MethodKind, MethodRegistry, MethodSpec};
pub use server::{AppState, RelayServer};
pub use session::{FrameSink, Session};
pub use sessions::SessionRegistry;
