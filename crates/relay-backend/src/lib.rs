//! # relay-backend
//!
//! The boundary between the bridge and the backend RPC service.
//!
//! - [`service::BackendClient`] — the opaque backend, reachable through two
//!   call shapes (unary and server-streaming)
//! - [`service::BackendConnector`] — per-session handle establishment
//! - [`service::BackendAdapter`] — deadline enforcement and error mapping
//!   around a connected client
//! - [`example`] — the fixture service (`SayHello`, `StreamMessages`) used to
//!   exercise the bridge

#![deny(unsafe_code)]

pub mod example;
pub mod service;

pub use service::{BackendAdapter, BackendClient, BackendConnector, BackendError, PayloadStream, StaticConnector};
