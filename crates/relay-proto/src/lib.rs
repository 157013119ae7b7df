//! # relay-proto
//!
//! Wire protocol for the relay bridge: the JSON envelope exchanged over a
//! bridge connection (decode/encode, pure and stateless) and the taxonomy of
//! call-scoped errors that become failure envelopes.

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;

pub use envelope::{decode, encode, DecodeError, Envelope, EnvelopeKind};
pub use errors::CallError;
