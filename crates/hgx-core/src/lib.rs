//! HGX Core - foundation types for dynamic objects
//!
//! This crate provides the pieces every other HGX crate builds on. It contains
//! no engine logic and never spawns tasks.
//!
//! - Identifiers: `Address`, `ApiId`, `AppToken`
//! - Unified error handling: `HgxError`
//! - Content hashing and the frame ratchet KDF
//! - Wire types: `Frame`, `Keyshare`, `ShareGrant`, `StaticRecord`
//! - Effect interfaces: `IdentityEffects`, `TransportEffects`
//! - Configuration: `HgxConfig`

#![forbid(unsafe_code)]

/// Engine configuration
pub mod config;

/// Cryptographic domain types and utilities
pub mod crypto;

/// Effect interfaces for external collaborators
pub mod effects;

/// Unified error handling
pub mod errors;

/// Content-addressing hash
pub mod hash;

/// Addresses, capability ids and scope tokens
pub mod identifiers;

/// Wire-level data model
pub mod types;

pub use config::{DispatchConfig, HealingConfig, HgxConfig, RatchetConfig};
pub use crypto::{KeyMaterial, LocalIdentity};
pub use effects::{IdentityEffects, TransportEffects, TransportError};
pub use errors::{HgxError, Result};
pub use identifiers::{Address, ApiId, AppToken, ADDRESS_LEN, API_ID_LEN, APP_TOKEN_LEN};
pub use types::{Frame, GrantBody, Keyshare, ShareGrant, StaticRecord, Verb, WrappedSecret};
