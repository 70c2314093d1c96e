//! HGX Dynamic - the dynamic object engine
//!
//! Mutable objects built on a hash-linked chain of encrypted frames. Each
//! frame is keyed by a forward ratchet; keyshares rotate the ratchet root so
//! revoked recipients lose access and readers bounded by the lookahead stay in
//! sync.
//!
//! Layers, bottom up:
//! - [`ratchet`], [`keyshare`], [`chain`], [`healing`]: per-object crypto and
//!   chain bookkeeping, synchronous and free of I/O
//! - [`lifecycle`], [`object`]: object records and the verb state machine
//! - [`dispatch`], [`events`], [`tokens`]: notification routing and
//!   application scoping
//! - [`connection`], [`session`], [`blocking`]: the connection core task and
//!   its async and blocking front ends

#![forbid(unsafe_code)]

pub mod blocking;
pub mod chain;
pub mod connection;
pub mod dispatch;
pub mod events;
pub mod healing;
pub mod keyshare;
pub mod lifecycle;
pub mod object;
pub mod ratchet;
pub mod session;
pub mod telemetry;
pub mod tokens;

pub use blocking::{BlockingClient, BlockingSession};
pub use connection::{Connection, ConnectionHandle, Inbound, NewObject, Request, Response};
pub use dispatch::{Callback, HandlerId, RegistrationKey};
pub use events::{Audience, Event, EventKind, SessionId};
pub use lifecycle::{LifecycleState, ObjectKind};
pub use object::ObjectView;
pub use session::AsyncSession;
pub use tokens::TokenSnapshot;
