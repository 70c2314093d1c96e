//! Effect interfaces for external collaborators
//!
//! The engine never talks to sockets, storage or key stores directly. It asks
//! these traits, which callers implement over whatever carries frames between
//! machines. `hgx-testkit` provides in-memory implementations.
//!
//! - `IdentityEffects`: signing, verification and pairwise key agreement.
//!   Pure and synchronous.
//! - `TransportEffects`: frame fan-out, grants, retransmission requests and
//!   storage bindings. Asynchronous; failures are retryable.

pub mod identity;
pub mod transport;

pub use identity::IdentityEffects;
pub use transport::{TransportEffects, TransportError};
