//! HGX Testing Infrastructure
//!
//! An in-memory transport hub with fault injection, deterministic identities
//! and callback recorders for exercising connections end to end.
//!
//! ```rust,no_run
//! use hgx_testkit::*;
//!
//! # async fn demo() -> hgx_core::Result<()> {
//! let hub = MemoryHub::new();
//! let [alice, bob] = identities::<2>();
//! let alice = hub.connect(alice, test_config())?;
//! let bob = hub.connect(bob, test_config())?;
//! let session = alice.session().await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod fixtures;
pub mod hub;

pub use fixtures::{identities, test_config, BlockingPeer, Peer, Recorded, Recorder};
pub use hub::{HubStats, MemoryHub, MemoryTransport};
