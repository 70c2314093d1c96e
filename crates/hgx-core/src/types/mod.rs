//! Wire-level data model
//!
//! Frames, keyshares, grants and static records as they travel between the
//! engine and the transport collaborator.

pub mod frame;
pub mod grant;
pub mod verb;

pub use frame::{Frame, Keyshare, WrappedSecret};
pub use grant::{GrantBody, ShareGrant, StaticRecord};
pub use verb::Verb;
