//! Lifecycle verbs exposed at the dispatch boundary

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation names carried across the dispatch/transport boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verb {
    /// Create an object
    New,
    /// Retrieve an object
    Get,
    /// Publish a new frame
    Update,
    /// Grant access to a recipient
    Share,
    /// Snapshot a dynamic object into a static one
    Freeze,
    /// Mark an object non-collectible
    Hold,
    /// Stop following an object
    Discard,
    /// Delete an object
    Delete,
    /// Declare interest in a capability
    RegisterCapability,
    /// Report the local identity
    Whoami,
    /// Issue an application token
    NewToken,
    /// Adopt a previously issued application token
    SetToken,
}

impl Verb {
    /// Every verb, in protocol order
    pub const ALL: [Verb; 12] = [
        Verb::New,
        Verb::Get,
        Verb::Update,
        Verb::Share,
        Verb::Freeze,
        Verb::Hold,
        Verb::Discard,
        Verb::Delete,
        Verb::RegisterCapability,
        Verb::Whoami,
        Verb::NewToken,
        Verb::SetToken,
    ];

    /// Wire name of the verb
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::New => "NEW",
            Verb::Get => "GET",
            Verb::Update => "UPDATE",
            Verb::Share => "SHARE",
            Verb::Freeze => "FREEZE",
            Verb::Hold => "HOLD",
            Verb::Discard => "DISCARD",
            Verb::Delete => "DELETE",
            Verb::RegisterCapability => "REGISTER_CAPABILITY",
            Verb::Whoami => "WHOAMI",
            Verb::NewToken => "NEW_TOKEN",
            Verb::SetToken => "SET_TOKEN",
        }
    }

    /// Whether the verb needs a round trip to the transport collaborator
    pub fn touches_transport(&self) -> bool {
        matches!(
            self,
            Verb::New
                | Verb::Get
                | Verb::Update
                | Verb::Share
                | Verb::Freeze
                | Verb::Hold
                | Verb::Discard
                | Verb::Delete
        )
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
