//! Notifications delivered to callbacks

use serde::{Deserialize, Serialize};

use hgx_core::Address;

use crate::object::ObjectView;

/// Identifies a session on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// What happened to an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Another session created an object matching a capability
    Created,
    /// The object's state advanced
    Updated,
    /// The object was shared with this identity
    Shared {
        /// Identity that sent the grant
        from: Address,
    },
    /// The object was deleted
    Deleted,
    /// A share this session requested reached the transport
    ShareSucceeded {
        recipient: Address,
    },
    /// A share this session requested failed
    ShareFailed {
        recipient: Address,
        reason: String,
    },
    /// Gap healing gave up on the object's chain
    Desynchronized,
}

impl EventKind {
    /// Whether the event reflects a change of the object itself
    pub fn is_state_change(&self) -> bool {
        !matches!(self, Self::ShareSucceeded { .. } | Self::ShareFailed { .. })
    }

    /// Stable name for log fields
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Shared { .. } => "shared",
            Self::Deleted => "deleted",
            Self::ShareSucceeded { .. } => "share_succeeded",
            Self::ShareFailed { .. } => "share_failed",
            Self::Desynchronized => "desynchronized",
        }
    }

    /// Whether capability registrations receive this kind
    pub fn reaches_capabilities(&self) -> bool {
        matches!(self, Self::Created | Self::Shared { .. })
    }
}

/// Who an event is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every matching registration except the originating session
    Subscribers {
        origin: Option<SessionId>,
    },
    /// Only the given session
    Session(SessionId),
}

/// A notification with the object snapshot taken right after the change
#[derive(Debug, Clone)]
pub struct Event {
    /// Sequence number unique within the connection
    pub sequence: u64,
    /// What happened
    pub kind: EventKind,
    /// Object state after the change
    pub object: ObjectView,
    /// Sessions the event is routed to
    pub audience: Audience,
}

impl Event {
    /// Address of the object the event concerns
    pub fn address(&self) -> &Address {
        &self.object.address
    }
}
