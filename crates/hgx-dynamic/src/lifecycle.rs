//! Object lifecycle
//!
//! ```text
//! dynamic:  Created -> Live -> Discarded -> Deleted
//!                         \-----------------^
//! static:   Live -> Deleted
//! ```
//!
//! Every operation is admitted here before it touches state. `Deleted` is
//! terminal: every operation on a deleted object fails with `ObjectGone`.

use serde::{Deserialize, Serialize};
use std::fmt;

use hgx_core::{Address, HgxError};

/// Lifecycle state of a local object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Allocated, genesis not yet published
    Created,
    /// Published and following its chain
    Live,
    /// Locally abandoned; later frames are ignored
    Discarded,
    /// Removed from persistence
    Deleted,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Live => "live",
            Self::Discarded => "discarded",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// Dynamic objects have a frame chain; static objects are sealed once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Mutable, chained frames
    Dynamic,
    /// Sealed once, never mutated
    Static,
}

/// Operation requested against an existing object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Publish,
    Get,
    Update,
    Share,
    Unshare,
    Freeze,
    Hold,
    Discard,
    Delete,
    MakePublic,
    Ingest,
}

/// Facts about an object the admission rules depend on
#[derive(Debug, Clone, Copy)]
pub struct Standing {
    /// Current lifecycle state
    pub state: LifecycleState,
    /// Dynamic or static
    pub kind: ObjectKind,
    /// Whether the local identity authored the object
    pub owned: bool,
    /// Spent retransmission attempts once healing gave up
    pub desynchronized: Option<u32>,
}

/// Why an operation was not admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    /// The object was deleted
    Gone,
    /// The object cannot be changed this way
    NotMutable(&'static str),
    /// The chain stopped healing after this many attempts
    Desynchronized(u32),
    /// The operation is dropped without error
    Ignored,
}

impl Refusal {
    /// Convert to an error for `address`; `None` when the refusal is silent
    pub fn into_error(self, address: Address) -> Option<HgxError> {
        match self {
            Self::Gone => Some(HgxError::object_gone(address)),
            Self::NotMutable(reason) => Some(HgxError::not_mutable(address, reason)),
            Self::Desynchronized(attempts) => {
                Some(HgxError::ChainDesynchronized { address, attempts })
            }
            Self::Ignored => None,
        }
    }
}

/// Admit `op` and return the state the object moves to
pub fn admit(standing: Standing, op: Operation) -> Result<LifecycleState, Refusal> {
    use LifecycleState::*;
    use Operation::*;

    let Standing {
        state,
        kind,
        owned,
        desynchronized,
    } = standing;

    if state == Deleted {
        return Err(Refusal::Gone);
    }

    match op {
        Publish => match state {
            Created => Ok(Live),
            _ => Err(Refusal::NotMutable("object already published")),
        },
        Get => Ok(state),
        Update => {
            if kind == ObjectKind::Static {
                return Err(Refusal::NotMutable("static objects are immutable"));
            }
            if !owned {
                return Err(Refusal::NotMutable("only the author may update"));
            }
            if state != Live {
                return Err(Refusal::NotMutable("object is not live"));
            }
            if let Some(attempts) = desynchronized {
                return Err(Refusal::Desynchronized(attempts));
            }
            Ok(Live)
        }
        Share | Unshare => {
            if state != Live {
                return Err(Refusal::NotMutable("object is not live"));
            }
            if kind == ObjectKind::Dynamic && !owned {
                return Err(Refusal::NotMutable("only the author may share a dynamic object"));
            }
            if let Some(attempts) = desynchronized {
                return Err(Refusal::Desynchronized(attempts));
            }
            Ok(Live)
        }
        Freeze => {
            if kind == ObjectKind::Static {
                return Err(Refusal::NotMutable("static objects are already frozen"));
            }
            if state != Live {
                return Err(Refusal::NotMutable("object is not live"));
            }
            if let Some(attempts) = desynchronized {
                return Err(Refusal::Desynchronized(attempts));
            }
            Ok(Live)
        }
        Hold => match state {
            Created => Err(Refusal::NotMutable("object is not published")),
            other => Ok(other),
        },
        Discard => match (kind, state) {
            (ObjectKind::Static, _) => Err(Refusal::NotMutable("static objects cannot be discarded")),
            (_, Created) => Err(Refusal::NotMutable("object is not published")),
            _ => Ok(Discarded),
        },
        Delete => Ok(Deleted),
        MakePublic => {
            if !owned {
                return Err(Refusal::NotMutable("only the author may publish"));
            }
            if state != Live {
                return Err(Refusal::NotMutable("object is not live"));
            }
            Ok(Live)
        }
        Ingest => match state {
            Live => Ok(Live),
            Discarded => Err(Refusal::Ignored),
            _ => Err(Refusal::NotMutable("object is not live")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(state: LifecycleState, owned: bool) -> Standing {
        Standing {
            state,
            kind: ObjectKind::Dynamic,
            owned,
            desynchronized: None,
        }
    }

    #[test]
    fn test_update_rules() {
        assert_eq!(
            admit(dynamic(LifecycleState::Live, true), Operation::Update),
            Ok(LifecycleState::Live)
        );
        assert!(admit(dynamic(LifecycleState::Live, false), Operation::Update).is_err());
        assert!(admit(dynamic(LifecycleState::Discarded, true), Operation::Update).is_err());
        let mut desync = dynamic(LifecycleState::Live, true);
        desync.desynchronized = Some(3);
        assert_eq!(admit(desync, Operation::Update), Err(Refusal::Desynchronized(3)));
        assert_eq!(admit(desync, Operation::Get), Ok(LifecycleState::Live));
    }

    #[test]
    fn test_static_is_immutable() {
        let frozen = Standing {
            state: LifecycleState::Live,
            kind: ObjectKind::Static,
            owned: true,
            desynchronized: None,
        };
        assert!(admit(frozen, Operation::Update).is_err());
        assert!(admit(frozen, Operation::Discard).is_err());
        assert_eq!(admit(frozen, Operation::Delete), Ok(LifecycleState::Deleted));
    }

    #[test]
    fn test_deleted_is_terminal() {
        let gone = dynamic(LifecycleState::Deleted, true);
        for op in [Operation::Get, Operation::Update, Operation::Delete, Operation::Hold] {
            assert_eq!(admit(gone, op), Err(Refusal::Gone));
        }
    }

    #[test]
    fn test_discarded_ignores_frames() {
        let discarded = dynamic(LifecycleState::Discarded, false);
        assert_eq!(admit(discarded, Operation::Ingest), Err(Refusal::Ignored));
        assert_eq!(admit(discarded, Operation::Discard), Ok(LifecycleState::Discarded));
    }

    #[test]
    fn test_publish_only_from_created() {
        assert_eq!(
            admit(dynamic(LifecycleState::Created, true), Operation::Publish),
            Ok(LifecycleState::Live)
        );
        assert!(admit(dynamic(LifecycleState::Live, true), Operation::Publish).is_err());
    }

    #[test]
    fn test_refusal_into_error() {
        let address = Address::from_bytes([1u8; 32]);
        assert!(matches!(
            Refusal::Gone.into_error(address),
            Some(HgxError::ObjectGone { .. })
        ));
        assert!(Refusal::Ignored.into_error(address).is_none());
    }
}
