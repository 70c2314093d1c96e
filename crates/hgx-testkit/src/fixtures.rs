//! Identity, connection and callback fixtures

use std::sync::Arc;

use parking_lot::Mutex;

use hgx_core::{Address, HgxConfig, IdentityEffects, LocalIdentity, Result};
use hgx_dynamic::{
    AsyncSession, BlockingClient, BlockingSession, Callback, Connection, ConnectionHandle, Event,
    EventKind,
};

use crate::hub::MemoryHub;

/// `N` deterministic identities that all know each other
pub fn identities<const N: usize>() -> [Arc<LocalIdentity>; N] {
    let parties: [Arc<LocalIdentity>; N] = std::array::from_fn(|i| {
        let mut seed = [0u8; 32];
        seed[0] = i as u8 + 1;
        seed[31] = 0x5a;
        Arc::new(LocalIdentity::from_seed(seed))
    });
    for party in &parties {
        for other in &parties {
            party.add_contact(other.verifying_key());
        }
    }
    parties
}

/// Configuration with short healing intervals
pub fn test_config() -> HgxConfig {
    let mut config = HgxConfig::default();
    config.healing.retry_interval_ms = 20;
    config.healing.retry_budget = 3;
    config
}

/// A connection attached to a hub
#[derive(Debug)]
pub struct Peer {
    /// Identity the connection acts for
    pub identity: Arc<LocalIdentity>,
    /// Handle to the running core
    pub handle: ConnectionHandle,
}

impl Peer {
    /// Address of the peer's identity
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Open an async session on the peer's connection
    pub async fn session(&self) -> Result<AsyncSession> {
        self.handle.open_session().await
    }
}

impl MemoryHub {
    /// Spawn a connection for `identity` on the current runtime and attach it
    pub fn connect(&self, identity: Arc<LocalIdentity>, config: HgxConfig) -> Result<Peer> {
        let transport = self.transport(identity.address());
        let handle = Connection::spawn(config, identity.clone(), transport)?;
        self.attach(handle.clone());
        Ok(Peer { identity, handle })
    }

    /// Start a blocking client for `identity` and attach it
    pub fn connect_blocking(
        &self,
        identity: Arc<LocalIdentity>,
        config: HgxConfig,
    ) -> Result<BlockingPeer> {
        let transport = self.transport(identity.address());
        let client = BlockingClient::connect(config, identity.clone(), transport)?;
        self.attach(client.handle().clone());
        Ok(BlockingPeer { identity, client })
    }
}

/// A blocking client attached to a hub
#[derive(Debug)]
pub struct BlockingPeer {
    /// Identity the client acts for
    pub identity: Arc<LocalIdentity>,
    /// Client owning the connection thread
    pub client: BlockingClient,
}

impl BlockingPeer {
    /// Address of the peer's identity
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Open a blocking session on the peer's client
    pub fn session(&self) -> Result<BlockingSession> {
        self.client.open_session()
    }
}

/// One callback invocation seen by a [`Recorder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    /// Label given to the recording callback
    pub label: &'static str,
    /// Event kind delivered
    pub kind: EventKind,
    /// Object the event concerns
    pub object: Address,
    /// Change counter of the object at delivery
    pub change: u64,
    /// Object state at delivery
    pub payload: Vec<u8>,
}

/// Collects callback invocations in the order they ran
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, label: &'static str, event: &Event) {
        self.seen.lock().push(Recorded {
            label,
            kind: event.kind.clone(),
            object: event.object.address,
            change: event.object.change,
            payload: event.object.payload.clone(),
        });
    }

    /// Callback run on the dispatch task
    pub fn non_blocking(&self, label: &'static str) -> Callback {
        let recorder = self.clone();
        Callback::non_blocking(move |event| {
            let recorder = recorder.clone();
            async move { recorder.push(label, &event) }
        })
    }

    /// Callback run on the consumer's thread
    pub fn blocking(&self, label: &'static str) -> Callback {
        let recorder = self.clone();
        Callback::blocking(move |event| recorder.push(label, event))
    }

    /// Everything recorded so far
    pub fn entries(&self) -> Vec<Recorded> {
        self.seen.lock().clone()
    }

    /// Labels in the order callbacks ran
    pub fn labels(&self) -> Vec<&'static str> {
        self.seen.lock().iter().map(|r| r.label).collect()
    }

    /// Payloads in the order callbacks ran
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.seen.lock().iter().map(|r| r.payload.clone()).collect()
    }

    /// Number of recorded invocations
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    /// Forget recorded invocations
    pub fn clear(&self) {
        self.seen.lock().clear();
    }
}
