//! In-memory transport hub
//!
//! Every [`MemoryTransport`] created from one [`MemoryHub`] shares the same
//! storage and delivers straight into attached connections. Frames are kept
//! per object so retransmission requests can be answered. Fault controls let
//! tests withhold frames, refuse retransmission, stall publishing or fail the
//! next operation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use hgx_core::{Address, Frame, ShareGrant, StaticRecord, TransportEffects, TransportError};
use hgx_dynamic::{ConnectionHandle, Inbound};

#[derive(Default)]
struct HubState {
    peers: HashMap<Address, ConnectionHandle>,
    frames: HashMap<Address, BTreeMap<u64, Frame>>,
    subscribers: HashMap<Address, BTreeSet<Address>>,
    statics: HashMap<Address, StaticRecord>,
    grants: HashMap<(Address, Address), ShareGrant>,
    held: HashSet<(Address, Address)>,
    faults: Faults,
    stats: HubStats,
}

#[derive(Default)]
struct Faults {
    withheld: HashSet<(Address, u64)>,
    refuse_retransmission: bool,
    fail_next: Option<TransportError>,
    unreachable: HashSet<Address>,
}

/// Counters for assertions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Frames accepted by `publish_frame`
    pub frames_published: usize,
    /// Live and retransmitted frame deliveries
    pub frames_delivered: usize,
    /// Calls to `request_frames`
    pub retransmission_requests: usize,
    /// Grants handed to recipients
    pub grants_sent: usize,
}

impl HubState {
    fn take_failure(&mut self) -> Result<(), TransportError> {
        match self.faults.fail_next.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn deliver(&mut self, to: &Address, inbound: Inbound) {
        match self.peers.get(to) {
            Some(handle) => {
                if handle.deliver(inbound).is_err() {
                    tracing::debug!(peer = %to.short(), "Peer connection is closed");
                }
            }
            None => tracing::debug!(peer = %to.short(), "No connection attached"),
        }
    }
}

/// Shared storage and routing for a set of in-memory transports
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    /// Frame publishing proceeds while this is `true`
    publishing: Arc<watch::Sender<bool>>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        let (publishing, _) = watch::channel(true);
        Self {
            state: Arc::default(),
            publishing: Arc::new(publishing),
        }
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryHub")
            .field("peers", &state.peers.len())
            .field("objects", &state.frames.len())
            .finish()
    }
}

impl MemoryHub {
    /// Hub with no peers
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport acting for `local`
    pub fn transport(&self, local: Address) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            hub: self.clone(),
            local,
        })
    }

    /// Route traffic for the handle's identity into its connection
    pub fn attach(&self, handle: ConnectionHandle) {
        self.state.lock().peers.insert(handle.identity(), handle);
    }

    /// Stop routing traffic to `identity`
    pub fn detach(&self, identity: &Address) {
        self.state.lock().peers.remove(identity);
    }

    /// Store frame `index` of `object` but skip its live delivery
    pub fn withhold(&self, object: Address, index: u64) {
        self.state.lock().faults.withheld.insert((object, index));
    }

    /// Deliver previously withheld frames of `object` to its subscribers
    pub fn release(&self, object: &Address) -> usize {
        let mut state = self.state.lock();
        let indices: Vec<u64> = state
            .faults
            .withheld
            .iter()
            .filter(|(o, _)| o == object)
            .map(|(_, i)| *i)
            .collect();
        let mut released = 0;
        for index in indices {
            state.faults.withheld.remove(&(*object, index));
            let Some(frame) = state.frames.get(object).and_then(|f| f.get(&index)).cloned() else {
                continue;
            };
            let targets: Vec<Address> = state
                .subscribers
                .get(object)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for target in targets.into_iter().filter(|t| *t != frame.author) {
                state.stats.frames_delivered += 1;
                state.deliver(&target, Inbound::Frame(frame.clone()));
                released += 1;
            }
        }
        released
    }

    /// Hold every `publish_frame` call pending until [`Self::resume_publishing`]
    pub fn pause_publishing(&self) {
        self.publishing.send_replace(false);
    }

    /// Let paused and later `publish_frame` calls complete
    pub fn resume_publishing(&self) {
        self.publishing.send_replace(true);
    }

    /// Ignore retransmission requests while `refuse` is set
    pub fn refuse_retransmission(&self, refuse: bool) {
        self.state.lock().faults.refuse_retransmission = refuse;
    }

    /// Fail the next transport operation of any peer
    pub fn fail_next(&self, error: TransportError) {
        self.state.lock().faults.fail_next = Some(error);
    }

    /// Make grants to `identity` fail
    pub fn set_unreachable(&self, identity: Address, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.faults.unreachable.insert(identity);
        } else {
            state.faults.unreachable.remove(&identity);
        }
    }

    /// Inject a frame as if it came from the network
    pub fn inject(&self, to: &Address, frame: Frame) {
        self.state.lock().deliver(to, Inbound::Frame(frame));
    }

    /// Frames stored for `object`, by index
    pub fn stored_frames(&self, object: &Address) -> Vec<Frame> {
        self.state
            .lock()
            .frames
            .get(object)
            .map(|frames| frames.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a static record is stored under `address`
    pub fn has_static(&self, address: &Address) -> bool {
        self.state.lock().statics.contains_key(address)
    }

    /// Whether `identity` holds a binding for `address`
    pub fn is_held(&self, identity: &Address, address: &Address) -> bool {
        self.state.lock().held.contains(&(*identity, *address))
    }

    /// Whether `identity` receives live frames of `object`
    pub fn is_subscribed(&self, identity: &Address, object: &Address) -> bool {
        self.state
            .lock()
            .subscribers
            .get(object)
            .is_some_and(|s| s.contains(identity))
    }

    /// Counters so far
    pub fn stats(&self) -> HubStats {
        self.state.lock().stats.clone()
    }
}

/// Transport of one identity on a [`MemoryHub`]
#[derive(Debug)]
pub struct MemoryTransport {
    hub: MemoryHub,
    local: Address,
}

impl MemoryTransport {
    /// Identity the transport acts for
    pub fn local(&self) -> Address {
        self.local
    }

    /// Hub the transport is attached to
    pub fn hub(&self) -> &MemoryHub {
        &self.hub
    }
}

#[async_trait]
impl TransportEffects for MemoryTransport {
    async fn publish_frame(&self, frame: &Frame, recipients: &[Address]) -> Result<(), TransportError> {
        let mut gate = self.hub.publishing.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(TransportError::Closed);
        }

        let mut state = self.hub.state.lock();
        state.take_failure()?;
        state.stats.frames_published += 1;
        state
            .frames
            .entry(frame.object)
            .or_default()
            .insert(frame.index, frame.clone());

        if state.faults.withheld.contains(&(frame.object, frame.index)) {
            return Ok(());
        }
        let mut targets: BTreeSet<Address> = state
            .subscribers
            .get(&frame.object)
            .cloned()
            .unwrap_or_default();
        targets.extend(recipients.iter().copied());
        targets.remove(&self.local);
        for target in targets {
            state.stats.frames_delivered += 1;
            state.deliver(&target, Inbound::Frame(frame.clone()));
        }
        Ok(())
    }

    async fn publish_static(&self, record: &StaticRecord) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        state.take_failure()?;
        state.statics.insert(record.address, record.clone());
        Ok(())
    }

    async fn send_grant(&self, grant: &ShareGrant) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        state.take_failure()?;
        if state.faults.unreachable.contains(&grant.recipient) {
            return Err(TransportError::Unreachable {
                reason: format!("{} is unreachable", grant.recipient.short()),
            });
        }
        state.stats.grants_sent += 1;
        state
            .grants
            .insert((grant.recipient, grant.object), grant.clone());
        state.deliver(&grant.recipient, Inbound::Grant(grant.clone()));
        Ok(())
    }

    async fn request_frames(&self, object: &Address, from: u64, to: u64) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        state.take_failure()?;
        state.stats.retransmission_requests += 1;
        if state.faults.refuse_retransmission {
            return Ok(());
        }
        let frames: Vec<Frame> = state
            .frames
            .get(object)
            .map(|frames| frames.range(from..to).map(|(_, f)| f.clone()).collect())
            .unwrap_or_default();
        for frame in frames {
            state.faults.withheld.remove(&(frame.object, frame.index));
            state.stats.frames_delivered += 1;
            state.deliver(&self.local, Inbound::Frame(frame));
        }
        Ok(())
    }

    async fn subscribe(&self, object: &Address) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        state.take_failure()?;
        state.subscribers.entry(*object).or_default().insert(self.local);
        Ok(())
    }

    async fn unsubscribe(&self, object: &Address) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        if let Some(subscribers) = state.subscribers.get_mut(object) {
            subscribers.remove(&self.local);
        }
        Ok(())
    }

    async fn hold(&self, address: &Address) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        state.take_failure()?;
        state.held.insert((self.local, *address));
        Ok(())
    }

    async fn delete(&self, address: &Address) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        state.take_failure()?;
        state.held.remove(&(self.local, *address));
        let authored = match state.frames.get(address).and_then(|f| f.values().next()) {
            Some(frame) => frame.author == self.local,
            None => state
                .statics
                .get(address)
                .is_some_and(|record| record.author == self.local),
        };
        if !authored {
            if let Some(subscribers) = state.subscribers.get_mut(address) {
                subscribers.remove(&self.local);
            }
            return Ok(());
        }
        state.frames.remove(address);
        state.statics.remove(address);
        let subscribers = state.subscribers.remove(address).unwrap_or_default();
        for subscriber in subscribers.into_iter().filter(|s| *s != self.local) {
            state.deliver(&subscriber, Inbound::Deleted(*address));
        }
        Ok(())
    }

    async fn fetch_grant(&self, address: &Address) -> Result<Option<ShareGrant>, TransportError> {
        let mut state = self.hub.state.lock();
        state.take_failure()?;
        Ok(state.grants.get(&(self.local, *address)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::identities;
    use hgx_core::IdentityEffects;

    #[tokio::test]
    async fn test_fail_next_fires_once() {
        let hub = MemoryHub::new();
        let [alice] = identities::<1>();
        let transport = hub.transport(alice.address());
        let object = Address::from_bytes([4u8; 32]);

        hub.fail_next(TransportError::Closed);
        assert_eq!(transport.subscribe(&object).await, Err(TransportError::Closed));
        assert!(transport.subscribe(&object).await.is_ok());
        assert!(hub.is_subscribed(&alice.address(), &object));
    }

    #[tokio::test]
    async fn test_hold_and_delete_bindings() {
        let hub = MemoryHub::new();
        let [alice, bob] = identities::<2>();
        let object = Address::from_bytes([5u8; 32]);
        let a = hub.transport(alice.address());
        let b = hub.transport(bob.address());

        a.hold(&object).await.unwrap();
        b.hold(&object).await.unwrap();
        a.delete(&object).await.unwrap();
        assert!(!hub.is_held(&alice.address(), &object));
        assert!(hub.is_held(&bob.address(), &object));
    }
}
