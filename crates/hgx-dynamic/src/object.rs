//! Local object records
//!
//! A record owns everything the connection knows about one object: metadata,
//! lifecycle, and for dynamic objects the frame chain, ratchet position, gap
//! buffer and recent states. Records never touch the transport. Operations
//! that publish are split into `prepare_*`, which computes the outgoing data
//! without mutating, and `commit_*`, which applies it once the transport has
//! accepted.

use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use hgx_core::crypto::{self, KeyMaterial};
use hgx_core::{
    Address, ApiId, AppToken, Frame, GrantBody, HealingConfig, HgxError, IdentityEffects, Result,
    ShareGrant, StaticRecord,
};

use crate::chain::FrameChain;
use crate::healing::{BufferOutcome, GapHealer};
use crate::keyshare::{self, SNAPSHOT_CONTEXT, STATIC_CONTEXT};
use crate::lifecycle::{admit, LifecycleState, ObjectKind, Operation, Refusal, Standing};
use crate::ratchet::{self, RatchetState, SealedFrame};

/// Snapshot of an object handed to callers and callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectView {
    /// Content address
    pub address: Address,
    /// Identity that created the object
    pub author: Address,
    /// Capability id; optional for private objects
    pub api_id: Option<ApiId>,
    /// Dynamic or static
    pub kind: ObjectKind,
    /// Current lifecycle state
    pub lifecycle: LifecycleState,
    /// Whether the local identity authored the object
    pub owned: bool,
    /// Visible only to sessions holding the parent token
    pub private: bool,
    /// Token of the application that owns a private object
    pub parent_token: Option<AppToken>,
    /// Whether storage was asked to retain the object
    pub held: bool,
    /// Whether healing gave up on the chain
    pub desynchronized: bool,
    /// Index of the head frame for dynamic objects
    pub index: Option<u64>,
    /// Counts observable state changes of this record
    pub change: u64,
    /// Current plaintext state; empty once deleted
    pub payload: Vec<u8>,
}

/// Chain parameters fixed when a dynamic record is created
#[derive(Debug, Clone, Copy)]
pub struct ChainParams {
    /// Frames derivable per keyshare
    pub legroom: u32,
    /// Bits available to frame indices
    pub counter_width: u8,
    /// Upper bound on retained recent states
    pub history_depth: usize,
    /// Out-of-order frames kept while healing
    pub max_buffered: usize,
}

/// Scope of a newly created object
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Capability id; optional for private objects
    pub api_id: Option<ApiId>,
    /// Visible only to sessions holding the parent token
    pub private: bool,
    /// Token a private object is bound to
    pub parent_token: Option<AppToken>,
}

#[derive(Debug, Clone)]
struct Meta {
    address: Address,
    author: Address,
    api_id: Option<ApiId>,
    private: bool,
    parent_token: Option<AppToken>,
    owned: bool,
    lifecycle: LifecycleState,
    held: bool,
    change: u64,
}

impl Meta {
    fn new(address: Address, author: Address, scope: Scope, owned: bool) -> Self {
        Self {
            address,
            author,
            api_id: scope.api_id,
            private: scope.private,
            parent_token: scope.parent_token,
            owned,
            lifecycle: LifecycleState::Created,
            held: false,
            change: 0,
        }
    }
}

/// An update sealed but not yet published
#[derive(Debug, Clone)]
pub struct PreparedUpdate {
    /// Frame and ratchet state to commit
    pub sealed: SealedFrame,
    payload: Vec<u8>,
}

impl PreparedUpdate {
    /// Frame to hand to the transport
    pub fn frame(&self) -> &Frame {
        &self.sealed.frame
    }
}

/// A frame applied to the chain while ingesting
#[derive(Debug, Clone)]
pub struct AppliedFrame {
    /// Index of the applied frame
    pub index: u64,
    /// Whether the frame carried a keyshare
    pub rekeyed: bool,
    /// Object state after the frame
    pub view: ObjectView,
}

/// Result of offering an inbound frame to a record
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// One or more frames extended the chain, in order
    Applied(Vec<AppliedFrame>),
    /// The frame was already accepted
    Duplicate,
    /// The record ignores frames in its current state
    Ignored,
    /// The frame is ahead of the chain and was buffered
    Buffered {
        /// Range `[from, to)` missing before the buffered frames
        missing: (u64, u64),
        /// Whether a retransmission request should go out now
        request: bool,
    },
    /// The gap buffer is full; the frame was dropped
    Dropped,
}

/// What the periodic healing check wants done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealAction {
    /// Nothing to do
    Idle,
    /// Re-request `[from, to)`
    Request(u64, u64),
    /// The retry budget is spent; the record is now desynchronized
    Desynchronized {
        /// Requests sent before giving up
        attempts: u32,
    },
}

/// Mutable object whose state is the head of a frame chain
#[derive(Debug, Clone)]
pub struct DynamicObject {
    meta: Meta,
    /// Attempts spent when healing gave up
    desynchronized: Option<u32>,
    chain: FrameChain,
    ratchet: Option<RatchetState>,
    healer: GapHealer,
    history: VecDeque<(u64, Vec<u8>)>,
    history_cap: usize,
    recipients: BTreeSet<Address>,
}

impl DynamicObject {
    /// Allocate a new object authored by `identity`; nothing is published yet
    pub fn create(identity: &dyn IdentityEffects, scope: Scope, params: ChainParams) -> Self {
        let author = identity.address();
        let mut nonce = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let address = Address::from_parts(b"HGX_DYNAMIC_v1", &[author.as_bytes(), &nonce]);

        Self {
            meta: Meta::new(address, author, scope, true),
            desynchronized: None,
            chain: FrameChain::new(address, history_cap(params)),
            ratchet: Some(RatchetState::new(address, params.legroom, params.counter_width)),
            healer: GapHealer::new(params.max_buffered),
            history: VecDeque::new(),
            history_cap: history_cap(params),
            recipients: BTreeSet::new(),
        }
    }

    /// Join an object from a share grant
    pub fn from_grant(
        identity: &dyn IdentityEffects,
        grant: &ShareGrant,
        params: ChainParams,
    ) -> Result<Self> {
        let GrantBody::Dynamic { head, secret } = &grant.body else {
            return Err(HgxError::invalid("grant does not carry a dynamic object"));
        };
        if head.object != grant.object || head.author != grant.author {
            return Err(HgxError::invalid("grant head does not match the granted object"));
        }
        identity.verify(&head.author, &head.signing_bytes(), &head.signature)?;

        let mut snapshot = keyshare::unwrap_secret(
            identity,
            &grant.sender,
            &grant.object,
            head.epoch,
            SNAPSHOT_CONTEXT,
            secret,
        )?;
        let state = RatchetState::from_snapshot(&grant.object, &snapshot);
        snapshot.zeroize();
        let state = state?;

        if *state.head() != head.address() || state.next_index() != head.index + 1 {
            return Err(HgxError::ratchet_mismatch(
                grant.object,
                head.index,
                "grant snapshot does not match its head frame",
            ));
        }
        let head_key = state
            .head_key()
            .ok_or_else(|| HgxError::invalid("ratchet snapshot has no head key"))?;
        let payload = ratchet::open_with_key(head_key, head)?;

        let owned = grant.author == identity.address();
        let scope = Scope {
            api_id: grant.api_id.clone(),
            private: false,
            parent_token: None,
        };
        let params = ChainParams {
            legroom: state.legroom(),
            ..params
        };
        let mut meta = Meta::new(grant.object, grant.author, scope, owned);
        meta.lifecycle = LifecycleState::Live;
        meta.change = 1;

        Ok(Self {
            meta,
            desynchronized: None,
            chain: FrameChain::starting_at(head.clone(), history_cap(params)),
            ratchet: Some(state),
            healer: GapHealer::new(params.max_buffered),
            history: VecDeque::from([(head.index, payload)]),
            history_cap: history_cap(params),
            recipients: BTreeSet::new(),
        })
    }

    /// Content address of the object
    pub fn address(&self) -> &Address {
        &self.meta.address
    }

    /// Current plaintext state
    pub fn payload(&self) -> Option<&[u8]> {
        self.history.back().map(|(_, p)| p.as_slice())
    }

    /// Recent states, oldest first, ending with the head
    pub fn history(&self) -> Vec<(u64, Vec<u8>)> {
        self.history.iter().cloned().collect()
    }

    /// Retained accepted frames
    pub fn chain(&self) -> &FrameChain {
        &self.chain
    }

    /// Ratchet state; `None` once deleted
    pub fn ratchet(&self) -> Option<&RatchetState> {
        self.ratchet.as_ref()
    }

    /// Identities the object is shared with
    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.recipients.iter()
    }

    /// Whether a gap is open
    pub fn is_healing(&self) -> bool {
        self.healer.is_healing()
    }

    /// Whether healing gave up
    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized.is_some()
    }

    /// Attempts spent before the chain was declared desynchronized
    pub fn desynchronized_after(&self) -> Option<u32> {
        self.desynchronized
    }

    /// Frames waiting for a gap to close
    pub fn buffered_len(&self) -> usize {
        self.healer.buffered_len()
    }

    /// Retransmission requests issued for the current gap
    pub fn heal_attempts(&self) -> u32 {
        self.healer.attempts()
    }

    fn standing(&self) -> Standing {
        Standing {
            state: self.meta.lifecycle,
            kind: ObjectKind::Dynamic,
            owned: self.meta.owned,
            desynchronized: self.desynchronized,
        }
    }

    fn admit(&self, op: Operation) -> Result<LifecycleState> {
        admit_or_err(self.standing(), op, self.meta.address)
    }

    fn live_ratchet(&self) -> Result<&RatchetState> {
        self.ratchet
            .as_ref()
            .ok_or_else(|| HgxError::object_gone(self.meta.address))
    }

    /// Seal the next state; the genesis frame when the object is unpublished
    pub fn prepare_update(
        &self,
        identity: &dyn IdentityEffects,
        payload: Vec<u8>,
    ) -> Result<PreparedUpdate> {
        let op = if self.meta.lifecycle == LifecycleState::Created {
            Operation::Publish
        } else {
            Operation::Update
        };
        self.admit(op)?;
        let ratchet = self.live_ratchet()?;
        let recipients: Vec<Address> = self.recipients.iter().copied().collect();
        let sealed = ratchet::seal_frame(ratchet, identity, &payload, &recipients, false)?;
        Ok(PreparedUpdate { sealed, payload })
    }

    /// Apply an update the transport accepted
    pub fn commit_update(&mut self, prepared: PreparedUpdate) -> Result<ObjectView> {
        let PreparedUpdate { sealed, payload } = prepared;
        let index = sealed.frame.index;
        self.chain.append(sealed.frame)?;
        self.ratchet = Some(sealed.state);
        self.meta.lifecycle = LifecycleState::Live;
        self.push_state(index, payload);
        Ok(self.view())
    }

    fn push_state(&mut self, index: u64, payload: Vec<u8>) {
        self.history.push_back((index, payload));
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }
        self.meta.change += 1;
    }

    /// Offer an inbound frame
    pub fn ingest(
        &mut self,
        identity: &dyn IdentityEffects,
        frame: Frame,
        now: Instant,
        healing: &HealingConfig,
    ) -> Result<IngestOutcome> {
        match admit(self.standing(), Operation::Ingest) {
            Ok(_) => {}
            Err(Refusal::Ignored) => return Ok(IngestOutcome::Ignored),
            Err(refusal) => {
                return Err(refusal
                    .into_error(self.meta.address)
                    .unwrap_or_else(|| HgxError::object_gone(self.meta.address)))
            }
        }
        if frame.author != self.meta.author {
            return Err(HgxError::ratchet_mismatch(
                self.meta.address,
                frame.index,
                "frame signed by another identity",
            ));
        }

        let expected = self.live_ratchet()?.next_index();
        if frame.index < expected {
            return match self.chain.address_at(frame.index) {
                Some(accepted) if accepted != frame.address() => Err(HgxError::ratchet_mismatch(
                    self.meta.address,
                    frame.index,
                    "frame conflicts with the accepted chain",
                )),
                _ => Ok(IngestOutcome::Duplicate),
            };
        }

        if frame.index > expected {
            if self.desynchronized.is_some() {
                return Ok(IngestOutcome::Ignored);
            }
            if self.healer.buffer(frame) == BufferOutcome::Overflow {
                return Ok(IngestOutcome::Dropped);
            }
            let missing = self
                .healer
                .missing_range(expected)
                .unwrap_or((expected, expected));
            let interval = Duration::from_millis(healing.retry_interval_ms);
            let request = self.healer.attempts() < healing.retry_budget
                && self.healer.request_due(now, interval);
            if request {
                self.healer.record_request(now);
            }
            return Ok(IngestOutcome::Buffered { missing, request });
        }

        let applied = self.apply_ready(identity, frame)?;
        Ok(IngestOutcome::Applied(applied))
    }

    fn apply_ready(
        &mut self,
        identity: &dyn IdentityEffects,
        first: Frame,
    ) -> Result<Vec<AppliedFrame>> {
        let mut applied = Vec::new();
        let mut next = Some(first);
        while let Some(frame) = next {
            match self.apply_one(identity, frame) {
                Ok(frame) => applied.push(frame),
                Err(e) if applied.is_empty() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        object = %self.meta.address.short(),
                        error = %e,
                        "Dropping buffered frame that failed validation"
                    );
                    break;
                }
            }
            let expected = self.live_ratchet()?.next_index();
            next = self.healer.take(expected);
        }
        if let Some(ratchet) = &self.ratchet {
            self.healer.discard_below(ratchet.next_index());
        }
        self.healer.settle();
        Ok(applied)
    }

    fn apply_one(&mut self, identity: &dyn IdentityEffects, frame: Frame) -> Result<AppliedFrame> {
        let accepted = ratchet::validate_incoming(self.live_ratchet()?, identity, &frame)?;
        let index = frame.index;
        self.chain.append(frame)?;
        self.ratchet = Some(accepted.state);
        self.push_state(index, accepted.plaintext);
        Ok(AppliedFrame {
            index,
            rekeyed: accepted.rekeyed,
            view: self.view(),
        })
    }

    /// Periodic healing check
    pub fn heal_tick(&mut self, now: Instant, healing: &HealingConfig) -> HealAction {
        if !self.healer.is_healing() || self.desynchronized.is_some() {
            return HealAction::Idle;
        }
        let interval = Duration::from_millis(healing.retry_interval_ms);
        if !self.healer.request_due(now, interval) {
            return HealAction::Idle;
        }
        if self.healer.attempts() >= healing.retry_budget {
            let attempts = self.healer.attempts();
            self.mark_desynchronized(attempts);
            return HealAction::Desynchronized { attempts };
        }
        let expected = match &self.ratchet {
            Some(ratchet) => ratchet.next_index(),
            None => return HealAction::Idle,
        };
        match self.healer.missing_range(expected) {
            Some((from, to)) => {
                self.healer.record_request(now);
                HealAction::Request(from, to)
            }
            None => HealAction::Idle,
        }
    }

    /// Give up on the chain; later mutations fail
    pub fn mark_desynchronized(&mut self, attempts: u32) {
        self.healer.clear();
        self.desynchronized = Some(attempts);
        self.meta.change += 1;
    }

    /// Build the grant handing the current head and ratchet to `recipient`
    pub fn prepare_share(
        &self,
        identity: &dyn IdentityEffects,
        recipient: &Address,
    ) -> Result<ShareGrant> {
        self.admit(Operation::Share)?;
        if *recipient == identity.address() {
            return Err(HgxError::invalid("cannot share an object with its own author"));
        }
        let ratchet = self.live_ratchet()?;
        let head = self
            .chain
            .head()
            .cloned()
            .ok_or_else(|| HgxError::not_mutable(self.meta.address, "nothing published yet"))?;

        let mut snapshot = ratchet.to_snapshot()?;
        let secret = keyshare::wrap_secret(
            identity,
            recipient,
            &self.meta.address,
            head.epoch,
            SNAPSHOT_CONTEXT,
            &snapshot,
        );
        snapshot.zeroize();

        Ok(ShareGrant {
            object: self.meta.address,
            author: self.meta.author,
            sender: identity.address(),
            recipient: *recipient,
            api_id: self.meta.api_id.clone(),
            body: GrantBody::Dynamic {
                head,
                secret: secret?,
            },
        })
    }

    /// Record a recipient once its grant was delivered
    pub fn commit_share(&mut self, recipient: Address) {
        self.recipients.insert(recipient);
    }

    /// Revoke `recipient`; the next update starts a new epoch without it
    pub fn unshare(&mut self, recipient: &Address) -> Result<bool> {
        self.admit(Operation::Unshare)?;
        let removed = self.recipients.remove(recipient);
        if removed {
            if let Some(ratchet) = self.ratchet.as_mut() {
                ratchet.request_rekey();
            }
        }
        Ok(removed)
    }

    /// Seal the current state as a static object
    pub fn freeze(&self, identity: &dyn IdentityEffects) -> Result<StaticObject> {
        self.admit(Operation::Freeze)?;
        let payload = self
            .payload()
            .ok_or_else(|| HgxError::not_mutable(self.meta.address, "nothing published yet"))?
            .to_vec();
        let scope = Scope {
            api_id: self.meta.api_id.clone(),
            private: self.meta.private,
            parent_token: self.meta.parent_token,
        };
        StaticObject::seal(identity, scope, payload)
    }

    /// Snapshot for callers and callbacks
    pub fn view(&self) -> ObjectView {
        ObjectView {
            address: self.meta.address,
            author: self.meta.author,
            api_id: self.meta.api_id.clone(),
            kind: ObjectKind::Dynamic,
            lifecycle: self.meta.lifecycle,
            owned: self.meta.owned,
            private: self.meta.private,
            parent_token: self.meta.parent_token,
            held: self.meta.held,
            desynchronized: self.desynchronized.is_some(),
            index: self.history.back().map(|(i, _)| *i),
            change: self.meta.change,
            payload: self.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }

    fn clear(&mut self) {
        self.chain.clear();
        self.ratchet = None;
        self.healer.clear();
        self.history.clear();
        self.recipients.clear();
    }
}

fn history_cap(params: ChainParams) -> usize {
    params
        .history_depth
        .min(params.legroom as usize + 1)
        .max(1)
}

/// Immutable sealed object
#[derive(Debug, Clone)]
pub struct StaticObject {
    meta: Meta,
    record: StaticRecord,
    key: Option<KeyMaterial>,
    payload: Option<Vec<u8>>,
}

fn static_aad(record_author: &Address) -> Vec<u8> {
    let mut aad = b"HGX_STATIC_v1".to_vec();
    aad.extend_from_slice(record_author.as_bytes());
    aad
}

impl StaticObject {
    /// Seal `payload` under a fresh content key
    pub fn seal(identity: &dyn IdentityEffects, scope: Scope, payload: Vec<u8>) -> Result<Self> {
        let author = identity.address();
        let key = KeyMaterial::random();
        let nonce = crypto::random_nonce();
        let ciphertext = crypto::seal(&key, &nonce, &payload, &static_aad(&author))?;
        let address = StaticRecord::compute_address(&author, &nonce, &ciphertext);

        let mut record = StaticRecord {
            address,
            author,
            api_id: scope.api_id.clone(),
            nonce,
            ciphertext,
            signature: Vec::new(),
        };
        record.signature = identity.sign(&record.signing_bytes());

        let mut meta = Meta::new(address, author, scope, true);
        meta.lifecycle = LifecycleState::Live;
        meta.change = 1;
        Ok(Self {
            meta,
            record,
            key: Some(key),
            payload: Some(payload),
        })
    }

    /// Open a static object received in a share grant
    pub fn from_grant(identity: &dyn IdentityEffects, grant: &ShareGrant) -> Result<Self> {
        let GrantBody::Static { record, key } = &grant.body else {
            return Err(HgxError::invalid("grant does not carry a static object"));
        };
        if record.address != grant.object
            || record.address
                != StaticRecord::compute_address(&record.author, &record.nonce, &record.ciphertext)
        {
            return Err(HgxError::invalid("static record address does not match its content"));
        }
        identity.verify(&record.author, &record.signing_bytes(), &record.signature)?;

        let content_key = keyshare::unwrap_key(
            identity,
            &grant.sender,
            &grant.object,
            0,
            STATIC_CONTEXT,
            key,
        )?;
        let payload = crypto::open(
            &content_key,
            &record.nonce,
            &record.ciphertext,
            &static_aad(&record.author),
        )?;

        let scope = Scope {
            api_id: record.api_id.clone(),
            private: false,
            parent_token: None,
        };
        let owned = record.author == identity.address();
        let mut meta = Meta::new(record.address, record.author, scope, owned);
        meta.lifecycle = LifecycleState::Live;
        meta.change = 1;
        Ok(Self {
            meta,
            record: record.clone(),
            key: Some(content_key),
            payload: Some(payload),
        })
    }

    /// Content address of the object
    pub fn address(&self) -> &Address {
        &self.meta.address
    }

    /// Sealed record as stored
    pub fn record(&self) -> &StaticRecord {
        &self.record
    }

    /// Plaintext; `None` once deleted
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    fn standing(&self) -> Standing {
        Standing {
            state: self.meta.lifecycle,
            kind: ObjectKind::Static,
            owned: self.meta.owned,
            desynchronized: None,
        }
    }

    /// Build the grant handing the content key to `recipient`
    pub fn prepare_share(
        &self,
        identity: &dyn IdentityEffects,
        recipient: &Address,
    ) -> Result<ShareGrant> {
        admit_or_err(self.standing(), Operation::Share, self.meta.address)?;
        if *recipient == identity.address() {
            return Err(HgxError::invalid("cannot share an object with its own author"));
        }
        let content_key = self
            .key
            .as_ref()
            .ok_or_else(|| HgxError::object_gone(self.meta.address))?;
        let wrapped = keyshare::wrap_secret(
            identity,
            recipient,
            &self.meta.address,
            0,
            STATIC_CONTEXT,
            content_key.as_bytes(),
        )?;
        Ok(ShareGrant {
            object: self.meta.address,
            author: self.meta.author,
            sender: identity.address(),
            recipient: *recipient,
            api_id: self.meta.api_id.clone(),
            body: GrantBody::Static {
                record: self.record.clone(),
                key: wrapped,
            },
        })
    }

    /// Snapshot for callers and callbacks
    pub fn view(&self) -> ObjectView {
        ObjectView {
            address: self.meta.address,
            author: self.meta.author,
            api_id: self.meta.api_id.clone(),
            kind: ObjectKind::Static,
            lifecycle: self.meta.lifecycle,
            owned: self.meta.owned,
            private: self.meta.private,
            parent_token: self.meta.parent_token,
            held: self.meta.held,
            desynchronized: false,
            index: None,
            change: self.meta.change,
            payload: self.payload.clone().unwrap_or_default(),
        }
    }

    fn clear(&mut self) {
        self.key = None;
        self.payload = None;
    }
}

fn admit_or_err(standing: Standing, op: Operation, address: Address) -> Result<LifecycleState> {
    admit(standing, op).map_err(|refusal| {
        refusal
            .into_error(address)
            .unwrap_or_else(|| HgxError::not_mutable(address, "operation ignored"))
    })
}

/// Any object the connection tracks
#[derive(Debug, Clone)]
pub enum ObjectRecord {
    /// Chained, mutable object
    Dynamic(Box<DynamicObject>),
    /// Sealed snapshot
    Static(StaticObject),
}

impl From<DynamicObject> for ObjectRecord {
    fn from(object: DynamicObject) -> Self {
        Self::Dynamic(Box::new(object))
    }
}

impl From<StaticObject> for ObjectRecord {
    fn from(object: StaticObject) -> Self {
        Self::Static(object)
    }
}

impl ObjectRecord {
    fn meta(&self) -> &Meta {
        match self {
            Self::Dynamic(object) => &object.meta,
            Self::Static(object) => &object.meta,
        }
    }

    fn meta_mut(&mut self) -> &mut Meta {
        match self {
            Self::Dynamic(object) => &mut object.meta,
            Self::Static(object) => &mut object.meta,
        }
    }

    /// Content address of the object
    pub fn address(&self) -> Address {
        self.meta().address
    }

    /// Dynamic or static
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Dynamic(_) => ObjectKind::Dynamic,
            Self::Static(_) => ObjectKind::Static,
        }
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> LifecycleState {
        self.meta().lifecycle
    }

    /// Whether the object is private
    pub fn is_private(&self) -> bool {
        self.meta().private
    }

    /// Token a private object is bound to
    pub fn parent_token(&self) -> Option<AppToken> {
        self.meta().parent_token
    }

    /// Whether storage was asked to retain the object
    pub fn is_held(&self) -> bool {
        self.meta().held
    }

    /// The dynamic object, if this is one
    pub fn as_dynamic(&self) -> Option<&DynamicObject> {
        match self {
            Self::Dynamic(object) => Some(object.as_ref()),
            Self::Static(_) => None,
        }
    }

    /// The dynamic object, if this is one
    pub fn as_dynamic_mut(&mut self) -> Option<&mut DynamicObject> {
        match self {
            Self::Dynamic(object) => Some(object.as_mut()),
            Self::Static(_) => None,
        }
    }

    fn standing(&self) -> Standing {
        match self {
            Self::Dynamic(object) => object.standing(),
            Self::Static(object) => object.standing(),
        }
    }

    /// Admit `op`, returning the state the record would move to
    pub fn admit(&self, op: Operation) -> Result<LifecycleState> {
        admit_or_err(self.standing(), op, self.address())
    }

    /// Snapshot for callers and callbacks
    pub fn view(&self) -> ObjectView {
        match self {
            Self::Dynamic(object) => object.view(),
            Self::Static(object) => object.view(),
        }
    }

    /// Build the grant for `recipient`; nothing changes until committed
    pub fn prepare_share(
        &self,
        identity: &dyn IdentityEffects,
        recipient: &Address,
    ) -> Result<ShareGrant> {
        match self {
            Self::Dynamic(object) => object.prepare_share(identity, recipient),
            Self::Static(object) => object.prepare_share(identity, recipient),
        }
    }

    /// Record a share the transport accepted
    pub fn commit_share(&mut self, recipient: Address) {
        if let Self::Dynamic(object) = self {
            object.commit_share(recipient);
        }
    }

    /// Retain the object in persistence
    pub fn mark_held(&mut self) -> Result<ObjectView> {
        self.admit(Operation::Hold)?;
        self.meta_mut().held = true;
        Ok(self.view())
    }

    /// Stop following the object locally; returns whether the state changed
    pub fn discard(&mut self) -> Result<bool> {
        let next = self.admit(Operation::Discard)?;
        let changed = self.lifecycle() != next;
        if changed {
            if let Self::Dynamic(object) = self {
                object.healer.clear();
            }
            self.meta_mut().lifecycle = next;
        }
        Ok(changed)
    }

    /// Drop all content and mark the record deleted
    pub fn delete(&mut self) -> Result<ObjectView> {
        let next = self.admit(Operation::Delete)?;
        self.mark_deleted(next);
        Ok(self.view())
    }

    /// Apply a deletion announced by the author
    ///
    /// Returns the view to notify, or `None` when the record was already
    /// gone or discarded. A discarded record is cleared without notice.
    pub fn remote_delete(&mut self) -> Option<ObjectView> {
        match self.lifecycle() {
            LifecycleState::Deleted => None,
            LifecycleState::Discarded => {
                self.mark_deleted(LifecycleState::Deleted);
                None
            }
            _ => {
                self.mark_deleted(LifecycleState::Deleted);
                Some(self.view())
            }
        }
    }

    fn mark_deleted(&mut self, next: LifecycleState) {
        match self {
            Self::Dynamic(object) => object.clear(),
            Self::Static(object) => object.clear(),
        }
        let meta = self.meta_mut();
        meta.lifecycle = next;
        meta.change += 1;
    }

    /// Lift the private flag so capability routing applies
    pub fn make_public(&mut self) -> Result<ObjectView> {
        self.admit(Operation::MakePublic)?;
        let meta = self.meta_mut();
        if meta.api_id.is_none() {
            return Err(HgxError::invalid("public objects need an api id"));
        }
        meta.private = false;
        meta.parent_token = None;
        Ok(self.view())
    }

    /// Whether garbage collection may drop the record
    pub fn is_collectable(&self) -> bool {
        self.lifecycle() == LifecycleState::Discarded && !self.is_held()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use hgx_core::LocalIdentity;

    fn pair() -> (LocalIdentity, LocalIdentity) {
        let alice = LocalIdentity::from_seed([1u8; 32]);
        let bob = LocalIdentity::from_seed([2u8; 32]);
        alice.add_contact(bob.verifying_key());
        bob.add_contact(alice.verifying_key());
        (alice, bob)
    }

    fn params(legroom: u32) -> ChainParams {
        ChainParams {
            legroom,
            counter_width: 32,
            history_depth: 8,
            max_buffered: 8,
        }
    }

    fn scope() -> Scope {
        Scope {
            api_id: Some(ApiId::from_schema("test.note")),
            ..Scope::default()
        }
    }

    fn publish(object: &mut DynamicObject, identity: &LocalIdentity, payload: &[u8]) -> Frame {
        let prepared = object.prepare_update(identity, payload.to_vec()).unwrap();
        let frame = prepared.frame().clone();
        object.commit_update(prepared).unwrap();
        frame
    }

    #[test]
    fn test_create_then_publish() {
        let (alice, _) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(3));
        assert_eq!(object.view().lifecycle, LifecycleState::Created);
        let genesis = publish(&mut object, &alice, b"v0");
        assert_eq!(genesis.index, 0);
        let view = object.view();
        assert_eq!(view.lifecycle, LifecycleState::Live);
        assert_eq!(view.payload, b"v0");
        assert_eq!(view.index, Some(0));
    }

    #[test]
    fn test_prepare_does_not_mutate() {
        let (alice, _) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(3));
        publish(&mut object, &alice, b"v0");
        let before = object.view();
        let _ = object.prepare_update(&alice, b"v1".to_vec()).unwrap();
        assert_eq!(object.view(), before);
        assert_eq!(object.chain().next_index(), 1);
    }

    #[test]
    fn test_share_and_follow() {
        let (alice, bob) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(2));
        publish(&mut object, &alice, b"v0");
        let grant = object.prepare_share(&alice, &bob.address()).unwrap();
        object.commit_share(bob.address());

        let mut copy = DynamicObject::from_grant(&bob, &grant, params(2)).unwrap();
        assert_eq!(copy.view().payload, b"v0");
        assert!(!copy.view().owned);

        let now = Instant::now();
        let healing = HealingConfig::default();
        for i in 1..6 {
            let frame = publish(&mut object, &alice, format!("v{i}").as_bytes());
            let outcome = copy.ingest(&bob, frame, now, &healing).unwrap();
            assert_matches!(outcome, IngestOutcome::Applied(ref applied) if applied.len() == 1);
        }
        assert_eq!(copy.view().payload, b"v5");
    }

    #[test]
    fn test_gap_buffered_then_applied_in_order() {
        let (alice, bob) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(4));
        publish(&mut object, &alice, b"v0");
        let grant = object.prepare_share(&alice, &bob.address()).unwrap();
        object.commit_share(bob.address());
        let mut copy = DynamicObject::from_grant(&bob, &grant, params(4)).unwrap();

        let f1 = publish(&mut object, &alice, b"v1");
        let f2 = publish(&mut object, &alice, b"v2");
        let now = Instant::now();
        let healing = HealingConfig::default();

        let outcome = copy.ingest(&bob, f2, now, &healing).unwrap();
        assert_matches!(
            outcome,
            IngestOutcome::Buffered {
                missing: (1, 2),
                request: true
            }
        );
        assert!(copy.is_healing());

        let outcome = copy.ingest(&bob, f1.clone(), now, &healing).unwrap();
        let IngestOutcome::Applied(applied) = outcome else {
            panic!("expected frames to apply");
        };
        let indices: Vec<u64> = applied.iter().map(|a| a.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(applied[0].view.payload, b"v1");
        assert!(!copy.is_healing());

        assert_matches!(
            copy.ingest(&bob, f1, now, &healing).unwrap(),
            IngestOutcome::Duplicate
        );
    }

    #[test]
    fn test_heal_budget_desynchronizes() {
        let (alice, bob) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(4));
        publish(&mut object, &alice, b"v0");
        let grant = object.prepare_share(&alice, &bob.address()).unwrap();
        object.commit_share(bob.address());
        let mut copy = DynamicObject::from_grant(&bob, &grant, params(4)).unwrap();
        publish(&mut object, &alice, b"v1");
        let f2 = publish(&mut object, &alice, b"v2");

        let healing = HealingConfig {
            retry_budget: 2,
            retry_interval_ms: 10,
            max_buffered_frames: 4,
        };
        let start = Instant::now();
        copy.ingest(&bob, f2, start, &healing).unwrap();

        let step = Duration::from_millis(10);
        assert_eq!(copy.heal_tick(start + step, &healing), HealAction::Request(1, 2));
        assert_eq!(
            copy.heal_tick(start + step * 2, &healing),
            HealAction::Desynchronized { attempts: 2 }
        );
        assert!(copy.is_desynchronized());
        assert_eq!(copy.heal_tick(start + step * 3, &healing), HealAction::Idle);
        assert!(matches!(
            copy.freeze(&bob),
            Err(HgxError::ChainDesynchronized { attempts: 2, .. })
        ));
    }

    #[test]
    fn test_fork_rejected() {
        let (alice, bob) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(4));
        publish(&mut object, &alice, b"v0");
        let grant = object.prepare_share(&alice, &bob.address()).unwrap();
        object.commit_share(bob.address());
        let mut copy = DynamicObject::from_grant(&bob, &grant, params(4)).unwrap();

        let mut branch = object.clone();
        let f1 = publish(&mut object, &alice, b"v1");
        let fork = publish(&mut branch, &alice, b"other v1");
        let now = Instant::now();
        let healing = HealingConfig::default();
        copy.ingest(&bob, f1, now, &healing).unwrap();
        assert_matches!(
            copy.ingest(&bob, fork, now, &healing),
            Err(HgxError::RatchetMismatch { index: 1, .. })
        );
    }

    #[test]
    fn test_unshare_forces_keyshare() {
        let (alice, bob) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(5));
        publish(&mut object, &alice, b"v0");
        object.commit_share(bob.address());
        assert!(object.unshare(&bob.address()).unwrap());
        let frame = publish(&mut object, &alice, b"v1");
        let keyshare = frame.keyshare.expect("revocation starts a new epoch");
        assert!(keyshare.for_recipient(&bob.address()).is_none());
    }

    #[test]
    fn test_freeze_matches_state() {
        let (alice, _) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(3));
        publish(&mut object, &alice, b"v0");
        publish(&mut object, &alice, b"v1");
        let frozen = object.freeze(&alice).unwrap();
        assert_eq!(frozen.payload(), Some(&b"v1"[..]));
        assert_eq!(object.view().lifecycle, LifecycleState::Live);
    }

    #[test]
    fn test_static_grant_roundtrip() {
        let (alice, bob) = pair();
        let frozen = StaticObject::seal(&alice, scope(), b"sealed".to_vec()).unwrap();
        let grant = frozen.prepare_share(&alice, &bob.address()).unwrap();
        let received = StaticObject::from_grant(&bob, &grant).unwrap();
        assert_eq!(received.payload(), Some(&b"sealed"[..]));
        assert_eq!(received.address(), frozen.address());
    }

    #[test]
    fn test_delete_twice_is_gone() {
        let (alice, _) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(3));
        publish(&mut object, &alice, b"v0");
        let mut record = ObjectRecord::from(object);
        let view = record.delete().unwrap();
        assert_eq!(view.lifecycle, LifecycleState::Deleted);
        assert!(view.payload.is_empty());
        assert_matches!(record.delete(), Err(HgxError::ObjectGone { .. }));
    }

    #[test]
    fn test_discard_then_collect() {
        let (alice, bob) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(3));
        publish(&mut object, &alice, b"v0");
        let grant = object.prepare_share(&alice, &bob.address()).unwrap();
        let copy = DynamicObject::from_grant(&bob, &grant, params(3)).unwrap();
        let mut record = ObjectRecord::from(copy);
        assert!(record.discard().unwrap());
        assert!(!record.discard().unwrap());
        assert!(record.is_collectable());
        record.mark_held().unwrap();
        assert!(!record.is_collectable());
    }

    #[test]
    fn test_history_capped_by_legroom() {
        let (alice, _) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(1));
        for i in 0..5 {
            publish(&mut object, &alice, format!("v{i}").as_bytes());
        }
        let history = object.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().map(|(i, _)| *i), Some(4));
    }

    #[test]
    fn test_chain_retention_bounded_by_legroom() {
        let (alice, bob) = pair();
        let mut object = DynamicObject::create(&alice, scope(), params(2));
        publish(&mut object, &alice, b"v0");
        let grant = object.prepare_share(&alice, &bob.address()).unwrap();
        object.commit_share(bob.address());
        let mut copy = DynamicObject::from_grant(&bob, &grant, params(2)).unwrap();

        let healing = HealingConfig {
            retry_budget: 2,
            retry_interval_ms: 10,
            max_buffered_frames: 4,
        };
        let body = vec![7u8; 4096];
        for _ in 0..200 {
            let frame = publish(&mut object, &alice, &body);
            copy.ingest(&bob, frame, Instant::now(), &healing).unwrap();
            assert!(object.chain().len() <= 3);
            assert!(copy.chain().len() <= 3);
        }
        assert_eq!(object.chain().next_index(), 201);
        assert_eq!(copy.view().index, Some(200));
        assert_eq!(copy.view().payload, body);
    }
}
