//! Connection core
//!
//! One task owns every object record, the router and the token table of a
//! connection. Sessions and transports talk to it over channels, so no lock
//! guards object state and every verb sees a consistent view.
//!
//! ```text
//! sessions ──commands──▶ ┌────────────────┐ ──deliveries──▶ dispatch task
//! transport ──inbound──▶ │ ConnectionCore │ ──deliveries──▶ blocking sessions
//!                        └───────┬────────┘
//!                                ▼
//!                         TransportEffects
//! ```
//!
//! Inbound traffic is drained before commands so that a command issued after
//! a delivery observes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use hgx_core::{
    Address, ApiId, AppToken, Frame, HgxConfig, HgxError, IdentityEffects, Result, ShareGrant,
    TransportEffects, Verb,
};

use crate::blocking::BlockingSession;
use crate::dispatch::{run_dispatcher, Callback, Delivery, DispatchItem, HandlerId, RegistrationKey, Router};
use crate::events::{Audience, Event, EventKind, SessionId};
use crate::lifecycle::{LifecycleState, Operation};
use crate::object::{
    ChainParams, DynamicObject, HealAction, IngestOutcome, ObjectRecord, ObjectView, Scope,
    StaticObject,
};
use crate::session::AsyncSession;
use crate::telemetry::HGX_TELEMETRY;
use crate::tokens::{TokenRegistry, TokenSnapshot};

/// Parameters of a NEW request
#[derive(Debug, Clone, Default)]
pub struct NewObject {
    /// Initial state
    pub payload: Vec<u8>,
    /// Capability id; required unless the object is private
    pub api_id: Option<ApiId>,
    /// Scope the object to the session's application token
    pub private: bool,
    /// Dynamic objects follow a frame chain; static objects are sealed once
    pub dynamic: bool,
    /// Lookahead for dynamic objects; the configured default when absent
    pub legroom: Option<u32>,
}

impl NewObject {
    /// Public dynamic object of schema `api_id`
    pub fn dynamic(api_id: ApiId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            api_id: Some(api_id),
            dynamic: true,
            ..Self::default()
        }
    }

    /// Public static object of schema `api_id`
    pub fn sealed(api_id: ApiId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            api_id: Some(api_id),
            ..Self::default()
        }
    }

    /// Dynamic object visible only to the session's application
    pub fn private(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            private: true,
            dynamic: true,
            ..Self::default()
        }
    }

    /// Override the configured lookahead
    pub fn with_legroom(mut self, legroom: u32) -> Self {
        self.legroom = Some(legroom);
        self
    }
}

/// Traffic a transport hands to the connection
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A frame of an object this connection follows
    Frame(Frame),
    /// A share addressed to this identity
    Grant(ShareGrant),
    /// The author deleted an object
    Deleted(Address),
}

/// A session request; each variant backs the session method of the same name
#[derive(Debug)]
pub enum Request {
    /// Create and publish an object
    New(NewObject),
    /// Read an object
    Get(Address),
    /// Publish a new state
    Update {
        /// Object to update
        address: Address,
        /// New plaintext state
        payload: Vec<u8>,
    },
    /// Grant read access
    Share {
        /// Object to share
        address: Address,
        /// Identity receiving the grant
        recipient: Address,
    },
    /// Revoke read access
    Unshare {
        /// Object to revoke
        address: Address,
        /// Identity losing access
        recipient: Address,
    },
    /// Snapshot into a static object
    Freeze(Address),
    /// Ask storage to retain
    Hold(Address),
    /// Stop following
    Discard(Address),
    /// Delete
    Delete(Address),
    /// Lift the private flag
    MakePublic(Address),
    /// Claim objects of an api id
    RegisterCapability(ApiId),
    /// Identity address
    Whoami,
    /// Issue and adopt a token
    NewToken,
    /// Adopt an issued token
    SetToken(AppToken),
    /// Bind a startup object to the session's token
    RegisterStartup(Address),
    /// Look up the startup object
    StartupObject,
    /// Add a callback at the end
    AppendCallback {
        /// Registration to extend
        key: RegistrationKey,
        /// Callback to add
        callback: Callback,
    },
    /// Add a callback at the front
    PrependCallback {
        /// Registration to extend
        key: RegistrationKey,
        /// Callback to add
        callback: Callback,
    },
    /// Remove one callback
    RemoveCallback {
        /// Registration holding the callback
        key: RegistrationKey,
        /// Callback to remove
        handler: HandlerId,
    },
    /// Remove all callbacks of a registration
    ClearCallbacks(RegistrationKey),
    /// Recent states
    History(Address),
    /// Drop discarded, unheld objects
    Collect,
    /// Snapshot issued tokens
    ExportTokens,
    /// Restore issued tokens
    ImportTokens(TokenSnapshot),
}

impl Request {
    /// Verb this request corresponds to, if any
    pub fn verb(&self) -> Option<Verb> {
        match self {
            Self::New(_) => Some(Verb::New),
            Self::Get(_) => Some(Verb::Get),
            Self::Update { .. } => Some(Verb::Update),
            Self::Share { .. } | Self::Unshare { .. } => Some(Verb::Share),
            Self::Freeze(_) => Some(Verb::Freeze),
            Self::Hold(_) => Some(Verb::Hold),
            Self::Discard(_) => Some(Verb::Discard),
            Self::Delete(_) => Some(Verb::Delete),
            Self::RegisterCapability(_) => Some(Verb::RegisterCapability),
            Self::Whoami => Some(Verb::Whoami),
            Self::NewToken => Some(Verb::NewToken),
            Self::SetToken(_) => Some(Verb::SetToken),
            _ => None,
        }
    }

    fn target(&self) -> Option<Address> {
        match self {
            Self::Get(address)
            | Self::Freeze(address)
            | Self::Hold(address)
            | Self::Discard(address)
            | Self::Delete(address)
            | Self::MakePublic(address)
            | Self::History(address)
            | Self::RegisterStartup(address) => Some(*address),
            Self::Update { address, .. }
            | Self::Share { address, .. }
            | Self::Unshare { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// Answer to a session request
#[derive(Debug, Clone)]
pub enum Response {
    /// Object state after the request
    Object(ObjectView),
    /// An identity address
    Address(Address),
    /// Startup object lookup
    StartupObject(Option<Address>),
    /// An issued token
    Token(AppToken),
    /// A registered callback
    Handler(HandlerId),
    /// Number of affected items
    Count(usize),
    /// Recent states, oldest first
    History(Vec<(u64, Vec<u8>)>),
    /// Token registry snapshot
    Tokens(TokenSnapshot),
    /// Acknowledgement
    Done,
}

fn unexpected(response: Response) -> HgxError {
    HgxError::internal(format!("unexpected response {response:?}"))
}

impl Response {
    /// Expect an object view
    pub fn into_object(self) -> Result<ObjectView> {
        match self {
            Self::Object(view) => Ok(view),
            other => Err(unexpected(other)),
        }
    }

    /// Expect an address
    pub fn into_address(self) -> Result<Address> {
        match self {
            Self::Address(address) => Ok(address),
            other => Err(unexpected(other)),
        }
    }

    /// Expect a startup object lookup
    pub fn into_startup_object(self) -> Result<Option<Address>> {
        match self {
            Self::StartupObject(address) => Ok(address),
            other => Err(unexpected(other)),
        }
    }

    /// Expect a token
    pub fn into_token(self) -> Result<AppToken> {
        match self {
            Self::Token(token) => Ok(token),
            other => Err(unexpected(other)),
        }
    }

    /// Expect a handler id
    pub fn into_handler(self) -> Result<HandlerId> {
        match self {
            Self::Handler(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Expect a count
    pub fn into_count(self) -> Result<usize> {
        match self {
            Self::Count(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Expect recent states
    pub fn into_history(self) -> Result<Vec<(u64, Vec<u8>)>> {
        match self {
            Self::History(history) => Ok(history),
            other => Err(unexpected(other)),
        }
    }

    /// Expect a token snapshot
    pub fn into_tokens(self) -> Result<TokenSnapshot> {
        match self {
            Self::Tokens(snapshot) => Ok(snapshot),
            other => Err(unexpected(other)),
        }
    }

    /// Expect a bare acknowledgement
    pub fn into_done(self) -> Result<()> {
        match self {
            Self::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

pub(crate) enum Command {
    OpenSession {
        blocking: Option<std::sync::mpsc::Sender<Delivery>>,
        reply: oneshot::Sender<SessionId>,
    },
    Request {
        session: SessionId,
        request: Request,
        reply: oneshot::Sender<Result<Response>>,
    },
    Quiesce(oneshot::Sender<()>),
    AwaitHealed {
        address: Address,
        reply: oneshot::Sender<Result<u64>>,
    },
    Shutdown,
}

fn closed() -> HgxError {
    HgxError::internal("connection core has stopped")
}

/// Cloneable handle to a running connection core
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    closes: mpsc::UnboundedSender<SessionId>,
    inbound: mpsc::UnboundedSender<Inbound>,
    identity: Address,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("identity", &self.identity)
            .finish()
    }
}

impl ConnectionHandle {
    /// Identity the connection acts for
    pub fn identity(&self) -> Address {
        self.identity
    }

    /// Hand inbound traffic to the core; never waits for processing
    pub fn deliver(&self, inbound: Inbound) -> Result<()> {
        self.inbound.send(inbound).map_err(|_| closed())
    }

    /// Open a session whose blocking callbacks run on the dispatch task
    pub async fn open_session(&self) -> Result<AsyncSession> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::OpenSession {
                blocking: None,
                reply,
            })
            .await
            .map_err(|_| closed())?;
        let id = response.await.map_err(|_| closed())?;
        Ok(AsyncSession::new(self.clone(), id))
    }

    /// Open a session from a thread outside the runtime
    ///
    /// Blocking callbacks of this session are queued for
    /// [`BlockingSession::dispatch_pending`] on the caller's thread.
    pub fn open_blocking_session(&self) -> Result<BlockingSession> {
        let (sink, queue) = std::sync::mpsc::channel();
        let (reply, response) = oneshot::channel();
        self.commands
            .blocking_send(Command::OpenSession {
                blocking: Some(sink),
                reply,
            })
            .map_err(|_| closed())?;
        let id = response.blocking_recv().map_err(|_| closed())?;
        Ok(BlockingSession::new(self.clone(), id, queue))
    }

    pub(crate) async fn request(&self, session: SessionId, request: Request) -> Result<Response> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Request {
                session,
                request,
                reply,
            })
            .await
            .map_err(|_| closed())?;
        response.await.map_err(|_| closed())?
    }

    pub(crate) fn blocking_request(&self, session: SessionId, request: Request) -> Result<Response> {
        let (reply, response) = oneshot::channel();
        self.commands
            .blocking_send(Command::Request {
                session,
                request,
                reply,
            })
            .map_err(|_| closed())?;
        response.blocking_recv().map_err(|_| closed())?
    }

    pub(crate) async fn await_healed(&self, address: Address) -> Result<u64> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::AwaitHealed { address, reply })
            .await
            .map_err(|_| closed())?;
        response.await.map_err(|_| closed())?
    }

    pub(crate) fn blocking_await_healed(&self, address: Address) -> Result<u64> {
        let (reply, response) = oneshot::channel();
        self.commands
            .blocking_send(Command::AwaitHealed { address, reply })
            .map_err(|_| closed())?;
        response.blocking_recv().map_err(|_| closed())?
    }

    /// Wait until queued inbound traffic is processed and its callbacks ran
    pub async fn quiesce(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Quiesce(reply))
            .await
            .map_err(|_| closed())?;
        response.await.map_err(|_| closed())
    }

    pub(crate) fn blocking_quiesce(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .blocking_send(Command::Quiesce(reply))
            .map_err(|_| closed())?;
        response.blocking_recv().map_err(|_| closed())
    }

    /// Closes never wait on the command queue
    pub(crate) fn close_session(&self, session: SessionId) {
        if self.closes.send(session).is_err() {
            tracing::debug!(%session, "Session closed after the core stopped");
        }
    }

    /// Stop the core; pending commands fail
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub(crate) fn blocking_shutdown(&self) {
        let _ = self.commands.blocking_send(Command::Shutdown);
    }
}

/// Spawns connection cores
pub struct Connection;

impl Connection {
    /// Start a connection on the current tokio runtime
    pub fn spawn(
        config: HgxConfig,
        identity: Arc<dyn IdentityEffects>,
        transport: Arc<dyn TransportEffects>,
    ) -> Result<ConnectionHandle> {
        let (core, dispatch, handle) = ConnectionCore::build(config, identity, transport)?;
        tokio::spawn(run_dispatcher(dispatch));
        tokio::spawn(core.run());
        Ok(handle)
    }
}

struct SessionState {
    token: Option<AppToken>,
    blocking: Option<std::sync::mpsc::Sender<Delivery>>,
}

pub(crate) struct ConnectionCore {
    config: HgxConfig,
    identity: Arc<dyn IdentityEffects>,
    transport: Arc<dyn TransportEffects>,
    objects: IndexMap<Address, ObjectRecord>,
    sessions: HashMap<SessionId, SessionState>,
    router: Router,
    tokens: TokenRegistry,
    heal_waiters: HealWaiters,
    dispatch: mpsc::UnboundedSender<DispatchItem>,
    commands: mpsc::Receiver<Command>,
    closes: mpsc::UnboundedReceiver<SessionId>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    next_session: u64,
    next_event: u64,
}

impl ConnectionCore {
    pub(crate) fn build(
        config: HgxConfig,
        identity: Arc<dyn IdentityEffects>,
        transport: Arc<dyn TransportEffects>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DispatchItem>, ConnectionHandle)> {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::channel(config.dispatch.command_queue_depth);
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            commands: command_tx,
            closes: close_tx,
            inbound: inbound_tx,
            identity: identity.address(),
        };
        let core = Self {
            config,
            identity,
            transport,
            objects: IndexMap::new(),
            sessions: HashMap::new(),
            router: Router::new(),
            tokens: TokenRegistry::new(),
            heal_waiters: HashMap::new(),
            dispatch: dispatch_tx,
            commands: command_rx,
            closes: close_rx,
            inbound: inbound_rx,
            next_session: 0,
            next_event: 0,
        };
        Ok((core, dispatch_rx, handle))
    }

    pub(crate) async fn run(mut self) {
        let period = Duration::from_millis((self.config.healing.retry_interval_ms / 2).max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(identity = %self.identity.address().short(), "Connection core started");
        loop {
            tokio::select! {
                biased;
                Some(session) = self.closes.recv() => self.close_session(session),
                Some(inbound) = self.inbound.recv() => self.handle_inbound(inbound).await,
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                _ = ticker.tick() => self.heal_tick().await,
            }
        }
        for (_, waiters) in self.heal_waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(closed()));
            }
        }
        tracing::debug!(identity = %self.identity.address().short(), "Connection core stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::OpenSession { blocking, reply } => {
                self.next_session += 1;
                let id = SessionId(self.next_session);
                self.sessions.insert(
                    id,
                    SessionState {
                        token: None,
                        blocking,
                    },
                );
                let _ = reply.send(id);
            }
            Command::Request {
                session,
                request,
                reply,
            } => {
                let response = self.handle_request(session, request).await;
                let _ = reply.send(response);
            }
            Command::Quiesce(reply) => {
                if let Err(mpsc::error::SendError(DispatchItem::Barrier(reply))) =
                    self.dispatch.send(DispatchItem::Barrier(reply))
                {
                    let _ = reply.send(());
                }
            }
            Command::AwaitHealed { address, reply } => self.await_healed(address, reply),
            Command::Shutdown => {}
        }
    }

    fn close_session(&mut self, session: SessionId) {
        if self.sessions.remove(&session).is_some() {
            self.router.drop_session(session);
            tracing::debug!(%session, "Session closed");
        }
    }

    async fn handle_request(&mut self, session: SessionId, request: Request) -> Result<Response> {
        if !self.sessions.contains_key(&session) {
            return Err(HgxError::invalid(format!("{session} is closed")));
        }
        let verb = request.verb();
        let target = request.target();

        let result = match request {
            Request::New(spec) => self.new_object(session, spec).await.map(Response::Object),
            Request::Get(address) => self.get(session, address).await.map(Response::Object),
            Request::Update { address, payload } => self
                .update(session, address, payload)
                .await
                .map(Response::Object),
            Request::Share { address, recipient } => self
                .share(session, address, recipient)
                .await
                .map(Response::Object),
            Request::Unshare { address, recipient } => {
                self.unshare(session, address, recipient).map(Response::Object)
            }
            Request::Freeze(address) => self.freeze(session, address).await.map(Response::Object),
            Request::Hold(address) => self.hold(session, address).await.map(Response::Object),
            Request::Discard(address) => {
                self.discard(session, address).await.map(Response::Object)
            }
            Request::Delete(address) => self.delete(session, address).await.map(Response::Object),
            Request::MakePublic(address) => {
                self.make_public(session, address).map(Response::Object)
            }
            Request::RegisterCapability(api_id) => self
                .register_capability(session, api_id)
                .map(|_| Response::Done),
            Request::Whoami => Ok(Response::Address(self.identity.address())),
            Request::NewToken => self.new_token(session).map(Response::Token),
            Request::SetToken(token) => self.set_token(session, token).map(|_| Response::Done),
            Request::RegisterStartup(address) => self
                .register_startup(session, address)
                .map(|_| Response::Done),
            Request::StartupObject => self.startup_object(session).map(Response::StartupObject),
            Request::AppendCallback { key, callback } => self
                .add_callback(session, key, callback, false)
                .map(Response::Handler),
            Request::PrependCallback { key, callback } => self
                .add_callback(session, key, callback, true)
                .map(Response::Handler),
            Request::RemoveCallback { key, handler } => self
                .router
                .remove_callback(session, key, handler)
                .map(|_| Response::Done),
            Request::ClearCallbacks(key) => {
                Ok(Response::Count(self.router.clear_callbacks(session, key)))
            }
            Request::History(address) => self.history(session, address).map(Response::History),
            Request::Collect => Ok(Response::Count(self.collect())),
            Request::ExportTokens => Ok(Response::Tokens(self.tokens.snapshot())),
            Request::ImportTokens(snapshot) => {
                self.tokens.restore(snapshot);
                Ok(Response::Done)
            }
        };

        if let Some(verb) = verb {
            match &result {
                Ok(_) => HGX_TELEMETRY.log_verb_success(verb, target.as_ref()),
                Err(error) => HGX_TELEMETRY.log_verb_failure(verb, target.as_ref(), error),
            }
        }
        result
    }

    fn session_token(&self, session: SessionId) -> Option<AppToken> {
        self.sessions.get(&session).and_then(|s| s.token)
    }

    fn chain_params(&self, legroom: Option<u32>) -> ChainParams {
        ChainParams {
            legroom: legroom.unwrap_or(self.config.ratchet.default_legroom),
            counter_width: self.config.ratchet.counter_width,
            history_depth: self.config.dispatch.history_depth,
            max_buffered: self.config.healing.max_buffered_frames,
        }
    }

    /// Look up a record the session may see
    fn record(&self, session: SessionId, address: &Address) -> Result<&ObjectRecord> {
        let record = self
            .objects
            .get(address)
            .ok_or_else(|| HgxError::not_found(format!("unknown object {address}")))?;
        if record.is_private() && record.parent_token() != self.session_token(session) {
            return Err(HgxError::inaccessible(
                *address,
                "private object belongs to another application",
            ));
        }
        Ok(record)
    }

    fn record_mut(&mut self, session: SessionId, address: &Address) -> Result<&mut ObjectRecord> {
        self.record(session, address)?;
        self.objects
            .get_mut(address)
            .ok_or_else(|| HgxError::not_found(format!("unknown object {address}")))
    }

    fn dynamic_mut(&mut self, address: &Address) -> Result<&mut DynamicObject> {
        self.objects
            .get_mut(address)
            .and_then(ObjectRecord::as_dynamic_mut)
            .ok_or_else(|| HgxError::not_found(format!("unknown dynamic object {address}")))
    }

    async fn new_object(&mut self, session: SessionId, spec: NewObject) -> Result<ObjectView> {
        let token = self.session_token(session);
        if spec.private && token.is_none() {
            return Err(HgxError::invalid("private objects need an application token"));
        }
        if !spec.private && spec.api_id.is_none() {
            return Err(HgxError::invalid("public objects need an api id"));
        }
        let scope = Scope {
            api_id: spec.api_id,
            private: spec.private,
            parent_token: if spec.private { token } else { None },
        };

        let record: ObjectRecord = if spec.dynamic {
            let mut object =
                DynamicObject::create(self.identity.as_ref(), scope, self.chain_params(spec.legroom));
            let prepared = object.prepare_update(self.identity.as_ref(), spec.payload)?;
            self.transport.publish_frame(prepared.frame(), &[]).await?;
            HGX_TELEMETRY.log_frame_published(prepared.frame(), prepared.sealed.rekeyed, 0);
            object.commit_update(prepared)?;
            object.into()
        } else {
            let object = StaticObject::seal(self.identity.as_ref(), scope, spec.payload)?;
            self.transport.publish_static(object.record()).await?;
            object.into()
        };

        let view = record.view();
        self.objects.insert(view.address, record);
        self.router.track(session, token, view.address);
        self.emit(
            EventKind::Created,
            view.clone(),
            Audience::Subscribers {
                origin: Some(session),
            },
        );
        Ok(view)
    }

    async fn get(&mut self, session: SessionId, address: Address) -> Result<ObjectView> {
        if !self.objects.contains_key(&address) {
            match self.transport.fetch_grant(&address).await? {
                Some(grant) => {
                    self.import_grant(grant, false).await?;
                }
                None => return Err(HgxError::not_found(format!("unknown object {address}"))),
            }
        }
        let record = self.record(session, &address)?;
        record.admit(Operation::Get)?;
        let view = record.view();
        self.router.track(session, self.session_token(session), address);
        Ok(view)
    }

    async fn update(
        &mut self,
        session: SessionId,
        address: Address,
        payload: Vec<u8>,
    ) -> Result<ObjectView> {
        let (prepared, recipients) = {
            let record = self.record(session, &address)?;
            record.admit(Operation::Update)?;
            let object = record
                .as_dynamic()
                .ok_or_else(|| HgxError::not_mutable(address, "static objects are immutable"))?;
            let recipients: Vec<Address> = object.recipients().copied().collect();
            (object.prepare_update(self.identity.as_ref(), payload)?, recipients)
        };

        // Nothing is committed unless the transport accepted the frame.
        self.transport
            .publish_frame(prepared.frame(), &recipients)
            .await?;
        HGX_TELEMETRY.log_frame_published(prepared.frame(), prepared.sealed.rekeyed, recipients.len());

        let view = self.dynamic_mut(&address)?.commit_update(prepared)?;
        self.emit(
            EventKind::Updated,
            view.clone(),
            Audience::Subscribers {
                origin: Some(session),
            },
        );
        Ok(view)
    }

    async fn share(
        &mut self,
        session: SessionId,
        address: Address,
        recipient: Address,
    ) -> Result<ObjectView> {
        let (grant, view) = {
            let record = self.record(session, &address)?;
            (
                record.prepare_share(self.identity.as_ref(), &recipient)?,
                record.view(),
            )
        };

        match self.transport.send_grant(&grant).await {
            Ok(()) => {
                let record = self.record_mut(session, &address)?;
                record.commit_share(recipient);
                let view = record.view();
                self.emit(
                    EventKind::ShareSucceeded { recipient },
                    view.clone(),
                    Audience::Session(session),
                );
                Ok(view)
            }
            Err(error) => {
                self.emit(
                    EventKind::ShareFailed {
                        recipient,
                        reason: error.to_string(),
                    },
                    view,
                    Audience::Session(session),
                );
                Err(error.into())
            }
        }
    }

    fn unshare(
        &mut self,
        session: SessionId,
        address: Address,
        recipient: Address,
    ) -> Result<ObjectView> {
        let record = self.record_mut(session, &address)?;
        record.admit(Operation::Unshare)?;
        let object = record
            .as_dynamic_mut()
            .ok_or_else(|| HgxError::not_mutable(address, "static objects cannot be revoked"))?;
        if !object.unshare(&recipient)? {
            return Err(HgxError::not_found(format!(
                "{recipient} does not hold a share of {address}"
            )));
        }
        Ok(object.view())
    }

    async fn freeze(&mut self, session: SessionId, address: Address) -> Result<ObjectView> {
        let frozen = {
            let record = self.record(session, &address)?;
            record.admit(Operation::Freeze)?;
            record
                .as_dynamic()
                .ok_or_else(|| HgxError::not_mutable(address, "static objects are already frozen"))?
                .freeze(self.identity.as_ref())?
        };
        self.transport.publish_static(frozen.record()).await?;
        self.transport.hold(frozen.address()).await?;

        let mut record = ObjectRecord::from(frozen);
        let view = record.mark_held()?;
        self.objects.insert(view.address, record);
        self.router
            .track(session, self.session_token(session), view.address);
        Ok(view)
    }

    async fn hold(&mut self, session: SessionId, address: Address) -> Result<ObjectView> {
        self.record(session, &address)?.admit(Operation::Hold)?;
        self.transport.hold(&address).await?;
        self.record_mut(session, &address)?.mark_held()
    }

    async fn discard(&mut self, session: SessionId, address: Address) -> Result<ObjectView> {
        let record = self.record_mut(session, &address)?;
        let changed = record.discard()?;
        let view = record.view();
        if changed {
            if !view.owned {
                if let Err(error) = self.transport.unsubscribe(&address).await {
                    tracing::warn!(object = %address.short(), %error, "Unsubscribe failed");
                }
            }
            self.resolve_heal_waiters(
                &address,
                Err(HgxError::not_mutable(address, "object was discarded")),
            );
        }
        Ok(view)
    }

    async fn delete(&mut self, session: SessionId, address: Address) -> Result<ObjectView> {
        self.record(session, &address)?.admit(Operation::Delete)?;
        self.transport.delete(&address).await?;
        let view = self.record_mut(session, &address)?.delete()?;
        self.resolve_heal_waiters(&address, Err(HgxError::object_gone(address)));
        self.emit(
            EventKind::Deleted,
            view.clone(),
            Audience::Subscribers {
                origin: Some(session),
            },
        );
        Ok(view)
    }

    fn make_public(&mut self, session: SessionId, address: Address) -> Result<ObjectView> {
        self.record_mut(session, &address)?.make_public()
    }

    fn register_capability(&mut self, session: SessionId, api_id: ApiId) -> Result<()> {
        let token = self.session_token(session);
        let deliveries = self.router.register_capability(session, token, api_id)?;
        self.enqueue(deliveries);
        Ok(())
    }

    fn new_token(&mut self, session: SessionId) -> Result<AppToken> {
        let token = self.tokens.issue();
        self.adopt_token(session, token)?;
        Ok(token)
    }

    fn set_token(&mut self, session: SessionId, token: AppToken) -> Result<()> {
        self.tokens.require(&token)?;
        self.adopt_token(session, token)
    }

    fn adopt_token(&mut self, session: SessionId, token: AppToken) -> Result<()> {
        let state = self
            .sessions
            .get_mut(&session)
            .ok_or_else(|| HgxError::invalid(format!("{session} is closed")))?;
        state.token = Some(token);
        self.router.retoken(session, Some(token));
        Ok(())
    }

    fn register_startup(&mut self, session: SessionId, address: Address) -> Result<()> {
        let token = self
            .session_token(session)
            .ok_or_else(|| HgxError::invalid("startup objects need an application token"))?;
        self.record(session, &address)?.admit(Operation::Get)?;
        self.tokens.register_startup(&token, address)
    }

    fn startup_object(&self, session: SessionId) -> Result<Option<Address>> {
        let token = self
            .session_token(session)
            .ok_or_else(|| HgxError::invalid("startup objects need an application token"))?;
        self.tokens.startup_object(&token)
    }

    fn add_callback(
        &mut self,
        session: SessionId,
        key: RegistrationKey,
        callback: Callback,
        prepend: bool,
    ) -> Result<HandlerId> {
        if let RegistrationKey::Object(address) = &key {
            self.record(session, address)?;
        }
        let token = self.session_token(session);
        let (id, deliveries) = if prepend {
            self.router.prepend_callback(session, token, key, callback)
        } else {
            self.router.append_callback(session, token, key, callback)
        };
        self.enqueue(deliveries);
        Ok(id)
    }

    fn history(&self, session: SessionId, address: Address) -> Result<Vec<(u64, Vec<u8>)>> {
        let record = self.record(session, &address)?;
        record.admit(Operation::Get)?;
        match record.as_dynamic() {
            Some(object) => Ok(object.history()),
            None => Ok(vec![(0, record.view().payload)]),
        }
    }

    /// Drop discarded records nobody holds
    fn collect(&mut self) -> usize {
        let doomed: Vec<Address> = self
            .objects
            .iter()
            .filter(|(_, record)| record.is_collectable())
            .map(|(address, _)| *address)
            .collect();
        for address in &doomed {
            self.objects.shift_remove(address);
            self.router.forget_object(address);
        }
        if !doomed.is_empty() {
            tracing::debug!(collected = doomed.len(), "Collected discarded objects");
        }
        doomed.len()
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        let result = match inbound {
            Inbound::Frame(frame) => self.ingest_frame(frame).await,
            Inbound::Grant(grant) => self.import_grant(grant, true).await.map(|_| ()),
            Inbound::Deleted(address) => {
                self.remote_delete(address);
                Ok(())
            }
        };
        if let Err(error) = result {
            tracing::debug!(%error, "Inbound traffic rejected");
        }
    }

    async fn ingest_frame(&mut self, frame: Frame) -> Result<()> {
        let address = frame.object;
        let index = frame.index;
        let Some(record) = self.objects.get_mut(&address) else {
            tracing::debug!(object = %address.short(), index, "Frame for unknown object");
            return Ok(());
        };
        let Some(object) = record.as_dynamic_mut() else {
            return Err(HgxError::invalid("frame names a static object"));
        };

        let outcome =
            match object.ingest(self.identity.as_ref(), frame, Instant::now(), &self.config.healing) {
                Ok(outcome) => outcome,
                Err(error) => {
                    HGX_TELEMETRY.log_frame_rejected(&address, index, &error);
                    return Err(error);
                }
            };
        let healed = !object.is_healing();
        let head = object.chain().next_index().saturating_sub(1);
        let buffered = object.buffered_len();
        let attempts = object.heal_attempts();

        match outcome {
            IngestOutcome::Applied(applied) => {
                for frame in applied {
                    HGX_TELEMETRY.log_frame_accepted(&address, frame.index, frame.rekeyed);
                    self.emit(
                        EventKind::Updated,
                        frame.view,
                        Audience::Subscribers { origin: None },
                    );
                }
                if healed {
                    self.resolve_heal_waiters(&address, Ok(head));
                }
            }
            IngestOutcome::Buffered { missing, request } => {
                HGX_TELEMETRY.log_gap(&address, missing, buffered);
                if request {
                    HGX_TELEMETRY.log_heal_request(&address, missing, attempts);
                    if let Err(error) = self
                        .transport
                        .request_frames(&address, missing.0, missing.1)
                        .await
                    {
                        tracing::warn!(object = %address.short(), %error, "Retransmission request failed");
                    }
                }
            }
            IngestOutcome::Dropped => {
                tracing::warn!(object = %address.short(), index, "Gap buffer full, frame dropped");
            }
            IngestOutcome::Duplicate | IngestOutcome::Ignored => {}
        }
        Ok(())
    }

    async fn import_grant(&mut self, grant: ShareGrant, notify: bool) -> Result<ObjectView> {
        if grant.recipient != self.identity.address() {
            return Err(HgxError::invalid("grant is addressed to another identity"));
        }
        if let Some(existing) = self.objects.get(&grant.object) {
            return Ok(existing.view());
        }

        let record: ObjectRecord = if grant.is_dynamic() {
            let params = self.chain_params(None);
            DynamicObject::from_grant(self.identity.as_ref(), &grant, params)?.into()
        } else {
            StaticObject::from_grant(self.identity.as_ref(), &grant)?.into()
        };
        if grant.is_dynamic() {
            self.transport.subscribe(&grant.object).await?;
        }

        let view = record.view();
        self.objects.insert(grant.object, record);
        tracing::info!(
            object = %grant.object.short(),
            from = %grant.sender.short(),
            dynamic = grant.is_dynamic(),
            "Share received"
        );
        if notify {
            self.emit(
                EventKind::Shared { from: grant.sender },
                view.clone(),
                Audience::Subscribers { origin: None },
            );
        }
        Ok(view)
    }

    fn remote_delete(&mut self, address: Address) {
        let Some(view) = self
            .objects
            .get_mut(&address)
            .and_then(ObjectRecord::remote_delete)
        else {
            return;
        };
        self.resolve_heal_waiters(&address, Err(HgxError::object_gone(address)));
        self.emit(
            EventKind::Deleted,
            view,
            Audience::Subscribers { origin: None },
        );
    }

    async fn heal_tick(&mut self) {
        prune_heal_waiters(&mut self.heal_waiters);
        let now = Instant::now();
        let mut requests = Vec::new();
        let mut desynchronized = Vec::new();
        for (address, record) in self.objects.iter_mut() {
            let Some(object) = record.as_dynamic_mut() else {
                continue;
            };
            match object.heal_tick(now, &self.config.healing) {
                HealAction::Idle => {}
                HealAction::Request(from, to) => {
                    requests.push((*address, (from, to), object.heal_attempts()))
                }
                HealAction::Desynchronized { attempts } => {
                    desynchronized.push((*address, attempts, object.view()))
                }
            }
        }

        for (address, (from, to), attempt) in requests {
            HGX_TELEMETRY.log_heal_request(&address, (from, to), attempt);
            if let Err(error) = self.transport.request_frames(&address, from, to).await {
                tracing::warn!(object = %address.short(), %error, "Retransmission request failed");
            }
        }
        for (address, attempts, view) in desynchronized {
            HGX_TELEMETRY.log_desynchronized(&address, attempts);
            self.resolve_heal_waiters(
                &address,
                Err(HgxError::ChainDesynchronized { address, attempts }),
            );
            self.emit(
                EventKind::Desynchronized,
                view,
                Audience::Subscribers { origin: None },
            );
        }
    }

    fn await_healed(&mut self, address: Address, reply: oneshot::Sender<Result<u64>>) {
        let ready = match self.objects.get(&address) {
            None => Some(Err(HgxError::not_found(format!("unknown object {address}")))),
            Some(record) if record.lifecycle() == LifecycleState::Deleted => {
                Some(Err(HgxError::object_gone(address)))
            }
            Some(record) => match record.as_dynamic() {
                None => Some(Ok(0)),
                Some(object) if object.is_desynchronized() => {
                    let attempts = object.desynchronized_after().unwrap_or_default();
                    Some(Err(HgxError::ChainDesynchronized { address, attempts }))
                }
                Some(object) if !object.is_healing() => {
                    Some(Ok(object.chain().next_index().saturating_sub(1)))
                }
                Some(_) => None,
            },
        };
        match ready {
            Some(result) => {
                let _ = reply.send(result);
            }
            None => {
                let waiters = self.heal_waiters.entry(address).or_default();
                waiters.retain(|waiter| !waiter.is_closed());
                waiters.push(reply);
            }
        }
    }

    fn resolve_heal_waiters(&mut self, address: &Address, result: Result<u64>) {
        if let Some(waiters) = self.heal_waiters.remove(address) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn emit(&mut self, kind: EventKind, object: ObjectView, audience: Audience) {
        self.next_event += 1;
        let name = kind.name();
        let address = object.address;
        let deliveries = self.router.route(Event {
            sequence: self.next_event,
            kind,
            object,
            audience,
        });
        HGX_TELEMETRY.log_dispatch(&address, name, deliveries.len());
        self.enqueue(deliveries);
    }

    fn enqueue(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let sink = if delivery.callback.is_blocking() {
                self.sessions
                    .get(&delivery.session)
                    .and_then(|state| state.blocking.clone())
            } else {
                None
            };
            let sent = match sink {
                Some(sink) => sink.send(delivery).is_ok(),
                None => self.dispatch.send(DispatchItem::Deliver(delivery)).is_ok(),
            };
            if !sent {
                tracing::debug!("Dropping delivery for a closed consumer");
            }
        }
    }
}

type HealWaiters = HashMap<Address, Vec<oneshot::Sender<Result<u64>>>>;

/// Forget waiters whose caller stopped listening
fn prune_heal_waiters(waiters: &mut HealWaiters) {
    waiters.retain(|_, pending| {
        pending.retain(|waiter| !waiter.is_closed());
        !pending.is_empty()
    });
}
