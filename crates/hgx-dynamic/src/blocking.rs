//! Blocking front end
//!
//! [`BlockingClient`] runs a connection on a private single-threaded runtime
//! so plain threads can use it. Blocking callbacks registered through a
//! [`BlockingSession`] are not run by the connection; they queue up until the
//! owning thread calls [`BlockingSession::dispatch_next`] or
//! [`BlockingSession::dispatch_pending`].
//!
//! None of these methods may be called from inside an async runtime.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::oneshot;

use hgx_core::{
    Address, ApiId, AppToken, HgxConfig, HgxError, IdentityEffects, Result, TransportEffects,
};

use crate::connection::{Connection, ConnectionHandle, NewObject, Request, Response};
use crate::dispatch::{Callback, Delivery, HandlerId, RegistrationKey};
use crate::events::SessionId;
use crate::object::ObjectView;
use crate::tokens::TokenSnapshot;

/// A connection driven by its own background thread
pub struct BlockingClient {
    handle: ConnectionHandle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient")
            .field("handle", &self.handle)
            .finish()
    }
}

impl BlockingClient {
    /// Start the connection thread and wait until the core is running
    pub fn connect(
        config: HgxConfig,
        identity: Arc<dyn IdentityEffects>,
        transport: Arc<dyn TransportEffects>,
    ) -> Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("hgx-connection".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(HgxError::internal(format!(
                            "failed to build runtime: {e}"
                        ))));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let handle = Connection::spawn(config, identity, transport);
                    let started = handle.is_ok();
                    let _ = ready_tx.send(handle);
                    if started {
                        let _ = stop_rx.await;
                    }
                });
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| HgxError::internal("connection thread exited during startup"))??;
        Ok(Self {
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Handle to the connection core
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Open a session whose blocking callbacks queue for the calling thread
    pub fn open_session(&self) -> Result<BlockingSession> {
        self.handle.open_blocking_session()
    }
}

impl Drop for BlockingClient {
    fn drop(&mut self) {
        self.handle.blocking_shutdown();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Connection thread panicked");
            }
        }
    }
}

/// Session used from a plain thread
pub struct BlockingSession {
    handle: ConnectionHandle,
    id: SessionId,
    queue: std_mpsc::Receiver<Delivery>,
}

impl std::fmt::Debug for BlockingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingSession").field("id", &self.id).finish()
    }
}

impl BlockingSession {
    pub(crate) fn new(
        handle: ConnectionHandle,
        id: SessionId,
        queue: std_mpsc::Receiver<Delivery>,
    ) -> Self {
        Self { handle, id, queue }
    }

    /// Identifier of this session
    pub fn id(&self) -> SessionId {
        self.id
    }

    fn call(&self, request: Request) -> Result<Response> {
        self.handle.blocking_request(self.id, request)
    }

    /// Create and publish an object
    pub fn new_object(&self, spec: NewObject) -> Result<ObjectView> {
        self.call(Request::New(spec))?.into_object()
    }

    /// Current state of an object, importing a pending share if needed
    pub fn get(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::Get(address))?.into_object()
    }

    /// Publish a new state; nothing changes locally if the transport fails
    pub fn update(&self, address: Address, payload: impl Into<Vec<u8>>) -> Result<ObjectView> {
        self.call(Request::Update {
            address,
            payload: payload.into(),
        })?
        .into_object()
    }

    /// Hand `recipient` read access
    pub fn share(&self, address: Address, recipient: Address) -> Result<ObjectView> {
        self.call(Request::Share { address, recipient })?
            .into_object()
    }

    /// Revoke a recipient from the next keyshare on
    pub fn unshare(&self, address: Address, recipient: Address) -> Result<ObjectView> {
        self.call(Request::Unshare { address, recipient })?
            .into_object()
    }

    /// Seal the current state as a new static object
    pub fn freeze(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::Freeze(address))?.into_object()
    }

    /// Ask storage to retain the object
    pub fn hold(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::Hold(address))?.into_object()
    }

    /// Stop following the object
    pub fn discard(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::Discard(address))?.into_object()
    }

    /// Delete the object
    pub fn delete(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::Delete(address))?.into_object()
    }

    /// Lift the private flag of an owned object
    pub fn make_public(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::MakePublic(address))?.into_object()
    }

    /// Claim objects of `api_id` created or shared elsewhere
    pub fn register_capability(&self, api_id: ApiId) -> Result<()> {
        self.call(Request::RegisterCapability(api_id))?.into_done()
    }

    /// Address of the connection's identity
    pub fn whoami(&self) -> Result<Address> {
        self.call(Request::Whoami)?.into_address()
    }

    /// Issue a token and adopt it for this session
    pub fn new_token(&self) -> Result<AppToken> {
        self.call(Request::NewToken)?.into_token()
    }

    /// Adopt a previously issued token
    pub fn set_token(&self, token: AppToken) -> Result<()> {
        self.call(Request::SetToken(token))?.into_done()
    }

    /// Record `address` as the startup object of this session's token
    pub fn register_startup(&self, address: Address) -> Result<()> {
        self.call(Request::RegisterStartup(address))?.into_done()
    }

    /// Startup object of this session's token
    pub fn startup_object(&self) -> Result<Option<Address>> {
        self.call(Request::StartupObject)?.into_startup_object()
    }

    /// Run `callback` after the registration's existing callbacks
    pub fn append_callback(&self, key: RegistrationKey, callback: Callback) -> Result<HandlerId> {
        self.call(Request::AppendCallback { key, callback })?
            .into_handler()
    }

    /// Run `callback` before the registration's existing callbacks
    pub fn prepend_callback(&self, key: RegistrationKey, callback: Callback) -> Result<HandlerId> {
        self.call(Request::PrependCallback { key, callback })?
            .into_handler()
    }

    /// Remove one callback by handler id
    pub fn remove_callback(&self, key: RegistrationKey, handler: HandlerId) -> Result<()> {
        self.call(Request::RemoveCallback { key, handler })?
            .into_done()
    }

    /// Remove all callbacks of a registration, returning how many there were
    pub fn clear_callbacks(&self, key: RegistrationKey) -> Result<usize> {
        self.call(Request::ClearCallbacks(key))?.into_count()
    }

    /// Recent states of an object, oldest first
    pub fn history(&self, address: Address) -> Result<Vec<(u64, Vec<u8>)>> {
        self.call(Request::History(address))?.into_history()
    }

    /// Drop discarded objects that are not held
    pub fn collect(&self) -> Result<usize> {
        self.call(Request::Collect)?.into_count()
    }

    /// Snapshot of issued tokens for persistence
    pub fn export_tokens(&self) -> Result<TokenSnapshot> {
        self.call(Request::ExportTokens)?.into_tokens()
    }

    /// Restore tokens from a snapshot
    pub fn import_tokens(&self, snapshot: TokenSnapshot) -> Result<()> {
        self.call(Request::ImportTokens(snapshot))?.into_done()
    }

    /// Block until the object's chain has no gap; returns the head index
    pub fn await_healed(&self, address: Address) -> Result<u64> {
        self.handle.blocking_await_healed(address)
    }

    /// Run the next queued callback, waiting up to `timeout` for one
    ///
    /// Returns whether a callback ran.
    pub fn dispatch_next(&self, timeout: Duration) -> Result<bool> {
        match self.queue.recv_timeout(timeout) {
            Ok(delivery) => {
                run(delivery);
                Ok(true)
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(false),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                Err(HgxError::internal("connection core has stopped"))
            }
        }
    }

    /// Process pending inbound traffic, then run every queued callback
    pub fn dispatch_pending(&self) -> Result<usize> {
        self.handle.blocking_quiesce()?;
        let mut ran = 0;
        while let Ok(delivery) = self.queue.try_recv() {
            run(delivery);
            ran += 1;
        }
        Ok(ran)
    }
}

fn run(delivery: Delivery) {
    let Delivery {
        session,
        handler,
        callback,
        event,
    } = delivery;
    let outcome = match callback {
        Callback::Blocking(f) => catch_unwind(AssertUnwindSafe(|| f(&event))),
        Callback::NonBlocking(f) => {
            catch_unwind(AssertUnwindSafe(|| futures::executor::block_on(f(event))))
        }
    };
    if outcome.is_err() {
        tracing::error!(%session, handler = handler.0, "Callback panicked");
    }
}

impl Drop for BlockingSession {
    fn drop(&mut self) {
        self.handle.close_session(self.id);
    }
}
