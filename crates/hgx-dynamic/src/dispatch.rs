//! Notification routing and callback execution
//!
//! The [`Router`] decides which callbacks an [`Event`] reaches. Registrations
//! are keyed by session and either a capability (api id) or a single object.
//! Each registration keeps an ordered callback list and a per-object
//! watermark, so one state change reaches each callback at most once.
//!
//! Routing rules:
//! - private objects reach only registrations holding the creating token
//! - events caused by a session are not echoed back to it
//! - share results reach only the session that asked for the share
//! - a share nobody is listening for is held until a matching capability
//!   registers a callback

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use hgx_core::{Address, ApiId, AppToken, HgxError, Result};

use crate::events::{Audience, Event, EventKind, SessionId};

/// Shares held while no capability is listening
const MAX_ORPHANS: usize = 256;

/// Handle for removing a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandlerId(pub u64);

/// What a registration listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistrationKey {
    /// New and shared objects of a schema
    Api(ApiId),
    /// Changes to one object
    Object(Address),
}

/// Future-returning callback run on the connection's dispatch task
pub type AsyncHandler = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, ()> + Send + Sync>;
/// Plain callback run on the consumer's own thread
pub type BlockingHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// A registered callback
#[derive(Clone)]
pub enum Callback {
    /// Awaited in order on the dispatch task
    NonBlocking(AsyncHandler),
    /// Run on the consumer's thread, or the dispatch task for async sessions
    Blocking(BlockingHandler),
}

impl Callback {
    /// Wrap an async closure
    pub fn non_blocking<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::NonBlocking(Arc::new(move |event| f(event).boxed()))
    }

    /// Wrap a plain closure
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    /// Whether the callback runs on the consumer's thread
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocking(_))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonBlocking(_) => f.write_str("Callback::NonBlocking"),
            Self::Blocking(_) => f.write_str("Callback::Blocking"),
        }
    }
}

/// Ordered callbacks of one registration
#[derive(Debug, Clone, Default)]
pub struct CallbackList {
    entries: Vec<(HandlerId, Callback)>,
}

impl CallbackList {
    /// Add a callback at the end
    pub fn append(&mut self, id: HandlerId, callback: Callback) {
        self.entries.push((id, callback));
    }

    /// Add a callback at the front
    pub fn prepend(&mut self, id: HandlerId, callback: Callback) {
        self.entries.insert(0, (id, callback));
    }

    /// Remove the first callback with `id`
    pub fn remove(&mut self, id: HandlerId) -> Result<Callback> {
        let position = self
            .entries
            .iter()
            .position(|(entry, _)| *entry == id)
            .ok_or(HgxError::CallbackNotFound { handler: id.0 })?;
        Ok(self.entries.remove(position).1)
    }

    /// Remove every callback; returns how many were removed
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Number of callbacks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no callback is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Callbacks in run order
    pub fn iter(&self) -> impl Iterator<Item = &(HandlerId, Callback)> {
        self.entries.iter()
    }
}

#[derive(Debug, Default)]
struct Registration {
    token: Option<AppToken>,
    capability: bool,
    callbacks: CallbackList,
    watermarks: HashMap<Address, u64>,
}

impl Registration {
    fn new(token: Option<AppToken>) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    /// Whether the change in `event` is new to this registration
    fn admit(&mut self, event: &Event) -> bool {
        if !event.kind.is_state_change() {
            return true;
        }
        let address = event.object.address;
        if let Some(&seen) = self.watermarks.get(&address) {
            if seen >= event.object.change {
                return false;
            }
        }
        self.watermarks.insert(address, event.object.change);
        true
    }
}

/// One callback invocation
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Session owning the registration
    pub session: SessionId,
    /// Callback being run
    pub handler: HandlerId,
    /// Callback to run
    pub callback: Callback,
    /// Event shared by every delivery of one change
    pub event: Arc<Event>,
}

/// Registration table of one connection
#[derive(Debug, Default)]
pub struct Router {
    registrations: IndexMap<(SessionId, RegistrationKey), Registration>,
    orphans: VecDeque<Arc<Event>>,
    next_handler: u64,
}

fn matches(key: &RegistrationKey, event: &Event) -> bool {
    match key {
        RegistrationKey::Object(address) => address == event.address(),
        RegistrationKey::Api(api_id) => {
            event.kind.reaches_capabilities()
                && !event.object.private
                && event.object.api_id.as_ref() == Some(api_id)
        }
    }
}

fn visible(session: SessionId, registration: &Registration, event: &Event) -> bool {
    match event.audience {
        Audience::Session(target) if target != session => return false,
        Audience::Subscribers { origin: Some(origin) } if origin == session => return false,
        _ => {}
    }
    !event.object.private || registration.token == event.object.parent_token
}

impl Router {
    /// Router with no registrations
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_handler(&mut self) -> HandlerId {
        self.next_handler += 1;
        HandlerId(self.next_handler)
    }

    fn entry(
        &mut self,
        session: SessionId,
        token: Option<AppToken>,
        key: RegistrationKey,
    ) -> &mut Registration {
        self.registrations
            .entry((session, key))
            .or_insert_with(|| Registration::new(token))
    }

    /// Declare that `session` handles objects of `api_id`
    pub fn register_capability(
        &mut self,
        session: SessionId,
        token: Option<AppToken>,
        api_id: ApiId,
    ) -> Result<Vec<Delivery>> {
        let key = RegistrationKey::Api(api_id.clone());
        let registration = self.entry(session, token, key.clone());
        if registration.capability {
            return Err(HgxError::CapabilityConflict { api_id });
        }
        registration.capability = true;
        Ok(self.flush_orphans(session, &key))
    }

    /// Track an object for `session` without adding callbacks
    pub fn track(&mut self, session: SessionId, token: Option<AppToken>, address: Address) {
        self.entry(session, token, RegistrationKey::Object(address));
    }

    /// Add a callback after the existing ones
    pub fn append_callback(
        &mut self,
        session: SessionId,
        token: Option<AppToken>,
        key: RegistrationKey,
        callback: Callback,
    ) -> (HandlerId, Vec<Delivery>) {
        let id = self.allocate_handler();
        self.entry(session, token, key.clone())
            .callbacks
            .append(id, callback);
        (id, self.flush_orphans(session, &key))
    }

    /// Add a callback before the existing ones
    pub fn prepend_callback(
        &mut self,
        session: SessionId,
        token: Option<AppToken>,
        key: RegistrationKey,
        callback: Callback,
    ) -> (HandlerId, Vec<Delivery>) {
        let id = self.allocate_handler();
        self.entry(session, token, key.clone())
            .callbacks
            .prepend(id, callback);
        (id, self.flush_orphans(session, &key))
    }

    /// Remove one callback by handler id
    pub fn remove_callback(
        &mut self,
        session: SessionId,
        key: RegistrationKey,
        handler: HandlerId,
    ) -> Result<()> {
        self.registrations
            .get_mut(&(session, key))
            .ok_or(HgxError::CallbackNotFound { handler: handler.0 })?
            .callbacks
            .remove(handler)
            .map(|_| ())
    }

    /// Remove every callback of a registration
    pub fn clear_callbacks(&mut self, session: SessionId, key: RegistrationKey) -> usize {
        self.registrations
            .get_mut(&(session, key))
            .map(|registration| registration.callbacks.clear())
            .unwrap_or(0)
    }

    /// Number of callbacks on a registration
    pub fn callback_count(&self, session: SessionId, key: &RegistrationKey) -> usize {
        self.registrations
            .get(&(session, key.clone()))
            .map(|registration| registration.callbacks.len())
            .unwrap_or(0)
    }

    /// Move a session's registrations to a new token
    pub fn retoken(&mut self, session: SessionId, token: Option<AppToken>) {
        for ((owner, _), registration) in self.registrations.iter_mut() {
            if *owner == session {
                registration.token = token;
            }
        }
    }

    /// Forget every registration of a session
    pub fn drop_session(&mut self, session: SessionId) {
        self.registrations.retain(|(owner, _), _| *owner != session);
    }

    /// Forget object registrations for `address`
    pub fn forget_object(&mut self, address: &Address) {
        self.registrations
            .retain(|(_, key), _| !matches!(key, RegistrationKey::Object(a) if a == address));
    }

    /// Shares waiting for a capability
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Compute the deliveries for `event`, in registration then callback order
    pub fn route(&mut self, event: Event) -> Vec<Delivery> {
        let event = Arc::new(event);
        let mut deliveries = Vec::new();
        for ((session, key), registration) in self.registrations.iter_mut() {
            if !matches(key, &event) || !visible(*session, registration, &event) {
                continue;
            }
            if registration.callbacks.is_empty() || !registration.admit(&event) {
                continue;
            }
            for (handler, callback) in registration.callbacks.iter() {
                deliveries.push(Delivery {
                    session: *session,
                    handler: *handler,
                    callback: callback.clone(),
                    event: event.clone(),
                });
            }
        }

        if deliveries.is_empty() && matches!(event.kind, EventKind::Shared { .. }) {
            if self.orphans.len() >= MAX_ORPHANS {
                if let Some(dropped) = self.orphans.pop_front() {
                    tracing::warn!(
                        object = %dropped.address().short(),
                        "Dropping unclaimed share"
                    );
                }
            }
            self.orphans.push_back(event);
        }
        deliveries
    }

    fn flush_orphans(&mut self, session: SessionId, key: &RegistrationKey) -> Vec<Delivery> {
        if !matches!(key, RegistrationKey::Api(_)) {
            return Vec::new();
        }
        let Some(registration) = self.registrations.get_mut(&(session, key.clone())) else {
            return Vec::new();
        };
        if registration.callbacks.is_empty() {
            return Vec::new();
        }

        let mut deliveries = Vec::new();
        let mut kept = VecDeque::with_capacity(self.orphans.len());
        for event in self.orphans.drain(..) {
            if !matches(key, &event) || !visible(session, registration, &event) {
                kept.push_back(event);
                continue;
            }
            if !registration.admit(&event) {
                continue;
            }
            for (handler, callback) in registration.callbacks.iter() {
                deliveries.push(Delivery {
                    session,
                    handler: *handler,
                    callback: callback.clone(),
                    event: event.clone(),
                });
            }
        }
        self.orphans = kept;
        deliveries
    }
}

/// Work queued for the dispatch task
pub(crate) enum DispatchItem {
    Deliver(Delivery),
    /// Resolved once every earlier item has run
    Barrier(oneshot::Sender<()>),
}

/// Run non-blocking callbacks one at a time, in the order they were queued
pub(crate) async fn run_dispatcher(mut queue: mpsc::UnboundedReceiver<DispatchItem>) {
    while let Some(item) = queue.recv().await {
        match item {
            DispatchItem::Deliver(delivery) => execute(delivery).await,
            DispatchItem::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Dispatch queue closed");
}

async fn execute(delivery: Delivery) {
    let Delivery {
        session,
        handler,
        callback,
        event,
    } = delivery;
    let outcome = match callback {
        Callback::NonBlocking(run) => AssertUnwindSafe(run(event)).catch_unwind().await.is_ok(),
        Callback::Blocking(run) => tokio::task::spawn_blocking(move || run(&event))
            .await
            .is_ok(),
    };
    if !outcome {
        tracing::error!(%session, handler = handler.0, "Callback panicked");
    }
}
