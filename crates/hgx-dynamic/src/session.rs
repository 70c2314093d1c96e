//! Async sessions
//!
//! A session is one application's view of a connection: it carries the
//! application token, owns its callback registrations and is never echoed
//! its own changes. Dropping a session closes it.

use tracing::instrument;

use hgx_core::{Address, ApiId, AppToken, Result};

use crate::connection::{ConnectionHandle, NewObject, Request, Response};
use crate::dispatch::{Callback, HandlerId, RegistrationKey};
use crate::events::SessionId;
use crate::object::ObjectView;
use crate::tokens::TokenSnapshot;

/// Session used from async code
#[derive(Debug)]
pub struct AsyncSession {
    handle: ConnectionHandle,
    id: SessionId,
}

impl AsyncSession {
    pub(crate) fn new(handle: ConnectionHandle, id: SessionId) -> Self {
        Self { handle, id }
    }

    /// Identifier of this session
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Connection the session runs on
    pub fn connection(&self) -> &ConnectionHandle {
        &self.handle
    }

    async fn call(&self, request: Request) -> Result<Response> {
        self.handle.request(self.id, request).await
    }

    /// Create and publish an object
    #[instrument(level = "debug", skip_all, fields(session = %self.id, dynamic = spec.dynamic))]
    pub async fn new_object(&self, spec: NewObject) -> Result<ObjectView> {
        self.call(Request::New(spec)).await?.into_object()
    }

    /// Current state of an object, importing a pending share if needed
    pub async fn get(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::Get(address)).await?.into_object()
    }

    /// Publish a new state; nothing changes locally if the transport fails
    #[instrument(level = "debug", skip_all, fields(session = %self.id, object = %address.short()))]
    pub async fn update(&self, address: Address, payload: impl Into<Vec<u8>>) -> Result<ObjectView> {
        self.call(Request::Update {
            address,
            payload: payload.into(),
        })
        .await?
        .into_object()
    }

    /// Hand `recipient` read access; the outcome is also notified to this session
    #[instrument(level = "debug", skip_all, fields(session = %self.id, object = %address.short(), recipient = %recipient.short()))]
    pub async fn share(&self, address: Address, recipient: Address) -> Result<ObjectView> {
        self.call(Request::Share { address, recipient })
            .await?
            .into_object()
    }

    /// Revoke a recipient; it cannot read frames after the next keyshare
    #[instrument(level = "debug", skip_all, fields(session = %self.id, object = %address.short(), recipient = %recipient.short()))]
    pub async fn unshare(&self, address: Address, recipient: Address) -> Result<ObjectView> {
        self.call(Request::Unshare { address, recipient })
            .await?
            .into_object()
    }

    /// Seal the current state as a new static object
    #[instrument(level = "debug", skip_all, fields(session = %self.id, object = %address.short()))]
    pub async fn freeze(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::Freeze(address)).await?.into_object()
    }

    /// Ask storage to retain the object
    pub async fn hold(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::Hold(address)).await?.into_object()
    }

    /// Stop following the object; later frames produce no callbacks
    pub async fn discard(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::Discard(address)).await?.into_object()
    }

    /// Delete the object; a second delete reports `ObjectGone`
    #[instrument(level = "debug", skip_all, fields(session = %self.id, object = %address.short()))]
    pub async fn delete(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::Delete(address)).await?.into_object()
    }

    /// Lift the private flag of an owned object
    pub async fn make_public(&self, address: Address) -> Result<ObjectView> {
        self.call(Request::MakePublic(address)).await?.into_object()
    }

    /// Claim objects of `api_id` created or shared elsewhere
    pub async fn register_capability(&self, api_id: ApiId) -> Result<()> {
        self.call(Request::RegisterCapability(api_id))
            .await?
            .into_done()
    }

    /// Address of the connection's identity
    pub async fn whoami(&self) -> Result<Address> {
        self.call(Request::Whoami).await?.into_address()
    }

    /// Issue a token and adopt it for this session
    pub async fn new_token(&self) -> Result<AppToken> {
        self.call(Request::NewToken).await?.into_token()
    }

    /// Adopt a previously issued token
    pub async fn set_token(&self, token: AppToken) -> Result<()> {
        self.call(Request::SetToken(token)).await?.into_done()
    }

    /// Record `address` as the startup object of this session's token
    pub async fn register_startup(&self, address: Address) -> Result<()> {
        self.call(Request::RegisterStartup(address))
            .await?
            .into_done()
    }

    /// Startup object of this session's token
    pub async fn startup_object(&self) -> Result<Option<Address>> {
        self.call(Request::StartupObject)
            .await?
            .into_startup_object()
    }

    /// Run `callback` after the registration's existing callbacks
    pub async fn append_callback(&self, key: RegistrationKey, callback: Callback) -> Result<HandlerId> {
        self.call(Request::AppendCallback { key, callback })
            .await?
            .into_handler()
    }

    /// Run `callback` before the registration's existing callbacks
    pub async fn prepend_callback(&self, key: RegistrationKey, callback: Callback) -> Result<HandlerId> {
        self.call(Request::PrependCallback { key, callback })
            .await?
            .into_handler()
    }

    /// Remove one callback by handler id
    pub async fn remove_callback(&self, key: RegistrationKey, handler: HandlerId) -> Result<()> {
        self.call(Request::RemoveCallback { key, handler })
            .await?
            .into_done()
    }

    /// Remove all callbacks of a registration, returning how many there were
    pub async fn clear_callbacks(&self, key: RegistrationKey) -> Result<usize> {
        self.call(Request::ClearCallbacks(key)).await?.into_count()
    }

    /// Recent states of an object, oldest first
    pub async fn history(&self, address: Address) -> Result<Vec<(u64, Vec<u8>)>> {
        self.call(Request::History(address)).await?.into_history()
    }

    /// Drop discarded objects that are not held
    pub async fn collect(&self) -> Result<usize> {
        self.call(Request::Collect).await?.into_count()
    }

    /// Snapshot of issued tokens for persistence
    pub async fn export_tokens(&self) -> Result<TokenSnapshot> {
        self.call(Request::ExportTokens).await?.into_tokens()
    }

    /// Restore tokens from a snapshot
    pub async fn import_tokens(&self, snapshot: TokenSnapshot) -> Result<()> {
        self.call(Request::ImportTokens(snapshot))
            .await?
            .into_done()
    }

    /// Wait until the object's chain has no gap; returns the head index
    pub async fn await_healed(&self, address: Address) -> Result<u64> {
        self.handle.await_healed(address).await
    }

    /// Wait until pending inbound traffic and callbacks have run
    pub async fn quiesce(&self) -> Result<()> {
        self.handle.quiesce().await
    }
}

impl Drop for AsyncSession {
    fn drop(&mut self) {
        self.handle.close_session(self.id);
    }
}
