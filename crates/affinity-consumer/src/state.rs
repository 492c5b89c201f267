// Per-session state blobs and the lifecycle hooks that seed and clear them.
use affinity_broker::{SessionBroker, SessionHandle};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::lease::{LeaseState, Session, lease_is_held};

/// Reads and writes the broker-persisted state of a held session.
#[derive(Clone)]
pub struct SessionStateStore {
    broker: Arc<dyn SessionBroker>,
}

impl SessionStateStore {
    pub fn new(broker: Arc<dyn SessionBroker>) -> Self {
        Self { broker }
    }

    /// `None` or an empty blob clears the state.
    pub async fn set_state(
        &self,
        session: &SessionHandle,
        state: Option<Bytes>,
    ) -> affinity_broker::Result<()> {
        let state = state.filter(|blob| !blob.is_empty());
        self.broker.set_session_state(session, state).await
    }

    pub async fn get_state(
        &self,
        session: &SessionHandle,
    ) -> affinity_broker::Result<Option<Bytes>> {
        self.broker.get_session_state(session).await
    }
}

/// What hooks and handlers see of the session they run under.
#[derive(Clone)]
pub struct SessionContext {
    handle: SessionHandle,
    store: SessionStateStore,
    lease: watch::Receiver<LeaseState>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.handle.session_id())
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub fn new(session: &Session, store: SessionStateStore) -> Self {
        Self {
            handle: session.handle().clone(),
            store,
            lease: session.lease(),
        }
    }

    pub fn session_id(&self) -> &str {
        self.handle.session_id()
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn locked_until(&self) -> Option<Instant> {
        match *self.lease.borrow() {
            LeaseState::Held { locked_until } => Some(locked_until),
            LeaseState::Lost => None,
        }
    }

    pub fn is_held(&self) -> bool {
        lease_is_held(&self.lease)
    }

    pub async fn get_state(&self) -> affinity_broker::Result<Option<Bytes>> {
        self.store.get_state(&self.handle).await
    }

    pub async fn set_state(&self, state: Option<Bytes>) -> affinity_broker::Result<()> {
        self.store.set_state(&self.handle, state).await
    }
}

/// Caller-supplied policy for session state.
///
/// `initializing` runs once after every acquisition. `closing` runs once when
/// the engine gives a still-held session back (idle timeout or shutdown); it is
/// skipped after lease loss.
#[async_trait]
pub trait SessionLifecycle: Send + Sync {
    async fn initializing(&self, _ctx: &SessionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn closing(&self, _ctx: &SessionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLifecycle;

impl SessionLifecycle for NoopLifecycle {}
