// Broker client surface consumed by the session consumer.
// The broker owns network I/O, persistence, and lock leases; consumers only see
// the primitives below. `InMemoryBroker` implements them in-process for tests,
// demos, and embedding.
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub mod memory;

pub use memory::{
    DeadLetter, InMemoryBroker, QueueOptions, SettlementOutcome, SettlementRecord,
};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("session lock lost: queue={queue} session={session_id}")]
    LeaseLost { queue: String, session_id: String },
    #[error("message lock lost: session={session_id} sequence={sequence}")]
    MessageLockLost { session_id: String, sequence: u64 },
    #[error("transient broker failure: {0}")]
    Transient(String),
    #[error("session unavailable: session={session_id}: {reason}")]
    SessionUnavailable { session_id: String, reason: String },
    #[error("queue not found: {0}")]
    QueueNotFound(String),
}

impl BrokerError {
    /// Failures worth retrying on the same session.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }

    /// Session or message lock is gone; settlement on this session can no
    /// longer succeed.
    pub fn is_lock_lost(&self) -> bool {
        matches!(
            self,
            BrokerError::LeaseLost { .. } | BrokerError::MessageLockLost { .. }
        )
    }
}

/// Opaque lock token issued by the broker for a session or a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which session `accept_session` should lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSelector<'a> {
    /// Any unlocked session with pending messages.
    NextAvailable,
    /// A specific session id, waiting for it to become unlocked.
    Named(&'a str),
}

/// Proof of a session lock returned by `accept_session`.
///
/// `locked_until` is the expiry at acceptance time; renewals return the new
/// expiry instead of mutating the handle.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    queue: Arc<str>,
    session_id: Arc<str>,
    lock_token: LockToken,
    locked_until: Instant,
}

impl SessionHandle {
    pub fn new(
        queue: impl Into<Arc<str>>,
        session_id: impl Into<Arc<str>>,
        lock_token: LockToken,
        locked_until: Instant,
    ) -> Self {
        Self {
            queue: queue.into(),
            session_id: session_id.into(),
            lock_token,
            locked_until,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn lock_token(&self) -> LockToken {
        self.lock_token
    }

    pub fn locked_until(&self) -> Instant {
        self.locked_until
    }
}

/// A message delivered under a session lock.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub session_id: Arc<str>,
    // Enqueue sequence; strictly increasing within a session.
    pub sequence: u64,
    // Starts at 1 on first delivery.
    pub delivery_count: u32,
    // Message-scoped lock, distinct from the session lock.
    pub lock_token: LockToken,
    pub enqueued_at: Instant,
    pub body: Bytes,
}

/// Session-aware broker primitives.
///
/// Every call is a suspension point. Implementations must be safe to share
/// across tasks; the consumer holds one `Arc<dyn SessionBroker>` for all
/// pipelines.
#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// Lock a session. `Ok(None)` means nothing matched before `timeout`.
    async fn accept_session(
        &self,
        queue: &str,
        selector: SessionSelector<'_>,
        timeout: Duration,
    ) -> Result<Option<SessionHandle>>;

    /// Next message in sequence order. `Ok(None)` when the wait elapsed empty.
    async fn receive(
        &self,
        session: &SessionHandle,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>>;

    async fn complete(&self, session: &SessionHandle, message: &ReceivedMessage) -> Result<()>;

    async fn abandon(&self, session: &SessionHandle, message: &ReceivedMessage) -> Result<()>;

    /// Extend the session lock, returning the new expiry.
    async fn renew_lock(&self, session: &SessionHandle) -> Result<Instant>;

    /// `None` or an empty payload clears the state.
    async fn set_session_state(&self, session: &SessionHandle, state: Option<Bytes>)
    -> Result<()>;

    async fn get_session_state(&self, session: &SessionHandle) -> Result<Option<Bytes>>;

    /// Give up the session lock. Closing an already released handle is a no-op.
    async fn close_session(&self, session: &SessionHandle) -> Result<()>;
}
