// Session acquisition, lock renewal, and release.
//
// Every acquired session gets its own renewal task. The task owns the renewal
// timer and publishes the lease state on a watch channel, so it keeps the lock
// alive independently of message traffic. Dispatchers only observe the channel.
use affinity_broker::{BrokerError, SessionBroker, SessionHandle, SessionSelector};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::policy::{Action, ErrorPolicy, ErrorSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Held { locked_until: Instant },
    Lost,
}

/// When to attempt the next renewal: `margin` before expiry, but never later
/// than halfway through the remaining lease.
pub fn renewal_deadline(locked_until: Instant, now: Instant, margin: Duration) -> Instant {
    let remaining = locked_until.saturating_duration_since(now);
    let halfway = now + remaining / 2;
    match locked_until.checked_sub(margin) {
        Some(by_margin) if by_margin > now => by_margin.min(halfway),
        _ => halfway,
    }
}

// Ids this consumer holds, including sessions whose lease was lost while
// their handlers are still running.
#[derive(Debug, Default)]
struct HeldSet {
    ids: Mutex<HashSet<String>>,
    released: Notify,
}

impl HeldSet {
    fn contains(&self, session_id: &str) -> bool {
        self.ids.lock().contains(session_id)
    }
}

type HeldIds = Arc<HeldSet>;

/// Local claim on a session id, released when the last clone is dropped.
///
/// Settle tasks carry a clone so a session cannot be acquired again while
/// handlers from an earlier lease are still running.
#[derive(Debug)]
pub(crate) struct Claim {
    held: HeldIds,
    session_id: String,
}

impl Claim {
    fn try_new(held: &HeldIds, session_id: &str) -> Option<Self> {
        held.ids.lock().insert(session_id.to_string()).then(|| Self {
            held: Arc::clone(held),
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.held.ids.lock().remove(&self.session_id);
        self.held.released.notify_waiters();
    }
}

/// A session locked by this consumer.
pub struct Session {
    handle: SessionHandle,
    lease: watch::Receiver<LeaseState>,
    renewal: JoinHandle<()>,
    acquired_at: Instant,
    released: AtomicBool,
    broker: Arc<dyn SessionBroker>,
    claim: Arc<Claim>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("lease", &*self.lease.borrow())
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn id(&self) -> &str {
        self.handle.session_id()
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub(crate) fn claim(&self) -> Arc<Claim> {
        Arc::clone(&self.claim)
    }

    pub fn lease(&self) -> watch::Receiver<LeaseState> {
        self.lease.clone()
    }

    /// Current lock expiry, `None` once the lease is lost.
    pub fn locked_until(&self) -> Option<Instant> {
        match *self.lease.borrow() {
            LeaseState::Held { locked_until } => Some(locked_until),
            LeaseState::Lost => None,
        }
    }

    /// False once released, lost, or past the last known expiry.
    pub fn is_held(&self) -> bool {
        !self.released.load(Ordering::Acquire) && lease_is_held(&self.lease)
    }

    /// Resolves when the lease is lost or the lock expires unrenewed.
    pub async fn lease_lost(&self) {
        wait_lease_lost(self.lease.clone()).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.renewal.abort();
        if self.released.load(Ordering::Acquire) {
            return;
        }
        // Dropped without release (a cycle panicked). Give the lock back if we can.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let broker = Arc::clone(&self.broker);
            let handle = self.handle.clone();
            runtime.spawn(async move {
                if let Err(err) = broker.close_session(&handle).await {
                    tracing::debug!(
                        session_id = handle.session_id(),
                        error = %err,
                        "close after drop failed"
                    );
                }
            });
        }
    }
}

pub(crate) fn lease_is_held(lease: &watch::Receiver<LeaseState>) -> bool {
    match *lease.borrow() {
        LeaseState::Held { locked_until } => Instant::now() < locked_until,
        LeaseState::Lost => false,
    }
}

pub(crate) async fn wait_lease_lost(mut lease: watch::Receiver<LeaseState>) {
    loop {
        let state = *lease.borrow_and_update();
        let LeaseState::Held { locked_until } = state else {
            return;
        };
        tokio::select! {
            changed = lease.changed() => {
                if changed.is_err() {
                    // Renewal task is gone; the lock lasts until its last expiry.
                    tokio::time::sleep_until(locked_until).await;
                    return;
                }
            }
            _ = tokio::time::sleep_until(locked_until) => return,
        }
    }
}

pub struct SessionLeaseManager {
    broker: Arc<dyn SessionBroker>,
    queue: Arc<str>,
    session_ids: Option<Vec<String>>,
    renewal_margin: Duration,
    policy: Arc<ErrorPolicy>,
    held: HeldIds,
    cursor: AtomicUsize,
}

impl SessionLeaseManager {
    pub fn new(
        broker: Arc<dyn SessionBroker>,
        queue: &str,
        session_ids: Option<Vec<String>>,
        renewal_margin: Duration,
        policy: Arc<ErrorPolicy>,
    ) -> Self {
        let session_ids = session_ids.map(|ids| {
            let mut seen = HashSet::new();
            ids.into_iter()
                .filter(|id| seen.insert(id.clone()))
                .collect()
        });
        Self {
            broker,
            queue: Arc::from(queue),
            session_ids,
            renewal_margin,
            policy,
            held: HeldIds::default(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Session ids this manager holds, counting ones whose lease was lost
    /// while their handlers are still running.
    pub fn held_count(&self) -> usize {
        self.held.ids.lock().len()
    }

    /// Lock the next available session allowed by the filter.
    ///
    /// `Ok(None)` is the ordinary "nothing available" signal.
    pub async fn acquire_next(&self, timeout: Duration) -> Result<Option<Session>, BrokerError> {
        let accepted = match &self.session_ids {
            None => self.accept_next_available(timeout).await?,
            Some(ids) => self.accept_filtered(ids, timeout).await?,
        };
        let Some((handle, claim)) = accepted else {
            tracing::trace!(queue = %self.queue, "no session available");
            return Ok(None);
        };
        metrics::counter!("affinity_sessions_acquired_total").increment(1);
        tracing::info!(
            queue = %self.queue,
            session_id = handle.session_id(),
            "session acquired"
        );
        Ok(Some(self.track(handle, claim)))
    }

    // The broker can hand back a session whose lease this consumer lost while
    // handlers from that lease are still running. It is returned unprocessed,
    // and the call waits for a local claim to drop or for `timeout`.
    async fn accept_next_available(
        &self,
        timeout: Duration,
    ) -> Result<Option<(SessionHandle, Claim)>, BrokerError> {
        let Some(handle) = self
            .broker
            .accept_session(&self.queue, SessionSelector::NextAvailable, timeout)
            .await?
        else {
            return Ok(None);
        };
        if let Some(claim) = Claim::try_new(&self.held, handle.session_id()) {
            return Ok(Some((handle, claim)));
        }

        let released = self.held.released.notified();
        tokio::pin!(released);
        released.as_mut().enable();
        if let Err(err) = self.broker.close_session(&handle).await {
            tracing::debug!(
                session_id = handle.session_id(),
                error = %err,
                "close of locally draining session failed"
            );
        }
        tracing::debug!(
            session_id = handle.session_id(),
            "session still draining locally, returned to broker"
        );
        if self.held.contains(handle.session_id()) {
            let _ = tokio::time::timeout(timeout, released).await;
        }
        Ok(None)
    }

    // Round-robin over the allowed ids this consumer does not already hold,
    // giving each candidate an equal slice of the timeout.
    async fn accept_filtered(
        &self,
        ids: &[String],
        timeout: Duration,
    ) -> Result<Option<(SessionHandle, Claim)>, BrokerError> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let candidates: Vec<&String> = {
            let held = self.held.ids.lock();
            (0..ids.len())
                .map(|offset| &ids[(start + offset) % ids.len()])
                .filter(|id| !held.contains(id.as_str()))
                .collect()
        };
        if candidates.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }
        let slice = timeout / u32::try_from(candidates.len()).unwrap_or(u32::MAX);
        for id in candidates {
            let Some(claim) = Claim::try_new(&self.held, id) else {
                continue;
            };
            if let Some(handle) = self
                .broker
                .accept_session(&self.queue, SessionSelector::Named(id), slice)
                .await?
            {
                return Ok(Some((handle, claim)));
            }
        }
        Ok(None)
    }

    fn track(&self, handle: SessionHandle, claim: Claim) -> Session {
        let (tx, rx) = watch::channel(LeaseState::Held {
            locked_until: handle.locked_until(),
        });
        let renewal = tokio::spawn(run_renewal(
            Arc::clone(&self.broker),
            handle.clone(),
            self.renewal_margin,
            Arc::clone(&self.policy),
            tx,
        ));
        Session {
            handle,
            lease: rx,
            renewal,
            acquired_at: Instant::now(),
            released: AtomicBool::new(false),
            broker: Arc::clone(&self.broker),
            claim: Arc::new(claim),
        }
    }

    /// Renew once, outside the background task.
    pub async fn renew(&self, session: &Session) -> Result<Instant, BrokerError> {
        self.broker.renew_lock(session.handle()).await
    }

    /// Give the session back to the broker. A second call is a no-op.
    pub async fn release(&self, session: &Session) -> Result<(), BrokerError> {
        if session.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        session.renewal.abort();
        self.broker.close_session(session.handle()).await?;
        tracing::debug!(session_id = session.id(), "session released");
        Ok(())
    }
}

async fn run_renewal(
    broker: Arc<dyn SessionBroker>,
    handle: SessionHandle,
    margin: Duration,
    policy: Arc<ErrorPolicy>,
    lease: watch::Sender<LeaseState>,
) {
    let session_id = handle.session_id();
    let mut locked_until = handle.locked_until();
    loop {
        tokio::time::sleep_until(renewal_deadline(locked_until, Instant::now(), margin)).await;
        let mut attempt = 1;
        loop {
            match broker.renew_lock(&handle).await {
                Ok(until) => {
                    metrics::counter!("affinity_lock_renewals_total", "result" => "ok")
                        .increment(1);
                    tracing::trace!(session_id, "session lock renewed");
                    locked_until = until;
                    lease.send_replace(LeaseState::Held { locked_until });
                    break;
                }
                Err(err) => {
                    metrics::counter!("affinity_lock_renewals_total", "result" => "error")
                        .increment(1);
                    let action =
                        policy.on_broker_error(ErrorSource::Renew, Some(session_id), &err, attempt);
                    match action {
                        Action::Retry(delay) if Instant::now() + delay < locked_until => {
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        _ => {
                            policy.on_lease_lost(session_id, format!("renewal failed: {err}"));
                            lease.send_replace(LeaseState::Lost);
                            return;
                        }
                    }
                }
            }
        }
    }
}
