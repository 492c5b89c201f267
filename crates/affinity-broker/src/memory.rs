// In-process session-aware queue broker.
// Messages live per session in sequence order; a session lock gates receive and
// settlement. Expired locks are reclaimed lazily at the start of every call so
// no background sweeper is needed.
use ahash::RandomState;
use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{
    BrokerError, LockToken, ReceivedMessage, Result, SessionBroker, SessionHandle,
    SessionSelector,
};

const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    // Session lock lifetime granted by accept and by each renewal.
    pub lock_duration: Duration,
    // Deliveries allowed before an abandoned message is dead-lettered.
    pub max_delivery_count: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            lock_duration: DEFAULT_LOCK_DURATION,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub session_id: String,
    pub sequence: u64,
    pub delivery_count: u32,
    pub outcome: SettlementOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub session_id: String,
    pub sequence: u64,
    pub delivery_count: u32,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    body: Bytes,
    delivery_count: u32,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    lock_token: LockToken,
}

#[derive(Debug, Clone, Copy)]
struct SessionLock {
    token: LockToken,
    locked_until: Instant,
}

#[derive(Debug, Default)]
struct SessionEntry {
    available: BTreeMap<u64, StoredMessage>,
    in_flight: BTreeMap<u64, InFlight>,
    lock: Option<SessionLock>,
    state: Option<Bytes>,
}

type SessionMap = HashMap<String, SessionEntry, RandomState>;

impl SessionEntry {
    fn holds(&self, token: LockToken) -> bool {
        self.lock.is_some_and(|lock| lock.token == token)
    }

    fn requeue(
        &mut self,
        session_id: &str,
        message: StoredMessage,
        max_delivery_count: u32,
        dead_letters: &mut Vec<DeadLetter>,
    ) {
        if message.delivery_count >= max_delivery_count {
            tracing::debug!(
                session_id,
                sequence = message.sequence,
                delivery_count = message.delivery_count,
                "message dead-lettered"
            );
            metrics::counter!("affinity_broker_dead_lettered_total").increment(1);
            dead_letters.push(DeadLetter {
                session_id: session_id.to_string(),
                sequence: message.sequence,
                delivery_count: message.delivery_count,
                body: message.body,
            });
        } else {
            self.available.insert(message.sequence, message);
        }
    }

    fn requeue_in_flight(
        &mut self,
        session_id: &str,
        max_delivery_count: u32,
        dead_letters: &mut Vec<DeadLetter>,
    ) {
        let in_flight = std::mem::take(&mut self.in_flight);
        for (_, flight) in in_flight {
            self.requeue(session_id, flight.message, max_delivery_count, dead_letters);
        }
    }

    fn take_in_flight(&mut self, message: &ReceivedMessage) -> Result<InFlight> {
        let lock_lost = || BrokerError::MessageLockLost {
            session_id: message.session_id.to_string(),
            sequence: message.sequence,
        };
        let matches = self
            .in_flight
            .get(&message.sequence)
            .is_some_and(|flight| flight.lock_token == message.lock_token);
        if !matches {
            return Err(lock_lost());
        }
        self.in_flight.remove(&message.sequence).ok_or_else(lock_lost)
    }
}

#[derive(Debug)]
struct QueueInner {
    sessions: SessionMap,
    next_seq: u64,
    dead_letters: Vec<DeadLetter>,
    settlements: Vec<SettlementRecord>,
    peak_locked: usize,
}

fn lease_lost(session: &SessionHandle) -> BrokerError {
    BrokerError::LeaseLost {
        queue: session.queue().to_string(),
        session_id: session.session_id().to_string(),
    }
}

fn held<'a>(sessions: &'a mut SessionMap, session: &SessionHandle) -> Result<&'a mut SessionEntry> {
    match sessions.get_mut(session.session_id()) {
        Some(entry) if entry.holds(session.lock_token()) => Ok(entry),
        _ => Err(lease_lost(session)),
    }
}

impl QueueInner {
    fn new() -> Self {
        Self {
            sessions: HashMap::with_hasher(RandomState::new()),
            next_seq: 0,
            dead_letters: Vec::new(),
            settlements: Vec::new(),
            peak_locked: 0,
        }
    }

    // Drop expired locks and hand their unsettled messages back to the session.
    fn reclaim_expired(&mut self, now: Instant, max_delivery_count: u32) {
        for (session_id, entry) in self.sessions.iter_mut() {
            let expired = entry.lock.is_some_and(|lock| now >= lock.locked_until);
            if expired {
                tracing::debug!(session_id = %session_id, "session lock expired");
                entry.lock = None;
                entry.requeue_in_flight(session_id, max_delivery_count, &mut self.dead_letters);
            }
        }
    }

    fn enqueue(&mut self, session_id: &str, body: Bytes, now: Instant) -> u64 {
        let sequence = self.next_seq;
        self.next_seq += 1;
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .available
            .insert(
                sequence,
                StoredMessage {
                    sequence,
                    body,
                    delivery_count: 0,
                    enqueued_at: now,
                },
            );
        sequence
    }

    // Oldest unlocked session with pending messages.
    fn next_available(&self) -> Option<String> {
        self.sessions
            .iter()
            .filter(|(_, entry)| entry.lock.is_none())
            .filter_map(|(id, entry)| entry.available.keys().next().map(|seq| (*seq, id)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, id)| id.clone())
    }

    // Named sessions can be accepted even when empty.
    fn unlocked_named(&mut self, session_id: &str) -> Option<String> {
        let entry = self.sessions.entry(session_id.to_string()).or_default();
        entry.lock.is_none().then(|| session_id.to_string())
    }

    fn next_lock_expiry(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|entry| entry.lock.map(|lock| lock.locked_until))
            .min()
    }

    fn locked_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|entry| entry.lock.is_some())
            .count()
    }

    fn lock(
        &mut self,
        queue: &Arc<str>,
        session_id: String,
        lock_duration: Duration,
        now: Instant,
    ) -> SessionHandle {
        let token = LockToken::new();
        let locked_until = now + lock_duration;
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.lock = Some(SessionLock {
                token,
                locked_until,
            });
        }
        self.peak_locked = self.peak_locked.max(self.locked_count());
        SessionHandle::new(Arc::clone(queue), session_id, token, locked_until)
    }

    fn deliver(
        &mut self,
        session: &SessionHandle,
    ) -> Result<std::result::Result<ReceivedMessage, Instant>> {
        let entry = held(&mut self.sessions, session)?;
        let Some((sequence, mut message)) = entry.available.pop_first() else {
            let locked_until = entry
                .lock
                .map(|lock| lock.locked_until)
                .ok_or_else(|| lease_lost(session))?;
            return Ok(Err(locked_until));
        };
        message.delivery_count += 1;
        let lock_token = LockToken::new();
        let received = ReceivedMessage {
            session_id: Arc::from(session.session_id()),
            sequence,
            delivery_count: message.delivery_count,
            lock_token,
            enqueued_at: message.enqueued_at,
            body: message.body.clone(),
        };
        entry
            .in_flight
            .insert(sequence, InFlight { message, lock_token });
        Ok(Ok(received))
    }

    fn settle(
        &mut self,
        session: &SessionHandle,
        message: &ReceivedMessage,
        outcome: SettlementOutcome,
        max_delivery_count: u32,
    ) -> Result<()> {
        let entry = held(&mut self.sessions, session)?;
        let flight = entry.take_in_flight(message)?;
        let delivery_count = flight.message.delivery_count;
        if outcome == SettlementOutcome::Abandoned {
            entry.requeue(
                session.session_id(),
                flight.message,
                max_delivery_count,
                &mut self.dead_letters,
            );
        }
        self.settlements.push(SettlementRecord {
            session_id: session.session_id().to_string(),
            sequence: message.sequence,
            delivery_count,
            outcome,
        });
        Ok(())
    }

    // Returns true when the lock was actually released.
    fn release(&mut self, session: &SessionHandle, max_delivery_count: u32) -> bool {
        let Some(entry) = self.sessions.get_mut(session.session_id()) else {
            return false;
        };
        if !entry.holds(session.lock_token()) {
            return false;
        }
        entry.lock = None;
        entry.requeue_in_flight(
            session.session_id(),
            max_delivery_count,
            &mut self.dead_letters,
        );
        true
    }
}

#[derive(Debug)]
struct QueueState {
    name: Arc<str>,
    options: QueueOptions,
    inner: Mutex<QueueInner>,
    // Woken whenever messages or locks become available.
    changed: Notify,
}

impl QueueState {
    fn lock_reclaimed(&self) -> parking_lot::MutexGuard<'_, QueueInner> {
        let mut inner = self.inner.lock();
        inner.reclaim_expired(Instant::now(), self.options.max_delivery_count);
        inner
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    withheld_renewals: HashSet<String, RandomState>,
    transient_receive_failures: usize,
    complete_failures: usize,
}

/// In-process broker for session-tagged queues.
///
/// ```
/// use affinity_broker::{InMemoryBroker, QueueOptions, SessionBroker, SessionSelector};
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let broker = InMemoryBroker::new();
/// broker.create_queue("payments", QueueOptions::default());
/// broker
///     .send("payments", "session-1", Bytes::from_static(b"hello"))
///     .expect("send");
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let session = broker
///         .accept_session("payments", SessionSelector::NextAvailable, Duration::from_secs(1))
///         .await
///         .expect("accept")
///         .expect("session");
///     let message = broker
///         .receive(&session, Duration::from_secs(1))
///         .await
///         .expect("receive")
///         .expect("message");
///     assert_eq!(message.body, Bytes::from_static(b"hello"));
///     broker.complete(&session, &message).await.expect("complete");
///     broker.close_session(&session).await.expect("close");
/// });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, Arc<QueueState>, RandomState>>,
    faults: Mutex<FaultPlan>,
    receive_calls: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue. Returns false if it already existed (options unchanged).
    pub fn create_queue(&self, name: &str, options: QueueOptions) -> bool {
        let mut queues = self.queues.write();
        if queues.contains_key(name) {
            return false;
        }
        queues.insert(
            name.to_string(),
            Arc::new(QueueState {
                name: Arc::from(name),
                options,
                inner: Mutex::new(QueueInner::new()),
                changed: Notify::new(),
            }),
        );
        true
    }

    fn queue(&self, name: &str) -> Result<Arc<QueueState>> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    /// Enqueue one message on a session; returns its sequence number.
    pub fn send(&self, queue: &str, session_id: &str, body: Bytes) -> Result<u64> {
        let sequences = self.send_batch(queue, session_id, std::slice::from_ref(&body))?;
        sequences
            .first()
            .copied()
            .ok_or_else(|| BrokerError::Transient("empty send batch".to_string()))
    }

    pub fn send_batch(&self, queue: &str, session_id: &str, bodies: &[Bytes]) -> Result<Vec<u64>> {
        let state = self.queue(queue)?;
        let now = Instant::now();
        let sequences = {
            let mut inner = state.inner.lock();
            bodies
                .iter()
                .map(|body| inner.enqueue(session_id, body.clone(), now))
                .collect::<Vec<_>>()
        };
        metrics::counter!("affinity_broker_sent_total").increment(bodies.len() as u64);
        state.changed.notify_waiters();
        Ok(sequences)
    }

    pub fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        Ok(self.queue(queue)?.inner.lock().dead_letters.clone())
    }

    /// Settlements in the order the broker accepted them.
    pub fn settlements(&self, queue: &str) -> Result<Vec<SettlementRecord>> {
        Ok(self.queue(queue)?.inner.lock().settlements.clone())
    }

    /// Messages not yet completed or dead-lettered (available plus in flight).
    pub fn pending_messages(&self, queue: &str, session_id: &str) -> Result<usize> {
        let state = self.queue(queue)?;
        let inner = state.lock_reclaimed();
        Ok(inner
            .sessions
            .get(session_id)
            .map(|entry| entry.available.len() + entry.in_flight.len())
            .unwrap_or(0))
    }

    /// Stored session state, read without taking the session lock.
    pub fn session_state(&self, queue: &str, session_id: &str) -> Result<Option<Bytes>> {
        let state = self.queue(queue)?;
        let inner = state.inner.lock();
        Ok(inner
            .sessions
            .get(session_id)
            .and_then(|entry| entry.state.clone()))
    }

    pub fn is_locked(&self, queue: &str, session_id: &str) -> Result<bool> {
        let state = self.queue(queue)?;
        let inner = state.lock_reclaimed();
        Ok(inner
            .sessions
            .get(session_id)
            .is_some_and(|entry| entry.lock.is_some()))
    }

    /// Highest number of simultaneously locked sessions seen on the queue.
    pub fn peak_locked_sessions(&self, queue: &str) -> Result<usize> {
        Ok(self.queue(queue)?.inner.lock().peak_locked)
    }

    pub fn receive_calls(&self) -> u64 {
        self.receive_calls.load(Ordering::Relaxed)
    }

    /// Make every renewal of `session_id` fail transiently until restored.
    pub fn withhold_renewals(&self, session_id: &str) {
        self.faults
            .lock()
            .withheld_renewals
            .insert(session_id.to_string());
    }

    pub fn restore_renewals(&self, session_id: &str) {
        self.faults.lock().withheld_renewals.remove(session_id);
    }

    /// Fail the next `count` receive calls with a transient error.
    pub fn inject_transient_receive_failures(&self, count: usize) {
        self.faults.lock().transient_receive_failures = count;
    }

    /// Fail the next `count` complete calls with `SessionUnavailable`. The
    /// message stays in flight under the session lock.
    pub fn inject_complete_failures(&self, count: usize) {
        self.faults.lock().complete_failures = count;
    }

    /// Force the current lock on a session to expire now.
    pub fn expire_lock(&self, queue: &str, session_id: &str) -> Result<()> {
        let state = self.queue(queue)?;
        {
            let mut inner = state.inner.lock();
            if let Some(lock) = inner
                .sessions
                .get_mut(session_id)
                .and_then(|entry| entry.lock.as_mut())
            {
                lock.locked_until = Instant::now();
            }
            inner.reclaim_expired(Instant::now(), state.options.max_delivery_count);
        }
        state.changed.notify_waiters();
        Ok(())
    }

    fn take_complete_fault(&self) -> bool {
        let mut faults = self.faults.lock();
        if faults.complete_failures > 0 {
            faults.complete_failures -= 1;
            return true;
        }
        false
    }

    fn take_receive_fault(&self) -> bool {
        let mut faults = self.faults.lock();
        if faults.transient_receive_failures > 0 {
            faults.transient_receive_failures -= 1;
            return true;
        }
        false
    }
}

#[async_trait]
impl SessionBroker for InMemoryBroker {
    async fn accept_session(
        &self,
        queue: &str,
        selector: SessionSelector<'_>,
        timeout: Duration,
    ) -> Result<Option<SessionHandle>> {
        let state = self.queue(queue)?;
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before inspecting so a concurrent send is not missed.
            let notified = state.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let now = Instant::now();
                let mut inner = state.inner.lock();
                inner.reclaim_expired(now, state.options.max_delivery_count);
                let candidate = match selector {
                    SessionSelector::NextAvailable => inner.next_available(),
                    SessionSelector::Named(session_id) => inner.unlocked_named(session_id),
                };
                if let Some(session_id) = candidate {
                    let handle =
                        inner.lock(&state.name, session_id, state.options.lock_duration, now);
                    tracing::debug!(
                        queue = %state.name,
                        session_id = handle.session_id(),
                        "session accepted"
                    );
                    return Ok(Some(handle));
                }
                inner
                    .next_lock_expiry()
                    .map_or(deadline, |expiry| expiry.min(deadline))
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn receive(
        &self,
        session: &SessionHandle,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>> {
        self.receive_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.queue(session.queue())?;
        if self.take_receive_fault() {
            return Err(BrokerError::Transient("injected receive failure".to_string()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = state.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut inner = state.lock_reclaimed();
                match inner.deliver(session)? {
                    Ok(message) => return Ok(Some(message)),
                    // Wake at lock expiry too so a lost lease surfaces promptly.
                    Err(locked_until) => locked_until.min(deadline),
                }
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, session: &SessionHandle, message: &ReceivedMessage) -> Result<()> {
        let state = self.queue(session.queue())?;
        if self.take_complete_fault() {
            return Err(BrokerError::SessionUnavailable {
                session_id: session.session_id().to_string(),
                reason: "injected complete failure".to_string(),
            });
        }
        let mut inner = state.lock_reclaimed();
        inner.settle(
            session,
            message,
            SettlementOutcome::Completed,
            state.options.max_delivery_count,
        )
    }

    async fn abandon(&self, session: &SessionHandle, message: &ReceivedMessage) -> Result<()> {
        let state = self.queue(session.queue())?;
        {
            let mut inner = state.lock_reclaimed();
            inner.settle(
                session,
                message,
                SettlementOutcome::Abandoned,
                state.options.max_delivery_count,
            )?;
        }
        state.changed.notify_waiters();
        Ok(())
    }

    async fn renew_lock(&self, session: &SessionHandle) -> Result<Instant> {
        if self
            .faults
            .lock()
            .withheld_renewals
            .contains(session.session_id())
        {
            return Err(BrokerError::Transient("lock renewal withheld".to_string()));
        }
        let state = self.queue(session.queue())?;
        let mut inner = state.lock_reclaimed();
        let entry = held(&mut inner.sessions, session)?;
        let lock = entry.lock.as_mut().ok_or_else(|| lease_lost(session))?;
        lock.locked_until = Instant::now() + state.options.lock_duration;
        Ok(lock.locked_until)
    }

    async fn set_session_state(
        &self,
        session: &SessionHandle,
        state_blob: Option<Bytes>,
    ) -> Result<()> {
        let state = self.queue(session.queue())?;
        let mut inner = state.lock_reclaimed();
        let entry = held(&mut inner.sessions, session)?;
        entry.state = state_blob.filter(|blob| !blob.is_empty());
        Ok(())
    }

    async fn get_session_state(&self, session: &SessionHandle) -> Result<Option<Bytes>> {
        let state = self.queue(session.queue())?;
        let mut inner = state.lock_reclaimed();
        let entry = held(&mut inner.sessions, session)?;
        Ok(entry.state.clone())
    }

    async fn close_session(&self, session: &SessionHandle) -> Result<()> {
        let state = self.queue(session.queue())?;
        let released = state
            .lock_reclaimed()
            .release(session, state.options.max_delivery_count);
        if released {
            tracing::debug!(
                queue = %state.name,
                session_id = session.session_id(),
                "session closed"
            );
            state.changed.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE: &str = "payments";

    fn broker_with(options: QueueOptions) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        assert!(broker.create_queue(QUEUE, options));
        broker
    }

    async fn accept_next(broker: &InMemoryBroker) -> SessionHandle {
        broker
            .accept_session(QUEUE, SessionSelector::NextAvailable, Duration::from_secs(1))
            .await
            .expect("accept")
            .expect("session")
    }

    #[test]
    fn create_queue_is_idempotent() {
        let broker = broker_with(QueueOptions::default());
        assert!(!broker.create_queue(QUEUE, QueueOptions::default()));
    }

    #[test]
    fn send_to_missing_queue_errors() {
        let broker = InMemoryBroker::new();
        let err = broker
            .send("missing", "s1", Bytes::from_static(b"x"))
            .expect_err("queue");
        assert!(matches!(err, BrokerError::QueueNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_returns_none_when_queue_is_empty() {
        let broker = broker_with(QueueOptions::default());
        let accepted = broker
            .accept_session(
                QUEUE,
                SessionSelector::NextAvailable,
                Duration::from_millis(200),
            )
            .await
            .expect("accept");
        assert!(accepted.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_wakes_when_message_arrives() {
        let broker = Arc::new(broker_with(QueueOptions::default()));
        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .accept_session(QUEUE, SessionSelector::NextAvailable, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        broker
            .send(QUEUE, "late", Bytes::from_static(b"x"))
            .expect("send");
        let handle = waiter.await.expect("join").expect("accept").expect("session");
        assert_eq!(handle.session_id(), "late");
    }

    #[tokio::test]
    async fn locked_session_is_not_offered_twice() {
        let broker = broker_with(QueueOptions::default());
        broker.send(QUEUE, "a", Bytes::from_static(b"1")).expect("send");
        let _held = accept_next(&broker).await;
        let second = broker
            .accept_session(QUEUE, SessionSelector::NextAvailable, Duration::ZERO)
            .await
            .expect("accept");
        assert!(second.is_none());
        assert_eq!(broker.peak_locked_sessions(QUEUE).expect("peak"), 1);
    }

    #[tokio::test]
    async fn next_available_prefers_oldest_session() {
        let broker = broker_with(QueueOptions::default());
        broker.send(QUEUE, "b", Bytes::from_static(b"1")).expect("send");
        broker.send(QUEUE, "a", Bytes::from_static(b"2")).expect("send");
        let first = accept_next(&broker).await;
        assert_eq!(first.session_id(), "b");
        let second = accept_next(&broker).await;
        assert_eq!(second.session_id(), "a");
    }

    #[tokio::test]
    async fn named_accept_locks_empty_session() {
        let broker = broker_with(QueueOptions::default());
        let handle = broker
            .accept_session(QUEUE, SessionSelector::Named("quiet"), Duration::ZERO)
            .await
            .expect("accept")
            .expect("session");
        assert_eq!(handle.session_id(), "quiet");
        assert!(broker.is_locked(QUEUE, "quiet").expect("locked"));
    }

    #[tokio::test]
    async fn receive_is_in_sequence_order() {
        let broker = broker_with(QueueOptions::default());
        for body in ["one", "two", "three"] {
            broker
                .send(QUEUE, "s1", Bytes::from(body.as_bytes().to_vec()))
                .expect("send");
        }
        let session = accept_next(&broker).await;
        let mut last = None;
        for expected in ["one", "two", "three"] {
            let message = broker
                .receive(&session, Duration::ZERO)
                .await
                .expect("receive")
                .expect("message");
            assert_eq!(message.body, Bytes::from(expected.as_bytes().to_vec()));
            assert_eq!(message.delivery_count, 1);
            if let Some(last) = last {
                assert!(message.sequence > last);
            }
            last = Some(message.sequence);
        }
    }

    #[tokio::test]
    async fn abandon_redelivers_then_dead_letters() {
        let broker = broker_with(QueueOptions {
            max_delivery_count: 3,
            ..QueueOptions::default()
        });
        broker
            .send(QUEUE, "s1", Bytes::from_static(b"poison"))
            .expect("send");
        let session = accept_next(&broker).await;
        for attempt in 1..=3 {
            let message = broker
                .receive(&session, Duration::ZERO)
                .await
                .expect("receive")
                .expect("message");
            assert_eq!(message.delivery_count, attempt);
            broker.abandon(&session, &message).await.expect("abandon");
        }
        let again = broker
            .receive(&session, Duration::ZERO)
            .await
            .expect("receive");
        assert!(again.is_none());
        let dead = broker.dead_letters(QUEUE).expect("dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].delivery_count, 3);
        assert_eq!(broker.pending_messages(QUEUE, "s1").expect("pending"), 0);
    }

    #[tokio::test]
    async fn settlement_with_stale_message_token_fails() {
        let broker = broker_with(QueueOptions::default());
        broker.send(QUEUE, "s1", Bytes::from_static(b"x")).expect("send");
        let session = accept_next(&broker).await;
        let message = broker
            .receive(&session, Duration::ZERO)
            .await
            .expect("receive")
            .expect("message");
        broker.complete(&session, &message).await.expect("complete");
        let err = broker
            .complete(&session, &message)
            .await
            .expect_err("second complete");
        assert!(matches!(err, BrokerError::MessageLockLost { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_is_lease_lost_and_requeues_in_flight() {
        let broker = broker_with(QueueOptions {
            lock_duration: Duration::from_millis(500),
            ..QueueOptions::default()
        });
        broker.send(QUEUE, "s1", Bytes::from_static(b"x")).expect("send");
        let session = accept_next(&broker).await;
        let message = broker
            .receive(&session, Duration::ZERO)
            .await
            .expect("receive")
            .expect("message");
        tokio::time::sleep(Duration::from_millis(600)).await;

        let err = broker
            .complete(&session, &message)
            .await
            .expect_err("expired");
        assert!(matches!(err, BrokerError::LeaseLost { .. }));
        assert!(!broker.is_locked(QUEUE, "s1").expect("locked"));

        let next = accept_next(&broker).await;
        let redelivered = broker
            .receive(&next, Duration::ZERO)
            .await
            .expect("receive")
            .expect("message");
        assert_eq!(redelivered.sequence, message.sequence);
        assert_eq!(redelivered.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_lock() {
        let broker = broker_with(QueueOptions {
            lock_duration: Duration::from_millis(500),
            ..QueueOptions::default()
        });
        broker.send(QUEUE, "s1", Bytes::from_static(b"x")).expect("send");
        let session = accept_next(&broker).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let until = broker.renew_lock(&session).await.expect("renew");
        assert!(until > session.locked_until());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(broker.is_locked(QUEUE, "s1").expect("locked"));
    }

    #[tokio::test]
    async fn withheld_renewals_fail_transiently() {
        let broker = broker_with(QueueOptions::default());
        broker.send(QUEUE, "s1", Bytes::from_static(b"x")).expect("send");
        let session = accept_next(&broker).await;
        broker.withhold_renewals("s1");
        let err = broker.renew_lock(&session).await.expect_err("withheld");
        assert!(err.is_transient());
        broker.restore_renewals("s1");
        broker.renew_lock(&session).await.expect("renew");
    }

    #[tokio::test]
    async fn injected_receive_failures_are_consumed() {
        let broker = broker_with(QueueOptions::default());
        broker.send(QUEUE, "s1", Bytes::from_static(b"x")).expect("send");
        let session = accept_next(&broker).await;
        broker.inject_transient_receive_failures(1);
        let err = broker
            .receive(&session, Duration::ZERO)
            .await
            .expect_err("fault");
        assert!(err.is_transient());
        assert!(
            broker
                .receive(&session, Duration::ZERO)
                .await
                .expect("receive")
                .is_some()
        );
        assert_eq!(broker.receive_calls(), 2);
    }

    #[tokio::test]
    async fn injected_complete_failure_leaves_message_in_flight() {
        let broker = broker_with(QueueOptions::default());
        broker.send(QUEUE, "s1", Bytes::from_static(b"x")).expect("send");
        let session = accept_next(&broker).await;
        let message = broker
            .receive(&session, Duration::ZERO)
            .await
            .expect("receive")
            .expect("message");
        broker.inject_complete_failures(1);
        let err = broker
            .complete(&session, &message)
            .await
            .expect_err("fault");
        assert!(matches!(err, BrokerError::SessionUnavailable { .. }));
        assert_eq!(broker.pending_messages(QUEUE, "s1").expect("pending"), 1);
        broker.complete(&session, &message).await.expect("complete");
        assert_eq!(broker.pending_messages(QUEUE, "s1").expect("pending"), 0);
    }

    #[tokio::test]
    async fn expired_lock_requeues_in_flight_and_refuses_renewal() {
        let broker = broker_with(QueueOptions::default());
        broker.send(QUEUE, "s1", Bytes::from_static(b"x")).expect("send");
        let session = accept_next(&broker).await;
        let message = broker
            .receive(&session, Duration::ZERO)
            .await
            .expect("receive")
            .expect("message");
        broker.expire_lock(QUEUE, "s1").expect("expire");
        assert!(!broker.is_locked(QUEUE, "s1").expect("locked"));
        assert!(broker.renew_lock(&session).await.expect_err("expired").is_lock_lost());
        assert!(broker.complete(&session, &message).await.is_err());

        let again = accept_next(&broker).await;
        let redelivered = broker
            .receive(&again, Duration::ZERO)
            .await
            .expect("receive")
            .expect("message");
        assert_eq!(redelivered.sequence, message.sequence);
        assert_eq!(redelivered.delivery_count, 2);
    }

    #[tokio::test]
    async fn session_state_round_trip_and_clear() {
        let broker = broker_with(QueueOptions::default());
        let session = broker
            .accept_session(QUEUE, SessionSelector::Named("s1"), Duration::ZERO)
            .await
            .expect("accept")
            .expect("session");
        broker
            .set_session_state(&session, Some(Bytes::from_static(b"seed")))
            .await
            .expect("set");
        assert_eq!(
            broker.get_session_state(&session).await.expect("get"),
            Some(Bytes::from_static(b"seed"))
        );
        broker
            .set_session_state(&session, Some(Bytes::new()))
            .await
            .expect("clear");
        assert_eq!(broker.get_session_state(&session).await.expect("get"), None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_returns_in_flight() {
        let broker = broker_with(QueueOptions::default());
        broker.send(QUEUE, "s1", Bytes::from_static(b"x")).expect("send");
        let session = accept_next(&broker).await;
        let _message = broker
            .receive(&session, Duration::ZERO)
            .await
            .expect("receive")
            .expect("message");
        broker.close_session(&session).await.expect("close");
        broker.close_session(&session).await.expect("close again");
        assert!(!broker.is_locked(QUEUE, "s1").expect("locked"));
        assert_eq!(broker.pending_messages(QUEUE, "s1").expect("pending"), 1);

        let err = broker
            .receive(&session, Duration::ZERO)
            .await
            .expect_err("closed handle");
        assert!(matches!(err, BrokerError::LeaseLost { .. }));
    }
}
