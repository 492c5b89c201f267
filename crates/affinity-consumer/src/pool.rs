// Session worker pool: one pipeline per slot, each cycling
// acquire -> initializing -> dispatch -> closing -> release.
//
// A cycle runs under `catch_unwind` so a panicking hook or pipeline bug only
// costs that cycle; the pipeline reports it and goes back to acquiring.
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::task::JoinHandle;

use crate::config::SessionProcessorOptions;
use crate::dispatcher::{DispatchExit, MessageDispatcher};
use crate::engine::Shutdown;
use crate::lease::SessionLeaseManager;
use crate::policy::{Action, ErrorPolicy, ErrorSource, panic_message};
use crate::state::{SessionContext, SessionLifecycle, SessionStateStore};

/// One unit of session concurrency.
#[derive(Debug)]
pub struct WorkerSlot {
    index: usize,
    session_id: Mutex<Option<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl WorkerSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            session_id: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Session currently owned by this slot.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Handler calls currently running for the owned session.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn assign(&self, session_id: Option<&str>) {
        *self.session_id.lock() = session_id.map(str::to_string);
    }

    pub(crate) fn begin_call(self: &Arc<Self>) -> CallGuard {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        CallGuard {
            slot: Arc::clone(self),
        }
    }
}

pub(crate) struct CallGuard {
    slot: Arc<WorkerSlot>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
pub struct PoolStats {
    held: AtomicUsize,
    peak_held: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub held_sessions: usize,
    pub peak_held_sessions: usize,
    pub sessions_acquired: u64,
    pub sessions_released: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            held_sessions: self.held.load(Ordering::Acquire),
            peak_held_sessions: self.peak_held.load(Ordering::Acquire),
            sessions_acquired: self.acquired.load(Ordering::Acquire),
            sessions_released: self.released.load(Ordering::Acquire),
        }
    }

    fn hold(self: &Arc<Self>) -> HeldGuard {
        let held = self.held.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_held.fetch_max(held, Ordering::AcqRel);
        self.acquired.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("affinity_sessions_held").set(held as f64);
        HeldGuard {
            stats: Arc::clone(self),
        }
    }
}

struct HeldGuard {
    stats: Arc<PoolStats>,
}

impl Drop for HeldGuard {
    fn drop(&mut self) {
        let held = self.stats.held.fetch_sub(1, Ordering::AcqRel) - 1;
        self.stats.released.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("affinity_sessions_held").set(held as f64);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Processed(DispatchExit),
    NoSession,
    AcceptFailed(Action),
}

pub struct SessionWorkerPool {
    options: SessionProcessorOptions,
    leases: SessionLeaseManager,
    store: SessionStateStore,
    dispatcher: MessageDispatcher,
    lifecycle: Arc<dyn SessionLifecycle>,
    policy: Arc<ErrorPolicy>,
    stats: Arc<PoolStats>,
    slots: Vec<Arc<WorkerSlot>>,
}

impl SessionWorkerPool {
    pub fn new(
        options: SessionProcessorOptions,
        leases: SessionLeaseManager,
        store: SessionStateStore,
        dispatcher: MessageDispatcher,
        lifecycle: Arc<dyn SessionLifecycle>,
        policy: Arc<ErrorPolicy>,
    ) -> Self {
        let slots = (0..options.max_concurrent_sessions)
            .map(|index| Arc::new(WorkerSlot::new(index)))
            .collect();
        Self {
            options,
            leases,
            store,
            dispatcher,
            lifecycle,
            policy,
            stats: Arc::new(PoolStats::default()),
            slots,
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    pub fn slots(&self) -> &[Arc<WorkerSlot>] {
        &self.slots
    }

    /// Spawn one pipeline per slot.
    pub fn start(self: Arc<Self>, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        tracing::info!(
            queue = self.leases.queue(),
            max_concurrent_sessions = self.options.max_concurrent_sessions,
            max_concurrent_calls_per_session = self.options.max_concurrent_calls_per_session,
            "starting session pipelines"
        );
        self.slots
            .iter()
            .map(|slot| {
                tokio::spawn(Arc::clone(&self).run_pipeline(Arc::clone(slot), shutdown.clone()))
            })
            .collect()
    }

    async fn run_pipeline(self: Arc<Self>, slot: Arc<WorkerSlot>, shutdown: Shutdown) {
        let mut failures: u32 = 0;
        while !shutdown.is_cancelled() {
            let cycle = AssertUnwindSafe(self.run_cycle(&slot, &shutdown))
                .catch_unwind()
                .await;
            let delay = match cycle {
                Ok(CycleOutcome::Processed(DispatchExit::SessionFault)) => {
                    // Back off so a session that keeps faulting is not re-acquired hot.
                    failures = failures.saturating_add(1);
                    Some(self.policy.retry().backoff(failures))
                }
                Ok(CycleOutcome::Processed(_)) | Ok(CycleOutcome::NoSession) => {
                    failures = 0;
                    None
                }
                Ok(CycleOutcome::AcceptFailed(action)) => {
                    failures = failures.saturating_add(1);
                    Some(match action {
                        Action::Retry(delay) => delay,
                        Action::AbandonMessage | Action::CloseSession => {
                            self.policy.retry().backoff(failures)
                        }
                    })
                }
                Err(panic) => {
                    slot.assign(None);
                    failures = failures.saturating_add(1);
                    self.policy.on_session_failure(
                        ErrorSource::Pipeline,
                        None,
                        format!("session cycle panicked: {}", panic_message(panic.as_ref())),
                    );
                    Some(self.policy.retry().backoff(failures))
                }
            };
            if let Some(delay) = delay {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        tracing::debug!(slot = slot.index(), "session pipeline stopped");
    }

    async fn run_cycle(&self, slot: &Arc<WorkerSlot>, shutdown: &Shutdown) -> CycleOutcome {
        let acquired = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return CycleOutcome::NoSession,
            acquired = self.leases.acquire_next(self.options.accept_timeout) => acquired,
        };
        let session = match acquired {
            Ok(Some(session)) => session,
            Ok(None) => return CycleOutcome::NoSession,
            Err(err) => {
                let action = self
                    .policy
                    .on_broker_error(ErrorSource::Accept, None, &err, 1);
                return CycleOutcome::AcceptFailed(action);
            }
        };

        let _held = self.stats.hold();
        slot.assign(Some(session.id()));
        let ctx = SessionContext::new(&session, self.store.clone());

        let exit = match self.lifecycle.initializing(&ctx).await {
            Ok(()) => self.dispatcher.run(&session, &ctx, slot, shutdown).await,
            Err(err) => {
                self.policy.on_session_failure(
                    ErrorSource::Initializing,
                    Some(session.id()),
                    format!("{err:#}"),
                );
                DispatchExit::SessionFault
            }
        };

        if exit.is_voluntary()
            && session.is_held()
            && let Err(err) = self.lifecycle.closing(&ctx).await
        {
            self.policy.on_session_failure(
                ErrorSource::Closing,
                Some(session.id()),
                format!("{err:#}"),
            );
        }

        if let Err(err) = self.leases.release(&session).await {
            self.policy.on_session_failure(
                ErrorSource::Release,
                Some(session.id()),
                err.to_string(),
            );
        }
        metrics::counter!("affinity_sessions_released_total", "reason" => exit.as_str())
            .increment(1);
        tracing::info!(
            session_id = session.id(),
            reason = exit.as_str(),
            "session released"
        );
        slot.assign(None);
        CycleOutcome::Processed(exit)
    }
}
