// Receive/handle/settle loop for one acquired session.
//
// Receives are strictly sequential, so messages are received in sequence order.
// Each received message runs in its own settle task that owns a call permit;
// with more than one permit per session, completions and abandons can reach
// the broker out of receive order. A limit of 1 keeps them in order.
use affinity_broker::{BrokerError, ReceivedMessage, SessionBroker};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use crate::engine::Shutdown;
use crate::handler::{MessageHandler, Settlement};
use crate::lease::{Claim, Session};
use crate::policy::{ErrorPolicy, ErrorSource, panic_message};
use crate::pool::WorkerSlot;
use crate::state::SessionContext;

/// Why a dispatcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    IdleTimeout,
    LeaseLost,
    Cancelled,
    SessionFault,
}

impl DispatchExit {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchExit::IdleTimeout => "idle_timeout",
            DispatchExit::LeaseLost => "lease_lost",
            DispatchExit::Cancelled => "cancelled",
            DispatchExit::SessionFault => "session_fault",
        }
    }

    /// The session is given back voluntarily and the closing hook applies.
    pub fn is_voluntary(self) -> bool {
        matches!(self, DispatchExit::IdleTimeout | DispatchExit::Cancelled)
    }
}

#[derive(Debug)]
enum SettleOutcome {
    Settled,
    // Lease was already gone; the message counts as abandoned.
    Orphaned,
    // The session faulted while the handler ran; the message was abandoned.
    Aborted,
    Failed { lock_lost: bool },
}

#[derive(Clone)]
pub struct MessageDispatcher {
    broker: Arc<dyn SessionBroker>,
    handler: Arc<dyn MessageHandler>,
    policy: Arc<ErrorPolicy>,
    max_calls: usize,
    idle_timeout: Duration,
    receive_wait: Duration,
}

impl MessageDispatcher {
    pub fn new(
        broker: Arc<dyn SessionBroker>,
        handler: Arc<dyn MessageHandler>,
        policy: Arc<ErrorPolicy>,
        max_calls: usize,
        idle_timeout: Duration,
        receive_wait: Duration,
    ) -> Self {
        Self {
            broker,
            handler,
            policy,
            max_calls: max_calls.max(1),
            idle_timeout,
            receive_wait,
        }
    }

    /// Dispatch until idle timeout, lease loss, a session fault, or shutdown.
    ///
    /// On idle timeout and cancellation the in-flight handlers are drained
    /// and settled before returning. On a session fault they are drained and
    /// their messages abandoned. On lease loss they are left to finish on
    /// their own, holding the session's local claim, and their settlement is
    /// best-effort.
    pub async fn run(
        &self,
        session: &Session,
        ctx: &SessionContext,
        slot: &Arc<WorkerSlot>,
        shutdown: &Shutdown,
    ) -> DispatchExit {
        let permits = Arc::new(Semaphore::new(self.max_calls));
        let mut settles: JoinSet<SettleOutcome> = JoinSet::new();
        let faulted = Arc::new(AtomicBool::new(false));
        let mut last_activity = Instant::now();

        let exit = loop {
            if shutdown.is_cancelled() {
                break DispatchExit::Cancelled;
            }
            if !session.is_held() {
                break DispatchExit::LeaseLost;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break DispatchExit::Cancelled,
                _ = session.lease_lost() => break DispatchExit::LeaseLost,
                Some(joined) = settles.join_next() => {
                    last_activity = Instant::now();
                    if let Some(exit) = self.settled(session.id(), joined) {
                        break exit;
                    }
                    continue;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break DispatchExit::SessionFault,
                },
            };

            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break DispatchExit::Cancelled,
                _ = session.lease_lost() => break DispatchExit::LeaseLost,
                received = self.receive(session) => received,
            };

            match received {
                Ok(Some(message)) => {
                    last_activity = Instant::now();
                    metrics::counter!("affinity_messages_received_total").increment(1);
                    tracing::debug!(
                        session_id = session.id(),
                        sequence = message.sequence,
                        delivery_count = message.delivery_count,
                        "message received"
                    );
                    settles.spawn(settle(
                        Arc::clone(&self.broker),
                        Arc::clone(&self.handler),
                        Arc::clone(&self.policy),
                        ctx.clone(),
                        message,
                        SettleGuards {
                            _permit: permit,
                            _claim: session.claim(),
                            slot: Arc::clone(slot),
                            faulted: Arc::clone(&faulted),
                        },
                    ));
                }
                Ok(None) => {
                    drop(permit);
                    if settles.is_empty() && last_activity.elapsed() >= self.idle_timeout {
                        break DispatchExit::IdleTimeout;
                    }
                }
                Err(err) if err.is_lock_lost() => break DispatchExit::LeaseLost,
                Err(_) => break DispatchExit::SessionFault,
            }
        };

        if exit == DispatchExit::LeaseLost {
            // Handlers are never interrupted; their tasks abandon best-effort.
            settles.detach_all();
        } else {
            if exit == DispatchExit::SessionFault {
                faulted.store(true, Ordering::Release);
            }
            while let Some(joined) = settles.join_next().await {
                self.settled(session.id(), joined);
            }
        }
        tracing::debug!(session_id = session.id(), exit = exit.as_str(), "dispatcher stopped");
        exit
    }

    async fn receive(
        &self,
        session: &Session,
    ) -> affinity_broker::Result<Option<ReceivedMessage>> {
        let handle = session.handle();
        self.policy
            .with_retry(ErrorSource::Receive, Some(session.id()), || {
                self.broker.receive(handle, self.receive_wait)
            })
            .await
    }

    fn settled(
        &self,
        session_id: &str,
        joined: Result<SettleOutcome, JoinError>,
    ) -> Option<DispatchExit> {
        match joined {
            Ok(SettleOutcome::Settled) | Ok(SettleOutcome::Aborted) => None,
            Ok(SettleOutcome::Orphaned) => Some(DispatchExit::LeaseLost),
            Ok(SettleOutcome::Failed { lock_lost: true }) => Some(DispatchExit::LeaseLost),
            Ok(SettleOutcome::Failed { lock_lost: false }) => Some(DispatchExit::SessionFault),
            Err(err) => {
                self.policy.on_session_failure(
                    ErrorSource::Pipeline,
                    Some(session_id),
                    format!("settle task failed: {err}"),
                );
                Some(DispatchExit::SessionFault)
            }
        }
    }
}

// Held by a settle task until it finishes.
struct SettleGuards {
    _permit: OwnedSemaphorePermit,
    _claim: Arc<Claim>,
    slot: Arc<WorkerSlot>,
    faulted: Arc<AtomicBool>,
}

async fn settle(
    broker: Arc<dyn SessionBroker>,
    handler: Arc<dyn MessageHandler>,
    policy: Arc<ErrorPolicy>,
    ctx: SessionContext,
    message: ReceivedMessage,
    guards: SettleGuards,
) -> SettleOutcome {
    let session_id = ctx.session_id();
    let settlement = {
        let _call = guards.slot.begin_call();
        let outcome = AssertUnwindSafe(handler.handle(&ctx, &message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(Settlement::Complete)) => Settlement::Complete,
            Ok(Ok(Settlement::Abandon)) => {
                policy.on_handler_failure(
                    session_id,
                    message.sequence,
                    "handler abandoned message",
                );
                Settlement::Abandon
            }
            Ok(Err(err)) => {
                policy.on_handler_failure(session_id, message.sequence, format!("{err:#}"));
                Settlement::Abandon
            }
            Err(panic) => {
                policy.on_handler_failure(
                    session_id,
                    message.sequence,
                    format!("handler panicked: {}", panic_message(panic.as_ref())),
                );
                Settlement::Abandon
            }
        }
    };

    if !ctx.is_held() {
        // Settlement cannot succeed without the session lock.
        let _ = broker.abandon(ctx.handle(), &message).await;
        tracing::debug!(
            session_id,
            sequence = message.sequence,
            "settlement skipped after lease loss"
        );
        return SettleOutcome::Orphaned;
    }

    if guards.faulted.load(Ordering::Acquire) {
        if broker.abandon(ctx.handle(), &message).await.is_ok() {
            metrics::counter!("affinity_messages_abandoned_total").increment(1);
        }
        tracing::debug!(
            session_id,
            sequence = message.sequence,
            "message abandoned after session fault"
        );
        return SettleOutcome::Aborted;
    }

    let (source, result) = match settlement {
        Settlement::Complete => (
            ErrorSource::Complete,
            broker.complete(ctx.handle(), &message).await,
        ),
        Settlement::Abandon => (
            ErrorSource::Abandon,
            broker.abandon(ctx.handle(), &message).await,
        ),
    };
    match result {
        Ok(()) => {
            match settlement {
                Settlement::Complete => {
                    metrics::counter!("affinity_messages_completed_total").increment(1)
                }
                Settlement::Abandon => {
                    metrics::counter!("affinity_messages_abandoned_total").increment(1)
                }
            }
            tracing::debug!(
                session_id,
                sequence = message.sequence,
                settlement = ?settlement,
                "message settled"
            );
            SettleOutcome::Settled
        }
        Err(err) => {
            policy.on_settlement_failure(source, session_id, message.sequence, &err);
            SettleOutcome::Failed {
                lock_lost: is_session_lock_lost(&err),
            }
        }
    }
}

// Narrower than `BrokerError::is_lock_lost`: a lost message lock alone is a
// session fault, not a lease loss.
fn is_session_lock_lost(err: &BrokerError) -> bool {
    matches!(err, BrokerError::LeaseLost { .. })
}
