// Failure classification and the actions taken for each class.
//
// Transient: retry with backoff on the same session, escalate once attempts run out.
// SessionFatal: stop the dispatcher and release the session.
// MessageFatal: abandon the one message and keep going.
//
// Everything classified here is reported to an `ErrorSink`. Reporting never
// propagates a failure back into the pool.
use affinity_broker::BrokerError;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Transient,
    SessionFatal,
    MessageFatal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::SessionFatal => "session_fatal",
            FailureKind::MessageFatal => "message_fatal",
        }
    }
}

/// Where a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    Accept,
    Receive,
    Renew,
    Complete,
    Abandon,
    Handler,
    Initializing,
    Closing,
    Release,
    Pipeline,
}

impl ErrorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSource::Accept => "accept",
            ErrorSource::Receive => "receive",
            ErrorSource::Renew => "renew",
            ErrorSource::Complete => "complete",
            ErrorSource::Abandon => "abandon",
            ErrorSource::Handler => "handler",
            ErrorSource::Initializing => "initializing",
            ErrorSource::Closing => "closing",
            ErrorSource::Release => "release",
            ErrorSource::Pipeline => "pipeline",
        }
    }
}

/// A classified failure as seen by the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessError {
    pub kind: FailureKind,
    pub source: ErrorSource,
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
    // Lease loss is normal churn and is reported at a lower severity.
    pub lease_lost: bool,
    pub message: String,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failure during {}",
            self.kind.as_str(),
            self.source.as_str()
        )?;
        if let Some(session_id) = &self.session_id {
            write!(f, " (session {session_id})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Observability sink for classified failures.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &ProcessError);
}

/// Logs through `tracing` and counts through `metrics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, error: &ProcessError) {
        metrics::counter!(
            "affinity_errors_total",
            "kind" => error.kind.as_str(),
            "source" => error.source.as_str()
        )
        .increment(1);
        let session_id = error.session_id.as_deref().unwrap_or("-");
        if error.lease_lost {
            tracing::info!(
                session_id,
                source = error.source.as_str(),
                error = %error.message,
                "session lease lost"
            );
            return;
        }
        match error.kind {
            FailureKind::Transient => tracing::warn!(
                session_id,
                source = error.source.as_str(),
                error = %error.message,
                "transient broker failure"
            ),
            FailureKind::MessageFatal => tracing::warn!(
                session_id,
                sequence = error.sequence,
                source = error.source.as_str(),
                error = %error.message,
                "message abandoned"
            ),
            FailureKind::SessionFatal => tracing::error!(
                session_id,
                sequence = error.sequence,
                source = error.source.as_str(),
                error = %error.message,
                "session failure"
            ),
        }
    }
}

/// What the caller should do next after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Retry(Duration),
    AbandonMessage,
    CloseSession,
}

pub struct ErrorPolicy {
    retry: RetryPolicy,
    sink: Arc<dyn ErrorSink>,
}

impl fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorPolicy")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ErrorPolicy {
    pub fn new(retry: RetryPolicy, sink: Arc<dyn ErrorSink>) -> Self {
        Self { retry, sink }
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn classify(err: &BrokerError) -> FailureKind {
        if err.is_transient() {
            FailureKind::Transient
        } else {
            FailureKind::SessionFatal
        }
    }

    pub fn report(&self, error: ProcessError) {
        // A panicking sink must not take a pipeline down with it.
        if catch_unwind(AssertUnwindSafe(|| self.sink.report(&error))).is_err() {
            tracing::error!(error = %error, "error sink panicked");
        }
    }

    /// Broker call failure during accept, receive, or renew. `attempt` is 1-based.
    pub fn on_broker_error(
        &self,
        source: ErrorSource,
        session_id: Option<&str>,
        err: &BrokerError,
        attempt: u32,
    ) -> Action {
        let kind = Self::classify(err);
        self.report(ProcessError {
            kind,
            source,
            session_id: session_id.map(str::to_string),
            sequence: None,
            lease_lost: err.is_lock_lost(),
            message: err.to_string(),
        });
        if kind == FailureKind::Transient {
            if self.retry.should_retry(attempt) {
                return Action::Retry(self.retry.backoff(attempt));
            }
            self.report(ProcessError {
                kind: FailureKind::SessionFatal,
                source,
                session_id: session_id.map(str::to_string),
                sequence: None,
                lease_lost: false,
                message: format!("retries exhausted after {attempt} attempts: {err}"),
            });
        }
        Action::CloseSession
    }

    /// Handler returned an error, panicked, or asked for the message to be abandoned.
    pub fn on_handler_failure(
        &self,
        session_id: &str,
        sequence: u64,
        message: impl Into<String>,
    ) -> Action {
        self.report(ProcessError {
            kind: FailureKind::MessageFatal,
            source: ErrorSource::Handler,
            session_id: Some(session_id.to_string()),
            sequence: Some(sequence),
            lease_lost: false,
            message: message.into(),
        });
        Action::AbandonMessage
    }

    /// Complete or abandon failed. Always fatal to the session.
    pub fn on_settlement_failure(
        &self,
        source: ErrorSource,
        session_id: &str,
        sequence: u64,
        err: &BrokerError,
    ) -> Action {
        self.report(ProcessError {
            kind: FailureKind::SessionFatal,
            source,
            session_id: Some(session_id.to_string()),
            sequence: Some(sequence),
            lease_lost: err.is_lock_lost(),
            message: err.to_string(),
        });
        Action::CloseSession
    }

    /// Session-fatal failure outside a broker call, e.g. a lifecycle hook.
    pub fn on_session_failure(
        &self,
        source: ErrorSource,
        session_id: Option<&str>,
        message: impl Into<String>,
    ) -> Action {
        self.report(ProcessError {
            kind: FailureKind::SessionFatal,
            source,
            session_id: session_id.map(str::to_string),
            sequence: None,
            lease_lost: false,
            message: message.into(),
        });
        Action::CloseSession
    }

    pub fn on_lease_lost(&self, session_id: &str, reason: impl Into<String>) {
        self.report(ProcessError {
            kind: FailureKind::SessionFatal,
            source: ErrorSource::Renew,
            session_id: Some(session_id.to_string()),
            sequence: None,
            lease_lost: true,
            message: reason.into(),
        });
    }

    /// Run `op`, retrying transient failures with backoff.
    ///
    /// Returns the last error once the policy says to stop.
    pub async fn with_retry<T, F, Fut>(
        &self,
        source: ErrorSource,
        session_id: Option<&str>,
        mut op: F,
    ) -> affinity_broker::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = affinity_broker::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.on_broker_error(source, session_id, &err, attempt) {
                    Action::Retry(delay) => {
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Action::AbandonMessage | Action::CloseSession => return Err(err),
                },
            }
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
