// Top-level wiring: options + broker + handler -> running pipelines.
use affinity_broker::SessionBroker;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SessionProcessorOptions;
use crate::dispatcher::MessageDispatcher;
use crate::error::{ConfigError, EngineError, Result};
use crate::handler::MessageHandler;
use crate::lease::SessionLeaseManager;
use crate::policy::{ErrorPolicy, ErrorSink, TracingSink};
use crate::pool::{PoolSnapshot, PoolStats, SessionWorkerPool, WorkerSlot};
use crate::state::{NoopLifecycle, SessionLifecycle, SessionStateStore};

/// Cancellation signal shared by every pipeline.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `trigger` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of `self`, so this cannot close.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

pub struct ConsumptionEngine {
    broker: Arc<dyn SessionBroker>,
    queue: String,
    options: SessionProcessorOptions,
    handler: Arc<dyn MessageHandler>,
    lifecycle: Arc<dyn SessionLifecycle>,
    sink: Arc<dyn ErrorSink>,
    started: AtomicBool,
}

pub struct ConsumptionEngineBuilder {
    broker: Arc<dyn SessionBroker>,
    queue: String,
    options: SessionProcessorOptions,
    handler: Option<Arc<dyn MessageHandler>>,
    lifecycle: Arc<dyn SessionLifecycle>,
    sink: Arc<dyn ErrorSink>,
}

impl ConsumptionEngineBuilder {
    pub fn options(mut self, options: SessionProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<dyn SessionLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Result<ConsumptionEngine> {
        let handler = self.handler.ok_or(ConfigError::MissingHandler)?;
        Ok(ConsumptionEngine {
            broker: self.broker,
            queue: self.queue,
            options: self.options,
            handler,
            lifecycle: self.lifecycle,
            sink: self.sink,
            started: AtomicBool::new(false),
        })
    }
}

impl ConsumptionEngine {
    pub fn builder(
        broker: Arc<dyn SessionBroker>,
        queue: impl Into<String>,
    ) -> ConsumptionEngineBuilder {
        ConsumptionEngineBuilder {
            broker,
            queue: queue.into(),
            options: SessionProcessorOptions::default(),
            handler: None,
            lifecycle: Arc::new(NoopLifecycle),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn options(&self) -> &SessionProcessorOptions {
        &self.options
    }

    /// Validate the options and spawn the pipelines.
    ///
    /// Configuration errors are the only failures returned; an engine can be
    /// started once.
    pub fn start(&self, shutdown: Shutdown) -> Result<EngineHandle> {
        self.options.validate()?;
        if self.queue.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "queue",
                reason: "must be non-empty".to_string(),
            }
            .into());
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyStarted);
        }

        let options = self.options.clone();
        let policy = Arc::new(ErrorPolicy::new(options.retry, Arc::clone(&self.sink)));
        let leases = SessionLeaseManager::new(
            Arc::clone(&self.broker),
            &self.queue,
            options.session_ids.clone(),
            options.renewal_margin,
            Arc::clone(&policy),
        );
        let dispatcher = MessageDispatcher::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.handler),
            Arc::clone(&policy),
            options.max_concurrent_calls_per_session,
            options.idle_timeout,
            options.receive_wait,
        );
        let pool = Arc::new(SessionWorkerPool::new(
            options,
            leases,
            SessionStateStore::new(Arc::clone(&self.broker)),
            dispatcher,
            Arc::clone(&self.lifecycle),
            policy,
        ));
        let stats = pool.stats();
        let slots = pool.slots().to_vec();
        let pipelines = pool.start(&shutdown);
        tracing::info!(queue = %self.queue, "consumption engine started");
        Ok(EngineHandle {
            shutdown,
            pipelines,
            stats,
            slots,
        })
    }
}

/// Handle to a running engine.
pub struct EngineHandle {
    shutdown: Shutdown,
    pipelines: Vec<JoinHandle<()>>,
    stats: Arc<PoolStats>,
    slots: Vec<Arc<WorkerSlot>>,
}

impl EngineHandle {
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn stats(&self) -> PoolSnapshot {
        self.stats.snapshot()
    }

    pub fn slots(&self) -> &[Arc<WorkerSlot>] {
        &self.slots
    }

    /// Signal every pipeline to stop. In-flight handlers still finish.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    /// Wait for every pipeline to drain and release its session.
    pub async fn wait(self) -> Result<()> {
        let mut first_error = None;
        for pipeline in self.pipelines {
            if let Err(err) = pipeline.await
                && first_error.is_none()
            {
                first_error = Some(EngineError::Join(err.to_string()));
            }
        }
        tracing::info!("consumption engine stopped");
        first_error.map_or(Ok(()), Err)
    }

    pub async fn stop_and_wait(self) -> Result<()> {
        self.stop();
        self.wait().await
    }
}
