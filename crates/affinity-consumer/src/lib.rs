// Session-affinity consumption engine.
//
// Pipelines acquire sessions from a shared queue, keep their locks renewed,
// dispatch messages to a registered handler with bounded per-session
// concurrency, and settle each message explicitly. Within a session messages
// are received in sequence order; completion order is only guaranteed with
// `max_concurrent_calls_per_session = 1`.
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handler;
pub mod lease;
pub mod policy;
pub mod pool;
pub mod state;

pub use config::{RetryPolicy, SessionProcessorOptions};
pub use dispatcher::{DispatchExit, MessageDispatcher};
pub use engine::{ConsumptionEngine, ConsumptionEngineBuilder, EngineHandle, Shutdown};
pub use error::{ConfigError, EngineError, Result};
pub use handler::{HandlerFn, MessageHandler, Settlement, handler_fn};
pub use lease::{LeaseState, Session, SessionLeaseManager, renewal_deadline};
pub use policy::{
    Action, ErrorPolicy, ErrorSink, ErrorSource, FailureKind, ProcessError, TracingSink,
};
pub use pool::{PoolSnapshot, PoolStats, SessionWorkerPool, WorkerSlot};
pub use state::{NoopLifecycle, SessionContext, SessionLifecycle, SessionStateStore};

#[cfg(test)]
mod tests;
