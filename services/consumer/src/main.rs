// Consumer service main entry point.
mod observability;

use affinity_broker::{InMemoryBroker, QueueOptions, SessionBroker};
use affinity_consumer::{ConsumptionEngine, Shutdown};
use anyhow::{Context, Result};
use consumer::config::ConsumerServiceConfig;
use consumer::handlers::{LoggingHandler, SessionStateLifecycle};
use consumer::publisher;
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("affinity-consumer")?;
    let config = ConsumerServiceConfig::from_env_or_yaml()?;

    // Broker transport lives outside this process; the service runs against
    // an embedded queue.
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_queue(
        &config.queue,
        QueueOptions {
            lock_duration: config.lock_duration(),
            max_delivery_count: config.max_delivery_count,
        },
    );
    tracing::info!(queue = %config.queue, "queue ready");

    if config.demo_publish {
        publisher::publish_demo(
            &broker,
            &config.queue,
            config.demo_sessions,
            config.demo_messages_per_session,
        )?;
    }

    let session_broker: Arc<dyn SessionBroker> = broker.clone();
    let engine = ConsumptionEngine::builder(session_broker, config.queue.clone())
        .options(config.processor.clone())
        .handler(Arc::new(LoggingHandler))
        .lifecycle(Arc::new(SessionStateLifecycle))
        .build()
        .context("build consumption engine")?;
    let handle = engine
        .start(Shutdown::new())
        .context("start consumption engine")?;

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    let stats = handle.stats();
    handle.stop_and_wait().await?;

    let settled = broker.settlements(&config.queue)?.len();
    let dead_lettered = broker.dead_letters(&config.queue)?.len();
    tracing::info!(
        sessions_acquired = stats.sessions_acquired,
        peak_held_sessions = stats.peak_held_sessions,
        settled,
        dead_lettered,
        "consumer stopped"
    );
    observability::log_metrics_snapshot(&metrics_handle);
    Ok(())
}
