//! Tracing and metrics setup for the consumer service.
//!
//! Installs an env-filtered fmt subscriber and a Prometheus recorder. The
//! recorder is not served over HTTP; `log_metrics_snapshot` writes the
//! rendered `affinity_*` series to the log instead.
//! In tests the recorder handle is cached so repeated initialization is safe.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const METRIC_PREFIX: &str = "affinity_";

/// Initializes logging and the metrics recorder.
///
/// `RUST_LOG` controls filtering; defaults to `info`.
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);
    init_subscriber(registry)?;
    let handle = install_metrics_recorder()?;
    tracing::debug!(service = service_name, "observability initialized");
    Ok(handle)
}

/// Logs every rendered sample belonging to this service's metric families.
pub fn log_metrics_snapshot(handle: &PrometheusHandle) -> usize {
    let rendered = handle.render();
    let lines = service_metric_lines(&rendered);
    for line in &lines {
        tracing::info!(sample = %line, "metric");
    }
    lines.len()
}

fn service_metric_lines(rendered: &str) -> Vec<&str> {
    rendered
        .lines()
        .filter(|line| line.starts_with(METRIC_PREFIX))
        .collect()
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return Ok(handle.clone());
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")?;
        let _ = METRICS_HANDLE.set(handle.clone());
        Ok(handle)
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S) -> Result<()>
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
        Ok(())
    }
    #[cfg(not(test))]
    {
        subscriber.try_init().context("install tracing subscriber")
    }
}
