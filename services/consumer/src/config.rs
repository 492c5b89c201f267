use affinity_consumer::SessionProcessorOptions;
use affinity_consumer::config::CONFIG_PATH_ENV;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_QUEUE: &str = "payment";
const DEFAULT_LOCK_DURATION_MS: u64 = 30_000;
const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;
const DEFAULT_DEMO_SESSIONS: usize = 2;
const DEFAULT_DEMO_MESSAGES_PER_SESSION: usize = 3;

// Consumer service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ConsumerServiceConfig {
    // Queue the engine consumes from.
    pub queue: String,
    // Session lock lifetime of the embedded broker queue.
    pub lock_duration_ms: u64,
    // Deliveries before the embedded broker dead-letters a message.
    pub max_delivery_count: u32,
    // Seed the queue with demo sessions at startup.
    pub demo_publish: bool,
    pub demo_sessions: usize,
    pub demo_messages_per_session: usize,
    pub processor: SessionProcessorOptions,
}

#[derive(Debug, Deserialize, Default)]
struct ConsumerConfigOverride {
    queue: Option<String>,
    lock_duration_ms: Option<u64>,
    max_delivery_count: Option<u32>,
    demo_publish: Option<bool>,
    demo_sessions: Option<usize>,
    demo_messages_per_session: Option<usize>,
}

impl ConsumerServiceConfig {
    pub fn from_env() -> Result<Self> {
        let queue = std::env::var("AFFINITY_QUEUE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        let lock_duration_ms = std::env::var("AFFINITY_LOCK_DURATION_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_LOCK_DURATION_MS);
        let max_delivery_count = std::env::var("AFFINITY_MAX_DELIVERY_COUNT")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_DELIVERY_COUNT);
        let demo_publish = std::env::var("AFFINITY_DEMO_PUBLISH")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let demo_sessions = std::env::var("AFFINITY_DEMO_SESSIONS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_DEMO_SESSIONS);
        let demo_messages_per_session = std::env::var("AFFINITY_DEMO_MESSAGES_PER_SESSION")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_DEMO_MESSAGES_PER_SESSION);
        Ok(Self {
            queue,
            lock_duration_ms,
            max_delivery_count,
            demo_publish,
            demo_sessions,
            demo_messages_per_session,
            processor: SessionProcessorOptions::from_env(),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            // One YAML file carries both service and processor settings.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read {CONFIG_PATH_ENV}: {path}"))?;
            let override_cfg: ConsumerConfigOverride =
                serde_yaml::from_str(&contents).context("parse consumer config yaml")?;
            if let Some(value) = override_cfg.queue {
                config.queue = value;
            }
            if let Some(value) = override_cfg.lock_duration_ms
                && value > 0
            {
                config.lock_duration_ms = value;
            }
            if let Some(value) = override_cfg.max_delivery_count
                && value > 0
            {
                config.max_delivery_count = value;
            }
            if let Some(value) = override_cfg.demo_publish {
                config.demo_publish = value;
            }
            if let Some(value) = override_cfg.demo_sessions {
                config.demo_sessions = value;
            }
            if let Some(value) = override_cfg.demo_messages_per_session {
                config.demo_messages_per_session = value;
            }
            config.processor = SessionProcessorOptions::from_env_or_yaml(Some(Path::new(&path)))
                .context("load session processor options")?;
        }
        Ok(config)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }
}
