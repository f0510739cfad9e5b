use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result};
use coord_delay::RunnerConfig;
use coord_observe::{LoggerConfig, LoggerFormat};
use coord_store::StoreConfig;

/// Default idle time after which a slot held by this worker is reclaimed.
const DEFAULT_IDLE_SLOT_SECS: u64 = 3600;
/// Default time given to running delayed tasks once shutdown starts.
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct WorkerdConfig {
    /// Identity of this worker; allocator owners are derived from it.
    pub owner: String,
    pub store: StoreConfig,
    pub logger: LoggerConfig,
    pub runner: RunnerConfig,
    /// Slots untouched for this long are released by the periodic sweep (0 disables it).
    pub idle_slot_secs: u64,
    /// Upper bound on waiting for claimed tasks during shutdown.
    pub shutdown_grace: Duration,
}

impl WorkerdConfig {
    /// Read the configuration from `COORD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut store = StoreConfig::default();
        if let Some(path) = get("COORD_DB") {
            store.path = path.into();
        }
        if let Some(ms) = parse::<u64>(&get, "COORD_LOCK_TIMEOUT_MS")? {
            store.busy_timeout = Duration::from_millis(ms);
        }

        let mut logger = LoggerConfig::default();
        if let Some(level) = get("COORD_LOG_LEVEL") {
            logger = logger.with_level(level);
        }
        if let Some(format) = get("COORD_LOG_FORMAT") {
            let format = format
                .parse::<LoggerFormat>()
                .context("COORD_LOG_FORMAT")?;
            logger = logger.with_format(format);
        }

        let mut runner = RunnerConfig::default();
        if let Some(ms) = parse::<u64>(&get, "COORD_POLL_MS")? {
            runner = runner.with_granularity(Duration::from_millis(ms.max(1)));
        }

        let idle_slot_secs = parse(&get, "COORD_IDLE_SLOT_SECS")?.unwrap_or(DEFAULT_IDLE_SLOT_SECS);
        let shutdown_grace = Duration::from_secs(
            parse(&get, "COORD_SHUTDOWN_GRACE_SECS")?.unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
        );
        let owner = match get("COORD_OWNER") {
            Some(owner) if !owner.trim().is_empty() => owner.trim().to_string(),
            _ => host_identity(),
        };

        Ok(Self {
            owner,
            store,
            logger,
            runner,
            idle_slot_secs,
            shutdown_grace,
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("{key}={raw}")))
        .transpose()
}

fn host_identity() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
