//! Configuration for the queue controller.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::controller::ControllerSettings;
use crate::poller::PollerConfig;
use crate::slot::SlotPool;

/// Queue controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Slots workers may be launched onto.
    pub slots: SlotPool,

    /// Seconds between poll ticks.
    pub poll_interval_secs: u64,

    /// Seconds before the first poll tick.
    pub poll_initial_delay_secs: u64,

    /// Seconds a started worker owns its slot even if its port still looks
    /// free and its launch process already exited.
    pub startup_grace_secs: u64,

    /// Data directory for the queue database.
    pub data_dir: String,

    /// Interpreter used to run worker scripts.
    pub worker_shell: String,

    /// Worker script path; `{slot}` is replaced by the port.
    pub worker_script: String,

    /// Worker control endpoint; `{slot}` is replaced by the port.
    pub control_url: String,

    /// Timeout for remote stop requests in seconds.
    pub control_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let slots_raw = lookup("SLOTQ_SLOTS").unwrap_or_else(|| "9995".to_string());
        let slots = SlotPool::parse(&slots_raw)
            .with_context(|| format!("invalid SLOTQ_SLOTS '{slots_raw}'"))?;

        let poll_interval_secs: u64 = parse_var(&lookup, "SLOTQ_POLL_INTERVAL_SECS", 20)?;
        if poll_interval_secs == 0 {
            bail!("SLOTQ_POLL_INTERVAL_SECS must be greater than zero");
        }

        let poll_initial_delay_secs: u64 =
            parse_var(&lookup, "SLOTQ_POLL_INITIAL_DELAY_SECS", 10)?;

        let startup_grace_secs: u64 = parse_var(&lookup, "SLOTQ_STARTUP_GRACE_SECS", 30)?;

        let data_dir = lookup("SLOTQ_DATA_DIR").unwrap_or_else(|| "/var/lib/slotq".to_string());

        let worker_shell = lookup("SLOTQ_WORKER_SHELL").unwrap_or_else(|| "/bin/bash".to_string());

        let worker_script =
            lookup("SLOTQ_WORKER_SCRIPT").unwrap_or_else(|| "crawl{slot}.sh".to_string());

        let control_url = lookup("SLOTQ_CONTROL_URL")
            .unwrap_or_else(|| "http://127.0.0.1:{slot}/stop".to_string());

        let control_timeout_secs: u64 = parse_var(&lookup, "SLOTQ_CONTROL_TIMEOUT_SECS", 5)?;

        let log_level = lookup("SLOTQ_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            slots,
            poll_interval_secs,
            poll_initial_delay_secs,
            startup_grace_secs,
            data_dir,
            worker_shell,
            worker_script,
            control_url,
            control_timeout_secs,
            log_level,
        })
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            initial_delay: Duration::from_secs(self.poll_initial_delay_secs),
            interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            poller: Some(self.poller_config()),
            startup_grace: Duration::from_secs(self.startup_grace_secs),
        }
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    /// Path of the SQLite queue database.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("queue.db")
    }
}

/// Parse an optional variable, falling back to `default` when it is unset.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key} '{raw}'")),
        None => Ok(default),
    }
}
