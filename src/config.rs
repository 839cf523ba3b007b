// Licensed under the Apache License, Version 2.0.

//! Runtime configuration for the pipeline/callout stack.
//!
//! Every tunable here has a default matching spec.md's stated constants
//! (the `10µs` periodic-task floor, the `>10` `exec_ref_count` warning
//! threshold, etc.). Loading from TOML lets a deployment override them
//! without a rebuild, the way `r3bl_tui`'s `conf_file` crate loads terminal
//! app settings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn de_duration_ms<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

fn ser_duration_ms<S>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(d.as_millis() as u64)
}

/// Tunables shared by [`crate::pipeline::Stage`] and
/// [`crate::callout::Scheduler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of the callout urgent/idle queues and per-worker
    /// callout-stage queues (spec.md §3 "bounded FIFO").
    pub callout_task_max: usize,

    /// Slack added to "now" when deciding which timed tasks are due
    /// (spec.md §4.4 step 3: "tasks due at or before now + jitter").
    #[serde(
        rename = "scheduler_jitter_ms",
        deserialize_with = "de_duration_ms",
        serialize_with = "ser_duration_ms"
    )]
    pub scheduler_jitter: Duration,

    /// Floor for the master loop's sleep timeout when no idle proc is
    /// installed (spec.md §4.4 step 7).
    #[serde(
        rename = "idle_interval_floor_ms",
        deserialize_with = "de_duration_ms",
        serialize_with = "ser_duration_ms"
    )]
    pub idle_interval_floor: Duration,

    /// How long `finalize_handler` waits for the callout stage to drain
    /// gracefully before cancelling it outright.
    #[serde(
        rename = "callout_stage_shutdown_timeout_ms",
        deserialize_with = "de_duration_ms",
        serialize_with = "ser_duration_ms"
    )]
    pub callout_stage_shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            callout_task_max: 4096,
            scheduler_jitter: Duration::from_micros(100),
            idle_interval_floor: Duration::from_millis(100),
            callout_stage_shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Loads and merges a TOML file on top of [`Config::default`]; a
    /// missing key keeps its default.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(Error::PosixApiError)?;
        toml::from_str(&text)
            .map_err(|e| Error::InvalidArgs(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string(&cfg).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.callout_task_max, cfg.callout_task_max);
        assert_eq!(parsed.scheduler_jitter, cfg.scheduler_jitter);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let parsed: Config = toml::from_str("callout_task_max = 16\n").unwrap();
        assert_eq!(parsed.callout_task_max, 16);
        assert_eq!(parsed.idle_interval_floor, Config::default().idle_interval_floor);
    }
}
