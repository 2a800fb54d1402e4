//! The job JSON config and the four slices the engine threads through
//! containers: `PluginConf`, `PluginJobConf`, `TransportConf` and
//! `JobSettings`. Parsing the outer job-description tree and converting
//! column values are explicitly out of scope (see spec §1); this module
//! covers only the keys the engine itself reads (spec §6).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static metadata about a plugin, set once via `SetPluginConf`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConf {
    pub name: String,
}

/// Per-endpoint user input: connection parameters, credentials, split
/// key. Opaque beyond the handful of keys the engine itself cares about;
/// the full `parameter` object is handed to the plugin untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginJobConf {
    pub parameter: serde_json::Value,
    pub split_key: Option<String>,
}

/// `job.setting.channel`-derived transport tuning: channel capacity,
/// batch size, flush interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConf {
    pub capacity: usize,
    pub batch_size: usize,
    #[serde(with = "duration_millis")]
    pub flush_period: Duration,
}

impl Default for TransportConf {
    fn default() -> Self {
        Self {
            capacity: 1024,
            batch_size: 128,
            flush_period: Duration::from_millis(500),
        }
    }
}

/// `job.setting.errorLimit`: absolute failed-task count and/or failed
/// record ratio that fail the Job once exceeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorLimit {
    pub record: Option<u64>,
    pub percentage: Option<f64>,
}

/// `job.setting.pool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "PoolConfig::default_max_open")]
    pub max_open_conns: u32,
    #[serde(default = "PoolConfig::default_max_idle")]
    pub max_idle_conns: u32,
    #[serde(default = "PoolConfig::default_idle_time", with = "duration_secs")]
    pub conn_max_idle_time: Duration,
    #[serde(default = "PoolConfig::default_lifetime", with = "duration_secs")]
    pub conn_max_lifetime: Duration,
}

impl PoolConfig {
    const fn default_max_open() -> u32 {
        10
    }
    const fn default_max_idle() -> u32 {
        2
    }
    const fn default_idle_time() -> Duration {
        Duration::from_secs(300)
    }
    const fn default_lifetime() -> Duration {
        Duration::from_secs(3600)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open_conns: Self::default_max_open(),
            max_idle_conns: Self::default_max_idle(),
            conn_max_idle_time: Self::default_idle_time(),
            conn_max_lifetime: Self::default_lifetime(),
        }
    }
}

/// `job.setting.speed`: desired Task concurrency plus advisory throttles.
/// Per the spec's open question, `byte`/`record` throttles are parsed and
/// carried but not enforced by this implementation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeedConfig {
    pub channel: usize,
    pub byte: Option<u64>,
    pub record: Option<u64>,
}

/// Retry policy variants (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    NoRetry,
    NTimes {
        n: u32,
        #[serde(with = "duration_millis")]
        wait: Duration,
    },
    ExponentialBackoff {
        #[serde(with = "duration_millis")]
        base: Duration,
        #[serde(with = "duration_millis")]
        max: Duration,
        cap: u32,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::NoRetry
    }
}

/// `job.setting.retry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(flatten)]
    pub policy: RetryPolicy,
    #[serde(default)]
    pub ignore_one_by_one_error: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            ignore_one_by_one_error: false,
        }
    }
}

/// `job.setting`, aggregated: retry policy, error budget, concurrency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default)]
    pub speed: SpeedConfig,
    #[serde(default)]
    pub transport: TransportConf,
    #[serde(default)]
    pub error_limit: ErrorLimit,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Number of TaskGroups the Task list is partitioned into.
    #[serde(default = "JobSettings::default_group_count")]
    pub group_count: usize,
}

impl JobSettings {
    const fn default_group_count() -> usize {
        1
    }
}

/// One reader/writer endpoint entry: `{name, parameter}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEndpointConfig {
    pub name: String,
    #[serde(default)]
    pub parameter: serde_json::Value,
}

/// One `job.content[]` entry pairing a reader and a writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContentConfig {
    pub reader: PluginEndpointConfig,
    pub writer: PluginEndpointConfig,
}

/// The top-level job description (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub content: Vec<JobContentConfig>,
    #[serde(default)]
    pub setting: JobSettings,
}

/// The writer's batching/transaction strategy (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    Normal,
    Stmt,
    Tx,
    StmtTx,
    CopyIn,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
