//! Error taxonomy for the job execution engine.
//!
//! The job config spec describes these as "a taxonomy, not types", but a
//! closed Rust enum is the idiomatic way to realize a taxonomy in this
//! target language: plugins and engine internals match on `EngineError`
//! variants the way `db_writer`-style code matches on driver error kinds,
//! and `thiserror` gives each variant a `Display` and a `source()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or incomplete JSON job description. Fatal at Init.
    #[error("config error in {component}: {message}")]
    Config { component: String, message: String },

    /// Could not reach the endpoint. Retryable at Init per policy, fatal
    /// thereafter.
    #[error("connect error in {component}: {message}")]
    Connect { component: String, message: String },

    /// Transient DB/network error. Handled by `RetryWrapper`; escalating
    /// past here means retries were exhausted.
    #[error("transient I/O error in {component} after exhausting retries: {message}")]
    TransientIo { component: String, message: String },

    /// A row was rejected by the sink (constraint violation, type
    /// mismatch). Handled by `OneByOneWrapper` -> dirty sink; escalating
    /// past here means the dirty-record quota was exceeded.
    #[error("data error in {component}: {message}")]
    Data { component: String, message: String },

    /// Plugin internal bug or unexpected condition. Never retried.
    #[error("plugin error in {component}: {message}")]
    Plugin { component: String, message: String },

    /// The operation observed cancellation of its context. Never reported
    /// as a Job failure if the top-level cancel was external.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn config(component: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Config {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn plugin(component: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Plugin {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the driver-facing `IsRetryErr` predicate should ever see
    /// this variant; used to decide whether `RetryWrapper` is even
    /// meaningful to wrap a given failure with.
    pub fn is_retryable_candidate(&self) -> bool {
        matches!(self, EngineError::TransientIo { .. } | EngineError::Connect { .. })
    }
}

/// Structured cause surfaced to the host on Job failure (§6: "Non-zero
/// error surfaces structured cause: {phase, plugin, taskId, underlying}").
#[derive(Debug, Clone)]
pub struct FailureCause {
    pub phase: String,
    pub plugin: String,
    pub task_id: Option<u64>,
    pub underlying: String,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[phase={} plugin={} task_id={:?}] {}",
            self.phase, self.plugin, self.task_id, self.underlying
        )
    }
}
