//! Error taxonomy for flow startup and fire execution.
//!
//! Only [`FlowError::ConfigInvalid`] and [`FlowError::StartupHook`]
//! abort the process. Everything that happens inside a single fire is a
//! [`FireError`], isolated to that fire: the scheduler logs it and keeps
//! going.

use thiserror::Error;

/// Fatal (startup-scoped) errors.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Configuration rejected by the validator. `path` locates the
    /// offending element (`[input][2][tasks][1]`), `suggestion` proposes
    /// the closest expected key if one is within edit distance.
    #[error("invalid configuration at {path}: {message}")]
    ConfigInvalid {
        path: String,
        message: String,
        suggestion: Option<String>,
    },

    /// `on_connect` of a module failed; startup is aborted.
    #[error("startup hook failed for module `{module}`: {error:#}")]
    StartupHook { module: String, error: anyhow::Error },

    /// Broker or scheduler infrastructure failure.
    #[error("{0:#}")]
    Infrastructure(anyhow::Error),
}

impl FlowError {
    pub fn config(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }
}

/// Errors scoped to a single fire of a task.
#[derive(Debug, Error)]
pub enum FireError {
    /// The input call failed. Retry-eligible up to the task's
    /// `max_retries`, then the fire is dropped.
    #[error("input `{module}` failed for task `{task}`: {error:#}")]
    Input {
        task: String,
        module: String,
        error: anyhow::Error,
    },

    /// Frame projection rejected the input result. Configuration-level;
    /// never retried.
    #[error("frame build failed for task `{task}` at `{path}`: {message}")]
    FrameBuild {
        task: String,
        /// Record path (flattened key) that produced the error.
        path: String,
        message: String,
    },

    /// A transform failed. `terminal` aborts the chain and skips
    /// outputs; otherwise the frame continues to the next transform.
    #[error("transform `{module}` failed for task `{task}`: {error:#}")]
    Transform {
        task: String,
        module: String,
        terminal: bool,
        error: anyhow::Error,
    },

    /// An output failed; remaining outputs still run.
    #[error("output `{module}` failed for task `{task}`: {error:#}")]
    Output {
        task: String,
        module: String,
        error: anyhow::Error,
    },
}

impl FireError {
    /// Whether the retry policy applies. Only the input step retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Input { .. })
    }

    /// Name of the module the error originated in, if known.
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::Input { module, .. }
            | Self::Transform { module, .. }
            | Self::Output { module, .. } => Some(module),
            Self::FrameBuild { .. } => None,
        }
    }
}

/// Signal type for transform implementations: a soft error is logged and
/// the chain continues; a terminal error aborts the chain.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{0}")]
    Soft(anyhow::Error),
    #[error("{0}")]
    Terminal(anyhow::Error),
}

impl TransformError {
    pub fn soft(err: impl Into<anyhow::Error>) -> Self {
        Self::Soft(err.into())
    }

    pub fn terminal(err: impl Into<anyhow::Error>) -> Self {
        Self::Terminal(err.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            Self::Soft(e) | Self::Terminal(e) => e,
        }
    }
}
