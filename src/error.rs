//! Error taxonomy for a painting run.
//!
//! Numeric degeneracy of a transform is not an error: it is recovered by the
//! pseudo-inverse and surfaced through [`crate::frame::Degeneracy`].

use thiserror::Error;

/// Errors raised while preparing or executing a drawing.
#[derive(Error, Debug)]
pub enum PainterError {
    /// The robot backend failed; the run is over.
    #[error("robot communication failed: {source}")]
    Communication {
        /// Backend error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The contact force was not reached within the search budget.
    #[error(
        "contact at {target_force} N not found after {cycles} cycles ({elapsed_ms} ms), \
         last force error {last_error:.3} N"
    )]
    ContactNotFound {
        target_force: f64,
        cycles: u64,
        elapsed_ms: u64,
        last_error: f64,
    },

    /// Trajectory data rejected at load time.
    #[error("malformed trajectory data{}: {reason}", trajectory_label(.index))]
    MalformedTrajectory {
        /// Position of the offending trajectory, when known.
        index: Option<usize>,
        reason: String,
    },

    /// The operator declined to continue at a color change.
    #[error("operator aborted at color change {from_color} -> {to_color}")]
    OperatorAbort { from_color: i64, to_color: i64 },

    /// No operator answer within the configured wait.
    #[error("no operator confirmation after {waited_ms} ms")]
    OperatorTimeout { waited_ms: u64 },

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PainterError {
    /// Wrap a backend error.
    pub fn communication<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Communication {
            source: Box::new(source),
        }
    }

    pub fn malformed(index: Option<usize>, reason: impl Into<String>) -> Self {
        Self::MalformedTrajectory {
            index,
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the failed step without restarting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ContactNotFound { .. })
    }
}

fn trajectory_label(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" in trajectory {i}"),
        None => String::new(),
    }
}

/// Result type for painter operations.
pub type Result<T> = std::result::Result<T, PainterError>;
