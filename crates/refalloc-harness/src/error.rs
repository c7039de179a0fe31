//! Harness error type.

use refalloc_core::AllocError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// A scenario observed something other than what it expected.
    #[error("{scenario}: {message}")]
    Check {
        scenario: &'static str,
        message: String,
    },
    /// A facade call the scenario relied on failed.
    #[error("{scenario}: allocation failed: {source}")]
    Alloc {
        scenario: &'static str,
        #[source]
        source: AllocError,
    },
    /// The scenario hit a fatal usage error.
    #[error("{scenario}: panicked: {message}")]
    Panicked {
        scenario: &'static str,
        message: String,
    },
    #[error("unknown scenario `{0}`")]
    UnknownScenario(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub(crate) fn check(scenario: &'static str, message: impl Into<String>) -> Self {
        Self::Check {
            scenario,
            message: message.into(),
        }
    }
}
