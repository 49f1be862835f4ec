use std::time::Duration;
use thiserror::Error;

/// Boxed error produced by user-supplied conditions and predicates.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by every wait, check and probe poll.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("{label}: timed out after {attempts} attempt(s) in {elapsed:?}")]
    Timeout {
        label: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("{label}: condition failed after {elapsed:?}: {source}")]
    ConditionFailure {
        label: String,
        elapsed: Duration,
        #[source]
        source: BoxError,
    },

    #[error("{label}: giving up after {attempts} consecutive transport error(s): {source}")]
    TransportExhausted {
        label: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("{label}: cancelled after {attempts} attempt(s)")]
    Cancelled { label: String, attempts: u32 },

    #[error("Invalid poll policy: {0}")]
    InvalidPolicy(String),
}

impl PollError {
    /// Label of the wait that produced this error, if any.
    pub fn label(&self) -> Option<&str> {
        match self {
            PollError::Timeout { label, .. }
            | PollError::ConditionFailure { label, .. }
            | PollError::TransportExhausted { label, .. }
            | PollError::Cancelled { label, .. } => Some(label),
            PollError::InvalidPolicy(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PollError::Cancelled { .. })
    }
}

/// Terminal outcome of a single condition attempt.
///
/// The poller attaches the label and timing before surfacing it as a
/// [`PollError`].
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("{0}")]
    Failed(BoxError),

    #[error("{attempts} consecutive transport error(s): {source}")]
    TransportExhausted {
        attempts: u32,
        #[source]
        source: BoxError,
    },
}

impl ConditionError {
    pub fn failed<E: Into<BoxError>>(error: E) -> Self {
        ConditionError::Failed(error.into())
    }
}

/// Error reported by a [`crate::resource::ResourceClient`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("Fetch error: {0}")]
    Other(BoxError),
}

impl FetchError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        FetchError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn other<E: Into<BoxError>>(error: E) -> Self {
        FetchError::Other(error.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

/// Error from a single probe request.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProbeError {
    /// Connection-level failures are retried by the prober; everything else
    /// is terminal.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProbeError::Transport(_))
    }
}
