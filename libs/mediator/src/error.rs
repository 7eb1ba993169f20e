use std::fmt;
use std::sync::Arc;

/// Shared failure cause carried through nack chains and stream failures.
///
/// Causes cross stage boundaries and may be observed by several listeners
/// (inbound chain, group, external outlet), hence the `Arc`.
pub type NackCause = Arc<anyhow::Error>;

/// Wrap an error into a shareable nack cause.
pub fn nack_cause(err: impl Into<anyhow::Error>) -> NackCause {
    Arc::new(err.into())
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MediatorError {
    #[error("method `{method}` matches no supported shape: {detail}")]
    Classification { method: String, detail: String },

    #[error("channel `{channel}` link conflict: {detail}")]
    Link { channel: String, detail: String },

    #[error("invocation of `{method}` failed: {cause}")]
    Invocation { method: String, cause: NackCause },

    #[error("acknowledgment contract violation: {detail}")]
    Acknowledgment { detail: String },

    #[error("channel `{channel}` is closed")]
    ChannelClosed { channel: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("pipeline wiring failed: {}", join_errors(.0))]
    Wiring(Vec<MediatorError>),
}

impl MediatorError {
    /// Create a classification failure naming the offending method
    pub fn classification(method: impl Into<String>, detail: impl Into<String>) -> Self {
        MediatorError::Classification {
            method: method.into(),
            detail: detail.into(),
        }
    }

    /// Create a link conflict error for a channel
    pub fn link(channel: impl Into<String>, detail: impl Into<String>) -> Self {
        MediatorError::Link {
            channel: channel.into(),
            detail: detail.into(),
        }
    }

    /// Create an invocation failure for a method
    pub fn invocation(method: impl Into<String>, cause: NackCause) -> Self {
        MediatorError::Invocation {
            method: method.into(),
            cause,
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        MediatorError::Config(msg.into())
    }

    /// Check if this error is fatal at wiring time
    pub fn is_wiring_error(&self) -> bool {
        matches!(
            self,
            MediatorError::Classification { .. }
                | MediatorError::Link { .. }
                | MediatorError::Wiring(_)
        )
    }
}

pub(crate) fn join_errors(errors: &[MediatorError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for engine operations
pub type MediatorResult<T> = std::result::Result<T, MediatorError>;

/// Terminal failure of a stage's outbound stream.
///
/// Downstream stages observe this in place of a message, forward it, and
/// stop consuming the channel.
#[derive(Debug, Clone)]
pub struct StageFailure {
    /// Name of the stage whose invocation failed
    pub stage: String,
    /// The underlying cause, shared with any nack chains it fed
    pub cause: NackCause,
}

impl StageFailure {
    pub fn new(stage: impl Into<String>, cause: NackCause) -> Self {
        Self {
            stage: stage.into(),
            cause,
        }
    }

    /// Wrap a fresh error as a stage failure
    pub fn from_error(stage: impl Into<String>, err: impl Into<anyhow::Error>) -> Self {
        Self::new(stage, nack_cause(err))
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage `{}` failed: {}", self.stage, self.cause)
    }
}

impl std::error::Error for StageFailure {}

impl From<StageFailure> for MediatorError {
    fn from(failure: StageFailure) -> Self {
        MediatorError::Invocation {
            method: failure.stage,
            cause: failure.cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_diagnostic_names_method() {
        let err = MediatorError::classification("process", "return shape `void` not in processor table");
        let text = err.to_string();
        assert!(text.contains("process"));
        assert!(text.contains("void"));
        assert!(err.is_wiring_error());
    }

    #[test]
    fn test_wiring_joins_all_errors() {
        let err = MediatorError::Wiring(vec![
            MediatorError::classification("a", "x"),
            MediatorError::link("sink", "two producers"),
        ]);
        let text = err.to_string();
        assert!(text.contains("`a`"));
        assert!(text.contains("`sink`"));
    }

    #[test]
    fn test_stage_failure_display() {
        let failure = StageFailure::from_error("count", anyhow::anyhow!("boom"));
        assert_eq!(failure.to_string(), "stage `count` failed: boom");
    }

    #[test]
    fn test_stage_failure_converts_to_invocation_error() {
        let failure = StageFailure::from_error("count", anyhow::anyhow!("boom"));
        let err = MediatorError::from(failure);
        assert!(matches!(err, MediatorError::Invocation { .. }));
        assert_eq!(err.to_string(), "invocation of `count` failed: boom");
    }
}
