//! Errors raised by the dispatch pipeline's gates.
//!
//! Every variant is turned into `TaskStatus::Error` plus its `Display`
//! string at the pipeline boundary.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("directory not allowed: {kind} {path:?} is not within allowed dirs")]
    DirectoryNotAllowed { kind: &'static str, path: String },

    #[error("budget_exceeded: {0}")]
    BudgetExceeded(String),

    #[error("sandbox required but unavailable: {0}")]
    SandboxRequired(String),

    #[error("prompt blocked: {0}")]
    PromptBlocked(String),

    #[error("task {0} not found in failed tasks")]
    FailedTaskNotFound(String),

    #[error("smart dispatch is not enabled")]
    SmartDispatchDisabled,

    #[error("dispatch already in progress")]
    BatchActive,

    #[error("store error: {0}")]
    Store(String),

    #[error("{0}")]
    Provider(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            DispatchError::BudgetExceeded("daily budget exceeded: $5.00 / $5.00".into())
                .to_string(),
            "budget_exceeded: daily budget exceeded: $5.00 / $5.00"
        );
        assert_eq!(
            DispatchError::SmartDispatchDisabled.to_string(),
            "smart dispatch is not enabled"
        );
        assert_eq!(DispatchError::BatchActive.to_string(), "dispatch already in progress");
    }
}
