use thiserror::Error;

use super::routes::HandlerId;

/// Host-level failures. `Init` and `Load` are fatal for the process;
/// everything else fails a single dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("init error: {0}")]
    Init(String),
    #[error("load error: {0}")]
    Load(String),
    /// Uncaught error raised by application code.
    #[error("script error: {message}")]
    Script {
        message: String,
        traceback: Option<String>,
    },
    /// An instruction, heap or scratch budget ran out.
    #[error("{budget} budget exceeded")]
    BudgetExceeded { budget: &'static str },
    #[error("stack limit exceeded")]
    StackExceeded,
    #[error("no handler registered as {0}")]
    UnknownHandler(HandlerId),
    #[error("no route for {method} {path}")]
    NoRoute { method: String, path: String },
    #[error("runtime host destroyed")]
    Destroyed,
}

impl HostError {
    pub fn script(message: impl Into<String>) -> Self {
        HostError::Script {
            message: message.into(),
            traceback: None,
        }
    }

    /// True for resource-limit aborts.
    pub fn is_budget(&self) -> bool {
        matches!(
            self,
            HostError::BudgetExceeded { .. } | HostError::StackExceeded
        )
    }

    pub fn traceback(&self) -> Option<&str> {
        match self {
            HostError::Script { traceback, .. } => traceback.as_deref(),
            _ => None,
        }
    }
}
