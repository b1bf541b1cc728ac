use thiserror::Error;

use crate::flows::DefinitionError;
use crate::session::StackError;
use crate::transaction::TransactionError;

/// Errors surfaced by the engine.
///
/// Expression problems never appear here: they degrade to inline
/// placeholders. Tool failures are classified and routed by the retry
/// manager and only reach this type when a flow has to be aborted.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("role '{0}' cannot drive a session; use 'user' or 'assistant'")]
    InvalidRole(String),

    #[error("an AI client is required to build the engine")]
    MissingAiClient,

    #[error("session context is corrupt: {0}")]
    SessionCorruption(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("flow validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("flow call depth exceeded the limit of {limit}")]
    RecursionLimit { limit: usize },

    #[error("turn exceeded the budget of {limit} steps")]
    StepBudgetExceeded { limit: usize },

    #[error("{step} step has no branch for {detail} and no default")]
    NoMatchingBranch { step: &'static str, detail: String },

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
