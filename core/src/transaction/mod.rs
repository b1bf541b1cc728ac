//! Transactions: one audit record per flow activation

pub mod retry;
pub mod sanitize;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub use retry::{
    classify_failure, is_financial, BackoffStrategy, ErrorCategory, FailureAction, RetryConfig,
    RetryDecision, RetryDefaults,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction {id} is already {state}")]
    AlreadyFinished { id: String, state: TransactionState },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Completed,
    Failed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "active",
            TransactionState::Completed => "completed",
            TransactionState::Failed => "failed",
            TransactionState::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Retrying,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepLogEntry {
    pub step_id: String,
    pub step_type: String,
    pub tool: Option<String>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub status: StepStatus,
    pub retry_count: u32,
    pub logged_at: DateTime<Utc>,
}

impl StepLogEntry {
    pub fn new(step_id: impl Into<String>, step_type: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            step_type: step_type.into(),
            tool: None,
            result: None,
            error: None,
            duration_ms: 0,
            status,
            retry_count: 0,
            logged_at: Utc::now(),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Audit record of one flow activation.
///
/// Starts `Active` and moves to exactly one terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub flow_name: String,
    pub initiator: String,
    pub user_id: String,
    pub steps: Vec<StepLogEntry>,
    pub state: TransactionState,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn begin(
        flow_name: impl Into<String>,
        initiator: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            flow_name: flow_name.into(),
            initiator: initiator.into(),
            user_id: user_id.into(),
            steps: Vec::new(),
            state: TransactionState::Active,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Record a step outcome; results and errors are redacted first
    pub fn log_step(&mut self, mut entry: StepLogEntry) -> Result<(), TransactionError> {
        self.ensure_active()?;
        entry.result = entry.result.as_ref().map(sanitize::sanitize_value);
        entry.error = entry.error.as_deref().map(sanitize::sanitize_text);
        self.steps.push(entry);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), TransactionError> {
        self.finish(TransactionState::Completed, None)
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransactionError> {
        self.finish(TransactionState::Failed, Some(reason.into()))
    }

    pub fn roll_back(&mut self, reason: impl Into<String>) -> Result<(), TransactionError> {
        self.finish(TransactionState::RolledBack, Some(reason.into()))
    }

    fn finish(
        &mut self,
        state: TransactionState,
        reason: Option<String>,
    ) -> Result<(), TransactionError> {
        self.ensure_active()?;
        let now = Utc::now();
        self.state = state;
        self.failure_reason = reason;
        self.updated_at = now;
        self.finished_at = Some(now);
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), TransactionError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(TransactionError::AlreadyFinished {
                id: self.id.clone(),
                state: self.state,
            })
        }
    }
}
