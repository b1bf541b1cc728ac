//! Tool failure classification and retry scheduling

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const MAX_BACKOFF_MS: u64 = 30_000;

/// Classification of a tool failure, supplied by the tool invoker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    ServerError,
    ClientError,
    Auth,
    RateLimit,
    ToolCallGeneration,
    Unknown,
}

impl ErrorCategory {
    /// Category for an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorCategory::Auth,
            408 => ErrorCategory::Timeout,
            429 => ErrorCategory::RateLimit,
            400..=499 => ErrorCategory::ClientError,
            500..=599 => ErrorCategory::ServerError,
            _ => ErrorCategory::Unknown,
        }
    }

    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::ServerError
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::ToolCallGeneration => "tool_call_generation",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// What to do with a failed tool step when no `onFail` handler is declared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry,
    Cancel,
}

/// Names touching payments, accounts or transactions fail closed
pub fn is_financial(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    ["payment", "account", "transaction", "transfer"]
        .iter()
        .any(|word| name.contains(word))
}

pub fn classify_failure(category: ErrorCategory, tool_name: &str, flow_name: &str) -> FailureAction {
    if is_financial(tool_name) || is_financial(flow_name) {
        return FailureAction::Cancel;
    }
    if category.is_transient() {
        FailureAction::Retry
    } else {
        FailureAction::Cancel
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    /// Delays listed explicitly in `delaysMs`
    Manual,
}

/// Per-step retry settings (`retry` on a CALL-TOOL step)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delays_ms: Vec<u64>,
}

/// Engine-wide fallbacks for steps without their own settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDefaults {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryConfig {
    /// Decide whether the attempt that just failed gets another try.
    ///
    /// `retries_so_far` counts retries already made, so the first failure
    /// passes 0.
    pub fn decide(
        config: Option<&RetryConfig>,
        defaults: RetryDefaults,
        retries_so_far: u32,
        action: FailureAction,
    ) -> RetryDecision {
        if action == FailureAction::Cancel {
            return RetryDecision::GiveUp;
        }
        let max_retries = config
            .and_then(|c| c.max_retries)
            .unwrap_or(defaults.max_retries);
        if retries_so_far >= max_retries {
            return RetryDecision::GiveUp;
        }
        let delay_ms = match config {
            Some(config) => config.delay_for(retries_so_far, defaults.base_delay_ms),
            None => exponential(defaults.base_delay_ms, retries_so_far),
        };
        RetryDecision::Retry {
            delay: Duration::from_millis(delay_ms),
        }
    }

    fn delay_for(&self, retries_so_far: u32, default_base: u64) -> u64 {
        let base = self.delay_ms.unwrap_or(default_base);
        let delay = match self.strategy {
            BackoffStrategy::Exponential => exponential(base, retries_so_far),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retries_so_far) + 1),
            BackoffStrategy::Manual => self
                .delays_ms
                .get(retries_so_far as usize)
                .or(self.delays_ms.last())
                .copied()
                .unwrap_or(base),
        };
        delay.min(MAX_BACKOFF_MS)
    }
}

fn exponential(base: u64, retries_so_far: u32) -> u64 {
    base.saturating_mul(2u64.saturating_pow(retries_so_far))
        .min(MAX_BACKOFF_MS)
}
