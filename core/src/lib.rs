//! Cadence: a conversational flow interpreter
//!
//! Flows are declarative step lists (SAY, SAY-GET, SET, SWITCH, CASE,
//! CALL-TOOL, FLOW) run against a host-owned [`SessionContext`]. The host
//! feeds each conversation entry to [`Engine::update_activity`] and stores
//! the session it gets back.

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expression;
pub mod flows;
pub mod logging;
pub mod messages;
pub mod session;
pub mod transaction;
pub mod types;

pub use collaborators::{
    AiCallback, AiClient, ApprovedFunction, FlowValidator, LocalFunctionInvoker,
    ReferenceValidator, ToolError, ToolInvoker,
};
pub use config::{Config, EngineSettings, GuidancePosition, GuidanceSettings, LoggingSettings};
pub use engine::{ActivityOutcome, Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use executor::Command;
pub use expression::{Evaluation, EvalScope, Evaluator};
pub use flows::{FlowDefinition, FlowLibrary, FlowStep, ToolDefinition, ToolRegistry};
pub use messages::MessageRegistry;
pub use session::{FlowFrame, SessionContext};
pub use transaction::{ErrorCategory, RetryConfig, Transaction, TransactionState};
pub use types::*;
