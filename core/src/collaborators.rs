//! Seams to the outside world: the AI callback, tool invocation and
//! definition validation

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::flows::{FlowLibrary, FlowStep, ToolDefinition, ToolRegistry};
use crate::transaction::ErrorCategory;

/* ===================== AI Client ===================== */

/// The host's language model.
///
/// Receives a system instruction and a user message and returns raw text;
/// when the engine asks for JSON it says so in the instruction and parses
/// the reply itself.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, system_instruction: &str, user_message: &str) -> anyhow::Result<String>;
}

/// Adapts an async closure into an [`AiClient`]
pub struct AiCallback<F> {
    callback: F,
}

impl<F> AiCallback<F> {
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F, Fut> AiClient for AiCallback<F>
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    async fn complete(&self, system_instruction: &str, user_message: &str) -> anyhow::Result<String> {
        (self.callback)(system_instruction.to_string(), user_message.to_string()).await
    }
}

/* ===================== Tool Invocation ===================== */

/// A classified tool failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolError {
    pub category: ErrorCategory,
    pub message: String,
    pub status: Option<u16>,
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({}): {}", self.category, status, self.message),
            None => write!(f, "{}: {}", self.category, self.message),
        }
    }
}

impl std::error::Error for ToolError {}

impl ToolError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            status: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ToolCallGeneration, message)
    }

    /// Failure carrying an HTTP status; the category follows from it
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::from_status(status),
            message: message.into(),
            status: Some(status),
        }
    }
}

/// Executes tools on the engine's behalf
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn execute(
        &self,
        tool: &ToolDefinition,
        args: &JsonValue,
        user_id: &str,
        transaction_id: &str,
    ) -> Result<JsonValue, ToolError>;
}

/// A host function a local tool may run
pub type ApprovedFunction = Arc<dyn Fn(&JsonValue) -> Result<JsonValue, ToolError> + Send + Sync>;

/// Runs tools whose implementation type is `local` against a registry of
/// approved functions
#[derive(Clone, Default)]
pub struct LocalFunctionInvoker {
    functions: BTreeMap<String, ApprovedFunction>,
}

impl fmt::Debug for LocalFunctionInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFunctionInvoker")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LocalFunctionInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, function: ApprovedFunction) {
        self.functions.insert(name.into(), function);
    }

    pub fn with_functions(functions: BTreeMap<String, ApprovedFunction>) -> Self {
        Self { functions }
    }
}

#[async_trait]
impl ToolInvoker for LocalFunctionInvoker {
    async fn execute(
        &self,
        tool: &ToolDefinition,
        args: &JsonValue,
        _user_id: &str,
        _transaction_id: &str,
    ) -> Result<JsonValue, ToolError> {
        if tool.implementation.kind != "local" {
            return Err(ToolError::new(
                ErrorCategory::Unknown,
                format!(
                    "tool '{}' has a '{}' implementation; only local tools run in-process",
                    tool.name, tool.implementation.kind
                ),
            ));
        }
        let name = tool.implementation.function.as_deref().unwrap_or(&tool.name);
        let function = self.functions.get(name).ok_or_else(|| {
            ToolError::new(
                ErrorCategory::Unknown,
                format!("function '{}' is not approved", name),
            )
        })?;
        function(args)
    }
}

/* ===================== Validation ===================== */

/// Checks a set of definitions, returning one message per problem
pub trait FlowValidator: Send + Sync {
    fn validate(&self, flows: &FlowLibrary, tools: &ToolRegistry) -> Vec<String>;
}

/// Verifies that FLOW targets and CALL-TOOL tools exist
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceValidator;

impl FlowValidator for ReferenceValidator {
    fn validate(&self, flows: &FlowLibrary, tools: &ToolRegistry) -> Vec<String> {
        let mut problems = Vec::new();
        for flow in flows.iter() {
            if flow.steps.is_empty() {
                problems.push(format!("flow '{}' has no steps", flow.name));
            }
            for step in &flow.steps {
                check_references(&flow.name, step, flows, tools, &mut problems);
            }
        }
        problems
    }
}

fn check_references(
    flow: &str,
    step: &FlowStep,
    flows: &FlowLibrary,
    tools: &ToolRegistry,
    problems: &mut Vec<String>,
) {
    match step {
        FlowStep::Flow(call) => {
            if flows.get(&call.flow).is_none() {
                problems.push(format!("flow '{}' calls unknown flow '{}'", flow, call.flow));
            }
        }
        FlowStep::CallTool(call) => {
            if tools.get(&call.tool).is_none() {
                problems.push(format!("flow '{}' uses unknown tool '{}'", flow, call.tool));
            }
            if let Some(on_fail) = &call.on_fail {
                check_references(flow, on_fail, flows, tools, problems);
            }
        }
        FlowStep::Switch(switch) => {
            for branch in &switch.branches {
                check_references(flow, &branch.step, flows, tools, problems);
            }
        }
        FlowStep::Case(case) => {
            for branch in &case.branches {
                check_references(flow, &branch.step, flows, tools, problems);
            }
        }
        FlowStep::Set(set) if set.variable.is_empty() => {
            problems.push(format!("flow '{}' has a SET step without a variable", flow));
        }
        _ => {}
    }
}
