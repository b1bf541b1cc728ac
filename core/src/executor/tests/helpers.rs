//! Test helpers for engine scenario tests
//!
//! A scripted AI client, a scripted tool invoker, and helpers that drive a
//! session through JSON the way a host persisting it would.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::collaborators::{AiClient, ToolError, ToolInvoker};
use crate::config::EngineSettings;
use crate::engine::{Engine, EngineBuilder};
use crate::flows::{parse_flow, ToolDefinition};
use crate::session::{FlowFrame, SessionContext};
use crate::types::ContextEntry;

/* ===================== AI ===================== */

/// Replies by matching substrings of the user message, in registration order
#[derive(Clone, Default)]
pub struct MockAi {
    routes: Vec<(String, String)>,
}

impl MockAi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify messages containing `needle` as a strong intent for `flow`
    pub fn intent(self, needle: &str, flow: &str) -> Self {
        self.reply(needle, &json!({"flow": flow, "strength": "strong"}).to_string())
    }

    pub fn reply(mut self, needle: &str, reply: &str) -> Self {
        self.routes.push((needle.to_string(), reply.to_string()));
        self
    }
}

#[async_trait]
impl AiClient for MockAi {
    async fn complete(&self, _system_instruction: &str, user_message: &str) -> anyhow::Result<String> {
        let reply = self
            .routes
            .iter()
            .find(|(needle, _)| user_message.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| json!({"flow": null, "strength": "none"}).to_string());
        Ok(reply)
    }
}

/* ===================== Tools ===================== */

/// Plays back scripted results per tool; the last result repeats
#[derive(Clone, Default)]
pub struct ScriptedInvoker {
    scripts: BTreeMap<String, Vec<Result<JsonValue, ToolError>>>,
    calls: Arc<Mutex<Vec<(String, JsonValue)>>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, tool: &str, results: Vec<Result<JsonValue, ToolError>>) -> Self {
        self.scripts.insert(tool.to_string(), results);
        self
    }

    pub fn calls(&self) -> Arc<Mutex<Vec<(String, JsonValue)>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn execute(
        &self,
        tool: &ToolDefinition,
        args: &JsonValue,
        _user_id: &str,
        _transaction_id: &str,
    ) -> Result<JsonValue, ToolError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((tool.name.clone(), args.clone()));
            calls.iter().filter(|(name, _)| *name == tool.name).count()
        };
        let script = self
            .scripts
            .get(&tool.name)
            .expect("no script for tool");
        script[(attempt - 1).min(script.len() - 1)].clone()
    }
}

/// Number of invocations recorded for `tool`
pub fn attempts(calls: &Arc<Mutex<Vec<(String, JsonValue)>>>, tool: &str) -> usize {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(name, _)| name == tool)
        .count()
}

pub fn tool(value: JsonValue) -> ToolDefinition {
    serde_json::from_value(value).expect("invalid tool definition")
}

/* ===================== Engine & Session ===================== */

/// Settings with retry delays disabled so tests do not sleep
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        retry_base_delay_ms: 0,
        ..Default::default()
    }
}

/// Builder preloaded with flows parsed from JSON and fast settings
pub fn builder(flows: Vec<JsonValue>, ai: MockAi) -> EngineBuilder {
    let flows = flows
        .into_iter()
        .map(|flow| parse_flow(flow).expect("invalid flow"))
        .collect();
    Engine::builder()
        .flows(flows)
        .ai_client(ai)
        .settings(fast_settings())
}

pub fn engine(flows: Vec<JsonValue>, ai: MockAi) -> Engine {
    builder(flows, ai).build().expect("engine build failed")
}

/// Serialize and deserialize the session, as a host storing it would
pub fn round_trip(session: SessionContext) -> SessionContext {
    let json = serde_json::to_string(&session).expect("Session serialization failed");
    let restored: SessionContext =
        serde_json::from_str(&json).expect("Session deserialization failed");
    assert_eq!(restored, session);
    restored
}

/// Send one user message and return the response with the persisted session
pub async fn send(
    engine: &Engine,
    session: SessionContext,
    text: &str,
) -> (Option<String>, SessionContext) {
    let outcome = engine
        .update_activity(ContextEntry::user(text), session)
        .await
        .expect("update_activity failed");
    (outcome.response, round_trip(outcome.session))
}

pub fn current_frame(session: &SessionContext) -> &FlowFrame {
    session
        .flow_stacks
        .current_frame()
        .expect("no active frame")
}

pub fn variable(session: &SessionContext, name: &str) -> Option<JsonValue> {
    let frame = current_frame(session);
    session
        .variables(frame.scope)
        .expect("missing scope")
        .get(name)
        .cloned()
}
