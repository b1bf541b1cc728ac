//! Tests for CALL-TOOL: invocation, retries, onFail and cancellation

use super::helpers::*;
use crate::collaborators::ToolError;
use crate::engine::Engine;
use crate::types::Role;
use crate::transaction::{StepStatus, TransactionState};
use serde_json::{json, Value as JsonValue};

fn weather_tool() -> JsonValue {
    json!({
        "name": "get_weather",
        "description": "Current weather for a city",
        "parameters": {
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        },
        "implementation": {"type": "http", "url": "https://weather.example/api"}
    })
}

fn weather_flow(tool_step: JsonValue) -> JsonValue {
    json!({
        "name": "Weather",
        "variables": {"city": "Paris"},
        "steps": [
            tool_step,
            {"type": "SAY", "value": "Forecast: {{weather.summary}}"},
        ]
    })
}

fn weather_engine(flow: JsonValue, invoker: ScriptedInvoker, ai: MockAi) -> Engine {
    builder(vec![flow], ai.intent("weather", "Weather"))
        .tools(vec![tool(weather_tool())])
        .tool_invoker(invoker)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_tool_result_is_stored() {
    let invoker = ScriptedInvoker::new().script("get_weather", vec![Ok(json!({"summary": "sunny"}))]);
    let calls = invoker.calls();
    let flow = weather_flow(json!({
        "type": "CALL-TOOL",
        "tool": "get_weather",
        "args": {"city": "{{city}}"},
        "variable": "weather"
    }));
    let engine = weather_engine(flow, invoker, MockAi::new());
    let session = engine.init_session("u1", None);

    let (response, _) = send(&engine, session, "weather please").await;

    assert_eq!(response.as_deref(), Some("Forecast: sunny"));
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, json!({"city": "Paris"}));
}

#[tokio::test]
async fn test_retry_bound_then_cancel() {
    let invoker =
        ScriptedInvoker::new().script("get_weather", vec![Err(ToolError::network("connection reset"))]);
    let calls = invoker.calls();
    let flow = weather_flow(json!({
        "type": "CALL-TOOL",
        "tool": "get_weather",
        "args": {"city": "{{city}}"},
        "variable": "weather",
        "retry": {"maxRetries": 2}
    }));
    let engine = weather_engine(flow, invoker, MockAi::new());
    let session = engine.init_session("u1", None);

    let (response, session) = send(&engine, session, "weather please").await;

    assert_eq!(attempts(&calls, "get_weather"), 3);
    assert_eq!(
        response.as_deref(),
        Some("Sorry, I couldn't complete get_weather, so I stopped Weather. Please try again later.")
    );
    assert!(session.flow_stacks.is_idle());
}

#[tokio::test]
async fn test_retry_bound_then_on_fail() {
    let invoker = ScriptedInvoker::new().script("get_weather", vec![Err(ToolError::http(503, "down"))]);
    let calls = invoker.calls();
    let flow = json!({
        "name": "Weather",
        "variables": {"city": "Paris"},
        "steps": [
            {
                "type": "CALL-TOOL",
                "tool": "get_weather",
                "args": {"city": "{{city}}"},
                "variable": "weather",
                "retry": {"maxRetries": 2, "delayMs": 0},
                "onFail": {"type": "SAY", "value": "Backup plan ({{weather}})"}
            },
            {"type": "SAY", "value": "still running"},
        ]
    });
    let engine = weather_engine(flow, invoker, MockAi::new());
    let session = engine.init_session("u1", None);

    let (response, _) = send(&engine, session, "weather please").await;

    assert_eq!(attempts(&calls, "get_weather"), 3);
    assert_eq!(
        response.as_deref(),
        Some("Backup plan (Error: down)\n\nstill running")
    );
}

#[tokio::test]
async fn test_transient_failure_then_success_is_logged() {
    let invoker = ScriptedInvoker::new().script(
        "get_weather",
        vec![Err(ToolError::timeout("slow")), Ok(json!({"summary": "rain"}))],
    );
    let calls = invoker.calls();
    let flow = json!({
        "name": "Weather",
        "variables": {"city": "Paris"},
        "steps": [
            {"type": "CALL-TOOL", "tool": "get_weather", "args": {"city": "{{city}}"}, "variable": "weather"},
            {"type": "SAY-GET", "value": "Forecast: {{weather.summary}}. Anything else?", "variable": "more"},
        ]
    });
    let engine = weather_engine(flow, invoker, MockAi::new());
    let session = engine.init_session("u1", None);

    let (response, session) = send(&engine, session, "weather please").await;

    assert_eq!(attempts(&calls, "get_weather"), 2);
    assert_eq!(response.as_deref(), Some("Forecast: rain. Anything else?"));
    let statuses: Vec<StepStatus> = current_frame(&session)
        .transaction
        .steps
        .iter()
        .filter(|entry| entry.step_type == "CALL-TOOL")
        .map(|entry| entry.status)
        .collect();
    assert_eq!(statuses, vec![StepStatus::Retrying, StepStatus::Success]);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let invoker = ScriptedInvoker::new().script("get_weather", vec![Err(ToolError::http(404, "no city"))]);
    let calls = invoker.calls();
    let flow = weather_flow(json!({
        "type": "CALL-TOOL",
        "tool": "get_weather",
        "args": {"city": "{{city}}"},
        "variable": "weather"
    }));
    let engine = weather_engine(flow, invoker, MockAi::new());
    let session = engine.init_session("u1", None);

    let _ = send(&engine, session, "weather please").await;

    assert_eq!(attempts(&calls, "get_weather"), 1);
}

#[tokio::test]
async fn test_financial_tools_fail_closed() {
    let transfer = json!({
        "name": "transfer_funds",
        "implementation": {"type": "http"}
    });
    let invoker = ScriptedInvoker::new().script("transfer_funds", vec![Err(ToolError::network("reset"))]);
    let calls = invoker.calls();
    let flow = json!({
        "name": "Payout",
        "steps": [
            {"type": "CALL-TOOL", "tool": "transfer_funds", "args": {}, "retry": {"maxRetries": 5}},
            {"type": "SAY", "value": "never shown"},
        ]
    });
    let engine = builder(vec![flow], MockAi::new().intent("pay", "Payout"))
        .tools(vec![tool(transfer)])
        .tool_invoker(invoker)
        .build()
        .unwrap();
    let session = engine.init_session("u1", None);

    let (response, _) = send(&engine, session, "pay my friend").await;

    assert_eq!(attempts(&calls, "transfer_funds"), 1);
    assert!(response.unwrap().contains("I stopped Payout"));
}

#[tokio::test]
async fn test_arguments_inferred_by_ai() {
    let invoker = ScriptedInvoker::new().script("get_weather", vec![Ok(json!({"summary": "clear"}))]);
    let calls = invoker.calls();
    let flow = weather_flow(json!({
        "type": "CALL-TOOL",
        "tool": "get_weather",
        "variable": "weather"
    }));
    let ai = MockAi::new().reply("Known values", "```json\n{\"city\": \"Rome\"}\n```");
    let engine = weather_engine(flow, invoker, ai);
    let session = engine.init_session("u1", None);

    let (response, _) = send(&engine, session, "weather please").await;

    assert_eq!(response.as_deref(), Some("Forecast: clear"));
    assert_eq!(calls.lock().unwrap()[0].1, json!({"city": "Rome"}));
}

#[tokio::test]
async fn test_local_tool_runs_approved_function() {
    let doubler = json!({
        "name": "double",
        "implementation": {"type": "local", "function": "double"}
    });
    let flow = json!({
        "name": "Math",
        "steps": [
            {"type": "CALL-TOOL", "tool": "double", "args": {"n": 21}, "variable": "result"},
            {"type": "SAY", "value": "Result: {{result}}"},
        ]
    });
    let engine = builder(vec![flow], MockAi::new().intent("math", "Math"))
        .tools(vec![tool(doubler)])
        .approved_function("double", |args: &JsonValue| {
            let n = args.get("n").and_then(JsonValue::as_i64).unwrap_or(0);
            Ok(json!(n * 2))
        })
        .build()
        .unwrap();
    let session = engine.init_session("u1", None);

    let (response, _) = send(&engine, session, "math time").await;

    assert_eq!(response.as_deref(), Some("Result: 42"));
}

#[tokio::test]
async fn test_undefined_tool_cancels_flow() {
    let flow = json!({
        "name": "Broken",
        "steps": [
            {"type": "CALL-TOOL", "tool": "nowhere", "args": {}},
            {"type": "SAY", "value": "never shown"},
        ]
    });
    let engine = engine(vec![flow], MockAi::new().intent("go", "Broken"));
    let session = engine.init_session("u1", None);

    let (response, _) = send(&engine, session, "go").await;

    assert_eq!(
        response.as_deref(),
        Some("Sorry, I couldn't complete nowhere, so I stopped Broken. Please try again later.")
    );
}

/* ===================== onFail Sub-flows ===================== */

/// Weather whose tool always fails and hands over to the Recovery flow
fn recovery_engine(call_type: &str) -> Engine {
    let invoker = ScriptedInvoker::new().script("get_weather", vec![Err(ToolError::http(400, "down"))]);
    let flow = json!({
        "name": "Weather",
        "variables": {"city": "Paris"},
        "steps": [
            {
                "type": "CALL-TOOL",
                "tool": "get_weather",
                "args": {"city": "{{city}}"},
                "variable": "weather",
                "onFail": {"type": "FLOW", "value": "Recovery", "callType": call_type}
            },
            {"type": "SAY", "value": "back in Weather, answer={{answer}}"},
        ]
    });
    let recovery = json!({
        "name": "Recovery",
        "variables": {"attempted": true},
        "steps": [
            {"type": "SAY-GET", "value": "city=[{{city}}] weather=[{{weather}}]", "variable": "answer"},
        ]
    });
    builder(vec![flow, recovery], MockAi::new().intent("weather", "Weather"))
        .tools(vec![tool(weather_tool())])
        .tool_invoker(invoker)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_on_fail_call_runs_handler_on_same_stack() {
    let engine = recovery_engine("call");
    let session = engine.init_session("u1", None);

    let (response, session) = send(&engine, session, "weather please").await;

    assert_eq!(response.as_deref(), Some("city=[Paris] weather=[Error: down]"));
    assert_eq!(session.flow_stacks.level_count(), 1);
    assert_eq!(session.flow_stacks.current_depth(), 2);
    let names: Vec<&str> = session.flow_stacks.frames().map(|f| f.flow_name.as_str()).collect();
    assert_eq!(names, vec!["Weather", "Recovery"]);
    let scopes: Vec<_> = session.flow_stacks.frames().map(|f| f.scope).collect();
    assert_eq!(scopes[0], scopes[1]);
    assert_eq!(current_frame(&session).transaction.initiator, "flow:Weather");

    // The handler's answer lands in the shared scope and Weather resumes
    let (response, session) = send(&engine, session, "ok").await;
    assert_eq!(response.as_deref(), Some("back in Weather, answer=ok"));
    assert!(session.flow_stacks.is_idle());
}

#[tokio::test]
async fn test_on_fail_replace_swaps_flow_and_keeps_variables() {
    let engine = recovery_engine("replace");
    let session = engine.init_session("u1", None);

    let (response, session) = send(&engine, session, "weather please").await;

    assert_eq!(response.as_deref(), Some("city=[Paris] weather=[Error: down]"));
    assert_eq!(session.flow_stacks.level_count(), 1);
    assert_eq!(session.flow_stacks.current_depth(), 1);
    let frame = current_frame(&session);
    assert_eq!(frame.flow_name, "Recovery");
    assert_eq!(frame.transaction.initiator, "replace:Weather");
    assert_eq!(variable(&session, "city"), Some(json!("Paris")));
    assert_eq!(variable(&session, "attempted"), Some(json!(true)));

    let replaced = &frame.replaced_transactions;
    assert_eq!(replaced.len(), 1);
    assert_eq!(replaced[0].flow_name, "Weather");
    assert_eq!(replaced[0].state, TransactionState::Failed);
    assert_eq!(replaced[0].failure_reason.as_deref(), Some("replaced"));

    // Weather's remaining steps were dropped with it
    let (response, session) = send(&engine, session, "ok").await;
    assert_eq!(
        response.as_deref(),
        Some("All done. Is there anything else I can help you with?")
    );
    assert!(session.flow_stacks.is_idle());
}

#[tokio::test]
async fn test_on_fail_reboot_starts_handler_with_fresh_variables() {
    let engine = recovery_engine("reboot");
    let session = engine.init_session("u1", None);

    let (response, session) = send(&engine, session, "weather please").await;

    assert_eq!(response.as_deref(), Some("city=[] weather=[]"));
    assert_eq!(session.flow_stacks.level_count(), 1);
    assert_eq!(session.flow_stacks.total_frames(), 1);
    let frame = current_frame(&session);
    assert_eq!(frame.flow_name, "Recovery");
    assert_eq!(variable(&session, "city"), None);
    assert_eq!(variable(&session, "weather"), None);
    assert_eq!(variable(&session, "attempted"), Some(json!(true)));
    assert_eq!(session.scopes.len(), 1);
}

#[tokio::test]
async fn test_tool_result_is_redacted_in_context() {
    let invoker = ScriptedInvoker::new().script(
        "get_weather",
        vec![Ok(json!({"summary": "sunny", "token": "abc123", "auth": {"password": "pw"}}))],
    );
    let flow = json!({
        "name": "Weather",
        "variables": {"city": "Paris"},
        "steps": [
            {"type": "CALL-TOOL", "tool": "get_weather", "args": {"city": "{{city}}"}, "variable": "weather"},
            {"type": "SAY-GET", "value": "Forecast: {{weather.summary}}. Anything else?", "variable": "more"},
        ]
    });
    let engine = weather_engine(flow, invoker, MockAi::new());
    let session = engine.init_session("u1", None);

    let (_, session) = send(&engine, session, "weather please").await;

    let tool_entries: Vec<&str> = current_frame(&session)
        .context_stack
        .iter()
        .filter(|entry| entry.role == Role::Tool)
        .map(|entry| entry.content.as_str())
        .collect();
    assert_eq!(tool_entries.len(), 1);
    assert!(tool_entries[0].contains("[REDACTED]"));
    assert!(tool_entries[0].contains("sunny"));
    assert!(!tool_entries[0].contains("abc123"));
    assert!(!tool_entries[0].contains("\"pw\""));
    // The flow itself still sees the raw result
    assert_eq!(variable(&session, "weather").unwrap()["token"], json!("abc123"));
}
