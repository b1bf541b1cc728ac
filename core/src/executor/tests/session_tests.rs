//! Tests for the session API contract and engine construction

use super::helpers::*;
use crate::collaborators::ToolError;
use crate::config::{EngineSettings, GuidancePosition, GuidanceSettings};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::flows::parse_flow;
use crate::session::ScopeArena;
use crate::types::{ContextEntry, Role};
use serde_json::{json, Value as JsonValue};
use tokio_test::assert_ok;

fn survey_flow() -> JsonValue {
    json!({
        "name": "Survey",
        "description": "Ask one question",
        "steps": [
            {"type": "SAY", "value": "Hello", "value_es": "Hola"},
            {"type": "SAY-GET", "value": "Rate us from 1 to 5", "prompt_es": "Califícanos del 1 al 5", "variable": "rating"},
        ]
    })
}

fn survey_engine() -> Engine {
    engine(vec![survey_flow()], MockAi::new().intent("survey", "Survey"))
}

#[tokio::test]
async fn test_init_session_seeds_globals() {
    let globals = json!({"tier": "gold"}).as_object().cloned().unwrap();
    let engine = builder(vec![survey_flow()], MockAi::new())
        .global_variables(globals)
        .build()
        .unwrap();

    let session = engine.init_session("u1", Some("s-1".to_string()));

    assert_eq!(session.session_id, "s-1");
    assert_eq!(session.user_id, "u1");
    assert_eq!(session.global_variables.get("tier"), Some(&json!("gold")));
    assert!(session.flow_stacks.is_idle());
}

#[tokio::test]
async fn test_assistant_entry_only_appends() {
    let engine = survey_engine();
    let session = engine.init_session("u1", None);
    let (_, session) = send(&engine, session, "start the survey").await;

    let depth = session.flow_stacks.total_frames();
    let frame = current_frame(&session);
    let remaining = frame.remaining_steps();
    let trail = frame.context_stack.len();

    let outcome = engine
        .update_activity(ContextEntry::assistant("(typing)"), session)
        .await
        .unwrap();
    let session = round_trip(outcome.session);

    assert_eq!(outcome.response, None);
    assert_eq!(session.flow_stacks.total_frames(), depth);
    let frame = current_frame(&session);
    assert_eq!(frame.remaining_steps(), remaining);
    assert_eq!(frame.pending_variable.as_deref(), Some("rating"));
    assert_eq!(frame.context_stack.len(), trail + 1);
    assert_eq!(frame.context_stack.last().unwrap().role, Role::Assistant);
}

#[tokio::test]
async fn test_other_roles_are_rejected() {
    let engine = survey_engine();
    let session = engine.init_session("u1", None);

    let err = engine
        .update_activity(ContextEntry::new(Role::Tool, "{}"), session)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::InvalidRole(role) if role == "tool"));
}

#[tokio::test]
async fn test_unmatched_input_records_chat_turn() {
    let engine = survey_engine();
    let session = engine.init_session("u1", None);

    let (response, session) = send(&engine, session, "just chatting").await;

    assert_eq!(response, None);
    assert!(session.flow_stacks.is_idle());
    assert_eq!(
        session.last_chat_turn.as_ref().map(|entry| entry.content.as_str()),
        Some("just chatting")
    );
    assert_eq!(session.history.len(), 1);
}

#[tokio::test]
async fn test_corrupt_session_fails_loudly() {
    let engine = survey_engine();
    let session = engine.init_session("u1", None);
    let (_, mut session) = send(&engine, session, "start the survey").await;
    session.scopes = ScopeArena::new();

    let err = engine
        .update_activity(ContextEntry::user("5"), session)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::SessionCorruption(_)));
}

#[tokio::test]
async fn test_localized_prompts() {
    let engine = builder(vec![survey_flow()], MockAi::new().intent("encuesta", "Survey"))
        .language("es")
        .build()
        .unwrap();
    let session = engine.init_session("u1", None);

    let (response, session) = send(&engine, session, "quiero la encuesta").await;
    assert_eq!(response.as_deref(), Some("Hola\n\nCalifícanos del 1 al 5"));

    let (response, _) = send(&engine, session, "cancelar").await;
    assert_eq!(response.as_deref(), Some("De acuerdo, cancelé Survey."));
}

#[tokio::test]
async fn test_guidance_is_appended_to_prompts() {
    let settings = EngineSettings {
        guidance: GuidanceSettings {
            enabled: true,
            position: GuidancePosition::Append,
        },
        ..fast_settings()
    };
    let engine = builder(vec![survey_flow()], MockAi::new().intent("survey", "Survey"))
        .settings(settings)
        .build()
        .unwrap();
    let session = engine.init_session("u1", None);

    let (response, session) = send(&engine, session, "start the survey").await;

    assert_eq!(
        response.as_deref(),
        Some("Hello\n\nRate us from 1 to 5\n\n(Say \"cancel\" to stop or \"help\" for options.)")
    );
    // The trail keeps the bare prompt
    assert_eq!(
        current_frame(&session).last_say_message.as_deref(),
        Some("Rate us from 1 to 5")
    );
}

#[test]
fn test_builder_requires_ai_client() {
    let err = Engine::builder().build().unwrap_err();
    assert!(matches!(err, EngineError::MissingAiClient));
}

#[test]
fn test_validate_on_init_reports_problems() {
    let flow = json!({
        "name": "Main",
        "steps": [{"type": "FLOW", "value": "Nowhere"}]
    });
    let err = builder(vec![flow], MockAi::new())
        .validate_on_init(true)
        .build()
        .unwrap_err();

    match err {
        EngineError::Validation(problems) => {
            assert_eq!(problems, vec!["flow 'Main' calls unknown flow 'Nowhere'".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    let ok = builder(vec![survey_flow()], MockAi::new())
        .validate_on_init(true)
        .build();
    assert_ok!(ok);
}

#[test]
fn test_duplicate_flows_are_rejected() {
    let flows = vec![
        parse_flow(survey_flow()).unwrap(),
        parse_flow(survey_flow()).unwrap(),
    ];
    let err = Engine::builder()
        .flows(flows)
        .ai_client(MockAi::new())
        .build()
        .unwrap_err();
    assert!(matches!(err, EngineError::Definition(_)));
}

#[tokio::test]
async fn test_ai_failure_is_not_fatal() {
    struct Offline;

    #[async_trait::async_trait]
    impl crate::collaborators::AiClient for Offline {
        async fn complete(&self, _: &str, _: &str) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("model unavailable"))
        }
    }

    let engine = Engine::builder()
        .flows(vec![parse_flow(survey_flow()).unwrap()])
        .ai_client(Offline)
        .approved_function("noop", |_: &JsonValue| Err(ToolError::network("unused")))
        .build()
        .unwrap();
    let session = engine.init_session("u1", None);

    let (response, session) = send(&engine, session, "start the survey").await;

    assert_eq!(response, None);
    assert!(session.flow_stacks.is_idle());
}
