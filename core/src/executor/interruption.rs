//! Universal commands and intent-driven interruptions
//!
//! Every user input that arrives while a flow is active passes through here
//! before it reaches the waiting prompt.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::exec_loop::{activate_flow, run_until_blocked, ExecContext};
use crate::error::EngineResult;
use crate::flows::FlowDefinition;
use crate::messages;
use crate::session::PendingInterruption;

/* ===================== Commands ===================== */

/// Inputs understood in every flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Cancel,
    Help,
    Status,
    /// Accept a pending interruption
    Switch,
    /// Decline a pending interruption
    Continue,
}

const SYNONYMS: &[(Command, &[&str])] = &[
    (
        Command::Cancel,
        &["cancel", "stop", "abort", "quit", "cancelar", "detener", "parar", "salir"],
    ),
    (Command::Help, &["help", "ayuda"]),
    (Command::Status, &["status", "where am i", "estado", "donde estoy", "dónde estoy"]),
    (Command::Switch, &["switch", "yes, switch", "cambiar", "cambia"]),
    (Command::Continue, &["continue", "keep going", "continuar", "seguir", "sigue"]),
];

/// Recognise a universal command, ignoring case and trailing punctuation
pub fn detect_command(input: &str) -> Option<Command> {
    let normalized = input
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .trim()
        .to_lowercase();
    SYNONYMS
        .iter()
        .find(|(_, words)| words.contains(&normalized.as_str()))
        .map(|(command, _)| *command)
}

/* ===================== Intent ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Strength {
    Strong,
    Weak,
    None,
}

#[derive(Debug, Deserialize)]
struct IntentReply {
    flow: Option<String>,
    #[serde(default = "default_strength")]
    strength: Strength,
}

fn default_strength() -> Strength {
    Strength::None
}

/// Pull a JSON value out of a model reply, tolerating code fences and prose
pub(crate) fn parse_json_reply(reply: &str) -> Option<JsonValue> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Ask the AI which flow, if any, the input asks for
async fn classify_intent<'e>(
    ctx: &ExecContext<'e>,
    input: &str,
    current_flow: Option<&str>,
) -> Option<(&'e FlowDefinition, Strength)> {
    let engine = ctx.engine;
    let menu: Vec<String> = engine
        .flows
        .iter()
        .map(|flow| format!("- {}: {}", flow.name, flow.description))
        .collect();
    let current = current_flow
        .map(|name| format!("The user is currently in the flow '{}'.", name))
        .unwrap_or_else(|| "No flow is active.".to_string());
    let instruction = format!(
        "You route user messages to conversational flows.\n{}\nAvailable flows:\n{}\n\
         Reply with JSON only: {{\"flow\": \"<flow name or null>\", \"strength\": \"strong|weak|none\"}}. \
         Use \"strong\" only when the message clearly asks to start that flow; answers to the \
         current question are \"none\".",
        current,
        menu.join("\n")
    );

    let reply = match engine.ask_ai(&instruction, input).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(error = %err, "Intent detection unavailable");
            return None;
        }
    };
    let parsed: IntentReply = match parse_json_reply(&reply).map(serde_json::from_value) {
        Some(Ok(parsed)) => parsed,
        _ => {
            debug!(reply = %reply, "Unreadable intent reply");
            return None;
        }
    };
    let definition = engine.flows.get(parsed.flow.as_deref()?)?;
    debug!(flow = %definition.name, strength = ?parsed.strength, "Detected intent");
    Some((definition, parsed.strength))
}

/* ===================== Turn Handling ===================== */

/// Start a flow for input received while the session is idle
pub(crate) async fn activate_from_input(
    ctx: &mut ExecContext<'_>,
    input: &str,
) -> EngineResult<Option<Option<String>>> {
    match classify_intent(ctx, input, None).await {
        Some((definition, Strength::Strong | Strength::Weak)) => {
            activate_flow(ctx, definition, "user");
            ctx.input = None;
            Ok(Some(run_until_blocked(ctx).await))
        }
        _ => Ok(None),
    }
}

/// Handle user input while a flow is active
pub(crate) async fn handle_active_input(ctx: &mut ExecContext<'_>) -> EngineResult<Option<String>> {
    let engine = ctx.engine;
    let input = ctx.input.clone().unwrap_or_default();
    let Some(frame) = ctx.session.flow_stacks.current_frame() else {
        return Ok(run_until_blocked(ctx).await);
    };
    let current_flow = frame.flow_name.clone();
    let pending = frame.pending_interruption.clone();

    match (detect_command(&input), pending) {
        (Some(Command::Cancel), _) => return Ok(cancel_current_level(ctx).await),
        (Some(Command::Help), _) => return Ok(Some(help(ctx))),
        (Some(Command::Status), _) => return Ok(Some(status(ctx))),
        (Some(Command::Switch), Some(pending)) => {
            clear_pending_interruption(ctx);
            if let Some(target) = engine.flows.get(&pending.target_flow) {
                return Ok(switch_to(ctx, target).await);
            }
        }
        (Some(Command::Continue), Some(_)) => {
            clear_pending_interruption(ctx);
            let text = ctx.message(messages::CONTINUING, &[("flow", &current_flow)]);
            ctx.say(text);
            ctx.input = None;
            return Ok(run_until_blocked(ctx).await);
        }
        // Anything else declines a pending interruption
        (_, Some(_)) => clear_pending_interruption(ctx),
        (_, None) => {}
    }

    if let Some((target, Strength::Strong)) = classify_intent(ctx, &input, Some(&current_flow)).await
    {
        if target.name != current_flow {
            let high_risk = engine
                .flows
                .get(&current_flow)
                .map(FlowDefinition::is_high_risk)
                .unwrap_or(false);
            if high_risk {
                return Ok(Some(request_confirmation(ctx, target, &current_flow)));
            }
            return Ok(switch_to(ctx, target).await);
        }
    }

    Ok(run_until_blocked(ctx).await)
}

/// Pause the current flow and run `target` on a new interruption level
async fn switch_to(ctx: &mut ExecContext<'_>, target: &FlowDefinition) -> Option<String> {
    if let Some(frame) = ctx.session.flow_stacks.current_frame_mut() {
        if frame.transaction.is_active() {
            if let Err(err) = frame.transaction.complete() {
                warn!(error = %err, "Could not pause transaction");
            }
        }
        // The waiting SAY-GET stays on the stack and prompts again on resume
        frame.pending_variable = None;
        frame.pending_interruption = None;
        info!(from = %frame.flow_name, to = %target.name, "Interrupting flow");
    }

    ctx.session.flow_stacks.create_new_stack();
    activate_flow(ctx, target, "interruption");
    ctx.input = None;
    run_until_blocked(ctx).await
}

fn request_confirmation(
    ctx: &mut ExecContext<'_>,
    target: &FlowDefinition,
    current_flow: &str,
) -> String {
    if let Some(frame) = ctx.session.flow_stacks.current_frame_mut() {
        frame.pending_interruption = Some(PendingInterruption {
            target_flow: target.name.clone(),
            requested_at: Utc::now(),
        });
    }
    info!(flow = %current_flow, target = %target.name, "Interruption needs confirmation");
    ctx.message(
        messages::SWITCH_CONFIRM,
        &[("flow", current_flow), ("target", &target.name)],
    )
}

fn clear_pending_interruption(ctx: &mut ExecContext<'_>) {
    if let Some(frame) = ctx.session.flow_stacks.current_frame_mut() {
        frame.pending_interruption = None;
    }
}

/// Roll back every frame of the current level and resume the level below
async fn cancel_current_level(ctx: &mut ExecContext<'_>) -> Option<String> {
    let frames = ctx.session.flow_stacks.current_stack_mut().drain();
    let Some(flow_name) = frames.last().map(|frame| frame.flow_name.clone()) else {
        let text = ctx.message(messages::NOTHING_TO_CANCEL, &[]);
        return Some(text);
    };

    for mut frame in frames {
        if frame.transaction.is_active() {
            if let Err(err) = frame.transaction.roll_back("cancelled by user") {
                warn!(error = %err, "Could not roll back transaction");
            }
        }
        info!(flow = %frame.flow_name, transaction_id = %frame.transaction.id, "Cancelled flow");
    }

    let text = ctx.message(messages::CANCELLED, &[("flow", &flow_name)]);
    ctx.say(text);
    ctx.input = None;
    run_until_blocked(ctx).await
}

fn help(ctx: &ExecContext<'_>) -> String {
    let Some(frame) = ctx.session.flow_stacks.current_frame() else {
        return ctx.message(messages::NOTHING_TO_CANCEL, &[]);
    };
    let description = ctx
        .engine
        .flows
        .get(&frame.flow_name)
        .map(|flow| flow.description.clone())
        .unwrap_or_default();
    let prompt = frame.last_say_message.clone().unwrap_or_default();
    let guidance = ctx.message(messages::GUIDANCE, &[]);
    let text = ctx.message(
        messages::HELP,
        &[
            ("flow", &frame.flow_name),
            ("description", &description),
            ("prompt", &prompt),
        ],
    );
    format!("{}\n\n{}", text.trim_end(), guidance)
}

fn status(ctx: &ExecContext<'_>) -> String {
    let stacks = &ctx.session.flow_stacks;
    let (flow, remaining) = stacks
        .current_frame()
        .map(|frame| (frame.flow_name.clone(), frame.remaining_steps()))
        .unwrap_or_default();
    ctx.message(
        messages::STATUS,
        &[
            ("flow", &flow),
            ("remaining", &remaining.to_string()),
            ("depth", &stacks.total_frames().to_string()),
        ],
    )
}
