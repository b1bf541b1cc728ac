//! Step handlers
//!
//! Each handler runs the step on top of the current frame. Handlers pop their
//! own step (SAY-GET only once its input has arrived) and may push a branch
//! or fail-handler step to run next.

use serde_json::{json, Value as JsonValue};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::exec_loop::{activate_flow, fail_frames, ExecContext, Step};
use crate::collaborators::ToolError;
use crate::config::GuidancePosition;
use crate::error::{EngineError, EngineResult};
use crate::expression::{render_value, EvalScope, Evaluator, PseudoVariables};
use crate::flows::{
    localized_text, CallToolStep, CaseGuard, CaseStep, FlowCallStep, FlowStep, SayGetStep,
    SayStep, SetStep, SwitchStep, ToolDefinition,
};
use crate::messages;
use crate::session::{FlowFrame, SessionContext};
use crate::transaction::sanitize::{sanitize_text, sanitize_value};
use crate::transaction::{
    classify_failure, ErrorCategory, RetryConfig, RetryDecision, RetryDefaults, StepLogEntry,
    StepStatus, Transaction,
};
use crate::types::{CallType, ContextEntry, Role};

/* ===================== Frame Access ===================== */

fn current_frame(session: &SessionContext) -> EngineResult<&FlowFrame> {
    session
        .flow_stacks
        .current_frame()
        .ok_or_else(|| EngineError::Internal("no active frame".to_string()))
}

fn current_frame_mut(session: &mut SessionContext) -> EngineResult<&mut FlowFrame> {
    session
        .flow_stacks
        .current_frame_mut()
        .ok_or_else(|| EngineError::Internal("no active frame".to_string()))
}

/// Evaluate against the current frame's variables and the session pseudo-variables
fn with_scope<T>(
    ctx: &ExecContext<'_>,
    f: impl FnOnce(&Evaluator, &EvalScope<'_>) -> T,
) -> EngineResult<T> {
    let frame = current_frame(ctx.session)?;
    let variables = ctx.session.variables(frame.scope)?;
    let scope = EvalScope::new(variables).with_pseudo(PseudoVariables {
        user_id: ctx.session.user_id.clone(),
        session_id: ctx.session.session_id.clone(),
        flow_name: frame.flow_name.clone(),
        language: ctx.engine.settings.language.clone(),
    });
    Ok(f(&ctx.engine.evaluator, &scope))
}

fn store_variable(ctx: &mut ExecContext<'_>, name: &str, value: JsonValue) -> EngineResult<()> {
    let scope = current_frame(ctx.session)?.scope;
    ctx.session
        .variables_mut(scope)?
        .insert(name.to_string(), value);
    Ok(())
}

fn log_step(ctx: &mut ExecContext<'_>, entry: StepLogEntry) -> EngineResult<()> {
    current_frame_mut(ctx.session)?.transaction.log_step(entry)?;
    Ok(())
}

/// Pop the step that just ran and log its success
fn finish_step(ctx: &mut ExecContext<'_>, step_id: &str, step_type: &str) -> EngineResult<()> {
    current_frame_mut(ctx.session)?.pop_step();
    log_step(ctx, StepLogEntry::new(step_id, step_type, StepStatus::Success))
}

/* ===================== Messages ===================== */

pub(crate) fn execute_say(ctx: &mut ExecContext<'_>, step: &SayStep) -> EngineResult<Step> {
    let template = localized_text(&step.value, &step.localized, &ctx.engine.settings.language);
    let text = with_scope(ctx, |evaluator, scope| evaluator.interpolate(template, scope))?;

    let frame = current_frame_mut(ctx.session)?;
    frame.record(ContextEntry::assistant(text.clone()));
    frame.last_say_message = Some(text.clone());
    ctx.say(text);

    finish_step(ctx, &step.id, "SAY")?;
    Ok(Step::Continue)
}

pub(crate) fn execute_say_get(ctx: &mut ExecContext<'_>, step: &SayGetStep) -> EngineResult<Step> {
    // Input has arrived for the prompt shown on an earlier turn
    let waiting = current_frame(ctx.session)?.pending_variable.clone();
    if let Some(variable) = waiting {
        if let Some(input) = ctx.input.take() {
            store_variable(ctx, &variable, JsonValue::String(input))?;
            current_frame_mut(ctx.session)?.pending_variable = None;
            finish_step(ctx, &step.id, "SAY-GET")?;
            return Ok(Step::Continue);
        }
    }

    let template = localized_text(&step.value, &step.localized, &ctx.engine.settings.language);
    let text = with_scope(ctx, |evaluator, scope| evaluator.interpolate(template, scope))?;
    let guidance = &ctx.engine.settings.guidance;
    let hint = guidance
        .enabled
        .then(|| ctx.message(messages::GUIDANCE, &[]));

    let frame = current_frame_mut(ctx.session)?;
    let message = match hint {
        // The resumption message already carries the guidance
        Some(_) if frame.just_resumed => text.clone(),
        Some(hint) => match guidance.position {
            GuidancePosition::Prepend => format!("{}\n\n{}", hint, text),
            GuidancePosition::Append => format!("{}\n\n{}", text, hint),
        },
        None => text.clone(),
    };
    frame.just_resumed = false;
    frame.record(ContextEntry::assistant(text.clone()));
    frame.last_say_message = Some(text);

    match &step.variable {
        Some(variable) => frame.pending_variable = Some(variable.clone()),
        None => finish_step(ctx, &step.id, "SAY-GET")?,
    }
    ctx.say(message);
    Ok(Step::Blocked)
}

/* ===================== Variables & Branching ===================== */

pub(crate) fn execute_set(ctx: &mut ExecContext<'_>, step: &SetStep) -> EngineResult<Step> {
    let value = with_scope(ctx, |evaluator, scope| {
        evaluator.resolve_value(&step.value, scope)
    })?;
    store_variable(ctx, &step.variable, value)?;
    finish_step(ctx, &step.id, "SET")?;
    Ok(Step::Continue)
}

/// Replace the branching step with the chosen branch's step
fn take_branch(
    ctx: &mut ExecContext<'_>,
    step_id: &str,
    step_type: &str,
    branch: FlowStep,
) -> EngineResult<Step> {
    finish_step(ctx, step_id, step_type)?;
    current_frame_mut(ctx.session)?.push_step(branch);
    Ok(Step::Continue)
}

pub(crate) fn execute_switch(ctx: &mut ExecContext<'_>, step: &SwitchStep) -> EngineResult<Step> {
    let frame = current_frame(ctx.session)?;
    let value = ctx
        .session
        .variables(frame.scope)?
        .get(&step.variable)
        .cloned()
        .unwrap_or(JsonValue::Null);

    // Exact, case-sensitive match on strings and numbers only
    let key = match &value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(_) => Some(render_value(&value)),
        _ => None,
    };
    let matched = key.as_deref().and_then(|key| {
        step.branches
            .iter()
            .find(|branch| branch.key != "default" && branch.key == key)
    });
    let chosen = matched.or_else(|| step.branches.iter().find(|b| b.key == "default"));

    match chosen {
        Some(branch) => take_branch(ctx, &step.id, "SWITCH", branch.step.clone()),
        None => Err(EngineError::NoMatchingBranch {
            step: "SWITCH",
            detail: format!("{} = {}", step.variable, value),
        }),
    }
}

pub(crate) fn execute_case(ctx: &mut ExecContext<'_>, step: &CaseStep) -> EngineResult<Step> {
    let chosen = with_scope(ctx, |evaluator, scope| {
        let mut fallback = None;
        for branch in &step.branches {
            match &branch.guard {
                CaseGuard::Condition(condition) => {
                    if evaluator.evaluate_condition(condition, scope) {
                        return Some(branch.step.clone());
                    }
                }
                CaseGuard::Default => {
                    if fallback.is_none() {
                        fallback = Some(branch.step.clone());
                    }
                }
            }
        }
        fallback
    })?;

    match chosen {
        Some(branch) => take_branch(ctx, &step.id, "CASE", branch),
        None => Err(EngineError::NoMatchingBranch {
            step: "CASE",
            detail: "every condition".to_string(),
        }),
    }
}

/* ===================== Tools ===================== */

pub(crate) async fn execute_call_tool(
    ctx: &mut ExecContext<'_>,
    step: &CallToolStep,
) -> EngineResult<Step> {
    let engine = ctx.engine;
    let Some(tool) = engine.tools.get(&step.tool) else {
        let error = ToolError::new(
            ErrorCategory::Unknown,
            format!("tool '{}' is not defined", step.tool),
        );
        return handle_tool_failure(ctx, step, error, 0).await;
    };

    let args = match &step.args {
        Some(args) => Ok(with_scope(ctx, |evaluator, scope| {
            evaluator.resolve_value(args, scope)
        })?),
        None => infer_arguments(ctx, tool).await,
    };

    let frame = current_frame(ctx.session)?;
    let transaction_id = frame.transaction.id.clone();
    let started = Instant::now();
    let outcome = match args {
        Ok(args) => {
            let call = engine
                .invoker
                .execute(tool, &args, &ctx.session.user_id, &transaction_id);
            match tool.timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
                    .await
                    .unwrap_or_else(|_| {
                        Err(ToolError::timeout(format!("no response within {}ms", ms)))
                    }),
                None => call.await,
            }
        }
        Err(error) => Err(error),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let result = match outcome {
        Ok(result) => result,
        Err(error) => return handle_tool_failure(ctx, step, error, duration_ms).await,
    };

    if let Some(variable) = &step.variable {
        store_variable(ctx, variable, result.clone())?;
    }
    let frame = current_frame_mut(ctx.session)?;
    frame.pop_step();
    frame.record(ContextEntry::new(
        Role::Tool,
        format!("{}: {}", tool.name, sanitize_value(&result)),
    ));
    log_step(
        ctx,
        StepLogEntry::new(&step.id, "CALL-TOOL", StepStatus::Success)
            .with_tool(&tool.name)
            .with_result(result)
            .with_duration(duration_ms)
            .with_retry_count(step.retry_count),
    )?;
    Ok(Step::Continue)
}

/// Retry, hand over to `onFail`, or cancel the current flow
async fn handle_tool_failure(
    ctx: &mut ExecContext<'_>,
    step: &CallToolStep,
    error: ToolError,
    duration_ms: u64,
) -> EngineResult<Step> {
    let settings = &ctx.engine.settings;
    let defaults = RetryDefaults {
        max_retries: settings.default_max_retries,
        base_delay_ms: settings.retry_base_delay_ms,
    };
    let flow_name = current_frame(ctx.session)?.flow_name.clone();
    let action = classify_failure(error.category, &step.tool, &flow_name);
    let entry = |status| {
        StepLogEntry::new(&step.id, "CALL-TOOL", status)
            .with_tool(&step.tool)
            .with_error(error.to_string())
            .with_duration(duration_ms)
            .with_retry_count(step.retry_count)
    };

    if let RetryDecision::Retry { delay } =
        RetryConfig::decide(step.retry.as_ref(), defaults, step.retry_count, action)
    {
        warn!(
            tool = %step.tool,
            error = %error,
            attempt = step.retry_count + 1,
            delay_ms = delay.as_millis() as u64,
            "Tool failed, retrying"
        );
        log_step(ctx, entry(StepStatus::Retrying))?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut retried = step.clone();
        retried.retry_count += 1;
        let frame = current_frame_mut(ctx.session)?;
        frame.pop_step();
        frame.push_step(FlowStep::CallTool(retried));
        return Ok(Step::Continue);
    }

    log_step(ctx, entry(StepStatus::Failed))?;
    if let Some(variable) = &step.variable {
        store_variable(ctx, variable, json!(format!("Error: {}", error.message)))?;
    }
    let frame = current_frame_mut(ctx.session)?;
    frame.pop_step();
    frame.record(ContextEntry::new(
        Role::Tool,
        sanitize_text(&format!("{} failed: {}", step.tool, error)),
    ));

    if let Some(on_fail) = &step.on_fail {
        info!(tool = %step.tool, "Running onFail handler");
        frame.push_step((**on_fail).clone());
        return Ok(Step::Continue);
    }

    warn!(tool = %step.tool, flow = %flow_name, category = %error.category, "Cancelling flow");
    if let Some(frame) = ctx.session.flow_stacks.pop() {
        fail_frames(vec![frame], &format!("tool '{}' failed: {}", step.tool, error));
    }
    let text = ctx.message(
        messages::TOOL_FAILED,
        &[("tool", &step.tool), ("flow", &flow_name)],
    );
    ctx.say(text);
    Ok(Step::Continue)
}

/// Ask the AI for arguments matching the tool's parameter schema
async fn infer_arguments(
    ctx: &ExecContext<'_>,
    tool: &ToolDefinition,
) -> Result<JsonValue, ToolError> {
    let has_parameters = tool
        .parameters
        .get("properties")
        .and_then(JsonValue::as_object)
        .map(|props| !props.is_empty())
        .unwrap_or(false);
    if !has_parameters {
        return Ok(json!({}));
    }

    let frame = current_frame(ctx.session).map_err(|e| ToolError::generation(e.to_string()))?;
    let variables = ctx
        .session
        .variables(frame.scope)
        .map_err(|e| ToolError::generation(e.to_string()))?;
    let instruction = format!(
        "Generate the arguments for the tool '{}' ({}). Reply with a single JSON object \
         matching this parameter schema and nothing else:\n{}",
        tool.name, tool.description, tool.parameters
    );
    let conversation: Vec<String> = frame
        .context_stack
        .iter()
        .rev()
        .take(6)
        .rev()
        .map(|entry| format!("{}: {}", entry.role, entry.content))
        .collect();
    let user_message = format!(
        "Known values: {}\nRecent conversation:\n{}",
        JsonValue::Object(variables.clone()),
        conversation.join("\n")
    );

    let reply = ctx
        .engine
        .ask_ai(&instruction, &user_message)
        .await
        .map_err(|e| ToolError::generation(e.to_string()))?;
    match super::interruption::parse_json_reply(&reply) {
        Some(JsonValue::Object(args)) => Ok(JsonValue::Object(args)),
        _ => Err(ToolError::generation(format!(
            "could not read arguments for '{}' from the model reply",
            tool.name
        ))),
    }
}

/* ===================== Sub-flows ===================== */

pub(crate) fn execute_flow(ctx: &mut ExecContext<'_>, step: &FlowCallStep) -> EngineResult<Step> {
    let engine = ctx.engine;
    let Some(definition) = engine.flows.get(&step.flow) else {
        warn!(flow = %step.flow, call_type = %step.call_type, "Flow not found");
        if step.call_type == CallType::Reboot {
            let discarded = ctx.session.flow_stacks.reset();
            fail_frames(discarded, "rebooted");
        } else {
            finish_step(ctx, &step.id, "FLOW")?;
        }
        let text = ctx.message(messages::FLOW_NOT_FOUND, &[("flow", &step.flow)]);
        ctx.say(text);
        return Ok(Step::Continue);
    };
    let hash = engine
        .flows
        .fingerprint(&definition.name)
        .unwrap_or_default()
        .to_string();
    let user_id = ctx.session.user_id.clone();

    match step.call_type {
        CallType::Call => {
            let limit = engine.settings.max_stack_depth;
            if ctx.session.flow_stacks.current_depth() >= limit {
                return Err(EngineError::RecursionLimit { limit });
            }
            finish_step(ctx, &step.id, "FLOW")?;

            let parent = current_frame(ctx.session)?;
            let scope = parent.scope;
            let initiator = format!("flow:{}", parent.flow_name);
            let variables = ctx.session.variables_mut(scope)?;
            for (name, value) in &definition.variables {
                variables.entry(name.clone()).or_insert_with(|| value.clone());
            }

            let transaction = Transaction::begin(&definition.name, initiator, user_id);
            info!(flow = %definition.name, transaction_id = %transaction.id, "Calling sub-flow");
            ctx.session
                .flow_stacks
                .push(FlowFrame::new(definition, hash, scope, transaction));
        }
        CallType::Replace => {
            finish_step(ctx, &step.id, "FLOW")?;
            let frame = current_frame(ctx.session)?;
            let scope = frame.scope;
            let initiator = format!("replace:{}", frame.flow_name);
            let variables = ctx.session.variables_mut(scope)?;
            for (name, value) in &definition.variables {
                variables.entry(name.clone()).or_insert_with(|| value.clone());
            }

            let transaction = Transaction::begin(&definition.name, initiator, user_id);
            let frame = current_frame_mut(ctx.session)?;
            let mut previous = frame.replace_flow(definition, hash, transaction);
            if previous.is_active() {
                previous.fail("replaced")?;
            }
            info!(
                from = %previous.flow_name,
                flow = %definition.name,
                "Replaced flow"
            );
            frame.replaced_transactions.push(previous);
        }
        CallType::Reboot => {
            let discarded = ctx.session.flow_stacks.reset();
            fail_frames(discarded, "rebooted");
            activate_flow(ctx, definition, "reboot");
        }
    }
    Ok(Step::Continue)
}
