//! Core execution loop
//!
//! `run_until_blocked()` drives `step()` until a SAY-GET suspends the turn or
//! no frames remain, then flushes the accumulated output as one response.

use tracing::{debug, error, info, warn};

use super::steps;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::flows::{FlowDefinition, FlowStep};
use crate::messages;
use crate::session::{FlowFrame, SessionContext};
use crate::transaction::Transaction;

/* ===================== Execution Context ===================== */

/// Everything one turn of execution touches
pub(crate) struct ExecContext<'a> {
    pub engine: &'a Engine,
    pub session: &'a mut SessionContext,
    /// User input not yet consumed by a waiting SAY-GET
    pub input: Option<String>,
    pub steps_taken: usize,
}

impl<'a> ExecContext<'a> {
    pub fn new(engine: &'a Engine, session: &'a mut SessionContext, input: Option<String>) -> Self {
        Self {
            engine,
            session,
            input,
            steps_taken: 0,
        }
    }

    pub fn message(&self, key: &str, args: &[(&str, &str)]) -> String {
        self.engine
            .messages
            .format(&self.engine.settings.language, key, args)
    }

    pub fn say(&mut self, text: String) {
        self.session.global_accumulated_messages.push(text);
    }
}

/// Result of executing one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Run the next step
    Continue,
    /// A prompt is waiting for user input
    Blocked,
    /// No frames remain
    Done,
}

/* ===================== Public API ===================== */

/// Run until the turn blocks or completes and return the response text
pub(crate) async fn run_until_blocked(ctx: &mut ExecContext<'_>) -> Option<String> {
    loop {
        match step(ctx).await {
            Ok(Step::Continue) => continue,
            Ok(Step::Blocked) => break,
            Ok(Step::Done) => {
                if ctx.session.global_accumulated_messages.is_empty() {
                    let text = ctx.message(messages::FLOW_COMPLETED, &[]);
                    ctx.say(text);
                }
                break;
            }
            Err(err) => {
                let budget_exhausted = matches!(err, EngineError::StepBudgetExceeded { .. });
                abort_current_level(ctx, &err);
                if budget_exhausted {
                    break;
                }
            }
        }
    }
    ctx.session.collect_scopes();
    ctx.session.flush_messages()
}

/// Execute one step
///
/// Finishes exhausted frames, resumes interrupted levels when the current
/// one empties, and otherwise dispatches the top step of the current frame.
pub(crate) async fn step(ctx: &mut ExecContext<'_>) -> EngineResult<Step> {
    let Some(frame) = ctx.session.flow_stacks.current_frame() else {
        if ctx.session.flow_stacks.level_count() > 1 {
            resume_previous_level(ctx)?;
            return Ok(Step::Continue);
        }
        return Ok(Step::Done);
    };

    ctx.steps_taken += 1;
    let limit = ctx.engine.settings.max_steps_per_turn;
    if ctx.steps_taken > limit {
        return Err(EngineError::StepBudgetExceeded { limit });
    }

    let Some(next) = frame.peek_step().cloned() else {
        complete_current_frame(ctx)?;
        return Ok(Step::Continue);
    };

    debug!(
        flow = %frame.flow_name,
        step_id = %next.id(),
        step_type = next.type_name(),
        "Executing step"
    );

    match next {
        FlowStep::Say(say) => steps::execute_say(ctx, &say),
        FlowStep::SayGet(say_get) => steps::execute_say_get(ctx, &say_get),
        FlowStep::Set(set) => steps::execute_set(ctx, &set),
        FlowStep::Switch(switch) => steps::execute_switch(ctx, &switch),
        FlowStep::Case(case) => steps::execute_case(ctx, &case),
        FlowStep::CallTool(call) => steps::execute_call_tool(ctx, &call).await,
        FlowStep::Flow(call) => steps::execute_flow(ctx, &call),
    }
}

/* ===================== Frame Lifecycle ===================== */

/// Push a root frame for `definition` with a fresh scope seeded from the
/// session globals and the flow's declared variables
pub(crate) fn activate_flow(
    ctx: &mut ExecContext<'_>,
    definition: &FlowDefinition,
    initiator: &str,
) {
    let mut variables = ctx.session.global_variables.clone();
    for (name, value) in &definition.variables {
        variables.insert(name.clone(), value.clone());
    }
    let scope = ctx.session.scopes.allocate(variables);
    let transaction = Transaction::begin(&definition.name, initiator, &ctx.session.user_id);
    let hash = ctx
        .engine
        .flows
        .fingerprint(&definition.name)
        .unwrap_or_default()
        .to_string();

    info!(
        flow = %definition.name,
        transaction_id = %transaction.id,
        initiator,
        "Activated flow"
    );
    ctx.session
        .flow_stacks
        .push(FlowFrame::new(definition, hash, scope, transaction));
}

/// Pop a finished frame and complete its transaction
fn complete_current_frame(ctx: &mut ExecContext<'_>) -> EngineResult<()> {
    let Some(mut frame) = ctx.session.flow_stacks.pop() else {
        return Ok(());
    };
    if frame.transaction.is_active() {
        frame.transaction.complete()?;
    }
    info!(
        flow = %frame.flow_name,
        transaction_id = %frame.transaction.id,
        steps = frame.transaction.steps.len(),
        "Flow completed"
    );
    Ok(())
}

/// Close the empty innermost level and wake the frame it interrupted
pub(crate) fn resume_previous_level(ctx: &mut ExecContext<'_>) -> EngineResult<()> {
    let mut closed = ctx.session.flow_stacks.switch_to_previous_stack()?;
    fail_frames(closed.drain(), "abandoned");

    let user_id = ctx.session.user_id.clone();
    let Some(frame) = ctx.session.flow_stacks.current_frame_mut() else {
        return Ok(());
    };
    frame.just_resumed = true;
    if !frame.transaction.is_active() {
        frame.transaction = Transaction::begin(&frame.flow_name, "resume", user_id);
    }
    let flow_name = frame.flow_name.clone();

    info!(flow = %flow_name, "Resuming interrupted flow");
    let text = ctx.message(messages::RESUMING, &[("flow", &flow_name)]);
    ctx.say(text);
    Ok(())
}

/// Drop every frame of the current level after a fatal error
fn abort_current_level(ctx: &mut ExecContext<'_>, err: &EngineError) {
    error!(error = %err, "Flow execution failed");
    let frames = ctx.session.flow_stacks.current_stack_mut().drain();
    fail_frames(frames, &err.to_string());

    let key = match err {
        EngineError::RecursionLimit { .. } => messages::RECURSION_LIMIT,
        _ => messages::GENERIC_ERROR,
    };
    let text = ctx.message(key, &[]);
    ctx.say(text);
}

/// Mark the transactions of discarded frames failed
pub(crate) fn fail_frames(frames: Vec<FlowFrame>, reason: &str) {
    for mut frame in frames {
        if frame.transaction.is_active() {
            if let Err(err) = frame.transaction.fail(reason) {
                warn!(error = %err, "Could not close transaction");
            }
        }
        info!(
            flow = %frame.flow_name,
            transaction_id = %frame.transaction.id,
            reason,
            "Discarded flow"
        );
    }
}
