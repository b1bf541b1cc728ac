//! The stack-of-stacks holding every in-flight frame of a session
//!
//! The outer level is the interruption stack: level 0 is the original line
//! of work and each further level is a flow that interrupted the one below
//! it. Inside a level, a `CallStack` holds ordinary sub-flow calls. Only the
//! innermost level is ever executed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::FlowFrame;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StackError {
    #[error("cannot switch to a previous stack: only one stack remains")]
    OnlyOneStack,
}

/// Frames of one interruption level; the active frame is last
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct CallStack {
    frames: Vec<FlowFrame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: FlowFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<FlowFrame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&FlowFrame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut FlowFrame> {
        self.frames.last_mut()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> impl Iterator<Item = &FlowFrame> {
        self.frames.iter()
    }

    pub fn frames_mut(&mut self) -> impl Iterator<Item = &mut FlowFrame> {
        self.frames.iter_mut()
    }

    /// Remove every frame, innermost first
    pub fn drain(&mut self) -> Vec<FlowFrame> {
        let mut frames = std::mem::take(&mut self.frames);
        frames.reverse();
        frames
    }
}

/// Interruption levels. There is always at least one level.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionStack {
    root: CallStack,
    interruptions: Vec<CallStack>,
}

impl InterruptionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_stack(&self) -> &CallStack {
        self.interruptions.last().unwrap_or(&self.root)
    }

    pub fn current_stack_mut(&mut self) -> &mut CallStack {
        match self.interruptions.last_mut() {
            Some(stack) => stack,
            None => &mut self.root,
        }
    }

    pub fn push(&mut self, frame: FlowFrame) {
        self.current_stack_mut().push(frame);
    }

    pub fn pop(&mut self) -> Option<FlowFrame> {
        self.current_stack_mut().pop()
    }

    pub fn current_frame(&self) -> Option<&FlowFrame> {
        self.current_stack().top()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut FlowFrame> {
        self.current_stack_mut().top_mut()
    }

    /// Open a new interruption level and return its index
    pub fn create_new_stack(&mut self) -> usize {
        self.interruptions.push(CallStack::new());
        self.interruptions.len()
    }

    /// Close the innermost level, returning whatever frames it still held
    pub fn switch_to_previous_stack(&mut self) -> Result<CallStack, StackError> {
        self.interruptions.pop().ok_or(StackError::OnlyOneStack)
    }

    /// Frames on the current level
    pub fn current_depth(&self) -> usize {
        self.current_stack().len()
    }

    pub fn level_count(&self) -> usize {
        self.interruptions.len() + 1
    }

    pub fn total_frames(&self) -> usize {
        self.levels().map(CallStack::len).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.total_frames() == 0
    }

    pub fn levels(&self) -> impl Iterator<Item = &CallStack> {
        std::iter::once(&self.root).chain(self.interruptions.iter())
    }

    pub fn frames(&self) -> impl Iterator<Item = &FlowFrame> {
        self.levels().flat_map(CallStack::frames)
    }

    /// Collapse to a single empty level, returning every discarded frame
    pub fn reset(&mut self) -> Vec<FlowFrame> {
        let mut discarded = Vec::new();
        while let Some(mut level) = self.interruptions.pop() {
            discarded.extend(level.drain());
        }
        discarded.extend(self.root.drain());
        discarded
    }
}
