//! Per-session state: frames, interruption levels and variable scopes

mod context;
mod frame;
mod scope;
mod stacks;

pub use context::SessionContext;
pub use frame::{FlowFrame, PendingInterruption};
pub use scope::{ScopeArena, ScopeId, Variables};
pub use stacks::{CallStack, InterruptionStack, StackError};
