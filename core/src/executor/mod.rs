//! Flow execution
//!
//! Executes the top step of the current frame until a prompt blocks, the
//! session runs out of frames, or an error aborts the current interruption
//! level. All state lives in the `SessionContext`, so a suspended turn is
//! resumed simply by calling in again with the next input.

pub(crate) mod exec_loop;
pub(crate) mod interruption;
pub(crate) mod steps;

#[cfg(test)]
mod tests;

pub use interruption::Command;
