//! Engine scenario tests
//!
//! Every turn goes through `Engine::update_activity` and the session is
//! persisted through JSON between turns.

mod helpers;

mod session_tests;
mod tool_tests;
