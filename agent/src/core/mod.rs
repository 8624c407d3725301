//! Deterministic, pure logic shared by the agent core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod diagnostics;
pub mod patch;
pub mod path;
pub mod progress;
pub mod role_output;
pub mod state;
pub mod tolerant_json;
pub mod transitions;
pub mod types;
