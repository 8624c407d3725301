//! Budgeted multi-role code-modification agent.
//!
//! A run drives a closed set of roles (planner, researcher, coder, verifier,
//! janitor, retrospective, ticket closer) through an explicit transition table
//! until it reaches a terminal status. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (transitions, budget governor,
//!   stuck detection, diagnostics, patching, tolerant JSON). No I/O, fully
//!   testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, processes, role
//!   invocation, reports). Isolated behind traits to enable doubles in tests.
//!
//! Orchestration modules ([`start`], [`step`], [`looping`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
