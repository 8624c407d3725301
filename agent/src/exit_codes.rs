//! Stable exit codes for agent CLI commands.

/// Command succeeded or the run finished with `done`.
pub const OK: i32 = 0;
/// Command failed due to invalid input/config/state or other errors.
pub const INVALID: i32 = 1;
/// The run ended in `aborted_stuck` (step or loop ceiling, no progress).
pub const ABORTED_STUCK: i32 = 3;
/// The run ended in `aborted_constraint` (budget exhausted).
pub const ABORTED_CONSTRAINT: i32 = 4;
/// The run stopped to ask a human.
pub const ASK_HUMAN: i32 = 5;
/// The wall-clock budget ran out before a terminal status.
pub const CANCELLED: i32 = 6;
