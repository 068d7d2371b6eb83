//! Stable exit codes for stager CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed: bad arguments, state-machine violation, agent failure,
/// or any other error.
pub const INVALID: i32 = 1;
