//! Stable exit codes for `run-engine` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments, config or store contents, or any other error.
pub const INVALID: i32 = 1;
/// The requested run, session or file does not exist.
pub const NOT_FOUND: i32 = 2;
