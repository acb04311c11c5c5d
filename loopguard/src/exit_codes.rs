//! Stable exit codes for loopguard CLI commands.

/// Mission succeeded, verification passed, or the command completed.
pub const OK: i32 = 0;
/// Mission failed (retries, budget or plan rejections exhausted) or
/// verification found a failing criterion.
pub const FAILED: i32 = 1;
/// Invalid config, contract or arguments, or any other error.
pub const INVALID: i32 = 2;
/// Mission interrupted by Ctrl-C; the working tree was left as-is.
pub const INTERRUPTED: i32 = 130;
