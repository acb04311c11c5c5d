//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of loopguard's product output.
//!
//! - **Mission history (`io/memory`)**: JSONL records under `.loopguard/`,
//!   plus per-attempt agent logs. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` if unset. `verbose` raises the
/// default to `loopguard=info`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=loopguard=debug loopguard run --goal "fix the tests"
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "warn,loopguard=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
