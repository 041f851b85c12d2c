//! Diagnostic tracing for the orchestrator.
//!
//! Output goes to stderr so it never mixes with command output on stdout.
//! Task progress that users see is printed by `cmd/` from bus events.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. `verbose` adds `codeloop=debug`.
/// `json` switches from compact lines to JSON lines.
///
/// ```bash
/// RUST_LOG=codeloop::runner=trace codeloop exec main.js
/// ```
pub fn init(verbose: bool, json: bool) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if verbose && let Ok(directive) = "codeloop=debug".parse() {
        filter = filter.add_directive(directive);
    }

    let registry = tracing_subscriber::registry().with(filter);
    // A second init (tests, embedding) keeps the existing subscriber.
    let _ = if json {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init()
    };
}
