//! Diagnostic tracing for the agent binary.
//!
//! Tracing output goes to stderr and is never persisted. The durable record
//! of a run is the iteration logs and the report under `.agent/`, which are
//! written regardless of the filter set here.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter applied when neither `AGENT_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "warn";

/// Agent-specific filter variable; wins over `RUST_LOG`.
pub const FILTER_ENV: &str = "AGENT_LOG";

/// Install the global subscriber: compact lines on stderr.
///
/// ```bash
/// AGENT_LOG=agent=debug agent run --goal "fix the flaky test"
/// ```
pub fn init() {
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = try_init();
}

/// Like [`init`], but reports whether a subscriber was already installed.
pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(filter_from(
            std::env::var(FILTER_ENV).ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        ))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
}

/// First parseable directive among `agent_log`, `rust_log`, then [`DEFAULT_FILTER`].
fn filter_from(agent_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    [agent_log, rust_log]
        .into_iter()
        .flatten()
        .filter(|raw| !raw.trim().is_empty())
        .find_map(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
