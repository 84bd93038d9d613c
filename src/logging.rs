//! Logging to the terminal
//!
//! Two channels are kept apart by tracing target: `event` for things Discord told us about and
//! `internal` for the bot's own operations.  Filter with e.g. `RUST_LOG=internal=debug`.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[macro_export]
macro_rules! log_event {
    ($($args:tt)+) => {{
        ::tracing::info!(target: "event", $($args)+)
    }};
}

#[macro_export]
macro_rules! log_internal {
    ($($args:tt)+) => {{
        ::tracing::info!(target: "internal", $($args)+)
    }};
}

/// Shorten user-provided text before it goes into a log line.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_owned(),
    }
}
