use tracing_subscriber::EnvFilter;

/// Wires the process-global subscriber for hosts that embed the engine
/// without logging of their own. `RUST_LOG` overrides `default_level`.
/// Output is line-delimited JSON with event fields flattened, so the
/// `room = ...` / `participant = ...` fields the engine attaches land as
/// top-level keys for the log shipper.
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_env_filter(filter)
        .init();
}
