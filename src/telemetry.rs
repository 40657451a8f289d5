use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// The level comes from `RUST_LOG`, defaulting to `info`. Calling this
/// twice is harmless; the second call keeps the first subscriber.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
