//! Subscriber bootstrap, owned by the binary-adjacent crate the way a
//! standalone front-end process owns its own logging setup.

/// Installs a `tracing_subscriber::fmt` subscriber honoring `RUST_LOG`
/// (defaulting to `info`). Idempotent: a second call is a harmless no-op
/// rather than a panic, since tests may run in the same process as a
/// binary that already initialized logging.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
