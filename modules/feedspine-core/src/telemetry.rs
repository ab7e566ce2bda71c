use tracing_subscriber::EnvFilter;

/// Initialize logging for binaries and integration tests.
///
/// Honors `RUST_LOG`, defaulting the `feedspine` crates to info.
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::from_default_env()
        .add_directive("feedspine=info".parse().expect("static directive parses"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
