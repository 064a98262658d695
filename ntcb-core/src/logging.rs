use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. `RUST_LOG` wins over `default_directive`.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    // a second init (tests, embedded use) is harmless
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
