use tracing_subscriber::{fmt, EnvFilter};

/// Installs the JSON log formatter, filtered through `RUST_LOG`.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .try_init();
}
