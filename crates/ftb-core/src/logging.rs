use tracing_subscriber::{fmt, EnvFilter};

use crate::Result;

/// Initialize tracing for the process.
///
/// Default: info for our crates. Can be overridden with `RUST_LOG`.
/// A second call (e.g. from tests) leaves the first subscriber in place.
pub fn init(service_name: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "info,ftb=info,ftb_core=info,ftb_sqlite=info,ftb_openai=info,{service_name}=info"
        ))
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init();

    Ok(())
}
