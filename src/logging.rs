use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. The filter comes from `RUST_LOG` and
/// defaults to `info`.
///
/// # Errors
///
/// Returns an error when a global subscriber is already installed.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(true)).try_init()?;
    Ok(())
}
