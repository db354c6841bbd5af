use anyhow::Context as _;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Initializes the process-wide tracing subscriber.
///
/// The directive from the configuration file takes precedence; `JIMM_LOG`
/// overrides both, matching the usual environment escape hatch.
pub fn init(directive: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("JIMM_LOG")
        .or_else(|_| EnvFilter::try_new(directive.unwrap_or("info")))
        .context("invalid log directive")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to set the global tracing subscriber")?;

    Ok(())
}
