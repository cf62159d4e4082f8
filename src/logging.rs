use std::env;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// Filtering follows `RUST_LOG` (default `info`). `KVSTORE_LOG_FORMAT=json`
/// switches to JSON lines; anything else gives compact human-readable output.
/// Logs go to stderr so they never mix with REPL output.
pub fn init() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match env::var("KVSTORE_LOG_FORMAT").as_deref() {
        Ok("json") => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
        _ => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
    }

    Ok(())
}
