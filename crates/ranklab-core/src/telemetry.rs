//! Tracing initialisation shared by ranklab binaries.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` applies to ranklab crates
/// while the HTTP stack (`hyper`, `reqwest`) is capped at `warn` so batch
/// runs do not drown replication events in connection chatter.
/// With `json` the output is newline-delimited JSON for log pipelines.
/// Calling this more than once is harmless; only the first call binds
/// the global subscriber.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,reqwest=warn", level.as_str()))
    });

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}
