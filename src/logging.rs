use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT_LOGGING: Once = Once::new();

/// Install the global `tracing` subscriber. Safe to call more than once.
///
/// Filter precedence: `RUST_LOG`, then `RVREMOTE_LOG`, then the level implied
/// by the `-v` count.
pub fn init(verbosity: u8) {
    INIT_LOGGING.call_once(|| {
        let default_level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(std::env::var("RVREMOTE_LOG").unwrap_or_else(|_| default_level.into())))
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        let stderr_layer = fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr);

        let _ = tracing_subscriber::registry().with(filter).with(stderr_layer).try_init();
    });
}
