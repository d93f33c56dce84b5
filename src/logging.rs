//! Tracing subscriber setup for the binary.
//!
//! `RUST_LOG` selects the filter (default given by the caller). With the
//! `chrome-trace` feature, `VRTRACER_TRACE=1` additionally records a Chrome
//! trace to `trace.json` until the returned guard is dropped.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable enabling the Chrome trace layer.
pub const TRACE_ENV: &str = "VRTRACER_TRACE";

/// Keep alive for the lifetime of the program; flushes the trace on drop.
#[must_use]
pub struct LogGuard {
    #[cfg(feature = "chrome-trace")]
    _chrome: Option<tracing_chrome::FlushGuard>,
}

fn chrome_requested() -> bool {
    std::env::var(TRACE_ENV).ok().as_deref() == Some("1")
}

/// Install the global subscriber. A second call leaves the first in place.
pub fn init(default_filter: &str) -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    #[cfg(feature = "chrome-trace")]
    {
        let (chrome, guard) = if chrome_requested() {
            let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new().file("trace.json").build();
            (Some(layer), Some(guard))
        } else {
            (None, None)
        };
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .with(chrome)
            .try_init();
        LogGuard { _chrome: guard }
    }

    #[cfg(not(feature = "chrome-trace"))]
    {
        if chrome_requested() {
            eprintln!("{TRACE_ENV}=1 ignored: built without the chrome-trace feature");
        }
        let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
        LogGuard {}
    }
}
