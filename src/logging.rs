//! Tracing subscriber setup.
//!
//! Logs go to stderr so reports written to stdout stay machine-readable.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "crossfire=debug,warn" } else { "crossfire=info,warn" }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(verbose: bool, json: bool) {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr).with_current_span(false))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("crossfire: logging already configured: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(false), "crossfire=info,warn");
        assert_eq!(default_directive(true), "crossfire=debug,warn");
    }

    #[test]
    fn test_init_is_idempotent() {
        init(false, false);
        init(true, true);
        assert!(INITIALIZED.load(Ordering::SeqCst));
    }
}
