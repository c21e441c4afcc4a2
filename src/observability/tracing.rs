//! Tracing setup.
//!
//! Configures structured logging with:
//! - Environment-based filter, falling back to the configured level
//! - Target, thread and source location on every event
//! - Plain text or JSON lines on stderr

use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Initialize tracing for the creditflow binaries.
///
/// `RUST_LOG` wins when set; otherwise `log_level` applies globally with
/// debug output for this crate.
///
/// # Arguments
///
/// * `log_level` - Default level when `RUST_LOG` is unset
/// * `json` - Emit JSON lines instead of human-readable text
///
/// # Panics
///
/// Panics if tracing has already been initialized.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    tracing_subscriber::registry()
        .with(fmt_layer(json))
        .with(filter)
        .init();

    tracing::info!(log_level, json, "Tracing initialized");
}

fn fmt_layer(json: bool) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

fn default_directives(log_level: &str) -> String {
    format!("{log_level},creditflow=debug")
}

/// Initialize tracing for tests (only logs errors).
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("error")
        .with_test_writer()
        .try_init();
}
