//! Logging setup for providers embedding the IAM engine.
//!
//! Batching decisions, conflict retries and principal lookups are logged
//! through `tracing`. These helpers install a subscriber that writes to
//! **stderr**, since a provider's stdout is reserved for the plugin handshake.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Controls log levels (e.g., `info`, `hcp_provider_iam=debug`)
//!
//! # Examples
//!
//! ```bash
//! # Show every batching decision
//! RUST_LOG=hcp_provider_iam=debug ./terraform-provider-hcp
//!
//! # Only conflicts and failures
//! RUST_LOG=hcp_provider_iam=warn ./terraform-provider-hcp
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
}

/// Initialize the default logging subscriber.
///
/// Respects `RUST_LOG` and defaults to `info`. Thread IDs are included
/// because batches execute on runtime worker threads rather than the thread
/// of the caller that queued them.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging() {
    init_logging_with_default("info");
}

/// Initialize logging with a custom default level used when `RUST_LOG` is unset.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn init_logging_with_default(default_level: &str) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(stderr_layer())
        .init();
}

/// Try to initialize logging, returning false if already initialized.
pub fn try_init_logging() -> bool {
    tracing_subscriber::registry()
        .with(filter("info"))
        .with(stderr_layer())
        .try_init()
        .is_ok()
}
