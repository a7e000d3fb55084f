//! Opt-in log output for tests and small tools.
//!
//! The crate only emits `tracing` events; installing a subscriber is up to the application. With the `tracing`
//! feature enabled, [`init`] installs a formatting subscriber filtered by `RUST_LOG`.

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a global `fmt` subscriber when `RUST_LOG` is set. Repeated calls, or a subscriber installed elsewhere,
/// are not an error.
pub fn init() {
    INIT.call_once(|| {
        if env::var_os("RUST_LOG").is_none() {
            return;
        }

        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let filter = tracing_subscriber::EnvFilter::from_default_env();
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();

        if installed.is_ok() {
            tracing::info!("Tracing initialized");
        }
    });
}
