// SPDX-License-Identifier: PolyForm-Shield-1.0

use tracing_subscriber::EnvFilter;

/// Default directive when neither `RUST_LOG` nor an explicit level is given.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` (e.g. `"debug"` or
/// `"neuron=debug,info"`) is used, falling back to [`DEFAULT_DIRECTIVE`].
/// Calling this twice is harmless: the second install is ignored.
pub fn init_tracing(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or(DEFAULT_DIRECTIVE)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
