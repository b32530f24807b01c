use tracing_subscriber::EnvFilter;

use crate::Error;

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,idp_core=debug,idp_op=debug";

/// Log to stderr; stdout carries command output.
pub fn init() -> Result<(), Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Custom(format!("failed to initialise logging: {e}")))
}
