//! Tracing setup shared by the node binary and tests.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a `fmt` subscriber filtered by `RUST_LOG`, `info` when unset.
///
/// Returns false if a global subscriber was already installed, so tests may
/// call it repeatedly.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_ok()
}

/// Like [`init_tracing`] but with JSON lines output.
pub fn init_tracing_json() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        assert!(!init_tracing());
        assert!(!init_tracing_json());
    }
}
