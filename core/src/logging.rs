//! Subscriber setup for hosts that do not install their own.
//!
//! The library only emits `tracing` events; this helper is a convenience for
//! binaries embedding the client.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global fmt subscriber. `filter` uses `EnvFilter` syntax and
/// falls back to `info` when it does not parse. Returns `false` if a global
/// subscriber was already installed.
pub fn init_tracing(filter: &str, json: bool) -> bool {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .try_init()
            .is_ok()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_refused() {
        init_tracing("apilink_core=debug", false);
        assert!(!init_tracing("not a [valid filter", true));
        tracing::debug!("subscriber installed");
    }
}
