//! Logging setup for the switchboard binaries.
//!
//! `RUST_LOG` always wins over the configured default, so an operator can
//! raise verbosity per target without touching service configuration. Both
//! output formats go through the same filter resolution; only the
//! formatting layer differs.

use tracing_subscriber::{fmt, EnvFilter};

/// Resolve the active filter: `RUST_LOG` if set and parseable, otherwise
/// the service's configured directives (e.g. "info" or
/// "sb_worker=debug,warn").
fn build_filter(default_directives: &str) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(default_directives),
    }
}

/// Compact human-readable log lines, for interactive runs.
///
/// Installing a second subscriber is a no-op, so tests and binaries can
/// both call this freely; the `installed` field in the startup line says
/// whether this call actually took effect.
pub fn init_logging(service_name: &str, default_level: &str) {
    let installed = fmt()
        .compact()
        .with_env_filter(build_filter(default_level))
        .with_target(true)
        .try_init()
        .is_ok();

    tracing::info!(service = service_name, installed, format = "text", "log output ready");
}

/// JSON log lines with source locations, for deployments that ship logs
/// to an aggregator.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    let installed = fmt()
        .json()
        .with_env_filter(build_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .is_ok();

    tracing::info!(service = service_name, installed, format = "json", "log output ready");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init_logging("sb-test", "info");
        init_logging("sb-test", "debug");
        init_logging_json("sb-test", "info");
    }
}
