//! Tracing subscriber setup for hosts embedding the module.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "grpcmesh_core=info";

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `grpcmesh_core=info`.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init() -> bool {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.to_owned());
    init_with(&filter)
}

/// Install a global fmt subscriber with an explicit filter directive.
pub fn init_with(filter: &str) -> bool {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(EnvFilter::builder().parse_lossy(filter))
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        init_with("debug");
        assert!(!init_with("info"));
    }
}
