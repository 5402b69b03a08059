//! natmap (lib.rs)
//!
//! NAT port mapping over PCP, NAT-PMP and UPnP-IGD, with gateway probing,
//! automatic lease refresh and migration when host addresses change.

#![warn(clippy::all)]

pub mod nat;

// Re-export main types
pub use nat::{
    GatewayLocator, Mapping, MappingEvent, MappingHandle, MappingId, MappingManager,
    MappingProtocol, MappingState, PortMapConfig, ProbeOutcome, TransportProtocol,
};

// Re-export error types
pub use nat::error::{NatError, NatResult};

/// Crate version, also used in the default UPnP mapping description
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error)
///
/// `RUST_LOG` takes precedence when set. Calling it twice is harmless.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{filter::Directive, fmt, prelude::*, EnvFilter};

    let mut filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Reduce verbosity of some dependencies
    for directive in ["tokio=warn", "runtime=warn", "hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    let installed = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true),
        )
        .with(filter)
        .try_init();

    if installed.is_err() {
        tracing::debug!("Logging was already initialized");
    }
}

/// Host addresses eligible for port mapping and the gateway each would probe
///
/// # Returns
/// A formatted string, one line per private IPv4 address
pub fn network_info() -> String {
    use nat::addresses::{AddressSource, InterfaceAddresses};

    let locator = GatewayLocator::default();
    let addresses = InterfaceAddresses.private_ipv4_addrs();

    let mut info = format!("natmap v{}\nPrivate addresses:", VERSION);
    if addresses.is_empty() {
        info.push_str("\n  none found");
    }
    for address in addresses {
        match locator.best_match(address) {
            Some(gateway) => info.push_str(&format!("\n  {} -> gateway {}", address, gateway)),
            None => info.push_str(&format!("\n  {} -> no candidate gateway", address)),
        }
    }
    info
}

/// Check if the current build ships the reqwest HTTP transport
pub const fn has_http_transport() -> bool {
    cfg!(feature = "http-transport")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_network_info() {
        let info = network_info();
        assert!(info.starts_with("natmap v"));
        assert!(info.contains("Private addresses:"));
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug");
        init_logging("info");
    }

    #[test]
    fn test_feature_detection() {
        assert_eq!(has_http_transport(), cfg!(feature = "http-transport"));
    }
}
