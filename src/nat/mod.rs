// src/nat/mod.rs
//! NAT port mapping
//!
//! Gateway discovery, NAT-PMP/PCP/UPnP clients, protocol probing and the
//! mapping lifecycle manager.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod addresses;
pub mod codec;
pub mod deadline;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod port_forwarding;
pub mod probe;
pub mod transport;

pub use addresses::{AddressChange, AddressSource, AddressTracker, InterfaceAddresses};
pub use error::{NatError, NatResult};
pub use gateway::GatewayLocator;
pub use manager::{MappingEvent, MappingHandle, MappingManager};
pub use port_forwarding::{
    Mapping, MappingId, MappingProtocol, MappingState, PortMappingClient, TransportProtocol,
};
pub use probe::{ProbeCoordinator, ProbeOutcome};
pub use transport::{DatagramSocket, HttpTransport, SoapReply, TokioUdpTransport, UdpTransport};

#[cfg(feature = "http-transport")]
pub use transport::ReqwestHttpTransport;

/// Local UDP ports the probes are sent from, one per protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbePorts {
    pub natpmp: u16,
    pub pcp: u16,
    pub upnp: u16,
}

impl Default for ProbePorts {
    fn default() -> Self {
        Self {
            natpmp: 55555,
            pcp: 55556,
            upnp: 55557,
        }
    }
}

impl ProbePorts {
    pub fn port_for(&self, protocol: MappingProtocol) -> u16 {
        match protocol {
            MappingProtocol::NatPmp => self.natpmp,
            MappingProtocol::Pcp => self.pcp,
            MappingProtocol::Upnp => self.upnp,
        }
    }
}

/// Port mapping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMapConfig {
    /// Protocols to probe, most preferred first
    pub protocol_priority: Vec<MappingProtocol>,

    pub probe_ports: ProbePorts,

    /// Lifetime of the throwaway probe mapping, in seconds
    pub probe_lifetime: u32,

    /// Well-known router addresses matched against host addresses
    pub gateway_table: Vec<Ipv4Addr>,

    pub natpmp_timeout: Duration,
    pub pcp_timeout: Duration,
    pub upnp_timeout: Duration,

    /// Share of the granted lifetime after which a mapping is refreshed
    pub refresh_fraction: f64,

    pub min_refresh_interval: Duration,

    /// Extra attempts after a refresh times out
    pub refresh_retries: u32,

    /// First retry delay; doubles per attempt
    pub refresh_backoff: Duration,

    pub address_poll_interval: Duration,

    /// Transport of the mapped ports
    pub transport: TransportProtocol,

    /// UPnP `NewPortMappingDescription`
    pub description: String,

    /// External ports tried after a UPnP conflict before giving up
    pub upnp_conflict_retries: u16,
}

impl Default for PortMapConfig {
    fn default() -> Self {
        Self {
            protocol_priority: MappingProtocol::ALL.to_vec(),
            probe_ports: ProbePorts::default(),
            probe_lifetime: 120,
            gateway_table: gateway::COMMON_GATEWAYS.to_vec(),
            natpmp_timeout: Duration::from_secs(3),
            pcp_timeout: Duration::from_secs(5),
            upnp_timeout: Duration::from_secs(5),
            refresh_fraction: 0.5,
            min_refresh_interval: Duration::from_secs(5),
            refresh_retries: 3,
            refresh_backoff: Duration::from_secs(1),
            address_poll_interval: Duration::from_secs(30),
            transport: TransportProtocol::Udp,
            description: format!("natmap/{}", crate::VERSION),
            upnp_conflict_retries: 10,
        }
    }
}

impl PortMapConfig {
    pub fn timeout_for(&self, protocol: MappingProtocol) -> Duration {
        match protocol {
            MappingProtocol::NatPmp => self.natpmp_timeout,
            MappingProtocol::Pcp => self.pcp_timeout,
            MappingProtocol::Upnp => self.upnp_timeout,
        }
    }

    pub fn validate(&self) -> NatResult<()> {
        if self.protocol_priority.is_empty() {
            return Err(NatError::Configuration(
                "protocol priority list is empty".to_string(),
            ));
        }

        let ports = [
            self.probe_ports.natpmp,
            self.probe_ports.pcp,
            self.probe_ports.upnp,
        ];
        if ports.contains(&0) {
            return Err(NatError::Configuration(
                "probe ports must be nonzero".to_string(),
            ));
        }
        if ports[0] == ports[1] || ports[0] == ports[2] || ports[1] == ports[2] {
            return Err(NatError::Configuration(format!(
                "probe ports must be distinct, got {:?}",
                ports
            )));
        }

        if !(self.refresh_fraction > 0.0 && self.refresh_fraction < 1.0) {
            return Err(NatError::Configuration(format!(
                "refresh fraction {} is outside (0, 1)",
                self.refresh_fraction
            )));
        }

        for protocol in MappingProtocol::ALL {
            if self.timeout_for(protocol).is_zero() {
                return Err(NatError::Configuration(format!(
                    "{} timeout must be nonzero",
                    protocol
                )));
            }
        }

        if self.address_poll_interval.is_zero() {
            return Err(NatError::Configuration(
                "address poll interval must be nonzero".to_string(),
            ));
        }

        Ok(())
    }
}
