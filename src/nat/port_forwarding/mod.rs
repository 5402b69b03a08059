// src/nat/port_forwarding/mod.rs
//! Port mapping clients for UPnP-IGD, NAT-PMP and PCP
//!
//! Implements:
//! - NAT-PMP (RFC 6886). Tracks the gateway's `server epoch` and reports
//!   regressions on refresh.
//! - PCP (RFC 6887) MAP requests with client nonces.
//! - UPnP-IGD v1 `AddPortMapping` / `DeletePortMapping` over SOAP.
//!
//! Every client negotiates a single mapping end to end and bounds each round
//! trip with [`crate::nat::deadline::race`].

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::nat::deadline::race;
use crate::nat::error::{NatError, NatResult};
use crate::nat::transport::DatagramSocket;

pub mod natpmp;
pub mod pcp;
pub mod upnp;

pub use natpmp::NatPmpClient;
pub use pcp::PcpClient;
pub use upnp::{ControlEndpoint, UpnpClient};

/// Port the NAT-PMP and PCP servers listen on
pub const GATEWAY_SERVER_PORT: u16 = 5351;

/// Largest datagram either protocol sends back
pub const MAX_RESPONSE_SIZE: usize = 1100;

/// Port mapping protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingProtocol {
    /// NAT Port Mapping Protocol (RFC 6886)
    NatPmp,

    /// Port Control Protocol (RFC 6887)
    Pcp,

    /// Universal Plug and Play Internet Gateway Device
    Upnp,
}

impl MappingProtocol {
    pub const ALL: [MappingProtocol; 3] = [Self::Pcp, Self::NatPmp, Self::Upnp];

    pub fn name(&self) -> &'static str {
        match self {
            Self::NatPmp => "NAT-PMP",
            Self::Pcp => "PCP",
            Self::Upnp => "UPnP-IGD",
        }
    }
}

impl fmt::Display for MappingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport protocol of the mapped port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
}

impl TransportProtocol {
    /// NAT-PMP mapping opcode
    pub fn natpmp_opcode(&self) -> u8 {
        match self {
            Self::Udp => 1,
            Self::Tcp => 2,
        }
    }

    /// IANA protocol number used by PCP
    pub fn iana_number(&self) -> u8 {
        match self {
            Self::Udp => 17,
            Self::Tcp => 6,
        }
    }

    /// `NewProtocol` argument for UPnP
    pub fn upnp_name(&self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
        }
    }
}

/// Registry identity of a mapping, stable across refresh and migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingId(uuid::Uuid);

impl MappingId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for MappingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingState {
    Requesting,
    Active,
    Refreshing,
    Expired,
    Deleted,
}

/// One port mapping and its lifecycle metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub id: MappingId,

    pub internal_ip: Ipv4Addr,
    pub internal_port: u16,

    /// Only PCP reports it
    pub external_ip: Option<IpAddr>,

    /// `None` until the gateway has assigned a port
    pub external_port: Option<u16>,

    /// Lifetime granted by the gateway, in seconds. 0 means permanent for
    /// UPnP; NAT-PMP and PCP never establish a mapping with it.
    pub lifetime: u32,

    /// Lifetime the caller asked for
    pub requested_lifetime: u32,

    pub protocol: MappingProtocol,
    pub transport: TransportProtocol,
    pub gateway: Ipv4Addr,

    /// PCP mapping nonce; required unmodified to refresh or delete
    pub nonce: Option<[u8; 12]>,

    /// Gateway epoch from the last NAT-PMP/PCP response
    pub epoch: Option<u32>,

    pub state: MappingState,

    /// Diagnostics for partial failures
    pub err_info: Option<String>,
}

impl Mapping {
    /// A mapping the gateway has not (yet) granted
    pub fn pending(request: &MappingRequest, protocol: MappingProtocol) -> Self {
        Self {
            id: MappingId::new(),
            internal_ip: request.internal_ip,
            internal_port: request.internal_port,
            external_ip: None,
            external_port: None,
            lifetime: 0,
            requested_lifetime: request.lifetime,
            protocol,
            transport: request.transport,
            gateway: request.gateway,
            nonce: None,
            epoch: None,
            state: MappingState::Requesting,
            err_info: None,
        }
    }

    pub fn is_established(&self) -> bool {
        self.external_port.is_some()
    }

    pub fn external_addr(&self) -> Option<SocketAddr> {
        match (self.external_ip, self.external_port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }

    /// A UPnP lease granted with lifetime 0 never lapses
    pub fn is_permanent(&self) -> bool {
        self.protocol == MappingProtocol::Upnp && self.lifetime == 0
    }

    /// Refresh window: `fraction` of the granted lifetime. The floor is
    /// capped one second short of the lifetime so it never fires too late.
    pub fn refresh_after(&self, fraction: f64, floor: Duration) -> Option<Duration> {
        if self.is_permanent() {
            return None;
        }
        let lifetime = Duration::from_secs(u64::from(self.lifetime));
        let floor = floor.min(lifetime.saturating_sub(Duration::from_secs(1)));
        let window = Duration::from_secs_f64(f64::from(self.lifetime) * fraction);
        Some(window.max(floor))
    }
}

/// Parameters of one negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRequest {
    pub gateway: Ipv4Addr,
    pub internal_ip: Ipv4Addr,
    pub internal_port: u16,
    pub lifetime: u32,
    pub transport: TransportProtocol,

    /// Local UDP port to send from: a protocol's probe port while probing,
    /// otherwise 0
    pub local_port: u16,
}

/// Shared capability of the three protocol clients
#[async_trait]
pub trait PortMappingClient: Send + Sync {
    fn protocol(&self) -> MappingProtocol;

    /// Negotiate a new mapping. UPnP may return an unestablished mapping
    /// carrying the remote fault in `err_info`.
    async fn create_mapping(&self, request: &MappingRequest) -> NatResult<Mapping>;

    async fn delete_mapping(&self, mapping: &Mapping) -> NatResult<()>;

    /// Extend a mapping in place; the returned value keeps the same identity
    async fn refresh_mapping(&self, mapping: &Mapping) -> NatResult<Mapping>;
}

/// NAT-PMP and PCP answer a granted lifetime of 0 when they dropped the
/// mapping instead of extending it
pub(crate) fn check_granted_lifetime(protocol: MappingProtocol, lifetime: u32) -> NatResult<()> {
    if lifetime == 0 {
        return Err(NatError::rejected(protocol, "gateway granted lifetime 0"));
    }
    Ok(())
}

/// Outcome of inspecting one inbound datagram
pub(crate) enum Inbound<T> {
    /// Not ours (wrong source, opcode, port or nonce): keep listening
    Stray,
    Done(NatResult<T>),
}

/// Send `request` to the gateway's server port and wait for the first
/// datagram `accept` recognises, bounded by `timeout`. The socket is closed
/// when the exchange ends.
pub(crate) async fn udp_round_trip<T, A>(
    socket: Arc<dyn DatagramSocket>,
    gateway: Ipv4Addr,
    request: &[u8],
    timeout: Duration,
    label: String,
    protocol: MappingProtocol,
    mut accept: A,
) -> NatResult<T>
where
    A: FnMut(&[u8]) -> Inbound<T> + Send,
    T: Send,
{
    let server = SocketAddr::new(IpAddr::V4(gateway), GATEWAY_SERVER_PORT);
    let closer = socket.clone();

    let exchange = async {
        socket
            .send_to(request, server)
            .await
            .map_err(|e| NatError::transport(protocol, "send", e))?;

        let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
        loop {
            let (len, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| NatError::transport(protocol, "receive", e))?;

            if from != server {
                tracing::trace!("Ignoring {} datagram from {}", protocol, from);
                continue;
            }

            match accept(&buf[..len]) {
                Inbound::Stray => {
                    tracing::trace!("Ignoring stray {} response from {}", protocol, from);
                }
                Inbound::Done(result) => return result,
            }
        }
    };

    race(timeout, label, exchange, move || closer.close()).await
}

/// Per-protocol negotiation statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolStats {
    pub successes: usize,
    pub failures: usize,
    pub avg_mapping_time: Duration,
    pub last_error: Option<String>,
}

/// Port mapping statistics
#[derive(Debug, Default)]
pub struct MappingStats {
    /// Successful mappings by protocol
    success_count: RwLock<HashMap<MappingProtocol, usize>>,

    /// Failed attempts by protocol
    failure_count: RwLock<HashMap<MappingProtocol, usize>>,

    /// Average mapping time by protocol
    avg_mapping_time: RwLock<HashMap<MappingProtocol, Duration>>,

    /// Last error by protocol
    last_error: RwLock<HashMap<MappingProtocol, String>>,
}

impl MappingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, protocol: MappingProtocol, duration: Duration) {
        let count = {
            let mut success = self.success_count.write();
            let count = success.entry(protocol).or_insert(0);
            *count += 1;
            *count as u32
        };

        let mut times = self.avg_mapping_time.write();
        let entry = times.entry(protocol).or_insert(Duration::ZERO);
        *entry = (*entry * (count - 1) + duration) / count;
    }

    pub fn record_failure(&self, protocol: MappingProtocol, error: String) {
        *self.failure_count.write().entry(protocol).or_insert(0) += 1;
        self.last_error.write().insert(protocol, error);
    }

    pub fn get(&self, protocol: MappingProtocol) -> ProtocolStats {
        ProtocolStats {
            successes: self.success_count.read().get(&protocol).copied().unwrap_or(0),
            failures: self.failure_count.read().get(&protocol).copied().unwrap_or(0),
            avg_mapping_time: self
                .avg_mapping_time
                .read()
                .get(&protocol)
                .copied()
                .unwrap_or(Duration::ZERO),
            last_error: self.last_error.read().get(&protocol).cloned(),
        }
    }

    pub fn format_stats(&self) -> String {
        let mut output = String::from("Port Mapping Statistics:\n");

        for protocol in MappingProtocol::ALL {
            let stats = self.get(protocol);
            let total = stats.successes + stats.failures;

            if total > 0 {
                let success_rate = (stats.successes as f64 / total as f64) * 100.0;
                output.push_str(&format!(
                    "\n{}:\n  Success: {}/{} ({:.1}%)\n",
                    protocol, stats.successes, total, success_rate
                ));

                if stats.successes > 0 {
                    output.push_str(&format!("  Avg time: {:?}\n", stats.avg_mapping_time));
                }

                if let Some(last_err) = &stats.last_error {
                    output.push_str(&format!("  Last error: {}\n", last_err));
                }
            }
        }

        output
    }
}
