// tests/common/mod.rs
//! In-memory gateway answering NAT-PMP, PCP, SSDP and UPnP SOAP, plus a
//! scriptable host address source.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use natmap::nat::{
    AddressSource, DatagramSocket, HttpTransport, MappingManager, MappingProtocol,
    PortMapConfig, SoapReply, UdpTransport,
};

pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const SECOND_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 37);
pub const SECOND_HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
pub const EXTERNAL_IP: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 7);

pub const DESCRIPTION_URL: &str = "http://192.168.1.1:5000/rootDesc.xml";
pub const CONTROL_URL: &str = "http://192.168.1.1:5000/ctl/IPConn";

const SERVER_PORT: u16 = 5351;
const SSDP: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 1900);

const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
            <serviceList>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
                <controlURL>/ctl/IPConn</controlURL>
              </service>
            </serviceList>
          </device>
        </deviceList>
      </device>
    </deviceList>
  </device>
</root>"#;

/// How the fake answers one protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Answer,
    Silent,

    /// NAT-PMP: result code 1. PCP: a version-0 reply. UPnP: same as silent.
    Unsupported,
}

/// A request as the gateway saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRequest {
    pub protocol: MappingProtocol,
    pub local_port: u16,
    pub internal_port: u16,
    pub lifetime: u32,
}

struct State {
    behaviour: HashMap<MappingProtocol, Behaviour>,
    gateways: Vec<Ipv4Addr>,
    epoch: u32,
    max_lifetime: u32,
    response_delay: Duration,
    pcp: HashMap<(Ipv4Addr, u8, u16), [u8; 12]>,
    natpmp: HashMap<(u8, u16), u16>,
    upnp: HashMap<(String, u16), u16>,
    upnp_faults: VecDeque<(u16, String)>,
    seen: Vec<SeenRequest>,
}

#[derive(Clone)]
pub struct FakeGateway {
    state: Arc<Mutex<State>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        let behaviour = MappingProtocol::ALL
            .into_iter()
            .map(|p| (p, Behaviour::Answer))
            .collect();

        Self {
            state: Arc::new(Mutex::new(State {
                behaviour,
                gateways: vec![GATEWAY, SECOND_GATEWAY],
                epoch: 1000,
                max_lifetime: u32::MAX,
                response_delay: Duration::ZERO,
                pcp: HashMap::new(),
                natpmp: HashMap::new(),
                upnp: HashMap::new(),
                upnp_faults: VecDeque::new(),
                seen: Vec::new(),
            })),
        }
    }

    pub fn set_behaviour(&self, protocol: MappingProtocol, behaviour: Behaviour) {
        self.state.lock().behaviour.insert(protocol, behaviour);
    }

    pub fn set_all(&self, behaviour: Behaviour) {
        for protocol in MappingProtocol::ALL {
            self.set_behaviour(protocol, behaviour);
        }
    }

    /// Cap on granted NAT-PMP/PCP lifetimes
    pub fn set_max_lifetime(&self, seconds: u32) {
        self.state.lock().max_lifetime = seconds;
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().response_delay = delay;
    }

    /// Queue a fault for the next AddPortMapping
    pub fn push_upnp_fault(&self, code: u16, description: &str) {
        self.state
            .lock()
            .upnp_faults
            .push_back((code, description.to_string()));
    }

    pub fn epoch(&self) -> u32 {
        self.state.lock().epoch
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.state.lock().seen.clone()
    }

    pub fn requests_for(&self, protocol: MappingProtocol, internal_port: u16) -> usize {
        self.state
            .lock()
            .seen
            .iter()
            .filter(|r| r.protocol == protocol && r.internal_port == internal_port)
            .count()
    }

    pub fn pcp_mapped(&self, client: Ipv4Addr, internal_port: u16) -> bool {
        self.state
            .lock()
            .pcp
            .keys()
            .any(|(ip, _, port)| *ip == client && *port == internal_port)
    }

    pub fn pcp_mapping_count(&self) -> usize {
        self.state.lock().pcp.len()
    }

    pub fn natpmp_mapped(&self, internal_port: u16) -> bool {
        self.state
            .lock()
            .natpmp
            .keys()
            .any(|(_, port)| *port == internal_port)
    }

    pub fn upnp_mapped(&self, external_port: u16) -> bool {
        self.state
            .lock()
            .upnp
            .keys()
            .any(|(_, port)| *port == external_port)
    }

    fn handle_datagram(
        &self,
        local_port: u16,
        buf: &[u8],
        dest: SocketAddr,
    ) -> (Option<(Vec<u8>, SocketAddr)>, Duration) {
        let mut state = self.state.lock();
        let delay = state.response_delay;

        if dest == SSDP {
            let reply = state
                .ssdp(local_port)
                .map(|r| (r, SocketAddr::new(IpAddr::V4(GATEWAY), 1900)));
            return (reply, delay);
        }

        let serves = match dest.ip() {
            IpAddr::V4(ip) => dest.port() == SERVER_PORT && state.gateways.contains(&ip),
            IpAddr::V6(_) => false,
        };
        if !serves {
            return (None, delay);
        }

        let reply = match buf.first() {
            Some(0) => state.natpmp(local_port, buf),
            Some(2) => state.pcp(local_port, buf),
            _ => None,
        };
        (reply.map(|r| (r, dest)), delay)
    }
}

impl State {
    fn behaviour(&self, protocol: MappingProtocol) -> Behaviour {
        self.behaviour
            .get(&protocol)
            .copied()
            .unwrap_or(Behaviour::Answer)
    }

    fn ssdp(&mut self, local_port: u16) -> Option<Vec<u8>> {
        self.seen.push(SeenRequest {
            protocol: MappingProtocol::Upnp,
            local_port,
            internal_port: 0,
            lifetime: 0,
        });
        if self.behaviour(MappingProtocol::Upnp) != Behaviour::Answer {
            return None;
        }

        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             CACHE-CONTROL: max-age=120\r\n\
             ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
             LOCATION: {}\r\n\r\n",
            DESCRIPTION_URL
        );
        Some(response.into_bytes())
    }

    fn natpmp(&mut self, local_port: u16, buf: &[u8]) -> Option<Vec<u8>> {
        if buf.len() < 12 {
            return None;
        }
        let opcode = buf[1];
        let internal = u16::from_be_bytes([buf[4], buf[5]]);
        let suggested = u16::from_be_bytes([buf[6], buf[7]]);
        let lifetime = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        self.seen.push(SeenRequest {
            protocol: MappingProtocol::NatPmp,
            local_port,
            internal_port: internal,
            lifetime,
        });

        let result: u16 = match self.behaviour(MappingProtocol::NatPmp) {
            Behaviour::Silent => return None,
            Behaviour::Unsupported => 1,
            Behaviour::Answer => 0,
        };

        let (external, granted) = if result != 0 {
            (0, 0)
        } else if lifetime == 0 {
            self.natpmp.remove(&(opcode, internal));
            (0, 0)
        } else {
            let external = if suggested != 0 { suggested } else { internal };
            self.natpmp.insert((opcode, internal), external);
            (external, lifetime.min(self.max_lifetime))
        };

        let mut reply = Vec::with_capacity(16);
        reply.push(0);
        reply.push(opcode + 128);
        reply.extend_from_slice(&result.to_be_bytes());
        reply.extend_from_slice(&self.epoch.to_be_bytes());
        reply.extend_from_slice(&internal.to_be_bytes());
        reply.extend_from_slice(&external.to_be_bytes());
        reply.extend_from_slice(&granted.to_be_bytes());
        Some(reply)
    }

    fn pcp(&mut self, local_port: u16, buf: &[u8]) -> Option<Vec<u8>> {
        if buf.len() < 60 {
            return None;
        }
        let lifetime = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let client = Ipv4Addr::new(buf[20], buf[21], buf[22], buf[23]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&buf[24..36]);
        let transport = buf[36];
        let internal = u16::from_be_bytes([buf[40], buf[41]]);
        let suggested = u16::from_be_bytes([buf[42], buf[43]]);

        self.seen.push(SeenRequest {
            protocol: MappingProtocol::Pcp,
            local_port,
            internal_port: internal,
            lifetime,
        });

        match self.behaviour(MappingProtocol::Pcp) {
            Behaviour::Silent => return None,
            // What a NAT-PMP-only gateway sends back
            Behaviour::Unsupported => return Some(vec![0, 128, 0, 1, 0, 0, 0, 0]),
            Behaviour::Answer => {}
        }

        let mut reply = buf[..60].to_vec();
        reply[1] = buf[1] | 0x80;
        reply[2] = 0;
        reply[8..12].copy_from_slice(&self.epoch.to_be_bytes());
        reply[12..24].fill(0);

        let key = (client, transport, internal);
        let authorized = self.pcp.get(&key).map_or(true, |stored| *stored == nonce);
        if !authorized {
            reply[3] = 2; // NOT_AUTHORIZED
            reply[4..8].fill(0);
            return Some(reply);
        }

        let (external, granted) = if lifetime == 0 {
            self.pcp.remove(&key);
            (0u16, 0u32)
        } else {
            self.pcp.insert(key, nonce);
            let external = if suggested != 0 { suggested } else { internal };
            (external, lifetime.min(self.max_lifetime))
        };

        reply[3] = 0;
        reply[4..8].copy_from_slice(&granted.to_be_bytes());
        reply[42..44].copy_from_slice(&external.to_be_bytes());
        reply[44..60].copy_from_slice(&EXTERNAL_IP.to_ipv6_mapped().octets());
        Some(reply)
    }
}

struct FakeSocket {
    gateway: FakeGateway,
    local_port: u16,
    tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    closed: CancellationToken,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}

#[async_trait]
impl DatagramSocket for FakeSocket {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }

        let (reply, delay) = self.gateway.handle_datagram(self.local_port, buf, dest);
        if let Some(reply) = reply {
            if delay.is_zero() {
                let _ = self.tx.send(reply);
            } else {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(reply);
                });
            }
        }
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            message = rx.recv() => match message {
                Some((data, from)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok((len, from))
                }
                None => Err(closed_error()),
            },
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl UdpTransport for FakeGateway {
    async fn open_udp_socket(&self, local_port: u16) -> io::Result<Arc<dyn DatagramSocket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Arc::new(FakeSocket {
            gateway: self.clone(),
            local_port,
            tx,
            rx: AsyncMutex::new(rx),
            closed: CancellationToken::new(),
        }))
    }
}

fn tag_value<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

fn fault_reply(code: u16, description: &str) -> SoapReply {
    SoapReply {
        status: 500,
        body: format!(
            r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring>
<detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>{}</errorCode><errorDescription>{}</errorDescription></UPnPError></detail>
</s:Fault></s:Body></s:Envelope>"#,
            code, description
        ),
    }
}

#[async_trait]
impl HttpTransport for FakeGateway {
    async fn get(&self, url: &str) -> io::Result<String> {
        if url == DESCRIPTION_URL {
            Ok(DESCRIPTION.to_string())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, url.to_string()))
        }
    }

    async fn post_soap(&self, url: &str, action: &str, body: String) -> io::Result<SoapReply> {
        if url != CONTROL_URL {
            return Ok(SoapReply {
                status: 404,
                body: String::new(),
            });
        }

        let external: u16 = tag_value(&body, "NewExternalPort")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let transport = tag_value(&body, "NewProtocol").unwrap_or("UDP").to_string();
        let ok = SoapReply {
            status: 200,
            body: String::new(),
        };

        let mut state = self.state.lock();
        if action.contains("#AddPortMapping") {
            let internal: u16 = tag_value(&body, "NewInternalPort")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let lease: u32 = tag_value(&body, "NewLeaseDuration")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            state.seen.push(SeenRequest {
                protocol: MappingProtocol::Upnp,
                local_port: 0,
                internal_port: internal,
                lifetime: lease,
            });

            if let Some((code, description)) = state.upnp_faults.pop_front() {
                return Ok(fault_reply(code, &description));
            }
            state.upnp.insert((transport, external), internal);
            Ok(ok)
        } else if action.contains("#DeletePortMapping") {
            match state.upnp.remove(&(transport, external)) {
                Some(_) => Ok(ok),
                None => Ok(fault_reply(714, "NoSuchEntryInArray")),
            }
        } else {
            Ok(fault_reply(401, "Invalid Action"))
        }
    }
}

/// Host addresses the test can change between polls
pub struct FakeAddresses {
    addresses: Mutex<Vec<Ipv4Addr>>,
}

impl FakeAddresses {
    pub fn new(addresses: Vec<Ipv4Addr>) -> Arc<Self> {
        Arc::new(Self {
            addresses: Mutex::new(addresses),
        })
    }

    pub fn set(&self, addresses: Vec<Ipv4Addr>) {
        *self.addresses.lock() = addresses;
    }
}

impl AddressSource for FakeAddresses {
    fn private_ipv4_addrs(&self) -> Vec<Ipv4Addr> {
        self.addresses.lock().clone()
    }
}

pub fn manager(
    gateway: &FakeGateway,
    addresses: Arc<FakeAddresses>,
    config: PortMapConfig,
) -> MappingManager {
    MappingManager::with_parts(
        config,
        Arc::new(gateway.clone()),
        Arc::new(gateway.clone()),
        addresses,
    )
    .expect("valid config")
}

pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}
