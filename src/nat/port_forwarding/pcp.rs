//! PCP client implementation (RFC 6887)
//!
//! Only the MAP opcode is used. The nonce generated at creation authorizes
//! every later refresh and delete of the same mapping.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use rand::RngCore;

use super::{
    check_granted_lifetime, udp_round_trip, Inbound, Mapping, MappingProtocol, MappingRequest,
    MappingState, PortMappingClient, TransportProtocol,
};
use crate::nat::codec::{FrameReader, FrameWriter};
use crate::nat::error::{NatError, NatResult, PcpResultCode};
use crate::nat::transport::UdpTransport;

pub const VERSION: u8 = 2;
pub const OPCODE_MAP: u8 = 1;
pub const MAP_PACKET_SIZE: usize = 60;

const RESPONSE_BIT: u8 = 0x80;

// MAP layout offsets shared by request and response
const NONCE_OFFSET: usize = 24;
const PROTOCOL_OFFSET: usize = 36;
const INTERNAL_PORT_OFFSET: usize = 40;
const EXTERNAL_PORT_OFFSET: usize = 42;
const EXTERNAL_ADDR_OFFSET: usize = 44;

/// Fresh random mapping nonce
pub fn generate_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Parameters of a MAP request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub client_ip: Ipv4Addr,
    pub nonce: [u8; 12],
    pub transport: TransportProtocol,
    pub internal_port: u16,
    pub suggested_external_port: u16,
    pub suggested_external_ip: Option<IpAddr>,
    pub lifetime: u32,
}

/// Decoded MAP response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapReply {
    pub lifetime: u32,
    pub epoch: u32,
    pub external_port: u16,
    pub external_ip: IpAddr,
}

pub fn encode_map_request(request: &MapRequest) -> NatResult<BytesMut> {
    let mut frame = FrameWriter::new(MAP_PACKET_SIZE);
    frame
        .u8(0, VERSION)?
        .u8(1, OPCODE_MAP)?
        .u16(2, 0)?
        .u32(4, request.lifetime)?
        .ip(8, IpAddr::V4(request.client_ip))?
        .bytes(NONCE_OFFSET, &request.nonce)?
        .u8(PROTOCOL_OFFSET, request.transport.iana_number())?
        .u16(INTERNAL_PORT_OFFSET, request.internal_port)?
        .u16(EXTERNAL_PORT_OFFSET, request.suggested_external_port)?
        .ip(
            EXTERNAL_ADDR_OFFSET,
            request
                .suggested_external_ip
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        )?;
    Ok(frame.finish())
}

/// Classify one datagram received from the gateway for `request`
pub(crate) fn decode_map_response(buf: &[u8], request: &MapRequest) -> Inbound<MapReply> {
    let protocol = MappingProtocol::Pcp;
    let frame = FrameReader::new(buf);

    let (version, opcode, result_code) = match (frame.u8(0), frame.u8(1), frame.u8(3)) {
        (Ok(v), Ok(o), Ok(r)) => (v, o, r),
        _ => {
            return Inbound::Done(Err(NatError::malformed(
                protocol,
                format!("{} byte response is shorter than the header", buf.len()),
            )))
        }
    };

    if version == 0 {
        return Inbound::Done(Err(NatError::unsupported(
            protocol,
            "gateway only speaks NAT-PMP",
        )));
    }

    if opcode & RESPONSE_BIT == 0 || opcode & !RESPONSE_BIT != OPCODE_MAP {
        return Inbound::Stray;
    }

    if version != VERSION {
        return Inbound::Done(Err(NatError::unsupported(
            protocol,
            format!("gateway answered with version {}", version),
        )));
    }

    // Error responses echo the MAP payload, so the nonce tells us whose they are
    if let Ok(nonce) = frame.bytes::<12>(NONCE_OFFSET) {
        if nonce != request.nonce {
            return Inbound::Stray;
        }
    }

    if result_code != 0 {
        return Inbound::Done(Err(PcpResultCode::into_error(result_code)));
    }

    if buf.len() < MAP_PACKET_SIZE {
        return Inbound::Done(Err(NatError::malformed(
            protocol,
            format!("expected {} bytes, got {}", MAP_PACKET_SIZE, buf.len()),
        )));
    }

    let matches_request = frame.u8(PROTOCOL_OFFSET).ok() == Some(request.transport.iana_number())
        && frame.u16(INTERNAL_PORT_OFFSET).ok() == Some(request.internal_port);
    if !matches_request {
        return Inbound::Stray;
    }

    let reply = (|| {
        Ok::<_, crate::nat::error::CodecError>(MapReply {
            lifetime: frame.u32(4)?,
            epoch: frame.u32(8)?,
            external_port: frame.u16(EXTERNAL_PORT_OFFSET)?,
            external_ip: frame.ip(EXTERNAL_ADDR_OFFSET)?,
        })
    })();

    Inbound::Done(reply.map_err(NatError::from))
}

/// PCP client
pub struct PcpClient {
    udp: Arc<dyn UdpTransport>,
    timeout: Duration,
}

impl PcpClient {
    pub fn new(udp: Arc<dyn UdpTransport>, timeout: Duration) -> Self {
        Self { udp, timeout }
    }

    async fn map(&self, gateway: Ipv4Addr, local_port: u16, request: MapRequest) -> NatResult<MapReply> {
        let packet = encode_map_request(&request)?;
        let socket = self
            .udp
            .open_udp_socket(local_port)
            .await
            .map_err(|e| NatError::transport(MappingProtocol::Pcp, "bind", e))?;

        let label = format!("PCP MAP to {} for port {}", gateway, request.internal_port);
        udp_round_trip(
            socket,
            gateway,
            &packet,
            self.timeout,
            label,
            MappingProtocol::Pcp,
            |buf| decode_map_response(buf, &request),
        )
        .await
    }

    fn nonce_of(mapping: &Mapping) -> NatResult<[u8; 12]> {
        mapping.nonce.ok_or_else(|| {
            NatError::rejected(MappingProtocol::Pcp, "mapping carries no nonce")
        })
    }
}

#[async_trait]
impl PortMappingClient for PcpClient {
    fn protocol(&self) -> MappingProtocol {
        MappingProtocol::Pcp
    }

    async fn create_mapping(&self, request: &MappingRequest) -> NatResult<Mapping> {
        let nonce = generate_nonce();
        let reply = self
            .map(
                request.gateway,
                request.local_port,
                MapRequest {
                    client_ip: request.internal_ip,
                    nonce,
                    transport: request.transport,
                    internal_port: request.internal_port,
                    suggested_external_port: request.internal_port,
                    suggested_external_ip: None,
                    lifetime: request.lifetime,
                },
            )
            .await?;

        if reply.external_port == 0 {
            return Err(NatError::malformed(
                MappingProtocol::Pcp,
                "gateway assigned external port 0",
            ));
        }
        check_granted_lifetime(MappingProtocol::Pcp, reply.lifetime)?;

        tracing::info!(
            "PCP mapping created: {}:{} -> {}:{} for {} seconds",
            request.internal_ip,
            request.internal_port,
            reply.external_ip,
            reply.external_port,
            reply.lifetime
        );

        let mut mapping = Mapping::pending(request, MappingProtocol::Pcp);
        mapping.external_ip = Some(reply.external_ip);
        mapping.external_port = Some(reply.external_port);
        mapping.lifetime = reply.lifetime;
        mapping.nonce = Some(nonce);
        mapping.epoch = Some(reply.epoch);
        mapping.state = MappingState::Active;
        Ok(mapping)
    }

    async fn delete_mapping(&self, mapping: &Mapping) -> NatResult<()> {
        let nonce = Self::nonce_of(mapping)?;
        self.map(
            mapping.gateway,
            0,
            MapRequest {
                client_ip: mapping.internal_ip,
                nonce,
                transport: mapping.transport,
                internal_port: mapping.internal_port,
                suggested_external_port: 0,
                suggested_external_ip: None,
                lifetime: 0,
            },
        )
        .await?;

        tracing::info!("PCP mapping for port {} deleted", mapping.internal_port);
        Ok(())
    }

    async fn refresh_mapping(&self, mapping: &Mapping) -> NatResult<Mapping> {
        let nonce = Self::nonce_of(mapping)?;
        let reply = self
            .map(
                mapping.gateway,
                0,
                MapRequest {
                    client_ip: mapping.internal_ip,
                    nonce,
                    transport: mapping.transport,
                    internal_port: mapping.internal_port,
                    suggested_external_port: mapping.external_port.unwrap_or(0),
                    suggested_external_ip: mapping.external_ip,
                    lifetime: mapping.requested_lifetime,
                },
            )
            .await?;

        if let Some(saved_epoch) = mapping.epoch {
            if reply.epoch < saved_epoch {
                tracing::warn!(
                    "PCP server epoch went from {} to {}, gateway {} restarted",
                    saved_epoch,
                    reply.epoch,
                    mapping.gateway
                );
            }
        }

        check_granted_lifetime(MappingProtocol::Pcp, reply.lifetime)?;

        let mut refreshed = mapping.clone();
        refreshed.external_ip = Some(reply.external_ip);
        refreshed.external_port = Some(reply.external_port);
        refreshed.lifetime = reply.lifetime;
        refreshed.epoch = Some(reply.epoch);
        refreshed.state = MappingState::Active;
        refreshed.err_info = None;
        Ok(refreshed)
    }
}
