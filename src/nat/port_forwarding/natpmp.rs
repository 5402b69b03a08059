//! NAT-PMP client implementation (RFC 6886)
//!
//! The gateway returns a `server epoch` with every response. We store it on
//! the mapping and compare it on refresh; an epoch that went backwards means
//! the gateway restarted and the refresh effectively recreated the mapping.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;

use super::{
    check_granted_lifetime, udp_round_trip, Inbound, Mapping, MappingProtocol, MappingRequest,
    MappingState, PortMappingClient, TransportProtocol,
};
use crate::nat::codec::{FrameReader, FrameWriter};
use crate::nat::error::{NatError, NatPmpResultCode, NatResult};
use crate::nat::transport::UdpTransport;

pub const VERSION: u8 = 0;
pub const REQUEST_SIZE: usize = 12;
pub const RESPONSE_SIZE: usize = 16;

/// Responses carry the request opcode plus this offset
const RESPONSE_OPCODE_OFFSET: u8 = 128;

/// Decoded mapping response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatPmpReply {
    pub epoch: u32,
    pub internal_port: u16,
    pub external_port: u16,
    pub lifetime: u32,
}

/// Build a mapping request. A zero lifetime asks for deletion.
pub fn encode_request(
    transport: TransportProtocol,
    internal_port: u16,
    suggested_external_port: u16,
    lifetime: u32,
) -> NatResult<BytesMut> {
    let mut frame = FrameWriter::new(REQUEST_SIZE);
    frame
        .u8(0, VERSION)?
        .u8(1, transport.natpmp_opcode())?
        .u16(2, 0)?
        .u16(4, internal_port)?
        .u16(6, suggested_external_port)?
        .u32(8, lifetime)?;
    Ok(frame.finish())
}

/// Classify one datagram received from the gateway for a request with
/// `transport` and `internal_port`
pub(crate) fn decode_response(
    buf: &[u8],
    transport: TransportProtocol,
    internal_port: u16,
) -> Inbound<NatPmpReply> {
    let protocol = MappingProtocol::NatPmp;
    let frame = FrameReader::new(buf);

    let header = (frame.u8(0), frame.u8(1), frame.u16(2));
    let (version, opcode, result_code) = match header {
        (Ok(v), Ok(o), Ok(r)) => (v, o, r),
        _ => {
            return Inbound::Done(Err(NatError::malformed(
                protocol,
                format!("{} byte response is shorter than the header", buf.len()),
            )))
        }
    };

    if opcode != transport.natpmp_opcode() + RESPONSE_OPCODE_OFFSET {
        return Inbound::Stray;
    }

    if version != VERSION {
        return Inbound::Done(Err(NatError::unsupported(
            protocol,
            format!("gateway answered with version {}", version),
        )));
    }

    if result_code != 0 {
        return Inbound::Done(Err(NatPmpResultCode::into_error(result_code)));
    }

    let body = (frame.u32(4), frame.u16(8), frame.u16(10), frame.u32(12));
    let reply = match body {
        (Ok(epoch), Ok(internal), Ok(external_port), Ok(lifetime)) => NatPmpReply {
            epoch,
            internal_port: internal,
            external_port,
            lifetime,
        },
        _ => {
            return Inbound::Done(Err(NatError::malformed(
                protocol,
                format!("expected {} bytes, got {}", RESPONSE_SIZE, buf.len()),
            )))
        }
    };

    if reply.internal_port != internal_port {
        return Inbound::Stray;
    }

    Inbound::Done(Ok(reply))
}

/// NAT-PMP client
pub struct NatPmpClient {
    udp: Arc<dyn UdpTransport>,
    timeout: Duration,
}

impl NatPmpClient {
    pub fn new(udp: Arc<dyn UdpTransport>, timeout: Duration) -> Self {
        Self { udp, timeout }
    }

    /// One mapping request/response exchange
    async fn map_port(
        &self,
        gateway: Ipv4Addr,
        local_port: u16,
        transport: TransportProtocol,
        internal_port: u16,
        suggested_external_port: u16,
        lifetime: u32,
    ) -> NatResult<NatPmpReply> {
        let request = encode_request(transport, internal_port, suggested_external_port, lifetime)?;
        let socket = self
            .udp
            .open_udp_socket(local_port)
            .await
            .map_err(|e| NatError::transport(MappingProtocol::NatPmp, "bind", e))?;

        let label = format!("NAT-PMP request to {} for port {}", gateway, internal_port);
        udp_round_trip(
            socket,
            gateway,
            &request,
            self.timeout,
            label,
            MappingProtocol::NatPmp,
            |buf| decode_response(buf, transport, internal_port),
        )
        .await
    }
}

#[async_trait]
impl PortMappingClient for NatPmpClient {
    fn protocol(&self) -> MappingProtocol {
        MappingProtocol::NatPmp
    }

    async fn create_mapping(&self, request: &MappingRequest) -> NatResult<Mapping> {
        let reply = self
            .map_port(
                request.gateway,
                request.local_port,
                request.transport,
                request.internal_port,
                request.internal_port,
                request.lifetime,
            )
            .await?;

        if reply.external_port == 0 {
            return Err(NatError::malformed(
                MappingProtocol::NatPmp,
                "gateway granted external port 0",
            ));
        }
        check_granted_lifetime(MappingProtocol::NatPmp, reply.lifetime)?;

        tracing::info!(
            "NAT-PMP mapping created: {}:{} -> {} for {} seconds",
            request.internal_ip,
            request.internal_port,
            reply.external_port,
            reply.lifetime
        );

        let mut mapping = Mapping::pending(request, MappingProtocol::NatPmp);
        mapping.external_port = Some(reply.external_port);
        mapping.lifetime = reply.lifetime;
        mapping.epoch = Some(reply.epoch);
        mapping.state = MappingState::Active;
        Ok(mapping)
    }

    async fn delete_mapping(&self, mapping: &Mapping) -> NatResult<()> {
        // Deletion is a request with lifetime 0 and external port 0
        self.map_port(
            mapping.gateway,
            0,
            mapping.transport,
            mapping.internal_port,
            0,
            0,
        )
        .await?;

        tracing::info!("NAT-PMP mapping for port {} deleted", mapping.internal_port);
        Ok(())
    }

    async fn refresh_mapping(&self, mapping: &Mapping) -> NatResult<Mapping> {
        let reply = self
            .map_port(
                mapping.gateway,
                0,
                mapping.transport,
                mapping.internal_port,
                mapping.external_port.unwrap_or(mapping.internal_port),
                mapping.requested_lifetime,
            )
            .await?;

        if let Some(saved_epoch) = mapping.epoch {
            if reply.epoch < saved_epoch {
                tracing::warn!(
                    "NAT-PMP server epoch went from {} to {}, gateway {} restarted",
                    saved_epoch,
                    reply.epoch,
                    mapping.gateway
                );
            }
        }

        if reply.external_port == 0 {
            return Err(NatError::malformed(
                MappingProtocol::NatPmp,
                "gateway granted external port 0",
            ));
        }
        check_granted_lifetime(MappingProtocol::NatPmp, reply.lifetime)?;

        let mut refreshed = mapping.clone();
        refreshed.external_port = Some(reply.external_port);
        refreshed.lifetime = reply.lifetime;
        refreshed.epoch = Some(reply.epoch);
        refreshed.state = MappingState::Active;
        refreshed.err_info = None;
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::codec::FrameWriter;

    fn response(opcode: u8, result: u16, internal: u16, external: u16, lifetime: u32) -> Vec<u8> {
        let mut frame = FrameWriter::new(RESPONSE_SIZE);
        frame
            .u8(0, 0)
            .unwrap()
            .u8(1, opcode)
            .unwrap()
            .u16(2, result)
            .unwrap()
            .u32(4, 1234)
            .unwrap()
            .u16(8, internal)
            .unwrap()
            .u16(10, external)
            .unwrap()
            .u32(12, lifetime)
            .unwrap();
        frame.finish().to_vec()
    }

    #[test]
    fn test_request_layout() {
        let request = encode_request(TransportProtocol::Tcp, 8080, 8080, 7200).unwrap();
        assert_eq!(
            &request[..],
            &[0, 2, 0, 0, 0x1F, 0x90, 0x1F, 0x90, 0, 0, 0x1C, 0x20]
        );
    }

    #[test]
    fn test_decodes_success() {
        let buf = response(129, 0, 8080, 40000, 3600);
        match decode_response(&buf, TransportProtocol::Udp, 8080) {
            Inbound::Done(Ok(reply)) => {
                assert_eq!(reply.external_port, 40000);
                assert_eq!(reply.lifetime, 3600);
                assert_eq!(reply.epoch, 1234);
            }
            _ => panic!("expected a decoded reply"),
        }
    }

    #[test]
    fn test_strays_are_ignored() {
        // TCP response while waiting for UDP
        let buf = response(130, 0, 8080, 40000, 3600);
        assert!(matches!(decode_response(&buf, TransportProtocol::Udp, 8080), Inbound::Stray));

        // Another port's mapping
        let buf = response(129, 0, 9000, 40000, 3600);
        assert!(matches!(decode_response(&buf, TransportProtocol::Udp, 8080), Inbound::Stray));
    }

    #[test]
    fn test_version_mismatch_is_unsupported() {
        let mut buf = response(129, 0, 8080, 40000, 3600);
        buf[0] = 1;
        assert!(matches!(
            decode_response(&buf, TransportProtocol::Udp, 8080),
            Inbound::Done(Err(NatError::Unsupported {
                protocol: MappingProtocol::NatPmp,
                ..
            }))
        ));
    }

    #[test]
    fn test_result_codes_and_truncation() {
        let buf = response(129, 2, 8080, 0, 0);
        assert!(matches!(
            decode_response(&buf, TransportProtocol::Udp, 8080),
            Inbound::Done(Err(NatError::Rejected { .. }))
        ));

        let buf = response(129, 1, 8080, 0, 0);
        assert!(matches!(
            decode_response(&buf, TransportProtocol::Udp, 8080),
            Inbound::Done(Err(NatError::Unsupported { .. }))
        ));

        let buf = response(129, 0, 8080, 40000, 3600);
        assert!(matches!(
            decode_response(&buf[..10], TransportProtocol::Udp, 8080),
            Inbound::Done(Err(NatError::Malformed { .. }))
        ));

        assert!(matches!(
            decode_response(&[0], TransportProtocol::Udp, 8080),
            Inbound::Done(Err(NatError::Malformed { .. }))
        ));
    }
}
