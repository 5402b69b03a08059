//! UPnP-IGD client
//!
//! SSDP search locates the gateway's device description, from which only the
//! WANIPConnection / WANPPPConnection control URL is extracted. Mappings are
//! then added and removed with SOAP actions against that URL. Remote faults
//! are carried as text; IGD has no richer error contract.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use xmltree::{Element, XMLNode};

use super::{Mapping, MappingProtocol, MappingRequest, MappingState, PortMappingClient};
use crate::nat::deadline::race;
use crate::nat::error::{NatError, NatResult, UpnpErrorCode};
use crate::nat::transport::{HttpTransport, SoapReply, UdpTransport};

const SSDP_MULTICAST: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 1900);

const SSDP_SEARCH: &str = "M-SEARCH * HTTP/1.1\r\n\
                           HOST: 239.255.255.250:1900\r\n\
                           ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
                           MAN: \"ssdp:discover\"\r\n\
                           MX: 2\r\n\r\n";

const PROTOCOL: MappingProtocol = MappingProtocol::Upnp;

/// Control endpoint of a gateway's WAN connection service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    /// Device description URL from SSDP
    pub location: String,

    /// Absolute control URL
    pub control_url: String,

    /// Service type, used for the SOAPAction header and envelope namespace
    pub service_type: String,
}

/// A fault returned by the control point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub code: Option<u16>,
    pub description: String,
}

impl SoapFault {
    pub fn known_code(&self) -> Option<UpnpErrorCode> {
        self.code.and_then(UpnpErrorCode::from_code)
    }

    fn from_reply(reply: &SoapReply) -> Self {
        parse_soap_fault(&reply.body).unwrap_or_else(|| SoapFault {
            code: None,
            description: format!("HTTP status {}", reply.status),
        })
    }
}

impl fmt::Display for SoapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.known_code()) {
            (Some(code), Some(known)) => {
                write!(f, "UPnP error {} ({}): {}", code, known, self.description)
            }
            (Some(code), None) => write!(f, "UPnP error {}: {}", code, self.description),
            (None, _) => write!(f, "UPnP error: {}", self.description),
        }
    }
}

/// Parse the LOCATION header out of an SSDP response
pub fn parse_ssdp_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("location") {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

fn location_host(location: &str) -> Option<Ipv4Addr> {
    url::Url::parse(location)
        .ok()?
        .host_str()?
        .parse()
        .ok()
}

/// Find the WAN connection service's (control URL, service type), searching
/// embedded devices depth first
pub fn extract_wan_service(root: &Element) -> Option<(String, String)> {
    let device = root.get_child("device")?;
    find_wan_service_in_device(device)
}

fn find_wan_service_in_device(device: &Element) -> Option<(String, String)> {
    if let Some(service_list) = device.get_child("serviceList") {
        for child in &service_list.children {
            if let XMLNode::Element(service) = child {
                let Some(service_type) = service.get_child("serviceType").and_then(|s| s.get_text())
                else {
                    continue;
                };
                if service_type.contains("WANIPConnection") || service_type.contains("WANPPPConnection") {
                    let control_url = service.get_child("controlURL")?.get_text()?;
                    return Some((control_url.trim().to_string(), service_type.trim().to_string()));
                }
            }
        }
    }

    let device_list = device.get_child("deviceList")?;
    device_list.children.iter().find_map(|child| match child {
        XMLNode::Element(embedded) if embedded.name == "device" => find_wan_service_in_device(embedded),
        _ => None,
    })
}

/// Extract `errorCode` / `errorDescription` from a SOAP fault body
pub fn parse_soap_fault(body: &str) -> Option<SoapFault> {
    let root = Element::parse(body.as_bytes()).ok()?;
    let fault = root.get_child("Body")?.get_child("Fault")?;

    let upnp_error = fault
        .get_child("detail")
        .and_then(|d| d.get_child("UPnPError"));

    let code = upnp_error
        .and_then(|e| e.get_child("errorCode"))
        .and_then(|c| c.get_text())
        .and_then(|c| c.trim().parse().ok());

    let description = upnp_error
        .and_then(|e| e.get_child("errorDescription"))
        .and_then(|d| d.get_text())
        .or_else(|| fault.get_child("faultstring").and_then(|s| s.get_text()))
        .map(|d| d.trim().to_string())
        .unwrap_or_else(|| "Unknown error".to_string());

    Some(SoapFault { code, description })
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn soap_envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let arguments: String = args
        .iter()
        .map(|(name, value)| format!("<{name}>{}</{name}>", escape_xml(value)))
        .collect();

    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:{action} xmlns:u="{service_type}">{arguments}</u:{action}></s:Body>
</s:Envelope>"#
    )
}

/// UPnP-IGD client
pub struct UpnpClient {
    udp: Arc<dyn UdpTransport>,
    http: Arc<dyn HttpTransport>,
    timeout: Duration,
    description: String,
    conflict_retries: u16,

    /// Discovered control endpoints by gateway
    endpoints: RwLock<HashMap<Ipv4Addr, ControlEndpoint>>,
}

impl UpnpClient {
    pub fn new(
        udp: Arc<dyn UdpTransport>,
        http: Arc<dyn HttpTransport>,
        timeout: Duration,
        description: String,
        conflict_retries: u16,
    ) -> Self {
        Self {
            udp,
            http,
            timeout,
            description,
            conflict_retries,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached_endpoint(&self, gateway: Ipv4Addr) -> Option<ControlEndpoint> {
        self.endpoints.read().get(&gateway).cloned()
    }

    /// Multicast search, preferring a responder that is the candidate gateway.
    /// Any other responder is used if the gateway stays silent.
    async fn search(&self, gateway: Ipv4Addr, local_port: u16) -> NatResult<String> {
        let socket = self
            .udp
            .open_udp_socket(local_port)
            .await
            .map_err(|e| NatError::transport(PROTOCOL, "bind", e))?;
        let closer = socket.clone();

        let mut fallback: Option<String> = None;
        let search = async {
            socket
                .send_to(SSDP_SEARCH.as_bytes(), SSDP_MULTICAST)
                .await
                .map_err(|e| NatError::transport(PROTOCOL, "SSDP search", e))?;

            let mut buf = vec![0u8; 2048];
            loop {
                let (len, from) = socket
                    .recv_from(&mut buf)
                    .await
                    .map_err(|e| NatError::transport(PROTOCOL, "SSDP receive", e))?;

                let Some(location) = parse_ssdp_location(&String::from_utf8_lossy(&buf[..len])) else {
                    continue;
                };
                tracing::debug!("SSDP response from {}: {}", from, location);

                if from.ip() == IpAddr::V4(gateway) || location_host(&location) == Some(gateway) {
                    return Ok(location);
                }
                fallback.get_or_insert(location);
            }
        };

        let window = self.timeout / 2;
        let label = format!("SSDP search for gateway {}", gateway);
        match race(window, label, search, move || closer.close()).await {
            Ok(location) => Ok(location),
            Err(err @ NatError::Timeout { .. }) => fallback.ok_or(err),
            Err(err) => Err(err),
        }
    }

    /// Control endpoint for `gateway`, discovering it on first use
    async fn endpoint(&self, gateway: Ipv4Addr, local_port: u16) -> NatResult<ControlEndpoint> {
        if let Some(endpoint) = self.cached_endpoint(gateway) {
            return Ok(endpoint);
        }

        let location = self.search(gateway, local_port).await?;

        let description = self
            .http
            .get(&location)
            .await
            .map_err(|e| NatError::transport(PROTOCOL, "device description fetch", e))?;

        let root = Element::parse(description.as_bytes())
            .map_err(|e| NatError::malformed(PROTOCOL, format!("device description: {}", e)))?;

        let (control_path, service_type) = extract_wan_service(&root).ok_or_else(|| {
            NatError::unsupported(PROTOCOL, "no WANIPConnection or WANPPPConnection service")
        })?;

        let control_url = url::Url::parse(&location)
            .and_then(|base| base.join(&control_path))
            .map_err(|e| NatError::malformed(PROTOCOL, format!("control URL: {}", e)))?
            .to_string();

        let endpoint = ControlEndpoint {
            location,
            control_url,
            service_type,
        };

        tracing::info!("Found UPnP control point {} for gateway {}", endpoint.control_url, gateway);
        self.endpoints.write().insert(gateway, endpoint.clone());
        Ok(endpoint)
    }

    async fn call(
        &self,
        endpoint: &ControlEndpoint,
        action: &str,
        args: &[(&str, String)],
    ) -> NatResult<Result<(), SoapFault>> {
        let soap_action = format!("\"{}#{}\"", endpoint.service_type, action);
        let body = soap_envelope(&endpoint.service_type, action, args);

        let reply = self
            .http
            .post_soap(&endpoint.control_url, &soap_action, body)
            .await
            .map_err(|e| NatError::transport(PROTOCOL, action, e))?;

        if reply.is_success() {
            Ok(Ok(()))
        } else {
            Ok(Err(SoapFault::from_reply(&reply)))
        }
    }

    async fn add_port_mapping(
        &self,
        endpoint: &ControlEndpoint,
        mapping: &Mapping,
        external_port: u16,
        lease: u32,
    ) -> NatResult<Result<(), SoapFault>> {
        self.call(
            endpoint,
            "AddPortMapping",
            &[
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", external_port.to_string()),
                ("NewProtocol", mapping.transport.upnp_name().to_string()),
                ("NewInternalPort", mapping.internal_port.to_string()),
                ("NewInternalClient", mapping.internal_ip.to_string()),
                ("NewEnabled", "1".to_string()),
                ("NewPortMappingDescription", self.description.clone()),
                ("NewLeaseDuration", lease.to_string()),
            ],
        )
        .await
    }

    /// Add the mapping, walking past conflicting external ports and falling
    /// back to a permanent lease when the gateway insists
    async fn negotiate(&self, request: &MappingRequest) -> NatResult<Mapping> {
        let endpoint = self.endpoint(request.gateway, request.local_port).await?;
        let mut mapping = Mapping::pending(request, PROTOCOL);

        let mut external_port = request.internal_port;
        let mut lease = request.lifetime;
        let mut conflicts = 0;

        loop {
            match self.add_port_mapping(&endpoint, &mapping, external_port, lease).await? {
                Ok(()) => break,
                Err(fault) => match fault.known_code() {
                    Some(code) if code.is_port_conflict() && conflicts < self.conflict_retries => {
                        conflicts += 1;
                        tracing::debug!("UPnP port {} taken ({}), trying next", external_port, fault);
                        external_port = external_port.checked_add(1).unwrap_or(1024);
                    }
                    Some(UpnpErrorCode::OnlyPermanentLeaseSupported) if lease != 0 => {
                        tracing::debug!("Gateway only supports permanent UPnP leases");
                        lease = 0;
                    }
                    _ => {
                        tracing::warn!("UPnP AddPortMapping for port {} failed: {}", request.internal_port, fault);
                        mapping.err_info = Some(fault.to_string());
                        return Ok(mapping);
                    }
                },
            }
        }

        tracing::info!(
            "UPnP mapping created: {}:{} -> {} ({}s lease)",
            request.internal_ip,
            request.internal_port,
            external_port,
            lease
        );

        mapping.external_port = Some(external_port);
        mapping.lifetime = lease;
        mapping.state = MappingState::Active;
        Ok(mapping)
    }
}

#[async_trait]
impl PortMappingClient for UpnpClient {
    fn protocol(&self) -> MappingProtocol {
        PROTOCOL
    }

    async fn create_mapping(&self, request: &MappingRequest) -> NatResult<Mapping> {
        let label = format!("UPnP mapping of port {} via {}", request.internal_port, request.gateway);
        race(self.timeout, label, self.negotiate(request), || {}).await
    }

    async fn delete_mapping(&self, mapping: &Mapping) -> NatResult<()> {
        let Some(external_port) = mapping.external_port else {
            return Ok(());
        };

        let delete = async {
            let endpoint = self.endpoint(mapping.gateway, 0).await?;
            let outcome = self
                .call(
                    &endpoint,
                    "DeletePortMapping",
                    &[
                        ("NewRemoteHost", String::new()),
                        ("NewExternalPort", external_port.to_string()),
                        ("NewProtocol", mapping.transport.upnp_name().to_string()),
                    ],
                )
                .await?;

            match outcome {
                Ok(()) => Ok(()),
                Err(fault) if fault.known_code() == Some(UpnpErrorCode::PortMappingNotFound) => {
                    tracing::debug!("UPnP mapping on port {} already gone", external_port);
                    Ok(())
                }
                Err(fault) => Err(NatError::rejected(PROTOCOL, fault.to_string())),
            }
        };

        let label = format!("UPnP delete of external port {}", external_port);
        race(self.timeout, label, delete, || {}).await?;
        tracing::info!("UPnP mapping on external port {} deleted", external_port);
        Ok(())
    }

    async fn refresh_mapping(&self, mapping: &Mapping) -> NatResult<Mapping> {
        let external_port = mapping.external_port.unwrap_or(mapping.internal_port);
        let lease = if mapping.lifetime == 0 { 0 } else { mapping.requested_lifetime };

        let refresh = async {
            let endpoint = self.endpoint(mapping.gateway, 0).await?;
            self.add_port_mapping(&endpoint, mapping, external_port, lease)
                .await?
                .map_err(|fault| NatError::rejected(PROTOCOL, fault.to_string()))
        };

        let label = format!("UPnP refresh of external port {}", external_port);
        race(self.timeout, label, refresh, || {}).await?;

        let mut refreshed = mapping.clone();
        refreshed.external_port = Some(external_port);
        refreshed.lifetime = lease;
        refreshed.state = MappingState::Active;
        refreshed.err_info = None;
        Ok(refreshed)
    }
}
