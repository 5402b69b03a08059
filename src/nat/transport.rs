//! Transport collaborators
//!
//! The protocol clients only speak through these traits. The default
//! implementations bind real tokio sockets and issue real HTTP requests;
//! tests substitute in-memory gateways.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// A bound UDP socket
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<()>;

    /// Wait for the next inbound datagram
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Release the socket. Pending and later receives fail.
    fn close(&self);
}

/// Opens UDP sockets on a chosen local port (0 for ephemeral)
#[async_trait]
pub trait UdpTransport: Send + Sync {
    async fn open_udp_socket(&self, local_port: u16) -> io::Result<Arc<dyn DatagramSocket>>;
}

/// HTTP reply from a SOAP action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapReply {
    pub status: u16,
    pub body: String,
}

impl SoapReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP capability used by UPnP
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Fetch a device description document
    async fn get(&self, url: &str) -> io::Result<String>;

    /// POST a SOAP envelope. `action` is the full `SOAPAction` header value.
    async fn post_soap(&self, url: &str, action: &str, body: String) -> io::Result<SoapReply>;
}

/// tokio-backed UDP sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioUdpTransport;

#[async_trait]
impl UdpTransport for TokioUdpTransport {
    async fn open_udp_socket(&self, local_port: u16) -> io::Result<Arc<dyn DatagramSocket>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port)).await?;
        tracing::trace!("Bound UDP socket {}", socket.local_addr()?);
        Ok(Arc::new(TokioDatagramSocket {
            socket,
            closed: CancellationToken::new(),
        }))
    }
}

struct TokioDatagramSocket {
    socket: UdpSocket,
    closed: CancellationToken,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}

#[async_trait]
impl DatagramSocket for TokioDatagramSocket {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.socket.send_to(buf, dest).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            result = self.socket.recv_from(buf) => result,
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// reqwest-backed HTTP for UPnP control points
#[cfg(feature = "http-transport")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http-transport")]
impl ReqwestHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "http-transport")]
fn http_error(e: reqwest::Error) -> io::Error {
    if e.is_timeout() {
        io::Error::new(io::ErrorKind::TimedOut, e)
    } else {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

#[cfg(feature = "http-transport")]
#[async_trait]
impl HttpTransport for ReqwestHttpTransport {
    async fn get(&self, url: &str) -> io::Result<String> {
        let response = self.client.get(url).send().await.map_err(http_error)?;
        response.text().await.map_err(http_error)
    }

    async fn post_soap(&self, url: &str, action: &str, body: String) -> io::Result<SoapReply> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", action)
            .body(body)
            .send()
            .await
            .map_err(http_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(http_error)?;
        Ok(SoapReply { status, body })
    }
}
