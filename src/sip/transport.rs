//! SIP transport adapter boundary and the UDP implementation

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp => 5060,
            TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
        }
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Abstract send side of the transport. Received messages are delivered
/// on the `mpsc::Receiver<IncomingMessage>` handed to the engine at
/// construction; that channel is the only cross-task boundary.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Platform capability probe, consulted once at engine startup
    fn is_available(&self) -> bool;

    /// Whether this transport can carry the given protocol
    fn supports_protocol(&self, protocol: TransportProtocol) -> bool;

    /// Local address used for Via and Contact headers
    fn local_addr(&self) -> SocketAddr;
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind a socket and start the background receive loop. Returns the
    /// transport and the channel on which parsed messages arrive.
    pub async fn bind(
        bind_addr: SocketAddr,
    ) -> Result<(Self, mpsc::Receiver<IncomingMessage>), SipError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(format!("No local address: {}", e)))?;

        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(1000);

        let recv_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            Self::receive_loop(recv_socket, tx).await;
        });

        Ok((Self { socket, local_addr }, rx))
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                                protocol: TransportProtocol::Udp,
                            };

                            if let Err(e) = tx.send(incoming).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            // Unexpected payloads are logged and discarded
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        self.socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }

    fn supports_protocol(&self, protocol: TransportProtocol) -> bool {
        protocol == TransportProtocol::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_transport_bind() {
        let bind_addr = "127.0.0.1:0".parse().unwrap();
        let (transport, _rx) = UdpTransport::bind(bind_addr).await.unwrap();

        assert!(transport.is_available());
        assert!(transport.supports_protocol(TransportProtocol::Udp));
        assert!(!transport.supports_protocol(TransportProtocol::Tls));
        assert_ne!(transport.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let (a, _a_rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let data = b"OPTIONS sip:b@127.0.0.1 SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKtest\r\n\
                     From: <sip:a@127.0.0.1>;tag=1\r\n\
                     To: <sip:b@127.0.0.1>\r\n\
                     Call-ID: roundtrip@test\r\n\
                     CSeq: 1 OPTIONS\r\n\
                     Content-Length: 0\r\n\r\n";

        a.send(OutgoingMessage {
            data: Bytes::from_static(data),
            destination: b.local_addr(),
            protocol: TransportProtocol::Udp,
        })
        .await
        .unwrap();

        let incoming = b_rx.recv().await.unwrap();
        assert!(incoming.message.is_request());
        assert_eq!(incoming.protocol, TransportProtocol::Udp);
    }

    #[tokio::test]
    async fn test_garbage_is_discarded() {
        let (a, _a_rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (b, mut b_rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        a.send(OutgoingMessage {
            data: Bytes::from_static(b"definitely not sip"),
            destination: b.local_addr(),
            protocol: TransportProtocol::Udp,
        })
        .await
        .unwrap();

        // Nothing should arrive on the channel
        let outcome =
            tokio::time::timeout(std::time::Duration::from_millis(100), b_rx.recv()).await;
        assert!(outcome.is_err());
    }
}
