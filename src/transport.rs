//! Datagram transport consumed by sessions and the dispatcher.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::error::TftpError;

/// Hands out fresh endpoints, one per transfer.
pub trait Transport: Send + Sync + 'static {
    type Endpoint: Endpoint;

    fn open(&self) -> impl Future<Output = io::Result<Self::Endpoint>> + Send;
}

/// One bound datagram endpoint. Dropping it closes it.
pub trait Endpoint: Send + Sync + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<()>> + Send;

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

/// Receives one datagram, failing with [`TftpError::Timeout`] at `deadline`.
pub async fn receive<E: Endpoint>(
    endpoint: &E,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(usize, SocketAddr), TftpError> {
    match timeout_at(deadline, endpoint.recv_from(buf)).await {
        Ok(received) => Ok(received?),
        Err(_) => Err(TftpError::Timeout),
    }
}

/// UDP transport binding ephemeral ports on one local address.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    ip: IpAddr,
}

impl UdpTransport {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip }
    }
}

impl Transport for UdpTransport {
    type Endpoint = UdpSocket;

    async fn open(&self) -> io::Result<UdpSocket> {
        UdpSocket::bind(SocketAddr::new(self.ip, 0)).await
    }
}

impl Endpoint for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, buf, target).await.map(|_| ())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[tokio::test]
    async fn endpoints_are_distinct_and_time_out() {
        let transport = UdpTransport::new("127.0.0.1".parse().unwrap());
        let a = transport.open().await.unwrap();
        let b = transport.open().await.unwrap();
        let a_addr = Endpoint::local_addr(&a).unwrap();
        let b_addr = Endpoint::local_addr(&b).unwrap();
        assert_ne!(a_addr.port(), b_addr.port());

        Endpoint::send_to(&a, b"ping", b_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        let (n, from) = receive(&b, &mut buf, deadline).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a_addr);

        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(matches!(
            receive(&b, &mut buf, deadline).await,
            Err(TftpError::Timeout)
        ));
    }
}
