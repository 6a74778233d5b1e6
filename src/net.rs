//! Socket construction for both sides of the transfer.
//!
//! The sender owns two sockets: a broadcast-capable socket connected to the
//! broadcast address, and a listening socket where acknowledgments arrive.
//! A receiver owns a single socket bound to the broadcast port, which it
//! also uses to reply. Options below the `bind` level (SO_BROADCAST,
//! SO_REUSEADDR) go through `socket2` before the socket is handed to tokio.

use std::net::{Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::TransferError;

/// A socket connected to `addr` with SO_BROADCAST set, so plain `send`
/// calls reach every receiver on the segment.
pub fn broadcast_socket(addr: SocketAddr) -> Result<UdpSocket, TransferError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.connect(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// The sender's listening socket for acknowledgment replies.
pub async fn listen_socket(port: u16) -> Result<UdpSocket, TransferError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    Ok(UdpSocket::bind(addr).await?)
}

/// A receiver's socket on the broadcast port.
///
/// SO_REUSEADDR lets several receivers on one host share the broadcast
/// port, platform permitting.
pub fn receiver_socket(port: u16) -> Result<UdpSocket, TransferError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_socket_sends_whole_datagrams() {
        let receiver = receiver_socket(0).unwrap();
        let port = receiver.local_addr().unwrap().port();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let sender = broadcast_socket(target).unwrap();
        sender.send(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
    }

    #[tokio::test]
    async fn listen_socket_binds_ephemeral_port() {
        let socket = listen_socket(0).await.unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
