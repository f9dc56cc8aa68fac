// UDP link to the motor controller
//
// Outbound datagrams leave from an ephemeral socket; inbound lines arrive on a
// separately bound listener socket owned by its receive task.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{TransportError, TransportEvent};
use crate::config::UDP_SEND_TIMEOUT;

/// Largest datagram accepted by the listener
const MAX_DATAGRAM_SIZE: usize = 2048;

pub struct UdpSender {
    socket: UdpSocket,
    remote: SocketAddr,
}

impl UdpSender {
    /// Resolve the remote endpoint and bind an ephemeral local socket
    pub fn open(ip: &str, port: u16) -> Result<Self, TransportError> {
        let remote = (ip, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(format!("{}:{}: {}", ip, port, e)))?
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{}:{}: no address", ip, port)))?;

        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).map_err(|source| TransportError::Bind {
            addr: local,
            source,
        })?;
        socket
            .set_write_timeout(Some(UDP_SEND_TIMEOUT))
            .map_err(TransportError::Send)?;

        Ok(Self { socket, remote })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn send(&self, bytes: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(bytes, self.remote)
    }
}

/// Inbound datagram listener
///
/// The socket lives inside the receive task. Stopping aborts the task, which
/// drops (closes) the socket and unblocks the pending receive.
pub struct UdpListener {
    local_addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl UdpListener {
    /// Bind `addr` and start receiving. Must be called inside a tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        session: u64,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let bind_error = |source| TransportError::Bind { addr, source };
        let std_socket = UdpSocket::bind(addr).map_err(bind_error)?;
        std_socket.set_nonblocking(true).map_err(bind_error)?;
        let socket = tokio::net::UdpSocket::from_std(std_socket).map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;

        info!("UDP listener bound on {}", local_addr);
        let handle = tokio::spawn(listen(socket, session, events));
        Ok(Self {
            local_addr,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the socket and wait for the task to end. Safe to call more than once.
    pub async fn stop(&mut self) -> Result<(), TransportError> {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => return Err(TransportError::Join(e.to_string())),
            }
            debug!("UDP listener on {} stopped", self.local_addr);
        }
        Ok(())
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

async fn listen(
    socket: tokio::net::UdpSocket,
    session: u64,
    events: UnboundedSender<TransportEvent>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                debug!("{} bytes from {}", n, from);
                for line in decode_datagram(&buf[..n]) {
                    if events.send(TransportEvent::Line { session, line }).is_err() {
                        return;
                    }
                }
            }
            // ICMP port-unreachable from an earlier send surfaces here on some platforms
            Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!("UDP receive failed: {}", e);
                let _ = events.send(TransportEvent::Line {
                    session,
                    line: format!("Read error: {}", e),
                });
                let _ = events.send(TransportEvent::ReaderStopped { session });
                return;
            }
        }
    }
}

/// Split a datagram into trimmed, non-empty lines
pub fn decode_datagram(bytes: &[u8]) -> Vec<String> {
    match std::str::from_utf8(bytes) {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect(),
        Err(e) => vec![format!("Read error: {}", e)],
    }
}
