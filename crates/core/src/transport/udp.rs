use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use super::PacketSource;
use crate::error::{HbrmtError, Result};

#[derive(Debug, Clone)]
pub struct UdpSourceConfig {
    /// Local address to bind, e.g. `0.0.0.0:5000`.
    pub bind: SocketAddr,
    /// IPv4 multicast group to join.
    pub multicast: Option<Ipv4Addr>,
    /// Local interface for the multicast membership.
    pub interface: Ipv4Addr,
    /// Upper bound on a blocking read, so the receive loop observes its stop
    /// flag.
    pub read_timeout: Duration,
}

impl Default for UdpSourceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 5000)),
            multicast: None,
            interface: Ipv4Addr::UNSPECIFIED,
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// UDP socket source, one per network leg.
///
/// Also used by the sender: [`send_to`](Self::send_to) writes datagrams
/// from the same socket.
#[derive(Debug)]
pub struct UdpSource {
    socket: Option<UdpSocket>,
    local: SocketAddr,
}

impl UdpSource {
    pub fn bind(config: &UdpSourceConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind)?;
        socket.set_read_timeout(Some(config.read_timeout))?;
        if let Some(group) = config.multicast {
            if !group.is_multicast() {
                return Err(HbrmtError::InvalidConfig(format!("{group} is not a multicast address")));
            }
            socket.join_multicast_v4(&group, &config.interface)?;
            tracing::info!(%group, interface = %config.interface, "joined multicast group");
        }
        let local = socket.local_addr()?;
        tracing::info!(%local, "UDP source bound");
        Ok(Self {
            socket: Some(socket),
            local,
        })
    }

    /// Bind an ephemeral socket for sending only.
    pub fn sender() -> Result<Self> {
        Self::bind(&UdpSourceConfig {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            ..Default::default()
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Send one datagram.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(HbrmtError::Closed)?;
        Ok(socket.send_to(payload, addr)?)
    }
}

impl PacketSource for UdpSource {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let socket = self.socket.as_ref().ok_or(HbrmtError::Closed)?;
        match socket.recv(buf) {
            Ok(len) => Ok(len),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(HbrmtError::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.socket.take().is_some() {
            tracing::debug!(local = %self.local, "UDP source closed");
        }
        Ok(())
    }
}
