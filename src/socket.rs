use std::collections::HashMap;
use std::net;
use std::sync::Arc;
use std::time;

use parking_lot::RwLock;
use tracing::trace;

use crate::packet::{self, Packet};
use crate::session::{Destination, Transport};
use crate::skb::Tsi;

const SOCKET_POLLING_KEY: usize = 0;

type SourceTable = Arc<RwLock<HashMap<Tsi, net::SocketAddr>>>;

/// Sending half of a UDP-encapsulated session.
///
/// Group traffic is sent to every configured group address. Traffic for a data source is sent to
/// the address its packets were last received from, or to the group while that is unknown.
pub struct UdpTransport {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
    group_addrs: Vec<net::SocketAddr>,
    // Source addresses learned by the receiver
    sources: SourceTable,
}

/// Receiving half of a UDP-encapsulated session.
pub struct UdpReceiver {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
    // Always-allocated receive buffer
    recv_buffer: Box<[u8]>,
    sources: SourceTable,
}

impl UdpTransport {
    fn send_group(&self, bytes: &[u8]) -> std::io::Result<()> {
        for addr in &self.group_addrs {
            self.socket.send_to(bytes, addr)?;
        }
        Ok(())
    }

    pub fn local_addr(&self) -> std::io::Result<net::SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send(&self, bytes: &[u8], dest: Destination) -> std::io::Result<()> {
        match dest {
            Destination::Group => self.send_group(bytes),
            Destination::Source(tsi) => {
                let addr = self.sources.read().get(&tsi).copied();
                match addr {
                    Some(addr) => self.socket.send_to(bytes, addr).map(|_| ()),
                    None => self.send_group(bytes),
                }
            }
        }
    }
}

impl UdpReceiver {
    // Remembers where downstream packets of each source come from
    fn learn_source(sources: &SourceTable, bytes: &[u8], sender_addr: net::SocketAddr) {
        if let Ok(datagram) = packet::read(bytes) {
            match datagram.packet {
                Packet::Spm(_) | Packet::Odata(_) | Packet::Rdata(_) | Packet::Ncf(_) => {
                    let previous = sources.write().insert(datagram.tsi, sender_addr);
                    if previous != Some(sender_addr) {
                        trace!(tsi = %datagram.tsi, %sender_addr, "learned source address");
                    }
                }
                _ => (),
            }
        }
    }

    /// If a datagram can be read from the socket, returns it. Returns Ok(None) otherwise.
    pub fn try_read_datagram(&mut self) -> std::io::Result<Option<&[u8]>> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((len, sender_addr)) => {
                let bytes = &self.recv_buffer[..len];
                Self::learn_source(&self.sources, bytes, sender_addr);
                Ok(Some(bytes))
            }
            Err(err) => match err.kind() {
                // The only acceptable error is WouldBlock, indicating no datagram
                std::io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            },
        }
    }

    /// Blocks for a duration of up to `timeout` for an incoming datagram and returns it. Returns
    /// Ok(None) if no datagram could be read in the allotted time, or if polling awoke spuriously.
    pub fn wait_for_datagram(
        &mut self,
        timeout: Option<time::Duration>,
    ) -> std::io::Result<Option<&[u8]>> {
        // Wait for a readable event (must be done prior to each wait() call)
        self.poller
            .modify(&*self.socket, polling::Event::readable(SOCKET_POLLING_KEY))?;

        self.poller_events.clear();

        let n = self.poller.wait(&mut self.poller_events, timeout)?;

        if n > 0 {
            self.try_read_datagram()
        } else {
            Ok(None)
        }
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        let _ = self.poller.delete(&*self.socket);
    }
}

/// Binds a non-blocking UDP socket at `bind_address`. Group traffic is sent to each of
/// `group_addrs`.
pub fn bind<A>(
    bind_address: A,
    group_addrs: Vec<net::SocketAddr>,
    max_tpdu: usize,
) -> std::io::Result<(UdpTransport, UdpReceiver)>
where
    A: net::ToSocketAddrs,
{
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;

    let local_addr = socket.local_addr()?;

    let poller = polling::Poller::new()?;

    unsafe {
        poller.add(&socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
    }

    let socket_rc = Arc::new(socket);
    let sources = SourceTable::default();

    let tx = UdpTransport {
        socket: Arc::clone(&socket_rc),
        group_addrs,
        sources: Arc::clone(&sources),
    };

    let rx = UdpReceiver {
        socket: socket_rc,
        local_addr,
        poller,
        poller_events: polling::Events::new(),
        recv_buffer: vec![0; max_tpdu].into_boxed_slice(),
        sources,
    };

    Ok((tx, rx))
}
