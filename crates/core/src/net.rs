//! UDP sockets for RTP/RTCP port pairs.
//!
//! Sockets are created through `socket2` so that `SO_REUSEADDR` is set
//! before binding; several tools may listen on the same multicast group.
//! All receive sockets are non-blocking and meant to be registered with a
//! [`Reactor`](crate::reactor::Reactor).

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::Result;
use crate::playout::PacketSink;
use crate::translate::Endpoint;

/// Largest datagram the tools read.
pub const MAX_DATAGRAM: usize = 8192;

fn udp_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}

fn bind(socket: &Socket, addr: SocketAddrV4) -> io::Result<()> {
    socket.bind(&SockAddr::from(SocketAddr::V4(addr)))
}

/// Bind a non-blocking receive socket on `addr:port`, joining the group
/// when `addr` is multicast.
pub fn bind_receiver(addr: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = udp_socket()?;
    if addr.is_multicast() {
        match bind(&socket, SocketAddrV4::new(addr, port)) {
            Err(e) if e.raw_os_error() == Some(libc::EADDRNOTAVAIL) => {
                bind(&socket, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
            }
            other => other?,
        }
        socket.join_multicast_v4(&addr, &Ipv4Addr::UNSPECIFIED)?;
    } else {
        bind(&socket, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
    }
    socket.set_nonblocking(true)?;
    tracing::debug!(%addr, port, "receiver bound");
    Ok(socket.into())
}

/// Bind a send socket. `source_port` pins the local port, otherwise an
/// ephemeral one is used. Multicast loopback is off so a relay does not
/// hear its own output.
pub fn bind_sender(ttl: u8, source_port: Option<u16>) -> Result<UdpSocket> {
    let socket = udp_socket()?;
    bind(
        &socket,
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, source_port.unwrap_or(0)),
    )?;
    socket.set_multicast_ttl_v4(ttl as u32)?;
    socket.set_multicast_loop_v4(false)?;
    Ok(socket.into())
}

/// Receive one datagram from a non-blocking socket. `None` when nothing is
/// queued or the sender is not IPv4.
pub fn recv(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
    match socket.recv_from(buf) {
        Ok((len, SocketAddr::V4(from))) => Ok(Some((len, from))),
        Ok((_, SocketAddr::V6(_))) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Receive sockets for an endpoint's data and control ports.
#[derive(Debug)]
pub struct PortPair {
    pub data: UdpSocket,
    pub control: UdpSocket,
}

impl PortPair {
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        Ok(Self {
            data: bind_receiver(endpoint.addr, endpoint.port)?,
            control: bind_receiver(endpoint.addr, endpoint.port.wrapping_add(1))?,
        })
    }

    pub fn socket(&self, control: bool) -> &UdpSocket {
        if control { &self.control } else { &self.data }
    }
}

/// Replay sink: one socket per port, connected to the destination.
#[derive(Debug)]
pub struct UdpSink {
    data: UdpSocket,
    control: UdpSocket,
}

impl UdpSink {
    /// Connect to `dest`. With `source_port`, the sockets are bound to
    /// `source_port` and `source_port + 1`.
    pub fn connect(dest: &Endpoint, source_port: Option<u16>) -> Result<Self> {
        let data = bind_sender(dest.ttl, source_port)?;
        data.connect(dest.data_addr())?;
        let control = bind_sender(dest.ttl, source_port.map(|p| p.wrapping_add(1)))?;
        control.connect(dest.control_addr())?;
        tracing::debug!(dest = %dest, ?source_port, "replay sockets connected");
        Ok(Self { data, control })
    }
}

impl PacketSink for UdpSink {
    fn send(&mut self, packet: &[u8], control: bool) -> io::Result<()> {
        let socket = if control { &self.control } else { &self.data };
        socket.send(packet)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn free_port_pair() -> (UdpSocket, UdpSocket) {
        for _ in 0..50 {
            let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
            let port = probe.local_addr().unwrap().port() & !1;
            drop(probe);
            let data = UdpSocket::bind(("127.0.0.1", port));
            let control = UdpSocket::bind(("127.0.0.1", port + 1));
            if let (Ok(data), Ok(control)) = (data, control) {
                return (data, control);
            }
        }
        panic!("no free port pair on loopback");
    }

    #[test]
    fn sink_delivers_to_data_and_control_ports() {
        let (data, control) = free_port_pair();
        let port = data.local_addr().unwrap().port();
        for s in [&data, &control] {
            s.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        }

        let mut sink = UdpSink::connect(&Endpoint::new(Ipv4Addr::LOCALHOST, port), None).unwrap();
        sink.send(b"rtp", false).unwrap();
        sink.send(b"rtcp", true).unwrap();

        let mut buf = [0u8; 16];
        let n = data.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"rtp");
        let n = control.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"rtcp");
    }

    #[test]
    fn nonblocking_recv_reports_empty() {
        let socket = bind_receiver(Ipv4Addr::LOCALHOST, 0).unwrap();
        let mut buf = [0u8; 16];
        assert!(recv(&socket, &mut buf).unwrap().is_none());
    }
}
