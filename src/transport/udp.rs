use super::traits::SomeIpTransport;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// Non-blocking UDP socket carrying SD datagrams.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Unicast SD socket bound to `addr`. Outgoing multicast leaves through `addr`'s interface
    /// and is looped back so other processes on the host see it.
    pub fn bind_unicast(addr: SocketAddr) -> Result<Self> {
        let socket = new_socket(addr)?;
        socket.bind(&addr.into())?;
        match addr.ip() {
            IpAddr::V4(v4) => {
                socket.set_multicast_if_v4(&v4)?;
                socket.set_multicast_loop_v4(true)?;
            }
            IpAddr::V6(_) => socket.set_multicast_loop_v6(true)?,
        }
        Ok(UdpTransport { socket: socket.into() })
    }

    /// Socket bound to the wildcard address on `group`'s port and joined to `group` on `interface`.
    pub fn bind_multicast(group: SocketAddr, interface: IpAddr) -> Result<Self> {
        let socket = new_socket(group)?;
        let any = match group.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        socket.bind(&SocketAddr::new(any, group.port()).into())?;
        match (group.ip(), interface) {
            (IpAddr::V4(g), IpAddr::V4(i)) => socket.join_multicast_v4(&g, &i)?,
            (IpAddr::V6(g), _) => socket.join_multicast_v6(&g, 0)?,
            (IpAddr::V4(_), IpAddr::V6(_)) => {
                return Err(Error::new(ErrorKind::InvalidInput, "IPv4 group on an IPv6 interface"));
            }
        }
        Ok(UdpTransport { socket: socket.into() })
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(UdpTransport { socket: self.socket.try_clone()? })
    }

    /// Hands the socket over to the tokio reactor.
    pub fn into_tokio(self) -> Result<tokio::net::UdpSocket> {
        tokio::net::UdpSocket::from_std(self.socket)
    }
}

fn new_socket(addr: SocketAddr) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

impl SomeIpTransport for UdpTransport {
    fn send(&self, data: &[u8], destination: Option<SocketAddr>) -> Result<usize> {
        match destination {
            Some(dest) => self.socket.send_to(data, dest),
            None => Err(Error::new(ErrorKind::InvalidInput, "UDP requires a destination address")),
        }
    }

    fn receive(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket.recv_from(buffer)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }
}
