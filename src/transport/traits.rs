use std::io::Result;
use std::net::SocketAddr;

/// Datagram channel the SD runtime sends and receives through.
/// Object safe so tests can swap in an in-memory channel.
pub trait SomeIpTransport: Send + Sync {
    /// Sends `data` to `destination`; connectionless transports fail without one.
    fn send(&self, data: &[u8], destination: Option<SocketAddr>) -> Result<usize>;

    /// Reads one datagram, returning its length and source address.
    fn receive(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;
}
