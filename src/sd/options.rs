use crate::codec::{SomeIpSerialize, SomeIpDeserialize};
use std::io::{Result, Write, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const IPV4_ENDPOINT: u8 = 0x04;
const IPV6_ENDPOINT: u8 = 0x06;
const IPV4_MULTICAST: u8 = 0x14;
const IPV6_MULTICAST: u8 = 0x16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportProtocol {
    Tcp = 0x06,
    Udp = 0x11,
}

impl TransportProtocol {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x06 => Some(TransportProtocol::Tcp),
            0x11 => Some(TransportProtocol::Udp),
            _ => None,
        }
    }
}

/// Endpoint descriptor carried by IPv4/IPv6 endpoint and multicast options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointOption {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: TransportProtocol,
    pub is_multicast: bool,
}

impl EndpointOption {
    pub fn unicast(address: IpAddr, port: u16, protocol: TransportProtocol) -> Self {
        EndpointOption { address, port, protocol, is_multicast: false }
    }

    pub fn multicast(address: IpAddr, port: u16) -> Self {
        EndpointOption { address, port, protocol: TransportProtocol::Udp, is_multicast: true }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    fn type_id(&self) -> u8 {
        match (self.address, self.is_multicast) {
            (IpAddr::V4(_), false) => IPV4_ENDPOINT,
            (IpAddr::V4(_), true) => IPV4_MULTICAST,
            (IpAddr::V6(_), false) => IPV6_ENDPOINT,
            (IpAddr::V6(_), true) => IPV6_MULTICAST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdOption {
    Endpoint(EndpointOption),
    /// Option types the engine does not interpret (configuration, load balancing, ...)
    Unknown {
        length: u16,
        type_id: u8,
        data: Vec<u8>,
    },
}

impl SdOption {
    pub fn endpoint(&self) -> Option<&EndpointOption> {
        match self {
            SdOption::Endpoint(ep) => Some(ep),
            SdOption::Unknown { .. } => None,
        }
    }
}

impl From<EndpointOption> for SdOption {
    fn from(ep: EndpointOption) -> Self {
        SdOption::Endpoint(ep)
    }
}

impl SomeIpSerialize for SdOption {
    fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            SdOption::Endpoint(ep) => {
                // Length counts the bytes after the type field:
                // [Res:1][Addr:4|16][Res:1][L4:1][Port:2]
                let len: u16 = match ep.address {
                    IpAddr::V4(_) => 0x0009,
                    IpAddr::V6(_) => 0x0015,
                };
                len.serialize(writer)?;
                ep.type_id().serialize(writer)?;
                writer.write_all(&[0x00])?;
                match ep.address {
                    IpAddr::V4(a) => writer.write_all(&a.octets())?,
                    IpAddr::V6(a) => writer.write_all(&a.octets())?,
                }
                writer.write_all(&[0x00])?;
                (ep.protocol as u8).serialize(writer)?;
                ep.port.serialize(writer)?;
            }
            SdOption::Unknown { length, type_id, data } => {
                length.serialize(writer)?;
                type_id.serialize(writer)?;
                writer.write_all(data)?;
            }
        }
        Ok(())
    }
}

impl SomeIpDeserialize for SdOption {
    fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let length = u16::deserialize(reader)?;
        let type_id = u8::deserialize(reader)?;

        let mut data = vec![0u8; length as usize];
        reader.read_exact(&mut data)?;

        let unknown = |data: Vec<u8>| SdOption::Unknown { length, type_id, data };

        let (address, tail) = match type_id {
            IPV4_ENDPOINT | IPV4_MULTICAST if data.len() >= 9 => {
                let addr = IpAddr::V4(Ipv4Addr::new(data[1], data[2], data[3], data[4]));
                (addr, 5)
            }
            IPV6_ENDPOINT | IPV6_MULTICAST if data.len() >= 21 => {
                let mut ip_bytes = [0u8; 16];
                ip_bytes.copy_from_slice(&data[1..17]);
                (IpAddr::V6(Ipv6Addr::from(ip_bytes)), 17)
            }
            _ => return Ok(unknown(data)),
        };

        // data[tail] is reserved
        let Some(protocol) = TransportProtocol::from_u8(data[tail + 1]) else {
            return Ok(unknown(data));
        };
        let port = u16::from_be_bytes([data[tail + 2], data[tail + 3]]);

        Ok(SdOption::Endpoint(EndpointOption {
            address,
            port,
            protocol,
            is_multicast: matches!(type_id, IPV4_MULTICAST | IPV6_MULTICAST),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_multicast_layout() {
        let opt = SdOption::from(EndpointOption::multicast("239.0.0.1".parse().unwrap(), 30501));
        let mut buf = Vec::new();
        opt.serialize(&mut buf).unwrap();

        assert_eq!(buf.len(), 12);
        assert_eq!(buf[0..2], [0x00, 0x09]);
        assert_eq!(buf[2], 0x14);
        assert_eq!(buf[4..8], [239, 0, 0, 1]);
        assert_eq!(buf[9], 0x11);
        assert_eq!(buf[10..12], 30501u16.to_be_bytes());
    }

    #[test]
    fn test_ipv6_tcp_endpoint() {
        let addr: IpAddr = "fd00::1".parse().unwrap();
        let opt = SdOption::from(EndpointOption::unicast(addr, 40000, TransportProtocol::Tcp));
        let mut buf = Vec::new();
        opt.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(buf[2], 0x06);

        let parsed = SdOption::deserialize(&mut &buf[..]).unwrap();
        let ep = parsed.endpoint().unwrap();
        assert_eq!(ep.socket_addr(), SocketAddr::new(addr, 40000));
        assert_eq!(ep.protocol, TransportProtocol::Tcp);
        assert!(!ep.is_multicast);
    }

    #[test]
    fn test_unknown_protocol_is_kept_verbatim() {
        let raw = [0x00, 0x09, 0x04, 0x00, 10, 0, 0, 1, 0x00, 0x84, 0x12, 0x34];
        let parsed = SdOption::deserialize(&mut &raw[..]).unwrap();
        match parsed {
            SdOption::Unknown { length, type_id, data } => {
                assert_eq!(length, 9);
                assert_eq!(type_id, 0x04);
                assert_eq!(data.len(), 9);
            }
            other => panic!("expected unknown option, got {:?}", other),
        }
    }

    #[test]
    fn test_configuration_option_is_unknown() {
        let raw = [0x00, 0x03, 0x01, 0x00, b'a', b'b'];
        let parsed = SdOption::deserialize(&mut &raw[..]).unwrap();
        assert!(parsed.endpoint().is_none());
    }
}
