use crate::sd::entries::SdEntry;
use crate::sd::options::{EndpointOption, TransportProtocol};
use std::net::SocketAddr;

/// Offer a client currently relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOffer {
    /// SD endpoint of the server
    pub from: SocketAddr,
    pub major_version: u8,
    pub minor_version: u32,
    pub ttl: u32,
    pub tcp: Option<SocketAddr>,
    pub udp: Option<SocketAddr>,
    /// Received on the SD multicast group
    pub is_multicast: bool,
}

impl ClientOffer {
    /// Builds an offer from an OfferService entry and its resolved options.
    /// Returns None for offers that name no endpoint to connect to.
    pub fn from_entry(from: SocketAddr, entry: &SdEntry, endpoints: &[EndpointOption], is_multicast: bool) -> Option<Self> {
        let find = |protocol| {
            endpoints
                .iter()
                .find(|ep| !ep.is_multicast && ep.protocol == protocol)
                .map(EndpointOption::socket_addr)
        };
        let tcp = find(TransportProtocol::Tcp);
        let udp = find(TransportProtocol::Udp);
        if tcp.is_none() && udp.is_none() {
            return None;
        }
        Some(ClientOffer {
            from,
            major_version: entry.major_version,
            minor_version: entry.minor_version,
            ttl: entry.ttl,
            tcp,
            udp,
            is_multicast,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd::entries::EntryType;

    #[test]
    fn test_offer_needs_an_endpoint() {
        let from: SocketAddr = "192.168.0.10:30490".parse().unwrap();
        let entry = SdEntry::service(EntryType::OfferService, 0x1234, 1, 1, 0, 3);
        assert_eq!(ClientOffer::from_entry(from, &entry, &[], true), None);

        let group = EndpointOption::multicast("239.0.0.1".parse().unwrap(), 30600);
        assert_eq!(ClientOffer::from_entry(from, &entry, &[group], true), None);

        let udp = EndpointOption::unicast(from.ip(), 30501, TransportProtocol::Udp);
        let offer = ClientOffer::from_entry(from, &entry, &[group, udp], false).unwrap();
        assert_eq!(offer.udp, Some("192.168.0.10:30501".parse().unwrap()));
        assert_eq!(offer.tcp, None);
        assert_eq!(offer.ttl, 3);
    }
}
