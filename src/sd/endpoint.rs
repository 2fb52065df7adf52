use crate::error::Result;
use crate::runtime::config::NetworkEndpointConfig;
use crate::sd::context::Destination;
use crate::sd::packet::{FLAG_REBOOT, FLAG_UNICAST, SdPacket};
use crate::sd::reboot::{ReceiverSessions, SenderSessions, SessionState};
use std::net::{IpAddr, SocketAddr};

/// Decoded inbound SD message.
#[derive(Debug)]
pub struct Inbound {
    pub packet: SdPacket,
    pub reboot_detected: bool,
}

/// Per network endpoint SD state: addressing, session stamping and reboot detection.
pub struct SdEndpoint {
    config: NetworkEndpointConfig,
    sender: SenderSessions,
    receiver: ReceiverSessions,
}

impl SdEndpoint {
    pub fn new(config: NetworkEndpointConfig) -> Self {
        SdEndpoint { config, sender: SenderSessions::new(), receiver: ReceiverSessions::new() }
    }

    pub fn address(&self) -> IpAddr {
        self.config.address
    }

    pub fn unicast_addr(&self) -> SocketAddr {
        SocketAddr::new(self.config.address, self.config.sd_port)
    }

    pub fn multicast_addr(&self) -> SocketAddr {
        SocketAddr::new(self.config.sd_multicast_address, self.config.sd_port)
    }

    pub fn mtu(&self) -> usize {
        self.config.mtu
    }

    /// Stamps flags and session id on `packet` and produces the datagram to send.
    pub fn encode(&mut self, destination: Destination, packet: &SdPacket) -> Result<(SocketAddr, Vec<u8>)> {
        let (to, session) = match destination {
            Destination::Multicast => (self.multicast_addr(), self.sender.next_multicast()),
            Destination::Unicast(to) => (to, self.sender.next_unicast(to)),
        };
        let mut packet = packet.clone();
        packet.flags = FLAG_UNICAST | if session.reboot_flag { FLAG_REBOOT } else { 0 };
        Ok((to, packet.encode(session.session_id)?))
    }

    pub fn decode(&mut self, from: SocketAddr, is_multicast: bool, datagram: &[u8]) -> Result<Inbound> {
        let (header, packet) = SdPacket::decode(datagram)?;
        let state = SessionState { session_id: header.session_id, reboot_flag: packet.reboot_flag() };
        let reboot_detected = self.receiver.on_received(from, is_multicast, state);
        Ok(Inbound { packet, reboot_detected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd::entries::{EntryType, SdEntry};

    fn endpoint() -> SdEndpoint {
        SdEndpoint::new(NetworkEndpointConfig {
            address: "192.168.0.10".parse().unwrap(),
            sd_multicast_address: "224.244.224.245".parse().unwrap(),
            sd_port: 30490,
            mtu: 1400,
        })
    }

    fn offer_packet() -> SdPacket {
        let mut p = SdPacket::new();
        p.push(SdEntry::service(EntryType::OfferService, 0x1234, 1, 1, 0, 3), &[]);
        p
    }

    #[test]
    fn test_encode_stamps_flags_and_session() {
        let mut ep = endpoint();
        let (to, bytes) = ep.encode(Destination::Multicast, &offer_packet()).unwrap();
        assert_eq!(to, "224.244.224.245:30490".parse::<SocketAddr>().unwrap());
        assert_eq!(bytes[10..12], [0, 1]);
        assert_eq!(bytes[16], FLAG_REBOOT | FLAG_UNICAST);

        let (_, bytes) = ep.encode(Destination::Multicast, &offer_packet()).unwrap();
        assert_eq!(bytes[10..12], [0, 2]);
    }

    #[test]
    fn test_peer_restart_is_detected() {
        let mut server = endpoint();
        let mut client = endpoint();
        let from: SocketAddr = "192.168.0.20:30490".parse().unwrap();

        for _ in 0..3 {
            let (_, bytes) = server.encode(Destination::Multicast, &offer_packet()).unwrap();
            assert!(!client.decode(from, true, &bytes).unwrap().reboot_detected);
        }

        // the server restarts and counts from 1 again
        let mut restarted = endpoint();
        let (_, bytes) = restarted.encode(Destination::Multicast, &offer_packet()).unwrap();
        let inbound = client.decode(from, true, &bytes).unwrap();
        assert!(inbound.reboot_detected);
        assert_eq!(inbound.packet.entries.len(), 1);
    }

    #[test]
    fn test_decode_rejects_non_sd() {
        let mut ep = endpoint();
        let mut bytes = offer_packet().encode(1).unwrap();
        bytes[3] = 0x01;
        assert!(ep.decode("192.168.0.20:30490".parse().unwrap(), false, &bytes).is_err());
    }
}
