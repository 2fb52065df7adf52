use std::collections::HashMap;
use std::net::SocketAddr;

/// Session id and reboot flag of one SD sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: u16,
    pub reboot_flag: bool,
}

impl SessionState {
    /// What a peer we never heard from is assumed to have sent.
    pub const UNKNOWN: SessionState = SessionState { session_id: 0, reboot_flag: true };

    /// State of a sender right after startup.
    pub fn initial() -> Self {
        SessionState { session_id: 1, reboot_flag: true }
    }

    /// Session ids wrap from 0xFFFF to 1; the first wrap clears the reboot flag for good.
    fn advance(&mut self) {
        self.session_id = self.session_id.wrapping_add(1);
        if self.session_id == 0 {
            self.session_id = 1;
            self.reboot_flag = false;
        }
    }
}

/// [PRS_SOMEIPSD_00500] A peer rebooted if its reboot flag went from 0 to 1, or
/// stayed 1 while the session id did not increase.
pub fn is_reboot_detected(old: SessionState, new: SessionState) -> bool {
    (!old.reboot_flag && new.reboot_flag) || (old.reboot_flag && new.reboot_flag && old.session_id >= new.session_id)
}

/// Outgoing session counters: one shared by all multicast messages, one per unicast peer.
#[derive(Debug)]
pub struct SenderSessions {
    multicast: SessionState,
    unicast: HashMap<SocketAddr, SessionState>,
}

impl SenderSessions {
    pub fn new() -> Self {
        SenderSessions { multicast: SessionState::initial(), unicast: HashMap::new() }
    }

    /// State to stamp on the next multicast message.
    pub fn next_multicast(&mut self) -> SessionState {
        let current = self.multicast;
        self.multicast.advance();
        current
    }

    /// State to stamp on the next unicast message to `to`.
    pub fn next_unicast(&mut self, to: SocketAddr) -> SessionState {
        let counter = self.unicast.entry(to).or_insert_with(SessionState::initial);
        let current = *counter;
        counter.advance();
        current
    }
}

impl Default for SenderSessions {
    fn default() -> Self {
        Self::new()
    }
}

/// Last session state seen from each peer, tracked separately for multicast and unicast.
#[derive(Debug, Default)]
pub struct ReceiverSessions {
    multicast: HashMap<SocketAddr, SessionState>,
    unicast: HashMap<SocketAddr, SessionState>,
}

impl ReceiverSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `state` for `from` and reports whether the peer rebooted.
    /// On a reboot the other channel's history is reset so that it does not
    /// report the same reboot a second time.
    pub fn on_received(&mut self, from: SocketAddr, is_multicast: bool, state: SessionState) -> bool {
        let (seen, other) = if is_multicast {
            (&mut self.multicast, &mut self.unicast)
        } else {
            (&mut self.unicast, &mut self.multicast)
        };
        let previous = seen.insert(from, state).unwrap_or(SessionState::UNKNOWN);
        let rebooted = previous != SessionState::UNKNOWN && is_reboot_detected(previous, state);
        if rebooted {
            other.insert(from, SessionState::UNKNOWN);
        }
        rebooted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.168.0.20:30490".parse().unwrap()
    }

    fn s(session_id: u16, reboot_flag: bool) -> SessionState {
        SessionState { session_id, reboot_flag }
    }

    #[test]
    fn test_session_id_increment() {
        let mut sender = SenderSessions::new();
        assert_eq!(sender.next_multicast(), s(1, true));
        assert_eq!(sender.next_multicast(), s(2, true));
        assert_eq!(sender.next_multicast(), s(3, true));
    }

    #[test]
    fn test_unicast_counters_are_per_peer() {
        let mut sender = SenderSessions::new();
        let other: SocketAddr = "192.168.0.21:30490".parse().unwrap();
        assert_eq!(sender.next_unicast(peer()), s(1, true));
        assert_eq!(sender.next_unicast(other), s(1, true));
        assert_eq!(sender.next_unicast(peer()), s(2, true));
        // multicast is independent of unicast
        assert_eq!(sender.next_multicast(), s(1, true));
    }

    #[test]
    fn test_wrap_skips_zero_and_clears_reboot_flag() {
        let mut sender = SenderSessions::new();
        sender.multicast = s(0xFFFF, true);
        assert_eq!(sender.next_multicast(), s(0xFFFF, true));
        assert_eq!(sender.next_multicast(), s(1, false));
        assert_eq!(sender.next_multicast(), s(2, false));
    }

    #[test]
    fn test_reboot_detection_rules() {
        assert!(!is_reboot_detected(s(5, true), s(6, true)));
        assert!(is_reboot_detected(s(5, true), s(5, true)));
        assert!(is_reboot_detected(s(5, true), s(1, true)));
        assert!(is_reboot_detected(s(300, false), s(1, true)));
        assert!(!is_reboot_detected(s(0xFFFF, true), s(1, false)));
        assert!(!is_reboot_detected(s(10, false), s(11, false)));
    }

    #[test]
    fn test_first_message_is_not_a_reboot() {
        let mut receiver = ReceiverSessions::new();
        assert!(!receiver.on_received(peer(), true, s(40, true)));
        assert!(!receiver.on_received(peer(), true, s(41, true)));
        assert!(receiver.on_received(peer(), true, s(1, true)));
    }

    #[test]
    fn test_reboot_resets_other_channel() {
        let mut receiver = ReceiverSessions::new();
        receiver.on_received(peer(), false, s(10, true));
        receiver.on_received(peer(), true, s(20, true));

        // multicast detects the reboot
        assert!(receiver.on_received(peer(), true, s(1, true)));
        // the unicast history was forgotten, so the restarted unicast counter is accepted
        assert!(!receiver.on_received(peer(), false, s(1, true)));
    }
}
