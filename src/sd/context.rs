use crate::sd::entries::SdEntry;
use crate::sd::options::SdOption;
use crate::sd::packet::SdPacket;
use rand::Rng;
use rand::rngs::StdRng;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// SD multicast group of the sending endpoint
    Multicast,
    Unicast(SocketAddr),
}

/// SD message queued by a state machine, not yet encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Local network endpoint the message leaves from
    pub local: IpAddr,
    pub destination: Destination,
    pub packet: SdPacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventgroupChange {
    Subscribed,
    Unsubscribed,
    Pending,
}

/// Upward call from a client state machine, drained by the façade after each dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventgroupNotification {
    pub service_id: u16,
    pub instance_id: u16,
    pub eventgroup_id: u16,
    pub change: EventgroupChange,
}

/// Capabilities handed to a state machine for the duration of one call.
pub struct SdContext<'a> {
    now: Instant,
    rng: &'a mut StdRng,
    outbox: &'a mut Vec<OutboundMessage>,
    notifications: &'a mut Vec<EventgroupNotification>,
}

impl<'a> SdContext<'a> {
    pub fn new(
        now: Instant,
        rng: &'a mut StdRng,
        outbox: &'a mut Vec<OutboundMessage>,
        notifications: &'a mut Vec<EventgroupNotification>,
    ) -> Self {
        SdContext { now, rng, outbox, notifications }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Uniformly distributed delay in [min, max]; `min` when the range is empty.
    pub fn random_delay(&mut self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let nanos = self.rng.gen_range(min.as_nanos() as u64..=max.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }

    pub fn send(&mut self, local: IpAddr, destination: Destination, packet: SdPacket) {
        self.outbox.push(OutboundMessage { local, destination, packet });
    }

    pub fn send_entry(&mut self, local: IpAddr, destination: Destination, entry: SdEntry, options: &[SdOption]) {
        let mut packet = SdPacket::new();
        packet.push(entry, options);
        self.send(local, destination, packet);
    }

    pub fn notify(&mut self, notification: EventgroupNotification) {
        self.notifications.push(notification);
    }
}
