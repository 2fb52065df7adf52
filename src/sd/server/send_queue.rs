use std::net::SocketAddr;
use std::time::Instant;

/// Pending unicast offers are bounded per state machine.
pub const MAX_PENDING_UNICAST: usize = 256;

/// Offer due for transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueOffer {
    Multicast,
    Unicast(SocketAddr),
}

/// Delayed offers of one server state machine.
///
/// There is at most one pending offer per destination. A new request for a
/// destination that already waits keeps the earlier deadline.
#[derive(Debug, Default)]
pub struct OfferSendQueue {
    multicast: Option<Instant>,
    // insertion order, oldest first
    unicast: Vec<(SocketAddr, Instant)>,
}

impl OfferSendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_multicast(&mut self, deadline: Instant) {
        self.multicast = Some(self.multicast.map_or(deadline, |d| d.min(deadline)));
    }

    /// Queues a unicast offer. When the queue is full the oldest pending
    /// destination is evicted and returned so that it can be sent right away.
    pub fn push_unicast(&mut self, to: SocketAddr, deadline: Instant) -> Option<SocketAddr> {
        if let Some((_, pending)) = self.unicast.iter_mut().find(|(addr, _)| *addr == to) {
            *pending = (*pending).min(deadline);
            return None;
        }
        let evicted = if self.unicast.len() >= MAX_PENDING_UNICAST {
            Some(self.unicast.remove(0).0)
        } else {
            None
        };
        self.unicast.push((to, deadline));
        evicted
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.unicast.iter().map(|(_, d)| *d).chain(self.multicast).min()
    }

    /// Removes and returns every offer due at `now`, multicast first.
    pub fn take_due(&mut self, now: Instant) -> Vec<DueOffer> {
        let mut due = Vec::new();
        if self.multicast.is_some_and(|d| d <= now) {
            self.multicast = None;
            due.push(DueOffer::Multicast);
        }
        self.unicast.retain(|(to, deadline)| {
            if *deadline <= now {
                due.push(DueOffer::Unicast(*to));
                false
            } else {
                true
            }
        });
        due
    }

    pub fn len(&self) -> usize {
        self.unicast.len() + usize::from(self.multicast.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.multicast = None;
        self.unicast.clear();
    }
}
