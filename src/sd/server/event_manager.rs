use crate::logging::Sid;
use crate::runtime::config::{PortMappingConfig, ServerSdConfig};
use crate::sd::context::{Destination, SdContext};
use crate::sd::entries::{SdEntry, TTL_INFINITE};
use crate::sd::instance::{EventgroupSubscriber, ServerServiceInstance, ServiceInstanceKey};
use crate::sd::options::{EndpointOption, TransportProtocol};
use crate::sd::server::message_builder::ServerMessageBuilder;
use crate::sd::timer::{Timer, earliest};
use log::{debug, info};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    subscriber: EventgroupSubscriber,
    eventgroup_id: u16,
}

#[derive(Debug)]
struct Subscription {
    key: SubscriptionKey,
    // SD endpoint the subscribe came from
    sd_address: SocketAddr,
    ttl_timer: Timer,
}

impl Subscription {
    fn restart_ttl(&mut self, now: Instant, ttl: u32) {
        if ttl == TTL_INFINITE {
            self.ttl_timer.stop();
        } else {
            self.ttl_timer.start(now, Duration::from_secs(u64::from(ttl)), false);
        }
    }

    fn owned_by(&self, peer: IpAddr) -> bool {
        self.sd_address.ip() == peer
            || self.key.subscriber.tcp.is_some_and(|a| a.ip() == peer)
            || self.key.subscriber.udp.is_some_and(|a| a.ip() == peer)
    }
}

/// Eventgroup subscriptions accepted by one provided instance on one port mapping.
pub struct ServerEventManager {
    key: ServiceInstanceKey,
    local: IpAddr,
    mapping: PortMappingConfig,
    sd: ServerSdConfig,
    // eventgroups the service declares
    eventgroups: Vec<u16>,
    subscriptions: Vec<Subscription>,
}

impl ServerEventManager {
    pub fn new(key: ServiceInstanceKey, mapping: PortMappingConfig, sd: ServerSdConfig, eventgroups: Vec<u16>) -> Self {
        ServerEventManager { key, local: mapping.address, mapping, sd, eventgroups, subscriptions: Vec::new() }
    }

    pub fn subscriber_count(&self, eventgroup_id: u16) -> usize {
        self.subscriptions.iter().filter(|s| s.key.eventgroup_id == eventgroup_id).count()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// SubscribeEventgroup with ttl > 0: new subscription or renewal.
    pub fn on_subscribe(
        &mut self,
        ctx: &mut SdContext<'_>,
        instance: &mut dyn ServerServiceInstance,
        builder: &ServerMessageBuilder,
        from: SocketAddr,
        entry: &SdEntry,
        endpoints: &[EndpointOption],
    ) {
        let sid = self.sid();
        let key = SubscriptionKey { subscriber: subscriber_of(endpoints), eventgroup_id: entry.eventgroup_id };
        if let Some(existing) = self.subscriptions.iter_mut().find(|s| s.key == key) {
            debug!("{} renewing subscription of eventgroup 0x{:04x} from {}", sid, key.eventgroup_id, from);
            existing.sd_address = from;
            existing.restart_ttl(ctx.now(), entry.ttl);
            let (ack, options) = builder.ack(entry.eventgroup_id, entry.ttl, entry.counter, None);
            ctx.send_entry(self.local, Destination::Unicast(from), ack, &options);
            return;
        }

        if let Some(reason) = self.rejection(instance, &key) {
            info!("{} rejecting subscription of eventgroup 0x{:04x} from {}: {}", sid, key.eventgroup_id, from, reason);
            let (nack, options) = builder.nack(entry.eventgroup_id, entry.counter);
            ctx.send_entry(self.local, Destination::Unicast(from), nack, &options);
            return;
        }

        instance.subscribe_eventgroup(key.eventgroup_id, &key.subscriber);
        let mut subscription = Subscription { key, sd_address: from, ttl_timer: Timer::new() };
        subscription.restart_ttl(ctx.now(), entry.ttl);
        self.subscriptions.push(subscription);
        info!("{} eventgroup 0x{:04x} subscribed by {}", sid, key.eventgroup_id, from);

        let multicast = self.event_multicast(key.eventgroup_id);
        let (ack, options) = builder.ack(entry.eventgroup_id, entry.ttl, entry.counter, multicast);
        ctx.send_entry(self.local, Destination::Unicast(from), ack, &options);
    }

    /// SubscribeEventgroup with ttl 0.
    pub fn on_stop_subscribe(&mut self, instance: &mut dyn ServerServiceInstance, entry: &SdEntry, endpoints: &[EndpointOption]) {
        let key = SubscriptionKey { subscriber: subscriber_of(endpoints), eventgroup_id: entry.eventgroup_id };
        match self.subscriptions.iter().position(|s| s.key == key) {
            Some(pos) => {
                let subscription = self.subscriptions.remove(pos);
                instance.unsubscribe_eventgroup(key.eventgroup_id, &subscription.key.subscriber);
                info!("{} eventgroup 0x{:04x} unsubscribed by {}", self.sid(), key.eventgroup_id, subscription.sd_address);
            }
            None => debug!("{} stop subscribe for unknown subscription of eventgroup 0x{:04x}", self.sid(), key.eventgroup_id),
        }
    }

    /// Drops every subscription whose TTL ran out at `now`.
    pub fn on_timeout(&mut self, now: Instant, instance: &mut dyn ServerServiceInstance) {
        let sid = self.sid();
        self.subscriptions.retain_mut(|s| {
            if s.ttl_timer.fire(now) {
                info!("{} subscription of eventgroup 0x{:04x} from {} expired", sid, s.key.eventgroup_id, s.sd_address);
                instance.unsubscribe_eventgroup(s.key.eventgroup_id, &s.key.subscriber);
                false
            } else {
                true
            }
        });
    }

    pub fn on_reboot_detected(&mut self, peer: IpAddr, instance: &mut dyn ServerServiceInstance) {
        let sid = self.sid();
        self.subscriptions.retain(|s| {
            if s.owned_by(peer) {
                debug!("{} dropping subscription of eventgroup 0x{:04x}, {} rebooted", sid, s.key.eventgroup_id, peer);
                instance.unsubscribe_eventgroup(s.key.eventgroup_id, &s.key.subscriber);
                false
            } else {
                true
            }
        });
    }

    pub fn unsubscribe_all(&mut self, instance: &mut dyn ServerServiceInstance) {
        for s in self.subscriptions.drain(..) {
            instance.unsubscribe_eventgroup(s.key.eventgroup_id, &s.key.subscriber);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest(self.subscriptions.iter().map(|s| s.ttl_timer.deadline()))
    }

    fn rejection(&self, instance: &dyn ServerServiceInstance, key: &SubscriptionKey) -> Option<&'static str> {
        if !self.eventgroups.contains(&key.eventgroup_id) {
            return Some("unknown eventgroup");
        }
        if self.mapping.tcp_port.is_some() {
            match key.subscriber.tcp {
                None => return Some("no TCP endpoint option"),
                Some(remote) if !instance.has_tcp_connection(remote) => return Some("no TCP connection"),
                Some(_) => {}
            }
        }
        if self.mapping.udp_port.is_some() && key.subscriber.udp.is_none() {
            return Some("no UDP endpoint option");
        }
        None
    }

    /// Multicast endpoint to announce in an Ack, once enough clients subscribed.
    /// A threshold of zero keeps the eventgroup on unicast.
    fn event_multicast(&self, eventgroup_id: u16) -> Option<EndpointOption> {
        let (address, port) = self.mapping.event_multicast()?;
        let threshold = self.sd.multicast_threshold(eventgroup_id);
        if threshold == 0 || self.subscriber_count(eventgroup_id) < threshold {
            return None;
        }
        Some(EndpointOption::multicast(address, port))
    }

    fn sid(&self) -> Sid {
        Sid(self.key.service_id, self.key.instance_id)
    }
}

fn subscriber_of(endpoints: &[EndpointOption]) -> EventgroupSubscriber {
    let find = |protocol| {
        endpoints
            .iter()
            .find(|ep| !ep.is_multicast && ep.protocol == protocol)
            .map(EndpointOption::socket_addr)
    };
    EventgroupSubscriber { tcp: find(TransportProtocol::Tcp), udp: find(TransportProtocol::Udp) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::ProvidedEventgroupSdConfig;
    use crate::sd::context::{EventgroupNotification, OutboundMessage};
    use crate::sd::entries::{EntryKind, EntryType};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    #[derive(Default)]
    struct Instance {
        subscribed: Vec<(u16, EventgroupSubscriber)>,
        tcp: HashSet<SocketAddr>,
    }

    impl ServerServiceInstance for Instance {
        fn start(&mut self) {}
        fn stop(&mut self) {}
        fn subscribe_eventgroup(&mut self, eventgroup_id: u16, subscriber: &EventgroupSubscriber) {
            self.subscribed.push((eventgroup_id, *subscriber));
        }
        fn unsubscribe_eventgroup(&mut self, eventgroup_id: u16, subscriber: &EventgroupSubscriber) {
            self.subscribed.retain(|s| *s != (eventgroup_id, *subscriber));
        }
        fn has_tcp_connection(&self, remote: SocketAddr) -> bool {
            self.tcp.contains(&remote)
        }
    }

    struct Fixture {
        manager: ServerEventManager,
        builder: ServerMessageBuilder,
        instance: Instance,
        rng: StdRng,
        outbox: Vec<OutboundMessage>,
        notes: Vec<EventgroupNotification>,
    }

    impl Fixture {
        fn new(tcp: bool, threshold: usize) -> Self {
            let key = ServiceInstanceKey::new(0x1234, 1, 1, 0);
            let mapping = PortMappingConfig {
                address: "192.168.0.10".parse().unwrap(),
                udp_port: Some(30501),
                tcp_port: tcp.then_some(30502),
                event_multicast_address: Some("239.0.0.1".parse().unwrap()),
                event_multicast_port: Some(30600),
            };
            let sd = ServerSdConfig {
                eventgroups: vec![ProvidedEventgroupSdConfig { id: 0x10, multicast_threshold: threshold }],
                ..ServerSdConfig::default()
            };
            Fixture {
                builder: ServerMessageBuilder::new(key, 3, &mapping),
                manager: ServerEventManager::new(key, mapping, sd, vec![0x10]),
                instance: Instance::default(),
                rng: StdRng::seed_from_u64(1),
                outbox: Vec::new(),
                notes: Vec::new(),
            }
        }

        fn subscribe(&mut self, now: Instant, from: SocketAddr, eventgroup_id: u16, ttl: u32, endpoints: &[EndpointOption]) {
            let entry = SdEntry::eventgroup(EntryType::SubscribeEventgroup, 0x1234, 1, 1, eventgroup_id, ttl);
            let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notes);
            self.manager.on_subscribe(&mut ctx, &mut self.instance, &self.builder, from, &entry, endpoints);
        }

        fn last_reply(&self) -> (EntryKind, usize) {
            let msg = self.outbox.last().unwrap();
            (msg.packet.entries[0].kind(), msg.packet.options.len())
        }
    }

    fn client() -> SocketAddr {
        "192.168.0.20:30490".parse().unwrap()
    }

    fn udp(port: u16) -> EndpointOption {
        EndpointOption::unicast("192.168.0.20".parse().unwrap(), port, TransportProtocol::Udp)
    }

    #[test]
    fn test_subscribe_ack_and_expiry() {
        let t0 = Instant::now();
        let mut f = Fixture::new(false, 0);
        f.subscribe(t0, client(), 0x10, 3, &[udp(40000)]);
        assert_eq!(f.last_reply(), (EntryKind::SubscribeEventgroupAck, 0));
        assert_eq!(f.instance.subscribed.len(), 1);
        assert_eq!(f.manager.next_deadline(), Some(t0 + Duration::from_secs(3)));

        // renewal pushes the expiry out
        f.subscribe(t0 + Duration::from_secs(2), client(), 0x10, 3, &[udp(40000)]);
        assert_eq!(f.manager.len(), 1);
        f.manager.on_timeout(t0 + Duration::from_secs(3), &mut f.instance);
        assert_eq!(f.manager.len(), 1);

        f.manager.on_timeout(t0 + Duration::from_secs(5), &mut f.instance);
        assert!(f.manager.is_empty());
        assert!(f.instance.subscribed.is_empty());
    }

    #[test]
    fn test_nack_cases() {
        let t0 = Instant::now();
        let mut f = Fixture::new(true, 0);
        let tcp = EndpointOption::unicast("192.168.0.20".parse().unwrap(), 41000, TransportProtocol::Tcp);

        // unknown eventgroup
        f.subscribe(t0, client(), 0x99, 3, &[udp(40000), tcp]);
        assert_eq!(f.last_reply(), (EntryKind::SubscribeEventgroupNack, 0));
        // TCP option but no connection
        f.subscribe(t0, client(), 0x10, 3, &[udp(40000), tcp]);
        assert_eq!(f.last_reply(), (EntryKind::SubscribeEventgroupNack, 0));

        f.instance.tcp.insert(tcp.socket_addr());
        // UDP option missing
        f.subscribe(t0, client(), 0x10, 3, &[tcp]);
        assert_eq!(f.last_reply(), (EntryKind::SubscribeEventgroupNack, 0));

        f.subscribe(t0, client(), 0x10, 3, &[udp(40000), tcp]);
        assert_eq!(f.last_reply(), (EntryKind::SubscribeEventgroupAck, 0));
        assert_eq!(f.manager.len(), 1);
    }

    #[test]
    fn test_multicast_option_after_threshold() {
        let t0 = Instant::now();
        let mut f = Fixture::new(false, 2);
        f.subscribe(t0, client(), 0x10, TTL_INFINITE, &[udp(40000)]);
        assert_eq!(f.last_reply(), (EntryKind::SubscribeEventgroupAck, 0));
        assert_eq!(f.manager.next_deadline(), None);

        f.subscribe(t0, client(), 0x10, TTL_INFINITE, &[udp(40001)]);
        assert_eq!(f.last_reply(), (EntryKind::SubscribeEventgroupAck, 1));
        assert_eq!(f.manager.subscriber_count(0x10), 2);
    }

    #[test]
    fn test_stop_subscribe_and_reboot() {
        let t0 = Instant::now();
        let mut f = Fixture::new(false, 0);
        let other: SocketAddr = "192.168.0.30:30490".parse().unwrap();
        let other_udp = EndpointOption::unicast("192.168.0.30".parse().unwrap(), 40000, TransportProtocol::Udp);
        f.subscribe(t0, client(), 0x10, 3, &[udp(40000)]);
        f.subscribe(t0, other, 0x10, 3, &[other_udp]);
        assert_eq!(f.manager.len(), 2);

        f.manager.on_reboot_detected(client().ip(), &mut f.instance);
        assert_eq!(f.manager.len(), 1);

        let stop = SdEntry::eventgroup(EntryType::SubscribeEventgroup, 0x1234, 1, 1, 0x10, 0);
        f.manager.on_stop_subscribe(&mut f.instance, &stop, &[other_udp]);
        assert!(f.manager.is_empty());
        assert!(f.instance.subscribed.is_empty());
    }
}
