//! Offer side of service discovery: one state machine per provided service
//! instance and port mapping.

pub mod event_manager;
pub mod message_builder;
pub mod send_queue;
pub mod state;

pub use event_manager::ServerEventManager;
pub use message_builder::{ServerMessageBuilder, nack_entry};
pub use send_queue::{DueOffer, OfferSendQueue};
pub use state::ServerPhase;

use crate::error::{Result, SdError};
use crate::logging::Sid;
use crate::runtime::config::{PortMappingConfig, ProvidedInstanceConfig, ServerSdConfig};
use crate::sd::context::{Destination, SdContext};
use crate::sd::entries::{EntryKind, SdEntry};
use crate::sd::instance::{ServerServiceInstance, ServiceInstanceKey};
use crate::sd::packet::SdPacket;
use crate::sd::timer::{MAX_DELAY, Timer, earliest};
use log::{debug, error, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

pub struct ServerStateMachine {
    key: ServiceInstanceKey,
    local: IpAddr,
    config: ServerSdConfig,
    phase: ServerPhase,
    network_up: bool,
    service_up: bool,
    timer: Timer,
    repetition_counter: u32,
    repetition_delay: Duration,
    // only maintained with message optimization
    last_offer: Option<Instant>,
    builder: ServerMessageBuilder,
    send_queue: OfferSendQueue,
    events: ServerEventManager,
    instance: Box<dyn ServerServiceInstance>,
}

impl ServerStateMachine {
    pub fn new(
        config: &ProvidedInstanceConfig,
        mapping: &PortMappingConfig,
        eventgroups: Vec<u16>,
        instance: Box<dyn ServerServiceInstance>,
    ) -> Self {
        let key = ServiceInstanceKey::new(
            config.service_id,
            config.instance_id,
            config.major_version,
            config.minor_version,
        );
        let sd = config.service_discovery.clone();
        ServerStateMachine {
            key,
            local: mapping.address,
            phase: ServerPhase::Down,
            network_up: false,
            service_up: false,
            timer: Timer::new(),
            repetition_counter: 0,
            repetition_delay: sd.repetition_base_delay(),
            last_offer: None,
            builder: ServerMessageBuilder::new(key, sd.ttl, mapping),
            send_queue: OfferSendQueue::new(),
            events: ServerEventManager::new(key, mapping.clone(), sd.clone(), eventgroups),
            config: sd,
            instance,
        }
    }

    pub fn key(&self) -> ServiceInstanceKey {
        self.key
    }

    pub fn local_address(&self) -> IpAddr {
        self.local
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    pub fn subscription_count(&self) -> usize {
        self.events.len()
    }

    /// Whether a SubscribeEventgroup entry addresses this instance.
    pub fn accepts_subscription(&self, entry: &SdEntry) -> bool {
        self.key.service_id == entry.service_id
            && self.key.instance_id == entry.instance_id
            && self.key.major_version == entry.major_version
    }

    pub fn on_network_up(&mut self, ctx: &mut SdContext<'_>) {
        self.network_up = true;
        self.update(ctx);
    }

    pub fn on_network_down(&mut self, ctx: &mut SdContext<'_>) {
        self.network_up = false;
        self.update(ctx);
    }

    pub fn on_service_up(&mut self, ctx: &mut SdContext<'_>) {
        self.service_up = true;
        self.update(ctx);
    }

    pub fn on_service_down(&mut self, ctx: &mut SdContext<'_>) {
        self.service_up = false;
        self.update(ctx);
    }

    pub fn on_stop(&mut self, ctx: &mut SdContext<'_>) {
        self.on_service_down(ctx);
        self.on_network_down(ctx);
    }

    /// Brings the phase in line with the requested network and service state.
    fn update(&mut self, ctx: &mut SdContext<'_>) {
        let wanted = self.network_up && self.service_up;
        if wanted && self.phase == ServerPhase::Down {
            let _ = self.change_phase(ctx, ServerPhase::InitialWait);
        } else if !wanted && self.phase != ServerPhase::Down {
            // StopOffer only announces a service going away, not a lost network
            if !self.service_up && self.network_up && self.phase.is_offering() {
                self.send_stop_offer(ctx);
            }
            let _ = self.change_phase(ctx, ServerPhase::Down);
        }
    }

    pub fn on_unicast_message(&mut self, ctx: &mut SdContext<'_>, from: SocketAddr, packet: &SdPacket) {
        self.on_message(ctx, from, packet, false);
    }

    pub fn on_multicast_message(&mut self, ctx: &mut SdContext<'_>, from: SocketAddr, packet: &SdPacket) {
        self.on_message(ctx, from, packet, true);
    }

    fn on_message(&mut self, ctx: &mut SdContext<'_>, from: SocketAddr, packet: &SdPacket, is_multicast: bool) {
        for entry in &packet.entries {
            match entry.kind() {
                EntryKind::FindService
                    if self.key.matches_request(entry.service_id, entry.instance_id, entry.major_version) =>
                {
                    self.on_find_service(ctx, from, is_multicast);
                }
                EntryKind::SubscribeEventgroup if self.accepts_subscription(entry) => {
                    if self.phase.is_offering() {
                        let endpoints = packet.endpoints_of(entry);
                        self.events.on_subscribe(ctx, self.instance.as_mut(), &self.builder, from, entry, &endpoints);
                    } else {
                        debug!("{} ignoring subscribe from {} in {}", self.sid(), from, self.phase.as_str());
                    }
                }
                EntryKind::StopSubscribeEventgroup if self.accepts_subscription(entry) => {
                    if self.phase.is_offering() {
                        let endpoints = packet.endpoints_of(entry);
                        self.events.on_stop_subscribe(self.instance.as_mut(), entry, &endpoints);
                    }
                }
                _ => {}
            }
        }
    }

    fn on_find_service(&mut self, ctx: &mut SdContext<'_>, from: SocketAddr, is_multicast: bool) {
        let optimize = self.config.message_optimization;
        let (_, rr_max) = self.config.request_response_delay();
        match (self.phase, is_multicast) {
            (ServerPhase::Repetition, false) => self.schedule_offer(ctx, Destination::Unicast(from), Duration::ZERO),
            (ServerPhase::Repetition, true) => {
                let delay = self.request_response_delay(ctx);
                self.schedule_offer(ctx, Destination::Unicast(from), delay);
            }
            (ServerPhase::Main, false) if !optimize => {
                self.schedule_offer(ctx, Destination::Unicast(from), Duration::ZERO)
            }
            (ServerPhase::Main, false) => {
                let half_cycle = self.config.cyclic_offer_delay() / 2;
                let stale = self.last_offer.is_none_or(|t| ctx.now().saturating_duration_since(t) > half_cycle);
                if stale {
                    self.schedule_offer(ctx, Destination::Unicast(from), Duration::ZERO);
                } else {
                    self.schedule_offer(ctx, Destination::Multicast, Duration::ZERO);
                }
                self.last_offer = Some(ctx.now());
            }
            (ServerPhase::Main, true) if rr_max.is_zero() => {
                self.schedule_offer(ctx, Destination::Unicast(from), Duration::ZERO)
            }
            (ServerPhase::Main, true) if !optimize => {
                let delay = self.request_response_delay(ctx);
                self.schedule_offer(ctx, Destination::Unicast(from), delay);
            }
            (ServerPhase::Main, true) => {
                let delay = self.request_response_delay(ctx);
                self.schedule_offer(ctx, Destination::Multicast, delay);
                self.last_offer = Some(ctx.now());
            }
            (phase, _) => debug!("{} ignoring find from {} in {}", self.sid(), from, phase.as_str()),
        }
    }

    fn request_response_delay(&self, ctx: &mut SdContext<'_>) -> Duration {
        let (min, max) = self.config.request_response_delay();
        if max.is_zero() { Duration::ZERO } else { ctx.random_delay(min, max) }
    }

    /// Drops the subscriptions of a peer that restarted.
    pub fn on_reboot_detected(&mut self, from: SocketAddr) {
        self.events.on_reboot_detected(from.ip(), self.instance.as_mut());
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([self.timer.deadline(), self.send_queue.next_deadline(), self.events.next_deadline()])
    }

    /// Runs every timer due at `ctx.now()`.
    pub fn on_timeout(&mut self, ctx: &mut SdContext<'_>) {
        let now = ctx.now();
        for due in self.send_queue.take_due(now) {
            match due {
                DueOffer::Multicast => self.send_offer(ctx, Destination::Multicast),
                DueOffer::Unicast(to) => self.send_offer(ctx, Destination::Unicast(to)),
            }
        }
        self.events.on_timeout(now, self.instance.as_mut());
        if self.timer.fire(now) {
            self.on_phase_timeout(ctx);
        }
    }

    fn on_phase_timeout(&mut self, ctx: &mut SdContext<'_>) {
        match self.phase {
            ServerPhase::InitialWait => {
                self.send_offer(ctx, Destination::Multicast);
                let next = if self.config.repetition_max > 0 { ServerPhase::Repetition } else { ServerPhase::Main };
                let _ = self.change_phase(ctx, next);
            }
            ServerPhase::Repetition => {
                self.repetition_counter += 1;
                self.send_offer(ctx, Destination::Multicast);
                if self.repetition_counter >= self.config.repetition_max {
                    let _ = self.change_phase(ctx, ServerPhase::Main);
                } else {
                    self.repetition_delay = self.repetition_delay.saturating_mul(2).min(MAX_DELAY);
                    self.timer.start(ctx.now(), self.repetition_delay, false);
                }
            }
            ServerPhase::Main => {
                self.send_offer(ctx, Destination::Multicast);
                if self.config.message_optimization {
                    self.last_offer = Some(ctx.now());
                }
            }
            ServerPhase::Down => warn!("{} timer fired while down", self.sid()),
        }
    }

    pub fn change_phase(&mut self, ctx: &mut SdContext<'_>, to: ServerPhase) -> Result<()> {
        let from = self.phase;
        if !from.is_valid_change(to) {
            error!("{} illegal transition {} -> {}", self.sid(), from.as_str(), to.as_str());
            return Err(SdError::IllegalTransition { from: from.as_str(), to: to.as_str() });
        }
        debug!("{} {} -> {}", self.sid(), from.as_str(), to.as_str());

        // leave
        self.timer.stop();
        if to == ServerPhase::Down {
            self.send_queue.clear();
            self.events.unsubscribe_all(self.instance.as_mut());
            self.instance.stop();
            self.last_offer = None;
        }

        self.phase = to;

        // enter
        match to {
            ServerPhase::Down => info!("{} offer stopped", self.sid()),
            ServerPhase::InitialWait => {
                self.instance.start();
                let (min, max) = self.config.initial_delay();
                let delay = ctx.random_delay(min, max);
                self.timer.start(ctx.now(), delay, false);
            }
            ServerPhase::Repetition => {
                self.repetition_counter = 0;
                self.repetition_delay = self.config.repetition_base_delay();
                self.timer.start(ctx.now(), self.repetition_delay, false);
            }
            ServerPhase::Main => {
                let cyclic = self.config.cyclic_offer_delay();
                if !cyclic.is_zero() {
                    self.timer.start(ctx.now(), cyclic, true);
                }
            }
        }
        Ok(())
    }

    fn schedule_offer(&mut self, ctx: &mut SdContext<'_>, destination: Destination, delay: Duration) {
        if delay.is_zero() {
            self.send_offer(ctx, destination);
            return;
        }
        let deadline = ctx.now() + delay;
        match destination {
            Destination::Multicast => self.send_queue.push_multicast(deadline),
            Destination::Unicast(to) => {
                if let Some(evicted) = self.send_queue.push_unicast(to, deadline) {
                    warn!("{} offer queue full, sending to {} early", self.sid(), evicted);
                    self.send_offer(ctx, Destination::Unicast(evicted));
                }
            }
        }
    }

    fn send_offer(&mut self, ctx: &mut SdContext<'_>, destination: Destination) {
        let (entry, options) = self.builder.offer();
        ctx.send_entry(self.local, destination, entry, options);
    }

    fn send_stop_offer(&mut self, ctx: &mut SdContext<'_>) {
        let (entry, options) = self.builder.stop_offer();
        ctx.send_entry(self.local, Destination::Multicast, entry, options);
    }

    fn sid(&self) -> Sid {
        Sid(self.key.service_id, self.key.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd::context::{EventgroupNotification, OutboundMessage};
    use crate::sd::entries::{ANY_INSTANCE, ANY_MAJOR, EntryType};
    use crate::sd::instance::EventgroupSubscriber;
    use crate::sd::options::{EndpointOption, TransportProtocol};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Calls(Arc<Mutex<Vec<&'static str>>>);

    impl ServerServiceInstance for Calls {
        fn start(&mut self) {
            self.0.lock().unwrap().push("start");
        }
        fn stop(&mut self) {
            self.0.lock().unwrap().push("stop");
        }
        fn subscribe_eventgroup(&mut self, _: u16, _: &EventgroupSubscriber) {
            self.0.lock().unwrap().push("subscribe");
        }
        fn unsubscribe_eventgroup(&mut self, _: u16, _: &EventgroupSubscriber) {
            self.0.lock().unwrap().push("unsubscribe");
        }
        fn has_tcp_connection(&self, _: SocketAddr) -> bool {
            true
        }
    }

    struct Harness {
        sm: ServerStateMachine,
        calls: Calls,
        t0: Instant,
        rng: StdRng,
        outbox: Vec<OutboundMessage>,
        notes: Vec<EventgroupNotification>,
    }

    impl Harness {
        fn new(sd: ServerSdConfig) -> Self {
            let mapping = PortMappingConfig {
                address: "192.168.0.10".parse().unwrap(),
                udp_port: Some(30501),
                tcp_port: None,
                event_multicast_address: None,
                event_multicast_port: None,
            };
            let config = ProvidedInstanceConfig {
                service_id: 0x1234,
                instance_id: 1,
                major_version: 1,
                minor_version: 0,
                port_mappings: vec![mapping.clone()],
                service_discovery: sd,
            };
            let calls = Calls::default();
            Harness {
                sm: ServerStateMachine::new(&config, &mapping, vec![0x10], Box::new(calls.clone())),
                calls,
                t0: Instant::now(),
                rng: StdRng::seed_from_u64(3),
                outbox: Vec::new(),
                notes: Vec::new(),
            }
        }

        fn at<F: FnOnce(&mut ServerStateMachine, &mut SdContext<'_>)>(&mut self, ms: u64, f: F) {
            let mut ctx = SdContext::new(self.t0 + Duration::from_millis(ms), &mut self.rng, &mut self.outbox, &mut self.notes);
            f(&mut self.sm, &mut ctx);
        }

        /// Fires every deadline up to `ms`, each at its own instant.
        fn run_until(&mut self, ms: u64) {
            let end = self.t0 + Duration::from_millis(ms);
            while let Some(deadline) = self.sm.next_deadline().filter(|d| *d <= end) {
                let mut ctx = SdContext::new(deadline, &mut self.rng, &mut self.outbox, &mut self.notes);
                self.sm.on_timeout(&mut ctx);
            }
        }

        fn drain(&mut self) -> Vec<(Destination, EntryKind)> {
            self.outbox.drain(..).map(|m| (m.destination, m.packet.entries[0].kind())).collect()
        }
    }

    fn fast_config() -> ServerSdConfig {
        ServerSdConfig {
            initial_delay_min_ms: 0,
            initial_delay_max_ms: 0,
            repetition_base_delay_ms: 50,
            repetition_max: 2,
            cyclic_offer_delay_ms: 1000,
            ..ServerSdConfig::default()
        }
    }

    fn peer() -> SocketAddr {
        "192.168.0.20:30490".parse().unwrap()
    }

    fn find(instance_id: u16, major: u8) -> SdPacket {
        let mut packet = SdPacket::new();
        packet.push(SdEntry::service(EntryType::FindService, 0x1234, instance_id, major, 0, 3), &[]);
        packet
    }

    #[test]
    fn test_phases_follow_repetition_schedule() {
        let mut h = Harness::new(fast_config());
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_up(ctx);
        });
        assert_eq!(h.sm.phase(), ServerPhase::InitialWait);
        assert_eq!(*h.calls.0.lock().unwrap(), vec!["start"]);

        h.run_until(0);
        assert_eq!(h.sm.phase(), ServerPhase::Repetition);
        h.run_until(149);
        assert_eq!(h.drain().len(), 2);
        h.run_until(150);
        assert_eq!(h.sm.phase(), ServerPhase::Main);
        assert_eq!(h.drain(), vec![(Destination::Multicast, EntryKind::OfferService)]);

        h.run_until(3150);
        assert_eq!(h.drain().len(), 3);
    }

    #[test]
    fn test_long_repetition_phase_saturates() {
        let mut h = Harness::new(ServerSdConfig { repetition_max: 100, repetition_base_delay_ms: 30, ..fast_config() });
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_up(ctx);
        });
        for _ in 0..=100 {
            let deadline = h.sm.next_deadline().unwrap();
            let mut ctx = SdContext::new(deadline, &mut h.rng, &mut h.outbox, &mut h.notes);
            h.sm.on_timeout(&mut ctx);
        }
        assert_eq!(h.sm.phase(), ServerPhase::Main);
        assert_eq!(h.drain().len(), 101);
    }

    #[test]
    fn test_no_repetitions_goes_straight_to_main() {
        let mut h = Harness::new(ServerSdConfig { repetition_max: 0, ..fast_config() });
        h.at(0, |sm, ctx| {
            sm.on_service_up(ctx);
            sm.on_network_up(ctx);
        });
        h.run_until(0);
        assert_eq!(h.sm.phase(), ServerPhase::Main);
    }

    #[test]
    fn test_find_handling() {
        let mut h = Harness::new(ServerSdConfig {
            request_response_delay_min_ms: 20,
            request_response_delay_max_ms: 20,
            ..fast_config()
        });
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_up(ctx);
        });
        h.run_until(0);
        h.drain();

        // wildcard unicast find is answered right away
        let packet = find(ANY_INSTANCE, ANY_MAJOR);
        h.at(10, |sm, ctx| sm.on_unicast_message(ctx, peer(), &packet));
        assert_eq!(h.drain(), vec![(Destination::Unicast(peer()), EntryKind::OfferService)]);

        // multicast find is answered after the request-response delay
        let packet = find(1, 1);
        h.at(20, |sm, ctx| sm.on_multicast_message(ctx, peer(), &packet));
        assert!(h.drain().is_empty());
        assert_eq!(h.sm.next_deadline(), Some(h.t0 + Duration::from_millis(40)));
        h.run_until(45);
        assert_eq!(h.drain(), vec![(Destination::Unicast(peer()), EntryKind::OfferService)]);

        // other instances and majors are ignored
        let packet = find(2, 1);
        h.at(46, |sm, ctx| sm.on_unicast_message(ctx, peer(), &packet));
        let packet = find(1, 2);
        h.at(46, |sm, ctx| sm.on_unicast_message(ctx, peer(), &packet));
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_find_ignored_during_initial_wait() {
        let mut h = Harness::new(ServerSdConfig { initial_delay_min_ms: 50, initial_delay_max_ms: 50, ..fast_config() });
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_up(ctx);
        });
        let packet = find(1, 1);
        h.at(10, |sm, ctx| sm.on_unicast_message(ctx, peer(), &packet));
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_service_down_sends_stop_offer() {
        let mut h = Harness::new(fast_config());
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_up(ctx);
        });
        h.run_until(200);
        h.drain();

        h.at(300, |sm, ctx| sm.on_service_down(ctx));
        assert_eq!(h.sm.phase(), ServerPhase::Down);
        assert_eq!(h.drain(), vec![(Destination::Multicast, EntryKind::StopOfferService)]);
        assert_eq!(h.sm.next_deadline(), None);
        assert_eq!(h.calls.0.lock().unwrap().last(), Some(&"stop"));
    }

    #[test]
    fn test_network_down_is_silent() {
        let mut h = Harness::new(fast_config());
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_up(ctx);
        });
        h.run_until(200);
        h.drain();

        h.at(300, |sm, ctx| sm.on_network_down(ctx));
        assert_eq!(h.sm.phase(), ServerPhase::Down);
        assert!(h.drain().is_empty());

        // coming back restarts the whole announcement
        h.at(400, |sm, ctx| sm.on_network_up(ctx));
        assert_eq!(h.sm.phase(), ServerPhase::InitialWait);
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let mut h = Harness::new(fast_config());
        let mut result = Ok(());
        h.at(0, |sm, ctx| result = sm.change_phase(ctx, ServerPhase::Main));
        assert!(matches!(result, Err(SdError::IllegalTransition { from: "Down", to: "Main" })));
        assert_eq!(h.sm.phase(), ServerPhase::Down);
    }

    #[test]
    fn test_subscriptions_dropped_when_leaving_main() {
        let mut h = Harness::new(fast_config());
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_up(ctx);
        });
        h.run_until(200);
        h.drain();

        let mut packet = SdPacket::new();
        let udp = EndpointOption::unicast(peer().ip(), 40000, TransportProtocol::Udp);
        packet.push(SdEntry::eventgroup(EntryType::SubscribeEventgroup, 0x1234, 1, 1, 0x10, 3), &[udp.into()]);
        h.at(210, |sm, ctx| sm.on_unicast_message(ctx, peer(), &packet));
        assert_eq!(h.drain(), vec![(Destination::Unicast(peer()), EntryKind::SubscribeEventgroupAck)]);
        assert_eq!(h.sm.subscription_count(), 1);

        h.at(300, |sm, ctx| sm.on_stop(ctx));
        assert_eq!(h.sm.subscription_count(), 0);
        let calls = h.calls.0.lock().unwrap().clone();
        assert_eq!(calls, vec!["start", "subscribe", "unsubscribe", "stop"]);
    }
}
