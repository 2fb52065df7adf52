//! Find side of service discovery: one state machine per required service instance.

pub mod eventgroup;
pub mod find;
pub mod message_builder;
pub mod offer;

pub use eventgroup::{EventgroupManager, EventgroupPhase, SubscriptionState};
pub use find::FindPhase;
pub use message_builder::ClientMessageBuilder;
pub use offer::ClientOffer;

use crate::error::{Result, SdError};
use crate::logging::Sid;
use crate::runtime::config::{ClientSdConfig, RequiredInstanceConfig};
use crate::sd::context::{Destination, SdContext};
use crate::sd::entries::{ANY_MAJOR, EntryKind, SdEntry, TTL_INFINITE};
use crate::sd::instance::{ClientServiceInstance, ServiceInstanceKey};
use crate::sd::packet::SdPacket;
use crate::sd::timer::{MAX_DELAY, Timer, earliest};
use log::{debug, error, info};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

pub struct ClientStateMachine {
    key: ServiceInstanceKey,
    local: IpAddr,
    config: ClientSdConfig,
    phase: FindPhase,
    network_up: bool,
    requested: usize,
    available: bool,
    timer: Timer,
    offer_ttl_timer: Timer,
    repetition_counter: u32,
    repetition_delay: Duration,
    offer: Option<ClientOffer>,
    builder: ClientMessageBuilder,
    eventgroups: EventgroupManager,
    instance: Box<dyn ClientServiceInstance>,
}

impl ClientStateMachine {
    pub fn new(config: &RequiredInstanceConfig, eventgroups: &[u16], instance: Box<dyn ClientServiceInstance>) -> Self {
        let key = ServiceInstanceKey::new(
            config.service_id,
            config.instance_id,
            config.major_version,
            config.minor_version,
        );
        let sd = config.service_discovery.clone();
        let local = config.port_mapping.address;
        ClientStateMachine {
            key,
            local,
            phase: FindPhase::Down,
            network_up: false,
            requested: 0,
            available: false,
            timer: Timer::new(),
            offer_ttl_timer: Timer::new(),
            repetition_counter: 0,
            repetition_delay: sd.repetition_base_delay(),
            offer: None,
            builder: ClientMessageBuilder::new(key, sd.ttl, &config.port_mapping),
            eventgroups: EventgroupManager::new(key, local, &sd, eventgroups),
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

    pub fn phase(&self) -> FindPhase {
        self.phase
    }

    pub fn is_requested(&self) -> bool {
        self.requested > 0
    }

    pub fn is_service_available(&self) -> bool {
        self.available
    }

    pub fn active_offer(&self) -> Option<&ClientOffer> {
        self.offer.as_ref()
    }

    /// TTL of the active offer in seconds, 0 without one.
    pub fn offer_ttl(&self) -> u32 {
        self.offer.as_ref().map_or(0, |o| o.ttl)
    }

    pub fn eventgroups(&self) -> &EventgroupManager {
        &self.eventgroups
    }

    pub fn on_service_requested(&mut self, ctx: &mut SdContext<'_>) {
        self.requested += 1;
        if self.requested > 1 {
            return;
        }
        info!("{} requested", self.sid());
        if self.available {
            self.connect();
        }
        if self.phase == FindPhase::Down {
            if self.available {
                let _ = self.change_phase(ctx, FindPhase::Main);
            } else if self.network_up {
                let _ = self.change_phase(ctx, FindPhase::InitialWait);
            }
        }
    }

    pub fn on_service_released(&mut self, ctx: &mut SdContext<'_>) -> Result<()> {
        if self.requested == 0 {
            return Err(SdError::AlreadyReleased { service_id: self.key.service_id, instance_id: self.key.instance_id });
        }
        self.requested -= 1;
        if self.requested > 0 {
            return Ok(());
        }
        info!("{} released", self.sid());
        if self.available {
            self.instance.disconnect();
        }
        if self.phase != FindPhase::Down {
            let _ = self.change_phase(ctx, FindPhase::Down);
        }
        self.eventgroups.on_service_released(ctx, &self.builder, self.instance.as_mut());
        Ok(())
    }

    pub fn on_network_up(&mut self, ctx: &mut SdContext<'_>) {
        self.network_up = true;
        if self.phase == FindPhase::Down && self.requested > 0 {
            let _ = self.change_phase(ctx, FindPhase::InitialWait);
        }
    }

    pub fn on_network_down(&mut self, ctx: &mut SdContext<'_>) {
        self.network_up = false;
        self.invalidate_offer(ctx);
        if self.phase != FindPhase::Down {
            let _ = self.change_phase(ctx, FindPhase::Down);
        }
    }

    pub fn on_stop(&mut self, ctx: &mut SdContext<'_>) {
        while self.requested > 0 {
            let _ = self.on_service_released(ctx);
        }
        self.on_network_down(ctx);
    }

    pub fn on_subscribe(&mut self, ctx: &mut SdContext<'_>, eventgroup_id: u16) -> Result<()> {
        self.eventgroups.on_subscribe(ctx, &self.builder, eventgroup_id)
    }

    pub fn on_unsubscribe(&mut self, ctx: &mut SdContext<'_>, eventgroup_id: u16) -> Result<()> {
        self.eventgroups.on_unsubscribe(ctx, &self.builder, self.instance.as_mut(), eventgroup_id)
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
                EntryKind::OfferService | EntryKind::StopOfferService if self.matches_offer(entry) => {
                    let endpoints = packet.endpoints_of(entry);
                    if entry.ttl == 0 {
                        self.on_stop_offer(ctx, from);
                    } else if let Some(offer) = ClientOffer::from_entry(from, entry, &endpoints, is_multicast) {
                        self.on_offer(ctx, offer);
                    } else {
                        debug!("{} offer from {} without endpoint ignored", self.sid(), from);
                    }
                }
                EntryKind::SubscribeEventgroupAck if !is_multicast && self.matches_ack(entry) => {
                    let multicast = packet
                        .endpoints_of(entry)
                        .into_iter()
                        .find(|ep| ep.is_multicast)
                        .map(|ep| ep.socket_addr());
                    self.eventgroups
                        .on_subscribe_eventgroup_ack(ctx, self.instance.as_mut(), entry.eventgroup_id, multicast, entry.ttl);
                }
                EntryKind::SubscribeEventgroupNack if !is_multicast && self.matches_ack(entry) => {
                    self.eventgroups.on_subscribe_eventgroup_nack(ctx, self.instance.as_mut(), entry.eventgroup_id);
                }
                _ => {}
            }
        }
    }

    fn matches_offer(&self, entry: &SdEntry) -> bool {
        self.key
            .matches_offer(entry.service_id, entry.instance_id, entry.major_version, entry.minor_version)
    }

    fn matches_ack(&self, entry: &SdEntry) -> bool {
        self.key.service_id == entry.service_id
            && self.key.instance_id == entry.instance_id
            && (self.key.major_version == ANY_MAJOR || self.key.major_version == entry.major_version)
    }

    fn on_offer(&mut self, ctx: &mut SdContext<'_>, offer: ClientOffer) {
        let (from, major, is_multicast, ttl) = (offer.from, offer.major_version, offer.is_multicast, offer.ttl);
        if self.offer.as_ref().is_none_or(|o| o.from != from) {
            info!("{} offered by {}", self.sid(), from);
        }
        self.offer = Some(offer);

        if ttl == TTL_INFINITE {
            self.offer_ttl_timer.stop();
        } else {
            self.offer_ttl_timer.start(ctx.now(), Duration::from_secs(u64::from(ttl)), false);
        }
        self.set_service_available(true);
        if self.phase.is_searching() {
            let _ = self.change_phase(ctx, FindPhase::Main);
        }
        self.eventgroups.on_offer_service(ctx, &self.builder, from, major, is_multicast);
    }

    fn on_stop_offer(&mut self, ctx: &mut SdContext<'_>, from: SocketAddr) {
        if self.offer.as_ref().is_some_and(|o| o.from == from) {
            info!("{} offer withdrawn by {}", self.sid(), from);
            self.invalidate_offer(ctx);
        }
    }

    /// A peer restarted. An offer it made no longer holds.
    pub fn on_reboot_detected(&mut self, ctx: &mut SdContext<'_>, from: SocketAddr) {
        if self.offer.as_ref().is_some_and(|o| o.from == from) {
            info!("{} server {} rebooted", self.sid(), from);
            self.invalidate_offer(ctx);
        }
    }

    fn invalidate_offer(&mut self, ctx: &mut SdContext<'_>) {
        self.offer_ttl_timer.stop();
        self.set_service_available(false);
        if self.offer.take().is_some() {
            self.eventgroups.on_stop_offer_service(ctx, self.instance.as_mut());
        }
    }

    fn set_service_available(&mut self, available: bool) {
        if self.available == available {
            return;
        }
        self.available = available;
        if self.requested == 0 {
            return;
        }
        if available {
            self.connect();
        } else {
            self.instance.disconnect();
        }
    }

    fn connect(&mut self) {
        if let Some(offer) = &self.offer {
            self.instance.connect(offer.tcp, offer.udp);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([self.timer.deadline(), self.offer_ttl_timer.deadline(), self.eventgroups.next_deadline()])
    }

    pub fn on_timeout(&mut self, ctx: &mut SdContext<'_>) {
        let now = ctx.now();
        if self.offer_ttl_timer.fire(now) {
            info!("{} offer expired", self.sid());
            self.invalidate_offer(ctx);
        }
        self.eventgroups.on_timeout(ctx, &self.builder, self.instance.as_mut());
        if self.timer.fire(now) {
            self.on_phase_timeout(ctx);
        }
    }

    fn on_phase_timeout(&mut self, ctx: &mut SdContext<'_>) {
        match self.phase {
            FindPhase::InitialWait => self.finish_initial_wait(ctx),
            FindPhase::Repetition => {
                self.send_find(ctx);
                self.repetition_counter += 1;
                if self.repetition_counter < self.config.repetition_max {
                    self.repetition_delay = self.repetition_delay.saturating_mul(2).min(MAX_DELAY);
                    self.timer.start(ctx.now(), self.repetition_delay, false);
                } else {
                    let _ = self.change_phase(ctx, FindPhase::Main);
                }
            }
            FindPhase::Down | FindPhase::Main => {}
        }
    }

    fn finish_initial_wait(&mut self, ctx: &mut SdContext<'_>) {
        self.send_find(ctx);
        let next = if self.config.repetition_max > 0 { FindPhase::Repetition } else { FindPhase::Main };
        let _ = self.change_phase(ctx, next);
    }

    pub fn change_phase(&mut self, ctx: &mut SdContext<'_>, to: FindPhase) -> Result<()> {
        let from = self.phase;
        if !from.is_valid_change(to) {
            error!("{} illegal transition {} -> {}", self.sid(), from.as_str(), to.as_str());
            return Err(SdError::IllegalTransition { from: from.as_str(), to: to.as_str() });
        }
        debug!("{} {} -> {}", self.sid(), from.as_str(), to.as_str());
        self.timer.stop();
        self.phase = to;

        match to {
            FindPhase::Down => {
                if !self.network_up {
                    self.set_service_available(false);
                }
            }
            FindPhase::InitialWait => {
                let (min, max) = self.config.initial_delay();
                let delay = ctx.random_delay(min, max);
                if delay.is_zero() {
                    self.finish_initial_wait(ctx);
                } else {
                    self.timer.start(ctx.now(), delay, false);
                }
            }
            FindPhase::Repetition => {
                self.repetition_counter = 0;
                self.repetition_delay = self.config.repetition_base_delay();
                self.timer.start(ctx.now(), self.repetition_delay, false);
            }
            FindPhase::Main => {}
        }
        Ok(())
    }

    fn send_find(&mut self, ctx: &mut SdContext<'_>) {
        ctx.send_entry(self.local, Destination::Multicast, self.builder.find(), &[]);
    }

    fn sid(&self) -> Sid {
        Sid(self.key.service_id, self.key.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::PortMappingConfig;
    use crate::sd::context::{EventgroupNotification, OutboundMessage};
    use crate::sd::entries::{ANY_MINOR, EntryType};
    use crate::sd::options::{EndpointOption, TransportProtocol};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Connections(Arc<Mutex<Vec<String>>>);

    impl ClientServiceInstance for Connections {
        fn connect(&mut self, _: Option<SocketAddr>, udp: Option<SocketAddr>) {
            self.0.lock().unwrap().push(format!("connect {}", udp.unwrap()));
        }
        fn disconnect(&mut self) {
            self.0.lock().unwrap().push("disconnect".into());
        }
        fn start_listen_multicast(&mut self, _: SocketAddr) {}
        fn stop_listen_multicast(&mut self, _: SocketAddr) {}
    }

    struct Harness {
        sm: ClientStateMachine,
        log: Connections,
        t0: Instant,
        rng: StdRng,
        outbox: Vec<OutboundMessage>,
        notes: Vec<EventgroupNotification>,
    }

    impl Harness {
        fn new(sd: ClientSdConfig) -> Self {
            let config = RequiredInstanceConfig {
                service_id: 0x1234,
                instance_id: 1,
                major_version: ANY_MAJOR,
                minor_version: ANY_MINOR,
                port_mapping: PortMappingConfig {
                    address: "192.168.0.20".parse().unwrap(),
                    udp_port: Some(40000),
                    tcp_port: None,
                    event_multicast_address: None,
                    event_multicast_port: None,
                },
                service_discovery: sd,
            };
            let log = Connections::default();
            Harness {
                sm: ClientStateMachine::new(&config, &[0x10], Box::new(log.clone())),
                log,
                t0: Instant::now(),
                rng: StdRng::seed_from_u64(9),
                outbox: Vec::new(),
                notes: Vec::new(),
            }
        }

        fn at<R, F: FnOnce(&mut ClientStateMachine, &mut SdContext<'_>) -> R>(&mut self, ms: u64, f: F) -> R {
            let mut ctx = SdContext::new(self.t0 + Duration::from_millis(ms), &mut self.rng, &mut self.outbox, &mut self.notes);
            f(&mut self.sm, &mut ctx)
        }

        fn run_until(&mut self, ms: u64) {
            let end = self.t0 + Duration::from_millis(ms);
            while let Some(deadline) = self.sm.next_deadline().filter(|d| *d <= end) {
                let mut ctx = SdContext::new(deadline, &mut self.rng, &mut self.outbox, &mut self.notes);
                self.sm.on_timeout(&mut ctx);
            }
        }

        fn finds(&mut self) -> usize {
            self.outbox
                .drain(..)
                .filter(|m| m.packet.entries[0].kind() == EntryKind::FindService)
                .count()
        }

        fn log(&self) -> Vec<String> {
            self.log.0.lock().unwrap().clone()
        }
    }

    fn fast_config() -> ClientSdConfig {
        ClientSdConfig {
            initial_delay_min_ms: 0,
            initial_delay_max_ms: 0,
            repetition_base_delay_ms: 50,
            repetition_max: 2,
            ..ClientSdConfig::default()
        }
    }

    fn server() -> SocketAddr {
        "192.168.0.10:30490".parse().unwrap()
    }

    fn offer(ttl: u32) -> SdPacket {
        let mut packet = SdPacket::new();
        let udp = EndpointOption::unicast(server().ip(), 30501, TransportProtocol::Udp);
        packet.push(SdEntry::service(EntryType::OfferService, 0x1234, 1, 1, 7, ttl), &[udp.into()]);
        packet
    }

    #[test]
    fn test_search_until_main() {
        let mut h = Harness::new(fast_config());
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_requested(ctx);
        });
        // zero initial delay sends the first find right away
        assert_eq!(h.sm.phase(), FindPhase::Repetition);
        assert_eq!(h.finds(), 1);

        h.run_until(1000);
        assert_eq!(h.sm.phase(), FindPhase::Main);
        assert_eq!(h.finds(), 2);
    }

    #[test]
    fn test_offer_ends_search_and_connects() {
        let mut h = Harness::new(fast_config());
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_requested(ctx);
        });
        let packet = offer(3);
        h.at(10, |sm, ctx| sm.on_multicast_message(ctx, server(), &packet));
        assert_eq!(h.sm.phase(), FindPhase::Main);
        assert!(h.sm.is_service_available());
        assert_eq!(h.sm.offer_ttl(), 3);
        assert_eq!(h.log(), vec!["connect 192.168.0.10:30501"]);

        // offer TTL runs out
        h.run_until(3010);
        assert!(!h.sm.is_service_available());
        assert_eq!(h.sm.offer_ttl(), 0);
        assert_eq!(h.log().last().map(String::as_str), Some("disconnect"));
    }

    #[test]
    fn test_offer_seen_before_request() {
        let mut h = Harness::new(fast_config());
        h.at(0, |sm, ctx| sm.on_network_up(ctx));
        let packet = offer(TTL_INFINITE);
        h.at(10, |sm, ctx| sm.on_multicast_message(ctx, server(), &packet));
        assert_eq!(h.sm.phase(), FindPhase::Down);
        assert!(h.sm.is_service_available());
        assert!(h.log().is_empty());
        assert_eq!(h.sm.next_deadline(), None);

        h.at(20, |sm, ctx| sm.on_service_requested(ctx));
        assert_eq!(h.sm.phase(), FindPhase::Main);
        assert_eq!(h.finds(), 0);
        assert_eq!(h.log(), vec!["connect 192.168.0.10:30501"]);
    }

    #[test]
    fn test_reference_counted_requests() {
        let mut h = Harness::new(fast_config());
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_requested(ctx);
            sm.on_service_requested(ctx);
        });
        assert!(h.at(1, |sm, ctx| sm.on_service_released(ctx)).is_ok());
        assert_ne!(h.sm.phase(), FindPhase::Down);
        assert!(h.at(2, |sm, ctx| sm.on_service_released(ctx)).is_ok());
        assert_eq!(h.sm.phase(), FindPhase::Down);
        let err = h.at(3, |sm, ctx| sm.on_service_released(ctx));
        assert!(matches!(err, Err(SdError::AlreadyReleased { service_id: 0x1234, instance_id: 1 })));
    }

    #[test]
    fn test_stop_offer_and_reboot_invalidate() {
        let mut h = Harness::new(fast_config());
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_requested(ctx);
        });
        let packet = offer(TTL_INFINITE);
        h.at(10, |sm, ctx| sm.on_multicast_message(ctx, server(), &packet));
        assert!(h.sm.is_service_available());

        // a stop offer from somebody else does not count
        let stop = offer(0);
        let stranger: SocketAddr = "192.168.0.99:30490".parse().unwrap();
        h.at(20, |sm, ctx| sm.on_multicast_message(ctx, stranger, &stop));
        assert!(h.sm.is_service_available());

        h.at(30, |sm, ctx| sm.on_multicast_message(ctx, server(), &stop));
        assert!(!h.sm.is_service_available());
        assert_eq!(h.sm.phase(), FindPhase::Main);

        h.at(40, |sm, ctx| sm.on_multicast_message(ctx, server(), &packet));
        assert!(h.sm.is_service_available());
        h.at(50, |sm, ctx| sm.on_reboot_detected(ctx, server()));
        assert!(!h.sm.is_service_available());
        assert!(h.sm.active_offer().is_none());
        assert_eq!(
            h.log(),
            vec!["connect 192.168.0.10:30501", "disconnect", "connect 192.168.0.10:30501", "disconnect"]
        );
    }

    #[test]
    fn test_network_down_goes_down() {
        let mut h = Harness::new(fast_config());
        h.at(0, |sm, ctx| {
            sm.on_network_up(ctx);
            sm.on_service_requested(ctx);
        });
        let packet = offer(TTL_INFINITE);
        h.at(10, |sm, ctx| sm.on_multicast_message(ctx, server(), &packet));
        h.at(20, |sm, ctx| sm.on_network_down(ctx));
        assert_eq!(h.sm.phase(), FindPhase::Down);
        assert!(!h.sm.is_service_available());

        h.outbox.clear();
        h.at(30, |sm, ctx| sm.on_network_up(ctx));
        assert_eq!(h.sm.phase(), FindPhase::Repetition);
        assert_eq!(h.finds(), 1);
    }
}
