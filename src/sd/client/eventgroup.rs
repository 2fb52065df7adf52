use crate::error::{Result, SdError};
use crate::logging::Sid;
use crate::runtime::config::ClientSdConfig;
use crate::sd::client::message_builder::ClientMessageBuilder;
use crate::sd::context::{Destination, EventgroupChange, EventgroupNotification, SdContext};
use crate::sd::entries::TTL_INFINITE;
use crate::sd::instance::{ClientServiceInstance, ServiceInstanceKey};
use crate::sd::timer::{Timer, earliest};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Subscription state reported to event observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    NotSubscribed,
    SubscriptionPending,
    Subscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventgroupPhase {
    NotSubscribed,
    Pending,
    Subscribed,
    /// Subscribed, with a renewal awaiting its Ack
    Renewal,
}

impl EventgroupPhase {
    pub fn public_state(&self) -> SubscriptionState {
        match self {
            EventgroupPhase::NotSubscribed => SubscriptionState::NotSubscribed,
            EventgroupPhase::Pending => SubscriptionState::SubscriptionPending,
            EventgroupPhase::Subscribed | EventgroupPhase::Renewal => SubscriptionState::Subscribed,
        }
    }

    fn is_subscribed(&self) -> bool {
        matches!(self, EventgroupPhase::Subscribed | EventgroupPhase::Renewal)
    }
}

#[derive(Debug)]
struct EventgroupStateMachine {
    eventgroup_id: u16,
    ttl: u32,
    subscribers: usize,
    phase: EventgroupPhase,
    ack_timer: Timer,
    ttl_timer: Timer,
    multicast: Option<SocketAddr>,
}

impl EventgroupStateMachine {
    fn new(eventgroup_id: u16, ttl: u32) -> Self {
        EventgroupStateMachine {
            eventgroup_id,
            ttl,
            subscribers: 0,
            phase: EventgroupPhase::NotSubscribed,
            ack_timer: Timer::new(),
            ttl_timer: Timer::new(),
            multicast: None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest([self.ack_timer.deadline(), self.ttl_timer.deadline()])
    }
}

/// Server the subscriptions go to, known while an offer is active.
#[derive(Debug, Clone, Copy)]
struct Server {
    sd_address: SocketAddr,
    major_version: u8,
}

/// Eventgroup subscriptions of one required service instance.
pub struct EventgroupManager {
    key: ServiceInstanceKey,
    local: IpAddr,
    ack_timeout: Duration,
    server: Option<Server>,
    machines: Vec<EventgroupStateMachine>,
    // reference count per event multicast group
    listeners: HashMap<SocketAddr, usize>,
}

impl EventgroupManager {
    pub fn new(key: ServiceInstanceKey, local: IpAddr, config: &ClientSdConfig, eventgroups: &[u16]) -> Self {
        let machines = eventgroups
            .iter()
            .map(|id| EventgroupStateMachine::new(*id, config.subscribe_ttl(*id)))
            .collect();
        EventgroupManager {
            key,
            local,
            ack_timeout: config.subscribe_ack_timeout(),
            server: None,
            machines,
            listeners: HashMap::new(),
        }
    }

    pub fn is_service_available(&self) -> bool {
        self.server.is_some()
    }

    pub fn phase(&self, eventgroup_id: u16) -> Option<EventgroupPhase> {
        self.machine(eventgroup_id).map(|m| m.phase)
    }

    pub fn state(&self, eventgroup_id: u16) -> Option<SubscriptionState> {
        self.phase(eventgroup_id).map(|p| p.public_state())
    }

    pub fn subscriber_count(&self, eventgroup_id: u16) -> usize {
        self.machine(eventgroup_id).map_or(0, |m| m.subscribers)
    }

    pub fn on_subscribe(&mut self, ctx: &mut SdContext<'_>, builder: &ClientMessageBuilder, eventgroup_id: u16) -> Result<()> {
        let server = self.server;
        let idx = self.index(eventgroup_id)?;
        let m = &mut self.machines[idx];
        m.subscribers += 1;
        if m.subscribers == 1 && m.phase == EventgroupPhase::NotSubscribed {
            if let Some(server) = server {
                Self::enter_pending(ctx, self.key, self.local, self.ack_timeout, builder, server, m);
            }
        }
        Ok(())
    }

    pub fn on_unsubscribe(
        &mut self,
        ctx: &mut SdContext<'_>,
        builder: &ClientMessageBuilder,
        instance: &mut dyn ClientServiceInstance,
        eventgroup_id: u16,
    ) -> Result<()> {
        let idx = self.index(eventgroup_id)?;
        if self.machines[idx].subscribers == 0 {
            return Err(SdError::AlreadyReleased { service_id: self.key.service_id, instance_id: self.key.instance_id });
        }
        self.machines[idx].subscribers -= 1;
        if self.machines[idx].subscribers == 0 {
            self.release(ctx, builder, instance, idx);
        }
        Ok(())
    }

    /// Last subscriber gone: cancel whatever is in flight or established.
    fn release(&mut self, ctx: &mut SdContext<'_>, builder: &ClientMessageBuilder, instance: &mut dyn ClientServiceInstance, idx: usize) {
        let phase = self.machines[idx].phase;
        let eventgroup_id = self.machines[idx].eventgroup_id;
        if phase != EventgroupPhase::NotSubscribed {
            if let Some(server) = self.server {
                let (entry, options) = builder.stop_subscribe(server.major_version, eventgroup_id);
                ctx.send_entry(self.local, Destination::Unicast(server.sd_address), entry, options);
            }
        }
        self.leave(ctx, instance, idx, phase.is_subscribed());
    }

    pub fn on_subscribe_eventgroup_ack(
        &mut self,
        ctx: &mut SdContext<'_>,
        instance: &mut dyn ClientServiceInstance,
        eventgroup_id: u16,
        multicast: Option<SocketAddr>,
        ttl: u32,
    ) {
        let Ok(idx) = self.index(eventgroup_id) else {
            debug!("{} ack for unknown eventgroup 0x{:04x}", self.sid(), eventgroup_id);
            return;
        };
        let sid = self.sid();
        let m = &mut self.machines[idx];
        let first = m.phase == EventgroupPhase::Pending;
        match m.phase {
            EventgroupPhase::Pending | EventgroupPhase::Renewal | EventgroupPhase::Subscribed => {
                m.ack_timer.stop();
                m.phase = EventgroupPhase::Subscribed;
                if ttl == TTL_INFINITE {
                    m.ttl_timer.stop();
                } else {
                    m.ttl_timer.start(ctx.now(), Duration::from_secs(u64::from(ttl)), false);
                }
            }
            EventgroupPhase::NotSubscribed => {
                debug!("{} unexpected ack for eventgroup 0x{:04x}", sid, eventgroup_id);
                return;
            }
        }
        if first {
            info!("{} eventgroup 0x{:04x} subscribed", sid, eventgroup_id);
            if let Some(group) = multicast {
                m.multicast = Some(group);
                self.start_listening(instance, group);
            }
            self.notify(ctx, eventgroup_id, EventgroupChange::Subscribed);
        } else if let Some(group) = multicast.filter(|g| m.multicast != Some(*g)) {
            debug!("{} eventgroup 0x{:04x} moved to multicast {}", sid, eventgroup_id, group);
            let previous = m.multicast.replace(group);
            if let Some(previous) = previous {
                self.stop_listening(instance, previous);
            }
            self.start_listening(instance, group);
        }
    }

    pub fn on_subscribe_eventgroup_nack(&mut self, ctx: &mut SdContext<'_>, instance: &mut dyn ClientServiceInstance, eventgroup_id: u16) {
        let Ok(idx) = self.index(eventgroup_id) else {
            return;
        };
        let phase = self.machines[idx].phase;
        warn!("{} subscription of eventgroup 0x{:04x} rejected", self.sid(), eventgroup_id);
        self.leave(ctx, instance, idx, phase.is_subscribed());
    }

    /// An offer arrived: (re)subscribe every eventgroup that has subscribers.
    pub fn on_offer_service(
        &mut self,
        ctx: &mut SdContext<'_>,
        builder: &ClientMessageBuilder,
        sd_address: SocketAddr,
        major_version: u8,
        is_multicast: bool,
    ) {
        debug!("{} offer from {} (multicast: {})", self.sid(), sd_address, is_multicast);
        let server = Server { sd_address, major_version };
        self.server = Some(server);
        for m in self.machines.iter_mut().filter(|m| m.subscribers > 0) {
            match m.phase {
                EventgroupPhase::NotSubscribed => {
                    Self::enter_pending(ctx, self.key, self.local, self.ack_timeout, builder, server, m);
                }
                EventgroupPhase::Subscribed => {
                    m.phase = EventgroupPhase::Renewal;
                    Self::send_subscribe(ctx, self.local, builder, server, m);
                    m.ack_timer.start(ctx.now(), self.ack_timeout, false);
                }
                EventgroupPhase::Pending | EventgroupPhase::Renewal => {}
            }
        }
    }

    pub fn on_stop_offer_service(&mut self, ctx: &mut SdContext<'_>, instance: &mut dyn ClientServiceInstance) {
        self.server = None;
        for idx in 0..self.machines.len() {
            let phase = self.machines[idx].phase;
            if phase != EventgroupPhase::NotSubscribed {
                self.leave(ctx, instance, idx, true);
            }
        }
    }

    /// The service was released: forget every subscription.
    pub fn on_service_released(&mut self, ctx: &mut SdContext<'_>, builder: &ClientMessageBuilder, instance: &mut dyn ClientServiceInstance) {
        for idx in 0..self.machines.len() {
            if self.machines[idx].phase != EventgroupPhase::NotSubscribed {
                self.release(ctx, builder, instance, idx);
            }
            self.machines[idx].subscribers = 0;
        }
        self.server = None;
    }

    pub fn on_timeout(&mut self, ctx: &mut SdContext<'_>, builder: &ClientMessageBuilder, instance: &mut dyn ClientServiceInstance) {
        let now = ctx.now();
        for idx in 0..self.machines.len() {
            let server = self.server;
            let m = &mut self.machines[idx];
            if m.ack_timer.fire(now) {
                if let Some(server) = server {
                    debug!("{} no ack for eventgroup 0x{:04x}, retrying", Sid(self.key.service_id, self.key.instance_id), m.eventgroup_id);
                    Self::send_subscribe(ctx, self.local, builder, server, m);
                    m.ack_timer.start(now, self.ack_timeout, false);
                }
            }
            if m.ttl_timer.fire(now) && m.phase.is_subscribed() {
                info!("{} subscription of eventgroup 0x{:04x} expired", Sid(self.key.service_id, self.key.instance_id), m.eventgroup_id);
                let eventgroup_id = m.eventgroup_id;
                let group = m.multicast.take();
                m.phase = EventgroupPhase::Pending;
                if let Some(server) = server {
                    Self::send_subscribe(ctx, self.local, builder, server, m);
                    m.ack_timer.start(now, self.ack_timeout, false);
                }
                if let Some(group) = group {
                    self.stop_listening(instance, group);
                }
                self.notify(ctx, eventgroup_id, EventgroupChange::Unsubscribed);
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest(self.machines.iter().map(EventgroupStateMachine::next_deadline))
    }

    fn enter_pending(
        ctx: &mut SdContext<'_>,
        key: ServiceInstanceKey,
        local: IpAddr,
        ack_timeout: Duration,
        builder: &ClientMessageBuilder,
        server: Server,
        m: &mut EventgroupStateMachine,
    ) {
        m.phase = EventgroupPhase::Pending;
        Self::send_subscribe(ctx, local, builder, server, m);
        m.ack_timer.start(ctx.now(), ack_timeout, false);
        ctx.notify(EventgroupNotification {
            service_id: key.service_id,
            instance_id: key.instance_id,
            eventgroup_id: m.eventgroup_id,
            change: EventgroupChange::Pending,
        });
    }

    fn send_subscribe(ctx: &mut SdContext<'_>, local: IpAddr, builder: &ClientMessageBuilder, server: Server, m: &EventgroupStateMachine) {
        let (entry, options) = builder.subscribe(server.major_version, m.eventgroup_id, m.ttl);
        ctx.send_entry(local, Destination::Unicast(server.sd_address), entry, options);
    }

    /// Back to NotSubscribed: timers stopped, multicast group left.
    fn leave(&mut self, ctx: &mut SdContext<'_>, instance: &mut dyn ClientServiceInstance, idx: usize, notify: bool) {
        let m = &mut self.machines[idx];
        m.phase = EventgroupPhase::NotSubscribed;
        m.ack_timer.stop();
        m.ttl_timer.stop();
        let eventgroup_id = m.eventgroup_id;
        if let Some(group) = m.multicast.take() {
            self.stop_listening(instance, group);
        }
        if notify {
            self.notify(ctx, eventgroup_id, EventgroupChange::Unsubscribed);
        }
    }

    fn start_listening(&mut self, instance: &mut dyn ClientServiceInstance, group: SocketAddr) {
        let count = self.listeners.entry(group).or_insert(0);
        *count += 1;
        if *count == 1 {
            instance.start_listen_multicast(group);
        }
    }

    fn stop_listening(&mut self, instance: &mut dyn ClientServiceInstance, group: SocketAddr) {
        if let Some(count) = self.listeners.get_mut(&group) {
            *count -= 1;
            if *count == 0 {
                self.listeners.remove(&group);
                instance.stop_listen_multicast(group);
            }
        }
    }

    fn notify(&self, ctx: &mut SdContext<'_>, eventgroup_id: u16, change: EventgroupChange) {
        ctx.notify(EventgroupNotification {
            service_id: self.key.service_id,
            instance_id: self.key.instance_id,
            eventgroup_id,
            change,
        });
    }

    fn index(&self, eventgroup_id: u16) -> Result<usize> {
        self.machines
            .iter()
            .position(|m| m.eventgroup_id == eventgroup_id)
            .ok_or(SdError::NotSubscribed { service_id: self.key.service_id, eventgroup_id })
    }

    fn machine(&self, eventgroup_id: u16) -> Option<&EventgroupStateMachine> {
        self.machines.iter().find(|m| m.eventgroup_id == eventgroup_id)
    }

    fn sid(&self) -> Sid {
        Sid(self.key.service_id, self.key.instance_id)
    }
}
