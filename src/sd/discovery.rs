//! The service discovery engine.
//!
//! [`ServiceDiscovery`] owns every server and client state machine built from the
//! [`SystemConfig`], routes inbound SD messages to them and fires their timers.
//! It performs no I/O: inbound datagrams are handed in through [`ServiceDiscovery::on_datagram`],
//! outbound ones are collected with [`ServiceDiscovery::take_datagrams`], and time comes from
//! an injected [`Clock`]. Every public call processes timers that are already due, so a
//! zero delay takes effect before the call returns.

use crate::codec::SomeIpHeader;
use crate::error::{Result, SdError};
use crate::logging::Sid;
use crate::runtime::config::SystemConfig;
use crate::sd::client::{ClientStateMachine, FindPhase, SubscriptionState};
use crate::sd::context::{Destination, EventgroupChange, EventgroupNotification, OutboundMessage, SdContext};
use crate::sd::endpoint::SdEndpoint;
use crate::sd::entries::EntryKind;
use crate::sd::instance::{ClientServiceInstance, ConnectionManager, ServiceInstanceKey};
use crate::sd::packet::SdPacket;
use crate::sd::routing::{PacketRouter, SinkRef};
use crate::sd::server::{ServerPhase, ServerStateMachine, nack_entry};
use crate::sd::timer::{Clock, earliest};
use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

/// Told whenever a local service instance starts or stops being offered.
pub trait ServiceOfferObserver: Send + Sync {
    fn on_offer_service(&self, service_id: u16, instance_id: u16);
    fn on_stop_offer_service(&self, service_id: u16, instance_id: u16);
}

/// Told whenever the subscription state of an event changes.
pub trait EventSubscriptionObserver: Send + Sync {
    fn on_subscription_state(&self, service_id: u16, instance_id: u16, event_id: u16, state: SubscriptionState);
}

/// Encoded SD message ready for the socket of `local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub local: IpAddr,
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MachineHandle {
    Server(usize),
    Client(usize),
}

pub struct ServiceDiscovery {
    config: SystemConfig,
    clock: Box<dyn Clock>,
    rng: StdRng,
    router: Box<dyn PacketRouter>,
    endpoints: Vec<SdEndpoint>,
    servers: Vec<ServerStateMachine>,
    clients: Vec<ClientStateMachine>,
    index: HashMap<IpAddr, Vec<MachineHandle>>,
    // connected without discovery
    static_instances: Vec<Box<dyn ClientServiceInstance>>,
    offered: HashSet<(u16, u16)>,
    offer_observers: Vec<Arc<dyn ServiceOfferObserver>>,
    event_observers: Vec<Arc<dyn EventSubscriptionObserver>>,
    outbox: Vec<OutboundMessage>,
    notifications: Vec<EventgroupNotification>,
    started: bool,
}

impl ServiceDiscovery {
    /// Builds one endpoint per network endpoint, one server state machine per provided
    /// instance and port mapping, and one client state machine per required instance.
    /// `seed` makes the random delays reproducible.
    pub fn new(
        config: SystemConfig,
        mut connections: Box<dyn ConnectionManager>,
        router: Box<dyn PacketRouter>,
        clock: Box<dyn Clock>,
        seed: Option<u64>,
    ) -> Result<Self> {
        config.validate()?;
        let endpoints = config.network_endpoints.iter().cloned().map(SdEndpoint::new).collect();
        let mut index: HashMap<IpAddr, Vec<MachineHandle>> = HashMap::new();

        let mut servers = Vec::new();
        for provided in &config.provided {
            let eventgroups = service_eventgroups(&config, provided.service_id);
            for mapping in &provided.port_mappings {
                let instance = connections.server_instance(provided, mapping);
                index.entry(mapping.address).or_default().push(MachineHandle::Server(servers.len()));
                servers.push(ServerStateMachine::new(provided, mapping, eventgroups.clone(), instance));
            }
        }

        let mut clients: Vec<ClientStateMachine> = Vec::new();
        let mut static_instances = Vec::new();
        if config.static_sd.enable {
            for remote in &config.static_sd.endpoints {
                let tcp = remote.tcp_port.map(|p| SocketAddr::new(remote.address, p));
                let udp = remote.udp_port.map(|p| SocketAddr::new(remote.address, p));
                for required in &remote.required_service_instances {
                    let key = ServiceInstanceKey::new(
                        required.service_id,
                        required.instance_id,
                        required.major_version,
                        required.minor_version,
                    );
                    info!("{} statically connected to {}", key, remote.address);
                    let mut instance = connections.client_instance(key);
                    instance.connect(tcp, udp);
                    static_instances.push(instance);
                }
            }
        } else {
            for required in &config.required {
                let duplicate = clients.iter().any(|c| {
                    c.key().service_id == required.service_id && c.key().instance_id == required.instance_id
                });
                if duplicate {
                    error!("{} required twice, ignoring", Sid(required.service_id, required.instance_id));
                    continue;
                }
                let key = ServiceInstanceKey::new(
                    required.service_id,
                    required.instance_id,
                    required.major_version,
                    required.minor_version,
                );
                let instance = connections.client_instance(key);
                let eventgroups = service_eventgroups(&config, required.service_id);
                index
                    .entry(required.port_mapping.address)
                    .or_default()
                    .push(MachineHandle::Client(clients.len()));
                clients.push(ClientStateMachine::new(required, &eventgroups, instance));
            }
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(ServiceDiscovery {
            config,
            clock,
            rng,
            router,
            endpoints,
            servers,
            clients,
            index,
            static_instances,
            offered: HashSet::new(),
            offer_observers: Vec::new(),
            event_observers: Vec::new(),
            outbox: Vec::new(),
            notifications: Vec::new(),
            started: false,
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Brings the network up for every state machine.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let now = self.clock.now();
        let request = self.config.request_required_on_startup;
        {
            let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notifications);
            for sm in &mut self.servers {
                sm.on_network_up(&mut ctx);
            }
            for sm in &mut self.clients {
                sm.on_network_up(&mut ctx);
                if request {
                    sm.on_service_requested(&mut ctx);
                }
            }
        }
        info!("service discovery started: {} server(s), {} client(s)", self.servers.len(), self.clients.len());
        self.poll();
    }

    /// Takes every state machine down, clients first.
    pub fn shutdown(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        let now = self.clock.now();
        {
            let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notifications);
            for sm in self.clients.iter_mut().rev() {
                sm.on_stop(&mut ctx);
            }
            for sm in self.servers.iter_mut().rev() {
                sm.on_network_down(&mut ctx);
                sm.on_stop(&mut ctx);
            }
        }
        for instance in &mut self.static_instances {
            instance.disconnect();
        }
        self.dispatch_notifications();
        info!("service discovery stopped");
    }

    pub fn offer_service(&mut self, service_id: u16, instance_id: u16, sink: SinkRef) -> Result<()> {
        if !self.offered.insert((service_id, instance_id)) {
            error!("{} is already offered", Sid(service_id, instance_id));
            return Err(SdError::AlreadyOffered { service_id, instance_id });
        }
        info!("{} offered", Sid(service_id, instance_id));
        self.router.add_request_route(service_id, instance_id, sink);
        for observer in &self.offer_observers {
            observer.on_offer_service(service_id, instance_id);
        }

        let now = self.clock.now();
        let mut found = false;
        {
            let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notifications);
            for sm in self.servers.iter_mut().filter(|sm| is_pair(sm.key(), service_id, instance_id)) {
                sm.on_service_up(&mut ctx);
                found = true;
            }
        }
        if !found {
            error!("{} has no server state machine", Sid(service_id, instance_id));
        }
        self.notify_service_events(service_id, instance_id, SubscriptionState::Subscribed);
        self.poll();
        Ok(())
    }

    pub fn stop_offer_service(&mut self, service_id: u16, instance_id: u16) -> Result<()> {
        if !self.offered.remove(&(service_id, instance_id)) {
            error!("{} is not offered", Sid(service_id, instance_id));
            return Err(SdError::NotOffered { service_id, instance_id });
        }
        info!("{} no longer offered", Sid(service_id, instance_id));
        self.router.delete_request_route(service_id, instance_id);
        for observer in &self.offer_observers {
            observer.on_stop_offer_service(service_id, instance_id);
        }

        let now = self.clock.now();
        {
            let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notifications);
            for sm in self.servers.iter_mut().filter(|sm| is_pair(sm.key(), service_id, instance_id)) {
                sm.on_service_down(&mut ctx);
            }
        }
        self.notify_service_events(service_id, instance_id, SubscriptionState::SubscriptionPending);
        self.poll();
        Ok(())
    }

    pub fn is_offered(&self, service_id: u16, instance_id: u16) -> bool {
        self.offered.contains(&(service_id, instance_id))
    }

    /// Routes notifications of `event_id` to `sink` and subscribes its eventgroup.
    /// Without a client state machine the event is local and subscribed at once.
    pub fn subscribe_event(&mut self, service_id: u16, instance_id: u16, event_id: u16, sink: SinkRef) -> Result<()> {
        self.router.add_event_route(service_id, instance_id, event_id, sink.clone());

        match self.client_index(service_id, instance_id) {
            None => self.notify_event(service_id, instance_id, event_id, SubscriptionState::Subscribed),
            Some(idx) => match self.config.eventgroup_of_event(service_id, event_id) {
                None => error!("{} event 0x{:04x} belongs to no eventgroup", Sid(service_id, instance_id), event_id),
                Some(eventgroup_id) => {
                    let eventgroups = self.clients[idx].eventgroups();
                    let current = match eventgroups.state(eventgroup_id) {
                        Some(SubscriptionState::NotSubscribed) if eventgroups.subscriber_count(eventgroup_id) > 0 => {
                            SubscriptionState::SubscriptionPending
                        }
                        Some(state) => state,
                        None => SubscriptionState::NotSubscribed,
                    };
                    self.notify_event(service_id, instance_id, event_id, current);

                    let now = self.clock.now();
                    let result = {
                        let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notifications);
                        self.clients[idx].on_subscribe(&mut ctx, eventgroup_id)
                    };
                    self.poll();
                    result?;
                }
            },
        }
        if self.config.is_field(service_id, event_id) {
            self.router.send_initial_event(service_id, instance_id, event_id, &sink);
        }
        Ok(())
    }

    pub fn unsubscribe_event(&mut self, service_id: u16, instance_id: u16, event_id: u16, sink: &SinkRef) -> Result<()> {
        self.router.delete_event_route(service_id, instance_id, event_id, sink);

        match self.client_index(service_id, instance_id) {
            None => {
                self.notify_event(service_id, instance_id, event_id, SubscriptionState::NotSubscribed);
                Ok(())
            }
            Some(idx) => match self.config.eventgroup_of_event(service_id, event_id) {
                None => {
                    error!("{} event 0x{:04x} belongs to no eventgroup", Sid(service_id, instance_id), event_id);
                    Ok(())
                }
                Some(eventgroup_id) => {
                    let now = self.clock.now();
                    let result = {
                        let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notifications);
                        self.clients[idx].on_unsubscribe(&mut ctx, eventgroup_id)
                    };
                    self.poll();
                    result
                }
            },
        }
    }

    pub fn request_service(&mut self, service_id: u16, instance_id: u16) -> Result<()> {
        let idx = self.require_client(service_id, instance_id)?;
        let now = self.clock.now();
        {
            let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notifications);
            self.clients[idx].on_service_requested(&mut ctx);
        }
        self.poll();
        Ok(())
    }

    pub fn release_service(&mut self, service_id: u16, instance_id: u16) -> Result<()> {
        let idx = self.require_client(service_id, instance_id)?;
        let now = self.clock.now();
        let result = {
            let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notifications);
            self.clients[idx].on_service_released(&mut ctx)
        };
        self.poll();
        result
    }

    pub fn register_offer_observer(&mut self, observer: Arc<dyn ServiceOfferObserver>) {
        self.offer_observers.push(observer);
    }

    pub fn unregister_offer_observer(&mut self, observer: &Arc<dyn ServiceOfferObserver>) {
        match self.offer_observers.iter().position(|o| Arc::ptr_eq(o, observer)) {
            Some(pos) => {
                self.offer_observers.remove(pos);
            }
            None => error!("unregistering unknown offer observer"),
        }
    }

    pub fn register_event_observer(&mut self, observer: Arc<dyn EventSubscriptionObserver>) {
        self.event_observers.push(observer);
    }

    pub fn unregister_event_observer(&mut self, observer: &Arc<dyn EventSubscriptionObserver>) {
        match self.event_observers.iter().position(|o| Arc::ptr_eq(o, observer)) {
            Some(pos) => {
                self.event_observers.remove(pos);
            }
            None => error!("unregistering unknown event subscription observer"),
        }
    }

    /// Decodes and dispatches one datagram received on the endpoint `local`.
    pub fn on_datagram(&mut self, local: IpAddr, from: SocketAddr, is_multicast: bool, datagram: &[u8]) -> Result<()> {
        let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.address() == local) else {
            warn!("datagram for unknown endpoint {} dropped", local);
            return Ok(());
        };
        if from == endpoint.unicast_addr() {
            // our own multicast looped back
            return Ok(());
        }
        let inbound = endpoint.decode(from, is_multicast, datagram)?;
        if inbound.reboot_detected {
            info!("reboot of {} detected on {}", from, local);
            self.on_reboot_detected(local, from);
        }
        if is_multicast {
            self.on_multicast_message(local, from, &inbound.packet);
        } else {
            self.on_unicast_message(local, from, &inbound.packet);
        }
        Ok(())
    }

    pub fn on_unicast_message(&mut self, local: IpAddr, from: SocketAddr, packet: &SdPacket) {
        self.dispatch(local, from, packet, false);
        if self.config.nack_unmatched_subscriptions {
            self.nack_unmatched(local, from, packet);
        }
        self.poll();
    }

    pub fn on_multicast_message(&mut self, local: IpAddr, from: SocketAddr, packet: &SdPacket) {
        self.dispatch(local, from, packet, true);
        self.poll();
    }

    fn dispatch(&mut self, local: IpAddr, from: SocketAddr, packet: &SdPacket, is_multicast: bool) {
        let Some(handles) = self.index.get(&local) else {
            warn!("SD message from {} for unknown address {} dropped", from, local);
            return;
        };
        let now = self.clock.now();
        let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notifications);
        for handle in handles {
            match (*handle, is_multicast) {
                (MachineHandle::Server(i), false) => self.servers[i].on_unicast_message(&mut ctx, from, packet),
                (MachineHandle::Server(i), true) => self.servers[i].on_multicast_message(&mut ctx, from, packet),
                (MachineHandle::Client(i), false) => self.clients[i].on_unicast_message(&mut ctx, from, packet),
                (MachineHandle::Client(i), true) => self.clients[i].on_multicast_message(&mut ctx, from, packet),
            }
        }
    }

    /// Answers unicast subscriptions that no local server state machine accepts.
    fn nack_unmatched(&mut self, local: IpAddr, from: SocketAddr, packet: &SdPacket) {
        let handles = self.index.get(&local).map(Vec::as_slice).unwrap_or(&[]);
        for entry in packet.entries.iter().filter(|e| e.kind() == EntryKind::SubscribeEventgroup) {
            let served = handles.iter().any(|h| match h {
                MachineHandle::Server(i) => self.servers[*i].accepts_subscription(entry),
                MachineHandle::Client(_) => false,
            });
            if served {
                continue;
            }
            warn!(
                "{} subscription of eventgroup 0x{:04x} from {} matches no provided instance",
                Sid(entry.service_id, entry.instance_id),
                entry.eventgroup_id,
                from
            );
            let key = ServiceInstanceKey::new(entry.service_id, entry.instance_id, entry.major_version, 0);
            let (nack, options) = nack_entry(key, entry.eventgroup_id, entry.counter);
            let mut reply = SdPacket::new();
            reply.push(nack, &options);
            self.outbox.push(OutboundMessage { local, destination: Destination::Unicast(from), packet: reply });
        }
    }

    pub fn on_reboot_detected(&mut self, local: IpAddr, from: SocketAddr) {
        let Some(handles) = self.index.get(&local) else {
            return;
        };
        let now = self.clock.now();
        let mut ctx = SdContext::new(now, &mut self.rng, &mut self.outbox, &mut self.notifications);
        for handle in handles {
            match *handle {
                MachineHandle::Server(i) => self.servers[i].on_reboot_detected(from),
                MachineHandle::Client(i) => self.clients[i].on_reboot_detected(&mut ctx, from),
            }
        }
        drop(ctx);
        self.dispatch_notifications();
    }

    /// Earliest pending timer of any state machine.
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest(
            self.servers
                .iter()
                .map(ServerStateMachine::next_deadline)
                .chain(self.clients.iter().map(ClientStateMachine::next_deadline)),
        )
    }

    /// Fires every timer that is due, each at its own deadline.
    pub fn poll(&mut self) {
        let now = self.clock.now();
        while let Some(deadline) = self.next_deadline().filter(|d| *d <= now) {
            {
                let mut ctx = SdContext::new(deadline, &mut self.rng, &mut self.outbox, &mut self.notifications);
                for sm in &mut self.servers {
                    if sm.next_deadline().is_some_and(|d| d <= deadline) {
                        sm.on_timeout(&mut ctx);
                    }
                }
                for sm in &mut self.clients {
                    if sm.next_deadline().is_some_and(|d| d <= deadline) {
                        sm.on_timeout(&mut ctx);
                    }
                }
            }
            self.dispatch_notifications();
        }
        self.dispatch_notifications();
    }

    /// Messages queued since the last call, before encoding.
    pub fn take_outbound(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Encodes queued messages. Messages from one endpoint to the same destination
    /// share a datagram as long as it stays within the endpoint MTU.
    pub fn take_datagrams(&mut self) -> Vec<Datagram> {
        let mut batches: Vec<OutboundMessage> = Vec::new();
        for msg in std::mem::take(&mut self.outbox) {
            let mtu = self.endpoints.iter().find(|e| e.address() == msg.local).map_or(0, SdEndpoint::mtu);
            let batch = batches.iter_mut().find(|b| {
                b.local == msg.local
                    && b.destination == msg.destination
                    && b.packet.can_append(&msg.packet)
                    && SomeIpHeader::HEADER_LENGTH + b.packet.encoded_len() + msg.packet.encoded_len() - SD_EMPTY_LEN <= mtu
            });
            match batch {
                Some(batch) => batch.packet.append(&msg.packet),
                None => batches.push(msg),
            }
        }

        let mut datagrams = Vec::with_capacity(batches.len());
        for msg in batches {
            let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.address() == msg.local) else {
                warn!("no endpoint {} to send from, message dropped", msg.local);
                continue;
            };
            match endpoint.encode(msg.destination, &msg.packet) {
                Ok((to, bytes)) => datagrams.push(Datagram { local: msg.local, to, bytes }),
                Err(e) => error!("failed to encode SD message for {}: {}", msg.local, e),
            }
        }
        datagrams
    }

    pub fn is_service_available(&self, service_id: u16, instance_id: u16) -> bool {
        self.client_index(service_id, instance_id)
            .is_some_and(|i| self.clients[i].is_service_available())
    }

    pub fn eventgroup_state(&self, service_id: u16, instance_id: u16, eventgroup_id: u16) -> Option<SubscriptionState> {
        let idx = self.client_index(service_id, instance_id)?;
        self.clients[idx].eventgroups().state(eventgroup_id)
    }

    /// Phases of every server state machine of the pair, one per port mapping.
    pub fn server_phases(&self, service_id: u16, instance_id: u16) -> Vec<ServerPhase> {
        self.servers
            .iter()
            .filter(|sm| is_pair(sm.key(), service_id, instance_id))
            .map(ServerStateMachine::phase)
            .collect()
    }

    pub fn client_phase(&self, service_id: u16, instance_id: u16) -> Option<FindPhase> {
        self.client_index(service_id, instance_id).map(|i| self.clients[i].phase())
    }

    fn client_index(&self, service_id: u16, instance_id: u16) -> Option<usize> {
        self.clients.iter().position(|c| is_pair(c.key(), service_id, instance_id))
    }

    fn require_client(&self, service_id: u16, instance_id: u16) -> Result<usize> {
        self.client_index(service_id, instance_id).ok_or_else(|| {
            error!("{} has no client state machine", Sid(service_id, instance_id));
            SdError::NoStateMachine { service_id, instance_id }
        })
    }

    fn dispatch_notifications(&mut self) {
        for note in std::mem::take(&mut self.notifications) {
            let state = match note.change {
                EventgroupChange::Subscribed => SubscriptionState::Subscribed,
                EventgroupChange::Pending => SubscriptionState::SubscriptionPending,
                EventgroupChange::Unsubscribed => {
                    let subscribers = self
                        .client_index(note.service_id, note.instance_id)
                        .map_or(0, |i| self.clients[i].eventgroups().subscriber_count(note.eventgroup_id));
                    if subscribers > 0 {
                        SubscriptionState::SubscriptionPending
                    } else {
                        SubscriptionState::NotSubscribed
                    }
                }
            };
            debug!(
                "{} eventgroup 0x{:04x} is {:?}",
                Sid(note.service_id, note.instance_id),
                note.eventgroup_id,
                state
            );
            for event_id in self.config.eventgroup_events(note.service_id, note.eventgroup_id) {
                self.notify_event(note.service_id, note.instance_id, *event_id, state);
            }
        }
    }

    fn notify_service_events(&self, service_id: u16, instance_id: u16, state: SubscriptionState) {
        for event_id in self.config.events(service_id) {
            self.notify_event(service_id, instance_id, event_id, state);
        }
    }

    fn notify_event(&self, service_id: u16, instance_id: u16, event_id: u16, state: SubscriptionState) {
        for observer in &self.event_observers {
            observer.on_subscription_state(service_id, instance_id, event_id, state);
        }
    }
}

// flags, reserved and both length fields of an SD payload without entries or options
const SD_EMPTY_LEN: usize = 12;

fn is_pair(key: ServiceInstanceKey, service_id: u16, instance_id: u16) -> bool {
    key.service_id == service_id && key.instance_id == instance_id
}

fn service_eventgroups(config: &SystemConfig, service_id: u16) -> Vec<u16> {
    config
        .service(service_id)
        .map(|s| s.eventgroups.iter().map(|eg| eg.id).collect())
        .unwrap_or_default()
}
