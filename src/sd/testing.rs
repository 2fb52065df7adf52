//! In-memory fakes for driving [`ServiceDiscovery`](crate::sd::ServiceDiscovery) without sockets.

use crate::codec::SomeIpHeader;
use crate::runtime::config::{
    ClientSdConfig, EventConfig, EventgroupConfig, NetworkEndpointConfig, PortMappingConfig,
    ProvidedEventgroupSdConfig, ProvidedInstanceConfig, RequiredInstanceConfig, ServerSdConfig, ServiceConfig,
    StaticSdConfig, SystemConfig,
};
use crate::sd::client::SubscriptionState;
use crate::sd::discovery::{EventSubscriptionObserver, ServiceOfferObserver};
use crate::sd::instance::{
    ClientServiceInstance, ConnectionManager, EventgroupSubscriber, ServerServiceInstance, ServiceInstanceKey,
};
use crate::sd::routing::PacketSink;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

pub use crate::sd::timer::ManualClock;

/// One call made by the engine into a service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceCall {
    Start(u16, u16),
    Stop(u16, u16),
    Subscribe { service_id: u16, eventgroup_id: u16, subscriber: EventgroupSubscriber },
    Unsubscribe { service_id: u16, eventgroup_id: u16, subscriber: EventgroupSubscriber },
    Connect { service_id: u16, tcp: Option<SocketAddr>, udp: Option<SocketAddr> },
    Disconnect(u16),
    Listen(u16, SocketAddr),
    StopListen(u16, SocketAddr),
}

#[derive(Default)]
struct Shared {
    calls: Vec<InstanceCall>,
    tcp_peers: HashSet<SocketAddr>,
}

/// Hands out instances that append every call to one shared log.
#[derive(Clone, Default)]
pub struct RecordingConnections {
    shared: Arc<Mutex<Shared>>,
}

impl RecordingConnections {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn calls(&self) -> Vec<InstanceCall> {
        self.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<InstanceCall> {
        std::mem::take(&mut self.lock().calls)
    }

    /// Marks `peer` as having an established TCP connection to every server instance.
    pub fn add_tcp_peer(&self, peer: SocketAddr) {
        self.lock().tcp_peers.insert(peer);
    }
}

struct RecordingServer {
    key: (u16, u16),
    log: RecordingConnections,
}

impl ServerServiceInstance for RecordingServer {
    fn start(&mut self) {
        self.log.lock().calls.push(InstanceCall::Start(self.key.0, self.key.1));
    }

    fn stop(&mut self) {
        self.log.lock().calls.push(InstanceCall::Stop(self.key.0, self.key.1));
    }

    fn subscribe_eventgroup(&mut self, eventgroup_id: u16, subscriber: &EventgroupSubscriber) {
        self.log.lock().calls.push(InstanceCall::Subscribe {
            service_id: self.key.0,
            eventgroup_id,
            subscriber: *subscriber,
        });
    }

    fn unsubscribe_eventgroup(&mut self, eventgroup_id: u16, subscriber: &EventgroupSubscriber) {
        self.log.lock().calls.push(InstanceCall::Unsubscribe {
            service_id: self.key.0,
            eventgroup_id,
            subscriber: *subscriber,
        });
    }

    fn has_tcp_connection(&self, remote: SocketAddr) -> bool {
        self.log.lock().tcp_peers.contains(&remote)
    }
}

struct RecordingClient {
    service_id: u16,
    log: RecordingConnections,
}

impl ClientServiceInstance for RecordingClient {
    fn connect(&mut self, tcp: Option<SocketAddr>, udp: Option<SocketAddr>) {
        self.log.lock().calls.push(InstanceCall::Connect { service_id: self.service_id, tcp, udp });
    }

    fn disconnect(&mut self) {
        self.log.lock().calls.push(InstanceCall::Disconnect(self.service_id));
    }

    fn start_listen_multicast(&mut self, group: SocketAddr) {
        self.log.lock().calls.push(InstanceCall::Listen(self.service_id, group));
    }

    fn stop_listen_multicast(&mut self, group: SocketAddr) {
        self.log.lock().calls.push(InstanceCall::StopListen(self.service_id, group));
    }
}

impl ConnectionManager for RecordingConnections {
    fn server_instance(
        &mut self,
        instance: &ProvidedInstanceConfig,
        _mapping: &PortMappingConfig,
    ) -> Box<dyn ServerServiceInstance> {
        Box::new(RecordingServer { key: (instance.service_id, instance.instance_id), log: self.clone() })
    }

    fn client_instance(&mut self, key: ServiceInstanceKey) -> Box<dyn ClientServiceInstance> {
        Box::new(RecordingClient { service_id: key.service_id, log: self.clone() })
    }
}

/// Records offer and subscription-state notifications.
#[derive(Default)]
pub struct RecordingObserver {
    offers: Mutex<Vec<(u16, u16, bool)>>,
    states: Mutex<Vec<(u16, u16, u16, SubscriptionState)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(service, instance, offered)` in arrival order.
    pub fn offers(&self) -> Vec<(u16, u16, bool)> {
        self.offers.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn states(&self) -> Vec<(u16, u16, u16, SubscriptionState)> {
        self.states.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn last_state(&self, event_id: u16) -> Option<SubscriptionState> {
        self.states().into_iter().rev().find(|s| s.2 == event_id).map(|s| s.3)
    }
}

impl ServiceOfferObserver for RecordingObserver {
    fn on_offer_service(&self, service_id: u16, instance_id: u16) {
        if let Ok(mut v) = self.offers.lock() {
            v.push((service_id, instance_id, true));
        }
    }

    fn on_stop_offer_service(&self, service_id: u16, instance_id: u16) {
        if let Ok(mut v) = self.offers.lock() {
            v.push((service_id, instance_id, false));
        }
    }
}

impl EventSubscriptionObserver for RecordingObserver {
    fn on_subscription_state(&self, service_id: u16, instance_id: u16, event_id: u16, state: SubscriptionState) {
        if let Ok(mut v) = self.states.lock() {
            v.push((service_id, instance_id, event_id, state));
        }
    }
}

/// Sink that drops everything; for routes whose traffic a test does not inspect.
pub struct NullSink;

impl PacketSink for NullSink {
    fn on_packet(&self, _instance_id: u16, _header: &SomeIpHeader, _payload: &[u8]) {}
}

/// Builds small single-endpoint configurations.
pub struct ConfigBuilder {
    config: SystemConfig,
}

impl ConfigBuilder {
    pub const SD_PORT: u16 = 30490;

    pub fn new(address: IpAddr) -> Self {
        let endpoint = NetworkEndpointConfig {
            address,
            sd_multicast_address: IpAddr::from([224, 244, 224, 245]),
            sd_port: Self::SD_PORT,
            mtu: 1400,
        };
        ConfigBuilder {
            config: SystemConfig {
                network_endpoints: vec![endpoint],
                services: Vec::new(),
                provided: Vec::new(),
                required: Vec::new(),
                static_sd: StaticSdConfig::default(),
                nack_unmatched_subscriptions: true,
                request_required_on_startup: false,
            },
        }
    }

    /// Service with one eventgroup per `(eventgroup, events)` pair.
    pub fn service(mut self, service_id: u16, eventgroups: &[(u16, &[u16])]) -> Self {
        let mut events: Vec<EventConfig> = Vec::new();
        for (_, ids) in eventgroups {
            for id in *ids {
                if !events.iter().any(|e| e.id == *id) {
                    events.push(EventConfig { id: *id, is_field: false });
                }
            }
        }
        self.config.services.push(ServiceConfig {
            service_id,
            major_version: 1,
            minor_version: 0,
            events,
            eventgroups: eventgroups
                .iter()
                .map(|(id, ids)| EventgroupConfig { id: *id, events: ids.to_vec() })
                .collect(),
        });
        self
    }

    /// Gives `event_id` field semantics.
    pub fn field(mut self, service_id: u16, event_id: u16) -> Self {
        let events = self.config.services.iter_mut().filter(|s| s.service_id == service_id).flat_map(|s| &mut s.events);
        for event in events.filter(|e| e.id == event_id) {
            event.is_field = true;
        }
        self
    }

    pub fn provide(mut self, service_id: u16, instance_id: u16, udp_port: u16, sd: ServerSdConfig) -> Self {
        let address = self.address();
        self.config.provided.push(ProvidedInstanceConfig {
            service_id,
            instance_id,
            major_version: 1,
            minor_version: 0,
            port_mappings: vec![PortMappingConfig {
                address,
                udp_port: Some(udp_port),
                tcp_port: None,
                event_multicast_address: None,
                event_multicast_port: None,
            }],
            service_discovery: sd,
        });
        self
    }

    pub fn require(mut self, service_id: u16, instance_id: u16, udp_port: u16, sd: ClientSdConfig) -> Self {
        let address = self.address();
        self.config.required.push(RequiredInstanceConfig {
            service_id,
            instance_id,
            major_version: 1,
            minor_version: 0,
            port_mapping: PortMappingConfig {
                address,
                udp_port: Some(udp_port),
                tcp_port: None,
                event_multicast_address: None,
                event_multicast_port: None,
            },
            service_discovery: sd,
        });
        self
    }

    /// Adds a multicast threshold for `eventgroup_id` on the last provided instance.
    pub fn multicast(mut self, eventgroup_id: u16, group: IpAddr, port: u16, threshold: usize) -> Self {
        if let Some(provided) = self.config.provided.last_mut() {
            for mapping in &mut provided.port_mappings {
                mapping.event_multicast_address = Some(group);
                mapping.event_multicast_port = Some(port);
            }
            provided
                .service_discovery
                .eventgroups
                .push(ProvidedEventgroupSdConfig { id: eventgroup_id, multicast_threshold: threshold });
        }
        self
    }

    pub fn nack_unmatched(mut self, enabled: bool) -> Self {
        self.config.nack_unmatched_subscriptions = enabled;
        self
    }

    pub fn build(self) -> SystemConfig {
        self.config
    }

    fn address(&self) -> IpAddr {
        self.config.network_endpoints[0].address
    }
}

/// Server timing without random spread: offers at 0, 50 and 150 ms, then every second.
pub fn deterministic_server() -> ServerSdConfig {
    ServerSdConfig {
        initial_delay_min_ms: 0,
        initial_delay_max_ms: 0,
        repetition_base_delay_ms: 50,
        repetition_max: 2,
        cyclic_offer_delay_ms: 1000,
        request_response_delay_min_ms: 10,
        request_response_delay_max_ms: 10,
        ..ServerSdConfig::default()
    }
}

/// Client timing without random spread: finds at 0, 50 and 150 ms.
pub fn deterministic_client() -> ClientSdConfig {
    ClientSdConfig {
        initial_delay_min_ms: 0,
        initial_delay_max_ms: 0,
        repetition_base_delay_ms: 50,
        repetition_max: 2,
        ..ClientSdConfig::default()
    }
}
