use crate::codec::SomeIpHeader;
use crate::runtime::config::SystemConfig;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Receiver of payload messages once a route is installed.
pub trait PacketSink: Send + Sync {
    fn on_packet(&self, instance_id: u16, header: &SomeIpHeader, payload: &[u8]);
}

pub type SinkRef = Arc<dyn PacketSink>;

pub trait PacketRouter: Send {
    fn add_request_route(&mut self, service_id: u16, instance_id: u16, sink: SinkRef);
    fn delete_request_route(&mut self, service_id: u16, instance_id: u16);
    fn add_event_route(&mut self, service_id: u16, instance_id: u16, event_id: u16, sink: SinkRef);
    fn delete_event_route(&mut self, service_id: u16, instance_id: u16, event_id: u16, sink: &SinkRef);
    /// Pushes the last known value of a field to a new subscriber.
    fn send_initial_event(&mut self, service_id: u16, instance_id: u16, event_id: u16, sink: &SinkRef);
}

#[derive(Default)]
struct Routes {
    requests: HashMap<(u16, u16), SinkRef>,
    events: HashMap<(u16, u16, u16), Vec<SinkRef>>,
    // (service, event) pairs with field semantics
    field_events: HashSet<(u16, u16)>,
    // Last notification per field, kept for initial events
    fields: HashMap<(u16, u16, u16), (SomeIpHeader, Vec<u8>)>,
}

/// Shared routing table. Clones see the same routes.
#[derive(Clone, Default)]
pub struct RoutingTable {
    routes: Arc<Mutex<Routes>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routing table that caches the last value of every field event in `config`.
    pub fn for_config(config: &SystemConfig) -> Self {
        let table = Self::new();
        for service in &config.services {
            for event in service.events.iter().filter(|e| e.is_field) {
                table.mark_field(service.service_id, event.id);
            }
        }
        table
    }

    /// Treats `event_id` as a field: its last notification is replayed to new subscribers.
    pub fn mark_field(&self, service_id: u16, event_id: u16) {
        self.lock().field_events.insert((service_id, event_id));
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        match self.routes.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn has_request_route(&self, service_id: u16, instance_id: u16) -> bool {
        self.lock().requests.contains_key(&(service_id, instance_id))
    }

    pub fn event_route_count(&self, service_id: u16, instance_id: u16, event_id: u16) -> usize {
        self.lock()
            .events
            .get(&(service_id, instance_id, event_id))
            .map_or(0, Vec::len)
    }

    /// Delivers a payload message received for `instance_id`. Requests go to the
    /// offering sink, notifications to every event subscriber. Returns false when
    /// nobody is routed.
    pub fn route(&self, instance_id: u16, header: &SomeIpHeader, payload: &[u8]) -> bool {
        let sinks: Vec<SinkRef> = {
            let mut routes = self.lock();
            match header.message_type {
                0x00 | 0x01 => routes
                    .requests
                    .get(&(header.service_id, instance_id))
                    .cloned()
                    .into_iter()
                    .collect(),
                SomeIpHeader::MESSAGE_TYPE_NOTIFICATION => {
                    let key = (header.service_id, instance_id, header.method_id);
                    if routes.field_events.contains(&(header.service_id, header.method_id)) {
                        routes.fields.insert(key, (header.clone(), payload.to_vec()));
                    }
                    routes.events.get(&key).cloned().unwrap_or_default()
                }
                _ => Vec::new(),
            }
        };
        for sink in &sinks {
            sink.on_packet(instance_id, header, payload);
        }
        !sinks.is_empty()
    }
}

impl PacketRouter for RoutingTable {
    fn add_request_route(&mut self, service_id: u16, instance_id: u16, sink: SinkRef) {
        self.lock().requests.insert((service_id, instance_id), sink);
    }

    fn delete_request_route(&mut self, service_id: u16, instance_id: u16) {
        self.lock().requests.remove(&(service_id, instance_id));
    }

    fn add_event_route(&mut self, service_id: u16, instance_id: u16, event_id: u16, sink: SinkRef) {
        self.lock()
            .events
            .entry((service_id, instance_id, event_id))
            .or_default()
            .push(sink);
    }

    fn delete_event_route(&mut self, service_id: u16, instance_id: u16, event_id: u16, sink: &SinkRef) {
        let mut routes = self.lock();
        let key = (service_id, instance_id, event_id);
        if let Some(sinks) = routes.events.get_mut(&key) {
            if let Some(pos) = sinks.iter().position(|s| Arc::ptr_eq(s, sink)) {
                sinks.remove(pos);
            }
            if sinks.is_empty() {
                routes.events.remove(&key);
            }
        }
    }

    fn send_initial_event(&mut self, service_id: u16, instance_id: u16, event_id: u16, sink: &SinkRef) {
        let cached = self.lock().fields.get(&(service_id, instance_id, event_id)).cloned();
        if let Some((header, payload)) = cached {
            sink.on_packet(instance_id, &header, &payload);
        }
    }
}
