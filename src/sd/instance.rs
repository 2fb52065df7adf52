//! Seams toward the connection layer.
//!
//! State machines never touch sockets. Starting a provided instance, accepting an
//! eventgroup subscriber, connecting to a discovered server or joining an event
//! multicast group all go through the traits below; [`ConnectionManager`] hands out
//! one handle per state machine when the engine is built.

use crate::runtime::config::{PortMappingConfig, ProvidedInstanceConfig};
use crate::sd::entries::{ANY_INSTANCE, ANY_MAJOR, ANY_MINOR};
use std::fmt;
use std::net::SocketAddr;

/// (service, instance, major, minor). Wildcards stand for "any" in discovery matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceInstanceKey {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub minor_version: u32,
}

impl ServiceInstanceKey {
    pub fn new(service_id: u16, instance_id: u16, major_version: u8, minor_version: u32) -> Self {
        ServiceInstanceKey { service_id, instance_id, major_version, minor_version }
    }

    /// Server side matching of a received entry: instance and major may be wildcards.
    pub fn matches_request(&self, service_id: u16, instance_id: u16, major_version: u8) -> bool {
        self.service_id == service_id
            && (instance_id == ANY_INSTANCE || instance_id == self.instance_id)
            && (major_version == ANY_MAJOR || major_version == self.major_version)
    }

    /// Client side matching of an offer: our own wildcards accept any version.
    pub fn matches_offer(&self, service_id: u16, instance_id: u16, major_version: u8, minor_version: u32) -> bool {
        self.service_id == service_id
            && self.instance_id == instance_id
            && (self.major_version == ANY_MAJOR || self.major_version == major_version)
            && (self.minor_version == ANY_MINOR || self.minor_version == minor_version)
    }
}

impl fmt::Display for ServiceInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(0x{:04x}, 0x{:04x}, v{}.{})",
            self.service_id, self.instance_id, self.major_version, self.minor_version
        )
    }
}

/// Client endpoints carried by a SubscribeEventgroup entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventgroupSubscriber {
    pub tcp: Option<SocketAddr>,
    pub udp: Option<SocketAddr>,
}

/// Provided service instance as seen by its server state machine.
pub trait ServerServiceInstance: Send {
    fn start(&mut self);
    fn stop(&mut self);
    fn subscribe_eventgroup(&mut self, eventgroup_id: u16, subscriber: &EventgroupSubscriber);
    fn unsubscribe_eventgroup(&mut self, eventgroup_id: u16, subscriber: &EventgroupSubscriber);
    /// Whether a TCP client connected from `remote` to this instance.
    fn has_tcp_connection(&self, remote: SocketAddr) -> bool;
}

/// Required service instance as seen by its client state machine.
pub trait ClientServiceInstance: Send {
    fn connect(&mut self, tcp: Option<SocketAddr>, udp: Option<SocketAddr>);
    fn disconnect(&mut self);
    fn start_listen_multicast(&mut self, group: SocketAddr);
    fn stop_listen_multicast(&mut self, group: SocketAddr);
}

pub trait ConnectionManager: Send {
    fn server_instance(
        &mut self,
        instance: &ProvidedInstanceConfig,
        mapping: &PortMappingConfig,
    ) -> Box<dyn ServerServiceInstance>;

    fn client_instance(&mut self, key: ServiceInstanceKey) -> Box<dyn ClientServiceInstance>;
}
