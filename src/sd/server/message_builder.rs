use crate::runtime::config::PortMappingConfig;
use crate::sd::entries::{EntryType, SdEntry};
use crate::sd::instance::ServiceInstanceKey;
use crate::sd::options::{EndpointOption, SdOption, TransportProtocol};

/// Builds the entries a provided instance sends for one port mapping.
#[derive(Debug, Clone)]
pub struct ServerMessageBuilder {
    key: ServiceInstanceKey,
    ttl: u32,
    endpoints: Vec<SdOption>,
}

impl ServerMessageBuilder {
    pub fn new(key: ServiceInstanceKey, ttl: u32, mapping: &PortMappingConfig) -> Self {
        let mut endpoints = Vec::new();
        if let Some(port) = mapping.tcp_port {
            endpoints.push(EndpointOption::unicast(mapping.address, port, TransportProtocol::Tcp).into());
        }
        if let Some(port) = mapping.udp_port {
            endpoints.push(EndpointOption::unicast(mapping.address, port, TransportProtocol::Udp).into());
        }
        ServerMessageBuilder { key, ttl, endpoints }
    }

    pub fn offer(&self) -> (SdEntry, &[SdOption]) {
        (self.offer_entry(self.ttl), &self.endpoints)
    }

    pub fn stop_offer(&self) -> (SdEntry, &[SdOption]) {
        (self.offer_entry(0), &self.endpoints)
    }

    fn offer_entry(&self, ttl: u32) -> SdEntry {
        SdEntry::service(
            EntryType::OfferService,
            self.key.service_id,
            self.key.instance_id,
            self.key.major_version,
            self.key.minor_version,
            ttl,
        )
    }

    pub fn ack(&self, eventgroup_id: u16, ttl: u32, counter: u8, multicast: Option<EndpointOption>) -> (SdEntry, Vec<SdOption>) {
        let entry = SdEntry::eventgroup(
            EntryType::SubscribeEventgroupAck,
            self.key.service_id,
            self.key.instance_id,
            self.key.major_version,
            eventgroup_id,
            ttl,
        )
        .with_counter(counter);
        (entry, multicast.map(SdOption::from).into_iter().collect())
    }

    pub fn nack(&self, eventgroup_id: u16, counter: u8) -> (SdEntry, Vec<SdOption>) {
        nack_entry(self.key, eventgroup_id, counter)
    }
}

/// Negative acknowledgement for `key`: an Ack entry with ttl 0 and no options.
pub fn nack_entry(key: ServiceInstanceKey, eventgroup_id: u16, counter: u8) -> (SdEntry, Vec<SdOption>) {
    let entry = SdEntry::eventgroup(
        EntryType::SubscribeEventgroupAck,
        key.service_id,
        key.instance_id,
        key.major_version,
        eventgroup_id,
        0,
    )
    .with_counter(counter);
    (entry, Vec::new())
}
