use crate::runtime::config::PortMappingConfig;
use crate::sd::entries::{EntryType, SdEntry};
use crate::sd::instance::ServiceInstanceKey;
use crate::sd::options::{EndpointOption, SdOption, TransportProtocol};

/// Builds the entries a required instance sends.
#[derive(Debug, Clone)]
pub struct ClientMessageBuilder {
    key: ServiceInstanceKey,
    find_ttl: u32,
    endpoints: Vec<SdOption>,
}

impl ClientMessageBuilder {
    pub fn new(key: ServiceInstanceKey, find_ttl: u32, mapping: &PortMappingConfig) -> Self {
        let mut endpoints = Vec::new();
        if let Some(port) = mapping.tcp_port {
            endpoints.push(EndpointOption::unicast(mapping.address, port, TransportProtocol::Tcp).into());
        }
        if let Some(port) = mapping.udp_port {
            endpoints.push(EndpointOption::unicast(mapping.address, port, TransportProtocol::Udp).into());
        }
        ClientMessageBuilder { key, find_ttl, endpoints }
    }

    /// FindService for the configured key, wildcards included.
    pub fn find(&self) -> SdEntry {
        SdEntry::service(
            EntryType::FindService,
            self.key.service_id,
            self.key.instance_id,
            self.key.major_version,
            self.key.minor_version,
            self.find_ttl,
        )
    }

    /// SubscribeEventgroup carrying our endpoints; `major_version` is the offered one.
    pub fn subscribe(&self, major_version: u8, eventgroup_id: u16, ttl: u32) -> (SdEntry, &[SdOption]) {
        let entry = SdEntry::eventgroup(
            EntryType::SubscribeEventgroup,
            self.key.service_id,
            self.key.instance_id,
            major_version,
            eventgroup_id,
            ttl,
        )
        .with_initial_data_requested(true);
        (entry, &self.endpoints)
    }

    pub fn stop_subscribe(&self, major_version: u8, eventgroup_id: u16) -> (SdEntry, &[SdOption]) {
        let (mut entry, options) = self.subscribe(major_version, eventgroup_id, 0);
        entry.initial_data_requested = false;
        (entry, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd::entries::{ANY_MAJOR, ANY_MINOR, EntryKind};

    #[test]
    fn test_find_keeps_wildcards() {
        let mapping = PortMappingConfig {
            address: "192.168.0.20".parse().unwrap(),
            udp_port: Some(40000),
            tcp_port: None,
            event_multicast_address: None,
            event_multicast_port: None,
        };
        let builder = ClientMessageBuilder::new(ServiceInstanceKey::new(0x1234, 1, ANY_MAJOR, ANY_MINOR), 3, &mapping);
        let find = builder.find();
        assert_eq!(find.kind(), EntryKind::FindService);
        assert_eq!((find.major_version, find.minor_version), (ANY_MAJOR, ANY_MINOR));

        let (subscribe, options) = builder.subscribe(1, 0x10, 3);
        assert_eq!(subscribe.kind(), EntryKind::SubscribeEventgroup);
        assert!(subscribe.initial_data_requested);
        assert_eq!(subscribe.major_version, 1);
        assert_eq!(options.len(), 1);

        let (stop, _) = builder.stop_subscribe(1, 0x10);
        assert_eq!(stop.kind(), EntryKind::StopSubscribeEventgroup);
    }
}
