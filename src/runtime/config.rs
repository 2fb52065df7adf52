use crate::error::{Result, SdError};
use crate::sd::entries::{ANY_MAJOR, ANY_MINOR, TTL_INFINITE};
use crate::sd::timer::MAX_DELAY;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Upper bound for `repetition_max`; the delay doubles on every repetition.
pub const MAX_REPETITIONS: u32 = 32;
/// Largest SD payload a UDP datagram carries.
pub const MAX_MTU: usize = 65507;
/// Room for the SOME/IP header, the SD header and one entry with an option.
pub const MIN_MTU: usize = 64;

/// Local network endpoint SD runs on.
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkEndpointConfig {
    pub address: IpAddr,
    /// SD multicast group (default: 224.244.224.245)
    #[serde(default = "default_sd_multicast_address")]
    pub sd_multicast_address: IpAddr,
    /// SD UDP port (default: 30490)
    #[serde(default = "default_sd_port")]
    pub sd_port: u16,
    /// Upper bound for a coalesced SD datagram (default: 1400)
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventConfig {
    pub id: u16,
    /// Fields deliver their current value on subscription
    #[serde(default)]
    pub is_field: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventgroupConfig {
    pub id: u16,
    pub events: Vec<u16>,
}

/// Service interface: events and how they are grouped.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub service_id: u16,
    pub major_version: u8,
    #[serde(default)]
    pub minor_version: u32,
    #[serde(default)]
    pub events: Vec<EventConfig>,
    #[serde(default)]
    pub eventgroups: Vec<EventgroupConfig>,
}

/// Binding of a service instance to a local network endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct PortMappingConfig {
    pub address: IpAddr,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub event_multicast_address: Option<IpAddr>,
    pub event_multicast_port: Option<u16>,
}

impl PortMappingConfig {
    pub fn event_multicast(&self) -> Option<(IpAddr, u16)> {
        match (self.event_multicast_address, self.event_multicast_port) {
            (Some(addr), Some(port)) => Some((addr, port)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidedEventgroupSdConfig {
    pub id: u16,
    /// Subscriber count from which acks hand out the event multicast endpoint; 0 keeps unicast
    #[serde(default)]
    pub multicast_threshold: usize,
}

/// Server side SD timing. All timing values are in milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSdConfig {
    /// TTL of OfferService entries (seconds, default: 0xFFFFFF)
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_initial_delay_min")]
    pub initial_delay_min_ms: u64,
    #[serde(default = "default_initial_delay_max")]
    pub initial_delay_max_ms: u64,
    #[serde(default = "default_repetition_base_delay")]
    pub repetition_base_delay_ms: u64,
    /// Offers sent in the Repetition phase (default: 3)
    #[serde(default = "default_repetition_max")]
    pub repetition_max: u32,
    /// Period of Main phase offers; 0 disables cyclic offers (default: 1000)
    #[serde(default = "default_cyclic_delay")]
    pub cyclic_offer_delay_ms: u64,
    #[serde(default = "default_request_response_delay_min")]
    pub request_response_delay_min_ms: u64,
    #[serde(default = "default_request_response_delay_max")]
    pub request_response_delay_max_ms: u64,
    /// [PRS_SOMEIPSD_00423] answer finds with multicast offers when one went out recently
    #[serde(default)]
    pub message_optimization: bool,
    #[serde(default)]
    pub eventgroups: Vec<ProvidedEventgroupSdConfig>,
}

impl Default for ServerSdConfig {
    fn default() -> Self {
        ServerSdConfig {
            ttl: default_ttl(),
            initial_delay_min_ms: default_initial_delay_min(),
            initial_delay_max_ms: default_initial_delay_max(),
            repetition_base_delay_ms: default_repetition_base_delay(),
            repetition_max: default_repetition_max(),
            cyclic_offer_delay_ms: default_cyclic_delay(),
            request_response_delay_min_ms: default_request_response_delay_min(),
            request_response_delay_max_ms: default_request_response_delay_max(),
            message_optimization: false,
            eventgroups: Vec::new(),
        }
    }
}

impl ServerSdConfig {
    pub fn initial_delay(&self) -> (Duration, Duration) {
        (ms(self.initial_delay_min_ms), ms(self.initial_delay_max_ms))
    }

    pub fn repetition_base_delay(&self) -> Duration {
        ms(self.repetition_base_delay_ms)
    }

    pub fn cyclic_offer_delay(&self) -> Duration {
        ms(self.cyclic_offer_delay_ms)
    }

    pub fn request_response_delay(&self) -> (Duration, Duration) {
        (ms(self.request_response_delay_min_ms), ms(self.request_response_delay_max_ms))
    }

    pub fn multicast_threshold(&self, eventgroup_id: u16) -> usize {
        self.eventgroups
            .iter()
            .find(|eg| eg.id == eventgroup_id)
            .map(|eg| eg.multicast_threshold)
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RequiredEventgroupSdConfig {
    pub id: u16,
    /// TTL of SubscribeEventgroup entries (seconds, default: 3)
    #[serde(default = "default_subscribe_ttl")]
    pub ttl: u32,
}

/// Client side SD timing. All timing values are in milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSdConfig {
    /// TTL of FindService entries (seconds, default: 0xFFFFFF)
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_initial_delay_min")]
    pub initial_delay_min_ms: u64,
    #[serde(default = "default_initial_delay_max")]
    pub initial_delay_max_ms: u64,
    #[serde(default = "default_repetition_base_delay")]
    pub repetition_base_delay_ms: u64,
    #[serde(default = "default_repetition_max")]
    pub repetition_max: u32,
    /// Wait for a SubscribeEventgroupAck before resending (default: 2000)
    #[serde(default = "default_subscribe_ack_timeout")]
    pub subscribe_ack_timeout_ms: u64,
    #[serde(default)]
    pub eventgroups: Vec<RequiredEventgroupSdConfig>,
}

impl Default for ClientSdConfig {
    fn default() -> Self {
        ClientSdConfig {
            ttl: default_ttl(),
            initial_delay_min_ms: default_initial_delay_min(),
            initial_delay_max_ms: default_initial_delay_max(),
            repetition_base_delay_ms: default_repetition_base_delay(),
            repetition_max: default_repetition_max(),
            subscribe_ack_timeout_ms: default_subscribe_ack_timeout(),
            eventgroups: Vec::new(),
        }
    }
}

impl ClientSdConfig {
    pub fn initial_delay(&self) -> (Duration, Duration) {
        (ms(self.initial_delay_min_ms), ms(self.initial_delay_max_ms))
    }

    pub fn repetition_base_delay(&self) -> Duration {
        ms(self.repetition_base_delay_ms)
    }

    pub fn subscribe_ack_timeout(&self) -> Duration {
        ms(self.subscribe_ack_timeout_ms)
    }

    pub fn subscribe_ttl(&self, eventgroup_id: u16) -> u32 {
        self.eventgroups
            .iter()
            .find(|eg| eg.id == eventgroup_id)
            .map(|eg| eg.ttl)
            .unwrap_or_else(default_subscribe_ttl)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidedInstanceConfig {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    #[serde(default)]
    pub minor_version: u32,
    pub port_mappings: Vec<PortMappingConfig>,
    #[serde(default)]
    pub service_discovery: ServerSdConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RequiredInstanceConfig {
    pub service_id: u16,
    pub instance_id: u16,
    /// 0xFF accepts any major version
    #[serde(default = "default_any_major")]
    pub major_version: u8,
    /// 0xFFFFFFFF accepts any minor version
    #[serde(default = "default_any_minor")]
    pub minor_version: u32,
    pub port_mapping: PortMappingConfig,
    #[serde(default)]
    pub service_discovery: ClientSdConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticInstanceConfig {
    pub service_id: u16,
    pub instance_id: u16,
    #[serde(default = "default_any_major")]
    pub major_version: u8,
    #[serde(default = "default_any_minor")]
    pub minor_version: u32,
}

/// Remote endpoint whose services are used without discovery.
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteEndpointConfig {
    pub address: IpAddr,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub required_service_instances: Vec<StaticInstanceConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StaticSdConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub endpoints: Vec<RemoteEndpointConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SystemConfig {
    pub network_endpoints: Vec<NetworkEndpointConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub provided: Vec<ProvidedInstanceConfig>,
    #[serde(default)]
    pub required: Vec<RequiredInstanceConfig>,
    #[serde(default)]
    pub static_sd: StaticSdConfig,
    /// Answer unicast subscriptions nobody serves with a Nack (default: true)
    #[serde(default = "default_true")]
    pub nack_unmatched_subscriptions: bool,
    /// Request every required instance once the engine starts (default: false)
    #[serde(default)]
    pub request_required_on_startup: bool,
}

impl SystemConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SdError::ConfigRead { path: path.to_path_buf(), source })?;
        let config: SystemConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: SystemConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network_endpoints.is_empty() {
            return Err(SdError::Config("no network endpoint configured".into()));
        }
        for ne in &self.network_endpoints {
            if !(MIN_MTU..=MAX_MTU).contains(&ne.mtu) {
                return Err(SdError::Config(format!(
                    "mtu {} of {} is outside {}..={}",
                    ne.mtu, ne.address, MIN_MTU, MAX_MTU
                )));
            }
        }
        let known_address = |addr: &IpAddr| self.network_endpoints.iter().any(|ne| ne.address == *addr);

        for p in &self.provided {
            let sd = &p.service_discovery;
            if p.port_mappings.is_empty() {
                return Err(SdError::Config(format!("provided service 0x{:04x} has no port mapping", p.service_id)));
            }
            for pm in &p.port_mappings {
                if !known_address(&pm.address) {
                    return Err(SdError::Config(format!("port mapping address {} is not a network endpoint", pm.address)));
                }
                if pm.udp_port.is_none() && pm.tcp_port.is_none() {
                    return Err(SdError::Config(format!("provided service 0x{:04x} maps no port", p.service_id)));
                }
            }
            check_range("initial delay", sd.initial_delay_min_ms, sd.initial_delay_max_ms)?;
            check_range("request response delay", sd.request_response_delay_min_ms, sd.request_response_delay_max_ms)?;
            check_repetitions(sd.repetition_max)?;
            for (what, delay) in [
                ("initial delay", sd.initial_delay_max_ms),
                ("repetition base delay", sd.repetition_base_delay_ms),
                ("cyclic offer delay", sd.cyclic_offer_delay_ms),
                ("request response delay", sd.request_response_delay_max_ms),
            ] {
                check_delay(what, delay)?;
            }
            for eg in &sd.eventgroups {
                self.check_eventgroup(p.service_id, eg.id)?;
            }
        }

        for r in &self.required {
            if !known_address(&r.port_mapping.address) {
                return Err(SdError::Config(format!("port mapping address {} is not a network endpoint", r.port_mapping.address)));
            }
            let sd = &r.service_discovery;
            check_range("initial delay", sd.initial_delay_min_ms, sd.initial_delay_max_ms)?;
            check_repetitions(sd.repetition_max)?;
            for (what, delay) in [
                ("initial delay", sd.initial_delay_max_ms),
                ("repetition base delay", sd.repetition_base_delay_ms),
                ("subscribe ack timeout", sd.subscribe_ack_timeout_ms),
            ] {
                check_delay(what, delay)?;
            }
            if r.service_discovery.subscribe_ack_timeout_ms == 0 {
                return Err(SdError::Config(format!("required service 0x{:04x} has a zero subscribe ack timeout", r.service_id)));
            }
            for eg in &r.service_discovery.eventgroups {
                self.check_eventgroup(r.service_id, eg.id)?;
            }
        }
        Ok(())
    }

    fn check_eventgroup(&self, service_id: u16, eventgroup_id: u16) -> Result<()> {
        let declared = self
            .service(service_id)
            .is_some_and(|s| s.eventgroups.iter().any(|eg| eg.id == eventgroup_id));
        if declared {
            Ok(())
        } else {
            Err(SdError::Config(format!(
                "eventgroup 0x{:04x} is not declared for service 0x{:04x}",
                eventgroup_id, service_id
            )))
        }
    }

    pub fn service(&self, service_id: u16) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.service_id == service_id)
    }

    /// Events of an eventgroup, empty when unknown.
    pub fn eventgroup_events(&self, service_id: u16, eventgroup_id: u16) -> &[u16] {
        self.service(service_id)
            .and_then(|s| s.eventgroups.iter().find(|eg| eg.id == eventgroup_id))
            .map(|eg| eg.events.as_slice())
            .unwrap_or(&[])
    }

    /// First eventgroup in configuration order containing `event_id`.
    pub fn eventgroup_of_event(&self, service_id: u16, event_id: u16) -> Option<u16> {
        self.service(service_id)?
            .eventgroups
            .iter()
            .find(|eg| eg.events.contains(&event_id))
            .map(|eg| eg.id)
    }

    pub fn events(&self, service_id: u16) -> Vec<u16> {
        self.service(service_id)
            .map(|s| s.events.iter().map(|e| e.id).collect())
            .unwrap_or_default()
    }

    pub fn is_field(&self, service_id: u16, event_id: u16) -> bool {
        self.service(service_id)
            .is_some_and(|s| s.events.iter().any(|e| e.id == event_id && e.is_field))
    }
}

fn check_range(what: &str, min: u64, max: u64) -> Result<()> {
    if min > max {
        return Err(SdError::Config(format!("{} min {} ms exceeds max {} ms", what, min, max)));
    }
    Ok(())
}

fn check_repetitions(repetition_max: u32) -> Result<()> {
    if repetition_max > MAX_REPETITIONS {
        return Err(SdError::Config(format!(
            "repetition_max {} exceeds {}",
            repetition_max, MAX_REPETITIONS
        )));
    }
    Ok(())
}

fn check_delay(what: &str, delay_ms: u64) -> Result<()> {
    if u128::from(delay_ms) > MAX_DELAY.as_millis() {
        return Err(SdError::Config(format!("{} of {} ms is too long", what, delay_ms)));
    }
    Ok(())
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn default_sd_multicast_address() -> IpAddr { IpAddr::V4(Ipv4Addr::new(224, 244, 224, 245)) }
fn default_sd_port() -> u16 { 30490 }
fn default_mtu() -> usize { 1400 }
fn default_ttl() -> u32 { TTL_INFINITE }
fn default_subscribe_ttl() -> u32 { 3 }
fn default_initial_delay_min() -> u64 { 10 }
fn default_initial_delay_max() -> u64 { 100 }
fn default_repetition_base_delay() -> u64 { 100 }
fn default_repetition_max() -> u32 { 3 }
fn default_cyclic_delay() -> u64 { 1000 }
fn default_request_response_delay_min() -> u64 { 10 }
fn default_request_response_delay_max() -> u64 { 100 }
fn default_subscribe_ack_timeout() -> u64 { 2000 }
fn default_any_major() -> u8 { ANY_MAJOR }
fn default_any_minor() -> u32 { ANY_MINOR }
fn default_true() -> bool { true }

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "network_endpoints": [ { "address": "192.168.0.10" } ],
        "services": [
            { "service_id": 4660, "major_version": 1,
              "events": [ { "id": 32769, "is_field": true }, { "id": 32770 } ],
              "eventgroups": [ { "id": 1, "events": [32769, 32770] }, { "id": 2, "events": [32770] } ] }
        ],
        "provided": [
            { "service_id": 4660, "instance_id": 1, "major_version": 1,
              "port_mappings": [ { "address": "192.168.0.10", "udp_port": 30501 } ] }
        ],
        "required": [
            { "service_id": 4660, "instance_id": 2,
              "port_mapping": { "address": "192.168.0.10", "udp_port": 30502 },
              "service_discovery": { "eventgroups": [ { "id": 1, "ttl": 5 } ] } }
        ]
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = SystemConfig::from_json(MINIMAL).unwrap();
        let ne = &config.network_endpoints[0];
        assert_eq!(ne.sd_port, 30490);
        assert_eq!(ne.sd_multicast_address, "224.244.224.245".parse::<IpAddr>().unwrap());

        let sd = &config.provided[0].service_discovery;
        assert_eq!(sd.ttl, TTL_INFINITE);
        assert_eq!(sd.repetition_max, 3);
        assert_eq!(sd.cyclic_offer_delay(), Duration::from_millis(1000));
        assert!(!sd.message_optimization);

        let req = &config.required[0];
        assert_eq!(req.major_version, ANY_MAJOR);
        assert_eq!(req.minor_version, ANY_MINOR);
        assert_eq!(req.service_discovery.subscribe_ttl(1), 5);
        assert_eq!(req.service_discovery.subscribe_ttl(9), 3);
        assert!(config.nack_unmatched_subscriptions);
    }

    #[test]
    fn test_eventgroup_lookup_is_first_match() {
        let config = SystemConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.eventgroup_of_event(4660, 32770), Some(1));
        assert_eq!(config.eventgroup_of_event(4660, 1), None);
        assert_eq!(config.eventgroup_events(4660, 2), &[32770]);
        assert!(config.is_field(4660, 32769));
        assert!(!config.is_field(4660, 32770));
    }

    #[test]
    fn test_unknown_port_mapping_address_rejected() {
        let json = MINIMAL.replace("\"address\": \"192.168.0.10\", \"udp_port\": 30501", "\"address\": \"10.0.0.1\", \"udp_port\": 30501");
        assert!(matches!(SystemConfig::from_json(&json), Err(SdError::Config(_))));
    }

    #[test]
    fn test_inverted_delay_range_rejected() {
        let json = MINIMAL.replace(
            "\"port_mappings\": [ { \"address\": \"192.168.0.10\", \"udp_port\": 30501 } ]",
            "\"port_mappings\": [ { \"address\": \"192.168.0.10\", \"udp_port\": 30501 } ], \
             \"service_discovery\": { \"initial_delay_min_ms\": 50, \"initial_delay_max_ms\": 10 }",
        );
        assert!(matches!(SystemConfig::from_json(&json), Err(SdError::Config(_))));
    }

    #[test]
    fn test_undeclared_eventgroup_rejected() {
        let json = MINIMAL.replace("{ \"id\": 1, \"ttl\": 5 }", "{ \"id\": 7, \"ttl\": 5 }");
        assert!(matches!(SystemConfig::from_json(&json), Err(SdError::Config(_))));
    }

    #[test]
    fn test_unbounded_repetitions_rejected() {
        let json = MINIMAL.replace(
            "\"port_mappings\": [ { \"address\": \"192.168.0.10\", \"udp_port\": 30501 } ]",
            "\"port_mappings\": [ { \"address\": \"192.168.0.10\", \"udp_port\": 30501 } ], \
             \"service_discovery\": { \"repetition_max\": 100 }",
        );
        assert!(matches!(SystemConfig::from_json(&json), Err(SdError::Config(_))));
    }

    #[test]
    fn test_delay_beyond_timer_range_rejected() {
        let json = MINIMAL.replace(
            "\"service_discovery\": { \"eventgroups\"",
            "\"service_discovery\": { \"subscribe_ack_timeout_ms\": 18446744073709551615, \"eventgroups\"",
        );
        assert!(matches!(SystemConfig::from_json(&json), Err(SdError::Config(_))));
    }

    #[test]
    fn test_mtu_out_of_range_rejected() {
        let json = MINIMAL.replace(
            "{ \"address\": \"192.168.0.10\" }",
            "{ \"address\": \"192.168.0.10\", \"mtu\": 100000 }",
        );
        assert!(matches!(SystemConfig::from_json(&json), Err(SdError::Config(_))));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(SystemConfig::from_json("{"), Err(SdError::ConfigParse(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            SystemConfig::load("/nonexistent/sd.json"),
            Err(SdError::ConfigRead { .. })
        ));
    }
}
