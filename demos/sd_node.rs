//! SD node demo
//!
//! Offers every provided instance and requests every required instance of a
//! JSON configuration, then runs discovery until Ctrl+C.
//!
//! Usage: `sd-node [config.json]` (default: demos/config.json)

use fusion_sd::codec::SomeIpHeader;
use fusion_sd::logging::{self, Sid};
use fusion_sd::runtime::SdRuntime;
use fusion_sd::sd::{PacketSink, SinkRef, SubscriptionState};
use fusion_sd::sd::discovery::{EventSubscriptionObserver, ServiceOfferObserver};
use log::{error, info};
use std::sync::Arc;

struct LogSink;

impl PacketSink for LogSink {
    fn on_packet(&self, instance_id: u16, header: &SomeIpHeader, payload: &[u8]) {
        info!(
            "{} method/event 0x{:04x}: {} bytes",
            Sid(header.service_id, instance_id),
            header.method_id,
            payload.len()
        );
    }
}

struct LogObserver;

impl ServiceOfferObserver for LogObserver {
    fn on_offer_service(&self, service_id: u16, instance_id: u16) {
        info!("{} is now offered", Sid(service_id, instance_id));
    }

    fn on_stop_offer_service(&self, service_id: u16, instance_id: u16) {
        info!("{} is no longer offered", Sid(service_id, instance_id));
    }
}

impl EventSubscriptionObserver for LogObserver {
    fn on_subscription_state(&self, service_id: u16, instance_id: u16, event_id: u16, state: SubscriptionState) {
        info!("{} event 0x{:04x}: {:?}", Sid(service_id, instance_id), event_id, state);
    }
}

fn main() {
    logging::init();
    let path = std::env::args().nth(1).unwrap_or_else(|| "demos/config.json".to_string());
    if let Err(e) = run(&path) {
        error!("sd-node failed: {}", e);
        std::process::exit(1);
    }
}

fn run(path: &str) -> fusion_sd::Result<()> {
    info!("=== SD Node ({}) ===", path);
    let rt = Arc::new(SdRuntime::load(path)?);

    let r = rt.clone();
    ctrlc::set_handler(move || {
        info!("Shutting down...");
        r.stop();
    })
    .ok();

    let observer = Arc::new(LogObserver);
    let sink: SinkRef = Arc::new(LogSink);
    rt.with_sd(|sd| {
        sd.register_offer_observer(observer.clone());
        sd.register_event_observer(observer.clone());
    });
    rt.start();

    let config = rt.with_sd(|sd| sd.config().clone());
    for provided in &config.provided {
        rt.with_sd(|sd| sd.offer_service(provided.service_id, provided.instance_id, sink.clone()))?;
    }
    for required in &config.required {
        rt.with_sd(|sd| -> fusion_sd::Result<()> {
            sd.request_service(required.service_id, required.instance_id)?;
            for event_id in config.events(required.service_id) {
                sd.subscribe_event(required.service_id, required.instance_id, event_id, sink.clone())?;
            }
            Ok(())
        })?;
    }

    let reactor = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    reactor.block_on(rt.run())
}
