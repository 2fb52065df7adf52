//! # Service Discovery
//!
//! SOME/IP-SD message model and the state machines that offer and find service instances.
//!
//! ## Key Types
//!
//! - [`ServiceDiscovery`] - Engine owning every state machine; performs no I/O
//! - [`ServerStateMachine`] - Offers one provided instance on one port mapping
//! - [`ClientStateMachine`] - Finds one required instance and manages its eventgroup subscriptions
//! - [`SdPacket`] / [`SdEntry`] / [`SdOption`] - Wire model of an SD message

pub mod client;
pub mod context;
pub mod discovery;
pub mod endpoint;
pub mod entries;
pub mod instance;
pub mod options;
pub mod packet;
pub mod reboot;
pub mod routing;
pub mod server;
pub mod testing;
pub mod timer;

pub use client::{ClientStateMachine, FindPhase, SubscriptionState};
pub use context::{Destination, EventgroupChange, EventgroupNotification, OutboundMessage, SdContext};
pub use discovery::{Datagram, EventSubscriptionObserver, ServiceDiscovery, ServiceOfferObserver};
pub use entries::*;
pub use instance::{
    ClientServiceInstance, ConnectionManager, EventgroupSubscriber, ServerServiceInstance, ServiceInstanceKey,
};
pub use options::*;
pub use packet::*;
pub use routing::{PacketRouter, PacketSink, RoutingTable, SinkRef};
pub use server::{ServerPhase, ServerStateMachine};
pub use timer::{Clock, ManualClock, SystemClock};
