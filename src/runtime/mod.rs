//! # SD Runtime
//!
//! Binds the SD sockets of every configured network endpoint and drives a
//! [`ServiceDiscovery`] engine with them.
//!
//! ## Lifecycle
//!
//! 1. Load configuration: `SdRuntime::load("config.json")`
//! 2. Start discovery: `runtime.start()`
//! 3. Drive it: `runtime.run().await`, or `runtime.process_next_packet()` in a polling loop
//! 4. Stop gracefully: `runtime.stop()`
//!
//! ## Example
//!
//! ```ignore
//! let runtime = SdRuntime::load("config.json")?;
//! runtime.start();
//! runtime.with_sd(|sd| sd.offer_service(0x1234, 1, sink))?;
//! runtime.run().await;
//! ```

pub mod config;

use crate::error::Result;
use crate::runtime::config::{PortMappingConfig, ProvidedInstanceConfig, SystemConfig};
use crate::sd::discovery::{Datagram, ServiceDiscovery};
use crate::sd::instance::{
    ClientServiceInstance, ConnectionManager, EventgroupSubscriber, ServerServiceInstance, ServiceInstanceKey,
};
use crate::sd::routing::{PacketRouter, RoutingTable};
use crate::sd::timer::SystemClock;
use crate::transport::{SomeIpTransport, UdpTransport};
use log::{debug, error, info, warn};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, mpsc};

const MAX_DATAGRAM: usize = 65535;

struct EndpointSockets {
    local: IpAddr,
    unicast: UdpTransport,
    multicast: UdpTransport,
}

struct Received {
    local: IpAddr,
    from: SocketAddr,
    is_multicast: bool,
    bytes: Vec<u8>,
}

pub struct SdRuntime {
    sd: Arc<Mutex<ServiceDiscovery>>,
    sockets: Vec<EndpointSockets>,
    running: AtomicBool,
    shutdown: Notify,
    // engine calls may have armed a timer earlier than the one `run` sleeps on
    rescheduled: Notify,
}

impl SdRuntime {
    /// Loads `path` and builds a runtime whose service instances only log what SD asks of them.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = SystemConfig::load(path)?;
        let router = RoutingTable::for_config(&config);
        Self::new(config, Box::new(PassiveConnections), Box::new(router))
    }

    pub fn new(
        config: SystemConfig,
        connections: Box<dyn ConnectionManager>,
        router: Box<dyn PacketRouter>,
    ) -> Result<Self> {
        let mut sockets = Vec::with_capacity(config.network_endpoints.len());
        for endpoint in &config.network_endpoints {
            let unicast_addr = SocketAddr::new(endpoint.address, endpoint.sd_port);
            let group = SocketAddr::new(endpoint.sd_multicast_address, endpoint.sd_port);
            let unicast = UdpTransport::bind_unicast(unicast_addr)?;
            let multicast = UdpTransport::bind_multicast(group, endpoint.address)?;
            info!("SD endpoint {} bound, multicast group {}", unicast_addr, group);
            sockets.push(EndpointSockets { local: endpoint.address, unicast, multicast });
        }
        let sd = ServiceDiscovery::new(config, connections, router, Box::new(SystemClock), None)?;
        Ok(SdRuntime {
            sd: Arc::new(Mutex::new(sd)),
            sockets,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            rescheduled: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ServiceDiscovery> {
        match self.sd.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Shared handle to the engine, for callers that manage sending themselves.
    pub fn service_discovery(&self) -> Arc<Mutex<ServiceDiscovery>> {
        self.sd.clone()
    }

    /// Runs `f` against the engine, sends whatever it queued and lets [`SdRuntime::run`]
    /// pick up any timer `f` armed.
    pub fn with_sd<R>(&self, f: impl FnOnce(&mut ServiceDiscovery) -> R) -> R {
        let (result, datagrams) = {
            let mut sd = self.lock();
            let result = f(&mut sd);
            (result, sd.take_datagrams())
        };
        self.send_all(datagrams);
        self.rescheduled.notify_one();
        result
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.with_sd(ServiceDiscovery::start);
    }

    /// Takes every state machine down and wakes [`SdRuntime::run`].
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.with_sd(ServiceDiscovery::shutdown);
        }
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Handles at most one waiting datagram and every timer that is due.
    /// Returns whether a datagram was read.
    pub fn process_next_packet(&self) -> bool {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut handled = false;
        'sockets: for endpoint in &self.sockets {
            for (socket, is_multicast) in [(&endpoint.unicast, false), (&endpoint.multicast, true)] {
                match socket.receive(&mut buf) {
                    Ok((n, from)) => {
                        self.handle(Received { local: endpoint.local, from, is_multicast, bytes: buf[..n].to_vec() });
                        handled = true;
                        break 'sockets;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => error!("RX error on {}: {}", endpoint.local, e),
                }
            }
        }
        self.with_sd(ServiceDiscovery::poll);
        handled
    }

    /// Event loop: receives on every SD socket, sleeps until the next SD timer and
    /// returns once [`SdRuntime::stop`] is called. Timers armed through
    /// [`SdRuntime::with_sd`] while it sleeps wake it up.
    pub async fn run(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Received>(256);
        let mut tasks = Vec::new();
        for endpoint in &self.sockets {
            for (socket, is_multicast) in [(&endpoint.unicast, false), (&endpoint.multicast, true)] {
                let socket = socket.try_clone()?.into_tokio()?;
                tasks.push(tokio::spawn(receive_loop(socket, endpoint.local, is_multicast, tx.clone())));
            }
        }
        drop(tx);
        info!("SD event loop started");

        while self.is_running() {
            let deadline = self.lock().next_deadline();
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = self.shutdown.notified() => break,
                received = rx.recv() => match received {
                    Some(received) => self.handle(received),
                    None => {
                        warn!("all SD receive tasks ended");
                        break;
                    }
                },
                _ = timer => self.with_sd(ServiceDiscovery::poll),
                _ = self.rescheduled.notified() => {}
            }
        }

        for task in tasks {
            task.abort();
        }
        info!("SD event loop stopped");
        Ok(())
    }

    fn handle(&self, received: Received) {
        #[cfg(feature = "packet-dump")]
        debug!("RX {} <- {}: {}", received.local, received.from, crate::logging::hex(&received.bytes));
        let result = self.with_sd(|sd| {
            sd.on_datagram(received.local, received.from, received.is_multicast, &received.bytes)
        });
        if let Err(e) = result {
            debug!("datagram from {} dropped: {}", received.from, e);
        }
    }

    fn send_all(&self, datagrams: Vec<Datagram>) {
        for datagram in datagrams {
            let Some(endpoint) = self.sockets.iter().find(|s| s.local == datagram.local) else {
                warn!("no socket for {}", datagram.local);
                continue;
            };
            #[cfg(feature = "packet-dump")]
            debug!("TX {} -> {}: {}", datagram.local, datagram.to, crate::logging::hex(&datagram.bytes));
            if let Err(e) = endpoint.unicast.send(&datagram.bytes, Some(datagram.to)) {
                error!("TX error {} -> {}: {}", datagram.local, datagram.to, e);
            }
        }
    }
}

async fn receive_loop(socket: tokio::net::UdpSocket, local: IpAddr, is_multicast: bool, tx: mpsc::Sender<Received>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let received = Received { local, from, is_multicast, bytes: buf[..n].to_vec() };
                if tx.send(received).await.is_err() {
                    return;
                }
            }
            Err(e) => error!("RX error on {}: {}", local, e),
        }
    }
}

/// Connection manager for a node that only takes part in discovery: every instance
/// logs what SD asks of it and reports TCP peers as connected.
pub struct PassiveConnections;

struct PassiveServer(ServiceInstanceKey);

impl ServerServiceInstance for PassiveServer {
    fn start(&mut self) {
        info!("{} server instance started", self.0);
    }

    fn stop(&mut self) {
        info!("{} server instance stopped", self.0);
    }

    fn subscribe_eventgroup(&mut self, eventgroup_id: u16, subscriber: &EventgroupSubscriber) {
        info!("{} eventgroup 0x{:04x} subscribed by {:?}", self.0, eventgroup_id, subscriber);
    }

    fn unsubscribe_eventgroup(&mut self, eventgroup_id: u16, subscriber: &EventgroupSubscriber) {
        info!("{} eventgroup 0x{:04x} unsubscribed by {:?}", self.0, eventgroup_id, subscriber);
    }

    fn has_tcp_connection(&self, _remote: SocketAddr) -> bool {
        true
    }
}

struct PassiveClient(ServiceInstanceKey);

impl ClientServiceInstance for PassiveClient {
    fn connect(&mut self, tcp: Option<SocketAddr>, udp: Option<SocketAddr>) {
        info!("{} connect tcp={:?} udp={:?}", self.0, tcp, udp);
    }

    fn disconnect(&mut self) {
        info!("{} disconnect", self.0);
    }

    fn start_listen_multicast(&mut self, group: SocketAddr) {
        info!("{} listening on {}", self.0, group);
    }

    fn stop_listen_multicast(&mut self, group: SocketAddr) {
        info!("{} no longer listening on {}", self.0, group);
    }
}

impl ConnectionManager for PassiveConnections {
    fn server_instance(
        &mut self,
        instance: &ProvidedInstanceConfig,
        _mapping: &PortMappingConfig,
    ) -> Box<dyn ServerServiceInstance> {
        let key = ServiceInstanceKey::new(
            instance.service_id,
            instance.instance_id,
            instance.major_version,
            instance.minor_version,
        );
        Box::new(PassiveServer(key))
    }

    fn client_instance(&mut self, key: ServiceInstanceKey) -> Box<dyn ClientServiceInstance> {
        Box::new(PassiveClient(key))
    }
}
