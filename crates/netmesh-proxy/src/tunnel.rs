//! The proxy tunnel: two unidirectional pipelines between a TUN device and
//! a UDP socket.
//!
//! Outgoing: TUN → decode → pick an instance for the service IP → rewrite →
//! UDP to the instance's node (or straight into the local incoming queue).
//! Incoming: UDP → decode → reverse flow lookup → rewrite → TUN.
//!
//! Each pipeline is a reader task feeding a bounded queue and a handler
//! draining it. Both stop on a shared watch signal; [`ProxyTunnel::stop`]
//! returns once every task has acknowledged.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, PoisonError};

use netmesh_core::config::{TunnelConfig, DEFAULT_TUNNEL_PORT};
use netmesh_core::{is_namespace_still_valid, TableEntry};
use netmesh_table::RouteDirectory;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::cache::{ConversionEntry, ProxyCache};
use crate::device::TunDevice;
use crate::error::{TunnelError, TunnelResult};
use crate::packet::{NetworkHeader, Packet, PacketCodec};
use crate::pool::ConnectionPool;

const ERROR_BUFFER: usize = 64;
const IPV6_FRAGMENT_HEADER: u8 = 44;

/// An outgoing packet after translation, with the tunnel endpoint it goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translated {
    pub packet: Vec<u8>,
    pub node: SocketAddr,
}

type PacketQueue = mpsc::Receiver<Vec<u8>>;

struct Shared {
    config: TunnelConfig,
    directory: Arc<dyn RouteDirectory>,
    cache: ProxyCache,
    codec: PacketCodec,
    rng: std::sync::Mutex<StdRng>,
    local_ip: IpAddr,
    port: AtomicU16,
    pool: ConnectionPool,
    incoming_tx: mpsc::Sender<Vec<u8>>,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    errors_tx: mpsc::Sender<TunnelError>,
    outgoing_listening: AtomicBool,
    incoming_listening: AtomicBool,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    outgoing: JoinHandle<PacketQueue>,
    incoming: JoinHandle<PacketQueue>,
}

enum State {
    /// Queues parked while the pipelines are stopped.
    Idle {
        outgoing: PacketQueue,
        incoming: PacketQueue,
    },
    Running(Running),
    /// A pipeline panicked and took its queue with it.
    Failed,
}

pub struct ProxyTunnel {
    shared: Arc<Shared>,
    state: Mutex<State>,
    errors_rx: std::sync::Mutex<Option<mpsc::Receiver<TunnelError>>>,
}

impl ProxyTunnel {
    /// Build a stopped tunnel. `local_ip` is this node's tunnel address;
    /// instances hosted on it are reached without touching the network.
    pub fn new(config: TunnelConfig, directory: Arc<dyn RouteDirectory>, local_ip: IpAddr) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (incoming_tx, incoming_rx) = mpsc::channel(capacity);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_BUFFER);

        let shared = Shared {
            cache: ProxyCache::with_capacity(config.cache_slot_capacity),
            port: AtomicU16::new(config.effective_port()),
            config,
            directory,
            codec: PacketCodec::new(),
            rng: std::sync::Mutex::new(StdRng::from_entropy()),
            local_ip,
            pool: ConnectionPool::new(),
            incoming_tx,
            outgoing_tx,
            errors_tx,
            outgoing_listening: AtomicBool::new(false),
            incoming_listening: AtomicBool::new(false),
        };

        Self {
            shared: Arc::new(shared),
            state: Mutex::new(State::Idle {
                outgoing: outgoing_rx,
                incoming: incoming_rx,
            }),
            errors_rx: std::sync::Mutex::new(Some(errors_rx)),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.shared.config.device_name
    }

    pub fn is_listening(&self) -> bool {
        self.shared.outgoing_listening.load(Ordering::Acquire)
            || self.shared.incoming_listening.load(Ordering::Acquire)
    }

    /// The UDP port this tunnel receives on.
    pub fn port(&self) -> u16 {
        self.shared.port.load(Ordering::Acquire)
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.shared.codec
    }

    pub fn cache(&self) -> &ProxyCache {
        &self.shared.cache
    }

    /// Reader errors reported while listening. Can be taken once.
    pub fn errors(&self) -> Option<mpsc::Receiver<TunnelError>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Bind the tunnel port on all interfaces and start both pipelines.
    pub async fn listen(&self, device: Arc<dyn TunDevice>) -> TunnelResult<()> {
        let unspecified: IpAddr = match self.shared.local_ip {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind((unspecified, self.shared.config.effective_port())).await?;
        self.listen_on(device, socket).await
    }

    /// Start both pipelines on an already bound socket.
    pub async fn listen_on(&self, device: Arc<dyn TunDevice>, socket: UdpSocket) -> TunnelResult<()> {
        let mut state = self.state.lock().await;
        let (outgoing_queue, incoming_queue) = match std::mem::replace(&mut *state, State::Failed) {
            State::Idle { outgoing, incoming } => (outgoing, incoming),
            other => {
                let err = match other {
                    State::Running(_) => TunnelError::AlreadyListening,
                    _ => TunnelError::NotListening,
                };
                *state = other;
                return Err(err);
            }
        };

        let port = match socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(err) => {
                *state = State::Idle {
                    outgoing: outgoing_queue,
                    incoming: incoming_queue,
                };
                return Err(err.into());
            }
        };
        self.shared.port.store(port, Ordering::Release);
        let socket = Arc::new(socket);
        let (stop_tx, stop_rx) = watch::channel(false);
        self.shared.outgoing_listening.store(true, Ordering::Release);
        self.shared.incoming_listening.store(true, Ordering::Release);

        let outgoing = tokio::spawn(run_outgoing(
            self.shared.clone(),
            device.clone(),
            outgoing_queue,
            stop_rx.clone(),
        ));
        let incoming = tokio::spawn(run_incoming(
            self.shared.clone(),
            device,
            socket,
            incoming_queue,
            stop_rx,
        ));

        info!(
            device = %self.shared.config.device_name,
            port,
            mtu = self.shared.config.mtu,
            "proxy tunnel listening"
        );
        *state = State::Running(Running {
            stop_tx,
            outgoing,
            incoming,
        });
        Ok(())
    }

    /// Signal both pipelines and wait for their acknowledgements.
    pub async fn stop(&self) -> TunnelResult<()> {
        let mut state = self.state.lock().await;
        let running = match std::mem::replace(&mut *state, State::Failed) {
            State::Running(running) => running,
            other => {
                *state = other;
                return Err(TunnelError::NotListening);
            }
        };

        let _ = running.stop_tx.send(true);
        let outgoing = running.outgoing.await;
        let incoming = running.incoming.await;
        match (outgoing, incoming) {
            (Ok(outgoing), Ok(incoming)) => {
                *state = State::Idle { outgoing, incoming };
            }
            (out, inc) => {
                error!(
                    outgoing_ok = out.is_ok(),
                    incoming_ok = inc.is_ok(),
                    "pipeline task failed during shutdown"
                );
            }
        }
        info!(device = %self.shared.config.device_name, "proxy tunnel stopped");
        Ok(())
    }

    /// Translate one outgoing packet. `None` means drop.
    pub fn translate_outgoing(&self, packet: &Packet) -> Option<Translated> {
        self.shared.translate_outgoing(packet)
    }

    /// Reverse-translate one incoming packet. `None` means deliver unchanged.
    pub fn translate_incoming(&self, packet: &Packet) -> Option<Vec<u8>> {
        self.shared.translate_incoming(packet)
    }

    /// Send a translated packet to its node, retrying with fresh connections.
    pub async fn forward(&self, translated: Translated) -> TunnelResult<()> {
        self.shared.forward(translated).await
    }
}

impl Shared {
    fn translate_outgoing(&self, packet: &Packet) -> Option<Translated> {
        let dst_ip = packet.network.dst();
        let src_ip = packet.network.src();
        if !self.config.intercepts(dst_ip) {
            trace!(%dst_ip, "destination outside service subnetwork");
            return None;
        }
        let Some(transport) = packet.transport else {
            debug!(%dst_ip, "neither TCP nor UDP, dropping");
            return None;
        };
        let v6 = packet.network.is_v6();

        let candidates = self.directory.entries_by_service_ip(dst_ip);
        if candidates.is_empty() {
            debug!(service_ip = %dst_ip, "no instance known for service IP, dropping");
            return None;
        }

        let Some(src_instance_ip) = self
            .directory
            .entry_by_namespace_ip(src_ip)
            .and_then(|sender| sender.instance_ip_for(v6))
        else {
            warn!(%src_ip, "no instance IP for sender, dropping");
            return None;
        };

        let (src_port, dst_port) = (transport.src_port(), transport.dst_port());
        let cached = self
            .cache
            .retrieve_by_service_flow(src_ip, src_instance_ip, src_port, dst_ip, dst_port)
            .filter(|flow| is_namespace_still_valid(flow.dst_ip, &candidates));

        let flow = match cached {
            Some(flow) => flow,
            None => {
                let chosen = self.choose(&candidates)?;
                let flow = ConversionEntry {
                    src_ip,
                    dst_ip: chosen.namespace_ip_for(v6)?,
                    dst_service_ip: dst_ip,
                    src_instance_ip,
                    src_port,
                    dst_port,
                };
                self.cache.add(flow);
                debug!(
                    service_ip = %dst_ip,
                    target = %flow.dst_ip,
                    job = %chosen.job_name,
                    "new flow"
                );
                flow
            }
        };

        let target = candidates
            .iter()
            .find(|entry| entry.has_namespace_ip(flow.dst_ip))?;
        let node = node_endpoint(target)?;

        match self.codec.rewrite(packet, flow.src_instance_ip, flow.dst_ip) {
            Ok(bytes) => Some(Translated { packet: bytes, node }),
            Err(err) => {
                warn!(error = %err, "outgoing rewrite failed");
                None
            }
        }
    }

    fn choose<'a>(&self, candidates: &'a [TableEntry]) -> Option<&'a TableEntry> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..candidates.len());
        candidates.get(idx)
    }

    fn translate_incoming(&self, packet: &Packet) -> Option<Vec<u8>> {
        let transport = packet.transport?;
        let flow = self.cache.retrieve_by_instance_flow(
            packet.network.dst(),
            transport.dst_port(),
            transport.src_port(),
        )?;
        match self.codec.rewrite(packet, flow.dst_service_ip, flow.src_ip) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(error = %err, "incoming rewrite failed");
                None
            }
        }
    }

    fn is_local(&self, node: SocketAddr) -> bool {
        node.ip() == self.local_ip && node.port() == self.port.load(Ordering::Acquire)
    }

    async fn forward(&self, translated: Translated) -> TunnelResult<()> {
        let Translated { packet, node } = translated;
        if self.is_local(node) {
            trace!("forwarding to local incoming queue");
            return self
                .incoming_tx
                .send(packet)
                .await
                .map_err(|_| TunnelError::NotListening);
        }

        let attempts = self.config.max_forward_attempts.max(1);
        for attempt in 1..=attempts {
            let sent = match self.pool.get_or_connect(node).await {
                Ok(conn) => conn.send(&packet).await.map(|_| ()),
                Err(err) => Err(err),
            };
            match sent {
                Ok(()) => {
                    trace!(%node, bytes = packet.len(), "forwarded");
                    return Ok(());
                }
                Err(err) => {
                    warn!(%node, attempt, error = %err, "tunnel send failed, reconnecting");
                    self.pool.evict(node);
                }
            }
        }
        Err(TunnelError::ForwardFailed {
            target: node.to_string(),
            attempts,
        })
    }

    async fn handle_outgoing(&self, bytes: &[u8]) {
        let packet = match self.codec.decode(bytes) {
            Ok(Some(packet)) => packet,
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "undecodable outgoing packet");
                return;
            }
        };
        trace!(src = %packet.network.src(), dst = %packet.network.dst(), "outgoing packet");
        let Some(translated) = self.translate_outgoing(&packet) else {
            return;
        };
        if let Err(err) = self.forward(translated).await {
            warn!(error = %err, "dropping packet");
        }
    }

    /// The bytes to deliver to the device, if any.
    fn handle_incoming(&self, bytes: Vec<u8>) -> Option<Vec<u8>> {
        let packet = match self.codec.decode(&bytes) {
            Ok(Some(packet)) => packet,
            Ok(None) => return None,
            Err(err) => {
                debug!(error = %err, "undecodable incoming packet");
                return None;
            }
        };
        trace!(src = %packet.network.src(), dst = %packet.network.dst(), "incoming packet");
        if packet.transport.is_none() {
            // IPv6 fragments are not reassembled; hand them over untouched.
            return match packet.network {
                NetworkHeader::V6 {
                    next_header: IPV6_FRAGMENT_HEADER,
                    ..
                } => Some(packet.into_bytes()),
                _ => None,
            };
        }
        match self.translate_incoming(&packet) {
            Some(rewritten) => Some(rewritten),
            None => Some(packet.into_bytes()),
        }
    }

    fn report(&self, err: TunnelError) {
        error!(error = %err, "tunnel reader error");
        let _ = self.errors_tx.try_send(err);
    }
}

fn node_endpoint(entry: &TableEntry) -> Option<SocketAddr> {
    let Some(ip) = entry.node_ip else {
        warn!(job = %entry.job_name, "instance without node address");
        return None;
    };
    let port = if entry.node_port == 0 {
        DEFAULT_TUNNEL_PORT
    } else {
        entry.node_port
    };
    Some(SocketAddr::new(ip, port))
}

async fn run_outgoing(
    shared: Arc<Shared>,
    device: Arc<dyn TunDevice>,
    mut queue: PacketQueue,
    mut stop: watch::Receiver<bool>,
) -> PacketQueue {
    let reader = tokio::spawn(read_device(shared.clone(), device, stop.clone()));
    debug!("outgoing pipeline started");

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            packet = queue.recv() => match packet {
                Some(bytes) => shared.handle_outgoing(&bytes).await,
                None => break,
            },
        }
    }

    let _ = reader.await;
    shared.outgoing_listening.store(false, Ordering::Release);
    debug!("outgoing pipeline stopped");
    queue
}

async fn run_incoming(
    shared: Arc<Shared>,
    device: Arc<dyn TunDevice>,
    socket: Arc<UdpSocket>,
    mut queue: PacketQueue,
    mut stop: watch::Receiver<bool>,
) -> PacketQueue {
    let reader = tokio::spawn(read_socket(shared.clone(), socket, stop.clone()));
    debug!("incoming pipeline started");

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            packet = queue.recv() => match packet {
                Some(bytes) => {
                    if let Some(out) = shared.handle_incoming(bytes) {
                        if let Err(err) = device.send(&out).await {
                            error!(error = %err, "TUN write failed");
                        }
                    }
                }
                None => break,
            },
        }
    }

    // The reader owns the last socket handle; joining it closes the port.
    let _ = reader.await;
    shared.incoming_listening.store(false, Ordering::Release);
    debug!("incoming pipeline stopped");
    queue
}

async fn read_device(shared: Arc<Shared>, device: Arc<dyn TunDevice>, mut stop: watch::Receiver<bool>) {
    let mut buf = vec![0u8; shared.config.read_buffer_len()];
    loop {
        let read = tokio::select! {
            _ = stop.changed() => return,
            read = device.recv(&mut buf) => read,
        };
        match read {
            Ok(0) => continue,
            Ok(n) => {
                let packet = buf[..n].to_vec();
                tokio::select! {
                    _ = stop.changed() => return,
                    sent = shared.outgoing_tx.send(packet) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(err) => {
                let closed = err.kind() == std::io::ErrorKind::UnexpectedEof;
                shared.report(err.into());
                if closed {
                    return;
                }
            }
        }
    }
}

async fn read_socket(shared: Arc<Shared>, socket: Arc<UdpSocket>, mut stop: watch::Receiver<bool>) {
    let mut buf = vec![0u8; shared.config.read_buffer_len()];
    loop {
        let read = tokio::select! {
            _ = stop.changed() => return,
            read = socket.recv_from(&mut buf) => read,
        };
        match read {
            Ok((n, from)) => {
                trace!(%from, bytes = n, "tunnel datagram");
                let packet = buf[..n].to_vec();
                tokio::select! {
                    _ = stop.changed() => return,
                    sent = shared.incoming_tx.send(packet) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(err) => shared.report(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryTun;
    use crate::packet::{encode, TransportHeader};
    use netmesh_core::{ServiceIp, ServiceIpKind};
    use netmesh_table::TranslationTable;
    use std::time::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn entry(job: &str, instance: i32, ns: &str, node: &str, service: &[(ServiceIpKind, &str)]) -> TableEntry {
        let parts: Vec<&str> = job.split('.').collect();
        TableEntry {
            job_name: job.to_string(),
            app_name: parts[0].to_string(),
            app_namespace: parts[1].to_string(),
            service_name: parts[2].to_string(),
            service_namespace: parts[3].to_string(),
            instance_number: instance,
            cluster: 0,
            node_ip: Some(ip(node)),
            node_port: 50103,
            namespace_ip: Some(ns.parse().unwrap()),
            namespace_ipv6: None,
            service_ips: service
                .iter()
                .map(|(kind, addr)| ServiceIp::new(*kind, addr.parse().unwrap()))
                .collect(),
        }
    }

    /// Sender 10.19.1.1 (instance 10.30.255.253) and one server behind
    /// 10.30.255.255 at 10.19.2.12 on a remote node.
    fn fixture() -> (Arc<TranslationTable>, ProxyTunnel) {
        let table = Arc::new(TranslationTable::new());
        table
            .add(entry(
                "client.ns.web.ns",
                0,
                "10.19.1.1",
                "192.168.1.1",
                &[(ServiceIpKind::InstanceNumber, "10.30.255.253")],
            ))
            .unwrap();
        table
            .add(entry(
                "server.ns.api.ns",
                0,
                "10.19.2.12",
                "192.168.1.2",
                &[
                    (ServiceIpKind::RoundRobin, "10.30.255.255"),
                    (ServiceIpKind::InstanceNumber, "10.30.1.0"),
                ],
            ))
            .unwrap();
        let tunnel = ProxyTunnel::new(TunnelConfig::default(), table.clone(), ip("192.168.1.1"));
        (table, tunnel)
    }

    fn tcp(src: &str, dst: &str, sport: u16, dport: u16) -> Packet {
        let bytes = encode(
            ip(src),
            ip(dst),
            TransportHeader::Tcp { src_port: sport, dst_port: dport },
            b"payload",
        )
        .unwrap();
        PacketCodec::new().decode(&bytes).unwrap().unwrap()
    }

    fn decode(bytes: &[u8]) -> Packet {
        PacketCodec::new().decode(bytes).unwrap().unwrap()
    }

    #[test]
    fn outgoing_rewrites_to_namespace_ip() {
        let (_table, tunnel) = fixture();

        let out = tunnel
            .translate_outgoing(&tcp("10.19.1.1", "10.30.255.255", 666, 80))
            .unwrap();
        let packet = decode(&out.packet);
        assert_eq!(packet.network.dst(), ip("10.19.2.12"));
        assert_eq!(packet.network.src(), ip("10.30.255.253"));
        assert_eq!(packet.transport.unwrap().dst_port(), 80);
        assert_eq!(packet.transport.unwrap().src_port(), 666);
        assert_eq!(out.node, "192.168.1.2:50103".parse().unwrap());

        assert!(tunnel
            .translate_outgoing(&tcp("10.19.1.1", "10.20.1.1", 666, 80))
            .is_none());
    }

    #[test]
    fn outgoing_drops_unknown_service_and_unknown_sender() {
        let (_table, tunnel) = fixture();
        assert!(tunnel
            .translate_outgoing(&tcp("10.19.1.1", "10.30.9.9", 666, 80))
            .is_none());
        assert!(tunnel
            .translate_outgoing(&tcp("10.19.1.77", "10.30.255.255", 666, 80))
            .is_none());
    }

    #[test]
    fn incoming_restores_service_ip() {
        let (_table, tunnel) = fixture();
        tunnel
            .translate_outgoing(&tcp("10.19.1.1", "10.30.255.255", 666, 80))
            .unwrap();

        // The server's reply after its own node translated it.
        let reply = tcp("10.30.1.0", "10.19.1.1", 80, 666);
        let restored = decode(&tunnel.translate_incoming(&reply).unwrap());
        assert_eq!(restored.network.src(), ip("10.30.255.255"));
        assert_eq!(restored.network.dst(), ip("10.19.1.1"));

        let unrelated = tcp("10.19.2.1", "10.19.1.12", 666, 80);
        assert!(tunnel.translate_incoming(&unrelated).is_none());
    }

    #[test]
    fn incoming_uses_preloaded_flow() {
        let (_table, tunnel) = fixture();
        tunnel.cache().add(ConversionEntry {
            src_ip: ip("10.19.1.15"),
            dst_ip: ip("10.19.2.1"),
            dst_service_ip: ip("10.30.255.255"),
            src_instance_ip: ip("10.30.0.50"),
            src_port: 777,
            dst_port: 666,
        });
        let restored = decode(
            &tunnel
                .translate_incoming(&tcp("10.30.0.5", "10.19.1.15", 666, 777))
                .unwrap(),
        );
        assert_eq!(restored.network.src(), ip("10.30.255.255"));
    }

    #[test]
    fn flow_sticks_to_live_instance() {
        let (table, tunnel) = fixture();
        table
            .add(entry(
                "server.ns.api.ns",
                1,
                "10.19.2.13",
                "192.168.1.3",
                &[(ServiceIpKind::RoundRobin, "10.30.255.255")],
            ))
            .unwrap();

        let first = decode(
            &tunnel
                .translate_outgoing(&tcp("10.19.1.1", "10.30.255.255", 666, 80))
                .unwrap()
                .packet,
        );
        let pinned = first.network.dst();
        for _ in 0..50 {
            let next = decode(
                &tunnel
                    .translate_outgoing(&tcp("10.19.1.1", "10.30.255.255", 666, 80))
                    .unwrap()
                    .packet,
            );
            assert_eq!(next.network.dst(), pinned);
        }
    }

    #[test]
    fn dead_instance_is_not_reused() {
        let (table, tunnel) = fixture();
        table
            .add(entry(
                "server.ns.api.ns",
                1,
                "10.19.2.13",
                "192.168.1.3",
                &[(ServiceIpKind::RoundRobin, "10.30.255.255")],
            ))
            .unwrap();

        let first = tunnel
            .translate_outgoing(&tcp("10.19.1.1", "10.30.255.255", 666, 80))
            .unwrap();
        let pinned = decode(&first.packet).network.dst();
        table.remove_by_namespace_ip(pinned).unwrap();

        for _ in 0..20 {
            let next = tunnel
                .translate_outgoing(&tcp("10.19.1.1", "10.30.255.255", 666, 80))
                .unwrap();
            assert_ne!(decode(&next.packet).network.dst(), pinned);
        }
    }

    #[test]
    fn local_endpoint_detection() {
        let (_table, tunnel) = fixture();
        assert!(tunnel.shared.is_local("192.168.1.1:50103".parse().unwrap()));
        assert!(!tunnel.shared.is_local("192.168.1.1:50104".parse().unwrap()));
        assert!(!tunnel.shared.is_local("192.168.1.2:50103".parse().unwrap()));
    }

    fn dual_stack(mut entry: TableEntry, ns6: &str, service6: &[&str]) -> TableEntry {
        entry.namespace_ipv6 = Some(ns6.parse().unwrap());
        for (sip, v6) in entry.service_ips.iter_mut().zip(service6) {
            sip.address_v6 = Some(v6.parse().unwrap());
        }
        entry
    }

    #[test]
    fn ipv6_round_trip() {
        let table = Arc::new(TranslationTable::new());
        table
            .add(dual_stack(
                entry(
                    "client.ns.web.ns",
                    0,
                    "10.19.1.1",
                    "192.168.1.1",
                    &[(ServiceIpKind::InstanceNumber, "10.30.255.253")],
                ),
                "fc00::1",
                &["fdff::fd"],
            ))
            .unwrap();
        table
            .add(dual_stack(
                entry(
                    "server.ns.api.ns",
                    0,
                    "10.19.2.12",
                    "192.168.1.2",
                    &[
                        (ServiceIpKind::RoundRobin, "10.30.255.255"),
                        (ServiceIpKind::InstanceNumber, "10.30.1.0"),
                    ],
                ),
                "fc00::12",
                &["fdff::ff", "fdff::10"],
            ))
            .unwrap();
        let tunnel = ProxyTunnel::new(TunnelConfig::default(), table, ip("192.168.1.1"));

        let out = tunnel
            .translate_outgoing(&tcp("fc00::1", "fdff::ff", 666, 80))
            .unwrap();
        let packet = decode(&out.packet);
        assert!(packet.network.is_v6());
        assert_eq!(packet.network.src(), ip("fdff::fd"));
        assert_eq!(packet.network.dst(), ip("fc00::12"));
        assert_eq!(out.node, "192.168.1.2:50103".parse().unwrap());

        let reply = tcp("fdff::10", "fc00::1", 80, 666);
        let restored = decode(&tunnel.translate_incoming(&reply).unwrap());
        assert_eq!(restored.network.src(), ip("fdff::ff"));
        assert_eq!(restored.network.dst(), ip("fc00::1"));
        assert_eq!(restored.transport.unwrap().src_port(), 80);
        assert_eq!(restored.transport.unwrap().dst_port(), 666);
    }

    #[test]
    fn ipv6_outside_service_prefix_is_ignored() {
        let (_table, tunnel) = fixture();
        assert!(tunnel
            .translate_outgoing(&tcp("fc00::1", "2001:db8::1", 666, 80))
            .is_none());
    }

    #[test]
    fn incoming_passes_ipv6_fragments_through() {
        let (_table, tunnel) = fixture();
        let mut bytes = encode(
            ip("fc00::12"),
            ip("fc00::1"),
            TransportHeader::Udp { src_port: 80, dst_port: 666 },
            &[0; 8],
        )
        .unwrap();
        bytes[6] = IPV6_FRAGMENT_HEADER;
        assert_eq!(tunnel.shared.handle_incoming(bytes.clone()), Some(bytes));
    }

    #[test]
    fn incoming_drops_non_transport_ipv4() {
        let (_table, tunnel) = fixture();
        let mut icmp = encode(
            ip("10.19.2.12"),
            ip("10.19.1.1"),
            TransportHeader::Udp { src_port: 80, dst_port: 666 },
            &[0; 8],
        )
        .unwrap();
        icmp[9] = 1;
        assert_eq!(tunnel.shared.handle_incoming(icmp), None);

        // Untranslated TCP goes to the device as is.
        let direct = encode(
            ip("10.19.2.12"),
            ip("10.19.1.1"),
            TransportHeader::Tcp { src_port: 80, dst_port: 666 },
            b"direct",
        )
        .unwrap();
        assert_eq!(tunnel.shared.handle_incoming(direct.clone()), Some(direct));
    }

    #[tokio::test]
    async fn forward_retries_then_fails() {
        let (_table, mut tunnel) = fixture();
        Arc::get_mut(&mut tunnel.shared).unwrap().config.max_forward_attempts = 3;
        // Broadcast without SO_BROADCAST is refused, so every attempt fails.
        let err = tunnel
            .forward(Translated {
                packet: vec![0x45],
                node: "255.255.255.255:50103".parse().unwrap(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::ForwardFailed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn listen_and_stop_lifecycle() {
        let (_table, tunnel) = fixture();
        let (tun, _handle) = MemoryTun::new("mem0", 8);
        let tun: Arc<dyn TunDevice> = Arc::new(tun);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        tunnel.listen_on(tun.clone(), socket).await.unwrap();
        assert!(tunnel.is_listening());

        let again = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            tunnel.listen_on(tun.clone(), again).await,
            Err(TunnelError::AlreadyListening)
        ));

        tunnel.stop().await.unwrap();
        assert!(!tunnel.is_listening());
        assert!(matches!(tunnel.stop().await, Err(TunnelError::NotListening)));

        // Queues are parked, so the tunnel can listen again.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        tunnel.listen_on(tun, socket).await.unwrap();
        tunnel.stop().await.unwrap();
    }

    #[tokio::test]
    async fn local_instance_short_circuits_to_tun() {
        let table = Arc::new(TranslationTable::new());
        table
            .add(entry(
                "client.ns.web.ns",
                0,
                "10.19.1.1",
                "127.0.0.1",
                &[(ServiceIpKind::InstanceNumber, "10.30.255.253")],
            ))
            .unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let mut server = entry(
            "server.ns.api.ns",
            0,
            "10.19.2.12",
            "127.0.0.1",
            &[(ServiceIpKind::RoundRobin, "10.30.255.255")],
        );
        server.node_port = port;
        table.add(server).unwrap();

        let tunnel = ProxyTunnel::new(TunnelConfig::default(), table, ip("127.0.0.1"));
        let (tun, mut handle) = MemoryTun::new("mem0", 8);
        tunnel.listen_on(Arc::new(tun), socket).await.unwrap();

        let bytes = encode(
            ip("10.19.1.1"),
            ip("10.30.255.255"),
            TransportHeader::Udp { src_port: 5000, dst_port: 53 },
            b"query",
        )
        .unwrap();
        handle.inject(bytes).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(2), handle.delivered())
            .await
            .unwrap()
            .unwrap();
        let packet = decode(&delivered);
        assert_eq!(packet.network.dst(), ip("10.19.2.12"));
        assert_eq!(packet.network.src(), ip("10.30.255.253"));
        assert_eq!(packet.payload(), b"query");

        tunnel.stop().await.unwrap();
    }
}
