//! Server network layer: UDP I/O, the persistence worker and the tick loop

use crate::error::ServerError;
use crate::persistence::{spawn_persistence_worker, PersistenceRecord, PersistenceSink};
use crate::scheduler::MonitoringSignal;
use crate::zone::{Inbound, ZoneAuthority};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, ZoneId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Largest UDP payload we accept.
const MAX_DATAGRAM: usize = 65_507;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    /// The persistence worker wrote a batch
    PersistenceFlushed {
        records: usize,
    },
    Shutdown,
}

/// Messages sent from the tick loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

/// Runs one zone authority behind a UDP socket
pub struct Server {
    socket: Arc<UdpSocket>,
    zone: ZoneAuthority,
    neighbor_addrs: HashMap<ZoneId, SocketAddr>,
    dropped: u64,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Option<mpsc::Receiver<OutboundMessage>>,
    persistence_tx: mpsc::Sender<PersistenceRecord>,
    persistence_rx: Option<mpsc::Receiver<PersistenceRecord>>,
}

impl Server {
    pub async fn new(addr: &str, zone: ZoneAuthority) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!(
            "Zone {} listening on {}",
            zone.config().zone.id,
            socket.local_addr()?
        );

        let mut neighbor_addrs = HashMap::new();
        for neighbor in &zone.config().zone.neighbors {
            match neighbor.address.parse::<SocketAddr>() {
                Ok(address) => {
                    neighbor_addrs.insert(neighbor.id, address);
                }
                Err(e) => warn!(
                    "Ignoring neighbour {} with bad address {}: {}",
                    neighbor.id, neighbor.address, e
                ),
            }
        }

        let queues = zone.config().queues;
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(queues.outbound_capacity.max(1));
        let (persistence_tx, persistence_rx) = mpsc::channel(queues.persistence_capacity.max(1));

        Ok(Server {
            socket,
            zone,
            neighbor_addrs,
            dropped: 0,
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            persistence_tx,
            persistence_rx: Some(persistence_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn zone(&self) -> &ZoneAuthority {
        &self.zone
    }

    pub fn zone_mut(&mut self) -> &mut ZoneAuthority {
        &mut self.zone
    }

    /// Handle for stopping [`Server::run`] from another task
    pub fn control_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Starts the worker that owns `sink`. Only the first call has an effect.
    pub fn spawn_persistence<S>(&mut self, sink: S) -> Option<JoinHandle<Option<S>>>
    where
        S: PersistenceSink + 'static,
    {
        let rx = self.persistence_rx.take()?;
        let server_tx = self.server_tx.clone();
        Some(spawn_persistence_worker(rx, sink, move |records| {
            let _ = server_tx.send(ServerMessage::PersistenceFlushed { records });
        }))
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut outbound_rx = match self.outbound_rx.take() {
            Some(rx) => rx,
            None => return,
        };

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    /// Queues without waiting; false when the queue is full or closed.
    fn queue(tx: &mpsc::Sender<OutboundMessage>, packet: Packet, addr: SocketAddr) -> bool {
        tx.try_send(OutboundMessage::SendPacket { packet, addr })
            .is_ok()
    }

    /// Hands everything the last tick produced to the sender and persistence
    /// queues. Never waits; a full queue drops the message.
    fn dispatch(&mut self) {
        let outbox = self.zone.outbox();
        let clients = self.zone.clients();
        let mut dropped = 0u64;

        for (connection, snapshot) in &outbox.snapshots {
            if let Some(addr) = clients.addr_of(*connection) {
                if !Self::queue(&self.outbound_tx, Packet::Snapshot(snapshot.clone()), addr) {
                    dropped += 1;
                }
            }
        }
        for (connection, event) in &outbox.events {
            if let Some(addr) = clients.addr_of(*connection) {
                if !Self::queue(&self.outbound_tx, Packet::Event(event.clone()), addr) {
                    dropped += 1;
                }
            }
        }
        for (addr, packet) in &outbox.control {
            if !Self::queue(&self.outbound_tx, packet.clone(), *addr) {
                dropped += 1;
            }
        }
        for (zone, message) in &outbox.zone_messages {
            match self.neighbor_addrs.get(zone) {
                Some(addr) => {
                    if !Self::queue(&self.outbound_tx, Packet::Zone(message.clone()), *addr) {
                        dropped += 1;
                    }
                }
                None => debug!("No route to {}", zone),
            }
        }
        for record in &outbox.persistence {
            if self.persistence_tx.try_send(record.clone()).is_err() {
                dropped += 1;
            }
        }

        for signal in &outbox.signals {
            match signal {
                MonitoringSignal::TickOverrun { .. } => debug!("Monitoring: {:?}", signal),
                _ => info!("Monitoring: {:?}", signal),
            }
        }

        if dropped > 0 {
            self.dropped += dropped;
            let signal = MonitoringSignal::OutboundDropped { count: dropped };
            warn!("Monitoring: {:?} ({} total)", signal, self.dropped);
        }
    }

    /// Main server loop: queue inbound traffic, tick on schedule, dispatch
    pub async fn run(&mut self) -> Result<(), ServerError> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut tick_interval = interval(self.zone.config().tick_period());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Zone {} started at {}Hz",
            self.zone.config().zone.id,
            self.zone.config().tick_rate
        );

        loop {
            tokio::select! {
                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.zone.push_packet(addr, packet);
                        },
                        Some(ServerMessage::PersistenceFlushed { records }) => {
                            self.zone.push(Inbound::PersistenceFlushed { records });
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                // Handle server tick events
                _ = tick_interval.tick() => {
                    self.zone.run_tick();
                    self.dispatch();
                },
            }
        }

        Ok(())
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped
    }
}
