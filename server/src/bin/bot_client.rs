//! Headless bot that connects to a zone, walks in a circle and follows redirects

use bincode::{deserialize, serialize};
use clap::Parser;
use log::{debug, info, warn};
use shared::{
    EntityId, EventKind, FixedVec3, InputState, Packet, DEFAULT_SERVER_PORT, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Zone address to connect to
    #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{}", DEFAULT_SERVER_PORT))]
    server: String,

    /// Entity class to spawn as
    #[arg(short = 'c', long, default_value = "0")]
    class_id: u8,

    /// Inputs to send before disconnecting
    #[arg(short = 'n', long, default_value = "600")]
    inputs: u32,

    /// Displacement per input in millimetres
    #[arg(short = 'v', long, default_value = "80")]
    step: i32,
}

/// Direction for input `i` on a 120-input circle, in millimetres.
fn heading(i: u32, step: i32) -> FixedVec3 {
    let angle = i as f64 * std::f64::consts::TAU / 120.0;
    FixedVec3::new(
        (angle.cos() * step as f64) as i32,
        0,
        (angle.sin() * step as f64) as i32,
    )
}

async fn handshake(
    socket: &UdpSocket,
    server: SocketAddr,
    request: &Packet,
) -> Result<EntityId, Box<dyn std::error::Error>> {
    let mut buf = vec![0u8; 65_507];
    socket.send_to(&serialize(request)?, server).await?;

    loop {
        let (len, _) = timeout(Duration::from_secs(3), socket.recv_from(&mut buf)).await??;
        match deserialize::<Packet>(&buf[..len]) {
            Ok(Packet::Connected {
                connection_id,
                entity_id,
                zone,
            }) => {
                info!(
                    "Connected to {} as client {} controlling {}",
                    zone, connection_id, entity_id
                );
                return Ok(entity_id);
            }
            Ok(Packet::Disconnected { reason }) => return Err(reason.into()),
            Ok(other) => debug!("Ignoring {:?} during handshake", other),
            Err(e) => warn!("Failed to deserialize packet: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    info!("Bot socket bound to {}", socket.local_addr()?);

    let mut server: SocketAddr = args.server.parse()?;
    let mut entity_id = handshake(
        &socket,
        server,
        &Packet::Connect {
            client_version: PROTOCOL_VERSION,
            class_id: args.class_id,
        },
    )
    .await?;

    let mut buf = vec![0u8; 65_507];
    let mut ticker = interval(Duration::from_millis(16));
    let mut sequence = 0u32;
    let mut snapshots = 0u64;

    while sequence < args.inputs {
        tokio::select! {
            _ = ticker.tick() => {
                sequence += 1;
                let input = InputState {
                    entity_id,
                    sequence,
                    move_vector: heading(sequence, args.step),
                    facing: 0,
                    action_flags: 0,
                    client_time: sequence as u64 * 16,
                };
                socket.send_to(&serialize(&Packet::Input(input))?, server).await?;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, _) = received?;
                match deserialize::<Packet>(&buf[..len]) {
                    Ok(Packet::Snapshot(snapshot)) => {
                        snapshots += 1;
                        if snapshots % 60 == 0 {
                            info!(
                                "Tick {}: {} entities visible, last input {}",
                                snapshot.tick, snapshot.entries.len(), snapshot.last_processed_input
                            );
                        }
                    }
                    Ok(Packet::Ping { server_time }) => {
                        socket.send_to(&serialize(&Packet::Pong { server_time })?, server).await?;
                    }
                    Ok(Packet::Event(event)) => match event.kind {
                        EventKind::MovementCorrected { position, .. } => {
                            warn!("Server corrected {} to {:?}", event.entity_id, position);
                        }
                        EventKind::MigrationCompleted { destination } => {
                            info!("{} migrated to {}", event.entity_id, destination);
                        }
                        other => debug!("Event for {}: {:?}", event.entity_id, other),
                    },
                    Ok(Packet::Redirect { zone, address }) => {
                        info!("Redirected to {} at {}", zone, address);
                        server = address.parse()?;
                        entity_id = handshake(
                            &socket,
                            server,
                            &Packet::Reattach {
                                client_version: PROTOCOL_VERSION,
                                entity_id,
                            },
                        )
                        .await?;
                    }
                    Ok(Packet::Disconnected { reason }) => {
                        warn!("Disconnected: {}", reason);
                        return Ok(());
                    }
                    Ok(other) => debug!("Unexpected packet: {:?}", other),
                    Err(e) => warn!("Failed to deserialize packet: {}", e),
                }
            }
        }
    }

    socket.send_to(&serialize(&Packet::Disconnect)?, server).await?;
    info!("Bot finished after {} inputs and {} snapshots", sequence, snapshots);
    Ok(())
}
