use clap::Parser;
use log::{error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use server::config::ZoneConfig;
use server::network::{Server, ServerMessage};
use server::persistence::{JsonLinesSink, LogSink};
use server::zone::ZoneAuthority;
use shared::{FixedVec3, ZoneId, DEFAULT_SERVER_PORT};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Zone configuration file (JSON); defaults are used when omitted
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    /// Override the zone id from the configuration
    #[arg(short = 'z', long)]
    zone_id: Option<u32>,

    /// Override the tick rate (updates per second)
    #[arg(short, long)]
    tick_rate: Option<u32>,

    /// Non-player entities to scatter inside the zone at startup
    #[arg(short, long, default_value = "0")]
    npcs: usize,

    /// Seed for NPC placement
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Append persistence records to this JSON-lines file instead of the log
    #[arg(long)]
    records: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ZoneConfig::load(path)?,
        None => ZoneConfig::default(),
    };
    if let Some(zone_id) = args.zone_id {
        config.zone.id = ZoneId(zone_id);
    }
    if let Some(tick_rate) = args.tick_rate {
        config.tick_rate = tick_rate;
    }

    let mut zone = ZoneAuthority::new(config)?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let bounds = zone.config().zone.bounds;
    let class_count = zone.config().classes.len().max(1);
    for _ in 0..args.npcs {
        let position = FixedVec3::new(
            rng.gen_range(bounds.min_x..bounds.max_x),
            0,
            rng.gen_range(bounds.min_z..bounds.max_z),
        );
        let class_id = zone.config().classes[rng.gen_range(0..class_count)].class_id;
        zone.spawn(class_id, position);
    }
    if args.npcs > 0 {
        info!("Spawned {} NPCs", args.npcs);
    }

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, zone).await?;

    match &args.records {
        Some(path) => {
            server.spawn_persistence(JsonLinesSink::open(path)?);
        }
        None => {
            server.spawn_persistence(LogSink);
        }
    }

    let shutdown = server.control_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = shutdown.send(ServerMessage::Shutdown);
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
