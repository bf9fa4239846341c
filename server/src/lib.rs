//! # Zone Authority Server Library
//!
//! This library implements one authoritative zone of a distributed world. Each
//! zone owns a rectangular region and the entities currently inside it,
//! validates client input against physical limits, replicates nearby state to
//! every connected observer, resolves combat with lag compensation and hands
//! entities over to neighbouring zones when they cross a border.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! The zone runs the definitive version of every entity it owns. Positions are
//! fixed-point integers so two machines replaying the same inputs agree bit for
//! bit. Clients only submit intent; the zone decides what actually happens.
//!
//! ### Input Validation
//! Every movement input is checked against the entity class's speed cap for
//! the ticks elapsed since its last accepted input. Small excesses are clamped,
//! large ones are rejected and the connection is flagged.
//!
//! ### Interest Management
//! Observers receive snapshots only for entities inside their area of interest,
//! tiered by distance: near entities refresh every tick, far ones less often.
//! Entering and leaving the area produce reliable spawn and despawn events.
//!
//! ### Lag Compensation
//! Attacks are validated against where the target was when the attacker saw
//! it, reconstructed from a short per-entity position history.
//!
//! ### Zone Boundaries
//! Entities near a border are mirrored into the neighbour as read-only shadows.
//! An entity that crosses fully into a neighbour migrates there through an
//! acknowledged handoff with a timeout that falls back to the source.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Tick
//! A zone executes each tick as a single thread of control. Network receipt,
//! network send and persistence run in separate tasks and meet the tick only
//! through queues: inbound traffic is drained at the start of a tick, and the
//! tick's outbox is dispatched after it completes without waiting.
//!
//! ### Explicit Context
//! Components never read a global clock or zone. They receive a
//! [`context::TickContext`] holding the configuration, zone descriptor and tick
//! number, so any tick can be replayed in isolation.
//!
//! ## Module Organization
//!
//! - `registry`, `spatial`: entity arena keyed by stable id, uniform grid index
//! - `movement`: displacement and rotation checks, anti-cheat escalation
//! - `aoi`: tiered visibility, snapshots, spawn/despawn events
//! - `history`, `combat`: position rings and rewound hit resolution
//! - `boundary`: mirrors and the migration state machine
//! - `scheduler`: phase timings, overrun reporting, degradation policy
//! - `client_manager`: sessions, input buffers, RTT, timeouts
//! - `zone`: the per-tick orchestrator
//! - `network`, `persistence`: the asynchronous boundary
//! - `config`, `error`, `context`: shared plumbing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ZoneConfig;
//! use server::network::Server;
//! use server::persistence::LogSink;
//! use server::zone::ZoneAuthority;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let zone = ZoneAuthority::new(ZoneConfig::default())?;
//!     let mut server = Server::new("127.0.0.1:7777", zone).await?;
//!     server.spawn_persistence(LogSink);
//!
//!     // Drains packets, ticks at the configured rate and dispatches
//!     // snapshots, events and zone messages until shut down
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod aoi;
pub mod boundary;
pub mod client_manager;
pub mod combat;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod movement;
pub mod network;
pub mod persistence;
pub mod registry;
pub mod scheduler;
pub mod spatial;
pub mod zone;
