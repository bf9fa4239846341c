//! Fire-and-forget durable records
//!
//! The tick pushes [`PersistenceRecord`]s into its outbox; the network
//! boundary forwards them over a bounded channel to a worker task that owns
//! the [`PersistenceSink`]. Completion is reported back through a callback so
//! the next tick can account for it. Nothing here is awaited by the tick.

use log::{error, info};
use serde::{Deserialize, Serialize};
use shared::{ConnectionId, EntityId, FixedVec3, TicketId, ZoneId};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest batch the worker writes before reporting completion.
const MAX_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Malformed or out-of-range input.
    Protocol,
    /// Displacement clamped to the allowed maximum.
    Soft,
    /// Displacement rejected outright; connection is a kick candidate.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    Started,
    Accepted,
    Refused,
    Completed,
    Aborted,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistenceRecord {
    Combat {
        tick: u64,
        zone: ZoneId,
        attacker: EntityId,
        target: EntityId,
        weapon_slot: u8,
        damage: i32,
        remaining_health: i32,
        killed: bool,
        degraded_compensation: bool,
    },
    Migration {
        tick: u64,
        zone: ZoneId,
        ticket: TicketId,
        entity: EntityId,
        source: ZoneId,
        destination: ZoneId,
        outcome: MigrationOutcome,
    },
    AntiCheat {
        tick: u64,
        zone: ZoneId,
        connection: ConnectionId,
        entity: Option<EntityId>,
        severity: ViolationSeverity,
        /// Submitted displacement length, fixed units.
        claimed: i64,
        /// Largest displacement the class could have covered.
        allowed: i64,
        position: Option<FixedVec3>,
    },
}

impl PersistenceRecord {
    pub fn tick(&self) -> u64 {
        match self {
            PersistenceRecord::Combat { tick, .. }
            | PersistenceRecord::Migration { tick, .. }
            | PersistenceRecord::AntiCheat { tick, .. } => *tick,
        }
    }
}

/// Destination of persistence records. Writes run on tokio's blocking pool.
pub trait PersistenceSink: Send {
    fn write_batch(&mut self, records: &[PersistenceRecord]) -> std::io::Result<()>;
}

/// Appends one JSON object per line.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Persisting records to {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl PersistenceSink for JsonLinesSink {
    fn write_batch(&mut self, records: &[PersistenceRecord]) -> std::io::Result<()> {
        for record in records {
            serde_json::to_writer(&mut self.writer, record)?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

/// Writes records to the log at info level.
pub struct LogSink;

impl PersistenceSink for LogSink {
    fn write_batch(&mut self, records: &[PersistenceRecord]) -> std::io::Result<()> {
        for record in records {
            let line = serde_json::to_string(record)?;
            info!("record {}", line);
        }
        Ok(())
    }
}

/// Keeps records in memory. Used by tests and the bot harness.
#[derive(Default)]
pub struct MemorySink {
    pub records: Vec<PersistenceRecord>,
}

impl PersistenceSink for MemorySink {
    fn write_batch(&mut self, records: &[PersistenceRecord]) -> std::io::Result<()> {
        self.records.extend_from_slice(records);
        Ok(())
    }
}

/// Spawns the worker draining `rx` into `sink`.
///
/// `on_flush` receives the size of every batch once it has been handed to the
/// sink (written or failed). The worker exits when every sender is dropped and
/// returns the sink so callers can inspect it, or `None` if a write panicked.
pub fn spawn_persistence_worker<S, F>(
    mut rx: mpsc::Receiver<PersistenceRecord>,
    mut sink: S,
    mut on_flush: F,
) -> JoinHandle<Option<S>>
where
    S: PersistenceSink + 'static,
    F: FnMut(usize) + Send + 'static,
{
    tokio::spawn(async move {
        let mut batch = Vec::with_capacity(MAX_BATCH);

        while let Some(record) = rx.recv().await {
            batch.push(record);
            while batch.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(record) => batch.push(record),
                    Err(_) => break,
                }
            }

            let written = tokio::task::spawn_blocking(move || {
                let result = sink.write_batch(&batch);
                (sink, batch, result)
            })
            .await;
            let (returned, written_batch, result) = match written {
                Ok(done) => done,
                Err(e) => {
                    error!("Persistence writer stopped: {}", e);
                    return None;
                }
            };
            sink = returned;
            batch = written_batch;

            if let Err(e) = result {
                error!("Failed to persist {} records: {}", batch.len(), e);
            }
            on_flush(batch.len());
            batch.clear();
        }

        Some(sink)
    })
}
