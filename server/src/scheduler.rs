//! Tick budget enforcement
//!
//! The scheduler never decides *whether* a tick runs; every tick runs exactly
//! once, in order. It only watches how long each tick took and tells the zone
//! how hard to degrade the next ones.

use crate::config::SchedulerConfig;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Drain,
    Movement,
    Aoi,
    Combat,
    Boundary,
    Dispatch,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Drain,
        Phase::Movement,
        Phase::Aoi,
        Phase::Combat,
        Phase::Boundary,
        Phase::Dispatch,
    ];

    fn index(self) -> usize {
        match self {
            Phase::Drain => 0,
            Phase::Movement => 1,
            Phase::Aoi => 2,
            Phase::Combat => 3,
            Phase::Boundary => 4,
            Phase::Dispatch => 5,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Drain => "drain",
            Phase::Movement => "movement",
            Phase::Aoi => "aoi",
            Phase::Combat => "combat",
            Phase::Boundary => "boundary",
            Phase::Dispatch => "dispatch",
        };
        f.write_str(name)
    }
}

/// Wall time spent in each phase of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTimings {
    durations: [Duration; 6],
}

impl PhaseTimings {
    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        self.durations[phase.index()] += elapsed;
    }

    pub fn get(&self, phase: Phase) -> Duration {
        self.durations[phase.index()]
    }

    pub fn total(&self) -> Duration {
        self.durations.iter().sum()
    }

    pub fn slowest(&self) -> Phase {
        let mut slowest = Phase::Drain;
        for phase in Phase::ALL {
            if self.get(phase) > self.get(slowest) {
                slowest = phase;
            }
        }
        slowest
    }

    pub fn clear(&mut self) {
        self.durations = [Duration::ZERO; 6];
    }
}

/// Signals for the external monitoring collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoringSignal {
    TickOverrun {
        tick: u64,
        elapsed_us: u64,
        budget_us: u64,
        phase: Phase,
    },
    Degraded {
        level: u8,
    },
    CellSizeWidened {
        cell_size: i64,
    },
    OutboundDropped {
        count: u64,
    },
}

/// What the zone should change before the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BudgetDecision {
    /// New AOI degradation level, when it changed.
    pub degradation: Option<u8>,
    /// New spatial cell size, when it should be widened.
    pub widen_cells_to: Option<i64>,
}

pub struct TickScheduler {
    period: Duration,
    budget: Duration,
    config: SchedulerConfig,
    degradation: u8,
    consecutive_overruns: u32,
    clean_ticks: u32,
    total_overruns: u64,
}

impl TickScheduler {
    pub fn new(period: Duration, config: SchedulerConfig) -> Self {
        let budget = period * config.budget_pct.clamp(1, 100) / 100;
        Self {
            period,
            budget,
            config,
            degradation: 0,
            consecutive_overruns: 0,
            clean_ticks: 0,
            total_overruns: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn degradation(&self) -> u8 {
        self.degradation
    }

    pub fn total_overruns(&self) -> u64 {
        self.total_overruns
    }

    /// Accounts for one finished tick.
    ///
    /// An overrun logs the slowest phase, raises the AOI degradation level and,
    /// once overruns persist for `cell_widen_after` ticks, asks for a wider
    /// spatial cell. `recover_after` clean ticks lower degradation one level.
    pub fn observe(
        &mut self,
        tick: u64,
        timings: &PhaseTimings,
        cell_size: i64,
        signals: &mut Vec<MonitoringSignal>,
    ) -> BudgetDecision {
        let elapsed = timings.total();
        let mut decision = BudgetDecision::default();

        if elapsed <= self.budget {
            self.consecutive_overruns = 0;
            self.clean_ticks = self.clean_ticks.saturating_add(1);
            if self.degradation > 0 && self.clean_ticks >= self.config.recover_after {
                self.degradation -= 1;
                self.clean_ticks = 0;
                info!("Tick budget recovered, AOI degradation now {}", self.degradation);
                signals.push(MonitoringSignal::Degraded {
                    level: self.degradation,
                });
                decision.degradation = Some(self.degradation);
            }
            return decision;
        }

        let phase = timings.slowest();
        self.total_overruns += 1;
        self.consecutive_overruns += 1;
        self.clean_ticks = 0;

        warn!(
            "Tick {} overran budget: {}us > {}us (slowest phase: {} {}us)",
            tick,
            elapsed.as_micros(),
            self.budget.as_micros(),
            phase,
            timings.get(phase).as_micros()
        );
        signals.push(MonitoringSignal::TickOverrun {
            tick,
            elapsed_us: elapsed.as_micros() as u64,
            budget_us: self.budget.as_micros() as u64,
            phase,
        });

        if self.degradation < self.config.max_degradation {
            self.degradation += 1;
            signals.push(MonitoringSignal::Degraded {
                level: self.degradation,
            });
            decision.degradation = Some(self.degradation);
        }

        if self.consecutive_overruns > self.config.cell_widen_after
            && cell_size < self.config.max_cell_size
        {
            let widened = (cell_size * 2).min(self.config.max_cell_size);
            warn!(
                "Overrun persisted for {} ticks, widening cells to {}",
                self.consecutive_overruns, widened
            );
            signals.push(MonitoringSignal::CellSizeWidened { cell_size: widened });
            decision.widen_cells_to = Some(widened);
            self.consecutive_overruns = 0;
        }

        decision
    }
}
