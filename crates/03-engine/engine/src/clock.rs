//! Debug clock control and the monotonic timestamp emitter.
//!
//! The emitter scales wall-clock progress by the effective ratio, so
//! `slow_motion` stretches timestamps without touching step ordering.
//! Mode changes are atomic at tick boundaries (the scheduler only calls
//! in between ticks) and idempotent re-issues leave the transition
//! sequence untouched.

use engine_abi::{ClockMode, EngineError, ErrorCode, ErrorDetails, EventStamp, ModeChangeOutcome};
use std::time::Instant;

pub struct DebugClock {
    mode: ClockMode,
    mode_transition_seq: u64,
    origin: Instant,
    last_wall_us: u64,
    emitted_us: u64,
}

impl DebugClock {
    pub fn new() -> DebugClock {
        DebugClock {
            mode: ClockMode::Realtime,
            mode_transition_seq: 0,
            origin: Instant::now(),
            last_wall_us: 0,
            emitted_us: 0,
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn mode_transition_seq(&self) -> u64 {
        self.mode_transition_seq
    }

    /// Whether the scheduler may advance without step requests.
    pub fn is_continuous(&self) -> bool {
        !matches!(self.mode, ClockMode::SingleStep)
    }

    pub fn effective_ratio(&self) -> f64 {
        self.mode.effective_ratio()
    }

    /// Validates and commits a mode change.
    pub fn set_mode(&mut self, mode: ClockMode) -> Result<ModeChangeOutcome, EngineError> {
        if let ClockMode::SlowMotion { ratio } = mode {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(EngineError::new(
                    ErrorCode::DebugClockInvalid,
                    format!("slow_motion ratio {ratio} outside (0, 1]"),
                )
                .with_details(ErrorDetails::default().with("ratio", ratio)));
            }
        }
        if mode == self.mode {
            return Ok(ModeChangeOutcome {
                transition_applied: false,
                mode_transition_seq: self.mode_transition_seq,
            });
        }
        self.mode = mode;
        self.mode_transition_seq += 1;
        Ok(ModeChangeOutcome {
            transition_applied: true,
            mode_transition_seq: self.mode_transition_seq,
        })
    }

    /// Raw wall-clock microseconds since the clock's origin.
    pub fn wall_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Next `event_timestamp_us`: wall progress scaled by the effective
    /// ratio, accumulated so it never regresses across mode changes.
    pub fn next_timestamp_us(&mut self) -> u64 {
        let wall = self.wall_us();
        let delta = wall.saturating_sub(self.last_wall_us);
        self.last_wall_us = wall;
        let scaled = (delta as f64 * self.effective_ratio()) as u64;
        self.emitted_us += scaled;
        self.emitted_us
    }

    /// Stamps an event with the canonical `(tick, cycle, timestamp)` base.
    pub fn stamp(&mut self, tick: u64, cycle: u64) -> EventStamp {
        EventStamp {
            tick,
            cycle,
            timestamp_us: self.next_timestamp_us(),
        }
    }

    /// Wall-clock duration one tick of `cycles` CPU cycles should take.
    pub fn tick_duration_us(&self, cycles: u32) -> u64 {
        // 8 cycles per microsecond at 8 MHz, stretched by 1/ratio.
        (cycles as f64 / 8.0 / self.effective_ratio()) as u64
    }
}

impl Default for DebugClock {
    fn default() -> Self {
        Self::new()
    }
}
