//! Host-to-virtual event translation and sequencing checks.

use engine_abi::{
    HostEvent, InputTranslatedEvent, MappingProfile, Phase, VirtualTarget,
};

/// Diagnostics counters surfaced on the input diagnostics endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TranslatorDiagnostics {
    /// Host events that produced no translation; they never allocate
    /// sequence numbers.
    pub dropped_events: u64,
    /// SEQ-01..03 violations observed on the emitted stream.
    pub sequencing_violations: u64,
}

/// Stateless mapping lookup plus drop accounting.
#[derive(Debug, Default)]
pub struct Translator {
    diagnostics: TranslatorDiagnostics,
}

impl Translator {
    pub fn new() -> Translator {
        Translator::default()
    }

    pub fn diagnostics(&self) -> TranslatorDiagnostics {
        self.diagnostics
    }

    pub fn note_sequencing_violations(&mut self, count: u64) {
        self.diagnostics.sequencing_violations += count;
    }

    /// Records host events dropped before translation was even attempted.
    pub fn note_dropped(&mut self, count: u64) {
        self.diagnostics.dropped_events += count;
    }

    /// Translates one host event with the active profile.
    ///
    /// Mouse motion expands to one event per axis; everything else maps
    /// one-to-one. Events with no matching entry count as dropped.
    pub fn translate(
        &mut self,
        event: &HostEvent,
        profile: &MappingProfile,
    ) -> Vec<InputTranslatedEvent> {
        let key = event.key();
        let phase = event.phase();

        if let HostEvent::MouseMove { dx, dy } = event {
            let Some(entry) = lookup(profile, &key) else {
                self.diagnostics.dropped_events += 1;
                return Vec::new();
            };
            let mut out = Vec::with_capacity(2);
            if *dx != 0 {
                out.push(InputTranslatedEvent {
                    target: VirtualTarget::MouseAxis(0),
                    value: *dx as i32,
                    phase: Phase::Move,
                    host: entry.host.clone(),
                });
            }
            if *dy != 0 {
                out.push(InputTranslatedEvent {
                    target: VirtualTarget::MouseAxis(1),
                    value: *dy as i32,
                    phase: Phase::Move,
                    host: entry.host.clone(),
                });
            }
            if out.is_empty() {
                self.diagnostics.dropped_events += 1;
            }
            return out;
        }

        let Some(entry) = lookup(profile, &key) else {
            self.diagnostics.dropped_events += 1;
            return Vec::new();
        };
        // Entries pinned to a phase only fire on that phase.
        if let Some(wanted) = entry.phase {
            if wanted != phase && wanted != Phase::Move {
                self.diagnostics.dropped_events += 1;
                return Vec::new();
            }
        }
        let value = match phase {
            Phase::Down => entry.value,
            Phase::Up => 0,
            Phase::Move => entry.value,
        };
        vec![InputTranslatedEvent {
            target: entry.target,
            value,
            phase,
            host: key,
        }]
    }
}

/// Exact-modifier match first, then the wildcard entry.
fn lookup<'p>(
    profile: &'p MappingProfile,
    key: &engine_abi::HostEventKey,
) -> Option<&'p engine_abi::MappingEntry> {
    profile
        .entries
        .iter()
        .find(|entry| {
            entry.host.device_type == key.device_type
                && entry.host.code == key.code
                && entry.host.modifiers == key.modifiers
        })
        .or_else(|| {
            profile.entries.iter().find(|entry| {
                entry.host.device_type == key.device_type
                    && entry.host.code == key.code
                    && entry.host.modifiers.is_none()
            })
        })
}

/// SEQ-01..03 verifier for one emitted stream.
///
/// Violations are counted, never repaired: prior events are immutable
/// once published.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequenceChecker {
    last_seq: u64,
    last_timestamp_us: u64,
    last_tick: u64,
    last_cycle: u64,
}

impl SequenceChecker {
    pub fn new() -> SequenceChecker {
        SequenceChecker::default()
    }

    /// Checks one emission; returns the number of violations it added.
    pub fn check(&mut self, event_seq: u64, timestamp_us: u64, tick: u64, cycle: u64) -> u64 {
        let mut violations = 0;
        // SEQ-01: strict +1 sequence.
        if event_seq != self.last_seq + 1 {
            violations += 1;
        }
        // SEQ-02: non-decreasing timestamps.
        if timestamp_us < self.last_timestamp_us {
            violations += 1;
        }
        // SEQ-03: (tick, cycle) lexicographic monotonicity.
        if (tick, cycle) < (self.last_tick, self.last_cycle) {
            violations += 1;
        }
        self.last_seq = event_seq;
        self.last_timestamp_us = self.last_timestamp_us.max(timestamp_us);
        self.last_tick = tick;
        self.last_cycle = cycle;
        violations
    }
}
