//! SLO sampler: rolling-window collection with breach/recover alarms.
//!
//! Metrics are fed continuously; samples are emitted per completed window,
//! with strictly monotonic `sample_seq` and non-overlapping windows per
//! metric. Alarms fire on the window aggregate crossing the threshold and
//! recover exactly once when it returns at or below it.

use engine_abi::{
    EngineError, ErrorCode, ErrorDetails, SloAlarm, SloAlarmState, SloConfig, SloMetric, SloSample,
    SloSeverity,
};
use std::collections::HashMap;

const METRICS: [SloMetric; 3] = [
    SloMetric::InputLatencyMs,
    SloMetric::JitterMs,
    SloMetric::DroppedFramePct,
];

/// Output of one sampler tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SloTick {
    pub samples: Vec<SloSample>,
    pub alarms: Vec<SloAlarm>,
}

#[derive(Clone, Debug, Default)]
struct WindowAccum {
    sum: f64,
    count: u64,
    window_start_us: u64,
}

pub struct SloSampler {
    config: SloConfig,
    thresholds: HashMap<SloMetric, f64>,
    windows: HashMap<SloMetric, WindowAccum>,
    breached: HashMap<SloMetric, bool>,
    sample_seq: u64,
}

impl SloSampler {
    /// Validates the configuration bounds before constructing.
    pub fn new(config: SloConfig) -> Result<SloSampler, EngineError> {
        if !(100..=10_000).contains(&config.sampling_interval_ms) {
            return Err(EngineError::new(
                ErrorCode::MalformedRequest,
                format!(
                    "sampling_interval_ms {} outside 100..=10000",
                    config.sampling_interval_ms
                ),
            )
            .with_details(ErrorDetails::default().with("field", "sampling_interval_ms")));
        }
        if !(1_000..=60_000).contains(&config.window_ms) {
            return Err(EngineError::new(
                ErrorCode::MalformedRequest,
                format!("window_ms {} outside 1000..=60000", config.window_ms),
            )
            .with_details(ErrorDetails::default().with("field", "window_ms")));
        }
        let thresholds = METRICS
            .iter()
            .map(|metric| (*metric, metric.default_threshold()))
            .collect();
        Ok(SloSampler {
            config,
            thresholds,
            windows: HashMap::new(),
            breached: HashMap::new(),
            sample_seq: 0,
        })
    }

    pub fn config(&self) -> SloConfig {
        self.config
    }

    pub fn threshold(&self, metric: SloMetric) -> f64 {
        self.thresholds[&metric]
    }

    pub fn set_threshold(&mut self, metric: SloMetric, threshold: f64) {
        self.thresholds.insert(metric, threshold);
    }

    /// Feeds one observation for `metric`.
    pub fn record(&mut self, metric: SloMetric, value: f64, now_us: u64) {
        let accum = self.windows.entry(metric).or_insert_with(|| WindowAccum {
            window_start_us: now_us,
            ..WindowAccum::default()
        });
        accum.sum += value;
        accum.count += 1;
    }

    /// Emits samples and alarm transitions for windows completed by `now_us`.
    pub fn tick(&mut self, now_us: u64) -> SloTick {
        let mut out = SloTick::default();
        let window_us = self.config.window_ms * 1_000;
        for metric in METRICS {
            let Some(accum) = self.windows.get_mut(&metric) else {
                continue;
            };
            if now_us < accum.window_start_us + window_us {
                continue;
            }
            let window_start_us = accum.window_start_us;
            let window_end_us = window_start_us + window_us;
            let observed = if accum.count == 0 {
                0.0
            } else {
                accum.sum / accum.count as f64
            };
            // The next window begins exactly where this one ended.
            *accum = WindowAccum {
                window_start_us: window_end_us,
                ..WindowAccum::default()
            };

            self.sample_seq += 1;
            out.samples.push(SloSample {
                sample_seq: self.sample_seq,
                metric,
                window_start_us,
                window_end_us,
                observed,
            });

            let threshold = self.thresholds[&metric];
            let was_breached = self.breached.get(&metric).copied().unwrap_or(false);
            if observed > threshold && !was_breached {
                self.breached.insert(metric, true);
                out.alarms.push(SloAlarm {
                    metric,
                    state: SloAlarmState::Breached,
                    severity: severity(observed, threshold),
                    observed,
                    threshold,
                });
            } else if observed <= threshold && was_breached {
                self.breached.insert(metric, false);
                out.alarms.push(SloAlarm {
                    metric,
                    state: SloAlarmState::Recovered,
                    severity: severity(observed, threshold),
                    observed,
                    threshold,
                });
            }
        }
        out
    }
}

fn severity(observed: f64, threshold: f64) -> SloSeverity {
    if observed >= 1.2 * threshold {
        SloSeverity::Critical
    } else {
        SloSeverity::Warning
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampler() -> SloSampler {
        SloSampler::new(SloConfig {
            sampling_interval_ms: 100,
            window_ms: 1_000,
        })
        .expect("valid config")
    }

    #[test]
    fn config_bounds_are_enforced() {
        assert!(SloSampler::new(SloConfig {
            sampling_interval_ms: 50,
            window_ms: 1_000,
        })
        .is_err());
        assert!(SloSampler::new(SloConfig {
            sampling_interval_ms: 100,
            window_ms: 120_000,
        })
        .is_err());
    }

    #[test]
    fn samples_have_monotonic_seq_and_tiled_windows() {
        let mut sampler = sampler();
        sampler.record(SloMetric::JitterMs, 5.0, 0);
        let first = sampler.tick(1_000_000);
        sampler.record(SloMetric::JitterMs, 6.0, 1_200_000);
        let second = sampler.tick(2_000_000);
        let a = first.samples[0];
        let b = second.samples[0];
        assert_eq!(a.sample_seq, 1);
        assert_eq!(b.sample_seq, 2);
        assert_eq!(a.window_end_us, b.window_start_us, "windows tile exactly");
    }

    #[test]
    fn breach_fires_once_then_recovers_once() {
        let mut sampler = sampler();
        // Input latency threshold is 50 ms.
        sampler.record(SloMetric::InputLatencyMs, 80.0, 0);
        let tick = sampler.tick(1_000_000);
        assert_eq!(tick.alarms.len(), 1);
        assert_eq!(tick.alarms[0].state, SloAlarmState::Breached);
        assert_eq!(tick.alarms[0].severity, SloSeverity::Critical);

        // Still breached: no duplicate alarm.
        sampler.record(SloMetric::InputLatencyMs, 70.0, 1_100_000);
        let tick = sampler.tick(2_000_000);
        assert!(tick.alarms.is_empty());

        // Recovery emits exactly one transition.
        sampler.record(SloMetric::InputLatencyMs, 10.0, 2_100_000);
        let tick = sampler.tick(3_000_000);
        assert_eq!(tick.alarms.len(), 1);
        assert_eq!(tick.alarms[0].state, SloAlarmState::Recovered);
    }

    #[test]
    fn severity_is_warning_below_the_critical_ratio() {
        let mut sampler = sampler();
        // Jitter threshold 30 ms; 33 is breached but under 1.2x.
        sampler.record(SloMetric::JitterMs, 33.0, 0);
        let tick = sampler.tick(1_000_000);
        assert_eq!(tick.alarms[0].severity, SloSeverity::Warning);
    }

    #[test]
    fn empty_window_emits_nothing_until_data_arrives() {
        let mut sampler = sampler();
        let tick = sampler.tick(10_000_000);
        assert!(tick.samples.is_empty());
    }
}
