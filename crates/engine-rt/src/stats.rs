//! Process-time counters published by the realtime thread.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use atomic_float::{AtomicF32, AtomicF64};

/// Counters shared between the realtime thread (writer) and control threads
/// (readers). Every field is independently atomic; readers may observe values
/// from adjacent cycles.
#[derive(Debug)]
pub struct CycleStats {
    epoch: Instant,
    sample_time: AtomicU64,
    cycle_start_samples: AtomicU64,
    cycle_start_ns: AtomicU64,
    period_ns: AtomicF64,
    buffer_size: AtomicU32,
    sample_rate: AtomicU32,
    dsp_load: AtomicF32,
    xruns: AtomicU64,
    midi_drops: AtomicU64,
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleStats {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            sample_time: AtomicU64::new(0),
            cycle_start_samples: AtomicU64::new(0),
            cycle_start_ns: AtomicU64::new(0),
            period_ns: AtomicF64::new(0.0),
            buffer_size: AtomicU32::new(0),
            sample_rate: AtomicU32::new(0),
            dsp_load: AtomicF32::new(0.0),
            xruns: AtomicU64::new(0),
            midi_drops: AtomicU64::new(0),
        }
    }

    /// Nanoseconds since these stats were created.
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64
    }

    /// Seconds since these stats were created, for clock tracking.
    pub fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn configure(&self, sample_rate: u32, buffer_size: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.buffer_size.store(buffer_size, Ordering::Relaxed);
        let nominal = if sample_rate == 0 {
            0.0
        } else {
            f64::from(buffer_size) * 1e9 / f64::from(sample_rate)
        };
        self.period_ns.store(nominal, Ordering::Relaxed);
    }

    /// Clears the sample counter for a fresh session.
    pub fn reset(&self) {
        self.sample_time.store(0, Ordering::Relaxed);
        self.cycle_start_samples.store(0, Ordering::Relaxed);
        self.cycle_start_ns.store(self.now_ns(), Ordering::Relaxed);
        self.dsp_load.store(0.0, Ordering::Relaxed);
    }

    /// Marks the start of a cycle; `period` is the current estimate of one
    /// period's wall-clock length.
    pub fn begin_cycle(&self, period: Duration) {
        self.cycle_start_ns.store(self.now_ns(), Ordering::Relaxed);
        self.cycle_start_samples
            .store(self.sample_time.load(Ordering::Relaxed), Ordering::Relaxed);
        if !period.is_zero() {
            self.period_ns
                .store(period.as_secs_f64() * 1e9, Ordering::Relaxed);
        }
    }

    pub fn advance(&self, frames: u32) {
        self.sample_time
            .fetch_add(u64::from(frames), Ordering::Relaxed);
    }

    pub fn sample_time(&self) -> u64 {
        self.sample_time.load(Ordering::Relaxed)
    }

    pub fn sample_time_at_cycle_start(&self) -> u64 {
        self.cycle_start_samples.load(Ordering::Relaxed)
    }

    /// Elapsed time since the cycle started, converted to samples and clamped
    /// to one period.
    pub fn samples_since_cycle_start(&self) -> u32 {
        let buffer_size = self.buffer_size.load(Ordering::Relaxed);
        let period_ns = self.period_ns.load(Ordering::Relaxed);
        if period_ns <= 0.0 {
            return 0;
        }
        let start = self.cycle_start_ns.load(Ordering::Relaxed);
        let elapsed = self.now_ns().saturating_sub(start) as f64;
        let samples = elapsed / period_ns * f64::from(buffer_size);
        samples.min(f64::from(buffer_size)) as u32
    }

    /// Smoothed DSP load in percent.
    pub fn dsp_load(&self) -> f32 {
        self.dsp_load.load(Ordering::Relaxed)
    }

    pub fn set_dsp_load(&self, percent: f32) {
        self.dsp_load.store(percent, Ordering::Relaxed);
    }

    pub fn register_xrun(&self) -> u64 {
        self.xruns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn xrun_count(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    /// Counts an outgoing MIDI event the device refused.
    pub fn register_midi_drop(&self) -> u64 {
        self.midi_drops.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn midi_drop_count(&self) -> u64 {
        self.midi_drops.load(Ordering::Relaxed)
    }
}

/// Realtime-local DSP load filter. Rises immediately, decays slowly.
#[derive(Debug, Clone)]
pub struct DspLoadMeter {
    value: f32,
    decay: f32,
}

impl Default for DspLoadMeter {
    fn default() -> Self {
        Self::new(0.05)
    }
}

impl DspLoadMeter {
    pub fn new(decay: f32) -> Self {
        Self {
            value: 0.0,
            decay: decay.clamp(0.0, 1.0),
        }
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }

    /// Folds one cycle in; returns the smoothed load in percent.
    pub fn update(&mut self, elapsed: Duration, budget: Duration) -> f32 {
        if budget.is_zero() {
            return self.value;
        }
        let load = (elapsed.as_secs_f32() / budget.as_secs_f32() * 100.0).min(100.0);
        if load > self.value || load >= 95.0 {
            self.value = load;
        } else {
            self.value += self.decay * (load - self.value);
        }
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_rises_fast_and_decays_slowly() {
        let mut meter = DspLoadMeter::default();
        let budget = Duration::from_millis(10);
        assert_eq!(meter.update(Duration::from_millis(5), budget), 50.0);
        let after = meter.update(Duration::from_millis(1), budget);
        assert!(after < 50.0 && after > 45.0, "{after}");
        assert_eq!(meter.update(Duration::from_millis(20), budget), 100.0);
    }

    #[test]
    fn cycle_counters_follow_the_loop() {
        let stats = CycleStats::new();
        stats.configure(48_000, 256);
        stats.begin_cycle(Duration::ZERO);
        stats.advance(256);
        stats.begin_cycle(Duration::ZERO);
        stats.advance(256);
        assert_eq!(stats.sample_time(), 512);
        assert_eq!(stats.sample_time_at_cycle_start(), 256);
        assert!(stats.samples_since_cycle_start() <= 256);
        assert_eq!(stats.register_xrun(), 1);
        assert_eq!(stats.register_midi_drop(), 1);
        stats.reset();
        assert_eq!(stats.sample_time(), 0);
        assert_eq!(stats.xrun_count(), 1);
        assert_eq!(stats.midi_drop_count(), 1);
    }
}
