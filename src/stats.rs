//! Frame timing observers.

use std::time::Duration;

use parking_lot::Mutex;

/// Receives timings as frames are encoded and retired.
///
/// `record_gpu_time` is called from the device's completion thread.
pub trait StatsSink: Send + Sync {
    fn record_gpu_time(&self, duration: Duration);
    fn record_encode_time(&self, duration: Duration);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatsSink;

impl StatsSink for NullStatsSink {
    fn record_gpu_time(&self, _duration: Duration) {}
    fn record_encode_time(&self, _duration: Duration) {}
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    gpu_time: Duration,
    frames_completed: u64,
    encode_time: Duration,
    frames_encoded: u64,
}

/// Running timing totals.
#[derive(Debug, Default)]
pub struct RenderStats {
    totals: Mutex<Totals>,
}

impl RenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gpu_time_sum(&self) -> Duration {
        self.totals.lock().gpu_time
    }

    pub fn gpu_time_avg(&self) -> Duration {
        let totals = *self.totals.lock();
        average(totals.gpu_time, totals.frames_completed)
    }

    pub fn encode_time_sum(&self) -> Duration {
        self.totals.lock().encode_time
    }

    pub fn encode_time_avg(&self) -> Duration {
        let totals = *self.totals.lock();
        average(totals.encode_time, totals.frames_encoded)
    }

    pub fn frames_completed(&self) -> u64 {
        self.totals.lock().frames_completed
    }

    pub fn frames_encoded(&self) -> u64 {
        self.totals.lock().frames_encoded
    }

    pub fn reset(&self) {
        *self.totals.lock() = Totals::default();
    }
}

fn average(sum: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(count) => sum / count,
        Err(_) => Duration::from_secs_f64(sum.as_secs_f64() / count as f64),
    }
}

impl StatsSink for RenderStats {
    fn record_gpu_time(&self, duration: Duration) {
        let mut totals = self.totals.lock();
        totals.gpu_time += duration;
        totals.frames_completed += 1;
    }

    fn record_encode_time(&self, duration: Duration) {
        let mut totals = self.totals.lock();
        totals.encode_time += duration;
        totals.frames_encoded += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_over_recorded_frames() {
        let stats = RenderStats::new();
        assert_eq!(stats.gpu_time_avg(), Duration::ZERO);

        stats.record_gpu_time(Duration::from_millis(4));
        stats.record_gpu_time(Duration::from_millis(8));
        stats.record_encode_time(Duration::from_micros(300));

        assert_eq!(stats.frames_completed(), 2);
        assert_eq!(stats.gpu_time_sum(), Duration::from_millis(12));
        assert_eq!(stats.gpu_time_avg(), Duration::from_millis(6));
        assert_eq!(stats.encode_time_avg(), Duration::from_micros(300));

        stats.reset();
        assert_eq!(stats.frames_encoded(), 0);
    }
}
