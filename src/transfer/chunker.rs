//! Adaptive chunk sizing from observed throughput.
//!
//! The controller samples the byte rate every 500 ms, or sooner once ten
//! chunks' worth of bytes have moved, smooths it with an exponential moving
//! average, maps the smoothed rate to a target size, and steps a quarter of
//! the way toward that target. Sizes stay inside [4 KiB, 64 KiB].

use std::time::{Duration, Instant};

pub const MIN_CHUNK: usize = 4 * 1024;
pub const MAX_CHUNK: usize = 64 * 1024;
const START_CHUNK: usize = 16 * 1024;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
const SAMPLE_BYTES_FACTOR: u64 = 10;
const EMA_KEEP: f64 = 0.7;
const EMA_BLEND: f64 = 0.3;
const STEP_FRACTION: f64 = 0.25;

const KIB: f64 = 1024.0;

pub struct ChunkController {
    current: usize,
    ema_rate: Option<f64>,
    interval_bytes: u64,
    interval_start: Instant,
}

impl ChunkController {
    pub fn new(now: Instant) -> Self {
        ChunkController {
            current: START_CHUNK,
            ema_rate: None,
            interval_bytes: 0,
            interval_start: now,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.current
    }

    /// Account for transferred bytes and resize when a sample interval
    /// completes.
    pub fn record(&mut self, bytes: usize, now: Instant) {
        self.interval_bytes += bytes as u64;

        let elapsed = now.saturating_duration_since(self.interval_start);
        let enough_bytes = self.interval_bytes >= SAMPLE_BYTES_FACTOR * self.current as u64;
        if elapsed < SAMPLE_INTERVAL && !enough_bytes {
            return;
        }
        if elapsed.is_zero() {
            return;
        }

        let sample = self.interval_bytes as f64 / elapsed.as_secs_f64();
        let smoothed = match self.ema_rate {
            Some(ema) => EMA_KEEP * ema + EMA_BLEND * sample,
            None => sample,
        };
        self.ema_rate = Some(smoothed);

        let target = target_for_rate(smoothed);
        let step = (target as f64 - self.current as f64) * STEP_FRACTION;
        let next = (self.current as f64 + step).round() as usize;
        self.current = next.clamp(MIN_CHUNK, MAX_CHUNK);

        self.interval_bytes = 0;
        self.interval_start = now;
    }
}

fn target_for_rate(bytes_per_sec: f64) -> usize {
    if bytes_per_sec < 50.0 * KIB {
        4 * 1024
    } else if bytes_per_sec < 200.0 * KIB {
        8 * 1024
    } else if bytes_per_sec < 500.0 * KIB {
        16 * 1024
    } else if bytes_per_sec < 1024.0 * KIB {
        32 * 1024
    } else {
        64 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (ChunkController, Instant) {
        let start = Instant::now();
        (ChunkController::new(start), start)
    }

    #[test]
    fn starts_at_sixteen_kib() {
        let (ctrl, _) = controller();
        assert_eq!(ctrl.chunk_size(), START_CHUNK);
    }

    #[test]
    fn no_resize_before_interval() {
        let (mut ctrl, start) = controller();
        ctrl.record(1024, start + Duration::from_millis(100));
        assert_eq!(ctrl.chunk_size(), START_CHUNK);
    }

    #[test]
    fn slow_link_steps_down_toward_min() {
        let (mut ctrl, start) = controller();
        // 10 KiB over 1 s is well under the 50 KiB/s bucket.
        ctrl.record(10 * 1024, start + Duration::from_secs(1));
        // One damped step: 16 KiB + (4 KiB - 16 KiB) / 4 = 13 KiB.
        assert_eq!(ctrl.chunk_size(), 13 * 1024);
    }

    #[test]
    fn fast_link_steps_up_toward_max() {
        let (mut ctrl, start) = controller();
        // 2 MiB over 1 s maps to the 64 KiB bucket.
        ctrl.record(2 * 1024 * 1024, start + Duration::from_secs(1));
        assert_eq!(ctrl.chunk_size(), 28 * 1024);
    }

    #[test]
    fn converges_and_stays_clamped() {
        let (mut ctrl, start) = controller();
        let mut now = start;
        for _ in 0..64 {
            now += Duration::from_secs(1);
            ctrl.record(8 * 1024 * 1024, now);
            assert!(ctrl.chunk_size() >= MIN_CHUNK);
            assert!(ctrl.chunk_size() <= MAX_CHUNK);
        }
        assert_eq!(ctrl.chunk_size(), MAX_CHUNK);

        for _ in 0..128 {
            now += Duration::from_secs(1);
            ctrl.record(1024, now);
            assert!(ctrl.chunk_size() >= MIN_CHUNK);
        }
        assert_eq!(ctrl.chunk_size(), MIN_CHUNK);
    }

    #[test]
    fn step_never_exceeds_quarter_of_gap() {
        let (mut ctrl, start) = controller();
        let mut now = start;
        let mut previous = ctrl.chunk_size() as f64;
        for i in 0..20 {
            now += Duration::from_secs(1);
            ctrl.record(4 * 1024 * 1024, now);
            let current = ctrl.chunk_size() as f64;
            let gap = (MAX_CHUNK as f64 - previous).abs();
            assert!(
                (current - previous).abs() <= gap * STEP_FRACTION + 1.0,
                "iteration {i}: moved {} with gap {}",
                current - previous,
                gap
            );
            previous = current;
        }
    }

    #[test]
    fn byte_threshold_triggers_early_sample() {
        let (mut ctrl, start) = controller();
        // Ten chunks' worth transferred in 50 ms: sampled despite the short
        // interval, and the implied rate is huge.
        ctrl.record(
            SAMPLE_BYTES_FACTOR as usize * START_CHUNK,
            start + Duration::from_millis(50),
        );
        assert!(ctrl.chunk_size() > START_CHUNK);
    }

    #[test]
    fn bucket_boundaries() {
        assert_eq!(target_for_rate(49.0 * KIB), 4 * 1024);
        assert_eq!(target_for_rate(50.0 * KIB), 8 * 1024);
        assert_eq!(target_for_rate(199.0 * KIB), 8 * 1024);
        assert_eq!(target_for_rate(200.0 * KIB), 16 * 1024);
        assert_eq!(target_for_rate(499.0 * KIB), 16 * 1024);
        assert_eq!(target_for_rate(500.0 * KIB), 32 * 1024);
        assert_eq!(target_for_rate(1023.0 * KIB), 32 * 1024);
        assert_eq!(target_for_rate(1024.0 * KIB), 64 * 1024);
    }
}
