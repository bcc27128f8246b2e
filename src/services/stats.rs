use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Returned by [`RollingStats::percentile`] when no samples are in the window.
/// Pessimistic on purpose: an empty history means we know nothing about the
/// upstream, so the adaptive timeout starts from its ceiling.
const EMPTY_PERCENTILE_MS: f64 = 50_000.0;

/// Time-windowed latency sample buffer producing percentiles.
///
/// Samples older than the window are purged lazily on every read and write,
/// so memory stays bounded without a background task.
pub struct RollingStats {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, f64)>>,
}

impl RollingStats {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a latency sample in milliseconds.
    pub fn add_sample(&self, value_ms: f64) {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge(&mut samples, now, self.window);
        samples.push_back((now, value_ms));
    }

    /// The p-th percentile (0–100) over samples still inside the window.
    pub fn percentile(&self, p: f64) -> f64 {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge(&mut samples, now, self.window);

        if samples.is_empty() {
            return EMPTY_PERCENTILE_MS;
        }

        let mut values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let rank = ((p / 100.0) * values.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(values.len() - 1);
        values[idx]
    }

    /// Number of live samples (purges expired ones first).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        Self::purge(&mut samples, now, self.window);
        samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(samples: &mut VecDeque<(Instant, f64)>, now: Instant, window: Duration) {
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}
