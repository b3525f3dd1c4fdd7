//! A rolling one-hour histogram over observed durations, used to answer
//! "what's p50/p90 wait time right now" without shipping samples anywhere.
use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

const WINDOW: chrono::Duration = chrono::Duration::hours(1);

struct Sample {
    at: DateTime<Utc>,
    value_ms: u64,
}

/// Keeps every observation from the trailing window and answers quantile
/// queries by sorting on demand; fine at the sample rates this engine sees
/// (per-subtask, per-group), not meant for high-frequency metrics.
#[derive(Default)]
pub struct RollingHistogram {
    samples: VecDeque<Sample>,
}

impl RollingHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, value: Duration, now: DateTime<Utc>) {
        self.evict(now);
        self.samples.push_back(Sample {
            at: now,
            value_ms: value.as_millis() as u64,
        });
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.samples.front() {
            if now - front.at > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the value at the given quantile (0.0..=1.0) in milliseconds,
    /// or `None` if the window holds no samples.
    pub fn quantile(&self, q: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut values: Vec<u64> = self.samples.iter().map(|s| s.value_ms).collect();
        values.sort_unstable();
        let idx = ((values.len() - 1) as f64 * q).round() as usize;
        values.get(idx).copied()
    }

    pub fn p50(&self) -> Option<u64> {
        self.quantile(0.5)
    }

    pub fn p90(&self) -> Option<u64> {
        self.quantile(0.9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_over_known_samples() {
        let mut hist = RollingHistogram::new();
        let now = Utc::now();
        for ms in [10, 20, 30, 40, 50] {
            hist.observe(Duration::from_millis(ms), now);
        }
        assert_eq!(hist.p50(), Some(30));
        assert_eq!(hist.p90(), Some(50));
    }

    #[test]
    fn evicts_samples_older_than_window() {
        let mut hist = RollingHistogram::new();
        let old = Utc::now() - chrono::Duration::hours(2);
        hist.observe(Duration::from_millis(100), old);
        hist.observe(Duration::from_millis(5), Utc::now());
        assert_eq!(hist.len(), 1);
        assert_eq!(hist.p50(), Some(5));
    }

    #[test]
    fn empty_histogram_has_no_quantiles() {
        let hist = RollingHistogram::new();
        assert_eq!(hist.p50(), None);
    }
}
