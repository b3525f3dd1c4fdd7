//! # Overview
//!
//! The Telemetry Sink boundary the executor reports wait and execution
//! durations through. [`ChannelTelemetrySink`] is the default implementation:
//! a channel-fed async consumer in the shape of a producer/consumer pair,
//! modeled on the same decoupling a metrics-shipping client would use, except
//! the consumer here aggregates into an in-process [`RollingHistogram`]
//! instead of writing to a network client.
//!
//! A [`NoopTelemetrySink`] is provided for tests and embeddings that don't
//! care about telemetry at all.
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

pub mod error;
pub mod histogram;

pub use error::TelemetryError;
pub use histogram::RollingHistogram;

/// Which duration a sample belongs to, scoped per task type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Kind {
    Wait,
    Execution,
}

#[derive(Debug, Clone)]
struct Observation {
    task_type: String,
    kind: Kind,
    duration: std::time::Duration,
}

/// Snapshot of p50/p90 for one task type's wait or execution duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quantiles {
    pub p50_ms: Option<u64>,
    pub p90_ms: Option<u64>,
}

/// The telemetry boundary: the executor calls these on group wait
/// completion and subtask completion. Implementations must not block the
/// caller.
pub trait TelemetrySink: Send + Sync {
    fn record_wait_duration(&self, task_type: &str, duration: std::time::Duration);

    fn record_execution_duration(&self, task_type: &str, duration: std::time::Duration);
}

/// Discards every observation. Useful in tests and for embedding this engine
/// somewhere telemetry isn't wired up yet.
#[derive(Default)]
pub struct NoopTelemetrySink;

impl TelemetrySink for NoopTelemetrySink {
    fn record_wait_duration(&self, _task_type: &str, _duration: std::time::Duration) {}
    fn record_execution_duration(&self, _task_type: &str, _duration: std::time::Duration) {}
}

type HistogramMap = DashMap<(String, &'static str), Mutex<RollingHistogram>>;

/// Default [`TelemetrySink`]: observations are pushed onto an unbounded
/// channel and aggregated by a background consumer task into rolling
/// one-hour histograms, queryable per task type via [`Self::quantiles`].
pub struct ChannelTelemetrySink {
    tx: UnboundedSender<Observation>,
    cancel: CancellationToken,
    histograms: Arc<HistogramMap>,
}

impl ChannelTelemetrySink {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        let cancel = CancellationToken::new();
        let histograms: Arc<HistogramMap> = Arc::new(DashMap::new());

        let consumer = TelemetryConsumer {
            rx,
            cancel: cancel.clone(),
            histograms: histograms.clone(),
        };
        tokio::spawn(consumer.run());

        Self { tx, cancel, histograms }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn quantiles_for(&self, task_type: &str, kind: &'static str) -> Quantiles {
        match self.histograms.get(&(task_type.to_string(), kind)) {
            Some(hist) => {
                let hist = hist.lock();
                Quantiles { p50_ms: hist.p50(), p90_ms: hist.p90() }
            }
            None => Quantiles::default(),
        }
    }

    pub fn wait_quantiles(&self, task_type: &str) -> Quantiles {
        self.quantiles_for(task_type, "wait")
    }

    pub fn execution_quantiles(&self, task_type: &str) -> Quantiles {
        self.quantiles_for(task_type, "execution")
    }
}

impl Default for ChannelTelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for ChannelTelemetrySink {
    fn record_wait_duration(&self, task_type: &str, duration: std::time::Duration) {
        let _ = self.tx.send(Observation {
            task_type: task_type.to_string(),
            kind: Kind::Wait,
            duration,
        });
    }

    fn record_execution_duration(&self, task_type: &str, duration: std::time::Duration) {
        let _ = self.tx.send(Observation {
            task_type: task_type.to_string(),
            kind: Kind::Execution,
            duration,
        });
    }
}

/// Consumes [`Observation`]s asynchronously, folding them into the shared
/// histogram map. Runs until the sink is dropped or cancelled.
struct TelemetryConsumer {
    rx: UnboundedReceiver<Observation>,
    cancel: CancellationToken,
    histograms: Arc<HistogramMap>,
}

impl TelemetryConsumer {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => {
                    match msg {
                        Some(observation) => self.process(observation),
                        None => break,
                    }
                }
            }
        }
    }

    fn process(&mut self, observation: Observation) {
        let kind = match observation.kind {
            Kind::Wait => "wait",
            Kind::Execution => "execution",
        };
        let key = (observation.task_type.clone(), kind);
        let entry = self
            .histograms
            .entry(key)
            .or_insert_with(|| Mutex::new(RollingHistogram::new()));
        entry.lock().observe(observation.duration, Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn recorded_durations_surface_as_quantiles() {
        let sink = ChannelTelemetrySink::new();
        sink.record_wait_duration("demo", Duration::from_millis(10));
        sink.record_wait_duration("demo", Duration::from_millis(20));

        // allow the consumer task a turn to process the channel
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let q = sink.wait_quantiles("demo");
        assert!(q.p50_ms.is_some());
    }

    #[tokio::test]
    async fn unknown_task_type_has_no_quantiles() {
        let sink = ChannelTelemetrySink::new();
        let q = sink.execution_quantiles("never-seen");
        assert_eq!(q.p50_ms, None);
        assert_eq!(q.p90_ms, None);
    }

    #[test]
    fn noop_sink_accepts_everything() {
        let sink = NoopTelemetrySink;
        sink.record_wait_duration("demo", Duration::from_secs(1));
        sink.record_execution_duration("demo", Duration::from_secs(1));
    }
}
