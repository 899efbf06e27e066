//! Admission control over the ingestion topic.
//!
//! A single counter tracks records that entered the pipeline but have not completed yet.
//! Ingestion consumers are paused once it reaches the high watermark and resumed once it
//! drains to the low watermark: the gap between the two keeps consumers from flapping when
//! the count hovers around a single threshold, and caps how much of one large import can be
//! in flight ahead of the smaller ones sharing the pipeline.
//!
//! The counter lives in memory and belongs to one `FlowControl` instance. Every process
//! runs its own, so several worker replicas each admit up to the high watermark, and a
//! restart forgets whatever was in flight.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::FlowControlConfig;
use crate::consumer::ConsumerRegistry;
use crate::metrics_consts::{
    CONSUMERS_PAUSED, CONSUMERS_RESUMED, CONSUMER_SIGNAL_FAILED, COUNTER_UNDERFLOW,
    IN_FLIGHT_RECORDS,
};

pub struct FlowControl {
    config: FlowControlConfig,
    topic: String,
    registry: Arc<ConsumerRegistry>,
    in_flight: AtomicU64,
}

/// A point-in-time view of flow control, for the state endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FlowControlState {
    pub enabled: bool,
    pub topic: String,
    pub in_flight: u64,
    pub high_watermark: u64,
    pub low_watermark: u64,
    pub consumers: Vec<ConsumerState>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConsumerState {
    pub name: String,
    pub demand: u64,
}

#[derive(Clone, Copy)]
enum Signal {
    Pause,
    Resume,
}

impl Signal {
    fn as_str(&self) -> &'static str {
        match self {
            Signal::Pause => "pause",
            Signal::Resume => "resume",
        }
    }
}

impl FlowControl {
    /// Govern the consumers registered for `topic` in `registry`.
    pub fn new(config: FlowControlConfig, topic: &str, registry: Arc<ConsumerRegistry>) -> Self {
        if !config.enabled {
            info!(topic, "flow control is disabled");
        }
        Self {
            config,
            topic: topic.to_owned(),
            registry,
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Count a chunk's records as in flight, pausing ingestion if that reaches the high watermark.
    pub fn on_chunk_admitted(&self, record_count: u64) {
        if !self.config.enabled {
            return;
        }

        let in_flight = self
            .in_flight
            .fetch_add(record_count, Ordering::SeqCst)
            .saturating_add(record_count);
        metrics::gauge!(IN_FLIGHT_RECORDS).set(in_flight as f64);
        debug!(record_count, in_flight, "chunk admitted");

        if in_flight >= self.config.high_watermark {
            self.signal_consumers(Signal::Pause, in_flight);
        }
    }

    /// Take back the records of a chunk that was delivered again after being counted.
    ///
    /// Without this correction a redelivery would keep the counter above the low watermark
    /// forever, and ingestion would never resume.
    pub fn on_chunk_duplicate_detected(&self, record_count: u64) {
        if !self.config.enabled {
            return;
        }

        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(record_count))
            })
            .unwrap_or_else(|current| current);

        if previous < record_count {
            warn!(
                record_count,
                in_flight = previous,
                "duplicate chunk correction larger than the in-flight count, clamping to zero"
            );
            metrics::counter!(COUNTER_UNDERFLOW, &[("source", "duplicate")]).increment(1);
        }

        let in_flight = previous.saturating_sub(record_count);
        metrics::gauge!(IN_FLIGHT_RECORDS).set(in_flight as f64);
        debug!(record_count, in_flight, "duplicate chunk corrected");

        self.maybe_resume(in_flight);
    }

    /// Mark one record as done, resuming ingestion if the count drained to the low watermark.
    pub fn on_record_completed(&self) {
        if !self.config.enabled {
            return;
        }

        // Records of imports that never went through admission complete against an empty
        // counter. It stays at zero and resuming is skipped, so such a record can't trigger
        // a resume on its own.
        let decremented = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            });

        match decremented {
            Ok(previous) => {
                let in_flight = previous - 1;
                metrics::gauge!(IN_FLIGHT_RECORDS).set(in_flight as f64);
                self.maybe_resume(in_flight);
            }
            Err(_) => {
                warn!("record completed with no records in flight, counter stays at zero");
                metrics::counter!(COUNTER_UNDERFLOW, &[("source", "completion")]).increment(1);
            }
        }
    }

    pub fn state(&self) -> FlowControlState {
        let consumers = self
            .registry
            .handles_for(&self.topic)
            .iter()
            .map(|handle| ConsumerState {
                name: handle.name().to_owned(),
                demand: handle.current_demand(),
            })
            .collect();

        FlowControlState {
            enabled: self.config.enabled,
            topic: self.topic.clone(),
            in_flight: self.in_flight(),
            high_watermark: self.config.high_watermark,
            low_watermark: self.config.low_watermark,
            consumers,
        }
    }

    fn maybe_resume(&self, in_flight: u64) {
        if in_flight <= self.config.low_watermark {
            self.signal_consumers(Signal::Resume, in_flight);
        }
    }

    /// Whether the counter still calls for `signal`. Concurrent signals may have moved it since
    /// the decision was made.
    fn still_applies(&self, signal: Signal) -> bool {
        match signal {
            Signal::Pause => self.in_flight() >= self.config.high_watermark,
            Signal::Resume => self.in_flight() <= self.config.low_watermark,
        }
    }

    /// Pause every consumer that is still pulling, or resume every consumer that is paused.
    /// A failing consumer is logged and skipped, the others are still signalled.
    ///
    /// The counter is read again before each consumer, so a resume racing with an admission
    /// that crossed the high watermark stops instead of undoing the pause.
    fn signal_consumers(&self, signal: Signal, in_flight: u64) {
        for handle in self.registry.handles_for(&self.topic) {
            if !self.still_applies(signal) {
                debug!(
                    consumer = handle.name(),
                    in_flight = self.in_flight(),
                    "skipping {} of ingestion consumer, counter moved",
                    signal.as_str()
                );
                break;
            }

            let demand = handle.current_demand();
            let result = match signal {
                Signal::Pause if demand > 0 => handle.pause(),
                Signal::Resume if demand == 0 => handle.resume(),
                _ => continue,
            };

            match result {
                Ok(()) => {
                    info!(
                        consumer = handle.name(),
                        in_flight,
                        "{} ingestion consumer",
                        signal.as_str()
                    );
                    let counter = match signal {
                        Signal::Pause => CONSUMERS_PAUSED,
                        Signal::Resume => CONSUMERS_RESUMED,
                    };
                    metrics::counter!(counter).increment(1);
                }
                Err(error) => {
                    warn!(
                        consumer = handle.name(),
                        in_flight,
                        "failed to {} ingestion consumer: {}",
                        signal.as_str(),
                        error
                    );
                    metrics::counter!(CONSUMER_SIGNAL_FAILED, &[("signal", signal.as_str())])
                        .increment(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ConsumerHandle;
    use crate::test_utils::MockConsumer;

    const TOPIC: &str = "chunks";

    fn governed(
        config: FlowControlConfig,
        consumers: usize,
    ) -> (FlowControl, Vec<Arc<MockConsumer>>) {
        let registry = Arc::new(ConsumerRegistry::new());
        let mocks: Vec<Arc<MockConsumer>> = (0..consumers)
            .map(|i| MockConsumer::new(&format!("{TOPIC}-{i}")))
            .collect();
        for mock in &mocks {
            registry.register(TOPIC, mock.clone());
        }
        (FlowControl::new(config, TOPIC, registry), mocks)
    }

    #[test]
    fn test_pause_at_high_and_resume_at_low() {
        let (flow, consumers) = governed(FlowControlConfig::new(true, 20, 10), 2);

        flow.on_chunk_admitted(25);
        assert_eq!(flow.in_flight(), 25);
        assert!(consumers.iter().all(|c| c.is_paused()));

        for _ in 0..14 {
            flow.on_record_completed();
        }
        assert_eq!(flow.in_flight(), 11);
        assert!(consumers.iter().all(|c| c.is_paused()));

        flow.on_record_completed();
        assert_eq!(flow.in_flight(), 10);
        assert!(consumers.iter().all(|c| !c.is_paused()));
        assert!(consumers.iter().all(|c| c.resume_calls() == 1));
    }

    #[test]
    fn test_reaching_high_watermark_exactly_pauses() {
        let (flow, consumers) = governed(FlowControlConfig::new(true, 20, 10), 1);

        flow.on_chunk_admitted(19);
        assert!(!consumers[0].is_paused());

        flow.on_chunk_admitted(1);
        assert!(consumers[0].is_paused());
    }

    #[test]
    fn test_paused_consumers_are_not_paused_again() {
        let (flow, consumers) = governed(FlowControlConfig::new(true, 20, 10), 1);

        flow.on_chunk_admitted(20);
        flow.on_chunk_admitted(5);
        flow.on_chunk_admitted(5);

        assert_eq!(consumers[0].pause_calls(), 1);
    }

    #[test]
    fn test_active_consumers_are_not_resumed_again() {
        let (flow, consumers) = governed(FlowControlConfig::new(true, 20, 10), 1);

        flow.on_chunk_admitted(5);
        for _ in 0..5 {
            flow.on_record_completed();
        }

        assert_eq!(consumers[0].resume_calls(), 0);
        assert_eq!(flow.in_flight(), 0);
    }

    #[test]
    fn test_never_resumed_above_low_watermark() {
        let (flow, consumers) = governed(FlowControlConfig::new(true, 20, 10), 1);

        // Interleave admissions and completions while staying inside the dead zone.
        flow.on_chunk_admitted(30);
        for round in 0..50 {
            if round % 3 == 0 {
                flow.on_chunk_admitted(1);
            } else {
                flow.on_record_completed();
            }
            if flow.in_flight() > 10 {
                assert!(consumers[0].is_paused(), "resumed at {}", flow.in_flight());
            }
        }
    }

    #[test]
    fn test_resume_stops_once_an_admission_crosses_high_watermark() {
        let (flow, consumers) = governed(FlowControlConfig::new(true, 20, 10), 2);
        let flow = Arc::new(flow);

        flow.on_chunk_admitted(20);
        assert!(consumers.iter().all(|c| c.is_paused()));

        // An admission lands while the resume is still going through the consumers.
        let admitting = flow.clone();
        consumers[0].set_after_resume(move || admitting.on_chunk_admitted(15));

        for _ in 0..10 {
            flow.on_record_completed();
        }

        assert_eq!(flow.in_flight(), 25);
        assert_eq!(consumers[0].resume_calls(), 1);
        assert!(consumers[0].is_paused());
        assert_eq!(consumers[1].resume_calls(), 0);
        assert!(consumers[1].is_paused());
    }

    #[test]
    fn test_duplicate_correction_restores_count() {
        let (flow, _) = governed(FlowControlConfig::new(true, 100, 10), 1);

        flow.on_chunk_admitted(7);
        flow.on_chunk_admitted(50);
        flow.on_chunk_duplicate_detected(50);

        assert_eq!(flow.in_flight(), 7);
    }

    #[test]
    fn test_duplicate_correction_can_resume() {
        let (flow, consumers) = governed(FlowControlConfig::new(true, 20, 10), 1);

        flow.on_chunk_admitted(10);
        flow.on_chunk_admitted(10);
        assert!(consumers[0].is_paused());

        flow.on_chunk_duplicate_detected(10);
        assert_eq!(flow.in_flight(), 10);
        assert!(!consumers[0].is_paused());
    }

    #[test]
    fn test_duplicate_correction_clamps_at_zero() {
        let (flow, _) = governed(FlowControlConfig::new(true, 20, 10), 1);

        flow.on_chunk_admitted(3);
        flow.on_chunk_duplicate_detected(5);

        assert_eq!(flow.in_flight(), 0);
    }

    #[test]
    fn test_completion_underflow_clamps_and_skips_resume() {
        let (flow, consumers) = governed(FlowControlConfig::new(true, 20, 10), 1);
        consumers[0].pause().expect("mock pause never fails");

        flow.on_record_completed();

        assert_eq!(flow.in_flight(), 0);
        assert!(consumers[0].is_paused());
        assert_eq!(consumers[0].resume_calls(), 0);
    }

    #[test]
    fn test_disabled_never_signals() {
        let (flow, consumers) = governed(FlowControlConfig::new(false, 20, 10), 2);

        flow.on_chunk_admitted(1000);
        for _ in 0..1000 {
            flow.on_record_completed();
        }
        flow.on_chunk_duplicate_detected(10);

        for consumer in consumers {
            assert_eq!(consumer.pause_calls(), 0);
            assert_eq!(consumer.resume_calls(), 0);
        }
    }

    #[test]
    fn test_failing_consumer_does_not_stop_the_others() {
        let (flow, consumers) = governed(FlowControlConfig::new(true, 20, 10), 3);
        consumers[1].set_failing(true);

        flow.on_chunk_admitted(20);

        assert!(consumers[0].is_paused());
        assert!(!consumers[1].is_paused());
        assert_eq!(consumers[1].pause_calls(), 1);
        assert!(consumers[2].is_paused());

        // The failed one is retried at the next admission, as it is still pulling.
        consumers[1].set_failing(false);
        flow.on_chunk_admitted(1);
        assert!(consumers[1].is_paused());
        assert_eq!(consumers[0].pause_calls(), 1);
    }

    #[test]
    fn test_other_topics_are_left_alone() {
        let registry = Arc::new(ConsumerRegistry::new());
        let ingestion = MockConsumer::new("chunks-0");
        let completions = MockConsumer::new("completions-0");
        registry.register(TOPIC, ingestion.clone());
        registry.register("completions", completions.clone());

        let flow = FlowControl::new(FlowControlConfig::new(true, 20, 10), TOPIC, registry);
        flow.on_chunk_admitted(50);

        assert!(ingestion.is_paused());
        assert_eq!(completions.pause_calls(), 0);
    }

    #[test]
    fn test_state_reports_consumers() {
        let (flow, _) = governed(FlowControlConfig::new(true, 20, 10), 2);
        flow.on_chunk_admitted(21);

        let state = flow.state();
        assert_eq!(state.in_flight, 21);
        assert_eq!(state.topic, TOPIC);
        assert_eq!(
            state.consumers,
            vec![
                ConsumerState {
                    name: "chunks-0".to_owned(),
                    demand: 0
                },
                ConsumerState {
                    name: "chunks-1".to_owned(),
                    demand: 0
                },
            ]
        );
    }

    #[test]
    fn test_concurrent_admissions_and_completions_balance_out() {
        let (flow, consumers) = governed(FlowControlConfig::new(true, 1_000_000, 10), 1);
        let flow = Arc::new(flow);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let flow = flow.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        flow.on_chunk_admitted(10);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("admission thread panicked");
        }
        assert_eq!(flow.in_flight(), 8000);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let flow = flow.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        flow.on_record_completed();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("completion thread panicked");
        }
        assert_eq!(flow.in_flight(), 0);
        assert_eq!(consumers[0].pause_calls(), 0);
    }
}
