use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::ConsumerError;

/// One subscribed consumer instance, as seen by flow control.
///
/// Implementations must be cheap to query: `current_demand` is called for every handle each
/// time the in-flight count crosses a watermark.
pub trait ConsumerHandle: Send + Sync {
    /// A name for logs, usually the topic and the instance index.
    fn name(&self) -> &str;

    /// Greater than zero while the consumer is actively pulling, zero once it is paused.
    fn current_demand(&self) -> u64;

    fn pause(&self) -> Result<(), ConsumerError>;

    fn resume(&self) -> Result<(), ConsumerError>;
}

/// Bookkeeping of the consumer handles subscribed to each topic.
///
/// Registration happens a handful of times at startup, lookups happen on every watermark
/// crossing, so lookups only take the shared side of the lock and clone `Arc`s out.
#[derive(Default)]
pub struct ConsumerRegistry {
    handles: RwLock<HashMap<String, Vec<Arc<dyn ConsumerHandle>>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle for a topic. Registering the same handle twice yields two entries, each
    /// of which will be paused and resumed independently.
    pub fn register(&self, topic: &str, handle: Arc<dyn ConsumerHandle>) {
        debug!(topic, consumer = handle.name(), "registering consumer");
        match self.handles.write() {
            Ok(mut handles) => handles.entry(topic.to_owned()).or_default().push(handle),
            Err(poisoned) => {
                warn!("poisoned ConsumerRegistry lock, recovering");
                poisoned
                    .into_inner()
                    .entry(topic.to_owned())
                    .or_default()
                    .push(handle)
            }
        }
    }

    /// A snapshot of the handles currently registered for `topic`, empty if none are.
    pub fn handles_for(&self, topic: &str) -> Vec<Arc<dyn ConsumerHandle>> {
        let handles = match self.handles.read() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        handles.get(topic).cloned().unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        let handles = match self.handles.read() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut topics: Vec<String> = handles.keys().cloned().collect();
        topics.sort_unstable();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockConsumer;

    #[test]
    fn test_unknown_topic_has_no_handles() {
        let registry = ConsumerRegistry::new();
        assert!(registry.handles_for("chunks").is_empty());
        assert!(registry.topics().is_empty());
    }

    #[test]
    fn test_handles_are_isolated_by_topic() {
        let registry = ConsumerRegistry::new();
        registry.register("chunks", MockConsumer::new("chunks-0"));
        registry.register("chunks", MockConsumer::new("chunks-1"));
        registry.register("completions", MockConsumer::new("completions-0"));

        let names: Vec<String> = registry
            .handles_for("chunks")
            .iter()
            .map(|handle| handle.name().to_owned())
            .collect();
        assert_eq!(names, vec!["chunks-0", "chunks-1"]);
        assert_eq!(registry.handles_for("completions").len(), 1);
        assert_eq!(registry.topics(), vec!["chunks", "completions"]);
    }

    #[test]
    fn test_duplicate_registration_yields_two_handles() {
        let registry = ConsumerRegistry::new();
        let consumer = MockConsumer::new("chunks-0");
        registry.register("chunks", consumer.clone());
        registry.register("chunks", consumer.clone());

        let handles = registry.handles_for("chunks");
        assert_eq!(handles.len(), 2);

        for handle in handles {
            handle.pause().expect("mock pause never fails");
        }
        assert_eq!(consumer.pause_calls(), 2);
    }

    #[test]
    fn test_concurrent_register_and_lookup() {
        let registry = Arc::new(ConsumerRegistry::new());

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..25 {
                        registry.register("chunks", MockConsumer::new(&format!("chunks-{i}-{j}")));
                        assert!(!registry.handles_for("chunks").is_empty());
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().expect("writer thread panicked");
        }

        assert_eq!(registry.handles_for("chunks").len(), 100);
    }
}
