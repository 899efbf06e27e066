//! Detection of chunks the broker delivered more than once.
//!
//! Remembered chunks expire after a time-to-live and the set is bounded, so a redelivery that
//! arrives after the entry was evicted is counted as fresh again.
use std::time::Duration;

use moka::sync::Cache;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Fresh,
    Duplicate,
}

#[derive(Clone)]
pub struct ChunkTracker {
    seen: Cache<(Uuid, String), ()>,
}

impl ChunkTracker {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self { seen }
    }

    /// Remember the chunk and tell whether it was already seen. Concurrent observations of
    /// the same chunk see exactly one `Fresh`.
    pub fn observe(&self, job_execution_id: Uuid, chunk_id: &str) -> Admission {
        let entry = self
            .seen
            .entry((job_execution_id, chunk_id.to_owned()))
            .or_insert(());
        if entry.is_fresh() {
            Admission::Fresh
        } else {
            Admission::Duplicate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_observation_is_duplicate() {
        let tracker = ChunkTracker::new(100, Duration::from_secs(60));
        let job = Uuid::new_v4();

        assert_eq!(tracker.observe(job, "chunk-1"), Admission::Fresh);
        assert_eq!(tracker.observe(job, "chunk-1"), Admission::Duplicate);
        assert_eq!(tracker.observe(job, "chunk-2"), Admission::Fresh);
    }

    #[test]
    fn test_chunk_ids_are_scoped_by_job() {
        let tracker = ChunkTracker::new(100, Duration::from_secs(60));

        assert_eq!(tracker.observe(Uuid::new_v4(), "chunk-1"), Admission::Fresh);
        assert_eq!(tracker.observe(Uuid::new_v4(), "chunk-1"), Admission::Fresh);
    }

    #[test]
    fn test_expired_chunk_is_fresh_again() {
        let tracker = ChunkTracker::new(100, Duration::from_millis(50));
        let job = Uuid::new_v4();

        assert_eq!(tracker.observe(job, "chunk-1"), Admission::Fresh);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(tracker.observe(job, "chunk-1"), Admission::Fresh);
    }

    #[test]
    fn test_concurrent_observations_admit_once() {
        let tracker = ChunkTracker::new(100, Duration::from_secs(60));
        let job = Uuid::new_v4();

        let fresh: usize = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.observe(job, "chunk-1") == Admission::Fresh)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().expect("observer thread panicked")))
            .sum();

        assert_eq!(fresh, 1);
    }
}
