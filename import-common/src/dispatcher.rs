//! Coalesce many small mutations into few persistence calls, one writer per key.
//!
//! Every key moves through `IDLE -> PENDING -> FLUSHING -> IDLE`. Mutations submitted while a
//! key is PENDING are merged into the pending one; mutations submitted while it is FLUSHING
//! are merged into a separate slot that becomes PENDING again as soon as the outstanding call
//! returns. All per-key state lives in a single table behind one mutex that is never held
//! across an await point, so there is no lock per key and no lock ordering to get wrong.
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::error::FlushError;
use crate::metrics_consts::{
    DISPATCH_DROPPED_KEYS, DISPATCH_FLUSHES, DISPATCH_FLUSH_TIME, DISPATCH_MERGED,
    DISPATCH_PENDING_KEYS, DISPATCH_RETRIES, DISPATCH_SUBMITTED,
};
use crate::retry::RetryPolicy;

/// An update that can absorb a later update for the same key.
pub trait Mutation: Send + Sync + 'static {
    /// Fold `later`, submitted after `self`, into `self`.
    fn merge(&mut self, later: Self);
}

/// Writes one merged mutation for one key.
#[async_trait]
pub trait Persister<K, M>: Send + Sync + 'static {
    async fn persist(&self, key: &K, mutation: &M) -> Result<(), FlushError>;
}

/// Called once for every key whose mutations were discarded.
pub type FailureCallback<K> = Arc<dyn Fn(&K, &FlushError) + Send + Sync>;

enum KeyState<M> {
    Pending(M),
    Flushing(Option<M>),
}

struct Table<K, M> {
    states: HashMap<K, KeyState<M>>,
    ready: VecDeque<K>,
    dropped: HashSet<K>,
    closed: bool,
}

struct Shared<K, M> {
    name: &'static str,
    table: Mutex<Table<K, M>>,
    wake: Notify,
    idle: Notify,
}

enum FlushOutcome {
    Persisted,
    /// The storage refused the mutation for good.
    Rejected(FlushError),
    /// Still failing when shutdown was requested.
    Abandoned(FlushError),
}

impl<K, M> Shared<K, M>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    M: Mutation,
{
    fn lock(&self) -> MutexGuard<'_, Table<K, M>> {
        // A panic while holding the lock leaves the table consistent: every mutation of it is
        // a single insert, remove or merge.
        match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn report_pending(&self, table: &Table<K, M>) {
        metrics::gauge!(DISPATCH_PENDING_KEYS, &[("dispatcher", self.name)])
            .set(table.states.len() as f64);
    }

    /// Move the oldest PENDING key to FLUSHING and hand out its mutation.
    fn next_ready(&self) -> Option<(K, M)> {
        let mut guard = self.lock();
        let Table { states, ready, .. } = &mut *guard;

        while let Some(key) = ready.pop_front() {
            if let Some(state) = states.get_mut(&key) {
                if let KeyState::Pending(_) = state {
                    if let KeyState::Pending(mutation) =
                        std::mem::replace(state, KeyState::Flushing(None))
                    {
                        return Some((key, mutation));
                    }
                }
            }
        }
        None
    }

    /// Bring a key out of FLUSHING once its persistence call returned.
    fn finish(&self, key: K, outcome: &FlushOutcome) {
        let mut guard = self.lock();
        let table = &mut *guard;

        match (outcome, table.states.remove(&key)) {
            (FlushOutcome::Persisted, Some(KeyState::Flushing(Some(next)))) => {
                table.states.insert(key.clone(), KeyState::Pending(next));
                table.ready.push_back(key);
                self.wake.notify_one();
            }
            (FlushOutcome::Persisted, Some(KeyState::Flushing(None))) => {}
            (FlushOutcome::Rejected(_), state) => {
                if matches!(state, Some(KeyState::Flushing(Some(_)))) {
                    debug!(
                        dispatcher = self.name,
                        ?key,
                        "discarding mutations queued behind a rejected flush"
                    );
                }
                table.dropped.insert(key);
            }
            (FlushOutcome::Abandoned(_), _) => {}
            (_, state) => {
                // Only the drain loop moves keys out of FLUSHING, so this is a bug.
                error!(
                    dispatcher = self.name,
                    ?key,
                    flushing = matches!(state, Some(KeyState::Flushing(_))),
                    "flush finished for a key that was not flushing"
                );
            }
        }

        self.report_pending(table);
        if table.states.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn close(&self) {
        self.lock().closed = true;
    }

    fn is_idle(&self) -> bool {
        self.lock().states.is_empty()
    }
}

/// A cloneable handle to submit mutations to a running drain loop.
pub struct BatchDispatcher<K, M> {
    shared: Arc<Shared<K, M>>,
}

impl<K, M> Clone for BatchDispatcher<K, M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, M> BatchDispatcher<K, M>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    M: Mutation,
{
    pub fn build<P>(name: &'static str, persister: Arc<P>) -> DispatcherBuilder<K, M, P>
    where
        P: Persister<K, M>,
    {
        DispatcherBuilder {
            name,
            persister,
            config: DispatcherConfig::default(),
            retry_policy: None,
            on_failure: None,
            shutdown: CancellationToken::new(),
            _mutation: std::marker::PhantomData,
        }
    }

    /// Queue `mutation` for `key`. Never waits for storage.
    pub fn submit(&self, key: K, mutation: M) {
        let name = self.shared.name;
        let mut guard = self.shared.lock();
        let table = &mut *guard;

        if table.closed {
            warn!(dispatcher = name, ?key, "dispatcher is shut down, dropping mutation");
            metrics::counter!(DISPATCH_DROPPED_KEYS, &[("dispatcher", name), ("reason", "closed")])
                .increment(1);
            return;
        }
        if table.dropped.contains(&key) {
            debug!(dispatcher = name, ?key, "ignoring mutation for a rejected key");
            return;
        }

        metrics::counter!(DISPATCH_SUBMITTED, &[("dispatcher", name)]).increment(1);
        match table.states.entry(key) {
            Entry::Vacant(vacant) => {
                let key = vacant.key().clone();
                vacant.insert(KeyState::Pending(mutation));
                table.ready.push_back(key);
                self.shared.report_pending(table);
                self.shared.wake.notify_one();
            }
            Entry::Occupied(mut occupied) => {
                metrics::counter!(DISPATCH_MERGED, &[("dispatcher", name)]).increment(1);
                match occupied.get_mut() {
                    KeyState::Pending(pending) => pending.merge(mutation),
                    KeyState::Flushing(Some(next)) => next.merge(mutation),
                    KeyState::Flushing(next) => *next = Some(mutation),
                }
            }
        }
    }

    /// Number of keys that are pending or flushing.
    pub fn pending_keys(&self) -> usize {
        self.shared.lock().states.len()
    }

    /// Resolves once no key is pending or flushing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

pub struct DispatcherBuilder<K, M, P> {
    name: &'static str,
    persister: Arc<P>,
    config: DispatcherConfig,
    retry_policy: Option<RetryPolicy>,
    on_failure: Option<FailureCallback<K>>,
    shutdown: CancellationToken,
    _mutation: std::marker::PhantomData<fn(M)>,
}

impl<K, M, P> DispatcherBuilder<K, M, P>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    M: Mutation,
    P: Persister<K, M>,
{
    pub fn config(mut self, config: &DispatcherConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Overrides the backoff derived from the config.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, &FlushError) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    /// Once cancelled, the drain loop stops retrying, flushes what is pending and exits.
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Spawn the drain loop on the current tokio runtime.
    pub fn spawn(self) -> (BatchDispatcher<K, M>, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            name: self.name,
            table: Mutex::new(Table {
                states: HashMap::new(),
                ready: VecDeque::new(),
                dropped: HashSet::new(),
                closed: false,
            }),
            wake: Notify::new(),
            idle: Notify::new(),
        });

        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::from(&self.config));
        let drain = DrainLoop {
            shared: shared.clone(),
            persister: self.persister,
            retry_policy,
            flush_timeout: self.config.flush_timeout.0,
            max_concurrent_flushes: self.config.max_concurrent_flushes.max(1),
            on_failure: self.on_failure,
            shutdown: self.shutdown,
        };
        let handle = tokio::spawn(drain.run());

        (BatchDispatcher { shared }, handle)
    }
}

struct DrainLoop<K, M, P> {
    shared: Arc<Shared<K, M>>,
    persister: Arc<P>,
    retry_policy: RetryPolicy,
    flush_timeout: time::Duration,
    max_concurrent_flushes: usize,
    on_failure: Option<FailureCallback<K>>,
    shutdown: CancellationToken,
}

impl<K, M, P> DrainLoop<K, M, P>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    M: Mutation,
    P: Persister<K, M>,
{
    async fn run(self) {
        let name = self.shared.name;
        info!(dispatcher = name, "starting drain loop");

        let mut flushes: FuturesUnordered<BoxFuture<'static, (K, FlushOutcome)>> =
            FuturesUnordered::new();
        let mut shutting_down = false;

        loop {
            while flushes.len() < self.max_concurrent_flushes {
                let Some((key, mutation)) = self.shared.next_ready() else {
                    break;
                };
                flushes.push(self.flush(key, mutation));
            }

            if shutting_down && flushes.is_empty() {
                break;
            }

            tokio::select! {
                Some((key, outcome)) = flushes.next(), if !flushes.is_empty() => {
                    self.shared.finish(key.clone(), &outcome);
                    self.report_failure(&key, outcome);
                }
                _ = self.shared.wake.notified() => {}
                _ = self.shutdown.cancelled(), if !shutting_down => {
                    info!(dispatcher = name, "shutdown requested, draining pending mutations");
                    shutting_down = true;
                    self.shared.close();
                }
            }
        }

        info!(dispatcher = name, "drain loop stopped");
    }

    fn report_failure(&self, key: &K, outcome: FlushOutcome) {
        let (reason, error) = match outcome {
            FlushOutcome::Persisted => return,
            FlushOutcome::Rejected(error) => ("rejected", error),
            FlushOutcome::Abandoned(error) => ("abandoned", error),
        };

        error!(
            dispatcher = self.shared.name,
            ?key,
            reason,
            "dropping mutations: {}",
            error
        );
        metrics::counter!(
            DISPATCH_DROPPED_KEYS,
            &[("dispatcher", self.shared.name), ("reason", reason)]
        )
        .increment(1);

        if let Some(on_failure) = &self.on_failure {
            on_failure(key, &error);
        }
    }

    /// Persist one merged mutation, retrying transient failures with the same mutation.
    fn flush(&self, key: K, mutation: M) -> BoxFuture<'static, (K, FlushOutcome)> {
        let name = self.shared.name;
        let persister = self.persister.clone();
        let retry_policy = self.retry_policy;
        let flush_timeout = self.flush_timeout;
        let shutdown = self.shutdown.clone();

        async move {
            let mut failed_attempts: u32 = 0;
            loop {
                let started = tokio::time::Instant::now();
                let result =
                    match tokio::time::timeout(flush_timeout, persister.persist(&key, &mutation))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(FlushError::Timeout(flush_timeout)),
                    };
                metrics::histogram!(DISPATCH_FLUSH_TIME, &[("dispatcher", name)])
                    .record(started.elapsed().as_secs_f64());

                let error = match result {
                    Ok(()) => {
                        metrics::counter!(DISPATCH_FLUSHES, &[("dispatcher", name), ("result", "ok")])
                            .increment(1);
                        return (key, FlushOutcome::Persisted);
                    }
                    Err(error) if !error.is_retryable() => {
                        metrics::counter!(
                            DISPATCH_FLUSHES,
                            &[("dispatcher", name), ("result", "rejected")]
                        )
                        .increment(1);
                        return (key, FlushOutcome::Rejected(error));
                    }
                    Err(error) => error,
                };

                metrics::counter!(DISPATCH_FLUSHES, &[("dispatcher", name), ("result", "retry")])
                    .increment(1);
                if shutdown.is_cancelled() {
                    return (key, FlushOutcome::Abandoned(error));
                }

                failed_attempts = failed_attempts.saturating_add(1);
                let backoff = retry_policy.time_until_next_retry(failed_attempts);
                warn!(
                    dispatcher = name,
                    ?key,
                    failed_attempts,
                    ?backoff,
                    "flush failed, retrying: {}",
                    error
                );
                metrics::counter!(DISPATCH_RETRIES, &[("dispatcher", name)]).increment(1);

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => return (key, FlushOutcome::Abandoned(error)),
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::EnvMsDuration;
    use crate::test_utils::{assert_or_retry, RecordingPersister, ScriptedOutcome};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Count(u64);

    impl Mutation for Count {
        fn merge(&mut self, later: Self) {
            self.0 += later.0;
        }
    }

    fn fast_retries() -> RetryPolicy {
        RetryPolicy::new(1, time::Duration::from_millis(1), None)
    }

    fn total_for(persister: &RecordingPersister<&'static str, Count>, key: &str) -> u64 {
        persister
            .persisted()
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, count)| count.0)
            .sum()
    }

    #[tokio::test]
    async fn test_burst_is_merged_into_fewer_calls() {
        let persister = RecordingPersister::new(time::Duration::from_millis(5));
        let (dispatcher, _handle) = BatchDispatcher::build("test", persister.clone()).spawn();

        for _ in 0..100 {
            dispatcher.submit("job", Count(1));
        }
        dispatcher.wait_idle().await;

        assert!(persister.attempts() < 100);
        assert_eq!(total_for(&persister, "job"), 100);
        assert_eq!(persister.overlapping_calls(), 0);
    }

    #[tokio::test]
    async fn test_mutations_during_flush_go_to_the_next_flush() {
        let persister = RecordingPersister::new(time::Duration::from_millis(50));
        let (dispatcher, _handle) = BatchDispatcher::build("test", persister.clone()).spawn();

        dispatcher.submit("job", Count(1));
        tokio::time::sleep(time::Duration::from_millis(10)).await;
        for _ in 0..10 {
            dispatcher.submit("job", Count(1));
        }
        dispatcher.wait_idle().await;

        let persisted = persister.persisted();
        assert!(persisted.len() <= 2, "got {} calls", persisted.len());
        assert_eq!(total_for(&persister, "job"), 11);
        assert_eq!(persister.overlapping_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_two_writers_for_one_key() {
        let persister = RecordingPersister::new(time::Duration::from_millis(2));
        let (dispatcher, _handle) = BatchDispatcher::build("test", persister.clone()).spawn();

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    for i in 0..200u64 {
                        let key = if i % 2 == 0 { "even" } else { "odd" };
                        dispatcher.submit(key, Count(1));
                        if i % 20 == 0 {
                            tokio::time::sleep(time::Duration::from_millis(1)).await;
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.expect("producer panicked");
        }
        dispatcher.wait_idle().await;

        assert_eq!(persister.overlapping_calls(), 0);
        assert_eq!(total_for(&persister, "even"), 400);
        assert_eq!(total_for(&persister, "odd"), 400);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_the_merged_mutation() {
        let persister = RecordingPersister::scripted(
            time::Duration::ZERO,
            vec![ScriptedOutcome::FailTransient, ScriptedOutcome::FailTransient],
        );
        let (dispatcher, _handle) = BatchDispatcher::build("test", persister.clone())
            .retry_policy(fast_retries())
            .spawn();

        for _ in 0..5 {
            dispatcher.submit("job", Count(2));
        }
        dispatcher.wait_idle().await;

        assert_eq!(persister.attempts(), 3);
        assert_eq!(persister.persisted(), vec![("job", Count(10))]);
    }

    #[tokio::test]
    async fn test_timeouts_are_retried() {
        let persister =
            RecordingPersister::scripted(time::Duration::ZERO, vec![ScriptedOutcome::Hang]);
        let config = DispatcherConfig {
            flush_timeout: EnvMsDuration(time::Duration::from_millis(20)),
            ..Default::default()
        };
        let (dispatcher, _handle) = BatchDispatcher::build("test", persister.clone())
            .config(&config)
            .retry_policy(fast_retries())
            .spawn();

        dispatcher.submit("job", Count(3));
        dispatcher.wait_idle().await;

        assert_eq!(persister.attempts(), 2);
        assert_eq!(persister.persisted(), vec![("job", Count(3))]);
    }

    #[tokio::test]
    async fn test_rejected_key_is_dropped_and_reported() {
        let persister =
            RecordingPersister::scripted(time::Duration::ZERO, vec![ScriptedOutcome::FailPermanent]);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let recorded = failures.clone();
        let (dispatcher, _handle) = BatchDispatcher::build("test", persister.clone())
            .on_failure(move |key: &&'static str, error: &FlushError| {
                recorded
                    .lock()
                    .expect("poisoned failures")
                    .push((*key, error.is_retryable()));
            })
            .spawn();

        dispatcher.submit("gone", Count(1));
        dispatcher.wait_idle().await;
        assert_eq!(
            *failures.lock().expect("poisoned failures"),
            vec![("gone", false)]
        );

        // Later mutations for the rejected key are ignored, other keys keep flowing.
        dispatcher.submit("gone", Count(1));
        dispatcher.submit("alive", Count(1));
        dispatcher.wait_idle().await;

        assert_eq!(persister.persisted(), vec![("alive", Count(1))]);
        assert_eq!(persister.attempts(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_mutations() {
        let persister = RecordingPersister::new(time::Duration::from_millis(5));
        let shutdown = CancellationToken::new();
        let (dispatcher, handle) = BatchDispatcher::build("test", persister.clone())
            .shutdown(shutdown.clone())
            .spawn();

        for key in ["a", "b", "c"] {
            dispatcher.submit(key, Count(1));
        }
        shutdown.cancel();
        handle.await.expect("drain loop panicked");

        assert_eq!(total_for(&persister, "a"), 1);
        assert_eq!(total_for(&persister, "b"), 1);
        assert_eq!(total_for(&persister, "c"), 1);

        dispatcher.submit("a", Count(1));
        assert_eq!(dispatcher.pending_keys(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_failing_keys() {
        let persister = RecordingPersister::scripted(
            time::Duration::ZERO,
            vec![ScriptedOutcome::FailTransient; 100],
        );
        let shutdown = CancellationToken::new();
        let abandoned = Arc::new(AtomicUsize::new(0));
        let counter = abandoned.clone();
        let (dispatcher, handle) = BatchDispatcher::build("test", persister.clone())
            .retry_policy(RetryPolicy::new(1, time::Duration::from_secs(60), None))
            .on_failure(move |_: &&'static str, _: &FlushError| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .shutdown(shutdown.clone())
            .spawn();

        dispatcher.submit("job", Count(1));
        assert_or_retry(|| persister.attempts() >= 1).await;
        shutdown.cancel();
        handle.await.expect("drain loop panicked");

        assert_eq!(abandoned.load(Ordering::SeqCst), 1);
        assert!(persister.persisted().is_empty());
    }

    #[tokio::test]
    async fn test_keys_flush_independently() {
        let persister = RecordingPersister::new(time::Duration::from_millis(1));
        let (dispatcher, _handle) = BatchDispatcher::build("test", persister.clone()).spawn();

        for i in 0..30u64 {
            let key = ["a", "b", "c"][(i % 3) as usize];
            dispatcher.submit(key, Count(i));
        }
        dispatcher.wait_idle().await;

        assert_eq!(total_for(&persister, "a"), (0..30).step_by(3).sum::<u64>());
        assert_eq!(total_for(&persister, "b"), (1..30).step_by(3).sum::<u64>());
        assert_eq!(total_for(&persister, "c"), (2..30).step_by(3).sum::<u64>());
        assert_eq!(dispatcher.pending_keys(), 0);
    }
}
