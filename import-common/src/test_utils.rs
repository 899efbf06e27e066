use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time;

use async_trait::async_trait;

use crate::consumer::ConsumerHandle;
use crate::dispatcher::{Mutation, Persister};
use crate::error::{ConsumerError, FlushError};

type Hook = Box<dyn Fn() + Send + Sync>;

/// An in-process `ConsumerHandle` that records how it was signalled.
pub struct MockConsumer {
    name: String,
    paused: AtomicBool,
    failing: AtomicBool,
    pause_calls: AtomicUsize,
    resume_calls: AtomicUsize,
    after_resume: Mutex<Option<Hook>>,
}

impl MockConsumer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            paused: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            pause_calls: AtomicUsize::new(0),
            resume_calls: AtomicUsize::new(0),
            after_resume: Mutex::new(None),
        })
    }

    /// Run `hook` every time this consumer was resumed, to interleave other signals.
    pub fn set_after_resume<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.lock_after_resume() = Some(Box::new(hook));
    }

    fn lock_after_resume(&self) -> MutexGuard<'_, Option<Hook>> {
        match self.after_resume.lock() {
            Ok(hook) => hook,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every following pause/resume call fail without changing state.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause_calls(&self) -> usize {
        self.pause_calls.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }
}

impl ConsumerHandle for MockConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_demand(&self) -> u64 {
        if self.is_paused() {
            0
        } else {
            1
        }
    }

    fn pause(&self) -> Result<(), ConsumerError> {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConsumerError::Gone(self.name.clone()));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<(), ConsumerError> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConsumerError::Gone(self.name.clone()));
        }
        self.paused.store(false, Ordering::SeqCst);
        if let Some(hook) = self.lock_after_resume().as_ref() {
            hook();
        }
        Ok(())
    }
}

/// How a `RecordingPersister` answers a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Succeed,
    FailTransient,
    FailPermanent,
    /// Sleep longer than any sane flush timeout before succeeding.
    Hang,
}

/// A `Persister` that remembers every mutation it was handed.
///
/// Outcomes are taken from a script, one per call, and default to success once the script
/// is exhausted. Tracks how many calls for the same key overlapped, which must never exceed one.
pub struct RecordingPersister<K, M> {
    calls: Mutex<Vec<(K, M)>>,
    script: Mutex<VecDeque<ScriptedOutcome>>,
    delay: time::Duration,
    active: Mutex<Vec<K>>,
    overlapping: AtomicUsize,
    attempts: AtomicU64,
}

impl<K, M> RecordingPersister<K, M> {
    pub fn new(delay: time::Duration) -> Arc<Self> {
        Self::scripted(delay, Vec::new())
    }

    pub fn scripted(delay: time::Duration, script: Vec<ScriptedOutcome>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
            delay,
            active: Mutex::new(Vec::new()),
            overlapping: AtomicUsize::new(0),
            attempts: AtomicU64::new(0),
        })
    }

    /// Calls that succeeded, in completion order.
    pub fn persisted(&self) -> Vec<(K, M)>
    where
        K: Clone,
        M: Clone,
    {
        self.calls.lock().expect("poisoned calls").clone()
    }

    /// Every call, including failed ones.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn overlapping_calls(&self) -> usize {
        self.overlapping.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K, M> Persister<K, M> for RecordingPersister<K, M>
where
    K: Clone + PartialEq + Send + Sync + 'static,
    M: Mutation + Clone + Sync,
{
    async fn persist(&self, key: &K, mutation: &M) -> Result<(), FlushError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard::enter(&self.active, &self.overlapping, key);

        let outcome = self
            .script
            .lock()
            .expect("poisoned script")
            .pop_front()
            .unwrap_or(ScriptedOutcome::Succeed);

        let delay = match outcome {
            ScriptedOutcome::Hang => time::Duration::from_secs(3600),
            _ => self.delay,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            ScriptedOutcome::Succeed | ScriptedOutcome::Hang => {
                self.calls
                    .lock()
                    .expect("poisoned calls")
                    .push((key.clone(), mutation.clone()));
                Ok(())
            }
            ScriptedOutcome::FailTransient => Err(FlushError::Transient("scripted".to_owned())),
            ScriptedOutcome::FailPermanent => Err(FlushError::Permanent("scripted".to_owned())),
        }
    }
}

// Removes the key from the active set even when the call is dropped by a timeout.
struct ActiveGuard<'a, K: PartialEq> {
    active: &'a Mutex<Vec<K>>,
    key: K,
}

impl<'a, K: Clone + PartialEq> ActiveGuard<'a, K> {
    fn enter(active: &'a Mutex<Vec<K>>, overlapping: &AtomicUsize, key: &K) -> Self {
        let mut keys = active.lock().expect("poisoned active");
        if keys.contains(key) {
            overlapping.fetch_add(1, Ordering::SeqCst);
        }
        keys.push(key.clone());
        Self {
            active,
            key: key.clone(),
        }
    }
}

impl<K: PartialEq> Drop for ActiveGuard<'_, K> {
    fn drop(&mut self) {
        if let Ok(mut keys) = self.active.lock() {
            if let Some(position) = keys.iter().position(|k| *k == self.key) {
                keys.swap_remove(position);
            }
        }
    }
}

/// Poll `check` until it holds or five seconds went by, then assert it.
pub async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + time::Duration::from_secs(5);
    while !check() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(time::Duration::from_millis(10)).await;
    }
    assert!(check())
}
