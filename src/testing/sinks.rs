//! In-memory item sinks.

use crate::error::ItemError;
use crate::item::ItemSink;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Commits that reach a closed gate wait there until it is opened.
const GATE_TIMEOUT: Duration = Duration::from_secs(30);

struct FailureRule<T> {
    matches: Predicate<T>,
    /// `None` fails forever.
    remaining: Option<u32>,
    error: ItemError,
}

/// Keeps every committed batch in memory.
///
/// A batch either lands whole or not at all. Failure injection works per batch:
/// a commit fails when any record in it matches the configured predicate.
pub struct RecordingSink<T> {
    committed: Mutex<Vec<Vec<T>>>,
    failure: Mutex<Option<FailureRule<T>>>,
    delay: Duration,
    gate: Option<Gate>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> Default for RecordingSink<T> {
    fn default() -> Self {
        Self {
            committed: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            delay: Duration::ZERO,
            gate: None,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

impl<T> RecordingSink<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every commit whose batch holds a record matching `matches`.
    #[must_use]
    pub fn fail_when<F>(self, matches: F, error: ItemError) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.set_failure(Box::new(matches), None, error)
    }

    /// Like [`fail_when`](Self::fail_when), but only the first `times` matching commits fail.
    #[must_use]
    pub fn fail_times<F>(self, matches: F, times: u32, error: ItemError) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.set_failure(Box::new(matches), Some(times), error)
    }

    fn set_failure(mut self, matches: Predicate<T>, remaining: Option<u32>, error: ItemError) -> Self {
        *self
            .failure
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner) = Some(FailureRule {
            matches,
            remaining,
            error,
        });
        self
    }

    /// Sleeps for `delay` inside every commit.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Holds every commit at `gate` until it is opened.
    #[must_use]
    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Removes the injected failure, as if the outage were repaired.
    pub fn clear_failures(&self) {
        *lock(&self.failure) = None;
    }

    /// Committed batches, in commit order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<T>>
    where
        T: Clone,
    {
        lock(&self.committed).clone()
    }

    /// Every committed record, in commit order.
    #[must_use]
    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        lock(&self.committed).iter().flatten().cloned().collect()
    }

    /// Committed records sorted and deduplicated, the content an upserting
    /// store would end up holding.
    #[must_use]
    pub fn distinct_items(&self) -> Vec<T>
    where
        T: Clone + Ord,
    {
        let mut items = self.items();
        items.sort();
        items.dedup();
        items
    }

    /// Number of `commit` calls, failed ones included.
    #[must_use]
    pub fn commit_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of commits that were ever running at the same time.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, batch: &[T]) -> Option<ItemError> {
        let mut failure = lock(&self.failure);
        let rule = failure.as_mut()?;
        if !batch.iter().any(|item| (rule.matches)(item)) {
            return None;
        }
        match rule.remaining {
            None => Some(rule.error.clone()),
            Some(0) => None,
            Some(n) => {
                rule.remaining = Some(n - 1);
                Some(rule.error.clone())
            }
        }
    }
}

impl<T> ItemSink<T> for RecordingSink<T>
where
    T: Clone + Send,
{
    fn commit(&self, batch: &[T]) -> Result<(), ItemError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let result = match self.injected_failure(batch) {
            Some(error) => Err(error),
            None => {
                lock(&self.committed).push(batch.to_vec());
                Ok(())
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct GateState {
    open: bool,
    entered: usize,
}

/// A latch that holds callers until opened, counting how many arrived.
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Releases every waiting and future caller.
    pub fn open(&self) {
        let (state, cvar) = &*self.inner;
        lock(state).open = true;
        cvar.notify_all();
    }

    /// Number of callers that reached the gate so far.
    #[must_use]
    pub fn entered(&self) -> usize {
        lock(&self.inner.0).entered
    }

    /// Blocks until at least `count` callers reached the gate. Returns `false`
    /// on timeout.
    pub fn wait_entered(&self, count: usize, timeout: Duration) -> bool {
        let (state, cvar) = &*self.inner;
        let guard = lock(state);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |s| s.entered < count)
            .unwrap_or_else(PoisonError::into_inner);
        guard.entered >= count
    }

    fn pass(&self) {
        let (state, cvar) = &*self.inner;
        let mut guard = lock(state);
        guard.entered += 1;
        cvar.notify_all();

        let deadline = Instant::now() + GATE_TIMEOUT;
        while !guard.open {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            guard = cvar
                .wait_timeout(guard, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
