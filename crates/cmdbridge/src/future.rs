//! Blocking result handles for in-flight helper requests.
//!
//! A [`BridgeFuture`] is shared between the transport (which appends results
//! and finishes it) and any number of callers (which poll, block or cancel).
//! Callers block on a condition variable, so they may sit on any thread
//! except the transport's own runtime threads.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::errors::{BridgeError, BridgeResult};

type Canceller = Arc<dyn Fn() + Send + Sync>;

/// How a finished future ended.
#[derive(Debug, Clone)]
enum Outcome {
    Completed,
    Cancelled,
    Failed(BridgeError),
}

struct State<T> {
    results: Vec<T>,
    outcome: Option<Outcome>,
    cancel_requested: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    changed: Condvar,
    canceller: Mutex<Option<Canceller>>,
}

/// Handle to the (possibly streamed) result of one helper request.
pub struct BridgeFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BridgeFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for BridgeFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BridgeFuture")
            .field("results", &state.results.len())
            .field("outcome", &state.outcome)
            .finish()
    }
}

impl<T> Default for BridgeFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BridgeFuture<T> {
    /// A new, unfinished future.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    results: Vec::new(),
                    outcome: None,
                    cancel_requested: false,
                }),
                changed: Condvar::new(),
                canceller: Mutex::new(None),
            }),
        }
    }

    /// A future that has already failed.
    pub fn failed(err: BridgeError) -> Self {
        let future = Self::new();
        future.report_error(err);
        future
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // -- Producer side ------------------------------------------------------

    /// Append a result.  Ignored once the future has finished.
    pub fn report_result(&self, value: T) -> bool {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.results.push(value);
        drop(state);
        self.inner.changed.notify_all();
        true
    }

    pub fn report_finished(&self) {
        self.finish(Outcome::Completed);
    }

    pub fn report_cancelled(&self) {
        self.finish(Outcome::Cancelled);
    }

    pub fn report_error(&self, err: BridgeError) {
        self.finish(Outcome::Failed(err));
    }

    fn finish(&self, outcome: Outcome) {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return;
        }
        state.outcome = Some(outcome);
        drop(state);
        self.inner
            .canceller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.changed.notify_all();
    }

    /// Install the hook `cancel()` uses to tell the producer to stop.
    pub fn set_canceller(&self, canceller: impl Fn() + Send + Sync + 'static) {
        if self.is_finished() {
            return;
        }
        *self
            .inner
            .canceller
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(canceller));
    }

    // -- Consumer side ------------------------------------------------------

    pub fn is_finished(&self) -> bool {
        self.lock().outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.lock().outcome, Some(Outcome::Cancelled))
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    pub fn result_count(&self) -> usize {
        self.lock().results.len()
    }

    /// The error this future failed with, if any.
    pub fn error(&self) -> Option<BridgeError> {
        match self.lock().outcome {
            Some(Outcome::Failed(ref err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Ask the producer to stop.
    ///
    /// A no-op on finished futures.  Streaming requests keep delivering what
    /// is already in flight until the helper's terminal frame arrives; other
    /// requests are marked cancelled immediately and their late reply is
    /// dropped.
    pub fn cancel(&self) {
        {
            let mut state = self.lock();
            if state.outcome.is_some() || state.cancel_requested {
                return;
            }
            state.cancel_requested = true;
        }

        let canceller = self
            .inner
            .canceller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match canceller {
            Some(cancel) => (*cancel)(),
            None => self.report_cancelled(),
        }
    }

    /// Block until the future has finished.
    pub fn wait_for_finished(&self) {
        let mut state = self.lock();
        while state.outcome.is_none() {
            state = self
                .inner
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until result `index` exists or the future finishes without it.
    ///
    /// Returns `true` when the result is available.
    pub fn wait_for_result(&self, index: usize) -> bool {
        let mut state = self.lock();
        loop {
            if state.results.len() > index {
                return true;
            }
            if state.outcome.is_some() {
                return false;
            }
            state = self
                .inner
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T: Clone> BridgeFuture<T> {
    /// A future that already holds `value`.
    pub fn ready(value: T) -> Self {
        let future = Self::new();
        future.report_result(value);
        future.report_finished();
        future
    }

    pub fn result_at(&self, index: usize) -> Option<T> {
        self.lock().results.get(index).cloned()
    }

    /// Snapshot of all results delivered so far.
    pub fn results(&self) -> Vec<T> {
        self.lock().results.clone()
    }

    /// Wait, then return the single result of a non-streaming request.
    pub fn result(&self) -> BridgeResult<T> {
        self.wait_for_finished();
        let state = self.lock();
        match state.outcome {
            Some(Outcome::Failed(ref err)) => Err(err.clone()),
            Some(Outcome::Cancelled) if state.results.is_empty() => Err(BridgeError::Cancelled),
            _ => state
                .results
                .first()
                .cloned()
                .ok_or_else(|| BridgeError::Protocol("request finished without a result".into())),
        }
    }

    /// Wait, then return every result of a streaming request.
    ///
    /// A cancelled stream yields what was delivered before cancellation.
    pub fn wait(&self) -> BridgeResult<Vec<T>> {
        self.wait_for_finished();
        let state = self.lock();
        match state.outcome {
            Some(Outcome::Failed(ref err)) => Err(err.clone()),
            _ => Ok(state.results.clone()),
        }
    }

    /// Blocking iterator over results as they arrive.
    pub fn stream(&self) -> ResultStream<T> {
        ResultStream {
            future: self.clone(),
            next: 0,
        }
    }
}

/// Iterator returned by [`BridgeFuture::stream`].
pub struct ResultStream<T> {
    future: BridgeFuture<T>,
    next: usize,
}

impl<T: Clone> Iterator for ResultStream<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if !self.future.wait_for_result(self.next) {
            return None;
        }
        let item = self.future.result_at(self.next);
        self.next += 1;
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn ready_future_has_result() {
        let f = BridgeFuture::ready(5u32);
        assert!(f.is_finished());
        assert_eq!(f.result().unwrap(), 5);
        assert_eq!(f.result_count(), 1);
    }

    #[test]
    fn failed_future_returns_error() {
        let f: BridgeFuture<u32> = BridgeFuture::failed(BridgeError::TransportLost("x".into()));
        assert!(f.result().unwrap_err().is_transport_lost());
        assert!(f.error().is_some());
    }

    #[test]
    fn results_after_finish_are_dropped() {
        let f = BridgeFuture::new();
        assert!(f.report_result(1));
        f.report_cancelled();
        assert!(!f.report_result(2));
        assert_eq!(f.results(), vec![1]);
        assert!(f.is_cancelled());
    }

    #[test]
    fn cancel_without_canceller_finishes_immediately() {
        let f: BridgeFuture<u8> = BridgeFuture::new();
        f.cancel();
        assert!(f.is_cancelled());
        assert!(matches!(f.result(), Err(BridgeError::Cancelled)));
    }

    #[test]
    fn cancel_calls_canceller_once() {
        let f: BridgeFuture<u8> = BridgeFuture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        f.set_canceller(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        f.cancel();
        f.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!f.is_finished());
        assert!(f.is_cancel_requested());
    }

    #[test]
    fn cancel_after_completion_is_noop() {
        let f = BridgeFuture::ready(1u8);
        f.cancel();
        assert!(!f.is_cancelled());
        assert_eq!(f.result().unwrap(), 1);
    }

    #[test]
    fn stream_yields_results_from_another_thread() {
        let f: BridgeFuture<u32> = BridgeFuture::new();
        let producer = f.clone();
        let handle = thread::spawn(move || {
            for i in 0..5 {
                producer.report_result(i);
                thread::sleep(Duration::from_millis(2));
            }
            producer.report_finished();
        });
        let collected: Vec<u32> = f.stream().collect();
        handle.join().unwrap();
        assert_eq!(collected, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn wait_for_result_returns_false_when_exhausted() {
        let f = BridgeFuture::ready(1u8);
        assert!(f.wait_for_result(0));
        assert!(!f.wait_for_result(1));
    }
}
