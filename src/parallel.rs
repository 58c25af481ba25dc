//! Concurrent fan-out of independent service calls
//!
//! This module provides:
//! 1. `AsyncTask`, one job on its own thread whose error never escapes it
//! 2. `ThreadLimit`, an adaptive bound on how many tasks run per round
//! 3. `run_throttled`, which drives a job list through both

use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::defaults::DEFAULT_MAX_THREADS;
use crate::error::{ClientError, Result};

/// Hard cap on the adaptive thread limit
pub const MAX_THREADS: usize = DEFAULT_MAX_THREADS;

/// Adaptive concurrency bound, tuned from measured round latency
///
/// `elapsed_old` and `elapsed_new` are the average join times (seconds) of
/// the two most recent drained rounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreadLimit {
    limit: usize,
    max: usize,
    elapsed_old: f64,
    elapsed_new: f64,
}

impl Default for ThreadLimit {
    fn default() -> Self {
        Self::new(MAX_THREADS)
    }
}

impl ThreadLimit {
    /// Start at one thread, never growing past `max` (at least 1)
    pub const fn new(max: usize) -> Self {
        Self {
            limit: 1,
            max: if max == 0 { 1 } else { max },
            elapsed_old: 0.0,
            elapsed_new: 0.0,
        }
    }

    /// Start at `limit` threads
    ///
    /// # Errors
    ///
    /// Returns an error if `limit` is zero. A limit above `max` is clamped.
    pub fn with_limit(limit: usize, max: usize) -> Result<Self> {
        if limit == 0 {
            return Err(ClientError::new("Thread limit must be a positive integer"));
        }
        let mut state = Self::new(max);
        state.limit = limit.min(state.max);
        Ok(state)
    }

    /// Current bound
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Cap the bound can grow to
    pub const fn max(&self) -> usize {
        self.max
    }

    /// Adjust the bound from the last two round averages, then roll them
    ///
    /// A round at least as fast as the one before it grows the bound; a round
    /// at least as slow shrinks it. Equal rounds grow.
    pub fn advance(&mut self) {
        if self.elapsed_old > 0.0 && self.elapsed_new <= self.elapsed_old && self.limit < self.max {
            self.limit += 1;
        } else if self.elapsed_new >= self.elapsed_old && self.limit > 1 {
            self.limit -= 1;
        }
        self.elapsed_old = self.elapsed_new;
    }

    /// Record the average join time of a drained round
    pub fn observe(&mut self, average: Duration) {
        self.elapsed_new = average.as_secs_f64();
    }

    /// Run one controller step over the in-flight batch
    ///
    /// When the batch has reached the bound, every task is joined, the
    /// round's average join time is recorded, and the joined tasks are
    /// handed back in join order with `in_flight` left empty. Otherwise
    /// nothing is joined and an empty list is returned.
    pub fn watch<T: Send + 'static>(&mut self, in_flight: &mut Vec<AsyncTask<T>>) -> Vec<AsyncTask<T>> {
        tracing::debug!(
            target: "nimbus::client",
            "thread limit {} in flight {} (old {:.3}s new {:.3}s)",
            self.limit,
            in_flight.len(),
            self.elapsed_old,
            self.elapsed_new
        );
        self.advance();
        if in_flight.len() < self.limit {
            return Vec::new();
        }

        let mut finished = Vec::with_capacity(in_flight.len());
        let mut total = Duration::ZERO;
        for mut task in in_flight.drain(..) {
            total += task.join();
            finished.push(task);
        }
        let rounds = u32::try_from(finished.len()).unwrap_or(u32::MAX).max(1);
        self.observe(total / rounds);
        finished
    }
}

/// Drive `jobs` through `limit`, spawning each as an [`AsyncTask`]
///
/// Every job runs even when siblings fail. Tasks come back in join order,
/// all finished.
pub fn run_throttled<T, F, I>(limit: &mut ThreadLimit, jobs: I) -> Vec<AsyncTask<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
    I: IntoIterator<Item = F>,
{
    let mut in_flight = Vec::new();
    let mut done = Vec::new();
    for (index, job) in jobs.into_iter().enumerate() {
        in_flight.push(AsyncTask::spawn(format!("nimbus-task-{index}"), job));
        done.extend(limit.watch(&mut in_flight));
    }
    for mut task in in_flight {
        let _ = task.join();
        done.push(task);
    }
    done
}

/// One job running on its own thread
///
/// Exactly one of [`AsyncTask::result`] or [`AsyncTask::exception`] is set
/// once the task is joined; neither is before.
pub struct AsyncTask<T> {
    name: String,
    handle: Option<JoinHandle<Result<T>>>,
    outcome: Option<Result<T>>,
}

impl<T> fmt::Debug for AsyncTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.outcome {
            None => "running",
            Some(Ok(_)) => "ok",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("AsyncTask")
            .field("name", &self.name)
            .field("state", &state)
            .finish()
    }
}

impl<T: Send + 'static> AsyncTask<T> {
    /// Start `job` on a new thread named `name`
    ///
    /// A thread that cannot be spawned yields an already-failed task.
    pub fn spawn<F>(name: impl Into<String>, job: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let name = name.into();
        match thread::Builder::new().name(name.clone()).spawn(job) {
            Ok(handle) => Self {
                name,
                handle: Some(handle),
                outcome: None,
            },
            Err(err) => {
                let outcome = Err(ClientError::new(format!("Failed to start task {name}: {err}")));
                Self {
                    name,
                    handle: None,
                    outcome: Some(outcome),
                }
            }
        }
    }
}

impl<T> AsyncTask<T> {
    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the job has stopped running
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Block until the job ends; returns how long the wait took
    ///
    /// A panicking job is recorded as a failed task.
    pub fn join(&mut self) -> Duration {
        let started = Instant::now();
        if let Some(handle) = self.handle.take() {
            let outcome = handle.join().unwrap_or_else(|payload| {
                Err(ClientError::new(format!(
                    "Task {} panicked: {}",
                    self.name,
                    panic_message(payload.as_ref())
                )))
            });
            self.outcome = Some(outcome);
        }
        started.elapsed()
    }

    /// Join only if the job already ended
    ///
    /// Returns whether the task is now joined.
    pub fn try_join(&mut self) -> bool {
        if self.is_finished() {
            let _ = self.join();
            true
        } else {
            false
        }
    }

    /// Value returned by the job, once joined
    pub fn result(&self) -> Option<&T> {
        self.outcome.as_ref().and_then(|outcome| outcome.as_ref().ok())
    }

    /// Error raised by the job, once joined
    pub fn exception(&self) -> Option<&ClientError> {
        self.outcome.as_ref().and_then(|outcome| outcome.as_ref().err())
    }

    /// Join and take the job's outcome
    ///
    /// # Errors
    ///
    /// Returns the job's error, or a panic turned into a [`ClientError`].
    pub fn into_outcome(mut self) -> Result<T> {
        let _ = self.join();
        let name = self.name;
        self.outcome
            .unwrap_or_else(|| Err(ClientError::new(format!("Task {name} never finished"))))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn step(limit: &mut ThreadLimit, seconds: f64) {
        limit.advance();
        limit.observe(Duration::from_secs_f64(seconds));
    }

    #[test]
    fn test_starts_at_one() {
        let limit = ThreadLimit::default();
        assert_eq!(limit.limit(), 1);
        assert_eq!(limit.max(), MAX_THREADS);
    }

    #[test]
    fn test_with_limit_bounds() {
        assert!(ThreadLimit::with_limit(0, 7).is_err());
        assert_eq!(ThreadLimit::with_limit(3, 7).unwrap().limit(), 3);
        assert_eq!(ThreadLimit::with_limit(20, 7).unwrap().limit(), 7);
    }

    #[test]
    fn test_faster_rounds_grow_to_cap() {
        let mut limit = ThreadLimit::default();
        let mut previous = limit.limit();
        for round in 0..40 {
            step(&mut limit, 100.0 - f64::from(round));
            assert!(limit.limit() >= previous);
            assert!(limit.limit() <= MAX_THREADS);
            previous = limit.limit();
        }
        assert_eq!(limit.limit(), MAX_THREADS);
    }

    #[test]
    fn test_slower_rounds_shrink_to_one() {
        let mut limit = ThreadLimit::with_limit(MAX_THREADS, MAX_THREADS).unwrap();
        let mut previous = limit.limit();
        for round in 0..40 {
            step(&mut limit, 1.0 + f64::from(round));
            assert!(limit.limit() <= previous);
            assert!(limit.limit() >= 1);
            previous = limit.limit();
        }
        assert_eq!(limit.limit(), 1);
    }

    #[test]
    fn test_equal_rounds_favor_growth() {
        let mut limit = ThreadLimit::with_limit(3, 7).unwrap();
        step(&mut limit, 0.5);
        step(&mut limit, 0.5);
        assert_eq!(limit.limit(), 1);
        step(&mut limit, 0.5);
        assert_eq!(limit.limit(), 2);
        step(&mut limit, 0.5);
        assert_eq!(limit.limit(), 3);
    }

    #[test]
    fn test_watch_keeps_batch_below_limit() {
        let mut limit = ThreadLimit::with_limit(3, 7).unwrap();
        let mut in_flight = vec![AsyncTask::spawn("a", || Ok(1))];
        let done = limit.watch(&mut in_flight);
        assert!(done.is_empty());
        assert_eq!(in_flight.len(), 1);
        for mut task in in_flight {
            let _ = task.join();
        }
    }

    #[test]
    fn test_watch_drains_full_batch() {
        let mut limit = ThreadLimit::default();
        let mut in_flight = vec![AsyncTask::spawn("a", || Ok(1))];
        let done = limit.watch(&mut in_flight);
        assert!(in_flight.is_empty());
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].result(), Some(&1));
    }

    #[test]
    fn test_task_result() {
        let mut task = AsyncTask::spawn("answer", || Ok(42));
        let _ = task.join();
        assert!(task.is_finished());
        assert_eq!(task.result(), Some(&42));
        assert!(task.exception().is_none());
        assert_eq!(task.name(), "answer");
    }

    #[test]
    fn test_task_error_is_captured() {
        let mut task: AsyncTask<()> =
            AsyncTask::spawn("fails", || Err(ClientError::with_status("Not Found", 404)));
        let _ = task.join();
        assert!(task.result().is_none());
        assert_eq!(task.exception().unwrap().status(), 404);
    }

    #[test]
    fn test_task_panic_is_captured() {
        let task: AsyncTask<()> = AsyncTask::spawn("panics", || panic!("boom"));
        let err = task.into_outcome().unwrap_err();
        assert!(err.message().contains("boom"));
    }

    #[test]
    fn test_batch_survives_one_failure() {
        let mut limit = ThreadLimit::default();
        let jobs = (0..10_u32).map(|n| {
            move || {
                if n == 4 {
                    Err(ClientError::with_status("Conflict", 409))
                } else {
                    Ok(n * 2)
                }
            }
        });
        let tasks = run_throttled(&mut limit, jobs);

        assert_eq!(tasks.len(), 10);
        assert!(tasks.iter().all(AsyncTask::is_finished));
        assert_eq!(tasks.iter().filter(|t| t.exception().is_some()).count(), 1);
        let mut values: Vec<u32> = tasks.iter().filter_map(|t| t.result().copied()).collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 2, 4, 6, 10, 12, 14, 16, 18]);
    }
}
