//! Pieces shared by the refresh and tier workers.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Chain data could not be fetched; the tick is skipped.
    #[error("fetch failed: {0:#}")]
    Fetch(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{worker} gave up after {failures} consecutive failed ticks: {last}")]
    TooManyFailures {
        worker: String,
        failures: u32,
        last: String,
    },
}

impl WorkerError {
    /// Errors that end the worker right away instead of skipping the tick.
    pub fn is_fatal(&self) -> bool {
        match self {
            WorkerError::Fetch(_) => false,
            WorkerError::Store(e) => !e.is_stale(),
            WorkerError::TooManyFailures { .. } => true,
        }
    }
}

/// Counts consecutive failed ticks and trips at a fixed limit.
#[derive(Debug)]
pub struct FailureGuard {
    worker: String,
    limit: u32,
    consecutive: u32,
}

impl FailureGuard {
    /// `limit == 0` disables the guard.
    pub fn new(worker: impl Into<String>, limit: u32) -> Self {
        Self {
            worker: worker.into(),
            limit,
            consecutive: 0,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Log a failed tick. Returns an error once the worker should stop.
    pub fn record_failure(&mut self, error: WorkerError) -> Result<(), WorkerError> {
        if error.is_fatal() {
            return Err(error);
        }

        self.consecutive += 1;
        warn!(
            worker = %self.worker,
            consecutive = self.consecutive,
            error = %error,
            "Tick failed, skipping"
        );

        if self.limit > 0 && self.consecutive >= self.limit {
            return Err(WorkerError::TooManyFailures {
                worker: self.worker.clone(),
                failures: self.consecutive,
                last: error.to_string(),
            });
        }
        Ok(())
    }
}

/// Run `tick` until cancelled, sleeping `period` after each tick ends.
///
/// The first tick runs immediately. A slow tick pushes the next one back by
/// its own duration, so the idle gap between ticks is always `period`.
pub async fn run_ticks<T, F, Fut>(
    period: Duration,
    guard: &mut FailureGuard,
    cancel: &CancellationToken,
    mut tick: F,
) -> Result<(), WorkerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = tick() => result,
        };
        match result {
            Ok(_) => guard.record_success(),
            Err(e) => guard.record_failure(e)?,
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(period) => {}
        }
    }
}

/// Current unix time in seconds.
pub fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Instant;

    fn fetch_error() -> WorkerError {
        WorkerError::Fetch(anyhow::anyhow!("connection refused"))
    }

    #[test]
    fn test_guard_trips_at_limit() {
        let mut guard = FailureGuard::new("tier-0", 3);
        assert!(guard.record_failure(fetch_error()).is_ok());
        assert!(guard.record_failure(fetch_error()).is_ok());

        let err = guard.record_failure(fetch_error()).unwrap_err();
        assert!(matches!(err, WorkerError::TooManyFailures { failures: 3, .. }));
    }

    #[test]
    fn test_success_resets_count() {
        let mut guard = FailureGuard::new("refresh", 2);
        guard.record_failure(fetch_error()).unwrap();
        guard.record_success();
        assert_eq!(guard.consecutive(), 0);
        assert!(guard.record_failure(fetch_error()).is_ok());
    }

    #[test]
    fn test_unavailable_store_is_fatal() {
        let mut guard = FailureGuard::new("tier-1", 10);
        let err = guard
            .record_failure(WorkerError::Store(StoreError::Unavailable("down".into())))
            .unwrap_err();
        assert!(matches!(err, WorkerError::Store(_)));

        let stale = WorkerError::Store(StoreError::Stale { expected: 1, actual: 2 });
        assert!(guard.record_failure(stale).is_ok());
    }

    #[tokio::test]
    async fn test_slow_tick_keeps_full_idle_gap() {
        let period = Duration::from_millis(50);
        let spans = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let mut guard = FailureGuard::new("slow", 0);

        let recorded = spans.clone();
        let stop = cancel.clone();
        run_ticks(period, &mut guard, &cancel, || {
            let recorded = recorded.clone();
            let stop = stop.clone();
            async move {
                let start = Instant::now();
                tokio::time::sleep(Duration::from_millis(120)).await;
                let mut spans = recorded.lock();
                spans.push((start, Instant::now()));
                if spans.len() == 4 {
                    stop.cancel();
                }
                Ok::<_, WorkerError>(())
            }
        })
        .await
        .unwrap();

        let spans = spans.lock();
        assert_eq!(spans.len(), 4);
        for pair in spans.windows(2) {
            let idle = pair[1].0.duration_since(pair[0].1);
            assert!(idle >= Duration::from_millis(45), "idle gap {idle:?}");
        }
    }

    #[tokio::test]
    async fn test_run_ticks_propagates_fatal_error() {
        let mut guard = FailureGuard::new("tier-0", 10);
        let cancel = CancellationToken::new();
        let err = run_ticks(Duration::from_millis(1), &mut guard, &cancel, || async {
            Err::<(), _>(WorkerError::Store(StoreError::Unavailable("down".into())))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, WorkerError::Store(_)));
    }

    #[test]
    fn test_zero_limit_never_trips() {
        let mut guard = FailureGuard::new("refresh", 0);
        for _ in 0..100 {
            assert!(guard.record_failure(fetch_error()).is_ok());
        }
    }
}
