use crate::RuntimeError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared cancellation flag, checked at every point where a worker blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), RuntimeError> {
        if self.is_cancelled() {
            Err(RuntimeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Sleep for `total`, failing early on cancellation or once `limit` is hit.
pub(crate) fn pause(
    total: Duration,
    limit: Duration,
    cancel: &CancelToken,
    operation: &'static str,
) -> Result<(), RuntimeError> {
    let started = Instant::now();
    loop {
        cancel.check()?;
        let elapsed = started.elapsed();
        if elapsed >= total {
            return Ok(());
        }
        if elapsed >= limit {
            return Err(RuntimeError::Timeout { operation, limit });
        }
        std::thread::sleep(POLL_INTERVAL.min(total - elapsed));
    }
}

pub(crate) fn poll_interval() -> Duration {
    POLL_INTERVAL
}
