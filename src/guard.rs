use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Single-flight flag for automation jobs. Acquisition is a synchronous
/// compare-and-swap, so no await point can separate the check from the set.
#[derive(Clone, Debug, Default)]
pub struct JobGuard {
    busy: Arc<AtomicBool>,
}

/// Held for the lifetime of one job; releases the guard when dropped,
/// whether the job returned, failed, or its task was torn down.
#[derive(Debug)]
pub struct JobPermit {
    busy: Arc<AtomicBool>,
}

impl JobGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<JobPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                debug!("job guard acquired");
                JobPermit {
                    busy: Arc::clone(&self.busy),
                }
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        debug!("job guard released");
    }
}
