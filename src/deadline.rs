use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;

/// The one clock every client of a run shares.
///
/// Clients poll [`Deadline::is_expired`] between steps; the orchestrator
/// waits on [`Deadline::expired`]. Firing it more than once is harmless.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    expired: AtomicBool,
    notify: Notify,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the deadline now
    pub fn expire(&self) {
        if !self.inner.expired.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_expired(&self) -> bool {
        self.inner.expired.load(Ordering::Acquire)
    }

    /// Resolves once the deadline has fired
    pub async fn expired(&self) {
        // registered before the flag check so a concurrent expire() is not missed
        let notified = self.inner.notify.notified();
        if self.is_expired() {
            return;
        }
        notified.await;
    }

    /// Spawns the timer that fires the deadline after `duration`
    pub fn arm(&self, duration: Duration) -> tokio::task::JoinHandle<()> {
        let deadline = self.clone();
        tokio::spawn(async move {
            sleep(duration).await;
            tracing::debug!("Deadline reached");
            deadline.expire();
        })
    }
}
