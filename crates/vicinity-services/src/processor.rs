//! Wake-up signal to the action processor.
//!
//! The reconciler signals after every committing transaction that
//! enqueued work. Multiple signals before the processor wakes collapse
//! into a single wake-up.

use std::sync::Arc;

use tokio::sync::Notify;

/// Cloneable, non-blocking wake-up handle. One side calls [`signal`],
/// the processor's worker awaits [`notified`].
///
/// [`signal`]: ProcessorSignal::signal
/// [`notified`]: ProcessorSignal::notified
#[derive(Clone, Default)]
pub struct ProcessorSignal {
    notify: Arc<Notify>,
}

impl ProcessorSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the processor. Never blocks; coalesces with pending signals.
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    /// Wait for the next signal. Consumes at most one stored permit.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pending_signals_collapse_into_one() {
        let signal = ProcessorSignal::new();
        signal.signal();
        signal.signal();
        signal.signal();

        // One stored permit is consumed...
        tokio::time::timeout(Duration::from_millis(50), signal.notified())
            .await
            .expect("first wake-up should fire");

        // ...and nothing further is pending.
        let second =
            tokio::time::timeout(Duration::from_millis(50), signal.notified()).await;
        assert!(second.is_err(), "signals must coalesce");
    }
}
