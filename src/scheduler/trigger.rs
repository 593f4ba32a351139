//! Debounced manual-trigger mailbox.
//!
//! Capacity-1 channel: a burst of trigger requests while a run is active
//! collapses to at most one pending extra run. The consumer side lives in the
//! serve loop and spawns the guarded job fire-and-forget for each signal.

use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct TriggerChannel {
    tx: mpsc::Sender<()>,
}

impl TriggerChannel {
    /// Create the mailbox. The receiver is the single consumer; dropping the
    /// last `TriggerChannel` clone closes it and ends the consumer loop.
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Non-blocking send. A second signal while one is pending is dropped,
    /// never queued.
    pub fn signal(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => {
                info!("check triggered");
                true
            }
            Err(mpsc::error::TrySendError::Full(())) => {
                warn!("trigger already pending, dropping signal");
                false
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                warn!("trigger mailbox closed, dropping signal");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_collapses_to_one_pending_signal() {
        let (trigger, mut rx) = TriggerChannel::channel();

        assert!(trigger.signal());
        for _ in 0..10 {
            assert!(!trigger.signal());
        }

        // Exactly one signal was queued.
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());

        // Slot free again after consumption.
        assert!(trigger.signal());
    }

    #[tokio::test]
    async fn test_consumer_loop_exits_when_senders_drop() {
        let (trigger, mut rx) = TriggerChannel::channel();
        drop(trigger);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_signal_after_close_is_a_noop() {
        let (trigger, rx) = TriggerChannel::channel();
        drop(rx);
        assert!(!trigger.signal());
    }
}
