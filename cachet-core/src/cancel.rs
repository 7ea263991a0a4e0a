//! Caller cancellation signal.
//!
//! A [`CancelHandle`] owns the trigger; any number of cloned
//! [`CancelSignal`]s observe it. Built on a `tokio::sync::watch` channel.

use tokio::sync::watch;

/// Trigger side of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observer side of a cancellation pair.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Pends forever if the handle is
    /// dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn(async move { signal.cancelled().await });
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_resolves_immediately() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let late = handle.signal();
        tokio::time::timeout(Duration::from_millis(50), late.cancelled())
            .await
            .expect("should resolve");
        assert!(signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signal_stays_pending() {
        let signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_secs(5), signal.cancelled()).await;
        assert!(result.is_err());
        assert!(!signal.is_cancelled());
    }
}
