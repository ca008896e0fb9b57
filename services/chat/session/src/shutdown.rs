//! Process-wide shutdown signalling.
//!
//! The signal handler never touches sockets. It fires a [`ShutdownTrigger`];
//! the accept loop and every running session hold a [`ShutdownSignal`] and
//! react by closing what they own.

use tokio::sync::watch;

/// Sending half; firing it is idempotent.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown of everything holding a matching signal
    pub fn trigger(&self) {
        // send_replace does not fail when all receivers are gone
        self.tx.send_replace(true);
    }

    /// Another signal observing this trigger
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half, cheap to clone into each session.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Create a connected trigger/signal pair
    pub fn new() -> (ShutdownTrigger, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, ShutdownSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_trigger, signal) = Self::new();
        signal
    }

    /// Resolve once shutdown is requested.
    ///
    /// If the trigger is dropped without firing, this never resolves.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
