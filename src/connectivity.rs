use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Synchronous connectivity check, injected wherever an online/offline
/// decision is made so the core stays testable without a real network.
pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Process-local connectivity signal.
///
/// Callers report transitions via [`set_online`](Self::set_online); decision
/// paths read the flag synchronously and the reconciler subscribes to the
/// watch channel so a regained connection wakes it immediately.
#[derive(Debug)]
pub struct ConnectivitySignal {
    online: AtomicBool,
    tx: watch::Sender<bool>,
}

impl ConnectivitySignal {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self {
            online: AtomicBool::new(initially_online),
            tx,
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
        // Send fails only when no receiver is alive, which is fine.
        let _ = self.tx.send(online);
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl ConnectivityProbe for ConnectivitySignal {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}
