//! Single-fire shutdown signal shared between the message loop, the
//! connection manager and whoever stops the service.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::time::Duration;

/// Nothing is ever sent on the channel. Firing the token drops the only
/// sender, which disconnects every receiver at once.
#[derive(Debug)]
pub struct ShutdownToken {
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            trigger: Mutex::new(Some(tx)),
            signal: rx,
        }
    }

    /// Fire the signal. Returns `true` only for the call that fired it.
    pub fn cancel(&self) -> bool {
        self.trigger.lock().take().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `timeout` unless the signal fires first.
    ///
    /// Returns `true` if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.signal.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        // recv can only ever fail with a disconnect.
        let _ = self.signal.recv();
    }
}
