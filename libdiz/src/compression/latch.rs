use std::io;
use std::sync::{Mutex, OnceLock, PoisonError};

use crossbeam_channel::{Receiver, Sender};

/// First-error-wins cell shared by the writer, the workers and the drain.
///
/// Once an error is set, `signal()` receivers observe a disconnected channel,
/// which lets a writer blocked on a full slot queue wake up.
pub(crate) struct ErrorLatch {
    error: OnceLock<(io::ErrorKind, String)>,
    notify: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl ErrorLatch {
    pub(crate) fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            error: OnceLock::new(),
            notify: Mutex::new(Some(tx)),
            signal: rx,
        }
    }

    /// Records `err` unless an earlier error is already latched.
    pub(crate) fn set(&self, err: &io::Error) {
        if self.error.set((err.kind(), err.to_string())).is_ok() {
            tracing::debug!("compression pipeline failed: {err}");
            self.notify
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
    }

    pub(crate) fn get(&self) -> Option<io::Error> {
        self.error
            .get()
            .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }

    pub(crate) fn check(&self) -> io::Result<()> {
        match self.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn signal(&self) -> &Receiver<()> {
        &self.signal
    }
}
