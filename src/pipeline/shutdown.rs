//! Cooperative cancellation for worker loops.
//!
//! A [`ShutdownTrigger`] owns the only sender of a crossbeam channel that
//! never carries a message. Firing the trigger drops the sender, which every
//! cloned [`ShutdownSignal`] observes as a disconnect, including receivers
//! parked inside `select!`.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Observer side of a shutdown request.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self {
            rx: crossbeam_channel::never(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Wait up to `timeout`; true if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Block until shutdown is requested.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// For use in `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Owner side of a shutdown request.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.rx.clone(),
        }
    }

    pub fn fire(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_fired(&self) -> bool {
        self.signal().is_triggered()
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Named worker threads sharing one shutdown trigger.
#[derive(Debug, Default)]
pub struct WorkerGroup {
    trigger: ShutdownTrigger,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.trigger.signal()
    }

    pub fn spawn<F>(&self, name: String, body: F) -> std::io::Result<()>
    where
        F: FnOnce(ShutdownSignal) + Send + 'static,
    {
        let signal = self.trigger.signal();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || body(signal))?;
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire the trigger and join every worker except the calling thread.
    pub fn shutdown(&self) {
        self.trigger.fire();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let me = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!("worker thread '{}' panicked", name);
            }
        }
    }
}
