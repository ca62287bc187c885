//! Unbounded work queue with an in-flight counter.
//!
//! The counter is bumped on push and only dropped by [`WorkQueue::complete`]
//! once the consumer has finished dispatching the item, so `in_flight() == 0`
//! means nothing is queued *and* nothing is being processed.

use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct WorkQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    in_flight: AtomicUsize,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, item: T) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        // The queue holds its own receiver, so the channel never disconnects.
        if self.tx.send(item).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Consumer handle for `select!` loops.
    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    /// Mark one popped item as fully handled.
    pub fn complete(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Items pushed and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Items waiting to be popped.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_tracks_completion_not_pop() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 2);
        let rx = queue.receiver();
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), 2);
        queue.complete();
        assert_eq!(queue.in_flight(), 1);
    }
}
