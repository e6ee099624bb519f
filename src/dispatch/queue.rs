//! Single-producer/single-consumer hand-off between the poller and the
//! dispatcher.
//!
//! Batches travel over an unbounded channel so append order is preserved
//! without a lock. The receiver drains everything currently buffered in one
//! call, and a shared counter tracks how many updates are still pending.

use crate::api::payload::Update;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Creates a connected sender/receiver pair.
pub fn update_queue() -> (UpdateSender, UpdateReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        UpdateSender {
            tx,
            pending: Arc::clone(&pending),
        },
        UpdateReceiver { rx, pending },
    )
}

/// Read-only view of the number of buffered updates.
#[derive(Debug, Clone)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct UpdateSender {
    tx: mpsc::UnboundedSender<Vec<Update>>,
    pending: Arc<AtomicUsize>,
}

impl UpdateSender {
    /// Appends `updates` in order. Returns `false` if the receiver has been
    /// closed, in which case the batch is dropped.
    pub fn push_batch(&self, updates: Vec<Update>) -> bool {
        if updates.is_empty() {
            return !self.tx.is_closed();
        }

        let count = updates.len();
        self.pending.fetch_add(count, Ordering::AcqRel);
        if self.tx.send(updates).is_err() {
            self.pending.fetch_sub(count, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth(Arc::clone(&self.pending))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct UpdateReceiver {
    rx: mpsc::UnboundedReceiver<Vec<Update>>,
    pending: Arc<AtomicUsize>,
}

impl UpdateReceiver {
    /// Removes and returns every update currently buffered, in append order.
    pub fn drain(&mut self) -> Vec<Update> {
        let mut drained = Vec::new();
        while let Ok(batch) = self.rx.try_recv() {
            drained.extend(batch);
        }
        self.settle(drained.len());
        drained
    }

    /// Waits until at least one update is buffered, then drains everything.
    ///
    /// Returns `None` once the sender is gone and nothing is left. Cancel safe:
    /// nothing is removed from the channel unless the future completes.
    pub async fn wait_for_updates(&mut self) -> Option<Vec<Update>> {
        loop {
            let first = self.rx.recv().await?;
            let mut drained = first;
            while let Ok(batch) = self.rx.try_recv() {
                drained.extend(batch);
            }
            self.settle(drained.len());
            if !drained.is_empty() {
                return Some(drained);
            }
        }
    }

    /// Closes the channel and drops whatever is still buffered, returning the
    /// number of discarded updates.
    pub fn close_and_discard(&mut self) -> usize {
        self.rx.close();
        self.drain().len()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn settle(&self, count: usize) {
        if count > 0 {
            self.pending.fetch_sub(count, Ordering::AcqRel);
        }
    }
}
