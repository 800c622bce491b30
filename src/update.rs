//! Fixed pool of framebuffer-update descriptors and the FIFO built over it.
//!
//! Slots are identified by index. Two bounded channels carry those indices:
//! `free` holds the slots a producer may take, `queued` holds the slots
//! waiting for the update sender, in release order. The length of each
//! channel is its semaphore count; receiving consumes a unit, sending posts
//! one. Capacity is fixed at construction and nothing is allocated per update.
//!
//! Cancellable waits block on the slot channel alone and look at the cancel
//! channel between timeouts. Every waiter parks on a plain `recv_timeout`, so
//! any number of producers can share the free list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{error, trace, warn};

use crate::Rect;

/// Longest a cancelled waiter stays parked.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// One pending screen-damage region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateDescriptor {
    /// Whole-screen refresh; `rect` then covers the framebuffer.
    pub whole: bool,
    pub rect: Rect,
}

impl UpdateDescriptor {
    pub fn rect(rect: Rect) -> Self {
        Self { whole: false, rect }
    }

    pub fn whole(bounds: Rect) -> Self {
        Self { whole: true, rect: bounds }
    }
}

pub struct UpdateQueue {
    pool: Box<[Mutex<UpdateDescriptor>]>,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    queued_tx: Sender<usize>,
    queued_rx: Receiver<usize>,
    held: AtomicUsize,
}

impl UpdateQueue {
    pub fn new(capacity: usize) -> Self {
        let pool = (0..capacity)
            .map(|_| Mutex::new(UpdateDescriptor::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let (free_tx, free_rx) = flume::bounded(capacity);
        let (queued_tx, queued_rx) = flume::bounded(capacity);
        let queue = Self {
            pool,
            free_tx,
            free_rx,
            queued_tx,
            queued_rx,
            held: AtomicUsize::new(0),
        };
        queue.fill_free_list();
        queue
    }

    fn fill_free_list(&self) {
        for index in 0..self.pool.len() {
            self.post_free(index);
        }
    }

    /// Puts every slot back on the free list and empties the FIFO.
    ///
    /// Must not race an active producer or consumer: a slot they hold would
    /// be counted twice once they release it.
    pub fn reset(&self) {
        let held = self.held.load(Ordering::Acquire);
        if held != 0 {
            warn!("update queue reset with {held} slot(s) still held");
        }
        while self.queued_rx.try_recv().is_ok() {}
        while self.free_rx.try_recv().is_ok() {}
        self.held.store(0, Ordering::Release);
        self.fill_free_list();
    }

    pub fn capacity(&self) -> usize {
        self.pool.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_rx.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued_rx.len()
    }

    /// Slots taken by a producer or consumer and not yet released.
    pub fn held_count(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /* ----------------------------- producer ----------------------------- */

    /// Takes a free slot, blocking while every slot is queued or held.
    pub fn acquire_free(&self) -> FreeSlot<'_> {
        loop {
            match self.free_rx.recv() {
                Ok(index) => return self.hold_free(index),
                // unreachable: the sender lives in self
                Err(_) => error!("update free list disconnected"),
            }
        }
    }

    pub fn try_acquire_free(&self) -> Option<FreeSlot<'_>> {
        self.free_rx.try_recv().ok().map(|index| self.hold_free(index))
    }

    /// Like `acquire_free`, but gives up when `cancel` receives a message or
    /// disconnects. Returns `None` only in that case.
    pub fn acquire_free_or(&self, cancel: &Receiver<()>) -> Option<FreeSlot<'_>> {
        recv_or_cancel(&self.free_rx, cancel).map(|index| self.hold_free(index))
    }

    fn hold_free(&self, index: usize) -> FreeSlot<'_> {
        self.held.fetch_add(1, Ordering::AcqRel);
        trace!("slot {index} acquired by producer");
        FreeSlot { queue: self, index: Some(index) }
    }

    /* ----------------------------- consumer ----------------------------- */

    /// Takes the oldest queued slot, blocking while the FIFO is empty.
    pub fn acquire_queued(&self) -> QueuedSlot<'_> {
        loop {
            match self.queued_rx.recv() {
                Ok(index) => return self.hold_queued(index),
                Err(_) => error!("update queue disconnected"),
            }
        }
    }

    pub fn try_acquire_queued(&self) -> Option<QueuedSlot<'_>> {
        self.queued_rx.try_recv().ok().map(|index| self.hold_queued(index))
    }

    pub fn acquire_queued_or(&self, cancel: &Receiver<()>) -> Option<QueuedSlot<'_>> {
        recv_or_cancel(&self.queued_rx, cancel).map(|index| self.hold_queued(index))
    }

    fn hold_queued(&self, index: usize) -> QueuedSlot<'_> {
        self.held.fetch_add(1, Ordering::AcqRel);
        trace!("slot {index} acquired by consumer");
        QueuedSlot { queue: self, index: Some(index) }
    }

    /* ------------------------------ release ----------------------------- */

    fn post_free(&self, index: usize) {
        if self.free_tx.try_send(index).is_err() {
            error!("free list overflow, slot {index} lost");
        }
    }

    fn post_queued(&self, index: usize) {
        if self.queued_tx.try_send(index).is_err() {
            error!("update queue overflow, slot {index} lost");
        }
    }

    fn unhold(&self) {
        self.held.fetch_sub(1, Ordering::AcqRel);
    }

    fn slot(&self, index: usize) -> &Mutex<UpdateDescriptor> {
        &self.pool[index]
    }
}

fn recv_or_cancel(slots: &Receiver<usize>, cancel: &Receiver<()>) -> Option<usize> {
    loop {
        if !matches!(cancel.try_recv(), Err(TryRecvError::Empty)) {
            return None;
        }
        match slots.recv_timeout(CANCEL_POLL) {
            Ok(index) => return Some(index),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // unreachable: the sender lives in the queue
                error!("update channel disconnected");
                return None;
            }
        }
    }
}

fn lock_slot(slot: &Mutex<UpdateDescriptor>) -> std::sync::MutexGuard<'_, UpdateDescriptor> {
    // a descriptor is plain data, a poisoned lock still holds a usable value
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// A slot held by a producer. Dropping it unreleased returns it to the free
/// list.
pub struct FreeSlot<'a> {
    queue: &'a UpdateQueue,
    index: Option<usize>,
}

impl<'a> FreeSlot<'a> {
    pub fn index(&self) -> usize {
        self.index.unwrap_or_default()
    }

    pub fn fill(&mut self, update: UpdateDescriptor) {
        if let Some(index) = self.index {
            *lock_slot(self.queue.slot(index)) = update;
        }
    }

    /// Appends the slot at the tail of the FIFO.
    pub fn release_to_queue(mut self) {
        if let Some(index) = self.index.take() {
            self.queue.unhold();
            self.queue.post_queued(index);
            trace!("slot {index} queued");
        }
    }

    /// Returns the slot unused.
    pub fn release_free(mut self) {
        if let Some(index) = self.index.take() {
            self.queue.unhold();
            self.queue.post_free(index);
        }
    }
}

impl Drop for FreeSlot<'_> {
    fn drop(&mut self) {
        if let Some(index) = self.index.take() {
            self.queue.unhold();
            self.queue.post_free(index);
        }
    }
}

/// A slot taken off the FIFO by the consumer. Dropping it returns it to the
/// free list.
pub struct QueuedSlot<'a> {
    queue: &'a UpdateQueue,
    index: Option<usize>,
}

impl<'a> QueuedSlot<'a> {
    pub fn index(&self) -> usize {
        self.index.unwrap_or_default()
    }

    pub fn descriptor(&self) -> UpdateDescriptor {
        self.index
            .map(|index| *lock_slot(self.queue.slot(index)))
            .unwrap_or_default()
    }

    pub fn release_free(mut self) {
        if let Some(index) = self.index.take() {
            self.queue.unhold();
            self.queue.post_free(index);
            trace!("slot {index} freed");
        }
    }
}

impl Drop for QueuedSlot<'_> {
    fn drop(&mut self) {
        if let Some(index) = self.index.take() {
            self.queue.unhold();
            self.queue.post_free(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn update(n: u16) -> UpdateDescriptor {
        UpdateDescriptor::rect(Rect::new(n, n, 1, 1))
    }

    fn conserved(q: &UpdateQueue) -> bool {
        q.free_count() + q.queued_count() + q.held_count() == q.capacity()
    }

    #[test]
    fn capacity_is_conserved_across_operations() {
        let q = UpdateQueue::new(3);
        assert!(conserved(&q));
        let mut a = q.acquire_free();
        assert!(conserved(&q));
        a.fill(update(1));
        a.release_to_queue();
        assert!(conserved(&q));
        let b = q.acquire_free();
        assert_eq!(q.held_count(), 1);
        b.release_free();
        assert!(conserved(&q));
        let c = q.acquire_queued();
        assert!(conserved(&q));
        c.release_free();
        assert_eq!(q.free_count(), 3);
        assert_eq!(q.queued_count(), 0);
    }

    #[test]
    fn descriptors_leave_in_release_order() {
        let q = UpdateQueue::new(8);
        let mut order = Vec::new();
        for n in [5u16, 1, 7, 3] {
            let mut slot = q.acquire_free();
            slot.fill(update(n));
            order.push(slot.index());
            slot.release_to_queue();
        }
        for n in [5u16, 1, 7, 3] {
            let slot = q.acquire_queued();
            assert_eq!(slot.descriptor(), update(n));
            assert_eq!(slot.index(), order.remove(0));
            slot.release_free();
        }
        assert!(q.try_acquire_queued().is_none());
    }

    #[test]
    fn slot_is_never_free_and_queued_at_once() {
        let q = UpdateQueue::new(4);
        let slot = q.acquire_free();
        let index = slot.index();
        slot.release_to_queue();
        let mut held = Vec::new();
        while let Some(s) = q.try_acquire_free() {
            held.push(s);
        }
        assert_eq!(held.len(), 3);
        assert!(held.iter().all(|s| s.index() != index));
        assert_eq!(q.acquire_queued().index(), index);
    }

    #[test]
    fn dropped_slots_return_to_free_list() {
        let q = UpdateQueue::new(2);
        {
            let _a = q.acquire_free();
            let _b = q.acquire_free();
            assert_eq!(q.free_count(), 0);
        }
        assert_eq!(q.free_count(), 2);
        assert_eq!(q.held_count(), 0);

        q.acquire_free().release_to_queue();
        drop(q.acquire_queued());
        assert_eq!(q.free_count(), 2);
    }

    #[test]
    fn reset_restores_full_capacity() {
        let q = UpdateQueue::new(4);
        q.acquire_free().release_to_queue();
        q.acquire_free().release_to_queue();
        q.reset();
        assert_eq!(q.free_count(), 4);
        assert_eq!(q.queued_count(), 0);

        let slots: Vec<_> = (0..4).map(|_| q.try_acquire_free()).collect();
        assert!(slots.iter().all(Option::is_some));
        assert!(q.try_acquire_free().is_none());
    }

    #[test]
    fn acquire_blocks_until_a_slot_is_freed() {
        let q = Arc::new(UpdateQueue::new(1));
        q.acquire_free().release_to_queue();

        let (done_tx, done_rx) = flume::bounded(1);
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                let slot = q.acquire_free();
                let index = slot.index();
                slot.release_to_queue();
                done_tx.send(index).unwrap();
            })
        };
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

        q.acquire_queued().release_free();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        producer.join().unwrap();
        assert_eq!(q.queued_count(), 1);
    }

    #[test]
    fn cancel_wakes_blocked_acquire() {
        let q = Arc::new(UpdateQueue::new(1));
        let _held = q.try_acquire_free();
        let (cancel_tx, cancel_rx) = flume::bounded::<()>(0);

        let waiter = {
            let q = q.clone();
            thread::spawn(move || q.acquire_free_or(&cancel_rx).is_none())
        };
        thread::sleep(Duration::from_millis(20));
        drop(cancel_tx);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn racing_producers_never_share_a_slot() {
        const PRODUCERS: u16 = 4;
        const ROUNDS: usize = 1000;

        let q = Arc::new(UpdateQueue::new(4));
        let (_cancel_tx, cancel_rx) = flume::bounded::<()>(0);
        let building = Arc::new(Mutex::new(HashSet::new()));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = q.clone();
                let cancel = cancel_rx.clone();
                let building = building.clone();
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let mut slot = q.acquire_free_or(&cancel).expect("cancel is still open");
                        assert!(building.lock().unwrap().insert(slot.index()));
                        slot.fill(update(p));
                        assert!(building.lock().unwrap().remove(&slot.index()));
                        slot.release_to_queue();
                    }
                })
            })
            .collect();

        for _ in 0..PRODUCERS as usize * ROUNDS {
            let slot = q.acquire_queued();
            assert!(!building.lock().unwrap().contains(&slot.index()));
            slot.release_free();
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(q.free_count(), 4);
        assert_eq!(q.queued_count(), 0);
        assert_eq!(q.held_count(), 0);
    }

    #[test]
    fn cancel_wakes_blocked_consumer() {
        let q = Arc::new(UpdateQueue::new(2));
        let (cancel_tx, cancel_rx) = flume::bounded::<()>(0);
        let waiter = {
            let q = q.clone();
            thread::spawn(move || q.acquire_queued_or(&cancel_rx).is_none())
        };
        thread::sleep(Duration::from_millis(20));
        drop(cancel_tx);
        assert!(waiter.join().unwrap());
        assert_eq!(q.free_count(), 2);
    }
}
