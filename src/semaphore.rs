//! Counting semaphore built from a channel of unit tokens.
//!
//! The number of queued tokens is the count. `post` never blocks and `wait`
//! parks the caller inside flume until a token arrives, so there is no polling.

use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use log::error;

pub struct Semaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        let (tx, rx) = flume::unbounded();
        let sem = Self { tx, rx };
        sem.post_n(count);
        sem
    }

    pub fn post(&self) {
        if self.tx.send(()).is_err() {
            // unreachable: the receiver lives in self
            error!("semaphore channel disconnected");
        }
    }

    fn post_n(&self, n: usize) {
        for _ in 0..n {
            self.post();
        }
    }

    pub fn wait(&self) {
        if self.rx.recv().is_err() {
            // unreachable: the sender lives in self
            error!("semaphore channel disconnected");
        }
    }

    pub fn try_wait(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Returns false when the timeout expired without a token.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    pub fn count(&self) -> usize {
        self.rx.len()
    }

    /// Discards pending tokens and sets the count to `count`.
    pub fn reset(&self, count: usize) {
        while self.rx.try_recv().is_ok() {}
        self.post_n(count);
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}
