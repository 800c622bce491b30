//! Pause handshake between the supervisor and framebuffer producers.
//!
//! Producers enter the gate before taking an update slot and leave it after
//! releasing the slot. Closing the gate refuses new entries, wakes producers
//! parked on a full pool, and waits until every entered producer has left.
//! Only then may the update queue be reset.

use std::sync::{Condvar, Mutex, MutexGuard};

use flume::{Receiver, Sender};
use log::debug;

use crate::error::UpdateError;

#[derive(Default)]
struct GateState {
    /// Present while open; dropping it disconnects every ticket's receiver.
    stop: Option<(Sender<()>, Receiver<()>)>,
    active: usize,
}

#[derive(Default)]
pub struct ProducerGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl ProducerGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn open(&self) {
        let mut state = self.lock();
        if state.stop.is_none() {
            state.stop = Some(flume::bounded(0));
            debug!("producer gate opened");
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().stop.is_some()
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    pub fn enter(&self) -> Result<ProducerTicket<'_>, UpdateError> {
        let mut state = self.lock();
        let cancel = match &state.stop {
            Some((_, rx)) => rx.clone(),
            None => return Err(UpdateError::Paused),
        };
        state.active += 1;
        Ok(ProducerTicket { gate: self, cancel })
    }

    /// Closes the gate and blocks until no producer is inside.
    pub fn close_and_wait(&self) {
        let mut state = self.lock();
        if state.stop.take().is_some() {
            debug!("producer gate closed, {} producer(s) inside", state.active);
        }
        while state.active > 0 {
            state = self.idle.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn leave(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            self.idle.notify_all();
        }
    }
}

/// Proof of entry. Its receiver disconnects when the gate closes.
pub struct ProducerTicket<'a> {
    gate: &'a ProducerGate,
    cancel: Receiver<()>,
}

impl ProducerTicket<'_> {
    pub fn cancel(&self) -> &Receiver<()> {
        &self.cancel
    }
}

impl Drop for ProducerTicket<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}
