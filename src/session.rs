//! Per-display session record.
//!
//! One `Session` exists per display for the life of the process. It is reset,
//! never dropped, between client connections, so the descriptor pool and the
//! framebuffer allocation are reused by every client.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};

use crate::acceptor;
use crate::error::{ConnectError, UpdateError};
use crate::framebuffer::Framebuffer;
use crate::gate::{ProducerGate, ProducerTicket};
use crate::semaphore::Semaphore;
use crate::update::{FreeSlot, UpdateDescriptor, UpdateQueue};
use crate::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Uninitialized,
    /// Pool reset, no transport open.
    Initialized,
    /// Client transport open, listener closed.
    Connected,
    /// Negotiation finished.
    Running,
}

struct Inner {
    state: SessionState,
    client: Option<TcpStream>,
    peer: Option<SocketAddr>,
    framebuffer: Arc<Framebuffer>,
}

pub struct Session {
    display: usize,
    inner: Mutex<Inner>,
    updates: UpdateQueue,
    producers: ProducerGate,
    ready: Semaphore,
    listeners: AtomicUsize,
}

impl Session {
    pub fn new(display: usize, updates: usize, framebuffer: Arc<Framebuffer>) -> Self {
        Self {
            display,
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                client: None,
                peer: None,
                framebuffer,
            }),
            updates: UpdateQueue::new(updates),
            producers: ProducerGate::new(),
            ready: Semaphore::new(0),
            listeners: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn display(&self) -> usize {
        self.display
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn framebuffer(&self) -> Arc<Framebuffer> {
        self.lock().framebuffer.clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer
    }

    pub fn updates(&self) -> &UpdateQueue {
        &self.updates
    }

    /// Listening sockets currently open on behalf of this session.
    pub fn open_listeners(&self) -> usize {
        self.listeners.load(Ordering::Acquire)
    }

    pub(crate) fn listener_counter(&self) -> &AtomicUsize {
        &self.listeners
    }

    /* ---------------------------- state machine --------------------------- */

    /// Returns the session to `Initialized` for the next client.
    ///
    /// Producers are paused and drained first. The caller must have stopped
    /// the update sender: a consumer still draining the queue would break the
    /// free/queued partition.
    pub fn reset(&self, framebuffer: Arc<Framebuffer>) {
        self.producers.close_and_wait();

        let mut inner = self.lock();
        if inner.state >= SessionState::Connected {
            if let Some(client) = inner.client.take() {
                if let Err(e) = client.shutdown(Shutdown::Both) {
                    debug!("display {}: client shutdown: {}", self.display, e);
                }
            }
            info!("display {}: closed connection to {:?}", self.display, inner.peer);
        }
        inner.client = None;
        inner.peer = None;

        self.updates.reset();
        self.ready.reset(0);
        inner.framebuffer = framebuffer;
        inner.state = SessionState::Initialized;
        debug!("display {}: session initialized", self.display);
    }

    /// Blocks until one client connects on `addr`. See `acceptor::connect`.
    pub fn connect(&self, addr: SocketAddr) -> Result<SocketAddr, ConnectError> {
        acceptor::connect(self, addr)
    }

    pub(crate) fn attach_client(&self, client: TcpStream, peer: SocketAddr) {
        let mut inner = self.lock();
        inner.client = Some(client);
        inner.peer = Some(peer);
        inner.state = SessionState::Connected;
    }

    pub fn mark_running(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Connected {
            inner.state = SessionState::Running;
        } else {
            warn!("display {}: cannot run from {:?}", self.display, inner.state);
        }
    }

    /// A new handle to the client transport.
    pub fn client_stream(&self) -> io::Result<TcpStream> {
        match &self.lock().client {
            Some(client) => client.try_clone(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no client connected")),
        }
    }

    /* ---------------------------- driver facing --------------------------- */

    /// Lets producers in and wakes a driver waiting for readiness. Called
    /// once the update sender is running.
    pub fn open_producers(&self) {
        self.producers.open();
        self.ready.post();
    }

    /// Refuses new producers and waits for the ones inside to finish.
    pub fn close_producers(&self) {
        self.producers.close_and_wait();
    }

    pub fn producers_open(&self) -> bool {
        self.producers.is_open()
    }

    /// Blocks until the session can take updates.
    pub fn wait_ready(&self) {
        self.ready.wait();
    }

    pub fn wait_ready_timeout(&self, timeout: Duration) -> bool {
        self.ready.wait_timeout(timeout)
    }

    /// Takes a free descriptor, blocking while the pool is exhausted. Fails
    /// with `Paused` when no sender is running or when the gate closes while
    /// waiting.
    pub fn acquire_free(&self) -> Result<ProducerSlot<'_>, UpdateError> {
        let ticket = self.producers.enter()?;
        let slot = self
            .updates
            .acquire_free_or(ticket.cancel())
            .ok_or(UpdateError::Paused)?;
        Ok(ProducerSlot { slot, ticket })
    }

    pub fn try_acquire_free(&self) -> Result<ProducerSlot<'_>, UpdateError> {
        let ticket = self.producers.enter()?;
        let slot = self.updates.try_acquire_free().ok_or(UpdateError::Full)?;
        Ok(ProducerSlot { slot, ticket })
    }

    fn clip(&self, rect: Rect) -> Result<Rect, UpdateError> {
        let rect = rect.intersect(&self.framebuffer().geometry().bounds());
        if rect.is_empty() {
            return Err(UpdateError::EmptyRegion);
        }
        Ok(rect)
    }

    /// Queues the damaged region `rect`, clipped to the screen.
    pub fn post_update(&self, rect: Rect) -> Result<(), UpdateError> {
        let rect = self.clip(rect)?;
        let mut slot = self.acquire_free()?;
        slot.fill(UpdateDescriptor::rect(rect));
        slot.release_to_queue();
        Ok(())
    }

    pub fn try_post_update(&self, rect: Rect) -> Result<(), UpdateError> {
        let rect = self.clip(rect)?;
        let mut slot = self.try_acquire_free()?;
        slot.fill(UpdateDescriptor::rect(rect));
        slot.release_to_queue();
        Ok(())
    }

    /// Queues a whole-screen refresh without blocking.
    pub fn post_full_update(&self) -> Result<(), UpdateError> {
        let bounds = self.framebuffer().geometry().bounds();
        let mut slot = self.try_acquire_free()?;
        slot.fill(UpdateDescriptor::whole(bounds));
        slot.release_to_queue();
        Ok(())
    }
}

/// An update slot taken through the producer gate. The gate stays entered
/// until the slot is released or dropped.
pub struct ProducerSlot<'a> {
    // dropped before the ticket, so the slot is back before the gate sees us leave
    slot: FreeSlot<'a>,
    ticket: ProducerTicket<'a>,
}

impl ProducerSlot<'_> {
    pub fn index(&self) -> usize {
        self.slot.index()
    }

    pub fn fill(&mut self, update: UpdateDescriptor) {
        self.slot.fill(update);
    }

    pub fn release_to_queue(self) {
        let ProducerSlot { slot, ticket } = self;
        slot.release_to_queue();
        drop(ticket);
    }

    pub fn release_free(self) {
        let ProducerSlot { slot, ticket } = self;
        slot.release_free();
        drop(ticket);
    }
}
