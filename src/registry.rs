use std::sync::{Arc, OnceLock};

use log::info;

use crate::error::RegistryError;
use crate::session::Session;
use crate::RFB_MAX_DISPLAYS;

/// Display number → session table, built once at startup and shared with
/// everything that posts updates. Entries are written once and never cleared.
pub struct Registry {
    sessions: [OnceLock<Arc<Session>>; RFB_MAX_DISPLAYS],
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    pub fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        let display = session.display();
        let entry = self
            .sessions
            .get(display)
            .ok_or(RegistryError::OutOfRange(display))?;
        entry
            .set(session)
            .map_err(|_| RegistryError::AlreadyRegistered(display))?;
        info!("display {display}: session registered");
        Ok(())
    }

    /// The session serving `display`, if its supervisor has started.
    pub fn lookup(&self, display: usize) -> Option<Arc<Session>> {
        self.sessions.get(display)?.get().cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
