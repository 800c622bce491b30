//! Per-display supervisor loop.
//!
//! The supervisor owns the framebuffer and the session for the life of the
//! process and serves one client at a time:
//! reset → accept → negotiate → start sender → ready → receive → stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{HandlerError, ServerError};
use crate::framebuffer::Framebuffer;
use crate::registry::Registry;
use crate::session::Session;

/// Pause before retrying after the listener could not be set up.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Protocol collaborators invoked by the supervisor.
pub trait SessionHandler: Send + Sync {
    /// Security and pixel-format handshake on a freshly connected client.
    fn negotiate(&self, session: &Arc<Session>) -> Result<(), HandlerError>;

    /// Spawns the thread that drains the session's update queue.
    fn start_update_sender(&self, session: &Arc<Session>) -> Result<(), HandlerError>;

    /// Stops and joins the update sender. Any slot it holds must be back on
    /// the free list when this returns.
    fn stop_update_sender(&self, session: &Arc<Session>) -> Result<(), HandlerError>;

    /// Handles client messages on the calling thread until the client goes
    /// away. `Ok` means an orderly close.
    fn run_receiver(&self, session: &Arc<Session>) -> Result<(), HandlerError>;
}

pub struct Supervisor<H> {
    framebuffer: Arc<Framebuffer>,
    session: Arc<Session>,
    listen: SocketAddr,
    handler: H,
}

impl<H: SessionHandler> Supervisor<H> {
    /// Allocates the display's framebuffer and session and registers it.
    /// Every error here is a startup failure.
    pub fn start(config: &ServerConfig, registry: &Registry, handler: H) -> Result<Self, ServerError> {
        config.validate()?;
        let listen = config.listen_addr()?;

        let framebuffer = Arc::new(Framebuffer::new(config.geometry)?);
        let session = Arc::new(Session::new(config.display, config.updates, framebuffer.clone()));
        registry.register(session.clone())?;

        info!(
            "display {}: {}x{} framebuffer, {} update descriptors",
            config.display, config.geometry.width, config.geometry.height, config.updates
        );
        Ok(Self { framebuffer, session, listen, handler })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn framebuffer(&self) -> &Arc<Framebuffer> {
        &self.framebuffer
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Serves one client from reset to disconnect.
    pub fn serve_once(&self) -> Result<(), ServerError> {
        let display = self.session.display();

        // release the last session and prepare for the next client
        self.session.reset(self.framebuffer.clone());

        let peer = self.session.connect(self.listen)?;
        debug!("display {display}: new connection from {peer}");

        self.handler
            .negotiate(&self.session)
            .map_err(ServerError::Negotiation)?;
        self.session.mark_running();

        self.handler
            .start_update_sender(&self.session)
            .map_err(ServerError::UpdaterStart)?;

        // only now can queued updates drain
        self.session.open_producers();

        match self.handler.run_receiver(&self.session) {
            Ok(()) => info!("display {display}: client {peer} disconnected"),
            Err(e) => warn!("display {display}: session with {peer} terminated: {e}"),
        }

        self.session.close_producers();
        self.handler
            .stop_update_sender(&self.session)
            .map_err(ServerError::UpdaterStop)?;
        Ok(())
    }

    /// Serves clients forever. Per-connection failures are logged and the
    /// session is reset for the next attempt.
    pub fn run(&self) -> ! {
        loop {
            match self.serve_once() {
                Ok(()) => {}
                Err(ServerError::Connection(e)) => {
                    error!("display {}: {}", self.session.display(), e);
                    thread::sleep(RETRY_DELAY);
                }
                Err(e) => error!("display {}: {}", self.session.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Geometry, SessionState};
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        /// Negotiations still to fail.
        failures: AtomicUsize,
        calls: Mutex<Vec<&'static str>>,
    }

    impl Script {
        fn log(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SessionHandler for Script {
        fn negotiate(&self, session: &Arc<Session>) -> Result<(), HandlerError> {
            self.log("negotiate");
            assert_eq!(session.state(), SessionState::Connected);
            let failing = self
                .failures
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(HandlerError::Protocol("scripted failure".into()));
            }
            Ok(())
        }
        fn start_update_sender(&self, session: &Arc<Session>) -> Result<(), HandlerError> {
            self.log("start");
            assert!(!session.producers_open());
            Ok(())
        }
        fn stop_update_sender(&self, session: &Arc<Session>) -> Result<(), HandlerError> {
            self.log("stop");
            assert!(!session.producers_open());
            Ok(())
        }
        fn run_receiver(&self, session: &Arc<Session>) -> Result<(), HandlerError> {
            self.log("receive");
            assert!(session.producers_open());
            assert_eq!(session.state(), SessionState::Running);
            Ok(())
        }
    }

    fn config() -> ServerConfig {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        config_on(port)
    }

    fn config_on(port: u16) -> ServerConfig {
        ServerConfig {
            geometry: Geometry::new(16, 16),
            updates: 4,
            bind: [127, 0, 0, 1].into(),
            port_base: port,
            ..Default::default()
        }
    }

    fn dial(addr: SocketAddr) -> TcpStream {
        for _ in 0..200 {
            if let Ok(stream) = TcpStream::connect(addr) {
                return stream;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("could not connect to {addr}");
    }

    #[test]
    fn start_registers_session() {
        let registry = Registry::new();
        let sup = Supervisor::start(&config(), &registry, Script::default()).unwrap();
        assert!(Arc::ptr_eq(&registry.lookup(0).unwrap(), sup.session()));

        let again = Supervisor::start(&config(), &registry, Script::default());
        assert!(matches!(again, Err(ServerError::Registry(_))));
    }

    #[test]
    fn serve_once_runs_collaborators_in_order() {
        let registry = Registry::new();
        let sup = Arc::new(Supervisor::start(&config(), &registry, Script::default()).unwrap());
        let server = {
            let sup = sup.clone();
            thread::spawn(move || sup.serve_once())
        };
        let _client = dial(sup.listen_addr());
        server.join().unwrap().unwrap();
        assert_eq!(sup.handler().calls(), ["negotiate", "start", "receive", "stop"]);
    }

    #[test]
    fn negotiation_failure_abandons_attempt() {
        let registry = Registry::new();
        let script = Script { failures: AtomicUsize::new(1), ..Default::default() };
        let sup = Arc::new(Supervisor::start(&config(), &registry, script).unwrap());
        let server = {
            let sup = sup.clone();
            thread::spawn(move || sup.serve_once())
        };
        let _client = dial(sup.listen_addr());
        let result = server.join().unwrap();
        assert!(matches!(result, Err(ServerError::Negotiation(_))));
        assert_eq!(sup.handler().calls(), ["negotiate"]);
        assert!(!sup.session().producers_open());
    }

    #[test]
    fn failed_negotiation_leaves_session_reusable() {
        let registry = Registry::new();
        let script = Script { failures: AtomicUsize::new(1), ..Default::default() };
        let sup = Arc::new(Supervisor::start(&config(), &registry, script).unwrap());
        let server = {
            let sup = sup.clone();
            thread::spawn(move || (sup.serve_once(), sup.serve_once()))
        };

        let mut rejected = dial(sup.listen_addr());
        rejected.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        // closed by the reset that starts the second attempt
        let mut buf = [0u8; 1];
        assert_eq!(rejected.read(&mut buf).unwrap(), 0);

        let _accepted = dial(sup.listen_addr());
        let (first, second) = server.join().unwrap();
        assert!(matches!(first, Err(ServerError::Negotiation(_))));
        second.unwrap();
        assert_eq!(
            sup.handler().calls(),
            ["negotiate", "negotiate", "start", "receive", "stop"]
        );
        let updates = sup.session().updates();
        assert_eq!(updates.free_count(), updates.capacity());
        assert_eq!(sup.session().open_listeners(), 0);
    }

    #[test]
    fn run_retries_until_the_port_is_free() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = config_on(taken.local_addr().unwrap().port());
        let registry = Registry::new();
        let sup = Arc::new(Supervisor::start(&config, &registry, Script::default()).unwrap());
        {
            let sup = sup.clone();
            // never returns; parked in accept once the test is done
            thread::spawn(move || sup.run());
        }

        thread::sleep(Duration::from_millis(200));
        assert!(sup.handler().calls().is_empty());
        assert_eq!(sup.session().open_listeners(), 0);

        drop(taken);
        let _client = dial(sup.listen_addr());
        for _ in 0..500 {
            if sup.handler().calls().len() == 4 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sup.handler().calls(), ["negotiate", "start", "receive", "stop"]);
    }
}
