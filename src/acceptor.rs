//! One-shot listen/accept for a session.
//!
//! Each connection attempt creates a fresh listening socket and drops it as
//! soon as a client is accepted, so a display never queues a second client
//! behind the first.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error, info};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::ConnectError;
use crate::session::{Session, SessionState};

const BACKLOG: i32 = 5;

/// Waits for one client on `addr` and attaches it to `session`.
///
/// The session must be `Initialized`; calling this twice without a reset in
/// between is a caller bug and returns `InvalidState` without touching the
/// network. On failure the listener is closed and the state is unchanged.
pub fn connect(session: &Session, addr: SocketAddr) -> Result<SocketAddr, ConnectError> {
    let state = session.state();
    if state != SessionState::Initialized {
        error!("display {}: connect called in state {:?}", session.display(), state);
        return Err(ConnectError::InvalidState(state));
    }

    let listener = Listener::open(addr, session.listener_counter())?;
    info!("display {}: listening on {}", session.display(), addr);

    let (client, peer) = listener.accept()?;
    drop(listener);

    info!("display {}: client connected from {}", session.display(), peer);
    session.attach_client(client, peer);
    Ok(peer)
}

struct Listener<'a> {
    socket: Socket,
    open: &'a AtomicUsize,
}

impl<'a> Listener<'a> {
    fn open(addr: SocketAddr, open: &'a AtomicUsize) -> Result<Self, ConnectError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ConnectError::SocketFailed)?;
        open.fetch_add(1, Ordering::AcqRel);
        let listener = Listener { socket, open };

        listener
            .socket
            .set_reuse_address(true)
            .map_err(ConnectError::BindFailed)?;
        listener.socket.bind(&addr.into()).map_err(|e| {
            if e.kind() == io::ErrorKind::AddrInUse {
                ConnectError::AddressInUse(addr)
            } else {
                ConnectError::BindFailed(e)
            }
        })?;
        listener
            .socket
            .listen(BACKLOG)
            .map_err(ConnectError::ListenFailed)?;
        Ok(listener)
    }

    fn accept(&self) -> Result<(TcpStream, SocketAddr), ConnectError> {
        let (socket, peer) = self.socket.accept().map_err(ConnectError::AcceptFailed)?;
        let peer = peer.as_socket().ok_or_else(|| {
            ConnectError::AcceptFailed(io::Error::new(
                io::ErrorKind::InvalidData,
                "peer is not an inet address",
            ))
        })?;
        Ok((socket.into(), peer))
    }
}

impl Drop for Listener<'_> {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        debug!("listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Framebuffer, Geometry};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn session() -> Arc<Session> {
        let fb = Arc::new(Framebuffer::new(Geometry::new(16, 16)).unwrap());
        let session = Arc::new(Session::new(0, 4, fb.clone()));
        session.reset(fb);
        session
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
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
    fn accepts_one_client_and_closes_listener() {
        let session = session();
        let addr: SocketAddr = ([127, 0, 0, 1], free_port()).into();

        let server = {
            let session = session.clone();
            thread::spawn(move || session.connect(addr))
        };
        let mut client = dial(addr);
        let peer = server.join().unwrap().unwrap();

        assert_eq!(peer, client.local_addr().unwrap());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.open_listeners(), 0);

        let mut stream = session.client_stream().unwrap();
        stream.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        // the listener is gone, nobody else can attach
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn bind_failure_keeps_state_and_releases_listener() {
        let session = session();
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let err = session.connect(addr).unwrap_err();
        assert!(matches!(err, ConnectError::AddressInUse(a) if a == addr), "{err}");
        assert_eq!(session.state(), SessionState::Initialized);
        assert_eq!(session.open_listeners(), 0);
    }

    #[test]
    fn second_connect_without_reset_is_rejected() {
        let session = session();
        let addr: SocketAddr = ([127, 0, 0, 1], free_port()).into();
        let server = {
            let session = session.clone();
            thread::spawn(move || session.connect(addr))
        };
        let _client = dial(addr);
        server.join().unwrap().unwrap();

        let err = session.connect(addr).unwrap_err();
        assert!(matches!(err, ConnectError::InvalidState(SessionState::Connected)));
        assert_eq!(session.open_listeners(), 0);
    }
}
