//! Minimal RFB collaborator: security None, raw encoding, native pixel
//! format only.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, trace, warn};

use crate::error::{HandlerError, UpdateError};
use crate::protocol::{
    self, ClientEvent, PixelFormat, ServerInit, Version, ENCODING_RAW, PROTOCOL_VERSION,
    SECURITY_NONE, SECURITY_RESULT_OK,
};
use crate::server::SessionHandler;
use crate::session::Session;

const SECURITY_RESULT_FAILED: u32 = 1;

/// Client input forwarded to whoever drives the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Key { down: bool, key: u32 },
    Pointer { buttons: u8, x: u16, y: u16 },
    CutText(String),
}

/// Client output shared by the update sender and out-of-band messages. Each
/// message is written and flushed under the lock.
type Output = Arc<Mutex<BufWriter<TcpStream>>>;

struct Updater {
    stop: flume::Sender<()>,
    stream: TcpStream,
    output: Output,
    thread: JoinHandle<Result<u64, HandlerError>>,
}

pub struct RfbHandler {
    desktop_name: String,
    input: Option<flume::Sender<InputEvent>>,
    updater: Mutex<Option<Updater>>,
}

impl RfbHandler {
    pub fn new(desktop_name: impl Into<String>) -> Self {
        Self {
            desktop_name: desktop_name.into(),
            input: None,
            updater: Mutex::new(None),
        }
    }

    /// Forwards key, pointer and cut-text events to `input`.
    pub fn with_input(mut self, input: flume::Sender<InputEvent>) -> Self {
        self.input = Some(input);
        self
    }

    fn updater(&self) -> MutexGuard<'_, Option<Updater>> {
        self.updater.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rings the client's bell.
    pub fn bell(&self) -> Result<(), HandlerError> {
        self.send(|w| protocol::write_bell(w))
    }

    /// Hands `text` to the client's clipboard. Characters outside Latin-1
    /// are sent as `?`.
    pub fn send_cut_text(&self, text: &str) -> Result<(), HandlerError> {
        self.send(|w| protocol::write_cut_text(w, text))
    }

    fn send<F>(&self, message: F) -> Result<(), HandlerError>
    where
        F: FnOnce(&mut BufWriter<TcpStream>) -> Result<(), HandlerError>,
    {
        let output = match &*self.updater() {
            Some(updater) => updater.output.clone(),
            None => return Err(HandlerError::NotConnected),
        };
        let mut writer = lock_output(&output);
        message(&mut *writer)?;
        writer.flush()?;
        Ok(())
    }

    fn forward(&self, event: InputEvent) {
        if let Some(input) = &self.input {
            if input.send(event).is_err() {
                trace!("input receiver gone, event dropped");
            }
        }
    }

    fn handle(&self, session: &Session, event: ClientEvent) {
        let display = session.display();
        match event {
            ClientEvent::SetPixelFormat(format) => {
                if format != PixelFormat::native() {
                    warn!("display {display}: client pixel format {format:?} ignored");
                }
            }
            ClientEvent::SetEncodings(encodings) => {
                debug!("display {display}: client encodings {encodings:?}");
                if !encodings.contains(&ENCODING_RAW) {
                    debug!("display {display}: raw not listed, sending raw anyway");
                }
            }
            ClientEvent::FramebufferUpdateRequest { incremental: false, rect } => {
                debug!("display {display}: full update requested ({rect:?})");
                match session.post_full_update() {
                    Ok(()) => {}
                    Err(UpdateError::Full) => debug!("display {display}: queue full, refresh dropped"),
                    Err(e) => debug!("display {display}: refresh not queued: {e}"),
                }
            }
            ClientEvent::FramebufferUpdateRequest { incremental: true, .. } => {
                // damage is pushed as the driver posts it
            }
            ClientEvent::KeyEvent { down, key } => {
                debug!("display {display}: key {key:#x} {}", if down { "down" } else { "up" });
                self.forward(InputEvent::Key { down, key });
            }
            ClientEvent::PointerEvent { buttons, x, y } => {
                trace!("display {display}: pointer {x},{y} buttons {buttons:#010b}");
                self.forward(InputEvent::Pointer { buttons, x, y });
            }
            ClientEvent::CutText(text) => {
                debug!("display {display}: {} bytes of cut text", text.len());
                self.forward(InputEvent::CutText(text));
            }
        }
    }
}

impl SessionHandler for RfbHandler {
    fn negotiate(&self, session: &Arc<Session>) -> Result<(), HandlerError> {
        // unbuffered reads, nothing the receiver needs may be consumed here
        let stream = session.client_stream()?;
        let mut reader = stream.try_clone()?;
        let mut writer = BufWriter::new(stream);

        writer.write_all(PROTOCOL_VERSION)?;
        writer.flush()?;
        let version = Version::read_from(&mut reader)?;
        debug!("display {}: client speaks {:?}", session.display(), version);

        if version == Version::V3_3 {
            // the server picks the security type
            writer.write_u32::<BigEndian>(u32::from(SECURITY_NONE))?;
        } else {
            writer.write_all(&[1, SECURITY_NONE])?;
            writer.flush()?;
            let choice = reader.read_u8()?;
            if choice != SECURITY_NONE {
                if version == Version::V3_8 {
                    let reason = b"only security type None is offered";
                    writer.write_u32::<BigEndian>(SECURITY_RESULT_FAILED)?;
                    writer.write_u32::<BigEndian>(reason.len() as u32)?;
                    writer.write_all(reason)?;
                    writer.flush()?;
                }
                return Err(HandlerError::SecurityRejected(choice));
            }
            if version == Version::V3_8 {
                writer.write_u32::<BigEndian>(SECURITY_RESULT_OK)?;
            }
        }
        writer.flush()?;

        // single client per display, the shared flag changes nothing
        let shared = reader.read_u8()?;
        trace!("display {}: ClientInit shared={}", session.display(), shared);

        ServerInit {
            geometry: session.framebuffer().geometry(),
            format: PixelFormat::native(),
            name: &self.desktop_name,
        }
        .write_to(&mut writer)?;
        writer.flush()?;

        info!("display {}: negotiated {:?}", session.display(), version);
        Ok(())
    }

    fn start_update_sender(&self, session: &Arc<Session>) -> Result<(), HandlerError> {
        let mut updater = self.updater();
        if updater.is_some() {
            return Err(HandlerError::Thread("update sender already running".into()));
        }

        let stream = session.client_stream()?;
        let output: Output = Arc::new(Mutex::new(BufWriter::new(stream.try_clone()?)));
        let (stop, stopped) = flume::bounded::<()>(0);
        let thread = {
            let session = session.clone();
            let output = output.clone();
            thread::Builder::new()
                .name(format!("rfb-updater-{}", session.display()))
                .spawn(move || send_updates(&session, &output, &stopped))
                .map_err(|e| HandlerError::Thread(e.to_string()))?
        };

        *updater = Some(Updater { stop, stream, output, thread });
        Ok(())
    }

    fn stop_update_sender(&self, session: &Arc<Session>) -> Result<(), HandlerError> {
        let Some(Updater { stop, stream, thread, .. }) = self.updater().take() else {
            return Ok(());
        };

        drop(stop);
        // unblocks a write stuck on a client that stopped reading
        if let Err(e) = stream.shutdown(Shutdown::Write) {
            trace!("display {}: updater shutdown: {}", session.display(), e);
        }

        match thread.join() {
            Ok(Ok(sent)) => debug!("display {}: update sender sent {} updates", session.display(), sent),
            Ok(Err(e)) => debug!("display {}: update sender ended: {}", session.display(), e),
            Err(_) => return Err(HandlerError::Thread("update sender panicked".into())),
        }
        Ok(())
    }

    fn run_receiver(&self, session: &Arc<Session>) -> Result<(), HandlerError> {
        let mut reader = BufReader::new(session.client_stream()?);
        loop {
            match ClientEvent::read_from(&mut reader) {
                Ok(event) => self.handle(session, event),
                Err(HandlerError::Io(e)) if is_disconnect(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Drains the update queue in FIFO order until `stopped` fires or the client
/// stops accepting data. Returns the number of updates written.
fn send_updates<W: Write>(
    session: &Session,
    output: &Mutex<W>,
    stopped: &flume::Receiver<()>,
) -> Result<u64, HandlerError> {
    let mut pixels = Vec::new();
    let mut sent = 0;

    while let Some(slot) = session.updates().acquire_queued_or(stopped) {
        let update = slot.descriptor();
        let rect = session.framebuffer().copy_rect(update.rect, &mut pixels);

        // the slot goes back to free on error as well, when it drops
        if !rect.is_empty() {
            let mut writer = lock_output(output);
            protocol::write_update_header(&mut *writer, 1)?;
            protocol::write_raw_rect(&mut *writer, rect, &pixels)?;
            writer.flush()?;
            sent += 1;
        }
        slot.release_free();
    }
    Ok(sent)
}

fn lock_output<W>(output: &Mutex<W>) -> MutexGuard<'_, W> {
    output.lock().unwrap_or_else(|e| e.into_inner())
}
