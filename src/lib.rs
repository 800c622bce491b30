pub mod acceptor;
pub mod config;
pub mod error;
pub mod framebuffer;
pub mod gate;
pub mod protocol;
pub mod registry;
pub mod rfb;
pub mod semaphore;
pub mod server;
pub mod session;
pub mod update;

pub use config::ServerConfig;
pub use error::{ConnectError, HandlerError, RegistryError, ServerError, UpdateError};
pub use framebuffer::Framebuffer;
pub use registry::Registry;
pub use server::{SessionHandler, Supervisor};
pub use session::{Session, SessionState};
pub use update::{UpdateDescriptor, UpdateQueue};

/* ============================== Limits ================================== */

/// Number of displays a single process can serve.
pub const RFB_MAX_DISPLAYS: usize = 4;

/// TCP port of display 0; display `n` listens on `RFB_PORT_BASE + n`.
pub const RFB_PORT_BASE: u16 = 5900;

/// Default number of preallocated update descriptors per display.
pub const DEFAULT_UPDATES: usize = 48;

/// Bytes per framebuffer pixel (32bpp, xRGB).
pub const BYTES_PER_PIXEL: usize = 4;

pub fn rfb_display_port(port_base: u16, display: usize) -> Option<u16> {
    u16::try_from(display).ok().and_then(|d| port_base.checked_add(d))
}

/* ============================== Core Types ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub width: u16,
    pub height: u16,
}

impl Geometry {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// The rectangle covering the whole screen.
    pub fn bounds(&self) -> Rect {
        Rect { x: 0, y: 0, width: self.width, height: self.height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A screen region in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Overlap of two rectangles; empty when they do not touch.
    pub fn intersect(&self, other: &Rect) -> Rect {
        let x0 = self.x.max(other.x) as u32;
        let y0 = self.y.max(other.y) as u32;
        let x1 = (self.x as u32 + self.width as u32).min(other.x as u32 + other.width as u32);
        let y1 = (self.y as u32 + self.height as u32).min(other.y as u32 + other.height as u32);
        if x1 <= x0 || y1 <= y0 {
            return Rect::default();
        }
        Rect {
            x: x0 as u16,
            y: y0 as u16,
            width: (x1 - x0) as u16,
            height: (y1 - y0) as u16,
        }
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}
