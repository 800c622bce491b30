//! RFB wire messages (RFC 6143) read and written over blocking streams.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::HandlerError;
use crate::{Geometry, Rect};

pub const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";

pub const SECURITY_NONE: u8 = 1;
pub const SECURITY_RESULT_OK: u32 = 0;

pub const ENCODING_RAW: i32 = 0;

/* ============================== Handshake =============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    V3_3,
    V3_7,
    V3_8,
}

impl Version {
    /// Parses a 12-byte ProtocolVersion message. Unknown minor versions above
    /// 8 are treated as 3.8, as RFC 6143 asks.
    pub fn parse(bytes: &[u8; 12]) -> Result<Self, HandlerError> {
        let unsupported =
            || HandlerError::UnsupportedVersion(String::from_utf8_lossy(bytes).trim_end().to_string());
        if &bytes[..4] != b"RFB " || bytes[7] != b'.' || bytes[11] != b'\n' {
            return Err(unsupported());
        }
        let number = |digits: &[u8]| -> Option<u32> { std::str::from_utf8(digits).ok()?.parse().ok() };
        let major = number(&bytes[4..7]).ok_or_else(unsupported)?;
        let minor = number(&bytes[8..11]).ok_or_else(unsupported)?;
        match (major, minor) {
            (3, 3) => Ok(Version::V3_3),
            (3, 7) => Ok(Version::V3_7),
            (3, m) if m >= 8 => Ok(Version::V3_8),
            _ => Err(unsupported()),
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, HandlerError> {
        let mut buf = [0u8; 12];
        reader.read_exact(&mut buf)?;
        Self::parse(&buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The framebuffer's native format: 32bpp little-endian xRGB.
    pub fn native() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, HandlerError> {
        let bits_per_pixel = reader.read_u8()?;
        let depth = reader.read_u8()?;
        let big_endian = reader.read_u8()? != 0;
        let true_colour = reader.read_u8()? != 0;
        let red_max = reader.read_u16::<BigEndian>()?;
        let green_max = reader.read_u16::<BigEndian>()?;
        let blue_max = reader.read_u16::<BigEndian>()?;
        let red_shift = reader.read_u8()?;
        let green_shift = reader.read_u8()?;
        let blue_shift = reader.read_u8()?;
        let mut pad = [0u8; 3];
        reader.read_exact(&mut pad)?;
        Ok(Self {
            bits_per_pixel,
            depth,
            big_endian,
            true_colour,
            red_max,
            green_max,
            blue_max,
            red_shift,
            green_shift,
            blue_shift,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), HandlerError> {
        writer.write_u8(self.bits_per_pixel)?;
        writer.write_u8(self.depth)?;
        writer.write_u8(self.big_endian as u8)?;
        writer.write_u8(self.true_colour as u8)?;
        writer.write_u16::<BigEndian>(self.red_max)?;
        writer.write_u16::<BigEndian>(self.green_max)?;
        writer.write_u16::<BigEndian>(self.blue_max)?;
        writer.write_u8(self.red_shift)?;
        writer.write_u8(self.green_shift)?;
        writer.write_u8(self.blue_shift)?;
        writer.write_all(&[0u8; 3])?;
        Ok(())
    }
}

pub struct ServerInit<'a> {
    pub geometry: Geometry,
    pub format: PixelFormat,
    pub name: &'a str,
}

impl ServerInit<'_> {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), HandlerError> {
        writer.write_u16::<BigEndian>(self.geometry.width)?;
        writer.write_u16::<BigEndian>(self.geometry.height)?;
        self.format.write_to(writer)?;
        writer.write_u32::<BigEndian>(self.name.len() as u32)?;
        writer.write_all(self.name.as_bytes())?;
        Ok(())
    }
}

/* ========================= Client → Server ============================== */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<i32>),
    FramebufferUpdateRequest { incremental: bool, rect: Rect },
    KeyEvent { down: bool, key: u32 },
    PointerEvent { buttons: u8, x: u16, y: u16 },
    CutText(String),
}

/// Largest ClientCutText accepted; bigger messages end the session.
const MAX_CUT_TEXT: u32 = 1 << 20;

impl ClientEvent {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, HandlerError> {
        let message_type = reader.read_u8()?;
        match message_type {
            0 => {
                let mut pad = [0u8; 3];
                reader.read_exact(&mut pad)?;
                Ok(ClientEvent::SetPixelFormat(PixelFormat::read_from(reader)?))
            }
            2 => {
                reader.read_u8()?; // pad
                let count = reader.read_u16::<BigEndian>()?;
                let mut encodings = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    encodings.push(reader.read_i32::<BigEndian>()?);
                }
                Ok(ClientEvent::SetEncodings(encodings))
            }
            3 => {
                let incremental = reader.read_u8()? != 0;
                let x = reader.read_u16::<BigEndian>()?;
                let y = reader.read_u16::<BigEndian>()?;
                let width = reader.read_u16::<BigEndian>()?;
                let height = reader.read_u16::<BigEndian>()?;
                Ok(ClientEvent::FramebufferUpdateRequest {
                    incremental,
                    rect: Rect::new(x, y, width, height),
                })
            }
            4 => {
                let down = reader.read_u8()? != 0;
                reader.read_u16::<BigEndian>()?; // pad
                let key = reader.read_u32::<BigEndian>()?;
                Ok(ClientEvent::KeyEvent { down, key })
            }
            5 => {
                let buttons = reader.read_u8()?;
                let x = reader.read_u16::<BigEndian>()?;
                let y = reader.read_u16::<BigEndian>()?;
                Ok(ClientEvent::PointerEvent { buttons, x, y })
            }
            6 => {
                let mut pad = [0u8; 3];
                reader.read_exact(&mut pad)?;
                let len = reader.read_u32::<BigEndian>()?;
                if len > MAX_CUT_TEXT {
                    return Err(HandlerError::Protocol(format!("cut text of {len} bytes")));
                }
                let mut bytes = vec![0u8; len as usize];
                reader.read_exact(&mut bytes)?;
                // ISO 8859-1
                Ok(ClientEvent::CutText(bytes.into_iter().map(char::from).collect()))
            }
            other => Err(HandlerError::Protocol(format!(
                "unsupported client to server message type {other}"
            ))),
        }
    }
}

/* ========================= Server → Client ============================== */

/// Header of a FramebufferUpdate carrying `count` rectangles.
pub fn write_update_header<W: Write>(writer: &mut W, count: u16) -> Result<(), HandlerError> {
    writer.write_u8(0)?;
    writer.write_u8(0)?; // pad
    writer.write_u16::<BigEndian>(count)?;
    Ok(())
}

/// One raw-encoded rectangle; `pixels` are in the native pixel format.
pub fn write_raw_rect<W: Write>(writer: &mut W, rect: Rect, pixels: &[u8]) -> Result<(), HandlerError> {
    writer.write_u16::<BigEndian>(rect.x)?;
    writer.write_u16::<BigEndian>(rect.y)?;
    writer.write_u16::<BigEndian>(rect.width)?;
    writer.write_u16::<BigEndian>(rect.height)?;
    writer.write_i32::<BigEndian>(ENCODING_RAW)?;
    writer.write_all(pixels)?;
    Ok(())
}

pub fn write_bell<W: Write>(writer: &mut W) -> Result<(), HandlerError> {
    writer.write_u8(2)?;
    Ok(())
}

pub fn write_cut_text<W: Write>(writer: &mut W, text: &str) -> Result<(), HandlerError> {
    writer.write_u8(3)?;
    writer.write_all(&[0u8; 3])?;
    let latin1: Vec<u8> = text
        .chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect();
    writer.write_u32::<BigEndian>(latin1.len() as u32)?;
    writer.write_all(&latin1)?;
    Ok(())
}
