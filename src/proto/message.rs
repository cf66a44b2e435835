//! Message types exchanged with spice-vdagentd.
//!
//! Every message is a fixed header `{kind, arg1, arg2, size}` followed by
//! `size` payload bytes. Clipboard messages carry the selection in `arg1`
//! and the clipboard type in `arg2` (or as a `u32` list in the payload for
//! grabs). Message kinds the agent does not handle are kept as
//! [`Message::Other`] so they can be logged and skipped.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Raw message kinds used on the daemon socket.
pub mod kind {
    pub const CLIPBOARD_GRAB: u32 = 2;
    pub const CLIPBOARD_REQUEST: u32 = 3;
    pub const CLIPBOARD_DATA: u32 = 4;
    pub const CLIPBOARD_RELEASE: u32 = 5;
    pub const VERSION: u32 = 6;
    pub const CLIENT_DISCONNECTED: u32 = 12;
}

/// Which clipboard a message refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selection {
    Clipboard,
    Primary,
    Secondary,
}

impl Selection {
    /// Decode a raw selection id. Unknown ids fall back to `Clipboard`,
    /// matching the daemon's own conversion.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Selection::Primary,
            2 => Selection::Secondary,
            _ => Selection::Clipboard,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Selection::Clipboard => 0,
            Selection::Primary => 1,
            Selection::Secondary => 2,
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Clipboard => f.write_str("clipboard"),
            Selection::Primary => f.write_str("primary"),
            Selection::Secondary => f.write_str("secondary"),
        }
    }
}

/// Clipboard data type in the remote protocol's vocabulary.
///
/// BMP and JPEG exist on the wire but have no host counterpart here, so
/// they decode to [`FormatId::Unsupported`] along with anything unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatId {
    Utf8Text,
    ImagePng,
    ImageTiff,
    Unsupported,
}

impl FormatId {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => FormatId::Utf8Text,
            2 => FormatId::ImagePng,
            4 => FormatId::ImageTiff,
            _ => FormatId::Unsupported,
        }
    }

    /// Encode for the wire. `Unsupported` becomes the NONE type (0).
    pub fn to_raw(self) -> u32 {
        match self {
            FormatId::Utf8Text => 1,
            FormatId::ImagePng => 2,
            FormatId::ImageTiff => 4,
            FormatId::Unsupported => 0,
        }
    }
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatId::Utf8Text => f.write_str("utf8-text"),
            FormatId::ImagePng => f.write_str("image/png"),
            FormatId::ImageTiff => f.write_str("image/tiff"),
            FormatId::Unsupported => f.write_str("unsupported"),
        }
    }
}

/// Fixed-size frame header. All fields are little-endian `u32` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub size: u32,
}

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Maximum payload size accepted or produced (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// A decoded daemon message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ClipboardGrab {
        selection: Selection,
        formats: Vec<FormatId>,
    },
    ClipboardRequest {
        selection: Selection,
        format: FormatId,
    },
    ClipboardData {
        selection: Selection,
        format: FormatId,
        data: Vec<u8>,
    },
    ClipboardRelease {
        selection: Selection,
    },
    /// Daemon version string, sent right after connect.
    Version(String),
    /// The remote viewer went away; the daemon socket stays up.
    ClientDisconnected,
    /// Any kind the agent does not act on (monitor config, file transfer, ...).
    Other {
        kind: u32,
        arg1: u32,
        arg2: u32,
        payload: Bytes,
    },
}

/// A frame whose payload does not fit its declared kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {kind_name} payload: {reason}")]
pub struct MalformedPayload {
    pub kind_name: &'static str,
    pub reason: String,
}

impl Message {
    pub fn kind(&self) -> u32 {
        match self {
            Message::ClipboardGrab { .. } => kind::CLIPBOARD_GRAB,
            Message::ClipboardRequest { .. } => kind::CLIPBOARD_REQUEST,
            Message::ClipboardData { .. } => kind::CLIPBOARD_DATA,
            Message::ClipboardRelease { .. } => kind::CLIPBOARD_RELEASE,
            Message::Version(_) => kind::VERSION,
            Message::ClientDisconnected => kind::CLIENT_DISCONNECTED,
            Message::Other { kind, .. } => *kind,
        }
    }

    /// Build a message from a complete frame.
    pub fn from_frame(header: Header, payload: Bytes) -> Result<Self, MalformedPayload> {
        let selection = Selection::from_raw(header.arg1);
        let msg = match header.kind {
            kind::CLIPBOARD_GRAB => {
                if payload.len() % 4 != 0 {
                    return Err(MalformedPayload {
                        kind_name: kind_name(header.kind),
                        reason: format!("type list of {} bytes", payload.len()),
                    });
                }
                let formats = payload
                    .chunks_exact(4)
                    .map(|c| FormatId::from_raw(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                    .collect();
                Message::ClipboardGrab { selection, formats }
            }
            kind::CLIPBOARD_REQUEST => Message::ClipboardRequest {
                selection,
                format: FormatId::from_raw(header.arg2),
            },
            kind::CLIPBOARD_DATA => Message::ClipboardData {
                selection,
                format: FormatId::from_raw(header.arg2),
                data: payload.to_vec(),
            },
            kind::CLIPBOARD_RELEASE => Message::ClipboardRelease { selection },
            kind::VERSION => {
                let end = payload
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(payload.len());
                Message::Version(String::from_utf8_lossy(&payload[..end]).into_owned())
            }
            kind::CLIENT_DISCONNECTED => Message::ClientDisconnected,
            other => Message::Other {
                kind: other,
                arg1: header.arg1,
                arg2: header.arg2,
                payload,
            },
        };
        Ok(msg)
    }

    /// Split into header arguments and payload for encoding.
    ///
    /// The returned header's `size` matches the payload length.
    pub fn into_frame(self) -> (Header, Bytes) {
        let kind = self.kind();
        let (arg1, arg2, payload) = match self {
            Message::ClipboardGrab { selection, formats } => {
                let mut buf = BytesMut::with_capacity(formats.len() * 4);
                for format in formats {
                    buf.put_u32_le(format.to_raw());
                }
                (selection.to_raw(), 0, buf.freeze())
            }
            Message::ClipboardRequest { selection, format } => {
                (selection.to_raw(), format.to_raw(), Bytes::new())
            }
            Message::ClipboardData {
                selection,
                format,
                data,
            } => (selection.to_raw(), format.to_raw(), Bytes::from(data)),
            Message::ClipboardRelease { selection } => (selection.to_raw(), 0, Bytes::new()),
            Message::Version(version) => {
                let mut buf = BytesMut::with_capacity(version.len() + 1);
                buf.extend_from_slice(version.as_bytes());
                buf.put_u8(0);
                (0, 0, buf.freeze())
            }
            Message::ClientDisconnected => (0, 0, Bytes::new()),
            Message::Other {
                arg1, arg2, payload, ..
            } => (arg1, arg2, payload),
        };
        let header = Header {
            kind,
            arg1,
            arg2,
            size: payload.len() as u32,
        };
        (header, payload)
    }
}

/// Human-readable name of a raw message kind.
pub fn kind_name(kind: u32) -> &'static str {
    match kind {
        0 => "guest xorg resolution",
        1 => "monitors config",
        kind::CLIPBOARD_GRAB => "clipboard grab",
        kind::CLIPBOARD_REQUEST => "clipboard request",
        kind::CLIPBOARD_DATA => "clipboard data",
        kind::CLIPBOARD_RELEASE => "clipboard release",
        kind::VERSION => "version",
        7 => "audio volume sync",
        8..=11 => "file transfer",
        kind::CLIENT_DISCONNECTED => "client disconnected",
        13 => "graphics device info",
        _ => "invalid message",
    }
}
