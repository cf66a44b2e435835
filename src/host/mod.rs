//! Host clipboard abstraction.
//!
//! The bridge never talks to a windowing system directly. It drives a
//! [`HostClipboard`] implementation: a revision counter for change
//! detection, format enumeration, synchronous read/write, and deferred
//! placeholders whose bytes are produced by a [`DataProvider`] only when
//! something on the host pastes.

#[cfg(test)]
pub mod memory;
pub mod x11;

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Errors returned by host clipboard adapters.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The clipboard holds nothing in the requested format.
    #[error("no clipboard data for {0}")]
    NotAvailable(NativeFormat),

    /// The windowing system rejected or failed the operation.
    #[error("clipboard backend: {0}")]
    Backend(String),
}

/// A host-native clipboard format identifier (MIME-style name).
///
/// Adapters normalize their own target names to these identifiers, so the
/// same three constants cover text and images on every backend. Anything
/// else is carried by name and treated as unsupported by the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeFormat(Cow<'static, str>);

impl NativeFormat {
    pub const PLAIN_TEXT: NativeFormat = NativeFormat(Cow::Borrowed("text/plain;charset=utf-8"));
    pub const PNG: NativeFormat = NativeFormat(Cow::Borrowed("image/png"));
    pub const TIFF: NativeFormat = NativeFormat(Cow::Borrowed("image/tiff"));

    /// Wrap an arbitrary backend format name.
    pub fn named(name: impl Into<String>) -> Self {
        NativeFormat(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NativeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host clipboard change counter.
///
/// Opaque to the bridge apart from equality and [`Revision::next`], which
/// predicts the value a single write will produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    pub fn next(self) -> Self {
        Revision(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supplies the bytes of a deferred clipboard entry on demand.
///
/// Called from whatever thread the host uses to service paste requests;
/// it may block. Returning `None` makes the paste come back empty.
pub trait DataProvider: Send + Sync {
    fn provide(&self, format: &NativeFormat) -> Option<Vec<u8>>;
}

/// Reads and writes the host's general clipboard.
///
/// `Send + Sync` because the bridge actor and the host's own paste thread
/// both hold it. Every write or deferred registration advances the
/// revision by exactly one.
pub trait HostClipboard: Send + Sync {
    /// Current change counter.
    fn revision(&self) -> Revision;

    /// Formats currently on the clipboard, in the host's preference order.
    fn available_formats(&self) -> Result<Vec<NativeFormat>, HostError>;

    /// Read the clipboard in `format`. May invoke a deferred provider.
    fn read(&self, format: &NativeFormat) -> Result<Vec<u8>, HostError>;

    /// Replace the clipboard content with `data` in a single format.
    fn write(&self, format: &NativeFormat, data: &[u8]) -> Result<(), HostError>;

    /// Replace the clipboard content with placeholders for `formats`,
    /// realized through `provider` when first read.
    fn provide_deferred(
        &self,
        formats: &[NativeFormat],
        provider: Arc<dyn DataProvider>,
    ) -> Result<(), HostError>;
}
