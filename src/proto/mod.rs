//! vdagentd wire vocabulary and udscs framing.
//!
//! The bridge core only uses [`Selection`] and [`FormatId`]; the
//! [`Message`] enum and [`codec`] are consumed by the udscs transport.

pub mod codec;
pub mod message;

pub use message::{FormatId, Message, Selection};
