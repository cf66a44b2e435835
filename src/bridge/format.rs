//! Mapping between remote clipboard types and host formats.

use crate::host::NativeFormat;
use crate::proto::FormatId;

/// Host format for a remote type, if the host can represent it.
pub fn to_native(format: FormatId) -> Option<NativeFormat> {
    match format {
        FormatId::Utf8Text => Some(NativeFormat::PLAIN_TEXT),
        FormatId::ImagePng => Some(NativeFormat::PNG),
        FormatId::ImageTiff => Some(NativeFormat::TIFF),
        FormatId::Unsupported => None,
    }
}

/// Remote type for a host format, if the remote protocol has one.
pub fn to_remote(format: &NativeFormat) -> Option<FormatId> {
    if *format == NativeFormat::PLAIN_TEXT {
        Some(FormatId::Utf8Text)
    } else if *format == NativeFormat::PNG {
        Some(FormatId::ImagePng)
    } else if *format == NativeFormat::TIFF {
        Some(FormatId::ImageTiff)
    } else {
        None
    }
}
