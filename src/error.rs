//! Error types
use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Pecoff Error type
///
/// Only structural problems are errors. Addresses that fail to resolve
/// while reading a table are not, see [`crate::rva`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidDosMagic,

    /// The `PE\0\0` signature was not found where the DOS header said
    InvalidPeMagic,

    /// The exec header magic was neither PE32 nor PE32+
    InvalidExecMagic(u16),

    /// The exec header is smaller than its mode requires
    ExecHeaderTooSmall { expected: u16, actual: u16 },

    /// Section names are limited to 8 bytes
    SectionNameTooLong,

    /// Too much data was provided and couldn't fit within the image
    TooMuchData,

    /// Not enough data, missing DOS header
    MissingDos,

    /// Not enough data, missing PE header
    MissingPe,

    /// Not enough data, missing Exec Header
    MissingExecHeader,

    /// Missing the Section Table
    MissingSectionTable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDosMagic => write!(f, "invalid DOS magic"),
            Self::InvalidPeMagic => write!(f, "invalid PE magic"),
            Self::InvalidExecMagic(m) => write!(f, "invalid exec header magic {m:#x}"),
            Self::ExecHeaderTooSmall { expected, actual } => write!(
                f,
                "exec header is {actual} bytes, expected at least {expected}"
            ),
            Self::SectionNameTooLong => write!(f, "section name is longer than 8 bytes"),
            Self::TooMuchData => write!(
                f,
                "too much data was provided and couldn't fit within the image"
            ),
            Self::MissingDos => write!(f, "missing DOS header"),
            Self::MissingPe => write!(f, "missing PE header"),
            Self::MissingExecHeader => write!(f, "missing exec header"),
            Self::MissingSectionTable => write!(f, "missing section table"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
