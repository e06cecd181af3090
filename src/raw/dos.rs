//! Raw DOS Header data structures
//!
//! The Microsoft DOS Header, in the context of PE files,
//! is a legacy stub they insist on still adding for DOS compatibility.
//! Conventionally this stub program does nothing more than print it cannot
//! run in DOS.
//!
//! The DOS Stub contains one field of interest, the offset to the start
//! of the actual PE headers.
use alloc::vec::Vec;
use core::{fmt, mem::size_of};

use crate::{
    error::{Error, Result},
    internal::Reader,
};

/// DOS Magic signature
pub const DOS_MAGIC: [u8; 2] = *b"MZ";

/// Offset of [`RawDos::pe_offset`] in the header
pub const PE_OFFSET_OFFSET: usize = 0x3C;

/// The conventional DOS stub program, following [`RawDos`]
///
/// Prints "This program cannot be run in DOS mode." and exits.
pub const DOS_STUB: [u8; 64] = *b"\x0E\x1F\xBA\x0E\x00\xB4\x09\xCD\x21\xB8\x01\x4C\xCD\x21\
This program cannot be run in DOS mode.\r\r\n$\0\0\0\0\0\0\0";

/// Size of [`RawDos`] plus [`DOS_STUB`]
pub const DOS_STUB_SIZE: usize = size_of::<RawDos>() + DOS_STUB.len();

/// Legacy MS-DOS header for executable PE images
///
/// The only thing really relevant for loading a PE image is
/// [`RawDos::pe_offset`]
///
/// Most of this headers fields are irrelevant.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C, packed)]
pub struct RawDos {
    /// Constant of value [DOS_MAGIC] identifying the PE executable
    pub magic: [u8; 2],

    /// Number of bytes in the last page
    pub last_bytes: u16,

    /// Number of pages
    pub pages: u16,

    /// Number of entries in the relocations table
    pub relocations: u16,

    /// Number of paragraphs taken up by the header
    pub header_size: u16,

    /// Min number of paragraphs required by the program
    pub min_alloc: u16,

    /// Max number of paragraphs requested by the program
    pub max_alloc: u16,

    /// Relocation segment
    pub initial_ss: u16,

    /// Initial stack pointer
    pub initial_sp: u16,

    /// Checksum
    pub checksum: u16,

    /// Initial IP
    pub initial_ip: u16,

    /// Relocatable CS segment address
    pub initial_cs: u16,

    /// Absolute offset to relocation table
    pub relocation_offset: u16,

    /// Overlay management
    pub overlay_num: u16,

    /// Reserved in PE
    pub _reserved: [u16; 4],

    /// Useless
    pub oem_id: u16,

    /// Useless
    pub oem_info: u16,

    /// Reserved in PE
    pub _reserved2: [u8; 20],

    /// Absolute offset in the file to the PE header
    ///
    /// Note that this value is untrusted user input, and can be anything.
    /// It could even point inside the DOS header.
    pub pe_offset: u32,
}

impl RawDos {
    /// The header conventionally emitted by linkers, for use with
    /// [`DOS_STUB`].
    ///
    /// The PE header follows immediately after the stub.
    pub const fn standard() -> Self {
        Self {
            magic: DOS_MAGIC,
            last_bytes: 0x90,
            pages: 3,
            relocations: 0,
            header_size: 4,
            min_alloc: 0,
            max_alloc: 0xFFFF,
            initial_ss: 0,
            initial_sp: 0xB8,
            checksum: 0,
            initial_ip: 0,
            initial_cs: 0,
            relocation_offset: 0x40,
            overlay_num: 0,
            _reserved: [0; 4],
            oem_id: 0,
            oem_info: 0,
            _reserved2: [0; 20],
            pe_offset: DOS_STUB_SIZE as u32,
        }
    }
}

/// Public deserialization API
impl RawDos {
    /// Parse a [`RawDos`] from the start of `bytes`
    ///
    /// # Errors
    ///
    /// - [`Error::MissingDos`] If `bytes` is not enough to fit a [`RawDos`]
    /// - [`Error::InvalidDosMagic`] If the [DOS magic][`DOS_MAGIC`] is
    ///   incorrect
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let magic = bytes.get(..2).ok_or(Error::MissingDos)?;
        if magic != DOS_MAGIC {
            return Err(Error::InvalidDosMagic);
        }
        Self::parse_fields(&mut Reader::new(bytes)).ok_or(Error::MissingDos)
    }

    fn parse_fields(r: &mut Reader) -> Option<Self> {
        Some(Self {
            magic: r.array()?,
            last_bytes: r.u16()?,
            pages: r.u16()?,
            relocations: r.u16()?,
            header_size: r.u16()?,
            min_alloc: r.u16()?,
            max_alloc: r.u16()?,
            initial_ss: r.u16()?,
            initial_sp: r.u16()?,
            checksum: r.u16()?,
            initial_ip: r.u16()?,
            initial_cs: r.u16()?,
            relocation_offset: r.u16()?,
            overlay_num: r.u16()?,
            _reserved: [r.u16()?, r.u16()?, r.u16()?, r.u16()?],
            oem_id: r.u16()?,
            oem_info: r.u16()?,
            _reserved2: r.array()?,
            pe_offset: r.u32()?,
        })
    }
}

/// Public serialization API
impl RawDos {
    /// Append the header to `out`
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.magic);
        for v in [
            self.last_bytes,
            self.pages,
            self.relocations,
            self.header_size,
            self.min_alloc,
            self.max_alloc,
            self.initial_ss,
            self.initial_sp,
            self.checksum,
            self.initial_ip,
            self.initial_cs,
            self.relocation_offset,
            self.overlay_num,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in { self._reserved } {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&{ self.oem_id }.to_le_bytes());
        out.extend_from_slice(&{ self.oem_info }.to_le_bytes());
        out.extend_from_slice(&{ self._reserved2 });
        out.extend_from_slice(&{ self.pe_offset }.to_le_bytes());
    }
}

impl Default for RawDos {
    #[inline]
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for RawDos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDos")
            .field("magic", &bstr::BStr::new(&{ self.magic }))
            .field("last_bytes", &{ self.last_bytes })
            .field("pages", &{ self.pages })
            .field("header_size", &{ self.header_size })
            .field("initial_sp", &{ self.initial_sp })
            .field("relocation_offset", &{ self.relocation_offset })
            .field("pe_offset", &{ self.pe_offset })
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_stub() {
        let mut out = Vec::new();
        RawDos::standard().write(&mut out);
        assert_eq!(out.len(), 64);
        out.extend_from_slice(&DOS_STUB);
        assert_eq!(out.len(), DOS_STUB_SIZE);

        assert_eq!(
            &out[..16],
            &[
                0x4D, 0x5A, 0x90, 0x00, 0x03, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0xFF,
                0xFF, 0x00, 0x00
            ]
        );
        assert_eq!(&out[PE_OFFSET_OFFSET..][..4], &[0x80, 0, 0, 0]);
        assert_eq!(&out[0x4E..][..8], b"This pro");
        assert_eq!(&out[0x78..][..2], b"$\0");
    }

    #[test]
    fn parse() {
        let mut out = Vec::new();
        RawDos::standard().write(&mut out);
        assert_eq!(RawDos::parse(&out), Ok(RawDos::standard()));
        assert_eq!(RawDos::parse(&out[..63]), Err(Error::MissingDos));
        assert_eq!(RawDos::parse(b"M"), Err(Error::MissingDos));
        assert_eq!(RawDos::parse(b"ZM"), Err(Error::InvalidDosMagic));
    }
}
