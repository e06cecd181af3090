//! Raw PE data structures
//!
//! These are all the raw, C compatible and packed,
//! representations of various PE and COFF data structures,
//! along with bounds checked little-endian parsing and writing.
//!
//! PE Files are laid out as so
//!
//! - [RawDos]
//! - DOS Stub, DOS executable code that conventionally says the program can't
//!   be run in DOS.
//! - PE signature [`PE_MAGIC`] and [RawCoff] Header
//! - Executable image Header [RawExec]
//!   - This is required for executable images, but can still exist on objects.
//! - [RawExec32] or [RawExec64]
//!   - Which one is used depends on whether the file is 32 or 64 bit
//!     [`RawExec::magic`]
//! - Variable number of data directories, see [`crate::data_dir`]
//! - Variable number of [RawSectionHeader]
//! - Section data
//!
//! Inside the sections, located by data directories, are tables such as
//! the [RawImportDescriptor] and [RawExportDirectory].
//!
//! # References
//!
//! The primary documentation reference for this was the [PE Format][pe_ref]
//! from Microsoft
//!
//! [pe_ref]: https://learn.microsoft.com/en-us/windows/win32/debug/pe-format
use alloc::vec::Vec;
use core::fmt;

use crate::{internal::Reader, CoffFlags, MachineType, SectionFlags};

pub mod dos;
pub mod exec;

pub use dos::*;
pub use exec::*;

/// PE COFF Magic signature
pub const PE_MAGIC: &[u8; 4] = b"PE\0\0";

/// Raw COFF header
///
/// This is common to both executable PE images and object files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RawCoff {
    /// Target machine type
    pub machine: MachineType,

    /// Number of sections
    pub sections: u16,

    /// Timestamp
    pub time: u32,

    /// File offset to COFF symbol table
    ///
    /// According to MS, should be zero for images, as COFF debugging info
    /// is deprecated.
    pub sym_offset: u32,

    /// Number of entries in COFF symbol table
    pub sym_len: u32,

    /// Claimed size in bytes of the exec Header.
    ///
    /// Otherwise known as the "optional" header
    pub exec_header_size: u16,

    /// Object attributes
    pub file_attributes: CoffFlags,
}

impl RawCoff {
    /// Create a new COFF header
    ///
    /// The deprecated COFF debugging information is set to zero
    pub fn new(
        machine: MachineType,
        sections: u16,
        time: u32,
        optional_size: u16,
        attributes: CoffFlags,
    ) -> Self {
        Self {
            machine,
            sections,
            time,
            sym_offset: 0,
            sym_len: 0,
            exec_header_size: optional_size,
            file_attributes: attributes,
        }
    }

    /// Parse from the start of `bytes`, or [`None`] if too short
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            machine: MachineType(r.u16()?),
            sections: r.u16()?,
            time: r.u32()?,
            sym_offset: r.u32()?,
            sym_len: r.u32()?,
            exec_header_size: r.u16()?,
            file_attributes: CoffFlags::from_bits_retain(r.u16()?),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&{ self.machine }.0.to_le_bytes());
        out.extend_from_slice(&{ self.sections }.to_le_bytes());
        out.extend_from_slice(&{ self.time }.to_le_bytes());
        out.extend_from_slice(&{ self.sym_offset }.to_le_bytes());
        out.extend_from_slice(&{ self.sym_len }.to_le_bytes());
        out.extend_from_slice(&{ self.exec_header_size }.to_le_bytes());
        out.extend_from_slice(&{ self.file_attributes }.bits().to_le_bytes());
    }
}

/// Section Header
///
/// The section table starts after the COFF and exec headers, and is
/// `size_of::<RawSectionHeader>()` * [`RawCoff::sections`] bytes.
///
/// In an image file, the virtual addresses assigned by the linker "must"
/// be assigned in ascending and adjacent order.
///
/// An ideal file upholds this. An in the wild file may not, and yet still run.
/// It must thus also be parsed.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RawSectionHeader {
    /// Name of the section, as a null-padded UTF-8 string
    ///
    /// If the name is exactly 8 characters, there is no nul byte.
    pub name: [u8; 8],

    /// Size of the section in memory
    ///
    /// If this is greater than `disk_size`, the section is zero-padded in
    /// memory.
    pub mem_size: u32,

    /// Offset of the section in memory, relative to the image base.
    pub mem_ptr: u32,

    /// Size of the initialized data of the section on disk
    ///
    /// If a section contains only uninitialized data, this should be zero.
    pub disk_size: u32,

    /// Offset to the section on disk
    ///
    /// When a section contains only uninitialized data, this should be zero.
    pub disk_offset: u32,

    /// Offset of the relocation entries for the section on disk
    ///
    /// Should be set to zero for exec files
    pub reloc_offset: u32,

    /// Offset of the line numbers for the section on disk
    ///
    /// Should be set to zero in exec files
    pub line_offset: u32,

    /// Number of relocation entries at `reloc_offset`
    pub reloc_len: u16,

    /// Number of lines at `line_offset`
    pub lines_len: u16,

    /// Section flags
    pub attributes: SectionFlags,
}

impl RawSectionHeader {
    /// Parse from the start of `bytes`, or [`None`] if too short
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            name: r.array()?,
            mem_size: r.u32()?,
            mem_ptr: r.u32()?,
            disk_size: r.u32()?,
            disk_offset: r.u32()?,
            reloc_offset: r.u32()?,
            line_offset: r.u32()?,
            reloc_len: r.u16()?,
            lines_len: r.u16()?,
            attributes: SectionFlags::from_bits_retain(r.u32()?),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&{ self.name });
        for v in [
            self.mem_size,
            self.mem_ptr,
            self.disk_size,
            self.disk_offset,
            self.reloc_offset,
            self.line_offset,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&{ self.reloc_len }.to_le_bytes());
        out.extend_from_slice(&{ self.lines_len }.to_le_bytes());
        out.extend_from_slice(&{ self.attributes }.bits().to_le_bytes());
    }
}

impl fmt::Debug for RawSectionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSectionHeader")
            .field("name", &crate::internal::debug::NameHelper(&{ self.name }))
            .field("mem_size", &{ self.mem_size })
            .field("mem_ptr", &{ self.mem_ptr })
            .field("disk_size", &{ self.disk_size })
            .field("disk_offset", &{ self.disk_offset })
            .field("attributes", &{ self.attributes })
            .finish_non_exhaustive()
    }
}

/// Import directory entry, one per imported library
///
/// The import directory is an array of these, terminated by one
/// that is all zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RawImportDescriptor {
    /// RVA of the import lookup table
    ///
    /// Some old binders leave this zero, and only provide
    /// [`RawImportDescriptor::iat_rva`]
    pub lookup_rva: u32,

    /// Zero until the image is bound
    pub time: u32,

    /// Index of the first forwarder reference
    pub forwarder: u32,

    /// RVA of the NUL terminated library name
    pub name_rva: u32,

    /// RVA of the import address table
    ///
    /// Identical to the lookup table until the image is bound
    pub iat_rva: u32,
}

impl RawImportDescriptor {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            lookup_rva: r.u32()?,
            time: r.u32()?,
            forwarder: r.u32()?,
            name_rva: r.u32()?,
            iat_rva: r.u32()?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        for v in [
            self.lookup_rva,
            self.time,
            self.forwarder,
            self.name_rva,
            self.iat_rva,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Whether this is the terminating entry
    pub fn is_null(&self) -> bool {
        *self == Self::default()
    }
}

/// Export directory table
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RawExportDirectory {
    /// Reserved, 0
    pub flags: u32,

    /// Time the export data was created
    pub time: u32,

    pub major_version: u16,
    pub minor_version: u16,

    /// RVA of the NUL terminated name of the image
    pub name_rva: u32,

    /// Starting ordinal number, usually 1
    pub ordinal_base: u32,

    /// Entries in the address table
    pub addresses_len: u32,

    /// Entries in both the name and ordinal tables
    pub names_len: u32,

    pub addresses_rva: u32,
    pub names_rva: u32,
    pub ordinals_rva: u32,
}

impl RawExportDirectory {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            flags: r.u32()?,
            time: r.u32()?,
            major_version: r.u16()?,
            minor_version: r.u16()?,
            name_rva: r.u32()?,
            ordinal_base: r.u32()?,
            addresses_len: r.u32()?,
            names_len: r.u32()?,
            addresses_rva: r.u32()?,
            names_rva: r.u32()?,
            ordinals_rva: r.u32()?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&{ self.flags }.to_le_bytes());
        out.extend_from_slice(&{ self.time }.to_le_bytes());
        out.extend_from_slice(&{ self.major_version }.to_le_bytes());
        out.extend_from_slice(&{ self.minor_version }.to_le_bytes());
        for v in [
            self.name_rva,
            self.ordinal_base,
            self.addresses_len,
            self.names_len,
            self.addresses_rva,
            self.names_rva,
            self.ordinals_rva,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use core::mem::{align_of, size_of};

    use static_assertions::{assert_eq_size, const_assert_eq};

    use super::*;

    assert_eq_size!(RawCoff, [u8; 20]);
    assert_eq_size!(RawDos, [u8; 64]);
    assert_eq_size!(RawExec, [u8; 24]);
    assert_eq_size!(RawExec32, [u8; 96]);
    assert_eq_size!(RawExec64, [u8; 112]);
    assert_eq_size!(RawSectionHeader, [u8; 40]);
    assert_eq_size!(RawImportDescriptor, [u8; 20]);
    assert_eq_size!(RawExportDirectory, [u8; 40]);
    const_assert_eq!(align_of::<RawCoff>(), 1);
    const_assert_eq!(align_of::<RawExec64>(), 1);

    /// Written sizes must match the in-memory layout
    #[test]
    fn write_sizes() {
        let mut out = Vec::new();
        RawCoff::new(MachineType::AMD64, 2, 0, 240, CoffFlags::IMAGE).write(&mut out);
        assert_eq!(out.len(), size_of::<RawCoff>());

        out.clear();
        RawSectionHeader::parse(&[0; 40]).unwrap().write(&mut out);
        assert_eq!(out.len(), size_of::<RawSectionHeader>());

        out.clear();
        RawImportDescriptor::default().write(&mut out);
        assert_eq!(out.len(), size_of::<RawImportDescriptor>());

        out.clear();
        RawExportDirectory::default().write(&mut out);
        assert_eq!(out.len(), size_of::<RawExportDirectory>());
    }

    #[test]
    fn coff() {
        let bytes = [
            0x64, 0x86, 0x03, 0x00, 0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0, 0, 0, 0, 0, 0xF0, 0x00,
            0x22, 0x00,
        ];
        let coff = RawCoff::parse(&bytes).unwrap();
        assert_eq!({ coff.machine }, MachineType::AMD64);
        assert_eq!({ coff.sections }, 3);
        assert_eq!({ coff.time }, 0x12345678);
        assert_eq!({ coff.exec_header_size }, 240);
        assert_eq!(
            { coff.file_attributes },
            CoffFlags::IMAGE | CoffFlags::LARGE_ADDRESS_AWARE
        );
        assert!(RawCoff::parse(&bytes[..19]).is_none());

        let mut out = Vec::new();
        coff.write(&mut out);
        assert_eq!(out, bytes);
    }
}
