//! The Executable header
//!
//! Also known as the "Optional" header in [Microsoft PE documentation][pe_ref]
//!
//! The executable header should only exist for PE executables, and
//! follows the [COFF header][super::RawCoff].
//!
//! The size of this structure differs depending on whether
//! the executable is 32 or 64 bit.
//!
//! [pe_ref]: https://learn.microsoft.com/en-us/windows/win32/debug/pe-format
use alloc::vec::Vec;
use core::fmt;

use crate::{internal::Reader, ExecFlags, Subsystem};

/// PE32 Magic signature
pub const PE32_MAGIC: u16 = 0x10B;

/// PE32+ Magic signature
pub const PE32_64_MAGIC: u16 = 0x20B;

/// Common subset of the PE Executable header,
/// otherwise known as the "optional" header.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RawExec {
    /// Magic identifying PE32 vs PE32+
    pub magic: u16,

    /// Linker major version
    pub linker_major: u8,

    /// Linker minor version
    pub linker_minor: u8,

    /// Virtual Size or sum of all code/text sections
    pub code_size: u32,

    /// Virtual Size or sum of all initialized/data sections
    pub init_size: u32,

    /// Virtual Size or sum of all uninitialized/data sections
    pub uninit_size: u32,

    /// Offset to image entry point, relative to image base.
    pub entry_ptr: u32,

    /// Offset to beginning-of-code section, relative to image base.
    pub code_ptr: u32,
}

impl RawExec {
    fn parse(r: &mut Reader) -> Option<Self> {
        Some(Self {
            magic: r.u16()?,
            linker_major: r.u8()?,
            linker_minor: r.u8()?,
            code_size: r.u32()?,
            init_size: r.u32()?,
            uninit_size: r.u32()?,
            entry_ptr: r.u32()?,
            code_ptr: r.u32()?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&{ self.magic }.to_le_bytes());
        out.push(self.linker_major);
        out.push(self.linker_minor);
        for v in [
            self.code_size,
            self.init_size,
            self.uninit_size,
            self.entry_ptr,
            self.code_ptr,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

impl fmt::Debug for RawExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Magic(u16);
        impl fmt::Debug for Magic {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    PE32_MAGIC => write!(f, "PE32_MAGIC"),
                    PE32_64_MAGIC => write!(f, "PE32_64_MAGIC"),
                    m => write!(f, "(Unknown) {m:#x}"),
                }
            }
        }

        f.debug_struct("RawExec")
            .field("magic", &Magic(self.magic))
            .field("linker_major", &{ self.linker_major })
            .field("linker_minor", &{ self.linker_minor })
            .field("code_size", &{ self.code_size })
            .field("init_size", &{ self.init_size })
            .field("uninit_size", &{ self.uninit_size })
            .field("entry_ptr", &{ self.entry_ptr })
            .field("code_ptr", &{ self.code_ptr })
            .finish()
    }
}

/// Fields that are laid out the same in both [`RawExec32`] and
/// [`RawExec64`], between the image base and the stack sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RawExecLayout {
    /// Alignment, in bytes, of the section in memory.
    ///
    /// Must be greater or equal to disk_align.
    ///
    /// Default is architecture page size.
    pub mem_align: u32,

    /// Alignment, in bytes, of the section on disk.
    ///
    /// Must be a power of two, between 512 and 64K inclusive.
    ///
    /// Default is 512
    pub disk_align: u32,

    /// Required OS major version
    pub os_major: u16,

    /// Required OS minor version
    pub os_minor: u16,

    /// Image major version
    pub image_major: u16,

    /// Image minor version
    pub image_minor: u16,

    /// Subsystem major version
    pub subsystem_major: u16,

    /// Subsystem minor version
    pub subsystem_minor: u16,

    /// Reserved, 0.
    pub _reserved_win32: u32,

    /// Size in bytes of the image as loaded in memory, aligned to
    /// mem_align.
    pub image_size: u32,

    /// Combined size of the DOS stub, PE header, and section headers, aligned
    /// to disk_align.
    pub headers_size: u32,

    /// A checksum
    pub checksum: u32,

    /// Subsystem required to run image
    pub subsystem: Subsystem,

    /// Flags for windows
    pub dll_attributes: ExecFlags,
}

impl RawExecLayout {
    fn parse(r: &mut Reader) -> Option<Self> {
        Some(Self {
            mem_align: r.u32()?,
            disk_align: r.u32()?,
            os_major: r.u16()?,
            os_minor: r.u16()?,
            image_major: r.u16()?,
            image_minor: r.u16()?,
            subsystem_major: r.u16()?,
            subsystem_minor: r.u16()?,
            _reserved_win32: r.u32()?,
            image_size: r.u32()?,
            headers_size: r.u32()?,
            checksum: r.u32()?,
            subsystem: Subsystem(r.u16()?),
            dll_attributes: ExecFlags::from_bits_retain(r.u16()?),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&{ self.mem_align }.to_le_bytes());
        out.extend_from_slice(&{ self.disk_align }.to_le_bytes());
        for v in [
            self.os_major,
            self.os_minor,
            self.image_major,
            self.image_minor,
            self.subsystem_major,
            self.subsystem_minor,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in [
            self._reserved_win32,
            self.image_size,
            self.headers_size,
            self.checksum,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&{ self.subsystem }.0.to_le_bytes());
        out.extend_from_slice(&{ self.dll_attributes }.bits().to_le_bytes());
    }
}

/// 32-bit Executable header
///
/// Followed by [`RawExec32::data_dirs`] data directories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RawExec32 {
    /// Standard/common subset
    pub standard: RawExec,

    /// Offset to beginning-of-data section, relative to image base.
    pub data_ptr: u32,

    /// Preferred base address of the image when loaded in memory.
    pub image_base: u32,

    pub layout: RawExecLayout,

    /// Size of the stack to reserve.
    pub stack_reserve: u32,

    /// Size of the stack to commit. Made available one page at a time until
    /// reserve.
    pub stack_commit: u32,

    /// Size of the heap to reserve.
    pub heap_reserve: u32,

    /// Size of the heap to commit. Made available one page at a time until
    /// reserve.
    pub heap_commit: u32,

    /// Reserved, 0.
    pub _reserved_loader_attributes: u32,

    /// Number of data directories following the header.
    pub data_dirs: u32,
}

impl RawExec32 {
    /// Parse from the start of `bytes`. Does not check the magic.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            standard: RawExec::parse(&mut r)?,
            data_ptr: r.u32()?,
            image_base: r.u32()?,
            layout: RawExecLayout::parse(&mut r)?,
            stack_reserve: r.u32()?,
            stack_commit: r.u32()?,
            heap_reserve: r.u32()?,
            heap_commit: r.u32()?,
            _reserved_loader_attributes: r.u32()?,
            data_dirs: r.u32()?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let (standard, layout) = (self.standard, self.layout);
        standard.write(out);
        out.extend_from_slice(&{ self.data_ptr }.to_le_bytes());
        out.extend_from_slice(&{ self.image_base }.to_le_bytes());
        layout.write(out);
        for v in [
            self.stack_reserve,
            self.stack_commit,
            self.heap_reserve,
            self.heap_commit,
            self._reserved_loader_attributes,
            self.data_dirs,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// 64-bit Executable header
///
/// Followed by [`RawExec64::data_dirs`] data directories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct RawExec64 {
    /// Standard/common subset
    pub standard: RawExec,

    /// Preferred base address of the image when loaded in memory.
    ///
    /// Windows default for DLLs is `0x10000000`
    ///
    /// Windows default for EXEs is `0x00400000`
    pub image_base: u64,

    pub layout: RawExecLayout,

    /// Size of the stack to reserve.
    pub stack_reserve: u64,

    /// Size of the stack to commit. Made available one page at a time until
    /// reserve.
    pub stack_commit: u64,

    /// Size of the heap to reserve.
    pub heap_reserve: u64,

    /// Size of the heap to commit. Made available one page at a time until
    /// reserve.
    pub heap_commit: u64,

    /// Reserved, 0.
    pub _reserved_loader_attributes: u32,

    /// Number of data directories following the header.
    pub data_dirs: u32,
}

impl RawExec64 {
    /// Parse from the start of `bytes`. Does not check the magic.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        Some(Self {
            standard: RawExec::parse(&mut r)?,
            image_base: r.u64()?,
            layout: RawExecLayout::parse(&mut r)?,
            stack_reserve: r.u64()?,
            stack_commit: r.u64()?,
            heap_reserve: r.u64()?,
            heap_commit: r.u64()?,
            _reserved_loader_attributes: r.u32()?,
            data_dirs: r.u32()?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let (standard, layout) = (self.standard, self.layout);
        standard.write(out);
        out.extend_from_slice(&{ self.image_base }.to_le_bytes());
        layout.write(out);
        for v in [
            self.stack_reserve,
            self.stack_commit,
            self.heap_reserve,
            self.heap_commit,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&{ self._reserved_loader_attributes }.to_le_bytes());
        out.extend_from_slice(&{ self.data_dirs }.to_le_bytes());
    }
}
