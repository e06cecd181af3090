//! PE/COFF image handling
//!
//! Parses a PE32 or PE32+ image into an owned, editable [`Pe`],
//! and writes it back out.
//!
//! The import and export tables are modeled in full, see [`import`] and
//! [`export`]. Every other data directory is kept as an opaque
//! [`DataDir`] envelope.
//!
//! Decoding is tolerant. Only structural problems with the headers are
//! errors, addresses that don't resolve simply produce empty values.
#![cfg_attr(not(any(feature = "std", test)), no_std)]
extern crate alloc;

pub mod builder;
pub mod data_dir;
pub mod error;
pub mod exec;
pub mod export;
pub mod import;
mod internal;
pub mod lexical;
pub mod pe;
pub mod raw;
pub mod rva;
pub mod section;

use bitflags::bitflags;

pub use crate::{
    builder::PeBuilder,
    data_dir::{DataDir, DataDirIdent, DataDirs},
    error::{Error, Result},
    exec::ExecHeader,
    export::{ExportSymbol, ExportTable, NameIndex},
    import::{ImportSymbol, ImportTable, Library},
    lexical::compare_names,
    pe::Pe,
    rva::Addressing,
    section::Section,
};

/// Machine type, or architecture, of the PE file.
///
/// This is what architectures the file will run on.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MachineType(pub u16);

impl MachineType {
    /// Unknown/Any/All machine type
    pub const UNKNOWN: Self = Self(0);

    /// x64
    pub const AMD64: Self = Self(0x8664);

    /// x86
    pub const I386: Self = Self(0x14C);

    /// ARM64 little endian
    pub const ARM64: Self = Self(0xAA64);

    /// EFI Byte Code
    pub const EBC: Self = Self(0xEBC);
}

impl core::fmt::Debug for MachineType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Self::UNKNOWN => write!(f, "MachineType::UNKNOWN"),
            Self::AMD64 => write!(f, "MachineType::AMD64"),
            Self::I386 => write!(f, "MachineType::I386"),
            Self::ARM64 => write!(f, "MachineType::ARM64"),
            Self::EBC => write!(f, "MachineType::EBC"),
            _ => f.debug_tuple("MachineType").field(&self.0).finish(),
        }
    }
}

impl core::fmt::Display for MachineType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Self::UNKNOWN => write!(f, "UNKNOWN"),
            Self::AMD64 => write!(f, "AMD64"),
            Self::I386 => write!(f, "I386"),
            Self::ARM64 => write!(f, "ARM64"),
            Self::EBC => write!(f, "EBC"),
            _ => write!(f, "{:#x}", self.0),
        }
    }
}

/// Subsystem, or type, of the PE file.
///
/// This determines a few things, such as the expected signature of the
/// application entry point, expected existence and contents of sections, etc.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Subsystem(pub u16);

impl Subsystem {
    pub const UNKNOWN: Self = Self(0);
    pub const NATIVE: Self = Self(1);
    pub const WINDOWS_GUI: Self = Self(2);
    pub const WINDOWS_CLI: Self = Self(3);
    pub const OS2_CLI: Self = Self(5);
    pub const POSIX_CLI: Self = Self(7);
    pub const NATIVE_WINDOWS: Self = Self(8);
    pub const WINDOWS_CE_GUI: Self = Self(9);
    pub const EFI_APPLICATION: Self = Self(10);
    pub const EFI_BOOT_DRIVER: Self = Self(11);
    pub const EFI_RUNTIME_DRIVER: Self = Self(12);
    pub const EFI_ROM: Self = Self(13);
    pub const XBOX: Self = Self(14);
    pub const WINDOWS_BOOT: Self = Self(16);

    fn name(&self) -> Option<&'static str> {
        Some(match *self {
            Self::UNKNOWN => "UNKNOWN",
            Self::NATIVE => "NATIVE",
            Self::WINDOWS_GUI => "WINDOWS_GUI",
            Self::WINDOWS_CLI => "WINDOWS_CLI",
            Self::OS2_CLI => "OS2_CLI",
            Self::POSIX_CLI => "POSIX_CLI",
            Self::NATIVE_WINDOWS => "NATIVE_WINDOWS",
            Self::WINDOWS_CE_GUI => "WINDOWS_CE_GUI",
            Self::EFI_APPLICATION => "EFI_APPLICATION",
            Self::EFI_BOOT_DRIVER => "EFI_BOOT_DRIVER",
            Self::EFI_RUNTIME_DRIVER => "EFI_RUNTIME_DRIVER",
            Self::EFI_ROM => "EFI_ROM",
            Self::XBOX => "XBOX",
            Self::WINDOWS_BOOT => "WINDOWS_BOOT",
            _ => return None,
        })
    }
}

impl core::fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Subsystem::{name}"),
            None => f.debug_tuple("Subsystem").field(&self.0).finish(),
        }
    }
}

impl core::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{}", self.0),
        }
    }
}

bitflags! {
    /// COFF image characteristics
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    #[repr(transparent)]
    pub struct CoffFlags: u16 {
        const RELOC_STRIPPED = 0x1;
        const IMAGE = 0x2;
        const COFF_LINE_STRIPPED = 0x4;
        const COFF_SYM_STRIPPED = 0x8;
        const AGGRESSIVE_WS_TRIM = 0x10;
        const LARGE_ADDRESS_AWARE = 0x20;
        const RESERVED = 0x40;
        const BYTES_REVERSED_LO = 0x80;
        const BIT32 = 0x100;
        const DEBUG_STRIPPED = 0x200;
        const REMOVABLE_SWAP = 0x400;
        const NET_SWAP = 0x800;
        const SYSTEM = 0x1000;
        const DLL = 0x2000;
        const UP_SYSTEM = 0x4000;
        const BYTES_REVERSED_HI = 0x8000;
    }
}

bitflags! {
    /// DLL characteristics from the exec header
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    #[repr(transparent)]
    pub struct ExecFlags: u16 {
        const RESERVED_1 = 0x1;
        const RESERVED_2 = 0x2;
        const RESERVED_3 = 0x4;
        const RESERVED_4 = 0x8;
        const HIGH_ENTROPY_VA = 0x20;
        const DYNAMIC_BASE = 0x40;
        const FORCE_INTEGRITY = 0x80;
        const NX_COMPAT = 0x100;
        const NO_ISOLATION = 0x200;
        const NO_SEH = 0x400;
        const NO_BIND = 0x800;
        const APP_CONTAINER = 0x1000;
        const WDM_DRIVER = 0x2000;
        const GUARD_CF = 0x4000;
        const TERMINAL_SERVER = 0x8000;
    }
}

bitflags! {
    /// Section characteristics
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    #[repr(transparent)]
    pub struct SectionFlags: u32 {
        const NO_PAD = 0x8;

        /// Code/executable
        const CODE = 0x20;

        /// Initialized/data
        const INITIALIZED = 0x40;

        /// Uninitialized/bss
        const UNINITIALIZED = 0x80;

        const INFO = 0x200;
        const REMOVE = 0x800;
        const COMDAT = 0x1000;
        const GLOBAL_REL = 0x8000;
        const ALIGN_1 = 0x100000;
        const ALIGN_2 = 0x200000;
        const ALIGN_4 = 0x300000;
        const ALIGN_8 = 0x400000;
        const ALIGN_16 = 0x500000;
        const ALIGN_32 = 0x600000;
        const ALIGN_64 = 0x700000;
        const ALIGN_128 = 0x800000;
        const ALIGN_256 = 0x900000;
        const ALIGN_512 = 0xA00000;
        const ALIGN_1024 = 0xB00000;
        const ALIGN_2048 = 0xC00000;
        const ALIGN_4096 = 0xD00000;
        const ALIGN_8192 = 0xE00000;
        const EXTENDED_RELOC = 0x1000000;
        const DISCARDABLE = 0x2000000;
        const NO_CACHE = 0x4000000;
        const NO_PAGE = 0x8000000;
        const SHARED = 0x10000000;
        const EXEC = 0x20000000;
        const READ = 0x40000000;
        const WRITE = 0x80000000;
    }
}
