//! Higher level wrappers around the [Executable Header][RawExec],
//! see there for more details.
use alloc::vec::Vec;
use core::mem::size_of;

use log::debug;

use crate::{
    data_dir::{DataDirs, DATA_DIRS},
    error::{Error, Result},
    internal::read_u16,
    raw::exec::{RawExec, RawExec32, RawExec64, RawExecLayout, PE32_64_MAGIC, PE32_MAGIC},
    ExecFlags,
    Subsystem,
};

/// Full size of a PE32 exec header with all 16 data directories
pub const PE32_HEADER_SIZE: u16 = (size_of::<RawExec32>() + DataDirs::size_of()) as u16;

/// Full size of a PE32+ exec header with all 16 data directories
pub const PE32_64_HEADER_SIZE: u16 = (size_of::<RawExec64>() + DataDirs::size_of()) as u16;

/// Executable header, otherwise known as the "optional" header
///
/// Provides an abstraction over the meaningless 32 and 64 bit difference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecHeader {
    Raw32(RawExec32),
    Raw64(RawExec64),
}

/// Public Data API
impl ExecHeader {
    /// Whether this is a PE32+, 64-bit, header
    pub const fn is_plus(&self) -> bool {
        matches!(self, ExecHeader::Raw64(_))
    }

    /// Convenience function to get the common [`RawExec`]
    pub const fn raw_exec(&self) -> RawExec {
        match self {
            ExecHeader::Raw32(h) => h.standard,
            ExecHeader::Raw64(h) => h.standard,
        }
    }

    const fn layout(&self) -> RawExecLayout {
        match self {
            ExecHeader::Raw32(h) => h.layout,
            ExecHeader::Raw64(h) => h.layout,
        }
    }

    /// Size in bytes of the fixed header, without data directories
    pub const fn size_of(&self) -> usize {
        match self {
            ExecHeader::Raw32(_) => size_of::<RawExec32>(),
            ExecHeader::Raw64(_) => size_of::<RawExec64>(),
        }
    }

    /// Size in bytes of the header as written, with all data directories
    pub const fn written_size(&self) -> u16 {
        match self {
            ExecHeader::Raw32(_) => PE32_HEADER_SIZE,
            ExecHeader::Raw64(_) => PE32_64_HEADER_SIZE,
        }
    }

    /// How many data directories were declared
    pub const fn data_dirs(&self) -> u32 {
        match self {
            ExecHeader::Raw32(h) => h.data_dirs,
            ExecHeader::Raw64(h) => h.data_dirs,
        }
    }

    /// Linker (major, minor)
    pub const fn linker_version(&self) -> (u8, u8) {
        let e = self.raw_exec();
        (e.linker_major, e.linker_minor)
    }

    pub const fn code_size(&self) -> u32 {
        self.raw_exec().code_size
    }

    pub const fn init_size(&self) -> u32 {
        self.raw_exec().init_size
    }

    pub const fn uninit_size(&self) -> u32 {
        self.raw_exec().uninit_size
    }

    /// Entry point address relative to the image base
    pub const fn entry(&self) -> u32 {
        self.raw_exec().entry_ptr
    }

    /// Start of the code section relative to the image base
    pub const fn code_base(&self) -> u32 {
        self.raw_exec().code_ptr
    }

    /// Start of the data section relative to the image base
    ///
    /// Only exists for PE32.
    pub const fn data_base(&self) -> Option<u32> {
        match self {
            ExecHeader::Raw32(h) => Some(h.data_ptr),
            ExecHeader::Raw64(_) => None,
        }
    }

    /// Preferred Base of the image in memory.
    ///
    /// Coerced to u64 even on/for 32bit.
    pub const fn image_base(&self) -> u64 {
        match self {
            ExecHeader::Raw32(h) => h.image_base as u64,
            ExecHeader::Raw64(h) => h.image_base,
        }
    }

    /// Alignment of sections in memory
    pub const fn section_align(&self) -> u32 {
        self.layout().mem_align
    }

    /// Alignment of sections on disk
    pub const fn file_align(&self) -> u32 {
        self.layout().disk_align
    }

    /// OS (major, minor)
    pub const fn os_version(&self) -> (u16, u16) {
        let l = self.layout();
        (l.os_major, l.os_minor)
    }

    /// Image (major, minor)
    pub const fn image_version(&self) -> (u16, u16) {
        let l = self.layout();
        (l.image_major, l.image_minor)
    }

    /// Subsystem (major, minor)
    pub const fn subsystem_version(&self) -> (u16, u16) {
        let l = self.layout();
        (l.subsystem_major, l.subsystem_minor)
    }

    pub const fn image_size(&self) -> u32 {
        self.layout().image_size
    }

    /// Headers size
    pub const fn headers_size(&self) -> u32 {
        self.layout().headers_size
    }

    pub const fn checksum(&self) -> u32 {
        self.layout().checksum
    }

    /// Subsystem
    pub const fn subsystem(&self) -> Subsystem {
        self.layout().subsystem
    }

    pub const fn dll_attributes(&self) -> ExecFlags {
        self.layout().dll_attributes
    }

    /// Stack reserve and commit, respectively
    ///
    /// Coerced to u64 even on/for 32bit.
    pub const fn stack(&self) -> (u64, u64) {
        match self {
            ExecHeader::Raw32(h) => (h.stack_reserve as u64, h.stack_commit as u64),
            ExecHeader::Raw64(h) => (h.stack_reserve, h.stack_commit),
        }
    }

    /// Heap reserve and commit, respectively
    ///
    /// Coerced to u64 even on/for 32bit.
    pub const fn heap(&self) -> (u64, u64) {
        match self {
            ExecHeader::Raw32(h) => (h.heap_reserve as u64, h.heap_commit as u64),
            ExecHeader::Raw64(h) => (h.heap_reserve, h.heap_commit),
        }
    }
}

/// Public Modification API
impl ExecHeader {
    /// A zeroed header for PE32, or PE32+ if `plus`
    pub fn new(plus: bool) -> Self {
        let standard = RawExec {
            magic: if plus { PE32_64_MAGIC } else { PE32_MAGIC },
            linker_major: 0,
            linker_minor: 0,
            code_size: 0,
            init_size: 0,
            uninit_size: 0,
            entry_ptr: 0,
            code_ptr: 0,
        };
        let layout = RawExecLayout {
            mem_align: 0,
            disk_align: 0,
            os_major: 0,
            os_minor: 0,
            image_major: 0,
            image_minor: 0,
            subsystem_major: 0,
            subsystem_minor: 0,
            _reserved_win32: 0,
            image_size: 0,
            headers_size: 0,
            checksum: 0,
            subsystem: Subsystem::UNKNOWN,
            dll_attributes: ExecFlags::empty(),
        };
        if plus {
            ExecHeader::Raw64(RawExec64 {
                standard,
                image_base: 0,
                layout,
                stack_reserve: 0,
                stack_commit: 0,
                heap_reserve: 0,
                heap_commit: 0,
                _reserved_loader_attributes: 0,
                data_dirs: DATA_DIRS as u32,
            })
        } else {
            ExecHeader::Raw32(RawExec32 {
                standard,
                data_ptr: 0,
                image_base: 0,
                layout,
                stack_reserve: 0,
                stack_commit: 0,
                heap_reserve: 0,
                heap_commit: 0,
                _reserved_loader_attributes: 0,
                data_dirs: DATA_DIRS as u32,
            })
        }
    }

    fn raw_exec_mut(&mut self) -> &mut RawExec {
        match self {
            ExecHeader::Raw32(h) => &mut h.standard,
            ExecHeader::Raw64(h) => &mut h.standard,
        }
    }

    fn layout_mut(&mut self) -> &mut RawExecLayout {
        match self {
            ExecHeader::Raw32(h) => &mut h.layout,
            ExecHeader::Raw64(h) => &mut h.layout,
        }
    }

    pub fn set_linker_version(&mut self, (major, minor): (u8, u8)) {
        let e = self.raw_exec_mut();
        e.linker_major = major;
        e.linker_minor = minor;
    }

    pub fn set_entry(&mut self, entry: u32) {
        self.raw_exec_mut().entry_ptr = entry;
    }

    /// Set the image base
    ///
    /// # Errors
    ///
    /// - [`Error::TooMuchData`] If `base` doesn't fit in a PE32 header
    pub fn set_image_base(&mut self, base: u64) -> Result<()> {
        match self {
            ExecHeader::Raw32(h) => h.image_base = base.try_into().map_err(|_| Error::TooMuchData)?,
            ExecHeader::Raw64(h) => h.image_base = base,
        }
        Ok(())
    }

    /// Section alignment in memory and on disk, respectively
    pub fn set_alignment(&mut self, section_align: u32, file_align: u32) {
        let l = self.layout_mut();
        l.mem_align = section_align;
        l.disk_align = file_align;
    }

    pub fn set_os_version(&mut self, (major, minor): (u16, u16)) {
        let l = self.layout_mut();
        l.os_major = major;
        l.os_minor = minor;
    }

    pub fn set_image_version(&mut self, (major, minor): (u16, u16)) {
        let l = self.layout_mut();
        l.image_major = major;
        l.image_minor = minor;
    }

    pub fn set_subsystem_version(&mut self, (major, minor): (u16, u16)) {
        let l = self.layout_mut();
        l.subsystem_major = major;
        l.subsystem_minor = minor;
    }

    pub fn set_checksum(&mut self, checksum: u32) {
        self.layout_mut().checksum = checksum;
    }

    pub fn set_subsystem(&mut self, subsystem: Subsystem) {
        self.layout_mut().subsystem = subsystem;
    }

    pub fn set_dll_attributes(&mut self, attr: ExecFlags) {
        self.layout_mut().dll_attributes = attr;
    }

    /// Stack reserve and commit, respectively
    ///
    /// # Errors
    ///
    /// - [`Error::TooMuchData`] If either doesn't fit in a PE32 header
    pub fn set_stack(&mut self, (reserve, commit): (u64, u64)) -> Result<()> {
        match self {
            ExecHeader::Raw32(h) => {
                h.stack_reserve = reserve.try_into().map_err(|_| Error::TooMuchData)?;
                h.stack_commit = commit.try_into().map_err(|_| Error::TooMuchData)?;
            }
            ExecHeader::Raw64(h) => {
                h.stack_reserve = reserve;
                h.stack_commit = commit;
            }
        }
        Ok(())
    }

    /// Heap reserve and commit, respectively
    ///
    /// # Errors
    ///
    /// - [`Error::TooMuchData`] If either doesn't fit in a PE32 header
    pub fn set_heap(&mut self, (reserve, commit): (u64, u64)) -> Result<()> {
        match self {
            ExecHeader::Raw32(h) => {
                h.heap_reserve = reserve.try_into().map_err(|_| Error::TooMuchData)?;
                h.heap_commit = commit.try_into().map_err(|_| Error::TooMuchData)?;
            }
            ExecHeader::Raw64(h) => {
                h.heap_reserve = reserve;
                h.heap_commit = commit;
            }
        }
        Ok(())
    }

    /// Set the fields derived from the section layout
    pub(crate) fn set_derived(&mut self, derived: &Derived) {
        let e = self.raw_exec_mut();
        e.code_size = derived.code_size;
        e.init_size = derived.init_size;
        e.uninit_size = derived.uninit_size;
        e.code_ptr = derived.code_base;
        let l = self.layout_mut();
        l.image_size = derived.image_size;
        l.headers_size = derived.headers_size;
        match self {
            ExecHeader::Raw32(h) => {
                h.data_ptr = derived.data_base;
                h.data_dirs = DATA_DIRS as u32;
            }
            ExecHeader::Raw64(h) => h.data_dirs = DATA_DIRS as u32,
        }
    }
}

/// Exec header fields computed from the sections when writing
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Derived {
    pub code_size: u32,
    pub init_size: u32,
    pub uninit_size: u32,
    pub code_base: u32,
    pub data_base: u32,
    pub image_size: u32,
    pub headers_size: u32,
}

/// Public Deserialization API
impl ExecHeader {
    /// Parse an exec header of declared `size` from the start of `bytes`,
    /// along with its data directories.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingExecHeader`] If `bytes` is too small for the fixed
    ///   part of the header
    /// - [`Error::InvalidExecMagic`] If the magic is not PE32 or PE32+
    /// - [`Error::ExecHeaderTooSmall`] If `size` is less than the full size
    ///   of the header for its mode
    pub fn parse(bytes: &[u8], size: u16) -> Result<(Self, DataDirs)> {
        let magic = read_u16(bytes, 0).ok_or(Error::MissingExecHeader)?;
        let (exec, min) = match magic {
            PE32_MAGIC => (
                RawExec32::parse(bytes).map(ExecHeader::Raw32),
                PE32_HEADER_SIZE,
            ),
            PE32_64_MAGIC => (
                RawExec64::parse(bytes).map(ExecHeader::Raw64),
                PE32_64_HEADER_SIZE,
            ),
            m => return Err(Error::InvalidExecMagic(m)),
        };
        if size < min {
            return Err(Error::ExecHeaderTooSmall {
                expected: min,
                actual: size,
            });
        }
        let exec = exec.ok_or(Error::MissingExecHeader)?;
        debug!("{exec:?}");

        let end = usize::from(size).min(bytes.len());
        let dirs = DataDirs::parse(exec.data_dirs(), &bytes[exec.size_of()..end]);
        debug!("data directories: {dirs:?}");
        Ok((exec, dirs))
    }
}

/// Public Serialization API
impl ExecHeader {
    /// Write the fixed header, without data directories
    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            ExecHeader::Raw32(h) => h.write(out),
            ExecHeader::Raw64(h) => h.write(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(PE32_HEADER_SIZE, 224);
        assert_eq!(PE32_64_HEADER_SIZE, 240);
    }

    #[test]
    fn write_parse() -> anyhow::Result<()> {
        for plus in [false, true] {
            let mut exec = ExecHeader::new(plus);
            exec.set_image_base(0x10000000)?;
            exec.set_alignment(4096, 512);
            exec.set_stack((0x100000, 0x1000))?;
            exec.set_subsystem(Subsystem::WINDOWS_CLI);
            exec.set_os_version((4, 0));

            let mut out = Vec::new();
            exec.write(&mut out);
            assert_eq!(out.len(), exec.size_of());
            let mut dirs = DataDirs::new();
            dirs.set(
                crate::DataDirIdent::Import,
                crate::DataDir::new(0x2000, 0x28),
            );
            dirs.write(&mut out);
            assert_eq!(out.len(), usize::from(exec.written_size()));

            let (back, back_dirs) = ExecHeader::parse(&out, exec.written_size())?;
            assert_eq!(back, exec);
            assert_eq!(back_dirs, dirs);
            assert_eq!(back.is_plus(), plus);
            assert_eq!(back.data_base().is_none(), plus);
            assert_eq!(back.stack(), (0x100000, 0x1000));
        }
        Ok(())
    }

    #[test]
    fn too_small() {
        let mut out = Vec::new();
        ExecHeader::new(true).write(&mut out);
        out.resize(240, 0);
        assert_eq!(
            ExecHeader::parse(&out, 224),
            Err(Error::ExecHeaderTooSmall {
                expected: 240,
                actual: 224
            })
        );
        assert_eq!(
            ExecHeader::parse(&[0x0B, 0x01], 224),
            Err(Error::MissingExecHeader)
        );
        assert_eq!(
            ExecHeader::parse(&[0x0B, 0x03], 224),
            Err(Error::InvalidExecMagic(0x30B))
        );
        assert!(ExecHeader::new(false).set_image_base(u64::MAX).is_err());
    }

    /// Test and fuzz [`ExecHeader::parse`]
    #[test]
    fn exec_parse() {
        bolero::check!()
            .with_type::<(Vec<u8>, u16)>()
            .for_each(|(bytes, size)| {
                match ExecHeader::parse(bytes, *size) {
                    Ok((exec, _)) => {
                        // Should only be `Ok` if the whole fixed header fit
                        assert!(bytes.len() >= exec.size_of());
                        assert!(*size >= exec.written_size());
                    }
                    Err(Error::MissingExecHeader) => {
                        assert!(bytes.len() < size_of::<RawExec64>());
                    }
                    Err(Error::InvalidExecMagic(m)) => {
                        assert!(m != PE32_MAGIC && m != PE32_64_MAGIC);
                    }
                    Err(Error::ExecHeaderTooSmall { expected, actual }) => {
                        assert!(actual < expected);
                    }
                    Err(e) => unreachable!("{e:#?}"),
                }
            });
    }
}
