//! Builders and stuff
use alloc::vec::Vec;
use core::marker::PhantomData;

use log::debug;

use crate::{
    data_dir::{DataDir, DataDirIdent, DataDirs},
    error::{Error, Result},
    exec::ExecHeader,
    internal::align_up,
    CoffFlags,
    ExecFlags,
    MachineType,
    Pe,
    Section,
    Subsystem,
};

/// Default image base to use
const DEFAULT_IMAGE_BASE: u64 = 0x10000000;

/// Default stack and heap (reserve, commit)
const DEFAULT_RESERVE: (u64, u64) = (0x100000, 0x1000);

mod states {
    //! States for [`crate::PeBuilder`]

    #[derive(Debug, Clone, Copy)]
    pub struct Empty;

    #[derive(Debug, Clone, Copy)]
    pub struct Machine;
}

/// Builder for a [`crate::Pe`] image
///
/// A machine type, and whether the image is PE32 or PE32+, are required
/// before anything else can be set.
#[derive(Debug, Clone)]
pub struct PeBuilder<State> {
    /// Type state.
    state: PhantomData<State>,

    /// Sections in the image, in order.
    sections: Vec<Section>,

    /// Defaults to all 16, zeroed.
    data_dirs: DataDirs,

    /// Machine type. Required.
    machine: MachineType,

    /// PE32 vs PE32+
    plus: bool,

    /// Timestamp. Defaults to 0.
    timestamp: u32,

    /// Defaults to [`DEFAULT_IMAGE_BASE`]
    image_base: u64,

    /// Defaults to 4096
    section_align: u32,

    /// Defaults to 512
    disk_align: u32,

    /// Defaults to 0
    entry: u32,

    /// Defaults to `IMAGE | LARGE_ADDRESS_AWARE`
    attributes: CoffFlags,

    dll_attributes: ExecFlags,

    /// Defaults to [`Subsystem::WINDOWS_CLI`]
    subsystem: Subsystem,

    /// Stack reserve and commit
    stack: (u64, u64),

    /// Heap reserve and commit
    heap: (u64, u64),

    os_ver: (u16, u16),
    image_ver: (u16, u16),
    subsystem_ver: (u16, u16),
    linker_ver: (u8, u8),
}

impl PeBuilder<states::Empty> {
    /// Create a new [`PeBuilder`]
    pub fn new() -> Self {
        Self {
            state: PhantomData,
            sections: Vec::new(),
            data_dirs: DataDirs::new(),
            machine: MachineType::UNKNOWN,
            plus: false,
            timestamp: 0,
            image_base: DEFAULT_IMAGE_BASE,
            section_align: 4096,
            disk_align: 512,
            entry: 0,
            attributes: CoffFlags::IMAGE | CoffFlags::LARGE_ADDRESS_AWARE,
            dll_attributes: ExecFlags::HIGH_ENTROPY_VA
                | ExecFlags::DYNAMIC_BASE
                | ExecFlags::NX_COMPAT
                | ExecFlags::NO_SEH
                | ExecFlags::TERMINAL_SERVER,
            subsystem: Subsystem::WINDOWS_CLI,
            stack: DEFAULT_RESERVE,
            heap: DEFAULT_RESERVE,
            os_ver: (4, 0),
            image_ver: (1, 0),
            subsystem_ver: (4, 0),
            linker_ver: (1, 0),
        }
    }

    /// Machine Type. This is required.
    ///
    /// `plus` determines whether the image is a PE32 or a PE32+ image,
    /// or in other words whether it uses 32-bit or 64-bit pointers.
    pub fn machine(self, machine: MachineType, plus: bool) -> PeBuilder<states::Machine> {
        PeBuilder {
            state: PhantomData,
            sections: self.sections,
            data_dirs: self.data_dirs,
            machine,
            plus,
            timestamp: self.timestamp,
            image_base: self.image_base,
            section_align: self.section_align,
            disk_align: self.disk_align,
            entry: self.entry,
            attributes: self.attributes,
            dll_attributes: self.dll_attributes,
            subsystem: self.subsystem,
            stack: self.stack,
            heap: self.heap,
            os_ver: self.os_ver,
            image_ver: self.image_ver,
            subsystem_ver: self.subsystem_ver,
            linker_ver: self.linker_ver,
        }
    }
}

impl PeBuilder<states::Machine> {
    /// Offset from image base to entry point
    ///
    /// Defaults to 0
    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    /// Stack reserve and commit, respectively
    pub fn stack(mut self, stack: (u64, u64)) -> Self {
        self.stack = stack;
        self
    }

    /// Heap reserve and commit, respectively
    pub fn heap(mut self, heap: (u64, u64)) -> Self {
        self.heap = heap;
        self
    }

    /// OS (major, minor)
    pub fn os_version(mut self, ver: (u16, u16)) -> Self {
        self.os_ver = ver;
        self
    }

    /// Image (major, minor)
    pub fn image_version(mut self, ver: (u16, u16)) -> Self {
        self.image_ver = ver;
        self
    }

    /// Subsystem (major, minor)
    pub fn subsystem_version(mut self, ver: (u16, u16)) -> Self {
        self.subsystem_ver = ver;
        self
    }

    /// Linker (major, minor)
    pub fn linker_version(mut self, ver: (u8, u8)) -> Self {
        self.linker_ver = ver;
        self
    }

    pub fn subsystem(mut self, subsystem: Subsystem) -> Self {
        self.subsystem = subsystem;
        self
    }

    /// Attributes for the [`crate::Pe`] file.
    ///
    /// This completely overwrites the attributes.
    pub fn attributes(mut self, attr: CoffFlags) -> Self {
        self.attributes = attr;
        self
    }

    /// Low 32 bits of the unix timestamp for this image.
    pub fn timestamp(mut self, time: u32) -> Self {
        self.timestamp = time;
        self
    }

    /// Preferred base address of the image
    ///
    /// Must fit in 32 bits for PE32 images.
    pub fn image_base(mut self, image_base: u64) -> Self {
        self.image_base = image_base;
        self
    }

    /// Section alignment in memory and on disk, respectively
    pub fn alignment(mut self, section_align: u32, disk_align: u32) -> Self {
        self.section_align = section_align;
        self.disk_align = disk_align;
        self
    }

    /// DLL Attributes for the [`crate::Pe`] image.
    pub fn dll_attributes(mut self, attr: ExecFlags) -> Self {
        self.dll_attributes = attr;
        self
    }

    /// Append a section
    ///
    /// A section with an RVA of zero is placed after the previous sections,
    /// aligned to the section alignment, when built.
    pub fn section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }

    /// Set the data directory `id`
    pub fn data_dir(mut self, id: DataDirIdent, dir: DataDir) -> Self {
        self.data_dirs.set(id, dir);
        self
    }

    /// Build the [`Pe`], computing every field derived from the sections
    ///
    /// # Errors
    ///
    /// - [`Error::TooMuchData`] If a 64-bit value was given for a PE32 image,
    ///   there are more than 65535 sections, or the sections don't fit in
    ///   the address space
    pub fn build(self) -> Result<Pe> {
        if self.sections.len() > usize::from(u16::MAX) {
            return Err(Error::TooMuchData);
        }

        let mut exec = ExecHeader::new(self.plus);
        exec.set_linker_version(self.linker_ver);
        exec.set_os_version(self.os_ver);
        exec.set_image_version(self.image_ver);
        exec.set_subsystem_version(self.subsystem_ver);
        exec.set_entry(self.entry);
        exec.set_image_base(self.image_base)?;
        exec.set_alignment(self.section_align, self.disk_align);
        exec.set_subsystem(self.subsystem);
        exec.set_dll_attributes(self.dll_attributes);
        exec.set_stack(self.stack)?;
        exec.set_heap(self.heap)?;

        let mut sections = self.sections;
        let mut next = self.section_align;
        for s in &mut sections {
            if s.rva() == 0 {
                s.set_rva(next);
            }
            let end = s.rva().checked_add(s.mem_size()).ok_or(Error::TooMuchData)?;
            next = next.max(align_up(end, self.section_align).ok_or(Error::TooMuchData)?);
        }

        let mut pe = Pe::from_parts(
            self.machine,
            self.timestamp,
            self.attributes,
            exec,
            self.data_dirs,
            sections,
        );
        pe.update()?;
        debug!("built {} section image", pe.sections().len());
        Ok(pe)
    }
}

impl Default for PeBuilder<states::Empty> {
    fn default() -> Self {
        Self::new()
    }
}
