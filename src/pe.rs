//! PE type
use alloc::vec::Vec;
use core::mem::size_of;

use log::{debug, warn};

use crate::{
    data_dir::{DataDir, DataDirIdent, DataDirs},
    error::{Error, Result},
    exec::{Derived, ExecHeader},
    export::ExportTable,
    import::ImportTable,
    internal::align_up,
    raw::{RawCoff, RawDos, DOS_STUB, DOS_STUB_SIZE, PE_MAGIC},
    rva::Addressing,
    section::{self, Section, SECTION_HEADER_SIZE},
    CoffFlags,
    MachineType,
    SectionFlags,
    Subsystem,
};

/// A PE image
///
/// Owns its headers and sections. Fields derived from the section layout,
/// such as the image and headers size, are recomputed whenever the image is
/// written, see [`Pe::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pe {
    dos: RawDos,
    machine: MachineType,
    timestamp: u32,
    attributes: CoffFlags,
    exec: ExecHeader,
    data_dirs: DataDirs,
    sections: Vec<Section>,
}

/// Internal base API
impl Pe {
    pub(crate) fn from_parts(
        machine: MachineType,
        timestamp: u32,
        attributes: CoffFlags,
        exec: ExecHeader,
        data_dirs: DataDirs,
        sections: Vec<Section>,
    ) -> Self {
        Self {
            dos: RawDos::standard(),
            machine,
            timestamp,
            attributes,
            exec,
            data_dirs,
            sections,
        }
    }

    /// Size of every header, before alignment
    fn headers_len(&self) -> Result<u32> {
        let sections = self
            .sections
            .len()
            .checked_mul(SECTION_HEADER_SIZE)
            .ok_or(Error::TooMuchData)?;
        let len = DOS_STUB_SIZE
            + PE_MAGIC.len()
            + size_of::<RawCoff>()
            + usize::from(self.exec.written_size());
        len.checked_add(sections)
            .and_then(|l| l.try_into().ok())
            .ok_or(Error::TooMuchData)
    }

    /// Compute the exec header fields that depend on the sections
    fn derive(&self) -> Result<Derived> {
        let file_align = self.exec.file_align();
        let section_align = self.exec.section_align();
        let headers_size = align_up(self.headers_len()?, file_align).ok_or(Error::TooMuchData)?;

        let mut d = Derived {
            headers_size,
            ..Default::default()
        };
        let mut code_base = None;
        let mut data_base = None;
        let mut end = None;
        for s in &self.sections {
            let len = align_up(s.mem_size(), file_align).ok_or(Error::TooMuchData)?;
            let sum = |total: u32| total.checked_add(len).ok_or(Error::TooMuchData);

            let flags = s.flags();
            if flags.contains(SectionFlags::CODE) {
                d.code_size = sum(d.code_size)?;
                code_base.get_or_insert(s.rva());
            }
            if flags.contains(SectionFlags::INITIALIZED) {
                d.init_size = sum(d.init_size)?;
                data_base.get_or_insert(s.rva());
            }
            if flags.contains(SectionFlags::UNINITIALIZED) {
                d.uninit_size = sum(d.uninit_size)?;
            }

            let s_end = s.rva().checked_add(s.mem_size()).ok_or(Error::TooMuchData)?;
            end = Some(end.map_or(s_end, |e: u32| e.max(s_end)));
        }
        d.code_base = code_base.unwrap_or_default();
        d.data_base = data_base.unwrap_or_default();
        d.image_size = align_up(end.unwrap_or(headers_size), section_align).ok_or(Error::TooMuchData)?;
        Ok(d)
    }
}

/// Public deserialization API
impl Pe {
    /// Parse a [`Pe`] from `bytes`
    ///
    /// Section data is copied out of `bytes`.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingDos`] or [`Error::InvalidDosMagic`] If the DOS header
    ///   is missing or invalid
    /// - [`Error::MissingPe`] or [`Error::InvalidPeMagic`] If the PE signature
    ///   or COFF header is missing or invalid
    /// - [`Error::MissingExecHeader`], [`Error::InvalidExecMagic`], or
    ///   [`Error::ExecHeaderTooSmall`] If the exec header is missing or invalid
    /// - [`Error::MissingSectionTable`] If the section table is truncated
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let dos = RawDos::parse(bytes)?;
        let pe_offset = usize::try_from(dos.pe_offset).map_err(|_| Error::MissingPe)?;

        let sig = bytes
            .get(pe_offset..)
            .and_then(|b| b.get(..PE_MAGIC.len()))
            .ok_or(Error::MissingPe)?;
        if sig != PE_MAGIC {
            return Err(Error::InvalidPeMagic);
        }

        let coff_start = pe_offset + PE_MAGIC.len();
        let coff = bytes
            .get(coff_start..)
            .and_then(RawCoff::parse)
            .ok_or(Error::MissingPe)?;
        debug!("{coff:?}");

        let exec_start = coff_start + size_of::<RawCoff>();
        let exec_bytes = bytes.get(exec_start..).unwrap_or_default();
        let (exec, data_dirs) = ExecHeader::parse(exec_bytes, coff.exec_header_size)?;

        let table = exec_start + usize::from(coff.exec_header_size);
        let sections = section::parse_table(bytes, table, coff.sections)?;

        Ok(Self {
            dos,
            machine: coff.machine,
            timestamp: coff.time,
            attributes: coff.file_attributes,
            exec,
            data_dirs,
            sections,
        })
    }
}

/// Public data API
impl Pe {
    /// Get a [`Section`] by `name`
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name() == name)
    }

    /// Get the [`Section`] containing `rva`
    pub fn section_by_rva(&self, rva: u32) -> Option<&Section> {
        self.addressing().resolve(rva).map(|(s, _)| s)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Resolve RVAs against this image's sections
    pub fn addressing(&self) -> Addressing<'_> {
        Addressing::new(&self.sections)
    }

    /// Get a data directory by its [`DataDirIdent`] identifier
    pub fn data_dir(&self, id: DataDirIdent) -> DataDir {
        self.data_dirs.get(id)
    }

    pub fn data_dirs(&self) -> &DataDirs {
        &self.data_dirs
    }

    /// Decode the import table, if the image has one
    ///
    /// [`None`] if the directory is absent or doesn't point into a section.
    pub fn imports(&self) -> Option<ImportTable> {
        let dir = self.data_dir(DataDirIdent::Import);
        if !dir.is_present() {
            return None;
        }
        let addressing = self.addressing();
        if addressing.resolve(dir.rva).is_none() {
            warn!("import directory at {:#x} is outside every section", dir.rva);
            return None;
        }
        Some(ImportTable::parse(&addressing, dir.rva, self.is_plus()))
    }

    /// Decode the export table, if the image has one
    ///
    /// [`None`] if the directory is absent or unreadable.
    pub fn exports(&self) -> Option<ExportTable> {
        let dir = self.data_dir(DataDirIdent::Export);
        if !dir.is_present() {
            return None;
        }
        let table = ExportTable::parse(&self.addressing(), dir.rva);
        if table.is_none() {
            warn!("export directory at {:#x} is unreadable", dir.rva);
        }
        table
    }

    /// Whether this is a PE32+ image
    pub fn is_plus(&self) -> bool {
        self.exec.is_plus()
    }

    /// Machine type
    pub fn machine_type(&self) -> MachineType {
        self.machine
    }

    /// COFF Attributes
    pub fn attributes(&self) -> CoffFlags {
        self.attributes
    }

    /// Low 32-bits of a unix timestamp
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Subsystem, or type, of the PE file.
    pub fn subsystem(&self) -> Subsystem {
        self.exec.subsystem()
    }

    /// Entry point address relative to the image base
    pub fn entry(&self) -> u32 {
        self.exec.entry()
    }

    /// Preferred base address of the image
    pub fn image_base(&self) -> u64 {
        self.exec.image_base()
    }

    /// File alignment
    pub fn file_align(&self) -> u32 {
        self.exec.file_align()
    }

    /// Section alignment
    pub fn section_align(&self) -> u32 {
        self.exec.section_align()
    }

    /// Image size
    pub fn image_size(&self) -> u32 {
        self.exec.image_size()
    }

    /// Headers size
    pub fn headers_size(&self) -> u32 {
        self.exec.headers_size()
    }
}

/// Public advanced API
impl Pe {
    /// Exec header for this PE file
    pub fn exec(&self) -> &ExecHeader {
        &self.exec
    }

    /// DOS header this PE file was read with
    ///
    /// This is only for advanced users.
    /// The standard header is always written.
    pub fn dos(&self) -> &RawDos {
        &self.dos
    }
}

/// Public modification API
impl Pe {
    pub fn exec_mut(&mut self) -> &mut ExecHeader {
        &mut self.exec
    }

    pub fn set_machine_type(&mut self, machine: MachineType) {
        self.machine = machine;
    }

    pub fn set_attributes(&mut self, attr: CoffFlags) {
        self.attributes = attr;
    }

    pub fn set_timestamp(&mut self, time: u32) {
        self.timestamp = time;
    }

    /// Set a data directory
    ///
    /// Some directories have fixed sizes or must be zero,
    /// see [`DataDirs::set`].
    pub fn set_data_dir(&mut self, id: DataDirIdent, dir: DataDir) {
        self.data_dirs.set(id, dir);
    }

    pub fn sections_mut(&mut self) -> &mut Vec<Section> {
        &mut self.sections
    }

    /// Append a section
    ///
    /// # Errors
    ///
    /// - [`Error::TooMuchData`] If the image already has 65535 sections
    pub fn add_section(&mut self, section: Section) -> Result<()> {
        if self.sections.len() >= usize::from(u16::MAX) {
            return Err(Error::TooMuchData);
        }
        self.sections.push(section);
        Ok(())
    }

    /// Remove a section by name, returning it
    pub fn remove_section(&mut self, name: &str) -> Option<Section> {
        let i = self.sections.iter().position(|s| s.name() == name)?;
        Some(self.sections.remove(i))
    }

    /// Recompute the derived header fields and section disk locations,
    /// exactly as [`Pe::write`] would write them
    pub fn update(&mut self) -> Result<()> {
        let derived = self.derive()?;
        let headers = section::plan_table(&self.sections, derived.headers_size, self.file_align())?;
        self.exec.set_derived(&derived);
        section::apply_table(&mut self.sections, &headers);
        Ok(())
    }
}

/// Public serialization API
impl Pe {
    /// Write the image, appending to `out`
    ///
    /// The standard DOS header and stub are written, followed by all 16
    /// data directories. Section data is placed in order after the headers.
    ///
    /// # Errors
    ///
    /// - [`Error::TooMuchData`] If there are more than 65535 sections,
    ///   or the layout doesn't fit in 32 bits
    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let count: u16 = self
            .sections
            .len()
            .try_into()
            .map_err(|_| Error::TooMuchData)?;
        let derived = self.derive()?;
        let headers = section::plan_table(&self.sections, derived.headers_size, self.file_align())?;
        let mut exec = self.exec;
        exec.set_derived(&derived);
        debug!("writing {count} sections, {derived:?}");

        let base = out.len();
        RawDos::standard().write(out);
        out.extend_from_slice(&DOS_STUB);
        out.extend_from_slice(PE_MAGIC);
        RawCoff::new(
            self.machine,
            count,
            self.timestamp,
            exec.written_size(),
            self.attributes,
        )
        .write(out);
        exec.write(out);
        self.data_dirs.write(out);
        for h in &headers {
            h.write(out);
        }
        debug_assert_eq!(out.len() - base, self.headers_len()? as usize);

        out.resize(base + derived.headers_size as usize, 0);
        section::write_data(&self.sections, &headers, out, base);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::{internal::test_util::put, PeBuilder};

    /// Offset of the exec header in a written image
    const EXEC: usize = DOS_STUB_SIZE + 4 + 20;

    fn image(plus: bool) -> anyhow::Result<Pe> {
        let text = Section::with_data(
            ".text",
            0x1000,
            0,
            SectionFlags::CODE | SectionFlags::EXEC | SectionFlags::READ,
            vec![0xC3; 0x10],
        )?;
        let data = Section::with_data(
            ".data",
            0x2000,
            0x1800,
            SectionFlags::INITIALIZED | SectionFlags::READ | SectionFlags::WRITE,
            vec![1; 0x300],
        )?;
        let bss = Section::new(
            ".bss",
            0x4000,
            0x80,
            SectionFlags::UNINITIALIZED | SectionFlags::READ | SectionFlags::WRITE,
        )?;
        Ok(PeBuilder::new()
            .machine(MachineType::AMD64, plus)
            .entry(0x1000)
            .section(text)
            .section(data)
            .section(bss)
            .build()?)
    }

    #[test]
    fn derived_fields() -> anyhow::Result<()> {
        for plus in [false, true] {
            let pe = Pe::from_bytes(&image(plus)?.to_bytes()?)?;
            let exec = pe.exec();
            let exec_size = if plus { 240 } else { 224 };

            // 128 + 4 + 20 + exec + 3 * 40, aligned to 512
            assert!(128 + 4 + 20 + exec_size + 3 * 40 <= 512);
            assert_eq!(pe.headers_size(), 512);
            // Highest end is .bss, 0x4080, aligned to 4096
            assert_eq!(pe.image_size(), 0x5000);

            assert_eq!(exec.code_size(), 0x200);
            // Memory sizes, not data lengths, aligned to 512
            assert_eq!(exec.init_size(), 0x1800);
            assert_eq!(exec.uninit_size(), 0x200);
            assert_eq!(exec.code_base(), 0x1000);
            assert_eq!(exec.data_base(), (!plus).then_some(0x2000));
            assert_eq!(exec.data_dirs(), 16);

            let disk: Vec<_> = pe
                .sections()
                .iter()
                .map(|s| (s.disk_offset(), s.disk_size()))
                .collect();
            assert_eq!(disk, [(0x200, 0x200), (0x400, 0x400), (0, 0)]);
        }
        Ok(())
    }

    #[test]
    fn virtual_sizes_count() -> anyhow::Result<()> {
        let pe = PeBuilder::new()
            .machine(MachineType::AMD64, true)
            .section(Section::with_data(
                ".data",
                0x1000,
                0x3000,
                SectionFlags::INITIALIZED | SectionFlags::READ,
                vec![7; 0x10],
            )?)
            .section(Section::new(
                ".bss",
                0x4000,
                0x2000,
                SectionFlags::UNINITIALIZED | SectionFlags::READ | SectionFlags::WRITE,
            )?)
            .build()?;
        let pe = Pe::from_bytes(&pe.to_bytes()?)?;
        assert_eq!(pe.exec().init_size(), 0x3000);
        assert_eq!(pe.exec().uninit_size(), 0x2000);
        assert_eq!(pe.exec().code_size(), 0);
        Ok(())
    }

    #[test]
    fn no_sections() -> anyhow::Result<()> {
        let pe = PeBuilder::new().machine(MachineType::I386, false).build()?;
        let bytes = pe.to_bytes()?;
        assert_eq!(bytes.len(), 512);
        let pe = Pe::from_bytes(&bytes)?;
        assert_eq!(pe.image_size(), 0x1000);
        assert_eq!(pe.exec().code_base(), 0);
        assert!(pe.sections().is_empty());
        Ok(())
    }

    #[test]
    fn standard_dos() -> anyhow::Result<()> {
        let bytes = image(false)?.to_bytes()?;
        assert_eq!(&bytes[..2], b"MZ");
        assert_eq!(&bytes[0x3C..0x40], &0x80u32.to_le_bytes());
        assert_eq!(&bytes[0x80..0x84], b"PE\0\0");
        assert!(bytes[0x40..0x80]
            .windows(39)
            .any(|w| w == b"This program cannot be run in DOS mode."));
        Ok(())
    }

    #[test]
    fn format_errors() -> anyhow::Result<()> {
        let good = image(false)?.to_bytes()?;

        let mut bad = good.clone();
        bad[0] = b'Z';
        assert_eq!(Pe::from_bytes(&bad), Err(Error::InvalidDosMagic));
        assert_eq!(Pe::from_bytes(&good[..10]), Err(Error::MissingDos));

        let mut bad = good.clone();
        put(&mut bad, 0x80, b"PX\0\0");
        assert_eq!(Pe::from_bytes(&bad), Err(Error::InvalidPeMagic));
        assert_eq!(Pe::from_bytes(&good[..0x82]), Err(Error::MissingPe));
        assert_eq!(Pe::from_bytes(&good[..0x90]), Err(Error::MissingPe));

        let mut bad = good.clone();
        put(&mut bad, 0x3C, &0xFFFF_0000u32.to_le_bytes());
        assert_eq!(Pe::from_bytes(&bad), Err(Error::MissingPe));

        let mut bad = good.clone();
        put(&mut bad, EXEC, &0x10Cu16.to_le_bytes());
        assert_eq!(Pe::from_bytes(&bad), Err(Error::InvalidExecMagic(0x10C)));

        // Declared exec header size
        let mut bad = good.clone();
        put(&mut bad, EXEC - 4, &200u16.to_le_bytes());
        assert_eq!(
            Pe::from_bytes(&bad),
            Err(Error::ExecHeaderTooSmall {
                expected: 224,
                actual: 200
            })
        );

        assert_eq!(Pe::from_bytes(&good[..EXEC]), Err(Error::MissingExecHeader));
        assert_eq!(Pe::from_bytes(&good[..EXEC + 224 + 40]), Err(Error::MissingSectionTable));
        Ok(())
    }

    #[test]
    fn truncated_section_data() -> anyhow::Result<()> {
        let good = image(false)?.to_bytes()?;
        let pe = Pe::from_bytes(&good[..0x500])?;
        let data = pe.section(".data").unwrap();
        assert_eq!(data.data().map(<[u8]>::len), Some(0x100));
        assert_eq!(pe.addressing().read_u32_at(0x20FC), Some(0x01010101));
        assert_eq!(pe.addressing().read_u32_at(0x2100), None);
        Ok(())
    }

    #[test]
    fn section_lookup() -> anyhow::Result<()> {
        let mut pe = image(true)?;
        assert_eq!(pe.section(".data").map(Section::rva), Some(0x2000));
        assert_eq!(pe.section(".rsrc"), None);
        assert_eq!(pe.section_by_rva(0x37FF).map(Section::name), Some(".data"));
        assert_eq!(pe.section_by_rva(0x3800), None);
        assert_eq!(pe.section_by_rva(0x4010).map(Section::name), Some(".bss"));

        assert!(pe.remove_section(".bss").is_some());
        assert_eq!(pe.sections().len(), 2);
        pe.update()?;
        assert_eq!(pe.image_size(), 0x4000);
        Ok(())
    }

    #[test]
    fn no_tables() -> anyhow::Result<()> {
        let mut pe = image(false)?;
        assert_eq!(pe.imports(), None);
        assert_eq!(pe.exports(), None);

        // Points nowhere
        pe.set_data_dir(DataDirIdent::Import, DataDir::new(0x9000, 20));
        pe.set_data_dir(DataDirIdent::Export, DataDir::new(0x9000, 40));
        assert_eq!(pe.imports(), None);
        assert_eq!(pe.exports(), None);
        Ok(())
    }

    #[test]
    fn fuzz_from_bytes() {
        bolero::check!().for_each(|bytes: &[u8]| {
            if let Ok(pe) = Pe::from_bytes(bytes) {
                let _ = pe.imports();
                let _ = pe.exports();
            }
        });
    }
}
