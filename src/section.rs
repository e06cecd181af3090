//! Sections and the section table
//!
//! A [`Section`] is a named region of the image in memory, which may or may
//! not own bytes on disk. Sections without data, such as `.bss`,
//! are zero filled in memory.
use alloc::vec::Vec;
use core::{fmt, mem::size_of};

use log::{debug, trace, warn};

use crate::{
    error::{Error, Result},
    internal::{align_up, debug::NameHelper, pad_to},
    raw::RawSectionHeader,
    SectionFlags,
};

/// Size of a section header on disk
pub const SECTION_HEADER_SIZE: usize = size_of::<RawSectionHeader>();

/// Maximum length of a section name in an image
pub const SECTION_NAME_MAX: usize = 8;

/// A PE Section
#[derive(Clone, PartialEq, Eq)]
pub struct Section {
    name: [u8; SECTION_NAME_MAX],
    rva: u32,
    mem_size: u32,
    flags: SectionFlags,
    data: Option<Vec<u8>>,
    disk_offset: u32,
    disk_size: u32,
}

impl Section {
    /// Create a new [`Section`] named `name`, without any data.
    ///
    /// # Errors
    ///
    /// - [`Error::SectionNameTooLong`] If `name` is more than 8 bytes.
    pub fn new(name: &str, rva: u32, mem_size: u32, flags: SectionFlags) -> Result<Self> {
        let mut s = Self {
            name: [0; SECTION_NAME_MAX],
            rva,
            mem_size,
            flags,
            data: None,
            disk_offset: 0,
            disk_size: 0,
        };
        s.set_name(name)?;
        Ok(s)
    }

    /// Same as [`Section::new`], owning `data`
    ///
    /// The memory size is the larger of `mem_size` and the length of `data`.
    pub fn with_data(
        name: &str,
        rva: u32,
        mem_size: u32,
        flags: SectionFlags,
        data: Vec<u8>,
    ) -> Result<Self> {
        let len: u32 = data.len().try_into().map_err(|_| Error::TooMuchData)?;
        let mut s = Self::new(name, rva, mem_size.max(len), flags)?;
        s.data = Some(data);
        Ok(s)
    }

    fn from_raw(header: &RawSectionHeader) -> Self {
        Self {
            name: header.name,
            rva: header.mem_ptr,
            mem_size: header.mem_size,
            flags: header.attributes,
            data: None,
            disk_offset: header.disk_offset,
            disk_size: header.disk_size,
        }
    }
}

impl Section {
    /// Name of the section, with nul bytes stripped.
    ///
    /// Empty string is returned if the name is not valid UTF-8.
    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SECTION_NAME_MAX);
        core::str::from_utf8(&self.name[..end]).unwrap_or_default()
    }

    /// Raw NUL padded name
    pub fn raw_name(&self) -> [u8; SECTION_NAME_MAX] {
        self.name
    }

    /// Set the name of the section
    ///
    /// # Errors
    ///
    /// - [`Error::SectionNameTooLong`] If `name` is more than 8 bytes.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        if name.len() > SECTION_NAME_MAX {
            return Err(Error::SectionNameTooLong);
        }
        self.name = [0; SECTION_NAME_MAX];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }

    /// Address to the first byte of the section, relative to the image base.
    pub fn rva(&self) -> u32 {
        self.rva
    }

    pub fn set_rva(&mut self, rva: u32) {
        self.rva = rva;
    }

    /// Size of the section in memory, zero padded if needed.
    pub fn mem_size(&self) -> u32 {
        self.mem_size
    }

    pub fn set_mem_size(&mut self, size: u32) {
        self.mem_size = size;
    }

    /// Section flags/attributes/characteristics
    pub fn flags(&self) -> SectionFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: SectionFlags) {
        self.flags = flags;
    }

    /// Bytes owned by the section, if any.
    ///
    /// This may be shorter than [`Section::mem_size`].
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn data_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.data.as_mut()
    }

    /// Replace the data owned by the section.
    ///
    /// [`None`] makes the section purely virtual.
    pub fn set_data(&mut self, data: Option<Vec<u8>>) {
        self.data = data;
    }

    /// Offset of the section data on disk, as last read or written
    pub fn disk_offset(&self) -> u32 {
        self.disk_offset
    }

    /// Size of the section data on disk, as last read or written
    pub fn disk_size(&self) -> u32 {
        self.disk_size
    }

    /// Whether `rva` lies within `[rva, rva + mem_size)`
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.rva && rva - self.rva < self.mem_size
    }
}

impl fmt::Debug for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("name", &NameHelper(&self.name))
            .field("rva", &format_args!("{:#x}", self.rva))
            .field("mem_size", &format_args!("{:#x}", self.mem_size))
            .field("flags", &self.flags)
            .field("data", &self.data.as_ref().map(Vec::len))
            .field("disk_offset", &format_args!("{:#x}", self.disk_offset))
            .field("disk_size", &format_args!("{:#x}", self.disk_size))
            .finish()
    }
}

/// Parse `count` section headers at `offset` in `bytes`, then copy each
/// section's data from disk.
///
/// Section data outside of `bytes` is truncated.
///
/// # Errors
///
/// - [`Error::MissingSectionTable`] If the headers don't fit in `bytes`
pub(crate) fn parse_table(bytes: &[u8], offset: usize, count: u16) -> Result<Vec<Section>> {
    let table_len = usize::from(count) * SECTION_HEADER_SIZE;
    let table = offset
        .checked_add(table_len)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(Error::MissingSectionTable)?;

    let mut sections = Vec::with_capacity(count.into());
    for raw in table.chunks_exact(SECTION_HEADER_SIZE) {
        let header = RawSectionHeader::parse(raw).ok_or(Error::MissingSectionTable)?;
        sections.push(Section::from_raw(&header));
    }

    for s in &mut sections {
        trace!("{s:?}");
        if s.disk_size == 0 {
            continue;
        }
        let start = (s.disk_offset as usize).min(bytes.len());
        let end = start.saturating_add(s.disk_size as usize).min(bytes.len());
        if end - start < s.disk_size as usize {
            warn!(
                "section {} claims {:#x} bytes at {:#x}, only {:#x} available",
                s.name(),
                s.disk_size,
                s.disk_offset,
                end - start
            );
        }
        s.data = Some(bytes[start..end].to_vec());
    }
    debug!("parsed {} sections", sections.len());
    Ok(sections)
}

/// Assign file offsets to `sections` and produce their headers.
///
/// Sections with data are placed back to back starting at `headers_size`,
/// each padded to `disk_align`. Sections without data get no disk space.
///
/// # Errors
///
/// - [`Error::TooMuchData`] If the offsets overflow
pub(crate) fn plan_table(
    sections: &[Section],
    headers_size: u32,
    disk_align: u32,
) -> Result<Vec<RawSectionHeader>> {
    let mut next = headers_size;
    let mut headers = Vec::with_capacity(sections.len());
    for s in sections {
        let len: u32 = s
            .data()
            .map_or(0, <[u8]>::len)
            .try_into()
            .map_err(|_| Error::TooMuchData)?;
        let disk_size = align_up(len, disk_align).ok_or(Error::TooMuchData)?;
        let disk_offset = if disk_size == 0 { 0 } else { next };
        next = next.checked_add(disk_size).ok_or(Error::TooMuchData)?;
        headers.push(RawSectionHeader {
            name: s.name,
            mem_size: s.mem_size,
            mem_ptr: s.rva,
            disk_size,
            disk_offset,
            reloc_offset: 0,
            line_offset: 0,
            reloc_len: 0,
            lines_len: 0,
            attributes: s.flags,
        });
    }
    Ok(headers)
}

/// Write each section's data at the offset [`plan_table`] assigned it.
///
/// The image starts at `base` in `out`, which must already contain exactly
/// the headers.
pub(crate) fn write_data(
    sections: &[Section],
    headers: &[RawSectionHeader],
    out: &mut Vec<u8>,
    base: usize,
) {
    for (s, h) in sections.iter().zip(headers) {
        let (offset, size) = (h.disk_offset as usize, h.disk_size as usize);
        if size == 0 {
            continue;
        }
        debug_assert_eq!(out.len() - base, offset, "section data out of place");
        let start = out.len();
        out.extend_from_slice(s.data().unwrap_or_default());
        pad_to(out, start, size);
    }
}

/// Update the disk location of `sections` after writing
pub(crate) fn apply_table(sections: &mut [Section], headers: &[RawSectionHeader]) {
    for (s, h) in sections.iter_mut().zip(headers) {
        s.disk_offset = h.disk_offset;
        s.disk_size = h.disk_size;
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    #[test]
    fn name() -> anyhow::Result<()> {
        let mut s = Section::new(".text", 0x1000, 0x10, SectionFlags::CODE)?;
        assert_eq!(s.name(), ".text");
        assert_eq!(&s.raw_name(), b".text\0\0\0");

        s.set_name("12345678")?;
        assert_eq!(s.name(), "12345678");

        assert_eq!(s.set_name("123456789"), Err(Error::SectionNameTooLong));
        assert_eq!(s.name(), "12345678");
        assert!(matches!(
            Section::new(".toolongname", 0, 0, SectionFlags::empty()),
            Err(Error::SectionNameTooLong)
        ));
        Ok(())
    }

    #[test]
    fn contains() -> anyhow::Result<()> {
        let s = Section::new(".data", 0x1000, 0x200, SectionFlags::INITIALIZED)?;
        assert!(!s.contains(0xFFF));
        assert!(s.contains(0x1000));
        assert!(s.contains(0x11FF));
        assert!(!s.contains(0x1200));

        let empty = Section::new(".empty", 0x1000, 0, SectionFlags::INITIALIZED)?;
        assert!(!empty.contains(0x1000));
        Ok(())
    }

    #[test]
    fn plan() -> anyhow::Result<()> {
        let sections = [
            Section::with_data(".text", 0x1000, 0, SectionFlags::CODE, vec![0xCC; 0x201])?,
            Section::new(".bss", 0x2000, 0x1000, SectionFlags::UNINITIALIZED)?,
            Section::with_data(".data", 0x3000, 0, SectionFlags::INITIALIZED, vec![1; 3])?,
        ];
        let headers = plan_table(&sections, 0x400, 0x200)?;
        assert_eq!(
            headers
                .iter()
                .map(|h| (h.disk_offset, h.disk_size))
                .collect::<Vec<_>>(),
            [(0x400, 0x400), (0, 0), (0x800, 0x200)]
        );
        assert_eq!({ headers[0].mem_size }, 0x201);

        let mut out = vec![0; 0x400];
        write_data(&sections, &headers, &mut out, 0);
        assert_eq!(out.len(), 0xA00);
        assert_eq!(out[0x400], 0xCC);
        assert_eq!(out[0x601], 0);
        assert_eq!(&out[0x800..0x803], &[1, 1, 1]);
        Ok(())
    }

    #[test]
    fn parse_truncated() -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        RawSectionHeader {
            name: *b".data\0\0\0",
            mem_size: 0x100,
            mem_ptr: 0x1000,
            disk_size: 0x200,
            disk_offset: 0x40,
            reloc_offset: 0,
            line_offset: 0,
            reloc_len: 0,
            lines_len: 0,
            attributes: SectionFlags::INITIALIZED,
        }
        .write(&mut bytes);
        bytes.resize(0x50, 0xAB);

        let sections = parse_table(&bytes, 0, 1)?;
        assert_eq!(sections[0].name(), ".data");
        assert_eq!(sections[0].data().map(<[u8]>::len), Some(0x10));

        assert!(matches!(
            parse_table(&bytes, 0x30, 1),
            Err(Error::MissingSectionTable)
        ));
        Ok(())
    }
}
