//! RVA addressing
//!
//! Relative virtual addresses are offsets from the image base in memory.
//! [`Addressing`] maps them back to the bytes owned by a [`Section`].
//!
//! None of these fail loudly. An address that lands outside every section,
//! or past the end of a section's owned bytes, reads as [`None`] or an
//! empty slice, so that tables in damaged images can still be partially
//! read.
//!
//! All reads use an exclusive end and are clamped to the owned bytes, never
//! to the section's declared memory size.
use alloc::string::String;

use bstr::ByteSlice;

use crate::{
    internal::{read_u16, read_u32, read_u64},
    section::Section,
};

/// Resolves RVAs against a set of sections
#[derive(Debug, Clone, Copy)]
pub struct Addressing<'data> {
    sections: &'data [Section],
}

impl<'data> Addressing<'data> {
    pub const fn new(sections: &'data [Section]) -> Self {
        Self { sections }
    }

    /// Total number of bytes owned by every section
    pub fn owned_len(&self) -> usize {
        self.sections
            .iter()
            .filter_map(Section::data)
            .map(<[u8]>::len)
            .sum()
    }

    /// Find the section containing `rva`, and the offset of `rva` in it
    ///
    /// A section covers `[rva, rva + mem_size)`.
    pub fn resolve(&self, rva: u32) -> Option<(&'data Section, u32)> {
        self.sections
            .iter()
            .find(|s| s.contains(rva))
            .map(|s| (s, rva - s.rva()))
    }

    /// Owned bytes of the section from `rva` to the end of its data
    fn tail(&self, rva: u32) -> Option<&'data [u8]> {
        let (section, offset) = self.resolve(rva)?;
        section.data()?.get(offset as usize..)
    }

    /// Up to `len` bytes at `rva`
    ///
    /// Shorter than `len` if the section's data ends first,
    /// and empty if `rva` doesn't resolve.
    pub fn bytes_at(&self, rva: u32, len: usize) -> &'data [u8] {
        let tail = self.tail(rva).unwrap_or_default();
        &tail[..len.min(tail.len())]
    }

    pub fn read_u16_at(&self, rva: u32) -> Option<u16> {
        read_u16(self.tail(rva)?, 0)
    }

    pub fn read_u32_at(&self, rva: u32) -> Option<u32> {
        read_u32(self.tail(rva)?, 0)
    }

    pub fn read_u64_at(&self, rva: u32) -> Option<u64> {
        read_u64(self.tail(rva)?, 0)
    }

    /// NUL terminated string at `rva`
    ///
    /// Stops at the end of the section's data if there is no NUL.
    /// Invalid UTF-8 is replaced.
    pub fn read_cstr_at(&self, rva: u32) -> Option<String> {
        let tail = self.tail(rva)?;
        let end = tail.find_byte(0).unwrap_or(tail.len());
        Some(tail[..end].to_str_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use alloc::{vec, vec::Vec};

    use super::*;
    use crate::{internal::test_util::data_section, SectionFlags};

    fn sections() -> Vec<Section> {
        let mut first = data_section(0x1000, (0..=0xFF).collect());
        first.set_mem_size(0x200);
        let second = data_section(0x2000, vec![0; 0x100]);
        vec![first, second]
    }

    #[test]
    fn resolve() {
        let sections = sections();
        let a = Addressing::new(&sections);

        let (s, off) = a.resolve(0x10FF).unwrap();
        assert_eq!(s.rva(), 0x1000);
        assert_eq!(off, 0xFF);

        // End of the first section is exclusive
        assert!(a.resolve(0x1200).is_none());

        // Gap between sections
        assert!(a.resolve(0x1500).is_none());

        assert_eq!(a.resolve(0x2000).map(|(s, o)| (s.rva(), o)), Some((0x2000, 0)));
        assert!(a.resolve(0).is_none());
        assert!(a.resolve(u32::MAX).is_none());
    }

    #[test]
    fn owned_len() {
        let mut sections = sections();
        sections.push(Section::new(".bss", 0x3000, 0x1000, SectionFlags::UNINITIALIZED).unwrap());
        assert_eq!(Addressing::new(&sections).owned_len(), 0x200);
        assert_eq!(Addressing::new(&[]).owned_len(), 0);
    }

    #[test]
    fn reads_never_overrun() {
        let sections = sections();
        let a = Addressing::new(&sections);

        // Owned data is 0x100 bytes, though the section is 0x200 in memory
        assert_eq!(a.bytes_at(0x10FC, 16), &[0xFC, 0xFD, 0xFE, 0xFF]);
        assert_eq!(a.read_u32_at(0x10FC), Some(0xFFFEFDFC));
        assert_eq!(a.read_u32_at(0x10FD), None);
        assert_eq!(a.read_u16_at(0x10FE), Some(0xFFFE));
        assert_eq!(a.read_u16_at(0x10FF), None);
        assert_eq!(a.read_u64_at(0x10F8), Some(0xFFFEFDFCFBFAF9F8));

        // In memory, but not backed by data
        assert!(a.bytes_at(0x1100, 1).is_empty());
        assert_eq!(a.read_u16_at(0x1100), None);

        assert!(a.bytes_at(0x1500, 4).is_empty());
        assert_eq!(a.bytes_at(0x1000, usize::MAX).len(), 0x100);
    }

    #[test]
    fn strings() -> anyhow::Result<()> {
        let data = b"KERNEL32.dll\0bad\xFFutf8\0unterminated".to_vec();
        let sections = [Section::with_data(
            ".idata",
            0x3000,
            0x1000,
            SectionFlags::INITIALIZED,
            data,
        )?];
        let a = Addressing::new(&sections);

        assert_eq!(a.read_cstr_at(0x3000).as_deref(), Some("KERNEL32.dll"));
        assert_eq!(a.read_cstr_at(0x3006).as_deref(), Some("32.dll"));
        assert_eq!(a.read_cstr_at(0x300D).as_deref(), Some("bad\u{FFFD}utf8"));
        assert_eq!(a.read_cstr_at(0x3016).as_deref(), Some("unterminated"));
        assert_eq!(a.read_cstr_at(0x3800), None);
        assert_eq!(a.read_cstr_at(0x5000), None);
        Ok(())
    }

    #[test]
    fn fuzz_addressing() {
        bolero::check!()
            .with_type::<(Vec<u8>, u32, u32, u16)>()
            .for_each(|(data, base, rva, len)| {
                let sections = [data_section(*base, data.clone())];
                let a = Addressing::new(&sections);
                let bytes = a.bytes_at(*rva, (*len).into());
                assert!(bytes.len() <= usize::from(*len));
                let _ = a.read_u64_at(*rva);
                let _ = a.read_cstr_at(*rva);
            });
    }
}
