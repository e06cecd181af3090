//! Internal helpers
//!
//! Little-endian byte access, alignment, and [`fmt::Debug`] helpers.
use core::fmt;

/// Read `N` bytes at `offset`, or [`None`] if `offset + N` is past the end.
#[inline]
pub(crate) fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    bytes.get(offset..end)?.try_into().ok()
}

#[inline]
pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    read_array(bytes, offset).map(u16::from_le_bytes)
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    read_array(bytes, offset).map(u32::from_le_bytes)
}

#[inline]
pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    read_array(bytes, offset).map(u64::from_le_bytes)
}

/// Round `value` up to a multiple of `align`.
///
/// An `align` of zero leaves `value` unchanged.
/// Returns [`None`] on overflow.
#[inline]
pub(crate) const fn align_up(value: u32, align: u32) -> Option<u32> {
    if align == 0 {
        return Some(value);
    }
    match value % align {
        0 => Some(value),
        rem => value.checked_add(align - rem),
    }
}

/// Zero-pad `out` until its length is a multiple of `align`, counted from
/// `start`.
pub(crate) fn pad_to(out: &mut alloc::vec::Vec<u8>, start: usize, align: usize) {
    if align == 0 {
        return;
    }
    let len = out.len() - start;
    let rem = len % align;
    if rem != 0 {
        out.resize(out.len() + (align - rem), 0);
    }
}

/// Sequential little-endian reader over a byte slice.
///
/// Every read is bounds checked and returns [`None`] past the end,
/// leaving the position unchanged.
#[derive(Debug, Clone)]
pub(crate) struct Reader<'data> {
    bytes: &'data [u8],
    pos: usize,
}

impl<'data> Reader<'data> {
    pub const fn new(bytes: &'data [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let v = read_array::<N>(self.bytes, self.pos)?;
        self.pos += N;
        Some(v)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|[b]| b)
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_le_bytes)
    }
}

pub(crate) mod debug {
    use super::*;
    use crate::data_dir::{DataDir, DataDirIdent};

    /// Prints only the present data directories, by name
    pub struct DataDirsHelper<'data>(pub &'data [DataDir]);

    impl<'data> fmt::Debug for DataDirsHelper<'data> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            struct Name(DataDirIdent);
            impl fmt::Debug for Name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            let mut m = f.debug_map();
            for (i, dir) in self.0.iter().enumerate() {
                if !dir.is_present() {
                    continue;
                }
                match DataDirIdent::try_from(i) {
                    Ok(id) => m.entry(&Name(id), dir),
                    Err(()) => m.entry(&i, dir),
                };
            }
            m.finish()
        }
    }

    /// Prints a NUL padded name as a string, falling back to bytes
    pub struct NameHelper<'data>(pub &'data [u8]);

    impl<'data> fmt::Debug for NameHelper<'data> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
            fmt::Debug::fmt(bstr::BStr::new(&self.0[..end]), f)
        }
    }
}

#[cfg(test)]
pub mod test_util {
    //! Synthetic images for tests
    use alloc::vec::Vec;

    use crate::{section::Section, SectionFlags};

    /// A read-only data section at `rva` owning `data`, sized to it.
    pub fn data_section(rva: u32, data: Vec<u8>) -> Section {
        let flags = SectionFlags::INITIALIZED | SectionFlags::READ;
        Section::with_data(".rdata", rva, 0, flags, data).unwrap()
    }

    /// Write `bytes` into `buf` at `offset`, growing it as needed.
    pub fn put(buf: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
        if buf.len() < offset + bytes.len() {
            buf.resize(offset + bytes.len(), 0);
        }
        buf[offset..][..bytes.len()].copy_from_slice(bytes);
    }
}
