//! The Import Table
//!
//! The import directory is an array of [`RawImportDescriptor`], one per
//! library, terminated by a zeroed descriptor.
//! Each points to a lookup table of 4 byte (PE32) or 8 byte (PE32+)
//! entries, terminated by a zero entry, and an address table with identical
//! contents that the loader overwrites with resolved addresses.
//!
//! Lookup entries with the high bit set import by ordinal, in the low 16 bits.
//! Otherwise the low 31 bits are the RVA of a hint/name record,
//! a `u16` hint followed by a NUL terminated name.
//!
//! # Layout
//!
//! When written, the table is laid out contiguously starting at
//! [`ImportTable::rva`]:
//!
//! - Descriptors, including the terminator
//! - Every library's lookup table, back to back
//! - Every library's address table, back to back
//! - Padding to 4 bytes
//! - Library names, each NUL terminated and padded to 4 bytes
//! - Hint/name records, each padded to 4 bytes
//!
//! [`ImportTable::layout`] computes every address up front,
//! and [`ImportTable::write`] emits bytes according to it.
use alloc::{string::String, vec::Vec};
use core::mem::size_of;

use log::{debug, trace, warn};

use crate::{
    data_dir::DataDir,
    error::{Error, Result},
    internal::{align_up, pad_to},
    raw::RawImportDescriptor,
    rva::Addressing,
};

/// Size of a [`RawImportDescriptor`] on disk
pub const DESCRIPTOR_SIZE: u32 = size_of::<RawImportDescriptor>() as u32;

/// Ordinal flag for PE32 lookup entries
const ORDINAL_FLAG_32: u64 = 1 << 31;

/// Ordinal flag for PE32+ lookup entries
const ORDINAL_FLAG_64: u64 = 1 << 63;

/// Hint/name RVAs are limited to 31 bits
const NAME_RVA_MASK: u64 = 0x7FFF_FFFF;

/// Alignment of the string pool and each entry in it
const POOL_ALIGN: u32 = 4;

/// An imported symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImportSymbol {
    /// Import by ordinal
    Ordinal(u16),

    /// Import by name
    Name {
        /// Index into the exporting library's name table to try first
        hint: u16,

        /// [`None`] if the name couldn't be read
        name: Option<String>,
    },
}

impl ImportSymbol {
    /// Import `name`, with a hint of zero
    pub fn by_name(name: impl Into<String>) -> Self {
        ImportSymbol::Name {
            hint: 0,
            name: Some(name.into()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            ImportSymbol::Ordinal(_) => None,
            ImportSymbol::Name { name, .. } => name.as_deref(),
        }
    }
}

/// A library and the symbols imported from it, in lookup table order
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Library {
    /// [`None`] if the name couldn't be read
    pub name: Option<String>,

    pub symbols: Vec<ImportSymbol>,
}

impl Library {
    pub fn new(name: impl Into<String>, symbols: Vec<ImportSymbol>) -> Self {
        Self {
            name: Some(name.into()),
            symbols,
        }
    }
}

/// The import table of an image
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct ImportTable {
    /// Where the table starts in memory
    pub rva: u32,

    /// Whether lookup entries are 8 bytes, PE32+, or 4 bytes, PE32
    pub plus: bool,

    pub libraries: Vec<Library>,
}

/// Public deserialization API
impl ImportTable {
    /// Read the import table at `rva`
    ///
    /// Reading stops at the terminating descriptor, or wherever the
    /// descriptors stop being readable. Names and lookup entries that don't
    /// resolve are skipped or [`None`].
    ///
    /// Lookup entries and names decoded across all libraries never add up to
    /// more bytes than the sections own. Tables that overlap past that point
    /// are cut short.
    pub fn parse(addressing: &Addressing, rva: u32, plus: bool) -> Self {
        let mut libraries = Vec::new();
        let mut budget = Budget(addressing.owned_len());
        let mut at = rva;
        loop {
            let Some(desc) = RawImportDescriptor::parse(addressing.bytes_at(at, DESCRIPTOR_SIZE as usize))
            else {
                warn!("import descriptor at {at:#x} is unreadable");
                break;
            };
            if desc.is_null() {
                break;
            }
            trace!("{desc:x?}");
            libraries.push(Self::parse_library(addressing, &desc, plus, &mut budget));
            if budget.0 == 0 {
                warn!("import table at {rva:#x} decodes to more than the image holds");
                break;
            }
            let Some(next) = at.checked_add(DESCRIPTOR_SIZE) else {
                break;
            };
            at = next;
        }
        debug!("parsed {} imported libraries", libraries.len());
        Self {
            rva,
            plus,
            libraries,
        }
    }

    fn parse_library(
        addressing: &Addressing,
        desc: &RawImportDescriptor,
        plus: bool,
        budget: &mut Budget,
    ) -> Library {
        let name = addressing
            .read_cstr_at(desc.name_rva)
            .filter(|name| budget.take(name.len()));
        if name.is_none() {
            warn!("import library name at {:#x} is unreadable", { desc.name_rva });
        }

        // Old binders may only provide the address table
        let table = match desc.lookup_rva {
            0 => desc.iat_rva,
            rva => rva,
        };
        let width: u32 = if plus { 8 } else { 4 };

        let mut symbols = Vec::new();
        let mut at = table;
        loop {
            let entry = if plus {
                addressing.read_u64_at(at)
            } else {
                addressing.read_u32_at(at).map(u64::from)
            };
            let Some(entry) = entry else {
                warn!("import lookup table for {name:?} ends without a terminator at {at:#x}");
                break;
            };
            if entry == 0 {
                break;
            }
            if !budget.take(width as usize) {
                break;
            }
            symbols.push(Self::parse_entry(addressing, entry, plus, budget));
            let Some(next) = at.checked_add(width) else {
                break;
            };
            at = next;
        }
        Library { name, symbols }
    }

    /// Decode a single lookup table entry
    fn parse_entry(addressing: &Addressing, entry: u64, plus: bool, budget: &mut Budget) -> ImportSymbol {
        let flag = if plus {
            ORDINAL_FLAG_64
        } else {
            ORDINAL_FLAG_32
        };
        if entry & flag != 0 {
            return ImportSymbol::Ordinal(entry as u16);
        }
        let rva = (entry & NAME_RVA_MASK) as u32;
        ImportSymbol::Name {
            hint: addressing.read_u16_at(rva).unwrap_or_default(),
            name: rva
                .checked_add(2)
                .and_then(|name| addressing.read_cstr_at(name))
                .filter(|name| budget.take(name.len())),
        }
    }
}

/// Bytes left to decode
struct Budget(usize);

impl Budget {
    /// Take `n` bytes, or empty the budget and return false if there aren't
    /// enough left
    fn take(&mut self, n: usize) -> bool {
        match self.0.checked_sub(n) {
            Some(left) => {
                self.0 = left;
                true
            }
            None => {
                self.0 = 0;
                false
            }
        }
    }
}

/// Addresses of everything in an [`ImportTable`], computed before writing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportLayout {
    /// Start of the descriptors
    pub rva: u32,

    /// Every descriptor, excluding the terminator
    pub descriptors: Vec<RawImportDescriptor>,

    /// Start of the first lookup table
    pub lookup_rva: u32,

    /// Start of the first address table
    pub iat_rva: u32,

    /// Total size of all lookup tables, which is also the size of all
    /// address tables
    pub thunks_size: u32,

    /// Contents of the lookup tables, including terminators
    pub entries: Vec<u64>,

    /// Start of the library names
    pub names_rva: u32,

    /// Start of the hint/name records
    pub hints_rva: u32,

    /// End of the table
    pub end_rva: u32,

    /// Whether entries are 8 bytes
    pub plus: bool,
}

impl ImportLayout {
    /// Location and size of the descriptors, for the import data directory
    pub fn directory(&self) -> DataDir {
        let count = self.descriptors.len() as u32 + 1;
        DataDir::new(self.rva, count * DESCRIPTOR_SIZE)
    }

    /// Location and size of the address tables, for the IAT data directory
    pub fn iat(&self) -> DataDir {
        DataDir::new(self.iat_rva, self.thunks_size)
    }

    /// Total size in bytes
    pub fn size(&self) -> u32 {
        self.end_rva - self.rva
    }
}

/// Public serialization API
impl ImportTable {
    /// Compute where every part of the table will be written
    ///
    /// # Errors
    ///
    /// - [`Error::TooMuchData`] If the table doesn't fit in the address
    ///   space, or a hint/name record lands above 31 bits
    pub fn layout(&self) -> Result<ImportLayout> {
        let overflow = |_| Error::TooMuchData;
        let width: u32 = if self.plus { 8 } else { 4 };
        let libraries: u32 = self.libraries.len().try_into().map_err(overflow)?;

        let descriptors_size = libraries
            .checked_add(1)
            .and_then(|n| n.checked_mul(DESCRIPTOR_SIZE))
            .ok_or(Error::TooMuchData)?;
        let mut slots: u32 = 0;
        for lib in &self.libraries {
            let n: u32 = lib.symbols.len().try_into().map_err(overflow)?;
            slots = slots
                .checked_add(n)
                .and_then(|s| s.checked_add(1))
                .ok_or(Error::TooMuchData)?;
        }
        let thunks_size = slots.checked_mul(width).ok_or(Error::TooMuchData)?;

        let add = |a: u32, b: u32| a.checked_add(b).ok_or(Error::TooMuchData);
        let pad = |a: u32| align_up(a, POOL_ALIGN).ok_or(Error::TooMuchData);
        let len = |s: &Option<String>| -> Result<u32> {
            s.as_deref()
                .map_or(0, str::len)
                .try_into()
                .map_err(overflow)
        };

        let lookup_rva = add(self.rva, descriptors_size)?;
        let iat_rva = add(lookup_rva, thunks_size)?;
        let names_rva = pad(add(iat_rva, thunks_size)?)?;

        let mut cursor = names_rva;
        let mut name_rvas = Vec::with_capacity(self.libraries.len());
        for lib in &self.libraries {
            name_rvas.push(cursor);
            cursor = pad(add(add(cursor, len(&lib.name)?)?, 1)?)?;
        }

        let hints_rva = cursor;
        let flag = if self.plus {
            ORDINAL_FLAG_64
        } else {
            ORDINAL_FLAG_32
        };
        let mut entries = Vec::with_capacity(slots as usize);
        let mut descriptors = Vec::with_capacity(self.libraries.len());
        let mut thunk = 0;
        for (lib, name_rva) in self.libraries.iter().zip(name_rvas) {
            descriptors.push(RawImportDescriptor {
                lookup_rva: add(lookup_rva, thunk)?,
                time: 0,
                forwarder: 0,
                name_rva,
                iat_rva: add(iat_rva, thunk)?,
            });
            for sym in &lib.symbols {
                let entry = match sym {
                    ImportSymbol::Ordinal(ordinal) => flag | u64::from(*ordinal),
                    ImportSymbol::Name { name, .. } => {
                        let at = u64::from(cursor);
                        if at > NAME_RVA_MASK {
                            return Err(Error::TooMuchData);
                        }
                        cursor = pad(add(add(cursor, 2)?, add(len(name)?, 1)?)?)?;
                        at
                    }
                };
                entries.push(entry);
            }
            entries.push(0);
            thunk += (lib.symbols.len() as u32 + 1) * width;
        }

        Ok(ImportLayout {
            rva: self.rva,
            descriptors,
            lookup_rva,
            iat_rva,
            thunks_size,
            entries,
            names_rva,
            hints_rva,
            end_rva: cursor,
            plus: self.plus,
        })
    }

    /// Write the table to `out`, according to `layout`
    ///
    /// `layout` must come from [`ImportTable::layout`] on this table.
    /// Exactly [`ImportLayout::size`] bytes are appended.
    pub fn write(&self, layout: &ImportLayout, out: &mut Vec<u8>) {
        let start = out.len();
        let at = |out: &Vec<u8>, rva: u32| {
            debug_assert_eq!(out.len() - start, (rva - layout.rva) as usize);
        };

        for desc in &layout.descriptors {
            desc.write(out);
        }
        RawImportDescriptor::default().write(out);

        // The address table is identical to the lookup table until bound
        for table in [layout.lookup_rva, layout.iat_rva] {
            at(out, table);
            for &entry in &layout.entries {
                if layout.plus {
                    out.extend_from_slice(&entry.to_le_bytes());
                } else {
                    out.extend_from_slice(&(entry as u32).to_le_bytes());
                }
            }
        }

        pad_to(out, start, POOL_ALIGN as usize);
        at(out, layout.names_rva);
        for lib in &self.libraries {
            out.extend_from_slice(lib.name.as_deref().unwrap_or_default().as_bytes());
            out.push(0);
            pad_to(out, start, POOL_ALIGN as usize);
        }

        at(out, layout.hints_rva);
        for sym in self.libraries.iter().flat_map(|l| &l.symbols) {
            if let ImportSymbol::Name { hint, name } = sym {
                out.extend_from_slice(&hint.to_le_bytes());
                out.extend_from_slice(name.as_deref().unwrap_or_default().as_bytes());
                out.push(0);
                pad_to(out, start, POOL_ALIGN as usize);
            }
        }
        at(out, layout.end_rva);
    }

    /// Compute the layout and write the table, returning both
    pub fn to_bytes(&self) -> Result<(Vec<u8>, ImportLayout)> {
        let layout = self.layout()?;
        let mut out = Vec::with_capacity(layout.size() as usize);
        self.write(&layout, &mut out);
        Ok((out, layout))
    }
}
