//! The Export Table
//!
//! A [`RawExportDirectory`] followed by three parallel tables.
//!
//! - The address table, one RVA per exported ordinal
//! - The ordinal table, `u16` indices into the address table
//! - The name table, RVAs of NUL terminated names
//!
//! The ordinal and name tables are parallel, and sorted by name with
//! [`compare_names`] so loaders can binary search them.
//!
//! Ordinals are biased by [`ExportTable::ordinal_base`], but the ordinal
//! table stores unbiased indices.
use alloc::{string::String, vec, vec::Vec};
use core::mem::size_of;

use log::{debug, trace, warn};

use crate::{
    data_dir::DataDir,
    error::{Error, Result},
    internal::{read_u16, read_u32},
    lexical::compare_names,
    raw::RawExportDirectory,
    rva::Addressing,
};

/// Size of a [`RawExportDirectory`] on disk
pub const DIRECTORY_SIZE: u32 = size_of::<RawExportDirectory>() as u32;

/// An exported symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExportSymbol {
    /// Exported by name, and ordinal
    Named { name: String, address: u32 },

    /// Exported by ordinal only
    Ordinal { address: u32 },
}

impl ExportSymbol {
    pub fn named(name: impl Into<String>, address: u32) -> Self {
        ExportSymbol::Named {
            name: name.into(),
            address,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            ExportSymbol::Named { name, .. } => Some(name),
            ExportSymbol::Ordinal { .. } => None,
        }
    }

    /// RVA of the symbol
    pub fn address(&self) -> u32 {
        match *self {
            ExportSymbol::Named { address, .. } | ExportSymbol::Ordinal { address } => address,
        }
    }
}

/// The export table of an image
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExportTable {
    /// Where the table starts in memory
    pub rva: u32,

    /// Reserved, 0
    pub flags: u32,

    pub timestamp: u32,

    /// Major and minor version
    pub version: (u16, u16),

    /// RVA of the image name
    ///
    /// Written through unchanged if [`ExportTable::image_name`]
    /// is [`None`]
    pub image_name_rva: u32,

    /// Name of the image, written into the string pool if set
    pub image_name: Option<String>,

    /// Ordinal of the first symbol
    pub ordinal_base: u32,

    /// Every exported symbol, indexed by ordinal minus
    /// [`ExportTable::ordinal_base`]
    pub symbols: Vec<ExportSymbol>,
}

impl Default for ExportTable {
    fn default() -> Self {
        Self {
            rva: 0,
            flags: 0,
            timestamp: 0,
            version: (0, 0),
            image_name_rva: 0,
            image_name: None,
            ordinal_base: 1,
            symbols: Vec::new(),
        }
    }
}

/// Public deserialization API
impl ExportTable {
    /// Read the export table at `rva`
    ///
    /// Returns [`None`] if the directory itself is unreadable.
    ///
    /// Declared table lengths are clamped to the bytes actually present.
    /// Names that don't resolve, or whose ordinal is out of range,
    /// leave their slot exported by ordinal only.
    pub fn parse(addressing: &Addressing, rva: u32) -> Option<Self> {
        let raw = RawExportDirectory::parse(addressing.bytes_at(rva, DIRECTORY_SIZE as usize))?;
        debug!("{raw:#x?}");

        let table = |at: u32, len: u32, width: usize| {
            let want = (len as usize).saturating_mul(width);
            let bytes = addressing.bytes_at(at, want);
            if bytes.len() < want {
                warn!("export table at {at:#x} declares {len} entries, only {} present", bytes.len() / width);
            }
            bytes
        };
        let addresses = table(raw.addresses_rva, raw.addresses_len, 4);
        let ordinals = table(raw.ordinals_rva, raw.names_len, 2);
        let names = table(raw.names_rva, raw.names_len, 4);

        let count = addresses.len() / 4;
        let address = |index: usize| read_u32(addresses, index * 4).unwrap_or_default();

        let mut slots: Vec<Option<ExportSymbol>> = vec![None; count];
        let named = (ordinals.len() / 2).min(names.len() / 4);
        for i in 0..named {
            let (Some(index), Some(name_rva)) = (read_u16(ordinals, i * 2), read_u32(names, i * 4))
            else {
                break;
            };
            let index = usize::from(index);
            let Some(slot) = slots.get_mut(index) else {
                warn!("export name {i} refers to ordinal index {index}, past {count}");
                continue;
            };
            let Some(name) = addressing.read_cstr_at(name_rva) else {
                warn!("export name at {name_rva:#x} is unreadable");
                continue;
            };
            trace!("export {name} at ordinal index {index}");
            if slot.is_none() {
                *slot = Some(ExportSymbol::Named {
                    name,
                    address: address(index),
                });
            }
        }

        let symbols = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or(ExportSymbol::Ordinal {
                    address: address(index),
                })
            })
            .collect();

        let image_name = match raw.name_rva {
            0 => None,
            at => addressing.read_cstr_at(at),
        };

        Some(Self {
            rva,
            flags: raw.flags,
            timestamp: raw.time,
            version: (raw.major_version, raw.minor_version),
            image_name_rva: raw.name_rva,
            image_name,
            ordinal_base: raw.ordinal_base,
            symbols,
        })
    }
}

/// Public API
impl ExportTable {
    /// Look up a symbol by name
    ///
    /// This is a linear scan. Use [`ExportTable::name_index`] for many
    /// lookups.
    pub fn by_name(&self, name: &str) -> Option<&ExportSymbol> {
        self.symbols.iter().find(|s| s.name() == Some(name))
    }

    /// Sorted index of the named symbols, for repeated lookups by name
    pub fn name_index(&self) -> NameIndex<'_> {
        NameIndex {
            table: self,
            sorted: self.sorted_names(),
        }
    }

    /// Look up a symbol by its biased ordinal
    pub fn by_ordinal(&self, ordinal: u32) -> Option<&ExportSymbol> {
        let index = ordinal.checked_sub(self.ordinal_base)?;
        self.symbols.get(index as usize)
    }

    /// Named symbols and their indices, in name table order
    fn sorted_names(&self) -> Vec<(&str, usize)> {
        let mut names: Vec<_> = self
            .symbols
            .iter()
            .enumerate()
            .filter_map(|(i, s)| Some((s.name()?, i)))
            .collect();
        names.sort_by(|a, b| compare_names(a.0, b.0));
        names
    }
}

/// Named symbols of an [`ExportTable`], in name table order
#[derive(Debug, Clone)]
pub struct NameIndex<'a> {
    table: &'a ExportTable,
    sorted: Vec<(&'a str, usize)>,
}

impl<'a> NameIndex<'a> {
    /// Binary search for `name`
    pub fn get(&self, name: &str) -> Option<&'a ExportSymbol> {
        let i = self
            .sorted
            .binary_search_by(|(n, _)| compare_names(n, name))
            .ok()?;
        self.table.symbols.get(self.sorted[i].1)
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}

/// Addresses of everything in an [`ExportTable`], computed before writing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportLayout {
    /// Start of the directory
    pub rva: u32,

    pub addresses_rva: u32,
    pub ordinals_rva: u32,
    pub names_rva: u32,

    /// Start of the string pool
    pub strings_rva: u32,

    /// Image name RVA to write
    pub image_name_rva: u32,

    /// Symbol index and name RVA of every named symbol, in sorted order
    pub named: Vec<(u16, u32)>,

    /// End of the table
    pub end_rva: u32,
}

impl ExportLayout {
    /// Location and size of the table, for the export data directory
    pub fn directory(&self) -> DataDir {
        DataDir::new(self.rva, self.size())
    }

    /// Total size in bytes
    pub fn size(&self) -> u32 {
        self.end_rva - self.rva
    }
}

/// Public serialization API
impl ExportTable {
    /// Compute where every part of the table will be written
    ///
    /// # Errors
    ///
    /// - [`Error::TooMuchData`] If a named symbol's index doesn't fit the
    ///   ordinal table, or the table doesn't fit in the address space
    pub fn layout(&self) -> Result<ExportLayout> {
        let overflow = |_| Error::TooMuchData;
        let add = |a: u32, b: u32| a.checked_add(b).ok_or(Error::TooMuchData);
        let mul = |a: usize, b: u32| -> Result<u32> {
            u32::try_from(a)
                .map_err(overflow)?
                .checked_mul(b)
                .ok_or(Error::TooMuchData)
        };

        let sorted = self.sorted_names();
        let addresses_rva = add(self.rva, DIRECTORY_SIZE)?;
        let ordinals_rva = add(addresses_rva, mul(self.symbols.len(), 4)?)?;
        let names_rva = add(ordinals_rva, mul(sorted.len(), 2)?)?;
        let strings_rva = add(names_rva, mul(sorted.len(), 4)?)?;

        let mut cursor = strings_rva;
        let mut named = Vec::with_capacity(sorted.len());
        for (name, index) in sorted {
            named.push((u16::try_from(index).map_err(overflow)?, cursor));
            cursor = add(cursor, add(u32::try_from(name.len()).map_err(overflow)?, 1)?)?;
        }

        let image_name_rva = match &self.image_name {
            Some(name) => {
                let at = cursor;
                cursor = add(cursor, add(u32::try_from(name.len()).map_err(overflow)?, 1)?)?;
                at
            }
            None => self.image_name_rva,
        };

        Ok(ExportLayout {
            rva: self.rva,
            addresses_rva,
            ordinals_rva,
            names_rva,
            strings_rva,
            image_name_rva,
            named,
            end_rva: add(cursor, 2)?,
        })
    }

    /// Write the table to `out`, according to `layout`
    ///
    /// `layout` must come from [`ExportTable::layout`] on this table.
    /// Exactly [`ExportLayout::size`] bytes are appended.
    pub fn write(&self, layout: &ExportLayout, out: &mut Vec<u8>) {
        let start = out.len();
        let at = |out: &Vec<u8>, rva: u32| {
            debug_assert_eq!(out.len() - start, (rva - layout.rva) as usize);
        };

        RawExportDirectory {
            flags: self.flags,
            time: self.timestamp,
            major_version: self.version.0,
            minor_version: self.version.1,
            name_rva: layout.image_name_rva,
            ordinal_base: self.ordinal_base,
            addresses_len: self.symbols.len() as u32,
            names_len: layout.named.len() as u32,
            addresses_rva: layout.addresses_rva,
            names_rva: layout.names_rva,
            ordinals_rva: layout.ordinals_rva,
        }
        .write(out);

        at(out, layout.addresses_rva);
        for sym in &self.symbols {
            out.extend_from_slice(&sym.address().to_le_bytes());
        }

        at(out, layout.ordinals_rva);
        for (index, _) in &layout.named {
            out.extend_from_slice(&index.to_le_bytes());
        }

        at(out, layout.names_rva);
        for (_, rva) in &layout.named {
            out.extend_from_slice(&rva.to_le_bytes());
        }

        at(out, layout.strings_rva);
        for (index, _) in &layout.named {
            let name = self.symbols[usize::from(*index)].name().unwrap_or_default();
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        if let Some(name) = &self.image_name {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(&[0, 0]);
        at(out, layout.end_rva);
    }

    /// Compute the layout and write the table, returning both
    pub fn to_bytes(&self) -> Result<(Vec<u8>, ExportLayout)> {
        let layout = self.layout()?;
        let mut out = Vec::with_capacity(layout.size() as usize);
        self.write(&layout, &mut out);
        Ok((out, layout))
    }
}

#[cfg(test)]
mod tests {
    use bstr::ByteSlice;

    use super::*;
    use crate::internal::test_util::{data_section, put};

    fn table(names: &[&str]) -> ExportTable {
        ExportTable {
            rva: 0x3000,
            symbols: names
                .iter()
                .zip(0x1000..)
                .map(|(n, a)| ExportSymbol::named(*n, a))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn pool_order() -> anyhow::Result<()> {
        let table = table(&["b_1", "A2", "_x", "a1"]);
        let (bytes, layout) = table.to_bytes()?;

        let pool = &bytes[(layout.strings_rva - layout.rva) as usize..];
        let names: Vec<_> = pool
            .split_str("\0")
            .filter(|s| !s.is_empty())
            .map(|s| s.to_str_lossy())
            .collect();
        insta::assert_snapshot!(names.join(" "), @"A2 _x a1 b_1");
        assert!(pool.ends_with(b"b_1\0\0\0"));

        // Ordinal table follows the sorted names, not declaration order
        let ordinals = &bytes[(layout.ordinals_rva - layout.rva) as usize..][..8];
        assert_eq!(ordinals, [1, 0, 2, 0, 3, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn layout_is_self_consistent() -> anyhow::Result<()> {
        let mut table = table(&["malloc", "GetProcAddress", "_errno"]);
        table.symbols.insert(1, ExportSymbol::Ordinal { address: 0x2222 });
        table.ordinal_base = 5;
        table.version = (1, 2);
        table.image_name = Some("runtime.dll".into());

        let (bytes, layout) = table.to_bytes()?;
        assert_eq!(bytes.len() as u32, layout.size());
        assert_eq!(layout.directory(), DataDir::new(0x3000, layout.size()));
        assert_eq!(layout.addresses_rva, 0x3000 + 40);
        assert_eq!(layout.ordinals_rva, layout.addresses_rva + 4 * 4);
        assert_eq!(layout.names_rva, layout.ordinals_rva + 3 * 2);
        assert_eq!(layout.strings_rva, layout.names_rva + 3 * 4);

        let raw = RawExportDirectory::parse(&bytes).unwrap();
        assert_eq!({ raw.addresses_rva }, layout.addresses_rva);
        assert_eq!({ raw.ordinals_rva }, layout.ordinals_rva);
        assert_eq!({ raw.names_rva }, layout.names_rva);
        assert_eq!({ raw.name_rva }, layout.image_name_rva);

        let at = |rva: u32| &bytes[(rva - layout.rva) as usize..];
        assert!(at(layout.image_name_rva).starts_with(b"runtime.dll\0"));
        for (index, rva) in &layout.named {
            let name = table.symbols[usize::from(*index)].name().unwrap();
            assert!(at(*rva).starts_with(name.as_bytes()));
        }

        let sections = [data_section(0x3000, bytes.clone())];
        let back = ExportTable::parse(&Addressing::new(&sections), 0x3000).unwrap();
        assert_eq!(back.symbols, table.symbols);
        assert_eq!(back.image_name, table.image_name);
        assert_eq!(back.image_name_rva, layout.image_name_rva);
        assert_eq!(back.ordinal_base, 5);
        assert_eq!(back.version, (1, 2));
        Ok(())
    }

    #[test]
    fn image_name_written_through() -> anyhow::Result<()> {
        let mut table = table(&["f"]);
        table.image_name_rva = 0x1234;
        let (bytes, layout) = table.to_bytes()?;
        assert_eq!(layout.image_name_rva, 0x1234);
        assert_eq!({ RawExportDirectory::parse(&bytes).unwrap().name_rva }, 0x1234);
        assert!(bytes.ends_with(b"f\0\0\0"));
        Ok(())
    }

    /// Directory at 0x1000 declaring 4 addresses, 2 names, with
    /// the names pointing at ordinal indices 3 and 0
    fn handmade() -> Vec<u8> {
        let mut d = Vec::new();
        let mut raw = Vec::new();
        RawExportDirectory {
            ordinal_base: 1,
            addresses_len: 4,
            names_len: 2,
            addresses_rva: 0x1100,
            names_rva: 0x1200,
            ordinals_rva: 0x1300,
            ..Default::default()
        }
        .write(&mut raw);
        put(&mut d, 0, &raw);
        for (i, a) in [0xA0u32, 0xA1, 0xA2, 0xA3].iter().enumerate() {
            put(&mut d, 0x100 + i * 4, &a.to_le_bytes());
        }
        put(&mut d, 0x200, &0x1400u32.to_le_bytes());
        put(&mut d, 0x204, &0x1410u32.to_le_bytes());
        put(&mut d, 0x300, &3u16.to_le_bytes());
        put(&mut d, 0x302, &0u16.to_le_bytes());
        put(&mut d, 0x400, b"Alpha\0");
        put(&mut d, 0x410, b"beta\0");
        d
    }

    #[test]
    fn unnamed_slots_are_ordinals() {
        let sections = [data_section(0x1000, handmade())];
        let table = ExportTable::parse(&Addressing::new(&sections), 0x1000).unwrap();
        assert_eq!(
            table.symbols,
            [
                ExportSymbol::named("beta", 0xA0),
                ExportSymbol::Ordinal { address: 0xA1 },
                ExportSymbol::Ordinal { address: 0xA2 },
                ExportSymbol::named("Alpha", 0xA3),
            ]
        );
        assert_eq!(table.image_name, None);

        assert_eq!(table.by_name("Alpha"), Some(&ExportSymbol::named("Alpha", 0xA3)));
        assert_eq!(table.by_name("beta").map(ExportSymbol::address), Some(0xA0));
        assert_eq!(table.by_name("gamma"), None);
        assert_eq!(table.by_ordinal(1).map(ExportSymbol::address), Some(0xA0));
        assert_eq!(table.by_ordinal(3).map(ExportSymbol::address), Some(0xA2));
        assert_eq!(table.by_ordinal(0), None);
        assert_eq!(table.by_ordinal(5), None);
    }

    #[test]
    fn name_index_matches_scan() {
        let names = ["zeta", "Alpha", "_init", "v10", "v2", "alpha", "Beta"];
        let mut table = ExportTable {
            symbols: names
                .iter()
                .zip(0x100..)
                .map(|(name, address)| ExportSymbol::named(*name, address))
                .collect(),
            ..Default::default()
        };
        table.symbols.insert(2, ExportSymbol::Ordinal { address: 0x50 });

        let index = table.name_index();
        assert_eq!(index.len(), names.len());
        for name in names {
            assert_eq!(index.get(name), table.by_name(name));
            assert!(index.get(name).is_some());
        }
        assert_eq!(index.get("missing"), None);
        assert_eq!(index.get("v1"), None);
    }

    #[test]
    fn hostile_lengths_are_clamped() {
        let mut d = handmade();
        // Claim far more addresses and names than exist
        put(&mut d, 20, &u32::MAX.to_le_bytes());
        put(&mut d, 24, &u32::MAX.to_le_bytes());
        // Ordinal index past the address table
        d.truncate(0x410);
        let sections = [data_section(0x1000, d)];
        let table = ExportTable::parse(&Addressing::new(&sections), 0x1000).unwrap();

        // The address table runs to the end of the section data
        assert_eq!(table.symbols.len(), (0x410 - 0x100) / 4);
        assert_eq!(table.symbols[3], ExportSymbol::named("Alpha", 0xA3));

        // Not enough left for a directory
        assert!(ExportTable::parse(&Addressing::new(&sections), 0x1400).is_none());
        assert!(ExportTable::parse(&Addressing::new(&sections), 0x5000).is_none());
    }

    #[test]
    fn index_past_ordinal_table() {
        let table = ExportTable {
            symbols: (0..=u32::from(u16::MAX) + 1)
                .map(|a| match a {
                    0x10000 => ExportSymbol::named("late", a),
                    _ => ExportSymbol::Ordinal { address: a },
                })
                .collect(),
            ..Default::default()
        };
        assert_eq!(table.layout(), Err(Error::TooMuchData));
    }

    #[test]
    fn fuzz_parse() {
        bolero::check!()
            .with_type::<(Vec<u8>, u8)>()
            .for_each(|(data, rva)| {
                let sections = [data_section(0x1000, data.clone())];
                let _ = ExportTable::parse(&Addressing::new(&sections), 0x1000 + u32::from(*rva));
            });
    }
}
