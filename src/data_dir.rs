//! Data directories
//!
//! The exec header ends with a table of `(RVA, size)` pairs, the data
//! directories, each locating a table somewhere in the image.
//!
//! There are 16 standard entries, though files may declare fewer.
//! Only the import and export tables are understood by this crate,
//! the rest are kept as opaque envelopes.
use alloc::vec::Vec;
use core::fmt;

use log::{trace, warn};

use crate::internal::Reader;

/// Number of standard data directories
pub const DATA_DIRS: usize = 16;

/// Fixed size of the CLR runtime header
pub const CLR_HEADER_SIZE: u32 = 72;

/// Location and size of a table inside the image
///
/// A zero [`DataDir::rva`] means the table is absent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataDir {
    /// Virtual address to the data
    pub rva: u32,

    /// Size of the data in bytes
    pub size: u32,
}

impl DataDir {
    pub const fn new(rva: u32, size: u32) -> Self {
        Self { rva, size }
    }

    /// Whether the directory points anywhere
    pub const fn is_present(&self) -> bool {
        self.rva != 0
    }
}

/// Known tables/data directories
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataDirIdent {
    /// Export table
    Export,

    /// Import table
    Import,

    /// Resource table
    Resource,

    /// Exception table
    Exception,

    /// Certificate table
    Certificate,

    /// Base relocations table
    BaseReloc,

    /// Debug data
    Debug,

    /// Reserved, 0.
    Architecture,

    /// Global Ptr
    ///
    /// Address is the RVA to store in the register
    ///
    /// Size is always 0
    GlobalPtr,

    /// Thread Local Storage table
    ThreadLocalStorage,

    /// Load Config table
    LoadConfig,

    /// Bound Import table
    BoundImport,

    /// IAT table
    Iat,

    /// Delay Import Descriptor
    DelayImport,

    /// CLR Runtime header
    ///
    /// Size is always [`CLR_HEADER_SIZE`]
    ClrRuntime,

    /// Reserved, zero
    Reserved,
}

impl DataDirIdent {
    pub const ALL: [DataDirIdent; DATA_DIRS] = [
        DataDirIdent::Export,
        DataDirIdent::Import,
        DataDirIdent::Resource,
        DataDirIdent::Exception,
        DataDirIdent::Certificate,
        DataDirIdent::BaseReloc,
        DataDirIdent::Debug,
        DataDirIdent::Architecture,
        DataDirIdent::GlobalPtr,
        DataDirIdent::ThreadLocalStorage,
        DataDirIdent::LoadConfig,
        DataDirIdent::BoundImport,
        DataDirIdent::Iat,
        DataDirIdent::DelayImport,
        DataDirIdent::ClrRuntime,
        DataDirIdent::Reserved,
    ];

    /// Maps a known data directory to its index in the data directory array
    pub const fn index(&self) -> usize {
        *self as usize
    }
}

impl TryFrom<usize> for DataDirIdent {
    type Error = ();

    fn try_from(value: usize) -> core::result::Result<Self, ()> {
        Self::ALL.get(value).copied().ok_or(())
    }
}

impl fmt::Display for DataDirIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataDirIdent::Export => write!(f, "Export Table"),
            DataDirIdent::Import => write!(f, "Import Table"),
            DataDirIdent::Resource => write!(f, "Resource Table"),
            DataDirIdent::Exception => write!(f, "Exception Table"),
            DataDirIdent::Certificate => write!(f, "Certificate Table"),
            DataDirIdent::BaseReloc => write!(f, "Base Relocations Table"),
            DataDirIdent::Debug => write!(f, "Debug Data"),
            DataDirIdent::Architecture => write!(f, "Architecture"),
            DataDirIdent::GlobalPtr => write!(f, "Global Ptr"),
            DataDirIdent::ThreadLocalStorage => write!(f, "Thread Local Storage Table"),
            DataDirIdent::LoadConfig => write!(f, "Load Config Table"),
            DataDirIdent::BoundImport => write!(f, "Bound Import Table"),
            DataDirIdent::Iat => write!(f, "IAT"),
            DataDirIdent::DelayImport => write!(f, "Delay Import Descriptor"),
            DataDirIdent::ClrRuntime => write!(f, "CLR Runtime Header"),
            DataDirIdent::Reserved => write!(f, "Reserved"),
        }
    }
}

/// The full table of standard data directories
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataDirs([DataDir; DATA_DIRS]);

impl DataDirs {
    pub const fn new() -> Self {
        Self([DataDir::new(0, 0); DATA_DIRS])
    }

    pub const fn get(&self, id: DataDirIdent) -> DataDir {
        self.0[id.index()]
    }

    /// Set directory `id`, normalizing fixed sizes
    ///
    /// The architecture and reserved slots can't be set and stay zero.
    pub fn set(&mut self, id: DataDirIdent, dir: DataDir) {
        self.0[id.index()] = normalize(id, dir);
    }

    pub fn as_slice(&self) -> &[DataDir] {
        &self.0
    }
}

/// Apply the fixed-size rules for special slots
fn normalize(id: DataDirIdent, dir: DataDir) -> DataDir {
    if !dir.is_present() {
        return DataDir::default();
    }
    match id {
        DataDirIdent::Architecture | DataDirIdent::Reserved => DataDir::default(),
        DataDirIdent::GlobalPtr => DataDir::new(dir.rva, 0),
        DataDirIdent::ClrRuntime => DataDir::new(dir.rva, CLR_HEADER_SIZE),
        _ => dir,
    }
}

/// Public deserialization API
impl DataDirs {
    /// Parse `count` directory entries from `bytes`
    ///
    /// `count` is the number declared by the exec header.
    /// Missing or extra entries are tolerated. Entries past the 16th are
    /// skipped, and a declared count larger than `bytes` is clamped.
    ///
    /// A CLR runtime entry declaring less than [`CLR_HEADER_SIZE`] bytes is
    /// dropped.
    pub fn parse(count: u32, bytes: &[u8]) -> Self {
        let mut dirs = Self::new();
        let mut r = Reader::new(bytes);
        trace!("data directory count: {count}");
        let available = bytes.len() / 8;
        if (count as usize) > available {
            warn!("{count} data directories declared, only room for {available}");
        }
        let count = (count as usize).min(available).min(DATA_DIRS);

        for (i, id) in DataDirIdent::ALL.into_iter().take(count).enumerate() {
            let (Some(rva), Some(size)) = (r.u32(), r.u32()) else {
                break;
            };
            let dir = match id {
                DataDirIdent::ClrRuntime if rva != 0 && size < CLR_HEADER_SIZE => {
                    warn!("CLR runtime header size {size} is too small, ignoring");
                    DataDir::default()
                }
                _ => normalize(id, DataDir::new(rva, size)),
            };
            trace!("data directory {i} ({id}): {dir:x?}");
            dirs.0[i] = dir;
        }
        dirs
    }
}

/// Public serialization API
impl DataDirs {
    /// Write all 16 entries to `out`
    ///
    /// The count precedes them, as part of the exec header.
    pub fn write(&self, out: &mut Vec<u8>) {
        for (id, dir) in DataDirIdent::ALL.into_iter().zip(self.0) {
            let dir = normalize(id, dir);
            out.extend_from_slice(&dir.rva.to_le_bytes());
            out.extend_from_slice(&dir.size.to_le_bytes());
        }
    }

    /// Size in bytes of [`DataDirs::write`]
    pub const fn size_of() -> usize {
        DATA_DIRS * 8
    }
}

impl fmt::Debug for DataDirs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&crate::internal::debug::DataDirsHelper(&self.0), f)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn table(pairs: &[(u32, u32)]) -> Vec<u8> {
        let mut v = Vec::new();
        for (a, s) in pairs {
            v.extend_from_slice(&a.to_le_bytes());
            v.extend_from_slice(&s.to_le_bytes());
        }
        v
    }

    #[test]
    fn truncated_table() {
        let dirs = DataDirs::parse(2, &table(&[(0x1000, 0x28), (0x2000, 0x3C)]));
        assert_eq!(dirs.get(DataDirIdent::Export), DataDir::new(0x1000, 0x28));
        assert_eq!(dirs.get(DataDirIdent::Import), DataDir::new(0x2000, 0x3C));
        assert!(!dirs.get(DataDirIdent::Resource).is_present());

        // Count claims more than there is
        let dirs = DataDirs::parse(16, &table(&[(0x1000, 0x28)]));
        assert_eq!(dirs.get(DataDirIdent::Export), DataDir::new(0x1000, 0x28));
        assert_eq!(DataDirs::parse(16, &[]), DataDirs::new());

        // Count claims less than there is
        let dirs = DataDirs::parse(1, &table(&[(0x1000, 0x28), (0x2000, 0x3C)]));
        assert!(!dirs.get(DataDirIdent::Import).is_present());
    }

    #[test]
    fn fixed_sizes() {
        let mut pairs = vec![(0, 0); 17];
        pairs[7] = (0x7000, 8);
        pairs[8] = (0x8000, 8);
        pairs[14] = (0xE000, 0x100);
        pairs[16] = (0xFFFF, 0xFFFF);
        let dirs = DataDirs::parse(17, &table(&pairs));
        assert!(!dirs.get(DataDirIdent::Architecture).is_present());
        assert_eq!(dirs.get(DataDirIdent::GlobalPtr), DataDir::new(0x8000, 0));
        assert_eq!(
            dirs.get(DataDirIdent::ClrRuntime),
            DataDir::new(0xE000, CLR_HEADER_SIZE)
        );

        pairs[14] = (0xE000, 71);
        let dirs = DataDirs::parse(16, &table(&pairs[..16]));
        assert!(!dirs.get(DataDirIdent::ClrRuntime).is_present());
    }

    #[test]
    fn always_writes_16() {
        let mut dirs = DataDirs::new();
        dirs.set(DataDirIdent::Import, DataDir::new(0x2000, 0x28));
        dirs.set(DataDirIdent::Reserved, DataDir::new(0x9000, 0x10));
        let mut out = Vec::new();
        dirs.write(&mut out);
        assert_eq!(out.len(), DataDirs::size_of());

        let back = DataDirs::parse(16, &out);
        assert_eq!(back, dirs);
        assert!(!back.get(DataDirIdent::Reserved).is_present());
    }
}
