//! The flat root directory: a fixed array of entries
//! occupying exactly one block.

use super::fat::FAT_EOC;
use super::storage::{self, Block, BlockIO, BLOCK_SIZE};
use super::superblock::Superblock;
use super::{FsError, Result};
use packed_struct::prelude::*;
use std::fmt;
use tracing::trace;

/// Slots in the root directory.
pub const MAX_FILES: usize = 128;
/// Size of the on-disk name field, including the NUL terminator.
pub const FILENAME_LEN: usize = 16;

#[derive(PackedStruct, Debug)]
#[packed_struct(endian = "lsb")]
pub struct RawDirEntry {
    /// NUL terminated, all zero for a free slot
    pub filename: [u8; 16],
    pub file_size: u32,
    pub first_block: u16,
    pub padding: [u8; 10],
}

impl RawDirEntry {
    pub const SIZE: usize = 32;
}

/// An in-memory directory slot. A free slot has an empty name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: usize,
    pub first_block: u16,
}

impl Default for DirEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 0,
            first_block: FAT_EOC,
        }
    }
}

impl DirEntry {
    pub fn is_free(&self) -> bool {
        self.name.is_empty()
    }

    /// Decodes an on-disk slot. Names must be NUL terminated
    /// UTF-8, anything else would not survive a flush.
    fn from_raw(slot: usize, raw: &RawDirEntry) -> Result<Self> {
        let len = raw
            .filename
            .iter()
            .position(|&b| b == 0)
            .ok_or(FsError::CorruptEntry { slot })?;
        if len == 0 {
            return Ok(Self::default());
        }
        let name = std::str::from_utf8(&raw.filename[..len])
            .map_err(|_| FsError::CorruptEntry { slot })?;
        Ok(Self {
            name: name.to_owned(),
            size: raw.file_size as usize,
            first_block: raw.first_block,
        })
    }

    fn to_raw(&self) -> RawDirEntry {
        let mut filename = [0; FILENAME_LEN];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(FILENAME_LEN - 1);
        filename[..len].copy_from_slice(&bytes[..len]);
        RawDirEntry {
            filename,
            file_size: self.size as u32,
            first_block: self.first_block,
            padding: [0; 10],
        }
    }
}

impl fmt::Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file: {}, size: {}, data_blk: {}",
            self.name, self.size, self.first_block
        )
    }
}

/// Names must fit the on-disk field with room for the terminator.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= FILENAME_LEN || name.contains('\0') {
        return Err(FsError::InvalidName(name.to_owned()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RootDirectory {
    entries: Vec<DirEntry>,
}

impl RootDirectory {
    pub fn empty() -> Self {
        Self {
            entries: vec![DirEntry::default(); MAX_FILES],
        }
    }

    pub fn load(device: &mut impl BlockIO, superblock: &Superblock) -> Result<Self> {
        let mut block = [0; BLOCK_SIZE];
        storage::read_block(device, superblock.root_dir_index as usize, &mut block)?;
        let entries = block
            .chunks_exact(RawDirEntry::SIZE)
            .enumerate()
            .map(|(slot, raw)| -> Result<DirEntry> {
                DirEntry::from_raw(slot, &RawDirEntry::unpack_from_slice(raw)?)
            })
            .collect::<Result<Vec<_>>>()?;
        trace!(
            "Loaded root directory with {} files",
            entries.iter().filter(|e| !e.is_free()).count()
        );
        Ok(Self { entries })
    }

    pub fn flush(&self, device: &mut impl BlockIO, superblock: &Superblock) -> Result<()> {
        let mut block: Block = [0; BLOCK_SIZE];
        for (entry, dst) in self
            .entries
            .iter()
            .zip(block.chunks_exact_mut(RawDirEntry::SIZE))
        {
            entry.to_raw().pack_to_slice(dst)?;
        }
        storage::write_block(device, superblock.root_dir_index as usize, &block)
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.is_free() && e.name == name)
    }

    pub fn get(&self, slot: usize) -> &DirEntry {
        &self.entries[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut DirEntry {
        &mut self.entries[slot]
    }

    /// Takes the lowest free slot for an empty file named `name`.
    pub fn create(&mut self, name: &str) -> Result<usize> {
        validate_name(name)?;
        if self.find(name).is_some() {
            return Err(FsError::NameExists(name.to_owned()));
        }
        let slot = self
            .entries
            .iter()
            .position(DirEntry::is_free)
            .ok_or(FsError::DirectoryFull)?;
        self.entries[slot] = DirEntry {
            name: name.to_owned(),
            ..DirEntry::default()
        };
        Ok(slot)
    }

    /// Clears `slot`, returning the entry it held.
    pub fn remove(&mut self, slot: usize) -> DirEntry {
        std::mem::take(&mut self.entries[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| !e.is_free())
    }

    pub fn free_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_free()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::storage::mem::MemDisk;

    #[test]
    fn test_name_field_width() {
        assert_eq!(FILENAME_LEN, 16);
        let raw = DirEntry {
            name: "123456789012345".to_owned(),
            ..DirEntry::default()
        }
        .to_raw();
        assert_eq!(raw.filename.len(), FILENAME_LEN);
        assert_eq!(raw.filename[FILENAME_LEN - 1], 0);
    }

    #[test]
    fn test_name_limits() {
        assert!(validate_name("123456789012345").is_ok());
        assert!(matches!(
            validate_name("1234567890123456"),
            Err(FsError::InvalidName(_))
        ));
        assert!(validate_name("").is_err());
        assert!(validate_name("a\0b").is_err());
    }

    #[test]
    fn test_create_and_remove() {
        let mut root = RootDirectory::empty();
        assert_eq!(root.create("a").unwrap(), 0);
        assert_eq!(root.create("b").unwrap(), 1);
        assert!(matches!(root.create("a"), Err(FsError::NameExists(_))));
        let removed = root.remove(0);
        assert_eq!(removed.name, "a");
        assert_eq!(root.find("a"), None);
        // lowest free slot is reused
        assert_eq!(root.create("c").unwrap(), 0);
        assert_eq!(
            root.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            ["c", "b"]
        );
    }

    #[test]
    fn test_directory_full() {
        let mut root = RootDirectory::empty();
        for i in 0..MAX_FILES {
            root.create(&format!("file{i}")).unwrap();
        }
        assert_eq!(root.free_count(), 0);
        assert!(matches!(root.create("one_more"), Err(FsError::DirectoryFull)));
    }

    #[test]
    fn test_load_flush() {
        let superblock = Superblock::for_block_count(16).unwrap();
        let mut disk = MemDisk::new(16);
        let mut root = RootDirectory::empty();
        root.create("hello.txt").unwrap();
        let slot = root.create("123456789012345").unwrap();
        let entry = root.get_mut(slot);
        entry.size = 5000;
        entry.first_block = 3;
        root.flush(&mut disk, &superblock).unwrap();

        let block = disk.block(superblock.root_dir_index as usize);
        assert_eq!(&block[..10], b"hello.txt\0");
        // size then first block of slot 1
        assert_eq!(&block[48..54], &[0x88, 0x13, 0x00, 0x00, 0x03, 0x00]);

        let loaded = RootDirectory::load(&mut disk, &superblock).unwrap();
        assert_eq!(loaded.get(0).first_block, FAT_EOC);
        assert_eq!(loaded.get(1).name, "123456789012345");
        assert_eq!(loaded.get(1).size, 5000);
        assert_eq!(loaded.free_count(), MAX_FILES - 2);
    }

    fn load_with_name(name: &[u8; FILENAME_LEN]) -> Result<RootDirectory> {
        let superblock = Superblock::for_block_count(16).unwrap();
        let mut disk = MemDisk::new(16);
        let mut block = [0; BLOCK_SIZE];
        block[RawDirEntry::SIZE..RawDirEntry::SIZE + FILENAME_LEN].copy_from_slice(name);
        disk.set_block(superblock.root_dir_index as usize, &block);
        RootDirectory::load(&mut disk, &superblock)
    }

    #[test]
    fn test_load_rejects_unterminated_name() {
        assert!(matches!(
            load_with_name(b"ABCDEFGHIJKLMNOP"),
            Err(FsError::CorruptEntry { slot: 1 })
        ));
    }

    #[test]
    fn test_load_rejects_non_utf8_name() {
        assert!(matches!(
            load_with_name(b"ab\xff\xfe\0\0\0\0\0\0\0\0\0\0\0\0"),
            Err(FsError::CorruptEntry { slot: 1 })
        ));
    }

    #[test]
    fn test_loaded_names_survive_flush() {
        let superblock = Superblock::for_block_count(16).unwrap();
        let mut disk = MemDisk::new(16);
        let mut block = [0; BLOCK_SIZE];
        block[..FILENAME_LEN].copy_from_slice(b"123456789012345\0");
        disk.set_block(superblock.root_dir_index as usize, &block);

        let root = RootDirectory::load(&mut disk, &superblock).unwrap();
        assert_eq!(root.find("123456789012345"), Some(0));
        root.flush(&mut disk, &superblock).unwrap();
        let flushed = disk.block(superblock.root_dir_index as usize);
        assert_eq!(flushed[..FILENAME_LEN], block[..FILENAME_LEN]);
    }
}
