//! Block 0 of every volume. All five geometry fields
//! are derivable from the device's block count and
//! are only stored so mount can cross-check them.

use super::storage::{self, Block, BlockIO, BLOCK_SIZE};
use super::{FsError, Result};
use packed_struct::prelude::*;
use tracing::debug;

/// FAT entries that fit in a single block.
pub const FAT_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / 2;

#[derive(PackedStruct, Debug, Clone, Copy, PartialEq, Eq)]
#[packed_struct(endian = "lsb")]
pub struct Superblock {
    /// Always [`Superblock::SIGNATURE`]
    pub signature: [u8; 8],
    pub total_blocks: u16,
    pub root_dir_index: u16,
    pub data_start: u16,
    pub data_blocks: u16,
    pub fat_blocks: u8,
}

impl Superblock {
    /// Packed size, the rest of block 0 is zero padding.
    pub const SIZE: usize = 17;
    pub const SIGNATURE: &'static [u8; 8] = b"ECS150FS";

    /// Computes the only valid layout for a device of
    /// `total_blocks` blocks, if there is one.
    pub fn for_block_count(total_blocks: usize) -> Option<Self> {
        if total_blocks < 3 || total_blocks > u16::MAX as usize {
            return None;
        }
        // smallest FAT that can describe the rest of the disk
        let fat_blocks = (total_blocks - 2).div_ceil(FAT_ENTRIES_PER_BLOCK + 1);
        let data_blocks = total_blocks.checked_sub(2 + fat_blocks)?;
        if data_blocks == 0
            || fat_blocks > u8::MAX as usize
            || data_blocks.div_ceil(FAT_ENTRIES_PER_BLOCK) != fat_blocks
        {
            return None;
        }
        Some(Self {
            signature: *Self::SIGNATURE,
            total_blocks: total_blocks as u16,
            root_dir_index: fat_blocks as u16 + 1,
            data_start: fat_blocks as u16 + 2,
            data_blocks: data_blocks as u16,
            fat_blocks: fat_blocks as u8,
        })
    }

    /// Reads block 0 and checks it against the geometry
    /// the device's block count dictates.
    pub fn load(device: &mut impl BlockIO) -> Result<Self> {
        if device.block_size() != BLOCK_SIZE {
            debug!(
                "Device block size {} is not {}",
                device.block_size(),
                BLOCK_SIZE
            );
            return Err(FsError::InvalidGeometry);
        }
        let mut block = [0; BLOCK_SIZE];
        storage::read_block(device, 0, &mut block)?;
        let superblock = Self::unpack_from_slice(&block[..Self::SIZE])?;
        if &superblock.signature != Self::SIGNATURE {
            return Err(FsError::BadSignature);
        }
        let expected = Self::for_block_count(device.block_count()).ok_or_else(|| {
            debug!(
                "No valid geometry exists for {} blocks",
                device.block_count()
            );
            FsError::InvalidGeometry
        })?;
        if superblock != expected {
            debug!("On-disk superblock {superblock:?} does not match expected {expected:?}");
            return Err(FsError::InvalidGeometry);
        }
        Ok(superblock)
    }

    pub fn store(&self, device: &mut impl BlockIO) -> Result<()> {
        let mut block: Block = [0; BLOCK_SIZE];
        self.pack_to_slice(&mut block[..Self::SIZE])?;
        storage::write_block(device, 0, &block)
    }

    /// First block of the FAT run.
    pub fn fat_start(&self) -> usize {
        1
    }

    /// Absolute block number of data block `index`.
    pub fn data_block(&self, index: u16) -> usize {
        self.data_start as usize + index as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::storage::mem::MemDisk;
    use hex_literal::hex;

    #[test]
    fn test_geometry_invariants() {
        for total in 0..=u16::MAX as usize {
            let Some(sb) = Superblock::for_block_count(total) else {
                continue;
            };
            let fat = sb.fat_blocks as usize;
            let data = sb.data_blocks as usize;
            assert_eq!(sb.total_blocks as usize, total);
            assert_eq!(data, total - 2 - fat);
            assert_eq!(fat, (data * 2).div_ceil(BLOCK_SIZE));
            assert_eq!(sb.root_dir_index as usize, 1 + fat);
            assert_eq!(sb.data_start, sb.root_dir_index + 1);
        }
    }

    #[test]
    fn test_known_geometries() {
        let sb = Superblock::for_block_count(8192).unwrap();
        assert_eq!(sb.fat_blocks, 4);
        assert_eq!(sb.data_blocks, 8186);
        assert_eq!(sb.root_dir_index, 5);
        assert_eq!(sb.data_start, 6);

        let sb = Superblock::for_block_count(8198).unwrap();
        assert_eq!(sb.fat_blocks, 4);
        assert_eq!(sb.data_blocks, 8192);

        let sb = Superblock::for_block_count(4).unwrap();
        assert_eq!(sb.fat_blocks, 1);
        assert_eq!(sb.data_blocks, 1);
    }

    #[test]
    fn test_impossible_geometry() {
        // 2050 data blocks need 2 FAT blocks, but then only 2049 remain
        assert!(Superblock::for_block_count(2052).is_none());
        assert!(Superblock::for_block_count(3).is_none());
        assert!(Superblock::for_block_count(2).is_none());
    }

    #[test]
    fn test_byte_layout() {
        let sb = Superblock::for_block_count(8198).unwrap();
        let packed = sb.pack().unwrap();
        assert_eq!(
            packed,
            hex!("4543533135304653 0620 0500 0600 0020 04")
        );
    }

    #[test]
    fn test_load_rejects_mismatch() {
        let mut disk = MemDisk::new(16);
        Superblock::for_block_count(16).unwrap().store(&mut disk).unwrap();
        assert_eq!(
            Superblock::load(&mut disk).unwrap(),
            Superblock::for_block_count(16).unwrap()
        );

        let mut block = disk.block(0);
        block[0] = b'X';
        disk.set_block(0, &block);
        assert!(matches!(
            Superblock::load(&mut disk),
            Err(FsError::BadSignature)
        ));

        let mut lying = Superblock::for_block_count(16).unwrap();
        lying.data_blocks += 1;
        lying.store(&mut disk).unwrap();
        assert!(matches!(
            Superblock::load(&mut disk),
            Err(FsError::InvalidGeometry)
        ));
    }
}
