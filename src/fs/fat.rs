//! The file allocation table. One 16 bit entry per data
//! block, linking the blocks of a file into a chain.

use super::storage::{self, BlockIO, BLOCK_SIZE};
use super::superblock::{Superblock, FAT_ENTRIES_PER_BLOCK};
use super::{FsError, Result};
use tracing::{trace, warn};

/// Marks the last block of a chain. Also stored as the
/// first block of an empty file.
pub const FAT_EOC: u16 = 0xFFFF;
/// A free data block.
pub const FAT_FREE: u16 = 0;

#[derive(Debug, Clone)]
pub struct Fat {
    entries: Vec<u16>,
}

impl Fat {
    /// A fresh table: everything free except the
    /// reserved entry 0.
    pub fn empty(data_blocks: usize) -> Self {
        let mut entries = vec![FAT_FREE; data_blocks];
        if let Some(first) = entries.first_mut() {
            *first = FAT_EOC;
        }
        Self { entries }
    }

    pub fn load(device: &mut impl BlockIO, superblock: &Superblock) -> Result<Self> {
        let data_blocks = superblock.data_blocks as usize;
        let mut entries = Vec::with_capacity(superblock.fat_blocks as usize * FAT_ENTRIES_PER_BLOCK);
        let mut block = [0; BLOCK_SIZE];
        for i in 0..superblock.fat_blocks as usize {
            storage::read_block(device, superblock.fat_start() + i, &mut block)?;
            entries.extend(
                block
                    .chunks_exact(2)
                    .map(|entry| u16::from_le_bytes([entry[0], entry[1]])),
            );
        }
        entries.truncate(data_blocks);
        trace!("Loaded {} FAT entries", entries.len());
        Ok(Self { entries })
    }

    pub fn flush(&self, device: &mut impl BlockIO, superblock: &Superblock) -> Result<()> {
        let mut chunks = self.entries.chunks(FAT_ENTRIES_PER_BLOCK);
        for i in 0..superblock.fat_blocks as usize {
            let mut block = [0; BLOCK_SIZE];
            if let Some(chunk) = chunks.next() {
                for (dst, entry) in block.chunks_exact_mut(2).zip(chunk) {
                    dst.copy_from_slice(&entry.to_le_bytes());
                }
            }
            storage::write_block(device, superblock.fat_start() + i, &block)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `block` names a data block a chain may contain.
    pub fn is_data_block(&self, block: u16) -> bool {
        block != 0 && (block as usize) < self.entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.entries.iter().filter(|&&e| e == FAT_FREE).count()
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, index: u16) -> u16 {
        self.entries[index as usize]
    }

    /// First-fit: the lowest free block, entry 0 is never handed out.
    pub fn allocate_block(&mut self) -> Result<u16> {
        let index = self
            .entries
            .iter()
            .skip(1)
            .position(|&e| e == FAT_FREE)
            .map(|i| i + 1)
            .ok_or(FsError::DiskFull)?;
        self.entries[index] = FAT_EOC;
        trace!("Allocated data block {index}");
        Ok(index as u16)
    }

    /// Links `new` after `last`, which must currently end its chain.
    pub fn extend_chain(&mut self, last: u16, new: u16) {
        debug_assert_eq!(self.entries[last as usize], FAT_EOC);
        self.entries[last as usize] = new;
    }

    /// Makes `block` the end of its chain, returning whatever it linked to.
    pub fn cut_after(&mut self, block: u16) -> u16 {
        std::mem::replace(&mut self.entries[block as usize], FAT_EOC)
    }

    /// The block after `block`, which may be [`FAT_EOC`].
    pub fn next(&self, block: u16) -> Result<u16> {
        if !self.is_data_block(block) {
            return Err(FsError::CorruptChain { block });
        }
        match self.entries[block as usize] {
            FAT_FREE => Err(FsError::CorruptChain { block }),
            next => Ok(next),
        }
    }

    /// Zeroes every entry of the chain starting at `first`.
    /// Stops at the first corrupt link, leaving the rest as is.
    pub fn free_chain(&mut self, first: u16) -> Result<usize> {
        let mut freed = 0;
        let mut block = first;
        while block != FAT_EOC {
            let next = self.next(block).inspect_err(|_| {
                warn!("Chain starting at {first} is corrupt at block {block}, {freed} blocks freed");
            })?;
            self.entries[block as usize] = FAT_FREE;
            freed += 1;
            block = next;
        }
        trace!("Freed {freed} blocks starting at {first}");
        Ok(freed)
    }

    /// The block reached after walking `n` links from `first`.
    /// Walking exactly to the end of a chain yields [`FAT_EOC`].
    pub fn nth_block(&self, first: u16, n: usize) -> Result<u16> {
        let mut block = first;
        for _ in 0..n {
            if block == FAT_EOC {
                return Err(FsError::CorruptChain { block });
            }
            block = self.next(block)?;
        }
        Ok(block)
    }

    /// Every block of the chain, in order.
    pub fn chain(&self, first: u16) -> Result<Vec<u16>> {
        let mut blocks = Vec::new();
        let mut block = first;
        while block != FAT_EOC {
            // a chain longer than the table must loop
            if blocks.len() >= self.entries.len() {
                return Err(FsError::CorruptChain { block });
            }
            blocks.push(block);
            block = self.next(block)?;
        }
        Ok(blocks)
    }

    pub fn chain_length(&self, first: u16) -> Result<usize> {
        self.chain(first).map(|blocks| blocks.len())
    }
}
