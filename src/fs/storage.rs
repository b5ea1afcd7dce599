//! The block device seam. The filesystem only
//! ever talks to its volume through whole,
//! fixed-size blocks.

use super::{FsError, Result};

/// Size of every block on a volume. There is no
/// support for other block sizes.
pub const BLOCK_SIZE: usize = 4096;

/// A single block-sized staging buffer.
pub type Block = [u8; BLOCK_SIZE];

/// Trait that abstracts out a block device,
/// this crate only implements a mmap file backing,
/// though.
pub trait BlockIO {
    /// Error type returned from the IO methods
    type IoError: std::error::Error + Send + Sync + 'static;
    /// The total amount of blocks available
    /// to do IO
    fn block_count(&self) -> usize;
    /// The size of a single block. Mounting
    /// fails unless this is [`BLOCK_SIZE`].
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }
    /// Read a single block at offset `block_number` (starting at 0),
    /// stores the block into the `block` argument.
    fn read_block(
        &mut self,
        block_number: usize,
        block: &mut Block,
    ) -> std::result::Result<(), Self::IoError>;
    /// Write a single `block` at offset `block_number` (starting at 0).
    fn write_block(
        &mut self,
        block_number: usize,
        block: &Block,
    ) -> std::result::Result<(), Self::IoError>;
    /// Make every written block durable. Called as the last
    /// step of the unmount flush, while the volume is still mounted.
    fn sync(&mut self) -> std::result::Result<(), Self::IoError> {
        Ok(())
    }
    /// Release the device. Called once on unmount, after [`BlockIO::sync`].
    fn close(self) -> std::result::Result<(), Self::IoError>
    where
        Self: Sized,
    {
        Ok(())
    }
}

pub(crate) fn read_block(device: &mut impl BlockIO, block: usize, buf: &mut Block) -> Result<()> {
    device.read_block(block, buf).map_err(|e| FsError::Io {
        block,
        source: Box::new(e),
    })
}

pub(crate) fn sync(device: &mut impl BlockIO) -> Result<()> {
    device.sync().map_err(|e| FsError::FlushFailed(Box::new(e)))
}

pub(crate) fn write_block(device: &mut impl BlockIO, block: usize, buf: &Block) -> Result<()> {
    device.write_block(block, buf).map_err(|e| FsError::Io {
        block,
        source: Box::new(e),
    })
}

#[cfg(test)]
pub(crate) mod mem {
    use super::{BlockIO, Block, BLOCK_SIZE};
    use crate::disk::DiskError;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// A volume held in memory. Clones share the same
    /// blocks, so a test can keep a handle across
    /// unmount/mount cycles.
    #[derive(Debug, Clone)]
    pub(crate) struct MemDisk {
        blocks: Rc<RefCell<Vec<Block>>>,
        fail_writes: Rc<Cell<bool>>,
        fail_sync: Rc<Cell<bool>>,
    }

    impl MemDisk {
        pub(crate) fn new(block_count: usize) -> Self {
            Self {
                blocks: Rc::new(RefCell::new(vec![[0; BLOCK_SIZE]; block_count])),
                fail_writes: Rc::new(Cell::new(false)),
                fail_sync: Rc::new(Cell::new(false)),
            }
        }

        pub(crate) fn fail_writes(&self, fail: bool) {
            self.fail_writes.set(fail);
        }

        pub(crate) fn fail_sync(&self, fail: bool) {
            self.fail_sync.set(fail);
        }

        pub(crate) fn block(&self, block_number: usize) -> Block {
            self.blocks.borrow()[block_number]
        }

        pub(crate) fn set_block(&self, block_number: usize, block: &Block) {
            self.blocks.borrow_mut()[block_number] = *block;
        }
    }

    impl BlockIO for MemDisk {
        type IoError = DiskError;

        fn block_count(&self) -> usize {
            self.blocks.borrow().len()
        }

        fn read_block(&mut self, block_number: usize, block: &mut Block) -> Result<(), DiskError> {
            let blocks = self.blocks.borrow();
            let src = blocks.get(block_number).ok_or(DiskError::OutOfRange {
                block: block_number,
                count: blocks.len(),
            })?;
            block.copy_from_slice(src);
            Ok(())
        }

        fn write_block(&mut self, block_number: usize, block: &Block) -> Result<(), DiskError> {
            if self.fail_writes.get() {
                return Err(DiskError::Io(std::io::Error::other("injected write failure")));
            }
            let mut blocks = self.blocks.borrow_mut();
            let count = blocks.len();
            let dst = blocks.get_mut(block_number).ok_or(DiskError::OutOfRange {
                block: block_number,
                count,
            })?;
            dst.copy_from_slice(block);
            Ok(())
        }

        fn sync(&mut self) -> Result<(), DiskError> {
            if self.fail_sync.get() {
                return Err(DiskError::Io(std::io::Error::other("injected sync failure")));
            }
            Ok(())
        }
    }
}
