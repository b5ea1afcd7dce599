//! A virtual disk backed by an image file. The whole
//! image is mapped into memory and every block is
//! copied in and out of the mapping.

use crate::fs::storage::{Block, BlockIO, BLOCK_SIZE};
use std::ffi::c_void;
use std::fs::{self, File};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DiskError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Image size {size} is not a non-zero multiple of the 4096 byte block size")]
    BadSize { size: usize },
    #[error("Block {block} is out of range, the disk has {count} blocks")]
    OutOfRange { block: usize, count: usize },
}

type Result<T> = std::result::Result<T, DiskError>;

#[derive(Debug)]
pub struct FileDisk {
    _file: File,
    data_addr: *mut u8,
    data_size: usize,
    mapped: bool,
}

impl FileDisk {
    fn stat_file_size(fd: libc::c_int) -> Result<usize> {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let stat = unsafe { stat.assume_init() };
        trace!("Stat'ed image size: {}", stat.st_size);
        Ok(stat.st_size as usize)
    }

    fn mmap_image(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(addr as *mut u8)
    }

    /// Opens an existing image for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().canonicalize()?;
        debug!("Opening disk image at {:?}", path);
        let file = File::options().read(true).write(true).open(&path)?;
        let size = Self::stat_file_size(file.as_raw_fd())?;
        if size == 0 || size % BLOCK_SIZE != 0 {
            return Err(DiskError::BadSize { size });
        }
        let data_addr = Self::mmap_image(file.as_raw_fd(), size)?;
        Ok(Self {
            _file: file,
            data_addr,
            data_size: size,
            mapped: true,
        })
    }

    /// Creates a zero-filled image of `block_count` blocks.
    /// The image holds no filesystem until it is formatted.
    pub fn create(path: impl AsRef<Path>, block_count: usize) -> Result<()> {
        let path = path.as_ref();
        debug!("Creating disk image at {path:?} with {block_count} blocks");
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        file.set_len((block_count * BLOCK_SIZE) as u64)?;
        file.sync_all()?;
        Ok(())
    }

    fn block_range(&self, block_number: usize) -> Result<usize> {
        let count = self.block_count();
        if block_number >= count {
            return Err(DiskError::OutOfRange {
                block: block_number,
                count,
            });
        }
        Ok(block_number * BLOCK_SIZE)
    }

    fn unmap(&mut self) -> Result<()> {
        if !self.mapped {
            return Ok(());
        }
        if unsafe { libc::munmap(self.data_addr as *mut c_void, self.data_size) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        self.mapped = false;
        Ok(())
    }
}

impl BlockIO for FileDisk {
    type IoError = DiskError;

    fn block_count(&self) -> usize {
        self.data_size / BLOCK_SIZE
    }

    fn read_block(&mut self, block_number: usize, block: &mut Block) -> Result<()> {
        let offset = self.block_range(block_number)?;
        let addr = self.data_addr.wrapping_add(offset);
        let data = unsafe { std::slice::from_raw_parts(addr, BLOCK_SIZE) };
        block.copy_from_slice(data);
        Ok(())
    }

    fn write_block(&mut self, block_number: usize, block: &Block) -> Result<()> {
        let offset = self.block_range(block_number)?;
        let addr = self.data_addr.wrapping_add(offset);
        let data: &mut [u8] = unsafe { std::slice::from_raw_parts_mut(addr, BLOCK_SIZE) };
        data.copy_from_slice(block);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        trace!("Syncing disk image");
        let addr = self.data_addr as *mut c_void;
        if unsafe { libc::msync(addr, self.data_size, libc::MS_SYNC) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        trace!("Closing disk image");
        self.unmap()
    }
}

impl Drop for FileDisk {
    fn drop(&mut self) {
        if let Err(err) = self.unmap() {
            debug!("Failed to unmap disk image: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_image(tag: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "flatfat-disk-{tag}-{}-{}.img",
            std::process::id(),
            rand::random::<u64>()
        ));
        let _ = fs::remove_file(&path);
        path
    }

    #[test]
    fn test_blocks_persist_across_open() {
        let path = scratch_image("persist");
        FileDisk::create(&path, 4).unwrap();
        let mut disk = FileDisk::open(&path).unwrap();
        assert_eq!(disk.block_count(), 4);
        let mut block = [0; BLOCK_SIZE];
        block[0] = 0xAB;
        block[BLOCK_SIZE - 1] = 0xCD;
        disk.write_block(3, &block).unwrap();
        disk.sync().unwrap();
        disk.close().unwrap();

        let mut disk = FileDisk::open(&path).unwrap();
        let mut read = [0; BLOCK_SIZE];
        disk.read_block(3, &mut read).unwrap();
        assert_eq!(read, block);
        disk.read_block(2, &mut read).unwrap();
        assert!(read.iter().all(|&b| b == 0));
        drop(disk);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_out_of_range_block() {
        let path = scratch_image("range");
        FileDisk::create(&path, 2).unwrap();
        let mut disk = FileDisk::open(&path).unwrap();
        let mut block = [0; BLOCK_SIZE];
        assert!(matches!(
            disk.read_block(2, &mut block),
            Err(DiskError::OutOfRange { block: 2, count: 2 })
        ));
        assert!(matches!(
            disk.write_block(7, &block),
            Err(DiskError::OutOfRange { block: 7, count: 2 })
        ));
        drop(disk);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_rejects_unaligned_image() {
        let path = scratch_image("unaligned");
        fs::write(&path, vec![0u8; BLOCK_SIZE + 100]).unwrap();
        assert!(matches!(
            FileDisk::open(&path),
            Err(DiskError::BadSize { size }) if size == BLOCK_SIZE + 100
        ));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_create_refuses_existing() {
        let path = scratch_image("exists");
        FileDisk::create(&path, 1).unwrap();
        assert!(FileDisk::create(&path, 1).is_err());
        fs::remove_file(&path).unwrap();
    }
}
