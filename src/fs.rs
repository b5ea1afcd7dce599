//! A flat, FAT based filesystem living on a [`BlockIO`]
//! device. Mounting loads the superblock, the FAT and the
//! root directory into memory; metadata only reaches the
//! disk again on unmount, file data is written through.

pub mod descriptor;
pub mod directory;
pub mod fat;
pub mod storage;
pub mod superblock;

use crate::disk::FileDisk;
use descriptor::{Fd, OpenFileTable};
use directory::{validate_name, DirEntry, RootDirectory, MAX_FILES};
use fat::{Fat, FAT_EOC};
use packed_struct::PackingError;
use std::fmt;
use std::path::{Path, PathBuf};
use storage::{BlockIO, BLOCK_SIZE};
use superblock::Superblock;
use thiserror::Error;
use tracing::{debug, trace, warn};

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FsError {
    #[error("No filesystem is mounted")]
    NotMounted,
    #[error("A filesystem is already mounted")]
    AlreadyMounted,
    #[error("Couldn't open volume {volume:?}")]
    OpenFailed {
        volume: PathBuf,
        #[source]
        source: BoxedError,
    },
    #[error("Couldn't write the filesystem metadata back to the volume")]
    FlushFailed(#[source] BoxedError),
    #[error("The volume geometry is inconsistent with the superblock")]
    InvalidGeometry,
    #[error("The superblock signature is wrong, the volume is not formatted")]
    BadSignature,
    #[error("Invalid file name {0:?}")]
    InvalidName(String),
    #[error("A file named {0:?} already exists")]
    NameExists(String),
    #[error("The root directory is full")]
    DirectoryFull,
    #[error("No file named {0:?}")]
    FileNotFound(String),
    #[error("File {0:?} is currently open")]
    FileOpen(String),
    #[error("Bad file descriptor {0}")]
    BadDescriptor(Fd),
    #[error("Offset {offset} is past the end of the file ({size} bytes)")]
    OffsetOutOfRange { offset: usize, size: usize },
    #[error("Too many open files")]
    TooManyOpenFiles,
    #[error("No free data blocks left")]
    DiskFull,
    #[error("The FAT chain is corrupted at data block {block}. This indicates a corrupted filesystem")]
    CorruptChain { block: u16 },
    #[error("Block device failed on block {block}")]
    Io {
        block: usize,
        #[source]
        source: BoxedError,
    },
    #[error("Root directory slot {slot} holds a name that is not NUL terminated UTF-8")]
    CorruptEntry { slot: usize },
    #[error("Couldn't pack or unpack an on-disk structure: {0:?}")]
    Packing(PackingError),
}

impl From<PackingError> for FsError {
    fn from(err: PackingError) -> Self {
        Self::Packing(err)
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Geometry and usage of a mounted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsInfo {
    pub total_blocks: usize,
    pub fat_blocks: usize,
    pub root_dir_index: usize,
    pub data_start: usize,
    pub data_blocks: usize,
    pub fat_free: usize,
    pub root_free: usize,
}

impl fmt::Display for FsInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FS Info:")?;
        writeln!(f, "total_blk_count={}", self.total_blocks)?;
        writeln!(f, "fat_blk_count={}", self.fat_blocks)?;
        writeln!(f, "rdir_blk={}", self.root_dir_index)?;
        writeln!(f, "data_blk={}", self.data_start)?;
        writeln!(f, "data_blk_count={}", self.data_blocks)?;
        writeln!(f, "fat_free_ratio={}/{}", self.fat_free, self.data_blocks)?;
        write!(f, "rdir_free_ratio={}/{}", self.root_free, MAX_FILES)
    }
}

/// Everything that lives for the duration of one mount.
#[derive(Debug)]
struct Session<D: BlockIO> {
    device: D,
    superblock: Superblock,
    fat: Fat,
    root: RootDirectory,
    files: OpenFileTable,
}

impl<D: BlockIO> Session<D> {
    fn load(mut device: D) -> Result<Self> {
        let superblock = Superblock::load(&mut device)?;
        let fat = Fat::load(&mut device, &superblock)?;
        let root = RootDirectory::load(&mut device, &superblock)?;
        Ok(Self {
            device,
            superblock,
            fat,
            root,
            files: OpenFileTable::default(),
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.fat.flush(&mut self.device, &self.superblock)?;
        self.root.flush(&mut self.device, &self.superblock)?;
        storage::sync(&mut self.device)
    }

    /// The directory slot `fd` is currently bound to.
    fn resolve(&self, fd: Fd) -> Result<usize> {
        let file = self.files.get(fd)?;
        self.root
            .find(&file.name)
            .ok_or_else(|| FsError::FileNotFound(file.name.clone()))
    }

    fn data_block(&self, block: u16) -> Result<usize> {
        if !self.fat.is_data_block(block) {
            return Err(FsError::CorruptChain { block });
        }
        Ok(self.superblock.data_block(block))
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let slot = self.resolve(fd)?;
        let entry = self.root.get(slot);
        let (size, first_block) = (entry.size, entry.first_block);
        let offset = self.files.get(fd)?.offset;
        let count = buf.len().min(size.saturating_sub(offset));
        if count == 0 {
            return Ok(0);
        }
        let mut block = self.fat.nth_block(first_block, offset / BLOCK_SIZE)?;
        let mut staging = [0; BLOCK_SIZE];
        let mut within = offset % BLOCK_SIZE;
        let mut done = 0;
        loop {
            let absolute = self.data_block(block)?;
            storage::read_block(&mut self.device, absolute, &mut staging)?;
            let n = (BLOCK_SIZE - within).min(count - done);
            buf[done..done + n].copy_from_slice(&staging[within..within + n]);
            done += n;
            if done == count {
                break;
            }
            within = 0;
            block = self.fat.next(block)?;
        }
        self.files.get_mut(fd)?.offset += done;
        trace!("Read {done} bytes from {fd} at offset {offset}");
        Ok(done)
    }

    fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize> {
        let slot = self.resolve(fd)?;
        let offset = self.files.get(fd)?.offset;
        if data.is_empty() {
            return Ok(0);
        }
        let mut chain = self.fat.chain(self.root.get(slot).first_block)?;
        let mut written = 0;
        let outcome = self.write_blocks(slot, &mut chain, offset, data, &mut written);
        if written > 0 {
            let entry = self.root.get_mut(slot);
            entry.size = entry.size.max(offset + written);
            self.files.get_mut(fd)?.offset = offset + written;
        }
        trace!("Wrote {written} bytes to {fd} at offset {offset}");
        match outcome {
            Ok(()) => Ok(written),
            Err(FsError::DiskFull) if written > 0 => {
                debug!("Volume full, short write of {written}/{} bytes", data.len());
                Ok(written)
            }
            Err(err) => Err(err),
        }
    }

    /// Writes `data` block by block, growing the chain as needed.
    /// `written` counts the bytes that reached the device, even
    /// when an error cuts the write short.
    fn write_blocks(
        &mut self,
        slot: usize,
        chain: &mut Vec<u16>,
        offset: usize,
        data: &[u8],
        written: &mut usize,
    ) -> Result<()> {
        let mut staging = [0; BLOCK_SIZE];
        while *written < data.len() {
            let pos = offset + *written;
            let within = pos % BLOCK_SIZE;
            let n = (BLOCK_SIZE - within).min(data.len() - *written);
            let fresh = pos / BLOCK_SIZE >= chain.len();
            let block = if fresh {
                let block = self.fat.allocate_block()?;
                match chain.last() {
                    Some(&last) => self.fat.extend_chain(last, block),
                    None => self.root.get_mut(slot).first_block = block,
                }
                chain.push(block);
                staging.fill(0);
                block
            } else {
                let block = chain[pos / BLOCK_SIZE];
                if n < BLOCK_SIZE {
                    let absolute = self.data_block(block)?;
                    storage::read_block(&mut self.device, absolute, &mut staging)?;
                }
                block
            };
            staging[within..within + n].copy_from_slice(&data[*written..*written + n]);
            let stored = self
                .data_block(block)
                .and_then(|absolute| storage::write_block(&mut self.device, absolute, &staging));
            if let Err(err) = stored {
                if fresh {
                    self.unlink_last(slot, chain)?;
                }
                return Err(err);
            }
            *written += n;
        }
        Ok(())
    }

    /// Gives back the last block of `chain`, which was never written.
    fn unlink_last(&mut self, slot: usize, chain: &mut Vec<u16>) -> Result<()> {
        let Some(block) = chain.pop() else {
            return Ok(());
        };
        match chain.last() {
            Some(&last) => {
                self.fat.cut_after(last);
            }
            None => self.root.get_mut(slot).first_block = FAT_EOC,
        }
        self.fat.free_chain(block).map(|_| ())
    }

    fn truncate(&mut self, fd: Fd, size: usize) -> Result<()> {
        let slot = self.resolve(fd)?;
        let entry = self.root.get(slot).clone();
        if size > entry.size {
            return Err(FsError::OffsetOutOfRange {
                offset: size,
                size: entry.size,
            });
        }
        let keep = size.div_ceil(BLOCK_SIZE);
        let released = if keep == 0 {
            self.root.get_mut(slot).first_block = FAT_EOC;
            entry.first_block
        } else {
            let last = self.fat.nth_block(entry.first_block, keep - 1)?;
            if !self.fat.is_data_block(last) {
                return Err(FsError::CorruptChain { block: last });
            }
            self.fat.cut_after(last)
        };
        self.root.get_mut(slot).size = size;
        for file in self.files.bound_to_mut(&entry.name) {
            file.offset = file.offset.min(size);
        }
        let freed = self.fat.free_chain(released)?;
        debug!("Truncated {:?} to {size} bytes, freed {freed} blocks", entry.name);
        Ok(())
    }

    fn check(&self) -> Result<()> {
        let mut owned = vec![false; self.fat.len()];
        for entry in self.root.iter() {
            let chain = self.fat.chain(entry.first_block)?;
            let capacity = chain.len() * BLOCK_SIZE;
            if capacity < entry.size || capacity >= entry.size + BLOCK_SIZE {
                warn!(
                    "{:?} is {} bytes but its chain holds {} blocks",
                    entry.name,
                    entry.size,
                    chain.len()
                );
                return Err(FsError::CorruptChain {
                    block: entry.first_block,
                });
            }
            for block in chain {
                if std::mem::replace(&mut owned[block as usize], true) {
                    warn!("Data block {block} is shared, found again in {:?}", entry.name);
                    return Err(FsError::CorruptChain { block });
                }
            }
        }
        Ok(())
    }
}

/// A mount point for at most one volume at a time.
#[derive(Debug)]
pub struct FileSystem<D: BlockIO> {
    session: Option<Session<D>>,
}

impl<D: BlockIO> Default for FileSystem<D> {
    fn default() -> Self {
        Self { session: None }
    }
}

impl<D: BlockIO> FileSystem<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes an empty filesystem onto `device`, sized to its block count.
    pub fn format(device: &mut D) -> Result<Superblock> {
        if device.block_size() != BLOCK_SIZE {
            return Err(FsError::InvalidGeometry);
        }
        let superblock =
            Superblock::for_block_count(device.block_count()).ok_or(FsError::InvalidGeometry)?;
        superblock.store(device)?;
        Fat::empty(superblock.data_blocks as usize).flush(device, &superblock)?;
        RootDirectory::empty().flush(device, &superblock)?;
        storage::sync(device)?;
        debug!("Formatted volume: {superblock:?}");
        Ok(superblock)
    }

    pub fn is_mounted(&self) -> bool {
        self.session.is_some()
    }

    fn session(&self) -> Result<&Session<D>> {
        self.session.as_ref().ok_or(FsError::NotMounted)
    }

    fn session_mut(&mut self) -> Result<&mut Session<D>> {
        self.session.as_mut().ok_or(FsError::NotMounted)
    }

    pub fn mount(&mut self, device: D) -> Result<()> {
        if self.is_mounted() {
            return Err(FsError::AlreadyMounted);
        }
        let session = Session::load(device)?;
        debug!("Mounted volume: {:?}", session.superblock);
        self.session = Some(session);
        Ok(())
    }

    /// Flushes the metadata and closes the device. If the flush
    /// fails the volume stays mounted, so unmount can be retried.
    pub fn unmount(&mut self) -> Result<()> {
        let session = self.session_mut()?;
        session.flush().map_err(|err| match err {
            FsError::FlushFailed(_) => err,
            err => FsError::FlushFailed(Box::new(err)),
        })?;
        let Some(session) = self.session.take() else {
            return Err(FsError::NotMounted);
        };
        let open = session.files.open_count();
        if open > 0 {
            debug!("Unmounting with {open} open descriptors");
        }
        session
            .device
            .close()
            .map_err(|err| FsError::FlushFailed(Box::new(err)))?;
        debug!("Unmounted volume");
        Ok(())
    }

    pub fn info(&self) -> Result<FsInfo> {
        let session = self.session()?;
        let sb = &session.superblock;
        Ok(FsInfo {
            total_blocks: sb.total_blocks as usize,
            fat_blocks: sb.fat_blocks as usize,
            root_dir_index: sb.root_dir_index as usize,
            data_start: sb.data_start as usize,
            data_blocks: sb.data_blocks as usize,
            fat_free: session.fat.free_count(),
            root_free: session.root.free_count(),
        })
    }

    pub fn create(&mut self, name: &str) -> Result<()> {
        let slot = self.session_mut()?.root.create(name)?;
        trace!("Created {name:?} in slot {slot}");
        Ok(())
    }

    /// Removes `name` and releases its blocks. Open files can't be deleted.
    /// A corrupt chain is reported after the entry is already gone.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let session = self.session_mut()?;
        validate_name(name)?;
        let slot = session
            .root
            .find(name)
            .ok_or_else(|| FsError::FileNotFound(name.to_owned()))?;
        if session.files.is_open(name) {
            return Err(FsError::FileOpen(name.to_owned()));
        }
        let entry = session.root.remove(slot);
        let freed = session.fat.free_chain(entry.first_block)?;
        trace!("Deleted {name:?}, freed {freed} blocks");
        Ok(())
    }

    /// The occupied directory entries, in slot order.
    pub fn list(&self) -> Result<Vec<DirEntry>> {
        Ok(self.session()?.root.iter().cloned().collect())
    }

    pub fn open(&mut self, name: &str) -> Result<Fd> {
        let session = self.session_mut()?;
        validate_name(name)?;
        if session.root.find(name).is_none() {
            return Err(FsError::FileNotFound(name.to_owned()));
        }
        let fd = session.files.open(name)?;
        trace!("Opened {name:?} as {fd}");
        Ok(fd)
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        self.session_mut()?.files.close(fd).map(|_| ())
    }

    /// Current size of the file behind `fd`.
    pub fn stat(&self, fd: Fd) -> Result<usize> {
        let session = self.session()?;
        let slot = session.resolve(fd)?;
        Ok(session.root.get(slot).size)
    }

    /// Current offset of `fd`.
    pub fn tell(&self, fd: Fd) -> Result<usize> {
        Ok(self.session()?.files.get(fd)?.offset)
    }

    /// Moves `fd` to `offset`, which may be the end of the file but not past it.
    pub fn seek(&mut self, fd: Fd, offset: usize) -> Result<()> {
        let session = self.session_mut()?;
        let slot = session.resolve(fd)?;
        let size = session.root.get(slot).size;
        if offset > size {
            return Err(FsError::OffsetOutOfRange { offset, size });
        }
        session.files.get_mut(fd)?.offset = offset;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at the current offset.
    /// Returns 0 at the end of the file.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        self.session_mut()?.read(fd, buf)
    }

    pub fn read_vec(&mut self, fd: Fd, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; count];
        let read = self.read(fd, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Writes `data` at the current offset, growing the file as needed.
    /// When the volume fills up after some bytes were written, the
    /// short count is returned instead of an error.
    pub fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize> {
        self.session_mut()?.write(fd, data)
    }

    /// Shrinks the file behind `fd` to `size` bytes.
    pub fn truncate(&mut self, fd: Fd, size: usize) -> Result<()> {
        self.session_mut()?.truncate(fd, size)
    }

    /// Verifies every file's chain against its size and that
    /// no block belongs to two files.
    pub fn check(&self) -> Result<()> {
        self.session()?.check()
    }
}

impl FileSystem<FileDisk> {
    /// Opens the image at `volume` and mounts it.
    pub fn mount_volume(&mut self, volume: impl AsRef<Path>) -> Result<()> {
        if self.is_mounted() {
            return Err(FsError::AlreadyMounted);
        }
        let volume = volume.as_ref();
        let disk = FileDisk::open(volume).map_err(|err| FsError::OpenFailed {
            volume: volume.to_owned(),
            source: Box::new(err),
        })?;
        self.mount(disk)
    }
}
