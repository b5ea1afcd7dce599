pub mod disk;
pub mod fs;

pub use disk::{DiskError, FileDisk};
pub use fs::descriptor::Fd;
pub use fs::directory::DirEntry;
pub use fs::storage::{BlockIO, BLOCK_SIZE};
pub use fs::{FileSystem, FsError, FsInfo};
