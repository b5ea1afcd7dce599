use super::{FsError, Result};
use std::fmt;

/// Maximum number of simultaneously open descriptors.
pub const MAX_OPEN_FILES: usize = 32;

/// A file descriptor handed out by `open`. Ids are dense
/// and the lowest free one is reused after `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub usize);

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An open file. Bound to the directory by name, not by
/// slot, so the entry is looked up again on every use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub name: String,
    pub offset: usize,
}

#[derive(Debug)]
pub struct OpenFileTable {
    slots: Vec<Option<OpenFile>>,
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self {
            slots: vec![None; MAX_OPEN_FILES],
        }
    }
}

impl OpenFileTable {
    pub fn open(&mut self, name: &str) -> Result<Fd> {
        let id = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyOpenFiles)?;
        self.slots[id] = Some(OpenFile {
            name: name.to_owned(),
            offset: 0,
        });
        Ok(Fd(id))
    }

    pub fn close(&mut self, fd: Fd) -> Result<OpenFile> {
        self.slots
            .get_mut(fd.0)
            .and_then(Option::take)
            .ok_or(FsError::BadDescriptor(fd))
    }

    pub fn get(&self, fd: Fd) -> Result<&OpenFile> {
        self.slots
            .get(fd.0)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadDescriptor(fd))
    }

    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut OpenFile> {
        self.slots
            .get_mut(fd.0)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadDescriptor(fd))
    }

    /// Whether any descriptor is bound to `name`.
    pub fn is_open(&self, name: &str) -> bool {
        self.bound_to(name).next().is_some()
    }

    pub fn bound_to<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a OpenFile> {
        self.slots.iter().flatten().filter(move |f| f.name == name)
    }

    pub fn bound_to_mut<'a>(
        &'a mut self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a mut OpenFile> {
        self.slots.iter_mut().flatten().filter(move |f| f.name == name)
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[test]
fn test_lowest_descriptor_reused() {
    let mut table = OpenFileTable::default();
    assert_eq!(table.open("a").unwrap(), Fd(0));
    assert_eq!(table.open("a").unwrap(), Fd(1));
    assert_eq!(table.open("b").unwrap(), Fd(2));
    assert_eq!(table.close(Fd(1)).unwrap().name, "a");
    assert_eq!(table.open("c").unwrap(), Fd(1));
    assert_eq!(table.open_count(), 3);
}

#[test]
fn test_bad_descriptors() {
    let mut table = OpenFileTable::default();
    assert!(matches!(table.close(Fd(0)), Err(FsError::BadDescriptor(Fd(0)))));
    assert!(matches!(
        table.get(Fd(MAX_OPEN_FILES)),
        Err(FsError::BadDescriptor(_))
    ));
    let fd = table.open("a").unwrap();
    table.close(fd).unwrap();
    assert!(table.close(fd).is_err());
}

#[test]
fn test_table_full() {
    let mut table = OpenFileTable::default();
    for _ in 0..MAX_OPEN_FILES {
        table.open("a").unwrap();
    }
    assert!(matches!(table.open("a"), Err(FsError::TooManyOpenFiles)));
    assert_eq!(table.bound_to("a").count(), MAX_OPEN_FILES);
    assert!(!table.is_open("b"));
}
