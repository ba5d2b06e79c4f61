use std::time::SystemTime;

use fuser::{FileAttr, FileType};

use crate::backend::{FileKind, Stat};
use crate::error::FsError;

const BLOCK_SIZE: u64 = 512;

/// Type tag of a directory entry. `Unknown` marks a tombstone: a slot
/// whose offset stays reserved so directory cursors handed to the kernel
/// remain valid after a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentKind {
    Directory,
    File,
    Symlink,
    Unknown,
}

impl From<FileKind> for DirentKind {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::Directory => DirentKind::Directory,
            FileKind::Regular => DirentKind::File,
            FileKind::Symlink => DirentKind::Symlink,
        }
    }
}

impl DirentKind {
    /// The fuser type for a live entry. Tombstones are never encoded.
    pub fn as_file_type(self) -> FileType {
        match self {
            DirentKind::Directory => FileType::Directory,
            DirentKind::Symlink => FileType::Symlink,
            _ => FileType::RegularFile,
        }
    }
}

/// One slot in a directory's entry list. `offset` is slot-index + 1 and
/// never changes for the lifetime of the slot.
#[derive(Debug, Clone)]
pub struct Dirent {
    pub offset: i64,
    pub ino: u64,
    pub name: String,
    pub kind: DirentKind,
}

impl Dirent {
    pub fn is_live(&self) -> bool {
        self.kind != DirentKind::Unknown
    }
}

/// The in-memory record for one filesystem entity: stable identifier,
/// short name, absolute backend path, cached attributes and, for
/// directories, the ordered child entry list.
#[derive(Debug, Clone)]
pub struct Inode {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub attr: FileAttr,
    pub entries: Vec<Dirent>,
}

impl Inode {
    pub fn new(id: u64, name: &str, path: &str, attr: FileAttr) -> Self {
        let mut attr = attr;
        attr.ino = id;
        Inode {
            id,
            name: name.to_string(),
            path: path.to_string(),
            attr,
            entries: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attr.kind == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.attr.kind == FileType::RegularFile
    }

    pub fn is_symlink(&self) -> bool {
        self.attr.kind == FileType::Symlink
    }

    /// Append a dirent for a child, reusing the lowest tombstone slot if
    /// one exists. The slot keeps offset = index + 1 either way.
    pub fn add_child(&mut self, id: u64, name: &str, kind: DirentKind) {
        self.attr.mtime = SystemTime::now();

        let index = self
            .entries
            .iter()
            .position(|e| !e.is_live())
            .unwrap_or(self.entries.len());

        let entry = Dirent {
            offset: (index + 1) as i64,
            ino: id,
            name: name.to_string(),
            kind,
        };

        if index == self.entries.len() {
            self.entries.push(entry);
        } else {
            self.entries[index] = entry;
        }
    }

    /// Replace the live dirent with the given name by a tombstone, keeping
    /// its offset reserved.
    pub fn remove_child(&mut self, name: &str) -> Result<(), FsError> {
        self.attr.mtime = SystemTime::now();

        let index = self
            .find_child(name)
            .ok_or_else(|| FsError::internal(format!("unknown child: {}", name)))?;

        self.entries[index] = Dirent {
            offset: (index + 1) as i64,
            ino: 0,
            name: String::new(),
            kind: DirentKind::Unknown,
        };
        Ok(())
    }

    /// Linear scan over live entries; tombstones never match.
    pub fn look_up_child(&self, name: &str) -> Option<(u64, DirentKind)> {
        self.find_child(name)
            .map(|i| (self.entries[i].ino, self.entries[i].kind))
    }

    pub fn live_children(&self) -> usize {
        self.entries.iter().filter(|e| e.is_live()).count()
    }

    fn find_child(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.is_live() && e.name == name)
    }
}

/// Build the cached attribute block from a backend stat, with ownership
/// overridden by the filesystem's configured uid/gid.
pub fn attr_from_stat(id: u64, stat: &Stat, uid: u32, gid: u32) -> FileAttr {
    let kind = match stat.kind {
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::Regular => FileType::RegularFile,
    };
    let nlink = if stat.is_dir() { 2 } else { 1 };

    FileAttr {
        ino: id,
        size: stat.size,
        blocks: (stat.size + BLOCK_SIZE - 1) / BLOCK_SIZE,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.mtime,
        crtime: stat.mtime,
        kind,
        perm: (stat.perm & 0o7777) as u16,
        nlink,
        uid,
        gid,
        rdev: 0,
        flags: 0,
        blksize: BLOCK_SIZE as u32,
    }
}
