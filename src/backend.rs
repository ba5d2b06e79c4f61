use std::io;
use std::time::SystemTime;

/// What kind of object a backend path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
}

/// Attributes reported by the backend for one path.
#[derive(Debug, Clone)]
pub struct Stat {
    pub size: u64,
    pub kind: FileKind,
    /// Permission bits only; the type lives in `kind`.
    pub perm: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// One entry of a backend directory listing.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub stat: Stat,
}

/// Open disposition for `Backend::open_file`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        OpenFlags {
            read: true,
            ..Default::default()
        }
    }

    pub fn write_only() -> Self {
        OpenFlags {
            write: true,
            ..Default::default()
        }
    }

    /// Decode the flag word the kernel hands to open/create.
    pub fn from_fuse(flags: i32) -> Self {
        let (read, write) = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => (true, false),
        };
        OpenFlags {
            read,
            write,
            append: flags & libc::O_APPEND != 0,
            create: flags & libc::O_CREAT != 0,
            truncate: flags & libc::O_TRUNC != 0,
        }
    }
}

/// A scoped handle onto one backend object. Dropping the handle closes it;
/// the backend keeps the underlying bytes reachable for as long as any
/// handle is held, even across `remove` of the name.
pub trait Handle: Send {
    fn stat(&self) -> io::Result<Stat>;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize>;
    fn read_dir_all(&self) -> io::Result<Vec<DirEntry>>;
}

/// The byte-storage provider the filesystem wraps. Paths are opaque
/// `/`-separated strings rooted at the backend's own namespace.
pub trait Backend: Send + Sync {
    fn open(&self, path: &str) -> io::Result<Box<dyn Handle>>;
    fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> io::Result<Box<dyn Handle>>;
    /// Create a regular empty file. Fails if the path already exists.
    fn create(&self, path: &str) -> io::Result<()>;
    /// Create a directory. Fails if the path already exists.
    fn mkdir(&self, path: &str, perm: u32) -> io::Result<()>;
    /// Remove a file or an empty directory.
    fn remove(&self, path: &str) -> io::Result<()>;
    fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()>;
    fn chmod(&self, path: &str, perm: u32) -> io::Result<()>;
    fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> io::Result<()>;
    fn stat(&self, path: &str) -> io::Result<Stat>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags_from_fuse_rdonly() {
        let f = OpenFlags::from_fuse(libc::O_RDONLY);
        assert!(f.read);
        assert!(!f.write);
        assert!(!f.append);
    }

    #[test]
    fn test_open_flags_from_fuse_wronly_trunc() {
        let f = OpenFlags::from_fuse(libc::O_WRONLY | libc::O_TRUNC);
        assert!(!f.read);
        assert!(f.write);
        assert!(f.truncate);
    }

    #[test]
    fn test_open_flags_from_fuse_rdwr_append_creat() {
        let f = OpenFlags::from_fuse(libc::O_RDWR | libc::O_APPEND | libc::O_CREAT);
        assert!(f.read);
        assert!(f.write);
        assert!(f.append);
        assert!(f.create);
    }
}
