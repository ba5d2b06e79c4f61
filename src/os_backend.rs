use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::time::SystemTime;

use filetime::FileTime;

use crate::backend::{Backend, DirEntry, FileKind, Handle, OpenFlags, Stat};

fn stat_from_metadata(metadata: &fs::Metadata) -> Stat {
    let now = SystemTime::now();
    let kind = if metadata.is_dir() {
        FileKind::Directory
    } else if metadata.file_type().is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::Regular
    };

    Stat {
        size: metadata.len(),
        kind,
        perm: metadata.mode() & 0o7777,
        atime: metadata.accessed().unwrap_or(now),
        mtime: metadata.modified().unwrap_or(now),
    }
}

/// A host directory as backend namespace. Backend paths are resolved
/// below the base directory; `/` maps to the base itself.
pub struct OsBackend {
    base: PathBuf,
}

impl OsBackend {
    pub fn new(base: PathBuf) -> Self {
        OsBackend { base }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base.join(path.trim_start_matches('/'))
    }
}

impl Backend for OsBackend {
    fn open(&self, path: &str) -> io::Result<Box<dyn Handle>> {
        let full = self.full_path(path);
        let metadata = fs::symlink_metadata(&full)?;
        let file = if metadata.is_dir() {
            None
        } else {
            Some(File::open(&full)?)
        };
        Ok(Box::new(OsHandle { path: full, file }))
    }

    fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> io::Result<Box<dyn Handle>> {
        let full = self.full_path(path);
        let file = OpenOptions::new()
            .read(flags.read)
            .write(flags.write)
            .append(flags.append)
            .create(flags.create)
            .truncate(flags.truncate)
            .mode(perm)
            .open(&full)?;
        Ok(Box::new(OsHandle {
            path: full,
            file: Some(file),
        }))
    }

    fn create(&self, path: &str) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.full_path(path))?;
        Ok(())
    }

    fn mkdir(&self, path: &str, perm: u32) -> io::Result<()> {
        DirBuilder::new()
            .mode(perm & 0o7777)
            .create(self.full_path(path))
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let full = self.full_path(path);
        if fs::symlink_metadata(&full)?.is_dir() {
            fs::remove_dir(&full)
        } else {
            fs::remove_file(&full)
        }
    }

    fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        fs::rename(self.full_path(old_path), self.full_path(new_path))
    }

    fn chmod(&self, path: &str, perm: u32) -> io::Result<()> {
        fs::set_permissions(
            self.full_path(path),
            fs::Permissions::from_mode(perm & 0o7777),
        )
    }

    fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        filetime::set_file_times(
            self.full_path(path),
            FileTime::from_system_time(atime),
            FileTime::from_system_time(mtime),
        )
    }

    fn stat(&self, path: &str) -> io::Result<Stat> {
        let metadata = fs::symlink_metadata(self.full_path(path))?;
        Ok(stat_from_metadata(&metadata))
    }
}

/// Per-operation handle onto the host filesystem. Directories carry no
/// open file descriptor; listings re-open the path.
struct OsHandle {
    path: PathBuf,
    file: Option<File>,
}

impl OsHandle {
    fn file(&self) -> io::Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EISDIR))
    }
}

impl Handle for OsHandle {
    fn stat(&self) -> io::Result<Stat> {
        let metadata = match &self.file {
            Some(file) => file.metadata()?,
            None => fs::symlink_metadata(&self.path)?,
        };
        Ok(stat_from_metadata(&metadata))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file()?.read_at(buf, offset)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        self.file()?.write_at(data, offset)
    }

    fn read_dir_all(&self) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let metadata = fs::symlink_metadata(entry.path())?;
            entries.push(DirEntry {
                name,
                stat: stat_from_metadata(&metadata),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, OsBackend) {
        let dir = TempDir::new().unwrap();
        let backend = OsBackend::new(dir.path().to_path_buf());
        (dir, backend)
    }

    #[test]
    fn test_root_maps_to_base() {
        let (dir, backend) = setup();
        assert_eq!(backend.full_path("/"), dir.path());
        assert_eq!(backend.full_path("/a/b"), dir.path().join("a/b"));
    }

    #[test]
    fn test_create_write_read_roundtrip() {
        let (_dir, backend) = setup();
        backend.create("/f.txt").unwrap();

        let h = backend
            .open_file("/f.txt", OpenFlags::write_only(), 0o644)
            .unwrap();
        h.write_at(b"Hello\0world", 0).unwrap();
        drop(h);

        assert_eq!(backend.stat("/f.txt").unwrap().size, 11);

        let h = backend.open("/f.txt").unwrap();
        let mut buf = [0u8; 32];
        let n = h.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"Hello\0world");
    }

    #[test]
    fn test_create_existing_fails() {
        let (_dir, backend) = setup();
        backend.create("/f").unwrap();
        assert!(backend.create("/f").is_err());
    }

    #[test]
    fn test_mkdir_applies_mode() {
        let (_dir, backend) = setup();
        backend.mkdir("/sub", 0o754).unwrap();

        let stat = backend.stat("/sub").unwrap();
        assert!(stat.is_dir());
        assert_eq!(stat.perm & 0o777, 0o754);
    }

    #[test]
    fn test_read_dir_all_sorted_with_kinds() {
        let (_dir, backend) = setup();
        backend.mkdir("/d", 0o755).unwrap();
        backend.create("/b").unwrap();
        backend.create("/a").unwrap();

        let entries = backend.open("/").unwrap().read_dir_all().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "d"]);
        assert_eq!(entries[2].stat.kind, FileKind::Directory);
        assert_eq!(entries[0].stat.kind, FileKind::Regular);
    }

    #[test]
    fn test_rename_and_remove() {
        let (_dir, backend) = setup();
        backend.create("/old").unwrap();
        backend.rename("/old", "/new").unwrap();
        assert!(backend.stat("/old").is_err());

        backend.remove("/new").unwrap();
        assert!(backend.stat("/new").is_err());
    }

    #[test]
    fn test_remove_nonempty_dir_fails() {
        let (_dir, backend) = setup();
        backend.mkdir("/d", 0o755).unwrap();
        backend.create("/d/f").unwrap();
        assert!(backend.remove("/d").is_err());
    }

    #[test]
    fn test_chmod() {
        let (_dir, backend) = setup();
        backend.create("/f").unwrap();
        backend.chmod("/f", 0o754).unwrap();
        assert_eq!(backend.stat("/f").unwrap().perm & 0o777, 0o754);
    }

    #[test]
    fn test_chtimes() {
        let (_dir, backend) = setup();
        backend.create("/f").unwrap();

        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        backend.chtimes("/f", when, when).unwrap();
        assert_eq!(backend.stat("/f").unwrap().mtime, when);
    }

    #[test]
    fn test_handle_survives_unlink() {
        let (_dir, backend) = setup();
        backend.create("/f").unwrap();

        let flags = OpenFlags {
            read: true,
            write: true,
            ..Default::default()
        };
        let h = backend.open_file("/f", flags, 0o600).unwrap();
        h.write_at(b"tux", 0).unwrap();

        backend.remove("/f").unwrap();

        let mut buf = [0u8; 8];
        let n = h.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"tux");
        h.write_at(b"burrito", 3).unwrap();
        assert_eq!(h.stat().unwrap().size, 10);
    }
}
