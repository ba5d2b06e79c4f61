use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::backend::{Backend, OpenFlags};
use crate::error::FsError;
use crate::index::InodeIndex;
use crate::inode::{attr_from_stat, Dirent, DirentKind, Inode};
use crate::paths::{inode_id, join_path};

/// Replies carrying attributes tell the kernel it may cache them for as
/// long as it wants; nothing mutates them behind its back.
const ATTR_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const BLOCK_SIZE: u64 = 512;

/// The FUSE-facing filesystem server: resolves parent-id + name requests
/// against the inode index and forwards storage effects to the backend.
/// One mutex over the whole index serializes every operation, reads
/// included; all index mutations land before a reply is sent.
pub struct PolyFS {
    backend: Arc<dyn Backend>,
    index: Mutex<InodeIndex>,
    uid: u32,
    gid: u32,
}

fn dirent_kind(inode: &Inode) -> DirentKind {
    if inode.is_dir() {
        DirentKind::Directory
    } else if inode.is_symlink() {
        DirentKind::Symlink
    } else {
        DirentKind::File
    }
}

fn decode_name(name: &OsStr) -> Result<&str, FsError> {
    name.to_str().ok_or(FsError::InvalidArgument)
}

fn blocks(size: u64) -> u64 {
    (size + BLOCK_SIZE - 1) / BLOCK_SIZE
}

impl PolyFS {
    /// Build the index from the backend root and wrap it into a server.
    /// Runs before the mount goes live.
    pub fn new(backend: Arc<dyn Backend>, root: &str, uid: u32, gid: u32) -> Result<Self, FsError> {
        let index = InodeIndex::build(backend.as_ref(), root, uid, gid)?;
        Ok(PolyFS {
            backend,
            index: Mutex::new(index),
            uid,
            gid,
        })
    }

    /// Resolve `name` under `parent` by listing the backend directory,
    /// falling back to the parent's own entry list for names that exist
    /// only at the index level (hard-link aliases).
    ///
    /// The identifier comes from the parent's entry list when the child is
    /// indexed (a renamed child keeps its original id there) and from the
    /// path hash otherwise. The handler never inserts into the index; the
    /// kernel may hold references whose ids are pure path derivations.
    pub fn look_up_inode(&self, parent: u64, name: &str) -> Result<(u64, FileAttr), FsError> {
        let index = self.index.lock();
        let parent_inode = index.get_checked(parent)?;

        let children = self.backend.open(&parent_inode.path)?.read_dir_all()?;
        if let Some(child) = children.into_iter().find(|c| c.name == name) {
            let child_path = join_path(&parent_inode.path, &child.name);
            let id = match parent_inode.look_up_child(name) {
                Some((id, _)) => id,
                None => inode_id(&child_path),
            };

            let mut attr = attr_from_stat(id, &child.stat, self.uid, self.gid);
            if let Some(inode) = index.get(id) {
                attr.nlink = inode.attr.nlink;
            }
            return Ok((id, attr));
        }

        // A hard-link alias never reaches the backend namespace; its
        // dirent points at the target inode, so stat the target's path.
        let (id, _) = parent_inode
            .look_up_child(name)
            .ok_or(FsError::NotFound)?;
        let target = index.get_checked(id)?;
        let stat = self.backend.open(&target.path)?.stat()?;
        let mut attr = attr_from_stat(id, &stat, self.uid, self.gid);
        attr.nlink = target.attr.nlink;
        Ok((id, attr))
    }

    /// Freshly stat the inode's backend object; size comes from the stat,
    /// ownership from the configured uid/gid. Unknown ids are an index
    /// invariant violation.
    pub fn get_inode_attributes(&self, ino: u64) -> Result<FileAttr, FsError> {
        let mut index = self.index.lock();
        let inode = index.get_checked(ino)?;

        let stat = self.backend.open(&inode.path)?.stat()?;
        let mut attr = attr_from_stat(ino, &stat, self.uid, self.gid);
        attr.nlink = inode.attr.nlink;

        index.get_mut_checked(ino)?.attr = attr;
        Ok(attr)
    }

    /// Apply the requested attribute changes. Truncation to a non-zero
    /// size without an open handle is rejected; open-with-truncate is the
    /// sanctioned path. Size changes touch only the cached block.
    pub fn set_inode_attributes(
        &self,
        ino: u64,
        size: Option<u64>,
        mode: Option<u32>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        has_handle: bool,
    ) -> Result<FileAttr, FsError> {
        let mut index = self.index.lock();

        if let Some(size) = size {
            if !has_handle && size != 0 {
                return Err(FsError::BadHandle);
            }
        }

        let path = index.get_checked(ino)?.path.clone();
        if let Some(mode) = mode {
            self.backend.chmod(&path, mode)?;
        }
        if let (Some(atime), Some(mtime)) = (atime, mtime) {
            self.backend.chtimes(&path, atime, mtime)?;
        }

        let inode = index.get_mut_checked(ino)?;
        if let Some(size) = size {
            inode.attr.size = size;
            inode.attr.blocks = blocks(size);
        }
        if let Some(mode) = mode {
            inode.attr.perm = (mode & 0o7777) as u16;
        }
        if let Some(atime) = atime {
            inode.attr.atime = atime;
        }
        if let Some(mtime) = mtime {
            inode.attr.mtime = mtime;
        }
        inode.attr.ctime = SystemTime::now();
        Ok(inode.attr)
    }

    pub fn make_dir(&self, parent: u64, name: &str, mode: u32) -> Result<(u64, FileAttr), FsError> {
        let mut index = self.index.lock();
        let parent_inode = index.get_checked(parent)?;
        if parent_inode.look_up_child(name).is_some() {
            return Err(FsError::Exists);
        }

        let new_path = join_path(&parent_inode.path, name);
        self.backend.mkdir(&new_path, mode & 0o7777)?;

        let id = inode_id(&new_path);
        let attr = self.fresh_attr(id, mode, FileType::Directory);
        index.insert(Inode::new(id, name, &new_path, attr));
        index
            .get_mut_checked(parent)?
            .add_child(id, name, DirentKind::Directory);
        Ok((id, attr))
    }

    /// mknod: create the backend file, leaving its permissions to the
    /// backend's default.
    pub fn make_node(&self, parent: u64, name: &str, mode: u32) -> Result<(u64, FileAttr), FsError> {
        self.create_entry(parent, name, mode, false)
    }

    /// createfile: create the backend file and fix its permission bits.
    pub fn create_file(&self, parent: u64, name: &str, mode: u32) -> Result<(u64, FileAttr), FsError> {
        self.create_entry(parent, name, mode, true)
    }

    fn create_entry(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        fix_perm: bool,
    ) -> Result<(u64, FileAttr), FsError> {
        let mut index = self.index.lock();
        let parent_inode = index.get_checked(parent)?;
        if parent_inode.look_up_child(name).is_some() {
            return Err(FsError::Exists);
        }

        let new_path = join_path(&parent_inode.path, name);
        self.backend.create(&new_path)?;
        if fix_perm {
            self.backend.chmod(&new_path, mode & 0o7777)?;
        }

        let id = inode_id(&new_path);
        let attr = self.fresh_attr(id, mode, FileType::RegularFile);
        index.insert(Inode::new(id, name, &new_path, attr));
        index
            .get_mut_checked(parent)?
            .add_child(id, name, DirentKind::File);
        Ok((id, attr))
    }

    fn fresh_attr(&self, id: u64, mode: u32, kind: FileType) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino: id,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: (mode & 0o7777) as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            flags: 0,
            blksize: BLOCK_SIZE as u32,
        }
    }

    /// Move a child between directories. The moving inode keeps its
    /// identifier so kernel references stay valid, even though the hash of
    /// the new path would differ.
    pub fn rename(
        &self,
        old_parent: u64,
        old_name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> Result<(), FsError> {
        let mut index = self.index.lock();

        let old_path = join_path(&index.get_checked(old_parent)?.path, old_name);
        let new_path = join_path(&index.get_checked(new_parent)?.path, new_name);

        // Resolve and validate against the index before the backend call,
        // so a refusal never leaves the backend ahead of the index.
        let (child_id, child_kind) = index
            .get_checked(old_parent)?
            .look_up_child(old_name)
            .ok_or(FsError::NotFound)?;

        // A live target is replaced unless it is a non-empty directory.
        let replaced = match index.get_checked(new_parent)?.look_up_child(new_name) {
            Some((existing_id, _)) if existing_id != child_id => {
                let existing = index.get_checked(existing_id)?;
                if existing.is_dir() && existing.live_children() > 0 {
                    return Err(FsError::NotEmpty);
                }
                Some(existing_id)
            }
            _ => None,
        };

        self.backend.rename(&old_path, &new_path)?;

        if let Some(existing_id) = replaced {
            index.get_mut_checked(new_parent)?.remove_child(new_name)?;
            index.remove(existing_id);
        }

        let child = index.get_mut_checked(child_id)?;
        let old_child_path = child.path.clone();
        let was_dir = child.is_dir();
        child.path = new_path.clone();
        child.name = new_name.to_string();
        child.attr.ctime = SystemTime::now();
        if was_dir {
            index.rewrite_paths(&old_child_path, &new_path);
        }

        index
            .get_mut_checked(new_parent)?
            .add_child(child_id, new_name, child_kind);
        index.get_mut_checked(old_parent)?.remove_child(old_name)?;
        Ok(())
    }

    pub fn remove_dir(&self, parent: u64, name: &str) -> Result<(), FsError> {
        let mut index = self.index.lock();
        let (child_id, _) = index
            .get_checked(parent)?
            .look_up_child(name)
            .ok_or(FsError::NotFound)?;

        let child = index.get_checked(child_id)?;
        if !child.is_dir() {
            return Err(FsError::Backend(std::io::Error::from_raw_os_error(
                libc::ENOTDIR,
            )));
        }
        if child.live_children() > 0 {
            return Err(FsError::NotEmpty);
        }

        // The backend's own refusal of a non-empty directory stays in
        // effect as a secondary check.
        let child_path = child.path.clone();
        self.backend.remove(&child_path)?;

        index.get_mut_checked(parent)?.remove_child(name)?;
        index.remove(child_id);
        Ok(())
    }

    /// Unlink one name. The backend object is removed only when the last
    /// link goes; open handles keep the bytes readable either way.
    pub fn unlink(&self, parent: u64, name: &str) -> Result<(), FsError> {
        let mut index = self.index.lock();
        let (child_id, _) = index
            .get_checked(parent)?
            .look_up_child(name)
            .ok_or(FsError::NotFound)?;

        let child = index.get_checked(child_id)?;
        let remaining = child.attr.nlink.saturating_sub(1);
        let child_path = child.path.clone();

        if remaining == 0 {
            self.backend.remove(&child_path)?;
        }

        index.get_mut_checked(parent)?.remove_child(name)?;
        if remaining == 0 {
            index.remove(child_id);
        } else {
            let child = index.get_mut_checked(child_id)?;
            child.attr.nlink = remaining;
            child.attr.ctime = SystemTime::now();
        }
        Ok(())
    }

    /// Open and stat the inode's backend object, refusing a type
    /// mismatch. No per-handle state is kept; subsequent reads and writes
    /// go by inode id, and the backend handle dies with this call.
    pub fn open_inode(&self, ino: u64, want_dir: bool) -> Result<(), FsError> {
        let index = self.index.lock();
        let inode = index.get_checked(ino)?;
        let stat = self.backend.open(&inode.path)?.stat()?;
        if stat.is_dir() != want_dir {
            return Err(FsError::internal(format!(
                "{} opened as {}",
                inode.path,
                if want_dir { "directory" } else { "file" }
            )));
        }
        Ok(())
    }

    /// Live entries of a directory starting at `offset` (a slot cursor the
    /// kernel got from a previous batch). Tombstones consume slots but are
    /// never returned.
    pub fn read_dir_entries(&self, ino: u64, offset: i64) -> Result<Vec<Dirent>, FsError> {
        let index = self.index.lock();
        let inode = index.get_checked(ino)?;
        if !inode.is_dir() {
            return Err(FsError::internal(format!(
                "read_dir on non-directory {}",
                inode.path
            )));
        }
        Ok(inode
            .entries
            .iter()
            .skip(offset.max(0) as usize)
            .filter(|e| e.is_live())
            .cloned()
            .collect())
    }

    /// A short read at end-of-file is success with a short count.
    pub fn read_file(&self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>, FsError> {
        let index = self.index.lock();
        let inode = index.get_checked(ino)?;
        if !inode.is_file() {
            return Err(FsError::internal(format!(
                "read from non-file {}",
                inode.path
            )));
        }
        let path = inode.path.clone();

        let handle = self.backend.open(&path)?;
        let mut buf = vec![0u8; size as usize];
        let n = handle.read_at(&mut buf, offset.max(0) as u64)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write_file(&self, ino: u64, offset: i64, data: &[u8]) -> Result<u32, FsError> {
        let mut index = self.index.lock();
        let inode = index.get_checked(ino)?;
        if !inode.is_file() {
            return Err(FsError::internal(format!(
                "write to non-file {}",
                inode.path
            )));
        }
        let path = inode.path.clone();

        let written = {
            let handle = self
                .backend
                .open_file(&path, OpenFlags::write_only(), 0o644)?;
            handle.write_at(data, offset.max(0) as u64)?
            // handle drops here, releasing the backend object
        };

        let inode = index.get_mut_checked(ino)?;
        let end = offset.max(0) as u64 + written as u64;
        if end > inode.attr.size {
            inode.attr.size = end;
            inode.attr.blocks = blocks(end);
        }
        inode.attr.mtime = SystemTime::now();
        Ok(written as u32)
    }

    /// Hard-link an existing inode under a new name. Pure index aliasing;
    /// the backend never sees it.
    pub fn create_link(&self, parent: u64, target: u64, name: &str) -> Result<FileAttr, FsError> {
        let mut index = self.index.lock();
        if index.get_checked(parent)?.look_up_child(name).is_some() {
            return Err(FsError::Exists);
        }

        let target_inode = index.get_mut_checked(target)?;
        target_inode.attr.nlink += 1;
        target_inode.attr.ctime = SystemTime::now();
        let attr = target_inode.attr;
        let kind = dirent_kind(target_inode);

        index.get_mut_checked(parent)?.add_child(target, name, kind);
        Ok(attr)
    }

    fn gate(req: &Request<'_>) -> Result<(), FsError> {
        if req.pid() == 0 {
            Err(FsError::InvalidArgument)
        } else {
            Ok(())
        }
    }
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for PolyFS {
    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name_str = name.to_str().unwrap_or("<invalid>");
        let _span = tracing::debug_span!("fuse::lookup", parent, name = %name_str).entered();

        let result = Self::gate(req)
            .and_then(|_| decode_name(name))
            .and_then(|name| self.look_up_inode(parent, name));
        match result {
            Ok((_, attr)) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => {
                debug!("lookup failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn getattr(&mut self, req: &Request, ino: u64, reply: ReplyAttr) {
        let _span = tracing::debug_span!("fuse::getattr", ino).entered();

        let result = Self::gate(req).and_then(|_| self.get_inode_attributes(ino));
        match result {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => {
                debug!("getattr failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let _span = tracing::debug_span!("fuse::setattr", ino, ?size, ?mode).entered();

        let result = Self::gate(req).and_then(|_| {
            // Ownership is fixed by configuration; chown is unsupported.
            if uid.is_some() || gid.is_some() {
                return Err(FsError::InvalidArgument);
            }
            self.set_inode_attributes(
                ino,
                size,
                mode,
                atime.map(time_or_now),
                mtime.map(time_or_now),
                fh.is_some(),
            )
        });
        match result {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => {
                debug!("setattr failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let name_str = name.to_str().unwrap_or("<invalid>");
        let _span =
            tracing::debug_span!("fuse::mknod", parent, name = %name_str, mode = %format!("{:o}", mode))
                .entered();

        let result = Self::gate(req)
            .and_then(|_| decode_name(name))
            .and_then(|name| self.make_node(parent, name, mode));
        match result {
            Ok((_, attr)) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => {
                debug!("mknod failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name_str = name.to_str().unwrap_or("<invalid>");
        let _span =
            tracing::debug_span!("fuse::mkdir", parent, name = %name_str, mode = %format!("{:o}", mode))
                .entered();

        let result = Self::gate(req)
            .and_then(|_| decode_name(name))
            .and_then(|name| self.make_dir(parent, name, mode));
        match result {
            Ok((_, attr)) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => {
                debug!("mkdir failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name_str = name.to_str().unwrap_or("<invalid>");
        let _span =
            tracing::debug_span!("fuse::create", parent, name = %name_str, mode = %format!("{:o}", mode))
                .entered();

        let result = Self::gate(req)
            .and_then(|_| decode_name(name))
            .and_then(|name| self.create_file(parent, name, mode));
        match result {
            // No per-handle state: fh 0, reads and writes resolve by inode
            Ok((_, attr)) => reply.created(&ATTR_TTL, &attr, 0, 0, flags as u32),
            Err(e) => {
                debug!("create failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn rename(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name_str = name.to_str().unwrap_or("<invalid>");
        let newname_str = newname.to_str().unwrap_or("<invalid>");
        let _span =
            tracing::debug_span!("fuse::rename", parent, name = %name_str, newparent, newname = %newname_str)
                .entered();

        let result = Self::gate(req).and_then(|_| {
            let name = decode_name(name)?;
            let newname = decode_name(newname)?;
            PolyFS::rename(self, parent, name, newparent, newname)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!("rename failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name_str = name.to_str().unwrap_or("<invalid>");
        let _span = tracing::debug_span!("fuse::rmdir", parent, name = %name_str).entered();

        let result = Self::gate(req)
            .and_then(|_| decode_name(name))
            .and_then(|name| self.remove_dir(parent, name));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                debug!("rmdir failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name_str = name.to_str().unwrap_or("<invalid>");
        let _span = tracing::debug_span!("fuse::unlink", parent, name = %name_str).entered();

        let result = Self::gate(req)
            .and_then(|_| decode_name(name))
            .and_then(|name| PolyFS::unlink(self, parent, name));
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                debug!("unlink failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn link(
        &mut self,
        req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let name_str = newname.to_str().unwrap_or("<invalid>");
        let _span = tracing::debug_span!("fuse::link", ino, newparent, name = %name_str).entered();

        let result = Self::gate(req)
            .and_then(|_| decode_name(newname))
            .and_then(|name| self.create_link(newparent, ino, name));
        match result {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => {
                debug!("link failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let _span = tracing::debug_span!("fuse::open", ino, flags).entered();

        let result = Self::gate(req).and_then(|_| self.open_inode(ino, false));
        match result {
            Ok(()) => reply.opened(0, 0),
            Err(e) => {
                debug!("open failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn opendir(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let _span = tracing::debug_span!("fuse::opendir", ino, flags).entered();

        let result = Self::gate(req).and_then(|_| self.open_inode(ino, true));
        match result {
            Ok(()) => reply.opened(0, 0),
            Err(e) => {
                debug!("opendir failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn read(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let _span = tracing::debug_span!("fuse::read", ino, offset, size).entered();

        let result = Self::gate(req).and_then(|_| self.read_file(ino, offset, size));
        match result {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn write(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let _span = tracing::debug_span!("fuse::write", ino, offset, len = data.len()).entered();

        let result = Self::gate(req).and_then(|_| self.write_file(ino, offset, data));
        match result {
            Ok(written) => reply.written(written),
            Err(e) => {
                error!("write failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn readdir(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let _span = tracing::debug_span!("fuse::readdir", ino, offset).entered();

        let result = Self::gate(req).and_then(|_| self.read_dir_entries(ino, offset));
        match result {
            Ok(entries) => {
                for entry in entries {
                    // Stop when the next record would not fit
                    if reply.add(
                        entry.ino,
                        entry.offset,
                        entry.kind.as_file_type(),
                        &entry.name,
                    ) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => {
                debug!("readdir failed: {}", e);
                reply.error(e.errno());
            }
        }
    }

    fn release(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let _span = tracing::trace_span!("fuse::release", ino).entered();
        match Self::gate(req) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn releasedir(&mut self, req: &Request, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        let _span = tracing::trace_span!("fuse::releasedir", ino).entered();
        match Self::gate(req) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, req: &Request, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let _span = tracing::trace_span!("fuse::flush", ino).entered();
        match Self::gate(req) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    // The remaining operations are accepted so the kernel's routine probes
    // never see ENOSYS; they log and succeed without observable effect.

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let name_str = link_name.to_str().unwrap_or("<invalid>");
        let _span =
            tracing::debug_span!("fuse::symlink", parent, name = %name_str, target = ?target).entered();

        if let Err(e) = Self::gate(req) {
            reply.error(e.errno());
            return;
        }
        debug!("symlink accepted without effect");
        let id = {
            let index = self.index.lock();
            match index.get_checked(parent) {
                Ok(p) => inode_id(&join_path(&p.path, name_str)),
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            }
        };
        let attr = self.fresh_attr(id, 0o777, FileType::Symlink);
        reply.entry(&ATTR_TTL, &attr, 0);
    }

    fn readlink(&mut self, req: &Request, ino: u64, reply: ReplyData) {
        let _span = tracing::debug_span!("fuse::readlink", ino).entered();
        match Self::gate(req) {
            Ok(()) => reply.data(&[]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getxattr(
        &mut self,
        req: &Request,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let name_str = name.to_str().unwrap_or("<invalid>");
        let _span = tracing::trace_span!("fuse::getxattr", ino, name = %name_str).entered();
        match Self::gate(req) {
            Ok(()) if size == 0 => reply.size(0),
            Ok(()) => reply.data(&[]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn listxattr(&mut self, req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let _span = tracing::trace_span!("fuse::listxattr", ino).entered();
        match Self::gate(req) {
            Ok(()) if size == 0 => reply.size(0),
            Ok(()) => reply.data(&[]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request,
        ino: u64,
        name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name_str = name.to_str().unwrap_or("<invalid>");
        let _span = tracing::trace_span!("fuse::setxattr", ino, name = %name_str).entered();
        match Self::gate(req) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn removexattr(&mut self, req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name_str = name.to_str().unwrap_or("<invalid>");
        let _span = tracing::trace_span!("fuse::removexattr", ino, name = %name_str).entered();
        match Self::gate(req) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fallocate(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        let _span = tracing::trace_span!("fuse::fallocate", ino, offset, length).entered();
        match Self::gate(req) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let _span = tracing::trace_span!("fuse::access", ino).entered();
        match Self::gate(req) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }
}
