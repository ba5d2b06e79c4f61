use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};

use crate::backend::{Backend, DirEntry, FileKind, Handle, OpenFlags, Stat};

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// One node of the in-memory tree. Contents live behind an `Arc` so open
/// handles keep the bytes reachable after the name is removed.
struct MemNode {
    kind: FileKind,
    perm: Mutex<u32>,
    times: Mutex<(SystemTime, SystemTime)>,
    content: RwLock<Vec<u8>>,
}

impl MemNode {
    fn new(kind: FileKind, perm: u32) -> Arc<Self> {
        let now = SystemTime::now();
        Arc::new(MemNode {
            kind,
            perm: Mutex::new(perm),
            times: Mutex::new((now, now)),
            content: RwLock::new(Vec::new()),
        })
    }

    fn stat(&self) -> Stat {
        let (atime, mtime) = *self.times.lock();
        Stat {
            size: self.content.read().len() as u64,
            kind: self.kind,
            perm: *self.perm.lock(),
            atime,
            mtime,
        }
    }

    fn touch(&self) {
        self.times.lock().1 = SystemTime::now();
    }
}

struct Inner {
    nodes: Mutex<HashMap<String, Arc<MemNode>>>,
}

impl Inner {
    /// Direct children of `dir`, by key prefix. The map is flat, so a
    /// child is any key one component below the directory.
    fn children_of(&self, nodes: &HashMap<String, Arc<MemNode>>, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir)
        };
        let mut names: Vec<String> = nodes
            .keys()
            .filter_map(|k| {
                let rest = k.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        names.sort();
        names
    }
}

/// Process-local backend: a flat map from absolute path to node. Used as
/// the default backend and as the fixture for dispatcher tests.
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), MemNode::new(FileKind::Directory, 0o755));
        MemoryBackend {
            inner: Arc::new(Inner {
                nodes: Mutex::new(nodes),
            }),
        }
    }

    fn parent_of(path: &str) -> &str {
        match path.rfind('/') {
            Some(0) => "/",
            Some(i) => &path[..i],
            None => "/",
        }
    }

    /// The parent must exist and be a directory before a new name can be
    /// bound under it.
    fn check_parent(nodes: &HashMap<String, Arc<MemNode>>, path: &str) -> io::Result<()> {
        let parent = Self::parent_of(path);
        match nodes.get(parent) {
            Some(node) if node.kind == FileKind::Directory => Ok(()),
            Some(_) => Err(errno(libc::ENOTDIR)),
            None => Err(errno(libc::ENOENT)),
        }
    }

    fn get(&self, path: &str) -> io::Result<Arc<MemNode>> {
        self.inner
            .nodes
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn open(&self, path: &str) -> io::Result<Box<dyn Handle>> {
        let node = self.get(path)?;
        Ok(Box::new(MemHandle {
            inner: self.inner.clone(),
            path: path.to_string(),
            node,
            append: false,
        }))
    }

    fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> io::Result<Box<dyn Handle>> {
        let node = {
            let mut nodes = self.inner.nodes.lock();
            match nodes.get(path) {
                Some(node) => {
                    if node.kind == FileKind::Directory && flags.write {
                        return Err(errno(libc::EISDIR));
                    }
                    node.clone()
                }
                None if flags.create => {
                    Self::check_parent(&nodes, path)?;
                    let node = MemNode::new(FileKind::Regular, perm & 0o7777);
                    nodes.insert(path.to_string(), node.clone());
                    node
                }
                None => return Err(errno(libc::ENOENT)),
            }
        };

        if flags.truncate {
            node.content.write().clear();
            node.touch();
        }

        Ok(Box::new(MemHandle {
            inner: self.inner.clone(),
            path: path.to_string(),
            node,
            append: flags.append,
        }))
    }

    fn create(&self, path: &str) -> io::Result<()> {
        let mut nodes = self.inner.nodes.lock();
        if nodes.contains_key(path) {
            return Err(errno(libc::EEXIST));
        }
        Self::check_parent(&nodes, path)?;
        nodes.insert(path.to_string(), MemNode::new(FileKind::Regular, 0o644));
        Ok(())
    }

    fn mkdir(&self, path: &str, perm: u32) -> io::Result<()> {
        let mut nodes = self.inner.nodes.lock();
        if nodes.contains_key(path) {
            return Err(errno(libc::EEXIST));
        }
        Self::check_parent(&nodes, path)?;
        nodes.insert(
            path.to_string(),
            MemNode::new(FileKind::Directory, perm & 0o7777),
        );
        Ok(())
    }

    fn remove(&self, path: &str) -> io::Result<()> {
        let mut nodes = self.inner.nodes.lock();
        let node = nodes.get(path).ok_or_else(|| errno(libc::ENOENT))?;
        if node.kind == FileKind::Directory && !self.inner.children_of(&nodes, path).is_empty() {
            return Err(errno(libc::ENOTEMPTY));
        }
        // Open handles still hold the node's Arc; only the name goes away.
        nodes.remove(path);
        Ok(())
    }

    fn rename(&self, old_path: &str, new_path: &str) -> io::Result<()> {
        let mut nodes = self.inner.nodes.lock();
        if !nodes.contains_key(old_path) {
            return Err(errno(libc::ENOENT));
        }
        if let Some(existing) = nodes.get(new_path) {
            if existing.kind == FileKind::Directory
                && !self.inner.children_of(&nodes, new_path).is_empty()
            {
                return Err(errno(libc::ENOTEMPTY));
            }
            nodes.remove(new_path);
        }
        Self::check_parent(&nodes, new_path)?;

        let node = nodes.remove(old_path).expect("checked above");
        let is_dir = node.kind == FileKind::Directory;
        nodes.insert(new_path.to_string(), node);

        if is_dir {
            let old_prefix = format!("{}/", old_path);
            let moved: Vec<String> = nodes
                .keys()
                .filter(|k| k.starts_with(&old_prefix))
                .cloned()
                .collect();
            for key in moved {
                let node = nodes.remove(&key).expect("key just listed");
                let new_key = format!("{}/{}", new_path, &key[old_prefix.len()..]);
                nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    fn chmod(&self, path: &str, perm: u32) -> io::Result<()> {
        let node = self.get(path)?;
        *node.perm.lock() = perm & 0o7777;
        Ok(())
    }

    fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let node = self.get(path)?;
        *node.times.lock() = (atime, mtime);
        Ok(())
    }

    fn stat(&self, path: &str) -> io::Result<Stat> {
        Ok(self.get(path)?.stat())
    }
}

struct MemHandle {
    inner: Arc<Inner>,
    path: String,
    node: Arc<MemNode>,
    append: bool,
}

impl Handle for MemHandle {
    fn stat(&self) -> io::Result<Stat> {
        Ok(self.node.stat())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if self.node.kind == FileKind::Directory {
            return Err(errno(libc::EISDIR));
        }
        let content = self.node.content.read();
        let offset = offset as usize;
        if offset >= content.len() {
            return Ok(0);
        }
        let n = buf.len().min(content.len() - offset);
        buf[..n].copy_from_slice(&content[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        if self.node.kind == FileKind::Directory {
            return Err(errno(libc::EISDIR));
        }
        let mut content = self.node.content.write();
        let offset = if self.append {
            content.len()
        } else {
            offset as usize
        };
        if offset > content.len() {
            content.resize(offset, 0);
        }
        let end = offset + data.len();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(data);
        drop(content);
        self.node.touch();
        Ok(data.len())
    }

    fn read_dir_all(&self) -> io::Result<Vec<DirEntry>> {
        if self.node.kind != FileKind::Directory {
            return Err(errno(libc::ENOTDIR));
        }
        let nodes = self.inner.nodes.lock();
        let names = self.inner.children_of(&nodes, &self.path);
        Ok(names
            .into_iter()
            .filter_map(|name| {
                let key = if self.path == "/" {
                    format!("/{}", name)
                } else {
                    format!("{}/{}", self.path, name)
                };
                let stat = nodes.get(&key)?.stat();
                Some(DirEntry { name, stat })
            })
            .collect())
    }
}
