use std::collections::HashMap;

use tracing::debug;

use crate::backend::Backend;
use crate::error::FsError;
use crate::inode::{attr_from_stat, Inode};
use crate::paths::{inode_id, join_path, ROOT_INO};

/// Process-wide mapping from inode identifier to inode object. The root
/// always lives under the reserved id and is always a directory.
#[derive(Debug)]
pub struct InodeIndex {
    inodes: HashMap<u64, Inode>,
    root_path: String,
}

impl InodeIndex {
    /// One-shot mount-time builder: stat the backend root, insert it under
    /// the reserved id, then recursively register every entry reachable
    /// from it. Runs single-threaded before the mount goes live.
    pub fn build(backend: &dyn Backend, root: &str, uid: u32, gid: u32) -> Result<Self, FsError> {
        let root_stat = backend.stat(root)?;
        if !root_stat.is_dir() {
            return Err(FsError::internal(format!(
                "backend root {} is not a directory",
                root
            )));
        }

        let mut index = InodeIndex {
            inodes: HashMap::new(),
            root_path: root.to_string(),
        };

        let attr = attr_from_stat(ROOT_INO, &root_stat, uid, gid);
        index
            .inodes
            .insert(ROOT_INO, Inode::new(ROOT_INO, "", root, attr));

        index.walk(backend, ROOT_INO, uid, gid)?;
        debug!(entries = index.inodes.len(), "index built");
        Ok(index)
    }

    fn walk(
        &mut self,
        backend: &dyn Backend,
        dir_id: u64,
        uid: u32,
        gid: u32,
    ) -> Result<(), FsError> {
        let dir_path = self
            .inodes
            .get(&dir_id)
            .map(|i| i.path.clone())
            .ok_or_else(|| FsError::internal(format!("unknown inode: {}", dir_id)))?;

        let children = backend.open(&dir_path)?.read_dir_all()?;

        for child in children {
            let child_path = join_path(&dir_path, &child.name);
            let id = inode_id(&child_path);
            let attr = attr_from_stat(id, &child.stat, uid, gid);
            self.inodes
                .insert(id, Inode::new(id, &child.name, &child_path, attr));

            if let Some(parent) = self.inodes.get_mut(&dir_id) {
                parent.add_child(id, &child.name, child.stat.kind.into());
            }

            if child.stat.is_dir() {
                self.walk(backend, id, uid, gid)?;
            }
        }

        Ok(())
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn get(&self, id: u64) -> Option<&Inode> {
        self.inodes.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Inode> {
        self.inodes.get_mut(&id)
    }

    /// Resolve an id that handlers require to be present. A miss is an
    /// index invariant violation, not a user error.
    pub fn get_checked(&self, id: u64) -> Result<&Inode, FsError> {
        self.inodes
            .get(&id)
            .ok_or_else(|| FsError::internal(format!("unknown inode: {}", id)))
    }

    pub fn get_mut_checked(&mut self, id: u64) -> Result<&mut Inode, FsError> {
        self.inodes
            .get_mut(&id)
            .ok_or_else(|| FsError::internal(format!("unknown inode: {}", id)))
    }

    pub fn insert(&mut self, inode: Inode) {
        self.inodes.insert(inode.id, inode);
    }

    pub fn remove(&mut self, id: u64) -> Option<Inode> {
        self.inodes.remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// Rewrite the cached path of every inode under `old_prefix` after a
    /// directory rename, so path derivation stays valid for subtrees.
    pub fn rewrite_paths(&mut self, old_prefix: &str, new_prefix: &str) {
        let old_dir = format!("{}/", old_prefix);
        for inode in self.inodes.values_mut() {
            if let Some(rest) = inode.path.strip_prefix(&old_dir) {
                inode.path = format!("{}/{}", new_prefix, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OpenFlags;
    use crate::memory_backend::MemoryBackend;

    fn populated_backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.mkdir("/docs", 0o755).unwrap();
        backend.mkdir("/docs/nested", 0o700).unwrap();
        backend.create("/docs/readme.txt").unwrap();
        backend.create("/docs/nested/deep.txt").unwrap();
        backend.create("/top.txt").unwrap();
        backend
    }

    #[test]
    fn test_build_registers_whole_tree() {
        let backend = populated_backend();
        let index = InodeIndex::build(&backend, "/", 1000, 1000).unwrap();

        // root + 2 dirs + 3 files
        assert_eq!(index.len(), 6);

        let root = index.get(ROOT_INO).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.live_children(), 2);

        let (docs_id, _) = root.look_up_child("docs").unwrap();
        assert_eq!(docs_id, inode_id("/docs"));
        let docs = index.get(docs_id).unwrap();
        assert_eq!(docs.path, "/docs");
        assert_eq!(docs.live_children(), 2);

        let (nested_id, _) = docs.look_up_child("nested").unwrap();
        let nested = index.get(nested_id).unwrap();
        assert_eq!(nested.path, "/docs/nested");
        assert!(nested.look_up_child("deep.txt").is_some());
    }

    #[test]
    fn test_every_non_root_inode_has_exactly_one_parent_dirent() {
        let backend = populated_backend();
        let index = InodeIndex::build(&backend, "/", 1000, 1000).unwrap();

        for inode in index.inodes.values() {
            if inode.id == ROOT_INO {
                continue;
            }
            let parents: usize = index
                .inodes
                .values()
                .map(|p| {
                    p.entries
                        .iter()
                        .filter(|e| e.is_live() && e.ino == inode.id)
                        .count()
                })
                .sum();
            assert_eq!(parents, 1, "inode {} ({})", inode.id, inode.path);
        }
    }

    #[test]
    fn test_build_rejects_file_root() {
        let backend = MemoryBackend::new();
        backend.create("/file").unwrap();
        let err = InodeIndex::build(&backend, "/file", 0, 0).unwrap_err();
        assert_eq!(err.errno(), 5);
    }

    #[test]
    fn test_rewrite_paths_moves_subtree() {
        let backend = populated_backend();
        let mut index = InodeIndex::build(&backend, "/", 1000, 1000).unwrap();

        let nested_id = inode_id("/docs/nested");
        let deep_id = inode_id("/docs/nested/deep.txt");

        index.rewrite_paths("/docs", "/archive");

        assert_eq!(index.get(nested_id).unwrap().path, "/archive/nested");
        assert_eq!(index.get(deep_id).unwrap().path, "/archive/nested/deep.txt");
        // Unrelated paths stay put
        assert_eq!(index.get(inode_id("/top.txt")).unwrap().path, "/top.txt");
    }

    #[test]
    fn test_build_reads_file_sizes() {
        let backend = MemoryBackend::new();
        backend.create("/data.bin").unwrap();
        backend
            .open_file("/data.bin", OpenFlags::write_only(), 0o644)
            .unwrap()
            .write_at(b"hello", 0)
            .unwrap();

        let index = InodeIndex::build(&backend, "/", 1000, 1000).unwrap();
        let inode = index.get(inode_id("/data.bin")).unwrap();
        assert_eq!(inode.attr.size, 5);
        assert_eq!(inode.attr.uid, 1000);
    }
}
