use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// The kernel's fixed id for the filesystem root.
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

/// Join a parent path and a child name into the child's absolute path
/// inside the backend namespace. Joining at the root (`/`) produces a
/// doubled separator; collapse it so no stored path ever contains `//`.
pub fn join_path(parent: &str, name: &str) -> String {
    let joined = format!("{}/{}", parent, name);
    match joined.strip_prefix("//") {
        Some(rest) => format!("/{}", rest),
        None => joined,
    }
}

fn hash_data<T: Hash>(data: T) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

/// Derive the inode identifier for a path.
///
/// Deterministic within a process run. The reserved root id is never
/// produced for a derived path: a colliding digest is perturbed by a fixed
/// constant. Distinct paths may still collide with each other; the index
/// lookup is by identifier, so a collision would mis-route a request.
pub fn inode_id(path: &str) -> u64 {
    let h = hash_data(path.as_bytes());
    if h == ROOT_INO {
        h ^ 0x9e3779b97f4a7c15
    } else {
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_at_root_collapses_separator() {
        assert_eq!(join_path("/", "dir"), "/dir");
    }

    #[test]
    fn test_join_below_root() {
        assert_eq!(join_path("/parent", "dir"), "/parent/dir");
        assert_eq!(join_path("/a/b", "c.txt"), "/a/b/c.txt");
    }

    #[test]
    fn test_inode_id_deterministic() {
        assert_eq!(inode_id("/foo/bar"), inode_id("/foo/bar"));
    }

    #[test]
    fn test_inode_id_differs_per_path() {
        assert_ne!(inode_id("/foo"), inode_id("/bar"));
    }

    #[test]
    fn test_inode_id_never_root() {
        for name in ["/", "/a", "/a/b", "/test.txt", ""] {
            assert_ne!(inode_id(name), ROOT_INO);
        }
    }
}
