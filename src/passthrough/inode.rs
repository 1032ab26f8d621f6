//! Inode records and the inode table.
//!
//! Every backing-filesystem object the kernel knows about is pinned by an
//! [`Inode`] record holding an `O_PATH` descriptor. Records are addressed two
//! ways: by the opaque wire handle (the node id the kernel sees) and by the
//! backing inode number (so a second lookup of the same object lands on the
//! same record). A record stays in the table while the kernel holds lookup
//! references or open handles on it; `(src_ino, generation)` never repeats
//! for the lifetime of the server.
//!
//! Lock order: record mutex before table mutex. The insert path takes them
//! in the opposite order, but only while the fresh record is invisible to
//! every other thread.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::fuse::ROOT_ID;

/// Backing descriptor of an inode record.
#[derive(Debug)]
pub enum Backing {
    /// Path-only (`O_PATH`) descriptor naming the object.
    Fd(OwnedFd),
    /// The object's last link was removed while the record lives on; the
    /// next lookup that resolves to the same backing ino adopts a fresh fd.
    Unlinked,
}

impl Backing {
    /// Raw descriptor when live.
    pub fn raw(&self) -> Option<RawFd> {
        match self {
            Backing::Fd(fd) => Some(fd.as_raw_fd()),
            Backing::Unlinked => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Backing::Fd(_))
    }
}

/// Mutable part of an inode record, guarded by the record mutex.
#[derive(Debug)]
pub struct InodeState {
    pub backing: Backing,
    /// Kernel-side lookup references; the record must outlive them.
    pub nlookup: u64,
    /// Currently open file handles against this inode.
    pub nopen: u32,
    /// Bumped whenever the backing fd is invalidated while the record stays.
    pub generation: u64,
}

#[derive(Debug)]
pub struct Inode {
    /// Wire node id. Stable for the record's lifetime; never reused for a
    /// different `(src_ino, generation)`.
    pub handle: u64,
    pub src_ino: u64,
    pub src_dev: u64,
    state: Mutex<InodeState>,
}

impl Inode {
    pub fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Outcome of [`InodeTable::attach`].
pub enum Attach {
    /// The object was already known with a live fd; the caller's fd is a
    /// duplicate and is returned for closing. Lookup count was bumped.
    Existing(Arc<Inode>, OwnedFd),
    /// The caller's fd was adopted: either a fresh record, or a recycled one
    /// whose previous fd was invalidated by unlink (generation already
    /// bumped there). Lookup count was bumped.
    Adopted(Arc<Inode>),
}

impl Attach {
    pub fn inode(&self) -> &Arc<Inode> {
        match self {
            Attach::Existing(inode, _) | Attach::Adopted(inode) => inode,
        }
    }
}

struct Tables {
    by_handle: HashMap<u64, Arc<Inode>>,
    by_src: HashMap<u64, u64>,
    next_handle: u64,
}

/// Keyed store of inode records.
pub struct InodeTable {
    inner: Mutex<Tables>,
}

impl InodeTable {
    pub fn new() -> Self {
        InodeTable {
            inner: Mutex::new(Tables {
                by_handle: HashMap::new(),
                by_src: HashMap::new(),
                next_handle: ROOT_ID,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Install the root record. Must be the first insertion; the root gets
    /// handle [`ROOT_ID`] and is never forgotten (the kernel does not send
    /// forget for the root, so it starts with a sentinel lookup count).
    pub fn insert_root(&self, src_ino: u64, src_dev: u64, fd: OwnedFd) -> Arc<Inode> {
        let mut t = self.table();
        assert_eq!(t.next_handle, ROOT_ID, "root must be inserted first");
        let root = Arc::new(Inode {
            handle: ROOT_ID,
            src_ino,
            src_dev,
            state: Mutex::new(InodeState {
                backing: Backing::Fd(fd),
                nlookup: 2,
                nopen: 0,
                generation: 0,
            }),
        });
        t.by_handle.insert(ROOT_ID, Arc::clone(&root));
        t.by_src.insert(src_ino, ROOT_ID);
        t.next_handle = ROOT_ID + 1;
        root
    }

    /// Resolve the wire handle the kernel sent to its record.
    pub fn get(&self, handle: u64) -> Option<Arc<Inode>> {
        self.table().by_handle.get(&handle).cloned()
    }

    /// Record lookup by backing inode number.
    pub fn get_src(&self, src_ino: u64) -> Option<Arc<Inode>> {
        let t = self.table();
        let handle = t.by_src.get(&src_ino)?;
        t.by_handle.get(handle).cloned()
    }

    /// Register one successful lookup of `src_ino`, resolved to `new_fd`.
    ///
    /// Increments the record's lookup count in all cases. A fresh record is
    /// fully initialised before any other thread can observe it.
    pub fn attach(&self, src_ino: u64, src_dev: u64, new_fd: OwnedFd) -> Attach {
        let mut t = self.table();
        if let Some(&handle) = t.by_src.get(&src_ino) {
            let inode = Arc::clone(&t.by_handle[&handle]);
            drop(t);

            let mut state = inode.lock();
            state.nlookup += 1;
            if state.backing.is_live() {
                drop(state);
                Attach::Existing(inode, new_fd)
            } else {
                // Recycled backing ino: adopt the new fd, keep the lookup
                // count accumulated so far. Unlink already bumped the
                // generation.
                state.backing = Backing::Fd(new_fd);
                drop(state);
                Attach::Adopted(inode)
            }
        } else {
            let handle = t.next_handle;
            t.next_handle += 1;
            let inode = Arc::new(Inode {
                handle,
                src_ino,
                src_dev,
                state: Mutex::new(InodeState {
                    backing: Backing::Fd(new_fd),
                    nlookup: 1,
                    nopen: 0,
                    generation: 0,
                }),
            });
            t.by_handle.insert(handle, Arc::clone(&inode));
            t.by_src.insert(src_ino, handle);
            Attach::Adopted(inode)
        }
    }

    /// Remove a record whose lookup count reached zero. The caller still
    /// holds the record mutex; taking the table mutex under it follows the
    /// documented lock order.
    pub fn erase(&self, inode: &Inode) {
        let mut t = self.table();
        t.by_handle.remove(&inode.handle);
        // Only drop the src mapping if it still points at this record.
        if t.by_src.get(&inode.src_ino) == Some(&inode.handle) {
            t.by_src.remove(&inode.src_ino);
        }
    }

    /// Number of live records (root included).
    pub fn len(&self) -> usize {
        self.table().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn path_fd(path: &std::path::Path) -> OwnedFd {
        File::open(path).unwrap().into()
    }

    #[test]
    fn test_attach_dedups_by_src_ino() {
        let dir = tempfile::tempdir().unwrap();
        let table = InodeTable::new();
        table.insert_root(1000, 1, path_fd(dir.path()));

        let a = table.attach(42, 1, path_fd(dir.path()));
        let first = Arc::clone(a.inode());
        assert!(matches!(a, Attach::Adopted(_)));
        assert_eq!(first.lock().nlookup, 1);

        let b = table.attach(42, 1, path_fd(dir.path()));
        assert!(matches!(b, Attach::Existing(..)));
        assert_eq!(b.inode().handle, first.handle);
        assert_eq!(first.lock().nlookup, 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_handles_are_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let table = InodeTable::new();
        table.insert_root(1000, 1, path_fd(dir.path()));

        let a = Arc::clone(table.attach(42, 1, path_fd(dir.path())).inode());
        table.erase(&a);

        let b = Arc::clone(table.attach(43, 1, path_fd(dir.path())).inode());
        assert_ne!(a.handle, b.handle);
    }

    #[test]
    fn test_unlinked_record_adopts_new_fd() {
        let dir = tempfile::tempdir().unwrap();
        let table = InodeTable::new();
        table.insert_root(1000, 1, path_fd(dir.path()));

        let inode = Arc::clone(table.attach(42, 1, path_fd(dir.path())).inode());
        {
            let mut state = inode.lock();
            state.backing = Backing::Unlinked;
            state.generation += 1;
        }

        let again = table.attach(42, 1, path_fd(dir.path()));
        assert!(matches!(again, Attach::Adopted(_)));
        let state = again.inode().lock();
        assert!(state.backing.is_live());
        assert_eq!(state.generation, 1);
        assert_eq!(state.nlookup, 2);
    }

    #[test]
    fn test_erase_removes_both_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let table = InodeTable::new();
        table.insert_root(1000, 1, path_fd(dir.path()));

        let inode = Arc::clone(table.attach(42, 1, path_fd(dir.path())).inode());
        assert!(table.get(inode.handle).is_some());
        assert!(table.get_src(42).is_some());

        table.erase(&inode);
        assert!(table.get(inode.handle).is_none());
        assert!(table.get_src(42).is_none());
        assert_eq!(table.len(), 1);
    }
}
