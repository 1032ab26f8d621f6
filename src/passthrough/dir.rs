//! Seekable directory streams and the open-directory pool.

use std::ffi::{CStr, OsString};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStringExt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use slab::Slab;

use super::syscall;

/// One entry yielded by a [`DirStream`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    /// Cursor positioned just past this entry; handing it back to `seek`
    /// resumes enumeration at the next entry.
    pub off: u64,
    /// `d_type` value.
    pub typ: u32,
}

/// Streaming dirent iterator over a directory, with the last delivered
/// offset cached so repeated readdir calls only seek on a mismatch.
pub struct DirStream {
    dir: NonNull<libc::DIR>,
    offset: u64,
}

// The libdir handle is only touched under the pool entry's mutex.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Open a fresh stream over the directory a path-only fd names.
    pub fn open(dirfd: RawFd) -> io::Result<Self> {
        let dot = CStr::from_bytes_with_nul(b".\0").unwrap();
        let fd = syscall!(openat(
            dirfd,
            dot.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC
        ))?;
        // On success the stream owns fd; on failure we must close it.
        match NonNull::new(unsafe { libc::fdopendir(fd) }) {
            Some(dir) => Ok(DirStream { dir, offset: 0 }),
            None => {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                Err(err)
            }
        }
    }

    /// Last delivered cursor.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Position the stream at `offset`, seeking only when it differs from
    /// the cached cursor.
    pub fn seek(&mut self, offset: u64) {
        if offset != self.offset {
            unsafe { libc::seekdir(self.dir.as_ptr(), offset as libc::c_long) };
            self.offset = offset;
        }
    }

    /// Underlying directory fd, for fsyncdir.
    pub fn raw_fd(&self) -> RawFd {
        unsafe { libc::dirfd(self.dir.as_ptr()) }
    }

    /// Next entry, with `.` and `..` filtered out. `None` at end of stream.
    pub fn next_entry(&mut self) -> Option<io::Result<DirEntry>> {
        loop {
            unsafe { *libc::__errno_location() = 0 };
            let dp = unsafe { libc::readdir(self.dir.as_ptr()) };
            if dp.is_null() {
                let errno = unsafe { *libc::__errno_location() };
                return if errno == 0 {
                    None
                } else {
                    Some(Err(io::Error::from_raw_os_error(errno)))
                };
            }

            let raw = unsafe { &*dp };
            self.offset = raw.d_off as u64;

            let name = unsafe { CStr::from_ptr(raw.d_name.as_ptr()) };
            if matches!(name.to_bytes(), b"." | b"..") {
                continue;
            }

            return Some(Ok(DirEntry {
                name: OsString::from_vec(name.to_bytes().to_vec()),
                ino: raw.d_ino,
                off: raw.d_off as u64,
                typ: raw.d_type as u32,
            }));
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir.as_ptr()) };
    }
}

/// Pool translating wire file handles to open directory streams.
pub struct HandlePool<T> {
    inner: Mutex<Slab<Arc<T>>>,
}

impl<T> Default for HandlePool<T> {
    fn default() -> Self {
        HandlePool {
            inner: Mutex::new(Slab::new()),
        }
    }
}

impl<T> HandlePool<T> {
    pub fn insert(&self, entry: T) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Arc::new(entry)) as u64
    }

    pub fn get(&self, fh: u64) -> Option<Arc<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(fh as usize)
            .cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<T>> {
        let mut pool = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if pool.contains(fh as usize) {
            Some(pool.remove(fh as usize))
        } else {
            None
        }
    }
}

/// Convenience alias used by opendir/readdir/releasedir.
pub type DirHandle = Mutex<DirStream>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_stream_lists_entries_without_dots() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"1").unwrap();
        std::fs::write(dir.path().join("b"), b"2").unwrap();

        let f = File::open(dir.path()).unwrap();
        let mut stream = DirStream::open(f.as_raw_fd()).unwrap();

        let mut names = Vec::new();
        while let Some(entry) = stream.next_entry() {
            names.push(entry.unwrap().name);
        }
        names.sort();
        assert_eq!(names, vec![OsString::from("a"), OsString::from("b")]);
    }

    #[test]
    fn test_stream_seek_resumes_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            std::fs::write(dir.path().join(format!("f{i}")), b"x").unwrap();
        }

        let f = File::open(dir.path()).unwrap();
        let mut stream = DirStream::open(f.as_raw_fd()).unwrap();

        let first = stream.next_entry().unwrap().unwrap();
        let mut rest: Vec<_> = std::iter::from_fn(|| stream.next_entry())
            .map(|e| e.unwrap().name)
            .collect();

        // Re-enumerate from just past the first entry.
        stream.seek(first.off);
        let mut resumed: Vec<_> = std::iter::from_fn(|| stream.next_entry())
            .map(|e| e.unwrap().name)
            .collect();

        rest.sort();
        resumed.sort();
        assert_eq!(rest, resumed);
    }

    #[test]
    fn test_handle_pool_roundtrip() {
        let pool: HandlePool<u32> = HandlePool::default();
        let fh = pool.insert(7);
        assert_eq!(*pool.get(fh).unwrap(), 7);
        assert!(pool.remove(fh).is_some());
        assert!(pool.get(fh).is_none());
        assert!(pool.remove(fh).is_none());
    }
}
