//! Cookie pool for in-flight ring I/O.
//!
//! Each submitted read/write carries a pool key as its 64-bit ring user
//! data. The pooled record owns everything the completion side needs: the
//! parked reply frame, the iovec array handed to the kernel and, for writes,
//! the payload bytes. The heap buffers behind those fields keep their
//! addresses for the life of the entry, which is what the kernel requires of
//! a submission.

use std::sync::Mutex;

use slab::Slab;

use crate::fuse::ReplyFrame;
use crate::hal::CompletionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwOp {
    Read,
    Write,
}

/// State carried across an async read or write.
pub struct RwCookie {
    pub op: RwOp,
    pub ctx: CompletionContext,
    /// Reply frame parked until completion. For reads the kernel writes
    /// straight into `frame.data`.
    pub frame: Box<ReplyFrame>,
    /// Write payload; the submitted iovec points into it.
    pub data: Vec<u8>,
    /// The iovec array referenced by the submission queue entry.
    pub iov: Vec<libc::iovec>,
}

// The raw iovec pointers only reference heap buffers owned by this record.
unsafe impl Send for RwCookie {}

/// Thread-safe pool of in-flight cookies, keyed by ring user data.
pub struct CookiePool {
    inner: Mutex<Slab<RwCookie>>,
}

impl CookiePool {
    pub fn new() -> Self {
        CookiePool {
            inner: Mutex::new(Slab::new()),
        }
    }

    /// Park a cookie; the returned key is the ring user data.
    pub fn insert(&self, cookie: RwCookie) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cookie) as u64
    }

    /// Reclaim the cookie for a completed submission.
    pub fn take(&self, key: u64) -> Option<RwCookie> {
        let mut pool = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if pool.contains(key as usize) {
            Some(pool.remove(key as usize))
        } else {
            None
        }
    }

    /// Number of submissions still in flight.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for CookiePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(ctx: u64) -> RwCookie {
        RwCookie {
            op: RwOp::Read,
            ctx: CompletionContext(ctx),
            frame: Box::new(ReplyFrame::new(1)),
            data: Vec::new(),
            iov: Vec::new(),
        }
    }

    #[test]
    fn test_insert_take_roundtrip() {
        let pool = CookiePool::new();
        let key = pool.insert(cookie(7));
        assert_eq!(pool.outstanding(), 1);

        let taken = pool.take(key).unwrap();
        assert_eq!(taken.ctx, CompletionContext(7));
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.take(key).is_none());
    }

    #[test]
    fn test_keys_are_distinct_while_outstanding() {
        let pool = CookiePool::new();
        let a = pool.insert(cookie(1));
        let b = pool.insert(cookie(2));
        assert_ne!(a, b);
        assert_eq!(pool.take(a).unwrap().ctx, CompletionContext(1));
        assert_eq!(pool.take(b).unwrap().ctx, CompletionContext(2));
    }
}
