//! Local-directory passthrough filesystem served over the FUSE dispatch
//! surface.
//!
//! [`PassthroughFs`] owns the inode table, the open-directory pool, the
//! shared io_uring context and the cookie pool for in-flight data I/O.
//! Metadata operations complete synchronously against the backing tree;
//! read/write submit to the ring and complete through the transport's
//! [`Hal::async_complete`] callback from a reaper thread.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::fuse::abi::WriteOut;
use crate::fuse::ReplyBody;
use crate::hal::{CompletionStatus, Hal};

mod dir;
mod inode;
mod ops;
mod pool;
mod uring;

pub use dir::{DirEntry, DirHandle, DirStream, HandlePool};
pub use inode::{Attach, Backing, Inode, InodeState, InodeTable};
pub use pool::{CookiePool, RwCookie, RwOp};
pub use uring::IoRing;

/// Invoke a libc function, mapping `-1` to `io::Error::last_os_error()`.
macro_rules! syscall {
    ($name:ident ( $($args:expr),* $(,)? )) => {
        match unsafe { libc::$name($($args),*) } {
            -1 => Err(std::io::Error::last_os_error()),
            ret => Ok(ret),
        }
    };
}
pub(crate) use syscall;

/// Session-wide handshake state.
pub struct Session {
    init_done: AtomicBool,
    /// Capability mask negotiated with the kernel during init.
    negotiated: AtomicU32,
}

impl Session {
    fn new() -> Self {
        Session {
            init_done: AtomicBool::new(false),
            negotiated: AtomicU32::new(0),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.init_done.load(Ordering::Acquire)
    }

    pub fn negotiated_flags(&self) -> u32 {
        self.negotiated.load(Ordering::Acquire)
    }

    /// Returns false if the session was already initialised.
    fn mark_initialized(&self, flags: u32) -> bool {
        self.negotiated.store(flags, Ordering::Release);
        !self.init_done.swap(true, Ordering::AcqRel)
    }
}

/// The file server translation layer.
pub struct PassthroughFs {
    pub(crate) inodes: InodeTable,
    pub(crate) dirs: HandlePool<DirHandle>,
    pub(crate) cookies: CookiePool,
    pub(crate) ring: IoRing,
    pub(crate) hal: Arc<dyn Hal>,
    pub(crate) session: Session,
    /// Device of the exported tree; children on other devices are hidden.
    pub(crate) src_dev: u64,
    /// Entry/attribute cache TTL in seconds; 0 disables the writeback cache
    /// and enables the unlink pre-invalidate path.
    pub(crate) timeout: f64,
}

impl PassthroughFs {
    /// Open `dir` as the exported root and build the server state.
    pub fn new<P: AsRef<Path>>(
        dir: P,
        timeout: f64,
        queue_depth: u32,
        hal: Arc<dyn Hal>,
    ) -> io::Result<Self> {
        let dir = dir.as_ref();
        let c_dir = std::ffi::CString::new(dir.as_os_str().as_encoded_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

        let root_fd = syscall!(open(
            c_dir.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC
        ))?;
        let root_fd = unsafe { OwnedFd::from_raw_fd(root_fd) };

        let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
        let empty = std::ffi::CStr::from_bytes_with_nul(b"\0").unwrap();
        syscall!(fstatat(
            root_fd.as_raw_fd(),
            empty.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW
        ))?;
        let st = unsafe { st.assume_init() };

        let inodes = InodeTable::new();
        inodes.insert_root(st.st_ino, st.st_dev, root_fd);

        info!(
            target: "mirrorfs::passthrough",
            dir = %dir.display(),
            src_dev = st.st_dev,
            timeout,
            "exporting directory"
        );

        Ok(PassthroughFs {
            inodes,
            dirs: HandlePool::default(),
            cookies: CookiePool::new(),
            ring: IoRing::new(queue_depth)?,
            hal,
            session: Session::new(),
            src_dev: st.st_dev,
            timeout,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Number of live inode records, the exported root included.
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    /// Transport lifecycle hook: a virtio-fs device came up.
    pub fn register_device(&self, device_id: u16) {
        info!(target: "mirrorfs::passthrough", device_id, "device registered");
    }

    /// Transport lifecycle hook: a device is going away. In-flight ring
    /// submissions must be drained before calling this.
    pub fn unregister_device(&self, device_id: u16) {
        let outstanding = self.cookies.outstanding();
        if outstanding != 0 {
            warn!(
                target: "mirrorfs::passthrough",
                device_id,
                outstanding,
                "unregistering device with submissions in flight"
            );
        }
        info!(target: "mirrorfs::passthrough", device_id, "device unregistered");
    }

    /// Reap a batch of ring completions and resolve their requests.
    /// Returns the number of completions processed.
    pub fn pump_completions(&self) -> usize {
        let mut completions = Vec::new();
        self.ring.reap(&mut completions);
        for &(key, res) in &completions {
            self.complete_one(key, res);
        }
        completions.len()
    }

    /// Block briefly for completions, then pump. Used by non-polling
    /// reapers so they do not spin.
    pub fn wait_completions(&self, timeout: Duration) -> usize {
        if let Err(e) = self.ring.wait(timeout) {
            warn!(target: "mirrorfs::passthrough", error = %e, "ring wait failed");
        }
        self.pump_completions()
    }

    fn complete_one(&self, key: u64, res: i32) {
        let Some(mut cookie) = self.cookies.take(key) else {
            warn!(target: "mirrorfs::passthrough", key, "completion for unknown cookie");
            return;
        };

        let status = if res < 0 {
            cookie.frame.set_error(-res);
            CompletionStatus::Error
        } else {
            match cookie.op {
                RwOp::Read => cookie.frame.set_data_len(res as usize),
                RwOp::Write => cookie.frame.set_body(ReplyBody::Write(WriteOut {
                    size: res as u32,
                    padding: 0,
                })),
            }
            CompletionStatus::Success
        };

        debug!(
            target: "mirrorfs::passthrough",
            key,
            res,
            op = ?cookie.op,
            "async completion"
        );
        self.hal.async_complete(cookie.ctx, status, cookie.frame);
    }

    /// Pump until every in-flight submission has completed.
    pub fn drain(&self) {
        while self.cookies.outstanding() != 0 {
            self.wait_completions(Duration::from_millis(10));
        }
    }

    /// Spawn the completion reaper threads.
    ///
    /// With `cq_polling` the reapers busy-poll the completion queue;
    /// otherwise a single blocking reaper is spawned regardless of
    /// `nthreads`. Reapers exit once `shutdown` is set and the ring has
    /// drained.
    pub fn start_reapers(
        self: &Arc<Self>,
        cq_polling: bool,
        nthreads: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        let nthreads = if cq_polling { nthreads.max(1) } else { 1 };
        (0..nthreads)
            .map(|id| {
                let fs = Arc::clone(self);
                let shutdown = Arc::clone(&shutdown);
                std::thread::Builder::new()
                    .name(format!("mirrorfs-reaper-{id}"))
                    .spawn(move || {
                        debug!(target: "mirrorfs::passthrough", id, cq_polling, "reaper up");
                        loop {
                            let n = if cq_polling {
                                fs.pump_completions()
                            } else {
                                fs.wait_completions(Duration::from_millis(50))
                            };
                            if shutdown.load(Ordering::Acquire) {
                                if fs.cookies.outstanding() == 0 {
                                    break;
                                }
                            } else if n == 0 && cq_polling {
                                std::hint::spin_loop();
                            }
                        }
                        debug!(target: "mirrorfs::passthrough", id, "reaper down");
                    })
                    .expect("spawn reaper thread")
            })
            .collect()
    }
}
