//! Opcode handlers and the dispatch entry point.
//!
//! Every handler mirrors one FUSE opcode onto the backing directory tree.
//! Metadata operations run synchronously against the record's path-only
//! descriptor (re-opened through `/proc/self/fd` when data access is
//! needed); read and write submit to the shared ring and return
//! [`DispatchOutcome::Async`].

use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::fuse::abi::*;
use crate::fuse::reply::entry_out;
use crate::fuse::{DirBuf, ReplyFrame, Request};
use crate::hal::{CompletionContext, DispatchOutcome};

use super::inode::{Backing, Inode};
use super::pool::{RwCookie, RwOp};
use super::{syscall, DirStream, PassthroughFs};

fn errno_of(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// fd-exhaustion errors are worth a server-side warning on top of the reply.
fn warn_fd_limit(errno: i32) {
    if errno == libc::ENFILE || errno == libc::EMFILE {
        warn!(target: "mirrorfs::ops", "reached the maximum number of file descriptors");
    }
}

fn proc_self_fd(fd: RawFd) -> CString {
    CString::new(format!("/proc/self/fd/{fd}")).expect("no interior NUL")
}

fn empty_path() -> &'static CStr {
    CStr::from_bytes_with_nul(b"\0").unwrap()
}

/// `fstatat` on the descriptor itself.
fn stat_fd(fd: RawFd) -> io::Result<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::zeroed();
    syscall!(fstatat(
        fd,
        empty_path().as_ptr(),
        st.as_mut_ptr(),
        libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW
    ))?;
    Ok(unsafe { st.assume_init() })
}

fn c_name(name: &OsStr) -> Result<CString, i32> {
    CString::new(name.as_bytes()).map_err(|_| libc::EINVAL)
}

/// Structural checks on a freshly resolved child: no descending into other
/// filesystems, and the reserved root id must not occur in the source tree.
fn check_child(st: &libc::stat, src_dev: u64) -> Result<(), i32> {
    if st.st_dev != src_dev {
        warn!(
            target: "mirrorfs::ops",
            "mountpoints in the source directory tree are hidden"
        );
        return Err(libc::ENOTSUP);
    }
    if st.st_ino == ROOT_ID {
        error!(
            target: "mirrorfs::ops",
            "source directory tree must not include inode {}", ROOT_ID
        );
        return Err(libc::EIO);
    }
    Ok(())
}

impl PassthroughFs {
    /// Dispatch one decoded request.
    ///
    /// The transport owns `frame` again as soon as this returns
    /// [`DispatchOutcome::Sync`]; for [`DispatchOutcome::Async`] the frame is
    /// parked in the submission cookie and resurfaces in
    /// [`Hal::async_complete`](crate::hal::Hal::async_complete).
    pub fn dispatch(
        &self,
        hdr: &InHeader,
        req: Request<'_>,
        mut frame: Box<ReplyFrame>,
        ctx: CompletionContext,
    ) -> DispatchOutcome {
        debug!(
            target: "mirrorfs::ops",
            unique = hdr.unique,
            nodeid = hdr.nodeid,
            op = req.name(),
            "request"
        );

        match req {
            Request::Read { arg } => return self.read(&arg, frame, ctx),
            Request::Write { arg, data } => return self.write(&arg, data, frame, ctx),

            Request::Init { arg } => self.init(hdr, &arg, &mut frame),
            Request::Destroy => self.destroy(&mut frame),
            Request::Lookup { name } => self.lookup(hdr, name, &mut frame),
            Request::Forget { arg } => self.forget_one(hdr.nodeid, arg.nlookup),
            Request::BatchForget { forgets } => {
                for forget in &forgets {
                    self.forget_one(forget.nodeid, forget.nlookup);
                }
            }
            Request::Getattr { arg } => self.getattr(hdr, &arg, &mut frame),
            Request::Setattr { arg } => self.setattr(hdr, &arg, &mut frame),
            Request::Readlink => self.readlink(hdr, &mut frame),
            Request::Mknod { arg, name } => {
                self.make_node(hdr, name, arg.mode, arg.rdev, None, &mut frame)
            }
            Request::Mkdir { arg, name } => {
                self.make_node(hdr, name, libc::S_IFDIR | arg.mode, 0, None, &mut frame)
            }
            Request::Symlink { name, link } => {
                self.make_node(hdr, name, libc::S_IFLNK, 0, Some(link), &mut frame)
            }
            Request::Unlink { name } => self.unlink(hdr, name, &mut frame),
            Request::Rmdir { name } => self.rmdir(hdr, name, &mut frame),
            Request::Rename {
                newdir,
                name,
                newname,
                flags,
            } => self.rename(hdr, name, newdir, newname, flags, &mut frame),
            Request::Open { arg } => self.open(hdr, &arg, &mut frame),
            Request::Statfs => self.statfs(hdr, &mut frame),
            Request::Release { arg } => self.release(hdr, &arg, &mut frame),
            Request::Fsync { arg } => self.fsync(&arg, &mut frame),
            Request::Flush { arg } => self.flush(&arg, &mut frame),
            Request::Opendir { arg: _ } => self.opendir(hdr, &mut frame),
            Request::Readdir { arg, plus } => self.readdir(hdr, &arg, plus, &mut frame),
            Request::Releasedir { arg } => self.releasedir(&arg, &mut frame),
            Request::Fsyncdir { arg } => self.fsyncdir(&arg, &mut frame),
            Request::Create { arg, name } => self.create(hdr, &arg, name, &mut frame),
            Request::Fallocate { arg } => self.fallocate(&arg, &mut frame),
            Request::Flock { fh, op } => self.flock(fh, op, &mut frame),
        }

        DispatchOutcome::Sync(frame)
    }

    fn inode(&self, nodeid: u64) -> Result<Arc<Inode>, i32> {
        // Unknown node ids are protocol misuse.
        self.inodes.get(nodeid).ok_or(libc::EINVAL)
    }

    fn backing_raw(inode: &Inode) -> Result<RawFd, i32> {
        inode.lock().backing.raw().ok_or(libc::ENOENT)
    }

    // ==== session ====

    fn init(&self, hdr: &InHeader, arg: &InitIn, frame: &mut ReplyFrame) {
        let capable = arg.flags;
        let mut want = 0u32;

        for flag in [
            FUSE_ASYNC_READ,
            FUSE_EXPORT_SUPPORT,
            FUSE_FLOCK_LOCKS,
            FUSE_PARALLEL_DIROPS,
            FUSE_DO_READDIRPLUS,
            FUSE_READDIRPLUS_AUTO,
            FUSE_MAX_PAGES,
        ] {
            if capable & flag != 0 {
                want |= flag;
            }
        }
        if self.timeout != 0.0 && capable & FUSE_WRITEBACK_CACHE != 0 {
            want |= FUSE_WRITEBACK_CACHE;
        }
        // Splice transfers do not exist over virtio-fs; never request them.
        want &= !(FUSE_SPLICE_READ | FUSE_SPLICE_WRITE | FUSE_SPLICE_MOVE);

        if hdr.uid != 0 && hdr.gid != 0 {
            // Group first; the gid switch is no longer permitted once the
            // effective uid has dropped.
            if let Err(e) = nix::unistd::setegid(nix::unistd::Gid::from_raw(hdr.gid)) {
                warn!(target: "mirrorfs::ops", gid = hdr.gid, error = %e, "could not drop gid");
                frame.set_error(e as i32);
                return;
            }
            if let Err(e) = nix::unistd::seteuid(nix::unistd::Uid::from_raw(hdr.uid)) {
                warn!(target: "mirrorfs::ops", uid = hdr.uid, error = %e, "could not drop uid");
                frame.set_error(e as i32);
                return;
            }
        } else {
            tracing::info!(
                target: "mirrorfs::ops",
                uid = nix::unistd::getuid().as_raw(),
                gid = nix::unistd::getgid().as_raw(),
                "init carried no credentials; serving under our own identity"
            );
        }

        if !self.session.mark_initialized(want) {
            warn!(target: "mirrorfs::ops", "duplicate init request");
        }

        frame.reply_init(InitOut {
            major: KERNEL_VERSION,
            minor: KERNEL_MINOR_VERSION,
            max_readahead: arg.max_readahead,
            flags: want,
            max_background: 64,
            congestion_threshold: 48,
            max_write: 1 << 20,
            time_gran: 1,
            max_pages: ((1usize << 20) / 4096) as u16,
            map_alignment: 0,
            flags2: 0,
            unused: [0; 7],
        });
    }

    fn destroy(&self, _frame: &mut ReplyFrame) {
        debug!(target: "mirrorfs::ops", "session destroy");
    }

    // ==== lookup / forget ====

    fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<EntryOut, i32> {
        let parent = self.inode(parent)?;
        let pfd = Self::backing_raw(&parent)?;
        let name_c = c_name(name)?;

        let newfd = syscall!(openat(
            pfd,
            name_c.as_ptr(),
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC
        ))
        .map_err(|e| errno_of(&e))?;
        let newfd = unsafe { OwnedFd::from_raw_fd(newfd) };

        let st = stat_fd(newfd.as_raw_fd()).map_err(|e| errno_of(&e))?;
        check_child(&st, self.src_dev)?;

        let attach = self.inodes.attach(st.st_ino, st.st_dev, newfd);
        let inode = attach.inode();
        let generation = inode.lock().generation;
        debug!(
            target: "mirrorfs::ops",
            src_ino = st.st_ino,
            handle = inode.handle,
            generation,
            "resolved"
        );
        // A duplicate fd held by `attach` is closed when it drops here.
        Ok(entry_out(
            inode.handle,
            generation,
            Attr::from_stat(&st),
            self.timeout,
        ))
    }

    fn lookup(&self, hdr: &InHeader, name: &OsStr, frame: &mut ReplyFrame) {
        match self.do_lookup(hdr.nodeid, name) {
            Ok(entry) => frame.reply_entry(entry),
            Err(libc::ENOENT) => {
                // Negative entry: node id 0, cached for the entry timeout.
                frame.reply_entry(entry_out(0, 0, Attr::default(), self.timeout));
            }
            Err(err) => {
                warn_fd_limit(err);
                frame.set_error(err);
            }
        }
    }

    pub(crate) fn forget_one(&self, nodeid: u64, nlookup: u64) {
        let Some(inode) = self.inodes.get(nodeid) else {
            warn!(target: "mirrorfs::ops", nodeid, "forget for unknown node id");
            return;
        };

        let mut state = inode.lock();
        if nlookup > state.nlookup {
            // The kernel dropped more references than it took; the
            // bookkeeping is unrecoverable.
            error!(
                target: "mirrorfs::ops",
                src_ino = inode.src_ino,
                have = state.nlookup,
                drop = nlookup,
                "negative lookup count"
            );
            std::process::abort();
        }
        state.nlookup -= nlookup;
        debug!(
            target: "mirrorfs::ops",
            src_ino = inode.src_ino,
            nlookup = state.nlookup,
            "forget"
        );

        // The record must survive open handles even at lookup count zero;
        // release picks up the erase in that case.
        if state.nlookup == 0 && state.nopen == 0 {
            // Record mutex is held; taking the table mutex here follows the
            // documented lock order.
            self.inodes.erase(&inode);
        }
    }

    // ==== attributes and metadata ====

    fn getattr(&self, hdr: &InHeader, _arg: &GetattrIn, frame: &mut ReplyFrame) {
        let result = self
            .inode(hdr.nodeid)
            .and_then(|inode| Self::backing_raw(&inode))
            .and_then(|fd| stat_fd(fd).map_err(|e| errno_of(&e)));
        match result {
            Ok(st) => frame.reply_attr(&st, self.timeout),
            Err(err) => frame.set_error(err),
        }
    }

    fn setattr(&self, hdr: &InHeader, arg: &SetattrIn, frame: &mut ReplyFrame) {
        let inode = match self.inode(hdr.nodeid) {
            Ok(inode) => inode,
            Err(err) => return frame.set_error(err),
        };
        let ifd = match Self::backing_raw(&inode) {
            Ok(fd) => fd,
            Err(err) => return frame.set_error(err),
        };
        let fh = (arg.valid & FATTR_FH != 0).then_some(arg.fh as RawFd);

        if let Err(e) = self.do_setattr(ifd, fh, arg) {
            return frame.set_error(errno_of(&e));
        }
        match stat_fd(ifd) {
            Ok(st) => frame.reply_attr(&st, self.timeout),
            Err(e) => frame.set_error(errno_of(&e)),
        }
    }

    fn do_setattr(&self, ifd: RawFd, fh: Option<RawFd>, arg: &SetattrIn) -> io::Result<()> {
        if arg.valid & FATTR_MODE != 0 {
            match fh {
                Some(fd) => syscall!(fchmod(fd, arg.mode))?,
                None => {
                    let path = proc_self_fd(ifd);
                    syscall!(chmod(path.as_ptr(), arg.mode))?
                }
            };
        }

        if arg.valid & (FATTR_UID | FATTR_GID) != 0 {
            let uid = if arg.valid & FATTR_UID != 0 {
                arg.uid
            } else {
                u32::MAX
            };
            let gid = if arg.valid & FATTR_GID != 0 {
                arg.gid
            } else {
                u32::MAX
            };
            syscall!(fchownat(
                ifd,
                empty_path().as_ptr(),
                uid,
                gid,
                libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW
            ))?;
        }

        if arg.valid & FATTR_SIZE != 0 {
            match fh {
                Some(fd) => syscall!(ftruncate(fd, arg.size as libc::off_t))?,
                None => {
                    let path = proc_self_fd(ifd);
                    syscall!(truncate(path.as_ptr(), arg.size as libc::off_t))?
                }
            };
        }

        if arg.valid & (FATTR_ATIME | FATTR_MTIME) != 0 {
            let omit = libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            };
            let mut tv = [omit, omit];

            if arg.valid & FATTR_ATIME_NOW != 0 {
                tv[0].tv_nsec = libc::UTIME_NOW;
            } else if arg.valid & FATTR_ATIME != 0 {
                tv[0] = libc::timespec {
                    tv_sec: arg.atime as libc::time_t,
                    tv_nsec: arg.atimensec as libc::c_long,
                };
            }
            if arg.valid & FATTR_MTIME_NOW != 0 {
                tv[1].tv_nsec = libc::UTIME_NOW;
            } else if arg.valid & FATTR_MTIME != 0 {
                tv[1] = libc::timespec {
                    tv_sec: arg.mtime as libc::time_t,
                    tv_nsec: arg.mtimensec as libc::c_long,
                };
            }

            match fh {
                Some(fd) => syscall!(futimens(fd, tv.as_ptr()))?,
                None => {
                    let path = proc_self_fd(ifd);
                    syscall!(utimensat(libc::AT_FDCWD, path.as_ptr(), tv.as_ptr(), 0))?
                }
            };
        }

        Ok(())
    }

    fn readlink(&self, hdr: &InHeader, frame: &mut ReplyFrame) {
        let fd = match self.inode(hdr.nodeid).and_then(|i| Self::backing_raw(&i)) {
            Ok(fd) => fd,
            Err(err) => return frame.set_error(err),
        };

        let mut buf = vec![0u8; libc::PATH_MAX as usize + 1];
        let len = match syscall!(readlinkat(
            fd,
            empty_path().as_ptr(),
            buf.as_mut_ptr().cast::<libc::c_char>(),
            buf.len()
        )) {
            Ok(len) => len as usize,
            Err(e) => return frame.set_error(errno_of(&e)),
        };
        if len >= buf.len() {
            return frame.set_error(libc::ENAMETOOLONG);
        }
        buf.truncate(len);
        frame.reply_readlink(OsStr::from_bytes(&buf));
    }

    fn make_node(
        &self,
        hdr: &InHeader,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        link: Option<&OsStr>,
        frame: &mut ReplyFrame,
    ) {
        let result = (|| -> Result<EntryOut, i32> {
            let parent = self.inode(hdr.nodeid)?;
            let pfd = Self::backing_raw(&parent)?;
            let name_c = c_name(name)?;

            let res = match mode & libc::S_IFMT {
                libc::S_IFDIR => syscall!(mkdirat(pfd, name_c.as_ptr(), mode)),
                libc::S_IFLNK => {
                    let link = link.ok_or(libc::EINVAL)?;
                    let link_c = c_name(link)?;
                    syscall!(symlinkat(link_c.as_ptr(), pfd, name_c.as_ptr()))
                }
                _ => syscall!(mknodat(pfd, name_c.as_ptr(), mode, rdev as libc::dev_t)),
            };
            res.map_err(|e| errno_of(&e))?;

            self.do_lookup(hdr.nodeid, name)
        })();

        match result {
            Ok(entry) => frame.reply_entry(entry),
            Err(err) => {
                warn_fd_limit(err);
                frame.set_error(err);
            }
        }
    }

    fn unlink(&self, hdr: &InHeader, name: &OsStr, frame: &mut ReplyFrame) {
        let parent = match self.inode(hdr.nodeid) {
            Ok(parent) => parent,
            Err(err) => return frame.set_error(err),
        };

        // Without metadata caching, drop our descriptor before the last link
        // goes away so a reused backing ino is observed with a bumped
        // generation (the nfsd close-before-unlink discipline).
        if self.timeout == 0.0 {
            let entry = match self.do_lookup(hdr.nodeid, name) {
                Ok(entry) => entry,
                Err(err) => return frame.set_error(err),
            };
            if entry.attr.nlink == 1 {
                match self.inodes.get(entry.nodeid) {
                    Some(inode) => {
                        let mut state = inode.lock();
                        if state.backing.is_live() && state.nopen == 0 {
                            debug!(
                                target: "mirrorfs::ops",
                                src_ino = inode.src_ino,
                                generation = state.generation + 1,
                                "invalidating fd of inode about to lose its last link"
                            );
                            state.backing = Backing::Unlinked;
                            state.generation += 1;
                        }
                    }
                    None => return frame.set_error(libc::EINVAL),
                }
            }
            // Undo the reference the pre-unlink lookup took.
            self.forget_one(entry.nodeid, 1);
        }

        let result = Self::backing_raw(&parent).and_then(|pfd| {
            let name_c = c_name(name)?;
            syscall!(unlinkat(pfd, name_c.as_ptr(), 0)).map_err(|e| errno_of(&e))
        });
        if let Err(err) = result {
            frame.set_error(err);
        }
    }

    fn rmdir(&self, hdr: &InHeader, name: &OsStr, frame: &mut ReplyFrame) {
        let result = (|| -> Result<(), i32> {
            let parent = self.inode(hdr.nodeid)?;
            let name_c = c_name(name)?;
            let state = parent.lock();
            let pfd = state.backing.raw().ok_or(libc::ENOENT)?;
            syscall!(unlinkat(pfd, name_c.as_ptr(), libc::AT_REMOVEDIR))
                .map_err(|e| errno_of(&e))?;
            Ok(())
        })();
        if let Err(err) = result {
            frame.set_error(err);
        }
    }

    fn rename(
        &self,
        hdr: &InHeader,
        name: &OsStr,
        newdir: u64,
        newname: &OsStr,
        flags: u32,
        frame: &mut ReplyFrame,
    ) {
        let result = (|| -> Result<(), i32> {
            if flags != 0 {
                return Err(libc::EINVAL);
            }
            let parent = self.inode(hdr.nodeid)?;
            let newparent = self.inode(newdir)?;
            let pfd = Self::backing_raw(&parent)?;
            let npfd = Self::backing_raw(&newparent)?;
            let name_c = c_name(name)?;
            let newname_c = c_name(newname)?;
            syscall!(renameat(pfd, name_c.as_ptr(), npfd, newname_c.as_ptr()))
                .map_err(|e| errno_of(&e))?;
            Ok(())
        })();
        if let Err(err) = result {
            frame.set_error(err);
        }
    }

    fn statfs(&self, hdr: &InHeader, frame: &mut ReplyFrame) {
        let fd = match self.inode(hdr.nodeid).and_then(|i| Self::backing_raw(&i)) {
            Ok(fd) => fd,
            Err(err) => return frame.set_error(err),
        };
        let mut st = MaybeUninit::<libc::statvfs>::zeroed();
        match syscall!(fstatvfs(fd, st.as_mut_ptr())) {
            Ok(_) => frame.reply_statfs(unsafe { &st.assume_init() }),
            Err(e) => frame.set_error(errno_of(&e)),
        }
    }

    // ==== open files ====

    fn open(&self, hdr: &InHeader, arg: &OpenIn, frame: &mut ReplyFrame) {
        let inode = match self.inode(hdr.nodeid) {
            Ok(inode) => inode,
            Err(err) => return frame.set_error(err),
        };

        let mut flags = arg.flags as i32;
        if self.timeout != 0.0 {
            // With the writeback cache the kernel may issue reads against a
            // write-only handle, and handles O_APPEND positioning itself.
            if flags & libc::O_ACCMODE == libc::O_WRONLY {
                flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
            }
            flags &= !libc::O_APPEND;
        }

        let mut state = inode.lock();
        let Some(pfd) = state.backing.raw() else {
            return frame.set_error(libc::ENOENT);
        };
        // The path-only descriptor cannot carry data; re-open it with the
        // requested access mode.
        let path = proc_self_fd(pfd);
        let fd = match syscall!(open(
            path.as_ptr(),
            (flags & !libc::O_NOFOLLOW) | libc::O_CLOEXEC
        )) {
            Ok(fd) => fd,
            Err(e) => {
                let err = errno_of(&e);
                warn_fd_limit(err);
                return frame.set_error(err);
            }
        };
        state.nopen += 1;
        drop(state);

        let mut open_flags = 0;
        if self.timeout != 0.0 {
            open_flags |= FOPEN_KEEP_CACHE;
        }
        if self.timeout == 0.0 && flags & libc::O_ACCMODE == libc::O_RDONLY {
            open_flags |= FOPEN_NOFLUSH;
        }
        frame.reply_open(OpenOut {
            fh: fd as u64,
            open_flags,
            padding: 0,
        });
    }

    fn create(&self, hdr: &InHeader, arg: &CreateIn, name: &OsStr, frame: &mut ReplyFrame) {
        let result = (|| -> Result<(EntryOut, OwnedFd), i32> {
            let parent = self.inode(hdr.nodeid)?;
            let pfd = Self::backing_raw(&parent)?;
            let name_c = c_name(name)?;

            let flags = (arg.flags as i32 | libc::O_CREAT) & !libc::O_NOFOLLOW;
            let fd = syscall!(openat(pfd, name_c.as_ptr(), flags, arg.mode)).map_err(|e| {
                let err = errno_of(&e);
                warn_fd_limit(err);
                err
            })?;
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };

            let entry = self.do_lookup(hdr.nodeid, name).inspect_err(|&e| {
                warn_fd_limit(e);
            })?;
            if let Some(inode) = self.inodes.get(entry.nodeid) {
                inode.lock().nopen += 1;
            }
            Ok((entry, fd))
        })();

        match result {
            Ok((entry, fd)) => frame.reply_create(
                entry,
                OpenOut {
                    fh: fd.into_raw_fd() as u64,
                    open_flags: 0,
                    padding: 0,
                },
            ),
            Err(err) => frame.set_error(err),
        }
    }

    fn release(&self, hdr: &InHeader, arg: &ReleaseIn, frame: &mut ReplyFrame) {
        let inode = match self.inode(hdr.nodeid) {
            Ok(inode) => inode,
            Err(err) => return frame.set_error(err),
        };
        {
            let mut state = inode.lock();
            state.nopen = state.nopen.saturating_sub(1);
            // The final forget may already have come in while the handle was
            // open; finish the erase it deferred.
            if state.nopen == 0 && state.nlookup == 0 {
                self.inodes.erase(&inode);
            }
        }
        unsafe { libc::close(arg.fh as RawFd) };
    }

    fn flush(&self, arg: &FlushIn, frame: &mut ReplyFrame) {
        let result = syscall!(dup(arg.fh as RawFd))
            .and_then(|dup_fd| syscall!(close(dup_fd)));
        if let Err(e) = result {
            frame.set_error(errno_of(&e));
        }
    }

    fn fsync(&self, arg: &FsyncIn, frame: &mut ReplyFrame) {
        let fd = arg.fh as RawFd;
        let result = if arg.fsync_flags & FUSE_FSYNC_FDATASYNC != 0 {
            syscall!(fdatasync(fd))
        } else {
            syscall!(fsync(fd))
        };
        if let Err(e) = result {
            frame.set_error(errno_of(&e));
        }
    }

    fn flock(&self, fh: u64, op: i32, frame: &mut ReplyFrame) {
        if let Err(e) = syscall!(flock(fh as RawFd, op)) {
            frame.set_error(errno_of(&e));
        }
    }

    fn fallocate(&self, arg: &FallocateIn, frame: &mut ReplyFrame) {
        let result = syscall!(fallocate64(
            arg.fh as RawFd,
            arg.mode as libc::c_int,
            arg.offset as libc::off64_t,
            arg.length as libc::off64_t
        ));
        if let Err(e) = result {
            frame.set_error(errno_of(&e));
        }
    }

    // ==== directories ====

    fn opendir(&self, hdr: &InHeader, frame: &mut ReplyFrame) {
        let fd = match self.inode(hdr.nodeid).and_then(|i| Self::backing_raw(&i)) {
            Ok(fd) => fd,
            Err(err) => return frame.set_error(err),
        };
        match DirStream::open(fd) {
            Ok(stream) => {
                let fh = self.dirs.insert(std::sync::Mutex::new(stream));
                let mut open_flags = 0;
                if self.timeout != 0.0 {
                    open_flags |= FOPEN_KEEP_CACHE | FOPEN_CACHE_DIR;
                }
                frame.reply_open(OpenOut {
                    fh,
                    open_flags,
                    padding: 0,
                });
            }
            Err(e) => {
                let err = errno_of(&e);
                warn_fd_limit(err);
                frame.set_error(err);
            }
        }
    }

    fn readdir(&self, hdr: &InHeader, arg: &ReadIn, plus: bool, frame: &mut ReplyFrame) {
        let inode = match self.inode(hdr.nodeid) {
            Ok(inode) => inode,
            Err(err) => return frame.set_error(err),
        };
        let Some(dir) = self.dirs.get(arg.fh) else {
            return frame.set_error(libc::EBADF);
        };

        // Readdir on one inode is serialised by its record mutex; the
        // stream's own mutex guards the libc handle.
        let _inode_guard = inode.lock();
        let mut stream = dir.lock().unwrap_or_else(|e| e.into_inner());

        stream.seek(arg.offset);

        if frame.data.len() < arg.size as usize {
            frame.data.resize(arg.size as usize, 0);
        }
        let mut data = std::mem::take(&mut frame.data);
        let mut buf = DirBuf::new(&mut data[..arg.size as usize]);

        let mut err = 0;
        let mut count = 0usize;
        loop {
            let entry = match stream.next_entry() {
                None => break,
                Some(Err(e)) => {
                    err = errno_of(&e);
                    break;
                }
                Some(Ok(entry)) => entry,
            };

            if plus {
                let eout = match self.do_lookup(hdr.nodeid, &entry.name) {
                    Ok(eout) => eout,
                    Err(e) => {
                        err = e;
                        break;
                    }
                };
                if buf.add_plus(&entry.name, &eout, entry.typ, entry.off) == 0 {
                    // No room: undo the lookup this entry took.
                    self.forget_one(eout.nodeid, 1);
                    break;
                }
            } else if buf.add(&entry.name, entry.ino, entry.typ, entry.off) == 0 {
                break;
            }
            count += 1;
        }

        let written = buf.written();
        frame.data = data;

        // An error can only be reported if nothing was emitted yet;
        // otherwise the lookup counts of the emitted entries would be lost.
        // Partial buffers are returned as success.
        if err != 0 && written == 0 {
            warn_fd_limit(err);
            frame.set_error(err);
        } else {
            debug!(
                target: "mirrorfs::ops",
                count,
                written,
                offset = stream.offset(),
                plus,
                "readdir chunk"
            );
            frame.set_data_len(written);
        }
    }

    fn releasedir(&self, arg: &ReleaseIn, _frame: &mut ReplyFrame) {
        self.dirs.remove(arg.fh);
    }

    fn fsyncdir(&self, arg: &FsyncIn, frame: &mut ReplyFrame) {
        let Some(dir) = self.dirs.get(arg.fh) else {
            return frame.set_error(libc::EBADF);
        };
        let fd = dir.lock().unwrap_or_else(|e| e.into_inner()).raw_fd();
        let result = if arg.fsync_flags & FUSE_FSYNC_FDATASYNC != 0 {
            syscall!(fdatasync(fd))
        } else {
            syscall!(fsync(fd))
        };
        if let Err(e) = result {
            frame.set_error(errno_of(&e));
        }
    }

    // ==== async data path ====

    fn read(
        &self,
        arg: &ReadIn,
        mut frame: Box<ReplyFrame>,
        ctx: CompletionContext,
    ) -> DispatchOutcome {
        if frame.data.len() < arg.size as usize {
            frame.data.resize(arg.size as usize, 0);
        }

        let mut cookie = RwCookie {
            op: RwOp::Read,
            ctx,
            frame,
            data: Vec::new(),
            iov: Vec::new(),
        };
        cookie.iov.push(libc::iovec {
            iov_base: cookie.frame.data.as_mut_ptr().cast(),
            iov_len: arg.size as usize,
        });
        let iov_ptr = cookie.iov.as_ptr();

        let key = self.cookies.insert(cookie);
        // The iovec array and its target live in heap buffers owned by the
        // pooled cookie; both stay put until the completion is reaped.
        match unsafe {
            self.ring
                .submit_readv(arg.fh as RawFd, iov_ptr, 1, arg.offset, key)
        } {
            Ok(()) => DispatchOutcome::Async,
            Err(e) => {
                let mut cookie = self.cookies.take(key).expect("unsubmitted cookie");
                cookie.frame.set_error(errno_of(&e));
                DispatchOutcome::Sync(cookie.frame)
            }
        }
    }

    fn write(
        &self,
        arg: &WriteIn,
        data: &[u8],
        frame: Box<ReplyFrame>,
        ctx: CompletionContext,
    ) -> DispatchOutcome {
        let mut cookie = RwCookie {
            op: RwOp::Write,
            ctx,
            frame,
            data: data.to_vec(),
            iov: Vec::new(),
        };
        cookie.iov.push(libc::iovec {
            iov_base: cookie.data.as_ptr() as *mut libc::c_void,
            iov_len: cookie.data.len(),
        });
        let iov_ptr = cookie.iov.as_ptr();

        let key = self.cookies.insert(cookie);
        match unsafe {
            self.ring
                .submit_writev(arg.fh as RawFd, iov_ptr, 1, arg.offset, key)
        } {
            Ok(()) => DispatchOutcome::Async,
            Err(e) => {
                let mut cookie = self.cookies.take(key).expect("unsubmitted cookie");
                cookie.frame.set_error(errno_of(&e));
                DispatchOutcome::Sync(cookie.frame)
            }
        }
    }
}
