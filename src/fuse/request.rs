//! Decoded FUSE requests.
//!
//! The transport layer decodes each raw frame into an [`InHeader`] plus one
//! of these typed variants before handing it to the dispatch surface. Names
//! and write payloads borrow from the frame buffer; fixed-size arguments are
//! copied out of it (the buffer has no alignment guarantees).

use std::ffi::OsStr;

use super::abi::*;

/// A single decoded FUSE request.
#[derive(Debug)]
pub enum Request<'a> {
    Init {
        arg: InitIn,
    },
    Destroy,
    Lookup {
        name: &'a OsStr,
    },
    Forget {
        arg: ForgetIn,
    },
    BatchForget {
        forgets: Vec<ForgetOne>,
    },
    Getattr {
        arg: GetattrIn,
    },
    Setattr {
        arg: SetattrIn,
    },
    Readlink,
    Mknod {
        arg: MknodIn,
        name: &'a OsStr,
    },
    Mkdir {
        arg: MkdirIn,
        name: &'a OsStr,
    },
    Unlink {
        name: &'a OsStr,
    },
    Rmdir {
        name: &'a OsStr,
    },
    Symlink {
        name: &'a OsStr,
        link: &'a OsStr,
    },
    Rename {
        newdir: u64,
        name: &'a OsStr,
        newname: &'a OsStr,
        flags: u32,
    },
    Open {
        arg: OpenIn,
    },
    Read {
        arg: ReadIn,
    },
    Write {
        arg: WriteIn,
        data: &'a [u8],
    },
    Statfs,
    Release {
        arg: ReleaseIn,
    },
    Fsync {
        arg: FsyncIn,
    },
    Flush {
        arg: FlushIn,
    },
    Opendir {
        arg: OpenIn,
    },
    Readdir {
        arg: ReadIn,
        plus: bool,
    },
    Releasedir {
        arg: ReleaseIn,
    },
    Fsyncdir {
        arg: FsyncIn,
    },
    Create {
        arg: CreateIn,
        name: &'a OsStr,
    },
    Fallocate {
        arg: FallocateIn,
    },
    /// BSD advisory lock, already translated to a `flock(2)` operation.
    Flock {
        fh: u64,
        op: i32,
    },
}

impl Request<'_> {
    /// Short operation name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Init { .. } => "init",
            Request::Destroy => "destroy",
            Request::Lookup { .. } => "lookup",
            Request::Forget { .. } => "forget",
            Request::BatchForget { .. } => "batch_forget",
            Request::Getattr { .. } => "getattr",
            Request::Setattr { .. } => "setattr",
            Request::Readlink => "readlink",
            Request::Mknod { .. } => "mknod",
            Request::Mkdir { .. } => "mkdir",
            Request::Unlink { .. } => "unlink",
            Request::Rmdir { .. } => "rmdir",
            Request::Symlink { .. } => "symlink",
            Request::Rename { .. } => "rename",
            Request::Open { .. } => "open",
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Statfs => "statfs",
            Request::Release { .. } => "release",
            Request::Fsync { .. } => "fsync",
            Request::Flush { .. } => "flush",
            Request::Opendir { .. } => "opendir",
            Request::Readdir { plus: false, .. } => "readdir",
            Request::Readdir { plus: true, .. } => "readdirplus",
            Request::Releasedir { .. } => "releasedir",
            Request::Fsyncdir { .. } => "fsyncdir",
            Request::Create { .. } => "create",
            Request::Fallocate { .. } => "fallocate",
            Request::Flock { .. } => "flock",
        }
    }
}
