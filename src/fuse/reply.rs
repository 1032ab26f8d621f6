//! Reply construction.
//!
//! A [`ReplyFrame`] is allocated by the transport for every request and
//! carries the reply header, the typed opcode-specific payload and, for data
//! carrying opcodes, a pre-sized byte area that the kernel ring writes into
//! directly. `to_bytes` flattens the frame into the wire layout
//! (`fuse_out_header` first, payload after).

use std::ffi::OsStr;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;

use super::abi::*;

/// View a `repr(C)` reply struct as raw bytes.
fn as_bytes<T: Copy>(v: &T) -> &[u8] {
    // Safe for the plain-old-data wire structs in `abi`.
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, size_of::<T>()) }
}

/// Typed reply payload following the header.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    None,
    Entry(EntryOut),
    Attr(AttrOut),
    Open(OpenOut),
    Create(EntryOut, OpenOut),
    Init(InitOut),
    Statfs(StatfsOut),
    Write(WriteOut),
}

impl ReplyBody {
    fn wire_len(&self) -> usize {
        match self {
            ReplyBody::None => 0,
            ReplyBody::Entry(_) => size_of::<EntryOut>(),
            ReplyBody::Attr(_) => size_of::<AttrOut>(),
            ReplyBody::Open(_) => size_of::<OpenOut>(),
            ReplyBody::Create(..) => size_of::<EntryOut>() + size_of::<OpenOut>(),
            ReplyBody::Init(_) => size_of::<InitOut>(),
            ReplyBody::Statfs(_) => size_of::<StatfsOut>(),
            ReplyBody::Write(_) => size_of::<WriteOut>(),
        }
    }
}

/// One in-flight reply.
///
/// For async read/write the frame is parked inside the submission cookie
/// until the completion reaper fills it in, so its address must stay stable:
/// it is always handled boxed.
#[derive(Debug)]
pub struct ReplyFrame {
    pub hdr: OutHeader,
    pub body: ReplyBody,
    /// Data area for read/readdir/readlink payloads. Sized by the transport
    /// from the request's `size` argument before dispatch.
    pub data: Vec<u8>,
}

impl ReplyFrame {
    pub fn new(unique: u64) -> Self {
        ReplyFrame {
            hdr: OutHeader {
                len: size_of::<OutHeader>() as u32,
                error: 0,
                unique,
            },
            body: ReplyBody::None,
            data: Vec::new(),
        }
    }

    pub fn with_data_capacity(unique: u64, cap: usize) -> Self {
        let mut frame = Self::new(unique);
        frame.data = vec![0u8; cap];
        frame
    }

    /// Record a failure; `errno` is a positive errno value.
    pub fn set_error(&mut self, errno: i32) {
        self.hdr.error = -errno.abs();
        self.hdr.len = size_of::<OutHeader>() as u32;
        self.body = ReplyBody::None;
    }

    pub fn set_body(&mut self, body: ReplyBody) {
        self.hdr.len = (size_of::<OutHeader>() + body.wire_len()) as u32;
        self.body = body;
    }

    /// Account `n` bytes of the data area as part of the reply.
    pub fn set_data_len(&mut self, n: usize) {
        self.hdr.len = (size_of::<OutHeader>() + self.body.wire_len() + n) as u32;
    }

    pub fn reply_entry(&mut self, entry: EntryOut) {
        self.set_body(ReplyBody::Entry(entry));
    }

    pub fn reply_attr(&mut self, st: &libc::stat, timeout: f64) {
        let (secs, nsecs) = timeout_parts(timeout);
        self.set_body(ReplyBody::Attr(AttrOut {
            attr_valid: secs,
            attr_valid_nsec: nsecs,
            dummy: 0,
            attr: Attr::from_stat(st),
        }));
    }

    pub fn reply_open(&mut self, open: OpenOut) {
        self.set_body(ReplyBody::Open(open));
    }

    pub fn reply_create(&mut self, entry: EntryOut, open: OpenOut) {
        self.set_body(ReplyBody::Create(entry, open));
    }

    pub fn reply_init(&mut self, init: InitOut) {
        self.set_body(ReplyBody::Init(init));
    }

    pub fn reply_statfs(&mut self, st: &libc::statvfs) {
        self.set_body(ReplyBody::Statfs(StatfsOut {
            st: Kstatfs {
                blocks: st.f_blocks,
                bfree: st.f_bfree,
                bavail: st.f_bavail,
                files: st.f_files,
                ffree: st.f_ffree,
                bsize: st.f_bsize as u32,
                namelen: st.f_namemax as u32,
                frsize: st.f_frsize as u32,
                padding: 0,
                spare: [0; 6],
            },
        }));
    }

    pub fn reply_readlink(&mut self, target: &OsStr) {
        self.data = target.as_bytes().to_vec();
        let n = self.data.len();
        self.set_data_len(n);
    }

    /// Number of data-area bytes counted into `hdr.len`.
    pub fn data_len(&self) -> usize {
        self.hdr.len as usize - size_of::<OutHeader>() - self.body.wire_len()
    }

    /// Flatten into the wire layout for shipping.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.hdr.len as usize);
        out.extend_from_slice(as_bytes(&self.hdr));
        match &self.body {
            ReplyBody::None => {}
            ReplyBody::Entry(e) => out.extend_from_slice(as_bytes(e)),
            ReplyBody::Attr(a) => out.extend_from_slice(as_bytes(a)),
            ReplyBody::Open(o) => out.extend_from_slice(as_bytes(o)),
            ReplyBody::Create(e, o) => {
                out.extend_from_slice(as_bytes(e));
                out.extend_from_slice(as_bytes(o));
            }
            ReplyBody::Init(i) => out.extend_from_slice(as_bytes(i)),
            ReplyBody::Statfs(s) => out.extend_from_slice(as_bytes(s)),
            ReplyBody::Write(w) => out.extend_from_slice(as_bytes(w)),
        }
        if self.hdr.error == 0 {
            out.extend_from_slice(&self.data[..self.data_len()]);
        }
        debug_assert_eq!(out.len(), self.hdr.len as usize);
        out
    }
}

/// Build the wire entry reply for a resolved (or negative) lookup.
pub fn entry_out(nodeid: u64, generation: u64, attr: Attr, timeout: f64) -> EntryOut {
    let (secs, nsecs) = timeout_parts(timeout);
    EntryOut {
        nodeid,
        generation,
        entry_valid: secs,
        attr_valid: secs,
        entry_valid_nsec: nsecs,
        attr_valid_nsec: nsecs,
        attr,
    }
}

/// Cursor that frames directory entries into a reply data area.
///
/// `add`/`add_plus` return the number of bytes consumed, or 0 when the entry
/// does not fit ("no room"), in which case nothing was written.
pub struct DirBuf<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> DirBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        DirBuf { buf, pos: 0 }
    }

    pub fn written(&self) -> usize {
        self.pos
    }

    fn push(&mut self, header: &[u8], name: &OsStr, entry_len: usize) -> usize {
        if self.pos + entry_len > self.buf.len() {
            return 0;
        }
        let start = self.pos;
        self.buf[start..start + header.len()].copy_from_slice(header);
        let name_start = start + header.len();
        let name = name.as_bytes();
        self.buf[name_start..name_start + name.len()].copy_from_slice(name);
        // Zero the alignment padding.
        for b in &mut self.buf[name_start + name.len()..start + entry_len] {
            *b = 0;
        }
        self.pos += entry_len;
        entry_len
    }

    /// Append a plain `fuse_dirent`.
    pub fn add(&mut self, name: &OsStr, ino: u64, typ: u32, off: u64) -> usize {
        let dirent = Dirent {
            ino,
            off,
            namelen: name.as_bytes().len() as u32,
            typ,
        };
        let entry_len = dirent_align(size_of::<Dirent>() + name.as_bytes().len());
        self.push(as_bytes(&dirent), name, entry_len)
    }

    /// Append a `fuse_direntplus` carrying a full entry reply.
    pub fn add_plus(&mut self, name: &OsStr, entry: &EntryOut, typ: u32, off: u64) -> usize {
        let plus = DirentPlus {
            entry_out: *entry,
            dirent: Dirent {
                ino: entry.attr.ino,
                off,
                namelen: name.as_bytes().len() as u32,
                typ,
            },
        };
        let entry_len = dirent_align(size_of::<DirentPlus>() + name.as_bytes().len());
        self.push(as_bytes(&plus), name, entry_len)
    }
}
