//! End-to-end scenarios for the translation layer.
//!
//! These drive the public dispatch surface the way the device transport
//! would: typed requests in, reply frames out, async read/write completions
//! pumped explicitly so each test controls the reaper.

use std::ffi::OsStr;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mirrorfs::fuse::abi::*;
use mirrorfs::fuse::{ReplyBody, ReplyFrame, Request};
use mirrorfs::{CompletionContext, CompletionStatus, DispatchOutcome, Hal, PassthroughFs};

/// Records async completions for inspection.
#[derive(Default)]
struct TestHal {
    completed: Mutex<Vec<(CompletionContext, CompletionStatus, Box<ReplyFrame>)>>,
}

impl Hal for TestHal {
    fn async_complete(
        &self,
        ctx: CompletionContext,
        status: CompletionStatus,
        frame: Box<ReplyFrame>,
    ) {
        self.completed.lock().unwrap().push((ctx, status, frame));
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    hal: Arc<TestHal>,
    fs: Arc<PassthroughFs>,
    unique: AtomicU64,
    next_ctx: AtomicU64,
}

impl Fixture {
    fn new(timeout: f64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let hal = Arc::new(TestHal::default());
        let fs = Arc::new(
            PassthroughFs::new(dir.path(), timeout, 64, Arc::clone(&hal) as Arc<dyn Hal>)
                .unwrap(),
        );
        Fixture {
            dir,
            hal,
            fs,
            unique: AtomicU64::new(1),
            next_ctx: AtomicU64::new(1),
        }
    }

    fn dispatch(&self, nodeid: u64, req: Request<'_>, data_cap: usize) -> DispatchOutcome {
        let unique = self.unique.fetch_add(1, Ordering::Relaxed);
        let hdr = InHeader {
            unique,
            nodeid,
            ..InHeader::default()
        };
        let frame = Box::new(ReplyFrame::with_data_capacity(unique, data_cap));
        let ctx = CompletionContext(self.next_ctx.fetch_add(1, Ordering::Relaxed));
        self.fs.dispatch(&hdr, req, frame, ctx)
    }

    fn sync(&self, nodeid: u64, req: Request<'_>) -> Box<ReplyFrame> {
        self.dispatch(nodeid, req, 0).expect_sync()
    }

    /// Pump the ring until one async completion lands, then return it.
    fn complete_one(&self) -> (CompletionStatus, Box<ReplyFrame>) {
        loop {
            if let Some((_, status, frame)) = self.hal.completed.lock().unwrap().pop() {
                return (status, frame);
            }
            self.fs.wait_completions(Duration::from_millis(50));
        }
    }

    fn lookup(&self, name: &str) -> Box<ReplyFrame> {
        self.sync(
            ROOT_ID,
            Request::Lookup {
                name: OsStr::new(name),
            },
        )
    }

    fn forget(&self, nodeid: u64, nlookup: u64) {
        self.sync(
            nodeid,
            Request::Forget {
                arg: ForgetIn { nlookup },
            },
        );
    }

    fn open(&self, nodeid: u64, flags: i32) -> OpenOut {
        let frame = self.sync(
            nodeid,
            Request::Open {
                arg: OpenIn {
                    flags: flags as u32,
                    open_flags: 0,
                },
            },
        );
        assert_eq!(frame.hdr.error, 0, "open failed: {}", frame.hdr.error);
        match frame.body {
            ReplyBody::Open(o) => o,
            ref other => panic!("expected open reply, got {other:?}"),
        }
    }

    fn release(&self, nodeid: u64, fh: u64) {
        self.sync(
            nodeid,
            Request::Release {
                arg: ReleaseIn {
                    fh,
                    ..ReleaseIn::default()
                },
            },
        );
    }

    fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Box<ReplyFrame> {
        let outcome = self.dispatch(
            ROOT_ID,
            Request::Write {
                arg: WriteIn {
                    fh,
                    offset,
                    size: data.len() as u32,
                    ..WriteIn::default()
                },
                data,
            },
            0,
        );
        match outcome {
            DispatchOutcome::Async => self.complete_one().1,
            DispatchOutcome::Sync(frame) => frame,
        }
    }

    fn read(&self, fh: u64, offset: u64, size: u32) -> Box<ReplyFrame> {
        let outcome = self.dispatch(
            ROOT_ID,
            Request::Read {
                arg: ReadIn {
                    fh,
                    offset,
                    size,
                    ..ReadIn::default()
                },
            },
            size as usize,
        );
        match outcome {
            DispatchOutcome::Async => self.complete_one().1,
            DispatchOutcome::Sync(frame) => frame,
        }
    }

    fn opendir(&self, nodeid: u64) -> u64 {
        let frame = self.sync(
            nodeid,
            Request::Opendir {
                arg: OpenIn::default(),
            },
        );
        assert_eq!(frame.hdr.error, 0);
        match frame.body {
            ReplyBody::Open(o) => o.fh,
            ref other => panic!("expected open reply, got {other:?}"),
        }
    }

    fn readdirplus(&self, nodeid: u64, fh: u64, offset: u64, size: u32) -> Box<ReplyFrame> {
        self.dispatch(
            nodeid,
            Request::Readdir {
                arg: ReadIn {
                    fh,
                    offset,
                    size,
                    ..ReadIn::default()
                },
                plus: true,
            },
            size as usize,
        )
        .expect_sync()
    }
}

fn entry_of(frame: &ReplyFrame) -> EntryOut {
    match frame.body {
        ReplyBody::Entry(e) => e,
        ref other => panic!("expected entry reply, got {other:?}"),
    }
}

fn reply_data(frame: &ReplyFrame) -> &[u8] {
    &frame.data[..frame.data_len()]
}

/// Walk the direntplus framing in a readdir reply.
fn parse_plus(frame: &ReplyFrame) -> Vec<(String, u64, u64)> {
    let data = reply_data(frame);
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let plus: DirentPlus =
            unsafe { std::ptr::read_unaligned(data[pos..].as_ptr().cast::<DirentPlus>()) };
        let name_start = pos + size_of::<DirentPlus>();
        let name = std::str::from_utf8(&data[name_start..name_start + plus.dirent.namelen as usize])
            .unwrap()
            .to_string();
        entries.push((name, plus.entry_out.nodeid, plus.dirent.off));
        pos += dirent_align(size_of::<DirentPlus>() + plus.dirent.namelen as usize);
    }
    entries
}

// Scenario A: lookup idempotence.
#[test]
fn test_lookup_twice_same_identity_then_forgotten() {
    let fx = Fixture::new(1.0);
    std::fs::write(fx.dir.path().join("hello"), b"content").unwrap();

    let first = entry_of(&fx.lookup("hello"));
    let second = entry_of(&fx.lookup("hello"));
    assert_eq!(first.nodeid, second.nodeid);
    assert_eq!(first.generation, second.generation);
    assert_eq!(fx.fs.inode_count(), 2);

    fx.forget(first.nodeid, 1);
    assert_eq!(fx.fs.inode_count(), 2, "one reference still outstanding");
    fx.forget(first.nodeid, 1);
    assert_eq!(fx.fs.inode_count(), 1, "record erased after final forget");
}

// Scenario B: negative lookup.
#[test]
fn test_negative_lookup_carries_entry_timeout() {
    let fx = Fixture::new(2.5);
    let frame = fx.lookup("missing");
    assert_eq!(frame.hdr.error, 0);
    let entry = entry_of(&frame);
    assert_eq!(entry.nodeid, 0);
    assert_eq!(entry.entry_valid, 2);
    assert_eq!(entry.entry_valid_nsec, 500_000_000);
}

// Scenario C: write-then-read through the async pipeline.
#[test]
fn test_write_then_read_roundtrip() {
    let fx = Fixture::new(0.0);
    let frame = fx.sync(
        ROOT_ID,
        Request::Create {
            arg: CreateIn {
                flags: libc::O_RDWR as u32,
                mode: 0o644,
                umask: 0,
                open_flags: 0,
            },
            name: OsStr::new("data"),
        },
    );
    assert_eq!(frame.hdr.error, 0);
    let (entry, open) = match frame.body {
        ReplyBody::Create(e, o) => (e, o),
        ref other => panic!("expected create reply, got {other:?}"),
    };

    let frame = fx.write(open.fh, 0, b"ABCDEFGH");
    assert_eq!(frame.hdr.error, 0);
    match frame.body {
        ReplyBody::Write(w) => assert_eq!(w.size, 8),
        ref other => panic!("expected write reply, got {other:?}"),
    }

    let frame = fx.read(open.fh, 0, 8);
    assert_eq!(frame.hdr.error, 0);
    assert_eq!(reply_data(&frame), b"ABCDEFGH");

    fx.release(entry.nodeid, open.fh);
}

// Property 4: reply sizes are bounded by the request.
#[test]
fn test_read_reply_bounded_and_errors_are_header_only() {
    let fx = Fixture::new(0.0);
    std::fs::write(fx.dir.path().join("short"), b"ab").unwrap();

    let entry = entry_of(&fx.lookup("short"));
    let open = fx.open(entry.nodeid, libc::O_RDONLY);

    let frame = fx.read(open.fh, 0, 64);
    assert_eq!(frame.hdr.error, 0);
    assert_eq!(reply_data(&frame), b"ab");
    assert!(frame.hdr.len as usize <= size_of::<OutHeader>() + 64);
    fx.release(entry.nodeid, open.fh);

    // A read against a handle that was never opened completes with a bare
    // error header.
    let frame = fx.read(1 << 20, 0, 16);
    assert_eq!(frame.hdr.error, -libc::EBADF);
    assert_eq!(frame.hdr.len as usize, size_of::<OutHeader>());
}

// Scenario D: unlink while a handle is held, without metadata caching.
#[test]
fn test_unlink_with_open_handle_then_release() {
    let fx = Fixture::new(0.0);
    std::fs::write(fx.dir.path().join("x"), b"still readable").unwrap();

    let entry = entry_of(&fx.lookup("x"));
    let open = fx.open(entry.nodeid, libc::O_RDONLY);

    let frame = fx.sync(
        ROOT_ID,
        Request::Unlink {
            name: OsStr::new("x"),
        },
    );
    assert_eq!(frame.hdr.error, 0);

    // The name is gone: negative entry.
    let frame = fx.lookup("x");
    assert_eq!(frame.hdr.error, 0);
    assert_eq!(entry_of(&frame).nodeid, 0);

    // The held handle still reads.
    let frame = fx.read(open.fh, 0, 64);
    assert_eq!(frame.hdr.error, 0);
    assert_eq!(reply_data(&frame), b"still readable");

    fx.release(entry.nodeid, open.fh);
    fx.forget(entry.nodeid, 1);
    assert_eq!(fx.fs.inode_count(), 1, "record erased once released and forgotten");
}

// Scenario F: readdirplus with a buffer sized for exactly 37 entries.
#[test]
fn test_readdirplus_partial_chunks_cover_directory_exactly_once() {
    let fx = Fixture::new(0.0);
    let mut expected = std::collections::BTreeSet::new();
    for i in 0..1000 {
        let name = format!("e{i:04}");
        std::fs::write(fx.dir.path().join(&name), b"x").unwrap();
        expected.insert(name);
    }

    // Every name is 5 bytes, so each direntplus occupies the same aligned
    // size; size the buffer to hold exactly 37 of them.
    let per_entry = dirent_align(size_of::<DirentPlus>() + 5);
    let buf_size = (per_entry * 37) as u32;

    let fh = fx.opendir(ROOT_ID);
    let first = fx.readdirplus(ROOT_ID, fh, 0, buf_size);
    assert_eq!(first.hdr.error, 0);
    let first_entries = parse_plus(&first);
    assert_eq!(first_entries.len(), 37);

    let mut seen = Vec::new();
    seen.extend(first_entries.iter().cloned());
    let mut offset = first_entries.last().unwrap().2;
    loop {
        let frame = fx.readdirplus(ROOT_ID, fh, offset, buf_size);
        assert_eq!(frame.hdr.error, 0);
        let entries = parse_plus(&frame);
        if entries.is_empty() {
            break;
        }
        offset = entries.last().unwrap().2;
        seen.extend(entries);
    }

    let names: Vec<_> = seen.iter().map(|(name, _, _)| name.clone()).collect();
    let unique: std::collections::BTreeSet<_> = names.iter().cloned().collect();
    assert_eq!(names.len(), unique.len(), "no entry may be returned twice");
    assert_eq!(unique, expected);

    // Each returned entry took exactly one lookup reference; the lookup for
    // the entry that did not fit was compensated. One forget per returned
    // entry must therefore empty the table.
    fx.sync(
        ROOT_ID,
        Request::Releasedir {
            arg: ReleaseIn {
                fh,
                ..ReleaseIn::default()
            },
        },
    );
    for (_, nodeid, _) in &seen {
        fx.forget(*nodeid, 1);
    }
    assert_eq!(fx.fs.inode_count(), 1);
}

// Property 5: plain readdir covers the directory exactly, minus dot entries.
#[test]
fn test_readdir_multiset_matches_directory() {
    let fx = Fixture::new(0.0);
    let mut expected = std::collections::BTreeSet::new();
    for i in 0..50 {
        let name = format!("f{i:02}");
        std::fs::write(fx.dir.path().join(&name), b"x").unwrap();
        expected.insert(name);
    }

    let fh = fx.opendir(ROOT_ID);
    let mut offset = 0;
    let mut seen = std::collections::BTreeSet::new();
    loop {
        let frame = fx
            .dispatch(
                ROOT_ID,
                Request::Readdir {
                    arg: ReadIn {
                        fh,
                        offset,
                        size: 512,
                        ..ReadIn::default()
                    },
                    plus: false,
                },
                512,
            )
            .expect_sync();
        assert_eq!(frame.hdr.error, 0);

        let data = reply_data(&frame);
        if data.is_empty() {
            break;
        }
        let mut pos = 0;
        while pos < data.len() {
            let dirent: Dirent =
                unsafe { std::ptr::read_unaligned(data[pos..].as_ptr().cast::<Dirent>()) };
            let name_start = pos + size_of::<Dirent>();
            let name =
                std::str::from_utf8(&data[name_start..name_start + dirent.namelen as usize])
                    .unwrap()
                    .to_string();
            assert!(seen.insert(name), "duplicate entry in enumeration");
            offset = dirent.off;
            pos += dirent_align(size_of::<Dirent>() + dirent.namelen as usize);
        }
    }
    assert_eq!(seen, expected);
}

// Statfs passes through the backing filesystem's numbers.
#[test]
fn test_statfs_reports_backing_filesystem() {
    let fx = Fixture::new(0.0);
    let frame = fx.sync(ROOT_ID, Request::Statfs);
    assert_eq!(frame.hdr.error, 0);
    match frame.body {
        ReplyBody::Statfs(out) => {
            assert!(out.st.bsize > 0);
            assert!(out.st.namelen > 0);
        }
        ref other => panic!("expected statfs reply, got {other:?}"),
    }
}

// Session init negotiates capabilities and flips the session flag once.
#[test]
fn test_init_negotiates_capabilities() {
    let fx = Fixture::new(1.0);
    assert!(!fx.fs.session().is_initialized());

    let frame = fx.sync(
        0,
        Request::Init {
            arg: InitIn {
                major: KERNEL_VERSION,
                minor: KERNEL_MINOR_VERSION,
                max_readahead: 131072,
                flags: FUSE_EXPORT_SUPPORT
                    | FUSE_FLOCK_LOCKS
                    | FUSE_WRITEBACK_CACHE
                    | FUSE_SPLICE_READ,
            },
        },
    );
    assert_eq!(frame.hdr.error, 0);
    let out = match frame.body {
        ReplyBody::Init(i) => i,
        ref other => panic!("expected init reply, got {other:?}"),
    };

    assert!(fx.fs.session().is_initialized());
    assert_ne!(out.flags & FUSE_EXPORT_SUPPORT, 0);
    assert_ne!(out.flags & FUSE_FLOCK_LOCKS, 0);
    // Non-zero timeout: writeback caching is accepted.
    assert_ne!(out.flags & FUSE_WRITEBACK_CACHE, 0);
    // Splice transfers are never requested over virtio-fs.
    assert_eq!(out.flags & (FUSE_SPLICE_READ | FUSE_SPLICE_WRITE), 0);
    assert_eq!(out.major, KERNEL_VERSION);
}
