//! Frame transport and poll-thread pool.
//!
//! Stands in for the DPU hardware abstraction layer: raw FUSE request
//! frames arrive length-prefixed over a Unix socket, a fixed pool of poll
//! threads decodes and dispatches them, and replies are shipped as they
//! complete: synchronously from the poll thread, or from a completion
//! reaper via [`Hal::async_complete`]. Out-of-order replies are fine; the
//! `unique` id in the reply header pairs them up on the client side.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::config::LocalMirror;
use crate::fuse::abi::{FUSE_BATCH_FORGET, FUSE_FORGET};
use crate::fuse::{decode, ReplyFrame, Request};
use crate::hal::{CompletionContext, CompletionStatus, DispatchOutcome, Hal};
use crate::passthrough::PassthroughFs;

/// Upper bound on a single request frame (header + write payload).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

type Writer = Arc<Mutex<UnixStream>>;

/// Ship one reply, length-prefixed.
fn ship(writer: &Writer, frame: &ReplyFrame) -> io::Result<()> {
    let bytes = frame.to_bytes();
    let mut stream = writer.lock().unwrap_or_else(|e| e.into_inner());
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(&bytes)
}

/// Transport-side completion routing.
///
/// Every dispatched request registers the connection it arrived on; async
/// completions look the connection up by the completion context and ship the
/// reply from the reaper thread. Error completions still carry a filled-in
/// errno reply, so both statuses ship.
pub struct SocketHal {
    pending: Mutex<Slab<Writer>>,
}

impl SocketHal {
    pub fn new() -> Self {
        SocketHal {
            pending: Mutex::new(Slab::new()),
        }
    }

    fn register(&self, writer: Writer) -> CompletionContext {
        let key = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(writer);
        CompletionContext(key as u64)
    }

    fn take(&self, ctx: CompletionContext) -> Option<Writer> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains(ctx.0 as usize) {
            Some(pending.remove(ctx.0 as usize))
        } else {
            None
        }
    }
}

impl Default for SocketHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal for SocketHal {
    fn async_complete(
        &self,
        ctx: CompletionContext,
        status: CompletionStatus,
        frame: Box<ReplyFrame>,
    ) {
        let Some(writer) = self.take(ctx) else {
            error!(target: "mirrorfs::server", ctx = ctx.0, "completion for unknown context");
            return;
        };
        debug!(
            target: "mirrorfs::server",
            unique = frame.hdr.unique,
            ?status,
            "shipping async reply"
        );
        if let Err(e) = ship(&writer, &frame) {
            warn!(target: "mirrorfs::server", error = %e, "failed to ship async reply");
        }
    }
}

/// The mirror daemon: filesystem core plus its frame transport.
pub struct Server {
    fs: Arc<PassthroughFs>,
    hal: Arc<SocketHal>,
    config: LocalMirror,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: LocalMirror, shutdown: Arc<AtomicBool>) -> anyhow::Result<Self> {
        let hal = Arc::new(SocketHal::new());
        let fs = PassthroughFs::new(
            &config.dir,
            config.metadata_timeout,
            config.queue_depth,
            Arc::clone(&hal) as Arc<dyn Hal>,
        )
        .with_context(|| format!("cannot export {}", config.dir.display()))?;

        Ok(Server {
            fs: Arc::new(fs),
            hal,
            config,
            shutdown,
        })
    }

    pub fn filesystem(&self) -> &Arc<PassthroughFs> {
        &self.fs
    }

    /// Accept and serve connections until shutdown is requested, then drain
    /// in-flight completions before unregistering the device.
    pub fn serve(&self) -> anyhow::Result<()> {
        let socket = &self.config.socket;
        let _ = std::fs::remove_file(socket);
        let listener = UnixListener::bind(socket)
            .with_context(|| format!("cannot bind {}", socket.display()))?;
        listener.set_nonblocking(true)?;

        info!(
            target: "mirrorfs::server",
            socket = %socket.display(),
            nthreads = self.config.nthreads,
            "listening"
        );

        self.fs.register_device(0);
        let reapers = self.fs.start_reapers(
            self.config.uring_cq_polling,
            self.config.uring_cq_polling_nthreads,
            Arc::clone(&self.shutdown),
        );

        let mut connections = Vec::new();
        let mut client_id = 0u32;
        while !self.shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let id = client_id;
                    client_id += 1;
                    info!(target: "mirrorfs::server", client_id = id, "client connected");

                    let fs = Arc::clone(&self.fs);
                    let hal = Arc::clone(&self.hal);
                    let shutdown = Arc::clone(&self.shutdown);
                    let nthreads = self.config.nthreads;
                    connections.push(
                        std::thread::Builder::new()
                            .name(format!("mirrorfs-conn-{id}"))
                            .spawn(move || {
                                if let Err(e) =
                                    serve_connection(fs, hal, stream, nthreads, shutdown)
                                {
                                    error!(
                                        target: "mirrorfs::server",
                                        client_id = id,
                                        error = %e,
                                        "connection error"
                                    );
                                }
                                debug!(target: "mirrorfs::server", client_id = id, "client disconnected");
                            })?,
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(e).context("accept failed"),
            }
        }

        info!(target: "mirrorfs::server", "shutting down; draining completions");
        for conn in connections {
            let _ = conn.join();
        }
        for reaper in reapers {
            let _ = reaper.join();
        }
        self.fs.drain();
        self.fs.unregister_device(0);
        let _ = std::fs::remove_file(socket);
        Ok(())
    }
}

/// Read until `buf` is full. Returns the bytes read; short counts mean EOF,
/// or a shutdown observed on a frame boundary.
fn read_full(
    stream: &mut UnixStream,
    buf: &mut [u8],
    shutdown: &AtomicBool,
) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        if read == 0 && shutdown.load(Ordering::Acquire) {
            return Ok(0);
        }
        match stream.read(&mut buf[read..]) {
            Ok(0) => return Ok(read),
            Ok(n) => read += n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

/// Pump one connection: a reader feeding a fixed pool of poll threads.
fn serve_connection(
    fs: Arc<PassthroughFs>,
    hal: Arc<SocketHal>,
    mut stream: UnixStream,
    nthreads: usize,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(100)))?;
    let writer: Writer = Arc::new(Mutex::new(stream.try_clone()?));

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let rx = Arc::new(Mutex::new(rx));

    let workers: Vec<_> = (0..nthreads.max(1))
        .map(|id| {
            let fs = Arc::clone(&fs);
            let hal = Arc::clone(&hal);
            let writer = Arc::clone(&writer);
            let rx = Arc::clone(&rx);
            std::thread::Builder::new()
                .name(format!("mirrorfs-poll-{id}"))
                .spawn(move || loop {
                    let frame = rx.lock().unwrap_or_else(|e| e.into_inner()).recv();
                    match frame {
                        Ok(frame) => handle_frame(&fs, &hal, &writer, &frame),
                        Err(_) => break,
                    }
                })
                .expect("spawn poll thread")
        })
        .collect();

    loop {
        let mut len_buf = [0u8; 4];
        if read_full(&mut stream, &mut len_buf, &shutdown)? < len_buf.len() {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            anyhow::bail!("request frame too large: {len} bytes");
        }

        let mut frame = vec![0u8; len];
        if read_full(&mut stream, &mut frame, &shutdown)? < len {
            break;
        }
        tx.send(frame).ok();
    }

    drop(tx);
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

/// Decode and dispatch one request frame, shipping the reply when it
/// completes synchronously.
fn handle_frame(fs: &PassthroughFs, hal: &SocketHal, writer: &Writer, frame: &[u8]) {
    let hdr = match decode::header(frame) {
        Ok(hdr) => hdr,
        Err(e) => {
            warn!(target: "mirrorfs::server", error = %e, "dropping undecodable frame");
            return;
        }
    };
    // Forget variants carry no reply.
    let no_reply = matches!(hdr.opcode, FUSE_FORGET | FUSE_BATCH_FORGET);

    let req = match decode::request(&hdr, frame) {
        Ok(req) => req,
        Err(e) => {
            debug!(target: "mirrorfs::server", opcode = hdr.opcode, error = %e, "decode error");
            if !no_reply {
                let mut reply = ReplyFrame::new(hdr.unique);
                reply.set_error(e.errno());
                if let Err(e) = ship(writer, &reply) {
                    warn!(target: "mirrorfs::server", error = %e, "failed to ship reply");
                }
            }
            return;
        }
    };

    // Data-carrying replies get their buffer sized up front, like the
    // pre-allocated reply iovecs a virtio-fs queue would hand us.
    let data_cap = match &req {
        Request::Read { arg } => arg.size as usize,
        Request::Readdir { arg, .. } => arg.size as usize,
        _ => 0,
    };
    let reply = Box::new(ReplyFrame::with_data_capacity(hdr.unique, data_cap));

    let ctx = hal.register(Arc::clone(writer));
    match fs.dispatch(&hdr, req, reply, ctx) {
        DispatchOutcome::Sync(reply) => {
            hal.take(ctx);
            if !no_reply {
                if let Err(e) = ship(writer, &reply) {
                    warn!(target: "mirrorfs::server", error = %e, "failed to ship reply");
                }
            }
        }
        DispatchOutcome::Async => {}
    }
}
