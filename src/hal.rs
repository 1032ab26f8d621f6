//! Boundary types between the filesystem core and the device transport.
//!
//! On a DPU deployment the hardware abstraction layer polls the virtio-fs
//! queues, decodes request frames and feeds them into
//! [`PassthroughFs::dispatch`](crate::passthrough::PassthroughFs::dispatch).
//! The core either finishes a request inline or parks its reply until the
//! I/O ring completes it; in the latter case the transport is notified
//! through [`Hal::async_complete`], exactly once per [`DispatchOutcome::Async`]
//! return.

use crate::fuse::ReplyFrame;

/// Opaque per-request token minted by the transport. The core carries it
/// through the async I/O pipeline and hands it back on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionContext(pub u64);

/// Completion status reported back to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The reply frame is filled in and ready to ship (its header may still
    /// carry a negative errno).
    Success,
    /// The request could not be completed; the transport decides whether to
    /// ship the error reply or tear down the queue.
    Error,
}

/// Result of dispatching one request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The reply is complete; ship it now.
    Sync(Box<ReplyFrame>),
    /// The request was submitted to the I/O ring. The reply frame is parked
    /// in the submission cookie and will surface via `async_complete`.
    Async,
}

impl DispatchOutcome {
    /// Unwrap the synchronous reply; panics on `Async`. Test helper.
    pub fn expect_sync(self) -> Box<ReplyFrame> {
        match self {
            DispatchOutcome::Sync(frame) => frame,
            DispatchOutcome::Async => panic!("expected synchronous completion"),
        }
    }
}

/// Callback surface implemented by the transport.
pub trait Hal: Send + Sync {
    /// Deliver the reply for a request that previously returned
    /// [`DispatchOutcome::Async`]. Called from a completion reaper thread.
    fn async_complete(
        &self,
        ctx: CompletionContext,
        status: CompletionStatus,
        frame: Box<ReplyFrame>,
    );
}
