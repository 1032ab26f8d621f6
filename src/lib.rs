//! Re-export a local directory tree over the virtio-fs wire protocol.
//!
//! `mirrorfs` is the file-server half of a virtio-fs device emulated on a
//! SmartNIC/DPU: decoded FUSE requests come in from the transport, get
//! translated into syscalls against a backing directory, and the replies go
//! back out: synchronously for metadata, through an io_uring completion
//! pipeline for read/write.
//!
//! The crate splits into:
//!
//! - **`fuse`**: the wire ABI, request decoding and reply framing
//! - **`passthrough`**: the translation core (inode table, directory
//!   streams, the ring submitter/reaper, one handler per opcode)
//! - **`hal`**: the dispatch/completion contract with the transport
//! - **`server`**: a Unix-socket frame transport and poll-thread pool
//! - **`config`**: the `[local_mirror]` TOML table

pub mod config;
pub mod fuse;
pub mod hal;
pub mod passthrough;
pub mod server;

// Re-export core types for convenience
pub use config::Config;
pub use hal::{CompletionContext, CompletionStatus, DispatchOutcome, Hal};
pub use passthrough::PassthroughFs;
pub use server::Server;
