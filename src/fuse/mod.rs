//! FUSE wire protocol: ABI structs, request decoding and reply framing.

pub mod abi;
pub mod decode;
pub mod reply;
pub mod request;

pub use abi::{InHeader, OutHeader, ROOT_ID};
pub use reply::{DirBuf, ReplyBody, ReplyFrame};
pub use request::Request;
