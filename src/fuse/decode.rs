//! Raw frame decoding.
//!
//! Splits a request frame into its `fuse_in_header` and a typed [`Request`].
//! Frame buffers come straight off the transport with no alignment
//! guarantees, so fixed-size arguments are read unaligned and copied.

use std::ffi::OsStr;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;

use thiserror::Error;

use super::abi::*;
use super::request::Request;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame truncated: need {need} bytes at offset {at}, have {have}")]
    Truncated { at: usize, need: usize, have: usize },

    #[error("string argument is not NUL-terminated")]
    BadName,

    #[error("unsupported opcode {0}")]
    Unsupported(u32),
}

impl DecodeError {
    /// Errno to report back for this decode failure.
    pub fn errno(&self) -> i32 {
        match self {
            DecodeError::Unsupported(_) => libc::ENOSYS,
            _ => libc::EINVAL,
        }
    }
}

/// Copy a wire struct out of the frame at `off`.
fn arg<T: Copy>(buf: &[u8], off: usize) -> Result<T, DecodeError> {
    let need = size_of::<T>();
    if buf.len() < off + need {
        return Err(DecodeError::Truncated {
            at: off,
            need,
            have: buf.len().saturating_sub(off),
        });
    }
    // Unaligned read of plain-old-data; T is always a repr(C) abi struct.
    Ok(unsafe { std::ptr::read_unaligned(buf[off..].as_ptr().cast::<T>()) })
}

/// Parse a NUL-terminated name starting at `off`; returns the name and the
/// offset just past its terminator.
fn name_at(buf: &[u8], off: usize) -> Result<(&OsStr, usize), DecodeError> {
    let rest = buf.get(off..).ok_or(DecodeError::BadName)?;
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::BadName)?;
    Ok((OsStr::from_bytes(&rest[..nul]), off + nul + 1))
}

/// Decode the header of a request frame.
pub fn header(frame: &[u8]) -> Result<InHeader, DecodeError> {
    arg::<InHeader>(frame, 0)
}

/// Decode the opcode-specific remainder of a request frame.
pub fn request<'a>(hdr: &InHeader, frame: &'a [u8]) -> Result<Request<'a>, DecodeError> {
    let body = size_of::<InHeader>();
    match hdr.opcode {
        FUSE_INIT => Ok(Request::Init {
            arg: arg(frame, body)?,
        }),
        FUSE_DESTROY => Ok(Request::Destroy),
        FUSE_LOOKUP => {
            let (name, _) = name_at(frame, body)?;
            Ok(Request::Lookup { name })
        }
        FUSE_FORGET => Ok(Request::Forget {
            arg: arg(frame, body)?,
        }),
        FUSE_BATCH_FORGET => {
            let head: BatchForgetIn = arg(frame, body)?;
            let mut forgets = Vec::with_capacity(head.count as usize);
            let mut off = body + size_of::<BatchForgetIn>();
            for _ in 0..head.count {
                forgets.push(arg::<ForgetOne>(frame, off)?);
                off += size_of::<ForgetOne>();
            }
            Ok(Request::BatchForget { forgets })
        }
        FUSE_GETATTR => Ok(Request::Getattr {
            arg: arg(frame, body)?,
        }),
        FUSE_SETATTR => Ok(Request::Setattr {
            arg: arg(frame, body)?,
        }),
        FUSE_READLINK => Ok(Request::Readlink),
        FUSE_MKNOD => {
            let mknod: MknodIn = arg(frame, body)?;
            let (name, _) = name_at(frame, body + size_of::<MknodIn>())?;
            Ok(Request::Mknod { arg: mknod, name })
        }
        FUSE_MKDIR => {
            let mkdir: MkdirIn = arg(frame, body)?;
            let (name, _) = name_at(frame, body + size_of::<MkdirIn>())?;
            Ok(Request::Mkdir { arg: mkdir, name })
        }
        FUSE_UNLINK => {
            let (name, _) = name_at(frame, body)?;
            Ok(Request::Unlink { name })
        }
        FUSE_RMDIR => {
            let (name, _) = name_at(frame, body)?;
            Ok(Request::Rmdir { name })
        }
        FUSE_SYMLINK => {
            let (name, next) = name_at(frame, body)?;
            let (link, _) = name_at(frame, next)?;
            Ok(Request::Symlink { name, link })
        }
        FUSE_RENAME => {
            let rename: RenameIn = arg(frame, body)?;
            let (name, next) = name_at(frame, body + size_of::<RenameIn>())?;
            let (newname, _) = name_at(frame, next)?;
            Ok(Request::Rename {
                newdir: rename.newdir,
                name,
                newname,
                flags: 0,
            })
        }
        FUSE_RENAME2 => {
            let rename: Rename2In = arg(frame, body)?;
            let (name, next) = name_at(frame, body + size_of::<Rename2In>())?;
            let (newname, _) = name_at(frame, next)?;
            Ok(Request::Rename {
                newdir: rename.newdir,
                name,
                newname,
                flags: rename.flags,
            })
        }
        FUSE_OPEN => Ok(Request::Open {
            arg: arg(frame, body)?,
        }),
        FUSE_READ => Ok(Request::Read {
            arg: arg(frame, body)?,
        }),
        FUSE_WRITE => {
            let write: WriteIn = arg(frame, body)?;
            let data_off = body + size_of::<WriteIn>();
            let end = data_off + write.size as usize;
            if frame.len() < end {
                return Err(DecodeError::Truncated {
                    at: data_off,
                    need: write.size as usize,
                    have: frame.len().saturating_sub(data_off),
                });
            }
            Ok(Request::Write {
                arg: write,
                data: &frame[data_off..end],
            })
        }
        FUSE_STATFS => Ok(Request::Statfs),
        FUSE_RELEASE => Ok(Request::Release {
            arg: arg(frame, body)?,
        }),
        FUSE_FSYNC => Ok(Request::Fsync {
            arg: arg(frame, body)?,
        }),
        FUSE_FLUSH => Ok(Request::Flush {
            arg: arg(frame, body)?,
        }),
        FUSE_OPENDIR => Ok(Request::Opendir {
            arg: arg(frame, body)?,
        }),
        FUSE_READDIR => Ok(Request::Readdir {
            arg: arg(frame, body)?,
            plus: false,
        }),
        FUSE_READDIRPLUS => Ok(Request::Readdir {
            arg: arg(frame, body)?,
            plus: true,
        }),
        FUSE_RELEASEDIR => Ok(Request::Releasedir {
            arg: arg(frame, body)?,
        }),
        FUSE_FSYNCDIR => Ok(Request::Fsyncdir {
            arg: arg(frame, body)?,
        }),
        FUSE_CREATE => {
            let create: CreateIn = arg(frame, body)?;
            let (name, _) = name_at(frame, body + size_of::<CreateIn>())?;
            Ok(Request::Create { arg: create, name })
        }
        FUSE_FALLOCATE => Ok(Request::Fallocate {
            arg: arg(frame, body)?,
        }),
        FUSE_SETLK | FUSE_SETLKW => {
            let lk: LkIn = arg(frame, body)?;
            if lk.lk_flags & FUSE_LK_FLOCK == 0 {
                // POSIX byte-range locks are not served here.
                return Err(DecodeError::Unsupported(hdr.opcode));
            }
            let mut op = match lk.lk.typ as i32 {
                libc::F_RDLCK => libc::LOCK_SH,
                libc::F_WRLCK => libc::LOCK_EX,
                _ => libc::LOCK_UN,
            };
            if hdr.opcode == FUSE_SETLK && op != libc::LOCK_UN {
                op |= libc::LOCK_NB;
            }
            Ok(Request::Flock { fh: lk.fh, op })
        }
        other => Err(DecodeError::Unsupported(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(hdr: InHeader, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(unsafe {
            std::slice::from_raw_parts(
                (&hdr as *const InHeader).cast::<u8>(),
                size_of::<InHeader>(),
            )
        });
        frame.extend_from_slice(payload);
        frame
    }

    fn hdr(opcode: u32) -> InHeader {
        InHeader {
            len: 0,
            opcode,
            unique: 1,
            nodeid: ROOT_ID,
            ..InHeader::default()
        }
    }

    #[test]
    fn test_decode_lookup() {
        let frame = frame_with(hdr(FUSE_LOOKUP), b"hello\0");
        let h = header(&frame).unwrap();
        match request(&h, &frame).unwrap() {
            Request::Lookup { name } => assert_eq!(name, OsStr::new("hello")),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_nul_is_rejected() {
        let frame = frame_with(hdr(FUSE_LOOKUP), b"hello");
        let h = header(&frame).unwrap();
        assert!(matches!(
            request(&h, &frame),
            Err(DecodeError::BadName)
        ));
    }

    #[test]
    fn test_decode_write_carries_payload() {
        let write = WriteIn {
            fh: 3,
            offset: 0,
            size: 4,
            ..WriteIn::default()
        };
        let mut payload = Vec::new();
        payload.extend_from_slice(unsafe {
            std::slice::from_raw_parts(
                (&write as *const WriteIn).cast::<u8>(),
                size_of::<WriteIn>(),
            )
        });
        payload.extend_from_slice(b"abcd");
        let frame = frame_with(hdr(FUSE_WRITE), &payload);
        let h = header(&frame).unwrap();
        match request(&h, &frame).unwrap() {
            Request::Write { arg, data } => {
                assert_eq!(arg.fh, 3);
                assert_eq!(data, b"abcd");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_opcode() {
        let frame = frame_with(hdr(9999), &[]);
        let h = header(&frame).unwrap();
        let err = request(&h, &frame).unwrap_err();
        assert_eq!(err.errno(), libc::ENOSYS);
    }

    #[test]
    fn test_decode_batch_forget() {
        let head = BatchForgetIn { count: 2, dummy: 0 };
        let one = ForgetOne {
            nodeid: 2,
            nlookup: 1,
        };
        let two = ForgetOne {
            nodeid: 3,
            nlookup: 4,
        };
        let mut payload = Vec::new();
        for bytes in [
            unsafe {
                std::slice::from_raw_parts(
                    (&head as *const BatchForgetIn).cast::<u8>(),
                    size_of::<BatchForgetIn>(),
                )
            },
            unsafe {
                std::slice::from_raw_parts(
                    (&one as *const ForgetOne).cast::<u8>(),
                    size_of::<ForgetOne>(),
                )
            },
            unsafe {
                std::slice::from_raw_parts(
                    (&two as *const ForgetOne).cast::<u8>(),
                    size_of::<ForgetOne>(),
                )
            },
        ] {
            payload.extend_from_slice(bytes);
        }
        let frame = frame_with(hdr(FUSE_BATCH_FORGET), &payload);
        let h = header(&frame).unwrap();
        match request(&h, &frame).unwrap() {
            Request::BatchForget { forgets } => {
                assert_eq!(forgets.len(), 2);
                assert_eq!(forgets[1].nodeid, 3);
                assert_eq!(forgets[1].nlookup, 4);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }
}
