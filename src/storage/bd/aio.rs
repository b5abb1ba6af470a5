//! Linux async I/O engine for the bd backend.
//!
//! Submitters build a control block per request and hand it to the
//! kernel ring; one reaper thread drains completions and finishes the
//! FOPs. The submitter and the reaper share nothing but the control
//! block the kernel carries for them.

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use log::debug;
use log::error;
use log::warn;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::errno::Errno;
use crate::fd::Fd;
use crate::fop::FopReply;
use crate::fop::Reply;
use crate::frame::CallFrame;
use crate::iatt::Iatt;
use crate::iobuf::IoBuf;
use crate::iobuf::IoVec;
use crate::iobuf::IoVecList;
use crate::iobuf::Iobref;

use super::AlignedBuf;
use super::BD_CTX;
use super::BdAttr;

/// Ring depth requested at `io_setup`.
const AIO_MAX_EVENTS: libc::c_long = 256;
/// Completions drained per `io_getevents` call.
const AIO_GETEVENTS_MAX: usize = 16;
/// Reaper wait per `io_getevents` call.
const AIO_WAIT_SECS: i64 = 5;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// Kernel `struct iocb` (fs/aio.c ABI, little-endian fields on x86/arm).
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes)]
#[repr(C)]
struct KernelIocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// Kernel `struct io_event`.
#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes)]
#[repr(C)]
struct KernelIoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

/// Direction of an in-flight request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum AioOp {
    /// pread into the control block's buffer.
    Read,
    /// pwrite from the control block's buffer.
    Write,
}

/// Everything a completion needs to finish its FOP.
pub(super) struct AioCb {
    frame: CallFrame,
    fd: Arc<Fd>,
    op: AioOp,
    offset: u64,
    /// Read destination or write source. Block-aligned: the fd may be
    /// in O_DIRECT mode, which rejects unaligned memory.
    buffer: AlignedBuf,
    /// Bytes requested (read) or carried (write).
    len: usize,
    /// Attributes captured before submission (write pre-buf).
    prebuf: Iatt,
}

impl AioCb {
    fn complete(self: Box<Self>, res: i64) {
        match self.op {
            AioOp::Read => self.complete_read(res),
            AioOp::Write => self.complete_write(res),
        }
    }

    fn complete_read(self: Box<Self>, res: i64) {
        if res < 0 {
            let errno = Errno(-res as i32);
            error!(
                "async readv failed offset={} len={}: {errno}",
                self.offset, self.len
            );
            return self.frame.unwind_error(errno);
        }
        let AioCb {
            frame,
            fd,
            offset,
            buffer,
            len,
            ..
        } = *self;
        let n = (res as usize).min(len);

        let mut op_errno = Errno::OK;
        let mut stbuf = Iatt::default();
        if let Some(attr) = fd.inode().ctx_get::<BdAttr>(BD_CTX) {
            attr.touch_atime();
            stbuf = attr.iatt();
            if offset + n as u64 >= stbuf.ia_size {
                op_errno = Errno::ENOENT;
            }
        }

        let buf = IoBuf::from_vec(buffer.as_slice()[..n].to_vec());
        let mut iobref = Iobref::new();
        iobref.add(&buf);
        let mut vector = IoVecList::new();
        vector.push(IoVec::whole(buf));
        frame.unwind(Reply {
            op_ret: n as i64,
            op_errno,
            data: FopReply::Readv {
                vector,
                stbuf,
                iobref,
                xdata: None,
            },
        });
    }

    fn complete_write(self: Box<Self>, res: i64) {
        if res < 0 {
            let errno = Errno(-res as i32);
            error!(
                "async writev failed offset={} len={}: {errno}",
                self.offset, self.len
            );
            return self.frame.unwind_error(errno);
        }
        let postbuf = match self.fd.inode().ctx_get::<BdAttr>(BD_CTX) {
            Some(attr) => {
                attr.touch_mtime();
                attr.iatt()
            }
            None => self.prebuf,
        };
        self.frame.unwind(Reply {
            op_ret: res,
            op_errno: Errno::OK,
            data: FopReply::Writev {
                prebuf: self.prebuf,
                postbuf,
                xdata: None,
            },
        });
    }
}

/// One kernel completion ring plus its reaper thread.
pub(super) struct AioEngine {
    ctx: u64,
    stop: Arc<AtomicBool>,
}

impl AioEngine {
    /// `io_setup` a ring and start the reaper. Failure leaves the
    /// backend in sync mode.
    pub(super) fn new(name: &str) -> io::Result<Arc<AioEngine>> {
        let mut ctx: u64 = 0;
        let rc = unsafe {
            libc::syscall(libc::SYS_io_setup, AIO_MAX_EVENTS, &mut ctx)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let engine = Arc::new(AioEngine { ctx, stop });

        let reaper = engine.clone();
        let thread_name = format!("{name}-aio-reaper");
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || reaper.reap_loop())?;
        Ok(engine)
    }

    /// Submit a read of `size` bytes at `offset`.
    pub(super) fn submit_read(
        self: &Arc<Self>,
        frame: CallFrame,
        fd: Arc<Fd>,
        raw_fd: i32,
        size: usize,
        offset: u64,
    ) {
        let cb = Box::new(AioCb {
            frame,
            fd,
            op: AioOp::Read,
            offset,
            buffer: AlignedBuf::new(size),
            len: size,
            prebuf: Iatt::default(),
        });
        self.submit(cb, IOCB_CMD_PREAD, raw_fd);
    }

    /// Submit a write of `data` at `offset`.
    pub(super) fn submit_write(
        self: &Arc<Self>,
        frame: CallFrame,
        fd: Arc<Fd>,
        raw_fd: i32,
        data: Vec<u8>,
        offset: u64,
        prebuf: Iatt,
    ) {
        let cb = Box::new(AioCb {
            frame,
            fd,
            op: AioOp::Write,
            offset,
            buffer: AlignedBuf::from_slice(&data),
            len: data.len(),
            prebuf,
        });
        self.submit(cb, IOCB_CMD_PWRITE, raw_fd);
    }

    fn submit(&self, cb: Box<AioCb>, opcode: u16, raw_fd: i32) {
        let offset = cb.offset;
        let nbytes = cb.len;
        let buf_ptr = cb.buffer.as_slice().as_ptr() as u64;
        let data = Box::into_raw(cb) as u64;

        let mut iocb = KernelIocb {
            aio_data: data,
            aio_lio_opcode: opcode,
            aio_fildes: raw_fd as u32,
            aio_buf: buf_ptr,
            aio_nbytes: nbytes as u64,
            aio_offset: offset as i64,
            ..Default::default()
        };
        let mut iocbs = [&mut iocb as *mut KernelIocb];
        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_submit,
                self.ctx,
                1 as libc::c_long,
                iocbs.as_mut_ptr(),
            )
        };
        if rc != 1 {
            let err = io::Error::last_os_error();
            warn!("io_submit failed: {err}");
            // reclaim the control block and fail the FOP in place
            let cb = unsafe { Box::from_raw(data as *mut AioCb) };
            cb.frame.unwind_error(Errno::from(err));
        }
    }

    fn reap_loop(self: Arc<Self>) {
        let mut events = [KernelIoEvent::default(); AIO_GETEVENTS_MAX];
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let timeout = libc::timespec {
                tv_sec: AIO_WAIT_SECS,
                tv_nsec: 0,
            };
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_io_getevents,
                    self.ctx,
                    1 as libc::c_long,
                    AIO_GETEVENTS_MAX as libc::c_long,
                    events.as_mut_ptr(),
                    &timeout,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                // ring destroyed or unrecoverable; stop consuming
                if !self.stop.load(Ordering::Acquire) {
                    error!("io_getevents failed, reaper exiting: {err}");
                }
                break;
            }
            for event in &events[..rc as usize] {
                let cb =
                    unsafe { Box::from_raw(event.data as *mut AioCb) };
                cb.complete(event.res);
            }
        }
        debug!("aio reaper stopped");
    }

    /// Stop the reaper and tear the ring down. In-flight requests are
    /// completed or failed by the kernel before destroy returns.
    pub(super) fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        let rc = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
        if rc != 0 {
            warn!("io_destroy failed: {}", io::Error::last_os_error());
        }
    }
}

impl std::fmt::Debug for AioEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioEngine").field("ctx", &self.ctx).finish()
    }
}

/// True when a request may run O_DIRECT: both offset and length sit on
/// 4 KiB boundaries.
pub(super) fn direct_ok(offset: u64, len: u64) -> bool {
    (offset | len) & 0xfff == 0
}
