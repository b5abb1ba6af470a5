//! The translator interface.
//!
//! A translator exposes the full FOP surface; every method has a default
//! implementation that forwards to the first child, so a translator
//! overrides only what it transforms. [`dispatch`] is the single
//! exhaustive bridge from a captured [`FopRequest`] to the right trait
//! method; the compiler guarantees no kind is left without a route.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use log::error;

use crate::dict::Dict;
use crate::errno::Errno;
use crate::fd::Fd;
use crate::fop::EntrylkCmd;
use crate::fop::EntrylkType;
use crate::fop::Flock;
use crate::fop::FopRequest;
use crate::fop::GfLease;
use crate::fop::LockInfo;
use crate::fop::Reply;
use crate::fop::SeekWhat;
use crate::frame::CallFrame;
use crate::frame::CallRoot;
use crate::iatt::Iatt;
use crate::iatt::IattValid;
use crate::inode::Inode;
use crate::inode::InodeTable;
use crate::iobuf::Iobref;
use crate::iobuf::IoVecList;
use crate::loc::Loc;

/// Shared handle to a translator.
pub type XlatorRef = Arc<dyn Xlator>;

/// A stacked filesystem module.
#[allow(missing_docs)]
pub trait Xlator: Send + Sync {
    /// Instance name, used in log lines and context-slot keys.
    fn name(&self) -> &str;

    /// Children, top to bottom preference order. Leaves return none.
    fn children(&self) -> Vec<XlatorRef>;

    /// The child a plain forward goes to.
    fn first_child(&self) -> Option<XlatorRef> {
        self.children().first().cloned()
    }

    // Lifecycle notifications; these do not travel as frames.

    /// The inode table dropped its last binding for `inode`.
    fn forget(&self, _inode: &Arc<Inode>) {}
    /// The last holder of a file fd closed it.
    fn release(&self, _fd: &Arc<Fd>) {}
    /// The last holder of a directory fd closed it.
    fn releasedir(&self, _fd: &Arc<Fd>) {}
    /// A layer above declared the inode's cached state invalid.
    fn invalidate(&self, _inode: &Arc<Inode>) {}

    // FOPs. Defaults forward unchanged.

    fn lookup(&self, frame: CallFrame, loc: Loc, xdata: Option<Dict>) {
        forward(self, frame, FopRequest::Lookup { loc, xdata });
    }

    fn stat(&self, frame: CallFrame, loc: Loc, xdata: Option<Dict>) {
        forward(self, frame, FopRequest::Stat { loc, xdata });
    }

    fn fstat(&self, frame: CallFrame, fd: Arc<Fd>, xdata: Option<Dict>) {
        forward(self, frame, FopRequest::Fstat { fd, xdata });
    }

    fn statfs(&self, frame: CallFrame, loc: Loc, xdata: Option<Dict>) {
        forward(self, frame, FopRequest::Statfs { loc, xdata });
    }

    fn truncate(
        &self,
        frame: CallFrame,
        loc: Loc,
        offset: u64,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Truncate { loc, offset, xdata });
    }

    fn ftruncate(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Ftruncate { fd, offset, xdata });
    }

    fn access(
        &self,
        frame: CallFrame,
        loc: Loc,
        mask: i32,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Access { loc, mask, xdata });
    }

    fn readlink(
        &self,
        frame: CallFrame,
        loc: Loc,
        size: u64,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Readlink { loc, size, xdata });
    }

    fn mknod(
        &self,
        frame: CallFrame,
        loc: Loc,
        mode: u32,
        rdev: u64,
        umask: u32,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Mknod {
                loc,
                mode,
                rdev,
                umask,
                xdata,
            },
        );
    }

    fn mkdir(
        &self,
        frame: CallFrame,
        loc: Loc,
        mode: u32,
        umask: u32,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Mkdir {
                loc,
                mode,
                umask,
                xdata,
            },
        );
    }

    fn unlink(
        &self,
        frame: CallFrame,
        loc: Loc,
        flags: i32,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Unlink { loc, flags, xdata });
    }

    fn rmdir(
        &self,
        frame: CallFrame,
        loc: Loc,
        flags: i32,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Rmdir { loc, flags, xdata });
    }

    fn symlink(
        &self,
        frame: CallFrame,
        linkpath: String,
        loc: Loc,
        umask: u32,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Symlink {
                linkpath,
                loc,
                umask,
                xdata,
            },
        );
    }

    fn rename(
        &self,
        frame: CallFrame,
        oldloc: Loc,
        newloc: Loc,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Rename {
                oldloc,
                newloc,
                xdata,
            },
        );
    }

    fn link(
        &self,
        frame: CallFrame,
        oldloc: Loc,
        newloc: Loc,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Link {
                oldloc,
                newloc,
                xdata,
            },
        );
    }

    fn create(
        &self,
        frame: CallFrame,
        loc: Loc,
        flags: i32,
        mode: u32,
        umask: u32,
        fd: Arc<Fd>,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Create {
                loc,
                flags,
                mode,
                umask,
                fd,
                xdata,
            },
        );
    }

    fn open(
        &self,
        frame: CallFrame,
        loc: Loc,
        flags: i32,
        fd: Arc<Fd>,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Open {
                loc,
                flags,
                fd,
                xdata,
            },
        );
    }

    fn readv(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        size: u64,
        offset: u64,
        flags: u32,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Readv {
                fd,
                size,
                offset,
                flags,
                xdata,
            },
        );
    }

    fn writev(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        vector: IoVecList,
        offset: u64,
        flags: u32,
        iobref: Iobref,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Writev {
                fd,
                vector,
                offset,
                flags,
                iobref,
                xdata,
            },
        );
    }

    fn flush(&self, frame: CallFrame, fd: Arc<Fd>, xdata: Option<Dict>) {
        forward(self, frame, FopRequest::Flush { fd, xdata });
    }

    fn fsync(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        datasync: bool,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Fsync {
                fd,
                datasync,
                xdata,
            },
        );
    }

    fn opendir(
        &self,
        frame: CallFrame,
        loc: Loc,
        fd: Arc<Fd>,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Opendir { loc, fd, xdata });
    }

    fn fsyncdir(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        datasync: bool,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Fsyncdir {
                fd,
                datasync,
                xdata,
            },
        );
    }

    fn setxattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        dict: Dict,
        flags: i32,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Setxattr {
                loc,
                dict,
                flags,
                xdata,
            },
        );
    }

    fn getxattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        name: Option<String>,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Getxattr { loc, name, xdata });
    }

    fn fsetxattr(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        dict: Dict,
        flags: i32,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Fsetxattr {
                fd,
                dict,
                flags,
                xdata,
            },
        );
    }

    fn fgetxattr(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        name: Option<String>,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Fgetxattr { fd, name, xdata });
    }

    fn removexattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        name: String,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Removexattr { loc, name, xdata });
    }

    fn fremovexattr(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        name: String,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Fremovexattr { fd, name, xdata });
    }

    fn lk(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        cmd: i32,
        flock: Flock,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Lk {
                fd,
                cmd,
                flock,
                xdata,
            },
        );
    }

    fn inodelk(
        &self,
        frame: CallFrame,
        volume: String,
        loc: Loc,
        cmd: i32,
        flock: Flock,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Inodelk {
                volume,
                loc,
                cmd,
                flock,
                xdata,
            },
        );
    }

    fn finodelk(
        &self,
        frame: CallFrame,
        volume: String,
        fd: Arc<Fd>,
        cmd: i32,
        flock: Flock,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Finodelk {
                volume,
                fd,
                cmd,
                flock,
                xdata,
            },
        );
    }

    fn entrylk(
        &self,
        frame: CallFrame,
        volume: String,
        loc: Loc,
        basename: Option<String>,
        cmd: EntrylkCmd,
        lk_type: EntrylkType,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Entrylk {
                volume,
                loc,
                basename,
                cmd,
                lk_type,
                xdata,
            },
        );
    }

    fn fentrylk(
        &self,
        frame: CallFrame,
        volume: String,
        fd: Arc<Fd>,
        basename: Option<String>,
        cmd: EntrylkCmd,
        lk_type: EntrylkType,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Fentrylk {
                volume,
                fd,
                basename,
                cmd,
                lk_type,
                xdata,
            },
        );
    }

    fn readdir(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        size: u64,
        offset: u64,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Readdir {
                fd,
                size,
                offset,
                xdata,
            },
        );
    }

    fn readdirp(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        size: u64,
        offset: u64,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Readdirp {
                fd,
                size,
                offset,
                xdata,
            },
        );
    }

    fn rchecksum(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        len: u32,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Rchecksum {
                fd,
                offset,
                len,
                xdata,
            },
        );
    }

    fn xattrop(
        &self,
        frame: CallFrame,
        loc: Loc,
        optype: i32,
        dict: Dict,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Xattrop {
                loc,
                optype,
                dict,
                xdata,
            },
        );
    }

    fn fxattrop(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        optype: i32,
        dict: Dict,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Fxattrop {
                fd,
                optype,
                dict,
                xdata,
            },
        );
    }

    fn setattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        stbuf: Iatt,
        valid: IattValid,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Setattr {
                loc,
                stbuf,
                valid,
                xdata,
            },
        );
    }

    fn fsetattr(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        stbuf: Iatt,
        valid: IattValid,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Fsetattr {
                fd,
                stbuf,
                valid,
                xdata,
            },
        );
    }

    fn fallocate(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        keep_size: bool,
        offset: u64,
        len: u64,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Fallocate {
                fd,
                keep_size,
                offset,
                len,
                xdata,
            },
        );
    }

    fn discard(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        len: u64,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Discard {
                fd,
                offset,
                len,
                xdata,
            },
        );
    }

    fn zerofill(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        len: u64,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Zerofill {
                fd,
                offset,
                len,
                xdata,
            },
        );
    }

    fn ipc(&self, frame: CallFrame, op: i32, xdata: Option<Dict>) {
        forward(self, frame, FopRequest::Ipc { op, xdata });
    }

    fn lease(
        &self,
        frame: CallFrame,
        loc: Loc,
        lease: GfLease,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Lease { loc, lease, xdata });
    }

    fn seek(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        what: SeekWhat,
        xdata: Option<Dict>,
    ) {
        forward(
            self,
            frame,
            FopRequest::Seek {
                fd,
                offset,
                what,
                xdata,
            },
        );
    }

    fn getactivelk(&self, frame: CallFrame, loc: Loc, xdata: Option<Dict>) {
        forward(self, frame, FopRequest::Getactivelk { loc, xdata });
    }

    fn setactivelk(
        &self,
        frame: CallFrame,
        loc: Loc,
        locks: Vec<LockInfo>,
        xdata: Option<Dict>,
    ) {
        forward(self, frame, FopRequest::Setactivelk { loc, locks, xdata });
    }
}

/// Forward `req` to the first child on the same frame.
///
/// Leaves answering a FOP they never implemented reply `EOPNOTSUPP`.
pub fn forward<X: Xlator + ?Sized>(xl: &X, frame: CallFrame, req: FopRequest) {
    match xl.first_child() {
        Some(child) => dispatch(&child, frame, req),
        None => {
            error!(
                "{}: no child to forward {} to",
                xl.name(),
                req.kind()
            );
            frame.unwind(Reply::error(req.kind(), Errno::EOPNOTSUPP));
        }
    }
}

/// Route a captured request to `target`'s method for its kind.
///
/// Sets the frame's current position to `target` first, so a stub
/// resumed on any thread re-enters the stack exactly where it left.
pub fn dispatch(target: &XlatorRef, frame: CallFrame, req: FopRequest) {
    frame.set_this(target.clone());
    match req {
        FopRequest::Lookup { loc, xdata } => target.lookup(frame, loc, xdata),
        FopRequest::Stat { loc, xdata } => target.stat(frame, loc, xdata),
        FopRequest::Fstat { fd, xdata } => target.fstat(frame, fd, xdata),
        FopRequest::Statfs { loc, xdata } => target.statfs(frame, loc, xdata),
        FopRequest::Truncate { loc, offset, xdata } => {
            target.truncate(frame, loc, offset, xdata)
        }
        FopRequest::Ftruncate { fd, offset, xdata } => {
            target.ftruncate(frame, fd, offset, xdata)
        }
        FopRequest::Access { loc, mask, xdata } => {
            target.access(frame, loc, mask, xdata)
        }
        FopRequest::Readlink { loc, size, xdata } => {
            target.readlink(frame, loc, size, xdata)
        }
        FopRequest::Mknod {
            loc,
            mode,
            rdev,
            umask,
            xdata,
        } => target.mknod(frame, loc, mode, rdev, umask, xdata),
        FopRequest::Mkdir {
            loc,
            mode,
            umask,
            xdata,
        } => target.mkdir(frame, loc, mode, umask, xdata),
        FopRequest::Unlink { loc, flags, xdata } => {
            target.unlink(frame, loc, flags, xdata)
        }
        FopRequest::Rmdir { loc, flags, xdata } => {
            target.rmdir(frame, loc, flags, xdata)
        }
        FopRequest::Symlink {
            linkpath,
            loc,
            umask,
            xdata,
        } => target.symlink(frame, linkpath, loc, umask, xdata),
        FopRequest::Rename {
            oldloc,
            newloc,
            xdata,
        } => target.rename(frame, oldloc, newloc, xdata),
        FopRequest::Link {
            oldloc,
            newloc,
            xdata,
        } => target.link(frame, oldloc, newloc, xdata),
        FopRequest::Create {
            loc,
            flags,
            mode,
            umask,
            fd,
            xdata,
        } => target.create(frame, loc, flags, mode, umask, fd, xdata),
        FopRequest::Open {
            loc,
            flags,
            fd,
            xdata,
        } => target.open(frame, loc, flags, fd, xdata),
        FopRequest::Readv {
            fd,
            size,
            offset,
            flags,
            xdata,
        } => target.readv(frame, fd, size, offset, flags, xdata),
        FopRequest::Writev {
            fd,
            vector,
            offset,
            flags,
            iobref,
            xdata,
        } => target.writev(frame, fd, vector, offset, flags, iobref, xdata),
        FopRequest::Flush { fd, xdata } => target.flush(frame, fd, xdata),
        FopRequest::Fsync {
            fd,
            datasync,
            xdata,
        } => target.fsync(frame, fd, datasync, xdata),
        FopRequest::Opendir { loc, fd, xdata } => {
            target.opendir(frame, loc, fd, xdata)
        }
        FopRequest::Fsyncdir {
            fd,
            datasync,
            xdata,
        } => target.fsyncdir(frame, fd, datasync, xdata),
        FopRequest::Setxattr {
            loc,
            dict,
            flags,
            xdata,
        } => target.setxattr(frame, loc, dict, flags, xdata),
        FopRequest::Getxattr { loc, name, xdata } => {
            target.getxattr(frame, loc, name, xdata)
        }
        FopRequest::Fsetxattr {
            fd,
            dict,
            flags,
            xdata,
        } => target.fsetxattr(frame, fd, dict, flags, xdata),
        FopRequest::Fgetxattr { fd, name, xdata } => {
            target.fgetxattr(frame, fd, name, xdata)
        }
        FopRequest::Removexattr { loc, name, xdata } => {
            target.removexattr(frame, loc, name, xdata)
        }
        FopRequest::Fremovexattr { fd, name, xdata } => {
            target.fremovexattr(frame, fd, name, xdata)
        }
        FopRequest::Lk {
            fd,
            cmd,
            flock,
            xdata,
        } => target.lk(frame, fd, cmd, flock, xdata),
        FopRequest::Inodelk {
            volume,
            loc,
            cmd,
            flock,
            xdata,
        } => target.inodelk(frame, volume, loc, cmd, flock, xdata),
        FopRequest::Finodelk {
            volume,
            fd,
            cmd,
            flock,
            xdata,
        } => target.finodelk(frame, volume, fd, cmd, flock, xdata),
        FopRequest::Entrylk {
            volume,
            loc,
            basename,
            cmd,
            lk_type,
            xdata,
        } => target.entrylk(frame, volume, loc, basename, cmd, lk_type, xdata),
        FopRequest::Fentrylk {
            volume,
            fd,
            basename,
            cmd,
            lk_type,
            xdata,
        } => target.fentrylk(frame, volume, fd, basename, cmd, lk_type, xdata),
        FopRequest::Readdir {
            fd,
            size,
            offset,
            xdata,
        } => target.readdir(frame, fd, size, offset, xdata),
        FopRequest::Readdirp {
            fd,
            size,
            offset,
            xdata,
        } => target.readdirp(frame, fd, size, offset, xdata),
        FopRequest::Rchecksum {
            fd,
            offset,
            len,
            xdata,
        } => target.rchecksum(frame, fd, offset, len, xdata),
        FopRequest::Xattrop {
            loc,
            optype,
            dict,
            xdata,
        } => target.xattrop(frame, loc, optype, dict, xdata),
        FopRequest::Fxattrop {
            fd,
            optype,
            dict,
            xdata,
        } => target.fxattrop(frame, fd, optype, dict, xdata),
        FopRequest::Setattr {
            loc,
            stbuf,
            valid,
            xdata,
        } => target.setattr(frame, loc, stbuf, valid, xdata),
        FopRequest::Fsetattr {
            fd,
            stbuf,
            valid,
            xdata,
        } => target.fsetattr(frame, fd, stbuf, valid, xdata),
        FopRequest::Fallocate {
            fd,
            keep_size,
            offset,
            len,
            xdata,
        } => target.fallocate(frame, fd, keep_size, offset, len, xdata),
        FopRequest::Discard {
            fd,
            offset,
            len,
            xdata,
        } => target.discard(frame, fd, offset, len, xdata),
        FopRequest::Zerofill {
            fd,
            offset,
            len,
            xdata,
        } => target.zerofill(frame, fd, offset, len, xdata),
        FopRequest::Ipc { op, xdata } => target.ipc(frame, op, xdata),
        FopRequest::Lease { loc, lease, xdata } => {
            target.lease(frame, loc, lease, xdata)
        }
        FopRequest::Seek {
            fd,
            offset,
            what,
            xdata,
        } => target.seek(frame, fd, offset, what, xdata),
        FopRequest::Getactivelk { loc, xdata } => {
            target.getactivelk(frame, loc, xdata)
        }
        FopRequest::Setactivelk { loc, locks, xdata } => {
            target.setactivelk(frame, loc, locks, xdata)
        }
    }
}

/// Wind `req` to `target` on a fresh child frame. The reply callback
/// receives the parent frame back along with the reply. This is how a
/// translator intercepts a reply before unwinding it.
pub fn wind<F>(
    parent: CallFrame,
    target: &XlatorRef,
    req: FopRequest,
    on_reply: F,
) where
    F: FnOnce(CallFrame, Reply) + Send + 'static,
{
    let root = parent.root().clone();
    let child = CallFrame::new(root, req.kind(), move |reply| {
        on_reply(parent, reply)
    });
    dispatch(target, child, req);
}

/// A constructed translator stack plus its inode table.
///
/// The graph owns the translators; back references (frame -> this,
/// page -> inode) stay borrowed. Building the graph wires each
/// translator's forget callback into the table.
pub struct Graph {
    top: XlatorRef,
    all: Vec<XlatorRef>,
    itable: Arc<InodeTable>,
}

impl Graph {
    /// Assemble a validated graph. `all` lists every translator in the
    /// stack, top first.
    pub fn new(top: XlatorRef, all: Vec<XlatorRef>) -> Arc<Graph> {
        let itable = InodeTable::new();
        for xl in &all {
            let xl = xl.clone();
            itable.register_forget(Box::new(move |inode| xl.forget(inode)));
        }
        Arc::new(Graph { top, all, itable })
    }

    /// The entry translator.
    pub fn top(&self) -> &XlatorRef {
        &self.top
    }

    /// The graph's inode table.
    pub fn itable(&self) -> &Arc<InodeTable> {
        &self.itable
    }

    /// Run the release pass for a closed file handle.
    pub fn release(&self, fd: &Arc<Fd>) {
        for xl in &self.all {
            xl.release(fd);
        }
    }

    /// Run the release pass for a closed directory handle.
    pub fn releasedir(&self, fd: &Arc<Fd>) {
        for xl in &self.all {
            xl.releasedir(fd);
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("top", &self.top.name())
            .field("translators", &self.all.len())
            .finish()
    }
}

/// Issue `req` at `target` and block for the reply.
///
/// The calling thread must not be the one expected to deliver the
/// reply. Intended for tests and synchronous management paths.
pub fn sync_call(
    target: &XlatorRef,
    root: Arc<CallRoot>,
    req: FopRequest,
) -> Reply {
    let kind = req.kind();
    let (tx, rx) = mpsc::channel();
    let frame = CallFrame::new(root, kind, move |reply| {
        // The receiver may have timed out and gone away.
        let _ = tx.send(reply);
    });
    dispatch(target, frame, req);
    match rx.recv_timeout(Duration::from_secs(30)) {
        Ok(reply) => reply,
        Err(_) => {
            error!("sync {kind} timed out");
            Reply::error(kind, Errno::ETIMEDOUT)
        }
    }
}
