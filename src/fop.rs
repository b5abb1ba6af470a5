//! The closed set of filesystem operations.
//!
//! Every FOP has a kind, a fixed argument tuple and a fixed reply tuple.
//! [`FopRequest`] and [`FopReply`] carry those tuples as enum variants so
//! dispatch is an exhaustive `match`: adding a kind without handling it
//! everywhere is a compile error, not a runtime fall-through.

use std::sync::Arc;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

use crate::dict::Dict;
use crate::errno::Errno;
use crate::fd::Fd;
use crate::iatt::Iatt;
use crate::iatt::IattValid;
use crate::inode::Inode;
use crate::iobuf::Iobref;
use crate::iobuf::IoVecList;
use crate::loc::Loc;

/// Filesystem operation kinds.
#[derive(
    Clone, Copy, Debug, Eq, Hash, IntoPrimitive, PartialEq, TryFromPrimitive,
)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum FopKind {
    Lookup,
    Stat,
    Fstat,
    Statfs,
    Truncate,
    Ftruncate,
    Access,
    Readlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Symlink,
    Rename,
    Link,
    Create,
    Open,
    Readv,
    Writev,
    Flush,
    Fsync,
    Opendir,
    Fsyncdir,
    Setxattr,
    Getxattr,
    Fsetxattr,
    Fgetxattr,
    Removexattr,
    Fremovexattr,
    Lk,
    Inodelk,
    Finodelk,
    Entrylk,
    Fentrylk,
    Readdir,
    Readdirp,
    Rchecksum,
    Xattrop,
    Fxattrop,
    Setattr,
    Fsetattr,
    Fallocate,
    Discard,
    Zerofill,
    Ipc,
    Lease,
    Seek,
    Getactivelk,
    Setactivelk,
}

impl FopKind {
    /// Lowercase name for log lines.
    pub fn name(self) -> &'static str {
        match self {
            FopKind::Lookup => "lookup",
            FopKind::Stat => "stat",
            FopKind::Fstat => "fstat",
            FopKind::Statfs => "statfs",
            FopKind::Truncate => "truncate",
            FopKind::Ftruncate => "ftruncate",
            FopKind::Access => "access",
            FopKind::Readlink => "readlink",
            FopKind::Mknod => "mknod",
            FopKind::Mkdir => "mkdir",
            FopKind::Unlink => "unlink",
            FopKind::Rmdir => "rmdir",
            FopKind::Symlink => "symlink",
            FopKind::Rename => "rename",
            FopKind::Link => "link",
            FopKind::Create => "create",
            FopKind::Open => "open",
            FopKind::Readv => "readv",
            FopKind::Writev => "writev",
            FopKind::Flush => "flush",
            FopKind::Fsync => "fsync",
            FopKind::Opendir => "opendir",
            FopKind::Fsyncdir => "fsyncdir",
            FopKind::Setxattr => "setxattr",
            FopKind::Getxattr => "getxattr",
            FopKind::Fsetxattr => "fsetxattr",
            FopKind::Fgetxattr => "fgetxattr",
            FopKind::Removexattr => "removexattr",
            FopKind::Fremovexattr => "fremovexattr",
            FopKind::Lk => "lk",
            FopKind::Inodelk => "inodelk",
            FopKind::Finodelk => "finodelk",
            FopKind::Entrylk => "entrylk",
            FopKind::Fentrylk => "fentrylk",
            FopKind::Readdir => "readdir",
            FopKind::Readdirp => "readdirp",
            FopKind::Rchecksum => "rchecksum",
            FopKind::Xattrop => "xattrop",
            FopKind::Fxattrop => "fxattrop",
            FopKind::Setattr => "setattr",
            FopKind::Fsetattr => "fsetattr",
            FopKind::Fallocate => "fallocate",
            FopKind::Discard => "discard",
            FopKind::Zerofill => "zerofill",
            FopKind::Ipc => "ipc",
            FopKind::Lease => "lease",
            FopKind::Seek => "seek",
            FopKind::Getactivelk => "getactivelk",
            FopKind::Setactivelk => "setactivelk",
        }
    }
}

impl std::fmt::Display for FopKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A POSIX record lock as it travels through lk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Flock {
    /// `F_RDLCK` / `F_WRLCK` / `F_UNLCK`.
    pub l_type: i32,
    /// Interpretation base of `l_start`.
    pub l_whence: i32,
    /// Range start.
    pub l_start: i64,
    /// Range length; zero means to EOF.
    pub l_len: i64,
    /// Owner pid, when known.
    pub l_pid: i32,
}

/// One granted lock reported by getactivelk.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LockInfo {
    /// The lock range and type.
    pub flock: Flock,
    /// Client identity that holds it.
    pub client_uid: Option<String>,
}

/// Entry-lock operation, as in entrylk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum EntrylkCmd {
    Lock,
    LockNb,
    Unlock,
}

/// Entry-lock type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum EntrylkType {
    Rdlck,
    Wrlck,
}

/// Seek target, as in lseek(2) SEEK_DATA / SEEK_HOLE.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum SeekWhat {
    Data,
    Hole,
}

/// Lease request record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GfLease {
    /// Command: grant / release / unlock.
    pub cmd: i32,
    /// Lease type bits.
    pub lease_type: u32,
    /// Client-chosen lease id.
    pub lease_id: [u8; 16],
}

/// One directory entry in a readdir/readdirp reply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Offset cookie for resuming the listing after this entry.
    pub off: u64,
    /// Attributes; only meaningful for readdirp.
    pub stat: Iatt,
}

/// Filesystem statistics, as in statvfs(2).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Statvfs {
    /// Filesystem block size.
    pub bsize: u64,
    /// Fragment size.
    pub frsize: u64,
    /// Total blocks in `frsize` units.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Free blocks available to unprivileged users.
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Maximum filename length.
    pub namemax: u64,
}

/// A captured downward call: one variant per FOP kind, carrying that
/// kind's exact argument tuple. Cloning deep-copies path state and
/// refcount-bumps shared containers, which is what stub capture needs.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
pub enum FopRequest {
    Lookup { loc: Loc, xdata: Option<Dict> },
    Stat { loc: Loc, xdata: Option<Dict> },
    Fstat { fd: Arc<Fd>, xdata: Option<Dict> },
    Statfs { loc: Loc, xdata: Option<Dict> },
    Truncate { loc: Loc, offset: u64, xdata: Option<Dict> },
    Ftruncate { fd: Arc<Fd>, offset: u64, xdata: Option<Dict> },
    Access { loc: Loc, mask: i32, xdata: Option<Dict> },
    Readlink { loc: Loc, size: u64, xdata: Option<Dict> },
    Mknod { loc: Loc, mode: u32, rdev: u64, umask: u32, xdata: Option<Dict> },
    Mkdir { loc: Loc, mode: u32, umask: u32, xdata: Option<Dict> },
    Unlink { loc: Loc, flags: i32, xdata: Option<Dict> },
    Rmdir { loc: Loc, flags: i32, xdata: Option<Dict> },
    Symlink { linkpath: String, loc: Loc, umask: u32, xdata: Option<Dict> },
    Rename { oldloc: Loc, newloc: Loc, xdata: Option<Dict> },
    Link { oldloc: Loc, newloc: Loc, xdata: Option<Dict> },
    Create {
        loc: Loc,
        flags: i32,
        mode: u32,
        umask: u32,
        fd: Arc<Fd>,
        xdata: Option<Dict>,
    },
    Open { loc: Loc, flags: i32, fd: Arc<Fd>, xdata: Option<Dict> },
    Readv {
        fd: Arc<Fd>,
        size: u64,
        offset: u64,
        flags: u32,
        xdata: Option<Dict>,
    },
    Writev {
        fd: Arc<Fd>,
        vector: IoVecList,
        offset: u64,
        flags: u32,
        iobref: Iobref,
        xdata: Option<Dict>,
    },
    Flush { fd: Arc<Fd>, xdata: Option<Dict> },
    Fsync { fd: Arc<Fd>, datasync: bool, xdata: Option<Dict> },
    Opendir { loc: Loc, fd: Arc<Fd>, xdata: Option<Dict> },
    Fsyncdir { fd: Arc<Fd>, datasync: bool, xdata: Option<Dict> },
    Setxattr { loc: Loc, dict: Dict, flags: i32, xdata: Option<Dict> },
    Getxattr { loc: Loc, name: Option<String>, xdata: Option<Dict> },
    Fsetxattr { fd: Arc<Fd>, dict: Dict, flags: i32, xdata: Option<Dict> },
    Fgetxattr { fd: Arc<Fd>, name: Option<String>, xdata: Option<Dict> },
    Removexattr { loc: Loc, name: String, xdata: Option<Dict> },
    Fremovexattr { fd: Arc<Fd>, name: String, xdata: Option<Dict> },
    Lk { fd: Arc<Fd>, cmd: i32, flock: Flock, xdata: Option<Dict> },
    Inodelk {
        volume: String,
        loc: Loc,
        cmd: i32,
        flock: Flock,
        xdata: Option<Dict>,
    },
    Finodelk {
        volume: String,
        fd: Arc<Fd>,
        cmd: i32,
        flock: Flock,
        xdata: Option<Dict>,
    },
    Entrylk {
        volume: String,
        loc: Loc,
        basename: Option<String>,
        cmd: EntrylkCmd,
        lk_type: EntrylkType,
        xdata: Option<Dict>,
    },
    Fentrylk {
        volume: String,
        fd: Arc<Fd>,
        basename: Option<String>,
        cmd: EntrylkCmd,
        lk_type: EntrylkType,
        xdata: Option<Dict>,
    },
    Readdir { fd: Arc<Fd>, size: u64, offset: u64, xdata: Option<Dict> },
    Readdirp { fd: Arc<Fd>, size: u64, offset: u64, xdata: Option<Dict> },
    Rchecksum { fd: Arc<Fd>, offset: u64, len: u32, xdata: Option<Dict> },
    Xattrop { loc: Loc, optype: i32, dict: Dict, xdata: Option<Dict> },
    Fxattrop { fd: Arc<Fd>, optype: i32, dict: Dict, xdata: Option<Dict> },
    Setattr { loc: Loc, stbuf: Iatt, valid: IattValid, xdata: Option<Dict> },
    Fsetattr {
        fd: Arc<Fd>,
        stbuf: Iatt,
        valid: IattValid,
        xdata: Option<Dict>,
    },
    Fallocate {
        fd: Arc<Fd>,
        keep_size: bool,
        offset: u64,
        len: u64,
        xdata: Option<Dict>,
    },
    Discard { fd: Arc<Fd>, offset: u64, len: u64, xdata: Option<Dict> },
    Zerofill { fd: Arc<Fd>, offset: u64, len: u64, xdata: Option<Dict> },
    Ipc { op: i32, xdata: Option<Dict> },
    Lease { loc: Loc, lease: GfLease, xdata: Option<Dict> },
    Seek { fd: Arc<Fd>, offset: u64, what: SeekWhat, xdata: Option<Dict> },
    Getactivelk { loc: Loc, xdata: Option<Dict> },
    Setactivelk { loc: Loc, locks: Vec<LockInfo>, xdata: Option<Dict> },
}

impl FopRequest {
    /// The request's kind.
    pub fn kind(&self) -> FopKind {
        match self {
            FopRequest::Lookup { .. } => FopKind::Lookup,
            FopRequest::Stat { .. } => FopKind::Stat,
            FopRequest::Fstat { .. } => FopKind::Fstat,
            FopRequest::Statfs { .. } => FopKind::Statfs,
            FopRequest::Truncate { .. } => FopKind::Truncate,
            FopRequest::Ftruncate { .. } => FopKind::Ftruncate,
            FopRequest::Access { .. } => FopKind::Access,
            FopRequest::Readlink { .. } => FopKind::Readlink,
            FopRequest::Mknod { .. } => FopKind::Mknod,
            FopRequest::Mkdir { .. } => FopKind::Mkdir,
            FopRequest::Unlink { .. } => FopKind::Unlink,
            FopRequest::Rmdir { .. } => FopKind::Rmdir,
            FopRequest::Symlink { .. } => FopKind::Symlink,
            FopRequest::Rename { .. } => FopKind::Rename,
            FopRequest::Link { .. } => FopKind::Link,
            FopRequest::Create { .. } => FopKind::Create,
            FopRequest::Open { .. } => FopKind::Open,
            FopRequest::Readv { .. } => FopKind::Readv,
            FopRequest::Writev { .. } => FopKind::Writev,
            FopRequest::Flush { .. } => FopKind::Flush,
            FopRequest::Fsync { .. } => FopKind::Fsync,
            FopRequest::Opendir { .. } => FopKind::Opendir,
            FopRequest::Fsyncdir { .. } => FopKind::Fsyncdir,
            FopRequest::Setxattr { .. } => FopKind::Setxattr,
            FopRequest::Getxattr { .. } => FopKind::Getxattr,
            FopRequest::Fsetxattr { .. } => FopKind::Fsetxattr,
            FopRequest::Fgetxattr { .. } => FopKind::Fgetxattr,
            FopRequest::Removexattr { .. } => FopKind::Removexattr,
            FopRequest::Fremovexattr { .. } => FopKind::Fremovexattr,
            FopRequest::Lk { .. } => FopKind::Lk,
            FopRequest::Inodelk { .. } => FopKind::Inodelk,
            FopRequest::Finodelk { .. } => FopKind::Finodelk,
            FopRequest::Entrylk { .. } => FopKind::Entrylk,
            FopRequest::Fentrylk { .. } => FopKind::Fentrylk,
            FopRequest::Readdir { .. } => FopKind::Readdir,
            FopRequest::Readdirp { .. } => FopKind::Readdirp,
            FopRequest::Rchecksum { .. } => FopKind::Rchecksum,
            FopRequest::Xattrop { .. } => FopKind::Xattrop,
            FopRequest::Fxattrop { .. } => FopKind::Fxattrop,
            FopRequest::Setattr { .. } => FopKind::Setattr,
            FopRequest::Fsetattr { .. } => FopKind::Fsetattr,
            FopRequest::Fallocate { .. } => FopKind::Fallocate,
            FopRequest::Discard { .. } => FopKind::Discard,
            FopRequest::Zerofill { .. } => FopKind::Zerofill,
            FopRequest::Ipc { .. } => FopKind::Ipc,
            FopRequest::Lease { .. } => FopKind::Lease,
            FopRequest::Seek { .. } => FopKind::Seek,
            FopRequest::Getactivelk { .. } => FopKind::Getactivelk,
            FopRequest::Setactivelk { .. } => FopKind::Setactivelk,
        }
    }
}

/// A captured upward reply tuple: one variant per FOP kind.
#[derive(Clone, Debug, Default)]
#[allow(missing_docs)]
pub enum FopReply {
    /// Placeholder for kinds whose reply carries nothing but status.
    #[default]
    None,
    Lookup {
        inode: Option<Arc<Inode>>,
        buf: Iatt,
        xdata: Option<Dict>,
        postparent: Iatt,
    },
    Stat { buf: Iatt, xdata: Option<Dict> },
    Fstat { buf: Iatt, xdata: Option<Dict> },
    Statfs { buf: Statvfs, xdata: Option<Dict> },
    Truncate { prebuf: Iatt, postbuf: Iatt, xdata: Option<Dict> },
    Ftruncate { prebuf: Iatt, postbuf: Iatt, xdata: Option<Dict> },
    Access { xdata: Option<Dict> },
    Readlink { path: String, buf: Iatt, xdata: Option<Dict> },
    Mknod {
        inode: Option<Arc<Inode>>,
        buf: Iatt,
        preparent: Iatt,
        postparent: Iatt,
        xdata: Option<Dict>,
    },
    Mkdir {
        inode: Option<Arc<Inode>>,
        buf: Iatt,
        preparent: Iatt,
        postparent: Iatt,
        xdata: Option<Dict>,
    },
    Unlink { preparent: Iatt, postparent: Iatt, xdata: Option<Dict> },
    Rmdir { preparent: Iatt, postparent: Iatt, xdata: Option<Dict> },
    Symlink {
        inode: Option<Arc<Inode>>,
        buf: Iatt,
        preparent: Iatt,
        postparent: Iatt,
        xdata: Option<Dict>,
    },
    Rename {
        buf: Iatt,
        preoldparent: Iatt,
        postoldparent: Iatt,
        prenewparent: Iatt,
        postnewparent: Iatt,
        xdata: Option<Dict>,
    },
    Link {
        inode: Option<Arc<Inode>>,
        buf: Iatt,
        preparent: Iatt,
        postparent: Iatt,
        xdata: Option<Dict>,
    },
    Create {
        fd: Option<Arc<Fd>>,
        inode: Option<Arc<Inode>>,
        buf: Iatt,
        preparent: Iatt,
        postparent: Iatt,
        xdata: Option<Dict>,
    },
    Open { fd: Option<Arc<Fd>>, xdata: Option<Dict> },
    Readv {
        vector: IoVecList,
        stbuf: Iatt,
        iobref: Iobref,
        xdata: Option<Dict>,
    },
    Writev { prebuf: Iatt, postbuf: Iatt, xdata: Option<Dict> },
    Flush { xdata: Option<Dict> },
    Fsync { prebuf: Iatt, postbuf: Iatt, xdata: Option<Dict> },
    Opendir { fd: Option<Arc<Fd>>, xdata: Option<Dict> },
    Fsyncdir { xdata: Option<Dict> },
    Setxattr { xdata: Option<Dict> },
    Getxattr { dict: Option<Dict>, xdata: Option<Dict> },
    Fsetxattr { xdata: Option<Dict> },
    Fgetxattr { dict: Option<Dict>, xdata: Option<Dict> },
    Removexattr { xdata: Option<Dict> },
    Fremovexattr { xdata: Option<Dict> },
    Lk { flock: Flock, xdata: Option<Dict> },
    Inodelk { xdata: Option<Dict> },
    Finodelk { xdata: Option<Dict> },
    Entrylk { xdata: Option<Dict> },
    Fentrylk { xdata: Option<Dict> },
    Readdir { entries: Vec<DirEntry>, xdata: Option<Dict> },
    Readdirp { entries: Vec<DirEntry>, xdata: Option<Dict> },
    Rchecksum { weak: u32, strong: [u8; 16], xdata: Option<Dict> },
    Xattrop { dict: Option<Dict>, xdata: Option<Dict> },
    Fxattrop { dict: Option<Dict>, xdata: Option<Dict> },
    Setattr { statpre: Iatt, statpost: Iatt, xdata: Option<Dict> },
    Fsetattr { statpre: Iatt, statpost: Iatt, xdata: Option<Dict> },
    Fallocate { pre: Iatt, post: Iatt, xdata: Option<Dict> },
    Discard { pre: Iatt, post: Iatt, xdata: Option<Dict> },
    Zerofill { pre: Iatt, post: Iatt, xdata: Option<Dict> },
    Ipc { xdata: Option<Dict> },
    Lease { lease: GfLease, xdata: Option<Dict> },
    Seek { offset: u64, xdata: Option<Dict> },
    Getactivelk { locks: Vec<LockInfo>, xdata: Option<Dict> },
    Setactivelk { xdata: Option<Dict> },
}

impl FopReply {
    /// An empty reply tuple for `kind`, used when synthesizing errors.
    pub fn empty(kind: FopKind) -> FopReply {
        match kind {
            FopKind::Lookup => FopReply::Lookup {
                inode: None,
                buf: Iatt::default(),
                xdata: None,
                postparent: Iatt::default(),
            },
            FopKind::Stat => FopReply::Stat {
                buf: Iatt::default(),
                xdata: None,
            },
            FopKind::Fstat => FopReply::Fstat {
                buf: Iatt::default(),
                xdata: None,
            },
            FopKind::Statfs => FopReply::Statfs {
                buf: Statvfs::default(),
                xdata: None,
            },
            FopKind::Truncate => FopReply::Truncate {
                prebuf: Iatt::default(),
                postbuf: Iatt::default(),
                xdata: None,
            },
            FopKind::Ftruncate => FopReply::Ftruncate {
                prebuf: Iatt::default(),
                postbuf: Iatt::default(),
                xdata: None,
            },
            FopKind::Access => FopReply::Access { xdata: None },
            FopKind::Readlink => FopReply::Readlink {
                path: String::new(),
                buf: Iatt::default(),
                xdata: None,
            },
            FopKind::Mknod => FopReply::Mknod {
                inode: None,
                buf: Iatt::default(),
                preparent: Iatt::default(),
                postparent: Iatt::default(),
                xdata: None,
            },
            FopKind::Mkdir => FopReply::Mkdir {
                inode: None,
                buf: Iatt::default(),
                preparent: Iatt::default(),
                postparent: Iatt::default(),
                xdata: None,
            },
            FopKind::Unlink => FopReply::Unlink {
                preparent: Iatt::default(),
                postparent: Iatt::default(),
                xdata: None,
            },
            FopKind::Rmdir => FopReply::Rmdir {
                preparent: Iatt::default(),
                postparent: Iatt::default(),
                xdata: None,
            },
            FopKind::Symlink => FopReply::Symlink {
                inode: None,
                buf: Iatt::default(),
                preparent: Iatt::default(),
                postparent: Iatt::default(),
                xdata: None,
            },
            FopKind::Rename => FopReply::Rename {
                buf: Iatt::default(),
                preoldparent: Iatt::default(),
                postoldparent: Iatt::default(),
                prenewparent: Iatt::default(),
                postnewparent: Iatt::default(),
                xdata: None,
            },
            FopKind::Link => FopReply::Link {
                inode: None,
                buf: Iatt::default(),
                preparent: Iatt::default(),
                postparent: Iatt::default(),
                xdata: None,
            },
            FopKind::Create => FopReply::Create {
                fd: None,
                inode: None,
                buf: Iatt::default(),
                preparent: Iatt::default(),
                postparent: Iatt::default(),
                xdata: None,
            },
            FopKind::Open => FopReply::Open {
                fd: None,
                xdata: None,
            },
            FopKind::Readv => FopReply::Readv {
                vector: IoVecList::new(),
                stbuf: Iatt::default(),
                iobref: Iobref::new(),
                xdata: None,
            },
            FopKind::Writev => FopReply::Writev {
                prebuf: Iatt::default(),
                postbuf: Iatt::default(),
                xdata: None,
            },
            FopKind::Flush => FopReply::Flush { xdata: None },
            FopKind::Fsync => FopReply::Fsync {
                prebuf: Iatt::default(),
                postbuf: Iatt::default(),
                xdata: None,
            },
            FopKind::Opendir => FopReply::Opendir {
                fd: None,
                xdata: None,
            },
            FopKind::Fsyncdir => FopReply::Fsyncdir { xdata: None },
            FopKind::Setxattr => FopReply::Setxattr { xdata: None },
            FopKind::Getxattr => FopReply::Getxattr {
                dict: None,
                xdata: None,
            },
            FopKind::Fsetxattr => FopReply::Fsetxattr { xdata: None },
            FopKind::Fgetxattr => FopReply::Fgetxattr {
                dict: None,
                xdata: None,
            },
            FopKind::Removexattr => FopReply::Removexattr { xdata: None },
            FopKind::Fremovexattr => FopReply::Fremovexattr { xdata: None },
            FopKind::Lk => FopReply::Lk {
                flock: Flock::default(),
                xdata: None,
            },
            FopKind::Inodelk => FopReply::Inodelk { xdata: None },
            FopKind::Finodelk => FopReply::Finodelk { xdata: None },
            FopKind::Entrylk => FopReply::Entrylk { xdata: None },
            FopKind::Fentrylk => FopReply::Fentrylk { xdata: None },
            FopKind::Readdir => FopReply::Readdir {
                entries: Vec::new(),
                xdata: None,
            },
            FopKind::Readdirp => FopReply::Readdirp {
                entries: Vec::new(),
                xdata: None,
            },
            FopKind::Rchecksum => FopReply::Rchecksum {
                weak: 0,
                strong: [0; 16],
                xdata: None,
            },
            FopKind::Xattrop => FopReply::Xattrop {
                dict: None,
                xdata: None,
            },
            FopKind::Fxattrop => FopReply::Fxattrop {
                dict: None,
                xdata: None,
            },
            FopKind::Setattr => FopReply::Setattr {
                statpre: Iatt::default(),
                statpost: Iatt::default(),
                xdata: None,
            },
            FopKind::Fsetattr => FopReply::Fsetattr {
                statpre: Iatt::default(),
                statpost: Iatt::default(),
                xdata: None,
            },
            FopKind::Fallocate => FopReply::Fallocate {
                pre: Iatt::default(),
                post: Iatt::default(),
                xdata: None,
            },
            FopKind::Discard => FopReply::Discard {
                pre: Iatt::default(),
                post: Iatt::default(),
                xdata: None,
            },
            FopKind::Zerofill => FopReply::Zerofill {
                pre: Iatt::default(),
                post: Iatt::default(),
                xdata: None,
            },
            FopKind::Ipc => FopReply::Ipc { xdata: None },
            FopKind::Lease => FopReply::Lease {
                lease: GfLease::default(),
                xdata: None,
            },
            FopKind::Seek => FopReply::Seek {
                offset: 0,
                xdata: None,
            },
            FopKind::Getactivelk => FopReply::Getactivelk {
                locks: Vec::new(),
                xdata: None,
            },
            FopKind::Setactivelk => FopReply::Setactivelk { xdata: None },
        }
    }

    /// The reply's kind, when it has one.
    pub fn kind(&self) -> Option<FopKind> {
        match self {
            FopReply::None => None,
            FopReply::Lookup { .. } => Some(FopKind::Lookup),
            FopReply::Stat { .. } => Some(FopKind::Stat),
            FopReply::Fstat { .. } => Some(FopKind::Fstat),
            FopReply::Statfs { .. } => Some(FopKind::Statfs),
            FopReply::Truncate { .. } => Some(FopKind::Truncate),
            FopReply::Ftruncate { .. } => Some(FopKind::Ftruncate),
            FopReply::Access { .. } => Some(FopKind::Access),
            FopReply::Readlink { .. } => Some(FopKind::Readlink),
            FopReply::Mknod { .. } => Some(FopKind::Mknod),
            FopReply::Mkdir { .. } => Some(FopKind::Mkdir),
            FopReply::Unlink { .. } => Some(FopKind::Unlink),
            FopReply::Rmdir { .. } => Some(FopKind::Rmdir),
            FopReply::Symlink { .. } => Some(FopKind::Symlink),
            FopReply::Rename { .. } => Some(FopKind::Rename),
            FopReply::Link { .. } => Some(FopKind::Link),
            FopReply::Create { .. } => Some(FopKind::Create),
            FopReply::Open { .. } => Some(FopKind::Open),
            FopReply::Readv { .. } => Some(FopKind::Readv),
            FopReply::Writev { .. } => Some(FopKind::Writev),
            FopReply::Flush { .. } => Some(FopKind::Flush),
            FopReply::Fsync { .. } => Some(FopKind::Fsync),
            FopReply::Opendir { .. } => Some(FopKind::Opendir),
            FopReply::Fsyncdir { .. } => Some(FopKind::Fsyncdir),
            FopReply::Setxattr { .. } => Some(FopKind::Setxattr),
            FopReply::Getxattr { .. } => Some(FopKind::Getxattr),
            FopReply::Fsetxattr { .. } => Some(FopKind::Fsetxattr),
            FopReply::Fgetxattr { .. } => Some(FopKind::Fgetxattr),
            FopReply::Removexattr { .. } => Some(FopKind::Removexattr),
            FopReply::Fremovexattr { .. } => Some(FopKind::Fremovexattr),
            FopReply::Lk { .. } => Some(FopKind::Lk),
            FopReply::Inodelk { .. } => Some(FopKind::Inodelk),
            FopReply::Finodelk { .. } => Some(FopKind::Finodelk),
            FopReply::Entrylk { .. } => Some(FopKind::Entrylk),
            FopReply::Fentrylk { .. } => Some(FopKind::Fentrylk),
            FopReply::Readdir { .. } => Some(FopKind::Readdir),
            FopReply::Readdirp { .. } => Some(FopKind::Readdirp),
            FopReply::Rchecksum { .. } => Some(FopKind::Rchecksum),
            FopReply::Xattrop { .. } => Some(FopKind::Xattrop),
            FopReply::Fxattrop { .. } => Some(FopKind::Fxattrop),
            FopReply::Setattr { .. } => Some(FopKind::Setattr),
            FopReply::Fsetattr { .. } => Some(FopKind::Fsetattr),
            FopReply::Fallocate { .. } => Some(FopKind::Fallocate),
            FopReply::Discard { .. } => Some(FopKind::Discard),
            FopReply::Zerofill { .. } => Some(FopKind::Zerofill),
            FopReply::Ipc { .. } => Some(FopKind::Ipc),
            FopReply::Lease { .. } => Some(FopKind::Lease),
            FopReply::Seek { .. } => Some(FopKind::Seek),
            FopReply::Getactivelk { .. } => Some(FopKind::Getactivelk),
            FopReply::Setactivelk { .. } => Some(FopKind::Setactivelk),
        }
    }
}

/// A complete FOP status + reply tuple.
///
/// `op_ret` and `op_errno` follow the original convention: a negative
/// `op_ret` means failure with `op_errno` set, a non-negative `op_ret`
/// is kind-specific (byte count for readv/writev, entry count for
/// readdir). `op_errno` may be meaningful on success too: readv uses
/// `ENOENT` beside a positive count to flag EOF.
#[derive(Clone, Debug)]
pub struct Reply {
    /// Status: negative on failure.
    pub op_ret: i64,
    /// Raw OS error code (or the EOF hint).
    pub op_errno: Errno,
    /// The kind-specific payload.
    pub data: FopReply,
}

impl Reply {
    /// A success reply with `op_ret == 0`.
    pub fn ok(data: FopReply) -> Reply {
        Reply {
            op_ret: 0,
            op_errno: Errno::OK,
            data,
        }
    }

    /// A success reply with an explicit `op_ret` (byte/entry counts).
    pub fn ok_ret(op_ret: i64, data: FopReply) -> Reply {
        Reply {
            op_ret,
            op_errno: Errno::OK,
            data,
        }
    }

    /// An error reply for `kind` with an empty payload.
    pub fn error(kind: FopKind, op_errno: Errno) -> Reply {
        Reply {
            op_ret: -1,
            op_errno,
            data: FopReply::empty(kind),
        }
    }

    /// True on success.
    pub fn is_ok(&self) -> bool {
        self.op_ret >= 0
    }
}
