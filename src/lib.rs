//! Stacked filesystem translator core.
//!
//! A process hosts a graph of translators, each exposing the same
//! filesystem-operation surface and forwarding, transforming or
//! terminating calls toward a backend. This crate carries the parts
//! where the engineering lives: the typed call/reply capture engine
//! that lets any translator suspend and replay any operation, a storage
//! backend that maps regular files onto LVM logical volumes, and a
//! range-indexed page cache with server-push invalidation.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::cache::CacheOptions;
pub use crate::cache::IOC_CTX;
pub use crate::cache::IoCache;
pub use crate::dict::Dict;
pub use crate::dict::DictValue;
pub use crate::errno::Errno;
pub use crate::fd::Fd;
pub use crate::fop::DirEntry;
pub use crate::fop::EntrylkCmd;
pub use crate::fop::EntrylkType;
pub use crate::fop::Flock;
pub use crate::fop::FopKind;
pub use crate::fop::FopReply;
pub use crate::fop::FopRequest;
pub use crate::fop::GfLease;
pub use crate::fop::LockInfo;
pub use crate::fop::Reply;
pub use crate::fop::SeekWhat;
pub use crate::fop::Statvfs;
pub use crate::frame::CallFrame;
pub use crate::frame::CallRoot;
pub use crate::gfid::Gfid;
pub use crate::gfid::InvalidGfid;
pub use crate::iatt::IaType;
pub use crate::iatt::Iatt;
pub use crate::iatt::IattTime;
pub use crate::iatt::IattValid;
pub use crate::inode::Inode;
pub use crate::inode::InodeTable;
pub use crate::iobuf::IoBuf;
pub use crate::iobuf::IoVec;
pub use crate::iobuf::IoVecList;
pub use crate::iobuf::Iobref;
pub use crate::iobuf::iov_concat;
pub use crate::iobuf::iov_length;
pub use crate::loc::Loc;
pub use crate::quota::QuotaConfReader;
pub use crate::quota::QuotaMeta;
pub use crate::quota::QuotaMetaRead;
pub use crate::rotbuf::ClaimedSlot;
pub use crate::rotbuf::Pull;
pub use crate::rotbuf::RotBuf;
pub use crate::rotbuf::WriteArea;
pub use crate::storage::bd::BD_CTX;
pub use crate::storage::bd::BD_XATTR;
pub use crate::storage::bd::BD_XATTR_CLONE;
pub use crate::storage::bd::BD_XATTR_MERGE;
pub use crate::storage::bd::BD_XATTR_ORIGIN;
pub use crate::storage::bd::BD_XATTR_SNAPSHOT;
pub use crate::storage::bd::Bd;
pub use crate::storage::bd::BdCaps;
pub use crate::storage::bd::BdOptions;
pub use crate::storage::bd::BdType;
pub use crate::storage::bd::LINKTO_XATTR;
pub use crate::storage::bd::VOL_CAPS;
pub use crate::storage::bd::VOL_TYPE;
pub use crate::storage::bd::VOLUME_ID_TAG;
pub use crate::storage::bd::lvm::Lvm;
pub use crate::storage::bd::lvm::LvmCli;
pub use crate::storage::bd::lvm::LvmError;
pub use crate::storage::bd::lvm::VgSpace;
pub use crate::storage::bd::lvm::round_to_extent;
pub use crate::storage::posix::POSIX_CTX;
pub use crate::storage::posix::Posix;
pub use crate::strfd::StrFd;
pub use crate::stub::CallStub;
pub use crate::stub::StubQueue;
pub use crate::stub::WindJump;
pub use crate::upcall::UPCALL_CTX;
pub use crate::upcall::Upcall;
pub use crate::upcall::UpcallEvent;
pub use crate::upcall::UpcallEventKind;
pub use crate::upcall::UpcallFlags;
pub use crate::upcall::UpcallOptions;
pub use crate::upcall::UpcallSink;
pub use crate::xlator::Graph;
pub use crate::xlator::Xlator;
pub use crate::xlator::XlatorRef;
pub use crate::xlator::dispatch;
pub use crate::xlator::forward;
pub use crate::xlator::sync_call;
pub use crate::xlator::wind;

mod cache;
mod checksum;
mod dict;
mod errno;
mod fd;
mod fop;
mod frame;
mod gfid;
mod iatt;
mod inode;
mod iobuf;
mod loc;
mod quota;
mod rotbuf;
mod storage;
mod strfd;
mod stub;
mod upcall;
mod xlator;
