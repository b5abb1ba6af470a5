//! Server-push cache invalidation.
//!
//! Tracks which clients touched each inode and, when a FOP changes
//! content, size, ownership, names or xattrs, pushes an invalidation
//! record to every other client that looked recently. A background
//! reaper drops clients gone idle and frees contexts of forgotten
//! inodes.

mod internal;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use bitflags::bitflags;
use log::debug;
use log::warn;
use parking_lot::Mutex;

use crate::dict::Dict;
use crate::dict::DictValue;
use crate::fd::Fd;
use crate::fop::FopReply;
use crate::fop::FopRequest;
use crate::frame::CallFrame;
use crate::gfid::Gfid;
use crate::iatt::Iatt;
use crate::iatt::IattValid;
use crate::inode::Inode;
use crate::iobuf::IoVecList;
use crate::iobuf::Iobref;
use crate::loc::Loc;
use crate::xlator::Xlator;
use crate::xlator::XlatorRef;
use crate::xlator::wind;

use self::internal::UpcallRegistry;
use self::internal::reaper_loop;

/// Context-slot key for upcall state on inodes.
pub const UPCALL_CTX: &str = "upcall";

bitflags! {
    /// What an invalidation event says changed.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct UpcallFlags: u32 {
        /// File content written.
        const WRITE = 1 << 0;
        /// Attributes (mode/owner/size) changed.
        const ATTR = 1 << 1;
        /// An xattr was set or changed.
        const XATTR = 1 << 2;
        /// An xattr was removed.
        const XATTR_RM = 1 << 3;
        /// Link count changed.
        const NLINK = 1 << 4;
        /// A dentry under the parent changed.
        const PARENT_DENTRY = 1 << 5;
        /// Timestamps moved.
        const TIMES = 1 << 6;
        /// The inode is gone.
        const FORGET = 1 << 7;
        /// No invalidation; refresh the caller's own registration.
        const UPDATE_CLIENT = 1 << 8;
    }
}

/// Kind of push notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpcallEventKind {
    /// Cached state for the inode is no longer valid.
    CacheInvalidation,
    /// The server dropped the inode.
    Forget,
    /// A conflicting open wants the client's lease back.
    LeaseRecall,
}

/// The record pushed to a client.
#[derive(Clone, Debug)]
pub struct UpcallEvent {
    /// Recipient.
    pub client_uid: String,
    /// Affected inode.
    pub gfid: Gfid,
    /// What kind of notification this is.
    pub event: UpcallEventKind,
    /// What changed.
    pub flags: UpcallFlags,
    /// Post-operation attributes, when known.
    pub stat: Option<Iatt>,
    /// Post-operation parent attributes, when known.
    pub p_stat: Option<Iatt>,
    /// Old-parent attributes for rename.
    pub oldp_stat: Option<Iatt>,
    /// Affected xattrs, filtered to registered keys.
    pub dict: Option<Dict>,
    /// Seconds the recipient may cache before re-checking.
    pub expire_time_attr: u32,
}

/// Where events leave the process; the RPC edge in a full deployment.
pub trait UpcallSink: Send + Sync {
    /// Deliver one event to one client.
    fn notify(&self, event: UpcallEvent);
}

/// Configuration for one upcall instance.
#[derive(Clone, Debug)]
pub struct UpcallOptions {
    /// Push invalidations at all (`upcall.cache-invalidation`).
    pub cache_invalidation: bool,
    /// Window within which clients are notified; clients idle for
    /// twice this are dropped (`upcall.cache-invalidation-timeout`).
    pub cache_invalidation_timeout: u32,
}

impl Default for UpcallOptions {
    fn default() -> UpcallOptions {
        UpcallOptions {
            cache_invalidation: false,
            cache_invalidation_timeout: 60,
        }
    }
}

impl UpcallOptions {
    /// Parse from a string option map.
    pub fn from_map(
        map: &HashMap<String, String>,
    ) -> std::io::Result<UpcallOptions> {
        let mut opts = UpcallOptions::default();
        if let Some(raw) = map.get("upcall.cache-invalidation") {
            opts.cache_invalidation =
                matches!(raw.as_str(), "on" | "true" | "yes" | "1");
        }
        if let Some(raw) = map.get("upcall.cache-invalidation-timeout") {
            opts.cache_invalidation_timeout = raw.parse().map_err(|_| {
                std::io::Error::other("bad cache-invalidation-timeout")
            })?;
        }
        Ok(opts)
    }
}

/// The upcall translator.
pub struct Upcall {
    weak: Weak<Upcall>,
    name: String,
    child: XlatorRef,
    options: UpcallOptions,
    sink: Arc<dyn UpcallSink>,
    registry: Arc<UpcallRegistry>,
    /// Xattr keys clients registered interest in.
    xattrs: Mutex<Dict>,
}

impl Upcall {
    /// Build an upcall instance over `child`, delivering through
    /// `sink`. Starts the reaper when invalidation is on.
    pub fn new(
        name: &str,
        child: XlatorRef,
        options: UpcallOptions,
        sink: Arc<dyn UpcallSink>,
    ) -> Arc<Upcall> {
        let registry = UpcallRegistry::new();
        if options.cache_invalidation {
            let reaper = registry.clone();
            let timeout = options.cache_invalidation_timeout;
            let thread_name = format!("{name}-reaper");
            let spawned = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || reaper_loop(reaper, timeout));
            if let Err(e) = spawned {
                warn!("{name}: reaper thread failed to start: {e}");
            }
        }
        Arc::new_cyclic(|weak| Upcall {
            weak: weak.clone(),
            name: name.to_string(),
            child,
            options,
            sink,
            registry,
            xattrs: Mutex::new(Dict::new()),
        })
    }

    /// Register xattr keys worth pushing to clients.
    pub fn register_xattrs(&self, keys: &[&str]) {
        let dict = self.xattrs.lock();
        for key in keys {
            dict.set(*key, DictValue::StaticStr(""));
        }
    }

    /// Stop the reaper.
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }

    fn me(&self) -> Arc<Upcall> {
        self.weak.upgrade().expect("upcall still referenced")
    }

    fn enabled(&self) -> bool {
        self.options.cache_invalidation
    }

    /// The heart of the layer: refresh the caller's registration and
    /// push `flags` to every other recent client of the inode.
    fn cache_invalidate(
        &self,
        frame: &CallFrame,
        gfid: Gfid,
        flags: UpcallFlags,
        stat: Option<Iatt>,
        p_stat: Option<Iatt>,
        oldp_stat: Option<Iatt>,
        dict: Option<Dict>,
    ) {
        if !self.enabled() || gfid.is_null() {
            return;
        }
        let Some(client_uid) = frame.root().client_uid.clone() else {
            // locally-originated frames have nobody to notify later
            return;
        };
        let timeout = self.options.cache_invalidation_timeout;
        let ctx = self.registry.get_or_create(gfid);
        ctx.touch(&client_uid, timeout);
        if flags == UpcallFlags::UPDATE_CLIENT {
            return;
        }
        for client in
            ctx.recipients(&client_uid, Duration::from_secs(timeout as u64))
        {
            debug!(
                "{}: invalidate {gfid} -> {} ({flags:?})",
                self.name, client.client_uid
            );
            self.sink.notify(UpcallEvent {
                client_uid: client.client_uid,
                gfid,
                event: UpcallEventKind::CacheInvalidation,
                flags,
                stat,
                p_stat,
                oldp_stat,
                dict: dict.clone(),
                expire_time_attr: client.expire_time_attr,
            });
        }
    }

    /// Keep only registered keys, and drop the event when what remains
    /// is an all-zero afr pending counter (a heal-completion no-op).
    fn filter_xattr(&self, dict: &Dict) -> Option<Dict> {
        let registered = self.xattrs.lock();
        let filtered = dict.deep_copy();
        filtered.retain(|key, _v| registered.contains(key));
        drop(registered);

        let mut meaningful = false;
        for (key, value) in filtered.pairs() {
            let zeroed = key.starts_with("trusted.afr.")
                && value
                    .as_bytes()
                    .map(|b| b.iter().all(|&x| x == 0))
                    .unwrap_or(false);
            if zeroed {
                filtered.remove(&key);
            } else {
                meaningful = true;
            }
        }
        meaningful.then_some(filtered)
    }

    fn gfid_of_loc(loc: &Loc) -> Gfid {
        loc.target_gfid()
    }
}

impl Xlator for Upcall {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<XlatorRef> {
        vec![self.child.clone()]
    }

    fn forget(&self, inode: &Arc<Inode>) {
        self.registry.mark_destroy(inode.gfid());
        inode.ctx_del(UPCALL_CTX);
    }

    fn lookup(&self, frame: CallFrame, loc: Loc, xdata: Option<Dict>) {
        let this = self.me();
        wind(
            frame,
            &self.child,
            FopRequest::Lookup { loc, xdata },
            move |frame, reply| {
                if reply.is_ok() {
                    if let FopReply::Lookup { buf, .. } = &reply.data {
                        this.cache_invalidate(
                            &frame,
                            buf.ia_gfid,
                            UpcallFlags::UPDATE_CLIENT,
                            None,
                            None,
                            None,
                            None,
                        );
                    }
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = fd.inode().gfid();
        wind(
            frame,
            &self.child,
            FopRequest::Open {
                loc,
                flags,
                fd,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::UPDATE_CLIENT,
                        None,
                        None,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = fd.inode().gfid();
        wind(
            frame,
            &self.child,
            FopRequest::Readv {
                fd,
                size,
                offset,
                flags,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::UPDATE_CLIENT,
                        None,
                        None,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = fd.inode().gfid();
        wind(
            frame,
            &self.child,
            FopRequest::Writev {
                fd,
                vector,
                offset,
                flags,
                iobref,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    let postbuf = match &reply.data {
                        FopReply::Writev { postbuf, .. } => Some(*postbuf),
                        _ => None,
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::WRITE | UpcallFlags::TIMES,
                        postbuf,
                        None,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
            },
        );
    }

    fn truncate(
        &self,
        frame: CallFrame,
        loc: Loc,
        offset: u64,
        xdata: Option<Dict>,
    ) {
        let this = self.me();
        let gfid = Self::gfid_of_loc(&loc);
        wind(
            frame,
            &self.child,
            FopRequest::Truncate { loc, offset, xdata },
            move |frame, reply| {
                if reply.is_ok() {
                    let postbuf = match &reply.data {
                        FopReply::Truncate { postbuf, .. } => Some(*postbuf),
                        _ => None,
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::WRITE | UpcallFlags::TIMES,
                        postbuf,
                        None,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
            },
        );
    }

    fn ftruncate(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        xdata: Option<Dict>,
    ) {
        let this = self.me();
        let gfid = fd.inode().gfid();
        wind(
            frame,
            &self.child,
            FopRequest::Ftruncate { fd, offset, xdata },
            move |frame, reply| {
                if reply.is_ok() {
                    let postbuf = match &reply.data {
                        FopReply::Ftruncate { postbuf, .. } => {
                            Some(*postbuf)
                        }
                        _ => None,
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::WRITE | UpcallFlags::TIMES,
                        postbuf,
                        None,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = Self::gfid_of_loc(&loc);
        wind(
            frame,
            &self.child,
            FopRequest::Setattr {
                loc,
                stbuf,
                valid,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    let statpost = match &reply.data {
                        FopReply::Setattr { statpost, .. } => {
                            Some(*statpost)
                        }
                        _ => None,
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::ATTR | UpcallFlags::TIMES,
                        statpost,
                        None,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = fd.inode().gfid();
        wind(
            frame,
            &self.child,
            FopRequest::Fsetattr {
                fd,
                stbuf,
                valid,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    let statpost = match &reply.data {
                        FopReply::Fsetattr { statpost, .. } => {
                            Some(*statpost)
                        }
                        _ => None,
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::ATTR | UpcallFlags::TIMES,
                        statpost,
                        None,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = Self::gfid_of_loc(&oldloc);
        wind(
            frame,
            &self.child,
            FopRequest::Rename {
                oldloc,
                newloc,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    if let FopReply::Rename {
                        buf,
                        postoldparent,
                        postnewparent,
                        ..
                    } = &reply.data
                    {
                        this.cache_invalidate(
                            &frame,
                            gfid,
                            UpcallFlags::PARENT_DENTRY
                                | UpcallFlags::TIMES,
                            Some(*buf),
                            Some(*postnewparent),
                            Some(*postoldparent),
                            None,
                        );
                    }
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = Self::gfid_of_loc(&loc);
        wind(
            frame,
            &self.child,
            FopRequest::Unlink { loc, flags, xdata },
            move |frame, reply| {
                if reply.is_ok() {
                    let postparent = match &reply.data {
                        FopReply::Unlink { postparent, .. } => {
                            Some(*postparent)
                        }
                        _ => None,
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::NLINK | UpcallFlags::PARENT_DENTRY,
                        None,
                        postparent,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = Self::gfid_of_loc(&oldloc);
        wind(
            frame,
            &self.child,
            FopRequest::Link {
                oldloc,
                newloc,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    let (buf, postparent) = match &reply.data {
                        FopReply::Link {
                            buf, postparent, ..
                        } => (Some(*buf), Some(*postparent)),
                        _ => (None, None),
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::NLINK | UpcallFlags::PARENT_DENTRY,
                        buf,
                        postparent,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
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
        let this = self.me();
        wind(
            frame,
            &self.child,
            FopRequest::Create {
                loc,
                flags,
                mode,
                umask,
                fd,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    if let FopReply::Create {
                        buf, postparent, ..
                    } = &reply.data
                    {
                        this.cache_invalidate(
                            &frame,
                            buf.ia_gfid,
                            UpcallFlags::PARENT_DENTRY
                                | UpcallFlags::TIMES,
                            Some(*buf),
                            Some(*postparent),
                            None,
                            None,
                        );
                    }
                }
                frame.unwind(reply);
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
        let this = self.me();
        wind(
            frame,
            &self.child,
            FopRequest::Mkdir {
                loc,
                mode,
                umask,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    if let FopReply::Mkdir {
                        buf, postparent, ..
                    } = &reply.data
                    {
                        this.cache_invalidate(
                            &frame,
                            buf.ia_gfid,
                            UpcallFlags::PARENT_DENTRY
                                | UpcallFlags::TIMES,
                            Some(*buf),
                            Some(*postparent),
                            None,
                            None,
                        );
                    }
                }
                frame.unwind(reply);
            },
        );
    }

    fn rmdir(
        &self,
        frame: CallFrame,
        loc: Loc,
        flags: i32,
        xdata: Option<Dict>,
    ) {
        let this = self.me();
        let gfid = Self::gfid_of_loc(&loc);
        wind(
            frame,
            &self.child,
            FopRequest::Rmdir { loc, flags, xdata },
            move |frame, reply| {
                if reply.is_ok() {
                    let postparent = match &reply.data {
                        FopReply::Rmdir { postparent, .. } => {
                            Some(*postparent)
                        }
                        _ => None,
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::NLINK | UpcallFlags::PARENT_DENTRY,
                        None,
                        postparent,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
            },
        );
    }

    fn symlink(
        &self,
        frame: CallFrame,
        linkpath: String,
        loc: Loc,
        umask: u32,
        xdata: Option<Dict>,
    ) {
        let this = self.me();
        wind(
            frame,
            &self.child,
            FopRequest::Symlink {
                linkpath,
                loc,
                umask,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    if let FopReply::Symlink {
                        buf, postparent, ..
                    } = &reply.data
                    {
                        this.cache_invalidate(
                            &frame,
                            buf.ia_gfid,
                            UpcallFlags::PARENT_DENTRY
                                | UpcallFlags::TIMES,
                            Some(*buf),
                            Some(*postparent),
                            None,
                            None,
                        );
                    }
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = fd.inode().gfid();
        wind(
            frame,
            &self.child,
            FopRequest::Fallocate {
                fd,
                keep_size,
                offset,
                len,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    let post = match &reply.data {
                        FopReply::Fallocate { post, .. } => Some(*post),
                        _ => None,
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::WRITE | UpcallFlags::TIMES,
                        post,
                        None,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = fd.inode().gfid();
        wind(
            frame,
            &self.child,
            FopRequest::Discard {
                fd,
                offset,
                len,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    let post = match &reply.data {
                        FopReply::Discard { post, .. } => Some(*post),
                        _ => None,
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::WRITE | UpcallFlags::TIMES,
                        post,
                        None,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = fd.inode().gfid();
        wind(
            frame,
            &self.child,
            FopRequest::Zerofill {
                fd,
                offset,
                len,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    let post = match &reply.data {
                        FopReply::Zerofill { post, .. } => Some(*post),
                        _ => None,
                    };
                    this.cache_invalidate(
                        &frame,
                        gfid,
                        UpcallFlags::WRITE | UpcallFlags::TIMES,
                        post,
                        None,
                        None,
                        None,
                    );
                }
                frame.unwind(reply);
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
        let this = self.me();
        let gfid = Self::gfid_of_loc(&loc);
        let changed = dict.clone();
        wind(
            frame,
            &self.child,
            FopRequest::Setxattr {
                loc,
                dict,
                flags,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    if let Some(filtered) = this.filter_xattr(&changed) {
                        this.cache_invalidate(
                            &frame,
                            gfid,
                            UpcallFlags::XATTR,
                            None,
                            None,
                            None,
                            Some(filtered),
                        );
                    }
                }
                frame.unwind(reply);
            },
        );
    }

    fn fsetxattr(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        dict: Dict,
        flags: i32,
        xdata: Option<Dict>,
    ) {
        let this = self.me();
        let gfid = fd.inode().gfid();
        let changed = dict.clone();
        wind(
            frame,
            &self.child,
            FopRequest::Fsetxattr {
                fd,
                dict,
                flags,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    if let Some(filtered) = this.filter_xattr(&changed) {
                        this.cache_invalidate(
                            &frame,
                            gfid,
                            UpcallFlags::XATTR,
                            None,
                            None,
                            None,
                            Some(filtered),
                        );
                    }
                }
                frame.unwind(reply);
            },
        );
    }

    fn removexattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        name: String,
        xdata: Option<Dict>,
    ) {
        let this = self.me();
        let gfid = Self::gfid_of_loc(&loc);
        let removed =
            Dict::from_iter([(name.clone(), DictValue::StaticStr(""))]);
        wind(
            frame,
            &self.child,
            FopRequest::Removexattr { loc, name, xdata },
            move |frame, reply| {
                if reply.is_ok() {
                    if let Some(filtered) = this.filter_xattr(&removed) {
                        this.cache_invalidate(
                            &frame,
                            gfid,
                            UpcallFlags::XATTR_RM,
                            None,
                            None,
                            None,
                            Some(filtered),
                        );
                    }
                }
                frame.unwind(reply);
            },
        );
    }

    fn fremovexattr(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        name: String,
        xdata: Option<Dict>,
    ) {
        let this = self.me();
        let gfid = fd.inode().gfid();
        let removed =
            Dict::from_iter([(name.clone(), DictValue::StaticStr(""))]);
        wind(
            frame,
            &self.child,
            FopRequest::Fremovexattr { fd, name, xdata },
            move |frame, reply| {
                if reply.is_ok() {
                    if let Some(filtered) = this.filter_xattr(&removed) {
                        this.cache_invalidate(
                            &frame,
                            gfid,
                            UpcallFlags::XATTR_RM,
                            None,
                            None,
                            None,
                            Some(filtered),
                        );
                    }
                }
                frame.unwind(reply);
            },
        );
    }
}

impl Drop for Upcall {
    fn drop(&mut self) {
        self.registry.shutdown();
    }
}

impl std::fmt::Debug for Upcall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upcall")
            .field("name", &self.name)
            .field("enabled", &self.enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests;
