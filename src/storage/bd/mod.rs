//! Block-device backend.
//!
//! Presents each bd-bound regular file as two linked objects: the posix
//! placeholder beneath (name, times, xattrs, nlink) and a logical volume
//! in the configured VG whose name is the file's gfid. Size and data I/O
//! go to the LV; everything else delegates to the posix child. The
//! binding is the `trusted.glusterfs.bd` xattr on the placeholder.

mod aio;
pub mod lvm;

use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bitflags::bitflags;
use log::debug;
use log::error;
use log::info;
use log::warn;
use parking_lot::Mutex;

use crate::checksum;
use crate::dict::Dict;
use crate::dict::DictValue;
use crate::errno::Errno;
use crate::fd::Fd;
use crate::fop::FopReply;
use crate::fop::FopRequest;
use crate::fop::Reply;
use crate::frame::CallFrame;
use crate::gfid::Gfid;
use crate::iatt::IaType;
use crate::iatt::Iatt;
use crate::iatt::IattTime;
use crate::iatt::IattValid;
use crate::inode::Inode;
use crate::inode::InodeTable;
use crate::iobuf::IoBuf;
use crate::iobuf::IoVec;
use crate::iobuf::IoVecList;
use crate::iobuf::Iobref;
use crate::iobuf::iov_concat;
use crate::loc::Loc;
use crate::xlator::Xlator;
use crate::xlator::XlatorRef;
use crate::xlator::forward;
use crate::xlator::wind;

use self::aio::AioEngine;
use self::lvm::Lvm;
use self::lvm::round_to_extent;

/// Context-slot key for bd state on inodes and fds.
pub const BD_CTX: &str = "bd";

/// The binding xattr on the posix placeholder.
pub const BD_XATTR: &str = "trusted.glusterfs.bd";
/// Offload: copy a source LV into a fresh destination LV.
pub const BD_XATTR_CLONE: &str = "trusted.glusterfs.bd.clone";
/// Offload: snapshot the source LV.
pub const BD_XATTR_SNAPSHOT: &str = "trusted.glusterfs.bd.snapshot";
/// Offload: merge a snapshot back into its origin.
pub const BD_XATTR_MERGE: &str = "trusted.glusterfs.bd.merge";
/// Synthetic getxattr key: snapshot origin introspection.
pub const BD_XATTR_ORIGIN: &str = "trusted.glusterfs.list-origin";
/// Synthetic getxattr key: backend type.
pub const VOL_TYPE: &str = "volume.type";
/// Synthetic getxattr key: capability bitmask.
pub const VOL_CAPS: &str = "volume.caps";
/// A distribute-layer placeholder marker; never a valid offload target.
pub const LINKTO_XATTR: &str = "trusted.glusterfs.dht.linkto";
/// VG tag binding a volume group to one deployment.
pub const VOLUME_ID_TAG: &str = "trusted.glusterfs.volume-id=";

/// O_DIRECT alignment for offload copies.
const ALIGN_SIZE: u64 = 4096;
/// Scatter width of the offload copy loop.
const IOV_NR: usize = 4;
/// Segment size of the offload copy loop.
const IOV_SIZE: usize = 64 * 1024;
/// Zero-fill fallback: max vectors per writev iteration.
const MAX_NO_VECT: usize = 1024;

bitflags! {
    /// Capability bits reported through `volume.caps`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct BdCaps: u64 {
        /// Block-device binding supported.
        const BD = 0x01;
        /// Thin provisioning available.
        const THIN = 0x02;
        /// Server-side copy offload.
        const OFFLOAD_COPY = 0x04;
        /// Server-side snapshot offload.
        const OFFLOAD_SNAPSHOT = 0x08;
        /// Server-side zero-fill offload.
        const OFFLOAD_ZERO = 0x20;
    }
}

/// Provisioning type of a bound LV.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BdType {
    /// Thick logical volume.
    Lv,
    /// Thin volume carved from the pool.
    Thin,
}

impl BdType {
    fn as_str(self) -> &'static str {
        match self {
            BdType::Lv => "lv",
            BdType::Thin => "thin",
        }
    }
}

impl std::fmt::Display for BdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a bd xattr value: `<type>[:<size>]`.
fn parse_bd_value(raw: &str) -> Option<(BdType, Option<u64>)> {
    let (ty, size) = match raw.split_once(':') {
        Some((ty, size)) => (ty, Some(size)),
        None => (raw, None),
    };
    let ty = match ty {
        "lv" => BdType::Lv,
        "thin" => BdType::Thin,
        _ => return None,
    };
    match size {
        None => Some((ty, None)),
        Some(s) => s.trim().parse::<u64>().ok().map(|n| (ty, Some(n))),
    }
}

/// Per-inode bd context: the cached attributes (size and blocks describe
/// the LV) and the provisioning type.
#[derive(Debug)]
pub(crate) struct BdAttr {
    iatt: Mutex<Iatt>,
    ty: BdType,
}

impl BdAttr {
    fn new(iatt: Iatt, ty: BdType) -> Arc<BdAttr> {
        Arc::new(BdAttr {
            iatt: Mutex::new(iatt),
            ty,
        })
    }

    /// Snapshot of the cached attributes.
    pub fn iatt(&self) -> Iatt {
        *self.iatt.lock()
    }

    /// The LV size.
    pub fn size(&self) -> u64 {
        self.iatt.lock().ia_size
    }

    /// The provisioning type.
    pub fn bd_type(&self) -> BdType {
        self.ty
    }

    fn set_size(&self, size: u64) {
        let mut iatt = self.iatt.lock();
        iatt.ia_size = size;
        iatt.ia_blocks = size / 512;
    }

    fn touch_atime(&self) {
        self.iatt.lock().ia_atime = IattTime::now();
    }

    fn touch_mtime(&self) {
        let mut iatt = self.iatt.lock();
        let now = IattTime::now();
        iatt.ia_mtime = now;
        iatt.ia_ctime = now;
    }

    /// Fold a posix setattr result in, keeping LV-owned size/blocks.
    fn apply_posix(&self, post: &Iatt, valid: IattValid) {
        let mut iatt = self.iatt.lock();
        let keep_size = iatt.ia_size;
        let keep_blocks = iatt.ia_blocks;
        iatt.apply_valid(post, valid);
        iatt.ia_size = keep_size;
        iatt.ia_blocks = keep_blocks;
    }

    /// Refresh link bookkeeping from a posix reply.
    fn refresh_links(&self, buf: &Iatt) {
        let mut iatt = self.iatt.lock();
        iatt.ia_nlink = buf.ia_nlink;
        iatt.ia_ctime = buf.ia_ctime;
    }
}

/// Per-fd bd state: the open LV device and its O_DIRECT mode.
#[derive(Debug)]
pub(crate) struct BdFd {
    file: File,
    odirect: AtomicBool,
}

impl BdFd {
    /// Flip O_DIRECT to match what this request needs; only issues the
    /// fcntl when the bit actually changes.
    fn set_odirect(&self, opflags: i32, offset: u64, len: u64) {
        let want = if opflags & libc::O_DIRECT != 0 {
            true
        } else {
            aio::direct_ok(offset, len)
        };
        if self.odirect.swap(want, Ordering::AcqRel) == want {
            return;
        }
        let res = nix::fcntl::fcntl(&self.file, nix::fcntl::FcntlArg::F_GETFL)
            .and_then(|bits| {
                let mut flags =
                    nix::fcntl::OFlag::from_bits_truncate(bits);
                flags.set(nix::fcntl::OFlag::O_DIRECT, want);
                nix::fcntl::fcntl(
                    &self.file,
                    nix::fcntl::FcntlArg::F_SETFL(flags),
                )
            });
        if let Err(e) = res {
            warn!("fcntl O_DIRECT toggle failed: {e}");
        }
    }
}

/// Configuration for one bd instance.
#[derive(Clone, Debug)]
pub struct BdOptions {
    /// Volume group name (`bd.export`).
    pub export: String,
    /// Backend type; only `vg` is supported (`bd.device`).
    pub device: String,
    /// Deployment id the VG must be tagged with.
    pub volume_id: Gfid,
    /// Start with the async I/O path enabled (`bd.bd-aio`).
    pub aio: bool,
}

impl BdOptions {
    /// Parse from a string option map.
    pub fn from_map(map: &HashMap<String, String>) -> io::Result<BdOptions> {
        let export = map
            .get("bd.export")
            .cloned()
            .ok_or_else(|| io::Error::other("bd.export is required"))?;
        let device =
            map.get("bd.device").cloned().unwrap_or_else(|| "vg".into());
        if device != "vg" {
            return Err(io::Error::other(format!(
                "unsupported bd.device {device:?}; only \"vg\""
            )));
        }
        let volume_id = map
            .get("volume-id")
            .ok_or_else(|| io::Error::other("volume-id is required"))?
            .parse()
            .map_err(|_| io::Error::other("volume-id is not a uuid"))?;
        let aio = map
            .get("bd.bd-aio")
            .map(|v| matches!(v.as_str(), "on" | "true" | "yes" | "1"))
            .unwrap_or(false);
        Ok(BdOptions {
            export,
            device,
            volume_id,
            aio,
        })
    }
}

enum Offload {
    Clone,
    Snapshot,
    Merge,
}

/// The block-device translator.
pub struct Bd {
    weak: Weak<Bd>,
    name: String,
    child: XlatorRef,
    itable: Arc<InodeTable>,
    lvm: Arc<dyn Lvm>,
    caps: BdCaps,
    aio: Mutex<Option<Arc<AioEngine>>>,
}

impl Bd {
    /// Validate the VG binding and construct the translator.
    ///
    /// Fatal when the VG carries no `volume-id` tag or the tag names a
    /// different deployment.
    pub fn new(
        name: &str,
        child: XlatorRef,
        itable: Arc<InodeTable>,
        lvm: Arc<dyn Lvm>,
        options: &BdOptions,
    ) -> io::Result<Arc<Bd>> {
        let tags = lvm.vg_tags()?;
        let tagged = tags
            .iter()
            .find_map(|t| t.strip_prefix(VOLUME_ID_TAG))
            .ok_or_else(|| {
                io::Error::other(format!(
                    "vg {} carries no {VOLUME_ID_TAG} tag",
                    options.export
                ))
            })?;
        let tagged: Gfid = tagged.parse().map_err(|_| {
            io::Error::other(format!("vg volume-id tag is not a uuid: {tagged}"))
        })?;
        if tagged != options.volume_id {
            return Err(io::Error::other(format!(
                "vg {} belongs to volume {tagged}, not {}",
                options.export, options.volume_id
            )));
        }

        let mut caps = BdCaps::BD
            | BdCaps::OFFLOAD_COPY
            | BdCaps::OFFLOAD_SNAPSHOT
            | BdCaps::OFFLOAD_ZERO;
        match lvm.thin_pool() {
            Ok(Some(pool)) => {
                info!("{name}: thin pool {pool} found");
                caps |= BdCaps::THIN;
            }
            Ok(None) => {}
            Err(e) => warn!("{name}: thin pool scan failed: {e}"),
        }

        let bd = Arc::new_cyclic(|weak| Bd {
            weak: weak.clone(),
            name: name.to_string(),
            child,
            itable,
            lvm,
            caps,
            aio: Mutex::new(None),
        });
        if options.aio {
            bd.configure_aio(true);
        }
        Ok(bd)
    }

    /// The capability bits advertised through `volume.caps`.
    pub fn caps(&self) -> BdCaps {
        self.caps
    }

    /// Switch between the sync and async read/write paths. Only the
    /// entry points change; in-flight requests finish where they
    /// started. AIO init failure keeps the backend in sync mode.
    pub fn configure_aio(&self, enable: bool) {
        let mut slot = self.aio.lock();
        match (enable, slot.as_ref()) {
            (true, None) => match AioEngine::new(&self.name) {
                Ok(engine) => {
                    info!("{}: async I/O enabled", self.name);
                    *slot = Some(engine);
                }
                Err(e) => {
                    warn!(
                        "{}: aio init failed, staying in sync mode: {e}",
                        self.name
                    );
                }
            },
            (false, Some(_)) => {
                if let Some(engine) = slot.take() {
                    engine.shutdown();
                    info!("{}: async I/O disabled", self.name);
                }
            }
            _ => {}
        }
    }

    fn me(&self) -> Arc<Bd> {
        self.weak.upgrade().expect("bd translator still referenced")
    }

    fn aio_engine(&self) -> Option<Arc<AioEngine>> {
        self.aio.lock().clone()
    }

    fn attr_of_inode(&self, inode: &Arc<Inode>) -> Option<Arc<BdAttr>> {
        inode.ctx_get::<BdAttr>(BD_CTX)
    }

    fn attr_of_loc(&self, loc: &Loc) -> Option<Arc<BdAttr>> {
        if let Some(inode) = &loc.inode {
            return self.attr_of_inode(inode);
        }
        self.itable
            .find(loc.target_gfid())
            .and_then(|inode| self.attr_of_inode(&inode))
    }

    fn inode_for(&self, loc: &Loc, gfid: Gfid) -> Option<Arc<Inode>> {
        loc.inode.clone().or_else(|| self.itable.find(gfid))
    }

    /// Fire-and-forget repair write to the posix placeholder; own
    /// failures are ignored.
    fn repair_xattr(&self, gfid: Gfid, value: Option<String>) {
        let name = self.name.clone();
        let loc = Loc {
            gfid,
            ..Default::default()
        };
        let req = match value {
            Some(value) => {
                let dict = Dict::from_iter([(BD_XATTR, DictValue::Str(value))]);
                FopRequest::Setxattr {
                    loc,
                    dict,
                    flags: 0,
                    xdata: None,
                }
            }
            None => FopRequest::Removexattr {
                loc,
                name: BD_XATTR.to_string(),
                xdata: None,
            },
        };
        let frame = CallFrame::new(
            crate::frame::CallRoot::new(),
            req.kind(),
            move |reply| {
                if !reply.is_ok() {
                    debug!(
                        "{name}: background xattr repair failed: {}",
                        reply.op_errno
                    );
                }
            },
        );
        crate::xlator::dispatch(&self.child, frame, req);
    }

    /// Background posix time refresh after flush/fsync.
    fn refresh_posix_times(&self, gfid: Gfid, iatt: Iatt) {
        let name = self.name.clone();
        let frame = CallFrame::new(
            crate::frame::CallRoot::new(),
            crate::fop::FopKind::Setattr,
            move |reply| {
                if !reply.is_ok() {
                    debug!(
                        "{name}: background time refresh failed: {}",
                        reply.op_errno
                    );
                }
            },
        );
        crate::xlator::dispatch(
            &self.child,
            frame,
            FopRequest::Setattr {
                loc: Loc {
                    gfid,
                    ..Default::default()
                },
                stbuf: iatt,
                valid: IattValid::ATIME | IattValid::MTIME,
                xdata: None,
            },
        );
    }

    /// Validate a discovered binding and install the inode context.
    /// Returns the iatt to report, or None when the binding is stale.
    fn bind_inode(
        &self,
        inode: &Arc<Inode>,
        posix_buf: &Iatt,
        raw_value: &str,
    ) -> Option<Iatt> {
        let Some((ty, declared)) = parse_bd_value(raw_value) else {
            warn!(
                "{}: malformed bd xattr {raw_value:?} on {}",
                self.name, posix_buf.ia_gfid
            );
            return None;
        };
        let lv = posix_buf.ia_gfid.to_string();
        let actual = match self.lvm.lv_size(&lv) {
            Ok(size) => size,
            Err(_) => {
                // stale binding: the LV is gone; heal by dropping the
                // marker and treating the file as plain posix
                warn!(
                    "{}: bd xattr names missing lv {lv}, removing",
                    self.name
                );
                self.repair_xattr(posix_buf.ia_gfid, None);
                inode.ctx_del(BD_CTX);
                return None;
            }
        };
        if declared != Some(actual) {
            self.repair_xattr(
                posix_buf.ia_gfid,
                Some(format!("{ty}:{actual}")),
            );
        }
        let mut iatt = *posix_buf;
        iatt.ia_size = actual;
        iatt.ia_blocks = actual / 512;
        match self.attr_of_inode(inode) {
            Some(attr) => attr.set_size(actual),
            None => inode.ctx_set(BD_CTX, BdAttr::new(iatt, ty)),
        }
        Some(iatt)
    }

    fn create_lv_flow(
        &self,
        frame: CallFrame,
        loc: Loc,
        ty: BdType,
        requested: Option<u64>,
    ) {
        if ty == BdType::Thin && !self.caps.contains(BdCaps::THIN) {
            return frame.unwind_error(Errno::EOPNOTSUPP);
        }
        if self.attr_of_loc(&loc).is_some() {
            return frame.unwind_error(Errno::EEXIST);
        }
        let this = self.me();
        let stat_loc = loc.clone();
        wind(
            frame,
            &self.child,
            FopRequest::Stat {
                loc: stat_loc,
                xdata: None,
            },
            move |frame, reply| {
                if !reply.is_ok() {
                    return frame.unwind_error(reply.op_errno);
                }
                let FopReply::Stat { buf, .. } = reply.data else {
                    return frame.unwind_error(Errno::EINVAL);
                };
                if buf.ia_type != IaType::Regular {
                    return frame.unwind_error(Errno::EINVAL);
                }
                let size = match requested {
                    Some(size) => size,
                    None => match this.lvm.extent_size() {
                        Ok(extent) => extent,
                        Err(e) => {
                            error!("{}: extent size query: {e}", this.name);
                            return frame.unwind_error(Errno::from(e));
                        }
                    },
                };
                this.create_lv_bind(frame, loc, buf, ty, size);
            },
        );
    }

    /// Steps 2-4 of the binding protocol: mark the placeholder, create
    /// the LV, and roll the marker back if creation fails.
    fn create_lv_bind(
        self: &Arc<Bd>,
        frame: CallFrame,
        loc: Loc,
        posix_buf: Iatt,
        ty: BdType,
        size: u64,
    ) {
        let this = self.clone();
        let dict = Dict::from_iter([(
            BD_XATTR,
            DictValue::Str(format!("{ty}:{size}")),
        )]);
        let xattr_loc = loc.clone();
        wind(
            frame,
            &self.child,
            FopRequest::Setxattr {
                loc: xattr_loc,
                dict,
                flags: 0,
                xdata: None,
            },
            move |frame, reply| {
                if !reply.is_ok() {
                    return frame.unwind_error(reply.op_errno);
                }
                let gfid = posix_buf.ia_gfid;
                let lv = gfid.to_string();
                match this.lvm.create_lv(&lv, size, ty == BdType::Thin) {
                    Ok(actual) => {
                        if actual != size {
                            this.repair_xattr(
                                gfid,
                                Some(format!("{ty}:{actual}")),
                            );
                        }
                        let mut iatt = posix_buf;
                        iatt.ia_size = actual;
                        iatt.ia_blocks = actual / 512;
                        if let Some(inode) = this.inode_for(&loc, gfid) {
                            inode.ctx_set(BD_CTX, BdAttr::new(iatt, ty));
                        }
                        info!(
                            "{}: bound {lv} as {ty} lv of {actual} bytes",
                            this.name
                        );
                        frame.unwind(Reply::ok(FopReply::Setxattr {
                            xdata: None,
                        }));
                    }
                    Err(e) => {
                        warn!("{}: lv create failed: {e}", this.name);
                        this.repair_xattr(gfid, None);
                        frame.unwind_error(e.errno());
                    }
                }
            },
        );
    }

    fn offload_flow(
        &self,
        frame: CallFrame,
        loc: Loc,
        op: Offload,
        raw_value: &str,
    ) {
        if matches!(op, Offload::Merge) {
            return self.merge_flow(frame, loc, raw_value);
        }
        let Some(src_attr) = self.attr_of_loc(&loc) else {
            // only bd-bound files can be cloned or snapshotted
            return frame.unwind_error(Errno::EINVAL);
        };
        let (dst_raw, size) = match raw_value.split_once(':') {
            Some((g, s)) => match s.trim().parse::<u64>() {
                Ok(n) => (g, Some(n)),
                Err(_) => return frame.unwind_error(Errno::EINVAL),
            },
            None => (raw_value, None),
        };
        let Ok(dst_gfid) = dst_raw.trim().parse::<Gfid>() else {
            return frame.unwind_error(Errno::EINVAL);
        };

        let this = self.me();
        let src_gfid = loc.target_gfid();
        let xattr_req = Dict::from_iter([
            (BD_XATTR, DictValue::StaticStr("")),
            (LINKTO_XATTR, DictValue::StaticStr("")),
        ]);
        wind(
            frame,
            &self.child,
            FopRequest::Lookup {
                loc: Loc {
                    gfid: dst_gfid,
                    ..Default::default()
                },
                xdata: Some(xattr_req),
            },
            move |frame, reply| {
                if !reply.is_ok() {
                    return frame.unwind_error(reply.op_errno);
                }
                let FopReply::Lookup {
                    inode, buf, xdata, ..
                } = reply.data
                else {
                    return frame.unwind_error(Errno::EINVAL);
                };
                if buf.ia_type != IaType::Regular {
                    return frame.unwind_error(Errno::EINVAL);
                }
                if let Some(xdata) = &xdata {
                    if xdata.contains(BD_XATTR) {
                        // destination is already bound
                        return frame.unwind_error(Errno::EEXIST);
                    }
                    if xdata.contains(LINKTO_XATTR) {
                        return frame.unwind_error(Errno::EINVAL);
                    }
                }
                let src_size = src_attr.size();
                let size = size.unwrap_or(src_size);
                let src_lv = src_gfid.to_string();
                let dst_lv = dst_gfid.to_string();
                let created = match op {
                    Offload::Snapshot => {
                        this.lvm.snapshot_lv(&src_lv, &dst_lv, size)
                    }
                    Offload::Clone => {
                        this.clone_lv(&src_lv, &dst_lv, src_size)
                    }
                    Offload::Merge => unreachable!("handled above"),
                };
                let actual = match created {
                    Ok(actual) => actual,
                    Err(e) => {
                        warn!("{}: offload failed: {e}", this.name);
                        return frame.unwind_error(e.errno());
                    }
                };
                this.finish_offload(
                    frame, dst_gfid, inode, buf, actual,
                );
            },
        );
    }

    /// Copy a source LV into a newly created destination, O_DIRECT
    /// 4 KiB-aligned scatter I/O, IOV_NR x IOV_SIZE per iteration.
    fn clone_lv(
        &self,
        src_lv: &str,
        dst_lv: &str,
        size: u64,
    ) -> Result<u64, lvm::LvmError> {
        let actual = self.lvm.create_lv(dst_lv, size, false)?;
        let res = copy_device(
            &self.lvm.device_path(src_lv),
            &self.lvm.device_path(dst_lv),
            size,
        );
        if let Err(e) = res {
            // never leave a half-written destination bound
            if let Err(del) = self.lvm.delete_lv(dst_lv) {
                warn!("{}: cleanup of {dst_lv} failed: {del}", self.name);
            }
            return Err(lvm::LvmError::Io(e));
        }
        Ok(actual)
    }

    /// Mark the offload destination: write its bd xattr and install the
    /// inode context.
    fn finish_offload(
        self: &Arc<Bd>,
        frame: CallFrame,
        dst_gfid: Gfid,
        dst_inode: Option<Arc<Inode>>,
        mut dst_buf: Iatt,
        size: u64,
    ) {
        let this = self.clone();
        let dict = Dict::from_iter([(
            BD_XATTR,
            DictValue::Str(format!("lv:{size}")),
        )]);
        wind(
            frame,
            &self.child,
            FopRequest::Setxattr {
                loc: Loc {
                    gfid: dst_gfid,
                    inode: dst_inode.clone(),
                    ..Default::default()
                },
                dict,
                flags: 0,
                xdata: None,
            },
            move |frame, reply| {
                if !reply.is_ok() {
                    warn!(
                        "{}: offload target xattr failed: {}",
                        this.name, reply.op_errno
                    );
                    if let Err(e) =
                        this.lvm.delete_lv(&dst_gfid.to_string())
                    {
                        warn!("{}: cleanup failed: {e}", this.name);
                    }
                    return frame.unwind_error(reply.op_errno);
                }
                dst_buf.ia_size = size;
                dst_buf.ia_blocks = size / 512;
                let inode = dst_inode
                    .or_else(|| this.itable.find(dst_gfid));
                if let Some(inode) = inode {
                    inode.ctx_set(
                        BD_CTX,
                        BdAttr::new(dst_buf, BdType::Lv),
                    );
                }
                frame.unwind(Reply::ok(FopReply::Setxattr { xdata: None }));
            },
        );
    }

    fn merge_flow(&self, frame: CallFrame, loc: Loc, raw_value: &str) {
        let snap_gfid = if raw_value.is_empty() {
            loc.target_gfid()
        } else {
            match raw_value.trim().parse::<Gfid>() {
                Ok(g) => g,
                Err(_) => return frame.unwind_error(Errno::EINVAL),
            }
        };
        let snap_lv = snap_gfid.to_string();
        match self.lvm.lv_origin(&snap_lv) {
            Ok(Some(origin)) => {
                if let Err(e) = self.lvm.merge_lv(&snap_lv) {
                    warn!("{}: merge of {snap_lv} failed: {e}", self.name);
                    return frame.unwind_error(e.errno());
                }
                info!("{}: merged {snap_lv} into {origin}", self.name);
            }
            Ok(None) => return frame.unwind_error(Errno::EINVAL),
            Err(e) => return frame.unwind_error(Errno::from(e)),
        }
        // The snapshot LV is gone; its placeholder follows.
        let this = self.me();
        let unlink_loc = Loc {
            gfid: snap_gfid,
            ..loc
        };
        wind(
            frame,
            &self.child,
            FopRequest::Unlink {
                loc: unlink_loc,
                flags: 0,
                xdata: None,
            },
            move |frame, reply| {
                if !reply.is_ok() {
                    warn!(
                        "{}: merged snapshot placeholder unlink failed: {}",
                        this.name, reply.op_errno
                    );
                    return frame.unwind_error(reply.op_errno);
                }
                this.itable.forget(snap_gfid);
                frame.unwind(Reply::ok(FopReply::Setxattr { xdata: None }));
            },
        );
    }

    fn synthetic_getxattr(
        &self,
        frame: &CallFrame,
        attr: Option<Arc<BdAttr>>,
        gfid: Gfid,
        name: &str,
    ) -> Option<Reply> {
        match name {
            VOL_TYPE => {
                let dict =
                    Dict::from_iter([(VOL_TYPE, DictValue::Int(1))]);
                Some(Reply::ok(FopReply::Getxattr {
                    dict: Some(dict),
                    xdata: None,
                }))
            }
            VOL_CAPS => {
                let dict = Dict::from_iter([(
                    VOL_CAPS,
                    DictValue::Int(self.caps.bits() as i64),
                )]);
                Some(Reply::ok(FopReply::Getxattr {
                    dict: Some(dict),
                    xdata: None,
                }))
            }
            BD_XATTR_ORIGIN => {
                if attr.is_none() {
                    return Some(Reply::error(
                        frame.kind(),
                        Errno::EINVAL,
                    ));
                }
                match self.lvm.lv_origin(&gfid.to_string()) {
                    Ok(Some(origin)) => {
                        let dict = Dict::from_iter([(
                            BD_XATTR_ORIGIN,
                            DictValue::Str(origin),
                        )]);
                        Some(Reply::ok(FopReply::Getxattr {
                            dict: Some(dict),
                            xdata: None,
                        }))
                    }
                    Ok(None) => {
                        Some(Reply::error(frame.kind(), Errno::ENODATA))
                    }
                    Err(e) => {
                        Some(Reply::error(frame.kind(), Errno::from(e)))
                    }
                }
            }
            _ => None,
        }
    }

    fn do_truncate(
        &self,
        frame: CallFrame,
        inode_gfid: Gfid,
        attr: Arc<BdAttr>,
        new_size: u64,
    ) {
        let current = attr.size();
        let prebuf = attr.iatt();
        if new_size <= current {
            // no LV shrink; the operation is a time bump
            attr.touch_mtime();
            let postbuf = attr.iatt();
            return frame.unwind(Reply::ok(FopReply::Truncate {
                prebuf,
                postbuf,
                xdata: None,
            }));
        }
        let extent = match self.lvm.extent_size() {
            Ok(e) => e,
            Err(e) => return frame.unwind_error(Errno::from(e)),
        };
        let rounded = round_to_extent(new_size, extent);
        let ty = attr.bd_type();
        let this = self.me();
        let dict = Dict::from_iter([(
            BD_XATTR,
            DictValue::Str(format!("{ty}:{rounded}")),
        )]);
        wind(
            frame,
            &self.child,
            FopRequest::Setxattr {
                loc: Loc {
                    gfid: inode_gfid,
                    ..Default::default()
                },
                dict,
                flags: 0,
                xdata: None,
            },
            move |frame, reply| {
                if !reply.is_ok() {
                    return frame.unwind_error(reply.op_errno);
                }
                match this.lvm.resize_lv(&inode_gfid.to_string(), rounded) {
                    Ok(actual) => {
                        attr.set_size(actual);
                        attr.touch_mtime();
                        let postbuf = attr.iatt();
                        frame.unwind(Reply::ok(FopReply::Truncate {
                            prebuf,
                            postbuf,
                            xdata: None,
                        }));
                    }
                    Err(e) => {
                        warn!("{}: lv resize failed: {e}", this.name);
                        this.repair_xattr(
                            inode_gfid,
                            Some(format!("{ty}:{current}")),
                        );
                        frame.unwind_error(e.errno());
                    }
                }
            },
        );
    }
}

fn read_reply(
    frame: &CallFrame,
    attr: &BdAttr,
    data: Vec<u8>,
    offset: u64,
) {
    let n = data.len();
    attr.touch_atime();
    let stbuf = attr.iatt();
    let mut op_errno = Errno::OK;
    if offset + n as u64 >= stbuf.ia_size {
        // EOF hint travels in the errno slot beside the byte count
        op_errno = Errno::ENOENT;
    }
    let buf = IoBuf::from_vec(data);
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

impl Xlator for Bd {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<XlatorRef> {
        vec![self.child.clone()]
    }

    fn forget(&self, inode: &Arc<Inode>) {
        inode.ctx_del(BD_CTX);
    }

    fn release(&self, fd: &Arc<Fd>) {
        fd.ctx_del(BD_CTX);
    }

    fn lookup(&self, frame: CallFrame, loc: Loc, xdata: Option<Dict>) {
        let this = self.me();
        let asked_bd =
            xdata.as_ref().map(|d| d.contains(BD_XATTR)).unwrap_or(false);
        let xattr_req = match &xdata {
            Some(d) => d.deep_copy(),
            None => Dict::new(),
        };
        xattr_req.set(BD_XATTR, DictValue::StaticStr(""));
        wind(
            frame,
            &self.child,
            FopRequest::Lookup {
                loc,
                xdata: Some(xattr_req),
            },
            move |frame, mut reply| {
                if !reply.is_ok() {
                    return frame.unwind(reply);
                }
                let FopReply::Lookup {
                    inode,
                    buf,
                    xdata,
                    postparent,
                } = reply.data
                else {
                    return frame.unwind_error(Errno::EINVAL);
                };
                let mut buf = buf;
                if let (Some(inode), Some(found)) = (
                    &inode,
                    xdata
                        .as_ref()
                        .and_then(|d| d.get(BD_XATTR))
                        .and_then(|v| v.as_str().map(String::from)),
                ) {
                    if let Some(bound) =
                        this.bind_inode(inode, &buf, &found)
                    {
                        buf = bound;
                    }
                }
                if let (false, Some(xdata)) = (asked_bd, &xdata) {
                    xdata.remove(BD_XATTR);
                }
                reply.data = FopReply::Lookup {
                    inode,
                    buf,
                    xdata,
                    postparent,
                };
                frame.unwind(reply);
            },
        );
    }

    fn stat(&self, frame: CallFrame, loc: Loc, xdata: Option<Dict>) {
        let Some(attr) = self.attr_of_loc(&loc) else {
            return forward(self, frame, FopRequest::Stat { loc, xdata });
        };
        frame.unwind(Reply::ok(FopReply::Stat {
            buf: attr.iatt(),
            xdata: None,
        }));
    }

    fn fstat(&self, frame: CallFrame, fd: Arc<Fd>, xdata: Option<Dict>) {
        let Some(attr) = self.attr_of_inode(fd.inode()) else {
            return forward(self, frame, FopRequest::Fstat { fd, xdata });
        };
        frame.unwind(Reply::ok(FopReply::Fstat {
            buf: attr.iatt(),
            xdata: None,
        }));
    }

    fn statfs(&self, frame: CallFrame, loc: Loc, xdata: Option<Dict>) {
        let this = self.me();
        wind(
            frame,
            &self.child,
            FopRequest::Statfs { loc, xdata },
            move |frame, mut reply| {
                if reply.is_ok() {
                    if let FopReply::Statfs { buf, .. } = &mut reply.data {
                        match (this.lvm.vg_space(), this.lvm.extent_size())
                        {
                            (Ok(space), Ok(extent)) if extent > 0 => {
                                buf.frsize = extent;
                                buf.blocks = space.size / extent;
                                buf.bfree = space.free / extent;
                                buf.bavail = space.free / extent;
                            }
                            (Err(e), _) | (_, Err(e)) => {
                                warn!(
                                    "{}: vg stat failed: {e}",
                                    this.name
                                );
                            }
                            _ => {}
                        }
                    }
                }
                frame.unwind(reply);
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
        let this = self.me();
        wind(
            frame,
            &self.child,
            FopRequest::Readdirp {
                fd,
                size,
                offset,
                xdata,
            },
            move |frame, mut reply| {
                if let FopReply::Readdirp { entries, .. } = &mut reply.data
                {
                    for entry in entries {
                        let Some(inode) =
                            this.itable.find(entry.stat.ia_gfid)
                        else {
                            continue;
                        };
                        if let Some(attr) = this.attr_of_inode(&inode) {
                            let bd = attr.iatt();
                            entry.stat.ia_size = bd.ia_size;
                            entry.stat.ia_blocks = bd.ia_blocks;
                        }
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
        let Some(_attr) = self.attr_of_loc(&loc) else {
            return forward(
                self,
                frame,
                FopRequest::Open {
                    loc,
                    flags,
                    fd,
                    xdata,
                },
            );
        };
        let device =
            self.lvm.device_path(&loc.target_gfid().to_string());
        let acc = flags & libc::O_ACCMODE;
        // the device always exists and must never be truncated at open
        let open_flags = (flags | libc::O_LARGEFILE)
            & !(libc::O_CREAT | libc::O_TRUNC | libc::O_ACCMODE);
        let file = match OpenOptions::new()
            .read(acc == libc::O_RDONLY || acc == libc::O_RDWR)
            .write(acc == libc::O_WRONLY || acc == libc::O_RDWR)
            .custom_flags(open_flags)
            .open(&device)
        {
            Ok(f) => f,
            Err(e) => {
                error!(
                    "{}: open of {} failed: {e}",
                    self.name,
                    device.display()
                );
                return frame.unwind_error(e.into());
            }
        };
        fd.ctx_set(
            BD_CTX,
            Arc::new(BdFd {
                file,
                odirect: AtomicBool::new(flags & libc::O_DIRECT != 0),
            }),
        );
        // the placeholder opens too; losing either side closes both
        let child_fd = fd.clone();
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
                if !reply.is_ok() {
                    child_fd.ctx_del(BD_CTX);
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
        let Some(bdfd) = fd.ctx_get::<BdFd>(BD_CTX) else {
            return forward(
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
        };
        if size == 0 {
            warn!("{}: zero-length read", self.name);
            return frame.unwind_error(Errno::EINVAL);
        }
        let Some(attr) = self.attr_of_inode(fd.inode()) else {
            return frame.unwind_error(Errno::EINVAL);
        };

        if let Some(engine) = self.aio_engine() {
            bdfd.set_odirect(flags as i32, offset, size);
            let raw = bdfd.file.as_raw_fd();
            engine.submit_read(frame, fd, raw, size as usize, offset);
            return;
        }

        // aligned destination: the fd may carry O_DIRECT from open
        let mut buf = AlignedBuf::new(size as usize);
        match nix::sys::uio::pread(
            &bdfd.file,
            buf.as_mut_slice(),
            offset as libc::off_t,
        ) {
            Ok(n) => {
                let data = buf.as_slice()[..n].to_vec();
                read_reply(&frame, &attr, data, offset);
            }
            Err(e) => {
                error!("{}: read failed at {offset}: {e}", self.name);
                frame.unwind_error(e.into());
            }
        }
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
        let Some(bdfd) = fd.ctx_get::<BdFd>(BD_CTX) else {
            return forward(
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
        };
        let Some(attr) = self.attr_of_inode(fd.inode()) else {
            return frame.unwind_error(Errno::EINVAL);
        };
        let prebuf = attr.iatt();

        if let Some(engine) = self.aio_engine() {
            let data = iov_concat(&vector);
            // a zero-byte write has nothing to submit; the sync path
            // answers it
            if !data.is_empty() {
                bdfd.set_odirect(flags as i32, offset, data.len() as u64);
                let raw = bdfd.file.as_raw_fd();
                engine.submit_write(frame, fd, raw, data, offset, prebuf);
                return;
            }
        }

        let slices: Vec<std::io::IoSlice<'_>> = vector
            .iter()
            .map(|v| std::io::IoSlice::new(v.as_slice()))
            .collect();
        match nix::sys::uio::pwritev(
            &bdfd.file,
            &slices,
            offset as libc::off_t,
        ) {
            Ok(n) => {
                attr.touch_mtime();
                let postbuf = attr.iatt();
                frame.unwind(Reply::ok_ret(
                    n as i64,
                    FopReply::Writev {
                        prebuf,
                        postbuf,
                        xdata: None,
                    },
                ));
            }
            Err(e) => {
                error!("{}: write failed at {offset}: {e}", self.name);
                frame.unwind_error(e.into());
            }
        }
    }

    fn truncate(
        &self,
        frame: CallFrame,
        loc: Loc,
        offset: u64,
        xdata: Option<Dict>,
    ) {
        let Some(attr) = self.attr_of_loc(&loc) else {
            return forward(
                self,
                frame,
                FopRequest::Truncate { loc, offset, xdata },
            );
        };
        self.do_truncate(frame, loc.target_gfid(), attr, offset);
    }

    fn ftruncate(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        xdata: Option<Dict>,
    ) {
        let Some(attr) = self.attr_of_inode(fd.inode()) else {
            return forward(
                self,
                frame,
                FopRequest::Ftruncate { fd, offset, xdata },
            );
        };
        // the reply shape differs from truncate; adapt around the
        // shared grow path
        let gfid = fd.inode().gfid();
        let inner = ftruncate_adapter(frame);
        self.do_truncate(inner, gfid, attr, offset);
    }

    fn flush(&self, frame: CallFrame, fd: Arc<Fd>, xdata: Option<Dict>) {
        let attr = self.attr_of_inode(fd.inode());
        let gfid = fd.inode().gfid();
        let this = self.me();
        wind(
            frame,
            &self.child,
            FopRequest::Flush { fd, xdata },
            move |frame, reply| {
                if reply.is_ok() {
                    if let Some(attr) = attr {
                        this.refresh_posix_times(gfid, attr.iatt());
                    }
                }
                frame.unwind(reply);
            },
        );
    }

    fn fsync(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        datasync: bool,
        xdata: Option<Dict>,
    ) {
        let Some(bdfd) = fd.ctx_get::<BdFd>(BD_CTX) else {
            return forward(
                self,
                frame,
                FopRequest::Fsync {
                    fd,
                    datasync,
                    xdata,
                },
            );
        };
        let Some(attr) = self.attr_of_inode(fd.inode()) else {
            return frame.unwind_error(Errno::EINVAL);
        };
        let prebuf = attr.iatt();
        let res = if datasync {
            nix::unistd::fdatasync(&bdfd.file)
        } else {
            nix::unistd::fsync(&bdfd.file)
        };
        if let Err(e) = res {
            error!("{}: fsync failed: {e}", self.name);
            return frame.unwind_error(e.into());
        }
        self.refresh_posix_times(fd.inode().gfid(), prebuf);
        frame.unwind(Reply::ok(FopReply::Fsync {
            prebuf,
            postbuf: attr.iatt(),
            xdata: None,
        }));
    }

    fn unlink(
        &self,
        frame: CallFrame,
        loc: Loc,
        flags: i32,
        xdata: Option<Dict>,
    ) {
        if let Some(attr) = self.attr_of_loc(&loc) {
            let iatt = attr.iatt();
            if iatt.ia_nlink <= 1 {
                let lv = loc.target_gfid().to_string();
                match self.lvm.delete_lv(&lv) {
                    Ok(()) => debug!("{}: removed lv {lv}", self.name),
                    Err(lvm::LvmError::NotFound) => {}
                    Err(e) => {
                        error!("{}: lv remove failed: {e}", self.name);
                        return frame.unwind_error(e.errno());
                    }
                }
            }
        }
        forward(self, frame, FopRequest::Unlink { loc, flags, xdata });
    }

    fn link(
        &self,
        frame: CallFrame,
        oldloc: Loc,
        newloc: Loc,
        xdata: Option<Dict>,
    ) {
        let attr = self.attr_of_loc(&oldloc);
        wind(
            frame,
            &self.child,
            FopRequest::Link {
                oldloc,
                newloc,
                xdata,
            },
            move |frame, mut reply| {
                if reply.is_ok() {
                    if let (Some(attr), FopReply::Link { buf, .. }) =
                        (&attr, &mut reply.data)
                    {
                        attr.refresh_links(buf);
                        let bd = attr.iatt();
                        buf.ia_size = bd.ia_size;
                        buf.ia_blocks = bd.ia_blocks;
                    }
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
        let attr = self.attr_of_loc(&loc);
        wind(
            frame,
            &self.child,
            FopRequest::Setattr {
                loc,
                stbuf,
                valid,
                xdata,
            },
            move |frame, mut reply| {
                if reply.is_ok() {
                    if let (
                        Some(attr),
                        FopReply::Setattr { statpost, .. },
                    ) = (&attr, &mut reply.data)
                    {
                        // posix owns everything but size
                        attr.apply_posix(statpost, valid);
                        let bd = attr.iatt();
                        statpost.ia_size = bd.ia_size;
                        statpost.ia_blocks = bd.ia_blocks;
                    }
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
        let attr = self.attr_of_inode(fd.inode());
        wind(
            frame,
            &self.child,
            FopRequest::Fsetattr {
                fd,
                stbuf,
                valid,
                xdata,
            },
            move |frame, mut reply| {
                if reply.is_ok() {
                    if let (
                        Some(attr),
                        FopReply::Fsetattr { statpost, .. },
                    ) = (&attr, &mut reply.data)
                    {
                        attr.apply_posix(statpost, valid);
                        let bd = attr.iatt();
                        statpost.ia_size = bd.ia_size;
                        statpost.ia_blocks = bd.ia_blocks;
                    }
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
        let bd_value = dict
            .get(BD_XATTR)
            .and_then(|v| v.as_str().map(String::from));
        if let Some(raw) = bd_value {
            let Some((ty, size)) = parse_bd_value(&raw) else {
                return frame.unwind_error(Errno::EINVAL);
            };
            return self.create_lv_flow(frame, loc, ty, size);
        }
        for (key, op) in [
            (BD_XATTR_CLONE, Offload::Clone),
            (BD_XATTR_SNAPSHOT, Offload::Snapshot),
            (BD_XATTR_MERGE, Offload::Merge),
        ] {
            if let Some(raw) =
                dict.get(key).and_then(|v| v.as_str().map(String::from))
            {
                return self.offload_flow(frame, loc, op, &raw);
            }
        }
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

    fn fsetxattr(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        dict: Dict,
        flags: i32,
        xdata: Option<Dict>,
    ) {
        let bd_value = dict
            .get(BD_XATTR)
            .and_then(|v| v.as_str().map(String::from));
        if let Some(raw) = bd_value {
            let Some((ty, size)) = parse_bd_value(&raw) else {
                return frame.unwind_error(Errno::EINVAL);
            };
            let loc = Loc {
                gfid: fd.inode().gfid(),
                inode: Some(fd.inode().clone()),
                ..Default::default()
            };
            return self.create_lv_flow(frame, loc, ty, size);
        }
        if [BD_XATTR_CLONE, BD_XATTR_SNAPSHOT, BD_XATTR_MERGE]
            .iter()
            .any(|k| dict.contains(k))
        {
            // offloads are path-addressed operations
            return frame.unwind_error(Errno::EINVAL);
        }
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

    fn getxattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        name: Option<String>,
        xdata: Option<Dict>,
    ) {
        if let Some(key) = &name {
            let attr = self.attr_of_loc(&loc);
            if let Some(reply) = self.synthetic_getxattr(
                &frame,
                attr,
                loc.target_gfid(),
                key,
            ) {
                return frame.unwind(reply);
            }
        }
        forward(self, frame, FopRequest::Getxattr { loc, name, xdata });
    }

    fn fgetxattr(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        name: Option<String>,
        xdata: Option<Dict>,
    ) {
        if let Some(key) = &name {
            let attr = self.attr_of_inode(fd.inode());
            let gfid = fd.inode().gfid();
            if let Some(mut reply) =
                self.synthetic_getxattr(&frame, attr, gfid, key)
            {
                // same payload, fd-flavored reply kind
                if let FopReply::Getxattr { dict, xdata } = reply.data {
                    reply.data = FopReply::Fgetxattr { dict, xdata };
                }
                return frame.unwind(reply);
            }
        }
        forward(self, frame, FopRequest::Fgetxattr { fd, name, xdata });
    }

    fn removexattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        name: String,
        xdata: Option<Dict>,
    ) {
        if name == BD_XATTR && self.attr_of_loc(&loc).is_some() {
            // a bound LV cannot be unbound in place
            return frame.unwind_error(Errno::EPERM);
        }
        forward(self, frame, FopRequest::Removexattr { loc, name, xdata });
    }

    fn fremovexattr(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        name: String,
        xdata: Option<Dict>,
    ) {
        if name == BD_XATTR && self.attr_of_inode(fd.inode()).is_some() {
            return frame.unwind_error(Errno::EPERM);
        }
        forward(self, frame, FopRequest::Fremovexattr { fd, name, xdata });
    }

    fn discard(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        len: u64,
        xdata: Option<Dict>,
    ) {
        let Some(bdfd) = fd.ctx_get::<BdFd>(BD_CTX) else {
            return forward(
                self,
                frame,
                FopRequest::Discard {
                    fd,
                    offset,
                    len,
                    xdata,
                },
            );
        };
        let Some(attr) = self.attr_of_inode(fd.inode()) else {
            return frame.unwind_error(Errno::EINVAL);
        };
        let pre = attr.iatt();
        match blk_discard(&bdfd.file, offset, len) {
            Ok(()) => {
                attr.touch_mtime();
                frame.unwind(Reply::ok(FopReply::Discard {
                    pre,
                    post: attr.iatt(),
                    xdata: None,
                }));
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOTTY) => {
                // no discard on this device class
                frame.unwind_error(Errno::ENOSYS)
            }
            Err(e) => frame.unwind_error(e.into()),
        }
    }

    fn zerofill(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        len: u64,
        xdata: Option<Dict>,
    ) {
        let Some(bdfd) = fd.ctx_get::<BdFd>(BD_CTX) else {
            return forward(
                self,
                frame,
                FopRequest::Zerofill {
                    fd,
                    offset,
                    len,
                    xdata,
                },
            );
        };
        let Some(attr) = self.attr_of_inode(fd.inode()) else {
            return frame.unwind_error(Errno::EINVAL);
        };
        let pre = attr.iatt();
        if let Err(e) = zero_range(&bdfd.file, offset, len) {
            error!("{}: zerofill failed: {e}", self.name);
            return frame.unwind_error(e.into());
        }
        attr.touch_mtime();
        frame.unwind(Reply::ok(FopReply::Zerofill {
            pre,
            post: attr.iatt(),
            xdata: None,
        }));
    }

    fn rchecksum(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        len: u32,
        xdata: Option<Dict>,
    ) {
        let Some(bdfd) = fd.ctx_get::<BdFd>(BD_CTX) else {
            return forward(
                self,
                frame,
                FopRequest::Rchecksum {
                    fd,
                    offset,
                    len,
                    xdata,
                },
            );
        };
        // page-aligned read of an aligned span: the fd may be in
        // O_DIRECT mode; checksum only the requested range
        let span = round_to_extent(len as u64, ALIGN_SIZE) as usize;
        let mut buf = AlignedBuf::new(span);
        let n = match nix::sys::uio::pread(
            &bdfd.file,
            buf.as_mut_slice(),
            offset as libc::off_t,
        ) {
            Ok(n) => n.min(len as usize),
            Err(e) => return frame.unwind_error(e.into()),
        };
        let data = &buf.as_slice()[..n];
        frame.unwind(Reply::ok(FopReply::Rchecksum {
            weak: checksum::weak_checksum(data),
            strong: checksum::strong_checksum(data),
            xdata: None,
        }));
    }
}

/// Adapter: run the truncate-shaped grow path but answer with the
/// ftruncate reply variant.
fn ftruncate_adapter(outer: CallFrame) -> CallFrame {
    let kind = outer.kind();
    let root = outer.root().clone();
    CallFrame::new(root, crate::fop::FopKind::Truncate, move |reply| {
        let data = match reply.data {
            FopReply::Truncate {
                prebuf,
                postbuf,
                xdata,
            } => FopReply::Ftruncate {
                prebuf,
                postbuf,
                xdata,
            },
            _ => FopReply::empty(kind),
        };
        outer.unwind(Reply {
            op_ret: reply.op_ret,
            op_errno: reply.op_errno,
            data,
        });
    })
}

fn blk_discard(file: &File, offset: u64, len: u64) -> io::Result<()> {
    // BLKDISCARD = _IO(0x12, 119)
    const BLKDISCARD: libc::c_ulong = 0x1277;
    let range = [offset, len];
    let rc = unsafe {
        libc::ioctl(file.as_raw_fd(), BLKDISCARD, range.as_ptr())
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn blk_zeroout(file: &File, offset: u64, len: u64) -> io::Result<()> {
    // BLKZEROOUT = _IO(0x12, 127)
    const BLKZEROOUT: libc::c_ulong = 0x127f;
    let range = [offset, len];
    let rc = unsafe {
        libc::ioctl(file.as_raw_fd(), BLKZEROOUT, range.as_ptr())
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Largest span one BLKZEROOUT may cover, from the device's
/// write_same_max_bytes queue limit.
fn write_same_limit(file: &File) -> Option<u64> {
    let st = nix::sys::stat::fstat(file).ok()?;
    let rdev = st.st_rdev;
    let major = libc::major(rdev);
    let minor = libc::minor(rdev);
    if major == 0 {
        return None;
    }
    let path = format!(
        "/sys/dev/block/{major}:{minor}/queue/write_same_max_bytes"
    );
    let raw = std::fs::read_to_string(path).ok()?;
    let limit: u64 = raw.trim().parse().ok()?;
    (limit > 0).then_some(limit)
}

/// Zero a device range: BLKZEROOUT in write_same-bounded chunks when the
/// device offers it, aligned zero-buffer writes otherwise.
fn zero_range(file: &File, offset: u64, len: u64) -> io::Result<()> {
    if let Some(limit) = write_same_limit(file) {
        let mut at = offset;
        let mut remaining = len;
        let mut ioctl_ok = true;
        while remaining > 0 {
            let chunk = remaining.min(limit);
            match blk_zeroout(file, at, chunk) {
                Ok(()) => {
                    at += chunk;
                    remaining -= chunk;
                }
                Err(e)
                    if e.raw_os_error() == Some(libc::ENOTTY)
                        || e.raw_os_error() == Some(libc::EINVAL) =>
                {
                    ioctl_ok = false;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if ioctl_ok {
            return Ok(());
        }
    }
    zero_range_writev(file, offset, len)
}

/// The vector-write fallback: one zero segment fanned into up to
/// MAX_NO_VECT iovecs per pwritev.
fn zero_range_writev(file: &File, offset: u64, len: u64) -> io::Result<()> {
    // aligned zero segment: the fd may be in O_DIRECT mode
    let zeros = AlignedBuf::new(IOV_SIZE);
    let mut at = offset;
    let mut remaining = len;
    while remaining > 0 {
        let mut slices: Vec<std::io::IoSlice<'_>> = Vec::new();
        let mut batch = 0u64;
        while batch < remaining && slices.len() < MAX_NO_VECT {
            let seg = (remaining - batch).min(IOV_SIZE as u64) as usize;
            slices.push(std::io::IoSlice::new(&zeros.as_slice()[..seg]));
            batch += seg as u64;
        }
        let n = nix::sys::uio::pwritev(file, &slices, at as libc::off_t)
            .map_err(io::Error::from)?;
        if n == 0 {
            return Err(io::Error::other("zero-length write"));
        }
        at += n as u64;
        remaining -= (n as u64).min(remaining);
    }
    Ok(())
}

/// A 4 KiB-aligned heap buffer, required for O_DIRECT transfers: the
/// kernel rejects direct I/O through unaligned memory with `EINVAL`, so
/// every buffer a bd fd may read or write in direct mode comes from
/// here.
pub(super) struct AlignedBuf {
    ptr: std::ptr::NonNull<u8>,
    layout: std::alloc::Layout,
}

impl AlignedBuf {
    /// An aligned, zeroed allocation of `size` bytes (`size > 0`).
    pub(super) fn new(size: usize) -> AlignedBuf {
        let layout =
            std::alloc::Layout::from_size_align(size, ALIGN_SIZE as usize)
                .expect("valid layout");
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = std::ptr::NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };
        AlignedBuf { ptr, layout }
    }

    /// An aligned copy of `data`.
    pub(super) fn from_slice(data: &[u8]) -> AlignedBuf {
        let mut buf = AlignedBuf::new(data.len());
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        buf
    }

    pub(super) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.layout.size(),
            )
        }
    }

    pub(super) fn as_slice(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size())
        }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

unsafe impl Send for AlignedBuf {}

fn open_rw_direct(path: &std::path::Path, write: bool) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(!write).write(write);
    match opts.custom_flags(libc::O_DIRECT).open(path) {
        Ok(f) => Ok(f),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            // filesystem refuses O_DIRECT; degrade to buffered
            debug!("O_DIRECT refused for {}, buffered copy", path.display());
            opts.custom_flags(0).open(path)
        }
        Err(e) => Err(e),
    }
}

/// Offload copy loop: IOV_NR segments of IOV_SIZE per round trip.
fn copy_device(
    src: &std::path::Path,
    dst: &std::path::Path,
    size: u64,
) -> io::Result<()> {
    let src_file = open_rw_direct(src, false)?;
    let dst_file = open_rw_direct(dst, true)?;
    let mut buf = AlignedBuf::new(IOV_NR * IOV_SIZE);
    let mut copied = 0u64;
    while copied < size {
        let want =
            ((size - copied).min((IOV_NR * IOV_SIZE) as u64)) as usize;
        // device transfers stay block-aligned; the LV size is a
        // multiple of the extent so the tail never exceeds it
        let aligned =
            round_to_extent(want as u64, ALIGN_SIZE) as usize;
        let slice = &mut buf.as_mut_slice()[..aligned];
        let n = nix::sys::uio::pread(
            &src_file,
            slice,
            copied as libc::off_t,
        )
        .map_err(io::Error::from)?;
        if n == 0 {
            break;
        }
        let out = &buf.as_slice()[..n];
        let written = nix::sys::uio::pwrite(
            &dst_file,
            out,
            copied as libc::off_t,
        )
        .map_err(io::Error::from)?;
        if written != n {
            return Err(io::Error::other("short write during clone"));
        }
        copied += n as u64;
    }
    Ok(())
}

impl std::fmt::Debug for Bd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bd")
            .field("name", &self.name)
            .field("caps", &self.caps)
            .finish()
    }
}

#[cfg(test)]
mod tests;
