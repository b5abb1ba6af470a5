use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::lvm::Lvm;
use super::lvm::fake::FakeLvm;
use super::*;
use crate::fop::FopKind;
use crate::frame::CallRoot;
use crate::iobuf::iov_concat;
use crate::xlator::sync_call;

const EXTENT: u64 = 4 * 1024 * 1024;

/// In-memory stand-in for the posix child: placeholder files addressed
/// by path or gfid, xattrs held in a map, everything synchronous.
struct MemPosix {
    itable: Arc<InodeTable>,
    files: Mutex<HashMap<String, MemFile>>,
}

#[derive(Clone)]
struct MemFile {
    gfid: Gfid,
    iatt: Iatt,
    xattrs: HashMap<String, String>,
}

impl MemPosix {
    fn new(itable: Arc<InodeTable>) -> Arc<MemPosix> {
        Arc::new(MemPosix {
            itable,
            files: Mutex::new(HashMap::new()),
        })
    }

    fn add_file(&self, path: &str) -> Gfid {
        let gfid = Gfid::generate();
        let iatt = Iatt {
            ia_gfid: gfid,
            ia_type: IaType::Regular,
            ia_nlink: 1,
            ia_prot: 0o644,
            ..Default::default()
        };
        self.files.lock().insert(
            path.to_string(),
            MemFile {
                gfid,
                iatt,
                xattrs: HashMap::new(),
            },
        );
        gfid
    }

    fn xattr(&self, path: &str, key: &str) -> Option<String> {
        self.files
            .lock()
            .get(path)
            .and_then(|f| f.xattrs.get(key).cloned())
    }

    fn has_file(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    fn resolve(&self, loc: &Loc) -> Option<String> {
        let files = self.files.lock();
        if let Some(path) = loc.path.as_ref().and_then(|p| p.to_str()) {
            if files.contains_key(path) {
                return Some(path.to_string());
            }
            return None;
        }
        let gfid = loc.target_gfid();
        files
            .iter()
            .find(|(_, f)| f.gfid == gfid)
            .map(|(p, _)| p.clone())
    }
}

impl Xlator for MemPosix {
    fn name(&self) -> &str {
        "mem-posix"
    }

    fn children(&self) -> Vec<XlatorRef> {
        Vec::new()
    }

    fn lookup(&self, frame: CallFrame, loc: Loc, xdata: Option<Dict>) {
        let Some(path) = self.resolve(&loc) else {
            return frame.unwind_error(Errno::ENOENT);
        };
        let file = self.files.lock().get(&path).cloned();
        let Some(file) = file else {
            return frame.unwind_error(Errno::ENOENT);
        };
        let inode = self.itable.resolve(file.gfid, file.iatt.ia_type);
        let reply_xdata = xdata.map(|req| {
            let out = Dict::new();
            for key in req.keys() {
                if let Some(v) = file.xattrs.get(&key) {
                    out.set(key, DictValue::Str(v.clone()));
                }
            }
            out
        });
        frame.unwind(Reply::ok(FopReply::Lookup {
            inode: Some(inode),
            buf: file.iatt,
            xdata: reply_xdata,
            postparent: Iatt::default(),
        }));
    }

    fn stat(&self, frame: CallFrame, loc: Loc, _xdata: Option<Dict>) {
        let Some(path) = self.resolve(&loc) else {
            return frame.unwind_error(Errno::ENOENT);
        };
        let buf = self.files.lock().get(&path).map(|f| f.iatt);
        match buf {
            Some(buf) => {
                frame.unwind(Reply::ok(FopReply::Stat { buf, xdata: None }))
            }
            None => frame.unwind_error(Errno::ENOENT),
        }
    }

    fn open(
        &self,
        frame: CallFrame,
        loc: Loc,
        _flags: i32,
        fd: Arc<Fd>,
        _xdata: Option<Dict>,
    ) {
        if self.resolve(&loc).is_none() {
            return frame.unwind_error(Errno::ENOENT);
        }
        frame.unwind(Reply::ok(FopReply::Open {
            fd: Some(fd),
            xdata: None,
        }));
    }

    fn flush(&self, frame: CallFrame, _fd: Arc<Fd>, _xdata: Option<Dict>) {
        frame.unwind(Reply::ok(FopReply::Flush { xdata: None }));
    }

    fn setxattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        dict: Dict,
        _flags: i32,
        _xdata: Option<Dict>,
    ) {
        let Some(path) = self.resolve(&loc) else {
            return frame.unwind_error(Errno::ENOENT);
        };
        let mut files = self.files.lock();
        let Some(file) = files.get_mut(&path) else {
            return frame.unwind_error(Errno::ENOENT);
        };
        for (key, value) in dict.pairs() {
            let Some(text) = value.as_str() else {
                return frame.unwind_error(Errno::EINVAL);
            };
            file.xattrs.insert(key, text.to_string());
        }
        frame.unwind(Reply::ok(FopReply::Setxattr { xdata: None }));
    }

    fn removexattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        name: String,
        _xdata: Option<Dict>,
    ) {
        let Some(path) = self.resolve(&loc) else {
            return frame.unwind_error(Errno::ENOENT);
        };
        self.files
            .lock()
            .get_mut(&path)
            .map(|f| f.xattrs.remove(&name));
        frame.unwind(Reply::ok(FopReply::Removexattr { xdata: None }));
    }

    fn setattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        stbuf: Iatt,
        valid: IattValid,
        _xdata: Option<Dict>,
    ) {
        let Some(path) = self.resolve(&loc) else {
            return frame.unwind_error(Errno::ENOENT);
        };
        let mut files = self.files.lock();
        let Some(file) = files.get_mut(&path) else {
            return frame.unwind_error(Errno::ENOENT);
        };
        let statpre = file.iatt;
        file.iatt.apply_valid(&stbuf, valid);
        frame.unwind(Reply::ok(FopReply::Setattr {
            statpre,
            statpost: file.iatt,
            xdata: None,
        }));
    }

    fn unlink(
        &self,
        frame: CallFrame,
        loc: Loc,
        _flags: i32,
        _xdata: Option<Dict>,
    ) {
        let Some(path) = self.resolve(&loc) else {
            return frame.unwind_error(Errno::ENOENT);
        };
        let removed = self.files.lock().remove(&path);
        if let Some(file) = removed {
            self.itable.forget(file.gfid);
        }
        frame.unwind(Reply::ok(FopReply::Unlink {
            preparent: Iatt::default(),
            postparent: Iatt::default(),
            xdata: None,
        }));
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    itable: Arc<InodeTable>,
    posix: Arc<MemPosix>,
    lvm: Arc<FakeLvm>,
    bd: Arc<Bd>,
    top: XlatorRef,
}

fn volume_id() -> Gfid {
    "12345678-1234-4321-8765-123456789abc".parse().unwrap()
}

fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let itable = InodeTable::new();
    let posix = MemPosix::new(itable.clone());
    let lvm = Arc::new(
        FakeLvm::new(dir.path().to_path_buf(), EXTENT).with_tags(vec![
            format!("{VOLUME_ID_TAG}{}", volume_id()),
        ]),
    );
    let bd = Bd::new(
        "bd-test",
        posix.clone(),
        itable.clone(),
        lvm.clone(),
        &BdOptions {
            export: "vg".into(),
            device: "vg".into(),
            volume_id: volume_id(),
            aio: false,
        },
    )
    .unwrap();
    let top: XlatorRef = bd.clone();
    Fixture {
        _dir: dir,
        itable,
        posix,
        lvm,
        bd,
        top,
    }
}

fn loc_for(fx: &Fixture, path: &str, gfid: Gfid) -> Loc {
    Loc {
        path: Some(path.into()),
        gfid,
        inode: fx.itable.find(gfid),
        ..Default::default()
    }
}

/// Lookup through bd, returning the reported iatt.
fn bd_lookup(fx: &Fixture, path: &str) -> Reply {
    sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Lookup {
            loc: Loc::from_path(path),
            xdata: None,
        },
    )
}

fn bind_lv(fx: &Fixture, path: &str, gfid: Gfid, spec: &str) -> Reply {
    // resolve the placeholder's inode first, as a client would
    assert!(bd_lookup(fx, path).is_ok());
    let dict = Dict::from_iter([(BD_XATTR, DictValue::Str(spec.into()))]);
    sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Setxattr {
            loc: loc_for(fx, path, gfid),
            dict,
            flags: 0,
            xdata: None,
        },
    )
}

fn open_fd(fx: &Fixture, path: &str, gfid: Gfid, flags: i32) -> Arc<Fd> {
    let inode = fx.itable.find(gfid).expect("inode bound");
    let fd = Fd::new(inode, flags);
    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Open {
            loc: loc_for(fx, path, gfid),
            flags,
            fd: fd.clone(),
            xdata: None,
        },
    );
    assert!(reply.is_ok(), "open failed: {}", reply.op_errno);
    fd
}

#[test]
fn vg_binding_is_validated_at_init() {
    let dir = tempfile::tempdir().unwrap();
    let itable = InodeTable::new();
    let posix = MemPosix::new(itable.clone());
    let opts = BdOptions {
        export: "vg".into(),
        device: "vg".into(),
        volume_id: volume_id(),
        aio: false,
    };

    // no tag at all
    let untagged =
        Arc::new(FakeLvm::new(dir.path().to_path_buf(), EXTENT));
    assert!(
        Bd::new("bd", posix.clone(), itable.clone(), untagged, &opts)
            .is_err()
    );

    // tag for some other deployment
    let foreign = Arc::new(
        FakeLvm::new(dir.path().to_path_buf(), EXTENT).with_tags(vec![
            format!("{VOLUME_ID_TAG}{}", Gfid::generate()),
        ]),
    );
    assert!(Bd::new("bd", posix, itable, foreign, &opts).is_err());
}

#[test]
fn setxattr_binds_an_lv_and_stat_reports_it() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");

    let reply = bind_lv(&fx, "fileA", gfid, "lv:1048576");
    assert!(reply.is_ok(), "bind failed: {}", reply.op_errno);

    // one 4 MiB extent satisfies the 1 MiB ask
    let lv = gfid.to_string();
    assert!(fx.lvm.lv_exists(&lv));
    assert_eq!(fx.lvm.lv_size(&lv).unwrap(), EXTENT);
    // the repaired marker reflects the rounded size
    assert_eq!(
        fx.posix.xattr("fileA", BD_XATTR).as_deref(),
        Some("lv:4194304")
    );

    let stat = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Stat {
            loc: loc_for(&fx, "fileA", gfid),
            xdata: None,
        },
    );
    let FopReply::Stat { buf, .. } = stat.data else {
        panic!("wrong reply")
    };
    assert_eq!(buf.ia_size, 4194304);
}

#[test]
fn double_bind_is_rejected() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bind_lv(&fx, "fileA", gfid, "lv:4096").is_ok());
    let again = bind_lv(&fx, "fileA", gfid, "lv:4096");
    assert_eq!(again.op_errno, Errno::EEXIST);
}

#[test]
fn thin_without_pool_is_rejected() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    let reply = bind_lv(&fx, "fileA", gfid, "thin:4096");
    assert_eq!(reply.op_errno, Errno::EOPNOTSUPP);
    assert!(!fx.bd.caps().contains(BdCaps::THIN));
}

#[test]
fn readv_at_tail_reports_eof_in_errno() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bind_lv(&fx, "fileA", gfid, "lv:1048576").is_ok());
    let fd = open_fd(&fx, "fileA", gfid, libc::O_RDWR);

    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Readv {
            fd,
            size: 8192,
            offset: 4_190_000,
            flags: 0,
            xdata: None,
        },
    );
    assert_eq!(reply.op_ret, 4304);
    assert_eq!(reply.op_errno, Errno::ENOENT);

    let FopReply::Readv { stbuf, .. } = reply.data else {
        panic!("wrong reply")
    };
    assert_eq!(stbuf.ia_size, 4_194_304);
}

#[test]
fn write_then_read_round_trips_and_bumps_mtime() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bind_lv(&fx, "fileA", gfid, "lv:4096").is_ok());
    let fd = open_fd(&fx, "fileA", gfid, libc::O_RDWR);

    let attr = fx
        .itable
        .find(gfid)
        .unwrap()
        .ctx_get::<BdAttr>(BD_CTX)
        .unwrap();
    let before = attr.iatt().ia_mtime;

    let buf = IoBuf::from_vec(b"payload".to_vec());
    let mut iobref = Iobref::new();
    iobref.add(&buf);
    let mut vector = IoVecList::new();
    vector.push(IoVec::whole(buf));
    let wrote = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Writev {
            fd: fd.clone(),
            vector,
            offset: 0,
            flags: 0,
            iobref,
            xdata: None,
        },
    );
    assert_eq!(wrote.op_ret, 7);
    assert!(attr.iatt().ia_mtime >= before);

    let read = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Readv {
            fd,
            size: 7,
            offset: 0,
            flags: 0,
            xdata: None,
        },
    );
    assert_eq!(read.op_ret, 7);
    let FopReply::Readv { vector, .. } = read.data else {
        panic!("wrong reply")
    };
    assert_eq!(iov_concat(&vector), b"payload");
}

#[test]
fn truncate_never_shrinks_and_grows_by_extent() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bind_lv(&fx, "fileA", gfid, "lv:4194304").is_ok());

    // shrink request: size stays, mtime advances
    let shrunk = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Truncate {
            loc: loc_for(&fx, "fileA", gfid),
            offset: 1024,
            xdata: None,
        },
    );
    assert!(shrunk.is_ok());
    let FopReply::Truncate { postbuf, .. } = shrunk.data else {
        panic!("wrong reply")
    };
    assert_eq!(postbuf.ia_size, 4_194_304);

    // grow request rounds up to the next extent
    let grown = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Truncate {
            loc: loc_for(&fx, "fileA", gfid),
            offset: 5 * 1024 * 1024,
            xdata: None,
        },
    );
    assert!(grown.is_ok());
    let FopReply::Truncate { postbuf, .. } = grown.data else {
        panic!("wrong reply")
    };
    assert_eq!(postbuf.ia_size, 8_388_608);
    assert_eq!(fx.lvm.lv_size(&gfid.to_string()).unwrap(), 8_388_608);
    assert_eq!(
        fx.posix.xattr("fileA", BD_XATTR).as_deref(),
        Some("lv:8388608")
    );
}

#[test]
fn snapshot_offload_binds_the_destination() {
    let fx = fixture();
    let src = fx.posix.add_file("fileA");
    let dst = fx.posix.add_file("fileB");
    assert!(bind_lv(&fx, "fileA", src, "lv:4194304").is_ok());

    let dict = Dict::from_iter([(
        BD_XATTR_SNAPSHOT,
        DictValue::Str(dst.to_string()),
    )]);
    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Setxattr {
            loc: loc_for(&fx, "fileA", src),
            dict,
            flags: 0,
            xdata: None,
        },
    );
    assert!(reply.is_ok(), "snapshot failed: {}", reply.op_errno);

    let snap_lv = dst.to_string();
    assert!(fx.lvm.lv_exists(&snap_lv));
    assert_eq!(
        fx.lvm.lv_origin(&snap_lv).unwrap().as_deref(),
        Some(src.to_string().as_str())
    );
    assert_eq!(
        fx.posix.xattr("fileB", BD_XATTR).as_deref(),
        Some("lv:4194304")
    );

    // origin introspection through the synthetic xattr
    let origin = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Getxattr {
            loc: loc_for(&fx, "fileB", dst),
            name: Some(BD_XATTR_ORIGIN.to_string()),
            xdata: None,
        },
    );
    let FopReply::Getxattr { dict: Some(d), .. } = origin.data else {
        panic!("wrong reply")
    };
    assert_eq!(
        d.get(BD_XATTR_ORIGIN)
            .and_then(|v| v.as_str().map(String::from)),
        Some(src.to_string())
    );
}

#[test]
fn merge_offload_restores_origin_and_unlinks_placeholder() {
    let fx = fixture();
    let src = fx.posix.add_file("fileA");
    let dst = fx.posix.add_file("fileB");
    assert!(bind_lv(&fx, "fileA", src, "lv:4096").is_ok());

    // seed origin content, snapshot it, then diverge the origin
    std::fs::write(fx.lvm.device_path(&src.to_string()), b"snapshot-state")
        .unwrap();
    fx.lvm.backing_file(&src.to_string(), EXTENT).unwrap();
    let dict = Dict::from_iter([(
        BD_XATTR_SNAPSHOT,
        DictValue::Str(dst.to_string()),
    )]);
    assert!(
        sync_call(
            &fx.top,
            CallRoot::new(),
            FopRequest::Setxattr {
                loc: loc_for(&fx, "fileA", src),
                dict,
                flags: 0,
                xdata: None,
            },
        )
        .is_ok()
    );
    std::fs::write(fx.lvm.device_path(&src.to_string()), b"diverged")
        .unwrap();

    let merge = Dict::from_iter([(
        BD_XATTR_MERGE,
        DictValue::StaticStr(""),
    )]);
    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Setxattr {
            loc: loc_for(&fx, "fileB", dst),
            dict: merge,
            flags: 0,
            xdata: None,
        },
    );
    assert!(reply.is_ok(), "merge failed: {}", reply.op_errno);

    assert!(!fx.lvm.lv_exists(&dst.to_string()));
    assert!(!fx.posix.has_file("fileB"));
    let merged =
        std::fs::read(fx.lvm.device_path(&src.to_string())).unwrap();
    assert_eq!(&merged[..14], b"snapshot-state");
}

#[test]
fn clone_offload_copies_content() {
    let fx = fixture();
    let src = fx.posix.add_file("fileA");
    let dst = fx.posix.add_file("fileC");
    assert!(bind_lv(&fx, "fileA", src, "lv:4096").is_ok());

    let device = fx.lvm.device_path(&src.to_string());
    let mut content = vec![0u8; EXTENT as usize];
    content[..5].copy_from_slice(b"seed!");
    content[EXTENT as usize - 1] = 0xab;
    std::fs::write(&device, &content).unwrap();

    let dict = Dict::from_iter([(
        BD_XATTR_CLONE,
        DictValue::Str(dst.to_string()),
    )]);
    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Setxattr {
            loc: loc_for(&fx, "fileA", src),
            dict,
            flags: 0,
            xdata: None,
        },
    );
    assert!(reply.is_ok(), "clone failed: {}", reply.op_errno);

    let cloned =
        std::fs::read(fx.lvm.device_path(&dst.to_string())).unwrap();
    assert_eq!(cloned.len(), EXTENT as usize);
    assert_eq!(&cloned[..5], b"seed!");
    assert_eq!(cloned[EXTENT as usize - 1], 0xab);
    assert_eq!(
        fx.posix.xattr("fileC", BD_XATTR).as_deref(),
        Some(format!("lv:{EXTENT}").as_str())
    );
}

#[test]
fn offload_to_bound_destination_is_rejected() {
    let fx = fixture();
    let src = fx.posix.add_file("fileA");
    let dst = fx.posix.add_file("fileB");
    assert!(bind_lv(&fx, "fileA", src, "lv:4096").is_ok());
    assert!(bind_lv(&fx, "fileB", dst, "lv:4096").is_ok());

    let dict = Dict::from_iter([(
        BD_XATTR_SNAPSHOT,
        DictValue::Str(dst.to_string()),
    )]);
    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Setxattr {
            loc: loc_for(&fx, "fileA", src),
            dict,
            flags: 0,
            xdata: None,
        },
    );
    assert_eq!(reply.op_errno, Errno::EEXIST);
}

#[test]
fn discard_on_file_backed_lv_reports_enosys() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bind_lv(&fx, "fileA", gfid, "lv:4096").is_ok());
    let fd = open_fd(&fx, "fileA", gfid, libc::O_RDWR);

    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Discard {
            fd,
            offset: 0,
            len: 4096,
            xdata: None,
        },
    );
    assert_eq!(reply.op_errno, Errno::ENOSYS);
}

#[test]
fn zerofill_is_idempotent_and_mtime_monotonic() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bind_lv(&fx, "fileA", gfid, "lv:1048576").is_ok());
    let fd = open_fd(&fx, "fileA", gfid, libc::O_RDWR);

    let device = fx.lvm.device_path(&gfid.to_string());
    let seed = vec![0x5a_u8; EXTENT as usize];
    std::fs::write(&device, &seed).unwrap();

    let zerofill = |fd: &Arc<Fd>| {
        sync_call(
            &fx.top,
            CallRoot::new(),
            FopRequest::Zerofill {
                fd: fd.clone(),
                offset: 1024,
                len: 128 * 1024,
                xdata: None,
            },
        )
    };
    let first = zerofill(&fd);
    assert!(first.is_ok(), "zerofill failed: {}", first.op_errno);
    let after_first = std::fs::read(&device).unwrap();

    let second = zerofill(&fd);
    assert!(second.is_ok());
    let after_second = std::fs::read(&device).unwrap();

    assert_eq!(after_first, after_second);
    assert!(after_first[1024..1024 + 128 * 1024].iter().all(|&b| b == 0));
    // bytes outside the range stay untouched
    assert!(after_first[..1024].iter().all(|&b| b == 0x5a));
    let FopReply::Zerofill { pre, post, .. } = second.data else {
        panic!("wrong reply")
    };
    assert!(post.ia_mtime >= pre.ia_mtime);
}

#[test]
fn caps_and_type_are_synthetic_xattrs() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bd_lookup(&fx, "fileA").is_ok());

    let caps = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Getxattr {
            loc: loc_for(&fx, "fileA", gfid),
            name: Some(VOL_CAPS.to_string()),
            xdata: None,
        },
    );
    let FopReply::Getxattr { dict: Some(d), .. } = caps.data else {
        panic!("wrong reply")
    };
    let bits = d.get(VOL_CAPS).and_then(|v| v.as_int()).unwrap();
    assert_eq!(bits as u64 & BdCaps::BD.bits(), BdCaps::BD.bits());
    assert_eq!(
        bits as u64 & BdCaps::OFFLOAD_ZERO.bits(),
        BdCaps::OFFLOAD_ZERO.bits()
    );

    let ty = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Getxattr {
            loc: loc_for(&fx, "fileA", gfid),
            name: Some(VOL_TYPE.to_string()),
            xdata: None,
        },
    );
    let FopReply::Getxattr { dict: Some(d), .. } = ty.data else {
        panic!("wrong reply")
    };
    assert_eq!(d.get(VOL_TYPE).and_then(|v| v.as_int()), Some(1));
}

#[test]
fn binding_xattr_cannot_be_removed() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bind_lv(&fx, "fileA", gfid, "lv:4096").is_ok());

    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Removexattr {
            loc: loc_for(&fx, "fileA", gfid),
            name: BD_XATTR.to_string(),
            xdata: None,
        },
    );
    assert_eq!(reply.op_errno, Errno::EPERM);
}

#[test]
fn unlink_drops_the_lv() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bind_lv(&fx, "fileA", gfid, "lv:4096").is_ok());
    assert!(fx.lvm.lv_exists(&gfid.to_string()));

    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Unlink {
            loc: loc_for(&fx, "fileA", gfid),
            flags: 0,
            xdata: None,
        },
    );
    assert!(reply.is_ok());
    assert!(!fx.lvm.lv_exists(&gfid.to_string()));
    assert!(!fx.posix.has_file("fileA"));
}

#[test]
fn stale_binding_is_healed_on_lookup() {
    let fx = fixture();
    let _gfid = fx.posix.add_file("fileA");
    // marker present, LV missing: a stale binding
    fx.posix
        .files
        .lock()
        .get_mut("fileA")
        .unwrap()
        .xattrs
        .insert(BD_XATTR.to_string(), "lv:4096".to_string());

    let reply = bd_lookup(&fx, "fileA");
    assert!(reply.is_ok());
    let FopReply::Lookup { buf, .. } = reply.data else {
        panic!("wrong reply")
    };
    // served as a plain posix file
    assert_eq!(buf.ia_size, 0);
    // the repair pass dropped the marker
    assert_eq!(fx.posix.xattr("fileA", BD_XATTR), None);
}

#[test]
fn size_mismatch_is_repaired_on_lookup() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bind_lv(&fx, "fileA", gfid, "lv:4096").is_ok());
    // corrupt the declared size
    fx.posix
        .files
        .lock()
        .get_mut("fileA")
        .unwrap()
        .xattrs
        .insert(BD_XATTR.to_string(), "lv:12".to_string());

    let reply = bd_lookup(&fx, "fileA");
    assert!(reply.is_ok());
    assert_eq!(
        fx.posix.xattr("fileA", BD_XATTR).as_deref(),
        Some(format!("lv:{EXTENT}").as_str())
    );
}

#[test]
fn fgetxattr_keeps_its_own_reply_kind() {
    let fx = fixture();
    let gfid = fx.posix.add_file("fileA");
    assert!(bind_lv(&fx, "fileA", gfid, "lv:4096").is_ok());
    let fd = open_fd(&fx, "fileA", gfid, libc::O_RDONLY);

    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Fgetxattr {
            fd,
            name: Some(VOL_TYPE.to_string()),
            xdata: None,
        },
    );
    assert!(reply.is_ok());
    assert_eq!(reply.data.kind(), Some(FopKind::Fgetxattr));
}
