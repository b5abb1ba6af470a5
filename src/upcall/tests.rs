use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;

use super::*;
use crate::fop::Reply;
use crate::frame::CallRoot;
use crate::gfid::Gfid;
use crate::iatt::IaType;
use crate::inode::InodeTable;
use crate::iobuf::IoBuf;
use crate::iobuf::IoVec;
use crate::xlator::sync_call;

/// Leaf that acknowledges the FOPs the upcall layer wraps.
struct AckBackend {
    itable: Arc<InodeTable>,
    gfid: Gfid,
}

impl AckBackend {
    fn new() -> Arc<AckBackend> {
        Arc::new(AckBackend {
            itable: InodeTable::new(),
            gfid: Gfid::generate(),
        })
    }

    fn iatt(&self) -> Iatt {
        Iatt {
            ia_gfid: self.gfid,
            ia_type: IaType::Regular,
            ia_size: 42,
            ..Default::default()
        }
    }
}

impl Xlator for AckBackend {
    fn name(&self) -> &str {
        "ack-backend"
    }

    fn children(&self) -> Vec<XlatorRef> {
        Vec::new()
    }

    fn lookup(&self, frame: CallFrame, _loc: Loc, _xdata: Option<Dict>) {
        let inode = self.itable.resolve(self.gfid, IaType::Regular);
        frame.unwind(Reply::ok(FopReply::Lookup {
            inode: Some(inode),
            buf: self.iatt(),
            xdata: None,
            postparent: Iatt::default(),
        }));
    }

    fn writev(
        &self,
        frame: CallFrame,
        _fd: Arc<Fd>,
        _vector: IoVecList,
        _offset: u64,
        _flags: u32,
        _iobref: Iobref,
        _xdata: Option<Dict>,
    ) {
        frame.unwind(Reply::ok_ret(
            4,
            FopReply::Writev {
                prebuf: Iatt::default(),
                postbuf: self.iatt(),
                xdata: None,
            },
        ));
    }

    fn setxattr(
        &self,
        frame: CallFrame,
        _loc: Loc,
        _dict: Dict,
        _flags: i32,
        _xdata: Option<Dict>,
    ) {
        frame.unwind(Reply::ok(FopReply::Setxattr { xdata: None }));
    }

    fn unlink(
        &self,
        frame: CallFrame,
        _loc: Loc,
        _flags: i32,
        _xdata: Option<Dict>,
    ) {
        frame.unwind(Reply::ok(FopReply::Unlink {
            preparent: Iatt::default(),
            postparent: Iatt::default(),
            xdata: None,
        }));
    }
}

/// Collects every delivered event.
struct ChannelSink {
    tx: Mutex<mpsc::Sender<UpcallEvent>>,
}

impl UpcallSink for ChannelSink {
    fn notify(&self, event: UpcallEvent) {
        let _ = self.tx.lock().send(event);
    }
}

struct Fixture {
    backend: Arc<AckBackend>,
    upcall: Arc<Upcall>,
    top: XlatorRef,
    events: mpsc::Receiver<UpcallEvent>,
}

fn fixture(timeout: u32) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = AckBackend::new();
    let (tx, events) = mpsc::channel();
    let upcall = Upcall::new(
        "upcall-test",
        backend.clone(),
        UpcallOptions {
            cache_invalidation: true,
            cache_invalidation_timeout: timeout,
        },
        Arc::new(ChannelSink { tx: Mutex::new(tx) }),
    );
    let top: XlatorRef = upcall.clone();
    Fixture {
        backend,
        upcall,
        top,
        events,
    }
}

fn lookup_as(fx: &Fixture, client: &str) {
    let reply = sync_call(
        &fx.top,
        CallRoot::with_client(Some(client.to_string())),
        FopRequest::Lookup {
            loc: Loc::from_path("f"),
            xdata: None,
        },
    );
    assert!(reply.is_ok());
}

fn write_as(fx: &Fixture, client: &str) {
    let inode = fx.backend.itable.resolve(fx.backend.gfid, IaType::Regular);
    let fd = Fd::new(inode, libc::O_WRONLY);
    let buf = IoBuf::from_vec(b"data".to_vec());
    let mut iobref = Iobref::new();
    iobref.add(&buf);
    let mut vector = IoVecList::new();
    vector.push(IoVec::whole(buf));
    let reply = sync_call(
        &fx.top,
        CallRoot::with_client(Some(client.to_string())),
        FopRequest::Writev {
            fd,
            vector,
            offset: 0,
            flags: 0,
            iobref,
            xdata: None,
        },
    );
    assert!(reply.is_ok());
}

#[test]
fn write_notifies_other_clients_not_the_writer() {
    let fx = fixture(60);
    lookup_as(&fx, "client-a");
    lookup_as(&fx, "client-b");

    write_as(&fx, "client-a");

    let event = fx.events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(event.client_uid, "client-b");
    assert_eq!(event.gfid, fx.backend.gfid);
    assert_eq!(event.event, UpcallEventKind::CacheInvalidation);
    assert!(event.flags.contains(UpcallFlags::WRITE));
    assert_eq!(event.stat.map(|s| s.ia_size), Some(42));
    // nobody else to tell
    assert!(fx.events.try_recv().is_err());
}

#[test]
fn single_client_generates_no_events() {
    let fx = fixture(60);
    lookup_as(&fx, "client-a");
    write_as(&fx, "client-a");
    assert!(fx.events.try_recv().is_err());
}

#[test]
fn anonymous_frames_are_ignored() {
    let fx = fixture(60);
    lookup_as(&fx, "client-b");
    let inode = fx.backend.itable.resolve(fx.backend.gfid, IaType::Regular);
    let fd = Fd::new(inode, libc::O_WRONLY);
    let buf = IoBuf::from_vec(b"data".to_vec());
    let mut iobref = Iobref::new();
    iobref.add(&buf);
    let mut vector = IoVecList::new();
    vector.push(IoVec::whole(buf));
    // no client identity on the root
    let reply = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Writev {
            fd,
            vector,
            offset: 0,
            flags: 0,
            iobref,
            xdata: None,
        },
    );
    assert!(reply.is_ok());
    assert!(fx.events.try_recv().is_err());
}

#[test]
fn xattr_events_filter_to_registered_keys() {
    let fx = fixture(60);
    fx.upcall.register_xattrs(&["user.interesting"]);
    lookup_as(&fx, "client-a");
    lookup_as(&fx, "client-b");

    let dict = Dict::from_iter([
        ("user.interesting", DictValue::Str("v".into())),
        ("user.ignored", DictValue::Str("w".into())),
    ]);
    let reply = sync_call(
        &fx.top,
        CallRoot::with_client(Some("client-a".to_string())),
        FopRequest::Setxattr {
            loc: Loc {
                gfid: fx.backend.gfid,
                ..Loc::from_path("f")
            },
            dict,
            flags: 0,
            xdata: None,
        },
    );
    assert!(reply.is_ok());

    let event = fx.events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(event.flags.contains(UpcallFlags::XATTR));
    let dict = event.dict.expect("xattr event carries the keys");
    assert!(dict.contains("user.interesting"));
    assert!(!dict.contains("user.ignored"));
}

#[test]
fn healed_afr_counters_suppress_the_event() {
    let fx = fixture(60);
    fx.upcall.register_xattrs(&["trusted.afr.vol-client-0"]);
    lookup_as(&fx, "client-a");
    lookup_as(&fx, "client-b");

    // twelve zero bytes: "everything healed", not worth a push
    let dict = Dict::from_iter([(
        "trusted.afr.vol-client-0",
        DictValue::Bin(Arc::from(vec![0u8; 12].as_slice())),
    )]);
    let reply = sync_call(
        &fx.top,
        CallRoot::with_client(Some("client-a".to_string())),
        FopRequest::Setxattr {
            loc: Loc {
                gfid: fx.backend.gfid,
                ..Loc::from_path("f")
            },
            dict,
            flags: 0,
            xdata: None,
        },
    );
    assert!(reply.is_ok());
    assert!(fx.events.try_recv().is_err());
}

#[test]
fn unlink_pushes_nlink_and_parent_dentry() {
    let fx = fixture(60);
    lookup_as(&fx, "client-a");
    lookup_as(&fx, "client-b");

    let reply = sync_call(
        &fx.top,
        CallRoot::with_client(Some("client-b".to_string())),
        FopRequest::Unlink {
            loc: Loc {
                gfid: fx.backend.gfid,
                ..Loc::from_path("f")
            },
            flags: 0,
            xdata: None,
        },
    );
    assert!(reply.is_ok());

    let event = fx.events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(event.client_uid, "client-a");
    assert!(event.flags.contains(UpcallFlags::NLINK));
    assert!(event.flags.contains(UpcallFlags::PARENT_DENTRY));
}

#[test]
fn idle_clients_age_out_of_the_broadcast() {
    // 1 s window: the reaper runs every second and clients expire fast
    let fx = fixture(1);
    lookup_as(&fx, "client-a");
    lookup_as(&fx, "client-b");

    std::thread::sleep(Duration::from_millis(2_500));

    // client-b has been idle past 2 x timeout
    write_as(&fx, "client-a");
    assert!(fx.events.try_recv().is_err());
    fx.upcall.shutdown();
}

#[test]
fn disabled_layer_stays_silent() {
    let backend = AckBackend::new();
    let (tx, events) = mpsc::channel();
    let upcall = Upcall::new(
        "upcall-off",
        backend.clone(),
        UpcallOptions::default(),
        Arc::new(ChannelSink { tx: Mutex::new(tx) }),
    );
    let top: XlatorRef = upcall.clone();
    let fx = Fixture {
        backend,
        upcall,
        top,
        events,
    };
    lookup_as(&fx, "client-a");
    lookup_as(&fx, "client-b");
    write_as(&fx, "client-a");
    assert!(fx.events.try_recv().is_err());
}

#[test]
fn option_parsing() {
    let map: std::collections::HashMap<String, String> = [
        ("upcall.cache-invalidation", "on"),
        ("upcall.cache-invalidation-timeout", "15"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let opts = UpcallOptions::from_map(&map).unwrap();
    assert!(opts.cache_invalidation);
    assert_eq!(opts.cache_invalidation_timeout, 15);
}
