use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;

use super::*;
use crate::frame::CallRoot;
use crate::gfid::Gfid;
use crate::iatt::IattTime;
use crate::inode::InodeTable;
use crate::iobuf::IoBuf;
use crate::iobuf::IoVec;
use crate::iobuf::iov_concat;
use crate::stub::CallStub;
use crate::xlator::sync_call;

const PAGE: u64 = 4096;

/// Scriptable leaf: one file's bytes, counted reads and fstats, and an
/// optional defer mode that parks read replies as stubs.
struct TestBackend {
    itable: Arc<InodeTable>,
    gfid: Gfid,
    data: Mutex<Vec<u8>>,
    mtime: Mutex<IattTime>,
    reads: AtomicUsize,
    fstats: AtomicUsize,
    defer_reads: AtomicBool,
    parked: Mutex<Vec<CallStub>>,
}

impl TestBackend {
    fn new() -> Arc<TestBackend> {
        Arc::new(TestBackend {
            itable: InodeTable::new(),
            gfid: Gfid::generate(),
            data: Mutex::new(Vec::new()),
            mtime: Mutex::new(IattTime {
                sec: 1_000,
                nsec: 0,
            }),
            reads: AtomicUsize::new(0),
            fstats: AtomicUsize::new(0),
            defer_reads: AtomicBool::new(false),
            parked: Mutex::new(Vec::new()),
        })
    }

    fn set_data(&self, bytes: &[u8]) {
        *self.data.lock() = bytes.to_vec();
    }

    fn overwrite(&self, bytes: &[u8], mtime_sec: i64) {
        *self.data.lock() = bytes.to_vec();
        *self.mtime.lock() = IattTime {
            sec: mtime_sec,
            nsec: 0,
        };
    }

    fn iatt(&self) -> Iatt {
        Iatt {
            ia_gfid: self.gfid,
            ia_type: IaType::Regular,
            ia_size: self.data.lock().len() as u64,
            ia_mtime: *self.mtime.lock(),
            ..Default::default()
        }
    }

    fn read_reply(&self, size: u64, offset: u64) -> Reply {
        let data = self.data.lock();
        let begin = (offset as usize).min(data.len());
        let end = ((offset + size) as usize).min(data.len());
        let chunk = data[begin..end].to_vec();
        drop(data);

        let n = chunk.len();
        let buf = IoBuf::from_vec(chunk);
        let mut iobref = Iobref::new();
        iobref.add(&buf);
        let mut vector = IoVecList::new();
        vector.push(IoVec::whole(buf));
        Reply::ok_ret(
            n as i64,
            FopReply::Readv {
                vector,
                stbuf: self.iatt(),
                iobref,
                xdata: None,
            },
        )
    }

    fn resume_parked(&self) -> usize {
        let parked: Vec<CallStub> =
            self.parked.lock().drain(..).collect();
        let count = parked.len();
        for stub in parked {
            stub.resume();
        }
        count
    }
}

impl Xlator for TestBackend {
    fn name(&self) -> &str {
        "test-backend"
    }

    fn children(&self) -> Vec<XlatorRef> {
        Vec::new()
    }

    fn lookup(&self, frame: CallFrame, _loc: Loc, _xdata: Option<Dict>) {
        let buf = self.iatt();
        let inode = self.itable.resolve(self.gfid, IaType::Regular);
        frame.unwind(Reply::ok(FopReply::Lookup {
            inode: Some(inode),
            buf,
            xdata: None,
            postparent: Iatt::default(),
        }));
    }

    fn open(
        &self,
        frame: CallFrame,
        _loc: Loc,
        _flags: i32,
        fd: Arc<Fd>,
        _xdata: Option<Dict>,
    ) {
        frame.unwind(Reply::ok(FopReply::Open {
            fd: Some(fd),
            xdata: None,
        }));
    }

    fn readv(
        &self,
        frame: CallFrame,
        _fd: Arc<Fd>,
        size: u64,
        offset: u64,
        _flags: u32,
        _xdata: Option<Dict>,
    ) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let reply = self.read_reply(size, offset);
        if self.defer_reads.load(Ordering::SeqCst) {
            self.parked.lock().push(CallStub::unwind(frame, reply));
        } else {
            frame.unwind(reply);
        }
    }

    fn fstat(&self, frame: CallFrame, _fd: Arc<Fd>, _xdata: Option<Dict>) {
        self.fstats.fetch_add(1, Ordering::SeqCst);
        frame.unwind(Reply::ok(FopReply::Fstat {
            buf: self.iatt(),
            xdata: None,
        }));
    }

    fn writev(
        &self,
        frame: CallFrame,
        _fd: Arc<Fd>,
        vector: IoVecList,
        offset: u64,
        _flags: u32,
        _iobref: Iobref,
        _xdata: Option<Dict>,
    ) {
        let bytes = iov_concat(&vector);
        {
            let mut data = self.data.lock();
            let end = offset as usize + bytes.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(&bytes);
        }
        let mut mtime = self.mtime.lock();
        mtime.sec += 1;
        drop(mtime);
        let post = self.iatt();
        frame.unwind(Reply::ok_ret(
            bytes.len() as i64,
            FopReply::Writev {
                prebuf: Iatt::default(),
                postbuf: post,
                xdata: None,
            },
        ));
    }
}

struct Fixture {
    backend: Arc<TestBackend>,
    cache: Arc<IoCache>,
    top: XlatorRef,
}

fn fixture(opts: CacheOptions) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = TestBackend::new();
    let cache = IoCache::new("ioc-test", backend.clone(), opts);
    let top: XlatorRef = cache.clone();
    Fixture {
        backend,
        cache,
        top,
    }
}

fn small_opts() -> CacheOptions {
    CacheOptions {
        page_size: PAGE,
        cache_timeout: 60,
        ..Default::default()
    }
}

fn opened_fd(fx: &Fixture) -> Arc<Fd> {
    let looked = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Lookup {
            loc: Loc::from_path("f"),
            xdata: None,
        },
    );
    assert!(looked.is_ok());
    let inode = fx.backend.itable.find(fx.backend.gfid).unwrap();
    let fd = Fd::new(inode, libc::O_RDONLY);
    let opened = sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Open {
            loc: Loc::from_path("f"),
            flags: libc::O_RDONLY,
            fd: fd.clone(),
            xdata: None,
        },
    );
    assert!(opened.is_ok());
    fd
}

fn read(fx: &Fixture, fd: &Arc<Fd>, size: u64, offset: u64) -> Reply {
    sync_call(
        &fx.top,
        CallRoot::new(),
        FopRequest::Readv {
            fd: fd.clone(),
            size,
            offset,
            flags: 0,
            xdata: None,
        },
    )
}

#[test]
fn repeated_reads_hit_the_cache() {
    let fx = fixture(small_opts());
    fx.backend.set_data(&[7u8; 8192]);
    let fd = opened_fd(&fx);

    let first = read(&fx, &fd, PAGE, 0);
    assert_eq!(first.op_ret, PAGE as i64);
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 1);

    let second = read(&fx, &fd, PAGE, 0);
    assert_eq!(second.op_ret, PAGE as i64);
    // still one backend read: the second was served from cache
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 1);
    assert_eq!(fx.backend.fstats.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_readers_share_one_fault() {
    let fx = fixture(small_opts());
    fx.backend.set_data(&[9u8; 1024 * 1024]);
    let fd = opened_fd(&fx);

    // park the backend reply so both readers are in flight together
    fx.backend.defer_reads.store(true, Ordering::SeqCst);

    let (tx1, rx1) = mpsc::channel();
    let frame1 = CallFrame::new(
        CallRoot::new(),
        crate::fop::FopKind::Readv,
        move |reply| {
            tx1.send(reply).unwrap();
        },
    );
    crate::xlator::dispatch(
        &fx.top,
        frame1,
        FopRequest::Readv {
            fd: fd.clone(),
            size: PAGE,
            offset: 0,
            flags: 0,
            xdata: None,
        },
    );
    let (tx2, rx2) = mpsc::channel();
    let frame2 = CallFrame::new(
        CallRoot::new(),
        crate::fop::FopKind::Readv,
        move |reply| {
            tx2.send(reply).unwrap();
        },
    );
    crate::xlator::dispatch(
        &fx.top,
        frame2,
        FopRequest::Readv {
            fd: fd.clone(),
            size: PAGE,
            offset: 0,
            flags: 0,
            xdata: None,
        },
    );

    // exactly one backend read for the shared page
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 1);
    assert!(rx1.try_recv().is_err());
    assert!(rx2.try_recv().is_err());

    assert_eq!(fx.backend.resume_parked(), 1);

    let a = rx1.recv_timeout(Duration::from_secs(5)).unwrap();
    let b = rx2.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(a.op_ret, PAGE as i64);
    assert_eq!(b.op_ret, PAGE as i64);
    let FopReply::Readv { vector: va, .. } = a.data else {
        panic!("wrong reply")
    };
    let FopReply::Readv { vector: vb, .. } = b.data else {
        panic!("wrong reply")
    };
    assert_eq!(iov_concat(&va), iov_concat(&vb));
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 1);
}

#[test]
fn stale_hit_validates_with_one_fstat() {
    // timeout 0 forces a validation round on every ready-page hit
    let fx = fixture(CacheOptions {
        page_size: PAGE,
        cache_timeout: 0,
        ..Default::default()
    });
    fx.backend.set_data(&[3u8; 8192]);
    let fd = opened_fd(&fx);

    assert!(read(&fx, &fd, PAGE, 0).is_ok());
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 1);

    let again = read(&fx, &fd, PAGE, 0);
    assert!(again.is_ok());
    // unchanged mtime: one fstat, no re-read
    assert_eq!(fx.backend.fstats.load(Ordering::SeqCst), 1);
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 1);
}

#[test]
fn changed_mtime_triggers_exactly_one_refault() {
    let fx = fixture(CacheOptions {
        page_size: PAGE,
        cache_timeout: 0,
        ..Default::default()
    });
    fx.backend.set_data(&[1u8; PAGE as usize]);
    let fd = opened_fd(&fx);

    assert!(read(&fx, &fd, PAGE, 0).is_ok());
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 1);

    // server-side change moves the mtime
    fx.backend.overwrite(&[2u8; PAGE as usize], 2_000);

    let reread = read(&fx, &fd, PAGE, 0);
    assert!(reread.is_ok());
    assert_eq!(fx.backend.fstats.load(Ordering::SeqCst), 1);
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 2);
    let FopReply::Readv { vector, .. } = reread.data else {
        panic!("wrong reply")
    };
    assert!(iov_concat(&vector).iter().all(|&b| b == 2));
}

#[test]
fn write_flushes_and_next_read_sees_new_bytes() {
    let fx = fixture(small_opts());
    fx.backend.set_data(&[5u8; PAGE as usize]);
    let fd = opened_fd(&fx);

    assert!(read(&fx, &fd, PAGE, 0).is_ok());
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 1);

    let buf = IoBuf::from_vec(vec![6u8; 16]);
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
    assert_eq!(wrote.op_ret, 16);

    let read_back = read(&fx, &fd, 16, 0);
    assert_eq!(read_back.op_ret, 16);
    // the cache was flushed by the write: a fresh fault was needed
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 2);
    let FopReply::Readv { vector, .. } = read_back.data else {
        panic!("wrong reply")
    };
    assert!(iov_concat(&vector).iter().all(|&b| b == 6));
}

#[test]
fn read_past_eof_carries_enoent_and_trims() {
    let fx = fixture(small_opts());
    fx.backend.set_data(&[8u8; 6000]);
    let fd = opened_fd(&fx);

    let tail = read(&fx, &fd, PAGE, PAGE);
    assert_eq!(tail.op_ret, 6000 - PAGE as i64);
    assert_eq!(tail.op_errno, Errno::ENOENT);
}

#[test]
fn eviction_keeps_usage_at_or_under_the_bound() {
    let fx = fixture(CacheOptions {
        page_size: PAGE,
        cache_timeout: 60,
        cache_size: 2 * PAGE,
        ..Default::default()
    });
    fx.backend.set_data(&[4u8; (PAGE * 8) as usize]);
    let fd = opened_fd(&fx);

    for i in 0..6 {
        assert!(read(&fx, &fd, PAGE, i * PAGE).is_ok());
    }
    assert!(
        fx.cache.cache_used() <= 2 * PAGE,
        "cache_used {} exceeds the bound",
        fx.cache.cache_used()
    );
}

#[test]
fn weight_zero_pattern_disables_caching() {
    let fx = fixture(CacheOptions {
        page_size: PAGE,
        cache_timeout: 60,
        priority: vec![("*".to_string(), 0)],
        ..Default::default()
    });
    fx.backend.set_data(&[2u8; PAGE as usize]);
    let fd = opened_fd(&fx);

    assert!(read(&fx, &fd, PAGE, 0).is_ok());
    assert!(read(&fx, &fd, PAGE, 0).is_ok());
    // passthrough: every read reaches the backend
    assert_eq!(fx.backend.reads.load(Ordering::SeqCst), 2);
    assert_eq!(fx.cache.cache_used(), 0);
}

#[test]
fn option_parsing() {
    let map: HashMap<String, String> = [
        ("cache.cache-size", "8MB"),
        ("cache.cache-timeout", "3"),
        ("cache.priority", "*.log:0,*.db:3"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let opts = CacheOptions::from_map(&map).unwrap();
    assert_eq!(opts.cache_size, 8 << 20);
    assert_eq!(opts.cache_timeout, 3);
    assert_eq!(
        opts.priority,
        vec![("*.log".to_string(), 0), ("*.db".to_string(), 3)]
    );

    let bad: HashMap<String, String> =
        [("cache.cache-timeout".to_string(), "61".to_string())]
            .into_iter()
            .collect();
    assert!(CacheOptions::from_map(&bad).is_err());
}

#[test]
fn glob_patterns() {
    assert!(glob_match("*", "anything"));
    assert!(glob_match("*.log", "server.log"));
    assert!(!glob_match("*.log", "server.db"));
    assert!(glob_match("data-?", "data-7"));
    assert!(!glob_match("data-?", "data-42"));
    assert!(glob_match("a*b*c", "aXXbYYc"));
}
