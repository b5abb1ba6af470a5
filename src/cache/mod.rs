//! io-cache: a range-indexed read cache with fault coalescing.
//!
//! Reads are served from aligned pages cached per inode. Concurrent
//! readers of one page share a single backend fault; freshness is
//! checked against the server mtime within a configurable timeout;
//! writes and size changes flush the inode's cache. Eviction walks
//! priority classes from least to most important.

mod inode;
mod page;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use log::debug;
use log::trace;
use parking_lot::Mutex;

use crate::dict::Dict;
use crate::errno::Errno;
use crate::fd::Fd;
use crate::fop::FopReply;
use crate::fop::FopRequest;
use crate::fop::Reply;
use crate::frame::CallFrame;
use crate::gfid::Gfid;
use crate::iatt::IaType;
use crate::iatt::Iatt;
use crate::iatt::IattValid;
use crate::inode::Inode;
use crate::iobuf::IoVecList;
use crate::iobuf::Iobref;
use crate::loc::Loc;
use crate::xlator::Xlator;
use crate::xlator::XlatorRef;
use crate::xlator::forward;
use crate::xlator::wind;

use self::inode::IocInode;
use self::page::Page;
use self::page::Waiter;

/// Context-slot key for cache state on inodes and fds.
pub const IOC_CTX: &str = "io-cache";

/// Default page span: 128 KiB.
const DEFAULT_PAGE_SIZE: u64 = 128 * 1024;
/// Default cache bound: 32 MiB.
const DEFAULT_CACHE_SIZE: u64 = 32 * 1024 * 1024;

/// Marker on fds whose caching is disabled (weight 0 or O_DIRECT).
#[derive(Debug)]
struct IocFdDisabled;

/// Configuration for one cache instance.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Upper bound on cached bytes (`cache.cache-size`).
    pub cache_size: u64,
    /// Freshness window in seconds, 0-60 (`cache.cache-timeout`).
    pub cache_timeout: u32,
    /// Files smaller than this are not cached (`cache.min-file-size`).
    pub min_file_size: u64,
    /// Files larger than this are not cached; 0 = no bound
    /// (`cache.max-file-size`).
    pub max_file_size: u64,
    /// Page span; defaults to 128 KiB, floored at the system page.
    pub page_size: u64,
    /// Eviction weight per path glob (`cache.priority`).
    pub priority: Vec<(String, u32)>,
}

impl Default for CacheOptions {
    fn default() -> CacheOptions {
        CacheOptions {
            cache_size: DEFAULT_CACHE_SIZE,
            cache_timeout: 1,
            min_file_size: 0,
            max_file_size: 0,
            page_size: DEFAULT_PAGE_SIZE.max(page_size::get() as u64),
            priority: Vec::new(),
        }
    }
}

impl CacheOptions {
    /// Parse from a string option map; unknown keys are ignored.
    pub fn from_map(
        map: &HashMap<String, String>,
    ) -> std::io::Result<CacheOptions> {
        let mut opts = CacheOptions::default();
        if let Some(raw) = map.get("cache.cache-size") {
            opts.cache_size = parse_bytes(raw)?;
        }
        if let Some(raw) = map.get("cache.cache-timeout") {
            let secs: u32 = raw
                .parse()
                .map_err(|_| std::io::Error::other("bad cache-timeout"))?;
            if secs > 60 {
                return Err(std::io::Error::other(
                    "cache-timeout must be 0-60 seconds",
                ));
            }
            opts.cache_timeout = secs;
        }
        if let Some(raw) = map.get("cache.min-file-size") {
            opts.min_file_size = parse_bytes(raw)?;
        }
        if let Some(raw) = map.get("cache.max-file-size") {
            opts.max_file_size = parse_bytes(raw)?;
        }
        if let Some(raw) = map.get("cache.priority") {
            opts.priority = parse_priority(raw)?;
        }
        Ok(opts)
    }
}

/// Parse "4096", "64KB", "32MB", "1GB".
fn parse_bytes(raw: &str) -> std::io::Result<u64> {
    let raw = raw.trim();
    let (digits, mult) = match raw.to_ascii_uppercase() {
        s if s.ends_with("GB") => (&raw[..raw.len() - 2], 1 << 30),
        s if s.ends_with("MB") => (&raw[..raw.len() - 2], 1 << 20),
        s if s.ends_with("KB") => (&raw[..raw.len() - 2], 1 << 10),
        s if s.ends_with("B") => (&raw[..raw.len() - 1], 1),
        _ => (raw, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * mult)
        .map_err(|_| std::io::Error::other(format!("bad byte count {raw:?}")))
}

/// Parse "pattern:weight,pattern:weight".
fn parse_priority(raw: &str) -> std::io::Result<Vec<(String, u32)>> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((pattern, weight)) = part.rsplit_once(':') else {
            return Err(std::io::Error::other(format!(
                "priority entry {part:?} is not pattern:weight"
            )));
        };
        let weight: u32 = weight
            .parse()
            .map_err(|_| std::io::Error::other("bad priority weight"))?;
        out.push((pattern.to_string(), weight));
    }
    Ok(out)
}

/// Shell-style glob: `*` any run, `?` any one character.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

struct TableState {
    /// Per-priority inode LRU, least-recently-used first.
    buckets: Vec<VecDeque<Gfid>>,
    inodes: HashMap<Gfid, Arc<IocInode>>,
}

/// Cache-wide bookkeeping shared by every inode.
pub(crate) struct IocTable {
    opts: CacheOptions,
    max_pri: usize,
    cache_used: AtomicU64,
    state: Mutex<TableState>,
}

impl IocTable {
    fn new(opts: CacheOptions) -> Arc<IocTable> {
        let max_pri = opts
            .priority
            .iter()
            .map(|(_, w)| *w as usize)
            .max()
            .unwrap_or(1)
            .max(1);
        Arc::new(IocTable {
            opts,
            max_pri,
            cache_used: AtomicU64::new(0),
            state: Mutex::new(TableState {
                buckets: vec![VecDeque::new(); max_pri + 1],
                inodes: HashMap::new(),
            }),
        })
    }

    /// Weight of a path under the configured patterns; the first match
    /// wins and the default class is 1.
    fn priority_of(&self, path: Option<&str>) -> u32 {
        let Some(path) = path else { return 1 };
        for (pattern, weight) in &self.opts.priority {
            if glob_match(pattern, path) {
                return *weight;
            }
        }
        1
    }

    fn get_or_create(&self, gfid: Gfid, weight: u32) -> Arc<IocInode> {
        let mut st = self.state.lock();
        if let Some(found) = st.inodes.get(&gfid) {
            return found.clone();
        }
        let created = Arc::new(IocInode::new(gfid, weight));
        st.inodes.insert(gfid, created.clone());
        let bucket = (weight as usize).min(self.max_pri);
        st.buckets[bucket].push_back(gfid);
        created
    }

    fn lookup(&self, gfid: Gfid) -> Option<Arc<IocInode>> {
        self.state.lock().inodes.get(&gfid).cloned()
    }

    /// Mark an inode recently used within its priority class.
    fn touch(&self, ioc: &IocInode) {
        let mut st = self.state.lock();
        let bucket = (ioc.weight as usize).min(self.max_pri);
        let queue = &mut st.buckets[bucket];
        if let Some(pos) = queue.iter().position(|&g| g == ioc.gfid) {
            queue.remove(pos);
        }
        queue.push_back(ioc.gfid);
    }

    fn forget(&self, gfid: Gfid) {
        let removed = {
            let mut st = self.state.lock();
            let removed = st.inodes.remove(&gfid);
            for bucket in &mut st.buckets {
                if let Some(pos) = bucket.iter().position(|&g| g == gfid) {
                    bucket.remove(pos);
                    break;
                }
            }
            removed
        };
        if let Some(ioc) = removed {
            let freed = ioc.lock().flush();
            self.sub_used(freed);
        }
    }

    fn add_used(&self, bytes: usize) {
        self.cache_used.fetch_add(bytes as u64, Ordering::AcqRel);
    }

    fn sub_used(&self, bytes: usize) {
        self.cache_used.fetch_sub(bytes as u64, Ordering::AcqRel);
    }

    pub(crate) fn cache_used(&self) -> u64 {
        self.cache_used.load(Ordering::Acquire)
    }

    fn need_prune(&self) -> bool {
        self.cache_used() > self.opts.cache_size
    }

    /// Reclaim until the bound holds, lowest priority class first,
    /// least-recently-used inode outward. Pages with waiters are only
    /// marked stale; they die when their last waiter drains.
    fn prune(&self) {
        let victims: Vec<Arc<IocInode>> = {
            let st = self.state.lock();
            st.buckets
                .iter()
                .flat_map(|bucket| bucket.iter())
                .filter_map(|gfid| st.inodes.get(gfid).cloned())
                .collect()
        };
        for ioc in victims {
            if !self.need_prune() {
                return;
            }
            let mut st = ioc.lock();
            while self.need_prune() {
                let Some(&offset) = st.lru.front() else { break };
                let waiterless = st
                    .pages
                    .get(&offset)
                    .map(|p| p.waitq.is_empty())
                    .unwrap_or(true);
                if waiterless {
                    let (freed, _none) = st.destroy_page(offset);
                    self.sub_used(freed);
                    trace!("pruned page at {offset}");
                } else {
                    st.lru.pop_front();
                    if let Some(page) = st.pages.get_mut(&offset) {
                        page.stale = true;
                    }
                }
            }
        }
    }
}

struct Fill {
    offset: u64,
    vector: IoVecList,
    iobref: Iobref,
}

struct IocLocalState {
    op_ret: i64,
    op_errno: Errno,
    wait_count: i32,
    fills: Vec<Fill>,
}

/// Per-readv bookkeeping parked in the frame's scratch slot so page
/// wake-ups on backend threads can find it.
struct IocLocal {
    ioc: Arc<IocInode>,
    offset: u64,
    size: u64,
    state: Mutex<IocLocalState>,
}

impl IocLocal {
    fn new(ioc: Arc<IocInode>, offset: u64, size: u64) -> Arc<IocLocal> {
        Arc::new(IocLocal {
            ioc,
            offset,
            size,
            state: Mutex::new(IocLocalState {
                op_ret: 0,
                op_errno: Errno::OK,
                wait_count: 0,
                fills: Vec::new(),
            }),
        })
    }
}

/// The io-cache translator.
pub struct IoCache {
    weak: Weak<IoCache>,
    name: String,
    child: XlatorRef,
    table: Arc<IocTable>,
}

impl IoCache {
    /// Build a cache instance over `child`.
    pub fn new(
        name: &str,
        child: XlatorRef,
        options: CacheOptions,
    ) -> Arc<IoCache> {
        Arc::new_cyclic(|weak| IoCache {
            weak: weak.clone(),
            name: name.to_string(),
            child,
            table: IocTable::new(options),
        })
    }

    /// Bytes currently cached; test and statedump hook.
    pub fn cache_used(&self) -> u64 {
        self.table.cache_used()
    }

    fn me(&self) -> Arc<IoCache> {
        self.weak.upgrade().expect("io-cache still referenced")
    }

    fn ioc_of(&self, inode: &Arc<Inode>) -> Option<Arc<IocInode>> {
        inode.ctx_get::<IocInode>(IOC_CTX)
    }

    /// Create or refresh the per-inode cache context from a stat-like
    /// reply; a changed mtime flushes what is cached.
    fn update_inode(
        &self,
        inode: &Arc<Inode>,
        path: Option<&str>,
        buf: &Iatt,
    ) {
        if buf.ia_type != IaType::Regular {
            return;
        }
        let ioc = match self.ioc_of(inode) {
            Some(found) => found,
            None => {
                let weight = self.table.priority_of(path);
                let created = self.table.get_or_create(buf.ia_gfid, weight);
                inode.ctx_set(IOC_CTX, created.clone());
                created
            }
        };
        let mut st = ioc.lock();
        if !st.mtime.is_zero() && !st.still_valid(buf) {
            let freed = st.flush();
            self.table.sub_used(freed);
        }
        st.note_reply(buf);
    }

    fn flush_inode(&self, inode: &Arc<Inode>) {
        if let Some(ioc) = self.ioc_of(inode) {
            let freed = ioc.lock().flush();
            self.table.sub_used(freed);
        }
    }

    /// Account one more pending wake-up for the frame.
    fn hold(local: &Arc<IocLocal>) {
        local.state.lock().wait_count += 1;
    }

    /// Drop one pending wake-up; the last one assembles the reply.
    fn frame_return(&self, frame: &CallFrame) {
        let Some(local) = frame.local_get::<IocLocal>() else {
            return;
        };
        let finished = {
            let mut st = local.state.lock();
            st.wait_count -= 1;
            st.wait_count == 0
        };
        if finished {
            self.unwind_read(frame, &local);
        }
    }

    fn unwind_read(&self, frame: &CallFrame, local: &Arc<IocLocal>) {
        let ia = {
            let st = local.ioc.lock();
            Iatt {
                ia_gfid: local.ioc.gfid,
                ia_type: IaType::Regular,
                ia_size: st.ia_size,
                ia_mtime: st.mtime,
                ..Default::default()
            }
        };
        let mut st = local.state.lock();
        if st.op_ret < 0 {
            let errno = st.op_errno;
            drop(st);
            return frame.unwind(Reply::error(frame.kind(), errno));
        }
        st.fills.sort_by_key(|f| f.offset);
        let mut vector = IoVecList::new();
        let mut iobref = Iobref::new();
        let mut total = 0usize;
        for fill in st.fills.drain(..) {
            total += fill.vector.iter().map(|v| v.len()).sum::<usize>();
            vector.extend(fill.vector);
            iobref.merge(&fill.iobref);
        }
        let mut op_errno = Errno::OK;
        if local.offset + total as u64 >= ia.ia_size {
            op_errno = Errno::ENOENT;
        }
        drop(st);
        trace!(
            "{}: serving {total} of {} bytes at {} from cache",
            self.name, local.size, local.offset
        );
        frame.unwind(Reply {
            op_ret: total as i64,
            op_errno,
            data: FopReply::Readv {
                vector,
                stbuf: ia,
                iobref,
                xdata: None,
            },
        });
    }

    /// Give one waiter its slice of a page and retire its hold.
    fn wake_waiter(
        &self,
        waiter: Waiter,
        page_offset: u64,
        page_snapshot: Option<(IoVecList, Iobref)>,
        op_errno: Errno,
        ia_size: u64,
    ) {
        let Waiter {
            frame,
            pending_offset,
            pending_size,
        } = waiter;
        if let Some(local) = frame.local_get::<IocLocal>() {
            let mut st = local.state.lock();
            if !op_errno.is_ok() {
                st.op_ret = -1;
                st.op_errno = op_errno;
            } else if let Some((vector, iobref)) = page_snapshot {
                // rebuild a page shell to reuse the overlap logic
                let mut shell = Page::new(page_offset);
                shell.fill(vector, iobref);
                let (begin, sliced) =
                    shell.overlap(pending_offset, pending_size, ia_size);
                if !sliced.is_empty() {
                    st.fills.push(Fill {
                        offset: begin,
                        vector: sliced,
                        iobref: shell.iobref.clone(),
                    });
                }
            }
        }
        self.frame_return(&frame);
    }

    /// The readv engine: walk the page range, collect hits, coalesce
    /// on in-flight pages, fault the holes, revalidate stale hits.
    fn dispatch_requests(
        &self,
        frame: CallFrame,
        ioc: Arc<IocInode>,
        fd: Arc<Fd>,
        offset: u64,
        size: u64,
    ) {
        let page_size = self.table.opts.page_size;
        let timeout = self.table.opts.cache_timeout;
        let Some(local) = frame.local_get::<IocLocal>() else {
            return frame.unwind_error(Errno::EINVAL);
        };

        let rounded_offset = (offset / page_size) * page_size;
        let rounded_end = (offset + size).div_ceil(page_size) * page_size;

        // the dispatch itself holds the frame until every page is seen
        Self::hold(&local);

        let mut faults: Vec<u64> = Vec::new();
        let mut need_validate = false;
        let mut immediate: Vec<(Waiter, u64, Option<(IoVecList, Iobref)>, Errno, u64)> =
            Vec::new();

        let mut trav_offset = rounded_offset;
        while trav_offset < rounded_end {
            let local_offset = trav_offset.max(offset);
            let trav_size =
                (offset + size - local_offset).min(page_size);
            {
                let mut guard = ioc.lock();
                let st = &mut *guard;
                let fresh = st.fresh_within(timeout);
                let created = !st.pages.contains_key(&trav_offset);
                let (ready, faulting) = {
                    let page = st
                        .pages
                        .entry(trav_offset)
                        .or_insert_with(|| Page::new(trav_offset));
                    if created {
                        page.faulting = true;
                        faults.push(trav_offset);
                    }
                    Self::hold(&local);
                    page.wait(frame.clone(), local_offset, trav_size);
                    (page.ready, page.faulting)
                };

                if ready {
                    if fresh && !st.validate_in_flight {
                        // plain cache hit: serve every parked waiter now
                        let ia_size = st.ia_size;
                        if let Some(page) = st.pages.get_mut(&trav_offset)
                        {
                            let snapshot = Some((
                                page.vector.clone(),
                                page.iobref.clone(),
                            ));
                            let errno = page.op_errno;
                            for waiter in page.take_waiters() {
                                immediate.push((
                                    waiter,
                                    trav_offset,
                                    snapshot.clone(),
                                    errno,
                                    ia_size,
                                ));
                            }
                        }
                        st.lru_touch(trav_offset);
                    } else {
                        // a validation round answers for this page
                        if !st.validate_in_flight {
                            st.validate_in_flight = true;
                            need_validate = true;
                        }
                        if !st.validate_pages.contains(&trav_offset) {
                            st.validate_pages.push(trav_offset);
                        }
                    }
                } else if !faulting {
                    // data was dropped while waiters queued elsewhere;
                    // refault rather than wait forever
                    if let Some(page) = st.pages.get_mut(&trav_offset) {
                        page.faulting = true;
                    }
                    faults.push(trav_offset);
                } else if created {
                    st.lru_touch(trav_offset);
                }
            }
            trav_offset += page_size;
        }

        for (waiter, page_offset, snapshot, errno, ia_size) in immediate {
            self.wake_waiter(waiter, page_offset, snapshot, errno, ia_size);
        }
        for page_offset in faults {
            self.page_fault(&frame, ioc.clone(), fd.clone(), page_offset);
        }
        if need_validate {
            self.cache_validate(&frame, ioc.clone(), fd.clone());
        }
        self.frame_return(&frame);

        if self.table.need_prune() {
            self.table.prune();
        }
    }

    /// Read exactly one page from the backend.
    fn page_fault(
        &self,
        frame: &CallFrame,
        ioc: Arc<IocInode>,
        fd: Arc<Fd>,
        page_offset: u64,
    ) {
        let this = self.me();
        let page_size = self.table.opts.page_size;
        let fault_fd = fd.clone();
        let fault_frame = CallFrame::new(
            frame.root().clone(),
            crate::fop::FopKind::Readv,
            move |reply| this.fault_done(ioc, fault_fd, page_offset, reply),
        );
        trace!("{}: fault at {page_offset}", self.name);
        crate::xlator::dispatch(
            &self.child,
            fault_frame,
            FopRequest::Readv {
                fd: fd.clone(),
                size: page_size,
                offset: page_offset,
                flags: 0,
                xdata: None,
            },
        );
    }

    fn fault_done(
        &self,
        ioc: Arc<IocInode>,
        _fd: Arc<Fd>,
        page_offset: u64,
        reply: Reply,
    ) {
        let mut wakeups: Vec<(Waiter, u64, Option<(IoVecList, Iobref)>, Errno, u64)> =
            Vec::new();
        {
            let mut st = ioc.lock();
            if !reply.is_ok() {
                // every waiter of this page sees the same failure
                let (freed, waiters) = st.destroy_page(page_offset);
                self.table.sub_used(freed);
                for waiter in waiters {
                    wakeups.push((
                        waiter,
                        page_offset,
                        None,
                        reply.op_errno,
                        0,
                    ));
                }
            } else if let FopReply::Readv {
                vector,
                stbuf,
                iobref,
                ..
            } = reply.data
            {
                if !st.mtime.is_zero() && !st.still_valid(&stbuf) {
                    debug!("{}: mtime moved, cache flushed", self.name);
                    let freed = st.flush();
                    self.table.sub_used(freed);
                }
                st.note_reply(&stbuf);
                let ia_size = st.ia_size;
                let page = st
                    .pages
                    .entry(page_offset)
                    .or_insert_with(|| Page::new(page_offset));
                page.stale = false;
                page.fill(vector, iobref);
                self.table.add_used(page.size);
                let snapshot =
                    Some((page.vector.clone(), page.iobref.clone()));
                for waiter in page.take_waiters() {
                    wakeups.push((
                        waiter,
                        page_offset,
                        snapshot.clone(),
                        Errno::OK,
                        ia_size,
                    ));
                }
                st.lru_touch(page_offset);
            }
        }
        for (waiter, page_offset, snapshot, errno, ia_size) in wakeups {
            self.wake_waiter(waiter, page_offset, snapshot, errno, ia_size);
        }
        if self.table.need_prune() {
            self.table.prune();
        }
    }

    /// One fstat answers for every page pending validation.
    fn cache_validate(
        &self,
        frame: &CallFrame,
        ioc: Arc<IocInode>,
        fd: Arc<Fd>,
    ) {
        let this = self.me();
        let check_fd = fd.clone();
        let validate_frame = CallFrame::new(
            frame.root().clone(),
            crate::fop::FopKind::Fstat,
            move |reply| this.validate_done(ioc, check_fd, reply),
        );
        crate::xlator::dispatch(
            &self.child,
            validate_frame,
            FopRequest::Fstat { fd, xdata: None },
        );
    }

    fn validate_done(&self, ioc: Arc<IocInode>, fd: Arc<Fd>, reply: Reply) {
        let mut wakeups: Vec<(Waiter, u64, Option<(IoVecList, Iobref)>, Errno, u64)> =
            Vec::new();
        let mut refaults: Vec<u64> = Vec::new();
        {
            let mut st = ioc.lock();
            st.validate_in_flight = false;
            let offsets = std::mem::take(&mut st.validate_pages);

            let stbuf = match (reply.is_ok(), &reply.data) {
                (true, FopReply::Fstat { buf, .. }) => Some(*buf),
                _ => None,
            };
            let valid =
                stbuf.map(|buf| st.still_valid(&buf)).unwrap_or(false);

            if valid {
                if let Some(buf) = stbuf {
                    st.note_reply(&buf);
                }
                let ia_size = st.ia_size;
                for offset in offsets {
                    let Some(page) = st.pages.get_mut(&offset) else {
                        continue;
                    };
                    if !page.ready {
                        continue;
                    }
                    let snapshot =
                        Some((page.vector.clone(), page.iobref.clone()));
                    let errno = page.op_errno;
                    let stale = page.stale;
                    for waiter in page.take_waiters() {
                        wakeups.push((
                            waiter,
                            offset,
                            snapshot.clone(),
                            errno,
                            ia_size,
                        ));
                    }
                    if stale {
                        let (freed, _none) = st.destroy_page(offset);
                        self.table.sub_used(freed);
                    } else {
                        st.lru_touch(offset);
                    }
                }
            } else {
                // cache no longer trustworthy: drop data, refault the
                // pages readers still wait on
                debug!("{}: validation failed, refaulting", self.name);
                let freed = st.flush();
                self.table.sub_used(freed);
                if let Some(buf) = stbuf {
                    st.note_reply(&buf);
                }
                for offset in offsets {
                    let Some(page) = st.pages.get_mut(&offset) else {
                        continue;
                    };
                    if page.waitq.is_empty() {
                        let (freed, _none) = st.destroy_page(offset);
                        self.table.sub_used(freed);
                        continue;
                    }
                    page.stale = false;
                    if !page.faulting {
                        page.faulting = true;
                        refaults.push(offset);
                    }
                }
            }
        }
        for (waiter, page_offset, snapshot, errno, ia_size) in wakeups {
            self.wake_waiter(waiter, page_offset, snapshot, errno, ia_size);
        }
        for offset in refaults {
            // no originating frame here; root a fresh fault frame
            let this = self.me();
            let ioc = ioc.clone();
            let fault_frame = CallFrame::new(
                crate::frame::CallRoot::new(),
                crate::fop::FopKind::Readv,
                {
                    let fd = fd.clone();
                    let this = this.clone();
                    move |reply| this.fault_done(ioc, fd, offset, reply)
                },
            );
            crate::xlator::dispatch(
                &self.child,
                fault_frame,
                FopRequest::Readv {
                    fd: fd.clone(),
                    size: self.table.opts.page_size,
                    offset,
                    flags: 0,
                    xdata: None,
                },
            );
        }
    }
}

impl Xlator for IoCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<XlatorRef> {
        vec![self.child.clone()]
    }

    fn forget(&self, inode: &Arc<Inode>) {
        self.table.forget(inode.gfid());
        inode.ctx_del(IOC_CTX);
    }

    fn release(&self, fd: &Arc<Fd>) {
        fd.ctx_del(IOC_CTX);
    }

    fn invalidate(&self, inode: &Arc<Inode>) {
        debug!("{}: invalidation for {}", self.name, inode.gfid());
        self.flush_inode(inode);
    }

    fn lookup(&self, frame: CallFrame, loc: Loc, xdata: Option<Dict>) {
        let this = self.me();
        let path = loc
            .path
            .as_ref()
            .and_then(|p| p.to_str().map(String::from));
        wind(
            frame,
            &self.child,
            FopRequest::Lookup { loc, xdata },
            move |frame, reply| {
                if reply.is_ok() {
                    if let FopReply::Lookup {
                        inode: Some(inode),
                        buf,
                        ..
                    } = &reply.data
                    {
                        this.update_inode(inode, path.as_deref(), buf);
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
        let path = loc
            .path
            .as_ref()
            .and_then(|p| p.to_str().map(String::from));
        let open_fd = fd.clone();
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
                    let weight =
                        this.table.priority_of(path.as_deref());
                    let inode = open_fd.inode();
                    if this.ioc_of(inode).is_none() {
                        let created = this
                            .table
                            .get_or_create(inode.gfid(), weight);
                        inode.ctx_set(IOC_CTX, created);
                    }
                    if weight == 0 || flags & libc::O_DIRECT != 0 {
                        // this fd bypasses the cache entirely
                        open_fd.ctx_set(IOC_CTX, Arc::new(IocFdDisabled));
                    }
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
        let path = loc
            .path
            .as_ref()
            .and_then(|p| p.to_str().map(String::from));
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
                        inode: Some(inode),
                        buf,
                        ..
                    } = &reply.data
                    {
                        this.update_inode(inode, path.as_deref(), buf);
                    }
                }
                frame.unwind(reply);
            },
        );
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
        let this = self.me();
        let path = loc
            .path
            .as_ref()
            .and_then(|p| p.to_str().map(String::from));
        wind(
            frame,
            &self.child,
            FopRequest::Mknod {
                loc,
                mode,
                rdev,
                umask,
                xdata,
            },
            move |frame, reply| {
                if reply.is_ok() {
                    if let FopReply::Mknod {
                        inode: Some(inode),
                        buf,
                        ..
                    } = &reply.data
                    {
                        this.update_inode(inode, path.as_deref(), buf);
                    }
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
        let disabled = fd.ctx_get::<IocFdDisabled>(IOC_CTX).is_some();
        let Some(ioc) = self.ioc_of(fd.inode()).filter(|_| !disabled)
        else {
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
        // file-size class gates
        let known_size = ioc.lock().ia_size;
        let opts = &self.table.opts;
        if (opts.min_file_size > 0 && known_size < opts.min_file_size)
            || (opts.max_file_size > 0 && known_size > opts.max_file_size)
        {
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
        }
        self.table.touch(&ioc);
        frame.local_set(IocLocal::new(ioc.clone(), offset, size));
        self.dispatch_requests(frame, ioc, fd, offset, size);
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
        // written data never populates the cache; it only invalidates
        self.flush_inode(fd.inode());
        let this = self.me();
        let inode = fd.inode().clone();
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
                    if let (Some(ioc), FopReply::Writev { postbuf, .. }) =
                        (this.ioc_of(&inode), &reply.data)
                    {
                        ioc.lock().ia_size = postbuf.ia_size;
                    }
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
        if let Some(inode) = &loc.inode {
            self.flush_inode(inode);
        } else if let Some(ioc) = self.table.lookup(loc.target_gfid()) {
            let freed = ioc.lock().flush();
            self.table.sub_used(freed);
        }
        forward(self, frame, FopRequest::Truncate { loc, offset, xdata });
    }

    fn ftruncate(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        xdata: Option<Dict>,
    ) {
        self.flush_inode(fd.inode());
        forward(self, frame, FopRequest::Ftruncate { fd, offset, xdata });
    }

    fn setattr(
        &self,
        frame: CallFrame,
        loc: Loc,
        stbuf: Iatt,
        valid: IattValid,
        xdata: Option<Dict>,
    ) {
        if valid.contains(IattValid::SIZE) {
            if let Some(inode) = &loc.inode {
                self.flush_inode(inode);
            }
        }
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
        if valid.contains(IattValid::SIZE) {
            self.flush_inode(fd.inode());
        }
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

    fn zerofill(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        len: u64,
        xdata: Option<Dict>,
    ) {
        self.flush_inode(fd.inode());
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

    fn discard(
        &self,
        frame: CallFrame,
        fd: Arc<Fd>,
        offset: u64,
        len: u64,
        xdata: Option<Dict>,
    ) {
        self.flush_inode(fd.inode());
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
}

impl std::fmt::Debug for IoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoCache")
            .field("name", &self.name)
            .field("cache_used", &self.table.cache_used())
            .finish()
    }
}

#[cfg(test)]
mod tests;
