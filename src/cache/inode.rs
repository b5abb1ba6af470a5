//! Per-inode cache state.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::gfid::Gfid;
use crate::iatt::Iatt;
use crate::iatt::IattTime;

use super::page::Page;
use super::page::Waiter;

/// Everything the cache knows about one inode, guarded by one lock.
#[derive(Debug, Default)]
pub(crate) struct IocInodeState {
    /// Pages keyed by page-aligned offset.
    pub pages: HashMap<u64, Page>,
    /// Page offsets, least-recently-used first.
    pub lru: VecDeque<u64>,
    /// Server mtime observed by the last fault/validate.
    pub mtime: IattTime,
    /// Server file size observed by the last fault/validate.
    pub ia_size: u64,
    /// When the cache was last confirmed fresh.
    pub last_validate: Option<Instant>,
    /// An fstat validation round is in flight.
    pub validate_in_flight: bool,
    /// Pages whose waiters ride on the in-flight validation.
    pub validate_pages: Vec<u64>,
}

/// One inode's cache, shared between the translator and the table LRUs.
#[derive(Debug)]
pub(crate) struct IocInode {
    /// Identity of the cached file.
    pub gfid: Gfid,
    /// Eviction class from the priority pattern list.
    pub weight: u32,
    state: Mutex<IocInodeState>,
}

impl IocInode {
    pub(crate) fn new(gfid: Gfid, weight: u32) -> IocInode {
        IocInode {
            gfid,
            weight,
            state: Mutex::new(IocInodeState::default()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, IocInodeState> {
        self.state.lock()
    }
}

impl IocInodeState {
    /// True when the cached data may be served without revalidation.
    pub(crate) fn fresh_within(&self, timeout_secs: u32) -> bool {
        if timeout_secs == 0 {
            return false;
        }
        match self.last_validate {
            Some(at) => at.elapsed().as_secs() < timeout_secs as u64,
            None => false,
        }
    }

    /// Compare a server reply's identity against the cache. Zero mtime
    /// never matches: an unset time proves nothing.
    pub(crate) fn still_valid(&self, stbuf: &Iatt) -> bool {
        !self.mtime.is_zero() && self.mtime == stbuf.ia_mtime
    }

    /// Adopt the identity a server reply reports.
    pub(crate) fn note_reply(&mut self, stbuf: &Iatt) {
        self.mtime = stbuf.ia_mtime;
        self.ia_size = stbuf.ia_size;
        self.last_validate = Some(Instant::now());
    }

    /// Touch a page in the LRU: most recently used moves to the back.
    pub(crate) fn lru_touch(&mut self, offset: u64) {
        if let Some(pos) = self.lru.iter().position(|&o| o == offset) {
            self.lru.remove(pos);
        }
        self.lru.push_back(offset);
    }

    /// Drop one page outright. Returns the bytes freed, along with any
    /// waiters that must now be failed or refaulted by the caller.
    pub(crate) fn destroy_page(
        &mut self,
        offset: u64,
    ) -> (usize, VecDeque<Waiter>) {
        if let Some(pos) = self.lru.iter().position(|&o| o == offset) {
            self.lru.remove(pos);
        }
        match self.pages.remove(&offset) {
            Some(mut page) => {
                let freed = page.reset();
                (freed, page.take_waiters())
            }
            None => (0, VecDeque::new()),
        }
    }

    /// Flush the whole inode cache: waiterless pages are destroyed,
    /// pages with waiters only drop their data and go stale so they
    /// die when their last waiter drains. Returns the bytes freed.
    pub(crate) fn flush(&mut self) -> usize {
        let mut freed = 0;
        let offsets: Vec<u64> = self.pages.keys().copied().collect();
        for offset in offsets {
            let waiterless = match self.pages.get(&offset) {
                Some(page) => page.waitq.is_empty(),
                None => continue,
            };
            if waiterless {
                let (bytes, _none) = self.destroy_page(offset);
                freed += bytes;
            } else if let Some(page) = self.pages.get_mut(&offset) {
                freed += page.reset();
                page.stale = true;
            }
        }
        self.mtime = IattTime::default();
        self.last_validate = None;
        freed
    }

    /// Total bytes of cached data held by this inode.
    pub(crate) fn bytes_cached(&self) -> usize {
        self.pages.values().map(|p| p.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iobuf::IoBuf;
    use crate::iobuf::IoVec;
    use crate::iobuf::IoVecList;
    use crate::iobuf::Iobref;

    fn ready_page(offset: u64, len: usize) -> Page {
        let mut page = Page::new(offset);
        let buf = IoBuf::zeroed(len);
        let mut iobref = Iobref::new();
        iobref.add(&buf);
        let mut vector = IoVecList::new();
        vector.push(IoVec::whole(buf));
        page.fill(vector, iobref);
        page
    }

    #[test]
    fn flush_destroys_waiterless_and_stales_the_rest() {
        let inode = IocInode::new(Gfid::generate(), 1);
        let mut st = inode.lock();
        st.pages.insert(0, ready_page(0, 100));
        st.lru_touch(0);
        let mut waited = ready_page(128, 50);
        waited.wait(
            crate::frame::CallFrame::new(
                crate::frame::CallRoot::new(),
                crate::fop::FopKind::Readv,
                |_r| {},
            ),
            128,
            10,
        );
        st.pages.insert(128, waited);
        st.lru_touch(128);

        let freed = st.flush();
        assert_eq!(freed, 150);
        assert!(!st.pages.contains_key(&0));
        let survivor = &st.pages[&128];
        assert!(survivor.stale);
        assert!(!survivor.ready);
        assert_eq!(survivor.waitq.len(), 1);
    }

    #[test]
    fn freshness_window() {
        let inode = IocInode::new(Gfid::generate(), 1);
        let mut st = inode.lock();
        assert!(!st.fresh_within(60));
        st.note_reply(&Iatt {
            ia_mtime: IattTime {
                sec: 5,
                nsec: 0,
            },
            ia_size: 10,
            ..Default::default()
        });
        assert!(st.fresh_within(60));
        // timeout 0 forces validation every time
        assert!(!st.fresh_within(0));
    }

    #[test]
    fn zero_mtime_never_validates() {
        let inode = IocInode::new(Gfid::generate(), 1);
        let mut st = inode.lock();
        let zero = Iatt::default();
        assert!(!st.still_valid(&zero));
        st.note_reply(&zero);
        assert!(!st.still_valid(&zero));

        let stamped = Iatt {
            ia_mtime: IattTime { sec: 9, nsec: 1 },
            ..Default::default()
        };
        st.note_reply(&stamped);
        assert!(st.still_valid(&stamped));
    }
}
