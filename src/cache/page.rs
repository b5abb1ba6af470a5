//! Cache pages and their wait queues.
//!
//! A page covers one aligned range of one file. Callers that need a page
//! which is not ready enqueue on its waitq; the fault or validation
//! reply fills every waiter in FIFO order. All page state is guarded by
//! the owning inode's lock.

use std::collections::VecDeque;

use crate::errno::Errno;
use crate::frame::CallFrame;
use crate::iobuf::IoVec;
use crate::iobuf::IoVecList;
use crate::iobuf::Iobref;

/// One frame waiting on a page, with the sub-range it asked for.
#[derive(Debug)]
pub(crate) struct Waiter {
    /// The suspended reader.
    pub frame: CallFrame,
    /// Absolute offset of the bytes this waiter needs.
    pub pending_offset: u64,
    /// Length of the bytes this waiter needs.
    pub pending_size: u64,
}

/// A cached (or in-fault) aligned range of a file.
#[derive(Debug)]
pub(crate) struct Page {
    /// Page-aligned file offset.
    pub offset: u64,
    /// Actual bytes held; at most the table page size.
    pub size: usize,
    /// Data present and servable.
    pub ready: bool,
    /// A backend fault for this page is in flight.
    pub faulting: bool,
    /// Destroy once the last waiter drains.
    pub stale: bool,
    /// Error observed by the fault, delivered to late waiters.
    pub op_errno: Errno,
    /// The cached data segments.
    pub vector: IoVecList,
    /// Strong refs pinning the data buffers.
    pub iobref: Iobref,
    /// FIFO of suspended readers.
    pub waitq: VecDeque<Waiter>,
}

impl Page {
    /// A fresh page, not yet faulted.
    pub(crate) fn new(offset: u64) -> Page {
        Page {
            offset,
            size: 0,
            ready: false,
            faulting: false,
            stale: false,
            op_errno: Errno::OK,
            vector: IoVecList::new(),
            iobref: Iobref::new(),
            waitq: VecDeque::new(),
        }
    }

    /// Park a reader on this page.
    pub(crate) fn wait(
        &mut self,
        frame: CallFrame,
        pending_offset: u64,
        pending_size: u64,
    ) {
        self.waitq.push_back(Waiter {
            frame,
            pending_offset,
            pending_size,
        });
    }

    /// Install fault data and mark the page servable.
    pub(crate) fn fill(&mut self, vector: IoVecList, iobref: Iobref) {
        self.size = vector.iter().map(IoVec::len).sum();
        self.vector = vector;
        self.iobref = iobref;
        self.ready = true;
        self.faulting = false;
        self.op_errno = Errno::OK;
    }

    /// Drop cached data so the next reader refaults.
    pub(crate) fn reset(&mut self) -> usize {
        let freed = self.size;
        self.size = 0;
        self.ready = false;
        self.vector = IoVecList::new();
        self.iobref = Iobref::new();
        freed
    }

    /// Take the whole waitq, FIFO order preserved.
    pub(crate) fn take_waiters(&mut self) -> VecDeque<Waiter> {
        std::mem::take(&mut self.waitq)
    }

    /// The slice of this page overlapping `[offset, offset+size)`,
    /// clamped to `ia_size`. Empty when there is no overlap.
    pub(crate) fn overlap(
        &self,
        offset: u64,
        size: u64,
        ia_size: u64,
    ) -> (u64, IoVecList) {
        let page_end = (self.offset + self.size as u64).min(ia_size);
        let want_end = offset + size;
        let begin = offset.max(self.offset);
        let end = want_end.min(page_end);
        if begin >= end {
            return (begin, IoVecList::new());
        }
        let mut skip = (begin - self.offset) as usize;
        let mut remaining = (end - begin) as usize;
        let mut out = IoVecList::new();
        for vec in &self.vector {
            if remaining == 0 {
                break;
            }
            let len = vec.len();
            if skip >= len {
                skip -= len;
                continue;
            }
            let take = (len - skip).min(remaining);
            out.push(vec.subrange(skip, take));
            skip = 0;
            remaining -= take;
        }
        (begin, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iobuf::IoBuf;
    use crate::iobuf::iov_concat;

    fn page_with(offset: u64, data: &[u8]) -> Page {
        let mut page = Page::new(offset);
        let buf = IoBuf::from_vec(data.to_vec());
        let mut iobref = Iobref::new();
        iobref.add(&buf);
        let mut vector = IoVecList::new();
        vector.push(IoVec::whole(buf));
        page.fill(vector, iobref);
        page
    }

    #[test]
    fn overlap_clamps_to_request_and_eof() {
        let page = page_with(100, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        // middle of the page
        let (begin, vecs) = page.overlap(103, 4, u64::MAX);
        assert_eq!(begin, 103);
        assert_eq!(iov_concat(&vecs), vec![4, 5, 6, 7]);

        // request beyond page end is clamped
        let (_, vecs) = page.overlap(108, 100, u64::MAX);
        assert_eq!(iov_concat(&vecs), vec![9, 10]);

        // EOF inside the page trims the tail
        let (_, vecs) = page.overlap(100, 10, 105);
        assert_eq!(iov_concat(&vecs), vec![1, 2, 3, 4, 5]);

        // disjoint request yields nothing
        let (_, vecs) = page.overlap(0, 50, u64::MAX);
        assert!(vecs.is_empty());
    }

    #[test]
    fn reset_clears_data_but_keeps_waiters() {
        let mut page = page_with(0, &[1, 2, 3]);
        page.wait(
            crate::frame::CallFrame::new(
                crate::frame::CallRoot::new(),
                crate::fop::FopKind::Readv,
                |_r| {},
            ),
            0,
            3,
        );
        let freed = page.reset();
        assert_eq!(freed, 3);
        assert!(!page.ready);
        assert_eq!(page.waitq.len(), 1);
    }
}
