//! Reference-counted data buffers.
//!
//! Read replies travel as lists of `IoVec` views into shared `IoBuf`
//! allocations. A stub capturing a reply clones the `Iobref`, which is
//! a refcount bump per buffer, never a byte copy. The page cache hands the same
//! buffer to every waiter of a page the same way.

use std::sync::Arc;

use smallvec::SmallVec;

/// One shared, immutable buffer allocation.
#[derive(Clone, Debug)]
pub struct IoBuf {
    data: Arc<[u8]>,
}

impl IoBuf {
    /// Take ownership of `data`.
    pub fn from_vec(data: Vec<u8>) -> IoBuf {
        IoBuf { data: data.into() }
    }

    /// A zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> IoBuf {
        IoBuf {
            data: vec![0u8; len].into(),
        }
    }

    /// The whole allocation.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Allocation length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length allocation.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn ptr_eq(&self, other: &IoBuf) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// A byte-range view into an [`IoBuf`].
#[derive(Clone, Debug)]
pub struct IoVec {
    buf: IoBuf,
    offset: usize,
    len: usize,
}

impl IoVec {
    /// View of a whole buffer.
    pub fn whole(buf: IoBuf) -> IoVec {
        let len = buf.len();
        IoVec {
            buf,
            offset: 0,
            len,
        }
    }

    /// View of `buf[offset..offset + len]`. Panics if out of range.
    pub fn slice(buf: IoBuf, offset: usize, len: usize) -> IoVec {
        assert!(offset + len <= buf.len(), "iovec out of buffer range");
        IoVec { buf, offset, len }
    }

    /// Narrow this view. Panics if out of range.
    pub fn subrange(&self, offset: usize, len: usize) -> IoVec {
        assert!(offset + len <= self.len, "subrange out of iovec range");
        IoVec {
            buf: self.buf.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// The viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf.as_slice()[self.offset..self.offset + self.len]
    }

    /// View length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for an empty view.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing buffer.
    pub fn iobuf(&self) -> &IoBuf {
        &self.buf
    }
}

/// The iovec list a read reply travels with. Most replies carry a single
/// segment; four covers the scatter cases without heap allocation.
pub type IoVecList = SmallVec<[IoVec; 4]>;

/// Strong references keeping a reply's buffers alive.
///
/// Frames are released while stubs and cache pages still hold the data;
/// the iobref is what actually pins the allocations.
#[derive(Clone, Debug, Default)]
pub struct Iobref {
    bufs: SmallVec<[IoBuf; 4]>,
}

impl Iobref {
    /// New empty list.
    pub fn new() -> Iobref {
        Iobref::default()
    }

    /// Add a buffer reference, deduplicating by identity.
    pub fn add(&mut self, buf: &IoBuf) {
        if !self.bufs.iter().any(|b| b.ptr_eq(buf)) {
            self.bufs.push(buf.clone());
        }
    }

    /// Merge another iobref into this one.
    pub fn merge(&mut self, other: &Iobref) {
        for buf in &other.bufs {
            self.add(buf);
        }
    }

    /// Number of distinct buffers pinned.
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    /// True when nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }
}

/// Total byte count of an iovec list.
pub fn iov_length(vecs: &[IoVec]) -> usize {
    vecs.iter().map(IoVec::len).sum()
}

/// Flatten an iovec list into one contiguous vector.
pub fn iov_concat(vecs: &[IoVec]) -> Vec<u8> {
    let mut out = Vec::with_capacity(iov_length(vecs));
    for v in vecs {
        out.extend_from_slice(v.as_slice());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_share_the_allocation() {
        let buf = IoBuf::from_vec((0u8..64).collect());
        let a = IoVec::slice(buf.clone(), 0, 16);
        let b = IoVec::slice(buf.clone(), 16, 16);
        assert_eq!(a.as_slice()[15], 15);
        assert_eq!(b.as_slice()[0], 16);
        let narrowed = b.subrange(4, 4);
        assert_eq!(narrowed.as_slice(), &[20, 21, 22, 23]);
    }

    #[test]
    fn iobref_deduplicates() {
        let buf = IoBuf::zeroed(8);
        let mut iobref = Iobref::new();
        iobref.add(&buf);
        iobref.add(&buf);
        assert_eq!(iobref.len(), 1);

        let other = IoBuf::zeroed(8);
        iobref.add(&other);
        assert_eq!(iobref.len(), 2);
    }

    #[test]
    fn concat_preserves_order() {
        let a = IoVec::whole(IoBuf::from_vec(vec![1, 2]));
        let b = IoVec::whole(IoBuf::from_vec(vec![3]));
        let vecs: IoVecList = SmallVec::from_vec(vec![a, b]);
        assert_eq!(iov_length(&vecs), 3);
        assert_eq!(iov_concat(&vecs), vec![1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "out of buffer range")]
    fn out_of_range_slice_panics() {
        let buf = IoBuf::zeroed(4);
        let _ = IoVec::slice(buf, 2, 4);
    }
}
