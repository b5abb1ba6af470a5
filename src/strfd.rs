//! An in-memory "file" for building text incrementally.
//!
//! Status and introspection handlers print into one of these instead of
//! a real fd; the buffer grows as written and reads back as one string.

use std::fmt;
use std::io;

/// A growable in-memory write target.
#[derive(Debug, Default)]
pub struct StrFd {
    data: Vec<u8>,
}

/// Initial allocation once the first write lands.
const FIRST_ALLOC: usize = 4096;

impl StrFd {
    /// An empty buffer; no allocation until the first write.
    pub fn new() -> StrFd {
        StrFd::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True before the first write.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The accumulated bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The accumulated text, if it is UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Hand the buffer over.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn reserve_for(&mut self, incoming: usize) {
        if self.data.capacity() == 0 {
            self.data.reserve(FIRST_ALLOC.max(incoming));
        } else {
            self.data.reserve(incoming);
        }
    }
}

impl fmt::Write for StrFd {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.reserve_for(s.len());
        self.data.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

impl io::Write for StrFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.reserve_for(buf.len());
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_formatted_text() {
        use std::fmt::Write as _;

        let mut out = StrFd::new();
        assert!(out.is_empty());
        write!(out, "lv {} of {} bytes", "volume-0", 4096).unwrap();
        writeln!(out, ", thin").unwrap();
        assert_eq!(
            out.as_str(),
            Some("lv volume-0 of 4096 bytes, thin\n")
        );
        assert_eq!(out.len(), out.as_bytes().len());
    }

    #[test]
    fn io_write_appends_bytes() {
        use std::io::Write as _;

        let mut out = StrFd::new();
        out.write_all(b"abc").unwrap();
        out.write_all(b"def").unwrap();
        assert_eq!(out.into_bytes(), b"abcdef");
    }
}
