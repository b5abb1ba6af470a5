//! Operation status codes.
//!
//! FOP replies carry a raw OS error code alongside the payload, because a
//! successful reply may still need the errno slot (readv signals EOF with
//! `ENOENT` next to a positive byte count). `Errno` keeps that code a
//! first-class value instead of a bare integer.

use std::fmt;
use std::io;

/// A raw OS error code. Zero means "no error".
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Errno(pub i32);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        $(
            #[allow(missing_docs)]
            pub const $name: Errno = Errno(libc::$name);
        )*
    };
}

impl Errno {
    /// No error.
    pub const OK: Errno = Errno(0);

    errno_consts!(
        EPERM, ENOENT, EINTR, EIO, EBADF, EAGAIN, ENOMEM, EACCES, EBUSY,
        EEXIST, EXDEV, ENODEV, ENOTDIR, EISDIR, EINVAL, ENOTTY, EFBIG,
        ENOSPC, EROFS, EMLINK, ERANGE, ENAMETOOLONG, ENOSYS, ENOTEMPTY,
        ENODATA, EOPNOTSUPP, ENOTSUP, ETIMEDOUT, ESTALE, ECANCELED,
    );

    /// The raw code.
    pub fn code(self) -> i32 {
        self.0
    }

    /// True if this is the "no error" value.
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Last OS error of the calling thread.
    pub fn last() -> Errno {
        Errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "0 (ok)");
        }
        write!(f, "{} ({})", self.0, io::Error::from_raw_os_error(self.0))
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Errno {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<nix::errno::Errno> for Errno {
    fn from(err: nix::errno::Errno) -> Errno {
        Errno(err as i32)
    }
}

impl From<Errno> for io::Error {
    fn from(errno: Errno) -> io::Error {
        io::Error::from_raw_os_error(errno.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_io_error() {
        let e: io::Error = Errno::ENOENT.into();
        assert_eq!(Errno::from(e), Errno::ENOENT);
    }

    #[test]
    fn ok_is_distinguished() {
        assert!(Errno::OK.is_ok());
        assert!(!Errno::EIO.is_ok());
        assert_eq!(Errno::default(), Errno::OK);
    }
}
