//! File attributes as they travel through the translator stack.

use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bitflags::bitflags;

use crate::gfid::Gfid;

/// Kind of file.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum IaType {
    /// Unknown / uninitialized.
    #[default]
    Invalid,
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Block device.
    BlockDevice,
    /// Character device.
    CharDevice,
    /// Named pipe.
    Fifo,
    /// Unix domain socket.
    Socket,
}

impl IaType {
    /// Convert from a stat(2) mode.
    pub fn from_mode(mode: libc::mode_t) -> IaType {
        match mode & libc::S_IFMT {
            libc::S_IFREG => IaType::Regular,
            libc::S_IFDIR => IaType::Directory,
            libc::S_IFLNK => IaType::Symlink,
            libc::S_IFBLK => IaType::BlockDevice,
            libc::S_IFCHR => IaType::CharDevice,
            libc::S_IFIFO => IaType::Fifo,
            libc::S_IFSOCK => IaType::Socket,
            _ => IaType::Invalid,
        }
    }
}

/// A second/nanosecond timestamp pair.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct IattTime {
    /// Seconds since the epoch.
    pub sec: i64,
    /// Nanosecond remainder.
    pub nsec: u32,
}

impl IattTime {
    /// Current wall time.
    pub fn now() -> IattTime {
        IattTime::from(SystemTime::now())
    }

    /// True if both components are zero (an unset server time, which
    /// freshness comparison must not treat as a match).
    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

impl From<SystemTime> for IattTime {
    fn from(t: SystemTime) -> IattTime {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => IattTime {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                IattTime {
                    sec: -(d.as_secs() as i64),
                    nsec: d.subsec_nanos(),
                }
            }
        }
    }
}

impl From<IattTime> for SystemTime {
    fn from(t: IattTime) -> SystemTime {
        if t.sec >= 0 {
            UNIX_EPOCH + Duration::new(t.sec as u64, t.nsec)
        } else {
            UNIX_EPOCH - Duration::new((-t.sec) as u64, t.nsec)
        }
    }
}

bitflags! {
    /// Which fields of an [`Iatt`] a setattr carries.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct IattValid: u32 {
        /// Permission bits.
        const MODE = 1 << 0;
        /// Owner uid.
        const UID = 1 << 1;
        /// Owner gid.
        const GID = 1 << 2;
        /// File size.
        const SIZE = 1 << 3;
        /// Access time.
        const ATIME = 1 << 4;
        /// Modification time.
        const MTIME = 1 << 5;
        /// Change time.
        const CTIME = 1 << 6;
    }
}

/// File attributes.
///
/// The shape every stat-like reply carries. For bd-bound inodes `ia_size`
/// and `ia_blocks` describe the logical volume, not the posix placeholder.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Iatt {
    /// File id.
    pub ia_gfid: Gfid,
    /// Kind of file.
    pub ia_type: IaType,
    /// Size in bytes.
    pub ia_size: u64,
    /// Allocated 512-byte blocks.
    pub ia_blocks: u64,
    /// Preferred I/O block size.
    pub ia_blksize: u32,
    /// Permission bits (no format bits).
    pub ia_prot: u32,
    /// Hard link count.
    pub ia_nlink: u32,
    /// Owner uid.
    pub ia_uid: u32,
    /// Owner gid.
    pub ia_gid: u32,
    /// Device number for device nodes.
    pub ia_rdev: u64,
    /// Last access.
    pub ia_atime: IattTime,
    /// Last modification.
    pub ia_mtime: IattTime,
    /// Last status change.
    pub ia_ctime: IattTime,
}

impl Iatt {
    /// Build from a stat(2) buffer.
    pub fn from_stat(st: &libc::stat) -> Iatt {
        Iatt {
            ia_gfid: Gfid::NULL,
            ia_type: IaType::from_mode(st.st_mode),
            ia_size: st.st_size as u64,
            ia_blocks: st.st_blocks as u64,
            ia_blksize: st.st_blksize as u32,
            ia_prot: (st.st_mode & 0o7777) as u32,
            ia_nlink: st.st_nlink as u32,
            ia_uid: st.st_uid,
            ia_gid: st.st_gid,
            ia_rdev: st.st_rdev as u64,
            ia_atime: IattTime {
                sec: st.st_atime,
                nsec: st.st_atime_nsec as u32,
            },
            ia_mtime: IattTime {
                sec: st.st_mtime,
                nsec: st.st_mtime_nsec as u32,
            },
            ia_ctime: IattTime {
                sec: st.st_ctime,
                nsec: st.st_ctime_nsec as u32,
            },
        }
    }

    /// Apply the fields selected by `valid` from `src`, leaving the rest.
    pub fn apply_valid(&mut self, src: &Iatt, valid: IattValid) {
        if valid.contains(IattValid::MODE) {
            self.ia_prot = src.ia_prot;
        }
        if valid.contains(IattValid::UID) {
            self.ia_uid = src.ia_uid;
        }
        if valid.contains(IattValid::GID) {
            self.ia_gid = src.ia_gid;
        }
        if valid.contains(IattValid::SIZE) {
            self.ia_size = src.ia_size;
        }
        if valid.contains(IattValid::ATIME) {
            self.ia_atime = src.ia_atime;
        }
        if valid.contains(IattValid::MTIME) {
            self.ia_mtime = src.ia_mtime;
        }
        if valid.contains(IattValid::CTIME) {
            self.ia_ctime = src.ia_ctime;
        }
    }
}
