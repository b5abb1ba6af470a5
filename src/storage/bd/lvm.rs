//! Volume-group plumbing for the bd backend.
//!
//! The backend talks to LVM through the [`Lvm`] trait so the syscall-free
//! parts of bd stay testable. The production implementation drives the
//! lvm2 command-line tools; sizes are always byte-denominated
//! (`--units b --nosuffix`) to keep parsing trivial.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Command;

use log::debug;
use log::warn;

use crate::errno::Errno;

/// VG capacity snapshot for statfs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VgSpace {
    /// Total bytes in the VG.
    pub size: u64,
    /// Unallocated bytes.
    pub free: u64,
}

/// Failures of volume-group operations, pre-mapped to the status codes
/// the FOP layer reports.
#[derive(Debug)]
pub enum LvmError {
    /// LV already exists (create).
    Exists,
    /// VG or LV not found.
    NotFound,
    /// Not enough free extents.
    NoSpace,
    /// A thin LV was requested but the VG carries no thin pool.
    NoThinPool,
    /// Anything else the tools reported.
    Io(io::Error),
}

impl LvmError {
    /// The status code a FOP reply carries for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            LvmError::Exists => Errno::EEXIST,
            LvmError::NotFound => Errno::ENOENT,
            LvmError::NoSpace => Errno::ENOSPC,
            LvmError::NoThinPool => Errno::EOPNOTSUPP,
            LvmError::Io(e) => {
                e.raw_os_error().map(Errno).unwrap_or(Errno::EIO)
            }
        }
    }
}

impl fmt::Display for LvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LvmError::Exists => write!(f, "logical volume exists"),
            LvmError::NotFound => write!(f, "volume group or LV not found"),
            LvmError::NoSpace => write!(f, "insufficient free extents"),
            LvmError::NoThinPool => write!(f, "no thin pool in volume group"),
            LvmError::Io(e) => write!(f, "lvm command failed: {e}"),
        }
    }
}

impl std::error::Error for LvmError {}

impl From<io::Error> for LvmError {
    fn from(e: io::Error) -> LvmError {
        LvmError::Io(e)
    }
}

/// Operations the bd backend needs from a volume group.
pub trait Lvm: Send + Sync {
    /// The VG's tags.
    fn vg_tags(&self) -> io::Result<Vec<String>>;
    /// Extent size in bytes; LV sizes round up to this.
    fn extent_size(&self) -> io::Result<u64>;
    /// Capacity snapshot.
    fn vg_space(&self) -> io::Result<VgSpace>;
    /// Name of a thin pool in the VG, if one exists.
    fn thin_pool(&self) -> io::Result<Option<String>>;
    /// Size of an LV in bytes.
    fn lv_size(&self, lv: &str) -> io::Result<u64>;
    /// The `origin` property of an LV (set for snapshots).
    fn lv_origin(&self, lv: &str) -> io::Result<Option<String>>;
    /// True when the LV exists.
    fn lv_exists(&self, lv: &str) -> bool {
        self.lv_size(lv).is_ok()
    }
    /// Create an LV of at least `size` bytes; thin LVs allocate from the
    /// pool. Returns the actual (extent-rounded) size.
    fn create_lv(&self, lv: &str, size: u64, thin: bool)
    -> Result<u64, LvmError>;
    /// Grow an LV to at least `size` bytes; returns the actual size.
    fn resize_lv(&self, lv: &str, size: u64) -> Result<u64, LvmError>;
    /// Remove an LV.
    fn delete_lv(&self, lv: &str) -> Result<(), LvmError>;
    /// Create `snap` as a snapshot of `origin`. Returns the snapshot
    /// size.
    fn snapshot_lv(
        &self,
        origin: &str,
        snap: &str,
        size: u64,
    ) -> Result<u64, LvmError>;
    /// Merge a snapshot back into its origin; the snapshot LV is gone
    /// afterwards.
    fn merge_lv(&self, snap: &str) -> Result<(), LvmError>;
    /// Device node for an LV.
    fn device_path(&self, lv: &str) -> PathBuf;
}

/// Round `size` up to a multiple of `extent` (minimum one extent).
pub fn round_to_extent(size: u64, extent: u64) -> u64 {
    if extent == 0 {
        return size;
    }
    match size.div_ceil(extent) {
        0 => extent,
        n => n * extent,
    }
}

/// The lvm2 CLI driver.
pub struct LvmCli {
    vg: String,
}

impl LvmCli {
    /// Bind to volume group `vg`.
    pub fn new(vg: &str) -> LvmCli {
        LvmCli { vg: vg.to_string() }
    }

    fn query(
        &self,
        tool: &str,
        field: &str,
        target: &str,
    ) -> io::Result<String> {
        let out = Command::new(tool)
            .args([
                "--noheadings",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                field,
                target,
            ])
            .output()?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            debug!("{tool} -o {field} {target}: {}", stderr.trim());
            return Err(io::Error::other(stderr.into_owned()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn change(&self, tool: &str, args: &[&str]) -> Result<(), LvmError> {
        debug!("{tool} {}", args.join(" "));
        let out = Command::new(tool).args(args).output()?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        warn!("{tool} failed: {}", stderr.trim());
        let lowered = stderr.to_lowercase();
        if lowered.contains("already exists") {
            Err(LvmError::Exists)
        } else if lowered.contains("not found") {
            Err(LvmError::NotFound)
        } else if lowered.contains("insufficient") && lowered.contains("free")
        {
            Err(LvmError::NoSpace)
        } else {
            Err(LvmError::Io(io::Error::other(stderr)))
        }
    }

    fn lv_target(&self, lv: &str) -> String {
        format!("{}/{}", self.vg, lv)
    }
}

impl Lvm for LvmCli {
    fn vg_tags(&self) -> io::Result<Vec<String>> {
        let raw = self.query("vgs", "tags", &self.vg)?;
        Ok(raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect())
    }

    fn extent_size(&self) -> io::Result<u64> {
        self.query("vgs", "vg_extent_size", &self.vg)?
            .parse()
            .map_err(|e| io::Error::other(format!("bad extent size: {e}")))
    }

    fn vg_space(&self) -> io::Result<VgSpace> {
        let raw = self.query("vgs", "vg_size,vg_free", &self.vg)?;
        let mut fields = raw.split_whitespace();
        let parse = |s: Option<&str>| -> io::Result<u64> {
            s.unwrap_or("")
                .parse()
                .map_err(|e| io::Error::other(format!("bad vg size: {e}")))
        };
        Ok(VgSpace {
            size: parse(fields.next())?,
            free: parse(fields.next())?,
        })
    }

    fn thin_pool(&self) -> io::Result<Option<String>> {
        // one line per LV: "<name> <segtype>"
        let raw = self.query("lvs", "lv_name,segtype", &self.vg)?;
        for line in raw.lines() {
            let mut fields = line.split_whitespace();
            let (Some(name), Some(segtype)) = (fields.next(), fields.next())
            else {
                continue;
            };
            if segtype == "thin-pool" {
                return Ok(Some(name.to_string()));
            }
        }
        Ok(None)
    }

    fn lv_size(&self, lv: &str) -> io::Result<u64> {
        self.query("lvs", "lv_size", &self.lv_target(lv))?
            .parse()
            .map_err(|e| io::Error::other(format!("bad lv size: {e}")))
    }

    fn lv_origin(&self, lv: &str) -> io::Result<Option<String>> {
        let raw = self.query("lvs", "origin", &self.lv_target(lv))?;
        Ok((!raw.is_empty()).then(|| raw))
    }

    fn create_lv(
        &self,
        lv: &str,
        size: u64,
        thin: bool,
    ) -> Result<u64, LvmError> {
        let size_arg = format!("{size}b");
        if thin {
            let pool = self.thin_pool()?.ok_or(LvmError::NoThinPool)?;
            let pool_target = format!("{}/{}", self.vg, pool);
            self.change(
                "lvcreate",
                &["-V", &size_arg, "-T", &pool_target, "-n", lv],
            )?;
        } else {
            self.change("lvcreate", &["-L", &size_arg, "-n", lv, &self.vg])?;
        }
        Ok(self.lv_size(lv)?)
    }

    fn resize_lv(&self, lv: &str, size: u64) -> Result<u64, LvmError> {
        let size_arg = format!("{size}b");
        let target = self.lv_target(lv);
        self.change("lvresize", &["-f", "-L", &size_arg, &target])?;
        Ok(self.lv_size(lv)?)
    }

    fn delete_lv(&self, lv: &str) -> Result<(), LvmError> {
        let target = self.lv_target(lv);
        self.change("lvremove", &["-f", &target])
    }

    fn snapshot_lv(
        &self,
        origin: &str,
        snap: &str,
        size: u64,
    ) -> Result<u64, LvmError> {
        let size_arg = format!("{size}b");
        let origin_dev = self.device_path(origin);
        let origin_dev = origin_dev.to_string_lossy();
        self.change(
            "lvcreate",
            &["--snapshot", "--name", snap, "-L", &size_arg, &origin_dev],
        )?;
        Ok(self.lv_size(snap)?)
    }

    fn merge_lv(&self, snap: &str) -> Result<(), LvmError> {
        let target = self.lv_target(snap);
        self.change("lvconvert", &["--merge", &target])
    }

    fn device_path(&self, lv: &str) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.vg, lv))
    }
}

impl fmt::Debug for LvmCli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LvmCli").field("vg", &self.vg).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_snaps_to_extent_granularity() {
        let m = 4 * 1024 * 1024;
        assert_eq!(round_to_extent(1, m), m);
        assert_eq!(round_to_extent(m, m), m);
        assert_eq!(round_to_extent(m + 1, m), 2 * m);
        assert_eq!(round_to_extent(0, m), m);
        assert_eq!(round_to_extent(123, 0), 123);
    }

    #[test]
    fn error_mapping_matches_the_fop_contract() {
        assert_eq!(LvmError::Exists.errno(), Errno::EEXIST);
        assert_eq!(LvmError::NotFound.errno(), Errno::ENOENT);
        assert_eq!(LvmError::NoSpace.errno(), Errno::ENOSPC);
        assert_eq!(LvmError::NoThinPool.errno(), Errno::EOPNOTSUPP);
    }

    #[test]
    fn fake_vg_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let vg = fake::FakeLvm::new(dir.path().to_path_buf(), 4096);

        let size = vg.create_lv("a", 5000, false).unwrap();
        assert_eq!(size, 8192);
        assert!(vg.lv_exists("a"));
        assert_eq!(vg.lv_size("a").unwrap(), 8192);

        assert!(matches!(
            vg.create_lv("a", 1, false),
            Err(LvmError::Exists)
        ));
        assert!(matches!(
            vg.create_lv("t", 1, true),
            Err(LvmError::NoThinPool)
        ));

        let grown = vg.resize_lv("a", 10000).unwrap();
        assert_eq!(grown, 12288);

        vg.delete_lv("a").unwrap();
        assert!(!vg.lv_exists("a"));
        assert!(matches!(vg.delete_lv("a"), Err(LvmError::NotFound)));
    }

    #[test]
    fn fake_snapshot_and_merge_track_origin() {
        let dir = tempfile::tempdir().unwrap();
        let vg = fake::FakeLvm::new(dir.path().to_path_buf(), 4096);
        vg.create_lv("orig", 4096, false).unwrap();
        std::fs::write(vg.device_path("orig"), b"live data").unwrap();
        vg.backing_file("orig", 4096).unwrap();

        vg.snapshot_lv("orig", "snap", 0).unwrap();
        assert_eq!(vg.lv_origin("snap").unwrap().as_deref(), Some("orig"));

        // diverge the origin, then merge the snapshot back
        std::fs::write(vg.device_path("orig"), b"overwritten").unwrap();
        vg.merge_lv("snap").unwrap();
        assert!(!vg.lv_exists("snap"));
        let merged = std::fs::read(vg.device_path("orig")).unwrap();
        assert_eq!(&merged[..9], b"live data");
    }
}
