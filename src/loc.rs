//! Directory-relative file addressing.

use std::path::PathBuf;

use crate::gfid::Gfid;
use crate::inode::Inode;
use std::sync::Arc;

/// Where a path-addressed FOP points.
///
/// Carries both name-relative identity (parent gfid + basename) and
/// resolved identity (target inode + gfid) so translators can work with
/// whichever is known at their layer. Cloning is a deep copy of the path
/// parts; the inode handle stays shared.
#[derive(Clone, Debug, Default)]
pub struct Loc {
    /// Gfid of the parent directory, when known.
    pub pargfid: Gfid,
    /// Final path component, when known.
    pub name: Option<String>,
    /// Full path from the export root, when known.
    pub path: Option<PathBuf>,
    /// Resolved target inode, when known.
    pub inode: Option<Arc<Inode>>,
    /// Gfid of the target, when known.
    pub gfid: Gfid,
}

impl Loc {
    /// A loc addressing `path` with nothing resolved yet.
    pub fn from_path<P: Into<PathBuf>>(path: P) -> Loc {
        Loc {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// The basename, from `name` or the trailing path component.
    pub fn basename(&self) -> Option<&str> {
        if let Some(name) = &self.name {
            return Some(name);
        }
        self.path.as_deref().and_then(|p| p.file_name()?.to_str())
    }

    /// The effective target gfid: the explicit one, else the inode's.
    pub fn target_gfid(&self) -> Gfid {
        if !self.gfid.is_null() {
            return self.gfid;
        }
        self.inode.as_ref().map(|i| i.gfid()).unwrap_or(Gfid::NULL)
    }
}
