//! Open-file handles.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::inode::Inode;

type CtxMap = HashMap<&'static str, Arc<dyn Any + Send + Sync>>;

/// A shared open-file handle, bound to one inode plus the open flags.
///
/// Like inodes, fds carry named per-translator context slots (the bd
/// backend keeps its device fd and O_DIRECT state there, posix its raw
/// fd). The graph's `release` pass runs when the client closes the
/// handle.
pub struct Fd {
    inode: Arc<Inode>,
    flags: i32,
    ctx: Mutex<CtxMap>,
}

impl std::fmt::Debug for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fd")
            .field("gfid", &self.inode.gfid())
            .field("flags", &self.flags)
            .field("contexts", &self.ctx.lock().len())
            .finish()
    }
}

impl Fd {
    /// A handle on `inode` opened with `flags` (open(2) bits).
    pub fn new(inode: Arc<Inode>, flags: i32) -> Arc<Fd> {
        Arc::new(Fd {
            inode,
            flags,
            ctx: Mutex::new(HashMap::new()),
        })
    }

    /// The inode this handle is bound to.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// The open(2) flags the handle was created with.
    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Store a translator's per-fd context under its name.
    pub fn ctx_set(
        &self,
        key: &'static str,
        value: Arc<dyn Any + Send + Sync>,
    ) {
        self.ctx.lock().insert(key, value);
    }

    /// Fetch a translator's per-fd context.
    pub fn ctx_get<T: Any + Send + Sync>(
        &self,
        key: &'static str,
    ) -> Option<Arc<T>> {
        self.ctx
            .lock()
            .get(key)
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Remove a translator's per-fd context.
    pub fn ctx_del(&self, key: &'static str) {
        self.ctx.lock().remove(key);
    }
}
