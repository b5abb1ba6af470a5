//! Inode handles and the per-graph inode table.
//!
//! An inode is shared by everything that resolved it; translators hang
//! private state off it through named context slots. Dropping the last
//! table reference runs the graph's forget callbacks so each translator
//! can tear its context down (the bd backend drops its cached LV iatt,
//! the cache drops its page table, upcall frees its client registry).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::gfid::Gfid;
use crate::iatt::IaType;

type CtxMap = HashMap<&'static str, Arc<dyn Any + Send + Sync>>;

/// A shared file identity.
#[derive(Default)]
pub struct Inode {
    state: Mutex<InodeState>,
    ctx: Mutex<CtxMap>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Inode")
            .field("gfid", &st.gfid)
            .field("ia_type", &st.ia_type)
            .field("contexts", &self.ctx.lock().len())
            .finish()
    }
}

#[derive(Debug, Default)]
struct InodeState {
    gfid: Gfid,
    ia_type: IaType,
}

impl Inode {
    /// A fresh unlinked inode.
    pub fn new(gfid: Gfid, ia_type: IaType) -> Arc<Inode> {
        Arc::new(Inode {
            state: Mutex::new(InodeState { gfid, ia_type }),
            ctx: Mutex::new(HashMap::new()),
        })
    }

    /// The inode's gfid.
    pub fn gfid(&self) -> Gfid {
        self.state.lock().gfid
    }

    /// The inode's file type.
    pub fn ia_type(&self) -> IaType {
        self.state.lock().ia_type
    }

    /// Bind identity discovered at lookup time.
    pub fn link(&self, gfid: Gfid, ia_type: IaType) {
        let mut st = self.state.lock();
        st.gfid = gfid;
        st.ia_type = ia_type;
    }

    /// Store a translator's context under its name.
    pub fn ctx_set(
        &self,
        key: &'static str,
        value: Arc<dyn Any + Send + Sync>,
    ) {
        self.ctx.lock().insert(key, value);
    }

    /// Fetch a translator's context, downcast to its concrete type.
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

    /// Remove a translator's context.
    pub fn ctx_del(&self, key: &'static str) {
        self.ctx.lock().remove(key);
    }
}

/// Callback run for each inode the table forgets.
pub type ForgetCbk = Box<dyn Fn(&Arc<Inode>) + Send + Sync>;

/// The gfid -> inode binding for one translator graph.
#[derive(Default)]
pub struct InodeTable {
    inodes: Mutex<HashMap<Gfid, Arc<Inode>>>,
    on_forget: Mutex<Vec<ForgetCbk>>,
}

impl InodeTable {
    /// New empty table.
    pub fn new() -> Arc<InodeTable> {
        Arc::new(InodeTable::default())
    }

    /// Register a forget callback. The graph wires one per translator.
    pub fn register_forget(&self, cbk: ForgetCbk) {
        self.on_forget.lock().push(cbk);
    }

    /// Look up a live inode by gfid.
    pub fn find(&self, gfid: Gfid) -> Option<Arc<Inode>> {
        self.inodes.lock().get(&gfid).cloned()
    }

    /// Find or create the inode for `gfid`, linking its type.
    pub fn resolve(&self, gfid: Gfid, ia_type: IaType) -> Arc<Inode> {
        let mut map = self.inodes.lock();
        if let Some(inode) = map.get(&gfid) {
            inode.link(gfid, ia_type);
            return inode.clone();
        }
        let inode = Inode::new(gfid, ia_type);
        map.insert(gfid, inode.clone());
        inode
    }

    /// Number of live inodes.
    pub fn len(&self) -> usize {
        self.inodes.lock().len()
    }

    /// True when the table holds no inodes.
    pub fn is_empty(&self) -> bool {
        self.inodes.lock().is_empty()
    }

    /// Drop the table's binding and run every forget callback.
    pub fn forget(&self, gfid: Gfid) {
        let inode = self.inodes.lock().remove(&gfid);
        if let Some(inode) = inode {
            for cbk in self.on_forget.lock().iter() {
                cbk(&inode);
            }
        }
    }
}

impl std::fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeTable")
            .field("inodes", &self.inodes.lock().len())
            .finish()
    }
}
