//! Client registry and expiry reaping for the upcall layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;

use crate::gfid::Gfid;

/// One client that touched an inode recently.
#[derive(Clone, Debug)]
pub(crate) struct UpcallClient {
    /// Wire identity of the client.
    pub client_uid: String,
    /// Last time the client touched the inode.
    pub access_time: Instant,
    /// Seconds the client may cache the entry, echoed in events.
    pub expire_time_attr: u32,
}

/// Per-inode upcall state: the clients to notify.
#[derive(Debug, Default)]
pub(crate) struct UpcallInodeCtx {
    pub clients: Mutex<Vec<UpcallClient>>,
    /// Set at forget; the reaper frees the ctx on its next pass.
    pub destroy: AtomicBool,
}

impl UpcallInodeCtx {
    /// Record (or refresh) the caller in the client list.
    pub(crate) fn touch(&self, client_uid: &str, expire_time_attr: u32) {
        let mut clients = self.clients.lock();
        if let Some(entry) =
            clients.iter_mut().find(|c| c.client_uid == client_uid)
        {
            entry.access_time = Instant::now();
            entry.expire_time_attr = expire_time_attr;
            return;
        }
        clients.push(UpcallClient {
            client_uid: client_uid.to_string(),
            access_time: Instant::now(),
            expire_time_attr,
        });
    }

    /// Clients other than `originator` still inside the notification
    /// window.
    pub(crate) fn recipients(
        &self,
        originator: &str,
        timeout: Duration,
    ) -> Vec<UpcallClient> {
        let clients = self.clients.lock();
        clients
            .iter()
            .filter(|c| c.client_uid != originator)
            .filter(|c| c.access_time.elapsed() < timeout)
            .cloned()
            .collect()
    }

    /// Drop clients idle for more than `2 x timeout`.
    pub(crate) fn expire(&self, timeout: Duration) {
        let mut clients = self.clients.lock();
        let before = clients.len();
        clients.retain(|c| c.access_time.elapsed() <= timeout * 2);
        let dropped = before - clients.len();
        if dropped > 0 {
            debug!("expired {dropped} idle upcall clients");
        }
    }
}

/// All tracked inode contexts plus the reaper controls.
pub(crate) struct UpcallRegistry {
    ctxs: Mutex<HashMap<Gfid, Arc<UpcallInodeCtx>>>,
    fini: AtomicBool,
}

impl UpcallRegistry {
    pub(crate) fn new() -> Arc<UpcallRegistry> {
        Arc::new(UpcallRegistry {
            ctxs: Mutex::new(HashMap::new()),
            fini: AtomicBool::new(false),
        })
    }

    pub(crate) fn get_or_create(&self, gfid: Gfid) -> Arc<UpcallInodeCtx> {
        self.ctxs
            .lock()
            .entry(gfid)
            .or_insert_with(|| Arc::new(UpcallInodeCtx::default()))
            .clone()
    }

    pub(crate) fn find(&self, gfid: Gfid) -> Option<Arc<UpcallInodeCtx>> {
        self.ctxs.lock().get(&gfid).cloned()
    }

    /// Flag a context for destruction; the reaper frees it.
    pub(crate) fn mark_destroy(&self, gfid: Gfid) {
        if let Some(ctx) = self.find(gfid) {
            ctx.destroy.store(true, Ordering::Release);
        }
    }

    pub(crate) fn shutting_down(&self) -> bool {
        self.fini.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown(&self) {
        self.fini.store(true, Ordering::Release);
    }

    /// One reaper pass: expire idle clients, free destroyed contexts.
    pub(crate) fn reap(&self, timeout: Duration) {
        let snapshot: Vec<(Gfid, Arc<UpcallInodeCtx>)> = self
            .ctxs
            .lock()
            .iter()
            .map(|(g, c)| (*g, c.clone()))
            .collect();
        let mut dead = Vec::new();
        for (gfid, ctx) in snapshot {
            ctx.expire(timeout);
            if ctx.destroy.load(Ordering::Acquire) {
                dead.push(gfid);
            }
        }
        if !dead.is_empty() {
            let mut ctxs = self.ctxs.lock();
            for gfid in dead {
                ctxs.remove(&gfid);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ctxs.lock().len()
    }
}

/// Run the reaper until shutdown: wake every `timeout / 2` (floor one
/// second), expire and collect.
pub(crate) fn reaper_loop(registry: Arc<UpcallRegistry>, timeout_secs: u32) {
    let timeout = Duration::from_secs(timeout_secs.max(1) as u64);
    let nap = Duration::from_secs((timeout_secs / 2).max(1) as u64);
    while !registry.shutting_down() {
        std::thread::sleep(nap);
        if registry.shutting_down() {
            break;
        }
        registry.reap(timeout);
    }
    debug!("upcall reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_updates_in_place() {
        let ctx = UpcallInodeCtx::default();
        ctx.touch("client-a", 30);
        ctx.touch("client-a", 45);
        let clients = ctx.clients.lock();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].expire_time_attr, 45);
    }

    #[test]
    fn recipients_exclude_the_originator() {
        let ctx = UpcallInodeCtx::default();
        ctx.touch("client-a", 30);
        ctx.touch("client-b", 30);
        let got = ctx.recipients("client-a", Duration::from_secs(60));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].client_uid, "client-b");
    }

    #[test]
    fn reap_frees_destroyed_contexts() {
        let registry = UpcallRegistry::new();
        let gfid = Gfid::generate();
        registry.get_or_create(gfid);
        assert_eq!(registry.len(), 1);

        registry.mark_destroy(gfid);
        registry.reap(Duration::from_secs(60));
        assert_eq!(registry.len(), 0);
    }
}
