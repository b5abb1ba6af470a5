//! Call frames.
//!
//! A frame is the runtime context one FOP carries down the stack and its
//! reply carries back up. The reply slot is consume-once: either the
//! request logic delivers exactly one reply, or the last frame reference
//! dropping delivers an `EIO` error so no caller waits forever.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use log::error;
use log::warn;
use parking_lot::Mutex;

use crate::errno::Errno;
use crate::fop::FopKind;
use crate::fop::Reply;
use crate::xlator::XlatorRef;

static NEXT_UNIQUE: AtomicU64 = AtomicU64::new(1);

/// Identity shared by every frame of one client request.
#[derive(Debug)]
pub struct CallRoot {
    /// Process-unique request id.
    pub unique: u64,
    /// Time of arrival at the stack.
    pub received_at: SystemTime,
    /// Caller uid.
    pub uid: u32,
    /// Caller gid.
    pub gid: u32,
    /// Caller pid.
    pub pid: u32,
    /// Identity of the remote client, when the request came over the
    /// wire. The upcall layer keys its registry on this.
    pub client_uid: Option<String>,
}

impl CallRoot {
    /// A root for a locally-originated request.
    pub fn new() -> Arc<CallRoot> {
        CallRoot::with_client(None)
    }

    /// A root carrying a remote client identity.
    pub fn with_client(client_uid: Option<String>) -> Arc<CallRoot> {
        Arc::new(CallRoot {
            unique: NEXT_UNIQUE.fetch_add(1, Ordering::Relaxed),
            received_at: SystemTime::now(),
            uid: 0,
            gid: 0,
            pid: std::process::id(),
            client_uid,
        })
    }
}

type ReplyFn = Box<dyn FnOnce(Reply) + Send>;

struct FrameInner {
    root: Arc<CallRoot>,
    kind: FopKind,
    this: Mutex<Option<XlatorRef>>,
    reply: Mutex<Option<ReplyFn>>,
    local: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// One hop's view of an in-flight FOP.
///
/// Cheap to clone; clones share the reply slot, the scratch slot and the
/// root. Any thread holding a clone may deliver the reply.
#[derive(Clone)]
pub struct CallFrame {
    inner: Arc<FrameInner>,
}

impl CallFrame {
    /// A frame for one `kind` call, delivering its reply to `on_reply`.
    pub fn new<F>(root: Arc<CallRoot>, kind: FopKind, on_reply: F) -> CallFrame
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        CallFrame {
            inner: Arc::new(FrameInner {
                root,
                kind,
                this: Mutex::new(None),
                reply: Mutex::new(Some(Box::new(on_reply))),
                local: Mutex::new(None),
            }),
        }
    }

    /// The shared request identity.
    pub fn root(&self) -> &Arc<CallRoot> {
        &self.inner.root
    }

    /// The FOP kind this frame was created for.
    pub fn kind(&self) -> FopKind {
        self.inner.kind
    }

    /// The translator currently holding the frame.
    pub fn this(&self) -> Option<XlatorRef> {
        self.inner.this.lock().clone()
    }

    /// Record the translator now holding the frame.
    pub fn set_this(&self, xl: XlatorRef) {
        *self.inner.this.lock() = Some(xl);
    }

    /// Deliver the reply. A second call is a logged error and a no-op;
    /// a FOP completes exactly once.
    pub fn unwind(&self, reply: Reply) {
        let Some(sender) = self.inner.reply.lock().take() else {
            error!(
                "duplicate reply for {} (unique {})",
                self.inner.kind, self.inner.root.unique
            );
            return;
        };
        sender(reply);
    }

    /// Deliver an error reply built from this frame's kind.
    pub fn unwind_error(&self, op_errno: Errno) {
        self.unwind(Reply::error(self.inner.kind, op_errno));
    }

    /// True while the reply has not yet been delivered.
    pub fn pending(&self) -> bool {
        self.inner.reply.lock().is_some()
    }

    /// Store the per-frame scratch value.
    pub fn local_set(&self, value: Arc<dyn Any + Send + Sync>) {
        *self.inner.local.lock() = Some(value);
    }

    /// Fetch the scratch value, downcast.
    pub fn local_get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .local
            .lock()
            .clone()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Clear and return the scratch value.
    pub fn local_take(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.local.lock().take()
    }
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        // Mirrors the reply-handler guarantee: a frame abandoned without
        // a reply still answers its caller.
        if let Some(sender) = self.reply.get_mut().take() {
            warn!(
                "no reply sent for {} (unique {}), replying with I/O error",
                self.kind, self.root.unique
            );
            sender(Reply::error(self.kind, Errno::EIO));
        }
    }
}

impl std::fmt::Debug for CallFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallFrame")
            .field("unique", &self.inner.root.unique)
            .field("kind", &self.inner.kind)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fop::FopReply;
    use std::sync::mpsc;

    #[test]
    fn unwind_delivers_exactly_once() {
        let (tx, rx) = mpsc::channel();
        let frame = CallFrame::new(CallRoot::new(), FopKind::Flush, move |r| {
            tx.send(r).unwrap();
        });
        frame.unwind(Reply::ok(FopReply::Flush { xdata: None }));
        frame.unwind(Reply::ok(FopReply::Flush { xdata: None }));
        assert!(rx.recv().unwrap().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_frame_answers_with_eio() {
        let (tx, rx) = mpsc::channel();
        {
            let _frame =
                CallFrame::new(CallRoot::new(), FopKind::Stat, move |r| {
                    tx.send(r).unwrap();
                });
        }
        let reply = rx.recv().unwrap();
        assert!(!reply.is_ok());
        assert_eq!(reply.op_errno, Errno::EIO);
    }

    #[test]
    fn clones_share_the_reply_slot() {
        let (tx, rx) = mpsc::channel();
        let frame = CallFrame::new(CallRoot::new(), FopKind::Stat, move |r| {
            tx.send(r).unwrap();
        });
        let clone = frame.clone();
        assert!(clone.pending());
        clone.unwind_error(Errno::ENOENT);
        assert!(!frame.pending());
        assert_eq!(rx.recv().unwrap().op_errno, Errno::ENOENT);
    }

    #[test]
    fn local_slot_downcasts() {
        let frame =
            CallFrame::new(CallRoot::new(), FopKind::Readv, |_reply| {});
        frame.local_set(Arc::new(String::from("state")));
        assert_eq!(
            frame.local_get::<String>().as_deref().map(String::as_str),
            Some("state")
        );
        assert!(frame.local_get::<u32>().is_none());
        frame.local_take();
        assert!(frame.local_get::<String>().is_none());
    }

    #[test]
    fn roots_get_unique_ids() {
        assert_ne!(CallRoot::new().unique, CallRoot::new().unique);
    }
}
