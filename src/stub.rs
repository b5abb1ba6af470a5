//! Call stubs: FOP calls and replies as first-class values.
//!
//! A translator that wants to defer work freezes the in-flight FOP into a
//! stub, either the downward call (kind + argument tuple + continuation)
//! or the upward reply (kind + status + reply tuple), parks it on a
//! queue, and resumes it later from any thread as if the FOP had never
//! paused. The stub owns its argument containers, so the capturing
//! translator's stack can unwind while the stub lives.

use std::collections::VecDeque;
use std::sync::Arc;

use log::error;

use crate::errno::Errno;
use crate::fop::FopKind;
use crate::fop::FopReply;
use crate::fop::FopRequest;
use crate::fop::Reply;
use crate::frame::CallFrame;
use crate::xlator::dispatch;

/// Continuation for a resumed call. Receives the frame and the captured
/// argument tuple; shared so a kept stub can be retried.
pub type WindJump = Arc<dyn Fn(CallFrame, FopRequest) + Send + Sync>;

#[derive(Clone, Debug)]
enum StubPayload {
    Wind(FopRequest),
    Unwind(Reply),
}

/// A captured FOP call or reply.
pub struct CallStub {
    frame: CallFrame,
    payload: StubPayload,
    jump: Option<WindJump>,
}

impl CallStub {
    /// Capture a downward call. Resuming dispatches the arguments to the
    /// first child of the frame's current position.
    pub fn wind(frame: CallFrame, req: FopRequest) -> CallStub {
        CallStub {
            frame,
            payload: StubPayload::Wind(req),
            jump: None,
        }
    }

    /// Capture a downward call with an explicit continuation.
    pub fn wind_with(
        frame: CallFrame,
        req: FopRequest,
        jump: WindJump,
    ) -> CallStub {
        CallStub {
            frame,
            payload: StubPayload::Wind(req),
            jump: Some(jump),
        }
    }

    /// Capture an upward reply. Resuming delivers it through the frame.
    pub fn unwind(frame: CallFrame, reply: Reply) -> CallStub {
        CallStub {
            frame,
            payload: StubPayload::Unwind(reply),
            jump: None,
        }
    }

    /// Capture an upward reply from its parts.
    pub fn unwind_parts(
        frame: CallFrame,
        op_ret: i64,
        op_errno: Errno,
        data: FopReply,
    ) -> CallStub {
        CallStub::unwind(
            frame,
            Reply {
                op_ret,
                op_errno,
                data,
            },
        )
    }

    /// The captured FOP kind.
    pub fn kind(&self) -> FopKind {
        match &self.payload {
            StubPayload::Wind(req) => req.kind(),
            StubPayload::Unwind(_) => self.frame.kind(),
        }
    }

    /// True for a captured call, false for a captured reply.
    pub fn is_wind(&self) -> bool {
        matches!(self.payload, StubPayload::Wind(_))
    }

    /// The frame the stub will resume on.
    pub fn frame(&self) -> &CallFrame {
        &self.frame
    }

    /// Replay the captured call or reply and destroy the stub.
    pub fn resume(self) {
        let CallStub {
            frame,
            payload,
            jump,
        } = self;
        resume_payload(frame, payload, jump);
    }

    /// Replay without destroying; the caller keeps the stub to retry or
    /// destroy it. Payload containers are re-cloned for the replay.
    pub fn resume_keep(&self) {
        resume_payload(
            self.frame.clone(),
            self.payload.clone(),
            self.jump.clone(),
        );
    }

    /// Abandon the captured FOP: deliver a failure reply with the given
    /// status instead of replaying, and destroy the stub.
    pub fn unwind_error(self, op_ret: i64, op_errno: Errno) {
        let kind = self.kind();
        self.frame.unwind(Reply {
            op_ret,
            op_errno,
            data: FopReply::empty(kind),
        });
    }

    /// As [`CallStub::unwind_error`], keeping the stub alive.
    pub fn unwind_error_keep(&self, op_ret: i64, op_errno: Errno) {
        let kind = self.kind();
        self.frame.unwind(Reply {
            op_ret,
            op_errno,
            data: FopReply::empty(kind),
        });
    }

    /// Release the stub and every argument container it owns.
    pub fn destroy(self) {}
}

fn resume_payload(
    frame: CallFrame,
    payload: StubPayload,
    jump: Option<WindJump>,
) {
    match payload {
        StubPayload::Wind(req) => {
            if let Some(jump) = jump {
                jump(frame, req);
                return;
            }
            let Some(this) = frame.this() else {
                error!("resumed {} stub has no position", req.kind());
                frame.unwind(Reply::error(req.kind(), Errno::EINVAL));
                return;
            };
            match this.first_child() {
                Some(child) => dispatch(&child, frame, req),
                None => {
                    error!(
                        "{}: resumed {} stub at a leaf",
                        this.name(),
                        req.kind()
                    );
                    frame.unwind(Reply::error(req.kind(), Errno::EOPNOTSUPP));
                }
            }
        }
        StubPayload::Unwind(reply) => frame.unwind(reply),
    }
}

impl std::fmt::Debug for CallStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStub")
            .field("kind", &self.kind())
            .field("wind", &self.is_wind())
            .finish()
    }
}

/// A FIFO of parked stubs, the queue translators park deferred work on.
pub type StubQueue = VecDeque<CallStub>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::Dict;
    use crate::dict::DictValue;
    use crate::frame::CallRoot;
    use crate::loc::Loc;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn wind_stub_replays_arguments_unchanged() {
        let loc = Loc::from_path("/a/b");
        let xdata = Dict::from_iter([("k", DictValue::Int(7))]);

        let frame = CallFrame::new(CallRoot::new(), FopKind::Lookup, |_r| {});
        let (tx, rx) = mpsc::channel();
        let stub = CallStub::wind_with(
            frame,
            FopRequest::Lookup {
                loc,
                xdata: Some(xdata.clone()),
            },
            Arc::new(move |_frame, req| {
                tx.send(req).unwrap();
            }),
        );
        assert!(stub.is_wind());
        assert_eq!(stub.kind(), FopKind::Lookup);
        stub.resume();

        match rx.recv().unwrap() {
            FopRequest::Lookup {
                loc,
                xdata: Some(got),
            } => {
                assert_eq!(loc.path.as_deref(), Some("/a/b".as_ref()));
                assert_eq!(got, xdata);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn reply_stubs_from_many_threads_deliver_exactly_once() {
        const N: usize = 32;
        let queue = Arc::new(Mutex::new(StubQueue::new()));
        let (tx, rx) = mpsc::channel();

        let mut workers = Vec::new();
        for i in 0..N {
            let queue = queue.clone();
            let tx = tx.clone();
            workers.push(thread::spawn(move || {
                let frame = CallFrame::new(
                    CallRoot::new(),
                    FopKind::Flush,
                    move |reply| {
                        tx.send((i, reply)).unwrap();
                    },
                );
                let stub = CallStub::unwind_parts(
                    frame,
                    0,
                    Errno::OK,
                    FopReply::Flush { xdata: None },
                );
                queue.lock().push_back(stub);
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        drop(tx);

        // Single consumer resumes everything that was parked.
        let mut queue = queue.lock();
        assert_eq!(queue.len(), N);
        while let Some(stub) = queue.pop_front() {
            assert!(!stub.is_wind());
            stub.resume();
        }

        let mut seen = vec![0usize; N];
        while let Ok((i, reply)) = rx.recv() {
            assert!(reply.is_ok());
            seen[i] += 1;
        }
        assert!(seen.iter().all(|&c| c == 1));
    }

    #[test]
    fn unwind_error_overrides_status() {
        let (tx, rx) = mpsc::channel();
        let frame =
            CallFrame::new(CallRoot::new(), FopKind::Readv, move |reply| {
                tx.send(reply).unwrap();
            });
        let stub = CallStub::unwind_parts(
            frame,
            4096,
            Errno::OK,
            FopReply::empty(FopKind::Readv),
        );
        stub.unwind_error(-1, Errno::EBADF);

        let reply = rx.recv().unwrap();
        assert_eq!(reply.op_ret, -1);
        assert_eq!(reply.op_errno, Errno::EBADF);
        // the synthesized payload still carries the right kind
        assert_eq!(reply.data.kind(), Some(FopKind::Readv));
    }

    #[test]
    fn resume_keep_leaves_the_stub_reusable() {
        let hits = Arc::new(Mutex::new(0));
        let counted = hits.clone();
        let frame = CallFrame::new(CallRoot::new(), FopKind::Flush, |_r| {});
        let stub = CallStub::wind_with(
            frame,
            FopRequest::Flush {
                fd: crate::fd::Fd::new(
                    crate::inode::Inode::new(
                        crate::gfid::Gfid::generate(),
                        crate::iatt::IaType::Regular,
                    ),
                    0,
                ),
                xdata: None,
            },
            Arc::new(move |_frame, _req| {
                *counted.lock() += 1;
            }),
        );

        stub.resume_keep();
        stub.resume_keep();
        assert_eq!(*hits.lock(), 2);
        stub.destroy();
    }
}
