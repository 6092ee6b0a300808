use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use groundtruth::accumulator::WorkerSet;
use groundtruth::session::CaptureSession;

static SESSION: OnceLock<CaptureSession> = OnceLock::new();

thread_local! {
    static WORKER: RefCell<Option<(u32, Arc<WorkerSet>)>> = RefCell::new(None);
}

pub(crate) fn initialize(session: CaptureSession) {
    if SESSION.set(session).is_err() {
        tracing::error!("capture session is already initialized");
        panic!()
    }
}

pub(crate) fn session() -> &'static CaptureSession {
    let Some(session) = SESSION.get() else {
        tracing::error!("attempted to use capture session before initialization");
        panic!()
    };
    session
}

/// Runs `f` with the set owned by `vcpu_index`, looking it up only when the calling thread
/// switches vCPU.
pub(crate) fn with_worker<F: FnOnce(&WorkerSet)>(vcpu_index: u32, f: F) {
    WORKER.with_borrow_mut(|worker| {
        if !matches!(worker, Some((index, _)) if *index == vcpu_index) {
            *worker = Some((vcpu_index, session().worker(vcpu_index as usize)));
        }
        if let Some((_, set)) = worker {
            f(set)
        }
    })
}
