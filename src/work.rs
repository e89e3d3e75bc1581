// COREWARDEN DEFERRED WORK
// ONE NAMED THREAD PER TASK, WORKQUEUE SEMANTICS:
//   queue(delay)   ARM THE TASK. IGNORED IF ALREADY ARMED OR BEING CANCELLED.
//   cancel()       DISARM. AN IN-FLIGHT RUN FINISHES ON ITS OWN.
//   cancel_sync()  DISARM AND WAIT FOR THE IN-FLIGHT RUN. REQUEUES DURING
//                  THE WAIT ARE REFUSED, SO A SELF-RESCHEDULING TASK STAYS DOWN.
//   shutdown()     CANCEL AND JOIN. THE TASK NEVER RUNS AGAIN.
//
// A TASK NEVER OVERLAPS ITSELF: ONE THREAD, ONE RUN AT A TIME.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

struct WorkState {
    pending: Option<Instant>,
    running: bool,
    canceling: u32,
    shutdown: bool,
    runs: u64,
    worker: Option<ThreadId>,
}

struct Shared {
    name: &'static str,
    state: Mutex<WorkState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, delay: Duration) -> bool {
        let mut st = self.lock();
        if st.shutdown || st.canceling > 0 || st.pending.is_some() {
            return false;
        }
        st.pending = Some(Instant::now() + delay);
        self.cond.notify_all();
        true
    }

    fn on_worker_thread(&self, st: &WorkState) -> bool {
        st.worker == Some(std::thread::current().id())
    }
}

// GIVEN TO THE TASK BODY SO IT CAN RESCHEDULE ITSELF
pub struct WorkHandle {
    shared: Arc<Shared>,
}

impl WorkHandle {
    pub fn queue(&self, delay: Duration) -> bool {
        self.shared.queue(delay)
    }
}

pub struct DelayedWork {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedWork {
    // SPAWN FAILURE IS THE ONLY WAY THIS FAILS (RESOURCE EXHAUSTION)
    pub fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: Fn(&WorkHandle) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            name,
            state: Mutex::new(WorkState {
                pending: None,
                running: false,
                canceling: 0,
                shutdown: false,
                runs: 0,
                worker: None,
            }),
            cond: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("corewarden-{}", name))
            .spawn(move || worker_loop(worker_shared, body))
            .map_err(|source| Error::Spawn { name, source })?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn queue(&self, delay: Duration) -> bool {
        self.shared.queue(delay)
    }

    // RETURNS TRUE IF A PENDING RUN WAS DISARMED
    pub fn cancel(&self) -> bool {
        let mut st = self.shared.lock();
        let was_pending = st.pending.take().is_some();
        self.shared.cond.notify_all();
        was_pending
    }

    // RETURNS TRUE IF A PENDING RUN WAS DISARMED. CALLED FROM THE TASK'S OWN
    // THREAD IT ONLY DISARMS (WAITING ON ITSELF WOULD NEVER END).
    pub fn cancel_sync(&self) -> bool {
        let mut st = self.shared.lock();
        st.canceling += 1;
        let was_pending = st.pending.take().is_some();
        self.shared.cond.notify_all();
        if !self.shared.on_worker_thread(&st) {
            while st.running {
                st = self.shared.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
            }
        }
        st.pending = None;
        st.canceling -= 1;
        was_pending
    }

    pub fn is_pending(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    // COMPLETED RUNS SINCE SPAWN
    pub fn runs(&self) -> u64 {
        self.shared.lock().runs
    }

    pub fn shutdown(&self) {
        let on_worker = {
            let mut st = self.shared.lock();
            st.shutdown = true;
            st.pending = None;
            self.shared.cond.notify_all();
            self.shared.on_worker_thread(&st)
        };
        if on_worker {
            return;
        }
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for DelayedWork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<F>(shared: Arc<Shared>, body: F)
where
    F: Fn(&WorkHandle),
{
    let handle = WorkHandle { shared: Arc::clone(&shared) };
    shared.lock().worker = Some(std::thread::current().id());

    loop {
        {
            let mut st = shared.lock();
            loop {
                if st.shutdown {
                    return;
                }
                match st.pending {
                    None => {
                        st = shared.cond.wait(st).unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        st = shared.cond.wait_timeout(st, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner).0;
                    }
                }
            }
            st.pending = None;
            st.running = true;
        }

        if catch_unwind(AssertUnwindSafe(|| body(&handle))).is_err() {
            crate::log_warn!("{} WORKER PANICKED, RUN DROPPED", shared.name.to_uppercase());
        }

        let mut st = shared.lock();
        st.running = false;
        st.runs += 1;
        shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn queued_work_runs_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let w = DelayedWork::spawn("once", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
        assert!(w.queue(Duration::from_millis(1)));
        assert!(wait_for(|| w.runs() == 1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_queue_keeps_first_timer() {
        let w = DelayedWork::spawn("double", |_| {}).unwrap();
        assert!(w.queue(Duration::from_secs(60)));
        assert!(!w.queue(Duration::ZERO));
        assert!(w.is_pending());
        assert!(w.cancel());
        assert!(!w.is_pending());
    }

    #[test]
    fn cancel_before_deadline_prevents_run() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let w = DelayedWork::spawn("cancel", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }).unwrap();
        w.queue(Duration::from_millis(50));
        assert!(w.cancel_sync());
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_sync_stops_self_rescheduling_task() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let w = DelayedWork::spawn("periodic", move |handle| {
            h.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            handle.queue(Duration::from_millis(1));
        }).unwrap();
        w.queue(Duration::ZERO);
        assert!(wait_for(|| hits.load(Ordering::SeqCst) >= 3));
        w.cancel_sync();
        let after = hits.load(Ordering::SeqCst);
        assert!(!w.is_running());
        assert!(!w.is_pending());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), after);
    }

    #[test]
    fn shutdown_refuses_new_work() {
        let w = DelayedWork::spawn("dead", |_| {}).unwrap();
        w.shutdown();
        assert!(!w.queue(Duration::ZERO));
    }

    #[test]
    fn panicking_body_does_not_wedge_worker() {
        let w = DelayedWork::spawn("panic", |_| panic!("boom")).unwrap();
        w.queue(Duration::ZERO);
        assert!(wait_for(|| w.runs() == 1));
        w.cancel_sync();
        assert!(w.queue(Duration::ZERO));
        assert!(wait_for(|| w.runs() == 2));
    }
}
