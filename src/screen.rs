// COREWARDEN SCREEN POWER-STATE SIGNALS
// ScreenHub FANS SCREEN-OFF / SCREEN-ON OUT TO REGISTERED HANDLERS.
// ScreenWatcher TURNS A BACKLIGHT OR FRAMEBUFFER STATE FILE INTO HUB EDGES.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};

pub trait PowerHandler: Send + Sync {
    // SCREEN WENT OFF
    fn suspend(&self);
    // SCREEN CAME BACK
    fn resume(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

pub trait PowerNotifier: Send + Sync {
    fn register(&self, handler: Arc<dyn PowerHandler>) -> RegistrationId;
    fn unregister(&self, id: RegistrationId);
}

#[derive(Default)]
pub struct ScreenHub {
    handlers: Mutex<Vec<(RegistrationId, Arc<dyn PowerHandler>)>>,
    next_id: AtomicU64,
}

impl ScreenHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<(RegistrationId, Arc<dyn PowerHandler>)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // SNAPSHOT FIRST: HANDLERS MAY (UN)REGISTER FROM INSIDE A CALLBACK
    fn snapshot(&self) -> Vec<Arc<dyn PowerHandler>> {
        self.handlers().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    pub fn screen_off(&self) {
        for h in self.snapshot() {
            h.suspend();
        }
    }

    pub fn screen_on(&self) {
        for h in self.snapshot() {
            h.resume();
        }
    }

    pub fn registered(&self) -> usize {
        self.handlers().len()
    }
}

impl PowerNotifier for ScreenHub {
    fn register(&self, handler: Arc<dyn PowerHandler>) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers().push((id, handler));
        id
    }

    fn unregister(&self, id: RegistrationId) {
        self.handlers().retain(|(rid, _)| *rid != id);
    }
}

// "0" MEANS UNBLANKED / BACKLIGHT POWERED. ANYTHING ELSE IS OFF.
pub fn parse_screen_on(raw: &str) -> Option<bool> {
    raw.trim().parse::<u32>().ok().map(|v| v == 0)
}

pub const SCREEN_POLL_MS: u64 = 200;

pub struct ScreenWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ScreenWatcher {
    // POLL path (e.g. /sys/class/backlight/<panel>/bl_power) AND DRIVE hub ON EDGES.
    // THE FIRST READING IS THE BASELINE, NOT AN EDGE.
    pub fn spawn(path: PathBuf, hub: Arc<ScreenHub>, poll: Duration) -> Result<Self> {
        let initial = fs::read_to_string(&path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut screen_on = parse_screen_on(&initial).unwrap_or(true);

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("corewarden-screen".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(poll);
                    let now_on = match fs::read_to_string(&path).ok().and_then(|s| parse_screen_on(&s)) {
                        Some(v) => v,
                        None => continue,
                    };
                    if now_on == screen_on {
                        continue;
                    }
                    screen_on = now_on;
                    if now_on {
                        crate::log_info!("SCREEN -> ON");
                        hub.screen_on();
                    } else {
                        crate::log_info!("SCREEN -> OFF");
                        hub.screen_off();
                    }
                }
            })
            .map_err(|source| Error::Spawn { name: "screen", source })?;

        Ok(Self { stop, thread: Some(thread) })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ScreenWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
