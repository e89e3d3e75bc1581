// COREWARDEN -- DYNAMIC CPU CORE HOTPLUG CONTROLLER
// LIBRARY CRATE: DECISION ENGINE, EXECUTOR, SUSPEND COORDINATOR, TUNABLES
//
// EVERYTHING HERE RUNS WITHOUT ROOT AGAINST THE Platform TRAIT.
// THE BINARY (main.rs) WIRES IT TO SYSFS, THE SCREEN STATE AND A CONTROL SOCKET.

use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(on: bool) {
    VERBOSE.store(on, Ordering::Relaxed);
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        println!("[COREWARDEN] {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        eprintln!("[COREWARDEN] WARN: {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if $crate::verbose() {
            println!("[COREWARDEN] [DEBUG] {}", format_args!($($arg)*))
        }
    };
}

pub mod control;
pub mod controller;
pub mod decision;
pub mod error;
pub mod event;
pub mod platform;
pub mod policy;
pub mod rate;
pub mod screen;
pub mod sim;
pub mod tunables;
pub mod work;

pub use controller::Controller;
pub use decision::Decision;
pub use error::{Error, Result};
pub use platform::Platform;
pub use policy::Policy;
