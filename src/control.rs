// COREWARDEN CONTROL SOCKET
// UNIX STREAM SOCKET, ONE REQUEST PER LINE, CLIENT HALF-CLOSES WHEN DONE:
//
//   get NAME          -> VALUE
//   set NAME VALUE    -> OK
//   list              -> NAME VALUE ... OK
//   status            -> KEY VALUE ... OK
//
// ANY FAILURE ANSWERS "ERR <message>" AND CHANGES NOTHING.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::platform::mask_string;
use crate::tunables::Knob;

pub const DEFAULT_SOCKET: &str = "/run/corewarden.sock";

const ACCEPT_POLL_MS: u64 = 50;
const CLIENT_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get(String),
    Set(String, String),
    List,
    Status,
}

pub fn parse_request(line: &str) -> std::result::Result<Request, String> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().ok_or_else(|| "empty request".to_string())?;
    let req = match verb {
        "get" => Request::Get(parts.next().ok_or("get needs a name")?.to_string()),
        "set" => {
            let name = parts.next().ok_or("set needs a name and a value")?;
            let value = parts.next().ok_or("set needs a name and a value")?;
            Request::Set(name.to_string(), value.to_string())
        }
        "list" => Request::List,
        "status" => Request::Status,
        other => return Err(format!("unknown command '{}'", other)),
    };
    if parts.next().is_some() {
        return Err("trailing arguments".to_string());
    }
    Ok(req)
}

// RENDER THE FULL REPLY FOR ONE REQUEST LINE (TRAILING NEWLINE INCLUDED)
pub fn process_line(ctrl: &Controller, line: &str) -> String {
    let req = match parse_request(line) {
        Ok(r) => r,
        Err(msg) => return format!("ERR {}\n", msg),
    };
    match req {
        Request::Get(name) => match ctrl.show(&name) {
            Ok(v) => format!("{}\n", v),
            Err(e) => format!("ERR {}\n", e),
        },
        Request::Set(name, value) => match ctrl.store(&name, &value) {
            Ok(()) => {
                log_info!("{} -> {}", name.to_uppercase(), ctrl.show(&name).unwrap_or(0));
                "OK\n".to_string()
            }
            Err(e) => format!("ERR {}\n", e),
        },
        Request::List => {
            let mut out = String::new();
            for knob in Knob::ALL {
                out.push_str(&format!("{} {}\n", knob.name(), ctrl.get(knob)));
            }
            out.push_str("OK\n");
            out
        }
        Request::Status => status_text(ctrl),
    }
}

fn status_text(ctrl: &Controller) -> String {
    let p = ctrl.policy();
    let platform = ctrl.platform();
    let mask = platform.online_mask();
    let (events, ups, downs) = ctrl.with_log(|log| {
        (log.len(), log.count(EventKind::ScaleUp), log.count(EventKind::ScaleDown))
    });
    let mut out = String::new();
    out.push_str(&format!("enabled {}\n", p.enabled as u8));
    out.push_str(&format!("suspended {}\n", p.is_suspended() as u8));
    out.push_str(&format!("cores {}\n", ctrl.nr_cpus()));
    out.push_str(&format!("online {}\n", mask.count_ones()));
    out.push_str(&format!("mask {}\n", mask_string(mask, ctrl.nr_cpus())));
    out.push_str(&format!("bounds {}..={}\n", p.min_online(), p.max_online()));
    out.push_str(&format!("rq_depth {}\n", platform.rq_depth()));
    out.push_str(&format!("executor {}\n", if ctrl.executor_active() { "armed" } else { "parked" }));
    out.push_str(&format!("cycles {}\n", ctrl.executor_runs()));
    out.push_str(&format!("scale_ups {}\n", ups));
    out.push_str(&format!("scale_downs {}\n", downs));
    out.push_str(&format!("events {}\n", events));
    out.push_str("OK\n");
    out
}

fn handle_client(stream: UnixStream, ctrl: &Controller) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(CLIENT_TIMEOUT_MS)))?;
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        writer.write_all(process_line(ctrl, &line).as_bytes())?;
    }
    writer.flush()
}

pub struct ControlServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    pub fn bind(path: &Path, ctrl: Arc<Controller>) -> Result<Self> {
        let io_err = |source| Error::Io { path: path.display().to_string(), source };

        let _ = std::fs::remove_file(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let listener = UnixListener::bind(path).map_err(io_err)?;
        listener.set_nonblocking(true).map_err(io_err)?;
        log_info!("CONTROL SOCKET: {}", path.display());

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("corewarden-control".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(e) = handle_client(stream, &ctrl) {
                                log_warn!("CONTROL CLIENT: {}", e);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                        }
                        Err(e) => {
                            log_warn!("CONTROL ACCEPT: {}", e);
                            std::thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
                        }
                    }
                }
            })
            .map_err(|source| Error::Spawn { name: "control", source })?;

        Ok(Self { path: path.to_path_buf(), stop, thread: Some(thread) })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// CLIENT SIDE: SEND ONE REQUEST, RETURN THE RAW REPLY
pub fn request(path: &Path, line: &str) -> Result<String> {
    let io_err = |source| Error::Io { path: path.display().to_string(), source };
    let mut stream = UnixStream::connect(path).map_err(io_err)?;
    stream.set_read_timeout(Some(Duration::from_millis(CLIENT_TIMEOUT_MS))).map_err(io_err)?;
    stream.write_all(format!("{}\n", line.trim()).as_bytes()).map_err(io_err)?;
    stream.shutdown(std::net::Shutdown::Write).map_err(io_err)?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply).map_err(io_err)?;
    Ok(reply)
}
