// COREWARDEN PLATFORM LAYER
// THE THREE CAPABILITIES THE CONTROLLER CONSUMES BUT DOES NOT OWN:
//   CORE ACTIVATION/DEACTIVATION, PER-CORE CLOCK RATE, RUN-QUEUE DEPTH.
//
// SysfsPlatform TALKS TO THE KERNEL. sim::SimPlatform IS THE OFFLINE TWIN.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

// CORE 0 BOOTS THE SYSTEM AND IS NEVER TAKEN DOWN
pub const PRIMARY_CPU: usize = 0;

pub trait Platform: Send + Sync {
    // TOTAL CORES THAT CAN EVER BE ONLINE
    fn nr_cpus(&self) -> usize;

    fn is_online(&self, cpu: usize) -> bool;

    fn cpu_up(&self, cpu: usize) -> Result<()>;

    fn cpu_down(&self, cpu: usize) -> Result<()>;

    // CURRENT CLOCK RATE IN KHZ. 0 WHEN UNKNOWN OR OFFLINE.
    fn cur_rate_khz(&self, cpu: usize) -> u64;

    // AGGREGATE RUN-QUEUE DEPTH IN TENTHS OF A RUNNABLE TASK
    fn rq_depth(&self) -> u32;

    fn num_online(&self) -> usize {
        (0..self.nr_cpus()).filter(|&cpu| self.is_online(cpu)).count()
    }

    // ONLINE MASK AS A BITMAP (BIT N = CORE N). LOGGING ONLY.
    fn online_mask(&self) -> u64 {
        (0..self.nr_cpus().min(64))
            .filter(|&cpu| self.is_online(cpu))
            .fold(0u64, |mask, cpu| mask | (1u64 << cpu))
    }
}

// RENDER AN ONLINE MASK AS "1101" (CORE 0 FIRST)
pub fn mask_string(mask: u64, nr_cpus: usize) -> String {
    (0..nr_cpus.min(64))
        .map(|cpu| if mask & (1u64 << cpu) != 0 { '1' } else { '0' })
        .collect()
}

// PARSE A KERNEL CPU LIST ("0-3,5,7-8") INTO SORTED CORE IDS. BAD PIECES ARE SKIPPED.
pub fn parse_cpu_list(raw: &str) -> Vec<usize> {
    let mut ids = Vec::new();
    for range in raw.trim().split(',') {
        let parts: Vec<&str> = range.split('-').collect();
        match parts.len() {
            1 => {
                if let Ok(id) = parts[0].trim().parse::<usize>() {
                    ids.push(id);
                }
            }
            2 => {
                if let (Ok(lo), Ok(hi)) = (parts[0].trim().parse::<usize>(), parts[1].trim().parse::<usize>()) {
                    if hi >= lo {
                        ids.extend(lo..=hi);
                    }
                }
            }
            _ => {}
        }
    }
    ids.sort_unstable();
    ids.dedup();
    ids
}

// CORES THE CONTROLLER MAY MANAGE: possible, NARROWED TO present WHEN THE KERNEL EXPORTS IT
pub fn managed_cpu_ids(cpu_dir: &Path) -> Result<Vec<usize>> {
    let possible_path = cpu_dir.join("possible");
    let possible = fs::read_to_string(&possible_path).map_err(|source| Error::Io {
        path: possible_path.display().to_string(),
        source,
    })?;
    let mut ids = parse_cpu_list(&possible);
    if let Ok(present) = fs::read_to_string(cpu_dir.join("present")) {
        let present = parse_cpu_list(&present);
        ids.retain(|id| present.binary_search(id).is_ok());
    }
    if ids.is_empty() {
        return Err(Error::Io {
            path: possible_path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no usable cores"),
        });
    }
    Ok(ids)
}

fn procs_running_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^procs_running\s+(\d+)\s*$").expect("static regex"))
}

// EXTRACT procs_running FROM /proc/stat CONTENTS
pub fn parse_procs_running(stat: &str) -> Option<u32> {
    procs_running_re()
        .captures(stat)
        .and_then(|c| c[1].parse::<u32>().ok())
}

// --- SYSFS BACKEND ---

// CONTROLLER INDEX i IS KERNEL CORE cpus[i]. IDS MAY HAVE GAPS.
pub struct SysfsPlatform {
    cpu_dir: PathBuf,
    proc_stat: PathBuf,
    cpus: Vec<usize>,
}

impl SysfsPlatform {
    // sysfs_root IS NORMALLY "/sys", procfs_root "/proc". TESTS POINT THEM AT A FAKE TREE.
    pub fn new(sysfs_root: &Path, procfs_root: &Path) -> Result<Self> {
        let cpu_dir = sysfs_root.join("devices/system/cpu");
        let cpus = managed_cpu_ids(&cpu_dir)?;
        Ok(Self {
            cpu_dir,
            proc_stat: procfs_root.join("stat"),
            cpus,
        })
    }

    pub fn cpu_ids(&self) -> &[usize] {
        &self.cpus
    }

    fn online_path(&self, cpu: usize) -> Option<PathBuf> {
        let id = self.cpus.get(cpu)?;
        Some(self.cpu_dir.join(format!("cpu{}/online", id)))
    }

    fn rate_path(&self, cpu: usize) -> Option<PathBuf> {
        let id = self.cpus.get(cpu)?;
        Some(self.cpu_dir.join(format!("cpu{}/cpufreq/scaling_cur_freq", id)))
    }

    fn set_online(&self, cpu: usize, online: bool) -> Result<()> {
        if cpu == PRIMARY_CPU {
            return Ok(());
        }
        let path = match self.online_path(cpu) {
            Some(p) => p,
            None => return Ok(()),
        };
        fs::write(&path, if online { "1" } else { "0" }).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

impl Platform for SysfsPlatform {
    fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    fn is_online(&self, cpu: usize) -> bool {
        let path = match self.online_path(cpu) {
            Some(p) => p,
            None => return false,
        };
        match fs::read_to_string(path) {
            Ok(s) => s.trim() == "1",
            // THE BOOT CORE USUALLY HAS NO online FILE: NOT HOTPLUGGABLE, ALWAYS UP
            Err(_) => cpu == PRIMARY_CPU,
        }
    }

    fn cpu_up(&self, cpu: usize) -> Result<()> {
        self.set_online(cpu, true)
    }

    fn cpu_down(&self, cpu: usize) -> Result<()> {
        self.set_online(cpu, false)
    }

    fn cur_rate_khz(&self, cpu: usize) -> u64 {
        if !self.is_online(cpu) {
            return 0;
        }
        self.rate_path(cpu)
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    fn rq_depth(&self) -> u32 {
        let stat = fs::read_to_string(&self.proc_stat).unwrap_or_default();
        // procs_running COUNTS THE READER TOO
        parse_procs_running(&stat)
            .map(|n| n.saturating_sub(1).saturating_mul(10))
            .unwrap_or(0)
    }
}
