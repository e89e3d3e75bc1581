// COREWARDEN SIMULATED SOC
// IN-MEMORY PLATFORM: ONLINE MASK, PER-CORE RATES AND RUN-QUEUE DEPTH ARE
// PLAIN ATOMICS THE CALLER DRIVES. USED BY THE TESTS AND `corewarden sim`.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::platform::{Platform, PRIMARY_CPU};

pub const MAX_SIM_CPUS: usize = 64;

pub struct SimPlatform {
    nr_cpus: usize,
    online: AtomicU64,
    rates: Vec<AtomicU64>,
    rq_depth: AtomicU32,
    ups: AtomicU64,
    downs: AtomicU64,
    refuse: AtomicBool,
}

impl SimPlatform {
    // ALL CORES START ONLINE AT rate_khz
    pub fn new(nr_cpus: usize, rate_khz: u64) -> Self {
        let nr_cpus = nr_cpus.clamp(1, MAX_SIM_CPUS);
        let all = if nr_cpus == 64 { u64::MAX } else { (1u64 << nr_cpus) - 1 };
        Self {
            nr_cpus,
            online: AtomicU64::new(all),
            rates: (0..nr_cpus).map(|_| AtomicU64::new(rate_khz)).collect(),
            rq_depth: AtomicU32::new(0),
            ups: AtomicU64::new(0),
            downs: AtomicU64::new(0),
            refuse: AtomicBool::new(false),
        }
    }

    pub fn set_rq_depth(&self, depth: u32) {
        self.rq_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_rate(&self, cpu: usize, rate_khz: u64) {
        if let Some(r) = self.rates.get(cpu) {
            r.store(rate_khz, Ordering::Relaxed);
        }
    }

    pub fn set_all_rates(&self, rate_khz: u64) {
        for r in &self.rates {
            r.store(rate_khz, Ordering::Relaxed);
        }
    }

    // FORCE THE ONLINE MASK WITHOUT COUNTING TRANSITIONS. CORE 0 STAYS SET.
    pub fn set_online_mask(&self, mask: u64) {
        self.online.store(mask | 1, Ordering::SeqCst);
    }

    // MAKE EVERY cpu_up/cpu_down FAIL (HARDWARE REFUSING A TRANSITION)
    pub fn set_refuse_transitions(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Relaxed);
    }

    pub fn ups(&self) -> u64 {
        self.ups.load(Ordering::Relaxed)
    }

    pub fn downs(&self) -> u64 {
        self.downs.load(Ordering::Relaxed)
    }

    fn transition(&self, cpu: usize, online: bool) -> Result<()> {
        if cpu >= self.nr_cpus {
            return Err(Error::Io {
                path: format!("sim/cpu{}", cpu),
                source: io::Error::new(io::ErrorKind::NotFound, "no such core"),
            });
        }
        if self.refuse.load(Ordering::Relaxed) {
            return Err(Error::Io {
                path: format!("sim/cpu{}", cpu),
                source: io::Error::new(io::ErrorKind::PermissionDenied, "transition refused"),
            });
        }
        if cpu == PRIMARY_CPU {
            return Ok(());
        }
        let bit = 1u64 << cpu;
        if online {
            self.online.fetch_or(bit, Ordering::SeqCst);
            self.ups.fetch_add(1, Ordering::Relaxed);
        } else {
            self.online.fetch_and(!bit, Ordering::SeqCst);
            self.downs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Platform for SimPlatform {
    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn is_online(&self, cpu: usize) -> bool {
        cpu < self.nr_cpus && self.online.load(Ordering::SeqCst) & (1u64 << cpu) != 0
    }

    fn cpu_up(&self, cpu: usize) -> Result<()> {
        self.transition(cpu, true)
    }

    fn cpu_down(&self, cpu: usize) -> Result<()> {
        self.transition(cpu, false)
    }

    fn cur_rate_khz(&self, cpu: usize) -> u64 {
        if !self.is_online(cpu) {
            return 0;
        }
        self.rates[cpu].load(Ordering::Relaxed)
    }

    fn rq_depth(&self) -> u32 {
        self.rq_depth.load(Ordering::Relaxed)
    }

    fn online_mask(&self) -> u64 {
        self.online.load(Ordering::SeqCst)
    }
}
