// COREWARDEN RATE SAMPLER
// READ-ONLY SCANS OVER THE PER-CORE CLOCK RATES. CORE COUNTS ARE SMALL,
// A LINEAR SCAN IS ALL THIS NEEDS.

use crate::platform::{Platform, PRIMARY_CPU};

// LOWEST CURRENT RATE ACROSS EVERY ONLINE CORE, PRIMARY INCLUDED.
// CORES REPORTING 0 (UNKNOWN) ARE SKIPPED. 0 IF NOTHING REPORTS.
pub fn slowest_rate(platform: &dyn Platform) -> u64 {
    (0..platform.nr_cpus())
        .filter(|&cpu| platform.is_online(cpu))
        .map(|cpu| platform.cur_rate_khz(cpu))
        .filter(|&rate| rate > 0)
        .min()
        .unwrap_or(0)
}

// ONLINE SECONDARY CORE WITH THE LOWEST RATE. TIES GO TO THE HIGHER INDEX.
pub fn slowest_secondary(platform: &dyn Platform) -> Option<usize> {
    let mut slowest: Option<(usize, u64)> = None;
    for cpu in (PRIMARY_CPU + 1)..platform.nr_cpus() {
        if !platform.is_online(cpu) {
            continue;
        }
        let rate = platform.cur_rate_khz(cpu);
        match slowest {
            Some((_, best)) if rate > best => {}
            _ => slowest = Some((cpu, rate)),
        }
    }
    slowest.map(|(cpu, _)| cpu)
}

// LOWEST-INDEXED OFFLINE SECONDARY CORE
pub fn first_offline_secondary(platform: &dyn Platform) -> Option<usize> {
    ((PRIMARY_CPU + 1)..platform.nr_cpus()).find(|&cpu| !platform.is_online(cpu))
}
