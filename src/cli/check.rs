use std::io::Read;
use std::path::Path;

use anyhow::Result;

use corewarden::platform::{managed_cpu_ids, parse_procs_running};

fn check_kernel_config(procfs_root: &Path) -> bool {
    let path = procfs_root.join("config.gz");
    let file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(_) => {
            println!("  config.gz             NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  config.gz             UNREADABLE (SKIPPED)");
        return true;
    }
    let found = config.lines().any(|l| l.trim() == "CONFIG_HOTPLUG_CPU=y");
    if found {
        println!("  CONFIG_HOTPLUG_CPU    OK");
    } else {
        println!("  CONFIG_HOTPLUG_CPU    NOT SET -- cores cannot be taken offline");
    }
    found
}

fn check_topology(cpu_dir: &Path) -> Option<Vec<usize>> {
    let ids = match managed_cpu_ids(cpu_dir) {
        Ok(ids) => ids,
        Err(e) => {
            println!("  possible              UNUSABLE ({})", e);
            return None;
        }
    };
    let possible = std::fs::read_to_string(cpu_dir.join("possible")).unwrap_or_default();
    println!("  possible              {} CORES MANAGED ({})", ids.len(), possible.trim());
    if ids.len() < 2 {
        println!("  (SINGLE CORE -- NOTHING TO HOTPLUG)");
    }
    Some(ids)
}

// THE FIRST MANAGED CORE IS THE PRIMARY AND IS NEVER WRITTEN
fn check_hotplug_files(cpu_dir: &Path, ids: &[usize]) -> bool {
    let mut ok = true;
    for cpu in ids.iter().skip(1) {
        let path = cpu_dir.join(format!("cpu{}/online", cpu));
        match std::fs::metadata(&path) {
            Ok(m) if !m.permissions().readonly() => {
                println!("  cpu{:<2}/online          OK", cpu);
            }
            Ok(_) => {
                println!("  cpu{:<2}/online          READ-ONLY", cpu);
                ok = false;
            }
            Err(_) => {
                println!("  cpu{:<2}/online          MISSING", cpu);
                ok = false;
            }
        }
    }
    ok
}

// RATE FILES ARE OPTIONAL: WITHOUT THEM THE IDLE-RATE OVERRIDE NEVER FIRES
fn check_rate_files(cpu_dir: &Path, ids: &[usize]) {
    let readable = ids
        .iter()
        .filter(|cpu| {
            std::fs::read_to_string(cpu_dir.join(format!("cpu{}/cpufreq/scaling_cur_freq", cpu)))
                .map(|s| s.trim().parse::<u64>().is_ok())
                .unwrap_or(false)
        })
        .count();
    if readable > 0 {
        println!("  scaling_cur_freq      {}/{} CORES", readable, ids.len());
    } else {
        println!("  scaling_cur_freq      UNAVAILABLE -- idle-rate override disabled");
    }
}

fn check_run_queue(procfs_root: &Path) -> bool {
    let stat = std::fs::read_to_string(procfs_root.join("stat")).unwrap_or_default();
    match parse_procs_running(&stat) {
        Some(n) => {
            println!("  procs_running         OK ({})", n);
            true
        }
        None => {
            println!("  procs_running         MISSING");
            false
        }
    }
}

pub fn run_check(sysfs_root: &Path, procfs_root: &Path) -> Result<()> {
    println!("COREWARDEN DEPENDENCY CHECK");
    println!();

    let mut ok = true;
    let cpu_dir = sysfs_root.join("devices/system/cpu");

    println!("TOPOLOGY:");
    if let Some(ids) = check_topology(&cpu_dir) {
        if !check_hotplug_files(&cpu_dir, &ids) {
            ok = false;
        }
        check_rate_files(&cpu_dir, &ids);
    } else {
        ok = false;
    }
    println!();

    println!("LOAD:");
    if !check_run_queue(procfs_root) {
        ok = false;
    }
    println!();

    println!("KERNEL CONFIG:");
    if !check_kernel_config(procfs_root) {
        ok = false;
    }
    println!();

    let root = unsafe { libc::geteuid() } == 0;
    println!("  privileges            {}", if root { "ROOT" } else { "NOT ROOT -- run the daemon with sudo" });
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        std::process::exit(1);
    }

    Ok(())
}
