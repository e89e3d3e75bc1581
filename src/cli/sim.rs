// SIMULATED SOC RUN: SYNTHETIC LOAD RAMP, THEN A SCREEN OFF/ON CYCLE.
// REAL CONTROLLER, REAL THREADS, FAKE CORES. NO ROOT NEEDED.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;

use corewarden::platform::mask_string;
use corewarden::screen::ScreenHub;
use corewarden::sim::{SimPlatform, MAX_SIM_CPUS};
use corewarden::{Controller, Platform, Policy};

#[derive(Args)]
pub struct SimArgs {
    // SIMULATED CORE COUNT
    #[arg(long, default_value_t = 4)]
    cores: usize,

    #[arg(long, default_value_t = 20)]
    poll_interval_ms: u64,

    #[arg(long, default_value_t = 300)]
    suspend_grace_ms: u64,

    // CEILING WHILE THE SCREEN IS OFF
    #[arg(long, default_value_t = 1)]
    max_online_suspended: usize,

    // PRINT EVERY EXECUTOR DECISION
    #[arg(long)]
    verbose: bool,
}

struct Phase {
    name: &'static str,
    rq_depth: u32,
    rate_khz: u64,
    ms: u64,
}

// RUN-QUEUE DEPTH IN TENTHS OF A RUNNABLE TASK
const RAMP: [Phase; 5] = [
    Phase { name: "IDLE", rq_depth: 0, rate_khz: 300_000, ms: 800 },
    Phase { name: "WARM", rq_depth: 15, rate_khz: 1_200_000, ms: 800 },
    Phase { name: "BURST", rq_depth: 40, rate_khz: 1_800_000, ms: 1500 },
    Phase { name: "THROTTLED", rq_depth: 40, rate_khz: 300_000, ms: 600 },
    Phase { name: "SETTLE", rq_depth: 3, rate_khz: 300_000, ms: 1500 },
];

fn report(label: &str, sim: &SimPlatform, ctrl: &Controller) {
    let p = ctrl.policy();
    println!("  {:<12} ONLINE {}/{}  MASK=[{}]  BOUNDS {}..={}{}",
        label, sim.num_online(), sim.nr_cpus(),
        mask_string(sim.online_mask(), sim.nr_cpus()),
        p.min_online(), p.max_online(),
        if p.is_suspended() { "  (SUSPENDED)" } else { "" });
}

pub fn run_sim(args: SimArgs) -> Result<()> {
    if args.cores < 2 || args.cores > MAX_SIM_CPUS {
        bail!("--cores must be within 2..={}", MAX_SIM_CPUS);
    }
    if args.max_online_suspended == 0 || args.max_online_suspended > args.cores {
        bail!("--max-online-suspended must be within 1..={}", args.cores);
    }
    corewarden::set_verbose(args.verbose);

    let sim = Arc::new(SimPlatform::new(args.cores, RAMP[0].rate_khz));
    let hub = Arc::new(ScreenHub::new());

    let mut policy = Policy::new(args.cores);
    policy.poll_interval_ms = args.poll_interval_ms;
    policy.startup_delay_ms = 0;
    policy.suspend_grace_ms = args.suspend_grace_ms;
    policy.max_online_suspended = args.max_online_suspended;

    println!("COREWARDEN SIMULATION ({} CORES, POLL {} MS)", args.cores, args.poll_interval_ms);
    println!();

    let ctrl = Controller::new(Arc::clone(&sim) as Arc<dyn Platform>, hub.clone(), policy)?;

    for phase in &RAMP {
        sim.set_rq_depth(phase.rq_depth);
        sim.set_all_rates(phase.rate_khz);
        std::thread::sleep(Duration::from_millis(phase.ms));
        report(phase.name, &sim, &ctrl);
    }

    hub.screen_off();
    std::thread::sleep(Duration::from_millis(args.suspend_grace_ms / 2));
    report("OFF (GRACE)", &sim, &ctrl);
    std::thread::sleep(Duration::from_millis(args.suspend_grace_ms / 2 + 200));
    report("OFF", &sim, &ctrl);

    hub.screen_on();
    std::thread::sleep(Duration::from_millis(300));
    report("ON", &sim, &ctrl);

    ctrl.shutdown();
    ctrl.with_log(|log| {
        log.dump();
        log.summary();
    });
    println!("\nTRANSITIONS: {} UP, {} DOWN", sim.ups(), sim.downs());
    Ok(())
}
