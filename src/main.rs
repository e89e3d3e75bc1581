// COREWARDEN v1.0.0 -- DYNAMIC CPU CORE HOTPLUG CONTROLLER
// BRINGS SECONDARY CORES ONLINE UNDER SUSTAINED RUN-QUEUE PRESSURE,
// TAKES THEM DOWN WHEN THE LOAD AND THE CLOCKS SAY THEY ARE IDLE,
// AND COLLAPSES TO THE PRIMARY CORE WHILE THE SCREEN IS OFF.
//
// DECISIONS, EXECUTOR AND SUSPEND COORDINATOR LIVE IN THE LIBRARY CRATE.
// THIS BINARY WIRES THEM TO SYSFS, THE SCREEN STATE FILE AND A CONTROL SOCKET.

mod cli;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use corewarden::control::{ControlServer, DEFAULT_SOCKET};
use corewarden::platform::SysfsPlatform;
use corewarden::policy;
use corewarden::screen::{ScreenHub, ScreenWatcher, SCREEN_POLL_MS};
use corewarden::{Controller, Platform, Policy};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "corewarden")]
#[command(about = "COREWARDEN -- DYNAMIC CPU CORE HOTPLUG CONTROLLER")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    // NO SUBCOMMAND: RUN WITH THESE FLAGS
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Command {
    // RUN THE DAEMON (DEFAULT)
    Run(RunArgs),
    // CHECK THAT THIS KERNEL CAN HOTPLUG CORES
    Check {
        #[arg(long, default_value = "/sys")]
        sysfs_root: PathBuf,
        #[arg(long, default_value = "/proc")]
        procfs_root: PathBuf,
    },
    // DRIVE THE CONTROLLER AGAINST A SIMULATED SOC
    Sim(cli::sim::SimArgs),
    // READ ONE TUNABLE FROM A RUNNING DAEMON
    Get {
        name: String,
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: PathBuf,
    },
    // WRITE ONE TUNABLE ON A RUNNING DAEMON
    Set {
        name: String,
        value: String,
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: PathBuf,
    },
    // LIST EVERY TUNABLE
    List {
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: PathBuf,
    },
    // SHOW THE DAEMON'S CURRENT STATE
    Status {
        #[arg(long, default_value = DEFAULT_SOCKET)]
        socket: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    // SYSFS MOUNT POINT
    #[arg(long, default_value = "/sys")]
    sysfs_root: PathBuf,

    // PROCFS MOUNT POINT
    #[arg(long, default_value = "/proc")]
    procfs_root: PathBuf,

    // SCREEN STATE FILE ("0" = ON), E.G. /sys/class/backlight/panel0/bl_power
    #[arg(long)]
    screen_state: Option<PathBuf>,

    // CONTROL SOCKET PATH
    #[arg(long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    // DON'T OPEN THE CONTROL SOCKET
    #[arg(long)]
    no_socket: bool,

    // START WITH THE POLICY DISABLED (ENABLE LATER: corewarden set enabled 1)
    #[arg(long)]
    disabled: bool,

    #[arg(long, default_value_t = policy::DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,

    #[arg(long, default_value_t = policy::DEFAULT_STARTUP_DELAY_MS)]
    startup_delay_ms: u64,

    #[arg(long, default_value_t = policy::DEFAULT_SUSPEND_GRACE_MS)]
    suspend_grace_ms: u64,

    // DEFAULT: 2 (OR ALL CORES ON SMALLER SYSTEMS)
    #[arg(long)]
    min_online: Option<usize>,

    // DEFAULT: ALL CORES
    #[arg(long)]
    max_online: Option<usize>,

    // CEILING WHILE THE SCREEN IS OFF. 1 PARKS THE EXECUTOR.
    #[arg(long, default_value_t = policy::DEFAULT_MAX_ONLINE_SUSPENDED)]
    max_online_suspended: usize,

    // A CORE AT OR BELOW THIS CLOCK IS IDLE
    #[arg(long, default_value_t = policy::DEFAULT_IDLE_RATE_KHZ)]
    idle_rate_khz: u64,

    // PRINT EVERY EXECUTOR DECISION
    #[arg(long)]
    verbose: bool,

    // DUMP FULL EVENT LOG ON EXIT
    #[arg(long)]
    dump_log: bool,
}

fn in_bounds(name: &str, value: usize, nr_cpus: usize) -> Result<usize> {
    if value == 0 || value > nr_cpus {
        bail!("--{} must be within 1..={}, got {}", name, nr_cpus, value);
    }
    Ok(value)
}

fn build_policy(args: &RunArgs, nr_cpus: usize) -> Result<Policy> {
    let mut p = Policy::new(nr_cpus);
    p.enabled = !args.disabled;
    p.poll_interval_ms = args.poll_interval_ms;
    p.startup_delay_ms = args.startup_delay_ms;
    p.suspend_grace_ms = args.suspend_grace_ms;
    p.max_online_suspended = in_bounds("max-online-suspended", args.max_online_suspended, nr_cpus)?;
    p.idle_rate_khz = args.idle_rate_khz;
    if let Some(max) = args.max_online {
        p.set_max_online(in_bounds("max-online", max, nr_cpus)?);
    }
    if let Some(min) = args.min_online {
        p.set_min_online(in_bounds("min-online", min, nr_cpus)?);
    }
    Ok(p)
}

fn run(args: RunArgs) -> Result<()> {
    corewarden::set_verbose(args.verbose);

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    // DETECT TOPOLOGY
    let platform = Arc::new(
        SysfsPlatform::new(&args.sysfs_root, &args.procfs_root)
            .context("CPU TOPOLOGY UNAVAILABLE (TRY: corewarden check)")?,
    );
    let nr_cpus = platform.nr_cpus();
    let policy = build_policy(&args, nr_cpus)?;

    println!("COREWARDEN v1.0.0");
    println!("CPUS:            {} (online: {}, ids: {:?})", nr_cpus, platform.num_online(), platform.cpu_ids());
    println!("BOUNDS:          {}..={} (suspended ceiling: {})",
             policy.min_online(), policy.max_online(), policy.max_online_suspended);
    println!("POLL:            {} ms (startup delay: {} ms)", policy.poll_interval_ms, policy.startup_delay_ms);
    println!("SUSPEND GRACE:   {} ms", policy.suspend_grace_ms);
    println!("IDLE RATE:       {} kHz", policy.idle_rate_khz);
    println!("SCREEN STATE:    {}", args.screen_state.as_ref()
             .map(|p| p.display().to_string())
             .unwrap_or_else(|| "NONE (SUSPEND COORDINATION OFF)".to_string()));
    println!("VERBOSE:         {}", args.verbose);
    println!();

    let hub = Arc::new(ScreenHub::new());
    let ctrl = Arc::new(Controller::new(platform, hub.clone(), policy)?);

    let mut watcher = match &args.screen_state {
        Some(path) => Some(ScreenWatcher::spawn(
            path.clone(),
            Arc::clone(&hub),
            Duration::from_millis(SCREEN_POLL_MS),
        )?),
        None => None,
    };
    let mut server = if args.no_socket {
        None
    } else {
        Some(ControlServer::bind(&args.socket, Arc::clone(&ctrl))?)
    };

    println!("COREWARDEN IS ACTIVE (CTRL+C TO EXIT)");
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    println!("COREWARDEN IS SHUTTING DOWN");

    // SIGNAL SOURCES FIRST, THEN THE TASKS THEY DRIVE
    if let Some(w) = watcher.as_mut() {
        w.stop();
    }
    if let Some(s) = server.as_mut() {
        s.stop();
    }
    ctrl.shutdown();

    if args.dump_log {
        ctrl.with_log(|log| log.dump());
    }
    ctrl.with_log(|log| log.summary());

    println!("COREWARDEN OUT.");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => run(cli.run),
        Some(Command::Run(args)) => run(args),
        Some(Command::Check { sysfs_root, procfs_root }) => {
            cli::check::run_check(&sysfs_root, &procfs_root)
        }
        Some(Command::Sim(args)) => cli::sim::run_sim(args),
        Some(Command::Get { name, socket }) => cli::ctl::run_get(&socket, &name),
        Some(Command::Set { name, value, socket }) => cli::ctl::run_set(&socket, &name, &value),
        Some(Command::List { socket }) => cli::ctl::run_list(&socket),
        Some(Command::Status { socket }) => cli::ctl::run_status(&socket),
    }
}
