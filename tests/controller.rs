// COREWARDEN CONTROLLER TESTS
// EXECUTOR, SUSPEND/RESUME COORDINATOR, ENABLE/DISABLE, CORRECTIVE PASSES,
// TUNABLE VALIDATION, TEARDOWN
//
// REAL THREADS AGAINST corewarden::sim::SimPlatform. MILLISECOND DELAYS,
// EVERY WAIT BOUNDED. RUN OFFLINE, NO ROOT.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use corewarden::event::EventKind;
use corewarden::screen::ScreenHub;
use corewarden::sim::SimPlatform;
use corewarden::tunables::Knob;
use corewarden::{Controller, Platform, Policy, Result};

const BUSY_KHZ: u64 = 1_500_000;

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

fn fast_policy(nr: usize) -> Policy {
    let mut p = Policy::new(nr);
    p.poll_interval_ms = 5;
    p.startup_delay_ms = 0;
    p.suspend_grace_ms = 50;
    p
}

fn setup(policy: Policy) -> (Arc<SimPlatform>, Arc<ScreenHub>, Controller) {
    let sim = Arc::new(SimPlatform::new(policy.nr_cpus(), BUSY_KHZ));
    let hub = Arc::new(ScreenHub::new());
    let ctrl = Controller::new(
        Arc::clone(&sim) as Arc<dyn Platform>,
        hub.clone(),
        policy,
    ).unwrap();
    (sim, hub, ctrl)
}

// === HOTPLUG EXECUTOR ===

#[test]
fn executor_brings_core_two_online() {
    let mut policy = fast_policy(4);
    policy.set_min_online(2);
    policy.set_max_online(4);
    let sim = Arc::new(SimPlatform::new(4, BUSY_KHZ));
    sim.set_online_mask(0b0011);
    // n=2: AT THE UP THRESHOLD. n=3: NEUTRAL (10 < 20 < 25).
    sim.set_rq_depth(20);
    let hub = Arc::new(ScreenHub::new());
    let ctrl = Controller::new(Arc::clone(&sim) as Arc<dyn Platform>, hub, policy).unwrap();

    assert!(wait_for(|| sim.is_online(2)));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(sim.online_mask(), 0b0111);
    assert_eq!(sim.ups(), 1);
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::ScaleUp)), 1);
    assert!(ctrl.executor_active());
}

#[test]
fn executor_sheds_idle_cores_down_to_min() {
    let (sim, _hub, ctrl) = setup(fast_policy(4));
    sim.set_rq_depth(0);
    sim.set_all_rates(300_000);

    assert!(wait_for(|| sim.num_online() == 2));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(sim.num_online(), 2);
    // THE LOWEST-RATE CORE GOES, TIES TO THE HIGHEST INDEX
    assert_eq!(sim.online_mask(), 0b0011);
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::ScaleDown)), 2);
}

#[test]
fn executor_survives_refused_transitions() {
    let (sim, _hub, ctrl) = setup(fast_policy(4));
    sim.set_refuse_transitions(true);
    sim.set_rq_depth(0);
    sim.set_all_rates(300_000);

    let runs = ctrl.executor_runs();
    assert!(wait_for(|| ctrl.executor_runs() > runs + 60));
    assert_eq!(sim.num_online(), 4);
    assert!(ctrl.executor_active());
}

#[test]
fn startup_delay_holds_the_first_cycle() {
    let mut policy = fast_policy(4);
    policy.startup_delay_ms = 10_000;
    let (sim, _hub, ctrl) = setup(policy);
    sim.set_rq_depth(0);
    sim.set_all_rates(300_000);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(ctrl.executor_runs(), 0);
    assert!(ctrl.executor_active());
    assert_eq!(sim.downs(), 0);
}

// === SUSPEND / RESUME COORDINATOR ===

#[test]
fn screen_off_collapses_to_primary_after_grace() {
    let (sim, hub, ctrl) = setup(fast_policy(4));
    // n=4: BELOW THE DOWN THRESHOLD BUT BUSY-CLOCKED, SO THE EXECUTOR HOLDS
    sim.set_rq_depth(15);
    assert!(wait_for(|| ctrl.executor_runs() >= 3));

    hub.screen_off();
    assert!(wait_for(|| sim.num_online() == 1));
    assert!(wait_for(|| !ctrl.executor_active()));

    let p = ctrl.policy();
    assert!(p.is_suspended());
    assert_eq!((p.min_online(), p.max_online()), (1, 1));
    assert_eq!(sim.online_mask(), 0b0001);
    assert_eq!(sim.ups(), 0);
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::SuspendCollapse)), 1);
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::Park)), 3);

    // PARKED MEANS PARKED
    std::thread::sleep(Duration::from_millis(50));
    assert!(!ctrl.executor_active());
}

#[test]
fn screen_on_within_grace_changes_nothing() {
    let mut policy = fast_policy(4);
    policy.suspend_grace_ms = 10_000;
    let (sim, hub, ctrl) = setup(policy);
    sim.set_rq_depth(15);
    let before = ctrl.policy();

    hub.screen_off();
    std::thread::sleep(Duration::from_millis(20));
    assert!(ctrl.suspend_pending());
    hub.screen_on();
    assert!(!ctrl.suspend_pending());

    std::thread::sleep(Duration::from_millis(50));
    let after = ctrl.policy();
    assert!(!after.is_suspended());
    assert_eq!((after.min_online(), after.max_online()), (before.min_online(), before.max_online()));
    assert_eq!(sim.num_online(), 4);
    assert_eq!(sim.downs(), 0);
    assert!(ctrl.executor_active());
}

#[test]
fn resume_restores_bounds_and_cores() {
    let mut policy = fast_policy(4);
    policy.set_min_online(3);
    let (sim, hub, ctrl) = setup(policy);
    sim.set_rq_depth(15);
    let before = ctrl.policy();

    hub.screen_off();
    assert!(wait_for(|| sim.num_online() == 1 && !ctrl.executor_active()));

    hub.screen_on();
    assert!(wait_for(|| !ctrl.is_suspended() && sim.num_online() == 4));
    assert!(wait_for(|| ctrl.executor_active()));

    let after = ctrl.policy();
    assert_eq!(after, before);
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::Resume)), 1);
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::Unpark)), 3);
}

#[test]
fn collapse_with_nothing_to_park_still_counts() {
    let mut policy = fast_policy(4);
    policy.set_min_online(1);
    let (sim, hub, ctrl) = setup(policy);
    sim.set_rq_depth(0);
    sim.set_all_rates(300_000);
    assert!(wait_for(|| sim.num_online() == 1));

    hub.screen_off();
    assert!(wait_for(|| ctrl.is_suspended() && !ctrl.executor_active()));
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::SuspendCollapse)), 1);
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::Park)), 0);
    assert_eq!(ctrl.with_log(|log| log.suspends()), 1);
}

#[test]
fn one_screen_cycle_is_one_suspend_and_one_resume() {
    let (sim, hub, ctrl) = setup(fast_policy(4));
    sim.set_rq_depth(15);

    hub.screen_off();
    assert!(wait_for(|| ctrl.is_suspended() && sim.num_online() == 1));
    hub.screen_on();
    assert!(wait_for(|| !ctrl.is_suspended() && sim.num_online() == 4));

    let (suspends, resumes) = ctrl.with_log(|log| (log.suspends(), log.resumes()));
    assert_eq!((suspends, resumes), (1, 1));
}

#[test]
fn repeated_screen_off_keeps_first_snapshot() {
    let (sim, hub, ctrl) = setup(fast_policy(4));
    sim.set_rq_depth(15);
    let before = ctrl.policy();

    hub.screen_off();
    assert!(wait_for(|| ctrl.is_suspended() && sim.num_online() == 1));
    // A SECOND SUSPEND WHILE SUSPENDED MUST NOT SAVE (1, 1)
    hub.screen_off();
    std::thread::sleep(Duration::from_millis(100));

    hub.screen_on();
    assert!(wait_for(|| !ctrl.is_suspended()));
    let after = ctrl.policy();
    assert_eq!((after.min_online(), after.max_online()), (before.min_online(), before.max_online()));
}

#[test]
fn wide_suspend_ceiling_only_tightens_bounds() {
    let mut policy = fast_policy(4);
    policy.max_online_suspended = 2;
    let (sim, hub, ctrl) = setup(policy);
    sim.set_rq_depth(15);

    hub.screen_off();
    assert!(wait_for(|| ctrl.is_suspended()));
    let p = ctrl.policy();
    assert_eq!((p.min_online(), p.max_online()), (1, 2));
    // THE EXECUTOR KEEPS RUNNING AND SCALES DOWN ON ITS OWN CADENCE
    assert!(ctrl.executor_active());
    sim.set_rq_depth(0);
    sim.set_all_rates(300_000);
    assert!(wait_for(|| sim.num_online() <= 2));
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::SuspendCollapse)), 0);

    hub.screen_on();
    assert!(wait_for(|| !ctrl.is_suspended()));
    assert_eq!(ctrl.policy().max_online(), 4);
    assert!(ctrl.executor_active());
}

// === ENABLE / DISABLE ===

// A PLATFORM WHOSE LOAD QUERY TAKES A WHILE, SO A CYCLE IS OBSERVABLY IN FLIGHT
struct SlowPlatform {
    sim: SimPlatform,
    sampling: AtomicBool,
    samples: AtomicU64,
}

impl Platform for SlowPlatform {
    fn nr_cpus(&self) -> usize {
        self.sim.nr_cpus()
    }
    fn is_online(&self, cpu: usize) -> bool {
        self.sim.is_online(cpu)
    }
    fn cpu_up(&self, cpu: usize) -> Result<()> {
        self.sim.cpu_up(cpu)
    }
    fn cpu_down(&self, cpu: usize) -> Result<()> {
        self.sim.cpu_down(cpu)
    }
    fn cur_rate_khz(&self, cpu: usize) -> u64 {
        self.sim.cur_rate_khz(cpu)
    }
    fn rq_depth(&self) -> u32 {
        self.sampling.store(true, Ordering::SeqCst);
        self.samples.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        self.sampling.store(false, Ordering::SeqCst);
        self.sim.rq_depth()
    }
}

#[test]
fn disable_mid_cycle_cancels_and_releases() {
    let slow = Arc::new(SlowPlatform {
        sim: SimPlatform::new(4, BUSY_KHZ),
        sampling: AtomicBool::new(false),
        samples: AtomicU64::new(0),
    });
    slow.sim.set_rq_depth(15);
    let hub = Arc::new(ScreenHub::new());
    let ctrl = Controller::new(
        Arc::clone(&slow) as Arc<dyn Platform>,
        hub.clone(),
        fast_policy(4),
    ).unwrap();
    assert_eq!(hub.registered(), 1);

    assert!(wait_for(|| slow.sampling.load(Ordering::SeqCst)));
    ctrl.set_enabled(false).unwrap();

    // THE IN-FLIGHT CYCLE FINISHED BEFORE set_enabled RETURNED
    assert!(!slow.sampling.load(Ordering::SeqCst));
    assert!(!ctrl.executor_active());
    assert_eq!(slow.sim.online_mask(), 0b0001);
    assert_eq!(hub.registered(), 0);

    let samples = slow.samples.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(slow.samples.load(Ordering::SeqCst), samples);
    assert_eq!(ctrl.get(Knob::Enabled), 0);
}

#[test]
fn disable_while_suspended_restores_bounds() {
    let (sim, hub, ctrl) = setup(fast_policy(4));
    sim.set_rq_depth(15);
    hub.screen_off();
    assert!(wait_for(|| ctrl.is_suspended() && sim.num_online() == 1));

    ctrl.set_enabled(false).unwrap();
    let p = ctrl.policy();
    assert!(!p.is_suspended());
    assert_eq!((p.min_online(), p.max_online()), (2, 4));
}

#[test]
fn reenable_starts_fresh() {
    let (sim, hub, ctrl) = setup(fast_policy(4));
    sim.set_rq_depth(15);
    ctrl.set_enabled(false).unwrap();
    assert_eq!(sim.num_online(), 1);

    // SAME VALUE: NO-OP
    ctrl.set_enabled(false).unwrap();
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::Disabled)), 1);
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::Park)), 3);

    ctrl.set_enabled(true).unwrap();
    assert_eq!(hub.registered(), 1);
    assert!(ctrl.executor_active());
    // n=1 AT RQ 15 >= 12: THE EXECUTOR GROWS AGAIN
    assert!(wait_for(|| sim.num_online() >= 2));
}

#[test]
fn screen_signals_ignored_while_disabled() {
    let mut policy = fast_policy(4);
    policy.enabled = false;
    let (sim, hub, ctrl) = setup(policy);
    hub.screen_off();
    std::thread::sleep(Duration::from_millis(100));
    assert!(!ctrl.is_suspended());
    assert_eq!(sim.num_online(), 4);
}

// === CORRECTIVE PASSES ===

#[test]
fn bound_writes_correct_topology_immediately() {
    let mut policy = fast_policy(4);
    // KEEP THE EXECUTOR OUT OF THE WAY
    policy.startup_delay_ms = 60_000;
    let (sim, _hub, ctrl) = setup(policy);

    ctrl.set_max_online(2).unwrap();
    // DESCENDING: CORE 3 FIRST, THEN CORE 2
    assert_eq!(sim.online_mask(), 0b0011);

    ctrl.set_min_online(4).unwrap();
    assert_eq!(ctrl.policy().max_online(), 4);
    assert_eq!(sim.online_mask(), 0b1111);

    ctrl.set_max_online(1).unwrap();
    assert_eq!(ctrl.policy().min_online(), 1);
    assert_eq!(sim.online_mask(), 0b0001);

    ctrl.set_min_online(2).unwrap();
    // ASCENDING: LOWEST OFFLINE CORE FIRST
    assert_eq!(sim.online_mask(), 0b0011);
    assert_eq!(ctrl.with_log(|log| log.count(EventKind::Corrective)), 8);
}

#[test]
fn bound_writes_while_disabled_leave_cores_alone() {
    let mut policy = fast_policy(4);
    policy.enabled = false;
    let (sim, _hub, ctrl) = setup(policy);
    ctrl.set_max_online(1).unwrap();
    assert_eq!(sim.num_online(), 4);
    assert_eq!(ctrl.policy().max_online(), 1);
}

// === TUNABLES ===

#[test]
fn rejected_writes_change_nothing() {
    let mut policy = fast_policy(4);
    policy.startup_delay_ms = 60_000;
    let (sim, _hub, ctrl) = setup(policy);
    let before = ctrl.policy();

    assert!(ctrl.store("min_online", "0").is_err());
    assert!(ctrl.store("max_online", "5").is_err());
    assert!(ctrl.store("max_online_suspended", "9").is_err());
    assert!(ctrl.store("poll_interval_ms", "-3").is_err());
    assert!(ctrl.store("idle_rate_khz", "fast").is_err());
    assert!(ctrl.store("rq_threshold_8", "1").is_err());
    assert!(ctrl.store("governor", "1").is_err());

    assert_eq!(ctrl.policy(), before);
    assert_eq!(sim.ups() + sim.downs(), 0);
}

#[test]
fn accepted_writes_take_effect() {
    let mut policy = fast_policy(4);
    policy.startup_delay_ms = 60_000;
    let (_sim, _hub, ctrl) = setup(policy);

    ctrl.store("poll_interval_ms", " 250\n").unwrap();
    ctrl.store("rq_threshold_3", "9").unwrap();
    ctrl.store("dwell_threshold_3", "400").unwrap();
    assert_eq!(ctrl.show("poll_interval_ms").unwrap(), 250);
    assert_eq!(ctrl.policy().thresholds.rq_depth[3], 9);
    assert_eq!(ctrl.get(Knob::DwellThreshold(3)), 400);

    // ANYTHING ABOVE 1 MEANS ON
    ctrl.store("enabled", "7").unwrap();
    assert_eq!(ctrl.show("enabled").unwrap(), 1);
}

#[test]
fn list_covers_every_knob() {
    let mut policy = fast_policy(4);
    policy.enabled = false;
    let (_sim, _hub, ctrl) = setup(policy);
    for knob in Knob::ALL {
        assert_eq!(ctrl.show(&knob.name()).unwrap(), ctrl.get(knob));
    }
}

// === TEARDOWN ===

#[test]
fn drop_cancels_everything_and_hands_cores_back() {
    let (sim, hub, ctrl) = setup(fast_policy(4));
    sim.set_rq_depth(15);
    hub.screen_off();
    assert!(wait_for(|| sim.num_online() == 1));

    drop(ctrl);
    assert_eq!(sim.num_online(), 4);
    assert_eq!(hub.registered(), 0);
    // NO DANGLING WORK: NOTHING MOVES AFTERWARDS
    let (ups, downs) = (sim.ups(), sim.downs());
    hub.screen_on();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!((sim.ups(), sim.downs()), (ups, downs));
}
