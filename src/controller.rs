// COREWARDEN CONTROLLER
// OWNS THE POLICY, THE TWO LOCKS AND THE THREE DEFERRED TASKS:
//
//   HOTPLUG  PERIODIC EXECUTOR. EVALUATES LOAD, MOVES AT MOST ONE CORE, REQUEUES.
//   SUSPEND  ARMED ON SCREEN-OFF AFTER THE GRACE PERIOD. TIGHTENS THE BOUNDS,
//            AND WITH A CEILING OF ONE PARKS THE EXECUTOR AND EVERY SECONDARY.
//   RESUME   ARMED ON SCREEN-ON. RESTORES THE BOUNDS, RESTARTS WHAT SUSPEND PARKED.
//
// LOCK ORDER: TRANSITION LOCK (cpu_lock) BEFORE BOUNDS LOCK (policy).
// NOTHING ACQUIRES cpu_lock WHILE HOLDING policy.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError, Weak};
use std::time::Duration;

use crate::decision::{Decision, DecisionState, LoadSample};
use crate::error::{Error, Result};
use crate::event::{now_ms, EventKind, EventLog, NO_CPU};
use crate::platform::{mask_string, Platform, PRIMARY_CPU};
use crate::policy::{Policy, SavedBounds, TABLE_SLOTS};
use crate::rate;
use crate::screen::{PowerHandler, PowerNotifier, RegistrationId};
use crate::work::{DelayedWork, WorkHandle};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(Error::OutOfRange { name: name.to_string(), value, min, max });
    }
    Ok(())
}

struct Works {
    hotplug: DelayedWork,
    suspend: DelayedWork,
    resume: DelayedWork,
}

impl Works {
    // ALL OR NOTHING: A FAILED SPAWN DROPS (AND JOINS) THE ONES ALREADY UP
    fn spawn(inner: &Weak<Inner>) -> Result<Self> {
        let w = inner.clone();
        let hotplug = DelayedWork::spawn("hotplug", move |handle| {
            if let Some(inner) = w.upgrade() {
                inner.hotplug_cycle(handle);
            }
        })?;
        let w = inner.clone();
        let suspend = DelayedWork::spawn("suspend", move |_| {
            if let Some(inner) = w.upgrade() {
                inner.suspend_work();
            }
        })?;
        let w = inner.clone();
        let resume = DelayedWork::spawn("resume", move |_| {
            if let Some(inner) = w.upgrade() {
                inner.resume_work();
            }
        })?;
        Ok(Self { hotplug, suspend, resume })
    }

    fn cancel_and_join(&self) {
        self.resume.cancel_sync();
        self.suspend.cancel_sync();
        self.hotplug.cancel_sync();
        self.resume.shutdown();
        self.suspend.shutdown();
        self.hotplug.shutdown();
    }
}

// REGISTERED WITH THE SCREEN SIGNAL SOURCE WHILE ENABLED
struct ScreenLink {
    inner: Weak<Inner>,
}

impl PowerHandler for ScreenLink {
    fn suspend(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.screen_off();
        }
    }

    fn resume(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.screen_on();
        }
    }
}

struct Inner {
    platform: Arc<dyn Platform>,
    notifier: Arc<dyn PowerNotifier>,
    // BOUNDS LOCK
    policy: Mutex<Policy>,
    // TRANSITION LOCK. THE EVALUATOR'S HISTORY LIVES UNDER IT.
    cpu_lock: Mutex<DecisionState>,
    // SERIALIZES ENABLE/DISABLE. Some WHILE RUNNING.
    lifecycle: Mutex<Option<RegistrationId>>,
    works: RwLock<Option<Arc<Works>>>,
    log: Mutex<EventLog>,
}

impl Inner {
    fn works(&self) -> Option<Arc<Works>> {
        self.works.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, kind: EventKind, cpu: u32, rq_depth: u32) {
        let mask = self.platform.online_mask();
        lock(&self.log).record(kind, cpu, mask, rq_depth);
    }

    fn mask(&self) -> String {
        mask_string(self.platform.online_mask(), self.platform.nr_cpus())
    }

    fn bring_up(&self, cpu: usize, kind: EventKind, rq_depth: u32) -> bool {
        if cpu == PRIMARY_CPU || self.platform.is_online(cpu) {
            return false;
        }
        match self.platform.cpu_up(cpu) {
            Ok(()) => {
                self.record(kind, cpu as u32, rq_depth);
                true
            }
            Err(e) => {
                log_warn!("CPU{} UP FAILED: {}", cpu, e);
                false
            }
        }
    }

    fn take_down(&self, cpu: usize, kind: EventKind, rq_depth: u32) -> bool {
        if cpu == PRIMARY_CPU || !self.platform.is_online(cpu) {
            return false;
        }
        match self.platform.cpu_down(cpu) {
            Ok(()) => {
                self.record(kind, cpu as u32, rq_depth);
                true
            }
            Err(e) => {
                log_warn!("CPU{} DOWN FAILED: {}", cpu, e);
                false
            }
        }
    }

    // --- LIFECYCLE ---

    fn start(self: &Arc<Self>, life: &mut Option<RegistrationId>) -> Result<()> {
        let works = Arc::new(Works::spawn(&Arc::downgrade(self))?);

        lock(&self.cpu_lock).reset();
        *self.works.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&works));
        *life = Some(self.notifier.register(Arc::new(ScreenLink {
            inner: Arc::downgrade(self),
        })));

        let delay = lock(&self.policy).startup_delay_ms;
        works.hotplug.queue(ms(delay));
        self.record(EventKind::Enabled, NO_CPU, 0);
        log_info!("ENABLED. FIRST CYCLE IN {}MS | MASK=[{}]", delay, self.mask());
        Ok(())
    }

    // CANCEL EVERY TASK AND WAIT FOR IN-FLIGHT RUNS. NO CORE IS TOUCHED.
    fn stop_tasks(&self, life: &mut Option<RegistrationId>) {
        if let Some(id) = life.take() {
            self.notifier.unregister(id);
        }
        let works = self.works.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(works) = works {
            works.cancel_and_join();
        }
        // A LATER START MUST NOT INHERIT THE SUSPENDED REGIME
        lock(&self.policy).leave_suspend();
    }

    fn stop(&self, life: &mut Option<RegistrationId>) {
        self.stop_tasks(life);
        {
            let _guard = lock(&self.cpu_lock);
            for cpu in (PRIMARY_CPU + 1)..self.platform.nr_cpus() {
                self.take_down(cpu, EventKind::Park, 0);
            }
        }
        self.record(EventKind::Disabled, NO_CPU, 0);
        log_info!("DISABLED | MASK=[{}]", self.mask());
    }

    // --- HOTPLUG EXECUTOR ---

    fn hotplug_cycle(&self, handle: &WorkHandle) {
        // COLLAPSED: RESUME RESTARTS US EXPLICITLY
        if lock(&self.policy).is_collapsed() {
            log_debug!("COLLAPSED, HOTPLUG CYCLE PARKED");
            return;
        }

        match self.cpu_lock.try_lock() {
            Ok(mut state) => self.decide_and_act(&mut state),
            Err(TryLockError::Poisoned(p)) => self.decide_and_act(&mut p.into_inner()),
            Err(TryLockError::WouldBlock) => log_debug!("TRANSITION LOCK BUSY, SKIPPING CYCLE"),
        }

        let (enabled, poll) = {
            let p = lock(&self.policy);
            (p.enabled, p.poll_interval_ms)
        };
        if enabled {
            handle.queue(ms(poll));
        }
    }

    fn decide_and_act(&self, state: &mut DecisionState) {
        let policy = lock(&self.policy).clone();
        let platform = &*self.platform;
        let sample = LoadSample {
            rq_depth: platform.rq_depth(),
            nr_online: platform.num_online(),
            slowest_rate_khz: rate::slowest_rate(platform),
        };

        let decision = state.evaluate(&policy, &sample, now_ms());
        log_debug!(
            "RQ: {} ONLINE: {} SLOWEST: {}KHZ DWELL: {}MS DECISION: {} | MASK=[{}]",
            sample.rq_depth, sample.nr_online, sample.slowest_rate_khz,
            state.dwell_ms(), decision.label(), self.mask(),
        );

        match decision {
            Decision::Disabled | Decision::Idle => {}
            Decision::ScaleDown => {
                if let Some(cpu) = rate::slowest_secondary(platform) {
                    self.take_down(cpu, EventKind::ScaleDown, sample.rq_depth);
                }
            }
            Decision::ScaleUp => {
                if let Some(cpu) = rate::first_offline_secondary(platform) {
                    self.bring_up(cpu, EventKind::ScaleUp, sample.rq_depth);
                }
            }
        }
    }

    // --- SUSPEND / RESUME COORDINATOR ---

    fn screen_off(&self) {
        let works = match self.works() {
            Some(w) => w,
            None => return,
        };
        let grace = lock(&self.policy).suspend_grace_ms;
        if works.suspend.queue(ms(grace)) {
            log_debug!("SCREEN OFF, SUSPEND IN {}MS", grace);
        }
    }

    fn screen_on(&self) {
        let works = match self.works() {
            Some(w) => w,
            None => return,
        };
        // A SUSPEND STILL IN ITS GRACE PERIOD DIES HERE. ONE STILL RUNNING FINISHES FIRST.
        if works.suspend.cancel_sync() {
            log_debug!("SCREEN ON WITHIN GRACE PERIOD, SUSPEND CANCELLED");
        }
        if lock(&self.policy).is_suspended() {
            works.resume.queue(Duration::ZERO);
        }
    }

    fn suspend_work(&self) {
        let (saved, ceiling) = {
            let mut p = lock(&self.policy);
            if !p.enabled {
                return;
            }
            match p.enter_suspend() {
                Some(saved) => (saved, p.max_online()),
                None => return,
            }
        };

        if !saved.collapsed {
            self.record(EventKind::SuspendCommit, NO_CPU, 0);
            log_info!("SCREEN -> OFF. CEILING {} CORES", ceiling);
            return;
        }

        // THE EXECUTOR MUST BE FULLY GONE BEFORE THE TEARDOWN
        if let Some(works) = self.works() {
            works.hotplug.cancel_sync();
        }
        {
            let _guard = lock(&self.cpu_lock);
            for cpu in (PRIMARY_CPU + 1)..self.platform.nr_cpus() {
                self.take_down(cpu, EventKind::Park, 0);
            }
        }
        self.record(EventKind::SuspendCollapse, NO_CPU, 0);
        log_info!("SCREEN -> OFF. HOTPLUG PARKED | MASK=[{}]", self.mask());
    }

    fn resume_work(&self) {
        let saved: SavedBounds = {
            let mut p = lock(&self.policy);
            if !p.enabled {
                return;
            }
            match p.leave_suspend() {
                Some(saved) => saved,
                None => return,
            }
        };

        if !saved.collapsed {
            self.record(EventKind::Resume, NO_CPU, 0);
            log_info!("SCREEN -> ON. BOUNDS {}..={} RESTORED", saved.min_online, saved.max_online);
            return;
        }

        {
            let mut state = lock(&self.cpu_lock);
            for cpu in (PRIMARY_CPU + 1)..self.platform.nr_cpus() {
                self.bring_up(cpu, EventKind::Unpark, 0);
            }
            // THE SCREEN-OFF SPAN IS NOT DWELL
            state.reset();
        }
        self.record(EventKind::Resume, NO_CPU, 0);
        if let Some(works) = self.works() {
            works.hotplug.queue(Duration::ZERO);
        }
        log_info!("SCREEN -> ON. HOTPLUG RESUMED | MASK=[{}]", self.mask());
    }

    // --- CORRECTIVE PASSES ---

    fn enforce_min(&self) {
        let _guard = lock(&self.cpu_lock);
        let min = lock(&self.policy).min_online();
        if self.platform.num_online() >= min {
            return;
        }
        for cpu in (PRIMARY_CPU + 1)..self.platform.nr_cpus() {
            if self.platform.num_online() >= min {
                break;
            }
            self.bring_up(cpu, EventKind::Corrective, 0);
        }
        log_info!("MIN_ONLINE SET TO {}. AFFECTED CPUS WERE HOTPLUGGED | MASK=[{}]", min, self.mask());
    }

    fn enforce_max(&self) {
        let _guard = lock(&self.cpu_lock);
        let max = lock(&self.policy).max_online();
        if self.platform.num_online() <= max {
            return;
        }
        for cpu in ((PRIMARY_CPU + 1)..self.platform.nr_cpus()).rev() {
            if self.platform.num_online() <= max {
                break;
            }
            self.take_down(cpu, EventKind::Corrective, 0);
        }
        log_info!("MAX_ONLINE SET TO {}. AFFECTED CPUS WERE UNPLUGGED | MASK=[{}]", max, self.mask());
    }
}

pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    // STARTS IMMEDIATELY IF policy.enabled. A FAILED START IS REPORTED, NOTHING LEFT BEHIND.
    pub fn new(
        platform: Arc<dyn Platform>,
        notifier: Arc<dyn PowerNotifier>,
        mut policy: Policy,
    ) -> Result<Self> {
        let nr_cpus = platform.nr_cpus();
        let want_enabled = policy.enabled;
        policy.enabled = false;
        let inner = Arc::new(Inner {
            platform,
            notifier,
            policy: Mutex::new(policy),
            cpu_lock: Mutex::new(DecisionState::new()),
            lifecycle: Mutex::new(None),
            works: RwLock::new(None),
            log: Mutex::new(EventLog::new(nr_cpus)),
        });
        let ctrl = Self { inner };
        if want_enabled {
            ctrl.set_enabled(true)?;
        }
        Ok(ctrl)
    }

    pub fn nr_cpus(&self) -> usize {
        self.inner.platform.nr_cpus()
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.inner.platform
    }

    // SNAPSHOT OF THE CURRENT POLICY
    pub fn policy(&self) -> Policy {
        lock(&self.inner.policy).clone()
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.inner.policy).enabled
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.inner.policy).is_suspended()
    }

    // TRUE WHILE THE PERIODIC EXECUTOR IS ARMED OR MID-CYCLE
    pub fn executor_active(&self) -> bool {
        self.inner
            .works()
            .map(|w| w.hotplug.is_pending() || w.hotplug.is_running())
            .unwrap_or(false)
    }

    // COMPLETED EXECUTOR CYCLES SINCE THE LAST ENABLE
    pub fn executor_runs(&self) -> u64 {
        self.inner.works().map(|w| w.hotplug.runs()).unwrap_or(0)
    }

    pub fn suspend_pending(&self) -> bool {
        self.inner.works().map(|w| w.suspend.is_pending()).unwrap_or(false)
    }

    pub fn with_log<R>(&self, f: impl FnOnce(&EventLog) -> R) -> R {
        f(&lock(&self.inner.log))
    }

    pub fn set_enabled(&self, on: bool) -> Result<()> {
        let mut life = lock(&self.inner.lifecycle);
        if on == life.is_some() {
            return Ok(());
        }
        if on {
            lock(&self.inner.policy).enabled = true;
            if let Err(e) = self.inner.start(&mut life) {
                lock(&self.inner.policy).enabled = false;
                log_warn!("START FAILED, STAYING DISABLED: {}", e);
                return Err(e);
            }
        } else {
            lock(&self.inner.policy).enabled = false;
            self.inner.stop(&mut life);
        }
        Ok(())
    }

    // RANGE 1..=nr_cpus. RAISING MIN ABOVE MAX RAISES MAX.
    pub fn set_min_online(&self, value: u64) -> Result<()> {
        check_range("min_online", value, 1, self.nr_cpus() as u64)?;
        let enabled = {
            let mut p = lock(&self.inner.policy);
            p.set_min_online(value as usize);
            p.enabled
        };
        if enabled {
            self.inner.enforce_min();
        }
        Ok(())
    }

    // RANGE 1..=nr_cpus. LOWERING MAX BELOW MIN LOWERS MIN.
    pub fn set_max_online(&self, value: u64) -> Result<()> {
        check_range("max_online", value, 1, self.nr_cpus() as u64)?;
        let enabled = {
            let mut p = lock(&self.inner.policy);
            p.set_max_online(value as usize);
            p.enabled
        };
        if enabled {
            self.inner.enforce_max();
        }
        Ok(())
    }

    pub fn set_max_online_suspended(&self, value: u64) -> Result<()> {
        check_range("max_online_suspended", value, 1, self.nr_cpus() as u64)?;
        lock(&self.inner.policy).max_online_suspended = value as usize;
        Ok(())
    }

    pub fn set_poll_interval_ms(&self, value: u64) {
        lock(&self.inner.policy).poll_interval_ms = value;
    }

    pub fn set_startup_delay_ms(&self, value: u64) {
        lock(&self.inner.policy).startup_delay_ms = value;
    }

    pub fn set_suspend_grace_ms(&self, value: u64) {
        lock(&self.inner.policy).suspend_grace_ms = value;
    }

    pub fn set_idle_rate_khz(&self, value: u64) {
        lock(&self.inner.policy).idle_rate_khz = value;
    }

    pub fn set_rq_threshold(&self, slot: usize, value: u64) -> Result<()> {
        check_range("rq_threshold slot", slot as u64, 0, TABLE_SLOTS as u64 - 1)?;
        lock(&self.inner.policy).thresholds.rq_depth[slot] = value;
        Ok(())
    }

    pub fn set_dwell_threshold(&self, slot: usize, value: u64) -> Result<()> {
        check_range("dwell_threshold slot", slot as u64, 0, TABLE_SLOTS as u64 - 1)?;
        lock(&self.inner.policy).thresholds.dwell_ms[slot] = value;
        Ok(())
    }

    // TEARDOWN: CANCEL EVERYTHING, THEN HAND EVERY CORE BACK TO THE SYSTEM.
    // IDEMPOTENT. ALSO RUNS ON DROP.
    pub fn shutdown(&self) {
        let mut life = lock(&self.inner.lifecycle);
        lock(&self.inner.policy).enabled = false;
        self.inner.stop_tasks(&mut life);
        let _guard = lock(&self.inner.cpu_lock);
        for cpu in (PRIMARY_CPU + 1)..self.nr_cpus() {
            if !self.inner.platform.is_online(cpu) {
                if let Err(e) = self.inner.platform.cpu_up(cpu) {
                    log_warn!("CPU{} RESTORE FAILED: {}", cpu, e);
                }
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
