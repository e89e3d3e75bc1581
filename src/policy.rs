// COREWARDEN POLICY STATE
// PURE-RUST MODULE: ZERO THREADS, ZERO PLATFORM ACCESS.
// ONE RECORD PER CONTROLLER, GUARDED BY THE CONTROLLER'S BOUNDS LOCK.

// DEFAULTS

pub const DEFAULT_ENABLED: bool = true;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 130;
pub const DEFAULT_STARTUP_DELAY_MS: u64 = 20_000;   // LET BOOT SETTLE BEFORE THE FIRST CYCLE
pub const DEFAULT_SUSPEND_GRACE_MS: u64 = 10_000;   // SCREEN FLICKERS SHORTER THAN THIS COST NOTHING
pub const DEFAULT_MIN_ONLINE: usize = 2;
pub const DEFAULT_MAX_ONLINE_SUSPENDED: usize = 1;  // COLLAPSE TO THE PRIMARY CORE
pub const DEFAULT_IDLE_RATE_KHZ: u64 = 422_400;

// THRESHOLD TABLE
// TWO SLOTS PER ACTIVE-CORE COUNT n: (n-1)*2 SCALES UP, (n-1)*2+1 SCALES DOWN.
// RUN-QUEUE DEPTH IS IN TENTHS OF A RUNNABLE TASK, DWELL IN MILLISECONDS.

pub const TABLE_SLOTS: usize = 8;

pub const DEFAULT_RQ_THRESHOLDS: [u64; TABLE_SLOTS] = [12, 0, 20, 7, 25, 10, 0, 18];
pub const DEFAULT_DWELL_THRESHOLDS_MS: [u64; TABLE_SLOTS] = [140, 0, 140, 190, 140, 190, 0, 190];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Threshold {
    pub rq_depth: u64,
    pub dwell_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThresholdTable {
    pub rq_depth: [u64; TABLE_SLOTS],
    pub dwell_ms: [u64; TABLE_SLOTS],
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            rq_depth: DEFAULT_RQ_THRESHOLDS,
            dwell_ms: DEFAULT_DWELL_THRESHOLDS_MS,
        }
    }
}

impl ThresholdTable {
    // (UP, DOWN) THRESHOLDS FOR n ACTIVE CORES. None WHEN n IS 0 OR PAST THE TABLE.
    pub fn for_online(&self, n: usize) -> Option<(Threshold, Threshold)> {
        let idx = n.checked_sub(1)?.checked_mul(2)?;
        if idx + 1 >= TABLE_SLOTS {
            return None;
        }
        Some((self.slot(idx), self.slot(idx + 1)))
    }

    fn slot(&self, idx: usize) -> Threshold {
        Threshold {
            rq_depth: self.rq_depth[idx],
            dwell_ms: self.dwell_ms[idx],
        }
    }

    // LARGEST ACTIVE-CORE COUNT THE TABLE HAS A ROW FOR
    pub const fn covered_cores() -> usize {
        TABLE_SLOTS / 2
    }
}

// PRE-SUSPEND SNAPSHOT. EXISTS EXACTLY WHILE THE POLICY IS SUSPENDED.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SavedBounds {
    pub min_online: usize,
    pub max_online: usize,
    // TRUE WHEN THE SUSPEND STOPPED THE EXECUTOR AND TORE DOWN EVERY SECONDARY
    pub collapsed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub startup_delay_ms: u64,
    pub suspend_grace_ms: u64,
    pub max_online_suspended: usize,
    pub idle_rate_khz: u64,
    pub thresholds: ThresholdTable,
    nr_cpus: usize,
    min_online: usize,
    max_online: usize,
    saved: Option<SavedBounds>,
}

impl Policy {
    pub fn new(nr_cpus: usize) -> Self {
        let nr_cpus = nr_cpus.max(1);
        Self {
            enabled: DEFAULT_ENABLED,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            startup_delay_ms: DEFAULT_STARTUP_DELAY_MS,
            suspend_grace_ms: DEFAULT_SUSPEND_GRACE_MS,
            max_online_suspended: DEFAULT_MAX_ONLINE_SUSPENDED.min(nr_cpus),
            idle_rate_khz: DEFAULT_IDLE_RATE_KHZ,
            thresholds: ThresholdTable::default(),
            nr_cpus,
            min_online: DEFAULT_MIN_ONLINE.min(nr_cpus),
            max_online: nr_cpus,
            saved: None,
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn min_online(&self) -> usize {
        self.min_online
    }

    pub fn max_online(&self) -> usize {
        self.max_online
    }

    pub fn is_suspended(&self) -> bool {
        self.saved.is_some()
    }

    pub fn saved(&self) -> Option<SavedBounds> {
        self.saved
    }

    // SUSPENDED WITH A CEILING OF ONE: THE EXECUTOR HAS NOTHING TO DO
    pub fn is_collapsed(&self) -> bool {
        self.saved.map(|s| s.collapsed).unwrap_or(false)
    }

    // CALLERS RANGE-CHECK FIRST (1..=nr_cpus). RAISING MIN DRAGS MAX ALONG.
    pub fn set_min_online(&mut self, min: usize) {
        let min = min.clamp(1, self.nr_cpus);
        if self.max_online < min {
            self.max_online = min;
        }
        self.min_online = min;
    }

    // LOWERING MAX DRAGS MIN ALONG
    pub fn set_max_online(&mut self, max: usize) {
        let max = max.clamp(1, self.nr_cpus);
        if self.min_online > max {
            self.min_online = max;
        }
        self.max_online = max;
    }

    // SNAPSHOT THE BOUNDS AND TIGHTEN TO THE SUSPENDED CEILING.
    // RETURNS THE SNAPSHOT, OR None IF ALREADY SUSPENDED (SNAPSHOT STAYS INTACT).
    pub fn enter_suspend(&mut self) -> Option<SavedBounds> {
        if self.saved.is_some() {
            return None;
        }
        let saved = SavedBounds {
            min_online: self.min_online,
            max_online: self.max_online,
            collapsed: self.max_online_suspended <= 1,
        };
        self.saved = Some(saved);
        self.min_online = 1;
        self.max_online = self.max_online_suspended.clamp(1, self.nr_cpus);
        Some(saved)
    }

    // RESTORE THE SNAPSHOT VERBATIM. None IF NOT SUSPENDED.
    pub fn leave_suspend(&mut self) -> Option<SavedBounds> {
        let saved = self.saved.take()?;
        self.min_online = saved.min_online;
        self.max_online = saved.max_online;
        Some(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_respect_core_count() {
        let p = Policy::new(4);
        assert_eq!(p.min_online(), 2);
        assert_eq!(p.max_online(), 4);
        assert_eq!(p.max_online_suspended, 1);
        assert!(!p.is_suspended());

        let single = Policy::new(1);
        assert_eq!(single.min_online(), 1);
        assert_eq!(single.max_online(), 1);
    }

    #[test]
    fn table_rows_per_core_count() {
        let t = ThresholdTable::default();
        let (up, down) = t.for_online(2).unwrap();
        assert_eq!(up, Threshold { rq_depth: 20, dwell_ms: 140 });
        assert_eq!(down, Threshold { rq_depth: 7, dwell_ms: 190 });
        assert!(t.for_online(0).is_none());
        assert!(t.for_online(4).is_some());
        assert!(t.for_online(5).is_none());
        assert_eq!(ThresholdTable::covered_cores(), 4);
    }

    #[test]
    fn min_above_max_raises_max() {
        let mut p = Policy::new(4);
        p.set_max_online(2);
        p.set_min_online(3);
        assert_eq!((p.min_online(), p.max_online()), (3, 3));
    }

    #[test]
    fn max_below_min_lowers_min() {
        let mut p = Policy::new(4);
        p.set_min_online(3);
        p.set_max_online(1);
        assert_eq!((p.min_online(), p.max_online()), (1, 1));
    }

    #[test]
    fn suspend_snapshot_round_trips() {
        let mut p = Policy::new(4);
        p.set_min_online(3);
        let before = p.clone();
        let saved = p.enter_suspend().unwrap();
        assert!(saved.collapsed);
        assert_eq!((p.min_online(), p.max_online()), (1, 1));
        assert!(p.is_collapsed());
        // SECOND SUSPEND MUST NOT OVERWRITE THE SNAPSHOT
        assert!(p.enter_suspend().is_none());
        p.leave_suspend().unwrap();
        assert_eq!(p, before);
        assert!(p.leave_suspend().is_none());
    }

    #[test]
    fn suspend_with_wide_ceiling_is_not_collapsed() {
        let mut p = Policy::new(4);
        p.max_online_suspended = 2;
        let saved = p.enter_suspend().unwrap();
        assert!(!saved.collapsed);
        assert!(p.is_suspended());
        assert!(!p.is_collapsed());
        assert_eq!(p.max_online(), 2);
    }
}
