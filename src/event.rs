// COREWARDEN EVENT LOG
// RECORDS EVERY TOPOLOGY TRANSITION AND REGIME CHANGE
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION ON THE HOTPLUG PATH.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

use crate::platform::mask_string;

const MAX_EVENTS: usize = 4096;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    ScaleUp = 0,
    ScaleDown = 1,
    SuspendCommit = 2,
    SuspendCollapse = 3,
    Resume = 4,
    Corrective = 5,
    Enabled = 6,
    Disabled = 7,
    Park = 8,
    Unpark = 9,
}

impl EventKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::ScaleUp => "UP",
            Self::ScaleDown => "DOWN",
            Self::SuspendCommit => "SUSPEND",
            Self::SuspendCollapse => "COLLAPSE",
            Self::Resume => "RESUME",
            Self::Corrective => "CORRECT",
            Self::Enabled => "ENABLE",
            Self::Disabled => "DISABLE",
            Self::Park => "PARK",
            Self::Unpark => "UNPARK",
        }
    }
}

// CORE INDEX FOR EVENTS THAT DON'T TOUCH A SINGLE CORE
pub const NO_CPU: u32 = u32::MAX;

#[derive(Clone, Copy)]
pub struct Event {
    pub ts_ns:       u64,
    pub kind:        EventKind,
    pub cpu:         u32,
    pub online_mask: u64,
    pub rq_depth:    u32,
}

pub struct EventLog {
    events:  Vec<Event>,
    head:    usize,
    len:     usize,
    nr_cpus: usize,
}

impl EventLog {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            events: vec![
                Event { ts_ns: 0, kind: EventKind::Enabled, cpu: NO_CPU,
                        online_mask: 0, rq_depth: 0 };
                MAX_EVENTS
            ],
            head: 0,
            len: 0,
            nr_cpus,
        }
    }

    // RECORD ONE EVENT. OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn record(&mut self, kind: EventKind, cpu: u32, online_mask: u64, rq_depth: u32) {
        self.events[self.head] = Event {
            ts_ns: now_ns(),
            kind,
            cpu,
            online_mask,
            rq_depth,
        };
        self.head = (self.head + 1) % MAX_EVENTS;
        if self.len < MAX_EVENTS {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.iter_chronological().filter(|e| e.kind == kind).count()
    }

    // ONE PER COMMITTED SUSPEND, HOWEVER MANY CORES IT PARKED
    pub fn suspends(&self) -> usize {
        self.count(EventKind::SuspendCommit) + self.count(EventKind::SuspendCollapse)
    }

    pub fn resumes(&self) -> usize {
        self.count(EventKind::Resume)
    }

    // ITERATE EVENTS IN CHRONOLOGICAL ORDER
    pub fn iter_chronological(&self) -> impl Iterator<Item = &Event> {
        let start = if self.len < MAX_EVENTS { 0 } else { self.head };
        (0..self.len).map(move |i| {
            &self.events[(start + i) % MAX_EVENTS]
        })
    }

    // DUMP THE TIME SERIES
    pub fn dump(&self) {
        let mut iter = self.iter_chronological();
        let first = match iter.next() {
            Some(e) => e,
            None => return,
        };
        let base_ts = first.ts_ns;

        println!("\n{:<10} {:<10} {:<6} {:<10} {:<8}",
            "TIME_S", "EVENT", "CPU", "MASK", "RQ");
        println!("{}", "-".repeat(48));

        for e in std::iter::once(first).chain(iter) {
            let elapsed_s = e.ts_ns.saturating_sub(base_ts) as f64 / 1_000_000_000.0;
            let cpu = if e.cpu == NO_CPU { "-".to_string() } else { e.cpu.to_string() };
            println!("{:<10.3} {:<10} {:<6} {:<10} {:<8}",
                elapsed_s, e.kind.label(), cpu,
                mask_string(e.online_mask, self.nr_cpus), e.rq_depth);
        }

        if self.len == MAX_EVENTS {
            println!("\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} EVENTS)", MAX_EVENTS);
        }
        println!("TOTAL EVENTS: {}", self.len);
    }

    // SUMMARY STATISTICS
    pub fn summary(&self) {
        if self.len == 0 {
            return;
        }

        let events: Vec<&Event> = self.iter_chronological().collect();
        let (first, last) = match (events.first(), events.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return,
        };
        let elapsed_s = last.ts_ns.saturating_sub(first.ts_ns) as f64 / 1_000_000_000.0;
        let peak_online = events.iter()
            .map(|e| e.online_mask.count_ones())
            .max()
            .unwrap_or(0);

        println!("\n{}", "=".repeat(50));
        println!("COREWARDEN SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  SCALE UP:          {}", self.count(EventKind::ScaleUp));
        println!("  SCALE DOWN:        {}", self.count(EventKind::ScaleDown));
        println!("  CORRECTIVE:        {}", self.count(EventKind::Corrective));
        println!("  SUSPENDS:          {}", self.suspends());
        println!("  RESUMES:           {}", self.resumes());
        println!("  PEAK ONLINE:       {}", peak_online);
        println!("  ELAPSED:           {:.1}s", elapsed_s);
        println!("  EVENTS:            {}", self.len);
    }
}

pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

pub fn now_ms() -> u64 {
    now_ns() / 1_000_000
}
