// COREWARDEN LOAD EVALUATOR
// PURE DECISION ENGINE: NO THREADS, NO PLATFORM ACCESS, EXPLICIT CLOCK.
//
// DWELL TIME ACCUMULATES WHILE THE RUN-QUEUE STAYS ABOVE THE UP THRESHOLD
// OR BELOW THE DOWN THRESHOLD FOR THE CURRENT CORE COUNT. THE NEUTRAL BAND
// BETWEEN THEM DISCARDS IT, AND SO DOES EVERY TRANSITION. ONE NOISY SAMPLE
// CAN NEVER MOVE A CORE.

use crate::policy::Policy;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Decision {
    Disabled = 0,
    Idle = 1,
    ScaleDown = 2,
    ScaleUp = 3,
}

impl Decision {
    pub fn label(self) -> &'static str {
        match self {
            Self::Disabled => "DISABLED",
            Self::Idle => "IDLE",
            Self::ScaleDown => "DOWN",
            Self::ScaleUp => "UP",
        }
    }
}

// ONE OBSERVATION OF THE SYSTEM, TAKEN BY THE EXECUTOR EACH CYCLE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadSample {
    pub rq_depth: u32,
    pub nr_online: usize,
    // SLOWEST ONLINE CORE, KHZ
    pub slowest_rate_khz: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionState {
    dwell_ms: u64,
    last_sample_ms: u64,
    first_call: bool,
}

impl Default for DecisionState {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionState {
    pub fn new() -> Self {
        Self {
            dwell_ms: 0,
            last_sample_ms: 0,
            first_call: true,
        }
    }

    // FORGET ALL HISTORY: THE NEXT CALL IS A FIRST CALL AGAIN
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn dwell_ms(&self) -> u64 {
        self.dwell_ms
    }

    // now_ms IS ANY MONOTONIC MILLISECOND CLOCK
    pub fn evaluate(&mut self, policy: &Policy, sample: &LoadSample, now_ms: u64) -> Decision {
        if !policy.enabled {
            return Decision::Disabled;
        }

        let elapsed = if self.first_call {
            self.first_call = false;
            0
        } else {
            now_ms.saturating_sub(self.last_sample_ms)
        };
        self.dwell_ms = self.dwell_ms.saturating_add(elapsed);

        let n = sample.nr_online;
        let rq = sample.rq_depth as u64;
        let mut decision = Decision::Idle;

        match policy.thresholds.for_online(n) {
            // NO ROW FOR THIS CORE COUNT (NONE ONLINE, OR PAST THE TABLE)
            None => self.dwell_ms = 0,
            Some((up, down)) => {
                if n < policy.nr_cpus() && rq >= up.rq_depth {
                    if self.dwell_ms >= up.dwell_ms && n < policy.max_online() {
                        // EXISTING CORES ALREADY IDLE-CLOCKED: ANOTHER ONE WON'T HELP
                        decision = if sample.slowest_rate_khz <= policy.idle_rate_khz {
                            Decision::Idle
                        } else {
                            Decision::ScaleUp
                        };
                    }
                } else if n > 1 && rq <= down.rq_depth {
                    if self.dwell_ms >= down.dwell_ms && n > policy.min_online() {
                        // STILL BUSY-CLOCKED: THE CAPACITY IS IN USE
                        decision = if sample.slowest_rate_khz > policy.idle_rate_khz {
                            Decision::Idle
                        } else {
                            Decision::ScaleDown
                        };
                    }
                } else {
                    self.dwell_ms = 0;
                }
            }
        }

        if decision != Decision::Idle {
            self.dwell_ms = 0;
        }

        self.last_sample_ms = now_ms;
        decision
    }
}
