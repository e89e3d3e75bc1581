// COREWARDEN TUNABLE REGISTRY
// ONE NAME PER LIVE-TUNABLE FIELD. EVERY WRITE IS VALIDATED BEFORE ANYTHING
// MOVES: A REJECTED WRITE LEAVES THE CONTROLLER UNTOUCHED.

use std::sync::OnceLock;

use regex::Regex;

use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::policy::TABLE_SLOTS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Knob {
    Enabled,
    PollIntervalMs,
    StartupDelayMs,
    MaxOnlineSuspended,
    SuspendGraceMs,
    MinOnline,
    MaxOnline,
    IdleRateKhz,
    RqThreshold(usize),
    DwellThreshold(usize),
}

const RQ_PREFIX: &str = "rq_threshold_";
const DWELL_PREFIX: &str = "dwell_threshold_";

impl Knob {
    pub const ALL: [Knob; 8 + 2 * TABLE_SLOTS] = [
        Knob::Enabled,
        Knob::PollIntervalMs,
        Knob::StartupDelayMs,
        Knob::MaxOnlineSuspended,
        Knob::SuspendGraceMs,
        Knob::MinOnline,
        Knob::MaxOnline,
        Knob::IdleRateKhz,
        Knob::RqThreshold(0),
        Knob::RqThreshold(1),
        Knob::RqThreshold(2),
        Knob::RqThreshold(3),
        Knob::RqThreshold(4),
        Knob::RqThreshold(5),
        Knob::RqThreshold(6),
        Knob::RqThreshold(7),
        Knob::DwellThreshold(0),
        Knob::DwellThreshold(1),
        Knob::DwellThreshold(2),
        Knob::DwellThreshold(3),
        Knob::DwellThreshold(4),
        Knob::DwellThreshold(5),
        Knob::DwellThreshold(6),
        Knob::DwellThreshold(7),
    ];

    pub fn name(self) -> String {
        match self {
            Knob::Enabled => "enabled".into(),
            Knob::PollIntervalMs => "poll_interval_ms".into(),
            Knob::StartupDelayMs => "startup_delay_ms".into(),
            Knob::MaxOnlineSuspended => "max_online_suspended".into(),
            Knob::SuspendGraceMs => "suspend_grace_ms".into(),
            Knob::MinOnline => "min_online".into(),
            Knob::MaxOnline => "max_online".into(),
            Knob::IdleRateKhz => "idle_rate_khz".into(),
            Knob::RqThreshold(slot) => format!("{}{}", RQ_PREFIX, slot),
            Knob::DwellThreshold(slot) => format!("{}{}", DWELL_PREFIX, slot),
        }
    }

    pub fn lookup(name: &str) -> Option<Knob> {
        let knob = match name {
            "enabled" => Knob::Enabled,
            "poll_interval_ms" => Knob::PollIntervalMs,
            "startup_delay_ms" => Knob::StartupDelayMs,
            "max_online_suspended" => Knob::MaxOnlineSuspended,
            "suspend_grace_ms" => Knob::SuspendGraceMs,
            "min_online" => Knob::MinOnline,
            "max_online" => Knob::MaxOnline,
            "idle_rate_khz" => Knob::IdleRateKhz,
            _ => {
                if let Some(slot) = name.strip_prefix(RQ_PREFIX).and_then(parse_slot) {
                    Knob::RqThreshold(slot)
                } else if let Some(slot) = name.strip_prefix(DWELL_PREFIX).and_then(parse_slot) {
                    Knob::DwellThreshold(slot)
                } else {
                    return None;
                }
            }
        };
        Some(knob)
    }
}

// STRICT: "3" ONLY. NOT "03", NOT "+3".
fn parse_slot(raw: &str) -> Option<usize> {
    if raw.len() != 1 {
        return None;
    }
    raw.parse::<usize>().ok().filter(|&s| s < TABLE_SLOTS)
}

fn uint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)").expect("static regex"))
}

// ONE UNSIGNED DECIMAL: LEADING WHITESPACE OK, TRAILING TEXT IGNORED.
// EMPTY, SIGNED AND OVERFLOWING INPUT IS REJECTED.
pub fn parse_uint(name: &str, text: &str) -> Result<u64> {
    let err = || Error::Parse { name: name.to_string(), input: text.trim().to_string() };
    let caps = uint_re().captures(text).ok_or_else(err)?;
    caps[1].parse::<u64>().map_err(|_| err())
}

impl Controller {
    pub fn get(&self, knob: Knob) -> u64 {
        let p = self.policy();
        match knob {
            Knob::Enabled => p.enabled as u64,
            Knob::PollIntervalMs => p.poll_interval_ms,
            Knob::StartupDelayMs => p.startup_delay_ms,
            Knob::MaxOnlineSuspended => p.max_online_suspended as u64,
            Knob::SuspendGraceMs => p.suspend_grace_ms,
            Knob::MinOnline => p.min_online() as u64,
            Knob::MaxOnline => p.max_online() as u64,
            Knob::IdleRateKhz => p.idle_rate_khz,
            Knob::RqThreshold(slot) => p.thresholds.rq_depth[slot],
            Knob::DwellThreshold(slot) => p.thresholds.dwell_ms[slot],
        }
    }

    pub fn set(&self, knob: Knob, value: u64) -> Result<()> {
        match knob {
            // ANY NONZERO VALUE MEANS ON
            Knob::Enabled => self.set_enabled(value.min(1) == 1)?,
            Knob::PollIntervalMs => self.set_poll_interval_ms(value),
            Knob::StartupDelayMs => self.set_startup_delay_ms(value),
            Knob::MaxOnlineSuspended => self.set_max_online_suspended(value)?,
            Knob::SuspendGraceMs => self.set_suspend_grace_ms(value),
            Knob::MinOnline => self.set_min_online(value)?,
            Knob::MaxOnline => self.set_max_online(value)?,
            Knob::IdleRateKhz => self.set_idle_rate_khz(value),
            Knob::RqThreshold(slot) => self.set_rq_threshold(slot, value)?,
            Knob::DwellThreshold(slot) => self.set_dwell_threshold(slot, value)?,
        }
        log_debug!("{} = {}", knob.name().to_uppercase(), value);
        Ok(())
    }

    pub fn show(&self, name: &str) -> Result<u64> {
        let knob = Knob::lookup(name).ok_or_else(|| Error::UnknownTunable(name.to_string()))?;
        Ok(self.get(knob))
    }

    pub fn store(&self, name: &str, text: &str) -> Result<()> {
        let knob = Knob::lookup(name).ok_or_else(|| Error::UnknownTunable(name.to_string()))?;
        let value = parse_uint(name, text)?;
        self.set(knob, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_knob_round_trips_its_name() {
        for knob in Knob::ALL {
            assert_eq!(Knob::lookup(&knob.name()), Some(knob));
        }
        assert_eq!(Knob::ALL.len(), 24);
    }

    #[test]
    fn lookup_rejects_unknown_and_out_of_table() {
        assert_eq!(Knob::lookup("rq_threshold_8"), None);
        assert_eq!(Knob::lookup("dwell_threshold_"), None);
        assert_eq!(Knob::lookup("rq_threshold_01"), None);
        assert_eq!(Knob::lookup("scheduler"), None);
    }

    #[test]
    fn parse_uint_like_scanf() {
        assert_eq!(parse_uint("x", "42").unwrap(), 42);
        assert_eq!(parse_uint("x", "  7\n").unwrap(), 7);
        assert_eq!(parse_uint("x", "130ms").unwrap(), 130);
        assert!(parse_uint("x", "").is_err());
        assert!(parse_uint("x", "   ").is_err());
        assert!(parse_uint("x", "-1").is_err());
        assert!(parse_uint("x", "+1").is_err());
        assert!(parse_uint("x", "abc").is_err());
        assert!(parse_uint("x", "99999999999999999999999").is_err());
    }
}
