// Address parsing and small timing helpers shared across the crate
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;

use crate::error::{Error, Result};

fn address_regex() -> &'static Regex {
    static ADDRESS: OnceLock<Regex> = OnceLock::new();
    ADDRESS.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_\-]*)\.([A-Za-z0-9_\-/]+)$")
            .expect("channel address pattern is a valid regex")
    })
}

/// Splits a full channel address `instrument.channel` into its two parts.
///
/// ```
/// # use pulsecompiler_backend::utils::split_address;
/// assert_eq!(split_address("sp1060.Ch3").unwrap(), ("sp1060", "Ch3"));
/// assert!(split_address("Ch3").is_err());
/// ```
pub fn split_address(address: &str) -> Result<(&str, &str)> {
    let caps = address_regex()
        .captures(address)
        .ok_or_else(|| Error::BadAddress(address.to_string()))?;
    match (caps.get(1), caps.get(2)) {
        (Some(inst), Some(chan)) => Ok((inst.as_str(), chan.as_str())),
        _ => Err(Error::BadAddress(address.to_string())),
    }
}

/// Joins an interface name and a short channel name. Names that already
/// carry an instrument prefix are returned unchanged.
pub fn full_address(interface: &str, channel: &str) -> String {
    if channel.contains('.') {
        channel.to_string()
    } else {
        format!("{}.{}", interface, channel)
    }
}

/// Rounds a time in seconds to the nearest tick of a clock running at `samp_rate`.
pub fn time_to_pos(t: f64, samp_rate: f64) -> usize {
    (t * samp_rate).round().max(0.) as usize
}

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_parts() {
        assert_eq!(split_address("chip1.Gate_2").unwrap(), ("chip1", "Gate_2"));
        assert_eq!(split_address("daq.ai0/diff").unwrap(), ("daq", "ai0/diff"));
        assert!(matches!(split_address("chip1."), Err(Error::BadAddress(_))));
        assert!(matches!(split_address(".Ch1"), Err(Error::BadAddress(_))));
        assert!(matches!(split_address("a.b.c"), Err(Error::BadAddress(_))));
    }

    #[test]
    fn full_address_prefixes_short_names() {
        assert_eq!(full_address("sp1060", "Ch1"), "sp1060.Ch1");
        assert_eq!(full_address("sp1060", "other.Ch1"), "other.Ch1");
    }

    #[test]
    fn rounding_to_ticks() {
        assert_eq!(time_to_pos(0.0016, 1e3), 2);
        assert_eq!(time_to_pos(0.1, 123.), 12);
        assert_eq!(time_to_pos(-1e-12, 1e3), 0);
    }
}
