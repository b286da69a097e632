//! Violations found while checking scheduled pulses against connections and channel conditions.

use std::fmt;

use crate::channel::{ChannelCondition, ChannelType};
use crate::connection::Filter;
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum ViolationKind {
    /// The pulse's sender/acceptor are not the ends of the line's connection.
    Route {
        expected_sender: String,
        expected_acceptor: String,
        sender: Option<String>,
        acceptor: Option<String>,
    },
    /// A value seen by a channel falls outside its condition.
    Condition {
        quantity: &'static str,
        value: f64,
        limit: ChannelCondition,
    },
    /// An AC frequency blocked by a filter on the connection.
    Filter { filter: Filter, frequency: f64 },
    /// The pulse kind cannot travel over channels of this type.
    Unsupported {
        pulse_kind: &'static str,
        channel_type: ChannelType,
    },
    /// Two lines drive the same sender channel at the same time.
    Overlap {
        other_line: String,
        other_pulse: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Violation {
    pub line: String,
    pub pulse: String,
    pub channel: Option<String>,
    pub kind: ViolationKind,
}

impl Violation {
    pub fn new(pulse: &str, channel: Option<&str>, kind: ViolationKind) -> Self {
        Self {
            line: String::new(),
            pulse: pulse.to_string(),
            channel: channel.map(str::to_string),
            kind,
        }
    }

    pub fn on_line(mut self, line: &str) -> Self {
        self.line = line.to_string();
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}, pulse {}", self.line, self.pulse)?;
        if let Some(channel) = &self.channel {
            write!(f, ", channel {}", channel)?;
        }
        write!(f, ": ")?;
        match &self.kind {
            ViolationKind::Route {
                expected_sender,
                expected_acceptor,
                sender,
                acceptor,
            } => write!(
                f,
                "routed {} -> {} but the connection runs {} -> {}",
                sender.as_deref().unwrap_or("?"),
                acceptor.as_deref().unwrap_or("?"),
                expected_sender,
                expected_acceptor
            ),
            ViolationKind::Condition {
                quantity,
                value,
                limit,
            } => write!(f, "{} {} outside {}", quantity, value, limit),
            ViolationKind::Filter { filter, frequency } => {
                write!(f, "frequency {} Hz blocked by {} filter", frequency, filter)
            }
            ViolationKind::Unsupported {
                pulse_kind,
                channel_type,
            } => write!(f, "{} pulse on a {} connection", pulse_kind, channel_type),
            ViolationKind::Overlap {
                other_line,
                other_pulse,
            } => write!(
                f,
                "overlaps pulse {} of line {} on the same sender",
                other_pulse, other_line
            ),
        }
    }
}

/// Outcome of [`crate::layout::Layout::validate`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
    pub checked_pulses: usize,
    pub checked_lines: usize,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::ConditionsViolated(self.violations))
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} line(s), {} pulse(s) checked, {} violation(s)",
            self.checked_lines,
            self.checked_pulses,
            self.violations.len()
        )?;
        for violation in &self.violations {
            write!(f, "\n  - {}", violation)?;
        }
        Ok(())
    }
}
