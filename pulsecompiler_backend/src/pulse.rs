//! Pulse types.
//!
//! A [`Pulse`] is a timed action sent from a sender channel to an acceptor channel. Its timing is
//! given by any two of `t_start`, `t_stop` and `duration`; the third one is derived. Inside a pulse
//! element `t_start` is an offset relative to the scheduling cursor, see [`crate::pulse_line`].
//!
//! What the pulse does is a [`PulseKind`]. The kind decides which quantity is checked against
//! channel conditions ([`PulseKind::quantities`]) and how the pulse renders onto a clock grid
//! ([`Pulse::instruction`]).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelType;
use crate::error::{Error, Result};
use crate::instruction::Instruction;

static NEXT_PULSE_ID: AtomicU64 = AtomicU64::new(1);

fn next_pulse_id() -> u64 {
    NEXT_PULSE_ID.fetch_add(1, Ordering::Relaxed)
}

fn unit_amplitude() -> f64 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PulseKind {
    /// Static DC level.
    DcFixed { amplitude: f64 },
    /// Linear DC ramp; with a `ramp_rate` (V/s) the duration may be left out.
    DcRamp {
        amplitude_start: f64,
        amplitude_stop: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ramp_rate: Option<f64>,
    },
    /// DC level generated by an AWG.
    Dc { amplitude: f64 },
    Ac {
        frequency: f64,
        #[serde(default = "unit_amplitude")]
        amplitude: f64,
        #[serde(default)]
        phase: f64,
    },
    Fast { power: f64 },
    Acquire { memory_size: usize, samp_rate: f64 },
}

impl PulseKind {
    pub fn label(&self) -> &'static str {
        match self {
            PulseKind::DcFixed { .. } => "DC fixed",
            PulseKind::DcRamp { .. } => "DC ramp",
            PulseKind::Dc { .. } => "DC",
            PulseKind::Ac { .. } => "AC",
            PulseKind::Fast { .. } => "fast",
            PulseKind::Acquire { .. } => "acquire",
        }
    }

    /// Name of the quantity checked on channels of type `channel_type`.
    pub fn quantity_name(channel_type: ChannelType) -> &'static str {
        match channel_type {
            ChannelType::DC => "amplitude",
            ChannelType::AC => "frequency",
            ChannelType::Fast => "power",
            ChannelType::Acq => "memory size",
        }
    }

    /// The values to test against a channel of type `channel_type`, or `None` when this
    /// kind of pulse cannot travel over such a channel.
    pub fn quantities(&self, channel_type: ChannelType) -> Option<Vec<f64>> {
        match (self, channel_type) {
            (PulseKind::DcFixed { amplitude }, ChannelType::DC)
            | (PulseKind::Dc { amplitude }, ChannelType::DC) => Some(vec![*amplitude]),
            (
                PulseKind::DcRamp {
                    amplitude_start,
                    amplitude_stop,
                    ..
                },
                ChannelType::DC,
            ) => Some(vec![*amplitude_start, *amplitude_stop]),
            (PulseKind::Ac { frequency, .. }, ChannelType::AC) => Some(vec![*frequency]),
            (PulseKind::Fast { power }, ChannelType::Fast) => Some(vec![*power]),
            (PulseKind::Acquire { memory_size, .. }, ChannelType::Acq) => {
                Some(vec![*memory_size as f64])
            }
            _ => None,
        }
    }

    /// Whether the generating channel holds the pulse's last value after it ends.
    pub fn holds_value(&self) -> bool {
        matches!(self, PulseKind::DcFixed { .. } | PulseKind::DcRamp { .. })
    }
}

/// Serialized form of a [`Pulse`], with optional timing fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_stop: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(flatten)]
    pub kind: PulseKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "PulseSpec", into = "PulseSpec")]
pub struct Pulse {
    name: String,
    id: u64,
    sender: Option<String>,
    acceptor: Option<String>,
    t_start: f64,
    t_stop: f64,
    duration: f64,
    kind: PulseKind,
}

fn resolve_timing(
    name: &str,
    t_start: Option<f64>,
    t_stop: Option<f64>,
    duration: Option<f64>,
) -> Result<(f64, f64, f64)> {
    let timing_err = |reason: &str| Error::PulseTiming {
        pulse: name.to_string(),
        reason: reason.to_string(),
    };
    if [t_start, t_stop, duration]
        .iter()
        .flatten()
        .any(|v| !v.is_finite())
    {
        return Err(timing_err("timing values must be finite"));
    }
    let (start, stop, dur) = match (t_start, t_stop, duration) {
        (Some(start), Some(stop), Some(dur)) => {
            let tol = 1e-12 * stop.abs().max(start.abs()).max(1.);
            if (stop - start - dur).abs() > tol {
                return Err(timing_err("t_stop - t_start does not match duration"));
            }
            (start, stop, dur)
        }
        (Some(start), None, Some(dur)) => (start, start + dur, dur),
        (None, Some(stop), Some(dur)) => (stop - dur, stop, dur),
        (Some(start), Some(stop), None) => (start, stop, stop - start),
        _ => {
            return Err(timing_err(
                "Either t_stop or t_start and duration must be specified",
            ))
        }
    };
    if dur < 0. {
        return Err(timing_err("duration must not be negative"));
    }
    Ok((start, stop, dur))
}

impl Pulse {
    /// Creates a pulse from any two of `t_start`, `t_stop` and `duration`.
    ///
    /// ```
    /// use pulsecompiler_backend::pulse::*;
    ///
    /// let p = Pulse::new("hold", PulseKind::DcFixed { amplitude: 0.2 }, None, Some(0.5), Some(0.2)).unwrap();
    /// assert!((p.t_start() - 0.3).abs() < 1e-12);
    /// assert!(Pulse::new("bad", PulseKind::DcFixed { amplitude: 0.2 }, Some(0.1), None, None).is_err());
    /// ```
    pub fn new(
        name: &str,
        kind: PulseKind,
        t_start: Option<f64>,
        t_stop: Option<f64>,
        duration: Option<f64>,
    ) -> Result<Self> {
        let duration = match (&kind, duration) {
            (
                PulseKind::DcRamp {
                    amplitude_start,
                    amplitude_stop,
                    ramp_rate: Some(rate),
                },
                None,
            ) if t_start.is_none() || t_stop.is_none() => {
                if !(*rate > 0.) {
                    return Err(Error::InvalidPulse {
                        pulse: name.to_string(),
                        reason: format!("ramp rate should be positive, got {}", rate),
                    });
                }
                Some((amplitude_stop - amplitude_start).abs() / rate)
            }
            _ => duration,
        };
        if let PulseKind::Acquire { samp_rate, .. } = kind {
            if !(samp_rate > 0.) {
                return Err(Error::InvalidPulse {
                    pulse: name.to_string(),
                    reason: format!("acquisition sample rate should be positive, got {}", samp_rate),
                });
            }
        }
        let (t_start, t_stop, duration) = resolve_timing(name, t_start, t_stop, duration)?;
        Ok(Self {
            name: name.to_string(),
            id: next_pulse_id(),
            sender: None,
            acceptor: None,
            t_start,
            t_stop,
            duration,
            kind,
        })
    }

    pub fn dc_fixed(name: &str, amplitude: f64, t_start: f64, duration: f64) -> Result<Self> {
        Self::new(name, PulseKind::DcFixed { amplitude }, Some(t_start), None, Some(duration))
    }

    /// A DC ramp; leave `duration` out to derive it from `ramp_rate`.
    pub fn dc_ramp(
        name: &str,
        amplitude_start: f64,
        amplitude_stop: f64,
        t_start: f64,
        duration: Option<f64>,
        ramp_rate: Option<f64>,
    ) -> Result<Self> {
        Self::new(
            name,
            PulseKind::DcRamp {
                amplitude_start,
                amplitude_stop,
                ramp_rate,
            },
            Some(t_start),
            None,
            duration,
        )
    }

    pub fn dc(name: &str, amplitude: f64, t_start: f64, duration: f64) -> Result<Self> {
        Self::new(name, PulseKind::Dc { amplitude }, Some(t_start), None, Some(duration))
    }

    pub fn ac(name: &str, frequency: f64, amplitude: f64, t_start: f64, duration: f64) -> Result<Self> {
        Self::new(
            name,
            PulseKind::Ac {
                frequency,
                amplitude,
                phase: 0.,
            },
            Some(t_start),
            None,
            Some(duration),
        )
    }

    pub fn fast(name: &str, power: f64, t_start: f64, duration: f64) -> Result<Self> {
        Self::new(name, PulseKind::Fast { power }, Some(t_start), None, Some(duration))
    }

    /// An acquisition window lasting `memory_size / samp_rate`.
    pub fn acquire(name: &str, memory_size: usize, samp_rate: f64, t_start: f64) -> Result<Self> {
        let duration = if samp_rate > 0. {
            Some(memory_size as f64 / samp_rate)
        } else {
            None
        };
        Self::new(
            name,
            PulseKind::Acquire {
                memory_size,
                samp_rate,
            },
            Some(t_start),
            None,
            duration.or(Some(0.)),
        )
    }

    /// Sets the sender and acceptor channel addresses.
    pub fn with_route(mut self, sender: &str, acceptor: &str) -> Self {
        self.sender = Some(sender.to_string());
        self.acceptor = Some(acceptor.to_string());
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn acceptor(&self) -> Option<&str> {
        self.acceptor.as_deref()
    }

    pub fn t_start(&self) -> f64 {
        self.t_start
    }

    pub fn t_stop(&self) -> f64 {
        self.t_stop
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn kind(&self) -> &PulseKind {
        &self.kind
    }

    pub fn quantity(&self, channel_type: ChannelType) -> Option<Vec<f64>> {
        self.kind.quantities(channel_type)
    }

    /// Fills a missing route from the given channel addresses.
    pub(crate) fn route_or(&mut self, sender: &str, acceptor: &str) {
        if self.sender.is_none() {
            self.sender = Some(sender.to_string());
        }
        if self.acceptor.is_none() {
            self.acceptor = Some(acceptor.to_string());
        }
    }

    /// The instruction rendering this pulse when it starts at `t_start` seconds.
    ///
    /// Fast pulses and acquisition windows render as unit gates.
    pub fn instruction(&self, t_start: f64) -> Instruction {
        match self.kind {
            PulseKind::DcFixed { amplitude } | PulseKind::Dc { amplitude } => {
                Instruction::new_const(amplitude)
            }
            PulseKind::DcRamp {
                amplitude_start,
                amplitude_stop,
                ..
            } => Instruction::new_linramp(
                amplitude_start,
                amplitude_stop,
                t_start,
                t_start + self.duration,
            ),
            PulseKind::Ac {
                frequency,
                amplitude,
                phase,
            } => Instruction::new_sine(frequency, Some(amplitude), Some(phase), None),
            PulseKind::Fast { .. } | PulseKind::Acquire { .. } => Instruction::new_const(1.),
        }
    }
}

impl TryFrom<PulseSpec> for Pulse {
    type Error = Error;

    fn try_from(spec: PulseSpec) -> Result<Self> {
        let mut pulse = Pulse::new(&spec.name, spec.kind, spec.t_start, spec.t_stop, spec.duration)?;
        if let Some(id) = spec.id {
            pulse.id = id;
        }
        pulse.sender = spec.sender;
        pulse.acceptor = spec.acceptor;
        Ok(pulse)
    }
}

impl From<Pulse> for PulseSpec {
    fn from(pulse: Pulse) -> Self {
        PulseSpec {
            name: pulse.name,
            id: Some(pulse.id),
            sender: pulse.sender,
            acceptor: pulse.acceptor,
            t_start: Some(pulse.t_start),
            t_stop: None,
            duration: Some(pulse.duration),
            kind: pulse.kind,
        }
    }
}

impl PartialEq for Pulse {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.id == other.id
    }
}
impl Eq for Pulse {}

impl Hash for Pulse {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.id.hash(state);
    }
}

impl fmt::Display for Pulse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} #{} ({}, {} -> {}, t_start {} s, duration {} s)",
            self.name,
            self.id,
            self.kind.label(),
            self.sender.as_deref().unwrap_or("?"),
            self.acceptor.as_deref().unwrap_or("?"),
            self.t_start,
            self.duration
        )
    }
}
