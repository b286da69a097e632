//! Routed signal paths between instrument channels.
//!
//! A [`Connection`] is a chain of `(output, input)` channel pairs of one [`ChannelType`], together with
//! the attenuation, gain and filters a signal meets along the way. The first channel of the chain is
//! the sender, the last one the acceptor.
//!
//! Output channels see the values a pulse is programmed with. Input channels see them after the
//! connection: amplitudes scale by `gain * 10^(-attenuation / 20)`, powers shift by
//! `20 * log10(gain) - attenuation` dB, frequencies and memory sizes pass unchanged.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ChannelType};
use crate::error::{Error, Result};
use crate::pulse::{Pulse, PulseKind};
use crate::validation::{Violation, ViolationKind};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    LowPass,
    HighPass,
    BandPass { bandwidth: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub kind: FilterKind,
    pub cut_off: f64,
}

impl Filter {
    pub fn low_pass(cut_off: f64) -> Self {
        Self {
            kind: FilterKind::LowPass,
            cut_off,
        }
    }

    pub fn high_pass(cut_off: f64) -> Self {
        Self {
            kind: FilterKind::HighPass,
            cut_off,
        }
    }

    /// Pass band of width `bandwidth` centred on `centre`.
    pub fn band_pass(centre: f64, bandwidth: f64) -> Self {
        Self {
            kind: FilterKind::BandPass { bandwidth },
            cut_off: centre,
        }
    }

    /// Whether a tone at `frequency` gets through. Band edges pass.
    pub fn passes(&self, frequency: f64) -> bool {
        match self.kind {
            FilterKind::LowPass => frequency <= self.cut_off,
            FilterKind::HighPass => frequency >= self.cut_off,
            FilterKind::BandPass { bandwidth } => (frequency - self.cut_off).abs() <= bandwidth / 2.,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            FilterKind::LowPass => write!(f, "low-pass {} Hz", self.cut_off),
            FilterKind::HighPass => write!(f, "high-pass {} Hz", self.cut_off),
            FilterKind::BandPass { bandwidth } => {
                write!(f, "band-pass {} Hz (bw {} Hz)", self.cut_off, bandwidth)
            }
        }
    }
}

/// Attenuation (dB), gain (a.u.) and filters of a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub attenuation: f64,
    #[serde(default = "ConnectionInfo::unit_gain")]
    pub gain: f64,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl ConnectionInfo {
    fn unit_gain() -> f64 {
        1.0
    }

    pub fn new(attenuation: f64, gain: f64, filters: Vec<Filter>) -> Self {
        Self {
            attenuation,
            gain,
            filters,
        }
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self::new(0., 1., Vec::new())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Connection {
    info: ConnectionInfo,
    chain: Vec<Channel>,
}

impl Connection {
    pub fn new(info: ConnectionInfo) -> Self {
        Self {
            info,
            chain: Vec::new(),
        }
    }

    /// Appends an `(output, input)` pair to the chain.
    ///
    /// ```
    /// use pulsecompiler_backend::channel::ChannelSpec;
    /// use pulsecompiler_backend::connection::*;
    ///
    /// let out = ChannelSpec::dc("Ch1", 1, -1., 1.).build("dac").unwrap();
    /// let gate = ChannelSpec::dc("G1", 1, -0.5, 0.5).input().build("chip").unwrap();
    /// let mut conn = Connection::default();
    /// conn.connect(&out, &gate).unwrap();
    /// assert_eq!(conn.sender().unwrap().name(), "dac.Ch1");
    /// assert_eq!(conn.acceptor().unwrap().name(), "chip.G1");
    /// // The pair is not accepted the other way round
    /// assert!(Connection::default().connect(&gate, &out).is_err());
    /// ```
    pub fn connect(&mut self, output: &Channel, input: &Channel) -> Result<()> {
        if output.channel_type() != input.channel_type() {
            return Err(Error::ChannelTypeMismatch {
                output: output.name().to_string(),
                output_type: output.channel_type().to_string(),
                input: input.name().to_string(),
                input_type: input.channel_type().to_string(),
            });
        }
        if output.is_input() {
            return Err(Error::OutputIsInput(output.name().to_string()));
        }
        if !input.is_input() {
            return Err(Error::InputIsOutput(input.name().to_string()));
        }
        if let Some(chain_type) = self.chain_type() {
            if chain_type != output.channel_type() {
                return Err(Error::ChainTypeMismatch {
                    chain_type: chain_type.to_string(),
                    channel: output.name().to_string(),
                    channel_type: output.channel_type().to_string(),
                });
            }
        }
        self.chain.push(output.clone());
        self.chain.push(input.clone());
        Ok(())
    }

    pub fn chain(&self) -> &[Channel] {
        &self.chain
    }

    pub fn chain_type(&self) -> Option<ChannelType> {
        self.chain.first().map(Channel::channel_type)
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn set_info(&mut self, info: ConnectionInfo) {
        self.info = info;
    }

    pub fn attenuation(&self) -> f64 {
        self.info.attenuation
    }

    pub fn gain(&self) -> f64 {
        self.info.gain
    }

    pub fn filters(&self) -> &[Filter] {
        &self.info.filters
    }

    pub fn sender(&self) -> Result<&Channel> {
        self.chain.first().ok_or(Error::EmptyConnection)
    }

    pub fn acceptor(&self) -> Result<&Channel> {
        self.chain.last().ok_or(Error::EmptyConnection)
    }

    /// Whether the pulse is routed between the two ends of this connection.
    pub fn check_pulse(&self, pulse: &Pulse) -> bool {
        match (self.sender(), self.acceptor()) {
            (Ok(sender), Ok(acceptor)) => {
                pulse.sender() == Some(sender.name()) && pulse.acceptor() == Some(acceptor.name())
            }
            _ => false,
        }
    }

    /// Value of `quantity` as seen by a channel after the connection.
    pub fn transformed(&self, channel_type: ChannelType, value: f64) -> f64 {
        match channel_type {
            ChannelType::DC => value * self.info.gain * 10f64.powf(-self.info.attenuation / 20.),
            ChannelType::Fast => value + 20. * self.info.gain.log10() - self.info.attenuation,
            ChannelType::AC | ChannelType::Acq => value,
        }
    }

    /// Checks the pulse against the condition of every channel in the chain, and AC pulses
    /// against every filter of the connection.
    pub fn check_conditions(&self, pulse: &Pulse) -> Vec<Violation> {
        let mut violations = Vec::new();
        let chain_type = match self.chain_type() {
            Some(chain_type) => chain_type,
            None => return violations,
        };
        let values = match pulse.quantity(chain_type) {
            Some(values) => values,
            None => {
                violations.push(Violation::new(
                    pulse.name(),
                    None,
                    ViolationKind::Unsupported {
                        pulse_kind: pulse.kind().label(),
                        channel_type: chain_type,
                    },
                ));
                return violations;
            }
        };
        for channel in &self.chain {
            for &raw in &values {
                let value = if channel.is_input() {
                    self.transformed(chain_type, raw)
                } else {
                    raw
                };
                if !channel.condition(value) {
                    violations.push(Violation::new(
                        pulse.name(),
                        Some(channel.name()),
                        ViolationKind::Condition {
                            quantity: PulseKind::quantity_name(chain_type),
                            value,
                            limit: *channel.limit(),
                        },
                    ));
                }
            }
        }
        if let PulseKind::Ac { frequency, .. } = pulse.kind() {
            for filter in self.info.filters.iter().filter(|f| !f.passes(*frequency)) {
                violations.push(Violation::new(
                    pulse.name(),
                    None,
                    ViolationKind::Filter {
                        filter: *filter,
                        frequency: *frequency,
                    },
                ));
            }
        }
        violations
    }

    pub fn connection_conditions_satisfied(&self, pulse: &Pulse) -> bool {
        self.check_pulse(pulse) && self.check_conditions(pulse).is_empty()
    }
}

/// Connections are equal when their chains run over the same channels.
impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.chain.len() == other.chain.len()
            && self
                .chain
                .iter()
                .zip(other.chain.iter())
                .all(|(a, b)| a.name() == b.name())
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let chain = self
            .chain
            .iter()
            .map(|ch| ch.name())
            .collect::<Vec<_>>()
            .join(" -> ");
        write!(
            f,
            "Connection [{}] (attenuation {} dB, gain {}",
            chain, self.info.attenuation, self.info.gain
        )?;
        if !self.info.filters.is_empty() {
            let filters = self
                .info
                .filters
                .iter()
                .map(|flt| flt.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, ", filters: {}", filters)?;
        }
        write!(f, ")")
    }
}
