//! Instrument interfaces: named collections of channels sharing one sample clock.
//!
//! Two presets exist, a chip interface described channel by channel and the SP1060 DAC
//! interface whose channels `Ch1..ChN` are generated.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::channel::*;
use crate::error::{Error, Result};
use crate::utils::full_address;

/// Sample rate assumed for interfaces which do not configure one, in Hz.
pub const DEFAULT_SAMP_RATE: f64 = 1e3;

/// Voltage range of the generated SP1060 channels, in V.
pub const SP1060_RANGE: (f64, f64) = (-1.0, 1.0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Chip,
    Sp1060,
    Generic,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                InterfaceKind::Chip => "chip",
                InterfaceKind::Sp1060 => "sp1060",
                InterfaceKind::Generic => "generic",
            }
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstrumentInterface {
    name: String,
    kind: InterfaceKind,
    samp_rate: f64,
    channels: IndexMap<String, Channel>,
}

impl InstrumentInterface {
    pub fn new(name: &str, kind: InterfaceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            samp_rate: DEFAULT_SAMP_RATE,
            channels: IndexMap::new(),
        }
    }

    /// A chip interface holding the given channels.
    ///
    /// ```
    /// use pulsecompiler_backend::channel::ChannelSpec;
    /// use pulsecompiler_backend::interface::InstrumentInterface;
    ///
    /// let chip = InstrumentInterface::chip("chip1", &[
    ///     ChannelSpec::dc("Gate1", 1, -0.5, 0.5).input(),
    ///     ChannelSpec::ac("RF1", 2, 1e9).input(),
    /// ]).unwrap();
    /// assert!(chip.get_channel("chip1.Gate1").is_ok());
    /// assert!(chip.get_channel("RF1").is_ok());
    /// ```
    pub fn chip(name: &str, specs: &[ChannelSpec]) -> Result<Self> {
        let mut interface = Self::new(name, InterfaceKind::Chip);
        for spec in specs {
            interface.add_channel(spec)?;
        }
        Ok(interface)
    }

    /// The SP1060 DAC with `channel_num` DC output channels named `Ch1..ChN`.
    pub fn sp1060(name: &str, channel_num: usize) -> Result<Self> {
        let mut interface = Self::new(name, InterfaceKind::Sp1060);
        let (low, high) = SP1060_RANGE;
        for num in 1..=channel_num {
            interface.add_channel(&ChannelSpec::dc(&format!("Ch{}", num), num, low, high).group(1))?;
        }
        Ok(interface)
    }

    pub fn with_samp_rate(mut self, samp_rate: f64) -> Self {
        self.samp_rate = samp_rate;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InterfaceKind {
        self.kind
    }

    pub fn samp_rate(&self) -> f64 {
        self.samp_rate
    }

    pub fn channels(&self) -> &IndexMap<String, Channel> {
        &self.channels
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.keys().map(String::as_str).collect()
    }

    /// Registers a channel, prefixing short names with the interface name.
    pub fn add_channel(&mut self, spec: &ChannelSpec) -> Result<&Channel> {
        let channel = spec.build(&self.name)?;
        if channel.instrument() != self.name {
            return Err(Error::BadAddress(format!(
                "{} does not belong to interface {}",
                channel.name(),
                self.name
            )));
        }
        if self.channels.contains_key(channel.name()) {
            return Err(Error::DuplicateChannel(channel.name().to_string()));
        }
        let key = channel.name().to_string();
        log::debug!("interface {}: added channel {}", self.name, channel);
        Ok(self.channels.entry(key).or_insert(channel))
    }

    /// Looks a channel up by full address or by its short name.
    pub fn get_channel(&self, name: &str) -> Result<&Channel> {
        let full_name = full_address(&self.name, name);
        self.channels
            .get(&full_name)
            .ok_or(Error::UnknownChannel(full_name))
    }
}

impl fmt::Display for InstrumentInterface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} ({}, {} Sa/s) with channels:",
            self.name, self.kind, self.samp_rate
        )?;
        for channel in self.channels.values() {
            writeln!(f, "  {}", channel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sp1060_preset() {
        let dac = InstrumentInterface::sp1060("sp1060", 24).unwrap();
        assert_eq!(dac.channels().len(), 24);
        assert_eq!(dac.samp_rate(), DEFAULT_SAMP_RATE);
        let ch = dac.get_channel("sp1060.Ch24").unwrap();
        assert_eq!(ch.channel_num(), 24);
        assert_eq!(ch.group(), 1);
        assert!(!ch.is_input());
        assert_eq!(
            *ch.limit(),
            ChannelCondition::VoltageRange { low: -1., high: 1. }
        );
        assert!(matches!(
            dac.get_channel("Ch25"),
            Err(Error::UnknownChannel(name)) if name == "sp1060.Ch25"
        ));
    }

    #[test]
    fn duplicate_channels_rejected() {
        let mut chip = InstrumentInterface::new("chip", InterfaceKind::Chip);
        chip.add_channel(&ChannelSpec::dc("G1", 1, -1., 1.)).unwrap();
        assert!(matches!(
            chip.add_channel(&ChannelSpec::dc("chip.G1", 2, -1., 1.)),
            Err(Error::DuplicateChannel(_))
        ));
        assert!(matches!(
            chip.add_channel(&ChannelSpec::dc("other.G2", 2, -1., 1.)),
            Err(Error::BadAddress(_))
        ));
    }

    #[test]
    fn samp_rate_configurable() {
        let dac = InstrumentInterface::sp1060("dac", 2).unwrap().with_samp_rate(1e4);
        assert_eq!(dac.samp_rate(), 1e4);
        assert_eq!(dac.channel_names(), vec!["dac.Ch1", "dac.Ch2"]);
    }
}
