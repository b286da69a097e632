//! Physical channels of an instrument interface and the conditions limiting what they accept.
//!
//! A [`Channel`] is addressed as `instrument.channel` and carries exactly one [`ChannelCondition`]
//! whose kind is fixed by the [`ChannelType`]:
//!
//! | type   | condition                      | checked quantity           |
//! |--------|--------------------------------|----------------------------|
//! | `DC`   | `VoltageRange { low, high }`   | amplitude in V             |
//! | `AC`   | `CutOff { cut_off }`           | frequency in Hz            |
//! | `Fast` | `MaxPower { max_power }`       | power in dBm               |
//! | `Acq`  | `MaxMemory { max_memory_size }`| number of acquired samples |
//!
//! Channels are usually described through a [`ChannelSpec`], which is also the shape channels take
//! in layout TOML files.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::split_address;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    DC,
    AC,
    Fast,
    Acq,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ChannelType::DC => "DC",
                ChannelType::AC => "AC",
                ChannelType::Fast => "Fast",
                ChannelType::Acq => "Acq",
            }
        )
    }
}

/// The physical limit of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChannelCondition {
    VoltageRange { low: f64, high: f64 },
    CutOff { cut_off: f64 },
    MaxPower { max_power: f64 },
    MaxMemory { max_memory_size: usize },
}

impl ChannelCondition {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            ChannelCondition::VoltageRange { .. } => ChannelType::DC,
            ChannelCondition::CutOff { .. } => ChannelType::AC,
            ChannelCondition::MaxPower { .. } => ChannelType::Fast,
            ChannelCondition::MaxMemory { .. } => ChannelType::Acq,
        }
    }

    /// Returns `true` if `value` respects the limit. `NaN` never does.
    pub fn check(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        match *self {
            ChannelCondition::VoltageRange { low, high } => low <= value && value <= high,
            ChannelCondition::CutOff { cut_off } => value <= cut_off,
            ChannelCondition::MaxPower { max_power } => value <= max_power,
            ChannelCondition::MaxMemory { max_memory_size } => value <= max_memory_size as f64,
        }
    }
}

impl fmt::Display for ChannelCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChannelCondition::VoltageRange { low, high } => write!(f, "[{}, {}] V", low, high),
            ChannelCondition::CutOff { cut_off } => write!(f, "<= {} Hz", cut_off),
            ChannelCondition::MaxPower { max_power } => write!(f, "<= {} dBm", max_power),
            ChannelCondition::MaxMemory { max_memory_size } => {
                write!(f, "<= {} samples", max_memory_size)
            }
        }
    }
}

/// A single addressable channel, e.g. `sp1060.Ch1` or `chip1.Gate3`.
#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    name: String,
    channel_num: usize,
    group: usize,
    input: bool,
    condition: ChannelCondition,
}

impl Channel {
    /// Creates a channel. The channel type is the one of its condition.
    ///
    /// Fails on a name which is not a full `instrument.channel` address, on
    /// an empty voltage range and on non-finite limits.
    ///
    /// ```
    /// use pulsecompiler_backend::channel::*;
    ///
    /// let ch = Channel::new("sp1060.Ch1", 1, 1, false,
    ///     ChannelCondition::VoltageRange { low: -1., high: 1. }).unwrap();
    /// assert_eq!(ch.channel_type(), ChannelType::DC);
    /// assert!(ch.condition(0.5));
    /// assert!(!ch.condition(1.5));
    /// ```
    pub fn new(
        name: &str,
        channel_num: usize,
        group: usize,
        input: bool,
        condition: ChannelCondition,
    ) -> Result<Self> {
        split_address(name)?;
        let invalid = |reason: String| Error::InvalidCondition {
            channel: name.to_string(),
            reason,
        };
        match condition {
            ChannelCondition::VoltageRange { low, high } => {
                if !(low.is_finite() && high.is_finite()) {
                    return Err(invalid(format!("non-finite voltage range [{}, {}]", low, high)));
                }
                if low > high {
                    return Err(invalid(format!("low {} is above high {}", low, high)));
                }
            }
            ChannelCondition::CutOff { cut_off: limit } | ChannelCondition::MaxPower { max_power: limit } => {
                if limit.is_nan() {
                    return Err(invalid("limit is NaN".to_string()));
                }
            }
            ChannelCondition::MaxMemory { .. } => {}
        }
        Ok(Self {
            name: name.to_string(),
            channel_num,
            group,
            input,
            condition,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instrument part of the address.
    pub fn instrument(&self) -> &str {
        self.name.split_once('.').map_or("", |(inst, _)| inst)
    }

    pub fn short_name(&self) -> &str {
        self.name.split_once('.').map_or(&self.name, |(_, chan)| chan)
    }

    pub fn channel_num(&self) -> usize {
        self.channel_num
    }

    pub fn channel_type(&self) -> ChannelType {
        self.condition.channel_type()
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn is_input(&self) -> bool {
        self.input
    }

    pub fn limit(&self) -> &ChannelCondition {
        &self.condition
    }

    /// Tests a value against the channel condition.
    pub fn condition(&self, value: f64) -> bool {
        self.condition.check(value)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({} {}, #{}, group {}, {})",
            self.name,
            self.channel_type(),
            if self.input { "input" } else { "output" },
            self.channel_num,
            self.group,
            self.condition
        )
    }
}

/// Serializable channel description.
///
/// The condition keys that apply depend on `channel_type`: `low`/`high` for DC,
/// `cut_off` for AC, `max_power` for Fast and `max_memory_size` for Acq.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub channel_name: String,
    #[serde(default)]
    pub channel_num: usize,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub group: usize,
    #[serde(default)]
    pub input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cut_off: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_power: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_size: Option<usize>,
}

impl ChannelSpec {
    fn bare(channel_name: &str, channel_num: usize, channel_type: ChannelType) -> Self {
        Self {
            channel_name: channel_name.to_string(),
            channel_num,
            channel_type,
            group: 0,
            input: false,
            low: None,
            high: None,
            cut_off: None,
            max_power: None,
            max_memory_size: None,
        }
    }

    pub fn dc(channel_name: &str, channel_num: usize, low: f64, high: f64) -> Self {
        Self {
            low: Some(low),
            high: Some(high),
            ..Self::bare(channel_name, channel_num, ChannelType::DC)
        }
    }

    pub fn ac(channel_name: &str, channel_num: usize, cut_off: f64) -> Self {
        Self {
            cut_off: Some(cut_off),
            ..Self::bare(channel_name, channel_num, ChannelType::AC)
        }
    }

    pub fn fast(channel_name: &str, channel_num: usize, max_power: f64) -> Self {
        Self {
            max_power: Some(max_power),
            ..Self::bare(channel_name, channel_num, ChannelType::Fast)
        }
    }

    pub fn acq(channel_name: &str, channel_num: usize, max_memory_size: usize) -> Self {
        Self {
            max_memory_size: Some(max_memory_size),
            ..Self::bare(channel_name, channel_num, ChannelType::Acq)
        }
    }

    pub fn input(mut self) -> Self {
        self.input = true;
        self
    }

    pub fn group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    /// Picks the condition matching `channel_type` out of the optional keys.
    pub fn condition(&self) -> Result<ChannelCondition> {
        let missing = |keys: &str| Error::InvalidCondition {
            channel: self.channel_name.clone(),
            reason: format!("a {} channel needs {}", self.channel_type, keys),
        };
        match self.channel_type {
            ChannelType::DC => match (self.low, self.high) {
                (Some(low), Some(high)) => Ok(ChannelCondition::VoltageRange { low, high }),
                _ => Err(missing("`low` and `high`")),
            },
            ChannelType::AC => self
                .cut_off
                .map(|cut_off| ChannelCondition::CutOff { cut_off })
                .ok_or_else(|| missing("`cut_off`")),
            ChannelType::Fast => self
                .max_power
                .map(|max_power| ChannelCondition::MaxPower { max_power })
                .ok_or_else(|| missing("`max_power`")),
            ChannelType::Acq => self
                .max_memory_size
                .map(|max_memory_size| ChannelCondition::MaxMemory { max_memory_size })
                .ok_or_else(|| missing("`max_memory_size`")),
        }
    }

    /// Builds the channel under `interface`, prefixing short names.
    pub fn build(&self, interface: &str) -> Result<Channel> {
        let name = crate::utils::full_address(interface, &self.channel_name);
        Channel::new(&name, self.channel_num, self.group, self.input, self.condition()?)
    }
}
