//! TOML layout descriptions.
//!
//! ```toml
//! [[interfaces]]
//! name = "sp1060"
//! kind = "sp1060"
//! channel_num = 24
//!
//! [[interfaces]]
//! name = "chip1"
//! kind = "chip"
//! [[interfaces.channels]]
//! channel_name = "Gate1"
//! channel_num = 1
//! channel_type = "DC"
//! input = true
//! low = -0.5
//! high = 0.5
//!
//! [[connections]]
//! output = "sp1060.Ch1"
//! input = "chip1.Gate1"
//! attenuation = 0.0
//!
//! [[lines]]
//! name = "plunger"
//! connection = 0
//! [[lines.elements]]
//! name = "sweep"
//! repeat = 2
//! [[lines.elements.pulses]]
//! name = "up"
//! type = "dc_ramp"
//! amplitude_start = 0.0
//! amplitude_stop = 0.4
//! t_start = 0.0
//! duration = 0.01
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelSpec;
use crate::connection::ConnectionInfo;
use crate::error::{Error, Result};
use crate::interface::{InstrumentInterface, InterfaceKind};
use crate::pulse::Pulse;

fn default_repeat() -> usize {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub kind: InterfaceKind,
    /// Number of generated channels, SP1060 only.
    #[serde(default)]
    pub channel_num: Option<usize>,
    #[serde(default)]
    pub samp_rate: Option<f64>,
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
}

impl InterfaceConfig {
    pub fn build(&self) -> Result<InstrumentInterface> {
        let mut interface = match self.kind {
            InterfaceKind::Sp1060 => InstrumentInterface::sp1060(&self.name, self.channel_num.unwrap_or(24))?,
            kind => InstrumentInterface::new(&self.name, kind),
        };
        for spec in &self.channels {
            interface.add_channel(spec)?;
        }
        if let Some(samp_rate) = self.samp_rate {
            interface = interface.with_samp_rate(samp_rate);
        }
        Ok(interface)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub output: String,
    pub input: String,
    #[serde(flatten)]
    pub info: ConnectionInfo,
}

impl ConnectionSpec {
    pub fn new(output: &str, input: &str) -> Self {
        Self {
            output: output.to_string(),
            input: input.to_string(),
            info: ConnectionInfo::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElementConfig {
    pub name: String,
    #[serde(default)]
    pub delay: f64,
    #[serde(default = "default_repeat")]
    pub repeat: usize,
    #[serde(default)]
    pub pulses: Vec<Pulse>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LineConfig {
    pub name: String,
    /// Index into the `connections` table.
    pub connection: usize,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub init_pulse: Vec<Pulse>,
    #[serde(default)]
    pub elements: Vec<ElementConfig>,
    #[serde(default)]
    pub order: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    #[serde(default)]
    pub lines: Vec<LineConfig>,
}

impl LayoutConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(Error::Io)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::FilterKind;
    use crate::layout::Layout;

    const LAYOUT: &str = r#"
        [[interfaces]]
        name = "sp1060"
        kind = "sp1060"
        channel_num = 4
        samp_rate = 2000.0

        [[interfaces]]
        name = "chip1"
        kind = "chip"
        [[interfaces.channels]]
        channel_name = "Gate1"
        channel_num = 1
        channel_type = "DC"
        input = true
        low = -0.5
        high = 0.5

        [[connections]]
        output = "sp1060.Ch1"
        input = "chip1.Gate1"
        attenuation = 6.0
        filters = [{ kind = "low_pass", cut_off = 1000.0 }]

        [[lines]]
        name = "plunger"
        connection = 0
        start = 0.1
        order = ["sweep", "sweep"]
        [[lines.elements]]
        name = "sweep"
        delay = 0.01
        [[lines.elements.pulses]]
        name = "up"
        type = "dc_ramp"
        amplitude_start = 0.0
        amplitude_stop = 0.8
        t_start = 0.0
        duration = 0.01
    "#;

    #[test]
    fn parse_and_build() {
        let config = LayoutConfig::from_toml_str(LAYOUT).unwrap();
        assert_eq!(config.connections[0].info.gain, 1.0);
        assert_eq!(config.connections[0].info.filters[0].kind, FilterKind::LowPass);
        assert_eq!(config.lines[0].elements[0].repeat, 1);

        let layout = Layout::from_config(&config).unwrap();
        assert_eq!(layout.interface("sp1060").unwrap().samp_rate(), 2000.0);
        let line = layout.pulse_line("plunger").unwrap();
        assert_eq!(line.time_line().len(), 2);
        assert!((line.time_line()[1].t_start - 0.13).abs() < 1e-12);
        // 0.8 V behind 6 dB is about 0.4 V on the gate
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn bad_toml() {
        assert!(matches!(
            LayoutConfig::from_toml_str("[[interfaces]]\nname = 3"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            LayoutConfig::from_file("/nonexistent/layout.toml"),
            Err(Error::Io(_))
        ));
    }
}
