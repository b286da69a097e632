//! Python bindings, enabled with the `python` feature.
//!
//! ```python
//! from pulsecompiler_backend import Layout
//!
//! layout = Layout()
//! layout.add_sp1060_interface("sp1060", 24)
//! layout.add_chip_interface("chip1")
//! layout.add_channel("chip1", "Gate1", 1, "DC", input=True, low=-0.5, high=0.5)
//! layout.add_connection("sp1060.Ch1", "chip1.Gate1")
//! layout.add_pulse_lines_toml(open("lines.toml").read())
//! assert layout.validate() == []
//! signal = layout.calc_signal("plunger", 0.0, layout.stop_time(), 1000)
//! ```

use numpy::IntoPyArray;
use pyo3::prelude::*;

use crate::channel::{ChannelSpec, ChannelType};
use crate::config::LayoutConfig;
use crate::connection::{ConnectionInfo, Filter};
use crate::error::Error;
use crate::interface::{InstrumentInterface, InterfaceKind};
use crate::layout::Layout;
use crate::track::BaseTrack;
use crate::utils::time_to_pos;

fn channel_type(name: &str) -> PyResult<ChannelType> {
    match name {
        "DC" => Ok(ChannelType::DC),
        "AC" => Ok(ChannelType::AC),
        "Fast" => Ok(ChannelType::Fast),
        "Acq" => Ok(ChannelType::Acq),
        other => Err(pyo3::exceptions::PyValueError::new_err(format!(
            "unknown channel type {}, expected one of DC, AC, Fast, Acq",
            other
        ))),
    }
}

#[pyclass(name = "Layout")]
pub struct PyLayout {
    inner: Layout,
}

#[pymethods]
impl PyLayout {
    #[new]
    pub fn new() -> Self {
        Self {
            inner: Layout::new(),
        }
    }

    #[staticmethod]
    pub fn from_toml(text: &str) -> PyResult<Self> {
        let config = LayoutConfig::from_toml_str(text)?;
        Ok(Self {
            inner: Layout::from_config(&config)?,
        })
    }

    #[pyo3(signature = (name, channel_num, samp_rate=None))]
    pub fn add_sp1060_interface(&mut self, name: &str, channel_num: usize, samp_rate: Option<f64>) -> PyResult<()> {
        let mut interface = InstrumentInterface::sp1060(name, channel_num)?;
        if let Some(samp_rate) = samp_rate {
            interface = interface.with_samp_rate(samp_rate);
        }
        Ok(self.inner.add_interface(interface)?)
    }

    #[pyo3(signature = (name, samp_rate=None))]
    pub fn add_chip_interface(&mut self, name: &str, samp_rate: Option<f64>) -> PyResult<()> {
        let mut interface = InstrumentInterface::new(name, InterfaceKind::Chip);
        if let Some(samp_rate) = samp_rate {
            interface = interface.with_samp_rate(samp_rate);
        }
        Ok(self.inner.add_interface(interface)?)
    }

    #[pyo3(signature = (interface, channel_name, channel_num, channel_type, input=false, group=0, low=None, high=None, cut_off=None, max_power=None, max_memory_size=None))]
    pub fn add_channel(
        &mut self,
        interface: &str,
        channel_name: &str,
        channel_num: usize,
        channel_type: &str,
        input: bool,
        group: usize,
        low: Option<f64>,
        high: Option<f64>,
        cut_off: Option<f64>,
        max_power: Option<f64>,
        max_memory_size: Option<usize>,
    ) -> PyResult<()> {
        let spec = ChannelSpec {
            channel_name: channel_name.to_string(),
            channel_num,
            channel_type: self::channel_type(channel_type)?,
            group,
            input,
            low,
            high,
            cut_off,
            max_power,
            max_memory_size,
        };
        self.inner.interface_mut(interface)?.add_channel(&spec)?;
        Ok(())
    }

    #[pyo3(signature = (output, input, attenuation=0.0, gain=1.0, low_pass=None))]
    pub fn add_connection(
        &mut self,
        output: &str,
        input: &str,
        attenuation: f64,
        gain: f64,
        low_pass: Option<f64>,
    ) -> PyResult<usize> {
        let filters = low_pass.map(Filter::low_pass).into_iter().collect();
        Ok(self
            .inner
            .add_connection(output, input, ConnectionInfo::new(attenuation, gain, filters))?)
    }

    /// Adds the `[[lines]]` tables of a TOML document; returns the configured line names.
    pub fn add_pulse_lines_toml(&mut self, text: &str) -> PyResult<Vec<String>> {
        let config = LayoutConfig::from_toml_str(text)?;
        Ok(self.inner.config_pulse_lines(&config.lines)?)
    }

    pub fn line_names(&self) -> Vec<String> {
        self.inner.pulse_sequence().keys().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections().len()
    }

    pub fn stop_time(&self) -> f64 {
        self.inner.stop_time()
    }

    /// Violations as readable strings; empty when the sequence may be dispatched.
    pub fn validate(&self) -> Vec<String> {
        self.inner
            .validate()
            .violations
            .iter()
            .map(|v| v.to_string())
            .collect()
    }

    /// Compiles every line and samples `line` between `t_start` and `t_end`.
    pub fn calc_signal(&self, line: &str, t_start: f64, t_end: f64, nsamps: usize, py: Python) -> PyResult<PyObject> {
        let tracks = self.inner.compile(None)?;
        let track = tracks
            .get(line)
            .ok_or_else(|| Error::UnknownLine(line.to_string()))?;
        let samp_rate = track.samp_rate();
        let arr = track.calc_signal_nsamps(
            time_to_pos(t_start, samp_rate),
            time_to_pos(t_end, samp_rate),
            nsamps,
        )?;
        Ok(arr.into_pyarray(py).to_object(py))
    }

    pub fn __repr__(&self) -> String {
        let interfaces: String = self
            .inner
            .interfaces()
            .values()
            .map(|interface| interface.to_string())
            .collect();
        let connections: Vec<String> = self
            .inner
            .connections()
            .iter()
            .map(|con| con.to_string())
            .collect();
        format!("{}{}", interfaces, connections.join("\n"))
    }
}

#[pymodule]
fn pulsecompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    pyo3_log::init();
    m.add_class::<PyLayout>()?;
    Ok(())
}
