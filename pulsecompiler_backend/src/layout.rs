//! The chip-centred layout: instrument interfaces, the connections between their channels and the
//! pulse sequence travelling over them.
//!
//! ## Overview
//!
//! A [`Layout`] owns
//! 1. the instrument interfaces by name,
//! 2. the list of [`Connection`]s, addressed by index,
//! 3. the pulse sequence, a map from line name to [`PulseLine`].
//!
//! Before anything is handed to instruments the whole sequence is checked by [`Layout::validate`]:
//! every scheduled pulse must be routed over its line's connection and respect the conditions of every
//! channel on the way, and no two lines may drive the same sender channel at the same time.
//! [`Layout::target_pulse_sequence`] dispatches only a sequence without any violation, and then all
//! of it, to a [`LineSink`].

use indexmap::IndexMap;

use crate::config::{ConnectionSpec, LayoutConfig, LineConfig};
use crate::connection::{Connection, ConnectionInfo, Filter};
use crate::error::{Error, Result};
use crate::interface::InstrumentInterface;
use crate::pulse::Pulse;
use crate::pulse_line::{PulseElement, PulseLine};
use crate::track::{BaseTrack, Track};
use crate::utils::{split_address, time_to_pos};
use crate::validation::{ValidationReport, Violation, ViolationKind};

/// Receiver of validated pulse lines, one call per line.
pub trait LineSink {
    type Error: From<Error>;

    fn dispatch_line(
        &mut self,
        interface: &InstrumentInterface,
        line: &PulseLine,
    ) -> std::result::Result<(), Self::Error>;
}

#[derive(Clone, Debug, Default)]
pub struct Layout {
    interfaces: IndexMap<String, InstrumentInterface>,
    connections: Vec<Connection>,
    pulse_sequence: IndexMap<String, PulseLine>,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interfaces(interfaces: Vec<InstrumentInterface>) -> Result<Self> {
        let mut layout = Self::new();
        for interface in interfaces {
            layout.add_interface(interface)?;
        }
        Ok(layout)
    }

    pub fn interfaces(&self) -> &IndexMap<String, InstrumentInterface> {
        &self.interfaces
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn pulse_sequence(&self) -> &IndexMap<String, PulseLine> {
        &self.pulse_sequence
    }

    pub fn add_interface(&mut self, interface: InstrumentInterface) -> Result<()> {
        if self.interfaces.contains_key(interface.name()) {
            return Err(Error::DuplicateInterface(interface.name().to_string()));
        }
        self.interfaces.insert(interface.name().to_string(), interface);
        Ok(())
    }

    pub fn interface_mut(&mut self, name: &str) -> Result<&mut InstrumentInterface> {
        let registered: Vec<String> = self.interfaces.keys().cloned().collect();
        self.interfaces.get_mut(name).ok_or(Error::UnknownInterface {
            name: name.to_string(),
            registered,
        })
    }

    pub fn interface(&self, name: &str) -> Result<&InstrumentInterface> {
        self.interfaces.get(name).ok_or_else(|| Error::UnknownInterface {
            name: name.to_string(),
            registered: self.interfaces.keys().cloned().collect(),
        })
    }

    /// Resolves a full `instrument.channel` address.
    pub fn channel(&self, address: &str) -> Result<&crate::channel::Channel> {
        let (instrument, _) = split_address(address)?;
        self.interface(instrument)?.get_channel(address)
    }

    pub fn connection(&self, index: usize) -> Result<&Connection> {
        self.connections.get(index).ok_or(Error::ConnectionIndex {
            index,
            len: self.connections.len(),
        })
    }

    /// Connects an output channel to an input channel, both given as `instrument.channel`.
    ///
    /// Returns the index of the connection. A connection over the same chain is not added
    /// twice; the index of the existing one is returned.
    ///
    /// ```
    /// use pulsecompiler_backend::channel::ChannelSpec;
    /// use pulsecompiler_backend::connection::ConnectionInfo;
    /// use pulsecompiler_backend::interface::InstrumentInterface;
    /// use pulsecompiler_backend::layout::Layout;
    ///
    /// let mut layout = Layout::with_interfaces(vec![
    ///     InstrumentInterface::sp1060("sp1060", 24).unwrap(),
    ///     InstrumentInterface::chip("chip1", &[ChannelSpec::dc("Gate1", 1, -0.5, 0.5).input()]).unwrap(),
    /// ]).unwrap();
    /// let idx = layout.add_connection("sp1060.Ch1", "chip1.Gate1", ConnectionInfo::default()).unwrap();
    /// let again = layout.add_connection("sp1060.Ch1", "chip1.Gate1", ConnectionInfo::default()).unwrap();
    /// assert_eq!(idx, again);
    /// assert_eq!(layout.connections().len(), 1);
    /// ```
    pub fn add_connection(&mut self, output: &str, input: &str, info: ConnectionInfo) -> Result<usize> {
        let output_channel = self.channel(output)?;
        let input_channel = self.channel(input)?;
        let mut connection = Connection::new(info);
        connection.connect(output_channel, input_channel)?;
        if let Some(idx) = self.connections.iter().position(|con| *con == connection) {
            log::warn!("connection {} -> {} already exists (#{}), skipped", output, input, idx);
            return Ok(idx);
        }
        log::debug!("added connection #{}: {}", self.connections.len(), connection);
        self.connections.push(connection);
        Ok(self.connections.len() - 1)
    }

    pub fn load_connections(&mut self, specs: &[ConnectionSpec]) -> Result<Vec<usize>> {
        specs
            .iter()
            .map(|spec| self.add_connection(&spec.output, &spec.input, spec.info.clone()))
            .collect()
    }

    /// Replaces the attenuation, gain and filters of a connection, for every line routed over it.
    pub fn add_connection_info(
        &mut self,
        connection: usize,
        attenuation: f64,
        gain: f64,
        filters: Option<Vec<Filter>>,
    ) -> Result<()> {
        let len = self.connections.len();
        let con = self
            .connections
            .get_mut(connection)
            .ok_or(Error::ConnectionIndex { index: connection, len })?;
        con.set_info(ConnectionInfo::new(attenuation, gain, filters.unwrap_or_default()));
        Ok(())
    }

    /// Builds a pulse line over connection `connection` and stores it under `line_name`,
    /// replacing a line of the same name.
    ///
    /// When `pulse_elements` is given, the elements are configured, appended in `order`
    /// (all of them when `None`) and scheduled.
    pub fn config_pulse_line(
        &mut self,
        line_name: &str,
        connection: usize,
        line_start: f64,
        init_pulse: Option<Vec<Pulse>>,
        pulse_elements: Option<IndexMap<String, PulseElement>>,
        order: Option<&[String]>,
    ) -> Result<&PulseLine> {
        let mut line = PulseLine::new(
            line_name,
            connection,
            self.connection(connection)?,
            line_start,
            init_pulse,
        )?;
        if let Some(elements) = pulse_elements {
            line.config_pulse_elements(elements)?;
            line.add_pulse_elements_to_pulse_line(order)?;
            line.get_time_line()?;
        }
        if self.pulse_sequence.contains_key(line_name) {
            log::info!("pulse line {} replaced", line_name);
        }
        self.pulse_sequence.insert(line_name.to_string(), line);
        self.pulse_line(line_name)
    }

    pub fn pulse_line(&self, line_name: &str) -> Result<&PulseLine> {
        self.pulse_sequence
            .get(line_name)
            .ok_or_else(|| Error::UnknownLine(line_name.to_string()))
    }

    pub fn pulse_line_mut(&mut self, line_name: &str) -> Result<&mut PulseLine> {
        self.pulse_sequence
            .get_mut(line_name)
            .ok_or_else(|| Error::UnknownLine(line_name.to_string()))
    }

    /// Checks every scheduled pulse of every line and collects all violations.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        // (sender, line, pulse, start, stop) for the cross-line overlap check
        let mut occupancy: Vec<(String, &str, &str, f64, f64)> = Vec::new();

        for line in self.pulse_sequence.values() {
            report.checked_lines += 1;
            let Some(connection) = self.connections.get(line.connection_index()) else {
                log::warn!(
                    "pulse line {}: connection #{} does not exist, skipped",
                    line.name(),
                    line.connection_index()
                );
                continue;
            };
            let expected_sender = line.sender().name().to_string();
            let expected_acceptor = line.acceptor().name().to_string();
            for scheduled in line.time_line() {
                report.checked_pulses += 1;
                let pulse = &scheduled.pulse;
                if !connection.check_pulse(pulse) {
                    report.violations.push(
                        Violation::new(
                            pulse.name(),
                            None,
                            ViolationKind::Route {
                                expected_sender: expected_sender.clone(),
                                expected_acceptor: expected_acceptor.clone(),
                                sender: pulse.sender().map(str::to_string),
                                acceptor: pulse.acceptor().map(str::to_string),
                            },
                        )
                        .on_line(line.name()),
                    );
                }
                report.violations.extend(
                    connection
                        .check_conditions(pulse)
                        .into_iter()
                        .map(|v| v.on_line(line.name())),
                );
                if scheduled.t_stop > scheduled.t_start {
                    occupancy.push((
                        expected_sender.clone(),
                        line.name(),
                        pulse.name(),
                        scheduled.t_start,
                        scheduled.t_stop,
                    ));
                }
            }
        }

        occupancy.sort_by(|a, b| a.0.cmp(&b.0).then(a.3.total_cmp(&b.3)));
        for (i, first) in occupancy.iter().enumerate() {
            for second in occupancy[i + 1..].iter() {
                if second.0 != first.0 || second.3 >= first.4 {
                    break;
                }
                if second.1 != first.1 {
                    report.violations.push(
                        Violation::new(
                            second.2,
                            Some(&second.0),
                            ViolationKind::Overlap {
                                other_line: first.1.to_string(),
                                other_pulse: first.2.to_string(),
                            },
                        )
                        .on_line(second.1),
                    );
                }
            }
        }
        report
    }

    /// Validates the whole sequence and, when nothing is violated, hands every line to `sink`
    /// together with the interface of its sender. Returns the number of dispatched lines.
    pub fn target_pulse_sequence<S: LineSink>(&self, sink: &mut S) -> std::result::Result<usize, S::Error> {
        let report = self.validate().into_result()?;
        log::info!("pulse sequence validated: {}", report);
        let mut dispatched = 0;
        for line in self.pulse_sequence.values() {
            let interface = self.interface(line.sender().instrument())?;
            sink.dispatch_line(interface, line)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Latest stop over all lines.
    pub fn stop_time(&self) -> f64 {
        self.pulse_sequence
            .values()
            .map(PulseLine::stop)
            .fold(0., f64::max)
    }

    /// One compiled track per line on its sender's sample clock, all compiled up to `stop_time`
    /// (the latest line stop when `None`). Lines without pulses are left out.
    pub fn compile(&self, stop_time: Option<f64>) -> Result<IndexMap<String, Track>> {
        let stop_time = stop_time.unwrap_or_else(|| self.stop_time());
        let mut tracks = IndexMap::new();
        for line in self.pulse_sequence.values() {
            let interface = self.interface(line.sender().instrument())?;
            let mut track = line.track(interface.samp_rate())?;
            if !track.is_edited() {
                continue;
            }
            let last_end = track.last_instr_end_pos();
            if time_to_pos(stop_time, track.samp_rate()) < last_end {
                return Err(Error::CompileStop {
                    track: line.name().to_string(),
                    stop_pos: time_to_pos(stop_time, track.samp_rate()),
                    last_end,
                });
            }
            track.compile_until(stop_time)?;
            tracks.insert(line.name().to_string(), track);
        }
        Ok(tracks)
    }

    /// Configures pulse lines from their TOML description; `connection` indexes
    /// [`Layout::connections`].
    pub fn config_pulse_lines(&mut self, lines: &[LineConfig]) -> Result<Vec<String>> {
        lines
            .iter()
            .map(|line| {
                self.config_line(line, line.connection)?;
                Ok(line.name.clone())
            })
            .collect()
    }

    fn config_line(&mut self, line: &LineConfig, connection: usize) -> Result<&PulseLine> {
        let elements = if line.elements.is_empty() {
            None
        } else {
            Some(
                line.elements
                    .iter()
                    .map(|el| {
                        (
                            el.name.clone(),
                            PulseElement::new(el.pulses.clone(), el.delay, el.repeat),
                        )
                    })
                    .collect(),
            )
        };
        let init_pulse = if line.init_pulse.is_empty() {
            None
        } else {
            Some(line.init_pulse.clone())
        };
        self.config_pulse_line(
            &line.name,
            connection,
            line.start,
            init_pulse,
            elements,
            line.order.as_deref(),
        )
    }

    /// Builds a layout from its TOML description. Line connection indices refer to the
    /// `connections` table of the description.
    pub fn from_config(config: &LayoutConfig) -> Result<Self> {
        let mut layout = Self::new();
        for interface in &config.interfaces {
            layout.add_interface(interface.build()?)?;
        }
        let indices = layout.load_connections(&config.connections)?;
        for line in &config.lines {
            let connection = *indices.get(line.connection).ok_or(Error::ConnectionIndex {
                index: line.connection,
                len: indices.len(),
            })?;
            layout.config_line(line, connection)?;
        }
        Ok(layout)
    }
}

/// Same interfaces and same connections.
impl PartialEq for Layout {
    fn eq(&self, other: &Self) -> bool {
        self.interfaces == other.interfaces && self.connections == other.connections
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::ChannelSpec;
    use crate::interface::InstrumentInterface;

    fn layout() -> Layout {
        let mut layout = Layout::with_interfaces(vec![
            InstrumentInterface::sp1060("sp1060", 4).unwrap(),
            InstrumentInterface::chip(
                "chip1",
                &[
                    ChannelSpec::dc("Gate1", 1, -0.5, 0.5).input(),
                    ChannelSpec::dc("Gate2", 2, -0.5, 0.5).input(),
                ],
            )
            .unwrap(),
        ])
        .unwrap();
        layout
            .add_connection("sp1060.Ch1", "chip1.Gate1", ConnectionInfo::default())
            .unwrap();
        layout
            .add_connection("sp1060.Ch2", "chip1.Gate2", ConnectionInfo::default())
            .unwrap();
        layout
    }

    fn elements(pulses: Vec<Pulse>) -> IndexMap<String, PulseElement> {
        let mut map = IndexMap::new();
        map.insert("main".to_string(), PulseElement::new(pulses, 0., 1));
        map
    }

    struct Collect(Vec<String>);

    impl LineSink for Collect {
        type Error = Error;

        fn dispatch_line(&mut self, interface: &InstrumentInterface, line: &PulseLine) -> Result<()> {
            self.0.push(format!("{}:{}", interface.name(), line.name()));
            Ok(())
        }
    }

    #[test]
    fn unknown_addresses() {
        let mut layout = layout();
        assert!(matches!(
            layout.add_connection("awg.Ch1", "chip1.Gate1", ConnectionInfo::default()),
            Err(Error::UnknownInterface { .. })
        ));
        assert!(matches!(
            layout.add_connection("sp1060.Ch9", "chip1.Gate1", ConnectionInfo::default()),
            Err(Error::UnknownChannel(_))
        ));
        assert!(matches!(
            layout.add_connection("sp1060Ch1", "chip1.Gate1", ConnectionInfo::default()),
            Err(Error::BadAddress(_))
        ));
        assert!(matches!(
            layout.add_connection_info(5, 0., 1., None),
            Err(Error::ConnectionIndex { index: 5, len: 2 })
        ));
    }

    #[test]
    fn all_or_nothing_dispatch() {
        let mut layout = layout();
        layout
            .config_pulse_line("ok", 0, 0., None, Some(elements(vec![Pulse::dc_fixed("p", 0.2, 0., 0.01).unwrap()])), None)
            .unwrap();
        layout
            .config_pulse_line("bad", 1, 0., None, Some(elements(vec![Pulse::dc_fixed("q", 0.7, 0., 0.01).unwrap()])), None)
            .unwrap();
        let mut sink = Collect(vec![]);
        let err = layout.target_pulse_sequence(&mut sink).unwrap_err();
        match err {
            Error::ConditionsViolated(violations) => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].line, "bad");
                assert_eq!(violations[0].channel.as_deref(), Some("chip1.Gate2"));
            }
            other => panic!("unexpected error {}", other),
        }
        assert!(sink.0.is_empty());

        layout
            .config_pulse_line("bad", 1, 0., None, Some(elements(vec![Pulse::dc_fixed("q", 0.3, 0., 0.01).unwrap()])), None)
            .unwrap();
        assert_eq!(layout.target_pulse_sequence(&mut sink).unwrap(), 2);
        assert_eq!(sink.0, vec!["sp1060:ok".to_string(), "sp1060:bad".to_string()]);
    }

    #[test]
    fn misrouted_pulse_reported() {
        let mut layout = layout();
        let pulse = Pulse::dc_fixed("p", 0.2, 0., 0.01)
            .unwrap()
            .with_route("sp1060.Ch2", "chip1.Gate2");
        layout
            .config_pulse_line("l", 0, 0., None, Some(elements(vec![pulse])), None)
            .unwrap();
        let report = layout.validate();
        assert_eq!(report.violations.len(), 1);
        assert!(matches!(report.violations[0].kind, ViolationKind::Route { .. }));
    }

    #[test]
    fn lines_sharing_a_sender_overlap() {
        let mut layout = layout();
        layout
            .config_pulse_line("a", 0, 0., None, Some(elements(vec![Pulse::dc_fixed("p", 0.2, 0., 0.01).unwrap()])), None)
            .unwrap();
        layout
            .config_pulse_line("b", 0, 0.005, None, Some(elements(vec![Pulse::dc_fixed("q", 0.2, 0., 0.01).unwrap()])), None)
            .unwrap();
        let report = layout.validate();
        assert_eq!(report.checked_pulses, 2);
        assert_eq!(report.violations.len(), 1);
        assert!(matches!(
            &report.violations[0].kind,
            ViolationKind::Overlap { other_line, .. } if other_line == "a"
        ));

        layout
            .config_pulse_line("b", 0, 0.01, None, Some(elements(vec![Pulse::dc_fixed("q", 0.2, 0., 0.01).unwrap()])), None)
            .unwrap();
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn compile_all_lines() {
        let mut layout = layout();
        layout
            .config_pulse_line("a", 0, 0., None, Some(elements(vec![Pulse::dc_fixed("p", 0.2, 0., 0.01).unwrap()])), None)
            .unwrap();
        layout
            .config_pulse_line("b", 1, 0., None, Some(elements(vec![Pulse::dc("q", 0.1, 0., 0.02).unwrap()])), None)
            .unwrap();
        layout.config_pulse_line("empty", 1, 0., None, None, None).unwrap();
        let tracks = layout.compile(None).unwrap();
        assert_eq!(tracks.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(tracks["a"].total_samps(), 20);
        // Closing edge of the AWG level at the stop tick
        assert_eq!(tracks["b"].total_samps(), 21);
        assert!(matches!(layout.compile(Some(0.015)), Err(Error::CompileStop { .. })));
    }

    #[test]
    fn connection_info_reaches_built_lines() {
        let mut layout = layout();
        layout
            .config_pulse_line("l", 0, 0., None, Some(elements(vec![Pulse::dc_fixed("p", 0.9, 0., 0.01).unwrap()])), None)
            .unwrap();
        assert_eq!(layout.pulse_line("l").unwrap().connection_index(), 0);
        assert_eq!(layout.validate().violations.len(), 1);
        // 20 dB brings 0.9 V down to 0.09 V on the gate
        layout.add_connection_info(0, 20., 1., None).unwrap();
        assert!(layout.validate().is_ok());
        layout.add_connection_info(0, 0., 2., None).unwrap();
        assert_eq!(layout.validate().violations.len(), 1);
    }

    #[test]
    fn equality() {
        let a = layout();
        let mut b = layout();
        assert_eq!(a, b);
        b.add_connection("sp1060.Ch3", "chip1.Gate1", ConnectionInfo::default())
            .unwrap();
        assert_ne!(a, b);
    }
}
