//! Pulse lines: the pulses sent over one connection, built from repetition units.
//!
//! A [`PulseLine`] holds named [`PulseElement`]s and an ordered list of element names (the line
//! itself). [`PulseLine::get_time_line`] lays the line out in absolute time:
//!
//! 1. the cursor starts at the line's `t_start`;
//! 2. for each element in the line, each repetition and each pulse, the pulse starts at
//!    `cursor + delay + pulse.t_start` and the cursor moves to that start plus the pulse's
//!    `duration`.
//!
//! The element's `delay` thus precedes every pulse it plays, and a pulse's `t_start` is an extra
//! gap after the previous pulse.
//!
//! A line remembers the index of its connection in the layout, so attenuation, gain and filters
//! are looked up when the layout is validated.

use std::fmt;

use indexmap::IndexMap;

use crate::channel::Channel;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pulse::Pulse;
use crate::track::{BaseTrack, Track};

/// Name of the element every line starts with.
pub const INIT_PULSE: &str = "init_pulse";

const TIME_TOL: f64 = 1e-12;

/// A repetition unit: `pulses` played `repeat` times, each pulse after `delay`.
#[derive(Clone, Debug, PartialEq)]
pub struct PulseElement {
    pub delay: f64,
    pub pulses: Vec<Pulse>,
    pub repeat: usize,
}

impl PulseElement {
    pub fn new(pulses: Vec<Pulse>, delay: f64, repeat: usize) -> Self {
        Self {
            delay,
            pulses,
            repeat,
        }
    }

    fn check(&self, name: &str) -> Result<()> {
        if self.repeat < 1 {
            return Err(Error::InvalidRepeat {
                element: name.to_string(),
                repeat: self.repeat,
            });
        }
        if !(self.delay >= 0.) {
            return Err(Error::NegativeDelay {
                element: name.to_string(),
                delay: self.delay,
            });
        }
        Ok(())
    }
}

/// A pulse placed in absolute time.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledPulse {
    pub pulse: Pulse,
    pub element: String,
    pub repetition: usize,
    pub t_start: f64,
    pub t_stop: f64,
}

impl ScheduledPulse {
    pub fn duration(&self) -> f64 {
        self.t_stop - self.t_start
    }
}

#[derive(Clone, Debug)]
pub struct PulseLine {
    name: String,
    connection: usize,
    sender: Channel,
    acceptor: Channel,
    t_start: f64,
    pulse_elements: IndexMap<String, PulseElement>,
    pulse_line: Vec<String>,
    time_line: Vec<ScheduledPulse>,
    duration: f64,
    stop: f64,
}

impl PulseLine {
    /// Creates a line over `route`, the non-empty connection found at index `connection` of
    /// its layout. The `init_pulse` element always exists.
    pub fn new(
        name: &str,
        connection: usize,
        route: &Connection,
        t_start: f64,
        init_pulse: Option<Vec<Pulse>>,
    ) -> Result<Self> {
        let mut line = Self {
            name: name.to_string(),
            connection,
            sender: route.sender()?.clone(),
            acceptor: route.acceptor()?.clone(),
            t_start,
            pulse_elements: IndexMap::new(),
            pulse_line: Vec::new(),
            time_line: Vec::new(),
            duration: 0.,
            stop: t_start,
        };
        let init = PulseElement::new(init_pulse.unwrap_or_default(), 0., 1);
        line.insert_element(INIT_PULSE, init);
        Ok(line)
    }

    fn insert_element(&mut self, name: &str, mut element: PulseElement) {
        let (sender, acceptor) = (self.sender.name(), self.acceptor.name());
        element
            .pulses
            .iter_mut()
            .for_each(|pulse| pulse.route_or(sender, acceptor));
        self.pulse_elements.insert(name.to_string(), element);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the line's connection in its layout.
    pub fn connection_index(&self) -> usize {
        self.connection
    }

    pub fn sender(&self) -> &Channel {
        &self.sender
    }

    pub fn acceptor(&self) -> &Channel {
        &self.acceptor
    }

    pub fn t_start(&self) -> f64 {
        self.t_start
    }

    /// Length of the scheduled line, as of the last [`PulseLine::get_time_line`].
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn stop(&self) -> f64 {
        self.stop
    }

    pub fn time_line(&self) -> &[ScheduledPulse] {
        &self.time_line
    }

    /// Element names in the order they are played.
    pub fn pulse_line(&self) -> &[String] {
        &self.pulse_line
    }

    pub fn pulse_elements(&self) -> &IndexMap<String, PulseElement> {
        &self.pulse_elements
    }

    pub fn element_names(&self) -> Vec<&str> {
        self.pulse_elements.keys().map(String::as_str).collect()
    }

    pub fn element(&self, name: &str) -> Result<&PulseElement> {
        self.pulse_elements
            .get(name)
            .ok_or_else(|| Error::UnknownElement(name.to_string()))
    }

    /// Adds a new element. Pulses without a route get the line's sender and acceptor.
    pub fn add_pulse_element(&mut self, name: &str, pulses: Vec<Pulse>, delay: f64, repeat: usize) -> Result<()> {
        if self.pulse_elements.contains_key(name) {
            return Err(Error::DuplicateElement(name.to_string()));
        }
        let element = PulseElement::new(pulses, delay, repeat);
        element.check(name)?;
        self.insert_element(name, element);
        Ok(())
    }

    /// Inserts or replaces elements wholesale.
    pub fn config_pulse_elements(&mut self, pulse_elements: IndexMap<String, PulseElement>) -> Result<()> {
        for (name, element) in pulse_elements.iter() {
            element.check(name)?;
        }
        for (name, element) in pulse_elements {
            self.insert_element(&name, element);
        }
        Ok(())
    }

    /// Appends elements to the line, all of them in insertion order when `order` is `None`.
    pub fn add_pulse_elements_to_pulse_line(&mut self, order: Option<&[String]>) -> Result<()> {
        let names: Vec<String> = match order {
            None => self.pulse_elements.keys().cloned().collect(),
            Some(order) => {
                if let Some(missing) = order.iter().find(|name| !self.pulse_elements.contains_key(*name)) {
                    return Err(Error::UnknownElement(missing.clone()));
                }
                order.to_vec()
            }
        };
        self.pulse_line.extend(names);
        Ok(())
    }

    /// Removes the first occurrence of an element from the line.
    pub fn remove_pulse_element_from_pulse_line(&mut self, name: &str) -> Result<()> {
        if !self.pulse_elements.contains_key(name) {
            return Err(Error::UnknownElement(name.to_string()));
        }
        match self.pulse_line.iter().position(|n| n == name) {
            Some(idx) => {
                self.pulse_line.remove(idx);
                Ok(())
            }
            None => Err(Error::UnknownElement(name.to_string())),
        }
    }

    /// Lays the line out in absolute time, replacing any previous result.
    ///
    /// ```
    /// use pulsecompiler_backend::channel::ChannelSpec;
    /// use pulsecompiler_backend::connection::Connection;
    /// use pulsecompiler_backend::pulse::Pulse;
    /// use pulsecompiler_backend::pulse_line::PulseLine;
    ///
    /// let mut conn = Connection::default();
    /// conn.connect(
    ///     &ChannelSpec::dc("Ch1", 1, -1., 1.).build("dac").unwrap(),
    ///     &ChannelSpec::dc("G1", 1, -1., 1.).input().build("chip").unwrap(),
    /// ).unwrap();
    /// let mut line = PulseLine::new("plunger", 0, &conn, 1.0, None).unwrap();
    /// line.add_pulse_element("step", vec![Pulse::dc_fixed("p", 0.1, 0.5, 2.0).unwrap()], 0.25, 2).unwrap();
    /// line.add_pulse_elements_to_pulse_line(None).unwrap();
    /// let starts: Vec<f64> = line.get_time_line().unwrap().iter().map(|s| s.t_start).collect();
    /// assert_eq!(starts, vec![1.75, 4.5]);
    /// assert_eq!(line.stop(), 6.5);
    /// ```
    pub fn get_time_line(&mut self) -> Result<&[ScheduledPulse]> {
        let mut time_line = Vec::new();
        let mut cursor = self.t_start;
        let mut prev_stop = self.t_start;
        for element_name in &self.pulse_line {
            let element = self
                .pulse_elements
                .get(element_name)
                .ok_or_else(|| Error::UnknownElement(element_name.clone()))?;
            for repetition in 0..element.repeat {
                for pulse in &element.pulses {
                    let start = cursor + element.delay + pulse.t_start();
                    if start < prev_stop - TIME_TOL {
                        return Err(Error::ScheduleOverlap {
                            line: self.name.clone(),
                            pulse: pulse.name().to_string(),
                            start,
                            prev_stop,
                        });
                    }
                    let stop = start + pulse.duration();
                    time_line.push(ScheduledPulse {
                        pulse: pulse.clone(),
                        element: element_name.clone(),
                        repetition,
                        t_start: start,
                        t_stop: stop,
                    });
                    cursor = stop;
                    prev_stop = stop;
                }
            }
        }
        log::debug!(
            "pulse line {}: {} pulse(s) scheduled from {} s to {} s",
            self.name,
            time_line.len(),
            self.t_start,
            cursor
        );
        self.time_line = time_line;
        self.stop = cursor;
        self.duration = cursor - self.t_start;
        Ok(&self.time_line)
    }

    /// Places the scheduled pulses on a track clocked at `samp_rate`, without compiling it.
    pub fn track(&self, samp_rate: f64) -> Result<Track> {
        let mut track = Track::new(&self.name, samp_rate);
        for scheduled in &self.time_line {
            track.add_instr(
                scheduled.pulse.instruction(scheduled.t_start),
                scheduled.t_start,
                scheduled.duration(),
                scheduled.pulse.kind().holds_value(),
            )?;
        }
        Ok(track)
    }

    /// The line's track compiled up to the end of the line.
    pub fn compiled_track(&self, samp_rate: f64) -> Result<Track> {
        let mut track = self.track(samp_rate)?;
        if track.is_edited() {
            track.compile_until(self.stop)?;
        }
        Ok(track)
    }
}

impl fmt::Display for PulseLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Pulse line {} ({} -> {}): start {} s, duration {} s, elements [{}], line [{}]",
            self.name,
            self.sender.name(),
            self.acceptor.name(),
            self.t_start,
            self.duration,
            self.element_names().join(", "),
            self.pulse_line.join(", ")
        )
    }
}
