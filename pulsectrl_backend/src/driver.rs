//! # Dispatching validated pulse sequences
//!
//! [`pulsecompiler_backend::Layout::target_pulse_sequence`] hands every line of a validated
//! sequence to a [`LineSink`]. The [`Dispatcher`] is that sink for real instruments: it keeps one
//! [`PulseDriver`] per instrument interface, compiles each line on the sample clock of its sender
//! interface and loads it into the driver. [`Dispatcher::run`] then plays every loaded driver.
//!
//! ```
//! use pulsecompiler_backend::*;
//! use pulsectrl_backend::driver::{Dispatcher, RecordingDriver};
//!
//! let mut layout = Layout::with_interfaces(vec![
//!     InstrumentInterface::sp1060("sp1060", 2).unwrap(),
//!     InstrumentInterface::chip("chip1", &[ChannelSpec::dc("G1", 1, -0.5, 0.5).input()]).unwrap(),
//! ]).unwrap();
//! let conn = layout.add_connection("sp1060.Ch1", "chip1.G1", ConnectionInfo::default()).unwrap();
//! let mut elements = indexmap::IndexMap::new();
//! elements.insert("step".to_string(), PulseElement::new(vec![Pulse::dc("p", 0.2, 0., 0.01).unwrap()], 0., 2));
//! layout.config_pulse_line("plunger", conn, 0., None, Some(elements), None).unwrap();
//!
//! let recorder = RecordingDriver::new("sp1060");
//! let record = recorder.handle();
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.register("sp1060", Box::new(recorder));
//! assert_eq!(dispatcher.dispatch(&layout).unwrap(), 1);
//! dispatcher.run().unwrap();
//! assert_eq!(record.lock().lines[0].samples.len(), 21);
//! ```

use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::Array1;
use parking_lot::Mutex;
use rayon::prelude::*;

use pulsecompiler_backend::utils::TickTimer;
use pulsecompiler_backend::{BaseTrack, InstrumentInterface, Layout, LineSink, PulseLine, Track};

use crate::error::{Error, Result};
use crate::utils::StreamCounter;

/// An instrument that plays pulse lines.
pub trait PulseDriver: Send {
    fn name(&self) -> &str;
    /// Loads one line, compiled on the instrument's sample clock.
    fn load_line(&mut self, line: &PulseLine, track: &Track) -> Result<()>;
    /// Plays everything loaded so far.
    fn run(&mut self) -> Result<()>;
}

/// Samples a compiled track chunk by chunk.
pub fn render_track(track: &Track, chunk_samps: usize) -> Result<Array1<f64>> {
    let total = track.total_samps();
    let mut samples = Vec::with_capacity(total);
    let mut counter = StreamCounter::new(total, chunk_samps);
    for (start_pos, end_pos) in counter.chunks() {
        let chunk = track.calc_signal_nsamps(start_pos, end_pos, end_pos - start_pos)?;
        samples.extend(chunk.iter());
    }
    Ok(Array1::from(samples))
}

/// Samples every track in parallel, in chunks of `chunk_ms` milliseconds.
pub fn render_lines(tracks: &IndexMap<String, Track>, chunk_ms: f64) -> Result<IndexMap<String, Array1<f64>>> {
    let mut timer = TickTimer::new();
    let tracks: Vec<(&String, &Track)> = tracks.iter().collect();
    let rendered = tracks
        .par_iter()
        .map(|(name, track)| {
            let chunk_samps = (chunk_ms * track.samp_rate() / 1000.) as usize;
            Ok(((*name).clone(), render_track(track, chunk_samps)?))
        })
        .collect::<Result<Vec<_>>>()?;
    timer.tick_log(&format!("rendered {} line(s)", rendered.len()));
    Ok(rendered.into_iter().collect())
}

/// Drivers by interface name.
#[derive(Default)]
pub struct Dispatcher {
    drivers: IndexMap<String, Box<dyn PulseDriver>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `driver` for the interface `interface`, returning the one it replaces.
    pub fn register(&mut self, interface: &str, driver: Box<dyn PulseDriver>) -> Option<Box<dyn PulseDriver>> {
        self.drivers.insert(interface.to_string(), driver)
    }

    pub fn interfaces(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    /// Validates `layout` and loads all of its lines; nothing is loaded when validation fails.
    pub fn dispatch(&mut self, layout: &Layout) -> Result<usize> {
        let dispatched = layout.target_pulse_sequence(self)?;
        log::info!("dispatched {} pulse line(s)", dispatched);
        Ok(dispatched)
    }

    /// Plays every driver, each on its own rayon worker.
    pub fn run(&mut self) -> Result<()> {
        let mut timer = TickTimer::new();
        let mut drivers: Vec<(&String, &mut Box<dyn PulseDriver>)> = self.drivers.iter_mut().collect();
        drivers.par_iter_mut().try_for_each(|(interface, driver)| {
            driver.run()?;
            log::debug!("{} ({}) done", driver.name(), interface);
            Ok::<(), Error>(())
        })?;
        timer.tick_log(&format!("{} driver(s) run", drivers.len()));
        Ok(())
    }
}

impl LineSink for Dispatcher {
    type Error = Error;

    fn dispatch_line(&mut self, interface: &InstrumentInterface, line: &PulseLine) -> Result<()> {
        let driver = self
            .drivers
            .get_mut(interface.name())
            .ok_or_else(|| Error::NoDriver(interface.name().to_string()))?;
        let track = line.compiled_track(interface.samp_rate())?;
        log::debug!(
            "loading line {} into {} ({} samples)",
            line.name(),
            driver.name(),
            track.total_samps()
        );
        driver.load_line(line, &track)
    }
}

#[derive(Clone, Debug)]
pub struct LoadedLine {
    pub line: String,
    pub sender: String,
    pub samp_rate: f64,
    pub samples: Array1<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct Recording {
    pub lines: Vec<LoadedLine>,
    pub runs: usize,
}

/// Renders loaded lines into memory instead of playing them.
///
/// Lines are held until `run`, which samples all of them in parallel and appends them to the
/// recording.
pub struct RecordingDriver {
    name: String,
    chunk_ms: f64,
    // line name -> (sender, track)
    pending: IndexMap<String, (String, Track)>,
    record: Arc<Mutex<Recording>>,
}

impl RecordingDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            chunk_ms: 50.,
            pending: IndexMap::new(),
            record: Arc::new(Mutex::new(Recording::default())),
        }
    }

    pub fn with_chunk_ms(mut self, chunk_ms: f64) -> Self {
        self.chunk_ms = chunk_ms;
        self
    }

    pub fn handle(&self) -> Arc<Mutex<Recording>> {
        self.record.clone()
    }

    /// Lines loaded since the last run.
    pub fn pending(&self) -> Vec<&str> {
        self.pending.keys().map(String::as_str).collect()
    }
}

impl PulseDriver for RecordingDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_line(&mut self, line: &PulseLine, track: &Track) -> Result<()> {
        self.pending.insert(
            line.name().to_string(),
            (line.sender().name().to_string(), track.clone()),
        );
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let compiled: IndexMap<String, Track> = pending
            .iter()
            .filter(|(_, (_, track))| track.is_compiled())
            .map(|(line, (_, track))| (line.clone(), track.clone()))
            .collect();
        let mut rendered = render_lines(&compiled, self.chunk_ms)?;
        let mut record = self.record.lock();
        for (line, (sender, track)) in pending {
            let samples = rendered.shift_remove(&line).unwrap_or_else(|| Array1::zeros(0));
            record.lines.push(LoadedLine {
                line,
                sender,
                samp_rate: track.samp_rate(),
                samples,
            });
        }
        record.runs += 1;
        log::info!("{}: run {} with {} line(s)", self.name, record.runs, record.lines.len());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pulsecompiler_backend::{ChannelSpec, ConnectionInfo, Pulse, PulseElement};

    fn layout() -> Layout {
        let mut layout = Layout::with_interfaces(vec![
            InstrumentInterface::sp1060("dac", 2).unwrap(),
            InstrumentInterface::chip(
                "chip",
                &[
                    ChannelSpec::dc("G1", 1, -0.5, 0.5).input(),
                    ChannelSpec::dc("G2", 2, -0.5, 0.5).input(),
                ],
            )
            .unwrap(),
        ])
        .unwrap();
        let c0 = layout.add_connection("dac.Ch1", "chip.G1", ConnectionInfo::default()).unwrap();
        let c1 = layout.add_connection("dac.Ch2", "chip.G2", ConnectionInfo::default()).unwrap();
        let mut elements = IndexMap::new();
        elements.insert(
            "hold".to_string(),
            PulseElement::new(vec![Pulse::dc_fixed("p", 0.1, 0., 0.004).unwrap()], 0., 1),
        );
        layout.config_pulse_line("a", c0, 0., None, Some(elements.clone()), None).unwrap();
        layout.config_pulse_line("b", c1, 0.002, None, Some(elements), None).unwrap();
        layout
    }

    #[test]
    fn chunked_render_matches_single_pass() {
        let tracks = layout().compile(None).unwrap();
        let track = &tracks["b"];
        let whole = track.calc_signal_nsamps(0, track.total_samps(), track.total_samps()).unwrap();
        assert_eq!(render_track(track, 1).unwrap(), whole);
        assert_eq!(render_track(track, 4).unwrap(), whole);
        let rendered = render_lines(&tracks, 1.).unwrap();
        assert_eq!(rendered["b"].to_vec(), vec![0., 0., 0.1, 0.1, 0.1, 0.1]);
        assert_eq!(rendered["a"].to_vec(), vec![0.1, 0.1, 0.1, 0.1, 0.1, 0.1]);
    }

    #[test]
    fn dispatch_to_recorder() {
        let recorder = RecordingDriver::new("dac").with_chunk_ms(2.);
        let record = recorder.handle();
        let mut dispatcher = Dispatcher::new();
        assert!(dispatcher.register("dac", Box::new(recorder)).is_none());
        assert_eq!(dispatcher.dispatch(&layout()).unwrap(), 2);
        dispatcher.run().unwrap();

        let record = record.lock();
        assert_eq!(record.runs, 1);
        assert_eq!(record.lines[1].line, "b");
        assert_eq!(record.lines[1].sender, "dac.Ch2");
        // Each line is compiled up to its own stop
        assert_eq!(record.lines[1].samples.to_vec(), vec![0., 0., 0.1, 0.1, 0.1, 0.1]);
        assert_eq!(record.lines[0].samples.len(), 4);
    }

    #[test]
    fn lines_render_when_run() {
        let layout = layout();
        let mut dispatcher = Dispatcher::new();
        let recorders: Vec<Arc<Mutex<Recording>>> = ["dac", "spare"]
            .iter()
            .map(|name| {
                let recorder = RecordingDriver::new(name).with_chunk_ms(1.);
                let record = recorder.handle();
                dispatcher.register(name, Box::new(recorder));
                record
            })
            .collect();
        dispatcher.dispatch(&layout).unwrap();
        assert!(recorders[0].lock().lines.is_empty());

        dispatcher.run().unwrap();
        dispatcher.dispatch(&layout).unwrap();
        dispatcher.run().unwrap();
        let dac = recorders[0].lock();
        assert_eq!(dac.runs, 2);
        assert_eq!(dac.lines.len(), 4);
        assert_eq!(dac.lines[3].samples.to_vec(), vec![0., 0., 0.1, 0.1, 0.1, 0.1]);
        // Drivers without lines still run
        assert_eq!(recorders[1].lock().runs, 2);
        assert!(recorders[1].lock().lines.is_empty());
    }

    #[test]
    fn missing_driver() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("other", Box::new(RecordingDriver::new("other")));
        assert!(matches!(dispatcher.dispatch(&layout()), Err(Error::NoDriver(name)) if name == "dac"));
    }

    #[test]
    fn violations_load_nothing() {
        let mut layout = layout();
        let mut elements = IndexMap::new();
        elements.insert(
            "big".to_string(),
            PulseElement::new(vec![Pulse::dc_fixed("p", 0.9, 0., 0.004).unwrap()], 0., 1),
        );
        layout.config_pulse_line("b", 1, 0., None, Some(elements), None).unwrap();

        let recorder = RecordingDriver::new("dac");
        let record = recorder.handle();
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("dac", Box::new(recorder));
        match dispatcher.dispatch(&layout) {
            Err(Error::Compiler(pulsecompiler_backend::Error::ConditionsViolated(v))) => assert_eq!(v.len(), 1),
            other => panic!("expected violations, got {:?}", other),
        }
        assert!(record.lock().lines.is_empty());
    }
}
