//! # 1D and 2D parameter scans
//!
//! A [`Scan`] sweeps one or two [`Settable`] parameters over preset ranges and reads every
//! [`Acquisition`] at each point. A run goes through four phases:
//!
//! 1. prepare: check the axes, advance the run id, open the data sink and create the datasets
//!    `scan/scan_range_x`, `scan/scan_range_y` and `meas/measurement` of shape
//!    `(n_meas, nx[, ny])`;
//! 2. start: ramp each swept parameter to its first value, note the run in the logbook and
//!    snapshot the parameters that stay fixed;
//! 3. action: set, settle, then average each acquisition's buffer times the scaler. Columns
//!    (1D) or planes (2D) are handed to the writer thread as they complete. In 2D, x is
//!    ramped back to its start before each y step;
//! 4. end: ramp the swept parameters to 0, close the logbook entry and cache the data.
//!
//! The end phase also runs when the action fails or is aborted through a [`CmdChan`].
//!
//! [`CmdChan`]: crate::worker_cmd_chan::CmdChan

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ndarray::{ArrayD, Axis, IxDyn};
use parking_lot::Mutex;

use crate::acquisition::{AcqSession, Acquisition};
use crate::config::{CtrlConfig, RampSettings, StorageKind};
use crate::error::{Error, Result};
use crate::logbook::RunLogger;
use crate::parameter::{Gettable, Settable};
use crate::project::{now_time, DataManager, SizeUnit, MEAS_KEY, SCAN_KEYS};
use crate::storage::{open_sink, spawn_writer, DataSink, SinkMsg, SinkWriter};
use crate::utils::mean;
use crate::worker_cmd_chan::{CmdRecvr, ScanCmd};

/// Accepted scalers and the unit of scaled data.
pub const SCALER_UNITS: [(&str, f64); 5] = [("pA", 1e12), ("nA", 1e9), ("µA", 1e6), ("mA", 1e3), ("A", 1.)];

pub fn scaler_unit(scaler: f64) -> Result<&'static str> {
    SCALER_UNITS
        .iter()
        .find(|(_, s)| *s == scaler)
        .map(|(unit, _)| *unit)
        .ok_or_else(|| Error::ScanSetup(format!("scaler {} is not one of {:?}", scaler, SCALER_UNITS)))
}

/// Steps `param` from its current value towards `end`, then sets `end`.
///
/// Stepping is skipped, and `end` set at once, when `end` is above `settings.limit` or the step
/// is 0.
///
/// ```
/// use pulsectrl_backend::config::RampSettings;
/// use pulsectrl_backend::parameter::{Gettable, ManualParameter};
/// use pulsectrl_backend::scan::ramp;
/// use std::time::Duration;
///
/// let mut gate = ManualParameter::new("gate", "V", 0.);
/// let settings = RampSettings { step: 0.25, dwell: Duration::ZERO, limit: 50. };
/// ramp(&mut gate, 1., &settings).unwrap();
/// assert_eq!(gate.get().unwrap(), 1.);
/// ```
pub fn ramp(param: &mut dyn Settable, end: f64, settings: &RampSettings) -> Result<()> {
    if end <= settings.limit && settings.step != 0. {
        let start = param.get()?;
        let step = if start > end { -settings.step.abs() } else { settings.step.abs() };
        let steps = ((end - start) / step).ceil().max(0.) as usize;
        for k in 0..steps {
            param.set(start + k as f64 * step)?;
            if !settings.dwell.is_zero() {
                thread::sleep(settings.dwell);
            }
        }
    }
    param.set(end)
}

/// Ramps every parameter in volts to 0; failures are logged and skipped. Returns how many were
/// ramped.
pub fn ramp_all_to_zero(params: &mut [Box<dyn Settable>], settings: &RampSettings) -> usize {
    let mut ramped = 0;
    for param in params.iter_mut().filter(|p| p.unit() == "V") {
        match ramp(param.as_mut(), 0., settings) {
            Ok(()) => ramped += 1,
            Err(e) => log::warn!("could not ramp {} to 0: {}", param.name(), e),
        }
    }
    ramped
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanProgress {
    pub done: usize,
    pub total: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScanOutcome {
    pub run_id: usize,
    /// `None` when the scan wrote into a caller-provided sink.
    pub data_file: Option<PathBuf>,
    pub points_done: usize,
    pub points_total: usize,
    pub aborted: bool,
}

pub struct Scan {
    meas: Vec<Box<dyn Acquisition>>,
    params: Vec<Box<dyn Settable>>,
    manager: DataManager,
    logger: RunLogger,
    scaler: f64,
    unit: &'static str,
    sleep: Duration,
    ramp: RampSettings,
    storage: StorageKind,
    cache_threshold_mb: usize,
    range_1d: Vec<f64>,
    range_2d: (Vec<f64>, Vec<f64>),
    data: Arc<Mutex<ArrayD<f64>>>,
    progress: Arc<Mutex<ScanProgress>>,
    abort: Option<CmdRecvr>,
}

impl Scan {
    pub fn new(
        meas: Vec<Box<dyn Acquisition>>,
        params: Vec<Box<dyn Settable>>,
        manager: DataManager,
        logger: RunLogger,
        scaler: f64,
        sleep: Duration,
    ) -> Result<Self> {
        let unit = scaler_unit(scaler)?;
        if meas.is_empty() {
            return Err(Error::ScanSetup("at least one measurement is needed".to_string()));
        }
        if params.is_empty() {
            return Err(Error::ScanSetup("at least one scan parameter is needed".to_string()));
        }
        let config = CtrlConfig::default();
        Ok(Self {
            meas,
            params,
            manager,
            logger,
            scaler,
            unit,
            sleep,
            ramp: config.ramp(),
            storage: config.storage,
            cache_threshold_mb: config.cache_threshold_mb,
            range_1d: Vec::new(),
            range_2d: (Vec::new(), Vec::new()),
            data: Arc::new(Mutex::new(ArrayD::zeros(IxDyn(&[0])))),
            progress: Arc::new(Mutex::new(ScanProgress::default())),
            abort: None,
        })
    }

    /// Takes ramp settings, storage kind and cache threshold from `config`.
    pub fn with_config(mut self, config: &CtrlConfig) -> Self {
        self.ramp = config.ramp();
        self.storage = config.storage;
        self.cache_threshold_mb = config.cache_threshold_mb;
        self
    }

    pub fn with_ramp(mut self, ramp: RampSettings) -> Self {
        self.ramp = ramp;
        self
    }

    pub fn with_abort(mut self, recvr: CmdRecvr) -> Self {
        self.abort = Some(recvr);
        self
    }

    pub fn unit(&self) -> &'static str {
        self.unit
    }

    pub fn scaler(&self) -> f64 {
        self.scaler
    }

    pub fn manager(&self) -> &DataManager {
        &self.manager
    }

    pub fn logger(&self) -> &RunLogger {
        &self.logger
    }

    /// Data of the current or last run, `(n_meas, nx[, ny])`.
    pub fn data_handle(&self) -> Arc<Mutex<ArrayD<f64>>> {
        self.data.clone()
    }

    pub fn progress_handle(&self) -> Arc<Mutex<ScanProgress>> {
        self.progress.clone()
    }

    pub fn set_range_1d(&mut self, range: impl Into<Vec<f64>>) -> Result<()> {
        let range = range.into();
        if range.is_empty() {
            return Err(Error::ScanSetup("scan range should not be empty".to_string()));
        }
        self.range_1d = range;
        Ok(())
    }

    pub fn set_range_2d(&mut self, range_x: impl Into<Vec<f64>>, range_y: impl Into<Vec<f64>>) -> Result<()> {
        let (range_x, range_y) = (range_x.into(), range_y.into());
        if range_x.is_empty() || range_y.is_empty() {
            return Err(Error::ScanSetup("scan ranges should not be empty".to_string()));
        }
        self.range_2d = (range_x, range_y);
        Ok(())
    }

    /// Sweeps parameter `x` over the 1D range into a new data file.
    pub fn scan_1d(&mut self, x: usize) -> Result<ScanOutcome> {
        self.launch(&[x], None)
    }

    pub fn scan_1d_into(&mut self, x: usize, sink: Box<dyn DataSink>) -> Result<ScanOutcome> {
        self.launch(&[x], Some(sink))
    }

    /// Sweeps parameter `x` along the inner and `y` along the outer axis of the 2D ranges.
    pub fn scan_2d(&mut self, x: usize, y: usize) -> Result<ScanOutcome> {
        self.launch(&[x, y], None)
    }

    pub fn scan_2d_into(&mut self, x: usize, y: usize, sink: Box<dyn DataSink>) -> Result<ScanOutcome> {
        self.launch(&[x, y], Some(sink))
    }

    fn ranges(&self, axes: &[usize]) -> Result<Vec<Vec<f64>>> {
        for (k, &axis) in axes.iter().enumerate() {
            if axis >= self.params.len() {
                return Err(Error::ScanSetup(format!(
                    "scan parameter {} is out of range, only {} given",
                    axis,
                    self.params.len()
                )));
            }
            if axes[..k].contains(&axis) {
                return Err(Error::ScanSetup(format!("scan parameter {} is swept twice", axis)));
            }
        }
        let ranges = match axes.len() {
            1 => vec![self.range_1d.clone()],
            _ => vec![self.range_2d.0.clone(), self.range_2d.1.clone()],
        };
        if ranges.iter().any(Vec::is_empty) {
            return Err(Error::ScanSetup(format!("{}d scan range is not set", axes.len())));
        }
        Ok(ranges)
    }

    fn launch(&mut self, axes: &[usize], sink: Option<Box<dyn DataSink>>) -> Result<ScanOutcome> {
        let ranges = self.ranges(axes)?;
        let mut shape = vec![self.meas.len()];
        shape.extend(ranges.iter().map(Vec::len));
        let points_total: usize = ranges.iter().map(Vec::len).product();

        let run_id = self.manager.update_run_id()?;
        let (sink, data_file) = match sink {
            Some(sink) => (sink, None),
            None => {
                let path = self.manager.data_file_path(self.storage.extension());
                (open_sink(self.storage, &path)?, Some(path))
            }
        };
        *self.data.lock() = ArrayD::zeros(IxDyn(&shape));
        *self.progress.lock() = ScanProgress {
            done: 0,
            total: points_total,
        };

        let writer = spawn_writer(sink);
        for (range, key) in ranges.iter().zip(SCAN_KEYS) {
            writer.send(SinkMsg::WriteVector {
                key: key.to_string(),
                data: range.clone(),
            })?;
        }
        writer.send(SinkMsg::CreateDataset {
            key: MEAS_KEY.to_string(),
            shape,
        })?;

        let action = self
            .start(axes, &ranges, run_id)
            .and_then(|_| self.action(axes, &ranges, &writer));
        let end = self.end(axes);
        let written = writer.finish();
        let (points_done, aborted) = action?;
        end?;
        written?;

        if aborted {
            log::warn!("run {} aborted after {}/{} point(s)", run_id, points_done, points_total);
        }
        Ok(ScanOutcome {
            run_id,
            data_file,
            points_done,
            points_total,
            aborted,
        })
    }

    fn start(&mut self, axes: &[usize], ranges: &[Vec<f64>], run_id: usize) -> Result<()> {
        let start_time = now_time();
        for (&axis, range) in axes.iter().zip(ranges) {
            let param = &mut self.params[axis];
            ramp(param.as_mut(), range[0], &self.ramp)?;
            self.logger.write(&format!(
                "Scan {} on {}d with the result of {} of which the run id is {} at {}\n",
                param.name(),
                axes.len(),
                self.meas[0].name(),
                run_id,
                start_time
            ))?;
        }
        let swept: Vec<String> = axes.iter().map(|&axis| self.params[axis].name().to_string()).collect();
        let swept: Vec<&str> = swept.iter().map(String::as_str).collect();
        self.logger.write_snapshot(&mut self.params, &swept)?;
        Ok(())
    }

    /// Returns the number of completed points and whether the run was aborted.
    fn action(&mut self, axes: &[usize], ranges: &[Vec<f64>], writer: &SinkWriter) -> Result<(usize, bool)> {
        let Scan {
            meas,
            params,
            manager,
            scaler,
            unit,
            sleep,
            ramp: ramp_settings,
            data,
            progress,
            abort,
            ..
        } = self;
        let mut session = AcqSession::open(meas)?;
        let mut aborted = || abort.as_mut().map_or(false, |r| r.try_recv() == Some(ScanCmd::Abort));
        let x = axes[0];
        let nx = ranges[0].len();
        let mut done = 0;

        // One pass when 1D, where y is absent
        let outer: Vec<Option<(usize, f64)>> = match ranges.get(1) {
            Some(range_y) => range_y.iter().copied().enumerate().map(Some).collect(),
            None => vec![None],
        };
        for step_y in outer {
            if let Some((_, vy)) = step_y {
                ramp(params[x].as_mut(), ranges[0][0], ramp_settings)?;
                params[axes[1]].set(vy)?;
            }
            let idy = step_y.map(|(idy, _)| idy);
            let mut row_done = 0;
            for (idx, &vx) in ranges[0].iter().enumerate() {
                if aborted() {
                    if let Some(idy) = idy.filter(|_| row_done > 0) {
                        write_plane(writer, data, idy)?;
                    }
                    return Ok((done, true));
                }
                params[x].set(vx)?;
                if !sleep.is_zero() {
                    thread::sleep(*sleep);
                }
                let mut column = Vec::with_capacity(session.len());
                for idz in 0..session.len() {
                    let value = mean(&session.read(idz)?) * *scaler;
                    match idy {
                        Some(idy) => data.lock()[&[idz, idx, idy][..]] = value,
                        None => data.lock()[&[idz, idx][..]] = value,
                    }
                    manager.progress(nx, idx, idz, value, unit, idy);
                    column.push(value);
                }
                if idy.is_none() {
                    writer.send(SinkMsg::WriteColumn {
                        key: MEAS_KEY.to_string(),
                        index: vec![idx],
                        values: column,
                    })?;
                }
                row_done += 1;
                done += 1;
                progress.lock().done = done;
            }
            if let Some(idy) = idy {
                write_plane(writer, data, idy)?;
            }
        }
        Ok((done, false))
    }

    fn end(&mut self, axes: &[usize]) -> Result<()> {
        let end_time = now_time();
        let mut first_err = None;
        for &axis in axes {
            let param = &mut self.params[axis];
            if let Err(e) = ramp(param.as_mut(), 0., &self.ramp) {
                log::warn!("could not ramp {} to 0: {}", param.name(), e);
                first_err.get_or_insert(e);
            }
            self.logger.write(&format!(
                "Scan {} stops at {}\n{}\n",
                param.name(),
                end_time,
                "-".repeat(20)
            ))?;
        }
        let data = self.data.lock();
        self.manager.save_cache(&data, SizeUnit::MB, self.cache_threshold_mb);
        first_err.map_or(Ok(()), Err)
    }
}

/// Sends the `(n_meas, nx)` plane at `idy`.
fn write_plane(writer: &SinkWriter, data: &Mutex<ArrayD<f64>>, idy: usize) -> Result<()> {
    let values: Vec<f64> = data.lock().index_axis(Axis(2), idy).iter().copied().collect();
    writer.send(SinkMsg::WriteColumn {
        key: MEAS_KEY.to_string(),
        index: vec![idy],
        values,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acquisition::MockAcquisition;
    use crate::parameter::{FnParameter, ManualParameter};
    use crate::project::DataPaths;
    use crate::storage::MemorySink;
    use crate::worker_cmd_chan::CmdChan;
    use ndarray::{array, Array1};
    use std::path::Path;

    fn no_ramp() -> RampSettings {
        RampSettings {
            step: 0.,
            dwell: Duration::ZERO,
            limit: 50.,
        }
    }

    /// A parameter recording every value it is set to.
    fn recorded(name: &str) -> (Box<dyn Settable>, Arc<Mutex<Vec<f64>>>) {
        let sets = Arc::new(Mutex::new(Vec::new()));
        let sink = sets.clone();
        let param = FnParameter::settable(name, "V", move |v| {
            sink.lock().push(v);
            Ok(())
        });
        (Box::new(param), sets)
    }

    fn scan(root: &Path, meas: Vec<Box<dyn Acquisition>>, params: Vec<Box<dyn Settable>>) -> Scan {
        let paths = DataPaths::new(root.join("data"), root.join("logger")).unwrap();
        let logger = RunLogger::new("QD", "mk", "tester", &paths.logger_dir()).unwrap();
        Scan::new(meas, params, DataManager::new(paths, 0), logger, 1., Duration::ZERO)
            .unwrap()
            .with_ramp(no_ramp())
    }

    #[test]
    fn scaler_units() {
        assert_eq!(scaler_unit(1e9).unwrap(), "nA");
        assert_eq!(scaler_unit(1.).unwrap(), "A");
        assert!(matches!(scaler_unit(2.), Err(Error::ScanSetup(_))));
    }

    #[test]
    fn ramp_steps_then_sets_end() {
        let (mut p, sets) = recorded("gate");
        let settings = RampSettings {
            step: 0.25,
            dwell: Duration::ZERO,
            limit: 50.,
        };
        ramp(p.as_mut(), 1., &settings).unwrap();
        assert_eq!(*sets.lock(), vec![0., 0.25, 0.5, 0.75, 1.]);

        sets.lock().clear();
        ramp(p.as_mut(), 0., &settings).unwrap();
        assert_eq!(*sets.lock(), vec![1., 0.75, 0.5, 0.25, 0.]);
    }

    #[test]
    fn ramp_skips_stepping() {
        let (mut p, sets) = recorded("magnet");
        let settings = RampSettings {
            step: 0.25,
            dwell: Duration::ZERO,
            limit: 50.,
        };
        ramp(p.as_mut(), 60., &settings).unwrap();
        ramp(p.as_mut(), 0.5, &no_ramp()).unwrap();
        assert_eq!(*sets.lock(), vec![60., 0.5]);
    }

    #[test]
    fn only_volts_ramp_to_zero() {
        let mut params: Vec<Box<dyn Settable>> = vec![
            Box::new(ManualParameter::new("gate", "V", 0.5)),
            Box::new(ManualParameter::new("field", "T", 1.5)),
        ];
        assert_eq!(ramp_all_to_zero(&mut params, &no_ramp()), 1);
        assert_eq!(params[0].get().unwrap(), 0.);
        assert_eq!(params[1].get().unwrap(), 1.5);
    }

    #[test]
    fn scan_1d_fills_columns() {
        let dir = tempfile::tempdir().unwrap();
        let (x, sets) = recorded("v_sd");
        let a = MockAcquisition::from_fn("i_sd", 10, |k| k as f64);
        let closes = a.close_counter();
        let meas: Vec<Box<dyn Acquisition>> =
            vec![Box::new(a), Box::new(MockAcquisition::from_fn("i_g", 10, |k| 2. * k as f64))];
        let mut scan = scan(dir.path(), meas, vec![x]);
        scan.set_range_1d(vec![0.1, 0.2, 0.3]).unwrap();

        let sink = MemorySink::new();
        let datasets = sink.handle();
        let outcome = scan.scan_1d_into(0, Box::new(sink)).unwrap();
        assert_eq!(outcome.run_id, 1);
        assert_eq!(outcome.data_file, None);
        assert_eq!((outcome.points_done, outcome.points_total, outcome.aborted), (3, 3, false));
        assert_eq!(*sets.lock(), vec![0.1, 0.1, 0.2, 0.3, 0.]);
        assert_eq!(closes.load(std::sync::atomic::Ordering::SeqCst), 1);

        let expected = array![[0., 1., 2.], [0., 2., 4.]].into_dyn();
        assert_eq!(*scan.data_handle().lock(), expected);
        let datasets = datasets.lock();
        assert_eq!(datasets["meas/measurement"], expected);
        assert_eq!(datasets["scan/scan_range_x"].as_slice().unwrap(), &[0.1, 0.2, 0.3]);
        assert_eq!(scan.manager().cache(), Some(&expected));
        assert_eq!(*scan.progress_handle().lock(), ScanProgress { done: 3, total: 3 });

        let text = std::fs::read_to_string(scan.logger().path()).unwrap();
        assert!(text.contains("Scan v_sd on 1d with the result of i_sd of which the run id is 1 at "));
        assert!(text.contains("Scan v_sd stops at "));
        assert!(text.ends_with(&format!("\n{}\n", "-".repeat(20))));
    }

    #[test]
    fn fixed_parameters_are_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (x, sets) = recorded("v_sd");
        let params: Vec<Box<dyn Settable>> = vec![x, Box::new(ManualParameter::new("plunger", "V", 0.25))];
        let meas: Vec<Box<dyn Acquisition>> = vec![Box::new(MockAcquisition::from_fn("i_sd", 2, |_| 1.))];
        let mut scan = scan(dir.path(), meas, params);
        scan.set_range_1d(Array1::linspace(0., 0.2, 3).to_vec()).unwrap();
        let outcome = scan.scan_1d_into(0, Box::new(MemorySink::new())).unwrap();
        assert_eq!(outcome.points_total, 3);
        assert_eq!(sets.lock().len(), 5);
        assert!((sets.lock()[3] - 0.2).abs() < 1e-12);

        let text = std::fs::read_to_string(scan.logger().path()).unwrap();
        assert!(text.contains("plunger = 0.25 V\n"));
        assert!(!text.contains("v_sd = "));
    }

    #[test]
    fn scan_2d_fills_planes() {
        let dir = tempfile::tempdir().unwrap();
        let (x, x_sets) = recorded("plunger");
        let (y, y_sets) = recorded("barrier");
        let meas: Vec<Box<dyn Acquisition>> = vec![Box::new(MockAcquisition::from_fn("i_sd", 4, |k| k as f64))];
        let mut scan = scan(dir.path(), meas, vec![x, y]);
        scan.set_range_2d(vec![0., 1.], vec![10., 20.]).unwrap();

        let sink = MemorySink::new();
        let datasets = sink.handle();
        let outcome = scan.scan_2d_into(0, 1, Box::new(sink)).unwrap();
        assert_eq!((outcome.points_done, outcome.points_total), (4, 4));

        // x returns to its start before every row
        assert_eq!(*x_sets.lock(), vec![0., 0., 0., 1., 0., 0., 1., 0.]);
        assert_eq!(*y_sets.lock(), vec![10., 10., 20., 0.]);
        let expected = array![[[0., 2.], [1., 3.]]].into_dyn();
        assert_eq!(*scan.data_handle().lock(), expected);
        let datasets = datasets.lock();
        assert_eq!(datasets["meas/measurement"], expected);
        assert_eq!(datasets["scan/scan_range_y"].as_slice().unwrap(), &[10., 20.]);
    }

    #[test]
    fn abort_keeps_written_points() {
        let dir = tempfile::tempdir().unwrap();
        let chan = CmdChan::new();
        let trigger = chan.clone();
        let (x, sets) = recorded("v_sd");
        let acq = MockAcquisition::from_fn("i_sd", 2, move |k| {
            if k == 1 {
                trigger.abort();
            }
            k as f64 + 1.
        });
        let mut scan = scan(dir.path(), vec![Box::new(acq)], vec![x]).with_abort(chan.new_recvr());
        scan.set_range_1d(vec![0.1, 0.2, 0.3, 0.4]).unwrap();

        let sink = MemorySink::new();
        let datasets = sink.handle();
        let outcome = scan.scan_1d_into(0, Box::new(sink)).unwrap();
        assert!(outcome.aborted);
        assert_eq!(outcome.points_done, 2);
        assert_eq!(datasets.lock()["meas/measurement"], array![[1., 2., 0., 0.]].into_dyn());
        // The end phase still brings the parameter back to 0
        assert_eq!(sets.lock().last(), Some(&0.));
    }

    #[test]
    fn setup_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (x, _) = recorded("x");
        let meas: Vec<Box<dyn Acquisition>> = vec![Box::new(MockAcquisition::random("art", 4))];
        let mut scan = scan(dir.path(), meas, vec![x]);
        assert!(matches!(scan.scan_1d_into(0, Box::new(MemorySink::new())), Err(Error::ScanSetup(_))));
        assert!(scan.set_range_1d(Vec::<f64>::new()).is_err());
        scan.set_range_1d(vec![0.]).unwrap();
        assert!(matches!(scan.scan_1d_into(1, Box::new(MemorySink::new())), Err(Error::ScanSetup(_))));
        scan.set_range_2d(vec![0.], vec![1.]).unwrap();
        assert!(matches!(scan.scan_2d_into(0, 0, Box::new(MemorySink::new())), Err(Error::ScanSetup(_))));
        // Nothing ran, so the run id never moved
        assert_eq!(scan.manager().run_id(), 0);

        let paths = DataPaths::new(dir.path().join("d"), dir.path().join("l")).unwrap();
        let logger = RunLogger::new("QD", "mk", "t", dir.path()).unwrap();
        let (x, _) = recorded("x");
        let bad = Scan::new(Vec::new(), vec![x], DataManager::new(paths, 0), logger, 1., Duration::ZERO);
        assert!(matches!(bad, Err(Error::ScanSetup(_))));
    }

    #[test]
    fn failing_parameter_still_ends() {
        let dir = tempfile::tempdir().unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let seen = hits.clone();
        let x = FnParameter::settable("v_sd", "V", move |v| {
            seen.lock().push(v);
            Ok(())
        })
        .with_limits(-1., 1.);
        let meas: Vec<Box<dyn Acquisition>> = vec![Box::new(MockAcquisition::random("art", 4))];
        let mut scan = scan(dir.path(), meas, vec![Box::new(x)]);
        scan.set_range_1d(vec![0.5, 2.]).unwrap();
        assert!(matches!(
            scan.scan_1d_into(0, Box::new(MemorySink::new())),
            Err(Error::OutOfRange { .. })
        ));
        assert_eq!(*hits.lock(), vec![0.5, 0.5, 0.]);
    }
}
