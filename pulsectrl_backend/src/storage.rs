//! Scan data sinks.
//!
//! Datasets are addressed by `group/name` keys such as `meas/measurement`. A scan creates its
//! datasets up front and then fills them column by column: [`DataSink::write_column`] fixes the
//! trailing indices and writes all values along the leading axes in row-major order.
//!
//! Sinks usually live on a writer thread started by [`spawn_writer`], fed with [`SinkMsg`]s.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Sender};
use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn, Slice};
use parking_lot::Mutex;

use crate::config::StorageKind;
use crate::error::{Error, Result};

pub trait DataSink: Send {
    /// Creates a zero-filled dataset. An existing dataset of that key is kept.
    fn create_dataset(&mut self, key: &str, shape: &[usize]) -> Result<()>;
    /// Writes a complete one-dimensional dataset.
    fn write_vector(&mut self, key: &str, data: &[f64]) -> Result<()>;
    fn write_column(&mut self, key: &str, index: &[usize], values: &[f64]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Checks that `index` fixes trailing axes of `shape` and that `values` fill the rest.
fn check_column(key: &str, shape: &[usize], index: &[usize], values: &[f64]) -> Result<()> {
    if index.len() > shape.len() {
        return Err(Error::Sink(format!(
            "{}: index {:?} has more axes than shape {:?}",
            key, index, shape
        )));
    }
    let lead = shape.len() - index.len();
    if let Some((axis, (i, n))) = index
        .iter()
        .zip(&shape[lead..])
        .enumerate()
        .find(|(_, (i, n))| *i >= *n)
    {
        return Err(Error::Sink(format!(
            "{}: index {} out of bounds for axis {} of length {}",
            key,
            i,
            lead + axis,
            n
        )));
    }
    let expected: usize = shape[..lead].iter().product();
    if values.len() != expected {
        return Err(Error::Sink(format!(
            "{}: expected {} values, got {}",
            key,
            expected,
            values.len()
        )));
    }
    Ok(())
}

pub type SharedDatasets = Arc<Mutex<IndexMap<String, ArrayD<f64>>>>;

/// Keeps datasets in memory, readable through [`MemorySink::handle`].
#[derive(Default)]
pub struct MemorySink {
    datasets: SharedDatasets,
    finished: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SharedDatasets {
        self.datasets.clone()
    }

    pub fn finished_flag(&self) -> Arc<Mutex<bool>> {
        self.finished.clone()
    }
}

impl DataSink for MemorySink {
    fn create_dataset(&mut self, key: &str, shape: &[usize]) -> Result<()> {
        let mut datasets = self.datasets.lock();
        if datasets.contains_key(key) {
            log::warn!("dataset {} already exists, reusing it", key);
            return Ok(());
        }
        datasets.insert(key.to_string(), ArrayD::zeros(IxDyn(shape)));
        Ok(())
    }

    fn write_vector(&mut self, key: &str, data: &[f64]) -> Result<()> {
        let arr = ArrayD::from_shape_vec(IxDyn(&[data.len()]), data.to_vec())
            .map_err(|e| Error::Sink(e.to_string()))?;
        self.datasets.lock().insert(key.to_string(), arr);
        Ok(())
    }

    fn write_column(&mut self, key: &str, index: &[usize], values: &[f64]) -> Result<()> {
        let mut datasets = self.datasets.lock();
        let arr = datasets
            .get_mut(key)
            .ok_or_else(|| Error::Sink(format!("unknown dataset {}", key)))?;
        check_column(key, arr.shape(), index, values)?;
        let lead = arr.ndim() - index.len();
        let mut view = arr.slice_each_axis_mut(|ax| {
            let axis = ax.axis.index();
            if axis < lead {
                Slice::from(..)
            } else {
                let i = index[axis - lead] as isize;
                Slice::from(i..i + 1)
            }
        });
        view.iter_mut().zip(values).for_each(|(dst, src)| *dst = *src);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        *self.finished.lock() = true;
        Ok(())
    }
}

/// Long-format CSV: one `dataset,position,value` row per written value, positions as
/// colon-joined indices. Dataset shapes are recorded as `shape` rows.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    writer: csv::Writer<std::fs::File>,
    shapes: IndexMap<String, Vec<usize>>,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    pub fn create(path: &Path) -> Result<Self> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["dataset", "position", "value"])?;
        log::info!("CSV sink writing to {}", path.display());
        Ok(Self {
            writer,
            shapes: IndexMap::new(),
        })
    }

    fn join(index: impl Iterator<Item = usize>) -> String {
        index.map(|i| i.to_string()).collect::<Vec<_>>().join(":")
    }
}

#[cfg(feature = "storage_csv")]
impl DataSink for CsvSink {
    fn create_dataset(&mut self, key: &str, shape: &[usize]) -> Result<()> {
        if self.shapes.contains_key(key) {
            log::warn!("dataset {} already exists, reusing it", key);
            return Ok(());
        }
        let dims = shape.iter().map(|n| n.to_string()).collect::<Vec<_>>().join("x");
        self.writer.write_record([key, "shape", dims.as_str()])?;
        self.shapes.insert(key.to_string(), shape.to_vec());
        Ok(())
    }

    fn write_vector(&mut self, key: &str, data: &[f64]) -> Result<()> {
        for (i, v) in data.iter().enumerate() {
            self.writer
                .write_record([key, i.to_string().as_str(), v.to_string().as_str()])?;
        }
        self.shapes.insert(key.to_string(), vec![data.len()]);
        Ok(())
    }

    fn write_column(&mut self, key: &str, index: &[usize], values: &[f64]) -> Result<()> {
        let shape = self
            .shapes
            .get(key)
            .ok_or_else(|| Error::Sink(format!("unknown dataset {}", key)))?
            .clone();
        check_column(key, &shape, index, values)?;
        let lead = &shape[..shape.len() - index.len()];
        let mut pos = vec![0; lead.len()];
        for v in values {
            let position = Self::join(pos.iter().chain(index.iter()).copied());
            self.writer
                .write_record([key, position.as_str(), v.to_string().as_str()])?;
            // Row-major increment of the leading multi-index
            for axis in (0..lead.len()).rev() {
                pos[axis] += 1;
                if pos[axis] < lead[axis] {
                    break;
                }
                pos[axis] = 0;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(feature = "storage_hdf5")]
pub struct Hdf5Sink {
    file: hdf5::File,
}

#[cfg(feature = "storage_hdf5")]
impl Hdf5Sink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = hdf5::File::create(path)?;
        log::info!("HDF5 sink writing to {}", path.display());
        Ok(Self { file })
    }

    /// The group holding `key`, created when missing, and the dataset name inside it.
    fn group_of<'k>(&self, key: &'k str) -> Result<(hdf5::Group, &'k str)> {
        match key.rsplit_once('/') {
            Some((group, name)) => {
                let group = match self.file.group(group) {
                    Ok(group) => group,
                    Err(_) => self.file.create_group(group)?,
                };
                Ok((group, name))
            }
            None => Ok(((*self.file).clone(), key)),
        }
    }
}

#[cfg(feature = "storage_hdf5")]
impl DataSink for Hdf5Sink {
    fn create_dataset(&mut self, key: &str, shape: &[usize]) -> Result<()> {
        if self.file.dataset(key).is_ok() {
            log::warn!("dataset {} already exists, reusing it", key);
            return Ok(());
        }
        let (group, name) = self.group_of(key)?;
        group.new_dataset::<f64>().shape(shape.to_vec()).create(name)?;
        Ok(())
    }

    fn write_vector(&mut self, key: &str, data: &[f64]) -> Result<()> {
        let (group, name) = self.group_of(key)?;
        group
            .new_dataset::<f64>()
            .shape(data.len())
            .create(name)?
            .write(data)?;
        Ok(())
    }

    fn write_column(&mut self, key: &str, index: &[usize], values: &[f64]) -> Result<()> {
        use ndarray::{s, Array1, Array2};

        let ds = self.file.dataset(key)?;
        let shape = ds.shape();
        check_column(key, &shape, index, values)?;
        match (shape.len(), index) {
            (2, &[i]) => ds.write_slice(&Array1::from(values.to_vec()), s![.., i])?,
            (3, &[i]) => {
                let plane = Array2::from_shape_vec((shape[0], shape[1]), values.to_vec())
                    .map_err(|e| Error::Sink(e.to_string()))?;
                ds.write_slice(&plane, s![.., .., i])?
            }
            (3, &[i, j]) => ds.write_slice(&Array1::from(values.to_vec()), s![.., i, j])?,
            _ => {
                return Err(Error::Sink(format!(
                    "{}: column writes of rank {} with {} fixed axes are not supported",
                    key,
                    shape.len(),
                    index.len()
                )))
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Opens a file sink of the configured kind at `path`.
pub fn open_sink(kind: StorageKind, path: &Path) -> Result<Box<dyn DataSink>> {
    match kind {
        #[cfg(feature = "storage_csv")]
        StorageKind::Csv => Ok(Box::new(CsvSink::create(path)?)),
        #[cfg(not(feature = "storage_csv"))]
        StorageKind::Csv => {
            let _ = path;
            Err(Error::FeatureNotEnabled("storage_csv"))
        }
        #[cfg(feature = "storage_hdf5")]
        StorageKind::Hdf5 => Ok(Box::new(Hdf5Sink::create(path)?)),
        #[cfg(not(feature = "storage_hdf5"))]
        StorageKind::Hdf5 => {
            let _ = path;
            Err(Error::FeatureNotEnabled("storage_hdf5"))
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SinkMsg {
    CreateDataset { key: String, shape: Vec<usize> },
    WriteVector { key: String, data: Vec<f64> },
    WriteColumn { key: String, index: Vec<usize>, values: Vec<f64> },
    Finish,
}

/// Sending half of a writer thread.
pub struct SinkWriter {
    tx: Sender<SinkMsg>,
    handle: JoinHandle<Result<usize>>,
}

/// Moves `sink` onto its own thread. The thread applies messages in order and stops at
/// [`SinkMsg::Finish`], when all senders are gone, or at the first failing write.
pub fn spawn_writer(mut sink: Box<dyn DataSink>) -> SinkWriter {
    let (tx, rx) = unbounded::<SinkMsg>();
    let handle = thread::spawn(move || -> Result<usize> {
        let mut applied = 0;
        for msg in rx.iter() {
            match msg {
                SinkMsg::CreateDataset { key, shape } => sink.create_dataset(&key, &shape)?,
                SinkMsg::WriteVector { key, data } => sink.write_vector(&key, &data)?,
                SinkMsg::WriteColumn { key, index, values } => sink.write_column(&key, &index, &values)?,
                SinkMsg::Finish => break,
            }
            applied += 1;
        }
        sink.finish()?;
        log::debug!("sink writer applied {} message(s)", applied);
        Ok(applied)
    });
    SinkWriter { tx, handle }
}

impl SinkWriter {
    pub fn send(&self, msg: SinkMsg) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| Error::Sink("writer thread has stopped".to_string()))
    }

    /// Flushes the sink and returns the number of applied messages, or the write error that
    /// stopped the thread.
    pub fn finish(self) -> Result<usize> {
        // The thread may already have stopped on an error, reported by join below
        let _ = self.tx.send(SinkMsg::Finish);
        drop(self.tx);
        self.handle
            .join()
            .map_err(|_| Error::Sink("writer thread panicked".to_string()))?
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn memory_columns() {
        let mut sink = MemorySink::new();
        let data = sink.handle();
        sink.create_dataset("meas/measurement", &[2, 3]).unwrap();
        sink.write_column("meas/measurement", &[1], &[5., 6.]).unwrap();
        assert_eq!(
            data.lock()["meas/measurement"],
            array![[0., 5., 0.], [0., 6., 0.]].into_dyn()
        );
        assert!(sink.write_column("meas/measurement", &[3], &[1., 2.]).is_err());
        assert!(sink.write_column("meas/measurement", &[0], &[1.]).is_err());
        assert!(sink.write_column("nope", &[0], &[1., 2.]).is_err());
    }

    #[test]
    fn memory_planes() {
        let mut sink = MemorySink::new();
        let data = sink.handle();
        sink.create_dataset("m", &[1, 2, 2]).unwrap();
        sink.write_column("m", &[1], &[1., 2.]).unwrap();
        assert_eq!(data.lock()["m"], array![[[0., 1.], [0., 2.]]].into_dyn());
        // Existing datasets survive a second create
        sink.create_dataset("m", &[4]).unwrap();
        assert_eq!(data.lock()["m"].shape(), &[1, 2, 2]);
    }

    #[test]
    fn writer_thread_applies_in_order() {
        let sink = MemorySink::new();
        let (data, finished) = (sink.handle(), sink.finished_flag());
        let writer = spawn_writer(Box::new(sink));
        writer
            .send(SinkMsg::WriteVector {
                key: "scan/scan_range_x".to_string(),
                data: vec![0., 0.5],
            })
            .unwrap();
        writer
            .send(SinkMsg::CreateDataset {
                key: "meas/measurement".to_string(),
                shape: vec![1, 2],
            })
            .unwrap();
        writer
            .send(SinkMsg::WriteColumn {
                key: "meas/measurement".to_string(),
                index: vec![1],
                values: vec![3.],
            })
            .unwrap();
        assert_eq!(writer.finish().unwrap(), 3);
        assert!(*finished.lock());
        assert_eq!(data.lock()["meas/measurement"], array![[0., 3.]].into_dyn());
    }

    #[test]
    fn writer_reports_first_error() {
        let writer = spawn_writer(Box::new(MemorySink::new()));
        writer
            .send(SinkMsg::WriteColumn {
                key: "missing".to_string(),
                index: vec![0],
                values: vec![1.],
            })
            .unwrap();
        assert!(matches!(writer.finish(), Err(Error::Sink(_))));
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.csv");
        let mut sink = open_sink(StorageKind::Csv, &path).unwrap();
        sink.write_vector("scan/scan_range_x", &[0., 1.]).unwrap();
        sink.create_dataset("meas/measurement", &[2, 2]).unwrap();
        sink.write_column("meas/measurement", &[1], &[0.5, 0.25]).unwrap();
        sink.finish().unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<Vec<String>> = reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[2], vec!["meas/measurement", "shape", "2x2"]);
        assert_eq!(rows[3], vec!["meas/measurement", "0:1", "0.5"]);
        assert_eq!(rows[4], vec!["meas/measurement", "1:1", "0.25"]);
    }

    #[cfg(not(feature = "storage_hdf5"))]
    #[test]
    fn hdf5_needs_feature() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            open_sink(StorageKind::Hdf5, &dir.path().join("0.hdf5")),
            Err(Error::FeatureNotEnabled("storage_hdf5"))
        ));
    }
}
