//! Run bookkeeping: dated data directories, per-day run ids and the in-memory data cache.
//!
//! Data files go to `{data_root}/{YYYY-MM-DD}/{run_id}.{ext}`; the logbook lives under
//! `{logger_root}/{YYYY-MM-DD}/`. The run id restarts at 0 when the date changes.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use ndarray::ArrayD;

use crate::error::Result;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H-%M-%S";

/// Dataset keys of the swept ranges, by scan axis.
pub const SCAN_KEYS: [&str; 2] = ["scan/scan_range_x", "scan/scan_range_y"];
pub const MEAS_KEY: &str = "meas/measurement";

pub fn today() -> String {
    Local::now().format(DATE_FORMAT).to_string()
}

pub fn now_time() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        log::info!("{} is created successfully", path.display());
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataPaths {
    data_root: PathBuf,
    logger_root: PathBuf,
    date: String,
}

impl DataPaths {
    /// Paths for today, creating both roots and their date directories.
    pub fn new(data_root: impl Into<PathBuf>, logger_root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_date(data_root, logger_root, &today())
    }

    pub fn with_date(data_root: impl Into<PathBuf>, logger_root: impl Into<PathBuf>, date: &str) -> Result<Self> {
        let paths = Self {
            data_root: data_root.into(),
            logger_root: logger_root.into(),
            date: date.to_string(),
        };
        paths.create_date_dirs()?;
        Ok(paths)
    }

    fn create_date_dirs(&self) -> Result<()> {
        ensure_dir(&self.date_dir())?;
        ensure_dir(&self.logger_dir())
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn date_dir(&self) -> PathBuf {
        self.data_root.join(&self.date)
    }

    pub fn logger_dir(&self) -> PathBuf {
        self.logger_root.join(&self.date)
    }

    /// Moves to today's directories; returns whether the date changed.
    pub fn update_date_dir(&mut self) -> Result<bool> {
        self.update_date_dir_to(&today())
    }

    pub fn update_date_dir_to(&mut self, date: &str) -> Result<bool> {
        if date == self.date {
            return Ok(false);
        }
        self.date = date.to_string();
        self.create_date_dirs()?;
        Ok(true)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeUnit {
    B,
    KB,
    MB,
    GB,
}

impl SizeUnit {
    pub fn bytes(&self) -> usize {
        match self {
            SizeUnit::B => 1,
            SizeUnit::KB => 1 << 10,
            SizeUnit::MB => 1 << 20,
            SizeUnit::GB => 1 << 30,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SizeUnit::B => "B",
            SizeUnit::KB => "KB",
            SizeUnit::MB => "MB",
            SizeUnit::GB => "GB",
        }
    }
}

/// Run ids, data file names and the cache of the last scan's data.
#[derive(Debug)]
pub struct DataManager {
    paths: DataPaths,
    id: usize,
    cache: Option<ArrayD<f64>>,
}

impl DataManager {
    pub fn new(paths: DataPaths, run_id: usize) -> Self {
        Self {
            paths,
            id: run_id,
            cache: None,
        }
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn run_id(&self) -> usize {
        self.id
    }

    /// Advances to the next run, restarting at 0 on a new date.
    pub fn update_run_id(&mut self) -> Result<usize> {
        if self.paths.update_date_dir()? {
            self.id = 0;
        } else {
            self.id += 1;
        }
        Ok(self.id)
    }

    pub fn data_file_path(&self, ext: &str) -> PathBuf {
        self.paths.date_dir().join(format!("{}.{}", self.id, ext))
    }

    /// Number of `.{ext}` files in today's data directory.
    pub fn count_data_files(&self, ext: &str) -> Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(self.paths.date_dir())? {
            let path = entry?.path();
            if path.is_file() && path.extension().map_or(false, |e| e == ext) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Keeps a copy of `data` unless it is larger than `threshold` `unit`s.
    pub fn save_cache(&mut self, data: &ArrayD<f64>, unit: SizeUnit, threshold: usize) -> bool {
        let size = data.len() * std::mem::size_of::<f64>() / unit.bytes();
        if size > threshold {
            log::warn!(
                "The size of data is larger than {} {} and it is failed to save into a cache",
                threshold,
                unit.label()
            );
            return false;
        }
        self.cache = Some(data.clone());
        log::debug!("run {}: data cached", self.id);
        true
    }

    pub fn cache(&self) -> Option<&ArrayD<f64>> {
        self.cache.as_ref()
    }

    /// Logs one point of a scan and returns the progress line.
    pub fn progress(&self, length: usize, idx: usize, idz: usize, current: f64, unit: &str, idy: Option<usize>) -> String {
        const SCALE: usize = 40;
        let done = if length == 0 { 1. } else { (idx + 1) as f64 / length as f64 };
        let filled = ((done * SCALE as f64) as usize).min(SCALE);
        let idy = idy.map_or("None".to_string(), |y| y.to_string());
        let line = format!(
            "run {} idy:{} idz:{} idx:{} --- {:.4} {} [{}{}]{:.1}%",
            self.id,
            idy,
            idz,
            idx,
            current,
            unit,
            "#".repeat(filled),
            " ".repeat(SCALE - filled),
            done * 100.
        );
        log::info!("{}", line);
        line
    }
}
