//! # pulsectrl_backend
//!
//! Runs what [`pulsecompiler_backend`] describes. A [`Dispatcher`] validates a layout and loads
//! every pulse line into the [`PulseDriver`] of its sending instrument, for instance the
//! [`Sp1060Driver`] speaking the text protocol of the LNHR DAC SP1060. On top of the instruments,
//! a [`Scan`] sweeps [settable parameters](parameter) while reading [acquisitions](acquisition),
//! streaming the data to a [sink](storage) on a writer thread and noting every run in the
//! [logbook](logbook).
//!
//! Runtime settings come from [`CtrlConfig`].

pub mod acquisition;
pub mod config;
pub mod driver;
pub mod error;
pub mod logbook;
pub mod parameter;
pub mod project;
pub mod scan;
pub mod sp1060;
pub mod storage;
pub mod utils;
pub mod worker_cmd_chan;

pub use acquisition::{AcqSession, Acquisition, MockAcquisition};
pub use config::{CtrlConfig, RampSettings, StorageKind};
pub use driver::{Dispatcher, PulseDriver, RecordingDriver};
pub use error::{Error, Result};
pub use logbook::{snapshot_text, RunLogger};
pub use parameter::{FnParameter, Gettable, ManualParameter, Settable};
pub use project::{DataManager, DataPaths, SizeUnit};
pub use scan::{ramp, ramp_all_to_zero, Scan, ScanOutcome, ScanProgress};
pub use sp1060::{Generator, SimulatedSp1060, Sp1060, Sp1060Channel, Sp1060Driver};
pub use storage::{open_sink, spawn_writer, DataSink, MemorySink};
pub use worker_cmd_chan::{CmdChan, ScanCmd};
