use thiserror::Error;

/// Meaning of an SP1060 return code.
pub fn return_code_message(code: &i64) -> &'static str {
    match code {
        0 => "no error",
        1 => "invalid DAC channel",
        2 => "missing DAC value or status",
        3 => "DAC value out of range",
        4 => "mistyped",
        5 => "remote writing not allowed",
        _ => "unknown",
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Compiler(#[from] pulsecompiler_backend::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SP1060 returned {code} ({}) to {command:?}", return_code_message(.code))]
    Protocol { code: i64, command: String },

    #[error("unexpected reply {reply:?} to {command:?}")]
    Reply { command: String, reply: String },

    #[error("no free SP1060 {kind} generator for channel {channel} at {at} s")]
    NoGenerator {
        kind: &'static str,
        channel: usize,
        at: f64,
    },

    #[error("pulse {pulse} needs {points} AWG points, the memory holds {max}")]
    AwgMemory { pulse: String, points: usize, max: usize },

    #[error("acquisition {name}: {reason}")]
    Acquisition { name: String, reason: String },

    #[error("parameter {name}: {value} is outside [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("parameter {0} cannot be read")]
    NotGettable(String),

    #[error("data sink: {0}")]
    Sink(String),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "storage_hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("scan setup: {0}")]
    ScanSetup(String),

    #[error("command channel: viewed message {viewed} diverged from posted message {posted}")]
    CmdDiverged { viewed: usize, posted: usize },

    #[error("no driver registered for interface {0}")]
    NoDriver(String),

    #[error("feature {0} is not enabled")]
    FeatureNotEnabled(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
