use thiserror::Error;

use crate::validation::Violation;

/// Errors raised while building, scheduling, validating or compiling a layout.
#[derive(Error, Debug)]
pub enum Error {
    #[error("channel address '{0}' is not of the form 'instrument.channel'")]
    BadAddress(String),

    #[error("no instrument interface named {name}. Registered interfaces are {registered:?}")]
    UnknownInterface {
        name: String,
        registered: Vec<String>,
    },

    #[error("no such channel named {0}")]
    UnknownChannel(String),

    #[error("channel {0} already registered")]
    DuplicateChannel(String),

    #[error("interface {0} already registered")]
    DuplicateInterface(String),

    #[error("invalid condition for channel {channel}: {reason}")]
    InvalidCondition { channel: String, reason: String },

    #[error("the channel type of output channel {output} ({output_type}) and input channel {input} ({input_type}) should be the same")]
    ChannelTypeMismatch {
        output: String,
        output_type: String,
        input: String,
        input_type: String,
    },

    #[error("{0} should not be an input channel")]
    OutputIsInput(String),

    #[error("{0} should be an input channel")]
    InputIsOutput(String),

    #[error("connection carries {chain_type} channels, {channel} is {channel_type}")]
    ChainTypeMismatch {
        chain_type: String,
        channel: String,
        channel_type: String,
    },

    #[error("the connection has no channels")]
    EmptyConnection,

    #[error("connection index {index} out of range, {len} connection(s) registered")]
    ConnectionIndex { index: usize, len: usize },

    #[error("invalid timing for pulse {pulse}: {reason}")]
    PulseTiming { pulse: String, reason: String },

    #[error("invalid pulse {pulse}: {reason}")]
    InvalidPulse { pulse: String, reason: String },

    #[error("repeat of pulse element {element} should be at least 1, got {repeat}")]
    InvalidRepeat { element: String, repeat: usize },

    #[error("delay of pulse element {element} should not be negative, got {delay}")]
    NegativeDelay { element: String, delay: f64 },

    #[error("pulse element {0} already exists")]
    DuplicateElement(String),

    #[error("pulse element {0} does not exist")]
    UnknownElement(String),

    #[error("pulse line {0} does not exist")]
    UnknownLine(String),

    #[error("pulse line {line}: pulse {pulse} starts at {start} s before the previous pulse ends at {prev_stop} s")]
    ScheduleOverlap {
        line: String,
        pulse: String,
        start: f64,
        prev_stop: f64,
    },

    #[error("instruction type {instr_type} expects argument {key}")]
    MissingInstrArg { instr_type: String, key: String },

    #[error("instruction {instr} end_pos {end_pos} should be strictly greater than start_pos {start_pos}")]
    EmptyInstr {
        instr: String,
        start_pos: usize,
        end_pos: usize,
    },

    #[error("track {track}: instruction {new} overlaps with {existing}")]
    InstrOverlap {
        track: String,
        new: String,
        existing: String,
    },

    #[error("attempted to compile track {track} with stop_pos {stop_pos} while instructions end at {last_end}")]
    CompileStop {
        track: String,
        stop_pos: usize,
        last_end: usize,
    },

    #[error("track {0} is not compiled")]
    NotCompiled(String),

    #[error("track {track}: invalid signal interval {start_pos}-{end_pos} (compiled up to {stop_pos})")]
    SignalInterval {
        track: String,
        start_pos: usize,
        end_pos: usize,
        stop_pos: usize,
    },

    #[error("{} condition violation(s):\n{}", .0.len(), format_violations(.0))]
    ConditionsViolated(Vec<Violation>),

    #[error("layout config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(feature = "python")]
impl From<Error> for pyo3::PyErr {
    fn from(value: Error) -> Self {
        pyo3::exceptions::PyValueError::new_err(value.to_string())
    }
}
