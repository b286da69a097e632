//! Sample-domain instructions which render pulses onto a clock grid.
//!
//! ## Main Structures and Enumerations:
//!
//! - `InstrType`: the supported instruction kinds, `CONST` for constant values, `LINRAMP` for linear
//!   ramps between two values and `SINE` for sinusoidal waves.
//!
//! - `Instruction`: an instruction type (`InstrType`) together with its arguments (`InstrArgs`).
//!
//! - `InstrBook`: an instruction placed on a track, with its interval on the clock grid and whether the
//!   track keeps the last value after the interval ends.
//!
//! The module makes use of the `maplit` crate to build argument dictionaries.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;

use maplit::hashmap;

use crate::error::{Error, Result};

/// Type alias for instruction arguments: a dictionary with key-value pairs of
/// string (argument name) and float (value)
pub type InstrArgs = HashMap<String, f64>;

/// Enum type for different instructions. Supported instructions: `CONST`, `LINRAMP`, `SINE`
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InstrType {
    CONST,
    LINRAMP,
    SINE,
}
impl fmt::Display for InstrType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                InstrType::CONST => "CONST",
                InstrType::LINRAMP => "LINRAMP",
                InstrType::SINE => "SINE",
            }
        )
    }
}

/// Struct for a general instruction, consisting of type and arguments.
///
/// ## Implemented instruction types and their expected fields:
/// 1. `InstrType::CONST`:
///    - `value`
/// 2. `InstrType::LINRAMP`:
///    - `start_val`, `end_val`, `start_time`, `end_time` (times in seconds on the track clock)
/// 3. `InstrType::SINE`:
///    - `freq`
///    - `amplitude`: Default is `1.0`
///    - `offset`: Default is `0.0`
///    - `phase`: Default is `0.0`
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    instr_type: InstrType,
    args: InstrArgs,
}
impl Instruction {
    /// Constructs an `Instruction`, checking that `args` holds the keys its type requires.
    ///
    /// ```
    /// use pulsecompiler_backend::instruction::*;
    ///
    /// let mut const_args = InstrArgs::new();
    /// const_args.insert("value".to_string(), 1.0);
    /// assert!(Instruction::new(InstrType::CONST, const_args).is_ok());
    /// assert!(Instruction::new(InstrType::SINE, InstrArgs::new()).is_err());
    /// ```
    pub fn new(instr_type: InstrType, args: InstrArgs) -> Result<Self> {
        let required: &[&str] = match instr_type {
            InstrType::CONST => &["value"],
            InstrType::LINRAMP => &["start_val", "end_val", "start_time", "end_time"],
            InstrType::SINE => &["freq"],
        };
        if let Some(key) = required.iter().find(|key| !args.contains_key(**key)) {
            return Err(Error::MissingInstrArg {
                instr_type: instr_type.to_string(),
                key: key.to_string(),
            });
        }
        Ok(Instruction { instr_type, args })
    }

    pub fn instr_type(&self) -> InstrType {
        self.instr_type
    }

    pub fn args(&self) -> &InstrArgs {
        &self.args
    }

    fn arg_or(&self, key: &str, default: f64) -> f64 {
        self.args.get(key).copied().unwrap_or(default)
    }

    /// Evaluates the instruction over a view of time values (seconds), replacing them in place.
    ///
    /// ```
    /// use ndarray::Array1;
    /// use pulsecompiler_backend::instruction::*;
    ///
    /// let mut t_values = Array1::linspace(0.0, 1.0, 11);
    /// Instruction::new_linramp(0., 10., 0., 1.).eval_inplace(&mut t_values.view_mut());
    /// assert!((t_values[5] - 5.).abs() < 1e-12);
    /// ```
    pub fn eval_inplace(&self, t_arr: &mut ndarray::ArrayViewMut1<f64>) {
        match self.instr_type {
            InstrType::CONST => {
                t_arr.fill(self.arg_or("value", 0.));
            }
            InstrType::LINRAMP => {
                let start_val = self.arg_or("start_val", 0.);
                let end_val = self.arg_or("end_val", 0.);
                let start_time = self.arg_or("start_time", 0.);
                let end_time = self.arg_or("end_time", 0.);
                let span = end_time - start_time;
                if span <= 0. {
                    t_arr.fill(end_val);
                    return;
                }
                let slope = (end_val - start_val) / span;
                t_arr.map_inplace(|t| *t = start_val + slope * (*t - start_time));
            }
            InstrType::SINE => {
                let freq = self.arg_or("freq", 0.);
                let amplitude = self.arg_or("amplitude", 1.);
                let offset = self.arg_or("offset", 0.);
                let phase = self.arg_or("phase", 0.);

                t_arr.map_inplace(|t| {
                    *t = (2.0 * PI * freq * (*t) + phase).sin() * amplitude + offset
                });
            }
        }
    }

    /// Evaluates the instruction at a single time point.
    pub fn eval_point(&self, t: f64) -> f64 {
        let mut t_arr = ndarray::array![t];
        self.eval_inplace(&mut t_arr.view_mut());
        t_arr[0]
    }

    pub fn new_const(value: f64) -> Instruction {
        Instruction {
            instr_type: InstrType::CONST,
            args: hashmap! {String::from("value") => value},
        }
    }

    /// Linear ramp from `start_val` at `start_time` to `end_val` at `end_time`.
    pub fn new_linramp(start_val: f64, end_val: f64, start_time: f64, end_time: f64) -> Instruction {
        Instruction {
            instr_type: InstrType::LINRAMP,
            args: hashmap! {
                String::from("start_val") => start_val,
                String::from("end_val") => end_val,
                String::from("start_time") => start_time,
                String::from("end_time") => end_time,
            },
        }
    }

    /// Sine instruction; unspecified optional arguments fall back to their defaults on evaluation.
    pub fn new_sine(
        freq: f64,
        amplitude: Option<f64>,
        phase: Option<f64>,
        dc_offset: Option<f64>,
    ) -> Instruction {
        let mut args: InstrArgs = hashmap! {"freq".to_string() => freq};
        [
            ("amplitude", amplitude),
            ("phase", phase),
            ("offset", dc_offset),
        ]
        .iter()
        .for_each(|(key, opt_value)| {
            if let Some(value) = *opt_value {
                args.insert(key.to_string(), value);
            }
        });
        Instruction {
            instr_type: InstrType::SINE,
            args,
        }
    }
}
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut args: Vec<_> = self.args.iter().collect();
        args.sort_by(|a, b| a.0.cmp(b.0));
        let args_string = args
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<String>>()
            .join(", ");
        write!(f, "[{}, {{{}}}]", self.instr_type, args_string)
    }
}

/// An instruction placed on a track.
///
/// For the instruction interval `start_pos` is inclusive and `end_pos` exclusive.
/// `keep_val` decides whether the track holds the instruction's last value after the
/// interval or falls back to zero. Ordering is by `start_pos`.
#[derive(Clone, Debug)]
pub struct InstrBook {
    pub start_pos: usize,
    pub end_pos: usize,
    pub keep_val: bool,
    pub instr: Instruction,
}
impl InstrBook {
    /// Checks that `end_pos` is strictly greater than `start_pos`.
    ///
    /// ```
    /// # use pulsecompiler_backend::instruction::*;
    /// assert!(InstrBook::new(0, 5, true, Instruction::new_const(1.0)).is_ok());
    /// assert!(InstrBook::new(5, 5, true, Instruction::new_const(1.0)).is_err());
    /// ```
    pub fn new(start_pos: usize, end_pos: usize, keep_val: bool, instr: Instruction) -> Result<Self> {
        if end_pos <= start_pos {
            return Err(Error::EmptyInstr {
                instr: instr.to_string(),
                start_pos,
                end_pos,
            });
        }
        Ok(InstrBook {
            start_pos,
            end_pos,
            keep_val,
            instr,
        })
    }

    /// Value the track holds after this instruction ends.
    pub fn after_value(&self, samp_rate: f64) -> f64 {
        if !self.keep_val {
            return 0.;
        }
        match self.instr.instr_type() {
            InstrType::CONST => self.instr.arg_or("value", 0.),
            _ => self.instr.eval_point(self.end_pos as f64 / samp_rate),
        }
    }
}
impl Ord for InstrBook {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_pos.cmp(&other.start_pos)
    }
}
impl PartialOrd for InstrBook {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for InstrBook {
    fn eq(&self, other: &Self) -> bool {
        self.start_pos == other.start_pos
    }
}
impl Eq for InstrBook {}
impl fmt::Display for InstrBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InstrBook({}, {}-{}, {})",
            self.instr, self.start_pos, self.end_pos, self.keep_val
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_args() {
        let err = Instruction::new(InstrType::LINRAMP, hashmap! {"start_val".to_string() => 0.});
        assert!(matches!(err, Err(Error::MissingInstrArg { key, .. }) if key == "end_val"));
    }

    #[test]
    fn sine_defaults() {
        let sine = Instruction::new_sine(1.0, None, None, Some(0.5));
        assert!((sine.eval_point(0.25) - 1.5).abs() < 1e-12);
        assert!((sine.eval_point(0.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn ramp_holds_end_value() {
        let ramp = Instruction::new_linramp(0., 1., 0., 0.01);
        let book = InstrBook::new(0, 10, true, ramp.clone()).unwrap();
        assert!((book.after_value(1e3) - 1.).abs() < 1e-12);
        let book = InstrBook::new(0, 10, false, ramp).unwrap();
        assert_eq!(book.after_value(1e3), 0.);
    }

    #[test]
    fn display_sorted_args() {
        let ramp = Instruction::new_linramp(0., 1., 2., 3.);
        assert_eq!(
            ramp.to_string(),
            "[LINRAMP, {end_time: 3, end_val: 1, start_time: 2, start_val: 0}]"
        );
    }
}
