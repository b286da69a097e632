//! Clock-grid tracks: the instruction list of one pulse line on its sender's sample clock.
//!
//! Editing adds [`InstrBook`]s to an ordered set (`instr_list`). Compiling pads the gaps between
//! them with the last kept value (or zero) up to a stop position, then merges equal neighbours
//! into the `(instr_end, instr_val)` pair which sampling reads from.

use std::collections::BTreeSet;

use ndarray::{s, Array1};

use crate::error::{Error, Result};
use crate::instruction::*;
use crate::utils::time_to_pos;

pub trait BaseTrack {
    // Field methods
    fn samp_rate(&self) -> f64;
    fn name(&self) -> &str;
    fn is_fresh_compiled(&self) -> bool;
    fn instr_list(&self) -> &BTreeSet<InstrBook>;
    fn instr_end(&self) -> &Vec<usize>;
    fn instr_val(&self) -> &Vec<Instruction>;
    // Mutable field references
    fn fresh_compiled_(&mut self) -> &mut bool;
    fn instr_list_(&mut self) -> &mut BTreeSet<InstrBook>;
    fn instr_end_(&mut self) -> &mut Vec<usize>;
    fn instr_val_(&mut self) -> &mut Vec<Instruction>;

    // instr_list tracks edits, while (instr_end, instr_val) tracks compilation results
    fn is_compiled(&self) -> bool {
        !self.instr_end().is_empty()
    }
    fn is_edited(&self) -> bool {
        !self.instr_list().is_empty()
    }

    fn last_instr_end_pos(&self) -> usize {
        self.instr_list().last().map_or(0, |instr| instr.end_pos)
    }

    /// Pads and merges the contents of `instr_list` into `(instr_end, instr_val)`.
    fn compile(&mut self, stop_pos: usize) -> Result<()> {
        if self.instr_list().is_empty() {
            return Ok(());
        }
        // Ignore double compiles
        if self.is_fresh_compiled() && self.instr_end().last() == Some(&stop_pos) {
            return Ok(());
        }
        let last_end = self.last_instr_end_pos();
        if last_end > stop_pos {
            return Err(Error::CompileStop {
                track: self.name().to_string(),
                stop_pos,
                last_end,
            });
        }
        self.clear_compile_cache();
        *self.fresh_compiled_() = true;

        let samp_rate = self.samp_rate();
        let mut last_val = 0.;
        let mut cursor = 0;
        let mut padded: Vec<(usize, Instruction)> = Vec::new();
        for instr_book in self.instr_list().iter() {
            if cursor != instr_book.start_pos {
                padded.push((instr_book.start_pos, Instruction::new_const(last_val)));
            }
            padded.push((instr_book.end_pos, instr_book.instr.clone()));
            last_val = instr_book.after_value(samp_rate);
            cursor = instr_book.end_pos;
        }
        if cursor != stop_pos {
            padded.push((stop_pos, Instruction::new_const(last_val)));
        }

        // Merge equal neighbours
        let mut instr_end: Vec<usize> = Vec::with_capacity(padded.len());
        let mut instr_val: Vec<Instruction> = Vec::with_capacity(padded.len());
        for (end, instr) in padded {
            if instr_val.last() == Some(&instr) {
                if let Some(last_end) = instr_end.last_mut() {
                    *last_end = end;
                }
            } else {
                instr_val.push(instr);
                instr_end.push(end);
            }
        }
        *self.instr_end_() = instr_end;
        *self.instr_val_() = instr_val;
        Ok(())
    }

    // Assumes instr_end is in rising order.
    // Returns the least index such that pos is not above the indexed element
    fn binfind_first_intersect_instr(&self, start_pos: usize) -> usize {
        self.instr_end().partition_point(|&end| end < start_pos)
    }

    fn clear_edit_cache(&mut self) {
        *self.fresh_compiled_() = self.instr_end().is_empty();
        self.instr_list_().clear();
    }

    fn clear_compile_cache(&mut self) {
        *self.fresh_compiled_() = self.instr_list().is_empty();
        self.instr_end_().clear();
        self.instr_val_().clear();
    }

    fn compiled_stop_pos(&self) -> usize {
        *self.instr_end().last().unwrap_or(&0)
    }

    fn compiled_stop_time(&self) -> f64 {
        self.compiled_stop_pos() as f64 / self.samp_rate()
    }

    fn edit_stop_time(&self) -> f64 {
        self.last_instr_end_pos() as f64 / self.samp_rate()
    }

    /// Places an instruction on the grid. Intervals rounding to zero ticks are skipped
    /// and reported with `Ok(false)`.
    fn add_instr(&mut self, instr: Instruction, t: f64, duration: f64, keep_val: bool) -> Result<bool> {
        let start_pos = time_to_pos(t, self.samp_rate());
        let end_pos = time_to_pos(t + duration, self.samp_rate());
        if end_pos == start_pos {
            log::warn!(
                "track {}: instruction {} at {} s is shorter than one tick, skipped",
                self.name(),
                instr,
                t
            );
            return Ok(false);
        }
        let new_instrbook = InstrBook::new(start_pos, end_pos, keep_val, instr)?;

        let overlap = |existing: &InstrBook| Error::InstrOverlap {
            track: self.name().to_string(),
            new: new_instrbook.to_string(),
            existing: existing.to_string(),
        };
        if let Some(next) = self.instr_list().range(&new_instrbook..).next() {
            if next.start_pos < new_instrbook.end_pos {
                return Err(overlap(next));
            }
        }
        if let Some(prev) = self.instr_list().range(..&new_instrbook).next_back() {
            if prev.end_pos > new_instrbook.start_pos {
                return Err(overlap(prev));
            }
        }

        // Upon adding an instruction, the track is not freshly compiled anymore
        *self.fresh_compiled_() = false;
        self.instr_list_().insert(new_instrbook);
        Ok(true)
    }

    /// Samples the compiled track between `start_pos` and `end_pos` into `num_samps` values.
    ///
    /// The buffer must hold the sampled t-values, which are replaced with signal values.
    fn fill_signal_nsamps(
        &self,
        start_pos: usize,
        end_pos: usize,
        num_samps: usize,
        buffer: &mut ndarray::ArrayViewMut1<f64>,
    ) -> Result<()> {
        if !self.is_compiled() {
            return Err(Error::NotCompiled(self.name().to_string()));
        }
        let stop_pos = self.compiled_stop_pos();
        if end_pos <= start_pos || end_pos > stop_pos || buffer.len() != num_samps {
            return Err(Error::SignalInterval {
                track: self.name().to_string(),
                start_pos,
                end_pos,
                stop_pos,
            });
        }

        let start_instr_idx = self.binfind_first_intersect_instr(start_pos + 1);
        let end_instr_idx = self.binfind_first_intersect_instr(end_pos);
        // Linear map from grid position to buffer offset: start_pos |-> 0, end_pos |-> num_samps
        let cvt_idx = |pos: usize| {
            ((pos - start_pos) as f64 / (end_pos - start_pos) as f64 * (num_samps as f64)).round()
                as usize
        };

        let mut cur_pos = start_pos;
        for i in start_instr_idx..=end_instr_idx {
            let seg_end = std::cmp::min(end_pos, self.instr_end()[i]);
            let mut slice = buffer.slice_mut(s![cvt_idx(cur_pos)..cvt_idx(seg_end)]);
            self.instr_val()[i].eval_inplace(&mut slice);
            cur_pos = seg_end;
        }
        Ok(())
    }

    /// Allocates the t-value buffer and samples the compiled track into it.
    fn calc_signal_nsamps(&self, start_pos: usize, end_pos: usize, num_samps: usize) -> Result<Array1<f64>> {
        let samp_rate = self.samp_rate();
        let step = if num_samps == 0 {
            0.
        } else {
            (end_pos as f64 - start_pos as f64) / num_samps as f64
        };
        let mut buffer =
            Array1::from_shape_fn(num_samps, |k| (start_pos as f64 + k as f64 * step) / samp_rate);
        self.fill_signal_nsamps(start_pos, end_pos, num_samps, &mut buffer.view_mut())?;
        Ok(buffer)
    }
}

/// Compiled instruction list of one pulse line.
#[derive(Clone, Debug)]
pub struct Track {
    samp_rate: f64,
    fresh_compiled: bool,
    name: String,
    instr_list: BTreeSet<InstrBook>,
    instr_end: Vec<usize>,
    instr_val: Vec<Instruction>,
}

impl BaseTrack for Track {
    fn samp_rate(&self) -> f64 {
        self.samp_rate
    }
    fn is_fresh_compiled(&self) -> bool {
        self.fresh_compiled
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn instr_list(&self) -> &BTreeSet<InstrBook> {
        &self.instr_list
    }
    fn instr_end(&self) -> &Vec<usize> {
        &self.instr_end
    }
    fn instr_val(&self) -> &Vec<Instruction> {
        &self.instr_val
    }
    fn instr_list_(&mut self) -> &mut BTreeSet<InstrBook> {
        &mut self.instr_list
    }
    fn instr_end_(&mut self) -> &mut Vec<usize> {
        &mut self.instr_end
    }
    fn instr_val_(&mut self) -> &mut Vec<Instruction> {
        &mut self.instr_val
    }
    fn fresh_compiled_(&mut self) -> &mut bool {
        &mut self.fresh_compiled
    }
}

impl Track {
    pub fn new(name: &str, samp_rate: f64) -> Self {
        Self {
            samp_rate,
            fresh_compiled: true,
            name: name.to_string(),
            instr_list: BTreeSet::new(),
            instr_end: Vec::new(),
            instr_val: Vec::new(),
        }
    }

    /// Compiles up to `stop_time` seconds.
    ///
    /// When the last instruction falls back to zero exactly at the stop tick, one more tick is
    /// compiled so that the closing edge is part of the generated samples.
    pub fn compile_until(&mut self, stop_time: f64) -> Result<f64> {
        let stop_tick = time_to_pos(stop_time, self.samp_rate);
        let closes_at_stop = self
            .instr_list
            .last()
            .map_or(false, |last| !last.keep_val && last.end_pos == stop_tick);
        let stop_pos = if closes_at_stop { stop_tick + 1 } else { stop_tick };
        self.compile(stop_pos)?;
        Ok(self.compiled_stop_time())
    }

    /// Total number of samples of the compiled track.
    pub fn total_samps(&self) -> usize {
        self.compiled_stop_pos()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn track_with(instrs: &[(Instruction, f64, f64, bool)]) -> Track {
        let mut track = Track::new("line", 1e3);
        for (instr, t, dur, keep) in instrs {
            track.add_instr(instr.clone(), *t, *dur, *keep).unwrap();
        }
        track
    }

    #[test]
    fn pads_and_merges() {
        let mut track = track_with(&[
            (Instruction::new_const(1.), 0.002, 0.003, true),
            (Instruction::new_const(1.), 0.005, 0.001, false),
        ]);
        track.compile(10).unwrap();
        assert_eq!(track.instr_end(), &vec![2, 6, 10]);
        assert_eq!(track.instr_val()[0], Instruction::new_const(0.));
        assert_eq!(track.instr_val()[1], Instruction::new_const(1.));
        assert_eq!(track.instr_val()[2], Instruction::new_const(0.));
    }

    #[test]
    fn keep_val_pads_with_last_value() {
        let mut track = track_with(&[(Instruction::new_linramp(0., 0.5, 0., 0.004), 0., 0.004, true)]);
        track.compile(8).unwrap();
        assert_eq!(track.instr_end(), &vec![4, 8]);
        let signal = track.calc_signal_nsamps(0, 8, 8).unwrap();
        assert!((signal[2] - 0.25).abs() < 1e-12);
        assert!((signal[7] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn overlap_rejected() {
        let mut track = track_with(&[(Instruction::new_const(1.), 0.002, 0.003, false)]);
        let err = track.add_instr(Instruction::new_const(2.), 0.004, 0.002, false);
        assert!(matches!(err, Err(Error::InstrOverlap { .. })));
        let err = track.add_instr(Instruction::new_const(2.), 0.0, 0.003, false);
        assert!(matches!(err, Err(Error::InstrOverlap { .. })));
        // Touching intervals are fine
        assert!(track.add_instr(Instruction::new_const(2.), 0.005, 0.001, false).unwrap());
    }

    #[test]
    fn sub_tick_instruction_skipped() {
        let mut track = Track::new("line", 1e3);
        assert!(!track.add_instr(Instruction::new_const(1.), 0.001, 1e-5, false).unwrap());
        assert!(!track.is_edited());
    }

    #[test]
    fn compile_stop_before_last_instr() {
        let mut track = track_with(&[(Instruction::new_const(1.), 0., 0.005, false)]);
        assert!(matches!(track.compile(3), Err(Error::CompileStop { .. })));
    }

    #[test]
    fn extra_tick_for_closing_edge() {
        let mut track = track_with(&[(Instruction::new_const(1.), 0., 0.005, false)]);
        assert!((track.compile_until(0.005).unwrap() - 0.006).abs() < 1e-12);
        let mut track = track_with(&[(Instruction::new_const(1.), 0., 0.005, true)]);
        assert!((track.compile_until(0.005).unwrap() - 0.005).abs() < 1e-12);
    }

    #[test]
    fn signal_requires_compile() {
        let track = track_with(&[(Instruction::new_const(1.), 0., 0.005, false)]);
        assert!(matches!(track.calc_signal_nsamps(0, 5, 5), Err(Error::NotCompiled(_))));
    }

    #[test]
    fn partial_window() {
        let mut track = track_with(&[
            (Instruction::new_const(1.), 0., 0.004, false),
            (Instruction::new_const(3.), 0.006, 0.004, false),
        ]);
        track.compile(10).unwrap();
        let signal = track.calc_signal_nsamps(3, 7, 4).unwrap();
        assert_eq!(signal.to_vec(), vec![1., 0., 0., 3.]);
        assert!(matches!(
            track.calc_signal_nsamps(3, 11, 8),
            Err(Error::SignalInterval { .. })
        ));
    }
}
