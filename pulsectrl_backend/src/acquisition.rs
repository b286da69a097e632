//! Data acquisition tasks read during scans.
//!
//! An [`AcqSession`] opens a set of acquisitions and closes all of them when it goes out of scope,
//! also when a scan stops on an error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

pub trait Acquisition: Send {
    fn name(&self) -> &str;
    fn unit(&self) -> &str {
        "A"
    }
    fn open(&mut self) -> Result<()>;
    /// One buffer of `memory_size` raw samples.
    fn read(&mut self) -> Result<Vec<f64>>;
    fn close(&mut self);
}

enum Source {
    Random(StdRng),
    Fn(Box<dyn FnMut(usize) -> f64 + Send>),
}

/// Software acquisition producing uniform noise in `[0, 1)` or values from a closure of the
/// read count.
pub struct MockAcquisition {
    name: String,
    memory_size: usize,
    samp_rate: f64,
    source: Source,
    is_open: bool,
    reads: usize,
    closes: Arc<AtomicUsize>,
}

impl MockAcquisition {
    pub fn random(name: &str, memory_size: usize) -> Self {
        Self::with_source(name, memory_size, Source::Random(StdRng::from_entropy()))
    }

    pub fn seeded(name: &str, memory_size: usize, seed: u64) -> Self {
        Self::with_source(name, memory_size, Source::Random(StdRng::seed_from_u64(seed)))
    }

    pub fn from_fn(name: &str, memory_size: usize, f: impl FnMut(usize) -> f64 + Send + 'static) -> Self {
        Self::with_source(name, memory_size, Source::Fn(Box::new(f)))
    }

    fn with_source(name: &str, memory_size: usize, source: Source) -> Self {
        Self {
            name: name.to_string(),
            memory_size,
            samp_rate: 1e4,
            source,
            is_open: false,
            reads: 0,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_samp_rate(mut self, samp_rate: f64) -> Self {
        self.samp_rate = samp_rate;
        self
    }

    pub fn samp_rate(&self) -> f64 {
        self.samp_rate
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Counts how often the acquisition has been closed, readable after it was moved into a scan.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

impl Acquisition for MockAcquisition {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.memory_size == 0 {
            return Err(Error::Acquisition {
                name: self.name.clone(),
                reason: "memory size should be positive".to_string(),
            });
        }
        self.is_open = true;
        log::debug!("acquisition {} opened at {} S/s", self.name, self.samp_rate);
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<f64>> {
        if !self.is_open {
            return Err(Error::Acquisition {
                name: self.name.clone(),
                reason: "read before open".to_string(),
            });
        }
        let n = self.memory_size;
        let values = match &mut self.source {
            Source::Random(rng) => (0..n).map(|_| rng.gen::<f64>()).collect(),
            Source::Fn(f) => {
                let reads = self.reads;
                (0..n).map(|_| f(reads)).collect()
            }
        };
        self.reads += 1;
        Ok(values)
    }

    fn close(&mut self) {
        if self.is_open {
            self.is_open = false;
            self.closes.fetch_add(1, Ordering::SeqCst);
            log::debug!("acquisition {} closed", self.name);
        }
    }
}

/// Open acquisitions, closed on drop.
pub struct AcqSession<'a> {
    acqs: &'a mut [Box<dyn Acquisition>],
}

impl<'a> AcqSession<'a> {
    pub fn open(acqs: &'a mut [Box<dyn Acquisition>]) -> Result<Self> {
        for idx in 0..acqs.len() {
            if let Err(e) = acqs[idx].open() {
                acqs[..idx].iter_mut().for_each(|acq| acq.close());
                return Err(e);
            }
        }
        Ok(Self { acqs })
    }

    pub fn len(&self) -> usize {
        self.acqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acqs.is_empty()
    }

    pub fn read(&mut self, idx: usize) -> Result<Vec<f64>> {
        match self.acqs.get_mut(idx) {
            Some(acq) => acq.read(),
            None => Err(Error::Acquisition {
                name: format!("#{}", idx),
                reason: format!("only {} acquisition(s) in session", self.acqs.len()),
            }),
        }
    }
}

impl Drop for AcqSession<'_> {
    fn drop(&mut self) {
        self.acqs.iter_mut().for_each(|acq| acq.close());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_values_in_unit_interval() {
        let mut acq = MockAcquisition::seeded("art", 100, 7);
        acq.open().unwrap();
        let values = acq.read().unwrap();
        assert_eq!(values.len(), 100);
        assert!(values.iter().all(|v| (0. ..1.).contains(v)));
    }

    #[test]
    fn closure_sees_read_count() {
        let mut acq = MockAcquisition::from_fn("ramp", 3, |k| k as f64);
        acq.open().unwrap();
        assert_eq!(acq.read().unwrap(), vec![0., 0., 0.]);
        assert_eq!(acq.read().unwrap(), vec![1., 1., 1.]);
        assert_eq!(acq.reads(), 2);
    }

    #[test]
    fn read_requires_open() {
        let mut acq = MockAcquisition::random("art", 10);
        assert!(matches!(acq.read(), Err(Error::Acquisition { .. })));
    }

    #[test]
    fn session_closes_on_drop() {
        let a = MockAcquisition::random("a", 4);
        let b = MockAcquisition::random("b", 4);
        let (ca, cb) = (a.close_counter(), b.close_counter());
        let mut acqs: Vec<Box<dyn Acquisition>> = vec![Box::new(a), Box::new(b)];
        {
            let mut session = AcqSession::open(&mut acqs).unwrap();
            assert_eq!(session.read(1).unwrap().len(), 4);
            assert!(session.read(2).is_err());
        }
        assert_eq!(ca.load(Ordering::SeqCst), 1);
        assert_eq!(cb.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_open_closes_the_opened_ones() {
        let a = MockAcquisition::random("a", 4);
        let ca = a.close_counter();
        let mut acqs: Vec<Box<dyn Acquisition>> = vec![Box::new(a), Box::new(MockAcquisition::random("bad", 0))];
        assert!(AcqSession::open(&mut acqs).is_err());
        assert_eq!(ca.load(Ordering::SeqCst), 1);
    }
}
