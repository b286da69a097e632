//! Scan parameters: things that can be read and, for swept parameters, set.

use crate::error::{Error, Result};

pub trait Gettable: Send {
    fn name(&self) -> &str;
    fn label(&self) -> &str {
        self.name()
    }
    fn unit(&self) -> &str;
    fn get(&mut self) -> Result<f64>;
}

pub trait Settable: Gettable {
    fn set(&mut self, value: f64) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Limits {
    pub min: f64,
    pub max: f64,
}

impl Limits {
    pub fn check(&self, name: &str, value: f64) -> Result<()> {
        if value >= self.min && value <= self.max {
            Ok(())
        } else {
            Err(Error::OutOfRange {
                name: name.to_string(),
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

type Setter = Box<dyn FnMut(f64) -> Result<()> + Send>;
type Getter = Box<dyn FnMut() -> Result<f64> + Send>;

/// A parameter backed by closures.
///
/// Without a getter, reading returns the last value set.
///
/// ```
/// use pulsectrl_backend::parameter::*;
///
/// let mut v_sd = FnParameter::settable("v_sd", "V", |_| Ok(())).with_limits(-1., 1.);
/// v_sd.set(0.5).unwrap();
/// assert_eq!(v_sd.get().unwrap(), 0.5);
/// assert!(v_sd.set(2.).is_err());
/// ```
pub struct FnParameter {
    name: String,
    label: String,
    unit: String,
    limits: Option<Limits>,
    setter: Option<Setter>,
    getter: Option<Getter>,
    last: f64,
}

impl FnParameter {
    pub fn new(
        name: &str,
        unit: &str,
        setter: impl FnMut(f64) -> Result<()> + Send + 'static,
        getter: impl FnMut() -> Result<f64> + Send + 'static,
    ) -> Self {
        Self::settable(name, unit, setter).with_getter(getter)
    }

    pub fn settable(name: &str, unit: &str, setter: impl FnMut(f64) -> Result<()> + Send + 'static) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
            unit: unit.to_string(),
            limits: None,
            setter: Some(Box::new(setter)),
            getter: None,
            last: 0.,
        }
    }

    pub fn gettable(name: &str, unit: &str, getter: impl FnMut() -> Result<f64> + Send + 'static) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
            unit: unit.to_string(),
            limits: None,
            setter: None,
            getter: Some(Box::new(getter)),
            last: 0.,
        }
    }

    pub fn with_getter(mut self, getter: impl FnMut() -> Result<f64> + Send + 'static) -> Self {
        self.getter = Some(Box::new(getter));
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Some(Limits { min, max });
        self
    }

    pub fn with_initial(mut self, value: f64) -> Self {
        self.last = value;
        self
    }

    pub fn limits(&self) -> Option<Limits> {
        self.limits
    }
}

impl Gettable for FnParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn get(&mut self) -> Result<f64> {
        match self.getter.as_mut() {
            Some(getter) => getter(),
            None if self.setter.is_some() => Ok(self.last),
            None => Err(Error::NotGettable(self.name.clone())),
        }
    }
}

impl Settable for FnParameter {
    fn set(&mut self, value: f64) -> Result<()> {
        if let Some(limits) = &self.limits {
            limits.check(&self.name, value)?;
        }
        let setter = self.setter.as_mut().ok_or_else(|| Error::ScanSetup(format!(
            "parameter {} is not settable",
            self.name
        )))?;
        setter(value)?;
        self.last = value;
        Ok(())
    }
}

/// A plain memory cell.
#[derive(Clone, Debug)]
pub struct ManualParameter {
    name: String,
    unit: String,
    value: f64,
    limits: Option<Limits>,
}

impl ManualParameter {
    pub fn new(name: &str, unit: &str, initial: f64) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            value: initial,
            limits: None,
        }
    }

    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Some(Limits { min, max });
        self
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

impl Gettable for ManualParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn get(&mut self) -> Result<f64> {
        Ok(self.value)
    }
}

impl Settable for ManualParameter {
    fn set(&mut self, value: f64) -> Result<()> {
        if let Some(limits) = &self.limits {
            limits.check(&self.name, value)?;
        }
        self.value = value;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn fn_parameter_calls_setter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut p = FnParameter::new(
            "gate",
            "V",
            move |v| {
                sink.lock().unwrap().push(v);
                Ok(())
            },
            || Ok(0.25),
        )
        .with_label("plunger gate");
        p.set(0.1).unwrap();
        p.set(0.2).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0.1, 0.2]);
        // The getter wins over the cached value
        assert_eq!(p.get().unwrap(), 0.25);
        assert_eq!(p.label(), "plunger gate");
    }

    #[test]
    fn limits_reject_before_setter() {
        let mut p = FnParameter::settable("v", "V", |_| panic!("setter must not run")).with_limits(-1., 1.);
        assert!(matches!(p.set(1.5), Err(Error::OutOfRange { .. })));
        assert!(matches!(p.set(f64::NAN), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn read_only_parameter() {
        let mut p = FnParameter::gettable("I_sd", "A", || Ok(1e-9));
        assert_eq!(p.get().unwrap(), 1e-9);
        assert!(p.set(0.).is_err());
        let mut q = FnParameter {
            getter: None,
            ..FnParameter::gettable("x", "A", || Ok(0.))
        };
        assert!(matches!(q.get(), Err(Error::NotGettable(_))));
    }

    #[test]
    fn manual_parameter() {
        let mut p = ManualParameter::new("field", "T", 0.).with_limits(0., 2.);
        p.set(1.5).unwrap();
        assert_eq!(p.get().unwrap(), 1.5);
        assert!(p.set(-0.1).is_err());
        assert_eq!(p.value(), 1.5);
    }
}
