//! Plain text run logbook, one file per sample and setup.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::Result;
use crate::parameter::Settable;
use crate::project::{DATE_FORMAT, TIME_FORMAT};

/// Appends run messages to `{dir}/{sample}{mkor4k}test.txt`.
///
/// Every message is also logged at `info` level.
#[derive(Clone, Debug)]
pub struct RunLogger {
    project_name: String,
    sample_name: String,
    tester: String,
    path: PathBuf,
}

impl RunLogger {
    /// Opens the logbook in `dir` and appends its header. `mkor4k` names the cryostat.
    pub fn new(sample_name: &str, mkor4k: &str, tester: &str, dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let project_name = format!("{}{}test", sample_name, mkor4k);
        let logger = Self {
            path: dir.join(format!("{}.txt", project_name)),
            project_name,
            sample_name: sample_name.to_string(),
            tester: tester.to_string(),
        };
        let now = Local::now();
        logger.append(&format!(
            "The logger of {} is created at {} {}\n Sample name: {}\n tester: {}\n",
            logger.project_name,
            now.format(TIME_FORMAT),
            now.format(DATE_FORMAT),
            logger.sample_name,
            logger.tester
        ))?;
        Ok(logger)
    }

    fn append(&self, msg: &str) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(msg.as_bytes())?;
        Ok(())
    }

    pub fn write(&self, msg: &str) -> Result<()> {
        log::info!("{}: {}", self.project_name, msg.trim_end());
        self.append(msg)
    }

    /// Writes [`snapshot_text`] of `params` under a time stamp. Nothing is written when no
    /// parameter is left to report. Returns the snapshot.
    pub fn write_snapshot(&self, params: &mut [Box<dyn Settable>], skip: &[&str]) -> Result<String> {
        let text = snapshot_text(params, skip);
        if !text.is_empty() {
            self.write(&format!("Snapshot at {}\n{}", Local::now().format(TIME_FORMAT), text))?;
        }
        Ok(text)
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Formats `value` with 4 significant digits, like C's `%.4g`.
pub fn format_sig4(value: f64) -> String {
    if value == 0. || !value.is_finite() {
        return value.to_string();
    }
    let exp = value.abs().log10().floor() as i32;
    if !(-4..4).contains(&exp) {
        let text = format!("{:.3e}", value);
        return match text.split_once('e') {
            Some((mantissa, exp)) => format!("{}e{}", trim_zeros(mantissa), exp),
            None => text,
        };
    }
    trim_zeros(&format!("{:.*}", (3 - exp) as usize, value)).to_string()
}

fn trim_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// One `name = value unit` line per parameter, leaving out the names in `skip`, parameters at 0
/// or at the DAC's zero word (-1 µV), and parameters that cannot be read.
pub fn snapshot_text(params: &mut [Box<dyn Settable>], skip: &[&str]) -> String {
    let mut text = String::new();
    for param in params.iter_mut().filter(|p| !skip.contains(&p.name())) {
        match param.get() {
            Ok(value) if value == 0. || value == -1e-6 => {}
            Ok(value) => {
                text += &format!("{} = {} {}\n", param.name(), format_sig4(value), param.unit());
            }
            Err(e) => log::debug!("{} left out of the snapshot: {}", param.name(), e),
        }
    }
    text
}
