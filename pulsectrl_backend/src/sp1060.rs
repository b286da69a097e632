//! # LNHR DAC SP1060
//!
//! Text protocol of the 24-channel SP1060 DAC over any byte transport (`Read + Write`), and a
//! [`PulseDriver`] playing DC pulse lines on it.
//!
//! Voltages travel as 24-bit hexadecimal words, `word = (v + 10) * 838860.75`, covering -10 V to
//! +10 V. Every command is a `\r\n` terminated line. Set commands answer one return code per
//! `;`-separated part, queries answer one line.
//!
//! Besides direct voltage writes the device has four generator blocks `A` to `D`, each with a
//! ramp generator (`RMP-x`), a wave memory (`WAV-x`) and an arbitrary waveform generator
//! (`AWG-x`). The standard waveform generator (`SWG`) computes a waveform into a wave memory,
//! which is then copied into the AWG memory of the same block and played on one channel.
//!
//! [`SimulatedSp1060`] is an in-memory transport answering like the device.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use pulsecompiler_backend::{BaseTrack, PulseKind, PulseLine, Track};

use crate::driver::PulseDriver;
use crate::error::{Error, Result};
use crate::parameter::{Gettable, Settable};

pub const DAC_SCALE: f64 = 838860.75;
pub const CHANNEL_COUNT: usize = 24;
pub const MAX_WORD: u32 = 0xff_ffff;
pub const TERMINATOR: &str = "\r\n";
/// Points of one AWG memory.
pub const AWG_MEM_SIZE: usize = 34_000;
/// Points per memory block query.
pub const MEM_BLOCK: usize = 1000;

pub fn val_to_dacval(voltage: f64) -> String {
    format!("{:x}", ((voltage + 10.) * DAC_SCALE) as u32)
}

/// Voltage of a DAC word, rounded to the microvolt.
pub fn dacval_to_val(word: u32) -> f64 {
    ((word as f64 / DAC_SCALE - 10.) * 1e6).round() / 1e6
}

pub fn parse_dacval(hex: &str) -> Option<u32> {
    let hex = hex.trim();
    u32::from_str_radix(hex.strip_prefix("0x").unwrap_or(hex), 16).ok()
}

/// One of the four generator blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Generator {
    A,
    B,
    C,
    D,
}

impl Generator {
    pub const ALL: [Generator; 4] = [Generator::A, Generator::B, Generator::C, Generator::D];

    /// Generators A and B serve channels 1 to 12, C and D channels 13 to 24.
    pub fn for_channel(channel: usize) -> [Generator; 2] {
        if channel <= 12 {
            [Generator::A, Generator::B]
        } else {
            [Generator::C, Generator::D]
        }
    }

    pub fn serves(&self, channel: usize) -> bool {
        (1..=CHANNEL_COUNT).contains(&channel) && Self::for_channel(channel).contains(self)
    }

    /// Wave memory number used by the SWG.
    pub fn index(&self) -> usize {
        match self {
            Generator::A => 0,
            Generator::B => 1,
            Generator::C => 2,
            Generator::D => 3,
        }
    }

    /// The AWG pair sharing this generator's clock.
    pub fn group(&self) -> AwgGroup {
        match self {
            Generator::A | Generator::B => AwgGroup::AB,
            Generator::C | Generator::D => AwgGroup::CD,
        }
    }
}

impl fmt::Display for Generator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Generator::A => "A",
            Generator::B => "B",
            Generator::C => "C",
            Generator::D => "D",
        };
        write!(f, "{}", s)
    }
}

/// AWGs started and stopped together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AwgGroup {
    AB,
    CD,
    All,
}

impl fmt::Display for AwgGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            AwgGroup::AB => "AB",
            AwgGroup::CD => "CD",
            AwgGroup::All => "ALL",
        };
        write!(f, "{}", s)
    }
}

/// Shapes of the standard waveform generator, numbered as the device numbers them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwgShape {
    /// A cosine is a sine with 90° phase.
    Sine = 0,
    Triangle = 1,
    Sawtooth = 2,
    Ramp = 3,
    /// Uses the duty cycle.
    Pulse = 4,
    NoiseFixed = 5,
    NoiseRandom = 6,
    /// A fixed voltage.
    Dc = 7,
}

/// A standard waveform written into the wave memory `memory` and copied into its AWG, which
/// plays it on `channel`.
#[derive(Clone, Debug, PartialEq)]
pub struct SwgWaveform {
    pub shape: SwgShape,
    pub frequency: f64,
    pub amplitude: f64,
    pub offset: f64,
    /// Memory size in points, or the device's choice for `frequency` when `None`.
    pub points: Option<usize>,
    pub memory: Generator,
    pub channel: usize,
}

impl SwgWaveform {
    /// `points` samples at `voltage`, lasting `duration` seconds.
    pub fn dc(memory: Generator, channel: usize, voltage: f64, points: usize, duration: f64) -> Self {
        Self {
            shape: SwgShape::Dc,
            frequency: 1. / duration,
            amplitude: 0.,
            offset: voltage,
            points: Some(points),
            memory,
            channel,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bandwidth {
    Low,
    High,
}

impl Bandwidth {
    fn as_cmd(&self) -> &'static str {
        match self {
            Bandwidth::Low => "LBW",
            Bandwidth::High => "HBW",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Idn {
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

pub struct Sp1060<T> {
    transport: T,
    pending: Vec<u8>,
}

impl<T: Read + Write> Sp1060<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pending: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn send(&mut self, cmd: &str) -> Result<()> {
        log::trace!("SP1060 <- {}", cmd);
        self.transport.write_all(cmd.as_bytes())?;
        self.transport.write_all(TERMINATOR.as_bytes())?;
        self.transport.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        let mut buf = [0u8; 64];
        loop {
            if let Some(end) = self.pending.windows(2).position(|w| w == TERMINATOR.as_bytes()) {
                let line: Vec<u8> = self.pending.drain(..end + 2).take(end).collect();
                let line = String::from_utf8_lossy(&line).into_owned();
                log::trace!("SP1060 -> {}", line);
                return Ok(line);
            }
            let n = self.transport.read(&mut buf)?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "SP1060 closed the connection",
                )));
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    /// Sends a query and returns its one-line reply.
    pub fn ask(&mut self, cmd: &str) -> Result<String> {
        self.send(cmd)?;
        self.read_line()
    }

    /// Sends a set command and checks the return code of every `;`-separated part.
    pub fn write_cmd(&mut self, cmd: &str) -> Result<()> {
        self.send(cmd)?;
        let mut first_err = None;
        for _ in 0..cmd.matches(';').count() + 1 {
            let reply = self.read_line()?;
            let code: i64 = reply.trim().parse().map_err(|_| Error::Reply {
                command: cmd.to_string(),
                reply: reply.clone(),
            })?;
            if code != 0 && first_err.is_none() {
                first_err = Some(Error::Protocol {
                    code,
                    command: cmd.to_string(),
                });
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn check_channel(channel: usize, cmd: impl FnOnce() -> String) -> Result<()> {
        if (1..=CHANNEL_COUNT).contains(&channel) {
            Ok(())
        } else {
            Err(Error::Protocol { code: 1, command: cmd() })
        }
    }

    fn check_voltage(voltage: f64, cmd: impl FnOnce() -> String) -> Result<()> {
        if (-10. ..=10.).contains(&voltage) {
            Ok(())
        } else {
            Err(Error::Protocol { code: 3, command: cmd() })
        }
    }

    fn parse_word(cmd: &str, reply: &str) -> Result<f64> {
        parse_dacval(reply).map(dacval_to_val).ok_or_else(|| Error::Reply {
            command: cmd.to_string(),
            reply: reply.to_string(),
        })
    }

    fn ask_usize(&mut self, cmd: &str) -> Result<usize> {
        let reply = self.ask(cmd)?;
        reply.trim().parse().map_err(|_| Error::Reply {
            command: cmd.to_string(),
            reply,
        })
    }

    pub fn set_voltage(&mut self, channel: usize, voltage: f64) -> Result<()> {
        let cmd = || format!("{} {}", channel, val_to_dacval(voltage));
        Self::check_channel(channel, cmd)?;
        Self::check_voltage(voltage, cmd)?;
        self.write_cmd(&cmd())
    }

    pub fn get_voltage(&mut self, channel: usize) -> Result<f64> {
        let cmd = format!("{} V?", channel);
        Self::check_channel(channel, || cmd.clone())?;
        let reply = self.ask(&cmd)?;
        Self::parse_word(&cmd, &reply)
    }

    pub fn set_all(&mut self, voltage: f64) -> Result<()> {
        let cmd = format!("ALL {}", val_to_dacval(voltage));
        Self::check_voltage(voltage, || cmd.clone())?;
        self.write_cmd(&cmd)
    }

    pub fn get_all(&mut self) -> Result<Vec<f64>> {
        let cmd = "ALL V?";
        let reply = self.ask(cmd)?;
        reply
            .trim()
            .split(';')
            .map(|word| Self::parse_word(cmd, word))
            .collect()
    }

    pub fn set_output(&mut self, channel: usize, on: bool) -> Result<()> {
        let cmd = format!("{} {}", channel, if on { "ON" } else { "OFF" });
        Self::check_channel(channel, || cmd.clone())?;
        self.write_cmd(&cmd)
    }

    pub fn output(&mut self, channel: usize) -> Result<bool> {
        let cmd = format!("{} S?", channel);
        Self::check_channel(channel, || cmd.clone())?;
        let reply = self.ask(&cmd)?;
        match reply.trim() {
            s if s.starts_with('1') || s.eq_ignore_ascii_case("on") => Ok(true),
            s if s.starts_with('0') || s.eq_ignore_ascii_case("off") => Ok(false),
            _ => Err(Error::Reply { command: cmd, reply }),
        }
    }

    pub fn set_bandwidth(&mut self, channel: usize, bandwidth: Bandwidth) -> Result<()> {
        let cmd = format!("{} {}", channel, bandwidth.as_cmd());
        Self::check_channel(channel, || cmd.clone())?;
        self.write_cmd(&cmd)
    }

    /// Configures ramp generator `generator` to ramp `channel` from `start` to `stop` volts in
    /// `time` seconds.
    pub fn ramp_config(&mut self, generator: Generator, channel: usize, start: f64, stop: f64, time: f64) -> Result<()> {
        Self::check_channel(channel, || format!("C RMP-{} CH {}", generator, channel))?;
        self.write_cmd(&format!("C RMP-{} CH {}", generator, channel))?;
        self.write_cmd(&format!("C RMP-{} STAV {}", generator, start))?;
        self.write_cmd(&format!("C RMP-{} STOV {}", generator, stop))?;
        self.write_cmd(&format!("C RMP-{} RT {}", generator, time))
    }

    pub fn ramp_start(&mut self, generator: Generator) -> Result<()> {
        self.write_cmd(&format!("C RMP-{} START", generator))
    }

    pub fn ramp_stop(&mut self, generator: Generator) -> Result<()> {
        self.write_cmd(&format!("C RMP-{} STOP", generator))
    }

    pub fn ramp_state(&mut self, generator: Generator) -> Result<String> {
        self.ask(&format!("C RMP-{} S?", generator))
    }

    /// Computes `wave` with the SWG and loads it into the AWG of its memory, without starting it.
    pub fn set_new_waveform(&mut self, wave: &SwgWaveform) -> Result<()> {
        let g = wave.memory;
        if !g.serves(wave.channel) {
            return Err(Error::Protocol {
                code: 1,
                command: format!("C AWG-{} CH {}", g, wave.channel),
            });
        }
        let mut cmds = vec![
            format!("C WAV-{} CLR", g),
            "C SWG MODE 0".to_string(),
            format!("C SWG WF {}", wave.shape as u8),
            format!("C SWG DF {}", wave.frequency),
            format!("C SWG AMP {}", wave.amplitude),
            format!("C SWG DCV {}", wave.offset),
        ];
        if let Some(points) = wave.points {
            cmds.push(format!("C SWG MS {}", points));
        }
        cmds.extend([
            format!("C SWG WMEM {}", g.index()),
            "C SWG WFUN 0".to_string(),
            format!("C SWG LIN {}", wave.channel),
            format!("C AWG-{} CH {}", g, wave.channel),
            "C SWG APPLY".to_string(),
            format!("C WAV-{} SAVE", g),
            format!("C WAV-{} WRITE", g),
        ]);
        for cmd in &cmds {
            self.write_cmd(cmd)?;
        }
        Ok(())
    }

    pub fn wav_clear(&mut self, memory: Generator) -> Result<()> {
        self.write_cmd(&format!("C WAV-{} CLR", memory))
    }

    pub fn wav_mem_size(&mut self, memory: Generator) -> Result<usize> {
        self.ask_usize(&format!("C WAV-{} MS?", memory))
    }

    /// Copies wave memory `memory` into the AWG memory of the same block.
    pub fn wav_write_to_awg(&mut self, memory: Generator) -> Result<()> {
        self.write_cmd(&format!("C WAV-{} WRITE", memory))
    }

    pub fn awg_set_channel(&mut self, awg: Generator, channel: usize) -> Result<()> {
        let cmd = format!("C AWG-{} CH {}", awg, channel);
        if !awg.serves(channel) {
            return Err(Error::Protocol { code: 1, command: cmd });
        }
        self.write_cmd(&cmd)
    }

    /// Cycles played per start, 0 for endless.
    pub fn awg_set_cycles(&mut self, awg: Generator, cycles: usize) -> Result<()> {
        self.write_cmd(&format!("C AWG-{} CS {}", awg, cycles))
    }

    pub fn awg_cycles_done(&mut self, awg: Generator) -> Result<usize> {
        self.ask_usize(&format!("C AWG-{} CD?", awg))
    }

    pub fn awg_mem_size(&mut self, awg: Generator) -> Result<usize> {
        self.ask_usize(&format!("C AWG-{} MS?", awg))
    }

    /// Sample clock period of an AWG pair, in microseconds.
    pub fn awg_set_clock_period(&mut self, group: AwgGroup, period_us: f64) -> Result<()> {
        let cmd = format!("C AWG-{} CP {}", group, period_us);
        if group == AwgGroup::All {
            return Err(Error::Protocol { code: 4, command: cmd });
        }
        self.write_cmd(&cmd)
    }

    pub fn awg_running(&mut self, awg: Generator) -> Result<bool> {
        let cmd = format!("C AWG-{} S?", awg);
        let reply = self.ask(&cmd)?;
        match reply.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            _ => Err(Error::Reply { command: cmd, reply }),
        }
    }

    pub fn awg_start(&mut self, awg: Generator) -> Result<()> {
        self.write_cmd(&format!("C AWG-{} START", awg))
    }

    pub fn awg_stop(&mut self, awg: Generator) -> Result<()> {
        self.write_cmd(&format!("C AWG-{} STOP", awg))
    }

    pub fn awg_group_start(&mut self, group: AwgGroup) -> Result<()> {
        self.write_cmd(&format!("C AWG-{} START", group))
    }

    pub fn awg_group_stop(&mut self, group: AwgGroup) -> Result<()> {
        self.write_cmd(&format!("C AWG-{} STOP", group))
    }

    /// Up to [`MEM_BLOCK`] voltages of AWG memory `awg`, from point `block_start` on.
    pub fn query_block_awg_mem(&mut self, awg: Generator, block_start: usize) -> Result<Vec<f64>> {
        let cmd = format!("AWG-{} {:x} BLK?", awg, block_start);
        let reply = self.ask(&cmd)?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Ok(Vec::new());
        }
        reply.split(';').map(|word| Self::parse_word(&cmd, word)).collect()
    }

    /// Up to [`MEM_BLOCK`] voltages of wave memory `memory`, from point `block_start` on.
    pub fn query_block_wav_mem(&mut self, memory: Generator, block_start: usize) -> Result<Vec<f64>> {
        let cmd = format!("WAV-{} {:x} BLK?", memory, block_start);
        let reply = self.ask(&cmd)?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Ok(Vec::new());
        }
        reply
            .split(';')
            .map(|val| {
                val.trim().parse().map_err(|_| Error::Reply {
                    command: cmd.clone(),
                    reply: reply.to_string(),
                })
            })
            .collect()
    }

    /// The whole AWG memory, block by block.
    pub fn query_full_awg_mem(&mut self, awg: Generator) -> Result<Vec<f64>> {
        let size = self.awg_mem_size(awg)?;
        let mut values = Vec::with_capacity(size);
        for block_start in (0..size).step_by(MEM_BLOCK) {
            values.extend(self.query_block_awg_mem(awg, block_start)?);
        }
        values.truncate(size);
        Ok(values)
    }

    pub fn health(&mut self) -> Result<String> {
        self.ask("HEALTH?")
    }

    pub fn ip(&mut self) -> Result<String> {
        self.ask("IP?")
    }

    pub fn serial(&mut self) -> Result<String> {
        let reply = self.ask("HARD?")?;
        Ok(reply.trim().get(3..).unwrap_or("").to_string())
    }

    pub fn firmware(&mut self) -> Result<String> {
        let reply = self.ask("SOFT?")?;
        let reply = reply.trim();
        let from = reply.char_indices().rev().nth(4).map_or(0, |(idx, _)| idx);
        Ok(reply[from..].to_string())
    }

    pub fn idn(&mut self) -> Result<Idn> {
        Ok(Idn {
            vendor: "BasPI".to_string(),
            model: "LNHR DAC SP1060".to_string(),
            serial: self.serial()?,
            firmware: self.firmware()?,
        })
    }
}

/// One step of an SP1060 play plan.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DacAction {
    Set {
        channel: usize,
        voltage: f64,
    },
    Ramp {
        generator: Generator,
        channel: usize,
        start: f64,
        stop: f64,
        duration: f64,
    },
    /// Plays the uploaded AWG memory once.
    AwgStart { generator: Generator, channel: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TimedCommand {
    /// Seconds from the start of the run.
    pub at: f64,
    pub line: String,
    pub action: DacAction,
}

/// A constant AWG waveform loaded before the plan is played.
#[derive(Clone, Debug, PartialEq)]
pub struct AwgUpload {
    pub generator: Generator,
    pub channel: usize,
    pub voltage: f64,
    pub points: usize,
    pub clock_period_us: f64,
}

impl AwgUpload {
    fn waveform(&self) -> SwgWaveform {
        let duration = self.points as f64 * self.clock_period_us * 1e-6;
        SwgWaveform::dc(self.generator, self.channel, self.voltage, self.points, duration)
    }
}

/// Plays DC pulse lines as timed set-voltage, ramp-generator and AWG commands.
///
/// DC levels are set directly and ramps run on a ramp generator. AWG pulses are loaded into AWG
/// memory, clocked at the line's sample rate, before the run and started at their time;
/// identical pulses on one channel share a memory. Generators are handed out per channel half,
/// a ramp generator for the time its ramp runs and an AWG for the whole run.
///
/// Pulses that do not hold their value fall back to 0 V when they end, and every line ends at
/// 0 V. A run consumes the plan.
pub struct Sp1060Driver<T> {
    name: String,
    dac: Arc<Mutex<Sp1060<T>>>,
    plan: Vec<TimedCommand>,
    uploads: Vec<AwgUpload>,
    // (generator, from, until)
    ramps: Vec<(Generator, f64, f64)>,
    realtime: bool,
}

impl<T: Read + Write + Send> Sp1060Driver<T> {
    pub fn new(name: &str, dac: Sp1060<T>) -> Self {
        Self::shared(name, Arc::new(Mutex::new(dac)))
    }

    pub fn shared(name: &str, dac: Arc<Mutex<Sp1060<T>>>) -> Self {
        Self {
            name: name.to_string(),
            dac,
            plan: Vec::new(),
            uploads: Vec::new(),
            ramps: Vec::new(),
            realtime: true,
        }
    }

    /// When off, `run` sends the plan back to back instead of waiting for each command's time.
    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn dac(&self) -> Arc<Mutex<Sp1060<T>>> {
        self.dac.clone()
    }

    pub fn plan(&self) -> &[TimedCommand] {
        &self.plan
    }

    pub fn uploads(&self) -> &[AwgUpload] {
        &self.uploads
    }

    pub fn clear_plan(&mut self) {
        self.plan.clear();
        self.uploads.clear();
        self.ramps.clear();
    }

    fn plan_line(
        line: &PulseLine,
        samp_rate: f64,
        uploads: &mut Vec<AwgUpload>,
        ramps: &mut Vec<(Generator, f64, f64)>,
    ) -> Result<Vec<TimedCommand>> {
        let channel = line.sender().channel_num();
        let mut plan = Vec::new();
        let mut push = |at: f64, action: DacAction| {
            plan.push(TimedCommand {
                at,
                line: line.name().to_string(),
                action,
            })
        };
        for scheduled in line.time_line() {
            let pulse = &scheduled.pulse;
            match *pulse.kind() {
                PulseKind::DcFixed { amplitude } => {
                    push(scheduled.t_start, DacAction::Set { channel, voltage: amplitude });
                }
                PulseKind::Dc { amplitude } => {
                    let points = ((scheduled.duration() * samp_rate).round() as usize).max(1);
                    if points > AWG_MEM_SIZE {
                        return Err(Error::AwgMemory {
                            pulse: pulse.name().to_string(),
                            points,
                            max: AWG_MEM_SIZE,
                        });
                    }
                    let loaded = uploads
                        .iter()
                        .find(|up| up.channel == channel && up.voltage == amplitude && up.points == points)
                        .map(|up| up.generator);
                    let generator = match loaded {
                        Some(generator) => generator,
                        None => {
                            let generator = Generator::for_channel(channel)
                                .into_iter()
                                .find(|g| uploads.iter().all(|up| up.generator != *g))
                                .ok_or(Error::NoGenerator {
                                    kind: "AWG",
                                    channel,
                                    at: scheduled.t_start,
                                })?;
                            uploads.push(AwgUpload {
                                generator,
                                channel,
                                voltage: amplitude,
                                points,
                                clock_period_us: 1e6 / samp_rate,
                            });
                            generator
                        }
                    };
                    push(scheduled.t_start, DacAction::AwgStart { generator, channel });
                    push(scheduled.t_stop, DacAction::Set { channel, voltage: 0. });
                }
                PulseKind::DcRamp {
                    amplitude_start,
                    amplitude_stop,
                    ..
                } => {
                    let (from, until) = (scheduled.t_start, scheduled.t_stop);
                    let generator = Generator::for_channel(channel)
                        .into_iter()
                        .find(|g| {
                            !ramps
                                .iter()
                                .any(|(busy, start, stop)| busy == g && *start < until && from < *stop)
                        })
                        .ok_or(Error::NoGenerator {
                            kind: "ramp",
                            channel,
                            at: from,
                        })?;
                    ramps.push((generator, from, until));
                    push(
                        from,
                        DacAction::Ramp {
                            generator,
                            channel,
                            start: amplitude_start,
                            stop: amplitude_stop,
                            duration: scheduled.duration(),
                        },
                    );
                }
                ref kind => {
                    return Err(pulsecompiler_backend::Error::InvalidPulse {
                        pulse: pulse.name().to_string(),
                        reason: format!("{} pulses cannot be played by an SP1060", kind.label()),
                    }
                    .into())
                }
            }
        }
        let ends_at_zero = matches!(
            plan.last(),
            Some(TimedCommand { at, action: DacAction::Set { voltage, .. }, .. })
                if *voltage == 0. && *at >= line.stop()
        );
        if !plan.is_empty() && !ends_at_zero {
            plan.push(TimedCommand {
                at: line.stop(),
                line: line.name().to_string(),
                action: DacAction::Set { channel, voltage: 0. },
            });
        }
        Ok(plan)
    }

    fn upload(dac: &mut Sp1060<T>, upload: &AwgUpload) -> Result<()> {
        dac.set_new_waveform(&upload.waveform())?;
        dac.awg_set_cycles(upload.generator, 1)?;
        dac.awg_set_clock_period(upload.generator.group(), upload.clock_period_us)
    }

    fn execute(&self, action: &DacAction) -> Result<()> {
        let mut dac = self.dac.lock();
        match *action {
            DacAction::Set { channel, voltage } => dac.set_voltage(channel, voltage),
            DacAction::Ramp {
                generator,
                channel,
                start,
                stop,
                duration,
            } => {
                dac.ramp_config(generator, channel, start, stop, duration)?;
                dac.ramp_start(generator)
            }
            DacAction::AwgStart { generator, .. } => dac.awg_start(generator),
        }
    }
}

impl<T: Read + Write + Send> PulseDriver for Sp1060Driver<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_line(&mut self, line: &PulseLine, track: &Track) -> Result<()> {
        let mut uploads = self.uploads.clone();
        let mut ramps = self.ramps.clone();
        let plan = Self::plan_line(line, track.samp_rate(), &mut uploads, &mut ramps)?;
        log::debug!(
            "{}: line {} planned as {} command(s), {} AWG upload(s) in total",
            self.name,
            line.name(),
            plan.len(),
            uploads.len()
        );
        self.uploads = uploads;
        self.ramps = ramps;
        self.plan.extend(plan);
        self.plan.sort_by(|a, b| a.at.total_cmp(&b.at));
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let plan = std::mem::take(&mut self.plan);
        let uploads = std::mem::take(&mut self.uploads);
        self.ramps.clear();
        {
            let mut dac = self.dac.lock();
            for upload in &uploads {
                Self::upload(&mut dac, upload)?;
            }
        }
        let start = Instant::now();
        for cmd in &plan {
            if self.realtime {
                let wait = cmd.at - start.elapsed().as_secs_f64();
                if wait > 0. {
                    thread::sleep(Duration::from_secs_f64(wait));
                }
            }
            self.execute(&cmd.action)?;
        }
        log::info!(
            "{}: played {} command(s) after {} AWG upload(s) in {:.3} s",
            self.name,
            plan.len(),
            uploads.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

/// One DAC channel as a scan parameter, in volts.
pub struct Sp1060Channel<T> {
    name: String,
    channel: usize,
    dac: Arc<Mutex<Sp1060<T>>>,
}

impl<T> Sp1060Channel<T> {
    pub fn new(dac: Arc<Mutex<Sp1060<T>>>, channel: usize) -> Self {
        Self {
            name: format!("ch{}", channel),
            channel,
            dac,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

impl<T: Read + Write + Send> Gettable for Sp1060Channel<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        "V"
    }

    fn get(&mut self) -> Result<f64> {
        self.dac.lock().get_voltage(self.channel)
    }
}

impl<T: Read + Write + Send> Settable for Sp1060Channel<T> {
    fn set(&mut self, value: f64) -> Result<()> {
        self.dac.lock().set_voltage(self.channel, value)
    }
}

#[derive(Clone, Debug, Default)]
struct SimAwg {
    wav: Vec<f64>,
    mem: Vec<f64>,
    channel: usize,
    cycles: usize,
    cycles_done: usize,
}

#[derive(Debug)]
struct SimState {
    words: [u32; CHANNEL_COUNT],
    outputs: [bool; CHANNEL_COUNT],
    ramps: [(usize, f64); 4],
    awgs: [SimAwg; 4],
    clock_periods: [f64; 2],
    swg: HashMap<String, String>,
    remote_write: bool,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    log: Vec<String>,
}

/// In-memory SP1060. Clones share one device, so a clone kept outside a driver can inspect what
/// the driver did. Ramps and AWG runs complete as soon as they are started. The SWG computes
/// sine, triangle, sawtooth, ramp, pulse and DC shapes; noise shapes are stored as their offset.
#[derive(Clone, Debug)]
pub struct SimulatedSp1060 {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedSp1060 {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSp1060 {
    pub fn new() -> Self {
        let zero = (10. * DAC_SCALE) as u32;
        Self {
            state: Arc::new(Mutex::new(SimState {
                words: [zero; CHANNEL_COUNT],
                outputs: [false; CHANNEL_COUNT],
                ramps: [(0, 0.); 4],
                awgs: Default::default(),
                clock_periods: [10.; 2],
                swg: HashMap::new(),
                remote_write: true,
                inbox: Vec::new(),
                outbox: VecDeque::new(),
                log: Vec::new(),
            })),
        }
    }

    /// Received commands, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn voltage(&self, channel: usize) -> f64 {
        dacval_to_val(self.state.lock().words[channel - 1])
    }

    /// Contents of the AWG memory of block `awg`.
    pub fn awg_memory(&self, awg: Generator) -> Vec<f64> {
        self.state.lock().awgs[awg.index()].mem.clone()
    }

    pub fn set_remote_write(&self, allowed: bool) {
        self.state.lock().remote_write = allowed;
    }
}

impl SimState {
    fn channel(token: &str) -> Option<usize> {
        token.parse().ok().filter(|ch| (1..=CHANNEL_COUNT).contains(ch))
    }

    fn block(letter: &str) -> Option<usize> {
        match letter {
            "A" => Some(0),
            "B" => Some(1),
            "C" => Some(2),
            "D" => Some(3),
            _ => None,
        }
    }

    fn write_word(&mut self, hex: &str) -> std::result::Result<u32, &'static str> {
        if !self.remote_write {
            return Err("5");
        }
        match parse_dacval(hex) {
            Some(word) if word <= MAX_WORD => Ok(word),
            Some(_) => Err("3"),
            None => Err("4"),
        }
    }

    fn apply_voltage(&mut self, channel: usize, voltage: f64) -> String {
        match self.write_word(&val_to_dacval(voltage)) {
            Ok(word) => {
                self.words[channel - 1] = word;
                "0".to_string()
            }
            Err(code) => code.to_string(),
        }
    }

    fn handle(&mut self, part: &str) -> String {
        let tokens: Vec<&str> = part.split_whitespace().collect();
        match tokens.as_slice() {
            ["HEALTH?"] => "OK".to_string(),
            ["IP?"] => "192.168.0.5".to_string(),
            ["HARD?"] => "SN:1060-0001".to_string(),
            ["SOFT?"] => "Firmware 3.4.9".to_string(),
            ["ALL", "V?"] => self
                .words
                .iter()
                .map(|w| format!("{:x}", w))
                .collect::<Vec<_>>()
                .join(";"),
            ["ALL", hex] => match self.write_word(hex) {
                Ok(word) => {
                    self.words = [word; CHANNEL_COUNT];
                    "0".to_string()
                }
                Err(code) => code.to_string(),
            },
            ["C", "SWG", "APPLY"] => self.swg_apply(),
            ["C", "SWG", query] if query.ends_with('?') => self
                .swg
                .get(query.trim_end_matches('?'))
                .cloned()
                .unwrap_or_else(|| "0".to_string()),
            ["C", "SWG", key, value] => {
                self.swg.insert(key.to_string(), value.to_string());
                "0".to_string()
            }
            ["C", unit, rest @ ..] => match unit.split_once('-') {
                Some(("RMP", letter)) => match Self::block(letter) {
                    Some(g) => self.ramp_cmd(g, rest),
                    None => "4".to_string(),
                },
                Some(("AWG", letter)) => match Self::block(letter) {
                    Some(g) => self.awg_cmd(g, rest),
                    None => self.awg_group_cmd(letter, rest),
                },
                Some(("WAV", letter)) => match Self::block(letter) {
                    Some(g) => self.wav_cmd(g, rest),
                    None => "4".to_string(),
                },
                _ => "4".to_string(),
            },
            [mem, start, "BLK?"] => self.block_query(mem, start),
            [ch, cmd] => match Self::channel(ch) {
                None => "1".to_string(),
                Some(ch) => match *cmd {
                    "V?" => format!("{:x}", self.words[ch - 1]),
                    "S?" => (if self.outputs[ch - 1] { "1" } else { "0" }).to_string(),
                    "ON" | "OFF" => {
                        self.outputs[ch - 1] = *cmd == "ON";
                        "0".to_string()
                    }
                    "LBW" | "HBW" => "0".to_string(),
                    hex => match self.write_word(hex) {
                        Ok(word) => {
                            self.words[ch - 1] = word;
                            "0".to_string()
                        }
                        Err(code) => code.to_string(),
                    },
                },
            },
            _ => "4".to_string(),
        }
    }

    fn ramp_cmd(&mut self, g: usize, rest: &[&str]) -> String {
        match rest {
            ["CH", ch] => match Self::channel(ch) {
                Some(ch) => {
                    self.ramps[g].0 = ch;
                    "0".to_string()
                }
                None => "1".to_string(),
            },
            ["STOV", v] => match v.parse::<f64>() {
                Ok(v) => {
                    self.ramps[g].1 = v;
                    "0".to_string()
                }
                Err(_) => "4".to_string(),
            },
            ["STAV", _] | ["RT", _] | ["STOP"] => "0".to_string(),
            ["START"] => {
                let (ch, stop) = self.ramps[g];
                if ch == 0 {
                    "2".to_string()
                } else {
                    self.apply_voltage(ch, stop)
                }
            }
            ["S?"] => "0".to_string(),
            _ => "4".to_string(),
        }
    }

    fn awg_play(&mut self, g: usize) -> String {
        let awg = &self.awgs[g];
        match (awg.channel, awg.mem.last().copied()) {
            (0, _) | (_, None) => "2".to_string(),
            (ch, Some(last)) => {
                let cycles = awg.cycles.max(1);
                let code = self.apply_voltage(ch, last);
                if code == "0" {
                    self.awgs[g].cycles_done += cycles;
                }
                code
            }
        }
    }

    fn awg_cmd(&mut self, g: usize, rest: &[&str]) -> String {
        match rest {
            ["CH", ch] => match Self::channel(ch) {
                Some(ch) if Generator::ALL[g].serves(ch) => {
                    self.awgs[g].channel = ch;
                    "0".to_string()
                }
                _ => "1".to_string(),
            },
            ["CH?"] => self.awgs[g].channel.to_string(),
            ["CS", n] => match n.parse() {
                Ok(n) => {
                    self.awgs[g].cycles = n;
                    "0".to_string()
                }
                Err(_) => "4".to_string(),
            },
            ["CS?"] => self.awgs[g].cycles.to_string(),
            ["CD?"] => self.awgs[g].cycles_done.to_string(),
            ["MS?"] => self.awgs[g].mem.len().to_string(),
            ["S?"] => "0".to_string(),
            ["START"] => self.awg_play(g),
            ["STOP"] => "0".to_string(),
            _ => "4".to_string(),
        }
    }

    fn awg_group_cmd(&mut self, group: &str, rest: &[&str]) -> String {
        let (blocks, pair): (&[usize], Option<usize>) = match group {
            "AB" => (&[0, 1], Some(0)),
            "CD" => (&[2, 3], Some(1)),
            "ALL" => (&[0, 1, 2, 3], None),
            _ => return "4".to_string(),
        };
        match (rest, pair) {
            (["START"], _) => {
                for &g in blocks {
                    if self.awgs[g].channel != 0 && !self.awgs[g].mem.is_empty() {
                        let code = self.awg_play(g);
                        if code != "0" {
                            return code;
                        }
                    }
                }
                "0".to_string()
            }
            (["STOP"], _) => "0".to_string(),
            (["CP", period], Some(pair)) => match period.parse() {
                Ok(period) => {
                    self.clock_periods[pair] = period;
                    "0".to_string()
                }
                Err(_) => "4".to_string(),
            },
            (["CP?"], Some(pair)) => self.clock_periods[pair].to_string(),
            _ => "4".to_string(),
        }
    }

    fn wav_cmd(&mut self, g: usize, rest: &[&str]) -> String {
        match rest {
            ["CLR"] => {
                self.awgs[g].wav.clear();
                "0".to_string()
            }
            ["MS?"] => self.awgs[g].wav.len().to_string(),
            ["WRITE"] => {
                self.awgs[g].mem = self.awgs[g].wav.clone();
                "0".to_string()
            }
            ["SAVE"] | ["BUSY?"] | ["LINCH?"] => "0".to_string(),
            _ => "4".to_string(),
        }
    }

    fn swg_value<V: std::str::FromStr>(&self, key: &str, default: V) -> V {
        self.swg.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    fn swg_apply(&mut self) -> String {
        let shape: u8 = self.swg_value("WF", 0);
        let amplitude: f64 = self.swg_value("AMP", 0.);
        let offset: f64 = self.swg_value("DCV", 0.);
        let phase: f64 = self.swg_value("PHA", 0.);
        let duty: f64 = self.swg_value("DUC", 50.);
        let points: usize = self.swg_value("MS", 0);
        let memory: usize = self.swg_value("WMEM", 0);
        let function: u8 = self.swg_value("WFUN", 0);
        if points == 0 {
            return "2".to_string();
        }
        if memory > 3 {
            return "4".to_string();
        }
        let wave: Vec<f64> = (0..points)
            .map(|k| {
                let x = k as f64 / points as f64 + phase / 360.;
                let frac = x - x.floor();
                match shape {
                    0 => offset + amplitude * (2. * PI * x).sin(),
                    1 => offset + amplitude * (1. - 4. * (frac - 0.5).abs()),
                    2 => offset + amplitude * (2. * frac - 1.),
                    3 => offset + amplitude * frac,
                    4 if frac * 100. < duty => offset + amplitude,
                    _ => offset,
                }
            })
            .collect();
        let wav = &mut self.awgs[memory].wav;
        match function {
            0 => *wav = wave,
            1 => {
                wav.splice(0..0, wave);
            }
            2 => wav.extend(wave),
            _ => return "4".to_string(),
        }
        "0".to_string()
    }

    fn block_query(&self, mem: &str, start: &str) -> String {
        let start = match usize::from_str_radix(start, 16) {
            Ok(start) => start,
            Err(_) => return "4".to_string(),
        };
        let (values, awg) = match mem.split_once('-') {
            Some((kind @ ("AWG" | "WAV"), letter)) => match Self::block(letter) {
                Some(g) if kind == "AWG" => (&self.awgs[g].mem, true),
                Some(g) => (&self.awgs[g].wav, false),
                None => return "4".to_string(),
            },
            _ => return "4".to_string(),
        };
        values
            .iter()
            .skip(start)
            .take(MEM_BLOCK)
            .map(|v| if awg { val_to_dacval(*v) } else { v.to_string() })
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl Write for SimulatedSp1060 {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.inbox.extend_from_slice(buf);
        while let Some(end) = state.inbox.windows(2).position(|w| w == TERMINATOR.as_bytes()) {
            let line: Vec<u8> = state.inbox.drain(..end + 2).take(end).collect();
            let line = String::from_utf8_lossy(&line).into_owned();
            state.log.push(line.clone());
            // Block queries are answered as one line
            let parts: Vec<&str> = if line.ends_with("BLK?") {
                vec![line.as_str()]
            } else {
                line.split(';').collect()
            };
            for part in parts {
                let reply = state.handle(part);
                state.outbox.extend(reply.bytes().chain(TERMINATOR.bytes()));
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimulatedSp1060 {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let n = buf.len().min(state.outbox.len());
        for (dst, src) in buf.iter_mut().zip(state.outbox.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indexmap::IndexMap;
    use pulsecompiler_backend::{
        ChannelSpec, ConnectionInfo, InstrumentInterface, InterfaceKind, Layout, Pulse, PulseElement,
    };

    fn dac() -> (SimulatedSp1060, Sp1060<SimulatedSp1060>) {
        let sim = SimulatedSp1060::new();
        (sim.clone(), Sp1060::new(sim))
    }

    #[test]
    fn words() {
        assert_eq!(val_to_dacval(0.), "7fffff");
        assert_eq!(val_to_dacval(1.), "8ccccc");
        assert_eq!(val_to_dacval(10.), "ffffff");
        assert_eq!(val_to_dacval(-10.), "0");
        assert_eq!(dacval_to_val(0x8ccccc), 1.0);
        assert_eq!(dacval_to_val(0x7fffff), -1e-6);
        assert_eq!(parse_dacval("0x7d70a3"), Some(0x7d70a3));
        assert_eq!(parse_dacval("zz"), None);
    }

    #[test]
    fn generators() {
        assert_eq!(Generator::for_channel(12), [Generator::A, Generator::B]);
        assert_eq!(Generator::for_channel(13), [Generator::C, Generator::D]);
        assert!(Generator::D.serves(24));
        assert!(!Generator::B.serves(13));
        assert!(!Generator::A.serves(0));
        assert_eq!(Generator::C.group(), AwgGroup::CD);
        assert_eq!(Generator::C.to_string(), "C");
        assert_eq!(AwgGroup::All.to_string(), "ALL");
    }

    #[test]
    fn set_and_get() {
        let (sim, mut dac) = dac();
        dac.set_voltage(3, -0.2).unwrap();
        assert_eq!(dac.get_voltage(3).unwrap(), -0.2);
        assert_eq!(sim.voltage(3), -0.2);
        assert_eq!(sim.commands(), vec!["3 7d70a3", "3 V?"]);

        dac.set_all(1.).unwrap();
        let all = dac.get_all().unwrap();
        assert_eq!(all.len(), CHANNEL_COUNT);
        assert!(all.iter().all(|v| *v == 1.0));

        dac.set_output(1, true).unwrap();
        assert!(dac.output(1).unwrap());
        assert!(!dac.output(2).unwrap());
        dac.set_bandwidth(1, Bandwidth::High).unwrap();
    }

    #[test]
    fn return_codes() {
        let (sim, mut dac) = dac();
        assert!(matches!(dac.set_voltage(25, 0.), Err(Error::Protocol { code: 1, .. })));
        assert!(matches!(dac.set_voltage(1, 12.), Err(Error::Protocol { code: 3, .. })));
        // Local checks never reach the device
        assert!(sim.commands().is_empty());

        sim.set_remote_write(false);
        match dac.set_voltage(1, 0.5) {
            Err(Error::Protocol { code, command }) => {
                assert_eq!(code, 5);
                assert_eq!(command, "1 866665");
            }
            other => panic!("expected code 5, got {:?}", other),
        }
        // Every part of a multi-command is answered and the first failure reported
        sim.set_remote_write(true);
        assert!(matches!(dac.write_cmd("1 7fffff;30 7fffff"), Err(Error::Protocol { code: 1, .. })));
        assert!(dac.write_cmd("2 7fffff").is_ok());
    }

    #[test]
    fn identification() {
        let (_sim, mut dac) = dac();
        let idn = dac.idn().unwrap();
        assert_eq!(idn.serial, "1060-0001");
        assert_eq!(idn.firmware, "3.4.9");
        assert_eq!(dac.health().unwrap(), "OK");
        assert_eq!(dac.ip().unwrap(), "192.168.0.5");
    }

    #[test]
    fn ramp_generator_commands() {
        let (sim, mut dac) = dac();
        dac.ramp_config(Generator::C, 14, 0., 0.8, 0.5).unwrap();
        dac.ramp_start(Generator::C).unwrap();
        assert_eq!(dac.ramp_state(Generator::C).unwrap(), "0");
        assert_eq!(
            sim.commands(),
            vec![
                "C RMP-C CH 14",
                "C RMP-C STAV 0",
                "C RMP-C STOV 0.8",
                "C RMP-C RT 0.5",
                "C RMP-C START",
                "C RMP-C S?"
            ]
        );
        assert_eq!(sim.voltage(14), 0.8);
    }

    #[test]
    fn waveform_memory() {
        let (sim, mut dac) = dac();
        dac.set_new_waveform(&SwgWaveform::dc(Generator::B, 3, -0.6, 1500, 0.1)).unwrap();
        assert_eq!(
            &sim.commands()[..6],
            &["C WAV-B CLR", "C SWG MODE 0", "C SWG WF 7", "C SWG DF 10", "C SWG AMP 0", "C SWG DCV -0.6"]
        );
        assert_eq!(dac.wav_mem_size(Generator::B).unwrap(), 1500);
        assert_eq!(dac.awg_mem_size(Generator::B).unwrap(), 1500);
        let awg = dac.query_full_awg_mem(Generator::B).unwrap();
        assert_eq!(awg.len(), 1500);
        // AWG memory holds DAC words, rounded down
        assert!(awg.iter().all(|v| (v + 0.6).abs() < 2e-6));
        let wav = dac.query_block_wav_mem(Generator::B, 1000).unwrap();
        assert_eq!(wav, vec![-0.6; 500]);
        assert!(dac.query_block_awg_mem(Generator::B, 2000).unwrap().is_empty());

        dac.awg_set_cycles(Generator::B, 2).unwrap();
        dac.awg_set_clock_period(AwgGroup::AB, 100.).unwrap();
        assert!(!dac.awg_running(Generator::B).unwrap());
        dac.awg_start(Generator::B).unwrap();
        assert!((sim.voltage(3) + 0.6).abs() < 2e-6);
        assert_eq!(dac.awg_cycles_done(Generator::B).unwrap(), 2);
        dac.awg_stop(Generator::B).unwrap();
        dac.awg_group_start(AwgGroup::All).unwrap();
        dac.awg_group_stop(AwgGroup::All).unwrap();
        assert_eq!(dac.awg_cycles_done(Generator::B).unwrap(), 4);

        // C and D cannot reach channel 3
        assert!(matches!(
            dac.set_new_waveform(&SwgWaveform::dc(Generator::C, 3, 0.1, 10, 0.01)),
            Err(Error::Protocol { code: 1, .. })
        ));
        assert!(matches!(dac.awg_set_channel(Generator::D, 3), Err(Error::Protocol { code: 1, .. })));
        assert!(matches!(
            dac.awg_set_clock_period(AwgGroup::All, 10.),
            Err(Error::Protocol { code: 4, .. })
        ));
        dac.wav_clear(Generator::B).unwrap();
        assert_eq!(dac.wav_mem_size(Generator::B).unwrap(), 0);
        dac.wav_write_to_awg(Generator::B).unwrap();
        assert!(sim.awg_memory(Generator::B).is_empty());
        // Nothing loaded to play
        assert!(matches!(dac.awg_start(Generator::B), Err(Error::Protocol { code: 2, .. })));
    }

    #[test]
    fn sine_waveform() {
        let (sim, mut dac) = dac();
        let sine = SwgWaveform {
            shape: SwgShape::Sine,
            frequency: 100.,
            amplitude: 1.,
            offset: 0.5,
            points: Some(4),
            memory: Generator::D,
            channel: 20,
        };
        dac.set_new_waveform(&sine).unwrap();
        let mem = sim.awg_memory(Generator::D);
        let expected = [0.5, 1.5, 0.5, -0.5];
        for (v, e) in mem.iter().zip(expected.iter()) {
            assert!((v - e).abs() < 1e-9);
        }
    }

    #[test]
    fn channel_parameter() {
        let (sim, dac) = dac();
        let mut ch = Sp1060Channel::new(Arc::new(Mutex::new(dac)), 5);
        assert_eq!(ch.name(), "ch5");
        ch.set(0.8).unwrap();
        assert_eq!(ch.get().unwrap(), 0.8);
        assert_eq!(sim.voltage(5), 0.8);
    }

    fn line() -> Layout {
        let mut layout = Layout::with_interfaces(vec![
            InstrumentInterface::sp1060("dac", 2).unwrap(),
            InstrumentInterface::chip("chip", &[ChannelSpec::dc("G1", 1, -0.5, 0.5).input()]).unwrap(),
        ])
        .unwrap();
        let conn = layout.add_connection("dac.Ch1", "chip.G1", ConnectionInfo::default()).unwrap();
        let mut elements = IndexMap::new();
        elements.insert(
            "seq".to_string(),
            PulseElement::new(
                vec![
                    Pulse::dc_fixed("hold", 0.3, 0., 0.01).unwrap(),
                    Pulse::dc("kick", -0.2, 0., 0.005).unwrap(),
                    Pulse::dc_ramp("up", 0., 0.2, 0., Some(0.005), None).unwrap(),
                ],
                0.,
                1,
            ),
        );
        layout.config_pulse_line("plunger", conn, 0., None, Some(elements), None).unwrap();
        layout
    }

    #[test]
    fn driver_plan_and_run() {
        let layout = line();
        let sim = SimulatedSp1060::new();
        let mut driver = Sp1060Driver::new("dac", Sp1060::new(sim.clone()));
        let plunger = layout.pulse_line("plunger").unwrap();
        driver.load_line(plunger, &plunger.compiled_track(1e3).unwrap()).unwrap();

        let actions: Vec<DacAction> = driver.plan().iter().map(|cmd| cmd.action).collect();
        assert_eq!(
            actions,
            vec![
                DacAction::Set { channel: 1, voltage: 0.3 },
                DacAction::AwgStart {
                    generator: Generator::A,
                    channel: 1
                },
                DacAction::Set { channel: 1, voltage: 0. },
                DacAction::Ramp {
                    generator: Generator::A,
                    channel: 1,
                    start: 0.,
                    stop: 0.2,
                    duration: 0.005
                },
                DacAction::Set { channel: 1, voltage: 0. },
            ]
        );
        assert!((driver.plan()[4].at - 0.02).abs() < 1e-9);
        assert_eq!(
            driver.uploads(),
            &[AwgUpload {
                generator: Generator::A,
                channel: 1,
                voltage: -0.2,
                points: 5,
                clock_period_us: 1000.
            }]
        );

        driver.run().unwrap();
        let commands = sim.commands();
        // The AWG is loaded before anything is played
        assert_eq!(commands[0], "C WAV-A CLR");
        assert!(commands.contains(&"C AWG-AB CP 1000".to_string()));
        let first_set = commands.iter().position(|c| c == "1 83d709").unwrap();
        let awg_start = commands.iter().position(|c| c == "C AWG-A START").unwrap();
        assert!(first_set < awg_start);
        assert!(commands.contains(&"C RMP-A START".to_string()));
        assert_eq!(commands.last().unwrap(), "1 7fffff");
        assert_eq!(sim.voltage(1), -1e-6);
        assert_eq!(sim.awg_memory(Generator::A).len(), 5);
    }

    #[test]
    fn run_consumes_the_plan() {
        let layout = line();
        let sim = SimulatedSp1060::new();
        let mut driver = Sp1060Driver::new("dac", Sp1060::new(sim.clone())).with_realtime(false);
        let plunger = layout.pulse_line("plunger").unwrap();
        let track = plunger.compiled_track(1e3).unwrap();

        driver.load_line(plunger, &track).unwrap();
        driver.run().unwrap();
        assert!(driver.plan().is_empty());
        assert!(driver.uploads().is_empty());
        let first = sim.commands().len();

        driver.load_line(plunger, &track).unwrap();
        assert_eq!(driver.plan().len(), 5);
        driver.run().unwrap();
        assert_eq!(sim.commands().len(), 2 * first);
        assert_eq!(sim.commands()[first..], sim.commands()[..first]);
    }

    fn ramps_on(channels: &[usize], start: f64) -> Layout {
        let gates: Vec<ChannelSpec> = channels
            .iter()
            .map(|ch| ChannelSpec::dc(&format!("G{}", ch), *ch, -1., 1.).input())
            .collect();
        let mut layout = Layout::with_interfaces(vec![
            InstrumentInterface::sp1060("dac", 24).unwrap(),
            InstrumentInterface::chip("chip", &gates).unwrap(),
        ])
        .unwrap();
        for ch in channels {
            let conn = layout
                .add_connection(&format!("dac.Ch{}", ch), &format!("chip.G{}", ch), ConnectionInfo::default())
                .unwrap();
            let mut elements = IndexMap::new();
            elements.insert(
                "sweep".to_string(),
                PulseElement::new(vec![Pulse::dc_ramp("up", 0., 0.4, 0., Some(0.5), None).unwrap()], 0., 1),
            );
            layout
                .config_pulse_line(&format!("g{}", ch), conn, start, None, Some(elements), None)
                .unwrap();
        }
        layout
    }

    fn ramp_generators(driver: &Sp1060Driver<SimulatedSp1060>) -> Vec<(usize, Generator)> {
        driver
            .plan()
            .iter()
            .filter_map(|cmd| match cmd.action {
                DacAction::Ramp { generator, channel, .. } => Some((channel, generator)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn concurrent_ramps_get_their_own_generator() {
        let layout = ramps_on(&[1, 2, 3, 13], 0.);
        let mut driver = Sp1060Driver::new("dac", Sp1060::new(SimulatedSp1060::new()));
        for name in ["g1", "g2", "g13"] {
            let line = layout.pulse_line(name).unwrap();
            driver.load_line(line, &line.compiled_track(1e3).unwrap()).unwrap();
        }
        let mut generators = ramp_generators(&driver);
        generators.sort_by_key(|(ch, _)| *ch);
        assert_eq!(generators, vec![(1, Generator::A), (2, Generator::B), (13, Generator::C)]);

        // Both generators of the lower half are busy
        let g3 = layout.pulse_line("g3").unwrap();
        let planned = driver.plan().len();
        assert!(matches!(
            driver.load_line(g3, &g3.compiled_track(1e3).unwrap()),
            Err(Error::NoGenerator { kind: "ramp", channel: 3, .. })
        ));
        assert_eq!(driver.plan().len(), planned);

        // Once the first ramps are over, A is free again
        let later = ramps_on(&[3], 0.5);
        let g3 = later.pulse_line("g3").unwrap();
        driver.load_line(g3, &g3.compiled_track(1e3).unwrap()).unwrap();
        assert!(ramp_generators(&driver).contains(&(3, Generator::A)));
    }

    #[test]
    fn awg_pulses_share_memory() {
        let mut layout = Layout::with_interfaces(vec![
            InstrumentInterface::sp1060("dac", 2).unwrap(),
            InstrumentInterface::chip("chip", &[ChannelSpec::dc("G1", 1, -1., 1.).input()]).unwrap(),
        ])
        .unwrap();
        let conn = layout.add_connection("dac.Ch1", "chip.G1", ConnectionInfo::default()).unwrap();
        let mut elements = IndexMap::new();
        elements.insert(
            "kicks".to_string(),
            PulseElement::new(
                vec![
                    Pulse::dc("a", 0.2, 0., 0.005).unwrap(),
                    Pulse::dc("b", -0.2, 0., 0.005).unwrap(),
                    Pulse::dc("c", 0.4, 0., 0.005).unwrap(),
                ],
                0.001,
                2,
            ),
        );
        let line = layout.config_pulse_line("kicks", conn, 0., None, Some(elements.clone()), None).unwrap();
        let mut driver = Sp1060Driver::new("dac", Sp1060::new(SimulatedSp1060::new()));
        // Three distinct levels on one half, two AWGs
        assert!(matches!(
            driver.load_line(line, &line.compiled_track(1e3).unwrap()),
            Err(Error::NoGenerator { kind: "AWG", channel: 1, .. })
        ));
        assert!(driver.uploads().is_empty());

        elements["kicks"].pulses.pop();
        let line = layout.config_pulse_line("kicks", conn, 0., None, Some(elements), None).unwrap();
        driver.load_line(line, &line.compiled_track(1e3).unwrap()).unwrap();
        let generators: Vec<Generator> = driver.uploads().iter().map(|up| up.generator).collect();
        assert_eq!(generators, vec![Generator::A, Generator::B]);
        let starts = driver
            .plan()
            .iter()
            .filter(|cmd| matches!(cmd.action, DacAction::AwgStart { .. }))
            .count();
        assert_eq!(starts, 4);
    }

    #[test]
    fn driver_rejects_ac_pulses() {
        let mut awg = InstrumentInterface::new("awg", InterfaceKind::Generic);
        awg.add_channel(&ChannelSpec::ac("Out1", 1, 2e4)).unwrap();
        let mut layout = Layout::with_interfaces(vec![
            awg,
            InstrumentInterface::chip("chip", &[ChannelSpec::ac("RF", 1, 1e6).input()]).unwrap(),
        ])
        .unwrap();
        let conn = layout.add_connection("awg.Out1", "chip.RF", ConnectionInfo::default()).unwrap();
        let mut elements = IndexMap::new();
        elements.insert(
            "drive".to_string(),
            PulseElement::new(vec![Pulse::ac("rf", 1e3, 0.5, 0., 0.01).unwrap()], 0., 1),
        );
        let line = layout.config_pulse_line("drive", conn, 0., None, Some(elements), None).unwrap();

        let mut driver = Sp1060Driver::new("dac", Sp1060::new(SimulatedSp1060::new()));
        let err = driver.load_line(line, &Track::new("drive", 1e3)).unwrap_err();
        assert!(matches!(err, Error::Compiler(pulsecompiler_backend::Error::InvalidPulse { .. })));
        assert!(driver.plan().is_empty());
    }
}
