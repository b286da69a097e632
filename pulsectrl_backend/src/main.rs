use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use ndarray::Array1;
use parking_lot::Mutex;

use pulsecompiler_backend::{InterfaceKind, Layout, LayoutConfig};
use pulsectrl_backend::*;

/// Dispatch a layout to simulated instruments, then run a mock 1D scan on the DAC.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Layout TOML file
    layout: PathBuf,
    /// Runtime configuration TOML file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Points of the demo scan
    #[arg(long, default_value_t = 11)]
    points: usize,
}

fn run(args: &Args) -> Result<()> {
    let config = CtrlConfig::load(args.config.as_deref())?;
    let layout = Layout::from_config(&LayoutConfig::from_file(&args.layout)?)?;

    let dac = Arc::new(Mutex::new(Sp1060::new(SimulatedSp1060::new())));
    let mut dispatcher = Dispatcher::new();
    for interface in layout.interfaces().values() {
        match interface.kind() {
            InterfaceKind::Chip => {}
            InterfaceKind::Sp1060 => {
                dispatcher.register(interface.name(), Box::new(Sp1060Driver::shared(interface.name(), dac.clone())));
            }
            _ => {
                dispatcher.register(interface.name(), Box::new(RecordingDriver::new(interface.name())));
            }
        }
    }
    let lines = dispatcher.dispatch(&layout)?;
    dispatcher.run()?;
    println!("played {} pulse line(s) on {:?}", lines, dispatcher.interfaces());

    let paths = DataPaths::new(&config.data_root, &config.logger_root)?;
    let logger = RunLogger::new("demo", "mk", "pulsectrl", &paths.logger_dir())?;
    let params: Vec<Box<dyn Settable>> = vec![Box::new(Sp1060Channel::new(dac, 1).with_name("plunger"))];
    let meas: Vec<Box<dyn Acquisition>> = vec![Box::new(MockAcquisition::from_fn("i_sd", 1000, |k| 1e-10 * k as f64))];
    let mut scan = Scan::new(
        meas,
        params,
        DataManager::new(paths, 0),
        logger,
        1e9,
        config.settle(),
    )?
    .with_config(&config);
    scan.set_range_1d(Array1::linspace(0., 0.3, args.points).to_vec())?;
    let outcome = scan.scan_1d(0)?;
    println!(
        "run {}: {}/{} point(s) in {} written to {}",
        outcome.run_id,
        outcome.points_done,
        outcome.points_total,
        scan.unit(),
        outcome
            .data_file
            .map_or("<sink>".to_string(), |path| path.display().to_string())
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
