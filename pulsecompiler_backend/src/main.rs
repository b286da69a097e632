use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use pulsecompiler_backend::utils::TickTimer;
use pulsecompiler_backend::*;

/// Validate and compile a layout description.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Layout TOML file
    layout: PathBuf,
    /// Compile up to this time in seconds instead of the latest line stop
    #[arg(long)]
    stop_time: Option<f64>,
}

fn run(args: &Args) -> Result<bool> {
    let mut timer = TickTimer::new();
    let config = LayoutConfig::from_file(&args.layout)?;
    let layout = Layout::from_config(&config)?;
    timer.tick_log("layout loaded");

    for interface in layout.interfaces().values() {
        print!("{}", interface);
    }
    for (idx, connection) in layout.connections().iter().enumerate() {
        println!("#{} {}", idx, connection);
    }
    for line in layout.pulse_sequence().values() {
        println!("{}", line);
    }

    let report = layout.validate();
    println!("{}", report);
    if !report.is_ok() {
        return Ok(false);
    }
    let tracks = layout.compile(args.stop_time)?;
    timer.tick_log("compiled");
    for (name, track) in tracks.iter() {
        println!(
            "{}: {} instruction(s), {} samples at {} Sa/s",
            name,
            track.instr_val().len(),
            track.total_samps(),
            track.samp_rate()
        );
    }
    Ok(true)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            log::error!("{}", err);
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
