// Simulated acquisition run
//
// Ramps a simulated bias supply, records a timed session from the simulated
// ADC while polling the live stream, then verifies the written file.

use clap::Parser;
use pidaq_rs::{
    read_record_file, verify_integrity, AcquisitionController, AcquisitionSettings,
    AcquisitionState, BiasController, BiasSettings, Polarity, SimulatedBiasLink,
    SimulatedCapture, DEFAULT_QUERY_TIMEOUT, DEFAULT_STREAM_POINTS,
};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "acquire")]
#[command(version = "0.1")]
#[command(about = "Run a simulated acquisition session")]
struct Args {
    /// Session duration in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    duration: u32,

    /// Output file name; a timestamped name is used when omitted
    #[arg(short, long)]
    filename: Option<String>,

    /// Directory receiving the record file
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Bias setpoint in millivolts
    #[arg(short, long, default_value_t = 54_000)]
    bias_mv: i32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    println!("Simulated Acquisition");
    println!("=====================\n");

    let bias = BiasController::new(
        SimulatedBiasLink::new().with_calibration(1002, -35),
        BiasSettings::default(),
    );
    bias.start_io()?;
    bias.set_polarity(Polarity::Negative)?;
    bias.set_voltage(args.bias_mv)?;
    bias.hv_on()?;
    let status = bias.get_status(DEFAULT_QUERY_TIMEOUT)?;
    let voltage = bias.get_voltage(DEFAULT_QUERY_TIMEOUT)?;
    println!(
        "Bias: enabled={} negative={} applied={:.3} V\n",
        status.enabled,
        status.is_negative,
        voltage.volts()
    );

    let acq = AcquisitionController::new(
        SimulatedCapture::new(),
        AcquisitionSettings {
            output_dir: args.output_dir,
            ..AcquisitionSettings::default()
        },
    );
    acq.set_duration(args.duration)?;
    if let Some(name) = &args.filename {
        acq.set_filename(name)?;
    }
    println!("Running for {:?} (rounded to whole buffers)", acq.rounded_duration());

    let begin = Instant::now();
    let path = acq.start()?;
    loop {
        let snapshot = acq.stream_snapshot(DEFAULT_STREAM_POINTS);
        if snapshot.state == AcquisitionState::Idle {
            break;
        }
        if let Some(last) = snapshot.records.last() {
            println!(
                "  [{:>6.0} ms] {} points, newest index {} value {}",
                begin.elapsed().as_secs_f64() * 1000.0,
                snapshot.records.len(),
                last.index,
                last.value
            );
        }
        thread::sleep(Duration::from_millis(100));
    }
    acq.wait()?;

    bias.hv_off()?;
    bias.stop_io();

    let records = read_record_file(&path)?;
    verify_integrity(&records)?;
    println!(
        "\nWrote {} contiguous samples to {}",
        records.len(),
        path.display()
    );

    Ok(())
}
