// Record file inspection
//
// Decodes a .bin file written by an acquisition session, checks that the
// sample indices are contiguous and prints basic statistics.

use clap::Parser;
use pidaq_rs::inspect::{analyze_file, write_csv};
use pidaq_rs::{read_record_file, SampleRecord};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "inspect_bin")]
#[command(version = "0.1")]
#[command(about = "Inspect an acquisition record file")]
struct Args {
    /// Record file to inspect
    file: PathBuf,

    /// Print every decoded record
    #[arg(short, long, help = "Print index and value of every record")]
    print: bool,

    /// Export the records as CSV
    #[arg(long, value_name = "OUT", help = "Write index,value rows to this CSV file")]
    csv: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn print_records(records: &[SampleRecord]) {
    for record in records {
        println!("{:>10} {:>6}", record.index, record.value);
    }
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

    if args.print || args.csv.is_some() {
        let records = read_record_file(&args.file)?;
        if args.print {
            print_records(&records);
        }
        if let Some(out) = &args.csv {
            write_csv(&records, BufWriter::new(File::create(out)?))?;
            println!("Wrote {} rows to {}", records.len(), out.display());
        }
    }

    let analysis = analyze_file(&args.file)?;
    println!("File:      {}", args.file.display());
    println!("Samples:   {}", analysis.samples);
    println!("Mean:      {:.3}", analysis.mean);
    println!("Std dev:   {:.3}", analysis.std_dev);
    println!("Integrity: {}", analysis.integrity);

    Ok(())
}
