// The binary compiles the library modules directly (the cdylib is built
// for Python and is not linkable here); most of the driver surface is
// unused by this demo.
#![allow(dead_code)]

use std::process::exit;

use anyhow::Result;
use clap::Parser;

mod buffer;
mod device;
mod errors;
mod models;
mod usb;

use device::MccDevice;
use models::DeviceModel;

#[derive(Parser, Debug)]
#[command(
    name = "daqflex-demo",
    about = "Run a block-mode AISCAN readout on a DAQFlex module"
)]
struct Args {
    /// Device model, e.g. USB-204
    #[arg(default_value = "USB-204")]
    model: String,
    /// Serial number, to pick one of several attached devices
    #[arg(long)]
    serial: Option<String>,
    /// Analog input channel to sample
    #[arg(long, default_value_t = 0)]
    channel: u8,
    /// Scan rate in Hz
    #[arg(long, default_value_t = 1000.0)]
    rate: f64,
    /// Number of samples to read
    #[arg(long, default_value_t = 2000)]
    samples: usize,
    /// Lower bound of the selected voltage range
    #[arg(long, default_value_t = -10.0)]
    min_voltage: f64,
    /// Upper bound of the selected voltage range
    #[arg(long, default_value_t = 10.0)]
    max_voltage: f64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("DAQFLEX_LOG", "info"))
        .format_timestamp_millis()
        .init();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let model = DeviceModel::from_name(&args.model)?;

    println!("--- Connecting to {} ---", model.name());
    let mut device = MccDevice::open(model, args.serial.as_deref())?;

    println!(
        "Configuring AISCAN: channel {}, {} samples @ {} Hz...",
        args.channel, args.samples, args.rate
    );
    device.send_message(&format!("AISCAN:LOWCHAN={}", args.channel))?;
    device.send_message(&format!("AISCAN:HIGHCHAN={}", args.channel))?;
    device.send_message(&format!("AISCAN:RATE={}", args.rate))?;
    device.send_message(&format!("AISCAN:SAMPLES={}", args.samples))?;
    device.send_message("AISCAN:XFRMODE=BLOCKIO")?;
    device.flush_input_data()?;
    device.send_message("AISCAN:START")?;

    println!("Reading...");
    let raw = device.read_scan_data(args.samples, args.rate)?;

    let calibration = device.get_calib_data(args.channel)?;
    let volts = device.scale_and_calibrate(&raw, args.min_voltage, args.max_voltage, calibration);

    if volts.is_empty() {
        println!("Scan ended before any data arrived.");
        return Ok(());
    }
    let min = volts.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = volts.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = volts.iter().sum::<f64>() / volts.len() as f64;
    println!(
        "Read {} samples: min {:.4} V, max {:.4} V, mean {:.4} V",
        volts.len(),
        min,
        max,
        mean
    );
    Ok(())
}
