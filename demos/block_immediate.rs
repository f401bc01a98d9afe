// Immediate block capture
//
// Opens the simulated 4224, configures both channels and captures one block without
// waiting for a trigger. The result is printed as a table or written as CSV.

use clap::Parser;
use ps4000_rs::simulated::SimulatedDriver;
use ps4000_rs::{ChannelId, PicoScope, RenderOptions, VoltageRange};

#[derive(Parser)]
#[command(name = "block_immediate")]
#[command(version = "1.0")]
#[command(about = "Capture one block from a PicoScope 4000 without a trigger")]
struct Args {
    /// Samples per channel
    #[arg(short, long, default_value_t = 20)]
    samples: u32,

    /// Sampling rate in Hz
    #[arg(short, long, default_value_t = 2000.0)]
    rate: f64,

    /// Probe attenuation on channel A (1 or 10)
    #[arg(short, long, default_value_t = 1)]
    attenuation: u16,

    /// Write CSV to stdout instead of the table
    #[arg(long)]
    csv: bool,

    /// Show debug information and detailed logs
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

    let mut scope = PicoScope::open(SimulatedDriver::default())?;
    println!("{}\n", scope.device_info());

    scope
        .channel_mut(ChannelId::A)?
        .set_range(VoltageRange::Range5V)?
        .set_attenuation(args.attenuation)?;
    scope
        .channel_mut(ChannelId::B)?
        .set_range(VoltageRange::Range2V)?;
    scope.set_buffer_size(args.samples)?;
    let rate = scope.set_sampling_rate_hz(args.rate)?;

    println!("{}", scope.settings_summary());
    println!("Timebase {} ({rate} Hz)\n", scope.timebase());

    let data = scope.collect_block_immediate()?;
    if args.csv {
        data.write_csv(std::io::stdout().lock(), b',')?;
    } else {
        let options = RenderOptions {
            delimiter: " | ".to_string(),
            ..RenderOptions::default()
        };
        print!("{}", ps4000_rs::render::render(&data, &options)?);
    }

    for channel in data.channels() {
        if data.is_over_range(channel) {
            println!("Channel {channel} went over range");
        }
    }

    scope.close()?;
    Ok(())
}
