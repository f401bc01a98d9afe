// Streaming capture
//
// Streams until the driver auto-stops, optionally downsampled, and prints the result as
// a polars DataFrame.

use std::time::Duration;

use clap::Parser;
use ps4000_rs::simulated::{SimulatedConfig, SimulatedDriver};
use ps4000_rs::{ChannelId, PicoScope, TriggerConditions, TriggerState};

#[derive(Parser)]
#[command(name = "streaming")]
#[command(version = "1.0")]
#[command(about = "Stream samples from a PicoScope 4000 until auto-stop")]
struct Args {
    /// Samples to collect per channel
    #[arg(short, long, default_value_t = 64)]
    samples: u32,

    /// Aggregate this many samples into one min/max pair
    #[arg(short, long, default_value_t = 1)]
    downsample: u32,

    /// Start collecting on a channel A trigger, keeping this many samples from before it
    #[arg(long)]
    pre_trigger: Option<u32>,

    /// Samples delivered per driver callback
    #[arg(long, default_value_t = 16)]
    chunk: u32,

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

    let driver = SimulatedDriver::new(SimulatedConfig {
        streaming_chunk: args.chunk,
        ..SimulatedConfig::default()
    });
    let mut scope = PicoScope::open(driver)?;
    scope.set_buffer_size(args.samples)?;
    scope.set_sampling_rate_hz(50_000.0)?;
    scope.channel_mut(ChannelId::B)?.set_enabled(false);
    {
        let settings = scope.settings_mut();
        settings.downsample_ratio = args.downsample;
        settings.poll_interval = Duration::from_millis(1);
    }

    let data = match args.pre_trigger {
        Some(pre_trigger) => {
            scope.add_trigger_conditions(TriggerConditions::new().channel_a(TriggerState::True));
            scope.collect_streaming_triggered(pre_trigger)?
        }
        None => scope.collect_streaming_immediate()?,
    };

    match data.trigger_at() {
        Some(index) => println!("Triggered at sample {index}"),
        None => println!("No trigger"),
    }
    println!("{}", data.to_dataframe()?);
    Ok(())
}
