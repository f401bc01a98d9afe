// Triggered block capture
//
// Sets a rising-edge threshold on channel A, optionally qualified by channel B, and
// captures a block with pre-trigger samples.

use clap::Parser;
use ps4000_rs::simulated::SimulatedDriver;
use ps4000_rs::{
    ChannelId, PicoScope, ThresholdDirection, TriggerConditions, TriggerState, VoltageRange,
};

#[derive(Parser)]
#[command(name = "block_triggered")]
#[command(version = "1.0")]
#[command(about = "Capture one triggered block from a PicoScope 4000")]
struct Args {
    /// Trigger threshold on channel A in mV
    #[arg(short, long, default_value_t = 1000, allow_hyphen_values = true)]
    threshold: i16,

    /// Samples per channel
    #[arg(short, long, default_value_t = 32)]
    samples: u32,

    /// Samples kept from before the trigger
    #[arg(short, long, default_value_t = 8)]
    pre_trigger: u32,

    /// Also require channel B to be above its threshold
    #[arg(long)]
    and_b: bool,

    /// Give up after this many ms without a trigger (0 waits forever)
    #[arg(long, default_value_t = 0)]
    auto_trigger_ms: i32,

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
    scope
        .channel_mut(ChannelId::A)?
        .set_range(VoltageRange::Range5V)?
        .set_trigger_voltage_mv(args.threshold)
        .set_trigger_direction(ThresholdDirection::Rising);

    let mut conditions = TriggerConditions::new().channel_a(TriggerState::True);
    if args.and_b {
        scope
            .channel_mut(ChannelId::B)?
            .set_trigger_voltage_mv(0)
            .set_trigger_direction(ThresholdDirection::Above);
        conditions = conditions.channel_b(TriggerState::True);
    }
    scope.add_trigger_conditions(conditions);
    scope.settings_mut().auto_trigger_ms = args.auto_trigger_ms;
    scope.set_buffer_size(args.samples)?;
    scope.set_sampling_rate_hz(100_000.0)?;

    let data = scope.collect_block_triggered(args.pre_trigger)?;
    println!(
        "Captured {} samples, {} ns apart",
        data.sample_count(),
        data.time_interval_ns()
    );
    print!("{data}");
    Ok(())
}
