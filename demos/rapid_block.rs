// Rapid block capture
//
// Captures several blocks back to back into segmented memory on a worker thread and
// cancels the capture if it is still running at the deadline.

use std::time::{Duration, Instant};

use clap::Parser;
use ps4000_rs::simulated::{SimulatedConfig, SimulatedDriver};
use ps4000_rs::{ChannelId, PicoScope};

#[derive(Parser)]
#[command(name = "rapid_block")]
#[command(version = "1.0")]
#[command(about = "Capture several blocks back to back from a PicoScope 4000")]
struct Args {
    /// Number of segments to capture
    #[arg(short = 'n', long, default_value_t = 5)]
    segments: u16,

    /// Samples per segment
    #[arg(short, long, default_value_t = 10)]
    samples: u32,

    /// Simulated time until the device reports ready, in ms
    #[arg(long, default_value_t = 50)]
    ready_ms: u64,

    /// Cancel the capture if it is still running after this many ms
    #[arg(long, default_value_t = 1000)]
    deadline_ms: u64,

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
        ready_delay: Some(Duration::from_millis(args.ready_ms)),
        ..SimulatedConfig::default()
    });
    let mut scope = PicoScope::open(driver)?;
    scope.set_buffer_size(args.samples)?;
    scope.settings_mut().poll_interval = Duration::from_millis(5);

    let started = Instant::now();
    let deadline = Duration::from_millis(args.deadline_ms);
    let mut pending = scope.collect_rapid_block_async(args.segments);
    let (scope, result) = loop {
        match pending.try_get_result() {
            Ok(done) => break done,
            Err(still_running) => pending = still_running,
        }
        if started.elapsed() > deadline {
            println!("Deadline reached, cancelling");
            pending.cancel();
            break pending.wait();
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let data = result?;
    println!(
        "{} segments in {:?}, {} buffers pinned",
        data.segment_count(),
        started.elapsed(),
        scope.pinned_buffers()
    );
    for (index, segment) in data.segments().iter().enumerate() {
        let mv = segment.millivolts(ChannelId::A)?;
        let peak = mv.iter().map(|v| v.abs()).max().unwrap_or_default();
        println!("Segment {index}: {} samples, peak {peak} mV", segment.sample_count());
    }

    drop(data);
    println!("{} buffers pinned after release", scope.pinned_buffers());
    scope.close()?;
    Ok(())
}
