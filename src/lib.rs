//! # ps4000-rs
//!
//! A Rust library for driving PicoScope 4000 series oscilloscopes.
//!
//! The library sits on top of the vendor driver (abstracted by the [`Driver`] trait) and
//! takes care of the parts that are easy to get wrong: pushing channel and trigger setup in
//! the order the driver expects, probing for an accepted timebase, registering sample
//! buffers for exactly the enabled channels, waiting for the device, and handing every
//! buffer back no matter how the capture ends.
//!
//! ## Features
//!
//! - **Block capture**: immediate or triggered, with optional pre-trigger samples
//! - **Rapid block**: many triggered blocks back to back in segmented memory
//! - **Streaming**: continuous capture with auto-stop, copied out of the driver's overview buffers
//! - **Triggers**: per-channel thresholds, AND/OR condition sets, pulse-width qualifier
//! - **Conversion**: ADC counts to millivolts with probe attenuation
//! - **DataFrame output**: captures export to `polars` frames and CSV
//! - **Simulated driver**: a built-in stand-in that behaves like a 4224 for tests and demos
//!
//! ## Examples
//!
//! ### Immediate Block Capture
//!
//! ```rust
//! use ps4000_rs::{ChannelId, PicoScope, VoltageRange};
//! use ps4000_rs::simulated::SimulatedDriver;
//!
//! let mut scope = PicoScope::open(SimulatedDriver::default())?;
//! scope.channel_mut(ChannelId::A)?.set_range(VoltageRange::Range2V)?;
//! scope.set_buffer_size(100)?;
//! scope.set_sampling_rate_hz(1_000_000.0)?;
//!
//! let data = scope.collect_block_immediate()?;
//! let millivolts = data.millivolts(ChannelId::A)?;
//! assert_eq!(millivolts.len(), data.sample_count());
//! assert!(millivolts.iter().all(|mv| mv.abs() <= 2000));
//! # Ok::<(), ps4000_rs::PicoError>(())
//! ```
//!
//! ### Triggered Capture
//!
//! ```rust
//! use ps4000_rs::{ChannelId, PicoScope, ThresholdDirection, TriggerConditions, TriggerState};
//! use ps4000_rs::simulated::SimulatedDriver;
//!
//! let mut scope = PicoScope::open(SimulatedDriver::default())?;
//! scope
//!     .channel_mut(ChannelId::A)?
//!     .set_trigger_voltage_mv(500)
//!     .set_trigger_direction(ThresholdDirection::Rising);
//! scope.add_trigger_conditions(TriggerConditions::new().channel_a(TriggerState::True));
//! scope.set_buffer_size(64)?;
//!
//! let data = scope.collect_block_triggered(16)?;
//! assert_eq!(data.sample_count(), 64);
//! # Ok::<(), ps4000_rs::PicoError>(())
//! ```
//!
//! ### Capturing on a Worker Thread
//!
//! ```rust
//! use ps4000_rs::PicoScope;
//! use ps4000_rs::simulated::SimulatedDriver;
//!
//! let scope = PicoScope::open(SimulatedDriver::default())?;
//! let pending = scope.collect_rapid_block_async(4);
//! // ... do other work, or pending.cancel() ...
//! let (scope, result) = pending.wait();
//! let segments = result?;
//! assert_eq!(segments.segment_count(), 4);
//! scope.close()?;
//! # Ok::<(), ps4000_rs::PicoError>(())
//! ```
//!
//! ### DataFrame Export
//!
//! ```rust
//! use ps4000_rs::PicoScope;
//! use ps4000_rs::simulated::SimulatedDriver;
//!
//! let mut scope = PicoScope::open(SimulatedDriver::default())?;
//! scope.set_buffer_size(8)?;
//! let df = scope.collect_streaming_immediate()?.to_dataframe()?;
//! assert_eq!(df.height(), 8);
//! assert!(df.column("A_max_mv").is_ok());
//! # Ok::<(), ps4000_rs::PicoError>(())
//! ```

/// Open a profiling zone for the rest of the enclosing scope when `cpu-profiling` is on.
macro_rules! profile_scope {
    ($name:literal) => {
        #[cfg(feature = "cpu-profiling")]
        let _profile_zone = tracy_client::Client::start()
            .span(tracy_client::span_location!($name), 0);
    };
}

pub mod block_data;
pub mod buffer;
pub mod calibration;
pub mod channel;
pub mod driver;
pub mod pico_scope;
pub mod render;
pub mod simulated;
pub mod status;
pub mod trigger_config;

// Re-export the main types for convenience
pub use block_data::{BlockData, ChannelTrace, RapidBlockData};

pub use calibration::{adc_to_millivolts, millivolts_to_adc, Model};

pub use channel::{
    Channel, ChannelId, ChannelSettings, Coupling, ThresholdDirection, ThresholdMode,
    VoltageRange,
};

pub use driver::{Driver, Handle};

pub use pico_scope::{
    AbortReason, AcquisitionSettings, AcquisitionState, CancelHandle, PendingCapture, PicoError,
    PicoScope, Step,
};

pub use render::RenderOptions;

pub use status::PicoStatus;

pub use trigger_config::{
    PulseWidthQualifier, PulseWidthType, TriggerConditions, TriggerSetup, TriggerState,
};
