//! The hardware driver boundary.
//!
//! [`Driver`] mirrors the vendor driver's entry points one to one. Every call either
//! succeeds or hands back the raw [`PicoStatus`]; mapping statuses to typed errors is the
//! scope's job. [`crate::simulated::SimulatedDriver`] is the in-crate implementation.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer::SharedSamples;
use crate::channel::{ChannelId, ChannelSettings, ThresholdDirection};
use crate::status::PicoStatus;
use crate::trigger_config::{PulseWidthQualifier, TriggerChannelProperties, TriggerConditions};

/// Opaque handle of an opened unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(pub i16);

/// Unit-info line selectors, in driver code order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitInfo {
    DriverVersion = 0,
    UsbVersion = 1,
    HardwareVersion = 2,
    VariantInfo = 3,
    BatchAndSerial = 4,
    CalDate = 5,
    KernelVersion = 6,
}

impl UnitInfo {
    pub const ALL: [Self; 7] = [
        Self::DriverVersion,
        Self::UsbVersion,
        Self::HardwareVersion,
        Self::VariantInfo,
        Self::BatchAndSerial,
        Self::CalDate,
        Self::KernelVersion,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::DriverVersion => "Driver Version",
            Self::UsbVersion => "USB Version",
            Self::HardwareVersion => "Hardware Version",
            Self::VariantInfo => "Variant Info",
            Self::BatchAndSerial => "Serial",
            Self::CalDate => "Cal Date",
            Self::KernelVersion => "Kernel Ver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownSamplingMode {
    #[default]
    None = 0,
    Aggregate = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnits {
    Femtoseconds = 0,
    Picoseconds = 1,
    Nanoseconds = 2,
    Microseconds = 3,
    Milliseconds = 4,
    Seconds = 5,
}

/// Answer to a timebase probe that the driver accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimebaseInfo {
    pub time_interval_ns: i32,
    pub max_samples: i32,
}

/// Completion flag the driver raises from its own context when a block run finishes.
///
/// The raising side stores the callback status first, so a reader that sees the flag set
/// also sees the status that came with it.
#[derive(Debug, Clone, Default)]
pub struct ReadySignal {
    ready: Arc<AtomicBool>,
    status: Arc<AtomicU32>,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self, status: PicoStatus) {
        self.status.store(status.0, Ordering::Release);
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PicoStatus {
        PicoStatus(self.status.load(Ordering::Acquire))
    }
}

/// Parameters of a streaming run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingRequest {
    pub sample_interval: u32,
    pub time_units: TimeUnits,
    pub max_pre_trigger_samples: u32,
    pub max_post_trigger_samples: u32,
    pub auto_stop: bool,
    pub downsample_ratio: u32,
    pub overview_buffer_size: u32,
}

/// What one streaming callback delivered. The samples themselves were written into the
/// registered buffers starting at `start_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamingSlice {
    pub sample_count: u32,
    pub start_index: u32,
    pub overflow: u16,
    pub trigger_at: u32,
    pub triggered: bool,
    pub auto_stop: bool,
}

/// Vendor driver entry points used by the acquisition engine.
pub trait Driver {
    fn open_unit(&mut self) -> Result<Handle, PicoStatus>;

    fn close_unit(&mut self, handle: Handle) -> Result<(), PicoStatus>;

    fn unit_info(&mut self, handle: Handle, info: UnitInfo) -> Result<String, PicoStatus>;

    fn set_channel(
        &mut self,
        handle: Handle,
        channel: ChannelId,
        settings: ChannelSettings,
    ) -> Result<(), PicoStatus>;

    /// Probe a candidate timebase. An error means "try the next candidate".
    fn get_timebase(
        &mut self,
        handle: Handle,
        timebase: u32,
        sample_count: u32,
        oversample: u16,
        segment_index: u16,
    ) -> Result<TimebaseInfo, PicoStatus>;

    fn set_trigger_channel_properties(
        &mut self,
        handle: Handle,
        properties: &[TriggerChannelProperties],
        aux_output_enabled: bool,
        auto_trigger_ms: i32,
    ) -> Result<(), PicoStatus>;

    fn set_trigger_channel_conditions(
        &mut self,
        handle: Handle,
        conditions: &[TriggerConditions],
    ) -> Result<(), PicoStatus>;

    fn set_trigger_channel_directions(
        &mut self,
        handle: Handle,
        directions: [ThresholdDirection; 6],
    ) -> Result<(), PicoStatus>;

    fn set_trigger_delay(&mut self, handle: Handle, delay: u32) -> Result<(), PicoStatus>;

    fn set_pulse_width_qualifier(
        &mut self,
        handle: Handle,
        qualifier: &PulseWidthQualifier,
    ) -> Result<(), PicoStatus>;

    /// Register the max/min buffers the driver writes into. `None` clears a registration.
    fn set_data_buffers(
        &mut self,
        handle: Handle,
        channel: ChannelId,
        max: Option<SharedSamples>,
        min: Option<SharedSamples>,
        length: u32,
    ) -> Result<(), PicoStatus>;

    /// Segment-indexed registration for rapid block mode.
    fn set_data_buffer_bulk(
        &mut self,
        handle: Handle,
        channel: ChannelId,
        buffer: SharedSamples,
        length: u32,
        segment_index: u16,
    ) -> Result<(), PicoStatus>;

    /// Split capture memory into segments; returns the samples available per segment.
    fn memory_segments(&mut self, handle: Handle, segment_count: u16) -> Result<u32, PicoStatus>;

    fn set_no_of_captures(&mut self, handle: Handle, capture_count: u16) -> Result<(), PicoStatus>;

    /// Start a block run. Returns immediately; `ready` is raised when data is available.
    /// The return value is the driver's estimate of the time the run takes, in ms.
    fn run_block(
        &mut self,
        handle: Handle,
        pre_trigger_samples: u32,
        post_trigger_samples: u32,
        timebase: u32,
        oversample: u16,
        segment_index: u16,
        ready: ReadySignal,
    ) -> Result<i32, PicoStatus>;

    fn run_streaming(&mut self, handle: Handle, request: StreamingRequest) -> Result<u32, PicoStatus>;

    /// Poll for new streaming data. `None` when the driver had nothing to report this time.
    fn get_streaming_latest_values(
        &mut self,
        handle: Handle,
    ) -> Result<Option<StreamingSlice>, PicoStatus>;

    fn stop(&mut self, handle: Handle) -> Result<(), PicoStatus>;

    /// Copy captured samples into the registered buffers. `sample_count` goes in as the
    /// number wanted and comes back as the number written. Returns the overflow bitmask.
    fn get_values(
        &mut self,
        handle: Handle,
        start_index: u32,
        sample_count: &mut u32,
        downsample_ratio: u32,
        mode: DownSamplingMode,
        segment_index: u16,
    ) -> Result<u16, PicoStatus>;

    /// Bulk fetch of segments `from..=to` into their registered buffers. Returns one
    /// overflow bitmask per segment.
    fn get_values_bulk(
        &mut self,
        handle: Handle,
        sample_count: &mut u32,
        from_segment: u16,
        to_segment: u16,
    ) -> Result<Vec<u16>, PicoStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_signal_carries_status() {
        let signal = ReadySignal::new();
        let driver_side = signal.clone();
        assert!(!signal.is_ready());

        driver_side.complete(PicoStatus::CANCELLED);
        assert!(signal.is_ready());
        assert_eq!(signal.status(), PicoStatus::CANCELLED);
    }

    #[test]
    fn test_unit_info_labels() {
        assert_eq!(UnitInfo::ALL.len(), 7);
        assert_eq!(UnitInfo::VariantInfo as i32, 3);
        assert_eq!(UnitInfo::BatchAndSerial.label(), "Serial");
    }
}
