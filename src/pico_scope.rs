use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use polars::prelude::PolarsError;

use crate::block_data::{BlockData, ChannelTrace, RapidBlockData};
use crate::buffer::{BufferLedger, CaptureBuffer};
use crate::calibration::{Model, DUAL_SCOPE};
use crate::channel::{Channel, ChannelId, VoltageRange};
use crate::driver::{
    DownSamplingMode, Driver, Handle, ReadySignal, StreamingRequest, TimeUnits, TimebaseInfo,
    UnitInfo,
};
use crate::status::PicoStatus;
use crate::trigger_config::{PulseWidthQualifier, TriggerConditions, TriggerSetup};

/// Driver call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CloseUnit,
    SetChannel,
    GetTimebase,
    SetTriggerChannelProperties,
    SetTriggerChannelConditions,
    SetTriggerChannelDirections,
    SetTriggerDelay,
    SetPulseWidthQualifier,
    SetDataBuffers,
    SetDataBufferBulk,
    MemorySegments,
    SetNoOfCaptures,
    RunBlock,
    RunStreaming,
    GetStreamingLatestValues,
    GetValues,
    GetValuesBulk,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AbortReason {
    #[error("device not ready after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled by the caller")]
    Cancelled,

    #[error("device reported {0}")]
    Hardware(PicoStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum PicoError {
    #[error("Device unavailable: {status}")]
    DeviceUnavailable { status: PicoStatus },

    #[error("{step} rejected: {status}")]
    ConfigurationRejected { step: Step, status: PicoStatus },

    #[error("Acquisition aborted: {reason}")]
    AcquisitionAborted { reason: AbortReason },

    #[error("Buffer protocol violation: {0}")]
    BufferProtocolViolation(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Device model unknown, sampling interval cannot be converted to a timebase")]
    ModelNotResolved,

    #[error("Channel {0} was not captured")]
    ChannelNotCaptured(ChannelId),

    #[error("{step} failed while retrieving data: {status}")]
    DataRetrieval { step: Step, status: PicoStatus },

    #[error("DataFrame export failed: {0}")]
    DataFrame(#[from] PolarsError),
}

pub type Result<T, E = PicoError> = std::result::Result<T, E>;

fn rejected(step: Step) -> impl FnOnce(PicoStatus) -> PicoError {
    move |status| PicoError::ConfigurationRejected { step, status }
}

fn retrieval(step: Step) -> impl FnOnce(PicoStatus) -> PicoError {
    move |status| PicoError::DataRetrieval { step, status }
}

fn aborted(reason: AbortReason) -> PicoError {
    PicoError::AcquisitionAborted { reason }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionState {
    #[default]
    Idle,
    Configuring,
    BufferArmed,
    Waiting,
    Draining,
    Failed,
    Aborted,
}

/// Capture parameters shared by every acquisition mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionSettings {
    /// Samples per channel (per segment in rapid mode).
    pub buffer_size: u32,
    pub oversample: u16,
    /// Values above 1 select aggregate downsampling and fill the min buffers.
    pub downsample_ratio: u32,
    pub poll_interval: Duration,
    /// `None` waits for the device forever.
    pub ready_timeout: Option<Duration>,
    pub max_timebase_attempts: u32,
    /// Length of the driver-side buffers used while streaming.
    pub streaming_overview_size: u32,
    /// Trigger delay in samples.
    pub trigger_delay: u32,
    /// Fire the trigger anyway after this many ms. Zero waits indefinitely.
    pub auto_trigger_ms: i32,
    pub aux_output_enabled: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            oversample: 1,
            downsample_ratio: 1,
            poll_interval: Duration::from_millis(100),
            ready_timeout: Some(Duration::from_secs(10)),
            max_timebase_attempts: 100_000,
            streaming_overview_size: 4096,
            trigger_delay: 0,
            auto_trigger_ms: 0,
            aux_output_enabled: false,
        }
    }
}

impl AcquisitionSettings {
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.buffer_size == 0, "buffer size must be at least 1"),
            (self.oversample == 0, "oversample must be at least 1"),
            (self.downsample_ratio == 0, "downsample ratio must be at least 1"),
            (self.max_timebase_attempts == 0, "at least one timebase attempt is needed"),
            (self.streaming_overview_size == 0, "streaming overview size must be at least 1"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(PicoError::InvalidSetting((*message).to_string())),
            None => Ok(()),
        }
    }

    pub fn downsample_mode(&self) -> DownSamplingMode {
        if self.downsample_ratio > 1 {
            DownSamplingMode::Aggregate
        } else {
            DownSamplingMode::None
        }
    }
}

const CANCEL_IDLE: u8 = 0;
const CANCEL_ARMED: u8 = 1;
const CANCEL_REQUESTED: u8 = 2;

/// Requests an abort of the capture currently waiting for the device.
///
/// The handle is armed only while a capture runs. A cancel sent while the scope is idle
/// is ignored and does not carry over to the next capture.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<AtomicU8>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if self
            .state
            .compare_exchange(CANCEL_ARMED, CANCEL_REQUESTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Cancel ignored, no capture is waiting");
        }
    }

    /// Arming an already armed (or cancelled) handle keeps its state.
    fn arm(&self) {
        if self
            .state
            .compare_exchange(CANCEL_IDLE, CANCEL_ARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::trace!("Cancel handle armed");
        }
    }

    fn disarm(&self) {
        self.state.store(CANCEL_IDLE, Ordering::Release);
    }

    fn is_requested(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCEL_REQUESTED
    }
}

#[derive(Debug, Default)]
struct StreamingProgress {
    collected: usize,
    overflow: u16,
    trigger_at: Option<usize>,
}

/// An opened PicoScope 4000 unit.
///
/// Channel and trigger edits are held on the scope and pushed to the driver right before
/// each capture. Every capture borrows the scope mutably (or consumes it, for the `_async`
/// variants), so only one capture can be in flight and configuration cannot change
/// underneath it.
pub struct PicoScope<D: Driver> {
    driver: D,
    handle: Handle,
    closed: bool,
    model: Option<Model>,
    device_info: String,
    channels: Vec<Channel>,
    conditions: Vec<TriggerConditions>,
    pulse_width: Option<PulseWidthQualifier>,
    settings: AcquisitionSettings,
    timebase: u32,
    reported_interval_ns: f64,
    max_samples: i32,
    state: AcquisitionState,
    ledger: BufferLedger,
    cancel: CancelHandle,
}

impl<D: Driver> PicoScope<D> {
    pub fn open(driver: D) -> Result<Self> {
        Self::open_with(driver, AcquisitionSettings::default())
    }

    /// Open the unit, identify the model, push the default channel setup and resolve the
    /// first accepted timebase.
    pub fn open_with(mut driver: D, settings: AcquisitionSettings) -> Result<Self> {
        let _span = tracing::debug_span!("open").entered();
        settings.validate()?;

        let handle = driver
            .open_unit()
            .map_err(|status| PicoError::DeviceUnavailable { status })?;
        log::debug!("Opened unit with handle {}", handle.0);

        let (device_info, variant) = read_device_info(&mut driver, handle);
        let model = Model::from_variant_info(&variant);
        let (min_range, max_range, channel_count) = model.map_or(
            (VoltageRange::Range10mV, VoltageRange::Range100V, DUAL_SCOPE),
            |model| {
                let info = model.info();
                (info.min_range, info.max_range, info.channel_count)
            },
        );
        match model {
            Some(model) => log::debug!("Found {model} with {channel_count} channels"),
            None => log::warn!(
                "Unknown variant {variant:?}, assuming {channel_count} channels and no timebase formula"
            ),
        }

        let channels = ChannelId::ANALOG
            .into_iter()
            .take(channel_count)
            .map(|id| Channel::new(id, min_range, max_range))
            .collect();

        let mut scope = Self {
            driver,
            handle,
            closed: false,
            model,
            device_info,
            channels,
            conditions: Vec::new(),
            pulse_width: None,
            settings,
            timebase: 0,
            reported_interval_ns: 0.0,
            max_samples: 0,
            state: AcquisitionState::Idle,
            ledger: BufferLedger::new(),
            cancel: CancelHandle::default(),
        };
        scope.commit_channels()?;
        scope.resolve_timebase(scope.settings.buffer_size, 0)?;
        Ok(scope)
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.driver
            .close_unit(self.handle)
            .map_err(rejected(Step::CloseUnit))?;
        log::debug!("Closed unit with handle {}", self.handle.0);
        Ok(())
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// `None` when the reported variant is not in the model table.
    pub fn model(&self) -> Option<Model> {
        self.model
    }

    /// The unit-info lines read at open, one per line.
    pub fn device_info(&self) -> &str {
        &self.device_info
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, id: ChannelId) -> Result<&Channel> {
        self.channels
            .iter()
            .find(|ch| ch.id() == id)
            .ok_or_else(|| missing_channel(id, self.channels.len()))
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        let count = self.channels.len();
        self.channels
            .iter_mut()
            .find(|ch| ch.id() == id)
            .ok_or_else(|| missing_channel(id, count))
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Settings are validated at the start of every capture.
    pub fn settings_mut(&mut self) -> &mut AcquisitionSettings {
        &mut self.settings
    }

    pub fn set_buffer_size(&mut self, samples: u32) -> Result<()> {
        if samples == 0 {
            return Err(PicoError::InvalidSetting(
                "buffer size must be at least 1".to_string(),
            ));
        }
        self.settings.buffer_size = samples;
        Ok(())
    }

    pub fn timebase(&self) -> u32 {
        self.timebase
    }

    /// Largest sample count the driver reported for the current timebase.
    pub fn max_samples(&self) -> i32 {
        self.max_samples
    }

    /// Actual interval of the current timebase. Uses the model formula when the model is
    /// known, otherwise the interval the driver reported.
    pub fn sampling_interval_ns(&self) -> f64 {
        self.model.map_or(self.reported_interval_ns, |model| {
            model.info().timebase.interval_for_timebase(self.timebase)
        })
    }

    pub fn sampling_rate_hz(&self) -> f64 {
        1e9 / self.sampling_interval_ns()
    }

    /// Select a timebase. The driver may refuse it, in which case the next accepted one is
    /// used and returned.
    pub fn set_timebase(&mut self, timebase: u32) -> Result<u32> {
        let previous = self.timebase;
        self.timebase = timebase;
        if let Err(e) = self.resolve_timebase(self.settings.buffer_size, 0) {
            self.timebase = previous;
            return Err(e);
        }
        Ok(self.timebase)
    }

    /// Pick the fastest timebase whose interval is at least `interval_ns`. Returns the
    /// interval actually in effect.
    pub fn set_sampling_interval_ns(&mut self, interval_ns: f64) -> Result<f64> {
        if !interval_ns.is_finite() || interval_ns <= 0.0 {
            return Err(PicoError::InvalidSetting(format!(
                "sampling interval {interval_ns} ns is not positive"
            )));
        }
        let model = self.model.ok_or(PicoError::ModelNotResolved)?;
        let candidate = model.info().timebase.timebase_for_interval(interval_ns);
        self.set_timebase(candidate)?;
        let actual = self.sampling_interval_ns();
        log::debug!("Requested {interval_ns} ns, using timebase {} ({actual} ns)", self.timebase);
        Ok(actual)
    }

    /// Returns the sampling rate actually in effect.
    pub fn set_sampling_rate_hz(&mut self, rate_hz: f64) -> Result<f64> {
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(PicoError::InvalidSetting(format!(
                "sampling rate {rate_hz} Hz is not positive"
            )));
        }
        self.set_sampling_interval_ns(1e9 / rate_hz)?;
        Ok(self.sampling_rate_hz())
    }

    pub fn trigger_conditions(&self) -> &[TriggerConditions] {
        &self.conditions
    }

    /// Add one AND-combination. Combinations are ORed.
    pub fn add_trigger_conditions(&mut self, conditions: TriggerConditions) {
        self.conditions.push(conditions);
    }

    pub fn reset_trigger_conditions(&mut self) {
        self.conditions.clear();
    }

    pub fn pulse_width_qualifier(&self) -> Option<&PulseWidthQualifier> {
        self.pulse_width.as_ref()
    }

    pub fn set_pulse_width_qualifier(&mut self, qualifier: Option<PulseWidthQualifier>) {
        self.pulse_width = qualifier;
    }

    /// The trigger a triggered capture would push right now.
    pub fn trigger_setup(&self) -> Result<TriggerSetup> {
        Ok(TriggerSetup::from_channels(&self.channels, &self.conditions)?
            .with_delay(self.settings.trigger_delay)
            .with_pulse_width(self.pulse_width.clone())
            .with_auto_trigger(self.settings.aux_output_enabled, self.settings.auto_trigger_ms))
    }

    fn configured_trigger(&self) -> Result<TriggerSetup> {
        if self.conditions.is_empty() && self.pulse_width.is_none() {
            Ok(TriggerSetup::disabled())
        } else {
            self.trigger_setup()
        }
    }

    /// One "Channel X Voltage Range = ..." line per channel.
    pub fn settings_summary(&self) -> String {
        self.channels
            .iter()
            .map(|ch| {
                let state = if ch.is_enabled() { "" } else { " (disabled)" };
                format!("Channel {} Voltage Range = {}{state}", ch.name(), ch.range())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Buffers allocated by this scope and not yet released, including those owned by
    /// results still alive.
    pub fn pinned_buffers(&self) -> usize {
        self.ledger.outstanding()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn collect_block_immediate(&mut self) -> Result<BlockData> {
        self.collect_block(&TriggerSetup::disabled(), 0)
    }

    /// Block capture gated by the configured trigger conditions.
    pub fn collect_block_triggered(&mut self, pre_trigger_samples: u32) -> Result<BlockData> {
        match self.trigger_setup() {
            Ok(trigger) => self.collect_block(&trigger, pre_trigger_samples),
            Err(e) => self.settle(Err(e)),
        }
    }

    /// Block capture with an explicit trigger setup.
    pub fn collect_block(
        &mut self,
        trigger: &TriggerSetup,
        pre_trigger_samples: u32,
    ) -> Result<BlockData> {
        let _span = tracing::debug_span!(
            "collect_block",
            pre_trigger_samples,
            buffer_size = self.settings.buffer_size
        )
        .entered();
        self.cancel.arm();
        let result = self.block_capture(trigger, pre_trigger_samples);
        self.settle(result)
    }

    /// Capture `segment_count` blocks back to back, each in its own memory segment, using
    /// the configured trigger (or none when no conditions are set).
    pub fn collect_rapid_block(&mut self, segment_count: u16) -> Result<RapidBlockData> {
        let _span = tracing::debug_span!(
            "collect_rapid_block",
            segment_count,
            buffer_size = self.settings.buffer_size
        )
        .entered();
        self.cancel.arm();
        let result = self
            .configured_trigger()
            .and_then(|trigger| self.rapid_capture(&trigger, segment_count));
        self.settle(result)
    }

    pub fn collect_streaming_immediate(&mut self) -> Result<BlockData> {
        self.collect_streaming(&TriggerSetup::disabled(), 0)
    }

    pub fn collect_streaming_triggered(&mut self, pre_trigger_samples: u32) -> Result<BlockData> {
        match self.trigger_setup() {
            Ok(trigger) => self.collect_streaming(&trigger, pre_trigger_samples),
            Err(e) => self.settle(Err(e)),
        }
    }

    /// Stream until the driver auto-stops after `buffer_size` samples.
    pub fn collect_streaming(
        &mut self,
        trigger: &TriggerSetup,
        pre_trigger_samples: u32,
    ) -> Result<BlockData> {
        let _span = tracing::debug_span!(
            "collect_streaming",
            pre_trigger_samples,
            buffer_size = self.settings.buffer_size
        )
        .entered();
        self.cancel.arm();
        let result = self.streaming_capture(trigger, pre_trigger_samples);
        self.settle(result)
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        self.cancel.disarm();
        self.state = match &result {
            Ok(_) => AcquisitionState::Idle,
            Err(PicoError::AcquisitionAborted { .. }) => AcquisitionState::Aborted,
            Err(_) => AcquisitionState::Failed,
        };
        if let Err(e) = &result {
            log::warn!("Capture failed: {e}");
        }
        result
    }

    fn block_capture(&mut self, trigger: &TriggerSetup, pre_trigger: u32) -> Result<BlockData> {
        let sample_count = self.configure(trigger, pre_trigger)?;
        let info = self.resolve_timebase(sample_count, 0)?;

        self.state = AcquisitionState::BufferArmed;
        let traces = self.arm_buffers(sample_count)?;

        self.state = AcquisitionState::Waiting;
        let ready = self.start_block(pre_trigger, sample_count)?;
        let outcome = self.await_ready(&ready);

        self.state = AcquisitionState::Draining;
        self.stop_device();
        outcome?;

        let ratio = self.settings.downsample_ratio;
        let mut count = sample_count;
        let overflow = self
            .driver
            .get_values(
                self.handle,
                0,
                &mut count,
                ratio,
                self.settings.downsample_mode(),
                0,
            )
            .map_err(retrieval(Step::GetValues))?;
        let count = count.min(sample_count);
        log::debug!("Retrieved {count} of {sample_count} samples, overflow {overflow:#06b}");

        Ok(BlockData::new(
            count as usize,
            i64::from(info.time_interval_ns),
            ratio,
            overflow,
            None,
            traces,
        ))
    }

    fn rapid_capture(&mut self, trigger: &TriggerSetup, segment_count: u16) -> Result<RapidBlockData> {
        if segment_count == 0 {
            return Err(PicoError::InvalidSetting(
                "rapid block needs at least one segment".to_string(),
            ));
        }
        let sample_count = self.configure(trigger, 0)?;
        let per_segment = self
            .driver
            .memory_segments(self.handle, segment_count)
            .map_err(rejected(Step::MemorySegments))?;
        log::debug!("Split memory into {segment_count} segments of {per_segment} samples");

        let result = self.segmented_capture(segment_count, sample_count, per_segment);
        self.restore_single_segment();
        result
    }

    fn segmented_capture(
        &mut self,
        segment_count: u16,
        sample_count: u32,
        per_segment: u32,
    ) -> Result<RapidBlockData> {
        if sample_count > per_segment {
            return Err(PicoError::InvalidSetting(format!(
                "buffer size {sample_count} exceeds the {per_segment} samples available per segment"
            )));
        }
        self.driver
            .set_no_of_captures(self.handle, segment_count)
            .map_err(rejected(Step::SetNoOfCaptures))?;
        let info = self.resolve_timebase(sample_count, 0)?;

        self.state = AcquisitionState::BufferArmed;
        let mut armed: Vec<(Channel, Vec<CaptureBuffer>)> = Vec::new();
        for channel in self.channels.clone() {
            if !channel.is_enabled() {
                continue;
            }
            let mut buffers = Vec::with_capacity(usize::from(segment_count));
            for segment in 0..segment_count {
                let buffer = self.ledger.allocate(sample_count as usize);
                self.driver
                    .set_data_buffer_bulk(
                        self.handle,
                        channel.id(),
                        buffer.driver_view(),
                        sample_count,
                        segment,
                    )
                    .map_err(rejected(Step::SetDataBufferBulk))?;
                buffers.push(buffer);
            }
            armed.push((channel, buffers));
        }

        self.state = AcquisitionState::Waiting;
        let ready = self.start_block(0, sample_count)?;
        let outcome = self.await_ready(&ready);

        self.state = AcquisitionState::Draining;
        self.stop_device();
        outcome?;

        let mut count = sample_count;
        let overflows = self
            .driver
            .get_values_bulk(self.handle, &mut count, 0, segment_count - 1)
            .map_err(retrieval(Step::GetValuesBulk))?;
        let count = count.min(sample_count) as usize;

        let mut segments: Vec<Vec<ChannelTrace>> =
            (0..segment_count).map(|_| Vec::new()).collect();
        for (channel, buffers) in armed {
            for (traces, buffer) in segments.iter_mut().zip(buffers) {
                traces.push(ChannelTrace::new(
                    channel.id(),
                    channel.range(),
                    channel.attenuation(),
                    buffer,
                    None,
                ));
            }
        }
        let blocks = segments
            .into_iter()
            .enumerate()
            .map(|(index, traces)| {
                let overflow = overflows.get(index).copied().unwrap_or_default();
                BlockData::new(count, i64::from(info.time_interval_ns), 1, overflow, None, traces)
            })
            .collect();
        Ok(RapidBlockData::new(blocks))
    }

    fn restore_single_segment(&mut self) {
        if let Err(status) = self.driver.set_no_of_captures(self.handle, 1) {
            log::warn!("Could not reset capture count: {status}");
        }
        if let Err(status) = self.driver.memory_segments(self.handle, 1) {
            log::warn!("Could not reset memory segments: {status}");
        }
    }

    fn streaming_capture(&mut self, trigger: &TriggerSetup, pre_trigger: u32) -> Result<BlockData> {
        let sample_count = self.configure(trigger, pre_trigger)?;
        let ratio = self.settings.downsample_ratio;

        self.state = AcquisitionState::BufferArmed;
        let overview = self.arm_buffers(self.settings.streaming_overview_size)?;
        let shadows: Vec<ChannelTrace> = overview
            .iter()
            .map(|trace| {
                ChannelTrace::new(
                    trace.channel(),
                    trace.range(),
                    trace.attenuation(),
                    self.ledger.allocate(sample_count as usize),
                    Some(self.ledger.allocate(sample_count as usize)),
                )
            })
            .collect();

        self.state = AcquisitionState::Waiting;
        let (sample_interval, time_units) = streaming_interval(self.sampling_interval_ns());
        let request = StreamingRequest {
            sample_interval,
            time_units,
            max_pre_trigger_samples: pre_trigger,
            max_post_trigger_samples: sample_count - pre_trigger,
            auto_stop: true,
            downsample_ratio: ratio,
            overview_buffer_size: self.settings.streaming_overview_size,
        };
        let interval = match self.driver.run_streaming(self.handle, request) {
            Ok(interval) => interval,
            Err(status) => {
                self.stop_device();
                return Err(rejected(Step::RunStreaming)(status));
            }
        };
        log::debug!("Streaming at {interval} {time_units:?} per sample");

        let outcome = self.drain_streaming(&overview, &shadows, sample_count as usize);
        self.state = AcquisitionState::Draining;
        self.stop_device();
        let progress = outcome?;

        Ok(BlockData::new(
            progress.collected,
            interval_to_ns(interval, time_units),
            ratio,
            progress.overflow,
            progress.trigger_at,
            shadows,
        ))
    }

    /// Copy each delivered slice out of the overview buffers until the driver auto-stops
    /// or the shadow buffers are full.
    fn drain_streaming(
        &mut self,
        overview: &[ChannelTrace],
        shadows: &[ChannelTrace],
        capacity: usize,
    ) -> Result<StreamingProgress> {
        let mut progress = StreamingProgress::default();
        let mut last_delivery = Instant::now();
        loop {
            profile_scope!("streaming_poll");
            let slice = self
                .driver
                .get_streaming_latest_values(self.handle)
                .map_err(retrieval(Step::GetStreamingLatestValues))?;

            if let Some(slice) = slice {
                if slice.sample_count > 0 {
                    last_delivery = Instant::now();
                    let offset = progress.collected;
                    let start = slice.start_index as usize;
                    let count = slice.sample_count as usize;
                    for (source, target) in overview.iter().zip(shadows) {
                        copy_slice(source.max_buffer(), target.max_buffer(), start, count, offset);
                        if let (Some(source), Some(target)) = (source.min_buffer(), target.min_buffer())
                        {
                            copy_slice(source, target, start, count, offset);
                        }
                    }
                    if slice.triggered && progress.trigger_at.is_none() {
                        progress.trigger_at = Some(offset + slice.trigger_at as usize);
                    }
                    progress.overflow |= slice.overflow;
                    progress.collected = (offset + count).min(capacity);
                    log::trace!("Streamed {count} samples, {} collected", progress.collected);
                }
                if slice.auto_stop || progress.collected >= capacity {
                    return Ok(progress);
                }
            }

            self.check_abort(last_delivery)?;
            thread::sleep(self.settings.poll_interval);
        }
    }

    /// Validation, channel commit and trigger push shared by every capture.
    fn configure(&mut self, trigger: &TriggerSetup, pre_trigger: u32) -> Result<u32> {
        self.state = AcquisitionState::Configuring;
        self.settings.validate()?;
        let sample_count = self.settings.buffer_size;
        if pre_trigger > sample_count {
            return Err(PicoError::InvalidSetting(format!(
                "{pre_trigger} pre-trigger samples exceed the buffer size of {sample_count}"
            )));
        }
        self.commit_channels()?;
        self.apply_trigger(trigger)?;
        Ok(sample_count)
    }

    fn commit_channels(&mut self) -> Result<()> {
        for channel in self.channels.iter_mut().filter(|ch| ch.is_pending()) {
            self.driver
                .set_channel(self.handle, channel.id(), channel.settings())
                .map_err(rejected(Step::SetChannel))?;
            log::debug!("Channel {} set to {:?}", channel.id(), channel.settings());
            channel.mark_committed();
        }
        Ok(())
    }

    fn apply_trigger(&mut self, trigger: &TriggerSetup) -> Result<()> {
        let handle = self.handle;
        let driver = &mut self.driver;
        driver
            .set_trigger_channel_properties(
                handle,
                &trigger.properties,
                trigger.aux_output_enabled,
                trigger.auto_trigger_ms,
            )
            .map_err(rejected(Step::SetTriggerChannelProperties))?;
        driver
            .set_trigger_channel_conditions(handle, &trigger.conditions)
            .map_err(rejected(Step::SetTriggerChannelConditions))?;
        driver
            .set_trigger_channel_directions(handle, trigger.directions)
            .map_err(rejected(Step::SetTriggerChannelDirections))?;
        driver
            .set_trigger_delay(handle, trigger.delay)
            .map_err(rejected(Step::SetTriggerDelay))?;
        driver
            .set_pulse_width_qualifier(handle, &trigger.pulse_width)
            .map_err(rejected(Step::SetPulseWidthQualifier))?;
        if trigger.is_disabled() {
            log::debug!("Trigger disabled, capture starts immediately");
        } else {
            log::debug!(
                "Trigger set: {} properties, {} conditions",
                trigger.properties.len(),
                trigger.conditions.len()
            );
        }
        Ok(())
    }

    /// Probe timebases from the current one upwards until the driver accepts one.
    fn resolve_timebase(&mut self, sample_count: u32, segment_index: u16) -> Result<TimebaseInfo> {
        let mut candidate = self.timebase;
        let mut last_status = PicoStatus::INVALID_TIMEBASE;
        for _ in 0..self.settings.max_timebase_attempts {
            match self.driver.get_timebase(
                self.handle,
                candidate,
                sample_count,
                self.settings.oversample,
                segment_index,
            ) {
                Ok(info) => {
                    if candidate != self.timebase {
                        log::debug!("Timebase {} rejected, using {candidate}", self.timebase);
                    }
                    self.timebase = candidate;
                    self.reported_interval_ns = f64::from(info.time_interval_ns);
                    self.max_samples = info.max_samples;
                    return Ok(info);
                }
                Err(status) => {
                    last_status = status;
                    match candidate.checked_add(1) {
                        Some(next) => candidate = next,
                        None => break,
                    }
                }
            }
        }
        log::warn!(
            "No timebase from {} accepted within {} attempts",
            self.timebase,
            self.settings.max_timebase_attempts
        );
        Err(rejected(Step::GetTimebase)(last_status))
    }

    /// Register a max/min buffer pair for each enabled channel and clear the registration
    /// of each disabled one.
    fn arm_buffers(&mut self, length: u32) -> Result<Vec<ChannelTrace>> {
        let mut traces = Vec::new();
        for channel in self.channels.clone() {
            if channel.is_enabled() {
                let max = self.ledger.allocate(length as usize);
                let min = self.ledger.allocate(length as usize);
                self.driver
                    .set_data_buffers(
                        self.handle,
                        channel.id(),
                        Some(max.driver_view()),
                        Some(min.driver_view()),
                        length,
                    )
                    .map_err(rejected(Step::SetDataBuffers))?;
                traces.push(ChannelTrace::new(
                    channel.id(),
                    channel.range(),
                    channel.attenuation(),
                    max,
                    Some(min),
                ));
            } else {
                self.driver
                    .set_data_buffers(self.handle, channel.id(), None, None, 0)
                    .map_err(rejected(Step::SetDataBuffers))?;
            }
        }
        Ok(traces)
    }

    fn start_block(&mut self, pre_trigger: u32, sample_count: u32) -> Result<ReadySignal> {
        let ready = ReadySignal::new();
        match self.driver.run_block(
            self.handle,
            pre_trigger,
            sample_count.saturating_sub(pre_trigger),
            self.timebase,
            self.settings.oversample,
            0,
            ready.clone(),
        ) {
            Ok(estimate_ms) => {
                log::debug!("Block run started on timebase {}, about {estimate_ms} ms", self.timebase);
                Ok(ready)
            }
            Err(status) => {
                self.stop_device();
                Err(rejected(Step::RunBlock)(status))
            }
        }
    }

    fn await_ready(&self, ready: &ReadySignal) -> Result<()> {
        let started = Instant::now();
        loop {
            profile_scope!("poll_ready");
            if ready.is_ready() {
                return ready
                    .status()
                    .into_result()
                    .map_err(|status| aborted(AbortReason::Hardware(status)));
            }
            self.check_abort(started)?;
            thread::sleep(self.settings.poll_interval);
        }
    }

    fn check_abort(&self, since: Instant) -> Result<()> {
        if self.cancel.is_requested() {
            return Err(aborted(AbortReason::Cancelled));
        }
        match self.settings.ready_timeout {
            Some(timeout) if since.elapsed() >= timeout => {
                Err(aborted(AbortReason::TimedOut(timeout)))
            }
            _ => Ok(()),
        }
    }

    fn stop_device(&mut self) {
        if let Err(status) = self.driver.stop(self.handle) {
            log::warn!("Stop failed: {status}");
        }
    }
}

fn missing_channel(id: ChannelId, count: usize) -> PicoError {
    PicoError::InvalidSetting(format!("channel {id} does not exist on this {count}-channel device"))
}

/// Express a sample interval for the streaming request. Fractional nanosecond intervals
/// (12.5 ns on the fast models) are sent in picoseconds.
fn streaming_interval(interval_ns: f64) -> (u32, TimeUnits) {
    let whole = interval_ns.round();
    if (interval_ns - whole).abs() < 1e-9 {
        (whole.max(1.0) as u32, TimeUnits::Nanoseconds)
    } else {
        ((interval_ns * 1e3).round().max(1.0) as u32, TimeUnits::Picoseconds)
    }
}

fn interval_to_ns(interval: u32, units: TimeUnits) -> i64 {
    let interval = i64::from(interval);
    match units {
        TimeUnits::Femtoseconds => interval / 1_000_000,
        TimeUnits::Picoseconds => interval / 1_000,
        TimeUnits::Nanoseconds => interval,
        TimeUnits::Microseconds => interval * 1_000,
        TimeUnits::Milliseconds => interval * 1_000_000,
        TimeUnits::Seconds => interval * 1_000_000_000,
    }
}

fn copy_slice(source: &CaptureBuffer, target: &CaptureBuffer, start: usize, count: usize, offset: usize) {
    if let Some(samples) = source.snapshot(start + count) {
        if let Some(slice) = samples.get(start..) {
            target.write_at(offset, slice);
        }
    }
}

fn read_device_info<D: Driver>(driver: &mut D, handle: Handle) -> (String, String) {
    let mut lines = Vec::with_capacity(UnitInfo::ALL.len());
    let mut variant = String::new();
    for info in UnitInfo::ALL {
        let value = driver.unit_info(handle, info).unwrap_or_else(|status| {
            log::warn!("Could not read {}: {status}", info.label());
            String::new()
        });
        if info == UnitInfo::VariantInfo {
            variant.clone_from(&value);
        }
        lines.push(format!("{}: {value}", info.label()));
    }
    (lines.join("\n"), variant)
}

impl<D: Driver> Drop for PicoScope<D> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(status) = self.driver.close_unit(self.handle) {
            log::warn!("Closing unit on drop failed: {status}");
        }
    }
}

impl<D: Driver + Send + 'static> PicoScope<D> {
    pub fn collect_block_immediate_async(self) -> PendingCapture<D, BlockData> {
        self.spawn_capture(Self::collect_block_immediate)
    }

    pub fn collect_block_triggered_async(self, pre_trigger_samples: u32) -> PendingCapture<D, BlockData> {
        self.spawn_capture(move |scope| scope.collect_block_triggered(pre_trigger_samples))
    }

    pub fn collect_rapid_block_async(self, segment_count: u16) -> PendingCapture<D, RapidBlockData> {
        self.spawn_capture(move |scope| scope.collect_rapid_block(segment_count))
    }

    pub fn collect_streaming_immediate_async(self) -> PendingCapture<D, BlockData> {
        self.spawn_capture(Self::collect_streaming_immediate)
    }

    pub fn collect_streaming_triggered_async(
        self,
        pre_trigger_samples: u32,
    ) -> PendingCapture<D, BlockData> {
        self.spawn_capture(move |scope| scope.collect_streaming_triggered(pre_trigger_samples))
    }

    /// Run the blocking capture on a worker thread. The scope travels with it and comes
    /// back with the result.
    fn spawn_capture<T, F>(mut self, capture: F) -> PendingCapture<D, T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Self) -> Result<T> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        cancel.arm();
        let worker = thread::spawn(move || {
            let result = capture(&mut self);
            (self, result)
        });
        PendingCapture { worker, cancel }
    }
}

/// A capture running on a worker thread.
pub struct PendingCapture<D: Driver, T> {
    worker: JoinHandle<(PicoScope<D>, Result<T>)>,
    cancel: CancelHandle,
}

impl<D: Driver, T> PendingCapture<D, T> {
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Abort the wait for the device. The capture still stops the device and releases
    /// its buffers before it finishes. Has no effect once the capture has settled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The scope and the capture result if the capture has finished, otherwise `self`.
    pub fn try_get_result(self) -> Result<(PicoScope<D>, Result<T>), Self> {
        if self.is_finished() {
            Ok(self.wait())
        } else {
            Err(self)
        }
    }

    pub fn wait(self) -> (PicoScope<D>, Result<T>) {
        match self.worker.join() {
            Ok(outcome) => outcome,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSettings, Coupling, ThresholdDirection};
    use crate::simulated::{DriverCall, DriverOp, SimulatedConfig, SimulatedDriver};
    use crate::trigger_config::{PulseWidthType, TriggerState};

    fn open_sim(config: SimulatedConfig) -> PicoScope<SimulatedDriver> {
        let settings = AcquisitionSettings {
            buffer_size: 16,
            poll_interval: Duration::from_millis(1),
            ..AcquisitionSettings::default()
        };
        PicoScope::open_with(SimulatedDriver::new(config), settings).unwrap()
    }

    fn scope() -> PicoScope<SimulatedDriver> {
        open_sim(SimulatedConfig::default())
    }

    fn settings_of(enabled: bool) -> ChannelSettings {
        ChannelSettings {
            enabled,
            coupling: Coupling::DC,
            range: VoltageRange::Range5V,
        }
    }

    #[test]
    fn test_open_reads_model_and_commits_channels() {
        let scope = scope();
        assert_eq!(scope.model(), Some(Model::PS4224));
        assert_eq!(scope.channels().len(), 2);
        assert!(scope.device_info().contains("Variant Info: 4224"));
        assert_eq!(scope.device_info().lines().count(), 7);
        assert_eq!(scope.driver().count_calls(DriverOp::SetChannel), 2);
        assert_eq!(scope.state(), AcquisitionState::Idle);
        assert_eq!(scope.timebase(), 0);
        assert!(scope.channels().iter().all(|ch| !ch.is_pending()));
    }

    #[test]
    fn test_open_unavailable_device() {
        let driver = SimulatedDriver::new(SimulatedConfig {
            unavailable: true,
            ..SimulatedConfig::default()
        });
        assert!(matches!(
            PicoScope::open(driver),
            Err(PicoError::DeviceUnavailable {
                status: PicoStatus::NOT_FOUND
            })
        ));
    }

    #[test]
    fn test_open_rejected_channel_setup() {
        let mut driver = SimulatedDriver::default();
        driver.fail(DriverOp::SetChannel, PicoStatus::INVALID_VOLTAGE_RANGE);
        assert!(matches!(
            PicoScope::open(driver),
            Err(PicoError::ConfigurationRejected {
                step: Step::SetChannel,
                status: PicoStatus::INVALID_VOLTAGE_RANGE
            })
        ));
    }

    #[test]
    fn test_unknown_variant() {
        let mut scope = open_sim(SimulatedConfig {
            variant: "9999".to_string(),
            ..SimulatedConfig::default()
        });
        assert_eq!(scope.model(), None);
        assert_eq!(scope.channels().len(), DUAL_SCOPE);
        assert_eq!(scope.sampling_interval_ns(), 100.0);
        assert!(matches!(
            scope.set_sampling_interval_ns(1000.0),
            Err(PicoError::ModelNotResolved)
        ));
        assert!(scope.set_timebase(4).is_ok());
        assert_eq!(scope.sampling_interval_ns(), 500.0);
    }

    #[test]
    fn test_missing_channel_rejected() {
        let mut scope = scope();
        assert!(matches!(
            scope.channel_mut(ChannelId::C),
            Err(PicoError::InvalidSetting(_))
        ));
        assert!(scope.channel(ChannelId::External).is_err());
        assert!(scope.channel(ChannelId::B).is_ok());
    }

    #[test]
    fn test_block_immediate_end_to_end() {
        let mut scope = PicoScope::open(SimulatedDriver::default()).unwrap();
        scope
            .channel_mut(ChannelId::A)
            .unwrap()
            .set_range(VoltageRange::Range5V)
            .unwrap()
            .set_attenuation(1)
            .unwrap();
        scope.set_buffer_size(10).unwrap();
        let rate = scope.set_sampling_rate_hz(2000.0).unwrap();
        assert_eq!(rate, 2000.0);

        let data = scope.collect_block_immediate().unwrap();
        assert!(data.sample_count() <= 10);
        assert_eq!(data.time_interval_ns(), 500_000);
        assert_eq!(data.channels(), vec![ChannelId::A, ChannelId::B]);
        let mv = data.millivolts(ChannelId::A).unwrap();
        assert_eq!(mv.len(), data.sample_count());
        assert!(mv.iter().all(|v| (-5000..=5000).contains(v)));
        assert_eq!(scope.state(), AcquisitionState::Idle);
    }

    #[test]
    fn test_sampling_interval_never_faster_than_requested() {
        let mut scope = scope();
        let actual = scope.set_sampling_interval_ns(130.0).unwrap();
        assert_eq!(actual, 150.0);
        assert_eq!(scope.timebase(), 4);
        assert!(scope.set_sampling_interval_ns(-1.0).is_err());
    }

    #[test]
    fn test_timebase_probe_skips_rejected_candidates() {
        let scope = open_sim(SimulatedConfig {
            min_timebase: 3,
            ..SimulatedConfig::default()
        });
        assert_eq!(scope.timebase(), 3);
        assert_eq!(scope.driver().count_calls(DriverOp::GetTimebase), 4);
        assert_eq!(scope.sampling_interval_ns(), 100.0);
    }

    #[test]
    fn test_timebase_probe_is_bounded() {
        let mut scope = scope();
        scope.driver_mut().config_mut().min_timebase = u32::MAX;
        scope.settings_mut().max_timebase_attempts = 5;
        scope.driver_mut().take_calls();

        assert!(matches!(
            scope.set_timebase(10),
            Err(PicoError::ConfigurationRejected {
                step: Step::GetTimebase,
                status: PicoStatus::INVALID_TIMEBASE
            })
        ));
        assert_eq!(scope.driver().count_calls(DriverOp::GetTimebase), 5);
        assert_eq!(scope.timebase(), 0);

        assert!(scope.collect_block_immediate().is_err());
        assert_eq!(scope.state(), AcquisitionState::Failed);
        assert_eq!(scope.pinned_buffers(), 0);
    }

    #[test]
    fn test_disabled_channel_is_not_registered_or_packaged() {
        let mut scope = scope();
        scope.channel_mut(ChannelId::B).unwrap().set_enabled(false);
        scope.driver_mut().take_calls();

        let data = scope.collect_block_immediate().unwrap();
        let calls = scope.driver().calls();
        assert!(calls.contains(&DriverCall::SetChannel {
            channel: ChannelId::B,
            settings: settings_of(false)
        }));
        assert!(calls.contains(&DriverCall::SetDataBuffers {
            channel: ChannelId::B,
            registered: false,
            length: 0
        }));
        assert!(!calls.contains(&DriverCall::SetDataBuffers {
            channel: ChannelId::B,
            registered: true,
            length: 16
        }));
        assert_eq!(data.channels(), vec![ChannelId::A]);
        assert!(matches!(
            data.raw(ChannelId::B),
            Err(PicoError::ChannelNotCaptured(ChannelId::B))
        ));
        drop(data);

        scope.channel_mut(ChannelId::B).unwrap().set_enabled(true);
        scope.driver_mut().take_calls();
        let data = scope.collect_block_immediate().unwrap();
        let calls = scope.driver().calls();
        assert!(calls.contains(&DriverCall::SetChannel {
            channel: ChannelId::B,
            settings: settings_of(true)
        }));
        assert!(calls.contains(&DriverCall::SetDataBuffers {
            channel: ChannelId::B,
            registered: true,
            length: 16
        }));
        assert_eq!(data.channels(), vec![ChannelId::A, ChannelId::B]);
        assert_eq!(data.raw(ChannelId::B).unwrap().len(), data.sample_count());
    }

    #[test]
    fn test_empty_trigger_matches_immediate_path() {
        let mut scope = scope();
        scope.driver_mut().take_calls();
        scope.collect_block_immediate().unwrap();
        let immediate = scope.driver_mut().take_calls();

        let empty = TriggerSetup::from_channels(&[], &[]).unwrap();
        assert!(empty.is_disabled());
        scope.collect_block(&empty, 0).unwrap();
        let explicit = scope.driver_mut().take_calls();

        assert_eq!(immediate, explicit);
        assert!(immediate.contains(&DriverCall::SetTriggerChannelProperties {
            properties: Vec::new(),
            auto_trigger_ms: 0
        }));
        assert!(immediate.contains(&DriverCall::SetTriggerChannelConditions(Vec::new())));
    }

    #[test]
    fn test_triggered_capture_pushes_trigger_before_arming() {
        let mut scope = scope();
        scope
            .channel_mut(ChannelId::A)
            .unwrap()
            .set_trigger_voltage_mv(1000)
            .set_trigger_direction(ThresholdDirection::Rising);
        scope.add_trigger_conditions(TriggerConditions::new().channel_a(TriggerState::True));
        scope.driver_mut().take_calls();

        let data = scope.collect_block_triggered(4).unwrap();
        assert_eq!(data.sample_count(), 16);

        let calls = scope.driver().calls();
        let first_registration = calls
            .iter()
            .position(|call| call.op() == DriverOp::SetDataBuffers)
            .unwrap();
        let properties: Vec<_> = calls
            .iter()
            .filter_map(|call| match call {
                DriverCall::SetTriggerChannelProperties { properties, .. } => Some(properties),
                _ => None,
            })
            .collect();
        let conditions: Vec<_> = calls
            .iter()
            .filter_map(|call| match call {
                DriverCall::SetTriggerChannelConditions(conditions) => Some(conditions),
                _ => None,
            })
            .collect();
        assert_eq!(properties.len(), 1);
        assert_eq!(conditions.len(), 1);
        assert!(!properties[0].is_empty());
        assert!(!conditions[0].is_empty());
        assert_eq!(properties[0][0].threshold_major, 6552);

        let properties_at = calls
            .iter()
            .position(|call| call.op() == DriverOp::SetTriggerChannelProperties)
            .unwrap();
        let conditions_at = calls
            .iter()
            .position(|call| call.op() == DriverOp::SetTriggerChannelConditions)
            .unwrap();
        assert!(properties_at < conditions_at);
        assert!(conditions_at < first_registration);
        assert!(calls.contains(&DriverCall::RunBlock {
            pre_trigger_samples: 4,
            post_trigger_samples: 12,
            timebase: 0
        }));
    }

    #[test]
    fn test_trigger_failure_aborts_before_arming() {
        let mut scope = scope();
        scope.add_trigger_conditions(TriggerConditions::new().channel_a(TriggerState::True));
        scope
            .driver_mut()
            .fail(DriverOp::SetTriggerChannelDirections, PicoStatus::INVALID_PARAMETER);
        scope.driver_mut().take_calls();

        assert!(matches!(
            scope.collect_block_triggered(0),
            Err(PicoError::ConfigurationRejected {
                step: Step::SetTriggerChannelDirections,
                ..
            })
        ));
        assert_eq!(scope.driver().count_calls(DriverOp::SetTriggerDelay), 0);
        assert_eq!(scope.driver().count_calls(DriverOp::SetDataBuffers), 0);
        assert_eq!(scope.state(), AcquisitionState::Failed);
    }

    #[test]
    fn test_condition_on_absent_channel_rejected_before_driver_calls() {
        let mut scope = scope();
        scope.add_trigger_conditions(TriggerConditions::new().channel_d(TriggerState::True));
        scope.driver_mut().take_calls();
        assert!(matches!(
            scope.collect_block_triggered(0),
            Err(PicoError::InvalidSetting(_))
        ));
        assert!(scope.driver().calls().is_empty());

        scope.reset_trigger_conditions();
        assert!(scope.trigger_conditions().is_empty());
        assert!(scope.collect_block_triggered(0).is_ok());
    }

    #[test]
    fn test_pulse_width_qualifier_is_pushed() {
        let mut scope = scope();
        let qualifier = PulseWidthQualifier {
            lower: 100,
            kind: PulseWidthType::GreaterThan,
            ..PulseWidthQualifier::disabled()
        };
        scope.set_pulse_width_qualifier(Some(qualifier.clone()));
        scope.driver_mut().take_calls();
        scope.collect_block_triggered(0).unwrap();
        assert!(scope
            .driver()
            .calls()
            .contains(&DriverCall::SetPulseWidthQualifier(qualifier)));
    }

    #[test]
    fn test_downsampled_block_fills_min_buffers() {
        let mut scope = scope();
        scope.set_buffer_size(10).unwrap();
        scope.settings_mut().downsample_ratio = 2;
        let data = scope.collect_block_immediate().unwrap();
        assert_eq!(data.sample_count(), 5);
        assert!(data.has_min_max());
        let max = data.raw(ChannelId::A).unwrap();
        let min = data.min_raw(ChannelId::A).unwrap().unwrap();
        assert!(max.iter().zip(&min).all(|(hi, lo)| hi >= lo));
        let times = data.times_ns();
        assert_eq!(times[1], 2 * data.time_interval_ns());
        assert_eq!(times[4], 8 * data.time_interval_ns());
    }

    #[test]
    fn test_rapid_block_registers_and_releases_every_segment() {
        let mut scope = scope();
        scope.set_buffer_size(8).unwrap();
        scope.driver_mut().take_calls();

        let mut data = scope.collect_rapid_block(3).unwrap();
        assert_eq!(scope.driver().count_calls(DriverOp::SetDataBufferBulk), 3 * 2);
        assert_eq!(scope.pinned_buffers(), 3 * 2);
        assert_eq!(data.segment_count(), 3);
        for segment in data.segments() {
            assert_eq!(segment.sample_count(), 8);
            assert_eq!(segment.channels(), vec![ChannelId::A, ChannelId::B]);
        }
        assert_eq!(data.raw(ChannelId::B, 2).unwrap().len(), 8);
        assert!(data.raw(ChannelId::A, 3).is_err());

        let calls = scope.driver().calls();
        assert!(calls.contains(&DriverCall::MemorySegments(3)));
        assert!(calls.contains(&DriverCall::SetNoOfCaptures(3)));
        assert_eq!(calls.last(), Some(&DriverCall::MemorySegments(1)));

        data.dispose();
        assert_eq!(scope.pinned_buffers(), 0);
        data.dispose();
        assert!(data.is_disposed());
    }

    #[test]
    fn test_rapid_block_failure_leaks_nothing() {
        let mut scope = scope();
        scope.set_buffer_size(8).unwrap();
        scope
            .driver_mut()
            .fail_after(DriverOp::SetDataBufferBulk, 3, PicoStatus::INVALID_BUFFER);

        assert!(matches!(
            scope.collect_rapid_block(3),
            Err(PicoError::ConfigurationRejected {
                step: Step::SetDataBufferBulk,
                status: PicoStatus::INVALID_BUFFER
            })
        ));
        assert_eq!(scope.driver().count_calls(DriverOp::SetDataBufferBulk), 4);
        assert_eq!(scope.pinned_buffers(), 0);
        assert_eq!(scope.state(), AcquisitionState::Failed);
        assert!(scope
            .driver()
            .calls()
            .contains(&DriverCall::SetNoOfCaptures(1)));
    }

    #[test]
    fn test_rapid_block_rejects_zero_segments() {
        let mut scope = scope();
        assert!(matches!(
            scope.collect_rapid_block(0),
            Err(PicoError::InvalidSetting(_))
        ));
    }

    #[test]
    fn test_run_failure_releases_buffers() {
        let mut scope = scope();
        scope.driver_mut().fail(DriverOp::RunBlock, PicoStatus::BLOCK_MODE_FAILED);
        assert!(matches!(
            scope.collect_block_immediate(),
            Err(PicoError::ConfigurationRejected {
                step: Step::RunBlock,
                ..
            })
        ));
        assert_eq!(scope.pinned_buffers(), 0);
        assert_eq!(scope.driver().count_calls(DriverOp::Stop), 1);
    }

    #[test]
    fn test_ready_timeout_stops_and_releases() {
        let mut scope = open_sim(SimulatedConfig {
            never_ready: true,
            ..SimulatedConfig::default()
        });
        scope.settings_mut().ready_timeout = Some(Duration::from_millis(30));

        let result = scope.collect_block_immediate();
        assert!(matches!(
            result,
            Err(PicoError::AcquisitionAborted {
                reason: AbortReason::TimedOut(_)
            })
        ));
        assert_eq!(scope.state(), AcquisitionState::Aborted);
        assert_eq!(scope.driver().count_calls(DriverOp::Stop), 1);
        assert_eq!(scope.driver().count_calls(DriverOp::GetValues), 0);
        assert_eq!(scope.pinned_buffers(), 0);
    }

    #[test]
    fn test_hardware_abort_status() {
        let mut scope = open_sim(SimulatedConfig {
            ready_status: PicoStatus::CANCELLED,
            ..SimulatedConfig::default()
        });
        assert!(matches!(
            scope.collect_block_immediate(),
            Err(PicoError::AcquisitionAborted {
                reason: AbortReason::Hardware(PicoStatus::CANCELLED)
            })
        ));
        assert_eq!(scope.pinned_buffers(), 0);
    }

    #[test]
    fn test_retrieval_failure() {
        let mut scope = scope();
        scope.driver_mut().fail(DriverOp::GetValues, PicoStatus::DATA_NOT_AVAILABLE);
        assert!(matches!(
            scope.collect_block_immediate(),
            Err(PicoError::DataRetrieval {
                step: Step::GetValues,
                status: PicoStatus::DATA_NOT_AVAILABLE
            })
        ));
        assert_eq!(scope.pinned_buffers(), 0);
    }

    #[test]
    fn test_streaming_immediate() {
        let mut scope = scope();
        scope.set_buffer_size(10).unwrap();
        scope.driver_mut().take_calls();

        let data = scope.collect_streaming_immediate().unwrap();
        assert_eq!(data.sample_count(), 10);
        assert_eq!(data.trigger_at(), None);
        assert_eq!(data.raw(ChannelId::A).unwrap().len(), 10);
        assert!(data
            .millivolts(ChannelId::B)
            .unwrap()
            .iter()
            .all(|v| (-5000..=5000).contains(v)));

        let calls = scope.driver().calls();
        assert!(calls.contains(&DriverCall::SetDataBuffers {
            channel: ChannelId::A,
            registered: true,
            length: 4096
        }));
        assert!(scope.driver().count_calls(DriverOp::GetStreamingLatestValues) >= 9);
        assert_eq!(calls.last(), Some(&DriverCall::Stop));

        assert_eq!(scope.pinned_buffers(), 4);
        drop(data);
        assert_eq!(scope.pinned_buffers(), 0);
    }

    #[test]
    fn test_streaming_interval_units() {
        let mut scope = scope();
        scope.set_buffer_size(10).unwrap();
        scope.driver_mut().take_calls();
        let data = scope.collect_streaming_immediate().unwrap();
        assert_eq!(data.time_interval_ns(), 12);
        let requests: Vec<StreamingRequest> = scope
            .driver()
            .calls()
            .iter()
            .filter_map(|call| match call {
                DriverCall::RunStreaming(request) => Some(*request),
                _ => None,
            })
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].sample_interval, 12_500);
        assert_eq!(requests[0].time_units, TimeUnits::Picoseconds);
        drop(data);

        scope.set_timebase(4).unwrap();
        scope.driver_mut().take_calls();
        let data = scope.collect_streaming_immediate().unwrap();
        assert_eq!(data.time_interval_ns(), 150);
        assert!(scope.driver().calls().iter().any(|call| matches!(
            call,
            DriverCall::RunStreaming(StreamingRequest {
                sample_interval: 150,
                time_units: TimeUnits::Nanoseconds,
                ..
            })
        )));
    }

    #[test]
    fn test_streaming_interval_conversion() {
        assert_eq!(streaming_interval(12.5), (12_500, TimeUnits::Picoseconds));
        assert_eq!(streaming_interval(25.0), (25, TimeUnits::Nanoseconds));
        assert_eq!(interval_to_ns(12_500, TimeUnits::Picoseconds), 12);
        assert_eq!(interval_to_ns(2, TimeUnits::Microseconds), 2_000);
    }

    #[test]
    fn test_streaming_triggered_reports_trigger_index() {
        let mut scope = scope();
        scope.set_buffer_size(10).unwrap();
        scope.add_trigger_conditions(TriggerConditions::new().channel_a(TriggerState::True));
        let data = scope.collect_streaming_triggered(3).unwrap();
        assert_eq!(data.sample_count(), 10);
        assert_eq!(data.trigger_at(), Some(3));
    }

    #[test]
    fn test_streaming_poll_failure_stops_device() {
        let mut scope = scope();
        scope
            .driver_mut()
            .fail(DriverOp::GetStreamingLatestValues, PicoStatus::BUSY);
        assert!(matches!(
            scope.collect_streaming_immediate(),
            Err(PicoError::DataRetrieval {
                step: Step::GetStreamingLatestValues,
                ..
            })
        ));
        assert_eq!(scope.pinned_buffers(), 0);
        assert_eq!(scope.driver().calls().last(), Some(&DriverCall::Stop));
    }

    #[test]
    fn test_async_capture_returns_scope() {
        let scope = scope();
        let pending = scope.collect_block_immediate_async();
        let (scope, result) = pending.wait();
        let data = result.unwrap();
        assert_eq!(data.sample_count(), 16);
        assert_eq!(scope.state(), AcquisitionState::Idle);
    }

    #[test]
    fn test_async_try_get_result_while_waiting() {
        let scope = open_sim(SimulatedConfig {
            ready_delay: Some(Duration::from_millis(300)),
            ..SimulatedConfig::default()
        });
        let pending = scope.collect_rapid_block_async(2);
        let pending = match pending.try_get_result() {
            Ok(_) => unreachable!("capture finished before the device was ready"),
            Err(pending) => pending,
        };
        let (scope, result) = pending.wait();
        let data = result.unwrap();
        assert_eq!(data.segment_count(), 2);
        assert_eq!(scope.pinned_buffers(), 2 * 2);
        drop(data);
        assert_eq!(scope.pinned_buffers(), 0);
    }

    #[test]
    fn test_async_cancel_stops_and_releases() {
        let mut scope = open_sim(SimulatedConfig {
            never_ready: true,
            ..SimulatedConfig::default()
        });
        scope.settings_mut().ready_timeout = None;
        let pending = scope.collect_block_immediate_async();
        pending.cancel();
        let (scope, result) = pending.wait();
        assert!(matches!(
            result,
            Err(PicoError::AcquisitionAborted {
                reason: AbortReason::Cancelled
            })
        ));
        assert_eq!(scope.pinned_buffers(), 0);
        assert_eq!(scope.driver().count_calls(DriverOp::Stop), 1);
    }

    #[test]
    fn test_cancel_while_idle_is_ignored() {
        let mut scope = open_sim(SimulatedConfig {
            ready_delay: Some(Duration::from_millis(20)),
            ..SimulatedConfig::default()
        });
        let handle = scope.cancel_handle();
        handle.cancel();

        let data = scope.collect_block_immediate().unwrap();
        assert_eq!(data.sample_count(), 16);
        assert_eq!(scope.state(), AcquisitionState::Idle);

        handle.cancel();
        assert!(scope.collect_block_immediate().is_ok());
    }

    #[test]
    fn test_cancel_from_another_thread_during_wait() {
        let mut scope = open_sim(SimulatedConfig {
            never_ready: true,
            ..SimulatedConfig::default()
        });
        scope.settings_mut().ready_timeout = Some(Duration::from_secs(5));
        let handle = scope.cancel_handle();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.cancel();
        });

        let result = scope.collect_block_immediate();
        canceller.join().unwrap();
        assert!(matches!(
            result,
            Err(PicoError::AcquisitionAborted {
                reason: AbortReason::Cancelled
            })
        ));
        assert_eq!(scope.pinned_buffers(), 0);

        scope.driver_mut().config_mut().never_ready = false;
        assert!(scope.collect_block_immediate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let mut scope = scope();
        scope.settings_mut().oversample = 0;
        assert!(matches!(
            scope.collect_block_immediate(),
            Err(PicoError::InvalidSetting(_))
        ));
        assert!(scope.set_buffer_size(0).is_err());
        assert!(matches!(
            PicoScope::open_with(
                SimulatedDriver::default(),
                AcquisitionSettings {
                    buffer_size: 0,
                    ..AcquisitionSettings::default()
                }
            ),
            Err(PicoError::InvalidSetting(_))
        ));
    }

    #[test]
    fn test_pre_trigger_larger_than_buffer() {
        let mut scope = scope();
        assert!(matches!(
            scope.collect_block_triggered(17),
            Err(PicoError::InvalidSetting(_))
        ));
    }

    #[test]
    fn test_settings_summary() {
        let mut scope = scope();
        scope
            .channel_mut(ChannelId::B)
            .unwrap()
            .set_range(VoltageRange::Range500mV)
            .unwrap()
            .set_enabled(false);
        assert_eq!(
            scope.settings_summary(),
            "Channel A Voltage Range = 5V\nChannel B Voltage Range = 500mV (disabled)"
        );
    }

    #[test]
    fn test_close() {
        assert!(scope().close().is_ok());

        let mut failing = scope();
        failing
            .driver_mut()
            .fail(DriverOp::CloseUnit, PicoStatus::NOT_RESPONDING);
        assert!(matches!(
            failing.close(),
            Err(PicoError::ConfigurationRejected {
                step: Step::CloseUnit,
                ..
            })
        ));
    }
}
