//! In-process stand-in for the vendor driver.
//!
//! [`SimulatedDriver`] answers every [`Driver`] call the way a 4000-series unit would,
//! generating a sine wave on each enabled channel. It records every call it receives
//! and can be told to fail chosen operations, which is how the engine's sequencing and
//! cleanup are tested without hardware.

use std::collections::HashMap;
use std::f64::consts::{FRAC_PI_2, PI};
use std::thread;
use std::time::Duration;

use crate::buffer::{lock_samples, SharedSamples};
use crate::calibration::{millivolts_to_adc, Model};
use crate::channel::{ChannelId, ChannelSettings, Coupling, ThresholdDirection, VoltageRange};
use crate::driver::{
    DownSamplingMode, Driver, Handle, ReadySignal, StreamingRequest, StreamingSlice,
    TimeUnits, TimebaseInfo, UnitInfo,
};
use crate::status::PicoStatus;
use crate::trigger_config::{PulseWidthQualifier, TriggerChannelProperties, TriggerConditions};

const SIMULATED_HANDLE: Handle = Handle(1);

/// Behaviour of the simulated unit.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Reported at unit-info index 3.
    pub variant: String,
    pub signal_amplitude_mv: f64,
    pub signal_frequency_hz: f64,
    /// `None` raises the ready signal before `run_block` returns.
    pub ready_delay: Option<Duration>,
    /// Status delivered with the ready signal.
    pub ready_status: PicoStatus,
    /// Never raise the ready signal.
    pub never_ready: bool,
    /// Timebases below this are rejected by `get_timebase`.
    pub min_timebase: u32,
    /// Total sample memory shared by all segments.
    pub memory_samples: u32,
    /// Samples delivered per streaming callback.
    pub streaming_chunk: u32,
    /// `open_unit` reports that no device was found.
    pub unavailable: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            variant: "4224".to_string(),
            signal_amplitude_mv: 2000.0,
            signal_frequency_hz: 1000.0,
            ready_delay: None,
            ready_status: PicoStatus::OK,
            never_ready: false,
            min_timebase: 0,
            memory_samples: 8 * 1024 * 1024,
            streaming_chunk: 4,
            unavailable: false,
        }
    }
}

/// Operation selector for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    OpenUnit,
    CloseUnit,
    UnitInfo,
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
    Stop,
    GetValues,
    GetValuesBulk,
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    OpenUnit,
    CloseUnit,
    UnitInfo(UnitInfo),
    SetChannel {
        channel: ChannelId,
        settings: ChannelSettings,
    },
    GetTimebase {
        timebase: u32,
        sample_count: u32,
        segment_index: u16,
    },
    SetTriggerChannelProperties {
        properties: Vec<TriggerChannelProperties>,
        auto_trigger_ms: i32,
    },
    SetTriggerChannelConditions(Vec<TriggerConditions>),
    SetTriggerChannelDirections([ThresholdDirection; 6]),
    SetTriggerDelay(u32),
    SetPulseWidthQualifier(PulseWidthQualifier),
    SetDataBuffers {
        channel: ChannelId,
        registered: bool,
        length: u32,
    },
    SetDataBufferBulk {
        channel: ChannelId,
        segment_index: u16,
    },
    MemorySegments(u16),
    SetNoOfCaptures(u16),
    RunBlock {
        pre_trigger_samples: u32,
        post_trigger_samples: u32,
        timebase: u32,
    },
    RunStreaming(StreamingRequest),
    GetStreamingLatestValues,
    Stop,
    GetValues {
        start_index: u32,
        sample_count: u32,
        downsample_ratio: u32,
    },
    GetValuesBulk {
        from_segment: u16,
        to_segment: u16,
    },
}

impl DriverCall {
    pub fn op(&self) -> DriverOp {
        match self {
            Self::OpenUnit => DriverOp::OpenUnit,
            Self::CloseUnit => DriverOp::CloseUnit,
            Self::UnitInfo(_) => DriverOp::UnitInfo,
            Self::SetChannel { .. } => DriverOp::SetChannel,
            Self::GetTimebase { .. } => DriverOp::GetTimebase,
            Self::SetTriggerChannelProperties { .. } => DriverOp::SetTriggerChannelProperties,
            Self::SetTriggerChannelConditions(_) => DriverOp::SetTriggerChannelConditions,
            Self::SetTriggerChannelDirections(_) => DriverOp::SetTriggerChannelDirections,
            Self::SetTriggerDelay(_) => DriverOp::SetTriggerDelay,
            Self::SetPulseWidthQualifier(_) => DriverOp::SetPulseWidthQualifier,
            Self::SetDataBuffers { .. } => DriverOp::SetDataBuffers,
            Self::SetDataBufferBulk { .. } => DriverOp::SetDataBufferBulk,
            Self::MemorySegments(_) => DriverOp::MemorySegments,
            Self::SetNoOfCaptures(_) => DriverOp::SetNoOfCaptures,
            Self::RunBlock { .. } => DriverOp::RunBlock,
            Self::RunStreaming(_) => DriverOp::RunStreaming,
            Self::GetStreamingLatestValues => DriverOp::GetStreamingLatestValues,
            Self::Stop => DriverOp::Stop,
            Self::GetValues { .. } => DriverOp::GetValues,
            Self::GetValuesBulk { .. } => DriverOp::GetValuesBulk,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureRule {
    successes_left: usize,
    status: PicoStatus,
}

#[derive(Debug, Default)]
struct Registration {
    max: Option<SharedSamples>,
    min: Option<SharedSamples>,
}

#[derive(Debug)]
struct BlockRun {
    total: u32,
    interval_ns: f64,
    captures: u16,
    first_sample: u64,
    ready: ReadySignal,
}

#[derive(Debug)]
struct StreamingRun {
    request: StreamingRequest,
    interval_ns: f64,
    first_sample: u64,
    delivered: u32,
    next_start: u32,
    polls: u64,
    trigger_armed: bool,
    triggered: bool,
    finished: bool,
}

#[derive(Debug)]
pub struct SimulatedDriver {
    config: SimulatedConfig,
    open: bool,
    channels: [ChannelSettings; 4],
    trigger_armed: bool,
    registrations: HashMap<ChannelId, Registration>,
    bulk: HashMap<(ChannelId, u16), SharedSamples>,
    segments: u16,
    captures: u16,
    block: Option<BlockRun>,
    streaming: Option<StreamingRun>,
    clock: u64,
    failures: HashMap<DriverOp, FailureRule>,
    calls: Vec<DriverCall>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl SimulatedDriver {
    pub fn new(config: SimulatedConfig) -> Self {
        let channel = ChannelSettings {
            enabled: true,
            coupling: Coupling::DC,
            range: VoltageRange::Range5V,
        };
        Self {
            config,
            open: false,
            channels: [channel; 4],
            trigger_armed: false,
            registrations: HashMap::new(),
            bulk: HashMap::new(),
            segments: 1,
            captures: 1,
            block: None,
            streaming: None,
            clock: 0,
            failures: HashMap::new(),
            calls: Vec::new(),
        }
    }

    pub fn config(&self) -> &SimulatedConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SimulatedConfig {
        &mut self.config
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Every call received so far, oldest first.
    pub fn calls(&self) -> &[DriverCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<DriverCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn count_calls(&self, op: DriverOp) -> usize {
        self.calls.iter().filter(|call| call.op() == op).count()
    }

    /// Make every future `op` call fail with `status`.
    pub fn fail(&mut self, op: DriverOp, status: PicoStatus) {
        self.fail_after(op, 0, status);
    }

    /// Let `successes` more `op` calls through, then fail every one after.
    pub fn fail_after(&mut self, op: DriverOp, successes: usize, status: PicoStatus) {
        self.failures.insert(
            op,
            FailureRule {
                successes_left: successes,
                status,
            },
        );
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    fn record(&mut self, call: DriverCall) -> Result<(), PicoStatus> {
        let op = call.op();
        self.calls.push(call);
        match self.failures.get_mut(&op) {
            Some(rule) if rule.successes_left > 0 => {
                rule.successes_left -= 1;
                Ok(())
            }
            Some(rule) => Err(rule.status),
            None => Ok(()),
        }
    }

    fn check_handle(&self, handle: Handle) -> Result<(), PicoStatus> {
        if self.open && handle == SIMULATED_HANDLE {
            Ok(())
        } else {
            Err(PicoStatus::INVALID_HANDLE)
        }
    }

    fn model(&self) -> Option<Model> {
        Model::from_variant_info(&self.config.variant)
    }

    fn interval_for_timebase(&self, timebase: u32) -> f64 {
        self.model().map_or_else(
            || (f64::from(timebase) + 1.0) * 100.0,
            |model| model.info().timebase.interval_for_timebase(timebase),
        )
    }

    fn enabled_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        ChannelId::ANALOG
            .into_iter()
            .filter(|ch| self.channels[ch.index()].enabled)
    }

    /// Sample `index` of the free-running signal on `channel`, with its over-range flag.
    fn sample(&self, channel: ChannelId, index: u64, interval_ns: f64) -> (i16, bool) {
        let t = index as f64 * interval_ns * 1e-9;
        let phase = channel.index() as f64 * FRAC_PI_2;
        let mv = self.config.signal_amplitude_mv
            * (2.0 * PI * self.config.signal_frequency_hz * t + phase).sin();
        let range = self.channels[channel.index()].range;
        let full_scale = f64::from(range.full_scale_mv());
        let over_range = mv.abs() > full_scale;
        let clamped = mv.clamp(-full_scale, full_scale);
        (millivolts_to_adc(clamped.round() as i32, range), over_range)
    }

    fn samples(&self, channel: ChannelId, first: u64, count: u32, interval_ns: f64) -> (Vec<i16>, bool) {
        let mut over_range = false;
        let values = (0..u64::from(count))
            .map(|i| {
                let (value, over) = self.sample(channel, first + i, interval_ns);
                over_range |= over;
                value
            })
            .collect();
        (values, over_range)
    }
}

fn write_into(target: &SharedSamples, offset: usize, values: &[i16]) {
    let mut samples = lock_samples(target);
    for (slot, value) in samples.iter_mut().skip(offset).zip(values) {
        *slot = *value;
    }
}

fn time_unit_ns(units: TimeUnits) -> f64 {
    match units {
        TimeUnits::Femtoseconds => 1e-6,
        TimeUnits::Picoseconds => 1e-3,
        TimeUnits::Nanoseconds => 1.0,
        TimeUnits::Microseconds => 1e3,
        TimeUnits::Milliseconds => 1e6,
        TimeUnits::Seconds => 1e9,
    }
}

impl Driver for SimulatedDriver {
    fn open_unit(&mut self) -> Result<Handle, PicoStatus> {
        self.record(DriverCall::OpenUnit)?;
        if self.config.unavailable {
            return Err(PicoStatus::NOT_FOUND);
        }
        if self.open {
            return Err(PicoStatus::MAX_UNITS_OPENED);
        }
        let count = self.model().map_or(2, |model| model.info().channel_count);
        for (index, channel) in self.channels.iter_mut().enumerate() {
            channel.enabled = index < count;
        }
        self.open = true;
        Ok(SIMULATED_HANDLE)
    }

    fn close_unit(&mut self, handle: Handle) -> Result<(), PicoStatus> {
        self.record(DriverCall::CloseUnit)?;
        self.check_handle(handle)?;
        self.open = false;
        self.registrations.clear();
        self.bulk.clear();
        self.block = None;
        self.streaming = None;
        Ok(())
    }

    fn unit_info(&mut self, handle: Handle, info: UnitInfo) -> Result<String, PicoStatus> {
        self.record(DriverCall::UnitInfo(info))?;
        self.check_handle(handle)?;
        Ok(match info {
            UnitInfo::DriverVersion => "1.0.0.0 (simulated)".to_string(),
            UnitInfo::UsbVersion => "2.0".to_string(),
            UnitInfo::HardwareVersion => "1".to_string(),
            UnitInfo::VariantInfo => self.config.variant.clone(),
            UnitInfo::BatchAndSerial => "SIM00/0001".to_string(),
            UnitInfo::CalDate => "01Jan26".to_string(),
            UnitInfo::KernelVersion => "1.0".to_string(),
        })
    }

    fn set_channel(
        &mut self,
        handle: Handle,
        channel: ChannelId,
        settings: ChannelSettings,
    ) -> Result<(), PicoStatus> {
        self.record(DriverCall::SetChannel { channel, settings })?;
        self.check_handle(handle)?;
        let count = self.model().map_or(2, |model| model.info().channel_count);
        if !channel.is_analog() || channel.index() >= count {
            return Err(PicoStatus::INVALID_CHANNEL);
        }
        self.channels[channel.index()] = settings;
        Ok(())
    }

    fn get_timebase(
        &mut self,
        handle: Handle,
        timebase: u32,
        sample_count: u32,
        oversample: u16,
        segment_index: u16,
    ) -> Result<TimebaseInfo, PicoStatus> {
        self.record(DriverCall::GetTimebase {
            timebase,
            sample_count,
            segment_index,
        })?;
        self.check_handle(handle)?;
        if timebase < self.config.min_timebase {
            return Err(PicoStatus::INVALID_TIMEBASE);
        }
        if segment_index >= self.segments {
            return Err(PicoStatus::SEGMENT_OUT_OF_RANGE);
        }
        let max_samples =
            self.config.memory_samples / u32::from(self.segments) / u32::from(oversample.max(1));
        if sample_count > max_samples {
            return Err(PicoStatus::TOO_MANY_SAMPLES);
        }
        Ok(TimebaseInfo {
            time_interval_ns: self.interval_for_timebase(timebase) as i32,
            max_samples: max_samples as i32,
        })
    }

    fn set_trigger_channel_properties(
        &mut self,
        handle: Handle,
        properties: &[TriggerChannelProperties],
        _aux_output_enabled: bool,
        auto_trigger_ms: i32,
    ) -> Result<(), PicoStatus> {
        self.record(DriverCall::SetTriggerChannelProperties {
            properties: properties.to_vec(),
            auto_trigger_ms,
        })?;
        self.check_handle(handle)
    }

    fn set_trigger_channel_conditions(
        &mut self,
        handle: Handle,
        conditions: &[TriggerConditions],
    ) -> Result<(), PicoStatus> {
        self.record(DriverCall::SetTriggerChannelConditions(conditions.to_vec()))?;
        self.check_handle(handle)?;
        self.trigger_armed = !conditions.is_empty();
        Ok(())
    }

    fn set_trigger_channel_directions(
        &mut self,
        handle: Handle,
        directions: [ThresholdDirection; 6],
    ) -> Result<(), PicoStatus> {
        self.record(DriverCall::SetTriggerChannelDirections(directions))?;
        self.check_handle(handle)
    }

    fn set_trigger_delay(&mut self, handle: Handle, delay: u32) -> Result<(), PicoStatus> {
        self.record(DriverCall::SetTriggerDelay(delay))?;
        self.check_handle(handle)
    }

    fn set_pulse_width_qualifier(
        &mut self,
        handle: Handle,
        qualifier: &PulseWidthQualifier,
    ) -> Result<(), PicoStatus> {
        self.record(DriverCall::SetPulseWidthQualifier(qualifier.clone()))?;
        self.check_handle(handle)
    }

    fn set_data_buffers(
        &mut self,
        handle: Handle,
        channel: ChannelId,
        max: Option<SharedSamples>,
        min: Option<SharedSamples>,
        length: u32,
    ) -> Result<(), PicoStatus> {
        self.record(DriverCall::SetDataBuffers {
            channel,
            registered: max.is_some(),
            length,
        })?;
        self.check_handle(handle)?;
        if max.is_none() && min.is_none() {
            self.registrations.remove(&channel);
        } else {
            self.registrations.insert(channel, Registration { max, min });
        }
        Ok(())
    }

    fn set_data_buffer_bulk(
        &mut self,
        handle: Handle,
        channel: ChannelId,
        buffer: SharedSamples,
        _length: u32,
        segment_index: u16,
    ) -> Result<(), PicoStatus> {
        self.record(DriverCall::SetDataBufferBulk {
            channel,
            segment_index,
        })?;
        self.check_handle(handle)?;
        if segment_index >= self.segments {
            return Err(PicoStatus::SEGMENT_OUT_OF_RANGE);
        }
        self.bulk.insert((channel, segment_index), buffer);
        Ok(())
    }

    fn memory_segments(&mut self, handle: Handle, segment_count: u16) -> Result<u32, PicoStatus> {
        self.record(DriverCall::MemorySegments(segment_count))?;
        self.check_handle(handle)?;
        if segment_count == 0 || u32::from(segment_count) > self.config.memory_samples {
            return Err(PicoStatus::TOO_MANY_SEGMENTS);
        }
        self.segments = segment_count;
        self.bulk.clear();
        Ok(self.config.memory_samples / u32::from(segment_count))
    }

    fn set_no_of_captures(&mut self, handle: Handle, capture_count: u16) -> Result<(), PicoStatus> {
        self.record(DriverCall::SetNoOfCaptures(capture_count))?;
        self.check_handle(handle)?;
        if capture_count == 0 || capture_count > self.segments {
            return Err(PicoStatus::TOO_MANY_SEGMENTS);
        }
        self.captures = capture_count;
        Ok(())
    }

    fn run_block(
        &mut self,
        handle: Handle,
        pre_trigger_samples: u32,
        post_trigger_samples: u32,
        timebase: u32,
        _oversample: u16,
        _segment_index: u16,
        ready: ReadySignal,
    ) -> Result<i32, PicoStatus> {
        self.record(DriverCall::RunBlock {
            pre_trigger_samples,
            post_trigger_samples,
            timebase,
        })?;
        self.check_handle(handle)?;
        let total = pre_trigger_samples + post_trigger_samples;
        let interval_ns = self.interval_for_timebase(timebase);
        self.block = Some(BlockRun {
            total,
            interval_ns,
            captures: self.captures,
            first_sample: self.clock,
            ready: ready.clone(),
        });
        self.clock += u64::from(total) * u64::from(self.captures);

        let status = self.config.ready_status;
        if self.config.never_ready {
            log::debug!("simulated block run will never complete");
        } else if let Some(delay) = self.config.ready_delay {
            thread::spawn(move || {
                thread::sleep(delay);
                ready.complete(status);
            });
        } else {
            ready.complete(status);
        }
        let duration_ms = f64::from(total) * interval_ns * f64::from(self.captures) / 1e6;
        Ok(duration_ms.ceil() as i32)
    }

    fn run_streaming(&mut self, handle: Handle, request: StreamingRequest) -> Result<u32, PicoStatus> {
        self.record(DriverCall::RunStreaming(request))?;
        self.check_handle(handle)?;
        if request.sample_interval == 0 {
            return Err(PicoStatus::INVALID_SAMPLE_INTERVAL);
        }
        if self.enabled_channels().any(|ch| {
            !matches!(
                self.registrations.get(&ch),
                Some(Registration { max: Some(_), .. })
            )
        }) {
            return Err(PicoStatus::INVALID_BUFFER);
        }
        self.streaming = Some(StreamingRun {
            request,
            interval_ns: f64::from(request.sample_interval) * time_unit_ns(request.time_units),
            first_sample: self.clock,
            delivered: 0,
            next_start: 0,
            polls: 0,
            trigger_armed: self.trigger_armed,
            triggered: false,
            finished: false,
        });
        Ok(request.sample_interval)
    }

    fn get_streaming_latest_values(
        &mut self,
        handle: Handle,
    ) -> Result<Option<StreamingSlice>, PicoStatus> {
        self.record(DriverCall::GetStreamingLatestValues)?;
        self.check_handle(handle)?;
        let chunk = self.config.streaming_chunk.max(1);
        let Some(run) = self.streaming.as_mut() else {
            return Err(PicoStatus::INVALID_CALL);
        };
        if run.finished {
            return Ok(None);
        }
        // Every third poll has nothing, every third delivers an empty slice.
        run.polls += 1;
        match run.polls % 3 {
            1 => return Ok(None),
            2 => return Ok(Some(StreamingSlice::default())),
            _ => {}
        }

        let request = run.request;
        let total = request.max_pre_trigger_samples + request.max_post_trigger_samples;
        let count = if request.auto_stop {
            chunk.min(total.saturating_sub(run.delivered))
        } else {
            chunk
        };
        let overview = request.overview_buffer_size;
        let start = if run.next_start + count > overview {
            0
        } else {
            run.next_start
        };
        let delivered = run.delivered;
        let first = run.first_sample + u64::from(delivered);
        let interval_ns = run.interval_ns;
        let trigger_now = run.trigger_armed
            && !run.triggered
            && delivered + count > request.max_pre_trigger_samples;

        let mut overflow = 0u16;
        let targets: Vec<(ChannelId, Vec<SharedSamples>)> = self
            .enabled_channels()
            .filter_map(|ch| {
                let registration = self.registrations.get(&ch)?;
                let buffers = registration.max.iter().chain(registration.min.iter()).cloned().collect();
                Some((ch, buffers))
            })
            .collect();
        for (channel, buffers) in targets {
            let (values, over_range) = self.samples(channel, first, count, interval_ns);
            if over_range {
                overflow |= 1 << channel.index();
            }
            for buffer in &buffers {
                write_into(buffer, start as usize, &values);
            }
        }

        let Some(run) = self.streaming.as_mut() else {
            return Err(PicoStatus::INVALID_CALL);
        };
        run.delivered += count;
        run.next_start = start + count;
        run.triggered |= trigger_now;
        let auto_stop = request.auto_stop && run.delivered >= total;
        run.finished = auto_stop;
        Ok(Some(StreamingSlice {
            sample_count: count,
            start_index: start,
            overflow,
            trigger_at: if trigger_now {
                request.max_pre_trigger_samples.saturating_sub(delivered)
            } else {
                0
            },
            triggered: trigger_now,
            auto_stop,
        }))
    }

    fn stop(&mut self, handle: Handle) -> Result<(), PicoStatus> {
        self.record(DriverCall::Stop)?;
        self.check_handle(handle)?;
        self.streaming = None;
        Ok(())
    }

    fn get_values(
        &mut self,
        handle: Handle,
        start_index: u32,
        sample_count: &mut u32,
        downsample_ratio: u32,
        mode: DownSamplingMode,
        _segment_index: u16,
    ) -> Result<u16, PicoStatus> {
        self.record(DriverCall::GetValues {
            start_index,
            sample_count: *sample_count,
            downsample_ratio,
        })?;
        self.check_handle(handle)?;
        let Some(run) = self.block.as_ref() else {
            return Err(PicoStatus::NO_SAMPLES_AVAILABLE);
        };
        if !run.ready.is_ready() {
            return Err(PicoStatus::BUSY);
        }
        let (total, first, interval_ns) = (run.total, run.first_sample, run.interval_ns);
        if start_index >= total {
            return Err(PicoStatus::STARTINDEX_INVALID);
        }
        let ratio = if mode == DownSamplingMode::Aggregate {
            downsample_ratio.max(1)
        } else {
            1
        };
        let available = total - start_index;
        let produced = available.div_ceil(ratio).min(*sample_count);

        let mut overflow = 0u16;
        for channel in self.enabled_channels().collect::<Vec<_>>() {
            let Some(registration) = self.registrations.get(&channel) else {
                continue;
            };
            let (max_target, min_target) = (registration.max.clone(), registration.min.clone());
            let (raw, over_range) =
                self.samples(channel, first + u64::from(start_index), available, interval_ns);
            if over_range {
                overflow |= 1 << channel.index();
            }
            let windows = raw.chunks(ratio as usize).take(produced as usize);
            let (maxima, minima): (Vec<i16>, Vec<i16>) = windows
                .map(|window| {
                    let hi = window.iter().copied().max().unwrap_or_default();
                    let lo = window.iter().copied().min().unwrap_or_default();
                    (hi, lo)
                })
                .unzip();
            if let Some(target) = &max_target {
                write_into(target, 0, &maxima);
            }
            if let Some(target) = &min_target {
                write_into(target, 0, &minima);
            }
        }
        *sample_count = produced;
        Ok(overflow)
    }

    fn get_values_bulk(
        &mut self,
        handle: Handle,
        sample_count: &mut u32,
        from_segment: u16,
        to_segment: u16,
    ) -> Result<Vec<u16>, PicoStatus> {
        self.record(DriverCall::GetValuesBulk {
            from_segment,
            to_segment,
        })?;
        self.check_handle(handle)?;
        let Some(run) = self.block.as_ref() else {
            return Err(PicoStatus::NO_SAMPLES_AVAILABLE);
        };
        if !run.ready.is_ready() {
            return Err(PicoStatus::BUSY);
        }
        if from_segment > to_segment || to_segment >= run.captures {
            return Err(PicoStatus::SEGMENT_OUT_OF_RANGE);
        }
        let (total, first, interval_ns) = (run.total, run.first_sample, run.interval_ns);
        let count = total.min(*sample_count);

        let mut overflows = Vec::new();
        for segment in from_segment..=to_segment {
            let mut overflow = 0u16;
            let segment_start = first + u64::from(segment) * u64::from(total);
            for channel in self.enabled_channels().collect::<Vec<_>>() {
                let Some(target) = self.bulk.get(&(channel, segment)).cloned() else {
                    return Err(PicoStatus::NULL_PARAMETER);
                };
                let (values, over_range) = self.samples(channel, segment_start, count, interval_ns);
                if over_range {
                    overflow |= 1 << channel.index();
                }
                write_into(&target, 0, &values);
            }
            overflows.push(overflow);
        }
        *sample_count = count;
        Ok(overflows)
    }
}
