//! Capture results.
//!
//! A [`BlockData`] owns the buffers its capture filled and converts them to millivolts only
//! when asked, using the range and attenuation in force when the capture ran. Once
//! [`BlockData::dispose`] has been called (or the value is dropped) the buffers are gone
//! and every accessor reports a [`PicoError::BufferProtocolViolation`].

use std::fmt;
use std::io::Write;

use polars::prelude::*;

use crate::buffer::CaptureBuffer;
use crate::calibration::adc_to_millivolts;
use crate::channel::{ChannelId, VoltageRange};
use crate::pico_scope::PicoError;
use crate::render::{render, RenderOptions};

pub const TIME_COLUMN_NAME: &str = "time_ns";
const ROW_INDEX_COLUMN_NAME: &str = "row_index";

/// Samples of one channel and the front-end settings they were taken with.
#[derive(Debug)]
pub struct ChannelTrace {
    channel: ChannelId,
    range: VoltageRange,
    attenuation: u16,
    max: CaptureBuffer,
    min: Option<CaptureBuffer>,
}

impl ChannelTrace {
    pub(crate) fn new(
        channel: ChannelId,
        range: VoltageRange,
        attenuation: u16,
        max: CaptureBuffer,
        min: Option<CaptureBuffer>,
    ) -> Self {
        Self {
            channel,
            range,
            attenuation,
            max,
            min,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn range(&self) -> VoltageRange {
        self.range
    }

    pub fn attenuation(&self) -> u16 {
        self.attenuation
    }

    pub(crate) fn max_buffer(&self) -> &CaptureBuffer {
        &self.max
    }

    pub(crate) fn min_buffer(&self) -> Option<&CaptureBuffer> {
        self.min.as_ref()
    }

    fn to_millivolts(&self, raw: &[i16]) -> Vec<i32> {
        raw.iter()
            .map(|&value| adc_to_millivolts(value, self.range, self.attenuation))
            .collect()
    }

    fn release(&mut self) {
        self.max.release();
        if let Some(min) = self.min.as_mut() {
            min.release();
        }
    }
}

/// Result of a block or streaming capture.
#[derive(Debug)]
pub struct BlockData {
    sample_count: usize,
    time_interval_ns: i64,
    downsample_ratio: u32,
    overflow: u16,
    trigger_at: Option<usize>,
    traces: Vec<ChannelTrace>,
    disposed: bool,
}

impl BlockData {
    pub(crate) fn new(
        sample_count: usize,
        time_interval_ns: i64,
        downsample_ratio: u32,
        overflow: u16,
        trigger_at: Option<usize>,
        traces: Vec<ChannelTrace>,
    ) -> Self {
        Self {
            sample_count,
            time_interval_ns,
            downsample_ratio,
            overflow,
            trigger_at,
            traces,
            disposed: false,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn time_interval_ns(&self) -> i64 {
        self.time_interval_ns
    }

    pub fn downsample_ratio(&self) -> u32 {
        self.downsample_ratio
    }

    /// Whether min buffers carry aggregate minima distinct from the max buffers.
    pub fn has_min_max(&self) -> bool {
        self.downsample_ratio > 1 && self.traces.iter().all(|trace| trace.min.is_some())
    }

    /// Sample index at which the trigger fired, when the driver reported one.
    pub fn trigger_at(&self) -> Option<usize> {
        self.trigger_at
    }

    pub fn overflow(&self) -> u16 {
        self.overflow
    }

    /// Whether the input on `channel` exceeded the selected range during the capture.
    pub fn is_over_range(&self, channel: ChannelId) -> bool {
        self.overflow & (1 << channel.index()) != 0
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.traces.iter().map(ChannelTrace::channel).collect()
    }

    pub fn traces(&self) -> &[ChannelTrace] {
        &self.traces
    }

    pub fn trace(&self, channel: ChannelId) -> Result<&ChannelTrace, PicoError> {
        self.traces
            .iter()
            .find(|trace| trace.channel == channel)
            .ok_or(PicoError::ChannelNotCaptured(channel))
    }

    /// Time between consecutive rows. An aggregated row spans `downsample_ratio` samples.
    pub fn row_interval_ns(&self) -> i64 {
        self.time_interval_ns * i64::from(self.downsample_ratio.max(1))
    }

    pub fn time_ns(&self, index: usize) -> i64 {
        index as i64 * self.row_interval_ns()
    }

    pub fn times_ns(&self) -> Vec<i64> {
        (0..self.sample_count).map(|i| self.time_ns(i)).collect()
    }

    pub fn raw(&self, channel: ChannelId) -> Result<Vec<i16>, PicoError> {
        let trace = self.trace(channel)?;
        self.read(trace.max_buffer())
    }

    pub fn millivolts(&self, channel: ChannelId) -> Result<Vec<i32>, PicoError> {
        let trace = self.trace(channel)?;
        Ok(trace.to_millivolts(&self.read(trace.max_buffer())?))
    }

    /// Aggregate minima, for captures that registered min buffers.
    pub fn min_raw(&self, channel: ChannelId) -> Result<Option<Vec<i16>>, PicoError> {
        let trace = self.trace(channel)?;
        trace.min_buffer().map(|buffer| self.read(buffer)).transpose()
    }

    pub fn min_millivolts(&self, channel: ChannelId) -> Result<Option<Vec<i32>>, PicoError> {
        let trace = self.trace(channel)?;
        Ok(self
            .min_raw(channel)?
            .map(|raw| trace.to_millivolts(&raw)))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Release every buffer this result owns. Calling it again does nothing.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        for trace in &mut self.traces {
            trace.release();
        }
        self.disposed = true;
        log::trace!("disposed block data with {} traces", self.traces.len());
    }

    fn read(&self, buffer: &CaptureBuffer) -> Result<Vec<i16>, PicoError> {
        if self.disposed {
            return Err(PicoError::BufferProtocolViolation(
                "block data read after dispose".to_string(),
            ));
        }
        buffer.snapshot(self.sample_count).ok_or_else(|| {
            PicoError::BufferProtocolViolation("buffer read after release".to_string())
        })
    }

    /// Time column plus raw and millivolt columns for every captured channel.
    pub fn to_dataframe(&self) -> Result<DataFrame, PicoError> {
        let mut columns: Vec<Column> = Vec::new();
        for trace in &self.traces {
            let name = trace.channel.name();
            let raw = self.read(trace.max_buffer())?;
            columns.push(int_column(format!("{name}_max_adc"), raw.iter().map(|&v| i32::from(v))));
            columns.push(int_column(format!("{name}_max_mv"), trace.to_millivolts(&raw)));
            if self.has_min_max() {
                if let Some(buffer) = trace.min_buffer() {
                    let raw = self.read(buffer)?;
                    columns.push(int_column(format!("{name}_min_adc"), raw.iter().map(|&v| i32::from(v))));
                    columns.push(int_column(format!("{name}_min_mv"), trace.to_millivolts(&raw)));
                }
            }
        }
        let names: Vec<String> = columns.iter().map(|c| c.name().to_string()).collect();

        let df = DataFrame::new(columns)?
            .lazy()
            .with_row_index(ROW_INDEX_COLUMN_NAME, Some(0))
            .with_columns([(col(ROW_INDEX_COLUMN_NAME).cast(DataType::Int64)
                * lit(self.row_interval_ns()))
            .alias(TIME_COLUMN_NAME)])
            .select(
                std::iter::once(col(TIME_COLUMN_NAME))
                    .chain(names.iter().map(|name| col(name.as_str())))
                    .collect::<Vec<_>>(),
            )
            .collect()?;
        Ok(df)
    }

    /// Write [`Self::to_dataframe`] as CSV.
    pub fn write_csv<W: Write>(&self, writer: W, separator: u8) -> Result<(), PicoError> {
        let mut df = self.to_dataframe()?;
        CsvWriter::new(writer)
            .include_header(true)
            .with_separator(separator)
            .finish(&mut df)?;
        Ok(())
    }
}

fn int_column(name: String, values: impl IntoIterator<Item = i32>) -> Column {
    Series::new(name.into(), values.into_iter().collect::<Vec<i32>>()).into()
}

impl Drop for BlockData {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Display for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match render(self, &RenderOptions::default()) {
            Ok(text) => f.write_str(&text),
            Err(e) => write!(f, "{e}"),
        }
    }
}

/// Result of a rapid block capture: one [`BlockData`] per segment.
#[derive(Debug)]
pub struct RapidBlockData {
    segments: Vec<BlockData>,
}

impl RapidBlockData {
    pub(crate) fn new(segments: Vec<BlockData>) -> Self {
        Self { segments }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> Option<&BlockData> {
        self.segments.get(index)
    }

    pub fn segments(&self) -> &[BlockData] {
        &self.segments
    }

    pub fn raw(&self, channel: ChannelId, segment: usize) -> Result<Vec<i16>, PicoError> {
        self.segment_or_err(segment)?.raw(channel)
    }

    pub fn millivolts(&self, channel: ChannelId, segment: usize) -> Result<Vec<i32>, PicoError> {
        self.segment_or_err(segment)?.millivolts(channel)
    }

    pub fn dispose(&mut self) {
        for segment in &mut self.segments {
            segment.dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.segments.iter().all(BlockData::is_disposed)
    }

    fn segment_or_err(&self, segment: usize) -> Result<&BlockData, PicoError> {
        self.segments.get(segment).ok_or_else(|| {
            PicoError::InvalidSetting(format!(
                "segment {segment} out of range (captured {})",
                self.segments.len()
            ))
        })
    }
}

impl fmt::Display for RapidBlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            writeln!(f, "Segment {index}")?;
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{lock_samples, BufferLedger};

    fn block(ledger: &BufferLedger, ratio: u32) -> BlockData {
        let max = ledger.allocate(4);
        let min = ledger.allocate(4);
        lock_samples(&max.driver_view()).copy_from_slice(&[32764, 16382, -32764, 0]);
        lock_samples(&min.driver_view()).copy_from_slice(&[-100, -200, -32764, -1]);
        let trace = ChannelTrace::new(ChannelId::A, VoltageRange::Range5V, 10, max, Some(min));
        BlockData::new(3, 100, ratio, 0b10, None, vec![trace])
    }

    #[test]
    fn test_accessors_apply_calibration_lazily() {
        let ledger = BufferLedger::new();
        let data = block(&ledger, 1);
        assert_eq!(data.sample_count(), 3);
        assert_eq!(data.raw(ChannelId::A).unwrap(), vec![32764, 16382, -32764]);
        assert_eq!(data.millivolts(ChannelId::A).unwrap(), vec![50000, 25000, -50000]);
        assert_eq!(data.times_ns(), vec![0, 100, 200]);
        assert!(!data.has_min_max());
    }

    #[test]
    fn test_missing_channel() {
        let ledger = BufferLedger::new();
        let data = block(&ledger, 1);
        assert!(matches!(
            data.raw(ChannelId::B),
            Err(PicoError::ChannelNotCaptured(ChannelId::B))
        ));
        assert_eq!(data.channels(), vec![ChannelId::A]);
    }

    #[test]
    fn test_dispose_releases_once() {
        let ledger = BufferLedger::new();
        let mut data = block(&ledger, 1);
        assert_eq!(ledger.outstanding(), 2);

        data.dispose();
        assert_eq!(ledger.outstanding(), 0);
        data.dispose();
        assert_eq!(ledger.outstanding(), 0);

        assert!(matches!(
            data.raw(ChannelId::A),
            Err(PicoError::BufferProtocolViolation(_))
        ));
        assert!(data.to_dataframe().is_err());
        drop(data);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_overflow_flags() {
        let ledger = BufferLedger::new();
        let data = block(&ledger, 1);
        assert!(!data.is_over_range(ChannelId::A));
        assert!(data.is_over_range(ChannelId::B));
    }

    #[test]
    fn test_min_values() {
        let ledger = BufferLedger::new();
        let data = block(&ledger, 4);
        assert!(data.has_min_max());
        assert_eq!(data.min_raw(ChannelId::A).unwrap(), Some(vec![-100, -200, -32764]));
        assert_eq!(
            data.min_millivolts(ChannelId::A).unwrap(),
            Some(vec![-152, -305, -50000])
        );
    }

    #[test]
    fn test_to_dataframe() {
        let ledger = BufferLedger::new();
        let data = block(&ledger, 4);
        let df = data.to_dataframe().unwrap();
        assert_eq!(df.height(), 3);
        let names: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
        assert_eq!(
            names,
            vec!["time_ns", "A_max_adc", "A_max_mv", "A_min_adc", "A_min_mv"]
        );
        let times: Vec<i64> = df
            .column(TIME_COLUMN_NAME)
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(times, vec![0, 400, 800]);
    }

    #[test]
    fn test_downsampled_time_axis() {
        let ledger = BufferLedger::new();
        let data = block(&ledger, 2);
        assert_eq!(data.time_interval_ns(), 100);
        assert_eq!(data.row_interval_ns(), 200);
        assert_eq!(data.times_ns(), vec![0, 200, 400]);
        assert_eq!(data.time_ns(2), 400);

        let df = data.to_dataframe().unwrap();
        let times: Vec<i64> = df
            .column(TIME_COLUMN_NAME)
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(times, vec![0, 200, 400]);
    }

    #[test]
    fn test_write_csv() {
        let ledger = BufferLedger::new();
        let data = block(&ledger, 1);
        let mut out = Vec::new();
        data.write_csv(&mut out, b',').unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("time_ns,A_max_adc,A_max_mv"));
        assert_eq!(lines.next(), Some("0,32764,50000"));
    }
}
