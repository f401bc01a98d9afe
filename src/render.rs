//! Plain-text table rendering of capture results.

use std::fmt;

use crate::block_data::{BlockData, ChannelTrace};
use crate::calibration::adc_to_millivolts;
use crate::pico_scope::PicoError;

const COLUMN_WIDTH: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub delimiter: String,
    pub ignore_header: bool,
    pub show_adc: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            delimiter: " ".to_string(),
            ignore_header: false,
            show_adc: true,
        }
    }
}

struct Columns<'a> {
    trace: &'a ChannelTrace,
    max: Vec<i16>,
    min: Option<Vec<i16>>,
}

struct Table<'a> {
    data: &'a BlockData,
    options: &'a RenderOptions,
    columns: Vec<Columns<'a>>,
}

/// Render a capture as a fixed-width table: a time column in nanoseconds followed by max
/// (and, when downsampled, min) columns for every captured channel.
///
/// ```
/// use ps4000_rs::{PicoScope, RenderOptions};
/// use ps4000_rs::simulated::SimulatedDriver;
///
/// let mut scope = PicoScope::open(SimulatedDriver::default())?;
/// scope.set_buffer_size(4)?;
/// let data = scope.collect_block_immediate()?;
/// let options = RenderOptions { delimiter: ";".to_string(), ..RenderOptions::default() };
/// let text = ps4000_rs::render::render(&data, &options)?;
/// assert!(text.starts_with("   Time [ns];"));
/// # Ok::<(), ps4000_rs::PicoError>(())
/// ```
pub fn render(data: &BlockData, options: &RenderOptions) -> Result<String, PicoError> {
    let with_min = data.has_min_max();
    let columns = data
        .traces()
        .iter()
        .map(|trace| {
            let max = data.raw(trace.channel())?;
            let min = if with_min {
                data.min_raw(trace.channel())?
            } else {
                None
            };
            Ok(Columns { trace, max, min })
        })
        .collect::<Result<Vec<_>, PicoError>>()?;

    let table = Table {
        data,
        options,
        columns,
    };
    Ok(table.to_string())
}

impl Table<'_> {
    fn write_header(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let delimiter = self.options.delimiter.as_str();
        write!(f, "{:>COLUMN_WIDTH$}", "Time [ns]")?;
        for column in &self.columns {
            let name = column.trace.channel();
            if self.options.show_adc {
                write!(f, "{delimiter}{:>COLUMN_WIDTH$}", format!("{name} Max [ADC]"))?;
            }
            write!(f, "{delimiter}{:>COLUMN_WIDTH$}", format!("{name} Max [mV]"))?;
            if column.min.is_some() {
                if self.options.show_adc {
                    write!(f, "{delimiter}{:>COLUMN_WIDTH$}", format!("{name} Min [ADC]"))?;
                }
                write!(f, "{delimiter}{:>COLUMN_WIDTH$}", format!("{name} Min [mV]"))?;
            }
        }
        writeln!(f)
    }

    fn write_value(
        &self,
        f: &mut fmt::Formatter<'_>,
        trace: &ChannelTrace,
        raw: Option<&i16>,
    ) -> fmt::Result {
        let delimiter = self.options.delimiter.as_str();
        let raw = raw.copied().unwrap_or_default();
        if self.options.show_adc {
            write!(f, "{delimiter}{raw:>COLUMN_WIDTH$}")?;
        }
        let mv = adc_to_millivolts(raw, trace.range(), trace.attenuation());
        write!(f, "{delimiter}{mv:>COLUMN_WIDTH$}")
    }
}

impl fmt::Display for Table<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.options.ignore_header {
            self.write_header(f)?;
        }
        for row in 0..self.data.sample_count() {
            write!(f, "{:>COLUMN_WIDTH$}", self.data.time_ns(row))?;
            for column in &self.columns {
                self.write_value(f, column.trace, column.max.get(row))?;
                if let Some(min) = &column.min {
                    self.write_value(f, column.trace, min.get(row))?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
