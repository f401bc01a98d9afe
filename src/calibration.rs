//! Conversions between raw ADC counts and millivolts, and between sampling intervals
//! and the driver's timebase index.
//!
//! Timebase math differs per hardware variant. Each supported model carries a
//! [`TimebaseFormula`] in the [`MODELS`] table; supporting a new variant means adding a row.

use std::fmt;

use crate::channel::VoltageRange;

/// Largest ADC count the 4000 series reports for a full-scale input.
pub const MAX_ADC_VALUE: i32 = 32764;

pub const DUAL_SCOPE: usize = 2;
pub const QUAD_SCOPE: usize = 4;

/// Raw ADC count to millivolts at the probe tip. Integer arithmetic, truncating.
pub fn adc_to_millivolts(raw: i16, range: VoltageRange, attenuation: u16) -> i32 {
    let mv = i64::from(attenuation) * i64::from(raw) * i64::from(range.full_scale_mv())
        / i64::from(MAX_ADC_VALUE);
    mv as i32
}

/// Millivolts at the ADC input to a raw count, saturating at the `i16` limits.
pub fn millivolts_to_adc(millivolts: i32, range: VoltageRange) -> i16 {
    let raw = i64::from(millivolts) * i64::from(MAX_ADC_VALUE) / i64::from(range.full_scale_mv());
    raw.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    PS4223,
    PS4224,
    PS4423,
    PS4424,
    PS4226,
    PS4227,
    PS4262,
}

impl Model {
    pub fn info(self) -> &'static ModelInfo {
        match self {
            Self::PS4223 => &MODELS[0],
            Self::PS4224 => &MODELS[1],
            Self::PS4423 => &MODELS[2],
            Self::PS4424 => &MODELS[3],
            Self::PS4226 => &MODELS[4],
            Self::PS4227 => &MODELS[5],
            Self::PS4262 => &MODELS[6],
        }
    }

    /// Resolve the variant reported at unit-info index 3. Only the first four characters count.
    pub fn from_variant_info(variant: &str) -> Option<Self> {
        let code: u16 = variant.trim().get(..4)?.parse().ok()?;
        MODELS.iter().find(|info| info.variant == code).map(|info| info.model)
    }

    pub fn variant(self) -> u16 {
        self.info().variant
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PS{}", self.variant())
    }
}

/// Forward and inverse timebase conversion for one family of variants.
#[derive(Clone, Copy)]
pub struct TimebaseFormula {
    interval_to_timebase: fn(f64) -> u32,
    timebase_to_interval: fn(u32) -> f64,
}

impl TimebaseFormula {
    /// Candidate timebase for a sampling interval. In the linear regime the candidate is
    /// rounded up so its interval is never shorter than requested.
    pub fn timebase_for_interval(&self, interval_ns: f64) -> u32 {
        (self.interval_to_timebase)(interval_ns)
    }

    pub fn interval_for_timebase(&self, timebase: u32) -> f64 {
        (self.timebase_to_interval)(timebase)
    }
}

impl fmt::Debug for TimebaseFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimebaseFormula").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    pub model: Model,
    pub variant: u16,
    pub min_range: VoltageRange,
    pub max_range: VoltageRange,
    pub channel_count: usize,
    pub timebase: TimebaseFormula,
}

// Slack for float error before rounding up, so exact multiples are not pushed to the next step.
const ROUNDING_SLACK: f64 = 1e-9;

fn ceil_index(value: f64) -> u32 {
    if value <= 0.0 {
        0
    } else {
        (value - ROUNDING_SLACK).ceil().max(0.0) as u32
    }
}

// 80 MS/s parts: 12.5 ns doubling up to timebase 2, then 50 ns steps.
fn fast_to_timebase(interval_ns: f64) -> u32 {
    if interval_ns <= 50.0 {
        ceil_index((interval_ns / 12.5).log2())
    } else {
        ceil_index(interval_ns / 50.0) + 1
    }
}

fn fast_to_interval(timebase: u32) -> f64 {
    if timebase <= 2 {
        f64::from(1u32 << timebase) * 12.5
    } else {
        f64::from(timebase - 1) * 50.0
    }
}

// 250 MS/s parts: 4 ns doubling up to timebase 3, then 32 ns steps.
fn high_speed_to_timebase(interval_ns: f64) -> u32 {
    if interval_ns <= 32.0 {
        ceil_index((interval_ns / 4.0).log2())
    } else {
        ceil_index(interval_ns / 32.0) + 2
    }
}

fn high_speed_to_interval(timebase: u32) -> f64 {
    if timebase <= 3 {
        f64::from(1u32 << timebase) * 4.0
    } else {
        f64::from(timebase - 2) * 32.0
    }
}

// PS4262: linear 100 ns steps from timebase 0.
fn high_resolution_to_timebase(interval_ns: f64) -> u32 {
    ceil_index(interval_ns / 100.0).saturating_sub(1)
}

fn high_resolution_to_interval(timebase: u32) -> f64 {
    (f64::from(timebase) + 1.0) * 100.0
}

const FAST: TimebaseFormula = TimebaseFormula {
    interval_to_timebase: fast_to_timebase,
    timebase_to_interval: fast_to_interval,
};

const HIGH_SPEED: TimebaseFormula = TimebaseFormula {
    interval_to_timebase: high_speed_to_timebase,
    timebase_to_interval: high_speed_to_interval,
};

const HIGH_RESOLUTION: TimebaseFormula = TimebaseFormula {
    interval_to_timebase: high_resolution_to_timebase,
    timebase_to_interval: high_resolution_to_interval,
};

pub static MODELS: [ModelInfo; 7] = [
    ModelInfo {
        model: Model::PS4223,
        variant: 4223,
        min_range: VoltageRange::Range50mV,
        max_range: VoltageRange::Range100V,
        channel_count: DUAL_SCOPE,
        timebase: FAST,
    },
    ModelInfo {
        model: Model::PS4224,
        variant: 4224,
        min_range: VoltageRange::Range50mV,
        max_range: VoltageRange::Range20V,
        channel_count: DUAL_SCOPE,
        timebase: FAST,
    },
    ModelInfo {
        model: Model::PS4423,
        variant: 4423,
        min_range: VoltageRange::Range50mV,
        max_range: VoltageRange::Range100V,
        channel_count: QUAD_SCOPE,
        timebase: FAST,
    },
    ModelInfo {
        model: Model::PS4424,
        variant: 4424,
        min_range: VoltageRange::Range50mV,
        max_range: VoltageRange::Range20V,
        channel_count: QUAD_SCOPE,
        timebase: FAST,
    },
    ModelInfo {
        model: Model::PS4226,
        variant: 4226,
        min_range: VoltageRange::Range50mV,
        max_range: VoltageRange::Range20V,
        channel_count: DUAL_SCOPE,
        timebase: HIGH_SPEED,
    },
    ModelInfo {
        model: Model::PS4227,
        variant: 4227,
        min_range: VoltageRange::Range50mV,
        max_range: VoltageRange::Range20V,
        channel_count: DUAL_SCOPE,
        timebase: HIGH_SPEED,
    },
    ModelInfo {
        model: Model::PS4262,
        variant: 4262,
        min_range: VoltageRange::Range10mV,
        max_range: VoltageRange::Range20V,
        channel_count: DUAL_SCOPE,
        timebase: HIGH_RESOLUTION,
    },
];
