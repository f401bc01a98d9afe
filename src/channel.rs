use std::fmt;

use crate::pico_scope::PicoError;

/// Driver-side channel identity. The discriminant is the driver's channel code and the
/// index into every per-channel driver array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    A = 0,
    B = 1,
    C = 2,
    D = 3,
    External = 4,
    Aux = 5,
}

impl ChannelId {
    pub const ANALOG: [Self; 4] = [Self::A, Self::B, Self::C, Self::D];
    pub const ALL: [Self; 6] = [Self::A, Self::B, Self::C, Self::D, Self::External, Self::Aux];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::External => "Ext",
            Self::Aux => "Aux",
        }
    }

    pub fn is_analog(self) -> bool {
        self.index() < 4
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Input voltage ranges, in driver code order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VoltageRange {
    Range10mV = 0,
    Range20mV,
    Range50mV,
    Range100mV,
    Range200mV,
    Range500mV,
    Range1V,
    Range2V,
    Range5V,
    Range10V,
    Range20V,
    Range50V,
    Range100V,
}

impl VoltageRange {
    pub const ALL: [Self; 13] = [
        Self::Range10mV,
        Self::Range20mV,
        Self::Range50mV,
        Self::Range100mV,
        Self::Range200mV,
        Self::Range500mV,
        Self::Range1V,
        Self::Range2V,
        Self::Range5V,
        Self::Range10V,
        Self::Range20V,
        Self::Range50V,
        Self::Range100V,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Full-scale input in millivolts.
    pub fn full_scale_mv(self) -> i32 {
        match self {
            Self::Range10mV => 10,
            Self::Range20mV => 20,
            Self::Range50mV => 50,
            Self::Range100mV => 100,
            Self::Range200mV => 200,
            Self::Range500mV => 500,
            Self::Range1V => 1_000,
            Self::Range2V => 2_000,
            Self::Range5V => 5_000,
            Self::Range10V => 10_000,
            Self::Range20V => 20_000,
            Self::Range50V => 50_000,
            Self::Range100V => 100_000,
        }
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mv = self.full_scale_mv();
        if mv < 1000 {
            write!(f, "{mv}mV")
        } else {
            write!(f, "{}V", mv / 1000)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coupling {
    AC,
    #[default]
    DC,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThresholdMode {
    #[default]
    Level = 0,
    Window = 1,
}

/// Trigger threshold direction. The window-mode names are aliases of the level-mode
/// ones on the wire (`Inside` = `Above`, `Enter` = `Rising`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThresholdDirection {
    Above,
    Below,
    #[default]
    Rising,
    Falling,
    RisingOrFalling,
    /// No direction. The driver has no dedicated code for this and reads it as `Rising`.
    None,
}

impl ThresholdDirection {
    pub const INSIDE: Self = Self::Above;
    pub const OUTSIDE: Self = Self::Below;
    pub const ENTER: Self = Self::Rising;
    pub const EXIT: Self = Self::Falling;
    pub const ENTER_OR_EXIT: Self = Self::RisingOrFalling;

    pub fn code(self) -> i32 {
        match self {
            Self::Above => 0,
            Self::Below => 1,
            Self::Rising | Self::None => 2,
            Self::Falling => 3,
            Self::RisingOrFalling => 4,
        }
    }
}

/// Electrical settings pushed to the driver through `SetChannel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub enabled: bool,
    pub coupling: Coupling,
    pub range: VoltageRange,
}

/// One analog input channel.
///
/// Setters of electrically relevant fields (enabled, range, coupling) mark the channel
/// as pending; the scope commits pending channels to the driver before the next capture.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    enabled: bool,
    range: VoltageRange,
    coupling: Coupling,
    attenuation: u16,
    trigger_voltage_mv: i16,
    trigger_mode: ThresholdMode,
    trigger_direction: ThresholdDirection,
    min_range: VoltageRange,
    max_range: VoltageRange,
    pending: bool,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, min_range: VoltageRange, max_range: VoltageRange) -> Self {
        Self {
            id,
            enabled: true,
            range: VoltageRange::Range5V.clamp(min_range, max_range),
            coupling: Coupling::DC,
            attenuation: 1,
            trigger_voltage_mv: 0,
            trigger_mode: ThresholdMode::Level,
            trigger_direction: ThresholdDirection::Rising,
            min_range,
            max_range,
            pending: true,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.id.name()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn range(&self) -> VoltageRange {
        self.range
    }

    pub fn coupling(&self) -> Coupling {
        self.coupling
    }

    pub fn attenuation(&self) -> u16 {
        self.attenuation
    }

    pub fn trigger_voltage_mv(&self) -> i16 {
        self.trigger_voltage_mv
    }

    pub fn trigger_mode(&self) -> ThresholdMode {
        self.trigger_mode
    }

    pub fn trigger_direction(&self) -> ThresholdDirection {
        self.trigger_direction
    }

    pub fn settings(&self) -> ChannelSettings {
        ChannelSettings {
            enabled: self.enabled,
            coupling: self.coupling,
            range: self.range,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) -> &mut Self {
        self.enabled = enabled;
        self.pending = true;
        self
    }

    pub fn set_range(&mut self, range: VoltageRange) -> Result<&mut Self, PicoError> {
        if range < self.min_range || range > self.max_range {
            return Err(PicoError::InvalidSetting(format!(
                "range {range} outside {}..={} for channel {}",
                self.min_range, self.max_range, self.id
            )));
        }
        self.range = range;
        self.pending = true;
        Ok(self)
    }

    pub fn set_coupling(&mut self, coupling: Coupling) -> &mut Self {
        self.coupling = coupling;
        self.pending = true;
        self
    }

    /// Probe multiplier. Zero would divide by zero in the trigger hysteresis and is rejected.
    pub fn set_attenuation(&mut self, attenuation: u16) -> Result<&mut Self, PicoError> {
        if attenuation == 0 {
            return Err(PicoError::InvalidSetting(format!(
                "attenuation of channel {} must be at least 1",
                self.id
            )));
        }
        self.attenuation = attenuation;
        Ok(self)
    }

    pub fn set_trigger_voltage_mv(&mut self, millivolts: i16) -> &mut Self {
        self.trigger_voltage_mv = millivolts;
        self
    }

    pub fn set_trigger_mode(&mut self, mode: ThresholdMode) -> &mut Self {
        self.trigger_mode = mode;
        self
    }

    pub fn set_trigger_direction(&mut self, direction: ThresholdDirection) -> &mut Self {
        self.trigger_direction = direction;
        self
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }

    pub(crate) fn mark_committed(&mut self) {
        self.pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_a() -> Channel {
        Channel::new(ChannelId::A, VoltageRange::Range50mV, VoltageRange::Range20V)
    }

    #[test]
    fn test_defaults() {
        let ch = channel_a();
        assert!(ch.is_enabled());
        assert_eq!(ch.range(), VoltageRange::Range5V);
        assert_eq!(ch.coupling(), Coupling::DC);
        assert_eq!(ch.attenuation(), 1);
        assert_eq!(ch.trigger_direction(), ThresholdDirection::Rising);
        assert!(ch.is_pending());
    }

    #[test]
    fn test_electrical_setters_mark_pending() {
        let mut ch = channel_a();
        ch.mark_committed();

        ch.set_trigger_voltage_mv(500).set_trigger_mode(ThresholdMode::Window);
        assert!(!ch.is_pending());

        ch.set_coupling(Coupling::AC);
        assert!(ch.is_pending());
        ch.mark_committed();

        ch.set_range(VoltageRange::Range1V).unwrap();
        assert!(ch.is_pending());
        ch.mark_committed();

        ch.set_enabled(false);
        assert!(ch.is_pending());
    }

    #[test]
    fn test_zero_attenuation_rejected() {
        let mut ch = channel_a();
        assert!(matches!(ch.set_attenuation(0), Err(PicoError::InvalidSetting(_))));
        assert_eq!(ch.attenuation(), 1);
        ch.set_attenuation(10).unwrap();
        assert_eq!(ch.attenuation(), 10);
    }

    #[test]
    fn test_range_limits() {
        let mut ch = channel_a();
        assert!(ch.set_range(VoltageRange::Range10mV).is_err());
        assert!(ch.set_range(VoltageRange::Range100V).is_err());
        assert!(ch.set_range(VoltageRange::Range20V).is_ok());
    }

    #[test]
    fn test_direction_codes() {
        assert_eq!(ThresholdDirection::None.code(), ThresholdDirection::Rising.code());
        assert_eq!(ThresholdDirection::INSIDE, ThresholdDirection::Above);
        assert_eq!(ThresholdDirection::RisingOrFalling.code(), 4);
    }

    #[test]
    fn test_range_display() {
        assert_eq!(VoltageRange::Range500mV.to_string(), "500mV");
        assert_eq!(VoltageRange::Range5V.to_string(), "5V");
        assert_eq!(VoltageRange::Range100V.full_scale_mv(), 100_000);
    }
}
