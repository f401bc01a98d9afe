use crate::calibration::millivolts_to_adc;
use crate::channel::{Channel, ChannelId, ThresholdDirection, ThresholdMode};
use crate::pico_scope::PicoError;

/// Hysteresis band, in ADC counts at attenuation 1, applied to every trigger threshold.
pub const TRIGGER_HYSTERESIS_COUNTS: u16 = 256 * 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerState {
    #[default]
    DontCare = 0,
    True = 1,
    False = 2,
}

/// One AND-combination of channel states. Several combinations are ORed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerConditions {
    pub channel_a: TriggerState,
    pub channel_b: TriggerState,
    pub channel_c: TriggerState,
    pub channel_d: TriggerState,
    pub external: TriggerState,
    pub aux: TriggerState,
    pub pulse_width_qualifier: TriggerState,
}

impl TriggerConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, channel: ChannelId, state: TriggerState) -> Self {
        *self.slot_mut(channel) = state;
        self
    }

    pub fn channel_a(self, state: TriggerState) -> Self {
        self.set(ChannelId::A, state)
    }

    pub fn channel_b(self, state: TriggerState) -> Self {
        self.set(ChannelId::B, state)
    }

    pub fn channel_c(self, state: TriggerState) -> Self {
        self.set(ChannelId::C, state)
    }

    pub fn channel_d(self, state: TriggerState) -> Self {
        self.set(ChannelId::D, state)
    }

    pub fn external(self, state: TriggerState) -> Self {
        self.set(ChannelId::External, state)
    }

    pub fn aux(self, state: TriggerState) -> Self {
        self.set(ChannelId::Aux, state)
    }

    pub fn pulse_width_qualifier(mut self, state: TriggerState) -> Self {
        self.pulse_width_qualifier = state;
        self
    }

    pub fn state(&self, channel: ChannelId) -> TriggerState {
        match channel {
            ChannelId::A => self.channel_a,
            ChannelId::B => self.channel_b,
            ChannelId::C => self.channel_c,
            ChannelId::D => self.channel_d,
            ChannelId::External => self.external,
            ChannelId::Aux => self.aux,
        }
    }

    fn slot_mut(&mut self, channel: ChannelId) -> &mut TriggerState {
        match channel {
            ChannelId::A => &mut self.channel_a,
            ChannelId::B => &mut self.channel_b,
            ChannelId::C => &mut self.channel_c,
            ChannelId::D => &mut self.channel_d,
            ChannelId::External => &mut self.external,
            ChannelId::Aux => &mut self.aux,
        }
    }

    /// Channels this combination actually constrains.
    pub fn constrained_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        ChannelId::ALL
            .into_iter()
            .filter(|&ch| self.state(ch) != TriggerState::DontCare)
    }
}

/// Threshold settings for one channel, in the driver's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerChannelProperties {
    pub threshold_major: i16,
    pub hysteresis_major: u16,
    pub threshold_minor: i16,
    pub hysteresis_minor: u16,
    pub channel: ChannelId,
    pub mode: ThresholdMode,
}

impl TriggerChannelProperties {
    /// Properties derived from a channel's trigger voltage. Upper and lower thresholds are
    /// equal and the hysteresis band shrinks with the probe attenuation.
    pub fn from_channel(channel: &Channel) -> Self {
        let attenuation = channel.attenuation().max(1);
        let at_input_mv = i32::from(channel.trigger_voltage_mv()) / i32::from(attenuation);
        let threshold = millivolts_to_adc(at_input_mv, channel.range());
        let hysteresis = TRIGGER_HYSTERESIS_COUNTS / attenuation;
        Self {
            threshold_major: threshold,
            hysteresis_major: hysteresis,
            threshold_minor: threshold,
            hysteresis_minor: hysteresis,
            channel: channel.id(),
            mode: channel.trigger_mode(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PulseWidthType {
    #[default]
    None = 0,
    LessThan = 1,
    GreaterThan = 2,
    InRange = 3,
    OutOfRange = 4,
}

/// Channel states gating the pulse-width qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PwqConditions {
    pub channel_a: TriggerState,
    pub channel_b: TriggerState,
    pub channel_c: TriggerState,
    pub channel_d: TriggerState,
    pub external: TriggerState,
    pub aux: TriggerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseWidthQualifier {
    pub conditions: Vec<PwqConditions>,
    pub direction: ThresholdDirection,
    pub lower: u32,
    pub upper: u32,
    pub kind: PulseWidthType,
}

impl PulseWidthQualifier {
    /// The qualifier sent when none is configured.
    pub fn disabled() -> Self {
        Self {
            conditions: Vec::new(),
            direction: ThresholdDirection::None,
            lower: 0,
            upper: 0,
            kind: PulseWidthType::None,
        }
    }
}

/// Everything the driver needs to arm (or disarm) its trigger, in call order:
/// properties, conditions, directions, delay, pulse-width qualifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSetup {
    pub properties: Vec<TriggerChannelProperties>,
    pub conditions: Vec<TriggerConditions>,
    pub directions: [ThresholdDirection; 6],
    pub delay: u32,
    pub pulse_width: PulseWidthQualifier,
    pub aux_output_enabled: bool,
    pub auto_trigger_ms: i32,
}

impl TriggerSetup {
    /// No properties and no conditions: the device starts collecting immediately.
    pub fn disabled() -> Self {
        Self {
            properties: Vec::new(),
            conditions: Vec::new(),
            directions: [ThresholdDirection::None; 6],
            delay: 0,
            pulse_width: PulseWidthQualifier::disabled(),
            aux_output_enabled: false,
            auto_trigger_ms: 0,
        }
    }

    /// Build the trigger from the enabled channels' thresholds and the given combinations.
    ///
    /// Combinations naming a channel the device does not have are rejected here, before any
    /// driver call. Combinations naming a present but disabled channel are passed through;
    /// the driver treats the missing threshold as don't-care.
    pub fn from_channels(
        channels: &[Channel],
        conditions: &[TriggerConditions],
    ) -> Result<Self, PicoError> {
        let present = |id: ChannelId| !id.is_analog() || channels.iter().any(|ch| ch.id() == id);
        for (index, combination) in conditions.iter().enumerate() {
            if let Some(missing) = combination.constrained_channels().find(|&id| !present(id)) {
                return Err(PicoError::InvalidSetting(format!(
                    "trigger condition #{index} uses channel {missing}, which this device does not have"
                )));
            }
            for id in combination.constrained_channels() {
                if channels.iter().any(|ch| ch.id() == id && !ch.is_enabled()) {
                    log::warn!(
                        "Trigger condition #{index} uses disabled channel {id}; the driver will ignore it"
                    );
                }
            }
        }

        let properties = channels
            .iter()
            .filter(|ch| ch.is_enabled())
            .map(TriggerChannelProperties::from_channel)
            .collect();

        let mut directions = [ThresholdDirection::None; 6];
        for ch in channels {
            directions[ch.id().index()] = ch.trigger_direction();
        }

        Ok(Self {
            properties,
            conditions: conditions.to_vec(),
            directions,
            ..Self::disabled()
        })
    }

    pub fn with_delay(mut self, delay: u32) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_pulse_width(mut self, pulse_width: Option<PulseWidthQualifier>) -> Self {
        self.pulse_width = pulse_width.unwrap_or_else(PulseWidthQualifier::disabled);
        self
    }

    pub fn with_auto_trigger(mut self, aux_output_enabled: bool, auto_trigger_ms: i32) -> Self {
        self.aux_output_enabled = aux_output_enabled;
        self.auto_trigger_ms = auto_trigger_ms;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.properties.is_empty() && self.conditions.is_empty()
    }
}

impl Default for TriggerSetup {
    fn default() -> Self {
        Self::disabled()
    }
}
