//! Status codes returned by the PicoScope 4000 driver.

use std::fmt;

/// Raw status word returned by every driver entry point. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PicoStatus(pub u32);

impl PicoStatus {
    pub const OK: Self = Self(0x00);
    pub const MAX_UNITS_OPENED: Self = Self(0x01);
    pub const MEMORY_FAIL: Self = Self(0x02);
    pub const NOT_FOUND: Self = Self(0x03);
    pub const FW_FAIL: Self = Self(0x04);
    pub const OPEN_OPERATION_IN_PROGRESS: Self = Self(0x05);
    pub const OPERATION_FAILED: Self = Self(0x06);
    pub const NOT_RESPONDING: Self = Self(0x07);
    pub const CONFIG_FAIL: Self = Self(0x08);
    pub const INVALID_HANDLE: Self = Self(0x0C);
    pub const INVALID_PARAMETER: Self = Self(0x0D);
    pub const INVALID_TIMEBASE: Self = Self(0x0E);
    pub const INVALID_VOLTAGE_RANGE: Self = Self(0x0F);
    pub const INVALID_CHANNEL: Self = Self(0x10);
    pub const INVALID_TRIGGER_CHANNEL: Self = Self(0x11);
    pub const INVALID_CONDITION_CHANNEL: Self = Self(0x12);
    pub const STREAMING_FAILED: Self = Self(0x14);
    pub const BLOCK_MODE_FAILED: Self = Self(0x15);
    pub const NULL_PARAMETER: Self = Self(0x16);
    pub const DATA_NOT_AVAILABLE: Self = Self(0x18);
    pub const AUTO_TRIGGER_TIME_TOO_SHORT: Self = Self(0x1B);
    pub const BUFFER_STALL: Self = Self(0x1C);
    pub const TOO_MANY_SAMPLES: Self = Self(0x1D);
    pub const TOO_MANY_SEGMENTS: Self = Self(0x1E);
    pub const PULSE_WIDTH_QUALIFIER: Self = Self(0x1F);
    pub const DELAY: Self = Self(0x20);
    pub const SOURCE_DETAILS: Self = Self(0x21);
    pub const CONDITIONS: Self = Self(0x22);
    pub const USER_CALLBACK: Self = Self(0x23);
    pub const DEVICE_SAMPLING: Self = Self(0x24);
    pub const NO_SAMPLES_AVAILABLE: Self = Self(0x25);
    pub const SEGMENT_OUT_OF_RANGE: Self = Self(0x26);
    pub const BUSY: Self = Self(0x27);
    pub const STARTINDEX_INVALID: Self = Self(0x28);
    pub const INVALID_INFO: Self = Self(0x29);
    pub const INFO_UNAVAILABLE: Self = Self(0x2A);
    pub const INVALID_SAMPLE_INTERVAL: Self = Self(0x2B);
    pub const MEMORY: Self = Self(0x2D);
    pub const INVALID_BUFFER: Self = Self(0x37);
    pub const CANCELLED: Self = Self(0x3A);
    pub const SEGMENT_NOT_USED: Self = Self(0x3B);
    pub const INVALID_CALL: Self = Self(0x3C);
    pub const NOT_USED: Self = Self(0x3F);
    pub const INVALID_SAMPLERATIO: Self = Self(0x40);
    pub const INVALID_STATE: Self = Self(0x41);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Turn a status word into a `Result`, keeping the status as the error.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::OK => "The operation was successful.",
            Self::MAX_UNITS_OPENED => "An attempt has been made to open more than the maximum number of units.",
            Self::MEMORY_FAIL => "Not enough memory could be allocated on the host machine.",
            Self::NOT_FOUND => "No Pico Technology device could be found.",
            Self::FW_FAIL => "Unable to download firmware.",
            Self::OPEN_OPERATION_IN_PROGRESS => "The driver is busy opening a device.",
            Self::OPERATION_FAILED => "An unspecified failure occurred.",
            Self::NOT_RESPONDING => "The PicoScope is not responding to commands from the PC.",
            Self::CONFIG_FAIL => "The configuration information in the PicoScope is corrupt or missing.",
            Self::INVALID_HANDLE => "There is no device with the handle value passed.",
            Self::INVALID_PARAMETER => "A parameter value is not valid.",
            Self::INVALID_TIMEBASE => "The timebase is not supported or is invalid.",
            Self::INVALID_VOLTAGE_RANGE => "The voltage range is not supported or is invalid.",
            Self::INVALID_CHANNEL => "The channel number is not valid on this device or no channels have been set.",
            Self::INVALID_TRIGGER_CHANNEL => "The channel set for a trigger is not available on this device.",
            Self::INVALID_CONDITION_CHANNEL => "The channel set for a condition is not available on this device.",
            Self::STREAMING_FAILED => "Streaming has failed to start or has stopped without user request.",
            Self::BLOCK_MODE_FAILED => "Block failed to start - a parameter may have been set wrongly.",
            Self::NULL_PARAMETER => "A parameter that was required is NULL.",
            Self::DATA_NOT_AVAILABLE => "No data is available from a run block call.",
            Self::AUTO_TRIGGER_TIME_TOO_SHORT => "The auto trigger time is less than the time it will take to collect the pre-trigger data.",
            Self::BUFFER_STALL => "The collection of data has stalled as unread data would be overwritten.",
            Self::TOO_MANY_SAMPLES => "Number of samples requested is more than available in the current memory segment.",
            Self::TOO_MANY_SEGMENTS => "Not possible to create number of segments requested.",
            Self::PULSE_WIDTH_QUALIFIER => "A null pointer has been passed in the trigger function or one of the parameters is out of range.",
            Self::DELAY => "One or more of the hold-off parameters are out of range.",
            Self::SOURCE_DETAILS => "One or more of the source details are incorrect.",
            Self::CONDITIONS => "One or more of the conditions are incorrect.",
            Self::USER_CALLBACK => "The driver's thread is currently in the ready callback and the action cannot be carried out.",
            Self::DEVICE_SAMPLING => "An attempt is being made to get stored data while streaming.",
            Self::NO_SAMPLES_AVAILABLE => "Data is unavailable because a run has not been completed.",
            Self::SEGMENT_OUT_OF_RANGE => "The memory segment index is out of range.",
            Self::BUSY => "The device is busy so data cannot be returned yet.",
            Self::STARTINDEX_INVALID => "The start time to get stored data is out of range.",
            Self::INVALID_INFO => "The information number requested is not a valid number.",
            Self::INFO_UNAVAILABLE => "The handle is invalid so no information is available about the device.",
            Self::INVALID_SAMPLE_INTERVAL => "The sample interval selected for streaming is out of range.",
            Self::MEMORY => "Driver cannot allocate memory.",
            Self::INVALID_BUFFER => "The buffers for overview data have not been set while streaming.",
            Self::CANCELLED => "A block collection has been canceled.",
            Self::SEGMENT_NOT_USED => "The segment index is not currently being used.",
            Self::INVALID_CALL => "The wrong GetValues function has been called for the collection mode in use.",
            Self::NOT_USED => "The function is not available.",
            Self::INVALID_SAMPLERATIO => "The aggregation ratio requested is out of range.",
            Self::INVALID_STATE => "Device is in an invalid state.",
            _ => "Unknown status code.",
        }
    }
}

impl fmt::Display for PicoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x} ({})", self.0, self.message())
    }
}
