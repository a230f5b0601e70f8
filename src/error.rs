use crate::prelude::*;

/// Crate-level error type returned by the stack's fallible operations.
///
/// OD access failures that map onto the CiA 301 SDO abort catalog are wrapped
/// in [`ErrorCode::Abort`], so a caller can distinguish the kind of failure
/// from the numeric classification carried inside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// Node-ID outside 1..=127.
    InvalidNodeId { node_id: u8 },
    /// SDO number outside 1..=128.
    InvalidSdoNumber { sdo_number: u8 },
    /// COB-ID not representable as a CAN identifier.
    InvalidCobId { cob_id: u32 },
    /// The transport rejected or could not build a frame.
    FrameCreationFailed,
    /// NMT event queue is full; the event was not enqueued.
    EventQueueFull,
    /// SDO request queue is full; the request was dropped.
    RequestQueueFull,
    /// No object with this index exists in the dictionary.
    ObjectNotFound { index: u16 },
    /// An object dictionary handle without the required validity bits.
    InvalidHandle,
    /// State callback id not registered.
    CallbackNotFound,
    /// Dictionary construction: duplicate object index.
    DuplicateObject { index: u16 },
    /// Dictionary construction: duplicate sub-index within an object.
    DuplicateEntry { index: u16, subindex: u8 },
    /// Dictionary construction: multi-entry object without a sub-index 0
    /// UNSIGNED8 entry.
    MissingSubindexZero { index: u16 },
    /// Dictionary construction: entry bit width exceeds its storage size.
    InvalidEntry { index: u16, subindex: u8 },
    /// Transport-level I/O failure.
    Transport,
    /// OD semantic failure carrying its CiA 301 abort classification.
    Abort(AbortCode),
}

impl ErrorCode {
    /// The SDO abort code for this error, if it has one.
    pub fn abort_code(&self) -> Option<AbortCode> {
        match self {
            ErrorCode::Abort(code) => Some(*code),
            _ => None,
        }
    }

    /// The abort code an SDO server reports for this error. Errors without a
    /// CiA classification collapse to `GeneralError`.
    pub(crate) fn to_abort(self) -> AbortCode {
        self.abort_code().unwrap_or(AbortCode::GeneralError)
    }
}

impl From<AbortCode> for ErrorCode {
    fn from(code: AbortCode) -> Self {
        ErrorCode::Abort(code)
    }
}

macro_rules! abort_codes {
    ($($name:ident = $code:literal => $desc:literal,)*) => {
        /// CiA 301 SDO abort codes. The numeric values are part of the wire
        /// ABI and must not change.
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub enum AbortCode {
            $($name,)*
        }

        impl AbortCode {
            /// The 32-bit abort code transferred in bytes 4..8 of an SDO
            /// abort frame (little-endian).
            pub const fn code(&self) -> u32 {
                match *self {
                    $(AbortCode::$name => $code,)*
                }
            }

            /// Human-readable description per CiA 301.
            pub const fn description(&self) -> &'static str {
                match *self {
                    $(AbortCode::$name => $desc,)*
                }
            }

            /// Reverse lookup from a received 32-bit abort code.
            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(AbortCode::$name),)*
                    _ => None,
                }
            }
        }
    };
}

abort_codes! {
    ToggleBitNotAlternated = 0x0503_0000 => "Toggle bit not alternated",
    SdoProtocolTimedOut = 0x0504_0000 => "SDO protocol timed out",
    CommandSpecifierNotValid = 0x0504_0001 => "Client/server command specifier not valid or unknown",
    InvalidBlockSize = 0x0504_0002 => "Invalid block size",
    InvalidSequenceNumber = 0x0504_0003 => "Invalid sequence number",
    CrcError = 0x0504_0004 => "CRC error",
    OutOfMemory = 0x0504_0005 => "Out of memory",
    UnsupportedAccess = 0x0601_0000 => "Unsupported access to an object",
    WriteOnly = 0x0601_0001 => "Attempt to read a write only object",
    ReadOnly = 0x0601_0002 => "Attempt to write a read only object",
    ObjectDoesNotExist = 0x0602_0000 => "Object does not exist in the object dictionary",
    ObjectCannotBeMapped = 0x0604_0041 => "Object cannot be mapped to the PDO",
    PdoLengthExceeded = 0x0604_0042 => "The number and length of the objects to be mapped would exceed PDO length",
    ParameterIncompatible = 0x0604_0043 => "General parameter incompatibility",
    DeviceIncompatible = 0x0604_0047 => "General internal incompatibility in the device",
    HardwareError = 0x0606_0000 => "Access failed due to a hardware error",
    LengthMismatch = 0x0607_0010 => "Length of service parameter does not match",
    LengthTooHigh = 0x0607_0012 => "Length of service parameter too high",
    LengthTooLow = 0x0607_0013 => "Length of service parameter too low",
    SubindexDoesNotExist = 0x0609_0011 => "Sub-index does not exist",
    ParameterValueInvalid = 0x0609_0030 => "Invalid value for parameter",
    ParameterValueTooHigh = 0x0609_0031 => "Value of parameter written too high",
    ParameterValueTooLow = 0x0609_0032 => "Value of parameter written too low",
    MaxLessThanMin = 0x0609_0036 => "Maximum value is less than minimum value",
    ResourceNotAvailable = 0x060A_0023 => "Resource not available",
    GeneralError = 0x0800_0000 => "General error",
    ApplicationCannotStore = 0x0800_0020 => "Data cannot be transferred or stored to the application",
    ApplicationLocalControl = 0x0800_0021 => "Data cannot be transferred or stored to the application (local control)",
    ApplicationDeviceState = 0x0800_0022 => "Data cannot be transferred or stored to the application (device state)",
    NoObjectDictionary = 0x0800_0023 => "No object dictionary present",
    NoDataAvailable = 0x0800_0024 => "No data available",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_code_values_are_stable() {
        assert_eq!(AbortCode::ToggleBitNotAlternated.code(), 0x0503_0000);
        assert_eq!(AbortCode::SdoProtocolTimedOut.code(), 0x0504_0000);
        assert_eq!(AbortCode::CommandSpecifierNotValid.code(), 0x0504_0001);
        assert_eq!(AbortCode::WriteOnly.code(), 0x0601_0001);
        assert_eq!(AbortCode::ReadOnly.code(), 0x0601_0002);
        assert_eq!(AbortCode::ObjectDoesNotExist.code(), 0x0602_0000);
        assert_eq!(AbortCode::LengthMismatch.code(), 0x0607_0010);
        assert_eq!(AbortCode::LengthTooHigh.code(), 0x0607_0012);
        assert_eq!(AbortCode::LengthTooLow.code(), 0x0607_0013);
        assert_eq!(AbortCode::SubindexDoesNotExist.code(), 0x0609_0011);
        assert_eq!(AbortCode::ParameterValueTooHigh.code(), 0x0609_0031);
        assert_eq!(AbortCode::ParameterValueTooLow.code(), 0x0609_0032);
        assert_eq!(AbortCode::ResourceNotAvailable.code(), 0x060A_0023);
        assert_eq!(AbortCode::GeneralError.code(), 0x0800_0000);
        assert_eq!(AbortCode::NoDataAvailable.code(), 0x0800_0024);
    }

    #[test]
    fn abort_code_round_trips() {
        for code in [
            AbortCode::ToggleBitNotAlternated,
            AbortCode::InvalidBlockSize,
            AbortCode::InvalidSequenceNumber,
            AbortCode::CrcError,
            AbortCode::UnsupportedAccess,
            AbortCode::ObjectDoesNotExist,
            AbortCode::SubindexDoesNotExist,
            AbortCode::MaxLessThanMin,
            AbortCode::ApplicationDeviceState,
            AbortCode::NoObjectDictionary,
        ] {
            assert_eq!(AbortCode::from_code(code.code()), Some(code));
        }

        assert_eq!(AbortCode::from_code(0xFFFF_FFFF), None);
    }

    #[test]
    fn abort_code_descriptions() {
        assert_eq!(
            AbortCode::ReadOnly.description(),
            "Attempt to write a read only object"
        );
        assert_eq!(
            AbortCode::WriteOnly.description(),
            "Attempt to read a write only object"
        );
        assert_eq!(
            AbortCode::ObjectDoesNotExist.description(),
            "Object does not exist in the object dictionary"
        );
    }

    #[test]
    fn error_code_carries_abort() {
        let err = ErrorCode::Abort(AbortCode::SubindexDoesNotExist);
        assert_eq!(err.abort_code(), Some(AbortCode::SubindexDoesNotExist));
        assert_eq!(ErrorCode::EventQueueFull.abort_code(), None);
        assert_eq!(
            ErrorCode::EventQueueFull.to_abort(),
            AbortCode::GeneralError
        );
    }
}
