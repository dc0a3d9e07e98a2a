//! Device error codes for the SMART protocol family.
//!
//! The enumeration is closed: codes the firmware returns that are not
//! listed here map to [`ErrorCode::InternalUnknown`] at the call site, with
//! a warning, never a panic.

use serde::Serialize;

macro_rules! error_codes {
    ($( $(#[$meta:meta])* $name:ident = $value:literal, )+) => {
        /// Integer error codes returned by devices.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum ErrorCode {
            $( $(#[$meta])* $name, )+
        }

        impl ErrorCode {
            /// The numeric wire value of this code.
            pub fn value(self) -> i64 {
                match self {
                    $( ErrorCode::$name => $value, )+
                }
            }

            /// Parse a wire value. Unknown codes are returned as `Err` so the
            /// caller can log them before absorbing into `InternalUnknown`.
            pub fn from_i64(value: i64) -> Result<Self, i64> {
                match value {
                    $( $value => Ok(ErrorCode::$name), )+
                    other => Err(other),
                }
            }
        }
    };
}

error_codes! {
    Success = 0,

    // Synthetic codes for responses that carry no usable error_code.
    InternalUnknown = -100_000,
    ErrorCodeNone = -100_001,

    // Transport-level codes.
    SessionTimeout = 9999,
    MultiRequestFailed = 1200,
    HttpTransportFailed = 1112,
    LoginFailed = 1111,
    HandShakeFailed = 1100,
    TransportNotAvailable = 1002,
    CmdCommandCancel = 1001,
    NullTransport = 1000,

    // Common method codes.
    CommonFailed = -1,
    Unspecific = -1001,
    UnknownMethod = -1002,
    JsonDecodeFail = -1003,
    JsonEncodeFail = -1004,
    AesDecodeFail = -1005,
    RequestLenError = -1006,
    CloudFailed = -1007,
    ParamsError = -1008,
    InvalidPublicKey = -1010,
    SessionParamError = -1101,

    // Method-specific codes.
    QuickSetupError = -1201,
    DeviceError = -1301,
    DeviceNextEventError = -1302,
    FirmwareError = -1401,
    FirmwareVerError = -1402,
    LoginError = -1501,
    TimeError = -1601,
    TimeSysError = -1602,
    TimeSaveError = -1603,
    WirelessError = -1701,
    WirelessUnsupported = -1702,
    ScheduleError = -1801,
    ScheduleFull = -1802,
    ScheduleConflict = -1803,
    ScheduleSave = -1804,
    ScheduleIndexError = -1805,
    CountdownError = -1901,
    CountdownConflict = -1902,
    CountdownSave = -1903,
    AntitheftError = -2001,
    AntitheftConflict = -2002,
    AntitheftSave = -2003,
    AccountError = -2101,
    StatError = -2201,
    StatSaveError = -2202,
    DstError = -2301,
    DstSaveError = -2302,

    // Camera-generation codes.
    SessionExpired = -40401,
    DeviceBlocked = -40404,
    BadUsername = -40411,
    InvalidNonce = -40413,
}

/// Codes worth retrying at the protocol layer.
pub const RETRYABLE_ERRORS: &[ErrorCode] = &[
    ErrorCode::TransportNotAvailable,
    ErrorCode::HttpTransportFailed,
    ErrorCode::Unspecific,
];

/// Codes indicating an authentication problem. These force the transport
/// back to the handshake-required state before the next send.
pub const AUTHENTICATION_ERRORS: &[ErrorCode] = &[
    ErrorCode::LoginError,
    ErrorCode::LoginFailed,
    ErrorCode::AesDecodeFail,
    ErrorCode::HandShakeFailed,
    ErrorCode::SessionExpired,
];

/// Codes signalling a device-side timeout.
pub const TIMEOUT_ERRORS: &[ErrorCode] = &[ErrorCode::SessionTimeout];

impl ErrorCode {
    /// Parse an optional wire value, mapping an absent code to the
    /// `ErrorCodeNone` sentinel.
    pub fn from_raw(value: Option<i64>) -> Result<Self, i64> {
        match value {
            None => Ok(ErrorCode::ErrorCodeNone),
            Some(v) => ErrorCode::from_i64(v),
        }
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    pub fn is_retryable(self) -> bool {
        RETRYABLE_ERRORS.contains(&self)
    }

    pub fn is_authentication(self) -> bool {
        AUTHENTICATION_ERRORS.contains(&self)
    }

    pub fn is_timeout(self) -> bool {
        TIMEOUT_ERRORS.contains(&self)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.value())
    }
}
