use crate::ccid_const;
use log::{error, info};
use thiserror::Error;

/// Result codes surfaced to the command dispatcher.
///
/// `IccNotPresent` and `ParityError` are card-state conditions, not driver
/// faults: a caller must be able to tell "no card" from "reader broken".
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfdError {
    #[error("communication error with the reader")]
    Communication,
    #[error("reader is no longer present")]
    NoSuchDevice,
    #[error("response truncated to {0} bytes, caller buffer too small")]
    InsufficientBuffer(usize),
    #[error("operation not supported by the reader")]
    NotSupported,
    #[error("no card present in the slot")]
    IccNotPresent,
    #[error("parity error during the exchange")]
    ParityError,
}

pub type IfdResult<T> = Result<T, IfdError>;

/// Log severity used when reporting a bError register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorSeverity {
    /// The failure may be expected by the caller (CmdEscapeCheck in mayfail
    /// mode): keep the noise down.
    Info,
    Error,
}

/// Log a bError register value with a human readable meaning.
pub(crate) fn ccid_error(severity: ErrorSeverity, b_error: u8, context: &str) {
    let meaning = match b_error {
        ccid_const::CMD_ABORTED => "Command aborted by control pipe",
        ccid_const::ICC_MUTE => "Card absent or mute",
        ccid_const::XFR_PARITY_ERROR => "Parity error during exchange",
        ccid_const::XFR_OVERRUN => "Overrun error while talking to the card",
        ccid_const::HW_ERROR => "Hardware error",
        ccid_const::BAD_ATR_TS => "Invalid TS in ATR",
        ccid_const::BAD_ATR_TCK => "Invalid TCK in ATR",
        ccid_const::ICC_PROTOCOL_NOT_SUPPORTED => "Protocol not managed by the reader",
        ccid_const::ICC_CLASS_NOT_SUPPORTED => "Card class not supported",
        ccid_const::PROCEDURE_BYTE_CONFLICT => "Procedure byte conflict",
        ccid_const::DEACTIVATED_PROTOCOL => "Deactivated protocol",
        ccid_const::BUSY_WITH_AUTO_SEQUENCE => "Busy with auto sequence",
        ccid_const::PIN_TIMEOUT => "PIN timeout",
        ccid_const::PIN_CANCELLED => "PIN cancelled",
        ccid_const::CMD_SLOT_BUSY => "Slot busy with another command",
        ccid_const::CMD_NOT_SUPPORTED => "Command not supported",
        0x01..=0x7F => "Invalid parameter in the command",
        0x81..=0xC0 => "User defined error",
        _ => "Reserved for future use",
    };
    match severity {
        ErrorSeverity::Info => info!("{}: bError 0x{:02X}: {}", context, b_error, meaning),
        ErrorSeverity::Error => error!("{}: bError 0x{:02X}: {}", context, b_error, meaning),
    }
}
