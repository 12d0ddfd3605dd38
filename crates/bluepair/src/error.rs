//! Error types for the pairing engine
//!
//! Two layers: [`ErrorCode`] is the wire-visible Pairing Failed reason code,
//! [`Error`] is the host-side error surfaced to local callers.

use crate::constants::*;
use thiserror::Error;

/// Pairing Failed reason codes (Vol 3, Part H, 3.5.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("passkey entry failed")]
    PasskeyEntryFailed,

    #[error("OOB data not available")]
    OobNotAvailable,

    #[error("authentication requirements cannot be met")]
    AuthenticationRequirements,

    #[error("confirm value failed")]
    ConfirmValueFailed,

    #[error("pairing not supported")]
    PairingNotSupported,

    #[error("encryption key size")]
    EncryptionKeySize,

    #[error("command not supported")]
    CommandNotSupported,

    #[error("unspecified reason")]
    UnspecifiedReason,

    #[error("repeated attempts")]
    RepeatedAttempts,

    #[error("invalid parameters")]
    InvalidParameters,

    #[error("DHKey check failed")]
    DhKeyCheckFailed,

    #[error("numeric comparison failed")]
    NumericComparisonFailed,

    #[error("BR/EDR pairing in progress")]
    BrEdrPairingInProgress,

    #[error("cross-transport key derivation not allowed")]
    CrossTransportKeyNotAllowed,
}

impl ErrorCode {
    /// Convert to the wire reason byte.
    pub fn to_u8(self) -> u8 {
        match self {
            ErrorCode::PasskeyEntryFailed => SMP_REASON_PASSKEY_ENTRY_FAILED,
            ErrorCode::OobNotAvailable => SMP_REASON_OOB_NOT_AVAILABLE,
            ErrorCode::AuthenticationRequirements => SMP_REASON_AUTHENTICATION_REQUIREMENTS,
            ErrorCode::ConfirmValueFailed => SMP_REASON_CONFIRM_VALUE_FAILED,
            ErrorCode::PairingNotSupported => SMP_REASON_PAIRING_NOT_SUPPORTED,
            ErrorCode::EncryptionKeySize => SMP_REASON_ENCRYPTION_KEY_SIZE,
            ErrorCode::CommandNotSupported => SMP_REASON_COMMAND_NOT_SUPPORTED,
            ErrorCode::UnspecifiedReason => SMP_REASON_UNSPECIFIED_REASON,
            ErrorCode::RepeatedAttempts => SMP_REASON_REPEATED_ATTEMPTS,
            ErrorCode::InvalidParameters => SMP_REASON_INVALID_PARAMETERS,
            ErrorCode::DhKeyCheckFailed => SMP_REASON_DHKEY_CHECK_FAILED,
            ErrorCode::NumericComparisonFailed => SMP_REASON_NUMERIC_COMPARISON_FAILED,
            ErrorCode::BrEdrPairingInProgress => SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS,
            ErrorCode::CrossTransportKeyNotAllowed => SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED,
        }
    }

    /// Convert from the wire reason byte. Unknown codes decode as
    /// `UnspecifiedReason`, matching how reserved values are treated.
    pub fn from_u8(value: u8) -> Self {
        match value {
            SMP_REASON_PASSKEY_ENTRY_FAILED => ErrorCode::PasskeyEntryFailed,
            SMP_REASON_OOB_NOT_AVAILABLE => ErrorCode::OobNotAvailable,
            SMP_REASON_AUTHENTICATION_REQUIREMENTS => ErrorCode::AuthenticationRequirements,
            SMP_REASON_CONFIRM_VALUE_FAILED => ErrorCode::ConfirmValueFailed,
            SMP_REASON_PAIRING_NOT_SUPPORTED => ErrorCode::PairingNotSupported,
            SMP_REASON_ENCRYPTION_KEY_SIZE => ErrorCode::EncryptionKeySize,
            SMP_REASON_COMMAND_NOT_SUPPORTED => ErrorCode::CommandNotSupported,
            SMP_REASON_REPEATED_ATTEMPTS => ErrorCode::RepeatedAttempts,
            SMP_REASON_INVALID_PARAMETERS => ErrorCode::InvalidParameters,
            SMP_REASON_DHKEY_CHECK_FAILED => ErrorCode::DhKeyCheckFailed,
            SMP_REASON_NUMERIC_COMPARISON_FAILED => ErrorCode::NumericComparisonFailed,
            SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS => ErrorCode::BrEdrPairingInProgress,
            SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED => ErrorCode::CrossTransportKeyNotAllowed,
            _ => ErrorCode::UnspecifiedReason,
        }
    }
}

/// Host-side pairing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// A protocol failure that was (or will be) reported to the peer.
    #[error("pairing failed: {0}")]
    Protocol(ErrorCode),

    /// The peer reported a Pairing Failed with the given reason.
    #[error("peer reported pairing failure: {0}")]
    PeerRejected(ErrorCode),

    /// The pairing timer expired. Locally detected; also triggers link
    /// disconnection.
    #[error("pairing timed out")]
    TimedOut,

    /// The SMP channel closed mid-pairing.
    #[error("channel closed")]
    ChannelClosed,

    /// The pairing was aborted locally.
    #[error("canceled")]
    Canceled,

    /// A payload was malformed beyond what a reason code can express.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Local state does not permit the operation.
    #[error("invalid state for operation")]
    InvalidState,

    /// Link-layer encryption failed to come up.
    #[error("link encryption failed")]
    EncryptionFailed,
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::Protocol(code)
    }
}

/// Result type for pairing operations.
pub type Result<T> = std::result::Result<T, Error>;
