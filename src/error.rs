//! Error taxonomy. Three actor-scoped enums (device, channel, transport), a
//! shared wire-facing [`SignalingErrorCode`], and the `SignalingError` value
//! sent to the peer over the WebSocket `ERROR` envelope.

use std::fmt;

/// Wire error codes carried in a WebSocket `ERROR` envelope's `error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingErrorCode {
    DecodeError,
    VerificationError,
    ChannelClosed,
    ChannelNotFound,
    NoMoreChannels,
    AccessDenied,
    InternalError,
}

impl SignalingErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingErrorCode::DecodeError => "DECODE_ERROR",
            SignalingErrorCode::VerificationError => "VERIFICATION_ERROR",
            SignalingErrorCode::ChannelClosed => "CHANNEL_CLOSED",
            SignalingErrorCode::ChannelNotFound => "CHANNEL_NOT_FOUND",
            SignalingErrorCode::NoMoreChannels => "NO_MORE_CHANNELS",
            SignalingErrorCode::AccessDenied => "ACCESS_DENIED",
            SignalingErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for SignalingErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A `{code, message}` pair as carried on the wire and handed to error
/// listeners; application-chosen codes pass through as
/// [`SignalingErrorCode::InternalError`] with the original string preserved
/// in `raw_code` when they don't match one of the known variants.
#[derive(Debug, Clone)]
pub struct SignalingError {
    pub code: SignalingErrorCode,
    pub raw_code: String,
    pub message: Option<String>,
}

impl SignalingError {
    pub fn new(code: SignalingErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            raw_code: code.as_str().to_string(),
            message: Some(message.into()),
        }
    }

    pub fn from_wire(raw_code: String, message: Option<String>) -> Self {
        let code = match raw_code.as_str() {
            "DECODE_ERROR" => SignalingErrorCode::DecodeError,
            "VERIFICATION_ERROR" => SignalingErrorCode::VerificationError,
            "CHANNEL_CLOSED" => SignalingErrorCode::ChannelClosed,
            "CHANNEL_NOT_FOUND" => SignalingErrorCode::ChannelNotFound,
            "NO_MORE_CHANNELS" => SignalingErrorCode::NoMoreChannels,
            "ACCESS_DENIED" => SignalingErrorCode::AccessDenied,
            _ => SignalingErrorCode::InternalError,
        };
        Self {
            code,
            raw_code,
            message,
        }
    }
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{}: {}", self.raw_code, m),
            None => write!(f, "{}", self.raw_code),
        }
    }
}

/// Errors raised by [`crate::device::SignalingDevice`].
#[derive(Debug, Clone)]
pub enum DeviceError {
    /// Attach HTTP request failed (non-2xx, transport error, or unparsable body).
    AttachFailed(String),
    /// The token provider reported an unrecoverable failure; the device
    /// transitions to `FAILED` and does not retry.
    TokenProviderFailed(String),
    /// A WebSocket envelope could not be parsed.
    DecodeError(String),
    /// An inbound frame referenced a channel id with no matching channel.
    ChannelNotFound(String),
    /// An inbound frame would create a channel but no new-channel listener
    /// is registered.
    NoListener,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::AttachFailed(reason) => write!(f, "attach failed: {reason}"),
            DeviceError::TokenProviderFailed(reason) => {
                write!(f, "token provider failed: {reason}")
            }
            DeviceError::DecodeError(reason) => write!(f, "decode error: {reason}"),
            DeviceError::ChannelNotFound(id) => write!(f, "channel not found: {id}"),
            DeviceError::NoListener => write!(f, "no new-channel listener registered"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl DeviceError {
    pub fn code(&self) -> SignalingErrorCode {
        match self {
            DeviceError::AttachFailed(_) => SignalingErrorCode::InternalError,
            DeviceError::TokenProviderFailed(_) => SignalingErrorCode::InternalError,
            DeviceError::DecodeError(_) => SignalingErrorCode::DecodeError,
            DeviceError::ChannelNotFound(_) => SignalingErrorCode::ChannelNotFound,
            DeviceError::NoListener => SignalingErrorCode::InternalError,
        }
    }
}

/// Errors raised by [`crate::channel::SignalingChannel`].
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// Inbound DATA arrived with `seq` strictly greater than `recvSeq`.
    SequenceGap { expected: u32, got: u32 },
    /// A peer-originated `ERROR` envelope; the channel transitions to `FAILED`.
    PeerError(SignalingError),
    /// Operation attempted after `close()` / after `FAILED`.
    Closed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::SequenceGap { expected, got } => {
                write!(f, "sequence gap: expected {expected}, got {got}")
            }
            ChannelError::PeerError(e) => write!(f, "peer error: {e}"),
            ChannelError::Closed => write!(f, "channel is closed"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl ChannelError {
    pub fn code(&self) -> SignalingErrorCode {
        match self {
            ChannelError::SequenceGap { .. } => SignalingErrorCode::DecodeError,
            ChannelError::PeerError(e) => e.code,
            ChannelError::Closed => SignalingErrorCode::ChannelClosed,
        }
    }
}

/// Errors raised by a [`crate::transport::MessageTransport`] signer.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Envelope was not valid JSON, had the wrong `type`, or was missing a
    /// required field.
    Decode(String),
    /// HS256 signature mismatch, nonce mismatch, or out-of-order `messageSeq`.
    Verification(String),
    /// The key-lookup callback returned no secret for the given `kid`.
    UnknownKey(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Decode(reason) => write!(f, "decode error: {reason}"),
            TransportError::Verification(reason) => write!(f, "verification error: {reason}"),
            TransportError::UnknownKey(kid) => write!(f, "unknown key id: {kid}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    pub fn code(&self) -> SignalingErrorCode {
        match self {
            TransportError::Decode(_) => SignalingErrorCode::DecodeError,
            TransportError::Verification(_) => SignalingErrorCode::VerificationError,
            TransportError::UnknownKey(_) => SignalingErrorCode::VerificationError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_known_code() {
        let e = SignalingError::from_wire("CHANNEL_NOT_FOUND".into(), Some("no such id".into()));
        assert_eq!(e.code, SignalingErrorCode::ChannelNotFound);
        assert_eq!(e.code.as_str(), "CHANNEL_NOT_FOUND");
    }

    #[test]
    fn unknown_code_maps_to_internal_error_but_preserves_raw() {
        let e = SignalingError::from_wire("SOMETHING_ELSE".into(), None);
        assert_eq!(e.code, SignalingErrorCode::InternalError);
        assert_eq!(e.raw_code, "SOMETHING_ELSE");
    }
}
