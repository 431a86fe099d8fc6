//! The `None` signer: wraps/unwraps a plaintext envelope, no sequence or
//! nonce state (§4.5 Modes: None).

use crate::error::TransportError;

use super::{SignedEnvelope, Signer};

#[derive(Debug, Default, Clone, Copy)]
pub struct NoneSigner;

impl Signer for NoneSigner {
    fn sign(&self, message: serde_json::Value) -> Result<SignedEnvelope, TransportError> {
        Ok(SignedEnvelope::None { message })
    }

    fn verify(&self, envelope: &SignedEnvelope) -> Result<serde_json::Value, TransportError> {
        match envelope {
            SignedEnvelope::None { message } => Ok(message.clone()),
            SignedEnvelope::Jwt { .. } => {
                Err(TransportError::Decode("expected a NONE envelope, got JWT".into()))
            }
        }
    }
}
