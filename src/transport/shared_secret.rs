//! The Shared-Secret signer: JWT/HS256 sign and verify with mutual nonces
//! and a monotonic `messageSeq` (§4.5 Modes: Shared-Secret).

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::util::generate_uuid_v4;

use super::{SignedEnvelope, Signer};

/// Resolves the shared secret for a given `kid` (may be absent). Mirrors the
/// reference signer's key-lookup callback (§4.5: "The key-lookup callback
/// receives the verified JWT's `kid`... and must return the shared secret").
pub trait SharedSecretKeyLookup: Send + Sync {
    fn lookup(&self, kid: Option<&str>) -> Option<Vec<u8>>;
}

/// A fixed single-secret lookup, for the common case of one shared secret
/// per channel regardless of `kid`.
pub struct FixedSecret(pub Vec<u8>);

impl SharedSecretKeyLookup for FixedSecret {
    fn lookup(&self, _kid: Option<&str>) -> Option<Vec<u8>> {
        Some(self.0.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    typ: String,
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    message: serde_json::Value,
    #[serde(rename = "messageSeq")]
    message_seq: u32,
    #[serde(rename = "signerNonce")]
    signer_nonce: String,
    #[serde(rename = "verifierNonce", default, skip_serializing_if = "Option::is_none")]
    verifier_nonce: Option<String>,
}

struct SignerState {
    next_sign_seq: u32,
    next_verify_seq: u32,
    remote_nonce: Option<String>,
}

/// One instance binds one direction's nonce/sequence state; construct a
/// fresh one per channel side (§4.5: "Each side generates a local nonce...
/// at construction").
pub struct SharedSecretSigner {
    secret_id: String,
    local_nonce: String,
    sign_secret: Vec<u8>,
    key_lookup: Arc<dyn SharedSecretKeyLookup>,
    state: Mutex<SignerState>,
}

impl SharedSecretSigner {
    pub fn new(
        sign_secret: Vec<u8>,
        secret_id: Option<String>,
        key_lookup: Arc<dyn SharedSecretKeyLookup>,
    ) -> Self {
        Self {
            secret_id: secret_id.unwrap_or_default(),
            local_nonce: generate_uuid_v4(),
            sign_secret,
            key_lookup,
            state: Mutex::new(SignerState {
                next_sign_seq: 0,
                next_verify_seq: 0,
                remote_nonce: None,
            }),
        }
    }

    /// Convenience constructor for the common case where both sides already
    /// share one secret out of band and `kid` is unused.
    pub fn with_fixed_secret(secret: Vec<u8>) -> Self {
        Self::new(secret.clone(), None, Arc::new(FixedSecret(secret)))
    }

    pub fn local_nonce(&self) -> &str {
        &self.local_nonce
    }
}

struct ParsedJwt {
    header: Header,
    signing_input: String,
    signature: Vec<u8>,
    claims_b64: String,
}

fn parse_jwt(jwt: &str) -> Result<ParsedJwt, TransportError> {
    let mut parts = jwt.split('.');
    let header_b64 = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransportError::Decode("missing JWT header segment".into()))?;
    let claims_b64 = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransportError::Decode("missing JWT payload segment".into()))?;
    let sig_b64 = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransportError::Decode("missing JWT signature segment".into()))?;
    if parts.next().is_some() {
        return Err(TransportError::Decode("too many JWT segments".into()));
    }
    let header_json = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|e| TransportError::Decode(format!("bad JWT header encoding: {e}")))?;
    let header: Header = serde_json::from_slice(&header_json)
        .map_err(|e| TransportError::Decode(format!("bad JWT header JSON: {e}")))?;
    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|e| TransportError::Decode(format!("bad JWT signature encoding: {e}")))?;
    Ok(ParsedJwt {
        header,
        signing_input: format!("{header_b64}.{claims_b64}"),
        signature,
        claims_b64: claims_b64.to_string(),
    })
}

fn hs256_sign(signing_input: &str, secret: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, signing_input.as_bytes());
    URL_SAFE_NO_PAD.encode(tag.as_ref())
}

impl Signer for SharedSecretSigner {
    fn sign(&self, message: serde_json::Value) -> Result<SignedEnvelope, TransportError> {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_sign_seq;
        if seq != 0 && state.remote_nonce.is_none() {
            return Err(TransportError::Verification(
                "cannot sign messageSeq >= 1 before a remote nonce is established".into(),
            ));
        }
        let verifier_nonce = if seq == 0 { None } else { state.remote_nonce.clone() };
        state.next_sign_seq += 1;
        drop(state);

        let header = Header {
            typ: "JWT".to_string(),
            alg: "HS256".to_string(),
            kid: if self.secret_id.is_empty() {
                None
            } else {
                Some(self.secret_id.clone())
            },
        };
        let claims = Claims {
            message,
            message_seq: seq,
            signer_nonce: self.local_nonce.clone(),
            verifier_nonce,
        };
        let header_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&header).expect("Header serialization is infallible"),
        );
        let claims_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims).expect("Claims serialization is infallible"),
        );
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature_b64 = hs256_sign(&signing_input, &self.sign_secret);
        Ok(SignedEnvelope::Jwt {
            jwt: format!("{signing_input}.{signature_b64}"),
        })
    }

    fn verify(&self, envelope: &SignedEnvelope) -> Result<serde_json::Value, TransportError> {
        let jwt = match envelope {
            SignedEnvelope::Jwt { jwt } => jwt,
            SignedEnvelope::None { .. } => {
                return Err(TransportError::Decode("expected a JWT envelope, got NONE".into()))
            }
        };
        let parsed = parse_jwt(jwt)?;
        let secret = self
            .key_lookup
            .lookup(parsed.header.kid.as_deref())
            .ok_or_else(|| TransportError::UnknownKey(parsed.header.kid.clone().unwrap_or_default()))?;

        let key = hmac::Key::new(hmac::HMAC_SHA256, &secret);
        hmac::verify(&key, parsed.signing_input.as_bytes(), &parsed.signature)
            .map_err(|_| TransportError::Verification("HS256 signature mismatch".into()))?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(&parsed.claims_b64)
            .map_err(|e| TransportError::Decode(format!("bad JWT payload encoding: {e}")))?;
        let claims: Claims = serde_json::from_slice(&claims_json)
            .map_err(|e| TransportError::Decode(format!("bad JWT payload JSON: {e}")))?;

        let mut state = self.state.lock().unwrap();
        if claims.message_seq != state.next_verify_seq {
            return Err(TransportError::Verification(format!(
                "expected messageSeq {}, got {}",
                state.next_verify_seq, claims.message_seq
            )));
        }
        if claims.message_seq == 0 {
            state.remote_nonce = Some(claims.signer_nonce.clone());
        } else {
            if state.remote_nonce.as_deref() != Some(claims.signer_nonce.as_str()) {
                return Err(TransportError::Verification("signerNonce mismatch".into()));
            }
            if claims.verifier_nonce.as_deref() != Some(self.local_nonce.as_str()) {
                return Err(TransportError::Verification("verifierNonce mismatch".into()));
            }
        }
        state.next_verify_seq += 1;
        Ok(claims.message)
    }
}
