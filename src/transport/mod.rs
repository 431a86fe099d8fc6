//! Message transport (§4.5): authenticity, replay protection, and the
//! `SETUP_REQUEST`/`SETUP_RESPONSE` handshake, layered above a
//! [`SignalingChannel`]. Two signer modes are provided: [`none::NoneSigner`]
//! (pass-through) and [`shared_secret::SharedSecretSigner`] (JWT/HS256).

pub mod none;
pub mod shared_secret;

use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapters::IceServer;
use crate::channel::SignalingChannel;
use crate::error::{SignalingError, TransportError};
use crate::util::{ListenerId, ListenerRegistry};

/// An SDP description carried over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// An ICE candidate carried over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// A tagged sum of the two WebRTC payload shapes a [`MessageTransport`]
/// carries (§3: "a tagged sum of Description and Candidate").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebrtcSignalingMessage {
    Description(Description),
    Candidate(Candidate),
}

impl WebrtcSignalingMessage {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            WebrtcSignalingMessage::Description(d) => {
                serde_json::to_value(d).expect("Description serialization is infallible")
            }
            WebrtcSignalingMessage::Candidate(c) => {
                serde_json::to_value(c).expect("Candidate serialization is infallible")
            }
        }
    }

    /// Distinguished by shape, not an internal tag: `sdp` means Description,
    /// `candidate` means Candidate (mirrors the reference transport's
    /// `isDescription()`/`isCandidate()` probes).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        if value.get("sdp").is_some() {
            serde_json::from_value(value.clone())
                .map(WebrtcSignalingMessage::Description)
                .map_err(|e| e.to_string())
        } else if value.get("candidate").is_some() {
            serde_json::from_value(value.clone())
                .map(WebrtcSignalingMessage::Candidate)
                .map_err(|e| e.to_string())
        } else {
            Err("value is neither a Description nor a Candidate".to_string())
        }
    }
}

/// The signed/unsigned envelope wrapping transport payloads on the wire
/// (§3 Signed envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignedEnvelope {
    #[serde(rename = "NONE")]
    None { message: serde_json::Value },
    #[serde(rename = "JWT")]
    Jwt { jwt: String },
}

impl SignedEnvelope {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("SignedEnvelope serialization is infallible")
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| e.to_string())
    }
}

/// A pluggable signer: `None` (pass-through) or `Shared-Secret` (JWT/HS256).
/// Implementations hold their own nonce/sequence state behind interior
/// mutability since one instance is bound to one direction of one channel.
pub trait Signer: Send + Sync {
    fn sign(&self, message: serde_json::Value) -> Result<SignedEnvelope, TransportError>;
    fn verify(&self, envelope: &SignedEnvelope) -> Result<serde_json::Value, TransportError>;
}

/// Supplies the ICE-server list for the setup handshake; implemented by
/// [`crate::device::SignalingDevice`].
pub trait IceServerSource: Send + Sync {
    fn ice_servers(&self, callback: Box<dyn FnOnce(Vec<IceServer>) + Send>);
}

type MessageListener = dyn Fn(WebrtcSignalingMessage) + Send + Sync;
type SetupDoneListener = dyn Fn(Vec<IceServer>) + Send + Sync;
type ErrorListener = dyn Fn(SignalingError) + Send + Sync;

#[derive(Default)]
struct Inner {
    message_listeners: ListenerRegistry<MessageListener>,
    setup_done_listeners: ListenerRegistry<SetupDoneListener>,
    error_listeners: ListenerRegistry<ErrorListener>,
}

const SETUP_REQUEST_TYPE: &str = "SETUP_REQUEST";
const SETUP_RESPONSE_TYPE: &str = "SETUP_RESPONSE";

fn setup_request_json() -> serde_json::Value {
    serde_json::json!({"type": SETUP_REQUEST_TYPE})
}

fn setup_response_json(ice_servers: &[IceServer]) -> serde_json::Value {
    serde_json::json!({"type": SETUP_RESPONSE_TYPE, "iceServers": ice_servers})
}

/// Sits above one [`SignalingChannel`], signing outbound payloads and
/// verifying/dispatching inbound ones (§4.5).
pub struct MessageTransport {
    channel: Arc<SignalingChannel>,
    ice_source: Arc<dyn IceServerSource>,
    signer: Arc<dyn Signer>,
    inner: Mutex<Inner>,
}

impl MessageTransport {
    pub fn new(
        channel: Arc<SignalingChannel>,
        ice_source: Arc<dyn IceServerSource>,
        signer: Arc<dyn Signer>,
    ) -> Arc<Self> {
        let transport = Arc::new(Self {
            channel: channel.clone(),
            ice_source,
            signer,
            inner: Mutex::new(Inner::default()),
        });
        let weak: Weak<MessageTransport> = Arc::downgrade(&transport);
        channel.add_message_listener(Arc::new(move |data| {
            if let Some(this) = weak.upgrade() {
                this.on_channel_message(data);
            }
        }));
        transport
    }

    pub fn add_message_listener(&self, listener: Arc<MessageListener>) -> ListenerId {
        self.inner.lock().unwrap().message_listeners.add(listener)
    }

    pub fn remove_message_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().message_listeners.remove(id);
    }

    pub fn add_setup_done_listener(&self, listener: Arc<SetupDoneListener>) -> ListenerId {
        self.inner.lock().unwrap().setup_done_listeners.add(listener)
    }

    pub fn remove_setup_done_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().setup_done_listeners.remove(id);
    }

    pub fn add_error_listener(&self, listener: Arc<ErrorListener>) -> ListenerId {
        self.inner.lock().unwrap().error_listeners.add(listener)
    }

    pub fn remove_error_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().error_listeners.remove(id);
    }

    /// Signs `message` and forwards it to the channel. Signing failures are
    /// surfaced as `VERIFICATION_ERROR` on the channel and to error listeners.
    pub fn send_message(self: &Arc<Self>, message: WebrtcSignalingMessage) {
        match self.signer.sign(message.to_json()) {
            Ok(envelope) => {
                self.channel.send_message(envelope.to_json());
            }
            Err(e) => self.surface_error(e),
        }
    }

    /// Requests ICE servers and sends a `SETUP_REQUEST`; the peer's
    /// `SETUP_RESPONSE` arrives through the usual setup-done listeners.
    pub fn request_setup(self: &Arc<Self>) {
        match self.signer.sign(setup_request_json()) {
            Ok(envelope) => self.channel.send_message(envelope.to_json()),
            Err(e) => self.surface_error(e),
        }
    }

    fn on_channel_message(self: &Arc<Self>, data: serde_json::Value) {
        let envelope = match SignedEnvelope::from_json(&data) {
            Ok(e) => e,
            Err(reason) => {
                self.surface_error(TransportError::Decode(reason));
                return;
            }
        };
        match self.signer.verify(&envelope) {
            Ok(inner) => self.handle_verified(inner),
            Err(e) => self.surface_error(e),
        }
    }

    fn handle_verified(self: &Arc<Self>, inner: serde_json::Value) {
        match inner.get("type").and_then(|t| t.as_str()) {
            Some(SETUP_REQUEST_TYPE) => self.handle_setup_request(),
            Some(SETUP_RESPONSE_TYPE) => {
                let ice_servers: Vec<IceServer> = inner
                    .get("iceServers")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let listeners = self.inner.lock().unwrap().setup_done_listeners.snapshot();
                for listener in listeners {
                    listener(ice_servers.clone());
                }
            }
            _ => match WebrtcSignalingMessage::from_json(&inner) {
                Ok(msg) => {
                    let listeners = self.inner.lock().unwrap().message_listeners.snapshot();
                    for listener in listeners {
                        listener(msg.clone());
                    }
                }
                Err(reason) => {
                    warn!(reason = %reason, "transport: unrecognized inner payload, dropping");
                    self.surface_error(TransportError::Decode(reason));
                }
            },
        }
    }

    fn handle_setup_request(self: &Arc<Self>) {
        let this = self.clone();
        self.ice_source.ice_servers(Box::new(move |servers| {
            match this.signer.sign(setup_response_json(&servers)) {
                Ok(envelope) => this.channel.send_message(envelope.to_json()),
                Err(e) => {
                    this.surface_error(e);
                    return;
                }
            }
            let listeners = this.inner.lock().unwrap().setup_done_listeners.snapshot();
            for listener in listeners {
                listener(servers.clone());
            }
        }));
    }

    fn surface_error(&self, e: TransportError) {
        let wire = SignalingError::new(e.code(), e.to_string());
        warn!(error = %wire, "message transport error");
        self.channel.send_protocol_error(wire.clone());
        let listeners = self.inner.lock().unwrap().error_listeners.snapshot();
        for listener in listeners {
            listener(wire.clone());
        }
    }
}
