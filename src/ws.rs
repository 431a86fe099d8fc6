//! WebSocket envelope parsing and PING/PONG liveness (§4.2). This layer owns
//! exactly one [`crate::adapters::WsTransport`] instance and has no notion of
//! channels or sequencing — it hands typed envelopes up to the device and
//! otherwise only watches for a dead socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::{Timer, TimerFactory, WsEvent, WsTransport};

pub const LIVENESS_TIMEOUT_MS: u64 = 1_000;

/// An inbound/outbound error payload, as carried in `ERROR` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The top-level WebSocket envelope (§3, §6.2). `message` is left as a raw
/// [`serde_json::Value`] here; the channel/transport layers parse it further.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsEnvelope {
    #[serde(rename = "MESSAGE")]
    Message {
        #[serde(rename = "channelId")]
        channel_id: String,
        message: serde_json::Value,
        #[serde(default)]
        authorized: bool,
    },
    #[serde(rename = "ERROR")]
    Error {
        #[serde(rename = "channelId")]
        channel_id: String,
        error: WireError,
    },
    #[serde(rename = "PEER_OFFLINE")]
    PeerOffline {
        #[serde(rename = "channelId")]
        channel_id: String,
    },
    #[serde(rename = "PEER_CONNECTED")]
    PeerConnected {
        #[serde(rename = "channelId")]
        channel_id: String,
    },
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
}

/// Parses one inbound text frame. Unknown `type` values and malformed JSON
/// are reported as `Ok(None)` so the caller can log-and-drop per §4.2
/// ("Unknown types are logged and dropped (non-fatal)").
pub fn parse_envelope(text: &str) -> Option<WsEnvelope> {
    match serde_json::from_str::<WsEnvelope>(text) {
        Ok(env) => Some(env),
        Err(_) => {
            warn!(frame = %text, "dropping unparsable or unrecognized WebSocket frame");
            None
        }
    }
}

pub fn serialize_envelope(env: &WsEnvelope) -> String {
    serde_json::to_string(env).expect("WsEnvelope serialization is infallible")
}

/// Wraps a raw [`WsTransport`] with liveness checking. Construction does not
/// start anything; call [`WsFraming::open`] once an event handler consumer is
/// ready to receive dispatched envelopes.
pub struct WsFraming {
    transport: Arc<dyn WsTransport>,
    timer_factory: Arc<dyn TimerFactory>,
    pong_counter: Arc<AtomicU64>,
    liveness_timer: std::sync::Mutex<Option<Box<dyn Timer>>>,
}

impl WsFraming {
    pub fn new(transport: Arc<dyn WsTransport>, timer_factory: Arc<dyn TimerFactory>) -> Self {
        Self {
            transport,
            timer_factory,
            pong_counter: Arc::new(AtomicU64::new(0)),
            liveness_timer: std::sync::Mutex::new(None),
        }
    }

    pub fn send(&self, env: &WsEnvelope) {
        self.transport.send(serialize_envelope(env));
    }

    pub fn close(&self) {
        if let Some(timer) = self.liveness_timer.lock().unwrap().take() {
            timer.cancel();
        }
        self.transport.close();
    }

    /// Call on every inbound frame; bumps the pong counter and otherwise
    /// leaves dispatch to the caller.
    pub fn note_pong(&self) {
        self.pong_counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Sends a PING and arms a 1 s timer; `on_dead` fires if no PONG arrived
    /// in that window. Per §4.2, failing liveness closes the socket, which
    /// the device interprets as a connection drop and reconnects.
    pub fn check_alive(self: &Arc<Self>, on_dead: impl FnOnce() + Send + 'static) {
        debug!("sending liveness PING");
        self.send(&WsEnvelope::Ping);
        let seen_before = self.pong_counter.load(Ordering::SeqCst);
        let pong_counter = self.pong_counter.clone();
        let this = self.clone();
        let timer = self.timer_factory.set_timeout(
            LIVENESS_TIMEOUT_MS,
            Box::new(move || {
                if pong_counter.load(Ordering::SeqCst) == seen_before {
                    warn!("no PONG within liveness window, closing socket");
                    this.transport.close();
                    on_dead();
                }
            }),
        );
        *self.liveness_timer.lock().unwrap() = Some(timer);
    }
}

/// Convenience re-export so callers can match on adapter events without a
/// separate import; not otherwise transformed by this module.
pub type RawWsEvent = WsEvent;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_envelope() {
        let text = r#"{"type":"MESSAGE","channelId":"c1","message":{"type":"DATA","seq":0,"data":{}},"authorized":true}"#;
        match parse_envelope(text) {
            Some(WsEnvelope::Message {
                channel_id,
                authorized,
                ..
            }) => {
                assert_eq!(channel_id, "c1");
                assert!(authorized);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn authorized_defaults_false() {
        let text = r#"{"type":"MESSAGE","channelId":"c1","message":{}}"#;
        match parse_envelope(text) {
            Some(WsEnvelope::Message { authorized, .. }) => assert!(!authorized),
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_dropped_not_fatal() {
        assert!(parse_envelope(r#"{"type":"BOGUS"}"#).is_none());
        assert!(parse_envelope("not json").is_none());
    }

    #[test]
    fn ping_pong_round_trip_through_serde() {
        let s = serialize_envelope(&WsEnvelope::Ping);
        assert_eq!(s, r#"{"type":"PING"}"#);
        assert!(matches!(parse_envelope(&s), Some(WsEnvelope::Ping)));
    }
}
