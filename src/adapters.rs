//! Collaborator traits the host application implements: HTTP client,
//! WebSocket transport, timer source, and bearer-token generation. None of
//! these are implemented by this crate — §1 places them out of scope — but
//! every suspension point in the device/channel state machines is expressed
//! against them so the core never depends on a particular async runtime.

use std::fmt;

/// A single outbound HTTP request, always a POST with a JSON body in this
/// library's usage.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub bearer_token: String,
    pub body: serde_json::Value,
}

/// Outcome of an HTTP request: the adapter reports the status line and body
/// bytes (or a transport-level failure) and the caller interprets it.
#[derive(Debug, Clone)]
pub enum HttpResponse {
    /// A response was received; 2xx is success, anything else is a failure
    /// the attach client treats as retryable.
    Status { code: u16, body: Vec<u8> },
    /// The request never completed (DNS, TLS, connection reset, timeout —
    /// whatever the adapter considers terminal for this attempt).
    TransportError(String),
}

/// Completion callback for an in-flight HTTP request. Invoked exactly once,
/// from whatever thread the adapter's I/O runs on.
pub type HttpResponseCallback = Box<dyn FnOnce(HttpResponse) + Send>;

/// The HTTP client collaborator. `send_request` is fire-and-forget from the
/// caller's perspective: the callback fires later, possibly on another
/// thread, and the library never blocks waiting for it.
pub trait HttpClient: Send + Sync {
    fn send_request(&self, request: HttpRequest, callback: HttpResponseCallback);
}

/// Completion callback for asynchronous token generation.
pub type TokenCallback = Box<dyn FnOnce(Result<String, String>) + Send>;

/// Produces a bearer token for the attach/ICE-server HTTP calls. See §6.3:
/// this library treats the returned string as opaque and never parses it.
pub trait TokenProvider: Send + Sync {
    fn generate_token(&self, callback: TokenCallback);
}

/// Events the WebSocket adapter reports back to the device. Open/Message are
/// straightforward; Closed/Error both trigger reconnect handling and are
/// otherwise treated identically by the device (§4.3).
#[derive(Debug, Clone)]
pub enum WsEvent {
    Open,
    Message(String),
    Closed,
    Error(String),
}

pub type WsEventHandler = Box<dyn Fn(WsEvent) + Send + Sync>;

/// A single, already-connecting WebSocket. One instance per attach attempt;
/// replaced wholesale on reconnect (§3 Device session).
pub trait WsTransport: Send + Sync {
    /// Registers the callback that receives every event on this socket.
    /// Called once, before `open`.
    fn set_event_handler(&self, handler: WsEventHandler);
    /// Begins connecting. Completion is reported via `WsEvent::Open` or
    /// `WsEvent::Error` on the event handler, not a return value.
    fn open(&self);
    /// Best-effort send; the framing layer does not buffer or retry.
    fn send(&self, text: String);
    /// Closes the socket. Idempotent from the adapter's point of view.
    fn close(&self);
}

/// A single armed timer. `cancel` is safe to call after the timer has
/// already fired.
pub trait Timer: Send + Sync {
    fn cancel(&self);
}

pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Creates timers for reconnect waits and the 1 s liveness check.
pub trait TimerFactory: Send + Sync {
    fn set_timeout(&self, timeout_ms: u64, callback: TimerCallback) -> Box<dyn Timer>;
}

/// One entry of the `iceServers` list returned by `/v1/ice-servers` and
/// carried in `SETUP_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl fmt::Display for IceServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IceServer({})", self.urls.join(","))
    }
}
