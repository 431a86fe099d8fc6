//! Signaling device (§4.3): owns the WebSocket framing and attach client,
//! fans inbound frames to channels, and drives exponential-backoff
//! reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use crate::adapters::{HttpClient, IceServer, Timer, TimerFactory, TokenProvider, WsEvent, WsTransport};
use crate::attach::AttachClient;
use crate::channel::{is_initial_message, ChannelSink, SignalingChannel};
use crate::error::{DeviceError, SignalingError, SignalingErrorCode};
use crate::util::{ListenerId, ListenerRegistry};
use crate::ws::{parse_envelope, WsEnvelope, WsFraming};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingDeviceState {
    New,
    Connecting,
    Connected,
    WaitRetry,
    Failed,
    Closed,
}

impl SignalingDeviceState {
    fn is_terminal(self) -> bool {
        matches!(self, SignalingDeviceState::Closed | SignalingDeviceState::Failed)
    }
}

/// Caps the exponential backoff at `2^6 == 64`, rounded down to the 60 s
/// ceiling (§4.3 Backoff: `min(2^n, 60)` seconds).
const BACKOFF_CAP_SECS: u64 = 60;

fn backoff_secs(attempt: u32) -> u64 {
    2u64.saturating_pow(attempt).min(BACKOFF_CAP_SECS)
}

/// Immutable configuration for one [`SignalingDevice`] (§3 Device session).
pub struct DeviceConfig {
    pub product_id: String,
    pub device_id: String,
    pub http_host: String,
    pub http: Arc<dyn HttpClient>,
    pub token_provider: Arc<dyn TokenProvider>,
    pub timer_factory: Arc<dyn TimerFactory>,
    /// Constructs a fresh WebSocket transport for a given `wss://` URL; called
    /// once per attach attempt.
    pub ws_factory: Arc<dyn Fn(&str) -> Arc<dyn WsTransport> + Send + Sync>,
}

type StateListener = dyn Fn(SignalingDeviceState) + Send + Sync;
type ReconnectListener = dyn Fn() + Send + Sync;
type NewChannelListener = dyn Fn(Arc<SignalingChannel>) + Send + Sync;

struct Inner {
    state: SignalingDeviceState,
    channels: HashMap<String, Arc<SignalingChannel>>,
    framing: Option<Arc<WsFraming>>,
    reconnect_timer: Option<Box<dyn Timer>>,
    reconnect_attempt: u32,
    first_connect: bool,
    state_listeners: ListenerRegistry<StateListener>,
    reconnect_listeners: ListenerRegistry<ReconnectListener>,
    new_channel_listener: Option<Arc<NewChannelListener>>,
    closed_notified: bool,
}

/// The device session (§3, §4.3). Always held behind `Arc` — construct with
/// [`SignalingDevice::new`], then call [`SignalingDevice::start`] once a
/// caller is ready to observe state transitions.
pub struct SignalingDevice {
    config_http_host: String,
    attach: AttachClient,
    ws_factory: Arc<dyn Fn(&str) -> Arc<dyn WsTransport> + Send + Sync>,
    timer_factory: Arc<dyn TimerFactory>,
    inner: Mutex<Inner>,
}

impl SignalingDevice {
    pub fn new(config: DeviceConfig) -> Arc<Self> {
        let attach = AttachClient::new(
            config.http.clone(),
            config.token_provider.clone(),
            config.http_host.clone(),
            config.product_id.clone(),
            config.device_id.clone(),
        );
        let device = Arc::new(Self {
            config_http_host: attach.http_host().to_string(),
            attach,
            ws_factory: config.ws_factory.clone(),
            timer_factory: config.timer_factory.clone(),
            inner: Mutex::new(Inner {
                state: SignalingDeviceState::New,
                channels: HashMap::new(),
                framing: None,
                reconnect_timer: None,
                reconnect_attempt: 0,
                first_connect: true,
                state_listeners: ListenerRegistry::new(),
                reconnect_listeners: ListenerRegistry::new(),
                new_channel_listener: None,
                closed_notified: false,
            }),
        });
        device
    }

    pub fn http_host(&self) -> &str {
        &self.config_http_host
    }

    pub fn state(&self) -> SignalingDeviceState {
        self.inner.lock().unwrap().state
    }

    pub fn add_state_listener(&self, listener: Arc<StateListener>) -> ListenerId {
        self.inner.lock().unwrap().state_listeners.add(listener)
    }

    pub fn remove_state_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().state_listeners.remove(id);
    }

    pub fn add_reconnect_listener(&self, listener: Arc<ReconnectListener>) -> ListenerId {
        self.inner.lock().unwrap().reconnect_listeners.add(listener)
    }

    pub fn remove_reconnect_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().reconnect_listeners.remove(id);
    }

    /// Registers the single listener invoked for inbound, unknown-channel
    /// `seq==0` DATA frames (§4.3 Routing). Only one may be registered; a
    /// second call replaces the first.
    pub fn set_new_channel_listener(&self, listener: Arc<NewChannelListener>) {
        self.inner.lock().unwrap().new_channel_listener = Some(listener);
    }

    /// Creates a channel the application originates toward a peer whose
    /// `channel_id` is already known out-of-band (§10.3).
    pub fn create_channel(self: &Arc<Self>, channel_id: String) -> Arc<SignalingChannel> {
        let sink: Weak<dyn ChannelSink> = self.as_weak_sink();
        let channel = SignalingChannel::new(channel_id.clone(), true, sink);
        self.inner.lock().unwrap().channels.insert(channel_id, channel.clone());
        channel
    }

    pub fn channel(&self, channel_id: &str) -> Option<Arc<SignalingChannel>> {
        self.inner.lock().unwrap().channels.get(channel_id).cloned()
    }

    fn as_weak_sink(self: &Arc<Self>) -> Weak<dyn ChannelSink> {
        Arc::downgrade(self) as Weak<dyn ChannelSink>
    }

    /// NEW -> CONNECTING, then drives attach (§4.3).
    pub fn start(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SignalingDeviceState::New {
            return;
        }
        self.transition(&mut inner, SignalingDeviceState::Connecting);
        drop(inner);
        self.do_connect();
    }

    fn do_connect(self: &Arc<Self>) {
        let this = self.clone();
        self.attach.attach(Box::new(move |result| match result {
            Ok(signaling_url) => this.connect_ws(signaling_url),
            Err(e) => {
                warn!(error = %e, "attach failed");
                this.wait_reconnect();
            }
        }));
    }

    fn connect_ws(self: &Arc<Self>, signaling_url: String) {
        let transport = (self.ws_factory)(&signaling_url);
        let framing = Arc::new(WsFraming::new(transport.clone(), self.timer_factory.clone()));
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return;
            }
            inner.framing = Some(framing.clone());
        }
        let this = self.clone();
        transport.set_event_handler(Box::new(move |event| this.handle_ws_event(event)));
        transport.open();
    }

    /// Drives the §4.2 PING/PONG liveness check; the application is expected
    /// to call this periodically (e.g. once a second) while connected. A
    /// failed check closes the socket and follows the usual reconnect path.
    pub fn check_alive(self: &Arc<Self>) {
        let framing = self.inner.lock().unwrap().framing.clone();
        if let Some(framing) = framing {
            let this = self.clone();
            framing.check_alive(move || this.on_ws_gone("liveness timeout"));
        }
    }

    fn handle_ws_event(self: &Arc<Self>, event: WsEvent) {
        match event {
            WsEvent::Open => self.on_ws_open(),
            WsEvent::Message(text) => self.on_ws_message(&text),
            WsEvent::Closed => self.on_ws_gone("closed"),
            WsEvent::Error(reason) => self.on_ws_gone(&reason),
        }
    }

    fn on_ws_open(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        let is_reconnect = !inner.first_connect;
        inner.first_connect = false;
        inner.reconnect_attempt = 0;
        self.transition(&mut inner, SignalingDeviceState::Connected);
        let listeners = if is_reconnect {
            inner.reconnect_listeners.snapshot()
        } else {
            Vec::new()
        };
        drop(inner);
        for listener in listeners {
            listener();
        }
    }

    fn on_ws_message(self: &Arc<Self>, text: &str) {
        let Some(env) = parse_envelope(text) else {
            return;
        };
        match env {
            WsEnvelope::Ping => {
                if let Some(framing) = self.inner.lock().unwrap().framing.clone() {
                    framing.send(&WsEnvelope::Pong);
                }
            }
            WsEnvelope::Pong => {
                if let Some(framing) = self.inner.lock().unwrap().framing.clone() {
                    framing.note_pong();
                }
            }
            WsEnvelope::Message {
                channel_id,
                message,
                authorized,
            } => self.route_message(channel_id, message, authorized),
            WsEnvelope::PeerOffline { channel_id } => {
                if let Some(ch) = self.channel(&channel_id) {
                    ch.peer_offline();
                }
            }
            WsEnvelope::PeerConnected { channel_id } => {
                if let Some(ch) = self.channel(&channel_id) {
                    ch.peer_connected();
                }
            }
            WsEnvelope::Error { channel_id, error } => {
                if let Some(ch) = self.channel(&channel_id) {
                    ch.handle_error(SignalingError::from_wire(error.code, error.message));
                }
            }
        }
    }

    /// §4.3 Routing.
    fn route_message(self: &Arc<Self>, channel_id: String, message: serde_json::Value, authorized: bool) {
        let frame_type = message.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let seq = message.get("seq").and_then(|s| s.as_u64()).map(|s| s as u32);

        if let Some(channel) = self.channel(&channel_id) {
            match frame_type {
                "DATA" => {
                    if let (Some(seq), Some(data)) = (seq, message.get("data").cloned()) {
                        channel.handle_data(seq, data);
                    } else {
                        let err = DeviceError::DecodeError(format!(
                            "malformed DATA frame on channel {channel_id}"
                        ));
                        warn!(channel_id = %channel_id, error = %err, "dropping");
                    }
                }
                "ACK" => {
                    if let Some(seq) = seq {
                        channel.handle_ack(seq);
                    } else {
                        let err = DeviceError::DecodeError(format!(
                            "malformed ACK frame on channel {channel_id}"
                        ));
                        warn!(channel_id = %channel_id, error = %err, "dropping");
                    }
                }
                other => warn!(channel_id = %channel_id, frame_type = other, "unknown inner frame type, dropping"),
            }
            return;
        }

        // Unknown channel id.
        if frame_type == "DATA" && seq.map(is_initial_message).unwrap_or(false) {
            let Some(data) = message.get("data").cloned() else {
                let err = DeviceError::DecodeError(format!(
                    "initial DATA frame on channel {channel_id} missing data"
                ));
                warn!(channel_id = %channel_id, error = %err, "dropping");
                return;
            };
            let listener = self.inner.lock().unwrap().new_channel_listener.clone();
            let Some(listener) = listener else {
                let err = DeviceError::NoListener;
                self.send_error(&channel_id, SignalingError::new(err.code(), err.to_string()));
                return;
            };
            let sink = self.as_weak_sink();
            let channel = SignalingChannel::new(channel_id.clone(), authorized, sink);
            self.inner.lock().unwrap().channels.insert(channel_id.clone(), channel.clone());
            listener(channel.clone());
            channel.handle_data(0, data);
        } else {
            let err = DeviceError::ChannelNotFound(channel_id.clone());
            self.send_error(&channel_id, SignalingError::new(err.code(), err.to_string()));
        }
    }

    fn send_error(&self, channel_id: &str, error: SignalingError) {
        if let Some(framing) = self.inner.lock().unwrap().framing.clone() {
            framing.send(&WsEnvelope::Error {
                channel_id: channel_id.to_string(),
                error: crate::ws::WireError {
                    code: error.raw_code,
                    message: error.message,
                },
            });
        }
    }

    fn on_ws_gone(self: &Arc<Self>, reason: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        debug!(reason, "websocket gone, scheduling reconnect");
        inner.framing = None;
        drop(inner);
        self.wait_reconnect();
    }

    /// §4.3 Backoff: `min(2^n, 60)` seconds; `n` increments on every call.
    fn wait_reconnect(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        self.transition(&mut inner, SignalingDeviceState::WaitRetry);
        let attempt = inner.reconnect_attempt;
        inner.reconnect_attempt += 1;
        let wait_secs = backoff_secs(attempt);
        info!(attempt, wait_secs, "scheduling reconnect attempt");
        let this = self.clone();
        let timer = self.timer_factory.set_timeout(
            wait_secs * 1000,
            Box::new(move || this.on_reconnect_timer()),
        );
        inner.reconnect_timer = Some(timer);
    }

    fn on_reconnect_timer(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        self.transition(&mut inner, SignalingDeviceState::Connecting);
        drop(inner);
        self.do_connect();
    }

    /// Fails the device permanently; no further retries (§6.3: token
    /// provider failure is unrecoverable).
    pub fn fail(self: &Arc<Self>, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        warn!(reason = %reason, "device failed permanently");
        self.transition(&mut inner, SignalingDeviceState::Failed);
    }

    /// Idempotent teardown (§4.3 Close semantics, §5 idempotence).
    pub fn close(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() || inner.closed_notified {
            return;
        }
        inner.closed_notified = true;
        inner.state = SignalingDeviceState::Closed;
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.cancel();
        }
        let channels: Vec<Arc<SignalingChannel>> = inner.channels.drain().map(|(_, c)| c).collect();
        let framing = inner.framing.take();
        let state_listeners = inner.state_listeners.snapshot();
        inner.state_listeners.clear();
        inner.reconnect_listeners.clear();
        inner.new_channel_listener = None;
        drop(inner);

        for channel in channels {
            channel.ws_closed();
        }
        if let Some(framing) = framing {
            framing.close();
        }
        for listener in state_listeners {
            listener(SignalingDeviceState::Closed);
        }
    }

    fn transition(&self, inner: &mut Inner, to: SignalingDeviceState) {
        if inner.state.is_terminal() {
            return;
        }
        info!(from = ?inner.state, to = ?to, "device state transition");
        inner.state = to;
        let listeners = inner.state_listeners.snapshot();
        for listener in listeners {
            listener(to);
        }
    }

    /// Requests the current ICE-server list (§4.1, used by the message
    /// transport's setup handshake, §4.5).
    pub fn ice_servers(&self, callback: Box<dyn FnOnce(Vec<IceServer>) + Send>) {
        self.attach.ice_servers(callback);
    }
}

impl crate::transport::IceServerSource for SignalingDevice {
    fn ice_servers(&self, callback: Box<dyn FnOnce(Vec<IceServer>) + Send>) {
        self.attach.ice_servers(callback);
    }
}

impl ChannelSink for SignalingDevice {
    fn send_channel_message(&self, channel_id: &str, frame: serde_json::Value) {
        if let Some(framing) = self.inner.lock().unwrap().framing.clone() {
            framing.send(&WsEnvelope::Message {
                channel_id: channel_id.to_string(),
                message: frame,
                authorized: false,
            });
        }
    }

    fn send_channel_error(&self, channel_id: &str, error: SignalingError) {
        self.send_error(channel_id, error);
    }

    fn channel_closed(&self, channel_id: &str) {
        self.send_error(channel_id, SignalingError::new(SignalingErrorCode::ChannelClosed, "channel closed"));
        self.inner.lock().unwrap().channels.remove(channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{
        HttpRequest, HttpResponse, HttpResponseCallback, TimerCallback, TokenCallback,
        WsEventHandler,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn backoff_doubles_and_caps_at_sixty() {
        assert_eq!(backoff_secs(0), 1);
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(2), 4);
        assert_eq!(backoff_secs(5), 32);
        assert_eq!(backoff_secs(6), 60);
        assert_eq!(backoff_secs(7), 60);
        assert_eq!(backoff_secs(30), 60);
    }

    struct FakeHttpClient {
        responder: Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>,
    }

    impl HttpClient for FakeHttpClient {
        fn send_request(&self, request: HttpRequest, callback: HttpResponseCallback) {
            callback((self.responder)(&request));
        }
    }

    struct FakeTokenProvider;

    impl TokenProvider for FakeTokenProvider {
        fn generate_token(&self, callback: TokenCallback) {
            callback(Ok("test-token".to_string()));
        }
    }

    struct ScheduledTimer {
        callback: Mutex<Option<TimerCallback>>,
        cancelled: Arc<AtomicBool>,
    }

    struct FakeTimer {
        cancelled: Arc<AtomicBool>,
    }

    impl Timer for FakeTimer {
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeTimerFactory {
        scheduled: Mutex<VecDeque<Arc<ScheduledTimer>>>,
    }

    impl FakeTimerFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Fires the oldest still-armed timer, skipping cancelled ones.
        /// Returns whether a live timer actually fired.
        fn fire_next(&self) -> bool {
            loop {
                let timer = self.scheduled.lock().unwrap().pop_front();
                let Some(timer) = timer else {
                    return false;
                };
                if timer.cancelled.load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(cb) = timer.callback.lock().unwrap().take() {
                    cb();
                }
                return true;
            }
        }
    }

    impl TimerFactory for FakeTimerFactory {
        fn set_timeout(&self, _timeout_ms: u64, callback: TimerCallback) -> Box<dyn Timer> {
            let cancelled = Arc::new(AtomicBool::new(false));
            let entry = Arc::new(ScheduledTimer {
                callback: Mutex::new(Some(callback)),
                cancelled: cancelled.clone(),
            });
            self.scheduled.lock().unwrap().push_back(entry);
            Box::new(FakeTimer { cancelled })
        }
    }

    struct FakeWsTransport {
        handler: Mutex<Option<WsEventHandler>>,
        sent: Mutex<Vec<String>>,
        opened: AtomicBool,
        closed: AtomicBool,
    }

    impl FakeWsTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handler: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                opened: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            })
        }

        fn emit(&self, event: WsEvent) {
            let handler = self.handler.lock().unwrap();
            if let Some(h) = handler.as_ref() {
                h(event);
            }
        }
    }

    impl WsTransport for FakeWsTransport {
        fn set_event_handler(&self, handler: WsEventHandler) {
            *self.handler.lock().unwrap() = Some(handler);
        }

        fn open(&self) {
            self.opened.store(true, Ordering::SeqCst);
        }

        fn send(&self, text: String) {
            self.sent.lock().unwrap().push(text);
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn test_device() -> (
        Arc<SignalingDevice>,
        Arc<Mutex<Vec<Arc<FakeWsTransport>>>>,
        Arc<FakeTimerFactory>,
    ) {
        let transports: Arc<Mutex<Vec<Arc<FakeWsTransport>>>> = Arc::new(Mutex::new(Vec::new()));
        let transports2 = transports.clone();
        let timer_factory = FakeTimerFactory::new();
        let http = Arc::new(FakeHttpClient {
            responder: Box::new(|_req| HttpResponse::Status {
                code: 200,
                body: br#"{"signalingUrl":"wss://example.test/ws"}"#.to_vec(),
            }),
        });
        let device = SignalingDevice::new(DeviceConfig {
            product_id: "acme".into(),
            device_id: "dev1".into(),
            http_host: String::new(),
            http,
            token_provider: Arc::new(FakeTokenProvider),
            timer_factory: timer_factory.clone(),
            ws_factory: Arc::new(move |_url| {
                let t = FakeWsTransport::new();
                transports2.lock().unwrap().push(t.clone());
                t as Arc<dyn WsTransport>
            }),
        });
        (device, transports, timer_factory)
    }

    /// Scenario (a): attach succeeds and the device reaches CONNECTED once
    /// the WebSocket opens.
    #[test]
    fn attach_ok_reaches_connected() {
        let (device, transports, _timers) = test_device();
        device.start();
        assert_eq!(device.state(), SignalingDeviceState::Connecting);
        let transport = transports.lock().unwrap()[0].clone();
        assert!(transport.opened.load(Ordering::SeqCst));
        transport.emit(WsEvent::Open);
        assert_eq!(device.state(), SignalingDeviceState::Connected);
    }

    /// Scenario (d): a dropped socket schedules a backoff timer; firing it
    /// reconnects with a fresh transport and fires the reconnect listener
    /// exactly once, only on the second (not the first) CONNECTED.
    #[test]
    fn reconnect_replays_through_backoff_and_fires_listener_once() {
        let (device, transports, timers) = test_device();
        let reconnects = Arc::new(AtomicUsize::new(0));
        let reconnects2 = reconnects.clone();
        device.add_reconnect_listener(Arc::new(move || {
            reconnects2.fetch_add(1, Ordering::SeqCst);
        }));

        device.start();
        transports.lock().unwrap()[0].emit(WsEvent::Open);
        assert_eq!(device.state(), SignalingDeviceState::Connected);
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);

        transports.lock().unwrap()[0].emit(WsEvent::Closed);
        assert_eq!(device.state(), SignalingDeviceState::WaitRetry);

        assert!(timers.fire_next());
        assert_eq!(device.state(), SignalingDeviceState::Connecting);
        assert_eq!(transports.lock().unwrap().len(), 2);

        transports.lock().unwrap()[1].emit(WsEvent::Open);
        assert_eq!(device.state(), SignalingDeviceState::Connected);
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    }

    /// Scenario (e): an inbound seq==0 DATA frame on an unknown channel id
    /// is routed to the new-channel listener and ACKed back over the socket.
    #[test]
    fn inbound_initial_data_on_unknown_channel_creates_and_routes() {
        let (device, transports, _timers) = test_device();
        let created = Arc::new(Mutex::new(None));
        let created2 = created.clone();
        device.set_new_channel_listener(Arc::new(move |channel| {
            *created2.lock().unwrap() = Some(channel);
        }));

        device.start();
        let transport = transports.lock().unwrap()[0].clone();
        transport.emit(WsEvent::Open);

        transport.emit(WsEvent::Message(
            r#"{"type":"MESSAGE","channelId":"chan-1","message":{"type":"DATA","seq":0,"data":{"hello":"world"}},"authorized":true}"#
                .to_string(),
        ));

        let channel = created
            .lock()
            .unwrap()
            .clone()
            .expect("new-channel listener fired");
        assert_eq!(channel.channel_id(), "chan-1");
        assert!(device.channel("chan-1").is_some());

        let sent = transport.sent.lock().unwrap();
        assert!(sent
            .iter()
            .any(|s| s.contains("\"channelId\":\"chan-1\"") && s.contains("\"type\":\"ACK\"")));
    }

    /// A device already FAILED does not re-transition to CLOSED or re-fire
    /// state listeners when `close()` is called afterward.
    #[test]
    fn close_after_fail_does_not_retransition_or_refire() {
        let (device, _transports, _timers) = test_device();
        let closes = Arc::new(AtomicUsize::new(0));
        let closes2 = closes.clone();
        device.add_state_listener(Arc::new(move |s| {
            if s == SignalingDeviceState::Closed {
                closes2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        device.fail("token source revoked");
        assert_eq!(device.state(), SignalingDeviceState::Failed);
        device.close();
        assert_eq!(device.state(), SignalingDeviceState::Failed);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }
}
