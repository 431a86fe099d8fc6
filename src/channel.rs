//! Per-peer reliable sequenced delivery (§4.4): one [`SignalingChannel`] per
//! remote client, multiplexed by the device over its single WebSocket.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use crate::error::{ChannelError, SignalingError, SignalingErrorCode};
use crate::util::{ListenerId, ListenerRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingChannelState {
    New,
    Online,
    Offline,
    Failed,
    Closed,
}

impl SignalingChannelState {
    fn is_terminal(self) -> bool {
        matches!(self, SignalingChannelState::Closed | SignalingChannelState::Failed)
    }
}

/// The device-side operations a channel needs without owning the device
/// strongly (§3 Ownership: "channels hold only a weak... relation back to
/// the device").
pub trait ChannelSink: Send + Sync {
    /// Transmit a fully-framed `{type:"DATA"|"ACK", ...}` JSON value for this
    /// channel id over the device's current WebSocket, if any.
    fn send_channel_message(&self, channel_id: &str, frame: serde_json::Value);
    /// Send an `ERROR` envelope for this channel id, best-effort.
    fn send_channel_error(&self, channel_id: &str, error: SignalingError);
    /// Notifies the device that this channel has been locally closed; the
    /// device sends `CHANNEL_CLOSED` to the peer and removes the channel
    /// from its map.
    fn channel_closed(&self, channel_id: &str);
}

type MessageListener = dyn Fn(serde_json::Value) + Send + Sync;
type StateListener = dyn Fn(SignalingChannelState) + Send + Sync;
type ErrorListener = dyn Fn(SignalingError) + Send + Sync;

struct Inner {
    state: SignalingChannelState,
    send_seq: u32,
    recv_seq: u32,
    unacked: VecDeque<(u32, serde_json::Value)>,
    message_listeners: ListenerRegistry<MessageListener>,
    state_listeners: ListenerRegistry<StateListener>,
    error_listeners: ListenerRegistry<ErrorListener>,
    closed_notified: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: SignalingChannelState::New,
            send_seq: 0,
            recv_seq: 0,
            unacked: VecDeque::new(),
            message_listeners: ListenerRegistry::new(),
            state_listeners: ListenerRegistry::new(),
            error_listeners: ListenerRegistry::new(),
            closed_notified: false,
        }
    }
}

pub struct SignalingChannel {
    channel_id: String,
    /// Set true for channels created by the device for an inbound, unknown
    /// `channelId`, carrying the envelope's `authorized` bit (§4.3 Routing).
    pub authorized: bool,
    sink: Weak<dyn ChannelSink>,
    inner: Mutex<Inner>,
}

fn data_frame(seq: u32, data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"type": "DATA", "seq": seq, "data": data})
}

fn ack_frame(seq: u32) -> serde_json::Value {
    serde_json::json!({"type": "ACK", "seq": seq})
}

impl SignalingChannel {
    pub fn new(channel_id: String, authorized: bool, sink: Weak<dyn ChannelSink>) -> Arc<Self> {
        Arc::new(Self {
            channel_id,
            authorized,
            sink,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn state(&self) -> SignalingChannelState {
        self.inner.lock().unwrap().state
    }

    pub fn add_message_listener(
        &self,
        listener: Arc<MessageListener>,
    ) -> ListenerId {
        self.inner.lock().unwrap().message_listeners.add(listener)
    }

    pub fn remove_message_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().message_listeners.remove(id);
    }

    pub fn add_state_listener(&self, listener: Arc<StateListener>) -> ListenerId {
        self.inner.lock().unwrap().state_listeners.add(listener)
    }

    pub fn remove_state_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().state_listeners.remove(id);
    }

    pub fn add_error_listener(&self, listener: Arc<ErrorListener>) -> ListenerId {
        self.inner.lock().unwrap().error_listeners.add(listener)
    }

    pub fn remove_error_listener(&self, id: ListenerId) {
        self.inner.lock().unwrap().error_listeners.remove(id);
    }

    fn sink(&self) -> Option<Arc<dyn ChannelSink>> {
        self.sink.upgrade()
    }

    /// Assigns the next `seq`, appends to `unacked`, and forwards to the
    /// device for transmission. Never blocks on connectivity: if the session
    /// is not connected, the frame simply waits in `unacked` for replay.
    pub fn send_message(&self, payload: serde_json::Value) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            warn!(channel_id = %self.channel_id, error = %ChannelError::Closed, "send_message rejected");
            return None;
        }
        let seq = inner.send_seq;
        inner.send_seq += 1;
        let frame = data_frame(seq, payload);
        inner.unacked.push_back((seq, frame.clone()));
        drop(inner);
        if let Some(sink) = self.sink() {
            sink.send_channel_message(&self.channel_id, frame);
        }
        Some(seq)
    }

    /// Transmits an `ERROR` envelope without changing channel state. Used by
    /// the message transport layer (§4.5 Error recovery: "the transport does
    /// not close the channel itself; application policy decides whether to
    /// close").
    pub fn send_protocol_error(&self, error: SignalingError) {
        let inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        drop(inner);
        if let Some(sink) = self.sink() {
            sink.send_channel_error(&self.channel_id, error);
        }
    }

    /// Transmits an application `ERROR` and transitions to `FAILED`.
    pub fn send_error(&self, error: SignalingError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            warn!(channel_id = %self.channel_id, error = %ChannelError::Closed, "send_error rejected");
            return;
        }
        inner.state = SignalingChannelState::Failed;
        drop(inner);
        if let Some(sink) = self.sink() {
            sink.send_channel_error(&self.channel_id, error);
        }
    }

    /// Inbound DATA (§4.4): exact-match ACK and deliver, re-ACK duplicates,
    /// and raise a decode error on a gap.
    pub fn handle_data(&self, seq: u32, data: serde_json::Value) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        if seq == inner.recv_seq {
            inner.recv_seq += 1;
            let listeners = inner.message_listeners.snapshot();
            drop(inner);
            if let Some(sink) = self.sink() {
                sink.send_channel_message(&self.channel_id, ack_frame(seq));
            }
            for listener in listeners {
                listener(data.clone());
            }
        } else if seq < inner.recv_seq {
            debug!(channel_id = %self.channel_id, seq, "re-ACKing duplicate DATA");
            drop(inner);
            if let Some(sink) = self.sink() {
                sink.send_channel_message(&self.channel_id, ack_frame(seq));
            }
        } else {
            let expected = inner.recv_seq;
            let listeners = inner.error_listeners.snapshot();
            drop(inner);
            warn!(channel_id = %self.channel_id, expected, got = seq, "sequence gap, discarding");
            let err = ChannelError::SequenceGap { expected, got: seq };
            let wire = SignalingError::new(err.code(), err.to_string());
            for listener in listeners {
                listener(wire.clone());
            }
        }
    }

    /// Inbound ACK (§4.4): strict FIFO against the head of `unacked`.
    pub fn handle_ack(&self, seq: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        match inner.unacked.front() {
            None => {
                warn!(channel_id = %self.channel_id, seq, "ACK with empty unacked queue, dropping");
            }
            Some((head_seq, _)) if *head_seq != seq => {
                warn!(
                    channel_id = %self.channel_id,
                    expected = head_seq,
                    got = seq,
                    "ACK does not match unacked head, dropping"
                );
            }
            Some(_) => {
                inner.unacked.pop_front();
            }
        }
    }

    /// Resends the entire `unacked` queue in order, then transitions ONLINE.
    pub fn peer_connected(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        let frames: Vec<serde_json::Value> = inner.unacked.iter().map(|(_, f)| f.clone()).collect();
        self.transition_locked(&mut inner, SignalingChannelState::Online);
        drop(inner);
        if let Some(sink) = self.sink() {
            for frame in frames {
                sink.send_channel_message(&self.channel_id, frame);
            }
        }
    }

    pub fn peer_offline(&self) {
        info!(channel_id = %self.channel_id, "peer went offline");
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        self.transition_locked(&mut inner, SignalingChannelState::Offline);
    }

    /// Peer-originated `ERROR`: transition FAILED, surface to error listeners.
    pub fn handle_error(&self, error: SignalingError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = SignalingChannelState::Failed;
        let listeners = inner.error_listeners.snapshot();
        drop(inner);
        let peer_err = ChannelError::PeerError(error.clone());
        info!(channel_id = %self.channel_id, error = %peer_err, "peer error, channel failed");
        for listener in listeners {
            listener(error.clone());
        }
    }

    /// Terminal CLOSED due to device-wide teardown; no peer notification (the
    /// socket is already gone). Distinct from [`SignalingChannel::close`].
    pub fn ws_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.close_locked(&mut inner);
    }

    /// Local, application-initiated close: notify the peer via
    /// `CHANNEL_CLOSED`, and tell the device to drop this channel from its
    /// map. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        let already_terminal = inner.state.is_terminal();
        self.close_locked(&mut inner);
        drop(inner);
        if !already_terminal {
            if let Some(sink) = self.sink() {
                sink.channel_closed(&self.channel_id);
            }
        }
    }

    fn close_locked(&self, inner: &mut Inner) {
        if inner.state.is_terminal() || inner.closed_notified {
            return;
        }
        inner.state = SignalingChannelState::Closed;
        inner.closed_notified = true;
        let listeners = inner.state_listeners.snapshot();
        inner.message_listeners.clear();
        inner.state_listeners.clear();
        inner.error_listeners.clear();
        for listener in listeners {
            listener(SignalingChannelState::Closed);
        }
    }

    fn transition_locked(&self, inner: &mut Inner, to: SignalingChannelState) {
        if inner.state.is_terminal() {
            return;
        }
        inner.state = to;
        let listeners = inner.state_listeners.snapshot();
        for listener in listeners {
            listener(to);
        }
    }

    #[cfg(test)]
    fn unacked_seqs(&self) -> Vec<u32> {
        self.inner.lock().unwrap().unacked.iter().map(|(s, _)| *s).collect()
    }
}

/// A DATA frame with `seq==0` is the only frame that may legitimately create
/// a new channel on the receiver (§4.4 Initial-message predicate).
pub fn is_initial_message(seq: u32) -> bool {
    seq == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        messages: Mutex<Vec<(String, serde_json::Value)>>,
        closed: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
            })
        }
    }

    impl ChannelSink for RecordingSink {
        fn send_channel_message(&self, channel_id: &str, frame: serde_json::Value) {
            self.messages.lock().unwrap().push((channel_id.to_string(), frame));
        }
        fn send_channel_error(&self, channel_id: &str, error: SignalingError) {
            self.messages.lock().unwrap().push((
                channel_id.to_string(),
                serde_json::json!({"type": "ERROR", "code": error.raw_code}),
            ));
        }
        fn channel_closed(&self, channel_id: &str) {
            self.closed.lock().unwrap().push(channel_id.to_string());
        }
    }

    fn make_channel(sink: &Arc<RecordingSink>) -> Arc<SignalingChannel> {
        let weak: Weak<dyn ChannelSink> = Arc::downgrade(sink) as Weak<dyn ChannelSink>;
        SignalingChannel::new("c1".into(), true, weak)
    }

    #[test]
    fn monotonic_send_seq() {
        let sink = RecordingSink::new();
        let ch = make_channel(&sink);
        assert_eq!(ch.send_message(serde_json::json!("A")), Some(0));
        assert_eq!(ch.send_message(serde_json::json!("B")), Some(1));
        assert_eq!(ch.send_message(serde_json::json!("C")), Some(2));
        assert_eq!(ch.unacked_seqs(), vec![0, 1, 2]);
    }

    #[test]
    fn ack_pops_matching_head_only() {
        let sink = RecordingSink::new();
        let ch = make_channel(&sink);
        ch.send_message(serde_json::json!("A"));
        ch.send_message(serde_json::json!("B"));
        ch.handle_ack(1); // mismatched head, ignored
        assert_eq!(ch.unacked_seqs(), vec![0, 1]);
        ch.handle_ack(0);
        assert_eq!(ch.unacked_seqs(), vec![1]);
    }

    #[test]
    fn inbound_data_in_order_acks_and_dispatches() {
        let sink = RecordingSink::new();
        let ch = make_channel(&sink);
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        ch.add_message_listener(Arc::new(move |v| received2.lock().unwrap().push(v)));
        ch.handle_data(0, serde_json::json!("hello"));
        assert_eq!(received.lock().unwrap().len(), 1);
        let msgs = sink.messages.lock().unwrap();
        assert_eq!(msgs.last().unwrap().1["type"], "ACK");
        assert_eq!(msgs.last().unwrap().1["seq"], 0);
    }

    #[test]
    fn duplicate_data_is_reacked_and_not_redelivered() {
        let sink = RecordingSink::new();
        let ch = make_channel(&sink);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        ch.add_message_listener(Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        ch.handle_data(0, serde_json::json!("x"));
        ch.handle_data(0, serde_json::json!("x"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gap_raises_decode_error_and_drops() {
        let sink = RecordingSink::new();
        let ch = make_channel(&sink);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors2 = errors.clone();
        ch.add_error_listener(Arc::new(move |e| errors2.lock().unwrap().push(e)));
        ch.handle_data(5, serde_json::json!("x"));
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(errors.lock().unwrap()[0].code, SignalingErrorCode::DecodeError);
    }

    #[test]
    fn peer_connected_replays_unacked_then_goes_online() {
        let sink = RecordingSink::new();
        let ch = make_channel(&sink);
        ch.send_message(serde_json::json!("A"));
        ch.send_message(serde_json::json!("B"));
        sink.messages.lock().unwrap().clear();
        ch.peer_connected();
        assert_eq!(ch.state(), SignalingChannelState::Online);
        let msgs = sink.messages.lock().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].1["seq"], 0);
        assert_eq!(msgs[1].1["seq"], 1);
    }

    #[test]
    fn close_is_idempotent_and_terminal() {
        let sink = RecordingSink::new();
        let ch = make_channel(&sink);
        let closes = Arc::new(AtomicUsize::new(0));
        let closes2 = closes.clone();
        ch.add_state_listener(Arc::new(move |s| {
            if s == SignalingChannelState::Closed {
                closes2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        ch.close();
        ch.close();
        ch.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.closed.lock().unwrap().len(), 1);
    }

    #[test]
    fn close_after_failed_does_not_retransition_or_refire() {
        let sink = RecordingSink::new();
        let ch = make_channel(&sink);
        let closes = Arc::new(AtomicUsize::new(0));
        let closes2 = closes.clone();
        ch.add_state_listener(Arc::new(move |s| {
            if s == SignalingChannelState::Closed {
                closes2.fetch_add(1, Ordering::SeqCst);
            }
        }));
        ch.send_error(SignalingError::new(SignalingErrorCode::InternalError, "boom"));
        assert_eq!(ch.state(), SignalingChannelState::Failed);
        ch.close();
        // state stays FAILED, not CLOSED, and no CLOSED callback ever fires.
        assert_eq!(ch.state(), SignalingChannelState::Failed);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        assert_eq!(sink.closed.lock().unwrap().len(), 0);
    }

    #[test]
    fn send_after_failed_is_noop() {
        let sink = RecordingSink::new();
        let ch = make_channel(&sink);
        ch.send_error(SignalingError::new(SignalingErrorCode::InternalError, "boom"));
        assert_eq!(ch.state(), SignalingChannelState::Failed);
        assert_eq!(ch.send_message(serde_json::json!("x")), None);
    }
}
