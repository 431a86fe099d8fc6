//! Device-side WebRTC signaling broker: attach over HTTPS, hold a long-lived
//! WebSocket, multiplex reliable sequenced channels, and sign/verify messages
//! through a pluggable transport (None or Shared-Secret JWT).
//!
//! The core is runtime-agnostic: HTTP, WebSocket, timers and token generation
//! are all expressed as traits in [`adapters`], with completion reported
//! through callbacks rather than `async fn`. Callers supply implementations
//! backed by whatever runtime and transport stack they already use.
//!
//! A host application typically installs a `tracing` subscriber once at
//! startup, before constructing a [`device::SignalingDevice`]:
//!
//! ```no_run
//! tracing_subscriber::fmt::init();
//! ```

pub mod adapters;
pub mod attach;
pub mod channel;
pub mod device;
pub mod error;
pub mod transport;
pub mod util;
pub mod ws;

pub use adapters::{
    HttpClient, HttpRequest, HttpResponse, HttpResponseCallback, IceServer, Timer, TimerCallback,
    TimerFactory, TokenCallback, TokenProvider, WsEvent, WsEventHandler, WsTransport,
};
pub use attach::AttachClient;
pub use channel::{ChannelSink, SignalingChannel, SignalingChannelState};
pub use device::{DeviceConfig, SignalingDevice, SignalingDeviceState};
pub use error::{ChannelError, DeviceError, SignalingError, SignalingErrorCode, TransportError};
pub use transport::{
    none::NoneSigner,
    shared_secret::{SharedSecretKeyLookup, SharedSecretSigner},
    Candidate, Description, IceServerSource, MessageTransport, SignedEnvelope, Signer,
    WebrtcSignalingMessage,
};
