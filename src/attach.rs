//! Attach client (§4.1): turns configuration plus a bearer token into a
//! WebSocket URL, and serves on-demand ICE-server requests.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::adapters::{HttpClient, HttpRequest, HttpResponse, IceServer, TokenProvider};
use crate::error::DeviceError;

#[derive(Debug, Deserialize)]
struct ConnectResponseBody {
    #[serde(rename = "signalingUrl")]
    signaling_url: String,
}

#[derive(Debug, Deserialize)]
struct IceServersResponseBody {
    #[serde(rename = "iceServers", default)]
    ice_servers: Vec<IceServer>,
}

pub type AttachCallback = Box<dyn FnOnce(Result<String, DeviceError>) + Send>;
pub type IceServersCallback = Box<dyn FnOnce(Vec<IceServer>) + Send>;

/// Default host used when [`AttachClient::new`] is given an empty `http_host`
/// (§4.1: "If `httpHost` is empty, default to `https://{productId}.webrtc.nabto.net`").
pub fn default_http_host(product_id: &str) -> String {
    format!("https://{product_id}.webrtc.nabto.net")
}

pub struct AttachClient {
    http: Arc<dyn HttpClient>,
    token_provider: Arc<dyn TokenProvider>,
    http_host: String,
    product_id: String,
    device_id: String,
}

impl AttachClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        token_provider: Arc<dyn TokenProvider>,
        http_host: String,
        product_id: String,
        device_id: String,
    ) -> Self {
        let http_host = if http_host.is_empty() {
            default_http_host(&product_id)
        } else {
            http_host
        };
        Self {
            http,
            token_provider,
            http_host,
            product_id,
            device_id,
        }
    }

    fn request_body(&self) -> serde_json::Value {
        serde_json::json!({
            "deviceId": self.device_id,
            "productId": self.product_id,
        })
    }

    fn with_token(&self, url: String, on_token: impl FnOnce(Result<HttpRequest, String>) + Send + 'static)
    where
        Self: Sized,
    {
        let body = self.request_body();
        self.token_provider.generate_token(Box::new(move |result| {
            on_token(result.map(|token| HttpRequest {
                url,
                bearer_token: token,
                body,
            }));
        }));
    }

    /// POST `{httpHost}/v1/device/connect`; resolves the `signalingUrl` or a
    /// human-readable failure reason (retryable per §4.3).
    pub fn attach(&self, callback: AttachCallback) {
        let url = format!("{}/v1/device/connect", self.http_host);
        let http = self.http.clone();
        let callback = std::sync::Mutex::new(Some(callback));
        self.with_token(url, move |req| match req {
            Err(reason) => {
                if let Some(cb) = callback.lock().unwrap().take() {
                    cb(Err(DeviceError::TokenProviderFailed(reason)));
                }
            }
            Ok(request) => {
                http.send_request(
                    request,
                    Box::new(move |response| {
                        let result = match response {
                            HttpResponse::Status { code, body } if (200..300).contains(&code) => {
                                match serde_json::from_slice::<ConnectResponseBody>(&body) {
                                    Ok(parsed) => Ok(parsed.signaling_url),
                                    Err(e) => Err(DeviceError::AttachFailed(format!(
                                        "unparsable connect response: {e}"
                                    ))),
                                }
                            }
                            HttpResponse::Status { code, .. } => Err(DeviceError::AttachFailed(
                                format!("connect returned status {code}"),
                            )),
                            HttpResponse::TransportError(e) => {
                                Err(DeviceError::AttachFailed(format!("transport error: {e}")))
                            }
                        };
                        if let Some(cb) = callback.lock().unwrap().take() {
                            cb(result);
                        }
                    }),
                );
            }
        });
    }

    /// POST `{httpHost}/v1/ice-servers`; any failure resolves to an empty
    /// list (§4.1 — policy is the transport layer's concern, not this one's).
    pub fn ice_servers(&self, callback: IceServersCallback) {
        let url = format!("{}/v1/ice-servers", self.http_host);
        let http = self.http.clone();
        let callback = std::sync::Mutex::new(Some(callback));
        self.with_token(url, move |req| match req {
            Err(reason) => {
                warn!(reason, "ice-servers: token generation failed, returning empty list");
                if let Some(cb) = callback.lock().unwrap().take() {
                    cb(Vec::new());
                }
            }
            Ok(request) => {
                http.send_request(
                    request,
                    Box::new(move |response| {
                        let servers = match response {
                            HttpResponse::Status { code, body } if (200..300).contains(&code) => {
                                match serde_json::from_slice::<IceServersResponseBody>(&body) {
                                    Ok(parsed) => parsed.ice_servers,
                                    Err(e) => {
                                        warn!(error = %e, "ice-servers: unparsable response body");
                                        Vec::new()
                                    }
                                }
                            }
                            HttpResponse::Status { code, .. } => {
                                warn!(code, "ice-servers: non-2xx response");
                                Vec::new()
                            }
                            HttpResponse::TransportError(e) => {
                                warn!(error = %e, "ice-servers: transport error");
                                Vec::new()
                            }
                        };
                        if let Some(cb) = callback.lock().unwrap().take() {
                            cb(servers);
                        }
                    }),
                );
            }
        });
    }

    pub fn http_host(&self) -> &str {
        &self.http_host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::HttpResponseCallback;
    use std::sync::Mutex as StdMutex;

    struct FakeHttp {
        responder: Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>,
    }

    impl HttpClient for FakeHttp {
        fn send_request(&self, request: HttpRequest, callback: HttpResponseCallback) {
            let response = (self.responder)(&request);
            callback(response);
        }
    }

    struct FakeToken;
    impl TokenProvider for FakeToken {
        fn generate_token(&self, callback: crate::adapters::TokenCallback) {
            callback(Ok("token".to_string()));
        }
    }

    #[test]
    fn default_host_uses_product_id() {
        assert_eq!(
            default_http_host("acme"),
            "https://acme.webrtc.nabto.net"
        );
    }

    #[test]
    fn attach_ok_parses_signaling_url() {
        let http = Arc::new(FakeHttp {
            responder: Box::new(|_| HttpResponse::Status {
                code: 200,
                body: br#"{"signalingUrl":"wss://x"}"#.to_vec(),
            }),
        });
        let client = AttachClient::new(
            http,
            Arc::new(FakeToken),
            String::new(),
            "acme".into(),
            "dev1".into(),
        );
        let result = Arc::new(StdMutex::new(None));
        let result2 = result.clone();
        client.attach(Box::new(move |r| *result2.lock().unwrap() = Some(r)));
        assert_eq!(
            result.lock().unwrap().clone().unwrap().unwrap(),
            "wss://x"
        );
    }

    #[test]
    fn attach_non_2xx_is_retryable_error() {
        let http = Arc::new(FakeHttp {
            responder: Box::new(|_| HttpResponse::Status {
                code: 500,
                body: Vec::new(),
            }),
        });
        let client = AttachClient::new(
            http,
            Arc::new(FakeToken),
            String::new(),
            "acme".into(),
            "dev1".into(),
        );
        let result = Arc::new(StdMutex::new(None));
        let result2 = result.clone();
        client.attach(Box::new(move |r| *result2.lock().unwrap() = Some(r)));
        assert!(result.lock().unwrap().clone().unwrap().is_err());
    }

    #[test]
    fn ice_servers_failure_resolves_empty_not_error() {
        let http = Arc::new(FakeHttp {
            responder: Box::new(|_| HttpResponse::TransportError("down".into())),
        });
        let client = AttachClient::new(
            http,
            Arc::new(FakeToken),
            String::new(),
            "acme".into(),
            "dev1".into(),
        );
        let result = Arc::new(StdMutex::new(None));
        let result2 = result.clone();
        client.ice_servers(Box::new(move |r| *result2.lock().unwrap() = Some(r)));
        assert_eq!(result.lock().unwrap().clone().unwrap(), Vec::new());
    }

    #[test]
    fn ice_servers_tolerates_missing_username_credential() {
        let http = Arc::new(FakeHttp {
            responder: Box::new(|_| HttpResponse::Status {
                code: 200,
                body: br#"{"iceServers":[{"urls":["stun:x"]}],"extra":1}"#.to_vec(),
            }),
        });
        let client = AttachClient::new(
            http,
            Arc::new(FakeToken),
            String::new(),
            "acme".into(),
            "dev1".into(),
        );
        let result = Arc::new(StdMutex::new(None));
        let result2 = result.clone();
        client.ice_servers(Box::new(move |r| *result2.lock().unwrap() = Some(r)));
        let servers = result.lock().unwrap().clone().unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].username.is_none());
    }
}
