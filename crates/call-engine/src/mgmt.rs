//! The management channel to the SIP/B2B signaling peer (spec 6), grounded
//! on `engine.py`'s `mi_conn`/`mi_reply` plus `OpenSIPSEventHandler`'s
//! datagram event subscription: a single UDP socket sends JSON-framed
//! commands and receives `E_UA_SESSION` events, one per line... in practice
//! one per datagram, since OpenSIPS never coalesces them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// One `E_UA_SESSION` event as delivered by the signaling peer.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionEvent {
    pub key: String,
    pub method: String,
    #[serde(default)]
    pub headers: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub extra_params: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    params: Option<RawParams>,
}

#[derive(Debug, Deserialize)]
struct RawParams {
    key: Option<String>,
    method: Option<String>,
    #[serde(default)]
    headers: String,
    body: Option<String>,
    #[serde(default)]
    extra_params: HashMap<String, Value>,
}

/// Handle to the shared UDP connection used for both outbound commands and
/// the inbound event subscription (the same socket plays both roles, as in
/// the Python original's single `mi_conn`).
pub struct ManagementChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl ManagementChannel {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(EngineError::Io)?;
        Ok(Self { socket: Arc::new(socket), peer })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn execute(&self, method: &str, params: Value) -> Result<()> {
        let envelope = json!({ "method": method, "params": params });
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| EngineError::ManagementChannel(e.to_string()))?;
        self.socket
            .send_to(&bytes, self.peer)
            .await
            .map_err(|e| EngineError::ManagementChannel(e.to_string()))?;
        Ok(())
    }

    /// `ua_session_reply`: reply to a pending SIP request.
    pub async fn reply(&self, key: &str, method: &str, code: u16, reason: &str, body: Option<&str>) -> Result<()> {
        let mut params = json!({ "key": key, "method": method, "code": code, "reason": reason });
        if let Some(body) = body {
            params["body"] = json!(body);
        }
        self.execute("ua_session_reply", params).await
    }

    /// `ua_session_update`: issue an in-dialog request (used for REFER).
    pub async fn update(
        &self,
        key: &str,
        method: &str,
        body: Option<&str>,
        extra_headers: &HashMap<String, String>,
    ) -> Result<()> {
        let params = json!({
            "key": key,
            "method": method,
            "body": body,
            "extra_headers": extra_headers,
        });
        self.execute("ua_session_update", params).await
    }

    /// `ua_session_terminate`: tear down the dialog entirely.
    pub async fn terminate(&self, key: &str) -> Result<()> {
        self.execute("ua_session_terminate", json!({ "key": key })).await
    }

    pub async fn subscribe(&self, event: &str) -> Result<()> {
        let local = self.local_addr().map_err(EngineError::Io)?;
        self.execute("event_subscribe", json!([event, format!("udp:{local}")])).await
    }

    pub async fn unsubscribe(&self, event: &str) -> Result<()> {
        self.execute("event_unsubscribe", json!([event])).await
    }

    /// Spawn the receive loop; events are pushed to the returned channel
    /// until the socket (and thus the channel) is dropped.
    pub fn spawn_event_loop(self: &Arc<Self>) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(256);
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                let (len, _addr) = match socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "management channel recv failed");
                        continue;
                    }
                };
                match parse_event(&buf[..len]) {
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => debug!("ignoring non-session management datagram"),
                }
            }
        });
        rx
    }
}

fn parse_event(bytes: &[u8]) -> Option<SessionEvent> {
    let envelope: RawEnvelope = serde_json::from_slice(bytes).ok()?;
    let params = envelope.params?;
    Some(SessionEvent {
        key: params.key?,
        method: params.method?,
        headers: params.headers,
        body: params.body,
        extra_params: params.extra_params,
    })
}

/// Standard `Subscription-State` values recognized on `NOTIFY` (spec 4.7).
pub fn subscription_terminated(event: &SessionEvent) -> bool {
    event
        .extra_params
        .get("subscription_state")
        .and_then(Value::as_str)
        .map(|s| s.starts_with("terminated"))
        .unwrap_or_else(|| crate::headers::get_header(&event.headers, "Subscription-State")
            .is_some_and(|v| v.starts_with("terminated")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_invite_event() {
        let raw = json!({
            "params": {
                "key": "abc",
                "method": "INVITE",
                "headers": "To: <sip:1@x>\r\n",
                "body": "v=0\r\n",
                "extra_params": {}
            }
        })
        .to_string();
        let event = parse_event(raw.as_bytes()).unwrap();
        assert_eq!(event.key, "abc");
        assert_eq!(event.method, "INVITE");
        assert_eq!(event.body.as_deref(), Some("v=0\r\n"));
    }

    #[test]
    fn ignores_envelopes_without_params() {
        assert!(parse_event(b"{}").is_none());
    }

    #[test]
    fn detects_terminated_subscription_via_header() {
        let event = SessionEvent {
            key: "k".into(),
            method: "NOTIFY".into(),
            headers: "Subscription-State: terminated;reason=noresource\r\n".into(),
            body: None,
            extra_params: HashMap::new(),
        };
        assert!(subscription_terminated(&event));
    }
}
