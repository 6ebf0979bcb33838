//! A minimal socket.io server for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// How long tests wait for an expected frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Server side of one test session.
#[derive(Debug)]
pub struct TestServer {
    /// Base URL to hand to the client.
    pub url: String,
    received: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<String>,
}

impl TestServer {
    /// Start a server accepting one client. Clients whose connect packet
    /// lacks `required_token` are rejected.
    pub async fn start(required_token: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, mut push_rx) = mpsc::unbounded_channel::<String>();
        let required_token = required_token.map(str::to_string);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"0{"sid":"engine-sid","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#
                    .to_string(),
            ))
            .await
            .unwrap();

            loop {
                tokio::select! {
                    frame = ws.next() => {
                        let Some(Ok(frame)) = frame else { break };
                        match frame {
                            Message::Text(text) => {
                                if let Some(auth) = text.strip_prefix("40") {
                                    let accepted = required_token
                                        .as_deref()
                                        .map_or(true, |token| auth.contains(token));
                                    let reply = if accepted {
                                        r#"40{"sid":"socket-sid"}"#
                                    } else {
                                        r#"44{"message":"unauthorized"}"#
                                    };
                                    let _ = ws.send(Message::Text(reply.to_string())).await;
                                }
                                let _ = received_tx.send(text);
                            }
                            Message::Close(_) => {
                                let _ = received_tx.send("<close>".to_string());
                                break;
                            }
                            _ => {}
                        }
                    }
                    pushed = push_rx.recv() => {
                        let Some(pushed) = pushed else { break };
                        if pushed == "<close>" {
                            let _ = ws.close(None).await;
                            break;
                        }
                        if ws.send(Message::Text(pushed)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            url,
            received,
            push,
        }
    }

    /// Send a raw text frame to the client.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.push.send(frame.into());
    }

    /// Close the socket from the server side.
    pub fn close(&self) {
        self.push("<close>");
    }

    /// Wait for the first received frame starting with `prefix`, skipping
    /// others.
    pub async fn expect(&mut self, prefix: &str) -> String {
        tokio::time::timeout(FRAME_TIMEOUT, async {
            loop {
                let frame = self
                    .received
                    .recv()
                    .await
                    .unwrap_or_else(|| panic!("server stopped before {prefix:?}"));
                if frame.starts_with(prefix) {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no frame starting with {prefix:?}"))
    }

    /// Every frame received so far, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.received.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Decode a `42[...]` event frame into its name and payload.
pub fn event(frame: &str) -> (String, serde_json::Value) {
    let args: Vec<serde_json::Value> =
        serde_json::from_str(frame.strip_prefix("42").expect("event frame")).unwrap();
    (
        args[0].as_str().unwrap().to_string(),
        args.get(1).cloned().unwrap_or(serde_json::Value::Null),
    )
}

/// A `positionUpdate` frame as the server broadcasts it.
pub fn position_update(user_id: &str, latitude: f64, longitude: f64, timestamp: i64) -> String {
    format!(
        "42{}",
        serde_json::json!([
            "positionUpdate",
            {
                "userId": user_id,
                "position": {"latitude": latitude, "longitude": longitude, "timestamp": timestamp}
            }
        ])
    )
}
