//! In-process kernel gateway used by tests.
//!
//! Serves `POST /api/kernels` with a canned response and upgrades
//! `/api/kernels/{id}/channels` to a websocket whose replies are produced by a
//! per-test script.

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use serde_json::Value;

use crate::config::KernelAddress;

/// One scripted outbound websocket action.
#[derive(Clone, Debug)]
pub enum StubFrame {
    Text(String),
    Close(u16, &'static str),
}

type Script = Arc<dyn Fn(&str) -> Vec<StubFrame> + Send + Sync>;

#[derive(Clone)]
struct StubState {
    create_status: StatusCode,
    create_body: String,
    create_requests: Arc<Mutex<Vec<Value>>>,
    channel_kernel_ids: Arc<Mutex<Vec<String>>>,
    script: Script,
}

pub struct StubGateway {
    pub address: KernelAddress,
    pub create_requests: Arc<Mutex<Vec<Value>>>,
    pub channel_kernel_ids: Arc<Mutex<Vec<String>>>,
}

impl StubGateway {
    /// Gateway whose channel never answers.
    pub async fn provisioning(status: u16, body: &str) -> Self {
        Self::spawn(status, body, |_| Vec::new()).await
    }

    /// Gateway that creates kernel `abc123` and answers each inbound frame via `script`.
    pub async fn channel(script: impl Fn(&str) -> Vec<StubFrame> + Send + Sync + 'static) -> Self {
        Self::spawn(201, r#"{"id":"abc123","name":"python"}"#, script).await
    }

    pub async fn spawn(
        status: u16,
        body: &str,
        script: impl Fn(&str) -> Vec<StubFrame> + Send + Sync + 'static,
    ) -> Self {
        let state = StubState {
            create_status: StatusCode::from_u16(status).expect("valid status"),
            create_body: body.to_owned(),
            create_requests: Arc::new(Mutex::new(Vec::new())),
            channel_kernel_ids: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(script),
        };

        let app = Router::new()
            .route("/api/kernels", post(create_kernel))
            .route("/api/kernels/{id}/channels", get(open_channel))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub gateway");
        let port = listener.local_addr().expect("local addr").port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            address: KernelAddress::resolve(Some(&format!("127.0.0.1:{port}"))).expect("address"),
            create_requests: state.create_requests,
            channel_kernel_ids: state.channel_kernel_ids,
        }
    }
}

/// Pull `header.msg_id` out of an outbound execute request.
pub fn request_msg_id(raw: &str) -> String {
    let value: Value = serde_json::from_str(raw).expect("request is JSON");
    value["header"]["msg_id"].as_str().expect("msg_id").to_owned()
}

/// A `stream` reply to `parent_msg_id` carrying `text`.
pub fn stream_reply(parent_msg_id: &str, text: &str) -> String {
    serde_json::json!({
        "msg_type": "stream",
        "parent_header": { "msg_id": parent_msg_id },
        "content": { "name": "stdout", "text": text },
    })
    .to_string()
}

async fn create_kernel(State(state): State<StubState>, body: String) -> (StatusCode, String) {
    if let Ok(value) = serde_json::from_str::<Value>(&body) {
        state.create_requests.lock().expect("lock").push(value);
    }
    (state.create_status, state.create_body.clone())
}

async fn open_channel(
    State(state): State<StubState>,
    Path(kernel_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    state.channel_kernel_ids.lock().expect("lock").push(kernel_id);
    ws.on_upgrade(move |socket| run_channel(socket, state.script))
}

async fn run_channel(mut socket: WebSocket, script: Script) {
    while let Some(Ok(message)) = socket.recv().await {
        // Keep reading after a close so the reply frame gets flushed.
        let Message::Text(text) = message else {
            continue;
        };
        for frame in script(text.as_str()) {
            match frame {
                StubFrame::Text(reply) => {
                    if socket.send(Message::Text(reply.into())).await.is_err() {
                        return;
                    }
                }
                StubFrame::Close(code, reason) => {
                    let frame = CloseFrame { code, reason: reason.to_owned().into() };
                    let _ = socket.send(Message::Close(Some(frame))).await;
                    return;
                }
            }
        }
    }
}
