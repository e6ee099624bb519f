use std::{
    collections::VecDeque,
    convert::Infallible,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// One scripted reply of the mock `getUpdates` endpoint.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// `{"ok": true, "result": [...]}` with a text message per id.
    Updates(Vec<i64>),
    /// `{"ok": false, "error_code": .., "description": ..}` with status 200.
    Rejected(i64, String),
    /// Raw body with the given status.
    Status(u16, String),
    /// Holds the request open before answering with an empty batch.
    Hold(Duration),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub body: Value,
}

impl RecordedRequest {
    pub fn offset(&self) -> Option<i64> {
        self.body.get("offset").and_then(Value::as_i64)
    }
}

#[derive(Clone)]
pub struct MockBotApi {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    idle_reply: Arc<Mutex<MockReply>>,
}

impl Default for MockBotApi {
    fn default() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            idle_reply: Arc::new(Mutex::new(MockReply::Hold(Duration::from_millis(20)))),
        }
    }
}

impl MockBotApi {
    pub fn with_replies(replies: impl IntoIterator<Item = MockReply>) -> Self {
        let api = Self::default();
        api.replies
            .lock()
            .expect("mock replies poisoned")
            .extend(replies);
        api
    }

    /// Reply used once the script is exhausted.
    pub fn set_idle_reply(&self, reply: MockReply) {
        *self.idle_reply.lock().expect("mock idle reply poisoned") = reply;
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.replies
            .lock()
            .expect("mock replies poisoned")
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("mock requests poisoned").clone()
    }

    fn next_reply(&self) -> MockReply {
        let scripted = self
            .replies
            .lock()
            .expect("mock replies poisoned")
            .pop_front();
        scripted.unwrap_or_else(|| {
            self.idle_reply
                .lock()
                .expect("mock idle reply poisoned")
                .clone()
        })
    }
}

pub fn update_json(id: i64) -> Value {
    json!({
        "update_id": id,
        "message": {
            "message_id": id,
            "date": 1_700_000_000 + id,
            "chat": {"id": 1, "type": "private"},
            "text": format!("message {id}"),
        },
    })
}

pub struct MockBotApiServer {
    base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockBotApiServer {
    pub async fn start(api: MockBotApi) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock Bot API listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let api = api.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| serve_request(api.clone(), req))) }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock Bot API server stopped: {err}");
            }
        });

        Ok(Self {
            base_url: format!("http://{addr}/bot"),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Prefix to configure as the session's `base_url`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}

async fn serve_request(api: MockBotApi, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "Unsupported method"));
    }

    let path = req.uri().path().to_owned();
    if !path.ends_with("/getUpdates") {
        return Ok(plain(StatusCode::NOT_FOUND, "unknown method"));
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return Ok(plain(
                StatusCode::BAD_REQUEST,
                format!("failed to read body: {err}"),
            ))
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            return Ok(plain(
                StatusCode::BAD_REQUEST,
                format!("invalid JSON payload: {err}"),
            ))
        }
    };

    api.requests
        .lock()
        .expect("mock requests poisoned")
        .push(RecordedRequest {
            path,
            body: payload,
        });

    let response = match api.next_reply() {
        MockReply::Updates(ids) => json_response(json!({
            "ok": true,
            "result": ids.into_iter().map(update_json).collect::<Vec<_>>(),
        })),
        MockReply::Rejected(code, description) => json_response(json!({
            "ok": false,
            "error_code": code,
            "description": description,
        })),
        MockReply::Status(status, body) => plain(
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        ),
        MockReply::Hold(duration) => {
            tokio::time::sleep(duration).await;
            json_response(json!({"ok": true, "result": []}))
        }
    };
    Ok(response)
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(value: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
