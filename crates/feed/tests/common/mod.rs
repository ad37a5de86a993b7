//! Common helpers for integration tests: an in-process mock of the admin backend.
//!
//! REST routes plus a `/socket.io/` websocket endpoint speaking Engine.IO v4 text
//! packets, bound to an ephemeral port. The server task is aborted on drop.

#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const TOKEN: &str = "valid-token";
pub const PASSWORD: &str = "secret";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("feed=debug".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub struct Data {
    pub notifications: Vec<Value>,
    pub requests: Vec<Value>,
    pub messages: Vec<Value>,
    pub users: Vec<Value>,
    pub products: Vec<Value>,
}

pub struct Backend {
    pub data: Mutex<Data>,
    /// Every text frame received from clients, in order.
    pub received: Mutex<Vec<String>>,
    pub connections: AtomicUsize,
    pushes: broadcast::Sender<String>,
}

impl Backend {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {TOKEN}"))
            .unwrap_or(false)
    }

    /// Push `42[name, data]` to every connected socket.
    pub fn push(&self, name: &str, data: Value) {
        let _ = self.pushes.send(format!("42{}", json!([name, data])));
    }

    pub fn received_events(&self, name: &str) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|t| t.strip_prefix("42"))
            .filter_map(|t| serde_json::from_str::<Value>(t).ok())
            .filter(|v| v[0] == name)
            .map(|v| v[1].clone())
            .collect()
    }

    pub fn received_raw(&self, frame: &str) -> bool {
        self.received.lock().unwrap().iter().any(|t| t == frame)
    }

    fn on_client_frame(&self, text: &str) {
        self.received.lock().unwrap().push(text.to_string());
        let Some(event) = text
            .strip_prefix("42")
            .and_then(|t| serde_json::from_str::<Value>(t).ok())
        else {
            return;
        };
        let accepted = match event[0].as_str() {
            Some("accept-signup-request") => true,
            Some("reject-signup-request") => false,
            _ => return,
        };
        let id = event[1]["requestId"].clone();
        let found = {
            let mut data = self.data.lock().unwrap();
            let before = data.requests.len();
            data.requests.retain(|r| r["id"] != id);
            data.requests.len() != before
        };
        if found {
            self.push("signup-request-updated", json!({"id": id, "accepted": accepted}));
        } else {
            self.push(
                "signup-request-error",
                json!({"requestId": id, "message": "Request not found or already processed"}),
            );
        }
    }
}

/// Mock backend bound to 127.0.0.1 on an ephemeral port.
pub struct MockBackend {
    pub url: String,
    pub backend: Arc<Backend>,
    task: JoinHandle<()>,
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockBackend {
    pub async fn start(data: Data) -> Self {
        let (pushes, _) = broadcast::channel(64);
        let backend = Arc::new(Backend {
            data: Mutex::new(data),
            received: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            pushes,
        });
        let app = Router::new()
            .route("/auth/signin", post(sign_in))
            .route("/auth/signup", post(sign_up))
            .route("/api/users", get(list_users))
            .route("/api/user/product/:key", get(user_by_key).delete(delete_user))
            .route("/products/all", get(list_products))
            .route("/products/add", post(add_product))
            .route("/products/:key", delete(delete_product))
            .route("/notifications", get(list_notifications))
            .route("/notifications/:id/mark", put(mark_notification))
            .route("/notifications/:id", delete(delete_notification))
            .route("/Requests", get(list_requests))
            .route("/chat/history", get(chat_history))
            .route("/chat/send", post(chat_send))
            .route("/socket.io/", get(socket))
            .with_state(Arc::clone(&backend));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("http://{addr}"),
            backend,
            task,
        }
    }

    /// Wait until `n` sockets have completed the handshake.
    pub async fn wait_connections(&self, n: usize) {
        for _ in 0..200 {
            if self.backend.connections.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("socket connections never reached {n}");
    }
}

type Shared = State<Arc<Backend>>;

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn unauthorized() -> Response {
    error(StatusCode::UNAUTHORIZED, "Unauthorized")
}

fn same_id(value: &Value, id: &str) -> bool {
    match &value["id"] {
        Value::Number(n) => n.to_string() == id,
        Value::String(s) => s == id,
        _ => false,
    }
}

async fn sign_in(Json(body): Json<Value>) -> Response {
    if body["password"] == PASSWORD {
        Json(json!({"token": TOKEN, "user": {"email": body["email"]}})).into_response()
    } else {
        error(StatusCode::UNAUTHORIZED, "Invalid credentials")
    }
}

async fn sign_up(Json(body): Json<Value>) -> Response {
    if body["email"].as_str().unwrap_or("").is_empty() {
        return error(StatusCode::BAD_REQUEST, "Email is required");
    }
    (StatusCode::CREATED, Json(json!({"message": "Signup request submitted"}))).into_response()
}

async fn list_users(State(b): Shared, headers: HeaderMap) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({"users": b.data.lock().unwrap().users})).into_response()
}

async fn user_by_key(State(b): Shared, headers: HeaderMap, Path(key): Path<String>) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    let data = b.data.lock().unwrap();
    match data.users.iter().find(|u| u["product_key"] == key.as_str()) {
        Some(user) => Json(json!({"user": user})).into_response(),
        None => error(StatusCode::NOT_FOUND, "User not found"),
    }
}

async fn delete_user(State(b): Shared, headers: HeaderMap, Path(key): Path<String>) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    b.data
        .lock()
        .unwrap()
        .users
        .retain(|u| u["product_key"] != key.as_str());
    StatusCode::NO_CONTENT.into_response()
}

async fn list_products(State(b): Shared, headers: HeaderMap) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    Json(b.data.lock().unwrap().products.clone()).into_response()
}

async fn add_product(State(b): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    let product = json!({"product_key": body["product_key"]});
    b.data.lock().unwrap().products.push(product.clone());
    (StatusCode::CREATED, Json(json!({"product": product}))).into_response()
}

async fn delete_product(State(b): Shared, headers: HeaderMap, Path(key): Path<String>) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    let mut data = b.data.lock().unwrap();
    let before = data.products.len();
    data.products.retain(|p| p["product_key"] != key.as_str());
    if data.products.len() == before {
        return error(StatusCode::NOT_FOUND, "Product not found");
    }
    Json(json!({"message": "deleted"})).into_response()
}

async fn list_notifications(State(b): Shared, headers: HeaderMap) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({"notifications": b.data.lock().unwrap().notifications})).into_response()
}

async fn mark_notification(State(b): Shared, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    let mut data = b.data.lock().unwrap();
    match data.notifications.iter_mut().find(|n| same_id(n, &id)) {
        Some(n) => {
            n["is_read"] = json!(true);
            Json(json!({"message": "marked"})).into_response()
        }
        None => error(StatusCode::NOT_FOUND, "Notification not found"),
    }
}

async fn delete_notification(State(b): Shared, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    let mut data = b.data.lock().unwrap();
    let before = data.notifications.len();
    data.notifications.retain(|n| !same_id(n, &id));
    if data.notifications.len() == before {
        return error(StatusCode::NOT_FOUND, "Notification not found");
    }
    Json(json!({"message": "deleted"})).into_response()
}

async fn list_requests(State(b): Shared, headers: HeaderMap) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    Json(b.data.lock().unwrap().requests.clone()).into_response()
}

async fn chat_history(
    State(b): Shared,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    let key = query.get("product_key").cloned().unwrap_or_default();
    let messages: Vec<Value> = b
        .data
        .lock()
        .unwrap()
        .messages
        .iter()
        .filter(|m| m["product_key"] == key.as_str())
        .cloned()
        .collect();
    Json(json!({"messages": messages})).into_response()
}

async fn chat_send(State(b): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !b.authorized(&headers) {
        return unauthorized();
    }
    // Stored under a server-assigned id; the client's own id is never sent.
    let mut data = b.data.lock().unwrap();
    let id = data
        .messages
        .iter()
        .filter_map(|m| m["id"].as_u64())
        .max()
        .unwrap_or(0)
        + 1;
    let message = json!({
        "id": id,
        "product_key": body["product_key"],
        "message": body["message"],
        "is_admin": true,
        "created_at": "2024-05-01T10:00:00Z",
    });
    data.messages.push(message.clone());
    drop(data);
    b.push("receiveMessage", message);
    Json(json!({"success": true})).into_response()
}

async fn socket(State(b): Shared, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, b))
}

async fn run_socket(mut socket: WebSocket, b: Arc<Backend>) {
    let mut pushes = b.pushes.subscribe();
    let open = json!({"sid": "mock", "upgrades": [], "pingInterval": 25000, "pingTimeout": 20000});
    if socket.send(Message::Text(format!("0{open}"))).await.is_err() {
        return;
    }
    let Some(Ok(Message::Text(connect))) = socket.recv().await else {
        return;
    };
    b.received.lock().unwrap().push(connect.clone());
    let token = connect
        .strip_prefix("40")
        .and_then(|t| serde_json::from_str::<Value>(t).ok())
        .and_then(|v| v["token"].as_str().map(str::to_string));
    if token.as_deref() != Some(TOKEN) {
        let _ = socket
            .send(Message::Text(r#"44{"message":"Authentication error"}"#.into()))
            .await;
        return;
    }
    if socket
        .send(Message::Text(r#"40{"sid":"mock-socket"}"#.into()))
        .await
        .is_err()
    {
        return;
    }
    // One ping per socket; the client's pong lands in `received`.
    let _ = socket.send(Message::Text("2".into())).await;
    b.connections.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => b.on_client_frame(&text),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            push = pushes.recv() => match push {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    b.connections.fetch_sub(1, Ordering::SeqCst);
}
