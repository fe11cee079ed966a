//! In-process stand-in for the annotation service: the search and
//! annotation endpoints plus the notification websocket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use hypsync_client::paginate::AnnoFetcher;
use hypsync_client::{HypApi, Memoizer, SyncConfig};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::time;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const TEST_TOKEN: &str = "TEST-TOKEN";
pub const TEST_USER: &str = "tester";
pub const TEST_GROUP: &str = "testgroup";

/// Commands pushed to every open websocket connection.
#[derive(Clone, Debug)]
enum Cmd {
    Frame(String),
    Close,
}

#[derive(Clone)]
struct MockState {
    rows: Arc<Mutex<Vec<Value>>>,
    cursors_seen: Arc<Mutex<Vec<Option<String>>>>,
    cmds: broadcast::Sender<Cmd>,
    handshakes: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
}

/// One running mock service bound to a local port.
pub struct TestServer {
    pub addr: SocketAddr,
    state: MockState,
}

impl TestServer {
    /// Starts the mock over the given rows (kept sorted by `updated`).
    pub async fn start(mut rows: Vec<Value>) -> Result<Self> {
        rows.sort_by_key(row_updated);
        let (cmds, _) = broadcast::channel(64);
        let state = MockState {
            rows: Arc::new(Mutex::new(rows)),
            cursors_seen: Arc::new(Mutex::new(Vec::new())),
            cmds,
            handshakes: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
        };
        let router = Router::new()
            .route("/api/search", get(search))
            .route("/api/annotations", post(create_row))
            .route(
                "/api/annotations/{id}",
                get(get_row).patch(patch_row).delete(delete_row),
            )
            .route("/ws", get(upgrade))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(axum::serve(listener, router.layer(TraceLayer::new_for_http())).into_future());
        Ok(Self { addr, state })
    }

    pub fn config(&self, group: &str) -> SyncConfig {
        SyncConfig::new(TEST_TOKEN, TEST_USER, group)
    }

    /// A client aimed at this server instead of the public service.
    pub fn api(&self, group: &str) -> HypApi {
        let root = Url::parse(&format!("http://{}/api/", self.addr)).unwrap();
        HypApi::with_api_root(root, &self.config(group)).unwrap()
    }

    pub fn fetcher(&self, group: &str) -> AnnoFetcher {
        AnnoFetcher::new(self.api(group))
    }

    pub fn memoizer(&self, group: &str, path: impl Into<std::path::PathBuf>) -> Memoizer {
        Memoizer::new(path, self.fetcher(group))
    }

    pub fn ws_endpoint(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Appends rows server-side, as if annotations appeared upstream.
    pub fn add_rows(&self, rows: Vec<Value>) {
        let mut existing = self.state.rows.lock().unwrap();
        existing.extend(rows);
        existing.sort_by_key(row_updated);
    }

    /// Replaces the row with the same id, as if it was edited upstream.
    pub fn replace_row(&self, row: Value) {
        let id = row["id"].as_str().unwrap().to_owned();
        let mut rows = self.state.rows.lock().unwrap();
        rows.retain(|r| r["id"].as_str() != Some(&id));
        rows.push(row);
        rows.sort_by_key(row_updated);
    }

    /// `search_after` cursors received so far, in request order.
    pub fn cursors_seen(&self) -> Vec<Option<String>> {
        self.state.cursors_seen.lock().unwrap().clone()
    }

    /// Frames received from websocket clients, in arrival order.
    pub fn handshakes(&self) -> Vec<Value> {
        self.state.handshakes.lock().unwrap().clone()
    }

    /// Number of websocket connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Sends one frame to every open websocket connection.
    pub fn send_frame(&self, frame: &Value) {
        self.state.cmds.send(Cmd::Frame(frame.to_string())).ok();
    }

    /// Sends raw (possibly malformed) text to every open connection.
    pub fn send_text(&self, text: &str) {
        self.state.cmds.send(Cmd::Frame(text.to_owned())).ok();
    }

    /// Closes every open websocket connection server-side.
    pub fn close_connections(&self) {
        self.state.cmds.send(Cmd::Close).ok();
    }
}

fn row_updated(row: &Value) -> String {
    row["updated"].as_str().unwrap_or_default().to_owned()
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    group: Option<String>,
    user: Option<String>,
    sort: Option<String>,
    order: Option<String>,
    limit: Option<usize>,
    search_after: Option<String>,
    #[allow(dead_code)]
    offset: Option<usize>,
}

async fn search(State(state): State<MockState>, Query(query): Query<SearchQuery>) -> Json<Value> {
    state
        .cursors_seen
        .lock()
        .unwrap()
        .push(query.search_after.clone());

    let sort = query.sort.unwrap_or_else(|| "updated".to_owned());
    let descending = query.order.as_deref() == Some("desc");
    let rows = state.rows.lock().unwrap();
    let mut matched: Vec<&Value> = rows
        .iter()
        .filter(|row| match &query.group {
            Some(group) => row["group"].as_str() == Some(group),
            None => true,
        })
        .filter(|row| match &query.user {
            Some(user) => {
                let row_user = row["user"].as_str().unwrap_or_default();
                row_user == user || row_user == format!("acct:{user}@hypothes.is")
            }
            None => true,
        })
        .collect();
    matched.sort_by_key(|row| row[&sort].as_str().unwrap_or_default().to_owned());
    if descending {
        matched.reverse();
    }
    if let Some(after) = &query.search_after {
        matched.retain(|row| {
            let stamp = row[&sort].as_str().unwrap_or_default();
            if descending {
                stamp < after.as_str()
            } else {
                stamp > after.as_str()
            }
        });
    }
    let total = matched.len();
    let limit = query.limit.unwrap_or(20).min(200);
    let page: Vec<Value> = matched.into_iter().take(limit).cloned().collect();
    Json(json!({ "rows": page, "total": total }))
}

async fn get_row(
    State(state): State<MockState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let rows = state.rows.lock().unwrap();
    rows.iter()
        .find(|row| row["id"].as_str() == Some(&id))
        .map(|row| Json(row.clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn create_row(
    State(state): State<MockState>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    let mut rows = state.rows.lock().unwrap();
    let stamp = fresh_stamp(rows.len());
    let mut row = payload;
    row["id"] = json!(format!("created{:04}", rows.len()));
    row["created"] = json!(stamp);
    row["updated"] = json!(stamp);
    rows.push(row.clone());
    Json(row)
}

/// Stamps on a later day than [`stamp_at`] produces, so server-side writes
/// always sort after the seeded rows.
fn fresh_stamp(n: usize) -> String {
    format!(
        "2024-03-02T00:{:02}:{:02}.000000+00:00",
        (n / 60) % 60,
        n % 60
    )
}

async fn patch_row(
    State(state): State<MockState>,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut rows = state.rows.lock().unwrap();
    let stamp = fresh_stamp(rows.len());
    let row = rows
        .iter_mut()
        .find(|row| row["id"].as_str() == Some(&id))
        .ok_or(StatusCode::NOT_FOUND)?;
    if let (Value::Object(row), Value::Object(patch)) = (&mut *row, payload) {
        for (key, value) in patch {
            row.insert(key, value);
        }
    }
    row["updated"] = json!(stamp);
    Ok(Json(row.clone()))
}

async fn delete_row(
    State(state): State<MockState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let mut rows = state.rows.lock().unwrap();
    let before = rows.len();
    rows.retain(|row| row["id"].as_str() != Some(&id));
    if rows.len() == before {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({ "deleted": true, "id": id })))
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<MockState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_ws(socket, state))
}

async fn serve_ws(mut socket: WebSocket, state: MockState) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut cmds = state.cmds.subscribe();
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) {
                        state.handshakes.lock().unwrap().push(frame);
                    }
                }
                None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            cmd = cmds.recv() => match cmd {
                Ok(Cmd::Frame(text)) => {
                    if socket.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Cmd::Close) | Err(_) => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }
}

/// Deterministic rows sorted by `updated`, one second apart.
pub fn make_rows(n: usize, group: &str) -> Vec<Value> {
    (0..n).map(|i| make_row(i, group)).collect()
}

/// One synthetic row; `updated` stamps sort in index order.
pub fn make_row(i: usize, group: &str) -> Value {
    let stamp = stamp_at(i);
    json!({
        "id": format!("anno{i:04}"),
        "group": group,
        "user": format!("acct:{TEST_USER}@hypothes.is"),
        "created": stamp,
        "updated": stamp,
        "uri": "https://example.com/article",
        "text": format!("note {i}"),
        "tags": [format!("topic-{}", i % 3)],
        "permissions": { "read": [format!("group:{group}")] },
        "target": [{
            "scope": ["https://example.com/article"],
            "selector": [{
                "type": "TextQuoteSelector",
                "prefix": "lorem ",
                "exact": format!("ipsum {i}"),
                "suffix": " dolor",
            }],
        }],
        "document": { "title": ["Example Article"] },
    })
}

/// RFC 3339 stamp `i` seconds into the synthetic timeline.
pub fn stamp_at(i: usize) -> String {
    format!(
        "2024-03-01T{:02}:{:02}:{:02}.000000+00:00",
        i / 3600,
        (i / 60) % 60,
        i % 60
    )
}

/// A notification frame as the service emits them.
pub fn notification(action: &str, payload: Vec<Value>) -> Value {
    json!({
        "type": "annotation-notification",
        "options": { "action": action },
        "payload": payload,
    })
}

/// Polls a condition until it holds or a few seconds pass.
pub async fn eventually<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hypsync_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
