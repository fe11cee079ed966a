//! Websocket subscription to the annotation event stream.

use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::handler::{Event, Pipeline};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How clause values are combined by the server-side filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    IncludeAny,
    IncludeAll,
}

/// Server-side filter installed on the subscription.
///
/// Empty clause lists are omitted; with no groups the server defaults to
/// everything the authenticated user can see. Address clauses match
/// exactly, the server does no normalization on them.
#[derive(Clone, Debug)]
pub struct Prefilter {
    pub groups: Vec<String>,
    pub users: Vec<String>,
    pub uris: Vec<String>,
    pub tags: Vec<String>,
    pub create: bool,
    pub update: bool,
    pub delete: bool,
    pub match_policy: MatchPolicy,
}

impl Default for Prefilter {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            users: Vec::new(),
            uris: Vec::new(),
            tags: Vec::new(),
            create: true,
            update: true,
            delete: true,
            match_policy: MatchPolicy::IncludeAny,
        }
    }
}

impl Prefilter {
    /// A filter over a single group, all actions.
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            groups: vec![group.into()],
            ..Self::default()
        }
    }

    /// The filter document sent to the server.
    pub fn export(&self) -> Value {
        let clause_map = [
            ("/group", &self.groups),
            ("/user", &self.users),
            ("/uri", &self.uris),
            ("/tags", &self.tags),
        ];
        let clauses: Vec<Value> = clause_map
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(field, values)| {
                json!({
                    "field": field,
                    "case_sensitive": true,
                    "operator": "one_of",
                    "options": {},
                    "value": values,
                })
            })
            .collect();
        json!({
            "filter": {
                "actions": {
                    "create": self.create,
                    "update": self.update,
                    "delete": self.delete,
                },
                "match_policy": self.match_policy,
                "clauses": clauses,
            },
        })
    }
}

enum SessionEnd {
    Disconnected,
}

/// Long-lived websocket client feeding the handler pipeline.
///
/// Reconnects on connection loss without backoff, re-announcing the client
/// id and re-installing the filter each time. [`Subscriber::kill`] stops
/// the loop cleanly, including out of a blocked receive.
pub struct Subscriber {
    endpoint: String,
    token: String,
    prefilter: Prefilter,
    pipeline: Mutex<Pipeline>,
    notify: Notify,
    killed: AtomicBool,
}

impl Subscriber {
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        prefilter: Prefilter,
        pipeline: Pipeline,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            prefilter,
            pipeline: Mutex::new(pipeline),
            notify: Notify::new(),
            killed: AtomicBool::new(false),
        }
    }

    /// Stream endpoint for a service domain.
    pub fn endpoint_for_domain(domain: &str) -> String {
        format!("wss://{domain}/ws")
    }

    /// Requests shutdown; any blocked receive wakes up.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    /// Whether shutdown has been requested.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    /// Runs the subscription until shutdown.
    ///
    /// Connection loss reconnects immediately; a failed connection attempt
    /// and runtime errors propagate to the caller.
    pub async fn listen(&self) -> Result<()> {
        while !self.killed() {
            let mut ws = self.connect().await?;
            match self.session(&mut ws).await {
                Ok(SessionEnd::Disconnected) => {
                    info!("connection lost, reconnecting");
                }
                Err(Error::Cancelled) => break,
                Err(e) => return Err(e),
            }
        }
        info!("subscriber shut down");
        Ok(())
    }

    async fn connect(&self) -> Result<WsStream> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(Error::transport)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| Error::Usage(format!("token is not a valid header value: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (mut ws, _response) = connect_async(request).await.map_err(Error::transport)?;
        info!("websocket connected to {}", self.endpoint);

        let client_id = json!({
            "messageType": "client_id",
            "value": Uuid::new_v4().to_string(),
        });
        ws.send(Message::text(client_id.to_string()))
            .await
            .map_err(Error::transport)?;
        ws.send(Message::text(self.prefilter.export().to_string()))
            .await
            .map_err(Error::transport)?;
        debug!("subscription filter installed");
        Ok(ws)
    }

    async fn session(&self, ws: &mut WsStream) -> Result<SessionEnd> {
        loop {
            // A kill issued while connecting fires the notification before
            // anything waits on it; the flag catches that window.
            if self.killed() {
                return Err(Error::Cancelled);
            }
            tokio::select! {
                _ = self.notify.notified() => return Err(Error::Cancelled),
                frame = ws.next() => match frame {
                    None => return Ok(SessionEnd::Disconnected),
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()).await,
                    Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Disconnected),
                    Some(Ok(_)) => {}
                    Some(Err(e)) if is_disconnect(&e) => return Ok(SessionEnd::Disconnected),
                    Some(Err(e)) => return Err(Error::transport(e)),
                },
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!("dropping malformed frame: {e}");
                return;
            }
        };
        if value.get("type").and_then(Value::as_str) != Some("annotation-notification") {
            debug!("dropping non-annotation frame: {value}");
            return;
        }
        let event: Event = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping undecodable notification: {e}");
                return;
            }
        };
        self.pipeline.lock().await.dispatch(&event).await;
    }
}

fn is_disconnect(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Io(_)
            | tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
            )
    )
}
