//! Filter/handler pairs applied to decoded stream events.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::annotation::Annotation;
use crate::cache::Memoizer;
use crate::error::{Error, Result};
use crate::index::AnnotationIndex;

/// Action carried by a notification event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// Options block of a notification event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventOptions {
    pub action: Action,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One decoded annotation notification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub options: EventOptions,
    /// Affected rows; delete events carry only an id per row.
    #[serde(default)]
    pub payload: Vec<Value>,
}

/// A consumer of decoded events, with an optional rejection filter that
/// runs before any side effects.
#[async_trait]
pub trait FilterHandler: Send {
    /// Whether this handler wants the event.
    fn filter(&mut self, _event: &Event) -> bool {
        true
    }

    /// Applies the event.
    async fn handle(&mut self, event: &Event) -> Result<()>;
}

/// An ordered chain of handlers invoked per event.
///
/// Handlers run one after another; a failing handler is logged and the
/// rest of the chain still runs.
#[derive(Default)]
pub struct Pipeline {
    handlers: Vec<Box<dyn FilterHandler>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler to the chain.
    pub fn push(&mut self, handler: impl FilterHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Builder form of [`Pipeline::push`].
    pub fn with(mut self, handler: impl FilterHandler + 'static) -> Self {
        self.push(handler);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs every accepting handler on the event, in order.
    pub async fn dispatch(&mut self, event: &Event) {
        for handler in &mut self.handlers {
            if handler.filter(event) {
                if let Err(e) = handler.handle(event).await {
                    error!("handler failed on {:?} event: {e}", event.options.action);
                }
            }
        }
    }
}

/// Keeps the annotation index and the cache file in step with the stream.
pub struct SyncHandler {
    index: Arc<Mutex<AnnotationIndex>>,
    memoizer: Arc<Memoizer>,
}

impl SyncHandler {
    pub fn new(index: Arc<Mutex<AnnotationIndex>>, memoizer: Arc<Memoizer>) -> Self {
        Self { index, memoizer }
    }
}

#[async_trait]
impl FilterHandler for SyncHandler {
    async fn handle(&mut self, event: &Event) -> Result<()> {
        let Some(row) = event.payload.first() else {
            return Err(Error::Decode("notification with empty payload".to_owned()));
        };
        let records = {
            let mut index = self.index.lock().await;
            match event.options.action {
                Action::Create | Action::Update => {
                    let anno = Annotation::from_row(row.clone())?;
                    index.insert(anno);
                }
                Action::Delete => {
                    let id = row
                        .get("id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::Decode("delete event without id".to_owned()))?;
                    index.remove(id);
                }
            }
            index.sorted_records()
        };
        self.memoizer.persist(&records).await
    }
}

/// Logs every event; useful at the tail of a pipeline.
pub struct PrintHandler;

#[async_trait]
impl FilterHandler for PrintHandler {
    async fn handle(&mut self, event: &Event) -> Result<()> {
        let ids: Vec<&str> = event
            .payload
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str))
            .collect();
        info!("{:?} event for {ids:?}", event.options.action);
        Ok(())
    }
}
