//! Host side of the bridge: request/reply correlation over the message channel.

use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bridge::{Bridge, BridgeError, BridgeHandle, BridgeOptions};
use crate::loader::EngineLoader;
use crate::message::{BridgeReply, OutboundMessage, Protocol};

type Pending = Arc<DashMap<String, oneshot::Sender<BridgeReply>>>;

/// Drives one persistent bridge. Each call gets a correlation token (a UUID
/// unless the caller brings its own) and waits for the reply carrying it, so
/// jobs may complete in any order.
#[derive(Clone, Debug)]
pub struct LayoutClient {
    handle: BridgeHandle,
    pending: Pending,
    timeout: Option<Duration>,
}

impl LayoutClient {
    pub fn spawn(loader: EngineLoader, options: BridgeOptions) -> Self {
        let options = BridgeOptions {
            protocol: Protocol::Correlated,
            ..options
        };
        let (handle, replies) = Bridge::spawn(loader, options);
        let pending: Pending = Arc::new(DashMap::new());
        tokio::spawn(route_replies(replies, pending.clone()));
        Self {
            handle,
            pending,
            timeout: None,
        }
    }

    /// Bounds how long [`LayoutClient::render`] waits for a reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn handle(&self) -> &BridgeHandle {
        &self.handle
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub async fn render(&self, graph: impl Into<String>) -> Result<String, BridgeError> {
        let token = Value::String(Uuid::new_v4().to_string());
        into_markup(self.render_with_id(graph, token).await?)
    }

    /// Submits `graph` under `event_id` and returns the matching reply. The
    /// token is echoed back unchanged in the reply.
    pub async fn render_with_id(&self, graph: impl Into<String>, event_id: Value) -> Result<BridgeReply, BridgeError> {
        let key = token_key(&event_id);
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(BridgeError::Protocol(format!("event id {key} is already in flight")));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        if let Err(e) = self.handle.submit(graph, Some(event_id)).await {
            self.pending.remove(&key);
            return Err(e);
        }

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.remove(&key);
                    return Err(BridgeError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        outcome.map_err(|_| BridgeError::Closed)
    }

    pub fn terminate(&self) {
        self.handle.terminate();
    }
}

async fn route_replies(mut replies: mpsc::Receiver<OutboundMessage>, pending: Pending) {
    while let Some(msg) = replies.recv().await {
        let reply = msg.into_reply();
        let Some(event_id) = reply.event_id() else {
            warn!("dropping reply without an event id");
            continue;
        };
        match pending.remove(&token_key(event_id)) {
            Some((_, waiter)) => {
                let _ = waiter.send(reply);
            }
            None => debug!(%event_id, "no caller waiting for reply"),
        }
    }
    // bridge gone: wake every waiter with an error
    pending.clear();
}

/// JSON text of the token, so `"1"` and `1` are different keys.
fn token_key(event_id: &Value) -> String {
    event_id.to_string()
}

fn into_markup(reply: BridgeReply) -> Result<String, BridgeError> {
    match reply {
        BridgeReply::Rendered { markup, .. } => Ok(markup),
        BridgeReply::Failed { kind, message, .. } => Err(BridgeError::Failed { kind, message }),
    }
}

/// Renders one diagram on a fresh single-use bridge, which closes itself
/// after replying.
pub async fn render_once(
    loader: EngineLoader,
    options: BridgeOptions,
    graph: impl Into<String>,
) -> Result<String, BridgeError> {
    let options = BridgeOptions {
        protocol: Protocol::SingleUse,
        ..options
    };
    let (handle, mut replies) = Bridge::spawn(loader, options);
    handle.submit(graph, None).await?;
    match replies.recv().await {
        Some(msg) => into_markup(msg.into_reply()),
        None => Err(BridgeError::Closed),
    }
}
