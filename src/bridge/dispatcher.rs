//! Event-type routing, built once when a bridge starts.

use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::{BridgeError, BridgeState};
use crate::engine::LayoutOptions;
use crate::loader::EngineLoader;
use crate::logger::JobMetrics;
use crate::message::{BridgeReply, ErrorKind, InboundMessage, Protocol};

/// Handles one recognised inbound message and produces exactly one reply.
#[async_trait]
pub trait EventHandler: Send + Sync + Debug {
    async fn handle(&self, msg: InboundMessage) -> BridgeReply;
}

pub enum Route {
    Handle(Arc<dyn EventHandler>),
    Ignore,
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The routing table for `protocol`: its request tag maps to a layout job.
    pub fn for_protocol(protocol: Protocol, handler: Arc<dyn EventHandler>) -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(protocol.request_type().as_ref(), handler);
        dispatcher
    }

    pub fn register(&mut self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type.to_string(), handler);
    }

    pub fn route(&self, event_type: &str) -> Route {
        match self.handlers.get(event_type) {
            Some(handler) => Route::Handle(handler.clone()),
            None => {
                debug!(%event_type, "ignoring unrecognised event type");
                Route::Ignore
            }
        }
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// Loads the engine and lays out the graph carried in `eventData`.
#[derive(Debug)]
pub struct LayoutHandler {
    pub(crate) loader: EngineLoader,
    pub(crate) options: LayoutOptions,
    pub(crate) timeout: Option<Duration>,
    pub(crate) protocol: Protocol,
    pub(crate) state: Arc<watch::Sender<BridgeState>>,
}

impl LayoutHandler {
    async fn run(&self, graph: String) -> Result<String, BridgeError> {
        self.state.send_replace(BridgeState::Loading);
        let engine = self.loader.load().await?;

        self.state.send_replace(BridgeState::Computing);
        let options = self.options.clone();
        let markup = tokio::task::spawn_blocking(move || engine.render(&graph, &options))
            .await
            .map_err(|e| BridgeError::Protocol(format!("layout worker panicked: {e}")))??;
        Ok(markup)
    }

    async fn run_bounded(&self, graph: String) -> Result<String, BridgeError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(graph))
                .await
                .map_err(|_| BridgeError::Timeout(limit))?,
            None => self.run(graph).await,
        }
    }
}

#[async_trait]
impl EventHandler for LayoutHandler {
    async fn handle(&self, msg: InboundMessage) -> BridgeReply {
        let InboundMessage {
            event_data, event_id, ..
        } = msg;
        let Some(graph) = event_data.as_ref().and_then(|v| v.as_str()).map(str::to_string) else {
            self.state.send_replace(BridgeState::Failed);
            return BridgeReply::failed(
                ErrorKind::InvalidRequest,
                "eventData must be the graph description text",
                event_id,
            );
        };

        let result = JobMetrics::global()
            .instrument_job("layout", self.protocol.as_ref(), self.run_bounded(graph))
            .await;

        match result {
            Ok(markup) => {
                self.state.send_replace(BridgeState::Done);
                BridgeReply::Rendered { markup, event_id }
            }
            Err(err) => {
                self.state.send_replace(BridgeState::Failed);
                let kind = err.kind().unwrap_or(ErrorKind::Layout);
                BridgeReply::failed(kind, err.to_string(), event_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl EventHandler for Echo {
        async fn handle(&self, msg: InboundMessage) -> BridgeReply {
            BridgeReply::Rendered {
                markup: msg.graph_text().unwrap_or_default().to_string(),
                event_id: msg.event_id,
            }
        }
    }

    #[tokio::test]
    async fn test_routes_only_protocol_tag() {
        let dispatcher = Dispatcher::for_protocol(Protocol::Correlated, Arc::new(Echo));
        assert!(matches!(dispatcher.route("INITIALISE"), Route::Handle(_)));
        assert!(matches!(dispatcher.route("LAYOUT"), Route::Ignore));
        assert!(matches!(dispatcher.route("initialise"), Route::Ignore));
        assert!(matches!(dispatcher.route(""), Route::Ignore));

        let legacy = Dispatcher::for_protocol(Protocol::SingleUse, Arc::new(Echo));
        assert_eq!(legacy.event_types().collect::<Vec<_>>(), vec!["LAYOUT"]);

        match dispatcher.route("INITIALISE") {
            Route::Handle(handler) => {
                let reply = handler
                    .handle(InboundMessage::new("INITIALISE", Some(json!("g")), Some(json!(1))))
                    .await;
                assert_eq!(reply.event_id(), Some(&json!(1)));
            }
            Route::Ignore => panic!("expected a handler"),
        }
    }

    fn handler(timeout: Option<Duration>) -> (LayoutHandler, watch::Receiver<BridgeState>) {
        let (tx, rx) = watch::channel(BridgeState::Idle);
        let handler = LayoutHandler {
            loader: EngineLoader::native(),
            options: LayoutOptions::default(),
            timeout,
            protocol: Protocol::Correlated,
            state: Arc::new(tx),
        };
        (handler, rx)
    }

    #[tokio::test]
    async fn test_layout_handler_renders_and_reports_state() {
        let (handler, state) = handler(None);
        let reply = handler
            .handle(InboundMessage::layout(Protocol::Correlated, "digraph{a->b}", Some(json!("job-42"))))
            .await;
        match reply {
            BridgeReply::Rendered { markup, event_id } => {
                assert!(markup.contains("<svg"));
                assert_eq!(event_id, Some(json!("job-42")));
            }
            other => panic!("expected markup, got {:?}", other),
        }
        assert_eq!(*state.borrow(), BridgeState::Done);
    }

    #[tokio::test]
    async fn test_layout_handler_rejects_missing_graph() {
        let (handler, state) = handler(None);
        let reply = handler
            .handle(InboundMessage::new("INITIALISE", Some(json!(42)), Some(json!("x"))))
            .await;
        assert!(matches!(
            reply,
            BridgeReply::Failed {
                kind: ErrorKind::InvalidRequest,
                ..
            }
        ));
        assert_eq!(*state.borrow(), BridgeState::Failed);
    }

    #[tokio::test]
    async fn test_layout_handler_maps_parse_error() {
        let (handler, _state) = handler(Some(Duration::from_secs(5)));
        let reply = handler
            .handle(InboundMessage::layout(Protocol::Correlated, "digraph {", None))
            .await;
        match reply {
            BridgeReply::Failed { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::Layout);
                assert!(message.contains("syntax error"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
