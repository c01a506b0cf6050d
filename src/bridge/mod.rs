//! The layout bridge: an actor reached only through its message channel.
//!
//! [`Bridge::spawn`] starts the actor and returns a [`BridgeHandle`] for
//! posting requests plus the receiver on which replies arrive. Each
//! recognised request yields exactly one reply, either markup or a typed
//! `ERROR`. A [`Protocol::SingleUse`] bridge stops reading after its first
//! recognised request; a [`Protocol::Correlated`] bridge runs jobs
//! concurrently until it is terminated or every handle is dropped.

pub mod dispatcher;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use crate::message::Protocol;
use crate::engine::{LayoutError, LayoutOptions};
use crate::loader::{EngineLoader, LoadError};
use crate::message::{ErrorKind, InboundMessage, OutboundMessage};
use dispatcher::{Dispatcher, LayoutHandler, Route};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge is closed")]
    Closed,
    #[error("could not load layout engine: {0}")]
    Load(#[from] LoadError),
    #[error("layout failed: {0}")]
    Layout(#[from] LayoutError),
    #[error("layout did not finish within {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{kind} failure: {message}")]
    Failed { kind: ErrorKind, message: String },
}

impl BridgeError {
    /// The `errorKind` a reply for this error carries. `Closed` never
    /// produces a reply.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            BridgeError::Closed => None,
            BridgeError::Load(_) => Some(ErrorKind::Load),
            BridgeError::Layout(_) => Some(ErrorKind::Layout),
            BridgeError::Timeout(_) => Some(ErrorKind::Timeout),
            BridgeError::Protocol(_) => Some(ErrorKind::InvalidRequest),
            BridgeError::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// Job lifecycle as published on the bridge's state channel.
///
/// A single-use bridge runs one job, so the state is that job's. A persistent
/// bridge may run several jobs at once; its state is then the latest
/// transition of any of them, and it returns to `Idle` once none is in flight.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Idle,
    Loading,
    Computing,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub protocol: Protocol,
    pub layout: LayoutOptions,
    /// Bound on one job, engine load included.
    pub timeout: Option<Duration>,
    pub queue_capacity: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            layout: LayoutOptions::default(),
            timeout: Some(Duration::from_secs(30)),
            queue_capacity: 32,
        }
    }
}

impl BridgeOptions {
    pub fn with_protocol(protocol: Protocol) -> Self {
        Self {
            protocol,
            ..Self::default()
        }
    }
}

/// Sending side of a running bridge. Cheap to clone.
#[derive(Clone, Debug)]
pub struct BridgeHandle {
    tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
    state: watch::Receiver<BridgeState>,
    in_flight: Arc<AtomicUsize>,
    protocol: Protocol,
}

impl BridgeHandle {
    /// Queues `msg`. Fails with [`BridgeError::Closed`] once the bridge has
    /// stopped reading.
    pub async fn post(&self, msg: InboundMessage) -> Result<(), BridgeError> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Closed);
        }
        self.tx.send(msg).await.map_err(|_| BridgeError::Closed)
    }

    /// Posts a raw JSON message, as received from a transport.
    pub async fn post_json(&self, value: Value) -> Result<(), BridgeError> {
        let msg: InboundMessage =
            serde_json::from_value(value).map_err(|e| BridgeError::Protocol(e.to_string()))?;
        self.post(msg).await
    }

    /// Posts a layout request in this bridge's protocol.
    pub async fn submit(&self, graph: impl Into<String>, event_id: Option<Value>) -> Result<(), BridgeError> {
        self.post(InboundMessage::layout(self.protocol, graph, event_id)).await
    }

    /// Stops the bridge. In-flight jobs are abandoned without a reply.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Latest published [`BridgeState`]. See its docs for concurrent jobs.
    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Resolves once the actor has stopped reading requests.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

pub struct Bridge {
    rx: mpsc::Receiver<InboundMessage>,
    out: mpsc::Sender<OutboundMessage>,
    dispatcher: Dispatcher,
    protocol: Protocol,
    cancel: CancellationToken,
    state: Arc<watch::Sender<BridgeState>>,
    in_flight: Arc<AtomicUsize>,
}

impl Bridge {
    /// Starts a bridge on the current tokio runtime.
    pub fn spawn(loader: EngineLoader, options: BridgeOptions) -> (BridgeHandle, mpsc::Receiver<OutboundMessage>) {
        let capacity = options.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (out, out_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(BridgeState::Idle);
        let state = Arc::new(state_tx);
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));

        let handler = Arc::new(LayoutHandler {
            loader,
            options: options.layout,
            timeout: options.timeout,
            protocol: options.protocol,
            state: state.clone(),
        });
        let bridge = Bridge {
            rx,
            out,
            dispatcher: Dispatcher::for_protocol(options.protocol, handler),
            protocol: options.protocol,
            cancel: cancel.clone(),
            state,
            in_flight: in_flight.clone(),
        };
        tokio::spawn(bridge.run());

        let handle = BridgeHandle {
            tx,
            cancel,
            state: state_rx,
            in_flight,
            protocol: options.protocol,
        };
        (handle, out_rx)
    }

    async fn run(mut self) {
        info!(protocol = %self.protocol, "bridge started");
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("bridge terminated");
                    break;
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => {
                        debug!("all bridge handles dropped");
                        break;
                    }
                },
            };

            let handler = match self.dispatcher.route(&msg.event_type) {
                Route::Handle(handler) => handler,
                Route::Ignore => continue,
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let job = JobRunner {
                out: self.out.clone(),
                protocol: self.protocol,
                cancel: self.cancel.clone(),
                state: self.state.clone(),
                in_flight: self.in_flight.clone(),
            };

            if self.protocol.is_single_use() {
                // one job, then stop reading
                self.rx.close();
                job.run(handler, msg).await;
                info!("single-use bridge closed");
                break;
            }
            tokio::spawn(job.run(handler, msg));
        }
        self.rx.close();
    }
}

struct JobRunner {
    out: mpsc::Sender<OutboundMessage>,
    protocol: Protocol,
    cancel: CancellationToken,
    state: Arc<watch::Sender<BridgeState>>,
    in_flight: Arc<AtomicUsize>,
}

impl JobRunner {
    async fn run(self, handler: Arc<dyn dispatcher::EventHandler>, msg: InboundMessage) {
        let reply = tokio::select! {
            _ = self.cancel.cancelled() => None,
            reply = handler.handle(msg) => Some(reply),
        };
        if let Some(reply) = reply {
            if self.out.send(reply.into_message(self.protocol)).await.is_err() {
                warn!("reply dropped: receiver is gone");
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.protocol.is_single_use() && !self.cancel.is_cancelled() {
            // checked under the channel lock so a job starting now is not reset to Idle
            self.state.send_if_modified(|state| {
                if self.in_flight.load(Ordering::SeqCst) == 0 && *state != BridgeState::Idle {
                    *state = BridgeState::Idle;
                    true
                } else {
                    false
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventType;
    use serde_json::json;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_correlated_round_trip() {
        let (handle, mut replies) = Bridge::spawn(EngineLoader::native(), BridgeOptions::default());
        handle.submit("digraph{a->b}", Some(json!("job-42"))).await.unwrap();

        let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply.event_type, EventType::Result);
        assert_eq!(reply.event_id, Some(json!("job-42")));
        assert!(reply.event_data.contains("<svg"));

        // still listening
        handle.submit("digraph{c}", None).await.unwrap();
        let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply.event_type, EventType::Result);
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_single_use_closes_after_first_job() {
        let (handle, mut replies) =
            Bridge::spawn(EngineLoader::native(), BridgeOptions::with_protocol(Protocol::SingleUse));
        handle.submit("graph{a--b}", None).await.unwrap();

        let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply.event_type, EventType::LayoutResult);
        assert_eq!(handle.state(), BridgeState::Done);

        timeout(WAIT, handle.closed()).await.unwrap();
        assert!(matches!(handle.submit("graph{c}", None).await, Err(BridgeError::Closed)));
        assert!(timeout(WAIT, replies.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_ignored() {
        let (handle, mut replies) =
            Bridge::spawn(EngineLoader::native(), BridgeOptions::with_protocol(Protocol::SingleUse));
        handle
            .post(InboundMessage::new("PING", Some(json!("digraph{}")), None))
            .await
            .unwrap();
        handle
            .post(InboundMessage::new("INITIALISE", Some(json!("digraph{}")), None))
            .await
            .unwrap();
        assert!(timeout(Duration::from_millis(200), replies.recv()).await.is_err());
        assert!(!handle.is_closed());
        assert_eq!(handle.state(), BridgeState::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_settle_to_idle() {
        let (handle, mut replies) = Bridge::spawn(EngineLoader::native(), BridgeOptions::default());
        let mut states = handle.watch_state();
        for i in 0..6 {
            handle.submit(format!("digraph{{n{i}->m{i}}}"), Some(json!(i))).await.unwrap();
        }
        for _ in 0..6 {
            timeout(WAIT, replies.recv()).await.unwrap().unwrap();
        }
        timeout(WAIT, states.wait_for(|s| *s == BridgeState::Idle))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.in_flight(), 0);
        assert_eq!(handle.state(), BridgeState::Idle);
    }

    #[tokio::test]
    async fn test_post_json_rejects_non_object() {
        let (handle, _replies) = Bridge::spawn(EngineLoader::native(), BridgeOptions::default());
        let err = handle.post_json(json!([1, 2, 3])).await.unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
        assert_eq!(err.kind(), Some(ErrorKind::InvalidRequest));
    }

    #[tokio::test]
    async fn test_terminate_closes_bridge() {
        let (handle, mut replies) = Bridge::spawn(EngineLoader::native(), BridgeOptions::default());
        handle.terminate();
        assert!(handle.is_closed());
        assert!(matches!(handle.submit("digraph{}", None).await, Err(BridgeError::Closed)));
        assert!(timeout(WAIT, replies.recv()).await.unwrap().is_none());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(BridgeError::Closed.kind(), None);
        assert_eq!(BridgeError::Timeout(Duration::from_millis(5)).kind(), Some(ErrorKind::Timeout));
        assert_eq!(
            BridgeError::from(LoadError::Io("gone".into())).kind(),
            Some(ErrorKind::Load)
        );
        assert_eq!(BridgeState::Computing.to_string(), "computing");
    }
}
