use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use diagram_bridge::bridge::BridgeOptions;
use diagram_bridge::loader::{AssetSource, LoadError, WasmCompiler};
use diagram_bridge::{
    Bridge, BridgeError, BridgeState, EngineLoader, ErrorKind, EventType, InboundMessage, LayoutClient, Protocol,
};
use serde_json::json;
use tokio::time::timeout;

const ECHO: &str = include_str!("fixtures/echo_layout.wat");
const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

#[derive(Debug, Default)]
struct FakeCdn {
    fetches: AtomicUsize,
    status: Option<u16>,
    delay: Duration,
}

impl FakeCdn {
    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetSource for FakeCdn {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, LoadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match self.status {
            Some(status) => Err(LoadError::Status {
                location: location.to_string(),
                status,
            }),
            None => Ok(ECHO.as_bytes().to_vec()),
        }
    }
}

fn wasm_loader(cdn: Arc<FakeCdn>) -> EngineLoader {
    EngineLoader::with_source(
        "https://cdn.example.com/layout.wasm",
        cdn,
        Arc::new(WasmCompiler::default()),
    )
}

#[tokio::test]
async fn correlation_token_round_trips() {
    let cdn = Arc::new(FakeCdn::default());
    let (handle, mut replies) = Bridge::spawn(wasm_loader(cdn.clone()), BridgeOptions::default());

    handle.submit("digraph{a->b}", Some(json!("job-42"))).await.unwrap();
    let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();

    assert_eq!(reply.event_type, EventType::Result);
    assert_eq!(reply.event_id, Some(json!("job-42")));
    assert_eq!(reply.event_data, "<svg>digraph{a->b}</svg>");
    assert_eq!(cdn.fetches(), 1);
}

#[tokio::test]
async fn engine_is_fetched_once_across_jobs_and_bridges() {
    let cdn = Arc::new(FakeCdn {
        delay: Duration::from_millis(50),
        ..FakeCdn::default()
    });
    let loader = wasm_loader(cdn.clone());

    let (first, mut first_replies) = Bridge::spawn(loader.clone(), BridgeOptions::default());
    for i in 0..3 {
        first.submit(format!("digraph{{n{i}}}"), Some(json!(i))).await.unwrap();
    }
    for _ in 0..3 {
        let reply = timeout(WAIT, first_replies.recv()).await.unwrap().unwrap();
        assert_eq!(reply.event_type, EventType::Result);
    }

    let (second, mut second_replies) = Bridge::spawn(loader, BridgeOptions::with_protocol(Protocol::SingleUse));
    second.submit("graph{x}", None).await.unwrap();
    let reply = timeout(WAIT, second_replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply.event_type, EventType::LayoutResult);

    assert_eq!(cdn.fetches(), 1);
}

#[tokio::test]
async fn unrecognised_event_type_gets_no_reply_and_no_fetch() {
    let cdn = Arc::new(FakeCdn::default());
    let (handle, mut replies) = Bridge::spawn(wasm_loader(cdn.clone()), BridgeOptions::default());

    handle
        .post(InboundMessage::new("RESIZE", Some(json!("digraph{a}")), Some(json!(1))))
        .await
        .unwrap();
    // a legacy tag is unknown to a correlated bridge
    handle
        .post(InboundMessage::new("LAYOUT", Some(json!("digraph{a}")), Some(json!(2))))
        .await
        .unwrap();

    assert!(timeout(QUIET, replies.recv()).await.is_err());
    assert_eq!(cdn.fetches(), 0);
    assert_eq!(handle.state(), BridgeState::Idle);
}

#[tokio::test]
async fn malformed_graph_yields_layout_error() {
    let (handle, mut replies) = Bridge::spawn(EngineLoader::native(), BridgeOptions::default());
    handle.submit("digraph { a -> ", Some(json!("bad"))).await.unwrap();

    let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply.event_type, EventType::Error);
    assert_eq!(reply.error_kind, Some(ErrorKind::Layout));
    assert_eq!(reply.event_id, Some(json!("bad")));
    assert!(reply.event_data.contains("line 1"));

    let guest_error = Arc::new(FakeCdn::default());
    let (handle, mut replies) = Bridge::spawn(wasm_loader(guest_error), BridgeOptions::default());
    handle.submit("", None).await.unwrap();
    let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply.error_kind, Some(ErrorKind::Layout));
    assert!(reply.event_data.contains("empty graph"));
}

#[tokio::test]
async fn single_use_bridge_serves_exactly_one_request() {
    let cdn = Arc::new(FakeCdn::default());
    let (handle, mut replies) = Bridge::spawn(
        wasm_loader(cdn.clone()),
        BridgeOptions::with_protocol(Protocol::SingleUse),
    );

    handle.submit("graph{a--b}", None).await.unwrap();
    let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply.event_type, EventType::LayoutResult);
    assert_eq!(reply.event_id, None);

    timeout(WAIT, handle.closed()).await.unwrap();
    let second = handle.submit("graph{c--d}", None).await;
    assert!(matches!(second, Err(BridgeError::Closed)));
    assert!(timeout(WAIT, replies.recv()).await.unwrap().is_none());
    assert_eq!(cdn.fetches(), 1);
}

#[tokio::test]
async fn fetch_failure_yields_load_error() {
    let cdn = Arc::new(FakeCdn {
        status: Some(404),
        ..FakeCdn::default()
    });
    let (handle, mut replies) = Bridge::spawn(wasm_loader(cdn.clone()), BridgeOptions::default());
    handle.submit("digraph{a}", Some(json!(7))).await.unwrap();

    let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply.event_type, EventType::Error);
    assert_eq!(reply.error_kind, Some(ErrorKind::Load));
    assert_eq!(reply.event_id, Some(json!(7)));
    assert!(reply.event_data.contains("404"));

    // failures are not memoized
    handle.submit("digraph{a}", Some(json!(8))).await.unwrap();
    timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(cdn.fetches(), 2);
}

#[tokio::test]
async fn concurrent_jobs_are_matched_by_token() {
    let client = LayoutClient::spawn(EngineLoader::native(), BridgeOptions::default());
    let graphs: Vec<String> = (0..8).map(|i| format!("digraph{{ node{i} -> sink }}")).collect();

    let results = futures::future::join_all(graphs.iter().map(|g| client.render(g.clone()))).await;
    for (i, svg) in results.into_iter().enumerate() {
        let svg = svg.unwrap();
        assert!(svg.contains(&format!("<title>node{i}</title>")));
    }
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn slow_engine_load_times_out() {
    let cdn = Arc::new(FakeCdn {
        delay: Duration::from_secs(2),
        ..FakeCdn::default()
    });
    let options = BridgeOptions {
        timeout: Some(Duration::from_millis(100)),
        ..BridgeOptions::default()
    };
    let (handle, mut replies) = Bridge::spawn(wasm_loader(cdn), options);
    handle.submit("digraph{a}", Some(json!("slow"))).await.unwrap();

    let reply = timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(reply.event_id, Some(json!("slow")));
}

#[tokio::test]
async fn terminate_abandons_in_flight_jobs() {
    let cdn = Arc::new(FakeCdn {
        delay: Duration::from_secs(2),
        ..FakeCdn::default()
    });
    let (handle, mut replies) = Bridge::spawn(wasm_loader(cdn), BridgeOptions::default());
    handle.submit("digraph{a}", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.in_flight(), 1);

    handle.terminate();
    assert!(timeout(WAIT, replies.recv()).await.unwrap().is_none());
    assert!(matches!(handle.submit("digraph{b}", None).await, Err(BridgeError::Closed)));
}

#[tokio::test]
async fn deep_graphs_get_a_reply() {
    let options = BridgeOptions {
        timeout: None,
        ..BridgeOptions::default()
    };
    let (handle, mut replies) = Bridge::spawn(EngineLoader::native(), options);

    let mut chain = String::from("digraph{");
    for i in 0..50_000 {
        chain.push_str(&format!("n{i}->"));
    }
    chain.push_str("end}");
    handle.submit(chain, Some(json!("chain"))).await.unwrap();

    let nested = format!("digraph{{{}a{}}}", "{".repeat(5_000), "}".repeat(5_000));
    handle.submit(nested, Some(json!("nested"))).await.unwrap();

    for _ in 0..2 {
        let reply = timeout(Duration::from_secs(120), replies.recv()).await.unwrap().unwrap();
        match reply.event_id.as_ref().and_then(|id| id.as_str()) {
            Some("chain") => {
                assert_eq!(reply.event_type, EventType::Result);
                assert!(reply.event_data.contains("<title>end</title>"));
            }
            Some("nested") => {
                assert_eq!(reply.error_kind, Some(ErrorKind::Layout));
                assert!(reply.event_data.contains("nesting too deep"));
            }
            other => panic!("unexpected reply id {other:?}"),
        }
    }
}
