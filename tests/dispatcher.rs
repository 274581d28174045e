//! Dispatch outcomes: exactly-once delivery, missing handlers, failing handlers

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use interlink::config::DispatchConfig;
use interlink::core::serialization::SerializationFormat;
use interlink::error::DecodeError;
use interlink::protocol::dispatcher::Dispatcher;
use interlink::protocol::envelope::Envelope;
use interlink::protocol::packet::{Origin, Packet};
use interlink::protocol::registry::Registry;
use interlink::protocol::response::{Response, Status};
use interlink::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    target: String,
}

impl Packet for Ping {
    const TYPE_ID: &'static str = "ping";

    fn channel(&self) -> &str {
        &self.target
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Teleport {
    target: String,
    world: String,
    x: i64,
    y: i64,
}

impl Packet for Teleport {
    const TYPE_ID: &'static str = "teleport";

    fn channel(&self) -> &str {
        &self.target
    }
}

fn ping_from(sender: &str) -> Envelope {
    Envelope::new(
        &Ping {
            target: "b".into(),
        },
        sender,
    )
    .unwrap()
}

#[tokio::test]
async fn test_registered_type_runs_its_handler_once() {
    let dispatcher = Dispatcher::default();
    let pings = Arc::new(AtomicUsize::new(0));
    let teleports = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&pings);
    dispatcher
        .register(move |_p: Ping, _o: Origin| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("pong")
            }
        })
        .unwrap();

    let counter = Arc::clone(&teleports);
    dispatcher
        .register(move |_t: Teleport, _o: Origin| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }
        })
        .unwrap();

    let response = dispatcher.dispatch(ping_from("a")).await;
    assert_eq!(response, Response::success(json!("pong")));
    assert_eq!(pings.load(Ordering::SeqCst), 1);
    assert_eq!(teleports.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handler_sees_envelope_origin() {
    let dispatcher = Dispatcher::default();
    dispatcher
        .register(|ping: Ping, origin: Origin| async move {
            Ok::<_, String>(json!({
                "from": origin.sender,
                "to": ping.target,
                "broadcast": origin.is_broadcast(),
            }))
        })
        .unwrap();

    let envelope = ping_from("lobby-1");
    let id = envelope.id();
    let response = dispatcher.dispatch(envelope).await;
    assert!(response.is_success());
    assert_eq!(
        response.payload,
        json!({"from": "lobby-1", "to": "b", "broadcast": false})
    );
    assert_ne!(id, 0);
}

#[tokio::test]
async fn test_unknown_type_yields_no_handler() {
    let dispatcher = Dispatcher::default();
    let response = dispatcher.dispatch(ping_from("a")).await;

    assert_eq!(response.status, Status::NoHandler);
    assert_eq!(response.payload, json!("ping"));
    assert_eq!(dispatcher.metrics().snapshot().no_handler, 1);
}

#[tokio::test]
async fn test_handler_error_becomes_error_response() {
    let dispatcher = Dispatcher::default();
    dispatcher
        .register(|_p: Ping, _o: Origin| async { Err::<(), _>("world is full") })
        .unwrap();

    let response = dispatcher.dispatch(ping_from("a")).await;
    assert_eq!(response.status, Status::Error);
    assert_eq!(response.message(), Some("world is full"));
    assert_eq!(dispatcher.metrics().snapshot().handler_errors, 1);
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let dispatcher = Dispatcher::default();
    dispatcher
        .register(|p: Ping, _o: Origin| async move {
            if p.target == "b" {
                panic!("handler exploded");
            }
            Ok::<_, String>(())
        })
        .unwrap();

    let response = dispatcher.dispatch(ping_from("a")).await;
    assert_eq!(response.status, Status::Error);
    assert!(response.message().unwrap().contains("handler exploded"));

    // The dispatcher keeps working afterwards.
    let again = dispatcher.dispatch(ping_from("a")).await;
    assert_eq!(again.status, Status::Error);
}

#[tokio::test]
async fn test_handler_panicking_before_its_future_is_contained() {
    let dispatcher = Dispatcher::default();
    dispatcher
        .register_with(
            "eager",
            |v: &Value| Ok(v.clone()),
            |_v: Value, _o: Origin| -> std::future::Ready<Result<(), String>> {
                panic!("eager failure")
            },
        )
        .unwrap();

    let envelope = Envelope::from_parts("eager", "a", "b", Value::Null);
    let response = dispatcher.dispatch(envelope).await;
    assert_eq!(response.status, Status::Error);
    assert!(response.message().unwrap().contains("eager failure"));
}

#[tokio::test]
async fn test_schema_mismatch_is_reported_not_dispatched() {
    let dispatcher = Dispatcher::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    dispatcher
        .register(move |_t: Teleport, _o: Origin| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(()) }
        })
        .unwrap();

    let envelope = Envelope::from_parts("teleport", "a", "b", json!({"target": "b", "x": "far"}));
    let response = dispatcher.dispatch(envelope).await;

    assert_eq!(response.status, Status::Error);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.metrics().snapshot().decode_errors, 1);
}

#[tokio::test]
async fn test_async_handler_result_is_awaited() {
    let dispatcher = Dispatcher::default();
    dispatcher
        .register(|_p: Ping, _o: Origin| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, String>(42)
        })
        .unwrap();

    let response = dispatcher.dispatch(ping_from("a")).await;
    assert_eq!(response.decode::<i32>(), Some(42));
}

#[tokio::test]
async fn test_explicit_decoder_registration() {
    let dispatcher = Dispatcher::default();
    dispatcher
        .register_with(
            "sum",
            |v: &Value| {
                v.as_array()
                    .map(|items| items.iter().filter_map(Value::as_i64).collect::<Vec<_>>())
                    .ok_or_else(|| DecodeError::SchemaMismatch {
                        type_id: "sum".into(),
                        reason: "expected an array".into(),
                    })
            },
            |numbers: Vec<i64>, _o: Origin| async move {
                Ok::<_, String>(numbers.iter().sum::<i64>())
            },
        )
        .unwrap();

    let ok = dispatcher
        .dispatch(Envelope::from_parts("sum", "a", "b", json!([1, 2, 3])))
        .await;
    assert_eq!(ok.decode::<i64>(), Some(6));

    let bad = dispatcher
        .dispatch(Envelope::from_parts("sum", "a", "b", json!({"n": 1})))
        .await;
    assert_eq!(bad.status, Status::Error);
    assert!(bad.message().unwrap().contains("expected an array"));
}

#[test]
fn test_duplicate_registration_rejected_consistently() {
    let registry = Arc::new(Registry::new());
    let dispatcher = Dispatcher::new(Arc::clone(&registry));

    dispatcher
        .register(|_p: Ping, _o: Origin| async { Ok::<_, String>("first") })
        .unwrap();

    for _ in 0..3 {
        let result =
            dispatcher.register(|_p: Ping, _o: Origin| async { Ok::<_, String>("second") });
        assert!(matches!(
            result,
            Err(ProtocolError::DuplicateRegistration(ref id)) if id == "ping"
        ));
    }

    let explicit = registry.register_with(
        "ping",
        |v: &Value| Ok(v.clone()),
        |_v: Value, _o: Origin| async { Ok::<_, String>(()) },
    );
    assert!(matches!(explicit, Err(ProtocolError::DuplicateRegistration(_))));
    assert_eq!(registry.type_ids(), vec!["ping".to_string()]);
}

#[test]
fn test_dispatcher_from_config_carries_the_wire_format() {
    let mut config = DispatchConfig::default();
    assert_eq!(
        Dispatcher::from_config(&config).registry().format(),
        SerializationFormat::Json
    );

    config.format = SerializationFormat::MessagePack;
    assert_eq!(
        Dispatcher::from_config(&config).registry().format(),
        SerializationFormat::MessagePack
    );
}

#[tokio::test]
async fn test_independent_dispatchers_do_not_share_handlers() {
    let first = Dispatcher::default();
    let second = Dispatcher::default();
    first
        .register(|_p: Ping, _o: Origin| async { Ok::<_, String>("first") })
        .unwrap();

    assert!(first.dispatch(ping_from("a")).await.is_success());
    assert_eq!(second.dispatch(ping_from("a")).await.status, Status::NoHandler);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatch_counts_every_envelope() {
    let dispatcher = Dispatcher::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    dispatcher
        .register(move |_p: Ping, _o: Origin| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(()) }
        })
        .unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..200 {
        let dispatcher = dispatcher.clone();
        tasks.spawn(async move { dispatcher.dispatch(ping_from("a")).await });
    }
    while let Some(result) = tasks.join_next().await {
        assert!(result.unwrap().is_success());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 200);
}
