//! Routing across a two-node fleet: unknown keys, redirect, forward,
//! multi-key aggregation and multiplexed websocket sessions

use fleetcoord::common::Metrics;
use fleetcoord::election::MemoryLockStore;
use fleetcoord::membership::{BroadcastQueue, NodeMetadata};
use fleetcoord::router::{OwnershipHandler, StaticResolver};
use fleetcoord::{CancelToken, Config, LockBackend, Node, RequestRouter, RoutingTable};
use futures_util::{SinkExt, StreamExt};
use reqwest::{redirect, Client, StatusCode};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn node_config(name: &str, cluster: &str) -> Config {
    let mut config = Config::default();
    config.node.name = name.into();
    config.node.cluster = cluster.into();
    config.node.http_addr = "127.0.0.1:0".parse().unwrap();
    config.node.port = 0;
    config.gossip.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.gossip.gossip_interval_ms = 20;
    config.gossip.probe_interval_ms = 200;
    config.election.lease_duration_ms = 1_000;
    config.election.renew_deadline_ms = 600;
    config.election.retry_period_ms = 100;
    config.router.first_frame_timeout_ms = 2_000;
    config.startup_timeout_secs = 5;
    config
}

struct Fleet {
    east: String,
    west: String,
    cancel: CancelToken,
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..150 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// East (the seed) owns `s-east`; west owns `s-west` and `s-west-2`.
async fn start_fleet() -> Fleet {
    let locks = LockBackend::Memory(MemoryLockStore::new());
    let cancel = CancelToken::new();

    let east = Node::start(node_config("gw-east", "east"), locks.clone(), &cancel)
        .await
        .unwrap();
    let west = Node::start(node_config("gw-west", "west"), locks, &cancel)
        .await
        .unwrap();

    let east_base = format!("http://{}", east.http_addr());
    let west_base = format!("http://{}", west.http_addr());
    let east_membership = east.membership().clone();
    let west_membership = west.membership().clone();

    tokio::spawn(east.serve(cancel.clone()));
    tokio::spawn(west.serve(cancel.clone()));

    // West learns the routes written on east through gossip
    let client = Client::new();
    for (key, value) in [("s-east", None), ("s-west", Some("west")), ("s-west-2", Some("west"))] {
        let mut query = vec![("key", key)];
        if let Some(value) = value {
            query.push(("value", value));
        }
        let resp = client
            .post(format!("{}/kv", east_base))
            .query(&query)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }
    assert!(eventually(|| west_membership.table().len() == 3).await);
    assert!(eventually(|| east_membership
        .resolve("sensor-gateway", "west")
        .is_ok())
    .await);

    Fleet {
        east: east_base,
        west: west_base,
        cancel,
    }
}

fn ws_url(base: &str) -> String {
    format!("{}/ws", base.replacen("http://", "ws://", 1))
}

/// Next text frame from the session, parsed as JSON.
async fn next_frame(socket: &mut ClientSocket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("session went quiet")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Base URL of a port nothing listens on.
fn closed_base() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Routing endpoints for an east node outside any fleet: `s-east` is served
/// here, `s-west` belongs to whatever `resolver` names for west.
async fn serve_standalone(resolver: StaticResolver, cancel: &CancelToken) -> String {
    let table = Arc::new(RoutingTable::new(Arc::new(BroadcastQueue::new(4))));
    table.add("s-east", "east");
    table.add("s-west", "west");
    let node = NodeMetadata {
        node_name: "gw-east".into(),
        service_name: "sensor-gateway".into(),
        private_ip: "127.0.0.1".into(),
        public_ip: String::new(),
        cluster_name: "east".into(),
        port: 0,
        capacity: 0,
    };
    let router = RequestRouter::new(
        &node,
        table,
        Arc::new(resolver),
        Arc::new(OwnershipHandler::new(&node)),
        &Config::default().router,
        Arc::new(Metrics::new()),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = fleetcoord::router::http::create_router(Arc::new(router));
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });
    format!("http://{}", addr)
}

/// A peer that accepts one websocket, reports its opening frame and hangs up.
async fn hang_up_peer() -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        if let Some(Ok(Message::Text(first))) = socket.next().await {
            let _ = seen_tx.send(first);
        }
        let _ = socket.close(None).await;
    });
    (format!("http://{}", addr), seen_rx)
}

#[tokio::test]
async fn test_admin_table_and_node_endpoints() {
    let fleet = start_fleet().await;
    let client = Client::new();

    let one: Value = client
        .get(format!("{}/kv", fleet.west))
        .query(&[("key", "s-east")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(one["value"], "east");

    let all: Value = client
        .get(format!("{}/kv", fleet.west))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.as_object().unwrap().len(), 3);

    let missing = client
        .get(format!("{}/kv", fleet.west))
        .query(&[("key", "nope")])
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let node: Value = client
        .get(format!("{}/node", fleet.east))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(node["is_leader"], true);
    assert_eq!(node["node"]["cluster_name"], "east");
    assert_eq!(node["members"].as_array().unwrap().len(), 2);

    let health = client
        .get(format!("{}/health", fleet.west))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let metrics = client
        .get(format!("{}/metrics", fleet.east))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("fleetcoord_routing_table_size 3"));
    assert!(metrics.contains("fleetcoord_is_leader 1"));
}

#[tokio::test]
async fn test_unknown_identifier_is_typed_ok() {
    let fleet = start_fleet().await;
    let resp = Client::new()
        .get(format!("{}/sensor", fleet.east))
        .query(&[("sensorid", "nobody-owns-this")])
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "unknown_identifier");
    assert_eq!(body["sensorid"], "nobody-owns-this");
}

#[tokio::test]
async fn test_single_key_local_forward_and_redirect() {
    let fleet = start_fleet().await;
    let client = Client::builder()
        .redirect(redirect::Policy::none())
        .build()
        .unwrap();

    let local: Value = client
        .get(format!("{}/sensor", fleet.east))
        .query(&[("sensorid", "s-east")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(local["node"], "gw-east");

    // External callers are proxied to the owner
    let forwarded = client
        .get(format!("{}/sensor", fleet.east))
        .query(&[("sensorid", "s-west")])
        .send()
        .await
        .unwrap();
    assert_eq!(forwarded.status(), StatusCode::OK);
    let forwarded: Value = forwarded.json().await.unwrap();
    assert_eq!(forwarded["node"], "gw-west");
    assert_eq!(forwarded["cluster"], "west");

    // In-fleet callers are sent to the owner directly
    let redirected = client
        .get(format!("{}/sensor", fleet.east))
        .query(&[("sensorid", "s-west")])
        .header("X-Fleet-Node", "gw-other")
        .send()
        .await
        .unwrap();
    assert_eq!(redirected.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = redirected.headers()["location"].to_str().unwrap();
    assert_eq!(location, format!("{}/sensor?sensorid=s-west", fleet.west));
}

#[tokio::test]
async fn test_aggregate_keeps_owner_order() {
    let fleet = start_fleet().await;
    let values: Vec<Value> = Client::new()
        .get(format!("{}/sensors", fleet.east))
        .query(&[("sensorids", "s-west,s-east,unknown,s-west-2")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let ids: Vec<&str> = values
        .iter()
        .map(|v| v["sensorid"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["s-west", "s-west-2", "s-east"]);
    assert_eq!(values[0]["cluster"], "west");
    assert_eq!(values[2]["cluster"], "east");
}

#[tokio::test]
async fn test_websocket_session_fans_out_per_owner() {
    let fleet = start_fleet().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url(&fleet.east))
        .await
        .unwrap();

    socket
        .send(Message::Text(r#"{"sensorids":["s-east","s-west"]}"#.into()))
        .await
        .unwrap();

    // Each leg greets with its keys and echoes its share of the opening frame
    let mut greeted = HashSet::new();
    let mut echoed = HashSet::new();
    while greeted.len() < 2 || echoed.len() < 2 {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("session went quiet")
            .unwrap()
            .unwrap();
        let Message::Text(text) = msg else { continue };
        let frame: Value = serde_json::from_str(&text).unwrap();
        let cluster = frame["cluster"].as_str().unwrap().to_string();
        if frame["data"].get("keys").is_some() {
            assert_eq!(frame["data"]["keys"][0], format!("s-{}", cluster));
            greeted.insert(cluster);
        } else {
            let echo = frame["data"]["echo"].as_str().unwrap();
            assert!(echo.contains(&format!("s-{}", cluster)));
            echoed.insert(cluster);
        }
    }
    assert_eq!(greeted, HashSet::from(["east".to_string(), "west".to_string()]));

    // Opaque frames reach every leg
    socket.send(Message::Text("hello".into())).await.unwrap();
    let mut replied = HashSet::new();
    while replied.len() < 2 {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("session went quiet")
            .unwrap()
            .unwrap();
        let Message::Text(text) = msg else { continue };
        let frame: Value = serde_json::from_str(&text).unwrap();
        if frame["data"]["echo"] == "hello" {
            replied.insert(frame["cluster"].as_str().unwrap().to_string());
        }
    }

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn test_aggregate_fails_when_one_owner_fails() {
    let cancel = CancelToken::new();
    let resolver = StaticResolver::new().with_peer("west", &closed_base());
    let base = serve_standalone(resolver, &cancel).await;

    let resp = Client::new()
        .get(format!("{}/sensors", base))
        .query(&[("sensorids", "s-east,s-west")])
        .send()
        .await
        .unwrap();
    // no partial array with only the local answers
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "upstream_error");

    cancel.cancel();
}

#[tokio::test]
async fn test_websocket_leg_failure_closes_session() {
    let cancel = CancelToken::new();
    let (peer, seen) = hang_up_peer().await;
    let base = serve_standalone(StaticResolver::new().with_peer("west", &peer), &cancel).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url(&base)).await.unwrap();
    socket
        .send(Message::Text(r#"{"sensorids":["s-east","s-west"]}"#.into()))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), seen)
        .await
        .unwrap()
        .unwrap();
    let first: Value = serde_json::from_str(&first).unwrap();
    assert_eq!(first["sensorids"], json!(["s-west"]));

    // the west leg hanging up ends the local leg and the client socket too
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = socket.next().await {
            if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "session outlived its failed leg");

    cancel.cancel();
}

#[tokio::test]
async fn test_websocket_later_key_set_is_repartitioned() {
    let fleet = start_fleet().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url(&fleet.east))
        .await
        .unwrap();

    socket
        .send(Message::Text(r#"{"sensorids":["s-east"]}"#.into()))
        .await
        .unwrap();
    // greeting and echo from the local leg only
    for _ in 0..2 {
        assert_eq!(next_frame(&mut socket).await["cluster"], "east");
    }

    // a later key set opens a west leg and each owner sees only its keys
    socket
        .send(Message::Text(r#"{"sensorids":"s-west,s-east","mode":"live"}"#.into()))
        .await
        .unwrap();
    let mut echoes = HashMap::new();
    while echoes.len() < 2 {
        let frame = next_frame(&mut socket).await;
        let Some(echo) = frame["data"]["echo"].as_str() else {
            continue;
        };
        let echo: Value = serde_json::from_str(echo).unwrap();
        echoes.insert(frame["cluster"].as_str().unwrap().to_string(), echo);
    }
    assert_eq!(echoes["east"]["sensorids"], "s-east");
    assert_eq!(echoes["west"]["sensorids"], "s-west");
    assert_eq!(echoes["west"]["mode"], "live");

    socket.close(None).await.unwrap();
}

#[tokio::test]
async fn test_websocket_redirects_in_fleet_callers() {
    let fleet = start_fleet().await;
    let client = Client::builder()
        .redirect(redirect::Policy::none())
        .build()
        .unwrap();

    let resp = client
        .get(format!("{}/ws", fleet.east))
        .query(&[("sensorid", "s-west")])
        .header("X-Fleet-Node", "gw-other")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = resp.headers()["location"].to_str().unwrap();
    assert_eq!(location, format!("{}/ws?sensorid=s-west", fleet.west));
}
