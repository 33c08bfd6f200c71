//! Websocket sessions
//!
//! A client session is split into legs, one per owner of the keys it asked
//! for. Remote legs are outbound websockets to a peer; the local leg is a
//! [`LocalSession`] handed to the local handler. Frames from every leg are
//! merged into the client stream in arrival order. Client frames naming a
//! key set are re-split per owner; any other frame goes to every leg as is.
//! One cancellation token covers the session: the client going away, or any
//! leg failing or closing, tears everything down.

use crate::common::{CancelToken, Error, Result, RouteKind};
use crate::router::proxy::fleet_headers;
use crate::router::{LocalHandler, OwnerGroup, RequestRouter, Target};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as PeerMessage;
use tracing::{debug, info, warn};

/// JSON fields in a client frame that carry a key set
pub const KEY_SET_FIELDS: [&str; 2] = ["sensorids", "collectorids"];

const LEG_BUFFER: usize = 64;

/// Send one frame to an upstream peer, giving up after `limit`.
async fn send_within<S>(sink: &mut S, msg: PeerMessage, limit: Duration) -> Result<()>
where
    S: Sink<PeerMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    tokio::time::timeout(limit, sink.send(msg))
        .await
        .map_err(|_| Error::Timeout(format!("upstream send after {:?}", limit)))??;
    Ok(())
}

/// A data frame, independent of which websocket library carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WsFrame {
    pub fn from_client(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(WsFrame::Text(text)),
            Message::Binary(data) => Some(WsFrame::Binary(data)),
            _ => None,
        }
    }

    pub fn into_client(self) -> Message {
        match self {
            WsFrame::Text(text) => Message::Text(text),
            WsFrame::Binary(data) => Message::Binary(data),
        }
    }

    pub fn from_peer(msg: PeerMessage) -> Option<Self> {
        match msg {
            PeerMessage::Text(text) => Some(WsFrame::Text(text)),
            PeerMessage::Binary(data) => Some(WsFrame::Binary(data)),
            _ => None,
        }
    }

    pub fn into_peer(self) -> PeerMessage {
        match self {
            WsFrame::Text(text) => PeerMessage::Text(text),
            WsFrame::Binary(data) => PeerMessage::Binary(data),
        }
    }
}

/// A streaming session served by the local handler.
pub struct LocalSession {
    /// Keys this leg is responsible for (empty when the client named none)
    pub keys: Vec<String>,
    /// The client's opening frame, if it was routed here
    pub first_frame: Option<WsFrame>,
    /// Later client frames for this leg
    pub incoming: mpsc::Receiver<WsFrame>,
    /// Frames for the client
    pub outgoing: mpsc::Sender<WsFrame>,
    /// Fires when the session ends
    pub cancel: CancelToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyForm {
    Array,
    Csv,
}

/// The key set found in a client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    field: &'static str,
    form: KeyForm,
    pub keys: Vec<String>,
    body: serde_json::Map<String, Value>,
}

impl KeySet {
    /// Find `sensorids` / `collectorids` in a JSON object frame. Accepts a
    /// string array or a comma separated string.
    pub fn parse(text: &str) -> Option<Self> {
        let Ok(Value::Object(body)) = serde_json::from_str::<Value>(text) else {
            return None;
        };
        for field in KEY_SET_FIELDS {
            let (form, keys) = match body.get(field) {
                Some(Value::Array(items)) => (
                    KeyForm::Array,
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                ),
                Some(Value::String(csv)) => (KeyForm::Csv, crate::common::parse_key_list(csv)),
                _ => continue,
            };
            return Some(Self {
                field,
                form,
                keys,
                body,
            });
        }
        None
    }

    /// The same frame naming only `keys`.
    pub fn rewrite(&self, keys: &[String]) -> String {
        let mut body = self.body.clone();
        let value = match self.form {
            KeyForm::Array => Value::from(keys.to_vec()),
            KeyForm::Csv => Value::from(keys.join(",")),
        };
        body.insert(self.field.to_string(), value);
        Value::Object(body).to_string()
    }
}

/// Serve a socket entirely from the local handler.
pub async fn serve_local(
    router: Arc<RequestRouter>,
    socket: WebSocket,
    keys: Vec<String>,
    first_frame: Option<WsFrame>,
) {
    let handler = router.local_handler().clone();
    let group = router.local_group(keys);
    run_session(router, socket, handler, vec![(group, first_frame)], None).await;
}

/// Serve a socket for keys the routing table does not know: the fallback
/// handler takes it when configured, otherwise the client gets a typed
/// unknown-identifier frame and the socket is closed.
pub async fn serve_unknown(router: Arc<RequestRouter>, mut socket: WebSocket, key: String) {
    let Some(fallback) = router.fallback().cloned() else {
        let body = serde_json::json!({ "status": "unknown_identifier", "sensorid": key });
        let _ = socket.send(Message::Text(body.to_string())).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let group = router.local_group(vec![key]);
    run_session(router, socket, fallback, vec![(group, None)], None).await;
}

/// Bridge a socket to the single remote owner of a key.
pub async fn serve_bridge(router: Arc<RequestRouter>, socket: WebSocket, group: OwnerGroup) {
    let handler = router.local_handler().clone();
    run_session(router, socket, handler, vec![(group, None)], None).await;
}

/// `None` when the client went away before sending anything.
async fn read_first_frame(
    router: &RequestRouter,
    socket: &mut WebSocket,
) -> Option<Option<WsFrame>> {
    match tokio::time::timeout(router.config().first_frame_timeout(), socket.recv()).await {
        Err(_) => {
            debug!("no opening frame before timeout");
            let _ = socket.send(Message::Close(None)).await;
            None
        }
        Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => None,
        Ok(Some(Ok(msg))) => Some(WsFrame::from_client(msg)),
    }
}

/// Read the opening frame, then serve the session locally or split it per
/// owner of the key set it names. A hop-marked session is already routed:
/// its key set is served here whatever the table says.
pub async fn serve_inspected(router: Arc<RequestRouter>, mut socket: WebSocket, hop: bool) {
    let Some(first) = read_first_frame(&router, &mut socket).await else {
        return;
    };

    let key_set = match &first {
        Some(WsFrame::Text(text)) => KeySet::parse(text),
        _ => None,
    };
    let key_set = match key_set {
        Some(key_set) if !hop => key_set,
        other => {
            let keys = other.map(|set| set.keys).unwrap_or_default();
            router.record(RouteKind::Local);
            serve_local(router, socket, keys, first).await;
            return;
        }
    };

    let partition = match router.partition(&key_set.keys) {
        Ok(partition) => partition,
        Err(e) => {
            router.record(RouteKind::Unavailable);
            close_with_error(socket, &e).await;
            return;
        }
    };
    if !partition.unknown.is_empty() {
        debug!(unknown = partition.unknown.len(), "ignoring unowned stream keys");
    }
    if partition.owners.is_empty() {
        router.record(RouteKind::Unknown);
        serve_local(router, socket, Vec::new(), first).await;
        return;
    }

    router.record(if partition.owners.len() > 1 {
        RouteKind::Aggregate
    } else if partition.owners[0].target == Target::Local {
        RouteKind::Local
    } else {
        RouteKind::Forward
    });
    let legs = partition
        .owners
        .into_iter()
        .map(|group| {
            let frame = WsFrame::Text(key_set.rewrite(&group.keys));
            (group, Some(frame))
        })
        .collect();
    let handler = router.local_handler().clone();
    run_session(router, socket, handler, legs, Some(key_set)).await;
}

async fn close_with_error(mut socket: WebSocket, error: &Error) {
    let body = serde_json::json!({ "status": "error", "error": error.to_string() });
    let _ = socket.send(Message::Text(body.to_string())).await;
    let _ = socket.send(Message::Close(None)).await;
}

struct Mux {
    router: Arc<RequestRouter>,
    handler: Arc<dyn LocalHandler>,
    cancel: CancelToken,
    to_client: mpsc::Sender<WsFrame>,
    legs: HashMap<String, mpsc::Sender<WsFrame>>,
}

async fn run_session(
    router: Arc<RequestRouter>,
    socket: WebSocket,
    handler: Arc<dyn LocalHandler>,
    initial: Vec<(OwnerGroup, Option<WsFrame>)>,
    key_set: Option<KeySet>,
) {
    router.metrics().record_ws_session();
    let cancel = CancelToken::new();
    let (mut client_tx, mut client_rx) = socket.split();
    let (to_client, mut from_legs) = mpsc::channel::<WsFrame>(LEG_BUFFER);

    let writer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = from_legs.recv() => match frame {
                        Some(frame) => {
                            if client_tx.send(frame.into_client()).await.is_err() {
                                cancel.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = client_tx.send(Message::Close(None)).await;
            let _ = client_tx.close().await;
        })
    };

    let mut mux = Mux {
        router,
        handler,
        cancel: cancel.clone(),
        to_client,
        legs: HashMap::new(),
    };
    for (group, first) in initial {
        if let Err(e) = mux.open_leg(group, first).await {
            warn!("failed to open session leg: {}", e);
            cancel.cancel();
            break;
        }
    }

    while !cancel.is_cancelled() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = client_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("client socket error: {}", e);
                    break;
                }
                Some(Ok(msg)) => {
                    if let Some(frame) = WsFrame::from_client(msg) {
                        if let Err(e) = mux.fan_out(frame, key_set.as_ref()).await {
                            warn!("failed to route client frame: {}", e);
                            break;
                        }
                    }
                }
            },
        }
    }

    cancel.cancel();
    drop(mux);
    let _ = writer.await;
    debug!("websocket session closed");
}

impl Mux {
    async fn fan_out(&mut self, frame: WsFrame, template: Option<&KeySet>) -> Result<()> {
        let key_set = match (&frame, template) {
            (WsFrame::Text(text), Some(_)) => KeySet::parse(text),
            _ => None,
        };
        let Some(key_set) = key_set else {
            for leg in self.legs.values() {
                // a closed leg has already cancelled the session
                let _ = leg.send(frame.clone()).await;
            }
            return Ok(());
        };

        let partition = self.router.partition(&key_set.keys)?;
        for group in partition.owners {
            let rewritten = WsFrame::Text(key_set.rewrite(&group.keys));
            match self.legs.get(&group.cluster) {
                Some(leg) => {
                    let _ = leg.send(rewritten).await;
                }
                None => self.open_leg(group, Some(rewritten)).await?,
            }
        }
        Ok(())
    }

    async fn open_leg(&mut self, group: OwnerGroup, first: Option<WsFrame>) -> Result<()> {
        let (leg_tx, leg_rx) = mpsc::channel(LEG_BUFFER);
        let cluster = group.cluster.clone();
        match group.target.ws_base() {
            None => self.spawn_local(group.keys, first, leg_rx),
            Some(base) => {
                let url = match group.keys.as_slice() {
                    [key] if first.is_none() => format!("{}/ws?sensorid={}", base, key),
                    _ => format!("{}/ws", base),
                };
                self.spawn_remote(&url, first, leg_rx).await?;
            }
        }
        self.legs.insert(cluster, leg_tx);
        Ok(())
    }

    fn spawn_local(
        &self,
        keys: Vec<String>,
        first_frame: Option<WsFrame>,
        incoming: mpsc::Receiver<WsFrame>,
    ) {
        let session = LocalSession {
            keys,
            first_frame,
            incoming,
            outgoing: self.to_client.clone(),
            cancel: self.cancel.clone(),
        };
        let handler = self.handler.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.stream(session).await {
                warn!("local stream failed: {}", e);
            }
            cancel.cancel();
        });
    }

    async fn spawn_remote(
        &self,
        url: &str,
        first: Option<WsFrame>,
        mut outgoing: mpsc::Receiver<WsFrame>,
    ) -> Result<()> {
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .extend(fleet_headers(&self.router, None));
        let (stream, _) = tokio::time::timeout(
            self.router.config().connect_timeout(),
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| Error::ConnectionFailed(format!("{}: connect timed out", url)))??;
        info!(%url, "opened upstream stream");

        let (mut sink, mut source) = stream.split();
        let send_timeout = self.router.config().request_timeout();
        if let Some(frame) = first {
            send_within(&mut sink, frame.into_peer(), send_timeout).await?;
        }

        let cancel = self.cancel.clone();
        let to_client = self.to_client.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let close = PeerMessage::Close(None);
                        let _ = send_within(&mut sink, close, send_timeout).await;
                        break;
                    }
                    frame = outgoing.recv() => match frame {
                        Some(frame) => {
                            let sent = send_within(&mut sink, frame.into_peer(), send_timeout).await;
                            if let Err(e) = sent {
                                debug!(%url, "upstream send failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    msg = source.next() => match msg {
                        Some(Ok(PeerMessage::Close(_))) | None => break,
                        Some(Ok(msg)) => {
                            if let Some(frame) = WsFrame::from_peer(msg) {
                                if to_client.send(frame).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            debug!(%url, "upstream stream failed: {}", e);
                            break;
                        }
                    },
                }
            }
            cancel.cancel();
        });
        Ok(())
    }
}
