//! Default local service: reports which node and cluster answered

use crate::common::Result;
use crate::membership::NodeMetadata;
use crate::router::ws::{LocalSession, WsFrame};
use crate::router::LocalHandler;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

/// Answers every key with the identity of the serving node. Streaming
/// sessions get a greeting naming their keys, then every client frame is
/// echoed back wrapped with the same identity.
#[derive(Debug, Clone)]
pub struct OwnershipHandler {
    node: String,
    cluster: String,
}

impl OwnershipHandler {
    pub fn new(local: &NodeMetadata) -> Self {
        Self {
            node: local.node_name.clone(),
            cluster: local.cluster_name.clone(),
        }
    }

    fn stamp(&self, value: Value) -> String {
        json!({
            "node": self.node,
            "cluster": self.cluster,
            "data": value,
        })
        .to_string()
    }
}

#[async_trait]
impl LocalHandler for OwnershipHandler {
    async fn lookup(&self, keys: &[String]) -> Result<Vec<Value>> {
        Ok(keys
            .iter()
            .map(|key| {
                json!({
                    "sensorid": key,
                    "node": self.node,
                    "cluster": self.cluster,
                })
            })
            .collect())
    }

    async fn stream(&self, mut session: LocalSession) -> Result<()> {
        let greeting = self.stamp(json!({ "keys": session.keys }));
        if session.outgoing.send(WsFrame::Text(greeting)).await.is_err() {
            return Ok(());
        }
        if let Some(WsFrame::Text(first)) = session.first_frame.take() {
            let echo = self.stamp(json!({ "echo": first }));
            if session.outgoing.send(WsFrame::Text(echo)).await.is_err() {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                frame = session.incoming.recv() => {
                    let reply = match frame {
                        Some(WsFrame::Text(text)) => WsFrame::Text(self.stamp(json!({ "echo": text }))),
                        Some(binary) => binary,
                        None => break,
                    };
                    if session.outgoing.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(node = %self.node, "local stream closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CancelToken;
    use tokio::sync::mpsc;

    fn handler() -> OwnershipHandler {
        OwnershipHandler {
            node: "gw-1".into(),
            cluster: "east".into(),
        }
    }

    #[tokio::test]
    async fn test_lookup_reports_owner() {
        let values = handler()
            .lookup(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["sensorid"], "b");
        assert_eq!(values[1]["cluster"], "east");
    }

    #[tokio::test]
    async fn test_stream_greets_and_echoes() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let cancel = CancelToken::new();
        let session = LocalSession {
            keys: vec!["a".into()],
            first_frame: None,
            incoming: in_rx,
            outgoing: out_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(async move { handler().stream(session).await });

        let WsFrame::Text(greeting) = out_rx.recv().await.unwrap() else {
            panic!("expected text greeting");
        };
        let greeting: Value = serde_json::from_str(&greeting).unwrap();
        assert_eq!(greeting["data"]["keys"][0], "a");

        in_tx.send(WsFrame::Text("ping".into())).await.unwrap();
        let WsFrame::Text(echo) = out_rx.recv().await.unwrap() else {
            panic!("expected text echo");
        };
        assert!(echo.contains("ping"));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
