//! Multi-key fan-out: one sub-request per owner, merged in owner order

use crate::common::{Error, Result, RouteKind};
use crate::router::proxy::fleet_headers;
use crate::router::{RequestRouter, Target};
use futures_util::future::{try_join_all, BoxFuture, FutureExt};
use serde_json::Value;
use tracing::{debug, warn};

fn upstream_error(peer: &str, reason: impl ToString) -> Error {
    Error::Upstream {
        peer: peer.to_string(),
        reason: reason.to_string(),
    }
}

/// Ask the peer at `base` for `keys`. The call is hop-marked so the peer
/// answers from its own handler whatever its routing view says.
async fn fetch_remote(
    router: &RequestRouter,
    base: &str,
    keys: &[String],
    request_id: Option<&str>,
) -> Result<Vec<Value>> {
    let url = format!("{}/sensors", base.trim_end_matches('/'));
    let response = router
        .client()
        .get(&url)
        .headers(fleet_headers(router, request_id))
        .query(&[("sensorids", keys.join(","))])
        .send()
        .await
        .map_err(|e| upstream_error(base, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(upstream_error(base, format!("status {}", status)));
    }
    response
        .json::<Vec<Value>>()
        .await
        .map_err(|e| upstream_error(base, e))
}

/// Results for `keys` gathered from every owner. Per-owner results keep the
/// order owners first appear in `keys`; keys nobody owns are answered by the
/// fallback handler (appended last) or left out. Any failed sub-request
/// fails the whole aggregate.
pub async fn aggregate(
    router: &RequestRouter,
    keys: &[String],
    request_id: Option<&str>,
) -> Result<Vec<Value>> {
    let partition = match router.partition(keys) {
        Ok(partition) => partition,
        Err(e) => {
            router.record(RouteKind::Unavailable);
            return Err(e);
        }
    };
    router.record(RouteKind::Aggregate);

    let mut calls: Vec<BoxFuture<'_, Result<Vec<Value>>>> = Vec::new();
    for group in &partition.owners {
        debug!(cluster = %group.cluster, keys = group.keys.len(), "aggregate leg");
        let call = match &group.target {
            Target::Local => router.local_handler().lookup(&group.keys),
            Target::Remote(base) => fetch_remote(router, base, &group.keys, request_id).boxed(),
        };
        calls.push(call);
    }
    if !partition.unknown.is_empty() {
        match router.fallback() {
            Some(fallback) => calls.push(fallback.lookup(&partition.unknown)),
            None => debug!(unknown = partition.unknown.len(), "skipping unowned keys"),
        }
    }

    match try_join_all(calls).await {
        Ok(parts) => Ok(parts.into_iter().flatten().collect()),
        Err(e) => {
            warn!("aggregate failed: {}", e);
            router.metrics().record_aggregate_failure();
            Err(e)
        }
    }
}
