//! HTTP/2 session: stream table, per-stream slot accounting, response
//! framing.
//!
//! Built on the `h2` crate — the same crate family `hyper`/`tonic` use, and
//! it exposes exactly the stream-level primitives (`SendResponse`,
//! `RecvStream`) this needs. One session per negotiated-h2 connection; each
//! stream independently acquires/releases a slot from the same worker-wide
//! [`SlotPool`] the HTTP/1.1 state machine uses.

use std::rc::Rc;

use bytes::Bytes;
use h2::server::SendResponse;
use h2::{Reason, RecvStream};
use http::{Request, Response};

use crate::connection::WorkerShared;
use crate::router::{self, RouteTag};
use crate::slots::{self, Tier};

/// Concurrent-stream ceiling per connection.
const MAX_CONCURRENT_STREAMS: u32 = 100;
/// Default flow-control window.
const INITIAL_WINDOW_SIZE: u32 = 1024 * 1024;

/// Drive one negotiated-HTTP/2 connection to completion: accept streams,
/// admit each under the shared slot pool, route, and respond. Runs as one
/// `tokio::task::spawn_local` per connection on the worker's current_thread
/// runtime.
pub async fn run<T>(io: T, shared: Rc<WorkerShared>)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + 'static,
{
    let mut builder = h2::server::Builder::new();
    builder
        .max_concurrent_streams(MAX_CONCURRENT_STREAMS)
        .initial_window_size(INITIAL_WINDOW_SIZE);

    // A handshake failure has no established session to send a GOAWAY
    // over (the preface/settings exchange that defines one never
    // completed), so only the post-handshake fatal path below sends one.
    let mut connection = match builder.handshake::<T, Bytes>(io).await {
        Ok(c) => c,
        Err(_) => {
            shared.counters.borrow_mut().errors_tls += 1;
            return;
        }
    };

    shared.active_connections.set(shared.active_connections.get() + 1);

    while let Some(result) = connection.accept().await {
        match result {
            Ok((request, respond)) => {
                let shared = Rc::clone(&shared);
                tokio::task::spawn_local(async move {
                    handle_stream(request, respond, shared).await;
                });
            }
            Err(_) => {
                connection.abrupt_shutdown(Reason::INTERNAL_ERROR);
                shared.counters.borrow_mut().goaway_sent += 1;
                break;
            }
        }
    }

    shared.active_connections.set(shared.active_connections.get().saturating_sub(1));
    shared.drain_notify.notify_one();
}

async fn handle_stream(request: Request<RecvStream>, mut respond: SendResponse<Bytes>, shared: Rc<WorkerShared>) {
    // First HEADERS: acquire a NORMAL slot; refuse the stream at the framing
    // layer if none is available.
    if !shared.slots.borrow_mut().acquire(Tier::Normal) {
        shared.counters.borrow_mut().connections_rejected_overload += 1;
        let _ = respond.send_reset(Reason::REFUSED_STREAM);
        shared.counters.borrow_mut().rst_stream_sent += 1;
        return;
    }
    shared.counters.borrow_mut().streams_opened += 1;
    shared.counters.borrow_mut().active_streams += 1;
    let mut tier = Tier::Normal;

    let path = request.uri().path().to_string();
    // The size of the request is known up front via :path length, so the
    // stream promotes directly to its target tier rather than growing
    // incrementally like the HTTP/1.1 connection does.
    let target = slots::classify(path.len(), shared.large_threshold, shared.huge_threshold);
    if target != tier {
        if shared.slots.borrow_mut().promote(tier, target) {
            tier = target;
        } else {
            shared.counters.borrow_mut().slot_promotion_failures += 1;
            let _ = respond.send_reset(Reason::REFUSED_STREAM);
            shared.counters.borrow_mut().rst_stream_sent += 1;
            release(&shared, tier);
            return;
        }
    }

    // `content-length` is recorded for metrics only; body bytes are not
    // stored, only counted as they arrive.
    let mut body_received: u64 = 0;
    let mut body = request.into_body();
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(bytes) => {
                body_received += bytes.len() as u64;
                let _ = body.flow_control().release_capacity(bytes.len());
            }
            Err(_) => {
                let _ = respond.send_reset(Reason::INTERNAL_ERROR);
                shared.counters.borrow_mut().rst_stream_sent += 1;
                release(&shared, tier);
                return;
            }
        }
    }
    let _ = body_received;

    let (status, payload, content_type) = route_http2(&path, &shared);
    let response = Response::builder()
        .status(status)
        .header("content-type", content_type)
        .header("content-length", payload.len().to_string())
        .body(())
        .expect("well-formed response head");

    shared.counters.borrow_mut().record_status(status.as_u16());

    match respond.send_response(response, false) {
        Ok(mut send_stream) => {
            let _ = send_stream.send_data(Bytes::from(payload), true);
        }
        Err(_) => {
            // The stream failed before a response could be sent at all —
            // no RST_STREAM frame goes out here, just a dropped stream.
        }
    }

    release(&shared, tier);
}

fn release(shared: &WorkerShared, tier: Tier) {
    shared.slots.borrow_mut().release(tier);
    shared.counters.borrow_mut().active_streams = shared.counters.borrow().active_streams.saturating_sub(1);
}

/// The HTTP/2 path exposes only `/health`, `/ready`, `/alive`, `/metrics`
/// with an ad hoc body — not `/version` or the other endpoints HTTP/1.1
/// serves.
fn route_http2(path: &str, shared: &WorkerShared) -> (http::StatusCode, Vec<u8>, &'static str) {
    match router::route(path.as_bytes()) {
        RouteTag::Health | RouteTag::Ready | RouteTag::Alive => (
            http::StatusCode::OK,
            shared.counters.borrow().render_health_json(true, shared.active_connections.get()).into_bytes(),
            "application/json",
        ),
        RouteTag::Metrics => (
            http::StatusCode::OK,
            shared.counters.borrow().render_prometheus_text(shared.active_connections.get()).into_bytes(),
            "text/plain",
        ),
        RouteTag::Result { .. } | RouteTag::Broadcast { .. } | RouteTag::Home | RouteTag::Docs
        | RouteTag::Status | RouteTag::Logos | RouteTag::AcmeChallenge { .. } => (
            http::StatusCode::NOT_FOUND,
            b"not supported over h2".to_vec(),
            "text/plain",
        ),
        RouteTag::Error => (http::StatusCode::NOT_FOUND, b"not found".to_vec(), "text/plain"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Counters;
    use std::cell::{Cell, RefCell};

    fn shared_for_tests() -> WorkerShared {
        WorkerShared {
            worker_id: 0,
            slots: RefCell::new(crate::slots::SlotPool::new(4, 4, 4)),
            ratelimiter: RefCell::new(crate::ratelimit::RateLimiter::new(0.0, None)),
            acl: RefCell::new(crate::acl::Acl::empty()),
            counters: RefCell::new(Counters::default()),
            statics: crate::static_files::StaticSet::empty(),
            rpc: RefCell::new(crate::rpc::RpcManager::new(&[]).unwrap()),
            max_buffer_size: 16 * 1024 * 1024,
            large_threshold: 8 * 1024,
            huge_threshold: 256 * 1024,
            acme_dir: None,
            draining: Cell::new(false),
            active_connections: Cell::new(0),
            request_counter: Cell::new(0),
            clock_start: std::time::Instant::now(),
            drain_notify: tokio::sync::Notify::new(),
        }
    }

    #[test]
    fn h2_route_serves_only_the_health_metrics_subset() {
        let shared = shared_for_tests();
        let (status, _, _) = route_http2("/health", &shared);
        assert_eq!(status, http::StatusCode::OK);
        let (status, _, _) = route_http2("/version", &shared);
        assert_eq!(status, http::StatusCode::NOT_FOUND);
    }
}
