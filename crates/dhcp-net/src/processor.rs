use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use dhcp_core::model::{LeaseBatch, Response};
use dhcp_core::reconcile::ObjectCache;
use dhcp_core::Server;
use dhcproto::v4::MessageType;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{NetError, NetResult};
use crate::socket::Socket;

const REQUEST_CHAN_BUF_SIZE: usize = 1024;
const RESPONSE_CHAN_BUF_SIZE: usize = 1024;

/// One listener: owns a socket, a bounded request channel feeding a
/// single worker, and a batcher that groups worker output before
/// persisting and sending it. Exact control flow ported from
/// `original_source/dhcp/request_processor.go`.
pub struct RequestProcessor {
    request_tx: mpsc::Sender<dhcp_core::model::Request>,
    shutdown: watch::Sender<bool>,
}

impl RequestProcessor {
    /// Spawn the reader, worker and batcher tasks for one listener.
    /// `on_batch` is called with every batch of responses the batcher
    /// flushes, before replies are sent — the save-then-send ordering
    /// `original_source/dhcp/request_processor.go::runResponseProcessor`
    /// enforces so a crash between save and send never loses a lease.
    pub fn spawn<S, F>(
        name: String,
        socket: Arc<S>,
        server: Arc<Server>,
        cache: Arc<ObjectCache>,
        on_batch: F,
    ) -> RequestProcessor
    where
        S: Socket + 'static,
        F: Fn(&LeaseBatch) -> NetResult<()> + Send + Sync + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHAN_BUF_SIZE);
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_CHAN_BUF_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(reader_task(name.clone(), socket.clone(), request_tx.clone(), shutdown_rx.clone()));
        tokio::spawn(worker_task(name.clone(), server, request_rx, response_tx, shutdown_rx.clone()));
        tokio::spawn(batcher_task(name, socket, response_rx, Arc::new(on_batch), cache, shutdown_rx));

        RequestProcessor {
            request_tx,
            shutdown: shutdown_tx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    #[cfg(test)]
    pub async fn feed(&self, req: dhcp_core::model::Request) {
        let _ = self.request_tx.send(req).await;
    }
}

async fn reader_task<S: Socket + 'static>(
    name: String,
    socket: Arc<S>,
    request_tx: mpsc::Sender<dhcp_core::model::Request>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!(listener = %name, "reader stopping");
                return;
            }
            result = socket.next_request() => {
                match result {
                    Ok(req) => {
                        if request_tx.send(req).await.is_err() {
                            return;
                        }
                    }
                    Err(NetError::SocketTransient(e)) => {
                        warn!(listener = %name, error = %e, "transient read error, continuing");
                    }
                    Err(NetError::SocketClosed) => {
                        info!(listener = %name, "socket closed, reader exiting");
                        return;
                    }
                    Err(e) => {
                        error!(listener = %name, error = %e, "permanent socket error, terminating processor");
                        return;
                    }
                }
            }
        }
    }
}

async fn worker_task(
    name: String,
    server: Arc<Server>,
    mut request_rx: mpsc::Receiver<dhcp_core::model::Request>,
    response_tx: mpsc::Sender<Response>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let req = tokio::select! {
            _ = shutdown_rx.changed() => {
                info!(listener = %name, "worker stopping");
                return;
            }
            req = request_rx.recv() => match req {
                Some(req) => req,
                None => {
                    info!(listener = %name, "worker exiting, no more requests");
                    return;
                }
            },
        };

        match server.get_response(req, Utc::now()) {
            Ok(resp) => match resp.message.opts().msg_type() {
                Some(MessageType::Offer) | Some(MessageType::Ack) => {
                    if response_tx.send(resp).await.is_err() {
                        return;
                    }
                }
                other => {
                    debug!(listener = %name, ?other, "dropping non-reply response");
                }
            },
            Err(e) => {
                debug!(listener = %name, error = %e, "failed to build response");
            }
        }
    }
}

/// Non-blocking drain of whatever is already queued; once the queue
/// empties, save and send the accumulated batch, then block for the
/// next single response. This preserves the original's "don't block
/// mid-burst, but never busy-spin when idle" behavior exactly.
async fn batcher_task<S, F>(
    name: String,
    socket: Arc<S>,
    mut response_rx: mpsc::Receiver<Response>,
    on_batch: Arc<F>,
    cache: Arc<ObjectCache>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: Socket + 'static,
    F: Fn(&LeaseBatch) -> NetResult<()> + Send + Sync + 'static,
{
    let mut pending: Vec<Response> = Vec::new();
    loop {
        match response_rx.try_recv() {
            Ok(resp) => {
                pending.push(resp);
                continue;
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => {
                flush(&name, &socket, &on_batch, &cache, std::mem::take(&mut pending)).await;
                return;
            }
        }

        if !pending.is_empty() {
            flush(&name, &socket, &on_batch, &cache, std::mem::take(&mut pending)).await;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                flush(&name, &socket, &on_batch, &cache, std::mem::take(&mut pending)).await;
                info!(listener = %name, "batcher stopping");
                return;
            }
            next = response_rx.recv() => match next {
                Some(resp) => pending.push(resp),
                None => return,
            },
        }
    }
}

/// Save then send, in that order, so a crash between the two never loses
/// a lease. Within the batch, OFFER responses for MACs the cache already
/// knows a lease for are skipped at the persistence step (still sent) —
/// this avoids re-persisting duplicate OFFERs on client retransmits.
/// ACKs are always persisted. If persistence fails, the whole batch's
/// replies are dropped; the client's retransmit will retry the batch.
async fn flush<S, F>(
    name: &str,
    socket: &Arc<S>,
    on_batch: &Arc<F>,
    cache: &Arc<ObjectCache>,
    responses: Vec<Response>,
) where
    S: Socket + 'static,
    F: Fn(&LeaseBatch) -> NetResult<()> + Send + Sync + 'static,
{
    if responses.is_empty() {
        return;
    }
    debug!(listener = %name, count = responses.len(), "flushing response batch");

    let to_persist: Vec<Response> = responses
        .iter()
        .filter(|resp| {
            let is_duplicate_offer = resp.message.opts().msg_type() == Some(MessageType::Offer)
                && cache.has_mac(&resp.lease.mac);
            !is_duplicate_offer
        })
        .cloned()
        .collect();

    if !to_persist.is_empty() {
        let batch = LeaseBatch {
            name: format!("{name}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
            created_at: Utc::now(),
            leases: to_persist.iter().map(|r| r.lease.clone()).collect(),
        };
        if let Err(e) = on_batch(&batch) {
            error!(listener = %name, error = %e, "failed to persist batch, dropping replies");
            return;
        }
        for lease in &batch.leases {
            cache.add_mac(&lease.mac);
        }
    }

    for resp in responses {
        let send_result = if resp.request.gateway().is_unspecified() {
            socket
                .send_broadcast(&resp.request.interface_name, resp.lease.ip, &resp.message)
                .await
        } else {
            socket
                .send_unicast(resp.request.src, resp.request.gateway(), &resp.message)
                .await
        };
        if let Err(e) = send_result {
            error!(listener = %name, error = %e, "failed to send response");
        }
    }
}
