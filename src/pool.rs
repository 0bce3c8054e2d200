//! Serializer worker pool
//!
//! The pool decouples RPC-call concurrency from upstream concurrency: N
//! workers, each owning one private [`UpstreamLink`], pull work items off a
//! shared FIFO queue. A worker handles one item at a time, so upstream
//! fan-out is bounded at exactly N in-flight queries no matter how many RPC
//! calls are waiting.
//!
//! Correlation is carried by the work item itself: every call gets a fresh
//! oneshot reply slot, written exactly once by whichever worker dequeued the
//! item. Slots are never reused across calls - a shared slot would let one
//! call observe another call's response.

use crate::dns;
use crate::upstream::UpstreamLink;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup did not succeed")]
    Failed,

    #[error("worker pool is shut down")]
    PoolClosed,
}

/// One queued lookup: the raw query bytes plus its single-use reply slot.
///
/// `reply` carries the response bytes on success or `None` on any failure.
/// Exactly one producer (the worker that dequeued the item) and one consumer
/// (the call that enqueued it).
struct WorkItem {
    payload: Vec<u8>,
    reply: oneshot::Sender<Option<Vec<u8>>>,
}

type WorkQueue = Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>;

/// Fixed-size pool of serializer workers.
///
/// Cheap to clone; all clones feed the same queue. Workers run until every
/// handle is dropped, which closes the queue.
#[derive(Clone)]
pub struct SerializerPool {
    queue: mpsc::UnboundedSender<WorkItem>,
}

impl SerializerPool {
    /// Spawn `size` workers, each dialing `upstream` lazily on first use.
    ///
    /// `timeout` bounds each worker's upstream read; pass `None` to block
    /// indefinitely (not recommended outside tests - a hung upstream then
    /// removes that worker from the pool until it answers).
    pub fn spawn(size: usize, upstream: SocketAddr, timeout: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue: WorkQueue = Arc::new(Mutex::new(rx));

        for id in 0..size {
            let link = UpstreamLink::new(upstream, timeout);
            tokio::spawn(worker(id, Arc::clone(&queue), link));
        }
        info!("serializer pool ready: {} workers -> {}", size, upstream);

        Self { queue: tx }
    }

    /// Resolve one query through the pool.
    ///
    /// Enqueues the payload (never blocks - the queue is unbounded) and
    /// waits for the correlated outcome. Under sustained overload items
    /// queue in FIFO order and latency grows; there is no other
    /// backpressure signal.
    pub async fn lookup(&self, payload: Vec<u8>) -> Result<Vec<u8>, LookupError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .send(WorkItem {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| LookupError::PoolClosed)?;

        match reply_rx.await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(LookupError::Failed),
            // Worker dropped the slot without writing - only happens on
            // worker panic, surfaced as a plain failure
            Err(_) => Err(LookupError::Failed),
        }
    }
}

/// Worker loop: dequeue, resolve, deliver, repeat.
///
/// Dequeue is the only point where workers contend; the lock is released
/// before the upstream exchange, so a stalled query on one worker never
/// delays the others.
async fn worker(id: usize, queue: WorkQueue, mut link: UpstreamLink) {
    debug!("worker {} ready", id);

    loop {
        let item = {
            let mut rx = queue.lock().await;
            match rx.recv().await {
                Some(item) => item,
                None => break, // all pool handles dropped
            }
        };

        let outcome = match dns::query_names(&item.payload) {
            Err(e) => {
                // Malformed query bytes never reach the link
                warn!("worker {}: invalid DNS packet: {}", id, e);
                None
            }
            Ok(names) => {
                debug!("worker {} querying: {}", id, names);
                match link.query(&item.payload).await {
                    Ok(response) => Some(response),
                    Err(e) => {
                        warn!("worker {}: {}", id, e);
                        None
                    }
                }
            }
        };

        if item.reply.send(outcome).is_err() {
            // Caller went away before the outcome arrived; nothing to do
            debug!("worker {}: reply receiver dropped", id);
        }
    }

    debug!("worker {} stopped", id);
}
