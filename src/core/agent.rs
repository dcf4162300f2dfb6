// src/core/agent.rs

//! The agent subsystem: outbound RPCs to worker daemons with retry.
//!
//! Handlers never talk to workers directly; they enqueue a request here and
//! the background loop drains the queue each iteration. Deliveries that
//! fail are retried with exponential back-off up to `MAX_AGENT_RETRIES`;
//! a permanently failed target is handed back to the caller, which drains
//! the node. The queue has its own mutex and is independent of the
//! four-entity lock manager.

use crate::core::ControllerError;
use crate::core::protocol::message::{Body, Message};
use crate::core::protocol::MessageCodec;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Retries before a target is declared unreachable.
pub const MAX_AGENT_RETRIES: u32 = 10;

/// Base back-off in seconds; doubles per attempt, capped at two minutes.
const BACKOFF_BASE_SECS: i64 = 2;
const BACKOFF_CAP_SECS: i64 = 120;

/// Queue depth guard; past this the cluster has bigger problems and the
/// oldest entries are shed.
const MAX_QUEUE_DEPTH: usize = 4096;

/// One queued outbound RPC.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub node_name: String,
    /// `host:port` of the worker daemon.
    pub addr: String,
    pub body: Body,
    pub attempts: u32,
    /// Epoch seconds before which this entry stays queued.
    pub next_try: i64,
}

impl AgentRequest {
    pub fn new(node_name: String, addr: String, body: Body) -> Self {
        Self {
            node_name,
            addr,
            body,
            attempts: 0,
            next_try: 0,
        }
    }
}

/// The thread-safe retry queue.
#[derive(Debug, Default)]
pub struct AgentQueue {
    inner: Mutex<VecDeque<AgentRequest>>,
}

impl AgentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Adds a request, shedding the oldest entry if the queue is saturated.
    pub fn enqueue(&self, req: AgentRequest) {
        let mut q = self.inner.lock();
        if q.len() >= MAX_QUEUE_DEPTH {
            if let Some(dropped) = q.pop_front() {
                warn!(
                    node = %dropped.node_name,
                    "agent queue saturated; shedding oldest request"
                );
            }
        }
        q.push_back(req);
    }

    /// Removes and returns every request whose retry time has arrived.
    pub fn take_due(&self, now: i64) -> Vec<AgentRequest> {
        let mut q = self.inner.lock();
        let mut due = Vec::new();
        let mut keep = VecDeque::with_capacity(q.len());
        while let Some(req) = q.pop_front() {
            if req.next_try <= now {
                due.push(req);
            } else {
                keep.push_back(req);
            }
        }
        *q = keep;
        due
    }

    /// Requeues a failed delivery with back-off. Returns the request back
    /// to the caller when the retry budget is exhausted.
    pub fn retry_later(&self, mut req: AgentRequest, now: i64) -> Option<AgentRequest> {
        req.attempts += 1;
        if req.attempts >= MAX_AGENT_RETRIES {
            warn!(
                node = %req.node_name,
                attempts = req.attempts,
                "agent giving up on worker"
            );
            return Some(req);
        }
        // Jittered exponential back-off so a rebooting rack does not get
        // re-contacted in lockstep.
        let backoff = (BACKOFF_BASE_SECS << req.attempts.min(16)).min(BACKOFF_CAP_SECS);
        let jitter = rand::random::<u64>() % (backoff.max(1) as u64);
        req.next_try = now + backoff + jitter as i64 / 2;
        debug!(
            node = %req.node_name,
            attempts = req.attempts,
            backoff_secs = backoff,
            "agent delivery failed; will retry"
        );
        self.inner.lock().push_back(req);
        None
    }
}

/// Delivers one message to a worker daemon and awaits its return code.
/// The whole exchange is bounded by `timeout`.
pub async fn deliver(
    addr: &str,
    body: Body,
    auth_cred: Bytes,
    timeout: Duration,
) -> Result<u32, ControllerError> {
    let exchange = async {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, MessageCodec);
        let mut msg = Message::new(body);
        msg.header.auth_cred = auth_cred;
        framed.send(msg).await?;
        match framed.next().await {
            Some(Ok(reply)) => match reply.body {
                Body::ReturnCode(rc) => Ok(rc.rc),
                other => Err(ControllerError::Protocol(format!(
                    "unexpected reply type {}",
                    other.msg_type()
                ))),
            },
            Some(Err(e)) => Err(e),
            None => Err(ControllerError::Protocol(
                "connection closed before reply".to_string(),
            )),
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ControllerError::Protocol(format!("rpc to {addr} timed out")))?
}
