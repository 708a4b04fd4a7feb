use crate::error::{ConnectorError, ConnectorResult};
use crate::token::CancellationToken;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// One in-flight request/ack waiter. The connection handles exactly one
/// client message at a time and answers in the order it received them
/// (`session.rs` on the server reads, fully handles, and replies to one
/// frame before reading the next), so replies never need a correlation id
/// of their own — the next reply frame always belongs to the oldest
/// outstanding request. `cancel` just nulls out a slot; its reply, once it
/// arrives, is silently dropped instead of delivered.
struct Waiter {
    token: CancellationToken,
    reply: Option<oneshot::Sender<ConnectorResult<sync_protocol::Message>>>,
}

#[derive(Default)]
pub struct PendingQueue {
    queue: VecDeque<Waiter>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    pub fn push(&mut self, token: CancellationToken, reply: oneshot::Sender<ConnectorResult<sync_protocol::Message>>) {
        self.queue.push_back(Waiter { token, reply: Some(reply) });
    }

    /// Drop interest in `token`'s reply: resolves it immediately with
    /// `Cancelled` and marks its queue slot so the eventual wire reply (the
    /// server still sends one) is dropped instead of delivered twice.
    /// Returns whether a matching waiter was found.
    pub fn cancel(&mut self, token: CancellationToken) -> bool {
        for waiter in &mut self.queue {
            if waiter.token == token {
                if let Some(reply) = waiter.reply.take() {
                    let _ = reply.send(Err(ConnectorError::Cancelled));
                }
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Resolve the oldest outstanding request with `result`, if any is
    /// waiting. Returns `false` if the queue was empty (an unsolicited
    /// reply-shaped frame with nothing pending for it — logged and dropped
    /// by the caller).
    pub fn resolve_front(&mut self, result: ConnectorResult<sync_protocol::Message>) -> bool {
        match self.queue.pop_front() {
            Some(waiter) => {
                if let Some(reply) = waiter.reply {
                    let _ = reply.send(result);
                }
                true
            }
            None => false,
        }
    }

    /// Connection dropped: every waiter gets a disconnect error.
    pub fn fail_all(&mut self) {
        while let Some(waiter) = self.queue.pop_front() {
            if let Some(reply) = waiter.reply {
                let _ = reply.send(Err(ConnectorError::Disconnected));
            }
        }
    }
}
