// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pending Replies
//!
//! Correlation of request-reply exchanges: every outstanding request owns a one-shot
//! slot keyed by its correlation id. A slot is settled exactly once, either by the
//! matching reply or by its expiry, whichever removes it from the map first.

use crate::envelope::Envelope;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct PendingReplies {
    slots: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        PendingReplies::default()
    }

    /// Allocates a new correlation id and the receiver its reply will arrive on.
    pub fn register(&self) -> (String, oneshot::Receiver<Envelope>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id.clone(), tx);
        (id, rx)
    }

    /// Registers a slot that expires itself when dropped, whether the request got its
    /// reply, timed out or was cancelled by its caller.
    pub fn slot(&self) -> ReplySlot<'_> {
        let (correlation_id, receiver) = self.register();
        ReplySlot {
            pending: self,
            correlation_id,
            receiver,
        }
    }

    /// Hands a reply to its waiting request.
    ///
    /// # Returns
    /// `false` when no request waits for this id anymore (late or unknown reply)
    pub fn complete(&self, correlation_id: &str, reply: Envelope) -> bool {
        let slot = self.slots.lock().remove(correlation_id);
        match slot {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Cancels a slot whose request gave up waiting.
    ///
    /// # Returns
    /// `false` when the slot was already settled
    pub fn expire(&self, correlation_id: &str) -> bool {
        self.slots.lock().remove(correlation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// An outstanding request's view of its slot.
pub struct ReplySlot<'a> {
    pending: &'a PendingReplies,
    correlation_id: String,
    receiver: oneshot::Receiver<Envelope>,
}

impl ReplySlot<'_> {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Receiver the reply arrives on.
    pub fn receiver(&mut self) -> &mut oneshot::Receiver<Envelope> {
        &mut self.receiver
    }
}

impl Drop for ReplySlot<'_> {
    fn drop(&mut self) {
        self.pending.expire(&self.correlation_id);
    }
}
