//! Inbound message queue
//!
//! FIFO of user messages, each tagged with the mode it asks for. The loop
//! drains it in batches: consecutive messages with the same mode hash are
//! coalesced into one turn, a mode change always starts a new batch.

use super::mode::Mode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// One user message, or a coalesced batch of them
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub text: String,
    pub attachments: Vec<String>,
    pub mode: Mode,
}

impl QueuedMessage {
    pub fn new(text: impl Into<String>, attachments: Vec<String>, mode: Mode) -> Self {
        Self {
            text: text.into(),
            attachments,
            mode,
        }
    }

    /// Prompt sent to the agent
    pub fn prompt(&self) -> String {
        if self.attachments.is_empty() {
            return self.text.clone();
        }
        let mut prompt = self.text.clone();
        prompt.push_str("\n\nAttached files:");
        for attachment in &self.attachments {
            prompt.push_str("\n- ");
            prompt.push_str(attachment);
        }
        prompt
    }

    fn absorb(&mut self, next: QueuedMessage) {
        if self.text.is_empty() {
            self.text = next.text;
        } else if !next.text.is_empty() {
            self.text.push('\n');
            self.text.push_str(&next.text);
        }
        for attachment in next.attachments {
            if !self.attachments.contains(&attachment) {
                self.attachments.push(attachment);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageQueue {
    items: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedMessage>> {
        match self.items.lock() {
            Ok(items) => items,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append a message; returns false once the queue is closed
    pub fn push(&self, message: QueuedMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        self.items().push_back(message);
        self.notify.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Take the next batch without waiting
    pub fn try_next_batch(&self) -> Option<QueuedMessage> {
        let mut items = self.items();
        let mut batch = items.pop_front()?;
        let hash = batch.mode.hash();
        while items
            .front()
            .map(|next| next.mode.hash() == hash)
            .unwrap_or(false)
        {
            if let Some(next) = items.pop_front() {
                batch.absorb(next);
            }
        }
        Some(batch)
    }

    /// Wait for the next batch; `None` once closed
    pub async fn next_batch(&self) -> Option<QueuedMessage> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(batch) = self.try_next_batch() {
                return Some(batch);
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting messages and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
