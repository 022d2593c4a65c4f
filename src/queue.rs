// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-(client, channel) outbound queue state.
//!
//! The queue's mutex guards the message buffers and delivery-state flags and
//! doubles as the monitor for the blocking-wait poll protocol: a thread in a
//! wait poll blocks on [`OutboundQueue::available`] until a push, an
//! unsubscription, a busy-poll swap, or its deadline wakes it.
//!
//! Lock order is always client lock before queue lock, never the reverse.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::client::AsyncPollTask;
use crate::processor::OutboundQueueProcessor;
use crate::session::Session;
use crate::timeout::TimerHandle;
use crate::types::{ChannelId, ClientId, Message};

pub(crate) struct QueueState {
    /// Pending outbound messages, FIFO.
    pub messages: VecDeque<Message>,
    /// Messages produced by a delayed flush that no poll has claimed yet.
    /// Always returned ahead of freshly flushed messages.
    pub flushed_between_polls: Vec<Message>,
    /// The strategy deciding how messages enter and leave this queue.
    pub processor: Box<dyn OutboundQueueProcessor>,
    /// Live subscriptions funneling through this queue. The queue is
    /// removable only once this reaches zero and `messages` is empty.
    pub subscriber_refs: usize,
    /// At most one outstanding parked async poll.
    pub async_poll: Option<Arc<AsyncPollTask>>,
    /// Session capable of unsolicited writes, when one subscribed.
    pub push_session: Option<Weak<Session>>,
    /// At most one outstanding delayed-flush timer.
    pub flush_task: Option<TimerHandle>,
    /// True while a thread is blocked in a wait poll on this queue.
    pub waiting: bool,
    /// One-shot: the next wait-poll flush must tell the caller to back off.
    pub avoid_busy_polling: bool,
}

/// Mailbox plus delivery-coordination state for one (client, channel) pair.
pub struct OutboundQueue {
    client: ClientId,
    channel: ChannelId,
    pub(crate) state: Mutex<QueueState>,
    /// Condition variable bound to `state`; signalled when messages arrive,
    /// a subscription goes away, or a busy-poll swap needs the waiter out.
    pub(crate) available: Condvar,
}

impl OutboundQueue {
    pub(crate) fn new(
        client: ClientId,
        channel: ChannelId,
        processor: Box<dyn OutboundQueueProcessor>,
        push_session: Option<Weak<Session>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            channel,
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                flushed_between_polls: Vec::new(),
                processor,
                subscriber_refs: 1,
                async_poll: None,
                push_session,
                flush_task: None,
                waiting: false,
                avoid_busy_polling: false,
            }),
            available: Condvar::new(),
        })
    }

    /// Id of the owning client.
    #[must_use]
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// Channel this queue buffers messages for.
    #[must_use]
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Number of messages currently buffered (diagnostics only; the value is
    /// stale the moment it is returned).
    #[must_use]
    pub fn depth(&self) -> usize {
        let state = self.state.lock();
        state.messages.len() + state.flushed_between_polls.len()
    }
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("client", &self.client)
            .field("channel", &self.channel)
            .finish()
    }
}
