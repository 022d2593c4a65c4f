// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Pluggable outbound queue processing.
//!
//! A [`OutboundQueueProcessor`] decides how messages enter a client's
//! outbound queue and which messages leave it on a flush, enabling custom
//! batching, conflation, and throttling per channel. The
//! [`DefaultOutboundQueueProcessor`] appends in arrival order and drains
//! everything on flush, dropping expired and throttled messages.
//!
//! Processor calls always happen with the owning queue's lock held; an
//! implementation must not block or call back into the owning client.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::ProcessorError;
use crate::types::{DestinationName, FlushResult, Message, SubscriptionId};

/// Verdict of an outbound throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleResult {
    /// Deliver the message.
    Ok,
    /// Drop the message from the queue without delivering it.
    Dropped,
}

/// Outbound throttle manager contract.
///
/// The throttling algorithm itself lives with the host server; the core only
/// consults the verdict at flush time and releases destination registrations
/// when the last subscription funneling through a queue goes away.
pub trait OutboundThrottleManager: Send + Sync {
    /// Checks one outgoing message against destination- and client-level
    /// limits.
    fn throttle_outgoing(&self, message: &Message) -> ThrottleResult;

    /// Drops all throttle registrations for `destination`; called when the
    /// destination's last subscription on a queue unregisters.
    fn unregister_all_subscriptions(&self, destination: &DestinationName);
}

/// Strategy governing how messages are buffered and drained for one
/// (client, channel) outbound queue.
pub trait OutboundQueueProcessor: Send {
    /// Adds a new message to the queue. Invoked under the queue lock.
    fn add(
        &mut self,
        queue: &mut VecDeque<Message>,
        message: Message,
    ) -> Result<(), ProcessorError>;

    /// Drains and filters the queue, returning the messages to deliver now
    /// and an optional delay before the next automatic flush attempt.
    fn flush(&mut self, queue: &mut VecDeque<Message>) -> Result<FlushResult, ProcessorError>;

    /// Like [`flush`](Self::flush), scoped to messages addressed to a single
    /// subscription. Callers ignore the returned wait hint.
    fn flush_subscription(
        &mut self,
        subscription: &SubscriptionId,
        queue: &mut VecDeque<Message>,
    ) -> Result<FlushResult, ProcessorError>;

    /// The throttle manager this processor consults, if any. Exposed so
    /// unsubscription can release per-destination registrations.
    fn throttle_manager(&self) -> Option<&Arc<dyn OutboundThrottleManager>> {
        None
    }
}

/// The processor used when the host server does not install a custom one.
///
/// Adds every message to the tail of the queue and flushes all queued
/// messages as quickly as possible, skipping expired messages and messages
/// rejected by the outbound throttle manager.
#[derive(Default)]
pub struct DefaultOutboundQueueProcessor {
    throttle: Option<Arc<dyn OutboundThrottleManager>>,
}

impl DefaultOutboundQueueProcessor {
    /// Creates the default processor with no throttle manager attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an outbound throttle manager consulted on every flush.
    #[must_use]
    pub fn with_throttle_manager(throttle: Arc<dyn OutboundThrottleManager>) -> Self {
        Self {
            throttle: Some(throttle),
        }
    }

    fn drain(
        &self,
        queue: &mut VecDeque<Message>,
        subscription: Option<&SubscriptionId>,
    ) -> Vec<Message> {
        let now = SystemTime::now();
        let mut deliverable = Vec::new();
        // Retain messages for other subscriptions; everything matching is
        // consumed here whether delivered, expired, or throttled.
        queue.retain(|message| {
            if subscription.is_some_and(|target| message.subscription != *target) {
                return true;
            }
            if !message.is_expired(now) {
                let verdict = self
                    .throttle
                    .as_ref()
                    .map_or(ThrottleResult::Ok, |throttle| {
                        throttle.throttle_outgoing(message)
                    });
                if verdict == ThrottleResult::Ok {
                    deliverable.push(message.clone());
                }
            }
            false
        });
        deliverable
    }
}

impl OutboundQueueProcessor for DefaultOutboundQueueProcessor {
    fn add(
        &mut self,
        queue: &mut VecDeque<Message>,
        message: Message,
    ) -> Result<(), ProcessorError> {
        queue.push_back(message);
        Ok(())
    }

    fn flush(&mut self, queue: &mut VecDeque<Message>) -> Result<FlushResult, ProcessorError> {
        Ok(FlushResult {
            messages: self.drain(queue, None),
            next_flush_wait: None,
        })
    }

    fn flush_subscription(
        &mut self,
        subscription: &SubscriptionId,
        queue: &mut VecDeque<Message>,
    ) -> Result<FlushResult, ProcessorError> {
        Ok(FlushResult {
            messages: self.drain(queue, Some(subscription)),
            next_flush_wait: None,
        })
    }

    fn throttle_manager(&self) -> Option<&Arc<dyn OutboundThrottleManager>> {
        self.throttle.as_ref()
    }
}
