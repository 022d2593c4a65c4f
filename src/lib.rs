// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-client outbound message queues and delivery coordination for a
//! real-time messaging gateway.
//!
//! For every connected remote client the engine buffers outbound messages
//! per channel and delivers them by direct network push, by completing a
//! parked long poll, or by answering a plain poll -- without duplicate
//! delivery, busy-polling storms, or leaked queues, under heavy concurrency.
//!
//! The transport/endpoint layer, wire codecs, authentication, and throttle
//! policy all live outside this crate; they plug in through the
//! [`SessionTransport`], [`PushHandler`], [`OutboundQueueProcessor`], and
//! [`OutboundThrottleManager`] contracts.
//!
//! # Overview
//!
//! - [`ClientRegistry`] creates, looks up, and idle-times-out [`Client`]s.
//! - A [`Client`] owns one outbound queue per channel it has
//!   [`Subscription`]s over, and exposes the three poll protocols
//!   ([`Client::poll`], [`Client::poll_async`], [`Client::poll_with_wait`])
//!   plus [`Client::push`] for business-logic delivery.
//! - A [`Session`] models the network connection clients share; it carries
//!   the busy-poll avoidance slots guaranteeing at most one parked poll per
//!   (session, channel) across all sharing clients.

#![deny(missing_docs)]

mod client;
mod error;
mod processor;
mod push;
mod queue;
mod registry;
mod session;
mod settings;
mod subscription;
mod timeout;
mod types;

#[cfg(test)]
mod tests;

pub use client::{
    AsyncPollHandler, AsyncPollTask, AttributeValue, Client, ClientAttributeListener,
    ClientListener, PollWaitListener,
};
pub use error::{Error, ProcessorError};
pub use processor::{
    DefaultOutboundQueueProcessor, OutboundQueueProcessor, OutboundThrottleManager, ThrottleResult,
};
pub use push::PushHandler;
pub use queue::OutboundQueue;
pub use registry::ClientRegistry;
pub use session::{Session, SessionId, SessionTransport};
pub use settings::OutboxSettings;
pub use subscription::Subscription;
pub use types::{
    ChannelId, ClientId, DestinationName, FlushResult, Message, MessageKind, PollResult,
    SubscriptionId,
};
