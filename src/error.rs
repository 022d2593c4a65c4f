// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

use crate::types::{ChannelId, ClientId};

/// Errors produced by client registry and delivery operations.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Any operation attempted on a client after it was invalidated.
    #[error("client `{client}` has been invalidated")]
    ClientInvalidated {
        /// The invalidated client.
        client: ClientId,
    },
    /// A poll targeted a channel the client holds no subscriptions over.
    #[error("client `{client}` is not subscribed over channel `{channel}`")]
    NotSubscribed {
        /// The polling client.
        client: ClientId,
        /// The channel with no outbound queue.
        channel: ChannelId,
    },
    /// A poll targeted a channel the client holds no subscriptions over, but
    /// another client sharing one of its sessions does -- the poll most
    /// likely carries the wrong client id.
    #[error(
        "client `{client}` is not subscribed over channel `{channel}`, but another \
         client on the same session is; the poll request likely carries a stale or \
         wrong client id"
    )]
    NotSubscribedOtherClientMatch {
        /// The polling client.
        client: ClientId,
        /// The channel with no outbound queue for this client.
        channel: ChannelId,
    },
    /// A second push handler was registered for a channel already holding one.
    #[error("client `{client}` already has a push handler registered for channel `{channel}`")]
    PushHandlerAlreadyRegistered {
        /// The client the handler was registered on.
        client: ClientId,
        /// The channel already holding a handler.
        channel: ChannelId,
    },
    /// Client creation failed because the id is already registered to a
    /// different live client.
    #[error("cannot create client `{client}`; another client is registered under the same id")]
    DuplicateClientId {
        /// The contested id.
        client: ClientId,
    },
    /// Client creation failed because no usable id was supplied or produced.
    #[error("cannot create a client with an empty id")]
    EmptyClientId,
    /// A pluggable queue processor failed while adding or flushing. The
    /// failure is logged with client context and fails only the individual
    /// request.
    #[error("queue processor failed for client `{client}`: {message}")]
    QueueProcessor {
        /// The client whose queue was being processed.
        client: ClientId,
        /// Processor-reported failure details.
        message: String,
    },
}

/// Failure raised by a pluggable [`OutboundQueueProcessor`] implementation.
///
/// [`OutboundQueueProcessor`]: crate::processor::OutboundQueueProcessor
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessorError {
    /// Failure details.
    pub message: String,
}

impl ProcessorError {
    /// Creates a processor error from any displayable detail.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
