// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Push-handler contract.

use crate::subscription::Subscription;
use crate::types::Message;

/// Channel-owned hook a client uses to push messages to a remote client
/// without a push-capable session.
///
/// A client holds at most one handler per channel. Handlers are registered
/// by the transport layer before subscriptions exist and closed during
/// client invalidation with `notify_disconnect` set so the channel can tear
/// down the remote connection.
pub trait PushHandler: Send + Sync {
    /// Writes a batch of flushed messages to the remote client.
    fn push_messages(&self, messages: Vec<Message>);

    /// Associates a subscription with the handler so shutting down the push
    /// connection can invalidate the subscriptions using it.
    fn register_subscription(&self, _subscription: &Subscription) {}

    /// Drops a subscription association.
    fn unregister_subscription(&self, _subscription: &Subscription) {}

    /// Closes the push connection. When `notify_disconnect` is set the
    /// remote client is told the disconnect was server-initiated.
    fn close(&self, notify_disconnect: bool);
}
