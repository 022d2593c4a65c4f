// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Destination-level subscriptions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::session::Session;
use crate::types::{ChannelId, DestinationName, SubscriptionId};

/// One destination-level interest of a client, routed through one channel.
///
/// The subscription's session decides whether the outbound queue it funnels
/// through gets a push-capable session attached.
pub struct Subscription {
    id: SubscriptionId,
    channel: ChannelId,
    destination: DestinationName,
    session: Weak<Session>,
    /// Set while the server still tries to tell the remote client this
    /// subscription is being invalidated; suppresses message scrubbing on
    /// unregister so the notification can go out.
    attempting_invalidation_notification: AtomicBool,
    /// Set when the owning channel is known disconnected; allows queue
    /// removal even with messages still buffered.
    channel_disconnected: AtomicBool,
}

impl Subscription {
    /// Creates a subscription over `channel` for `destination`, carried by
    /// `session`.
    pub fn new(
        id: SubscriptionId,
        channel: ChannelId,
        destination: DestinationName,
        session: &Arc<Session>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            channel,
            destination,
            session: Arc::downgrade(session),
            attempting_invalidation_notification: AtomicBool::new(false),
            channel_disconnected: AtomicBool::new(false),
        })
    }

    /// Returns the subscription id.
    #[must_use]
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Returns the channel the subscription routes through.
    #[must_use]
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Returns the destination the subscription is interested in.
    #[must_use]
    pub fn destination(&self) -> &DestinationName {
        &self.destination
    }

    /// Returns the carrying session, if it is still alive.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    /// Marks whether the server is attempting to notify the remote client of
    /// this subscription's invalidation.
    pub fn set_attempting_invalidation_notification(&self, value: bool) {
        self.attempting_invalidation_notification
            .store(value, Ordering::Relaxed);
    }

    /// Whether client-side invalidation notification is being attempted.
    #[must_use]
    pub fn is_attempting_invalidation_notification(&self) -> bool {
        self.attempting_invalidation_notification
            .load(Ordering::Relaxed)
    }

    /// Marks the owning channel as known disconnected.
    pub fn set_channel_disconnected(&self, value: bool) {
        self.channel_disconnected.store(value, Ordering::Relaxed);
    }

    /// Whether the owning channel is known disconnected.
    #[must_use]
    pub fn is_channel_disconnected(&self) -> bool {
        self.channel_disconnected.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("destination", &self.destination)
            .finish()
    }
}
