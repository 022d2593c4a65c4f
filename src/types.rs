// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Core value types shared across the crate.
//!
//! This module defines the data that flows through the public API. No
//! behavior lives here -- only data definitions, small constructors, and
//! conversions.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident, $what:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parses and validates the id.
            pub fn parse(raw: &str) -> Result<Self, String> {
                if raw.trim().is_empty() {
                    return Err(concat!($what, " must be non-empty").to_owned());
                }
                Ok(Self(raw.to_owned()))
            }

            /// Returns the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns the owned id.
            #[must_use]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value.as_str())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl From<&'static str> for $name {
            fn from(value: &'static str) -> Self {
                Self::parse(value).expect(concat!("invalid static ", $what, " literal"))
            }
        }
    };
}

id_newtype!(
    /// Identity of a registered remote client application instance.
    ClientId,
    "client id"
);

id_newtype!(
    /// Identity of a logical communication channel a client polls or is
    /// pushed to over.
    ChannelId,
    "channel id"
);

id_newtype!(
    /// Identity of one destination-level subscription of a client.
    SubscriptionId,
    "subscription id"
);

id_newtype!(
    /// Name of the destination a subscription is interested in. Used for
    /// throttle-manager lookups.
    DestinationName,
    "destination name"
);

impl ClientId {
    /// Produces a fresh server-assigned client id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl SubscriptionId {
    /// Produces a fresh server-assigned subscription id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// What a queued message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// An ordinary outbound data message.
    Data,
    /// Synthetic control message telling the remote client one of its
    /// subscriptions is gone and it should stop polling for it.
    SubscriptionInvalidate,
}

/// One outbound message buffered for delivery to a single subscription.
#[derive(Debug, Clone)]
pub struct Message {
    /// Broker-assigned message identifier.
    pub id: Uuid,
    /// The subscription this message targets.
    pub subscription: SubscriptionId,
    /// The destination the message was produced for.
    pub destination: DestinationName,
    /// Creation timestamp, used together with `time_to_live` for expiry.
    pub timestamp: SystemTime,
    /// Optional time-to-live; expired messages are dropped at flush time.
    pub time_to_live: Option<Duration>,
    /// Message kind.
    pub kind: MessageKind,
    /// Opaque payload handed through to the wire codec by the transport.
    pub body: Vec<u8>,
}

impl Message {
    /// Creates a data message targeting `subscription` on `destination`.
    pub fn new(
        subscription: SubscriptionId,
        destination: DestinationName,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription,
            destination,
            timestamp: SystemTime::now(),
            time_to_live: None,
            kind: MessageKind::Data,
            body: body.into(),
        }
    }

    /// Creates the synthetic subscription-invalidate control message appended
    /// to a final poll response when a subscription disappears and the remote
    /// client could not otherwise be told.
    pub fn subscription_invalidate(subscription: SubscriptionId) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription,
            destination: DestinationName::from("control"),
            timestamp: SystemTime::now(),
            time_to_live: None,
            kind: MessageKind::SubscriptionInvalidate,
            body: Vec::new(),
        }
    }

    /// Sets a time-to-live after which the message is dropped instead of
    /// delivered.
    #[must_use]
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Whether the message's time-to-live has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.time_to_live {
            Some(ttl) => now
                .duration_since(self.timestamp)
                .map_or(false, |elapsed| elapsed >= ttl),
            None => false,
        }
    }
}

/// Outcome of one queue-processor flush: the messages ready to be written to
/// the network now, plus an optional delay after which the queue should be
/// flushed again automatically.
#[derive(Debug, Default)]
pub struct FlushResult {
    /// Messages drained from the queue, in delivery order.
    pub messages: Vec<Message>,
    /// Delay before the next automatic flush attempt; `None` means no
    /// follow-up flush is requested.
    pub next_flush_wait: Option<Duration>,
}

impl FlushResult {
    /// A flush that produced nothing and requests no follow-up.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Result handed back from the poll protocols. Extends [`FlushResult`] with
/// the two poll-coordination flags.
#[derive(Debug, Default)]
pub struct PollResult {
    /// Messages to return in the poll response, in delivery order.
    pub messages: Vec<Message>,
    /// Delay before the next automatic flush attempt.
    pub next_flush_wait: Option<Duration>,
    /// The caller should back off instead of immediately re-polling; set when
    /// this poll was completed early to make room for another poll on the
    /// same session and channel.
    pub avoid_busy_polling: bool,
    /// The poll collided with an already-parked poll from the same client and
    /// was treated as a no-op; the caller must not process the (empty) result.
    pub client_processing_suppressed: bool,
}

impl PollResult {
    /// An empty result carrying no coordination flags (e.g. a timed-out long
    /// poll with no data).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Marks a no-op response to a poll that collided with an already-parked
    /// poll from the same client.
    #[must_use]
    pub fn suppressed() -> Self {
        Self {
            client_processing_suppressed: true,
            ..Self::default()
        }
    }

    /// Marks an early completion issued to make room for another poll on the
    /// same session and channel.
    #[must_use]
    pub fn busy_poll_swap() -> Self {
        Self {
            avoid_busy_polling: true,
            ..Self::default()
        }
    }
}

impl From<FlushResult> for PollResult {
    fn from(flush: FlushResult) -> Self {
        Self {
            messages: flush.messages,
            next_flush_wait: flush.next_flush_wait,
            avoid_busy_polling: false,
            client_processing_suppressed: false,
        }
    }
}
