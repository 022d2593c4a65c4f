// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the scenario tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::client::{AsyncPollHandler, Client};
use crate::push::PushHandler;
use crate::registry::ClientRegistry;
use crate::session::{Session, SessionTransport};
use crate::settings::OutboxSettings;
use crate::subscription::Subscription;
use crate::types::{
    ChannelId, DestinationName, Message, PollResult, SubscriptionId,
};

pub(crate) fn registry() -> ClientRegistry {
    ClientRegistry::new(OutboxSettings::default())
}

pub(crate) fn registry_with_idle_timeout(idle_timeout: Duration) -> ClientRegistry {
    ClientRegistry::new(OutboxSettings { idle_timeout })
}

pub(crate) fn channel(raw: &str) -> ChannelId {
    ChannelId::parse(raw).expect("valid channel id")
}

/// Creates a client registered under `id` and associates it with `session`.
pub(crate) fn client_on_session(
    registry: &ClientRegistry,
    id: &str,
    session: &Arc<Session>,
) -> Arc<Client> {
    let client = registry
        .get_or_create(Some(id), true)
        .expect("client creation should succeed")
        .expect("client should be created");
    client.register_session(session);
    client
}

/// Subscribes `client` on `channel_id`, creating (or ref-counting) the
/// channel's outbound queue.
pub(crate) fn subscribe(
    client: &Arc<Client>,
    session: &Arc<Session>,
    channel_id: &str,
    destination: &str,
) -> Arc<Subscription> {
    let subscription = Subscription::new(
        SubscriptionId::generate(),
        channel(channel_id),
        DestinationName::parse(destination).expect("valid destination"),
        session,
    );
    client
        .register_subscription(&subscription)
        .expect("subscription registration should succeed");
    subscription
}

pub(crate) fn data_message(subscription: &Subscription, body: &str) -> Message {
    Message::new(
        subscription.id().clone(),
        subscription.destination().clone(),
        body.as_bytes().to_vec(),
    )
}

pub(crate) fn bodies(messages: &[Message]) -> Vec<Vec<u8>> {
    messages.iter().map(|message| message.body.clone()).collect()
}

// ---------------------------------------------------------------------------
// Recording doubles
// ---------------------------------------------------------------------------

/// Async poll handler that records every completion.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    results: Mutex<Vec<PollResult>>,
}

impl RecordingHandler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn completions(&self) -> usize {
        self.results.lock().len()
    }

    pub(crate) fn take(&self) -> Vec<PollResult> {
        std::mem::take(&mut self.results.lock())
    }

    /// Waits until at least `count` completions arrived, for timer-driven
    /// scenarios.
    pub(crate) fn wait_for_completions(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.completions() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.completions() >= count
    }
}

impl AsyncPollHandler for RecordingHandler {
    fn poll_complete(&self, result: PollResult) {
        self.results.lock().push(result);
    }
}

/// Push-capable transport that records every write.
pub(crate) struct RecordingTransport {
    connected: AtomicBool,
    pushed: Mutex<Vec<Message>>,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            pushed: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn pushed_bodies(&self) -> Vec<Vec<u8>> {
        bodies(&self.pushed.lock())
    }

    pub(crate) fn wait_for_pushes(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.pushed.lock().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.pushed.lock().len() >= count
    }
}

impl SessionTransport for RecordingTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn push(&self, message: Message) {
        self.pushed.lock().push(message);
    }
}

/// Push handler that records writes and close calls.
#[derive(Default)]
pub(crate) struct RecordingPushHandler {
    pushed: Mutex<Vec<Message>>,
    closed: Mutex<Option<bool>>,
}

impl RecordingPushHandler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn pushed_bodies(&self) -> Vec<Vec<u8>> {
        bodies(&self.pushed.lock())
    }

    pub(crate) fn closed_with(&self) -> Option<bool> {
        *self.closed.lock()
    }
}

impl PushHandler for RecordingPushHandler {
    fn push_messages(&self, messages: Vec<Message>) {
        self.pushed.lock().extend(messages);
    }

    fn close(&self, notify_disconnect: bool) {
        *self.closed.lock() = Some(notify_disconnect);
    }
}
