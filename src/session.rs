// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Transport-session bookkeeping consumed by the delivery core.
//!
//! A [`Session`] stands for one network connection a remote client holds to
//! the server. Several clients may share a session (e.g. multiple
//! application instances behind one browser connection), which is why the
//! busy-poll avoidance slots live here rather than on the client: the core
//! guarantees at most one parked long poll and at most one blocked wait poll
//! per (session, channel) across all sharing clients.
//!
//! Both slot maps are guarded by the session's own lock. Code holding that
//! lock must never acquire a client lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::AsyncPollTask;
use crate::queue::OutboundQueue;
use crate::types::{ChannelId, ClientId, Message};

/// Process-unique identity of a transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Write-side of a push-capable connection, implemented by the transport
/// layer. Sessions without a transport are poll-only.
pub trait SessionTransport: Send + Sync {
    /// Whether the underlying connection is currently open for writes.
    fn is_connected(&self) -> bool;

    /// Writes one message to the remote client outside of any poll response.
    fn push(&self, message: Message);
}

#[derive(Default)]
struct SessionState {
    /// Ids of the clients registered on this session.
    clients: Vec<ClientId>,
    /// At most one queue blocked in a wait poll per channel.
    wait_monitors: HashMap<ChannelId, Arc<OutboundQueue>>,
    /// At most one parked async long poll per channel.
    async_polls: HashMap<ChannelId, Arc<AsyncPollTask>>,
}

/// One transport session shared by the clients connected through it.
pub struct Session {
    id: SessionId,
    transport: Option<Arc<dyn SessionTransport>>,
    state: Mutex<SessionState>,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl Session {
    /// Creates a session. Passing a transport makes the session
    /// push-capable; `None` models a plain polling connection.
    pub fn new(transport: Option<Arc<dyn SessionTransport>>) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            transport,
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Returns the session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether the session can deliver unsolicited writes at all.
    #[must_use]
    pub fn is_push_supported(&self) -> bool {
        self.transport.is_some()
    }

    /// Whether the session is push-capable and currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.is_connected())
    }

    /// Writes one message over the push transport; silently dropped on a
    /// poll-only session.
    pub fn push(&self, message: Message) {
        if let Some(transport) = &self.transport {
            transport.push(message);
        }
    }

    /// Snapshot of the client ids registered on this session.
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.state.lock().clients.clone()
    }

    pub(crate) fn register_client(&self, client: &ClientId) {
        let mut state = self.state.lock();
        if !state.clients.contains(client) {
            state.clients.push(client.clone());
        }
    }

    pub(crate) fn unregister_client(&self, client: &ClientId) {
        self.state.lock().clients.retain(|id| id != client);
    }

    pub(crate) fn parked_async_poll(&self, channel: &ChannelId) -> Option<Arc<AsyncPollTask>> {
        self.state.lock().async_polls.get(channel).cloned()
    }

    pub(crate) fn park_async_poll(&self, channel: ChannelId, task: Arc<AsyncPollTask>) {
        let _ = self.state.lock().async_polls.insert(channel, task);
    }

    /// Clears the parked-poll slot only if it still holds `task`; guards
    /// against a completion racing a newer poll parked on the same channel.
    pub(crate) fn clear_async_poll(&self, channel: &ChannelId, task: &Arc<AsyncPollTask>) {
        let mut state = self.state.lock();
        if state
            .async_polls
            .get(channel)
            .is_some_and(|parked| Arc::ptr_eq(parked, task))
        {
            let _ = state.async_polls.remove(channel);
        }
    }

    pub(crate) fn wait_monitor(&self, channel: &ChannelId) -> Option<Arc<OutboundQueue>> {
        self.state.lock().wait_monitors.get(channel).cloned()
    }

    pub(crate) fn set_wait_monitor(&self, channel: ChannelId, queue: Arc<OutboundQueue>) {
        let _ = self.state.lock().wait_monitors.insert(channel, queue);
    }

    /// Clears the wait-monitor slot only if it still holds `queue`.
    pub(crate) fn clear_wait_monitor(&self, channel: &ChannelId, queue: &Arc<OutboundQueue>) {
        let mut state = self.state.lock();
        if state
            .wait_monitors
            .get(channel)
            .is_some_and(|waiting| Arc::ptr_eq(waiting, queue))
        {
            let _ = state.wait_monitors.remove(channel);
        }
    }

    /// Wakes a blocked wait poll on `channel`, instructing it to back off.
    ///
    /// Called by the transport layer when this session's connection budget
    /// needs the parked request back (e.g. an excess poll arrived for the
    /// session). The woken poll's result carries the avoid-busy-polling flag
    /// so the remote client delays its next poll instead of spinning.
    ///
    /// Returns `false` when no wait poll is parked on the channel.
    pub fn release_wait_poll(&self, channel: &ChannelId) -> bool {
        let Some(queue) = self.wait_monitor(channel) else {
            return false;
        };
        let mut state = queue.state.lock();
        if !state.waiting {
            return false;
        }
        state.avoid_busy_polling = true;
        drop(state);
        queue.available.notify_all();
        true
    }

    /// Whether any channel's wait monitor currently points at a queue owned
    /// by `client`. Consulted by idle-timeout evaluation.
    pub(crate) fn holds_wait_for_client(&self, client: &ClientId) -> bool {
        self.state
            .lock()
            .wait_monitors
            .values()
            .any(|queue| queue.client() == client)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("push_supported", &self.is_push_supported())
            .finish()
    }
}
