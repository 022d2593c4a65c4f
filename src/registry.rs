// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Client registry: creation, lookup, idle timeout, and timer dispatch.
//!
//! The registry is an explicit object injected into whatever server
//! component needs it; its timer thread starts with the registry and stops
//! when the registry is dropped (or [`ClientRegistry::shutdown`] is called).
//!
//! Lookups of already-valid clients take only a read lock; the create path
//! serializes on the write lock so two requests racing on the same id
//! cannot both construct a client.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

use crate::client::{Client, ClientListener};
use crate::error::Error;
use crate::processor::{DefaultOutboundQueueProcessor, OutboundQueueProcessor};
use crate::settings::OutboxSettings;
use crate::timeout::{TimeoutManager, TimerTask};
use crate::types::{ChannelId, ClientId, PollResult};

type ProcessorFactory =
    Box<dyn Fn(&ClientId, &ChannelId) -> Box<dyn OutboundQueueProcessor> + Send + Sync>;

pub(crate) struct RegistryShared {
    settings: OutboxSettings,
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    created_listeners: RwLock<Vec<Arc<dyn ClientListener>>>,
    processor_factory: ProcessorFactory,
    timeouts: TimeoutManager,
}

impl RegistryShared {
    pub(crate) fn lookup(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.read().get(id).cloned()
    }

    pub(crate) fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.settings.idle_timeout
    }

    pub(crate) fn create_processor(
        &self,
        client: &ClientId,
        channel: &ChannelId,
    ) -> Box<dyn OutboundQueueProcessor> {
        (self.processor_factory)(client, channel)
    }

    /// Removes `client` only when the stored entry is the same instance;
    /// guards against an invalidating client evicting its replacement.
    pub(crate) fn remove_client(&self, client: &Arc<Client>) {
        let mut clients = self.clients.write();
        if clients
            .get(client.id())
            .is_some_and(|stored| Arc::ptr_eq(stored, client))
        {
            let _ = clients.remove(client.id());
        }
    }

    /// Single dispatch point for every fired timer task.
    fn fire(&self, task: TimerTask) {
        match task {
            TimerTask::AsyncPollTimeout { task } => {
                // No data arrived in time; answer the poll with nothing.
                if let Some(task) = task.upgrade() {
                    task.complete(PollResult::empty());
                }
            }
            TimerTask::ScheduledFlushForPush { client, channel } => {
                if let Some(client) = self.lookup(&client) {
                    client.scheduled_flush_for_push(&channel);
                }
            }
            TimerTask::ScheduledFlushForPoll { client, channel } => {
                if let Some(client) = self.lookup(&client) {
                    client.scheduled_flush_for_poll(&channel);
                }
            }
            TimerTask::ClientIdleTimeout { client } => {
                if let Some(client) = self.lookup(&client) {
                    client.idle_timeout_fired();
                }
            }
        }
    }
}

/// Creates, looks up, and times out [`Client`] instances.
pub struct ClientRegistry {
    shared: Arc<RegistryShared>,
}

impl ClientRegistry {
    /// Creates a registry whose clients use the default queue processor.
    #[must_use]
    pub fn new(settings: OutboxSettings) -> Self {
        Self::with_processor_factory(settings, |_, _| {
            Box::new(DefaultOutboundQueueProcessor::new())
        })
    }

    /// Creates a registry with a custom per-(client, channel) queue
    /// processor factory.
    pub fn with_processor_factory<F>(settings: OutboxSettings, factory: F) -> Self
    where
        F: Fn(&ClientId, &ChannelId) -> Box<dyn OutboundQueueProcessor> + Send + Sync + 'static,
    {
        let shared = Arc::new_cyclic(|weak: &Weak<RegistryShared>| {
            let dispatch = weak.clone();
            RegistryShared {
                settings,
                clients: RwLock::new(HashMap::new()),
                created_listeners: RwLock::new(Vec::new()),
                processor_factory: Box::new(factory),
                timeouts: TimeoutManager::start("outbox-timeout", move |task| {
                    if let Some(registry) = dispatch.upgrade() {
                        registry.fire(task);
                    }
                }),
            }
        });
        Self { shared }
    }

    /// Returns the valid client registered under `id`, or constructs one.
    ///
    /// With `create_if_absent` false, a miss returns `Ok(None)` instead of
    /// creating. Passing no id always constructs a client with a fresh
    /// server-assigned id. Newly created clients are scheduled for idle
    /// timeout when one is configured, and create listeners run after the
    /// client is fully constructed.
    pub fn get_or_create(
        &self,
        id: Option<&str>,
        create_if_absent: bool,
    ) -> Result<Option<Arc<Client>>, Error> {
        let requested = match id {
            Some(raw) => Some(ClientId::parse(raw).map_err(|_| Error::EmptyClientId)?),
            None => None,
        };

        // Fast path: valid clients are served under the read lock alone.
        if let Some(requested) = &requested {
            if let Some(existing) = self.shared.lookup(requested) {
                if existing.is_valid() && !existing.is_invalidating() {
                    existing.touch();
                    return Ok(Some(existing));
                }
            }
        }

        let mut clients = self.shared.clients.write();
        if let Some(requested) = &requested {
            match clients.get(requested) {
                Some(existing) if existing.is_valid() && !existing.is_invalidating() => {
                    // Raced with another creator; use theirs.
                    let existing = Arc::clone(existing);
                    drop(clients);
                    existing.touch();
                    return Ok(Some(existing));
                }
                Some(_) => {
                    // Invalid leftover; it will be replaced below.
                    let _ = clients.remove(requested);
                }
                None => {}
            }
            if !create_if_absent {
                return Ok(None);
            }
        }

        let id = requested.unwrap_or_else(ClientId::generate);
        if clients.contains_key(&id) {
            return Err(Error::DuplicateClientId { client: id });
        }
        let client = Client::new(id.clone(), Arc::downgrade(&self.shared));
        let _ = clients.insert(id, Arc::clone(&client));
        if self.shared.settings.idle_timeout_enabled() {
            let handle = self.shared.timeouts.schedule(
                self.shared.settings.idle_timeout,
                TimerTask::ClientIdleTimeout {
                    client: client.id().clone(),
                },
            );
            client.set_idle_timer(handle);
        }
        drop(clients);

        let listeners = self.shared.created_listeners.read().clone();
        for listener in &listeners {
            listener.client_created(&client);
        }
        Ok(Some(client))
    }

    /// Constructs a client under `id`, failing with a duplicate-id error if
    /// a live client already holds it. Stale (invalidated) entries are
    /// replaced.
    pub fn create(&self, id: &str) -> Result<Arc<Client>, Error> {
        let id = ClientId::parse(id).map_err(|_| Error::EmptyClientId)?;
        let client = {
            let mut clients = self.shared.clients.write();
            match clients.get(&id) {
                Some(existing) if existing.is_valid() && !existing.is_invalidating() => {
                    return Err(Error::DuplicateClientId { client: id });
                }
                Some(_) => {
                    let _ = clients.remove(&id);
                }
                None => {}
            }
            let client = Client::new(id.clone(), Arc::downgrade(&self.shared));
            let _ = clients.insert(id, Arc::clone(&client));
            if self.shared.settings.idle_timeout_enabled() {
                let handle = self.shared.timeouts.schedule(
                    self.shared.settings.idle_timeout,
                    TimerTask::ClientIdleTimeout {
                        client: client.id().clone(),
                    },
                );
                client.set_idle_timer(handle);
            }
            client
        };
        let listeners = self.shared.created_listeners.read().clone();
        for listener in &listeners {
            listener.client_created(&client);
        }
        Ok(client)
    }

    /// Removes `client` from the registry if it is still the stored entry.
    /// Invoked by clients as they invalidate.
    pub fn remove(&self, client: &Arc<Client>) {
        self.shared.remove_client(client);
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.clients.read().len()
    }

    /// Snapshot of the registered client ids.
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.shared.clients.read().keys().cloned().collect()
    }

    /// Registers a listener notified after each new client is constructed.
    pub fn add_created_listener(&self, listener: Arc<dyn ClientListener>) {
        self.shared.created_listeners.write().push(listener);
    }

    /// Stops the timer thread. Pending timeouts and scheduled flushes are
    /// dropped; registered clients stay usable for direct calls.
    pub fn shutdown(&self) {
        self.shared.timeouts.shutdown();
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.client_count())
            .finish()
    }
}
