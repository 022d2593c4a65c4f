// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! A registered remote client and its delivery coordination.
//!
//! `Client` owns the per-channel outbound queues and implements the three
//! poll protocols (immediate, async long poll, blocking wait poll), direct
//! push delivery, and invalidation. This is the multi-lock heart of the
//! crate; see the locking notes below before changing anything here.
//!
//! # Locking
//!
//! Three locks cooperate, always acquired in this order and never in
//! reverse:
//!
//! 1. the **client lock** (`Client::state`) -- attributes, session list,
//!    queue map, push-handler map, validity;
//! 2. a **queue lock** (`OutboundQueue::state`) -- one queue's buffers and
//!    flags; its mutex doubles as the wait-poll condition variable;
//! 3. the **session lock** -- the session's parked-poll and wait-monitor
//!    slots.
//!
//! Only the blocking wait poll suspends its calling thread, and it does so
//! holding the queue lock alone. Everything else returns or calls back
//! promptly.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::Error;
use crate::push::PushHandler;
use crate::queue::OutboundQueue;
use crate::registry::RegistryShared;
use crate::session::Session;
use crate::subscription::Subscription;
use crate::timeout::{TimerHandle, TimerTask};
use crate::types::{ChannelId, ClientId, FlushResult, Message, PollResult};

/// Value bound to a client attribute name.
pub type AttributeValue = Arc<dyn Any + Send + Sync>;

/// Callback invoked when an async long poll completes -- with data, empty on
/// timeout, or flagged for poll coordination.
pub trait AsyncPollHandler: Send + Sync {
    /// Receives the poll outcome. Invoked from whichever thread completes
    /// the poll: the pusher, the timer, or an invalidating thread.
    fn poll_complete(&self, result: PollResult);
}

/// Observer notified around a blocking wait poll's suspension.
pub trait PollWaitListener: Send + Sync {
    /// The calling thread is about to block on `queue`.
    fn wait_start(&self, queue: &OutboundQueue);

    /// The calling thread woke up (data, timeout, or coordination).
    fn wait_end(&self, queue: &OutboundQueue);
}

/// Observer of client attribute changes.
pub trait ClientAttributeListener: Send + Sync {
    /// An attribute was bound under a previously unused name.
    fn attribute_added(&self, _client: &ClientId, _name: &str, _value: &AttributeValue) {}

    /// An attribute was rebound; `old_value` is the displaced value.
    fn attribute_replaced(&self, _client: &ClientId, _name: &str, _old_value: &AttributeValue) {}

    /// An attribute was unbound.
    fn attribute_removed(&self, _client: &ClientId, _name: &str, _value: &AttributeValue) {}
}

/// Observer of client lifecycle events.
pub trait ClientListener: Send + Sync {
    /// A client finished construction and is registered.
    fn client_created(&self, _client: &Arc<Client>) {}

    /// A client is being invalidated. Fired after its subscriptions are
    /// detached and before its attributes unbind.
    fn client_destroyed(&self, _client: &Arc<Client>) {}
}

// ---------------------------------------------------------------------------
// AsyncPollTask
// ---------------------------------------------------------------------------

/// One parked async long poll.
///
/// Completion is single-shot: data arrival, timer expiry, subscription
/// teardown, and invalidation all race to complete the task, and whichever
/// gets there first delivers the result. The task holds only non-owning
/// references back to its queue and session, so a completed or abandoned
/// task keeps nothing alive.
pub struct AsyncPollTask {
    self_ref: Weak<AsyncPollTask>,
    client: ClientId,
    channel: ChannelId,
    session: Weak<Session>,
    queue: Weak<OutboundQueue>,
    handler: Arc<dyn AsyncPollHandler>,
    timer: Mutex<Option<TimerHandle>>,
    completed: AtomicBool,
}

impl AsyncPollTask {
    fn new(
        client: ClientId,
        channel: ChannelId,
        session: &Arc<Session>,
        queue: &Arc<OutboundQueue>,
        handler: Arc<dyn AsyncPollHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            client,
            channel,
            session: Arc::downgrade(session),
            queue: Arc::downgrade(queue),
            handler,
            timer: Mutex::new(None),
            completed: AtomicBool::new(false),
        })
    }

    /// The client that parked this poll.
    #[must_use]
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// The channel the poll targets.
    #[must_use]
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Whether the poll already completed through some path.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn set_timer(&self, handle: TimerHandle) {
        let mut timer = self.timer.lock();
        if self.completed.load(Ordering::Acquire) {
            // Lost the race against an immediate completion.
            handle.cancel();
        } else {
            *timer = Some(handle);
        }
    }

    /// Completes the poll: cancels the timer, releases the queue and session
    /// slots (identity-guarded against newer polls), and invokes the
    /// handler. Later calls are no-ops.
    pub(crate) fn complete(&self, result: PollResult) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.timer.lock().take() {
            handle.cancel();
        }
        let this = self.self_ref.upgrade();
        if let (Some(queue), Some(this)) = (self.queue.upgrade(), this.as_ref()) {
            let mut state = queue.state.lock();
            if state
                .async_poll
                .as_ref()
                .is_some_and(|parked| Arc::ptr_eq(parked, this))
            {
                state.async_poll = None;
            }
        }
        if let (Some(session), Some(this)) = (self.session.upgrade(), this.as_ref()) {
            session.clear_async_poll(&self.channel, this);
        }
        self.handler.poll_complete(result);
    }
}

impl std::fmt::Debug for AsyncPollTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPollTask")
            .field("client", &self.client)
            .field("channel", &self.channel)
            .field("completed", &self.is_completed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct ClientState {
    valid: bool,
    /// Breaks re-entry cycles during invalidation.
    invalidating: bool,
    last_use: Instant,
    idle_timer: Option<TimerHandle>,
    attributes: HashMap<String, AttributeValue>,
    sessions: Vec<Arc<Session>>,
    subscriptions: Vec<Arc<Subscription>>,
    outbound_queues: HashMap<ChannelId, Arc<OutboundQueue>>,
    push_handlers: HashMap<ChannelId, Arc<dyn PushHandler>>,
}

enum FlushKind {
    Push,
    Poll,
}

/// A remote client application instance registered on the server.
pub struct Client {
    self_ref: Weak<Client>,
    id: ClientId,
    registry: Weak<RegistryShared>,
    state: Mutex<ClientState>,
    attribute_listeners: RwLock<Vec<Arc<dyn ClientAttributeListener>>>,
    destroy_listeners: RwLock<Vec<Arc<dyn ClientListener>>>,
}

impl Client {
    pub(crate) fn new(id: ClientId, registry: Weak<RegistryShared>) -> Arc<Self> {
        tracing::debug!(client = %id, "client created");
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            id,
            registry,
            state: Mutex::new(ClientState {
                valid: true,
                invalidating: false,
                last_use: Instant::now(),
                idle_timer: None,
                attributes: HashMap::new(),
                sessions: Vec::new(),
                subscriptions: Vec::new(),
                outbound_queues: HashMap::new(),
                push_handlers: HashMap::new(),
            }),
            attribute_listeners: RwLock::new(Vec::new()),
            destroy_listeners: RwLock::new(Vec::new()),
        })
    }

    /// The client's unique id.
    #[must_use]
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Whether the client is still valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    pub(crate) fn is_invalidating(&self) -> bool {
        self.state.lock().invalidating
    }

    pub(crate) fn touch(&self) {
        self.state.lock().last_use = Instant::now();
    }

    pub(crate) fn set_idle_timer(&self, handle: TimerHandle) {
        let mut state = self.state.lock();
        if let Some(previous) = state.idle_timer.replace(handle) {
            previous.cancel();
        }
    }

    fn check_valid(&self, state: &ClientState) -> Result<(), Error> {
        if state.valid {
            Ok(())
        } else {
            Err(Error::ClientInvalidated {
                client: self.id.clone(),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Attributes & listeners
    // -----------------------------------------------------------------------

    /// Binds `value` under `name`, displacing any previous binding.
    pub fn set_attribute(
        &self,
        name: impl Into<String>,
        value: AttributeValue,
    ) -> Result<(), Error> {
        let name = name.into();
        let old = {
            let mut state = self.state.lock();
            self.check_valid(&state)?;
            state.last_use = Instant::now();
            state.attributes.insert(name.clone(), Arc::clone(&value))
        };
        // Listener dispatch happens outside the client lock.
        let listeners = self.attribute_listeners.read().clone();
        for listener in &listeners {
            match &old {
                Some(old_value) => listener.attribute_replaced(&self.id, &name, old_value),
                None => listener.attribute_added(&self.id, &name, &value),
            }
        }
        Ok(())
    }

    /// Returns the value bound under `name`, if any.
    pub fn get_attribute(&self, name: &str) -> Result<Option<AttributeValue>, Error> {
        let mut state = self.state.lock();
        self.check_valid(&state)?;
        state.last_use = Instant::now();
        Ok(state.attributes.get(name).cloned())
    }

    /// Snapshot of all bound attribute names.
    pub fn attribute_names(&self) -> Result<Vec<String>, Error> {
        let mut state = self.state.lock();
        self.check_valid(&state)?;
        state.last_use = Instant::now();
        Ok(state.attributes.keys().cloned().collect())
    }

    /// Unbinds `name`, returning the displaced value.
    pub fn remove_attribute(&self, name: &str) -> Result<Option<AttributeValue>, Error> {
        let removed = {
            let mut state = self.state.lock();
            self.check_valid(&state)?;
            state.last_use = Instant::now();
            state.attributes.remove(name)
        };
        if let Some(value) = &removed {
            let listeners = self.attribute_listeners.read().clone();
            for listener in &listeners {
                listener.attribute_removed(&self.id, name, value);
            }
        }
        Ok(removed)
    }

    /// Registers an attribute listener.
    pub fn add_attribute_listener(&self, listener: Arc<dyn ClientAttributeListener>) {
        self.attribute_listeners.write().push(listener);
    }

    /// Registers a listener notified when this client is invalidated.
    pub fn add_destroy_listener(&self, listener: Arc<dyn ClientListener>) {
        self.destroy_listeners.write().push(listener);
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Associates a transport session with this client and back-registers
    /// the client on the session. Re-registration is a no-op.
    pub fn register_session(&self, session: &Arc<Session>) {
        let added = {
            let mut state = self.state.lock();
            if state
                .sessions
                .iter()
                .any(|existing| Arc::ptr_eq(existing, session))
            {
                false
            } else {
                state.sessions.push(Arc::clone(session));
                true
            }
        };
        if added {
            session.register_client(&self.id);
        }
    }

    /// Disassociates a session. A client whose last session goes away is
    /// invalidated: no remaining connection means no way to reach it.
    pub fn unregister_session(&self, session: &Arc<Session>) {
        let (removed, none_left) = {
            let mut state = self.state.lock();
            let before = state.sessions.len();
            state
                .sessions
                .retain(|existing| !Arc::ptr_eq(existing, session));
            (state.sessions.len() != before, state.sessions.is_empty())
        };
        if removed {
            session.unregister_client(&self.id);
            if none_left {
                self.invalidate();
            }
        }
    }

    /// Number of currently associated sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    // -----------------------------------------------------------------------
    // Subscriptions & queue lifecycle
    // -----------------------------------------------------------------------

    /// Registers a subscription, creating the channel's outbound queue on
    /// first use or bumping its subscriber count otherwise.
    pub fn register_subscription(&self, subscription: &Arc<Subscription>) -> Result<(), Error> {
        let mut state = self.state.lock();
        self.check_valid(&state)?;
        if state
            .subscriptions
            .iter()
            .any(|existing| Arc::ptr_eq(existing, subscription))
        {
            return Ok(());
        }
        state.subscriptions.push(Arc::clone(subscription));
        state.last_use = Instant::now();

        let channel = subscription.channel().clone();
        let push_session = subscription
            .session()
            .filter(|session| session.is_push_supported());
        match state.outbound_queues.get(&channel) {
            Some(queue) => {
                let mut queue_state = queue.state.lock();
                queue_state.subscriber_refs += 1;
                // Resubscribes after connectivity loss may arrive over the
                // same channel but on a new session.
                if let Some(session) = &push_session {
                    queue_state.push_session = Some(Arc::downgrade(session));
                }
            }
            None => {
                let processor: Box<dyn crate::processor::OutboundQueueProcessor> =
                    match self.registry.upgrade() {
                        Some(registry) => registry.create_processor(&self.id, &channel),
                        None => Box::new(crate::processor::DefaultOutboundQueueProcessor::new()),
                    };
                let queue = OutboundQueue::new(
                    self.id.clone(),
                    channel.clone(),
                    processor,
                    push_session.as_ref().map(Arc::downgrade),
                );
                let _ = state.outbound_queues.insert(channel.clone(), queue);
            }
        }

        if let Some(handler) = state.push_handlers.get(&channel).cloned() {
            handler.register_subscription(subscription);
        }
        Ok(())
    }

    /// Unregisters a subscription and reclaims its queue when possible.
    ///
    /// The queue is removed once its subscriber count reaches zero and it is
    /// empty (or the owning channel is known disconnected); otherwise a
    /// pending poll or scheduled flush finishes the cleanup later.
    pub fn unregister_subscription(&self, subscription: &Arc<Subscription>) {
        let mut state = self.state.lock();
        let before = state.subscriptions.len();
        state
            .subscriptions
            .retain(|existing| !Arc::ptr_eq(existing, subscription));
        if state.subscriptions.len() == before {
            return;
        }

        let channel = subscription.channel();
        let mut completion: Option<(Arc<AsyncPollTask>, PollResult)> = None;
        if let Some(queue) = state.outbound_queues.get(channel).cloned() {
            {
                let mut queue_guard = queue.state.lock();
                let queue_state = &mut *queue_guard;
                queue_state.subscriber_refs = queue_state.subscriber_refs.saturating_sub(1);

                if let Some(throttle) = queue_state.processor.throttle_manager().cloned() {
                    throttle.unregister_all_subscriptions(subscription.destination());
                }

                // Unless the remote client is still being told about the
                // invalidation, its undelivered messages are dead weight.
                if !subscription.is_attempting_invalidation_notification() {
                    queue_state
                        .messages
                        .retain(|message| message.subscription != *subscription.id());
                }

                if queue_state.subscriber_refs == 0
                    && (queue_state.messages.is_empty() || subscription.is_channel_disconnected())
                {
                    if let Some(task) = queue_state.async_poll.take() {
                        let flush = match queue_state.processor.flush(&mut queue_state.messages) {
                            Ok(flush) => flush,
                            Err(source) => {
                                tracing::error!(
                                    client = %self.id,
                                    channel = %channel,
                                    error = %source,
                                    "flush during unsubscribe failed"
                                );
                                FlushResult::empty()
                            }
                        };
                        let mut result = PollResult::from(flush);
                        // Suppress the remote client's next doomed poll by
                        // telling it the subscription is gone.
                        if !subscription.is_attempting_invalidation_notification() {
                            result
                                .messages
                                .push(Message::subscription_invalidate(subscription.id().clone()));
                        }
                        completion = Some((task, result));
                    }
                    if state
                        .outbound_queues
                        .get(channel)
                        .is_some_and(|current| Arc::ptr_eq(current, &queue))
                    {
                        let _ = state.outbound_queues.remove(channel);
                    }
                }
            }
            // Wake any thread parked on this queue; its subscription may be
            // the one that just went away.
            queue.available.notify_all();
        }

        if let Some(handler) = state.push_handlers.get(channel).cloned() {
            handler.unregister_subscription(subscription);
        }
        drop(state);

        if let Some((task, result)) = completion {
            task.complete(result);
        }
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Snapshot of the registered subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.state.lock().subscriptions.clone()
    }

    pub(crate) fn has_subscription_on(&self, channel: &ChannelId) -> bool {
        self.state
            .lock()
            .subscriptions
            .iter()
            .any(|subscription| subscription.channel() == channel)
    }

    /// The outbound queue for `channel`, if one exists right now.
    #[must_use]
    pub fn queue(&self, channel: &ChannelId) -> Option<Arc<OutboundQueue>> {
        self.state.lock().outbound_queues.get(channel).cloned()
    }

    // -----------------------------------------------------------------------
    // Push handlers
    // -----------------------------------------------------------------------

    /// Registers the channel's push handler. At most one handler may be
    /// registered per channel.
    pub fn register_push_handler(
        &self,
        channel: ChannelId,
        handler: Arc<dyn PushHandler>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.push_handlers.contains_key(&channel) {
            return Err(Error::PushHandlerAlreadyRegistered {
                client: self.id.clone(),
                channel,
            });
        }
        let _ = state.push_handlers.insert(channel, handler);
        Ok(())
    }

    /// Unregisters `handler` from `channel` if it is the one registered.
    pub fn unregister_push_handler(&self, channel: &ChannelId, handler: &Arc<dyn PushHandler>) {
        let mut state = self.state.lock();
        if state
            .push_handlers
            .get(channel)
            .is_some_and(|registered| Arc::ptr_eq(registered, handler))
        {
            let _ = state.push_handlers.remove(channel);
        }
    }

    /// The push handler registered for `channel`, if any.
    #[must_use]
    pub fn push_handler(&self, channel: &ChannelId) -> Option<Arc<dyn PushHandler>> {
        self.state.lock().push_handlers.get(channel).cloned()
    }

    // -----------------------------------------------------------------------
    // Poll protocols
    // -----------------------------------------------------------------------

    /// Immediate poll: returns buffered and freshly flushed messages for
    /// `channel`, or `None` when nothing is pending.
    pub fn poll(&self, channel: &ChannelId) -> Result<Option<FlushResult>, Error> {
        {
            let mut state = self.state.lock();
            self.check_valid(&state)?;
            if let Some(queue) = state.outbound_queues.get(channel).cloned() {
                return self.internal_poll_locked(&mut state, &queue);
            }
        }
        Err(self.not_subscribed_error(channel))
    }

    /// Receive-style poll scoped to one subscription's messages. The next
    /// flush wait hint is meaningless for caller-driven receives and is
    /// always cleared.
    pub fn poll_subscription(&self, subscription: &Subscription) -> Result<FlushResult, Error> {
        {
            let mut state = self.state.lock();
            self.check_valid(&state)?;
            if let Some(queue) = state.outbound_queues.get(subscription.channel()).cloned() {
                let mut flush =
                    self.internal_flush_locked(&mut state, &queue, Some(subscription), true)?;
                flush.next_flush_wait = None;
                return Ok(flush);
            }
        }
        Err(self.not_subscribed_error(subscription.channel()))
    }

    /// Async long poll: answers immediately when data is buffered, otherwise
    /// parks a task completed by the next push, the timer, or teardown.
    ///
    /// Returns the parked task handle, or `None` when the handler was
    /// invoked synchronously (data available, or the request collided with
    /// an already-parked poll from this client and was suppressed). A
    /// `wait` of zero parks the task with no deadline.
    ///
    /// At most one poll may be parked per (session, channel): a second
    /// client sharing the session displaces the first poll, completing it
    /// early with the avoid-busy-polling flag.
    pub fn poll_async(
        &self,
        channel: &ChannelId,
        session: &Arc<Session>,
        handler: Arc<dyn AsyncPollHandler>,
        wait: Duration,
    ) -> Result<Option<Arc<AsyncPollTask>>, Error> {
        let mut state = self.state.lock();
        self.check_valid(&state)?;
        let Some(queue) = state.outbound_queues.get(channel).cloned() else {
            drop(state);
            return Err(self.not_subscribed_error(channel));
        };

        // Data already buffered: flush and answer on the calling thread.
        if !queue.state.lock().messages.is_empty() {
            let flush = self.internal_flush_locked(&mut state, &queue, None, true)?;
            drop(state);
            handler.poll_complete(PollResult::from(flush));
            return Ok(None);
        }

        // Avoid monopolizing the shared connection: one parked poll per
        // (session, channel).
        if let Some(parked) = session.parked_async_poll(channel) {
            if parked.client() == &self.id {
                drop(state);
                handler.poll_complete(PollResult::suppressed());
                return Ok(None);
            }
            // A different client shares the session; complete its poll early
            // and let the new request take the slot.
            parked.complete(PollResult::busy_poll_swap());
        }

        let task = AsyncPollTask::new(
            self.id.clone(),
            channel.clone(),
            session,
            &queue,
            handler,
        );
        session.park_async_poll(channel.clone(), Arc::clone(&task));
        queue.state.lock().async_poll = Some(Arc::clone(&task));
        if !wait.is_zero() {
            if let Some(registry) = self.registry.upgrade() {
                let handle = registry.timeouts().schedule(
                    wait,
                    TimerTask::AsyncPollTimeout {
                        task: Arc::downgrade(&task),
                    },
                );
                task.set_timer(handle);
            }
        }
        Ok(Some(task))
    }

    /// Blocking wait poll: answers immediately when data is buffered,
    /// otherwise suspends the calling thread on the queue's condition
    /// variable until data arrives, the wait times out (`None` waits
    /// forever), or poll coordination wakes it.
    ///
    /// Returns a suppressed no-op result when this client already has a
    /// wait parked on the same (session, channel). Collisions with a
    /// *different* client's wait are left alone -- a blocked thread cannot
    /// be completed out of band the way a parked async poll can.
    pub fn poll_with_wait(
        &self,
        channel: &ChannelId,
        session: &Arc<Session>,
        listener: Option<&dyn PollWaitListener>,
        wait: Option<Duration>,
    ) -> Result<Option<PollResult>, Error> {
        let queue = {
            let mut state = self.state.lock();
            self.check_valid(&state)?;
            let Some(queue) = state.outbound_queues.get(channel).cloned() else {
                drop(state);
                return Err(self.not_subscribed_error(channel));
            };
            if let Some(flush) = self.internal_poll_locked(&mut state, &queue)? {
                return Ok(Some(PollResult::from(flush)));
            }
            queue
        };

        // The queue was empty; coordinate the wait through the session.
        if let Some(waiting_queue) = session.wait_monitor(channel) {
            if waiting_queue.client() == &self.id {
                return Ok(Some(PollResult::suppressed()));
            }
            // A different client's blocked wait is not displaced; the slot
            // just moves to the most recent waiter.
        }
        session.set_wait_monitor(channel.clone(), Arc::clone(&queue));

        let mut avoid_busy_polling = false;
        {
            let mut queue_state = queue.state.lock();
            if queue_state.messages.is_empty() {
                tracing::debug!(client = %self.id, channel = %channel, "waiting for messages to arrive");
                queue_state.waiting = true;
                if let Some(listener) = listener {
                    listener.wait_start(&queue);
                }
                let deadline = wait.map(|duration| Instant::now() + duration);
                // Re-check the predicate after every wake: pushes, busy-poll
                // releases, and unsubscribes all signal the same condvar.
                while queue_state.messages.is_empty()
                    && !queue_state.avoid_busy_polling
                    && queue_state.subscriber_refs > 0
                {
                    match deadline {
                        Some(deadline) => {
                            if queue
                                .available
                                .wait_until(&mut queue_state, deadline)
                                .timed_out()
                            {
                                break;
                            }
                        }
                        None => queue.available.wait(&mut queue_state),
                    }
                }
                queue_state.waiting = false;
                if let Some(listener) = listener {
                    listener.wait_end(&queue);
                }
                if queue_state.avoid_busy_polling {
                    avoid_busy_polling = true;
                    queue_state.avoid_busy_polling = false;
                }
            }
        }
        session.clear_wait_monitor(channel, &queue);

        // Flush under the client lock, like any other poll.
        let flush = {
            let mut state = self.state.lock();
            self.internal_flush_locked(&mut state, &queue, None, true)?
        };
        let mut result = PollResult::from(flush);
        result.avoid_busy_polling = avoid_busy_polling;
        Ok(Some(result))
    }

    // -----------------------------------------------------------------------
    // Push delivery
    // -----------------------------------------------------------------------

    /// Buffers `message` for `subscription` and delivers it as the queue's
    /// state allows: by completing a parked async poll, by direct push over
    /// a push-capable session or handler, or by leaving it for the next
    /// poll. A no-op when the client is invalid or the queue is gone.
    pub fn push(&self, message: Message, subscription: &Subscription) -> Result<(), Error> {
        let mut state = self.state.lock();
        if !state.valid {
            return Ok(());
        }
        let Some(queue) = state.outbound_queues.get(subscription.channel()).cloned() else {
            // All subscriptions funneling through the queue are gone.
            return Ok(());
        };

        let (non_empty, parked) = {
            let mut queue_guard = queue.state.lock();
            let queue_state = &mut *queue_guard;
            if let Err(source) = queue_state.processor.add(&mut queue_state.messages, message) {
                tracing::error!(
                    client = %self.id,
                    channel = %queue.channel(),
                    error = %source,
                    "failed to add a message to an outbound queue"
                );
                return Err(Error::QueueProcessor {
                    client: self.id.clone(),
                    message: source.message,
                });
            }
            tracing::debug!(
                client = %self.id,
                channel = %queue.channel(),
                subscription = %subscription.id(),
                depth = queue_state.messages.len(),
                "queued outbound message"
            );
            let non_empty = !queue_state.messages.is_empty();
            if non_empty && queue_state.waiting {
                state.last_use = Instant::now();
                queue.available.notify_all();
            }
            (non_empty, queue_state.async_poll.clone())
        };

        if non_empty {
            if let Some(task) = parked {
                let flush = self.internal_flush_locked(&mut state, &queue, None, true)?;
                task.complete(PollResult::from(flush));
            } else {
                let (push_capable, flush_scheduled) = {
                    let queue_state = queue.state.lock();
                    let has_push_session = queue_state
                        .push_session
                        .as_ref()
                        .is_some_and(|session| session.strong_count() > 0);
                    (
                        has_push_session
                            || state.push_handlers.contains_key(subscription.channel()),
                        queue_state.flush_task.is_some(),
                    )
                };
                if !flush_scheduled && push_capable {
                    self.direct_flush_locked(&mut state, &queue)?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Invalidation
    // -----------------------------------------------------------------------

    /// Invalidates the client and releases everything it owns. Idempotent;
    /// concurrent calls observe the `invalidating` guard and return.
    pub fn invalidate(&self) {
        {
            let mut state = self.state.lock();
            if !state.valid || state.invalidating {
                return;
            }
            state.invalidating = true;
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
        }
        // The only way to lose the self reference is a concurrent final
        // drop, in which case nobody can observe the client anymore.
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };

        // Leave the registry first so lookups under this id create a fresh
        // client instead of finding a corpse.
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_client(&this);
        }

        // Unregister from all sessions.
        let sessions = { self.state.lock().sessions.clone() };
        for session in &sessions {
            self.unregister_session(session);
        }

        // Detach subscriptions; this also reclaims queues where possible and
        // completes their parked polls.
        let subscriptions = { self.state.lock().subscriptions.clone() };
        for subscription in &subscriptions {
            self.unregister_subscription(subscription);
        }

        let destroy_listeners = self.destroy_listeners.read().clone();
        for listener in &destroy_listeners {
            listener.client_destroyed(&this);
        }

        // Unbind all attributes, firing removal notifications.
        let names = {
            let state = self.state.lock();
            state.attributes.keys().cloned().collect::<Vec<_>>()
        };
        for name in &names {
            let _ = self.remove_attribute(name);
        }

        // Close push handlers, telling the channels to drop the remote
        // connections.
        let handlers = {
            let mut state = self.state.lock();
            state
                .push_handlers
                .drain()
                .map(|(_, handler)| handler)
                .collect::<Vec<_>>()
        };
        for handler in handlers {
            handler.close(true);
        }

        // Drain whatever queues survived subscription teardown: complete
        // parked polls with nothing, wake blocked waiters, drop buffers.
        let queues = {
            let mut state = self.state.lock();
            state
                .outbound_queues
                .drain()
                .map(|(_, queue)| queue)
                .collect::<Vec<_>>()
        };
        for queue in queues {
            let parked = {
                let mut queue_state = queue.state.lock();
                queue_state.messages.clear();
                queue_state.flushed_between_polls.clear();
                if let Some(task) = queue_state.flush_task.take() {
                    task.cancel();
                }
                queue_state.async_poll.take()
            };
            if let Some(task) = parked {
                task.complete(PollResult::empty());
            }
            queue.available.notify_all();
        }

        {
            let mut state = self.state.lock();
            state.valid = false;
            state.invalidating = false;
        }
        tracing::debug!(client = %self.id, "client invalidated");
    }

    // -----------------------------------------------------------------------
    // Timer-driven entry points
    // -----------------------------------------------------------------------

    /// Fired by the shared timer: re-enter the direct-flush path.
    pub(crate) fn scheduled_flush_for_push(&self, channel: &ChannelId) {
        let mut state = self.state.lock();
        if !state.valid {
            return;
        }
        let Some(queue) = state.outbound_queues.get(channel).cloned() else {
            return;
        };
        // Failures were already logged inside the flush.
        let _ = self.direct_flush_locked(&mut state, &queue);
    }

    /// Fired by the shared timer: flush for a polling channel, handing the
    /// result to a parked async poll or buffering it for the next poll.
    pub(crate) fn scheduled_flush_for_poll(&self, channel: &ChannelId) {
        let mut state = self.state.lock();
        if !state.valid {
            return;
        }
        let Some(queue) = state.outbound_queues.get(channel).cloned() else {
            return;
        };
        // Drop our own task reference so a follow-up flush can be armed.
        queue.state.lock().flush_task = None;

        let Ok(flush) = self.internal_flush_locked(&mut state, &queue, None, true) else {
            return;
        };
        let next_wait = flush.next_flush_wait;
        if !flush.messages.is_empty() {
            let parked = queue.state.lock().async_poll.clone();
            match parked {
                Some(task) => task.complete(PollResult::from(flush)),
                None => queue
                    .state
                    .lock()
                    .flushed_between_polls
                    .extend(flush.messages),
            }
        }
        if let Some(wait) = next_wait {
            self.arm_flush_task(&queue, wait, FlushKind::Poll);
        }
    }

    /// Fired by the shared timer: decide whether the client genuinely went
    /// idle, rescheduling the check otherwise.
    pub(crate) fn idle_timeout_fired(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let timeout = registry.idle_timeout();
        if timeout.is_zero() {
            return;
        }
        let timed_out = {
            let mut state = self.state.lock();
            if !state.valid || state.invalidating {
                return;
            }
            let last_use = self.effective_last_use(&state, timeout);
            let idle = Instant::now().saturating_duration_since(last_use);
            if idle < timeout {
                let handle = registry.timeouts().schedule(
                    timeout - idle,
                    TimerTask::ClientIdleTimeout {
                        client: self.id.clone(),
                    },
                );
                if let Some(previous) = state.idle_timer.replace(handle) {
                    previous.cancel();
                }
                false
            } else {
                true
            }
        };
        if timed_out {
            tracing::debug!(client = %self.id, "idle timeout elapsed; invalidating client");
            self.invalidate();
        }
    }

    /// Effective last-use timestamp: idle time alone never times out a
    /// client that still holds an open path to the server (a parked async
    /// poll, a registered push handler, a connected push session, or a
    /// blocked wait poll).
    fn effective_last_use(&self, state: &ClientState, timeout: Duration) -> Instant {
        let now = Instant::now();
        if now.saturating_duration_since(state.last_use) < timeout {
            return state.last_use;
        }
        for (channel, queue) in &state.outbound_queues {
            if queue.state.lock().async_poll.is_some() {
                return now;
            }
            if state.push_handlers.contains_key(channel) {
                return now;
            }
        }
        for session in &state.sessions {
            if session.is_connected() {
                return now;
            }
            if session.holds_wait_for_client(&self.id) {
                return now;
            }
        }
        state.last_use
    }

    // -----------------------------------------------------------------------
    // Flush internals
    // -----------------------------------------------------------------------

    /// Drains `flushed_between_polls` ahead of a fresh flush, arming a
    /// delayed flush when the processor asks for one. Returns `None` when
    /// neither buffer produced messages.
    fn internal_poll_locked(
        &self,
        state: &mut ClientState,
        queue: &Arc<OutboundQueue>,
    ) -> Result<Option<FlushResult>, Error> {
        let mut messages = {
            let mut queue_state = queue.state.lock();
            std::mem::take(&mut queue_state.flushed_between_polls)
        };
        // Flush even when the queue looks empty so the processor sees every
        // incoming poll.
        let flush = self.internal_flush_locked(state, queue, None, true)?;
        messages.extend(flush.messages);
        if let Some(wait) = flush.next_flush_wait {
            self.arm_flush_task(queue, wait, FlushKind::Poll);
        }
        if messages.is_empty() {
            Ok(None)
        } else {
            Ok(Some(FlushResult {
                messages,
                next_flush_wait: None,
            }))
        }
    }

    /// Runs the queue processor's flush under the queue lock, reclaiming the
    /// queue afterwards if it became removable. Processor failures are
    /// logged with client context and rethrown.
    fn internal_flush_locked(
        &self,
        state: &mut ClientState,
        queue: &Arc<OutboundQueue>,
        subscription: Option<&Subscription>,
        update_last_use: bool,
    ) -> Result<FlushResult, Error> {
        let flush = {
            let mut queue_guard = queue.state.lock();
            let queue_state = &mut *queue_guard;
            let result = match subscription {
                Some(subscription) => queue_state
                    .processor
                    .flush_subscription(subscription.id(), &mut queue_state.messages),
                None => queue_state.processor.flush(&mut queue_state.messages),
            };
            let flush = match result {
                Ok(flush) => flush,
                Err(source) => {
                    tracing::error!(
                        client = %self.id,
                        channel = %queue.channel(),
                        error = %source,
                        "failed to flush an outbound queue"
                    );
                    return Err(Error::QueueProcessor {
                        client: self.id.clone(),
                        message: source.message,
                    });
                }
            };
            // Queue reclamation happens after every flush.
            if queue_state.subscriber_refs == 0 && queue_state.messages.is_empty() {
                if state
                    .outbound_queues
                    .get(queue.channel())
                    .is_some_and(|current| Arc::ptr_eq(current, queue))
                {
                    let _ = state.outbound_queues.remove(queue.channel());
                }
                queue.available.notify_all();
            }
            flush
        };
        if update_last_use && !flush.messages.is_empty() {
            state.last_use = Instant::now();
        }
        Ok(flush)
    }

    /// Flushes and writes directly to the channel's push session or push
    /// handler; used by `push` and by scheduled push flushes.
    fn direct_flush_locked(
        &self,
        state: &mut ClientState,
        queue: &Arc<OutboundQueue>,
    ) -> Result<(), Error> {
        if !state.valid {
            return Ok(());
        }
        // When invoked from a fired flush task this drops the task ref so a
        // follow-up delayed flush can be scheduled.
        {
            let mut queue_state = queue.state.lock();
            if let Some(task) = queue_state.flush_task.take() {
                task.cancel();
            }
        }

        let flush = self.internal_flush_locked(state, queue, None, false)?;
        if !flush.messages.is_empty() {
            let push_session = {
                let queue_state = queue.state.lock();
                queue_state.push_session.as_ref().and_then(Weak::upgrade)
            };
            if let Some(session) = push_session {
                // Update last use only when actually writing to a connected
                // client.
                if session.is_connected() {
                    state.last_use = Instant::now();
                }
                for message in flush.messages {
                    session.push(message);
                }
            } else if let Some(handler) = state.push_handlers.get(queue.channel()).cloned() {
                state.last_use = Instant::now();
                handler.push_messages(flush.messages);
            }
        }

        if let Some(wait) = flush.next_flush_wait {
            self.arm_flush_task(queue, wait, FlushKind::Push);
        }
        Ok(())
    }

    fn arm_flush_task(&self, queue: &Arc<OutboundQueue>, wait: Duration, kind: FlushKind) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let task = match kind {
            FlushKind::Push => TimerTask::ScheduledFlushForPush {
                client: self.id.clone(),
                channel: queue.channel().clone(),
            },
            FlushKind::Poll => TimerTask::ScheduledFlushForPoll {
                client: self.id.clone(),
                channel: queue.channel().clone(),
            },
        };
        let handle = registry.timeouts().schedule(wait, task);
        let mut queue_state = queue.state.lock();
        if let Some(previous) = queue_state.flush_task.replace(handle) {
            previous.cancel();
        }
    }

    /// Builds the not-subscribed error, upgrading the diagnostic when some
    /// other client sharing one of this client's sessions *is* subscribed
    /// over the channel -- the usual sign of a poll sent with a stale or
    /// wrong client id. Runs outside any lock so it can inspect other
    /// clients freely.
    fn not_subscribed_error(&self, channel: &ChannelId) -> Error {
        let sessions = { self.state.lock().sessions.clone() };
        if let Some(registry) = self.registry.upgrade() {
            for session in &sessions {
                for other_id in session.client_ids() {
                    if other_id == self.id {
                        continue;
                    }
                    let Some(other) = registry.lookup(&other_id) else {
                        continue;
                    };
                    if other.has_subscription_on(channel) {
                        return Error::NotSubscribedOtherClientMatch {
                            client: self.id.clone(),
                            channel: channel.clone(),
                        };
                    }
                }
            }
        }
        Error::NotSubscribed {
            client: self.id.clone(),
            channel: channel.clone(),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}
