// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Blocking wait-poll scenarios. These suspend real threads; every wait is
//! bounded so a regression cannot hang the suite.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use super::common::*;
use crate::client::PollWaitListener;
use crate::queue::OutboundQueue;
use crate::session::Session;
use crate::types::PollResult;

/// Listener that signals the instant the wait actually starts, so tests can
/// order their next step after the thread is parked.
struct WaitGate {
    started: mpsc::SyncSender<()>,
}

impl PollWaitListener for WaitGate {
    fn wait_start(&self, _queue: &OutboundQueue) {
        let _ = self.started.send(());
    }

    fn wait_end(&self, _queue: &OutboundQueue) {}
}

/// Parks `client` in a wait poll on another thread and returns (started
/// receiver, result receiver).
fn park_wait_poll(
    client: &Arc<crate::client::Client>,
    session: &Arc<Session>,
    channel_id: &str,
    wait: Option<Duration>,
) -> (mpsc::Receiver<()>, mpsc::Receiver<Option<PollResult>>) {
    let (started_tx, started_rx) = mpsc::sync_channel(1);
    let (result_tx, result_rx) = mpsc::channel();
    let client = Arc::clone(client);
    let session = Arc::clone(session);
    let channel_id = channel(channel_id);
    let _ = std::thread::spawn(move || {
        let gate = WaitGate { started: started_tx };
        let result = client
            .poll_with_wait(&channel_id, &session, Some(&gate), wait)
            .expect("wait poll should not error");
        let _ = result_tx.send(result);
    });
    (started_rx, result_rx)
}

/// Scenario:
/// 1. Given a queue with a buffered message.
/// 2. When a wait poll arrives.
/// 3. Then it answers immediately without blocking.
#[test]
fn wait_poll_answers_immediately_when_data_buffered() {
    let registry = registry();
    let session = Session::new(None);
    let client = client_on_session(&registry, "c1", &session);
    let subscription = subscribe(&client, &session, "msg", "quotes");
    client
        .push(data_message(&subscription, "ready"), &subscription)
        .expect("push");

    let result = client
        .poll_with_wait(&channel("msg"), &session, None, Some(Duration::from_secs(5)))
        .expect("wait poll should succeed")
        .expect("wait poll should return a result");

    assert_eq!(bodies(&result.messages), vec![b"ready".to_vec()]);
}

/// Scenario:
/// 1. Given a thread blocked in a wait poll on an empty queue.
/// 2. When a message is pushed.
/// 3. Then the thread wakes and returns the message.
#[test]
fn wait_poll_woken_by_push() {
    let registry = registry();
    let session = Session::new(None);
    let client = client_on_session(&registry, "c1", &session);
    let subscription = subscribe(&client, &session, "msg", "quotes");

    let (started, result) =
        park_wait_poll(&client, &session, "msg", Some(Duration::from_secs(5)));
    started
        .recv_timeout(Duration::from_secs(2))
        .expect("wait should start");

    client
        .push(data_message(&subscription, "wake"), &subscription)
        .expect("push should succeed");

    let result = result
        .recv_timeout(Duration::from_secs(2))
        .expect("wait poll should finish")
        .expect("wait poll should return a result");
    assert_eq!(bodies(&result.messages), vec![b"wake".to_vec()]);
    assert!(!result.avoid_busy_polling);
}

/// Scenario:
/// 1. Given a wait poll with a short deadline and no data.
/// 2. When the deadline elapses.
/// 3. Then the poll returns an empty result -- timeout is not an error.
#[test]
fn wait_poll_timeout_returns_empty_result() {
    let registry = registry();
    let session = Session::new(None);
    let client = client_on_session(&registry, "c1", &session);
    let _subscription = subscribe(&client, &session, "msg", "quotes");

    let result = client
        .poll_with_wait(
            &channel("msg"),
            &session,
            None,
            Some(Duration::from_millis(50)),
        )
        .expect("wait poll should succeed")
        .expect("wait poll should return a result");

    assert!(result.messages.is_empty());
    assert!(!result.avoid_busy_polling);
    assert!(!result.client_processing_suppressed);
}

/// Scenario:
/// 1. Given a thread of this client already blocked in a wait poll on the
///    (session, channel).
/// 2. When the same client issues another wait poll there.
/// 3. Then the second request returns a suppressed no-op instead of parking
///    a second wait.
#[test]
fn same_client_second_wait_is_suppressed() {
    let registry = registry();
    let session = Session::new(None);
    let client = client_on_session(&registry, "c1", &session);
    let subscription = subscribe(&client, &session, "msg", "quotes");

    let (started, parked_result) =
        park_wait_poll(&client, &session, "msg", Some(Duration::from_secs(5)));
    started
        .recv_timeout(Duration::from_secs(2))
        .expect("wait should start");

    let second = client
        .poll_with_wait(&channel("msg"), &session, None, Some(Duration::from_secs(5)))
        .expect("second wait poll should succeed")
        .expect("second wait poll should return a result");
    assert!(second.client_processing_suppressed);
    assert!(second.messages.is_empty());

    // Release the parked thread.
    client
        .push(data_message(&subscription, "done"), &subscription)
        .expect("push");
    let parked = parked_result
        .recv_timeout(Duration::from_secs(2))
        .expect("parked wait should finish")
        .expect("parked wait should return a result");
    assert_eq!(bodies(&parked.messages), vec![b"done".to_vec()]);
}

/// Scenario:
/// 1. Given a thread blocked in a wait poll.
/// 2. When the transport asks the session to release the wait (an excess
///    poll needs the connection).
/// 3. Then the thread wakes empty-handed with the avoid-busy-polling flag.
#[test]
fn released_wait_poll_reports_avoid_busy_polling() {
    let registry = registry();
    let session = Session::new(None);
    let client = client_on_session(&registry, "c1", &session);
    let _subscription = subscribe(&client, &session, "msg", "quotes");

    let (started, result) =
        park_wait_poll(&client, &session, "msg", Some(Duration::from_secs(5)));
    started
        .recv_timeout(Duration::from_secs(2))
        .expect("wait should start");

    assert!(session.release_wait_poll(&channel("msg")));

    let result = result
        .recv_timeout(Duration::from_secs(2))
        .expect("wait poll should finish")
        .expect("wait poll should return a result");
    assert!(result.avoid_busy_polling);
    assert!(result.messages.is_empty());
}

/// Scenario:
/// 1. Given a thread blocked in a wait poll.
/// 2. When the channel's last subscription unregisters.
/// 3. Then the thread wakes and returns empty instead of sleeping out its
///    full deadline.
#[test]
fn unsubscribe_wakes_waiting_poll() {
    let registry = registry();
    let session = Session::new(None);
    let client = client_on_session(&registry, "c1", &session);
    let subscription = subscribe(&client, &session, "msg", "quotes");

    let (started, result) =
        park_wait_poll(&client, &session, "msg", Some(Duration::from_secs(30)));
    started
        .recv_timeout(Duration::from_secs(2))
        .expect("wait should start");

    client.unregister_subscription(&subscription);

    let result = result
        .recv_timeout(Duration::from_secs(2))
        .expect("wait poll should finish promptly")
        .expect("wait poll should return a result");
    assert!(result.messages.is_empty());
}
