// Copyright The Outbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Busy-poll avoidance across clients sharing one session.
//!
//! The async path swaps a different client's parked poll out; the blocking
//! path deliberately does not (a blocked thread cannot be completed out of
//! band). Both sides of the asymmetry are pinned down here.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use super::common::*;
use crate::client::PollWaitListener;
use crate::queue::OutboundQueue;
use crate::session::Session;

/// Scenario:
/// 1. Given clients A and B sharing one session, with A's long poll parked
///    on channel X.
/// 2. When B long-polls channel X over the same session.
/// 3. Then A's poll completes immediately flagged avoid-busy-polling and
///    B's poll is the one left parked.
#[test]
fn async_poll_swaps_out_other_clients_parked_poll() {
    let registry = registry();
    let session = Session::new(None);
    let client_a = client_on_session(&registry, "a", &session);
    let client_b = client_on_session(&registry, "b", &session);
    let sub_a = subscribe(&client_a, &session, "msg", "quotes");
    let sub_b = subscribe(&client_b, &session, "msg", "quotes");
    let handler_a = RecordingHandler::new();
    let handler_b = RecordingHandler::new();

    let task_a = client_a
        .poll_async(
            &channel("msg"),
            &session,
            handler_a.clone(),
            Duration::from_secs(30),
        )
        .expect("A's poll should succeed")
        .expect("A's poll should park");

    let task_b = client_b
        .poll_async(
            &channel("msg"),
            &session,
            handler_b.clone(),
            Duration::from_secs(30),
        )
        .expect("B's poll should succeed")
        .expect("B's poll should park");

    // A was swapped out with the back-off flag.
    assert!(task_a.is_completed());
    let results_a = handler_a.take();
    assert_eq!(results_a.len(), 1);
    assert!(results_a[0].avoid_busy_polling);
    assert!(results_a[0].messages.is_empty());

    // B now owns the slot: a push for B completes B's poll.
    assert!(!task_b.is_completed());
    client_b
        .push(data_message(&sub_b, "for-b"), &sub_b)
        .expect("push to B should succeed");
    assert!(task_b.is_completed());
    let results_b = handler_b.take();
    assert_eq!(bodies(&results_b[0].messages), vec![b"for-b".to_vec()]);

    // A's queue is still subscribed and intact for its next poll.
    client_a
        .push(data_message(&sub_a, "for-a"), &sub_a)
        .expect("push to A should succeed");
    let flushed = client_a
        .poll(&channel("msg"))
        .expect("A's poll should succeed")
        .expect("A's message should be buffered");
    assert_eq!(bodies(&flushed.messages), vec![b"for-a".to_vec()]);
}

struct WaitGate {
    started: mpsc::SyncSender<()>,
}

impl PollWaitListener for WaitGate {
    fn wait_start(&self, _queue: &OutboundQueue) {
        let _ = self.started.send(());
    }

    fn wait_end(&self, _queue: &OutboundQueue) {}
}

/// Scenario (the deliberate asymmetry):
/// 1. Given client A blocked in a wait poll on (session, channel X).
/// 2. When client B wait-polls the same (session, channel X).
/// 3. Then B's request is neither suppressed nor does it displace A: B
///    waits out its own (short) deadline and returns empty, while A stays
///    parked and still receives its message afterwards.
#[test]
fn wait_poll_does_not_displace_other_clients_wait() {
    let registry = registry();
    let session = Session::new(None);
    let client_a = client_on_session(&registry, "a", &session);
    let client_b = client_on_session(&registry, "b", &session);
    let sub_a = subscribe(&client_a, &session, "msg", "quotes");
    let _sub_b = subscribe(&client_b, &session, "msg", "quotes");

    // Park A's wait on its own thread.
    let (started_tx, started_rx) = mpsc::sync_channel(1);
    let (result_tx, result_rx) = mpsc::channel();
    {
        let client_a = Arc::clone(&client_a);
        let session = Arc::clone(&session);
        let _ = std::thread::spawn(move || {
            let gate = WaitGate { started: started_tx };
            let result = client_a
                .poll_with_wait(
                    &channel("msg"),
                    &session,
                    Some(&gate),
                    Some(Duration::from_secs(5)),
                )
                .expect("A's wait poll should not error");
            let _ = result_tx.send(result);
        });
    }
    started_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("A's wait should start");

    // B's colliding wait: not suppressed (different client), not swapped --
    // it just runs its own bounded wait and comes back empty.
    let result_b = client_b
        .poll_with_wait(
            &channel("msg"),
            &session,
            None,
            Some(Duration::from_millis(80)),
        )
        .expect("B's wait poll should succeed")
        .expect("B's wait poll should return a result");
    assert!(!result_b.client_processing_suppressed);
    assert!(result_b.messages.is_empty());

    // A is still parked and still gets its data.
    client_a
        .push(data_message(&sub_a, "for-a"), &sub_a)
        .expect("push should succeed");
    let result_a = result_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("A's wait should finish")
        .expect("A's wait should return a result");
    assert_eq!(bodies(&result_a.messages), vec![b"for-a".to_vec()]);
}
