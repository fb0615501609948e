//! Event stream bridge: lifecycle, reconnects and exactly-once delivery.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Harness, id, movie, wait_for};
use ferrex_sync::model::{RealtimeEvent, StreamFrame};
use ferrex_sync::realtime::StreamError;
use ferrex_sync::store::LocalStore;
use ferrex_sync::testing::StreamScript;
use ferrex_sync::{AccessToken, ConnectionState};

fn frame(event_id: &str, event: RealtimeEvent) -> StreamFrame {
    StreamFrame::new(Some(event_id.to_string()), event)
}

fn progress(raw: &str, position_ticks: i64) -> RealtimeEvent {
    RealtimeEvent::Progress {
        entity_id: id(raw),
        position_ticks,
    }
}

fn stop(raw: &str, position_ticks: i64) -> RealtimeEvent {
    RealtimeEvent::Stop {
        entity_id: id(raw),
        position_ticks,
    }
}

fn library_changed() -> RealtimeEvent {
    RealtimeEvent::LibraryChanged {
        added: Vec::new(),
        updated: Vec::new(),
        removed: Vec::new(),
    }
}

fn auth_rejected() -> StreamError {
    StreamError::Auth("401 Unauthorized".to_string())
}

/// Refresh callback handing out "t1", "t2", ...
async fn install_refresher(h: &Harness) -> Arc<AtomicUsize> {
    let issued = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&issued);
    h.credentials
        .set_refresh_callback(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(AccessToken::new(format!("t{n}"))) }
        })
        .await;
    issued
}

#[tokio::test(start_paused = true)]
async fn replayed_frames_are_delivered_once_across_reconnects() {
    let h = Harness::with_scripts(vec![
        StreamScript::frames([frame("1", progress("e1", 500)), frame("2", stop("e1", 900))]),
        StreamScript::Hold(vec![frame("2", stop("e1", 900)), frame("3", library_changed())]),
    ]);
    h.api.add_item(movie("e1", "Pilot", "lib1", 1));
    h.api.set_resume(vec![id("e1")]);
    h.orchestrator().get_resume_items(&h.user, 5, false).await;

    let mut events = h.bridge().subscribe();
    h.bridge().start(h.user.clone());

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("event delivered")
            .expect("channel open");
        received.push(event);
    }
    assert_eq!(
        received,
        vec![progress("e1", 500), stop("e1", 900), library_changed()]
    );
    assert!(events.try_recv().is_err());

    let attempts = h.events.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].last_event_id, None);
    assert_eq!(attempts[1].last_event_id.as_deref(), Some("2"));

    let resume = &h.orchestrator().services().resume;
    assert_eq!(resume.snapshot(5)[0].user_data.playback_position_ticks, 900);
    assert!(resume.is_stale());
    let row = h.store.get_item(&h.user, &id("e1")).await.unwrap().unwrap();
    assert_eq!(row.user_data.playback_position_ticks, 900);

    h.bridge().stop().await;
}

#[tokio::test(start_paused = true)]
async fn auth_rejection_refreshes_once_and_reconnects() {
    let h = Harness::with_scripts(vec![StreamScript::Reject(auth_rejected())]);
    h.credentials.set_token(Some(AccessToken::new("t0"))).await;
    install_refresher(&h).await;

    let mut state = h.bridge().watch_state();
    h.bridge().start(h.user.clone());
    wait_for(&mut state, |s| *s == ConnectionState::Connected).await;

    let tokens: Vec<_> = h.events.attempts().into_iter().map(|a| a.token).collect();
    assert_eq!(tokens, vec![Some("t0".to_string()), Some("t1".to_string())]);
    assert_eq!(h.credentials.refresh_count(), 1);

    h.bridge().stop().await;
}

#[tokio::test(start_paused = true)]
async fn second_consecutive_auth_rejection_fails() {
    let h = Harness::with_scripts(vec![
        StreamScript::Reject(auth_rejected()),
        StreamScript::Reject(auth_rejected()),
    ]);
    h.credentials.set_token(Some(AccessToken::new("t0"))).await;
    install_refresher(&h).await;

    let mut state = h.bridge().watch_state();
    h.bridge().start(h.user.clone());
    let failed = wait_for(&mut state, |s| matches!(s, ConnectionState::Failed { .. })).await;

    assert!(matches!(
        failed,
        ConnectionState::Failed { reason } if reason.contains("authorization")
    ));
    assert_eq!(h.events.attempts().len(), 2);
    assert_eq!(h.credentials.refresh_count(), 1);
    assert!(!h.bridge().is_running());
}

#[tokio::test(start_paused = true)]
async fn delivered_frames_reset_the_auth_refresh_allowance() {
    let h = Harness::with_scripts(vec![
        StreamScript::Frames(vec![Ok(frame("1", library_changed())), Err(auth_rejected())]),
        StreamScript::Frames(vec![Ok(frame("2", library_changed())), Err(auth_rejected())]),
    ]);
    h.credentials.set_token(Some(AccessToken::new("t0"))).await;
    install_refresher(&h).await;

    let mut events = h.bridge().subscribe();
    let mut state = h.bridge().watch_state();
    h.bridge().start(h.user.clone());

    events.recv().await.unwrap();
    events.recv().await.unwrap();
    wait_for(&mut state, |s| *s == ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.events.attempts().len(), 3);
    assert_eq!(h.credentials.refresh_count(), 2);
    assert_eq!(h.bridge().state(), ConnectionState::Connected);

    h.bridge().stop().await;
}

#[tokio::test(start_paused = true)]
async fn transport_failures_back_off_until_retries_run_out() {
    let retries = common::config().realtime.max_retries as usize;
    let scripts = (0..=retries)
        .map(|_| StreamScript::Reject(StreamError::Transport("connection refused".into())))
        .collect();
    let h = Harness::with_scripts(scripts);

    let mut state = h.bridge().watch_state();
    let started = tokio::time::Instant::now();
    h.bridge().start(h.user.clone());

    let mut saw_reconnecting = false;
    let failed = wait_for(&mut state, |s| {
        saw_reconnecting |= matches!(s, ConnectionState::Reconnecting { .. });
        matches!(s, ConnectionState::Failed { .. })
    })
    .await;

    assert!(matches!(failed, ConnectionState::Failed { .. }));
    assert!(saw_reconnecting);
    assert_eq!(h.events.attempts().len(), retries + 1);
    // 1 + 2 + 4 + 8 + 16 + 30 * 5 seconds of backoff
    assert!(started.elapsed() >= Duration::from_secs(181));
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent_and_stop_is_safe_to_repeat() {
    let h = Harness::new();
    let mut state = h.bridge().watch_state();

    h.bridge().start(h.user.clone());
    h.bridge().start(h.user.clone());
    wait_for(&mut state, |s| *s == ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.events.attempts().len(), 1);

    h.bridge().stop().await;
    assert_eq!(h.bridge().state(), ConnectionState::Stopped);
    h.bridge().stop().await;
    assert_eq!(h.bridge().state(), ConnectionState::Stopped);
    assert!(!h.bridge().is_running());

    h.bridge().start(h.user.clone());
    wait_for(&mut state, |s| *s == ConnectionState::Connected).await;
    assert_eq!(h.events.attempts().len(), 2);
    h.bridge().stop().await;
}
