mod common;

use common::{connected_pool, flush, init_tracing, note, pool_with, ScriptedRelay};
use nostrpool::{
    AckPolicy, Error, FetchOptions, FetchPolicy, Filter, Note, RelayMessage, TrackerKind,
};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const A: &str = "wss://a.test/";
const B: &str = "wss://b.test/";

fn feed() -> Vec<Filter> {
    vec![Filter::new().kinds([1]).limit(10)]
}

// ==================== aggregation tests ====================

/// EOSE from one of two relays is partial, from both is everywhere
#[tokio::test]
async fn eose_is_aggregated_across_relays() {
    init_tracing();
    let a = ScriptedRelay::silent(A);
    let b = ScriptedRelay::silent(B);
    let pool = connected_pool(&[a.clone(), b.clone()]).await;

    let sub = pool.subscribe(feed());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let c = calls.clone();
    sub.on_eose(move |relay, everywhere| c.lock().unwrap().push((relay.to_owned(), everywhere)));
    sub.open().unwrap();
    flush(&pool).await;

    a.push(&RelayMessage::eose(sub.id().clone()));
    flush(&pool).await;
    assert_eq!(*calls.lock().unwrap(), vec![(A.to_owned(), false)]);

    b.push(&RelayMessage::eose(sub.id().clone()));
    flush(&pool).await;
    assert_eq!(
        *calls.lock().unwrap(),
        vec![(A.to_owned(), false), (B.to_owned(), true)]
    );
    assert!(sub.eose_everywhere());
}

/// A relay dropping mid-replay completes the EOSE aggregation once; its
/// EOSE after reconnecting is only partial
#[tokio::test(start_paused = true)]
async fn dropped_relay_completes_eose_once() {
    init_tracing();
    let a = ScriptedRelay::silent(A);
    let b = ScriptedRelay::silent(B);
    let pool = connected_pool(&[a.clone(), b.clone()]).await;

    let sub = pool.subscribe(feed());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let c = calls.clone();
    sub.on_eose(move |relay, everywhere| c.lock().unwrap().push((relay.to_owned(), everywhere)));
    sub.open().unwrap();
    flush(&pool).await;

    a.push(&RelayMessage::eose(sub.id().clone()));
    flush(&pool).await;
    b.drop_connection("restart");
    flush(&pool).await;
    assert_eq!(
        *calls.lock().unwrap(),
        vec![(A.to_owned(), false), (B.to_owned(), true)]
    );
    assert!(sub.eose_everywhere());

    tokio::time::sleep(Duration::from_secs(2)).await;
    flush(&pool).await;
    assert_eq!(b.connects(), 2);
    assert_eq!(b.reqs_for(sub.id()), 2);

    b.push(&RelayMessage::eose(sub.id().clone()));
    flush(&pool).await;
    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            (A.to_owned(), false),
            (B.to_owned(), true),
            (B.to_owned(), false),
        ]
    );
}

/// The same event from two relays is delivered once
#[tokio::test]
async fn events_are_deduplicated() {
    init_tracing();
    let shared = note("same", 1_700_000_000).await;
    let a = ScriptedRelay::new(A);
    let b = ScriptedRelay::new(B);
    a.store(vec![shared.clone()]);
    b.store(vec![shared.clone()]);
    let pool = connected_pool(&[a, b]).await;

    let sub = pool.subscribe_with(feed(), &TrackerKind::Naive);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    sub.on_event(move |note, _| s.lock().unwrap().push(note.id));
    sub.open().unwrap();
    flush(&pool).await;

    assert_eq!(*seen.lock().unwrap(), vec![shared.id]);
}

/// Backlog events are flagged stored, later ones live
#[tokio::test]
async fn stored_flag_follows_eose() {
    init_tracing();
    let a = ScriptedRelay::new(A);
    let backlog = vec![
        note("one", 1_700_000_001).await,
        note("two", 1_700_000_002).await,
        note("three", 1_700_000_003).await,
    ];
    a.store(backlog.clone());
    let pool = connected_pool(&[a.clone()]).await;

    let sub = pool.subscribe(feed());
    let flags = Arc::new(Mutex::new(Vec::new()));
    let f = flags.clone();
    sub.on_event(move |note, stored| f.lock().unwrap().push((note.content.clone(), stored)));
    sub.open().unwrap();
    flush(&pool).await;

    let live = note("live", 1_700_000_100).await;
    a.push(&RelayMessage::event(sub.id().clone(), live));
    flush(&pool).await;

    assert_eq!(
        *flags.lock().unwrap(),
        vec![
            ("one".to_owned(), true),
            ("two".to_owned(), true),
            ("three".to_owned(), true),
            ("live".to_owned(), false),
        ]
    );
}

/// Close listeners fire once, when the last relay closed the subscription
#[tokio::test]
async fn closed_everywhere() {
    init_tracing();
    let a = ScriptedRelay::silent(A);
    let b = ScriptedRelay::silent(B);
    let pool = connected_pool(&[a.clone(), b.clone()]).await;

    let sub = pool.subscribe(feed());
    let closes = Arc::new(Mutex::new(Vec::new()));
    let c = closes.clone();
    sub.on_close(move |reasons| c.lock().unwrap().push(reasons.to_vec()));
    sub.open().unwrap();
    flush(&pool).await;

    a.push(&RelayMessage::closed(sub.id().clone(), "auth-required"));
    flush(&pool).await;
    assert!(closes.lock().unwrap().is_empty());
    assert!(pool.subscription(sub.id()).is_some());

    b.push(&RelayMessage::closed(sub.id().clone(), "rate-limited"));
    b.push(&RelayMessage::closed(sub.id().clone(), "rate-limited"));
    flush(&pool).await;

    assert_eq!(
        *closes.lock().unwrap(),
        vec![vec![
            format!("{A}: auth-required"),
            format!("{B}: rate-limited"),
        ]]
    );
    assert!(sub.is_closed());
    assert!(pool.subscription(sub.id()).is_none());
}

/// NOTICE frames reach pool notice listeners until they are removed
#[tokio::test]
async fn notices_are_forwarded() {
    let a = ScriptedRelay::silent(A);
    let pool = connected_pool(&[a.clone()]).await;
    let notices = Arc::new(Mutex::new(Vec::new()));
    let n = notices.clone();
    let listener = pool.add_notice_listener(move |relay, msg, err| {
        n.lock()
            .unwrap()
            .push((relay.to_owned(), msg.to_owned(), err.is_some()))
    });

    a.push(&RelayMessage::notice("slow down"));
    flush(&pool).await;

    assert_eq!(
        *notices.lock().unwrap(),
        vec![(A.to_owned(), "slow down".to_owned(), false)]
    );

    assert!(pool.remove_notice_listener(listener));
    assert!(!pool.remove_notice_listener(listener));
    a.push(&RelayMessage::notice("really, slow down"));
    flush(&pool).await;
    assert_eq!(notices.lock().unwrap().len(), 1);
}

// ==================== lifecycle tests ====================

/// Opening a subscription connects relays that were only added
#[tokio::test]
async fn open_connects_lazily() {
    init_tracing();
    let a = ScriptedRelay::new(A);
    let pool = pool_with(&[a.clone()]);
    assert_eq!(a.connects(), 0);

    let sub = pool.subscribe(feed());
    let (tx, mut rx) = mpsc::unbounded_channel();
    sub.on_eose(move |_, everywhere| {
        let _ = tx.send(everywhere);
    });
    sub.open().unwrap();

    assert_eq!(rx.recv().await, Some(true));
    assert_eq!(a.connects(), 1);
    assert_eq!(a.reqs_for(sub.id()), 1);
}

/// Open subscriptions are sent again after a reconnect, and only once
#[tokio::test(start_paused = true)]
async fn resubscribes_after_reconnect() {
    init_tracing();
    let a = ScriptedRelay::new(A);
    let pool = connected_pool(&[a.clone()]).await;

    let sub = pool.subscribe(feed());
    sub.open().unwrap();
    flush(&pool).await;
    assert_eq!(a.reqs_for(sub.id()), 1);

    a.drop_connection("restart");
    flush(&pool).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    flush(&pool).await;

    assert_eq!(a.connects(), 2);
    assert_eq!(a.reqs_for(sub.id()), 2);
}

/// Closing sends CLOSE and forgets the subscription
#[tokio::test]
async fn close_unregisters() {
    let a = ScriptedRelay::new(A);
    let pool = connected_pool(&[a.clone()]).await;
    let sub = pool.subscribe(feed());
    sub.open().unwrap();
    assert_eq!(pool.subscriptions().len(), 1);

    let acks = sub.close();
    assert_eq!(acks.len(), 1);
    for ack in acks {
        assert!(ack.await.success);
    }
    assert!(pool.subscriptions().is_empty());
    assert_eq!(a.closes_for(sub.id()), 1);
    assert!(matches!(sub.open(), Err(Error::SubscriptionClosed)));
}

/// Removing a relay detaches it from the pool
#[tokio::test]
async fn remove_relay() {
    let a = ScriptedRelay::new(A);
    let b = ScriptedRelay::new(B);
    let pool = connected_pool(&[a, b]).await;

    let removed = pool.remove_relay("wss://a.test").expect("relay");
    assert_eq!(removed.url(), A);
    assert!(!pool.has(A));
    assert_eq!(pool.relays().len(), 1);
    assert!(pool.remove_relay(A).is_none());
}

// ==================== publish tests ====================

/// Any succeeds if one relay accepts, All needs every relay
#[tokio::test]
async fn publish_policies() {
    init_tracing();
    let a = ScriptedRelay::new(A);
    let b = ScriptedRelay::new(B);
    b.reject_events("blocked: spam");
    let pool = connected_pool(&[a, b]).await;
    let event = note("hello", 1_700_000_000).await;

    let acks = pool.send(event.clone()).await.expect("any");
    assert!(acks.iter().any(|ack| ack.success && ack.relay == A));

    match pool.publish_with(event.clone(), AckPolicy::All).await {
        Err(Error::Publish(errors)) => {
            assert_eq!(errors, vec![format!("{B}: blocked: spam")])
        }
        other => panic!("expected publish failure, got {other:?}"),
    }

    assert!(pool.publish_with(event, AckPolicy::Quorum).await.is_err());
}

/// Publishing fails when every relay rejects, or there are none
#[tokio::test]
async fn publish_failures() {
    let a = ScriptedRelay::new(A);
    a.reject_events("invalid: bad pow");
    let pool = connected_pool(&[a]).await;
    let event = note("hello", 1_700_000_000).await;

    assert!(matches!(pool.publish(event.clone()).await, Err(Error::Publish(_))));

    let empty = pool_with(&[]);
    assert!(matches!(empty.send(event).await, Err(Error::Publish(_))));
}

// ==================== fetch tests ====================

/// A fetch resolves with the backlog as soon as every relay sent EOSE
#[tokio::test(start_paused = true)]
async fn fetch_resolves_on_eose() {
    init_tracing();
    let a = ScriptedRelay::new(A);
    a.reply_after(Duration::from_millis(500));
    let backlog = vec![
        note("one", 1_700_000_001).await,
        note("two", 1_700_000_002).await,
        note("three", 1_700_000_003).await,
    ];
    a.store(backlog.clone());
    let pool = connected_pool(&[a]).await;

    let start = Instant::now();
    let events = pool
        .fetch_timeout(feed(), Duration::from_secs(2))
        .await
        .expect("fetch");

    assert!(start.elapsed() < Duration::from_secs(2));
    let contents: Vec<&str> = events.iter().map(|n| n.content.as_str()).collect();
    assert_eq!(contents, vec!["three", "two", "one"]);
    assert!(pool.subscriptions().is_empty());
}

/// A fetch against a relay that never answers times out and closes
#[tokio::test(start_paused = true)]
async fn fetch_times_out() {
    init_tracing();
    let a = ScriptedRelay::silent(A);
    let pool = connected_pool(&[a.clone()]).await;

    let start = Instant::now();
    let err = pool
        .fetch_timeout(feed(), Duration::from_secs(2))
        .await
        .expect_err("timeout");

    assert!(common::is_timeout(&err));
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(pool.subscriptions().is_empty());

    flush(&pool).await;
    let closes = a
        .sent()
        .iter()
        .filter(|m| m.kind() == "CLOSE")
        .count();
    assert_eq!(closes, 1);
}

/// WaitForEvents stops after the requested count
#[tokio::test]
async fn fetch_until_count() {
    let a = ScriptedRelay::new(A);
    a.store(vec![
        note("one", 1).await,
        note("two", 2).await,
        note("three", 3).await,
    ]);
    let pool = connected_pool(&[a]).await;

    let options = FetchOptions::default().policy(FetchPolicy::WaitForEvents {
        count: 2,
        end_on_eose: false,
    });
    let events: Vec<Note> = pool.fetch_with(feed(), options).await.expect("fetch");
    assert_eq!(events.len(), 2);
}

/// The pool closes its subscriptions and hands back its relays
#[tokio::test]
async fn pool_close() {
    let a = ScriptedRelay::new(A);
    let pool = connected_pool(&[a.clone()]).await;
    let sub = pool.subscribe(feed());
    sub.open().unwrap();

    let relays = pool.close();
    assert_eq!(relays.len(), 1);
    assert!(sub.is_closed());
    assert!(pool.relays().is_empty());
    assert!(pool.subscriptions().is_empty());
}
