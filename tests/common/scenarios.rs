//! Event store scenarios shared by the in-memory and Postgres suites.
//!
//! Every scenario uses fresh aggregate ids (and aggregate types where it
//! queries across streams) so suites can share one database.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

use stream_ledger::{
    Event, EventStorage, EventStore, EventStoreConfig, EventStoreError, EventStream, ReplayProgress,
    ReplayQuery,
};

use super::*;

fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6) - chrono::Duration::minutes(minutes)
}

/// Events 1..=count, one minute apart, the last one a minute ago
fn timed_history(aggregate_id: Uuid, count: i64) -> Vec<Event> {
    account_history(aggregate_id, count)
        .into_iter()
        .map(|event| {
            let at = minutes_ago(count - event.sequence_number() + 1);
            event.with_created_at(at)
        })
        .collect()
}

fn sequence_numbers(events: &[Event]) -> Vec<i64> {
    events.iter().map(Event::sequence_number).collect()
}

pub async fn commit_then_load_returns_events_in_order<S: EventStorage>(store: &EventStore<S>) {
    let id = Uuid::new_v4();

    let receipt = store
        .commit_events(&open_account(id), vec![(account_stream(id), account_history(id, 5))])
        .await
        .unwrap();

    assert_eq!(receipt.events.len(), 5);
    let positions: Vec<i64> = receipt.events.iter().filter_map(Event::position).collect();
    assert_eq!(positions.len(), 5);
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    let (stream, events) = store.load_events(id).await.unwrap().unwrap();
    assert_eq!(stream, account_stream(id));
    assert_eq!(sequence_numbers(&events), vec![1, 2, 3, 4, 5]);
    assert!(events.iter().all(|event| !event.is_snapshot()));
    assert_eq!(
        events[0].payload::<AccountOpened>().unwrap().owner,
        "alice"
    );
    assert_eq!(events[4].payload::<Deposited>().unwrap().amount, 40);
    assert_eq!(events[2].position(), Some(positions[2]));

    let single = store.load_event(id, 3).await.unwrap().unwrap();
    assert_eq!(single.payload::<Deposited>(), Some(&Deposited { amount: 20 }));
    assert!(store.load_event(id, 6).await.unwrap().is_none());

    let commands = store.commands_for_aggregate(id).await.unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].id, receipt.command_id);
    assert_eq!(commands[0].command_type, "OpenAccount");
}

pub async fn load_for_aggregates_keeps_order_and_omits_unknown<S: EventStorage>(store: &EventStore<S>) {
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let unknown = Uuid::new_v4();
    commit_account(store, first, account_history(first, 2)).await;
    commit_account(store, second, account_history(second, 3)).await;

    assert!(store.load_events(unknown).await.unwrap().is_none());

    let loaded = store
        .load_events_for_aggregates(&[second, unknown, first, second])
        .await
        .unwrap();

    let ids: Vec<Uuid> = loaded.iter().map(|(stream, _)| stream.aggregate_id).collect();
    assert_eq!(ids, vec![second, first]);
    assert_eq!(sequence_numbers(&loaded[0].1), vec![1, 2, 3]);
    assert_eq!(sequence_numbers(&loaded[1].1), vec![1, 2]);

    assert!(store.load_events_for_aggregates(&[]).await.unwrap().is_empty());
}

pub async fn multi_stream_commit_shares_one_command<S: EventStorage>(store: &EventStore<S>) {
    let from = Uuid::new_v4();
    let to = Uuid::new_v4();
    commit_account(store, from, account_history(from, 1)).await;
    commit_account(store, to, account_history(to, 1)).await;

    let transfer = stream_ledger::Command::new(
        "Transfer",
        from,
        &serde_json::json!({ "to": to, "amount": 5 }),
    )
    .unwrap();
    let receipt = store
        .commit_events(
            &transfer,
            vec![
                (account_stream(from), vec![Event::new(from, 2, Withdrawn { amount: 5 })]),
                (account_stream(to), vec![Event::new(to, 2, Deposited { amount: 5 })]),
            ],
        )
        .await
        .unwrap();

    let ids: Vec<Uuid> = receipt.events.iter().map(Event::aggregate_id).collect();
    assert_eq!(ids, vec![from, to]);

    let from_commands = store.commands_for_aggregate(from).await.unwrap();
    assert_eq!(from_commands.len(), 2);
    assert_eq!(from_commands[1].id, receipt.command_id);
    assert_eq!(from_commands[1].command_type, "Transfer");
    assert_eq!(store.commands_for_aggregate(to).await.unwrap().len(), 1);
}

pub async fn duplicate_sequence_number_is_optimistic_locking<S: EventStorage>(store: &EventStore<S>) {
    let id = Uuid::new_v4();
    commit_account(store, id, account_history(id, 2)).await;

    let err = store
        .commit_events(
            &open_account(id),
            vec![(account_stream(id), vec![Event::new(id, 2, Withdrawn { amount: 1 })])],
        )
        .await
        .unwrap_err();

    assert!(err.is_concurrency_conflict());
    assert!(err.is_retryable());
    assert!(std::error::Error::source(&err).is_some());

    let (_, events) = store.load_events(id).await.unwrap().unwrap();
    assert_eq!(events[1].payload::<Deposited>(), Some(&Deposited { amount: 10 }));
    assert_eq!(store.commands_for_aggregate(id).await.unwrap().len(), 1);
}

pub async fn mismatched_aggregate_type_is_rejected<S: EventStorage>(store: &EventStore<S>) {
    let id = Uuid::new_v4();
    commit_account(store, id, account_history(id, 1)).await;

    let err = store
        .commit_events(
            &open_account(id),
            vec![(
                EventStream::new("User", id),
                vec![Event::new(id, 2, Deposited { amount: 5 })],
            )],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EventStoreError::InvalidArgument(_)));
    assert!(err.to_string().contains("has type Account, not User"));

    let (stream, events) = store.load_events(id).await.unwrap().unwrap();
    assert_eq!(stream.aggregate_type, "Account");
    assert_eq!(events.len(), 1);
    assert_eq!(store.commands_for_aggregate(id).await.unwrap().len(), 1);
}

pub async fn concurrent_commits_exactly_one_wins<S: EventStorage>(store: &EventStore<S>) {
    let log = call_log();
    let store = store.with_config(
        EventStoreConfig::new().with_event_handler(YieldingHandler { log: log.clone() }),
    );
    let id = Uuid::new_v4();

    let first_command = open_account(id);
    let second_command = open_account(id);
    let first = store.commit_events(
        &first_command,
        vec![(account_stream(id), vec![Event::new(id, 1, Deposited { amount: 1 })])],
    );
    let second = store.commit_events(
        &second_command,
        vec![(account_stream(id), vec![Event::new(id, 1, Deposited { amount: 2 })])],
    );
    let (first, second) = tokio::join!(first, second);

    let results = [first, second];
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let losers: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(losers.len(), 1);
    assert!(losers[0].is_concurrency_conflict());

    let (_, events) = store.load_events(id).await.unwrap().unwrap();
    assert_eq!(events.len(), 1);
    let commands = store.commands_for_aggregate(id).await.unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].id, winners[0].command_id);

    // only the winner's event reached the handlers
    let published = log.lock().unwrap().clone();
    assert_eq!(published.len(), winners.len());
    assert_eq!(published[0].2, winners[0].events[0].sequence_number());
}

pub async fn failing_handler_rolls_back_everything<S: EventStorage>(store: &EventStore<S>) {
    let log = call_log();
    let store = store.with_config(
        EventStoreConfig::new()
            .with_event_handler(RecordingHandler::new("audit", &log))
            .with_event_handler(FailingHandler { fail_on: "Deposited" }),
    );
    let id = Uuid::new_v4();

    let err = store
        .commit_events(&open_account(id), vec![(account_stream(id), account_history(id, 3))])
        .await
        .unwrap_err();

    let EventStoreError::PublishEvent(publish) = &err else {
        panic!("expected a publish error, got {err:?}");
    };
    assert_eq!(publish.event_handler, "FailingHandler");
    assert_eq!(publish.event.aggregate_id(), id);
    assert_eq!(publish.event.sequence_number(), 2);
    assert!(publish.cause.to_string().contains("cannot project Deposited"));
    assert!(!err.is_retryable());

    assert!(!store.stream_exists(id).await.unwrap());
    assert!(!store.events_exist(id).await.unwrap());
    assert!(store.load_events(id).await.unwrap().is_none());
    assert!(store.commands_for_aggregate(id).await.unwrap().is_empty());
    // handlers before the failing one saw events 1 and 2
    assert_eq!(log.lock().unwrap().len(), 2);
}

pub async fn disabled_handlers_still_commit<S: EventStorage>(store: &EventStore<S>) {
    let store = store.with_config(
        EventStoreConfig::new()
            .with_event_handler(FailingHandler { fail_on: "AccountOpened" })
            .disable_event_handlers(true),
    );
    let id = Uuid::new_v4();

    commit_account(&store, id, account_history(id, 2)).await;

    assert!(store.events_exist(id).await.unwrap());
}

pub async fn handlers_see_events_in_commit_order<S: EventStorage>(store: &EventStore<S>) {
    let log = call_log();
    let store = store.with_config(
        EventStoreConfig::new()
            .with_event_handler(RecordingHandler::new("first", &log))
            .with_event_handler(RecordingHandler::new("second", &log)),
    );
    let id = Uuid::new_v4();

    commit_account(&store, id, account_history(id, 2)).await;

    let calls: Vec<(String, i64)> = log
        .lock()
        .unwrap()
        .iter()
        .map(|(name, _, seq)| (name.clone(), *seq))
        .collect();
    assert_eq!(
        calls,
        vec![
            ("first".to_string(), 1),
            ("second".to_string(), 1),
            ("first".to_string(), 2),
            ("second".to_string(), 2),
        ]
    );
}

pub async fn with_config_replaces_handlers<S: EventStorage>(store: &EventStore<S>) {
    let log = call_log();
    let recording = store.with_config(
        EventStoreConfig::new().with_event_handler(RecordingHandler::new("old", &log)),
    );
    let replaced = recording.with_config(EventStoreConfig::new());
    let id = Uuid::new_v4();

    commit_account(&replaced, id, account_history(id, 1)).await;

    assert!(log.lock().unwrap().is_empty());
    assert!(replaced.config().event_handlers.is_empty());
}

pub async fn stream_without_events<S: EventStorage>(store: &EventStore<S>) {
    let id = Uuid::new_v4();

    commit_account(store, id, Vec::new()).await;

    assert!(store.stream_exists(id).await.unwrap());
    assert!(!store.events_exist(id).await.unwrap());
    let (_, events) = store.load_events(id).await.unwrap().unwrap();
    assert!(events.is_empty());
}

pub async fn snapshots_lifecycle<S: EventStorage>(store: &EventStore<S>) {
    let id = Uuid::new_v4();
    commit_account(store, id, account_history(id, 6)).await;

    store
        .store_snapshots(&[
            Event::snapshot(id, 2, AccountState { balance: 10 }),
            Event::snapshot(id, 4, AccountState { balance: 60 }),
        ])
        .await
        .unwrap();

    let latest = store.load_latest_snapshot(id).await.unwrap().unwrap();
    assert!(latest.is_snapshot());
    assert_eq!(latest.sequence_number(), 4);
    assert_eq!(latest.payload::<AccountState>(), Some(&AccountState { balance: 60 }));

    let (_, events) = store.load_events(id).await.unwrap().unwrap();
    assert_eq!(sequence_numbers(&events), vec![4, 5, 6]);
    assert!(events[0].is_snapshot());
    assert!(events[1..].iter().all(|event| !event.is_snapshot()));

    assert_eq!(store.delete_snapshots_before(id, 4).await.unwrap(), 1);
    assert_eq!(store.load_latest_snapshot(id).await.unwrap().unwrap().sequence_number(), 4);

    assert_eq!(store.delete_snapshots_before(id, 5).await.unwrap(), 1);
    assert!(store.load_latest_snapshot(id).await.unwrap().is_none());
    let (_, events) = store.load_events(id).await.unwrap().unwrap();
    assert_eq!(sequence_numbers(&events), vec![1, 2, 3, 4, 5, 6]);
}

pub async fn store_snapshots_validates_and_is_atomic<S: EventStorage>(store: &EventStore<S>) {
    let id = Uuid::new_v4();
    commit_account(store, id, account_history(id, 3)).await;

    let not_snapshot = store
        .store_snapshots(&[Event::new(id, 3, Deposited { amount: 1 })])
        .await
        .unwrap_err();
    assert!(matches!(not_snapshot, EventStoreError::InvalidArgument(_)));

    let unknown_stream = store
        .store_snapshots(&[Event::snapshot(Uuid::new_v4(), 1, AccountState { balance: 0 })])
        .await
        .unwrap_err();
    assert!(matches!(unknown_stream, EventStoreError::InvalidArgument(_)));

    let restricted = store.with_config(EventStoreConfig::new().with_snapshot_type_tag("UserState"));
    let wrong_type = restricted
        .store_snapshots(&[Event::snapshot(id, 3, AccountState { balance: 30 })])
        .await
        .unwrap_err();
    assert!(matches!(wrong_type, EventStoreError::InvalidArgument(_)));

    store
        .store_snapshots(&[Event::snapshot(id, 2, AccountState { balance: 10 })])
        .await
        .unwrap();
    let collision = store
        .store_snapshots(&[
            Event::snapshot(id, 3, AccountState { balance: 30 }),
            Event::snapshot(id, 2, AccountState { balance: 10 }),
        ])
        .await
        .unwrap_err();
    assert!(collision.is_concurrency_conflict());

    // the batch was all or nothing: snapshot 3 was not stored
    let latest = store.load_latest_snapshot(id).await.unwrap().unwrap();
    assert_eq!(latest.sequence_number(), 2);
}

pub async fn stream_events_respects_time_bound<S: EventStorage>(store: &EventStore<S>) {
    let id = Uuid::new_v4();
    let history = timed_history(id, 4);
    let first_at = history[0].created_at();
    let last_at = history[3].created_at();
    commit_account(store, id, history).await;
    store
        .store_snapshots(&[Event::snapshot(id, 2, AccountState { balance: 10 })])
        .await
        .unwrap();

    let before_first = first_at - chrono::Duration::seconds(1);
    let err = store
        .stream_events_for_aggregate(id, Some(before_first), |_, _| {})
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::InvalidArgument(_)));

    let mut seen = Vec::new();
    let delivered = store
        .stream_events_for_aggregate(id, Some(last_at + chrono::Duration::seconds(1)), |stream, event| {
            assert_eq!(stream.aggregate_id, id);
            assert!(!event.is_snapshot());
            seen.push(event.sequence_number());
        })
        .await
        .unwrap();
    assert_eq!(delivered, 4);
    assert_eq!(seen, vec![1, 2, 3, 4]);

    let mut bounded = Vec::new();
    store
        .stream_events_for_aggregate(id, Some(first_at + chrono::Duration::seconds(90)), |_, event| {
            bounded.push(event.sequence_number())
        })
        .await
        .unwrap();
    assert_eq!(bounded, vec![1, 2]);

    let mut unbounded = 0;
    store
        .stream_events_for_aggregate(id, None, |_, _| unbounded += 1)
        .await
        .unwrap();
    assert_eq!(unbounded, 4);

    let unknown = store
        .stream_events_for_aggregate(Uuid::new_v4(), None, |_, _| {})
        .await
        .unwrap_err();
    assert!(matches!(unknown, EventStoreError::InvalidArgument(_)));
}

pub async fn replay_publishes_in_blocks<S: EventStorage>(store: &EventStore<S>) {
    let log = call_log();
    let store = store.with_config(
        EventStoreConfig::new().with_event_handler(RecordingHandler::new("projection", &log)),
    );
    let id = Uuid::new_v4();
    let receipt = store
        .commit_events(&open_account(id), vec![(account_stream(id), account_history(id, 5))])
        .await
        .unwrap();
    log.lock().unwrap().clear();
    let positions: Vec<i64> = receipt.events.iter().filter_map(Event::position).collect();

    let query = ReplayQuery::all().for_aggregates([id]);
    let mut progress: Vec<ReplayProgress> = Vec::new();
    let processed = store
        .replay_events_from_cursor(&query, 2, |p| progress.push(p))
        .await
        .unwrap();

    assert_eq!(processed, 5);
    let counts: Vec<u64> = progress.iter().map(|p| p.events_processed).collect();
    assert_eq!(counts, vec![2, 4, 5]);
    assert_eq!(log.lock().unwrap().len(), 5);
    assert_eq!(
        progress.iter().map(|p| (p.block_start, p.block_end)).collect::<Vec<_>>(),
        vec![
            (positions[0], positions[1]),
            (positions[2], positions[3]),
            (positions[4], positions[4]),
        ]
    );

    // resuming after the second block only replays the tail
    log.lock().unwrap().clear();
    let resumed = store
        .replay_events_from_cursor(&query.clone().after_position(progress[1].block_end), 2, |_| {})
        .await
        .unwrap();
    assert_eq!(resumed, 1);
    assert_eq!(log.lock().unwrap()[0].2, 5);
}

pub async fn replay_filters_and_validates<S: EventStorage>(store: &EventStore<S>) {
    let log = call_log();
    let aggregate_type = format!("Ledger-{}", Uuid::new_v4());
    let store = store.with_config(
        EventStoreConfig::new().with_event_handler(RecordingHandler::new("projection", &log)),
    );
    let id = Uuid::new_v4();
    store
        .commit_events(
            &open_account(id),
            vec![(EventStream::new(aggregate_type.clone(), id), account_history(id, 4))],
        )
        .await
        .unwrap();
    log.lock().unwrap().clear();

    let deposits = ReplayQuery::all()
        .for_aggregate_types([aggregate_type.clone()])
        .for_event_types(["Deposited"]);
    let processed = store
        .replay_events_from_cursor(&deposits, 10, |_| {})
        .await
        .unwrap();
    assert_eq!(processed, 3);

    let err = store
        .replay_events_from_cursor(&deposits, 0, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::InvalidArgument(_)));

    let silent = store.with_config(
        EventStoreConfig::new()
            .with_event_handler(FailingHandler { fail_on: "Deposited" })
            .disable_event_handlers(true),
    );
    let mut reported = 0;
    let processed = silent
        .replay_events_from_cursor(&deposits, 2, |_| reported += 1)
        .await
        .unwrap();
    assert_eq!(processed, 3);
    assert_eq!(reported, 2);
}

pub async fn replay_aborts_on_handler_failure<S: EventStorage>(store: &EventStore<S>) {
    let id = Uuid::new_v4();
    commit_account(store, id, account_history(id, 5)).await;
    let failing = store.with_config(
        EventStoreConfig::new().with_event_handler(FailingHandler { fail_on: "Deposited" }),
    );

    let mut progress = Vec::new();
    let err = failing
        .replay_events_from_cursor(&ReplayQuery::all().for_aggregates([id]), 1, |p| {
            progress.push(p.events_processed)
        })
        .await
        .unwrap_err();

    assert!(matches!(err, EventStoreError::PublishEvent(_)));
    // only the AccountOpened block made it through
    assert_eq!(progress, vec![1]);
}

pub async fn delete_stream_and_orphaned_commands<S: EventStorage>(store: &EventStore<S>) {
    let deleted = Uuid::new_v4();
    let kept = Uuid::new_v4();
    commit_account(store, deleted, account_history(deleted, 2)).await;
    commit_account(store, kept, account_history(kept, 2)).await;

    // commands with surviving events are never purged
    assert_eq!(
        store
            .permanently_delete_commands_without_events(Some(deleted))
            .await
            .unwrap(),
        0
    );

    assert!(store.permanently_delete_event_stream(deleted).await.unwrap());
    assert!(!store.permanently_delete_event_stream(deleted).await.unwrap());
    assert!(!store.stream_exists(deleted).await.unwrap());
    assert!(!store.events_exist(deleted).await.unwrap());
    assert_eq!(store.commands_for_aggregate(deleted).await.unwrap().len(), 1);

    assert_eq!(
        store
            .permanently_delete_commands_without_events(Some(deleted))
            .await
            .unwrap(),
        1
    );
    assert!(store.commands_for_aggregate(deleted).await.unwrap().is_empty());
    assert_eq!(
        store
            .permanently_delete_commands_without_events(Some(kept))
            .await
            .unwrap(),
        0
    );
    assert_eq!(store.commands_for_aggregate(kept).await.unwrap().len(), 1);
}

pub async fn snapshot_candidates<S: EventStorage>(store: &EventStore<S>) {
    let aggregate_type = format!("Wallet-{}", Uuid::new_v4());
    let stream = |id| EventStream::new(aggregate_type.clone(), id);

    let busy = Uuid::new_v4();
    let receipt = store
        .commit_events(
            &open_account(busy),
            vec![(stream(busy).with_snapshot_threshold(3), account_history(busy, 3))],
        )
        .await
        .unwrap();
    assert_eq!(receipt.snapshot_candidates, vec![busy]);

    let quiet = Uuid::new_v4();
    let receipt = store
        .commit_events(
            &open_account(quiet),
            vec![(stream(quiet).with_snapshot_threshold(10), account_history(quiet, 2))],
        )
        .await
        .unwrap();
    assert!(receipt.snapshot_candidates.is_empty());

    let stale = Uuid::new_v4();
    store
        .commit_events(
            &open_account(stale),
            vec![(
                stream(stale)
                    .with_snapshot_threshold(100)
                    .with_snapshot_outdated_after(Duration::from_secs(3600)),
                account_history(stale, 2),
            )],
        )
        .await
        .unwrap();
    store
        .store_snapshots(&[
            Event::snapshot(stale, 2, AccountState { balance: 10 }).with_created_at(minutes_ago(120))
        ])
        .await
        .unwrap();

    let mut expected = vec![busy, stale];
    expected.sort();
    let candidates = store
        .aggregates_that_need_snapshots(Some(&aggregate_type), 10)
        .await
        .unwrap();
    assert_eq!(candidates, expected);

    let limited = store
        .aggregates_that_need_snapshots(Some(&aggregate_type), 1)
        .await
        .unwrap();
    assert_eq!(limited, vec![expected[0]]);

    store
        .store_snapshots(&[Event::snapshot(busy, 3, AccountState { balance: 30 })])
        .await
        .unwrap();
    let candidates = store
        .aggregates_that_need_snapshots(Some(&aggregate_type), 10)
        .await
        .unwrap();
    assert_eq!(candidates, vec![stale]);

    let err = store
        .aggregates_that_need_snapshots(Some(&aggregate_type), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::InvalidArgument(_)));
}

pub async fn update_snapshot_policy<S: EventStorage>(store: &EventStore<S>) {
    let id = Uuid::new_v4();
    commit_account(store, id, account_history(id, 1)).await;

    assert!(!store
        .update_snapshot_policy(Uuid::new_v4(), Some(5), None)
        .await
        .unwrap());
    assert!(store
        .update_snapshot_policy(id, Some(5), Some(Duration::from_secs(60)))
        .await
        .unwrap());

    let stream = store.find_event_stream(id).await.unwrap().unwrap();
    assert_eq!(stream.snapshot_threshold, Some(5));
    assert_eq!(stream.snapshot_outdated_after, Some(Duration::from_secs(60)));

    let err = store.update_snapshot_policy(id, Some(0), None).await.unwrap_err();
    assert!(matches!(err, EventStoreError::InvalidArgument(_)));

    // the stream passed to a later commit does not overwrite the stored policy
    store
        .commit_events(
            &open_account(id),
            vec![(account_stream(id), vec![Event::new(id, 2, Deposited { amount: 3 })])],
        )
        .await
        .unwrap();
    let stream = store.find_event_stream(id).await.unwrap().unwrap();
    assert_eq!(stream.snapshot_threshold, Some(5));
}
