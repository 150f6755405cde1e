//! Error handling and edge case tests.

use crossbeam_channel::unbounded;
use hive_realtime::{
    ChangeFeed, ChildAdded, CollectingSink, ConnectionStatus, EntityLookup, Handlers,
    ManagerConfig, ManualScheduler, Predicate, RawChange, RealtimeError, Row, SessionManager,
    Table, ThreadScheduler, WatchFilter,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn manual_manager(feed: Arc<ChangeFeed>) -> SessionManager {
    SessionManager::builder(feed, Arc::new(ManualScheduler::new()))
        .build()
        .unwrap()
}

// --- Subscribe Misuse ---

#[test]
fn test_subscribe_rejects_empty_channel() {
    let manager = manual_manager(Arc::new(ChangeFeed::new()));
    let result = manager.subscribe(
        "",
        vec![WatchFilter::table(Table::Swarms)],
        Handlers::new().on_change(Table::Swarms, |_| {}),
    );
    assert!(matches!(result, Err(RealtimeError::EmptyChannelKey)));
    assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);
    assert!(!manager.is_subscribed());
}

#[test]
fn test_subscribe_rejects_unrouted_table() {
    let feed = Arc::new(ChangeFeed::new());
    let manager = manual_manager(feed.clone());
    let result = manager.subscribe(
        "swarm:s1",
        vec![
            WatchFilter::table(Table::Messages),
            WatchFilter::table(Table::SwarmActions),
        ],
        Handlers::new().on_change(Table::Messages, |_| {}),
    );

    match result {
        Err(RealtimeError::MissingHandler(table)) => assert_eq!(table, Table::SwarmActions),
        other => panic!("Expected MissingHandler, got {:?}", other),
    }
    assert_eq!(feed.connection_count(), 0);
}

#[test]
fn test_failed_subscribe_keeps_current_one() {
    let feed = Arc::new(ChangeFeed::new());
    let manager = manual_manager(feed.clone());
    manager
        .subscribe(
            "swarm:s1",
            vec![WatchFilter::table(Table::Messages)],
            Handlers::new().on_change(Table::Messages, |_| {}),
        )
        .unwrap();

    let result = manager.subscribe("swarm:s2", vec![], Handlers::new());
    assert!(matches!(result, Err(RealtimeError::EmptyFilters)));
    assert_eq!(manager.channel_key().as_deref(), Some("swarm:s1"));
    assert_eq!(feed.channels(), vec!["swarm:s1".to_string()]);
}

#[test]
fn test_child_added_requires_lookup() {
    let manager = manual_manager(Arc::new(ChangeFeed::new()));
    let result = manager.subscribe(
        "swarm:s1",
        vec![WatchFilter::table(Table::SwarmAgents)],
        Handlers::new().on_child_added(|_| {}),
    );
    assert!(matches!(result, Err(RealtimeError::InvalidConfig(_))));
}

// --- Configuration Errors ---

#[test]
fn test_invalid_config_rejected_by_builder() {
    let config = ManagerConfig {
        base_delay_ms: 0,
        ..Default::default()
    };
    let result = SessionManager::builder(
        Arc::new(ChangeFeed::new()),
        Arc::new(ManualScheduler::new()),
    )
    .config(config)
    .build();
    assert!(matches!(result, Err(RealtimeError::InvalidConfig(_))));
}

#[test]
fn test_config_from_json_errors() {
    assert!(matches!(
        ManagerConfig::from_json_str("{not json"),
        Err(RealtimeError::InvalidConfig(_))
    ));
    assert!(matches!(
        ManagerConfig::from_json_str(r#"{"base_delay_ms": 1000, "max_delay_ms": 10}"#),
        Err(RealtimeError::InvalidConfig(_))
    ));
    assert!(matches!(
        ManagerConfig::from_json_str(
            r#"{"membership": {"table": "agents", "parent_key": "swarm_id", "child_key": "id", "child_table": "agents"}}"#
        ),
        Err(RealtimeError::InvalidConfig(_))
    ));

    let config = ManagerConfig::from_json_str(r#"{"max_reconnect_attempts": 2}"#).unwrap();
    assert_eq!(config.reconnect_policy().schedule().len(), 2);
}

#[test]
fn test_predicate_parse_errors() {
    for input in ["", "swarm_id", "swarm_id=s1", "swarm_id=like.s%", "=eq.s1"] {
        assert!(
            matches!(Predicate::parse(input), Err(RealtimeError::InvalidPredicate(_))),
            "{:?} should not parse",
            input
        );
    }
    assert_eq!(
        Predicate::parse("swarm_id=eq.s1").unwrap(),
        Predicate::eq("swarm_id", "s1")
    );
}

#[test]
fn test_unknown_table_name() {
    assert!(matches!(
        "profiles".parse::<Table>(),
        Err(RealtimeError::UnknownTable(_))
    ));
    assert_eq!("swarm_agents".parse::<Table>().unwrap(), Table::SwarmAgents);
}

// --- Bad Payloads ---

#[test]
fn test_bad_payload_does_not_break_session() {
    let feed = Arc::new(ChangeFeed::new());
    let manager = SessionManager::builder(feed.clone(), Arc::new(ThreadScheduler::new()))
        .build()
        .unwrap();
    let (tx, rx) = unbounded();
    manager
        .subscribe(
            "swarm:s1",
            vec![WatchFilter::table(Table::Swarms)],
            Handlers::new().on_change(Table::Swarms, move |event| {
                let _ = tx.send(event.clone());
            }),
        )
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while manager.connection_status() != ConnectionStatus::Connected {
        assert!(std::time::Instant::now() < deadline, "never connected");
        std::thread::sleep(Duration::from_millis(5));
    }

    // Missing status, then a bare string, then a good row
    feed.publish(&RawChange::insert(Table::Swarms, json!({"id": "s1"})));
    feed.publish(&RawChange::insert(Table::Swarms, json!("s1")));
    feed.publish(&RawChange::insert(
        Table::Swarms,
        json!({"id": "s2", "status": "draft"}),
    ));

    let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(event.row().map(|r| r.id()), Some("s2".to_string()));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(manager.connection_status(), ConnectionStatus::Connected);
}

/// Lookup backend that is always down.
struct BrokenLookup;

impl EntityLookup for BrokenLookup {
    fn fetch_by_id(&self, _table: Table, _id: &str) -> hive_realtime::Result<Option<Row>> {
        Err(RealtimeError::Lookup("backend unavailable".to_string()))
    }
}

#[test]
fn test_lookup_failure_is_silent() {
    let feed = Arc::new(ChangeFeed::new());
    let scheduler = Arc::new(ManualScheduler::new());
    let sink = Arc::new(CollectingSink::new());
    let manager = SessionManager::builder(feed.clone(), scheduler.clone())
        .lookup(Arc::new(BrokenLookup))
        .sink(sink.clone())
        .build()
        .unwrap();

    let (tx, rx) = unbounded::<ChildAdded>();
    manager
        .subscribe(
            "swarm:s1",
            vec![WatchFilter::table(Table::SwarmAgents)],
            Handlers::new().on_child_added(move |added| {
                let _ = tx.send(added.clone());
            }),
        )
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while manager.connection_status() != ConnectionStatus::Connected {
        assert!(std::time::Instant::now() < deadline, "never connected");
        std::thread::sleep(Duration::from_millis(5));
    }

    feed.publish(&RawChange::insert(
        Table::SwarmAgents,
        json!({"swarm_id": "s1", "agent_id": "a1"}),
    ));
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while scheduler.spawned_count() == 0 {
        assert!(std::time::Instant::now() < deadline, "enrichment never queued");
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(scheduler.run_spawned(), 1);
    assert!(rx.try_recv().is_err());
    assert!(sink.is_empty());
    assert_eq!(manager.connection_status(), ConnectionStatus::Connected);
}

// --- Teardown Edge Cases ---

#[test]
fn test_unsubscribe_before_subscribe() {
    let feed = Arc::new(ChangeFeed::new());
    let manager = manual_manager(feed.clone());
    manager.unsubscribe();
    manager.unsubscribe();
    manager.reconnect();
    assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(feed.connection_count(), 0);
}
