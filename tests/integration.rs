//! Integration tests: a session manager on the in-process change feed with
//! real timer threads.

use crossbeam_channel::{unbounded, Receiver};
use hive_realtime::{
    ChangeEvent, ChangeFeed, ChannelSink, ChildAdded, ConnectionHandle, ConnectionStatus,
    Environment, EnvironmentSignal, EventFilter, FailureKind, Handlers, ManagerConfig,
    MemoryStore, Notification, NotificationKind, Predicate, RawChange, RealtimeError, Row,
    SessionManager, Table, ThreadScheduler, Transport, TransportSink, WatchFilter,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, f: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}

fn fast_config() -> ManagerConfig {
    ManagerConfig {
        base_delay_ms: 20,
        max_reconnect_attempts: 3,
        ..Default::default()
    }
}

fn manager_on(feed: &Arc<ChangeFeed>) -> SessionManager {
    SessionManager::builder(feed.clone(), Arc::new(ThreadScheduler::new()))
        .config(fast_config())
        .build()
        .unwrap()
}

fn message(id: &str, swarm_id: &str) -> RawChange {
    RawChange::insert(
        Table::Messages,
        json!({"id": id, "swarm_id": swarm_id, "sender_type": "agent", "content": "hi"}),
    )
}

fn message_handlers() -> (Handlers, Receiver<ChangeEvent>) {
    let (tx, rx) = unbounded();
    let handlers = Handlers::new().on_change(Table::Messages, move |event| {
        let _ = tx.send(event.clone());
    });
    (handlers, rx)
}

fn connected(manager: &SessionManager) -> bool {
    manager.connection_status() == ConnectionStatus::Connected
}

// --- Realistic Workflow Tests ---

#[test]
fn test_swarm_room_workflow() {
    init_tracing();
    let feed = Arc::new(ChangeFeed::new());
    let agents = Arc::new(MemoryStore::new());
    agents.put(
        Row::decode(
            Table::Agents,
            json!({"id": "a1", "name": "Scout", "role": "researcher"}),
        )
        .unwrap(),
    );

    let (note_tx, note_rx) = unbounded::<Notification>();
    let manager = SessionManager::builder(feed.clone(), Arc::new(ThreadScheduler::new()))
        .sink(Arc::new(ChannelSink::new(note_tx)))
        .lookup(agents.clone())
        .build()
        .unwrap();

    let (msg_tx, msg_rx) = unbounded();
    let (added_tx, added_rx) = unbounded::<ChildAdded>();
    let handlers = Handlers::new()
        .on_change(Table::Messages, move |event| {
            let _ = msg_tx.send(event.clone());
        })
        .on_child_added(move |added| {
            let _ = added_tx.send(added.clone());
        })
        .on_child_removed(|_| {})
        .on_status_transition(|_| {});

    manager
        .subscribe(
            "swarm:s1",
            vec![
                WatchFilter::table(Table::Messages).filter(Predicate::eq("swarm_id", "s1")),
                WatchFilter::table(Table::SwarmAgents).filter(Predicate::eq("swarm_id", "s1")),
                WatchFilter::table(Table::Swarms)
                    .on(EventFilter::Update)
                    .filter(Predicate::eq("id", "s1")),
            ],
            handlers,
        )
        .unwrap();
    assert!(wait_until(WAIT, || connected(&manager)));

    // Messages for another swarm never reach this room
    assert_eq!(feed.publish(&message("m0", "s2")), 0);
    assert_eq!(feed.publish(&message("m1", "s1")), 1);
    let event = msg_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(event.row().map(|r| r.id()), Some("m1".to_string()));

    // Membership insert is reported with the full agent
    feed.publish(&RawChange::insert(
        Table::SwarmAgents,
        json!({"swarm_id": "s1", "agent_id": "a1"}),
    ));
    let added = added_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(added.parent_id, "s1");
    assert_eq!(added.child.text_field("name").as_deref(), Some("Scout"));

    // Status change becomes a notification
    feed.publish(&RawChange::update(
        Table::Swarms,
        json!({"id": "s1", "status": "draft"}),
        json!({"id": "s1", "status": "active"}),
    ));
    let note = note_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(note.kind, NotificationKind::Info);
    assert_eq!(note.title, "Swarm activated");
    let transition = manager.last_transition().unwrap();
    assert_eq!(transition.previous, "draft");
    assert_eq!(transition.current, "active");

    manager.unsubscribe();
    assert_eq!(feed.connection_count(), 0);
    assert_eq!(feed.publish(&message("m2", "s1")), 0);
}

#[test]
fn test_store_follows_user_dashboard() {
    let feed = Arc::new(ChangeFeed::new());
    let manager = manager_on(&feed);
    let mirror = Arc::new(MemoryStore::new());

    manager
        .subscribe(
            "user:u1",
            vec![
                WatchFilter::table(Table::Swarms).filter(Predicate::eq("user_id", "u1")),
                WatchFilter::table(Table::Agents).filter(Predicate::eq("user_id", "u1")),
            ],
            Handlers::new().with_store(mirror.clone()),
        )
        .unwrap();
    assert!(wait_until(WAIT, || connected(&manager)));

    for i in 0..10 {
        feed.publish(&RawChange::insert(
            Table::Agents,
            json!({"id": format!("a{}", i), "user_id": "u1", "name": "worker"}),
        ));
    }
    feed.publish(&RawChange::insert(
        Table::Swarms,
        json!({"id": "s1", "user_id": "u1", "name": "Research", "status": "draft"}),
    ));
    feed.publish(&RawChange::delete(
        Table::Agents,
        json!({"id": "a3", "user_id": "u1"}),
    ));

    assert!(wait_until(WAIT, || {
        mirror.len(Table::Agents) == 9 && mirror.len(Table::Swarms) == 1
    }));
    assert!(mirror.get(Table::Agents, "a3").is_none());
}

// --- Reconnect Tests ---

#[test]
fn test_reconnects_after_feed_drop() {
    init_tracing();
    let feed = Arc::new(ChangeFeed::new());
    let manager = manager_on(&feed);
    let (handlers, rx) = message_handlers();

    manager
        .subscribe("swarm:s1", vec![WatchFilter::table(Table::Messages)], handlers)
        .unwrap();
    assert!(wait_until(WAIT, || connected(&manager)));

    assert_eq!(feed.fail_all(FailureKind::Closed), 1);
    assert!(wait_until(WAIT, || connected(&manager)));
    assert_eq!(manager.attempt(), 0);
    assert_eq!(feed.connection_count(), 1);

    feed.publish(&message("m1", "s1"));
    assert!(rx.recv_timeout(WAIT).is_ok());
}

#[test]
fn test_resubscribe_switches_channel() {
    let feed = Arc::new(ChangeFeed::new());
    let manager = manager_on(&feed);

    for swarm in ["s1", "s2", "s3"] {
        let (handlers, _rx) = message_handlers();
        manager
            .subscribe(
                format!("swarm:{}", swarm),
                vec![WatchFilter::table(Table::Messages).filter(Predicate::eq("swarm_id", swarm))],
                handlers,
            )
            .unwrap();
    }

    assert!(wait_until(WAIT, || connected(&manager)));
    assert_eq!(feed.channels(), vec!["swarm:s3".to_string()]);
    assert_eq!(manager.channel_key().as_deref(), Some("swarm:s3"));
}

/// Transport that refuses every connection.
#[derive(Default)]
struct RefusingTransport {
    attempts: Mutex<usize>,
}

impl Transport for RefusingTransport {
    fn connect(
        &self,
        _channel: &str,
        _filters: &[WatchFilter],
        _sink: TransportSink,
    ) -> hive_realtime::Result<ConnectionHandle> {
        *self.attempts.lock() += 1;
        Err(RealtimeError::Transport("connection refused".to_string()))
    }

    fn close(&self, _handle: ConnectionHandle) {}
}

#[test]
fn test_gives_up_after_max_attempts() {
    init_tracing();
    let transport = Arc::new(RefusingTransport::default());
    let (note_tx, note_rx) = unbounded::<Notification>();
    let manager = SessionManager::builder(transport.clone(), Arc::new(ThreadScheduler::new()))
        .config(fast_config())
        .sink(Arc::new(ChannelSink::new(note_tx)))
        .build()
        .unwrap();

    let (handlers, _rx) = message_handlers();
    manager
        .subscribe("swarm:s1", vec![WatchFilter::table(Table::Messages)], handlers)
        .unwrap();

    let note = note_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(note.kind, NotificationKind::Error);
    assert_eq!(note.title, "Connection lost");
    assert_eq!(manager.connection_status(), ConnectionStatus::Error);

    // 20 + 40 + 80ms of retries, then nothing more
    thread::sleep(Duration::from_millis(300));
    assert_eq!(*transport.attempts.lock(), 4);
    assert!(note_rx.try_recv().is_err());

    // A manual reconnect starts a fresh round
    manager.reconnect();
    assert!(note_rx.recv_timeout(WAIT).is_ok());
    assert_eq!(*transport.attempts.lock(), 8);
}

// --- Environment Tests ---

#[test]
fn test_offline_then_online() {
    let feed = Arc::new(ChangeFeed::new());
    let manager = manager_on(&feed);
    let environment = Arc::new(Environment::new());
    manager.attach_environment(environment.clone());

    let (handlers, rx) = message_handlers();
    manager
        .subscribe("swarm:s1", vec![WatchFilter::table(Table::Messages)], handlers)
        .unwrap();
    assert!(wait_until(WAIT, || connected(&manager)));
    assert_eq!(environment.listener_count(), 1);

    environment.emit(EnvironmentSignal::Offline);
    assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);
    feed.publish(&message("m1", "s1"));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    environment.emit(EnvironmentSignal::Online);
    assert!(wait_until(WAIT, || connected(&manager)));
    assert_eq!(feed.connection_count(), 1);
    feed.publish(&message("m2", "s1"));
    let event = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(event.row().map(|r| r.id()), Some("m2".to_string()));

    manager.unsubscribe();
    assert_eq!(environment.listener_count(), 0);
    environment.emit(EnvironmentSignal::Online);
    assert_eq!(feed.connection_count(), 0);
}

#[test]
fn test_drop_closes_connection() {
    let feed = Arc::new(ChangeFeed::new());
    {
        let manager = manager_on(&feed);
        let (handlers, _rx) = message_handlers();
        manager
            .subscribe("swarm:s1", vec![WatchFilter::table(Table::Messages)], handlers)
            .unwrap();
        assert!(wait_until(WAIT, || connected(&manager)));
        assert_eq!(feed.connection_count(), 1);
    }
    assert_eq!(feed.connection_count(), 0);
}
