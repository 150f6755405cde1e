//! Reconnecting subscription session.

use super::handlers::{validate_subscription, Handlers};
use crate::config::ManagerConfig;
use crate::environment::{Environment, EnvironmentListener, EnvironmentSignal, ListenerId};
use crate::error::Result;
use crate::machine::{Effect, ReconnectMachine, SessionInput, SessionState};
use crate::notify::{connection_lost_notification, status_notification, NotificationSink, TracingSink};
use crate::runtime::{Scheduler, TimerId};
use crate::store::EntityLookup;
use crate::transport::{ConnectionHandle, ConnectionObserver, Transport, TransportSink};
use crate::types::{
    ChangeEvent, ChildAdded, ChildRemoved, ConnectionStatus, EventKind, FailureKind, RawChange,
    StatusTransition, TransportStatus, WatchFilter,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Parameters of the current (or last) subscription.
#[derive(Clone)]
struct ActiveSubscription {
    channel: String,
    filters: Vec<WatchFilter>,
    handlers: Arc<Handlers>,
}

/// Mutable session state, guarded by one lock.
struct Session {
    machine: ReconnectMachine,
    /// Bumped by subscribe, reconnect and unsubscribe.
    generation: u64,
    /// Bumped for every connection attempt; tags transport sinks.
    connection_seq: u64,
    /// Whether the caller wants the subscription to be live.
    active: bool,
    subscription: Option<ActiveSubscription>,
    connection: Option<ConnectionHandle>,
    retry_timer: Option<TimerId>,
    last_transition: Option<StatusTransition>,
    environment: Option<Arc<Environment>>,
    listener: Option<ListenerId>,
}

/// Caller callbacks owed by an operation, delivered once no lock is held.
#[derive(Default)]
struct Outbox {
    statuses: Vec<(Arc<Handlers>, ConnectionStatus)>,
    connection_lost: bool,
}

impl Outbox {
    fn status(&mut self, handlers: Option<Arc<Handlers>>, status: ConnectionStatus) {
        if let Some(handlers) = handlers {
            self.statuses.push((handlers, status));
        }
    }

    fn deliver(self, sink: &dyn NotificationSink) {
        for (handlers, status) in self.statuses {
            handlers.emit_status(status);
        }
        if self.connection_lost {
            sink.notify(connection_lost_notification());
        }
    }
}

struct Inner {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn NotificationSink>,
    lookup: Option<Arc<dyn EntityLookup>>,
    /// Serializes subscribe, unsubscribe, reconnect and retry timers.
    op_lock: Mutex<()>,
    /// Never held while calling the transport or caller callbacks.
    state: Mutex<Session>,
    self_ref: Weak<Inner>,
}

/// Builder for [`SessionManager`].
pub struct SessionManagerBuilder {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn NotificationSink>,
    lookup: Option<Arc<dyn EntityLookup>>,
}

impl SessionManagerBuilder {
    /// Replaces the default configuration.
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets where notifications go. Defaults to `TracingSink`.
    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the entity lookup used for membership enrichment.
    pub fn lookup(mut self, lookup: Arc<dyn EntityLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Validates the configuration and creates the manager.
    pub fn build(self) -> Result<SessionManager> {
        self.config.validate()?;
        let machine = ReconnectMachine::new(self.config.reconnect_policy());

        let inner = Arc::new_cyclic(|self_ref| Inner {
            config: self.config,
            transport: self.transport,
            scheduler: self.scheduler,
            sink: self.sink,
            lookup: self.lookup,
            op_lock: Mutex::new(()),
            state: Mutex::new(Session {
                machine,
                generation: 0,
                connection_seq: 0,
                active: false,
                subscription: None,
                connection: None,
                retry_timer: None,
                last_transition: None,
                environment: None,
                listener: None,
            }),
            self_ref: self_ref.clone(),
        });

        Ok(SessionManager { inner })
    }
}

/// Keeps one logical change-feed subscription alive.
///
/// The manager opens a transport connection per attempt, retries failed
/// connections with exponential backoff, routes change events to the
/// caller's [`Handlers`] while connected and turns status-field changes into
/// notifications. Dropping the manager tears the subscription down.
///
/// # Example
///
/// ```
/// use hive_realtime::{
///     ChangeFeed, ConnectionStatus, Handlers, ManualScheduler, SessionManager, Table, WatchFilter,
/// };
/// use std::sync::Arc;
///
/// let feed = Arc::new(ChangeFeed::new());
/// let scheduler = Arc::new(ManualScheduler::new());
/// let manager = SessionManager::builder(feed, scheduler).build().unwrap();
///
/// manager
///     .subscribe(
///         "user:u1",
///         vec![WatchFilter::table(Table::Swarms)],
///         Handlers::new().on_change(Table::Swarms, |event| println!("{:?}", event)),
///     )
///     .unwrap();
/// assert_ne!(manager.connection_status(), ConnectionStatus::Disconnected);
///
/// manager.unsubscribe();
/// assert_eq!(manager.connection_status(), ConnectionStatus::Disconnected);
/// ```
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Starts building a manager over a transport and scheduler.
    pub fn builder(
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config: ManagerConfig::default(),
            transport,
            scheduler,
            sink: Arc::new(TracingSink),
            lookup: None,
        }
    }

    /// Subscribe `channel` to `filters`, replacing any current subscription.
    ///
    /// Fails only on caller misuse (empty key or filters, a table without a
    /// handler). Connection problems are reported through the status signal.
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        filters: Vec<WatchFilter>,
        handlers: Handlers,
    ) -> Result<()> {
        let channel = channel.into();
        validate_subscription(
            &channel,
            &filters,
            &handlers,
            &self.inner.config,
            self.inner.lookup.is_some(),
        )?;

        let mut outbox = Outbox::default();
        {
            let _op = self.inner.op_lock.lock();
            self.inner.start(
                Some(ActiveSubscription {
                    channel,
                    filters,
                    handlers: Arc::new(handlers),
                }),
                SessionInput::Open,
                &mut outbox,
            );
        }
        outbox.deliver(self.inner.sink.as_ref());
        Ok(())
    }

    /// Close the subscription. Safe to call at any time.
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }

    /// Reset the attempt counter and resubscribe with the last parameters.
    pub fn reconnect(&self) {
        self.inner.reconnect();
    }

    /// React to an environment signal as an attached [`Environment`] would.
    pub fn handle_environment(&self, signal: EnvironmentSignal) {
        self.inner.handle_environment(signal);
    }

    /// Listen to `environment` while subscribed.
    pub fn attach_environment(&self, environment: Arc<Environment>) {
        let _op = self.inner.op_lock.lock();
        self.inner.detach_listener();
        let active = {
            let mut state = self.inner.state.lock();
            state.environment = Some(environment);
            state.active
        };
        if active {
            self.inner.attach_listener();
        }
    }

    /// Current connection status.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.state.lock().machine.status()
    }

    /// Internal reconnect state.
    pub fn session_state(&self) -> SessionState {
        self.inner.state.lock().machine.state()
    }

    /// Automatic reconnect attempts since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.inner.state.lock().machine.attempt()
    }

    /// Most recent status-field transition seen.
    pub fn last_transition(&self) -> Option<StatusTransition> {
        self.inner.state.lock().last_transition.clone()
    }

    /// Channel of the current or last subscription.
    pub fn channel_key(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .subscription
            .as_ref()
            .map(|s| s.channel.clone())
    }

    /// Whether a subscription is active.
    pub fn is_subscribed(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Configuration in use.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.inner.unsubscribe();
    }
}

impl Inner {
    fn current_generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Begin a connection attempt. Caller holds `op_lock`.
    fn start(
        &self,
        subscription: Option<ActiveSubscription>,
        input: SessionInput,
        outbox: &mut Outbox,
    ) {
        let retry_from_timer = input == SessionInput::RetryDue;

        let (previous, timer, seq, before, after, handlers) = {
            let mut state = self.state.lock();
            if !retry_from_timer {
                state.generation += 1;
                state.active = true;
            }

            if let Some(sub) = subscription {
                let same_channel = state
                    .subscription
                    .as_ref()
                    .map_or(false, |s| s.channel == sub.channel);
                if !same_channel {
                    state.machine.clear_attempts();
                }
                state.subscription = Some(sub);
            }

            let before = state.machine.status();
            if state.machine.step(input) != Effect::Connect {
                return;
            }
            state.connection_seq += 1;

            let handlers = state.subscription.as_ref().map(|s| Arc::clone(&s.handlers));
            (
                state.connection.take(),
                state.retry_timer.take(),
                state.connection_seq,
                before,
                state.machine.status(),
                handlers,
            )
        };

        if let Some(timer) = timer {
            self.scheduler.cancel(timer);
        }
        // The old connection is gone before the new one opens.
        if let Some(handle) = previous {
            self.transport.close(handle);
        }

        self.attach_listener();
        if before != after {
            outbox.status(handlers, after);
        }
        self.open_connection(seq, outbox);
    }

    fn open_connection(&self, seq: u64, outbox: &mut Outbox) {
        let (channel, filters, attempt) = {
            let state = self.state.lock();
            if state.connection_seq != seq {
                return;
            }
            match &state.subscription {
                Some(sub) => (sub.channel.clone(), sub.filters.clone(), state.machine.attempt()),
                None => return,
            }
        };

        let observer: Weak<dyn ConnectionObserver> = self.self_ref.clone();
        let sink = TransportSink::new(seq, observer);
        tracing::debug!(%channel, attempt, seq, "opening connection");

        match self.transport.connect(&channel, &filters, sink) {
            Ok(handle) => {
                let keep = {
                    let mut state = self.state.lock();
                    let live = state.connection_seq == seq
                        && matches!(
                            state.machine.state(),
                            SessionState::Connecting | SessionState::Connected
                        );
                    if live {
                        state.connection = Some(handle);
                    }
                    live
                };
                if !keep {
                    self.transport.close(handle);
                }
            }
            Err(e) => {
                tracing::warn!(%channel, error = %e, "connect failed");
                self.apply_status(seq, TransportStatus::Failed(FailureKind::ChannelError), outbox);
            }
        }
    }

    /// Retry timer fired for `generation`.
    fn retry_due(&self, generation: u64) {
        let mut outbox = Outbox::default();
        {
            let _op = self.op_lock.lock();
            {
                let mut state = self.state.lock();
                if state.generation != generation || !state.active {
                    tracing::debug!(generation, "stale retry timer");
                    return;
                }
                state.retry_timer = None;
            }
            self.start(None, SessionInput::RetryDue, &mut outbox);
        }
        outbox.deliver(self.sink.as_ref());
    }

    fn reconnect(&self) {
        let mut outbox = Outbox::default();
        {
            let _op = self.op_lock.lock();
            if self.state.lock().subscription.is_none() {
                tracing::debug!("reconnect without a subscription");
                return;
            }
            tracing::info!("manual reconnect");
            self.start(None, SessionInput::Reset, &mut outbox);
        }
        outbox.deliver(self.sink.as_ref());
    }

    fn unsubscribe(&self) {
        let mut outbox = Outbox::default();
        {
            let _op = self.op_lock.lock();
            self.teardown(&mut outbox);
        }
        outbox.deliver(self.sink.as_ref());
    }

    /// Close everything. Caller holds `op_lock`.
    fn teardown(&self, outbox: &mut Outbox) {
        let (connection, timer, changed, handlers) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.connection_seq += 1;
            state.active = false;

            let before = state.machine.status();
            state.machine.step(SessionInput::Close);
            let changed = before != state.machine.status();
            (
                state.connection.take(),
                state.retry_timer.take(),
                changed,
                state.subscription.as_ref().map(|s| Arc::clone(&s.handlers)),
            )
        };

        if let Some(timer) = timer {
            self.scheduler.cancel(timer);
        }
        if let Some(handle) = connection {
            self.transport.close(handle);
        }
        self.detach_listener();

        if changed {
            tracing::debug!("unsubscribed");
            outbox.status(handlers, ConnectionStatus::Disconnected);
        }
    }

    fn attach_listener(&self) {
        let environment = {
            let state = self.state.lock();
            if state.listener.is_some() || !state.active {
                return;
            }
            match &state.environment {
                Some(env) => Arc::clone(env),
                None => return,
            }
        };

        let listener: Weak<dyn EnvironmentListener> = self.self_ref.clone();
        let id = environment.register(listener);
        self.state.lock().listener = Some(id);
    }

    fn detach_listener(&self) {
        let registration = {
            let mut state = self.state.lock();
            match (state.listener.take(), &state.environment) {
                (Some(id), Some(env)) => Some((id, Arc::clone(env))),
                _ => None,
            }
        };
        if let Some((id, environment)) = registration {
            environment.deregister(id);
        }
    }

    fn handle_environment(&self, signal: EnvironmentSignal) {
        let (status, handlers) = {
            let state = self.state.lock();
            if !state.active {
                return;
            }
            (
                state.machine.status(),
                state.subscription.as_ref().map(|s| Arc::clone(&s.handlers)),
            )
        };

        match signal {
            EnvironmentSignal::Online => {
                if matches!(status, ConnectionStatus::Disconnected | ConnectionStatus::Error) {
                    tracing::info!("network online, reconnecting");
                    self.reconnect();
                }
            }
            EnvironmentSignal::Offline => {
                if status != ConnectionStatus::Disconnected {
                    tracing::info!("network offline");
                    self.state
                        .lock()
                        .machine
                        .force_status(ConnectionStatus::Disconnected);
                    if let Some(handlers) = handlers {
                        handlers.emit_status(ConnectionStatus::Disconnected);
                    }
                }
            }
            EnvironmentSignal::VisibilityRestored => {
                if status != ConnectionStatus::Connected {
                    tracing::info!(%status, "visible again, reconnecting");
                    self.reconnect();
                }
            }
        }
    }

    // --- Dispatch ---

    fn dispatch(&self, generation: u64, handlers: &Arc<Handlers>, event: ChangeEvent) {
        if let Some(store) = &handlers.store {
            store.apply_change(&event);
        }
        if let Some(cb) = handlers.tables.get(&event.table) {
            cb(&event);
        }

        if event.table == self.config.status_watch.table && event.kind == EventKind::Update {
            self.detect_transition(handlers, &event);
        }

        if event.table == self.config.membership.table {
            match event.kind {
                EventKind::Insert => self.enrich_child(generation, handlers, &event),
                EventKind::Delete => self.child_removed(handlers, &event),
                EventKind::Update => {}
            }
        }
    }

    /// Compare the watched field within this one event's before/after pair.
    fn detect_transition(&self, handlers: &Handlers, event: &ChangeEvent) {
        let field = &self.config.status_watch.field;
        let (Some(before), Some(after)) = (&event.before, &event.after) else {
            return;
        };
        // Key-only old rows carry no status to compare.
        let (Some(previous), Some(current)) = (before.text_field(field), after.text_field(field))
        else {
            return;
        };
        if previous == current {
            return;
        }

        let transition = StatusTransition {
            entity_id: after.id(),
            previous,
            current,
        };
        tracing::debug!(
            entity = %transition.entity_id,
            from = %transition.previous,
            to = %transition.current,
            "status transition"
        );
        self.state.lock().last_transition = Some(transition.clone());

        if let Some(cb) = &handlers.status_transition {
            cb(&transition);
        }
        self.sink.notify(status_notification(&transition.current));
    }

    fn enrich_child(&self, generation: u64, handlers: &Arc<Handlers>, event: &ChangeEvent) {
        if handlers.child_added.is_none() {
            return;
        }
        let Some(lookup) = self.lookup.clone() else {
            return;
        };
        let membership = &self.config.membership;
        let Some(row) = &event.after else {
            return;
        };
        let (Some(parent_id), Some(child_id)) = (
            row.text_field(&membership.parent_key),
            row.text_field(&membership.child_key),
        ) else {
            tracing::debug!(table = %event.table, "membership row without keys");
            return;
        };

        let child_table = membership.child_table;
        let handlers = Arc::clone(handlers);
        let weak = self.self_ref.clone();
        self.scheduler.spawn(Box::new(move || {
            let child = match lookup.fetch_by_id(child_table, &child_id) {
                Ok(Some(child)) => child,
                Ok(None) => {
                    tracing::debug!(table = %child_table, id = %child_id, "child not found, skipping");
                    return;
                }
                Err(e) => {
                    tracing::debug!(table = %child_table, id = %child_id, error = %e, "child lookup failed, skipping");
                    return;
                }
            };

            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.current_generation() != generation {
                tracing::debug!(id = %child_id, "subscription changed during lookup, discarding");
                return;
            }
            if let Some(cb) = &handlers.child_added {
                cb(&ChildAdded { parent_id, child });
            }
        }));
    }

    fn child_removed(&self, handlers: &Handlers, event: &ChangeEvent) {
        let Some(cb) = &handlers.child_removed else {
            return;
        };
        let membership = &self.config.membership;
        let Some(row) = &event.before else {
            return;
        };
        match (
            row.text_field(&membership.parent_key),
            row.text_field(&membership.child_key),
        ) {
            (Some(parent_id), Some(child_id)) => cb(&ChildRemoved {
                parent_id,
                child_id,
            }),
            _ => tracing::debug!(id = %row.id(), "membership delete without keys, skipping"),
        }
    }
}

impl Inner {
    /// Feed a transport status into the machine. Caller callbacks land in
    /// `outbox`.
    fn apply_status(&self, seq: u64, status: TransportStatus, outbox: &mut Outbox) {
        let mut to_close = None;
        let mut gave_up = false;

        let (before, after, handlers, channel) = {
            let mut state = self.state.lock();
            if state.connection_seq != seq || !state.active {
                tracing::debug!(seq, ?status, "stale transport status");
                return;
            }

            let before = state.machine.status();
            let input = match status {
                TransportStatus::Subscribed => SessionInput::Acknowledged,
                TransportStatus::Failed(kind) => SessionInput::Failed(kind),
            };
            let channel = state
                .subscription
                .as_ref()
                .map(|s| s.channel.clone())
                .unwrap_or_default();

            match state.machine.step(input) {
                Effect::Ready => {
                    tracing::info!(%channel, "subscribed");
                }
                Effect::ScheduleRetry { delay, attempt } => {
                    to_close = state.connection.take();
                    if let Some(timer) = state.retry_timer.take() {
                        self.scheduler.cancel(timer);
                    }
                    let generation = state.generation;
                    let weak = self.self_ref.clone();
                    let timer = self.scheduler.schedule(
                        delay,
                        Box::new(move || {
                            if let Some(inner) = weak.upgrade() {
                                inner.retry_due(generation);
                            }
                        }),
                    );
                    state.retry_timer = Some(timer);
                    tracing::info!(
                        %channel,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        ?status,
                        "connection lost, retry scheduled"
                    );
                }
                Effect::GiveUp => {
                    to_close = state.connection.take();
                    gave_up = true;
                    tracing::warn!(
                        %channel,
                        attempts = state.machine.attempt(),
                        "reconnect attempts exhausted"
                    );
                }
                _ => {}
            }

            (
                before,
                state.machine.status(),
                state.subscription.as_ref().map(|s| Arc::clone(&s.handlers)),
                channel,
            )
        };

        if let Some(handle) = to_close {
            self.transport.close(handle);
        }
        if before != after {
            outbox.status(handlers, after);
        }
        if gave_up {
            tracing::debug!(%channel, "surfacing connection loss");
            outbox.connection_lost = true;
        }
    }
}

impl ConnectionObserver for Inner {
    fn on_status(&self, seq: u64, status: TransportStatus) {
        let mut outbox = Outbox::default();
        self.apply_status(seq, status, &mut outbox);
        outbox.deliver(self.sink.as_ref());
    }

    fn on_change(&self, seq: u64, change: RawChange) {
        let (generation, handlers) = {
            let state = self.state.lock();
            if state.connection_seq != seq || state.machine.status() != ConnectionStatus::Connected
            {
                tracing::debug!(seq, table = %change.table, "dropping change while not connected");
                return;
            }
            match &state.subscription {
                Some(sub) => (state.generation, Arc::clone(&sub.handlers)),
                None => return,
            }
        };

        let table = change.table;
        match ChangeEvent::from_raw(change) {
            Ok(event) => self.dispatch(generation, &handlers, event),
            Err(e) => tracing::warn!(%table, error = %e, "invalid change payload"),
        }
    }
}

impl EnvironmentListener for Inner {
    fn on_signal(&self, signal: EnvironmentSignal) {
        self.handle_environment(signal);
    }
}
