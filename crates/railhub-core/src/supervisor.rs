//! Connection supervision.
//!
//! The [`ConnectionSupervisor`] owns the hub registry. Every registered
//! hub gets one task that connects, pumps notifications into the hub's
//! broadcast channel, notices link loss and reconnects with capped
//! exponential backoff. A hub that stays out of range is retried forever
//! at the capped interval.
//!
//! Only the supervisor writes connection state. Everyone else reads it
//! through accessors or subscribes to [`FleetEvent::StateChanged`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use railhub_types::{ConnectionState, HubRole, Notification};

use crate::backoff::BackoffPolicy;
use crate::clock::Clock;
use crate::codec::{Codecs, HubCodec};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, FleetEvent, HubInfo, LinkLossReason};
use crate::scan::{DiscoveryEvent, RadioGate};
use crate::traits::{Connector, NotificationStream, Session};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Delays between reconnection attempts.
    pub backoff: BackoffPolicy,
    /// Upper bound for establishing one session.
    pub connect_timeout: Duration,
    /// Treat the link as lost after this long without a notification.
    /// `None` relies on the platform's disconnect report alone.
    pub notification_timeout: Option<Duration>,
    pub max_train_connections: usize,
    pub max_switch_connections: usize,
    /// Buffered notifications per hub before slow subscribers lag.
    pub notification_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::for_reconnect(),
            connect_timeout: Duration::from_secs(20),
            notification_timeout: Some(Duration::from_secs(10)),
            max_train_connections: 10,
            max_switch_connections: 10,
            notification_capacity: 64,
        }
    }
}

impl SupervisorConfig {
    #[must_use]
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = policy;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn notification_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.notification_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_connections(mut self, role: HubRole, limit: usize) -> Self {
        match role {
            HubRole::Train => self.max_train_connections = limit,
            HubRole::Switch => self.max_switch_connections = limit,
        }
        self
    }

    pub fn limit_for(&self, role: HubRole) -> usize {
        match role {
            HubRole::Train => self.max_train_connections,
            HubRole::Switch => self.max_switch_connections,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.backoff.validate()?;
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be greater than zero"));
        }
        if self.notification_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::invalid_config(
                "notification_timeout must be greater than zero when set",
            ));
        }
        if self.notification_capacity == 0 {
            return Err(Error::invalid_config("notification_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// The session currently open for a hub.
#[derive(Clone)]
pub struct LiveSession {
    pub session: Arc<dyn Session>,
    lost: CancellationToken,
}

impl LiveSession {
    /// Tell the supervisor this session is dead.
    pub fn mark_lost(&self) {
        self.lost.cancel();
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Resolves once the session is marked lost or torn down.
    pub async fn lost(&self) {
        self.lost.cancelled().await;
    }
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("hub_id", &self.session.hub_id())
            .field("lost", &self.lost.is_cancelled())
            .finish()
    }
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone)]
pub struct HubRecord {
    pub info: HubInfo,
    pub state: ConnectionState,
    pub rssi: Option<i16>,
    pub last_seen: Option<Instant>,
}

struct HubEntry {
    info: HubInfo,
    state: ConnectionState,
    rssi: Option<i16>,
    last_seen: Option<Instant>,
    session: Option<LiveSession>,
    notifications: broadcast::Sender<Notification>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Bumped for every connection task; a finished task only touches the
    /// entry while its generation is current.
    generation: u64,
    /// Set between `halt` and `resume`; discovery must not restart the hub.
    halted: bool,
}

impl HubEntry {
    fn record(&self) -> HubRecord {
        HubRecord {
            info: self.info.clone(),
            state: self.state,
            rssi: self.rssi,
            last_seen: self.last_seen,
        }
    }
}

/// Hub id and the generation of the task acting on it.
type TaskSlot<'a> = (&'a str, u64);

struct HubTask {
    info: HubInfo,
    generation: u64,
    cancel: CancellationToken,
    notifications: broadcast::Sender<Notification>,
}

/// The entry, if `slot` still names its running task.
fn current<'m>(
    hubs: &'m mut HashMap<String, HubEntry>,
    (hub_id, generation): TaskSlot<'_>,
) -> Option<&'m mut HubEntry> {
    hubs.get_mut(hub_id).filter(|e| e.generation == generation)
}

enum PumpEnd {
    Lost(LinkLossReason),
    Cancelled,
}

pub struct ConnectionSupervisor {
    hubs: RwLock<HashMap<String, HubEntry>>,
    refused: std::sync::Mutex<HashSet<String>>,
    connector: Arc<dyn Connector>,
    codecs: Codecs,
    clock: Arc<dyn Clock>,
    config: SupervisorConfig,
    events: EventDispatcher,
    gate: RadioGate,
    closed: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        codecs: Codecs,
        clock: Arc<dyn Clock>,
        config: SupervisorConfig,
        events: EventDispatcher,
        gate: RadioGate,
    ) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            refused: std::sync::Mutex::new(HashSet::new()),
            connector,
            codecs,
            clock,
            config,
            events,
            gate,
            closed: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Held while a connection is being established.
    pub fn radio_gate(&self) -> &RadioGate {
        &self.gate
    }

    /// Handle a classified advertisement.
    ///
    /// Unknown hubs are registered (subject to the per-role limit) and a
    /// connection task is started for them. Returns the hub if it was newly
    /// registered.
    pub async fn on_discovery(self: &Arc<Self>, event: &DiscoveryEvent) -> Option<HubInfo> {
        if self.closed.is_cancelled() {
            return None;
        }
        let now = self.clock.now();
        let mut hubs = self.hubs.write().await;

        if let Some(entry) = hubs.get_mut(&event.address) {
            if event.rssi.is_some() {
                entry.rssi = event.rssi;
            }
            entry.last_seen = Some(now);
            if entry.info.name.is_none() {
                entry.info.name = event.name.clone();
            }
            if !entry.halted && entry.task.as_ref().is_none_or(|t| t.is_finished()) {
                debug!(hub_id = %event.address, "Restarting connection task for known hub");
                entry.cancel = CancellationToken::new();
                entry.task = Some(self.spawn_task(entry));
            }
            return None;
        }

        let mut info = HubInfo::new(event.address.clone(), event.role);
        info.name = event.name.clone();

        let limit = self.config.limit_for(event.role);
        let registered = hubs.values().filter(|e| e.info.role == event.role).count();
        if registered >= limit {
            let first = self
                .refused
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(info.id.clone());
            if first {
                warn!(
                    hub_id = %info.id,
                    role = %info.role,
                    limit,
                    "Connection limit reached, ignoring hub"
                );
                self.events.send(FleetEvent::RegistrationRefused { hub: info, limit });
            }
            return None;
        }

        info!(hub_id = %info.id, name = ?info.name, role = %info.role, "Registering hub");
        let (notifications, _) = broadcast::channel(self.config.notification_capacity);
        let mut entry = HubEntry {
            info: info.clone(),
            state: ConnectionState::Disconnected,
            rssi: event.rssi,
            last_seen: Some(now),
            session: None,
            notifications,
            cancel: CancellationToken::new(),
            task: None,
            generation: 0,
            halted: false,
        };
        entry.task = Some(self.spawn_task(&mut entry));
        hubs.insert(info.id.clone(), entry);
        drop(hubs);

        self.events.send(FleetEvent::Registered { hub: info.clone() });
        Some(info)
    }

    fn spawn_task(self: &Arc<Self>, entry: &mut HubEntry) -> JoinHandle<()> {
        entry.generation += 1;
        let supervisor = Arc::clone(self);
        let task = HubTask {
            info: entry.info.clone(),
            generation: entry.generation,
            cancel: entry.cancel.clone(),
            notifications: entry.notifications.clone(),
        };
        tokio::spawn(async move { supervisor.run_hub(task).await })
    }

    async fn run_hub(self: Arc<Self>, task: HubTask) {
        let HubTask {
            info,
            generation,
            cancel,
            notifications,
        } = task;
        let hub_id = info.id.clone();
        let slot = (hub_id.as_str(), generation);
        let codec = self.codecs.for_role(info.role);
        let mut backoff = self.config.backoff.backoff();

        loop {
            self.set_state(slot, ConnectionState::Connecting).await;

            let attempt = {
                let _quiet = self.gate.hold();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&info)) => r,
                }
            };

            match attempt {
                Ok(Ok(session)) => match session.notifications().await {
                    Ok(stream) => {
                        backoff.reset();
                        let live = LiveSession {
                            session: Arc::clone(&session),
                            lost: cancel.child_token(),
                        };
                        self.install(slot, live.clone()).await;
                        info!(hub_id = %hub_id, "Hub connected");

                        let end = self
                            .pump(&hub_id, stream, &live, &cancel, codec.as_ref(), &notifications)
                            .await;

                        live.mark_lost();
                        self.uninstall(slot).await;
                        if let Err(e) = session.disconnect().await {
                            debug!(hub_id = %hub_id, error = %e, "Disconnect after link loss failed");
                        }
                        match end {
                            PumpEnd::Cancelled => break,
                            PumpEnd::Lost(reason) => {
                                warn!(hub_id = %hub_id, ?reason, "Link lost");
                                self.events.send(FleetEvent::LinkLost {
                                    hub_id: hub_id.clone(),
                                    reason,
                                });
                            }
                        }
                    }
                    Err(e) => {
                        warn!(hub_id = %hub_id, error = %e, "Failed to subscribe to notifications");
                        let _ = session.disconnect().await;
                    }
                },
                Ok(Err(e)) => warn!(hub_id = %hub_id, error = %e, "Connection attempt failed"),
                Err(_) => warn!(
                    hub_id = %hub_id,
                    timeout = ?self.config.connect_timeout,
                    "Connection attempt timed out"
                ),
            }

            self.set_state(slot, ConnectionState::Reconnecting).await;
            let delay = backoff.next_delay();
            debug!(hub_id = %hub_id, ?delay, attempt = backoff.attempts(), "Waiting before reconnect");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(delay) => {}
            }
        }

        self.set_state(slot, ConnectionState::Disconnected).await;
    }

    async fn pump(
        &self,
        hub_id: &str,
        mut stream: NotificationStream,
        live: &LiveSession,
        cancel: &CancellationToken,
        codec: &dyn HubCodec,
        notifications: &broadcast::Sender<Notification>,
    ) -> PumpEnd {
        let window = self.config.notification_timeout;
        loop {
            let silence = async {
                match window {
                    Some(window) => tokio::time::sleep(window).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PumpEnd::Cancelled,
                _ = live.lost() => return PumpEnd::Lost(LinkLossReason::WriteFailure),
                item = stream.next() => match item {
                    Some(payload) => {
                        self.touch(hub_id).await;
                        match codec.decode(&payload) {
                            Ok(notification) => {
                                // nobody listening is fine
                                let _ = notifications.send(notification);
                            }
                            Err(e) => debug!(hub_id, error = %e, "Dropping undecodable notification"),
                        }
                    }
                    None => return PumpEnd::Lost(LinkLossReason::Disconnected),
                },
                _ = silence => return PumpEnd::Lost(LinkLossReason::NotificationTimeout),
            }
        }
    }

    async fn install(&self, slot: TaskSlot<'_>, live: LiveSession) {
        let now = self.clock.now();
        if let Some(entry) = current(&mut *self.hubs.write().await, slot) {
            entry.session = Some(live);
            entry.last_seen = Some(now);
        }
        self.set_state(slot, ConnectionState::Connected).await;
    }

    async fn uninstall(&self, slot: TaskSlot<'_>) {
        if let Some(entry) = current(&mut *self.hubs.write().await, slot) {
            entry.session = None;
        }
    }

    async fn touch(&self, hub_id: &str) {
        let now = self.clock.now();
        if let Some(entry) = self.hubs.write().await.get_mut(hub_id) {
            entry.last_seen = Some(now);
        }
    }

    async fn set_state(&self, slot: TaskSlot<'_>, to: ConnectionState) {
        let hub_id = slot.0;
        let from = {
            let mut hubs = self.hubs.write().await;
            let Some(entry) = current(&mut hubs, slot) else {
                return;
            };
            std::mem::replace(&mut entry.state, to)
        };
        if from != to {
            debug!(hub_id, %from, %to, "Connection state changed");
            self.events.send(FleetEvent::StateChanged {
                hub_id: hub_id.to_string(),
                from,
                to,
            });
        }
    }

    pub async fn current_state(&self, hub_id: &str) -> Option<ConnectionState> {
        self.hubs.read().await.get(hub_id).map(|e| e.state)
    }

    pub async fn signal_strength(&self, hub_id: &str) -> Option<i16> {
        self.hubs.read().await.get(hub_id).and_then(|e| e.rssi)
    }

    pub async fn last_seen(&self, hub_id: &str) -> Option<Instant> {
        self.hubs.read().await.get(hub_id).and_then(|e| e.last_seen)
    }

    pub async fn hub(&self, hub_id: &str) -> Option<HubRecord> {
        self.hubs.read().await.get(hub_id).map(HubEntry::record)
    }

    /// All registered hubs, ordered by id.
    pub async fn hubs(&self) -> Vec<HubRecord> {
        let mut records: Vec<_> = self.hubs.read().await.values().map(HubEntry::record).collect();
        records.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        records
    }

    /// Decoded notifications from the hub, across reconnects.
    pub async fn subscribe(&self, hub_id: &str) -> Option<broadcast::Receiver<Notification>> {
        self.hubs
            .read()
            .await
            .get(hub_id)
            .map(|e| e.notifications.subscribe())
    }

    /// The session currently open for the hub, if connected.
    pub async fn session(&self, hub_id: &str) -> Option<LiveSession> {
        self.hubs
            .read()
            .await
            .get(hub_id)
            .and_then(|e| e.session.clone())
    }

    /// Token cancelled when the hub is reset or the supervisor shuts down.
    pub async fn cancellation(&self, hub_id: &str) -> Option<CancellationToken> {
        self.hubs.read().await.get(hub_id).map(|e| e.cancel.clone())
    }

    /// Mark the hub's current session as lost.
    pub async fn report_link_loss(&self, hub_id: &str) {
        if let Some(live) = self.session(hub_id).await {
            live.mark_lost();
        }
    }

    /// Re-read RSSI from every open session.
    pub async fn refresh_signal(&self) {
        let sessions: Vec<_> = {
            let hubs = self.hubs.read().await;
            hubs.iter()
                .filter_map(|(id, e)| e.session.clone().map(|s| (id.clone(), s)))
                .collect()
        };
        for (hub_id, live) in sessions {
            if let Some(rssi) = live.session.read_rssi().await
                && let Some(entry) = self.hubs.write().await.get_mut(&hub_id)
            {
                entry.rssi = Some(rssi);
            }
        }
    }

    /// Tear down and restart the session of one hub, or of every hub.
    ///
    /// In-flight commands for the affected hubs are cancelled.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn reset(self: &Arc<Self>, hub_id: Option<&str>) -> Result<()> {
        self.halt(hub_id).await?;
        self.resume(hub_id).await;
        self.events.send(FleetEvent::Reset {
            hub_id: hub_id.map(str::to_string),
        });
        Ok(())
    }

    /// First half of a reset: stop the connection tasks and wait for their
    /// sessions to close. Hubs stay registered.
    pub async fn halt(&self, hub_id: Option<&str>) -> Result<()> {
        let stopped = {
            let mut hubs = self.hubs.write().await;
            let mut stopped = Vec::new();
            match hub_id {
                Some(id) => {
                    let entry = hubs
                        .get_mut(id)
                        .ok_or_else(|| Error::UnknownHub(id.to_string()))?;
                    entry.halted = true;
                    entry.cancel.cancel();
                    stopped.extend(entry.task.take());
                }
                None => {
                    for entry in hubs.values_mut() {
                        entry.halted = true;
                        entry.cancel.cancel();
                        stopped.extend(entry.task.take());
                    }
                    self.refused.lock().unwrap_or_else(|e| e.into_inner()).clear();
                }
            }
            stopped
        };
        for task in stopped {
            let _ = task.await;
        }
        Ok(())
    }

    /// Second half of a reset: start fresh connection tasks for halted hubs.
    ///
    /// Until then a halted hub ignores its own advertisements.
    pub async fn resume(self: &Arc<Self>, hub_id: Option<&str>) {
        if self.closed.is_cancelled() {
            return;
        }
        let mut hubs = self.hubs.write().await;
        for (id, entry) in hubs.iter_mut() {
            if hub_id.is_none_or(|h| h == id) && entry.halted {
                entry.halted = false;
                if entry.task.is_none() {
                    entry.cancel = CancellationToken::new();
                    entry.task = Some(self.spawn_task(entry));
                }
            }
        }
    }

    /// Stop every connection task and refuse further registrations.
    pub async fn shutdown(&self) {
        self.closed.cancel();
        let _ = self.halt(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::mock::{ManualClock, MockConnector, MockHub};
    use railhub_types::wire;

    fn discovery(hub: &MockHub) -> DiscoveryEvent {
        DiscoveryEvent {
            address: hub.id().to_string(),
            name: Some("hub".into()),
            role: hub.role(),
            rssi: Some(-55),
        }
    }

    fn supervisor(
        connector: Arc<MockConnector>,
        clock: Arc<dyn Clock>,
        config: SupervisorConfig,
    ) -> Arc<ConnectionSupervisor> {
        Arc::new(ConnectionSupervisor::new(
            connector,
            Codecs::default(),
            clock,
            config,
            EventDispatcher::default(),
            RadioGate::new(),
        ))
    }

    async fn wait_for_state(sup: &ConnectionSupervisor, hub_id: &str, state: ConnectionState) {
        while sup.current_state(hub_id).await != Some(state) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(SupervisorConfig::default().validate().is_ok());
        assert!(
            SupervisorConfig::default()
                .notification_timeout(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
        assert!(
            SupervisorConfig::default()
                .connect_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_connects_hub() {
        let hub = MockHub::new("train-1", HubRole::Train);
        let connector = Arc::new(MockConnector::new());
        connector.add(Arc::clone(&hub));
        let sup = supervisor(connector, Arc::new(TokioClock), SupervisorConfig::default());

        let registered = sup.on_discovery(&discovery(&hub)).await;
        assert_eq!(registered.map(|h| h.role), Some(HubRole::Train));
        assert!(sup.on_discovery(&discovery(&hub)).await.is_none());

        wait_for_state(&sup, "train-1", ConnectionState::Connected).await;
        assert_eq!(sup.signal_strength("train-1").await, Some(-55));
        assert!(sup.last_seen("train-1").await.is_some());
        assert!(sup.session("train-1").await.is_some());
        assert_eq!(hub.connect_count(), 1);

        sup.shutdown().await;
        assert_eq!(
            sup.current_state("train-1").await,
            Some(ConnectionState::Disconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_are_decoded_and_broadcast() {
        let hub = MockHub::new("train-1", HubRole::Train);
        let connector = Arc::new(MockConnector::new());
        connector.add(Arc::clone(&hub));
        let sup = supervisor(connector, Arc::new(TokioClock), SupervisorConfig::default());

        sup.on_discovery(&discovery(&hub)).await;
        let mut rx = sup.subscribe("train-1").await.unwrap();
        wait_for_state(&sup, "train-1", ConnectionState::Connected).await;

        hub.push(wire::encode_tuple(&[21.into(), 3.into()]));
        match rx.recv().await.unwrap() {
            Notification::Color(reading) => assert_eq!(reading.color.code(), 3),
            other => panic!("unexpected {other:?}"),
        }
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_reconnects() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        let connector = Arc::new(MockConnector::new());
        connector.add(Arc::clone(&hub));
        let sup = supervisor(connector, Arc::new(TokioClock), SupervisorConfig::default());
        let mut events = sup.events();

        sup.on_discovery(&discovery(&hub)).await;
        wait_for_state(&sup, "sw-1", ConnectionState::Connected).await;

        hub.drop_link();
        wait_for_state(&sup, "sw-1", ConnectionState::Reconnecting).await;
        wait_for_state(&sup, "sw-1", ConnectionState::Connected).await;
        assert_eq!(hub.connect_count(), 2);

        let mut saw_loss = false;
        while let Ok(event) = events.try_recv() {
            if let FleetEvent::LinkLost { reason, .. } = event {
                assert_eq!(reason, LinkLossReason::Disconnected);
                saw_loss = true;
            }
        }
        assert!(saw_loss);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_hub_is_treated_as_lost() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        let connector = Arc::new(MockConnector::new());
        connector.add(Arc::clone(&hub));
        let config =
            SupervisorConfig::default().notification_timeout(Some(Duration::from_secs(3)));
        let sup = supervisor(connector, Arc::new(TokioClock), config);
        let mut events = sup.events();

        sup.on_discovery(&discovery(&hub)).await;
        let reason = loop {
            if let FleetEvent::LinkLost { reason, .. } = events.recv().await.unwrap() {
                break reason;
            }
        };
        assert_eq!(reason, LinkLossReason::NotificationTimeout);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_resets_after_success() {
        let hub = MockHub::new("train-1", HubRole::Train);
        hub.fail_next_connects(3);
        let connector = Arc::new(MockConnector::new());
        connector.add(Arc::clone(&hub));
        let clock = Arc::new(ManualClock::new());
        let config = SupervisorConfig::default().backoff(
            BackoffPolicy::default()
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(3))
                .jitter(0.0),
        );
        let sup = supervisor(connector, clock.clone(), config);

        sup.on_discovery(&discovery(&hub)).await;
        wait_for_state(&sup, "train-1", ConnectionState::Connected).await;
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3)
            ]
        );

        hub.drop_link();
        clock.wait_for_sleeps(4).await;
        assert_eq!(clock.sleeps()[3], Duration::from_secs(1));
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_limit_refuses_extra_hubs() {
        let connector = Arc::new(MockConnector::new());
        let first = MockHub::new("train-1", HubRole::Train);
        let second = MockHub::new("train-2", HubRole::Train);
        connector.add(Arc::clone(&first));
        connector.add(Arc::clone(&second));
        let config = SupervisorConfig::default().max_connections(HubRole::Train, 1);
        let sup = supervisor(connector, Arc::new(TokioClock), config);
        let mut events = sup.events();

        assert!(sup.on_discovery(&discovery(&first)).await.is_some());
        assert!(sup.on_discovery(&discovery(&second)).await.is_none());
        assert!(sup.on_discovery(&discovery(&second)).await.is_none());
        assert!(sup.current_state("train-2").await.is_none());

        let refusals = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, FleetEvent::RegistrationRefused { .. }))
            .count();
        assert_eq!(refusals, 1);
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restarts_session() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        let connector = Arc::new(MockConnector::new());
        connector.add(Arc::clone(&hub));
        let sup = supervisor(connector, Arc::new(TokioClock), SupervisorConfig::default());

        sup.on_discovery(&discovery(&hub)).await;
        wait_for_state(&sup, "sw-1", ConnectionState::Connected).await;
        let token = sup.cancellation("sw-1").await.unwrap();

        sup.reset(Some("sw-1")).await.unwrap();
        assert!(token.is_cancelled());
        wait_for_state(&sup, "sw-1", ConnectionState::Connected).await;
        assert_eq!(hub.connect_count(), 2);

        assert!(matches!(
            sup.reset(Some("nope")).await,
            Err(Error::UnknownHub(_))
        ));
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertisement_during_reset_waits_for_resume() {
        let hub = MockHub::new("sw-1", HubRole::Switch);
        hub.set_disconnect_delay(Duration::from_millis(500));
        let connector = Arc::new(MockConnector::new());
        connector.add(Arc::clone(&hub));
        let sup = supervisor(connector, Arc::new(TokioClock), SupervisorConfig::default());

        sup.on_discovery(&discovery(&hub)).await;
        wait_for_state(&sup, "sw-1", ConnectionState::Connected).await;

        let halting = Arc::clone(&sup);
        let halt = tokio::spawn(async move { halting.halt(Some("sw-1")).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!halt.is_finished());

        assert!(sup.on_discovery(&discovery(&hub)).await.is_none());
        halt.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hub.connect_count(), 1);
        assert_eq!(
            sup.current_state("sw-1").await,
            Some(ConnectionState::Disconnected)
        );

        sup.resume(Some("sw-1")).await;
        wait_for_state(&sup, "sw-1", ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hub.connect_count(), 2);
        assert_eq!(
            sup.current_state("sw-1").await,
            Some(ConnectionState::Connected)
        );
        assert!(sup.session("sw-1").await.is_some());
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_gate_held_only_while_connecting() {
        let hub = MockHub::new("train-1", HubRole::Train);
        hub.hold_connects();
        let connector = Arc::new(MockConnector::new());
        connector.add(Arc::clone(&hub));
        let sup = supervisor(connector, Arc::new(TokioClock), SupervisorConfig::default());
        assert!(!sup.radio_gate().is_held());

        sup.on_discovery(&discovery(&hub)).await;
        wait_for_state(&sup, "train-1", ConnectionState::Connecting).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sup.radio_gate().is_held());

        hub.release_connects();
        wait_for_state(&sup, "train-1", ConnectionState::Connected).await;
        assert!(!sup.radio_gate().is_held());
        sup.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_gate_released_after_failed_connect() {
        let hub = MockHub::new("train-1", HubRole::Train);
        hub.fail_next_connects(1);
        let connector = Arc::new(MockConnector::new());
        connector.add(Arc::clone(&hub));
        let config = SupervisorConfig::default()
            .backoff(BackoffPolicy::fixed(Duration::from_secs(5)));
        let sup = supervisor(connector, Arc::new(TokioClock), config);

        sup.on_discovery(&discovery(&hub)).await;
        wait_for_state(&sup, "train-1", ConnectionState::Reconnecting).await;
        assert!(!sup.radio_gate().is_held());

        wait_for_state(&sup, "train-1", ConnectionState::Connected).await;
        assert!(!sup.radio_gate().is_held());
        sup.shutdown().await;
    }
}
