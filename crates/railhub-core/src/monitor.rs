//! Periodic fleet status.
//!
//! The [`StatusMonitor`] samples the supervisor and both controllers on a
//! fixed cadence and publishes a read-only [`FleetSnapshot`]. A hub that
//! has not been heard from within the inactivity threshold is reported as
//! inactive even while its link is still nominally open.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use railhub_types::{
    Color, ConnectionState, Direction, HubRole, MotorKind, MotorPort, SignalQuality, SwitchPosition,
};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::protocol::CommandEngine;
use crate::reliability::{ReliabilityStats, StatsKey};
use crate::selfdrive::SelfDriveState;
use crate::supervisor::{ConnectionSupervisor, HubRecord};
use crate::switch::SwitchController;
use crate::train::TrainController;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Sampling cadence.
    pub interval: Duration,
    /// Silence after which a hub is reported inactive.
    pub inactive_after: Duration,
    /// Re-read RSSI from open sessions on every sample.
    pub refresh_signal: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            inactive_after: Duration::from_secs(5),
            refresh_signal: true,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn inactive_after(mut self, threshold: Duration) -> Self {
        self.inactive_after = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::invalid_config("monitor interval must be greater than zero"));
        }
        if self.inactive_after.is_zero() {
            return Err(Error::invalid_config("inactive_after must be greater than zero"));
        }
        Ok(())
    }
}

/// Link status shared by both hub roles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubLink {
    pub hub_id: String,
    pub name: Option<String>,
    pub state: ConnectionState,
    /// Connected and heard from within the inactivity threshold.
    pub active: bool,
    pub rssi: Option<i16>,
    pub signal: Option<SignalQuality>,
    pub last_seen_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainSnapshot {
    #[serde(flatten)]
    pub link: HubLink,
    pub commanded_power: i8,
    pub verified_power: Option<i8>,
    pub reported_power: Option<i8>,
    pub direction: Direction,
    pub self_drive: bool,
    pub self_drive_state: SelfDriveState,
    pub last_color: Option<Color>,
    pub reliability: ReliabilityStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchPortSnapshot {
    pub port: MotorPort,
    pub motor_kind: MotorKind,
    pub commanded: Option<SwitchPosition>,
    pub verified: Option<SwitchPosition>,
    pub reliability: ReliabilityStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchHubSnapshot {
    #[serde(flatten)]
    pub link: HubLink,
    pub motors_detected: bool,
    pub ports: Vec<SwitchPortSnapshot>,
    /// Counters over every command sent to the hub, probes included.
    pub reliability: ReliabilityStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
    pub trains: Vec<TrainSnapshot>,
    pub switches: Vec<SwitchHubSnapshot>,
}

impl FleetSnapshot {
    pub fn empty() -> Self {
        Self {
            taken_at: OffsetDateTime::now_utc(),
            trains: Vec::new(),
            switches: Vec::new(),
        }
    }

    pub fn train(&self, hub_id: &str) -> Option<&TrainSnapshot> {
        self.trains.iter().find(|t| t.link.hub_id == hub_id)
    }

    pub fn switch(&self, hub_id: &str) -> Option<&SwitchHubSnapshot> {
        self.switches.iter().find(|s| s.link.hub_id == hub_id)
    }
}

pub struct StatusMonitor {
    supervisor: Arc<ConnectionSupervisor>,
    engine: Arc<CommandEngine>,
    switches: Arc<SwitchController>,
    trains: Arc<TrainController>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    latest: watch::Sender<Arc<FleetSnapshot>>,
}

impl StatusMonitor {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        engine: Arc<CommandEngine>,
        switches: Arc<SwitchController>,
        trains: Arc<TrainController>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
    ) -> Self {
        let (latest, _) = watch::channel(Arc::new(FleetSnapshot::empty()));
        Self {
            supervisor,
            engine,
            switches,
            trains,
            clock,
            config,
            latest,
        }
    }

    fn link(&self, record: &HubRecord, name: Option<String>) -> HubLink {
        let age = record
            .last_seen
            .map(|seen| self.clock.now().saturating_duration_since(seen));
        let active = record.state == ConnectionState::Connected
            && age.is_some_and(|age| age <= self.config.inactive_after);
        HubLink {
            hub_id: record.info.id.clone(),
            name: name.or_else(|| record.info.name.clone()),
            state: record.state,
            active,
            rssi: record.rssi,
            signal: record.rssi.map(SignalQuality::from_rssi),
            last_seen_secs: age.map(|age| age.as_secs_f64()),
        }
    }

    fn train_snapshot(&self, record: &HubRecord) -> TrainSnapshot {
        let hub_id = record.info.id.as_str();
        let view = self.trains.view(hub_id);
        let name = view.as_ref().and_then(|v| v.name.clone());
        let link = self.link(record, name);
        let reliability = self.engine.stats(&StatsKey::hub(hub_id));
        match view {
            Some(view) => TrainSnapshot {
                link,
                commanded_power: view.commanded_power,
                verified_power: self.engine.verified_power(hub_id),
                reported_power: view.reported_power,
                direction: view.direction,
                self_drive: view.self_drive,
                self_drive_state: view.self_drive_state,
                last_color: view.last_color,
                reliability,
            },
            None => TrainSnapshot {
                link,
                commanded_power: 0,
                verified_power: self.engine.verified_power(hub_id),
                reported_power: None,
                direction: Direction::Stopped,
                self_drive: false,
                self_drive_state: SelfDriveState::Idle,
                last_color: None,
                reliability,
            },
        }
    }

    fn switch_snapshot(&self, record: &HubRecord) -> SwitchHubSnapshot {
        let hub_id = record.info.id.as_str();
        let view = self.switches.view(hub_id).unwrap_or_default();
        let link = self.link(record, view.name.clone());

        let ports: Vec<MotorPort> = match &view.motors {
            Some(motors) => motors.keys().copied().collect(),
            None => view.connected.iter().collect(),
        };
        let ports = ports
            .into_iter()
            .map(|port| SwitchPortSnapshot {
                port,
                motor_kind: view
                    .motors
                    .as_ref()
                    .and_then(|m| m.get(&port).copied())
                    .unwrap_or_default(),
                commanded: view.commanded.get(&port).copied(),
                verified: self.engine.verified_position(hub_id, port),
                reliability: self.engine.stats(&StatsKey::port(hub_id, port)),
            })
            .collect();

        SwitchHubSnapshot {
            link,
            motors_detected: view.motors.is_some(),
            ports,
            reliability: self.engine.stats(&StatsKey::hub(hub_id)),
        }
    }

    /// Build a snapshot now.
    pub async fn sample(&self) -> FleetSnapshot {
        if self.config.refresh_signal {
            self.supervisor.refresh_signal().await;
        }
        let mut snapshot = FleetSnapshot::empty();
        for record in self.supervisor.hubs().await {
            match record.info.role {
                HubRole::Train => snapshot.trains.push(self.train_snapshot(&record)),
                HubRole::Switch => snapshot.switches.push(self.switch_snapshot(&record)),
            }
        }
        snapshot
    }

    /// Most recent published snapshot.
    pub fn latest(&self) -> Arc<FleetSnapshot> {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<FleetSnapshot>> {
        self.latest.subscribe()
    }

    /// Sample on the configured cadence until cancelled.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = monitor.sample().await;
                        trace!(trains = snapshot.trains.len(), switches = snapshot.switches.len(), "Status sampled");
                        monitor.latest.send_replace(Arc::new(snapshot));
                    }
                }
            }
        })
    }
}
