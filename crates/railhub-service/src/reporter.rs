//! Periodic status logging.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use railhub_core::{ConnectionState, Fleet, FleetEvent, FleetSnapshot, HubLink};

/// Headline numbers of a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub trains: usize,
    pub switches: usize,
    pub connected: usize,
    pub inactive: usize,
    pub reconnecting: usize,
    pub self_driving: usize,
}

impl Summary {
    pub fn of(snapshot: &FleetSnapshot) -> Self {
        let links = snapshot
            .trains
            .iter()
            .map(|t| &t.link)
            .chain(snapshot.switches.iter().map(|s| &s.link));

        let mut summary = Self {
            trains: snapshot.trains.len(),
            switches: snapshot.switches.len(),
            self_driving: snapshot.trains.iter().filter(|t| t.self_drive).count(),
            ..Self::default()
        };
        for link in links {
            summary.count(link);
        }
        summary
    }

    fn count(&mut self, link: &HubLink) {
        match link.state {
            ConnectionState::Connected if link.active => self.connected += 1,
            ConnectionState::Connected => self.inactive += 1,
            ConnectionState::Reconnecting => self.reconnecting += 1,
            _ => {}
        }
    }
}

/// Logs fleet snapshots on an interval and notable fleet events as they happen.
pub struct Reporter {
    fleet: Arc<Fleet>,
    interval: Option<Duration>,
}

impl Reporter {
    pub fn new(fleet: Arc<Fleet>, interval: Option<Duration>) -> Self {
        Self { fleet, interval }
    }

    pub fn start(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(log_events(
            Arc::clone(&self.fleet),
            cancel.clone(),
        ))];
        match self.interval {
            Some(every) => {
                info!("Logging fleet status every {}ms", every.as_millis());
                handles.push(tokio::spawn(log_snapshots(self.fleet, every, cancel)));
            }
            None => info!("Periodic status logging disabled"),
        }
        handles
    }
}

async fn log_snapshots(fleet: Arc<Fleet>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let snapshot = fleet.latest_snapshot();
        let summary = Summary::of(&snapshot);
        if last != Some(summary) {
            info!(
                trains = summary.trains,
                switches = summary.switches,
                connected = summary.connected,
                inactive = summary.inactive,
                reconnecting = summary.reconnecting,
                self_driving = summary.self_driving,
                "Fleet status"
            );
            last = Some(summary);
        }
        match serde_json::to_string(snapshot.as_ref()) {
            Ok(json) => debug!(snapshot = %json, "Fleet snapshot"),
            Err(e) => warn!(error = %e, "Failed to serialize snapshot"),
        }
    }
}

async fn log_events(fleet: Arc<Fleet>, cancel: CancellationToken) {
    let mut events = fleet.subscribe();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            e = events.recv() => e,
        };
        match event {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event log lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}

fn log_event(event: &FleetEvent) {
    match event {
        FleetEvent::Registered { hub } => {
            info!(hub_id = %hub.id, role = %hub.role, name = ?hub.name, "Hub registered");
        }
        FleetEvent::RegistrationRefused { hub, limit } => {
            warn!(hub_id = %hub.id, role = %hub.role, limit, "Connection limit reached");
        }
        FleetEvent::LinkLost { hub_id, reason } => {
            warn!(hub_id = %hub_id, ?reason, "Link lost");
        }
        FleetEvent::ScannerDegraded {
            consecutive_failures,
        } => {
            error!(
                consecutive_failures,
                "Scanner cannot recover, the Bluetooth stack may need a restart"
            );
        }
        FleetEvent::CommandFinished {
            hub_id,
            correlation,
            attempts,
            confirmed: false,
        } => {
            warn!(hub_id = %hub_id, correlation, attempts, "Command not confirmed");
        }
        other => debug!(event = ?other, "Fleet event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use railhub_core::{
        ReliabilityStats, SelfDriveState, SwitchHubSnapshot, TrainSnapshot,
    };
    use railhub_types::Direction;
    use time::OffsetDateTime;

    fn link(id: &str, state: ConnectionState, active: bool) -> HubLink {
        HubLink {
            hub_id: id.to_string(),
            name: None,
            state,
            active,
            rssi: None,
            signal: None,
            last_seen_secs: None,
        }
    }

    fn train(link: HubLink, self_drive: bool) -> TrainSnapshot {
        TrainSnapshot {
            link,
            commanded_power: 0,
            verified_power: None,
            reported_power: None,
            direction: Direction::Stopped,
            self_drive,
            self_drive_state: SelfDriveState::Idle,
            last_color: None,
            reliability: ReliabilityStats::default(),
        }
    }

    fn switch(link: HubLink) -> SwitchHubSnapshot {
        SwitchHubSnapshot {
            link,
            motors_detected: false,
            ports: Vec::new(),
            reliability: ReliabilityStats::default(),
        }
    }

    #[test]
    fn test_summary_counts_links() {
        let snapshot = FleetSnapshot {
            taken_at: OffsetDateTime::UNIX_EPOCH,
            trains: vec![
                train(link("t1", ConnectionState::Connected, true), true),
                train(link("t2", ConnectionState::Reconnecting, false), false),
            ],
            switches: vec![
                switch(link("s1", ConnectionState::Connected, false)),
                switch(link("s2", ConnectionState::Connecting, false)),
            ],
        };

        let summary = Summary::of(&snapshot);
        assert_eq!(
            summary,
            Summary {
                trains: 2,
                switches: 2,
                connected: 1,
                inactive: 1,
                reconnecting: 1,
                self_driving: 1,
            }
        );
    }

    #[test]
    fn test_summary_of_empty_fleet() {
        assert_eq!(Summary::of(&FleetSnapshot::empty()), Summary::default());
    }
}
