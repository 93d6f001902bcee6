//! Train hub control and self-drive.
//!
//! Power commands are confirmed by the write going through; a motor's
//! continuous power has no position to read back. The self-drive machine
//! is fed from the hub's color notifications by a watcher task per hub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use railhub_types::{Color, Direction, HubRole, Notification, TrainStatus};

use crate::codec::TrainCodec;
use crate::error::{Error, InvalidCommandReason, Result};
use crate::events::{EventDispatcher, FleetEvent};
use crate::protocol::{CommandEngine, DeliveryOutcome, SendPolicy, StateSlot, Verification, VerifiedValue};
use crate::selfdrive::{PatternAction, SelfDrive, SelfDriveConfig, SelfDriveState, Transition};
use crate::supervisor::ConnectionSupervisor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainConfig {
    pub min_power: i8,
    pub max_power: i8,
    pub max_attempts: u32,
    /// Time allowed for one power write.
    pub write_timeout: Duration,
    pub self_drive: SelfDriveConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            min_power: -100,
            max_power: 100,
            max_attempts: 3,
            write_timeout: Duration::from_secs(2),
            self_drive: SelfDriveConfig::default(),
        }
    }
}

impl TrainConfig {
    #[must_use]
    pub fn self_drive(mut self, config: SelfDriveConfig) -> Self {
        self.self_drive = config;
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_power < -100 || self.max_power > 100 || self.min_power > self.max_power {
            return Err(Error::invalid_config(
                "power range must lie within -100..=100 and min must not exceed max",
            ));
        }
        self.policy().validate()?;
        self.self_drive.validate()
    }

    fn policy(&self) -> SendPolicy {
        SendPolicy::new(self.max_attempts, self.write_timeout)
    }

    /// Check a requested power against the configured range.
    pub fn check_power(&self, power: i32) -> Result<i8> {
        i8::try_from(power)
            .ok()
            .filter(|p| (self.min_power..=self.max_power).contains(p))
            .ok_or(Error::InvalidCommand(InvalidCommandReason::PowerOutOfRange {
                power,
                min: self.min_power,
                max: self.max_power,
            }))
    }
}

#[derive(Debug)]
struct TrainHub {
    machine: SelfDrive,
    commanded_power: i8,
    status: Option<TrainStatus>,
}

/// What the controller knows about one train hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainView {
    /// Name reported by the hub program.
    pub name: Option<String>,
    pub commanded_power: i8,
    pub direction: Direction,
    pub self_drive: bool,
    pub self_drive_state: SelfDriveState,
    pub last_color: Option<Color>,
    /// Power the hub last reported running at.
    pub reported_power: Option<i8>,
}

pub struct TrainController {
    supervisor: Arc<ConnectionSupervisor>,
    engine: Arc<CommandEngine>,
    codec: Arc<dyn TrainCodec>,
    config: TrainConfig,
    events: EventDispatcher,
    hubs: Mutex<HashMap<String, TrainHub>>,
}

impl TrainController {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        engine: Arc<CommandEngine>,
        codec: Arc<dyn TrainCodec>,
        config: TrainConfig,
        events: EventDispatcher,
    ) -> Self {
        Self {
            supervisor,
            engine,
            codec,
            config,
            events,
            hubs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrainHub>> {
        self.hubs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_hub<T>(&self, hub_id: &str, f: impl FnOnce(&mut TrainHub) -> T) -> T {
        let mut hubs = self.lock();
        let hub = hubs.entry(hub_id.to_string()).or_insert_with(|| TrainHub {
            machine: SelfDrive::new(self.config.self_drive.clone()),
            commanded_power: 0,
            status: None,
        });
        f(hub)
    }

    fn publish(&self, hub_id: &str, transition: Option<Transition>) {
        if let Some(Transition { from, to }) = transition {
            info!(hub_id, %from, %to, "Self-drive state changed");
            self.events.send(FleetEvent::SelfDriveChanged {
                hub_id: hub_id.to_string(),
                from,
                to,
            });
        }
    }

    async fn ensure_train(&self, hub_id: &str) -> Result<()> {
        let record = self
            .supervisor
            .hub(hub_id)
            .await
            .ok_or_else(|| Error::UnknownHub(hub_id.to_string()))?;
        if record.info.role != HubRole::Train {
            return Err(Error::InvalidCommand(InvalidCommandReason::WrongRole {
                hub_id: hub_id.to_string(),
                expected: HubRole::Train,
            }));
        }
        Ok(())
    }

    async fn send_power(&self, hub_id: &str, power: i8, label: &'static str) -> DeliveryOutcome {
        let command = self
            .engine
            .command(hub_id, self.codec.encode_power(power))
            .confirms(StateSlot::TrainPower, VerifiedValue::Power(power))
            .label(label);
        self.engine
            .send(command, Verification::WriteAccepted, self.config.policy())
            .await
    }

    /// Set motor power; the sign gives the direction.
    ///
    /// Out-of-range values are rejected before anything is sent.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn set_power(&self, hub_id: &str, power: i32) -> Result<DeliveryOutcome> {
        let power = self.config.check_power(power)?;
        self.ensure_train(hub_id).await?;

        let transition = self.with_hub(hub_id, |hub| {
            hub.commanded_power = power;
            hub.machine.on_power(power)
        });
        self.publish(hub_id, transition);

        Ok(self.send_power(hub_id, power, "train_power").await)
    }

    /// Turn self-drive on or off. Turning it off also stops the train.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn set_self_drive(&self, hub_id: &str, enabled: bool) -> Result<DeliveryOutcome> {
        self.ensure_train(hub_id).await?;

        let transition = self.with_hub(hub_id, |hub| hub.machine.set_enabled(enabled));
        self.publish(hub_id, transition);

        let command = self
            .engine
            .command(hub_id, self.codec.encode_self_drive(enabled))
            .label("self_drive_mode");
        let mode = self
            .engine
            .send(command, Verification::WriteAccepted, self.config.policy())
            .await;
        if enabled {
            return Ok(mode);
        }
        if !mode.is_confirmed() {
            warn!(hub_id, "Self-drive off was not delivered, stopping anyway");
        }

        let transition = self.with_hub(hub_id, |hub| {
            hub.commanded_power = 0;
            hub.machine.on_power(0)
        });
        self.publish(hub_id, transition);
        Ok(self.send_power(hub_id, 0, "self_drive_stop").await)
    }

    async fn on_color(&self, hub_id: &str, color: Color) {
        let (action, transition, reversed) = self.with_hub(hub_id, |hub| {
            let before = hub.machine.state();
            let action = hub.machine.on_color(color);
            let transition = (hub.machine.state() != before).then_some(Transition {
                from: before,
                to: hub.machine.state(),
            });
            (action, transition, hub.machine.reversed_power())
        });
        self.publish(hub_id, transition);

        match action {
            Some(PatternAction::Stop) => {
                info!(hub_id, %color, "Stop marker reached");
                self.with_hub(hub_id, |hub| hub.commanded_power = 0);
                let outcome = self.send_power(hub_id, 0, "self_drive_stop").await;
                if !outcome.is_confirmed() {
                    warn!(hub_id, ?outcome, "Stop command was not delivered");
                }
                let transition = self.with_hub(hub_id, |hub| hub.machine.finish_stop());
                self.publish(hub_id, transition);
            }
            Some(PatternAction::Reverse) => {
                info!(hub_id, %color, power = reversed, "Reverse marker reached");
                let transition = self.with_hub(hub_id, |hub| {
                    hub.commanded_power = reversed;
                    hub.machine.on_power(reversed)
                });
                self.publish(hub_id, transition);
                self.send_power(hub_id, reversed, "self_drive_reverse").await;
            }
            None => {}
        }
    }

    /// Feed the hub's notifications into the self-drive machine.
    pub async fn attach(
        self: &Arc<Self>,
        hub_id: &str,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let mut rx = self.supervisor.subscribe(hub_id).await?;
        self.with_hub(hub_id, |_| ());
        let controller = Arc::clone(self);
        let hub_id = hub_id.to_string();
        Some(tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = cancel.cancelled() => return,
                    n = rx.recv() => n,
                };
                match notification {
                    Ok(Notification::Color(reading)) => {
                        controller.on_color(&hub_id, reading.color).await;
                    }
                    Ok(Notification::Train(status)) => {
                        controller.with_hub(&hub_id, |hub| hub.status = Some(status));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(hub_id = %hub_id, skipped, "Train watcher lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }))
    }

    /// Drop all controller state for one hub.
    pub fn forget(&self, hub_id: &str) {
        self.lock().remove(hub_id);
    }

    pub fn forget_all(&self) {
        self.lock().clear();
    }

    pub fn self_drive_state(&self, hub_id: &str) -> Option<SelfDriveState> {
        self.lock().get(hub_id).map(|hub| hub.machine.state())
    }

    pub fn verified_power(&self, hub_id: &str) -> Option<i8> {
        self.engine.verified_power(hub_id)
    }

    pub fn view(&self, hub_id: &str) -> Option<TrainView> {
        self.lock().get(hub_id).map(|hub| TrainView {
            name: hub.status.as_ref().map(|s| s.name.clone()),
            commanded_power: hub.commanded_power,
            direction: Direction::from_power(hub.commanded_power),
            self_drive: hub.machine.enabled(),
            self_drive_state: hub.machine.state(),
            last_color: hub.machine.last_color(),
            reported_power: hub.status.as_ref().map(|s| s.power),
        })
    }
}
