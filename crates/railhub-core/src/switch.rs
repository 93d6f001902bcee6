//! Switch hub control.
//!
//! A switch hub drives up to four point motors on ports A–D. Which ports
//! carry a motor, and what kind, is detected once per hub by probing and
//! then cached until an operator reset. Position commands are confirmed by
//! the position feedback the hub pushes afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use railhub_types::{HubRole, MotorKind, MotorPort, Notification, PortIdentity, PortSet, SwitchPosition};

use crate::codec::SwitchCodec;
use crate::error::{Error, InvalidCommandReason, Result};
use crate::events::{EventDispatcher, FleetEvent};
use crate::protocol::{CommandEngine, DeliveryOutcome, SendPolicy, StateSlot, Verification, VerifiedValue};
use crate::reliability::StatsKey;
use crate::supervisor::ConnectionSupervisor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchConfig {
    /// Attempts per position command.
    pub max_attempts: u32,
    /// Time to wait for position feedback per attempt.
    pub verify_timeout: Duration,
    pub probe_attempts: u32,
    pub probe_timeout: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            verify_timeout: Duration::from_secs(2),
            probe_attempts: 3,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl SwitchConfig {
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    fn command_policy(&self) -> SendPolicy {
        SendPolicy::new(self.max_attempts, self.verify_timeout)
    }

    fn probe_policy(&self) -> SendPolicy {
        SendPolicy::new(self.probe_attempts, self.probe_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        self.command_policy().validate()?;
        self.probe_policy().validate()
    }
}

#[derive(Debug, Default)]
struct SwitchHub {
    name: Option<String>,
    connected: PortSet,
    /// `None` until the motor kinds were detected.
    motors: Option<BTreeMap<MotorPort, MotorKind>>,
    commanded: BTreeMap<MotorPort, SwitchPosition>,
}

/// What the controller knows about one switch hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwitchView {
    pub name: Option<String>,
    /// Ports the hub reports a motor on.
    pub connected: PortSet,
    pub motors: Option<BTreeMap<MotorPort, MotorKind>>,
    pub commanded: BTreeMap<MotorPort, SwitchPosition>,
}

fn kinds_from(identity: &PortIdentity) -> BTreeMap<MotorPort, MotorKind> {
    MotorPort::ALL
        .into_iter()
        .filter_map(|port| identity.kind(port).map(|kind| (port, kind)))
        .collect()
}

pub struct SwitchController {
    supervisor: Arc<ConnectionSupervisor>,
    engine: Arc<CommandEngine>,
    codec: Arc<dyn SwitchCodec>,
    config: SwitchConfig,
    events: EventDispatcher,
    hubs: RwLock<HashMap<String, SwitchHub>>,
}

impl SwitchController {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        engine: Arc<CommandEngine>,
        codec: Arc<dyn SwitchCodec>,
        config: SwitchConfig,
        events: EventDispatcher,
    ) -> Self {
        Self {
            supervisor,
            engine,
            codec,
            config,
            events,
            hubs: RwLock::new(HashMap::new()),
        }
    }

    fn with_hub<T>(&self, hub_id: &str, f: impl FnOnce(&mut SwitchHub) -> T) -> T {
        let mut hubs = self.hubs.write().unwrap_or_else(|e| e.into_inner());
        f(hubs.entry(hub_id.to_string()).or_default())
    }

    async fn ensure_switch(&self, hub_id: &str) -> Result<()> {
        let record = self
            .supervisor
            .hub(hub_id)
            .await
            .ok_or_else(|| Error::UnknownHub(hub_id.to_string()))?;
        if record.info.role != HubRole::Switch {
            return Err(Error::InvalidCommand(InvalidCommandReason::WrongRole {
                hub_id: hub_id.to_string(),
                expected: HubRole::Switch,
            }));
        }
        Ok(())
    }

    /// Command a switch and wait for the hub to report the new position.
    ///
    /// Rejected without sending if the hub is unknown, the port has no
    /// detected motor, or motor kinds were not detected yet. A delivery
    /// that is never confirmed comes back as [`DeliveryOutcome::Failed`];
    /// the verified position then keeps its last confirmed value.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn set_position(
        &self,
        hub_id: &str,
        port: MotorPort,
        position: SwitchPosition,
    ) -> Result<DeliveryOutcome> {
        self.ensure_switch(hub_id).await?;

        let kind = self.with_hub(hub_id, |hub| {
            hub.motors.as_ref().map(|motors| motors.get(&port).copied())
        });
        match kind {
            None | Some(Some(MotorKind::Unknown)) => {
                return Err(Error::InvalidCommand(InvalidCommandReason::MotorKindUnknown {
                    hub_id: hub_id.to_string(),
                    port,
                }));
            }
            Some(None) => {
                return Err(Error::InvalidCommand(InvalidCommandReason::UnknownPort {
                    hub_id: hub_id.to_string(),
                    port,
                }));
            }
            Some(Some(_)) => {}
        }

        self.with_hub(hub_id, |hub| hub.commanded.insert(port, position));

        let command = self
            .engine
            .command(hub_id, self.codec.encode_position(port, position))
            .stats_key(StatsKey::port(hub_id, port))
            .confirms(StateSlot::SwitchPort(port), VerifiedValue::Position(position))
            .label("switch_position");
        let verify = Verification::observe(move |n| {
            matches!(n, Notification::Switch(status) if status.position(port) == Some(position))
        });
        let outcome = self
            .engine
            .send(command, verify, self.config.command_policy())
            .await;

        if !outcome.is_confirmed() {
            warn!(hub_id, %port, %position, attempts = outcome.attempts(), "Switch did not confirm");
        }
        Ok(outcome)
    }

    /// [`Self::set_position`] addressed by port letter.
    pub async fn set_position_by_letter(
        &self,
        hub_id: &str,
        letter: char,
        position: SwitchPosition,
    ) -> Result<DeliveryOutcome> {
        let port = MotorPort::from_letter(letter)
            .ok_or(Error::InvalidCommand(InvalidCommandReason::InvalidPort(letter)))?;
        self.set_position(hub_id, port, position).await
    }

    /// Detect which motor kinds are attached, unless already known.
    ///
    /// Returns `None` if the hub never answered the probe; the cache stays
    /// empty and position commands stay blocked.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn detect_motors(&self, hub_id: &str) -> Result<Option<BTreeMap<MotorPort, MotorKind>>> {
        self.ensure_switch(hub_id).await?;
        if let Some(known) = self.with_hub(hub_id, |hub| hub.motors.clone()) {
            return Ok(Some(known));
        }

        let command = self
            .engine
            .command(hub_id, self.codec.encode_probe())
            .label("motor_probe");
        let verify = Verification::observe(|n| matches!(n, Notification::Ports(_)));
        let outcome = self.engine.send(command, verify, self.config.probe_policy()).await;

        match outcome.evidence() {
            Some(Notification::Ports(identity)) => Ok(Some(self.cache_motors(hub_id, identity))),
            _ => {
                warn!(hub_id, attempts = outcome.attempts(), "Motor probe unanswered");
                Ok(None)
            }
        }
    }

    /// Store detected kinds unless a detection already happened.
    fn cache_motors(&self, hub_id: &str, identity: &PortIdentity) -> BTreeMap<MotorPort, MotorKind> {
        let (motors, fresh) = self.with_hub(hub_id, |hub| match &hub.motors {
            Some(known) => (known.clone(), false),
            None => {
                let detected = kinds_from(identity);
                hub.motors = Some(detected.clone());
                (detected, true)
            }
        });
        if fresh {
            info!(hub_id, ?motors, "Switch motors detected");
            self.events.send(FleetEvent::MotorsDetected {
                hub_id: hub_id.to_string(),
                ports: motors.iter().map(|(p, k)| (*p, *k)).collect(),
            });
        }
        motors
    }

    /// Follow the hub's notifications for identity and port changes.
    pub async fn attach(self: &Arc<Self>, hub_id: &str, cancel: CancellationToken) -> Option<JoinHandle<()>> {
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
                    Ok(Notification::Identity(identity)) => {
                        debug!(hub_id = %hub_id, name = %identity.name, ready = identity.ready, "Switch hub identity");
                        controller.with_hub(&hub_id, |hub| {
                            hub.name = Some(identity.name.clone());
                            hub.connected = identity.connected;
                        });
                    }
                    Ok(Notification::Switch(status)) => {
                        controller.with_hub(&hub_id, |hub| hub.connected = status.connected);
                    }
                    Ok(Notification::Ports(identity)) => {
                        controller.cache_motors(&hub_id, &identity);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => debug!(hub_id = %hub_id, skipped, "Switch watcher lagged"),
                    Err(RecvError::Closed) => return,
                }
            }
        }))
    }

    /// Drop commanded state and the motor cache of one hub.
    pub fn forget(&self, hub_id: &str) {
        self.hubs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(hub_id);
    }

    pub fn forget_all(&self) {
        self.hubs.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn commanded_position(&self, hub_id: &str, port: MotorPort) -> Option<SwitchPosition> {
        self.view(hub_id)
            .and_then(|view| view.commanded.get(&port).copied())
    }

    pub fn verified_position(&self, hub_id: &str, port: MotorPort) -> Option<SwitchPosition> {
        self.engine.verified_position(hub_id, port)
    }

    pub fn motor_kind(&self, hub_id: &str, port: MotorPort) -> MotorKind {
        self.view(hub_id)
            .and_then(|view| view.motors)
            .and_then(|motors| motors.get(&port).copied())
            .unwrap_or_default()
    }

    pub fn view(&self, hub_id: &str) -> Option<SwitchView> {
        self.hubs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(hub_id)
            .map(|hub| SwitchView {
                name: hub.name.clone(),
                connected: hub.connected,
                motors: hub.motors.clone(),
                commanded: hub.commanded.clone(),
            })
    }
}
