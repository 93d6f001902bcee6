//! The fleet facade.
//!
//! [`Fleet`] wires scanner, supervisor, engine, controllers and monitor
//! together and exposes the operations the outer layers call: train
//! power, self-drive, switch positions, resets and status snapshots.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use railhub_types::{ConnectionState, HubRole, SwitchPosition};

use crate::clock::{Clock, TokioClock};
use crate::codec::Codecs;
use crate::error::Result;
use crate::events::{EventDispatcher, EventReceiver, FleetEvent, HubInfo};
use crate::monitor::{FleetSnapshot, MonitorConfig, StatusMonitor};
use crate::protocol::{CommandEngine, DeliveryOutcome, EngineConfig};
use crate::scan::{RadioGate, ScanEvent, ScanOptions, Scanner};
use crate::supervisor::{ConnectionSupervisor, SupervisorConfig};
use crate::switch::{SwitchConfig, SwitchController};
use crate::traits::{Connector, Radio};
use crate::train::{TrainConfig, TrainController};

/// Settings for every component of a fleet.
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    pub scan: ScanOptions,
    pub supervisor: SupervisorConfig,
    pub engine: EngineConfig,
    pub switch: SwitchConfig,
    pub train: TrainConfig,
    pub monitor: MonitorConfig,
}

impl FleetConfig {
    pub fn validate(&self) -> Result<()> {
        self.scan.validate()?;
        self.supervisor.validate()?;
        self.engine.validate()?;
        self.switch.validate()?;
        self.train.validate()?;
        self.monitor.validate()
    }
}

struct ScanTask {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct Fleet {
    radio: Arc<dyn Radio>,
    scanner: Arc<Scanner>,
    supervisor: Arc<ConnectionSupervisor>,
    engine: Arc<CommandEngine>,
    switches: Arc<SwitchController>,
    trains: Arc<TrainController>,
    monitor: Arc<StatusMonitor>,
    events: EventDispatcher,
    cancel: CancellationToken,
    scan: tokio::sync::Mutex<Option<ScanTask>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Fleet {
    pub fn new(
        config: FleetConfig,
        radio: Arc<dyn Radio>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        Self::with_parts(config, radio, connector, Codecs::default(), Arc::new(TokioClock))
    }

    /// Build a fleet with explicit codecs and time source.
    pub fn with_parts(
        config: FleetConfig,
        radio: Arc<dyn Radio>,
        connector: Arc<dyn Connector>,
        codecs: Codecs,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let events = EventDispatcher::default();
        let gate = RadioGate::new();
        let scanner = Arc::new(Scanner::new(
            Arc::clone(&radio),
            config.scan,
            gate.clone(),
            Arc::clone(&clock),
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            connector,
            codecs.clone(),
            Arc::clone(&clock),
            config.supervisor,
            events.clone(),
            gate,
        ));
        let engine = Arc::new(CommandEngine::new(
            Arc::clone(&supervisor),
            Arc::clone(&clock),
            config.engine,
            events.clone(),
        ));
        let switches = Arc::new(SwitchController::new(
            Arc::clone(&supervisor),
            Arc::clone(&engine),
            codecs.switch.clone(),
            config.switch,
            events.clone(),
        ));
        let trains = Arc::new(TrainController::new(
            Arc::clone(&supervisor),
            Arc::clone(&engine),
            codecs.train.clone(),
            config.train,
            events.clone(),
        ));
        let monitor = Arc::new(StatusMonitor::new(
            Arc::clone(&supervisor),
            Arc::clone(&engine),
            Arc::clone(&switches),
            Arc::clone(&trains),
            clock,
            config.monitor,
        ));

        Ok(Arc::new(Self {
            radio,
            scanner,
            supervisor,
            engine,
            switches,
            trains,
            monitor,
            events,
            cancel: CancellationToken::new(),
            scan: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    fn keep(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Start scanning, connecting and sampling.
    pub async fn start(self: &Arc<Self>) {
        info!("Starting fleet");
        self.keep(self.spawn_router());
        self.keep(self.monitor.start(self.cancel.child_token()));
        self.start_scanner().await;
    }

    async fn start_scanner(self: &Arc<Self>) {
        let mut scan = self.scan.lock().await;
        if scan.is_some() || self.cancel.is_cancelled() {
            return;
        }
        let cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(64);
        let scanner = self.scanner.spawn(tx, cancel.clone());
        let pump = self.spawn_discovery_pump(rx);
        *scan = Some(ScanTask {
            cancel,
            handles: vec![scanner, pump],
        });
    }

    async fn stop_scanner(&self) {
        let task = self.scan.lock().await.take();
        if let Some(task) = task {
            task.cancel.cancel();
            for handle in task.handles {
                let _ = handle.await;
            }
        }
    }

    fn spawn_discovery_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<ScanEvent>) -> JoinHandle<()> {
        let fleet = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ScanEvent::Discovered(discovery) => {
                        let mut hub = HubInfo::new(discovery.address.clone(), discovery.role);
                        hub.name = discovery.name.clone();
                        fleet.events.send(FleetEvent::Discovered {
                            hub,
                            rssi: discovery.rssi,
                        });
                        if let Some(hub) = fleet.supervisor.on_discovery(&discovery).await {
                            fleet.attach(&hub).await;
                        }
                    }
                    ScanEvent::Degraded {
                        consecutive_failures,
                    } => {
                        error!(consecutive_failures, "Scanner degraded");
                        fleet.events.send(FleetEvent::ScannerDegraded {
                            consecutive_failures,
                        });
                    }
                    ScanEvent::Recovered => {
                        info!("Scanner recovered");
                        fleet.events.send(FleetEvent::ScannerRecovered);
                    }
                }
            }
        })
    }

    async fn attach(&self, hub: &HubInfo) {
        let cancel = self.cancel.child_token();
        let handle = match hub.role {
            HubRole::Train => self.trains.attach(&hub.id, cancel).await,
            HubRole::Switch => self.switches.attach(&hub.id, cancel).await,
        };
        if let Some(handle) = handle {
            self.keep(handle);
        }
    }

    /// Probe switch motors whenever a switch hub comes up.
    fn spawn_router(self: &Arc<Self>) -> JoinHandle<()> {
        let fleet = Arc::clone(self);
        let mut events = self.events.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    e = events.recv() => e,
                };
                match event {
                    Ok(FleetEvent::StateChanged {
                        hub_id,
                        to: ConnectionState::Connected,
                        ..
                    }) => fleet.on_connected(hub_id).await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Fleet event router lagged"),
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    async fn on_connected(self: &Arc<Self>, hub_id: String) {
        let is_switch = self
            .supervisor
            .hub(&hub_id)
            .await
            .is_some_and(|h| h.info.role == HubRole::Switch);
        if !is_switch {
            return;
        }
        let switches = Arc::clone(&self.switches);
        self.keep(tokio::spawn(async move {
            if let Err(e) = switches.detect_motors(&hub_id).await {
                debug!(hub_id = %hub_id, error = %e, "Motor detection skipped");
            }
        }));
    }

    pub async fn set_train_power(&self, hub_id: &str, power: i32) -> Result<DeliveryOutcome> {
        self.trains.set_power(hub_id, power).await
    }

    pub async fn set_self_drive(&self, hub_id: &str, enabled: bool) -> Result<DeliveryOutcome> {
        self.trains.set_self_drive(hub_id, enabled).await
    }

    pub async fn set_switch_position(
        &self,
        hub_id: &str,
        letter: char,
        position: SwitchPosition,
    ) -> Result<DeliveryOutcome> {
        self.switches
            .set_position_by_letter(hub_id, letter, position)
            .await
    }

    /// Operator recovery.
    ///
    /// With a hub id, that hub's session is restarted and its counters,
    /// verified state and motor cache are cleared. Without one, the same
    /// happens for every hub and the scanner restarts on a fresh adapter.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn reset_connections(self: &Arc<Self>, hub_id: Option<&str>) -> Result<()> {
        match hub_id {
            Some(id) => {
                self.supervisor.halt(Some(id)).await?;
                self.engine.clear_hub(id);
                self.switches.forget(id);
                self.trains.forget(id);
                self.supervisor.resume(Some(id)).await;
            }
            None => {
                self.stop_scanner().await;
                self.supervisor.halt(None).await?;
                self.engine.clear_all();
                self.switches.forget_all();
                self.trains.forget_all();
                if let Err(e) = self.radio.reinitialize().await {
                    warn!(error = %e, "Adapter reinitialization during reset failed");
                }
                self.supervisor.resume(None).await;
                self.start_scanner().await;
            }
        }
        self.events.send(FleetEvent::Reset {
            hub_id: hub_id.map(str::to_string),
        });
        Ok(())
    }

    /// A snapshot sampled right now.
    pub async fn snapshot(&self) -> FleetSnapshot {
        self.monitor.sample().await
    }

    /// The snapshot from the last periodic sample.
    pub fn latest_snapshot(&self) -> Arc<FleetSnapshot> {
        self.monitor.latest()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn engine(&self) -> &Arc<CommandEngine> {
        &self.engine
    }

    pub fn switches(&self) -> &Arc<SwitchController> {
        &self.switches
    }

    pub fn trains(&self) -> &Arc<TrainController> {
        &self.trains
    }

    /// Stop every task and close every session.
    pub async fn shutdown(&self) {
        info!("Shutting down fleet");
        self.stop_scanner().await;
        self.cancel.cancel();
        self.supervisor.shutdown().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
    }
}
