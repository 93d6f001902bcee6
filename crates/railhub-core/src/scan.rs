//! Hub discovery.
//!
//! The [`Scanner`] runs continuously, classifies advertisements into hub
//! roles and forwards them as [`ScanEvent`]s. It holds no sessions. When
//! the adapter misbehaves it stops, reinitializes the adapter and resumes;
//! if that keeps failing it reports [`ScanEvent::Degraded`].
//!
//! Scanning pauses while any [`RadioHold`] from the shared [`RadioGate`]
//! is alive, which the supervisor takes while establishing connections.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use railhub_types::HubRole;
use railhub_types::ble::{LEGO_HUB_SERVICE, LEGO_MANUFACTURER_ID};

use crate::backoff::BackoffPolicy;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::traits::{AdvertisementStream, Radio};
use crate::util::create_identifier;

/// Advertisement data relevant for classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// A classified hub advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    pub address: String,
    pub name: Option<String>,
    pub role: HubRole,
    pub rssi: Option<i16>,
}

/// Output of a running scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Discovered(DiscoveryEvent),
    /// Recovery failed this many times in a row.
    Degraded { consecutive_failures: u32 },
    /// Scanning resumed after being degraded.
    Recovered,
}

/// Name patterns used to tell train hubs from switch hubs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Lowercase substrings identifying a train hub.
    pub train_patterns: Vec<String>,
    /// Lowercase substrings identifying a switch hub.
    pub switch_patterns: Vec<String>,
    /// Ignore advertisements without the LEGO service or manufacturer id.
    pub require_lego_identity: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            train_patterns: vec!["train".to_string()],
            switch_patterns: vec!["technic hub".to_string(), "switch".to_string()],
            require_lego_identity: true,
        }
    }
}

/// Classify an advertisement. Returns `None` for anything that is not a
/// LEGO hub or whose name matches both roles or neither.
///
/// ```
/// use railhub_core::scan::{classify, Advertisement, ClassifierConfig};
/// use railhub_types::{ble, HubRole};
///
/// let adv = Advertisement {
///     address: "90:84:2B:00:00:01".into(),
///     name: Some("TRAIN HUB 1".into()),
///     services: vec![ble::LEGO_HUB_SERVICE],
///     ..Default::default()
/// };
/// assert_eq!(classify(&adv, &ClassifierConfig::default()), Some(HubRole::Train));
/// ```
pub fn classify(adv: &Advertisement, config: &ClassifierConfig) -> Option<HubRole> {
    let is_lego = adv.services.contains(&LEGO_HUB_SERVICE)
        || adv.manufacturer_data.contains_key(&LEGO_MANUFACTURER_ID);
    if config.require_lego_identity && !is_lego {
        return None;
    }

    let name = adv.name.as_deref()?.to_lowercase();
    let matches = |patterns: &[String]| patterns.iter().any(|p| name.contains(p.as_str()));

    match (matches(&config.train_patterns), matches(&config.switch_patterns)) {
        (true, false) => Some(HubRole::Train),
        (false, true) => Some(HubRole::Switch),
        _ => None,
    }
}

/// Scanner tuning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub classifier: ClassifierConfig,
    /// Delays between recovery attempts.
    pub recovery_backoff: BackoffPolicy,
    /// Consecutive recovery failures before reporting degraded mode.
    pub degraded_after: u32,
    /// Reinitialize the adapter before the first scan.
    pub reset_adapter_on_start: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            recovery_backoff: BackoffPolicy::default()
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(30))
                .jitter(0.0),
            degraded_after: 2,
            reset_adapter_on_start: true,
        }
    }
}

impl ScanOptions {
    #[must_use]
    pub fn classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn recovery_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.recovery_backoff = policy;
        self
    }

    #[must_use]
    pub fn degraded_after(mut self, failures: u32) -> Self {
        self.degraded_after = failures;
        self
    }

    #[must_use]
    pub fn reset_adapter_on_start(mut self, enabled: bool) -> Self {
        self.reset_adapter_on_start = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.degraded_after == 0 {
            return Err(Error::invalid_config("degraded_after must be at least 1"));
        }
        if self.classifier.train_patterns.is_empty() || self.classifier.switch_patterns.is_empty()
        {
            return Err(Error::invalid_config(
                "classifier needs at least one train and one switch pattern",
            ));
        }
        self.recovery_backoff.validate()
    }
}

/// Counts outstanding reasons to keep the radio quiet.
#[derive(Debug, Clone)]
pub struct RadioGate {
    holds: Arc<watch::Sender<usize>>,
}

/// Scanning stays paused while this is alive.
#[derive(Debug)]
pub struct RadioHold {
    holds: Arc<watch::Sender<usize>>,
}

impl RadioGate {
    pub fn new() -> Self {
        let (holds, _) = watch::channel(0);
        Self {
            holds: Arc::new(holds),
        }
    }

    pub fn hold(&self) -> RadioHold {
        self.holds.send_modify(|n| *n += 1);
        RadioHold {
            holds: Arc::clone(&self.holds),
        }
    }

    pub fn is_held(&self) -> bool {
        *self.holds.borrow() > 0
    }

    fn subscribe(&self) -> watch::Receiver<usize> {
        self.holds.subscribe()
    }
}

impl Default for RadioGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RadioHold {
    fn drop(&mut self) {
        self.holds.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Continuous hub discovery with self-recovery.
pub struct Scanner {
    radio: Arc<dyn Radio>,
    options: ScanOptions,
    gate: RadioGate,
    clock: Arc<dyn Clock>,
}

enum Interrupt {
    Paused,
    Fault(Error),
    Closed,
}

impl Scanner {
    pub fn new(
        radio: Arc<dyn Radio>,
        options: ScanOptions,
        gate: RadioGate,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            radio,
            options,
            gate,
            clock,
        }
    }

    pub fn gate(&self) -> &RadioGate {
        &self.gate
    }

    pub fn spawn(
        self: &Arc<Self>,
        events: mpsc::Sender<ScanEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let scanner = Arc::clone(self);
        tokio::spawn(async move { scanner.run(events, cancel).await })
    }

    /// Scan until cancelled or until `events` is dropped.
    pub async fn run(&self, events: mpsc::Sender<ScanEvent>, cancel: CancellationToken) {
        let mut gate = self.gate.subscribe();
        let mut recovery = RecoveryState::new(&self.options);

        if self.options.reset_adapter_on_start {
            info!("Reinitializing adapter before first scan");
            if let Err(e) = self.radio.reinitialize().await {
                warn!(error = %e, "Adapter reset on start failed");
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                free = gate.wait_for(|n| *n == 0) => if free.is_err() { return },
            }

            let mut stream = match self.radio.start_scan().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to start scan");
                    if !self.recover(&mut recovery, &events, &cancel).await {
                        return;
                    }
                    continue;
                }
            };
            if recovery.scan_started() && events.send(ScanEvent::Recovered).await.is_err() {
                return;
            }
            debug!("Scanning");

            match self.pump(&mut stream, &mut gate, &events, &cancel).await {
                Interrupt::Closed => {
                    let _ = self.radio.stop_scan().await;
                    return;
                }
                Interrupt::Paused => {
                    debug!("Pausing scan while a connection is being established");
                    let _ = self.radio.stop_scan().await;
                }
                Interrupt::Fault(e) => {
                    warn!(error = %e, "Scanner fault");
                    if !self.recover(&mut recovery, &events, &cancel).await {
                        return;
                    }
                }
            }
        }
    }

    async fn pump(
        &self,
        stream: &mut AdvertisementStream,
        gate: &mut watch::Receiver<usize>,
        events: &mpsc::Sender<ScanEvent>,
        cancel: &CancellationToken,
    ) -> Interrupt {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Interrupt::Closed,
                changed = gate.changed() => {
                    if changed.is_err() {
                        return Interrupt::Closed;
                    }
                    if *gate.borrow_and_update() > 0 {
                        return Interrupt::Paused;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(adv)) => {
                        let Some(role) = classify(&adv, &self.options.classifier) else {
                            trace!(address = %adv.address, name = ?adv.name, "Ignoring advertisement");
                            continue;
                        };
                        let event = DiscoveryEvent {
                            address: adv.address,
                            name: adv.name,
                            role,
                            rssi: adv.rssi,
                        };
                        if events.send(ScanEvent::Discovered(event)).await.is_err() {
                            return Interrupt::Closed;
                        }
                    }
                    Some(Err(e)) => return Interrupt::Fault(e),
                    None => {
                        return Interrupt::Fault(Error::ScannerFault(
                            "advertisement stream ended".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Stop, reinitialize the adapter and wait before the next start.
    /// Returns `false` when the scanner should exit.
    async fn recover(
        &self,
        recovery: &mut RecoveryState,
        events: &mpsc::Sender<ScanEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        let _ = self.radio.stop_scan().await;
        match self.radio.reinitialize().await {
            Ok(()) => info!("Adapter reinitialized"),
            Err(e) => {
                warn!(error = %e, "Adapter reinitialization failed");
                recovery.failed();
            }
        }

        if let Some(consecutive_failures) = recovery.take_degraded_signal() {
            warn!(consecutive_failures, "Scanner degraded, Bluetooth stack reset may be needed");
            if events
                .send(ScanEvent::Degraded {
                    consecutive_failures,
                })
                .await
                .is_err()
            {
                return false;
            }
        }

        let delay = recovery.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.clock.sleep(delay) => true,
        }
    }

    /// One-shot scan: collect distinct hubs seen within `duration`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn discover_for(&self, duration: Duration) -> Result<Vec<DiscoveryEvent>> {
        let mut stream = self.radio.start_scan().await?;
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                item = stream.next() => match item {
                    Some(Ok(adv)) => {
                        if let Some(role) = classify(&adv, &self.options.classifier)
                            && seen.insert(adv.address.clone())
                        {
                            found.push(DiscoveryEvent {
                                address: adv.address,
                                name: adv.name,
                                role,
                                rssi: adv.rssi,
                            });
                        }
                    }
                    Some(Err(e)) => {
                        let _ = self.radio.stop_scan().await;
                        return Err(e);
                    }
                    None => break,
                }
            }
        }
        self.radio.stop_scan().await?;
        Ok(found)
    }
}

/// Tracks consecutive recovery failures across start attempts.
struct RecoveryState {
    failures: u32,
    degraded_after: u32,
    degraded: bool,
    signalled: bool,
    backoff: crate::backoff::Backoff,
}

impl RecoveryState {
    fn new(options: &ScanOptions) -> Self {
        Self {
            failures: 0,
            degraded_after: options.degraded_after,
            degraded: false,
            signalled: false,
            backoff: options.recovery_backoff.backoff(),
        }
    }

    fn failed(&mut self) {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.degraded_after {
            self.degraded = true;
        }
    }

    /// Degraded signal, emitted once per degraded episode.
    fn take_degraded_signal(&mut self) -> Option<u32> {
        if self.degraded && !self.signalled {
            self.signalled = true;
            Some(self.failures)
        } else {
            None
        }
    }

    /// Record a successful start. Returns `true` if this ends a degraded episode.
    fn scan_started(&mut self) -> bool {
        let was_degraded = self.signalled;
        self.failures = 0;
        self.degraded = false;
        self.signalled = false;
        self.backoff.reset();
        was_degraded
    }

    fn next_delay(&mut self) -> Duration {
        self.backoff.next_delay()
    }
}

/// Get the first Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::ScannerFault("no Bluetooth adapter found".to_string()))
}

/// The system Bluetooth adapter.
pub struct BleRadio {
    adapter: RwLock<Option<Adapter>>,
}

impl BleRadio {
    pub async fn new() -> Result<Self> {
        let adapter = get_adapter().await?;
        Ok(Self {
            adapter: RwLock::new(Some(adapter)),
        })
    }

    /// Current adapter handle.
    pub async fn adapter(&self) -> Result<Adapter> {
        self.adapter
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::ScannerFault("adapter is being reinitialized".to_string()))
    }
}

async fn advertisement_for(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let props = match peripheral.properties().await {
        Ok(Some(props)) => props,
        Ok(None) => return None,
        Err(e) => {
            debug!(error = %e, "Could not read peripheral properties");
            return None;
        }
    };
    Some(Advertisement {
        address: create_identifier(&props.address.to_string(), id),
        name: props.local_name,
        rssi: props.rssi,
        services: props.services,
        manufacturer_data: props.manufacturer_data,
    })
}

#[async_trait]
impl Radio for BleRadio {
    async fn start_scan(&self) -> Result<AdvertisementStream> {
        let adapter = self.adapter().await?;
        let central_events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let stream = central_events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => return None,
                };
                advertisement_for(&adapter, &id).await.map(Ok)
            }
        });
        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        let adapter = self.adapter().await?;
        adapter.stop_scan().await?;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn reinitialize(&self) -> Result<()> {
        let mut guard = self.adapter.write().await;
        if let Some(old) = guard.take() {
            let _ = old.stop_scan().await;
        }
        *guard = Some(get_adapter().await?);
        Ok(())
    }
}
