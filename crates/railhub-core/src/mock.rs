//! Scripted stand-ins for the Bluetooth stack.
//!
//! [`MockConnector`] hands out [`MockSession`]s for registered
//! [`MockHub`]s, [`MockRadio`] replaces the adapter for the scanner and
//! [`ManualClock`] records backoff sleeps without waiting. All of them
//! support failure injection so reconnect and retry paths can be driven
//! deterministically.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use railhub_core::mock::{MockConnector, MockHub};
//! use railhub_types::wire::{self, Value};
//! use railhub_types::HubRole;
//!
//! let hub = MockHub::new("train-1", HubRole::Train);
//! hub.fail_next_connects(2);
//!
//! let connector = MockConnector::new();
//! connector.add(Arc::clone(&hub));
//! assert_eq!(hub.connect_count(), 0);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use railhub_types::wire::{self, Value};
use railhub_types::{HubRole, MotorPort, PortSet, ble};

use crate::clock::Clock;
use crate::error::{Error, Result, TransportFailure};
use crate::events::HubInfo;
use crate::scan::Advertisement;
use crate::traits::{AdvertisementStream, Connector, NotificationStream, Radio, Session};

type Responder = Arc<dyn Fn(&[u8]) -> Vec<Bytes> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Link {
    generation: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct HubState {
    writes: Vec<Bytes>,
    responder: Option<Responder>,
    fail_writes: u32,
    drop_on_write: bool,
    fail_connects: u32,
    link: Option<Link>,
    generation: u64,
    rssi: Option<i16>,
    disconnect_delay: Option<Duration>,
}

/// A simulated hub.
pub struct MockHub {
    id: String,
    role: HubRole,
    state: Mutex<HubState>,
    connects: watch::Sender<u32>,
    connects_held: watch::Sender<bool>,
}

impl MockHub {
    pub fn new(id: impl Into<String>, role: HubRole) -> Arc<Self> {
        let (connects, _) = watch::channel(0);
        let (connects_held, _) = watch::channel(false);
        Arc::new(Self {
            id: id.into(),
            role,
            state: Mutex::new(HubState {
                rssi: Some(-60),
                ..HubState::default()
            }),
            connects,
            connects_held,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> HubRole {
        self.role
    }

    pub fn info(&self) -> HubInfo {
        HubInfo::new(self.id.clone(), self.role)
    }

    /// Reply to every delivered write with the returned notifications.
    pub fn on_write(&self, responder: impl Fn(&[u8]) -> Vec<Bytes> + Send + Sync + 'static) {
        lock(&self.state).responder = Some(Arc::new(responder));
    }

    /// The next `n` writes fail while the link stays up.
    pub fn fail_next_writes(&self, n: u32) {
        lock(&self.state).fail_writes = n;
    }

    /// The next write fails and takes the link down with it.
    pub fn drop_link_on_next_write(&self) {
        lock(&self.state).drop_on_write = true;
    }

    pub fn fail_next_connects(&self, n: u32) {
        lock(&self.state).fail_connects = n;
    }

    /// Connection attempts block until [`MockHub::release_connects`].
    pub fn hold_connects(&self) {
        self.connects_held.send_replace(true);
    }

    pub fn release_connects(&self) {
        self.connects_held.send_replace(false);
    }

    /// Closing a session takes this long.
    pub fn set_disconnect_delay(&self, delay: Duration) {
        lock(&self.state).disconnect_delay = Some(delay);
    }

    pub fn set_rssi(&self, rssi: Option<i16>) {
        lock(&self.state).rssi = rssi;
    }

    /// Push a notification on the open link. Returns `false` if not linked.
    pub fn push(&self, payload: Bytes) -> bool {
        lock(&self.state)
            .link
            .as_ref()
            .is_some_and(|link| link.tx.send(payload).is_ok())
    }

    /// Simulate the hub going out of range.
    pub fn drop_link(&self) {
        lock(&self.state).link = None;
    }

    pub fn is_linked(&self) -> bool {
        lock(&self.state).link.is_some()
    }

    /// Writes that reached the hub, in order.
    pub fn writes(&self) -> Vec<Bytes> {
        lock(&self.state).writes.clone()
    }

    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    /// Successful connections so far.
    pub fn connect_count(&self) -> u32 {
        *self.connects.borrow()
    }

    pub async fn wait_for_connects(&self, n: u32) {
        let mut rx = self.connects.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Answer probes and position commands like the switch hub program.
    pub fn emulate_switch(&self, motors: PortSet, dc_motors: PortSet) {
        self.on_write(switch_program(motors, dc_motors, true));
    }

    /// Answer probes but never report position changes.
    pub fn emulate_unresponsive_switch(&self, motors: PortSet, dc_motors: PortSet) {
        self.on_write(switch_program(motors, dc_motors, false));
    }

    fn open(self: &Arc<Self>) -> Result<MockSession> {
        let mut state = lock(&self.state);
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::transport(
                &self.id,
                TransportFailure::ConnectFailed("injected failure".to_string()),
            ));
        }
        state.generation += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.link = Some(Link {
            generation: state.generation,
            tx,
        });
        let generation = state.generation;
        drop(state);
        self.connects.send_modify(|n| *n += 1);

        Ok(MockSession {
            hub: Arc::clone(self),
            generation,
            notifications: Mutex::new(Some(rx)),
        })
    }

    fn linked_as(&self, generation: u64) -> bool {
        lock(&self.state)
            .link
            .as_ref()
            .is_some_and(|link| link.generation == generation)
    }
}

fn switch_program(
    motors: PortSet,
    dc_motors: PortSet,
    report_positions: bool,
) -> impl Fn(&[u8]) -> Vec<Bytes> + Send + Sync + 'static {
    let channel = i32::from(ble::SWITCH_COMMAND_CHANNEL);
    let attached = motors.iter().chain(dc_motors.iter()).collect::<PortSet>();
    let diverging = Mutex::new(PortSet::EMPTY);
    move |payload| {
        let Some(code) = wire::decode(payload)
            .ok()
            .and_then(|values| values.first().and_then(Value::as_int))
        else {
            return Vec::new();
        };
        if code == 0 {
            return vec![wire::encode_tuple(&[
                channel.into(),
                i32::from(motors.bits()).into(),
                i32::from(dc_motors.bits()).into(),
            ])];
        }
        let port = u8::try_from(code / 1000)
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| MotorPort::ALL.get(usize::from(i)).copied());
        let Some(port) = port.filter(|p| attached.contains(*p)) else {
            return Vec::new();
        };
        if !report_positions {
            return Vec::new();
        }
        let mut current = lock(&diverging);
        *current = if code % 1000 == 1 {
            current.with(port)
        } else {
            current.iter().filter(|p| *p != port).collect()
        };
        vec![wire::encode_tuple(&[
            channel.into(),
            11.into(),
            i32::from(current.bits()).into(),
            i32::from(attached.bits()).into(),
        ])]
    }
}

/// Session to a [`MockHub`]. Dead once the hub's link is dropped or replaced.
pub struct MockSession {
    hub: Arc<MockHub>,
    generation: u64,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

#[async_trait]
impl Session for MockSession {
    fn hub_id(&self) -> &str {
        &self.hub.id
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        let responder = {
            let mut state = lock(&self.hub.state);
            let linked = state
                .link
                .as_ref()
                .is_some_and(|link| link.generation == self.generation);
            if !linked {
                return Err(Error::transport(&self.hub.id, TransportFailure::NotConnected));
            }
            if state.drop_on_write {
                state.drop_on_write = false;
                state.link = None;
                return Err(Error::transport(
                    &self.hub.id,
                    TransportFailure::WriteFailed("link dropped".to_string()),
                ));
            }
            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                return Err(Error::transport(
                    &self.hub.id,
                    TransportFailure::WriteFailed("injected failure".to_string()),
                ));
            }
            state.writes.push(Bytes::copy_from_slice(payload));
            state.responder.clone()
        };

        if let Some(responder) = responder {
            for reply in responder(payload) {
                self.hub.push(reply);
            }
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        let rx = lock(&self.notifications)
            .take()
            .ok_or_else(|| Error::InvalidConfig("notification stream already taken".into()))?;
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        });
        Ok(stream.boxed())
    }

    async fn is_connected(&self) -> bool {
        self.hub.linked_as(self.generation)
    }

    async fn read_rssi(&self) -> Option<i16> {
        if self.hub.linked_as(self.generation) {
            lock(&self.hub.state).rssi
        } else {
            None
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let delay = lock(&self.hub.state).disconnect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.hub.state);
        if state
            .link
            .as_ref()
            .is_some_and(|link| link.generation == self.generation)
        {
            state.link = None;
        }
        Ok(())
    }
}

/// Connects to registered [`MockHub`]s; unknown ids fail to connect.
#[derive(Default)]
pub struct MockConnector {
    hubs: Mutex<HashMap<String, Arc<MockHub>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hub: Arc<MockHub>) {
        lock(&self.hubs).insert(hub.id.clone(), hub);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, hub: &HubInfo) -> Result<Arc<dyn Session>> {
        let mock = lock(&self.hubs).get(&hub.id).cloned().ok_or_else(|| {
            Error::transport(
                &hub.id,
                TransportFailure::ConnectFailed("hub out of range".to_string()),
            )
        })?;
        let _ = mock.connects_held.subscribe().wait_for(|held| !held).await;
        let session = mock.open()?;
        Ok(Arc::new(session))
    }
}

struct RadioState {
    tx: Option<mpsc::UnboundedSender<Result<Advertisement>>>,
    fail_starts: u32,
    fail_reinits: u32,
    adapter_ok: bool,
}

/// A scriptable adapter for the scanner.
pub struct MockRadio {
    state: Mutex<RadioState>,
    scanning: watch::Sender<bool>,
    starts: AtomicU32,
    reinits: AtomicU32,
}

impl MockRadio {
    pub fn new() -> Self {
        let (scanning, _) = watch::channel(false);
        Self {
            state: Mutex::new(RadioState {
                tx: None,
                fail_starts: 0,
                fail_reinits: 0,
                adapter_ok: true,
            }),
            scanning,
            starts: AtomicU32::new(0),
            reinits: AtomicU32::new(0),
        }
    }

    /// Deliver an advertisement if a scan is running.
    pub fn advertise(&self, adv: Advertisement) -> bool {
        lock(&self.state)
            .tx
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(adv)).is_ok())
    }

    /// Make the running scan report a fault.
    pub fn fault(&self) {
        if let Some(tx) = lock(&self.state).tx.take() {
            let _ = tx.send(Err(Error::ScannerFault("injected fault".to_string())));
        }
    }

    pub fn fail_next_starts(&self, n: u32) {
        lock(&self.state).fail_starts = n;
    }

    /// The next `n` reinitializations fail and leave the adapter unusable.
    pub fn fail_next_reinitializations(&self, n: u32) {
        lock(&self.state).fail_reinits = n;
    }

    pub fn is_scanning(&self) -> bool {
        *self.scanning.borrow()
    }

    pub async fn wait_until_scanning(&self) {
        let _ = self.scanning.subscribe().wait_for(|s| *s).await;
    }

    pub async fn wait_until_stopped(&self) {
        let _ = self.scanning.subscribe().wait_for(|s| !*s).await;
    }

    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn reinit_count(&self) -> u32 {
        self.reinits.load(Ordering::SeqCst)
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn start_scan(&self) -> Result<AdvertisementStream> {
        let mut state = lock(&self.state);
        if !state.adapter_ok {
            return Err(Error::ScannerFault("adapter unavailable".to_string()));
        }
        if state.fail_starts > 0 {
            state.fail_starts -= 1;
            return Err(Error::ScannerFault("injected start failure".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.tx = Some(tx);
        drop(state);
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.scanning.send_replace(true);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        lock(&self.state).tx = None;
        self.scanning.send_replace(false);
        Ok(())
    }

    async fn reinitialize(&self) -> Result<()> {
        self.reinits.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        state.tx = None;
        if state.fail_reinits > 0 {
            state.fail_reinits -= 1;
            state.adapter_ok = false;
            return Err(Error::ScannerFault("injected reinitialization failure".into()));
        }
        state.adapter_ok = true;
        Ok(())
    }
}

/// Clock whose sleeps return immediately and are recorded.
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
    sleeps: watch::Sender<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let (sleeps, _) = watch::channel(Vec::new());
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps,
        }
    }

    /// Move `now()` forward without sleeping.
    pub fn advance(&self, by: Duration) {
        *lock(&self.offset) += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }

    pub async fn wait_for_sleeps(&self, n: usize) {
        let _ = self.sleeps.subscribe().wait_for(|s| s.len() >= n).await;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *lock(&self.offset)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        self.sleeps.send_modify(|s| s.push(duration));
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_dies_with_link() {
        let hub = MockHub::new("h", HubRole::Switch);
        let connector = MockConnector::new();
        connector.add(Arc::clone(&hub));

        let session = connector.connect(&hub.info()).await.unwrap();
        assert!(session.is_connected().await);
        session.write(&[1, 2]).await.unwrap();

        hub.drop_link();
        assert!(!session.is_connected().await);
        assert!(session.write(&[3]).await.is_err());
        assert_eq!(hub.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_newer_session_replaces_older() {
        let hub = MockHub::new("h", HubRole::Train);
        let connector = MockConnector::new();
        connector.add(Arc::clone(&hub));

        let old = connector.connect(&hub.info()).await.unwrap();
        let new = connector.connect(&hub.info()).await.unwrap();
        assert!(!old.is_connected().await);
        assert!(new.is_connected().await);
        old.disconnect().await.unwrap();
        assert!(new.is_connected().await);
        assert_eq!(hub.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_responder_replies_on_stream() {
        let hub = MockHub::new("h", HubRole::Switch);
        hub.on_write(|payload| vec![Bytes::copy_from_slice(payload)]);
        let connector = MockConnector::new();
        connector.add(Arc::clone(&hub));

        let session = connector.connect(&hub.info()).await.unwrap();
        let mut stream = session.notifications().await.unwrap();
        assert!(session.notifications().await.is_err());
        session.write(&[7]).await.unwrap();
        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(&[7]));

        hub.drop_link();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_failures_are_counted_down() {
        let hub = MockHub::new("h", HubRole::Train);
        hub.fail_next_connects(1);
        let connector = MockConnector::new();
        connector.add(Arc::clone(&hub));

        assert!(connector.connect(&hub.info()).await.is_err());
        assert!(connector.connect(&hub.info()).await.is_ok());
        assert!(connector.connect(&HubInfo::new("other", HubRole::Train)).await.is_err());
    }

    #[tokio::test]
    async fn test_manual_clock_records_sleeps() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(2)).await;
        clock.sleep(Duration::from_secs(4)).await;
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2), Duration::from_secs(4)]);
        assert_eq!(clock.now() - start, Duration::from_secs(6));
    }
}
