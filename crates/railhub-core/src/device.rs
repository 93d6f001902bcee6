//! BLE sessions to hubs over btleplug.
//!
//! A [`BleSession`] owns one connected peripheral and its command
//! characteristic. [`BleConnector`] finds the peripheral for a discovered
//! hub on the current adapter and opens a session to it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use railhub_types::ble::LEGO_HUB_CHARACTERISTIC;

use crate::error::{Error, Result, TransportFailure};
use crate::events::HubInfo;
use crate::scan::BleRadio;
use crate::traits::{Connector, NotificationStream, Session};
use crate::util::{create_identifier, format_peripheral_id};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts and write mode for hub sessions.
///
/// ```
/// use std::time::Duration;
/// use railhub_core::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .connection_timeout(Duration::from_secs(20))
///     .write_with_response(false);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connection_timeout: Duration,
    pub write_timeout: Duration,
    pub discovery_timeout: Duration,
    /// Ask the hub to acknowledge each write at the link layer.
    pub write_with_response: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            write_with_response: true,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_with_response(mut self, enabled: bool) -> Self {
        self.write_with_response = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("connection_timeout", self.connection_timeout),
            ("write_timeout", self.write_timeout),
            ("discovery_timeout", self.discovery_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::invalid_config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

/// A connected hub.
///
/// Call [`Session::disconnect`] before dropping; a dropped session that is
/// still connected is disconnected in the background on a best-effort basis.
pub struct BleSession {
    adapter: Adapter,
    peripheral: Peripheral,
    characteristic: Characteristic,
    hub_id: String,
    config: ConnectionConfig,
    notifications_taken: AtomicBool,
    disconnected: AtomicBool,
}

impl std::fmt::Debug for BleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleSession")
            .field("hub_id", &self.hub_id)
            .field("characteristic", &self.characteristic.uuid)
            .finish_non_exhaustive()
    }
}

impl BleSession {
    /// Connect to `peripheral`, discover its services and subscribe to the
    /// hub characteristic.
    #[tracing::instrument(level = "info", skip_all, fields(hub_id = %hub_id))]
    pub async fn open(
        adapter: Adapter,
        peripheral: Peripheral,
        hub_id: String,
        config: ConnectionConfig,
    ) -> Result<Self> {
        info!("Connecting to hub");
        timeout(config.connection_timeout, peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to hub", config.connection_timeout))??;

        timeout(config.discovery_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", config.discovery_timeout))??;

        let characteristic = peripheral
            .services()
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == LEGO_HUB_CHARACTERISTIC)
            .cloned();
        let Some(characteristic) = characteristic else {
            // leave the hub free for another attempt
            let _ = peripheral.disconnect().await;
            return Err(Error::transport(
                hub_id,
                TransportFailure::CharacteristicNotFound(LEGO_HUB_CHARACTERISTIC.to_string()),
            ));
        };

        peripheral.subscribe(&characteristic).await?;
        info!("Hub session open");

        Ok(Self {
            adapter,
            peripheral,
            characteristic,
            hub_id,
            config,
            notifications_taken: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        })
    }
}

enum LinkItem {
    Data(Bytes),
    Gone,
}

#[async_trait]
impl Session for BleSession {
    fn hub_id(&self) -> &str {
        &self.hub_id
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        let write_type = if self.config.write_with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        match timeout(
            self.config.write_timeout,
            self.peripheral
                .write(&self.characteristic, payload, write_type),
        )
        .await
        {
            Err(_) => Err(Error::transport(
                &self.hub_id,
                TransportFailure::WriteTimeout(self.config.write_timeout),
            )),
            Ok(Err(e)) => Err(Error::transport(
                &self.hub_id,
                TransportFailure::WriteFailed(e.to_string()),
            )),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn notifications(&self) -> Result<NotificationStream> {
        if self.notifications_taken.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_config("notification stream already taken"));
        }

        let uuid = self.characteristic.uuid;
        let data = self
            .peripheral
            .notifications()
            .await?
            .filter_map(move |n| async move {
                (n.uuid == uuid).then(|| LinkItem::Data(Bytes::from(n.value)))
            });

        // The notification stream does not end on every platform when the
        // link drops, so also watch the adapter for a disconnect event.
        let id = self.peripheral.id();
        let gone = self.adapter.events().await?.filter_map(move |event| {
            let id = id.clone();
            async move {
                matches!(event, CentralEvent::DeviceDisconnected(ref pid) if *pid == id)
                    .then_some(LinkItem::Gone)
            }
        });

        let stream = futures::stream::select(data, gone)
            .take_while(|item| futures::future::ready(matches!(item, LinkItem::Data(_))))
            .filter_map(|item| async move {
                match item {
                    LinkItem::Data(bytes) => Some(bytes),
                    LinkItem::Gone => None,
                }
            });
        Ok(stream.boxed())
    }

    async fn is_connected(&self) -> bool {
        if self.disconnected.load(Ordering::SeqCst) {
            return false;
        }
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn read_rssi(&self) -> Option<i16> {
        self.peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.rssi)
    }

    #[tracing::instrument(level = "info", skip(self), fields(hub_id = %self.hub_id))]
    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        let _ = self.peripheral.unsubscribe(&self.characteristic).await;
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BleSession {
    fn drop(&mut self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(hub_id = %self.hub_id, "Session dropped without disconnect, cleaning up in background");
        let peripheral = self.peripheral.clone();
        let hub_id = self.hub_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(hub_id = %hub_id, error = %e, "Best-effort disconnect failed");
                }
            });
        }
    }
}

/// Opens [`BleSession`]s on the scanner's adapter.
pub struct BleConnector {
    radio: Arc<BleRadio>,
    config: ConnectionConfig,
}

impl BleConnector {
    pub fn new(radio: Arc<BleRadio>, config: ConnectionConfig) -> Self {
        Self { radio, config }
    }

    async fn find_peripheral(&self, adapter: &Adapter, hub_id: &str) -> Result<Peripheral> {
        for peripheral in adapter.peripherals().await? {
            let id = match peripheral.properties().await {
                Ok(Some(props)) => create_identifier(&props.address.to_string(), &peripheral.id()),
                _ => format_peripheral_id(&peripheral.id()),
            };
            if id == hub_id {
                return Ok(peripheral);
            }
        }
        Err(Error::transport(
            hub_id,
            TransportFailure::ConnectFailed("peripheral not known to adapter".to_string()),
        ))
    }
}

#[async_trait]
impl Connector for BleConnector {
    async fn connect(&self, hub: &HubInfo) -> Result<Arc<dyn Session>> {
        let adapter = self.radio.adapter().await?;
        let peripheral = self.find_peripheral(&adapter, &hub.id).await?;
        let session =
            BleSession::open(adapter, peripheral, hub.id.clone(), self.config.clone()).await?;
        Ok(Arc::new(session))
    }
}
