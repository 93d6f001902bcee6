//! Seams between the core and the Bluetooth stack.
//!
//! The supervisor and scanner only see these traits, so the same logic
//! drives real hubs through btleplug ([`crate::device`], [`crate::scan`])
//! and scripted hubs in tests ([`crate::mock`]).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::events::HubInfo;
use crate::scan::Advertisement;

/// Raw notification payloads pushed by a hub. Ends when the link drops.
pub type NotificationStream = BoxStream<'static, Bytes>;

/// Advertisements seen while scanning. An `Err` item is a scanner fault.
pub type AdvertisementStream = BoxStream<'static, Result<Advertisement>>;

/// One open link to one hub.
///
/// Sessions are never reused: when the link drops the supervisor discards
/// the session and asks the [`Connector`] for a new one.
#[async_trait]
pub trait Session: Send + Sync {
    fn hub_id(&self) -> &str;

    /// Write a command payload to the hub's command characteristic.
    async fn write(&self, payload: &[u8]) -> Result<()>;

    /// Stream of notifications. Only the first call returns the live stream.
    async fn notifications(&self) -> Result<NotificationStream>;

    async fn is_connected(&self) -> bool;

    async fn read_rssi(&self) -> Option<i16>;

    async fn disconnect(&self) -> Result<()>;
}

/// Opens sessions to hubs that were seen by the scanner.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, hub: &HubInfo) -> Result<Arc<dyn Session>>;
}

/// The adapter as seen by the scanner.
#[async_trait]
pub trait Radio: Send + Sync {
    async fn start_scan(&self) -> Result<AdvertisementStream>;

    async fn stop_scan(&self) -> Result<()>;

    /// Drop the adapter handle and acquire a fresh one.
    async fn reinitialize(&self) -> Result<()>;
}
