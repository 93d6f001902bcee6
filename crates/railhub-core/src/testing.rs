//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::Duration;

use railhub_types::ConnectionState;

use crate::backoff::BackoffPolicy;
use crate::clock::{Clock, TokioClock};
use crate::codec::Codecs;
use crate::events::EventDispatcher;
use crate::mock::{MockConnector, MockHub};
use crate::protocol::{CommandEngine, EngineConfig};
use crate::scan::{DiscoveryEvent, RadioGate};
use crate::supervisor::{ConnectionSupervisor, SupervisorConfig};

pub(crate) struct Rig {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub engine: Arc<CommandEngine>,
    pub events: EventDispatcher,
}

/// Supervisor and engine with every hub registered and connected.
pub(crate) async fn rig(hubs: &[&Arc<MockHub>]) -> Rig {
    rig_with_clock(hubs, Arc::new(TokioClock)).await
}

pub(crate) async fn rig_with_clock(hubs: &[&Arc<MockHub>], clock: Arc<dyn Clock>) -> Rig {
    let connector = Arc::new(MockConnector::new());
    let events = EventDispatcher::default();
    let supervisor = Arc::new(ConnectionSupervisor::new(
        connector.clone(),
        Codecs::default(),
        Arc::clone(&clock),
        SupervisorConfig::default().notification_timeout(None),
        events.clone(),
        RadioGate::new(),
    ));
    for hub in hubs {
        connector.add(Arc::clone(hub));
        supervisor
            .on_discovery(&DiscoveryEvent {
                address: hub.id().to_string(),
                name: None,
                role: hub.role(),
                rssi: Some(-50),
            })
            .await;
    }
    for hub in hubs {
        wait_for_state(&supervisor, hub.id(), ConnectionState::Connected).await;
    }
    let engine = Arc::new(CommandEngine::new(
        Arc::clone(&supervisor),
        clock,
        EngineConfig::new().backoff(BackoffPolicy::fixed(Duration::from_millis(100))),
        events.clone(),
    ));
    Rig {
        supervisor,
        engine,
        events,
    }
}

pub(crate) async fn wait_for_state(
    supervisor: &ConnectionSupervisor,
    hub_id: &str,
    state: ConnectionState,
) {
    while supervisor.current_state(hub_id).await != Some(state) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
