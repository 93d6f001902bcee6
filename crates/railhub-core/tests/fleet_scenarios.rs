//! End-to-end scenarios through the fleet facade, on mock hubs.
//!
//! Run with:
//! `cargo test --package railhub-core --test fleet_scenarios`

use std::sync::Arc;
use std::time::Duration;

use railhub_core::ble::LEGO_HUB_SERVICE;
use railhub_core::codec::SELF_DRIVE_ON;
use railhub_core::mock::{MockConnector, MockHub, MockRadio};
use railhub_core::{
    Advertisement, ConnectionState, DeliveryOutcome, Error, FailureReason, Fleet, FleetConfig,
    FleetEvent, HubRole, InvalidCommandReason, MotorKind, MotorPort, PortSet, SelfDriveState,
    StatsKey, SwitchPosition, TransportFailure,
};
use railhub_types::wire;

struct Layout {
    fleet: Arc<Fleet>,
    radio: Arc<MockRadio>,
}

async fn layout(hubs: &[&Arc<MockHub>]) -> Layout {
    let layout = start_layout(hubs).await;
    for hub in hubs {
        bring_up(&layout, hub).await;
    }
    layout
}

/// Fleet running against the hubs, none of them advertised yet.
async fn start_layout(hubs: &[&Arc<MockHub>]) -> Layout {
    let radio = Arc::new(MockRadio::new());
    let connector = Arc::new(MockConnector::new());
    for hub in hubs {
        connector.add(Arc::clone(hub));
    }
    // mock hubs only speak when spoken to
    let mut config = FleetConfig::default();
    config.supervisor = config.supervisor.notification_timeout(None);
    let fleet = Fleet::new(config, radio.clone(), connector).unwrap();
    fleet.start().await;
    Layout { fleet, radio }
}

fn advertisement(hub: &MockHub) -> Advertisement {
    let name = match hub.role() {
        HubRole::Train => "Train Hub",
        HubRole::Switch => "Technic Hub",
    };
    Advertisement {
        address: hub.id().to_string(),
        name: Some(name.to_string()),
        rssi: Some(-58),
        services: vec![LEGO_HUB_SERVICE],
        ..Default::default()
    }
}

async fn bring_up(layout: &Layout, hub: &MockHub) {
    layout.radio.wait_until_scanning().await;
    assert!(layout.radio.advertise(advertisement(hub)));
    wait_for_state(&layout.fleet, hub.id(), ConnectionState::Connected).await;
    if hub.role() == HubRole::Switch {
        while layout.fleet.switches().view(hub.id()).and_then(|v| v.motors).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn wait_for_state(fleet: &Fleet, hub_id: &str, state: ConnectionState) {
    while fleet.supervisor().current_state(hub_id).await != Some(state) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn switch_hub(id: &str, motors: i32) -> Arc<MockHub> {
    let hub = MockHub::new(id, HubRole::Switch);
    hub.emulate_switch(PortSet::from_bits(motors).unwrap(), PortSet::EMPTY);
    hub
}

#[tokio::test(start_paused = true)]
async fn confirmed_switch_command_updates_verified_position() {
    let hub = switch_hub("sw-1", 0b1100);
    let layout = layout(&[&hub]).await;
    let fleet = &layout.fleet;
    assert_eq!(fleet.switches().motor_kind("sw-1", MotorPort::A), MotorKind::Motor);

    let outcome = fleet
        .set_switch_position("sw-1", 'A', SwitchPosition::Diverging)
        .await
        .unwrap();

    assert!(matches!(outcome, DeliveryOutcome::Confirmed { attempts: 1, .. }));
    assert_eq!(
        fleet.switches().verified_position("sw-1", MotorPort::A),
        Some(SwitchPosition::Diverging)
    );
    let stats = fleet.engine().stats(&StatsKey::port("sw-1", MotorPort::A));
    assert_eq!((stats.attempts, stats.failures), (1, 0));
    assert_eq!(stats.success_rate(), Some(100.0));

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_switch_command_fails_after_three_attempts() {
    let hub = MockHub::new("sw-1", HubRole::Switch);
    hub.emulate_unresponsive_switch(PortSet::from_bits(0b0100).unwrap(), PortSet::EMPTY);
    let layout = layout(&[&hub]).await;
    let fleet = &layout.fleet;

    let outcome = fleet
        .set_switch_position("sw-1", 'B', SwitchPosition::Straight)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        DeliveryOutcome::Failed {
            attempts: 3,
            reason: FailureReason::VerificationTimeout
        }
    );
    assert_eq!(fleet.switches().verified_position("sw-1", MotorPort::B), None);
    let stats = fleet.engine().stats(&StatsKey::port("sw-1", MotorPort::B));
    assert_eq!((stats.attempts, stats.successes, stats.failures), (3, 0, 3));
    assert!(stats.last_failure.is_some());

    let snapshot = fleet.snapshot().await;
    let port = &snapshot.switch("sw-1").unwrap().ports[0];
    assert_eq!(port.commanded, Some(SwitchPosition::Straight));
    assert_eq!(port.verified, None);

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_marker_stops_train_once() {
    let hub = MockHub::new("train-1", HubRole::Train);
    let layout = layout(&[&hub]).await;
    let fleet = &layout.fleet;
    let mut events = fleet.subscribe();

    fleet.set_self_drive("train-1", true).await.unwrap();
    fleet.set_train_power("train-1", 45).await.unwrap();
    hub.clear_writes();

    // GRAY x3 then RED x3
    for code in [5, 5, 5, 1, 1, 1] {
        hub.push(wire::encode_tuple(&[21.into(), code.into()]));
    }
    while fleet.trains().self_drive_state("train-1") != Some(SelfDriveState::Idle) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let writes = hub.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(&writes[0][..], &wire::encode_int8(0)[..]);

    let mut running_to_stopping = 0;
    while let Ok(event) = events.try_recv() {
        if let FleetEvent::SelfDriveChanged { from, to, .. } = event
            && from == SelfDriveState::Running
            && to == SelfDriveState::Stopping
        {
            running_to_stopping += 1;
        }
    }
    assert_eq!(running_to_stopping, 1);

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn link_loss_fails_command_without_replay() {
    let hub = switch_hub("sw-1", 0b1000);
    let layout = layout(&[&hub]).await;
    let fleet = &layout.fleet;
    let mut events = fleet.subscribe();
    hub.clear_writes();
    hub.drop_link_on_next_write();

    let outcome = fleet
        .set_switch_position("sw-1", 'A', SwitchPosition::Diverging)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DeliveryOutcome::Failed {
            attempts: 1,
            reason: FailureReason::Transport(TransportFailure::LinkLost)
        }
    );

    let mut reconnecting = false;
    while !reconnecting {
        if let Ok(FleetEvent::StateChanged { to, .. }) = events.recv().await {
            reconnecting = to == ConnectionState::Reconnecting;
        }
    }
    hub.wait_for_connects(2).await;
    wait_for_state(fleet, "sw-1", ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(hub.writes().is_empty());
    assert_eq!(fleet.switches().verified_position("sw-1", MotorPort::A), None);

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn power_range_is_validated_before_sending() {
    let hub = MockHub::new("train-1", HubRole::Train);
    let layout = layout(&[&hub]).await;
    let fleet = &layout.fleet;

    for power in [-100, -1, 0, 1, 100] {
        let outcome = fleet.set_train_power("train-1", power).await.unwrap();
        assert!(outcome.is_confirmed());
    }
    assert_eq!(hub.writes().len(), 5);

    for power in [-101, 101, i32::MAX] {
        let err = fleet.set_train_power("train-1", power).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidCommand(InvalidCommandReason::PowerOutOfRange { .. })
        ));
    }
    assert_eq!(hub.writes().len(), 5);

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn trains_and_switches_show_up_in_snapshot() {
    let train = MockHub::new("train-1", HubRole::Train);
    let switch = switch_hub("sw-1", 0b1111);
    let layout = layout(&[&train, &switch]).await;
    let fleet = &layout.fleet;

    fleet.set_train_power("train-1", -30).await.unwrap();
    let snapshot = fleet.snapshot().await;

    assert_eq!(snapshot.trains.len(), 1);
    assert_eq!(snapshot.switches.len(), 1);
    assert_eq!(snapshot.trains[0].verified_power, Some(-30));
    assert!(snapshot.trains[0].link.active);
    assert_eq!(snapshot.switches[0].ports.len(), 4);
    assert_eq!(snapshot.switches[0].link.state, ConnectionState::Connected);

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn hub_reset_clears_counters_and_reprobes() {
    let hub = switch_hub("sw-1", 0b1000);
    let layout = layout(&[&hub]).await;
    let fleet = &layout.fleet;

    fleet
        .set_switch_position("sw-1", 'A', SwitchPosition::Diverging)
        .await
        .unwrap();
    let port_a = StatsKey::port("sw-1", MotorPort::A);
    assert_eq!(fleet.engine().stats(&port_a).attempts, 1);
    hub.clear_writes();

    fleet.reset_connections(Some("sw-1")).await.unwrap();
    assert_eq!(fleet.engine().stats(&port_a).attempts, 0);
    assert_eq!(fleet.engine().stats(&StatsKey::hub("sw-1")).attempts, 0);
    assert_eq!(fleet.switches().verified_position("sw-1", MotorPort::A), None);

    wait_for_state(fleet, "sw-1", ConnectionState::Connected).await;
    while fleet.switches().motor_kind("sw-1", MotorPort::A) != MotorKind::Motor {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(hub.connect_count(), 2);
    assert_eq!(&hub.writes()[0][..], &wire::encode_int16(0)[..]);

    assert!(matches!(
        fleet.reset_connections(Some("ghost")).await,
        Err(Error::UnknownHub(_))
    ));
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn advertisement_during_hub_reset_does_not_race_the_reset() {
    let hub = switch_hub("sw-1", 0b1000);
    let layout = layout(&[&hub]).await;
    let fleet = &layout.fleet;
    hub.set_disconnect_delay(Duration::from_millis(500));

    let resetting = Arc::clone(fleet);
    let reset = tokio::spawn(async move { resetting.reset_connections(Some("sw-1")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!reset.is_finished());
    assert!(layout.radio.advertise(advertisement(&hub)));
    reset.await.unwrap().unwrap();

    wait_for_state(fleet, "sw-1", ConnectionState::Connected).await;
    while fleet.switches().view("sw-1").and_then(|v| v.motors).is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(hub.connect_count(), 2);
    assert_eq!(
        fleet.supervisor().current_state("sw-1").await,
        Some(ConnectionState::Connected)
    );

    let outcome = fleet
        .set_switch_position("sw-1", 'A', SwitchPosition::Diverging)
        .await
        .unwrap();
    assert!(outcome.is_confirmed());

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scanning_pauses_while_a_hub_connects() {
    let train = MockHub::new("train-1", HubRole::Train);
    train.hold_connects();
    let layout = start_layout(&[&train]).await;
    let fleet = &layout.fleet;
    let gate = fleet.supervisor().radio_gate();

    layout.radio.wait_until_scanning().await;
    assert!(layout.radio.advertise(advertisement(&train)));
    wait_for_state(fleet, "train-1", ConnectionState::Connecting).await;
    layout.radio.wait_until_stopped().await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(gate.is_held());
    assert!(!layout.radio.is_scanning());

    train.release_connects();
    wait_for_state(fleet, "train-1", ConnectionState::Connected).await;
    layout.radio.wait_until_scanning().await;
    assert!(!gate.is_held());

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scanning_resumes_after_a_failed_connect() {
    let train = MockHub::new("train-1", HubRole::Train);
    train.fail_next_connects(1);
    train.hold_connects();
    let layout = start_layout(&[&train]).await;
    let fleet = &layout.fleet;

    layout.radio.wait_until_scanning().await;
    assert!(layout.radio.advertise(advertisement(&train)));
    layout.radio.wait_until_stopped().await;
    assert!(fleet.supervisor().radio_gate().is_held());

    train.release_connects();
    wait_for_state(fleet, "train-1", ConnectionState::Reconnecting).await;
    layout.radio.wait_until_scanning().await;
    assert!(!fleet.supervisor().radio_gate().is_held());

    wait_for_state(fleet, "train-1", ConnectionState::Connected).await;
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn global_reset_restarts_scanner_on_fresh_adapter() {
    let hub = MockHub::new("train-1", HubRole::Train);
    let layout = layout(&[&hub]).await;
    let fleet = &layout.fleet;
    fleet.set_self_drive("train-1", true).await.unwrap();
    let reinits = layout.radio.reinit_count();
    assert!(hub.writes().iter().any(|w| w[2] as i8 == SELF_DRIVE_ON));
    hub.clear_writes();

    fleet.reset_connections(None).await.unwrap();
    assert!(layout.radio.reinit_count() > reinits);
    assert_eq!(fleet.trains().self_drive_state("train-1"), None);

    layout.radio.wait_until_scanning().await;
    wait_for_state(fleet, "train-1", ConnectionState::Connected).await;
    assert_eq!(hub.connect_count(), 2);

    let outcome = fleet.set_train_power("train-1", 20).await.unwrap();
    assert!(outcome.is_confirmed());
    let writes = hub.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(&writes[0][..], &wire::encode_int8(20)[..]);

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_scanner_faults_raise_degraded_signal() {
    let hub = MockHub::new("train-1", HubRole::Train);
    let layout = layout(&[&hub]).await;
    let fleet = &layout.fleet;
    let mut events = fleet.subscribe();

    layout.radio.wait_until_scanning().await;
    layout.radio.fail_next_reinitializations(2);
    layout.radio.fault();

    let mut degraded = false;
    let mut recovered = false;
    while !recovered {
        match events.recv().await.unwrap() {
            FleetEvent::ScannerDegraded {
                consecutive_failures,
            } => {
                assert_eq!(consecutive_failures, 2);
                degraded = true;
            }
            FleetEvent::ScannerRecovered => recovered = true,
            _ => {}
        }
    }
    assert!(degraded);
    assert_eq!(
        fleet.supervisor().current_state("train-1").await,
        Some(ConnectionState::Connected)
    );

    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn commands_to_different_hubs_run_in_parallel() {
    let slow = MockHub::new("sw-slow", HubRole::Switch);
    slow.emulate_unresponsive_switch(PortSet::from_bits(0b1000).unwrap(), PortSet::EMPTY);
    let fast = switch_hub("sw-fast", 0b1000);
    let layout = layout(&[&slow, &fast]).await;
    let fleet = &layout.fleet;

    let started = tokio::time::Instant::now();
    let (slow_outcome, fast_outcome) = tokio::join!(
        fleet.set_switch_position("sw-slow", 'A', SwitchPosition::Diverging),
        async {
            let outcome = fleet
                .set_switch_position("sw-fast", 'A', SwitchPosition::Diverging)
                .await;
            (outcome, started.elapsed())
        },
    );

    assert!(!slow_outcome.unwrap().is_confirmed());
    let (fast_outcome, elapsed) = fast_outcome;
    assert!(fast_outcome.unwrap().is_confirmed());
    assert!(elapsed < Duration::from_secs(1));

    fleet.shutdown().await;
}
