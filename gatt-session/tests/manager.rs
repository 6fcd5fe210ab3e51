mod common;

use std::time::{Duration, Instant};

use async_io::Timer;
use common::*;
use gatt_session::error::ErrorKind;
use gatt_session::{
    AdapterState, ConnectionState, DeviceIdentity, Operation, OperationOutput, SessionConfig,
    SessionEvent, SessionState, TransportEvent, Uuid,
};

#[test]
fn one_session_per_device() {
    let h = harness(MockTransport::battery(), SessionConfig::default());

    let first = h.manager.session_for_id(DEVICE);
    let again = h.manager.session_for(&DeviceIdentity::new(DEVICE));
    let other = h.manager.session_for_id(OTHER_DEVICE);

    assert_eq!(first, again);
    assert_ne!(first, other);
    assert_eq!(h.manager.sessions().len(), 2);
    assert_eq!(h.manager.session(DEVICE), Some(first));
}

#[test]
fn operations_by_device_id() {
    let h = harness(MockTransport::battery(), SessionConfig::default());

    h.executor.block_on(async {
        assert_eq!(
            h.manager.connect(DEVICE).await.unwrap(),
            OperationOutput::Connected
        );
        h.manager.session(DEVICE).unwrap().ready().await.unwrap();

        let rssi = h.manager.submit(DEVICE, Operation::ReadRssi).await.unwrap();
        assert_eq!(rssi, OperationOutput::Rssi(-58));
        assert_eq!(h.manager.session(DEVICE).unwrap().device().rssi(), Some(-58));

        assert_eq!(
            h.manager.disconnect(DEVICE).await.unwrap(),
            OperationOutput::Disconnected
        );
        assert_eq!(
            h.manager.disconnect(OTHER_DEVICE).await.unwrap(),
            OperationOutput::Disconnected
        );
        assert!(h.manager.session(OTHER_DEVICE).is_none());
    });
}

#[test]
fn events_for_unknown_devices_are_dropped() {
    let h = harness(MockTransport::battery(), SessionConfig::default());

    h.executor.block_on(async {
        let session = ready_session(&h.manager).await;

        h.transport.drop_link(OTHER_DEVICE);
        h.transport.emit(TransportEvent::CharacteristicValueUpdated {
            device: OTHER_DEVICE,
            characteristic: characteristic(BATTERY_SERVICE, BATTERY_LEVEL),
            value: vec![1],
        });
        settle().await;

        assert!(h.manager.session(OTHER_DEVICE).is_none());
        assert_eq!(session.state(), SessionState::Ready);
    });
}

#[test]
fn link_loss_is_routed_to_the_owning_session() {
    let h = harness(MockTransport::battery(), SessionConfig::default());

    h.executor.block_on(async {
        let session = ready_session(&h.manager).await;
        let bystander = h.manager.session_for_id(OTHER_DEVICE);

        h.transport.drop_link(DEVICE);
        settle().await;

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(bystander.state(), SessionState::Idle);
        assert_eq!(h.transport.call_count("disconnect"), 0);
    });
}

#[test]
fn discovered_devices_are_registered() {
    let h = harness(MockTransport::battery(), SessionConfig::default());

    h.executor.block_on(async {
        let mut discoveries = h.manager.discoveries();

        h.transport.emit(TransportEvent::DeviceDiscovered {
            device: DEVICE,
            name: Some("Band".to_owned()),
            rssi: Some(-61),
        });
        let found = discoveries.recv().await.unwrap();
        assert_eq!(found.id(), DEVICE);
        assert_eq!(found.name(), Some("Band"));
        assert_eq!(found.rssi(), Some(-61));

        // A new session starts from what the registry knows.
        let session = h.manager.session_for_id(DEVICE);
        assert_eq!(session.device().name(), Some("Band"));

        // Later advertisements refresh both the registry and the session.
        h.transport.emit(TransportEvent::DeviceDiscovered {
            device: DEVICE,
            name: None,
            rssi: Some(-40),
        });
        discoveries.recv().await.unwrap();
        assert_eq!(session.device().rssi(), Some(-40));
        assert_eq!(session.device().name(), Some("Band"));
        assert_eq!(h.manager.device(DEVICE).unwrap().rssi(), Some(-40));
        assert_eq!(h.manager.devices().len(), 1);
    });
}

#[test]
fn idle_sessions_are_evicted_after_the_ttl() {
    let config = SessionConfig {
        session_ttl: Some(Duration::from_millis(50)),
        eviction_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let h = harness(MockTransport::battery(), config);

    h.executor.block_on(async {
        drop(h.manager.session_for_id(DEVICE));
        let held = h.manager.session_for_id(OTHER_DEVICE);
        h.transport.emit(TransportEvent::DeviceDiscovered {
            device: Uuid::from_u128(3),
            name: None,
            rssi: Some(-90),
        });
        settle().await;
        assert_eq!(h.manager.devices().len(), 1);

        // Nothing has been idle long enough yet.
        assert_eq!(h.manager.evict_idle(Instant::now()), 0);

        let later = Instant::now() + Duration::from_millis(100);
        assert_eq!(h.manager.evict_idle(later), 1);
        assert!(h.manager.session(DEVICE).is_none());
        assert!(h.manager.session(OTHER_DEVICE).is_some());
        assert!(h.manager.devices().is_empty());
        drop(held);
    });
}

#[test]
fn connected_sessions_are_never_evicted() {
    let config = SessionConfig {
        session_ttl: Some(Duration::from_millis(10)),
        eviction_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let h = harness(MockTransport::battery(), config);

    h.executor.block_on(async {
        drop(ready_session(&h.manager).await);

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(h.manager.evict_idle(later), 0);
        assert!(h.manager.session(DEVICE).is_some());
    });
}

#[test]
fn sweeper_evicts_periodically() {
    let config = SessionConfig {
        session_ttl: Some(Duration::from_millis(10)),
        eviction_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let h = harness(MockTransport::battery(), config);

    h.executor.block_on(async {
        drop(h.manager.session_for_id(DEVICE));
        Timer::after(Duration::from_millis(100)).await;
        assert!(h.manager.session(DEVICE).is_none());
    });
}

#[test]
fn shutdown_disconnects_every_session() {
    let h = harness(MockTransport::battery(), SessionConfig::default());

    h.executor.block_on(async {
        let first = ready_session(&h.manager).await;
        let second = h.manager.session_for_id(OTHER_DEVICE);
        second.connect().await.unwrap();
        second.ready().await.unwrap();

        h.manager.shutdown().await;

        assert_eq!(first.state(), SessionState::Idle);
        assert_eq!(second.state(), SessionState::Idle);
        assert_eq!(h.transport.call_count("disconnect"), 2);
        assert!(h.manager.sessions().is_empty());
    });
}

#[test]
fn registry_follows_the_session() {
    let h = harness(MockTransport::battery(), SessionConfig::default());

    h.executor.block_on(async {
        h.transport.emit(TransportEvent::DeviceDiscovered {
            device: DEVICE,
            name: Some("Band".to_owned()),
            rssi: Some(-50),
        });
        settle().await;

        let session = ready_session(&h.manager).await;
        session.read_rssi().await.unwrap();

        let device = h.manager.device(DEVICE).unwrap();
        assert_eq!(device.state(), ConnectionState::Connected);
        assert_eq!(device.rssi(), Some(-58));
        assert_eq!(device.name(), Some("Band"));
        assert_eq!(h.manager.devices(), vec![device]);

        session.disconnect().await.unwrap();
        assert_eq!(
            h.manager.device(DEVICE).unwrap().state(),
            ConnectionState::Disconnected
        );
    });
}

#[test]
fn events_can_be_delivered_directly() {
    let h = harness(MockTransport::battery(), SessionConfig::default());

    h.executor.block_on(async {
        h.manager.handle_transport_event(TransportEvent::DeviceDiscovered {
            device: OTHER_DEVICE,
            name: Some("Scale".to_owned()),
            rssi: None,
        });
        assert_eq!(
            h.manager.device(OTHER_DEVICE).unwrap().name(),
            Some("Scale")
        );

        let session = ready_session(&h.manager).await;
        h.manager.handle_transport_event(TransportEvent::LinkError {
            device: DEVICE,
            error: gatt::ErrorKind::ConnectionTimeout.into(),
        });
        assert_eq!(session.state(), SessionState::Idle);
    });
}

#[test]
fn power_loss_drops_every_link_and_power_on_restores_it() {
    let config = SessionConfig {
        auto_reconnect: true,
        ..Default::default()
    };
    let h = harness(MockTransport::battery(), config);
    h.transport.script("read_rssi", Behavior::Hang);

    h.executor.block_on(async {
        let mut updates = h.manager.adapter_updates();
        assert!(!h.manager.is_enabled());
        h.transport
            .emit(TransportEvent::AdapterStateChanged(AdapterState::PoweredOn));
        assert_eq!(updates.recv().await.unwrap(), AdapterState::PoweredOn);
        assert!(h.manager.is_enabled());

        let session = ready_session(&h.manager).await;
        let bystander = h.manager.session_for_id(OTHER_DEVICE);
        let mut events = session.observe();
        let pending = session.submit(Operation::ReadRssi);

        h.transport
            .emit(TransportEvent::AdapterStateChanged(AdapterState::PoweredOff));
        assert_eq!(updates.recv().await.unwrap(), AdapterState::PoweredOff);
        assert!(!h.manager.is_enabled());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(pending.await.unwrap_err().kind(), ErrorKind::LinkLost);

        let lost = drain(&mut events)
            .into_iter()
            .find_map(|event| match event {
                SessionEvent::LinkLost { error, will_retry } => Some((error, will_retry)),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            lost.0.unwrap().kind(),
            gatt::ErrorKind::AdapterUnavailable
        );
        assert!(lost.1);

        // Nothing reconnects until the radio is back.
        settle().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(h.transport.call_count("connect"), 1);

        h.transport
            .emit(TransportEvent::AdapterStateChanged(AdapterState::PoweredOn));
        settle().await;
        session.ready().await.unwrap();
        assert_eq!(bystander.state(), SessionState::Idle);
        assert_eq!(h.transport.call_count("connect"), 2);
    });
}

#[test]
fn power_on_does_not_reconnect_without_auto_reconnect() {
    let h = harness(MockTransport::battery(), SessionConfig::default());

    h.executor.block_on(async {
        let session = ready_session(&h.manager).await;

        h.manager
            .handle_transport_event(TransportEvent::AdapterStateChanged(AdapterState::PoweredOff));
        assert_eq!(session.state(), SessionState::Idle);

        h.manager
            .handle_transport_event(TransportEvent::AdapterStateChanged(AdapterState::PoweredOn));
        settle().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(h.transport.call_count("connect"), 1);
    });
}

#[test]
fn disconnect_while_powered_off_cancels_the_reconnect() {
    let config = SessionConfig {
        auto_reconnect: true,
        ..Default::default()
    };
    let h = harness(MockTransport::battery(), config);

    h.executor.block_on(async {
        let session = ready_session(&h.manager).await;

        h.manager
            .handle_transport_event(TransportEvent::AdapterStateChanged(AdapterState::PoweredOff));
        session.disconnect().await.unwrap();
        h.manager
            .handle_transport_event(TransportEvent::AdapterStateChanged(AdapterState::PoweredOn));
        settle().await;

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(h.transport.call_count("connect"), 1);
    });
}
