//! End-to-end exercise of the public API against the scripted fake
//! transport: scan → connect → read/write/subscribe → link loss → reconnect.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use ble_central::adv::uuid16;
use ble_central::prelude::*;
use ble_central::transport::fake::{FakeCall, FakeTransport};
use ble_central::types::CLIENT_CHARACTERISTIC_CONFIGURATION;

const SERVICE: u16 = 0x180d; // heart rate
const CHAR_MEASUREMENT: u16 = 0x2a37; // notify
const CHAR_CONTROL: u16 = 0x2a39; // read + write

fn service() -> Uuid {
    uuid16(SERVICE)
}

fn catalog() -> ServiceCatalog {
    ServiceCatalog::new(vec![ServiceInfo {
        uuid: service(),
        characteristics: vec![
            CharacteristicInfo::new(
                service(),
                uuid16(CHAR_MEASUREMENT),
                0,
                CharacteristicProps {
                    notify: true,
                    ..Default::default()
                },
                vec![CLIENT_CHARACTERISTIC_CONFIGURATION],
            ),
            CharacteristicInfo::new(
                service(),
                uuid16(CHAR_CONTROL),
                0,
                CharacteristicProps {
                    read: true,
                    write: true,
                    write_without_response: true,
                    ..Default::default()
                },
                vec![],
            ),
        ],
    }])
}

fn measurement_identity() -> CharacteristicIdentity {
    CharacteristicIdentity {
        service: service(),
        characteristic: uuid16(CHAR_MEASUREMENT),
        instance: 0,
    }
}

fn control_identity() -> CharacteristicIdentity {
    CharacteristicIdentity {
        service: service(),
        characteristic: uuid16(CHAR_CONTROL),
        instance: 0,
    }
}

/// Drive a connect through the scripted transport callbacks.
async fn connect_flow(
    central: &BleCentral,
    fake: &Arc<FakeTransport>,
    address: &Address,
) -> (ServiceCatalog, mpsc::UnboundedReceiver<PeripheralEvent>) {
    let central = central.clone();
    let target = address.clone();
    let task = tokio::spawn(async move { central.connect(&target).await });
    fake.wait_for_call("connect", |c| matches!(c, FakeCall::Connect { .. }))
        .await;
    fake.establish(address);
    fake.wait_for_call("discover services", |c| {
        matches!(c, FakeCall::DiscoverServices { .. })
    })
    .await;
    fake.deliver_catalog(address, catalog());
    task.await.unwrap().unwrap()
}

#[tokio::test]
async fn full_session_lifecycle() {
    let (fake, events) = FakeTransport::new();
    let central = BleCentral::new(fake.clone(), events);
    let monitor = Address::from("AA:BB:CC:DD:EE:FF");

    // ── Discovery ────────────────────────────────────────────────────────────
    let mut discoveries = central
        .start_scan(vec![service()], None)
        .await
        .expect("scan starts");
    fake.advertise(&Address::from("11:22:33:44:55:66"), None, &[uuid16(0x1810)], -70);
    fake.advertise(&monitor, Some("HRM-1"), &[service()], -48);

    match discoveries.recv().await.expect("one sighting") {
        DiscoveryEvent::Discovered(info) => {
            assert_eq!(info.address, monitor);
            assert_eq!(info.local_name.as_deref(), Some("HRM-1"));
            assert!(info.advertisement.services().contains(&service()));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    central.stop_scan().await.unwrap();

    // The filtered-out device never entered the registry.
    let known = central.list_known().await.unwrap();
    assert_eq!(known.len(), 1);

    // ── Connect ──────────────────────────────────────────────────────────────
    let (resolved, mut peripheral_events) = connect_flow(&central, &fake, &monitor).await;
    assert_eq!(resolved, catalog());
    assert!(central.is_connected(&monitor).await.unwrap());

    // ── Read ─────────────────────────────────────────────────────────────────
    let reader = {
        let central = central.clone();
        let monitor = monitor.clone();
        tokio::spawn(
            async move { central.read(&monitor, service(), uuid16(CHAR_CONTROL)).await },
        )
    };
    fake.wait_for_call("read", |c| matches!(c, FakeCall::ReadCharacteristic { .. }))
        .await;
    fake.complete_read(&monitor, control_identity(), Ok(vec![0x01]));
    assert_eq!(reader.await.unwrap().unwrap(), vec![0x01]);

    // ── Acknowledged write ───────────────────────────────────────────────────
    let writer = {
        let central = central.clone();
        let monitor = monitor.clone();
        tokio::spawn(async move {
            central
                .write(
                    &monitor,
                    service(),
                    uuid16(CHAR_CONTROL),
                    vec![0x02],
                    WriteMode::WithResponse,
                )
                .await
        })
    };
    fake.wait_for_call("write", |c| {
        matches!(c, FakeCall::WriteCharacteristic { .. })
    })
    .await;
    fake.complete_write(&monitor, control_identity(), Ok(()));
    writer.await.unwrap().unwrap();

    // ── Unacknowledged write resolves on submission ──────────────────────────
    central
        .write(
            &monitor,
            service(),
            uuid16(CHAR_CONTROL),
            vec![0x03],
            WriteMode::WithoutResponse,
        )
        .await
        .unwrap();

    // ── Subscribe and receive a notification ─────────────────────────────────
    let subscriber = {
        let central = central.clone();
        let monitor = monitor.clone();
        tokio::spawn(async move {
            central
                .subscribe(&monitor, service(), uuid16(CHAR_MEASUREMENT))
                .await
        })
    };
    fake.wait_for_call("cccd write", |c| {
        matches!(c, FakeCall::WriteDescriptor { .. })
    })
    .await;
    fake.complete_descriptor_write(&monitor, measurement_identity(), Ok(()));
    let mut values = subscriber.await.unwrap().unwrap();

    fake.notify(&monitor, measurement_identity(), vec![0x16, 72]);
    assert_eq!(values.recv().await.unwrap(), vec![0x16, 72]);

    // RSSI poll results flow out of band.
    fake.report_rssi(&monitor, -51);
    assert_eq!(
        peripheral_events.recv().await.unwrap(),
        PeripheralEvent::Rssi(-51)
    );

    // ── Unsolicited link loss fails everything uniformly ─────────────────────
    let orphan = {
        let central = central.clone();
        let monitor = monitor.clone();
        fake.take_calls();
        tokio::spawn(
            async move { central.read(&monitor, service(), uuid16(CHAR_CONTROL)).await },
        )
    };
    fake.wait_for_call("read before drop", |c| {
        matches!(c, FakeCall::ReadCharacteristic { .. })
    })
    .await;
    fake.lose_link(&monitor);

    assert_eq!(orphan.await.unwrap().unwrap_err(), BleError::Disconnected);
    // Subscription stream closes and the terminal event arrives.
    assert!(values.recv().await.is_none());
    loop {
        match peripheral_events.recv().await {
            Some(PeripheralEvent::Disconnected) => break,
            Some(PeripheralEvent::Rssi(_)) => continue,
            None => panic!("stream closed without the terminal event"),
        }
    }

    // Operations against the dead session fail fast now.
    assert_eq!(
        central
            .read(&monitor, service(), uuid16(CHAR_CONTROL))
            .await
            .unwrap_err(),
        BleError::NotConnected
    );

    // ── Reconnect and part cleanly ───────────────────────────────────────────
    fake.take_calls();
    let (_resolved, mut peripheral_events) = connect_flow(&central, &fake, &monitor).await;

    let parting = {
        let central = central.clone();
        let monitor = monitor.clone();
        tokio::spawn(async move { central.disconnect(&monitor).await })
    };
    fake.wait_for_call("graceful release", |c| matches!(c, FakeCall::Disconnect { .. }))
        .await;
    fake.lose_link(&monitor);
    parting.await.unwrap().unwrap();

    loop {
        match peripheral_events.recv().await {
            Some(PeripheralEvent::Disconnected) | None => break,
            Some(_) => continue,
        }
    }

    // Disconnecting again is a no-op.
    central.disconnect(&monitor).await.unwrap();
}

#[tokio::test]
async fn subscribe_without_capability_fails_before_the_radio() {
    let (fake, events) = FakeTransport::new();
    let central = BleCentral::new(fake.clone(), events);
    let monitor = Address::from("AA:BB:CC:DD:EE:FF");

    let _connection = connect_flow(&central, &fake, &monitor).await;
    fake.take_calls();

    // CHAR_CONTROL is read/write only.
    assert_eq!(
        central
            .subscribe(&monitor, service(), uuid16(CHAR_CONTROL))
            .await
            .unwrap_err(),
        BleError::Unsupported
    );
    // Nothing went over the air for the subscription (the RSSI poll may
    // tick independently).
    assert!(fake
        .calls()
        .iter()
        .all(|c| matches!(c, FakeCall::ReadRssi { .. })));
}
