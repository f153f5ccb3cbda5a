//! Real-adapter transport over [`btleplug`].
//!
//! Maps the [`Transport`] submission surface onto
//! `btleplug::platform::{Adapter, Peripheral}` and turns the library's
//! pull-style async completions back into the push-style
//! [`TransportEvent`] stream the session core consumes: every submission
//! spawns a short task that awaits the platform call and emits exactly one
//! completion event.
//!
//! Platform notes, learned the hard way on every BLE stack:
//!
//! * macOS: `CBCentralManager` starts in an *unknown* state and silently
//!   ignores scans issued before it reaches *poweredOn*; we wait for it.
//! * Linux: BlueZ signals connection completion before the remote GATT
//!   cache is populated, so service discovery gets a short grace sleep, and
//!   `Connect` can block forever for an out-of-range device, so it runs
//!   under a hard timeout.
//! * `subscribe()`/`unsubscribe()` already write the CCCD on every
//!   supported platform, so `set_notify` owns the whole subscription
//!   round-trip (emitting the `DescriptorWritten` completion) and a CCCD
//!   write request is accepted without being re-sent — double CCCD writes
//!   upset several peripherals.
//! * Scan results arrive pre-parsed; the raw advertisement payload handed
//!   to the registry is re-encoded from the parsed fields.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::adv::AdvertisementBuilder;
use crate::error::BleError;
use crate::transport::{Transport, TransportEvent};
use crate::types::{
    Address, CharacteristicIdentity, CharacteristicInfo, CharacteristicProps, ServiceCatalog,
    ServiceInfo, WriteMode, CLIENT_CHARACTERISTIC_CONFIGURATION,
};

/// BlueZ's `org.bluez.Device1.Connect` can block forever when the device is
/// out of range; a real connection takes well under two seconds.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

fn rejected(e: impl std::fmt::Display) -> BleError {
    BleError::TransportRejected(e.to_string())
}

pub struct BtleplugTransport {
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Platform peripherals by address, populated by the central-event pump
    /// and by on-demand adapter lookups.
    known: Arc<Mutex<HashMap<Address, Peripheral>>>,
    /// Links whose notification stream is currently being forwarded.
    pumping: Arc<Mutex<HashSet<Address>>>,
}

impl BtleplugTransport {
    /// Bring up the first adapter and return the transport together with its
    /// event stream.
    pub async fn new() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), BleError> {
        let manager = Manager::new().await.map_err(rejected)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(rejected)?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::TransportRejected("no Bluetooth adapter found".into()))?;

        // macOS: wait for CBCentralManager to reach poweredOn. Freshly
        // launched processes see an "unknown" state for a few hundred
        // milliseconds and scans started in it are silent no-ops.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("macOS: adapter is PoweredOn");
                        break;
                    }
                    Ok(state) => {
                        if tokio::time::Instant::now() >= deadline {
                            warn!("macOS: adapter still {state:?} after 3 s, proceeding anyway");
                            break;
                        }
                        debug!("macOS: adapter state {state:?}, waiting");
                    }
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            adapter: adapter.clone(),
            events: events.clone(),
            known: Arc::new(Mutex::new(HashMap::new())),
            pumping: Arc::new(Mutex::new(HashSet::new())),
        });
        tokio::spawn(pump_central_events(
            adapter,
            transport.known.clone(),
            events,
        ));
        Ok((transport, rx))
    }

    fn known(&self) -> MutexGuard<'_, HashMap<Address, Peripheral>> {
        self.known.lock().expect("peripheral map poisoned")
    }

    /// Resolve a platform peripheral, falling back to the adapter's current
    /// set for connect-by-address without a prior sighting.
    async fn peripheral(&self, address: &Address) -> Result<Peripheral, BleError> {
        if let Some(peripheral) = self.known().get(address).cloned() {
            return Ok(peripheral);
        }
        for peripheral in self.adapter.peripherals().await.map_err(rejected)? {
            let id = Address::from(peripheral.id().to_string());
            self.known().insert(id.clone(), peripheral.clone());
            if &id == address {
                return Ok(peripheral);
            }
        }
        Err(BleError::PeripheralNotFound(address.clone()))
    }

    /// The platform characteristic matching a catalog identity. Instances
    /// are counted in the same table order the catalog was built in.
    fn find_characteristic(
        peripheral: &Peripheral,
        identity: &CharacteristicIdentity,
    ) -> Result<Characteristic, BleError> {
        peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == identity.service && c.uuid == identity.characteristic)
            .nth(identity.instance as usize)
            .ok_or_else(|| {
                BleError::TransportRejected(format!(
                    "characteristic {} not in the attribute table",
                    identity.characteristic
                ))
            })
    }

}

/// Forward adapter-level events (sightings, link drops) onto the transport
/// event stream.
async fn pump_central_events(
    adapter: Adapter,
    known: Arc<Mutex<HashMap<Address, Peripheral>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("could not subscribe to adapter events: {e}");
            let _ = events.send(TransportEvent::ScanFailed {
                reason: e.to_string(),
            });
            return;
        }
    };
    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let address = Address::from(id.to_string());
                known
                    .lock()
                    .expect("peripheral map poisoned")
                    .insert(address.clone(), peripheral.clone());
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let advertisement = synthesize_advertisement(&props);
                let _ = events.send(TransportEvent::Discovered {
                    address,
                    local_name: props.local_name,
                    advertisement,
                    rssi: props.rssi.unwrap_or(0),
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                let _ = events.send(TransportEvent::LinkLost {
                    address: Address::from(id.to_string()),
                });
            }
            _ => {}
        }
    }
}

/// Re-encode parsed scan properties into a canonical advertisement payload.
fn synthesize_advertisement(props: &PeripheralProperties) -> Vec<u8> {
    let mut builder = AdvertisementBuilder::new().services(&props.services);
    if let Some(name) = &props.local_name {
        builder = builder.local_name(name);
    }
    builder.build()
}

fn build_catalog(peripheral: &Peripheral) -> ServiceCatalog {
    let mut services = Vec::new();
    for service in peripheral.services() {
        let mut instances: HashMap<Uuid, u32> = HashMap::new();
        let mut characteristics = Vec::new();
        for ch in &service.characteristics {
            let instance = instances.entry(ch.uuid).or_insert(0);
            let props = CharacteristicProps {
                read: ch.properties.contains(CharPropFlags::READ),
                write: ch.properties.contains(CharPropFlags::WRITE),
                write_without_response: ch
                    .properties
                    .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                notify: ch.properties.contains(CharPropFlags::NOTIFY),
                indicate: ch.properties.contains(CharPropFlags::INDICATE),
            };
            let descriptors = ch.descriptors.iter().map(|d| d.uuid).collect();
            characteristics.push(CharacteristicInfo::new(
                service.uuid,
                ch.uuid,
                *instance,
                props,
                descriptors,
            ));
            *instance += 1;
        }
        services.push(ServiceInfo {
            uuid: service.uuid,
            characteristics,
        });
    }
    ServiceCatalog::new(services)
}

#[async_trait]
impl Transport for BtleplugTransport {
    // Native filtering is unreliable on enough platforms (BlueZ in
    // particular) that we always scan unfiltered and let the controller
    // filter in software.
    fn supports_native_filtering(&self) -> bool {
        false
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), BleError> {
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(rejected)
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.adapter.stop_scan().await.map_err(rejected)
    }

    async fn connect(&self, address: &Address) -> Result<(), BleError> {
        let peripheral = self.peripheral(address).await?;
        let events = self.events.clone();
        let address = address.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
                Ok(Ok(())) => {
                    info!("{address}: link established");
                    let _ = events.send(TransportEvent::LinkEstablished { address });
                }
                Ok(Err(e)) => {
                    warn!("{address}: connect failed: {e}");
                    let _ = events.send(TransportEvent::LinkLost { address });
                }
                Err(_) => {
                    warn!("{address}: connect timed out after {CONNECT_TIMEOUT:?}");
                    let _ = events.send(TransportEvent::LinkLost { address });
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, address: &Address) -> Result<(), BleError> {
        let peripheral = self.peripheral(address).await?;
        // Link-loss confirmation arrives via DeviceDisconnected on the
        // adapter event stream.
        peripheral.disconnect().await.map_err(rejected)
    }

    async fn is_connected(&self, address: &Address) -> bool {
        match self.peripheral(address).await {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn discover_services(&self, address: &Address) -> Result<(), BleError> {
        let peripheral = self.peripheral(address).await?;
        let events = self.events.clone();
        let address = address.clone();
        let this = self.clone_for_task();
        tokio::spawn(async move {
            // BlueZ flags the link connected before the remote GATT cache is
            // ready; discovering too early yields an empty table.
            #[cfg(target_os = "linux")]
            tokio::time::sleep(Duration::from_millis(600)).await;

            let result = match tokio::time::timeout(
                DISCOVERY_TIMEOUT,
                peripheral.discover_services(),
            )
            .await
            {
                Ok(Ok(())) => {
                    let catalog = build_catalog(&peripheral);
                    this.ensure_notification_pump(peripheral, address.clone());
                    Ok(catalog)
                }
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("service discovery timed out after {DISCOVERY_TIMEOUT:?}")),
            };
            let _ = events.send(TransportEvent::ServicesDiscovered { address, result });
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
    ) -> Result<(), BleError> {
        let peripheral = self.peripheral(address).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let events = self.events.clone();
        let address = address.clone();
        let characteristic = *characteristic;
        tokio::spawn(async move {
            let result = peripheral.read(&target).await.map_err(|e| e.to_string());
            let _ = events.send(TransportEvent::CharacteristicRead {
                address,
                characteristic,
                result,
            });
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let peripheral = self.peripheral(address).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        let events = self.events.clone();
        let address = address.clone();
        let characteristic = *characteristic;
        let payload = payload.to_vec();
        tokio::spawn(async move {
            let result = peripheral
                .write(&target, &payload, write_type)
                .await
                .map_err(|e| e.to_string());
            match mode {
                WriteMode::WithResponse => {
                    let _ = events.send(TransportEvent::CharacteristicWritten {
                        address,
                        characteristic,
                        result,
                    });
                }
                WriteMode::WithoutResponse => {
                    // The submission already resolved the caller; nothing to
                    // report on success.
                    if let Err(e) = result {
                        warn!("{address}: unacknowledged write failed: {e}");
                    }
                }
            }
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        // The CCCD write is folded into set_notify (subscribe/unsubscribe
        // handle it on every platform); re-sending it here would double
        // write the descriptor.
        if descriptor == CLIENT_CHARACTERISTIC_CONFIGURATION {
            return Ok(());
        }
        let peripheral = self.peripheral(address).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let platform_descriptor = target
            .descriptors
            .iter()
            .find(|d| d.uuid == descriptor)
            .cloned()
            .ok_or_else(|| {
                BleError::TransportRejected(format!("descriptor {descriptor} not in the table"))
            })?;
        let events = self.events.clone();
        let address = address.clone();
        let characteristic = *characteristic;
        let value = value.to_vec();
        tokio::spawn(async move {
            let result = peripheral
                .write_descriptor(&platform_descriptor, &value)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(TransportEvent::DescriptorWritten {
                address,
                characteristic,
                result,
            });
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
        enable: bool,
    ) -> Result<(), BleError> {
        let peripheral = self.peripheral(address).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let events = self.events.clone();
        let address = address.clone();
        let characteristic = *characteristic;
        tokio::spawn(async move {
            let result = if enable {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            }
            .map_err(|e| e.to_string());
            // subscribe()/unsubscribe() include the CCCD write; this is the
            // completion the session is waiting on.
            let _ = events.send(TransportEvent::DescriptorWritten {
                address,
                characteristic,
                result,
            });
        });
        Ok(())
    }

    async fn read_rssi(&self, address: &Address) -> Result<(), BleError> {
        let peripheral = self.peripheral(address).await?;
        let events = self.events.clone();
        let address = address.clone();
        tokio::spawn(async move {
            if let Ok(Some(props)) = peripheral.properties().await {
                if let Some(rssi) = props.rssi {
                    let _ = events.send(TransportEvent::Rssi { address, rssi });
                }
            }
        });
        Ok(())
    }
}

impl BtleplugTransport {
    /// A task-local view with the handles a spawned completion task needs.
    fn clone_for_task(&self) -> TaskView {
        TaskView {
            events: self.events.clone(),
            pumping: self.pumping.clone(),
        }
    }
}

/// The subset of transport state that outlives `&self` inside spawned
/// completion tasks.
struct TaskView {
    events: mpsc::UnboundedSender<TransportEvent>,
    pumping: Arc<Mutex<HashSet<Address>>>,
}

impl TaskView {
    fn ensure_notification_pump(&self, peripheral: Peripheral, address: Address) {
        let mut pumping = self.pumping.lock().expect("pump set poisoned");
        if !pumping.insert(address.clone()) {
            return;
        }
        drop(pumping);
        let events = self.events.clone();
        let pumping = self.pumping.clone();
        tokio::spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{address}: no notification stream: {e}");
                    pumping.lock().expect("pump set poisoned").remove(&address);
                    return;
                }
            };
            debug!("{address}: notification stream open");
            while let Some(notification) = stream.next().await {
                // btleplug reports only the characteristic UUID; the rest of
                // the identity is resolved against the attribute table, so
                // duplicate UUIDs resolve to the first instance.
                let Some(characteristic) = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| CharacteristicIdentity {
                        service: c.service_uuid,
                        characteristic: c.uuid,
                        instance: 0,
                    })
                else {
                    continue;
                };
                let _ = events.send(TransportEvent::ValueChanged {
                    address: address.clone(),
                    characteristic,
                    value: notification.value,
                });
            }
            debug!("{address}: notification stream ended");
            pumping.lock().expect("pump set poisoned").remove(&address);
        });
    }
}
