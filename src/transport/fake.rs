//! Scripted in-memory transport.
//!
//! Backs the test suite and lets the whole session layer run without a
//! Bluetooth stack. The fake records every submission, optionally rejects
//! scripted calls, and leaves event delivery entirely to the test: helpers
//! such as [`FakeTransport::establish`] and [`FakeTransport::complete_read`]
//! push the corresponding [`TransportEvent`] onto the stream, so a test
//! drives the radio side of a scenario step by step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::adv::AdvertisementBuilder;
use crate::error::BleError;
use crate::transport::{Transport, TransportEvent};
use crate::types::{Address, CharacteristicIdentity, ServiceCatalog, WriteMode};

/// One recorded submission.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeCall {
    StartScan { services: Vec<Uuid> },
    StopScan,
    Connect { address: Address },
    Disconnect { address: Address },
    DiscoverServices { address: Address },
    ReadCharacteristic {
        address: Address,
        characteristic: CharacteristicIdentity,
    },
    WriteCharacteristic {
        address: Address,
        characteristic: CharacteristicIdentity,
        payload: Vec<u8>,
        mode: WriteMode,
    },
    WriteDescriptor {
        address: Address,
        characteristic: CharacteristicIdentity,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    SetNotify {
        address: Address,
        characteristic: CharacteristicIdentity,
        enable: bool,
    },
    ReadRssi { address: Address },
}

/// Method selector for scripted rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeMethod {
    StartScan,
    StopScan,
    Connect,
    Disconnect,
    DiscoverServices,
    ReadCharacteristic,
    WriteCharacteristic,
    WriteDescriptor,
    SetNotify,
    ReadRssi,
}

#[derive(Default)]
struct Inner {
    calls: Vec<FakeCall>,
    rejections: HashMap<FakeMethod, VecDeque<BleError>>,
    connected: HashSet<Address>,
    native_filtering: bool,
}

pub struct FakeTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<Inner>,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events,
                inner: Mutex::new(Inner::default()),
            }),
            rx,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake transport state poisoned")
    }

    // ── Scripting ────────────────────────────────────────────────────────────

    /// Make the next call to `method` fail with `error` at submission time.
    pub fn reject_next(&self, method: FakeMethod, error: BleError) {
        self.lock().rejections.entry(method).or_default().push_back(error);
    }

    /// Report native filtering support from the scan capability probe.
    pub fn set_native_filtering(&self, supported: bool) {
        self.lock().native_filtering = supported;
    }

    /// Override what `is_connected` reports for `address`.
    pub fn set_connected(&self, address: &Address, connected: bool) {
        let mut inner = self.lock();
        if connected {
            inner.connected.insert(address.clone());
        } else {
            inner.connected.remove(address);
        }
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    /// Every submission recorded so far, in call order.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.lock().calls.clone()
    }

    /// Drain and return the recorded submissions.
    pub fn take_calls(&self) -> Vec<FakeCall> {
        std::mem::take(&mut self.lock().calls)
    }

    /// Wait until a recorded call satisfies `pred`. Panics after a bounded
    /// number of polls so a broken scenario fails fast instead of hanging.
    pub async fn wait_for_call(&self, what: &str, pred: impl Fn(&FakeCall) -> bool) {
        for _ in 0..500 {
            if self.lock().calls.iter().any(&pred) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("timed out waiting for transport call: {what}");
    }

    // ── Event injection ──────────────────────────────────────────────────────

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Emit a sighting with a synthesized advertisement payload.
    pub fn advertise(&self, address: &Address, name: Option<&str>, services: &[Uuid], rssi: i16) {
        let mut builder = AdvertisementBuilder::new().services(services);
        if let Some(name) = name {
            builder = builder.local_name(name);
        }
        self.emit(TransportEvent::Discovered {
            address: address.clone(),
            local_name: name.map(str::to_owned),
            advertisement: builder.build(),
            rssi,
        });
    }

    pub fn fail_scan(&self, reason: &str) {
        self.emit(TransportEvent::ScanFailed {
            reason: reason.to_owned(),
        });
    }

    /// Mark the link connected and report it established.
    pub fn establish(&self, address: &Address) {
        self.set_connected(address, true);
        self.emit(TransportEvent::LinkEstablished {
            address: address.clone(),
        });
    }

    /// Mark the link gone and report the loss.
    pub fn lose_link(&self, address: &Address) {
        self.set_connected(address, false);
        self.emit(TransportEvent::LinkLost {
            address: address.clone(),
        });
    }

    pub fn deliver_catalog(&self, address: &Address, catalog: ServiceCatalog) {
        self.emit(TransportEvent::ServicesDiscovered {
            address: address.clone(),
            result: Ok(catalog),
        });
    }

    pub fn fail_discovery(&self, address: &Address, reason: &str) {
        self.emit(TransportEvent::ServicesDiscovered {
            address: address.clone(),
            result: Err(reason.to_owned()),
        });
    }

    pub fn complete_read(
        &self,
        address: &Address,
        characteristic: CharacteristicIdentity,
        result: Result<Vec<u8>, &str>,
    ) {
        self.emit(TransportEvent::CharacteristicRead {
            address: address.clone(),
            characteristic,
            result: result.map_err(str::to_owned),
        });
    }

    pub fn complete_write(
        &self,
        address: &Address,
        characteristic: CharacteristicIdentity,
        result: Result<(), &str>,
    ) {
        self.emit(TransportEvent::CharacteristicWritten {
            address: address.clone(),
            characteristic,
            result: result.map_err(str::to_owned),
        });
    }

    pub fn complete_descriptor_write(
        &self,
        address: &Address,
        characteristic: CharacteristicIdentity,
        result: Result<(), &str>,
    ) {
        self.emit(TransportEvent::DescriptorWritten {
            address: address.clone(),
            characteristic,
            result: result.map_err(str::to_owned),
        });
    }

    pub fn report_rssi(&self, address: &Address, rssi: i16) {
        self.emit(TransportEvent::Rssi {
            address: address.clone(),
            rssi,
        });
    }

    pub fn notify(&self, address: &Address, characteristic: CharacteristicIdentity, value: Vec<u8>) {
        self.emit(TransportEvent::ValueChanged {
            address: address.clone(),
            characteristic,
            value,
        });
    }

    // ── Submission plumbing ──────────────────────────────────────────────────

    fn submit(&self, method: FakeMethod, call: FakeCall) -> Result<(), BleError> {
        let mut inner = self.lock();
        inner.calls.push(call);
        match inner.rejections.get_mut(&method).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn supports_native_filtering(&self) -> bool {
        self.lock().native_filtering
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), BleError> {
        self.submit(
            FakeMethod::StartScan,
            FakeCall::StartScan {
                services: services.to_vec(),
            },
        )
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.submit(FakeMethod::StopScan, FakeCall::StopScan)
    }

    async fn connect(&self, address: &Address) -> Result<(), BleError> {
        self.submit(
            FakeMethod::Connect,
            FakeCall::Connect {
                address: address.clone(),
            },
        )
    }

    async fn disconnect(&self, address: &Address) -> Result<(), BleError> {
        self.submit(
            FakeMethod::Disconnect,
            FakeCall::Disconnect {
                address: address.clone(),
            },
        )
    }

    async fn is_connected(&self, address: &Address) -> bool {
        self.lock().connected.contains(address)
    }

    async fn discover_services(&self, address: &Address) -> Result<(), BleError> {
        self.submit(
            FakeMethod::DiscoverServices,
            FakeCall::DiscoverServices {
                address: address.clone(),
            },
        )
    }

    async fn read_characteristic(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
    ) -> Result<(), BleError> {
        self.submit(
            FakeMethod::ReadCharacteristic,
            FakeCall::ReadCharacteristic {
                address: address.clone(),
                characteristic: *characteristic,
            },
        )
    }

    async fn write_characteristic(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        self.submit(
            FakeMethod::WriteCharacteristic,
            FakeCall::WriteCharacteristic {
                address: address.clone(),
                characteristic: *characteristic,
                payload: payload.to_vec(),
                mode,
            },
        )
    }

    async fn write_descriptor(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError> {
        self.submit(
            FakeMethod::WriteDescriptor,
            FakeCall::WriteDescriptor {
                address: address.clone(),
                characteristic: *characteristic,
                descriptor,
                value: value.to_vec(),
            },
        )
    }

    async fn set_notify(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
        enable: bool,
    ) -> Result<(), BleError> {
        self.submit(
            FakeMethod::SetNotify,
            FakeCall::SetNotify {
                address: address.clone(),
                characteristic: *characteristic,
                enable,
            },
        )
    }

    async fn read_rssi(&self, address: &Address) -> Result<(), BleError> {
        self.submit(
            FakeMethod::ReadRssi,
            FakeCall::ReadRssi {
                address: address.clone(),
            },
        )
    }
}
