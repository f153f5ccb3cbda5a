//! The radio-driver boundary.
//!
//! The session core never talks to a BLE stack directly; it submits requests
//! through the [`Transport`] trait and consumes the results as
//! [`TransportEvent`] messages on a single mpsc stream. A trait method
//! resolves quickly with submission success or failure (an `Err` here maps to
//! [`BleError::TransportRejected`](crate::BleError::TransportRejected));
//! every real outcome — link state changes, operation completions, RSSI
//! readings, value changes — arrives later as exactly one event, tagged with
//! enough identity to route it back to the owning peripheral session.
//!
//! [`fake::FakeTransport`] backs the test suite and hardware-free
//! development; the `btleplug` feature adds
//! [`btleplug_backend::BtleplugTransport`] for real adapters.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BleError;
use crate::types::{Address, CharacteristicIdentity, ServiceCatalog, WriteMode};

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;
pub mod fake;

/// Everything the session core needs from a BLE stack.
///
/// Implementations must be cheap to call: each method only hands the request
/// to the stack. Long-running work happens behind the scenes and reports
/// back through the event stream the backend was constructed around.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether the stack's native service filtering is trustworthy. When
    /// this returns `false` the scan controller requests unfiltered results,
    /// filters in software, and periodically restarts the scan to counter
    /// stale internal filter state.
    fn supports_native_filtering(&self) -> bool {
        false
    }

    /// Begin discovery. `services` is a native filter and is only passed
    /// when [`Transport::supports_native_filtering`] is `true`.
    async fn start_scan(&self, services: &[Uuid]) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Allocate a link to the peripheral. Completion arrives as
    /// [`TransportEvent::LinkEstablished`] or [`TransportEvent::LinkLost`].
    async fn connect(&self, address: &Address) -> Result<(), BleError>;

    /// Request a graceful link release. Completion arrives as
    /// [`TransportEvent::LinkLost`].
    async fn disconnect(&self, address: &Address) -> Result<(), BleError>;

    /// Whether the stack currently considers the link connected.
    async fn is_connected(&self, address: &Address) -> bool;

    /// Enumerate services, characteristics and descriptors of a connected
    /// link. Completion arrives as [`TransportEvent::ServicesDiscovered`].
    async fn discover_services(&self, address: &Address) -> Result<(), BleError>;

    /// Submit a characteristic read. Completion arrives as
    /// [`TransportEvent::CharacteristicRead`].
    async fn read_characteristic(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
    ) -> Result<(), BleError>;

    /// Submit a characteristic write. In [`WriteMode::WithResponse`] mode the
    /// completion arrives as [`TransportEvent::CharacteristicWritten`]; in
    /// [`WriteMode::WithoutResponse`] mode a successful submission is the
    /// completion and no event follows.
    async fn write_characteristic(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError>;

    /// Submit a descriptor write. Completion arrives as
    /// [`TransportEvent::DescriptorWritten`].
    async fn write_descriptor(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), BleError>;

    /// Switch local delivery of value-changed events for a characteristic on
    /// or off. Backends that fold the remote CCCD write into this call emit
    /// the corresponding [`TransportEvent::DescriptorWritten`] themselves.
    async fn set_notify(
        &self,
        address: &Address,
        characteristic: &CharacteristicIdentity,
        enable: bool,
    ) -> Result<(), BleError>;

    /// Request a signal-strength reading for a connected link. The reading
    /// arrives as [`TransportEvent::Rssi`].
    async fn read_rssi(&self, address: &Address) -> Result<(), BleError>;
}

/// One callback from the radio stack, rendered as a message.
///
/// The manager consumes the stream and routes link-scoped events to the
/// owning peripheral session, which processes them in arrival order. Failure
/// payloads are plain strings: the stack's status codes are only ever shown
/// to humans, and keeping the boundary stringly avoids leaking platform
/// error types into the core.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An advertisement sighting (first or repeat).
    Discovered {
        address: Address,
        local_name: Option<String>,
        advertisement: Vec<u8>,
        rssi: i16,
    },
    /// Discovery died underneath us.
    ScanFailed { reason: String },
    /// The link for `address` is up; the attribute table is not yet known.
    LinkEstablished { address: Address },
    /// The link for `address` is gone — requested or not.
    LinkLost { address: Address },
    /// Service enumeration finished.
    ServicesDiscovered {
        address: Address,
        result: Result<ServiceCatalog, String>,
    },
    /// A characteristic read completed.
    CharacteristicRead {
        address: Address,
        characteristic: CharacteristicIdentity,
        result: Result<Vec<u8>, String>,
    },
    /// An acknowledged characteristic write completed.
    CharacteristicWritten {
        address: Address,
        characteristic: CharacteristicIdentity,
        result: Result<(), String>,
    },
    /// A descriptor write completed.
    DescriptorWritten {
        address: Address,
        characteristic: CharacteristicIdentity,
        result: Result<(), String>,
    },
    /// A signal-strength reading for a connected link.
    Rssi { address: Address, rssi: i16 },
    /// An unsolicited notification or indication.
    ValueChanged {
        address: Address,
        characteristic: CharacteristicIdentity,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    /// The peripheral a link-scoped event belongs to; `None` for scan-scoped
    /// events.
    pub fn link_address(&self) -> Option<&Address> {
        match self {
            TransportEvent::Discovered { .. } | TransportEvent::ScanFailed { .. } => None,
            TransportEvent::LinkEstablished { address }
            | TransportEvent::LinkLost { address }
            | TransportEvent::ServicesDiscovered { address, .. }
            | TransportEvent::CharacteristicRead { address, .. }
            | TransportEvent::CharacteristicWritten { address, .. }
            | TransportEvent::DescriptorWritten { address, .. }
            | TransportEvent::Rssi { address, .. }
            | TransportEvent::ValueChanged { address, .. } => Some(address),
        }
    }
}
