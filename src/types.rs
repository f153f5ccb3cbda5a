//! Core data model shared by the registry, the session state machine, and
//! the transport boundary.

use uuid::Uuid;

use crate::adv;
use crate::error::BleError;

// ── GATT constants ────────────────────────────────────────────────────────────

/// Client characteristic configuration descriptor (0x2902).
///
/// Writing it switches notification/indication delivery on or off on the
/// remote side; every subscription command targets it.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
/// CCCD value disabling both delivery modes.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

// ── Addressing ────────────────────────────────────────────────────────────────

/// Stable platform identifier of a peripheral.
///
/// A MAC address on Linux and Android, an opaque UUID string on macOS. The
/// registry is keyed by it and it is never reused while a record exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

impl From<String> for Address {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Advertisements and registry snapshots ─────────────────────────────────────

/// The most recently observed advertisement of a peripheral.
///
/// Replaced wholesale on every sighting, never merged field-by-field, and
/// never touched by connection events.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Advertisement {
    /// Raw advertisement payload (a sequence of AD structures).
    pub data: Vec<u8>,
    /// Signal strength at the time of the sighting, in dBm. Most recent
    /// wins, whether it came from a re-discovery or a post-connect poll.
    pub rssi: i16,
}

impl Advertisement {
    /// Service UUIDs advertised in the payload.
    pub fn services(&self) -> std::collections::BTreeSet<Uuid> {
        adv::advertised_services(&self.data)
    }
}

/// A snapshot of one device-registry record, as carried by discovery events
/// and returned from `list_known`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralInfo {
    pub address: Address,
    /// Advertised local name, when one has been seen.
    pub local_name: Option<String>,
    pub advertisement: Advertisement,
}

// ── Service catalog ───────────────────────────────────────────────────────────

/// Full identity of one characteristic instance.
///
/// A peripheral may expose several characteristics with identical service and
/// characteristic UUIDs; the instance discriminator (assigned by the
/// transport during enumeration, in table order) keeps them apart. The
/// notification registry is keyed by this triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicIdentity {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub instance: u32,
}

/// Capability flags of a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProps {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// One characteristic in the enumerated attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicInfo {
    pub identity: CharacteristicIdentity,
    pub props: CharacteristicProps,
    /// Descriptor UUIDs attached to the characteristic.
    pub descriptors: Vec<Uuid>,
}

impl CharacteristicInfo {
    pub fn new(
        service: Uuid,
        characteristic: Uuid,
        instance: u32,
        props: CharacteristicProps,
        descriptors: Vec<Uuid>,
    ) -> Self {
        Self {
            identity: CharacteristicIdentity {
                service,
                characteristic,
                instance,
            },
            props,
            descriptors,
        }
    }

    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }
}

/// One enumerated service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// The attribute table of a connected peripheral, produced by service
/// enumeration and resolved to the caller when the session reaches Ready.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceCatalog {
    pub services: Vec<ServiceInfo>,
}

impl ServiceCatalog {
    pub fn new(services: Vec<ServiceInfo>) -> Self {
        Self { services }
    }

    pub fn service(&self, uuid: Uuid) -> Option<&ServiceInfo> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    /// Look up a characteristic by service and characteristic UUID. When
    /// several instances share the same identifiers, the first one in table
    /// order is returned — operations that need a specific instance go
    /// through [`CharacteristicIdentity`].
    pub fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<&CharacteristicInfo> {
        self.service(service)?
            .characteristics
            .iter()
            .find(|c| c.identity.characteristic == characteristic)
    }
}

// ── Operations ────────────────────────────────────────────────────────────────

/// Write acknowledgement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Wait for the peripheral's acknowledgement; the completion fires when
    /// the transport reports the write callback.
    WithResponse,
    /// Resolve as soon as the transport accepts the submission.
    WithoutResponse,
}

// ── Caller-facing event streams ───────────────────────────────────────────────

/// Events on the discovery stream returned by `start_scan`.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A peripheral was sighted (or re-sighted; the record is updated in
    /// place and re-emitted).
    Discovered(PeripheralInfo),
    /// The underlying discovery mechanism failed. This is the last event on
    /// the stream; a new `start_scan` is required.
    Failed(BleError),
}

/// Out-of-band per-connection events, delivered on the stream returned by
/// `connect` for as long as the session lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    /// A signal-strength reading from the periodic post-connect poll.
    Rssi(i16),
    /// The session reached its terminal state; no further events follow.
    Disconnected,
}
