//! Error taxonomy for the central session manager.
//!
//! Every failure is scoped to one peripheral's session (or one scan); nothing
//! here is fatal to the process. Lookup and capability errors resolve to the
//! requesting operation only, while a lost link escalates to a full-session
//! failure in which every outstanding completion resolves with
//! [`BleError::Disconnected`].

use thiserror::Error;
use uuid::Uuid;

use crate::types::Address;

/// Unified error type returned by every operation on
/// [`BleCentral`](crate::central::BleCentral).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    /// No peripheral with this address is present in the device registry.
    #[error("peripheral {0} not found")]
    PeripheralNotFound(Address),

    /// The connected peripheral's catalog does not contain this service.
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),

    /// The service exists but does not contain this characteristic.
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    /// The characteristic lacks a required descriptor (typically the client
    /// characteristic configuration descriptor needed for subscriptions).
    #[error("descriptor {0} not found")]
    DescriptorNotFound(Uuid),

    /// A GATT operation was requested against a peripheral with no live
    /// session.
    #[error("peripheral is not connected")]
    NotConnected,

    /// `connect` was called while a session already exists for this address.
    #[error("peripheral already has an active session")]
    AlreadyConnected,

    /// The transport refused the request at submission time, before anything
    /// went over the air.
    #[error("transport rejected the request: {0}")]
    TransportRejected(String),

    /// The transport accepted the request but its completion callback
    /// reported a failure status.
    #[error("transport reported failure: {0}")]
    TransportFailed(String),

    /// The link was lost (or torn down by the caller) while the operation was
    /// pending or queued.
    #[error("disconnected")]
    Disconnected,

    /// The characteristic advertises neither notify nor indicate capability.
    #[error("characteristic supports neither notify nor indicate")]
    Unsupported,

    /// The underlying discovery mechanism failed; the scan stream terminates.
    #[error("scan failed: {0}")]
    ScanFailed(String),

    /// The session manager task is no longer running.
    #[error("session manager is shut down")]
    Shutdown,
}
