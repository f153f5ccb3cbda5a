//! # ble-central
//!
//! Session manager for the BLE central (client) role: device discovery,
//! connection lifecycle, and serialized GATT operations — characteristic
//! reads, acknowledged and unacknowledged writes, and notification /
//! indication subscriptions.
//!
//! The radio stack underneath permits exactly one outstanding GATT request
//! per link, reports every result through an asynchronous callback, and may
//! drop the link at any moment, including mid-operation. This crate turns
//! that into something callers can reason about: a per-peripheral state
//! machine fed by an ordered event stream, a FIFO command queue with
//! single-flight execution, and completion handles that fire exactly once —
//! never zero times, never twice.
//!
//! ## Quick start
//!
//! ```no_run
//! use ble_central::prelude::*;
//! use ble_central::transport::fake::FakeTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BleError> {
//!     // Swap in BtleplugTransport::new() (feature "btleplug") for a real
//!     // adapter; the fake runs without any Bluetooth hardware.
//!     let (transport, events) = FakeTransport::new();
//!     let central = BleCentral::new(transport, events);
//!
//!     let mut discoveries = central.start_scan(Vec::new(), None).await?;
//!     while let Some(event) = discoveries.recv().await {
//!         if let DiscoveryEvent::Discovered(info) = event {
//!             println!("{} rssi={}", info.address, info.advertisement.rssi);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`central`] | [`central::BleCentral`]: device registry, scanning, and the public operation surface |
//! | [`transport`] | The radio-driver boundary: [`transport::Transport`] trait, event stream, fake and btleplug backends |
//! | [`adv`] | Pure advertisement payload parsing and encoding |
//! | [`types`] | Addresses, advertisements, the service catalog, event types |
//! | [`error`] | The [`error::BleError`] taxonomy |
//!
//! ## Guarantees
//!
//! * Commands against one peripheral resolve in FIFO submission order;
//!   at most one is ever submitted to the transport at a time.
//! * Every completion fires exactly once. A forced disconnect fails the
//!   in-flight command and the whole queue with
//!   [`BleError`](error::BleError)`::Disconnected` and clears all
//!   notification subscriptions.
//! * Peripherals are independent: sessions run in their own tasks, and no
//!   global lock serializes unrelated links.
//! * Nothing is retried automatically; reconnect policy belongs to the
//!   caller.
//!
//! All state is in-memory and scoped to the [`central::BleCentral`] handle;
//! a fresh process starts with an empty registry and no links.

pub mod adv;
pub mod central;
pub mod error;
mod peripheral;
mod scan;
pub mod transport;
pub mod types;

pub use central::BleCentral;
pub use error::BleError;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports covering the whole caller-facing surface.
pub mod prelude {
    // ── Session manager ───────────────────────────────────────────────────────
    pub use crate::central::BleCentral;
    pub use crate::error::BleError;

    // ── Transport boundary ────────────────────────────────────────────────────
    pub use crate::transport::{Transport, TransportEvent};

    // ── Data model and events ─────────────────────────────────────────────────
    pub use crate::types::{
        Address, Advertisement, CharacteristicIdentity, CharacteristicInfo, CharacteristicProps,
        DiscoveryEvent, PeripheralEvent, PeripheralInfo, ServiceCatalog, ServiceInfo, WriteMode,
    };
}
