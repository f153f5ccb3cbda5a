//! Advertisement payload parsing.
//!
//! BLE advertisements are a sequence of AD structures, each
//! `[length, type, payload…]` with `length` covering the type byte and the
//! payload. The scan controller only needs two things out of them: the set of
//! advertised service UUIDs (for software filtering) and the local name.
//! Both decoders are pure functions over the raw bytes.
//!
//! [`AdvertisementBuilder`] is the inverse, used by transport backends whose
//! platform API hands out pre-parsed fields rather than raw payloads, and by
//! tests to fabricate sightings.

use std::collections::BTreeSet;

use uuid::Uuid;

// AD types from the Bluetooth assigned numbers.
const AD_UUIDS_16_PARTIAL: u8 = 0x02;
const AD_UUIDS_16_COMPLETE: u8 = 0x03;
const AD_UUIDS_32_PARTIAL: u8 = 0x04;
const AD_UUIDS_32_COMPLETE: u8 = 0x05;
const AD_UUIDS_128_PARTIAL: u8 = 0x06;
const AD_UUIDS_128_COMPLETE: u8 = 0x07;
const AD_NAME_SHORTENED: u8 = 0x08;
const AD_NAME_COMPLETE: u8 = 0x09;

/// The Bluetooth base UUID with the short-UUID field zeroed:
/// `00000000-0000-1000-8000-00805f9b34fb`.
const BLUETOOTH_BASE: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const SHORT_UUID_MASK: u128 = 0xffffffff_u128 << 96;

/// Expand a 16-bit short UUID onto the Bluetooth base UUID.
pub fn uuid16(short: u16) -> Uuid {
    uuid32(u32::from(short))
}

/// Expand a 32-bit short UUID onto the Bluetooth base UUID.
pub fn uuid32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE | (u128::from(short) << 96))
}

/// The 16-bit alias of `uuid`, if it lies on the Bluetooth base.
fn as_uuid16(uuid: Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !SHORT_UUID_MASK == BLUETOOTH_BASE && (value >> 96) <= u128::from(u16::MAX) {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Iterate the AD structures of a raw advertisement payload as
/// `(ad_type, payload)` pairs. Stops at the first malformed length.
fn structures(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset >= data.len() {
            return None;
        }
        let len = data[offset] as usize;
        // A zero length terminates the payload; a length running past the
        // end means the record is truncated.
        if len == 0 || offset + len >= data.len() {
            return None;
        }
        let ad_type = data[offset + 1];
        let payload = &data[offset + 2..offset + 1 + len];
        offset += len + 1;
        Some((ad_type, payload))
    })
}

/// Extract every advertised service UUID from a raw advertisement payload.
///
/// Handles the partial and complete list forms of 16-, 32-, and 128-bit
/// UUIDs. Short UUIDs are expanded onto the Bluetooth base so the result is
/// directly comparable against a caller-supplied filter set. Malformed or
/// truncated structures are skipped rather than treated as an error; an
/// advertisement we cannot parse simply advertises nothing.
pub fn advertised_services(data: &[u8]) -> BTreeSet<Uuid> {
    let mut uuids = BTreeSet::new();
    for (ad_type, payload) in structures(data) {
        match ad_type {
            AD_UUIDS_16_PARTIAL | AD_UUIDS_16_COMPLETE => {
                for chunk in payload.chunks_exact(2) {
                    uuids.insert(uuid16(u16::from_le_bytes([chunk[0], chunk[1]])));
                }
            }
            AD_UUIDS_32_PARTIAL | AD_UUIDS_32_COMPLETE => {
                for chunk in payload.chunks_exact(4) {
                    uuids.insert(uuid32(u32::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ])));
                }
            }
            AD_UUIDS_128_PARTIAL | AD_UUIDS_128_COMPLETE => {
                for chunk in payload.chunks_exact(16) {
                    // 128-bit UUIDs go over the air little-endian.
                    let mut bytes = [0u8; 16];
                    for (dst, src) in bytes.iter_mut().zip(chunk.iter().rev()) {
                        *dst = *src;
                    }
                    uuids.insert(Uuid::from_bytes(bytes));
                }
            }
            _ => {}
        }
    }
    uuids
}

/// Extract the advertised local name, preferring the complete form over the
/// shortened one when both are present.
pub fn local_name(data: &[u8]) -> Option<String> {
    let mut shortened = None;
    for (ad_type, payload) in structures(data) {
        match ad_type {
            AD_NAME_COMPLETE => {
                return Some(String::from_utf8_lossy(payload).into_owned());
            }
            AD_NAME_SHORTENED => {
                shortened = Some(String::from_utf8_lossy(payload).into_owned());
            }
            _ => {}
        }
    }
    shortened
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Builds a canonical advertisement payload from parsed fields.
///
/// Platform scan APIs (btleplug included) report advertisements pre-parsed;
/// the registry stores raw payloads, so backends re-encode what they were
/// given. Tests use the same builder to fabricate sightings.
#[derive(Debug, Default)]
pub struct AdvertisementBuilder {
    data: Vec<u8>,
}

impl AdvertisementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the advertised service UUIDs, as a complete 16-bit list where
    /// possible and a complete 128-bit list for the rest.
    pub fn services(mut self, services: &[Uuid]) -> Self {
        let mut short = Vec::new();
        let mut long = Vec::new();
        for &uuid in services {
            match as_uuid16(uuid) {
                Some(alias) => short.push(alias),
                None => long.push(uuid),
            }
        }
        if !short.is_empty() {
            self.data.push((short.len() * 2 + 1) as u8);
            self.data.push(AD_UUIDS_16_COMPLETE);
            for alias in short {
                self.data.extend_from_slice(&alias.to_le_bytes());
            }
        }
        if !long.is_empty() {
            self.data.push((long.len() * 16 + 1) as u8);
            self.data.push(AD_UUIDS_128_COMPLETE);
            for uuid in long {
                let mut bytes = *uuid.as_bytes();
                bytes.reverse();
                self.data.extend_from_slice(&bytes);
            }
        }
        self
    }

    /// Append a complete local name structure.
    pub fn local_name(mut self, name: &str) -> Self {
        let bytes = name.as_bytes();
        self.data.push((bytes.len() + 1) as u8);
        self.data.push(AD_NAME_COMPLETE);
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}
