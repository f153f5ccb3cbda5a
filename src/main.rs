//! Interactive scanner / inspector for nearby BLE peripherals.
//!
//! Scans continuously, prints sightings, and lets you connect to a device
//! and watch its catalog and signal strength:
//!
//! ```text
//! RUST_LOG=ble_central=debug cargo run --features btleplug
//! ```

use std::io::{self, BufRead};

use anyhow::Result;
use log::{error, info};

use ble_central::prelude::*;
use ble_central::transport::btleplug_backend::BtleplugTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (transport, events) = BtleplugTransport::new().await?;
    let central = BleCentral::new(transport, events);

    info!("Scanning. Commands (type + Enter):");
    info!("  l          – list known peripherals");
    info!("  c <addr>   – connect and print the service catalog");
    info!("  d <addr>   – disconnect");
    info!("  q          – quit");

    let mut discoveries = central.start_scan(Vec::new(), None).await?;
    {
        let central = central.clone();
        tokio::spawn(async move {
            while let Some(event) = discoveries.recv().await {
                match event {
                    DiscoveryEvent::Discovered(info) => {
                        println!(
                            "[SCAN] {}  rssi={:4}  {}",
                            info.address,
                            info.advertisement.rssi,
                            info.local_name.as_deref().unwrap_or("(unnamed)"),
                        );
                    }
                    DiscoveryEvent::Failed(e) => {
                        error!("scan failed: {e}");
                        break;
                    }
                }
            }
            let _ = central.stop_scan().await;
        });
    }

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (to avoid holding a non-Send
    // StdinLock across await points), then relayed to the async side.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        match line.split_once(' ').unwrap_or((line.as_str(), "")) {
            ("q", _) => break,
            ("l", _) => {
                for info in central.list_known().await? {
                    println!(
                        "  {}  rssi={:4}  {}",
                        info.address,
                        info.advertisement.rssi,
                        info.local_name.as_deref().unwrap_or("(unnamed)"),
                    );
                }
            }
            ("c", raw) if !raw.is_empty() => {
                let address = Address::from(raw);
                match central.connect(&address).await {
                    Ok((catalog, mut events)) => {
                        println!("connected to {address}");
                        for service in &catalog.services {
                            println!("  service {}", service.uuid);
                            for ch in &service.characteristics {
                                println!(
                                    "    characteristic {} {:?}",
                                    ch.identity.characteristic, ch.props
                                );
                            }
                        }
                        tokio::spawn(async move {
                            while let Some(event) = events.recv().await {
                                match event {
                                    PeripheralEvent::Rssi(rssi) => {
                                        println!("[RSSI] {address}  {rssi}");
                                    }
                                    PeripheralEvent::Disconnected => {
                                        println!("[LINK] {address} disconnected");
                                        break;
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => error!("connect {address}: {e}"),
                }
            }
            ("d", raw) if !raw.is_empty() => {
                let address = Address::from(raw);
                if let Err(e) = central.disconnect(&address).await {
                    error!("disconnect {address}: {e}");
                }
            }
            _ => info!("commands: l | c <addr> | d <addr> | q"),
        }
    }

    central.stop_scan().await.ok();
    info!("bye");
    Ok(())
}
