//! The session manager: device registry, scan control, and event routing.
//!
//! [`BleCentral`] is a cheap clonable handle onto one manager task. The task
//! owns the address-keyed registry of known peripherals and the scan
//! controller, consumes the transport's event stream, and forwards
//! link-scoped events to the per-peripheral session tasks. Constructed once
//! around a transport, torn down by dropping every handle — there is no
//! ambient global state.
//!
//! Peripherals are fully independent of each other: every session runs in
//! its own task with its own input channel, so one slow or wedged link never
//! delays another. The manager only routes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::BleError;
use crate::peripheral::{Command, CommandOp, ConnectReply, Session, SessionHandle, SessionInput};
use crate::scan::ScanController;
use crate::transport::{Transport, TransportEvent};
use crate::types::{
    Address, Advertisement, DiscoveryEvent, PeripheralEvent, PeripheralInfo, ServiceCatalog,
    WriteMode,
};

const OPS_CHANNEL_DEPTH: usize = 32;

// ── Public handle ────────────────────────────────────────────────────────────

/// Handle to a running central session manager.
///
/// All methods return immediately in the sense that nothing blocks a thread;
/// awaiting a result suspends only until the corresponding completion fires,
/// exactly once. Dropping every clone of the handle shuts the manager down:
/// active sessions tear down and their outstanding operations resolve with
/// [`BleError::Disconnected`].
#[derive(Clone)]
pub struct BleCentral {
    ops: mpsc::Sender<CentralOp>,
}

impl BleCentral {
    /// Start a manager around a transport and its event stream.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::channel(OPS_CHANNEL_DEPTH);
        let central = Central {
            transport,
            registry: BTreeMap::new(),
            scan: ScanController::new(),
        };
        tokio::spawn(central.run(ops_rx, events));
        Self { ops: ops_tx }
    }

    /// Begin discovery and return the event stream.
    ///
    /// Disconnected registry entries are pruned first; peripherals with a
    /// live session survive. An empty `filter` reports every sighting; a
    /// finite `duration` stops the scan internally once it elapses, closing
    /// the stream. Restarting while a scan is active replaces the previous
    /// stream.
    pub async fn start_scan(
        &self,
        filter: Vec<Uuid>,
        duration: Option<Duration>,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, BleError> {
        self.request(|reply| CentralOp::StartScan {
            filter,
            duration,
            reply,
        })
        .await?
    }

    /// Stop an active scan. A no-op when nothing is scanning.
    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.request(|reply| CentralOp::StopScan { reply }).await?
    }

    /// Snapshot of the device registry, in address order.
    pub async fn list_known(&self) -> Result<Vec<PeripheralInfo>, BleError> {
        self.request(|reply| CentralOp::ListKnown { reply }).await
    }

    /// Whether the transport currently holds a connected link to `address`.
    pub async fn is_connected(&self, address: &Address) -> Result<bool, BleError> {
        let address = address.clone();
        self.request(|reply| CentralOp::IsConnected { address, reply })
            .await
    }

    /// Connect to a peripheral and drive it to Ready.
    ///
    /// Resolves with the enumerated service catalog and the out-of-band
    /// event stream (periodic RSSI readings, terminal
    /// [`PeripheralEvent::Disconnected`]). An address never seen in a scan
    /// gets a registry record created implicitly. Valid only while no
    /// session exists for the address.
    pub async fn connect(
        &self,
        address: &Address,
    ) -> Result<(ServiceCatalog, mpsc::UnboundedReceiver<PeripheralEvent>), BleError> {
        let address = address.clone();
        self.request(|reply| CentralOp::Connect { address, reply })
            .await?
    }

    /// Tear the session down, failing every outstanding and queued operation
    /// with [`BleError::Disconnected`]. Idempotent: disconnecting an unknown
    /// or already-disconnected peripheral succeeds without side effects.
    pub async fn disconnect(&self, address: &Address) -> Result<(), BleError> {
        let address = address.clone();
        self.request(|reply| CentralOp::Disconnect { address, reply })
            .await?
    }

    /// Queue a characteristic read.
    pub async fn read(
        &self,
        address: &Address,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(
            address,
            Command {
                service,
                characteristic,
                op: CommandOp::Read { reply },
            },
        )
        .await?;
        rx.await.map_err(|_| BleError::Shutdown)?
    }

    /// Queue a characteristic write. With [`WriteMode::WithoutResponse`] the
    /// result resolves as soon as the transport accepts the submission.
    pub async fn write(
        &self,
        address: &Address,
        service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(
            address,
            Command {
                service,
                characteristic,
                op: CommandOp::Write {
                    payload,
                    mode,
                    reply,
                },
            },
        )
        .await?;
        rx.await.map_err(|_| BleError::Shutdown)?
    }

    /// Queue a subscription and return the value stream.
    ///
    /// Prefers notify over indicate when the characteristic offers both;
    /// fails with [`BleError::Unsupported`] when it offers neither. Values
    /// stop (and the stream closes) on disconnect.
    pub async fn subscribe(
        &self,
        address: &Address,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BleError> {
        let (reply, rx) = oneshot::channel();
        let (values_tx, values_rx) = mpsc::unbounded_channel();
        self.enqueue(
            address,
            Command {
                service,
                characteristic,
                op: CommandOp::Subscribe {
                    enable: true,
                    subscriber: Some(values_tx),
                    reply,
                },
            },
        )
        .await?;
        rx.await.map_err(|_| BleError::Shutdown)??;
        Ok(values_rx)
    }

    /// Queue the removal of a subscription.
    pub async fn unsubscribe(
        &self,
        address: &Address,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        let (reply, rx) = oneshot::channel();
        self.enqueue(
            address,
            Command {
                service,
                characteristic,
                op: CommandOp::Subscribe {
                    enable: false,
                    subscriber: None,
                    reply,
                },
            },
        )
        .await?;
        rx.await.map_err(|_| BleError::Shutdown)?
    }

    async fn enqueue(&self, address: &Address, command: Command) -> Result<(), BleError> {
        self.ops
            .send(CentralOp::Enqueue {
                address: address.clone(),
                command,
            })
            .await
            .map_err(|_| BleError::Shutdown)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CentralOp,
    ) -> Result<T, BleError> {
        let (reply, rx) = oneshot::channel();
        self.ops
            .send(build(reply))
            .await
            .map_err(|_| BleError::Shutdown)?;
        rx.await.map_err(|_| BleError::Shutdown)
    }
}

// ── Manager internals ────────────────────────────────────────────────────────

enum CentralOp {
    StartScan {
        filter: Vec<Uuid>,
        duration: Option<Duration>,
        reply: oneshot::Sender<Result<mpsc::UnboundedReceiver<DiscoveryEvent>, BleError>>,
    },
    StopScan {
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    ListKnown {
        reply: oneshot::Sender<Vec<PeripheralInfo>>,
    },
    IsConnected {
        address: Address,
        reply: oneshot::Sender<bool>,
    },
    Connect {
        address: Address,
        reply: ConnectReply,
    },
    Disconnect {
        address: Address,
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    Enqueue {
        address: Address,
        command: Command,
    },
}

/// One registry record. The registry is the sole owner of peripheral
/// records; sessions hold only their own link state.
struct DeviceEntry {
    local_name: Option<String>,
    advertisement: Advertisement,
    session: Option<SessionHandle>,
}

impl DeviceEntry {
    /// A record created by connect-by-address before any sighting.
    fn unseen() -> Self {
        Self {
            local_name: None,
            advertisement: Advertisement {
                data: Vec::new(),
                rssi: 0,
            },
            session: None,
        }
    }

    /// The session handle, if the session is still running. Clears handles
    /// of finished sessions as a side effect.
    fn live_session(&mut self) -> Option<&SessionHandle> {
        if self.session.as_ref().is_some_and(|s| s.alive()) {
            self.session.as_ref()
        } else {
            self.session = None;
            None
        }
    }

    fn info(&self, address: &Address) -> PeripheralInfo {
        PeripheralInfo {
            address: address.clone(),
            local_name: self.local_name.clone(),
            advertisement: self.advertisement.clone(),
        }
    }
}

enum Wake {
    Op(Option<CentralOp>),
    Event(TransportEvent),
    Timer(crate::scan::ScanTimer),
}

struct Central {
    transport: Arc<dyn Transport>,
    registry: BTreeMap<Address, DeviceEntry>,
    scan: ScanController,
}

impl Central {
    async fn run(
        mut self,
        mut ops: mpsc::Receiver<CentralOp>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("central session manager started");
        loop {
            // Resolve the wakeup first, then act: the arm futures borrow
            // `self.scan`, the handlers need `&mut self`.
            let wake = tokio::select! {
                op = ops.recv() => Wake::Op(op),
                Some(event) = events.recv() => Wake::Event(event),
                timer = self.scan.tick() => Wake::Timer(timer),
            };
            match wake {
                Wake::Op(Some(op)) => self.handle_op(op).await,
                Wake::Op(None) => break,
                Wake::Event(event) => self.handle_event(event).await,
                Wake::Timer(timer) => self.scan.handle_timer(&self.transport, timer).await,
            }
        }
        if self.scan.is_active() {
            self.scan.stop(&self.transport).await;
        }
        info!("central session manager stopped");
        // Dropping the registry drops every session handle; the session
        // tasks notice and tear their links down.
    }

    async fn handle_op(&mut self, op: CentralOp) {
        match op {
            CentralOp::StartScan {
                filter,
                duration,
                reply,
            } => {
                self.prune_registry();
                let result = self.scan.start(&self.transport, filter, duration).await;
                let _ = reply.send(result);
            }
            CentralOp::StopScan { reply } => {
                self.scan.stop(&self.transport).await;
                let _ = reply.send(Ok(()));
            }
            CentralOp::ListKnown { reply } => {
                let known = self
                    .registry
                    .iter()
                    .map(|(address, entry)| entry.info(address))
                    .collect();
                let _ = reply.send(known);
            }
            CentralOp::IsConnected { address, reply } => {
                let _ = reply.send(self.transport.is_connected(&address).await);
            }
            CentralOp::Connect { address, reply } => {
                let entry = self
                    .registry
                    .entry(address.clone())
                    .or_insert_with(DeviceEntry::unseen);
                if entry.live_session().is_some() {
                    let _ = reply.send(Err(BleError::AlreadyConnected));
                    return;
                }
                entry.session = Some(Session::spawn(address, self.transport.clone(), reply));
            }
            CentralOp::Disconnect { address, reply } => {
                let Some(entry) = self.registry.get_mut(&address) else {
                    let _ = reply.send(Ok(()));
                    return;
                };
                match entry.live_session() {
                    Some(handle) => {
                        if let Err(input) = handle.send(SessionInput::Disconnect { reply }) {
                            if let SessionInput::Disconnect { reply } = input {
                                let _ = reply.send(Ok(()));
                            }
                            entry.session = None;
                        }
                    }
                    // Already disconnected: no-op success.
                    None => {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            CentralOp::Enqueue { address, command } => {
                let Some(entry) = self.registry.get_mut(&address) else {
                    command.fail(BleError::PeripheralNotFound(address));
                    return;
                };
                match entry.live_session() {
                    Some(handle) => {
                        if let Err(input) = handle.send(SessionInput::Command(command)) {
                            if let SessionInput::Command(command) = input {
                                command.fail(BleError::NotConnected);
                            }
                            entry.session = None;
                        }
                    }
                    None => command.fail(BleError::NotConnected),
                }
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered {
                address,
                local_name,
                advertisement,
                rssi,
            } => {
                let advertisement = Advertisement {
                    data: advertisement,
                    rssi,
                };
                if self.scan.is_active() {
                    if !self.scan.accepts(&advertisement.data) {
                        return;
                    }
                    // Re-sightings update the record in place; the registry
                    // never holds two records for one address.
                    let entry = self
                        .registry
                        .entry(address.clone())
                        .or_insert_with(DeviceEntry::unseen);
                    if local_name.is_some() {
                        entry.local_name = local_name;
                    }
                    entry.advertisement = advertisement;
                    debug!(
                        "discovered {address} rssi={}",
                        entry.advertisement.rssi
                    );
                    let info = entry.info(&address);
                    self.scan.emit(info);
                } else if let Some(entry) = self.registry.get_mut(&address) {
                    if local_name.is_some() {
                        entry.local_name = local_name;
                    }
                    entry.advertisement = advertisement;
                }
            }
            TransportEvent::ScanFailed { reason } => self.scan.fail(reason),
            event => self.route_to_session(event),
        }
    }

    /// Forward a link-scoped event to the owning session, in arrival order.
    fn route_to_session(&mut self, event: TransportEvent) {
        let Some(address) = event.link_address().cloned() else {
            return;
        };
        // Signal strength also lands in the registry record: most recent
        // wins, regardless of whether it came from a sighting or a poll.
        if let TransportEvent::Rssi { rssi, .. } = &event {
            if let Some(entry) = self.registry.get_mut(&address) {
                entry.advertisement.rssi = *rssi;
            }
        }
        let Some(entry) = self.registry.get_mut(&address) else {
            debug!("dropping transport event for unknown peripheral {address}");
            return;
        };
        match entry.live_session() {
            Some(handle) => {
                if handle.send(SessionInput::Transport(event)).is_err() {
                    entry.session = None;
                }
            }
            None => debug!("dropping transport event for idle peripheral {address}"),
        }
    }

    /// Drop every record without a live session. Connected peripherals (and
    /// ones with a connection attempt in progress) survive.
    fn prune_registry(&mut self) {
        let before = self.registry.len();
        self.registry
            .retain(|_, entry| entry.session.as_ref().is_some_and(|s| s.alive()));
        let pruned = before - self.registry.len();
        if pruned > 0 {
            debug!("pruned {pruned} disconnected peripheral(s) from the registry");
        }
    }
}
