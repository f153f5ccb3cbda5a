//! Per-peripheral session: connection lifecycle and the serialized command
//! queue.
//!
//! Each `connect` spawns one session task that owns everything about that
//! link: the state machine (`Disconnected → Connecting → DiscoveringServices
//! → Ready → Disconnecting → Disconnected`), the FIFO of pending GATT
//! commands, the single in-flight slot, and the notification registry. All
//! transport callbacks for the link are forwarded to the task over one
//! channel and processed in arrival order, so nothing ever re-enters the
//! state machine concurrently.
//!
//! The radio permits a single outstanding GATT request per link, and
//! completions arrive asynchronously in no guaranteed relation to what was
//! queued. The rules that keep callers sane:
//!
//! * at most one command is submitted to the transport at a time;
//! * every completion handle fires exactly once — a `oneshot` sender is
//!   consumed on send, so double completion is unrepresentable;
//! * a lost link fails the in-flight command and the whole queue with
//!   [`BleError::Disconnected`], in FIFO order, and clears subscriptions.
//!
//! NOTE: if the link drops between a write submission and its completion
//! callback, that callback never arrives. Teardown resolves the outstanding
//! completion itself so no caller waits forever.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use uuid::Uuid;

use crate::error::BleError;
use crate::transport::{Transport, TransportEvent};
use crate::types::{
    Address, CharacteristicIdentity, PeripheralEvent, ServiceCatalog, WriteMode,
    CLIENT_CHARACTERISTIC_CONFIGURATION, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE,
    ENABLE_NOTIFICATION_VALUE,
};

/// Signal-strength poll cadence while Ready. Not a contract — anything that
/// keeps the reading reasonably fresh without hammering the stack is fine.
const RSSI_POLL_INTERVAL: Duration = Duration::from_secs(5);

// ── Connection state machine ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    /// Initial and terminal. A session in this state is finished.
    Disconnected,
    /// Link allocation submitted, waiting for the transport to report it up.
    Connecting,
    /// Link is up but the attribute table is not yet known; no operation may
    /// run before the catalog exists.
    DiscoveringServices,
    /// Catalog known; the queue drains, RSSI is polled.
    Ready,
    /// Graceful release requested, waiting for the transport to confirm.
    Disconnecting,
}

// ── Commands ─────────────────────────────────────────────────────────────────

pub(crate) type ConnectResult =
    Result<(ServiceCatalog, mpsc::UnboundedReceiver<PeripheralEvent>), BleError>;
pub(crate) type ConnectReply = oneshot::Sender<ConnectResult>;

/// One requested GATT operation; immutable once created, lives until its
/// completion fires.
pub(crate) struct Command {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub op: CommandOp,
}

pub(crate) enum CommandOp {
    Read {
        reply: oneshot::Sender<Result<Vec<u8>, BleError>>,
    },
    Write {
        payload: Vec<u8>,
        mode: WriteMode,
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    Subscribe {
        enable: bool,
        /// Subscriber handle, taken out of the command and installed in the
        /// registry when the command dispatches with `enable = true`.
        subscriber: Option<mpsc::UnboundedSender<Vec<u8>>>,
        reply: oneshot::Sender<Result<(), BleError>>,
    },
}

impl Command {
    fn kind(&self) -> &'static str {
        match self.op {
            CommandOp::Read { .. } => "read",
            CommandOp::Write { .. } => "write",
            CommandOp::Subscribe { enable: true, .. } => "subscribe",
            CommandOp::Subscribe { enable: false, .. } => "unsubscribe",
        }
    }

    pub(crate) fn fail(self, error: BleError) {
        match self.op {
            CommandOp::Read { reply } => {
                let _ = reply.send(Err(error));
            }
            CommandOp::Write { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            CommandOp::Subscribe { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

// ── Session plumbing ─────────────────────────────────────────────────────────

/// Inputs consumed by the session task, in arrival order.
pub(crate) enum SessionInput {
    Command(Command),
    Disconnect {
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    Transport(TransportEvent),
}

/// Manager-side handle to a session task.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionInput>,
    ended: Arc<AtomicBool>,
}

impl SessionHandle {
    /// Whether the session can still accept inputs. `ended` flips before the
    /// final completions are delivered, so anyone who has observed a
    /// disconnect outcome will see the session as dead here.
    pub(crate) fn alive(&self) -> bool {
        !self.ended.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Forward an input; hands it back if the task is gone so the caller can
    /// fail it appropriately.
    pub(crate) fn send(&self, input: SessionInput) -> Result<(), SessionInput> {
        self.tx.send(input).map_err(|e| e.0)
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

pub(crate) struct Session {
    address: Address,
    transport: Arc<dyn Transport>,
    state: ConnectionState,
    catalog: Option<ServiceCatalog>,
    pending: VecDeque<Command>,
    in_flight: Option<Command>,
    subscribers: HashMap<CharacteristicIdentity, mpsc::UnboundedSender<Vec<u8>>>,
    connect_reply: Option<ConnectReply>,
    disconnect_replies: Vec<oneshot::Sender<Result<(), BleError>>>,
    events_tx: mpsc::UnboundedSender<PeripheralEvent>,
    /// Held until Ready, then handed to the caller inside the connect result.
    events_rx: Option<mpsc::UnboundedReceiver<PeripheralEvent>>,
    rssi_poll: Option<time::Interval>,
    ended: Arc<AtomicBool>,
}

impl Session {
    pub(crate) fn new(
        address: Address,
        transport: Arc<dyn Transport>,
        connect_reply: ConnectReply,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            address,
            transport,
            state: ConnectionState::Disconnected,
            catalog: None,
            pending: VecDeque::new(),
            in_flight: None,
            subscribers: HashMap::new(),
            connect_reply: Some(connect_reply),
            disconnect_replies: Vec::new(),
            events_tx,
            events_rx: Some(events_rx),
            rssi_poll: None,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the session task and hand back its input channel.
    pub(crate) fn spawn(
        address: Address,
        transport: Arc<dyn Transport>,
        connect_reply: ConnectReply,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self::new(address, transport, connect_reply);
        let ended = session.ended.clone();
        tokio::spawn(session.run(rx));
        SessionHandle { tx, ended }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionInput>) {
        if self.start().await {
            loop {
                // Resolve the wakeup first, then act: the poll future
                // borrows `self.rssi_poll`, the handlers need `&mut self`.
                let input = tokio::select! {
                    maybe = rx.recv() => maybe,
                    _ = Self::rssi_tick(&mut self.rssi_poll) => {
                        if let Err(e) = self.transport.read_rssi(&self.address).await {
                            debug!("{}: rssi poll rejected: {e}", self.address);
                        }
                        continue;
                    }
                };
                match input {
                    Some(input) => self.handle_input(input).await,
                    None => {
                        // Manager gone; release the link and wind down.
                        let _ = self.transport.disconnect(&self.address).await;
                        self.teardown_finish();
                    }
                }
                if self.state == ConnectionState::Disconnected {
                    break;
                }
            }
        }
        // Fail anything still sitting in the inbox so no caller is left
        // waiting on a completion that would otherwise never fire.
        rx.close();
        while let Ok(input) = rx.try_recv() {
            match input {
                SessionInput::Command(cmd) => cmd.fail(BleError::Disconnected),
                SessionInput::Disconnect { reply } => {
                    let _ = reply.send(Ok(()));
                }
                SessionInput::Transport(_) => {}
            }
        }
    }

    async fn rssi_tick(poll: &mut Option<time::Interval>) {
        match poll {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Allocate the link. Returns `false` when the submission itself was
    /// rejected and the session is already finished.
    pub(crate) async fn start(&mut self) -> bool {
        info!("{}: connecting", self.address);
        match self.transport.connect(&self.address).await {
            Ok(()) => {
                self.state = ConnectionState::Connecting;
                true
            }
            Err(e) => {
                warn!("{}: connect submission rejected: {e}", self.address);
                self.ended.store(true, Ordering::SeqCst);
                self.resolve_connect_err(e);
                false
            }
        }
    }

    pub(crate) async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Command(cmd) => {
                if self.state == ConnectionState::Disconnected {
                    cmd.fail(BleError::NotConnected);
                    return;
                }
                debug!(
                    "{}: queueing {} {}",
                    self.address,
                    cmd.kind(),
                    cmd.characteristic
                );
                self.pending.push_back(cmd);
                self.process_queue().await;
            }
            SessionInput::Disconnect { reply } => match self.state {
                ConnectionState::Disconnected => {
                    let _ = reply.send(Ok(()));
                }
                ConnectionState::Disconnecting => {
                    self.disconnect_replies.push(reply);
                }
                _ => {
                    self.disconnect_replies.push(reply);
                    self.begin_disconnect().await;
                }
            },
            SessionInput::Transport(event) => self.handle_transport(event).await,
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LinkEstablished { .. } => {
                if self.state != ConnectionState::Connecting {
                    debug!(
                        "{}: ignoring link-established in {:?}",
                        self.address, self.state
                    );
                    return;
                }
                self.state = ConnectionState::DiscoveringServices;
                info!("{}: link established, discovering services", self.address);
                if let Err(e) = self.transport.discover_services(&self.address).await {
                    warn!(
                        "{}: service discovery request rejected: {e}",
                        self.address
                    );
                    self.resolve_connect_err(e);
                    self.begin_disconnect().await;
                }
            }
            TransportEvent::ServicesDiscovered { result, .. } => {
                if self.state != ConnectionState::DiscoveringServices {
                    debug!(
                        "{}: ignoring service enumeration in {:?}",
                        self.address, self.state
                    );
                    return;
                }
                match result {
                    Ok(catalog) => {
                        info!(
                            "{}: ready, {} service(s) enumerated",
                            self.address,
                            catalog.services.len()
                        );
                        self.catalog = Some(catalog);
                        self.state = ConnectionState::Ready;
                        let mut poll = time::interval(RSSI_POLL_INTERVAL);
                        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        self.rssi_poll = Some(poll);
                        self.resolve_connect_ok();
                        self.process_queue().await;
                    }
                    Err(reason) => {
                        warn!("{}: service enumeration failed: {reason}", self.address);
                        self.resolve_connect_err(BleError::TransportFailed(reason));
                        self.begin_disconnect().await;
                    }
                }
            }
            TransportEvent::CharacteristicRead { result, .. } => match self.in_flight.take() {
                Some(Command {
                    op: CommandOp::Read { reply },
                    ..
                }) => {
                    let _ = reply.send(result.map_err(BleError::TransportFailed));
                    self.process_queue().await;
                }
                other => {
                    self.in_flight = other;
                    debug!("{}: unmatched read completion dropped", self.address);
                }
            },
            TransportEvent::CharacteristicWritten { result, .. } => match self.in_flight.take() {
                Some(Command {
                    op: CommandOp::Write { reply, .. },
                    ..
                }) => {
                    let _ = reply.send(result.map_err(BleError::TransportFailed));
                    self.process_queue().await;
                }
                other => {
                    self.in_flight = other;
                    debug!("{}: unmatched write completion dropped", self.address);
                }
            },
            TransportEvent::DescriptorWritten {
                characteristic,
                result,
                ..
            } => match self.in_flight.take() {
                Some(Command {
                    op: CommandOp::Subscribe { enable, reply, .. },
                    ..
                }) => {
                    match result {
                        Ok(()) => {
                            let _ = reply.send(Ok(()));
                        }
                        Err(reason) => {
                            if enable {
                                self.subscribers.remove(&characteristic);
                            }
                            let _ = reply.send(Err(BleError::TransportFailed(reason)));
                        }
                    }
                    self.process_queue().await;
                }
                other => {
                    self.in_flight = other;
                    debug!("{}: unmatched descriptor completion dropped", self.address);
                }
            },
            TransportEvent::LinkLost { .. } => {
                if self.state != ConnectionState::Disconnected {
                    self.teardown_finish();
                }
            }
            TransportEvent::Rssi { rssi, .. } => {
                if self.state == ConnectionState::Ready {
                    let _ = self.events_tx.send(PeripheralEvent::Rssi(rssi));
                }
            }
            TransportEvent::ValueChanged {
                characteristic,
                value,
                ..
            } => match self.subscribers.get(&characteristic) {
                Some(subscriber) => {
                    let _ = subscriber.send(value);
                }
                None => debug!(
                    "{}: dropping value change for unsubscribed {}#{}",
                    self.address, characteristic.characteristic, characteristic.instance
                ),
            },
            TransportEvent::Discovered { .. } | TransportEvent::ScanFailed { .. } => {
                debug!("{}: scan event routed to a session, dropped", self.address);
            }
        }
    }

    // ── Queue ────────────────────────────────────────────────────────────────

    /// Start the head of the queue whenever the single-flight slot is free.
    /// Commands whose lookup or submission fails resolve on the spot and the
    /// loop moves on, so one bad command never wedges the queue.
    async fn process_queue(&mut self) {
        if self.state != ConnectionState::Ready {
            return;
        }
        while self.in_flight.is_none() {
            let Some(cmd) = self.pending.pop_front() else {
                break;
            };
            self.dispatch(cmd).await;
        }
    }

    async fn dispatch(&mut self, cmd: Command) {
        let found = self
            .catalog
            .as_ref()
            .and_then(|c| c.characteristic(cmd.service, cmd.characteristic))
            .map(|c| {
                (
                    c.identity,
                    c.props,
                    c.has_descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION),
                )
            });
        let Some((identity, props, has_cccd)) = found else {
            let service_missing = self
                .catalog
                .as_ref()
                .map_or(true, |c| c.service(cmd.service).is_none());
            let error = if service_missing {
                BleError::ServiceNotFound(cmd.service)
            } else {
                BleError::CharacteristicNotFound(cmd.characteristic)
            };
            debug!("{}: {} failed lookup: {error}", self.address, cmd.kind());
            cmd.fail(error);
            return;
        };

        let Command {
            service,
            characteristic,
            op,
        } = cmd;
        match op {
            CommandOp::Read { reply } => {
                debug!("{}: read {}", self.address, characteristic);
                match self.transport.read_characteristic(&self.address, &identity).await {
                    Ok(()) => {
                        self.in_flight = Some(Command {
                            service,
                            characteristic,
                            op: CommandOp::Read { reply },
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            CommandOp::Write {
                payload,
                mode,
                reply,
            } => {
                debug!(
                    "{}: write {} ({} bytes, {mode:?})",
                    self.address,
                    characteristic,
                    payload.len()
                );
                match self
                    .transport
                    .write_characteristic(&self.address, &identity, &payload, mode)
                    .await
                {
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                    Ok(()) if mode == WriteMode::WithoutResponse => {
                        // Submission is the completion; the slot stays free.
                        let _ = reply.send(Ok(()));
                    }
                    Ok(()) => {
                        self.in_flight = Some(Command {
                            service,
                            characteristic,
                            op: CommandOp::Write {
                                payload,
                                mode,
                                reply,
                            },
                        });
                    }
                }
            }
            CommandOp::Subscribe {
                enable,
                mut subscriber,
                reply,
            } => {
                if !props.notify && !props.indicate {
                    let _ = reply.send(Err(BleError::Unsupported));
                    return;
                }
                if !has_cccd {
                    let _ = reply.send(Err(BleError::DescriptorNotFound(
                        CLIENT_CHARACTERISTIC_CONFIGURATION,
                    )));
                    return;
                }
                // Notify wins when the characteristic offers both modes.
                let value = if !enable {
                    DISABLE_NOTIFICATION_VALUE
                } else if props.notify {
                    ENABLE_NOTIFICATION_VALUE
                } else {
                    ENABLE_INDICATION_VALUE
                };
                // Register before the descriptor write: a peripheral may
                // start pushing values the instant the CCCD hits the table.
                if enable {
                    if let Some(tx) = subscriber.take() {
                        self.subscribers.insert(identity, tx);
                    }
                } else {
                    self.subscribers.remove(&identity);
                }
                debug!(
                    "{}: {} {} ({:02x?})",
                    self.address,
                    if enable { "subscribe" } else { "unsubscribe" },
                    characteristic,
                    value
                );
                if let Err(e) = self.transport.set_notify(&self.address, &identity, enable).await {
                    if enable {
                        self.subscribers.remove(&identity);
                    }
                    let _ = reply.send(Err(e));
                    return;
                }
                match self
                    .transport
                    .write_descriptor(
                        &self.address,
                        &identity,
                        CLIENT_CHARACTERISTIC_CONFIGURATION,
                        &value,
                    )
                    .await
                {
                    Ok(()) => {
                        self.in_flight = Some(Command {
                            service,
                            characteristic,
                            op: CommandOp::Subscribe {
                                enable,
                                subscriber: None,
                                reply,
                            },
                        });
                    }
                    Err(e) => {
                        if enable {
                            self.subscribers.remove(&identity);
                        }
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Caller-initiated teardown. Drains the queue up front, then either
    /// requests a graceful release (completing on the transport's
    /// confirmation) or finishes immediately when the transport no longer
    /// holds the link.
    async fn begin_disconnect(&mut self) {
        self.rssi_poll = None;
        self.resolve_connect_err(BleError::Disconnected);
        self.fail_all(BleError::Disconnected);
        if self.transport.is_connected(&self.address).await {
            match self.transport.disconnect(&self.address).await {
                Ok(()) => {
                    self.state = ConnectionState::Disconnecting;
                    return;
                }
                Err(e) => {
                    warn!("{}: disconnect submission rejected: {e}", self.address);
                }
            }
        } else if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::DiscoveringServices
        ) {
            // Cancel a link allocation that never completed.
            let _ = self.transport.disconnect(&self.address).await;
        }
        self.teardown_finish();
    }

    /// Terminal transition. Every outstanding completion resolves here,
    /// exactly once, before the session reports itself finished.
    fn teardown_finish(&mut self) {
        self.ended.store(true, Ordering::SeqCst);
        self.rssi_poll = None;
        self.resolve_connect_err(BleError::Disconnected);
        self.fail_all(BleError::Disconnected);
        self.subscribers.clear();
        let _ = self.events_tx.send(PeripheralEvent::Disconnected);
        for reply in self.disconnect_replies.drain(..) {
            let _ = reply.send(Ok(()));
        }
        self.state = ConnectionState::Disconnected;
        info!("{}: disconnected", self.address);
    }

    fn fail_all(&mut self, error: BleError) {
        if let Some(cmd) = self.in_flight.take() {
            cmd.fail(error.clone());
        }
        for cmd in self.pending.drain(..) {
            cmd.fail(error.clone());
        }
    }

    fn resolve_connect_ok(&mut self) {
        if let (Some(reply), Some(events)) = (self.connect_reply.take(), self.events_rx.take()) {
            let catalog = self.catalog.clone().unwrap_or_default();
            let _ = reply.send(Ok((catalog, events)));
        }
    }

    fn resolve_connect_err(&mut self, error: BleError) {
        if let Some(reply) = self.connect_reply.take() {
            let _ = reply.send(Err(error));
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adv::uuid16;
    use crate::transport::fake::{FakeCall, FakeMethod, FakeTransport};
    use crate::types::{CharacteristicInfo, CharacteristicProps, ServiceInfo};

    const SERVICE: u16 = 0x180d;
    const CHAR_MEASURE: u16 = 0x2a37; // notify + indicate, with CCCD
    const CHAR_CONTROL: u16 = 0x2a39; // read + write
    const CHAR_INDICATE: u16 = 0x2a05; // indicate only, with CCCD
    const CHAR_BARE: u16 = 0x2a38; // read only, no CCCD
    const CHAR_NO_CCCD: u16 = 0x2a3a; // notify but missing CCCD

    fn addr() -> Address {
        Address::from("AA:BB:CC:DD:EE:FF")
    }

    fn catalog() -> ServiceCatalog {
        let service = uuid16(SERVICE);
        let cccd = vec![CLIENT_CHARACTERISTIC_CONFIGURATION];
        ServiceCatalog::new(vec![ServiceInfo {
            uuid: service,
            characteristics: vec![
                CharacteristicInfo::new(
                    service,
                    uuid16(CHAR_MEASURE),
                    0,
                    CharacteristicProps {
                        notify: true,
                        indicate: true,
                        ..Default::default()
                    },
                    cccd.clone(),
                ),
                CharacteristicInfo::new(
                    service,
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
                CharacteristicInfo::new(
                    service,
                    uuid16(CHAR_INDICATE),
                    0,
                    CharacteristicProps {
                        indicate: true,
                        ..Default::default()
                    },
                    cccd.clone(),
                ),
                CharacteristicInfo::new(
                    service,
                    uuid16(CHAR_BARE),
                    0,
                    CharacteristicProps {
                        read: true,
                        ..Default::default()
                    },
                    vec![],
                ),
                CharacteristicInfo::new(
                    service,
                    uuid16(CHAR_NO_CCCD),
                    0,
                    CharacteristicProps {
                        notify: true,
                        ..Default::default()
                    },
                    vec![],
                ),
            ],
        }])
    }

    fn identity(characteristic: u16) -> CharacteristicIdentity {
        CharacteristicIdentity {
            service: uuid16(SERVICE),
            characteristic: uuid16(characteristic),
            instance: 0,
        }
    }

    fn read_cmd(characteristic: u16) -> (Command, oneshot::Receiver<Result<Vec<u8>, BleError>>) {
        let (reply, rx) = oneshot::channel();
        (
            Command {
                service: uuid16(SERVICE),
                characteristic: uuid16(characteristic),
                op: CommandOp::Read { reply },
            },
            rx,
        )
    }

    fn write_cmd(
        characteristic: u16,
        payload: &[u8],
        mode: WriteMode,
    ) -> (Command, oneshot::Receiver<Result<(), BleError>>) {
        let (reply, rx) = oneshot::channel();
        (
            Command {
                service: uuid16(SERVICE),
                characteristic: uuid16(characteristic),
                op: CommandOp::Write {
                    payload: payload.to_vec(),
                    mode,
                    reply,
                },
            },
            rx,
        )
    }

    fn subscribe_cmd(
        characteristic: u16,
        enable: bool,
    ) -> (
        Command,
        oneshot::Receiver<Result<(), BleError>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (reply, rx) = oneshot::channel();
        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        (
            Command {
                service: uuid16(SERVICE),
                characteristic: uuid16(characteristic),
                op: CommandOp::Subscribe {
                    enable,
                    subscriber: enable.then_some(sub_tx),
                    reply,
                },
            },
            rx,
            sub_rx,
        )
    }

    async fn feed(session: &mut Session, event: TransportEvent) {
        session.handle_input(SessionInput::Transport(event)).await;
    }

    /// Drive a fresh session to Ready with the standard catalog.
    async fn ready_session(
        transport: &Arc<FakeTransport>,
    ) -> (Session, mpsc::UnboundedReceiver<PeripheralEvent>) {
        let (reply, reply_rx) = oneshot::channel();
        let mut session = Session::new(addr(), transport.clone(), reply);
        assert!(session.start().await);
        transport.set_connected(&addr(), true);
        feed(&mut session, TransportEvent::LinkEstablished { address: addr() }).await;
        feed(
            &mut session,
            TransportEvent::ServicesDiscovered {
                address: addr(),
                result: Ok(catalog()),
            },
        )
        .await;
        let (resolved, events) = reply_rx.await.unwrap().unwrap();
        assert_eq!(resolved, catalog());
        assert_eq!(session.state, ConnectionState::Ready);
        (session, events)
    }

    #[tokio::test]
    async fn connect_resolves_catalog_when_ready() {
        let (transport, _events) = FakeTransport::new();
        let (session, _) = ready_session(&transport).await;
        let calls = transport.calls();
        assert!(calls.contains(&FakeCall::Connect { address: addr() }));
        assert!(calls.contains(&FakeCall::DiscoverServices { address: addr() }));
        assert!(session.in_flight.is_none());
    }

    #[tokio::test]
    async fn connect_submission_rejected_resolves_error() {
        let (transport, _events) = FakeTransport::new();
        transport.reject_next(
            FakeMethod::Connect,
            BleError::TransportRejected("adapter busy".into()),
        );
        let (reply, reply_rx) = oneshot::channel();
        let mut session = Session::new(addr(), transport.clone(), reply);
        assert!(!session.start().await);
        match reply_rx.await.unwrap() {
            Err(e) => assert_eq!(e, BleError::TransportRejected("adapter busy".into())),
            Ok(_) => panic!("expected connect error"),
        }
    }

    #[tokio::test]
    async fn discovery_request_rejection_tears_down() {
        let (transport, _events) = FakeTransport::new();
        transport.reject_next(
            FakeMethod::DiscoverServices,
            BleError::TransportRejected("gatt gone".into()),
        );
        let (reply, reply_rx) = oneshot::channel();
        let mut session = Session::new(addr(), transport.clone(), reply);
        assert!(session.start().await);
        transport.set_connected(&addr(), true);
        feed(&mut session, TransportEvent::LinkEstablished { address: addr() }).await;
        match reply_rx.await.unwrap() {
            Err(e) => assert_eq!(e, BleError::TransportRejected("gatt gone".into())),
            Ok(_) => panic!("expected connect error"),
        }
        // Link was up, so teardown goes through a graceful release.
        assert_eq!(session.state, ConnectionState::Disconnecting);
        assert!(transport
            .calls()
            .contains(&FakeCall::Disconnect { address: addr() }));
        transport.set_connected(&addr(), false);
        feed(&mut session, TransportEvent::LinkLost { address: addr() }).await;
        assert_eq!(session.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn enumeration_failure_resolves_connect_error() {
        let (transport, _events) = FakeTransport::new();
        let (reply, reply_rx) = oneshot::channel();
        let mut session = Session::new(addr(), transport.clone(), reply);
        assert!(session.start().await);
        transport.set_connected(&addr(), true);
        feed(&mut session, TransportEvent::LinkEstablished { address: addr() }).await;
        feed(
            &mut session,
            TransportEvent::ServicesDiscovered {
                address: addr(),
                result: Err("status 129".into()),
            },
        )
        .await;
        match reply_rx.await.unwrap() {
            Err(e) => assert_eq!(e, BleError::TransportFailed("status 129".into())),
            Ok(_) => panic!("expected connect error"),
        }
        assert_eq!(session.state, ConnectionState::Disconnecting);
        transport.set_connected(&addr(), false);
        feed(&mut session, TransportEvent::LinkLost { address: addr() }).await;
        assert_eq!(session.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn link_loss_while_connecting_fails_connect() {
        let (transport, _events) = FakeTransport::new();
        let (reply, reply_rx) = oneshot::channel();
        let mut session = Session::new(addr(), transport.clone(), reply);
        assert!(session.start().await);
        feed(&mut session, TransportEvent::LinkLost { address: addr() }).await;
        match reply_rx.await.unwrap() {
            Err(e) => assert_eq!(e, BleError::Disconnected),
            Ok(_) => panic!("expected connect error"),
        }
        assert_eq!(session.state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn commands_complete_in_fifo_order() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;
        transport.take_calls();

        let (c1, mut r1) = read_cmd(CHAR_CONTROL);
        let (c2, mut r2) = read_cmd(CHAR_CONTROL);
        let (c3, mut r3) = read_cmd(CHAR_CONTROL);
        session.handle_input(SessionInput::Command(c1)).await;
        session.handle_input(SessionInput::Command(c2)).await;
        session.handle_input(SessionInput::Command(c3)).await;

        // Single flight: only the head was submitted.
        assert_eq!(
            transport
                .calls()
                .iter()
                .filter(|c| matches!(c, FakeCall::ReadCharacteristic { .. }))
                .count(),
            1
        );
        assert!(r2.try_recv().is_err());

        for (n, rx) in [&mut r1, &mut r2, &mut r3].into_iter().enumerate() {
            feed(
                &mut session,
                TransportEvent::CharacteristicRead {
                    address: addr(),
                    characteristic: identity(CHAR_CONTROL),
                    result: Ok(vec![n as u8]),
                },
            )
            .await;
            assert_eq!(rx.try_recv().unwrap(), Ok(vec![n as u8]));
        }
        assert!(session.in_flight.is_none());
        assert!(session.pending.is_empty());
    }

    #[tokio::test]
    async fn command_enqueued_before_ready_runs_at_ready() {
        let (transport, _events) = FakeTransport::new();
        let (reply, reply_rx) = oneshot::channel();
        let mut session = Session::new(addr(), transport.clone(), reply);
        assert!(session.start().await);

        let (cmd, mut rx) = read_cmd(CHAR_CONTROL);
        session.handle_input(SessionInput::Command(cmd)).await;
        assert!(!transport
            .calls()
            .iter()
            .any(|c| matches!(c, FakeCall::ReadCharacteristic { .. })));
        assert!(rx.try_recv().is_err());

        transport.set_connected(&addr(), true);
        feed(&mut session, TransportEvent::LinkEstablished { address: addr() }).await;
        feed(
            &mut session,
            TransportEvent::ServicesDiscovered {
                address: addr(),
                result: Ok(catalog()),
            },
        )
        .await;
        let _ = reply_rx.await.unwrap().unwrap();
        assert!(transport
            .calls()
            .iter()
            .any(|c| matches!(c, FakeCall::ReadCharacteristic { .. })));
    }

    #[tokio::test]
    async fn command_fails_disconnected_when_never_ready() {
        let (transport, _events) = FakeTransport::new();
        let (reply, reply_rx) = oneshot::channel();
        let mut session = Session::new(addr(), transport.clone(), reply);
        assert!(session.start().await);

        let (cmd, rx) = read_cmd(CHAR_CONTROL);
        session.handle_input(SessionInput::Command(cmd)).await;
        feed(&mut session, TransportEvent::LinkLost { address: addr() }).await;

        match reply_rx.await.unwrap() {
            Err(e) => assert_eq!(e, BleError::Disconnected),
            Ok(_) => panic!("expected connect error"),
        }
        assert_eq!(rx.await.unwrap(), Err(BleError::Disconnected));
    }

    #[tokio::test]
    async fn forced_disconnect_drains_queue_and_subscribers() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, mut events) = ready_session(&transport).await;

        // Install a subscription first.
        let (sub, mut sub_reply, _values) = subscribe_cmd(CHAR_MEASURE, true);
        session.handle_input(SessionInput::Command(sub)).await;
        feed(
            &mut session,
            TransportEvent::DescriptorWritten {
                address: addr(),
                characteristic: identity(CHAR_MEASURE),
                result: Ok(()),
            },
        )
        .await;
        assert_eq!(sub_reply.try_recv().unwrap(), Ok(()));
        assert_eq!(session.subscribers.len(), 1);

        // One command in flight, two queued behind it.
        let (c1, r1) = read_cmd(CHAR_CONTROL);
        let (c2, r2) = read_cmd(CHAR_CONTROL);
        let (c3, r3) = write_cmd(CHAR_CONTROL, b"x", WriteMode::WithResponse);
        session.handle_input(SessionInput::Command(c1)).await;
        session.handle_input(SessionInput::Command(c2)).await;
        session.handle_input(SessionInput::Command(c3)).await;
        assert!(session.in_flight.is_some());
        assert_eq!(session.pending.len(), 2);

        let (reply, mut reply_rx) = oneshot::channel();
        session
            .handle_input(SessionInput::Disconnect { reply })
            .await;
        assert_eq!(session.state, ConnectionState::Disconnecting);
        assert_eq!(r1.await.unwrap(), Err(BleError::Disconnected));
        assert_eq!(r2.await.unwrap(), Err(BleError::Disconnected));
        assert_eq!(r3.await.unwrap(), Err(BleError::Disconnected));
        assert!(reply_rx.try_recv().is_err());

        transport.set_connected(&addr(), false);
        feed(&mut session, TransportEvent::LinkLost { address: addr() }).await;
        assert_eq!(session.state, ConnectionState::Disconnected);
        assert!(session.subscribers.is_empty());
        assert_eq!(reply_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(events.try_recv().unwrap(), PeripheralEvent::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_requests_coalesce_and_repeat_is_noop() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;

        let (first, mut first_rx) = oneshot::channel();
        let (second, mut second_rx) = oneshot::channel();
        session
            .handle_input(SessionInput::Disconnect { reply: first })
            .await;
        session
            .handle_input(SessionInput::Disconnect { reply: second })
            .await;
        assert!(first_rx.try_recv().is_err());

        transport.set_connected(&addr(), false);
        feed(&mut session, TransportEvent::LinkLost { address: addr() }).await;
        assert_eq!(first_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(second_rx.try_recv().unwrap(), Ok(()));

        // Already disconnected: immediate no-op success.
        let (third, mut third_rx) = oneshot::channel();
        session
            .handle_input(SessionInput::Disconnect { reply: third })
            .await;
        assert_eq!(third_rx.try_recv().unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn unacknowledged_write_frees_the_slot_on_submission() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;
        transport.take_calls();

        let (w, mut w_rx) = write_cmd(CHAR_CONTROL, b"ping", WriteMode::WithoutResponse);
        let (r, _r_rx) = read_cmd(CHAR_CONTROL);
        session.handle_input(SessionInput::Command(w)).await;
        assert_eq!(w_rx.try_recv().unwrap(), Ok(()));
        assert!(session.in_flight.is_none());

        // The read dispatches immediately, with no write completion needed.
        session.handle_input(SessionInput::Command(r)).await;
        assert!(transport
            .calls()
            .iter()
            .any(|c| matches!(c, FakeCall::ReadCharacteristic { .. })));
    }

    #[tokio::test]
    async fn acknowledged_write_blocks_the_next_command() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;
        transport.take_calls();

        let (w, mut w_rx) = write_cmd(CHAR_CONTROL, b"ping", WriteMode::WithResponse);
        let (r, mut r_rx) = read_cmd(CHAR_CONTROL);
        session.handle_input(SessionInput::Command(w)).await;
        session.handle_input(SessionInput::Command(r)).await;
        assert!(w_rx.try_recv().is_err());
        assert!(!transport
            .calls()
            .iter()
            .any(|c| matches!(c, FakeCall::ReadCharacteristic { .. })));

        feed(
            &mut session,
            TransportEvent::CharacteristicWritten {
                address: addr(),
                characteristic: identity(CHAR_CONTROL),
                result: Ok(()),
            },
        )
        .await;
        assert_eq!(w_rx.try_recv().unwrap(), Ok(()));
        assert!(transport
            .calls()
            .iter()
            .any(|c| matches!(c, FakeCall::ReadCharacteristic { .. })));

        feed(
            &mut session,
            TransportEvent::CharacteristicRead {
                address: addr(),
                characteristic: identity(CHAR_CONTROL),
                result: Ok(vec![7]),
            },
        )
        .await;
        assert_eq!(r_rx.try_recv().unwrap(), Ok(vec![7]));
    }

    #[tokio::test]
    async fn failed_lookup_resolves_locally_and_queue_continues() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;
        transport.take_calls();

        let (bad, bad_rx) = read_cmd(0x2aff);
        let (good, mut good_rx) = read_cmd(CHAR_CONTROL);
        session.handle_input(SessionInput::Command(bad)).await;
        session.handle_input(SessionInput::Command(good)).await;

        assert_eq!(
            bad_rx.await.unwrap(),
            Err(BleError::CharacteristicNotFound(uuid16(0x2aff)))
        );
        feed(
            &mut session,
            TransportEvent::CharacteristicRead {
                address: addr(),
                characteristic: identity(CHAR_CONTROL),
                result: Ok(vec![1]),
            },
        )
        .await;
        assert_eq!(good_rx.try_recv().unwrap(), Ok(vec![1]));
    }

    #[tokio::test]
    async fn unknown_service_reports_service_not_found() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;

        let (reply, rx) = oneshot::channel();
        let cmd = Command {
            service: uuid16(0x1801),
            characteristic: uuid16(CHAR_CONTROL),
            op: CommandOp::Read { reply },
        };
        session.handle_input(SessionInput::Command(cmd)).await;
        assert_eq!(
            rx.await.unwrap(),
            Err(BleError::ServiceNotFound(uuid16(0x1801)))
        );
    }

    #[tokio::test]
    async fn subscribe_prefers_notify_over_indicate() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;
        transport.take_calls();

        let (cmd, mut reply, mut values) = subscribe_cmd(CHAR_MEASURE, true);
        session.handle_input(SessionInput::Command(cmd)).await;

        let calls = transport.calls();
        assert!(calls.contains(&FakeCall::SetNotify {
            address: addr(),
            characteristic: identity(CHAR_MEASURE),
            enable: true,
        }));
        assert!(calls.contains(&FakeCall::WriteDescriptor {
            address: addr(),
            characteristic: identity(CHAR_MEASURE),
            descriptor: CLIENT_CHARACTERISTIC_CONFIGURATION,
            value: ENABLE_NOTIFICATION_VALUE.to_vec(),
        }));

        feed(
            &mut session,
            TransportEvent::DescriptorWritten {
                address: addr(),
                characteristic: identity(CHAR_MEASURE),
                result: Ok(()),
            },
        )
        .await;
        assert_eq!(reply.try_recv().unwrap(), Ok(()));

        feed(
            &mut session,
            TransportEvent::ValueChanged {
                address: addr(),
                characteristic: identity(CHAR_MEASURE),
                value: vec![0x16, 60],
            },
        )
        .await;
        assert_eq!(values.try_recv().unwrap(), vec![0x16, 60]);
    }

    #[tokio::test]
    async fn subscribe_indicate_only_uses_indication_value() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;
        transport.take_calls();

        let (cmd, _reply, _values) = subscribe_cmd(CHAR_INDICATE, true);
        session.handle_input(SessionInput::Command(cmd)).await;
        assert!(transport.calls().contains(&FakeCall::WriteDescriptor {
            address: addr(),
            characteristic: identity(CHAR_INDICATE),
            descriptor: CLIENT_CHARACTERISTIC_CONFIGURATION,
            value: ENABLE_INDICATION_VALUE.to_vec(),
        }));
    }

    #[tokio::test]
    async fn subscribe_without_capability_never_touches_the_transport() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;
        transport.take_calls();

        let (cmd, reply, _values) = subscribe_cmd(CHAR_BARE, true);
        session.handle_input(SessionInput::Command(cmd)).await;
        assert_eq!(reply.await.unwrap(), Err(BleError::Unsupported));
        assert!(transport.calls().is_empty());
        assert!(session.in_flight.is_none());
    }

    #[tokio::test]
    async fn subscribe_missing_cccd_fails_with_descriptor_not_found() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;

        let (cmd, reply, _values) = subscribe_cmd(CHAR_NO_CCCD, true);
        session.handle_input(SessionInput::Command(cmd)).await;
        assert_eq!(
            reply.await.unwrap(),
            Err(BleError::DescriptorNotFound(
                CLIENT_CHARACTERISTIC_CONFIGURATION
            ))
        );
    }

    #[tokio::test]
    async fn subscribe_rolls_back_registration_on_descriptor_failure() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;

        let (cmd, reply, mut values) = subscribe_cmd(CHAR_MEASURE, true);
        session.handle_input(SessionInput::Command(cmd)).await;
        feed(
            &mut session,
            TransportEvent::DescriptorWritten {
                address: addr(),
                characteristic: identity(CHAR_MEASURE),
                result: Err("write rejected".into()),
            },
        )
        .await;
        assert_eq!(
            reply.await.unwrap(),
            Err(BleError::TransportFailed("write rejected".into()))
        );
        assert!(session.subscribers.is_empty());

        feed(
            &mut session,
            TransportEvent::ValueChanged {
                address: addr(),
                characteristic: identity(CHAR_MEASURE),
                value: vec![1],
            },
        )
        .await;
        assert!(values.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_writes_disable_and_removes_registration() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;

        let (sub, mut sub_reply, mut values) = subscribe_cmd(CHAR_MEASURE, true);
        session.handle_input(SessionInput::Command(sub)).await;
        feed(
            &mut session,
            TransportEvent::DescriptorWritten {
                address: addr(),
                characteristic: identity(CHAR_MEASURE),
                result: Ok(()),
            },
        )
        .await;
        assert_eq!(sub_reply.try_recv().unwrap(), Ok(()));
        transport.take_calls();

        let (unsub, mut unsub_reply, _ignored) = subscribe_cmd(CHAR_MEASURE, false);
        session.handle_input(SessionInput::Command(unsub)).await;
        assert!(transport.calls().contains(&FakeCall::WriteDescriptor {
            address: addr(),
            characteristic: identity(CHAR_MEASURE),
            descriptor: CLIENT_CHARACTERISTIC_CONFIGURATION,
            value: DISABLE_NOTIFICATION_VALUE.to_vec(),
        }));
        feed(
            &mut session,
            TransportEvent::DescriptorWritten {
                address: addr(),
                characteristic: identity(CHAR_MEASURE),
                result: Ok(()),
            },
        )
        .await;
        assert_eq!(unsub_reply.try_recv().unwrap(), Ok(()));

        feed(
            &mut session,
            TransportEvent::ValueChanged {
                address: addr(),
                characteristic: identity(CHAR_MEASURE),
                value: vec![9],
            },
        )
        .await;
        assert!(values.try_recv().is_err());
    }

    #[tokio::test]
    async fn notifications_route_by_full_identity() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;

        let (sub, _reply, mut values) = subscribe_cmd(CHAR_MEASURE, true);
        session.handle_input(SessionInput::Command(sub)).await;
        feed(
            &mut session,
            TransportEvent::DescriptorWritten {
                address: addr(),
                characteristic: identity(CHAR_MEASURE),
                result: Ok(()),
            },
        )
        .await;

        // Same UUIDs, different instance: silently dropped.
        let other_instance = CharacteristicIdentity {
            instance: 1,
            ..identity(CHAR_MEASURE)
        };
        feed(
            &mut session,
            TransportEvent::ValueChanged {
                address: addr(),
                characteristic: other_instance,
                value: vec![1],
            },
        )
        .await;
        assert!(values.try_recv().is_err());

        feed(
            &mut session,
            TransportEvent::ValueChanged {
                address: addr(),
                characteristic: identity(CHAR_MEASURE),
                value: vec![2],
            },
        )
        .await;
        assert_eq!(values.try_recv().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn rssi_updates_forwarded_only_when_ready() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, mut events) = ready_session(&transport).await;

        feed(
            &mut session,
            TransportEvent::Rssi {
                address: addr(),
                rssi: -61,
            },
        )
        .await;
        assert_eq!(events.try_recv().unwrap(), PeripheralEvent::Rssi(-61));

        transport.set_connected(&addr(), false);
        feed(&mut session, TransportEvent::LinkLost { address: addr() }).await;
        assert_eq!(events.try_recv().unwrap(), PeripheralEvent::Disconnected);
        feed(
            &mut session,
            TransportEvent::Rssi {
                address: addr(),
                rssi: -70,
            },
        )
        .await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn stray_completion_without_in_flight_is_ignored() {
        let (transport, _events) = FakeTransport::new();
        let (mut session, _) = ready_session(&transport).await;
        feed(
            &mut session,
            TransportEvent::CharacteristicRead {
                address: addr(),
                characteristic: identity(CHAR_CONTROL),
                result: Ok(vec![1, 2, 3]),
            },
        )
        .await;
        assert!(session.in_flight.is_none());
        assert_eq!(session.state, ConnectionState::Ready);
    }
}
