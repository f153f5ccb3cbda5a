//! Discovery control.
//!
//! One controller abstracts both kinds of platform scanner behind a single
//! interface. Stacks with trustworthy native filtering get the caller's
//! service filter passed straight through; everything else runs an
//! unfiltered scan that is filtered in software against the identifiers the
//! advertisement parser extracts — and restarted on a fixed interval,
//! because long-running unfiltered scans go stale on several stacks. The
//! restart is invisible to the caller: the discovery stream stays open.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::adv;
use crate::error::BleError;
use crate::transport::Transport;
use crate::types::{DiscoveryEvent, PeripheralInfo};

/// How often a software-filtered scan is stopped and restarted underneath
/// the caller.
pub(crate) const RESCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Internal scan timers, surfaced to the manager's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanTimer {
    /// The caller-requested bounded duration elapsed.
    DurationElapsed,
    /// Time for a filter-staleness restart.
    Rescan,
}

pub(crate) struct ScanController {
    active: bool,
    filter: Vec<Uuid>,
    software_filter: bool,
    subscriber: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
    deadline: Option<Instant>,
    rescan_at: Option<Instant>,
}

impl ScanController {
    pub(crate) fn new() -> Self {
        Self {
            active: false,
            filter: Vec::new(),
            software_filter: false,
            subscriber: None,
            deadline: None,
            rescan_at: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    /// Start (or restart) discovery and hand back the event stream.
    pub(crate) async fn start(
        &mut self,
        transport: &Arc<dyn Transport>,
        filter: Vec<Uuid>,
        duration: Option<Duration>,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, BleError> {
        if self.active {
            // Restarting replaces the previous stream.
            let _ = transport.stop_scan().await;
            self.reset();
        }
        self.software_filter = !transport.supports_native_filtering();
        let native_filter: &[Uuid] = if self.software_filter { &[] } else { &filter };
        transport
            .start_scan(native_filter)
            .await
            .map_err(|e| BleError::ScanFailed(e.to_string()))?;

        info!(
            "scan started ({} filter UUID(s), {})",
            filter.len(),
            if self.software_filter {
                "software filtering"
            } else {
                "native filtering"
            }
        );
        self.active = true;
        self.filter = filter;
        self.deadline = duration.map(|d| Instant::now() + d);
        self.rescan_at = self
            .software_filter
            .then(|| Instant::now() + RESCAN_INTERVAL);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        Ok(rx)
    }

    /// Stop discovery and close the stream. Idempotent.
    pub(crate) async fn stop(&mut self, transport: &Arc<dyn Transport>) {
        if self.active {
            if let Err(e) = transport.stop_scan().await {
                warn!("stop scan rejected: {e}");
            }
            info!("scan stopped");
        }
        self.reset();
    }

    /// The underlying discovery mechanism died: terminate the stream with an
    /// error. No further events until a new start.
    pub(crate) fn fail(&mut self, reason: String) {
        warn!("scan failed: {reason}");
        if let Some(subscriber) = self.subscriber.take() {
            let _ = subscriber.send(DiscoveryEvent::Failed(BleError::ScanFailed(reason)));
        }
        self.reset();
    }

    /// Whether an advertisement passes the caller's filter. Native-filtered
    /// scans are pre-filtered by the stack; an empty filter reports all.
    pub(crate) fn accepts(&self, advertisement: &[u8]) -> bool {
        if !self.software_filter || self.filter.is_empty() {
            return true;
        }
        let advertised = adv::advertised_services(advertisement);
        self.filter.iter().any(|uuid| advertised.contains(uuid))
    }

    /// Forward a discovery event to the caller, if anyone is still listening.
    pub(crate) fn emit(&mut self, info: PeripheralInfo) {
        if let Some(subscriber) = &self.subscriber {
            if subscriber.send(DiscoveryEvent::Discovered(info)).is_err() {
                // Receiver dropped; keep scanning (the registry still
                // updates) but stop pushing.
                self.subscriber = None;
            }
        }
    }

    /// Sleep until the next internal timer fires; pends forever when no
    /// timer is armed.
    pub(crate) async fn tick(&self) -> ScanTimer {
        let timer = match (self.deadline, self.rescan_at) {
            (Some(deadline), Some(rescan)) if deadline <= rescan => {
                (deadline, ScanTimer::DurationElapsed)
            }
            (_, Some(rescan)) => (rescan, ScanTimer::Rescan),
            (Some(deadline), None) => (deadline, ScanTimer::DurationElapsed),
            (None, None) => return std::future::pending().await,
        };
        sleep_until(timer.0).await;
        timer.1
    }

    /// Handle a fired timer.
    pub(crate) async fn handle_timer(&mut self, transport: &Arc<dyn Transport>, timer: ScanTimer) {
        if !self.active {
            return;
        }
        match timer {
            ScanTimer::DurationElapsed => {
                debug!("scan duration elapsed");
                self.stop(transport).await;
            }
            ScanTimer::Rescan => {
                // Bounce the platform scan to flush stale filter state. The
                // caller's stream is untouched.
                debug!("restarting scan to refresh stale filter state");
                let _ = transport.stop_scan().await;
                if let Err(e) = transport.start_scan(&[]).await {
                    self.fail(e.to_string());
                    return;
                }
                self.rescan_at = Some(Instant::now() + RESCAN_INTERVAL);
            }
        }
    }

    fn reset(&mut self) {
        self.active = false;
        self.filter.clear();
        self.software_filter = false;
        self.subscriber = None;
        self.deadline = None;
        self.rescan_at = None;
    }
}
