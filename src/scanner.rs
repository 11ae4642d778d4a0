use crate::error::{DiscoveryError, Result};
use crate::netdetect::{resolve_subnet, LocalAddrSource, Resolver, SubnetPrefix, COMMON_SUBNETS};
use crate::probe::{HttpProbe, Identity, Probe, AVAILABILITY_TIMEOUT, SCAN_PROBE_TIMEOUT};
use crate::types::{DeviceRecord, ScanEvent};
use crate::validate::DEFAULT_PORT;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

/// Tuning for one sweep.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Max probes in flight at once.
    pub concurrency: usize,
    pub port: u16,
    pub probe_timeout: Duration,
    /// Swept after the resolved subnet, duplicates of it are skipped.
    pub extra_subnets: Vec<SubnetPrefix>,
}

impl ScanConfig {
    /// Resolved subnet only, 20 probes at a time, 2s each.
    pub fn thorough() -> Self {
        Self {
            concurrency: 20,
            port: DEFAULT_PORT,
            probe_timeout: SCAN_PROBE_TIMEOUT,
            extra_subnets: Vec::new(),
        }
    }

    /// Wider and shorter: 30 at a time, 1s each, and the two most common
    /// home subnets on top of the resolved one.
    pub fn quick() -> Self {
        Self {
            concurrency: 30,
            port: DEFAULT_PORT,
            probe_timeout: Duration::from_secs(1),
            extra_subnets: COMMON_SUBNETS.to_vec(),
        }
    }

    /// Ordered, deduplicated list of subnets to sweep.
    pub fn plan(&self, resolved: SubnetPrefix) -> Vec<SubnetPrefix> {
        let mut out = vec![resolved];
        for s in &self.extra_subnets {
            if !out.contains(s) {
                out.push(*s);
            }
        }
        out
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::thorough()
    }
}

/// Receives scan events as plain callbacks. Every method defaults to a no-op.
pub trait ScanObserver {
    /// Called right before the probe for `ip` goes out.
    fn on_ip_scanned(&mut self, _ip: Ipv4Addr) {}
    fn on_device_found(&mut self, _record: &DeviceRecord) {}
    /// `fraction` is settled / total, never decreasing.
    fn on_progress(&mut self, _fraction: f64) {}
}

impl ScanObserver for () {}

/// Closure-based observer; any hook may be left unset.
#[derive(Default)]
pub struct Callbacks<'a> {
    device_found: Option<Box<dyn FnMut(&DeviceRecord) + Send + 'a>>,
    progress: Option<Box<dyn FnMut(f64) + Send + 'a>>,
    ip_scanned: Option<Box<dyn FnMut(Ipv4Addr) + Send + 'a>>,
}

impl<'a> Callbacks<'a> {
    pub fn on_device_found(mut self, f: impl FnMut(&DeviceRecord) + Send + 'a) -> Self {
        self.device_found = Some(Box::new(f));
        self
    }

    pub fn on_progress(mut self, f: impl FnMut(f64) + Send + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn on_ip_scanned(mut self, f: impl FnMut(Ipv4Addr) + Send + 'a) -> Self {
        self.ip_scanned = Some(Box::new(f));
        self
    }
}

impl ScanObserver for Callbacks<'_> {
    fn on_ip_scanned(&mut self, ip: Ipv4Addr) {
        if let Some(f) = self.ip_scanned.as_mut() {
            f(ip)
        }
    }

    fn on_device_found(&mut self, record: &DeviceRecord) {
        if let Some(f) = self.device_found.as_mut() {
            f(record)
        }
    }

    fn on_progress(&mut self, fraction: f64) {
        if let Some(f) = self.progress.as_mut() {
            f(fraction)
        }
    }
}

/// Cloneable stop button for one scan session.
#[derive(Debug, Clone)]
pub struct ScanStopper(CancellationToken);

impl ScanStopper {
    /// Stop launching new probes. Probes already in flight run to their
    /// own timeout, then the scan returns what it has.
    pub fn stop(&self) {
        self.0.cancel();
    }
}

/// A running scan. Dropping the handle stops the scan.
pub struct ScanHandle {
    events: UnboundedReceiver<ScanEvent>,
    stopper: ScanStopper,
    task: JoinHandle<Result<Vec<DeviceRecord>>>,
    _guard: DropGuard,
}

impl ScanHandle {
    pub fn stopper(&self) -> ScanStopper {
        self.stopper.clone()
    }

    pub fn stop(&self) {
        self.stopper.stop();
    }

    /// Next event, `None` once the session has ended and all events were read.
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// Discard remaining events and wait for the result.
    pub async fn finish(self) -> Result<Vec<DeviceRecord>> {
        self.run_with(&mut ()).await
    }

    /// Feed remaining events to `observer`, then return the result.
    ///
    /// A cancelled scan returns `Ok` with whatever was found so far. Only a
    /// crashed probe task or driver yields `Err`.
    pub async fn run_with<O: ScanObserver + ?Sized>(mut self, observer: &mut O) -> Result<Vec<DeviceRecord>> {
        while let Some(ev) = self.events.recv().await {
            match ev {
                ScanEvent::ProbeStarted { ip } => observer.on_ip_scanned(ip),
                ScanEvent::DeviceFound { record } => observer.on_device_found(&record),
                ScanEvent::Progress { fraction, .. } => observer.on_progress(fraction),
                ScanEvent::Completed { .. } => {}
            }
        }
        self.task.await?
    }
}

/// Sweeps /24 subnets for players, plus single-address checks.
pub struct Scanner<P = HttpProbe, R = Resolver> {
    probe: Arc<P>,
    resolver: Arc<R>,
    config: ScanConfig,
}

impl<P, R> Clone for Scanner<P, R> {
    fn clone(&self) -> Self {
        Self {
            probe: self.probe.clone(),
            resolver: self.resolver.clone(),
            config: self.config.clone(),
        }
    }
}

impl Scanner {
    /// HTTP probing with interface-table subnet detection.
    pub fn http(config: ScanConfig) -> Result<Self> {
        Ok(Scanner::new(HttpProbe::new()?, Resolver::default(), config))
    }
}

impl<P, R> Scanner<P, R>
where
    P: Probe,
    R: LocalAddrSource + Send + Sync + 'static,
{
    pub fn new(probe: P, resolver: R, config: ScanConfig) -> Self {
        Self {
            probe: Arc::new(probe),
            resolver: Arc::new(resolver),
            config,
        }
    }

    /// Same probe, different tuning.
    pub fn with_config(&self, config: ScanConfig) -> Self {
        Self {
            probe: self.probe.clone(),
            resolver: self.resolver.clone(),
            config,
        }
    }

    /// Same probe and tuning, different subnet source.
    pub fn with_resolver(&self, resolver: R) -> Self {
        Self {
            probe: self.probe.clone(),
            resolver: Arc::new(resolver),
            config: self.config.clone(),
        }
    }

    /// Start a fresh, independently stoppable session.
    pub fn start(&self) -> ScanHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(
            self.probe.clone(),
            self.resolver.clone(),
            self.config.clone(),
            cancel.clone(),
            tx,
        ));
        ScanHandle {
            events: rx,
            stopper: ScanStopper(cancel.clone()),
            task,
            _guard: cancel.drop_guard(),
        }
    }

    /// Run a full session, reporting through `observer`.
    pub async fn scan_network<O: ScanObserver + ?Sized>(&self, observer: &mut O) -> Result<Vec<DeviceRecord>> {
        self.start().run_with(observer).await
    }

    /// Whether a player answers at `ip:port`, with the longer standalone timeout.
    pub async fn check_device_availability(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.probe.probe(ip, port, AVAILABILITY_TIMEOUT).await
    }

    /// Single-address discovery for manual add/edit.
    pub async fn create_device_from_ip(&self, ip: Ipv4Addr, port: u16) -> Option<DeviceRecord> {
        let identity = self.probe.identify(ip, port, AVAILABILITY_TIMEOUT).await?;
        Some(DeviceRecord::identified(ip, port, identity))
    }
}

/// Mutable state of one session, shared by its probe tasks.
struct Session {
    settled: u64,
    total: u64,
    records: Vec<DeviceRecord>,
    tx: UnboundedSender<ScanEvent>,
}

impl Session {
    // Events are sent under the lock so Progress numerators arrive in order.
    fn settle(&mut self, ip: Ipv4Addr, port: u16, answer: Option<Identity>) {
        if let Some(identity) = answer {
            let record = DeviceRecord::identified(ip, port, identity);
            info!(id = %record.id, "device found");
            self.records.push(record.clone());
            let _ = self.tx.send(ScanEvent::DeviceFound { record });
        }
        self.settled += 1;
        let _ = self.tx.send(ScanEvent::Progress {
            settled: self.settled,
            total: self.total,
            fraction: self.settled as f64 / self.total as f64,
        });
    }
}

async fn run_session<P, R>(
    probe: Arc<P>,
    resolver: Arc<R>,
    config: ScanConfig,
    cancel: CancellationToken,
    tx: UnboundedSender<ScanEvent>,
) -> Result<Vec<DeviceRecord>>
where
    P: Probe,
    R: LocalAddrSource + Send + Sync + 'static,
{
    let resolved = resolve_subnet(resolver.as_ref()).await;
    let subnets = config.plan(resolved);
    let targets: Vec<Ipv4Addr> = subnets.iter().flat_map(|s| s.hosts()).collect();
    let total = targets.len() as u64;
    info!(
        subnets = ?subnets.iter().map(ToString::to_string).collect::<Vec<_>>(),
        hosts = total,
        concurrency = config.concurrency,
        "network scan started"
    );

    let session = Arc::new(Mutex::new(Session {
        settled: 0,
        total,
        records: Vec::new(),
        tx: tx.clone(),
    }));
    let sem = Arc::new(Semaphore::new(config.concurrency.clamp(1, 256)));
    let mut set = JoinSet::new();

    for ip in targets {
        if cancel.is_cancelled() {
            break;
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = sem.clone().acquire_owned() => {
                permit.map_err(|e| DiscoveryError::Orchestration(e.to_string()))?
            }
        };
        let probe = probe.clone();
        let session = session.clone();
        let cancel = cancel.clone();
        let tx = tx.clone();
        let port = config.port;
        let timeout = config.probe_timeout;

        set.spawn(async move {
            let _permit = permit; // keep permit until task completes

            if cancel.is_cancelled() {
                return;
            }
            let _ = tx.send(ScanEvent::ProbeStarted { ip });
            let answer = probe.identify(ip, port, timeout).await;
            session.lock().await.settle(ip, port, answer);
        });
    }

    while let Some(res) = set.join_next().await {
        res?;
    }

    let (records, settled) = {
        let s = session.lock().await;
        (s.records.clone(), s.settled)
    };
    let cancelled = settled < total;
    if cancelled {
        debug!(settled, total, "scan stopped early");
    }
    info!(found = records.len(), settled, cancelled, "network scan completed");
    let _ = tx.send(ScanEvent::Completed {
        records: records.clone(),
        cancelled,
    });
    Ok(records)
}
