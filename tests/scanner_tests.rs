use rvremote::netdetect::{Resolver, SubnetPrefix};
use rvremote::probe::Probe;
use rvremote::{Callbacks, DiscoveryError, ScanConfig, ScanEvent, Scanner};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SUBNET: SubnetPrefix = SubnetPrefix([10, 20, 30]);

/// In-memory probe: listed hosts answer, everything else is silent.
#[derive(Default)]
struct ScriptedProbe {
    live: HashSet<Ipv4Addr>,
    delay: Duration,
    panic_on: Option<Ipv4Addr>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedProbe {
    fn live(hosts: &[u8]) -> Self {
        Self {
            live: hosts.iter().map(|&n| SUBNET.host(n)).collect(),
            ..Self::default()
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Probe for ScriptedProbe {
    async fn probe(&self, ip: Ipv4Addr, _port: u16, _timeout: Duration) -> bool {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.panic_on == Some(ip) {
            panic!("probe blew up");
        }
        self.live.contains(&ip)
    }
}

fn scanner(probe: ScriptedProbe, config: ScanConfig) -> Scanner<ScriptedProbe, Resolver> {
    Scanner::new(probe, Resolver::Fixed(SUBNET), config)
}

#[tokio::test]
async fn silent_subnet_reports_every_address_and_finds_nothing() {
    let s = scanner(ScriptedProbe::live(&[]), ScanConfig::default());
    let mut fractions = Vec::new();
    let mut found = 0;
    let devices = s
        .scan_network(
            &mut Callbacks::default()
                .on_progress(|f| fractions.push(f))
                .on_device_found(|_| found += 1),
        )
        .await
        .unwrap();

    assert!(devices.is_empty());
    assert_eq!(found, 0);
    assert_eq!(fractions.len(), 254);
    assert!(fractions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*fractions.last().unwrap(), 1.0);
    assert_eq!(fractions.iter().filter(|&&f| f == 1.0).count(), 1);
}

#[tokio::test]
async fn two_live_hosts_yield_two_records() {
    let s = scanner(ScriptedProbe::live(&[5, 200]).delayed(Duration::from_millis(2)), ScanConfig::default());
    let mut found_ids = Vec::new();
    let mut scanned = HashSet::new();
    let mut devices = s
        .scan_network(
            &mut Callbacks::default()
                .on_device_found(|r| found_ids.push(r.id.clone()))
                .on_ip_scanned(|ip| {
                    scanned.insert(ip);
                }),
        )
        .await
        .unwrap();

    assert_eq!(found_ids.len(), 2);
    assert_eq!(scanned.len(), 254);
    devices.sort_by_key(|d| d.ip_address);
    let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["10.20.30.5:80", "10.20.30.200:80"]);
    assert!(devices.iter().all(|d| d.is_online && d.port == 80));
}

#[tokio::test]
async fn concurrency_is_bounded() {
    let probe = ScriptedProbe::live(&[]).delayed(Duration::from_millis(5));
    let max = probe.max_in_flight.clone();
    let config = ScanConfig {
        concurrency: 7,
        ..ScanConfig::default()
    };
    scanner(probe, config).start().finish().await.unwrap();
    let max = max.load(Ordering::SeqCst);
    assert!(max <= 7, "saw {max} probes in flight");
    assert!(max > 1);
}

#[tokio::test]
async fn stop_returns_partial_results_promptly() {
    let all: Vec<u8> = (1..=254).collect();
    let probe = ScriptedProbe::live(&all).delayed(Duration::from_millis(40));
    let s = scanner(probe, ScanConfig::default());

    let mut handle = s.start();
    let mut stopped_at = None;
    let mut completed = None;
    while let Some(ev) = handle.next_event().await {
        match ev {
            ScanEvent::Progress { settled, .. } if settled >= 20 && stopped_at.is_none() => {
                handle.stop();
                stopped_at = Some(Instant::now());
            }
            ScanEvent::Completed { records, cancelled } => completed = Some((records.len(), cancelled)),
            _ => {}
        }
    }
    let devices = handle.finish().await.unwrap();

    let elapsed = stopped_at.expect("scan was stopped").elapsed();
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?} after stop");
    let (count, cancelled) = completed.expect("completed event");
    assert!(cancelled);
    assert_eq!(count, devices.len());
    assert!(devices.len() >= 20);
    assert!(devices.len() < 254);
}

#[tokio::test]
async fn sessions_are_independent() {
    let s = scanner(ScriptedProbe::live(&[9]).delayed(Duration::from_millis(5)), ScanConfig::default());
    let first = s.start();
    let second = s.start();
    first.stop();

    let a = first.finish().await.unwrap();
    let b = second.finish().await.unwrap();
    assert!(a.len() <= 1);
    assert_eq!(b.len(), 1);
    assert_eq!(b[0].id, "10.20.30.9:80");
}

#[tokio::test]
async fn completed_is_the_last_event() {
    let s = scanner(ScriptedProbe::live(&[1]), ScanConfig::default());
    let mut handle = s.start();
    let mut last = None;
    while let Some(ev) = handle.next_event().await {
        last = Some(ev);
    }
    match last {
        Some(ScanEvent::Completed { records, cancelled }) => {
            assert!(!cancelled);
            assert_eq!(records.len(), 1);
        }
        other => panic!("unexpected last event {other:?}"),
    }
    assert_eq!(handle.finish().await.unwrap().len(), 1);
}

#[tokio::test]
async fn extra_subnets_widen_the_sweep() {
    let config = ScanConfig {
        extra_subnets: vec![SubnetPrefix([10, 20, 31]), SUBNET],
        ..ScanConfig::default()
    };
    let s = scanner(ScriptedProbe::live(&[3]), config);
    let mut last = 0.0;
    let mut calls = 0;
    let devices = s
        .scan_network(&mut Callbacks::default().on_progress(|f| {
            calls += 1;
            last = f;
        }))
        .await
        .unwrap();
    assert_eq!(calls, 508);
    assert_eq!(last, 1.0);
    assert_eq!(devices.len(), 1);
}

#[tokio::test]
async fn crashed_probe_fails_the_scan() {
    let probe = ScriptedProbe {
        panic_on: Some(SUBNET.host(42)),
        ..ScriptedProbe::default()
    };
    let err = scanner(probe, ScanConfig::default()).start().finish().await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Orchestration(_)));
}

#[tokio::test]
async fn create_device_is_stable_across_calls() {
    let s = scanner(ScriptedProbe::live(&[77]), ScanConfig::default());
    let a = s.create_device_from_ip(SUBNET.host(77), 8080).await.unwrap();
    let b = s.create_device_from_ip(SUBNET.host(77), 8080).await.unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(a.id, "10.20.30.77:8080");
    assert_eq!((a.ip_address, a.port), (b.ip_address, b.port));
    assert!(s.create_device_from_ip(SUBNET.host(78), 80).await.is_none());
}
