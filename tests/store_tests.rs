use rvremote::netdetect::{Resolver, SubnetPrefix};
use rvremote::probe::Probe;
use rvremote::store::DeviceStore;
use rvremote::{DeviceRecord, ScanConfig, Scanner};
use std::net::Ipv4Addr;
use std::time::Duration;

fn rec(last: u8, port: u16) -> DeviceRecord {
    DeviceRecord::discovered(Ipv4Addr::new(192, 168, 1, last), port)
}

fn temp_store() -> (tempfile::TempDir, DeviceStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = DeviceStore::new(dir.path().join("nested").join("devices.json"));
    (dir, store)
}

#[tokio::test]
async fn missing_file_loads_empty() {
    let (_dir, store) = temp_store();
    assert!(store.load_devices().await.unwrap().is_empty());
}

#[tokio::test]
async fn add_upserts_by_address() {
    let (_dir, store) = temp_store();
    store.add_device(rec(10, 80)).await.unwrap();
    store.add_device(rec(11, 80)).await.unwrap();
    store.add_device(rec(10, 8080).with_name("Living room")).await.unwrap();

    let devices = store.load_devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].id, "192.168.1.10:8080");
    assert_eq!(devices[0].name, "Living room");
    assert_eq!(devices[1].id, "192.168.1.11:80");
}

#[tokio::test]
async fn remove_by_id() {
    let (_dir, store) = temp_store();
    store.save_devices(&[rec(1, 80), rec(2, 80)]).await.unwrap();

    assert!(store.remove_device("192.168.1.1:80").await.unwrap());
    assert!(!store.remove_device("192.168.1.1:80").await.unwrap());
    let ids: Vec<_> = store.load_devices().await.unwrap().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["192.168.1.2:80"]);
}

#[tokio::test]
async fn find_by_id_or_ip() {
    let (_dir, store) = temp_store();
    store.add_device(rec(7, 80)).await.unwrap();
    assert!(store.find("192.168.1.7:80").await.unwrap().is_some());
    assert!(store.find("192.168.1.7").await.unwrap().is_some());
    assert!(store.find("192.168.1.8").await.unwrap().is_none());
}

#[tokio::test]
async fn persisted_json_uses_camel_case() {
    let (_dir, store) = temp_store();
    store.add_device(rec(3, 80)).await.unwrap();
    let raw = std::fs::read_to_string(store.path()).unwrap();
    assert!(raw.contains("\"ipAddress\": \"192.168.1.3\""));
    assert!(raw.contains("\"isOnline\": true"));
}

struct OnlyEven;

impl Probe for OnlyEven {
    async fn probe(&self, ip: Ipv4Addr, _port: u16, _timeout: Duration) -> bool {
        ip.octets()[3] % 2 == 0
    }
}

#[tokio::test]
async fn refresh_marks_online_state() {
    let (_dir, store) = temp_store();
    let mut stale = rec(5, 80);
    stale.is_online = true;
    store.save_devices(&[stale, rec(6, 80)]).await.unwrap();

    let scanner = Scanner::new(OnlyEven, Resolver::Fixed(SubnetPrefix([192, 168, 1])), ScanConfig::default());
    let devices = store.refresh_status(&scanner).await.unwrap();
    assert!(!devices[0].is_online);
    assert!(devices[1].is_online);

    let reloaded = store.load_devices().await.unwrap();
    assert_eq!(reloaded, devices);
}

// Two handles on one file stand in for the CLI and a running server: they
// share no lock, only the file.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_handles_save_concurrently() {
    let (dir, a) = temp_store();
    let b = DeviceStore::new(a.path());

    let mut tasks = Vec::new();
    for i in 0..20u8 {
        let store = if i % 2 == 0 { a.clone() } else { b.clone() };
        tasks.push(tokio::spawn(async move { store.save_devices(&[rec(i + 1, 80)]).await }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }

    let devices = a.load_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    let leftovers: Vec<String> = std::fs::read_dir(dir.path().join("nested"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(leftovers, ["devices.json"]);
}
