//! Persisted device list.
//!
//! A single pretty-printed JSON array on disk. Each mutation is a full
//! load-modify-save cycle, serialised through an in-process lock.

use crate::error::Result;
use crate::netdetect::LocalAddrSource;
use crate::probe::Probe;
use crate::scanner::Scanner;
use crate::types::DeviceRecord;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tempfile::NamedTempFile;
use tokio::task::{self, JoinSet};
use tracing::{debug, info, warn};

const STORE_FILE: &str = "devices.json";

#[derive(Debug, Clone)]
pub struct DeviceStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl DeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// `<data dir>/rvremote/devices.json`, or the temp dir when the platform
    /// has no data dir.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("rvremote")
            .join(STORE_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means no devices yet.
    pub async fn load_devices(&self) -> Result<Vec<DeviceRecord>> {
        let _g = self.lock.lock().await;
        self.read().await
    }

    pub async fn save_devices(&self, devices: &[DeviceRecord]) -> Result<()> {
        let _g = self.lock.lock().await;
        self.write(devices).await
    }

    /// Insert or replace. Two records with the same address are the same
    /// device, the newer one wins.
    pub async fn add_device(&self, device: DeviceRecord) -> Result<()> {
        let _g = self.lock.lock().await;
        let mut devices = self.read().await?;
        match devices.iter_mut().find(|d| d.ip_address == device.ip_address) {
            Some(existing) => {
                debug!(id = %device.id, "replacing stored device");
                *existing = device;
            }
            None => {
                info!(id = %device.id, "storing new device");
                devices.push(device);
            }
        }
        self.write(&devices).await
    }

    /// Returns whether anything was removed.
    pub async fn remove_device(&self, id: &str) -> Result<bool> {
        let _g = self.lock.lock().await;
        let mut devices = self.read().await?;
        let before = devices.len();
        devices.retain(|d| d.id != id);
        let removed = devices.len() != before;
        if removed {
            info!(id, "removed device");
            self.write(&devices).await?;
        }
        Ok(removed)
    }

    /// Look up by `id` or by bare IP address.
    pub async fn find(&self, key: &str) -> Result<Option<DeviceRecord>> {
        let devices = self.load_devices().await?;
        Ok(devices
            .into_iter()
            .find(|d| d.id == key || d.ip_address.to_string() == key))
    }

    /// Re-check every stored device concurrently and persist the new
    /// online state.
    pub async fn refresh_status<P, R>(&self, scanner: &Scanner<P, R>) -> Result<Vec<DeviceRecord>>
    where
        P: Probe,
        R: LocalAddrSource + Send + Sync + 'static,
    {
        let devices = self.load_devices().await?;
        let mut set = JoinSet::new();
        for (idx, dev) in devices.iter().enumerate() {
            let scanner = scanner.clone();
            let (ip, port) = (dev.ip_address, dev.port);
            set.spawn(async move { (idx, scanner.check_device_availability(ip, port).await) });
        }
        let mut online = vec![false; devices.len()];
        while let Some(res) = set.join_next().await {
            let (idx, up) = res?;
            online[idx] = up;
        }

        let _g = self.lock.lock().await;
        // Re-read so edits made while probing are not lost.
        let mut current = self.read().await?;
        for dev in current.iter_mut() {
            if let Some(idx) = devices.iter().position(|d| d.id == dev.id) {
                dev.mark(online[idx]);
            }
        }
        self.write(&current).await?;
        Ok(current)
    }

    async fn read(&self) -> Result<Vec<DeviceRecord>> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read device store");
                Err(e.into())
            }
        }
    }

    // Each write goes through its own temp file in the target directory, so
    // another process saving the same list never shares it.
    async fn write(&self, devices: &[DeviceRecord]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(devices)?;
        let path = self.path.clone();
        task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&json)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}
