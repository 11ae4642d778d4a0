use crate::error::Result;
use crate::probe::{ir_url, lan_client};
use crate::validate::check_ir_code;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{info, warn};

/// Timeout for one command request.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends IR codes to a player, one GET per key press. Stateless.
#[derive(Debug, Clone)]
pub struct IrDispatcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl IrDispatcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: lan_client()?,
            timeout,
        })
    }

    /// `Ok(true)` when the player acknowledged with 2xx, `Ok(false)` for any
    /// other status or transport failure. Malformed codes are rejected before
    /// anything is sent.
    pub async fn send(&self, ip: Ipv4Addr, port: u16, code: &str) -> Result<bool> {
        let code = check_ir_code(code)?;
        let url = ir_url(ip, port, code);
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(resp) => {
                info!(%url, status = %resp.status(), "IR command sent");
                Ok(resp.status().is_success())
            }
            Err(e) => {
                warn!(%url, error = %e, "IR command failed");
                Ok(false)
            }
        }
    }
}
