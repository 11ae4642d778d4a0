//! Liveness probe primitive.
//!
//! A probe is one bounded HTTP GET against the player's IR endpoint with a
//! sentinel code. Whether the answer means "this is a player" is decided by a
//! [`ResponseMatcher`]; the stock matcher treats anything but 404 as present.

use crate::error::Result;
use reqwest::StatusCode;
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::trace;

/// Path of the embedded server's command CGI.
pub const IR_ENDPOINT: &str = "/cgi-bin/do";

/// Code sent by probes. Not a real command, the player ignores it.
pub const SENTINEL_CODE: &str = "TEST";

/// Per-probe timeout used while sweeping a subnet.
pub const SCAN_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for a standalone availability check.
pub const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(3);

/// Larger bodies are not inspected for a device name.
const MAX_NAME_BODY: usize = 64 * 1024;

pub fn ir_url(ip: Ipv4Addr, port: u16, code: &str) -> String {
    format!("http://{ip}:{port}{IR_ENDPOINT}?cmd=ir_code&ir_code={code}")
}

/// Client for talking to players directly. Environment proxies are ignored:
/// a proxy would answer for hosts that do not exist.
pub fn lan_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().no_proxy().build()?)
}

/// What a live endpoint said about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Self-reported name, only kept when it names the device family.
    pub name: Option<String>,
}

/// Anything able to tell whether a player answers at `ip:port`.
///
/// Implementations must swallow every transport error and report `false`.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, ip: Ipv4Addr, port: u16, timeout: Duration) -> impl Future<Output = bool> + Send;

    /// `None` when nothing answers. Probes that cannot read a name report an
    /// empty [`Identity`] for live endpoints.
    fn identify(&self, ip: Ipv4Addr, port: u16, timeout: Duration) -> impl Future<Output = Option<Identity>> + Send {
        async move { self.probe(ip, port, timeout).await.then(Identity::default) }
    }
}

/// `name` from a JSON body, if it mentions `R_VOLUTION`.
pub fn reported_name(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let name = value.get("name")?.as_str()?.trim();
    name.contains("R_VOLUTION").then(|| name.to_string())
}

/// Decides whether an HTTP status identifies the target device family.
pub trait ResponseMatcher: Send + Sync + 'static {
    fn is_device(&self, status: StatusCode) -> bool;
}

/// The player answers its CGI path with something, even an error page, so
/// only 404 rules an address out.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFoundMeansAbsent;

impl ResponseMatcher for NotFoundMeansAbsent {
    fn is_device(&self, status: StatusCode) -> bool {
        status != StatusCode::NOT_FOUND
    }
}

/// Probe over HTTP with a shared connection pool.
pub struct HttpProbe<M = NotFoundMeansAbsent> {
    client: reqwest::Client,
    matcher: M,
}

impl HttpProbe<NotFoundMeansAbsent> {
    pub fn new() -> Result<Self> {
        Self::with_matcher(NotFoundMeansAbsent)
    }
}

impl<M: ResponseMatcher> HttpProbe<M> {
    pub fn with_matcher(matcher: M) -> Result<Self> {
        Ok(Self {
            client: lan_client()?,
            matcher,
        })
    }

    async fn matching_response(&self, ip: Ipv4Addr, port: u16, timeout: Duration) -> Option<reqwest::Response> {
        let url = ir_url(ip, port, SENTINEL_CODE);
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) => {
                let status = resp.status();
                trace!(%ip, port, %status, "probe answered");
                self.matcher.is_device(status).then_some(resp)
            }
            Err(e) => {
                trace!(%ip, port, error = %e, "probe failed");
                None
            }
        }
    }
}

impl<M: ResponseMatcher> Probe for HttpProbe<M> {
    async fn probe(&self, ip: Ipv4Addr, port: u16, timeout: Duration) -> bool {
        self.matching_response(ip, port, timeout).await.is_some()
    }

    async fn identify(&self, ip: Ipv4Addr, port: u16, timeout: Duration) -> Option<Identity> {
        let resp = self.matching_response(ip, port, timeout).await?;
        if resp.content_length().is_some_and(|n| n > MAX_NAME_BODY as u64) {
            return Some(Identity::default());
        }
        // The request timeout also bounds the body read.
        let name = match resp.bytes().await {
            Ok(body) if body.len() <= MAX_NAME_BODY => reported_name(&body),
            Ok(_) => None,
            Err(e) => {
                trace!(%ip, port, error = %e, "probe body unreadable");
                None
            }
        };
        Some(Identity { name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_404_is_absent() {
        let m = NotFoundMeansAbsent;
        assert!(m.is_device(StatusCode::OK));
        assert!(m.is_device(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(m.is_device(StatusCode::UNAUTHORIZED));
        assert!(!m.is_device(StatusCode::NOT_FOUND));
    }

    #[test]
    fn url_shape() {
        assert_eq!(
            ir_url(Ipv4Addr::new(192, 168, 1, 9), 80, "AC534040"),
            "http://192.168.1.9:80/cgi-bin/do?cmd=ir_code&ir_code=AC534040"
        );
    }

    #[test]
    fn name_only_taken_from_family_json() {
        assert_eq!(
            reported_name(br#"{"name":"R_VOLUTION PlayerOne"}"#).as_deref(),
            Some("R_VOLUTION PlayerOne")
        );
        assert_eq!(reported_name(br#"{"name":"Living room TV"}"#), None);
        assert_eq!(reported_name(br#"{"name":42}"#), None);
        assert_eq!(reported_name(b"<html>ok</html>"), None);
        assert_eq!(reported_name(b""), None);
    }

    #[tokio::test]
    async fn refused_connection_is_absent() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = HttpProbe::new().unwrap();
        assert!(probe.identify(Ipv4Addr::LOCALHOST, port, Duration::from_millis(500)).await.is_none());
        assert!(!probe.probe(Ipv4Addr::LOCALHOST, port, Duration::from_millis(500)).await);
    }
}
