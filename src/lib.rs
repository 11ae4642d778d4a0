//! Library crate for rvremote: discovery, registry and IR command dispatch for
//! R_VOLUTION network media players.
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod netdetect;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod store;
pub mod types;
pub mod validate;

pub use error::{DiscoveryError, Result};
pub use scanner::{Callbacks, ScanConfig, ScanHandle, ScanObserver, ScanStopper, Scanner};
pub use types::{DeviceRecord, ScanEvent};
