//! Native runtime for pulseboard.
//!
//! - [`WsTransport`]: WebSocket transport over `tokio-tungstenite`
//! - [`HttpLaneLauncher`]: transfer lanes streamed to disk over `reqwest`
//! - [`run_channel`] / [`run_transfer`]: serialized event loops
//! - [`ClientConfig`]: environment configuration

pub mod config;
pub mod error;
pub mod event_loop;
pub mod lanes;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, Result};
pub use event_loop::{TransferOptions, run_channel, run_transfer};
pub use lanes::{HttpLaneLauncher, LaneEvents, lane_file_name};
pub use transport::{SocketConfig, TransportEvents, WsTransport};
