use std::{env, path::PathBuf, time::Duration};

use pulseboard_sync::transfer::{DEFAULT_BATCH_SIZE_BYTES, clamp_batch_size};
use thiserror::Error;
use url::Url;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub socket_url: Option<Url>,
    pub transfer_url: Option<Url>,
    pub lane_base_url: Option<Url>,
    pub connect_timeout: Duration,
    pub batch_size_bytes: u64,
    pub download_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid PULSEBOARD_SOCKET_URL: {0}")]
    InvalidSocketUrl(String),
    #[error("invalid PULSEBOARD_TRANSFER_URL: {0}")]
    InvalidTransferUrl(String),
    #[error("invalid PULSEBOARD_LANE_BASE_URL: {0}")]
    InvalidLaneBaseUrl(String),
    #[error("invalid PULSEBOARD_CONNECT_TIMEOUT_MS: {0}")]
    InvalidConnectTimeoutMs(String),
    #[error("invalid PULSEBOARD_BATCH_SIZE_BYTES: {0}")]
    InvalidBatchSizeBytes(String),
    #[error("missing {0}")]
    Missing(&'static str),
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_url: None,
            transfer_url: None,
            lane_base_url: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            batch_size_bytes: DEFAULT_BATCH_SIZE_BYTES,
            download_dir: PathBuf::from("."),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        parse_client_config_from_env(|key| env::var(key).ok())
    }

    pub fn require_socket_url(&self) -> Result<&Url, ConfigError> {
        self.socket_url
            .as_ref()
            .ok_or(ConfigError::Missing("PULSEBOARD_SOCKET_URL"))
    }

    pub fn require_transfer_url(&self) -> Result<&Url, ConfigError> {
        self.transfer_url
            .as_ref()
            .ok_or(ConfigError::Missing("PULSEBOARD_TRANSFER_URL"))
    }

    /// Lane base, falling back to the transfer endpoint's origin over http(s).
    pub fn resolve_lane_base(&self) -> Result<Url, ConfigError> {
        if let Some(base) = &self.lane_base_url {
            return Ok(base.clone());
        }
        let mut base = self.require_transfer_url()?.clone();
        let scheme = match base.scheme() {
            "wss" => "https",
            _ => "http",
        };
        base.set_scheme(scheme)
            .map_err(|()| ConfigError::InvalidLaneBaseUrl(format!("cannot derive from {base}")))?;
        base.set_path("/");
        base.set_query(None);
        Ok(base)
    }
}

pub(crate) fn parse_client_config_from_env<F>(lookup: F) -> Result<ClientConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let parse_url = |key: &str, invalid: fn(String) -> ConfigError| {
        lookup(key)
            .filter(|value| !value.trim().is_empty())
            .map(|value| Url::parse(value.trim()).map_err(|error| invalid(error.to_string())))
            .transpose()
    };
    let socket_url = parse_url("PULSEBOARD_SOCKET_URL", ConfigError::InvalidSocketUrl)?;
    let transfer_url = parse_url("PULSEBOARD_TRANSFER_URL", ConfigError::InvalidTransferUrl)?;
    let lane_base_url = parse_url("PULSEBOARD_LANE_BASE_URL", ConfigError::InvalidLaneBaseUrl)?;

    let connect_timeout_ms = lookup("PULSEBOARD_CONNECT_TIMEOUT_MS")
        .unwrap_or_else(|| DEFAULT_CONNECT_TIMEOUT_MS.to_string())
        .parse::<u64>()
        .map_err(|error| ConfigError::InvalidConnectTimeoutMs(error.to_string()))?;
    if connect_timeout_ms == 0 {
        return Err(ConfigError::InvalidConnectTimeoutMs(
            "must be greater than zero".to_string(),
        ));
    }
    let batch_size_bytes = lookup("PULSEBOARD_BATCH_SIZE_BYTES")
        .unwrap_or_else(|| DEFAULT_BATCH_SIZE_BYTES.to_string())
        .parse::<u64>()
        .map_err(|error| ConfigError::InvalidBatchSizeBytes(error.to_string()))?;
    let download_dir = lookup("PULSEBOARD_DOWNLOAD_DIR")
        .filter(|value| !value.trim().is_empty())
        .map_or_else(|| PathBuf::from("."), PathBuf::from);

    Ok(ClientConfig {
        socket_url,
        transfer_url,
        lane_base_url,
        connect_timeout: Duration::from_millis(connect_timeout_ms),
        batch_size_bytes: clamp_batch_size(batch_size_bytes),
        download_dir,
    })
}
