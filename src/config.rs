//! Environment-driven configuration for the server and the client.

use crate::error::{Error, Result};
use crate::protocol::{JoinInfo, Role};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";
const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_CONNECT_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            bind: parse_var(&lookup, "LIVEROOM_BIND", DEFAULT_BIND)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signal_url: String,
    pub ice_servers: Vec<String>,
    pub negotiation_timeout: Duration,
    pub recordings_dir: PathBuf,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub identity: JoinInfo,
    pub room_password: Option<String>,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests need not touch the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let ice_servers = lookup("LIVEROOM_ICE_SERVERS")
            .unwrap_or_else(|| DEFAULT_STUN.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let timeout_secs: u64 = parse_var(
            &lookup,
            "LIVEROOM_NEGOTIATION_TIMEOUT_SECS",
            &DEFAULT_NEGOTIATION_TIMEOUT_SECS.to_string(),
        )?;
        let connect_delay_ms: u64 = parse_var(
            &lookup,
            "LIVEROOM_CONNECT_DELAY_MS",
            &DEFAULT_CONNECT_DELAY_MS.to_string(),
        )?;

        let user_id =
            lookup("LIVEROOM_USER_ID").unwrap_or_else(|| format!("user-{}", rand::random::<u32>()));
        let identity = JoinInfo {
            room_id: lookup("LIVEROOM_ROOM").unwrap_or_else(|| "test-room".to_string()),
            user_name: lookup("LIVEROOM_USER_NAME").unwrap_or_else(|| user_id.clone()),
            user_id,
            role: parse_var::<Role>(&lookup, "LIVEROOM_ROLE", "participant")?,
        };

        Ok(Self {
            signal_url: lookup("LIVEROOM_SIGNAL_URL")
                .unwrap_or_else(|| DEFAULT_SIGNAL_URL.to_string()),
            ice_servers,
            negotiation_timeout: Duration::from_secs(timeout_secs),
            recordings_dir: lookup("LIVEROOM_RECORDINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("recordings")),
            connect_attempts: parse_var(
                &lookup,
                "LIVEROOM_CONNECT_ATTEMPTS",
                &DEFAULT_CONNECT_ATTEMPTS.to_string(),
            )?,
            connect_delay: Duration::from_millis(connect_delay_ms),
            identity,
            room_password: lookup("LIVEROOM_ROOM_PASSWORD").filter(|p| !p.is_empty()),
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e| Error::InvalidState(format!("{}={:?} is invalid: {}", key, raw, e)))
}
