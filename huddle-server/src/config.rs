//! Load config from file and environment.

use std::path::PathBuf;

use serde::Deserialize;

/// Daemon configuration. File: ~/.config/huddle/config.toml or
/// /etc/huddle/config.toml. Env overrides: HUDDLE_HTTP_PORT,
/// HUDDLE_PEER_PORT, HUDDLE_DISCOVERY_PORT, HUDDLE_DATA_DIR,
/// HUDDLE_ADMIN_USER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Web surface listen port (default 8080).
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Peer transport TCP port (default 46600).
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    /// Discovery UDP port (default 46601).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Directory for persisted rooms/messages/links/attachments.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory for uploaded files.
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    /// Username granted admin actions.
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// Host name used when building invite URLs.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// Instance name advertised on the local network.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Cap on one upload request body.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Cap on one WebSocket frame payload.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Cap on one peer envelope payload.
    #[serde(default = "default_max_envelope_bytes")]
    pub max_envelope_bytes: usize,
    /// Most recent messages replayed to a joining connection.
    #[serde(default = "default_history_replay_limit")]
    pub history_replay_limit: usize,
    /// A peer read that stays idle this long closes the link.
    #[serde(default = "default_peer_idle_timeout_secs")]
    pub peer_idle_timeout_secs: u64,
    /// Admin session lifetime.
    #[serde(default = "default_admin_session_ttl_secs")]
    pub admin_session_ttl_secs: i64,
    /// Shared secret for the development credential engine. Unset means
    /// credentials are accepted as-is (development only).
    #[serde(default)]
    pub admin_secret: Option<String>,
}

fn default_http_port() -> u16 {
    8080
}
fn default_peer_port() -> u16 {
    46600
}
fn default_discovery_port() -> u16 {
    46601
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_admin_username() -> String {
    "Admin".to_string()
}
fn default_public_host() -> String {
    "localhost".to_string()
}
fn default_service_name() -> String {
    "huddle".to_string()
}
fn default_max_upload_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_max_envelope_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_history_replay_limit() -> usize {
    500
}
fn default_peer_idle_timeout_secs() -> u64 {
    60
}
fn default_admin_session_ttl_secs() -> i64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            peer_port: default_peer_port(),
            discovery_port: default_discovery_port(),
            data_dir: default_data_dir(),
            uploads_dir: default_uploads_dir(),
            admin_username: default_admin_username(),
            public_host: default_public_host(),
            service_name: default_service_name(),
            max_upload_bytes: default_max_upload_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
            max_envelope_bytes: default_max_envelope_bytes(),
            history_replay_limit: default_history_replay_limit(),
            peer_idle_timeout_secs: default_peer_idle_timeout_secs(),
            admin_session_ttl_secs: default_admin_session_ttl_secs(),
            admin_secret: None,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("HUDDLE_HTTP_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.http_port = p;
        }
    }
    if let Ok(s) = std::env::var("HUDDLE_PEER_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.peer_port = p;
        }
    }
    if let Ok(s) = std::env::var("HUDDLE_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("HUDDLE_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
    if let Ok(s) = std::env::var("HUDDLE_ADMIN_USER") {
        c.admin_username = s;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/huddle/config.toml"));
    }
    out.push(PathBuf::from("/etc/huddle/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
