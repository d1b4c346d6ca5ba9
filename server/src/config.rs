//! # config
//!
//! Settings persistence and OS path resolution.
//!
//! Settings live at `$CONFIG_DIR/meshforge/plugins/maps/settings.json` and
//! are written back with mode 0600 (the file can hold an API key, MQTT
//! credentials, and a webhook URL). Unknown keys in the file are ignored;
//! missing keys take defaults, so old configs keep loading across upgrades.
//!
//! Directory resolution is sudo-aware: a process launched through privilege
//! elevation resolves the invoking user's home (via `SUDO_USER` / `LOGNAME`
//! and the password database) rather than writing under `/root`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

// ── Path resolution ───────────────────────────────────────────────────────────

/// Look up a user's home directory in the password database.
fn passwd_home(user: &str) -> Option<PathBuf> {
    let passwd = fs::read_to_string("/etc/passwd").ok()?;
    for line in passwd.lines() {
        let mut fields = line.split(':');
        if fields.next() == Some(user) {
            // name:passwd:uid:gid:gecos:home:shell
            let home = fields.nth(4)?;
            if !home.is_empty() {
                return Some(PathBuf::from(home));
            }
        }
    }
    None
}

/// The effective user's home directory. Consults `SUDO_USER` and `LOGNAME`
/// (resolved through the password database) before falling back to `HOME`,
/// so `sudo meshforge-maps` does not scatter state under /root.
pub fn resolve_home() -> PathBuf {
    for var in ["SUDO_USER", "LOGNAME"] {
        if let Ok(user) = std::env::var(var) {
            if !user.is_empty() && user != "root" {
                if let Some(home) = passwd_home(&user) {
                    return home;
                }
            }
        }
    }
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn xdg_dir(var: &str, fallback: &[&str]) -> PathBuf {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => PathBuf::from(v),
        _ => {
            let mut p = resolve_home();
            for part in fallback {
                p.push(part);
            }
            p
        }
    }
}

pub fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", &[".config"])
}

pub fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", &[".local", "share"])
}

pub fn cache_dir() -> PathBuf {
    xdg_dir("XDG_CACHE_HOME", &[".cache"])
}

pub fn settings_path() -> PathBuf {
    config_dir().join("meshforge/plugins/maps/settings.json")
}

pub fn history_db_path() -> PathBuf {
    data_dir().join("meshforge/maps_node_history.db")
}

pub fn collector_cache_dir() -> PathBuf {
    cache_dir().join("meshforge/maps")
}

// ── Config sections ───────────────────────────────────────────────────────────

fn default_http_host() -> String {
    "127.0.0.1".into()
}
fn default_http_port() -> u16 {
    8808
}
fn default_true() -> bool {
    true
}
fn default_ws_port() -> u16 {
    8809
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_topic_prefix() -> String {
    "msh".into()
}
fn default_alert_topic() -> String {
    "meshforge/alerts".into()
}
fn default_poll_interval() -> u64 {
    60
}
fn default_stale_timeout() -> i64 {
    1800
}
fn default_max_nodes() -> usize {
    10_000
}
fn default_throttle() -> i64 {
    60
}
fn default_retention_days() -> i64 {
    30
}
fn default_alert_history() -> usize {
    500
}
fn default_offline_after() -> i64 {
    1800
}
fn default_rnstatus() -> String {
    "rnstatus".into()
}
fn default_hamclock_host() -> String {
    "127.0.0.1".into()
}
fn default_spacewx_fallback() -> String {
    "https://services.swpc.noaa.gov/products/noaa-scales.json".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_alert_topic")]
    pub alert_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_http_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            alert_topic: default_alert_topic(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_true")]
    pub meshtastic: bool,
    #[serde(default)]
    pub reticulum: bool,
    #[serde(default)]
    pub aredn: bool,
    #[serde(default)]
    pub hamclock: bool,
    /// Local Meshtastic node HTTP API, e.g. `http://192.168.1.5`.
    #[serde(default)]
    pub meshtastic_api_url: Option<String>,
    #[serde(default = "default_rnstatus")]
    pub reticulum_status_cmd: String,
    /// AREDN node endpoints (`host` or `host:port`).
    #[serde(default)]
    pub aredn_nodes: Vec<String>,
    #[serde(default = "default_hamclock_host")]
    pub hamclock_host: String,
    #[serde(default = "default_spacewx_fallback")]
    pub spacewx_fallback_url: String,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            meshtastic: true,
            reticulum: false,
            aredn: false,
            hamclock: false,
            meshtastic_api_url: None,
            reticulum_status_cmd: default_rnstatus(),
            aredn_nodes: Vec::new(),
            hamclock_host: default_hamclock_host(),
            spacewx_fallback_url: default_spacewx_fallback(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_throttle")]
    pub throttle_seconds: i64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            throttle_seconds: default_throttle(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_alert_history")]
    pub max_history: usize,
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Absence-based offline alert threshold, seconds since last_seen.
    #[serde(default = "default_offline_after")]
    pub offline_after_secs: i64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            max_history: default_alert_history(),
            webhook_url: None,
            offline_after_secs: default_offline_after(),
        }
    }
}

fn default_tile_providers() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "osm".to_string(),
            "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
        ),
        (
            "opentopo".to_string(),
            "https://tile.opentopomap.org/{z}/{x}/{y}.png".to_string(),
        ),
        (
            "carto-dark".to_string(),
            "https://basemaps.cartocdn.com/dark_all/{z}/{x}/{y}.png".to_string(),
        ),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_http_host")]
    pub http_host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_true")]
    pub ws_enabled: bool,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
    /// Pre-shared key for `/api/*`; auth is disabled when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    /// CORS is emitted only when explicitly configured; no wildcard default.
    #[serde(default)]
    pub cors_allowed_origin: Option<String>,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: i64,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default = "default_tile_providers")]
    pub tile_providers: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        // Round-trip the empty object so every serde default applies once
        serde_json::from_value(json!({})).expect("default config")
    }
}

impl Config {
    /// Load settings from `path`, falling back to defaults on a missing or
    /// corrupt file (corruption is logged, never fatal).
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!("no settings file at {}, using defaults", path.display());
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<Config>(&data) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Persist settings with owner-only permissions.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(self)?;
        fs::write(path, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Config view for `/api/config` with secrets blanked out.
    pub fn redacted(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if self.api_key.is_some() {
            v["api_key"] = json!("***");
        }
        if self.mqtt.password.is_some() {
            v["mqtt"]["password"] = json!("***");
        }
        if self.alerts.webhook_url.is_some() {
            v["alerts"]["webhook_url"] = json!("***");
        }
        v
    }

    /// Names of the enabled sources, in aggregator enable-order.
    pub fn enabled_sources(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.sources.meshtastic {
            out.push("meshtastic");
        }
        if self.sources.reticulum {
            out.push("reticulum");
        }
        if self.sources.aredn {
            out.push("aredn");
        }
        if self.sources.hamclock {
            out.push("hamclock");
        }
        out
    }

    /// Startup sanity pass. Returns human-readable warnings; the process
    /// remembers them and reports exit code 2 after a clean shutdown.
    pub fn verify(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.enabled_sources().is_empty() {
            warnings.push("no sources enabled, the map will stay empty".to_string());
        }
        if self.sources.aredn && self.sources.aredn_nodes.is_empty() {
            warnings.push("aredn enabled but no aredn_nodes configured".to_string());
        }
        if self.mqtt.enabled && self.mqtt.host.is_empty() {
            warnings.push("mqtt enabled but host is empty".to_string());
        }
        if self.mqtt.username.is_some() != self.mqtt.password.is_some() {
            warnings.push("mqtt username/password must be set together".to_string());
        }
        for dir in [data_dir().join("meshforge"), collector_cache_dir()] {
            if let Err(e) = fs::create_dir_all(&dir) {
                warnings.push(format!("cannot create {}: {e}", dir.display()));
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = Config::default();
        assert_eq!(cfg.http_port, 8808);
        assert_eq!(cfg.ws_port, 8809);
        assert_eq!(cfg.max_nodes, 10_000);
        assert_eq!(cfg.history.throttle_seconds, 60);
        assert!(cfg.api_key.is_none());
        assert!(cfg.cors_allowed_origin.is_none());
        assert_eq!(cfg.enabled_sources(), vec!["meshtastic"]);
    }

    #[test]
    fn unknown_keys_are_ignored_and_missing_take_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"http_port": 9000, "future_knob": {"x": 1}}"#).unwrap();
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.ws_port, 8809);
    }

    #[test]
    fn redaction_masks_secrets() {
        let mut cfg = Config::default();
        cfg.api_key = Some("hunter2".into());
        cfg.mqtt.password = Some("pw".into());
        cfg.alerts.webhook_url = Some("https://hooks.example/x".into());
        let v = cfg.redacted();
        assert_eq!(v["api_key"], "***");
        assert_eq!(v["mqtt"]["password"], "***");
        assert_eq!(v["alerts"]["webhook_url"], "***");
        // Non-secret fields survive
        assert_eq!(v["http_port"], 8808);
    }

    #[test]
    fn save_sets_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins/maps/settings.json");
        Config::default().save(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let reloaded = Config::load(&path);
        assert_eq!(reloaded.http_port, 8808);
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        let cfg = Config::load(&path);
        assert_eq!(cfg.http_port, 8808);
    }
}
