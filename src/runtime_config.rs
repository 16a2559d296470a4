// =============================================================================
// Runtime Configuration — hot-loadable sentinel settings with atomic save
// =============================================================================
//
// Central configuration hub for the steamwatch sentinel. Operational knobs
// (hosts, channel groups, timers, reconnect policy, alert topics, steam
// thresholds) live here; secrets do not — those resolve through the secret
// store.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file. Environment variables override
// file values for deploy-time wiring.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dispatcher::ChannelSpec;
use crate::steam::{SteamConfig, SteamConfigTable};
use crate::types::{AlertType, League, OddsType, Severity};
use crate::upstream::stream::StreamSettings;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_auth_url() -> String {
    "https://plive.oddsfeed.io/ajax/getwebsockettoken".to_string()
}

fn default_stream_url() -> String {
    "wss://premws.oddsfeed.io:443/stream".to_string()
}

fn default_origin() -> String {
    "https://www.oddsfeed.io".to_string()
}

fn default_referer() -> String {
    "https://www.oddsfeed.io/live".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0 Safari/537.36"
        .to_string()
}

fn default_channel_groups() -> Vec<String> {
    vec!["nba_change_xml,ch_nbaGoal8_xml".to_string()]
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_token_ttl_secs() -> u64 {
    60
}

fn default_refresh_margin_secs() -> u64 {
    5
}

fn default_auth_retry_limit() -> u32 {
    5
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    60_000
}

fn default_reconnect_multiplier() -> f64 {
    2.0
}

fn default_tick_queue_depth() -> usize {
    1_024
}

fn default_stall_after_secs() -> u64 {
    120
}

fn default_detector_cleanup_secs() -> u64 {
    60
}

fn default_deep_link_base() -> String {
    "https://live.oddsfeed.io/match".to_string()
}

fn default_audit_dir() -> String {
    "logs".to_string()
}

fn default_audit_retention_days() -> u32 {
    7
}

fn default_audit_queue_depth() -> usize {
    4_096
}

// =============================================================================
// Alert channel configuration
// =============================================================================

/// One topic in the messaging supergroup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Topic (message thread) id. Required at startup; 0 means unset.
    #[serde(default)]
    pub topic_id: i64,
    #[serde(default)]
    pub cooldown_ms: i64,
    #[serde(default = "floor_info")]
    pub severity_floor: Severity,
}

fn floor_info() -> Severity {
    Severity::Info
}

fn default_steam_channel() -> ChannelConfig {
    ChannelConfig {
        topic_id: 0,
        cooldown_ms: 30_000,
        severity_floor: Severity::Info,
    }
}

fn default_performance_channel() -> ChannelConfig {
    ChannelConfig {
        topic_id: 0,
        cooldown_ms: 60_000,
        severity_floor: Severity::Warning,
    }
}

fn default_system_channel() -> ChannelConfig {
    ChannelConfig {
        topic_id: 0,
        cooldown_ms: 60_000,
        severity_floor: Severity::Warning,
    }
}

fn default_auth_channel() -> ChannelConfig {
    ChannelConfig {
        topic_id: 0,
        cooldown_ms: 0,
        severity_floor: Severity::Critical,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_steam_channel")]
    pub steam: ChannelConfig,
    #[serde(default = "default_performance_channel")]
    pub performance: ChannelConfig,
    #[serde(default = "default_system_channel")]
    pub system: ChannelConfig,
    #[serde(default = "default_auth_channel")]
    pub auth: ChannelConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            steam: default_steam_channel(),
            performance: default_performance_channel(),
            system: default_system_channel(),
            auth: default_auth_channel(),
        }
    }
}

// =============================================================================
// Steam threshold overrides
// =============================================================================

/// Partial override of the built-in detection table for one
/// (league, odds type) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteamOverride {
    pub league: String,
    pub odds_type: String,
    #[serde(default)]
    pub velocity_threshold: Option<f64>,
    #[serde(default)]
    pub time_window_ms: Option<i64>,
    #[serde(default)]
    pub volume_weight: Option<f64>,
    #[serde(default)]
    pub min_rapid_changes: Option<usize>,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the sentinel.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Upstream endpoints --------------------------------------------------
    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    #[serde(default = "default_origin")]
    pub origin: String,

    #[serde(default = "default_referer")]
    pub referer: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// One WebSocket per entry; each entry is a channel CSV.
    #[serde(default = "default_channel_groups")]
    pub channel_groups: Vec<String>,

    // --- Timers --------------------------------------------------------------
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Assumed token lifetime when the token carries no `exp` claim.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Refresh tokens this long before expiry.
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,

    #[serde(default = "default_auth_retry_limit")]
    pub auth_retry_limit: u32,

    // --- Reconnect policy ----------------------------------------------------
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,

    /// None = retry forever.
    #[serde(default)]
    pub reconnect_max_attempts: Option<u32>,

    // --- Pipeline ------------------------------------------------------------
    #[serde(default = "default_tick_queue_depth")]
    pub tick_queue_depth: usize,

    /// No normalized tick for this long raises a heartbeat-gap audit.
    #[serde(default = "default_stall_after_secs")]
    pub stall_after_secs: u64,

    #[serde(default = "default_detector_cleanup_secs")]
    pub detector_cleanup_secs: u64,

    // --- Alerts --------------------------------------------------------------
    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default = "default_deep_link_base")]
    pub deep_link_base: String,

    // --- Detection overrides -------------------------------------------------
    #[serde(default)]
    pub steam_overrides: Vec<SteamOverride>,

    // --- Audit trail ---------------------------------------------------------
    #[serde(default = "default_audit_dir")]
    pub audit_dir: String,

    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: u32,

    #[serde(default = "default_audit_queue_depth")]
    pub audit_queue_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config object deserialises")
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            groups = ?config.channel_groups,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Deploy-time environment overrides. File values lose to the
    /// environment for everything an operator wires per host.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STEAMWATCH_AUTH_URL") {
            self.auth_url = v;
        }
        if let Ok(v) = std::env::var("STEAMWATCH_STREAM_URL") {
            self.stream_url = v;
        }
        if let Ok(v) = std::env::var("STEAMWATCH_CHANNELS") {
            // Semicolons separate socket groups; commas separate channels.
            self.channel_groups = v
                .split(';')
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("STEAMWATCH_AUDIT_DIR") {
            self.audit_dir = v;
        }
        for (name, channel) in [
            ("STEAMWATCH_TOPIC_STEAM", &mut self.alerts.steam),
            ("STEAMWATCH_TOPIC_PERFORMANCE", &mut self.alerts.performance),
            ("STEAMWATCH_TOPIC_SYSTEM", &mut self.alerts.system),
            ("STEAMWATCH_TOPIC_AUTH", &mut self.alerts.auth),
        ] {
            if let Ok(v) = std::env::var(name) {
                if let Ok(id) = v.parse::<i64>() {
                    channel.topic_id = id;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Derived views
    // -------------------------------------------------------------------------

    /// The closed alert channel table, fixed for the life of the process.
    pub fn channel_table(&self) -> HashMap<AlertType, ChannelSpec> {
        let mut table = HashMap::new();
        for (alert_type, name, cfg) in [
            (AlertType::SteamAlerts, "steam", &self.alerts.steam),
            (AlertType::Performance, "performance", &self.alerts.performance),
            (AlertType::SystemHealth, "system", &self.alerts.system),
            (AlertType::AuthEvents, "auth", &self.alerts.auth),
        ] {
            table.insert(
                alert_type,
                ChannelSpec {
                    name: name.to_string(),
                    topic_id: cfg.topic_id,
                    cooldown_ms: cfg.cooldown_ms,
                    severity_floor: cfg.severity_floor,
                },
            );
        }
        table
    }

    /// Built-in detection table plus file-level overrides.
    pub fn steam_table(&self) -> SteamConfigTable {
        let mut table = SteamConfigTable::builtin();
        for over in &self.steam_overrides {
            let league = League::parse(&over.league);
            let odds_type = OddsType::parse(&over.odds_type);
            let mut config: SteamConfig = table.resolve(&league, odds_type).clone();
            if let Some(v) = over.velocity_threshold {
                config.velocity_threshold = v;
            }
            if let Some(v) = over.time_window_ms {
                config.time_window_ms = v;
            }
            if let Some(v) = over.volume_weight {
                config.volume_weight = v;
            }
            if let Some(v) = over.min_rapid_changes {
                config.min_rapid_changes = v;
            }
            table.set(league, odds_type, config);
        }
        table
    }

    /// Stream client settings for one channel group.
    pub fn stream_settings(&self, group_csv: &str) -> StreamSettings {
        StreamSettings {
            stream_url: self.stream_url.clone(),
            channels: group_csv
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            refresh_margin_ms: (self.refresh_margin_secs * 1_000) as i64,
            initial_delay_ms: self.reconnect_initial_ms,
            max_delay_ms: self.reconnect_max_ms,
            multiplier: self.reconnect_multiplier,
            max_attempts: self.reconnect_max_attempts,
            auth_retry_limit: self.auth_retry_limit,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.heartbeat_secs, 30);
        assert_eq!(cfg.token_ttl_secs, 60);
        assert_eq!(cfg.refresh_margin_secs, 5);
        assert_eq!(cfg.reconnect_initial_ms, 1_000);
        assert_eq!(cfg.reconnect_max_ms, 60_000);
        assert!((cfg.reconnect_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(cfg.reconnect_max_attempts.is_none());
        assert_eq!(cfg.channel_groups.len(), 1);
        assert_eq!(cfg.alerts.steam.cooldown_ms, 30_000);
        assert_eq!(cfg.alerts.auth.severity_floor, Severity::Critical);
        assert_eq!(cfg.audit_retention_days, 7);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.connect_timeout_secs, 10);
        assert_eq!(cfg.alerts.performance.severity_floor, Severity::Warning);
        assert_eq!(cfg.stall_after_secs, 120);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "stream_url": "wss://example.test/stream",
            "channel_groups": ["change_xml,ch_goal8_xml"],
            "alerts": { "steam": { "topic_id": 42 } }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.stream_url, "wss://example.test/stream");
        assert_eq!(cfg.alerts.steam.topic_id, 42);
        // Unspecified steam channel fields fall back to their defaults.
        assert_eq!(cfg.alerts.steam.severity_floor, Severity::Info);
        assert_eq!(cfg.alerts.performance.cooldown_ms, 60_000);
        assert_eq!(cfg.heartbeat_secs, 30);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.stream_url, cfg2.stream_url);
        assert_eq!(cfg.channel_groups, cfg2.channel_groups);
        assert_eq!(cfg.alerts.steam.cooldown_ms, cfg2.alerts.steam.cooldown_ms);
    }

    #[test]
    fn save_and_load_are_atomic_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steamwatch.json");

        let mut cfg = RuntimeConfig::default();
        cfg.alerts.steam.topic_id = 7;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.alerts.steam.topic_id, 7);
        assert!(!dir.path().join("steamwatch.json.tmp").exists());
    }

    #[test]
    fn channel_table_is_closed_over_alert_types() {
        let table = RuntimeConfig::default().channel_table();
        assert_eq!(table.len(), 4);
        assert!(table.contains_key(&AlertType::SteamAlerts));
        assert!(table.contains_key(&AlertType::AuthEvents));
    }

    #[test]
    fn steam_overrides_patch_the_builtin_table() {
        let json = r#"{
            "steam_overrides": [
                { "league": "NBA", "odds_type": "total", "velocity_threshold": 0.05 }
            ]
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        let table = cfg.steam_table();
        let patched = table.resolve(&League::Nba, OddsType::Total);
        assert!((patched.velocity_threshold - 0.05).abs() < f64::EPSILON);
        // Untouched fields keep their defaults.
        assert_eq!(patched.time_window_ms, 60_000);
        // Other pairs are unaffected.
        let untouched = table.resolve(&League::Nba, OddsType::Spread);
        assert!((untouched.velocity_threshold - 0.03).abs() < f64::EPSILON);
    }

    #[test]
    fn stream_settings_split_the_channel_csv() {
        let cfg = RuntimeConfig::default();
        let settings = cfg.stream_settings("nba_change_xml, ch_nbaGoal8_xml");
        assert_eq!(
            settings.channels,
            vec!["nba_change_xml".to_string(), "ch_nbaGoal8_xml".to_string()]
        );
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.refresh_margin_ms, 5_000);
    }
}
