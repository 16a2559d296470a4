// =============================================================================
// Shared types used across the steamwatch sentinel
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Odds taxonomy
// =============================================================================

/// Canonical odds market categories.
///
/// Upstream payloads spell these many different ways; [`OddsType::parse`]
/// folds them through a fixed normalization table. Unknown values map to
/// `Moneyline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OddsType {
    Moneyline,
    Spread,
    Total,
    PlayerProp,
}

impl OddsType {
    /// Normalize an upstream odds-type string (case-insensitive, punctuation
    /// stripped). Unknown spellings fall back to `Moneyline`.
    pub fn parse(raw: &str) -> Self {
        let folded: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        match folded.as_str() {
            "moneyline" | "ml" | "money" | "h2h" | "matchwinner" => Self::Moneyline,
            "spread" | "handicap" | "line" | "pointspread" | "ah" => Self::Spread,
            "total" | "totals" | "ou" | "overunder" | "points" => Self::Total,
            "playerprop" | "playerprops" | "prop" | "props" => Self::PlayerProp,
            _ => Self::Moneyline,
        }
    }
}

impl std::fmt::Display for OddsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Moneyline => write!(f, "moneyline"),
            Self::Spread => write!(f, "spread"),
            Self::Total => write!(f, "total"),
            Self::PlayerProp => write!(f, "player_prop"),
        }
    }
}

/// Leagues the detector carries tuned configurations for. Anything else is
/// kept verbatim in `Other` so the audit trail preserves what upstream sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum League {
    Wncaab,
    Nba,
    EuroLeague,
    Other(String),
}

impl League {
    pub fn parse(raw: &str) -> Self {
        let folded: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        match folded.as_str() {
            "wncaab" | "ncaaw" | "womenscollege" => Self::Wncaab,
            "nba" => Self::Nba,
            "euroleague" | "euro" => Self::EuroLeague,
            _ if raw.is_empty() => Self::Other("unknown".to_string()),
            _ => Self::Other(raw.to_string()),
        }
    }
}

impl std::fmt::Display for League {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wncaab => write!(f, "WNCAAB"),
            Self::Nba => write!(f, "NBA"),
            Self::EuroLeague => write!(f, "EuroLeague"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

// =============================================================================
// Canonical tick
// =============================================================================

/// Market context attached to every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub home_team: String,
    pub away_team: String,
    pub league: League,
}

/// Player-prop extension populated when upstream tags a tick as
/// `type="player_prop"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProp {
    pub player_id: String,
    pub player_name: String,
    pub stat_type: String,
}

/// One canonical odds observation: one bookmaker moved one market of one game.
///
/// Invariant: `old_value > 0` (it is the velocity denominator). The
/// normalizer drops any payload that would violate this before a `Tick` is
/// ever constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub game_id: String,
    pub bookmaker_id: String,
    pub odds_type: OddsType,
    pub old_value: f64,
    pub new_value: f64,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub market: Market,
    /// Provenance tag attached at decode time (wire format + channel).
    pub audit: String,
    /// Traded-volume hint; the upstream only sometimes provides it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerProp>,
}

impl Tick {
    /// Relative magnitude of the move: `|new − old| / old`.
    pub fn velocity(&self) -> f64 {
        if self.old_value <= 0.0 {
            return 0.0;
        }
        (self.new_value - self.old_value).abs() / self.old_value
    }

    /// Signed line movement in odds units.
    pub fn line_movement(&self) -> f64 {
        self.new_value - self.old_value
    }

    pub fn key(&self) -> TickKey {
        TickKey {
            game_id: self.game_id.clone(),
            bookmaker_id: self.bookmaker_id.clone(),
            odds_type: self.odds_type,
        }
    }
}

/// Structured detector key. Value equality, not string concatenation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TickKey {
    pub game_id: String,
    pub bookmaker_id: String,
    pub odds_type: OddsType,
}

impl std::fmt::Display for TickKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.game_id, self.bookmaker_id, self.odds_type)
    }
}

// =============================================================================
// Alerts
// =============================================================================

/// Alert severity tiers. Ordering matters: a channel's severity floor drops
/// anything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Info => "\u{2139}\u{fe0f}",
            Self::Warning => "\u{26a0}\u{fe0f}",
            Self::Critical => "\u{1f6a8}",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// The closed set of alert categories. Each maps to exactly one messaging
/// topic; the table is fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    SteamAlerts,
    Performance,
    SystemHealth,
    AuthEvents,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SteamAlerts => write!(f, "STEAM_ALERTS"),
            Self::Performance => write!(f, "PERFORMANCE"),
            Self::SystemHealth => write!(f, "SYSTEM_HEALTH"),
            Self::AuthEvents => write!(f, "AUTH_EVENTS"),
        }
    }
}

/// A notification on its way to the messaging platform.
#[derive(Debug, Clone)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            alert_type,
            severity,
            title: title.into(),
            message: message.into(),
            metadata: serde_json::Map::new(),
            timestamp,
        }
    }

    pub fn with_meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
