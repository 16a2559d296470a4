// =============================================================================
// Steam Detector — sliding-window classification of abnormal odds movement
// =============================================================================
//
// Two rules, checked in order:
//
//   Rule A (single large move): velocity >= 0.10 fires immediately.
//   Rule B (rapid cluster):     >= min_rapid_changes window entries at or
//                               above the league threshold; steam index
//                               0.7 * avg_velocity * 100
//                                 + 0.3 * normalized_volume * volume_weight * 10
//                               fires at >= 1.5.
//
// Rule A takes precedence. Detection is idempotent per (key, timestamp):
// a replayed tick neither re-enters the window nor re-emits. The detector is
// single-owner; callers drive it from one task.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audit::{AuditRecord, AuditSink};
use crate::clock::Clock;
use crate::types::{League, Market, OddsType, Tick, TickKey};

/// Rule A trigger: a single move of 10 % or more.
pub const LARGE_SINGLE_VELOCITY: f64 = 0.10;

/// Rule B trigger on the steam index.
pub const STEAM_INDEX_THRESHOLD: f64 = 1.5;

/// Volume normalization ceiling.
const VOLUME_NORM: f64 = 10_000.0;

// =============================================================================
// Configuration
// =============================================================================

/// Detection tuning for one (league, odds type) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteamConfig {
    /// Minimum velocity for an entry to count toward Rule B (fraction, 0.03 = 3 %).
    pub velocity_threshold: f64,
    /// Sliding window length in milliseconds.
    pub time_window_ms: i64,
    /// Weight of the volume term in the steam index, 0..=1.
    pub volume_weight: f64,
    /// Minimum qualifying entries before Rule B can fire.
    pub min_rapid_changes: usize,
}

impl Default for SteamConfig {
    fn default() -> Self {
        Self {
            velocity_threshold: 0.03,
            time_window_ms: 60_000,
            volume_weight: 0.5,
            min_rapid_changes: 3,
        }
    }
}

impl SteamConfig {
    /// Per-key window bound; oldest entries are dropped beyond this.
    pub fn window_cap(&self) -> usize {
        (self.min_rapid_changes * 4).max(16)
    }
}

/// Sport-aware configuration table with a default fallback.
#[derive(Debug, Clone, Default)]
pub struct SteamConfigTable {
    overrides: HashMap<(League, OddsType), SteamConfig>,
    fallback: SteamConfig,
}

impl SteamConfigTable {
    /// Built-in tuning: NBA books are sharp (default 3 %), college lines are
    /// noisier so WNCAAB needs a wider threshold, EuroLeague sits between.
    pub fn builtin() -> Self {
        let mut overrides = HashMap::new();
        for odds_type in [
            OddsType::Moneyline,
            OddsType::Spread,
            OddsType::Total,
            OddsType::PlayerProp,
        ] {
            overrides.insert(
                (League::Wncaab, odds_type),
                SteamConfig {
                    velocity_threshold: 0.04,
                    time_window_ms: 45_000,
                    ..SteamConfig::default()
                },
            );
            overrides.insert(
                (League::EuroLeague, odds_type),
                SteamConfig {
                    velocity_threshold: 0.035,
                    ..SteamConfig::default()
                },
            );
        }
        Self {
            overrides,
            fallback: SteamConfig::default(),
        }
    }

    pub fn set(&mut self, league: League, odds_type: OddsType, config: SteamConfig) {
        self.overrides.insert((league, odds_type), config);
    }

    pub fn resolve(&self, league: &League, odds_type: OddsType) -> &SteamConfig {
        self.overrides
            .get(&(league.clone(), odds_type))
            .unwrap_or(&self.fallback)
    }
}

// =============================================================================
// Events
// =============================================================================

/// One retained observation inside a key's sliding window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowEntry {
    pub timestamp: i64,
    pub bookmaker_id: String,
    pub odds: f64,
    pub velocity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SteamEventKind {
    LargeSingle,
    MultiRapid,
}

impl std::fmt::Display for SteamEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LargeSingle => write!(f, "LARGE_SINGLE"),
            Self::MultiRapid => write!(f, "MULTI_RAPID"),
        }
    }
}

/// Emitted steam detection, carrying the window snapshot for forensics.
#[derive(Debug, Clone, Serialize)]
pub struct SteamEvent {
    pub kind: SteamEventKind,
    pub game_id: String,
    pub bookmaker_id: String,
    pub odds_type: OddsType,
    pub market: Market,
    pub velocity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam_index: Option<f64>,
    pub line_movement: f64,
    pub old_value: f64,
    pub new_value: f64,
    pub timestamp: i64,
    pub window: Vec<WindowEntry>,
}

// =============================================================================
// Detector
// =============================================================================

pub struct SteamDetector {
    table: SteamConfigTable,
    windows: HashMap<TickKey, VecDeque<WindowEntry>>,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl SteamDetector {
    pub fn new(table: SteamConfigTable, clock: Arc<dyn Clock>, audit: AuditSink) -> Self {
        Self {
            table,
            windows: HashMap::new(),
            clock,
            audit,
        }
    }

    /// Feed one tick; returns a steam event when either rule fires.
    pub fn process(&mut self, tick: &Tick) -> Option<SteamEvent> {
        if tick.old_value <= 0.0 {
            // The normalizer enforces this; a violation here is a bug upstream
            // of the detector, not a detection.
            return None;
        }

        let key = tick.key();
        let config = self
            .table
            .resolve(&tick.market.league, tick.odds_type)
            .clone();
        let velocity = tick.velocity();
        let now = self.clock.now_ms();

        let window = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| VecDeque::with_capacity(config.window_cap()));

        // Strict eviction: an entry aged exactly time_window is gone.
        while window
            .front()
            .is_some_and(|e| now - e.timestamp >= config.time_window_ms)
        {
            window.pop_front();
        }

        // Idempotence: a replayed (key, timestamp) pair never re-enters or
        // re-emits.
        if window
            .iter()
            .any(|e| e.timestamp == tick.timestamp && e.odds == tick.new_value)
        {
            debug!(key = %key, timestamp = tick.timestamp, "duplicate tick ignored");
            return None;
        }

        window.push_back(WindowEntry {
            timestamp: tick.timestamp,
            bookmaker_id: tick.bookmaker_id.clone(),
            odds: tick.new_value,
            velocity,
            volume: tick.volume,
        });

        if window.len() > config.window_cap() {
            window.pop_front();
            self.audit.submit(
                AuditRecord::new("DETECTOR_OVERFLOW", "detector")
                    .field_str("key", key.to_string())
                    .field("cap", serde_json::json!(config.window_cap())),
            );
        }

        // Rule A takes precedence over Rule B.
        if velocity >= LARGE_SINGLE_VELOCITY {
            let event = self.emit(tick, SteamEventKind::LargeSingle, velocity, None, &key);
            return Some(event);
        }

        let rapid: Vec<&WindowEntry> = window
            .iter()
            .filter(|e| e.velocity >= config.velocity_threshold)
            .collect();
        if rapid.len() >= config.min_rapid_changes {
            let avg_velocity =
                rapid.iter().map(|e| e.velocity).sum::<f64>() / rapid.len() as f64;

            let volumes: Vec<f64> = rapid.iter().filter_map(|e| e.volume).collect();
            let volume_score = if volumes.is_empty() {
                0.0
            } else {
                let avg_volume = volumes.iter().sum::<f64>() / volumes.len() as f64;
                (avg_volume / VOLUME_NORM).min(1.0)
            };

            let index = 0.7 * avg_velocity * 100.0
                + 0.3 * volume_score * config.volume_weight * 10.0;

            if index >= STEAM_INDEX_THRESHOLD {
                let event =
                    self.emit(tick, SteamEventKind::MultiRapid, velocity, Some(index), &key);
                return Some(event);
            }
        }

        None
    }

    fn emit(
        &mut self,
        tick: &Tick,
        kind: SteamEventKind,
        velocity: f64,
        steam_index: Option<f64>,
        key: &TickKey,
    ) -> SteamEvent {
        let snapshot: Vec<WindowEntry> = self
            .windows
            .get(key)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default();

        info!(
            key = %key,
            kind = %kind,
            velocity = format!("{velocity:.4}"),
            steam_index = ?steam_index,
            "steam detected"
        );
        self.audit.submit(
            AuditRecord::new("STEAM_DETECTED", "detector")
                .field_str("key", key.to_string())
                .field_str("kind", kind.to_string())
                .field("velocity", serde_json::json!(velocity))
                .field("steamIndex", serde_json::json!(steam_index))
                .field("windowLen", serde_json::json!(snapshot.len())),
        );

        SteamEvent {
            kind,
            game_id: tick.game_id.clone(),
            bookmaker_id: tick.bookmaker_id.clone(),
            odds_type: tick.odds_type,
            market: tick.market.clone(),
            velocity,
            steam_index,
            line_movement: tick.line_movement(),
            old_value: tick.old_value,
            new_value: tick.new_value,
            timestamp: tick.timestamp,
            window: snapshot,
        }
    }

    /// Periodic memory bound: evict expired entries everywhere and drop keys
    /// whose windows emptied. Returns the number of keys removed.
    pub fn cleanup(&mut self) -> usize {
        let now = self.clock.now_ms();
        let before = self.windows.len();

        // The fallback window is the cleanup horizon for every key; per-league
        // windows are enforced at process() time.
        let time_window = self.table.fallback.time_window_ms;
        self.windows.retain(|_key, window| {
            while window
                .front()
                .is_some_and(|e| now - e.timestamp >= time_window)
            {
                window.pop_front();
            }
            !window.is_empty()
        });

        let removed = before - self.windows.len();
        if removed > 0 {
            debug!(removed, remaining = self.windows.len(), "detector cleanup");
        }
        removed
    }

    #[cfg(test)]
    fn window_len(&self, key: &TickKey) -> usize {
        self.windows.get(key).map(|w| w.len()).unwrap_or(0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const T0: i64 = 1_700_000_000_000;

    fn tick(game: &str, old: f64, new: f64, odds_type: OddsType, ts: i64) -> Tick {
        Tick {
            game_id: game.to_string(),
            bookmaker_id: "BK1".to_string(),
            odds_type,
            old_value: old,
            new_value: new,
            timestamp: ts,
            market: Market {
                home_team: "A".to_string(),
                away_team: "B".to_string(),
                league: League::Nba,
            },
            audit: "test".to_string(),
            volume: None,
            player: None,
        }
    }

    fn detector(clock: &Arc<ManualClock>) -> SteamDetector {
        SteamDetector::new(
            SteamConfigTable::builtin(),
            clock.clone() as Arc<dyn Clock>,
            AuditSink::disabled(clock.clone() as Arc<dyn Clock>),
        )
    }

    #[test]
    fn ordinary_move_stays_quiet() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        // Scenario 1: velocity ~0.0263 on a single tick.
        let t = tick("G1", 1.90, 1.85, OddsType::Moneyline, T0);
        assert!(d.process(&t).is_none());
    }

    #[test]
    fn rule_a_fires_at_exactly_ten_percent() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        let t = tick("G1", 2.00, 1.80, OddsType::Spread, T0);
        assert!((t.velocity() - 0.10).abs() < 1e-12);
        let event = d.process(&t).expect("boundary velocity fires");
        assert_eq!(event.kind, SteamEventKind::LargeSingle);
        assert!(event.steam_index.is_none());
    }

    #[test]
    fn rule_a_large_spread_move() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        // Scenario 2: 2.00 -> 1.70 is a 15 % move.
        let t = tick("G1", 2.00, 1.70, OddsType::Spread, T0);
        let event = d.process(&t).unwrap();
        assert_eq!(event.kind, SteamEventKind::LargeSingle);
        assert!((event.velocity - 0.15).abs() < 1e-12);
        assert!((event.line_movement + 0.30).abs() < 1e-9);
    }

    #[test]
    fn rule_b_rapid_cluster_without_volume() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        // Scenario 3: velocities 0.04 / 0.035 / 0.045 inside 1.2 s.
        let ticks = [
            tick("G2", 10.0, 10.40, OddsType::Total, T0),
            tick("G2", 10.0, 10.35, OddsType::Total, T0 + 600),
            tick("G2", 10.0, 10.45, OddsType::Total, T0 + 1_200),
        ];
        assert!(d.process(&ticks[0]).is_none());
        clock.set(T0 + 600);
        assert!(d.process(&ticks[1]).is_none());
        clock.set(T0 + 1_200);
        let event = d.process(&ticks[2]).expect("third tick fires");
        assert_eq!(event.kind, SteamEventKind::MultiRapid);
        // avg velocity 0.04 -> index 0.7 * 4.0 = 2.8.
        let index = event.steam_index.unwrap();
        assert!((index - 2.8).abs() < 1e-9);
        assert_eq!(event.window.len(), 3);
    }

    #[test]
    fn rule_b_volume_term_raises_index() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        for (i, new) in [10.40, 10.35, 10.45].iter().enumerate() {
            let ts = T0 + (i as i64) * 400;
            clock.set(ts);
            let mut t = tick("G7", 10.0, *new, OddsType::Total, ts);
            t.volume = Some(20_000.0);
            let result = d.process(&t);
            if i == 2 {
                // volume_score saturates at 1.0; default weight 0.5 adds
                // 0.3 * 1.0 * 0.5 * 10 = 1.5 to the velocity term.
                let index = result.unwrap().steam_index.unwrap();
                assert!((index - (2.8 + 1.5)).abs() < 1e-9);
            } else {
                assert!(result.is_none());
            }
        }
    }

    #[test]
    fn rule_a_takes_precedence_over_rule_b() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        for i in 0..2 {
            let ts = T0 + i * 100;
            clock.set(ts);
            d.process(&tick("G8", 10.0, 10.4, OddsType::Total, ts));
        }
        clock.set(T0 + 200);
        // Third tick qualifies for Rule B and crosses Rule A.
        let event = d
            .process(&tick("G8", 10.0, 11.5, OddsType::Total, T0 + 200))
            .unwrap();
        assert_eq!(event.kind, SteamEventKind::LargeSingle);
    }

    #[test]
    fn window_eviction_is_strict_at_the_boundary() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        let key = tick("G9", 10.0, 10.4, OddsType::Total, T0).key();

        d.process(&tick("G9", 10.0, 10.4, OddsType::Total, T0));
        assert_eq!(d.window_len(&key), 1);

        // Default NBA window is 60 s. An entry aged exactly 60 s is evicted.
        clock.set(T0 + 60_000);
        d.process(&tick("G9", 10.0, 10.35, OddsType::Total, T0 + 60_000));
        assert_eq!(d.window_len(&key), 1, "boundary-aged entry must be gone");
    }

    #[test]
    fn replayed_tick_is_idempotent() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        let t = tick("G1", 2.00, 1.70, OddsType::Spread, T0);
        assert!(d.process(&t).is_some());
        // Identical (key, timestamp, values): no second emission, no growth.
        assert!(d.process(&t).is_none());
        assert_eq!(d.window_len(&t.key()), 1);
    }

    #[test]
    fn window_is_bounded_with_oldest_dropped() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        let key = tick("G10", 100.0, 100.1, OddsType::Total, T0).key();
        let cap = SteamConfig::default().window_cap();

        for i in 0..(cap as i64 + 8) {
            let ts = T0 + i * 10;
            clock.set(ts);
            // Velocity 0.001: never qualifies, only fills the window.
            d.process(&tick("G10", 100.0, 100.1, OddsType::Total, ts));
        }
        assert_eq!(d.window_len(&key), cap);
    }

    #[test]
    fn cleanup_removes_emptied_keys() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        d.process(&tick("G11", 10.0, 10.05, OddsType::Total, T0));
        assert_eq!(d.cleanup(), 0, "live window is retained");

        clock.set(T0 + 10 * 60_000);
        assert_eq!(d.cleanup(), 1, "expired window drops its key");
    }

    #[test]
    fn wncaab_threshold_is_wider() {
        let table = SteamConfigTable::builtin();
        let wncaab = table.resolve(&League::Wncaab, OddsType::Total);
        let nba = table.resolve(&League::Nba, OddsType::Total);
        assert!(wncaab.velocity_threshold > nba.velocity_threshold);
    }

    #[test]
    fn snapshot_entries_are_inside_the_window() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = detector(&clock);
        for i in 0..3 {
            let ts = T0 + i * 400;
            clock.set(ts);
            if let Some(event) =
                d.process(&tick("G12", 10.0, 10.4, OddsType::Total, ts))
            {
                let config = SteamConfig::default();
                let now = clock.now_ms();
                for entry in &event.window {
                    assert!(now - entry.timestamp <= config.time_window_ms);
                }
            }
        }
    }
}
