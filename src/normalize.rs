// =============================================================================
// Odds Normalizer — heterogeneous upstream payloads to canonical ticks
// =============================================================================
//
// The upstream speaks two dialects (XML with attribute- or element-style
// fields, JSON with several historical field spellings) and both change
// shape between provider versions. Everything funnels through here into one
// canonical Tick; missing fields get explicit defaults and a tick whose old
// value is zero is dropped before it can poison the velocity math.
// =============================================================================

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::clock::Clock;
use crate::types::{League, Market, OddsType, PlayerProp, Tick};

#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The tick would violate the `old_value > 0` invariant.
    #[error("tick for game '{0}' has a zero old value")]
    ZeroBaseline(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("xml parse failed: {0}")]
    Xml(#[from] roxmltree::Error),
}

// Accepted field spellings, canonical first.
const GAME_ID: &[&str] = &["gameId", "game_id", "id"];
const BOOKMAKER: &[&str] = &["bookmakerId", "bookmaker_id", "bookmaker", "book"];
const ODDS_TYPE: &[&str] = &["type", "oddsType", "odds_type", "marketType"];
const OLD_VALUE: &[&str] = &["old", "oldValue", "old_value", "prev"];
const NEW_VALUE: &[&str] = &["new", "newValue", "new_value", "current"];
const TIMESTAMP: &[&str] = &["time", "timestamp", "ts"];
const VOLUME: &[&str] = &["volume", "vol"];
const HOME: &[&str] = &["home", "homeTeam", "home_team"];
const AWAY: &[&str] = &["away", "awayTeam", "away_team"];
const LEAGUE: &[&str] = &["league", "competition"];
const PLAYER_ID: &[&str] = &["playerId", "player_id"];
const PLAYER_NAME: &[&str] = &["playerName", "player_name", "player"];
const STAT_TYPE: &[&str] = &["statType", "stat_type", "stat"];

pub struct Normalizer {
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl Normalizer {
    pub fn new(clock: Arc<dyn Clock>, audit: AuditSink) -> Self {
        Self { clock, audit }
    }

    // -------------------------------------------------------------------------
    // JSON entry point
    // -------------------------------------------------------------------------

    pub fn from_json(&self, obj: &Value, audit_tag: &str) -> Result<Tick, NormalizeError> {
        let map = obj.as_object().ok_or(NormalizeError::NotAnObject)?;

        let game_id = json_str(map, GAME_ID).unwrap_or_else(|| "unknown".to_string());
        let bookmaker_id =
            json_str(map, BOOKMAKER).unwrap_or_else(|| "unknown".to_string());
        let odds_type =
            OddsType::parse(&json_str(map, ODDS_TYPE).unwrap_or_default());
        let old_value = json_f64(map, OLD_VALUE).unwrap_or(0.0);
        let new_value = json_f64(map, NEW_VALUE).unwrap_or(0.0);
        let timestamp = json_i64(map, TIMESTAMP).unwrap_or_else(|| self.clock.now_ms());

        // Market context: nested object preferred, flat fields tolerated.
        let market_src = map.get("market").and_then(Value::as_object).unwrap_or(map);
        let market = Market {
            home_team: json_str(market_src, HOME).unwrap_or_default(),
            away_team: json_str(market_src, AWAY).unwrap_or_default(),
            league: League::parse(&json_str(market_src, LEAGUE).unwrap_or_default()),
        };

        let player = if odds_type == OddsType::PlayerProp {
            Some(PlayerProp {
                player_id: json_str(map, PLAYER_ID).unwrap_or_default(),
                player_name: json_str(map, PLAYER_NAME).unwrap_or_default(),
                stat_type: json_str(map, STAT_TYPE).unwrap_or_default(),
            })
        } else {
            None
        };

        self.finish(Tick {
            game_id,
            bookmaker_id,
            odds_type,
            old_value,
            new_value,
            timestamp,
            market,
            audit: audit_tag.to_string(),
            volume: json_f64(map, VOLUME),
            player,
        })
    }

    // -------------------------------------------------------------------------
    // XML entry points
    // -------------------------------------------------------------------------

    /// Normalize one XML document. Provider batches arrive as a container
    /// element wrapping tick-shaped children; single-tick documents put the
    /// fields straight on the root. Ticks that fail the zero-baseline check
    /// are dropped individually, not the whole document.
    pub fn from_xml(&self, xml: &str, audit_tag: &str) -> Result<Vec<Tick>, NormalizeError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc.root_element();

        let children: Vec<roxmltree::Node> = root
            .children()
            .filter(|n| n.is_element() && looks_like_tick(n))
            .collect();

        let nodes: Vec<roxmltree::Node> = if children.is_empty() {
            vec![root]
        } else {
            children
        };

        let mut ticks = Vec::with_capacity(nodes.len());
        for node in nodes {
            match self.from_xml_node(&node, audit_tag) {
                Ok(tick) => ticks.push(tick),
                Err(NormalizeError::ZeroBaseline(_)) => {} // already audited
                Err(e) => warn!(error = %e, "xml tick skipped"),
            }
        }
        Ok(ticks)
    }

    /// Normalize a single XML element carrying tick fields as attributes or
    /// child elements.
    pub fn from_xml_node(
        &self,
        node: &roxmltree::Node,
        audit_tag: &str,
    ) -> Result<Tick, NormalizeError> {
        let game_id =
            xml_field(node, GAME_ID).unwrap_or_else(|| "unknown".to_string());
        let bookmaker_id =
            xml_field(node, BOOKMAKER).unwrap_or_else(|| "unknown".to_string());
        let odds_type = OddsType::parse(&xml_field(node, ODDS_TYPE).unwrap_or_default());
        let old_value = xml_f64(node, OLD_VALUE).unwrap_or(0.0);
        let new_value = xml_f64(node, NEW_VALUE).unwrap_or(0.0);
        let timestamp = xml_i64(node, TIMESTAMP).unwrap_or_else(|| self.clock.now_ms());

        // Market context: a <market> child when present, else the node itself.
        let market_node = node
            .children()
            .find(|n| n.is_element() && n.has_tag_name("market"));
        let market_src = market_node.as_ref().unwrap_or(node);
        let market = Market {
            home_team: xml_field(market_src, HOME).unwrap_or_default(),
            away_team: xml_field(market_src, AWAY).unwrap_or_default(),
            league: League::parse(&xml_field(market_src, LEAGUE).unwrap_or_default()),
        };

        let player = if odds_type == OddsType::PlayerProp {
            Some(PlayerProp {
                player_id: xml_field(node, PLAYER_ID).unwrap_or_default(),
                player_name: xml_field(node, PLAYER_NAME).unwrap_or_default(),
                stat_type: xml_field(node, STAT_TYPE).unwrap_or_default(),
            })
        } else {
            None
        };

        self.finish(Tick {
            game_id,
            bookmaker_id,
            odds_type,
            old_value,
            new_value,
            timestamp,
            market,
            audit: audit_tag.to_string(),
            volume: xml_f64(node, VOLUME),
            player,
        })
    }

    // -------------------------------------------------------------------------
    // Shared tail
    // -------------------------------------------------------------------------

    fn finish(&self, tick: Tick) -> Result<Tick, NormalizeError> {
        if !(tick.old_value > 0.0) || !tick.old_value.is_finite() || !tick.new_value.is_finite()
        {
            self.audit.submit(
                AuditRecord::new("NORMALIZE_DROPPED", "normalizer")
                    .field_str("gameId", tick.game_id.clone())
                    .field_str("reason", "zero-or-nonfinite baseline")
                    .field_str("source", tick.audit.clone()),
            );
            return Err(NormalizeError::ZeroBaseline(tick.game_id));
        }

        let mut record = AuditRecord::new("TICK_NORMALIZED", "normalizer")
            .field_str("gameId", tick.game_id.clone())
            .field_str("bookmakerId", tick.bookmaker_id.clone())
            .field_str("oddsType", tick.odds_type.to_string())
            .field("velocity", serde_json::json!(tick.velocity()))
            .field_str("source", tick.audit.clone());
        if let Some(v) = tick.volume {
            record = record.field("volume", serde_json::json!(v));
        }
        self.audit.submit(record);

        debug!(
            game_id = %tick.game_id,
            bookmaker_id = %tick.bookmaker_id,
            odds_type = %tick.odds_type,
            "tick normalized"
        );
        Ok(tick)
    }
}

// =============================================================================
// Field extraction helpers
// =============================================================================

fn json_str(map: &serde_json::Map<String, Value>, names: &[&str]) -> Option<String> {
    for name in names {
        match map.get(*name) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Numbers may arrive as JSON numbers or numeric strings depending on the
/// provider version.
fn json_f64(map: &serde_json::Map<String, Value>, names: &[&str]) -> Option<f64> {
    for name in names {
        match map.get(*name) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<f64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

fn json_i64(map: &serde_json::Map<String, Value>, names: &[&str]) -> Option<i64> {
    for name in names {
        match map.get(*name) {
            Some(Value::Number(n)) => return n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<i64>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

/// Attribute-prefixed or element-style: attributes win, then a child element
/// with the same tag name.
fn xml_field(node: &roxmltree::Node, names: &[&str]) -> Option<String> {
    for name in names {
        if let Some(value) = node.attribute(*name) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    for name in names {
        if let Some(child) = node
            .children()
            .find(|n| n.is_element() && n.has_tag_name(*name))
        {
            if let Some(text) = child.text() {
                let text = text.trim();
                if !text.is_empty() {
                    return Some(text.to_string());
                }
            }
        }
    }
    None
}

fn xml_f64(node: &roxmltree::Node, names: &[&str]) -> Option<f64> {
    xml_field(node, names).and_then(|s| s.parse().ok())
}

fn xml_i64(node: &roxmltree::Node, names: &[&str]) -> Option<i64> {
    xml_field(node, names).and_then(|s| s.parse().ok())
}

fn looks_like_tick(node: &roxmltree::Node) -> bool {
    xml_field(node, OLD_VALUE).is_some() || xml_field(node, GAME_ID).is_some()
}

// =============================================================================
// Tests
// =============================================================================
