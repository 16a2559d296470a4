// =============================================================================
// Alert Dispatcher — channel-routed, cooldown-governed notification pipeline
// =============================================================================
//
// Every alert resolves to exactly one topic from a table fixed at startup,
// passes a severity floor and a per-type cooldown gate, and is formatted to
// HTML before hitting the messaging platform. Rate-limited sends are a
// normal outcome, not an error. Send failures never throw: they audit, fall
// back to stderr, and leave the cooldown clock untouched.
//
// Steam alerts that move a line a full point (or cross steam index 2.0) get
// pinned; the previous pin for the same match is unpinned first so the
// pinned-message map stays a bijection.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use chrono_tz::America::New_York;
use tracing::{debug, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::clock::Clock;
use crate::steam::{SteamEvent, SteamEventKind};
use crate::types::{Alert, AlertType, Severity};

/// Line movement (in odds units) at or above which a steam alert is pinned.
const PIN_LINE_MOVEMENT: f64 = 1.0;
/// Steam index above which a steam alert is pinned.
const PIN_STEAM_INDEX: f64 = 2.0;

// =============================================================================
// Messenger capability
// =============================================================================

/// Narrow capability interface over the messaging platform. The production
/// implementation is [`crate::telegram::TelegramClient`].
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver one HTML message to a topic; returns the platform message id.
    async fn send_message(
        &self,
        text: &str,
        thread_id: i64,
        disable_notification: bool,
    ) -> Result<i64>;

    async fn pin_message(&self, message_id: i64) -> Result<()>;

    async fn unpin_message(&self, message_id: i64) -> Result<()>;
}

// =============================================================================
// Channel table
// =============================================================================

/// One entry of the closed channel table.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub topic_id: i64,
    pub cooldown_ms: i64,
    pub severity_floor: Severity,
}

/// Outcome of a dispatch attempt. `sent == false` covers drops, cooldown
/// rejections, and delivery failures alike; `reason` says which.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub sent: bool,
    pub message_id: Option<i64>,
    pub reason: &'static str,
}

impl DispatchOutcome {
    fn skipped(reason: &'static str) -> Self {
        Self {
            sent: false,
            message_id: None,
            reason,
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

pub struct AlertDispatcher<M: Messenger> {
    messenger: M,
    channels: HashMap<AlertType, ChannelSpec>,
    deep_link_base: String,
    last_sent: HashMap<AlertType, i64>,
    pinned_by_match: HashMap<String, i64>,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl<M: Messenger> AlertDispatcher<M> {
    pub fn new(
        messenger: M,
        channels: HashMap<AlertType, ChannelSpec>,
        deep_link_base: impl Into<String>,
        clock: Arc<dyn Clock>,
        audit: AuditSink,
    ) -> Self {
        Self {
            messenger,
            channels,
            deep_link_base: deep_link_base.into(),
            last_sent: HashMap::new(),
            pinned_by_match: HashMap::new(),
            clock,
            audit,
        }
    }

    /// Route, gate, format, and deliver one alert.
    pub async fn send(&mut self, alert: &Alert) -> DispatchOutcome {
        let Some(channel) = self.channels.get(&alert.alert_type).cloned() else {
            self.audit.submit(
                AuditRecord::new("ALERT_UNKNOWN_TYPE", "dispatcher")
                    .field_str("type", alert.alert_type.to_string()),
            );
            return DispatchOutcome::skipped("unknown-type");
        };

        if alert.severity < channel.severity_floor {
            debug!(
                alert_type = %alert.alert_type,
                severity = %alert.severity,
                floor = %channel.severity_floor,
                "alert below channel severity floor"
            );
            return DispatchOutcome::skipped("below-severity-floor");
        }

        let now = self.clock.now_ms();
        if channel.cooldown_ms > 0 {
            if let Some(last) = self.last_sent.get(&alert.alert_type) {
                let elapsed = now - last;
                if elapsed < channel.cooldown_ms {
                    debug!(
                        alert_type = %alert.alert_type,
                        elapsed_ms = elapsed,
                        cooldown_ms = channel.cooldown_ms,
                        "alert rate-limited"
                    );
                    return DispatchOutcome::skipped("cooldown");
                }
            }
        }

        let html = self.format_html(alert, &channel);
        let silent = alert.severity == Severity::Info;

        match self
            .messenger
            .send_message(&html, channel.topic_id, silent)
            .await
        {
            Ok(message_id) => {
                self.last_sent.insert(alert.alert_type, now);
                self.audit.submit(
                    AuditRecord::new("ALERT_SENT", "dispatcher")
                        .field_str("type", alert.alert_type.to_string())
                        .field_str("severity", alert.severity.to_string())
                        .field("messageId", serde_json::json!(message_id)),
                );

                if alert.alert_type == AlertType::SteamAlerts && should_pin(alert) {
                    self.pin(alert, message_id).await;
                }

                DispatchOutcome {
                    sent: true,
                    message_id: Some(message_id),
                    reason: "sent",
                }
            }
            Err(e) => {
                // AlertSendFailed: audit + stderr, no retry, cooldown untouched.
                self.audit.submit(
                    AuditRecord::new("TELEGRAM_SEND_FAILED", "dispatcher")
                        .field_str("type", alert.alert_type.to_string())
                        .field_str("error", e.to_string()),
                );
                eprintln!(
                    "[alert-send-failed] {} {}: {e}",
                    alert.alert_type, alert.title
                );
                DispatchOutcome::skipped("send-failed")
            }
        }
    }

    /// Build and send the notification for a steam event.
    pub async fn dispatch_steam(&mut self, event: &SteamEvent) -> DispatchOutcome {
        let severity = match event.kind {
            SteamEventKind::LargeSingle => Severity::Critical,
            SteamEventKind::MultiRapid => {
                if event.steam_index.unwrap_or(0.0) > PIN_STEAM_INDEX {
                    Severity::Critical
                } else {
                    Severity::Warning
                }
            }
        };

        let title = format!(
            "Steam: {} @ {} ({})",
            event.market.away_team, event.market.home_team, event.market.league
        );
        let message = match event.kind {
            SteamEventKind::LargeSingle => format!(
                "Single large move on {}: {:.2} → {:.2} ({:+.1}%)",
                event.odds_type,
                event.old_value,
                event.new_value,
                event.velocity * 100.0 * event.line_movement.signum()
            ),
            SteamEventKind::MultiRapid => format!(
                "Rapid cluster on {}: {} moves in window, index {:.2}",
                event.odds_type,
                event.window.len(),
                event.steam_index.unwrap_or(0.0)
            ),
        };

        let mut alert = Alert::new(
            AlertType::SteamAlerts,
            severity,
            title,
            message,
            event.timestamp,
        )
        .with_meta("matchId", serde_json::json!(event.game_id))
        .with_meta("bookmaker", serde_json::json!(event.bookmaker_id))
        .with_meta("oddsType", serde_json::json!(event.odds_type.to_string()))
        .with_meta(
            "velocity",
            serde_json::json!(format!("{:.2}%", event.velocity * 100.0)),
        )
        .with_meta("lineMovement", serde_json::json!(event.line_movement));
        if let Some(index) = event.steam_index {
            alert = alert.with_meta("steamIndex", serde_json::json!(index));
        }

        self.send(&alert).await
    }

    /// Current pin for a match, if any.
    pub fn pinned_message(&self, match_id: &str) -> Option<i64> {
        self.pinned_by_match.get(match_id).copied()
    }

    async fn pin(&mut self, alert: &Alert, message_id: i64) {
        let Some(match_id) = alert
            .metadata
            .get("matchId")
            .or_else(|| alert.metadata.get("gameId"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return;
        };

        // Keep pinned_by_match a bijection: retire the previous pin first.
        if let Some(previous) = self.pinned_by_match.get(&match_id).copied() {
            if let Err(e) = self.messenger.unpin_message(previous).await {
                warn!(match_id = %match_id, message_id = previous, error = %e, "unpin failed");
            }
        }

        match self.messenger.pin_message(message_id).await {
            Ok(()) => {
                self.pinned_by_match.insert(match_id.clone(), message_id);
                self.audit.submit(
                    AuditRecord::new("MESSAGE_PINNED", "dispatcher")
                        .field_str("matchId", match_id)
                        .field("messageId", serde_json::json!(message_id)),
                );
            }
            Err(e) => {
                self.audit.submit(
                    AuditRecord::new("PIN_FAILED", "dispatcher")
                        .field_str("matchId", match_id)
                        .field_str("error", e.to_string()),
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Formatting
    // -------------------------------------------------------------------------

    /// Render one alert to Telegram HTML. All user-controlled fields are
    /// escaped; timestamps are shown in New York wall-clock and UTC.
    fn format_html(&self, alert: &Alert, channel: &ChannelSpec) -> String {
        let mut out = String::with_capacity(512);

        out.push_str(&format!(
            "{} <b>{}</b>\n",
            alert.severity.emoji(),
            escape_html(&alert.title)
        ));
        out.push_str(&format!("{}\n\n", escape_html(&alert.message)));

        for (key, value) in &alert.metadata {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!(
                "<b>{}:</b> {}\n",
                escape_html(key),
                escape_html(&rendered)
            ));
        }

        let match_id = alert
            .metadata
            .get("matchId")
            .or_else(|| alert.metadata.get("gameId"))
            .and_then(|v| v.as_str());
        if let (Some(id), false) = (match_id, self.deep_link_base.is_empty()) {
            out.push_str(&format!(
                "<a href=\"{}/{}\">Match feed</a>\n",
                self.deep_link_base,
                escape_html(id)
            ));
        }

        let utc = DateTime::from_timestamp_millis(alert.timestamp)
            .unwrap_or_else(|| DateTime::from_timestamp_millis(0).unwrap());
        let ny = utc.with_timezone(&New_York);
        out.push_str(&format!(
            "<i>{} ET / {} UTC · {}</i>",
            ny.format("%Y-%m-%d %I:%M:%S %p"),
            utc.format("%Y-%m-%d %H:%M:%S"),
            channel.name
        ));

        out
    }
}

/// Pin when the line moved a full point or the steam index crossed 2.0.
fn should_pin(alert: &Alert) -> bool {
    let line_movement = alert
        .metadata
        .get("lineMovement")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    let steam_index = alert
        .metadata
        .get("steamIndex")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    line_movement.abs() >= PIN_LINE_MOVEMENT || steam_index > PIN_STEAM_INDEX
}

/// Minimal HTML escaping for Telegram's HTML parse mode.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{League, Market, OddsType};
    use parking_lot::Mutex;

    const T0: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct MockMessenger {
        sent: Mutex<Vec<(String, i64, bool)>>,
        pinned: Mutex<Vec<i64>>,
        unpinned: Mutex<Vec<i64>>,
        fail_sends: std::sync::atomic::AtomicBool,
        next_id: std::sync::atomic::AtomicI64,
    }

    impl MockMessenger {
        fn failing() -> Self {
            let m = Self::default();
            m.fail_sends
                .store(true, std::sync::atomic::Ordering::SeqCst);
            m
        }
    }

    #[async_trait]
    impl Messenger for MockMessenger {
        async fn send_message(
            &self,
            text: &str,
            thread_id: i64,
            disable_notification: bool,
        ) -> Result<i64> {
            if self.fail_sends.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("HTTP 500");
            }
            self.sent
                .lock()
                .push((text.to_string(), thread_id, disable_notification));
            Ok(self
                .next_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                + 100)
        }

        async fn pin_message(&self, message_id: i64) -> Result<()> {
            self.pinned.lock().push(message_id);
            Ok(())
        }

        async fn unpin_message(&self, message_id: i64) -> Result<()> {
            self.unpinned.lock().push(message_id);
            Ok(())
        }
    }

    fn channels() -> HashMap<AlertType, ChannelSpec> {
        let mut map = HashMap::new();
        map.insert(
            AlertType::SteamAlerts,
            ChannelSpec {
                name: "steam".into(),
                topic_id: 11,
                cooldown_ms: 30_000,
                severity_floor: Severity::Info,
            },
        );
        map.insert(
            AlertType::Performance,
            ChannelSpec {
                name: "performance".into(),
                topic_id: 12,
                cooldown_ms: 60_000,
                severity_floor: Severity::Warning,
            },
        );
        map
    }

    fn dispatcher(
        messenger: MockMessenger,
        clock: &Arc<ManualClock>,
    ) -> AlertDispatcher<MockMessenger> {
        AlertDispatcher::new(
            messenger,
            channels(),
            "https://live.example/match",
            clock.clone() as Arc<dyn Clock>,
            AuditSink::disabled(clock.clone() as Arc<dyn Clock>),
        )
    }

    fn steam_event(kind: SteamEventKind, line_movement: f64, index: Option<f64>) -> SteamEvent {
        SteamEvent {
            kind,
            game_id: "G1".into(),
            bookmaker_id: "BK1".into(),
            odds_type: OddsType::Spread,
            market: Market {
                home_team: "Hawks".into(),
                away_team: "Sky".into(),
                league: League::Nba,
            },
            velocity: 0.15,
            steam_index: index,
            line_movement,
            old_value: 2.0,
            new_value: 2.0 + line_movement,
            timestamp: T0,
            window: Vec::new(),
        }
    }

    #[tokio::test]
    async fn cooldown_gates_second_send() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = dispatcher(MockMessenger::default(), &clock);

        let alert = Alert::new(
            AlertType::Performance,
            Severity::Warning,
            "slow",
            "pipeline lag",
            T0,
        );
        assert!(d.send(&alert).await.sent);

        // Scenario 6: second attempt 10 s later against a 60 s cooldown.
        clock.advance(10_000);
        let second = d.send(&alert).await;
        assert!(!second.sent);
        assert_eq!(second.reason, "cooldown");

        // After the window passes the channel opens again.
        clock.advance(60_000);
        assert!(d.send(&alert).await.sent);
    }

    #[tokio::test]
    async fn zero_cooldown_never_rate_limits() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut channels = channels();
        channels.get_mut(&AlertType::Performance).unwrap().cooldown_ms = 0;
        let mut d = AlertDispatcher::new(
            MockMessenger::default(),
            channels,
            "",
            clock.clone() as Arc<dyn Clock>,
            AuditSink::disabled(clock.clone() as Arc<dyn Clock>),
        );

        let alert = Alert::new(
            AlertType::Performance,
            Severity::Critical,
            "a",
            "b",
            T0,
        );
        assert!(d.send(&alert).await.sent);
        assert!(d.send(&alert).await.sent);
        assert!(d.send(&alert).await.sent);
    }

    #[tokio::test]
    async fn severity_floor_drops_quietly() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = dispatcher(MockMessenger::default(), &clock);

        let alert = Alert::new(AlertType::Performance, Severity::Info, "t", "m", T0);
        let outcome = d.send(&alert).await;
        assert!(!outcome.sent);
        assert_eq!(outcome.reason, "below-severity-floor");
        assert!(d.messenger.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn unknown_type_is_dropped() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = dispatcher(MockMessenger::default(), &clock);
        let alert = Alert::new(AlertType::AuthEvents, Severity::Critical, "t", "m", T0);
        assert_eq!(d.send(&alert).await.reason, "unknown-type");
    }

    #[tokio::test]
    async fn send_failure_leaves_cooldown_untouched() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = dispatcher(MockMessenger::failing(), &clock);

        let alert = Alert::new(
            AlertType::Performance,
            Severity::Warning,
            "t",
            "m",
            T0,
        );
        let outcome = d.send(&alert).await;
        assert!(!outcome.sent);
        assert_eq!(outcome.reason, "send-failed");
        assert!(d.last_sent.is_empty(), "failed send must not start cooldown");
    }

    #[tokio::test]
    async fn info_alerts_send_silently() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = dispatcher(MockMessenger::default(), &clock);
        let alert = Alert::new(AlertType::SteamAlerts, Severity::Info, "t", "m", T0);
        assert!(d.send(&alert).await.sent);
        let sent = d.messenger.sent.lock();
        assert!(sent[0].2, "INFO severity sets disable_notification");
        assert_eq!(sent[0].1, 11, "routes to the steam topic");
    }

    #[tokio::test]
    async fn large_line_movement_pins_and_records_match() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = dispatcher(MockMessenger::default(), &clock);

        // Scenario 2: spread line moved a full point on a large single move.
        let event = steam_event(SteamEventKind::LargeSingle, -1.0, None);
        let outcome = d.dispatch_steam(&event).await;
        assert!(outcome.sent);
        let message_id = outcome.message_id.unwrap();
        assert_eq!(d.pinned_message("G1"), Some(message_id));
        assert_eq!(d.messenger.pinned.lock().as_slice(), &[message_id]);
    }

    #[tokio::test]
    async fn high_steam_index_pins() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = dispatcher(MockMessenger::default(), &clock);
        // Scenario 3: index 2.8 > 2.0 pins even with modest line movement.
        let event = steam_event(SteamEventKind::MultiRapid, 0.45, Some(2.8));
        let outcome = d.dispatch_steam(&event).await;
        assert!(outcome.sent);
        assert_eq!(d.pinned_message("G1"), outcome.message_id);
    }

    #[tokio::test]
    async fn modest_cluster_does_not_pin() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = dispatcher(MockMessenger::default(), &clock);
        let event = steam_event(SteamEventKind::MultiRapid, 0.2, Some(1.6));
        assert!(d.dispatch_steam(&event).await.sent);
        assert!(d.pinned_message("G1").is_none());
        assert!(d.messenger.pinned.lock().is_empty());
    }

    #[tokio::test]
    async fn repinning_same_match_unpins_previous() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = dispatcher(MockMessenger::default(), &clock);

        let first = d
            .dispatch_steam(&steam_event(SteamEventKind::LargeSingle, 1.5, None))
            .await;
        let first_id = first.message_id.unwrap();

        clock.advance(31_000); // clear the steam cooldown
        let second = d
            .dispatch_steam(&steam_event(SteamEventKind::LargeSingle, 2.0, None))
            .await;
        let second_id = second.message_id.unwrap();

        assert_eq!(d.pinned_message("G1"), Some(second_id));
        assert_eq!(d.messenger.unpinned.lock().as_slice(), &[first_id]);
    }

    #[tokio::test]
    async fn html_formatting_escapes_and_stamps() {
        let clock = Arc::new(ManualClock::at(T0));
        let mut d = dispatcher(MockMessenger::default(), &clock);

        let alert = Alert::new(
            AlertType::SteamAlerts,
            Severity::Critical,
            "A <b>sneaky</b> & bold title",
            "line moved",
            T0,
        )
        .with_meta("matchId", serde_json::json!("G<1>"));
        assert!(d.send(&alert).await.sent);

        let sent = d.messenger.sent.lock();
        let html = &sent[0].0;
        assert!(html.contains("A &lt;b&gt;sneaky&lt;/b&gt; &amp; bold title"));
        assert!(html.contains("\u{1f6a8}"));
        assert!(html.contains("UTC"));
        assert!(html.contains("ET"));
        assert!(html.contains("https://live.example/match/G&lt;1&gt;"));
    }

    #[test]
    fn escape_html_covers_special_characters() {
        assert_eq!(
            escape_html(r#"<a href="x">&</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;"
        );
    }
}
