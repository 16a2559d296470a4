// =============================================================================
// steamwatch — Live-Odds Steam Sentinel — Main Entry Point
// =============================================================================
//
// Wiring order matters: the audit sink comes up first (everything records to
// it), secrets gate startup (missing secrets are fatal), then the pipeline
// task and one stream client per channel group. Shutdown unwinds in reverse:
// streams close with 1000, the tick channel drains through the detector and
// dispatcher, and the audit writer flushes last.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod audit;
mod clock;
mod dispatcher;
mod lifecycle;
mod normalize;
mod runtime_config;
mod secrets;
mod steam;
mod telegram;
mod types;
mod upstream;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::audit::{AuditRecord, AuditSink};
use crate::clock::{Clock, SystemClock};
use crate::dispatcher::AlertDispatcher;
use crate::lifecycle::{resident_mem_mb, LifecycleManager};
use crate::normalize::Normalizer;
use crate::runtime_config::RuntimeConfig;
use crate::secrets::{SecretStore, SECRET_BOT_TOKEN, SECRET_CHAT_ID};
use crate::steam::SteamDetector;
use crate::telegram::TelegramClient;
use crate::upstream::auth::TokenAcquirer;
use crate::upstream::frame::FrameDecoder;
use crate::upstream::stream::{StreamClient, StreamObserver};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        steamwatch — Live-Odds Sentinel — Starting        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("steamwatch.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(groups = ?config.channel_groups, "Configured channel groups");

    // ── 2. Audit sink (everything below records into it) ─────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (audit, audit_handle) = AuditSink::spawn(
        config.audit_dir.as_str(),
        config.audit_retention_days,
        config.audit_queue_depth,
        clock.clone(),
    );
    audit.event("STARTUP", "core");

    // ── 3. Secrets (fatal when missing) ──────────────────────────────────
    let secrets = SecretStore::new(audit.clone());
    let bot_token = secrets.require(SECRET_BOT_TOKEN)?;
    let chat_id: i64 = secrets
        .require(SECRET_CHAT_ID)?
        .parse()
        .context("TELEGRAM_CHAT_ID must be an integer chat id")?;

    let channel_table = config.channel_table();
    if channel_table.values().any(|c| c.topic_id == 0) {
        anyhow::bail!(
            "alert topic ids are required; set STEAMWATCH_TOPIC_STEAM / _PERFORMANCE / \
             _SYSTEM / _AUTH or the alerts section of steamwatch.json"
        );
    }

    // ── 4. Alert pipeline ────────────────────────────────────────────────
    let telegram = TelegramClient::new(bot_token, chat_id);
    let mut dispatcher = AlertDispatcher::new(
        telegram,
        channel_table,
        config.deep_link_base.clone(),
        clock.clone(),
        audit.clone(),
    );
    let mut detector = SteamDetector::new(config.steam_table(), clock.clone(), audit.clone());

    let (tick_tx, mut tick_rx) = tokio::sync::mpsc::channel(config.tick_queue_depth);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let lifecycle = Arc::new(LifecycleManager::new(clock.clone(), audit.clone()));

    // ── 5. Stream clients, one per channel group ─────────────────────────
    let mut stream_handles = Vec::new();
    for group in &config.channel_groups {
        let acquirer = TokenAcquirer::new(
            config.auth_url.clone(),
            &config.origin,
            &config.referer,
            &config.user_agent,
            (config.token_ttl_secs * 1_000) as i64,
            clock.clone(),
            audit.clone(),
        )?;
        let client = StreamClient::new(
            config.stream_settings(group),
            group.clone(),
            acquirer,
            FrameDecoder::new(audit.clone()),
            Normalizer::new(clock.clone(), audit.clone()),
            tick_tx.clone(),
            vec![lifecycle.clone() as Arc<dyn StreamObserver>],
            shutdown_rx.clone(),
            clock.clone(),
            audit.clone(),
        );
        let label = group.clone();
        let task_lifecycle = lifecycle.clone();
        stream_handles.push(tokio::spawn(async move {
            if let Err(e) = client.run().await {
                task_lifecycle.note_error();
                error!(group = %label, error = %e, "stream client stopped with error");
            }
        }));
    }
    info!(count = stream_handles.len(), "Stream clients launched");

    // ── 6. Detection + dispatch pipeline ─────────────────────────────────
    // One task owns both the detector and the dispatcher: per-key emission
    // order and per-type cooldown serialization fall out of that ownership.
    let last_tick = Arc::new(AtomicI64::new(clock.now_ms()));
    let pipeline_last = last_tick.clone();
    let pipeline_clock = clock.clone();
    let pipeline_lifecycle = lifecycle.clone();
    let cleanup_every = Duration::from_secs(config.detector_cleanup_secs.max(1));
    let pipeline = tokio::spawn(async move {
        let mut cleanup = tokio::time::interval(cleanup_every);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe = tick_rx.recv() => match maybe {
                    Some(tick) => {
                        pipeline_last.store(pipeline_clock.now_ms(), Ordering::Relaxed);
                        if let Some(event) = detector.process(&tick) {
                            let outcome = dispatcher.dispatch_steam(&event).await;
                            if !outcome.sent {
                                debug!(reason = outcome.reason, "steam alert not delivered");
                            }
                        }
                    }
                    None => break,
                },
                _ = cleanup.tick() => {
                    detector.cleanup();
                    pipeline_lifecycle.reap();
                }
            }
        }
        detector.cleanup();
        debug!("pipeline drained");
    });

    // ── 7. Watchdog: heartbeat-gap + lifecycle gauges ────────────────────
    let watchdog_tx = tick_tx.clone();
    drop(tick_tx);
    let watchdog_audit = audit.clone();
    let watchdog_clock = clock.clone();
    let watchdog_last = last_tick.clone();
    let watchdog_lifecycle = lifecycle.clone();
    let stall_after_ms = (config.stall_after_secs * 1_000) as i64;
    let mut watchdog_shutdown = shutdown_rx.clone();
    let watchdog = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let queue_depth =
                        (watchdog_tx.max_capacity() - watchdog_tx.capacity()) as f64;
                    watchdog_lifecycle.set_gauges(queue_depth, resident_mem_mb());

                    let gap = watchdog_clock.now_ms() - watchdog_last.load(Ordering::Relaxed);
                    if gap >= stall_after_ms {
                        // A silent upstream is itself a reportable condition.
                        warn!(gap_ms = gap, "no ticks normalized recently");
                        watchdog_audit.submit(
                            AuditRecord::new("HEARTBEAT_GAP", "watchdog")
                                .field("gapMs", serde_json::json!(gap)),
                        );
                    }
                }
                changed = watchdog_shutdown.changed() => {
                    if changed.is_err() || *watchdog_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    let _ = shutdown_tx.send(true);

    // Reverse dependency order: sockets close with 1000, the watchdog drops
    // its tick sender, the pipeline drains, the audit writer flushes.
    for handle in stream_handles {
        let _ = handle.await;
    }
    let _ = watchdog.await;
    let _ = pipeline.await;

    audit.event("SHUTDOWN", "core");

    // Release every remaining sink handle so the writer can drain and exit.
    drop(secrets);
    drop(lifecycle);
    let mut audit = audit;
    audit.close();
    let _ = audit_handle.await;

    info!("steamwatch shut down complete.");
    Ok(())
}
