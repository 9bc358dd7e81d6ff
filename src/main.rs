// =============================================================================
// Helios Funding Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Discovery mode with auto-execute off. Operators flip
// to Standard mode and enable auto-execute through the API once the data
// plane looks healthy.
//
// Exit codes: 0 clean shutdown, 1 configuration error, 2 database error.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod bus;
mod cache;
mod capital;
mod detector;
mod exchanges;
mod execution;
mod market_data;
mod positions;
mod risk;
mod runtime_config;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::bus::{ConfigEvent, PositionEventKind};
use crate::capital::VenueBalance;
use crate::exchanges::venues::VENUES;
use crate::exchanges::{build_adapter, Credentials};
use crate::market_data::aggregator::{SOURCE_PRIMARY, SOURCE_SECONDARY};
use crate::market_data::secondary::ReferenceFeedClient;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Helios Funding Engine — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = if std::path::Path::new(CONFIG_PATH).exists() {
        match RuntimeConfig::load(CONFIG_PATH) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "invalid runtime config");
                return 1;
            }
        }
    } else {
        info!("no runtime config on disk, using defaults");
        RuntimeConfig::default()
    };

    let encryption_key = std::env::var("ENCRYPTION_KEY").unwrap_or_else(|_| {
        warn!("ENCRYPTION_KEY not set — using an insecure development key");
        "helios-dev-key".to_string()
    });

    // ── 2. Store ─────────────────────────────────────────────────────────
    let db_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "helios.db".to_string());
    let store = match Store::open(&db_path) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, path = %db_path, "failed to open database");
            return 2;
        }
    };
    if let Err(e) = store.seed_exchanges().await {
        error!(error = %e, "failed to seed exchange table");
        return 2;
    }

    // Stored strategy config (API PUTs) overrides the file.
    let config = match store.load_strategy_config().await {
        Ok(Some(stored)) => {
            info!("strategy config loaded from store");
            stored
        }
        Ok(None) => config,
        Err(e) => {
            warn!(error = %e, "failed to load stored strategy config");
            config
        }
    };

    let risk_limits = store.load_risk_limits().await.unwrap_or_default();

    info!(
        mode = %config.mode,
        auto_execute = config.auto_execute,
        max_concurrent_coins = config.max_concurrent_coins,
        "engine configuration resolved"
    );

    // ── 3. Build shared state ────────────────────────────────────────────
    let state = AppState::new(config, store, encryption_key, risk_limits);

    // Recover non-terminal opportunities, credentials and blacklist.
    state.detector.start().await;

    // ── 4. Market data: per-venue collectors + aggregator loops ─────────
    spawn_collector_loops(&state);
    spawn_aggregator_loops(&state);

    // ── 5. Detector loops ────────────────────────────────────────────────
    spawn_detector_loops(&state);

    // ── 6. Execution request listener ────────────────────────────────────
    spawn_execution_listener(&state);

    // ── 7. Position manager loops ────────────────────────────────────────
    spawn_position_loops(&state);

    // ── 8. Capital allocator loops ───────────────────────────────────────
    spawn_allocator_loops(&state);

    // ── 9. Event listeners (positions, config, activity) ─────────────────
    spawn_event_listeners(&state);

    // ── 10. API server ────────────────────────────────────────────────────
    let bind_addr = std::env::var("HELIOS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    {
        let api_state = state.clone();
        let bind = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            let listener = match tokio::net::TcpListener::bind(&bind).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %bind, error = %e, "failed to bind API server");
                    return;
                }
            };
            info!(addr = %bind, "API server listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        return 1;
    }
    warn!("Shutdown signal received — stopping gracefully");
    state.control.set_running(false);

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Helios Funding Engine shut down complete.");
    0
}

// =============================================================================
// Loop wiring
// =============================================================================

/// One poll loop per venue: fetch funding rates with the public (unsigned)
/// adapter path and publish them on the funding-rate topic.
fn spawn_collector_loops(state: &Arc<AppState>) {
    for venue in VENUES {
        let state = state.clone();
        tokio::spawn(async move {
            let max_retries = state.config.read().max_retries;
            let adapter = build_adapter(venue, Credentials::default(), max_retries);

            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                if !state.control.is_running() {
                    continue;
                }

                match adapter.get_funding_rates().await {
                    Ok(rates) => {
                        for rate in rates {
                            state.bus.publish_funding_rate(rate);
                        }
                    }
                    Err(e) => {
                        warn!(venue = venue.slug, error = %e.message, "funding poll failed");
                        state
                            .aggregator
                            .record_source_error(SOURCE_PRIMARY, e.message.clone());
                    }
                }

                // Unhealthy adapters get a bounded close/backoff/init cycle.
                if !adapter.health().is_healthy {
                    adapter.recover().await;
                }

                state
                    .reliability
                    .write()
                    .insert(venue.slug.to_string(), adapter.reliability_score());
            }
        });
    }
    info!(venues = VENUES.len(), "market data collectors launched");
}

fn spawn_aggregator_loops(state: &Arc<AppState>) {
    // Primary-source listener with automatic resubscription and bounded
    // backoff (1 s doubling to 60 s, capped after ten attempts).
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut attempts: u32 = 0;
            loop {
                let mut rx = state.bus.subscribe_funding_rate();
                loop {
                    match rx.recv().await {
                        Ok(rate) => {
                            if attempts > 0 {
                                state.aggregator.record_reconnect_success();
                                attempts = 0;
                                info!("primary source listener recovered");
                            }
                            state.aggregator.ingest_primary(rate);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            debug!(missed, "primary listener lagged, continuing");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                attempts = (attempts + 1).min(10);
                state.aggregator.record_reconnect_attempt();
                let delay = (1u64 << attempts.min(6)).min(60);
                warn!(attempts, delay, "primary source listener lost, reconnecting");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        });
    }

    // Secondary reference feed poll.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let client = ReferenceFeedClient::new();
            let poll_secs = state.config.read().secondary_poll_secs;
            let mut interval = tokio::time::interval(Duration::from_secs(poll_secs.max(10)));
            loop {
                interval.tick().await;
                match client.fetch_funding_rates().await {
                    Ok(rates) => state.aggregator.ingest_secondary_batch(rates),
                    Err(e) => {
                        warn!(error = %e, "reference feed poll failed");
                        state
                            .aggregator
                            .record_source_error(SOURCE_SECONDARY, e.to_string());
                    }
                }
            }
        });
    }

    // Snapshot production.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let snapshot_secs = state.config.read().snapshot_interval_secs;
            let mut interval = tokio::time::interval(Duration::from_secs(snapshot_secs.max(5)));
            loop {
                interval.tick().await;
                state.aggregator.produce_snapshot().await;
            }
        });
    }

    // Source health classification.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                state.aggregator.monitor_source_health();
            }
        });
    }

    // Stale-data cleanup every minute, spread-history purge hourly.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            let mut ticks: u32 = 0;
            loop {
                interval.tick().await;
                state.aggregator.cleanup_stale();
                state.cache.evict_expired();
                ticks += 1;
                if ticks >= 60 {
                    ticks = 0;
                    state.aggregator.purge_spread_history(90).await;
                }
            }
        });
    }

    // Spread history capture for offline analysis.
    {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let history_secs = state.config.read().spread_history_secs;
            let mut interval = tokio::time::interval(Duration::from_secs(history_secs.max(30)));
            loop {
                interval.tick().await;
                state.aggregator.record_spread_history().await;
            }
        });
    }
}

fn spawn_detector_loops(state: &Arc<AppState>) {
    // Snapshot-triggered detection (debounce collapses bursts).
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut rx = state.bus.subscribe_snapshot();
            loop {
                match rx.recv().await {
                    Ok(_snapshot) => state.detector.run_detection_cycle().await,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // Periodic detection timer.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let detection_secs = state.config.read().detection_interval_secs;
            let mut interval = tokio::time::interval(Duration::from_secs(detection_secs.max(5)));
            loop {
                interval.tick().await;
                state.detector.run_detection_cycle().await;
            }
        });
    }

    // Expiry sweep.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                state.detector.cleanup_expired().await;
            }
        });
    }

    // Credential & risk-limit refresh so new API keys and tuned limits take
    // effect without a restart.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                state.detector.refresh_credentials().await;
                state.detector.refresh_risk_limits().await;
                match state.store.load_risk_limits().await {
                    Ok(limits) => state.risk.set_limits(limits),
                    Err(e) => warn!(error = %e, "failed to refresh risk limits"),
                }
            }
        });
    }

    // Periodic status narrative.
    {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                state.detector.publish_status_summary();
            }
        });
    }
}

fn spawn_execution_listener(state: &Arc<AppState>) {
    let state = state.clone();
    tokio::spawn(async move {
        let mut rx = state.bus.subscribe_execution_request();
        loop {
            match rx.recv().await {
                Ok(request) => {
                    info!(
                        opportunity_id = %request.opportunity_id,
                        symbol = %request.symbol,
                        size = %request.position_size_usd,
                        auto = request.auto_executed,
                        "execution request received"
                    );
                    let outcome = state
                        .executor
                        .execute_opportunity(
                            &request.opportunity_id,
                            Some(request.position_size_usd),
                            None,
                        )
                        .await;
                    match outcome {
                        Ok(result) => {
                            info!(position_id = %result.position_id, "execution request fulfilled");
                        }
                        Err(e) => {
                            error!(
                                opportunity_id = %request.opportunity_id,
                                error = %e,
                                manual_intervention = e.requires_manual_intervention,
                                "execution request failed"
                            );
                            state.detector.on_execution_rejected(&request.opportunity_id).await;
                        }
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_position_loops(state: &Arc<AppState>) {
    // Sync loop: initial delay, then every 30 s.
    {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let sync_secs = state.config.read().sync_interval_secs;
            let mut interval = tokio::time::interval(Duration::from_secs(sync_secs.max(5)));
            loop {
                interval.tick().await;
                if state.control.is_running() {
                    state.position_manager.sync_cycle().await;
                }
            }
        });
    }

    // Reconciliation: once at startup, then periodic.
    {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            state.position_manager.reconcile().await;

            let reconcile_secs = state.config.read().reconcile_interval_secs;
            let mut interval = tokio::time::interval(Duration::from_secs(reconcile_secs.max(60)));
            loop {
                interval.tick().await;
                state.position_manager.reconcile().await;
            }
        });
    }
}

fn spawn_allocator_loops(state: &Arc<AppState>) {
    // Venue balance refresh.
    {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                refresh_balances(&state).await;
            }
        });
    }

    // Expired-reservation sweep.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let released = state.allocator.cleanup_expired();
                if released > 0 {
                    debug!(released, "expired allocations released");
                }
            }
        });
    }

    // Coin-cap enforcement + portfolio drawdown check.
    {
        let state = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                if !state.control.is_running() {
                    continue;
                }
                state.allocator.enforce_coin_limit().await;

                // Portfolio drawdown feeds the automatic circuit breaker.
                if let Ok(open) = state.store.load_open_positions().await {
                    let unrealized: Decimal =
                        open.iter().map(|p| p.total_unrealized_pnl()).sum();
                    let capital = state.allocator.capital_state().total_capital_usd;
                    if capital > Decimal::ZERO && unrealized < Decimal::ZERO {
                        let drawdown_pct = -unrealized / capital * Decimal::from(100);
                        state.risk.check_drawdown(drawdown_pct);
                    }
                }
            }
        });
    }
}

async fn refresh_balances(state: &Arc<AppState>) {
    let slugs = match state.store.list_credentialed_exchanges().await {
        Ok(slugs) => slugs,
        Err(e) => {
            warn!(error = %e, "failed to list credentialed exchanges");
            return;
        }
    };
    if slugs.is_empty() {
        return;
    }

    let max_retries = state.config.read().max_retries;
    let mut balances = Vec::new();
    let mut failed_venues = Vec::new();
    let mut total = Decimal::ZERO;
    let mut venues = std::collections::HashMap::new();

    for slug in &slugs {
        let credentials = match state.store.get_credentials(slug, &state.encryption_key).await {
            Ok(Some(c)) => c,
            _ => continue,
        };
        match crate::exchanges::connect_adapter(slug, credentials, max_retries).await {
            Ok(adapter) => match adapter.get_balance().await {
                Ok(data) => {
                    let balance = VenueBalance {
                        venue: slug.clone(),
                        total_usd: data.total_usd,
                        margin_used: data.margin_used,
                        margin_available: data.margin_available,
                        last_updated: Some(chrono::Utc::now()),
                    };
                    total += balance.total_usd;
                    venues.insert(slug.clone(), balance.total_usd);
                    if let Err(e) = state.store.upsert_venue_balance(&balance).await {
                        warn!(venue = %slug, error = %e, "failed to persist venue balance");
                    }
                    balances.push(balance);
                    let _ = adapter.close().await;
                }
                Err(e) => {
                    warn!(venue = %slug, error = %e.message, "balance fetch failed");
                    failed_venues.push(slug.clone());
                    let _ = adapter.close().await;
                }
            },
            Err(e) => {
                warn!(venue = %slug, error = %e.message, "balance adapter connect failed");
                failed_venues.push(slug.clone());
            }
        }
    }

    if !balances.is_empty() {
        state.allocator.apply_balances(balances);
        state.bus.publish_balance(crate::bus::BalanceUpdate {
            total_usd: total,
            venues,
            timestamp: chrono::Utc::now(),
        });
    }

    // Unreachable venues carrying a large capital share trip the breaker.
    if !failed_venues.is_empty() {
        let exposure = state.allocator.build_exposure_context().await;
        state.risk.check_exchange_outage(
            &failed_venues,
            &exposure.venue_exposure,
            exposure.total_capital_usd,
        );
    }
}

fn spawn_event_listeners(state: &Arc<AppState>) {
    // Position lifecycle: detector status flips + allocator confirm/release.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut rx = state.bus.subscribe_position();
            loop {
                match rx.recv().await {
                    Ok(event) => match event.kind {
                        PositionEventKind::Opened => {
                            if let Some(opportunity_id) = &event.opportunity_id {
                                state.detector.on_position_opened(opportunity_id).await;
                                state
                                    .allocator
                                    .on_position_opened(opportunity_id, &event.position_id);
                            }
                        }
                        PositionEventKind::Closed => {
                            state.allocator.on_position_closed(&event.position_id);
                        }
                    },
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // Config refresh signals.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut rx = state.bus.subscribe_config();
            loop {
                match rx.recv().await {
                    Ok(ConfigEvent::BlacklistChanged { action, symbol, .. }) => match action {
                        crate::bus::BlacklistAction::Added => {
                            state.detector.on_blacklist_added(&symbol).await;
                        }
                        crate::bus::BlacklistAction::Removed => {
                            state.detector.on_blacklist_removed(&symbol);
                        }
                    },
                    Ok(ConfigEvent::RiskLimitsUpdated) => {
                        state.detector.refresh_risk_limits().await;
                        match state.store.load_risk_limits().await {
                            Ok(limits) => state.risk.set_limits(limits),
                            Err(e) => warn!(error = %e, "failed to reload risk limits"),
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // Operational alerts: logged and folded into the activity stream.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut rx = state.bus.subscribe_alert();
            loop {
                match rx.recv().await {
                    Ok(alert) => {
                        warn!(alert = ?alert, "operational alert");
                        let event = crate::bus::ActivityEvent::warning(
                            "system",
                            "operational_alert",
                            format!("{alert:?}"),
                            serde_json::to_value(&alert).unwrap_or(serde_json::Value::Null),
                        );
                        state.bus.publish_activity(event);
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    // Activity stream: in-memory ring for the UI plus the durable audit row.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut rx = state.bus.subscribe_activity();
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = state.store.insert_activity_event(&event).await {
                            warn!(error = %e, "failed to persist activity event");
                        }
                        state.push_activity(event);
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}
