// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Thin handlers only: every endpoint delegates to a component operation and
// wraps the result in the `{success, data?, error?, meta}` envelope. CORS is
// permissive for development.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::app_state::AppState;
use crate::bus::{BlacklistAction, ConfigEvent};
use crate::cache::{KEY_FUNDING_SPREADS, KEY_RECONCILIATION_REPORT};
use crate::detector::OpportunityStatus;
use crate::exchanges::Credentials;
use crate::market_data::funding::Spread;
use crate::positions::ExitReason;
use crate::risk::stress::{StressPosition, StressTester};
use crate::risk::TradeCheck;
use crate::types::OrderSide;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health ──────────────────────────────────────────────────
        .route("/health", get(health))
        // ── Opportunities ───────────────────────────────────────────
        .route("/opportunities", get(list_opportunities))
        .route("/opportunities/live", get(live_opportunities))
        .route("/opportunities/top/:n", get(top_opportunities))
        .route("/opportunities/:id", get(get_opportunity))
        .route("/opportunities/:id/execute", post(execute_opportunity))
        // ── Positions ───────────────────────────────────────────────
        .route("/positions", get(list_positions))
        .route("/positions/active", get(active_positions))
        .route("/positions/:id", get(get_position))
        .route("/positions/:id/close", post(close_position))
        .route("/positions/:id/interactions", get(position_interactions))
        // ── Funding ─────────────────────────────────────────────────
        .route("/funding/rates", get(funding_rates))
        .route("/funding/matrix", get(funding_matrix))
        .route("/funding/history/:symbol", get(funding_history))
        .route("/funding/spreads", get(funding_spreads))
        // ── Risk ────────────────────────────────────────────────────
        .route("/risk/state", get(risk_state))
        .route("/risk/limits", get(risk_limits))
        .route("/risk/validate", post(risk_validate))
        .route("/risk/circuit-breaker/:action", post(circuit_breaker))
        .route("/risk/stress-test", post(stress_test))
        // ── Config ──────────────────────────────────────────────────
        .route("/config/strategy", get(get_strategy).put(put_strategy))
        .route("/config/exchanges", get(list_exchanges))
        .route("/config/exchanges/:slug", get(get_exchange).patch(patch_exchange))
        .route("/config/settings/factory-reset", post(factory_reset))
        // ── Blacklist ───────────────────────────────────────────────
        .route("/blacklist", get(list_blacklist).post(add_blacklist))
        .route("/blacklist/:symbol", delete(remove_blacklist))
        // ── Analytics ───────────────────────────────────────────────
        .route("/analytics/daily", get(analytics_daily))
        .route("/analytics/summary", get(analytics_summary))
        .route("/analytics/attribution", get(analytics_attribution))
        .route("/analytics/realtime", get(analytics_realtime))
        .route("/analytics/trades", get(analytics_trades))
        // ── Activity feed ───────────────────────────────────────────
        .route("/activity", get(activity_feed))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Response envelope
// =============================================================================

fn envelope(data: impl serde::Serialize) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": data,
        "meta": {"timestamp": Utc::now().to_rfc3339()},
    }))
}

fn failure(status: StatusCode, error: impl serde::Serialize) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({
            "success": false,
            "error": error,
            "meta": {"timestamp": Utc::now().to_rfc3339()},
        })),
    )
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn internal(err: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health_snapshot())
}

// =============================================================================
// Opportunities
// =============================================================================

#[derive(Deserialize)]
struct OpportunityQuery {
    #[serde(default)]
    min_score: Option<u8>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    sort_by: Option<String>,
    #[serde(default)]
    sort_order: Option<String>,
}

async fn list_opportunities(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunityQuery>,
) -> ApiResult {
    let status = query.status.as_deref().and_then(OpportunityStatus::parse);
    let mut opportunities = state.detector.get_opportunities(
        query.min_score.unwrap_or(0),
        query.symbol.as_deref(),
        status,
        query.exchange.as_deref(),
        query.limit.unwrap_or(50),
        query.offset.unwrap_or(0),
    );

    // Default ordering is score-descending; spread ordering is opt-in.
    if query.sort_by.as_deref() == Some("spread") {
        opportunities.sort_by(|a, b| b.funding_spread_pct.cmp(&a.funding_spread_pct));
    }
    if query.sort_order.as_deref() == Some("asc") {
        opportunities.reverse();
    }

    Ok(envelope(opportunities))
}

async fn live_opportunities(State(state): State<Arc<AppState>>) -> ApiResult {
    let live = state.detector.get_opportunities(0, None, None, None, 100, 0);
    Ok(envelope(live))
}

async fn top_opportunities(
    State(state): State<Arc<AppState>>,
    Path(n): Path<usize>,
) -> ApiResult {
    Ok(envelope(state.detector.get_top(n.min(100))))
}

async fn get_opportunity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    match state.detector.get_by_id(&id) {
        Some(opportunity) => {
            let logs = state
                .store
                .list_execution_logs(&id)
                .await
                .unwrap_or_default();
            Ok(envelope(json!({
                "opportunity": opportunity,
                "execution_log": logs,
            })))
        }
        None => Err(failure(StatusCode::NOT_FOUND, format!("opportunity {id} not found"))),
    }
}

#[derive(Deserialize, Default)]
struct ExecuteBody {
    #[serde(default)]
    capital_usd: Option<f64>,
    #[serde(default)]
    leverage: Option<u32>,
}

async fn execute_opportunity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ExecuteBody>>,
) -> ApiResult {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let size = body.capital_usd.and_then(Decimal::from_f64);

    info!(opportunity_id = %id, "manual execution requested");
    match state
        .executor
        .execute_opportunity(&id, size, body.leverage)
        .await
    {
        Ok(outcome) => {
            state.detector.on_position_opened(&id).await;
            Ok(envelope(outcome))
        }
        Err(exec_failure) => {
            state.detector.on_execution_rejected(&id).await;
            let user_message = exec_failure.kind.user_message();
            Err(failure(
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({"failure": exec_failure, "user_message": user_message}),
            ))
        }
    }
}

// =============================================================================
// Positions
// =============================================================================

async fn list_positions(State(state): State<Arc<AppState>>) -> ApiResult {
    let mut positions = state.store.load_open_positions().await.map_err(internal)?;
    let closed = state.store.load_closed_positions(100).await.map_err(internal)?;
    positions.extend(closed);
    Ok(envelope(positions))
}

async fn active_positions(State(state): State<Arc<AppState>>) -> ApiResult {
    let positions = state.store.load_open_positions().await.map_err(internal)?;
    Ok(envelope(positions))
}

async fn get_position(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    match state.store.load_position(&id).await.map_err(internal)? {
        Some(position) => Ok(envelope(position)),
        None => Err(failure(StatusCode::NOT_FOUND, format!("position {id} not found"))),
    }
}

async fn close_position(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    info!(position_id = %id, "manual close requested");
    match state
        .position_manager
        .close_position(&id, ExitReason::Manual)
        .await
    {
        Ok(()) => Ok(envelope(json!({"position_id": id, "status": "closed"}))),
        Err(e) => Err(failure(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
    }
}

async fn position_interactions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let interactions = state.store.list_interactions(&id, 100).await.map_err(internal)?;
    Ok(envelope(interactions))
}

// =============================================================================
// Funding
// =============================================================================

async fn funding_rates(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let rates = state.aggregator.unified_rates(
        params.get("exchange").map(|s| s.as_str()),
        params.get("symbol").map(|s| s.as_str()),
    );
    Ok(envelope(rates))
}

/// Matrix view: symbol -> exchange -> rate, straight from the snapshot.
async fn funding_matrix(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    match state.aggregator.latest_snapshot() {
        Some(snapshot) => {
            let source_filter = params.get("source").map(|s| s.as_str());
            let mut matrix: HashMap<String, HashMap<String, Value>> = HashMap::new();
            for (symbol, exchanges) in &snapshot.rates {
                for (exchange, rate) in exchanges {
                    if let Some(wanted) = source_filter {
                        if rate.source.to_string() != wanted {
                            continue;
                        }
                    }
                    matrix.entry(symbol.clone()).or_default().insert(
                        exchange.clone(),
                        json!({
                            "rate": rate.rate,
                            "rate_annualized": rate.rate_annualized(),
                            "source": rate.source,
                            "next_funding_time": rate.next_funding_time,
                        }),
                    );
                }
            }
            Ok(envelope(json!({
                "matrix": matrix,
                "fetched_at": snapshot.fetched_at,
                "total_symbols": snapshot.total_symbols,
            })))
        }
        None => Ok(envelope(json!({"matrix": {}, "total_symbols": 0}))),
    }
}

async fn funding_history(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let limit = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(200);
    let history = state
        .store
        .spread_history_for_symbol(&symbol.to_uppercase(), limit)
        .await
        .map_err(internal)?;
    Ok(envelope(history))
}

async fn funding_spreads(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let min_spread = params
        .get("min_spread")
        .and_then(|s| s.parse::<f64>().ok())
        .and_then(Decimal::from_f64)
        .unwrap_or(Decimal::ZERO);
    let limit = params.get("limit").and_then(|l| l.parse().ok()).unwrap_or(50);

    // Serve the cached list when fresh, falling back to a live computation.
    let spreads: Vec<Spread> = match state.cache.get_json::<Vec<Spread>>(KEY_FUNDING_SPREADS) {
        Some(cached) => cached
            .into_iter()
            .filter(|s| s.spread_pct >= min_spread)
            .take(limit)
            .collect(),
        None => state.aggregator.calculate_spreads(min_spread, limit),
    };
    Ok(envelope(spreads))
}

// =============================================================================
// Risk
// =============================================================================

async fn risk_state(State(state): State<Arc<AppState>>) -> ApiResult {
    let exposure = state.allocator.build_exposure_context().await;
    Ok(envelope(json!({
        "circuit_breaker": state.risk.circuit_breaker_state(),
        "limits": state.risk.limits(),
        "capital": state.allocator.capital_state(),
        "gross_exposure": exposure.gross_exposure,
        "venue_exposure": exposure.venue_exposure,
        "asset_exposure": exposure.asset_exposure,
        "reconciliation": state.cache.get_raw(KEY_RECONCILIATION_REPORT),
        "aggregator_sources": state.aggregator.source_status(),
    })))
}

async fn risk_limits(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(envelope(state.risk.limits()))
}

#[derive(Deserialize)]
struct ValidateBody {
    opportunity_id: String,
    symbol: String,
    size_usd: f64,
    long_exchange: String,
    short_exchange: String,
    #[serde(default)]
    leverage: Option<u32>,
}

async fn risk_validate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ValidateBody>,
) -> ApiResult {
    let check = TradeCheck {
        opportunity_id: body.opportunity_id,
        symbol: body.symbol.to_uppercase(),
        size_usd: Decimal::from_f64(body.size_usd).unwrap_or(Decimal::ZERO),
        long_exchange: body.long_exchange,
        short_exchange: body.short_exchange,
        leverage: Decimal::from(body.leverage.unwrap_or(3)),
    };
    let exposure = state.allocator.build_exposure_context().await;
    Ok(envelope(state.risk.validate_trade(&check, &exposure)))
}

async fn circuit_breaker(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> ApiResult {
    match action.as_str() {
        "activate" => {
            state.risk.activate_circuit_breaker("manual activation via API");
            Ok(envelope(state.risk.circuit_breaker_state()))
        }
        "deactivate" => {
            state.risk.deactivate_circuit_breaker();
            Ok(envelope(state.risk.circuit_breaker_state()))
        }
        other => Err(failure(
            StatusCode::BAD_REQUEST,
            format!("unknown circuit-breaker action '{other}'"),
        )),
    }
}

async fn stress_test(State(state): State<Arc<AppState>>) -> ApiResult {
    let positions = state.store.load_open_positions().await.map_err(internal)?;
    let stress_positions: Vec<StressPosition> = positions
        .iter()
        .map(|p| StressPosition {
            position_id: p.id.clone(),
            symbol: p.symbol.clone(),
            size_usd: p.total_capital_deployed,
            long_exchange: p
                .legs
                .iter()
                .find(|l| l.side == OrderSide::Long)
                .map(|l| l.exchange.clone())
                .unwrap_or_default(),
            short_exchange: p
                .legs
                .iter()
                .find(|l| l.side == OrderSide::Short)
                .map(|l| l.exchange.clone())
                .unwrap_or_default(),
            current_spread: 0.0,
            unrealized_pnl: p.total_unrealized_pnl(),
        })
        .collect();

    let capital = state.allocator.capital_state();
    let exposure = state.allocator.build_exposure_context().await;
    let tester = StressTester::new(
        stress_positions,
        capital.total_capital_usd,
        exposure.gross_exposure,
    );

    let results = tester.run_all_scenarios();
    let worst = tester.worst_case();
    Ok(envelope(json!({"scenarios": results, "worst_case": worst})))
}

// =============================================================================
// Config
// =============================================================================

async fn get_strategy(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(envelope(state.config.read().clone()))
}

async fn put_strategy(
    State(state): State<Arc<AppState>>,
    Json(new_config): Json<crate::runtime_config::RuntimeConfig>,
) -> ApiResult {
    state.store.save_strategy_config(&new_config).await.map_err(internal)?;
    *state.config.write() = new_config.clone();
    state.increment_version();
    info!(mode = %new_config.mode, auto_execute = new_config.auto_execute, "strategy config updated");
    Ok(envelope(new_config))
}

async fn list_exchanges(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(envelope(state.store.list_exchanges().await.map_err(internal)?))
}

async fn get_exchange(State(state): State<Arc<AppState>>, Path(slug): Path<String>) -> ApiResult {
    let exchanges = state.store.list_exchanges().await.map_err(internal)?;
    match exchanges.into_iter().find(|e| e.slug == slug) {
        Some(exchange) => Ok(envelope(exchange)),
        None => Err(failure(StatusCode::NOT_FOUND, format!("exchange {slug} not found"))),
    }
}

#[derive(Deserialize)]
struct ExchangePatch {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_secret: Option<String>,
    #[serde(default)]
    passphrase: Option<String>,
    #[serde(default)]
    wallet_address: Option<String>,
}

async fn patch_exchange(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(patch): Json<ExchangePatch>,
) -> ApiResult {
    if let Some(enabled) = patch.enabled {
        state
            .store
            .set_exchange_enabled(&slug, enabled)
            .await
            .map_err(internal)?;
    }

    if patch.api_key.is_some() || patch.wallet_address.is_some() {
        let credentials = Credentials {
            api_key: patch.api_key.unwrap_or_default(),
            api_secret: patch.api_secret.unwrap_or_default(),
            passphrase: patch.passphrase.unwrap_or_default(),
            wallet_address: patch.wallet_address.unwrap_or_default(),
        };
        state
            .store
            .set_credentials(&slug, &credentials, &state.encryption_key)
            .await
            .map_err(internal)?;
        // Fresh API keys take effect on the next credential refresh tick,
        // or immediately for new detections:
        state.detector.refresh_credentials().await;
    }

    state.increment_version();
    get_exchange(State(state), Path(slug)).await
}

async fn factory_reset(State(state): State<Arc<AppState>>) -> ApiResult {
    state.store.factory_reset_settings().await.map_err(internal)?;
    *state.config.write() = crate::runtime_config::RuntimeConfig::default();
    state.risk.set_limits(crate::risk::RiskLimits::default());
    state.bus.publish_config(ConfigEvent::RiskLimitsUpdated);
    state.increment_version();
    info!("settings factory reset");
    Ok(envelope(json!({"reset": true})))
}

// =============================================================================
// Blacklist
// =============================================================================

async fn list_blacklist(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(envelope(state.store.list_blacklist().await.map_err(internal)?))
}

#[derive(Deserialize)]
struct BlacklistBody {
    symbol: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    blacklisted_by: Option<String>,
}

async fn add_blacklist(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BlacklistBody>,
) -> ApiResult {
    let symbol = body.symbol.to_uppercase();
    state
        .store
        .add_blacklist(&symbol, body.reason.as_deref(), body.blacklisted_by.as_deref())
        .await
        .map_err(internal)?;

    state.bus.publish_config(ConfigEvent::BlacklistChanged {
        action: BlacklistAction::Added,
        symbol: symbol.clone(),
        reason: body.reason.clone(),
    });

    Ok(envelope(json!({"symbol": symbol, "blacklisted": true})))
}

async fn remove_blacklist(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> ApiResult {
    let symbol = symbol.to_uppercase();
    let removed = state.store.remove_blacklist(&symbol).await.map_err(internal)?;
    if !removed {
        return Err(failure(StatusCode::NOT_FOUND, format!("{symbol} not blacklisted")));
    }

    state.bus.publish_config(ConfigEvent::BlacklistChanged {
        action: BlacklistAction::Removed,
        symbol: symbol.clone(),
        reason: None,
    });

    Ok(envelope(json!({"symbol": symbol, "blacklisted": false})))
}

// =============================================================================
// Analytics (aggregations over closed positions)
// =============================================================================

async fn analytics_daily(State(state): State<Arc<AppState>>) -> ApiResult {
    let closed = state.store.load_closed_positions(1000).await.map_err(internal)?;
    let mut by_day: HashMap<String, (usize, Decimal)> = HashMap::new();
    for position in &closed {
        let Some(closed_at) = position.closed_at else { continue };
        let day = closed_at.format("%Y-%m-%d").to_string();
        let entry = by_day.entry(day).or_insert((0, Decimal::ZERO));
        entry.0 += 1;
        entry.1 += position.total_realized_pnl();
    }

    let mut days: Vec<Value> = by_day
        .into_iter()
        .map(|(day, (trades, pnl))| json!({"day": day, "trades": trades, "realized_pnl": pnl}))
        .collect();
    days.sort_by(|a, b| b["day"].as_str().cmp(&a["day"].as_str()));
    Ok(envelope(days))
}

async fn analytics_summary(State(state): State<Arc<AppState>>) -> ApiResult {
    let closed = state.store.load_closed_positions(1000).await.map_err(internal)?;
    let total = closed.len();
    let wins = closed
        .iter()
        .filter(|p| p.total_realized_pnl() > Decimal::ZERO)
        .count();
    let total_pnl: Decimal = closed.iter().map(|p| p.total_realized_pnl()).sum();
    let funding: Decimal = closed.iter().map(|p| p.realized_pnl_funding).sum();

    Ok(envelope(json!({
        "closed_positions": total,
        "win_rate": if total > 0 { wins as f64 / total as f64 } else { 0.0 },
        "total_realized_pnl": total_pnl,
        "total_funding_pnl": funding,
    })))
}

async fn analytics_attribution(State(state): State<Arc<AppState>>) -> ApiResult {
    let closed = state.store.load_closed_positions(1000).await.map_err(internal)?;
    let funding: Decimal = closed.iter().map(|p| p.realized_pnl_funding).sum();
    let price: Decimal = closed.iter().map(|p| p.realized_pnl_price).sum();
    let costs: Decimal = closed.iter().map(|p| p.entry_costs + p.exit_costs).sum();

    Ok(envelope(json!({
        "funding_pnl": funding,
        "price_pnl": price,
        "costs": costs,
        "net": funding + price - costs,
    })))
}

async fn analytics_realtime(State(state): State<Arc<AppState>>) -> ApiResult {
    let open = state.store.load_open_positions().await.map_err(internal)?;
    let unrealized: Decimal = open.iter().map(|p| p.total_unrealized_pnl()).sum();
    let deployed: Decimal = open.iter().map(|p| p.total_capital_deployed).sum();

    Ok(envelope(json!({
        "open_positions": open.len(),
        "unrealized_pnl": unrealized,
        "capital_deployed": deployed,
        "capital": state.allocator.capital_state(),
        "detector": state.detector.stats(),
        "aggregator": state.aggregator.stats(),
    })))
}

async fn analytics_trades(State(state): State<Arc<AppState>>) -> ApiResult {
    let closed = state.store.load_closed_positions(100).await.map_err(internal)?;
    Ok(envelope(closed))
}

// =============================================================================
// Activity feed
// =============================================================================

async fn activity_feed(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let limit = params.get("limit").and_then(|l| l.parse().ok()).unwrap_or(100);
    // In-memory ring first, store as fallback for longer windows.
    let recent = state.recent_activity.read().clone();
    if recent.len() >= limit {
        let start = recent.len() - limit;
        return Ok(envelope(&recent[start..]));
    }
    let persisted = state.store.list_activity_events(limit).await.map_err(internal)?;
    Ok(envelope(persisted))
}
