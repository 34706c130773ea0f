// HTTP API routes (users, battles, interactions).

use axum::{
    extract::{Json, Path, Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditQueue};
use crate::auth::{AuthUser, UserPublic};
use crate::battle_state::{normalize_army, BattleState};
use crate::db::{BattleFieldUpdate, Database};
use crate::error::{is_unique_violation, AppError};
use crate::gateway::{build_prompt, LlmClient};
use crate::metrics;
use crate::rate_limit::{RateLimitType, RateLimiter};

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBattleRequest {
    pub battle_name: String,
    pub play_area: PlayArea,
    pub player_army: Value,
    pub opponent_army: Option<Value>,
}

#[derive(Deserialize)]
pub struct PlayArea {
    pub width: i64,
    pub height: i64,
}

#[derive(Deserialize)]
pub struct UpdateBattleRequest {
    pub battle_round: Option<i64>,
    pub army_turn: Option<i64>,
    pub player_score: Option<i64>,
    pub opponent_score: Option<i64>,
    pub archived: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub profile_picture: Option<String>,
}

#[derive(Deserialize)]
pub struct InitialInteractionRequest {
    pub user_id: String,
    pub initial_context: Option<Value>,
}

#[derive(Deserialize)]
pub struct TurnRequest {
    pub user_id: String,
    pub battle_id: String,
    pub text: String,
}

#[derive(Deserialize)]
pub struct UserIdParams {
    pub user_id: Option<String>,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub gateway: Arc<dyn LlmClient>,
    pub audit_queue: AuditQueue,
    pub rate_limiter: RateLimiter,
    pub rules_text: Arc<String>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(
    db: Arc<Database>,
    gateway: Arc<dyn LlmClient>,
    audit_queue: AuditQueue,
    rate_limiter: RateLimiter,
    rules_text: Arc<String>,
) -> Router {
    let state = AppState {
        db,
        gateway,
        audit_queue,
        rate_limiter,
        rules_text,
    };

    Router::new()
        // Users
        .route("/api/users/{id}", get(get_user))
        .route("/api/users", put(update_user))
        // Battles
        .route("/api/battles", get(list_battles).post(create_battle))
        .route("/api/battles/{id}", get(get_battle).put(update_battle))
        // Interactions
        .route("/api/interactions", get(list_interactions))
        .route("/api/interactions/initial", post(post_initial_interaction))
        .route("/api/interactions/text", post(post_text_interaction))
        // Metrics
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

/// Record request counts per method/endpoint/status.
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::normalize_path(req.uri().path());
    let response = next.run(req).await;
    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[&method, &endpoint, response.status().as_str()])
        .inc();
    response
}

fn require_uuid(value: &str, field: &str) -> Result<(), AppError> {
    Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| AppError::Validation(format!("Invalid {field} format")))
}

// ── User handlers ─────────────────────────────────────────────────────

async fn get_user(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    require_uuid(&id, "user_id")?;
    let user = state.db.get_user(&id).await?.ok_or(AppError::NotFound("user"))?;
    Ok(Json(json!(UserPublic::from_user(user))).into_response())
}

async fn update_user(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Response, AppError> {
    if req.name.is_none() && req.email.is_none() && req.profile_picture.is_none() {
        return Err(AppError::Validation("No fields to update".into()));
    }

    let updated = state
        .db
        .update_user(
            &claims.user_id,
            req.name.as_deref(),
            req.email.as_deref(),
            req.profile_picture.as_deref(),
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict("Username or email already taken".into())
            } else {
                AppError::from(e)
            }
        })?
        .ok_or(AppError::NotFound("user"))?;

    Ok(Json(json!(UserPublic::from_user(updated))).into_response())
}

// ── Battle handlers ───────────────────────────────────────────────────

async fn create_battle(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Json(req): Json<CreateBattleRequest>,
) -> Result<Response, AppError> {
    if req.battle_name.is_empty() {
        return Err(AppError::Validation("Missing 'battleName' in request body".into()));
    }
    if req.play_area.width <= 0 || req.play_area.height <= 0 {
        return Err(AppError::Validation("playArea dimensions must be positive".into()));
    }

    state
        .db
        .get_user(&claims.user_id)
        .await?
        .ok_or(AppError::NotFound("user"))?;

    state
        .rate_limiter
        .check_limit(&claims.user_id, RateLimitType::BattleCreates)?;

    let player_army = normalize_army(req.player_army).to_string();
    let opponent_army = req.opponent_army.map(|a| normalize_army(a).to_string());

    let battle = state
        .db
        .create_battle(
            &claims.user_id,
            &req.battle_name,
            req.play_area.width,
            req.play_area.height,
            &player_army,
            opponent_army.as_deref(),
        )
        .await?;

    let view = BattleState::from_row(battle)?.view();
    tracing::info!("Battle {} created for user {}", view.id, view.user_id);
    Ok((StatusCode::CREATED, Json(json!(view))).into_response())
}

async fn list_battles(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(params): Query<UserIdParams>,
) -> Result<Response, AppError> {
    let user_id = params
        .user_id
        .ok_or_else(|| AppError::Validation("Missing user_id parameter".into()))?;
    require_uuid(&user_id, "user_id")?;

    let battles = state.db.list_battles_for_user(&user_id).await?;
    let views = battles
        .into_iter()
        .map(|b| BattleState::from_row(b).map(|s| s.view()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(json!(views)).into_response())
}

async fn get_battle(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    require_uuid(&id, "battle_id")?;
    let battle = BattleState::load(&state.db, &id).await?;
    Ok(Json(json!(battle.view())).into_response())
}

async fn update_battle(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateBattleRequest>,
) -> Result<Response, AppError> {
    require_uuid(&id, "battle_id")?;

    let battle = state
        .db
        .get_battle(&id)
        .await?
        .ok_or(AppError::NotFound("battle"))?;
    if battle.user_id != claims.user_id {
        return Err(AppError::NotFound("battle"));
    }

    let update = BattleFieldUpdate {
        battle_round: req.battle_round,
        army_turn: req.army_turn,
        player_score: req.player_score,
        opponent_score: req.opponent_score,
        archived: req.archived,
    };
    let updated = state
        .db
        .update_battle_fields(&id, &update)
        .await?
        .ok_or(AppError::NotFound("battle"))?;

    Ok(Json(json!(BattleState::from_row(updated)?.view())).into_response())
}

// ── Interaction handlers ──────────────────────────────────────────────

async fn list_interactions(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(params): Query<UserIdParams>,
) -> Result<Response, AppError> {
    let user_id = params
        .user_id
        .ok_or_else(|| AppError::Validation("Missing user_id parameter".into()))?;
    require_uuid(&user_id, "user_id")?;

    let rows = state.db.list_interactions_for_user(&user_id).await?;
    let views: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            let context: Option<Value> = row
                .context
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok());
            json!({
                "interaction_id": row.id,
                "user_id": row.user_id,
                "battle_id": row.battle_id,
                "type": row.kind,
                "user_input": row.user_input,
                "llm_output": row.llm_output,
                "context": context,
                "timestamp": row.created_at,
            })
        })
        .collect();
    Ok(Json(json!(views)).into_response())
}

async fn post_initial_interaction(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(req): Json<InitialInteractionRequest>,
) -> Result<Response, AppError> {
    require_uuid(&req.user_id, "user_id")?;

    state
        .db
        .get_user(&req.user_id)
        .await?
        .ok_or(AppError::NotFound("user"))?;

    let entry = AuditEntry::for_initial(&req.user_id, req.initial_context);
    let interaction_id = entry.interaction_id.clone();
    state.audit_queue.enqueue(entry);

    Ok(Json(json!({
        "message": "Initial interaction processed successfully",
        "interaction_id": interaction_id,
    }))
    .into_response())
}

/// The turn-submission endpoint: the sole consumer of the battle state
/// manager and the gateway together. Any failure before the paired append
/// leaves the battle row untouched.
async fn post_text_interaction(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(req): Json<TurnRequest>,
) -> Result<Response, AppError> {
    if req.text.is_empty() {
        return Err(AppError::Validation(
            "Missing 'user_id' or 'text' in request body".into(),
        ));
    }
    require_uuid(&req.user_id, "user_id")?;
    require_uuid(&req.battle_id, "battle_id")?;

    state
        .db
        .get_user(&req.user_id)
        .await?
        .ok_or(AppError::NotFound("user"))?;

    let mut battle = BattleState::load(&state.db, &req.battle_id).await?;
    if battle.owner_id() != req.user_id {
        return Err(AppError::NotFound("battle"));
    }

    state
        .rate_limiter
        .check_limit(&req.user_id, RateLimitType::TurnSubmissions)?;

    let (player_army, opponent_army) = battle.armies();
    let history = battle.formatted_history();
    let prompt = build_prompt(&state.rules_text, player_army, opponent_army, &history);

    let started = std::time::Instant::now();
    let llm_response = state.gateway.generate(&prompt, &req.text).await?;
    metrics::GATEWAY_REQUEST_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

    battle.append_turn(&state.db, &req.text, &llm_response).await?;
    metrics::TURNS_TOTAL.inc();

    let entry = AuditEntry::for_turn(&req.user_id, battle.id(), &req.text, &llm_response);
    let interaction_id = entry.interaction_id.clone();
    state.audit_queue.enqueue(entry);

    tracing::info!(
        "Turn committed for battle {} (log length {})",
        req.battle_id,
        battle.log().len()
    );

    Ok(Json(json!({
        "message": "Text interaction processed successfully",
        "llm_response": llm_response,
        "interaction_id": interaction_id,
    }))
    .into_response())
}

// ── Metrics handler ───────────────────────────────────────────────────

async fn get_metrics() -> String {
    metrics::gather_metrics()
}
