//! Loyalty program REST API endpoints.

use crate::rest::{ApiError, ErrorResponse};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storefront_core::error::LoyaltyResult;
use storefront_core::loyalty::*;
use storefront_loyalty::LoyaltyEngine;
use tracing::error;
use utoipa::{IntoParams, ToSchema};

const DEFAULT_LEADERBOARD_LIMIT: usize = 10;

/// Shared state for loyalty endpoints.
#[derive(Clone)]
pub struct LoyaltyState {
    pub engine: Arc<LoyaltyEngine>,
    pub leaderboard_max: usize,
}

/// Engine calls take account locks and may fsync the journal, so they run
/// on the blocking pool.
async fn run_blocking<T, F>(engine: &Arc<LoyaltyEngine>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&LoyaltyEngine) -> LoyaltyResult<T> + Send + 'static,
    T: Send + 'static,
{
    let engine = engine.clone();
    let joined = tokio::task::spawn_blocking(move || f(&engine)).await;
    match joined {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            error!(error = %e, "Loyalty engine task failed");
            metrics::counter!("api.errors").increment(1);
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal processing error",
            ))
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LeaderboardQuery {
    /// Number of entries, capped by the server.
    pub limit: Option<usize>,
    /// Only members of this tier (case-insensitive).
    pub tier: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConsumeResponse {
    pub code: String,
    pub consumed: bool,
}

/// GET /v1/loyalty/program — Active program configuration.
#[utoipa::path(
    get,
    path = "/v1/loyalty/program",
    tag = "Loyalty",
    responses((status = 200, description = "Tier ladder, bonuses and conversion rates", body = ProgramConfiguration))
)]
pub async fn handle_program(State(state): State<LoyaltyState>) -> Json<ProgramConfiguration> {
    Json(state.engine.program().config().clone())
}

/// GET /v1/loyalty/accounts/:user_id — Account summary, opening the account
/// on first contact.
#[utoipa::path(
    get,
    path = "/v1/loyalty/accounts/{user_id}",
    tag = "Loyalty",
    params(("user_id" = String, Path, description = "Storefront user id")),
    responses(
        (status = 200, description = "Account, tier and progress", body = AccountSummary),
        (status = 500, description = "Persistence failure", body = ErrorResponse),
    )
)]
pub async fn handle_account(
    State(state): State<LoyaltyState>,
    Path(user_id): Path<String>,
) -> Result<Json<AccountSummary>, ApiError> {
    let summary = run_blocking(&state.engine, move |engine| engine.summary(&user_id)).await?;
    Ok(Json(summary))
}

/// DELETE /v1/loyalty/accounts/:user_id — Soft-deactivate an account.
#[utoipa::path(
    delete,
    path = "/v1/loyalty/accounts/{user_id}",
    tag = "Loyalty",
    params(("user_id" = String, Path, description = "Storefront user id")),
    responses(
        (status = 200, description = "Account deactivated", body = LoyaltyAccount),
        (status = 404, description = "Unknown account", body = ErrorResponse),
    )
)]
pub async fn handle_deactivate(
    State(state): State<LoyaltyState>,
    Path(user_id): Path<String>,
) -> Result<Json<LoyaltyAccount>, ApiError> {
    let account = run_blocking(&state.engine, move |engine| engine.deactivate(&user_id)).await?;
    Ok(Json(account))
}

/// GET /v1/loyalty/accounts/:user_id/transactions — Ledger history, newest
/// first.
#[utoipa::path(
    get,
    path = "/v1/loyalty/accounts/{user_id}/transactions",
    tag = "Loyalty",
    params(("user_id" = String, Path, description = "Storefront user id"), HistoryFilter),
    responses(
        (status = 200, description = "One page of ledger entries", body = EntryPage),
        (status = 404, description = "Unknown account", body = ErrorResponse),
    )
)]
pub async fn handle_transactions(
    State(state): State<LoyaltyState>,
    Path(user_id): Path<String>,
    Query(filter): Query<HistoryFilter>,
) -> Result<Json<EntryPage>, ApiError> {
    let page = run_blocking(&state.engine, move |engine| {
        engine.entries_for(&user_id, &filter)
    })
    .await?;
    Ok(Json(page))
}

/// POST /v1/loyalty/accounts/:user_id/redeem — Spend points for a reward.
#[utoipa::path(
    post,
    path = "/v1/loyalty/accounts/{user_id}/redeem",
    tag = "Loyalty",
    params(("user_id" = String, Path, description = "Storefront user id")),
    request_body = RedeemRequest,
    responses(
        (status = 201, description = "Reward issued", body = RewardToken),
        (status = 404, description = "Unknown account", body = ErrorResponse),
        (status = 409, description = "Insufficient balance or inactive account", body = ErrorResponse),
        (status = 422, description = "Below minimum or not convertible", body = ErrorResponse),
    )
)]
pub async fn handle_redeem(
    State(state): State<LoyaltyState>,
    Path(user_id): Path<String>,
    Json(request): Json<RedeemRequest>,
) -> Result<(StatusCode, Json<RewardToken>), ApiError> {
    let token = run_blocking(&state.engine, move |engine| {
        engine.redeem_for_user(&user_id, request)
    })
    .await?;
    metrics::counter!("loyalty.api.redemptions").increment(1);
    Ok((StatusCode::CREATED, Json(token)))
}

/// POST /v1/loyalty/rewards/:code/consume — Use a reward token at checkout.
#[utoipa::path(
    post,
    path = "/v1/loyalty/rewards/{code}/consume",
    tag = "Loyalty",
    params(("code" = String, Path, description = "Reward code")),
    responses(
        (status = 200, description = "Token consumed", body = ConsumeResponse),
        (status = 404, description = "Unknown reward code", body = ErrorResponse),
        (status = 409, description = "Already used or expired", body = ErrorResponse),
    )
)]
pub async fn handle_consume(
    State(state): State<LoyaltyState>,
    Path(code): Path<String>,
) -> Result<Json<ConsumeResponse>, ApiError> {
    let lookup = code.clone();
    // None: unknown code. Some(false): already used or expired.
    let consumed = run_blocking(&state.engine, move |engine| match engine.reward(&lookup) {
        None => Ok(None),
        Some(_) => engine.consume_reward(&lookup).map(Some),
    })
    .await?;

    let Some(consumed) = consumed else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "reward_not_found",
            format!("no reward with code {code}"),
        ));
    };
    if !consumed {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "reward_unavailable",
            format!("reward {code} was already used or has expired"),
        ));
    }
    Ok(Json(ConsumeResponse {
        code,
        consumed: true,
    }))
}

/// GET /v1/loyalty/leaderboard — Top members by current points.
#[utoipa::path(
    get,
    path = "/v1/loyalty/leaderboard",
    tag = "Loyalty",
    params(LeaderboardQuery),
    responses((status = 200, description = "Ranked members", body = [LeaderboardEntry]))
)]
pub async fn handle_leaderboard(
    State(state): State<LoyaltyState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Vec<LeaderboardEntry>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LEADERBOARD_LIMIT)
        .min(state.leaderboard_max);
    let board = run_blocking(&state.engine, move |engine| {
        Ok(engine.leaderboard(limit, query.tier.as_deref()))
    })
    .await?;
    Ok(Json(board))
}

/// POST /v1/loyalty/events/order-completed
#[utoipa::path(
    post,
    path = "/v1/loyalty/events/order-completed",
    tag = "Loyalty Events",
    request_body = OrderCompletedEvent,
    responses(
        (status = 200, description = "Applied, duplicate, or skipped", body = AccrualOutcome),
        (status = 409, description = "Inactive account", body = ErrorResponse),
    )
)]
pub async fn handle_order_completed(
    State(state): State<LoyaltyState>,
    Json(event): Json<OrderCompletedEvent>,
) -> Result<Json<AccrualOutcome>, ApiError> {
    let outcome = run_blocking(&state.engine, move |engine| {
        engine.on_order_completed(&event.user_id, &event.order_id, event.order_total_cents)
    })
    .await?;
    Ok(Json(outcome))
}

/// POST /v1/loyalty/events/review-approved
#[utoipa::path(
    post,
    path = "/v1/loyalty/events/review-approved",
    tag = "Loyalty Events",
    request_body = ReviewApprovedEvent,
    responses((status = 200, description = "Applied, duplicate, or skipped", body = AccrualOutcome))
)]
pub async fn handle_review_approved(
    State(state): State<LoyaltyState>,
    Json(event): Json<ReviewApprovedEvent>,
) -> Result<Json<AccrualOutcome>, ApiError> {
    let outcome = run_blocking(&state.engine, move |engine| {
        engine.on_review_approved(&event.user_id, &event.review_id)
    })
    .await?;
    Ok(Json(outcome))
}

/// POST /v1/loyalty/events/referral-confirmed
#[utoipa::path(
    post,
    path = "/v1/loyalty/events/referral-confirmed",
    tag = "Loyalty Events",
    request_body = ReferralConfirmedEvent,
    responses(
        (status = 200, description = "Applied, duplicate, or skipped", body = AccrualOutcome),
        (status = 400, description = "Self-referral", body = ErrorResponse),
    )
)]
pub async fn handle_referral_confirmed(
    State(state): State<LoyaltyState>,
    Json(event): Json<ReferralConfirmedEvent>,
) -> Result<Json<AccrualOutcome>, ApiError> {
    let outcome = run_blocking(&state.engine, move |engine| {
        engine.on_referral_confirmed(&event.referrer_id, &event.referred_user_id)
    })
    .await?;
    Ok(Json(outcome))
}

/// POST /v1/loyalty/events/birthday
#[utoipa::path(
    post,
    path = "/v1/loyalty/events/birthday",
    tag = "Loyalty Events",
    request_body = BirthdayEvent,
    responses(
        (status = 200, description = "Applied, duplicate, or skipped", body = AccrualOutcome),
        (status = 400, description = "Date after today", body = ErrorResponse),
    )
)]
pub async fn handle_birthday(
    State(state): State<LoyaltyState>,
    Json(event): Json<BirthdayEvent>,
) -> Result<Json<AccrualOutcome>, ApiError> {
    let date = event.date.unwrap_or_else(|| Utc::now().date_naive());
    let outcome = run_blocking(&state.engine, move |engine| {
        engine.on_birthday_on(&event.user_id, date)
    })
    .await?;
    Ok(Json(outcome))
}
